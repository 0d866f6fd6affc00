//! Runtime configuration.
//!
//! Parsing (flags, files) happens in the server binary; the core only sees
//! this resolved struct, passed in at construction. There are no
//! process-wide singletons: everything that used to be ambient (logger
//! verbosity, directory roots, plugin paths) lives here and travels with the
//! [`Runtime`](crate::runtime::Runtime) that owns it.

use std::path::PathBuf;

/// Resolved runtime options, one field per recognized configuration key.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the local stream socket the two CRI services listen on.
    pub listen_socket: PathBuf,

    /// Root of the content-addressed image store.
    pub storage_dir: PathBuf,

    /// Root of the per-pod / per-container runtime tree.
    pub base_run_dir: PathBuf,

    /// When set, removed container logs and configs are moved here instead
    /// of being unlinked.
    pub trash_dir: Option<PathBuf>,

    /// Bind address of the HTTP streaming server that backs exec, attach,
    /// and port-forward URLs.
    pub streaming_url: String,

    /// Directory holding CNI plugin binaries.
    pub cni_bin_dir: PathBuf,

    /// Directory holding CNI network configuration lists.
    pub cni_conf_dir: PathBuf,

    /// Launcher binary used to build, verify, and run containers.
    pub runtime_binary: PathBuf,

    /// When true, every request and response is logged; when false, only
    /// errors are.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_socket: PathBuf::from("/var/run/singularity.sock"),
            storage_dir: PathBuf::from("/var/lib/singularity"),
            base_run_dir: PathBuf::from("/var/run/singularity"),
            trash_dir: None,
            streaming_url: String::from("127.0.0.1:12345"),
            cni_bin_dir: PathBuf::from("/opt/cni/bin"),
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
            runtime_binary: PathBuf::from("singularity"),
            debug: false,
        }
    }
}

impl Config {
    /// Directory holding per-pod state: `<base-run-dir>/pods/<pod-id>`.
    pub fn pod_dir(&self, pod_id: &str) -> PathBuf {
        self.base_run_dir.join("pods").join(pod_id)
    }

    /// Directory holding launcher instance-info files.
    pub fn instances_dir(&self) -> PathBuf {
        self.base_run_dir.join("instances")
    }
}
