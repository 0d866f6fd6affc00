//! The runtime facade: both CRI services composed over the subsystems.
//!
//! One `Runtime` instance per node owns every subsystem; there is no other
//! process-wide state. The wire adapter maps each CRI RPC onto exactly one
//! method here and each [`Error`](crate::error::Error) variant onto a status
//! code.
//!
//! Pods and containers live in truncated-ID indexes, so every id argument
//! accepts an unambiguous prefix. Lock order, where more than one lock is
//! needed, is image, then pod, then container; no lock is ever reentered.

mod containers;
mod images;
mod pods;

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::config::Config;
use crate::container::Container;
use crate::cri::VersionInfo;
use crate::error::Result;
use crate::image::store::ImageStore;
use crate::index::TruncIndex;
use crate::launcher::Launcher;
use crate::network::NetworkManager;
use crate::pod::Pod;
use crate::streaming::StreamingServer;

/// CRI version the kubelet negotiates with.
const KUBELET_API_VERSION: &str = "0.1.0";
/// Name of this runtime.
const RUNTIME_NAME: &str = "sycri";
/// CRI API generation supported.
const RUNTIME_API_VERSION: &str = "v1";

/// The one runtime instance behind both CRI services.
#[derive(Debug)]
pub struct Runtime {
    config: Config,
    images: ImageStore,
    network: NetworkManager,
    launcher: Launcher,
    streaming: StreamingServer,
    pods: TruncIndex<AsyncMutex<Pod>>,
    containers: TruncIndex<AsyncMutex<Container>>,
    /// Probed once at construction by spawning `<runtime> version`.
    launcher_version: String,
}

impl Runtime {
    /// Build a runtime from resolved configuration: open the image store,
    /// prime the network manager, and probe the launcher version.
    pub async fn new(config: Config) -> Result<Runtime> {
        std::fs::create_dir_all(&config.base_run_dir)?;
        std::fs::create_dir_all(config.base_run_dir.join("pods"))?;

        let images = ImageStore::open(&config.storage_dir, &config.runtime_binary)?;
        let network = NetworkManager::new(&config.cni_bin_dir, &config.cni_conf_dir);
        let launcher = Launcher::new(&config.runtime_binary, config.instances_dir());
        let launcher_version = launcher.version().await?;
        let streaming = StreamingServer::new(&config.streaming_url);

        Ok(Runtime {
            config,
            images,
            network,
            launcher,
            streaming,
            pods: TruncIndex::new(),
            containers: TruncIndex::new(),
            launcher_version,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The streaming registry, for the HTTP layer to claim sessions from.
    pub fn streaming(&self) -> &StreamingServer {
        &self.streaming
    }

    /// Fixed API version plus the probed launcher version.
    pub fn version(&self) -> VersionInfo {
        VersionInfo {
            version: KUBELET_API_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: self.launcher_version.clone(),
            runtime_api_version: RUNTIME_API_VERSION.to_string(),
        }
    }

    /// Record the pod CIDR from a runtime-config update.
    pub fn update_runtime_config(&self, pod_cidr: &str) {
        self.network.set_pod_cidr(pod_cidr);
    }

    pub(crate) fn pod(&self, id: &str) -> Result<Arc<AsyncMutex<Pod>>> {
        self.pods.get(id)
    }

    pub(crate) fn container(&self, id: &str) -> Result<Arc<AsyncMutex<Container>>> {
        self.containers.get(id)
    }
}
