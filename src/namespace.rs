//! Linux namespace plumbing for pod sandboxes.
//!
//! A pod's namespaces must outlive any single process in the pod, so they
//! are kept alive as bind mounts: a short-lived placeholder child unshares
//! every requested type in one syscall, the parent bind-mounts the child's
//! `/proc/<pid>/ns/<type>` entries onto files under the pod directory, and
//! the placeholder is then reaped. Containers later join by opening the
//! bind path.
//!
//! Everything here is synchronous and fork-heavy; async callers run it on a
//! blocking worker.

use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, pause, read, ForkResult};
use tracing::warn;

use crate::error::{Error, Result};

/// The namespace types a pod may own. The syscall-flag mapping is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NsType {
    Pid,
    Net,
    Mnt,
    Ipc,
    Uts,
    User,
}

impl NsType {
    /// Flag passed to `unshare(2)`.
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NsType::Pid => CloneFlags::CLONE_NEWPID,
            NsType::Net => CloneFlags::CLONE_NEWNET,
            NsType::Mnt => CloneFlags::CLONE_NEWNS,
            NsType::Ipc => CloneFlags::CLONE_NEWIPC,
            NsType::Uts => CloneFlags::CLONE_NEWUTS,
            NsType::User => CloneFlags::CLONE_NEWUSER,
        }
    }

    /// Entry name under `/proc/<pid>/ns/`.
    pub fn proc_entry(self) -> &'static str {
        match self {
            NsType::Pid => "pid",
            NsType::Net => "net",
            NsType::Mnt => "mnt",
            NsType::Ipc => "ipc",
            NsType::Uts => "uts",
            NsType::User => "user",
        }
    }
}

/// One namespace a pod owns: the type and the bind path that keeps it alive.
#[derive(Debug, Clone)]
pub struct NsSpec {
    pub ty: NsType,
    pub bind: PathBuf,
}

/// Create all requested namespaces in one unshare and bind each one onto
/// its path. On any failure every partial bind is unwound.
pub fn unshare_all(specs: &[NsSpec]) -> Result<()> {
    if specs.is_empty() {
        return Ok(());
    }

    let mut flags = CloneFlags::empty();
    for spec in specs {
        flags |= spec.ty.clone_flag();
        if let Some(parent) = spec.bind.parent() {
            fs::create_dir_all(parent)?;
        }
        // The bind target must exist before mount; an empty file will do.
        fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&spec.bind)?;
    }

    // The placeholder signals readiness over a pipe once unshared.
    let (ready_read, ready_write) = nix::unistd::pipe()?;

    // SAFETY: the child only performs async-signal-safe syscalls (unshare,
    // write, pause, _exit); all allocation happens before the fork.
    let child = match unsafe { fork() }? {
        ForkResult::Child => {
            drop(ready_read);
            let ok = unshare(flags).is_ok();
            let byte: [u8; 1] = [ok as u8];
            let _ = nix::unistd::write(&ready_write, &byte);
            if ok {
                loop {
                    pause();
                }
            }
            unsafe { libc::_exit(1) };
        }
        ForkResult::Parent { child } => child,
    };
    drop(ready_write);

    let mut byte = [0u8; 1];
    let unshared = matches!(read(ready_read.as_raw_fd(), &mut byte), Ok(1)) && byte[0] == 1;
    if !unshared {
        let _ = kill(child, Signal::SIGKILL);
        let _ = waitpid(child, None);
        return Err(Error::transient("namespace placeholder failed to unshare"));
    }

    let mut bound: Vec<&Path> = Vec::with_capacity(specs.len());
    for spec in specs {
        let source = format!("/proc/{}/ns/{}", child.as_raw(), spec.ty.proc_entry());
        if let Err(errno) = mount(
            Some(source.as_str()),
            &spec.bind,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            for path in bound {
                let _ = umount2(path, MntFlags::MNT_DETACH);
                let _ = fs::remove_file(path);
            }
            let _ = fs::remove_file(&spec.bind);
            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
            return Err(errno.into());
        }
        bound.push(&spec.bind);
    }

    // The binds keep the namespaces alive; the placeholder can go.
    let _ = kill(child, Signal::SIGKILL);
    let _ = waitpid(child, None);
    Ok(())
}

/// Release one namespace bind: detach the mount, then unlink the path.
///
/// Tolerates a path that was never mounted (unwind after partial setup) or
/// that is already gone.
pub fn remove(spec: &NsSpec) -> Result<()> {
    match umount2(&spec.bind, MntFlags::MNT_DETACH) {
        Ok(()) => {}
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
            // Not a mount point (or already unlinked): nothing was attached.
        }
        Err(errno) => {
            warn!(bind = %spec.bind.display(), %errno, "namespace unmount failed");
            return Err(errno.into());
        }
    }
    match fs::remove_file(&spec.bind) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Cgroup placement for a container: `<parent>/<container-id>`.
pub fn cgroup_path(parent: &str, container_id: &str) -> String {
    if parent.is_empty() {
        format!("/{container_id}")
    } else {
        format!("{}/{container_id}", parent.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_flags_are_fixed() {
        assert_eq!(NsType::Pid.clone_flag(), CloneFlags::CLONE_NEWPID);
        assert_eq!(NsType::Net.clone_flag(), CloneFlags::CLONE_NEWNET);
        assert_eq!(NsType::Mnt.clone_flag(), CloneFlags::CLONE_NEWNS);
        assert_eq!(NsType::Ipc.clone_flag(), CloneFlags::CLONE_NEWIPC);
        assert_eq!(NsType::Uts.clone_flag(), CloneFlags::CLONE_NEWUTS);
        assert_eq!(NsType::User.clone_flag(), CloneFlags::CLONE_NEWUSER);
    }

    #[test]
    fn remove_tolerates_never_mounted_binds() {
        let dir = tempfile::tempdir().unwrap();
        let bind = dir.path().join("net");
        fs::write(&bind, b"").unwrap();

        let spec = NsSpec {
            ty: NsType::Net,
            bind: bind.clone(),
        };
        remove(&spec).unwrap();
        assert!(!bind.exists());
        // Second remove of the same spec is a no-op.
        remove(&spec).unwrap();
    }

    #[test]
    fn cgroup_paths_append_the_container_id() {
        assert_eq!(cgroup_path("/kubepods/pod1", "c1"), "/kubepods/pod1/c1");
        assert_eq!(cgroup_path("/kubepods/pod1/", "c1"), "/kubepods/pod1/c1");
        assert_eq!(cgroup_path("", "c1"), "/c1");
    }
}
