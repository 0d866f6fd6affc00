//! Container operations, including the launcher lifecycle coupling.

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::container::Container;
use crate::cri::{
    AttachRequest, ContainerConfig, ContainerFilter, ContainerState, ContainerStatus,
    ExecRequest, ExecSyncResult,
};
use crate::error::{Error, Result};
use crate::oci::{translate, TranslationInput};
use crate::pod::Pod;
use crate::request_log;
use crate::runtime::Runtime;
use crate::streaming::{self, TerminalSize};

/// Exit code stamped when a container had to be killed: 128 + SIGKILL.
const SIGKILL_EXIT_CODE: i32 = 137;

/// How often the instance file is re-read while waiting for an exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

impl Runtime {
    /// Create a container in a ready pod: translate the OCI spec, prepare
    /// the bundle, spawn the launcher, and wait for its created byte.
    pub async fn create_container(
        &self,
        pod_id: &str,
        config: ContainerConfig,
    ) -> Result<String> {
        let result = self.create_container_inner(pod_id, &config).await;
        request_log!("CreateContainer", &config, result);
        result
    }

    async fn create_container_inner(
        &self,
        pod_id: &str,
        config: &ContainerConfig,
    ) -> Result<String> {
        validate_container_config(config)?;

        // Lock order: image lookups precede the pod lock, the container
        // entry is created under both.
        let image = self.images.find(&config.image)?;
        let pod_arc = self.pod(pod_id)?;
        let mut pod = pod_arc.lock().await;
        if pod.state() != crate::cri::PodState::Ready {
            return Err(Error::PreconditionFailed(format!(
                "pod {} is not ready",
                pod.id()
            )));
        }

        let container_id =
            Container::id_of(pod.id(), &config.metadata.name, config.metadata.attempt);
        if self.containers.get(&container_id).is_ok() {
            return Err(Error::AlreadyExists(format!("container {container_id}")));
        }

        let bundle_dir = pod.bundle_dir(&container_id);
        std::fs::create_dir_all(bundle_dir.join("rootfs"))?;
        let log_path = container_log_path(&pod, config)?;

        let container = Container::new(
            pod.id(),
            image.id(),
            config.clone(),
            bundle_dir.clone(),
            log_path,
        );
        // Registered before any slow work so a crash mid-create still
        // leaves an entry the kubelet can remove.
        self.containers
            .add(&container_id, AsyncMutex::new(container))?;
        pod.add_container(&container_id);

        let created = self
            .create_with_launcher(&pod, &container_id, &image, config, &bundle_dir)
            .await;
        match created {
            Ok(handle) => {
                let container_arc = self.containers.get(&container_id)?;
                let mut container = container_arc.lock().await;
                container.set_launcher(handle);
                self.images.borrow(image.id(), &container_id)?;
                Ok(container_id)
            }
            Err(e) => {
                pod.remove_container(&container_id);
                let _ = self.containers.delete(&container_id);
                let _ = std::fs::remove_dir_all(&bundle_dir);
                Err(e)
            }
        }
    }

    async fn create_with_launcher(
        &self,
        pod: &Pod,
        container_id: &str,
        image: &crate::image::ImageInfo,
        config: &ContainerConfig,
        bundle_dir: &PathBuf,
    ) -> Result<crate::launcher::LauncherHandle> {
        let spec = translate(&TranslationInput {
            container: config,
            container_id,
            pod,
            image,
            bundle_dir,
        })?;
        let spec_json = serde_json::to_vec_pretty(&spec)?;
        std::fs::write(bundle_dir.join("config.json"), &spec_json)?;

        self.launcher
            .create(container_id, bundle_dir, spec_json)
            .await
    }

    /// Release a created container to run its entrypoint.
    pub async fn start_container(&self, id: &str) -> Result<()> {
        let result = self.start_container_inner(id).await;
        request_log!("StartContainer", id, result);
        result
    }

    async fn start_container_inner(&self, id: &str) -> Result<()> {
        let container_arc = self.container(id)?;
        let mut container = container_arc.lock().await;
        if container.state() != ContainerState::Created {
            return Err(Error::PreconditionFailed(format!(
                "container {} is {:?}, not created",
                container.id(),
                container.state()
            )));
        }
        container
            .launcher_mut()
            .ok_or_else(|| {
                Error::PreconditionFailed(format!("container {id} has no launcher"))
            })?
            .release()
            .await?;
        container.mark_started()
    }

    /// Stop a container: SIGTERM, a bounded wait, then SIGKILL. Idempotent
    /// once exited; the state is restamped on every return path.
    pub async fn stop_container(&self, id: &str, timeout_seconds: i64) -> Result<()> {
        let result = self.stop_container_inner(id, timeout_seconds).await;
        request_log!("StopContainer", id, result);
        result
    }

    pub(crate) async fn stop_container_for_sandbox(
        &self,
        id: &str,
        timeout_seconds: i64,
    ) -> Result<()> {
        self.stop_container_inner(id, timeout_seconds).await
    }

    async fn stop_container_inner(&self, id: &str, timeout_seconds: i64) -> Result<()> {
        let container_arc = self.container(id)?;
        let mut container = container_arc.lock().await;
        if container.state() == ContainerState::Exited {
            return Ok(());
        }

        // The instance file is authoritative: the container may have
        // finished on its own while we weren't looking.
        let info = match self.launcher.read_instance_info(container.id()) {
            Ok(info) => info,
            Err(e) => {
                container.mark_unknown(e.to_string());
                return Err(e);
            }
        };
        let Some(info) = info else {
            // Never reached the running stage: kill the launcher itself.
            if let Some(handle) = container.launcher_mut() {
                handle.kill_and_wait().await;
            }
            return container.mark_exited(SIGKILL_EXIT_CODE, "killed before start");
        };
        if info.finished_at > 0 {
            container.apply_instance_info(&info);
            return Ok(());
        }

        crate::launcher::signal_instance(info.pid, Signal::SIGTERM)?;
        let deadline = Duration::from_secs(timeout_seconds.max(0) as u64);
        let graceful = self.wait_for_exit(container.id(), deadline).await?;
        if let Some(final_info) = graceful {
            container.apply_instance_info(&final_info);
            return Ok(());
        }

        crate::launcher::signal_instance(info.pid, Signal::SIGKILL)?;
        match self.wait_for_exit(container.id(), STOP_POLL_INTERVAL * 5).await? {
            Some(final_info) => {
                container.apply_instance_info(&final_info);
                if container.state() != ContainerState::Exited {
                    container.mark_exited(SIGKILL_EXIT_CODE, "killed")?;
                }
            }
            None => container.mark_exited(SIGKILL_EXIT_CODE, "killed")?,
        }
        Ok(())
    }

    /// Poll the instance file until it reports an exit, or give up.
    async fn wait_for_exit(
        &self,
        container_id: &str,
        deadline: Duration,
    ) -> Result<Option<crate::launcher::InstanceInfo>> {
        let start = std::time::Instant::now();
        loop {
            if let Some(info) = self.launcher.read_instance_info(container_id)? {
                if info.finished_at > 0 {
                    return Ok(Some(info));
                }
            } else {
                // File gone: the launcher exited and cleaned up behind us.
                return Ok(None);
            }
            if start.elapsed() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// Remove a container, forcibly stopping it first. Idempotent.
    pub async fn remove_container(&self, id: &str) -> Result<()> {
        let result = self.remove_container_inner(id).await;
        request_log!("RemoveContainer", id, result);
        result
    }

    async fn remove_container_inner(&self, id: &str) -> Result<()> {
        let container_arc = match self.container(id) {
            Ok(container_arc) => container_arc,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        // Take the pod lock first; the pod id needs a short container
        // borrow to discover.
        let pod_id = container_arc.lock().await.pod_id().to_string();
        match self.pod(&pod_id) {
            Ok(pod_arc) => {
                let mut pod = pod_arc.lock().await;
                self.remove_container_for_sandbox(id, &mut pod).await
            }
            // Pod already gone: just tear the container down.
            Err(_) => self.teardown_container(id).await.map(|_| ()),
        }
    }

    pub(crate) async fn remove_container_for_sandbox(
        &self,
        id: &str,
        pod: &mut Pod,
    ) -> Result<()> {
        // The pod's membership list holds full ids; the caller may have
        // passed a prefix.
        if let Some(full_id) = self.teardown_container(id).await? {
            pod.remove_container(&full_id);
        }
        Ok(())
    }

    /// Tear one container down and return its resolved full id, or `None`
    /// when it was already gone.
    async fn teardown_container(&self, id: &str) -> Result<Option<String>> {
        let container_arc = match self.container(id) {
            Ok(container_arc) => container_arc,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut container = container_arc.lock().await;

        if let Some(mut handle) = container.take_launcher() {
            handle.kill_and_wait().await;
        }
        self.launcher.clean_instance(container.id())?;
        if let Err(e) = self.images.give_back(container.image_id(), container.id()) {
            if !e.is_not_found() {
                return Err(e);
            }
        }

        self.dispose(container.bundle_dir(), container.id(), "config")?;
        if let Some(log_path) = container.log_path().cloned() {
            self.dispose(&log_path, container.id(), "log")?;
        }

        let container_id = container.id().to_string();
        drop(container);
        self.containers.delete(&container_id)?;
        Ok(Some(container_id))
    }

    /// Remove a path, or move it into the trash directory when configured.
    fn dispose(&self, path: &PathBuf, container_id: &str, kind: &str) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        if let Some(trash_dir) = &self.config.trash_dir {
            let target = trash_dir.join(format!("{container_id}-{kind}"));
            std::fs::create_dir_all(trash_dir)?;
            if std::fs::rename(path, &target).is_ok() {
                return Ok(());
            }
            // Cross-device or contended: fall through to plain removal.
        }
        if path.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Probe the launcher and report the container's status.
    pub async fn container_status(&self, id: &str) -> Result<ContainerStatus> {
        let result = self.container_status_inner(id).await;
        request_log!("ContainerStatus", id, result);
        result
    }

    async fn container_status_inner(&self, id: &str) -> Result<ContainerStatus> {
        let container_arc = self.container(id)?;
        let mut container = container_arc.lock().await;
        match self.launcher.read_instance_info(container.id()) {
            Ok(Some(info)) => container.apply_instance_info(&info),
            Ok(None) => {}
            Err(e) => container.mark_unknown(e.to_string()),
        }
        Ok(container.status())
    }

    /// A point-in-time, unordered listing of matching containers.
    pub async fn list_containers(
        &self,
        filter: Option<&ContainerFilter>,
    ) -> Vec<ContainerStatus> {
        let mut container_arcs = Vec::with_capacity(self.containers.len());
        self.containers
            .iterate(|_, container_arc| container_arcs.push(container_arc.clone()));

        let mut items = Vec::with_capacity(container_arcs.len());
        for container_arc in container_arcs {
            let container = container_arc.lock().await;
            if filter.map_or(true, |filter| container.matches(filter)) {
                items.push(container.status());
            }
        }
        items
    }

    /// Ask a running launcher to reopen its log file.
    pub async fn reopen_container_log(&self, id: &str) -> Result<()> {
        let result = self.reopen_container_log_inner(id).await;
        request_log!("ReopenContainerLog", id, result);
        result
    }

    async fn reopen_container_log_inner(&self, id: &str) -> Result<()> {
        let container_arc = self.container(id)?;
        let container = container_arc.lock().await;
        if container.state() != ContainerState::Running {
            return Err(Error::PreconditionFailed(format!(
                "container {} is not running",
                container.id()
            )));
        }
        let info = self
            .launcher
            .read_instance_info(container.id())?
            .ok_or_else(|| Error::not_found(format!("instance of {}", container.id())))?;
        self.launcher.reopen_log(&info).await
    }

    /// Run a command in a running container with a deadline, no TTY.
    pub async fn exec_sync(
        &self,
        id: &str,
        cmd: &[String],
        timeout_seconds: i64,
    ) -> Result<ExecSyncResult> {
        let container_arc = self.container(id)?;
        let container = container_arc.lock().await;
        if container.state() != ContainerState::Running {
            return Err(Error::PreconditionFailed(format!(
                "container {} is not running",
                container.id()
            )));
        }
        let instance_id = container.id().to_string();
        drop(container);

        self.launcher
            .exec_sync(
                &instance_id,
                cmd,
                Duration::from_secs(timeout_seconds.max(0) as u64),
            )
            .await
    }

    /// Prepare an exec streaming session and return its URL.
    pub async fn exec(&self, mut request: ExecRequest) -> Result<String> {
        let container_arc = self.container(&request.container_id)?;
        let container = container_arc.lock().await;
        if container.state() != ContainerState::Running {
            return Err(Error::PreconditionFailed(format!(
                "container {} is not running",
                container.id()
            )));
        }
        // Canonicalize so the claimed session targets the full id.
        request.container_id = container.id().to_string();
        drop(container);
        let result = self.streaming().prepare_exec(request.clone());
        request_log!("Exec", &request, result);
        result
    }

    /// Prepare an attach streaming session and return its URL.
    pub async fn attach(&self, mut request: AttachRequest) -> Result<String> {
        let container_arc = self.container(&request.container_id)?;
        let container = container_arc.lock().await;
        if container.state() != ContainerState::Running {
            return Err(Error::PreconditionFailed(format!(
                "container {} is not running",
                container.id()
            )));
        }
        request.container_id = container.id().to_string();
        drop(container);
        let result = self.streaming().prepare_attach(request.clone());
        request_log!("Attach", &request, result);
        result
    }

    /// Service a claimed exec session against the launcher.
    pub async fn serve_exec<'a>(
        &self,
        request: &ExecRequest,
        stdin: Option<Box<dyn AsyncRead + Send + Unpin + 'a>>,
        stdout: Option<Box<dyn AsyncWrite + Send + Unpin + 'a>>,
        stderr: Option<Box<dyn AsyncWrite + Send + Unpin + 'a>>,
        resize: mpsc::Receiver<TerminalSize>,
    ) -> Result<i32> {
        let command = self
            .launcher
            .exec_command(&request.container_id, &request.cmd);
        if request.tty {
            streaming::exec_with_tty(command, stdin, stdout, resize).await
        } else {
            streaming::exec_with_streams(command, stdin, stdout, stderr).await
        }
    }

    /// Service a claimed attach session against the launcher's sockets.
    pub async fn serve_attach<'a>(
        &self,
        request: &AttachRequest,
        stdin: Option<Box<dyn AsyncRead + Send + Unpin + 'a>>,
        stdout: Option<Box<dyn AsyncWrite + Send + Unpin + 'a>>,
        resize: mpsc::Receiver<TerminalSize>,
    ) -> Result<()> {
        let info = self
            .launcher
            .read_instance_info(&request.container_id)?
            .ok_or_else(|| {
                Error::not_found(format!("instance of {}", request.container_id))
            })?;
        let control = request.tty.then(|| info.control_socket.clone());
        streaming::attach(&info.attach_socket, control, stdin, stdout, resize).await
    }
}

/// The create-time preconditions checked before any work happens.
fn validate_container_config(config: &ContainerConfig) -> Result<()> {
    let sc = &config.linux.security_context;
    if config.tty && !config.stdin {
        return Err(Error::InvalidConfig(
            "tty requires stdin to be requested".into(),
        ));
    }
    if sc.run_as_user.is_some() && !sc.run_as_username.is_empty() {
        return Err(Error::InvalidConfig(
            "run_as_user and run_as_username are mutually exclusive".into(),
        ));
    }
    if sc.run_as_group.is_some() && sc.run_as_user.is_none() && sc.run_as_username.is_empty() {
        return Err(Error::InvalidConfig(
            "run_as_group requires run_as_user or run_as_username".into(),
        ));
    }
    Ok(())
}

/// Resolve and pre-create the container's log file under the pod's log
/// directory.
fn container_log_path(pod: &Pod, config: &ContainerConfig) -> Result<Option<PathBuf>> {
    let Some(log_dir) = pod.log_directory() else {
        return Ok(None);
    };
    if config.log_path.is_empty() {
        return Ok(None);
    }
    let path = log_dir.join(&config.log_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .append(true)
        .open(&path)?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri::ContainerMetadata;

    fn config() -> ContainerConfig {
        ContainerConfig {
            metadata: ContainerMetadata {
                name: "app".into(),
                attempt: 0,
            },
            image: "busybox".into(),
            ..ContainerConfig::default()
        }
    }

    #[test]
    fn tty_requires_stdin() {
        let mut c = config();
        c.tty = true;
        assert!(matches!(
            validate_container_config(&c),
            Err(Error::InvalidConfig(_))
        ));
        c.stdin = true;
        validate_container_config(&c).unwrap();
    }

    #[test]
    fn run_as_fields_are_mutually_constrained() {
        let mut c = config();
        c.linux.security_context.run_as_user = Some(0);
        c.linux.security_context.run_as_username = "root".into();
        assert!(validate_container_config(&c).is_err());

        let mut c = config();
        c.linux.security_context.run_as_group = Some(5);
        assert!(validate_container_config(&c).is_err());
        c.linux.security_context.run_as_user = Some(5);
        validate_container_config(&c).unwrap();
    }
}
