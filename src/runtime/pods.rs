//! Pod sandbox operations.

use std::path::PathBuf;

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::cri::{
    PodSandboxConfig, PodSandboxFilter, PodSandboxStatus, PodState, PortForwardRequest,
    NamespaceMode,
};
use crate::error::{Error, Result};
use crate::namespace::{self, NsSpec, NsType};
use crate::network::PodNetworkConfig;
use crate::pod::Pod;
use crate::request_log;
use crate::runtime::Runtime;

/// Grace period used when a sandbox stop has to stop its containers.
const SANDBOX_STOP_GRACE_SECONDS: i64 = 10;

impl Runtime {
    /// Create and start a pod sandbox. All-or-nothing: any failure unwinds
    /// the namespaces, the network attachment, and the pod directory.
    pub async fn run_pod_sandbox(&self, config: PodSandboxConfig) -> Result<String> {
        let result = self.run_pod_sandbox_inner(&config).await;
        request_log!("RunPodSandbox", &config, result);
        result
    }

    async fn run_pod_sandbox_inner(&self, config: &PodSandboxConfig) -> Result<String> {
        let id = Pod::id_of(&config.metadata);
        if self.pod(&id).is_ok() {
            return Err(Error::AlreadyExists(format!("pod {id}")));
        }

        let dir = self.config().pod_dir(&id);
        let pod = Pod::new(config.clone(), dir.clone());
        std::fs::create_dir_all(pod.namespaces_dir())?;
        if let Some(log_dir) = pod.log_directory() {
            create_dir_0755(&log_dir)?;
        }
        pod.write_fragments()?;

        match self.bring_up_sandbox(pod).await {
            Ok(pod) => {
                let id = pod.id().to_string();
                // Only a concurrent duplicate create can make this add
                // fail; the winner owns the directory tree.
                self.pods.add(&id, AsyncMutex::new(pod))?;
                Ok(id)
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                Err(e)
            }
        }
    }

    /// Unshare the pod-owned namespaces and attach the network; unwind the
    /// namespaces when the network fails.
    async fn bring_up_sandbox(&self, mut pod: Pod) -> Result<Pod> {
        // Namespace ownership: UTS iff a hostname was requested; network
        // and IPC iff the pod-level mode says the pod owns them.
        let options = pod.config().linux.security_context.namespace_options;
        let mut specs = Vec::new();
        if !pod.config().hostname.is_empty() {
            specs.push(NsSpec {
                ty: NsType::Uts,
                bind: pod.namespaces_dir().join("uts"),
            });
        }
        if options.network == NamespaceMode::Pod {
            specs.push(NsSpec {
                ty: NsType::Net,
                bind: pod.namespaces_dir().join("net"),
            });
        }
        if options.ipc == NamespaceMode::Pod {
            specs.push(NsSpec {
                ty: NsType::Ipc,
                bind: pod.namespaces_dir().join("ipc"),
            });
        }

        let unshare_specs = specs.clone();
        tokio::task::spawn_blocking(move || namespace::unshare_all(&unshare_specs))
            .await
            .map_err(|e| Error::transient(format!("unshare task: {e}")))??;
        pod.set_namespaces(specs);

        if let Some(net_bind) = pod.namespace_bind(NsType::Net).cloned() {
            let network_config = PodNetworkConfig {
                id: pod.id().to_string(),
                namespace: pod.config().metadata.namespace.clone(),
                name: pod.config().metadata.name.clone(),
                ns_path: net_bind,
                port_mappings: pod.config().port_mappings.clone(),
            };
            match self.network.setup(network_config).await {
                Ok(network) => pod.set_network(network),
                Err(e) => {
                    self.unwind_namespaces(&pod);
                    return Err(e);
                }
            }
        }
        Ok(pod)
    }

    fn unwind_namespaces(&self, pod: &Pod) {
        for spec in pod.namespaces() {
            if let Err(e) = namespace::remove(spec) {
                warn!(pod = pod.id(), bind = %spec.bind.display(), error = %e,
                      "namespace unwind failed");
            }
        }
    }

    /// Stop a sandbox: stop its containers, detach the network, flip to
    /// NotReady. Idempotent once NotReady; the directory stays.
    pub async fn stop_pod_sandbox(&self, id: &str) -> Result<()> {
        let result = self.stop_pod_sandbox_inner(id).await;
        request_log!("StopPodSandbox", id, result);
        result
    }

    async fn stop_pod_sandbox_inner(&self, id: &str) -> Result<()> {
        let pod_arc = self.pod(id)?;
        let mut pod = pod_arc.lock().await;
        if pod.state() == PodState::NotReady {
            return Ok(());
        }

        for container_id in pod.containers().to_vec() {
            if let Err(e) = self
                .stop_container_for_sandbox(&container_id, SANDBOX_STOP_GRACE_SECONDS)
                .await
            {
                warn!(pod = pod.id(), container = %container_id, error = %e,
                      "container stop during sandbox stop failed");
            }
        }
        if let Some(network) = pod.take_network() {
            self.network.teardown(&network).await?;
        }
        pod.set_not_ready();
        Ok(())
    }

    /// Remove a sandbox from any state. Absent pods are a no-op.
    pub async fn remove_pod_sandbox(&self, id: &str) -> Result<()> {
        let result = self.remove_pod_sandbox_inner(id).await;
        request_log!("RemovePodSandbox", id, result);
        result
    }

    async fn remove_pod_sandbox_inner(&self, id: &str) -> Result<()> {
        let pod_arc = match self.pod(id) {
            Ok(pod_arc) => pod_arc,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut pod = pod_arc.lock().await;

        for container_id in pod.containers().to_vec() {
            self.remove_container_for_sandbox(&container_id, &mut pod)
                .await?;
        }
        if let Some(network) = pod.take_network() {
            if let Err(e) = self.network.teardown(&network).await {
                warn!(pod = pod.id(), error = %e, "network teardown during removal failed");
            }
        }
        self.unwind_namespaces(&pod);
        remove_tree(pod.dir());
        if let Some(log_dir) = pod.log_directory() {
            remove_tree(&log_dir);
        }

        let id = pod.id().to_string();
        drop(pod);
        self.pods.delete(&id)?;
        Ok(())
    }

    /// Snapshot one sandbox, including its IP while it is ready.
    pub async fn pod_sandbox_status(&self, id: &str) -> Result<PodSandboxStatus> {
        let result = self.pod_sandbox_status_inner(id).await;
        request_log!("PodSandboxStatus", id, result);
        result
    }

    async fn pod_sandbox_status_inner(&self, id: &str) -> Result<PodSandboxStatus> {
        let pod_arc = self.pod(id)?;
        let pod = pod_arc.lock().await;
        Ok(self.snapshot(&pod))
    }

    fn snapshot(&self, pod: &Pod) -> PodSandboxStatus {
        let ip = if pod.state() == PodState::Ready {
            pod.network()
                .and_then(|network| self.network.get_ip(network).ok())
                .map(|ip| ip.to_string())
        } else {
            None
        };
        PodSandboxStatus {
            id: pod.id().to_string(),
            metadata: pod.config().metadata.clone(),
            state: pod.state(),
            created_at: pod.created_at(),
            ip,
            namespace_options: pod.config().linux.security_context.namespace_options,
            labels: pod.config().labels.clone(),
            annotations: pod.config().annotations.clone(),
        }
    }

    /// A point-in-time, unordered listing of matching sandboxes.
    pub async fn list_pod_sandbox(
        &self,
        filter: Option<&PodSandboxFilter>,
    ) -> Vec<PodSandboxStatus> {
        let mut pod_arcs = Vec::with_capacity(self.pods.len());
        self.pods.iterate(|_, pod_arc| pod_arcs.push(pod_arc.clone()));

        let mut items = Vec::with_capacity(pod_arcs.len());
        for pod_arc in pod_arcs {
            let pod = pod_arc.lock().await;
            if filter.map_or(true, |filter| pod.matches(filter)) {
                items.push(self.snapshot(&pod));
            }
        }
        items
    }

    /// Prepare a port-forward session; only the pod's existence matters
    /// before handing out the URL.
    pub fn port_forward(&self, request: PortForwardRequest) -> Result<String> {
        self.pod(&request.pod_sandbox_id)?;
        let result = self.streaming().prepare_port_forward(request.clone());
        request_log!("PortForward", &request, result);
        result
    }
}

fn create_dir_0755(dir: &PathBuf) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match std::fs::DirBuilder::new().recursive(true).mode(0o755).create(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn remove_tree(dir: &PathBuf) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "directory removal failed");
        }
    }
}
