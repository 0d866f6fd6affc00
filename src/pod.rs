//! The pod sandbox record.
//!
//! A pod is a shared-namespace context: it owns a directory under the run
//! tree, the namespace bind mounts its containers join, the generated
//! `resolv.conf`/`hostname` fragments, and (while ready) a network
//! attachment. Containers are referenced by id only; the container index is
//! the single owner of container records.

use std::collections::HashMap;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::cri::{PodSandboxConfig, PodSandboxFilter, PodSandboxMetadata, PodState};
use crate::error::Result;
use crate::namespace::{NsSpec, NsType};
use crate::network::PodNetwork;

/// One pod sandbox.
#[derive(Debug)]
pub struct Pod {
    id: String,
    config: PodSandboxConfig,
    state: PodState,
    created_at: i64,
    dir: PathBuf,
    /// Namespaces this pod owns, as `(type, bind path)`.
    namespaces: Vec<NsSpec>,
    /// Ids of containers created in this pod, in creation order.
    containers: Vec<String>,
    /// Network attachment handle, present while the pod is attached.
    network: Option<PodNetwork>,
}

impl Pod {
    /// Deterministic pod id over the identifying metadata tuple.
    pub fn id_of(metadata: &PodSandboxMetadata) -> String {
        let mut hasher = Sha256::new();
        hasher.update(metadata.name.as_bytes());
        hasher.update([0]);
        hasher.update(metadata.namespace.as_bytes());
        hasher.update([0]);
        hasher.update(metadata.uid.as_bytes());
        hasher.update([0]);
        hasher.update(metadata.attempt.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    /// A fresh, ready pod rooted at `dir`.
    pub fn new(config: PodSandboxConfig, dir: PathBuf) -> Pod {
        Pod {
            id: Pod::id_of(&config.metadata),
            config,
            state: PodState::Ready,
            created_at: crate::now(),
            dir,
            namespaces: Vec::new(),
            containers: Vec::new(),
            network: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &PodSandboxConfig {
        &self.config
    }

    pub fn state(&self) -> PodState {
        self.state
    }

    /// Flip to the terminal state. There is no way back.
    pub fn set_not_ready(&mut self) {
        self.state = PodState::NotReady;
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn resolv_conf_path(&self) -> PathBuf {
        self.dir.join("resolv.conf")
    }

    pub fn hostname_path(&self) -> PathBuf {
        self.dir.join("hostname")
    }

    pub fn namespaces_dir(&self) -> PathBuf {
        self.dir.join("namespaces")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.dir.join("containers")
    }

    /// Bundle directory of one of this pod's containers.
    pub fn bundle_dir(&self, container_id: &str) -> PathBuf {
        self.containers_dir().join(container_id)
    }

    pub fn log_directory(&self) -> Option<PathBuf> {
        if self.config.log_directory.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.config.log_directory))
        }
    }

    /// Render the DNS fragment: one `nameserver` line per server, a single
    /// `search` line, a single `options` line, each only when populated.
    pub fn resolv_conf_contents(&self) -> Option<String> {
        let dns = self.config.dns_config.as_ref()?;
        let mut contents = String::new();
        for server in &dns.servers {
            contents.push_str(&format!("nameserver {server}\n"));
        }
        if !dns.searches.is_empty() {
            contents.push_str(&format!("search {}\n", dns.searches.join(" ")));
        }
        if !dns.options.is_empty() {
            contents.push_str(&format!("options {}\n", dns.options.join(" ")));
        }
        Some(contents)
    }

    /// The hostname fragment, newline-terminated. Falls back to the pod
    /// name so `/etc/hostname` is never empty.
    pub fn hostname_contents(&self) -> String {
        let hostname = if self.config.hostname.is_empty() {
            &self.config.metadata.name
        } else {
            &self.config.hostname
        };
        format!("{hostname}\n")
    }

    pub fn hostname(&self) -> &str {
        if self.config.hostname.is_empty() {
            &self.config.metadata.name
        } else {
            &self.config.hostname
        }
    }

    /// Write both generated fragments into the pod directory.
    pub fn write_fragments(&self) -> Result<()> {
        if let Some(contents) = self.resolv_conf_contents() {
            std::fs::write(self.resolv_conf_path(), contents)?;
        }
        std::fs::write(self.hostname_path(), self.hostname_contents())?;
        Ok(())
    }

    pub fn namespaces(&self) -> &[NsSpec] {
        &self.namespaces
    }

    pub fn set_namespaces(&mut self, namespaces: Vec<NsSpec>) {
        self.namespaces = namespaces;
    }

    /// The bind path of a pod-owned namespace, if the pod created one.
    pub fn namespace_bind(&self, ty: NsType) -> Option<&PathBuf> {
        self.namespaces
            .iter()
            .find(|spec| spec.ty == ty)
            .map(|spec| &spec.bind)
    }

    pub fn containers(&self) -> &[String] {
        &self.containers
    }

    pub fn add_container(&mut self, id: &str) {
        if !self.containers.iter().any(|existing| existing == id) {
            self.containers.push(id.to_string());
        }
    }

    pub fn remove_container(&mut self, id: &str) {
        self.containers.retain(|existing| existing != id);
    }

    pub fn network(&self) -> Option<&PodNetwork> {
        self.network.as_ref()
    }

    pub fn set_network(&mut self, network: PodNetwork) {
        self.network = Some(network);
    }

    pub fn take_network(&mut self) -> Option<PodNetwork> {
        self.network.take()
    }

    /// Filter evaluation: exact id, exact state, and every label selector
    /// entry must match.
    pub fn matches(&self, filter: &PodSandboxFilter) -> bool {
        if let Some(id) = &filter.id {
            if id != &self.id {
                return false;
            }
        }
        if let Some(state) = filter.state {
            if state != self.state {
                return false;
            }
        }
        labels_match(&filter.label_selector, &self.config.labels)
    }
}

/// True when every selector entry appears verbatim in `labels`.
pub(crate) fn labels_match(
    selector: &HashMap<String, String>,
    labels: &HashMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri::DnsConfig;

    fn config(name: &str) -> PodSandboxConfig {
        PodSandboxConfig {
            metadata: PodSandboxMetadata {
                name: name.into(),
                uid: "uid-1".into(),
                namespace: "default".into(),
                attempt: 0,
            },
            ..PodSandboxConfig::default()
        }
    }

    #[test]
    fn id_is_deterministic_and_attempt_sensitive() {
        let a = Pod::id_of(&config("netpod").metadata);
        let b = Pod::id_of(&config("netpod").metadata);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let mut retry = config("netpod");
        retry.metadata.attempt = 1;
        assert_ne!(a, Pod::id_of(&retry.metadata));
    }

    #[test]
    fn resolv_conf_renders_one_line_per_directive() {
        let mut config = config("netpod");
        config.dns_config = Some(DnsConfig {
            servers: vec!["1.1.1.1".into(), "8.8.8.8".into()],
            searches: vec!["cluster.local".into(), "svc.cluster.local".into()],
            options: vec!["ndots:5".into()],
        });
        let pod = Pod::new(config, PathBuf::from("/run/pods/x"));

        assert_eq!(
            pod.resolv_conf_contents().unwrap(),
            "nameserver 1.1.1.1\nnameserver 8.8.8.8\n\
             search cluster.local svc.cluster.local\noptions ndots:5\n"
        );
    }

    #[test]
    fn hostname_falls_back_to_the_pod_name() {
        let mut with_hostname = config("netpod");
        with_hostname.hostname = "custom-host".into();
        let pod = Pod::new(with_hostname, PathBuf::from("/run/pods/x"));
        assert_eq!(pod.hostname_contents(), "custom-host\n");

        let pod = Pod::new(config("netpod"), PathBuf::from("/run/pods/x"));
        assert_eq!(pod.hostname_contents(), "netpod\n");
    }

    #[test]
    fn not_ready_is_absorbing() {
        let mut pod = Pod::new(config("netpod"), PathBuf::from("/run/pods/x"));
        assert_eq!(pod.state(), PodState::Ready);
        pod.set_not_ready();
        pod.set_not_ready();
        assert_eq!(pod.state(), PodState::NotReady);
    }

    #[test]
    fn filters_compose() {
        let mut cfg = config("netpod");
        cfg.labels.insert("app".into(), "db".into());
        cfg.labels.insert("tier".into(), "backend".into());
        let pod = Pod::new(cfg, PathBuf::from("/run/pods/x"));

        let mut filter = PodSandboxFilter::default();
        assert!(pod.matches(&filter));

        filter.id = Some(pod.id().to_string());
        filter.state = Some(PodState::Ready);
        filter.label_selector.insert("app".into(), "db".into());
        assert!(pod.matches(&filter));

        filter.label_selector.insert("app".into(), "web".into());
        assert!(!pod.matches(&filter));

        let mut by_state = PodSandboxFilter {
            state: Some(PodState::NotReady),
            ..PodSandboxFilter::default()
        };
        assert!(!pod.matches(&by_state));
        by_state.state = Some(PodState::Ready);
        assert!(pod.matches(&by_state));
    }

    #[test]
    fn container_membership_is_set_like() {
        let mut pod = Pod::new(config("netpod"), PathBuf::from("/run/pods/x"));
        pod.add_container("c1");
        pod.add_container("c2");
        pod.add_container("c1");
        assert_eq!(pod.containers(), ["c1", "c2"]);
        pod.remove_container("c1");
        assert_eq!(pod.containers(), ["c2"]);
    }
}
