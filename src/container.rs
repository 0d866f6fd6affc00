//! The container record and its lifecycle state machine.
//!
//! A container references its pod and image by id only; the pod holds the
//! reverse edge as an id list. The record owns the bundle directory and,
//! between create and remove, the launcher handle whose drop guarantees the
//! subprocess dies with the record.
//!
//! States advance monotonically through `Created → Running → Exited`;
//! `Unknown` appears only when a launcher probe fails and is escaped as
//! soon as a probe succeeds again.

use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::cri::{
    ContainerConfig, ContainerFilter, ContainerState, ContainerStatus,
};
use crate::error::{Error, Result};
use crate::launcher::{InstanceInfo, LauncherHandle};
use crate::pod::labels_match;

/// One container.
#[derive(Debug)]
pub struct Container {
    id: String,
    pod_id: String,
    /// Image id in the store; the pin this container holds.
    image_id: String,
    /// The reference string the kubelet created the container with.
    image_ref: String,
    config: ContainerConfig,
    state: ContainerState,
    created_at: i64,
    started_at: i64,
    finished_at: i64,
    exit_code: Option<i32>,
    reason: String,
    message: String,
    bundle_dir: PathBuf,
    log_path: Option<PathBuf>,
    launcher: Option<LauncherHandle>,
}

fn rank(state: ContainerState) -> u8 {
    match state {
        ContainerState::Created => 0,
        ContainerState::Running => 1,
        ContainerState::Exited => 2,
        // Unknown sits outside the ladder; transitions through it are free.
        ContainerState::Unknown => 0,
    }
}

impl Container {
    /// Deterministic container id over `(pod id, name, attempt)`.
    pub fn id_of(pod_id: &str, name: &str, attempt: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(pod_id.as_bytes());
        hasher.update([0]);
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(attempt.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn new(
        pod_id: &str,
        image_id: &str,
        config: ContainerConfig,
        bundle_dir: PathBuf,
        log_path: Option<PathBuf>,
    ) -> Container {
        Container {
            id: Container::id_of(pod_id, &config.metadata.name, config.metadata.attempt),
            pod_id: pod_id.to_string(),
            image_id: image_id.to_string(),
            image_ref: config.image.clone(),
            config,
            state: ContainerState::Created,
            created_at: crate::now(),
            started_at: 0,
            finished_at: 0,
            exit_code: None,
            reason: String::new(),
            message: String::new(),
            bundle_dir,
            log_path,
            launcher: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn bundle_dir(&self) -> &PathBuf {
        &self.bundle_dir
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.bundle_dir.join("rootfs")
    }

    pub fn config_json_path(&self) -> PathBuf {
        self.bundle_dir.join("config.json")
    }

    pub fn log_path(&self) -> Option<&PathBuf> {
        self.log_path.as_ref()
    }

    pub fn launcher(&self) -> Option<&LauncherHandle> {
        self.launcher.as_ref()
    }

    pub fn launcher_mut(&mut self) -> Option<&mut LauncherHandle> {
        self.launcher.as_mut()
    }

    pub fn set_launcher(&mut self, handle: LauncherHandle) {
        self.launcher = Some(handle);
    }

    pub fn take_launcher(&mut self) -> Option<LauncherHandle> {
        self.launcher.take()
    }

    /// Move the state forward. Backwards transitions are state-machine
    /// violations and refuse; re-asserting the current state is a no-op.
    pub fn advance(&mut self, to: ContainerState) -> Result<()> {
        if to == self.state || self.state == ContainerState::Unknown {
            self.state = to;
            return Ok(());
        }
        if rank(to) < rank(self.state) {
            return Err(Error::PreconditionFailed(format!(
                "container {} cannot go from {:?} to {to:?}",
                self.id, self.state
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Stamp the running state.
    pub fn mark_started(&mut self) -> Result<()> {
        self.advance(ContainerState::Running)?;
        self.started_at = crate::now();
        Ok(())
    }

    /// Stamp the terminal state. The exit code exists exactly from here on.
    pub fn mark_exited(&mut self, exit_code: i32, reason: impl Into<String>) -> Result<()> {
        self.advance(ContainerState::Exited)?;
        if self.finished_at == 0 {
            self.finished_at = crate::now();
        }
        self.exit_code = Some(exit_code);
        self.reason = reason.into();
        Ok(())
    }

    /// A probe failed; the state is no longer trustworthy.
    pub fn mark_unknown(&mut self, message: impl Into<String>) {
        self.state = ContainerState::Unknown;
        self.message = message.into();
    }

    /// Fold a successful launcher probe into the record. The instance file
    /// is authoritative for timestamps and the exit code.
    pub fn apply_instance_info(&mut self, info: &InstanceInfo) {
        if info.started_at > 0 {
            self.started_at = info.started_at;
        }
        if info.finished_at > 0 {
            self.finished_at = info.finished_at;
            self.exit_code = info.exit_code;
            if !info.exit_desc.is_empty() {
                self.reason = info.exit_desc.clone();
            }
        }
        let probed = info.container_state();
        if rank(probed) >= rank(self.state) || self.state == ContainerState::Unknown {
            self.state = probed;
        }
    }

    pub fn status(&self) -> ContainerStatus {
        ContainerStatus {
            id: self.id.clone(),
            pod_sandbox_id: self.pod_id.clone(),
            metadata: self.config.metadata.clone(),
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            image: self.image_ref.clone(),
            image_id: self.image_id.clone(),
            reason: self.reason.clone(),
            message: self.message.clone(),
            log_path: self
                .log_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            labels: self.config.labels.clone(),
            annotations: self.config.annotations.clone(),
        }
    }

    /// Filter evaluation: exact id, state, pod id, and label selector.
    pub fn matches(&self, filter: &ContainerFilter) -> bool {
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
        if let Some(pod_id) = &filter.pod_sandbox_id {
            if pod_id != &self.pod_id {
                return false;
            }
        }
        labels_match(&filter.label_selector, &self.config.labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri::ContainerMetadata;

    fn container() -> Container {
        Container::new(
            "pod-1",
            "image-1",
            ContainerConfig {
                metadata: ContainerMetadata {
                    name: "app".into(),
                    attempt: 0,
                },
                image: "busybox:1.31".into(),
                ..ContainerConfig::default()
            },
            PathBuf::from("/run/pods/p/containers/c"),
            None,
        )
    }

    #[test]
    fn id_is_deterministic_over_the_triple() {
        let a = Container::id_of("pod-1", "app", 0);
        assert_eq!(a, Container::id_of("pod-1", "app", 0));
        assert_ne!(a, Container::id_of("pod-1", "app", 1));
        assert_ne!(a, Container::id_of("pod-2", "app", 0));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn states_only_move_forward() {
        let mut c = container();
        assert_eq!(c.state(), ContainerState::Created);
        c.mark_started().unwrap();
        assert_eq!(c.state(), ContainerState::Running);
        assert!(c.started_at > 0);

        // Running is not re-enterable from Exited.
        c.mark_exited(137, "killed").unwrap();
        assert!(matches!(
            c.advance(ContainerState::Running),
            Err(Error::PreconditionFailed(_))
        ));
        assert_eq!(c.state(), ContainerState::Exited);
    }

    #[test]
    fn exit_code_exists_exactly_when_exited() {
        let mut c = container();
        assert_eq!(c.exit_code, None);
        c.mark_started().unwrap();
        assert_eq!(c.exit_code, None);
        c.mark_exited(0, "completed").unwrap();
        assert_eq!(c.exit_code, Some(0));
        assert!(c.finished_at > 0);
    }

    #[test]
    fn unknown_is_escaped_by_the_next_probe() {
        let mut c = container();
        c.mark_unknown("probe failed");
        assert_eq!(c.state(), ContainerState::Unknown);

        let info = InstanceInfo {
            pid: 42,
            created_at: 1,
            started_at: 2,
            ..InstanceInfo::default()
        };
        c.apply_instance_info(&info);
        assert_eq!(c.state(), ContainerState::Running);
        assert_eq!(c.started_at, 2);
    }

    #[test]
    fn probe_cannot_move_the_state_backwards() {
        let mut c = container();
        c.mark_started().unwrap();
        c.mark_exited(0, "completed").unwrap();

        // A stale instance file claiming "running" does not resurrect.
        let stale = InstanceInfo {
            pid: 42,
            created_at: 1,
            started_at: 2,
            ..InstanceInfo::default()
        };
        c.apply_instance_info(&stale);
        assert_eq!(c.state(), ContainerState::Exited);
    }

    #[test]
    fn filters_compose() {
        let mut c = container();
        c.config.labels.insert("app".into(), "db".into());

        let mut filter = ContainerFilter::default();
        assert!(c.matches(&filter));
        filter.pod_sandbox_id = Some("pod-1".into());
        filter.label_selector.insert("app".into(), "db".into());
        assert!(c.matches(&filter));
        filter.state = Some(ContainerState::Running);
        assert!(!c.matches(&filter));
    }
}
