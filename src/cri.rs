//! Cluster-level pod, container, and image configuration types.
//!
//! These mirror the Container Runtime Interface data model closely enough
//! that the wire adapter converts field-for-field, but they are plain Rust
//! types: the core never sees protobuf. Only the fields the runtime acts on
//! are carried; everything here arrives from the kubelet and is treated as
//! untrusted input until the lifecycle preconditions have run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Identity of a pod sandbox as the cluster sees it. The runtime derives the
/// pod id deterministically from these four fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandboxMetadata {
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub attempt: u32,
}

/// DNS resolver configuration rendered into the pod's `resolv.conf`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub servers: Vec<String>,
    pub searches: Vec<String>,
    pub options: Vec<String>,
}

/// L4 protocol of a forwarded port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    /// Lowercase name used in CNI `portMappings` runtime config.
    pub fn as_cni(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

/// One port published from the pod network namespace to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub container_port: i32,
    /// Zero means "same as the container port".
    pub host_port: i32,
    pub host_ip: String,
}

/// Who owns a given namespace type for the containers of a pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NamespaceMode {
    /// Share the pod-level namespace created at sandbox time.
    #[default]
    Pod,
    /// Give the container a freshly unshared namespace of its own.
    Container,
    /// Stay in the host namespace.
    Node,
}

/// Namespace ownership requested for a pod and inherited by its containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceOptions {
    pub network: NamespaceMode,
    pub pid: NamespaceMode,
    pub ipc: NamespaceMode,
}

/// Security posture of the sandbox itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSecurityContext {
    pub namespace_options: NamespaceOptions,
}

/// Linux-specific sandbox settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxPodSandboxConfig {
    pub cgroup_parent: String,
    pub security_context: PodSecurityContext,
}

/// Everything the kubelet supplies to create one pod sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandboxConfig {
    pub metadata: PodSandboxMetadata,
    pub hostname: String,
    pub log_directory: String,
    pub dns_config: Option<DnsConfig>,
    pub port_mappings: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub linux: LinuxPodSandboxConfig,
}

/// Identity of a container within its pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub name: String,
    pub attempt: u32,
}

/// One environment variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// How a user mount propagates between host and container mount trees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountPropagation {
    /// No propagation either way.
    #[default]
    Private,
    /// Host-to-container only.
    HostToContainer,
    /// Both directions.
    Bidirectional,
}

/// A volume requested by the container configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,
    pub readonly: bool,
    pub propagation: MountPropagation,
}

/// A device exposed to a non-privileged container. `host_path` may name a
/// directory, in which case every device node underneath it is added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub container_path: String,
    pub host_path: String,
    /// Device cgroup access string, any subset of `rwm`.
    pub permissions: String,
}

/// Cgroup resource knobs. A zero value means "leave unset".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxContainerResources {
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub cpu_shares: i64,
    pub memory_limit_in_bytes: i64,
    pub oom_score_adj: i64,
    pub cpuset_cpus: String,
    pub cpuset_mems: String,
}

/// Capability adjustments applied over the launcher's default set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub add_capabilities: Vec<String>,
    pub drop_capabilities: Vec<String>,
}

/// SELinux label components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelinuxOption {
    pub user: String,
    pub role: String,
    pub r#type: String,
    pub level: String,
}

impl SelinuxOption {
    /// Render as a process label, or `None` when entirely unset.
    pub fn label(&self) -> Option<String> {
        if self.user.is_empty() && self.role.is_empty() && self.r#type.is_empty() && self.level.is_empty() {
            return None;
        }
        Some(format!("{}:{}:{}:{}", self.user, self.role, self.r#type, self.level))
    }
}

/// Security posture of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxContainerSecurityContext {
    pub capabilities: Capabilities,
    pub privileged: bool,
    pub namespace_options: NamespaceOptions,
    pub selinux_options: Option<SelinuxOption>,
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub run_as_username: String,
    pub readonly_rootfs: bool,
    pub supplemental_groups: Vec<i64>,
    pub apparmor_profile: String,
    pub seccomp_profile_path: String,
    pub no_new_privs: bool,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
}

/// Linux-specific container settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxContainerConfig {
    pub resources: LinuxContainerResources,
    pub security_context: LinuxContainerSecurityContext,
}

/// Everything the kubelet supplies to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub metadata: ContainerMetadata,
    /// Image id or reference; resolved through the image store.
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: String,
    pub envs: Vec<KeyValue>,
    pub mounts: Vec<Mount>,
    pub devices: Vec<Device>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Relative to the pod's log directory.
    pub log_path: String,
    pub stdin: bool,
    pub tty: bool,
    pub linux: LinuxContainerConfig,
}

/// Registry credentials forwarded with a pull request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// Sandbox readiness as reported to the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodState {
    Ready,
    /// Terminal: a stopped sandbox never becomes ready again.
    NotReady,
}

/// Container lifecycle phase. Transitions are monotonic through
/// `Created → Running → Exited`; `Unknown` is reachable only when a state
/// probe fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

/// Selection criteria for [`ListPodSandbox`](crate::runtime::Runtime::list_pod_sandbox).
#[derive(Debug, Clone, Default)]
pub struct PodSandboxFilter {
    pub id: Option<String>,
    pub state: Option<PodState>,
    pub label_selector: HashMap<String, String>,
}

/// Selection criteria for [`ListContainers`](crate::runtime::Runtime::list_containers).
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub id: Option<String>,
    pub state: Option<ContainerState>,
    pub pod_sandbox_id: Option<String>,
    pub label_selector: HashMap<String, String>,
}

/// Point-in-time view of one sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct PodSandboxStatus {
    pub id: String,
    pub metadata: PodSandboxMetadata,
    pub state: PodState,
    pub created_at: i64,
    /// Pod IP, populated only while the sandbox is ready.
    pub ip: Option<String>,
    pub namespace_options: NamespaceOptions,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

/// Point-in-time view of one container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatus {
    pub id: String,
    pub pod_sandbox_id: String,
    pub metadata: ContainerMetadata,
    pub state: ContainerState,
    pub created_at: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub exit_code: Option<i32>,
    pub image: String,
    pub image_id: String,
    pub reason: String,
    pub message: String,
    pub log_path: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

/// Runtime identification returned by `Version`.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: String,
    pub runtime_name: String,
    pub runtime_version: String,
    pub runtime_api_version: String,
}

/// Image store usage returned by `ImageFsInfo`.
#[derive(Debug, Clone, Serialize)]
pub struct FilesystemUsage {
    pub timestamp: i64,
    pub storage_path: String,
    /// Mount point of the filesystem the store lives on.
    pub mount_point: String,
    pub used_bytes: u64,
    pub inodes_used: u64,
}

/// Captured output of a synchronous in-container command.
#[derive(Debug, Clone, Default)]
pub struct ExecSyncResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// A prepared exec streaming session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub container_id: String,
    pub cmd: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// A prepared attach streaming session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachRequest {
    pub container_id: String,
    pub tty: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// A prepared port-forward streaming session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortForwardRequest {
    pub pod_sandbox_id: String,
    pub ports: Vec<i32>,
}
