//! Translation of cluster container configuration into an OCI runtime spec.
//!
//! This is a pure function from `(container config, pod context, image)` to
//! the `config.json` handed to the launcher. The order of the mutation
//! passes is fixed and observable: root, mounts, devices, namespaces,
//! resources, process (environment, command resolution, capabilities,
//! seccomp, hardening flags, the privileged override last), user, and
//! finally annotations. Tests pin the order wherever two passes could
//! interact.

pub mod seccomp;
pub mod user;

use std::path::{Path, PathBuf};

use oci_spec::runtime::{
    Capability, LinuxCapabilities, LinuxCpuBuilder, LinuxDeviceBuilder, LinuxDeviceCgroup,
    LinuxDeviceCgroupBuilder, LinuxDeviceType, LinuxMemoryBuilder, LinuxNamespace,
    LinuxNamespaceBuilder, LinuxNamespaceType, LinuxResources, LinuxSeccomp, Mount, MountBuilder,
    RootBuilder, Spec, UserBuilder,
};
use oci_spec::OciSpecError;

use crate::cri::{ContainerConfig, MountPropagation, NamespaceMode};
use crate::error::{Error, Result};
use crate::image::ImageInfo;
use crate::namespace::{cgroup_path, NsType};
use crate::pod::Pod;

/// Entry point a native SIF uses to run its embedded runscript.
const SIF_RUNSCRIPT: &str = "/.singularity.d/runscript";
/// Exec action wrapping explicit commands in a native SIF.
const SIF_EXEC_ACTION: &str = "/.singularity.d/actions/exec";

/// Host device names never forwarded into privileged containers.
const DEVICE_SKIP_LIST: &[&str] = &[
    "console",
    "pts",
    "shm",
    "fd",
    "mqueue",
    ".lxc",
    ".lxd-mounts",
];

/// Every capability name, for `ALL` expansion and the privileged override.
const CAP_ALL: &[&str] = &[
    "CAP_AUDIT_CONTROL",
    "CAP_AUDIT_READ",
    "CAP_AUDIT_WRITE",
    "CAP_BLOCK_SUSPEND",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_KILL",
    "CAP_LEASE",
    "CAP_LINUX_IMMUTABLE",
    "CAP_MAC_ADMIN",
    "CAP_MAC_OVERRIDE",
    "CAP_MKNOD",
    "CAP_NET_ADMIN",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_RAW",
    "CAP_PERFMON",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_CHROOT",
    "CAP_SYS_MODULE",
    "CAP_SYS_NICE",
    "CAP_SYS_PACCT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
];

/// Everything the translation reads.
#[derive(Debug, Clone, Copy)]
pub struct TranslationInput<'a> {
    pub container: &'a ContainerConfig,
    pub container_id: &'a str,
    pub pod: &'a Pod,
    pub image: &'a ImageInfo,
    pub bundle_dir: &'a Path,
}

/// Build the OCI spec for one container.
pub fn translate(input: &TranslationInput<'_>) -> Result<Spec> {
    let mut spec = Spec::default();

    apply_root(&mut spec, input)?;
    apply_mounts(&mut spec, input)?;
    apply_devices(&mut spec, input)?;
    apply_namespaces(&mut spec, input)?;
    apply_resources(&mut spec, input)?;
    apply_process(&mut spec, input)?;
    apply_user(&mut spec, input)?;

    spec.set_annotations(Some(input.container.annotations.clone()));
    Ok(spec)
}

fn oci(e: OciSpecError) -> Error {
    Error::InvalidConfig(e.to_string())
}

fn security<'a>(input: &TranslationInput<'a>) -> &'a crate::cri::LinuxContainerSecurityContext {
    &input.container.linux.security_context
}

fn apply_root(spec: &mut Spec, input: &TranslationInput<'_>) -> Result<()> {
    let root = RootBuilder::default()
        .path(input.bundle_dir.join("rootfs"))
        .readonly(security(input).readonly_rootfs)
        .build()
        .map_err(oci)?;
    spec.set_root(Some(root));
    Ok(())
}

fn bind_mount(destination: &str, source: PathBuf, options: Vec<String>) -> Result<Mount> {
    MountBuilder::default()
        .destination(destination)
        .typ("bind")
        .source(source)
        .options(options)
        .build()
        .map_err(oci)
}

fn apply_mounts(spec: &mut Spec, input: &TranslationInput<'_>) -> Result<()> {
    let privileged = security(input).privileged;

    // Root propagation starts private and only ever escalates.
    let mut propagation_rank = 0u8;

    let mut extra = Vec::new();
    if input.pod.config().dns_config.is_some() {
        extra.push(bind_mount(
            "/etc/resolv.conf",
            input.pod.resolv_conf_path(),
            vec!["bind".into(), "ro".into()],
        )?);
    }
    extra.push(bind_mount(
        "/etc/hostname",
        input.pod.hostname_path(),
        vec!["bind".into(), "ro".into()],
    )?);
    spec.set_hostname(Some(input.pod.hostname().to_string()));

    if privileged {
        // Privileged pods see the real kernel interfaces read-write.
        if let Some(mounts) = spec.mounts_mut() {
            for mount in mounts.iter_mut() {
                if matches!(
                    mount.typ().as_deref(),
                    Some("sysfs") | Some("proc") | Some("procfs")
                ) {
                    mount.set_options(Some(vec![
                        "nosuid".into(),
                        "noexec".into(),
                        "nodev".into(),
                        "rw".into(),
                    ]));
                }
            }
        }
    } else {
        let sc = security(input);
        if !sc.masked_paths.is_empty() {
            let linux = spec.linux_mut().as_mut().expect("default spec has linux");
            linux.set_masked_paths(Some(sc.masked_paths.clone()));
        }
        if !sc.readonly_paths.is_empty() {
            let linux = spec.linux_mut().as_mut().expect("default spec has linux");
            linux.set_readonly_paths(Some(sc.readonly_paths.clone()));
        }
    }

    for user_mount in &input.container.mounts {
        let source = resolve_mount_source(&user_mount.host_path)?;
        let mut options = vec!["rbind".into()];
        if user_mount.readonly {
            options.push("ro".into());
        }
        let (option, rank) = match user_mount.propagation {
            MountPropagation::Private => ("rprivate", 0),
            MountPropagation::HostToContainer => ("rslave", 1),
            MountPropagation::Bidirectional => ("rshared", 2),
        };
        options.push(option.into());
        propagation_rank = propagation_rank.max(rank);
        extra.push(bind_mount(&user_mount.container_path, source, options)?);
    }

    if let Some(mounts) = spec.mounts_mut() {
        mounts.extend(extra);
    }
    let linux = spec.linux_mut().as_mut().expect("default spec has linux");
    linux.set_rootfs_propagation(Some(
        match propagation_rank {
            0 => "rprivate",
            1 => "rslave",
            _ => "rshared",
        }
        .to_string(),
    ));
    Ok(())
}

/// Resolve a user mount source: follow symlinks, and create a missing
/// source as a directory the way the kubelet expects hostPath mounts to
/// appear on demand.
fn resolve_mount_source(host_path: &str) -> Result<PathBuf> {
    match std::fs::canonicalize(host_path) {
        Ok(resolved) => Ok(resolved),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(host_path)?;
            Ok(PathBuf::from(host_path))
        }
        Err(e) => Err(e.into()),
    }
}

fn apply_devices(spec: &mut Spec, input: &TranslationInput<'_>) -> Result<()> {
    let privileged = security(input).privileged;

    let mut devices = Vec::new();
    let mut cgroup_rules = Vec::new();
    if privileged {
        walk_host_devices(Path::new("/dev"), &mut devices)?;
        cgroup_rules.push(
            LinuxDeviceCgroupBuilder::default()
                .allow(true)
                .typ(LinuxDeviceType::A)
                .access("rwm")
                .build()
                .map_err(oci)?,
        );
    } else {
        for requested in &input.container.devices {
            collect_user_devices(
                Path::new(&requested.host_path),
                Path::new(&requested.container_path),
                &requested.permissions,
                &mut devices,
                &mut cgroup_rules,
            )?;
        }
    }

    if devices.is_empty() && !privileged {
        return Ok(());
    }
    let linux = spec.linux_mut().as_mut().expect("default spec has linux");
    linux.set_devices(Some(devices));
    let mut resources = linux.resources().clone().unwrap_or_default();
    resources.set_devices(Some(cgroup_rules));
    linux.set_resources(Some(resources));
    Ok(())
}

/// Recursively gather device nodes under `/dev`, skipping the entries that
/// belong to other subsystems.
fn walk_host_devices(dir: &Path, devices: &mut Vec<oci_spec::runtime::LinuxDevice>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if DEVICE_SKIP_LIST
            .iter()
            .any(|skipped| name.to_str() == Some(*skipped))
        {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            walk_host_devices(&path, devices)?;
        } else if let Ok(Some(device)) = device_node(&path, &path) {
            // Entries that vanish or refuse a stat mid-walk are skipped;
            // the enumeration is best-effort by nature.
            devices.push(device);
        }
    }
    Ok(())
}

/// Add one user-requested device, or every node under a requested
/// directory, rewriting the host prefix to the container prefix.
fn collect_user_devices(
    host_path: &Path,
    container_path: &Path,
    permissions: &str,
    devices: &mut Vec<oci_spec::runtime::LinuxDevice>,
    rules: &mut Vec<LinuxDeviceCgroup>,
) -> Result<()> {
    let metadata = std::fs::metadata(host_path).map_err(|e| {
        Error::InvalidConfig(format!("device {}: {e}", host_path.display()))
    })?;
    if metadata.is_dir() {
        for entry in std::fs::read_dir(host_path)? {
            let entry = entry?;
            collect_user_devices(
                &entry.path(),
                &container_path.join(entry.file_name()),
                permissions,
                devices,
                rules,
            )?;
        }
        return Ok(());
    }

    match device_node(host_path, container_path)? {
        Some(device) => {
            rules.push(
                LinuxDeviceCgroupBuilder::default()
                    .allow(true)
                    .typ(device.typ())
                    .major(device.major())
                    .minor(device.minor())
                    .access(permissions)
                    .build()
                    .map_err(oci)?,
            );
            devices.push(device);
            Ok(())
        }
        None => Err(Error::InvalidConfig(format!(
            "{} is not a device node",
            host_path.display()
        ))),
    }
}

/// Describe a device node, with the in-container path substituted.
fn device_node(
    host_path: &Path,
    container_path: &Path,
) -> Result<Option<oci_spec::runtime::LinuxDevice>> {
    use nix::sys::stat::{lstat, major, minor};

    let stat = lstat(host_path)?;
    let typ = match stat.st_mode & libc::S_IFMT {
        libc::S_IFCHR => LinuxDeviceType::C,
        libc::S_IFBLK => LinuxDeviceType::B,
        _ => return Ok(None),
    };
    Ok(Some(
        LinuxDeviceBuilder::default()
            .path(container_path)
            .typ(typ)
            .major(major(stat.st_rdev) as i64)
            .minor(minor(stat.st_rdev) as i64)
            .file_mode(stat.st_mode & 0o7777)
            .uid(stat.st_uid)
            .gid(stat.st_gid)
            .build()
            .map_err(oci)?,
    ))
}

fn namespace(
    typ: LinuxNamespaceType,
    path: Option<&PathBuf>,
) -> Result<LinuxNamespace> {
    let mut builder = LinuxNamespaceBuilder::default().typ(typ);
    if let Some(path) = path {
        builder = builder.path(path.clone());
    }
    builder.build().map_err(oci)
}

fn apply_namespaces(spec: &mut Spec, input: &TranslationInput<'_>) -> Result<()> {
    // The generator's defaults are discarded wholesale: namespace
    // membership is decided here, not inherited.
    let mut namespaces = vec![
        namespace(LinuxNamespaceType::Uts, input.pod.namespace_bind(NsType::Uts))?,
        namespace(LinuxNamespaceType::Mount, None)?,
    ];

    let modes = security(input).namespace_options;
    for (typ, ns_type, mode) in [
        (LinuxNamespaceType::Ipc, NsType::Ipc, modes.ipc),
        (LinuxNamespaceType::Network, NsType::Net, modes.network),
        (LinuxNamespaceType::Pid, NsType::Pid, modes.pid),
    ] {
        match mode {
            NamespaceMode::Container => namespaces.push(namespace(typ, None)?),
            NamespaceMode::Pod => {
                // Join only what the pod actually created; a pod that kept
                // the host namespace leaves its containers there too.
                if let Some(bind) = input.pod.namespace_bind(ns_type) {
                    namespaces.push(namespace(typ, Some(bind))?);
                }
            }
            NamespaceMode::Node => {}
        }
    }

    let linux = spec.linux_mut().as_mut().expect("default spec has linux");
    linux.set_namespaces(Some(namespaces));
    Ok(())
}

fn apply_resources(spec: &mut Spec, input: &TranslationInput<'_>) -> Result<()> {
    let requested = &input.container.linux.resources;
    let linux = spec.linux_mut().as_mut().expect("default spec has linux");
    linux.set_cgroups_path(Some(PathBuf::from(cgroup_path(
        &input.pod.config().linux.cgroup_parent,
        input.container_id,
    ))));

    let mut resources: LinuxResources = linux.resources().clone().unwrap_or_default();
    let mut cpu = LinuxCpuBuilder::default();
    let mut cpu_touched = false;
    if requested.cpu_shares > 0 {
        cpu = cpu.shares(requested.cpu_shares as u64);
        cpu_touched = true;
    }
    if requested.cpu_period > 0 {
        cpu = cpu.period(requested.cpu_period as u64);
        cpu_touched = true;
    }
    if requested.cpu_quota > 0 {
        cpu = cpu.quota(requested.cpu_quota);
        cpu_touched = true;
    }
    if !requested.cpuset_cpus.is_empty() {
        cpu = cpu.cpus(requested.cpuset_cpus.clone());
        cpu_touched = true;
    }
    if !requested.cpuset_mems.is_empty() {
        cpu = cpu.mems(requested.cpuset_mems.clone());
        cpu_touched = true;
    }
    if cpu_touched {
        resources.set_cpu(Some(cpu.build().map_err(oci)?));
    }
    if requested.memory_limit_in_bytes > 0 {
        resources.set_memory(Some(
            LinuxMemoryBuilder::default()
                .limit(requested.memory_limit_in_bytes)
                .build()
                .map_err(oci)?,
        ));
    }
    linux.set_resources(Some(resources));

    if requested.oom_score_adj != 0 {
        let process = spec.process_mut().as_mut().expect("default spec has process");
        process.set_oom_score_adj(Some(requested.oom_score_adj as i32));
    }
    Ok(())
}

/// The documented command/args precedence, including the SIF fallbacks.
fn resolve_process_args(input: &TranslationInput<'_>) -> Result<Vec<String>> {
    let container = input.container;
    let image_config = input.image.oci_config();

    let mut command = container.command.clone();
    let mut args = container.args.clone();
    if container.command.is_empty() {
        if let Some(config) = image_config {
            command = config.entrypoint.clone();
            if container.args.is_empty() {
                args = config.cmd.clone();
            }
        }
    }

    // Native SIFs run through their embedded runscript machinery: with no
    // command at all the runscript is the entrypoint, otherwise the exec
    // action wraps the explicit command.
    if image_config.is_none() {
        if command.is_empty() && args.is_empty() {
            command = vec![SIF_RUNSCRIPT.to_string()];
        } else {
            command.insert(0, SIF_EXEC_ACTION.to_string());
        }
    }

    if command.is_empty() && args.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "container {} has no command after image fallbacks",
            container.metadata.name
        )));
    }
    command.extend(args);
    Ok(command)
}

/// Merge image-seeded environment with container overrides, in order.
fn resolve_env(input: &TranslationInput<'_>) -> Vec<String> {
    let mut merged: Vec<(String, String)> = Vec::new();
    if let Some(config) = input.image.oci_config() {
        for entry in &config.env {
            if let Some((key, value)) = entry.split_once('=') {
                merged.push((key.to_string(), value.to_string()));
            }
        }
    }
    for env in &input.container.envs {
        match merged.iter_mut().find(|(key, _)| key == &env.key) {
            Some(existing) => existing.1 = env.value.clone(),
            None => merged.push((env.key.clone(), env.value.clone())),
        }
    }
    merged
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

fn parse_capability(name: &str) -> Result<Capability> {
    let canonical = if name.starts_with("CAP_") {
        name.to_string()
    } else {
        format!("CAP_{}", name.to_uppercase())
    };
    serde_json::from_value(serde_json::Value::String(canonical))
        .map_err(|_| Error::InvalidConfig(format!("unknown capability {name:?}")))
}

fn all_capabilities() -> std::collections::HashSet<Capability> {
    CAP_ALL
        .iter()
        .filter_map(|name| parse_capability(name).ok())
        .collect()
}

/// Apply drop-then-add over one capability set.
fn adjust_set(
    set: Option<std::collections::HashSet<Capability>>,
    drops: &[String],
    adds: &[String],
) -> Result<Option<std::collections::HashSet<Capability>>> {
    let mut set = set.unwrap_or_default();
    for name in drops {
        if name.eq_ignore_ascii_case("ALL") {
            set.clear();
        } else {
            set.remove(&parse_capability(name)?);
        }
    }
    for name in adds {
        if name.eq_ignore_ascii_case("ALL") {
            set.extend(all_capabilities());
        } else {
            set.insert(parse_capability(name)?);
        }
    }
    Ok(Some(set))
}

fn apply_process(spec: &mut Spec, input: &TranslationInput<'_>) -> Result<()> {
    let sc = security(input);
    let args = resolve_process_args(input)?;
    let env = resolve_env(input);

    let working_dir = if !input.container.working_dir.is_empty() {
        input.container.working_dir.clone()
    } else {
        input
            .image
            .oci_config()
            .map(|config| config.working_dir.clone())
            .unwrap_or_default()
    };

    {
        let process = spec.process_mut().as_mut().expect("default spec has process");
        process.set_args(Some(args));
        if !env.is_empty() {
            process.set_env(Some(env));
        }
        if !working_dir.is_empty() {
            process.set_cwd(PathBuf::from(working_dir));
        }
        process.set_terminal(Some(input.container.tty));
        process.set_no_new_privileges(Some(sc.no_new_privs));

        // Capabilities: drop, then add, across all five sets.
        let drops = &sc.capabilities.drop_capabilities;
        let adds = &sc.capabilities.add_capabilities;
        let mut caps: LinuxCapabilities =
            process.capabilities().clone().unwrap_or_default();
        caps.set_bounding(adjust_set(caps.bounding().clone(), drops, adds)?);
        caps.set_effective(adjust_set(caps.effective().clone(), drops, adds)?);
        caps.set_inheritable(adjust_set(caps.inheritable().clone(), drops, adds)?);
        caps.set_permitted(adjust_set(caps.permitted().clone(), drops, adds)?);
        caps.set_ambient(adjust_set(caps.ambient().clone(), drops, adds)?);
        process.set_capabilities(Some(caps));
    }

    // The default seccomp profile depends on the retained capabilities, so
    // it is reloaded after every adjustment.
    let bounding = spec
        .process()
        .as_ref()
        .and_then(|process| process.capabilities().clone())
        .and_then(|caps| caps.bounding().clone());
    {
        let linux = spec.linux_mut().as_mut().expect("default spec has linux");
        linux.set_seccomp(Some(seccomp::default_profile(bounding.as_ref())));
    }

    {
        let process = spec.process_mut().as_mut().expect("default spec has process");
        if !sc.apparmor_profile.is_empty() {
            process.set_apparmor_profile(Some(sc.apparmor_profile.clone()));
        }
        if let Some(label) = sc.selinux_options.as_ref().and_then(|options| options.label()) {
            process.set_selinux_label(Some(label));
        }
    }
    if !sc.seccomp_profile_path.is_empty() {
        let linux = spec.linux_mut().as_mut().expect("default spec has linux");
        linux.set_seccomp(load_seccomp_profile(&sc.seccomp_profile_path)?);
    }

    if sc.privileged {
        apply_privileged(spec)?;
    }
    Ok(())
}

/// The privileged override, applied last: every capability in every set and
/// no syscall or path restrictions at all.
fn apply_privileged(spec: &mut Spec) -> Result<()> {
    let everything = all_capabilities();
    let process = spec.process_mut().as_mut().expect("default spec has process");
    let mut caps = LinuxCapabilities::default();
    caps.set_bounding(Some(everything.clone()));
    caps.set_effective(Some(everything.clone()));
    caps.set_inheritable(Some(everything.clone()));
    caps.set_permitted(Some(everything.clone()));
    caps.set_ambient(Some(everything));
    process.set_capabilities(Some(caps));
    process.set_apparmor_profile(None);

    let linux = spec.linux_mut().as_mut().expect("default spec has linux");
    linux.set_seccomp(None);
    linux.set_masked_paths(None);
    linux.set_readonly_paths(None);
    Ok(())
}

/// Kubelet seccomp profile names: `unconfined` disables filtering,
/// `runtime/default` keeps the reloaded default, anything else is a
/// profile file (with the conventional `localhost/` prefix stripped).
fn load_seccomp_profile(profile: &str) -> Result<Option<LinuxSeccomp>> {
    match profile {
        "unconfined" => Ok(None),
        "runtime/default" | "docker/default" => Ok(Some(seccomp::default_profile(None))),
        path => {
            let path = path.strip_prefix("localhost/").unwrap_or(path);
            let raw = std::fs::read_to_string(path).map_err(|e| {
                Error::InvalidConfig(format!("seccomp profile {path}: {e}"))
            })?;
            serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Error::InvalidConfig(format!("seccomp profile {path}: {e}")))
        }
    }
}

fn apply_user(spec: &mut Spec, input: &TranslationInput<'_>) -> Result<()> {
    let sc = security(input);

    let mut user_spec = String::new();
    if !sc.run_as_username.is_empty() {
        user_spec.push_str(&sc.run_as_username);
    } else if let Some(uid) = sc.run_as_user {
        user_spec.push_str(&uid.to_string());
    }
    if let Some(gid) = sc.run_as_group {
        user_spec.push_str(&format!(":{gid}"));
    }
    if user_spec.is_empty() {
        if let Some(config) = input.image.oci_config() {
            user_spec = config.user.clone();
        }
    }

    let rootfs = input.bundle_dir.join("rootfs");
    let resolved = user::resolve(&rootfs, &user_spec)?;
    let mut additional: Vec<u32> = resolved
        .sgids
        .iter()
        .copied()
        .chain(sc.supplemental_groups.iter().map(|gid| *gid as u32))
        .collect();
    additional.sort_unstable();
    additional.dedup();

    let mut builder = UserBuilder::default().uid(resolved.uid).gid(resolved.gid);
    if !additional.is_empty() {
        builder = builder.additional_gids(additional);
    }
    let process = spec.process_mut().as_mut().expect("default spec has process");
    process.set_user(builder.build().map_err(oci)?);
    Ok(())
}
