//! The default seccomp profile.
//!
//! Allow-by-default with a denied-syscall list, shipped as a crate asset.
//! The profile depends on the container's capability set: a capability that
//! survives the drop/add pass re-enables the syscalls it governs, so the
//! profile is recomputed whenever capabilities change.

use std::collections::HashSet;

use lazy_static::lazy_static;
use oci_spec::runtime::{Capability, LinuxSeccomp};

const DEFAULT_PROFILE_JSON: &str = include_str!("seccomp.json");

lazy_static! {
    static ref DEFAULT_PROFILE: LinuxSeccomp = serde_json::from_str(DEFAULT_PROFILE_JSON)
        .expect("embedded seccomp profile parses");
}

/// Syscalls whose denial is lifted when the named capability is retained.
const CAP_EXCEPTIONS: &[(&str, &[&str])] = &[
    (
        "CAP_SYS_ADMIN",
        &[
            "bpf",
            "lookup_dcookie",
            "mount",
            "move_mount",
            "name_to_handle_at",
            "open_by_handle_at",
            "perf_event_open",
            "pivot_root",
            "quotactl",
            "setns",
            "swapoff",
            "swapon",
            "umount",
            "umount2",
            "unshare",
            "vm86",
            "vm86old",
        ],
    ),
    ("CAP_SYS_BOOT", &["kexec_file_load", "kexec_load", "reboot"]),
    ("CAP_SYS_MODULE", &[
        "create_module",
        "delete_module",
        "finit_module",
        "init_module",
        "query_module",
    ]),
    ("CAP_SYS_NICE", &["get_mempolicy", "mbind", "move_pages", "set_mempolicy"]),
    ("CAP_SYS_PACCT", &["acct"]),
    ("CAP_SYS_PTRACE", &["kcmp", "process_vm_readv", "process_vm_writev", "ptrace"]),
    ("CAP_SYS_RAWIO", &["ioperm", "iopl"]),
    ("CAP_SYS_TIME", &["clock_adjtime", "clock_settime", "settimeofday", "stime"]),
    ("CAP_SYSLOG", &["syslog"]),
];

/// The default profile, specialized to the retained bounding capabilities.
pub fn default_profile(bounding: Option<&HashSet<Capability>>) -> LinuxSeccomp {
    let mut profile = DEFAULT_PROFILE.clone();

    let retained: HashSet<String> = bounding
        .map(|caps| caps.iter().map(capability_name).collect())
        .unwrap_or_default();
    let lifted: HashSet<&str> = CAP_EXCEPTIONS
        .iter()
        .filter(|(capability, _)| retained.contains(*capability))
        .flat_map(|(_, syscalls)| syscalls.iter().copied())
        .collect();
    if lifted.is_empty() {
        return profile;
    }

    let syscalls = profile
        .syscalls()
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|mut entry| {
            let names: Vec<String> = entry
                .names()
                .iter()
                .filter(|name| !lifted.contains(name.as_str()))
                .cloned()
                .collect();
            if names.is_empty() {
                None
            } else {
                entry.set_names(names);
                Some(entry)
            }
        })
        .collect();
    profile.set_syscalls(Some(syscalls));
    profile
}

/// The `CAP_*` name of a capability, via its serde form.
fn capability_name(capability: &Capability) -> String {
    match serde_json::to_value(capability) {
        Ok(serde_json::Value::String(name)) => name,
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denied_names(profile: &LinuxSeccomp) -> Vec<String> {
        profile
            .syscalls()
            .iter()
            .flatten()
            .flat_map(|entry| entry.names().clone())
            .collect()
    }

    fn capability(name: &str) -> Capability {
        serde_json::from_value(serde_json::Value::String(name.into())).unwrap()
    }

    #[test]
    fn base_profile_denies_mount_and_ptrace() {
        let profile = default_profile(None);
        let denied = denied_names(&profile);
        assert!(denied.iter().any(|name| name == "mount"));
        assert!(denied.iter().any(|name| name == "ptrace"));
    }

    #[test]
    fn retained_capability_lifts_its_syscalls() {
        let mut caps = HashSet::new();
        caps.insert(capability("CAP_SYS_ADMIN"));
        let profile = default_profile(Some(&caps));
        let denied = denied_names(&profile);
        assert!(!denied.iter().any(|name| name == "mount"));
        assert!(!denied.iter().any(|name| name == "setns"));
        // Unrelated denials stay.
        assert!(denied.iter().any(|name| name == "ptrace"));
    }
}
