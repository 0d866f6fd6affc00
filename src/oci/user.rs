//! Process user resolution against a container rootfs.
//!
//! The user spec string (`user[:group]`, names or numbers) is resolved with
//! the container's own `/etc/passwd` and `/etc/group`, never the host's.
//! Either file may be absent; numbers then resolve to themselves and names
//! fail. Supplemental groups come from group memberships of the resolved
//! user name.

use std::path::Path;

use crate::error::{Error, Result};

/// A fully resolved process identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
    /// Gids of groups listing the user as a member, sorted.
    pub sgids: Vec<u32>,
}

#[derive(Debug)]
struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
}

#[derive(Debug)]
struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

/// Resolve a `user[:group]` spec against the rootfs databases.
///
/// An empty spec resolves to root the way the launcher would default it.
pub fn resolve(rootfs: &Path, user_spec: &str) -> Result<ResolvedUser> {
    let passwd = parse_passwd(rootfs);
    let groups = parse_groups(rootfs);

    let (user_part, group_part) = match user_spec.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (user_spec, None),
    };

    let matched = if user_part.is_empty() {
        None
    } else if let Ok(uid) = user_part.parse::<u32>() {
        // Numeric users resolve even without a passwd entry.
        Some(
            passwd
                .iter()
                .find(|entry| entry.uid == uid)
                .map(|entry| (entry.name.clone(), entry.uid, entry.gid))
                .unwrap_or((String::new(), uid, uid)),
        )
    } else {
        let entry = passwd
            .iter()
            .find(|entry| entry.name == user_part)
            .ok_or_else(|| {
                Error::InvalidConfig(format!("user {user_part:?} not found in container"))
            })?;
        Some((entry.name.clone(), entry.uid, entry.gid))
    };
    let (user_name, uid, mut gid) = matched.unwrap_or((String::new(), 0, 0));

    if let Some(group_part) = group_part.filter(|group| !group.is_empty()) {
        gid = if let Ok(gid) = group_part.parse::<u32>() {
            gid
        } else {
            groups
                .iter()
                .find(|entry| entry.name == group_part)
                .map(|entry| entry.gid)
                .ok_or_else(|| {
                    Error::InvalidConfig(format!("group {group_part:?} not found in container"))
                })?
        };
    }

    let mut sgids: Vec<u32> = if user_name.is_empty() {
        Vec::new()
    } else {
        groups
            .iter()
            .filter(|entry| entry.members.iter().any(|member| member == &user_name))
            .map(|entry| entry.gid)
            .collect()
    };
    sgids.sort_unstable();
    sgids.dedup();

    Ok(ResolvedUser { uid, gid, sgids })
}

fn parse_passwd(rootfs: &Path) -> Vec<PasswdEntry> {
    let raw = std::fs::read_to_string(rootfs.join("etc/passwd")).unwrap_or_default();
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?.to_string();
            let _password = fields.next()?;
            let uid = fields.next()?.parse().ok()?;
            let gid = fields.next()?.parse().ok()?;
            Some(PasswdEntry { name, uid, gid })
        })
        .collect()
}

fn parse_groups(rootfs: &Path) -> Vec<GroupEntry> {
    let raw = std::fs::read_to_string(rootfs.join("etc/group")).unwrap_or_default();
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?.to_string();
            let _password = fields.next()?;
            let gid = fields.next()?.parse().ok()?;
            let members = fields
                .next()
                .map(|members| {
                    members
                        .split(',')
                        .filter(|member| !member.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(GroupEntry { name, gid, members })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rootfs_with_databases() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\n\
             app:x:1000:1000::/home/app:/bin/sh\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("etc/group"),
            "root:x:0:\n\
             app:x:1000:\n\
             audio:x:63:app,other\n\
             video:x:39:app\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn names_resolve_with_memberships() {
        let rootfs = rootfs_with_databases();
        let resolved = resolve(rootfs.path(), "app").unwrap();
        assert_eq!(resolved.uid, 1000);
        assert_eq!(resolved.gid, 1000);
        assert_eq!(resolved.sgids, vec![39, 63]);
    }

    #[test]
    fn explicit_group_overrides_the_passwd_gid() {
        let rootfs = rootfs_with_databases();
        let resolved = resolve(rootfs.path(), "app:audio").unwrap();
        assert_eq!(resolved.uid, 1000);
        assert_eq!(resolved.gid, 63);
    }

    #[test]
    fn numeric_specs_tolerate_absent_databases() {
        let empty = tempfile::tempdir().unwrap();
        let resolved = resolve(empty.path(), "1000:2000").unwrap();
        assert_eq!(resolved.uid, 1000);
        assert_eq!(resolved.gid, 2000);
        assert!(resolved.sgids.is_empty());
    }

    #[test]
    fn unknown_names_are_invalid_config() {
        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve(empty.path(), "nobody"),
            Err(Error::InvalidConfig(_))
        ));
        let rootfs = rootfs_with_databases();
        assert!(matches!(
            resolve(rootfs.path(), "app:nogroup"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn empty_spec_defaults_to_root() {
        let empty = tempfile::tempdir().unwrap();
        assert_eq!(resolve(empty.path(), "").unwrap(), ResolvedUser::default());
    }

    #[test]
    fn numeric_user_with_passwd_entry_inherits_its_gid() {
        let rootfs = rootfs_with_databases();
        let resolved = resolve(rootfs.path(), "1000").unwrap();
        assert_eq!(resolved.gid, 1000);
        assert_eq!(resolved.sgids, vec![39, 63]);
    }
}
