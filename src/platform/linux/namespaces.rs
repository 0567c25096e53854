//! Linux namespace primitives (spec.md §4.4).
//!
//! Seven namespace kinds are supported: pid, mount, uts, ipc, network,
//! user, cgroup. A namespace listed in the config without a `path` becomes
//! a `CLONE_NEW*` flag on the child; one listed with a `path` is instead
//! joined after the child starts, via `setns`.

use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;
use oci_spec::runtime::{LinuxIdMapping, LinuxNamespace, LinuxNamespaceType};
use tracing::warn;

use crate::core::error::{Context as _, ErrorKind, Result};

fn clone_flag_for(typ: LinuxNamespaceType) -> CloneFlags {
    match typ {
        LinuxNamespaceType::Pid => CloneFlags::CLONE_NEWPID,
        LinuxNamespaceType::Network => CloneFlags::CLONE_NEWNET,
        LinuxNamespaceType::Mount => CloneFlags::CLONE_NEWNS,
        LinuxNamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
        LinuxNamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
        LinuxNamespaceType::User => CloneFlags::CLONE_NEWUSER,
        LinuxNamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
    }
}

/// Default namespace set when the config has no `linux` section at all
/// (spec.md §4.4): pid, mount, uts, ipc, network.
pub fn default_clone_flags() -> CloneFlags {
    CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWNET
}

/// A namespace requested via a path, to be joined with `setns` after the
/// child process exists, rather than via a clone flag.
#[derive(Debug, Clone)]
pub struct PathNamespace {
    pub typ: LinuxNamespaceType,
    pub path: PathBuf,
}

/// Split the config's namespace list into clone flags (no path) and
/// path-joined namespaces (setns targets), per spec.md §4.4.
pub fn partition_namespaces(
    namespaces: &[LinuxNamespace],
) -> (CloneFlags, Vec<PathNamespace>) {
    let mut flags = CloneFlags::empty();
    let mut path_namespaces = Vec::new();

    for ns in namespaces {
        match ns.path() {
            Some(path) => path_namespaces.push(PathNamespace {
                typ: ns.typ(),
                path: path.clone(),
            }),
            None => flags |= clone_flag_for(ns.typ()),
        }
    }

    (flags, path_namespaces)
}

/// Join a namespace by path (`setns`), used for the child's own entry into
/// namespaces that were supplied with a `path` in the config.
pub fn join_namespace(ns: &PathNamespace) -> Result<()> {
    let file = fs::File::open(&ns.path).ctx("join_namespace", ErrorKind::Namespace)?;
    let ns_type = match ns.typ {
        LinuxNamespaceType::Pid => nix::sched::CloneFlags::CLONE_NEWPID,
        LinuxNamespaceType::Network => nix::sched::CloneFlags::CLONE_NEWNET,
        LinuxNamespaceType::Mount => nix::sched::CloneFlags::CLONE_NEWNS,
        LinuxNamespaceType::Ipc => nix::sched::CloneFlags::CLONE_NEWIPC,
        LinuxNamespaceType::Uts => nix::sched::CloneFlags::CLONE_NEWUTS,
        LinuxNamespaceType::User => nix::sched::CloneFlags::CLONE_NEWUSER,
        LinuxNamespaceType::Cgroup => nix::sched::CloneFlags::CLONE_NEWCGROUP,
    };
    nix::sched::setns(file.as_raw_fd(), ns_type).ctx("join_namespace", ErrorKind::Namespace)?;
    Ok(())
}

/// `unshare(2)` with the given flags, for the in-process fallback path
/// (used by `exec`, which joins namespaces of an already-running
/// container rather than creating new ones).
pub fn unshare_namespaces(flags: CloneFlags) -> Result<()> {
    nix::sched::unshare(flags).ctx("unshare_namespaces", ErrorKind::Namespace)
}

pub fn set_hostname(name: &str) -> Result<()> {
    nix::unistd::sethostname(name).ctx("set_hostname", ErrorKind::Namespace)
}

/// Place the calling process in a new session (spec.md §4.4: "every child
/// is placed in a new session").
pub fn setsid() -> Result<()> {
    nix::unistd::setsid().ctx("setsid", ErrorKind::Namespace)?;
    Ok(())
}

/// Write uid/gid mappings for a newly user-namespaced child (spec.md
/// §4.4). `setgroups` is disabled before the `gid_map` write, since the
/// kernel otherwise refuses an unprivileged gid-map write.
///
/// The independent "unshare the mount namespace" flag must not be combined
/// with this (per spec.md §4.4's caveat about EPERM); that constraint is
/// enforced by the caller choosing its clone flags — this function only
/// performs the mapping writes.
pub fn write_id_mappings(
    pid: i32,
    uid_mappings: &[LinuxIdMapping],
    gid_mappings: &[LinuxIdMapping],
) -> Result<()> {
    if !uid_mappings.is_empty() {
        write_map_file(&format!("/proc/{pid}/uid_map"), uid_mappings)?;
    }
    if !gid_mappings.is_empty() {
        if let Err(e) = fs::write(format!("/proc/{pid}/setgroups"), "deny") {
            warn!(pid, error = %e, "failed to write setgroups=deny before gid_map");
        }
        write_map_file(&format!("/proc/{pid}/gid_map"), gid_mappings)?;
    }
    Ok(())
}

fn write_map_file(path: &str, mappings: &[LinuxIdMapping]) -> Result<()> {
    let body: String = mappings
        .iter()
        .map(|m| format!("{} {} {}\n", m.container_id(), m.host_id(), m.size()))
        .collect();
    fs::write(Path::new(path), body).ctx("write_id_mappings", ErrorKind::Namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::LinuxNamespaceBuilder;

    #[test]
    fn default_flags_match_spec_set() {
        let flags = default_clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn partitions_pathless_namespaces_into_flags() {
        let namespaces = vec![
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Pid)
                .build()
                .unwrap(),
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Network)
                .build()
                .unwrap(),
        ];
        let (flags, path_ns) = partition_namespaces(&namespaces);
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(path_ns.is_empty());
    }

    #[test]
    fn partitions_path_namespaces_separately() {
        let namespaces = vec![LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Network)
            .path(PathBuf::from("/var/run/netns/foo"))
            .build()
            .unwrap()];
        let (flags, path_ns) = partition_namespaces(&namespaces);
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert_eq!(path_ns.len(), 1);
        assert_eq!(path_ns[0].path, PathBuf::from("/var/run/netns/foo"));
    }
}
