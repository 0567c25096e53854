//! Linux capability application (spec.md §4.7), using the `caps` crate for
//! the capset/prctl plumbing instead of hand-rolling the bitmask syscalls.

use std::collections::HashSet;

use caps::{CapSet, Capability, CapsHashSet};
use oci_spec::runtime::LinuxCapabilities;
use tracing::warn;

use crate::core::error::{Error, ErrorKind, Result};

/// Canonical index -> name table, `CAP_CHOWN` = 0 .. `CAP_CHECKPOINT_RESTORE`
/// = 40 (spec.md §4.7).
const CAPABILITY_TABLE: &[(u8, Capability)] = &[
    (0, Capability::CAP_CHOWN),
    (1, Capability::CAP_DAC_OVERRIDE),
    (2, Capability::CAP_DAC_READ_SEARCH),
    (3, Capability::CAP_FOWNER),
    (4, Capability::CAP_FSETID),
    (5, Capability::CAP_KILL),
    (6, Capability::CAP_SETGID),
    (7, Capability::CAP_SETUID),
    (8, Capability::CAP_SETPCAP),
    (9, Capability::CAP_LINUX_IMMUTABLE),
    (10, Capability::CAP_NET_BIND_SERVICE),
    (11, Capability::CAP_NET_BROADCAST),
    (12, Capability::CAP_NET_ADMIN),
    (13, Capability::CAP_NET_RAW),
    (14, Capability::CAP_IPC_LOCK),
    (15, Capability::CAP_IPC_OWNER),
    (16, Capability::CAP_SYS_MODULE),
    (17, Capability::CAP_SYS_RAWIO),
    (18, Capability::CAP_SYS_CHROOT),
    (19, Capability::CAP_SYS_PTRACE),
    (20, Capability::CAP_SYS_PACCT),
    (21, Capability::CAP_SYS_ADMIN),
    (22, Capability::CAP_SYS_BOOT),
    (23, Capability::CAP_SYS_NICE),
    (24, Capability::CAP_SYS_RESOURCE),
    (25, Capability::CAP_SYS_TIME),
    (26, Capability::CAP_SYS_TTY_CONFIG),
    (27, Capability::CAP_MKNOD),
    (28, Capability::CAP_LEASE),
    (29, Capability::CAP_AUDIT_WRITE),
    (30, Capability::CAP_AUDIT_CONTROL),
    (31, Capability::CAP_SETFCAP),
    (32, Capability::CAP_MAC_OVERRIDE),
    (33, Capability::CAP_MAC_ADMIN),
    (34, Capability::CAP_SYSLOG),
    (35, Capability::CAP_WAKE_ALARM),
    (36, Capability::CAP_BLOCK_SUSPEND),
    (37, Capability::CAP_AUDIT_READ),
    (38, Capability::CAP_PERFMON),
    (39, Capability::CAP_BPF),
    (40, Capability::CAP_CHECKPOINT_RESTORE),
];

fn capability_by_index(index: u8) -> Option<Capability> {
    CAPABILITY_TABLE
        .iter()
        .find(|(i, _)| *i == index)
        .map(|(_, c)| *c)
}

/// Discover the highest capability number this kernel knows about, via
/// `/proc/sys/kernel/cap_last_cap`. Falls back to 40 (`CAP_CHECKPOINT_RESTORE`,
/// the newest capability this table knows) if the file can't be read.
fn last_cap() -> u8 {
    std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse::<u8>().ok())
        .unwrap_or(40)
}

fn parse_cap_list(names: &[String]) -> CapsHashSet {
    let mut set = CapsHashSet::new();
    for name in names {
        match name.parse::<Capability>() {
            Ok(cap) => {
                set.insert(cap);
            }
            Err(_) => warn!(capability = %name, "unknown capability name in config, ignoring"),
        }
    }
    set
}

/// Apply the config's capability sets to the calling (post-fork, pre-exec)
/// process, in the fixed order spec.md §4.7 requires.
pub fn apply_capabilities(caps_config: Option<&LinuxCapabilities>, id: &str) -> Result<()> {
    let empty: Vec<String> = Vec::new();
    let bounding = caps_config.and_then(|c| c.bounding().clone()).unwrap_or_else(|| empty.clone());
    let effective = caps_config.and_then(|c| c.effective().clone()).unwrap_or_else(|| empty.clone());
    let permitted = caps_config.and_then(|c| c.permitted().clone()).unwrap_or_else(|| empty.clone());
    let inheritable = caps_config.and_then(|c| c.inheritable().clone()).unwrap_or_else(|| empty.clone());
    let ambient = caps_config.and_then(|c| c.ambient().clone()).unwrap_or_else(|| empty.clone());

    let bounding_set = parse_cap_list(&bounding);
    let effective_set = parse_cap_list(&effective);
    let permitted_set = parse_cap_list(&permitted);
    let inheritable_set = parse_cap_list(&inheritable);
    let ambient_set = parse_cap_list(&ambient);

    // 1. Clear the ambient set.
    caps::clear(None, CapSet::Ambient)
        .map_err(|e| Error::msg("apply_capabilities", ErrorKind::Capability, e).with_id(id))?;

    // 2. Drop from the bounding set everything not in the configured list.
    let last = last_cap();
    for index in 0..=last {
        let Some(cap) = capability_by_index(index) else {
            continue;
        };
        if bounding_set.contains(&cap) {
            continue;
        }
        match caps::drop(None, CapSet::Bounding, cap) {
            Ok(()) => {}
            Err(e) if is_einval(&e) => {}
            Err(e) => {
                return Err(
                    Error::msg("apply_capabilities", ErrorKind::Capability, e).with_id(id)
                )
            }
        }
    }

    // 3. Set effective/permitted/inheritable via capset.
    caps::set(None, CapSet::Effective, &effective_set)
        .map_err(|e| Error::msg("apply_capabilities", ErrorKind::Capability, e).with_id(id))?;
    caps::set(None, CapSet::Permitted, &permitted_set)
        .map_err(|e| Error::msg("apply_capabilities", ErrorKind::Capability, e).with_id(id))?;
    caps::set(None, CapSet::Inheritable, &inheritable_set)
        .map_err(|e| Error::msg("apply_capabilities", ErrorKind::Capability, e).with_id(id))?;

    // 4. Raise ambient capabilities also present in permitted and inheritable.
    for cap in &ambient_set {
        if permitted_set.contains(cap) && inheritable_set.contains(cap) {
            match caps::raise(None, CapSet::Ambient, *cap) {
                Ok(()) => {}
                Err(e) if is_einval(&e) => {}
                Err(e) => {
                    return Err(
                        Error::msg("apply_capabilities", ErrorKind::Capability, e).with_id(id)
                    )
                }
            }
        }
    }

    Ok(())
}

fn is_einval(e: &caps::errors::CapsError) -> bool {
    e.to_string().to_lowercase().contains("invalid argument")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_table_covers_full_range() {
        let indices: HashSet<u8> = CAPABILITY_TABLE.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices.len(), 41);
        assert!(capability_by_index(0).is_some());
        assert!(capability_by_index(40).is_some());
        assert!(capability_by_index(41).is_none());
    }

    #[test]
    fn parse_cap_list_ignores_unknown_names() {
        let set = parse_cap_list(&["CAP_CHOWN".to_string(), "CAP_MADE_UP".to_string()]);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&Capability::CAP_CHOWN));
    }
}
