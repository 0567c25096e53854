//! cgroup v2 unified hierarchy resource control (spec.md §4.3).
//!
//! Backend is cgroup v2 only, mounted at `/sys/fs/cgroup`. No v1 fallback
//! (spec.md §1 Non-goals).

use std::fs;
use std::path::{Path, PathBuf};

use oci_spec::runtime::LinuxResources;
use tracing::warn;

use crate::core::error::{Context as _, Error, ErrorKind, Result};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CRATERUN_PREFIX: &str = "craterun";

/// Resolved limits the controller knows how to apply; a thin mirror of
/// `oci_spec::runtime::LinuxResources` so callers don't need to hand the
/// whole `Spec` down into this module.
#[derive(Debug, Default, Clone)]
pub struct ResourceLimits {
    pub memory_limit: Option<i64>,
    pub memory_reservation: Option<i64>,
    pub memory_swap: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub cpu_cpus: Option<String>,
    pub cpu_mems: Option<String>,
    pub pids_limit: Option<i64>,
    pub unified: std::collections::BTreeMap<String, String>,
}

impl From<&LinuxResources> for ResourceLimits {
    fn from(res: &LinuxResources) -> Self {
        let memory = res.memory().as_ref();
        let cpu = res.cpu().as_ref();
        ResourceLimits {
            memory_limit: memory.and_then(|m| *m.limit()),
            memory_reservation: memory.and_then(|m| *m.reservation()),
            memory_swap: memory.and_then(|m| *m.swap()),
            cpu_quota: cpu.and_then(|c| *c.quota()),
            cpu_period: cpu.and_then(|c| *c.period()),
            cpu_shares: cpu.and_then(|c| *c.shares()),
            cpu_cpus: cpu.and_then(|c| c.cpus().clone()),
            cpu_mems: cpu.and_then(|c| c.mems().clone()),
            pids_limit: res.pids().as_ref().map(|p| p.limit()),
            unified: res
                .unified()
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect(),
        }
    }
}

/// Convert an optional `linux.resources` section into the flat table this
/// module applies. Absence means nothing gets written (spec.md §4.2).
pub fn resource_limits_from(resources: Option<&LinuxResources>) -> ResourceLimits {
    resources.map(ResourceLimits::from).unwrap_or_default()
}

/// The default cgroup path for a container with no config-supplied
/// `cgroupsPath`: `/sys/fs/cgroup/craterun/<id>` (spec.md §3).
pub fn cgroup_path(container_id: &str) -> PathBuf {
    Path::new(CGROUP_ROOT).join(CRATERUN_PREFIX).join(container_id)
}

/// Resolve the cgroup path to use: the config's `linux.cgroupsPath` if
/// present (interpreted relative to the unified hierarchy root), else the
/// default `craterun/<id>` (spec.md §3).
pub fn resolve_cgroup_path(configured: Option<&str>, container_id: &str) -> PathBuf {
    match configured {
        Some(p) if !p.is_empty() => Path::new(CGROUP_ROOT).join(p.trim_start_matches('/')),
        _ => cgroup_path(container_id),
    }
}

/// `NewCgroup`: create the directory recursively and enable controllers in
/// every ancestor's `cgroup.subtree_control` (best-effort).
pub fn new_cgroup(path: &Path, id: &str) -> Result<()> {
    let mut ancestor = PathBuf::from(CGROUP_ROOT);
    for component in path
        .strip_prefix(CGROUP_ROOT)
        .unwrap_or(path)
        .components()
    {
        ancestor.push(component);
        if ancestor == path {
            break;
        }
        if !ancestor.exists() {
            fs::create_dir_all(&ancestor).ctx_id("new_cgroup", ErrorKind::Cgroup, id)?;
        }
        if let Err(e) = enable_controllers(&ancestor) {
            warn!(id, error = %e, "failed to enable controllers in parent cgroup");
        }
    }

    fs::create_dir_all(path).ctx_id("new_cgroup", ErrorKind::Cgroup, id)?;
    Ok(())
}

/// Apply the resource-limit table from spec.md §4.3.
pub fn apply_limits(cgroup: &Path, limits: &ResourceLimits, id: &str) -> Result<()> {
    if let Some(mem) = limits.memory_limit {
        write_cgroup_file(cgroup, "memory.max", &mem.to_string(), id)?;
    }
    if let Some(low) = limits.memory_reservation {
        write_cgroup_file(cgroup, "memory.low", &low.to_string(), id)?;
    }
    if let (Some(swap), Some(limit)) = (limits.memory_swap, limits.memory_limit) {
        let swap_only = crate::core::spec_model::swap_only_bytes(limit, swap);
        if let Err(e) = write_cgroup_file(cgroup, "memory.swap.max", &swap_only.to_string(), id) {
            warn!(id = %id, error = %e, "failed to set memory.swap.max");
        }
    }
    if limits.cpu_quota.is_some() || limits.cpu_period.is_some() {
        let quota = limits
            .cpu_quota
            .map(|q| q.to_string())
            .unwrap_or_else(|| "max".to_string());
        let period = limits.cpu_period.unwrap_or(100_000);
        write_cgroup_file(cgroup, "cpu.max", &format!("{quota} {period}"), id)?;
    }
    if let Some(shares) = limits.cpu_shares {
        let weight = cpu_shares_to_weight(shares);
        write_cgroup_file(cgroup, "cpu.weight", &weight.to_string(), id)?;
    }
    if let Some(cpus) = &limits.cpu_cpus {
        write_cgroup_file(cgroup, "cpuset.cpus", cpus, id)?;
    }
    if let Some(mems) = &limits.cpu_mems {
        write_cgroup_file(cgroup, "cpuset.mems", mems, id)?;
    }
    if let Some(pids) = limits.pids_limit {
        if pids > 0 {
            write_cgroup_file(cgroup, "pids.max", &pids.to_string(), id)?;
        }
    }
    for (key, value) in &limits.unified {
        validate_unified_key(key)?;
        write_cgroup_file(cgroup, key, value, id)?;
    }

    Ok(())
}

/// `1 + (shares-2)*9999/262142`, clamped to `1..=10000` (spec.md §4.3).
fn cpu_shares_to_weight(shares: u64) -> u64 {
    if shares == 0 {
        return 100;
    }
    let shares = shares as i64;
    let weight = 1 + (shares - 2) * 9999 / 262142;
    weight.clamp(1, 10000) as u64
}

/// Mandatory security gate for `unified[key]` passthrough (spec.md §4.3):
/// non-empty, no path separators, not `.`/`..`, doesn't begin with `.`,
/// matches `^[A-Za-z][A-Za-z0-9]*(\.[A-Za-z][A-Za-z0-9]*)*$`.
fn validate_unified_key(key: &str) -> Result<()> {
    let invalid = || {
        Error::msg(
            "validate_unified_key",
            ErrorKind::InvalidConfig,
            format!("invalid unified cgroup key '{key}'"),
        )
    };

    if key.is_empty() || key == "." || key == ".." || key.contains('/') || key.starts_with('.') {
        return Err(invalid());
    }
    for segment in key.split('.') {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {}
            _ => return Err(invalid()),
        }
        if !chars.all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }
    }
    Ok(())
}

/// `AddProcess`: write a PID to `cgroup.procs`.
pub fn add_process(cgroup: &Path, pid: u32, id: &str) -> Result<()> {
    write_cgroup_file(cgroup, "cgroup.procs", &pid.to_string(), id)
}

/// `Freeze`/`Thaw`: write `1`/`0` to `cgroup.freeze`.
pub fn freeze(cgroup: &Path, id: &str) -> Result<()> {
    write_cgroup_file(cgroup, "cgroup.freeze", "1", id)
}

pub fn thaw(cgroup: &Path, id: &str) -> Result<()> {
    write_cgroup_file(cgroup, "cgroup.freeze", "0", id)
}

/// `Destroy`: remove the cgroup directory. Missing directory is a no-op.
pub fn destroy(path: &Path, id: &str) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_dir(path).ctx_id("destroy_cgroup", ErrorKind::Cgroup, id)
}

/// Controllers this runtime relies on (spec.md §4.1 step 3): `+cpu +memory
/// +pids +cpuset`. Only controllers actually listed as available in this
/// ancestor's `cgroup.controllers` are requested, since asking for one that
/// isn't there is an `EINVAL` on the `subtree_control` write.
const WANTED_CONTROLLERS: &[&str] = &["cpu", "memory", "pids", "cpuset"];

fn enable_controllers(path: &Path) -> Result<()> {
    let controllers_file = path.join("cgroup.controllers");
    if !controllers_file.exists() {
        return Ok(());
    }

    let available = fs::read_to_string(&controllers_file)
        .ctx("enable_controllers", ErrorKind::Cgroup)?;
    let available: std::collections::HashSet<&str> = available.split_whitespace().collect();
    let enable_str: String = WANTED_CONTROLLERS
        .iter()
        .filter(|c| available.contains(*c))
        .map(|c| format!("+{c}"))
        .collect::<Vec<_>>()
        .join(" ");

    if !enable_str.is_empty() {
        let subtree = path.join("cgroup.subtree_control");
        fs::write(&subtree, &enable_str).ctx("enable_controllers", ErrorKind::Cgroup)?;
    }
    Ok(())
}

fn write_cgroup_file(cgroup: &Path, filename: &str, value: &str, id: &str) -> Result<()> {
    let file = cgroup.join(filename);
    fs::write(&file, value).ctx_id("write_cgroup_file", ErrorKind::Cgroup, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_shares_conversion_matches_table() {
        assert_eq!(cpu_shares_to_weight(2), 1);
        assert_eq!(cpu_shares_to_weight(262144), 10000);
        assert_eq!(cpu_shares_to_weight(0), 100);
    }

    #[test]
    fn unified_key_validation_accepts_dotted_names() {
        assert!(validate_unified_key("memory.max").is_ok());
        assert!(validate_unified_key("cpu.weight").is_ok());
    }

    #[test]
    fn unified_key_validation_rejects_traversal_and_leading_dot() {
        assert!(validate_unified_key("").is_err());
        assert!(validate_unified_key(".").is_err());
        assert!(validate_unified_key("..").is_err());
        assert!(validate_unified_key("../escape").is_err());
        assert!(validate_unified_key(".hidden").is_err());
        assert!(validate_unified_key("a/b").is_err());
        assert!(validate_unified_key("1abc").is_err());
    }

    #[test]
    fn cgroup_path_is_under_craterun_prefix() {
        let path = cgroup_path("abc123");
        assert_eq!(path, Path::new("/sys/fs/cgroup/craterun/abc123"));
    }
}
