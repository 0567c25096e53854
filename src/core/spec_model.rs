//! The typed representation of the OCI config document (`config.json`) and
//! of the runtime's own persisted container state.
//!
//! Loading tolerates unknown fields: a missing `linux.resources` section
//! simply means no limits get written later (the cgroup controller treats
//! absence as "nothing to apply"), not a load failure.

use std::path::{Path, PathBuf};

use oci_spec::runtime::Spec;
use serde::{Deserialize, Serialize};

use super::error::{Error, ErrorKind, Result};

pub const OCI_VERSION: &str = "1.0.2";

/// Load `<bundle>/config.json`.
pub fn load_spec(bundle: &Path) -> Result<Spec> {
    let path = bundle.join("config.json");
    Spec::load(&path).map_err(|e| {
        Error::new("load_spec", ErrorKind::InvalidConfig).with_source(OciSpecErrorWrap(e))
    })
}

/// `oci_spec::OciSpecError` doesn't implement `std::error::Error` the way
/// our error taxonomy wants to wrap things (it already does, but we keep
/// a thin newtype so the wrapping stays readable from the call site).
#[derive(Debug)]
struct OciSpecErrorWrap(oci_spec::OciSpecError);

impl std::fmt::Display for OciSpecErrorWrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OciSpecErrorWrap {}

/// Build the minimal rootful default spec: conventional mount list, masked
/// paths, and device allow-list (spec.md §4.2, §4.5, §4.6).
///
/// `rootless` additionally populates a user namespace with an identity
/// mapping of the invoking uid/gid (spec.md §9 Non-goals allow "passing a
/// provided mapping to the kernel" — we never *compute* a subuid/subgid
/// range, we just map 1:1 the caller's own id).
pub fn default_spec(rootless: bool) -> Result<Spec> {
    use oci_spec::runtime::{
        LinuxBuilder, LinuxDeviceCgroupBuilder, LinuxIdMappingBuilder, LinuxNamespaceBuilder,
        LinuxNamespaceType, LinuxResourcesBuilder, MountBuilder, ProcessBuilder, RootBuilder,
        SpecBuilder, UserBuilder,
    };

    let mounts = vec![
        MountBuilder::default()
            .destination(PathBuf::from("/proc"))
            .typ("proc")
            .source(PathBuf::from("proc"))
            .build()
            .map_err(builder_err)?,
        MountBuilder::default()
            .destination(PathBuf::from("/dev"))
            .typ("tmpfs")
            .source(PathBuf::from("tmpfs"))
            .options(vec![
                "nosuid".into(),
                "strictatime".into(),
                "mode=755".into(),
                "size=65536k".into(),
            ])
            .build()
            .map_err(builder_err)?,
        MountBuilder::default()
            .destination(PathBuf::from("/dev/pts"))
            .typ("devpts")
            .source(PathBuf::from("devpts"))
            .options(vec![
                "nosuid".into(),
                "noexec".into(),
                "newinstance".into(),
                "ptmxmode=0666".into(),
                "mode=0620".into(),
            ])
            .build()
            .map_err(builder_err)?,
        MountBuilder::default()
            .destination(PathBuf::from("/dev/shm"))
            .typ("tmpfs")
            .source(PathBuf::from("shm"))
            .options(vec![
                "nosuid".into(),
                "noexec".into(),
                "nodev".into(),
                "mode=1777".into(),
                "size=65536k".into(),
            ])
            .build()
            .map_err(builder_err)?,
        MountBuilder::default()
            .destination(PathBuf::from("/dev/mqueue"))
            .typ("mqueue")
            .source(PathBuf::from("mqueue"))
            .options(vec!["nosuid".into(), "noexec".into(), "nodev".into()])
            .build()
            .map_err(builder_err)?,
        MountBuilder::default()
            .destination(PathBuf::from("/sys"))
            .typ("sysfs")
            .source(PathBuf::from("sysfs"))
            .options(vec![
                "nosuid".into(),
                "noexec".into(),
                "nodev".into(),
                "ro".into(),
            ])
            .build()
            .map_err(builder_err)?,
        MountBuilder::default()
            .destination(PathBuf::from("/sys/fs/cgroup"))
            .typ("cgroup")
            .source(PathBuf::from("cgroup"))
            .options(vec![
                "nosuid".into(),
                "noexec".into(),
                "nodev".into(),
                "relatime".into(),
                "ro".into(),
            ])
            .build()
            .map_err(builder_err)?,
    ];

    let masked_paths = vec![
        "/proc/acpi".into(),
        "/proc/asound".into(),
        "/proc/kcore".into(),
        "/proc/keys".into(),
        "/proc/latency_stats".into(),
        "/proc/timer_list".into(),
        "/proc/timer_stats".into(),
        "/proc/sched_debug".into(),
        "/sys/firmware".into(),
        "/proc/scsi".into(),
    ];
    let readonly_paths = vec![
        "/proc/bus".into(),
        "/proc/fs".into(),
        "/proc/irq".into(),
        "/proc/sys".into(),
        "/proc/sysrq-trigger".into(),
    ];

    let default_devices = ["c:1:3", "c:1:5", "c:1:8", "c:1:9", "c:5:0", "c:5:1", "c:10:200"];
    let device_cgroup_rules: Result<Vec<_>> = default_devices
        .iter()
        .map(|spec| {
            let parts: Vec<&str> = spec.splitn(3, ':').collect();
            LinuxDeviceCgroupBuilder::default()
                .allow(true)
                .typ(oci_spec::runtime::LinuxDeviceType::try_from(parts[0]).unwrap())
                .major(parts[1].parse::<i64>().unwrap())
                .minor(parts[2].parse::<i64>().unwrap())
                .access("rwm")
                .build()
                .map_err(builder_err)
        })
        .collect();

    let mut namespaces = vec![
        LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Pid)
            .build()
            .map_err(builder_err)?,
        LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Network)
            .build()
            .map_err(builder_err)?,
        LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Ipc)
            .build()
            .map_err(builder_err)?,
        LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Uts)
            .build()
            .map_err(builder_err)?,
        LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Mount)
            .build()
            .map_err(builder_err)?,
    ];

    if rootless {
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::User)
                .build()
                .map_err(builder_err)?,
        );
    }

    let mut linux_builder = LinuxBuilder::default();
    linux_builder
        .namespaces(namespaces)
        .masked_paths(masked_paths)
        .readonly_paths(readonly_paths)
        .resources(
            LinuxResourcesBuilder::default()
                .devices(device_cgroup_rules?)
                .build()
                .map_err(builder_err)?,
        );

    if rootless {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let id_map = |id: u32| {
            LinuxIdMappingBuilder::default()
                .container_id(0u32)
                .host_id(id)
                .size(1u32)
                .build()
                .map_err(builder_err)
        };
        linux_builder
            .uid_mappings(vec![id_map(uid)?])
            .gid_mappings(vec![id_map(gid)?]);
    }

    let spec = SpecBuilder::default()
        .version(OCI_VERSION)
        .root(
            RootBuilder::default()
                .path("rootfs")
                .readonly(false)
                .build()
                .map_err(builder_err)?,
        )
        .hostname("craterun")
        .mounts(mounts)
        .process(
            ProcessBuilder::default()
                .terminal(false)
                .user(UserBuilder::default().uid(0u32).gid(0u32).build().map_err(builder_err)?)
                .args(vec!["sh".to_string()])
                .cwd("/")
                .env(vec![
                    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into(),
                    "TERM=xterm".into(),
                ])
                .no_new_privileges(true)
                .build()
                .map_err(builder_err)?,
        )
        .linux(linux_builder.build().map_err(builder_err)?)
        .build()
        .map_err(builder_err)?;

    Ok(spec)
}

fn builder_err(e: impl std::fmt::Display) -> Error {
    Error::msg("default_spec", ErrorKind::Internal, e)
}

/// Status of a container, per spec.md §3: `creating -> created -> running ->
/// stopped`, monotonic, no back-edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Creating => "creating",
            Status::Created => "created",
            Status::Running => "running",
            Status::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Internal persisted state (`state.json`). A superset of the public OCI
/// state JSON: adds `created`, `rootfs`, `owner` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "ociVersion")]
    pub oci_version: String,
    pub id: String,
    pub status: Status,
    pub pid: u32,
    pub bundle: String,
    #[serde(default)]
    pub annotations: std::collections::BTreeMap<String, String>,
    pub created: chrono::DateTime<chrono::Utc>,
    pub rootfs: String,
    #[serde(default)]
    pub owner: String,
}

impl ContainerState {
    pub fn new(id: &str, bundle: &Path, rootfs: &Path) -> Self {
        ContainerState {
            oci_version: OCI_VERSION.to_string(),
            id: id.to_string(),
            status: Status::Creating,
            pid: 0,
            bundle: bundle.display().to_string(),
            annotations: Default::default(),
            created: chrono::Utc::now(),
            rootfs: rootfs.display().to_string(),
            owner: String::new(),
        }
    }

    /// Project to the public OCI `state.json` wire shape (spec.md §6).
    pub fn to_oci_json(&self) -> serde_json::Value {
        serde_json::json!({
            "ociVersion": self.oci_version,
            "id": self.id,
            "status": self.status.to_string(),
            "pid": self.pid,
            "bundle": self.bundle,
            "annotations": self.annotations,
        })
    }
}

/// Parse a `memory.swap`-style conversion: OCI `swap` names *total*
/// memory+swap; the cgroup v2 `memory.swap.max` file wants swap-only bytes.
/// spec.md §4.3 and §9 preserve the historical (partially non-compliant)
/// subtraction behavior rather than "fixing" it silently.
pub fn swap_only_bytes(limit: i64, swap: i64) -> i64 {
    (swap - limit).max(0)
}

pub fn read_spec_from_dir(bundle: &Path, id: &str) -> Result<Spec> {
    load_spec(bundle).map_err(|e| e.with_id(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_matches_wire_values() {
        assert_eq!(Status::Creating.to_string(), "creating");
        assert_eq!(Status::Created.to_string(), "created");
        assert_eq!(Status::Running.to_string(), "running");
        assert_eq!(Status::Stopped.to_string(), "stopped");
    }

    #[test]
    fn state_round_trips_through_json() {
        let state = ContainerState::new("abc", Path::new("/bundle"), Path::new("/bundle/rootfs"));
        let json = serde_json::to_string(&state).unwrap();
        let back: ContainerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "abc");
        assert_eq!(back.bundle, "/bundle");
        assert_eq!(back.rootfs, "/bundle/rootfs");
    }

    #[test]
    fn swap_conversion_clamps_to_zero() {
        assert_eq!(swap_only_bytes(100, 50), 0);
        assert_eq!(swap_only_bytes(100, 150), 50);
    }
}
