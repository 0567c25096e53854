//! Rootfs construction (spec.md §4.5): the nine-step algorithm that turns
//! an extracted bundle directory into the container's mount namespace, plus
//! the mount-option-token parser it depends on.

use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use oci_spec::runtime::{Linux, Mount, Root};
use tracing::warn;

use crate::core::error::{Context as _, Error, ErrorKind, Result};
use crate::platform::linux::secure_path::secure_join;

/// Parsed form of an OCI mount's `options` list (spec.md §4.5.1's table):
/// flag bits plus a comma-joined data string for whatever doesn't map to a
/// flag (passed through to the kernel as mount data).
pub struct ParsedOptions {
    pub flags: MsFlags,
    pub data: String,
    pub rec: bool,
}

pub fn parse_mount_options(options: &[String]) -> ParsedOptions {
    let mut flags = MsFlags::empty();
    let mut rec = false;
    let mut data_tokens = Vec::new();

    for opt in options {
        match opt.as_str() {
            "ro" => flags.insert(MsFlags::MS_RDONLY),
            "rw" => flags.remove(MsFlags::MS_RDONLY),
            "bind" => flags.insert(MsFlags::MS_BIND),
            "rbind" => {
                flags.insert(MsFlags::MS_BIND);
                rec = true;
            }
            "nosuid" => flags.insert(MsFlags::MS_NOSUID),
            "suid" => flags.remove(MsFlags::MS_NOSUID),
            "private" => flags.insert(MsFlags::MS_PRIVATE),
            "rprivate" => {
                flags.insert(MsFlags::MS_PRIVATE);
                rec = true;
            }
            "nodev" => flags.insert(MsFlags::MS_NODEV),
            "dev" => flags.remove(MsFlags::MS_NODEV),
            "shared" => flags.insert(MsFlags::MS_SHARED),
            "rshared" => {
                flags.insert(MsFlags::MS_SHARED);
                rec = true;
            }
            "noexec" => flags.insert(MsFlags::MS_NOEXEC),
            "exec" => flags.remove(MsFlags::MS_NOEXEC),
            "slave" => flags.insert(MsFlags::MS_SLAVE),
            "rslave" => {
                flags.insert(MsFlags::MS_SLAVE);
                rec = true;
            }
            "sync" => flags.insert(MsFlags::MS_SYNCHRONOUS),
            "async" => flags.remove(MsFlags::MS_SYNCHRONOUS),
            "unbindable" => flags.insert(MsFlags::MS_UNBINDABLE),
            "runbindable" => {
                flags.insert(MsFlags::MS_UNBINDABLE);
                rec = true;
            }
            "relatime" => flags.insert(MsFlags::MS_RELATIME),
            "noatime" => flags.insert(MsFlags::MS_NOATIME),
            "strictatime" => flags.insert(MsFlags::MS_STRICTATIME),
            other => data_tokens.push(other.to_string()),
        }
    }

    ParsedOptions {
        flags,
        data: data_tokens.join(","),
        rec,
    }
}

fn data_opt(data: &str) -> Option<&str> {
    if data.is_empty() {
        None
    } else {
        Some(data)
    }
}

/// Step 2: recursively mark `/` mount propagation as private. Best-effort.
pub fn make_root_private(id: &str) {
    if let Err(e) = mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    ) {
        warn!(id = %id, error = %e, "failed to make / private recursively");
    }
}

/// Step 3: bind-mount the rootfs over itself, the precondition for
/// `pivot_root`.
pub fn bind_mount_rootfs(rootfs: &Path, id: &str) -> Result<()> {
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .ctx_id("bind_mount_rootfs", ErrorKind::Rootfs, id)
}

/// Step 4: apply one declared mount from the config.
pub fn apply_mount(rootfs: &Path, m: &Mount, id: &str) -> Result<()> {
    let dest_str = m.destination().to_string_lossy();
    let dest = secure_join(rootfs, &dest_str).map_err(|e| e.with_id(id))?;
    let parsed = parse_mount_options(m.options().clone().unwrap_or_default().as_slice());
    let typ = m.typ().clone().unwrap_or_default();
    let source_path = m.source().clone().unwrap_or_default();

    if parsed.flags.contains(MsFlags::MS_BIND) {
        if source_path.is_dir() {
            fs::create_dir_all(&dest).ctx_id("apply_mount", ErrorKind::Rootfs, id)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).ctx_id("apply_mount", ErrorKind::Rootfs, id)?;
            }
            fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&dest)
                .ctx_id("apply_mount", ErrorKind::Rootfs, id)?;
        }

        let mut flags = parsed.flags;
        if parsed.rec {
            flags.insert(MsFlags::MS_REC);
        }
        mount(Some(&source_path), &dest, Some(typ.as_str()), flags, data_opt(&parsed.data))
            .ctx_id("apply_mount", ErrorKind::Rootfs, id)?;
    } else {
        fs::create_dir_all(&dest).ctx_id("apply_mount", ErrorKind::Rootfs, id)?;
        let source_str = source_path.to_string_lossy();
        if let Err(e) = mount(
            Some(source_str.as_ref()),
            &dest,
            Some(typ.as_str()),
            parsed.flags,
            data_opt(&parsed.data),
        ) {
            warn!(id = %id, dest = %dest.display(), error = %e, "non-bind mount failed (treated as non-fatal)");
        }
    }

    Ok(())
}

/// Step 5: `pivot_root`, falling back to `chroot` when unavailable
/// (e.g. rootless).
pub fn pivot_or_chroot(rootfs: &Path, no_pivot: bool, id: &str) -> Result<()> {
    if no_pivot {
        nix::unistd::chroot(rootfs).ctx_id("pivot_or_chroot", ErrorKind::Rootfs, id)?;
        nix::unistd::chdir("/").ctx_id("pivot_or_chroot", ErrorKind::Rootfs, id)?;
        return Ok(());
    }

    let put_old = rootfs.join(".old_root");
    fs::create_dir_all(&put_old).ctx_id("pivot_or_chroot", ErrorKind::Rootfs, id)?;

    match nix::unistd::pivot_root(rootfs, &put_old) {
        Ok(()) => {
            nix::unistd::chdir("/").ctx_id("pivot_or_chroot", ErrorKind::Rootfs, id)?;
            umount2("/.old_root", MntFlags::MNT_DETACH)
                .ctx_id("pivot_or_chroot", ErrorKind::Rootfs, id)?;
            let _ = fs::remove_dir("/.old_root");
        }
        Err(_) => {
            nix::unistd::chroot(rootfs).ctx_id("pivot_or_chroot", ErrorKind::Rootfs, id)?;
            nix::unistd::chdir("/").ctx_id("pivot_or_chroot", ErrorKind::Rootfs, id)?;
        }
    }
    Ok(())
}

/// Step 6: remount `/` readonly if the config's root is marked so.
pub fn remount_root_readonly(id: &str) -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .ctx_id("remount_root_readonly", ErrorKind::Rootfs, id)
}

/// Step 8: mask a path — a size-0 read-only tmpfs over directories, or
/// `/dev/null` bind-mounted over files. Missing paths are silently skipped.
pub fn mask_path(path: &str, id: &str) -> Result<()> {
    let p = Path::new(path);
    if !p.exists() {
        return Ok(());
    }
    if p.is_dir() {
        mount(
            Some("tmpfs"),
            p,
            Some("tmpfs"),
            MsFlags::MS_RDONLY,
            Some("size=0"),
        )
        .ctx_id("mask_path", ErrorKind::Rootfs, id)
    } else {
        mount(
            Some("/dev/null"),
            p,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .ctx_id("mask_path", ErrorKind::Rootfs, id)
    }
}

/// Step 9: bind a readonly path to itself, then remount it readonly
/// recursively. Missing paths are silently skipped.
pub fn readonly_path(path: &str, id: &str) -> Result<()> {
    let p = Path::new(path);
    if !p.exists() {
        return Ok(());
    }
    mount(Some(p), p, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        .ctx_id("readonly_path", ErrorKind::Rootfs, id)?;
    mount(
        None::<&str>,
        p,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY | MsFlags::MS_REC,
        None::<&str>,
    )
    .ctx_id("readonly_path", ErrorKind::Rootfs, id)
}

/// Run the full rootfs-build algorithm (spec.md §4.5 steps 1-9) against an
/// already namespace-isolated child. Returns the pre-pivot absolute rootfs
/// path for logging only — by the time this returns, `pivot_or_chroot` has
/// already run and that path no longer resolves (pivot) or resolves to
/// something else entirely (chroot fallback). Callers needing the rootfs
/// after this call returns must address `/`, the new root, instead.
pub fn build_rootfs(
    root: &Root,
    bundle: &Path,
    linux: Option<&Linux>,
    mounts: &[Mount],
    no_pivot: bool,
    id: &str,
) -> Result<PathBuf> {
    let rootfs = bundle.join(root.path());
    let rootfs = fs::canonicalize(&rootfs).ctx_id("build_rootfs", ErrorKind::Rootfs, id)?;

    make_root_private(id);
    bind_mount_rootfs(&rootfs, id)?;

    for m in mounts {
        apply_mount(&rootfs, m, id)?;
    }

    pivot_or_chroot(&rootfs, no_pivot, id)?;

    if root.readonly().unwrap_or(false) {
        remount_root_readonly(id)?;
    }

    if let Some(linux) = linux {
        if let Some(propagation) = linux.rootfs_propagation() {
            apply_rootfs_propagation(propagation, id)?;
        }
        for masked in linux.masked_paths().clone().unwrap_or_default() {
            if let Err(e) = mask_path(&masked, id) {
                warn!(id = %id, path = %masked, error = %e, "failed to mask path");
            }
        }
        for ro in linux.readonly_paths().clone().unwrap_or_default() {
            if let Err(e) = readonly_path(&ro, id) {
                warn!(id = %id, path = %ro, error = %e, "failed to set readonly path");
            }
        }
    }

    Ok(rootfs)
}

fn apply_rootfs_propagation(propagation: &str, id: &str) -> Result<()> {
    let flags = match propagation {
        "shared" => MsFlags::MS_SHARED | MsFlags::MS_REC,
        "slave" => MsFlags::MS_SLAVE | MsFlags::MS_REC,
        "private" => MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        "unbindable" => MsFlags::MS_UNBINDABLE | MsFlags::MS_REC,
        other => {
            return Err(Error::msg(
                "apply_rootfs_propagation",
                ErrorKind::InvalidConfig,
                format!("unknown rootfs propagation '{other}'"),
            )
            .with_id(id))
        }
    };
    mount(None::<&str>, "/", None::<&str>, flags, None::<&str>)
        .ctx_id("apply_rootfs_propagation", ErrorKind::Rootfs, id)
}

pub fn mount_tmpfs(dest: &Path, data: &str, id: &str) -> Result<()> {
    mount(
        Some("tmpfs"),
        dest,
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some(data),
    )
    .ctx_id("mount_tmpfs", ErrorKind::Device, id)
}

pub fn mount_devpts(dest: &Path, data: &str, id: &str) -> Result<()> {
    mount(
        Some("devpts"),
        dest,
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some(data),
    )
    .ctx_id("mount_devpts", ErrorKind::Device, id)
}

pub fn mount_shm(dest: &Path, data: &str, id: &str) -> Result<()> {
    mount(
        Some("shm"),
        dest,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        Some(data),
    )
    .ctx_id("mount_shm", ErrorKind::Device, id)
}

pub fn mount_mqueue(dest: &Path, id: &str) -> Result<()> {
    mount(
        Some("mqueue"),
        dest,
        Some("mqueue"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .ctx_id("mount_mqueue", ErrorKind::Device, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ro_and_bind_tokens_set_expected_flags() {
        let parsed = parse_mount_options(&["ro".into(), "bind".into(), "nosuid".into()]);
        assert!(parsed.flags.contains(MsFlags::MS_RDONLY));
        assert!(parsed.flags.contains(MsFlags::MS_BIND));
        assert!(parsed.flags.contains(MsFlags::MS_NOSUID));
        assert!(!parsed.rec);
    }

    #[test]
    fn rbind_sets_recursive_flag() {
        let parsed = parse_mount_options(&["rbind".into()]);
        assert!(parsed.flags.contains(MsFlags::MS_BIND));
        assert!(parsed.rec);
    }

    #[test]
    fn unknown_tokens_become_data() {
        let parsed = parse_mount_options(&["size=65536k".into(), "mode=755".into()]);
        assert_eq!(parsed.data, "size=65536k,mode=755");
    }

    #[test]
    fn rw_clears_readonly_flag() {
        let parsed = parse_mount_options(&["ro".into(), "rw".into()]);
        assert!(!parsed.flags.contains(MsFlags::MS_RDONLY));
    }
}
