//! Device node creation and `/dev` population (spec.md §4.6).

use std::os::unix::fs::symlink;
use std::path::Path;

use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};
use oci_spec::runtime::{LinuxDevice, LinuxDeviceType};

use crate::core::error::{Context as _, Error, ErrorKind, Result};
use crate::platform::linux::rootfs;

/// Character devices the config or default set is allowed to create, plus
/// any device whose major is 136 (unix98 PTY slaves).
const ALLOWED_PATHS: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/full",
    "/dev/random",
    "/dev/urandom",
    "/dev/tty",
    "/dev/console",
    "/dev/ptmx",
];
const PTY_SLAVE_MAJOR: i64 = 136;

/// `(major, minor, type)` for the default device set created even when the
/// config doesn't list them (spec.md §4.6's `/dev` setup).
const DEFAULT_DEVICES: &[(&str, i64, i64)] = &[
    ("null", 1, 3),
    ("zero", 1, 5),
    ("full", 1, 7),
    ("random", 1, 8),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];

fn validate_device_path(path: &Path, major: i64) -> Result<()> {
    let cleaned = path.to_string_lossy();
    if !cleaned.starts_with("/dev/") {
        return Err(Error::msg(
            "validate_device_path",
            ErrorKind::Device,
            format!("device path {cleaned} must begin with /dev/"),
        ));
    }
    if cleaned.split('/').any(|c| c == "..") {
        return Err(Error::msg(
            "validate_device_path",
            ErrorKind::Device,
            format!("device path {cleaned} contains a traversal segment"),
        ));
    }
    let allowed = ALLOWED_PATHS.contains(&cleaned.as_ref()) || major == PTY_SLAVE_MAJOR;
    if !allowed {
        return Err(Error::msg(
            "validate_device_path",
            ErrorKind::Device,
            format!("device_not_allowed: {cleaned} (major {major})"),
        ));
    }
    Ok(())
}

fn device_sflag(typ: LinuxDeviceType) -> Result<SFlag> {
    match typ {
        LinuxDeviceType::C | LinuxDeviceType::U => Ok(SFlag::S_IFCHR),
        LinuxDeviceType::B => Ok(SFlag::S_IFBLK),
        LinuxDeviceType::P => Ok(SFlag::S_IFIFO),
        LinuxDeviceType::A => Err(Error::msg(
            "device_sflag",
            ErrorKind::Device,
            "device type 'a' (wildcard) is not a creatable node type",
        )),
    }
}

/// Create a single device node declared in the config, at `rootfs`-relative
/// `dev.path()`. Device number is `(major << 8) | minor`; mode defaults to
/// 0666 ORed with the type bits.
pub fn create_device(rootfs: &Path, dev: &LinuxDevice, id: &str) -> Result<()> {
    let target = rootfs.join(dev.path().strip_prefix("/").unwrap_or(dev.path()));
    validate_device_path(dev.path(), dev.major())
        .map_err(|e| e.with_id(id))?;

    let sflag = device_sflag(dev.typ()).map_err(|e| e.with_id(id))?;
    let mode = dev.file_mode().unwrap_or(0o666);
    let dev_num = nix::sys::stat::makedev(dev.major() as u64, dev.minor() as u64);

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).ctx_id("create_device", ErrorKind::Device, id)?;
    }
    let _ = std::fs::remove_file(&target);
    mknod(&target, sflag, Mode::from_bits_truncate(mode), dev_num)
        .ctx_id("create_device", ErrorKind::Device, id)?;

    let uid = dev.uid().unwrap_or(0);
    let gid = dev.gid().unwrap_or(0);
    chown(&target, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .ctx_id("create_device", ErrorKind::Device, id)?;

    Ok(())
}

/// Full `/dev` setup (spec.md §4.6, init stage step 7): tmpfs mount,
/// default device nodes, `devpts`, `ptmx` symlink, `shm`, `mqueue`, and the
/// fd/stdio symlinks.
pub fn setup_dev(rootfs: &Path, id: &str) -> Result<()> {
    let dev_dir = rootfs.join("dev");
    std::fs::create_dir_all(&dev_dir).ctx_id("setup_dev", ErrorKind::Device, id)?;

    rootfs::mount_tmpfs(&dev_dir, "mode=755,size=65536k,nosuid,strictatime", id)?;

    for (name, major, minor) in DEFAULT_DEVICES {
        let target = dev_dir.join(name);
        let dev_num = nix::sys::stat::makedev(*major as u64, *minor as u64);
        let _ = std::fs::remove_file(&target);
        mknod(&target, SFlag::S_IFCHR, Mode::from_bits_truncate(0o666), dev_num)
            .ctx_id("setup_dev", ErrorKind::Device, id)?;
    }

    let pts_dir = dev_dir.join("pts");
    std::fs::create_dir_all(&pts_dir).ctx_id("setup_dev", ErrorKind::Device, id)?;
    rootfs::mount_devpts(
        &pts_dir,
        "newinstance,ptmxmode=0666,mode=0620",
        id,
    )?;
    let ptmx = dev_dir.join("ptmx");
    let _ = std::fs::remove_file(&ptmx);
    symlink("pts/ptmx", &ptmx).ctx_id("setup_dev", ErrorKind::Device, id)?;

    let shm_dir = dev_dir.join("shm");
    std::fs::create_dir_all(&shm_dir).ctx_id("setup_dev", ErrorKind::Device, id)?;
    rootfs::mount_shm(&shm_dir, "mode=1777,size=65536k,nosuid,nodev,noexec", id)?;

    let mqueue_dir = dev_dir.join("mqueue");
    std::fs::create_dir_all(&mqueue_dir).ctx_id("setup_dev", ErrorKind::Device, id)?;
    rootfs::mount_mqueue(&mqueue_dir, id)?;

    for (link, target) in [
        ("fd", "/proc/self/fd"),
        ("stdin", "/proc/self/fd/0"),
        ("stdout", "/proc/self/fd/1"),
        ("stderr", "/proc/self/fd/2"),
    ] {
        let path = dev_dir.join(link);
        let _ = std::fs::remove_file(&path);
        symlink(target, &path).ctx_id("setup_dev", ErrorKind::Device, id)?;
    }

    Ok(())
}

/// Init-stage step 10: if stdin is a character device (a PTY slave),
/// `mknod /dev/console` pointing at the same device.
pub fn create_console_device(rootfs: &Path, stdin_fd: std::os::unix::io::RawFd, id: &str) -> Result<()> {
    let st = nix::sys::stat::fstat(stdin_fd).ctx_id("create_console_device", ErrorKind::Device, id)?;
    if SFlag::from_bits_truncate(st.st_mode) != SFlag::S_IFCHR {
        return Ok(());
    }
    let console = rootfs.join("dev/console");
    let _ = std::fs::remove_file(&console);
    mknod(
        &console,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o600),
        st.st_rdev,
    )
    .ctx_id("create_console_device", ErrorKind::Device, id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_standard_device_paths() {
        assert!(validate_device_path(Path::new("/dev/null"), 1).is_ok());
        assert!(validate_device_path(Path::new("/dev/zero"), 1).is_ok());
    }

    #[test]
    fn allows_pty_slave_major() {
        assert!(validate_device_path(Path::new("/dev/pts/5"), 136).is_ok());
    }

    #[test]
    fn rejects_disallowed_major() {
        assert!(validate_device_path(Path::new("/dev/sda"), 8).is_err());
    }

    #[test]
    fn rejects_paths_outside_dev() {
        assert!(validate_device_path(Path::new("/etc/passwd"), 1).is_err());
    }

    #[test]
    fn rejects_traversal_segments() {
        assert!(validate_device_path(Path::new("/dev/../etc/passwd"), 1).is_err());
    }
}
