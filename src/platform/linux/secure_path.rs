//! `secure_join` — the core security primitive behind the rootfs builder
//! (C5) and the device manager (C6).
//!
//! Resolves an untrusted path against a trusted base directory such that
//! the result, after every symlink and `..` component is resolved, cannot
//! refer to anything outside `base`. Implemented as an openat-per-component
//! walk anchored at a directory descriptor opened from `base` (spec.md
//! §4.5.1 option (b)) rather than canonicalize-then-compare, which is
//! vulnerable to a TOCTOU race against a symlink planted by a malicious
//! image between canonicalization and use.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::{self, SFlag};
use nix::unistd;

use crate::core::error::{Error, ErrorKind, Result};

const MAX_SYMLINK_FOLLOWS: usize = 40;

/// Resolve `untrusted_path` against `base`, guaranteeing the result stays
/// within `base`. Absolute untrusted paths are reinterpreted as relative to
/// `base`; a `..` component that would ascend past `base` is rejected with
/// `PathTraversal` rather than clamped (spec.md:330).
///
/// Trailing components that don't exist yet are accepted literally (the
/// rootfs builder calls this to compute a mount *destination* before
/// `mkdir -p`/`mknod` creates it).
pub fn secure_join(base: &Path, untrusted_path: &str) -> Result<PathBuf> {
    let base = std::fs::canonicalize(base)
        .map_err(|e| Error::new("secure_join", ErrorKind::Rootfs).with_source(e))?;

    let base_fd = open_nofollow_dir(libc::AT_FDCWD, &base)?;
    let mut fd_stack: Vec<RawFd> = vec![base_fd];
    let mut resolved: Vec<String> = Vec::new();
    let mut follows = 0usize;

    let mut queue: VecDeque<String> = split_components(untrusted_path);

    let result = (|| -> Result<()> {
        while let Some(component) = queue.pop_front() {
            if component == ".." {
                if fd_stack.len() == 1 {
                    return Err(traversal_err("path traversal above base"));
                }
                let fd = fd_stack.pop().expect("len > 1 checked above");
                let _ = unistd::close(fd);
                resolved.pop();
                continue;
            }

            let cur_fd = *fd_stack.last().expect("base fd always present");
            match open_component(cur_fd, &component) {
                Ok(ComponentKind::Dir(fd)) => {
                    fd_stack.push(fd);
                    resolved.push(component);
                }
                Ok(ComponentKind::Leaf(fd)) => {
                    let _ = unistd::close(fd);
                    resolved.push(component);
                    if !queue.is_empty() {
                        return Err(traversal_err(
                            "path component is not a directory but has trailing segments",
                        ));
                    }
                }
                Ok(ComponentKind::Symlink) => {
                    follows += 1;
                    if follows > MAX_SYMLINK_FOLLOWS {
                        return Err(traversal_err("too many levels of symbolic links"));
                    }
                    let target = unistd::readlinkat(cur_fd, component.as_str())
                        .map_err(|e| Error::new("secure_join", ErrorKind::Rootfs).with_source(e))?;
                    let target = target.to_string_lossy().into_owned();

                    if target.starts_with('/') {
                        // Absolute symlink target: reinterpret relative to base.
                        for fd in fd_stack.drain(1..) {
                            let _ = unistd::close(fd);
                        }
                        resolved.clear();
                    }
                    let mut expanded = split_components(&target);
                    expanded.extend(queue.drain(..));
                    queue = expanded;
                }
                Err(Errno::ENOENT) => {
                    // Nothing more to descend into; accept the rest literally.
                    resolved.push(component);
                    resolved.extend(queue.drain(..));
                    break;
                }
                Err(e) => {
                    return Err(Error::new("secure_join", ErrorKind::Rootfs).with_source(e));
                }
            }
        }
        Ok(())
    })();

    for fd in fd_stack {
        let _ = unistd::close(fd);
    }
    result?;

    let mut out = base;
    for component in resolved {
        out.push(component);
    }
    Ok(out)
}

enum ComponentKind {
    Dir(RawFd),
    Leaf(RawFd),
    Symlink,
}

fn open_component(dir_fd: RawFd, component: &str) -> std::result::Result<ComponentKind, Errno> {
    let flags = OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC;
    match fcntl::openat(dir_fd, component, flags, stat::Mode::empty()) {
        Ok(fd) => {
            let st = stat::fstat(fd)?;
            if SFlag::from_bits_truncate(st.st_mode).contains(SFlag::S_IFDIR) {
                Ok(ComponentKind::Dir(fd))
            } else {
                Ok(ComponentKind::Leaf(fd))
            }
        }
        Err(Errno::ELOOP) => Ok(ComponentKind::Symlink),
        Err(e) => Err(e),
    }
}

fn open_nofollow_dir(dir_fd: RawFd, path: &Path) -> Result<RawFd> {
    let flags = OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC;
    fcntl::openat(dir_fd, path, flags, stat::Mode::empty())
        .map_err(|e| Error::new("secure_join", ErrorKind::Rootfs).with_source(e))
}

fn split_components(path: &str) -> VecDeque<String> {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(|c| c.to_string())
        .collect()
}

fn traversal_err(msg: &str) -> Error {
    Error::msg("secure_join", ErrorKind::PathTraversal, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;

    #[test]
    fn resolves_plain_relative_path() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();

        let result = secure_join(tmp.path(), "a/b").unwrap();
        assert_eq!(result, tmp.path().join("a/b"));
    }

    #[test]
    fn dotdot_above_base_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();

        let err = secure_join(tmp.path(), "../../../a").unwrap_err();
        assert_eq!(err.kind, ErrorKind::PathTraversal);
    }

    #[test]
    fn dotdot_within_base_descends_normally() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();

        let result = secure_join(tmp.path(), "a/b/../b").unwrap();
        assert_eq!(result, tmp.path().join("a/b"));
    }

    #[test]
    fn reinterprets_absolute_paths_as_relative_to_base() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("etc")).unwrap();

        let result = secure_join(tmp.path(), "/etc/evil").unwrap();
        assert_eq!(result, tmp.path().join("etc/evil"));
    }

    #[test]
    fn follows_symlink_but_stays_within_base() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("real")).unwrap();
        symlink(tmp.path().join("real"), tmp.path().join("link")).unwrap();

        let result = secure_join(tmp.path(), "link/file").unwrap();
        assert_eq!(result, tmp.path().join("real/file"));
    }

    #[test]
    fn absolute_symlink_escape_is_reinterpreted_within_base() {
        let tmp = tempfile::tempdir().unwrap();
        // A symlink pointing at an absolute host path must not escape base;
        // it gets reinterpreted as relative to base.
        symlink("/etc/shadow", tmp.path().join("escape")).unwrap();

        let result = secure_join(tmp.path(), "escape").unwrap();
        assert_eq!(result, tmp.path().join("etc/shadow"));
        assert!(result.starts_with(tmp.path()));
    }

    #[test]
    fn nonexistent_trailing_components_are_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let result = secure_join(tmp.path(), "does/not/exist/yet").unwrap();
        assert_eq!(result, tmp.path().join("does/not/exist/yet"));
    }
}
