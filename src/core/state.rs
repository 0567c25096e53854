//! State directory layout and persistence (spec.md §3, §6).
//!
//! `<state_root>/<id>/` holds `state.json` (mode 0600) and, between create
//! and start, a named FIFO `exec.fifo` (mode 0600). The parent directory is
//! mode 0700. All of this is process-local bookkeeping — no daemon, no
//! shared lock file beyond the directory itself.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::signal;
use nix::unistd::Pid;

use super::error::{Context as _, Error, ErrorKind, Result};
use super::spec_model::{ContainerState, Status};

pub const STATE_FILE: &str = "state.json";
pub const FIFO_FILE: &str = "exec.fifo";

/// Resolve the state root: an explicit override, else `/run/craterun` when
/// running as root, else `$HOME/.craterun`.
pub fn state_root(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if nix::unistd::geteuid().is_root() {
        return Ok(PathBuf::from("/run/craterun"));
    }
    let home =
        std::env::var("HOME").map_err(|e| Error::msg("state_root", ErrorKind::Internal, e))?;
    Ok(PathBuf::from(home).join(".craterun"))
}

pub fn container_dir(root: &Path, id: &str) -> PathBuf {
    root.join(id)
}

pub fn state_file(root: &Path, id: &str) -> PathBuf {
    container_dir(root, id).join(STATE_FILE)
}

pub fn fifo_file(root: &Path, id: &str) -> PathBuf {
    container_dir(root, id).join(FIFO_FILE)
}

/// Create `<root>/<id>` at mode 0700. Fails if it already exists — callers
/// use this exactly once, at `New`, after confirming no prior state.
pub fn create_container_dir(root: &Path, id: &str) -> Result<PathBuf> {
    let dir = container_dir(root, id);
    fs::create_dir_all(root).ctx_id("create_container_dir", ErrorKind::Internal, id)?;
    fs::create_dir(&dir).ctx_id("create_container_dir", ErrorKind::AlreadyExists, id)?;
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
        .ctx_id("create_container_dir", ErrorKind::Internal, id)?;
    Ok(dir)
}

pub fn exists(root: &Path, id: &str) -> bool {
    state_file(root, id).exists()
}

/// Create the exec FIFO at mode 0600 (spec.md §4.1 step 2).
pub fn create_fifo(root: &Path, id: &str) -> Result<PathBuf> {
    let path = fifo_file(root, id);
    nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600))
        .ctx_id("create_fifo", ErrorKind::Internal, id)?;
    Ok(path)
}

pub fn remove_fifo(root: &Path, id: &str) {
    let _ = fs::remove_file(fifo_file(root, id));
}

/// Persist `state` to `state.json`, mode 0600, via write-then-rename so
/// concurrent readers never observe a half-written file.
pub fn save_state(root: &Path, state: &ContainerState) -> Result<()> {
    let dir = container_dir(root, &state.id);
    fs::create_dir_all(&dir).ctx_id("save_state", ErrorKind::Internal, &state.id)?;
    let final_path = state_file(root, &state.id);
    let tmp_path = dir.join(format!(".{STATE_FILE}.tmp"));

    let json = serde_json::to_string_pretty(state)
        .ctx_id("save_state", ErrorKind::Internal, &state.id)?;
    fs::write(&tmp_path, json).ctx_id("save_state", ErrorKind::Internal, &state.id)?;
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))
        .ctx_id("save_state", ErrorKind::Internal, &state.id)?;
    fs::rename(&tmp_path, &final_path).ctx_id("save_state", ErrorKind::Internal, &state.id)?;
    Ok(())
}

pub fn load_state(root: &Path, id: &str) -> Result<ContainerState> {
    let path = state_file(root, id);
    let data = fs::read_to_string(&path).ctx_id("load_state", ErrorKind::NotFound, id)?;
    serde_json::from_str(&data).ctx_id("load_state", ErrorKind::Internal, id)
}

/// Enumerate every container id with a `state.json` under `root`.
pub fn list_ids(root: &Path) -> Result<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(root).ctx("list_ids", ErrorKind::Internal)? {
        let entry = entry.ctx("list_ids", ErrorKind::Internal)?;
        if entry.path().join(STATE_FILE).is_file() {
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// Resolve a potentially abbreviated container id to a full one. A unique
/// prefix match is accepted; zero or multiple matches is an error.
pub fn resolve_id(root: &Path, prefix: &str) -> Result<String> {
    if exists(root, prefix) {
        return Ok(prefix.to_string());
    }
    let all = list_ids(root)?;
    let matches: Vec<&String> = all.iter().filter(|id| id.starts_with(prefix)).collect();
    match matches.len() {
        0 => Err(Error::msg(
            "resolve_id",
            ErrorKind::NotFound,
            format!("no container found with id prefix '{prefix}'"),
        )),
        1 => Ok(matches[0].clone()),
        n => Err(Error::msg(
            "resolve_id",
            ErrorKind::InvalidConfig,
            format!("ambiguous container id prefix '{prefix}': {n} matches"),
        )),
    }
}

/// Recursively remove `<root>/<id>`. Missing directory is not an error.
pub fn remove_container_dir(root: &Path, id: &str) -> Result<()> {
    let dir = container_dir(root, id);
    match fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::msg("remove_container_dir", ErrorKind::Internal, e).with_id(id)),
    }
}

/// Re-derive `status` in memory by probing the init PID with signal 0.
/// Never writes state; callers decide whether/when to persist the result.
pub fn refresh_status(state: &mut ContainerState) {
    if !matches!(state.status, Status::Running | Status::Created) {
        return;
    }
    if state.pid == 0 {
        return;
    }
    let alive = signal::kill(Pid::from_raw(state.pid as i32), None).is_ok();
    if !alive {
        state.status = Status::Stopped;
        state.pid = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let state =
            ContainerState::new("test-id", Path::new("/bundle"), Path::new("/bundle/rootfs"));
        save_state(dir.path(), &state).unwrap();
        let loaded = load_state(dir.path(), "test-id").unwrap();
        assert_eq!(loaded.id, state.id);
        assert_eq!(loaded.bundle, state.bundle);
    }

    #[test]
    fn save_state_file_is_mode_0600() {
        let dir = tempdir().unwrap();
        let state =
            ContainerState::new("test-id", Path::new("/bundle"), Path::new("/bundle/rootfs"));
        save_state(dir.path(), &state).unwrap();
        let meta = fs::metadata(state_file(dir.path(), "test-id")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn container_dir_is_mode_0700() {
        let dir = tempdir().unwrap();
        create_container_dir(dir.path(), "test-id").unwrap();
        let meta = fs::metadata(container_dir(dir.path(), "test-id")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn list_and_resolve_containers() {
        let dir = tempdir().unwrap();
        save_state(
            dir.path(),
            &ContainerState::new("aabbccdd11223344", Path::new("/b"), Path::new("/b/rootfs")),
        )
        .unwrap();
        save_state(
            dir.path(),
            &ContainerState::new("11223344aabbccdd", Path::new("/b"), Path::new("/b/rootfs")),
        )
        .unwrap();

        assert_eq!(list_ids(dir.path()).unwrap().len(), 2);
        assert_eq!(resolve_id(dir.path(), "1122").unwrap(), "11223344aabbccdd");
        assert!(resolve_id(dir.path(), "ffff").is_err());
    }

    #[test]
    fn remove_missing_container_dir_is_a_no_op() {
        let dir = tempdir().unwrap();
        assert!(remove_container_dir(dir.path(), "nonexistent").is_ok());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let state = ContainerState::new("a", Path::new("/b"), Path::new("/b/rootfs"));
        save_state(dir.path(), &state).unwrap();
        remove_container_dir(dir.path(), "a").unwrap();
        assert!(remove_container_dir(dir.path(), "a").is_ok());
    }
}
