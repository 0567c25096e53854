//! The container lifecycle state machine (spec.md §4.1): `New`/`Load`/
//! `List`/`Create`/`Start`/`Run`/`Wait`/`Signal`/`Delete`/`State`.
//!
//! `Create` spawns the init child via a raw `clone(2)` (through
//! `nix::sched::clone`) rather than `fork` + `unshare`, because several of
//! the requested namespaces — the pid namespace above all — only take
//! effect for a process created *with* the flag, not for an existing
//! process that calls `unshare` on itself afterwards.

use std::ffi::CString;
use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sched::CloneFlags;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::core::error::{Context as _, Error, ErrorKind, Result};
use crate::core::spec_model::{self, ContainerState, Status};
use crate::core::state;
use crate::platform::linux::{cgroups, console, init_stage, namespaces};

/// Options for `Create` (and the `create` half of `Run`), mirroring the
/// CLI's `create`/`run` flags (spec.md §6).
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub pid_file: Option<PathBuf>,
    pub console_socket: Option<PathBuf>,
    pub no_pivot: bool,
    pub no_new_keyring: bool,
}

/// `New`: validate the id and reserve its state directory. Fails
/// `already_exists` if a `state.json` is already present.
pub fn new(id: &str, state_root: &Path) -> Result<()> {
    crate::core::id::validate_id(id)?;
    if state::exists(state_root, id) {
        return Err(Error::new("new", ErrorKind::AlreadyExists).with_id(id));
    }
    Ok(())
}

/// `Load`: read the persisted state for `id`, refreshing its status.
pub fn load(id: &str, state_root: &Path) -> Result<ContainerState> {
    let mut state = state::load_state(state_root, id)?;
    state::refresh_status(&mut state);
    Ok(state)
}

/// `List`: enumerate every container under `state_root`, refreshing status.
/// A container whose `state.json` fails to parse is skipped (logged), not
/// fatal to the whole listing.
pub fn list(state_root: &Path) -> Result<Vec<ContainerState>> {
    let mut out = Vec::new();
    for id in state::list_ids(state_root)? {
        match state::load_state(state_root, &id) {
            Ok(mut s) => {
                state::refresh_status(&mut s);
                out.push(s);
            }
            Err(e) => warn!(id = %id, error = %e, "skipping unreadable container state"),
        }
    }
    Ok(out)
}

/// `State`: the public OCI `state.json` projection, with status refreshed
/// (but not persisted) against the live process.
pub fn state_json(id: &str, state_root: &Path) -> Result<serde_json::Value> {
    let state = load(id, state_root)?;
    Ok(state.to_oci_json())
}

/// `Create`, spec.md §4.1 steps 1-9.
pub fn create(id: &str, bundle: &Path, state_root: &Path, opts: &CreateOptions) -> Result<ContainerState> {
    new(id, state_root)?;
    let bundle = fs::canonicalize(bundle).ctx_id("create", ErrorKind::InvalidConfig, id)?;
    let spec = spec_model::load_spec(&bundle).map_err(|e| e.with_id(id))?;
    let linux = spec.linux().clone();

    state::create_container_dir(state_root, id)?;
    let fifo_path = state::create_fifo(state_root, id)?;

    let cgroup_path = cgroups::resolve_cgroup_path(
        linux.as_ref().and_then(|l| l.cgroups_path().as_ref()).and_then(|p| p.to_str()),
        id,
    );

    let unwind = |fifo_created: bool, cgroup_created: bool| {
        if fifo_created {
            state::remove_fifo(state_root, id);
        }
        if cgroup_created {
            if let Err(e) = cgroups::destroy(&cgroup_path, id) {
                warn!(id, error = %e, "failed to destroy cgroup during unwind");
            }
        }
        let _ = state::remove_container_dir(state_root, id);
    };

    if let Err(e) = cgroups::new_cgroup(&cgroup_path, id) {
        unwind(true, false);
        return Err(e);
    }
    let limits = cgroups::resource_limits_from(linux.as_ref().and_then(|l| l.resources().as_ref()));
    if let Err(e) = cgroups::apply_limits(&cgroup_path, &limits, id) {
        unwind(true, true);
        return Err(e);
    }

    let wants_terminal = spec.process().terminal().unwrap_or(false);
    let pty = match (wants_terminal, &opts.console_socket) {
        (true, Some(_)) => match console::allocate(id) {
            Ok(pty) => Some(pty),
            Err(e) => {
                unwind(true, true);
                return Err(e);
            }
        },
        _ => None,
    };
    let pty_slave_fd = pty.as_ref().map(|p| p.slave.as_raw_fd());

    let exe = std::env::current_exe().ctx_id("create", ErrorKind::Internal, id)?;
    let pid = match spawn_init(&exe, &bundle, &fifo_path, id, state_root, &spec, opts, pty_slave_fd) {
        Ok(pid) => pid,
        Err(e) => {
            unwind(true, true);
            return Err(e);
        }
    };

    if let Err(e) = cgroups::add_process(&cgroup_path, pid.as_raw() as u32, id) {
        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
        unwind(true, true);
        return Err(e);
    }

    // The child now holds its own copy of the slave fd (duplicated across
    // the clone boundary); send the master to the console socket and drop
    // both ends here once that handoff has happened.
    if let Some(pty) = pty {
        if let Some(socket) = &opts.console_socket {
            if let Err(e) = console::send_master_fd(socket, pty.master.as_raw_fd(), id) {
                warn!(id, error = %e, "failed to send console master fd over console socket");
            }
        }
    }

    if let Some(pid_file) = &opts.pid_file {
        if let Err(e) = write_pid_file(pid_file, pid.as_raw() as u32) {
            warn!(id, error = %e, "failed to write pid file");
        }
    }

    let mut state = ContainerState::new(id, &bundle, &bundle.join(spec.root().path()));
    state.pid = pid.as_raw() as u32;
    state.status = Status::Created;
    state::save_state(state_root, &state)?;

    info!(id, pid = state.pid, "container created");
    Ok(state)
}

/// `Start`: open the FIFO for writing, write one byte, unlink it, persist
/// `running`. Any status other than `created` is `invalid_state`.
pub fn start(id: &str, state_root: &Path) -> Result<()> {
    let mut state = state::load_state(state_root, id)?;
    if !matches!(state.status, Status::Created) {
        return Err(Error::msg(
            "start",
            ErrorKind::InvalidState,
            format!("container is {}, not created", state.status),
        )
        .with_id(id));
    }

    let fifo_path = state::fifo_file(state_root, id);
    let mut fifo = fs::OpenOptions::new()
        .write(true)
        .open(&fifo_path)
        .ctx_id("start", ErrorKind::Internal, id)?;
    use std::io::Write as _;
    fifo.write_all(&[0u8]).ctx_id("start", ErrorKind::Internal, id)?;
    drop(fifo);
    state::remove_fifo(state_root, id);

    state.status = Status::Running;
    state::save_state(state_root, &state)?;
    info!(id, "container started");
    Ok(())
}

/// `Run`: `Create` then `Start`, then `Wait` for the exit code.
pub fn run(id: &str, bundle: &Path, state_root: &Path, opts: &CreateOptions) -> Result<i32> {
    create(id, bundle, state_root, opts)?;
    start(id, state_root)?;
    wait(id, state_root)
}

/// `Wait`: block on the init process, returning its exit status (or
/// `128 + signal` if signal-terminated). Persists `stopped` on completion,
/// best-effort.
pub fn wait(id: &str, state_root: &Path) -> Result<i32> {
    let mut state = state::load_state(state_root, id)?;
    if state.pid == 0 {
        return Err(Error::msg("wait", ErrorKind::InvalidState, "no init pid recorded").with_id(id));
    }
    let pid = Pid::from_raw(state.pid as i32);

    let code = loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(_, sig, _)) => break 128 + sig as i32,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => break 0,
            Err(e) => return Err(Error::msg("wait", ErrorKind::Internal, e).with_id(id)),
        }
    };

    state.status = Status::Stopped;
    if let Err(e) = state::save_state(state_root, &state) {
        warn!(id, error = %e, "failed to persist stopped status after wait");
    }
    Ok(code)
}

/// `Signal(sig, all)`: deliver to the init pid, or (if `all`) to its
/// process group (negative pid to `kill`). An already-exited target
/// returns `not_found`.
pub fn send_signal(id: &str, state_root: &Path, sig: Signal, all: bool) -> Result<()> {
    let state = state::load_state(state_root, id)?;
    if state.pid == 0 {
        return Err(Error::msg("signal", ErrorKind::NotFound, "container has no init pid").with_id(id));
    }
    let target = if all {
        Pid::from_raw(-(state.pid as i32))
    } else {
        Pid::from_raw(state.pid as i32)
    };
    signal::kill(target, sig).map_err(|e| {
        let kind = if e == nix::errno::Errno::ESRCH {
            ErrorKind::NotFound
        } else {
            ErrorKind::Internal
        };
        Error::msg("signal", kind, e).with_id(id)
    })
}

/// Parse a signal name or number, case-insensitive and with or without the
/// `SIG` prefix (spec.md §4.1).
pub fn parse_signal(name: &str) -> Result<Signal> {
    use std::str::FromStr;

    if let Ok(n) = name.parse::<i32>() {
        return Signal::try_from(n)
            .map_err(|e| Error::msg("parse_signal", ErrorKind::InvalidConfig, e));
    }
    let upper = name.to_ascii_uppercase();
    let stripped = upper.strip_prefix("SIG").unwrap_or(&upper);
    let canonical = format!("SIG{stripped}");
    Signal::from_str(&canonical)
        .map_err(|_| Error::msg("parse_signal", ErrorKind::InvalidConfig, format!("unknown signal '{name}'")))
}

/// `Delete`: refresh status; refuse a running container unless `force`;
/// `force` sends `SIGKILL` and polls up to 5s. Destroys the cgroup, removes
/// the FIFO, and recursively removes the state directory. A missing
/// container is a no-op.
pub fn delete(id: &str, state_root: &Path, force: bool) -> Result<()> {
    if !state::exists(state_root, id) {
        return Ok(());
    }

    let mut state = state::load_state(state_root, id)?;
    state::refresh_status(&mut state);

    if matches!(state.status, Status::Running | Status::Created) {
        if !force {
            return Err(Error::msg("delete", ErrorKind::InvalidState, "container is still running")
                .with_id(id));
        }
        if state.pid != 0 {
            let pid = Pid::from_raw(state.pid as i32);
            let _ = signal::kill(pid, Signal::SIGKILL);
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => std::thread::sleep(Duration::from_millis(100)),
                    _ => break,
                }
            }
        }
    }

    let bundle = PathBuf::from(&state.bundle);
    let linux_cgroups_path = spec_model::load_spec(&bundle)
        .ok()
        .and_then(|s| s.linux().clone())
        .and_then(|l| l.cgroups_path().clone());
    let cgroup_path =
        cgroups::resolve_cgroup_path(linux_cgroups_path.as_ref().and_then(|p| p.to_str()), id);
    if let Err(e) = cgroups::destroy(&cgroup_path, id) {
        warn!(id, error = %e, "failed to destroy cgroup during delete");
    }

    state::remove_fifo(state_root, id);
    state::remove_container_dir(state_root, id)?;
    info!(id, "container deleted");
    Ok(())
}

fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    fs::write(path, pid.to_string()).ctx("write_pid_file", ErrorKind::Internal)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
        .ctx("write_pid_file", ErrorKind::Internal)
}

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Spawn the init child via `clone(2)`, deriving clone flags from the
/// config's namespace list, synchronizing the uid/gid map write (if a user
/// namespace is requested) through a pipe whose read end survives the
/// child's re-exec with `FD_CLOEXEC` cleared.
fn spawn_init(
    exe: &Path,
    bundle: &Path,
    fifo: &Path,
    id: &str,
    state_dir: &Path,
    spec: &oci_spec::runtime::Spec,
    opts: &CreateOptions,
    pty_slave_fd: Option<std::os::fd::RawFd>,
) -> Result<Pid> {
    let linux = spec.linux().as_ref();
    let (clone_flags, _path_namespaces) = match linux.and_then(|l| l.namespaces().as_ref()) {
        Some(ns) => namespaces::partition_namespaces(ns),
        None => (namespaces::default_clone_flags(), Vec::new()),
    };

    let needs_user_ns = clone_flags.contains(CloneFlags::CLONE_NEWUSER);
    let sync_pipe = if needs_user_ns {
        let (r, w) = nix::unistd::pipe().ctx_id("spawn_init", ErrorKind::Namespace, id)?;
        let flags = fcntl(r.as_raw_fd(), FcntlArg::F_GETFD).ctx_id("spawn_init", ErrorKind::Namespace, id)?;
        let flags = FdFlag::from_bits_truncate(flags) & !FdFlag::FD_CLOEXEC;
        fcntl(r.as_raw_fd(), FcntlArg::F_SETFD(flags)).ctx_id("spawn_init", ErrorKind::Namespace, id)?;
        Some((r, w))
    } else {
        None
    };

    let mut env: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
    env.push(format!("{}={}", init_stage::ENV_BUNDLE, bundle.display()));
    env.push(format!("{}={}", init_stage::ENV_FIFO, fifo.display()));
    env.push(format!("{}={}", init_stage::ENV_ID, id));
    env.push(format!("{}={}", init_stage::ENV_STATE_DIR, state_dir.display()));
    if opts.no_pivot {
        env.push(format!("{}=1", init_stage::ENV_NO_PIVOT));
    }
    if let Some((r, _)) = &sync_pipe {
        env.push(format!("{}={}", init_stage::ENV_SYNC_FD, r.as_raw_fd()));
    }

    let exe_cstring =
        CString::new(exe.to_string_lossy().into_owned()).ctx_id("spawn_init", ErrorKind::Internal, id)?;
    let arg0 = CString::new(init_stage::INIT_SUBCOMMAND).unwrap();
    let env_cstrings: Vec<CString> = env
        .iter()
        .map(|s| CString::new(s.as_str()).unwrap_or_else(|_| CString::new("").unwrap()))
        .collect();

    let write_fd = sync_pipe.as_ref().map(|(_, w)| w.as_raw_fd());

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let child = move || -> isize {
        if let Some(wfd) = write_fd {
            let _ = nix::unistd::close(wfd);
        }
        if let Some(slave_fd) = pty_slave_fd {
            crate::platform::linux::console::attach_slave_as_stdio(slave_fd);
        }
        let argv = [exe_cstring.as_c_str(), arg0.as_c_str()];
        let _ = nix::unistd::execve(&exe_cstring, &argv, &env_cstrings);
        libc::_exit(127);
    };

    // SAFETY: the callback only touches owned/moved-in data and either
    // execs or exits; no shared Rust state crosses the clone boundary.
    let pid = unsafe { nix::sched::clone(Box::new(child), &mut stack, clone_flags, Some(libc::SIGCHLD)) }
        .ctx_id("spawn_init", ErrorKind::Namespace, id)?;

    if let Some((r, w)) = sync_pipe {
        drop(r);
        if let Some(linux) = linux {
            let uid_mappings = linux.uid_mappings().clone().unwrap_or_default();
            let gid_mappings = linux.gid_mappings().clone().unwrap_or_default();
            namespaces::write_id_mappings(pid.as_raw(), &uid_mappings, &gid_mappings)?;
        }
        use std::io::Write as _;
        let mut wfile = std::fs::File::from(w);
        let _ = wfile.write_all(&[0u8]);
    }

    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_signal_accepts_numeric() {
        assert_eq!(parse_signal("15").unwrap(), Signal::SIGTERM);
    }

    #[test]
    fn parse_signal_accepts_bare_name_case_insensitive() {
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("KILL").unwrap(), Signal::SIGKILL);
    }

    #[test]
    fn parse_signal_accepts_sig_prefixed_name() {
        assert_eq!(parse_signal("SIGHUP").unwrap(), Signal::SIGHUP);
    }

    #[test]
    fn parse_signal_rejects_garbage() {
        assert!(parse_signal("not_a_signal").is_err());
    }
}
