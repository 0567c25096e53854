//! The re-exec child entrypoint (spec.md §4.10).
//!
//! Everything here runs inside the freshly cloned child, after the parent
//! has already applied the `CLONE_NEW*` flags it could pass at spawn time.
//! `setns`/`unshare` being process-scoped (spec.md §9) is why this exists
//! as a distinct re-exec rather than a thread in the parent: the pid
//! namespace in particular demands a fresh process.

use std::ffi::CString;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{ForkResult, Gid, Pid, Uid};
use tracing::{debug, info, warn};

use crate::core::error::{Context as _, Error, ErrorKind, Result};
use crate::core::spec_model::{self, ContainerState, Status};
use crate::platform::linux::{capabilities, devices, hooks, namespaces, rootfs, seccomp};
use crate::platform::linux::hooks::HookPoint;

pub const ENV_BUNDLE: &str = "_CRATERUN_INIT_BUNDLE";
pub const ENV_FIFO: &str = "_CRATERUN_INIT_FIFO";
pub const ENV_ID: &str = "_CRATERUN_INIT_ID";
pub const ENV_STATE_DIR: &str = "_CRATERUN_STATE_DIR";
pub const ENV_NO_PIVOT: &str = "_CRATERUN_NO_PIVOT";
pub const ENV_SYNC_FD: &str = "_CRATERUN_SYNC_FD";

/// Re-exec subcommand name used to reach this entrypoint from `main` (spec.md
/// §9: "the child entrypoint must be reachable by the same binary").
pub const INIT_SUBCOMMAND: &str = "__craterun_init";

struct InitEnv {
    bundle: PathBuf,
    fifo: PathBuf,
    id: String,
    #[allow(dead_code)]
    state_dir: PathBuf,
    no_pivot: bool,
    sync_fd: Option<RawFd>,
}

fn read_env() -> Result<InitEnv> {
    let get = |name: &'static str| -> Result<String> {
        std::env::var(name)
            .map_err(|e| Error::msg("init_stage", ErrorKind::Internal, format!("{name}: {e}")))
    };
    Ok(InitEnv {
        bundle: PathBuf::from(get(ENV_BUNDLE)?),
        fifo: PathBuf::from(get(ENV_FIFO)?),
        id: get(ENV_ID)?,
        state_dir: PathBuf::from(get(ENV_STATE_DIR)?),
        no_pivot: std::env::var(ENV_NO_PIVOT).is_ok(),
        sync_fd: std::env::var(ENV_SYNC_FD).ok().and_then(|s| s.parse().ok()),
    })
}

/// Entry point invoked from `main` when argv0/subcommand indicates this is
/// the re-exec init process. Never returns — exits the process directly
/// with the user process's propagated status, or with 1 on setup failure.
pub fn run() -> ! {
    match run_inner() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("craterun init: {e}");
            std::process::exit(1);
        }
    }
}

fn run_inner() -> Result<i32> {
    // 1. Read environment.
    let env = read_env()?;
    let id = env.id.as_str();

    // If a user namespace is in play, the parent must write our uid_map/
    // gid_map before we're privileged enough to do anything else; block on
    // the sync pipe it handed us until that write has happened.
    if let Some(fd) = env.sync_fd {
        wait_for_id_map_sync(fd, id)?;
    }

    // 2. Reload the spec from the bundle.
    let spec = spec_model::load_spec(&env.bundle).map_err(|e| e.with_id(id))?;
    let linux = spec.linux().as_ref();
    let process = spec.process();

    // 3. Join any pre-existing namespaces whose paths are listed in the spec.
    if let Some(linux) = linux {
        if let Some(namespaces_cfg) = linux.namespaces() {
            let (_, path_namespaces) = namespaces::partition_namespaces(namespaces_cfg);
            for ns in &path_namespaces {
                namespaces::join_namespace(ns).map_err(|e| e.with_id(id))?;
            }
        }
    }

    // 4. Set hostname/domainname if configured.
    if let Some(hostname) = spec.hostname() {
        if let Err(e) = namespaces::set_hostname(hostname) {
            warn!(id, error = %e, "failed to set hostname");
        }
    }
    namespaces::setsid().ok();

    // 5. Open the FIFO read-end before pivot_root; the descriptor survives
    // the filesystem swap even though the path itself stops resolving.
    let fifo_file = std::fs::File::open(&env.fifo).ctx_id("init_stage", ErrorKind::Internal, id)?;

    let hooks_cfg = spec.hooks().clone();
    let mut state = ContainerState::new(id, &env.bundle, &env.bundle.join("rootfs"));
    state.pid = std::process::id();
    state.status = Status::Creating;

    if let Some(h) = hooks_cfg.as_ref().and_then(|h| h.create_runtime().clone()) {
        hooks::run_hooks(HookPoint::CreateRuntime, &h, &state, id)?;
    }

    // 6. Build rootfs. `build_rootfs` performs the pivot_root/chroot itself,
    // so by the time it returns the process is already chrooted: device and
    // `/dev` setup below must address the new root (`/`), not the pre-pivot
    // path it returns (which no longer resolves in this mount namespace).
    let mounts = spec.mounts().clone().unwrap_or_default();
    rootfs::build_rootfs(spec.root(), &env.bundle, linux, &mounts, env.no_pivot, id)?;
    let new_root = Path::new("/");

    // 7. Create configured and default devices.
    if let Some(linux) = linux {
        for dev in linux.devices().clone().unwrap_or_default() {
            devices::create_device(new_root, &dev, id)?;
        }
    }
    devices::setup_dev(new_root, id)?;

    if let Some(h) = hooks_cfg.as_ref().and_then(|h| h.create_container().clone()) {
        hooks::run_hooks(HookPoint::CreateContainer, &h, &state, id)?;
    }

    // 8. chdir to the configured working directory inside the rootfs.
    nix::unistd::chdir(process.cwd().as_str()).ctx_id("init_stage", ErrorKind::Internal, id)?;

    // 9. Block on the FIFO until the parent's Start writes one byte.
    block_on_fifo(fifo_file, id)?;
    state.status = Status::Running;

    // 10. If stdin is a PTY slave, create /dev/console pointing at it.
    devices::create_console_device(new_root, std::io::stdin().as_raw_fd() as RawFd, id)?;

    // 11. Apply capabilities.
    capabilities::apply_capabilities(process.capabilities().as_ref(), id)?;

    // 12. Install seccomp filter. `no_new_privileges` is honored only when
    // the config sets it explicitly (spec.md §9 Open Question: an omitted
    // field is left untouched rather than defaulted to a safer `true`), but
    // installing a seccomp filter unprivileged requires the kernel flag
    // regardless, so set it unconditionally whenever a filter is about to
    // be installed.
    let wants_no_new_privs = process.no_new_privileges().unwrap_or(false);
    let seccomp_program = match linux.and_then(|l| l.seccomp().as_ref()) {
        Some(seccomp_cfg) => seccomp::policy_from_spec(seccomp_cfg)
            .map(|policy| seccomp::compile(&policy))
            .transpose()?
            .flatten(),
        None => None,
    };
    if wants_no_new_privs || seccomp_program.is_some() {
        set_no_new_privs(id)?;
    }
    if let Some(program) = seccomp_program {
        seccomp::install(&program, id)?;
    }

    // 13. Set gid, supplementary gids, uid, umask.
    let user = process.user();
    nix::unistd::setgid(Gid::from_raw(user.gid())).ctx_id("init_stage", ErrorKind::Permission, id)?;
    if let Some(gids) = user.additional_gids() {
        let groups: Vec<Gid> = gids.iter().map(|g| Gid::from_raw(*g)).collect();
        if let Err(e) = nix::unistd::setgroups(&groups) {
            warn!(id, error = %e, "failed to set supplementary groups");
        }
    }
    nix::unistd::setuid(Uid::from_raw(user.uid())).ctx_id("init_stage", ErrorKind::Permission, id)?;
    if let Some(umask) = user.umask() {
        nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(*umask));
    }

    // 14. Overlay environment from the spec.
    let env_vars = process.env().clone().unwrap_or_default();

    // 15. PATH lookup.
    let args = process.args().clone().unwrap_or_default();
    if args.is_empty() {
        return Err(Error::msg("init_stage", ErrorKind::InvalidConfig, "process.args is empty").with_id(id));
    }
    let program_path = resolve_in_path(&args[0], &env_vars);

    if let Some(h) = hooks_cfg.as_ref().and_then(|h| h.start_container().clone()) {
        hooks::run_hooks(HookPoint::StartContainer, &h, &state, id)?;
    }

    // 16. Spawn the user process and forward signals to it; never exec
    // directly, since PID 1 of a fresh pid namespace drops default signal
    // dispositions and an unforwarded SIGTERM would be silently ignored.
    // `poststart` runs right after the fork, while the user process is
    // (presumably) still running, not after it has already exited.
    let poststart_state = state.clone();
    let exit_code = spawn_and_forward(&program_path, &args, &env_vars, id, || {
        if let Some(h) = hooks_cfg.as_ref().and_then(|h| h.poststart().clone()) {
            hooks::run_hooks(HookPoint::Poststart, &h, &poststart_state, id)?;
        }
        Ok(())
    })?;

    if let Some(h) = hooks_cfg.as_ref().and_then(|h| h.poststop().clone()) {
        state.status = Status::Stopped;
        hooks::run_hooks(HookPoint::Poststop, &h, &state, id)?;
    }

    Ok(exit_code)
}

/// Block until the parent signals (one byte) that `/proc/<pid>/{uid,gid}_map`
/// have been written. Takes ownership of `fd` and closes it on return.
fn wait_for_id_map_sync(fd: RawFd, id: &str) -> Result<()> {
    use std::os::fd::FromRawFd;
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let mut buf = [0u8; 1];
    file.read_exact(&mut buf).ctx_id("wait_for_id_map_sync", ErrorKind::Namespace, id)?;
    debug!(id, "uid/gid mapping ready, continuing");
    Ok(())
}

fn set_no_new_privs(id: &str) -> Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(Error::msg(
            "init_stage",
            ErrorKind::Internal,
            std::io::Error::last_os_error(),
        )
        .with_id(id));
    }
    Ok(())
}

fn block_on_fifo(mut file: std::fs::File, id: &str) -> Result<()> {
    let mut buf = [0u8; 1];
    file.read_exact(&mut buf).ctx_id("block_on_fifo", ErrorKind::Internal, id)?;
    debug!(id, "start signal received, resuming init sequence");
    Ok(())
}

fn resolve_in_path(program: &str, env: &[String]) -> String {
    if program.contains('/') {
        return program.to_string();
    }
    let path_var = env
        .iter()
        .find_map(|kv| kv.strip_prefix("PATH=").map(str::to_string))
        .unwrap_or_else(|| "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string());

    for dir in path_var.split(':') {
        let candidate = PathBuf::from(dir).join(program);
        if candidate.is_file() {
            return candidate.to_string_lossy().into_owned();
        }
    }
    program.to_string()
}

static FORWARD_TARGET: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal_handler(signum: libc::c_int) {
    let target = FORWARD_TARGET.load(Ordering::Relaxed);
    if target > 0 {
        unsafe {
            libc::kill(target, signum);
        }
    }
}

fn install_forwarding(child: Pid) -> Result<()> {
    FORWARD_TARGET.store(child.as_raw(), Ordering::Relaxed);
    let action = SigAction::new(
        SigHandler::Handler(forward_signal_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP, Signal::SIGQUIT] {
        unsafe { sigaction(sig, &action) }
            .ctx("install_forwarding", ErrorKind::Internal)?;
    }
    Ok(())
}

fn spawn_and_forward(
    program: &str,
    args: &[String],
    env: &[String],
    id: &str,
    on_started: impl FnOnce() -> Result<()>,
) -> Result<i32> {
    // SAFETY: called before any threads are spawned in this process; the
    // child immediately execs or _exits without touching shared state.
    match unsafe { nix::unistd::fork() }.ctx_id("spawn_and_forward", ErrorKind::Internal, id)? {
        ForkResult::Child => {
            let prog = CString::new(program).unwrap_or_else(|_| CString::new("/bin/sh").unwrap());
            let argv: Vec<CString> = args
                .iter()
                .map(|a| CString::new(a.as_str()).unwrap_or_else(|_| CString::new("").unwrap()))
                .collect();
            let envp: Vec<CString> = env
                .iter()
                .map(|a| CString::new(a.as_str()).unwrap_or_else(|_| CString::new("").unwrap()))
                .collect();
            let _ = nix::unistd::execvpe(&prog, &argv, &envp);
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            install_forwarding(child)?;
            info!(id, pid = child.as_raw(), "user process started");
            on_started()?;
            loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                    Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
                    Ok(_) => continue,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        return Err(Error::msg("spawn_and_forward", ErrorKind::Internal, e).with_id(id))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_in_path_keeps_explicit_paths() {
        assert_eq!(resolve_in_path("/bin/sh", &[]), "/bin/sh");
    }

    #[test]
    fn resolve_in_path_searches_path_entries() {
        let env = vec!["PATH=/bin:/usr/bin".to_string()];
        let resolved = resolve_in_path("sh", &env);
        assert!(resolved == "/bin/sh" || resolved == "sh");
    }
}
