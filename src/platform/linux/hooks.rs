//! OCI lifecycle hook execution (spec.md §4.9).
//!
//! Each hook point is a list of external processes, run in order, with the
//! container's OCI state JSON piped to stdin. `createRuntime`, `createContainer`
//! and `startContainer` failures are fatal to the calling operation; `poststart`
//! and `poststop` failures are logged and otherwise ignored. The deprecated
//! `prestart` hook point behaves like `createRuntime`.

use std::io::Write as _;
use std::process::{Command, Stdio};
use std::time::Duration;

use oci_spec::runtime::Hook;
use tracing::{error, warn};
use wait_timeout::ChildExt;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::spec_model::ContainerState;

/// Which lifecycle point a batch of hooks is running at, purely for logging
/// and for picking the fatal-vs-logged failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    Prestart,
    CreateRuntime,
    CreateContainer,
    StartContainer,
    Poststart,
    Poststop,
}

impl HookPoint {
    fn name(self) -> &'static str {
        match self {
            HookPoint::Prestart => "prestart",
            HookPoint::CreateRuntime => "createRuntime",
            HookPoint::CreateContainer => "createContainer",
            HookPoint::StartContainer => "startContainer",
            HookPoint::Poststart => "poststart",
            HookPoint::Poststop => "poststop",
        }
    }

    /// Whether a hook failure at this point should abort the calling operation.
    fn is_fatal(self) -> bool {
        !matches!(self, HookPoint::Poststart | HookPoint::Poststop)
    }
}

/// Run every hook in `hooks` (in order) at `point`, feeding each one the
/// container's OCI state JSON on stdin. Returns as soon as a fatal hook point
/// has a failing hook; non-fatal points run every hook regardless and only log.
pub fn run_hooks(point: HookPoint, hooks: &[Hook], state: &ContainerState, id: &str) -> Result<()> {
    let payload = serde_json::to_vec(&state.to_oci_json())
        .map_err(|e| Error::msg("run_hooks", ErrorKind::Internal, e).with_id(id))?;

    for hook in hooks {
        if let Err(e) = run_one(point, hook, &payload, id) {
            if point.is_fatal() {
                return Err(e);
            }
            error!(hook = point.name(), id, error = %e, "lifecycle hook failed, continuing");
        }
    }
    Ok(())
}

fn run_one(point: HookPoint, hook: &Hook, payload: &[u8], id: &str) -> Result<()> {
    let mut cmd = Command::new(hook.path());

    let args = hook.args().clone().unwrap_or_default();
    if args.len() > 1 {
        cmd.args(&args[1..]);
    }

    if let Some(env) = hook.env() {
        cmd.env_clear();
        for kv in env {
            if let Some((k, v)) = kv.split_once('=') {
                cmd.env(k, v);
            }
        }
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|e| {
        Error::msg("run_hooks", ErrorKind::Internal, e)
            .with_id(id)
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        // A hook that never reads stdin (closed pipe) is not our problem to
        // report; the process's own exit status is what we check.
        let _ = stdin.write_all(payload);
    }

    let status = match hook.timeout() {
        Some(secs) if *secs > 0 => {
            match child
                .wait_timeout(Duration::from_secs(*secs as u64))
                .map_err(|e| Error::msg("run_hooks", ErrorKind::Internal, e).with_id(id))?
            {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::msg(
                        "run_hooks",
                        ErrorKind::Resource,
                        format!(
                            "hook {} at {} timed out after {}s",
                            hook.path().display(),
                            point.name(),
                            secs
                        ),
                    )
                    .with_id(id));
                }
            }
        }
        _ => child
            .wait()
            .map_err(|e| Error::msg("run_hooks", ErrorKind::Internal, e).with_id(id))?,
    };

    if !status.success() {
        warn!(
            hook = %hook.path().display(),
            point = point.name(),
            status = ?status.code(),
            id,
            "hook exited non-zero"
        );
        return Err(Error::msg(
            "run_hooks",
            ErrorKind::Internal,
            format!(
                "hook {} at {} exited with status {:?}",
                hook.path().display(),
                point.name(),
                status.code()
            ),
        )
        .with_id(id));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::HookBuilder;
    use std::path::PathBuf;

    fn sample_state() -> ContainerState {
        ContainerState::new("test-id", &PathBuf::from("/bundle"), &PathBuf::from("/rootfs"))
    }

    #[test]
    fn fatal_points_are_classified_correctly() {
        assert!(HookPoint::CreateRuntime.is_fatal());
        assert!(HookPoint::CreateContainer.is_fatal());
        assert!(HookPoint::StartContainer.is_fatal());
        assert!(HookPoint::Prestart.is_fatal());
        assert!(!HookPoint::Poststart.is_fatal());
        assert!(!HookPoint::Poststop.is_fatal());
    }

    #[test]
    fn empty_hook_list_succeeds_immediately() {
        let state = sample_state();
        let result = run_hooks(HookPoint::CreateRuntime, &[], &state, "test-id");
        assert!(result.is_ok());
    }

    #[test]
    fn successful_hook_runs_to_completion() {
        let state = sample_state();
        let hook = HookBuilder::default()
            .path(PathBuf::from("/bin/true"))
            .build()
            .unwrap();
        let result = run_hooks(HookPoint::CreateContainer, &[hook], &state, "test-id");
        assert!(result.is_ok());
    }

    #[test]
    fn failing_hook_at_fatal_point_is_reported() {
        let state = sample_state();
        let hook = HookBuilder::default()
            .path(PathBuf::from("/bin/false"))
            .build()
            .unwrap();
        let result = run_hooks(HookPoint::StartContainer, &[hook], &state, "test-id");
        assert!(result.is_err());
    }

    #[test]
    fn failing_hook_at_nonfatal_point_is_swallowed() {
        let state = sample_state();
        let hook = HookBuilder::default()
            .path(PathBuf::from("/bin/false"))
            .build()
            .unwrap();
        let result = run_hooks(HookPoint::Poststop, &[hook], &state, "test-id");
        assert!(result.is_ok());
    }
}
