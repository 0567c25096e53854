use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::cli::{Cli, Command};
use crate::core::{exec, lifecycle, spec_model, state};

/// Dispatch a parsed CLI command to the appropriate handler.
pub fn dispatch(cli: Cli) -> Result<()> {
    let state_root = state::state_root(cli.root.as_deref())?;

    match cli.command {
        Command::Create {
            id,
            bundle,
            pid_file,
            console_socket,
            no_pivot,
            no_new_keyring,
        } => cmd_create(
            &id,
            &bundle,
            &state_root,
            lifecycle::CreateOptions {
                pid_file,
                console_socket,
                no_pivot,
                no_new_keyring,
            },
        ),
        Command::Start { id } => cmd_start(&id, &state_root),
        Command::Run {
            id,
            bundle,
            pid_file,
            console_socket,
            no_pivot,
            no_new_keyring,
            detach,
            tty: _,
        } => cmd_run(
            &id,
            &bundle,
            &state_root,
            lifecycle::CreateOptions {
                pid_file,
                console_socket,
                no_pivot,
                no_new_keyring,
            },
            detach,
        ),
        Command::Exec {
            id,
            cmd,
            tty,
            cwd,
            env,
            user,
            process,
            pid_file,
            console_socket: _,
            detach,
        } => cmd_exec(&id, &state_root, cmd, tty, cwd, env, user, process, pid_file, detach),
        Command::Kill { id, signal, all } => cmd_kill(&id, &state_root, signal, all),
        Command::Delete { id, force } => cmd_delete(&id, &state_root, force),
        Command::State { id } => cmd_state(&id, &state_root),
        Command::List { quiet, format } => cmd_list(&state_root, quiet, &format),
        Command::Spec { rootless } => cmd_spec(rootless),
    }
}

fn cmd_create(
    id: &str,
    bundle: &PathBuf,
    state_root: &std::path::Path,
    opts: lifecycle::CreateOptions,
) -> Result<()> {
    lifecycle::create(id, bundle, state_root, &opts).context("create failed")?;
    println!("{id}");
    Ok(())
}

fn cmd_start(id: &str, state_root: &std::path::Path) -> Result<()> {
    let id = state::resolve_id(state_root, id)?;
    lifecycle::start(&id, state_root).context("start failed")?;
    Ok(())
}

fn cmd_run(
    id: &str,
    bundle: &PathBuf,
    state_root: &std::path::Path,
    opts: lifecycle::CreateOptions,
    detach: bool,
) -> Result<()> {
    if detach {
        lifecycle::create(id, bundle, state_root, &opts).context("create failed")?;
        lifecycle::start(id, state_root).context("start failed")?;
        println!("{id}");
        return Ok(());
    }

    let code = lifecycle::run(id, bundle, state_root, &opts).context("run failed")?;
    std::process::exit(code);
}

#[allow(clippy::too_many_arguments)]
fn cmd_exec(
    id: &str,
    state_root: &std::path::Path,
    mut cmd: Vec<String>,
    tty: bool,
    cwd: Option<String>,
    env: Vec<String>,
    user: Option<String>,
    process: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    detach: bool,
) -> Result<()> {
    let mut opts = exec::ExecOptions {
        cwd,
        env,
        user,
        tty,
        pid_file,
    };

    if let Some(process_path) = process {
        let data = fs::read_to_string(&process_path)
            .with_context(|| format!("failed to read process spec {}", process_path.display()))?;
        let proc_spec: oci_spec::runtime::Process =
            serde_json::from_str(&data).context("failed to parse process spec")?;
        cmd = proc_spec.args().clone().unwrap_or_default();
        if opts.cwd.is_none() {
            opts.cwd = Some(proc_spec.cwd().to_string_lossy().into_owned());
        }
        if let Some(process_env) = proc_spec.env() {
            let mut merged = process_env.clone();
            merged.extend(opts.env.drain(..));
            opts.env = merged;
        }
    }

    if cmd.is_empty() {
        bail!("no command given to exec");
    }

    let code = exec::exec(id, state_root, &cmd, &opts).context("exec failed")?;
    if detach {
        return Ok(());
    }
    std::process::exit(code);
}

fn cmd_kill(id: &str, state_root: &std::path::Path, signal: Option<String>, all: bool) -> Result<()> {
    let id = state::resolve_id(state_root, id)?;
    let sig = lifecycle::parse_signal(signal.as_deref().unwrap_or("TERM"))?;
    lifecycle::send_signal(&id, state_root, sig, all).context("signal failed")?;
    Ok(())
}

fn cmd_delete(id: &str, state_root: &std::path::Path, force: bool) -> Result<()> {
    lifecycle::delete(id, state_root, force).context("delete failed")?;
    Ok(())
}

fn cmd_state(id: &str, state_root: &std::path::Path) -> Result<()> {
    let id = state::resolve_id(state_root, id)?;
    let json = lifecycle::state_json(&id, state_root)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn cmd_list(state_root: &std::path::Path, quiet: bool, format: &str) -> Result<()> {
    let containers = lifecycle::list(state_root)?;

    if quiet {
        for c in &containers {
            println!("{}", c.id);
        }
        return Ok(());
    }

    match format {
        "json" => {
            let values: Vec<_> = containers.iter().map(|c| c.to_oci_json()).collect();
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        _ => {
            println!("{:<18} {:<8} {:<10} {:<24}", "ID", "PID", "STATUS", "BUNDLE");
            for c in &containers {
                let pid_str = if c.pid > 0 { c.pid.to_string() } else { "-".to_string() };
                println!(
                    "{:<18} {:<8} {:<10} {:<24}",
                    &c.id[..18.min(c.id.len())],
                    pid_str,
                    c.status,
                    c.bundle
                );
            }
        }
    }
    Ok(())
}

fn cmd_spec(rootless: bool) -> Result<()> {
    let spec = spec_model::default_spec(rootless)?;
    let json = serde_json::to_string_pretty(&spec)?;
    fs::write("config.json", &json).context("failed to write config.json")?;
    println!("{json}");
    Ok(())
}
