pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// craterun — an OCI Runtime Specification container runtime for Linux.
#[derive(Parser, Debug)]
#[command(name = "craterun", version, about)]
pub struct Cli {
    /// State directory root (default: /run/craterun, or $HOME/.craterun when unprivileged).
    #[arg(long, short = 'r', global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a container from a bundle without starting it.
    Create {
        id: String,
        bundle: PathBuf,

        #[arg(long)]
        pid_file: Option<PathBuf>,

        #[arg(long)]
        console_socket: Option<PathBuf>,

        #[arg(long)]
        no_pivot: bool,

        #[arg(long)]
        no_new_keyring: bool,
    },

    /// Start a previously created container.
    Start { id: String },

    /// Create, start, and wait on a container.
    Run {
        id: String,
        bundle: PathBuf,

        #[arg(long)]
        pid_file: Option<PathBuf>,

        #[arg(long)]
        console_socket: Option<PathBuf>,

        #[arg(long)]
        no_pivot: bool,

        #[arg(long)]
        no_new_keyring: bool,

        /// Run detached; print the container id and return immediately
        /// instead of waiting for the init process to exit.
        #[arg(long, short = 'd')]
        detach: bool,

        /// Allocate a terminal (informational; actual PTY plumbing is an
        /// external collaborator per spec.md §1).
        #[arg(long, short = 't')]
        tty: bool,
    },

    /// Execute an additional process inside a running container.
    Exec {
        id: String,

        #[arg(last = true, required = true)]
        cmd: Vec<String>,

        #[arg(long, short = 't')]
        tty: bool,

        #[arg(long)]
        cwd: Option<String>,

        /// Additional environment variables, `KEY=VALUE`. May repeat.
        #[arg(long, short = 'e')]
        env: Vec<String>,

        /// Run as `uid[:gid]` inside the container.
        #[arg(long)]
        user: Option<String>,

        /// Load the process spec from a JSON file instead of CLI arguments.
        #[arg(short = 'p')]
        process: Option<PathBuf>,

        #[arg(long)]
        pid_file: Option<PathBuf>,

        #[arg(long)]
        console_socket: Option<PathBuf>,

        #[arg(long, short = 'd')]
        detach: bool,
    },

    /// Send a signal to a container's init process.
    Kill {
        id: String,
        signal: Option<String>,

        /// Deliver to the init process group instead of just the init pid.
        #[arg(long, short = 'a')]
        all: bool,
    },

    /// Delete a stopped container's state.
    Delete {
        id: String,

        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Print a container's OCI state JSON.
    State { id: String },

    /// List known containers.
    List {
        #[arg(long, short = 'q')]
        quiet: bool,

        #[arg(long, short = 'f', default_value = "table")]
        format: String,
    },

    /// Emit a default `config.json` to stdout.
    Spec {
        #[arg(long)]
        rootless: bool,
    },
}

/// Parse CLI arguments. Called from `main` after the internal re-exec
/// subcommands (`__craterun_init`, `__craterun_nsenter`) have been ruled out.
pub fn parse() -> Cli {
    Cli::parse()
}
