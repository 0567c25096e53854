mod cli;
mod core;
mod platform;
mod util;

use std::process;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("CRATERUN_LOG")
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    // The init and exec re-exec entrypoints are dispatched on argv[1] before
    // normal CLI parsing; they're invoked by this same binary, not by a user,
    // and carry their state through environment variables (spec.md §9).
    let mut args = std::env::args();
    let _argv0 = args.next();
    match args.next().as_deref() {
        Some(platform::linux::init_stage::INIT_SUBCOMMAND) => platform::linux::init_stage::run(),
        Some(core::exec::EXEC_SUBCOMMAND) => core::exec::run_nsenter(),
        _ => {
            let args = cli::parse();
            if let Err(e) = cli::commands::dispatch(args) {
                eprintln!("craterun: {e:#}");
                process::exit(1);
            }
        }
    }
}
