use clap::Parser;
use std::process;
use tox_conda::{Cli, Invocation};
use tracing_subscriber::EnvFilter;

/// Entry point of the tox-conda CLI
///
/// Sets up logging, captures the process working directory and environment
/// and hands both to the library entry point.
fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Parse once for the verbosity flag; the library reports usage errors itself
    let verbose = Cli::try_parse_from(&args).map(|cli| cli.verbose).unwrap_or(0);
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let invocation = match Invocation::from_process() {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("Error reading working directory: {}", e);
            process::exit(1);
        }
    };

    process::exit(tox_conda::run(args, &invocation));
}
