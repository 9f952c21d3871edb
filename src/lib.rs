pub mod conda;
pub mod config;
pub mod error;
pub mod execute;

use clap::{Parser, Subcommand};
use indicatif::MultiProgress;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

pub use conda::{CondaEnvRunner, EnvResult};
pub use config::{EnvConfig, ToxConfig, CONFIG_FILE};
pub use error::{Result, RunnerError};
pub use execute::{
    ExecuteFactory, ExecuteInstance, ExecuteOptions, ExecuteRequest, ExecuteStatus,
    LocalExecutor, SyncWrite,
};

#[derive(Parser, Debug)]
#[command(name = "tox-conda", version, about = "Run tox-style environments backed by conda", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to tox.toml in the working directory)
    #[arg(short = 'c', long = "conf", global = true)]
    pub conf: Option<PathBuf>,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision environments and run their commands
    Run {
        /// Environments to run (comma separated, repeatable, or ALL)
        #[arg(short = 'e', long = "env")]
        envs: Vec<String>,
        /// Recreate environments even when their setup is unchanged
        #[arg(short, long)]
        recreate: bool,
        /// Run environments in parallel
        #[arg(short, long)]
        parallel: bool,
    },
    /// List configured environments
    List,
}

/// Where and with which environment a command line is evaluated.
///
/// Nothing in the runner reads the process working directory or environment;
/// everything comes from here.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Forward command output to the parent's stdout/stderr.
    pub echo_output: bool,
    pub show_progress: bool,
}

impl Invocation {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            env: BTreeMap::new(),
            echo_output: false,
            show_progress: false,
        }
    }

    pub fn from_process() -> io::Result<Self> {
        Ok(Self {
            cwd: env::current_dir()?,
            env: env::vars().collect(),
            echo_output: true,
            show_progress: io::stderr().is_terminal(),
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Command line entry point executing through real subprocesses.
pub fn run<I, T>(args: I, invocation: &Invocation) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    run_with(args, invocation, Arc::new(LocalExecutor))
}

/// Command line entry point with an explicit execution strategy.
///
/// Returns the process exit code; it never exits the process itself.
pub fn run_with<I, T>(args: I, invocation: &Invocation, factory: Arc<dyn ExecuteFactory>) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return e.exit_code();
        }
    };
    match execute(cli, invocation, factory) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

/// Dispatches a parsed command line.
pub fn execute(cli: Cli, invocation: &Invocation, factory: Arc<dyn ExecuteFactory>) -> Result<i32> {
    let config_path = cli
        .conf
        .map(|path| invocation.cwd.join(path))
        .unwrap_or_else(|| invocation.cwd.join(CONFIG_FILE));
    debug!("loading {}", config_path.display());
    let config = ToxConfig::load(&config_path)?;

    match cli.command.unwrap_or(Commands::Run {
        envs: Vec::new(),
        recreate: false,
        parallel: false,
    }) {
        Commands::Run {
            envs,
            recreate,
            parallel,
        } => run_envs(&config, &envs, recreate, parallel, invocation, factory),
        Commands::List => {
            list_envs(&config)?;
            Ok(0)
        }
    }
}

fn run_envs(
    config: &ToxConfig,
    requested: &[String],
    recreate: bool,
    parallel: bool,
    invocation: &Invocation,
    factory: Arc<dyn ExecuteFactory>,
) -> Result<i32> {
    let confs = config
        .select(requested)?
        .iter()
        .map(|name| config.env_config(name))
        .collect::<Result<Vec<_>>>()?;

    let progress = invocation.show_progress.then(MultiProgress::new);
    let run_one = |conf: EnvConfig| {
        CondaEnvRunner::new(
            conf,
            invocation,
            Arc::clone(&factory),
            recreate,
            progress.as_ref(),
        )
        .run()
    };
    let results: Vec<EnvResult> = if parallel {
        confs.into_par_iter().map(run_one).collect()
    } else {
        confs.into_iter().map(run_one).collect()
    };

    Ok(report(&results))
}

/// Prints the per-environment summary and returns the aggregate exit code.
pub fn report(results: &[EnvResult]) -> i32 {
    for result in results {
        if result.succeeded() {
            println!("  {}: OK", result.name);
        } else {
            println!("  {}: FAIL code {}", result.name, result.code);
        }
    }
    if results.iter().all(EnvResult::succeeded) {
        info!(envs = results.len(), "all environments succeeded");
        println!("  congratulations :)");
        0
    } else {
        println!("  evaluation failed :(");
        -1
    }
}

pub fn list_envs(config: &ToxConfig) -> Result<()> {
    let names = config.env_names();
    if names.is_empty() {
        println!("No environments configured");
        return Ok(());
    }

    println!("Environments:");
    for name in names {
        match config.env_config(&name)?.description {
            Some(description) => println!("- {} -> {}", name, description),
            None => println!("- {}", name),
        }
    }
    Ok(())
}
