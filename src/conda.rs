//! Provisioning of conda environments and command execution inside them.

use crate::config::EnvConfig;
use crate::error::{Result, RunnerError};
use crate::execute::{ExecuteFactory, ExecuteOptions, ExecuteRequest, SyncWrite};
use crate::Invocation;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const GET_PYTHON_RUN_ID: &str = "_get_python";
pub const CREATE_ENV_RUN_ID: &str = "create_conda_env";
pub const INSTALL_CONDA_DEPS_RUN_ID: &str = "install_conda_deps";
pub const INSTALL_DEPS_RUN_ID: &str = "install_deps";

pub const WORK_DIR: &str = ".tox";
const MARKER_DIR: &str = ".conda-markers";
const PYTHON_VERSION_SCRIPT: &str = "import sys; print('{}.{}'.format(*sys.version_info[:2]))";
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// Final state of one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvResult {
    pub name: String,
    pub code: i32,
}

impl EnvResult {
    pub fn succeeded(&self) -> bool {
        self.code == 0
    }
}

/// Inputs that decide whether an existing environment can be reused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct SetupMarker {
    conda: String,
    python: String,
    target: Vec<String>,
    conda_env: Option<PathBuf>,
    conda_spec: Option<PathBuf>,
    conda_deps: Vec<String>,
    conda_channels: Vec<String>,
    conda_install_args: Vec<String>,
    conda_create_args: Vec<String>,
    deps: Vec<String>,
}

struct Executed {
    code: i32,
    out: String,
}

pub struct CondaEnvRunner<'a> {
    conf: EnvConfig,
    invocation: &'a Invocation,
    factory: Arc<dyn ExecuteFactory>,
    recreate: bool,
    progress: ProgressBar,
}

impl<'a> CondaEnvRunner<'a> {
    /// `progress` is the display shared by every runner of one invocation;
    /// without it the runner stays silent.
    pub fn new(
        conf: EnvConfig,
        invocation: &'a Invocation,
        factory: Arc<dyn ExecuteFactory>,
        recreate: bool,
        progress: Option<&MultiProgress>,
    ) -> Self {
        let progress = if let Some(multi) = progress {
            let bar = multi.add(ProgressBar::new_spinner());
            if let Ok(style) = ProgressStyle::with_template("{spinner} {prefix}: {msg}") {
                bar.set_style(style);
            }
            bar.set_prefix(conf.name.clone());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            conf,
            invocation,
            factory,
            recreate,
            progress,
        }
    }

    pub fn env_dir(&self) -> PathBuf {
        self.invocation.cwd.join(WORK_DIR).join(&self.conf.name)
    }

    fn marker_path(&self) -> PathBuf {
        self.invocation
            .cwd
            .join(WORK_DIR)
            .join(MARKER_DIR)
            .join(format!("{}.json", self.conf.name))
    }

    /// Runs setup and commands, turning any error into a failed result.
    pub fn run(&self) -> EnvResult {
        let code = match self.provision_and_run() {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(env = %self.conf.name, "{}", e);
                e.exit_code()
            }
        };
        self.progress.finish_and_clear();
        EnvResult {
            name: self.conf.name.clone(),
            code,
        }
    }

    fn provision_and_run(&self) -> Result<i32> {
        let conda = self.find_conda()?;
        let discovered = self.get_python(&conda)?;
        let python = match self.conf.python_version()? {
            Some(version) => version,
            None => discovered
                .ok_or_else(|| RunnerError::PythonNotFound(self.conf.name.clone()))?,
        };
        debug!(env = %self.conf.name, %python, "resolved python");

        let marker = self.setup_marker(&conda, &python);
        if self.recreate {
            self.remove_env()?;
        }
        if self.is_reusable(&marker) {
            info!(env = %self.conf.name, "reusing existing conda environment");
        } else {
            let code = self.setup(&conda, &python)?;
            if code != 0 {
                return Ok(code);
            }
            self.write_marker(&marker)?;
        }

        self.run_commands(&conda)
    }

    /// A matching marker only counts while a `-p` prefix is still on disk.
    fn is_reusable(&self, marker: &SetupMarker) -> bool {
        if self.read_marker().as_ref() != Some(marker) {
            return false;
        }
        if self.conf.conda_name.is_none() && !self.env_dir().is_dir() {
            debug!(env = %self.conf.name, "conda prefix is gone, provisioning again");
            return false;
        }
        true
    }

    fn find_conda(&self) -> Result<String> {
        if let Some(exe) = self.invocation.env.get("CONDA_EXE") {
            if !exe.is_empty() {
                return Ok(exe.clone());
            }
        }
        which::which_in(
            "conda",
            self.invocation.env.get("PATH"),
            &self.invocation.cwd,
        )
        .map(|path| path.display().to_string())
        .map_err(|_| RunnerError::CondaNotFound)
    }

    /// Asks the active conda environment which interpreter version it carries.
    fn get_python(&self, conda: &str) -> Result<Option<String>> {
        let active = self
            .invocation
            .env
            .get("CONDA_DEFAULT_ENV")
            .map(String::as_str)
            .unwrap_or("base");
        let cmd = vec![
            conda.to_string(),
            "run".to_string(),
            "-n".to_string(),
            active.to_string(),
            "python".to_string(),
            "-c".to_string(),
            PYTHON_VERSION_SCRIPT.to_string(),
        ];
        let executed = self.execute(cmd, GET_PYTHON_RUN_ID)?;
        if executed.code != 0 {
            warn!(env = %self.conf.name, code = executed.code, "python discovery failed");
            return Ok(None);
        }
        Ok(parse_version_output(&executed.out))
    }

    /// `-p <env dir>` or `-n <conda_name>`.
    fn target(&self) -> Vec<String> {
        match &self.conf.conda_name {
            Some(name) => vec!["-n".to_string(), name.clone()],
            None => vec!["-p".to_string(), self.env_dir().display().to_string()],
        }
    }

    fn resolve(&self, path: &Path) -> String {
        self.invocation.cwd.join(path).display().to_string()
    }

    fn setup(&self, conda: &str, python: &str) -> Result<i32> {
        let create = self.create_command(conda, python);
        info!(env = %self.conf.name, "creating conda environment");
        let code = self.execute(create, CREATE_ENV_RUN_ID)?.code;
        if code != 0 {
            return Ok(code);
        }

        if let Some(install) = self.install_conda_deps_command(conda) {
            info!(env = %self.conf.name, "installing conda dependencies");
            let code = self.execute(install, INSTALL_CONDA_DEPS_RUN_ID)?.code;
            if code != 0 {
                return Ok(code);
            }
        }

        if !self.conf.deps.is_empty() {
            let mut install = self.run_prefix(conda);
            install.extend(["python", "-m", "pip", "install"].map(String::from));
            install.extend(self.conf.deps.iter().cloned());
            info!(env = %self.conf.name, "installing pip dependencies");
            let code = self.execute(install, INSTALL_DEPS_RUN_ID)?.code;
            if code != 0 {
                return Ok(code);
            }
        }
        Ok(0)
    }

    fn create_command(&self, conda: &str, python: &str) -> Vec<String> {
        let mut cmd = vec![conda.to_string()];
        if let Some(env_file) = &self.conf.conda_env {
            cmd.extend(["env", "create"].map(String::from));
            cmd.extend(self.target());
            cmd.extend([
                "--file".to_string(),
                self.resolve(env_file),
                "--quiet".to_string(),
                "--force".to_string(),
            ]);
        } else {
            cmd.push("create".to_string());
            cmd.extend(self.target());
            cmd.push(format!("python={}", python));
            cmd.extend(["--yes", "--quiet"].map(String::from));
            cmd.extend(self.channel_args());
        }
        cmd.extend(self.conf.conda_create_args.iter().cloned());
        cmd
    }

    fn install_conda_deps_command(&self, conda: &str) -> Option<Vec<String>> {
        if self.conf.conda_deps.is_empty() && self.conf.conda_spec.is_none() {
            return None;
        }
        let mut cmd = vec![conda.to_string()];
        cmd.extend(["install", "--quiet", "--yes"].map(String::from));
        cmd.extend(self.target());
        cmd.extend(self.channel_args());
        cmd.extend(self.conf.conda_install_args.iter().cloned());
        cmd.extend(self.conf.conda_deps.iter().cloned());
        if let Some(spec) = &self.conf.conda_spec {
            cmd.push("--file".to_string());
            cmd.push(self.resolve(spec));
        }
        Some(cmd)
    }

    fn channel_args(&self) -> Vec<String> {
        self.conf
            .conda_channels
            .iter()
            .flat_map(|channel| ["--channel".to_string(), channel.clone()])
            .collect()
    }

    fn run_prefix(&self, conda: &str) -> Vec<String> {
        let mut cmd = vec![conda.to_string(), "run".to_string()];
        cmd.extend(self.target());
        cmd.push("--live-stream".to_string());
        cmd
    }

    fn run_commands(&self, conda: &str) -> Result<i32> {
        let mut first_failure = 0;
        for (index, command) in self.conf.commands.iter().enumerate() {
            let (ignore_exit_code, command) = strip_ignore_prefix(command);
            if command.is_empty() {
                return Err(RunnerError::InvalidConfig(format!(
                    "{}: commands[{}] is empty",
                    self.conf.name, index
                )));
            }
            let mut cmd = self.run_prefix(conda);
            cmd.extend(command);

            let code = self.execute(cmd, &format!("commands[{}]", index))?.code;
            if code == 0 || ignore_exit_code {
                continue;
            }
            warn!(env = %self.conf.name, index, code, "command failed");
            if !self.conf.ignore_errors {
                return Ok(code);
            }
            if first_failure == 0 {
                first_failure = code;
            }
        }
        Ok(first_failure)
    }

    fn execute(&self, cmd: Vec<String>, run_id: &str) -> Result<Executed> {
        let env = merged_env(&self.invocation.env, &self.conf.set_env);
        let request = ExecuteRequest::new(cmd, &self.invocation.cwd, env, run_id);
        let options = ExecuteOptions {
            timeout: self.conf.cmd_timeout,
        };
        self.progress.set_message(request.shell_cmd());

        let out = SyncWrite::new("out", self.invocation.echo_output);
        let err = SyncWrite::new("err", self.invocation.echo_output);
        let instance = self.factory.create(request, options, out, err);
        let mut status = instance.start()?;
        let code = match status.wait(None)? {
            Some(code) => code,
            None => {
                warn!(env = %self.conf.name, %run_id, "timed out, interrupting");
                status.interrupt()?;
                status.wait(Some(INTERRUPT_GRACE))?.unwrap_or(-1)
            }
        };
        debug!(env = %self.conf.name, %run_id, code, "finished");
        Ok(Executed {
            code,
            out: status.out().text(),
        })
    }

    fn setup_marker(&self, conda: &str, python: &str) -> SetupMarker {
        SetupMarker {
            conda: conda.to_string(),
            python: python.to_string(),
            target: self.target(),
            conda_env: self.conf.conda_env.clone(),
            conda_spec: self.conf.conda_spec.clone(),
            conda_deps: self.conf.conda_deps.clone(),
            conda_channels: self.conf.conda_channels.clone(),
            conda_install_args: self.conf.conda_install_args.clone(),
            conda_create_args: self.conf.conda_create_args.clone(),
            deps: self.conf.deps.clone(),
        }
    }

    fn read_marker(&self) -> Option<SetupMarker> {
        let path = self.marker_path();
        let file = File::open(&path).ok()?;
        match serde_json::from_reader(BufReader::new(file)) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!("ignoring unreadable marker {}: {}", path.display(), e);
                None
            }
        }
    }

    fn write_marker(&self, marker: &SetupMarker) -> Result<()> {
        let path = self.marker_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, marker)?;
        Ok(())
    }

    fn remove_env(&self) -> Result<()> {
        let marker = self.marker_path();
        if marker.exists() {
            fs::remove_file(&marker)?;
        }
        let env_dir = self.env_dir();
        if env_dir.exists() {
            info!(env = %self.conf.name, "removing {}", env_dir.display());
            fs::remove_dir_all(&env_dir)?;
        }
        Ok(())
    }
}

/// A leading `-` (own argument or prefix of the first one) ignores the exit code.
fn strip_ignore_prefix(command: &[String]) -> (bool, Vec<String>) {
    match command.split_first() {
        Some((first, rest)) if first == "-" => (true, rest.to_vec()),
        Some((first, rest)) if first.starts_with('-') => {
            let mut stripped = vec![first[1..].to_string()];
            stripped.extend(rest.iter().cloned());
            (true, stripped)
        }
        _ => (false, command.to_vec()),
    }
}

fn parse_version_output(output: &str) -> Option<String> {
    let line = output.lines().rev().map(str::trim).find(|line| !line.is_empty())?;
    let valid = line
        .split('.')
        .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
    valid.then(|| line.to_string())
}

fn merged_env(
    base: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = base.clone();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}
