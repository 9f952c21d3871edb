use crate::error::{Result, RunnerError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "tox.toml";

/// Top level of a `tox.toml` file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToxConfig {
    #[serde(default)]
    pub env_list: Vec<String>,
    #[serde(default)]
    pub env_run_base: EnvSection,
    #[serde(default)]
    pub env: BTreeMap<String, EnvSection>,
}

/// Raw settings of one `[env.<name>]` or `[env_run_base]` table.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvSection {
    pub description: Option<String>,
    pub base_python: Option<String>,
    pub conda_python: Option<String>,
    pub conda_name: Option<String>,
    pub conda_env: Option<PathBuf>,
    pub conda_spec: Option<PathBuf>,
    pub conda_deps: Option<Vec<String>>,
    pub conda_channels: Option<Vec<String>>,
    pub conda_install_args: Option<Vec<String>>,
    pub conda_create_args: Option<Vec<String>>,
    pub deps: Option<Vec<String>>,
    pub commands: Option<Vec<Vec<String>>>,
    pub set_env: Option<BTreeMap<String, String>>,
    pub ignore_errors: Option<bool>,
    pub cmd_timeout: Option<f64>,
}

/// Fully resolved settings for one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvConfig {
    pub name: String,
    pub description: Option<String>,
    pub base_python: Option<String>,
    pub conda_python: Option<String>,
    pub conda_name: Option<String>,
    pub conda_env: Option<PathBuf>,
    pub conda_spec: Option<PathBuf>,
    pub conda_deps: Vec<String>,
    pub conda_channels: Vec<String>,
    pub conda_install_args: Vec<String>,
    pub conda_create_args: Vec<String>,
    pub deps: Vec<String>,
    pub commands: Vec<Vec<String>>,
    pub set_env: BTreeMap<String, String>,
    pub ignore_errors: bool,
    pub cmd_timeout: Option<Duration>,
}

impl ToxConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        toml::from_str(text).map_err(|source| RunnerError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Environments run when none are requested: `env_list`, or every defined env.
    pub fn env_names(&self) -> Vec<String> {
        if self.env_list.is_empty() {
            self.env.keys().cloned().collect()
        } else {
            self.env_list.clone()
        }
    }

    fn is_defined(&self, name: &str) -> bool {
        self.env.contains_key(name) || self.env_list.iter().any(|env| env == name)
    }

    /// Expands `-e` values (comma separated, `ALL`) into a deduplicated env list.
    pub fn select(&self, requested: &[String]) -> Result<Vec<String>> {
        let mut selected: Vec<String> = Vec::new();
        let names: Vec<&str> = requested
            .iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();

        if names.is_empty() || names.contains(&"ALL") {
            selected = self.env_names();
        } else {
            for name in names {
                if !self.is_defined(name) {
                    return Err(RunnerError::EnvNotFound(name.to_string()));
                }
                if !selected.iter().any(|env| env == name) {
                    selected.push(name.to_string());
                }
            }
        }

        if selected.is_empty() {
            return Err(RunnerError::InvalidConfig(
                "no environments are defined".to_string(),
            ));
        }
        Ok(selected)
    }

    /// Merges `[env_run_base]` with `[env.<name>]`, the latter winning per key.
    pub fn env_config(&self, name: &str) -> Result<EnvConfig> {
        if !self.is_defined(name) {
            return Err(RunnerError::EnvNotFound(name.to_string()));
        }
        let base = &self.env_run_base;
        let own = self.env.get(name).cloned().unwrap_or_default();

        let cmd_timeout = match own.cmd_timeout.or(base.cmd_timeout) {
            Some(secs) if secs > 0.0 => match Duration::try_from_secs_f64(secs) {
                Ok(timeout) => Some(timeout),
                Err(_) => {
                    return Err(RunnerError::InvalidConfig(format!(
                        "{}: cmd_timeout of {} seconds is out of range",
                        name, secs
                    )))
                }
            },
            Some(secs) => {
                return Err(RunnerError::InvalidConfig(format!(
                    "{}: cmd_timeout must be a positive number of seconds, got {}",
                    name, secs
                )))
            }
            None => None,
        };

        let commands = own
            .commands
            .or_else(|| base.commands.clone())
            .unwrap_or_default();
        if commands.iter().any(|command| command.is_empty()) {
            return Err(RunnerError::InvalidConfig(format!(
                "{}: commands must not contain empty entries",
                name
            )));
        }

        Ok(EnvConfig {
            name: name.to_string(),
            description: own.description.or_else(|| base.description.clone()),
            base_python: own.base_python.or_else(|| base.base_python.clone()),
            conda_python: own.conda_python.or_else(|| base.conda_python.clone()),
            conda_name: own.conda_name.or_else(|| base.conda_name.clone()),
            conda_env: own.conda_env.or_else(|| base.conda_env.clone()),
            conda_spec: own.conda_spec.or_else(|| base.conda_spec.clone()),
            conda_deps: own
                .conda_deps
                .or_else(|| base.conda_deps.clone())
                .unwrap_or_default(),
            conda_channels: own
                .conda_channels
                .or_else(|| base.conda_channels.clone())
                .unwrap_or_default(),
            conda_install_args: own
                .conda_install_args
                .or_else(|| base.conda_install_args.clone())
                .unwrap_or_default(),
            conda_create_args: own
                .conda_create_args
                .or_else(|| base.conda_create_args.clone())
                .unwrap_or_default(),
            deps: own.deps.or_else(|| base.deps.clone()).unwrap_or_default(),
            commands,
            set_env: own
                .set_env
                .or_else(|| base.set_env.clone())
                .unwrap_or_default(),
            ignore_errors: own.ignore_errors.or(base.ignore_errors).unwrap_or(false),
            cmd_timeout,
        })
    }
}

impl EnvConfig {
    /// Python version requested by the configuration, if any.
    ///
    /// `conda_python` wins over `base_python`; without either, env names shaped
    /// like `py311` imply a version.
    pub fn python_version(&self) -> Result<Option<String>> {
        if let Some(spec) = self.conda_python.as_ref().or(self.base_python.as_ref()) {
            return parse_python_spec(spec).map(Some).ok_or_else(|| {
                RunnerError::InvalidConfig(format!(
                    "{}: cannot derive a python version from {:?}",
                    self.name, spec
                ))
            });
        }
        Ok(parse_python_factor(&self.name))
    }
}

fn parse_python_spec(spec: &str) -> Option<String> {
    let spec = spec.trim();
    if let Some(version) = spec.strip_prefix("python") {
        return dotted_version(version);
    }
    if let Some(version) = parse_python_factor(spec) {
        return Some(version);
    }
    dotted_version(spec)
}

/// `py311` -> `3.11`, `py3` -> `3`.
fn parse_python_factor(name: &str) -> Option<String> {
    let digits = name.strip_prefix("py")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (major, minor) = digits.split_at(1);
    if minor.is_empty() {
        Some(major.to_string())
    } else {
        Some(format!("{}.{}", major, minor))
    }
}

fn dotted_version(version: &str) -> Option<String> {
    let valid = !version.is_empty()
        && version
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
    valid.then(|| version.to_string())
}
