#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs::{self, File};
use std::io::{self, Write};
use std::iter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tox_conda::{
    run_with, ExecuteFactory, ExecuteInstance, ExecuteOptions, ExecuteRequest, ExecuteStatus,
    Invocation, LocalExecutor, Result, SyncWrite,
};

/// Forces embedded, symlinked virtualenv seeding so real runs stay deterministic.
pub const VIRTUALENV_ENV: [(&str, &str); 5] = [
    ("VIRTUALENV_SYMLINK_APP_DATA", "1"),
    ("VIRTUALENV_SYMLINKS", "1"),
    ("VIRTUALENV_PIP", "embed"),
    ("VIRTUALENV_WHEEL", "embed"),
    ("VIRTUALENV_SETUPTOOLS", "embed"),
];

/// Variables a run sees once the interception layer is installed.
pub const CONDA_ENV: [(&str, &str); 2] = [("CONDA_EXE", "conda"), ("CONDA_DEFAULT_ENV", "test-env")];

pub const DEFAULT_UNMOCKED_RUN_IDS: [&str; 1] = ["_get_python"];

/// Serializes tests that change the process working directory.
pub static CWD_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    code: i32,
}

impl Outcome {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn succeeded(&self) -> bool {
        self.code == 0
    }

    pub fn assert_success(&self) {
        assert_eq!(self.code, 0, "expected a successful run, got exit code {}", self.code);
    }
}

/// Throwaway project directory holding the files a test run needs.
pub struct ToxProject {
    dir: TempDir,
    env: BTreeMap<String, String>,
    show_progress: bool,
}

impl ToxProject {
    pub fn new(files: &[(&str, &str)]) -> io::Result<Self> {
        let dir = TempDir::new()?;
        for (name, content) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, content)?;
        }
        Ok(Self {
            dir,
            env: BTreeMap::new(),
            show_progress: false,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Extra variable for every run of this project.
    pub fn with_env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    /// Moves the process into `to` (or the project root) until the guard drops.
    pub fn chdir(&self, to: Option<&Path>) -> io::Result<CwdGuard> {
        let previous = env::current_dir()?;
        env::set_current_dir(to.unwrap_or_else(|| self.path()))?;
        Ok(CwdGuard { previous })
    }

    /// Invocation rooted at the project; project variables win over `extra`.
    pub fn invocation(&self, extra: &BTreeMap<String, String>) -> Invocation {
        let mut invocation = Invocation::new(self.path());
        for (key, value) in VIRTUALENV_ENV {
            invocation = invocation.with_env(key, value);
        }
        invocation.env.extend(extra.clone());
        invocation.env.extend(self.env.clone());
        invocation.show_progress = self.show_progress;
        invocation
    }

    /// Draws env spinners as a terminal run would.
    pub fn with_progress(mut self) -> Self {
        self.show_progress = true;
        self
    }

    pub fn run(&self, args: &[&str], conda: &Arc<MockConda>) -> Outcome {
        let argv = iter::once("tox-conda").chain(args.iter().copied());
        let invocation = self.invocation(&conda.env());
        let factory: Arc<dyn ExecuteFactory> = conda.clone();
        Outcome::new(run_with(argv, &invocation, factory))
    }
}

pub struct CwdGuard {
    previous: PathBuf,
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let _ = env::set_current_dir(&self.previous);
    }
}

/// Status of an execution that never ran.
pub struct MockExecuteStatus {
    exit_code: i32,
    out: SyncWrite,
    err: SyncWrite,
}

impl ExecuteStatus for MockExecuteStatus {
    fn exit_code(&self) -> Option<i32> {
        Some(self.exit_code)
    }

    fn wait(&mut self, _timeout: Option<Duration>) -> Result<Option<i32>> {
        Ok(Some(self.exit_code))
    }

    fn write_stdin(&mut self, _content: &str) -> Result<()> {
        Ok(())
    }

    fn interrupt(&mut self) -> Result<()> {
        Ok(())
    }

    fn out(&self) -> &SyncWrite {
        &self.out
    }

    fn err(&self) -> &SyncWrite {
        &self.err
    }
}

pub struct MockExecuteInstance {
    request: ExecuteRequest,
    out: SyncWrite,
    err: SyncWrite,
    exit_code: i32,
}

impl MockExecuteInstance {
    pub fn new(request: ExecuteRequest, out: SyncWrite, err: SyncWrite, exit_code: i32) -> Self {
        Self {
            request,
            out,
            err,
            exit_code,
        }
    }
}

impl ExecuteInstance for MockExecuteInstance {
    fn request(&self) -> &ExecuteRequest {
        &self.request
    }

    fn cmd(&self) -> &[String] {
        &self.request.cmd
    }

    fn start(self: Box<Self>) -> Result<Box<dyn ExecuteStatus>> {
        Ok(Box::new(MockExecuteStatus {
            exit_code: self.exit_code,
            out: self.out,
            err: self.err,
        }))
    }
}

/// Records every requested command and fakes all but the allow-listed ones.
pub struct MockConda {
    original: Arc<dyn ExecuteFactory>,
    unmocked_run_ids: HashSet<String>,
    exit_code: i32,
    shell_cmds: Mutex<Vec<String>>,
}

impl MockConda {
    /// Intercepts on top of the real subprocess executor.
    ///
    /// `None` keeps only python discovery real.
    pub fn install(unmocked_run_ids: Option<&[&str]>, exit_code: i32) -> Arc<Self> {
        Self::wrapping(Arc::new(LocalExecutor), unmocked_run_ids, exit_code)
    }

    pub fn wrapping(
        original: Arc<dyn ExecuteFactory>,
        unmocked_run_ids: Option<&[&str]>,
        exit_code: i32,
    ) -> Arc<Self> {
        let ids = unmocked_run_ids.unwrap_or(&DEFAULT_UNMOCKED_RUN_IDS[..]);
        Arc::new(Self {
            original,
            unmocked_run_ids: ids.iter().map(|id| id.to_string()).collect(),
            exit_code,
            shell_cmds: Mutex::new(Vec::new()),
        })
    }

    pub fn shell_cmds(&self) -> Vec<String> {
        self.shell_cmds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Environment the runner needs to reach the intercepted conda.
    pub fn env(&self) -> BTreeMap<String, String> {
        CONDA_ENV
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }
}

impl ExecuteFactory for MockConda {
    fn create(
        &self,
        request: ExecuteRequest,
        options: ExecuteOptions,
        out: SyncWrite,
        err: SyncWrite,
    ) -> Box<dyn ExecuteInstance> {
        self.shell_cmds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.shell_cmd());

        if self.unmocked_run_ids.contains(&request.run_id) {
            self.original.create(request, options, out, err)
        } else {
            Box::new(MockExecuteInstance::new(request, out, err, self.exit_code))
        }
    }
}

/// Execution that never finishes on its own; only an interrupt ends it.
pub struct StalledExecuteStatus {
    interrupted: bool,
    interrupts: Arc<Mutex<Vec<String>>>,
    run_id: String,
    out: SyncWrite,
    err: SyncWrite,
}

impl ExecuteStatus for StalledExecuteStatus {
    fn exit_code(&self) -> Option<i32> {
        self.interrupted.then_some(-9)
    }

    fn wait(&mut self, _timeout: Option<Duration>) -> Result<Option<i32>> {
        Ok(self.exit_code())
    }

    fn write_stdin(&mut self, _content: &str) -> Result<()> {
        Ok(())
    }

    fn interrupt(&mut self) -> Result<()> {
        self.interrupted = true;
        self.interrupts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.run_id.clone());
        Ok(())
    }

    fn out(&self) -> &SyncWrite {
        &self.out
    }

    fn err(&self) -> &SyncWrite {
        &self.err
    }
}

struct StalledExecuteInstance {
    request: ExecuteRequest,
    interrupts: Arc<Mutex<Vec<String>>>,
    out: SyncWrite,
    err: SyncWrite,
}

impl ExecuteInstance for StalledExecuteInstance {
    fn request(&self) -> &ExecuteRequest {
        &self.request
    }

    fn cmd(&self) -> &[String] {
        &self.request.cmd
    }

    fn start(self: Box<Self>) -> Result<Box<dyn ExecuteStatus>> {
        Ok(Box::new(StalledExecuteStatus {
            interrupted: false,
            interrupts: self.interrupts,
            run_id: self.request.run_id,
            out: self.out,
            err: self.err,
        }))
    }
}

/// Stand-in for delegated executions: answers per run-id and keeps every request.
#[derive(Default)]
pub struct ScriptedExecutor {
    codes: BTreeMap<String, i32>,
    output: BTreeMap<String, String>,
    stalled: HashSet<String>,
    calls: Mutex<Vec<(ExecuteRequest, ExecuteOptions)>>,
    interrupts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit_code(mut self, run_id: &str, code: i32) -> Self {
        self.codes.insert(run_id.to_string(), code);
        self
    }

    pub fn stdout(mut self, run_id: &str, text: &str) -> Self {
        self.output.insert(run_id.to_string(), text.to_string());
        self
    }

    /// `run_id` hangs until the runner interrupts it.
    pub fn stall(mut self, run_id: &str) -> Self {
        self.stalled.insert(run_id.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|request| request.run_id)
            .collect()
    }

    pub fn requests(&self) -> Vec<ExecuteRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(request, _)| request.clone())
            .collect()
    }

    pub fn options(&self, run_id: &str) -> Option<ExecuteOptions> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(request, _)| request.run_id == run_id)
            .map(|(_, options)| options.clone())
    }

    pub fn interrupts(&self) -> Vec<String> {
        self.interrupts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ExecuteFactory for ScriptedExecutor {
    fn create(
        &self,
        request: ExecuteRequest,
        options: ExecuteOptions,
        mut out: SyncWrite,
        err: SyncWrite,
    ) -> Box<dyn ExecuteInstance> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((request.clone(), options));
        if self.stalled.contains(&request.run_id) {
            return Box::new(StalledExecuteInstance {
                request,
                interrupts: Arc::clone(&self.interrupts),
                out,
                err,
            });
        }
        if let Some(text) = self.output.get(&request.run_id) {
            let _ = out.write_all(text.as_bytes());
        }
        let code = self.codes.get(&request.run_id).copied().unwrap_or(0);
        Box::new(MockExecuteInstance::new(request, out, err, code))
    }
}

/// A `conda` shell script on a private PATH entry.
pub struct FakeConda {
    dir: TempDir,
    pub conda_path: PathBuf,
}

impl FakeConda {
    /// Script printing `stdout` and exiting with `exit_code` whatever it is asked.
    pub fn new(stdout: &str, exit_code: i32) -> io::Result<Self> {
        let dir = TempDir::new()?;
        let conda_path = dir.path().join("conda");

        let mut file = File::create(&conda_path)?;
        writeln!(file, "#!/bin/sh")?;
        writeln!(file, "echo '{}'", stdout)?;
        writeln!(file, "exit {}", exit_code)?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&conda_path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&conda_path, perms)?;
        }

        Ok(Self { dir, conda_path })
    }

    /// `PATH` value with the script's directory first.
    pub fn path_var(&self) -> String {
        let path_var = env::var_os("PATH").unwrap_or_default();
        let mut paths = env::split_paths(&path_var).collect::<Vec<_>>();
        paths.insert(0, self.dir.path().to_path_buf());
        env::join_paths(paths)
            .map(|joined| joined.to_string_lossy().into_owned())
            .unwrap_or_else(|_| self.dir.path().display().to_string())
    }
}
