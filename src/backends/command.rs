// ABOUTME: Backend that runs commands and shell scripts as local child processes
// ABOUTME: Supports run-to-completion execution and detached operations probed on later wake-ups

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{OperationBackend, ProbeStatus};
use crate::engine::{Clock, SystemClock};
use crate::operation::{
    Operation, OperationError, OperationId, OperationResult, Result, ResultPayload, Timestamp,
};

pub const LOCAL_EXEC_BACKEND: &str = "local_exec";

/// What to run on this host.
///
/// Supports two modes:
/// 1. Simple command: `command` + `args`
/// 2. Script mode: `script` is written to a temporary file and run with `shell`
///
/// ```yaml
/// script: |
///   pg_dump orders > /var/backups/orders.sql
///   gzip -f /var/backups/orders.sql
/// env:
///   PGHOST: db1
/// expected_exit_codes: [0]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Mutually exclusive with `script`.
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub script: Option<String>,

    /// Interpreter for script mode (default: /bin/bash)
    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    /// Exit codes considered successful (default: [0])
    #[serde(default)]
    pub expected_exit_codes: Vec<i32>,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

impl Default for ExecRequest {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            script: None,
            shell: default_shell(),
            env: HashMap::new(),
            working_dir: None,
            expected_exit_codes: vec![0],
            description: None,
        }
    }
}

impl ExecRequest {
    pub fn command(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: Some(command.into()),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn script(script: impl Into<String>) -> Self {
        Self {
            script: Some(script.into()),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.command, &self.script) {
            (None, None) => Err(OperationError::invalid(
                "command",
                "either 'command' or 'script' must be provided",
            )),
            (Some(_), Some(_)) => Err(OperationError::invalid(
                "command",
                "cannot specify both 'command' and 'script'",
            )),
            (Some(command), None) if command.trim().is_empty() => {
                Err(OperationError::invalid("command", "command cannot be empty"))
            }
            (None, Some(script)) if script.trim().is_empty() => {
                Err(OperationError::invalid("script", "script cannot be empty"))
            }
            (None, Some(_)) if self.shell.trim().is_empty() => Err(OperationError::invalid(
                "shell",
                "shell interpreter cannot be empty when using script mode",
            )),
            _ => Ok(()),
        }
    }

    fn label(&self) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }
        match (&self.command, &self.script) {
            (Some(command), _) if self.args.is_empty() => command.clone(),
            (Some(command), _) => format!("{} {}", command, self.args.join(" ")),
            _ => format!("{} script", self.shell),
        }
    }

    fn success_codes(&self) -> Vec<i32> {
        if self.expected_exit_codes.is_empty() {
            vec![0]
        } else {
            self.expected_exit_codes.clone()
        }
    }
}

/// Captured outcome of a run-to-completion execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

struct RunningProcess {
    child: Child,
    owner_id: String,
    start_time: Timestamp,
    stdout: NamedTempFile,
    stderr: NamedTempFile,
    // Held so the script outlives the child
    _script: Option<NamedTempFile>,
}

impl RunningProcess {
    async fn finished_result(
        &self,
        id: &OperationId,
        status: std::process::ExitStatus,
        now: Timestamp,
    ) -> Result<OperationResult> {
        let (exit_code, exit_message) = describe_exit(status);
        let stdout = read_lossy(&self.stdout).await?;
        let stderr = read_lossy(&self.stderr).await?;

        let mut result = OperationResult::new();
        result.set_id(id.clone())?;
        result.set_owner_id(self.owner_id.clone())?;
        result.set_start_time(self.start_time)?;
        result.set_end_time(now.max(self.start_time))?;
        result.set_exit_code(exit_code)?;
        result.set_exit_message(exit_message)?;
        result.set_payload(ResultPayload::Output { stdout, stderr });
        Ok(result)
    }

    async fn output_size(&self) -> Result<u64> {
        let mut total = 0;
        for file in [&self.stdout, &self.stderr] {
            let metadata = tokio::fs::metadata(file.path())
                .await
                .map_err(|e| OperationError::unavailable(LOCAL_EXEC_BACKEND, e.to_string()))?;
            total += metadata.len();
        }
        Ok(total)
    }
}

pub struct LocalExecBackend {
    host: String,
    clock: Arc<dyn Clock>,
    processes: Mutex<HashMap<OperationId, RunningProcess>>,
}

impl Default for LocalExecBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalExecBackend {
    pub fn new() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self::with_host(host)
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            clock: Arc::new(SystemClock),
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Timestamps start and end times from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Number of detached processes whose results have not been released.
    pub async fn tracked(&self) -> usize {
        self.processes.lock().await.len()
    }

    /// Runs the request to completion and returns its captured output.
    pub async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        request.validate()?;
        let start_time = self.clock.now();
        let script = write_script(request)?;
        let mut cmd = build_command(request, script.as_ref());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        info!("Executing on {}: {}", self.host, request.label());
        let output = cmd.output().await.map_err(|e| spawn_error(request, e))?;

        let (exit_code, _) = describe_exit(output.status);
        debug!("Command completed with exit code: {}", exit_code);

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            start_time,
            end_time: self.clock.now().max(start_time),
        })
    }

    /// Starts the request detached and returns the operation tracking it.
    ///
    /// Output goes to temporary files so progress can be sampled while the
    /// process runs; they are removed when the operation is released.
    pub async fn spawn(&self, request: &ExecRequest, owner_id: &str) -> Result<Operation> {
        request.validate()?;

        let mut operation = Operation::new(LOCAL_EXEC_BACKEND, request.label());
        operation.set_owner_id(owner_id)?;
        operation.set_success_codes(request.success_codes())?;

        let stdout = NamedTempFile::new().map_err(io_unavailable)?;
        let stderr = NamedTempFile::new().map_err(io_unavailable)?;
        let script = write_script(request)?;

        let mut cmd = build_command(request, script.as_ref());
        cmd.stdout(Stdio::from(stdout.reopen().map_err(io_unavailable)?));
        cmd.stderr(Stdio::from(stderr.reopen().map_err(io_unavailable)?));

        let start_time = self.clock.now();
        let child = cmd.spawn().map_err(|e| spawn_error(request, e))?;
        let pid = child.id().ok_or_else(|| {
            OperationError::unavailable(LOCAL_EXEC_BACKEND, "child exited before its pid was read")
        })?;

        let id = OperationId::remote(self.host.clone(), pid, start_time);
        operation.set_id(id.clone())?;
        operation.set_start_time(start_time)?;

        info!("Started {} as {}", request.label(), id);

        self.processes.lock().await.insert(
            id,
            RunningProcess {
                child,
                owner_id: owner_id.to_string(),
                start_time,
                stdout,
                stderr,
                _script: script,
            },
        );

        Ok(operation)
    }
}

#[async_trait]
impl OperationBackend for LocalExecBackend {
    fn kind(&self) -> &str {
        LOCAL_EXEC_BACKEND
    }

    async fn probe_status(&self, operation: &Operation) -> Result<ProbeStatus> {
        let id = operation.id()?;
        let mut processes = self.processes.lock().await;
        let Some(process) = processes.get_mut(id) else {
            return Ok(ProbeStatus::Unknown);
        };

        match process.child.try_wait() {
            Ok(None) => Ok(ProbeStatus::Running),
            Ok(Some(status)) => {
                let result = process
                    .finished_result(id, status, self.clock.now())
                    .await?;
                Ok(ProbeStatus::Finished(result))
            }
            Err(e) => Err(OperationError::unavailable(
                LOCAL_EXEC_BACKEND,
                format!("failed to poll {}: {}", id, e),
            )),
        }
    }

    async fn kill(&self, operation: &Operation) -> Result<bool> {
        let id = operation.id()?;
        let mut processes = self.processes.lock().await;
        let Some(process) = processes.get_mut(id) else {
            return Ok(operation.has_completed());
        };

        if let Err(e) = process.child.start_kill() {
            // Already reaped counts as stopped
            if matches!(process.child.try_wait(), Ok(Some(_))) {
                return Ok(true);
            }
            warn!("Failed to kill {}: {}", id, e);
            return Err(OperationError::unavailable(LOCAL_EXEC_BACKEND, e.to_string()));
        }
        info!("Sent kill to {}", id);
        Ok(true)
    }

    async fn fetch_progress(&self, operation: &Operation) -> Result<Option<u64>> {
        let id = operation.id()?;
        let processes = self.processes.lock().await;
        match processes.get(id) {
            Some(process) => Ok(Some(process.output_size().await?)),
            None => Ok(None),
        }
    }

    async fn release(&self, operation: &Operation) -> Result<()> {
        let id = operation.id()?;
        if self.processes.lock().await.remove(id).is_some() {
            debug!("Released output files of {}", id);
        }
        Ok(())
    }
}

fn describe_exit(status: std::process::ExitStatus) -> (i32, String) {
    match (status.code(), status.signal()) {
        (Some(code), _) => (code, format!("exited with code {}", code)),
        (None, Some(signal)) => (-1, format!("terminated by signal {}", signal)),
        (None, None) => (-1, "exited without a status".to_string()),
    }
}

fn build_command(request: &ExecRequest, script: Option<&NamedTempFile>) -> Command {
    let mut cmd = match (script, &request.command) {
        (Some(file), _) => {
            let mut cmd = Command::new(&request.shell);
            cmd.arg(file.path());
            cmd
        }
        (None, Some(command)) => {
            let mut cmd = Command::new(command);
            cmd.args(&request.args);
            cmd
        }
        // validate() rules this out; run the shell with no input
        (None, None) => Command::new(&request.shell),
    };

    for (key, value) in &request.env {
        cmd.env(key, value);
    }
    if let Some(working_dir) = &request.working_dir {
        cmd.current_dir(working_dir);
    }
    cmd.stdin(Stdio::null());
    cmd
}

fn write_script(request: &ExecRequest) -> Result<Option<NamedTempFile>> {
    let Some(script) = &request.script else {
        return Ok(None);
    };

    let mut file = NamedTempFile::new().map_err(io_unavailable)?;
    file.write_all(script.as_bytes()).map_err(io_unavailable)?;
    file.flush().map_err(io_unavailable)?;

    let mut perms = std::fs::metadata(file.path())
        .map_err(io_unavailable)?
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(file.path(), perms).map_err(io_unavailable)?;

    debug!("Wrote script ({} bytes) to {:?}", script.len(), file.path());
    Ok(Some(file))
}

async fn read_lossy(file: &NamedTempFile) -> Result<String> {
    let bytes = tokio::fs::read(file.path()).await.map_err(io_unavailable)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

fn io_unavailable(e: std::io::Error) -> OperationError {
    OperationError::unavailable(LOCAL_EXEC_BACKEND, e.to_string())
}

fn spawn_error(request: &ExecRequest, e: std::io::Error) -> OperationError {
    if e.kind() == std::io::ErrorKind::NotFound {
        OperationError::invalid(
            "command",
            format!("'{}' could not be started: {}", request.label(), e),
        )
    } else {
        OperationError::unavailable(
            LOCAL_EXEC_BACKEND,
            format!("failed to start '{}': {}", request.label(), e),
        )
    }
}
