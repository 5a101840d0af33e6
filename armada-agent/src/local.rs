//! Local command execution on the node, behind the deny guard.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use armada_protocol::{
    CommandEnvelope, FileAction, FileCommand, NodeResult, ResultStatus, ShellCommand, TypedCommand,
};

use crate::guard::CommandGuard;

/// Marker appended when captured output exceeds the configured cap.
const TRUNCATION_MARKER: &str = "\n... [output truncated]";

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

pub struct LocalExecutor {
    guard: CommandGuard,
    node_id: String,
    hostname: String,
    default_shell: String,
    max_output_bytes: usize,
}

impl LocalExecutor {
    pub fn new(
        node_id: impl Into<String>,
        hostname: impl Into<String>,
        default_shell: impl Into<String>,
        max_output_bytes: usize,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            guard: CommandGuard::new()?,
            node_id: node_id.into(),
            hostname: hostname.into(),
            default_shell: default_shell.into(),
            max_output_bytes: max_output_bytes.max(1024),
        })
    }

    /// Execute one command envelope, always producing exactly one result.
    pub async fn run(&self, envelope: &CommandEnvelope) -> NodeResult {
        match &envelope.command {
            TypedCommand::Shell(shell) => self.run_shell(shell, envelope.timeout_secs).await,
            TypedCommand::File(file) => self.run_file(file).await,
            other => self.failure(
                format!("unsupported command type on agent: {}", other.kind()),
                0,
            ),
        }
    }

    async fn run_shell(&self, shell: &ShellCommand, envelope_timeout: Option<u64>) -> NodeResult {
        if let Some(reason) = self.guard.check_shell(&shell.command) {
            warn!(command = %shell.command, "command blocked: {}", reason);
            return self.blocked(reason);
        }

        // Effective deadline: the earlier of the request deadline and the
        // per-command timeout.
        let timeout_secs = match (envelope_timeout, shell.timeout_sec) {
            (Some(a), Some(b)) if b > 0 => a.min(b),
            (Some(a), _) => a,
            (None, Some(b)) if b > 0 => b,
            _ => DEFAULT_COMMAND_TIMEOUT_SECS,
        };
        let deadline = Duration::from_secs(timeout_secs.max(1));

        let shell_bin = shell.shell.as_deref().unwrap_or(&self.default_shell);
        let mut command = Command::new(shell_bin);
        command
            .arg("-c")
            .arg(&shell.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &shell.work_dir {
            command.current_dir(dir);
        }
        for (key, value) in &shell.env {
            command.env(key, value);
        }

        debug!(command = %shell.command, timeout_secs, "running shell command");
        let started = Instant::now();
        match tokio::time::timeout(deadline, command.output()).await {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                // stdout first, then stderr.
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                let truncated = self.truncate(combined);
                NodeResult {
                    node_id: self.node_id.clone(),
                    hostname: self.hostname.clone(),
                    output: truncated,
                    exit_code,
                    error: (exit_code != 0).then(|| format!("exit code {}", exit_code)),
                    duration_ms: started.elapsed().as_millis() as u64,
                    status: if exit_code == 0 {
                        ResultStatus::Success
                    } else {
                        ResultStatus::Failure
                    },
                }
            }
            Ok(Err(e)) => self.failure(
                format!("failed to spawn shell: {}", e),
                started.elapsed().as_millis() as u64,
            ),
            Err(_) => NodeResult {
                node_id: self.node_id.clone(),
                hostname: self.hostname.clone(),
                output: String::new(),
                exit_code: -1,
                error: Some(format!("command timed out after {}s", timeout_secs)),
                duration_ms: started.elapsed().as_millis() as u64,
                status: ResultStatus::Timeout,
            },
        }
    }

    /// File reads and writes use the file API directly, never a shell pipe.
    async fn run_file(&self, file: &FileCommand) -> NodeResult {
        if let Some(reason) = self.guard.check_file(file.action, &file.path) {
            warn!(path = %file.path, "file operation blocked: {}", reason);
            return self.blocked(reason);
        }

        let started = Instant::now();
        let outcome = match file.action {
            FileAction::Read => tokio::fs::read_to_string(&file.path)
                .await
                .map(|content| self.truncate(content)),
            FileAction::Write => {
                let content = file.content.clone().unwrap_or_default();
                let write = tokio::fs::write(&file.path, content.as_bytes()).await;
                match (write, file.mode) {
                    (Ok(()), Some(mode)) => {
                        set_mode(&file.path, mode).await.map(|_| String::new())
                    }
                    (Ok(()), None) => Ok(String::new()),
                    (Err(e), _) => Err(e),
                }
            }
        };

        match outcome {
            Ok(output) => NodeResult {
                node_id: self.node_id.clone(),
                hostname: self.hostname.clone(),
                output,
                exit_code: 0,
                error: None,
                duration_ms: started.elapsed().as_millis() as u64,
                status: ResultStatus::Success,
            },
            Err(e) => self.failure(
                format!("file {} failed: {}", file.path, e),
                started.elapsed().as_millis() as u64,
            ),
        }
    }

    fn truncate(&self, mut output: String) -> String {
        if output.len() <= self.max_output_bytes {
            return output;
        }
        let mut cut = self.max_output_bytes;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
        output.push_str(TRUNCATION_MARKER);
        output
    }

    fn blocked(&self, reason: &str) -> NodeResult {
        NodeResult {
            node_id: self.node_id.clone(),
            hostname: self.hostname.clone(),
            output: String::new(),
            exit_code: -1,
            error: Some(format!("blocked by execution guard: {}", reason)),
            duration_ms: 0,
            status: ResultStatus::Blocked,
        }
    }

    fn failure(&self, error: String, duration_ms: u64) -> NodeResult {
        NodeResult {
            node_id: self.node_id.clone(),
            hostname: self.hostname.clone(),
            output: String::new(),
            exit_code: -1,
            error: Some(error),
            duration_ms,
            status: ResultStatus::Failure,
        }
    }
}

#[cfg(unix)]
async fn set_mode(path: &str, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &str, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
