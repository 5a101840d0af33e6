//! Typed command union dispatched to node agents.
//!
//! Commands travel as a tagged record `{type, payload}`; unknown tags are
//! rejected at the validation boundary before anything is queued or stored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ValidationError;

/// The set of known command type tags.
pub const COMMAND_TYPES: &[&str] = &["shell", "file", "deploy", "docker", "k8s", "browser"];

/// Discriminated command union. Serialized as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TypedCommand {
    Shell(ShellCommand),
    File(FileCommand),
    Deploy(DeployCommand),
    Docker(DockerCommand),
    K8s(K8sCommand),
    Browser(BrowserCommand),
}

/// Shell execution payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ShellCommand {
    /// Command line passed to the shell.
    pub command: String,
    /// Working directory for the child process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// Extra environment variables.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Per-command timeout in seconds. Zero means "use the request timeout".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    /// Shell binary. Defaults to `/bin/sh` on the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

/// File operation action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Read,
    Write,
}

/// File read/write payload. Writes go through a direct file API on the agent,
/// never through a shell pipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileCommand {
    pub action: FileAction,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Unix permission bits applied after a write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Deployment payload consumed by control-plane callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployCommand {
    pub service: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Docker operation payload consumed by control-plane callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DockerCommand {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Kubernetes operation payload consumed by control-plane callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct K8sCommand {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
}

/// Browser automation payload consumed by control-plane callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrowserCommand {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

impl TypedCommand {
    /// The wire tag for this command variant.
    pub fn kind(&self) -> &'static str {
        match self {
            TypedCommand::Shell(_) => "shell",
            TypedCommand::File(_) => "file",
            TypedCommand::Deploy(_) => "deploy",
            TypedCommand::Docker(_) => "docker",
            TypedCommand::K8s(_) => "k8s",
            TypedCommand::Browser(_) => "browser",
        }
    }

    /// Build a command from a raw `{type, payload}` pair, rejecting unknown
    /// tags before attempting to deserialize the payload.
    pub fn from_parts(kind: &str, payload: serde_json::Value) -> Result<Self, ValidationError> {
        if !COMMAND_TYPES.contains(&kind) {
            return Err(ValidationError::UnknownCommandType(kind.to_string()));
        }
        let tagged = serde_json::json!({ "type": kind, "payload": payload });
        serde_json::from_value(tagged).map_err(|e| ValidationError::InvalidPayload(e.to_string()))
    }

    /// Structural validation of the payload.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            TypedCommand::Shell(c) => {
                if c.command.trim().is_empty() {
                    return Err(ValidationError::MissingField("shell.command"));
                }
            }
            TypedCommand::File(c) => {
                if c.path.is_empty() {
                    return Err(ValidationError::MissingField("file.path"));
                }
                if c.action == FileAction::Write && c.content.is_none() {
                    return Err(ValidationError::MissingField("file.content"));
                }
            }
            TypedCommand::Deploy(c) => {
                if c.service.is_empty() {
                    return Err(ValidationError::MissingField("deploy.service"));
                }
                if c.version.is_empty() {
                    return Err(ValidationError::MissingField("deploy.version"));
                }
            }
            TypedCommand::Docker(c) => {
                if c.action.is_empty() {
                    return Err(ValidationError::MissingField("docker.action"));
                }
            }
            TypedCommand::K8s(c) => {
                if c.action.is_empty() {
                    return Err(ValidationError::MissingField("k8s.action"));
                }
            }
            TypedCommand::Browser(c) => {
                if c.action.is_empty() {
                    return Err(ValidationError::MissingField("browser.action"));
                }
            }
        }
        Ok(())
    }

    /// Convenience constructor for a plain shell command.
    pub fn shell(command: impl Into<String>) -> Self {
        TypedCommand::Shell(ShellCommand {
            command: command.into(),
            ..Default::default()
        })
    }
}

/// Envelope carried in a `command` frame: the correlation id plus the typed
/// command and its effective deadline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    pub request_id: String,
    #[serde(flatten)]
    pub command: TypedCommand,
    /// Effective deadline in seconds, already reduced to the earlier of the
    /// request timeout and the per-command timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}
