//! # Armada Protocol
//!
//! Shared wire protocol and fleet data model for the Armada control plane.
//! Defines the JSON relay frames exchanged between relay server and node
//! agents, the typed command union dispatched to agents, and the node /
//! execution records persisted by the store.

pub mod command;
pub mod exec;
pub mod frame;
pub mod node;

pub use command::{
    BrowserCommand, CommandEnvelope, DeployCommand, DockerCommand, FileAction, FileCommand,
    K8sCommand, ShellCommand, TypedCommand, COMMAND_TYPES,
};
pub use exec::{
    ExecRequest, ExecResult, ExecSummary, NodeResult, ResultStatus, TargetSelector,
    DEFAULT_MAX_CONCURRENCY, DEFAULT_TIMEOUT_SECS,
};
pub use frame::{Frame, FrameType, RegisterPayload};
pub use node::{Node, NodeResources, NodeStatus};

use thiserror::Error;

/// Validation errors raised at the request-construction boundary.
///
/// These are never persisted; a request that fails validation is rejected
/// before it touches the store or the relay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unknown command type: {0}")]
    UnknownCommandType(String),
    #[error("invalid command payload: {0}")]
    InvalidPayload(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}
