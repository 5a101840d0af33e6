//! Relay wire frames.
//!
//! Every message on a tunnel is one JSON frame. Correlation between a
//! `command` frame and its `result` frame is purely by `request_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exec::NodeResult;
use crate::node::NodeResources;
use crate::ValidationError;

/// Frame discriminator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Register,
    Registered,
    Command,
    Result,
    Ping,
    Pong,
    Error,
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FrameType::Register => "register",
            FrameType::Registered => "registered",
            FrameType::Command => "command",
            FrameType::Result => "result",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
            FrameType::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// One discrete message on the relay stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Payload of a `register` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RegisterPayload {
    pub hostname: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<NodeResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Frame {
    fn base(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            request_id: None,
            node_id: None,
            payload: None,
            error: None,
            ts: Utc::now(),
        }
    }

    pub fn register(node_id: impl Into<String>, payload: &RegisterPayload) -> Self {
        let mut f = Self::base(FrameType::Register);
        f.node_id = Some(node_id.into());
        f.payload = serde_json::to_value(payload).ok();
        f
    }

    pub fn registered(node_id: impl Into<String>) -> Self {
        let mut f = Self::base(FrameType::Registered);
        f.node_id = Some(node_id.into());
        f
    }

    pub fn command(node_id: impl Into<String>, payload: serde_json::Value, request_id: impl Into<String>) -> Self {
        let mut f = Self::base(FrameType::Command);
        f.node_id = Some(node_id.into());
        f.request_id = Some(request_id.into());
        f.payload = Some(payload);
        f
    }

    pub fn result(node_id: impl Into<String>, request_id: impl Into<String>, result: &NodeResult) -> Self {
        let mut f = Self::base(FrameType::Result);
        f.node_id = Some(node_id.into());
        f.request_id = Some(request_id.into());
        f.payload = serde_json::to_value(result).ok();
        f
    }

    pub fn ping() -> Self {
        Self::base(FrameType::Ping)
    }

    pub fn pong(node_id: impl Into<String>) -> Self {
        let mut f = Self::base(FrameType::Pong);
        f.node_id = Some(node_id.into());
        f
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        let mut f = Self::base(FrameType::Error);
        f.error = Some(message.into());
        f
    }

    /// Decode the register payload of a `register` frame.
    pub fn register_payload(&self) -> Result<RegisterPayload, ValidationError> {
        if self.frame_type != FrameType::Register {
            return Err(ValidationError::InvalidFrame(format!(
                "expected register frame, got {}",
                self.frame_type
            )));
        }
        let payload = self
            .payload
            .clone()
            .ok_or(ValidationError::MissingField("register.payload"))?;
        serde_json::from_value(payload).map_err(|e| ValidationError::InvalidFrame(e.to_string()))
    }

    /// Decode the node result carried by a `result` frame.
    pub fn result_payload(&self) -> Result<NodeResult, ValidationError> {
        let payload = self
            .payload
            .clone()
            .ok_or(ValidationError::MissingField("result.payload"))?;
        serde_json::from_value(payload).map_err(|e| ValidationError::InvalidFrame(e.to_string()))
    }
}
