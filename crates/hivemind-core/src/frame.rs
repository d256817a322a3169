//! Wire-level frames streamed from agents to observers.
//!
//! Token frames carry incremental text, control frames carry lifecycle
//! events, metric frames carry counters. Each kind travels on its own
//! [`Channel`] so an observer can follow lifecycle without parsing text.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ExecutionId;

/// Independently subscribable stream of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Token,
    Control,
    Metrics,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Token, Channel::Control, Channel::Metrics];
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token => write!(f, "token"),
            Self::Control => write!(f, "control"),
            Self::Metrics => write!(f, "metrics"),
        }
    }
}

/// One chunk of streamed text from an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenFrame {
    #[serde(rename = "exec_id")]
    pub execution_id: ExecutionId,
    pub agent_id: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
    pub text: String,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl TokenFrame {
    pub fn new(
        execution_id: ExecutionId,
        agent_id: impl Into<String>,
        sequence: u64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            agent_id: agent_id.into(),
            sequence,
            text: text.into(),
            timestamp: Utc::now(),
            is_final: false,
        }
    }

    /// Mark this frame as the last of the agent's segment.
    pub fn finalize(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// Lifecycle event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlType {
    AgentStarted,
    AgentCompleted,
    TaskStarted,
    TaskCompleted,
    SessionStart,
    SessionEnd,
    Error,
    Handoff,
    ApprovalRequested,
    ApprovalResolved,
}

impl ControlType {
    /// Whether this frame ends an agent step.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentCompleted | Self::Error)
    }
}

/// Out-of-band lifecycle frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "exec_id")]
    pub execution_id: ExecutionId,
    #[serde(rename = "type")]
    pub kind: ControlType,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
}

impl ControlFrame {
    pub fn new(execution_id: ExecutionId, kind: ControlType) -> Self {
        Self {
            execution_id,
            kind,
            agent_id: None,
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// `agent_completed` frame carrying the step result.
    pub fn completed(
        execution_id: ExecutionId,
        agent_id: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self::new(execution_id, ControlType::AgentCompleted)
            .with_agent(agent_id)
            .with_payload(serde_json::json!({ "result": result.into() }))
    }

    /// `error` frame carrying a failure message.
    pub fn error(
        execution_id: ExecutionId,
        agent_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(execution_id, ControlType::Error)
            .with_agent(agent_id)
            .with_payload(serde_json::json!({ "error": message.into() }))
    }

    /// The `result` payload of an `agent_completed` frame.
    pub fn result_text(&self) -> Option<String> {
        match self.payload.get("result")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// The `error` payload of an `error` frame.
    pub fn error_text(&self) -> Option<String> {
        match self.payload.get("error")? {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Successor requested by the completing agent, if any.
    pub fn handoff_to(&self) -> Option<&str> {
        self.payload.get("handoff_to").and_then(|v| v.as_str())
    }
}

/// Counter published on the metrics channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFrame {
    #[serde(rename = "exec_id")]
    pub execution_id: ExecutionId,
    pub name: String,
    pub value: f64,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
}

impl MetricFrame {
    pub fn new(execution_id: ExecutionId, name: impl Into<String>, value: f64) -> Self {
        Self {
            execution_id,
            name: name.into(),
            value,
            timestamp: Utc::now(),
        }
    }
}

/// Any frame, tagged on the wire by `frame_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame_type", rename_all = "lowercase")]
pub enum Frame {
    Token(TokenFrame),
    Control(ControlFrame),
    Metric(MetricFrame),
}

impl Frame {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Token(_) => Channel::Token,
            Self::Control(_) => Channel::Control,
            Self::Metric(_) => Channel::Metrics,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::Token(f) => &f.execution_id,
            Self::Control(f) => &f.execution_id,
            Self::Metric(f) => &f.execution_id,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::Token(f) => Some(&f.agent_id),
            Self::Control(f) => f.agent_id.as_deref(),
            Self::Metric(_) => None,
        }
    }

    pub fn as_token(&self) -> Option<&TokenFrame> {
        match self {
            Self::Token(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_control(&self) -> Option<&ControlFrame> {
        match self {
            Self::Control(f) => Some(f),
            _ => None,
        }
    }
}

impl From<TokenFrame> for Frame {
    fn from(f: TokenFrame) -> Self {
        Self::Token(f)
    }
}

impl From<ControlFrame> for Frame {
    fn from(f: ControlFrame) -> Self {
        Self::Control(f)
    }
}

impl From<MetricFrame> for Frame {
    fn from(f: MetricFrame) -> Self {
        Self::Metric(f)
    }
}
