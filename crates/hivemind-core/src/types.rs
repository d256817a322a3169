use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::traits::ToolInvoker;

/// Unique execution identifier. One execution is one task run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Input to one agent step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub execution_id: ExecutionId,
    pub agent_id: String,
    pub task: String,
    /// Output of the upstream node(s), when this step has dependencies.
    #[serde(default)]
    pub parent_result: Option<String>,
    /// Opaque agent configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// First token sequence number this step must use.
    #[serde(default = "default_first_sequence")]
    pub first_sequence: u64,
}

fn default_first_sequence() -> u64 { 1 }

impl StepRequest {
    pub fn new(
        execution_id: ExecutionId,
        agent_id: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            agent_id: agent_id.into(),
            task: task.into(),
            parent_result: None,
            config: serde_json::Value::Null,
            first_sequence: default_first_sequence(),
        }
    }

    pub fn with_parent_result(mut self, parent: Option<String>) -> Self {
        self.parent_result = parent;
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_first_sequence(mut self, seq: u64) -> Self {
        self.first_sequence = seq;
        self
    }
}

/// Everything an agent receives for one step.
#[derive(Clone)]
pub struct StepContext {
    pub request: StepRequest,
    /// Gated tool access bound to this execution and agent.
    pub tools: Option<Arc<dyn ToolInvoker>>,
    /// Cancelled when the execution is aborted.
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn new(request: StepRequest) -> Self {
        Self {
            request,
            tools: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("request", &self.request)
            .field("tools", &self.tools.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Terminal status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of routing a tool call through the gate.
///
/// A refusal is ordinary control flow: the tool did not run and the agent
/// should carry on without its output.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Executed(serde_json::Value),
    Refused {
        status: ApprovalStatus,
        reason: Option<String>,
    },
}

impl ToolOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed(_))
    }
}
