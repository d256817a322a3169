use thiserror::Error;

#[derive(Debug, Error)]
pub enum HivemindError {
    // Graph construction errors
    #[error("Execution graph contains a cycle: {}", cycle.join(" -> "))]
    GraphCycle { cycle: Vec<String> },

    #[error("Duplicate node id in execution graph: {0}")]
    DuplicateNode(String),

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("Agent not registered: {0}")]
    AgentNotFound(String),

    // Event hub errors
    #[error("Unknown execution: {0}")]
    UnknownExecution(String),

    #[error("Execution closed for publishing: {0}")]
    ExecutionClosed(String),

    #[error("Execution already running: {0}")]
    ExecutionActive(String),

    #[error("Sequence violation for agent {agent_id}: got {got}, expected > {last}")]
    SequenceViolation { agent_id: String, got: u64, last: u64 },

    #[error("Token stream already finalized for agent {0}")]
    SegmentClosed(String),

    // Step errors
    #[error("Agent step failed: {agent_id}: {message}")]
    StepFailed { agent_id: String, message: String },

    #[error("Agent stream ended without a terminal frame: {0}")]
    StreamIncomplete(String),

    #[error("Circuit open for {name}, retry in {retry_after_ms}ms")]
    CircuitOpen { name: String, retry_after_ms: u64 },

    #[error("Timed out after {elapsed_ms}ms: {scope}")]
    Timeout { scope: String, elapsed_ms: u64 },

    #[error("Execution cancelled")]
    Cancelled,

    // Approval errors
    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HivemindError {
    /// Whether a failed step may be attempted again.
    ///
    /// Construction errors, cancellation, and an open circuit are final;
    /// everything the agent itself reported is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StepFailed { .. }
                | Self::StreamIncomplete(_)
                | Self::Timeout { .. }
                | Self::ToolExecution { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HivemindError>;
