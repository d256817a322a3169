pub mod approval;
pub mod breaker;
pub mod gate;
pub mod graph;
pub mod handoff;
pub mod mode;
pub mod orchestrator;

pub use approval::{ApprovalGate, ApprovalOutcome, ApprovalRequest, ResolveOutcome};
pub use breaker::{CircuitBreaker, CircuitRegistry, CircuitSnapshot, CircuitState};
pub use gate::ToolGate;
pub use graph::{ExecutionGraph, GraphNode};
pub use handoff::{
    AgentProfile, HandoffContext, HandoffController, HandoffDecision, HandoffSignal, StopReason,
};
pub use mode::{resolve_mode, KeywordModeStrategy, ModeDecision, ModeStrategy};
pub use orchestrator::{
    DagOrchestrator, ExecutionResult, ExecutionStatus, NodeOutcome, NodeStatus,
};
