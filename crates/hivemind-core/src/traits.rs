use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::frame::Frame;
use crate::types::*;

/// Agent runtime: one independently schedulable unit of work.
///
/// The engine never inspects an agent beyond this contract: it hands over a
/// [`StepContext`] and consumes the frames. A well-behaved stream yields
/// zero or more token frames and then exactly one terminal control frame
/// (`agent_completed` or `error`).
pub trait AgentRuntime: Send + Sync + 'static {
    /// Agent identifier used in graph nodes and handoff routing.
    fn id(&self) -> &str;

    /// Run one step, streaming frames.
    fn stream(&self, ctx: StepContext) -> BoxStream<'_, Frame>;
}

/// Tool: an opaque external call `{tool_name, parameters} -> result | error`.
pub trait Tool: Send + Sync + 'static {
    /// Tool name, as agents refer to it.
    fn name(&self) -> &str;

    /// Execute the tool.
    fn execute(&self, parameters: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Gated tool access handed to an agent for the duration of one execution.
pub trait ToolInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        agent_id: &str,
        tool: &str,
        parameters: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolOutcome>>;
}
