use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{debug, info};

use hivemind_core::error::{HivemindError, Result};
use hivemind_core::traits::{Tool, ToolInvoker};
use hivemind_core::types::{ExecutionId, ToolOutcome};

use crate::approval::ApprovalGate;
use crate::breaker::CircuitRegistry;

/// ToolGate: the only route from an agent to a tool.
///
/// Order of checks: approval, then the tool's circuit breaker, then the
/// tool's own timeout around the call.
pub struct ToolGate {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    approvals: Arc<ApprovalGate>,
    circuits: Arc<CircuitRegistry>,
}

impl ToolGate {
    pub fn new(approvals: Arc<ApprovalGate>, circuits: Arc<CircuitRegistry>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            approvals,
            circuits,
        }
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, "Registered tool");
        self.tools.write().await.insert(name, tool);
    }

    pub async fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    /// Run `name` on behalf of `agent_id`. A refused approval is returned as
    /// [`ToolOutcome::Refused`], not as an error.
    pub async fn execute(
        &self,
        execution_id: &ExecutionId,
        agent_id: &str,
        name: &str,
        parameters: serde_json::Value,
    ) -> Result<ToolOutcome> {
        let tool = self
            .tools
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| HivemindError::ToolNotFound(name.to_string()))?;

        let approval = self
            .approvals
            .request_approval(execution_id, agent_id, name, parameters)
            .await?;
        if !approval.approved() {
            info!(
                tool = %name,
                agent_id,
                status = %approval.status,
                "Tool call refused"
            );
            return Ok(ToolOutcome::Refused {
                status: approval.status,
                reason: approval.reason,
            });
        }

        let breaker = self.circuits.for_tool(name).await;
        let timeout = Duration::from_secs(tool.timeout_secs());
        let parameters = approval.parameters;
        let value = breaker
            .execute(|| async {
                match tokio::time::timeout(timeout, tool.execute(parameters)).await {
                    Ok(result) => result,
                    Err(_) => Err(HivemindError::Timeout {
                        scope: format!("tool {}", name),
                        elapsed_ms: timeout.as_millis() as u64,
                    }),
                }
            })
            .await?;
        Ok(ToolOutcome::Executed(value))
    }

    /// Tool handle bound to one execution, handed to agents in their step context.
    pub fn for_execution(self: &Arc<Self>, execution_id: ExecutionId) -> Arc<dyn ToolInvoker> {
        Arc::new(ExecutionTools {
            gate: self.clone(),
            execution_id,
        })
    }
}

struct ExecutionTools {
    gate: Arc<ToolGate>,
    execution_id: ExecutionId,
}

impl ToolInvoker for ExecutionTools {
    fn invoke(
        &self,
        agent_id: &str,
        tool: &str,
        parameters: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolOutcome>> {
        let agent_id = agent_id.to_string();
        let tool = tool.to_string();
        Box::pin(async move {
            self.gate
                .execute(&self.execution_id, &agent_id, &tool, parameters)
                .await
        })
    }
}
