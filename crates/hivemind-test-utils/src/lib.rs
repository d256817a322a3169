//! Scripted agents and tools for exercising the engine without a model.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use hivemind_core::error::{HivemindError, Result};
use hivemind_core::frame::{ControlFrame, ControlType, Frame, TokenFrame};
use hivemind_core::traits::{AgentRuntime, Tool};
use hivemind_core::types::{StepContext, StepRequest, ToolOutcome};
use hivemind_core::HubEntry;

#[derive(Debug, Clone, Default)]
struct Script {
    tokens: Vec<String>,
    result: Option<String>,
    delay: Duration,
    fail_first: u32,
    always_fail: bool,
    handoff_to: Option<String>,
    omit_terminal: bool,
    tool_call: Option<(String, serde_json::Value)>,
}

/// An agent that replays a fixed script of tokens and a result.
pub struct ScriptedAgent {
    id: String,
    script: Script,
    calls: AtomicU32,
    requests: Mutex<Vec<StepRequest>>,
}

impl ScriptedAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: Script {
                tokens: vec!["working".into()],
                ..Default::default()
            },
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tokens(mut self, tokens: &[&str]) -> Self {
        self.script.tokens = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.script.result = Some(result.into());
        self
    }

    /// Sleep before every frame.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.script.delay = delay;
        self
    }

    /// Fail the first `n` steps, then succeed.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.script.fail_first = n;
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.script.always_fail = true;
        self
    }

    /// Request a specific successor on completion.
    pub fn with_handoff(mut self, to: impl Into<String>) -> Self {
        self.script.handoff_to = Some(to.into());
        self
    }

    /// End the stream without `agent_completed` or `error`.
    pub fn without_terminal(mut self) -> Self {
        self.script.omit_terminal = true;
        self
    }

    /// Invoke a tool through the step's tool handle before completing.
    pub fn with_tool_call(mut self, tool: impl Into<String>, parameters: serde_json::Value) -> Self {
        self.script.tool_call = Some((tool.into(), parameters));
        self
    }

    /// Number of steps started.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received, in order.
    pub fn requests(&self) -> Vec<StepRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl AgentRuntime for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn stream(&self, ctx: StepContext) -> BoxStream<'_, Frame> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(ctx.request.clone());

        let fail = self.script.always_fail || call <= self.script.fail_first;
        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(produce(self.id.clone(), self.script.clone(), ctx, fail, tx));
        rx.boxed()
    }
}

async fn produce(
    agent_id: String,
    script: Script,
    ctx: StepContext,
    fail: bool,
    tx: mpsc::UnboundedSender<Frame>,
) {
    let exec = ctx.request.execution_id.clone();
    let mut seq = ctx.request.first_sequence;
    let last = script.tokens.len().saturating_sub(1);

    for (i, text) in script.tokens.iter().enumerate() {
        if !script.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(script.delay) => {}
                _ = ctx.cancel.cancelled() => return,
            }
        }
        let mut frame = TokenFrame::new(exec.clone(), &agent_id, seq, text.clone());
        if i == last && !script.omit_terminal {
            frame = frame.finalize();
        }
        seq += 1;
        if tx.unbounded_send(frame.into()).is_err() {
            return;
        }
    }

    let mut result = script
        .result
        .clone()
        .unwrap_or_else(|| script.tokens.join(" "));

    if let (Some((tool, params)), Some(tools)) = (script.tool_call.as_ref(), ctx.tools.as_ref()) {
        match tools.invoke(&agent_id, tool, params.clone()).await {
            Ok(ToolOutcome::Executed(value)) => result.push_str(&format!(" [{tool}: {value}]")),
            Ok(ToolOutcome::Refused { status, .. }) => {
                result.push_str(&format!(" [{tool}: {status}]"))
            }
            Err(e) => result.push_str(&format!(" [{tool}: error {e}]")),
        }
    }

    if script.omit_terminal {
        return;
    }
    if !script.delay.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(script.delay) => {}
            _ = ctx.cancel.cancelled() => return,
        }
    }

    let terminal = if fail {
        ControlFrame::error(exec, &agent_id, format!("{agent_id} failed"))
    } else {
        let mut payload = serde_json::json!({ "result": result });
        if let Some(ref to) = script.handoff_to {
            payload["handoff_to"] = serde_json::Value::String(to.clone());
        }
        ControlFrame::new(exec, ControlType::AgentCompleted)
            .with_agent(&agent_id)
            .with_payload(payload)
    };
    let _ = tx.unbounded_send(terminal.into());
}

/// A tool returning a fixed value, optionally failing first.
pub struct ScriptedTool {
    name: String,
    response: serde_json::Value,
    fail_first: u32,
    delay: Duration,
    calls: AtomicU32,
}

impl ScriptedTool {
    pub fn new(name: impl Into<String>, response: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            response,
            fail_first: 0,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _parameters: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call <= self.fail_first {
                return Err(HivemindError::ToolExecution {
                    tool: self.name.clone(),
                    message: format!("scripted failure {call}"),
                });
            }
            Ok(self.response.clone())
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }
}

/// Control frames of a subscription, as `(type, agent)` pairs.
pub fn control_events(entries: &[HubEntry]) -> Vec<(ControlType, Option<String>)> {
    entries
        .iter()
        .filter_map(|e| e.frame.as_control())
        .map(|c| (c.kind, c.agent_id.clone()))
        .collect()
}

/// Index of the first control frame of `kind` for `agent`.
pub fn position_of(
    events: &[(ControlType, Option<String>)],
    kind: ControlType,
    agent: &str,
) -> Option<usize> {
    events
        .iter()
        .position(|(k, a)| *k == kind && a.as_deref() == Some(agent))
}

pub fn shared(agent: ScriptedAgent) -> Arc<ScriptedAgent> {
    Arc::new(agent)
}
