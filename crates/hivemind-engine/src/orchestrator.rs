use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hivemind_core::config::{EngineConfig, ExecutionMode, HandoffConfig, HivemindConfig};
use hivemind_core::error::{HivemindError, Result};
use hivemind_core::event::EventHub;
use hivemind_core::frame::{ControlFrame, ControlType, Frame, MetricFrame, TokenFrame};
use hivemind_core::traits::{AgentRuntime, ToolInvoker};
use hivemind_core::types::{ExecutionId, StepContext, StepRequest};

use crate::approval::ApprovalGate;
use crate::breaker::CircuitRegistry;
use crate::gate::ToolGate;
use crate::graph::{ExecutionGraph, GraphNode};
use crate::handoff::{AgentProfile, HandoffController, HandoffDecision, HandoffSignal, StopReason};
use crate::mode::{resolve_mode, KeywordModeStrategy, ModeDecision, ModeStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    Failed,
    /// A dependency did not complete, or a critical node aborted the run.
    Blocked,
    TimedOut,
    Cancelled,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of one graph node, including its handoff chain.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub node_id: String,
    pub agent_id: String,
    pub status: NodeStatus,
    /// Output of the last agent in the chain.
    pub output: Option<String>,
    /// Why the node did not complete.
    pub reason: Option<String>,
    pub handoffs: Vec<HandoffDecision>,
    pub elapsed_ms: u64,
}

impl NodeOutcome {
    fn unfinished(node: &GraphNode, status: NodeStatus, reason: impl Into<String>) -> Self {
        Self {
            node_id: node.id.clone(),
            agent_id: node.agent.clone(),
            status,
            output: None,
            reason: Some(reason.into()),
            handoffs: Vec::new(),
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    /// Some nodes completed, others failed, timed out or were blocked.
    Partial,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    /// Aggregated output of the terminal nodes that completed.
    pub output: Option<String>,
    /// Per-node outcomes, in graph order.
    pub nodes: Vec<NodeOutcome>,
    pub mode: ModeDecision,
    pub reason: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn node(&self, node_id: &str) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// `(node_id, reason)` of every node that did not complete.
    pub fn failures(&self) -> Vec<(&str, &str)> {
        self.nodes
            .iter()
            .filter(|n| n.status != NodeStatus::Completed)
            .map(|n| (n.node_id.as_str(), n.reason.as_deref().unwrap_or("")))
            .collect()
    }
}

/// Everything a node task needs, cloned into each spawned task.
#[derive(Clone)]
struct ExecutionEnv {
    execution_id: ExecutionId,
    hub: Arc<EventHub>,
    circuits: Arc<CircuitRegistry>,
    tools: Arc<dyn ToolInvoker>,
    agents: Arc<HashMap<String, Arc<dyn AgentRuntime>>>,
    profiles: Arc<HashMap<String, AgentProfile>>,
    engine: EngineConfig,
    handoff: HandoffConfig,
    /// One lock per agent: an agent streams a single segment at a time.
    turns: Arc<HashMap<String, Mutex<()>>>,
    /// Status and reason for nodes cut off by an execution-wide halt.
    halt: Arc<OnceLock<(NodeStatus, String)>>,
    /// Cancelled on external cancel, a critical-node abort, or a deadline.
    cancel: CancellationToken,
}

/// Time node tasks get to close their segments after a halt.
const UNWIND_GRACE: Duration = Duration::from_secs(5);

struct StepCompletion {
    result: String,
    handoff_to: Option<String>,
}

struct ChainOutcome {
    output: String,
    handoffs: Vec<HandoffDecision>,
    stopped: Option<StopReason>,
}

/// A chain error, tagged with the agent that was running.
struct ChainError {
    agent_id: String,
    error: HivemindError,
}

/// DAG orchestrator: runs an execution graph of agents level by level.
///
/// Nodes in a level run concurrently under a `max_parallel` ceiling; a level
/// fully resolves before the next starts. Inside a node, the
/// `HandoffController` routes control from agent to agent. Every step goes
/// through the agent's circuit breaker with retries, and every frame lands
/// in the `EventHub`.
pub struct DagOrchestrator {
    config: HivemindConfig,
    hub: Arc<EventHub>,
    circuits: Arc<CircuitRegistry>,
    approvals: Arc<ApprovalGate>,
    tools: Arc<ToolGate>,
    agents: Arc<HashMap<String, Arc<dyn AgentRuntime>>>,
    /// Registration order, used for fan-out and default plans.
    agent_order: Vec<String>,
    profiles: Arc<HashMap<String, AgentProfile>>,
    strategy: Box<dyn ModeStrategy>,
    active: Mutex<HashMap<ExecutionId, CancellationToken>>,
}

impl DagOrchestrator {
    pub fn new(config: HivemindConfig) -> Self {
        let hub = Arc::new(EventHub::new(&config.hub));
        let circuits = Arc::new(CircuitRegistry::new(config.circuit.clone()));
        let approvals = Arc::new(ApprovalGate::new(config.approval.clone()).with_hub(hub.clone()));
        let tools = Arc::new(ToolGate::new(approvals.clone(), circuits.clone()));
        let profiles = config
            .agents
            .iter()
            .map(|p| (p.id.clone(), AgentProfile::from(p)))
            .collect();
        let strategy = Box::new(KeywordModeStrategy::new(config.engine.min_speedup));

        Self {
            config,
            hub,
            circuits,
            approvals,
            tools,
            agents: Arc::new(HashMap::new()),
            agent_order: Vec::new(),
            profiles: Arc::new(profiles),
            strategy,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn ModeStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Register an agent. Re-registering an id replaces the runtime.
    pub fn register_agent(&mut self, agent: Arc<dyn AgentRuntime>) {
        let id = agent.id().to_string();
        if !self.agent_order.contains(&id) {
            self.agent_order.push(id.clone());
        }
        debug!(agent_id = %id, "Registered agent");
        Arc::make_mut(&mut self.agents).insert(id, agent);
    }

    /// Register an agent together with its routing profile.
    pub fn register_agent_with_profile(
        &mut self,
        agent: Arc<dyn AgentRuntime>,
        profile: AgentProfile,
    ) {
        Arc::make_mut(&mut self.profiles).insert(agent.id().to_string(), profile);
        self.register_agent(agent);
    }

    pub fn agent_ids(&self) -> &[String] {
        &self.agent_order
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    pub fn tools(&self) -> &Arc<ToolGate> {
        &self.tools
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    /// Validate nodes into a graph whose agents are all registered.
    pub fn build_graph(&self, nodes: Vec<GraphNode>) -> Result<ExecutionGraph> {
        let graph = ExecutionGraph::new(nodes)?;
        self.check_agents(&graph)?;
        Ok(graph)
    }

    /// Run a graph in the configured mode.
    pub async fn execute(
        &self,
        execution_id: &ExecutionId,
        graph: &ExecutionGraph,
    ) -> Result<ExecutionResult> {
        self.execute_with_mode(execution_id, graph, self.config.engine.mode)
            .await
    }

    pub async fn execute_with_mode(
        &self,
        execution_id: &ExecutionId,
        graph: &ExecutionGraph,
        mode: ExecutionMode,
    ) -> Result<ExecutionResult> {
        self.check_agents(graph)?;
        let task: Vec<&str> = graph.nodes().iter().map(|n| n.task.as_str()).collect();
        let decision = resolve_mode(mode, self.strategy.as_ref(), &task.join("\n"), Some(graph));
        self.run_graph(execution_id, graph, decision, None).await
    }

    /// Run a task with no explicit graph.
    ///
    /// Parallel: one node per registered agent, merged by the aggregator
    /// agent when one is configured. Sequential: a single chain starting at
    /// the entry agent; without a configured entry agent the chain follows
    /// every registered agent in registration order.
    pub async fn run_task(
        &self,
        execution_id: &ExecutionId,
        task: &str,
        mode: ExecutionMode,
    ) -> Result<ExecutionResult> {
        let aggregator = self.config.engine.aggregator_agent.clone();
        let workers: Vec<String> = self
            .agent_order
            .iter()
            .filter(|id| Some(*id) != aggregator.as_ref())
            .cloned()
            .collect();
        let entry = self
            .config
            .engine
            .entry_agent
            .clone()
            .or_else(|| workers.first().cloned())
            .ok_or_else(|| HivemindError::AgentNotFound("no agents registered".into()))?;

        let decision = resolve_mode(mode, self.strategy.as_ref(), task, None);
        info!(
            execution_id = %execution_id,
            mode = %decision.mode,
            reason = %decision.reason,
            "Task mode decided"
        );

        if decision.mode == ExecutionMode::Parallel && workers.len() > 1 {
            let mut nodes: Vec<GraphNode> = workers
                .iter()
                .map(|agent| GraphNode::new(agent, agent, task))
                .collect();
            if let Some(ref agg) = aggregator {
                let synthesis = format!(
                    "Synthesize the findings of {} into one answer.\n\n{}",
                    workers.join(", "),
                    task
                );
                nodes.push(GraphNode::new(agg, agg, synthesis).depends_on(workers.iter().cloned()));
            }
            let graph = self.build_graph(nodes)?;
            return self.run_graph(execution_id, &graph, decision, None).await;
        }

        let graph = self.build_graph(vec![GraphNode::new(&entry, &entry, task)])?;
        let plan = match self.config.engine.entry_agent {
            None if workers.len() > 1 => Some(workers),
            _ => None,
        };
        self.run_graph(execution_id, &graph, decision, plan).await
    }

    /// Cancel a running execution: in-flight steps are signalled and
    /// aborted, and pending approvals are cancelled. The execution publishes
    /// `session_end` with status `cancelled` as it unwinds.
    pub async fn cancel(&self, execution_id: &ExecutionId) -> bool {
        let token = self.active.lock().await.get(execution_id).cloned();
        match token {
            Some(token) => {
                info!(execution_id = %execution_id, "Cancelling execution");
                token.cancel();
                let approvals = self.approvals.cancel_execution(execution_id).await;
                debug!(execution_id = %execution_id, approvals, "Cancelled pending approvals");
                true
            }
            None => false,
        }
    }

    pub async fn active_executions(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> = self.active.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn check_agents(&self, graph: &ExecutionGraph) -> Result<()> {
        match graph.nodes().iter().find(|n| !self.agents.contains_key(&n.agent)) {
            Some(node) => Err(HivemindError::AgentNotFound(node.agent.clone())),
            None => Ok(()),
        }
    }

    async fn run_graph(
        &self,
        execution_id: &ExecutionId,
        graph: &ExecutionGraph,
        decision: ModeDecision,
        plan: Option<Vec<String>>,
    ) -> Result<ExecutionResult> {
        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().await;
            if active.contains_key(execution_id) {
                return Err(HivemindError::ExecutionActive(execution_id.to_string()));
            }
            active.insert(execution_id.clone(), cancel.clone());
        }

        let started = Instant::now();
        self.hub.open(execution_id).await;
        info!(
            execution_id = %execution_id,
            nodes = graph.len(),
            mode = %decision.mode,
            "Starting execution"
        );
        self.announce(
            ControlFrame::new(execution_id.clone(), ControlType::SessionStart).with_payload(
                serde_json::json!({
                    "mode": decision.mode,
                    "estimated_speedup": decision.estimated_speedup,
                    "reason": decision.reason,
                    "nodes": graph.len(),
                }),
            ),
        )
        .await;

        let abort = cancel.child_token();
        let env = ExecutionEnv {
            execution_id: execution_id.clone(),
            hub: self.hub.clone(),
            circuits: self.circuits.clone(),
            tools: self.tools.for_execution(execution_id.clone()),
            agents: self.agents.clone(),
            profiles: self.profiles.clone(),
            engine: self.config.engine.clone(),
            handoff: self.config.handoff.clone(),
            turns: Arc::new(
                self.agents
                    .keys()
                    .map(|id| (id.clone(), Mutex::new(())))
                    .collect(),
            ),
            halt: Arc::new(OnceLock::new()),
            cancel: abort.clone(),
        };
        let permits = match decision.mode {
            ExecutionMode::Sequential => 1,
            _ => self.config.engine.max_parallel.max(1),
        };
        let semaphore = Arc::new(Semaphore::new(permits));
        let deadline = started + Duration::from_secs(self.config.engine.execution_timeout_secs);
        let timeout_reason = format!(
            "execution exceeded {}s",
            self.config.engine.execution_timeout_secs
        );

        let mut outcomes: HashMap<String, NodeOutcome> = HashMap::new();
        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut blocked: HashMap<String, String> = HashMap::new();
        let mut halted: Option<(NodeStatus, String)> = None;
        let mut aborted: Option<String> = None;

        for level in graph.levels() {
            let batches: Vec<Vec<String>> = match decision.mode {
                ExecutionMode::Sequential => level.into_iter().map(|id| vec![id]).collect(),
                _ => vec![level],
            };

            for batch in batches {
                if halted.is_none() {
                    if cancel.is_cancelled() {
                        halted = Some((NodeStatus::Cancelled, "execution cancelled".into()));
                    } else if Instant::now() >= deadline {
                        halted = Some((NodeStatus::TimedOut, timeout_reason.clone()));
                    }
                }
                let mut set = JoinSet::new();
                let mut running: HashSet<String> = HashSet::new();

                for id in batch {
                    let Some(node) = graph.get(&id).cloned() else {
                        continue;
                    };
                    if let Some((status, reason)) = &halted {
                        self.resolve_unrun(execution_id, &mut outcomes, &node, *status, reason)
                            .await;
                        continue;
                    }
                    if let Some(reason) = blocked.get(&id).cloned() {
                        let status = NodeStatus::Blocked;
                        self.resolve_unrun(execution_id, &mut outcomes, &node, status, &reason)
                            .await;
                        continue;
                    }

                    let parent = node.parent_result(&outputs);
                    let env = env.clone();
                    let semaphore = semaphore.clone();
                    let plan = plan.clone();
                    running.insert(id.clone());
                    set.spawn(async move {
                        let fallback = node.clone();
                        let run = async move {
                            let Ok(_permit) = semaphore.acquire_owned().await else {
                                return NodeOutcome::unfinished(
                                    &node,
                                    NodeStatus::Cancelled,
                                    "execution closed",
                                );
                            };
                            run_node(env, node, parent, plan).await
                        };
                        match AssertUnwindSafe(run).catch_unwind().await {
                            Ok(outcome) => outcome,
                            Err(_) => NodeOutcome::unfinished(
                                &fallback,
                                NodeStatus::Failed,
                                "node task panicked",
                            ),
                        }
                    });
                }

                // Set once a halt signalled the running nodes to unwind.
                let mut unwind_by: Option<Instant> = None;
                while !running.is_empty() {
                    let grace = unwind_by.unwrap_or(deadline);
                    let joined = tokio::select! {
                        joined = set.join_next() => joined,
                        _ = tokio::time::sleep_until(deadline), if unwind_by.is_none() => {
                            warn!(execution_id = %execution_id, "Execution timed out");
                            let halt = (NodeStatus::TimedOut, timeout_reason.clone());
                            // First halt wins.
                            let _ = env.halt.set(halt.clone());
                            abort.cancel();
                            halted = Some(halt);
                            unwind_by = Some(Instant::now() + UNWIND_GRACE);
                            continue;
                        }
                        _ = cancel.cancelled(), if unwind_by.is_none() => {
                            halted = Some((NodeStatus::Cancelled, "execution cancelled".into()));
                            unwind_by = Some(Instant::now() + UNWIND_GRACE);
                            continue;
                        }
                        _ = tokio::time::sleep_until(grace), if unwind_by.is_some() => {
                            warn!(
                                execution_id = %execution_id,
                                running = running.len(),
                                "Nodes did not unwind in time, aborting them"
                            );
                            break;
                        }
                    };
                    let Some(joined) = joined else { break };
                    let Ok(outcome) = joined else { continue };
                    running.remove(&outcome.node_id);

                    if outcome.status == NodeStatus::Completed {
                        if let Some(ref out) = outcome.output {
                            outputs.insert(outcome.node_id.clone(), out.clone());
                        }
                    } else if halted.is_none()
                        && graph.get(&outcome.node_id).is_some_and(|n| n.critical)
                    {
                        let reason = format!(
                            "critical node '{}' {}: {}",
                            outcome.node_id,
                            outcome.status,
                            outcome.reason.as_deref().unwrap_or("")
                        );
                        error!(execution_id = %execution_id, reason = %reason, "Aborting execution");
                        let _ = env.halt.set((NodeStatus::Blocked, reason.clone()));
                        abort.cancel();
                        aborted = Some(reason.clone());
                        halted = Some((NodeStatus::Blocked, reason));
                        unwind_by = Some(Instant::now() + UNWIND_GRACE);
                    } else {
                        for downstream in graph.downstream(&outcome.node_id) {
                            blocked.entry(downstream).or_insert_with(|| {
                                format!("dependency '{}' {}", outcome.node_id, outcome.status)
                            });
                        }
                    }
                    outcomes.insert(outcome.node_id.clone(), outcome);
                }

                if !running.is_empty() {
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    let (status, reason) = halted
                        .clone()
                        .unwrap_or((NodeStatus::Cancelled, "execution halted".into()));
                    for id in running {
                        if let Some(node) = graph.get(&id) {
                            self.resolve_unrun(execution_id, &mut outcomes, node, status, &reason)
                                .await;
                        }
                    }
                }
            }
        }

        let cancelled = cancel.is_cancelled();
        let nodes: Vec<NodeOutcome> = graph
            .nodes()
            .iter()
            .filter_map(|n| outcomes.remove(&n.id))
            .collect();
        let completed = nodes.iter().filter(|n| n.status == NodeStatus::Completed).count();
        let status = if cancelled {
            ExecutionStatus::Cancelled
        } else if aborted.is_some() || completed == 0 {
            ExecutionStatus::Failed
        } else if completed == nodes.len() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Partial
        };
        let reason = if cancelled {
            Some("execution cancelled".to_string())
        } else {
            aborted.or_else(|| halted.map(|(_, r)| r))
        };
        let output = aggregate(graph, &nodes);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        self.finish(execution_id, &nodes, status, output.as_deref(), reason.as_deref(), elapsed_ms)
            .await;
        self.active.lock().await.remove(execution_id);

        info!(
            execution_id = %execution_id,
            status = %status,
            completed,
            nodes = nodes.len(),
            elapsed_ms,
            "Execution finished"
        );
        Ok(ExecutionResult {
            execution_id: execution_id.clone(),
            status,
            output,
            nodes,
            mode: decision,
            reason,
            elapsed_ms,
        })
    }

    /// Record a node that never ran (or was cut off) and tell observers.
    async fn resolve_unrun(
        &self,
        execution_id: &ExecutionId,
        outcomes: &mut HashMap<String, NodeOutcome>,
        node: &GraphNode,
        status: NodeStatus,
        reason: &str,
    ) {
        debug!(node_id = %node.id, status = %status, reason, "Node not run to completion");
        let outcome = NodeOutcome::unfinished(node, status, reason);
        self.announce(task_completed(execution_id, &outcome)).await;
        outcomes.insert(node.id.clone(), outcome);
    }

    async fn finish(
        &self,
        execution_id: &ExecutionId,
        nodes: &[NodeOutcome],
        status: ExecutionStatus,
        output: Option<&str>,
        reason: Option<&str>,
        elapsed_ms: u64,
    ) {
        let count = |s: NodeStatus| nodes.iter().filter(|n| n.status == s).count() as f64;
        let handoffs: usize = nodes.iter().map(|n| n.handoffs.len()).sum();
        let metrics = [
            ("nodes_completed", count(NodeStatus::Completed)),
            ("nodes_failed", count(NodeStatus::Failed) + count(NodeStatus::TimedOut)),
            ("nodes_blocked", count(NodeStatus::Blocked) + count(NodeStatus::Cancelled)),
            ("handoffs", handoffs as f64),
            ("elapsed_ms", elapsed_ms as f64),
        ];
        for (name, value) in metrics {
            let frame = MetricFrame::new(execution_id.clone(), name, value);
            if let Err(e) = self.hub.publish_metric(frame).await {
                warn!(metric = name, error = %e, "Dropped metric frame");
            }
        }

        self.announce(
            ControlFrame::new(execution_id.clone(), ControlType::SessionEnd).with_payload(
                serde_json::json!({
                    "status": status,
                    "output": output,
                    "reason": reason,
                }),
            ),
        )
        .await;
        if let Err(e) = self.hub.cleanup(execution_id).await {
            warn!(execution_id = %execution_id, error = %e, "Hub cleanup failed");
        }
    }

    async fn announce(&self, frame: ControlFrame) {
        let kind = frame.kind;
        if let Err(e) = self.hub.publish_control(frame).await {
            warn!(kind = ?kind, error = %e, "Dropped control frame");
        }
    }
}

fn task_completed(execution_id: &ExecutionId, outcome: &NodeOutcome) -> ControlFrame {
    ControlFrame::new(execution_id.clone(), ControlType::TaskCompleted)
        .with_agent(&outcome.agent_id)
        .with_payload(serde_json::json!({
            "node_id": outcome.node_id,
            "status": outcome.status,
            "reason": outcome.reason,
        }))
}

/// Output of the completed terminal nodes: one passes through unchanged,
/// several are joined with provenance markers.
fn aggregate(graph: &ExecutionGraph, nodes: &[NodeOutcome]) -> Option<String> {
    let terminals: HashSet<&str> = graph.terminals().into_iter().collect();
    let finished: Vec<&NodeOutcome> = nodes
        .iter()
        .filter(|n| terminals.contains(n.node_id.as_str()))
        .filter(|n| n.status == NodeStatus::Completed)
        .collect();

    match finished.as_slice() {
        [] => None,
        [only] => only.output.clone(),
        many => Some(
            many.iter()
                .map(|n| {
                    format!(
                        "### {} ({})\n\n{}",
                        n.node_id,
                        n.agent_id,
                        n.output.as_deref().unwrap_or("")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
        ),
    }
}

/// Run one node: its handoff chain under the node's wall-clock budget.
async fn run_node(
    env: ExecutionEnv,
    node: GraphNode,
    parent_result: Option<String>,
    plan: Option<Vec<String>>,
) -> NodeOutcome {
    let started = Instant::now();
    let exec = env.execution_id.clone();
    publish_or_warn(
        &env.hub,
        ControlFrame::new(exec.clone(), ControlType::TaskStarted)
            .with_agent(&node.agent)
            .with_payload(serde_json::json!({ "node_id": node.id, "task": node.task })),
    )
    .await;
    info!(execution_id = %exec, node_id = %node.id, agent_id = %node.agent, "Node started");

    let budget = node
        .timeout
        .unwrap_or(Duration::from_secs(env.engine.node_timeout_secs));
    // The node budget cancels only this node's steps.
    let node_cancel = env.cancel.child_token();
    let env = ExecutionEnv {
        cancel: node_cancel.clone(),
        ..env
    };
    let chain = run_chain(&env, &node, parent_result, plan);
    tokio::pin!(chain);
    let raced = tokio::select! {
        result = &mut chain => Some(result),
        _ = tokio::time::sleep(budget) => None,
    };
    let node_timed_out = raced.is_none();
    let result = match raced {
        Some(result) => result,
        None => {
            node_cancel.cancel();
            chain.await
        }
    };

    let mut outcome = NodeOutcome {
        node_id: node.id.clone(),
        agent_id: node.agent.clone(),
        status: NodeStatus::Completed,
        output: None,
        reason: None,
        handoffs: Vec::new(),
        elapsed_ms: 0,
    };
    match result {
        Ok(chain) => {
            outcome.output = Some(chain.output);
            outcome.handoffs = chain.handoffs;
            if let Some(reason) = chain.stopped {
                outcome.status = NodeStatus::Failed;
                outcome.reason = Some(reason.to_string());
            }
        }
        Err(ChainError {
            agent_id,
            error: HivemindError::Cancelled,
        }) => {
            let (status, reason) = if node_timed_out {
                let err = HivemindError::Timeout {
                    scope: format!("node {}", node.id),
                    elapsed_ms: budget.as_millis() as u64,
                };
                (NodeStatus::TimedOut, err.to_string())
            } else {
                env.halt
                    .get()
                    .cloned()
                    .unwrap_or((NodeStatus::Cancelled, "execution cancelled".to_string()))
            };
            if status == NodeStatus::TimedOut {
                publish_or_warn(
                    &env.hub,
                    ControlFrame::error(exec.clone(), &agent_id, reason.clone()),
                )
                .await;
            }
            outcome.status = status;
            outcome.reason = Some(reason);
        }
        Err(ChainError { error, .. }) => {
            outcome.status = NodeStatus::Failed;
            outcome.reason = Some(error.to_string());
        }
    }
    outcome.elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome.status {
        NodeStatus::Completed => info!(
            execution_id = %exec,
            node_id = %node.id,
            handoffs = outcome.handoffs.len(),
            elapsed_ms = outcome.elapsed_ms,
            "Node completed"
        ),
        NodeStatus::Cancelled | NodeStatus::Blocked => debug!(
            execution_id = %exec,
            node_id = %node.id,
            status = %outcome.status,
            "Node cut off"
        ),
        status => error!(
            execution_id = %exec,
            node_id = %node.id,
            status = %status,
            reason = outcome.reason.as_deref().unwrap_or(""),
            "Node did not complete"
        ),
    }

    publish_or_warn(&env.hub, task_completed(&exec, &outcome)).await;
    outcome
}

/// Drive the handoff chain that starts at the node's agent.
async fn run_chain(
    env: &ExecutionEnv,
    node: &GraphNode,
    parent_result: Option<String>,
    plan: Option<Vec<String>>,
) -> std::result::Result<ChainOutcome, ChainError> {
    let mut controller = HandoffController::new(
        &node.agent,
        &node.task,
        env.profiles.clone(),
        env.handoff.clone(),
    );
    if let Some(plan) = plan {
        controller = controller.with_plan(plan);
    }

    let mut agent_id = controller.current_agent().to_string();
    let mut task = node.task.clone();
    let mut parent = parent_result;

    loop {
        let completion = run_step_with_retries(env, &agent_id, &task, parent.take())
            .await
            .map_err(|error| ChainError {
                agent_id: agent_id.clone(),
                error,
            })?;

        let signal = controller.record_completion(&agent_id, &completion.result);
        if let HandoffSignal::Stop(reason) = signal {
            return Ok(ChainOutcome {
                output: completion.result,
                handoffs: controller.history().to_vec(),
                stopped: Some(reason),
            });
        }
        if let Some(to) = completion.handoff_to {
            controller.request_handoff(to);
        }

        let Some(next) = controller.next_agent() else {
            return Ok(ChainOutcome {
                output: completion.result,
                handoffs: controller.history().to_vec(),
                stopped: controller.stop_reason().cloned(),
            });
        };
        if let Some(decision) = controller.history().last() {
            debug!(
                node_id = %node.id,
                from = %decision.from_agent,
                to = %decision.to_agent,
                reason = %decision.reason,
                "Handoff"
            );
            env.hub
                .publish_control(
                    ControlFrame::new(env.execution_id.clone(), ControlType::Handoff)
                        .with_agent(&decision.from_agent)
                        .with_payload(serde_json::json!({
                            "node_id": node.id,
                            "from": decision.from_agent,
                            "to": decision.to_agent,
                            "reason": decision.reason,
                        })),
                )
                .await
                .map_err(|error| ChainError {
                    agent_id: decision.from_agent.clone(),
                    error,
                })?;
            task = decision.context.render();
        }
        agent_id = next;
    }
}

fn calculate_backoff(attempt: u32, config: &EngineConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// One agent step through its circuit breaker, retried with backoff while
/// the error is retryable and attempts remain.
async fn run_step_with_retries(
    env: &ExecutionEnv,
    agent_id: &str,
    task: &str,
    parent_result: Option<String>,
) -> Result<StepCompletion> {
    let agent = env
        .agents
        .get(agent_id)
        .cloned()
        .ok_or_else(|| HivemindError::AgentNotFound(agent_id.to_string()))?;
    let breaker = env.circuits.for_agent(agent_id).await;
    let max_attempts = env.engine.step_attempts.max(1);

    let mut attempt = 0;
    loop {
        if env.cancel.is_cancelled() {
            return Err(HivemindError::Cancelled);
        }
        let result = breaker
            .execute(|| run_step(env, agent.as_ref(), task, parent_result.clone()))
            .await;
        match result {
            Ok(completion) => return Ok(completion),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let backoff = calculate_backoff(attempt, &env.engine);
                warn!(
                    agent_id,
                    attempt = attempt + 1,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying agent step"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = env.cancel.cancelled() => return Err(HivemindError::Cancelled),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run one step: open a segment, forward the agent's frames to the hub, and
/// close the segment with exactly one final token.
async fn run_step(
    env: &ExecutionEnv,
    agent: &dyn AgentRuntime,
    task: &str,
    parent_result: Option<String>,
) -> Result<StepCompletion> {
    let exec = &env.execution_id;
    let agent_id = agent.id().to_string();
    let turn = env
        .turns
        .get(&agent_id)
        .ok_or_else(|| HivemindError::AgentNotFound(agent_id.clone()))?;
    // Held until the segment is closed, so segments of one agent never interleave.
    let _turn = tokio::select! {
        guard = turn.lock() => guard,
        _ = env.cancel.cancelled() => return Err(HivemindError::Cancelled),
    };
    let first_sequence = env.hub.next_sequence(exec, &agent_id).await?;

    env.hub
        .publish_control(
            ControlFrame::new(exec.clone(), ControlType::AgentStarted)
                .with_agent(&agent_id)
                .with_payload(serde_json::json!({
                    "task": task,
                    "first_sequence": first_sequence,
                })),
        )
        .await?;

    let request = StepRequest::new(exec.clone(), &agent_id, task)
        .with_parent_result(parent_result)
        .with_first_sequence(first_sequence);
    let ctx = StepContext::new(request)
        .with_tools(env.tools.clone())
        .with_cancel(env.cancel.child_token());
    let mut stream = agent.stream(ctx);

    let mut segment = Segment {
        next_sequence: first_sequence,
        finalized: false,
    };
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = env.cancel.cancelled() => {
                if let Err(e) = segment.close(env, &agent_id).await {
                    warn!(agent_id = %agent_id, error = %e, "Could not close cancelled segment");
                }
                return Err(HivemindError::Cancelled);
            }
        };
        let Some(frame) = frame else { break };
        if frame.execution_id() != exec || frame.agent_id().is_some_and(|a| a != agent_id) {
            warn!(agent_id = %agent_id, "Dropping frame addressed to another execution or agent");
            continue;
        }

        match frame {
            Frame::Token(token) => {
                let sequence = token.sequence;
                let is_final = token.is_final;
                env.hub.publish_token(token).await?;
                segment.next_sequence = sequence + 1;
                segment.finalized = is_final;
            }
            Frame::Control(mut control) if control.kind.is_terminal() => {
                control.agent_id.get_or_insert_with(|| agent_id.clone());
                segment.close(env, &agent_id).await?;
                if control.kind == ControlType::Error {
                    let message = control
                        .error_text()
                        .unwrap_or_else(|| "agent reported an error".to_string());
                    env.hub.publish_control(control).await?;
                    return Err(HivemindError::StepFailed { agent_id, message });
                }
                let completion = StepCompletion {
                    result: control.result_text().unwrap_or_default(),
                    handoff_to: control.handoff_to().map(String::from),
                };
                env.hub.publish_control(control).await?;
                return Ok(completion);
            }
            Frame::Control(control) if is_lifecycle(control.kind) => {
                debug!(agent_id = %agent_id, kind = ?control.kind, "Ignoring lifecycle frame");
            }
            Frame::Control(mut control) => {
                control.agent_id.get_or_insert_with(|| agent_id.clone());
                env.hub.publish_control(control).await?;
            }
            Frame::Metric(metric) => {
                env.hub.publish_metric(metric).await?;
            }
        }
    }

    segment.close(env, &agent_id).await?;
    let err = HivemindError::StreamIncomplete(agent_id.clone());
    env.hub
        .publish_control(ControlFrame::error(exec.clone(), &agent_id, err.to_string()))
        .await?;
    Err(err)
}

/// Token bookkeeping for the step in flight.
struct Segment {
    next_sequence: u64,
    finalized: bool,
}

impl Segment {
    /// Publish an empty final token if the agent did not end its segment.
    async fn close(&mut self, env: &ExecutionEnv, agent_id: &str) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        let token = TokenFrame::new(env.execution_id.clone(), agent_id, self.next_sequence, "")
            .finalize();
        env.hub.publish_token(token).await?;
        self.finalized = true;
        Ok(())
    }
}

fn is_lifecycle(kind: ControlType) -> bool {
    matches!(
        kind,
        ControlType::AgentStarted
            | ControlType::TaskStarted
            | ControlType::TaskCompleted
            | ControlType::SessionStart
            | ControlType::SessionEnd
    )
}

async fn publish_or_warn(hub: &EventHub, frame: ControlFrame) {
    let kind = frame.kind;
    if let Err(e) = hub.publish_control(frame).await {
        warn!(kind = ?kind, error = %e, "Dropped control frame");
    }
}
