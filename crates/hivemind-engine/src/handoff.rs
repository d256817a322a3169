use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use hivemind_core::config::{AgentProfileConfig, HandoffConfig};

/// Routing profile of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub role: String,
    /// Allowed successors, in priority order.
    pub successors: Vec<String>,
    /// How many times this agent may run within one chain.
    pub max_iterations: usize,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            successors: Vec::new(),
            max_iterations: 3,
        }
    }

    pub fn with_successors<I, S>(mut self, successors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.successors = successors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }
}

impl From<&AgentProfileConfig> for AgentProfile {
    fn from(config: &AgentProfileConfig) -> Self {
        Self {
            id: config.id.clone(),
            role: config.role.clone(),
            successors: config.successors.clone(),
            max_iterations: config.max_iterations,
        }
    }
}

/// What the next agent is told about the work so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandoffContext {
    pub from_agent: String,
    pub previous_output: Option<String>,
    pub role: String,
    /// `(k, n)` when the chain follows a fixed plan.
    pub position: Option<(usize, usize)>,
    pub task: String,
}

impl HandoffContext {
    /// Render as the task text for the next agent.
    pub fn render(&self) -> String {
        let mut prompt = String::new();
        prompt.push_str("## Handoff\n\n");
        prompt.push_str(&format!("**From**: {}\n", self.from_agent));
        if !self.role.is_empty() {
            prompt.push_str(&format!("**Your role**: {}\n", self.role));
        }
        if let Some((k, n)) = self.position {
            prompt.push_str(&format!("**Position**: step {} of {}\n", k, n));
        }
        if let Some(ref output) = self.previous_output {
            prompt.push_str("\n### Previous output\n\n");
            prompt.push_str(output);
            prompt.push('\n');
        }
        prompt.push_str("\n---\n\n");
        prompt.push_str(&self.task);
        prompt
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffDecision {
    pub from_agent: String,
    pub to_agent: String,
    pub reason: String,
    pub context: HandoffContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    LoopSuspected(String),
    TimeBudgetExceeded,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoopSuspected(detail) => write!(f, "loop suspected: {}", detail),
            Self::TimeBudgetExceeded => write!(f, "handoff time budget exceeded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffSignal {
    Continue,
    Stop(StopReason),
}

/// Bounded state machine deciding which agent runs next in a chain.
///
/// Termination is guaranteed: no agent runs more than `max_agent_repeats`
/// times, the last `repetitive_window` steps must involve at least
/// `min_unique_agents` agents, the chain records at most `max_handoffs`
/// handoffs, and it has a wall-clock budget.
pub struct HandoffController {
    profiles: Arc<HashMap<String, AgentProfile>>,
    limits: HandoffConfig,
    task: String,
    plan: Option<Vec<String>>,
    current: String,
    trail: Vec<String>,
    runs: HashMap<String, usize>,
    outputs: HashMap<String, String>,
    history: Vec<HandoffDecision>,
    preferred: Option<String>,
    started: Instant,
    stopped: Option<StopReason>,
}

impl HandoffController {
    pub fn new(
        entry_agent: impl Into<String>,
        task: impl Into<String>,
        profiles: Arc<HashMap<String, AgentProfile>>,
        limits: HandoffConfig,
    ) -> Self {
        Self {
            profiles,
            limits,
            task: task.into(),
            plan: None,
            current: entry_agent.into(),
            trail: Vec::new(),
            runs: HashMap::new(),
            outputs: HashMap::new(),
            history: Vec::new(),
            preferred: None,
            started: Instant::now(),
            stopped: None,
        }
    }

    /// Follow a fixed order of agents instead of profile successors.
    pub fn with_plan(mut self, plan: Vec<String>) -> Self {
        if let Some(first) = plan.first() {
            self.current = first.clone();
        }
        self.plan = Some(plan);
        self
    }

    pub fn current_agent(&self) -> &str {
        &self.current
    }

    pub fn history(&self) -> &[HandoffDecision] {
        &self.history
    }

    /// Agents that completed a step, in order.
    pub fn trail(&self) -> &[String] {
        &self.trail
    }

    pub fn runs(&self, agent_id: &str) -> usize {
        self.runs.get(agent_id).copied().unwrap_or(0)
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stopped.as_ref()
    }

    pub fn latest_output(&self, agent_id: &str) -> Option<&str> {
        self.outputs.get(agent_id).map(String::as_str)
    }

    /// Record that `agent_id` finished a step, then run loop detection.
    pub fn record_completion(&mut self, agent_id: &str, output: &str) -> HandoffSignal {
        if let Some(ref reason) = self.stopped {
            return HandoffSignal::Stop(reason.clone());
        }

        self.current = agent_id.to_string();
        self.trail.push(agent_id.to_string());
        *self.runs.entry(agent_id.to_string()).or_insert(0) += 1;
        self.outputs.insert(agent_id.to_string(), output.to_string());

        match self.detect_stop(agent_id) {
            Some(reason) => {
                warn!(agent_id, reason = %reason, "Stopping handoff chain");
                self.stopped = Some(reason.clone());
                HandoffSignal::Stop(reason)
            }
            None => HandoffSignal::Continue,
        }
    }

    /// Ask for `to` as the next agent. Honoured only if `to` is an allowed
    /// successor still under its iteration limit.
    pub fn request_handoff(&mut self, to: impl Into<String>) {
        self.preferred = Some(to.into());
    }

    /// Pick the next agent and record the handoff. `None` means the chain is
    /// complete, or stopped (see [`stop_reason`](Self::stop_reason)).
    pub fn next_agent(&mut self) -> Option<String> {
        if self.stopped.is_some() || self.trail.is_empty() {
            return None;
        }
        let from = self.current.clone();
        let preferred = self.preferred.take();

        let (candidates, planned): (Vec<String>, bool) = match self.plan {
            Some(ref plan) => (plan.get(self.trail.len()).cloned().into_iter().collect(), true),
            None => (
                self.profiles
                    .get(&from)
                    .map(|p| p.successors.clone())
                    .unwrap_or_default(),
                false,
            ),
        };
        let under_iterations: Vec<String> = candidates
            .into_iter()
            .filter(|c| self.runs(c) < self.max_iterations(c))
            .collect();
        let eligible: Vec<&String> = under_iterations
            .iter()
            .filter(|c| self.runs(c) < self.limits.max_agent_repeats)
            .collect();

        if eligible.is_empty() {
            if let Some(blocked) = under_iterations.first() {
                let reason = StopReason::LoopSuspected(format!(
                    "agent '{}' already ran {} times",
                    blocked,
                    self.runs(blocked)
                ));
                warn!(from = %from, reason = %reason, "Stopping handoff chain");
                self.stopped = Some(reason);
            }
            return None;
        }

        let (to, reason) = match preferred {
            Some(ref p) if !planned && eligible.iter().any(|c| *c == p) => {
                (p.clone(), format!("requested by {}", from))
            }
            Some(ref p) => {
                debug!(from = %from, requested = %p, "Ignoring ineligible handoff request");
                (eligible[0].clone(), self.default_reason(&from, planned))
            }
            None => (eligible[0].clone(), self.default_reason(&from, planned)),
        };

        let context = self.handoff_context(&from, &to);
        self.history.push(HandoffDecision {
            from_agent: from,
            to_agent: to.clone(),
            reason,
            context,
        });
        self.current = to.clone();
        Some(to)
    }

    /// Context handed from `from` to `to`: the latest output of `from`, the
    /// role of `to`, the plan position, and the original task.
    pub fn handoff_context(&self, from: &str, to: &str) -> HandoffContext {
        HandoffContext {
            from_agent: from.to_string(),
            previous_output: self.outputs.get(from).cloned(),
            role: self
                .profiles
                .get(to)
                .map(|p| p.role.clone())
                .unwrap_or_default(),
            position: self
                .plan
                .as_ref()
                .map(|plan| (self.trail.len() + 1, plan.len())),
            task: self.task.clone(),
        }
    }

    fn default_reason(&self, from: &str, planned: bool) -> String {
        match self.plan {
            Some(ref plan) if planned => {
                format!("plan step {} of {}", self.trail.len() + 1, plan.len())
            }
            _ => format!("successor of {}", from),
        }
    }

    fn max_iterations(&self, agent_id: &str) -> usize {
        self.profiles
            .get(agent_id)
            .map_or(3, |p| p.max_iterations)
    }

    fn detect_stop(&self, agent_id: &str) -> Option<StopReason> {
        let runs = self.runs(agent_id);
        if runs > self.limits.max_agent_repeats {
            return Some(StopReason::LoopSuspected(format!(
                "agent '{}' ran {} times (limit {})",
                agent_id, runs, self.limits.max_agent_repeats
            )));
        }

        let window = self.limits.repetitive_window;
        if window > 0 && self.trail.len() >= window {
            let recent: HashSet<&str> = self.trail[self.trail.len() - window..]
                .iter()
                .map(String::as_str)
                .collect();
            if recent.len() < self.limits.min_unique_agents {
                let mut agents: Vec<&str> = recent.into_iter().collect();
                agents.sort();
                return Some(StopReason::LoopSuspected(format!(
                    "last {} steps only involved {}",
                    window,
                    agents.join(", ")
                )));
            }
        }

        if self.history.len() >= self.limits.max_handoffs {
            return Some(StopReason::LoopSuspected(format!(
                "reached {} handoffs",
                self.limits.max_handoffs
            )));
        }

        if self.started.elapsed() > Duration::from_secs(self.limits.max_duration_secs) {
            return Some(StopReason::TimeBudgetExceeded);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles(list: Vec<AgentProfile>) -> Arc<HashMap<String, AgentProfile>> {
        Arc::new(list.into_iter().map(|p| (p.id.clone(), p)).collect())
    }

    fn limits(max_handoffs: usize, repeats: usize, window: usize, unique: usize) -> HandoffConfig {
        HandoffConfig {
            max_handoffs,
            max_agent_repeats: repeats,
            repetitive_window: window,
            min_unique_agents: unique,
            max_duration_secs: 900,
        }
    }

    /// Drive the chain until it ends, returning the stop reason if any.
    fn drive(controller: &mut HandoffController) -> Option<StopReason> {
        let mut agent = controller.current_agent().to_string();
        for step in 0..100 {
            if let HandoffSignal::Stop(reason) =
                controller.record_completion(&agent, &format!("output {}", step))
            {
                return Some(reason);
            }
            match controller.next_agent() {
                Some(next) => agent = next,
                None => return controller.stop_reason().cloned(),
            }
        }
        panic!("chain did not terminate");
    }

    #[tokio::test]
    async fn ping_pong_is_stopped_as_a_loop() {
        let profiles = profiles(vec![
            AgentProfile::new("a", "drafter").with_successors(["b"]).with_max_iterations(50),
            AgentProfile::new("b", "critic").with_successors(["a"]).with_max_iterations(50),
        ]);
        let mut controller = HandoffController::new("a", "task", profiles, limits(5, 2, 4, 2));

        let reason = drive(&mut controller).expect("loop must be detected");
        assert!(matches!(reason, StopReason::LoopSuspected(_)));
        assert!(controller.history().len() <= 5);
        assert!(controller.runs("a") <= 2 && controller.runs("b") <= 2);
    }

    #[tokio::test]
    async fn narrow_window_is_a_loop() {
        let profiles = profiles(vec![
            AgentProfile::new("a", "").with_successors(["b", "c"]),
            AgentProfile::new("b", "").with_successors(["a"]),
            AgentProfile::new("c", ""),
        ]);
        let mut controller = HandoffController::new("a", "task", profiles, limits(10, 5, 4, 3));

        let reason = drive(&mut controller).unwrap();
        assert_eq!(
            reason,
            StopReason::LoopSuspected("last 4 steps only involved a, b".into())
        );
        assert_eq!(controller.trail(), &["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn handoff_limit_bounds_long_chains() {
        let list: Vec<AgentProfile> = (0..10)
            .map(|i| AgentProfile::new(format!("a{}", i), "").with_successors([format!("a{}", i + 1)]))
            .collect();
        let mut controller = HandoffController::new("a0", "task", profiles(list), limits(3, 3, 6, 2));

        let reason = drive(&mut controller).unwrap();
        assert_eq!(reason, StopReason::LoopSuspected("reached 3 handoffs".into()));
        assert_eq!(controller.history().len(), 3);
    }

    #[tokio::test]
    async fn chain_without_successors_completes() {
        let profiles = profiles(vec![
            AgentProfile::new("research", "researcher").with_successors(["write"]),
            AgentProfile::new("write", "writer"),
        ]);
        let mut controller =
            HandoffController::new("research", "explain tokio", profiles, HandoffConfig::default());

        assert_eq!(drive(&mut controller), None);
        assert_eq!(controller.trail(), &["research", "write"]);
        let decision = &controller.history()[0];
        assert_eq!(decision.reason, "successor of research");
        assert_eq!(decision.context.role, "writer");
        assert_eq!(decision.context.previous_output.as_deref(), Some("output 0"));
    }

    #[tokio::test]
    async fn iteration_limit_filters_successors() {
        let profiles = profiles(vec![
            AgentProfile::new("a", "").with_successors(["b", "c"]),
            AgentProfile::new("b", "").with_successors(["a"]).with_max_iterations(1),
            AgentProfile::new("c", ""),
        ]);
        let mut controller =
            HandoffController::new("a", "task", profiles, HandoffConfig::default());

        assert_eq!(drive(&mut controller), None);
        assert_eq!(controller.trail(), &["a", "b", "a", "c"]);
    }

    #[tokio::test]
    async fn requested_successor_wins_only_when_allowed() {
        let profiles = profiles(vec![
            AgentProfile::new("triage", "").with_successors(["billing", "support"]),
            AgentProfile::new("billing", ""),
            AgentProfile::new("support", ""),
        ]);
        let mut controller =
            HandoffController::new("triage", "task", profiles.clone(), HandoffConfig::default());
        controller.record_completion("triage", "refund please");
        controller.request_handoff("support");
        assert_eq!(controller.next_agent().as_deref(), Some("support"));
        assert_eq!(controller.history()[0].reason, "requested by triage");

        let mut controller =
            HandoffController::new("triage", "task", profiles, HandoffConfig::default());
        controller.record_completion("triage", "hi");
        controller.request_handoff("nobody");
        assert_eq!(controller.next_agent().as_deref(), Some("billing"));
    }

    #[tokio::test]
    async fn fixed_plan_reports_position() {
        let profiles = profiles(vec![AgentProfile::new("critic", "reviewer")]);
        let mut controller = HandoffController::new("x", "ship it", profiles, HandoffConfig::default())
            .with_plan(vec!["writer".into(), "critic".into(), "editor".into()]);
        assert_eq!(controller.current_agent(), "writer");

        controller.record_completion("writer", "draft");
        assert_eq!(controller.next_agent().as_deref(), Some("critic"));
        let context = &controller.history()[0].context;
        assert_eq!(context.position, Some((2, 3)));

        let text = context.render();
        assert!(text.contains("**Your role**: reviewer"));
        assert!(text.contains("step 2 of 3"));
        assert!(text.contains("draft"));
        assert!(text.ends_with("ship it"));

        controller.record_completion("critic", "notes");
        assert_eq!(controller.next_agent().as_deref(), Some("editor"));
        controller.record_completion("editor", "final");
        assert_eq!(controller.next_agent(), None);
        assert!(controller.stop_reason().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn time_budget_stops_the_chain() {
        let profiles = profiles(vec![AgentProfile::new("a", "").with_successors(["b"])]);
        let mut limits = HandoffConfig::default();
        limits.max_duration_secs = 60;
        let mut controller = HandoffController::new("a", "task", profiles, limits);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            controller.record_completion("a", "late"),
            HandoffSignal::Stop(StopReason::TimeBudgetExceeded)
        );
        assert_eq!(controller.next_agent(), None);
    }
}
