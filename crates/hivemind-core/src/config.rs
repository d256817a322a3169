use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HivemindError, Result};

/// Top-level Hivemind configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HivemindConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub hub: HubConfig,
    /// Agent routing profiles.
    #[serde(default)]
    pub agents: Vec<AgentProfileConfig>,
}

/// How graph levels are dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One node at a time, in topological order.
    Sequential,
    /// Every node of a level at once, up to `max_parallel`.
    Parallel,
    /// Let the mode strategy decide.
    #[default]
    Auto,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum agent steps executing at the same time.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Wall-clock budget for a whole execution.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    /// Wall-clock budget for one graph node (including its handoff chain).
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Attempts per agent step before the node is marked failed.
    #[serde(default = "default_step_attempts")]
    pub step_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Agent that receives a task submitted without a graph.
    #[serde(default)]
    pub entry_agent: Option<String>,
    /// Agent that merges fan-out results for tasks submitted without a graph.
    #[serde(default)]
    pub aggregator_agent: Option<String>,
    /// Minimum estimated speedup for `auto` to pick parallel dispatch.
    #[serde(default = "default_min_speedup")]
    pub min_speedup: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            execution_timeout_secs: default_execution_timeout(),
            node_timeout_secs: default_node_timeout(),
            mode: ExecutionMode::default(),
            step_attempts: default_step_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            entry_agent: None,
            aggregator_agent: None,
            min_speedup: default_min_speedup(),
        }
    }
}

fn default_max_parallel() -> usize { 4 }
fn default_execution_timeout() -> u64 { 1800 }
fn default_node_timeout() -> u64 { 600 }
fn default_step_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }
fn default_min_speedup() -> f64 { 1.5 }

/// Termination limits for handoff chains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Maximum handoffs recorded in one chain.
    #[serde(default = "default_max_handoffs")]
    pub max_handoffs: usize,
    /// Maximum times one agent may appear in a chain.
    #[serde(default = "default_max_agent_repeats")]
    pub max_agent_repeats: usize,
    /// Number of most recent agents inspected for ping-pong.
    #[serde(default = "default_repetitive_window")]
    pub repetitive_window: usize,
    /// Distinct agents required inside the window.
    #[serde(default = "default_min_unique_agents")]
    pub min_unique_agents: usize,
    /// Wall-clock budget for one chain.
    #[serde(default = "default_handoff_duration")]
    pub max_duration_secs: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            max_handoffs: default_max_handoffs(),
            max_agent_repeats: default_max_agent_repeats(),
            repetitive_window: default_repetitive_window(),
            min_unique_agents: default_min_unique_agents(),
            max_duration_secs: default_handoff_duration(),
        }
    }
}

fn default_max_handoffs() -> usize { 10 }
fn default_max_agent_repeats() -> usize { 3 }
fn default_repetitive_window() -> usize { 6 }
fn default_min_unique_agents() -> usize { 2 }
fn default_handoff_duration() -> u64 { 900 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// How long a gated call waits for a human.
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,
    /// Identical requests inside this window share one decision.
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window_secs: u64,
    /// Tools that require approval. All others pass straight through.
    #[serde(default = "default_sensitive_tools")]
    pub sensitive_tools: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout(),
            dedupe_window_secs: default_dedupe_window(),
            sensitive_tools: default_sensitive_tools(),
        }
    }
}

fn default_approval_timeout() -> u64 { 300 }
fn default_dedupe_window() -> u64 { 10 }
fn default_sensitive_tools() -> Vec<String> {
    vec![
        "code_execution".to_string(),
        "file_write".to_string(),
        "browser_automation".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open a circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cool-down before a half-open trial call.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
        }
    }
}

fn default_failure_threshold() -> u32 { 3 }
fn default_recovery_timeout() -> u64 { 30 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Frames retained per channel before the oldest are evicted.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How long history stays readable after cleanup.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            retention_secs: default_retention(),
        }
    }
}

fn default_channel_capacity() -> usize { 4096 }
fn default_retention() -> u64 { 300 }

/// Routing profile of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfileConfig {
    pub id: String,
    #[serde(default)]
    pub role: String,
    /// Agents this one may hand off to, in priority order.
    #[serde(default)]
    pub successors: Vec<String>,
    /// How many times this agent may run within one chain.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_max_iterations() -> usize { 3 }

impl HivemindConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| HivemindError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| HivemindError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_parallel == 0 {
            return Err(HivemindError::Config("engine.max_parallel must be at least 1".into()));
        }
        if self.engine.step_attempts == 0 {
            return Err(HivemindError::Config("engine.step_attempts must be at least 1".into()));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(HivemindError::Config(
                "circuit.failure_threshold must be at least 1".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(HivemindError::Config(format!(
                    "agent '{}' is declared twice",
                    agent.id
                )));
            }
        }
        Ok(())
    }

    /// Profile declared for an agent, if any.
    pub fn profile(&self, agent_id: &str) -> Option<&AgentProfileConfig> {
        self.agents.iter().find(|a| a.id == agent_id)
    }
}

/// Graph file: a list of nodes with their dependencies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    /// Agent that runs this node.
    pub agent: String,
    pub task: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// A failure of a critical node aborts the whole execution.
    #[serde(default)]
    pub critical: bool,
    /// Overrides `engine.node_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl GraphSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| HivemindError::ConfigNotFound(path.display().to_string()))?;
        toml::from_str(&expand_env_vars(&content)).map_err(|e| HivemindError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_HIVEMIND_VAR", "4");
        let result = expand_env_vars("max_parallel = ${TEST_HIVEMIND_VAR}");
        assert_eq!(result, "max_parallel = 4");
        std::env::remove_var("TEST_HIVEMIND_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_HIVEMIND_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_HIVEMIND_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: HivemindConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_parallel, 4);
        assert_eq!(config.engine.mode, ExecutionMode::Auto);
        assert_eq!(config.approval.timeout_secs, 300);
        assert_eq!(config.approval.dedupe_window_secs, 10);
        assert_eq!(config.circuit.failure_threshold, 3);
        assert_eq!(config.handoff.max_handoffs, 10);
        assert!(config.agents.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_agent_profiles() {
        let toml_str = r#"
[engine]
mode = "parallel"
entry_agent = "planner"

[[agents]]
id = "planner"
role = "Breaks the task down"
successors = ["researcher", "writer"]

[[agents]]
id = "writer"
max_iterations = 1
"#;
        let config: HivemindConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.mode, ExecutionMode::Parallel);
        assert_eq!(config.engine.entry_agent.as_deref(), Some("planner"));
        let planner = config.profile("planner").unwrap();
        assert_eq!(planner.successors, vec!["researcher", "writer"]);
        assert_eq!(planner.max_iterations, 3);
        assert_eq!(config.profile("writer").unwrap().max_iterations, 1);
        assert!(config.profile("nobody").is_none());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_zero_parallel() {
        let mut config: HivemindConfig = toml::from_str(
            r#"
[[agents]]
id = "a"
[[agents]]
id = "a"
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(HivemindError::Config(_))));

        config.agents.pop();
        config.engine.max_parallel = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Parallel".parse::<ExecutionMode>(), Ok(ExecutionMode::Parallel));
        assert!("fastest".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_graph_spec() {
        let spec: GraphSpec = toml::from_str(
            r#"
[[nodes]]
id = "a"
agent = "researcher"
task = "find sources"

[[nodes]]
id = "b"
agent = "writer"
task = "write it up"
depends_on = ["a"]
critical = true
timeout_secs = 30
"#,
        )
        .unwrap();
        assert_eq!(spec.nodes.len(), 2);
        assert!(spec.nodes[0].depends_on.is_empty());
        assert_eq!(spec.nodes[1].depends_on, vec!["a"]);
        assert!(spec.nodes[1].critical);
        assert_eq!(spec.nodes[1].timeout_secs, Some(30));
    }
}
