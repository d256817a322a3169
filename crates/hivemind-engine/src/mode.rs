use regex::Regex;
use serde::Serialize;
use tracing::warn;

use hivemind_core::config::ExecutionMode;

use crate::graph::ExecutionGraph;

/// Outcome of choosing how to dispatch a task.
#[derive(Debug, Clone, Serialize)]
pub struct ModeDecision {
    /// Never `Auto`.
    pub mode: ExecutionMode,
    pub estimated_speedup: f64,
    pub reason: String,
}

/// Decides between sequential and parallel dispatch for `auto` mode.
pub trait ModeStrategy: Send + Sync + 'static {
    fn decide(&self, task: &str, graph: Option<&ExecutionGraph>) -> ModeDecision;
}

const PARALLEL_SIGNALS: &[(&str, &str)] = &[
    (r"(?i)\b(compare|comparison|contrast)\b", "comparison"),
    (r"(?i)\b(vs\.?|versus)(\s|$)", "versus"),
    (
        r"(?i)\b(each|respectively|separately|independently|in parallel)\b",
        "independent parts",
    ),
    (r"(?i)\w+\s*,\s*\w+\s*,?\s*(and|or)\s+\w+", "enumeration"),
];

const SEQUENTIAL_SIGNALS: &[(&str, &str)] = &[
    (r"(?i)\b(then|afterwards|after that|step by step|finally)\b", "ordered steps"),
    (r"(?i)\bbased on (the|its|their)\b", "dependent step"),
];

/// Keyword heuristic: parallel only when the task reads as independent parts,
/// nothing in it reads as ordered steps, and the estimated speedup clears
/// `min_speedup`. Everything else, including ambiguous tasks, is sequential.
pub struct KeywordModeStrategy {
    parallel: Vec<(Regex, String)>,
    sequential: Vec<(Regex, String)>,
    item_separator: Option<Regex>,
    min_speedup: f64,
}

impl KeywordModeStrategy {
    pub fn new(min_speedup: f64) -> Self {
        Self {
            parallel: compile(PARALLEL_SIGNALS),
            sequential: compile(SEQUENTIAL_SIGNALS),
            item_separator: Regex::new(r"(?i),|\s(and|or|vs\.?|versus)\s").ok(),
            min_speedup,
        }
    }

    /// Speedup of running a graph level-parallel: nodes per level, on average.
    pub fn graph_speedup(graph: &ExecutionGraph) -> f64 {
        let levels = graph.levels().len();
        if levels == 0 {
            return 1.0;
        }
        graph.len() as f64 / levels as f64
    }

    /// Rough width of a task with no graph: the number of listed items.
    fn task_width(&self, task: &str) -> f64 {
        let separators = self
            .item_separator
            .as_ref()
            .map_or(0, |re| re.find_iter(task).count());
        (separators + 1) as f64
    }
}

impl Default for KeywordModeStrategy {
    fn default() -> Self {
        Self::new(1.5)
    }
}

impl ModeStrategy for KeywordModeStrategy {
    fn decide(&self, task: &str, graph: Option<&ExecutionGraph>) -> ModeDecision {
        let estimated_speedup = match graph {
            Some(g) => Self::graph_speedup(g),
            None => self.task_width(task),
        };
        let sequential = |reason: String| ModeDecision {
            mode: ExecutionMode::Sequential,
            estimated_speedup,
            reason,
        };

        if let Some((_, label)) = self.sequential.iter().find(|(re, _)| re.is_match(task)) {
            return sequential(format!("task reads as {}", label));
        }
        let Some((_, label)) = self.parallel.iter().find(|(re, _)| re.is_match(task)) else {
            return sequential("no parallel signal".to_string());
        };
        if estimated_speedup < self.min_speedup {
            return sequential(format!(
                "{} signal but estimated speedup {:.1} is below {:.1}",
                label, estimated_speedup, self.min_speedup
            ));
        }
        ModeDecision {
            mode: ExecutionMode::Parallel,
            estimated_speedup,
            reason: format!("{} signal, estimated speedup {:.1}", label, estimated_speedup),
        }
    }
}

fn compile(patterns: &[(&str, &str)]) -> Vec<(Regex, String)> {
    patterns
        .iter()
        .filter_map(|(pattern, label)| match Regex::new(pattern) {
            Ok(re) => Some((re, label.to_string())),
            Err(e) => {
                warn!(pattern, error = %e, "Invalid mode signal regex, skipping");
                None
            }
        })
        .collect()
}

/// Resolve a requested mode into a concrete one.
pub fn resolve_mode(
    requested: ExecutionMode,
    strategy: &dyn ModeStrategy,
    task: &str,
    graph: Option<&ExecutionGraph>,
) -> ModeDecision {
    match requested {
        ExecutionMode::Auto => strategy.decide(task, graph),
        explicit => ModeDecision {
            mode: explicit,
            estimated_speedup: graph.map_or(1.0, KeywordModeStrategy::graph_speedup),
            reason: format!("{} requested", explicit),
        },
    }
}
