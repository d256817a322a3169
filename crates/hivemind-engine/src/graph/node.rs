use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hivemind_core::config::NodeSpec;

/// One unit of work in the execution graph, run by a single agent
/// (plus whatever handoff chain that agent starts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Unique identifier for this node.
    pub id: String,
    /// Registered agent that runs this node.
    pub agent: String,
    pub task: String,
    /// Node ids that must complete first.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// A failure here aborts the whole execution.
    #[serde(default)]
    pub critical: bool,
    /// Overrides the engine's per-node budget.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, agent: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            task: task.into(),
            dependencies: BTreeSet::new(),
            critical: false,
            timeout: None,
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Combine the outputs of this node's dependencies into the text handed
    /// to its agent as `parent_result`.
    ///
    /// A single dependency passes through unchanged; several are labelled
    /// with the node they came from.
    pub fn parent_result(&self, outputs: &HashMap<String, String>) -> Option<String> {
        let available: Vec<(&String, &String)> = self
            .dependencies
            .iter()
            .filter_map(|dep| outputs.get(dep).map(|out| (dep, out)))
            .collect();

        match available.as_slice() {
            [] => None,
            [(_, only)] => Some((*only).clone()),
            many => Some(
                many.iter()
                    .map(|(dep, out)| format!("## From {}\n\n{}", dep, out))
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
        }
    }
}

impl From<&NodeSpec> for GraphNode {
    fn from(spec: &NodeSpec) -> Self {
        let mut node = GraphNode::new(&spec.id, &spec.agent, &spec.task)
            .depends_on(spec.depends_on.iter().cloned());
        node.critical = spec.critical;
        node.timeout = spec.timeout_secs.map(Duration::from_secs);
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builder() {
        let node = GraphNode::new("n1", "researcher", "Find sources")
            .depends_on(["a", "b"])
            .critical()
            .with_timeout(Duration::from_secs(5));

        assert_eq!(node.agent, "researcher");
        assert_eq!(node.dependencies.len(), 2);
        assert!(node.critical);
        assert_eq!(node.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parent_result_single_dependency() {
        let node = GraphNode::new("w", "writer", "Write").depends_on(["r"]);
        let mut outputs = HashMap::new();
        outputs.insert("r".to_string(), "findings".to_string());
        assert_eq!(node.parent_result(&outputs).as_deref(), Some("findings"));
    }

    #[test]
    fn test_parent_result_many_dependencies() {
        let node = GraphNode::new("s", "synth", "Merge").depends_on(["x", "y"]);
        let mut outputs = HashMap::new();
        outputs.insert("x".to_string(), "one".to_string());
        outputs.insert("y".to_string(), "two".to_string());

        let merged = node.parent_result(&outputs).unwrap();
        assert!(merged.contains("## From x\n\none"));
        assert!(merged.contains("## From y\n\ntwo"));
        assert!(merged.find("From x") < merged.find("From y"));
    }

    #[test]
    fn test_parent_result_root_node() {
        let node = GraphNode::new("root", "a", "Start");
        assert_eq!(node.parent_result(&HashMap::new()), None);
    }

    #[test]
    fn test_from_node_spec() {
        let spec: NodeSpec = toml::from_str(
            r#"
id = "review"
agent = "reviewer"
task = "Review the draft"
depends_on = ["draft"]
critical = true
timeout_secs = 90
"#,
        )
        .unwrap();
        let node = GraphNode::from(&spec);
        assert!(node.dependencies.contains("draft"));
        assert!(node.critical);
        assert_eq!(node.timeout, Some(Duration::from_secs(90)));
    }
}
