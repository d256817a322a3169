use std::collections::{BTreeSet, HashMap, HashSet};

use hivemind_core::config::GraphSpec;
use hivemind_core::error::{HivemindError, Result};

use super::node::GraphNode;

/// A validated, acyclic set of nodes.
///
/// Construction rejects duplicate ids, dependencies on unknown nodes, and
/// cycles (reporting the offending path). Node order is the order given,
/// which also orders nodes inside a level.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
}

impl ExecutionGraph {
    pub fn new(nodes: Vec<GraphNode>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(HivemindError::DuplicateNode(node.id.clone()));
            }
        }
        for node in &nodes {
            if let Some(dep) = node.dependencies.iter().find(|d| !index.contains_key(*d)) {
                return Err(HivemindError::UnknownDependency {
                    node: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let graph = Self { nodes, index };
        if let Some(cycle) = graph.find_cycle() {
            return Err(HivemindError::GraphCycle { cycle });
        }
        Ok(graph)
    }

    pub fn from_spec(spec: &GraphSpec) -> Result<Self> {
        Self::new(spec.nodes.iter().map(GraphNode::from).collect())
    }

    pub fn get(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Partition into levels: every node's dependencies sit in earlier levels.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut remaining: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.dependencies.len()))
            .collect();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<String> = self
                .nodes
                .iter()
                .filter(|n| remaining.get(n.id.as_str()) == Some(&0))
                .map(|n| n.id.clone())
                .collect();
            if ready.is_empty() {
                // Unreachable for a graph that passed construction.
                break;
            }
            for id in &ready {
                remaining.remove(id.as_str());
                for dependent in self.dependents(id) {
                    if let Some(count) = remaining.get_mut(dependent) {
                        *count -= 1;
                    }
                }
            }
            levels.push(ready);
        }
        levels
    }

    /// Topological order, level by level.
    pub fn execution_order(&self) -> Vec<String> {
        self.levels().into_iter().flatten().collect()
    }

    /// Nodes that directly depend on `id`.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies.contains(id))
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Every node reachable downstream of `id`.
    pub fn downstream(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent.to_string()) {
                    stack.push(dependent);
                }
            }
        }
        seen
    }

    /// Nodes nothing depends on; their outputs form the execution result.
    pub fn terminals(&self) -> Vec<&str> {
        let depended: HashSet<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.dependencies.iter().map(String::as_str))
            .collect();
        self.nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| !depended.contains(id))
            .collect()
    }

    /// Depth-first search over dependency edges. Returns the first cycle
    /// found as a path that starts and ends on the same node.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit(
            graph: &ExecutionGraph,
            i: usize,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[i] = Mark::InProgress;
            path.push(i);
            for dep in &graph.nodes[i].dependencies {
                let j = graph.index[dep];
                match marks[j] {
                    Mark::InProgress => {
                        let start = path.iter().position(|&p| p == j).unwrap_or(0);
                        let mut cycle: Vec<String> = path[start..]
                            .iter()
                            .map(|&p| graph.nodes[p].id.clone())
                            .collect();
                        cycle.push(graph.nodes[j].id.clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, j, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[i] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path = Vec::new();
        for i in 0..self.nodes.len() {
            if marks[i] == Mark::Unvisited {
                if let Some(cycle) = visit(self, i, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}
