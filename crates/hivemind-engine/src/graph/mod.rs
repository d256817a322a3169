//! Execution graph: the DAG of agent nodes for one task.
//!
//! Each `GraphNode` names the agent that runs it and the nodes it depends
//! on. `ExecutionGraph` validates the node set at construction and splits
//! it into levels; every node in a level can run concurrently once the
//! previous level has resolved.

pub mod dag;
pub mod node;

pub use dag::ExecutionGraph;
pub use node::GraphNode;
