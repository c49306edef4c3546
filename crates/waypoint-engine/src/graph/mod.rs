//! Workflow graphs and the coordinator that walks them.
//!
//! Every workflow is a table of `Node`s connected by `Edge`s. A run starts at
//! `classify`, executes worker nodes (agent calls through the gateway, then
//! the compliance gate, then a checkpoint) and ends at `finalize` or
//! `suspend-for-review`. The first matching outgoing edge picks the next node.

pub mod coordinator;
pub mod edge;
pub mod node;
pub mod workflow;

pub use coordinator::GraphCoordinator;
pub use edge::{evaluate_condition, Edge, EdgeCondition, StepOutcome};
pub use node::{Dispatch, Node};
pub use workflow::WorkflowGraph;
