pub mod classifier;
pub mod compliance;
pub mod graph;
pub mod run_log;
pub mod session;

pub use classifier::{Classification, WorkflowClassifier, WorkflowPattern};
pub use compliance::{ComplianceEngine, ComplianceRule, GateVerdict, RuleContext};
pub use graph::{Dispatch, Edge, EdgeCondition, GraphCoordinator, Node, WorkflowGraph};
pub use run_log::RunLogger;
pub use session::SessionManager;
