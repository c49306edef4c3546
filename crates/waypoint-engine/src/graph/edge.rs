use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use waypoint_core::state::RunState;

/// An edge connecting two nodes in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Source node name.
    pub from: String,
    /// Target node name.
    pub to: String,
    /// Condition that must be true to traverse this edge.
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Every call of the source node succeeded.
    OnSuccess,
    /// At least one call of the source node failed.
    OnFailure,
    /// The source node is mandatory and one of its calls failed.
    MandatoryFailed,
    /// The run's human-review flag is set.
    NeedsReview,
    /// A simple expression over the routing context.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Conditional { expr: String },
}

/// What the routing function knows about the step that just ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub succeeded: bool,
    pub mandatory_failed: bool,
    pub needs_review: bool,
}

impl StepOutcome {
    /// Outcome of a step that made no failing calls.
    pub fn ok(needs_review: bool) -> Self {
        Self {
            succeeded: true,
            mandatory_failed: false,
            needs_review,
        }
    }
}

impl Edge {
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_condition(from, to, EdgeCondition::Always)
    }

    pub fn on_success(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_condition(from, to, EdgeCondition::OnSuccess)
    }

    pub fn on_failure(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_condition(from, to, EdgeCondition::OnFailure)
    }

    pub fn mandatory_failed(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_condition(from, to, EdgeCondition::MandatoryFailed)
    }

    pub fn needs_review(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::with_condition(from, to, EdgeCondition::NeedsReview)
    }

    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self::with_condition(from, to, EdgeCondition::Conditional { expr: expr.into() })
    }

    fn with_condition(from: impl Into<String>, to: impl Into<String>, condition: EdgeCondition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition,
        }
    }

    pub fn matches(&self, outcome: &StepOutcome, context: &HashMap<String, serde_json::Value>) -> bool {
        match &self.condition {
            EdgeCondition::Always => true,
            EdgeCondition::OnSuccess => outcome.succeeded,
            EdgeCondition::OnFailure => !outcome.succeeded,
            EdgeCondition::MandatoryFailed => outcome.mandatory_failed,
            EdgeCondition::NeedsReview => outcome.needs_review,
            EdgeCondition::Conditional { expr } => evaluate_condition(expr, context),
        }
    }
}

/// Values visible to conditional edges after a step.
///
/// `workflow`, `roles` (comma separated), `status` and `<node>_status`
/// (`success` / `failure`), `human_review` (`true` / `false`), and every
/// request context entry as `ctx.<key>`.
pub fn routing_context(
    state: &RunState,
    node: &str,
    outcome: &StepOutcome,
) -> HashMap<String, serde_json::Value> {
    let status = if outcome.succeeded { "success" } else { "failure" };
    let roles: Vec<&str> = state.roles.iter().map(|r| r.as_str()).collect();

    let mut ctx = HashMap::new();
    ctx.insert("workflow".to_string(), serde_json::json!(state.workflow.as_str()));
    ctx.insert("roles".to_string(), serde_json::json!(roles.join(",")));
    ctx.insert("status".to_string(), serde_json::json!(status));
    ctx.insert(format!("{}_status", node), serde_json::json!(status));
    ctx.insert(
        "human_review".to_string(),
        serde_json::json!(if state.human_review { "true" } else { "false" }),
    );
    for (k, v) in &state.context {
        ctx.insert(format!("ctx.{}", k), serde_json::json!(v));
    }
    ctx
}

/// Evaluate a simple conditional expression against context data.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
///
/// Returns `false` for unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();

    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return context
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.contains(substr));
    }

    if let Some((key, value)) = parse_operator(expr, "!=") {
        return context
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s != value);
    }

    if let Some((key, value)) = parse_operator(expr, "==") {
        return context
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s == value);
    }

    false
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    Some((key.trim(), val.trim().trim_matches('"')))
}
