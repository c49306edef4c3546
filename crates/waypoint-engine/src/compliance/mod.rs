//! Compliance gate: pure rules evaluated against every agent output.
//!
//! Each rule inspects one (input, output, context) triple and yields at most
//! one violation. The engine evaluates a set of rule ids independently and
//! returns the findings sorted by rule id, so evaluation order never changes
//! the outcome and re-evaluating the same triple yields the same set.

pub mod rules;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use waypoint_core::config::ComplianceConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::state::{ComplianceViolation, Severity};
use waypoint_core::types::{AgentRole, WorkflowType};

pub use rules::{ContentGenerationRule, DisclosureRule, LengthLimitRule, ProtectedResourceRule};

/// Everything a rule may look at besides the input and output text.
#[derive(Debug, Clone)]
pub struct RuleContext<'a> {
    pub workflow: WorkflowType,
    /// Request context entries (e.g. a per-request `word_limit`).
    pub request_context: &'a BTreeMap<String, String>,
    /// Role whose output is being checked.
    pub role: Option<&'a AgentRole>,
    /// Stamped onto every violation so evaluation stays deterministic.
    pub evaluated_at: DateTime<Utc>,
}

impl<'a> RuleContext<'a> {
    pub fn new(workflow: WorkflowType, request_context: &'a BTreeMap<String, String>) -> Self {
        Self {
            workflow,
            request_context,
            role: None,
            evaluated_at: Utc::now(),
        }
    }

    pub fn with_role(mut self, role: &'a AgentRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn at(mut self, evaluated_at: DateTime<Utc>) -> Self {
        self.evaluated_at = evaluated_at;
        self
    }

    /// Build a violation stamped with this context's time and role.
    pub fn violation(
        &self,
        rule_id: &str,
        severity: Severity,
        span: impl Into<String>,
    ) -> ComplianceViolation {
        let v = ComplianceViolation::new(rule_id, severity, span, self.evaluated_at);
        match self.role {
            Some(role) => v.with_role(role.clone()),
            None => v,
        }
    }
}

/// A single compliance predicate.
pub trait ComplianceRule: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Return a violation if `output` breaks the rule. Must be pure.
    fn evaluate(
        &self,
        input: &str,
        output: &str,
        ctx: &RuleContext<'_>,
    ) -> Option<ComplianceViolation>;
}

/// What the gate does with an output given its violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    /// Keep the output, raise the human-review flag.
    Flag,
    /// Discard the output and answer with the safe fallback.
    Block,
}

impl GateVerdict {
    pub fn from_violations(violations: &[ComplianceViolation]) -> Self {
        match violations.iter().map(|v| v.severity).max() {
            Some(Severity::Critical) => Self::Block,
            Some(Severity::Warning) => Self::Flag,
            _ => Self::Pass,
        }
    }
}

/// Registry of rules plus the per-workflow rule sets.
pub struct ComplianceEngine {
    rules: BTreeMap<String, Box<dyn ComplianceRule>>,
}

impl ComplianceEngine {
    pub fn new() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Engine with the four built-in rules configured from `config`.
    pub fn with_builtins(config: &ComplianceConfig) -> Self {
        let mut engine = Self::new();
        engine.register(ContentGenerationRule::new(config.min_prose_words));
        engine.register(LengthLimitRule::new(config.word_limit));
        engine.register(DisclosureRule::new(
            &config.disclosure_text,
            config.disclosure_required_for.clone(),
        ));
        engine.register(ProtectedResourceRule::new(&config.protected_resources));
        engine
    }

    pub fn register(&mut self, rule: impl ComplianceRule) {
        self.rules.insert(rule.id().to_string(), Box::new(rule));
    }

    pub fn rule_ids(&self) -> Vec<&str> {
        self.rules.keys().map(|s| s.as_str()).collect()
    }

    /// Rule ids applied to outputs of a workflow.
    pub fn rules_for(&self, workflow: WorkflowType) -> Vec<String> {
        let ids: &[&str] = match workflow {
            WorkflowType::ComplianceSensitive => &[
                rules::CONTENT_GENERATION,
                rules::DISCLOSURE,
                rules::LENGTH_LIMIT,
                rules::PROTECTED_RESOURCE,
            ],
            _ => &[rules::DISCLOSURE, rules::PROTECTED_RESOURCE],
        };
        ids.iter()
            .filter(|id| self.rules.contains_key(**id))
            .map(|id| id.to_string())
            .collect()
    }

    /// Evaluate the named rules against one output.
    ///
    /// Duplicate ids are evaluated once. Any unknown id fails the whole call
    /// before a rule runs.
    pub fn evaluate<S: AsRef<str>>(
        &self,
        rule_ids: &[S],
        input: &str,
        output: &str,
        ctx: &RuleContext<'_>,
    ) -> Result<Vec<ComplianceViolation>> {
        let ids: BTreeSet<&str> = rule_ids.iter().map(|s| s.as_ref()).collect();

        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            let rule = self
                .rules
                .get(id)
                .ok_or_else(|| WaypointError::UnknownRule(id.to_string()))?;
            selected.push(rule);
        }

        let mut violations: Vec<ComplianceViolation> = selected
            .iter()
            .filter_map(|rule| rule.evaluate(input, output, ctx))
            .collect();
        violations.sort_by(|a, b| {
            a.rule_id
                .cmp(&b.rule_id)
                .then(a.severity.cmp(&b.severity))
                .then(a.span.cmp(&b.span))
        });
        Ok(violations)
    }
}

impl Default for ComplianceEngine {
    fn default() -> Self {
        Self::with_builtins(&ComplianceConfig::default())
    }
}
