use std::collections::BTreeSet;

use tracing::{debug, warn};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::types::{AgentRole, Request, WorkflowType};

/// Context key that names the workflow outright.
pub const WORKFLOW_CONTEXT_KEY: &str = "workflow";

const KEYWORD_SCORE: u32 = 10;
const HINT_SCORE: u32 = 5;
const DEFAULT_THRESHOLD: u32 = 10;

/// An optional role pulled in when the request mentions one of its triggers.
#[derive(Debug, Clone)]
pub struct SecondaryRole {
    pub role: AgentRole,
    pub triggers: Vec<String>,
}

/// How requests are matched to one workflow and which roles it uses.
#[derive(Debug, Clone)]
pub struct WorkflowPattern {
    pub workflow: WorkflowType,
    /// Single words match whole words; phrases match as substrings.
    pub keywords: Vec<String>,
    /// Context keys that suggest this workflow.
    pub context_hints: Vec<String>,
    pub primary_roles: Vec<AgentRole>,
    pub secondary_roles: Vec<SecondaryRole>,
}

impl WorkflowPattern {
    pub fn new(workflow: WorkflowType, primary: &[&str]) -> Self {
        Self {
            workflow,
            keywords: vec![],
            context_hints: vec![],
            primary_roles: primary.iter().map(|r| AgentRole::from(*r)).collect(),
            secondary_roles: vec![],
        }
    }

    pub fn keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn hints(mut self, hints: &[&str]) -> Self {
        self.context_hints = hints.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn secondary(mut self, role: &str, triggers: &[&str]) -> Self {
        self.secondary_roles.push(SecondaryRole {
            role: AgentRole::from(role),
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
        });
        self
    }

    fn score(&self, text: &NormalizedText, request: &Request) -> u32 {
        let keyword_hits = self.keywords.iter().filter(|k| text.mentions(k)).count() as u32;
        let hint_hits = self
            .context_hints
            .iter()
            .filter(|h| request.context.contains_key(h.as_str()))
            .count() as u32;
        keyword_hits * KEYWORD_SCORE + hint_hits * HINT_SCORE
    }

    fn roles(&self, text: &NormalizedText) -> Vec<AgentRole> {
        let mut roles = self.primary_roles.clone();
        for secondary in &self.secondary_roles {
            if secondary.triggers.iter().any(|t| text.mentions(t)) && !roles.contains(&secondary.role) {
                roles.push(secondary.role.clone());
            }
        }
        roles
    }
}

/// Lowercased request text with a word index.
struct NormalizedText {
    lower: String,
    words: BTreeSet<String>,
}

impl NormalizedText {
    fn new(text: &str) -> Self {
        let lower = text.to_lowercase();
        let words = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '\''))
            .filter(|w| !w.is_empty())
            .map(|w| w.to_string())
            .collect();
        Self { lower, words }
    }

    fn mentions(&self, keyword: &str) -> bool {
        let keyword = keyword.to_lowercase();
        if keyword.contains(' ') {
            self.lower.contains(&keyword)
        } else {
            self.words.contains(&keyword)
        }
    }
}

/// Result of classifying a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub workflow: WorkflowType,
    pub roles: Vec<AgentRole>,
    /// 0-100 estimate used for logging only.
    pub complexity: u32,
    pub score: u32,
}

impl Classification {
    /// The general workflow, used when nothing matches strongly enough.
    pub fn fallback(complexity: u32) -> Self {
        Self {
            workflow: WorkflowType::General,
            roles: vec![AgentRole::from("general")],
            complexity,
            score: 0,
        }
    }
}

/// Picks a workflow and agent roles for a request by keyword and context
/// matching. Stateless.
pub struct WorkflowClassifier {
    patterns: Vec<WorkflowPattern>,
    threshold: u32,
}

impl WorkflowClassifier {
    pub fn new(patterns: Vec<WorkflowPattern>) -> Self {
        Self {
            patterns,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    /// Minimum score for a match to count.
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_defaults() -> Self {
        Self::new(default_patterns())
    }

    pub fn pattern(&self, workflow: WorkflowType) -> Option<&WorkflowPattern> {
        self.patterns.iter().find(|p| p.workflow == workflow)
    }

    /// Classify a request.
    ///
    /// A `workflow` context entry naming a known workflow decides outright.
    /// Otherwise the best keyword/hint score wins; a score under the threshold
    /// or a tie at the top is `ClassificationAmbiguous`.
    pub fn classify(&self, request: &Request) -> Result<Classification> {
        let text = NormalizedText::new(&request.query);
        let complexity = complexity_score(request);

        if let Some(explicit) = request.context.get(WORKFLOW_CONTEXT_KEY) {
            match explicit.parse::<WorkflowType>() {
                Ok(workflow) => {
                    let roles = self.roles_for_text(workflow, &text);
                    debug!(workflow = %workflow, "Workflow set by request context");
                    return Ok(Classification {
                        workflow,
                        roles,
                        complexity,
                        score: u32::MAX,
                    });
                }
                Err(e) => warn!(error = %e, "Ignoring workflow context entry"),
            }
        }

        let mut scored: Vec<(u32, &WorkflowPattern)> = self
            .patterns
            .iter()
            .map(|p| (p.score(&text, request), p))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let best_score = scored.first().map(|(s, _)| *s).unwrap_or(0);
        let runner_up = scored.get(1).map(|(s, _)| *s).unwrap_or(0);
        if best_score < self.threshold || best_score == runner_up {
            return Err(WaypointError::ClassificationAmbiguous { best_score });
        }

        let pattern = scored[0].1;
        Ok(Classification {
            workflow: pattern.workflow,
            roles: pattern.roles(&text),
            complexity,
            score: best_score,
        })
    }

    /// Classify, falling back to the general workflow when ambiguous.
    pub fn classify_or_fallback(&self, request: &Request) -> Classification {
        match self.classify(request) {
            Ok(c) => {
                debug!(
                    workflow = %c.workflow,
                    roles = ?c.roles,
                    complexity = c.complexity,
                    score = c.score,
                    "Request classified"
                );
                c
            }
            Err(e) => {
                let fallback = Classification::fallback(complexity_score(request));
                debug!(error = %e, complexity = fallback.complexity, "Falling back to general workflow");
                fallback
            }
        }
    }

    /// Roles a workflow would use for this request text.
    pub fn roles_for(&self, workflow: WorkflowType, query: &str) -> Vec<AgentRole> {
        self.roles_for_text(workflow, &NormalizedText::new(query))
    }

    fn roles_for_text(&self, workflow: WorkflowType, text: &NormalizedText) -> Vec<AgentRole> {
        match self.pattern(workflow) {
            Some(p) => p.roles(text),
            None => Classification::fallback(0).roles,
        }
    }
}

impl Default for WorkflowClassifier {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Rough 0-100 estimate from length, clause count and context size.
pub fn complexity_score(request: &Request) -> u32 {
    let words = request.query.split_whitespace().count() as u32;
    let lower = request.query.to_lowercase();
    let clauses = request.query.matches([',', ';', '?']).count() as u32
        + lower.matches(" and ").count() as u32
        + lower.matches(" then ").count() as u32;
    let context = request.context.len() as u32;

    let score = (words / 2).min(50) + (clauses * 5).min(30) + (context * 4).min(20);
    score.min(100)
}

pub fn default_patterns() -> Vec<WorkflowPattern> {
    vec![
        WorkflowPattern::new(WorkflowType::General, &["general"]),
        WorkflowPattern::new(WorkflowType::UserQuery, &["knowledge"])
            .keywords(&["what", "how", "why", "explain", "question", "where", "when", "which"])
            .hints(&["topic"])
            .secondary("research", &["research", "compare", "sources", "latest", "in depth"]),
        WorkflowPattern::new(WorkflowType::PlatformChange, &["platform-analyst", "change-planner"])
            .keywords(&[
                "deploy",
                "migrate",
                "migration",
                "upgrade",
                "rollback",
                "schema",
                "release",
                "infrastructure",
                "feature flag",
            ])
            .hints(&["repository", "environment"])
            .secondary(
                "security-review",
                &["auth", "permission", "permissions", "secret", "credential", "security", "production"],
            ),
        WorkflowPattern::new(WorkflowType::ComplianceSensitive, &["essay-guidance"])
            .keywords(&[
                "essay",
                "application",
                "personal statement",
                "admission",
                "admissions",
                "scholarship",
                "cover letter",
                "submission",
            ])
            .hints(&["institution", "program"])
            .secondary(
                "policy-review",
                &["policy", "rule", "rules", "guideline", "guidelines", "eligibility", "requirements"],
            ),
        WorkflowPattern::new(WorkflowType::DataCollection, &["data-collector"])
            .keywords(&["collect", "gather", "survey", "export", "dataset", "scrape", "report", "metrics"])
            .hints(&["source", "format"])
            .secondary("data-validator", &["validate", "verify", "accuracy", "duplicates", "clean"]),
        WorkflowPattern::new(WorkflowType::Maintenance, &["maintenance"])
            .keywords(&[
                "cleanup",
                "clean up",
                "rotate",
                "backup",
                "restore",
                "vacuum",
                "prune",
                "maintenance",
                "reindex",
            ])
            .hints(&["service", "schedule"]),
    ]
}
