use regex::Regex;
use tracing::warn;

use waypoint_core::state::{ComplianceViolation, Severity};
use waypoint_core::types::WorkflowType;

use super::{ComplianceRule, RuleContext};

pub const CONTENT_GENERATION: &str = "content-generation";
pub const LENGTH_LIMIT: &str = "length-limit";
pub const DISCLOSURE: &str = "disclosure";
pub const PROTECTED_RESOURCE: &str = "protected-resource";

/// Context key overriding the word limit for one request.
pub const WORD_LIMIT_KEY: &str = "word_limit";

const SPAN_CHARS: usize = 120;

/// Advice to write more, ending within a short reach of the word count it
/// points at. Applied to the sentence text before the count.
const ADVICE_PATTERN: &str = r"(?i)\b(?:expand(?:ed|ing|s)?|increas(?:e|ed|es|ing)|extend(?:ed|ing|s)?|lengthen(?:ed|ing|s)?|stretch(?:ed|es|ing)?|aim\s+for|up\s+to|go\s+(?:up\s+)?to|submit(?:ted|ting|s)?|target(?:ing)?|add\s+more)\b[^.!?\n]{0,40}$";

/// A sentence containing any of these is about getting under the limit.
const REDUCTIVE_WORDS: &[&str] = &[
    "trim", "trimmed", "trimming", "cut", "cutting", "reduce", "reduced", "reducing", "shorten",
    "shortened", "shortening", "condense", "condensed", "under", "below", "fewer", "less",
    "within",
];

/// Verbs that instruct someone to modify something.
const INSTRUCTION_VERBS: &[&str] = &[
    "modify", "edit", "change", "delete", "drop", "truncate", "overwrite", "alter", "update",
    "remove", "disable", "rewrite", "purge", "reset",
];

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Invalid compliance regex, rule disabled");
            None
        }
    }
}

fn truncate(s: &str) -> String {
    let s = s.trim();
    match s.char_indices().nth(SPAN_CHARS) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Sentence of `text` containing the byte range `start..end`.
fn enclosing_sentence(text: &str, start: usize, end: usize) -> &str {
    let is_break = |c: char| matches!(c, '.' | '!' | '?' | '\n');
    let from = text[..start]
        .rfind(is_break)
        .map(|i| i + 1)
        .unwrap_or(0);
    let to = text[end..]
        .find(is_break)
        .map(|i| end + i + 1)
        .unwrap_or(text.len());
    text[from..to].trim()
}

/// Text from the start of the sentence holding `start` up to `start`.
fn sentence_before(text: &str, start: usize) -> &str {
    let from = text[..start]
        .rfind(|c: char| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|i| i + 1)
        .unwrap_or(0);
    &text[from..start]
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn has_word(sentence_lower: &str, word: &str) -> bool {
    sentence_lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == word)
}

/// Flags output that hands the requester finished prose to submit verbatim,
/// e.g. "Here is your essay:" followed by paragraphs of text.
pub struct ContentGenerationRule {
    handoff: Option<Regex>,
    min_prose_words: usize,
}

impl ContentGenerationRule {
    pub fn new(min_prose_words: usize) -> Self {
        Self {
            handoff: compile(
                r"(?i)\bhere(?:'s|\s+is)\s+(?:your|the|a)\s+(?:\w+\s+){0,2}?(?:essay|text|statement|draft|letter|response|version|answer)\s*:",
            ),
            min_prose_words,
        }
    }
}

impl ComplianceRule for ContentGenerationRule {
    fn id(&self) -> &str {
        CONTENT_GENERATION
    }

    fn evaluate(&self, _input: &str, output: &str, ctx: &RuleContext<'_>) -> Option<ComplianceViolation> {
        let re = self.handoff.as_ref()?;
        for m in re.find_iter(output) {
            let prose = &output[m.end()..];
            if prose.split_whitespace().count() >= self.min_prose_words {
                return Some(ctx.violation(CONTENT_GENERATION, Severity::Critical, truncate(&output[m.start()..])));
            }
        }
        None
    }
}

/// Flags word counts above the limit.
///
/// Critical when the words just before the count advise writing that much,
/// warning when the count is only mentioned or the sentence is about cutting.
pub struct LengthLimitRule {
    default_limit: u32,
    count: Option<Regex>,
    advice: Option<Regex>,
}

impl LengthLimitRule {
    pub fn new(default_limit: u32) -> Self {
        Self {
            default_limit,
            count: compile(r"(?i)\b(\d{1,3}(?:,\d{3})+|\d{1,7})(?:\s*|-)words?\b"),
            advice: compile(ADVICE_PATTERN),
        }
    }

    fn limit(&self, ctx: &RuleContext<'_>) -> u32 {
        ctx.request_context
            .get(WORD_LIMIT_KEY)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(self.default_limit)
    }

    /// Whether the text leading up to a count recommends writing that much.
    fn advises(&self, lead: &str, sentence: &str) -> bool {
        let Some(advice) = self.advice.as_ref() else {
            return false;
        };
        let lower = sentence.to_lowercase();
        advice.is_match(lead) && !REDUCTIVE_WORDS.iter().any(|w| has_word(&lower, w))
    }
}

impl ComplianceRule for LengthLimitRule {
    fn id(&self) -> &str {
        LENGTH_LIMIT
    }

    fn evaluate(&self, _input: &str, output: &str, ctx: &RuleContext<'_>) -> Option<ComplianceViolation> {
        let re = self.count.as_ref()?;
        let limit = self.limit(ctx);

        let mut mention: Option<ComplianceViolation> = None;
        for caps in re.captures_iter(output) {
            let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let Ok(count) = number.as_str().replace(',', "").parse::<u32>() else {
                continue;
            };
            if count <= limit {
                continue;
            }

            let sentence = enclosing_sentence(output, whole.start(), whole.end());
            let advisory = self.advises(sentence_before(output, number.start()), sentence);
            let span = format!("{} (limit {})", truncate(sentence), limit);
            if advisory {
                return Some(ctx.violation(LENGTH_LIMIT, Severity::Critical, span));
            }
            if mention.is_none() {
                mention = Some(ctx.violation(LENGTH_LIMIT, Severity::Warning, span));
            }
        }
        mention
    }
}

/// Requires a disclosure string in outputs of the listed workflows.
pub struct DisclosureRule {
    text: String,
    required_for: Vec<WorkflowType>,
}

impl DisclosureRule {
    pub fn new(text: &str, required_for: Vec<WorkflowType>) -> Self {
        Self {
            text: text.to_string(),
            required_for,
        }
    }
}

impl ComplianceRule for DisclosureRule {
    fn id(&self) -> &str {
        DISCLOSURE
    }

    fn evaluate(&self, _input: &str, output: &str, ctx: &RuleContext<'_>) -> Option<ComplianceViolation> {
        if self.text.is_empty() || !self.required_for.contains(&ctx.workflow) {
            return None;
        }
        if output.to_lowercase().contains(&self.text.to_lowercase()) {
            return None;
        }
        Some(
            ctx.violation(
                DISCLOSURE,
                Severity::Critical,
                format!("missing disclosure \"{}\"", self.text),
            )
            .with_field("disclosure"),
        )
    }
}

/// Warns when output tells someone to modify a protected resource.
pub struct ProtectedResourceRule {
    resources: Vec<String>,
}

impl ProtectedResourceRule {
    pub fn new(resources: &[String]) -> Self {
        Self {
            resources: resources.iter().map(|r| r.to_lowercase()).collect(),
        }
    }
}

impl ComplianceRule for ProtectedResourceRule {
    fn id(&self) -> &str {
        PROTECTED_RESOURCE
    }

    fn evaluate(&self, _input: &str, output: &str, ctx: &RuleContext<'_>) -> Option<ComplianceViolation> {
        for sentence in sentences(output) {
            let lower = sentence.to_lowercase();
            let Some(resource) = self.resources.iter().find(|r| lower.contains(r.as_str())) else {
                continue;
            };
            if INSTRUCTION_VERBS.iter().any(|v| has_word(&lower, v)) {
                return Some(
                    ctx.violation(PROTECTED_RESOURCE, Severity::Warning, truncate(sentence))
                        .with_field(resource.clone()),
                );
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ctx(map: &BTreeMap<String, String>) -> RuleContext<'_> {
        RuleContext::new(WorkflowType::ComplianceSensitive, map)
    }

    const PROSE: &str = "Ever since I was a child I have taken apart radios and clocks to see how \
        they work, and that curiosity is what led me to apply to your engineering program.";

    #[test]
    fn essay_handoff_with_prose_is_critical() {
        let rule = ContentGenerationRule::new(20);
        let map = BTreeMap::new();
        let output = format!("Sure! Here is your essay: {}", PROSE);
        let v = rule.evaluate("write it", &output, &ctx(&map)).unwrap();
        assert_eq!(v.severity, Severity::Critical);
        assert!(v.span.to_lowercase().starts_with("here is your essay:"));
    }

    #[test]
    fn handoff_variants() {
        let rule = ContentGenerationRule::new(20);
        let map = BTreeMap::new();
        for lead in ["Here's the final draft:", "here is a revised statement:", "HERE IS YOUR TEXT:"] {
            let output = format!("{} {}", lead, PROSE);
            assert!(rule.evaluate("", &output, &ctx(&map)).is_some(), "{}", lead);
        }
    }

    #[test]
    fn short_handoff_is_not_prose() {
        let rule = ContentGenerationRule::new(20);
        let map = BTreeMap::new();
        let output = "Here is your text: too short to submit.";
        assert!(rule.evaluate("", output, &ctx(&map)).is_none());
        assert!(rule.evaluate("", PROSE, &ctx(&map)).is_none());
    }

    #[test]
    fn advising_over_limit_is_critical() {
        let rule = LengthLimitRule::new(200);
        let map = BTreeMap::new();
        let output = "Your draft is focused. You can expand it to 250 words to add detail. This is guidance only.";
        let v = rule.evaluate("", output, &ctx(&map)).unwrap();
        assert_eq!(v.severity, Severity::Critical);
        assert!(v.span.contains("250 words"));
        assert!(v.span.contains("limit 200"));
    }

    #[test]
    fn mentioning_over_limit_is_warning() {
        let rule = LengthLimitRule::new(200);
        let map = BTreeMap::new();
        let output = "Your current draft has 250 words. Trim the second paragraph.";
        let v = rule.evaluate("", output, &ctx(&map)).unwrap();
        assert_eq!(v.severity, Severity::Warning);
    }

    #[test]
    fn under_limit_and_context_override() {
        let rule = LengthLimitRule::new(200);
        let mut map = BTreeMap::new();
        let output = "Aim for 180 words. Submit a 650-word version elsewhere.";
        let v = rule.evaluate("", output, &ctx(&map)).unwrap();
        assert_eq!(v.severity, Severity::Critical);
        assert!(v.span.contains("650-word"));

        map.insert(WORD_LIMIT_KEY.to_string(), "650".to_string());
        assert!(rule.evaluate("", output, &ctx(&map)).is_none());
    }

    #[test]
    fn advice_to_cut_an_over_limit_draft_is_warning() {
        let rule = LengthLimitRule::new(200);
        let map = BTreeMap::new();
        for output in [
            "Your draft is 250 words and should be trimmed to fit the limit.",
            "At 320 words it can be shortened by dropping the anecdote.",
            "Reduce the 250-word draft by cutting the second example.",
            "Keep it below 210 words.",
        ] {
            let v = rule.evaluate("", output, &ctx(&map)).unwrap();
            assert_eq!(v.severity, Severity::Warning, "{}", output);
        }
    }

    #[test]
    fn advice_must_lead_up_to_the_count() {
        let rule = LengthLimitRule::new(200);
        let map = BTreeMap::new();
        let output = "Expanding on your robotics club gives the reader a clear picture of your role, and the 250 words you have now read well.";
        let v = rule.evaluate("", output, &ctx(&map)).unwrap();
        assert_eq!(v.severity, Severity::Warning);

        let v = rule.evaluate("", "Go up to 240 words if you need.", &ctx(&map)).unwrap();
        assert_eq!(v.severity, Severity::Critical);
    }

    #[test]
    fn thousands_separator_is_one_count() {
        let rule = LengthLimitRule::new(200);
        let map = BTreeMap::new();
        let v = rule
            .evaluate("", "Feel free to expand it to 1,000 words.", &ctx(&map))
            .unwrap();
        assert_eq!(v.severity, Severity::Critical);
        assert!(v.span.contains("1,000 words"));

        let v = rule.evaluate("", "The archive holds 12,500 words of notes.", &ctx(&map)).unwrap();
        assert_eq!(v.severity, Severity::Warning);
    }

    #[test]
    fn one_violation_per_output() {
        let rule = LengthLimitRule::new(200);
        let map = BTreeMap::new();
        let output = "It has 300 words. Expand it to 400 words. Or go to 500 words.";
        let v = rule.evaluate("", output, &ctx(&map)).unwrap();
        assert_eq!(v.severity, Severity::Critical);
        assert!(v.span.contains("400 words"));
    }

    #[test]
    fn disclosure_required_only_for_listed_workflows() {
        let rule = DisclosureRule::new("This is guidance only", vec![WorkflowType::ComplianceSensitive]);
        let map = BTreeMap::new();
        let v = rule.evaluate("", "Try a stronger opening.", &ctx(&map)).unwrap();
        assert_eq!(v.severity, Severity::Critical);
        assert_eq!(v.field.as_deref(), Some("disclosure"));

        assert!(rule
            .evaluate("", "Try a stronger opening. this is guidance only.", &ctx(&map))
            .is_none());

        let other = RuleContext::new(WorkflowType::UserQuery, &map);
        assert!(rule.evaluate("", "Try a stronger opening.", &other).is_none());
    }

    #[test]
    fn protected_resource_instruction_is_warning() {
        let rule = ProtectedResourceRule::new(&["billing-ledger".to_string()]);
        let map = BTreeMap::new();
        let v = rule
            .evaluate("", "First back up. Then truncate the billing-ledger table.", &ctx(&map))
            .unwrap();
        assert_eq!(v.severity, Severity::Warning);
        assert_eq!(v.span, "Then truncate the billing-ledger table");
        assert_eq!(v.field.as_deref(), Some("billing-ledger"));
    }

    #[test]
    fn protected_resource_mention_alone_is_fine() {
        let rule = ProtectedResourceRule::new(&["billing-ledger".to_string()]);
        let map = BTreeMap::new();
        assert!(rule
            .evaluate("", "The billing-ledger is read nightly. Change your cron instead.", &ctx(&map))
            .is_none());
    }

    #[test]
    fn enclosing_sentence_bounds() {
        let text = "One. Two has 300 words! Three.";
        let start = text.find("300").unwrap();
        assert_eq!(enclosing_sentence(text, start, start + 3), "Two has 300 words!");
    }
}
