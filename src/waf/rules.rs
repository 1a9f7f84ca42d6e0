use crate::error::GateError;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;

/// Rule id reported when the input is longer than the classifier cap.
pub const OVERSIZED_INPUT_RULE: &str = "oversized-input";

/// Rule id reported by the optional obfuscation heuristic.
pub const OBFUSCATION_RULE: &str = "obfuscation-entropy";

/// Built-in rules in evaluation order. Ids are stable: they end up in the
/// incident log and in metric labels.
const DEFAULT_RULE_SOURCES: &[(&str, &str)] = &[
    // Markup injection
    ("xss-script-tag", r"<\s*script\b"),
    // Dynamic code execution
    ("eval-call", r"\beval\s*\("),
    // Cookie / storage theft
    ("cookie-access", r"document\.cookie|\blocalStorage\b"),
    ("dom-write", r"document\.write"),
    ("alert-call", r"\balert\s*\("),
    ("active-x", r"new\s+ActiveXObject"),
    // Dynamic module loading
    ("dynamic-import", r"\brequire\s*\(|\bimport\s*\("),
    // Process and filesystem access
    ("process-access", r"process\.env|child_process"),
    ("fs-access", r"\bfs\.\w+"),
    // Download-and-run shells
    ("shell-download", r"\b(powershell|curl|wget)\s+-\w"),
    // Exfiltration callbacks
    ("webhook-callback", r"discord(app)?\.com/api/webhooks"),
];

static DEFAULT_RULES: Lazy<Vec<ClassificationRule>> = Lazy::new(|| {
    DEFAULT_RULE_SOURCES
        .iter()
        .map(|(id, pattern)| ClassificationRule::new(id, pattern).unwrap())
        .collect()
});

/// A named pattern matched against untrusted request content.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    id: String,
    pattern: Regex,
}

impl ClassificationRule {
    /// Compile a case-insensitive rule.
    pub fn new(id: &str, pattern: &str) -> Result<Self, GateError> {
        Self::build(id, pattern, true)
    }

    /// Compile a rule that matches case exactly.
    pub fn case_sensitive(id: &str, pattern: &str) -> Result<Self, GateError> {
        Self::build(id, pattern, false)
    }

    fn build(id: &str, pattern: &str, case_insensitive: bool) -> Result<Self, GateError> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|source| GateError::InvalidRule {
                id: id.to_string(),
                source,
            })?;

        Ok(Self {
            id: id.to_string(),
            pattern,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Leftmost match of this rule in `text`.
    pub fn find<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.pattern.find(text).map(|m| m.as_str())
    }
}

/// The built-in rule set, in evaluation order.
pub fn default_rules() -> Vec<ClassificationRule> {
    DEFAULT_RULES.clone()
}

/// Check that a rule set is usable: non-empty, unique ids, and no rule
/// shadowing one of the ids the classifier reports by itself.
pub fn validate_rules(rules: &[ClassificationRule]) -> Result<(), GateError> {
    if rules.is_empty() {
        return Err(GateError::EmptyRuleSet);
    }

    let mut seen = HashSet::new();
    for rule in rules {
        if rule.id == OVERSIZED_INPUT_RULE
            || rule.id == OBFUSCATION_RULE
            || !seen.insert(rule.id.as_str())
        {
            return Err(GateError::DuplicateRuleId(rule.id.clone()));
        }
    }

    Ok(())
}
