use super::obfuscation::ObfuscationHeuristic;
use super::rules::{
    default_rules, validate_rules, ClassificationRule, OBFUSCATION_RULE, OVERSIZED_INPUT_RULE,
};
use crate::config::ClassifierConfig;
use crate::error::GateError;

/// Default scan cap: the 10 KB body limit the gate was designed around.
pub const DEFAULT_MAX_INPUT_LENGTH: usize = 10 * 1024;

/// Default excerpt length, in chars.
pub const DEFAULT_EXCERPT_LENGTH: usize = 200;

/// Outcome of classifying one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Suspicious { rule_id: String, excerpt: String },
}

impl Verdict {
    pub fn is_suspicious(&self) -> bool {
        matches!(self, Verdict::Suspicious { .. })
    }

    pub fn rule_id(&self) -> Option<&str> {
        match self {
            Verdict::Clean => None,
            Verdict::Suspicious { rule_id, .. } => Some(rule_id),
        }
    }
}

/// Stateless payload classifier.
///
/// Rules are evaluated in declaration order and the first match wins. Inputs
/// longer than `max_input_length` bytes are flagged as `oversized-input`
/// without running any pattern, which bounds the scan cost per request.
#[derive(Debug, Clone)]
pub struct ContentClassifier {
    rules: Vec<ClassificationRule>,
    max_input_length: usize,
    excerpt_length: usize,
    obfuscation: Option<ObfuscationHeuristic>,
}

impl ContentClassifier {
    pub fn new(
        rules: Vec<ClassificationRule>,
        max_input_length: usize,
        excerpt_length: usize,
    ) -> Result<Self, GateError> {
        validate_rules(&rules)?;
        Ok(Self {
            rules,
            max_input_length,
            excerpt_length,
            obfuscation: None,
        })
    }

    pub fn with_default_rules() -> Self {
        Self {
            rules: default_rules(),
            max_input_length: DEFAULT_MAX_INPUT_LENGTH,
            excerpt_length: DEFAULT_EXCERPT_LENGTH,
            obfuscation: None,
        }
    }

    /// Build the classifier described by the `classifier` config section.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self, GateError> {
        let mut rules = if config.replace_default_rules {
            Vec::new()
        } else {
            default_rules()
        };

        for custom in &config.custom_rules {
            let rule = if custom.case_insensitive {
                ClassificationRule::new(&custom.id, &custom.pattern)?
            } else {
                ClassificationRule::case_sensitive(&custom.id, &custom.pattern)?
            };
            rules.push(rule);
        }

        let mut classifier = Self::new(rules, config.max_input_length, config.excerpt_length)?;
        if config.obfuscation.enabled {
            classifier = classifier.with_obfuscation_heuristic(ObfuscationHeuristic::new(
                config.obfuscation.threshold,
                config.obfuscation.min_length,
            ));
        }
        Ok(classifier)
    }

    /// Also flag high-entropy text once no pattern has matched.
    pub fn with_obfuscation_heuristic(mut self, heuristic: ObfuscationHeuristic) -> Self {
        self.obfuscation = Some(heuristic);
        self
    }

    pub fn classify(&self, text: &str) -> Verdict {
        if text.len() > self.max_input_length {
            return Verdict::Suspicious {
                rule_id: OVERSIZED_INPUT_RULE.to_string(),
                excerpt: self.excerpt(text),
            };
        }

        for rule in &self.rules {
            if let Some(matched) = rule.find(text) {
                return Verdict::Suspicious {
                    rule_id: rule.id().to_string(),
                    excerpt: self.excerpt(matched),
                };
            }
        }

        if let Some(heuristic) = &self.obfuscation {
            if heuristic.is_obfuscated(text) {
                return Verdict::Suspicious {
                    rule_id: OBFUSCATION_RULE.to_string(),
                    excerpt: self.excerpt(text),
                };
            }
        }

        Verdict::Clean
    }

    fn excerpt(&self, text: &str) -> String {
        text.chars().take(self.excerpt_length).collect()
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn max_input_length(&self) -> usize {
        self.max_input_length
    }

    pub fn excerpt_length(&self) -> usize {
        self.excerpt_length
    }
}

impl Default for ContentClassifier {
    fn default() -> Self {
        Self::with_default_rules()
    }
}
