use thiserror::Error;

/// Errors raised by the classifier, the reputation gate and its stores.
///
/// Only the rule-set errors are fatal, and only at startup. Everything the
/// gate hits while serving is logged and retried.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("classification rule set is empty")]
    EmptyRuleSet,

    #[error("duplicate classification rule id: {0}")]
    DuplicateRuleId(String),

    #[error("invalid pattern for rule {id}: {source}")]
    InvalidRule {
        id: String,
        #[source]
        source: regex::Error,
    },

    #[error("persistence unavailable ({path}): {source}")]
    PersistenceUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot corrupt ({path}): {reason}")]
    SnapshotCorrupt { path: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("edge ban propagation failed: {0}")]
    Notify(String),
}

impl GateError {
    pub(crate) fn persistence(path: &std::path::Path, source: std::io::Error) -> Self {
        GateError::PersistenceUnavailable {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn corrupt(path: &std::path::Path, reason: impl ToString) -> Self {
        GateError::SnapshotCorrupt {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}
