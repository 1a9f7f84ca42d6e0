pub mod gate;
pub mod incident;
pub mod notifier;
pub mod snapshot;

pub use gate::*;
pub use incident::*;
pub use notifier::*;
pub use snapshot::*;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginStatus {
    Active,
    Banned,
}

/// Per-origin state. Created on first observation and never removed.
#[derive(Debug, Clone)]
pub struct ReputationRecord {
    pub status: OriginStatus,
    pub incident_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// When the current ban started; `None` while active.
    pub banned_at: Option<DateTime<Utc>>,
}

impl ReputationRecord {
    fn active(now: DateTime<Utc>) -> Self {
        Self {
            status: OriginStatus::Active,
            incident_count: 0,
            first_seen: now,
            last_seen: now,
            banned_at: None,
        }
    }

    fn banned(now: DateTime<Utc>) -> Self {
        Self {
            status: OriginStatus::Banned,
            banned_at: Some(now),
            ..Self::active(now)
        }
    }
}

/// Answer to "may this origin send a request at all".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Reject,
}

/// Answer after a payload from an origin has been classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Ban,
}
