use super::incident::{IncidentLog, IncidentLogEntry, GENESIS_ID};
use super::snapshot::{BanSnapshot, SnapshotStore};
use super::{Admission, Decision, OriginStatus, ReputationRecord};
use crate::config::ReputationConfig;
use crate::error::GateError;
use crate::waf::Verdict;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Unflushed incidents kept in memory while the store is unreachable.
/// Past this the oldest are dropped.
pub const MAX_PENDING_INCIDENTS: usize = 10_000;

/// Durable backing of a gate: ban snapshot plus incident log.
#[derive(Debug, Clone)]
pub struct GateStore {
    pub snapshots: SnapshotStore,
    pub incidents: IncidentLog,
}

impl GateStore {
    pub fn new(snapshot_path: impl Into<PathBuf>, incident_log_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshots: SnapshotStore::new(snapshot_path),
            incidents: IncidentLog::new(incident_log_path),
        }
    }
}

/// What `load_snapshot` found on disk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub restored_bans: usize,
    pub replayed_incidents: usize,
    pub duplicate_incidents: usize,
    pub malformed_lines: usize,
    pub snapshot_corrupt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    pub tracked_origins: usize,
    pub banned_origins: usize,
    pub pending_incidents: usize,
}

struct Journal {
    pending: VecDeque<IncidentLogEntry>,
    head: String,
}

impl Journal {
    fn record(&mut self, now: DateTime<Utc>, origin_id: &str, rule_id: &str, excerpt: &str) {
        let entry = IncidentLogEntry::new(&self.head, now, origin_id, rule_id, excerpt);
        self.head = entry.entry_id.clone();

        if self.pending.len() >= MAX_PENDING_INCIDENTS {
            if let Some(dropped) = self.pending.pop_front() {
                error!(
                    "Incident backlog full, dropping unflushed incident {} for {}",
                    dropped.entry_id, dropped.origin_id
                );
            }
        }
        self.pending.push_back(entry);
    }
}

/// Owns the reputation table and the incident log for every origin.
///
/// All in-memory transitions finish before `observe` returns, so a ban is
/// enforced by the very next `check_admission` on any thread, whether or not
/// `persist` has run yet. Each origin's record is updated under its map
/// shard lock, and the incident is queued while that lock is held, which
/// keeps incidents of one origin in `observe` order.
pub struct ReputationGate {
    records: DashMap<String, ReputationRecord>,
    journal: Mutex<Journal>,
    store: Option<GateStore>,
    flush_lock: tokio::sync::Mutex<()>,
    ban_ttl: Option<chrono::Duration>,
    loaded: AtomicBool,
}

impl ReputationGate {
    /// A gate that never touches disk; `persist` is a no-op.
    pub fn in_memory() -> Self {
        Self::build(None)
    }

    pub fn with_store(store: GateStore) -> Self {
        Self::build(Some(store))
    }

    pub fn from_config(config: &ReputationConfig) -> Self {
        let gate = Self::with_store(GateStore::new(
            &config.snapshot_path,
            &config.incident_log_path,
        ));
        match config.ban_ttl_secs {
            Some(secs) => gate.with_ban_ttl(Duration::from_secs(secs)),
            None => gate,
        }
    }

    fn build(store: Option<GateStore>) -> Self {
        Self {
            records: DashMap::new(),
            journal: Mutex::new(Journal {
                pending: VecDeque::new(),
                head: GENESIS_ID.to_string(),
            }),
            store,
            flush_lock: tokio::sync::Mutex::new(()),
            ban_ttl: None,
            loaded: AtomicBool::new(false),
        }
    }

    /// Let bans lapse after `ttl`. Without this, bans are permanent.
    pub fn with_ban_ttl(mut self, ttl: Duration) -> Self {
        self.ban_ttl = chrono::Duration::from_std(ttl).ok();
        self
    }

    fn ban_is_active(&self, record: &ReputationRecord, now: DateTime<Utc>) -> bool {
        if record.status != OriginStatus::Banned {
            return false;
        }
        match (self.ban_ttl, record.banned_at) {
            (Some(ttl), Some(banned_at)) => now < banned_at + ttl,
            _ => true,
        }
    }

    pub fn check_admission(&self, origin_id: &str) -> Admission {
        self.check_admission_at(origin_id, Utc::now())
    }

    pub fn check_admission_at(&self, origin_id: &str, now: DateTime<Utc>) -> Admission {
        match self.records.get(origin_id) {
            Some(record) if self.ban_is_active(&record, now) => Admission::Reject,
            _ => Admission::Admit,
        }
    }

    pub fn observe(&self, origin_id: &str, verdict: &Verdict) -> Decision {
        self.observe_at(origin_id, verdict, Utc::now())
    }

    pub fn observe_at(&self, origin_id: &str, verdict: &Verdict, now: DateTime<Utc>) -> Decision {
        match verdict {
            Verdict::Clean => match self.records.entry(origin_id.to_string()) {
                Entry::Occupied(mut occupied) => {
                    let record = occupied.get_mut();
                    if record.status == OriginStatus::Banned {
                        if self.ban_is_active(record, now) {
                            return Decision::Ban;
                        }
                        info!("Ban on {} expired", origin_id);
                        record.status = OriginStatus::Active;
                        record.banned_at = None;
                    }
                    record.last_seen = now;
                    Decision::Admit
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(ReputationRecord::active(now));
                    Decision::Admit
                }
            },
            Verdict::Suspicious { rule_id, excerpt } => {
                let mut record = self
                    .records
                    .entry(origin_id.to_string())
                    .or_insert_with(|| ReputationRecord::active(now));

                if !self.ban_is_active(&record, now) {
                    warn!("Banning {} (rule {})", origin_id, rule_id);
                    record.status = OriginStatus::Banned;
                    record.banned_at = Some(now);
                }
                record.incident_count += 1;
                record.last_seen = now;

                self.journal.lock().record(now, origin_id, rule_id, excerpt);
                Decision::Ban
            }
        }
    }

    /// Flush queued incidents to the log, then rewrite the ban snapshot.
    ///
    /// Incidents leave the in-memory queue only once their append has
    /// succeeded; a failed or cancelled flush is retried in full by the next
    /// call. That makes the log at-least-once, and `load_snapshot` drops the
    /// repeats by entry id. Ban state in memory is never touched here.
    pub async fn persist(&self) -> Result<(), GateError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _flush = self.flush_lock.lock().await;

        let batch: Vec<IncidentLogEntry> = self.journal.lock().pending.iter().cloned().collect();
        if !batch.is_empty() {
            store.incidents.append(&batch).await?;
            // observe() may have queued more (or the backlog cap evicted
            // some) while the append was in flight.
            let written: HashSet<&str> = batch.iter().map(|e| e.entry_id.as_str()).collect();
            self.journal
                .lock()
                .pending
                .retain(|e| !written.contains(e.entry_id.as_str()));
        }

        store
            .snapshots
            .save(&BanSnapshot::new(self.banned_origins()))
            .await
    }

    /// Rebuild the table from the incident log and the ban snapshot.
    ///
    /// Meant to run once before the first request. Never fails: a missing or
    /// corrupt file is logged and skipped, and whatever the other file holds
    /// is still restored.
    ///
    /// The log is replayed first and is authoritative for every origin it
    /// mentions, ban start times included, so a restart never extends a ban
    /// TTL. The snapshot only adds origins with no surviving log entries;
    /// the snapshot carries no per-origin times, so those records get the
    /// snapshot's `last_updated` as first seen, last seen and ban start.
    pub async fn load_snapshot(&self) -> LoadReport {
        let mut report = LoadReport::default();
        let Some(store) = &self.store else {
            return report;
        };
        if self.loaded.swap(true, Ordering::SeqCst) {
            warn!("Reputation state already loaded, ignoring second load");
            return report;
        }

        match store.incidents.replay().await {
            Ok(replay) => {
                for entry in &replay.entries {
                    self.apply_replayed(entry);
                }
                report.replayed_incidents = replay.entries.len();
                report.duplicate_incidents = replay.duplicates;
                report.malformed_lines = replay.malformed;
                self.journal.lock().head = replay.head().to_string();
            }
            Err(e) => warn!("{}; starting without incident history", e),
        }

        match store.snapshots.load().await {
            Ok(Some(snapshot)) => {
                for origin in &snapshot.banned {
                    self.records
                        .entry(origin.clone())
                        .or_insert_with(|| ReputationRecord::banned(snapshot.last_updated));
                }
            }
            Ok(None) => info!(
                "No ban snapshot at {}, starting empty",
                store.snapshots.path().display()
            ),
            Err(e) => {
                report.snapshot_corrupt = matches!(e, GateError::SnapshotCorrupt { .. });
                warn!("{}; starting without ban snapshot", e);
            }
        }

        report.restored_bans = self.banned_origins().len();
        info!(
            "Reputation state loaded: {} banned origins, {} incidents replayed ({} duplicates, {} malformed)",
            report.restored_bans,
            report.replayed_incidents,
            report.duplicate_incidents,
            report.malformed_lines
        );
        report
    }

    /// Re-apply one logged incident the way `observe_at` applied it live.
    fn apply_replayed(&self, entry: &IncidentLogEntry) {
        let mut record = self
            .records
            .entry(entry.origin_id.clone())
            .or_insert_with(|| ReputationRecord::active(entry.timestamp));

        if !self.ban_is_active(&record, entry.timestamp) {
            record.status = OriginStatus::Banned;
            record.banned_at = Some(entry.timestamp);
        }
        record.incident_count += 1;
        record.first_seen = record.first_seen.min(entry.timestamp);
        record.last_seen = record.last_seen.max(entry.timestamp);
    }

    pub fn record(&self, origin_id: &str) -> Option<ReputationRecord> {
        self.records.get(origin_id).map(|r| r.value().clone())
    }

    /// Origins currently banned, sorted.
    pub fn banned_origins(&self) -> Vec<String> {
        let now = Utc::now();
        let mut banned: Vec<String> = self
            .records
            .iter()
            .filter(|r| self.ban_is_active(r.value(), now))
            .map(|r| r.key().clone())
            .collect();
        banned.sort();
        banned
    }

    /// Incidents recorded but not yet flushed to the log.
    pub fn pending_incidents(&self) -> Vec<IncidentLogEntry> {
        self.journal.lock().pending.iter().cloned().collect()
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            tracked_origins: self.records.len(),
            banned_origins: self.banned_origins().len(),
            pending_incidents: self.journal.lock().pending.len(),
        }
    }

    pub fn store(&self) -> Option<&GateStore> {
        self.store.as_ref()
    }
}
