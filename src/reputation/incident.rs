use crate::error::GateError;
use chrono::{DateTime, SecondsFormat, Utc};
use log::warn;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

const FIELD_SEPARATOR: &str = " | ";

/// Chain head before the first entry of a log.
pub const GENESIS_ID: &str = "genesis";

/// One detection, written once to the incident log and never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncidentLogEntry {
    pub timestamp: DateTime<Utc>,
    pub origin_id: String,
    pub rule_id: String,
    pub excerpt: String,
    /// SHA-256 over the previous entry id and this entry's fields. Replay
    /// uses it to drop lines written twice by a retried flush.
    pub entry_id: String,
}

impl IncidentLogEntry {
    pub fn new(
        previous_id: &str,
        timestamp: DateTime<Utc>,
        origin_id: &str,
        rule_id: &str,
        excerpt: &str,
    ) -> Self {
        let timestamp = parse_timestamp(&format_timestamp(&timestamp)).unwrap_or(timestamp);
        let entry_id = chain_id(previous_id, &timestamp, origin_id, rule_id, excerpt);
        Self {
            timestamp,
            origin_id: origin_id.to_string(),
            rule_id: rule_id.to_string(),
            excerpt: excerpt.to_string(),
            entry_id,
        }
    }

    /// `timestamp | origin_id | rule_id | entry_id | excerpt`
    pub fn to_line(&self) -> String {
        [
            format_timestamp(&self.timestamp),
            escape_field(&self.origin_id),
            escape_field(&self.rule_id),
            self.entry_id.clone(),
            escape_field(&self.excerpt),
        ]
        .join(FIELD_SEPARATOR)
    }

    pub fn parse_line(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.splitn(5, FIELD_SEPARATOR).collect();
        if fields.len() != 5 {
            return Err(format!("expected 5 fields, found {}", fields.len()));
        }

        let timestamp =
            parse_timestamp(fields[0]).ok_or_else(|| format!("bad timestamp: {}", fields[0]))?;
        let entry_id = fields[3];
        if entry_id.len() != 64 || !entry_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("bad entry id: {}", entry_id));
        }

        Ok(Self {
            timestamp,
            origin_id: unescape_field(fields[1]),
            rule_id: unescape_field(fields[2]),
            entry_id: entry_id.to_string(),
            excerpt: unescape_field(fields[4]),
        })
    }
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn chain_id(
    previous_id: &str,
    timestamp: &DateTime<Utc>,
    origin_id: &str,
    rule_id: &str,
    excerpt: &str,
) -> String {
    let timestamp = format_timestamp(timestamp);
    let mut hasher = Sha256::new();
    for field in [
        previous_id,
        timestamp.as_str(),
        origin_id,
        rule_id,
        excerpt,
    ] {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Escape so a field never contains a newline or the raw separator.
fn escape_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '|' => out.push_str("\\|"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_field(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Result of reading an incident log back.
#[derive(Debug, Default)]
pub struct Replay {
    /// Unique entries in file order.
    pub entries: Vec<IncidentLogEntry>,
    /// Lines that appeared more than once.
    pub duplicates: usize,
    /// Lines that could not be parsed.
    pub malformed: usize,
}

impl Replay {
    /// Id of the last entry, the head new entries chain from.
    pub fn head(&self) -> &str {
        self.entries
            .last()
            .map(|e| e.entry_id.as_str())
            .unwrap_or(GENESIS_ID)
    }
}

/// Append-only incident log file.
#[derive(Debug, Clone)]
pub struct IncidentLog {
    path: PathBuf,
}

impl IncidentLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `entries` and sync them to disk. The handle is closed when
    /// this returns, on success or failure.
    pub async fn append(&self, entries: &[IncidentLogEntry]) -> Result<(), GateError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&entry.to_line());
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| GateError::persistence(&self.path, e))?;

        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| GateError::persistence(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| GateError::persistence(&self.path, e))?;
        file.sync_data()
            .await
            .map_err(|e| GateError::persistence(&self.path, e))?;

        Ok(())
    }

    /// Read every entry back, skipping malformed lines and repeated ids.
    /// A missing file is an empty log.
    pub async fn replay(&self) -> Result<Replay, GateError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(GateError::persistence(&self.path, e)),
        };

        let mut replay = Replay::default();
        let mut seen = HashSet::new();

        // A crash mid-append can tear a multi-byte character, so lines are
        // decoded one at a time.
        for (line_no, raw) in content.split(|b| *b == b'\n').enumerate() {
            let parsed = std::str::from_utf8(raw)
                .map_err(|e| e.to_string())
                .and_then(|line| {
                    let line = line.strip_suffix('\r').unwrap_or(line);
                    if line.trim().is_empty() {
                        Ok(None)
                    } else {
                        IncidentLogEntry::parse_line(line).map(Some)
                    }
                });

            match parsed {
                Ok(None) => {}
                Ok(Some(entry)) => {
                    if seen.insert(entry.entry_id.clone()) {
                        replay.entries.push(entry);
                    } else {
                        replay.duplicates += 1;
                    }
                }
                Err(reason) => {
                    warn!(
                        "Skipping malformed incident log line {} in {}: {}",
                        line_no + 1,
                        self.path.display(),
                        reason
                    );
                    replay.malformed += 1;
                }
            }
        }

        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(previous: &str, excerpt: &str) -> IncidentLogEntry {
        IncidentLogEntry::new(previous, Utc::now(), "1.2.3.4", "eval-call", excerpt)
    }

    #[test]
    fn test_line_round_trip_with_hostile_excerpt() {
        let original = entry(GENESIS_ID, "a | b\nc\\d\r|");
        let line = original.to_line();
        assert!(!line.contains('\n'));
        assert_eq!(line.matches(FIELD_SEPARATOR).count(), 4);

        let parsed = IncidentLogEntry::parse_line(&line).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_chain_ids_differ() {
        let first = entry(GENESIS_ID, "eval(1)");
        let second = entry(&first.entry_id, "eval(1)");
        assert_ne!(first.entry_id, second.entry_id);
        assert_eq!(first.entry_id.len(), 64);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(IncidentLogEntry::parse_line("not a log line").is_err());
        assert!(IncidentLogEntry::parse_line("yesterday | a | b | c | d").is_err());
    }

    #[tokio::test]
    async fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let log = IncidentLog::new(dir.path().join("incidents.log"));

        let first = entry(GENESIS_ID, "<script>");
        let second = entry(&first.entry_id, "eval(");
        log.append(&[first.clone()]).await.unwrap();
        log.append(&[second.clone()]).await.unwrap();

        let replay = log.replay().await.unwrap();
        assert_eq!(replay.entries, vec![first, second.clone()]);
        assert_eq!(replay.head(), second.entry_id);
    }

    #[tokio::test]
    async fn test_replay_drops_duplicates_and_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.log");
        let log = IncidentLog::new(&path);

        let first = entry(GENESIS_ID, "<script>");
        log.append(&[first.clone()]).await.unwrap();
        log.append(&[first.clone()]).await.unwrap();
        tokio::fs::write(
            &path,
            format!(
                "{}garbage line\n",
                tokio::fs::read_to_string(&path).await.unwrap()
            ),
        )
        .await
        .unwrap();

        let replay = log.replay().await.unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.duplicates, 1);
        assert_eq!(replay.malformed, 1);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.log");
        let log = IncidentLog::new(&path);

        let first = entry(GENESIS_ID, "<script>");
        let second = entry(&first.entry_id, "eval(");
        log.append(&[first.clone()]).await.unwrap();

        let mut content = tokio::fs::read(&path).await.unwrap();
        content.extend_from_slice(b"torn \xe2\x82\n");
        tokio::fs::write(&path, content).await.unwrap();
        log.append(&[second.clone()]).await.unwrap();

        let replay = log.replay().await.unwrap();
        assert_eq!(replay.entries, vec![first, second]);
        assert_eq!(replay.malformed, 1);
    }

    #[tokio::test]
    async fn test_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = IncidentLog::new(dir.path().join("nope.log"));
        let replay = log.replay().await.unwrap();
        assert!(replay.entries.is_empty());
        assert_eq!(replay.head(), GENESIS_ID);
    }
}
