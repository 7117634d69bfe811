//! Immutable Audit Log
//!
//! Append-only, line-delimited JSON log of merge request transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::engine::merge::model::{MergeRequest, MergeRequestId, UserId};

/// Current audit log format version
pub const AUDIT_VERSION: u32 = 1;

/// Audit action types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Accepted,
    Finalized,
    FinalizationFailed,
    Cancelled,
}

/// A single audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Format version for compatibility
    pub version: u32,

    pub timestamp: DateTime<Utc>,

    pub action: AuditAction,

    pub merge_request_id: MergeRequestId,

    /// User that triggered the transition
    pub actor: Option<UserId>,

    /// Record as stored after the transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<MergeRequest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, merge_request_id: MergeRequestId) -> Self {
        Self {
            version: AUDIT_VERSION,
            timestamp: Utc::now(),
            action,
            merge_request_id,
            actor: None,
            record: None,
            detail: None,
        }
    }

    pub fn with_actor(mut self, actor: UserId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_record(mut self, record: &MergeRequest) -> Self {
        self.record = Some(record.clone());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The audit log manager
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Audit log at `<dir>/audit.jsonl`, creating the directory
    pub fn new(dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            log_path: dir.join("audit.jsonl"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Append an entry to the audit log
    pub fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;

        let mut line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');

        // One write per line keeps concurrent appends from interleaving
        file.write_all(line.as_bytes())
    }

    /// Query all entries
    pub fn query_all(&self) -> std::io::Result<Vec<AuditEntry>> {
        if !self.log_path.exists() {
            return Ok(vec![]);
        }

        let file = fs::File::open(&self.log_path)?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let entry: AuditEntry = serde_json::from_str(&line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

            // Version compatibility - older entries are readable
            if entry.version <= AUDIT_VERSION {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Entries for one merge request, oldest first
    pub fn query_by_request(&self, id: MergeRequestId) -> std::io::Result<Vec<AuditEntry>> {
        Ok(self
            .query_all()?
            .into_iter()
            .filter(|e| e.merge_request_id == id)
            .collect())
    }

    pub fn count(&self) -> std::io::Result<usize> {
        Ok(self.query_all()?.len())
    }
}
