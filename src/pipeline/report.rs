//! Run report

use crate::error::{Error, ErrorKind, Result};
use crate::types::{Stage, Status, WorkItem, WorkItemId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Attempts made per stage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempts {
    /// Fetch attempts
    pub fetch: u32,
    /// Process attempts
    pub process: u32,
    /// Upload attempts
    pub upload: u32,
}

/// Terminal error of a failed item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Classification
    pub kind: ErrorKind,
    /// Stage the item was in when it failed
    pub stage: Option<Stage>,
    /// Human-readable message
    pub message: String,
}

/// Final state of one work item, sent by its worker when the item is done
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Item id
    pub id: WorkItemId,
    /// Source URL
    pub url: String,
    /// Destination as given in the manifest
    pub destination: String,
    /// Final status
    pub status: Status,
    /// Remote key of the uploaded artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// Full location of the uploaded artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Terminal error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
    /// Attempts per stage
    pub attempts: StageAttempts,
    /// Wall-clock time spent on the item
    pub duration_ms: u64,
}

impl ItemOutcome {
    /// Outcome for an item that was never dispatched
    pub fn not_started(item: &WorkItem) -> Self {
        Self {
            id: item.id.clone(),
            url: item.source_url.clone(),
            destination: item.destination.clone(),
            status: Status::Pending,
            remote_id: None,
            location: None,
            error: None,
            attempts: StageAttempts::default(),
            duration_ms: 0,
        }
    }

    /// Outcome for an item whose worker died without reporting
    pub(crate) fn lost(item: &WorkItem) -> Self {
        Self {
            status: Status::Failed,
            error: Some(ItemError {
                kind: ErrorKind::Internal,
                stage: None,
                message: "worker exited without reporting".to_string(),
            }),
            ..Self::not_started(item)
        }
    }
}

/// Totals of a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    /// Items in the manifest
    pub total: usize,
    /// Items confirmed at the destination
    pub uploaded: usize,
    /// Items that failed
    pub failed: usize,
    /// Items never dispatched
    pub not_started: usize,
}

/// Report of a whole run, in manifest order
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished
    pub finished_at: DateTime<Utc>,
    /// Whether shutdown was requested during the run
    pub interrupted: bool,
    /// Totals
    pub totals: Totals,
    /// Per-item outcomes
    pub items: Vec<ItemOutcome>,
}

impl RunReport {
    /// Build a report from per-item outcomes
    pub fn new(
        started_at: DateTime<Utc>,
        interrupted: bool,
        items: Vec<ItemOutcome>,
    ) -> Self {
        let mut totals = Totals {
            total: items.len(),
            ..Totals::default()
        };
        for item in &items {
            match item.status {
                Status::Uploaded => totals.uploaded += 1,
                Status::Failed => totals.failed += 1,
                Status::Pending => totals.not_started += 1,
                // a worker always reports a terminal status
                Status::Fetched | Status::Processed => totals.failed += 1,
            }
        }
        Self {
            started_at,
            finished_at: Utc::now(),
            interrupted,
            totals,
            items,
        }
    }

    /// Whether every item was uploaded
    pub fn is_success(&self) -> bool {
        self.totals.uploaded == self.totals.total
    }

    /// Process exit code: 0 when everything was uploaded, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    /// Outcome of one item
    pub fn item(&self, id: &WorkItemId) -> Option<&ItemOutcome> {
        self.items.iter().find(|i| &i.id == id)
    }

    /// Items that did not make it to the destination
    pub fn unsuccessful(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items.iter().filter(|i| i.status != Status::Uploaded)
    }

    /// Write the report as pretty-printed JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(Error::Io)
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = &self.totals;
        writeln!(
            f,
            "{} of {} uploaded, {} failed, {} not started",
            t.uploaded, t.total, t.failed, t.not_started
        )?;
        for item in self.unsuccessful() {
            match &item.error {
                Some(err) => {
                    let stage = err.stage.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
                    writeln!(
                        f,
                        "  FAILED  {} [{stage}] {}: {}",
                        item.url,
                        serde_json::to_value(err.kind)
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_default(),
                        err.message
                    )?;
                }
                None => writeln!(f, "  SKIPPED {} (not started)", item.url)?,
            }
        }
        Ok(())
    }
}
