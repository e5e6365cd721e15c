//! Target source adapter.
//!
//! Normalizes external lead sources into an ordered target queue. A source
//! is any tabular thing that can hand back rows and accept a status
//! write-back; the adapter owns column mapping, validation, deduplication,
//! and idempotent commits.

pub mod sheets;

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::model::Target;
use crate::store::MemoryStore;

pub use sheets::SheetSource;

/// A raw data row with its source row index (1-based, header is row 1).
#[derive(Debug, Clone)]
pub struct RawRow {
    pub row: u32,
    pub cells: Vec<String>,
}

/// Row range to fetch. `start` is the first data row; `limit` bounds the
/// number of rows returned.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowRange {
    pub start: Option<u32>,
    pub limit: Option<u32>,
}

/// External tabular lead source.
#[async_trait]
pub trait TargetSource: Send + Sync {
    /// Header row of the source.
    async fn headers(&self) -> Result<Vec<String>>;

    /// Ordered data rows.
    async fn fetch_rows(&self, range: RowRange) -> Result<Vec<RawRow>>;

    /// Best-effort status write-back for one row. Callers log failures and
    /// move on; they never propagate.
    async fn write_status(&self, row: u32, status: &str) -> Result<()>;
}

// =============================================================================
// Column mapping
// =============================================================================

/// Which columns hold the profile identifier and the message template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    pub profile: usize,
    pub message: usize,
}

const PROFILE_HINTS: &[&str] = &["profile", "url", "handle", "username", "link", "account"];
const MESSAGE_HINTS: &[&str] = &["message", "dm", "text", "template"];

/// Infer the column mapping from header names.
///
/// Falls back to the first two columns when the headers give nothing away.
pub fn infer_mapping(headers: &[String]) -> Option<ColumnMap> {
    let matches_hints = |header: &str, hints: &[&str]| {
        let header = header.to_lowercase();
        hints.iter().any(|hint| header.contains(hint))
    };

    let profile = headers.iter().position(|h| matches_hints(h, PROFILE_HINTS));
    let message = headers
        .iter()
        .enumerate()
        .find(|(i, h)| Some(*i) != profile && matches_hints(h, MESSAGE_HINTS))
        .map(|(i, _)| i);

    match (profile, message) {
        (Some(p), Some(m)) => Some(ColumnMap { profile: p, message: m }),
        _ if headers.len() >= 2 => Some(ColumnMap { profile: 0, message: 1 }),
        _ => None,
    }
}

// =============================================================================
// Preview & commit
// =============================================================================

/// Result of previewing a source: nothing is persisted.
#[derive(Debug)]
pub struct Preview {
    pub headers: Vec<String>,
    pub mapping: Option<ColumnMap>,
    /// (row index, profile, message) for the sampled rows.
    pub sample: Vec<(u32, String, String)>,
    pub total_rows: usize,
}

/// Result of committing a source into a campaign's target set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Targets newly persisted this commit.
    pub committed: usize,
    /// Rows dropped for a missing identifier or message.
    pub skipped_invalid: usize,
    /// Rows dropped as duplicates of an earlier row's profile.
    pub deduped: usize,
}

/// Sample a source and infer its column mapping without committing targets.
pub async fn preview(source: &dyn TargetSource, limit: u32) -> Result<Preview> {
    let headers = source.headers().await?;
    let mapping = infer_mapping(&headers);
    let rows = source.fetch_rows(RowRange::default()).await?;

    let sample = match mapping {
        Some(map) => rows
            .iter()
            .take(limit as usize)
            .map(|r| (r.row, cell(r, map.profile), cell(r, map.message)))
            .collect(),
        None => Vec::new(),
    };

    Ok(Preview {
        headers,
        mapping,
        sample,
        total_rows: rows.len(),
    })
}

/// Commit the full source into the campaign's target set.
///
/// Rows missing either field are counted and dropped, not errors. Identity
/// is the source row index, so re-running commit on the same source never
/// duplicates targets; rows repeating an earlier profile are dropped too.
pub async fn commit(
    source: &dyn TargetSource,
    mapping: ColumnMap,
    store: &MemoryStore,
    campaign_id: &str,
) -> Result<CommitSummary> {
    let rows = source.fetch_rows(RowRange::default()).await?;

    let mut summary = CommitSummary::default();
    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(rows.len());

    for raw in &rows {
        let profile = cell(raw, mapping.profile);
        let message = cell(raw, mapping.message);

        if profile.is_empty() || message.is_empty() {
            summary.skipped_invalid += 1;
            continue;
        }

        let key = normalize_profile(&profile);
        if !seen.insert(key) {
            summary.deduped += 1;
            continue;
        }

        targets.push(Target::new(raw.row, profile, message));
    }

    summary.committed = store.upsert_targets(campaign_id, targets);

    info!(
        campaign_id = campaign_id,
        committed = summary.committed,
        skipped_invalid = summary.skipped_invalid,
        deduped = summary.deduped,
        "source_commit_complete"
    );

    Ok(summary)
}

fn cell(row: &RawRow, index: usize) -> String {
    row.cells.get(index).map(|s| s.trim().to_string()).unwrap_or_default()
}

/// Canonical form of a profile identifier for dedup purposes.
fn normalize_profile(profile: &str) -> String {
    profile.trim().trim_end_matches('/').trim_start_matches('@').to_lowercase()
}

// =============================================================================
// In-memory source
// =============================================================================

/// Fixed-row source for tests and pre-ingested lead lists.
pub struct StaticSource {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    statuses: RwLock<Vec<(u32, String)>>,
}

impl StaticSource {
    pub fn new(headers: Vec<&str>, rows: Vec<Vec<&str>>) -> Self {
        Self {
            headers: headers.into_iter().map(String::from).collect(),
            rows: rows
                .into_iter()
                .map(|r| r.into_iter().map(String::from).collect())
                .collect(),
            statuses: RwLock::new(Vec::new()),
        }
    }

    /// Statuses written back so far, in write order.
    pub fn written_statuses(&self) -> Vec<(u32, String)> {
        self.statuses.read().unwrap().clone()
    }
}

#[async_trait]
impl TargetSource for StaticSource {
    async fn headers(&self) -> Result<Vec<String>> {
        Ok(self.headers.clone())
    }

    async fn fetch_rows(&self, range: RowRange) -> Result<Vec<RawRow>> {
        let start = range.start.unwrap_or(2);
        let rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, cells)| RawRow {
                row: i as u32 + 2, // data starts under the header row
                cells: cells.clone(),
            })
            .filter(|r| r.row >= start)
            .take(range.limit.unwrap_or(u32::MAX) as usize)
            .collect();
        Ok(rows)
    }

    async fn write_status(&self, row: u32, status: &str) -> Result<()> {
        self.statuses.write().unwrap().push((row, status.to_string()));
        Ok(())
    }
}
