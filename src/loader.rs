//! Bulk loader for uploaded daily SLA rows.
//!
//! `preview` classifies parsed rows against the registry and storage without
//! writing anything. `commit` inserts them inside one transaction: duplicates
//! are re-checked under the transaction, rows go in 1000 at a time, and a chunk
//! that trips a unique constraint is retried row by row. Any other storage
//! failure aborts the whole commit.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::SlaCache;
use crate::error::{SlaError, SlaResult};
use crate::models::{DateRange, NewSlaRecord, RecordKey};
use crate::registry::SiteRegistry;
use crate::spreadsheet::{self, RowError};
use crate::store::SlaStore;

// ---

pub const CHUNK_SIZE: usize = 1000;

const BASE_TIMEOUT: Duration = Duration::from_secs(30);
const TIMEOUT_PER_100_ROWS: Duration = Duration::from_secs(5);
const MAX_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Transaction budget for committing `rows` rows.
pub fn commit_timeout(rows: usize) -> Duration {
    let increments = u32::try_from(rows.div_ceil(100)).unwrap_or(u32::MAX);
    BASE_TIMEOUT
        .saturating_add(TIMEOUT_PER_100_ROWS.saturating_mul(increments))
        .min(MAX_TIMEOUT)
}

/// Row counts reported by `preview`. Summaries of several files add up
/// element-wise.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewSummary {
    pub valid: usize,
    pub duplicate: usize,
    pub invalid_site_id: usize,
    pub errors: usize,
}

impl Add for PreviewSummary {
    type Output = PreviewSummary;

    fn add(self, rhs: PreviewSummary) -> PreviewSummary {
        PreviewSummary {
            valid: self.valid + rhs.valid,
            duplicate: self.duplicate + rhs.duplicate,
            invalid_site_id: self.invalid_site_id + rhs.invalid_site_id,
            errors: self.errors + rhs.errors,
        }
    }
}

impl AddAssign for PreviewSummary {
    fn add_assign(&mut self, rhs: PreviewSummary) {
        *self = *self + rhs;
    }
}

impl Sum for PreviewSummary {
    fn sum<I: Iterator<Item = PreviewSummary>>(iter: I) -> Self {
        iter.fold(PreviewSummary::default(), Add::add)
    }
}

#[derive(Debug, Default)]
pub struct Preview {
    pub summary: PreviewSummary,
    /// Rows that would be inserted, in input order.
    pub valid_rows: Vec<NewSlaRecord>,
    pub invalid_site_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    pub inserted: usize,
    pub skipped: usize,
    /// `YYYY-MM-DD` -> rows inserted for that date.
    pub inserted_per_date: BTreeMap<String, usize>,
    pub batch_id: Uuid,
}

impl CommitOutcome {
    fn empty(batch_id: Uuid) -> Self {
        CommitOutcome {
            inserted: 0,
            skipped: 0,
            inserted_per_date: BTreeMap::new(),
            batch_id,
        }
    }
}

/// Per-file part of a multi-file upload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    pub file_name: String,
    pub summary: PreviewSummary,
    pub row_errors: Vec<RowError>,
    pub invalid_site_ids: Vec<String>,
    /// Set when the file could not be parsed at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub preview: PreviewSummary,
    pub commit: CommitOutcome,
    pub files: Vec<FileReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPreview {
    pub preview: PreviewSummary,
    pub files: Vec<FileReport>,
}

/// An uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct BulkLoader {
    store: Arc<dyn SlaStore>,
    registry: Arc<dyn SiteRegistry>,
    cache: SlaCache,
}

impl BulkLoader {
    pub fn new(store: Arc<dyn SlaStore>, registry: Arc<dyn SiteRegistry>, cache: SlaCache) -> Self {
        BulkLoader {
            store,
            registry,
            cache,
        }
    }

    /// Classify parsed rows as valid, duplicate or unknown-site.
    /// `parse_errors` is carried into the summary unchanged.
    pub async fn preview(
        &self,
        rows: Vec<NewSlaRecord>,
        parse_errors: usize,
    ) -> SlaResult<Preview> {
        // ---
        let mut preview = Preview {
            summary: PreviewSummary {
                errors: parse_errors,
                ..PreviewSummary::default()
            },
            ..Preview::default()
        };

        // Registry trouble disables the site filter instead of rejecting everything.
        let active = match self.registry.list_active_site_ids().await {
            Ok(active) => Some(active),
            Err(e) => {
                warn!("Skipping site validation, registry unavailable: {}", e);
                None
            }
        };

        let mut known_sites = Vec::with_capacity(rows.len());
        for row in rows {
            match &active {
                Some(active) if !active.contains(&row.site_id) => {
                    preview.summary.invalid_site_id += 1;
                    preview.invalid_site_ids.insert(row.site_id);
                }
                _ => known_sites.push(row),
            }
        }

        let keys: Vec<RecordKey> = known_sites.iter().map(NewSlaRecord::key).collect();
        let existing = self.store.existing_keys(&keys).await?;

        let mut seen = HashSet::with_capacity(known_sites.len());
        for row in known_sites {
            let key = row.key();
            if existing.contains(&key) || !seen.insert(key) {
                preview.summary.duplicate += 1;
            } else {
                preview.valid_rows.push(row);
            }
        }
        preview.summary.valid = preview.valid_rows.len();

        debug!("Upload preview: {:?}", preview.summary);
        Ok(preview)
    }

    /// Insert `rows` in one transaction, skipping anything already stored.
    pub async fn commit(&self, rows: Vec<NewSlaRecord>) -> SlaResult<CommitOutcome> {
        // ---
        let batch_id = Uuid::new_v4();
        if rows.is_empty() {
            return Ok(CommitOutcome::empty(batch_id));
        }

        let budget = commit_timeout(rows.len());
        let outcome = tokio::time::timeout(budget, self.commit_in_tx(rows, batch_id, budget))
            .await
            .map_err(|_| {
                warn!("Bulk commit of batch {} exceeded {:?}", batch_id, budget);
                SlaError::Timeout(budget)
            })??;

        info!(
            "Batch {} committed: {} inserted, {} skipped",
            batch_id, outcome.inserted, outcome.skipped
        );

        if let Some(range) = inserted_range(&outcome) {
            self.cache.invalidate_by_date_range(range).await;
        }
        Ok(outcome)
    }

    async fn commit_in_tx(
        &self,
        rows: Vec<NewSlaRecord>,
        batch_id: Uuid,
        budget: Duration,
    ) -> SlaResult<CommitOutcome> {
        // ---
        let mut outcome = CommitOutcome::empty(batch_id);
        let mut tx = self.store.begin(budget).await?;

        let keys: Vec<RecordKey> = rows.iter().map(NewSlaRecord::key).collect();
        let existing = tx.existing_keys(&keys).await?;

        let mut seen = HashSet::with_capacity(rows.len());
        let mut fresh = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.key();
            if existing.contains(&key) || !seen.insert(key) {
                outcome.skipped += 1;
            } else {
                fresh.push(row);
            }
        }

        for (idx, chunk) in fresh.chunks(CHUNK_SIZE).enumerate() {
            match tx.insert_chunk(chunk, batch_id).await {
                Ok(inserted) => {
                    outcome.skipped += chunk.len() - inserted.len();
                    for key in inserted {
                        record_insert(&mut outcome, &key);
                    }
                }
                Err(e) if e.is_constraint() => {
                    warn!("Chunk {} hit a constraint ({}), retrying row by row", idx, e);
                    for row in chunk {
                        match tx.insert_row(row, batch_id).await {
                            Ok(true) => record_insert(&mut outcome, &row.key()),
                            Ok(false) => outcome.skipped += 1,
                            Err(e) if e.is_constraint() => {
                                debug!("Skipping {} on {}: {}", row.site_id, row.date, e);
                                outcome.skipped += 1;
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// Parse and preview several files without writing anything.
    pub async fn preview_files(&self, files: Vec<UploadFile>) -> SlaResult<UploadPreview> {
        let (files, _) = self.inspect(files).await?;
        Ok(UploadPreview {
            preview: files.iter().map(|r| r.summary).sum(),
            files,
        })
    }

    /// Parse, preview and commit several files as one upload. Valid rows from
    /// every file are committed together. Rows already stored at preview time
    /// count as skipped alongside those caught inside the transaction.
    pub async fn upload(&self, files: Vec<UploadFile>) -> SlaResult<UploadOutcome> {
        // ---
        let (reports, rows) = self.inspect(files).await?;
        let preview: PreviewSummary = reports.iter().map(|r| r.summary).sum();

        let mut commit = self.commit(rows).await?;
        commit.skipped += preview.duplicate;

        Ok(UploadOutcome {
            preview,
            commit,
            files: reports,
        })
    }

    async fn inspect(
        &self,
        files: Vec<UploadFile>,
    ) -> SlaResult<(Vec<FileReport>, Vec<NewSlaRecord>)> {
        // ---
        if files.is_empty() {
            return Err(SlaError::validation("No files uploaded"));
        }

        let mut reports = Vec::with_capacity(files.len());
        let mut rows = Vec::new();

        for file in files {
            let parsed = match spreadsheet::parse(&file.bytes, Some(&file.file_name)) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Rejected upload file '{}': {}", file.file_name, e);
                    reports.push(FileReport {
                        file_name: file.file_name,
                        summary: PreviewSummary::default(),
                        row_errors: Vec::new(),
                        invalid_site_ids: Vec::new(),
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };

            let preview = self.preview(parsed.rows, parsed.errors.len()).await?;
            rows.extend(preview.valid_rows);
            reports.push(FileReport {
                file_name: file.file_name,
                summary: preview.summary,
                row_errors: parsed.errors,
                invalid_site_ids: preview.invalid_site_ids.into_iter().collect(),
                error: None,
            });
        }

        if reports.iter().all(|r| r.error.is_some()) {
            let reasons: Vec<String> = reports
                .iter()
                .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.file_name, e)))
                .collect();
            return Err(SlaError::validation(reasons.join("; ")));
        }

        Ok((reports, rows))
    }
}

fn record_insert(outcome: &mut CommitOutcome, key: &RecordKey) {
    outcome.inserted += 1;
    *outcome
        .inserted_per_date
        .entry(key.date.format("%Y-%m-%d").to_string())
        .or_insert(0) += 1;
}

fn inserted_range(outcome: &CommitOutcome) -> Option<DateRange> {
    let first = outcome.inserted_per_date.keys().next()?;
    let last = outcome.inserted_per_date.keys().next_back()?;
    DateRange::parse(first, last).ok()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::NaiveDate;

    use crate::cache::{CacheKey, MemoryBackend, LONG_TTL};
    use crate::registry::{RegistryClient, Site, StaticRegistry};
    use crate::store::MemoryStore;

    fn row(site: &str, date: &str, sla: f64) -> NewSlaRecord {
        NewSlaRecord {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            site_id: site.to_string(),
            pr_code: None,
            sla: Some(sla),
            power_uptime: None,
            power_downtime: None,
            status_sla: None,
        }
    }

    fn loader(store: &MemoryStore) -> BulkLoader {
        let registry = StaticRegistry::new([
            Site::active("SITE-A", "Alpha", "talis5", "MALUKU"),
            Site::active("SITE-C", "Charlie", "mix", "PAPUA BARAT"),
        ]);
        BulkLoader::new(
            Arc::new(store.clone()),
            Arc::new(registry),
            SlaCache::disabled(),
        )
    }

    #[test]
    fn timeout_scales_with_rows_and_is_capped() {
        // ---
        assert_eq!(commit_timeout(0), Duration::from_secs(30));
        assert_eq!(commit_timeout(1), Duration::from_secs(35));
        assert_eq!(commit_timeout(250), Duration::from_secs(45));
        assert_eq!(commit_timeout(10_000_000), MAX_TIMEOUT);
    }

    #[test]
    fn summaries_add_element_wise() {
        // ---
        let a = PreviewSummary {
            valid: 2,
            duplicate: 1,
            invalid_site_id: 0,
            errors: 3,
        };
        let b = PreviewSummary {
            valid: 1,
            duplicate: 0,
            invalid_site_id: 4,
            errors: 0,
        };
        let total: PreviewSummary = [a, b].into_iter().sum();
        assert_eq!(
            total,
            PreviewSummary {
                valid: 3,
                duplicate: 1,
                invalid_site_id: 4,
                errors: 3
            }
        );
    }

    #[tokio::test]
    async fn preview_classifies_rows() {
        // ---
        let store = MemoryStore::new();
        store.insert_records(&[row("SITE-C", "2025-01-01", 90.0)]);
        let loader = loader(&store);

        let preview = loader
            .preview(
                vec![
                    row("SITE-A", "2025-01-01", 98.0),
                    row("SITE-A", "2025-01-01", 97.0),
                    row("SITE-B", "2025-01-01", 0.0),
                    row("SITE-C", "2025-01-01", 91.0),
                    row("SITE-C", "2025-01-02", 92.0),
                ],
                2,
            )
            .await
            .unwrap();

        assert_eq!(
            preview.summary,
            PreviewSummary {
                valid: 2,
                duplicate: 2,
                invalid_site_id: 1,
                errors: 2
            }
        );
        assert_eq!(preview.invalid_site_ids, BTreeSet::from(["SITE-B".to_string()]));
        assert_eq!(preview.valid_rows[0].sla, Some(98.0));
    }

    #[tokio::test]
    async fn unavailable_registry_skips_site_filter() {
        // ---
        let store = MemoryStore::new();
        let registry = RegistryClient::new(reqwest::Client::new(), None, 100, LONG_TTL);
        let loader = BulkLoader::new(Arc::new(store), Arc::new(registry), SlaCache::disabled());

        let preview = loader
            .preview(vec![row("ANYTHING", "2025-01-01", 50.0)], 0)
            .await
            .unwrap();
        assert_eq!(preview.summary.valid, 1);
        assert_eq!(preview.summary.invalid_site_id, 0);
    }

    #[tokio::test]
    async fn committing_twice_is_idempotent() {
        // ---
        let store = MemoryStore::new();
        let loader = loader(&store);
        let rows: Vec<_> = (1..=5)
            .map(|d| row("SITE-A", &format!("2025-01-0{d}"), 99.0))
            .collect();

        let first = loader.commit(rows.clone()).await.unwrap();
        assert_eq!((first.inserted, first.skipped), (5, 0));
        assert_eq!(first.inserted_per_date.get("2025-01-03"), Some(&1));

        let second = loader.commit(rows).await.unwrap();
        assert_eq!((second.inserted, second.skipped), (0, 5));
        assert!(second.inserted_per_date.is_empty());
        assert_ne!(first.batch_id, second.batch_id);
        assert_eq!(store.record_count(), 5);
    }

    #[tokio::test]
    async fn constraint_failure_falls_back_to_rows() {
        // ---
        let store = MemoryStore::new();
        let loader = loader(&store);
        store.fail_next_chunks(1, true);

        let outcome = loader
            .commit(vec![
                row("SITE-A", "2025-01-01", 99.0),
                row("SITE-C", "2025-01-01", 80.0),
            ])
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(store.record_count(), 2);
    }

    #[tokio::test]
    async fn backend_failure_aborts_commit() {
        // ---
        let store = MemoryStore::new();
        let loader = loader(&store);
        store.fail_next_chunks(1, false);

        let err = loader
            .commit(vec![row("SITE-A", "2025-01-01", 99.0)])
            .await
            .unwrap_err();

        assert!(matches!(err, SlaError::Storage(_)));
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn large_commit_spans_several_chunks() {
        // ---
        let store = MemoryStore::new();
        let loader = loader(&store);
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let rows: Vec<_> = start
            .iter_days()
            .take(CHUNK_SIZE + 250)
            .map(|d| row("SITE-A", &d.to_string(), 100.0))
            .collect();

        let outcome = loader.commit(rows).await.unwrap();
        assert_eq!(outcome.inserted, CHUNK_SIZE + 250);
        assert_eq!(outcome.inserted_per_date.len(), CHUNK_SIZE + 250);
    }

    #[tokio::test]
    async fn commit_invalidates_overlapping_cache_entries() {
        // ---
        let store = MemoryStore::new();
        let backend = Arc::new(MemoryBackend::new());
        let cache = SlaCache::new(backend.clone());
        let loader = BulkLoader::new(
            Arc::new(store),
            Arc::new(StaticRegistry::new([Site::active("SITE-A", "Alpha", "talis5", "MALUKU")])),
            cache.clone(),
        );

        let range = DateRange::parse("2025-01-01", "2025-01-31").unwrap();
        let key = CacheKey::for_range("daily", range);
        cache
            .get_or_compute(&key, LONG_TTL, || async { Ok::<_, SlaError>(1u8) })
            .await
            .unwrap();

        loader
            .commit(vec![row("SITE-A", "2025-01-15", 99.0)])
            .await
            .unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn multi_file_upload_sums_previews() {
        // ---
        let store = MemoryStore::new();
        let loader = loader(&store);

        let first = "Date,Site ID,SLA\n2025-01-01,SITE-A,98\n2025-01-01,SITE-B,0\n";
        let second = "Site ID,Date,SLA\nSITE-A,2025-01-02,60\n,2025-01-03,1\n";
        let broken = "SLA\n99\n";

        let outcome = loader
            .upload(vec![
                UploadFile {
                    file_name: "jan-a.csv".into(),
                    bytes: first.as_bytes().to_vec(),
                },
                UploadFile {
                    file_name: "jan-b.csv".into(),
                    bytes: second.as_bytes().to_vec(),
                },
                UploadFile {
                    file_name: "broken.csv".into(),
                    bytes: broken.as_bytes().to_vec(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            outcome.preview,
            PreviewSummary {
                valid: 2,
                duplicate: 0,
                invalid_site_id: 1,
                errors: 1
            }
        );
        assert_eq!(outcome.commit.inserted, 2);
        assert!(outcome.files[2].error.is_some());
        assert_eq!(store.record_count(), 2);
    }

    #[tokio::test]
    async fn second_upload_of_same_file_counts_every_row_as_skipped() {
        // ---
        let store = MemoryStore::new();
        let loader = loader(&store);
        let file = UploadFile {
            file_name: "jan.csv".into(),
            bytes: b"Date,Site ID,SLA\n2025-01-01,SITE-A,98\n2025-01-02,SITE-A,60\n".to_vec(),
        };

        let first = loader.upload(vec![file.clone()]).await.unwrap();
        assert_eq!((first.commit.inserted, first.commit.skipped), (2, 0));

        let second = loader.upload(vec![file]).await.unwrap();
        assert_eq!((second.commit.inserted, second.commit.skipped), (0, 2));
        assert_eq!(second.preview.duplicate, 2);
        assert_eq!(store.record_count(), 2);
    }
}
