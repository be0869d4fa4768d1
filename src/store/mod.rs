//! Storage seam for the SLA engine.
//!
//! The engine talks to storage only through the traits below. `PgStore` is the
//! production implementation; `MemoryStore` backs tests and local runs.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{
    AttachedReason, BatteryVersion, BatteryVersionReason, DateRange, HistoryGamas, NewReport,
    NewSlaRecord, Period, ProblemUpdate, RawIntervalRecord, RecordKey, SiteStatusKind,
    SiteStatusRecord, SlaReason, SlaRecord, SlaReport, SlaReportProblem,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

/// Typed filter over daily SLA rows. Rendered into an explicit predicate list
/// so both stores evaluate exactly the same clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub site_ids: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    DateFrom(NaiveDate),
    DateTo(NaiveDate),
    /// Sorted, de-duplicated site ids. An empty list matches nothing.
    SiteIn(Vec<String>),
}

impl RecordFilter {
    pub fn between(range: DateRange) -> Self {
        RecordFilter {
            from: Some(range.start),
            to: Some(range.end),
            site_ids: None,
        }
    }

    pub fn with_sites<I, S>(mut self, sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.site_ids = Some(sites.into_iter().map(Into::into).collect());
        self
    }

    pub fn predicates(&self) -> Vec<Predicate> {
        // ---
        let mut predicates = Vec::with_capacity(3);
        if let Some(from) = self.from {
            predicates.push(Predicate::DateFrom(from));
        }
        if let Some(to) = self.to {
            predicates.push(Predicate::DateTo(to));
        }
        if let Some(ids) = &self.site_ids {
            predicates.push(Predicate::SiteIn(ids.iter().cloned().collect()));
        }
        predicates
    }
}

impl Predicate {
    pub fn matches(&self, record: &SlaRecord) -> bool {
        match self {
            Predicate::DateFrom(from) => record.date >= *from,
            Predicate::DateTo(to) => record.date <= *to,
            Predicate::SiteIn(ids) => ids.binary_search(&record.site_id).is_ok(),
        }
    }
}

/// Whether an upsert created a new row or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Daily SLA rows, raw telemetry and problem reports.
#[async_trait]
pub trait SlaStore: Send + Sync {
    /// Cheap round trip used by the readiness endpoint.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Open a write transaction whose statements are bounded by `timeout`.
    async fn begin(&self, timeout: std::time::Duration) -> Result<Box<dyn SlaTx>, StorageError>;

    /// Which of `keys` already exist, answered by a single query.
    async fn existing_keys(&self, keys: &[RecordKey]) -> Result<HashSet<RecordKey>, StorageError>;

    async fn fetch_records(&self, filter: &RecordFilter) -> Result<Vec<SlaRecord>, StorageError>;

    async fn latest_record_date(
        &self,
        filter: &RecordFilter,
    ) -> Result<Option<NaiveDate>, StorageError>;

    async fn count_intervals(&self, site_id: &str, range: DateRange) -> Result<i64, StorageError>;

    async fn fetch_intervals(
        &self,
        site_id: &str,
        range: DateRange,
    ) -> Result<Vec<RawIntervalRecord>, StorageError>;

    /// Create the report for `(site, date)` or append to the existing one.
    async fn create_report(&self, report: &NewReport) -> Result<SlaReport, StorageError>;

    async fn fetch_reports(
        &self,
        range: DateRange,
        site_id: Option<&str>,
    ) -> Result<Vec<SlaReport>, StorageError>;

    /// Returns the report date alongside the updated problem, `None` if absent.
    async fn update_problem(
        &self,
        id: i64,
        update: &ProblemUpdate,
    ) -> Result<Option<(NaiveDate, SlaReportProblem)>, StorageError>;

    /// Returns the report date of the deleted problem, `None` if absent.
    async fn delete_problem(&self, id: i64) -> Result<Option<NaiveDate>, StorageError>;
}

/// Transaction-scoped operations used by the bulk loader.
#[async_trait]
pub trait SlaTx: Send {
    async fn existing_keys(
        &mut self,
        keys: &[RecordKey],
    ) -> Result<HashSet<RecordKey>, StorageError>;

    /// Insert a chunk, silently skipping `(site_id, date)` conflicts.
    /// Returns the keys actually inserted. On error the chunk leaves no trace.
    async fn insert_chunk(
        &mut self,
        rows: &[NewSlaRecord],
        batch: Uuid,
    ) -> Result<Vec<RecordKey>, StorageError>;

    /// Insert one row; `Ok(false)` when it already exists.
    async fn insert_row(&mut self, row: &NewSlaRecord, batch: Uuid) -> Result<bool, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Current up/down tables maintained by the reconciliation service.
#[async_trait]
pub trait SiteStatusStore: Send + Sync {
    async fn upsert_site_status(
        &self,
        kind: SiteStatusKind,
        record: &SiteStatusRecord,
    ) -> Result<UpsertOutcome, StorageError>;

    /// Delete every row whose site id is not in `keep`; returns rows removed.
    async fn delete_site_status_except(
        &self,
        kind: SiteStatusKind,
        keep: &[String],
    ) -> Result<u64, StorageError>;

    async fn list_site_status(
        &self,
        kind: SiteStatusKind,
    ) -> Result<Vec<SiteStatusRecord>, StorageError>;
}

/// Reasons, their battery-version/period associations and outage history.
/// None of it feeds the aggregates.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_reasons(&self) -> Result<Vec<SlaReason>, StorageError>;

    async fn create_reason(&self, reason: &str) -> Result<SlaReason, StorageError>;

    async fn update_reason(&self, id: i64, reason: &str)
        -> Result<Option<SlaReason>, StorageError>;

    /// Associations go with the reason. `false` when no such reason.
    async fn delete_reason(&self, id: i64) -> Result<bool, StorageError>;

    async fn attached_reasons(
        &self,
        version: BatteryVersion,
        period: &Period,
    ) -> Result<Vec<AttachedReason>, StorageError>;

    /// `None` when the reason does not exist. Attaching the same reason to
    /// one version and period twice is a constraint error.
    async fn attach_reason(
        &self,
        reason_id: i64,
        version: BatteryVersion,
        period: &Period,
    ) -> Result<Option<BatteryVersionReason>, StorageError>;

    async fn detach_reason(&self, id: i64) -> Result<bool, StorageError>;

    /// Newest first, optionally limited to `range`.
    async fn list_history(
        &self,
        range: Option<DateRange>,
    ) -> Result<Vec<HistoryGamas>, StorageError>;

    async fn create_history(
        &self,
        date: NaiveDate,
        description: &str,
    ) -> Result<HistoryGamas, StorageError>;

    async fn update_history(
        &self,
        id: i64,
        date: NaiveDate,
        description: &str,
    ) -> Result<Option<HistoryGamas>, StorageError>;

    async fn delete_history(&self, id: i64) -> Result<bool, StorageError>;
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn record(site: &str, date: NaiveDate) -> SlaRecord {
        SlaRecord {
            id: 1,
            date,
            site_id: site.to_string(),
            pr_code: None,
            sla: Some(100.0),
            power_uptime: None,
            power_downtime: None,
            status_sla: None,
        }
    }

    #[test]
    fn filter_renders_explicit_predicates() {
        // ---
        let range = DateRange::parse("2025-01-01", "2025-01-31").unwrap();
        let filter = RecordFilter::between(range).with_sites(["B", "A", "B"]);

        assert_eq!(
            filter.predicates(),
            vec![
                Predicate::DateFrom(range.start),
                Predicate::DateTo(range.end),
                Predicate::SiteIn(vec!["A".to_string(), "B".to_string()]),
            ]
        );
    }

    #[test]
    fn default_filter_has_no_predicates() {
        // ---
        assert!(RecordFilter::default().predicates().is_empty());
    }

    #[test]
    fn predicates_match_records() {
        // ---
        let day = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
        let filter = RecordFilter::between(DateRange::single(day)).with_sites(["A"]);
        let preds = filter.predicates();

        assert!(preds.iter().all(|p| p.matches(&record("A", day))));
        assert!(!preds.iter().all(|p| p.matches(&record("B", day))));
        assert!(!preds
            .iter()
            .all(|p| p.matches(&record("A", day.succ_opt().unwrap()))));
        assert!(!Predicate::SiteIn(vec![]).matches(&record("A", day)));
    }
}
