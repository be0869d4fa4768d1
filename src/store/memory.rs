use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{CatalogStore, RecordFilter, SiteStatusStore, SlaStore, SlaTx, UpsertOutcome};
use crate::error::StorageError;
use crate::models::{
    AttachedReason, BatteryVersion, BatteryVersionReason, DateRange, HistoryGamas, NewReport,
    NewSlaRecord, Period, ProblemUpdate, RawIntervalRecord, RecordKey, SiteStatusKind,
    SiteStatusRecord, SlaReason, SlaRecord, SlaReport, SlaReportProblem,
};

// ---

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<RecordKey, SlaRecord>,
    next_record_id: i64,
    intervals: Vec<RawIntervalRecord>,
    /// report id -> (site id, date)
    reports: BTreeMap<i64, (String, NaiveDate)>,
    problems: BTreeMap<i64, SlaReportProblem>,
    next_report_id: i64,
    next_problem_id: i64,
    downtime: BTreeMap<String, SiteStatusRecord>,
    up: BTreeMap<String, SiteStatusRecord>,
    reasons: BTreeMap<i64, String>,
    associations: BTreeMap<i64, BatteryVersionReason>,
    history: BTreeMap<i64, HistoryGamas>,
    /// Shared id sequence for reasons, associations and history rows.
    next_catalog_id: i64,
    /// Pending injected chunk failures; `true` means constraint-class.
    chunk_failures: Vec<bool>,
}

impl MemoryState {
    fn push_record(&mut self, row: &NewSlaRecord) -> bool {
        // ---
        let key = row.key();
        if self.records.contains_key(&key) {
            return false;
        }
        self.next_record_id += 1;
        self.records.insert(
            key,
            SlaRecord {
                id: self.next_record_id,
                date: row.date,
                site_id: row.site_id.clone(),
                pr_code: row.pr_code.clone(),
                sla: row.sla,
                power_uptime: row.power_uptime,
                power_downtime: row.power_downtime,
                status_sla: row.status_sla.clone(),
            },
        );
        true
    }

    fn report(&self, id: i64) -> Option<SlaReport> {
        let (site_id, date) = self.reports.get(&id)?;
        Some(SlaReport {
            id,
            site_id: site_id.clone(),
            date: *date,
            problems: self
                .problems
                .values()
                .filter(|p| p.report_id == id)
                .cloned()
                .collect(),
        })
    }

    fn next_catalog_id(&mut self) -> i64 {
        self.next_catalog_id += 1;
        self.next_catalog_id
    }

    fn status_table(&mut self, kind: SiteStatusKind) -> &mut BTreeMap<String, SiteStatusRecord> {
        match kind {
            SiteStatusKind::Down => &mut self.downtime,
            SiteStatusKind::Up => &mut self.up,
        }
    }
}

/// In-process store with the same semantics as `PgStore`, used by tests and
/// local runs without a database.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed raw telemetry rows.
    pub fn insert_intervals(&self, rows: impl IntoIterator<Item = RawIntervalRecord>) {
        self.state.lock().intervals.extend(rows);
    }

    /// Seed daily rows directly, bypassing the bulk loader.
    pub fn insert_records(&self, rows: &[NewSlaRecord]) {
        let mut state = self.state.lock();
        for row in rows {
            state.push_record(row);
        }
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Make the next `count` chunk inserts fail, with a constraint-class
    /// error when `constraint` is set and a backend error otherwise.
    pub fn fail_next_chunks(&self, count: usize, constraint: bool) {
        self.state
            .lock()
            .chunk_failures
            .extend(std::iter::repeat(constraint).take(count));
    }
}

#[async_trait]
impl SlaStore for MemoryStore {
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn begin(&self, _timeout: Duration) -> Result<Box<dyn SlaTx>, StorageError> {
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            pending: Vec::new(),
        }))
    }

    async fn existing_keys(&self, keys: &[RecordKey]) -> Result<HashSet<RecordKey>, StorageError> {
        let state = self.state.lock();
        Ok(keys
            .iter()
            .filter(|k| state.records.contains_key(*k))
            .cloned()
            .collect())
    }

    async fn fetch_records(&self, filter: &RecordFilter) -> Result<Vec<SlaRecord>, StorageError> {
        // ---
        let predicates = filter.predicates();
        let state = self.state.lock();
        let mut rows: Vec<SlaRecord> = state
            .records
            .values()
            .filter(|r| predicates.iter().all(|p| p.matches(r)))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.date, &a.site_id).cmp(&(b.date, &b.site_id)));
        Ok(rows)
    }

    async fn latest_record_date(
        &self,
        filter: &RecordFilter,
    ) -> Result<Option<NaiveDate>, StorageError> {
        let predicates = filter.predicates();
        let state = self.state.lock();
        Ok(state
            .records
            .values()
            .filter(|r| predicates.iter().all(|p| p.matches(r)))
            .map(|r| r.date)
            .max())
    }

    async fn count_intervals(&self, site_id: &str, range: DateRange) -> Result<i64, StorageError> {
        let state = self.state.lock();
        Ok(state
            .intervals
            .iter()
            .filter(|r| r.site_id == site_id && range.contains(r.ts.date_naive()))
            .count() as i64)
    }

    async fn fetch_intervals(
        &self,
        site_id: &str,
        range: DateRange,
    ) -> Result<Vec<RawIntervalRecord>, StorageError> {
        let state = self.state.lock();
        let mut rows: Vec<RawIntervalRecord> = state
            .intervals
            .iter()
            .filter(|r| r.site_id == site_id && range.contains(r.ts.date_naive()))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.ts);
        Ok(rows)
    }

    async fn create_report(&self, report: &NewReport) -> Result<SlaReport, StorageError> {
        // ---
        let mut state = self.state.lock();
        let existing = state
            .reports
            .iter()
            .find(|(_, (site, date))| *site == report.site_id && *date == report.date)
            .map(|(id, _)| *id);
        let report_id = match existing {
            Some(id) => id,
            None => {
                state.next_report_id += 1;
                let id = state.next_report_id;
                state
                    .reports
                    .insert(id, (report.site_id.clone(), report.date));
                id
            }
        };

        for problem in &report.problems {
            state.next_problem_id += 1;
            let id = state.next_problem_id;
            state.problems.insert(
                id,
                SlaReportProblem {
                    id,
                    report_id,
                    responsible: problem.responsible,
                    description: problem.description.clone(),
                    notes: problem.notes.clone(),
                },
            );
        }

        state
            .report(report_id)
            .ok_or_else(|| StorageError::Backend(format!("report {report_id} vanished")))
    }

    async fn fetch_reports(
        &self,
        range: DateRange,
        site_id: Option<&str>,
    ) -> Result<Vec<SlaReport>, StorageError> {
        // ---
        let state = self.state.lock();
        let mut reports: Vec<SlaReport> = state
            .reports
            .iter()
            .filter(|(_, (site, date))| {
                range.contains(*date) && site_id.map_or(true, |wanted| wanted == site.as_str())
            })
            .filter_map(|(id, _)| state.report(*id))
            .collect();
        reports.sort_by(|a, b| (a.date, &a.site_id).cmp(&(b.date, &b.site_id)));
        Ok(reports)
    }

    async fn update_problem(
        &self,
        id: i64,
        update: &ProblemUpdate,
    ) -> Result<Option<(NaiveDate, SlaReportProblem)>, StorageError> {
        // ---
        let mut state = self.state.lock();
        let Some(problem) = state.problems.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(responsible) = update.responsible {
            problem.responsible = responsible;
        }
        if let Some(description) = &update.description {
            problem.description = description.clone();
        }
        if let Some(notes) = &update.notes {
            problem.notes = Some(notes.clone());
        }
        let problem = problem.clone();
        let date = state
            .reports
            .get(&problem.report_id)
            .map(|(_, date)| *date)
            .ok_or_else(|| StorageError::Backend(format!("orphan problem {id}")))?;
        Ok(Some((date, problem)))
    }

    async fn delete_problem(&self, id: i64) -> Result<Option<NaiveDate>, StorageError> {
        let mut state = self.state.lock();
        let Some(problem) = state.problems.remove(&id) else {
            return Ok(None);
        };
        Ok(state.reports.get(&problem.report_id).map(|(_, date)| *date))
    }
}

/// Staged inserts, applied to the shared state on commit.
struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    pending: Vec<NewSlaRecord>,
}

impl MemoryTx {
    fn is_known(&self, key: &RecordKey) -> bool {
        self.state.lock().records.contains_key(key) || self.pending.iter().any(|r| r.key() == *key)
    }
}

#[async_trait]
impl SlaTx for MemoryTx {
    async fn existing_keys(
        &mut self,
        keys: &[RecordKey],
    ) -> Result<HashSet<RecordKey>, StorageError> {
        Ok(keys.iter().filter(|k| self.is_known(k)).cloned().collect())
    }

    async fn insert_chunk(
        &mut self,
        rows: &[NewSlaRecord],
        _batch: Uuid,
    ) -> Result<Vec<RecordKey>, StorageError> {
        // ---
        let injected = {
            let mut state = self.state.lock();
            if state.chunk_failures.is_empty() {
                None
            } else {
                Some(state.chunk_failures.remove(0))
            }
        };
        match injected {
            Some(true) => {
                return Err(StorageError::Constraint(
                    "duplicate key value violates unique constraint".into(),
                ))
            }
            Some(false) => return Err(StorageError::Backend("connection reset".into())),
            None => {}
        }

        let mut inserted = Vec::new();
        for row in rows {
            let key = row.key();
            if !self.is_known(&key) {
                self.pending.push(row.clone());
                inserted.push(key);
            }
        }
        Ok(inserted)
    }

    async fn insert_row(&mut self, row: &NewSlaRecord, _batch: Uuid) -> Result<bool, StorageError> {
        if self.is_known(&row.key()) {
            return Ok(false);
        }
        self.pending.push(row.clone());
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        for row in &self.pending {
            state.push_record(row);
        }
        Ok(())
    }
}

#[async_trait]
impl SiteStatusStore for MemoryStore {
    async fn upsert_site_status(
        &self,
        kind: SiteStatusKind,
        record: &SiteStatusRecord,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut state = self.state.lock();
        let previous = state
            .status_table(kind)
            .insert(record.site_id.clone(), record.clone());
        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }

    async fn delete_site_status_except(
        &self,
        kind: SiteStatusKind,
        keep: &[String],
    ) -> Result<u64, StorageError> {
        let mut state = self.state.lock();
        let table = state.status_table(kind);
        let before = table.len();
        table.retain(|site_id, _| keep.contains(site_id));
        Ok((before - table.len()) as u64)
    }

    async fn list_site_status(
        &self,
        kind: SiteStatusKind,
    ) -> Result<Vec<SiteStatusRecord>, StorageError> {
        let mut state = self.state.lock();
        Ok(state.status_table(kind).values().cloned().collect())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn list_reasons(&self) -> Result<Vec<SlaReason>, StorageError> {
        let state = self.state.lock();
        Ok(state
            .reasons
            .iter()
            .map(|(id, reason)| SlaReason {
                id: *id,
                reason: reason.clone(),
            })
            .collect())
    }

    async fn create_reason(&self, reason: &str) -> Result<SlaReason, StorageError> {
        let mut state = self.state.lock();
        let id = state.next_catalog_id();
        state.reasons.insert(id, reason.to_string());
        Ok(SlaReason {
            id,
            reason: reason.to_string(),
        })
    }

    async fn update_reason(
        &self,
        id: i64,
        reason: &str,
    ) -> Result<Option<SlaReason>, StorageError> {
        let mut state = self.state.lock();
        Ok(state.reasons.get_mut(&id).map(|text| {
            *text = reason.to_string();
            SlaReason {
                id,
                reason: reason.to_string(),
            }
        }))
    }

    async fn delete_reason(&self, id: i64) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        if state.reasons.remove(&id).is_none() {
            return Ok(false);
        }
        state.associations.retain(|_, a| a.reason_id != id);
        Ok(true)
    }

    async fn attached_reasons(
        &self,
        version: BatteryVersion,
        period: &Period,
    ) -> Result<Vec<AttachedReason>, StorageError> {
        // ---
        let state = self.state.lock();
        Ok(state
            .associations
            .values()
            .filter(|a| a.battery_version == version.as_str() && a.period == period.as_str())
            .filter_map(|a| {
                Some(AttachedReason {
                    id: a.id,
                    reason_id: a.reason_id,
                    reason: state.reasons.get(&a.reason_id)?.clone(),
                    battery_version: a.battery_version.clone(),
                    period: a.period.clone(),
                })
            })
            .collect())
    }

    async fn attach_reason(
        &self,
        reason_id: i64,
        version: BatteryVersion,
        period: &Period,
    ) -> Result<Option<BatteryVersionReason>, StorageError> {
        // ---
        let mut state = self.state.lock();
        if !state.reasons.contains_key(&reason_id) {
            return Ok(None);
        }
        let duplicate = state.associations.values().any(|a| {
            a.reason_id == reason_id
                && a.battery_version == version.as_str()
                && a.period == period.as_str()
        });
        if duplicate {
            return Err(StorageError::Constraint(format!(
                "reason {reason_id} already attached to {} for {}",
                version.as_str(),
                period.as_str()
            )));
        }

        let id = state.next_catalog_id();
        let association = BatteryVersionReason {
            id,
            reason_id,
            battery_version: version.as_str().to_string(),
            period: period.as_str().to_string(),
        };
        state.associations.insert(id, association.clone());
        Ok(Some(association))
    }

    async fn detach_reason(&self, id: i64) -> Result<bool, StorageError> {
        Ok(self.state.lock().associations.remove(&id).is_some())
    }

    async fn list_history(
        &self,
        range: Option<DateRange>,
    ) -> Result<Vec<HistoryGamas>, StorageError> {
        // ---
        let state = self.state.lock();
        let mut rows: Vec<HistoryGamas> = state
            .history
            .values()
            .filter(|h| range.map_or(true, |r| r.contains(h.date)))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.date, b.id).cmp(&(a.date, a.id)));
        Ok(rows)
    }

    async fn create_history(
        &self,
        date: NaiveDate,
        description: &str,
    ) -> Result<HistoryGamas, StorageError> {
        let mut state = self.state.lock();
        let row = HistoryGamas {
            id: state.next_catalog_id(),
            date,
            description: description.to_string(),
        };
        state.history.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_history(
        &self,
        id: i64,
        date: NaiveDate,
        description: &str,
    ) -> Result<Option<HistoryGamas>, StorageError> {
        let mut state = self.state.lock();
        Ok(state.history.get_mut(&id).map(|row| {
            row.date = date;
            row.description = description.to_string();
            row.clone()
        }))
    }

    async fn delete_history(&self, id: i64) -> Result<bool, StorageError> {
        Ok(self.state.lock().history.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn period(raw: &str) -> Period {
        Period::try_from(raw.to_string()).unwrap()
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn attach_rejects_unknown_reason_and_duplicates() {
        // ---
        let store = MemoryStore::new();
        let march = period("2025-03");
        let reason = store.create_reason("Grid outage").await.unwrap();

        assert!(store
            .attach_reason(reason.id + 100, BatteryVersion::Talis5, &march)
            .await
            .unwrap()
            .is_none());

        let attached = store
            .attach_reason(reason.id, BatteryVersion::Talis5, &march)
            .await
            .unwrap();
        assert!(attached.is_some());

        let err = store
            .attach_reason(reason.id, BatteryVersion::Talis5, &march)
            .await
            .unwrap_err();
        assert!(err.is_constraint());

        let listed = store
            .attached_reasons(BatteryVersion::Talis5, &march)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reason, "Grid outage");
        assert!(store
            .attached_reasons(BatteryVersion::Mix, &march)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn deleting_a_reason_drops_its_associations() {
        // ---
        let store = MemoryStore::new();
        let march = period("2025-03");
        let reason = store.create_reason("Vandalism").await.unwrap();
        store
            .attach_reason(reason.id, BatteryVersion::Mix, &march)
            .await
            .unwrap();

        assert!(store.delete_reason(reason.id).await.unwrap());
        assert!(!store.delete_reason(reason.id).await.unwrap());
        assert!(store
            .attached_reasons(BatteryVersion::Mix, &march)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn history_lists_newest_first_within_range() {
        // ---
        let store = MemoryStore::new();
        store.create_history(day("2025-01-05"), "Fiber cut").await.unwrap();
        let late = store.create_history(day("2025-01-20"), "Storm").await.unwrap();
        store.create_history(day("2025-02-01"), "Maintenance").await.unwrap();

        let all = store.list_history(None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].description, "Maintenance");

        let january = DateRange::parse("2025-01-01", "2025-01-31").unwrap();
        let rows = store.list_history(Some(january)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, late.id);

        let updated = store
            .update_history(late.id, day("2025-01-21"), "Storm damage")
            .await
            .unwrap();
        assert_eq!(updated.map(|h| h.description), Some("Storm damage".to_string()));
        assert!(store.update_history(999, day("2025-01-21"), "x").await.unwrap().is_none());
    }
}
