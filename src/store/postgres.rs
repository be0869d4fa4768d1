use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use super::{
    CatalogStore, Predicate, RecordFilter, SiteStatusStore, SlaStore, SlaTx, UpsertOutcome,
};
use crate::error::StorageError;
use crate::models::{
    AttachedReason, BatteryVersion, BatteryVersionReason, DateRange, HistoryGamas, NewReport,
    NewSlaRecord, Period, ProblemUpdate, RawIntervalRecord, RecordKey, ResponsibleParty,
    SiteStatusKind, SiteStatusRecord, SlaReason, SlaRecord, SlaReport, SlaReportProblem,
};

// ---

const RECORD_COLUMNS: &str =
    "id, date, site_id, pr_code, sla, power_uptime, power_downtime, status_sla";

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

fn push_predicates(qb: &mut QueryBuilder<'_, Postgres>, predicates: Vec<Predicate>) {
    // ---
    for (i, predicate) in predicates.into_iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        match predicate {
            Predicate::DateFrom(from) => {
                qb.push("date >= ").push_bind(from);
            }
            Predicate::DateTo(to) => {
                qb.push("date <= ").push_bind(to);
            }
            Predicate::SiteIn(ids) => {
                qb.push("site_id = ANY(").push_bind(ids).push(")");
            }
        }
    }
}

fn split_keys(keys: &[RecordKey]) -> (Vec<String>, Vec<NaiveDate>) {
    keys.iter().map(|k| (k.site_id.clone(), k.date)).unzip()
}

/// UTC instant bounds `[start 00:00, end+1 00:00)` of a date range.
fn instant_bounds(range: DateRange) -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&range.start.and_time(NaiveTime::MIN));
    let end_day = range.end.succ_opt().unwrap_or(range.end);
    let end = Utc.from_utc_datetime(&end_day.and_time(NaiveTime::MIN));
    (start, end)
}

async fn existing_keys_on<'e, E>(
    executor: E,
    keys: &[RecordKey],
) -> Result<HashSet<RecordKey>, StorageError>
where
    E: sqlx::PgExecutor<'e>,
{
    // ---
    if keys.is_empty() {
        return Ok(HashSet::new());
    }
    let (site_ids, dates) = split_keys(keys);

    // One round trip regardless of how many pairs are checked.
    let rows: Vec<(String, NaiveDate)> = sqlx::query_as(
        r#"
        SELECT s.site_id, s.date
        FROM sla_bakti s
        JOIN UNNEST($1::text[], $2::date[]) AS k(site_id, date)
          ON s.site_id = k.site_id AND s.date = k.date
        "#,
    )
    .bind(site_ids)
    .bind(dates)
    .fetch_all(executor)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(site_id, date)| RecordKey { site_id, date })
        .collect())
}

#[derive(sqlx::FromRow)]
struct ReportProblemRow {
    report_id: i64,
    site_id: String,
    date: NaiveDate,
    problem_id: Option<i64>,
    responsible: Option<String>,
    description: Option<String>,
    notes: Option<String>,
}

fn assemble_reports(rows: Vec<ReportProblemRow>) -> Result<Vec<SlaReport>, StorageError> {
    // ---
    let mut reports: BTreeMap<i64, SlaReport> = BTreeMap::new();
    for row in rows {
        let report = reports.entry(row.report_id).or_insert_with(|| SlaReport {
            id: row.report_id,
            site_id: row.site_id.clone(),
            date: row.date,
            problems: Vec::new(),
        });
        if let (Some(id), Some(responsible)) = (row.problem_id, row.responsible) {
            let responsible: ResponsibleParty = responsible
                .parse()
                .map_err(|e: crate::error::SlaError| StorageError::Backend(e.to_string()))?;
            report.problems.push(SlaReportProblem {
                id,
                report_id: row.report_id,
                responsible,
                description: row.description.unwrap_or_default(),
                notes: row.notes,
            });
        }
    }
    Ok(reports.into_values().collect())
}

const REPORT_SELECT: &str = r#"
    SELECT r.id AS report_id, r.site_id, r.date,
           p.id AS problem_id, p.responsible, p.description, p.notes
    FROM sla_report r
    LEFT JOIN sla_report_problem p ON p.report_id = r.id
"#;

#[async_trait]
impl SlaStore for PgStore {
    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn begin(&self, timeout: Duration) -> Result<Box<dyn SlaTx>, StorageError> {
        // ---
        let mut tx = self.pool.begin().await?;
        // SET LOCAL does not accept bind parameters.
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn existing_keys(&self, keys: &[RecordKey]) -> Result<HashSet<RecordKey>, StorageError> {
        existing_keys_on(&self.pool, keys).await
    }

    async fn fetch_records(&self, filter: &RecordFilter) -> Result<Vec<SlaRecord>, StorageError> {
        // ---
        let mut qb = QueryBuilder::new(format!("SELECT {RECORD_COLUMNS} FROM sla_bakti"));
        push_predicates(&mut qb, filter.predicates());
        qb.push(" ORDER BY date, site_id");

        let rows = qb.build_query_as::<SlaRecord>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn latest_record_date(
        &self,
        filter: &RecordFilter,
    ) -> Result<Option<NaiveDate>, StorageError> {
        // ---
        let mut qb = QueryBuilder::new("SELECT MAX(date) FROM sla_bakti");
        push_predicates(&mut qb, filter.predicates());

        let latest: Option<NaiveDate> = qb
            .build_query_scalar::<Option<NaiveDate>>()
            .fetch_one(&self.pool)
            .await?;
        Ok(latest)
    }

    async fn count_intervals(&self, site_id: &str, range: DateRange) -> Result<i64, StorageError> {
        // ---
        let (start, end) = instant_bounds(range);
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM interval_telemetry WHERE site_id = $1 AND ts >= $2 AND ts < $3",
        )
        .bind(site_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn fetch_intervals(
        &self,
        site_id: &str,
        range: DateRange,
    ) -> Result<Vec<RawIntervalRecord>, StorageError> {
        // ---
        let (start, end) = instant_bounds(range);
        let rows = sqlx::query_as::<_, RawIntervalRecord>(
            r#"
            SELECT site_id, ts, battery_voltage, load_current_1, load_current_2,
                   pv1_voltage, pv1_current, pv2_voltage, pv2_current,
                   energy_harvested_1, energy_harvested_2,
                   energy_discharged_1, energy_discharged_2
            FROM interval_telemetry
            WHERE site_id = $1 AND ts >= $2 AND ts < $3
            ORDER BY ts
            "#,
        )
        .bind(site_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn create_report(&self, report: &NewReport) -> Result<SlaReport, StorageError> {
        // ---
        let mut tx = self.pool.begin().await?;

        // The no-op update makes RETURNING yield the id of an existing report.
        let report_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sla_report (site_id, date) VALUES ($1, $2)
            ON CONFLICT (site_id, date) DO UPDATE SET site_id = EXCLUDED.site_id
            RETURNING id
            "#,
        )
        .bind(&report.site_id)
        .bind(report.date)
        .fetch_one(&mut *tx)
        .await?;

        for problem in &report.problems {
            sqlx::query(
                r#"
                INSERT INTO sla_report_problem (report_id, responsible, description, notes)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(report_id)
            .bind(problem.responsible.as_str())
            .bind(&problem.description)
            .bind(&problem.notes)
            .execute(&mut *tx)
            .await?;
        }

        let rows = sqlx::query_as::<_, ReportProblemRow>(&format!(
            "{REPORT_SELECT} WHERE r.id = $1 ORDER BY p.id"
        ))
        .bind(report_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        assemble_reports(rows)?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::Backend(format!("report {report_id} vanished")))
    }

    async fn fetch_reports(
        &self,
        range: DateRange,
        site_id: Option<&str>,
    ) -> Result<Vec<SlaReport>, StorageError> {
        // ---
        let rows = sqlx::query_as::<_, ReportProblemRow>(&format!(
            "{REPORT_SELECT} WHERE r.date BETWEEN $1 AND $2 AND ($3::text IS NULL OR r.site_id = $3) \
             ORDER BY r.date, r.site_id, p.id"
        ))
        .bind(range.start)
        .bind(range.end)
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;
        assemble_reports(rows)
    }

    async fn update_problem(
        &self,
        id: i64,
        update: &ProblemUpdate,
    ) -> Result<Option<(NaiveDate, SlaReportProblem)>, StorageError> {
        // ---
        let row = sqlx::query_as::<_, (i64, String, String, Option<String>, NaiveDate)>(
            r#"
            UPDATE sla_report_problem p
            SET responsible = COALESCE($2, p.responsible),
                description = COALESCE($3, p.description),
                notes       = COALESCE($4, p.notes)
            FROM sla_report r
            WHERE p.id = $1 AND r.id = p.report_id
            RETURNING p.report_id, p.responsible, p.description, p.notes, r.date
            "#,
        )
        .bind(id)
        .bind(update.responsible.map(|r| r.as_str()))
        .bind(&update.description)
        .bind(&update.notes)
        .fetch_optional(&self.pool)
        .await?;

        let Some((report_id, responsible, description, notes, date)) = row else {
            return Ok(None);
        };
        let responsible: ResponsibleParty = responsible
            .parse()
            .map_err(|e: crate::error::SlaError| StorageError::Backend(e.to_string()))?;
        Ok(Some((
            date,
            SlaReportProblem {
                id,
                report_id,
                responsible,
                description,
                notes,
            },
        )))
    }

    async fn delete_problem(&self, id: i64) -> Result<Option<NaiveDate>, StorageError> {
        // ---
        let date: Option<NaiveDate> = sqlx::query_scalar(
            r#"
            DELETE FROM sla_report_problem p
            USING sla_report r
            WHERE p.id = $1 AND r.id = p.report_id
            RETURNING r.date
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(date)
    }
}

/// Write transaction handed to the bulk loader.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    /// Run `SAVEPOINT`-scoped work so a failed statement does not poison the
    /// enclosing transaction.
    async fn savepoint(&mut self) -> Result<(), StorageError> {
        sqlx::query("SAVEPOINT sla_insert").execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn release(&mut self) -> Result<(), StorageError> {
        sqlx::query("RELEASE SAVEPOINT sla_insert")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) {
        if let Err(e) = sqlx::query("ROLLBACK TO SAVEPOINT sla_insert")
            .execute(&mut *self.tx)
            .await
        {
            tracing::warn!("Failed to roll back to savepoint: {}", e);
        }
    }
}

#[async_trait]
impl SlaTx for PgTx {
    async fn existing_keys(
        &mut self,
        keys: &[RecordKey],
    ) -> Result<HashSet<RecordKey>, StorageError> {
        existing_keys_on(&mut *self.tx, keys).await
    }

    async fn insert_chunk(
        &mut self,
        rows: &[NewSlaRecord],
        batch: Uuid,
    ) -> Result<Vec<RecordKey>, StorageError> {
        // ---
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO sla_bakti \
             (date, site_id, pr_code, sla, power_uptime, power_downtime, status_sla, upload_batch) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.date)
                .push_bind(row.site_id.clone())
                .push_bind(row.pr_code.clone())
                .push_bind(row.sla)
                .push_bind(row.power_uptime)
                .push_bind(row.power_downtime)
                .push_bind(row.status_sla.clone())
                .push_bind(batch);
        });
        qb.push(" ON CONFLICT (site_id, date) DO NOTHING RETURNING site_id, date");

        self.savepoint().await?;
        let result = qb
            .build_query_as::<(String, NaiveDate)>()
            .fetch_all(&mut *self.tx)
            .await;

        match result {
            Ok(inserted) => {
                self.release().await?;
                Ok(inserted
                    .into_iter()
                    .map(|(site_id, date)| RecordKey { site_id, date })
                    .collect())
            }
            Err(e) => {
                self.rollback_to_savepoint().await;
                Err(e.into())
            }
        }
    }

    async fn insert_row(&mut self, row: &NewSlaRecord, batch: Uuid) -> Result<bool, StorageError> {
        // ---
        self.savepoint().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO sla_bakti
                (date, site_id, pr_code, sla, power_uptime, power_downtime, status_sla, upload_batch)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (site_id, date) DO NOTHING
            "#,
        )
        .bind(row.date)
        .bind(&row.site_id)
        .bind(&row.pr_code)
        .bind(row.sla)
        .bind(row.power_uptime)
        .bind(row.power_downtime)
        .bind(&row.status_sla)
        .bind(batch)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(done) => {
                self.release().await?;
                Ok(done.rows_affected() == 1)
            }
            Err(e) => {
                self.rollback_to_savepoint().await;
                Err(e.into())
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }
}

fn status_table(kind: SiteStatusKind) -> &'static str {
    match kind {
        SiteStatusKind::Down => "site_downtime",
        SiteStatusKind::Up => "site_up",
    }
}

#[async_trait]
impl SiteStatusStore for PgStore {
    async fn upsert_site_status(
        &self,
        kind: SiteStatusKind,
        record: &SiteStatusRecord,
    ) -> Result<UpsertOutcome, StorageError> {
        // ---
        let table = status_table(kind);
        // xmax = 0 only for freshly inserted tuples.
        let inserted: bool = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO {table} (site_id, site_name, terminal_id, down_since, down_seconds, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (site_id) DO UPDATE SET
                site_name    = EXCLUDED.site_name,
                terminal_id  = EXCLUDED.terminal_id,
                down_since   = EXCLUDED.down_since,
                down_seconds = EXCLUDED.down_seconds,
                updated_at   = now()
            RETURNING (xmax = 0)
            "#
        ))
        .bind(&record.site_id)
        .bind(&record.site_name)
        .bind(&record.terminal_id)
        .bind(record.down_since)
        .bind(record.down_seconds)
        .fetch_one(&self.pool)
        .await?;

        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn delete_site_status_except(
        &self,
        kind: SiteStatusKind,
        keep: &[String],
    ) -> Result<u64, StorageError> {
        // ---
        let table = status_table(kind);
        let done = sqlx::query(&format!(
            "DELETE FROM {table} WHERE NOT (site_id = ANY($1))"
        ))
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn list_site_status(
        &self,
        kind: SiteStatusKind,
    ) -> Result<Vec<SiteStatusRecord>, StorageError> {
        // ---
        let table = status_table(kind);
        let rows = sqlx::query_as::<_, SiteStatusRecord>(&format!(
            "SELECT site_id, site_name, terminal_id, down_since, down_seconds FROM {table} \
             ORDER BY down_seconds DESC NULLS LAST, site_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn list_reasons(&self) -> Result<Vec<SlaReason>, StorageError> {
        let rows = sqlx::query_as::<_, SlaReason>("SELECT id, reason FROM sla_reason ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn create_reason(&self, reason: &str) -> Result<SlaReason, StorageError> {
        let row = sqlx::query_as::<_, SlaReason>(
            "INSERT INTO sla_reason (reason) VALUES ($1) RETURNING id, reason",
        )
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_reason(
        &self,
        id: i64,
        reason: &str,
    ) -> Result<Option<SlaReason>, StorageError> {
        let row = sqlx::query_as::<_, SlaReason>(
            "UPDATE sla_reason SET reason = $2 WHERE id = $1 RETURNING id, reason",
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_reason(&self, id: i64) -> Result<bool, StorageError> {
        // ON DELETE CASCADE removes the associations.
        let done = sqlx::query("DELETE FROM sla_reason WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn attached_reasons(
        &self,
        version: BatteryVersion,
        period: &Period,
    ) -> Result<Vec<AttachedReason>, StorageError> {
        // ---
        let rows = sqlx::query_as::<_, AttachedReason>(
            r#"
            SELECT bvr.id, bvr.reason_id, r.reason, bvr.battery_version, bvr.period
            FROM battery_version_reason bvr
            JOIN sla_reason r ON r.id = bvr.reason_id
            WHERE bvr.battery_version = $1 AND bvr.period = $2
            ORDER BY bvr.id
            "#,
        )
        .bind(version.as_str())
        .bind(period.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn attach_reason(
        &self,
        reason_id: i64,
        version: BatteryVersion,
        period: &Period,
    ) -> Result<Option<BatteryVersionReason>, StorageError> {
        // ---
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM sla_reason WHERE id = $1)")
                .bind(reason_id)
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Ok(None);
        }

        let row = sqlx::query_as::<_, BatteryVersionReason>(
            r#"
            INSERT INTO battery_version_reason (reason_id, battery_version, period)
            VALUES ($1, $2, $3)
            RETURNING id, reason_id, battery_version, period
            "#,
        )
        .bind(reason_id)
        .bind(version.as_str())
        .bind(period.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(row))
    }

    async fn detach_reason(&self, id: i64) -> Result<bool, StorageError> {
        let done = sqlx::query("DELETE FROM battery_version_reason WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn list_history(
        &self,
        range: Option<DateRange>,
    ) -> Result<Vec<HistoryGamas>, StorageError> {
        // ---
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT id, date, description FROM history_gamas");
        if let Some(range) = range {
            qb.push(" WHERE date >= ")
                .push_bind(range.start)
                .push(" AND date <= ")
                .push_bind(range.end);
        }
        qb.push(" ORDER BY date DESC, id DESC");

        let rows = qb.build_query_as::<HistoryGamas>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn create_history(
        &self,
        date: NaiveDate,
        description: &str,
    ) -> Result<HistoryGamas, StorageError> {
        let row = sqlx::query_as::<_, HistoryGamas>(
            "INSERT INTO history_gamas (date, description) VALUES ($1, $2) \
             RETURNING id, date, description",
        )
        .bind(date)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_history(
        &self,
        id: i64,
        date: NaiveDate,
        description: &str,
    ) -> Result<Option<HistoryGamas>, StorageError> {
        let row = sqlx::query_as::<_, HistoryGamas>(
            "UPDATE history_gamas SET date = $2, description = $3 WHERE id = $1 \
             RETURNING id, date, description",
        )
        .bind(id)
        .bind(date)
        .bind(description)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_history(&self, id: i64) -> Result<bool, StorageError> {
        let done = sqlx::query("DELETE FROM history_gamas WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}
