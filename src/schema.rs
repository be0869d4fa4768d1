//! Database schema management for `sla-engine`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

const STATEMENTS: &[&str] = &[
    // Raw 5-minute telemetry, written by the field collectors; read-only here.
    r#"
    CREATE TABLE IF NOT EXISTS interval_telemetry (
        id                  BIGSERIAL PRIMARY KEY,
        site_id             TEXT        NOT NULL,
        ts                  TIMESTAMPTZ NOT NULL,
        battery_voltage     DOUBLE PRECISION,
        load_current_1      DOUBLE PRECISION,
        load_current_2      DOUBLE PRECISION,
        pv1_voltage         DOUBLE PRECISION,
        pv1_current         DOUBLE PRECISION,
        pv2_voltage         DOUBLE PRECISION,
        pv2_current         DOUBLE PRECISION,
        energy_harvested_1  DOUBLE PRECISION,
        energy_harvested_2  DOUBLE PRECISION,
        energy_discharged_1 DOUBLE PRECISION,
        energy_discharged_2 DOUBLE PRECISION
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_interval_telemetry_site_ts
        ON interval_telemetry (site_id, ts);
    "#,
    // One row per (site, day); never updated in place.
    r#"
    CREATE TABLE IF NOT EXISTS sla_bakti (
        id             BIGSERIAL PRIMARY KEY,
        date           DATE        NOT NULL,
        site_id        TEXT        NOT NULL,
        pr_code        TEXT,
        sla            DOUBLE PRECISION,
        power_uptime   DOUBLE PRECISION,
        power_downtime DOUBLE PRECISION,
        status_sla     TEXT,
        upload_batch   UUID,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT uq_sla_bakti_site_date UNIQUE (site_id, date)
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sla_bakti_date
        ON sla_bakti (date);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sla_report (
        id         BIGSERIAL PRIMARY KEY,
        site_id    TEXT        NOT NULL,
        date       DATE        NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        CONSTRAINT uq_sla_report_site_date UNIQUE (site_id, date)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sla_report_problem (
        id          BIGSERIAL PRIMARY KEY,
        report_id   BIGINT NOT NULL REFERENCES sla_report (id) ON DELETE CASCADE,
        responsible TEXT   NOT NULL CHECK (responsible IN ('VSAT', 'POWER', 'SNMP')),
        description TEXT   NOT NULL,
        notes       TEXT
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sla_report_problem_report
        ON sla_report_problem (report_id);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sla_reason (
        id     BIGSERIAL PRIMARY KEY,
        reason TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS battery_version_reason (
        id              BIGSERIAL PRIMARY KEY,
        reason_id       BIGINT NOT NULL REFERENCES sla_reason (id) ON DELETE CASCADE,
        battery_version TEXT   NOT NULL,
        period          TEXT   NOT NULL,
        CONSTRAINT uq_battery_version_reason UNIQUE (reason_id, battery_version, period)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS site_downtime (
        site_id      TEXT PRIMARY KEY,
        site_name    TEXT,
        terminal_id  TEXT,
        down_since   TIMESTAMPTZ,
        down_seconds BIGINT,
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS site_up (
        site_id      TEXT PRIMARY KEY,
        site_name    TEXT,
        terminal_id  TEXT,
        down_since   TIMESTAMPTZ,
        down_seconds BIGINT,
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS history_gamas (
        id          BIGSERIAL PRIMARY KEY,
        date        DATE NOT NULL,
        description TEXT NOT NULL
    );
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Creates the telemetry, daily SLA, report, reason, site status and history
/// tables. Safe to call on every startup; no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    tracing::info!("Schema ready ({} statements applied)", STATEMENTS.len());
    Ok(())
}
