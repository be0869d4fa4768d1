//! SLA aggregation over stored daily rows and raw telemetry.
//!
//! Every public operation goes through [`SlaCache::get_or_compute`] with a key
//! derived from its parameters, so repeated dashboard queries are served from
//! the cache until their TTL runs out or an upload invalidates their range.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::cache::{ttl_for_month, ttl_for_range, CacheKey, SlaCache};
use crate::error::{SlaError, SlaResult};
use crate::models::{BatteryVersion, DateRange, SlaRecord, SlaStatus, INTERVAL_MINUTES};
use crate::registry::{RegistrySnapshot, SiteRegistry};
use crate::store::{RecordFilter, SlaStore};

mod detail;
mod master;
pub mod provinces;

pub use detail::{downtime_text, DailyDetailReport, DetailGroup, DetailSite};
pub use master::{MasterFilters, MasterPage, MasterRow};

// ---

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Number of weekly buckets; the last one absorbs every day past day 20.
const WEEK_BUCKETS: i64 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub date: NaiveDate,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyPoint {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSummary {
    pub battery_version: BatteryVersion,
    pub average: Option<f64>,
    pub status: Option<SlaStatus>,
    pub sites_reported: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlySummary {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Latest date with data in the range, or today when there is none.
    pub date_now: NaiveDate,
    pub average: Option<f64>,
    pub status: Option<SlaStatus>,
    pub sites_reported: usize,
    pub total_sites: usize,
    pub by_battery_version: Vec<VersionSummary>,
}

/// SLA of one site computed from raw 5-minute telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySla {
    pub site_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub records: i64,
    pub uptime_minutes: i64,
    pub expected_minutes: i64,
    pub sla: f64,
    pub status: SlaStatus,
}

/// Mean of the finite values, `None` when there are none.
pub fn average<I: IntoIterator<Item = f64>>(values: I) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Average SLA per calendar date, rounded to whole percent. Dates without any
/// SLA value are left out.
pub fn daily_series(records: &[SlaRecord]) -> Vec<ChartPoint> {
    // ---
    let mut by_date: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    for record in records {
        if let Some(sla) = record.sla {
            by_date.entry(record.date).or_default().push(sla);
        }
    }
    by_date
        .into_iter()
        .filter_map(|(date, values)| {
            average(values).map(|avg| ChartPoint {
                date,
                value: avg.round() as i64,
            })
        })
        .collect()
}

/// Zero-based week bucket of `date` relative to `start`.
pub fn week_bucket(start: NaiveDate, date: NaiveDate) -> i64 {
    ((date - start).num_days() / 7).clamp(0, WEEK_BUCKETS - 1)
}

/// Average SLA per week bucket, one decimal place. Empty buckets are omitted.
pub fn weekly_series(start: NaiveDate, records: &[SlaRecord]) -> Vec<WeeklyPoint> {
    // ---
    let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for record in records {
        if let Some(sla) = record.sla {
            buckets
                .entry(week_bucket(start, record.date))
                .or_default()
                .push(sla);
        }
    }
    buckets
        .into_iter()
        .filter_map(|(bucket, values)| {
            average(values).map(|avg| WeeklyPoint {
                name: format!("Week {}", bucket + 1),
                value: round_to(avg, 1),
            })
        })
        .collect()
}

fn summarize<'a>(records: impl IntoIterator<Item = &'a SlaRecord>) -> (Option<f64>, usize) {
    // ---
    let mut sites = HashSet::new();
    let mut values = Vec::new();
    for record in records {
        if let Some(sla) = record.sla {
            values.push(sla);
            sites.insert(record.site_id.as_str());
        }
    }
    (average(values).map(|a| round_to(a, 2)), sites.len())
}

pub struct SlaAggregator {
    store: Arc<dyn SlaStore>,
    registry: Arc<dyn SiteRegistry>,
    cache: SlaCache,
    today: Option<NaiveDate>,
}

impl SlaAggregator {
    pub fn new(store: Arc<dyn SlaStore>, registry: Arc<dyn SiteRegistry>, cache: SlaCache) -> Self {
        SlaAggregator {
            store,
            registry,
            cache,
            today: None,
        }
    }

    /// Pin "today" for TTL decisions and the monthly `dateNow` fallback.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    pub async fn daily_chart_all_sites(&self, range: DateRange) -> SlaResult<Vec<ChartPoint>> {
        // ---
        let key = CacheKey::for_range("daily", range);
        self.cache
            .get_or_compute(&key, ttl_for_range(range, self.today()), move || async move {
                let records = self.store.fetch_records(&RecordFilter::between(range)).await?;
                Ok(daily_series(&records))
            })
            .await
    }

    pub async fn daily_chart_by_battery_version(
        &self,
        range: DateRange,
        version: BatteryVersion,
    ) -> SlaResult<Vec<ChartPoint>> {
        // ---
        let key = CacheKey::for_range_with("daily", version.as_str(), range);
        self.cache
            .get_or_compute(&key, ttl_for_range(range, self.today()), move || async move {
                let sites = self.registry.list_site_ids_by_battery_version(version).await?;
                if sites.is_empty() {
                    debug!("No {} sites in registry, empty series", version);
                    return Ok(Vec::new());
                }
                let filter = RecordFilter::between(range).with_sites(sites);
                let records = self.store.fetch_records(&filter).await?;
                Ok(daily_series(&records))
            })
            .await
    }

    pub async fn weekly_chart(&self, range: DateRange) -> SlaResult<Vec<WeeklyPoint>> {
        // ---
        let key = CacheKey::for_range("weekly", range);
        self.cache
            .get_or_compute(&key, ttl_for_range(range, self.today()), move || async move {
                let records = self.store.fetch_records(&RecordFilter::between(range)).await?;
                Ok(weekly_series(range.start, &records))
            })
            .await
    }

    /// Overall and per-battery-version averages. `range.start` must be the
    /// first day of a month.
    pub async fn monthly_summary(&self, range: DateRange) -> SlaResult<MonthlySummary> {
        // ---
        if range.start.day() != 1 {
            return Err(SlaError::validation(format!(
                "startDate must be the first day of a month, got {}",
                range.start
            )));
        }

        let today = self.today();
        let key = CacheKey::for_range("monthly", range);
        let cached = self
            .cache
            .get_or_compute(&key, ttl_for_month(range, today), move || async move {
                let snapshot = self.registry.snapshot().await?;
                self.month_summary(range, today, Some(snapshot.as_ref())).await
            })
            .await;

        // The version split and site total are advisory; a registry outage
        // degrades them instead of failing the summary. Not cached.
        match cached {
            Err(e @ (SlaError::Upstream { .. } | SlaError::RegistryNotConfigured(_))) => {
                error!("Monthly summary without registry data: {}", e);
                self.month_summary(range, today, None).await
            }
            other => other,
        }
    }

    async fn month_summary(
        &self,
        range: DateRange,
        today: NaiveDate,
        snapshot: Option<&RegistrySnapshot>,
    ) -> SlaResult<MonthlySummary> {
        // ---
        let filter = RecordFilter::between(range);
        let records = self.store.fetch_records(&filter).await?;
        let date_now = self.store.latest_record_date(&filter).await?.unwrap_or(today);

        let (average, sites_reported) = summarize(&records);
        let by_battery_version = BatteryVersion::ALL
            .into_iter()
            .map(|version| {
                let (average, sites_reported) = match snapshot {
                    Some(snapshot) => {
                        let sites = snapshot.site_ids_by_battery_version(version);
                        summarize(records.iter().filter(|r| sites.contains(&r.site_id)))
                    }
                    None => (None, 0),
                };
                VersionSummary {
                    battery_version: version,
                    average,
                    status: average.map(SlaStatus::classify),
                    sites_reported,
                }
            })
            .collect();

        Ok(MonthlySummary {
            start_date: range.start,
            end_date: range.end,
            date_now,
            average,
            status: average.map(SlaStatus::classify),
            sites_reported,
            total_sites: snapshot.map_or(0, RegistrySnapshot::len),
            by_battery_version,
        })
    }

    /// SLA of one site from raw telemetry: reported 5-minute intervals over
    /// the minutes in the range, capped at 100.
    pub async fn site_telemetry_sla(
        &self,
        site_id: &str,
        range: DateRange,
    ) -> SlaResult<TelemetrySla> {
        // ---
        let site_id = site_id.trim();
        if site_id.is_empty() {
            return Err(SlaError::validation("siteId is required"));
        }

        let key = CacheKey::hashed("telemetry", range, &serde_json::json!({ "siteId": site_id }));
        self.cache
            .get_or_compute(&key, ttl_for_range(range, self.today()), move || async move {
                let records = self.store.count_intervals(site_id, range).await?;
                let days = (range.end - range.start).num_days() + 1;
                let expected_minutes = days * MINUTES_PER_DAY;
                let uptime_minutes = (records * INTERVAL_MINUTES).min(expected_minutes);
                let sla = round_to(uptime_minutes as f64 / expected_minutes as f64 * 100.0, 2);

                Ok(TelemetrySla {
                    site_id: site_id.to_string(),
                    start_date: range.start,
                    end_date: range.end,
                    records,
                    uptime_minutes,
                    expected_minutes,
                    sla,
                    status: SlaStatus::classify(sla),
                })
            })
            .await
    }
}
