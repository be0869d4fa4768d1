//! Day-over-day detail report grouped by battery hardware version.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::SlaAggregator;
use crate::cache::{ttl_for_range, CacheKey};
use crate::error::{SlaError, SlaResult};
use crate::models::{first_of_month, BatteryVersion, DateRange, SlaRecord, SlaReport};
use crate::store::RecordFilter;

// ---

/// SLA at or below this on both days counts as down.
const DOWN_THRESHOLD: f64 = 1.0;
/// Target a site is "under" when it drops below it.
const UNDER_THRESHOLD: f64 = 95.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailSite {
    pub site_id: String,
    pub site_name: String,
    pub province: Option<String>,
    pub sla_today: Option<f64>,
    pub sla_yesterday: Option<f64>,
    pub downtime: Option<String>,
    pub problem: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailGroup {
    pub battery_version: BatteryVersion,
    pub down: Vec<DetailSite>,
    pub under: Vec<DetailSite>,
    pub drop: Vec<DetailSite>,
    pub up: Vec<DetailSite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyDetailReport {
    pub today: NaiveDate,
    pub yesterday: NaiveDate,
    pub groups: Vec<DetailGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Movement {
    Down,
    Under,
    Drop,
    Up,
}

/// Categories are exclusive and checked in order: down, under, drop, up.
fn classify_movement(today: Option<f64>, yesterday: Option<f64>) -> Option<Movement> {
    // ---
    let today = today?;
    match yesterday {
        Some(y) if today <= DOWN_THRESHOLD && y <= DOWN_THRESHOLD => Some(Movement::Down),
        y if today < UNDER_THRESHOLD && y.map_or(true, |y| y >= UNDER_THRESHOLD) => {
            Some(Movement::Under)
        }
        Some(y) if today < y => Some(Movement::Drop),
        Some(y) if today > y => Some(Movement::Up),
        _ => None,
    }
}

/// Human-readable downtime from a number of hours. The first matching
/// granularity wins; anything from 96 hours on is "more than 4 days".
pub fn downtime_text(hours: f64) -> String {
    // ---
    let minutes = (hours.max(0.0) * 60.0).round() as i64;
    if minutes >= 96 * 60 {
        "more than 4 days".to_string()
    } else if minutes >= 24 * 60 {
        format!("{} days", minutes / (24 * 60))
    } else if minutes >= 60 {
        format!("{} hours {} minutes", minutes / 60, minutes % 60)
    } else {
        format!("{} minutes", minutes)
    }
}

fn last_problem(report: &SlaReport) -> Option<String> {
    report
        .problems
        .iter()
        .max_by_key(|p| p.id)
        .map(|p| p.description.clone())
}

/// Site id -> problem text. Reports from the start of the month up to
/// `yesterday` are searched latest first; the `today` report is the fallback.
fn problem_lookup(
    reports: &[SlaReport],
    yesterday: NaiveDate,
    today: NaiveDate,
) -> HashMap<String, String> {
    // ---
    let mut latest: HashMap<&str, (NaiveDate, String)> = HashMap::new();
    let mut same_day: HashMap<&str, String> = HashMap::new();

    for report in reports {
        let Some(text) = last_problem(report) else {
            continue;
        };
        if report.date == today {
            same_day.insert(report.site_id.as_str(), text);
        } else if report.date <= yesterday {
            let newer = latest
                .get(report.site_id.as_str())
                .map_or(true, |(date, _)| report.date > *date);
            if newer {
                latest.insert(report.site_id.as_str(), (report.date, text));
            }
        }
    }

    let mut lookup: HashMap<String, String> = same_day
        .into_iter()
        .map(|(site, text)| (site.to_string(), text))
        .collect();
    for (site, (_, text)) in latest {
        lookup.insert(site.to_string(), text);
    }
    lookup
}

impl SlaAggregator {
    /// Compare `range.end` ("today") against `range.start` ("yesterday").
    pub async fn daily_detail_report(&self, range: DateRange) -> SlaResult<DailyDetailReport> {
        // ---
        if (range.end - range.start).num_days() != 1 {
            return Err(SlaError::validation(format!(
                "Detail report needs endDate exactly one day after startDate, got {range}"
            )));
        }

        // Problem text comes from reports across the whole month so far.
        let month = DateRange::new(first_of_month(range.start), range.end)?;
        let key = CacheKey::for_range("detail", range).depends_on(month);
        self.cache
            .get_or_compute(&key, ttl_for_range(range, self.today()), move || async move {
                let (yesterday, today) = (range.start, range.end);
                let records = self.store.fetch_records(&RecordFilter::between(range)).await?;
                let snapshot = self.registry.snapshot().await?;
                let reports = self.store.fetch_reports(month, None).await?;
                let problems = problem_lookup(&reports, yesterday, today);

                let mut by_site: HashMap<&str, (Option<&SlaRecord>, Option<&SlaRecord>)> =
                    HashMap::new();
                for record in &records {
                    let entry = by_site.entry(record.site_id.as_str()).or_default();
                    if record.date == today {
                        entry.0 = Some(record);
                    } else {
                        entry.1 = Some(record);
                    }
                }

                let mut groups: Vec<DetailGroup> = BatteryVersion::ALL
                    .into_iter()
                    .map(|battery_version| DetailGroup {
                        battery_version,
                        down: Vec::new(),
                        under: Vec::new(),
                        drop: Vec::new(),
                        up: Vec::new(),
                    })
                    .collect();

                let mut site_ids: Vec<&str> = by_site.keys().copied().collect();
                site_ids.sort_unstable();

                for site_id in site_ids {
                    let Some(details) = snapshot.details(site_id) else {
                        continue;
                    };
                    let Some(version) = details.battery_version else {
                        continue;
                    };
                    let Some(group) = groups.iter_mut().find(|g| g.battery_version == version)
                    else {
                        continue;
                    };
                    let (today_row, yesterday_row) = by_site[site_id];
                    let sla_today = today_row.and_then(|r| r.sla);
                    let sla_yesterday = yesterday_row.and_then(|r| r.sla);
                    let Some(movement) = classify_movement(sla_today, sla_yesterday) else {
                        continue;
                    };

                    let site = DetailSite {
                        site_id: site_id.to_string(),
                        site_name: details.name.clone(),
                        province: details.province.clone(),
                        sla_today,
                        sla_yesterday,
                        downtime: today_row.and_then(|r| r.power_downtime).map(downtime_text),
                        problem: problems.get(site_id).cloned(),
                    };
                    match movement {
                        Movement::Down => group.down.push(site),
                        Movement::Under => group.under.push(site),
                        Movement::Drop => group.drop.push(site),
                        Movement::Up => group.up.push(site),
                    }
                }

                Ok(DailyDetailReport {
                    today,
                    yesterday,
                    groups,
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::Arc;

    use crate::cache::{MemoryBackend, SlaCache};
    use crate::models::{NewProblem, NewReport, NewSlaRecord, ResponsibleParty};
    use crate::registry::{Site, StaticRegistry};
    use crate::store::{MemoryStore, SlaStore};

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn row(site: &str, date: &str, sla: f64, downtime: Option<f64>) -> NewSlaRecord {
        NewSlaRecord {
            date: day(date),
            site_id: site.to_string(),
            pr_code: None,
            sla: Some(sla),
            power_uptime: None,
            power_downtime: downtime,
            status_sla: None,
        }
    }

    #[test]
    fn downtime_text_picks_first_granularity() {
        // ---
        assert_eq!(downtime_text(120.0), "more than 4 days");
        assert_eq!(downtime_text(96.0), "more than 4 days");
        assert_eq!(downtime_text(50.0), "2 days");
        assert_eq!(downtime_text(2.5), "2 hours 30 minutes");
        assert_eq!(downtime_text(0.25), "15 minutes");
        assert_eq!(downtime_text(0.0), "0 minutes");
    }

    #[test]
    fn movement_categories_are_exclusive_and_ordered() {
        // ---
        assert_eq!(classify_movement(Some(0.0), Some(0.5)), Some(Movement::Down));
        assert_eq!(classify_movement(Some(90.0), Some(99.0)), Some(Movement::Under));
        assert_eq!(classify_movement(Some(90.0), None), Some(Movement::Under));
        assert_eq!(classify_movement(Some(80.0), Some(90.0)), Some(Movement::Drop));
        assert_eq!(classify_movement(Some(97.0), Some(99.0)), Some(Movement::Drop));
        assert_eq!(classify_movement(Some(99.0), Some(50.0)), Some(Movement::Up));
        assert_eq!(classify_movement(Some(100.0), Some(100.0)), None);
        assert_eq!(classify_movement(None, Some(50.0)), None);
    }

    #[tokio::test]
    async fn report_groups_sites_by_version() {
        // ---
        let store = MemoryStore::new();
        store.insert_records(&[
            row("A", "2025-01-01", 0.0, None),
            row("A", "2025-01-02", 0.0, Some(30.0)),
            row("B", "2025-01-01", 99.0, None),
            row("B", "2025-01-02", 80.0, Some(2.5)),
            row("C", "2025-01-01", 40.0, None),
            row("C", "2025-01-02", 60.0, None),
            row("GHOST", "2025-01-02", 0.0, None),
        ]);
        store
            .create_report(&NewReport {
                site_id: "B".into(),
                date: day("2025-01-01"),
                problems: vec![NewProblem {
                    responsible: ResponsibleParty::Power,
                    description: "Battery swap".into(),
                    notes: None,
                }],
            })
            .await
            .unwrap();

        let registry = StaticRegistry::new([
            Site::active("A", "Alpha", "talis5", "MALUKU"),
            Site::active("B", "Bravo", "talis5", "ACEH"),
            Site::active("C", "Charlie", "mix", "PAPUA BARAT"),
        ]);
        let agg = SlaAggregator::new(Arc::new(store), Arc::new(registry), SlaCache::disabled());

        let err = agg
            .daily_detail_report(DateRange::parse("2025-01-01", "2025-01-03").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SlaError::Validation(_)));

        let report = agg
            .daily_detail_report(DateRange::parse("2025-01-01", "2025-01-02").unwrap())
            .await
            .unwrap();

        let talis5 = &report.groups[0];
        assert_eq!(talis5.down[0].site_id, "A");
        assert_eq!(talis5.down[0].downtime.as_deref(), Some("1 days"));
        assert_eq!(talis5.under[0].site_id, "B");
        assert_eq!(talis5.under[0].problem.as_deref(), Some("Battery swap"));
        assert_eq!(talis5.under[0].downtime.as_deref(), Some("2 hours 30 minutes"));

        let mix = &report.groups[1];
        assert_eq!(mix.up[0].site_id, "C");
        assert!(report
            .groups
            .iter()
            .flat_map(|g| g.down.iter().chain(&g.under))
            .all(|s| s.site_id != "GHOST"));
    }

    #[tokio::test]
    async fn earlier_report_in_month_refreshes_cached_detail() {
        // ---
        let store = MemoryStore::new();
        store.insert_records(&[
            row("B", "2025-01-14", 99.0, None),
            row("B", "2025-01-15", 80.0, None),
        ]);
        let registry = StaticRegistry::new([Site::active("B", "Bravo", "talis5", "ACEH")]);
        let cache = SlaCache::new(Arc::new(MemoryBackend::new()));
        let agg = SlaAggregator::new(Arc::new(store.clone()), Arc::new(registry), cache.clone())
            .with_today(day("2025-06-01"));
        let range = DateRange::parse("2025-01-14", "2025-01-15").unwrap();

        let before = agg.daily_detail_report(range).await.unwrap();
        assert_eq!(before.groups[0].under[0].problem, None);

        let report = store
            .create_report(&NewReport {
                site_id: "B".into(),
                date: day("2025-01-10"),
                problems: vec![NewProblem {
                    responsible: ResponsibleParty::Power,
                    description: "Battery swap".into(),
                    notes: None,
                }],
            })
            .await
            .unwrap();
        cache
            .invalidate_by_date_range(DateRange::single(report.date))
            .await;

        let after = agg.daily_detail_report(range).await.unwrap();
        assert_eq!(after.groups[0].under[0].problem.as_deref(), Some("Battery swap"));
    }

    #[tokio::test]
    async fn report_outside_month_leaves_cached_detail() {
        // ---
        let cache = SlaCache::new(Arc::new(MemoryBackend::new()));
        let range = DateRange::parse("2025-01-14", "2025-01-15").unwrap();
        let key = CacheKey::for_range("detail", range)
            .depends_on(DateRange::new(first_of_month(range.start), range.end).unwrap());
        cache
            .get_or_compute(&key, crate::cache::LONG_TTL, || async {
                Ok::<_, SlaError>(1u8)
            })
            .await
            .unwrap();

        assert_eq!(cache.invalidate_by_date_range(DateRange::single(day("2024-12-31"))).await, 0);
        assert_eq!(cache.invalidate_by_date_range(DateRange::single(day("2025-01-01"))).await, 1);
    }
}
