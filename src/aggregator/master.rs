//! Master view: one row per site over a date range, filtered and paginated
//! in memory.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{average, provinces, round_to, SlaAggregator};
use crate::cache::{ttl_for_range, CacheKey};
use crate::error::{SlaError, SlaResult};
use crate::models::{
    BatteryVersion, DateRange, Pagination, ResponsibleParty, SlaRecord, SlaReport, SlaStatus,
    SpStatus,
};
use crate::registry::{RegistrySnapshot, SiteDetails};
use crate::store::RecordFilter;

// ---

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Filters accepted by the master view. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterFilters {
    /// Substring of the site id or site name, case-insensitive.
    pub search: Option<String>,
    pub battery_version: Option<BatteryVersion>,
    pub sla_min: Option<f64>,
    pub sla_max: Option<f64>,
    /// Status band label, e.g. "Meet SLA".
    pub status: Option<String>,
    /// Province name or province group ("Maluku", "Papua").
    pub province: Option<String>,
    pub responsible: Option<ResponsibleParty>,
    /// "Potensi SP" or "Clear SP".
    pub sp_status: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterRow {
    pub site_id: String,
    pub site_name: String,
    pub province: Option<String>,
    pub battery_version: Option<BatteryVersion>,
    pub install_date: Option<NaiveDate>,
    pub average_sla: Option<f64>,
    pub status: Option<SlaStatus>,
    pub sp_status: Option<SpStatus>,
    pub days_reported: usize,
    pub total_downtime_hours: f64,
    pub responsible: Vec<ResponsibleParty>,
    pub latest_problem: Option<String>,
    /// `YYYY-MM-DD` -> SLA for that day.
    pub daily: BTreeMap<String, Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterPage {
    pub rows: Vec<MasterRow>,
    pub pagination: Pagination,
}

/// Parsed form of the label filters, validated once up front.
struct Criteria<'a> {
    filters: &'a MasterFilters,
    search: Option<String>,
    status: Option<SlaStatus>,
    sp_status: Option<SpStatus>,
}

impl<'a> Criteria<'a> {
    fn parse(filters: &'a MasterFilters) -> SlaResult<Self> {
        // ---
        let status = match non_blank(&filters.status) {
            Some(label) => Some(SlaStatus::from_label(label).ok_or_else(|| {
                SlaError::validation(format!("Unknown SLA status '{label}'"))
            })?),
            None => None,
        };
        let sp_status = match non_blank(&filters.sp_status) {
            Some(label) => Some(SpStatus::from_label(label).ok_or_else(|| {
                SlaError::validation(format!("spStatus must be 'Potensi SP' or 'Clear SP', got '{label}'"))
            })?),
            None => None,
        };
        if let (Some(min), Some(max)) = (filters.sla_min, filters.sla_max) {
            if min > max {
                return Err(SlaError::validation("slaMin must not exceed slaMax"));
            }
        }
        Ok(Criteria {
            filters,
            search: non_blank(&filters.search).map(str::to_lowercase),
            status,
            sp_status,
        })
    }

    fn accepts(&self, row: &MasterRow) -> bool {
        // ---
        let f = self.filters;
        if let Some(needle) = &self.search {
            let hit = row.site_id.to_lowercase().contains(needle)
                || row.site_name.to_lowercase().contains(needle);
            if !hit {
                return false;
            }
        }
        if f.battery_version.is_some() && row.battery_version != f.battery_version {
            return false;
        }
        if let Some(province) = non_blank(&f.province) {
            if !provinces::matches(province, row.province.as_deref()) {
                return false;
            }
        }
        if let Some(min) = f.sla_min {
            if !row.average_sla.is_some_and(|avg| avg >= min) {
                return false;
            }
        }
        if let Some(max) = f.sla_max {
            if !row.average_sla.is_some_and(|avg| avg <= max) {
                return false;
            }
        }
        if self.status.is_some() && row.status != self.status {
            return false;
        }
        if self.sp_status.is_some() && row.sp_status != self.sp_status {
            return false;
        }
        if let Some(responsible) = f.responsible {
            if !row.responsible.contains(&responsible) {
                return false;
            }
        }
        true
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn build_row(
    site_id: &str,
    details: &SiteDetails,
    records: &[&SlaRecord],
    reports: &[&SlaReport],
) -> MasterRow {
    // ---
    let average_sla = average(records.iter().filter_map(|r| r.sla)).map(|a| round_to(a, 2));

    let responsible: BTreeSet<ResponsibleParty> = reports
        .iter()
        .flat_map(|r| r.problems.iter().map(|p| p.responsible))
        .collect();

    let latest_problem = reports
        .iter()
        .filter(|r| !r.problems.is_empty())
        .max_by_key(|r| r.date)
        .and_then(|r| r.problems.iter().max_by_key(|p| p.id))
        .map(|p| p.description.clone());

    MasterRow {
        site_id: site_id.to_string(),
        site_name: details.name.clone(),
        province: details.province.clone(),
        battery_version: details.battery_version,
        install_date: details.install_date,
        average_sla,
        status: average_sla.map(SlaStatus::classify),
        sp_status: average_sla.map(SpStatus::from_average),
        days_reported: records.iter().filter(|r| r.sla.is_some()).count(),
        total_downtime_hours: round_to(records.iter().filter_map(|r| r.power_downtime).sum(), 2),
        responsible: responsible.into_iter().collect(),
        latest_problem,
        daily: records
            .iter()
            .map(|r| (r.date.format("%Y-%m-%d").to_string(), r.sla))
            .collect(),
    }
}

/// Every site with data in the range, enriched from the registry. Sites the
/// registry does not know are dropped.
fn build_rows(
    snapshot: &RegistrySnapshot,
    records: &[SlaRecord],
    reports: &[SlaReport],
) -> Vec<MasterRow> {
    // ---
    let mut by_site: BTreeMap<&str, Vec<&SlaRecord>> = BTreeMap::new();
    for record in records {
        by_site.entry(record.site_id.as_str()).or_default().push(record);
    }
    let mut reports_by_site: HashMap<&str, Vec<&SlaReport>> = HashMap::new();
    for report in reports {
        reports_by_site
            .entry(report.site_id.as_str())
            .or_default()
            .push(report);
    }

    by_site
        .into_iter()
        .filter_map(|(site_id, site_records)| {
            let details = snapshot.details(site_id)?;
            let site_reports = reports_by_site
                .get(site_id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            Some(build_row(site_id, details, &site_records, site_reports))
        })
        .collect()
}

/// Page (1-based) and page size after defaults and clamping.
fn page_and_limit(filters: &MasterFilters) -> (u32, u32) {
    let page = filters.page.unwrap_or(1).max(1);
    let limit = filters
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    (page, limit)
}

/// Requests that resolve to the same page share a key.
fn master_key(range: DateRange, filters: &MasterFilters) -> CacheKey {
    let (page, limit) = page_and_limit(filters);
    let effective = MasterFilters {
        page: Some(page),
        limit: Some(limit),
        ..filters.clone()
    };
    CacheKey::hashed("master", range, &effective)
}

impl SlaAggregator {
    /// Filter every site's row for `range`, then slice out the requested page.
    pub async fn master(&self, range: DateRange, filters: &MasterFilters) -> SlaResult<MasterPage> {
        // ---
        let criteria = Criteria::parse(filters)?;
        let (page, limit) = page_and_limit(filters);

        let key = master_key(range, filters);
        let criteria = &criteria;
        self.cache
            .get_or_compute(&key, ttl_for_range(range, self.today()), move || async move {
                let records = self.store.fetch_records(&RecordFilter::between(range)).await?;
                let reports = self.store.fetch_reports(range, None).await?;
                let snapshot = self.registry.snapshot().await?;

                let matching: Vec<MasterRow> = build_rows(&snapshot, &records, &reports)
                    .into_iter()
                    .filter(|row| criteria.accepts(row))
                    .collect();

                let pagination = Pagination::new(page, limit, matching.len() as u64);
                let (start, end) = pagination.bounds();
                let rows = matching
                    .into_iter()
                    .skip(start)
                    .take(end - start)
                    .collect();
                Ok(MasterPage { rows, pagination })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::Arc;

    use crate::cache::SlaCache;
    use crate::models::{NewProblem, NewReport, NewSlaRecord};
    use crate::registry::{Site, StaticRegistry};
    use crate::store::{MemoryStore, SlaStore};

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn row(site: &str, date: &str, sla: f64) -> NewSlaRecord {
        NewSlaRecord {
            date: day(date),
            site_id: site.to_string(),
            pr_code: None,
            sla: Some(sla),
            power_uptime: None,
            power_downtime: Some(1.0),
            status_sla: None,
        }
    }

    async fn fixture() -> SlaAggregator {
        // ---
        let store = MemoryStore::new();
        store.insert_records(&[
            row("S1", "2025-01-01", 100.0),
            row("S1", "2025-01-02", 98.0),
            row("S2", "2025-01-01", 60.0),
            row("S2", "2025-01-02", 70.0),
            row("S3", "2025-01-01", 80.0),
            row("S4", "2025-01-01", 0.0),
            row("UNREGISTERED", "2025-01-01", 50.0),
        ]);
        store
            .create_report(&NewReport {
                site_id: "S2".into(),
                date: day("2025-01-02"),
                problems: vec![NewProblem {
                    responsible: ResponsibleParty::Vsat,
                    description: "Modem offline".into(),
                    notes: None,
                }],
            })
            .await
            .unwrap();

        let registry = StaticRegistry::new([
            Site::active("S1", "Ambon Hub", "talis5", "MALUKU"),
            Site::active("S2", "Ternate", "mix", "MALUKU UTARA"),
            Site::active("S3", "Sorong", "jspro", "PAPUA BARAT DAYA"),
            Site::active("S4", "Banda Aceh", "talis5", "ACEH"),
        ]);
        SlaAggregator::new(Arc::new(store), Arc::new(registry), SlaCache::disabled())
    }

    fn jan() -> DateRange {
        DateRange::parse("2025-01-01", "2025-01-31").unwrap()
    }

    fn ids(page: &MasterPage) -> Vec<&str> {
        page.rows.iter().map(|r| r.site_id.as_str()).collect()
    }

    #[tokio::test]
    async fn rows_are_enriched_and_unknown_sites_dropped() {
        // ---
        let agg = fixture().await;
        let page = agg.master(jan(), &MasterFilters::default()).await.unwrap();

        assert_eq!(ids(&page), ["S1", "S2", "S3", "S4"]);
        let s2 = &page.rows[1];
        assert_eq!(s2.average_sla, Some(65.0));
        assert_eq!(s2.status, Some(SlaStatus::Bad));
        assert_eq!(s2.sp_status, Some(SpStatus::Potensi));
        assert_eq!(s2.responsible, vec![ResponsibleParty::Vsat]);
        assert_eq!(s2.latest_problem.as_deref(), Some("Modem offline"));
        assert_eq!(s2.total_downtime_hours, 2.0);
        assert_eq!(page.rows[0].sp_status, Some(SpStatus::Clear));
    }

    #[tokio::test]
    async fn province_groups_and_search_filter() {
        // ---
        let agg = fixture().await;

        let maluku = MasterFilters {
            province: Some("Maluku".into()),
            ..MasterFilters::default()
        };
        assert_eq!(ids(&agg.master(jan(), &maluku).await.unwrap()), ["S1", "S2"]);

        let papua = MasterFilters {
            province: Some("papua".into()),
            ..MasterFilters::default()
        };
        assert_eq!(ids(&agg.master(jan(), &papua).await.unwrap()), ["S3"]);

        let search = MasterFilters {
            search: Some("aceh".into()),
            ..MasterFilters::default()
        };
        assert_eq!(ids(&agg.master(jan(), &search).await.unwrap()), ["S4"]);
    }

    #[tokio::test]
    async fn numeric_status_and_responsible_filters() {
        // ---
        let agg = fixture().await;

        let range_filter = MasterFilters {
            sla_min: Some(60.0),
            sla_max: Some(90.0),
            ..MasterFilters::default()
        };
        assert_eq!(ids(&agg.master(jan(), &range_filter).await.unwrap()), ["S2", "S3"]);

        let very_bad = MasterFilters {
            status: Some("very bad".into()),
            ..MasterFilters::default()
        };
        assert_eq!(ids(&agg.master(jan(), &very_bad).await.unwrap()), ["S4"]);

        let clear = MasterFilters {
            sp_status: Some("Clear SP".into()),
            battery_version: Some(BatteryVersion::Talis5),
            ..MasterFilters::default()
        };
        assert_eq!(ids(&agg.master(jan(), &clear).await.unwrap()), ["S1"]);

        let vsat = MasterFilters {
            responsible: Some(ResponsibleParty::Vsat),
            ..MasterFilters::default()
        };
        assert_eq!(ids(&agg.master(jan(), &vsat).await.unwrap()), ["S2"]);

        let bogus = MasterFilters {
            status: Some("Excellent".into()),
            ..MasterFilters::default()
        };
        assert!(agg.master(jan(), &bogus).await.is_err());
    }

    #[tokio::test]
    async fn pagination_applies_after_filtering() {
        // ---
        let agg = fixture().await;
        let filters = MasterFilters {
            page: Some(2),
            limit: Some(3),
            ..MasterFilters::default()
        };
        let page = agg.master(jan(), &filters).await.unwrap();

        assert_eq!(ids(&page), ["S4"]);
        assert_eq!(page.pagination.total, 4);
        assert_eq!(page.pagination.total_pages, 2);
    }

    #[test]
    fn equivalent_paging_shares_a_cache_key() {
        // ---
        let defaults = MasterFilters::default();
        let explicit = MasterFilters {
            page: Some(1),
            limit: Some(DEFAULT_PAGE_SIZE),
            ..MasterFilters::default()
        };
        assert_eq!(master_key(jan(), &defaults), master_key(jan(), &explicit));

        let oversized = MasterFilters {
            limit: Some(5000),
            ..MasterFilters::default()
        };
        let capped = MasterFilters {
            limit: Some(MAX_PAGE_SIZE),
            ..MasterFilters::default()
        };
        assert_eq!(master_key(jan(), &oversized), master_key(jan(), &capped));

        let second = MasterFilters {
            page: Some(2),
            ..MasterFilters::default()
        };
        assert_ne!(master_key(jan(), &defaults), master_key(jan(), &second));
    }
}
