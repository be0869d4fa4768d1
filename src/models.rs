//! Data models for the SLA engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SlaError;

// ---

/// Sampling interval of raw telemetry; one record stands for this many minutes.
pub const INTERVAL_MINUTES: i64 = 5;

/// Battery hardware deployed at a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryVersion {
    Talis5,
    Mix,
    Jspro,
}

impl BatteryVersion {
    pub const ALL: [BatteryVersion; 3] =
        [BatteryVersion::Talis5, BatteryVersion::Mix, BatteryVersion::Jspro];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatteryVersion::Talis5 => "talis5",
            BatteryVersion::Mix => "mix",
            BatteryVersion::Jspro => "jspro",
        }
    }
}

impl FromStr for BatteryVersion {
    type Err = SlaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "talis5" => Ok(BatteryVersion::Talis5),
            "mix" => Ok(BatteryVersion::Mix),
            "jspro" => Ok(BatteryVersion::Jspro),
            other => Err(SlaError::validation(format!(
                "Unknown battery version '{other}', expected one of talis5, mix, jspro"
            ))),
        }
    }
}

impl fmt::Display for BatteryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status band for an SLA percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlaStatus {
    MeetSla,
    Fair,
    Poor,
    Bad,
    VeryBad,
}

impl SlaStatus {
    /// Classify an SLA percentage. Rules are evaluated in order and the first
    /// match wins, so exactly 95.5 is `Fair`. Values outside `[0, 100]`
    /// (negative, NaN) fall through to `VeryBad`.
    pub fn classify(sla: f64) -> SlaStatus {
        // ---
        if sla == 0.0 {
            SlaStatus::VeryBad
        } else if sla > 95.5 {
            SlaStatus::MeetSla
        } else if (75.0..=95.5).contains(&sla) {
            SlaStatus::Fair
        } else if (70.0..75.0).contains(&sla) {
            SlaStatus::Poor
        } else if sla > 0.0 && sla < 70.0 {
            SlaStatus::Bad
        } else {
            SlaStatus::VeryBad
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SlaStatus::MeetSla => "Meet SLA",
            SlaStatus::Fair => "Fair",
            SlaStatus::Poor => "Poor",
            SlaStatus::Bad => "Bad",
            SlaStatus::VeryBad => "Very Bad",
        }
    }

    /// Parse a status label, case-insensitively.
    pub fn from_label(label: &str) -> Option<SlaStatus> {
        let wanted = label.trim();
        [
            SlaStatus::MeetSla,
            SlaStatus::Fair,
            SlaStatus::Poor,
            SlaStatus::Bad,
            SlaStatus::VeryBad,
        ]
        .into_iter()
        .find(|s| s.label().eq_ignore_ascii_case(wanted))
    }
}

impl Serialize for SlaStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for SlaStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        SlaStatus::from_label(&label)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown SLA status '{label}'")))
    }
}

/// Service-problem status derived from a site's average SLA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpStatus {
    #[serde(rename = "Potensi SP")]
    Potensi,
    #[serde(rename = "Clear SP")]
    Clear,
}

impl SpStatus {
    pub fn from_average(avg: f64) -> SpStatus {
        if avg < 75.0 {
            SpStatus::Potensi
        } else {
            SpStatus::Clear
        }
    }

    pub fn from_label(label: &str) -> Option<SpStatus> {
        match label.trim().to_ascii_lowercase().as_str() {
            "potensi sp" => Some(SpStatus::Potensi),
            "clear sp" => Some(SpStatus::Clear),
            _ => None,
        }
    }
}

/// Party responsible for a reported problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponsibleParty {
    Vsat,
    Power,
    Snmp,
}

impl ResponsibleParty {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponsibleParty::Vsat => "VSAT",
            ResponsibleParty::Power => "POWER",
            ResponsibleParty::Snmp => "SNMP",
        }
    }
}

impl FromStr for ResponsibleParty {
    type Err = SlaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VSAT" => Ok(ResponsibleParty::Vsat),
            "POWER" => Ok(ResponsibleParty::Power),
            "SNMP" => Ok(ResponsibleParty::Snmp),
            other => Err(SlaError::validation(format!(
                "Unknown responsible party '{other}', expected VSAT, POWER or SNMP"
            ))),
        }
    }
}

/// Closed date interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, SlaError> {
        // ---
        if end < start {
            return Err(SlaError::validation(format!(
                "endDate {end} is before startDate {start}"
            )));
        }
        Ok(DateRange { start, end })
    }

    /// Parse `YYYY-MM-DD` bounds as received from query strings.
    pub fn parse(start: &str, end: &str) -> Result<Self, SlaError> {
        let start = parse_iso_date("startDate", start)?;
        let end = parse_iso_date("endDate", end)?;
        DateRange::new(start, end)
    }

    pub fn single(day: NaiveDate) -> Self {
        DateRange {
            start: day,
            end: day,
        }
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// First day of every calendar month the range touches.
    pub fn months(&self) -> Vec<NaiveDate> {
        // ---
        let mut months = Vec::new();
        let mut cursor = first_of_month(self.start);
        while cursor <= self.end {
            months.push(cursor);
            cursor = next_month(cursor);
        }
        months
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

pub fn parse_iso_date(field: &str, value: &str) -> Result<NaiveDate, SlaError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| SlaError::validation(format!("{field} must be YYYY-MM-DD, got '{value}'")))
}

pub fn first_of_month(day: NaiveDate) -> NaiveDate {
    day.with_day(1).unwrap_or(day)
}

pub fn next_month(first: NaiveDate) -> NaiveDate {
    // ---
    let (year, month) = if first.month() == 12 {
        (first.year() + 1, 1)
    } else {
        (first.year(), first.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(first)
}

/// Calendar-month token `YYYY-MM` scoping reason associations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period(String);

impl Period {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn of(day: NaiveDate) -> Period {
        Period(day.format("%Y-%m").to_string())
    }
}

impl TryFrom<String> for Period {
    type Error = SlaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        // ---
        let trimmed = value.trim();
        let valid = trimmed.len() == 7
            && NaiveDate::parse_from_str(&format!("{trimmed}-01"), "%Y-%m-%d").is_ok();
        if valid {
            Ok(Period(trimmed.to_string()))
        } else {
            Err(SlaError::validation(format!(
                "period must be YYYY-MM, got '{value}'"
            )))
        }
    }
}

impl From<Period> for String {
    fn from(p: Period) -> Self {
        p.0
    }
}

/// One raw telemetry sample, produced by the field devices.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RawIntervalRecord {
    // ---
    pub site_id: String,
    pub ts: DateTime<Utc>,
    pub battery_voltage: Option<f64>,
    pub load_current_1: Option<f64>,
    pub load_current_2: Option<f64>,
    pub pv1_voltage: Option<f64>,
    pub pv1_current: Option<f64>,
    pub pv2_voltage: Option<f64>,
    pub pv2_current: Option<f64>,
    pub energy_harvested_1: Option<f64>,
    pub energy_harvested_2: Option<f64>,
    pub energy_discharged_1: Option<f64>,
    pub energy_discharged_2: Option<f64>,
}

/// Business key of a daily SLA record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub site_id: String,
    pub date: NaiveDate,
}

/// Stored daily SLA row for one site.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SlaRecord {
    // ---
    pub id: i64,
    pub date: NaiveDate,
    pub site_id: String,
    pub pr_code: Option<String>,
    pub sla: Option<f64>,
    pub power_uptime: Option<f64>,
    pub power_downtime: Option<f64>,
    pub status_sla: Option<String>,
}

/// Daily SLA row as parsed from an upload, before insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSlaRecord {
    // ---
    pub date: NaiveDate,
    pub site_id: String,
    pub pr_code: Option<String>,
    pub sla: Option<f64>,
    pub power_uptime: Option<f64>,
    pub power_downtime: Option<f64>,
    pub status_sla: Option<String>,
}

impl NewSlaRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            site_id: self.site_id.clone(),
            date: self.date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaReportProblem {
    pub id: i64,
    pub report_id: i64,
    pub responsible: ResponsibleParty,
    pub description: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaReport {
    pub id: i64,
    pub site_id: String,
    pub date: NaiveDate,
    pub problems: Vec<SlaReportProblem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProblem {
    pub responsible: ResponsibleParty,
    pub description: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReport {
    pub site_id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub problems: Vec<NewProblem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemUpdate {
    pub responsible: Option<ResponsibleParty>,
    pub description: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SlaReason {
    pub id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BatteryVersionReason {
    pub id: i64,
    pub reason_id: i64,
    pub battery_version: String,
    pub period: String,
}

/// Association joined with its reason text.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AttachedReason {
    pub id: i64,
    pub reason_id: i64,
    pub reason: String,
    pub battery_version: String,
    pub period: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct HistoryGamas {
    pub id: i64,
    pub date: NaiveDate,
    pub description: String,
}

/// Up/down state reported by the NMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatusKind {
    Up,
    Down,
}

impl SiteStatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatusKind::Up => "up",
            SiteStatusKind::Down => "down",
        }
    }
}

impl FromStr for SiteStatusKind {
    type Err = SlaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(SiteStatusKind::Up),
            "down" => Ok(SiteStatusKind::Down),
            other => Err(SlaError::validation(format!(
                "status must be 'up' or 'down', got '{other}'"
            ))),
        }
    }
}

/// Current row in `site_downtime` / `site_up`, keyed by canonical site id.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SiteStatusRecord {
    pub site_id: String,
    pub site_name: Option<String>,
    pub terminal_id: Option<String>,
    pub down_since: Option<DateTime<Utc>>,
    pub down_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u32,
}

impl Pagination {
    pub fn new(page: u32, limit: u32, total: u64) -> Self {
        // ---
        let limit = limit.max(1);
        let total_pages = total.div_ceil(u64::from(limit)) as u32;
        Pagination {
            page,
            limit,
            total,
            total_pages,
        }
    }

    /// Index bounds of the requested page within a slice of `total` items.
    pub fn bounds(&self) -> (usize, usize) {
        let start = (self.page.saturating_sub(1) as usize).saturating_mul(self.limit as usize);
        let start = start.min(self.total as usize);
        let end = start.saturating_add(self.limit as usize).min(self.total as usize);
        (start, end)
    }
}

/// Envelope returned by every JSON endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        ApiResponse {
            success: true,
            message: None,
            data: Some(data),
            error: None,
            pagination: None,
        }
    }

    pub fn paginated(data: T, pagination: Pagination) -> Self {
        ApiResponse {
            pagination: Some(pagination),
            ..ApiResponse::ok(data)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl ApiResponse<()> {
    pub fn failure(error: impl Into<String>) -> Self {
        ApiResponse {
            success: false,
            message: None,
            data: None,
            error: Some(error.into()),
            pagination: None,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_status_boundaries() {
        // ---
        let cases = [
            (0.0, "Very Bad"),
            (69.99, "Bad"),
            (70.0, "Poor"),
            (74.99, "Poor"),
            (75.0, "Fair"),
            (95.5, "Fair"),
            (95.51, "Meet SLA"),
            (100.0, "Meet SLA"),
        ];
        for (sla, expected) in cases {
            assert_eq!(SlaStatus::classify(sla).label(), expected, "sla={sla}");
        }
    }

    #[test]
    fn test_status_is_total_over_percent_range() {
        // ---
        for step in 0..=10_000 {
            let sla = f64::from(step) / 100.0;
            let label = SlaStatus::classify(sla).label();
            assert!(SlaStatus::from_label(label).is_some());
        }
    }

    #[test]
    fn test_out_of_range_values_are_very_bad() {
        // ---
        assert_eq!(SlaStatus::classify(-3.0), SlaStatus::VeryBad);
        assert_eq!(SlaStatus::classify(f64::NAN), SlaStatus::VeryBad);
    }

    #[test]
    fn test_sp_status_threshold() {
        // ---
        assert_eq!(SpStatus::from_average(74.9), SpStatus::Potensi);
        assert_eq!(SpStatus::from_average(75.0), SpStatus::Clear);
    }

    #[test]
    fn test_range_overlap() {
        // ---
        let cached = DateRange::new(day(2025, 1, 10), day(2025, 1, 20)).unwrap();
        let touching = DateRange::new(day(2025, 1, 15), day(2025, 1, 25)).unwrap();
        let disjoint = DateRange::new(day(2025, 2, 1), day(2025, 2, 5)).unwrap();
        let edge = DateRange::single(day(2025, 1, 20));

        assert!(cached.overlaps(&touching));
        assert!(cached.overlaps(&edge));
        assert!(!cached.overlaps(&disjoint));
    }

    #[test]
    fn test_range_rejects_inverted_bounds() {
        // ---
        assert!(DateRange::parse("2025-01-10", "2025-01-09").is_err());
        assert!(DateRange::parse("2025-01-10", "10/01/2025").is_err());
    }

    #[test]
    fn test_range_months_cross_year() {
        // ---
        let range = DateRange::new(day(2024, 12, 20), day(2025, 2, 1)).unwrap();
        assert_eq!(
            range.months(),
            vec![day(2024, 12, 1), day(2025, 1, 1), day(2025, 2, 1)]
        );
    }

    #[test]
    fn test_period_validation() {
        // ---
        assert!(Period::try_from("2025-03".to_string()).is_ok());
        assert!(Period::try_from("2025-13".to_string()).is_err());
        assert!(Period::try_from("2025-3".to_string()).is_err());
        assert_eq!(Period::of(day(2025, 3, 9)).as_str(), "2025-03");
    }

    #[test]
    fn test_pagination_bounds() {
        // ---
        let p = Pagination::new(2, 10, 25);
        assert_eq!(p.total_pages, 3);
        assert_eq!(p.bounds(), (10, 20));

        let past_end = Pagination::new(5, 10, 25);
        assert_eq!(past_end.bounds(), (25, 25));
    }
}
