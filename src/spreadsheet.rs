//! Upload parser for daily SLA spreadsheets.
//!
//! Columns are located by header text, so reordered files still parse. Rows
//! with a missing or unreadable date or site id are reported individually and
//! never abort the parse; a missing required header rejects the whole file.
//! Registry validation and de-duplication happen later in the bulk loader.

use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::error::{SlaError, SlaResult};
use crate::models::NewSlaRecord;

// ---

/// How far down the sheet the header row may appear.
const HEADER_SEARCH_ROWS: usize = 10;

/// Textual date layouts accepted in string cells, tried in order.
const TEXT_DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%m/%d/%Y"];

/// Largest serial Excel can represent (9999-12-31).
const MAX_EXCEL_SERIAL: f64 = 2_958_465.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Date,
    SiteId,
    PrCode,
    Sla,
    PowerUptime,
    PowerDowntime,
    StatusSla,
}

const COLUMN_ALIASES: &[(Column, &[&str])] = &[
    (Column::Date, &["date", "tanggal"]),
    (Column::SiteId, &["site id", "siteid", "site_id"]),
    (Column::PrCode, &["pr code", "prcode", "pr_code", "kode pr"]),
    (Column::Sla, &["sla", "sla (%)", "sla %", "sla(%)"]),
    (Column::PowerUptime, &["power uptime", "uptime"]),
    (Column::PowerDowntime, &["power downtime", "downtime"]),
    (Column::StatusSla, &["status sla", "status"]),
];

/// Per-row problem, with the 1-based sheet row number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowError {
    pub row: usize,
    pub message: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ParsedUpload {
    pub rows: Vec<NewSlaRecord>,
    pub errors: Vec<RowError>,
}

#[derive(Debug, Default)]
struct ColumnMap {
    date: Option<usize>,
    site_id: Option<usize>,
    pr_code: Option<usize>,
    sla: Option<usize>,
    power_uptime: Option<usize>,
    power_downtime: Option<usize>,
    status_sla: Option<usize>,
}

impl ColumnMap {
    fn from_header(cells: &[Data]) -> ColumnMap {
        // ---
        let mut map = ColumnMap::default();
        for (idx, cell) in cells.iter().enumerate() {
            let header = normalize_header(&cell_text(cell).unwrap_or_default());
            let Some(column) = COLUMN_ALIASES
                .iter()
                .find(|(_, aliases)| aliases.contains(&header.as_str()))
                .map(|(column, _)| *column)
            else {
                continue;
            };
            let slot = match column {
                Column::Date => &mut map.date,
                Column::SiteId => &mut map.site_id,
                Column::PrCode => &mut map.pr_code,
                Column::Sla => &mut map.sla,
                Column::PowerUptime => &mut map.power_uptime,
                Column::PowerDowntime => &mut map.power_downtime,
                Column::StatusSla => &mut map.status_sla,
            };
            // First matching header wins.
            slot.get_or_insert(idx);
        }
        map
    }

    fn has_required(&self) -> bool {
        self.date.is_some() && self.site_id.is_some()
    }

    fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.date.is_none() {
            missing.push("Date");
        }
        if self.site_id.is_none() {
            missing.push("Site ID");
        }
        missing
    }
}

fn normalize_header(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn cell_text(cell: &Data) -> Option<String> {
    // ---
    let text = match cell {
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::Error(_) | Data::Empty => String::new(),
    };
    (!text.is_empty()).then_some(text)
}

fn is_blank(cell: &Data) -> bool {
    cell_text(cell).is_none()
}

/// Convert an Excel serial day number (1900 date system) to a date.
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    // ---
    if !serial.is_finite() || serial < 1.0 || serial > MAX_EXCEL_SERIAL {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_signed(Duration::days(serial.floor() as i64))
}

fn parse_text_date(raw: &str) -> Option<NaiveDate> {
    // ---
    let raw = raw.trim();
    // Drop any time component ("2025-01-01 00:00:00", "2025-01-01T00:00:00Z").
    let date_part = raw.split([' ', 'T']).next().unwrap_or(raw);
    TEXT_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

fn coerce_date(cell: &Data) -> Option<NaiveDate> {
    match cell {
        Data::Float(f) => excel_serial_to_date(*f),
        Data::Int(i) => excel_serial_to_date(*i as f64),
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64()),
        Data::String(s) | Data::DateTimeIso(s) => parse_text_date(s),
        _ => None,
    }
}

/// Numbers, tolerating a trailing `%` and surrounding whitespace.
fn coerce_number(cell: &Data) -> Option<f64> {
    // ---
    match cell {
        Data::Float(f) if f.is_finite() => Some(*f),
        Data::Int(i) => Some(*i as f64),
        Data::String(s) => {
            let trimmed = s.trim().trim_end_matches('%').trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed
                .parse::<f64>()
                .ok()
                .or_else(|| trimmed.replace(',', ".").parse::<f64>().ok())
                .filter(|v| v.is_finite())
        }
        _ => None,
    }
}

fn cell_at(row: &[Data], idx: Option<usize>) -> &Data {
    const EMPTY: &Data = &Data::Empty;
    idx.and_then(|i| row.get(i)).unwrap_or(EMPTY)
}

/// Parse a table whose first few rows contain the header row. `first_row` is
/// the 0-based sheet row of `rows[0]`, so reported row numbers match the sheet.
fn parse_table(rows: &[Vec<Data>], first_row: usize) -> SlaResult<ParsedUpload> {
    // ---
    let (header_idx, columns) = rows
        .iter()
        .take(HEADER_SEARCH_ROWS.saturating_sub(first_row))
        .enumerate()
        .map(|(idx, row)| (idx, ColumnMap::from_header(row)))
        .find(|(_, map)| map.has_required())
        .ok_or_else(|| {
            let first = rows
                .first()
                .map(|r| ColumnMap::from_header(r))
                .unwrap_or_default();
            SlaError::validation(format!(
                "Missing required column(s): {}",
                first.missing_required().join(", ")
            ))
        })?;

    let mut parsed = ParsedUpload::default();

    for (idx, row) in rows.iter().enumerate().skip(header_idx + 1) {
        let row_number = first_row + idx + 1;
        if row.iter().all(is_blank) {
            continue;
        }

        let date_cell = cell_at(row, columns.date);
        let date = coerce_date(date_cell);
        let site_id = cell_text(cell_at(row, columns.site_id));

        let (date, site_id) = match (date, site_id) {
            (Some(date), Some(site_id)) => (date, site_id),
            (None, _) if is_blank(date_cell) => {
                parsed.errors.push(RowError {
                    row: row_number,
                    message: "Date is empty".to_string(),
                });
                continue;
            }
            (None, _) => {
                parsed.errors.push(RowError {
                    row: row_number,
                    message: format!(
                        "Unrecognized date '{}'",
                        cell_text(date_cell).unwrap_or_default()
                    ),
                });
                continue;
            }
            (Some(_), None) => {
                parsed.errors.push(RowError {
                    row: row_number,
                    message: "Site ID is empty".to_string(),
                });
                continue;
            }
        };

        parsed.rows.push(NewSlaRecord {
            date,
            site_id,
            pr_code: cell_text(cell_at(row, columns.pr_code)),
            sla: coerce_number(cell_at(row, columns.sla)),
            power_uptime: coerce_number(cell_at(row, columns.power_uptime)),
            power_downtime: coerce_number(cell_at(row, columns.power_downtime)),
            status_sla: cell_text(cell_at(row, columns.status_sla)),
        });
    }

    tracing::debug!(
        "Parsed {} rows ({} row errors), header at row {}",
        parsed.rows.len(),
        parsed.errors.len(),
        first_row + header_idx + 1
    );
    Ok(parsed)
}

/// Parse an xlsx/xls/ods workbook. Uses the sheet named "SLA" when present,
/// otherwise the first sheet.
pub fn parse_workbook(bytes: &[u8]) -> SlaResult<ParsedUpload> {
    // ---
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| SlaError::Spreadsheet(format!("unreadable workbook: {e}")))?;

    let names = workbook.sheet_names();
    let sheet = names
        .iter()
        .find(|n| n.trim().eq_ignore_ascii_case("sla"))
        .or_else(|| names.first())
        .cloned()
        .ok_or_else(|| SlaError::Spreadsheet("workbook has no sheets".to_string()))?;

    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| SlaError::Spreadsheet(format!("cannot read sheet '{sheet}': {e}")))?;

    // The range begins at the first non-empty cell, not at sheet row 1.
    let first_row = range.start().map_or(0, |(row, _)| row as usize);
    let rows: Vec<Vec<Data>> = range.rows().map(|r| r.to_vec()).collect();
    parse_table(&rows, first_row)
}

/// Parse a CSV export with the same header rules as workbooks.
pub fn parse_csv(bytes: &[u8]) -> SlaResult<ParsedUpload> {
    // ---
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| SlaError::Spreadsheet(format!("invalid CSV: {e}")))?;
        rows.push(
            record
                .iter()
                .map(|field| {
                    if field.trim().is_empty() {
                        Data::Empty
                    } else {
                        Data::String(field.to_string())
                    }
                })
                .collect(),
        );
    }
    parse_table(&rows, 0)
}

/// Parse an uploaded file, dispatching on its extension.
pub fn parse(bytes: &[u8], file_name: Option<&str>) -> SlaResult<ParsedUpload> {
    let is_csv = file_name
        .map(|n| n.trim().to_ascii_lowercase().ends_with(".csv"))
        .unwrap_or(false);
    if is_csv {
        parse_csv(bytes)
    } else {
        parse_workbook(bytes)
    }
}
