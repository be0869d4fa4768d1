//! Raw interval telemetry rendered as an xlsx workbook.

use rust_xlsxwriter::{Format, Workbook, XlsxError};

use crate::error::SlaError;
use crate::models::RawIntervalRecord;

// ---

pub const SHEET_NAME: &str = "Telemetry";

const HEADERS: [&str; 13] = [
    "Site ID",
    "Timestamp (UTC)",
    "Battery Voltage",
    "Load Current 1",
    "Load Current 2",
    "PV1 Voltage",
    "PV1 Current",
    "PV2 Voltage",
    "PV2 Current",
    "Energy Harvested 1",
    "Energy Harvested 2",
    "Energy Discharged 1",
    "Energy Discharged 2",
];

impl From<XlsxError> for SlaError {
    fn from(err: XlsxError) -> Self {
        SlaError::Export(err.to_string())
    }
}

fn measurements(record: &RawIntervalRecord) -> [Option<f64>; 11] {
    [
        record.battery_voltage,
        record.load_current_1,
        record.load_current_2,
        record.pv1_voltage,
        record.pv1_current,
        record.pv2_voltage,
        record.pv2_current,
        record.energy_harvested_1,
        record.energy_harvested_2,
        record.energy_discharged_1,
        record.energy_discharged_2,
    ]
}

/// One header row, then one row per record in the given order. Missing
/// measurements are left as blank cells.
pub fn telemetry_workbook(records: &[RawIntervalRecord]) -> Result<Vec<u8>, SlaError> {
    // ---
    let mut workbook = Workbook::new();
    let header = Format::new().set_bold();

    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;

    for (col, title) in HEADERS.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *title, &header)?;
    }
    sheet.set_column_width(1, 20)?;

    for (idx, record) in records.iter().enumerate() {
        let row = u32::try_from(idx + 1)
            .map_err(|_| SlaError::Export("too many rows for one sheet".to_string()))?;

        sheet.write_string(row, 0, &record.site_id)?;
        sheet.write_string(row, 1, record.ts.format("%Y-%m-%d %H:%M:%S").to_string())?;
        for (offset, value) in measurements(record).into_iter().enumerate() {
            if let Some(value) = value {
                sheet.write_number(row, 2 + offset as u16, value)?;
            }
        }
    }

    Ok(workbook.save_to_buffer()?)
}
