//! Row sources
//!
//! Rows are plain maps from column label to raw text. The CSV reader keys
//! each record by the header row.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;

use tracing::{info, warn};

use crate::error::UploadError;
use crate::plan::UploadPlan;

/// One input row: column label -> raw text
pub type Row = BTreeMap<String, String>;

/// Read rows from CSV with a header line
pub fn read_csv<R: Read>(reader: R) -> Result<Vec<Row>, UploadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(reader);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| UploadError::RowSource(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut seen = BTreeSet::new();
    if let Some(duplicate) = headers.iter().find(|h| !seen.insert(h.as_str())) {
        return Err(UploadError::RowSource(format!(
            "duplicate column '{}' in header",
            duplicate
        )));
    }

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| UploadError::RowSource(format!("row {}: {}", line + 1, e)))?;
        rows.push(
            headers
                .iter()
                .cloned()
                .zip(record.iter().map(str::to_string))
                .collect(),
        );
    }
    Ok(rows)
}

pub fn read_csv_file(path: &Path) -> Result<Vec<Row>, UploadError> {
    let file = std::fs::File::open(path)?;
    let rows = read_csv(file)?;
    info!("Read {} rows from {}", rows.len(), path.display());
    Ok(rows)
}

/// Plan columns no row provides. Absent columns read as blank.
pub fn missing_columns(plan: &UploadPlan, rows: &[Row]) -> Vec<String> {
    let present: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();
    let missing: Vec<String> = plan
        .columns()
        .into_iter()
        .filter(|column| !present.contains(column))
        .map(str::to_string)
        .collect();
    if !missing.is_empty() && !rows.is_empty() {
        warn!("Plan columns missing from input: {}", missing.join(", "));
    }
    missing
}
