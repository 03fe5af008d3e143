//! Raw dataset reader: turns the Play Store CSV export into `RawRecord`s.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use playdex_core::RawRecord;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "playdex-source";

/// Header names the reader maps onto `RawRecord`. Any other column is ignored.
pub const KNOWN_COLUMNS: [&str; 22] = [
    "App Name",
    "App Id",
    "Category",
    "Rating",
    "Rating Count",
    "Installs",
    "Minimum Installs",
    "Maximum Installs",
    "Free",
    "Price",
    "Currency",
    "Size",
    "Minimum Android",
    "Developer Id",
    "Released",
    "Last Updated",
    "Content Rating",
    "Privacy Policy",
    "Ad Supported",
    "In App Purchases",
    "Editors Choice",
    "Scraped Time",
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("opening dataset {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading header row of {label}: {source}")]
    Header {
        label: String,
        #[source]
        source: csv::Error,
    },
    #[error("malformed row in {label} at line {line}: {source}")]
    Row {
        label: String,
        line: u64,
        #[source]
        source: csv::Error,
    },
    #[error("malformed row in {label} at line {line}: expected at most {expected} fields, found {found}")]
    FieldCount {
        label: String,
        line: u64,
        expected: usize,
        found: usize,
    },
}

/// Whole dataset held in memory, in file order.
#[derive(Debug, Clone, Default)]
pub struct RawDataset {
    pub label: String,
    pub headers: Vec<String>,
    pub records: Vec<RawRecord>,
}

impl RawDataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Known columns absent from the header row; those read as empty for every record.
    pub fn missing_columns(&self) -> Vec<&'static str> {
        KNOWN_COLUMNS
            .iter()
            .copied()
            .filter(|col| !self.headers.iter().any(|h| h == col))
            .collect()
    }
}

pub fn load_csv(path: &Path) -> Result<RawDataset, SourceError> {
    let file = File::open(path).map_err(|source| SourceError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    read_csv(
        BufReader::with_capacity(1 << 20, file),
        &path.display().to_string(),
    )
}

pub fn read_csv<R: Read>(reader: R, label: &str) -> Result<RawDataset, SourceError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::None)
        .from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|source| SourceError::Header {
            label: label.to_string(),
            source,
        })?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect::<Vec<_>>();
    let header_record = csv::StringRecord::from(headers.clone());

    // Short rows read their trailing columns as empty; long rows would shift columns.
    let mut records = Vec::new();
    for row in rdr.records() {
        let row = row.map_err(|source| SourceError::Row {
            label: label.to_string(),
            line: source.position().map(|p| p.line()).unwrap_or_default(),
            source,
        })?;
        let line = row.position().map(|p| p.line()).unwrap_or_default();
        if row.len() > header_record.len() {
            return Err(SourceError::FieldCount {
                label: label.to_string(),
                line,
                expected: header_record.len(),
                found: row.len(),
            });
        }
        let record = row
            .deserialize::<RawRecord>(Some(&header_record))
            .map_err(|source| SourceError::Row {
                label: label.to_string(),
                line,
                source,
            })?;
        records.push(record);
    }

    let dataset = RawDataset {
        label: label.to_string(),
        headers,
        records,
    };
    let missing = dataset.missing_columns();
    if !missing.is_empty() {
        warn!(dataset = label, ?missing, "dataset is missing known columns");
    }
    debug!(dataset = label, rows = dataset.len(), "read raw dataset");
    Ok(dataset)
}
