//! Turning uploaded files into records
//!
//! CSV rows become records of strings keyed by the trimmed header. Workbook
//! rows keep their cell types: numbers stay numbers, booleans stay booleans.
//! Both parsers are deterministic: the same bytes give the same records.

use crate::error::IngestError;
use crate::record::{number_value, Record};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use encoding_rs::WINDOWS_1252;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::io::Cursor;
use tracing::{debug, info};

const SPREADSHEET_EXTENSIONS: &[&str] = &[".xls", ".xlsx", ".xlsm", ".xlsb", ".ods"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    Csv,
    Spreadsheet,
}

impl UploadFormat {
    /// Pick a parser from the file name, falling back to the mime type
    pub fn detect(file_name: &str, content_type: Option<&str>) -> Result<Self, IngestError> {
        let name = file_name.trim().to_ascii_lowercase();
        if name.ends_with(".csv") {
            return Ok(UploadFormat::Csv);
        }
        if SPREADSHEET_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
            return Ok(UploadFormat::Spreadsheet);
        }

        let mime = content_type.unwrap_or_default().to_ascii_lowercase();
        if mime.contains("excel") || mime.contains("spreadsheet") {
            Ok(UploadFormat::Spreadsheet)
        } else if mime.starts_with("text/csv") {
            Ok(UploadFormat::Csv)
        } else {
            Err(IngestError::UnsupportedFormat(if mime.is_empty() {
                file_name.to_string()
            } else {
                mime
            }))
        }
    }
}

/// Records parsed from one upload
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedUpload {
    pub records: Vec<Record>,
    /// `sha256:<hex>` of the raw bytes
    pub content_hash: String,
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Parse an upload, rejecting files that yield no records
pub fn ingest(format: UploadFormat, bytes: &[u8]) -> Result<IngestedUpload, IngestError> {
    let records = match format {
        UploadFormat::Csv => parse_csv(bytes)?,
        UploadFormat::Spreadsheet => parse_workbook(bytes)?,
    };
    if records.is_empty() {
        return Err(IngestError::Empty);
    }

    let content_hash = content_hash(bytes);
    info!(format = ?format, records = records.len(), %content_hash, "parsed upload");
    Ok(IngestedUpload {
        records,
        content_hash,
    })
}

// ============================================================================
// CSV
// ============================================================================

/// UTF-8 with optional BOM, otherwise Windows-1252
fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => {
            debug!("input is not UTF-8, decoding as Windows-1252");
            let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
            text
        }
    }
}

/// Comma-separated with a header row. Every value is kept as a string.
pub fn parse_csv(bytes: &[u8]) -> Result<Vec<Record>, IngestError> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let record: Record = headers
            .iter()
            .zip(row.iter())
            .filter(|(header, _)| !header.is_empty())
            .map(|(header, value)| (header.clone(), Value::String(value.to_string())))
            .collect();
        records.push(record);
    }

    debug!(columns = headers.len(), rows = records.len(), "parsed CSV");
    Ok(records)
}

// ============================================================================
// Workbook
// ============================================================================

fn header_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

/// JSON form of a cell. Empty and error cells have none.
fn cell_value(cell: &Data) -> Option<Value> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(s) => Some(Value::String(s.clone())),
        Data::Int(i) => Some(Value::from(*i)),
        Data::Float(f) => Some(number_value(*f)),
        Data::Bool(b) => Some(Value::Bool(*b)),
        Data::DateTime(dt) => Some(number_value(dt.as_f64())),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(Value::String(s.clone())),
    }
}

/// First sheet of an xls/xlsx/xlsb/ods workbook, first row as header
pub fn parse_workbook(bytes: &[u8]) -> Result<Vec<Record>, IngestError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| IngestError::Workbook(e.to_string()))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(IngestError::NoSheets)?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| IngestError::Workbook(e.to_string()))?;

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header_row.iter().map(header_text).collect();

    let records: Vec<Record> = rows
        .map(|row| {
            headers
                .iter()
                .zip(row)
                .filter(|(header, _)| !header.is_empty())
                .filter_map(|(header, cell)| cell_value(cell).map(|v| (header.clone(), v)))
                .collect::<Record>()
        })
        .filter(|record| !record.is_empty())
        .collect();

    debug!(sheet = %sheet_name, columns = headers.len(), rows = records.len(), "parsed workbook");
    Ok(records)
}
