// Tabular export of listing batches (CSV / TSV / XLSX)
use crate::model::{Column, ExportDescriptor, ListingBatch, ListingRecord, WriteError};
use chrono::{DateTime, Datelike, SecondsFormat, Timelike, Utc};
use rust_xlsxwriter::{DocProperties, ExcelDateTime, Workbook, XlsxError};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::info;

pub trait Exporter {
    /// Writes the batch as one sheet and returns the number of data rows written.
    fn export(&self, batch: &ListingBatch, descriptor: &ExportDescriptor) -> Result<usize, WriteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Tsv,
    Xlsx,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Result<Self, WriteError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "tsv" => Ok(OutputFormat::Tsv),
            "xlsx" => Ok(OutputFormat::Xlsx),
            _ => Err(WriteError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Worksheet names Excel accepts: 1 to 31 characters, none of `[]:*?/\`,
/// not wrapped in apostrophes.
pub fn check_sheet_name(name: &str) -> Result<(), String> {
    let len = name.chars().count();
    if len == 0 || len > 31 {
        return Err(format!("sheet name '{}' must be 1 to 31 characters", name));
    }
    if let Some(bad) = name.chars().find(|c| "[]:*?/\\".contains(*c)) {
        return Err(format!("sheet name '{}' contains '{}'", name, bad));
    }
    if name.starts_with('\'') || name.ends_with('\'') {
        return Err(format!("sheet name '{}' cannot start or end with an apostrophe", name));
    }
    Ok(())
}

/// Renders the whole file in memory, then swaps it into place so a failed
/// export never leaves a truncated file at the destination.
pub struct SpreadsheetExporter;

impl SpreadsheetExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Exporter for SpreadsheetExporter {
    fn export(&self, batch: &ListingBatch, descriptor: &ExportDescriptor) -> Result<usize, WriteError> {
        let format = OutputFormat::from_path(&descriptor.path)?;
        let bytes = match format {
            OutputFormat::Csv => render_delimited(batch, &descriptor.columns, b',')?,
            OutputFormat::Tsv => render_delimited(batch, &descriptor.columns, b'\t')?,
            OutputFormat::Xlsx => render_xlsx(batch, descriptor)?,
        };
        write_atomic(&descriptor.path, &bytes)?;
        info!(
            "Saved {} rows to {} ({:?}, sheet '{}')",
            batch.len(),
            descriptor.path.display(),
            format,
            descriptor.sheet_name
        );
        Ok(batch.len())
    }
}

fn format_price(price: f64) -> String {
    if price.fract() == 0.0 {
        format!("{:.0}", price)
    } else {
        price.to_string()
    }
}

fn cell(record: &ListingRecord, column: Column) -> String {
    match column {
        Column::Identifier => record.id.clone(),
        Column::Name => record.name.clone().unwrap_or_default(),
        Column::Price => format_price(record.price),
        Column::Size => record.size.clone().unwrap_or_default(),
        Column::Availability => record.availability.as_str().to_string(),
        Column::Url => record.url.clone().unwrap_or_default(),
        Column::CapturedAt => record
            .captured_at
            .to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

fn render_delimited(batch: &ListingBatch, columns: &[Column], delimiter: u8) -> Result<Vec<u8>, WriteError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::new());
    writer.write_record(columns.iter().map(|c| c.header()))?;
    for record in batch.records() {
        writer.write_record(columns.iter().map(|c| cell(record, *c)))?;
    }
    writer.into_inner().map_err(|e| WriteError::Io(e.into_error()))
}

/// Document timestamp taken from the newest capture so the same batch always
/// yields the same bytes. Empty batches get a fixed date.
fn document_datetime(batch: &ListingBatch) -> Result<ExcelDateTime, XlsxError> {
    match batch.records().iter().map(|r| r.captured_at).max() {
        Some(at) => excel_datetime(at),
        None => ExcelDateTime::from_ymd(2000, 1, 1),
    }
}

fn excel_datetime(at: DateTime<Utc>) -> Result<ExcelDateTime, XlsxError> {
    let year = u16::try_from(at.year()).unwrap_or(2000);
    ExcelDateTime::from_ymd(year, at.month() as u8, at.day() as u8)?.and_hms(
        at.hour() as u16,
        at.minute() as u8,
        f64::from(at.second()),
    )
}

fn render_xlsx(batch: &ListingBatch, descriptor: &ExportDescriptor) -> Result<Vec<u8>, WriteError> {
    let mut workbook = Workbook::new();
    let created = document_datetime(batch)?;
    workbook.set_properties(&DocProperties::new().set_creation_datetime(&created));
    let sheet = workbook.add_worksheet();
    sheet.set_name(&descriptor.sheet_name)?;

    for (col, column) in descriptor.columns.iter().enumerate() {
        sheet.write_string(0, col as u16, column.header())?;
    }
    for (idx, record) in batch.records().iter().enumerate() {
        let row = (idx + 1) as u32;
        for (col, column) in descriptor.columns.iter().enumerate() {
            let col = col as u16;
            match column {
                Column::Price => {
                    sheet.write_number(row, col, record.price)?;
                }
                _ => {
                    sheet.write_string(row, col, cell(record, *column))?;
                }
            }
        }
    }

    Ok(workbook.save_to_buffer()?)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| WriteError::Io(e.error))?;
    Ok(())
}
