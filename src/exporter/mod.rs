pub mod spreadsheet;

pub use spreadsheet::{Exporter, OutputFormat, SpreadsheetExporter, check_sheet_name};
