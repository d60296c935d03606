// Core structs: Query, RawPage, ListingRecord, ListingBatch, ExportDescriptor
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

/// What a query points at: a search keyword or a direct listing URL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryTarget {
    Keyword(String),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub target: QueryTarget,
    /// 1-based page number.
    pub page: u32,
}

impl Query {
    pub fn keyword(keyword: impl Into<String>) -> Self {
        Self {
            target: QueryTarget::Keyword(keyword.into()),
            page: 1,
        }
    }

    #[cfg(test)]
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            target: QueryTarget::Url(url.into()),
            page: 1,
        }
    }

    /// Same target, different page. The original query is left untouched.
    pub fn at_page(&self, page: u32) -> Self {
        Self {
            target: self.target.clone(),
            page,
        }
    }

    pub fn label(&self) -> &str {
        match &self.target {
            QueryTarget::Keyword(k) => k,
            QueryTarget::Url(u) => u,
        }
    }
}

impl From<QueryTarget> for Query {
    fn from(target: QueryTarget) -> Self {
        Self { target, page: 1 }
    }
}

/// Page content as the browser rendered it, tied to the query that produced it.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub query: Query,
    /// Final URL after navigation (redirects included).
    pub url: String,
    pub html: String,
    /// No next-page indicator was found on this page.
    pub last_page: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    SoldOut,
    Unknown,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::SoldOut => "sold_out",
            Availability::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingRecord {
    pub id: String,
    pub name: Option<String>,
    pub price: f64,
    pub size: Option<String>,
    pub availability: Availability,
    pub url: Option<String>,
    pub captured_at: DateTime<Utc>,
}

/// Ordered listings: page order first, then in-page order.
#[derive(Debug, Clone, Default)]
pub struct ListingBatch {
    records: Vec<ListingRecord>,
}

impl ListingBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = ListingRecord>) {
        self.records.extend(records);
    }

    pub fn append(&mut self, other: ListingBatch) {
        self.records.extend(other.records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ListingRecord] {
        &self.records
    }

    /// Keeps the first record for every identifier and returns how many were removed.
    pub fn dedupe_by_identifier(&mut self) -> usize {
        let before = self.records.len();
        let mut seen = HashSet::new();
        self.records.retain(|r| seen.insert(r.id.clone()));
        before - self.records.len()
    }
}

impl FromIterator<ListingRecord> for ListingBatch {
    fn from_iter<T: IntoIterator<Item = ListingRecord>>(iter: T) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Identifier,
    Name,
    Price,
    Size,
    Availability,
    Url,
    CapturedAt,
}

impl Column {
    pub const DEFAULT_ORDER: [Column; 7] = [
        Column::Identifier,
        Column::Name,
        Column::Price,
        Column::Size,
        Column::Availability,
        Column::Url,
        Column::CapturedAt,
    ];

    pub fn header(&self) -> &'static str {
        match self {
            Column::Identifier => "identifier",
            Column::Name => "name",
            Column::Price => "price",
            Column::Size => "size",
            Column::Availability => "availability",
            Column::Url => "url",
            Column::CapturedAt => "captured_at",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportDescriptor {
    pub path: PathBuf,
    pub sheet_name: String,
    pub columns: Vec<Column>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("blocked at {url}: {reason}")]
    Blocked { url: String, reason: String },
    #[error("browser session error: {0}")]
    Session(String),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("expected anchor `{0}` not found, page layout may have changed")]
    MissingAnchor(String),
    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("XLSX error: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),
    #[error("unsupported destination format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
