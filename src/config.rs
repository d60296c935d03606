use crate::exporter::{OutputFormat, check_sheet_name};
use crate::model::{Column, ConfigError, ExportDescriptor, Query, QueryTarget};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chrome,
    Edge,
    Chromium,
}

/// Listing fields the extractor knows how to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Identifier,
    Name,
    Price,
    Size,
    Availability,
    Url,
}

impl Field {
    pub fn is_critical(&self) -> bool {
        matches!(self, Field::Identifier | Field::Price)
    }
}

/// CSS selector relative to one listing item. Text content is used unless
/// `attribute` names an attribute to read instead.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldRule {
    pub selector: String,
    #[serde(default)]
    pub attribute: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorRules {
    /// Container that must exist on every listing page.
    pub list_anchor: String,
    /// One listing entry, searched inside the anchor.
    pub item: String,
    /// Element whose presence means the page finished rendering. Defaults to the anchor.
    #[serde(default)]
    pub ready_selector: Option<String>,
    /// "Next page" control; its absence marks the last page.
    #[serde(default)]
    pub next_page: Option<String>,
    pub fields: BTreeMap<Field, FieldRule>,
    #[serde(default = "default_sold_out_markers")]
    pub sold_out_markers: Vec<String>,
}

impl SelectorRules {
    pub fn ready_selector(&self) -> &str {
        self.ready_selector.as_deref().unwrap_or(&self.list_anchor)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub browser: Browser,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,
    #[serde(default = "default_columns")]
    pub columns: Vec<Column>,
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    #[serde(default)]
    pub driver_binary: Option<PathBuf>,
    #[serde(default)]
    pub browser_binary: Option<String>,
    #[serde(default)]
    pub search_url_template: Option<String>,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    pub queries: Vec<QueryTarget>,
    pub rules: SelectorRules,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub dedupe: bool,
    #[serde(default)]
    pub page_delay_millis: u64,
    #[serde(default)]
    pub scroll_rounds: u32,
    #[serde(default = "default_settle_millis")]
    pub settle_millis: u64,
    #[serde(default = "default_blocked_url_markers")]
    pub blocked_url_markers: Vec<String>,
    #[serde(default)]
    pub blocked_selectors: Vec<String>,
    #[serde(default)]
    pub reveal_selector: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_pages() -> u32 {
    5
}

fn default_timeout_seconds() -> u64 {
    15
}

fn default_output_path() -> PathBuf {
    PathBuf::from("listings.xlsx")
}

fn default_sheet_name() -> String {
    "listings".to_string()
}

fn default_columns() -> Vec<Column> {
    Column::DEFAULT_ORDER.to_vec()
}

fn default_webdriver_url() -> String {
    "http://localhost:9515".to_string()
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_settle_millis() -> u64 {
    1000
}

fn default_blocked_url_markers() -> Vec<String> {
    vec!["captcha".to_string(), "/login".to_string()]
}

fn default_sold_out_markers() -> Vec<String> {
    vec!["sold out".to_string(), "품절".to_string()]
}

impl AppConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn queries(&self) -> Vec<Query> {
        self.queries.iter().cloned().map(Query::from).collect()
    }

    pub fn export_descriptor(&self) -> ExportDescriptor {
        ExportDescriptor {
            path: self.output_path.clone(),
            sheet_name: self.sheet_name.clone(),
            columns: self.columns.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queries.is_empty() {
            return Err(ConfigError::Invalid("at least one query is required".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::Invalid("timeout_seconds must be positive".into()));
        }
        if self.columns.is_empty() {
            return Err(ConfigError::Invalid("columns must not be empty".into()));
        }
        let format = OutputFormat::from_path(&self.output_path)
            .map_err(|e| ConfigError::Invalid(format!("output_path: {}", e)))?;
        if format == OutputFormat::Xlsx {
            check_sheet_name(&self.sheet_name).map_err(ConfigError::Invalid)?;
        }
        let has_keyword = self
            .queries
            .iter()
            .any(|q| matches!(q, QueryTarget::Keyword(_)));
        let template_ok = self
            .search_url_template
            .as_deref()
            .is_some_and(|t| t.contains("{keyword}"));
        if has_keyword && !template_ok {
            return Err(ConfigError::Invalid(
                "keyword queries need a search_url_template containing {keyword}".into(),
            ));
        }
        for field in [Field::Identifier, Field::Price] {
            if !self.rules.fields.contains_key(&field) {
                return Err(ConfigError::Invalid(format!(
                    "rules.fields must define {:?}",
                    field
                )));
            }
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_json::from_str(content)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}
