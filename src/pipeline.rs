// Fetch -> extract -> export orchestration
use crate::config::AppConfig;
use crate::exporter::Exporter;
use crate::model::{ExportDescriptor, FetchError, ListingBatch, ParseError, Query, WriteError};
use crate::parser::Parser;
use crate::scraper::{Fetcher, SessionFactory, paginate};
use crate::utils::save_debug_html;
use futures::future::join_all;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub max_pages: u32,
    pub page_delay: Duration,
    pub workers: usize,
    pub dedupe: bool,
    /// Where pages that failed extraction are saved for inspection.
    pub debug_html_dir: Option<PathBuf>,
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_pages: config.max_pages,
            page_delay: Duration::from_millis(config.page_delay_millis),
            workers: config.workers,
            dedupe: config.dedupe,
            debug_html_dir: Some(PathBuf::from("logs/html")),
        }
    }
}

/// Why a query stopped before running out of pages.
#[derive(Debug, Error)]
pub enum Halt {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug)]
pub struct QueryOutcome {
    pub query: Query,
    pub batch: ListingBatch,
    pub pages: u32,
    pub dropped: usize,
    pub halt: Option<Halt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    /// Something was cut short; whatever was collected was still exported.
    Partial,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub queries: usize,
    pub pages: u32,
    pub records: usize,
    pub dropped: usize,
    pub duplicates: usize,
    pub halts: Vec<String>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        if self.halts.is_empty() && !self.cancelled {
            RunStatus::Complete
        } else {
            RunStatus::Partial
        }
    }

    pub fn log_summary(&self) {
        info!(
            "Run finished: {} queries, {} pages, {} records, {} dropped, {} duplicates",
            self.queries, self.pages, self.records, self.dropped, self.duplicates
        );
        for halt in &self.halts {
            warn!("Halted: {}", halt);
        }
        if self.cancelled {
            warn!("Run was stopped early; exported what was collected");
        }
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("could not open browser session: {0}")]
    Session(FetchError),
    #[error("export failed: {0}")]
    Write(#[from] WriteError),
}

/// Walks one query's pages through the parser. Fetch and layout errors stop
/// this query only; records gathered before them are kept.
pub async fn run_query<F, P>(
    fetcher: &F,
    parser: &P,
    query: &Query,
    options: &PipelineOptions,
    cancel: &CancellationToken,
) -> QueryOutcome
where
    F: Fetcher + ?Sized,
    P: Parser + ?Sized,
{
    info!("Processing query: {}", query.label());
    let mut outcome = QueryOutcome {
        query: query.clone(),
        batch: ListingBatch::new(),
        pages: 0,
        dropped: 0,
        halt: None,
    };

    let mut pages =
        paginate(fetcher, query, options.max_pages, cancel.clone()).with_delay(options.page_delay);
    while let Some(next) = pages.next_page().await {
        let page = match next {
            Ok(page) => page,
            Err(e) => {
                warn!("Stopping '{}' after {} pages: {}", query.label(), outcome.pages, e);
                outcome.halt = Some(e.into());
                break;
            }
        };
        outcome.pages += 1;

        match parser.parse(&page) {
            Ok(extraction) => {
                if extraction.dropped > 0 {
                    warn!(
                        "Dropped {} incomplete listings on '{}' page {}",
                        extraction.dropped,
                        query.label(),
                        page.query.page
                    );
                }
                outcome.dropped += extraction.dropped;
                outcome.batch.extend(extraction.records);
            }
            Err(e) => {
                error!("Parse error on {}: {}", page.url, e);
                if let Some(dir) = &options.debug_html_dir {
                    save_debug_html(dir, &page.query, &page.html);
                }
                outcome.halt = Some(e.into());
                break;
            }
        }
    }

    info!(
        "Finished query: {} ({} records, {} dropped, {} pages)",
        query.label(),
        outcome.batch.len(),
        outcome.dropped,
        outcome.pages
    );
    outcome
}

/// Runs a worker's queries one after another on its session.
pub async fn run_queries<F, P>(
    fetcher: &F,
    parser: &P,
    queries: Vec<(usize, Query)>,
    options: &PipelineOptions,
    cancel: &CancellationToken,
) -> Vec<(usize, QueryOutcome)>
where
    F: Fetcher + ?Sized,
    P: Parser + ?Sized,
{
    let mut outcomes = Vec::with_capacity(queries.len());
    for (index, query) in queries {
        if cancel.is_cancelled() {
            info!("Skipping '{}': stop requested", query.label());
            continue;
        }
        outcomes.push((index, run_query(fetcher, parser, &query, options, cancel).await));
    }
    outcomes
}

/// Deals queries round-robin to at most `workers` workers, keeping each
/// query's position so results can be put back in order.
pub fn distribute(queries: Vec<Query>, workers: usize) -> Vec<Vec<(usize, Query)>> {
    let workers = workers.max(1).min(queries.len());
    let mut assignments: Vec<Vec<(usize, Query)>> = vec![Vec::new(); workers];
    for (index, query) in queries.into_iter().enumerate() {
        assignments[index % workers].push((index, query));
    }
    assignments
}

/// Folds per-query outcomes into one batch in query order.
pub fn merge_outcomes(
    mut outcomes: Vec<(usize, QueryOutcome)>,
    dedupe: bool,
    cancelled: bool,
) -> (ListingBatch, RunReport) {
    outcomes.sort_by_key(|(index, _)| *index);
    let mut batch = ListingBatch::new();
    let mut report = RunReport {
        cancelled,
        ..RunReport::default()
    };

    for (_, outcome) in outcomes {
        report.queries += 1;
        report.pages += outcome.pages;
        report.dropped += outcome.dropped;
        if let Some(halt) = &outcome.halt {
            report.halts.push(format!("{}: {}", outcome.query.label(), halt));
        }
        batch.append(outcome.batch);
    }

    if dedupe {
        report.duplicates = batch.dedupe_by_identifier();
    }
    report.records = batch.len();
    (batch, report)
}

/// Full run: opens one session per worker, collects listings, closes every
/// session, then exports once. Session-open and write failures are fatal;
/// everything else ends in a partial report.
pub async fn harvest<S, P, E>(
    factory: &S,
    parser: &P,
    exporter: &E,
    queries: Vec<Query>,
    descriptor: &ExportDescriptor,
    options: &PipelineOptions,
    cancel: CancellationToken,
) -> Result<RunReport, HarvestError>
where
    S: SessionFactory,
    P: Parser + ?Sized,
    E: Exporter + ?Sized,
{
    let assignments = distribute(queries, options.workers);

    let mut sessions = Vec::with_capacity(assignments.len());
    for worker in 0..assignments.len() {
        match factory.open().await {
            Ok(session) => sessions.push(session),
            Err(e) => {
                error!("Failed to open session for worker {}: {}", worker, e);
                for session in sessions {
                    factory.close(session).await;
                }
                return Err(HarvestError::Session(e));
            }
        }
    }

    let results = join_all(
        sessions
            .iter()
            .zip(assignments)
            .map(|(session, assigned)| run_queries(session, parser, assigned, options, &cancel)),
    )
    .await;

    for session in sessions {
        factory.close(session).await;
    }

    let (batch, report) = merge_outcomes(
        results.into_iter().flatten().collect(),
        options.dedupe,
        cancel.is_cancelled(),
    );
    if batch.is_empty() {
        warn!("No listings collected; {} gets the header row only", descriptor.path.display());
    }
    exporter.export(&batch, descriptor)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Field, FieldRule, SelectorRules};
    use crate::exporter::SpreadsheetExporter;
    use crate::model::Column;
    use crate::parser::ListingParser;
    use crate::scraper::fake::{FakeFactory, FakeFetcher, Scripted};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn parser() -> ListingParser {
        let mut fields = BTreeMap::new();
        fields.insert(
            Field::Identifier,
            FieldRule {
                selector: String::new(),
                attribute: Some("data-id".into()),
            },
        );
        fields.insert(
            Field::Price,
            FieldRule {
                selector: ".price".into(),
                attribute: None,
            },
        );
        ListingParser::new(&SelectorRules {
            list_anchor: "ul.results".into(),
            item: "li".into(),
            ready_selector: None,
            next_page: None,
            fields,
            sold_out_markers: Vec::new(),
        })
        .unwrap()
    }

    /// Listing page with (id, price) items; `None` leaves the field out.
    fn listing_page(items: &[(Option<&str>, Option<&str>)]) -> String {
        let mut html = String::from("<ul class=\"results\">");
        for (id, price) in items {
            html.push_str("<li");
            if let Some(id) = id {
                html.push_str(&format!(" data-id=\"{}\"", id));
            }
            html.push('>');
            if let Some(price) = price {
                html.push_str(&format!("<span class=\"price\">{}</span>", price));
            }
            html.push_str("</li>");
        }
        html.push_str("</ul>");
        html
    }

    fn options(max_pages: u32, workers: usize) -> PipelineOptions {
        PipelineOptions {
            max_pages,
            page_delay: Duration::ZERO,
            workers,
            dedupe: false,
            debug_html_dir: None,
        }
    }

    fn csv_descriptor(dir: &TempDir) -> ExportDescriptor {
        ExportDescriptor {
            path: dir.path().join("out.csv"),
            sheet_name: "listings".into(),
            columns: vec![Column::Identifier, Column::Price],
        }
    }

    fn exported_ids(descriptor: &ExportDescriptor) -> Vec<String> {
        let mut reader = csv::Reader::from_path(&descriptor.path).unwrap();
        reader.records().map(|r| r.unwrap()[0].to_string()).collect()
    }

    #[tokio::test]
    async fn two_pages_with_one_incomplete_listing() {
        let fetcher = FakeFetcher::new()
            .page(
                "sneaker-x",
                1,
                Scripted::html(&listing_page(&[
                    (Some("a1"), Some("100,000")),
                    (Some("a2"), Some("110,000")),
                ])),
            )
            .page(
                "sneaker-x",
                2,
                Scripted::last(&listing_page(&[(Some("b1"), Some("95,000")), (Some("b2"), None)])),
            );
        let factory = FakeFactory::new(fetcher.clone());
        let dir = TempDir::new().unwrap();
        let descriptor = csv_descriptor(&dir);

        let report = harvest(
            &factory,
            &parser(),
            &SpreadsheetExporter::new(),
            vec![Query::keyword("sneaker-x")],
            &descriptor,
            &options(5, 1),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.records, 3);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.pages, 2);
        assert_eq!(report.status(), RunStatus::Complete);
        assert_eq!(exported_ids(&descriptor), vec!["a1", "a2", "b1"]);
        assert_eq!(factory.opened(), 1);
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test]
    async fn blocked_page_still_exports_earlier_pages() {
        let fetcher = FakeFetcher::new()
            .page(
                "sneaker-x",
                1,
                Scripted::html(&listing_page(&[
                    (Some("a1"), Some("100,000")),
                    (Some("a2"), Some("110,000")),
                ])),
            )
            .page("sneaker-x", 2, Scripted::Blocked)
            .page(
                "sneaker-x",
                3,
                Scripted::last(&listing_page(&[(Some("c1"), Some("90,000"))])),
            );
        let factory = FakeFactory::new(fetcher.clone());
        let dir = TempDir::new().unwrap();
        let descriptor = csv_descriptor(&dir);

        let report = harvest(
            &factory,
            &parser(),
            &SpreadsheetExporter::new(),
            vec![Query::keyword("sneaker-x")],
            &descriptor,
            &options(3, 1),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.status(), RunStatus::Partial);
        assert_eq!(report.halts.len(), 1);
        assert!(report.halts[0].starts_with("sneaker-x: blocked"));
        assert_eq!(exported_ids(&descriptor), vec!["a1", "a2"]);
        assert_eq!(fetcher.calls(), vec![1, 2]);
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test]
    async fn navigation_timeout_still_exports_earlier_pages() {
        let fetcher = FakeFetcher::new()
            .page(
                "sneaker-x",
                1,
                Scripted::html(&listing_page(&[
                    (Some("a1"), Some("100,000")),
                    (Some("a2"), Some("110,000")),
                ])),
            )
            .page("sneaker-x", 2, Scripted::Timeout)
            .page(
                "sneaker-x",
                3,
                Scripted::last(&listing_page(&[(Some("c1"), Some("90,000"))])),
            );
        let factory = FakeFactory::new(fetcher.clone());
        let dir = TempDir::new().unwrap();
        let descriptor = csv_descriptor(&dir);

        let report = harvest(
            &factory,
            &parser(),
            &SpreadsheetExporter::new(),
            vec![Query::keyword("sneaker-x")],
            &descriptor,
            &options(3, 1),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.status(), RunStatus::Partial);
        assert_eq!(report.pages, 1);
        assert_eq!(report.halts.len(), 1);
        assert!(report.halts[0].starts_with("sneaker-x: navigation to"));
        assert_eq!(exported_ids(&descriptor), vec!["a1", "a2"]);
        assert_eq!(fetcher.calls(), vec![1, 2]);
        assert_eq!(factory.closed(), 1);
    }

    #[tokio::test]
    async fn layout_change_halts_only_that_query_and_saves_html() {
        let fetcher = FakeFetcher::new()
            .page("broken", 1, Scripted::html("<div class=\"new-layout\"></div>"))
            .page("broken", 2, Scripted::last(&listing_page(&[(Some("x"), Some("1"))])))
            .page("fine", 1, Scripted::last(&listing_page(&[(Some("f1"), Some("5,000"))])));
        let dir = TempDir::new().unwrap();
        let mut opts = options(5, 1);
        opts.debug_html_dir = Some(dir.path().join("html"));

        let outcomes = run_queries(
            &fetcher,
            &parser(),
            vec![(0, Query::keyword("broken")), (1, Query::keyword("fine"))],
            &opts,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(outcomes[0].1.halt, Some(Halt::Parse(ParseError::MissingAnchor(_)))));
        assert_eq!(outcomes[0].1.batch.len(), 0);
        assert_eq!(outcomes[1].1.batch.len(), 1);
        assert_eq!(fetcher.calls_for("broken"), vec![1]);
        assert!(dir.path().join("html/debug-broken-p1.html").exists());
    }

    #[tokio::test]
    async fn cancelled_run_exports_empty_batch() {
        let fetcher = FakeFetcher::new().page(
            "sneaker-x",
            1,
            Scripted::last(&listing_page(&[(Some("a1"), Some("1"))])),
        );
        let factory = FakeFactory::new(fetcher.clone());
        let dir = TempDir::new().unwrap();
        let descriptor = csv_descriptor(&dir);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = harvest(
            &factory,
            &parser(),
            &SpreadsheetExporter::new(),
            vec![Query::keyword("sneaker-x")],
            &descriptor,
            &options(5, 1),
            cancel,
        )
        .await
        .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.status(), RunStatus::Partial);
        assert!(fetcher.calls().is_empty());
        assert!(exported_ids(&descriptor).is_empty());
        assert_eq!(factory.closed(), factory.opened());
    }

    #[tokio::test]
    async fn workers_merge_in_query_order() {
        let mut fetcher = FakeFetcher::new();
        for (label, id) in [("q0", "a"), ("q1", "b"), ("q2", "c")] {
            fetcher = fetcher.page(label, 1, Scripted::last(&listing_page(&[(Some(id), Some("10"))])));
        }
        let factory = FakeFactory::new(fetcher);
        let dir = TempDir::new().unwrap();
        let descriptor = csv_descriptor(&dir);

        let report = harvest(
            &factory,
            &parser(),
            &SpreadsheetExporter::new(),
            vec![Query::keyword("q0"), Query::keyword("q1"), Query::keyword("q2")],
            &descriptor,
            &options(2, 2),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.queries, 3);
        assert_eq!(exported_ids(&descriptor), vec!["a", "b", "c"]);
        assert_eq!(factory.opened(), 2);
        assert_eq!(factory.closed(), 2);
    }

    #[tokio::test]
    async fn failed_session_open_closes_the_others() {
        let factory = FakeFactory::new(FakeFetcher::new()).limited_to(1);
        let dir = TempDir::new().unwrap();

        let result = harvest(
            &factory,
            &parser(),
            &SpreadsheetExporter::new(),
            vec![Query::keyword("q0"), Query::keyword("q1")],
            &csv_descriptor(&dir),
            &options(1, 2),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(HarvestError::Session(_))));
        assert_eq!(factory.opened(), 1);
        assert_eq!(factory.closed(), 1);
    }

    #[test]
    fn session_error_names_its_cause_once() {
        let err = HarvestError::Session(FetchError::Session("no browser available".into()));
        assert_eq!(
            err.to_string(),
            "could not open browser session: browser session error: no browser available"
        );
        assert!(std::error::Error::source(&err).is_none());
    }

    #[tokio::test]
    async fn write_failure_is_fatal_after_teardown() {
        let fetcher = FakeFetcher::new().page(
            "q",
            1,
            Scripted::last(&listing_page(&[(Some("a"), Some("1"))])),
        );
        let factory = FakeFactory::new(fetcher);
        let dir = TempDir::new().unwrap();
        let mut descriptor = csv_descriptor(&dir);
        descriptor.path = dir.path().join("out.ods");

        let result = harvest(
            &factory,
            &parser(),
            &SpreadsheetExporter::new(),
            vec![Query::keyword("q")],
            &descriptor,
            &options(1, 1),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(HarvestError::Write(WriteError::UnsupportedFormat(_)))
        ));
        assert_eq!(factory.closed(), 1);
    }

    #[test]
    fn merge_dedupes_across_queries() {
        let outcome_of = |index: usize, label: &str, ids: &[&str]| {
            let batch = ids
                .iter()
                .map(|id| crate::model::ListingRecord {
                    id: id.to_string(),
                    name: None,
                    price: 1.0,
                    size: None,
                    availability: crate::model::Availability::Unknown,
                    url: None,
                    captured_at: chrono::Utc::now(),
                })
                .collect();
            (
                index,
                QueryOutcome {
                    query: Query::keyword(label),
                    batch,
                    pages: 1,
                    dropped: 0,
                    halt: None,
                },
            )
        };
        let outcomes = vec![
            outcome_of(1, "b", &["2", "3"]),
            outcome_of(0, "a", &["1", "2"]),
        ];
        let (batch, report) = merge_outcomes(outcomes, true, false);
        let ids: Vec<&str> = batch.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.records, 3);
        assert_eq!(report.status(), RunStatus::Complete);
    }

    #[test]
    fn distribute_is_round_robin_and_never_idle() {
        let queries: Vec<Query> = (0..5).map(|i| Query::keyword(format!("q{}", i))).collect();
        let split = distribute(queries.clone(), 2);
        let indexes: Vec<Vec<usize>> = split
            .iter()
            .map(|w| w.iter().map(|(i, _)| *i).collect())
            .collect();
        assert_eq!(indexes, vec![vec![0, 2, 4], vec![1, 3]]);
        assert_eq!(distribute(queries[..1].to_vec(), 4).len(), 1);
        assert!(distribute(Vec::new(), 3).is_empty());
    }
}
