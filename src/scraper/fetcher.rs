use crate::config::AppConfig;
use crate::model::{FetchError, Query, RawPage};
use crate::scraper::driver::{DriverProcess, capabilities};
use crate::scraper::traits::{Fetcher, SessionFactory};
use crate::utils::page_url;

use fantoccini::{Client, ClientBuilder, Locator};
use std::fmt::Display;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Per-session navigation settings taken from the app config.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub search_url_template: Option<String>,
    pub page_param: String,
    pub ready_selector: String,
    pub item_selector: String,
    pub next_page: Option<String>,
    pub reveal_selector: Option<String>,
    pub blocked_url_markers: Vec<String>,
    pub blocked_selectors: Vec<String>,
    pub scroll_rounds: u32,
    pub settle: Duration,
}

impl FetchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            timeout: config.timeout(),
            search_url_template: config.search_url_template.clone(),
            page_param: config.page_param.clone(),
            ready_selector: config.rules.ready_selector().to_string(),
            item_selector: format!("{} {}", config.rules.list_anchor, config.rules.item),
            next_page: config.rules.next_page.clone(),
            reveal_selector: config.reveal_selector.clone(),
            blocked_url_markers: config
                .blocked_url_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
            blocked_selectors: config.blocked_selectors.clone(),
            scroll_rounds: config.scroll_rounds,
            settle: Duration::from_millis(config.settle_millis),
        }
    }
}

/// One live browser, driven over WebDriver.
pub struct BrowserSession {
    client: Client,
    driver: Option<DriverProcess>,
    settings: FetchSettings,
}

impl BrowserSession {
    pub async fn open(config: &AppConfig) -> Result<Self, FetchError> {
        let driver = match &config.driver_binary {
            Some(binary) => {
                Some(DriverProcess::spawn(binary, &config.webdriver_url, config.timeout()).await?)
            }
            None => None,
        };

        let mut builder = ClientBuilder::native();
        builder.capabilities(capabilities(
            config.browser,
            config.headless,
            config.browser_binary.as_deref(),
        ));

        let connected = match timeout(config.timeout(), builder.connect(&config.webdriver_url)).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => Err(FetchError::Session(format!(
                "cannot connect to {}: {}",
                config.webdriver_url, e
            ))),
            Err(_) => Err(FetchError::Session(format!(
                "connecting to {} timed out",
                config.webdriver_url
            ))),
        };

        match connected {
            Ok(client) => {
                info!(
                    "Browser session opened ({:?}, headless={})",
                    config.browser, config.headless
                );
                Ok(Self {
                    client,
                    driver,
                    settings: FetchSettings::from_config(config),
                })
            }
            Err(e) => {
                if let Some(driver) = driver {
                    driver.shutdown().await;
                }
                Err(e)
            }
        }
    }

    /// Ends the WebDriver session and stops the driver if we started it.
    pub async fn close(self) {
        if let Err(e) = self.client.close().await {
            warn!("Failed to close browser session: {}", e);
        } else {
            info!("Browser session closed");
        }
        if let Some(driver) = self.driver {
            driver.shutdown().await;
        }
    }

    async fn current_url(&self, target: &str) -> Result<String, FetchError> {
        bounded(
            self.settings.timeout,
            target,
            "reading current url",
            self.client.current_url(),
        )
        .await
        .map(|url| url.to_string())
    }

    async fn count(&self, target: &str, selector: &str) -> Result<usize, FetchError> {
        bounded(
            self.settings.timeout,
            target,
            &format!("looking up '{}'", selector),
            self.client.find_all(Locator::Css(selector)),
        )
        .await
        .map(|found| found.len())
    }

    /// Captcha pages and login walls show up as a redirect or as a known element.
    async fn check_blocked(&self, target: &str) -> Result<(), FetchError> {
        let current = self.current_url(target).await?;
        let current_lower = current.to_lowercase();
        let target_lower = target.to_lowercase();
        for marker in &self.settings.blocked_url_markers {
            if current_lower.contains(marker.as_str()) && !target_lower.contains(marker.as_str()) {
                return Err(FetchError::Blocked {
                    url: current,
                    reason: format!("redirected to a page matching '{}'", marker),
                });
            }
        }
        for selector in &self.settings.blocked_selectors {
            if self.count(target, selector).await? > 0 {
                return Err(FetchError::Blocked {
                    url: current,
                    reason: format!("page contains '{}'", selector),
                });
            }
        }
        Ok(())
    }

    async fn wait_ready(&self, target: &str) -> Result<(), FetchError> {
        self.client
            .wait()
            .at_most(self.settings.timeout)
            .every(POLL_INTERVAL)
            .for_element(Locator::Css(&self.settings.ready_selector))
            .await
            .map(|_| ())
            .map_err(|e| FetchError::Navigation {
                url: target.to_string(),
                reason: format!(
                    "'{}' not present after {:?}: {}",
                    self.settings.ready_selector, self.settings.timeout, e
                ),
            })
    }

    /// Clicks the element that reveals the listing area (a tab, a "details" button).
    async fn reveal(&self, target: &str) -> Result<(), FetchError> {
        let Some(selector) = &self.settings.reveal_selector else {
            return Ok(());
        };
        let element = self
            .client
            .wait()
            .at_most(self.settings.timeout)
            .for_element(Locator::Css(selector))
            .await
            .map_err(|e| FetchError::Navigation {
                url: target.to_string(),
                reason: format!("reveal control '{}' not found: {}", selector, e),
            })?;
        let scrolled = bounded(
            self.settings.timeout,
            target,
            "scrolling reveal control into view",
            self.client.execute(
                "arguments[0].scrollIntoView({block: 'center'});",
                vec![serde_json::to_value(&element).unwrap_or_default()],
            ),
        )
        .await;
        if let Err(e) = scrolled {
            warn!("{}; clicking anyway", e);
        }
        bounded(
            self.settings.timeout,
            target,
            &format!("clicking '{}'", selector),
            element.click(),
        )
        .await?;
        self.wait_ready(target).await
    }

    /// Waits until more than `previous` items are rendered, up to the settle time.
    async fn wait_for_more(&self, target: &str, previous: usize) -> Result<Option<usize>, FetchError> {
        let deadline = Instant::now() + self.settings.settle;
        loop {
            let count = self.count(target, &self.settings.item_selector).await?;
            if count > previous {
                return Ok(Some(count));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Scrolls to the bottom until the item count stops growing. Items already
    /// rendered are kept when a scroll step fails.
    async fn scroll_to_load(&self, target: &str) {
        if self.settings.scroll_rounds == 0 {
            return;
        }
        if let Err(e) = self.scroll_rounds(target).await {
            warn!("Stopped scrolling {}: {}", target, e);
        }
    }

    async fn scroll_rounds(&self, target: &str) -> Result<(), FetchError> {
        let mut count = self.count(target, &self.settings.item_selector).await?;
        for round in 1..=self.settings.scroll_rounds {
            bounded(
                self.settings.timeout,
                target,
                "scrolling",
                self.client
                    .execute("window.scrollTo(0, document.body.scrollHeight);", vec![]),
            )
            .await?;
            match self.wait_for_more(target, count).await? {
                Some(grown) => {
                    debug!("Scroll round {}: {} -> {} items", round, count, grown);
                    count = grown;
                }
                None => {
                    debug!("Item count settled at {} after {} rounds", count, round);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn is_last_page(&self, target: &str) -> Result<bool, FetchError> {
        match &self.settings.next_page {
            Some(selector) => Ok(self.count(target, selector).await? == 0),
            None => Ok(false),
        }
    }
}

/// Runs one WebDriver command under `limit`. Command failures and timeouts
/// both become navigation errors for `url`.
async fn bounded<T, E, F>(limit: Duration, url: &str, what: &str, command: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match timeout(limit, command).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(FetchError::Navigation {
            url: url.to_string(),
            reason: format!("{} failed: {}", what, e),
        }),
        Err(_) => Err(FetchError::Navigation {
            url: url.to_string(),
            reason: format!("{} exceeded {:?}", what, limit),
        }),
    }
}

#[async_trait::async_trait]
impl Fetcher for BrowserSession {
    async fn fetch(&self, query: &Query) -> Result<RawPage, FetchError> {
        let target = page_url(
            query,
            self.settings.search_url_template.as_deref(),
            &self.settings.page_param,
        )
        .map_err(|reason| FetchError::Navigation {
            url: query.label().to_string(),
            reason,
        })?;

        debug!("Navigating to {}", target);
        bounded(self.settings.timeout, &target, "page load", self.client.goto(&target)).await?;

        self.check_blocked(&target).await?;
        if let Err(e) = self.wait_ready(&target).await {
            // A challenge page can replace the content after the redirect check.
            self.check_blocked(&target).await?;
            return Err(e);
        }
        self.reveal(&target).await?;
        self.scroll_to_load(&target).await;

        let html = bounded(
            self.settings.timeout,
            &target,
            "reading page source",
            self.client.source(),
        )
        .await?;
        let last_page = self.is_last_page(&target).await?;
        let url = self.current_url(&target).await?;
        info!(
            "Fetched '{}' page {} ({} bytes{})",
            query.label(),
            query.page,
            html.len(),
            if last_page { ", last page" } else { "" }
        );

        Ok(RawPage {
            query: query.clone(),
            url,
            html,
            last_page,
        })
    }
}

/// Opens one browser per worker from the shared config.
pub struct BrowserLauncher {
    config: AppConfig,
}

impl BrowserLauncher {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl SessionFactory for BrowserLauncher {
    type Session = BrowserSession;

    async fn open(&self) -> Result<BrowserSession, FetchError> {
        BrowserSession::open(&self.config).await
    }

    async fn close(&self, session: BrowserSession) {
        session.close().await;
    }
}
