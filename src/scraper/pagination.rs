use crate::model::{FetchError, Query, RawPage};
use crate::scraper::traits::Fetcher;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Pages of one result set, fetched on demand.
///
/// The sequence is finite and cannot be rewound: it ends after `max_pages`
/// pages, after a page that reports itself as the last one, right after the
/// first error (which is yielded once), or when the stop token fires. Starting
/// over means calling [`paginate`] again with the same query.
pub struct Pagination<'a, F: Fetcher + ?Sized> {
    fetcher: &'a F,
    start: Query,
    max_pages: u32,
    fetched: u32,
    delay: Duration,
    cancel: CancellationToken,
    done: bool,
}

pub fn paginate<'a, F: Fetcher + ?Sized>(
    fetcher: &'a F,
    start: &Query,
    max_pages: u32,
    cancel: CancellationToken,
) -> Pagination<'a, F> {
    Pagination {
        fetcher,
        start: start.clone(),
        max_pages,
        fetched: 0,
        delay: Duration::ZERO,
        cancel,
        done: false,
    }
}

impl<'a, F: Fetcher + ?Sized> Pagination<'a, F> {
    /// Pause between consecutive pages, with up to 25% random jitter added.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[cfg(test)]
    pub fn fetched(&self) -> u32 {
        self.fetched
    }

    fn politeness_delay(&self) -> Duration {
        let base = self.delay.as_millis() as u64;
        let jitter = rand::rng().random_range(0..=base / 4);
        Duration::from_millis(base + jitter)
    }

    pub async fn next_page(&mut self) -> Option<Result<RawPage, FetchError>> {
        if self.done {
            return None;
        }
        if self.fetched >= self.max_pages || self.cancel.is_cancelled() {
            self.done = true;
            return None;
        }

        let cancel = self.cancel.clone();
        if self.fetched > 0 && !self.delay.is_zero() {
            let pause = self.politeness_delay();
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.done = true;
                    return None;
                }
                _ = sleep(pause) => {}
            }
        }

        let query = self.start.at_page(self.start.page + self.fetched);
        let fetcher = self.fetcher;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = fetcher.fetch(&query) => Some(result),
        };
        let Some(result) = outcome else {
            info!("Stop requested while fetching '{}' page {}", query.label(), query.page);
            self.done = true;
            return None;
        };

        self.fetched += 1;
        match &result {
            Ok(page) if page.last_page => self.done = true,
            Err(_) => self.done = true,
            Ok(_) => {}
        }
        Some(result)
    }
}
