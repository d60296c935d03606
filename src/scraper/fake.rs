// In-memory fetcher and session factory for tests
use crate::model::{FetchError, Query, RawPage};
use crate::scraper::traits::{Fetcher, SessionFactory};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub enum Scripted {
    Page { html: String, last: bool },
    Blocked,
    Timeout,
    /// Never completes; only a stop signal gets past it.
    Hang,
}

impl Scripted {
    pub fn html(html: &str) -> Self {
        Scripted::Page {
            html: html.to_string(),
            last: false,
        }
    }

    pub fn last(html: &str) -> Self {
        Scripted::Page {
            html: html.to_string(),
            last: true,
        }
    }
}

/// Answers fetches from a script keyed by (query label, page). Clones share the call log.
#[derive(Clone, Default)]
pub struct FakeFetcher {
    script: HashMap<(String, u32), Scripted>,
    calls: Arc<Mutex<Vec<(String, u32)>>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, label: &str, page: u32, scripted: Scripted) -> Self {
        self.script.insert((label.to_string(), page), scripted);
        self
    }

    /// Page numbers fetched so far, in call order.
    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().iter().map(|(_, p)| *p).collect()
    }

    pub fn calls_for(&self, label: &str) -> Vec<u32> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| l == label)
            .map(|(_, p)| *p)
            .collect()
    }
}

#[async_trait::async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, query: &Query) -> Result<RawPage, FetchError> {
        let label = query.label().to_string();
        self.calls.lock().unwrap().push((label.clone(), query.page));
        let url = format!("https://market.example/{}?page={}", label, query.page);

        match self.script.get(&(label, query.page)).cloned() {
            Some(Scripted::Page { html, last }) => Ok(RawPage {
                query: query.clone(),
                url,
                html,
                last_page: last,
            }),
            Some(Scripted::Blocked) => Err(FetchError::Blocked {
                url,
                reason: "captcha".into(),
            }),
            Some(Scripted::Timeout) => Err(FetchError::Navigation {
                url,
                reason: "timed out".into(),
            }),
            Some(Scripted::Hang) => std::future::pending().await,
            None => Err(FetchError::Navigation {
                url,
                reason: "unreachable".into(),
            }),
        }
    }
}

/// Hands out clones of one fake fetcher and counts opens and closes.
pub struct FakeFactory {
    template: FakeFetcher,
    max_sessions: usize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

impl FakeFactory {
    pub fn new(template: FakeFetcher) -> Self {
        Self {
            template,
            max_sessions: usize::MAX,
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    /// Opening more than `n` sessions fails.
    pub fn limited_to(mut self, n: usize) -> Self {
        self.max_sessions = n;
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SessionFactory for FakeFactory {
    type Session = FakeFetcher;

    async fn open(&self) -> Result<FakeFetcher, FetchError> {
        if self.opened() >= self.max_sessions {
            return Err(FetchError::Session("no browser available".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.template.clone())
    }

    async fn close(&self, _session: FakeFetcher) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
