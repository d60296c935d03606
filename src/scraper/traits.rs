use crate::model::{FetchError, Query, RawPage};

#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Loads the page a query points at and returns it once its content is ready.
    async fn fetch(&self, query: &Query) -> Result<RawPage, FetchError>;
}

/// Opens and tears down exclusively owned fetch sessions.
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: Fetcher;

    async fn open(&self) -> Result<Self::Session, FetchError>;

    /// Releases everything the session holds. Must not fail.
    async fn close(&self, session: Self::Session);
}
