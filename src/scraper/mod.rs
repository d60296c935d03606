pub mod driver;
pub mod fetcher;
pub mod pagination;
pub mod traits;

#[cfg(test)]
pub mod fake;

pub use fetcher::BrowserLauncher;
pub use pagination::paginate;
pub use traits::{Fetcher, SessionFactory};
