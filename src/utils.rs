// Utility functions
use crate::model::{Query, QueryTarget};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use url::Url;
use url::form_urlencoded::byte_serialize;

/// Builds the address of the page a query points at.
///
/// Keyword queries fill `{keyword}` (percent-encoded) and `{page}` in the search
/// template. URL queries are used as given for page 1; later pages set
/// `page_param` in the query string, replacing any existing value.
pub fn page_url(query: &Query, template: Option<&str>, page_param: &str) -> Result<String, String> {
    match &query.target {
        QueryTarget::Keyword(keyword) => {
            let template = template.ok_or("no search_url_template configured")?;
            let encoded: String = byte_serialize(keyword.as_bytes()).collect();
            Ok(template
                .replace("{keyword}", &encoded)
                .replace("{page}", &query.page.to_string()))
        }
        QueryTarget::Url(raw) => {
            let mut url = Url::parse(raw).map_err(|e| e.to_string())?;
            if query.page <= 1 {
                return Ok(url.to_string());
            }
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != page_param)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(kept)
                .append_pair(page_param, &query.page.to_string());
            Ok(url.to_string())
        }
    }
}

/// Resolves a possibly relative link against the page it was found on.
pub fn absolute_url(link: &str, base_url: &str) -> Option<String> {
    match Url::parse(base_url) {
        Ok(base) => base.join(link).ok().map(|u| u.to_string()),
        Err(_) => Url::parse(link).ok().map(|u| u.to_string()),
    }
}

/// Преобразует строку в kebab-case.
pub fn to_kebab_case(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Saves page HTML under `folder` so a stale selector can be inspected later.
pub fn save_debug_html(folder: &Path, query: &Query, html: &str) -> Option<PathBuf> {
    if let Err(e) = fs::create_dir_all(folder) {
        warn!("Failed to create debug folder: {}", e);
        return None;
    }
    let filename = folder.join(format!(
        "debug-{}-p{}.html",
        to_kebab_case(query.label()),
        query.page
    ));
    match fs::write(&filename, html) {
        Ok(()) => {
            info!("Saved debug HTML: {}", filename.display());
            Some(filename)
        }
        Err(e) => {
            warn!("Failed to write debug HTML: {}", e);
            None
        }
    }
}
