//! Favicon resolution.

use thiserror::Error;
use url::Url;

use super::connection::{ConnectionError, ConnectionFactory};
use super::sniff::{scan_html, site_root};

/// Fallback path probed when no page names an icon.
pub const FAVICON_PATH: &str = "/favicon.ico";

/// Icons larger than this are discarded.
pub const MAX_ICON_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
enum FaviconError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fetch the icon for the site behind `site`.
///
/// `discovered` is an icon URL already found while scanning the feed's own
/// landing page. Without one, the site root is scanned, and `/favicon.ico`
/// is the last resort. Never fails: any problem yields an empty icon, which
/// records that resolution was attempted.
pub async fn resolve(
    factory: &ConnectionFactory,
    site: &Url,
    discovered: Option<String>,
    impose_user_agent: bool,
) -> Vec<u8> {
    match fetch(factory, site, discovered, impose_user_agent).await {
        Ok(icon) => {
            tracing::debug!(site = %site, bytes = icon.len(), "Resolved favicon");
            icon
        }
        Err(e) => {
            tracing::debug!(site = %site, error = %e, "No favicon");
            Vec::new()
        }
    }
}

async fn fetch(
    factory: &ConnectionFactory,
    site: &Url,
    discovered: Option<String>,
    impose_user_agent: bool,
) -> Result<Vec<u8>, FaviconError> {
    let root = site_root(site);
    let icon_url = match discovered {
        Some(url) => url,
        None => discover(factory, &root, impose_user_agent)
            .await
            .unwrap_or_else(|| format!("{root}{FAVICON_PATH}")),
    };

    let connection = factory.open(&icon_url, impose_user_agent).await?;
    Ok(connection.into_body().read_to_end(MAX_ICON_BYTES).await?)
}

/// Look for an icon link on the site's root page.
async fn discover(factory: &ConnectionFactory, root: &str, impose_user_agent: bool) -> Option<String> {
    let mut connection = factory.open(root, impose_user_agent).await.ok()?;
    if !connection.is_html() {
        return None;
    }
    let base = connection.url().clone();
    let links = scan_html(connection.body_mut(), &base, false).await.ok()?;
    links.icon_url
}
