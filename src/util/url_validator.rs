use thiserror::Error;
use url::Url;

/// Why a subscription URL was refused.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// Feeds are fetched over http or https only.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
}

/// Validate a URL before subscribing to it.
///
/// A missing scheme is read as `http://`, the way feed URLs are usually typed
/// by hand. Credentials in the URL are kept; they become basic auth on fetch.
///
/// # Examples
///
/// ```
/// use feedsweep::util::validate_feed_url;
///
/// let url = validate_feed_url("example.com/feed.xml").unwrap();
/// assert_eq!(url.as_str(), "http://example.com/feed.xml");
/// assert!(validate_feed_url("ftp://example.com/feed.xml").is_err());
/// ```
pub fn validate_feed_url(raw: &str) -> Result<Url, UrlValidationError> {
    let raw = raw.trim();
    let url = if raw.contains("://") {
        Url::parse(raw)?
    } else {
        Url::parse(&format!("http://{raw}"))?
    };

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UrlValidationError::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlValidationError::MissingHost);
    }
    Ok(url)
}
