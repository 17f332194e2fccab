//! Content sniffing: feed and icon links in HTML heads, fetch mode detection.

use regex::Regex;
use std::io;
use std::sync::OnceLock;
use url::Url;

use super::body::Body;
use super::charset::{content_type_charset, find_xml_encoding_bytes, resolve_charset};
use crate::storage::FetchMode;

/// Bytes inspected for an XML declaration when the server names no charset.
pub const PRELUDE_LEN: usize = 128;

/// Upper bound on how much of an HTML page is buffered looking for `<body`.
pub const MAX_HEAD_BYTES: usize = 512 * 1024;

/// Links found in an HTML head.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeadLinks {
    pub feed_url: Option<String>,
    pub icon_url: Option<String>,
}

fn feed_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r#"(?i)<link[^>]*\s(?:"#,
            r#"rel\s*=\s*(?:alternate|"alternate"|'alternate')[^>]*\shref\s*=\s*["']([^"']*)["']"#,
            r#"|href\s*=\s*["']([^"']*)["'][^>]*\srel\s*=\s*(?:alternate|"alternate"|'alternate')"#,
            r#")"#,
        ))
        .expect("feed link pattern is valid")
    })
}

fn icon_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r#"(?i)<link[^>]*\s(?:"#,
            r#"rel\s*=\s*(?:"shortcut icon"|'shortcut icon'|"icon"|'icon'|icon)[^>]*\shref\s*=\s*["']([^"']*)["']"#,
            r#"|href\s*=\s*["']([^"']*)["'][^>]*\srel\s*=\s*(?:"shortcut icon"|'shortcut icon'|"icon"|'icon'|icon)"#,
            r#")"#,
        ))
        .expect("icon link pattern is valid")
    })
}

fn first_href(pattern: &Regex, line: &str) -> Option<String> {
    let captures = pattern.captures(line)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().to_string())
}

/// `scheme://host[:port]` of a URL.
pub fn site_root(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    }
}

/// Turn an `href` from a page at `base` into an absolute URL.
///
/// Relative paths are appended to the page URL itself, the way feed
/// autodiscovery links are usually written against a site root.
pub fn resolve_href(href: &str, base: &Url) -> String {
    let href = href.trim().replace("&amp;", "&");
    let lower = href.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        href
    } else if href.starts_with("//") {
        format!("{}:{}", base.scheme(), href)
    } else if href.starts_with('/') {
        format!("{}{}", site_root(base), href)
    } else {
        format!("{}/{}", base.as_str().trim_end_matches('/'), href)
    }
}

/// Scan HTML text for the first feed link and the first icon link.
///
/// Everything from the first `<body` on is ignored.
pub fn scan_head(html: &str, base: &Url, want_feed: bool) -> HeadLinks {
    let head = match find_body_marker(html.as_bytes()) {
        Some(at) => &html[..at],
        None => html,
    };

    let mut links = HeadLinks::default();
    for line in head.lines() {
        if want_feed && links.feed_url.is_none() {
            links.feed_url = first_href(feed_link_pattern(), line).map(|h| resolve_href(&h, base));
        }
        if links.icon_url.is_none() {
            links.icon_url = first_href(icon_link_pattern(), line).map(|h| resolve_href(&h, base));
        }
        if links.icon_url.is_some() && (links.feed_url.is_some() || !want_feed) {
            break;
        }
    }
    links
}

/// Buffer the head of an HTML body and scan it. The body is left unconsumed.
pub async fn scan_html(body: &mut Body, base: &Url, want_feed: bool) -> io::Result<HeadLinks> {
    let buffered = body
        .fill_until(MAX_HEAD_BYTES, |buf| find_body_marker(buf).is_some())
        .await?;
    let html = String::from_utf8_lossy(buffered);
    Ok(scan_head(&html, base, want_feed))
}

fn find_body_marker(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(5)
        .position(|w| w.eq_ignore_ascii_case(b"<body"))
}

/// Decide how a feed body must be fetched from its Content-Type and the
/// first few bytes of the body.
///
/// A declared charset decides on its own. Without one, an XML declaration in
/// `prelude` decides; with neither, the document is read directly as UTF-8.
pub fn decide_fetch_mode(content_type: Option<&str>, prelude: &[u8]) -> FetchMode {
    if let Some(label) = content_type.and_then(content_type_charset) {
        return match resolve_charset(label) {
            Ok(_) => FetchMode::Direct,
            Err(_) => FetchMode::Reencode,
        };
    }
    match find_xml_encoding_bytes(prelude) {
        Some(label) if resolve_charset(&label).is_err() => FetchMode::Reencode,
        _ => FetchMode::Direct,
    }
}

/// Whether [`decide_fetch_mode`] needs to see the body at all.
pub fn needs_prelude(content_type: Option<&str>) -> bool {
    content_type.and_then(content_type_charset).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn base() -> Url {
        Url::parse("http://example.com/blog").unwrap()
    }

    #[test]
    fn test_resolve_href_forms() {
        let base = Url::parse("https://example.com:8443/news/").unwrap();
        assert_eq!(
            resolve_href("http://other.example/rss", &base),
            "http://other.example/rss"
        );
        assert_eq!(
            resolve_href("//cdn.example.com/feed", &base),
            "https://cdn.example.com/feed"
        );
        assert_eq!(
            resolve_href("/feed.xml", &base),
            "https://example.com:8443/feed.xml"
        );
        assert_eq!(
            resolve_href("feed.xml", &base),
            "https://example.com:8443/news/feed.xml"
        );
        assert_eq!(
            resolve_href("/feed?a=1&amp;b=2", &base),
            "https://example.com:8443/feed?a=1&b=2"
        );
    }

    #[test]
    fn test_scan_finds_feed_link_either_order() {
        let html = r#"<html><head>
<link rel="alternate" type="application/rss+xml" href="/feed.xml">
</head><body></body></html>"#;
        let links = scan_head(html, &base(), true);
        assert_eq!(links.feed_url.as_deref(), Some("http://example.com/feed.xml"));

        let html = r#"<LINK HREF="rss.xml" TYPE="application/rss+xml" REL=alternate>"#;
        let links = scan_head(html, &base(), true);
        assert_eq!(
            links.feed_url.as_deref(),
            Some("http://example.com/blog/rss.xml")
        );
    }

    #[test]
    fn test_scan_first_match_wins() {
        let html = r#"<link rel="alternate" href="/one.xml">
<link rel="alternate" href="/two.xml">"#;
        let links = scan_head(html, &base(), true);
        assert_eq!(links.feed_url.as_deref(), Some("http://example.com/one.xml"));
    }

    #[test]
    fn test_scan_finds_icon_variants() {
        for rel in [r#""shortcut icon""#, r#""icon""#, "icon"] {
            let html = format!(r#"<link rel={rel} href="/static/fav.png">"#);
            let links = scan_head(&html, &base(), false);
            assert_eq!(
                links.icon_url.as_deref(),
                Some("http://example.com/static/fav.png"),
                "rel={rel}"
            );
        }
        let html = r#"<link rel="apple-touch-icon" href="/touch.png">"#;
        assert_eq!(scan_head(html, &base(), false).icon_url, None);
    }

    #[test]
    fn test_scan_stops_at_body() {
        let html = r#"<head><title>x</title></head><body>
<link rel="alternate" href="/late.xml">"#;
        assert_eq!(scan_head(html, &base(), true), HeadLinks::default());
    }

    #[test]
    fn test_scan_single_line_document() {
        let html = r#"<html><head><link rel="icon" href="/i.ico"><link rel="alternate" href="/f.xml"></head><body><link rel="alternate" href="/no.xml"></body>"#;
        let links = scan_head(html, &base(), true);
        assert_eq!(links.feed_url.as_deref(), Some("http://example.com/f.xml"));
        assert_eq!(links.icon_url.as_deref(), Some("http://example.com/i.ico"));
    }

    #[test]
    fn test_stylesheet_alternate_is_ignored() {
        let html = r#"<link rel="alternate stylesheet" href="/dark.css">"#;
        assert_eq!(scan_head(html, &base(), true).feed_url, None);
    }

    #[test]
    fn test_decide_fetch_mode() {
        let decl = br#"<?xml version="1.0" encoding="ISO-8859-1"?>"#;
        let bogus = br#"<?xml version="1.0" encoding="x-made-up"?>"#;

        assert_eq!(
            decide_fetch_mode(Some("text/xml; charset=utf-8"), b""),
            FetchMode::Direct
        );
        assert_eq!(
            decide_fetch_mode(Some("text/xml; charset=x-made-up"), decl),
            FetchMode::Reencode
        );
        assert_eq!(decide_fetch_mode(Some("text/xml"), decl), FetchMode::Direct);
        assert_eq!(decide_fetch_mode(Some("text/xml"), bogus), FetchMode::Reencode);
        assert_eq!(decide_fetch_mode(None, b"<rss>"), FetchMode::Direct);
        assert_eq!(decide_fetch_mode(None, bogus), FetchMode::Reencode);
    }

    #[test]
    fn test_needs_prelude() {
        assert!(needs_prelude(None));
        assert!(needs_prelude(Some("application/xml")));
        assert!(!needs_prelude(Some("application/xml; charset=utf-8")));
    }

    #[tokio::test]
    async fn test_scan_html_leaves_body_intact() {
        let page = r#"<head><link rel="alternate" href="/f.xml"></head><body>hello</body>"#;
        let mut body = Body::from_bytes(page);
        let links = scan_html(&mut body, &base(), true).await.unwrap();
        assert_eq!(links.feed_url.as_deref(), Some("http://example.com/f.xml"));
        assert_eq!(body.read_to_end(1024).await.unwrap(), page.as_bytes());
    }

    proptest! {
        #[test]
        fn resolved_paths_stay_on_base_host(path in "[a-z0-9/._-]{0,40}") {
            let base = Url::parse("https://example.com/section").unwrap();
            let resolved = resolve_href(&path, &base);
            if !path.starts_with("//") {
                prop_assert!(resolved.starts_with("https://example.com"));
            }
        }
    }
}
