//! HTTP connections for the refresh pipeline.
//!
//! One [`ConnectionFactory`] is built per batch. It owns the configured
//! client (proxy, timeouts, redirect policy) and the batch's cancellation
//! token, and hands out [`Connection`]s whose bodies can be sniffed before
//! parsing.

use futures::StreamExt;
use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, CACHE_CONTROL, CONNECTION, CONTENT_ENCODING, CONTENT_TYPE, LOCATION,
    PRAGMA, USER_AGENT,
};
use reqwest::redirect::Policy;
use secrecy::ExposeSecret;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::body::{self, Body};
use crate::config::{Config, ProxyConfig};

/// User-Agent sent to feeds that refuse requests without a browser-like one.
pub const IMPOSED_USER_AGENT: &str = "Mozilla/5.0";

const ACCEPT_VALUE: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Hops allowed across an http/https boundary before giving up.
pub const MAX_PROTOCOL_REDIRECTS: usize = 5;

/// Hops the client follows on its own while the scheme stays the same.
const MAX_SAME_SCHEME_REDIRECTS: usize = 10;

/// Errors raised while opening a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The feed URL could not be parsed
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    /// A redirect switched between http and https while that is disabled
    #[error("Redirect to {0} changes protocol; enable cross-protocol redirects to follow it")]
    ProtocolDowngradeRejected(String),
    /// The cross-protocol redirect chain hit [`MAX_PROTOCOL_REDIRECTS`]
    #[error("Too many redirects")]
    TooManyRedirects,
    /// HTTP 404 or 410
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),
    /// Any other non-2xx status
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Network-level error (DNS, connect, TLS, timeout)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// The proxy settings do not form a usable proxy
    #[error("Invalid proxy: {0}")]
    Proxy(String),
    #[error("Refresh cancelled")]
    Cancelled,
}

/// Client settings for one batch.
#[derive(Debug)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub follow_protocol_redirects: bool,
    pub proxy: Option<reqwest::Proxy>,
}

impl ConnectionSettings {
    /// Settings for a batch on the given network. A broken proxy setup is
    /// logged and skipped.
    pub fn from_config(config: &Config, on_wifi: bool) -> Self {
        let proxy = if config.proxy.applies(on_wifi) {
            match build_proxy(&config.proxy) {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring proxy configuration");
                    None
                }
            }
        } else {
            None
        };

        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            follow_protocol_redirects: config.follow_http_https_redirects,
            proxy,
        }
    }
}

/// Build a reqwest proxy from the proxy configuration.
pub fn build_proxy(config: &ProxyConfig) -> Result<reqwest::Proxy, ConnectionError> {
    if config.host.trim().is_empty() {
        return Err(ConnectionError::Proxy("no proxy host configured".to_string()));
    }
    // The URL scheme (http:// or socks5://) selects the proxy protocol.
    let url = config.url();
    let proxy =
        reqwest::Proxy::all(&url).map_err(|e| ConnectionError::Proxy(format!("{url}: {e}")))?;

    Ok(match (&config.username, &config.password) {
        (Some(user), Some(pass)) => proxy.basic_auth(user, pass.expose_secret()),
        (Some(user), None) => proxy.basic_auth(user, ""),
        _ => proxy,
    })
}

/// Lets the client follow same-scheme redirects and stops at an http/https
/// switch, so the 3xx response is handed back for [`next_protocol_hop`].
fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_SAME_SCHEME_REDIRECTS {
            return attempt.error("Too many redirects");
        }

        let switches_scheme = attempt
            .previous()
            .last()
            .is_some_and(|prev| prev.scheme() != attempt.url().scheme());
        if switches_scheme {
            tracing::debug!(to = %attempt.url(), "Redirect changes protocol");
            return attempt.stop();
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %attempt.url(),
            hop = attempt.previous().len(),
            "Following redirect"
        );
        attempt.follow()
    })
}

/// Decide whether a cross-protocol redirect at `depth` may be followed.
///
/// `depth` counts the protocol hops already taken. Four hops are fine, the
/// fifth is refused.
pub fn next_protocol_hop(
    target: Url,
    depth: usize,
    follow_protocol_redirects: bool,
) -> Result<Url, ConnectionError> {
    if !follow_protocol_redirects {
        return Err(ConnectionError::ProtocolDowngradeRejected(target.to_string()));
    }
    if depth + 1 >= MAX_PROTOCOL_REDIRECTS {
        return Err(ConnectionError::TooManyRedirects);
    }
    Ok(target)
}

fn parse_url(raw: &str) -> Result<Url, ConnectionError> {
    Url::parse(raw.trim()).map_err(|source| ConnectionError::InvalidUrl {
        url: raw.to_string(),
        source,
    })
}

pub struct ConnectionFactory {
    client: reqwest::Client,
    follow_protocol_redirects: bool,
    token: CancellationToken,
}

impl ConnectionFactory {
    pub fn new(
        settings: ConnectionSettings,
        token: CancellationToken,
    ) -> Result<Self, ConnectionError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .read_timeout(settings.read_timeout)
            .redirect(redirect_policy());
        if let Some(proxy) = settings.proxy {
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            client: builder.build()?,
            follow_protocol_redirects: settings.follow_protocol_redirects,
            token,
        })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Open `url`, following redirects, and check the final status.
    pub async fn open(
        &self,
        url: &str,
        impose_user_agent: bool,
    ) -> Result<Connection, ConnectionError> {
        let mut url = parse_url(url)?;
        let mut depth = 0;

        loop {
            let response = self.send(&url, impose_user_agent).await?;

            let target = response
                .status()
                .is_redirection()
                .then(|| response.headers().get(LOCATION))
                .flatten()
                .and_then(|value| value.to_str().ok())
                .and_then(|location| response.url().join(location).ok());

            match target {
                Some(target) if target.scheme() != response.url().scheme() => {
                    tracing::debug!(from = %response.url(), to = %target, depth, "Cross-protocol redirect");
                    url = next_protocol_hop(target, depth, self.follow_protocol_redirects)?;
                    depth += 1;
                }
                _ => return Connection::from_response(response, self.token.clone()),
            }
        }
    }

    async fn send(
        &self,
        url: &Url,
        impose_user_agent: bool,
    ) -> Result<reqwest::Response, ConnectionError> {
        let mut target = url.clone();
        let credentials = (!url.username().is_empty()).then(|| {
            let user = decode_userinfo(url.username());
            let pass = url.password().map(decode_userinfo);
            (user, pass)
        });
        if credentials.is_some() {
            let _ = target.set_username("");
            let _ = target.set_password(None);
        }

        let mut request = self
            .client
            .get(target)
            .header(ACCEPT, ACCEPT_VALUE)
            .header(ACCEPT_ENCODING, "gzip")
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .header(CONNECTION, "close");
        if impose_user_agent {
            request = request.header(USER_AGENT, IMPOSED_USER_AGENT);
        }
        if let Some((user, pass)) = credentials {
            request = request.basic_auth(user, pass);
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ConnectionError::Cancelled),
            response = request.send() => Ok(response?),
        }
    }
}

fn decode_userinfo(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// An open response whose status has been checked.
pub struct Connection {
    url: Url,
    content_type: Option<String>,
    body: Body,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url.as_str())
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn from_response(
        response: reqwest::Response,
        token: CancellationToken,
    ) -> Result<Self, ConnectionError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(ConnectionError::ResourceNotFound(response.url().to_string()));
        }
        if !status.is_success() {
            return Err(ConnectionError::HttpStatus(status.as_u16()));
        }

        let url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let gzipped = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"));

        let mut stream = response.bytes_stream().map(|r| r.map_err(io::Error::other)).boxed();
        if gzipped {
            stream = body::gunzip(stream);
        }

        Ok(Self {
            url,
            content_type,
            body: Body::new(body::cancellable(stream, token)),
        })
    }

    /// Final URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }
}
