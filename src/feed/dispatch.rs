//! Hand a connection's body to the parser the way its fetch mode demands.

use encoding_rs::{Encoding, UTF_8};
use futures::stream::{self, StreamExt};

use super::body::Body;
use super::charset::{self, content_type_charset, find_xml_encoding_bytes, resolve_charset};
use super::connection::Connection;
use super::parser::{FeedInput, FeedParser, ParseError};
use super::sniff::PRELUDE_LEN;
use crate::storage::FetchMode;

/// How one document gets to the parser.
pub enum FetchPlan {
    /// Stream the body through with a known charset. `typed` is false when
    /// the server sent no Content-Type at all, in which case the body is
    /// decoded before it reaches the parser.
    Direct {
        body: Body,
        encoding: &'static Encoding,
        typed: bool,
    },
    /// The whole body, buffered, plus the charset the server claimed.
    Reencode {
        bytes: Vec<u8>,
        declared: Option<String>,
    },
}

impl std::fmt::Debug for FetchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchPlan::Direct {
                encoding, typed, ..
            } => f
                .debug_struct("Direct")
                .field("encoding", &encoding.name())
                .field("typed", typed)
                .finish_non_exhaustive(),
            FetchPlan::Reencode { bytes, declared } => f
                .debug_struct("Reencode")
                .field("len", &bytes.len())
                .field("declared", declared)
                .finish(),
        }
    }
}

impl FetchPlan {
    /// Build the plan for `connection` in `mode`.
    ///
    /// A direct feed whose declared charset no longer resolves is buffered
    /// and re-encoded for this fetch instead of failing.
    pub async fn build(
        connection: Connection,
        mode: FetchMode,
        max_bytes: usize,
    ) -> std::io::Result<Self> {
        let content_type = connection.content_type().map(str::to_owned);
        let declared = content_type
            .as_deref()
            .and_then(content_type_charset)
            .map(str::to_owned);
        let mut body = connection.into_body();

        if mode != FetchMode::Reencode {
            let encoding = match declared.as_deref().map(resolve_charset) {
                Some(Ok(encoding)) => Some(encoding),
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Falling back to re-encoding");
                    None
                }
                None => {
                    let prelude = body.peek(PRELUDE_LEN).await?;
                    Some(
                        find_xml_encoding_bytes(prelude)
                            .and_then(|label| resolve_charset(&label).ok())
                            .unwrap_or(UTF_8),
                    )
                }
            };
            if let Some(encoding) = encoding {
                return Ok(FetchPlan::Direct {
                    body,
                    encoding,
                    typed: content_type.is_some(),
                });
            }
        }

        Ok(FetchPlan::Reencode {
            bytes: body.read_to_end(max_bytes).await?,
            declared,
        })
    }

    /// The parser input, or `None` when the document cannot be decoded at
    /// all and is dropped.
    pub fn into_input(self) -> Option<FeedInput> {
        match self {
            FetchPlan::Direct {
                body,
                encoding,
                typed: true,
            } => Some(FeedInput::Bytes {
                body: body.into_stream(),
                encoding,
            }),
            FetchPlan::Direct {
                body,
                encoding,
                typed: false,
            } => Some(FeedInput::Chars(charset::decode_stream(
                body.into_stream(),
                encoding,
            ))),
            FetchPlan::Reencode { bytes, declared } => {
                let encoding = reencode_charset(&bytes, declared.as_deref())?;
                let text = charset::decode_all(encoding, &bytes);
                Some(FeedInput::Chars(stream::iter([Ok(text)]).boxed()))
            }
        }
    }
}

/// Charset for a buffered document: its XML declaration first, then the
/// server's claim, then UTF-8 when the server claimed nothing.
fn reencode_charset(bytes: &[u8], declared: Option<&str>) -> Option<&'static Encoding> {
    if let Some(encoding) = find_xml_encoding_bytes(bytes).and_then(|l| resolve_charset(&l).ok()) {
        return Some(encoding);
    }
    match declared {
        None => Some(UTF_8),
        Some(label) => match resolve_charset(label) {
            Ok(encoding) => Some(encoding),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping feed with undecodable charset");
                None
            }
        },
    }
}

/// Plan the fetch and feed the result to `parser`.
pub async fn dispatch<P>(
    connection: Connection,
    mode: FetchMode,
    parser: &mut P,
    max_bytes: usize,
) -> Result<(), ParseError>
where
    P: FeedParser + ?Sized,
{
    let plan = FetchPlan::build(connection, mode, max_bytes).await?;
    tracing::debug!(?plan, %mode, "Dispatching feed");
    match plan.into_input() {
        Some(input) => parser.feed(input).await,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reencode_prefers_xml_declaration() {
        let doc = br#"<?xml version="1.0" encoding="ISO-8859-1"?><rss/>"#;
        assert_eq!(
            reencode_charset(doc, Some("x-bogus")),
            Some(encoding_rs::WINDOWS_1252)
        );
    }

    #[test]
    fn test_reencode_falls_back_to_declared_charset() {
        let doc = br#"<?xml version="1.0" encoding="x-unknown"?><rss/>"#;
        assert_eq!(
            reencode_charset(doc, Some("koi8-r")),
            Some(encoding_rs::KOI8_R)
        );
    }

    #[test]
    fn test_reencode_drops_unresolvable_declared_charset() {
        assert_eq!(reencode_charset(b"<rss/>", Some("x-bogus")), None);
    }

    #[test]
    fn test_reencode_defaults_to_utf8_without_claim() {
        assert_eq!(reencode_charset(b"<rss/>", None), Some(UTF_8));
    }

    #[test]
    fn test_dropped_plan_has_no_input() {
        let plan = FetchPlan::Reencode {
            bytes: b"<rss/>".to_vec(),
            declared: Some("x-bogus".to_string()),
        };
        assert!(plan.into_input().is_none());
    }

    #[test]
    fn test_typed_direct_plan_passes_bytes() {
        let plan = FetchPlan::Direct {
            body: Body::from_bytes("<rss/>"),
            encoding: UTF_8,
            typed: true,
        };
        assert!(matches!(plan.into_input(), Some(FeedInput::Bytes { .. })));

        let plan = FetchPlan::Direct {
            body: Body::from_bytes("<rss/>"),
            encoding: UTF_8,
            typed: false,
        };
        assert!(matches!(plan.into_input(), Some(FeedInput::Chars(_))));
    }
}
