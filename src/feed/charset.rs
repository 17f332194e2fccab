//! Character set discovery and decoding.

use encoding_rs::{CoderResult, Decoder, Encoding};
use futures::stream::{self, StreamExt};
use std::borrow::Cow;
use std::sync::OnceLock;
use thiserror::Error;

use super::body::{ByteStream, CharStream};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CharsetError {
    #[error("Unsupported charset '{0}'")]
    Unresolvable(String),
}

/// The `charset` parameter of a Content-Type header value.
pub fn content_type_charset(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        (!value.is_empty()).then_some(value)
    })
}

pub fn resolve_charset(label: &str) -> Result<&'static Encoding, CharsetError> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| CharsetError::Unresolvable(label.to_string()))
}

/// The `encoding` attribute of a leading XML declaration.
///
/// Only the declaration itself is searched; text further into the document is
/// never mistaken for one.
pub fn find_xml_encoding(text: &str) -> Option<&str> {
    let (_, decl) = xml_declaration(text)?;
    let captures = encoding_attr().captures(decl)?;
    captures.get(2).map(|m| m.as_str()).filter(|s| !s.is_empty())
}

/// [`find_xml_encoding`] over raw bytes, tolerant of invalid UTF-8.
pub fn find_xml_encoding_bytes(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    find_xml_encoding(&text).map(str::to_string)
}

/// Rewrite the declared encoding to UTF-8 once a document has been decoded.
pub fn declare_utf8(text: &str) -> Cow<'_, str> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let Some((offset, decl)) = xml_declaration(text) else {
        return Cow::Borrowed(text);
    };
    let Some(found) = encoding_attr().captures(decl).and_then(|c| c.get(2)) else {
        return Cow::Borrowed(text);
    };
    if found.as_str().eq_ignore_ascii_case("utf-8") {
        return Cow::Borrowed(text);
    }
    let start = offset + found.start();
    let end = offset + found.end();
    Cow::Owned(format!("{}UTF-8{}", &text[..start], &text[end..]))
}

/// Decode a whole buffer, honouring a byte order mark if one is present.
pub fn decode_all(encoding: &'static Encoding, bytes: &[u8]) -> String {
    let (text, _actual, _had_errors) = encoding.decode(bytes);
    text.into_owned()
}

/// Decode a byte stream incrementally.
pub fn decode_stream(body: ByteStream, encoding: &'static Encoding) -> CharStream {
    let decoder = encoding.new_decoder();
    stream::unfold(Some((body, decoder)), |state| async move {
        let (mut body, mut decoder) = state?;
        match body.next().await {
            Some(Ok(chunk)) => {
                let text = decode_chunk(&mut decoder, &chunk, false);
                Some((Ok(text), Some((body, decoder))))
            }
            Some(Err(e)) => Some((Err(e), None)),
            None => Some((Ok(decode_chunk(&mut decoder, &[], true)), None)),
        }
    })
    .boxed()
}

fn decode_chunk(decoder: &mut Decoder, bytes: &[u8], last: bool) -> String {
    let capacity = decoder
        .max_utf8_buffer_length(bytes.len())
        .unwrap_or(bytes.len().saturating_mul(3));
    let mut out = String::with_capacity(capacity.max(4));
    let mut consumed = 0;
    loop {
        let (result, read, _had_errors) =
            decoder.decode_to_string(&bytes[consumed..], &mut out, last);
        consumed += read;
        match result {
            CoderResult::InputEmpty => return out,
            CoderResult::OutputFull => out.reserve(capacity.max(64)),
        }
    }
}

/// The leading `<?xml ... ?>` declaration and its byte offset in `text`.
fn xml_declaration(text: &str) -> Option<(usize, &str)> {
    let trimmed = text.trim_start_matches(['\u{feff}', ' ', '\t', '\r', '\n']);
    if !trimmed.starts_with("<?xml") {
        return None;
    }
    let end = trimmed.find("?>").map(|i| i + 2).unwrap_or(trimmed.len());
    Some((text.len() - trimmed.len(), &trimmed[..end]))
}

fn encoding_attr() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r#"encoding\s*=\s*(["'])([^"']*)["']"#)
            .expect("encoding attribute pattern is valid")
    })
}
