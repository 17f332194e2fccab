//! Response bodies: cancellable byte streams with a replayable lookahead.
//!
//! Sniffing needs to look at the start of a body (an HTML head, an XML
//! declaration) and then hand the *whole* body to the parser. [`Body`] keeps
//! whatever was pulled for inspection in a buffer and replays it in front of
//! the remaining stream, so nothing is fetched twice.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use std::io::{self, Write};
use tokio_util::sync::CancellationToken;

/// Raw (already gzip-unwrapped) response bytes.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Decoded text, chunk by chunk.
pub type CharStream = BoxStream<'static, io::Result<String>>;

pub struct Body {
    buffered: BytesMut,
    stream: ByteStream,
    exhausted: bool,
}

impl Body {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            buffered: BytesMut::new(),
            stream,
            exhausted: false,
        }
    }

    /// Body backed by a fixed byte buffer.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes: Bytes = bytes.into();
        Self::new(stream::iter([Ok(bytes)]).boxed())
    }

    /// Look at up to `len` leading bytes without consuming them.
    ///
    /// Returns fewer bytes only when the body is shorter.
    pub async fn peek(&mut self, len: usize) -> io::Result<&[u8]> {
        while self.buffered.len() < len && self.pull().await? {}
        let end = len.min(self.buffered.len());
        Ok(&self.buffered[..end])
    }

    /// Buffer chunks until `done` accepts the buffer, `limit` bytes are
    /// buffered, or the body ends. Nothing is consumed.
    pub async fn fill_until<F>(&mut self, limit: usize, done: F) -> io::Result<&[u8]>
    where
        F: Fn(&[u8]) -> bool,
    {
        while !done(&self.buffered) && self.buffered.len() < limit && self.pull().await? {}
        Ok(&self.buffered)
    }

    /// Read the entire body into memory, failing once it exceeds `limit`.
    pub async fn read_to_end(mut self, limit: usize) -> io::Result<Vec<u8>> {
        while self.pull().await? {
            if self.buffered.len() > limit {
                return Err(too_large(limit));
            }
        }
        if self.buffered.len() > limit {
            return Err(too_large(limit));
        }
        Ok(self.buffered.to_vec())
    }

    /// The full body as a stream, lookahead bytes first.
    pub fn into_stream(self) -> ByteStream {
        if self.buffered.is_empty() {
            return self.stream;
        }
        let head = stream::iter([Ok(self.buffered.freeze())]);
        if self.exhausted {
            head.boxed()
        } else {
            head.chain(self.stream).boxed()
        }
    }

    async fn pull(&mut self) -> io::Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        match self.stream.next().await {
            Some(chunk) => {
                self.buffered.extend_from_slice(&chunk?);
                Ok(true)
            }
            None => {
                self.exhausted = true;
                Ok(false)
            }
        }
    }
}

fn too_large(limit: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("response larger than {limit} bytes"),
    )
}

/// End the stream with an `Interrupted` error as soon as `token` fires.
pub fn cancellable<T>(
    stream: BoxStream<'static, io::Result<T>>,
    token: CancellationToken,
) -> BoxStream<'static, io::Result<T>>
where
    T: Send + 'static,
{
    stream::unfold(Some((stream, token)), |state| async move {
        let (mut stream, token) = state?;
        tokio::select! {
            biased;
            _ = token.cancelled() => Some((
                Err(io::Error::new(io::ErrorKind::Interrupted, "refresh cancelled")),
                None,
            )),
            next = stream.next() => next.map(|item| (item, Some((stream, token)))),
        }
    })
    .boxed()
}

/// Inflate a gzip-encoded stream incrementally.
pub fn gunzip(stream: ByteStream) -> ByteStream {
    let decoder = flate2::write::GzDecoder::new(Vec::new());
    stream::unfold(Some((stream, decoder)), |state| async move {
        let (mut stream, mut decoder) = state?;
        match stream.next().await {
            Some(Ok(chunk)) => {
                let inflated = decoder
                    .write_all(&chunk)
                    .and_then(|()| decoder.flush())
                    .map(|()| Bytes::from(std::mem::take(decoder.get_mut())));
                match inflated {
                    Ok(bytes) => Some((Ok(bytes), Some((stream, decoder)))),
                    Err(e) => Some((Err(e), None)),
                }
            }
            Some(Err(e)) => Some((Err(e), None)),
            None => Some((decoder.finish().map(Bytes::from), None)),
        }
    })
    .filter(|item| futures::future::ready(!matches!(item, Ok(bytes) if bytes.is_empty())))
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn chunked(parts: &[&'static str]) -> Body {
        let chunks: Vec<io::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from_static(p.as_bytes())))
            .collect();
        Body::new(stream::iter(chunks).boxed())
    }

    async fn collect(stream: ByteStream) -> Vec<u8> {
        let chunks: Vec<io::Result<Bytes>> = stream.collect().await;
        chunks
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect()
    }

    #[tokio::test]
    async fn test_peek_replays_prefix() {
        let mut body = chunked(&["<?xml ", "version=\"1.0\"?>", "<rss/>"]);
        assert_eq!(body.peek(8).await.unwrap(), b"<?xml ve");
        assert_eq!(collect(body.into_stream()).await, b"<?xml version=\"1.0\"?><rss/>");
    }

    #[tokio::test]
    async fn test_peek_past_end_returns_short_slice() {
        let mut body = chunked(&["abc"]);
        assert_eq!(body.peek(100).await.unwrap(), b"abc");
        assert_eq!(collect(body.into_stream()).await, b"abc");
    }

    #[tokio::test]
    async fn test_fill_until_stops_at_predicate() {
        let mut body = chunked(&["<head>", "<body>", "rest"]);
        let seen = body
            .fill_until(1024, |buf| buf.windows(5).any(|w| w == b"<body"))
            .await
            .unwrap()
            .to_vec();
        assert_eq!(seen, b"<head><body>");
        assert_eq!(collect(body.into_stream()).await, b"<head><body>rest");
    }

    #[tokio::test]
    async fn test_read_to_end_enforces_limit() {
        let body = chunked(&["0123456789", "0123456789"]);
        let err = body.read_to_end(15).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let body = chunked(&["0123456789"]);
        assert_eq!(body.read_to_end(10).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_gunzip_inflates_split_input() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"<rss><channel/></rss>").unwrap();
        let compressed = encoder.finish().unwrap();
        let (a, b) = compressed.split_at(compressed.len() / 2);

        let chunks = vec![Ok(Bytes::copy_from_slice(a)), Ok(Bytes::copy_from_slice(b))];
        let stream = gunzip(stream::iter(chunks).boxed());
        assert_eq!(collect(stream).await, b"<rss><channel/></rss>");
    }

    #[tokio::test]
    async fn test_cancellable_interrupts_stream() {
        let token = CancellationToken::new();
        token.cancel();
        let mut stream = cancellable(chunked(&["data"]).into_stream(), token);
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(stream.next().await.is_none());
    }
}
