//! Newline-delimited JSON stream framing
//!
//! Native backends stream one JSON object per line, but the network is free to split or merge
//! those lines across chunks. This wrapper accumulates bytes and only yields complete lines, so
//! every item downstream can be parsed on its own.

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Longest line buffered before the stream is failed.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Raised when a backend sends more than the line limit without a newline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stream line exceeded {limit} bytes without a newline")]
pub struct LineTooLong {
    pub limit: usize,
}

/// A stream wrapper that yields one complete line (including its trailing `\n`) per item.
pub struct LineFramedStream<S> {
    inner: S,
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    max_line: usize,
    overflowed: bool,
}

impl<S> LineFramedStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_max_line(inner, MAX_LINE_BYTES)
    }

    pub fn with_max_line(inner: S, max_line: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            scanned: 0,
            max_line,
            overflowed: false,
        }
    }
}

impl<S, E> Stream for LineFramedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: From<LineTooLong>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.overflowed {
            return Poll::Ready(None);
        }

        loop {
            if let Some(offset) = this.buffer[this.scanned..].iter().position(|&b| b == b'\n') {
                let line = this.buffer.split_to(this.scanned + offset + 1);
                this.scanned = 0;
                return Poll::Ready(Some(Ok(line.freeze())));
            }
            this.scanned = this.buffer.len();

            if this.buffer.len() > this.max_line {
                this.overflowed = true;
                this.buffer.clear();
                this.scanned = 0;
                return Poll::Ready(Some(Err(LineTooLong {
                    limit: this.max_line,
                }
                .into())));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    if this.buffer.is_empty() {
                        return Poll::Ready(None);
                    }
                    // Final line without a terminator.
                    this.scanned = 0;
                    let remaining = this.buffer.split().freeze();
                    return Poll::Ready(Some(Ok(remaining)));
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BoxError;
    use futures_util::StreamExt;

    fn chunks_to_stream(
        chunks: Vec<&'static [u8]>,
    ) -> impl Stream<Item = Result<Bytes, BoxError>> + Unpin {
        futures_util::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    async fn collect(chunks: Vec<&'static [u8]>) -> Vec<Bytes> {
        LineFramedStream::new(chunks_to_stream(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn complete_line_passes_through() {
        let lines = collect(vec![b"{\"done\":false}\n".as_slice()]).await;
        assert_eq!(lines, vec![Bytes::from_static(b"{\"done\":false}\n")]);
    }

    #[tokio::test]
    async fn split_line_is_reassembled() {
        let lines = collect(vec![b"{\"model\":\"qw".as_slice(), b"en3\"}\n".as_slice()]).await;
        assert_eq!(lines, vec![Bytes::from_static(b"{\"model\":\"qwen3\"}\n")]);
    }

    #[tokio::test]
    async fn several_lines_in_one_chunk_are_separated() {
        let lines = collect(vec![b"{\"a\":1}\n{\"b\":2}\n{\"c\":".as_slice(), b"3}\n".as_slice()]).await;
        assert_eq!(
            lines,
            vec![
                Bytes::from_static(b"{\"a\":1}\n"),
                Bytes::from_static(b"{\"b\":2}\n"),
                Bytes::from_static(b"{\"c\":3}\n"),
            ]
        );
    }

    #[tokio::test]
    async fn unterminated_tail_is_flushed_at_end() {
        let lines = collect(vec![b"{\"a\":1}\n{\"done\":true}".as_slice()]).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], Bytes::from_static(b"{\"done\":true}"));
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        assert!(collect(vec![]).await.is_empty());
    }

    #[tokio::test]
    async fn errors_are_forwarded() {
        let inner = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"{\"a\":1}\n")),
            Err(BoxError::from("reset")),
        ]);
        let items: Vec<_> = LineFramedStream::new(inner).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(items[1].as_ref().unwrap_err().to_string(), "reset");
    }

    #[tokio::test]
    async fn line_spread_over_many_chunks_is_reassembled() {
        let pieces: Vec<&'static [u8]> = vec![
            b"{\"message\":".as_slice(),
            b"{\"content\":".as_slice(),
            b"\"a".as_slice(),
            b"b".as_slice(),
            b"c\"}".as_slice(),
            b"}".as_slice(),
            b"\n{\"done\":true}\n".as_slice(),
        ];
        let lines = collect(pieces).await;
        assert_eq!(
            lines,
            vec![
                Bytes::from_static(b"{\"message\":{\"content\":\"abc\"}}\n"),
                Bytes::from_static(b"{\"done\":true}\n"),
            ]
        );
    }

    #[tokio::test]
    async fn overlong_line_fails_the_stream() {
        let inner = chunks_to_stream(vec![
            b"{\"a\":1}\n0123".as_slice(),
            b"456789".as_slice(),
            b"abcdef\n".as_slice(),
        ]);
        let items: Vec<_> = LineFramedStream::with_max_line(inner, 8).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"{\"a\":1}\n"));
        let err = items[1].as_ref().unwrap_err();
        assert_eq!(err.to_string(), "stream line exceeded 8 bytes without a newline");
    }

    #[tokio::test]
    async fn line_at_the_limit_is_accepted() {
        let inner = chunks_to_stream(vec![b"0123".as_slice(), b"4567\n".as_slice()]);
        let items: Vec<_> = LineFramedStream::with_max_line(inner, 8).collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"01234567\n"));
    }
}
