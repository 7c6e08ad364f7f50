//! Streaming completion as a pull-based sequence of text fragments.

use crate::error::{BoxError, Error};
use crate::payment::PaymentReceipt;
use crate::spend::Amount;
use crate::sse::SseParser;
use crate::types::ChunkBody;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{ready, Stream};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::time::{Instant, Sleep};
use tracing::trace;

/// Byte stream of a streamed HTTP response body.
pub type ByteStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

pin_project! {
    /// Text fragments of a streaming completion.
    ///
    /// Ends on `[DONE]` or when the server closes the connection. A transport
    /// failure is yielded once as [`Error::Stream`], and a passed deadline as
    /// [`Error::Timeout`], after which the stream ends. Malformed records are
    /// skipped.
    pub struct TextStream<S> {
        #[pin]
        inner: S,
        parser: SseParser,
        content: String,
        receipt: Option<PaymentReceipt>,
        amount_paid: Option<Amount>,
        deadline: Option<Pin<Box<Sleep>>>,
        done: bool,
    }
}

impl<S> TextStream<S> {
    /// Create a text stream over a raw body stream.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            content: String::with_capacity(4096),
            receipt: None,
            amount_paid: None,
            deadline: None,
            done: false,
        }
    }

    pub(crate) fn with_payment(
        mut self,
        receipt: Option<PaymentReceipt>,
        amount_paid: Option<Amount>,
    ) -> Self {
        self.receipt = receipt;
        self.amount_paid = amount_paid;
        self
    }

    /// End the stream with [`Error::Timeout`] once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(Box::pin(tokio::time::sleep_until(deadline)));
        self
    }

    /// Text received so far.
    pub fn current_content(&self) -> &str {
        &self.content
    }

    /// All text received, consuming the stream.
    pub fn into_content(self) -> String {
        self.content
    }

    /// Settlement receipt of the paid response, if the server sent one.
    pub fn receipt(&self) -> Option<&PaymentReceipt> {
        self.receipt.as_ref()
    }

    /// Amount paid to open this stream.
    pub fn amount_paid(&self) -> Option<Amount> {
        self.amount_paid
    }

    /// Check if stream is done.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl<S, E> TextStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<BoxError>,
{
    /// Get the next fragment from the stream.
    pub async fn next(&mut self) -> Option<Result<String, Error>> {
        futures::StreamExt::next(self).await
    }
}

impl<S, E> Stream for TextStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    type Item = Result<String, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.done {
            return Poll::Ready(None);
        }

        loop {
            // First, drain records already buffered
            while let Some(data) = this.parser.next_data() {
                if SseParser::is_done(data) {
                    *this.done = true;
                    this.parser.reset();
                    return Poll::Ready(None);
                }
                if let Some(text) = parse_fragment(data) {
                    this.content.push_str(&text);
                    return Poll::Ready(Some(Ok(text)));
                }
            }

            if let Some(deadline) = this.deadline.as_mut() {
                if deadline.as_mut().poll(cx).is_ready() {
                    *this.done = true;
                    return Poll::Ready(Some(Err(Error::Timeout)));
                }
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => this.parser.feed(&bytes),
                Some(Err(e)) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(stream_error(e.into()))));
                }
                None => {
                    *this.done = true;
                    let tail = this
                        .parser
                        .finish()
                        .filter(|data| !SseParser::is_done(data))
                        .and_then(|data| parse_fragment(&data));
                    return Poll::Ready(tail.map(|text| {
                        this.content.push_str(&text);
                        Ok(text)
                    }));
                }
            }
        }
    }
}

/// Transport failure while reading the body; timeouts fold into [`Error::Timeout`].
fn stream_error(e: BoxError) -> Error {
    match e.downcast_ref::<reqwest::Error>() {
        Some(http) if http.is_timeout() => Error::Timeout,
        _ => Error::Stream(e),
    }
}

/// Text delta of one record; `None` for malformed or content-free records.
fn parse_fragment(data: &str) -> Option<String> {
    match serde_json::from_str::<ChunkBody>(data) {
        Ok(chunk) => chunk.into_text(),
        Err(e) => {
            trace!(error = %e, "dropping unparseable record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io;

    fn ok(s: &'static str) -> Result<Bytes, io::Error> {
        Ok(Bytes::from(s))
    }

    async fn collect<S>(stream: &mut TextStream<S>) -> Vec<Result<String, Error>>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
    {
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item);
        }
        items
    }

    fn texts(items: Vec<Result<String, Error>>) -> Vec<String> {
        items.into_iter().map(Result::unwrap).collect()
    }

    #[tokio::test]
    async fn test_fragments_until_done() {
        let chunks = vec![
            ok("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n"),
            ok("data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n"),
            ok("data: [DONE]\n"),
            ok("data: {\"choices\":[{\"delta\":{\"content\":\"after\"}}]}\n"),
        ];
        let mut stream = TextStream::new(futures::stream::iter(chunks));

        assert_eq!(texts(collect(&mut stream).await), vec!["Hi", "!"]);
        assert!(stream.is_done());
        assert_eq!(stream.current_content(), "Hi!");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_record_skipped() {
        let chunks = vec![
            ok("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n"),
            ok("data: not-json\n"),
            ok("data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n"),
            ok("data: [DONE]\n"),
        ];
        let mut stream = TextStream::new(futures::stream::iter(chunks));
        assert_eq!(texts(collect(&mut stream).await), vec!["Hi", "!"]);
    }

    #[tokio::test]
    async fn test_transport_error_after_fragment() {
        let chunks = vec![
            ok("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n"),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            ok("data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n"),
        ];
        let mut stream = TextStream::new(futures::stream::iter(chunks));

        let items = collect(&mut stream).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Hi");
        assert!(matches!(items[1], Err(Error::Stream(_))));
    }

    #[tokio::test]
    async fn test_record_split_across_chunks() {
        let chunks = vec![
            ok("data: {\"choices\":[{\"del"),
            ok("ta\":{\"content\":\"Hel"),
            ok("lo\"}}]}\r\n\r\ndata: [DO"),
            ok("NE]\r\n"),
        ];
        let mut stream = TextStream::new(futures::stream::iter(chunks));
        assert_eq!(texts(collect(&mut stream).await), vec!["Hello"]);
    }

    #[tokio::test]
    async fn test_ignores_other_lines() {
        let chunks = vec![ok(
            ": ping\n\nevent: message\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\ndata: [DONE]\n\n",
        )];
        let mut stream = TextStream::new(futures::stream::iter(chunks));
        assert_eq!(texts(collect(&mut stream).await), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_close_without_done_flushes_tail() {
        let chunks = vec![
            ok("data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n"),
            ok("data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}"),
        ];
        let mut stream = TextStream::new(futures::stream::iter(chunks));
        assert_eq!(texts(collect(&mut stream).await), vec!["a", "b"]);
        assert_eq!(stream.into_content(), "ab");
    }

    #[tokio::test]
    async fn test_deadline_ends_stalled_stream() {
        let head = futures::stream::iter(vec![ok(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n",
        )]);
        let chunks = head.chain(futures::stream::pending());
        let deadline = Instant::now() + std::time::Duration::from_millis(50);
        let mut stream = TextStream::new(Box::pin(chunks)).with_deadline(deadline);

        let items = collect(&mut stream).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Hi");
        assert!(matches!(items[1], Err(Error::Timeout)));
        assert!(stream.is_done());
    }

    #[tokio::test]
    async fn test_usable_as_futures_stream() {
        let chunks = vec![
            ok("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n"),
            ok("data: {\"choices\":[{\"delta\":{\"content\":\"y\"}}]}\n"),
        ];
        let stream = TextStream::new(futures::stream::iter(chunks));
        let collected: Vec<String> = stream.map(Result::unwrap).collect().await;
        assert_eq!(collected, vec!["x", "y"]);
    }
}
