//! Reply Streaming
//!
//! Turns the byte stream of a reply into [`Token`]s and runs one reply turn
//! on a background task.
//!
//! ```text
//! StreamTransport::open_stream ──► ByteStream ──► TokenStream ──► TurnUpdate
//!                                   (chunks)      (SseDecoder)    (mpsc to controller)
//! ```
//!
//! The consume task checks its cancellation token between every delivery and
//! drops the byte stream when cancelled, which releases the connection.

pub mod decoder;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{ByteStream, StreamRequest, StreamTransport};
use crate::error::{StreamError, TransportError};

pub use decoder::{SseDecoder, Token, DONE_SENTINEL, MAX_EVENT_SIZE, META_PREFIX};

/// Lazy, finite sequence of tokens decoded from a byte stream
///
/// Yields `Ok(token)` items and at most one `Err`, after which it is
/// exhausted. Dropping it drops the underlying transport stream.
pub struct TokenStream {
    source: Option<ByteStream>,
    decoder: SseDecoder,
}

impl TokenStream {
    /// Decode `source`; `default_style` fills metadata without a style
    pub fn new(source: ByteStream, default_style: impl Into<String>) -> Self {
        Self::with_decoder(source, SseDecoder::new(default_style))
    }

    /// Decode `source` with a preconfigured decoder
    #[must_use]
    pub fn with_decoder(source: ByteStream, decoder: SseDecoder) -> Self {
        Self {
            source: Some(source),
            decoder,
        }
    }

    fn close(&mut self) {
        self.source = None;
    }
}

impl Stream for TokenStream {
    type Item = Result<Token, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.source.is_none() {
                return Poll::Ready(None);
            }

            match this.decoder.next_token() {
                Ok(Some(token)) => return Poll::Ready(Some(Ok(token))),
                Ok(None) if this.decoder.is_done() => {
                    this.close();
                    return Poll::Ready(None);
                }
                Ok(None) => {}
                Err(err) => {
                    this.close();
                    return Poll::Ready(Some(Err(err)));
                }
            }

            let Some(source) = this.source.as_mut() else {
                return Poll::Ready(None);
            };
            match source.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => this.decoder.push(&chunk),
                Poll::Ready(Some(Err(err))) => {
                    this.close();
                    return Poll::Ready(Some(Err(StreamError::Transport(err))));
                }
                Poll::Ready(None) => {
                    this.close();
                    return Poll::Ready(this.decoder.finish().err().map(Err));
                }
            }
        }
    }
}

/// Progress of one reply turn, sent from the consume task to the controller
#[derive(Debug)]
pub enum TurnUpdate {
    /// A decoded token
    Token(Token),
    /// The stream ended normally
    Finished,
    /// The transport closed mid-event; the partial event was discarded
    Truncated {
        /// Size of the discarded partial event
        pending_bytes: usize,
    },
    /// The stream could not be opened or failed mid-way
    Failed(StreamError),
}

impl TurnUpdate {
    /// Whether this update ends the turn
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }
}

/// Open the reply stream and forward its tokens until it ends or is cancelled
///
/// Nothing is sent after cancellation. The task also stops as soon as the
/// receiver is dropped.
pub async fn run_turn(
    transport: Arc<dyn StreamTransport>,
    request: StreamRequest,
    default_style: String,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<TurnUpdate>,
) {
    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        opened = transport.open_stream(&request) => opened,
    };

    let source = match opened {
        Ok(source) => source,
        Err(err) => {
            tracing::debug!(session_id = %request.session_id, error = %err, "Failed to open reply stream");
            let _ = tx.send(TurnUpdate::Failed(StreamError::Transport(err)));
            return;
        }
    };

    let mut tokens = TokenStream::new(source, default_style);
    let mut delivered = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(session_id = %request.session_id, delivered, "Reply stream cancelled");
                return;
            }
            next = tokens.next() => next,
        };

        let update = match next {
            Some(Ok(token)) => {
                delivered += 1;
                TurnUpdate::Token(token)
            }
            Some(Err(StreamError::Truncated { pending_bytes })) => {
                TurnUpdate::Truncated { pending_bytes }
            }
            Some(Err(err)) => TurnUpdate::Failed(err),
            None => TurnUpdate::Finished,
        };

        let terminal = update.is_terminal();
        if cancel.is_cancelled() || tx.send(update).is_err() || terminal {
            break;
        }
    }

    tracing::trace!(session_id = %request.session_id, delivered, "Reply stream consumer exiting");
}

/// Build a [`ByteStream`] from in-memory chunks
///
/// Handy for tests and for the in-memory backend.
pub fn byte_stream_from_chunks<I>(chunks: I) -> ByteStream
where
    I: IntoIterator<Item = Result<Vec<u8>, TransportError>>,
    I::IntoIter: Send + 'static,
{
    futures::stream::iter(chunks).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_tokens(stream: TokenStream) -> Vec<Result<Token, StreamError>> {
        stream.collect().await
    }

    fn chunks(parts: &[&str]) -> ByteStream {
        let owned: Vec<Result<Vec<u8>, TransportError>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        byte_stream_from_chunks(owned)
    }

    #[tokio::test]
    async fn test_token_stream_split_chunks() {
        let stream = TokenStream::new(
            chunks(&["da", "ta: {\"tok", "en\":\"Hi\"}\n", "\ndata: [DO", "NE]\n\n"]),
            "s",
        );
        let items = collect_tokens(stream).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), &Token::Content("Hi".to_string()));
    }

    #[tokio::test]
    async fn test_token_stream_truncated() {
        let stream = TokenStream::new(chunks(&["data: a\n\ndata: b"]), "s");
        let items = collect_tokens(stream).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(
            items[1],
            Err(StreamError::Truncated { pending_bytes: 7 })
        ));
    }

    #[tokio::test]
    async fn test_token_stream_transport_error_ends_stream() {
        let source = byte_stream_from_chunks(vec![
            Ok(b"data: a\n\n".to_vec()),
            Err(TransportError::ConnectionLost("reset".to_string())),
            Ok(b"data: never\n\n".to_vec()),
        ]);
        let items = collect_tokens(TokenStream::new(source, "s")).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(StreamError::Transport(_))));
    }

    #[tokio::test]
    async fn test_token_stream_not_restartable() {
        let mut stream = TokenStream::new(chunks(&["data: x\n\ndata: [DONE]\n\n"]), "s");
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }
}
