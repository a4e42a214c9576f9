//! Caller-facing reply streams.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};

use crate::error::SessionError;
use crate::transport::TransportError;
use crate::types::{MessageId, OperationKind, Reply, ReplyFragment};

pub(crate) type FragmentSender = mpsc::Sender<Result<ReplyFragment, SessionError>>;

/// Lazy, finite stream of decrypted reply fragments for one operation.
///
/// The stream ends after [`ReplyFragment::End`] or after the first error.
/// Waiting longer than the idle timeout for any fragment yields
/// [`SessionError::Timeout`]. Dropping the stream abandons the reply; the
/// session keeps draining it in the background.
pub struct ReplyStream {
    message_id: MessageId,
    kind: OperationKind,
    rx: mpsc::Receiver<Result<ReplyFragment, SessionError>>,
    idle_timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    finished: bool,
}

impl ReplyStream {
    pub(crate) fn new(
        message_id: MessageId,
        kind: OperationKind,
        rx: mpsc::Receiver<Result<ReplyFragment, SessionError>>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            message_id,
            kind,
            rx,
            idle_timeout,
            deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            finished: false,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Operation the reply belongs to, after intent routing.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Stop accepting fragments so the sender never blocks on a finished stream.
    fn finish(&mut self) {
        self.finished = true;
        self.rx.close();
    }

    /// Drain the stream into a single [`Reply`].
    pub async fn collect_reply(mut self) -> Result<Reply, SessionError> {
        let mut reply = Reply::empty(self.message_id, self.kind);
        while let Some(fragment) = self.next().await {
            match fragment? {
                ReplyFragment::Text { content, tokens } => {
                    reply.text.push_str(&content);
                    reply.tokens += u64::from(tokens);
                }
                ReplyFragment::Image(image) => {
                    reply.tokens += u64::from(image.tokens);
                    reply.image = Some(image);
                }
                ReplyFragment::End { finish_reason } => {
                    reply.finish_reason = Some(finish_reason);
                    return Ok(reply);
                }
            }
        }
        Err(SessionError::Transport(TransportError::Closed(
            "reply ended before stream_end".into(),
        )))
    }
}

impl Stream for ReplyStream {
    type Item = Result<ReplyFragment, SessionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(fragment))) => {
                if matches!(fragment, ReplyFragment::End { .. }) {
                    this.finish();
                } else {
                    let next = Instant::now() + this.idle_timeout;
                    this.deadline.as_mut().reset(next);
                }
                Poll::Ready(Some(Ok(fragment)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(Err(SessionError::Transport(TransportError::Closed(
                    "reply ended before stream_end".into(),
                )))))
            }
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.finish();
                    Poll::Ready(Some(Err(SessionError::timeout(
                        format!("waiting for reply fragment of {}", this.message_id),
                        this.idle_timeout,
                    ))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl std::fmt::Debug for ReplyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyStream")
            .field("message_id", &self.message_id)
            .field("kind", &self.kind)
            .field("finished", &self.finished)
            .finish()
    }
}
