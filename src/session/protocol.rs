//! Thin protocol wrapper for the session WebSocket.
//!
//! Adapted from the teacher's `room::protocol::WebSocket`: a
//! `pin_project`-based `Stream`/`Sink` over `axum`'s raw websocket that
//! preprocesses transport-level `ping` heartbeats and negotiates a
//! multi-stage graceful close.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ws::{self, CloseFrame};

use derive_more::{Display, Error, From};

use futures_core::ready;
use futures_util::{Sink, SinkExt, Stream, StreamExt};

use turnkeep_model::ApiError;
use turnkeep_model::session::{ClientMessage, ServerMessage};

use pin_project::pin_project;

use tokio::time::{Sleep, sleep};

/// Gives clients some time to send their transport-level ping over unstable
/// network conditions before the heartbeat timeout fires.
pub const HEARTBEAT_GRACE_DURATION: Duration = Duration::from_secs(5);

/// A connection to one client stream.
#[derive(Debug)]
#[pin_project]
pub struct WebSocket {
    #[pin]
    inner: ws::WebSocket,
    close_timeout: Duration,

    heartbeater: Heartbeater,
    heartbeat_stage: HeartbeatStage,

    closed_client: bool,
    closed_server: bool,
    close_stage: CloseStage,
}

#[derive(Debug)]
enum CloseStage {
    Running,
    Wait(Pin<Box<Sleep>>),
    Flushing,
    Closing,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
enum HeartbeatStage {
    None,
    Flushing,
}

impl WebSocket {
    pub fn new(inner: ws::WebSocket, heartbeat_interval: Duration) -> WebSocket {
        WebSocket {
            inner,
            heartbeater: Heartbeater::new(heartbeat_interval),
            heartbeat_stage: HeartbeatStage::None,
            close_timeout: Duration::from_secs(5),
            close_stage: CloseStage::Running,
            closed_client: false,
            closed_server: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.close_stage, CloseStage::Closed)
    }

    pub async fn send(&mut self, message: &ServerMessage) -> Result<(), Error> {
        <WebSocket as SinkExt<&ServerMessage>>::send(self, message).await
    }

    pub async fn recv(&mut self) -> Option<Result<ClientMessage, Error>> {
        <WebSocket as StreamExt>::next(self).await
    }

    /// Sends a close frame and starts the closing process.
    pub async fn send_close(&mut self, code: u16, error: &ApiError) -> Result<(), Error> {
        let msg = serde_json::to_string(error)?;
        self.inner
            .send(ws::Message::Close(Some(CloseFrame {
                code,
                reason: msg.into(),
            })))
            .await?;
        self.close_stage = CloseStage::Wait(Box::pin(tokio::time::sleep(self.close_timeout)));
        self.closed_server = true;
        Ok(())
    }

    fn preprocess_message(self: Pin<&mut Self>, msg: &ClientMessage) -> Result<(), Error> {
        let this = self.project();

        if let ClientMessage::Ping { seq } = msg {
            if let Some(seq) = this.heartbeater.ack(*seq) {
                let message = ServerMessage::Pong { seq };
                let text = serde_json::to_string(&message)?;
                this.inner.start_send(ws::Message::Text(text.into()))?;
                *this.heartbeat_stage = HeartbeatStage::Flushing;
            }
        }

        Ok(())
    }

    fn poll_close_inner(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        loop {
            let mut this = self.as_mut().project();

            match this.close_stage {
                CloseStage::Running => return Poll::Pending,
                CloseStage::Wait(timeout) => {
                    if timeout.as_mut().poll(cx).is_ready() {
                        *this.close_stage = CloseStage::Closing;
                        continue;
                    }

                    let ev = ready!(this.inner.as_mut().poll_next(cx));

                    match ev {
                        Some(Ok(ws::Message::Close(_close_frame))) => {
                            *this.close_stage = CloseStage::Closing;
                            *this.closed_client = true;
                        }
                        Some(Ok(_)) => (),
                        Some(Err(err)) => return Poll::Ready(Err(err.into())),
                        None => return Poll::Ready(Ok(())),
                    }
                }
                CloseStage::Flushing => {
                    ready!(this.inner.poll_flush(cx))?;
                    *this.closed_server = true;

                    if *this.closed_client {
                        *this.close_stage = CloseStage::Closing;
                    } else {
                        *this.close_stage = CloseStage::Wait(Box::pin(sleep(*this.close_timeout)));
                    }
                }
                CloseStage::Closing => {
                    ready!(this.inner.poll_close(cx))?;
                    *this.close_stage = CloseStage::Closed;
                }
                CloseStage::Closed => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl Stream for WebSocket {
    type Item = Result<ClientMessage, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.as_mut().poll_close_inner(cx) {
                Poll::Ready(Ok(())) => return Poll::Ready(None),
                Poll::Ready(Err(err)) => return Poll::Ready(Some(Err(err))),
                Poll::Pending => (),
            }

            let mut this = self.as_mut().project();

            if *this.heartbeat_stage == HeartbeatStage::Flushing {
                ready!(this.inner.as_mut().poll_flush(cx))?;
                *this.heartbeat_stage = HeartbeatStage::None;
            }

            match this.heartbeater.timeout.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    let reason =
                        serde_json::to_string(&ApiError::new("heartbeat timed out; disconnecting"))?;
                    let frame = CloseFrame {
                        code: 1002,
                        reason: reason.into(),
                    };
                    this.inner
                        .as_mut()
                        .start_send(ws::Message::Close(Some(frame)))?;
                    *this.close_stage = CloseStage::Flushing;
                }
                Poll::Pending => (),
            }

            let ev = ready!(this.inner.as_mut().poll_next(cx));

            match ev {
                Some(Ok(ws::Message::Text(text))) => {
                    let message = serde_json::from_str::<ClientMessage>(&text)?;
                    self.as_mut().preprocess_message(&message)?;
                    return Poll::Ready(Some(Ok(message)));
                }
                Some(Ok(ws::Message::Binary(bytes))) => {
                    let message = serde_json::from_slice::<ClientMessage>(&bytes)?;
                    self.as_mut().preprocess_message(&message)?;
                    return Poll::Ready(Some(Ok(message)));
                }
                Some(Ok(ws::Message::Close(_close_frame))) => {
                    let reason = serde_json::to_string(&ApiError::new("bye"))?;
                    let frame = CloseFrame {
                        code: 1001,
                        reason: reason.into(),
                    };
                    let mut this = self.as_mut().project();
                    *this.closed_client = true;
                    if this
                        .inner
                        .as_mut()
                        .start_send(ws::Message::Close(Some(frame)))
                        .is_err()
                    {
                        *this.close_stage = CloseStage::Closed;
                        return Poll::Ready(None);
                    } else {
                        *this.close_stage = CloseStage::Flushing;
                    }
                }
                Some(Ok(_)) => (),
                Some(Err(err)) => return Poll::Ready(Some(Err(err.into()))),
                None => return Poll::Ready(None),
            }
        }
    }
}

impl Sink<&ServerMessage> for WebSocket {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        ready!(this.inner.poll_ready(cx))?;
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: &ServerMessage) -> Result<(), Self::Error> {
        let msg = serde_json::to_string(item)?;

        let this = self.project();
        this.inner
            .start_send(ws::Message::Text(msg.into()))
            .map_err(Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        ready!(this.inner.poll_flush(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        ready!(this.inner.poll_close(cx))?;
        Poll::Ready(Ok(()))
    }
}

/// Tracks the transport-level ping sequence and the timeout that fires when
/// a client stops pinging, independent of the 60s simulation-liveness
/// eviction sweep the session manager runs.
#[derive(Debug)]
pub struct Heartbeater {
    interval: Duration,
    timeout: Pin<Box<Sleep>>,
    last_seq: Option<u64>,
}

impl Heartbeater {
    pub fn new(interval: Duration) -> Heartbeater {
        Heartbeater {
            interval,
            timeout: Box::pin(sleep(interval + HEARTBEAT_GRACE_DURATION)),
            last_seq: None,
        }
    }

    /// Acknowledges a ping, resetting the timeout. Returns the sequence to
    /// echo back, or `None` for an out-of-order ping (ignored, no pong).
    pub fn ack(&mut self, seq: u64) -> Option<u64> {
        if self.last_seq.is_none_or(|last| seq > last) {
            self.timeout = Box::pin(sleep(self.interval + HEARTBEAT_GRACE_DURATION));
            self.last_seq = Some(seq);
            Some(seq)
        } else {
            None
        }
    }
}

/// A [`WebSocket`] error.
#[derive(Debug, Display, Error, From)]
pub enum Error {
    #[display("{_0}")]
    Ws(axum::Error),
    #[display("{_0}")]
    Serde(serde_json::Error),
}
