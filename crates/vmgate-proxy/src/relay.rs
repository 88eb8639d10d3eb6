//! Bidirectional WebSocket relay
//!
//! One inbound socket (accepted by axum) is paired with one outbound socket
//! (dialed with tokio-tungstenite). Each direction is pumped by its own task;
//! whichever finishes first fires a [`CompletionLatch`] and the session tears
//! both sides down exactly once.

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as BackendCloseFrame;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::RelayFault;

/// Close reason sent to the caller when the backend socket cannot be dialed
pub const BACKEND_UNAVAILABLE: &str = "backend_unavailable";

/// Bound on flushing a close frame to either side during teardown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Direction of one forwarding task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    InboundToBackend,
    BackendToInbound,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::InboundToBackend => write!(f, "inbound->backend"),
            Leg::BackendToInbound => write!(f, "backend->inbound"),
        }
    }
}

/// What fired the latch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    DialFailed,
    Leg(Leg),
}

/// How a forwarding task stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegEnd {
    /// Source ended or forwarded a close frame
    PeerClosed,
    /// The other side finished first
    Cancelled,
    Fault(RelayFault),
}

/// Single-shot completion signal shared by both legs of a session.
///
/// The first call to [`complete`](Self::complete) wins and cancels the token;
/// every later call is a no-op.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    fired: AtomicBool,
    first: OnceLock<(Trigger, LegEnd)>,
    token: CancellationToken,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for the one caller that fired the latch
    pub fn complete(&self, trigger: Trigger, end: LegEnd) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let _ = self.first.set((trigger, end));
        self.token.cancel();
        true
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the latch has fired; immediately if it already has
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    pub fn first(&self) -> Option<&(Trigger, LegEnd)> {
        self.first.get()
    }
}

/// A message kind that can be handed verbatim to the opposite socket type
trait RelayFrame: Sized {
    type Peer;

    /// `None` for frames with no counterpart on the other side
    fn into_peer(self) -> Option<Self::Peer>;

    fn is_close(&self) -> bool;
}

impl RelayFrame for Message {
    type Peer = BackendMessage;

    fn into_peer(self) -> Option<BackendMessage> {
        Some(match self {
            Message::Text(text) => BackendMessage::Text(text.as_str().to_owned()),
            Message::Binary(data) => BackendMessage::Binary(data.to_vec()),
            Message::Ping(data) => BackendMessage::Ping(data.to_vec()),
            Message::Pong(data) => BackendMessage::Pong(data.to_vec()),
            Message::Close(frame) => BackendMessage::Close(frame.map(|f| BackendCloseFrame {
                code: CloseCode::from(f.code),
                reason: Cow::Owned(f.reason.as_str().to_owned()),
            })),
        })
    }

    fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }
}

impl RelayFrame for BackendMessage {
    type Peer = Message;

    fn into_peer(self) -> Option<Message> {
        match self {
            BackendMessage::Text(text) => Some(Message::Text(text.into())),
            BackendMessage::Binary(data) => Some(Message::Binary(Bytes::from(data))),
            BackendMessage::Ping(data) => Some(Message::Ping(Bytes::from(data))),
            BackendMessage::Pong(data) => Some(Message::Pong(Bytes::from(data))),
            BackendMessage::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
                code: u16::from(f.code),
                reason: Utf8Bytes::from(f.reason.into_owned()),
            }))),
            // Raw frames never surface from a read
            BackendMessage::Frame(_) => None,
        }
    }

    fn is_close(&self) -> bool {
        matches!(self, BackendMessage::Close(_))
    }
}

/// Copy frames from `source` to `sink` until either side ends or the latch fires.
///
/// Hands the sink back so the session can close it exactly once.
async fn pump<F, S, K, E>(
    leg: Leg,
    mut source: S,
    mut sink: K,
    latch: Arc<CompletionLatch>,
) -> (K, LegEnd)
where
    F: RelayFrame,
    S: Stream<Item = Result<F, E>> + Unpin,
    K: Sink<F::Peer> + Unpin,
    K::Error: fmt::Display,
    E: fmt::Display,
{
    let guard_latch = latch.clone();
    let _panic_guard = scopeguard::guard_on_unwind((), move |_| {
        guard_latch.complete(Trigger::Leg(leg), LegEnd::Fault(RelayFault::Panicked(leg)));
    });

    let mut forwarded: u64 = 0;

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = latch.wait() => break LegEnd::Cancelled,
            next = source.next() => next,
        };

        match next {
            None => break LegEnd::PeerClosed,
            Some(Err(e)) => {
                break LegEnd::Fault(RelayFault::Read {
                    leg,
                    reason: e.to_string(),
                })
            }
            Some(Ok(frame)) => {
                let closing = frame.is_close();
                if let Some(out) = frame.into_peer() {
                    // A peer that stopped reading must not outlive the session
                    let sent = tokio::select! {
                        biased;
                        _ = latch.wait() => break LegEnd::Cancelled,
                        sent = sink.send(out) => sent,
                    };
                    if let Err(e) = sent {
                        break LegEnd::Fault(RelayFault::Write {
                            leg,
                            reason: e.to_string(),
                        });
                    }
                    forwarded += 1;
                }
                if closing {
                    break LegEnd::PeerClosed;
                }
            }
        }
    };

    debug!("{} stopped after {} frame(s): {:?}", leg, forwarded, end);
    latch.complete(Trigger::Leg(leg), end.clone());
    (sink, end)
}

async fn close_sink<K, M>(leg: Leg, mut sink: K)
where
    K: Sink<M> + Unpin,
    K::Error: fmt::Display,
{
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Closing {} sink: {}", leg, e),
        Err(_) => debug!("Closing {} sink timed out", leg),
    }
}

/// Summary of a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub id: Uuid,
    pub first_leg: Option<Trigger>,
    pub reason: Option<LegEnd>,
}

/// One paired inbound/backend socket
pub struct RelaySession {
    id: Uuid,
    latch: Arc<CompletionLatch>,
}

impl RelaySession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            latch: Arc::new(CompletionLatch::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn latch(&self) -> &Arc<CompletionLatch> {
        &self.latch
    }

    /// Relay until one side finishes, then tear both down
    pub async fn run(self, inbound: WebSocket, backend: BackendSocket) -> SessionOutcome {
        let (inbound_tx, inbound_rx) = inbound.split();
        let (backend_tx, backend_rx) = backend.split();

        let upstream = tokio::spawn(pump(
            Leg::InboundToBackend,
            inbound_rx,
            backend_tx,
            self.latch.clone(),
        ));
        let downstream = tokio::spawn(pump(
            Leg::BackendToInbound,
            backend_rx,
            inbound_tx,
            self.latch.clone(),
        ));

        self.latch.wait().await;

        let (upstream, downstream) = tokio::join!(upstream, downstream);
        match upstream {
            Ok((sink, _)) => close_sink::<_, BackendMessage>(Leg::InboundToBackend, sink).await,
            Err(e) => warn!("{} task failed: {}", Leg::InboundToBackend, e),
        }
        match downstream {
            Ok((sink, _)) => close_sink::<_, Message>(Leg::BackendToInbound, sink).await,
            Err(e) => warn!("{} task failed: {}", Leg::BackendToInbound, e),
        }

        self.outcome()
    }

    fn outcome(&self) -> SessionOutcome {
        let first = self.latch.first().cloned();
        let outcome = SessionOutcome {
            id: self.id,
            first_leg: first.as_ref().map(|(trigger, _)| *trigger),
            reason: first.map(|(_, end)| end),
        };
        info!(
            "Relay session ended (first: {:?}, reason: {:?})",
            outcome.first_leg, outcome.reason
        );
        outcome
    }
}

impl Default for RelaySession {
    fn default() -> Self {
        Self::new()
    }
}

/// Dial `backend_url` and relay `inbound` to it.
///
/// If the backend cannot be dialed within `dial_timeout` the caller receives a
/// single close frame (1011, `backend_unavailable`).
pub async fn serve_socket(
    mut inbound: WebSocket,
    backend_url: String,
    dial_timeout: Duration,
) -> SessionOutcome {
    let session = RelaySession::new();
    let span = info_span!("relay_session", id = %session.id, backend = %backend_url);

    async move {
        debug!("Dialing backend socket {}", backend_url);

        let dialed = match tokio::time::timeout(dial_timeout, connect_async(backend_url.as_str()))
            .await
        {
            Ok(Ok((stream, _))) => Ok(stream),
            Ok(Err(e)) => Err(RelayFault::Dial(e.to_string())),
            Err(_) => Err(RelayFault::Dial(format!(
                "timed out after {:?}",
                dial_timeout
            ))),
        };

        match dialed {
            Ok(backend) => {
                info!("Relaying to {}", backend_url);
                session.run(inbound, backend).await
            }
            Err(fault) => {
                warn!("{}", fault);
                let frame = CloseFrame {
                    code: close_code::ERROR,
                    reason: Utf8Bytes::from_static(BACKEND_UNAVAILABLE),
                };
                if let Err(e) = inbound.send(Message::Close(Some(frame))).await {
                    debug!("Caller went away before close: {}", e);
                }
                session
                    .latch
                    .complete(Trigger::DialFailed, LegEnd::Fault(fault));
                session.outcome()
            }
        }
    }
    .instrument(span)
    .await
}
