//! Wire transports for talking to a node.
//!
//! The node protocol itself is owned by the node service; this client only
//! needs "send this frame" and a stream of decoded inbound events. The
//! default transport speaks newline-delimited JSON frames over TCP. A
//! channel-backed transport is provided for tests and embedding.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::{Frame, NodeEvent, TransportError};

/// Upper bound on a single frame line. Larger playlists still fit with room
/// to spare; anything beyond this is a protocol violation.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Buffered outbound frames per connection.
const OUTBOUND_BUFFER: usize = 64;

/// Buffered decoded events per connection.
const EVENT_BUFFER: usize = 256;

/// Outbound half of a node connection.
///
/// Implementations must be cheap to call concurrently; delivery is
/// per-connection sequential.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Queue a frame for delivery.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] once the connection is gone.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Whether the connection is still believed alive.
    fn is_connected(&self) -> bool;

    /// Tear the connection down. Idempotent.
    fn close(&self);
}

/// Newline-delimited JSON frames over TCP.
pub struct TcpNodeTransport {
    tx: mpsc::Sender<Frame>,
    alive: Arc<AtomicBool>,
}

impl TcpNodeTransport {
    /// Connect to a node and identify against it.
    ///
    /// Returns the outbound transport handle and the stream of decoded
    /// inbound events. The event stream ends when the connection dies.
    ///
    /// # Errors
    /// Returns an error if the TCP connect or the identify write fails.
    pub async fn connect(
        host: &str,
        port: u16,
        password: &str,
        user_id: u64,
    ) -> Result<(Self, mpsc::Receiver<NodeEvent>), TransportError> {
        let stream = TcpStream::connect((host, port)).await?;
        tracing::debug!(%host, port, "node transport connected");

        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

        let identify = Frame::new(
            "IDENTIFY",
            json!({ "password": password, "user_id": user_id }),
        );
        framed
            .send(encode(&identify)?)
            .await
            .map_err(codec_error)?;

        let (mut sink, mut source) = framed.split();
        let (tx, mut outbound) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let alive = Arc::new(AtomicBool::new(true));

        let writer_alive = Arc::clone(&alive);
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let line = match encode(&frame) {
                    Ok(line) => line,
                    Err(error) => {
                        tracing::warn!(%error, name = %frame.name, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(error) = sink.send(line).await {
                    tracing::warn!(error = %codec_error(error), "node write failed");
                    break;
                }
            }
            writer_alive.store(false, Ordering::Release);
            let _ = sink.close().await;
        });

        let reader_alive = Arc::clone(&alive);
        tokio::spawn(async move {
            while let Some(line) = source.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(error) => {
                        tracing::warn!(error = %codec_error(error), "node read failed");
                        break;
                    }
                };
                let frame: Frame = match serde_json::from_str(&line) {
                    Ok(frame) => frame,
                    Err(error) => {
                        tracing::warn!(%error, "skipping malformed frame");
                        continue;
                    }
                };
                if events_tx.send(NodeEvent::from_frame(frame)).await.is_err() {
                    break;
                }
            }
            reader_alive.store(false, Ordering::Release);
        });

        Ok((Self { tx, alive }, events_rx))
    }
}

#[async_trait]
impl NodeTransport for TcpNodeTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

fn encode(frame: &Frame) -> Result<String, TransportError> {
    serde_json::to_string(frame).map_err(|e| TransportError::Malformed(e.to_string()))
}

fn codec_error(error: LinesCodecError) -> TransportError {
    match error {
        LinesCodecError::Io(io) => TransportError::Io(io),
        LinesCodecError::MaxLineLengthExceeded => {
            TransportError::Malformed("frame exceeds line limit".to_owned())
        }
    }
}

/// In-memory transport: sent frames land on a channel the embedder reads.
///
/// Pair this with a hand-fed event receiver to drive a node without a
/// network; the test suite is built on it.
pub struct ChannelNodeTransport {
    tx: mpsc::UnboundedSender<Frame>,
    alive: Arc<AtomicBool>,
}

impl ChannelNodeTransport {
    /// Create a transport plus the receiving end of everything sent on it.
    #[must_use]
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                alive: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }
}

#[async_trait]
impl NodeTransport for ChannelNodeTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Release);
    }
}
