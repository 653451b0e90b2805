//! WebSocket transport: connection lifecycle, outbound dispatch, and
//! inbound fragment reassembly.

use std::time::Duration;

use futures_channel::{mpsc, oneshot};
use futures_util::{select, sink::SinkExt, stream::StreamExt, FutureExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, trace};

use crate::errors::TransportError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A single fully-reassembled inbound message, or a lifecycle signal.
#[derive(Debug)]
pub enum TransportEvent {
    Message(Vec<u8>),
    Closed { code: Option<u16>, reason: Option<String> },
    Error(TransportError),
}

/// Concatenates fragment payloads until the final flag is observed, then
/// yields one buffer. `tokio-tungstenite` already reassembles continuation
/// frames into a single [`Message`] before handing it to us, so in practice
/// every push is final; the accumulator still honors the general contract
/// (push non-final fragments, get `None`; push the final fragment, get the
/// concatenated buffer) so the decoder never has to care how the frame
/// arrived.
#[derive(Default)]
struct FragmentAccumulator {
    buf: Vec<u8>,
}

impl FragmentAccumulator {
    fn push(&mut self, mut chunk: Vec<u8>, is_final: bool) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            self.buf = chunk;
        } else {
            self.buf.append(&mut chunk);
        }
        if is_final {
            Some(std::mem::take(&mut self.buf))
        } else {
            None
        }
    }
}

/// Handle used by the connection supervisor to drive an open socket: send
/// outbound frames, and receive reassembled inbound frames / lifecycle
/// events.
pub struct TransportHandle {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: oneshot::Sender<()>,
}

impl TransportHandle {
    /// Gracefully close the connection.
    pub fn close(self) {
        let _ = self.shutdown.send(());
    }
}

struct TransportTask {
    socket: Socket,
    handler: mpsc::UnboundedSender<TransportEvent>,
    to_dispatch: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: oneshot::Receiver<()>,
    accumulator: FragmentAccumulator,
}

impl TransportTask {
    async fn handle_message(&mut self, message: Message) -> Option<Vec<u8>> {
        match message {
            Message::Binary(bytes) => self.accumulator.push(bytes, true),
            Message::Text(text) => {
                // should not happen in normal operation; converted to bytes
                // so the decoder sees a uniform byte stream
                self.accumulator.push(text.into_bytes(), true)
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
            Message::Close(frame) => {
                let (code, reason) = close_frame_parts(frame);
                let _ = self.handler.unbounded_send(TransportEvent::Closed { code, reason });
                None
            }
        }
    }

    async fn run(mut self) {
        loop {
            let keepalive = tokio::time::sleep(KEEPALIVE_INTERVAL).fuse();
            tokio::pin!(keepalive);

            select! {
                _ = keepalive => {
                    if let Err(e) = self.socket.send(Message::Ping(Vec::new())).await {
                        error!(err = %e, "websocket send error during keepalive");
                        let _ = self.handler.unbounded_send(TransportEvent::Error(e.into()));
                        break
                    }
                }
                item = self.socket.next().fuse() => {
                    match item {
                        Some(Ok(message)) => {
                            if let Some(buf) = self.handle_message(message).await {
                                trace!(len = buf.len(), "reassembled inbound message");
                                if self.handler.unbounded_send(TransportEvent::Message(buf)).is_err() {
                                    break
                                }
                            }
                        }
                        Some(Err(e)) => {
                            error!(err = %e, "websocket stream error");
                            let _ = self.handler.unbounded_send(TransportEvent::Error(e.into()));
                            break
                        }
                        None => {
                            debug!("websocket stream ended");
                            let _ = self
                                .handler
                                .unbounded_send(TransportEvent::Closed { code: None, reason: None });
                            break
                        }
                    }
                }
                outgoing = self.to_dispatch.next().fuse() => {
                    match outgoing {
                        Some(bytes) => {
                            if let Err(e) = self.socket.send(Message::Binary(bytes)).await {
                                error!(err = %e, "websocket send error");
                                let _ = self.handler.unbounded_send(TransportEvent::Error(e.into()));
                                break
                            }
                        }
                        None => break,
                    }
                }
                _ = (&mut self.shutdown).fuse() => {
                    let _ = self.socket.close(None).await;
                    break
                }
            }
        }
    }
}

fn close_frame_parts(frame: Option<CloseFrame<'static>>) -> (Option<u16>, Option<String>) {
    match frame {
        Some(f) => (Some(f.code.into()), Some(f.reason.into_owned())),
        None => (None, None),
    }
}

/// Open a plaintext WebSocket connection to `ws://<host>:<port>/api`.
pub async fn connect(host: &str, port: u16) -> Result<TransportHandle, TransportError> {
    let url = format!("ws://{host}:{port}/api");
    let (socket, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(&url))
        .await
        .map_err(|_| TransportError::ConnectTimeout)??;

    let (handler, events) = mpsc::unbounded();
    let (dispatcher, to_dispatch) = mpsc::unbounded();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let task = TransportTask {
        socket,
        handler,
        to_dispatch,
        shutdown: shutdown_rx,
        accumulator: FragmentAccumulator::default(),
    };
    tokio::spawn(task.run());

    Ok(TransportHandle { events, outbound: dispatcher, shutdown: shutdown_tx })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accumulator_yields_on_final_fragment() {
        let mut acc = FragmentAccumulator::default();
        assert_eq!(acc.push(b"hel".to_vec(), false), None);
        assert_eq!(acc.push(b"lo".to_vec(), false), None);
        assert_eq!(acc.push(b"!".to_vec(), true), Some(b"hello!".to_vec()));
    }

    #[test]
    fn accumulator_handles_single_final_fragment() {
        let mut acc = FragmentAccumulator::default();
        assert_eq!(acc.push(b"whole".to_vec(), true), Some(b"whole".to_vec()));
    }
}
