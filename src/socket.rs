//! Websocket signaling channel to the relay.
//!
//! One socket per session. Frames sent before the websocket is up are queued
//! and flushed in order once it opens; frames sent after the socket has
//! closed are dropped silently. The socket reports exactly one
//! [`SocketEvent::Disconnected`] when the relay side goes away.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};

use crate::config::{PROTOCOL_VERSION, SessionConfig};
use crate::error::{Error, ErrorKind};
use crate::message::SignalFrame;

/// What the socket surfaces to its owning session.
#[derive(Debug)]
pub enum SocketEvent {
    Message(SignalFrame),
    /// The relay side went away. Emitted at most once per socket.
    Disconnected,
}

pub struct SignalingSocket {
    endpoint: String,
    ping_interval: Duration,
    events: mpsc::UnboundedSender<SocketEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    queued: Mutex<Vec<SignalFrame>>,
    started: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SignalingSocket {
    pub fn new(config: &SessionConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<SocketEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let socket = Arc::new(Self {
            endpoint: config.ws_endpoint(),
            ping_interval: config.ping_interval,
            events: events_tx,
            outbound: Mutex::new(None),
            queued: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        (socket, events_rx)
    }

    /// Connects and spawns the reader, writer, and heartbeat tasks. A second
    /// call is a no-op.
    pub async fn start(self: &Arc<Self>, id: &str, token: &str) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let url = format!(
            "{}&id={id}&token={token}&version={PROTOCOL_VERSION}",
            self.endpoint
        );
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|err| {
            self.closed.store(true, Ordering::SeqCst);
            Error::new(
                ErrorKind::SocketError,
                format!("signaling websocket connect failed: {err}"),
            )
        })?;
        tracing::debug!(target = "signaling", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
        {
            let mut outbound = self.outbound.lock();
            *outbound = Some(send_tx.clone());
            // Flush frames queued before the websocket was up, in order.
            for frame in self.queued.lock().drain(..) {
                if let Ok(text) = serde_json::to_string(&frame) {
                    let _ = send_tx.send(Message::Text(text));
                }
            }
        }

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                if ws_write.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_socket = Arc::clone(self);
        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalFrame>(&text) {
                        Ok(frame) => {
                            if reader_socket
                                .events
                                .send(SocketEvent::Message(frame))
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::debug!(
                                target = "signaling",
                                %err,
                                len = text.len(),
                                "dropping malformed signaling frame"
                            );
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "signaling",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "signaling",
                                    "signaling websocket error: {err}"
                                );
                            }
                        }
                        break;
                    }
                }
            }
            reader_socket.mark_disconnected();
        });

        let heartbeat_tx = send_tx;
        let ping_interval = self.ping_interval;
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Ok(text) = serde_json::to_string(&SignalFrame::Heartbeat) else {
                    break;
                };
                if heartbeat_tx.send(Message::Text(text)).is_err() {
                    break;
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(writer_handle);
        tasks.push(reader_handle);
        tasks.push(heartbeat_handle);
        Ok(())
    }

    /// Hands a frame to the writer. Drops it silently when the socket has
    /// closed; queues it when the websocket is not up yet.
    pub fn send(&self, frame: SignalFrame) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!(
                target = "signaling",
                kind = frame.kind_str(),
                "socket closed, dropping outbound frame"
            );
            return;
        }
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => {
                if let Ok(text) = serde_json::to_string(&frame) {
                    let _ = tx.send(Message::Text(text));
                }
            }
            None => {
                drop(outbound);
                self.queued.lock().push(frame);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn queued_frames(&self) -> Vec<SignalFrame> {
        self.queued.lock().clone()
    }

    /// Deliberate local shutdown; never emits [`SocketEvent::Disconnected`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn mark_disconnected(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound.lock().take();
        let _ = self.events.send(SocketEvent::Disconnected);
    }
}

impl Drop for SignalingSocket {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
