//! Media connection: stream attachment over a negotiated transport.
//!
//! The broker routes opaque stream handles; producing or rendering actual
//! media is the application's business. An incoming call holds the remote
//! offer until the application answers it with a local stream.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use super::{ConnectionKind, generate_connection_id};
use crate::error::{Error, ErrorKind};
use crate::message::SignalFrame;
use crate::negotiator::{Negotiator, SdpTransform, Target};
use crate::session::Session;
use crate::socket::SignalingSocket;
use crate::transport::{MediaStream, SessionDescription, TransportFactory};

/// Caller knobs for an outgoing call.
#[derive(Default, Clone)]
pub struct CallOptions {
    pub metadata: Option<Value>,
    pub connection_id: Option<String>,
    pub sdp_transform: Option<SdpTransform>,
}

#[derive(Debug)]
pub enum MediaEvent {
    /// The remote stream arrived. Emitted at most once.
    Stream(MediaStream),
    /// Emitted once, and only if the connection had opened.
    Close,
    Error(Error),
}

pub struct MediaConnection {
    peer_id: String,
    connection_id: String,
    metadata: Option<Value>,
    session: Weak<Session>,
    open: AtomicBool,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<MediaEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MediaEvent>>>,
    negotiator: Negotiator,
    local_stream: Mutex<Option<MediaStream>>,
    remote_stream: Mutex<Option<MediaStream>>,
    /// The remote offer, held until the application answers.
    pending_offer: Mutex<Option<SessionDescription>>,
}

impl MediaConnection {
    pub(crate) fn new(
        session: Weak<Session>,
        socket: Arc<SignalingSocket>,
        factory: Arc<dyn TransportFactory>,
        peer_id: String,
        options: CallOptions,
    ) -> Arc<Self> {
        let connection_id = options
            .connection_id
            .unwrap_or_else(|| generate_connection_id(ConnectionKind::Media));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|weak: &Weak<MediaConnection>| MediaConnection {
            negotiator: Negotiator::new(
                socket,
                factory,
                peer_id.clone(),
                connection_id.clone(),
                ConnectionKind::Media,
                Target::Media(weak.clone()),
                options.sdp_transform,
            ),
            peer_id,
            connection_id,
            metadata: options.metadata,
            session,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events: events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            local_stream: Mutex::new(None),
            remote_stream: Mutex::new(None),
            pending_offer: Mutex::new(None),
        })
    }

    /// Hands the event stream to its one consumer; later calls get `None`.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>> {
        self.events_rx.lock().take()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn metadata(&self) -> Option<Value> {
        self.metadata.clone()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.local_stream.lock().clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.remote_stream.lock().clone()
    }

    pub(crate) fn has_transport(&self) -> bool {
        self.negotiator.has_transport()
    }

    pub(crate) fn set_pending_offer(&self, offer: SessionDescription) {
        *self.pending_offer.lock() = Some(offer);
    }

    /// Caller side: attach the local stream and send the offer.
    pub(crate) async fn begin_offer(&self, stream: MediaStream) -> Result<(), Error> {
        *self.local_stream.lock() = Some(stream);
        self.negotiator.start_originator().await
    }

    /// Accepts an incoming call with a local stream. Answering twice is a
    /// warning and a no-op; frames stashed before the answer are replayed.
    pub async fn answer(self: &Arc<Self>, stream: MediaStream) -> Result<(), Error> {
        if self.local_stream.lock().is_some() {
            tracing::warn!(
                target = "connection",
                connection = %self.connection_id,
                "call already answered, ignoring"
            );
            return Ok(());
        }
        let Some(offer) = self.pending_offer.lock().take() else {
            return Err(Error::new(
                ErrorKind::Negotiation,
                "no pending offer to answer",
            ));
        };
        *self.local_stream.lock() = Some(stream);
        self.negotiator.start_answerer(offer).await?;

        if let Some(session) = self.session.upgrade() {
            for frame in session.take_stash(&self.connection_id) {
                self.handle_frame(frame).await;
            }
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) async fn handle_frame(&self, frame: SignalFrame) {
        match frame {
            SignalFrame::Answer { payload, .. } => {
                match self.negotiator.handle_remote_description(payload.sdp).await {
                    Ok(()) => {
                        if !self.closed.load(Ordering::SeqCst) {
                            self.open.store(true, Ordering::SeqCst);
                        }
                    }
                    Err(err) => self.emit(MediaEvent::Error(err)),
                }
            }
            SignalFrame::Candidate { payload, .. } => {
                if let Err(err) = self.negotiator.handle_candidate(payload.candidate).await {
                    self.emit(MediaEvent::Error(err));
                }
            }
            other => {
                tracing::warn!(
                    target = "connection",
                    connection = %self.connection_id,
                    kind = other.kind_str(),
                    "unexpected frame for media connection"
                );
            }
        }
    }

    /// The remote stream surfaced on the transport. Later streams on the
    /// same connection are ignored.
    pub(crate) fn attach_remote(&self, stream: MediaStream) {
        let mut remote = self.remote_stream.lock();
        if remote.is_some() {
            tracing::debug!(
                target = "connection",
                connection = %self.connection_id,
                "remote stream already attached, ignoring another"
            );
            return;
        }
        *remote = Some(stream.clone());
        drop(remote);
        self.emit(MediaEvent::Stream(stream));
    }

    pub(crate) fn fail(&self, error: Error) {
        self.emit(MediaEvent::Error(error));
        self.close();
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_open = self.open.swap(false, Ordering::SeqCst);
        self.local_stream.lock().take();
        self.remote_stream.lock().take();
        self.pending_offer.lock().take();
        self.negotiator.cleanup();
        if let Some(session) = self.session.upgrade() {
            session.remove_connection(&self.peer_id, &self.connection_id);
        }
        if was_open {
            let _ = self.events.send(MediaEvent::Close);
        }
    }

    fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for MediaConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaConnection")
            .field("peer_id", &self.peer_id)
            .field("connection_id", &self.connection_id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::transport::mock::MockFactory;

    fn call_parts() -> (Arc<MediaConnection>, mpsc::UnboundedReceiver<MediaEvent>) {
        let (socket, _socket_events) = SignalingSocket::new(&SessionConfig::default());
        let factory: Arc<dyn TransportFactory> = Arc::new(MockFactory::new());
        let connection = MediaConnection::new(
            Weak::new(),
            socket,
            factory,
            "remote".into(),
            CallOptions::default(),
        );
        let events = connection.take_events().expect("events");
        (connection, events)
    }

    #[tokio::test]
    async fn answering_without_an_offer_is_an_error() {
        let (connection, _events) = call_parts();
        let err = connection
            .answer(MediaStream::new("cam"))
            .await
            .expect_err("caller side has no pending offer");
        assert_eq!(err.kind(), ErrorKind::Negotiation);
    }

    #[tokio::test]
    async fn answer_opens_and_second_answer_is_ignored() {
        use crate::transport::SdpKind;
        let (connection, _events) = call_parts();
        connection.set_pending_offer(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0".into(),
        });
        connection
            .answer(MediaStream::new("cam"))
            .await
            .expect("answer");
        assert!(connection.is_open());
        assert_eq!(connection.local_stream().map(|s| s.id), Some("cam".into()));

        connection
            .answer(MediaStream::new("other"))
            .await
            .expect("no-op");
        assert_eq!(connection.local_stream().map(|s| s.id), Some("cam".into()));
    }

    #[tokio::test]
    async fn remote_stream_attaches_once() {
        let (connection, mut events) = call_parts();
        connection.attach_remote(MediaStream::new("remote-a"));
        connection.attach_remote(MediaStream::new("remote-b"));
        match events.try_recv() {
            Ok(MediaEvent::Stream(stream)) => assert_eq!(stream.id, "remote-a"),
            other => panic!("expected one stream event, got {other:?}"),
        }
        assert!(events.try_recv().is_err());
        assert_eq!(connection.remote_stream().map(|s| s.id), Some("remote-a".into()));
    }

    #[tokio::test]
    async fn close_clears_streams_and_is_idempotent() {
        let (connection, mut events) = call_parts();
        connection.open.store(true, Ordering::SeqCst);
        connection.attach_remote(MediaStream::new("remote"));
        let _ = events.try_recv();

        connection.close();
        connection.close();
        assert!(connection.remote_stream().is_none());
        assert!(matches!(events.try_recv(), Ok(MediaEvent::Close)));
        assert!(events.try_recv().is_err());
    }
}
