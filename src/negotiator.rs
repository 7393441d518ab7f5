//! Per-connection negotiation driver.
//!
//! Each connection owns one [`Negotiator`], which owns one transport session
//! and a pump task draining its events. The negotiator runs the description
//! exchange (offer out or answer back), forwards local candidates to the
//! remote peer over signaling, and translates transport lifecycle events
//! into calls on the owning connection.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;

use crate::connection::{ConnectionKind, DataConnection, MediaConnection};
use crate::error::{Error, ErrorKind, TransportError};
use crate::message::{AnswerPayload, CandidatePayload, OfferPayload, SignalFrame};
use crate::socket::SignalingSocket;
use crate::transport::{
    IceCandidate, NegotiationState, SdpKind, SessionDescription, TransportEvent, TransportFactory,
    TransportSession,
};

/// Hook applied to every locally produced description before it is committed
/// and sent.
pub type SdpTransform = Arc<dyn Fn(String) -> String + Send + Sync>;

/// The connection this negotiator reports back to. Weak, so a dropped
/// connection ends the pump instead of being kept alive by it.
#[derive(Clone)]
pub(crate) enum Target {
    Data(Weak<DataConnection>),
    Media(Weak<MediaConnection>),
}

impl Target {
    fn close(&self) {
        match self {
            Target::Data(conn) => {
                if let Some(conn) = conn.upgrade() {
                    conn.close();
                }
            }
            Target::Media(conn) => {
                if let Some(conn) = conn.upgrade() {
                    conn.close();
                }
            }
        }
    }

    fn fail(&self, error: Error) {
        match self {
            Target::Data(conn) => {
                if let Some(conn) = conn.upgrade() {
                    conn.fail(error);
                }
            }
            Target::Media(conn) => {
                if let Some(conn) = conn.upgrade() {
                    conn.fail(error);
                }
            }
        }
    }

    fn is_gone(&self) -> bool {
        match self {
            Target::Data(conn) => conn.strong_count() == 0,
            Target::Media(conn) => conn.strong_count() == 0,
        }
    }
}

pub(crate) struct Negotiator {
    peer_id: String,
    connection_id: String,
    kind: ConnectionKind,
    socket: Arc<SignalingSocket>,
    factory: Arc<dyn TransportFactory>,
    transport: OnceLock<Arc<dyn TransportSession>>,
    target: Target,
    sdp_transform: Option<SdpTransform>,
    detached: Arc<AtomicBool>,
    /// Set once the transport reports connected; local candidates surfacing
    /// after that are noise and stay local.
    squelch_candidates: Arc<AtomicBool>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Negotiator {
    pub(crate) fn new(
        socket: Arc<SignalingSocket>,
        factory: Arc<dyn TransportFactory>,
        peer_id: String,
        connection_id: String,
        kind: ConnectionKind,
        target: Target,
        sdp_transform: Option<SdpTransform>,
    ) -> Self {
        Self {
            peer_id,
            connection_id,
            kind,
            socket,
            factory,
            transport: OnceLock::new(),
            target,
            sdp_transform,
            detached: Arc::new(AtomicBool::new(false)),
            squelch_candidates: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
        }
    }

    pub(crate) fn has_transport(&self) -> bool {
        self.transport.get().is_some()
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn TransportSession>> {
        self.transport.get().cloned()
    }

    /// Originator path: mint a transport, request the data channel when this
    /// is a data connection, then produce and send the offer.
    pub(crate) async fn start_originator(&self) -> Result<(), Error> {
        let transport = self.create_transport().await?;
        if self.kind == ConnectionKind::Data {
            if let Target::Data(conn) = &self.target {
                if let Some(conn) = conn.upgrade() {
                    transport
                        .create_data_channel(conn.label(), conn.is_reliable())
                        .await
                        .map_err(negotiation_error)?;
                }
            }
        }
        self.make_offer(&transport).await
    }

    /// Answerer path: mint a transport, commit the remote offer, then
    /// produce and send the answer.
    pub(crate) async fn start_answerer(&self, offer: SessionDescription) -> Result<(), Error> {
        let transport = self.create_transport().await?;
        transport
            .commit_remote(offer)
            .await
            .map_err(negotiation_error)?;
        self.make_answer(&transport).await
    }

    /// Routes a remote description arriving over signaling. Answers are
    /// committed; a renegotiation offer is committed and answered.
    pub(crate) async fn handle_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), Error> {
        let Some(transport) = self.transport.get().cloned() else {
            return Err(Error::new(
                ErrorKind::Negotiation,
                "description arrived before negotiation started",
            ));
        };
        let desc_kind = desc.kind;
        transport
            .commit_remote(desc)
            .await
            .map_err(negotiation_error)?;
        if desc_kind == SdpKind::Offer {
            self.make_answer(&transport).await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        let Some(transport) = self.transport.get().cloned() else {
            return Err(Error::new(
                ErrorKind::Negotiation,
                "candidate arrived before negotiation started",
            ));
        };
        transport
            .add_remote_candidate(candidate)
            .await
            .map_err(negotiation_error)
    }

    /// Detaches from the transport: stops the pump and closes the transport
    /// unless it already reached a terminal state by itself. Idempotent.
    pub(crate) fn cleanup(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if let Some(transport) = self.transport.get().cloned() {
            if !transport.is_terminal() {
                // Reachable from Drop, which may run outside the runtime.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        transport.close().await;
                    });
                }
            }
        }
    }

    async fn create_transport(&self) -> Result<Arc<dyn TransportSession>, Error> {
        let (transport, events) = self
            .factory
            .create(self.kind)
            .await
            .map_err(|err| Error::new(ErrorKind::Negotiation, err.to_string()))?;
        if self.transport.set(Arc::clone(&transport)).is_err() {
            return Err(Error::new(
                ErrorKind::Negotiation,
                "negotiation already started",
            ));
        }
        self.spawn_pump(events);
        Ok(transport)
    }

    async fn make_offer(&self, transport: &Arc<dyn TransportSession>) -> Result<(), Error> {
        let desc = self.local_description(transport, SdpKind::Offer).await?;
        transport
            .commit_local(desc.clone())
            .await
            .map_err(negotiation_error)?;

        let (label, serialization, reliable, metadata) = match &self.target {
            Target::Data(conn) => match conn.upgrade() {
                Some(conn) => (
                    Some(conn.label().to_string()),
                    Some(conn.serialization()),
                    Some(conn.is_reliable()),
                    conn.metadata(),
                ),
                None => return Ok(()),
            },
            Target::Media(conn) => match conn.upgrade() {
                Some(conn) => (None, None, None, conn.metadata()),
                None => return Ok(()),
            },
        };
        tracing::debug!(
            target = "negotiator",
            peer = %self.peer_id,
            connection = %self.connection_id,
            "sending offer"
        );
        self.socket.send(SignalFrame::Offer {
            src: None,
            dst: Some(self.peer_id.clone()),
            payload: OfferPayload {
                connection_id: self.connection_id.clone(),
                kind: self.kind,
                sdp: desc,
                label,
                serialization,
                reliable,
                metadata,
            },
        });
        Ok(())
    }

    async fn make_answer(&self, transport: &Arc<dyn TransportSession>) -> Result<(), Error> {
        let desc = self.local_description(transport, SdpKind::Answer).await?;
        transport
            .commit_local(desc.clone())
            .await
            .map_err(negotiation_error)?;
        tracing::debug!(
            target = "negotiator",
            peer = %self.peer_id,
            connection = %self.connection_id,
            "sending answer"
        );
        self.socket.send(SignalFrame::Answer {
            src: None,
            dst: Some(self.peer_id.clone()),
            payload: AnswerPayload {
                connection_id: self.connection_id.clone(),
                kind: self.kind,
                sdp: desc,
            },
        });
        Ok(())
    }

    async fn local_description(
        &self,
        transport: &Arc<dyn TransportSession>,
        kind: SdpKind,
    ) -> Result<SessionDescription, Error> {
        let mut desc = match kind {
            SdpKind::Offer => transport.create_offer().await,
            SdpKind::Answer => transport.create_answer().await,
        }
        .map_err(negotiation_error)?;
        if let Some(transform) = &self.sdp_transform {
            desc.sdp = transform(desc.sdp);
        }
        Ok(desc)
    }

    fn spawn_pump(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let socket = Arc::clone(&self.socket);
        let target = self.target.clone();
        let detached = Arc::clone(&self.detached);
        let squelch = Arc::clone(&self.squelch_candidates);
        let peer_id = self.peer_id.clone();
        let connection_id = self.connection_id.clone();
        let kind = self.kind;

        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if detached.load(Ordering::SeqCst) || target.is_gone() {
                    break;
                }
                match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        if squelch.load(Ordering::SeqCst) {
                            tracing::trace!(
                                target = "negotiator",
                                connection = %connection_id,
                                "negotiation settled, keeping local candidate"
                            );
                            continue;
                        }
                        socket.send(SignalFrame::Candidate {
                            src: None,
                            dst: Some(peer_id.clone()),
                            payload: CandidatePayload {
                                connection_id: connection_id.clone(),
                                kind,
                                candidate,
                            },
                        });
                    }
                    TransportEvent::ChannelOpen => {
                        if let Target::Data(conn) = &target {
                            if let Some(conn) = conn.upgrade() {
                                conn.channel_opened();
                            }
                        }
                    }
                    TransportEvent::ChannelClosed => {
                        tracing::debug!(
                            target = "negotiator",
                            connection = %connection_id,
                            "data channel closed underneath the connection"
                        );
                        target.close();
                    }
                    TransportEvent::Data(bytes) => {
                        if let Target::Data(conn) = &target {
                            if let Some(conn) = conn.upgrade() {
                                conn.handle_incoming(bytes).await;
                            }
                        }
                    }
                    TransportEvent::RemoteTrack(stream) => {
                        if let Target::Media(conn) = &target {
                            if let Some(conn) = conn.upgrade() {
                                conn.attach_remote(stream);
                            }
                        }
                    }
                    TransportEvent::StateChange(state) => match state {
                        // Candidates keep flowing through connected; they
                        // settle only once the exchange completes.
                        NegotiationState::Completed => {
                            squelch.store(true, Ordering::SeqCst);
                        }
                        NegotiationState::Failed | NegotiationState::Closed => {
                            target.fail(Error::new(
                                ErrorKind::Negotiation,
                                format!("transport reached {state:?} state"),
                            ));
                        }
                        NegotiationState::Disconnected => {
                            tracing::info!(
                                target = "negotiator",
                                connection = %connection_id,
                                "transport disconnected, waiting it out"
                            );
                        }
                        NegotiationState::New
                        | NegotiationState::Connecting
                        | NegotiationState::Connected => {}
                    },
                }
            }
        });
        *self.pump.lock() = Some(pump);
    }
}

impl Drop for Negotiator {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn negotiation_error(err: TransportError) -> Error {
    Error::new(ErrorKind::Negotiation, err.to_string())
}
