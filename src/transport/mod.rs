//! Collaborator seam for the point-to-point transport.
//!
//! The broker never parses SDP or touches ICE itself: it drives an opaque
//! [`TransportSession`] capability that can mint local descriptions, accept
//! remote ones, exchange candidates, and move bytes once a channel is up.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::connection::ConnectionKind;
use crate::error::TransportError;

pub mod mock;
pub mod webrtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A local or remote session description, opaque to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// A network reachability hint exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// Opaque handle naming a remote or local media stream. The broker routes
/// these; producing and consuming actual media is the application's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Lifecycle of the underlying negotiation, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    Connecting,
    Connected,
    /// Completed means candidates have settled; local candidate forwarding
    /// stops here.
    Completed,
    /// Transient; logged but not acted on.
    Disconnected,
    /// Terminal: the owning connection closes.
    Failed,
    /// Terminal: the owning connection closes.
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

/// Events a transport session emits while negotiating and afterwards.
#[derive(Debug)]
pub enum TransportEvent {
    /// A local candidate surfaced; forwarded to the remote peer immediately.
    LocalCandidate(IceCandidate),
    /// The data channel became usable.
    ChannelOpen,
    /// The data channel closed underneath us.
    ChannelClosed,
    /// Raw bytes arrived on the data channel.
    Data(Bytes),
    /// An inbound media stream appeared.
    RemoteTrack(MediaStream),
    StateChange(NegotiationState),
}

/// One point-to-point transport session, owned by exactly one connection.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn commit_local(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn commit_remote(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Requests a data channel before the offer is produced; only meaningful
    /// for the originator of a data connection.
    async fn create_data_channel(&self, label: &str, ordered: bool) -> Result<(), TransportError>;

    async fn send(&self, bytes: Bytes) -> Result<(), TransportError>;

    /// Bytes the transport has accepted but not yet put on the wire.
    async fn buffered_amount(&self) -> u64;

    /// True once the session has reached a terminal state on its own, in
    /// which case `close` is redundant and skipped.
    fn is_terminal(&self) -> bool;

    async fn close(&self);
}

/// Creates transport sessions; the session object owns one factory and every
/// connection draws from it.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        kind: ConnectionKind,
    ) -> Result<
        (
            Arc<dyn TransportSession>,
            mpsc::UnboundedReceiver<TransportEvent>,
        ),
        TransportError,
    >;
}
