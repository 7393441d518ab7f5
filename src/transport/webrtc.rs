//! [`TransportSession`] over the `webrtc` crate.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    IceCandidate, MediaStream, NegotiationState, SdpKind, SessionDescription, TransportEvent,
    TransportFactory, TransportSession,
};
use crate::connection::ConnectionKind;
use crate::error::TransportError;

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

pub struct WebRtcFactory {
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN.to_string()],
        }
    }

    pub fn with_ice_servers(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

impl Default for WebRtcFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        kind: ConnectionKind,
    ) -> Result<
        (
            Arc<dyn TransportSession>,
            mpsc::UnboundedReceiver<TransportEvent>,
        ),
        TransportError,
    > {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|err| TransportError::Setup(err.to_string()))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(WebRtcSession {
            peer_connection,
            channel: Mutex::new(None),
            events: events_tx,
        });
        session.install_handlers(kind);
        Ok((session, events_rx))
    }
}

pub struct WebRtcSession {
    peer_connection: Arc<RTCPeerConnection>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WebRtcSession {
    fn install_handlers(self: &Arc<Self>, kind: ConnectionKind) {
        let events = self.events.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index.map(u32::from),
                            }));
                        }
                        Err(err) => {
                            tracing::warn!(target = "transport", %err, "unserializable candidate");
                        }
                    }
                })
            }));

        let events = self.events.clone();
        self.peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    tracing::debug!(target = "transport", ?state, "peer connection state");
                    let mapped = match state {
                        RTCPeerConnectionState::New => Some(NegotiationState::New),
                        RTCPeerConnectionState::Connecting => Some(NegotiationState::Connecting),
                        RTCPeerConnectionState::Connected => Some(NegotiationState::Connected),
                        RTCPeerConnectionState::Disconnected => {
                            Some(NegotiationState::Disconnected)
                        }
                        RTCPeerConnectionState::Failed => Some(NegotiationState::Failed),
                        RTCPeerConnectionState::Closed => Some(NegotiationState::Closed),
                        RTCPeerConnectionState::Unspecified => None,
                    };
                    if let Some(mapped) = mapped {
                        let _ = events.send(TransportEvent::StateChange(mapped));
                    }
                })
            },
        ));

        let events = self.events.clone();
        self.peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    if state == RTCIceConnectionState::Completed {
                        let _ = events.send(TransportEvent::StateChange(
                            NegotiationState::Completed,
                        ));
                    }
                })
            },
        ));

        match kind {
            ConnectionKind::Data => {
                // The answering side receives the channel the originator made.
                let session = Arc::clone(self);
                self.peer_connection
                    .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                        let session = Arc::clone(&session);
                        Box::pin(async move {
                            tracing::debug!(
                                target = "transport",
                                label = channel.label(),
                                "data channel arrived"
                            );
                            session.wire_channel(&channel);
                            *session.channel.lock() = Some(channel);
                        })
                    }));
            }
            ConnectionKind::Media => {
                let events = self.events.clone();
                self.peer_connection.on_track(Box::new(
                    move |track, _receiver, _transceiver| {
                        let events = events.clone();
                        Box::pin(async move {
                            let _ = events.send(TransportEvent::RemoteTrack(MediaStream::new(
                                track.stream_id(),
                            )));
                        })
                    },
                ));
            }
        }
    }

    fn wire_channel(&self, channel: &Arc<RTCDataChannel>) {
        let events = self.events.clone();
        channel.on_open(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::ChannelOpen);
            })
        }));

        let events = self.events.clone();
        channel.on_close(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::ChannelClosed);
            })
        }));

        let events = self.events.clone();
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::Data(message.data));
            })
        }));
    }

    fn current_channel(&self) -> Result<Arc<RTCDataChannel>, TransportError> {
        self.channel.lock().clone().ok_or(TransportError::ChannelClosed)
    }
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn commit_local(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = to_rtc_description(desc)?;
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))
    }

    async fn commit_remote(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = to_rtc_description(desc)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index.map(|index| index as u16),
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))
    }

    async fn create_data_channel(&self, label: &str, ordered: bool) -> Result<(), TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let channel = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        self.wire_channel(&channel);
        *self.channel.lock() = Some(channel);
        Ok(())
    }

    async fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        let channel = self.current_channel()?;
        channel
            .send(&bytes)
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn buffered_amount(&self) -> u64 {
        // Clone out of the lock before awaiting; the guard must not cross.
        let channel = self.channel.lock().clone();
        match channel {
            Some(channel) => channel.buffered_amount().await as u64,
            None => 0,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.peer_connection.connection_state(),
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
        )
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            tracing::debug!(target = "transport", %err, "peer connection close failed");
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|err| TransportError::Negotiation(err.to_string()))
}
