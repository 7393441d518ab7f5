//! Data connection: ordered payload exchange with chunking and backpressure.
//!
//! Outbound payloads are encoded per the connection's serialization mode,
//! split into chunks when the encoded size exceeds the threshold, and handed
//! to the transport through a send queue that defers while the transport
//! reports too many buffered bytes. Deferred sends drain strictly in order.
//! A failed transport send closes the connection for good.

use bytes::Bytes;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use super::chunk::{Reassembler, decode_chunk, encode_chunk, split_payload};
use super::{ConnectionKind, Serialization, generate_connection_id};
use crate::codec::{Codec, Payload};
use crate::config::SessionConfig;
use crate::error::{Error, ErrorKind};
use crate::message::SignalFrame;
use crate::negotiator::{Negotiator, SdpTransform, Target};
use crate::session::Session;
use crate::socket::SignalingSocket;
use crate::transport::{SessionDescription, TransportFactory};

/// Caller knobs for an outgoing data connection. Everything defaults.
#[derive(Default, Clone)]
pub struct ConnectOptions {
    /// Human-readable channel label; defaults to the connection id.
    pub label: Option<String>,
    pub serialization: Serialization,
    /// Whether the channel should retransmit; negotiated into channel
    /// ordering on the transport.
    pub reliable: bool,
    /// Opaque application value carried inside the offer.
    pub metadata: Option<Value>,
    /// Fixed connection id; generated when absent. Incoming connections
    /// always carry the remote side's id here.
    pub connection_id: Option<String>,
    pub sdp_transform: Option<SdpTransform>,
}

/// What a data connection surfaces to the application.
#[derive(Debug)]
pub enum DataEvent {
    Open,
    Data(Payload),
    /// Emitted once, and only if the connection had opened.
    Close,
    Error(Error),
}

pub struct DataConnection {
    peer_id: String,
    connection_id: String,
    label: String,
    serialization: Serialization,
    reliable: bool,
    metadata: Option<Value>,
    session: Weak<Session>,
    codec: Arc<dyn Codec>,
    chunk_threshold: usize,
    max_buffered: u64,
    retry_delay: Duration,
    open: AtomicBool,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<DataEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<DataEvent>>>,
    negotiator: Negotiator,
    /// FIFO of encoded buffers waiting on the transport. The async lock is
    /// held across the drain so concurrent sends cannot jump the queue.
    queue: tokio::sync::Mutex<VecDeque<Bytes>>,
    buffering: AtomicBool,
    reassembler: parking_lot::Mutex<Reassembler>,
    next_transfer: AtomicU32,
}

impl DataConnection {
    pub(crate) fn new(
        session: Weak<Session>,
        socket: Arc<SignalingSocket>,
        factory: Arc<dyn TransportFactory>,
        codec: Arc<dyn Codec>,
        config: &SessionConfig,
        peer_id: String,
        options: ConnectOptions,
    ) -> Arc<Self> {
        let connection_id = options
            .connection_id
            .unwrap_or_else(|| generate_connection_id(ConnectionKind::Data));
        let label = options.label.unwrap_or_else(|| connection_id.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|weak: &Weak<DataConnection>| DataConnection {
            negotiator: Negotiator::new(
                socket,
                factory,
                peer_id.clone(),
                connection_id.clone(),
                ConnectionKind::Data,
                Target::Data(weak.clone()),
                options.sdp_transform,
            ),
            peer_id,
            connection_id,
            label,
            serialization: options.serialization,
            reliable: options.reliable,
            metadata: options.metadata,
            session,
            codec,
            chunk_threshold: config.chunk_threshold,
            max_buffered: config.max_buffered_amount,
            retry_delay: config.buffer_retry_delay,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events: events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            queue: tokio::sync::Mutex::new(VecDeque::new()),
            buffering: AtomicBool::new(false),
            reassembler: parking_lot::Mutex::new(Reassembler::new()),
            next_transfer: AtomicU32::new(0),
        })
    }

    /// Hands the event stream to its one consumer; later calls get `None`.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataEvent>> {
        self.events_rx.lock().take()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn serialization(&self) -> Serialization {
        self.serialization
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn metadata(&self) -> Option<Value> {
        self.metadata.clone()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn has_transport(&self) -> bool {
        self.negotiator.has_transport()
    }

    /// Originator side: mint the transport and send the offer.
    pub(crate) async fn begin_offer(&self) -> Result<(), Error> {
        self.negotiator.start_originator().await
    }

    /// Answerer side: accept the remote offer and send the answer back.
    pub(crate) async fn begin_answer(&self, offer: SessionDescription) -> Result<(), Error> {
        self.negotiator.start_answerer(offer).await
    }

    /// Routes an addressed signaling frame into the negotiation.
    pub(crate) async fn handle_frame(&self, frame: SignalFrame) {
        match frame {
            SignalFrame::Answer { payload, .. } => {
                if let Err(err) = self.negotiator.handle_remote_description(payload.sdp).await {
                    self.emit(DataEvent::Error(err));
                }
            }
            SignalFrame::Candidate { payload, .. } => {
                if let Err(err) = self.negotiator.handle_candidate(payload.candidate).await {
                    self.emit(DataEvent::Error(err));
                }
            }
            other => {
                tracing::warn!(
                    target = "connection",
                    connection = %self.connection_id,
                    kind = other.kind_str(),
                    "unexpected frame for data connection"
                );
            }
        }
    }

    /// Encodes and sends one payload. Not-open connections reject instead of
    /// queueing.
    pub async fn send(self: &Arc<Self>, payload: Payload) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::new(
                ErrorKind::NotOpen,
                "connection is not open for sending",
            ));
        }
        match self.serialization {
            Serialization::Binary | Serialization::BinaryUtf8 => {
                let encoded = self
                    .codec
                    .encode(&payload)
                    .map_err(|err| Error::new(ErrorKind::Serialization, err.to_string()))?;
                if encoded.len() > self.chunk_threshold {
                    let transfer = self.next_transfer.fetch_add(1, Ordering::SeqCst);
                    for frame in split_payload(&encoded, self.chunk_threshold, transfer) {
                        self.buffered_send(encode_chunk(&frame)).await?;
                    }
                    Ok(())
                } else {
                    self.buffered_send(encoded).await
                }
            }
            Serialization::Json => {
                let text = match &payload {
                    Payload::Json(value) => serde_json::to_vec(value),
                    Payload::Text(text) => serde_json::to_vec(text),
                    Payload::Bytes(_) => {
                        return Err(Error::new(
                            ErrorKind::Serialization,
                            "binary payload on a json connection",
                        ));
                    }
                }
                .map_err(|err| Error::new(ErrorKind::Serialization, err.to_string()))?;
                self.buffered_send(Bytes::from(text)).await
            }
            Serialization::Raw => {
                let bytes = match payload {
                    Payload::Bytes(bytes) => bytes,
                    Payload::Text(text) => Bytes::from(text),
                    Payload::Json(value) => serde_json::to_vec(&value)
                        .map(Bytes::from)
                        .map_err(|err| Error::new(ErrorKind::Serialization, err.to_string()))?,
                };
                self.buffered_send(bytes).await
            }
        }
    }

    async fn buffered_send(self: &Arc<Self>, bytes: Bytes) -> Result<(), Error> {
        let mut queue = self.queue.lock().await;
        if self.buffering.load(Ordering::SeqCst) || !queue.is_empty() {
            queue.push_back(bytes);
            return Ok(());
        }
        if !self.try_send(bytes.clone()).await? {
            queue.push_back(bytes);
        }
        Ok(())
    }

    /// One attempt against the transport. `Ok(false)` means the transport is
    /// backed up and a drain has been scheduled; the caller queues the bytes.
    async fn try_send(self: &Arc<Self>, bytes: Bytes) -> Result<bool, Error> {
        let Some(transport) = self.negotiator.transport() else {
            return Err(Error::new(ErrorKind::NotOpen, "no transport session"));
        };
        if transport.buffered_amount().await > self.max_buffered {
            self.buffering.store(true, Ordering::SeqCst);
            self.schedule_drain();
            return Ok(false);
        }
        if let Err(err) = transport.send(bytes).await {
            tracing::error!(
                target = "connection",
                connection = %self.connection_id,
                %err,
                "transport send failed, closing connection"
            );
            let error = Error::new(ErrorKind::Negotiation, err.to_string());
            self.emit(DataEvent::Error(error.clone()));
            self.close();
            return Err(error);
        }
        Ok(true)
    }

    fn schedule_drain(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(connection) = weak.upgrade() {
                connection.buffering.store(false, Ordering::SeqCst);
                connection.drain_queue().await;
            }
        });
    }

    /// Flushes queued buffers head-first, stopping at the first deferral.
    async fn drain_queue(self: &Arc<Self>) {
        let mut queue = self.queue.lock().await;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                queue.clear();
                return;
            }
            let Some(head) = queue.front().cloned() else {
                return;
            };
            match self.try_send(head).await {
                Ok(true) => {
                    queue.pop_front();
                }
                Ok(false) => return,
                Err(_) => {
                    queue.clear();
                    return;
                }
            }
        }
    }

    /// Raw bytes from the transport channel, decoded per serialization mode.
    pub(crate) async fn handle_incoming(&self, bytes: Bytes) {
        match self.serialization {
            Serialization::Binary | Serialization::BinaryUtf8 => match decode_chunk(&bytes) {
                Ok(Some(frame)) => {
                    let completed = self.reassembler.lock().ingest(frame);
                    match completed {
                        Ok(Some(whole)) => self.deliver_encoded(&whole),
                        Ok(None) => {}
                        Err(err) => self.emit(DataEvent::Error(Error::new(
                            ErrorKind::Serialization,
                            err.to_string(),
                        ))),
                    }
                }
                Ok(None) => self.deliver_encoded(&bytes),
                Err(err) => self.emit(DataEvent::Error(Error::new(
                    ErrorKind::Serialization,
                    err.to_string(),
                ))),
            },
            Serialization::Json => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => self.emit(DataEvent::Data(Payload::Json(value))),
                Err(err) => self.emit(DataEvent::Error(Error::new(
                    ErrorKind::Serialization,
                    err.to_string(),
                ))),
            },
            Serialization::Raw => self.emit(DataEvent::Data(Payload::Bytes(bytes))),
        }
    }

    fn deliver_encoded(&self, bytes: &[u8]) {
        match self.codec.decode(bytes) {
            Ok(payload) => self.emit(DataEvent::Data(payload)),
            Err(err) => self.emit(DataEvent::Error(Error::new(
                ErrorKind::Serialization,
                err.to_string(),
            ))),
        }
    }

    /// The transport channel became usable.
    pub(crate) fn channel_opened(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !self.open.swap(true, Ordering::SeqCst) {
            self.emit(DataEvent::Open);
        }
    }

    pub(crate) fn fail(&self, error: Error) {
        self.emit(DataEvent::Error(error));
        self.close();
    }

    /// Tears the connection down: drops queued sends and partial transfers,
    /// detaches the transport, and deregisters from the session. Idempotent;
    /// emits [`DataEvent::Close`] only when the connection had opened.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_open = self.open.swap(false, Ordering::SeqCst);
        self.buffering.store(false, Ordering::SeqCst);
        self.reassembler.lock().clear();
        if let Ok(mut queue) = self.queue.try_lock() {
            queue.clear();
        }
        self.negotiator.cleanup();
        if let Some(session) = self.session.upgrade() {
            session.remove_connection(&self.peer_id, &self.connection_id);
        }
        if was_open {
            let _ = self.events.send(DataEvent::Close);
        }
    }

    fn emit(&self, event: DataEvent) {
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConnection")
            .field("peer_id", &self.peer_id)
            .field("connection_id", &self.connection_id)
            .field("label", &self.label)
            .field("serialization", &self.serialization)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;
    use crate::connection::chunk::CHUNK_MARKER;
    use crate::transport::mock::{MockFactory, MockTransport};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_config() -> SessionConfig {
        SessionConfig {
            chunk_threshold: 64,
            buffer_retry_delay: Duration::from_millis(10),
            ..SessionConfig::default()
        }
    }

    async fn open_connection(
        options: ConnectOptions,
    ) -> (
        Arc<DataConnection>,
        UnboundedReceiver<DataEvent>,
        Arc<MockTransport>,
    ) {
        let (socket, _socket_events) = SignalingSocket::new(&SessionConfig::default());
        let factory = Arc::new(MockFactory::new());
        let connection = DataConnection::new(
            Weak::new(),
            socket,
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            Arc::new(BincodeCodec),
            &test_config(),
            "remote".into(),
            options,
        );
        let events = connection.take_events().expect("events");
        connection.begin_offer().await.expect("offer");
        connection.channel_opened();
        let transport = factory.transport(0).expect("mock transport");
        (connection, events, transport)
    }

    #[tokio::test]
    async fn send_rejects_when_not_open() {
        let (socket, _socket_events) = SignalingSocket::new(&SessionConfig::default());
        let factory: Arc<dyn TransportFactory> = Arc::new(MockFactory::new());
        let connection = DataConnection::new(
            Weak::new(),
            socket,
            factory,
            Arc::new(BincodeCodec),
            &test_config(),
            "remote".into(),
            ConnectOptions::default(),
        );
        let err = connection
            .send(Payload::Text("early".into()))
            .await
            .expect_err("not open yet");
        assert_eq!(err.kind(), ErrorKind::NotOpen);
    }

    #[tokio::test]
    async fn small_payloads_travel_whole() {
        let (connection, _events, transport) = open_connection(ConnectOptions::default()).await;
        connection
            .send(Payload::Text("hi".into()))
            .await
            .expect("send");
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_ne!(sent[0][0], CHUNK_MARKER);
        assert_eq!(
            BincodeCodec.decode(&sent[0]).expect("decode"),
            Payload::Text("hi".into())
        );
    }

    #[tokio::test]
    async fn oversized_payloads_are_chunked() {
        let (connection, _events, transport) = open_connection(ConnectOptions::default()).await;
        connection
            .send(Payload::Bytes(Bytes::from(vec![7u8; 1000])))
            .await
            .expect("send");
        let sent = transport.sent();
        assert!(sent.len() > 1);
        assert!(sent.iter().all(|bytes| bytes[0] == CHUNK_MARKER));
    }

    #[tokio::test]
    async fn chunked_payloads_reassemble_on_receipt() {
        let (connection, mut events, _transport) = open_connection(ConnectOptions::default()).await;
        let payload = Payload::Bytes(Bytes::from(vec![3u8; 500]));
        let encoded = BincodeCodec.encode(&payload).expect("encode");
        let frames = split_payload(&encoded, 64, 1);
        assert!(frames.len() > 1);
        for frame in &frames {
            connection.handle_incoming(encode_chunk(frame)).await;
        }

        assert!(matches!(events.try_recv(), Ok(DataEvent::Open)));
        match events.try_recv() {
            Ok(DataEvent::Data(received)) => assert_eq!(received, payload),
            other => panic!("expected one data event, got {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn backpressure_defers_then_drains_in_order() {
        let (connection, _events, transport) = open_connection(ConnectOptions::default()).await;
        transport.set_buffered_amount(crate::config::MAX_BUFFERED_AMOUNT + 1);

        for text in ["first", "second", "third"] {
            connection
                .send(Payload::Text(text.into()))
                .await
                .expect("send");
        }
        assert!(transport.sent().is_empty());

        transport.set_buffered_amount(0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent: Vec<Payload> = transport
            .sent()
            .iter()
            .map(|bytes| BincodeCodec.decode(bytes).expect("decode"))
            .collect();
        assert_eq!(
            sent,
            vec![
                Payload::Text("first".into()),
                Payload::Text("second".into()),
                Payload::Text("third".into()),
            ]
        );
    }

    #[tokio::test]
    async fn send_failure_closes_permanently() {
        let (connection, mut events, transport) = open_connection(ConnectOptions::default()).await;
        transport.fail_sends(true);

        let err = connection
            .send(Payload::Text("doomed".into()))
            .await
            .expect_err("send fails");
        assert_eq!(err.kind(), ErrorKind::Negotiation);
        assert!(!connection.is_open());
        assert!(transport.is_closed() || connection.closed.load(Ordering::SeqCst));

        // No recovery: the connection stays closed even if the transport heals.
        transport.fail_sends(false);
        let err = connection
            .send(Payload::Text("still doomed".into()))
            .await
            .expect_err("closed for good");
        assert_eq!(err.kind(), ErrorKind::NotOpen);

        assert!(matches!(events.try_recv(), Ok(DataEvent::Open)));
        assert!(matches!(events.try_recv(), Ok(DataEvent::Error(_))));
        assert!(matches!(events.try_recv(), Ok(DataEvent::Close)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_close_event_requires_open() {
        let (connection, mut events, _transport) = open_connection(ConnectOptions::default()).await;
        connection.close();
        connection.close();
        assert!(matches!(events.try_recv(), Ok(DataEvent::Open)));
        assert!(matches!(events.try_recv(), Ok(DataEvent::Close)));
        assert!(events.try_recv().is_err());

        // A connection that never opened closes silently.
        let (socket, _socket_events) = SignalingSocket::new(&SessionConfig::default());
        let factory: Arc<dyn TransportFactory> = Arc::new(MockFactory::new());
        let unopened = DataConnection::new(
            Weak::new(),
            socket,
            factory,
            Arc::new(BincodeCodec),
            &test_config(),
            "remote".into(),
            ConnectOptions::default(),
        );
        let mut events = unopened.take_events().expect("events");
        unopened.close();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn json_mode_round_trips_values() {
        let options = ConnectOptions {
            serialization: Serialization::Json,
            ..ConnectOptions::default()
        };
        let (connection, mut events, transport) = open_connection(options).await;
        connection
            .send(Payload::Json(serde_json::json!({"n": 1})))
            .await
            .expect("send");
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);

        connection.handle_incoming(sent[0].clone()).await;
        assert!(matches!(events.try_recv(), Ok(DataEvent::Open)));
        match events.try_recv() {
            Ok(DataEvent::Data(Payload::Json(value))) => {
                assert_eq!(value, serde_json::json!({"n": 1}));
            }
            other => panic!("expected json data event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_candidates_forward_until_ice_completes() {
        use crate::transport::{IceCandidate, NegotiationState, TransportEvent};

        let (socket, _socket_events) = SignalingSocket::new(&SessionConfig::default());
        let factory = Arc::new(MockFactory::new());
        let connection = DataConnection::new(
            Weak::new(),
            Arc::clone(&socket),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            Arc::new(BincodeCodec),
            &test_config(),
            "remote".into(),
            ConnectOptions::default(),
        );
        connection.begin_offer().await.expect("offer");
        let transport = factory.transport(0).expect("transport");

        let candidate = IceCandidate {
            candidate: "candidate:0".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        transport.emit(TransportEvent::LocalCandidate(candidate.clone()));
        transport.emit(TransportEvent::StateChange(NegotiationState::Connected));
        transport.emit(TransportEvent::LocalCandidate(candidate.clone()));
        transport.emit(TransportEvent::StateChange(NegotiationState::Completed));
        transport.emit(TransportEvent::LocalCandidate(candidate));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Both pre-completion candidates go out; the post-completion one
        // stays local.
        let forwarded = socket
            .queued_frames()
            .iter()
            .filter(|frame| matches!(frame, SignalFrame::Candidate { .. }))
            .count();
        assert_eq!(forwarded, 2);
    }

    #[tokio::test]
    async fn offer_requests_channel_with_label_and_ordering() {
        let options = ConnectOptions {
            label: Some("files".into()),
            reliable: true,
            ..ConnectOptions::default()
        };
        let (_connection, _events, transport) = open_connection(options).await;
        assert_eq!(transport.channel_request(), Some(("files".into(), true)));
        assert!(transport.committed_local().is_some());
    }
}
