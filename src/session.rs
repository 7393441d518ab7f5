//! The session: one signaling socket, a connection registry, and the frame
//! router between them.
//!
//! A session owns its identity lifecycle (claimed or allocated, then
//! confirmed by the relay), creates outgoing connections, accepts incoming
//! offers, and routes addressed frames to the right connection. Frames that
//! arrive before their connection can take them are stashed per connection
//! id and replayed once it can.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::{BincodeCodec, Codec};
use crate::config::{SessionConfig, valid_identity};
use crate::connection::{
    CallOptions, ConnectOptions, Connection, ConnectionKind, DataConnection, MediaConnection,
};
use crate::directory::{Directory, HttpDirectory};
use crate::error::{Error, ErrorKind};
use crate::message::{OfferPayload, SignalFrame};
use crate::socket::{SignalingSocket, SocketEvent};
use crate::transport::{MediaStream, TransportFactory, webrtc::WebRtcFactory};

/// Where a session is in its lifecycle, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Disconnected,
    Destroyed,
}

/// What a session surfaces to the application.
pub enum SessionEvent {
    /// The relay confirmed our identity.
    Open(String),
    /// A remote peer opened a data connection to us.
    Connection(Arc<DataConnection>),
    /// A remote peer is calling us; answer with a local stream.
    Call(Arc<MediaConnection>),
    /// The signaling socket is gone. Live connections survive; new ones
    /// cannot be made until a reconnect.
    Disconnected(String),
    /// The session is destroyed. Terminal.
    Close,
    Error(Error),
}

pub struct Session {
    config: SessionConfig,
    requested_id: Option<String>,
    token: String,
    factory: Arc<dyn TransportFactory>,
    codec: Arc<dyn Codec>,
    directory: Arc<dyn Directory>,
    events: mpsc::UnboundedSender<SessionEvent>,
    socket: RwLock<Arc<SignalingSocket>>,
    id: RwLock<Option<String>>,
    /// Identity last confirmed by the relay; reused on reconnect.
    last_server_id: RwLock<Option<String>>,
    open: AtomicBool,
    disconnected: AtomicBool,
    destroyed: AtomicBool,
    connections: Mutex<HashMap<String, Vec<Connection>>>,
    /// Frames that arrived before their connection could take them, keyed by
    /// connection id.
    stash: Mutex<HashMap<String, Vec<SignalFrame>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    id: Option<String>,
    factory: Option<Arc<dyn TransportFactory>>,
    codec: Option<Arc<dyn Codec>>,
    directory: Option<Arc<dyn Directory>>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config.normalized();
        self
    }

    /// Claims a fixed identity instead of asking the directory for one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn build(self) -> (Arc<Session>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (socket, socket_events) = SignalingSocket::new(&self.config);
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(HttpDirectory::new(&self.config)));
        let session = Arc::new(Session {
            id: RwLock::new(self.id.clone()),
            requested_id: self.id,
            token: Uuid::new_v4().simple().to_string(),
            factory: self.factory.unwrap_or_else(|| Arc::new(WebRtcFactory::new())),
            codec: self.codec.unwrap_or_else(|| Arc::new(BincodeCodec)),
            directory,
            events: events_tx,
            socket: RwLock::new(socket),
            last_server_id: RwLock::new(None),
            open: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
            stash: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            config: self.config,
        });
        session.spawn_socket_pump(socket_events);
        (session, events_rx)
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Resolves the identity (validating a claimed one, allocating one
    /// otherwise) and opens the signaling socket. The relay's confirmation
    /// arrives later as [`SessionEvent::Open`].
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Disconnected, "session is destroyed"));
        }
        let id = match &self.requested_id {
            Some(id) => {
                if !valid_identity(id) {
                    let error =
                        Error::new(ErrorKind::InvalidId, format!("identity `{id}` is invalid"));
                    self.abort(error.clone());
                    return Err(error);
                }
                id.clone()
            }
            None => match self.directory.allocate_id().await {
                Ok(id) => id,
                Err(err) => {
                    let error = Error::new(ErrorKind::ServerError, err.message().to_string());
                    self.abort(error.clone());
                    return Err(error);
                }
            },
        };
        *self.id.write() = Some(id.clone());
        self.open_socket(&id).await
    }

    /// Opens the signaling socket. A failed connect leaves the session
    /// disconnected rather than stuck in connecting, so `reconnect` stays
    /// available.
    async fn open_socket(&self, id: &str) -> Result<(), Error> {
        if let Err(err) = self.socket().start(id, &self.token).await {
            self.emit(SessionEvent::Error(err.clone()));
            self.disconnect();
            return Err(err);
        }
        Ok(())
    }

    pub fn id(&self) -> Option<String> {
        self.id.read().clone()
    }

    pub fn state(&self) -> SessionState {
        if self.destroyed.load(Ordering::SeqCst) {
            SessionState::Destroyed
        } else if self.disconnected.load(Ordering::SeqCst) {
            SessionState::Disconnected
        } else if self.open.load(Ordering::SeqCst) {
            SessionState::Open
        } else {
            SessionState::Connecting
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Peers currently registered under the same key, per the directory.
    pub async fn list_peers(&self) -> Result<Vec<String>, Error> {
        self.directory.list_peers().await
    }

    /// Opens a data connection to `peer_id` and sends the offer.
    pub async fn connect(
        self: &Arc<Self>,
        peer_id: &str,
        options: ConnectOptions,
    ) -> Result<Arc<DataConnection>, Error> {
        self.ensure_usable()?;
        let connection = DataConnection::new(
            Arc::downgrade(self),
            self.socket(),
            Arc::clone(&self.factory),
            Arc::clone(&self.codec),
            &self.config,
            peer_id.to_string(),
            options,
        );
        self.register(Connection::Data(Arc::clone(&connection)));
        if let Err(err) = connection.begin_offer().await {
            connection.close();
            return Err(err);
        }
        Ok(connection)
    }

    /// Calls `peer_id` with a local stream and sends the offer.
    pub async fn call(
        self: &Arc<Self>,
        peer_id: &str,
        stream: MediaStream,
        options: CallOptions,
    ) -> Result<Arc<MediaConnection>, Error> {
        self.ensure_usable()?;
        let connection = MediaConnection::new(
            Arc::downgrade(self),
            self.socket(),
            Arc::clone(&self.factory),
            peer_id.to_string(),
            options,
        );
        self.register(Connection::Media(Arc::clone(&connection)));
        if let Err(err) = connection.begin_offer(stream).await {
            connection.close();
            return Err(err);
        }
        Ok(connection)
    }

    /// Closes the signaling socket while leaving live connections alone.
    /// Idempotent.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        self.socket().close();
        // `last_server_id` holds only relay-confirmed identities; a requested
        // id that was never confirmed is not reusable.
        let current_id = self.id.write().take();
        self.emit(SessionEvent::Disconnected(current_id.unwrap_or_default()));
    }

    /// Rejoins the relay under the identity it last confirmed.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), Error> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::new(
                ErrorKind::Disconnected,
                "cannot reconnect a destroyed session",
            ));
        }
        if !self.disconnected.load(Ordering::SeqCst) {
            return Err(Error::new(
                ErrorKind::Network,
                "cannot reconnect while still connected",
            ));
        }
        let Some(id) = self.last_server_id.read().clone() else {
            return Err(Error::new(
                ErrorKind::InvalidId,
                "no relay-confirmed identity to reconnect with",
            ));
        };
        tracing::info!(target = "session", %id, "reconnecting to relay");
        self.disconnected.store(false, Ordering::SeqCst);
        *self.id.write() = Some(id.clone());

        let (socket, socket_events) = SignalingSocket::new(&self.config);
        *self.socket.write() = socket;
        self.spawn_socket_pump(socket_events);
        self.open_socket(&id).await
    }

    /// Closes every connection, the socket, and the session itself.
    /// Idempotent; ends with [`SessionEvent::Close`].
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target = "session", id = ?self.id(), "destroying session");
        let connections: Vec<Connection> = {
            let mut registry = self.connections.lock();
            registry.drain().flat_map(|(_, list)| list).collect()
        };
        for connection in connections {
            connection.close();
        }
        self.stash.lock().clear();
        self.disconnect();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.emit(SessionEvent::Close);
    }

    fn ensure_usable(&self) -> Result<(), Error> {
        if self.destroyed.load(Ordering::SeqCst) || self.disconnected.load(Ordering::SeqCst) {
            let error = Error::new(
                ErrorKind::Disconnected,
                "cannot create connections after disconnecting; reconnect first",
            );
            self.emit(SessionEvent::Error(error.clone()));
            return Err(error);
        }
        Ok(())
    }

    /// Fatal failure: surface the error, then tear down. With no
    /// relay-confirmed identity there is nothing to reconnect to, so the
    /// session is destroyed outright.
    fn abort(&self, error: Error) {
        tracing::error!(
            target = "session",
            kind = %error.kind(),
            message = error.message(),
            "aborting session"
        );
        self.emit(SessionEvent::Error(error));
        if self.last_server_id.read().is_none() {
            self.destroy();
        } else {
            self.disconnect();
        }
    }

    fn spawn_socket_pump(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
        let weak = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                match event {
                    SocketEvent::Message(frame) => session.handle_frame(frame).await,
                    SocketEvent::Disconnected => {
                        session.handle_socket_disconnect();
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(pump);
    }

    fn handle_socket_disconnect(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.emit(SessionEvent::Error(Error::new(
            ErrorKind::Network,
            "lost connection to the relay",
        )));
        self.disconnect();
    }

    pub(crate) async fn handle_frame(self: &Arc<Self>, frame: SignalFrame) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        match frame {
            SignalFrame::Open => {
                let id = self.id().unwrap_or_default();
                *self.last_server_id.write() = Some(id.clone());
                self.open.store(true, Ordering::SeqCst);
                tracing::info!(target = "session", %id, "relay confirmed identity");
                self.emit(SessionEvent::Open(id));
            }
            SignalFrame::Error { payload } => {
                self.abort(Error::new(ErrorKind::ServerError, payload.msg));
            }
            SignalFrame::IdTaken => {
                let id = self.id().unwrap_or_default();
                self.abort(Error::new(
                    ErrorKind::UnavailableId,
                    format!("identity `{id}` is already taken"),
                ));
            }
            SignalFrame::InvalidKey => {
                self.abort(Error::new(
                    ErrorKind::InvalidKey,
                    format!("key `{}` was rejected by the relay", self.config.key),
                ));
            }
            SignalFrame::Leave { src } => {
                tracing::debug!(target = "session", peer = %src, "peer left");
                self.cleanup_peer(&src);
            }
            SignalFrame::Expire { src } => {
                self.emit(SessionEvent::Error(Error::new(
                    ErrorKind::PeerUnavailable,
                    format!("could not connect to peer {src}"),
                )));
            }
            SignalFrame::Offer { src, payload, .. } => {
                let Some(src) = src else {
                    tracing::warn!(target = "session", "offer frame without a source peer");
                    return;
                };
                self.handle_offer(src, payload).await;
            }
            frame @ (SignalFrame::Answer { .. } | SignalFrame::Candidate { .. }) => {
                self.route_to_connection(frame).await;
            }
            SignalFrame::Heartbeat => {}
        }
    }

    async fn handle_offer(self: &Arc<Self>, src: String, payload: OfferPayload) {
        let connection_id = payload.connection_id.clone();
        if let Some(existing) = self.get_connection(&src, &connection_id) {
            // The newest offer for a connection id wins; the stale
            // connection is torn down and replaced.
            tracing::warn!(
                target = "session",
                peer = %src,
                connection = %connection_id,
                "offer for an existing connection id, replacing it"
            );
            existing.close();
        }

        match payload.kind {
            ConnectionKind::Data => {
                let options = ConnectOptions {
                    label: payload.label,
                    serialization: payload.serialization.unwrap_or_default(),
                    reliable: payload.reliable.unwrap_or(false),
                    metadata: payload.metadata,
                    connection_id: Some(connection_id.clone()),
                    sdp_transform: None,
                };
                let connection = DataConnection::new(
                    Arc::downgrade(self),
                    self.socket(),
                    Arc::clone(&self.factory),
                    Arc::clone(&self.codec),
                    &self.config,
                    src,
                    options,
                );
                self.register(Connection::Data(Arc::clone(&connection)));
                if let Err(err) = connection.begin_answer(payload.sdp).await {
                    connection.fail(err);
                    return;
                }
                self.emit(SessionEvent::Connection(Arc::clone(&connection)));
                for frame in self.take_stash(&connection_id) {
                    connection.handle_frame(frame).await;
                }
            }
            ConnectionKind::Media => {
                let options = CallOptions {
                    metadata: payload.metadata,
                    connection_id: Some(connection_id),
                    sdp_transform: None,
                };
                let connection = MediaConnection::new(
                    Arc::downgrade(self),
                    self.socket(),
                    Arc::clone(&self.factory),
                    src,
                    options,
                );
                connection.set_pending_offer(payload.sdp);
                self.register(Connection::Media(Arc::clone(&connection)));
                // Frames stay stashed until the application answers.
                self.emit(SessionEvent::Call(connection));
            }
        }
    }

    /// Delivers an addressed frame, or stashes it when its connection is
    /// absent or not yet negotiating.
    async fn route_to_connection(&self, frame: SignalFrame) {
        let (Some(src), Some(connection_id)) = (frame.src(), frame.connection_id()) else {
            tracing::warn!(
                target = "session",
                kind = frame.kind_str(),
                "unroutable frame, dropping"
            );
            return;
        };
        let connection = self.get_connection(src, connection_id);
        match connection {
            Some(connection) if connection.has_transport() => {
                connection.handle_frame(frame).await;
            }
            _ => {
                let connection_id = connection_id.to_string();
                tracing::debug!(
                    target = "session",
                    connection = %connection_id,
                    kind = frame.kind_str(),
                    "stashing frame until its connection can take it"
                );
                self.stash.lock().entry(connection_id).or_default().push(frame);
            }
        }
    }

    fn cleanup_peer(&self, peer_id: &str) {
        let connections = self.connections.lock().remove(peer_id).unwrap_or_default();
        for connection in connections {
            connection.close();
        }
    }

    fn register(&self, connection: Connection) {
        self.connections
            .lock()
            .entry(connection.peer_id().to_string())
            .or_default()
            .push(connection);
    }

    fn get_connection(&self, peer_id: &str, connection_id: &str) -> Option<Connection> {
        self.connections
            .lock()
            .get(peer_id)?
            .iter()
            .find(|c| c.connection_id() == connection_id)
            .cloned()
    }

    pub(crate) fn remove_connection(&self, peer_id: &str, connection_id: &str) {
        let mut registry = self.connections.lock();
        if let Some(list) = registry.get_mut(peer_id) {
            list.retain(|c| c.connection_id() != connection_id);
            if list.is_empty() {
                registry.remove(peer_id);
            }
        }
        drop(registry);
        self.stash.lock().remove(connection_id);
    }

    /// Stashed frames for a connection, in arrival order. Taking drains.
    pub(crate) fn take_stash(&self, connection_id: &str) -> Vec<SignalFrame> {
        self.stash.lock().remove(connection_id).unwrap_or_default()
    }

    fn socket(&self) -> Arc<SignalingSocket> {
        Arc::clone(&self.socket.read())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
