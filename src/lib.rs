//! Peer session broker: identities, signaling, and peer-to-peer connection
//! negotiation against a PeerJS-protocol relay.
//!
//! A [`Session`] registers one identity with the relay over a websocket,
//! then opens [`DataConnection`]s (chunked, backpressured payload exchange)
//! and [`MediaConnection`]s (stream attachment) to other peers. The actual
//! point-to-point transport, payload codec, and relay directory sit behind
//! the [`transport::TransportSession`], [`codec::Codec`], and
//! [`directory::Directory`] seams; WebRTC, bincode, and HTTP implementations
//! are the defaults.

pub mod codec;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod message;
mod negotiator;
pub mod session;
pub mod socket;
pub mod transport;

pub use codec::{BincodeCodec, Codec, Payload};
pub use config::SessionConfig;
pub use connection::{
    CallOptions, ConnectOptions, ConnectionKind, DataConnection, DataEvent, MediaConnection,
    MediaEvent, Serialization,
};
pub use error::{Error, ErrorKind};
pub use message::SignalFrame;
pub use negotiator::SdpTransform;
pub use session::{Session, SessionBuilder, SessionEvent, SessionState};
pub use transport::{MediaStream, TransportFactory, TransportSession};
