use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod chunk;
pub mod data;
pub mod media;

pub use data::{ConnectOptions, DataConnection, DataEvent};
pub use media::{CallOptions, MediaConnection, MediaEvent};

use crate::message::SignalFrame;
use std::sync::Arc;

/// Closed set of connection flavors. Chunking and backpressure apply only to
/// data; stream attachment only to media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Data,
    Media,
}

impl ConnectionKind {
    fn id_prefix(self) -> &'static str {
        match self {
            ConnectionKind::Data => "dc_",
            ConnectionKind::Media => "mc_",
        }
    }
}

/// How a data connection converts application values to channel bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Serialization {
    #[default]
    #[serde(rename = "binary")]
    Binary,
    #[serde(rename = "binary-utf8")]
    BinaryUtf8,
    #[serde(rename = "json")]
    Json,
    /// Pass-through; no codec involved.
    #[serde(rename = "none")]
    Raw,
}

impl Serialization {
    /// Only the codec-backed modes split oversized payloads.
    pub fn chunks(self) -> bool {
        matches!(self, Serialization::Binary | Serialization::BinaryUtf8)
    }
}

/// Locally originated connection ids carry a kind prefix and a UUIDv4 tail,
/// so collisions across peers have UUIDv4 probability rather than a seeded
/// RNG's.
pub(crate) fn generate_connection_id(kind: ConnectionKind) -> String {
    format!("{}{}", kind.id_prefix(), Uuid::new_v4().simple())
}

/// A registered connection: data or media, nothing else.
#[derive(Clone)]
pub enum Connection {
    Data(Arc<DataConnection>),
    Media(Arc<MediaConnection>),
}

impl Connection {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            Connection::Data(_) => ConnectionKind::Data,
            Connection::Media(_) => ConnectionKind::Media,
        }
    }

    pub fn peer_id(&self) -> &str {
        match self {
            Connection::Data(c) => c.peer_id(),
            Connection::Media(c) => c.peer_id(),
        }
    }

    pub fn connection_id(&self) -> &str {
        match self {
            Connection::Data(c) => c.connection_id(),
            Connection::Media(c) => c.connection_id(),
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Connection::Data(c) => c.is_open(),
            Connection::Media(c) => c.is_open(),
        }
    }

    /// Whether negotiation has started, i.e. a transport session exists to
    /// receive answers and candidates. Frames arriving earlier are stashed.
    pub(crate) fn has_transport(&self) -> bool {
        match self {
            Connection::Data(c) => c.has_transport(),
            Connection::Media(c) => c.has_transport(),
        }
    }

    pub(crate) async fn handle_frame(&self, frame: SignalFrame) {
        match self {
            Connection::Data(c) => c.handle_frame(frame).await,
            Connection::Media(c) => c.handle_frame(frame).await,
        }
    }

    pub fn close(&self) {
        match self {
            Connection::Data(c) => c.close(),
            Connection::Media(c) => c.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_kind_prefix() {
        let data_id = generate_connection_id(ConnectionKind::Data);
        let media_id = generate_connection_id(ConnectionKind::Media);
        assert!(data_id.starts_with("dc_"));
        assert!(media_id.starts_with("mc_"));
        assert_ne!(
            generate_connection_id(ConnectionKind::Data),
            generate_connection_id(ConnectionKind::Data)
        );
    }

    #[test]
    fn serialization_wire_names() {
        assert_eq!(
            serde_json::to_string(&Serialization::BinaryUtf8).unwrap(),
            "\"binary-utf8\""
        );
        assert_eq!(serde_json::to_string(&Serialization::Raw).unwrap(), "\"none\"");
        assert!(Serialization::Binary.chunks());
        assert!(!Serialization::Json.chunks());
    }
}
