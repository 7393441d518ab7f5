use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::{ConnectionKind, Serialization};
use crate::transport::{IceCandidate, SessionDescription};

/// One signaling frame, in either direction. The relay addresses frames by
/// rewriting `dst` (set by the sender) into `src` (seen by the receiver).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalFrame {
    /// Relay confirms the session identity.
    #[serde(rename = "OPEN")]
    Open,
    /// Fatal relay-reported failure.
    #[serde(rename = "ERROR")]
    Error { payload: ErrorPayload },
    /// The requested identity is already held.
    #[serde(rename = "ID-TAKEN")]
    IdTaken,
    /// The access key was rejected.
    #[serde(rename = "INVALID-KEY")]
    InvalidKey,
    /// A remote peer departed; all its connections close.
    #[serde(rename = "LEAVE")]
    Leave { src: String },
    /// The relay could not deliver to the target peer.
    #[serde(rename = "EXPIRE")]
    Expire { src: String },
    #[serde(rename = "OFFER")]
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: OfferPayload,
    },
    #[serde(rename = "ANSWER")]
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: AnswerPayload,
    },
    #[serde(rename = "CANDIDATE")]
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: CandidatePayload,
    },
    /// Liveness signal; carries nothing and is never acknowledged.
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub connection_id: String,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    pub sdp: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization: Option<Serialization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub connection_id: String,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub connection_id: String,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    pub candidate: IceCandidate,
}

impl SignalFrame {
    /// The connection this frame is addressed to, when it targets one.
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            SignalFrame::Offer { payload, .. } => Some(&payload.connection_id),
            SignalFrame::Answer { payload, .. } => Some(&payload.connection_id),
            SignalFrame::Candidate { payload, .. } => Some(&payload.connection_id),
            _ => None,
        }
    }

    pub fn src(&self) -> Option<&str> {
        match self {
            SignalFrame::Leave { src } | SignalFrame::Expire { src } => Some(src),
            SignalFrame::Offer { src, .. }
            | SignalFrame::Answer { src, .. }
            | SignalFrame::Candidate { src, .. } => src.as_deref(),
            _ => None,
        }
    }

    /// Wire discriminant, for logging.
    pub fn kind_str(&self) -> &'static str {
        match self {
            SignalFrame::Open => "OPEN",
            SignalFrame::Error { .. } => "ERROR",
            SignalFrame::IdTaken => "ID-TAKEN",
            SignalFrame::InvalidKey => "INVALID-KEY",
            SignalFrame::Leave { .. } => "LEAVE",
            SignalFrame::Expire { .. } => "EXPIRE",
            SignalFrame::Offer { .. } => "OFFER",
            SignalFrame::Answer { .. } => "ANSWER",
            SignalFrame::Candidate { .. } => "CANDIDATE",
            SignalFrame::Heartbeat => "HEARTBEAT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SdpKind;

    #[test]
    fn offer_frame_wire_shape() {
        let frame = SignalFrame::Offer {
            src: None,
            dst: Some("p2".into()),
            payload: OfferPayload {
                connection_id: "dc_1234".into(),
                kind: ConnectionKind::Data,
                sdp: SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0".into(),
                },
                label: Some("dc_1234".into()),
                serialization: Some(Serialization::Binary),
                reliable: Some(false),
                metadata: None,
            },
        };

        let wire: Value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(wire["type"], "OFFER");
        assert_eq!(wire["dst"], "p2");
        assert_eq!(wire["payload"]["connectionId"], "dc_1234");
        assert_eq!(wire["payload"]["type"], "data");
        assert_eq!(wire["payload"]["serialization"], "binary");
        assert_eq!(wire["payload"]["sdp"]["type"], "offer");

        let back: SignalFrame = serde_json::from_value(wire).expect("deserialize");
        assert_eq!(back, frame);
    }

    #[test]
    fn inbound_frames_tolerate_extra_fields() {
        let frame: SignalFrame = serde_json::from_str(
            r#"{"type":"EXPIRE","src":"p9","dst":"p1","payload":{"anything":true}}"#,
        )
        .expect("deserialize");
        assert_eq!(frame.src(), Some("p9"));
    }

    #[test]
    fn malformed_frames_fail_to_parse() {
        assert!(serde_json::from_str::<SignalFrame>(r#"{"payload":{}}"#).is_err());
        assert!(serde_json::from_str::<SignalFrame>("not json").is_err());
    }
}
