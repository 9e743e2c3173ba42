//! beam wire messages: signaling envelopes (over the relay) and control frames (over the channel).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Kind of a signaling envelope. Serialized lowercase in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => write!(f, "offer"),
            SignalKind::Answer => write!(f, "answer"),
            SignalKind::Candidate => write!(f, "candidate"),
        }
    }
}

/// Addressed signaling envelope relayed between peers.
/// Wire shape: `{type, from, to, sdp?, candidate?}`. Offers and answers carry `sdp`,
/// candidates carry `candidate`; `wire::decode_envelope` rejects anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: PeerId,
    pub to: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<serde_json::Value>,
}

impl SignalEnvelope {
    pub fn offer(from: PeerId, to: PeerId, sdp: String) -> Self {
        Self {
            kind: SignalKind::Offer,
            from,
            to,
            sdp: Some(sdp),
            candidate: None,
        }
    }

    pub fn answer(from: PeerId, to: PeerId, sdp: String) -> Self {
        Self {
            kind: SignalKind::Answer,
            from,
            to,
            sdp: Some(sdp),
            candidate: None,
        }
    }

    pub fn candidate(from: PeerId, to: PeerId, candidate: serde_json::Value) -> Self {
        Self {
            kind: SignalKind::Candidate,
            from,
            to,
            sdp: None,
            candidate: Some(candidate),
        }
    }
}

/// Transfer identifier (UUID v4, hyphenated). Sent as `fileId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn generate() -> Self {
        TransferId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferId {
    fn from(s: &str) -> Self {
        TransferId(s.to_string())
    }
}

/// Metadata of one transfer. Created by the sender, echoed to the receiver in the first frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    #[serde(rename = "fileId")]
    pub transfer_id: TransferId,
    pub name: String,
    #[serde(rename = "size")]
    pub byte_size: u64,
    #[serde(rename = "type")]
    pub media_type: String,
    #[serde(rename = "totalChunks")]
    pub chunk_count: u64,
}

/// Structured (text) frames on the direct channel. Chunks travel as binary frames and
/// have no structured form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType")]
pub enum ControlFrame {
    #[serde(rename = "file-info")]
    FileInfo { meta: TransferMetadata },
    #[serde(rename = "file-complete")]
    FileComplete {
        #[serde(rename = "fileId")]
        file_id: TransferId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_envelope_wire_shape() {
        let env = SignalEnvelope::offer("p1".into(), "p2".into(), "v=0".to_string());
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"type": "offer", "from": "p1", "to": "p2", "sdp": "v=0"})
        );
    }

    #[test]
    fn candidate_envelope_omits_sdp() {
        let env = SignalEnvelope::candidate(
            "p1".into(),
            "p2".into(),
            serde_json::json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host"}),
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "candidate");
        assert!(v.get("sdp").is_none());
        assert!(v["candidate"].is_object());
    }

    #[test]
    fn file_info_wire_shape() {
        let frame = ControlFrame::FileInfo {
            meta: TransferMetadata {
                transfer_id: "t-1".into(),
                name: "report.bin".to_string(),
                byte_size: 40000,
                media_type: "application/octet-stream".to_string(),
                chunk_count: 3,
            },
        };
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "messageType": "file-info",
                "meta": {
                    "fileId": "t-1",
                    "name": "report.bin",
                    "size": 40000,
                    "type": "application/octet-stream",
                    "totalChunks": 3
                }
            })
        );
    }

    #[test]
    fn file_complete_wire_shape() {
        let frame = ControlFrame::FileComplete {
            file_id: "t-1".into(),
        };
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"messageType": "file-complete", "fileId": "t-1"})
        );
    }

    #[test]
    fn transfer_ids_are_unique() {
        assert_ne!(TransferId::generate(), TransferId::generate());
    }
}
