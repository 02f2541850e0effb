//! # Wire envelopes.
//!
//! Every transport frame body is one of two JSON envelopes: a request
//! ([`ReqEnvelope`]) or a reply ([`AckEnvelope`]). Inner payloads travel
//! base64-encoded inside `data`, themselves framed by the codec. Field names
//! are wire-frozen; do not rename.

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// `kind` value for a request expecting an ACK.
pub(crate) const KIND_REQ: i32 = 0;

/// `kind` value for fire-and-forget; no ACK is produced.
pub(crate) const KIND_CAST: i32 = 1;

/// Request envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReqEnvelope {
    /// Subject to ACK to; omitted for casts.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply: String,

    /// Target module name on the receiving instance.
    #[serde(rename = "rpcModule", default, skip_serializing_if = "String::is_empty")]
    pub module: String,

    /// [`KIND_REQ`] or [`KIND_CAST`].
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub kind: i32,

    /// Correlation id, monotonic per source.
    #[serde(rename = "SessionID", default, skip_serializing_if = "is_zero_i64")]
    pub session_id: i64,

    /// Inner frame: `[8-byte tag][JSON request]`, base64 on the wire.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

/// Reply envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AckEnvelope {
    /// Subject of the responder.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,

    /// Correlation id copied from the request.
    #[serde(rename = "SessionID", default, skip_serializing_if = "is_zero_i64")]
    pub session_id: i64,

    /// Inner frame of the reply; omitted on error and for void results.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,

    /// Error text; empty on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Message for ReqEnvelope {}
impl Message for AckEnvelope {}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_wire_field_names_are_frozen() {
        let req = ReqEnvelope {
            reply: "0.0.0.5.1".to_string(),
            module: "world".to_string(),
            kind: KIND_CAST,
            session_id: 42,
            data: vec![1, 2, 3],
        };
        let json: serde_json::Value = serde_json::to_value(&req).expect("json");
        assert_eq!(json["reply"], "0.0.0.5.1");
        assert_eq!(json["rpcModule"], "world");
        assert_eq!(json["kind"], 1);
        assert_eq!(json["SessionID"], 42);
        assert_eq!(json["data"], "AQID"); // base64 of [1, 2, 3]
    }

    #[test]
    fn empty_fields_are_omitted() {
        let req = ReqEnvelope {
            module: "world".to_string(),
            session_id: 7,
            ..Default::default()
        };
        let json = serde_json::to_string(&req).expect("json");
        assert!(!json.contains("reply"));
        assert!(!json.contains("data"));
        assert!(!json.contains("kind"));

        let ack = AckEnvelope {
            from: "0.0.0.5.1".to_string(),
            session_id: 7,
            ..Default::default()
        };
        let json = serde_json::to_string(&ack).expect("json");
        assert!(!json.contains("error"));
        assert!(!json.contains("data"));
    }

    #[test]
    fn envelopes_round_trip() {
        let ack = AckEnvelope {
            from: "1.2.3.4.5".to_string(),
            session_id: 99,
            data: b"payload".to_vec(),
            error: String::new(),
        };
        let json = serde_json::to_vec(&ack).expect("encode");
        let back: AckEnvelope = serde_json::from_slice(&json).expect("decode");
        assert_eq!(back.from, ack.from);
        assert_eq!(back.session_id, 99);
        assert_eq!(back.data, b"payload");
        assert!(back.error.is_empty());
    }

    #[test]
    fn missing_optional_fields_deserialize_to_defaults() {
        let req: ReqEnvelope =
            serde_json::from_str(r#"{"rpcModule":"world","SessionID":3}"#).expect("decode");
        assert_eq!(req.module, "world");
        assert_eq!(req.kind, KIND_REQ);
        assert!(req.reply.is_empty());
        assert!(req.data.is_empty());
    }
}
