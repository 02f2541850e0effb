//! # Frame codec and message registry.
//!
//! Every on-the-wire payload is `[8-byte big-endian tag][JSON body]`. The
//! process-local registry binds a tag to encode/decode closures for one
//! concrete type; both envelopes and all inner request/reply types must be
//! registered on every participating instance before use.

use std::sync::{Arc, LazyLock};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ClusterError;
use crate::message::{Message, Payload};

/// Width of the tag prefix.
pub(crate) const TAG_SIZE: usize = 8;

type EncodeFn = Box<dyn Fn(&Payload) -> Result<Vec<u8>, ClusterError> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Payload, ClusterError> + Send + Sync>;

struct Entry {
    type_name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

static REGISTRY: LazyLock<DashMap<u64, Arc<Entry>>> = LazyLock::new(DashMap::new);

/// Registers a message type for cluster transport under its tag.
///
/// Re-registering the same type is a no-op; remapping a tag to a different
/// type is logged and replaces the previous binding.
pub fn register<M>(prototype: M) -> Result<(), ClusterError>
where
    M: Message + Serialize + DeserializeOwned,
{
    let tag = prototype.message_tag() as u64;
    if tag == 0 {
        return Err(ClusterError::InvalidConfig(format!(
            "{} has tag 0 and cannot be registered",
            std::any::type_name::<M>()
        )));
    }
    let entry = Entry {
        type_name: std::any::type_name::<M>(),
        encode: Box::new(|payload| {
            let Some(message) = payload.downcast_ref::<M>() else {
                return Err(ClusterError::Encode(format!(
                    "payload tag {} is not a {}",
                    payload.tag(),
                    std::any::type_name::<M>()
                )));
            };
            serde_json::to_vec(message).map_err(|e| ClusterError::Encode(e.to_string()))
        }),
        decode: Box::new(|body| {
            if body.is_empty() {
                return Err(ClusterError::Decode("empty payload body".to_string()));
            }
            let message: M =
                serde_json::from_slice(body).map_err(|e| ClusterError::Decode(e.to_string()))?;
            Ok(Payload::new(message))
        }),
    };
    if let Some(old) = REGISTRY.insert(tag, Arc::new(entry)) {
        if old.type_name != std::any::type_name::<M>() {
            tracing::warn!(
                tag,
                old = old.type_name,
                new = std::any::type_name::<M>(),
                "cluster tag remapped to a different type"
            );
        }
    }
    Ok(())
}

/// Frames a typed message: `[tag][JSON]`.
///
/// The type must be registered so the receiving side can decode it.
pub fn marshal_message<M>(message: &M) -> Result<Bytes, ClusterError>
where
    M: Message + Serialize,
{
    let tag = message.message_tag() as u64;
    if !REGISTRY.contains_key(&tag) {
        return Err(ClusterError::NotRegistered { tag });
    }
    let body = serde_json::to_vec(message).map_err(|e| ClusterError::Encode(e.to_string()))?;
    Ok(frame(tag, &body))
}

/// Frames an erased payload through its registry entry.
pub fn marshal(payload: &Payload) -> Result<Bytes, ClusterError> {
    let tag = payload.tag() as u64;
    let Some(entry) = REGISTRY.get(&tag).map(|e| e.value().clone()) else {
        return Err(ClusterError::NotRegistered { tag });
    };
    let body = (entry.encode)(payload)?;
    Ok(frame(tag, &body))
}

/// Decodes a frame back into an erased payload of its registered type.
pub fn unmarshal(data: &[u8]) -> Result<Payload, ClusterError> {
    if data.len() < TAG_SIZE {
        return Err(ClusterError::Decode(format!(
            "frame of {} bytes is shorter than the tag",
            data.len()
        )));
    }
    let tag = (&data[..TAG_SIZE]).get_u64();
    let Some(entry) = REGISTRY.get(&tag).map(|e| e.value().clone()) else {
        return Err(ClusterError::NotRegistered { tag });
    };
    (entry.decode)(&data[TAG_SIZE..])
}

fn frame(tag: u64, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TAG_SIZE + body.len());
    buf.put_u64(tag);
    buf.put_slice(body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Move {
        x: i32,
        y: i32,
    }
    impl Message for Move {}

    #[derive(Debug, Serialize, Deserialize)]
    struct Unregistered;
    impl Message for Unregistered {}

    #[test]
    fn frame_round_trip_preserves_the_message() {
        register(Move { x: 0, y: 0 }).expect("register");

        let sent = Move { x: 3, y: -4 };
        let frame = marshal_message(&sent).expect("marshal");

        // tag is the first 8 bytes, big-endian
        let tag = u64::from_be_bytes(frame[..TAG_SIZE].try_into().expect("8 bytes"));
        assert_eq!(tag, sent.message_tag() as u64);

        let payload = unmarshal(&frame).expect("unmarshal");
        let back = payload.downcast::<Move>().ok().expect("typed");
        assert_eq!(*back, sent);
    }

    #[test]
    fn erased_payload_marshals_through_the_registry() {
        register(Move { x: 0, y: 0 }).expect("register");

        let payload = Payload::new(Move { x: 7, y: 8 });
        let frame = marshal(&payload).expect("marshal");
        let back = unmarshal(&frame)
            .expect("unmarshal")
            .downcast::<Move>()
            .ok()
            .expect("typed");
        assert_eq!(*back, Move { x: 7, y: 8 });
    }

    #[test]
    fn unknown_tags_are_rejected_both_ways() {
        let err = marshal_message(&Unregistered).expect_err("not registered");
        assert!(matches!(err, ClusterError::NotRegistered { .. }));

        let mut data = Vec::new();
        data.extend_from_slice(&0xdead_beef_u64.to_be_bytes());
        data.extend_from_slice(b"{}");
        let err = unmarshal(&data).expect_err("unknown tag");
        assert!(matches!(err, ClusterError::NotRegistered { tag: 0xdead_beef }));
    }

    #[test]
    fn truncated_frames_are_decode_errors() {
        let err = unmarshal(&[1, 2, 3]).expect_err("short frame");
        assert!(matches!(err, ClusterError::Decode(_)));
    }
}
