//! # Message identity.
//!
//! Every RPC message is addressed by a 32-bit tag derived from its concrete
//! type. The default tag is a BKDR hash of the fully qualified type name,
//! cached per [`TypeId`] so lookup is O(1) after first use. A type may pin its
//! own tag by overriding [`Message::message_tag`] — useful to keep a tag
//! stable across refactors or to alias two wire-compatible types.
//!
//! Tag `0` is reserved to mean "no identity"; registries reject it.
//!
//! ## Example
//! ```
//! use chassis::Message;
//!
//! struct Echo { v: i32 }
//! impl Message for Echo {}
//!
//! struct Pinned;
//! impl Message for Pinned {
//!     fn message_tag(&self) -> u32 { 42 }
//! }
//! # let _ = (Echo { v: 1 }, Pinned);
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::LazyLock;

use dashmap::DashMap;

/// Per-type tag cache. Populated on first use, never evicted.
static TAG_CACHE: LazyLock<DashMap<TypeId, u32>> = LazyLock::new(DashMap::new);

/// BKDR hash (seed 131) over a byte sequence.
pub fn bkdr_hash(bytes: &[u8]) -> u32 {
    const SEED: u32 = 131;
    let mut hash: u32 = 0;
    for b in bytes {
        hash = hash.wrapping_mul(SEED).wrapping_add(u32::from(*b));
    }
    hash
}

/// Returns the default tag for a type: BKDR over its fully qualified name.
///
/// Safe to call concurrently; pure modulo the per-type cache.
pub fn type_tag<T: 'static>() -> u32 {
    let key = TypeId::of::<T>();
    if let Some(tag) = TAG_CACHE.get(&key) {
        return *tag;
    }
    let tag = bkdr_hash(std::any::type_name::<T>().as_bytes());
    TAG_CACHE.insert(key, tag);
    tag
}

/// A value that can travel through the RPC fabric.
///
/// Implementations are usually empty: `impl Message for Echo {}`.
pub trait Message: Any + Send + 'static {
    /// The 32-bit identity of this message's type.
    ///
    /// Defaults to the hashed type name; override to pin a custom tag.
    /// Returning `0` makes the message unroutable.
    fn message_tag(&self) -> u32
    where
        Self: Sized,
    {
        type_tag::<Self>()
    }
}

/// A type-erased message with its tag captured at construction.
///
/// `Payload` is what handlers receive and what crosses the cluster codec;
/// [`Payload::downcast`] recovers the concrete type.
pub struct Payload {
    tag: u32,
    value: Box<dyn Any + Send>,
}

impl Payload {
    /// Erases a message, capturing its tag.
    pub fn new<M: Message>(message: M) -> Self {
        let tag = message.message_tag();
        Self {
            tag,
            value: Box::new(message),
        }
    }

    /// Rebuilds a payload from a tag and an already-boxed value.
    ///
    /// Used by the cluster codec after decoding a frame.
    pub(crate) fn from_parts(tag: u32, value: Box<dyn Any + Send>) -> Self {
        Self { tag, value }
    }

    /// The message tag captured at construction.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Whether the payload holds a `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Borrows the payload as a `T`, if it holds one.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Consumes the payload, recovering the concrete message.
    pub fn downcast<T: 'static>(self) -> Result<Box<T>, Payload> {
        let tag = self.tag;
        self.value
            .downcast::<T>()
            .map_err(|value| Payload { tag, value })
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").field("tag", &self.tag).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping;
    impl Message for Ping {}

    struct Pong;
    impl Message for Pong {}

    struct Pinned;
    impl Message for Pinned {
        fn message_tag(&self) -> u32 {
            7_700
        }
    }

    #[test]
    fn bkdr_matches_reference_values() {
        // h = h*131 + byte, seed 131.
        assert_eq!(bkdr_hash(b""), 0);
        assert_eq!(bkdr_hash(b"a"), 97);
        assert_eq!(bkdr_hash(b"ab"), 97 * 131 + 98);
    }

    #[test]
    fn tags_are_stable_and_distinct() {
        let a = type_tag::<Ping>();
        let b = type_tag::<Ping>();
        assert_eq!(a, b);
        assert_ne!(type_tag::<Ping>(), type_tag::<Pong>());
    }

    #[test]
    fn tags_are_stable_across_threads() {
        let base = type_tag::<Ping>();
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(type_tag::<Ping>))
            .collect();
        for h in handles {
            assert_eq!(h.join().expect("thread"), base);
        }
    }

    #[test]
    fn self_tag_overrides_hash() {
        assert_eq!(Pinned.message_tag(), 7_700);
        let p = Payload::new(Pinned);
        assert_eq!(p.tag(), 7_700);
    }

    #[test]
    fn payload_downcast_round_trip() {
        struct Echo {
            v: i32,
        }
        impl Message for Echo {}

        let p = Payload::new(Echo { v: 9 });
        assert!(p.is::<Echo>());
        assert!(!p.is::<Ping>());
        let echo = p.downcast::<Echo>().ok().expect("concrete type");
        assert_eq!(echo.v, 9);
    }

    #[test]
    fn failed_downcast_returns_payload() {
        let p = Payload::new(Ping);
        let tag = p.tag();
        let p = p.downcast::<Pong>().err().expect("wrong type");
        assert_eq!(p.tag(), tag);
        assert!(p.is::<Ping>());
    }
}
