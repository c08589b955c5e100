//! The [`Message`] value type and the process-wide [`StreamRegistry`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A 64-bit hash identifying a stream by name.
///
/// Two ids are reserved and can never be produced by [`StreamId::from_name`]:
/// [`StreamId::WILDCARD`] (subscribes to every stream) and
/// [`StreamId::LOG_INTERNAL`] (carries gollum's own log output). Both sit at
/// the top of the keyspace, far from where an FNV-1a hash of a real stream
/// name will ever land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Subscribes a producer to every stream except those whose only listener
    /// is [`StreamId::LOG_INTERNAL`] (see [`crate::router::Router::attach_wildcards`]).
    pub const WILDCARD: StreamId = StreamId(u64::MAX);
    /// Carries gollum's own structured log output, so a log-consuming router
    /// can be wired up without every wildcard producer also receiving it.
    pub const LOG_INTERNAL: StreamId = StreamId(u64::MAX - 1);

    /// Hash a stream name into a [`StreamId`] with FNV-1a, the same
    /// algorithm the Kafka-like producer offers as a partitioner.
    pub fn from_name(name: &str) -> Self {
        const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;

        let mut hash = FNV_OFFSET_BASIS;
        for byte in name.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        StreamId(hash)
    }

    pub fn is_wildcard(self) -> bool {
        self == Self::WILDCARD
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Reconstructs a `StreamId` from its raw hash, e.g. when deserializing
    /// a persisted spool frame. Prefer [`StreamId::from_name`] for anything
    /// derived fresh from a stream name.
    pub const fn from_raw(value: u64) -> Self {
        StreamId(value)
    }
}

impl From<&str> for StreamId {
    fn from(name: &str) -> Self {
        StreamId::from_name(name)
    }
}

/// An immutable-by-convention record produced by a consumer, routed by
/// stream id, and handed off to exactly one producer.
///
/// A producer that receives a `Message` must either deliver it, drop it with
/// a counted reason, or try-fallback it — see [`crate::fallback::try_fallback`].
/// It is never both delivered and dropped.
#[derive(Debug, Clone)]
pub struct Message {
    payload: Bytes,
    metadata: Option<HashMap<String, Bytes>>,
    created_at: DateTime<Utc>,
    stream_id: StreamId,
    prev_stream_id: Option<StreamId>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>, stream_id: StreamId) -> Self {
        Self {
            payload: payload.into(),
            metadata: None,
            created_at: Utc::now(),
            stream_id,
            prev_stream_id: None,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Overrides the creation timestamp. Used when reconstructing a
    /// [`Message`] from a persisted spool frame, where the original
    /// creation time is part of the serialized record.
    pub fn set_created_at(&mut self, created_at: DateTime<Utc>) {
        self.created_at = created_at;
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn prev_stream_id(&self) -> Option<StreamId> {
        self.prev_stream_id
    }

    pub fn metadata(&self) -> Option<&HashMap<String, Bytes>> {
        self.metadata.as_ref()
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Bytes> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
    }

    /// Overrides the current stream, remembering the previous one so
    /// fallback and spooling can route back to the message's origin.
    pub fn set_stream_id(&mut self, stream_id: StreamId) {
        self.prev_stream_id = Some(self.stream_id);
        self.stream_id = stream_id;
    }
}

/// Process-wide id↔name mapping, registered lazily and idempotently.
///
/// Hot path (resolving a name the caller already expects to exist) never
/// blocks on a writer; the rare registration of a brand-new name takes a
/// short write lock.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    inner: Arc<RwLock<HashMap<StreamId, String>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`, returning its `StreamId`. Safe to call repeatedly
    /// with the same name: registration is idempotent.
    pub fn register(&self, name: &str) -> StreamId {
        let id = StreamId::from_name(name);
        if self.name_of(id).is_none() {
            let mut map = self.inner.write().expect("poisoned StreamRegistry lock");
            map.entry(id).or_insert_with(|| name.to_owned());
        }
        id
    }

    pub fn name_of(&self, id: StreamId) -> Option<String> {
        self.inner
            .read()
            .expect("poisoned StreamRegistry lock")
            .get(&id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_hashes_to_same_id() {
        assert_eq!(StreamId::from_name("default"), StreamId::from_name("default"));
        assert_ne!(StreamId::from_name("default"), StreamId::from_name("errors"));
    }

    #[test]
    fn reserved_ids_are_stable() {
        assert_ne!(StreamId::WILDCARD, StreamId::from_name("anything"));
        assert_ne!(StreamId::LOG_INTERNAL, StreamId::from_name("anything"));
        assert_ne!(StreamId::WILDCARD, StreamId::LOG_INTERNAL);
    }

    #[test]
    fn registry_register_is_idempotent() {
        let registry = StreamRegistry::new();
        let a = registry.register("default");
        let b = registry.register("default");
        assert_eq!(a, b);
        assert_eq!(registry.name_of(a).as_deref(), Some("default"));
    }

    #[test]
    fn message_set_stream_id_remembers_previous() {
        let mut message = Message::new("payload", StreamId::from_name("default"));
        let fallback = StreamId::from_name("_DROPPED_");
        message.set_stream_id(fallback);
        assert_eq!(message.stream_id(), fallback);
        assert_eq!(message.prev_stream_id(), Some(StreamId::from_name("default")));
    }
}
