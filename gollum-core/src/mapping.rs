//! Stream→target mapping with lazy, idempotent caching.
//!
//! Producers that write to a named external resource (a Kafka-like topic, a
//! socket destination) resolve that name once per stream and reuse the
//! result, since resolution can itself be expensive (e.g. a topic-exists
//! check against a broker).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::message::StreamId;

/// An opaque, producer-defined handle to a resolved target (e.g. a Kafka
/// topic name or partition count) cheap enough to clone and reuse per
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicHandle {
    pub name: String,
}

impl TopicHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Resolves a [`StreamId`] to a [`TopicHandle`] via a caller-supplied
/// resolver function, caching the result so the resolver only runs once per
/// stream for the lifetime of the mapping.
pub struct StreamMapping<F>
where
    F: Fn(StreamId) -> TopicHandle,
{
    cache: RwLock<HashMap<StreamId, TopicHandle>>,
    resolver: F,
}

impl<F> StreamMapping<F>
where
    F: Fn(StreamId) -> TopicHandle,
{
    pub fn new(resolver: F) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            resolver,
        }
    }

    /// Resolves `stream_id`, consulting the cache first. Idempotent: calling
    /// this repeatedly with the same stream id never re-invokes the
    /// resolver after the first successful resolution.
    pub fn resolve(&self, stream_id: StreamId) -> TopicHandle {
        if let Some(cached) = self.cache.read().expect("poisoned mapping lock").get(&stream_id) {
            return cached.clone();
        }

        let resolved = (self.resolver)(stream_id);
        let mut cache = self.cache.write().expect("poisoned mapping lock");
        cache.entry(stream_id).or_insert(resolved).clone()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().expect("poisoned mapping lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn resolver_runs_once_per_stream() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let mapping = StreamMapping::new(move |stream_id| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            TopicHandle::new(format!("topic-{}", stream_id.as_u64()))
        });

        let a = StreamId::from_name("orders");
        let first = mapping.resolve(a);
        let second = mapping.resolve(a);

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(mapping.cached_len(), 1);
    }

    #[test]
    fn distinct_streams_resolve_independently() {
        let mapping = StreamMapping::new(|stream_id| TopicHandle::new(format!("{:?}", stream_id)));
        let a = StreamId::from_name("orders");
        let b = StreamId::from_name("errors");

        assert_ne!(mapping.resolve(a), mapping.resolve(b));
        assert_eq!(mapping.cached_len(), 2);
    }
}
