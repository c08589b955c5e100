//! The per-stream fan-out table from a [`StreamId`] to the producers
//! subscribed to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::message::{Message, StreamId};

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("no route registered for stream {0:?}")]
    NoRoute(StreamId),
    #[error("wildcard attachment was already performed once; late attachment is not supported")]
    LateRouterAttachment,
}

/// Anything a [`Router`] can hand a [`Message`] to. Implemented by the
/// producer's input-channel handle (see `gollum_core::producer::ProducerHandle`).
pub trait MessageSink: Send + Sync {
    fn name(&self) -> &str;

    /// Attempt to hand `message` off. Overflow policy (drop vs. block) is
    /// external to the router; implementations typically wrap a bounded
    /// channel's `try_send` and count drops rather than block the caller,
    /// since "sending must never block the sender" for the control path and
    /// the same discipline is simplest to keep uniform for input delivery.
    fn send(&self, message: Message) -> Result<(), RouterError>;
}

#[derive(Default)]
struct RouterInner {
    explicit: HashMap<StreamId, Vec<Arc<dyn MessageSink>>>,
    wildcards: Vec<Arc<dyn MessageSink>>,
}

/// A fan-out table from stream id to producer list, plus a wildcard list.
///
/// A producer attached to [`StreamId::WILDCARD`] is implicitly attached to
/// every stream already registered at the time [`Router::attach_wildcards`]
/// runs, except [`StreamId::LOG_INTERNAL`] — this keeps a wildcard producer
/// (e.g. a file sink that also subscribes to gollum's own logs) from
/// recursively re-logging the very write it just performed.
pub struct Router {
    inner: RwLock<RouterInner>,
    attached: AtomicBool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RouterInner::default()),
            attached: AtomicBool::new(false),
        }
    }

    /// Declares that `sink` wants messages for `stream_id`. Passing
    /// [`StreamId::WILDCARD`] registers `sink` as a wildcard producer instead
    /// of an explicit one; it is expanded into every existing stream by the
    /// subsequent, one-shot [`Router::attach_wildcards`] call.
    pub fn add_producer(&self, stream_id: StreamId, sink: Arc<dyn MessageSink>) {
        let mut inner = self.inner.write().expect("poisoned Router lock");
        if stream_id.is_wildcard() {
            inner.wildcards.push(sink);
        } else {
            inner.explicit.entry(stream_id).or_default().push(sink);
        }
    }

    /// Ensures a stream has a (possibly empty) explicit entry, so a later
    /// producer attached directly to it always has somewhere to land and so
    /// wildcard expansion has a complete set of streams to walk.
    pub fn ensure_stream(&self, stream_id: StreamId) {
        let mut inner = self.inner.write().expect("poisoned Router lock");
        inner.explicit.entry(stream_id).or_default();
    }

    /// Attaches every registered wildcard producer to every stream known at
    /// the time of the call, except [`StreamId::LOG_INTERNAL`]. This is a
    /// one-shot pass run by the coordinator after all producers have been
    /// constructed; any router created afterwards (e.g. by a consumer
    /// declaring a previously-unseen stream) is *not* retroactively attached.
    /// Calling this a second time is rejected rather than silently skipped.
    pub fn attach_wildcards(&self) -> Result<(), RouterError> {
        if self.attached.swap(true, Ordering::SeqCst) {
            return Err(RouterError::LateRouterAttachment);
        }

        let mut inner = self.inner.write().expect("poisoned Router lock");
        let wildcards = inner.wildcards.clone();
        for (stream_id, sinks) in inner.explicit.iter_mut() {
            if *stream_id == StreamId::LOG_INTERNAL {
                continue;
            }
            sinks.extend(wildcards.iter().cloned());
        }
        Ok(())
    }

    pub fn has_route(&self, stream_id: StreamId) -> bool {
        let inner = self.inner.read().expect("poisoned Router lock");
        inner
            .explicit
            .get(&stream_id)
            .map(|sinks| !sinks.is_empty())
            .unwrap_or(false)
    }

    /// Hands `message` to every producer registered for its current stream.
    /// Returns [`RouterError::NoRoute`] if nothing is subscribed; the caller
    /// (typically [`crate::fallback::try_fallback`]) decides what that means.
    pub fn route(&self, message: Message) -> Result<(), RouterError> {
        let stream_id = message.stream_id();
        let sinks = {
            let inner = self.inner.read().expect("poisoned Router lock");
            inner.explicit.get(&stream_id).cloned()
        };

        let Some(sinks) = sinks.filter(|s| !s.is_empty()) else {
            return Err(RouterError::NoRoute(stream_id));
        };

        let (last, rest) = sinks.split_last().expect("checked non-empty above");
        for sink in rest {
            let _ = sink.send(message.clone());
        }
        let _ = last.send(message);
        Ok(())
    }
}
