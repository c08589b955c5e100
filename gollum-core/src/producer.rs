//! The producer contract every concrete sink implements, and the shared
//! bookkeeping (`ProducerCore`) factored out of it so the four producer
//! flavors (Direct, Buffered, Ticker, Batched) differ only in their control
//! loop, not in how they're wired into the router.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{Message, StreamId};
use crate::router::{MessageSink, Router, RouterError};

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("producer {0} failed to configure: {1}")]
    Configure(String, String),
    #[error("producer {0} failed to deliver a message: {1}")]
    Delivery(String, String),
    #[error("producer {0} received an unsupported control command")]
    UnsupportedControl(String),
    #[error(transparent)]
    Router(#[from] RouterError),
}

/// A command sent to a running producer out-of-band from message traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// SIGHUP: close and reopen any writer-like resource (file, spool
    /// segment) without losing queued messages.
    Roll,
    /// Drain and stop accepting new messages; the coordinator is shutting
    /// down.
    Stop,
    /// Legacy fuse-breaker signals kept for wire compatibility with older
    /// topologies; this crate has no fuse subsystem, so every producer
    /// treats both as a no-op.
    FuseActive,
    FuseBurn,
}

/// Which control loop the coordinator should drive a producer with.
/// Producers differ from each other only in this choice, never in how
/// they're wired into the router.
#[derive(Debug, Clone, Copy)]
pub enum ControlLoopFlavor {
    /// Direct/Buffered: deliver every message as it arrives, no internal
    /// timer (Null, Console, File).
    Direct,
    /// Ticker: flush on a fixed wall-clock interval regardless of how much
    /// has accumulated (Socket).
    Ticker(Duration),
    /// Batched: flush on a count threshold, with a linger interval as a
    /// backstop so low-traffic streams still flush promptly (Kafka-like
    /// batched network producer).
    Batched(Duration),
}

/// The async behavior every concrete producer implements. Construction and
/// dependency injection (e.g. an `rdkafka` client) happen on the concrete
/// type before it's handed to the coordinator as a `Box<dyn Producer>`.
#[async_trait]
pub trait Producer: Send {
    fn name(&self) -> &str;

    /// Which control loop the coordinator should run this producer under.
    /// Defaults to `Direct`; Ticker and Batched producers override this to
    /// report their own interval.
    fn control_loop_flavor(&self) -> ControlLoopFlavor {
        ControlLoopFlavor::Direct
    }

    /// Called once, after every producer has been constructed but before
    /// any consumer starts delivering messages. Producers that need to
    /// declare explicit stream subscriptions (or attach to the wildcard
    /// stream) do so against `router` here.
    async fn configure(&mut self, router: Arc<Router>) -> Result<(), ProducerError>;

    /// Handles an out-of-band control command (roll, stop).
    async fn control(&mut self, command: Control) -> Result<(), ProducerError>;

    /// Delivers a single message. Implementations that batch internally
    /// (Ticker, Batched) still accept one message at a time here and flush
    /// on their own schedule.
    async fn produce(&mut self, message: Message) -> Result<(), ProducerError>;

    /// The streams this producer is interested in, used during `configure`.
    /// Returning `[StreamId::WILDCARD]` attaches to every stream (see
    /// [`crate::router::Router::attach_wildcards`]).
    fn streams(&self) -> Vec<StreamId>;

    /// Flushes any internally buffered messages. The Direct flavor has
    /// nothing to flush and keeps the default no-op; Ticker and Batched
    /// producers override this to drain their `MessageBatch` and hand it to
    /// the underlying resource.
    async fn flush(&mut self) -> Result<(), ProducerError> {
        Ok(())
    }

    /// Gives up on `message` through this producer's own fallback-or-discard
    /// path, without attempting delivery. The control loops call this to
    /// drain whatever is still sitting in the input channel once
    /// `Control::Stop` has been accepted, so messages that never reached
    /// `produce` are still accounted for rather than silently vanishing.
    fn abandon(&self, message: Message);
}

/// Bookkeeping shared by every concrete producer: identity, the fallback
/// stream to retry through when delivery fails, a handle to the router
/// (bound once during `configure`), and a running count of messages handled
/// (exposed as a metric by the coordinator).
pub struct ProducerCore {
    name: String,
    fallback_stream: Option<StreamId>,
    revert_stream_on_drop: bool,
    router: Option<Arc<Router>>,
    produced: AtomicU64,
    dropped: AtomicU64,
}

impl ProducerCore {
    pub fn new(name: impl Into<String>, fallback_stream: Option<StreamId>) -> Self {
        Self {
            name: name.into(),
            fallback_stream,
            revert_stream_on_drop: false,
            router: None,
            produced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_revert_stream_on_drop(mut self, revert: bool) -> Self {
        self.revert_stream_on_drop = revert;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fallback_stream(&self) -> Option<StreamId> {
        self.fallback_stream
    }

    /// Binds the router this producer's `try_fallback` calls should route
    /// through. Called once from `Producer::configure`.
    pub fn bind_router(&mut self, router: Arc<Router>) {
        self.router = Some(router);
    }

    /// The sole path by which a concrete producer may drop a message: either
    /// re-routes it through `fallback_stream` or counts it as discarded. A
    /// producer with no bound router or no configured fallback stream always
    /// counts the message as discarded (see [`crate::fallback::try_fallback`]).
    pub fn drop_message(&self, message: Message) {
        self.record_dropped();
        match (&self.router, self.fallback_stream) {
            (Some(router), Some(fallback_stream)) => crate::fallback::try_fallback(
                router,
                message,
                fallback_stream,
                self.revert_stream_on_drop,
                &self.name,
            ),
            _ => {
                metrics::counter!("messages_discarded", "producer" => self.name.clone())
                    .increment(1);
            }
        }
    }

    pub fn record_produced(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_produced_n(&self, n: u64) {
        self.produced.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn produced_count(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The router-facing side of a running producer: a bounded channel into its
/// input queue. The producer's own task owns the receiving end and feeds
/// messages into its `produce` method one at a time.
#[derive(Clone)]
pub struct ProducerHandle {
    name: String,
    sender: mpsc::Sender<Message>,
}

impl ProducerHandle {
    pub fn new(name: impl Into<String>, sender: mpsc::Sender<Message>) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }
}

impl MessageSink for ProducerHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, message: Message) -> Result<(), RouterError> {
        match self.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("router_input_full", "producer" => self.name.clone())
                    .increment(1);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RouterError::NoRoute(
                // The producer task has exited; there is nothing to route to
                // any more. Reuse NoRoute since the effect on the caller
                // (count as discarded) is identical.
                StreamId::from_name(&self.name),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_core_tracks_counts() {
        let core = ProducerCore::new("console", None);
        core.record_produced();
        core.record_produced();
        core.record_dropped();
        assert_eq!(core.produced_count(), 2);
        assert_eq!(core.dropped_count(), 1);
    }

    #[tokio::test]
    async fn handle_try_send_reports_full_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = ProducerHandle::new("slow", tx);

        handle
            .send(Message::new("a", StreamId::from_name("default")))
            .unwrap();
        // Channel now full; this must return Ok (dropped, counted) rather
        // than block or error the caller.
        handle
            .send(Message::new("b", StreamId::from_name("default")))
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.stream_id(), StreamId::from_name("default"));
    }

    #[tokio::test]
    async fn handle_send_after_receiver_dropped_errors() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = ProducerHandle::new("gone", tx);
        let err = handle
            .send(Message::new("a", StreamId::from_name("default")))
            .unwrap_err();
        assert!(matches!(err, RouterError::NoRoute(_)));
    }
}
