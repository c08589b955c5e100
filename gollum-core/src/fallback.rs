//! The single path by which a message is ever dropped: look up a fallback
//! route for the stream the message is already on, and either re-route it
//! there or count it as discarded. Nothing else in a producer is allowed to
//! silently swallow a message.

use metrics::counter;

use crate::message::{Message, StreamId};
use crate::router::Router;

/// Re-routes `message` to `fallback_stream`, or counts it as discarded if no
/// producer is subscribed to that stream.
///
/// If `revert_stream_on_drop` is set, the message's stream id is first
/// reverted to its previous stream id (so the fallback lookup and the
/// eventual re-route happen against the stream the message came from,
/// rather than the stream that just failed to deliver it) before the normal
/// fallback-stream resolution runs.
///
/// `producer_name` is attached to the `messages_discarded` metric so drops
/// can be attributed to the producer that gave up on the message.
pub fn try_fallback(
    router: &Router,
    message: Message,
    fallback_stream: StreamId,
    revert_stream_on_drop: bool,
    producer_name: &str,
) {
    let mut message = message;
    if revert_stream_on_drop {
        if let Some(prev) = message.prev_stream_id() {
            message.set_stream_id(prev);
        }
    }

    if !router.has_route(fallback_stream) {
        counter!("messages_discarded", "producer" => producer_name.to_owned()).increment(1);
        return;
    }

    message.set_stream_id(fallback_stream);
    if router.route(message).is_err() {
        counter!("messages_discarded", "producer" => producer_name.to_owned()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::MessageSink;
    use std::sync::{Arc, Mutex};

    struct RecordingSink {
        received: Mutex<Vec<Message>>,
    }

    impl MessageSink for RecordingSink {
        fn name(&self) -> &str {
            "recorder"
        }

        fn send(&self, message: Message) -> Result<(), crate::router::RouterError> {
            self.received.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[test]
    fn reroutes_when_fallback_stream_has_a_producer() {
        let router = Router::new();
        let fallback_stream = StreamId::from_name("_DROPPED_");
        let sink = Arc::new(RecordingSink {
            received: Mutex::new(Vec::new()),
        });
        router.add_producer(fallback_stream, sink.clone());

        let message = Message::new("payload", StreamId::from_name("orders"));
        try_fallback(&router, message, fallback_stream, false, "kafka");

        assert_eq!(sink.received.lock().unwrap().len(), 1);
        assert_eq!(
            sink.received.lock().unwrap()[0].stream_id(),
            fallback_stream
        );
    }

    #[test]
    fn counts_discarded_when_fallback_stream_has_no_producer() {
        let router = Router::new();
        let fallback_stream = StreamId::from_name("_DROPPED_");
        let message = Message::new("payload", StreamId::from_name("orders"));

        // No producer registered for the fallback stream: this must not
        // panic and must not route anywhere.
        try_fallback(&router, message, fallback_stream, false, "kafka");
    }

    #[test]
    fn revert_stream_on_drop_routes_against_the_previous_stream() {
        let router = Router::new();
        let original_stream = StreamId::from_name("orders");
        let sink = Arc::new(RecordingSink {
            received: Mutex::new(Vec::new()),
        });
        // The fallback stream for this drop is the message's own origin
        // stream, re-subscribed (as spooling does for its respool reader).
        router.add_producer(original_stream, sink.clone());

        let mut message = Message::new("payload", original_stream);
        // Simulate a prior stream override (e.g. routed through a dead-letter
        // stream) before the drop that triggers this fallback.
        message.set_stream_id(StreamId::from_name("dead_letter"));
        assert_eq!(message.prev_stream_id(), Some(original_stream));

        try_fallback(&router, message, original_stream, true, "spool");

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].stream_id(), original_stream);
    }
}
