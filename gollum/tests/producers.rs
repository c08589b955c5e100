//! Coverage of producer-level scenarios that don't need a full coordinator:
//! file rotation, spool-then-replay, and the fallback discipline routing a
//! message away from a producer that has no direct subscriber.

use std::sync::Arc;

use gollum_core::fallback::try_fallback;
use gollum_core::message::{Message, StreamId};
use gollum_core::router::{MessageSink, Router, RouterError};
use gollum_core::StreamRegistry;
use gollum_producers::file::{FileConfig, FileProducer};
use gollum_producers::spool::{replay_spooled, SpoolConfig, SpoolProducer};
use gollum_core::config::RotationConfig;
use gollum_core::producer::Producer;

struct RecordingSink {
    received: std::sync::Mutex<Vec<Message>>,
}

impl MessageSink for RecordingSink {
    fn name(&self) -> &str {
        "recorder"
    }
    fn send(&self, message: Message) -> Result<(), RouterError> {
        self.received.lock().unwrap().push(message);
        Ok(())
    }
}

#[tokio::test]
async fn file_producer_rotates_at_clock_and_size_boundaries() {
    let dir = std::env::temp_dir().join(format!("gollum-int-file-{}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("events.log");

    let mut producer = FileProducer::new(
        "file",
        vec![StreamId::from_name("events")],
        FileConfig {
            path: path.to_str().unwrap().to_owned(),
            fallback: None,
            revert_stream_on_drop: false,
            rotation: RotationConfig {
                max_size_bytes: 8,
                max_age_secs: 0,
                at_clock_hour: None,
                at_clock_minute: 0,
            },
        },
    );

    for i in 0..5 {
        producer
            .produce(Message::new(format!("msg-{i}"), StreamId::from_name("events")))
            .await
            .unwrap();
    }

    let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
    assert!(entries.len() > 1, "expected rotation to create more than one file");

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn spooled_messages_survive_and_replay_through_the_router() {
    let dir = std::env::temp_dir().join(format!("gollum-int-spool-{}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();

    let registry = StreamRegistry::new();
    let stream = registry.register("orders");

    let mut spool = SpoolProducer::new(
        "spool",
        vec![stream],
        SpoolConfig {
            path: dir.to_str().unwrap().to_owned(),
            max_messages_sec: 0,
            rotation: RotationConfig {
                max_size_bytes: 0,
                max_age_secs: 0,
                at_clock_hour: None,
                at_clock_minute: 0,
            },
        },
        registry.clone(),
    );

    spool.produce(Message::new("order-1", stream)).await.unwrap();
    spool.produce(Message::new("order-2", stream)).await.unwrap();

    let router = Router::new();
    let sink = Arc::new(RecordingSink {
        received: std::sync::Mutex::new(Vec::new()),
    });
    router.add_producer(stream, sink.clone());

    let replayed = replay_spooled(&dir, &router, &registry).unwrap();
    assert_eq!(replayed, 2);
    assert_eq!(sink.received.lock().unwrap().len(), 2);

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn fallback_reroutes_when_primary_producer_has_no_route() {
    let router = Router::new();
    let fallback_stream = StreamId::from_name("_DROPPED_");
    let sink = Arc::new(RecordingSink {
        received: std::sync::Mutex::new(Vec::new()),
    });
    router.add_producer(fallback_stream, sink.clone());

    let message = Message::new("orphaned", StreamId::from_name("events"));
    try_fallback(&router, message, fallback_stream, false, "file");

    let received = sink.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].stream_id(), fallback_stream);
    assert_eq!(received[0].prev_stream_id(), Some(StreamId::from_name("events")));
}
