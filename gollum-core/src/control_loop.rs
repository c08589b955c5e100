//! The three shapes of control loop a producer task can run under,
//! corresponding to the Direct/Buffered, Ticker, and Batched producer
//! flavors. All three share the same shutdown and roll handling; they
//! differ only in when `Producer::flush` gets called.

use std::time::Duration;

use health::HealthHandle;
use tokio::sync::mpsc;
use tracing::warn;

use crate::message::Message;
use crate::producer::{Control, Producer, ProducerError};

/// Drains whatever is left in `messages` without blocking, handing each one
/// to the producer's own fallback-or-discard path. Called once a
/// `Control::Stop` has been accepted and before the loop's final `flush`, so
/// messages that were queued but never reached `produce` aren't silently
/// lost when the channel is dropped.
fn drain_remaining(messages: &mut mpsc::Receiver<Message>, producer: &dyn Producer) {
    while let Ok(message) = messages.try_recv() {
        producer.abandon(message);
    }
}

/// Runs a producer that delivers every message as it arrives, with no
/// internal batching (Direct and Buffered flavors). Returns when the
/// message channel closes or a `Control::Stop` is received.
pub async fn message_control_loop(
    mut producer: Box<dyn Producer>,
    mut messages: mpsc::Receiver<Message>,
    mut control: mpsc::Receiver<Control>,
    health: HealthHandle,
) {
    loop {
        tokio::select! {
            biased;

            Some(command) = control.recv() => {
                if command == Control::Stop {
                    drain_remaining(&mut messages, producer.as_ref());
                    break;
                }
                if matches!(command, Control::FuseActive | Control::FuseBurn) {
                    continue;
                }
                if let Err(err) = producer.control(command).await {
                    warn!(producer = producer.name(), error = %err, "control command failed");
                }
            }
            maybe_message = messages.recv() => {
                match maybe_message {
                    Some(message) => {
                        if let Err(err) = producer.produce(message).await {
                            warn!(producer = producer.name(), error = %err, "delivery failed");
                        }
                        health.report_healthy().await;
                    }
                    None => break,
                }
            }
        }
    }

    let _ = producer.flush().await;
}

/// Runs a producer that flushes on a fixed wall-clock interval regardless of
/// how many messages have accumulated (the Ticker flavor: e.g. a socket
/// producer that acks a whole batch of writes every N milliseconds).
pub async fn ticker_message_control_loop(
    mut producer: Box<dyn Producer>,
    mut messages: mpsc::Receiver<Message>,
    mut control: mpsc::Receiver<Control>,
    health: HealthHandle,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            Some(command) = control.recv() => {
                if command == Control::Stop {
                    drain_remaining(&mut messages, producer.as_ref());
                    break;
                }
                if matches!(command, Control::FuseActive | Control::FuseBurn) {
                    continue;
                }
                if let Err(err) = producer.control(command).await {
                    warn!(producer = producer.name(), error = %err, "control command failed");
                }
            }
            maybe_message = messages.recv() => {
                match maybe_message {
                    Some(message) => {
                        if let Err(err) = producer.produce(message).await {
                            warn!(producer = producer.name(), error = %err, "delivery failed");
                        }
                    }
                    None => break,
                }
            }
            _ = interval.tick() => {
                if let Err(err) = producer.flush().await {
                    warn!(producer = producer.name(), error = %err, "tick flush failed");
                }
                health.report_healthy().await;
            }
        }
    }

    let _ = producer.flush().await;
}

/// Runs a producer whose `produce` pushes into an internal `MessageBatch`
/// and signals when the count threshold is reached (the Batched flavor: the
/// Kafka-like batched network producer). A linger interval is also ticked
/// as a backstop so a low-traffic stream still flushes promptly.
pub async fn batch_message_loop(
    mut producer: Box<dyn Producer>,
    mut messages: mpsc::Receiver<Message>,
    mut control: mpsc::Receiver<Control>,
    health: HealthHandle,
    max_linger: Duration,
) {
    let mut interval = tokio::time::interval(max_linger);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            Some(command) = control.recv() => {
                if command == Control::Stop {
                    drain_remaining(&mut messages, producer.as_ref());
                    break;
                }
                if matches!(command, Control::FuseActive | Control::FuseBurn) {
                    continue;
                }
                if let Err(err) = producer.control(command).await {
                    warn!(producer = producer.name(), error = %err, "control command failed");
                }
            }
            maybe_message = messages.recv() => {
                match maybe_message {
                    Some(message) => {
                        if let Err(err) = producer.produce(message).await {
                            warn!(producer = producer.name(), error = %err, "delivery failed");
                        }
                        health.report_healthy().await;
                    }
                    None => break,
                }
            }
            _ = interval.tick() => {
                if let Err(err) = producer.flush().await {
                    warn!(producer = producer.name(), error = %err, "linger flush failed");
                }
            }
        }
    }

    let _ = producer.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StreamId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    struct CountingProducer {
        produced: Arc<AtomicUsize>,
        flushed: Arc<AtomicUsize>,
        abandoned: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Producer for CountingProducer {
        fn name(&self) -> &str {
            "counting"
        }

        async fn configure(&mut self, _router: Arc<crate::router::Router>) -> Result<(), ProducerError> {
            Ok(())
        }

        async fn control(&mut self, _command: Control) -> Result<(), ProducerError> {
            Ok(())
        }

        async fn produce(&mut self, _message: Message) -> Result<(), ProducerError> {
            self.produced.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn streams(&self) -> Vec<StreamId> {
            vec![StreamId::from_name("default")]
        }

        async fn flush(&mut self) -> Result<(), ProducerError> {
            self.flushed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn abandon(&self, _message: Message) {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn message_control_loop_stops_on_channel_close_and_flushes() {
        let produced = Arc::new(AtomicUsize::new(0));
        let flushed = Arc::new(AtomicUsize::new(0));
        let abandoned = Arc::new(AtomicUsize::new(0));
        let producer = Box::new(CountingProducer {
            produced: produced.clone(),
            flushed: flushed.clone(),
            abandoned: abandoned.clone(),
        });

        let (message_tx, message_rx) = mpsc::channel(8);
        let (_control_tx, control_rx) = mpsc::channel(1);
        let registry = health::HealthRegistry::new("test");
        let handle = registry
            .register("producer:counting".to_string(), time::Duration::seconds(30))
            .await;

        message_tx
            .send(Message::new("a", StreamId::from_name("default")))
            .await
            .unwrap();
        drop(message_tx);

        message_control_loop(producer, message_rx, control_rx, handle).await;

        assert_eq!(produced.load(Ordering::SeqCst), 1);
        assert_eq!(flushed.load(Ordering::SeqCst), 1);
        assert_eq!(abandoned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn message_control_loop_stops_on_stop_command() {
        let produced = Arc::new(AtomicUsize::new(0));
        let flushed = Arc::new(AtomicUsize::new(0));
        let abandoned = Arc::new(AtomicUsize::new(0));
        let producer = Box::new(CountingProducer {
            produced: produced.clone(),
            flushed: flushed.clone(),
            abandoned: abandoned.clone(),
        });

        let (_message_tx, message_rx) = mpsc::channel(8);
        let (control_tx, control_rx) = mpsc::channel(1);
        let registry = health::HealthRegistry::new("test");
        let handle = registry
            .register("producer:counting".to_string(), time::Duration::seconds(30))
            .await;

        control_tx.send(Control::Stop).await.unwrap();
        message_control_loop(producer, message_rx, control_rx, handle).await;

        assert_eq!(produced.load(Ordering::SeqCst), 0);
        assert_eq!(flushed.load(Ordering::SeqCst), 1);
        assert_eq!(abandoned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn message_control_loop_abandons_messages_still_queued_at_stop() {
        let produced = Arc::new(AtomicUsize::new(0));
        let flushed = Arc::new(AtomicUsize::new(0));
        let abandoned = Arc::new(AtomicUsize::new(0));
        let producer = Box::new(CountingProducer {
            produced: produced.clone(),
            flushed: flushed.clone(),
            abandoned: abandoned.clone(),
        });

        let (message_tx, message_rx) = mpsc::channel(8);
        let (control_tx, control_rx) = mpsc::channel(1);
        let registry = health::HealthRegistry::new("test");
        let handle = registry
            .register("producer:counting".to_string(), time::Duration::seconds(30))
            .await;

        // Queue messages ahead of Stop so the loop sees Stop before it has
        // had a chance to drain them through `produce`.
        for i in 0..3 {
            message_tx
                .send(Message::new(format!("m{i}"), StreamId::from_name("default")))
                .await
                .unwrap();
        }
        control_tx.send(Control::Stop).await.unwrap();

        message_control_loop(producer, message_rx, control_rx, handle).await;

        assert_eq!(produced.load(Ordering::SeqCst), 0);
        assert_eq!(abandoned.load(Ordering::SeqCst), 3);
        assert_eq!(flushed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_loop_flushes_on_interval_without_messages() {
        let produced = Arc::new(AtomicUsize::new(0));
        let flushed = Arc::new(AtomicUsize::new(0));
        let abandoned = Arc::new(AtomicUsize::new(0));
        let producer = Box::new(CountingProducer {
            produced: produced.clone(),
            flushed: flushed.clone(),
            abandoned: abandoned.clone(),
        });

        let (message_tx, message_rx) = mpsc::channel(8);
        let (control_tx, control_rx) = mpsc::channel(1);
        let registry = health::HealthRegistry::new("test");
        let handle = registry
            .register("producer:counting".to_string(), time::Duration::seconds(30))
            .await;

        let join = tokio::spawn(ticker_message_control_loop(
            producer,
            message_rx,
            control_rx,
            handle,
            StdDuration::from_millis(10),
        ));

        tokio::time::advance(StdDuration::from_millis(35)).await;
        control_tx.send(Control::Stop).await.unwrap();
        join.await.unwrap();
        drop(message_tx);

        assert!(flushed.load(Ordering::SeqCst) >= 2);
    }
}
