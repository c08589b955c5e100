//! The Null producer: accepts and discards every message. Used for
//! benchmarking the rest of the pipeline and as the default fallback target
//! in tests.

use std::sync::Arc;

use async_trait::async_trait;
use gollum_core::message::{Message, StreamId};
use gollum_core::producer::{Control, Producer, ProducerCore, ProducerError};
use gollum_core::router::Router;

pub struct NullProducer {
    core: ProducerCore,
    streams: Vec<StreamId>,
}

impl NullProducer {
    pub fn new(name: impl Into<String>, streams: Vec<StreamId>) -> Self {
        Self {
            core: ProducerCore::new(name, None),
            streams,
        }
    }
}

#[async_trait]
impl Producer for NullProducer {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn configure(&mut self, _router: Arc<Router>) -> Result<(), ProducerError> {
        Ok(())
    }

    async fn control(&mut self, _command: Control) -> Result<(), ProducerError> {
        Ok(())
    }

    async fn produce(&mut self, _message: Message) -> Result<(), ProducerError> {
        self.core.record_produced();
        Ok(())
    }

    fn streams(&self) -> Vec<StreamId> {
        self.streams.clone()
    }

    fn abandon(&self, message: Message) {
        self.core.drop_message(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produce_counts_and_discards() {
        let mut producer = NullProducer::new("null", vec![StreamId::WILDCARD]);
        producer
            .produce(Message::new("a", StreamId::from_name("default")))
            .await
            .unwrap();
        producer
            .produce(Message::new("b", StreamId::from_name("default")))
            .await
            .unwrap();
        assert_eq!(producer.core.produced_count(), 2);
    }

    #[tokio::test]
    async fn control_commands_are_no_ops() {
        let mut producer = NullProducer::new("null", vec![]);
        producer.control(Control::Roll).await.unwrap();
        producer.control(Control::Stop).await.unwrap();
    }
}
