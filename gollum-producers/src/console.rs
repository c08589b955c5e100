//! The Console producer: a Buffered-flavor sink that writes message
//! payloads to stdout, batching writes in memory and flushing them in one
//! shot rather than making a syscall per message.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use envconfig::Envconfig;
use gollum_core::message::{Message, StreamId};
use gollum_core::producer::{Control, Producer, ProducerCore, ProducerError};
use gollum_core::router::Router;

#[derive(Envconfig, Clone)]
pub struct ConsoleConfig {
    #[envconfig(default = "128")]
    pub buffer_lines: usize,
}

pub struct ConsoleProducer {
    core: ProducerCore,
    streams: Vec<StreamId>,
    buffer: Vec<u8>,
    buffer_lines: usize,
    buffered_count: usize,
}

impl ConsoleProducer {
    pub fn new(name: impl Into<String>, streams: Vec<StreamId>, config: ConsoleConfig) -> Self {
        Self {
            core: ProducerCore::new(name, None),
            streams,
            buffer: Vec::new(),
            buffer_lines: config.buffer_lines.max(1),
            buffered_count: 0,
        }
    }
}

#[async_trait]
impl Producer for ConsoleProducer {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn configure(&mut self, _router: Arc<Router>) -> Result<(), ProducerError> {
        Ok(())
    }

    async fn control(&mut self, command: Control) -> Result<(), ProducerError> {
        if command == Control::Roll {
            self.flush().await?;
        }
        Ok(())
    }

    async fn produce(&mut self, message: Message) -> Result<(), ProducerError> {
        self.buffer.extend_from_slice(message.payload());
        self.buffer.push(b'\n');
        self.buffered_count += 1;
        self.core.record_produced();

        if self.buffered_count >= self.buffer_lines {
            self.flush().await?;
        }
        Ok(())
    }

    fn streams(&self) -> Vec<StreamId> {
        self.streams.clone()
    }

    async fn flush(&mut self) -> Result<(), ProducerError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(&self.buffer)
            .map_err(|e| ProducerError::Delivery(self.core.name().to_owned(), e.to_string()))?;
        self.buffer.clear();
        self.buffered_count = 0;
        Ok(())
    }

    fn abandon(&self, message: Message) {
        self.core.drop_message(message);
    }
}
