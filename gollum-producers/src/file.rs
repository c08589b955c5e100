//! The File producer: a Buffered-flavor sink that appends message payloads
//! to a file on disk, rotating it according to a [`RotationPolicy`] and on
//! `Control::Roll`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use envconfig::Envconfig;
use gollum_core::assembly::WriterAssembly;
use gollum_core::config::RotationConfig;
use gollum_core::message::{Message, StreamId};
use gollum_core::producer::{Control, Producer, ProducerCore, ProducerError};
use gollum_core::rotation::BatchedWriter;
use gollum_core::router::Router;

#[derive(Envconfig, Clone)]
pub struct FileConfig {
    pub path: String,

    /// Stream name to re-route a message to when a write fails. Unset means
    /// drop-and-count.
    pub fallback: Option<String>,

    #[envconfig(default = "false")]
    pub revert_stream_on_drop: bool,

    #[envconfig(nested = true)]
    pub rotation: RotationConfig,
}

struct OpenFile {
    path: PathBuf,
    file: File,
    size: u64,
}

impl BatchedWriter for OpenFile {
    fn name(&self) -> &str {
        self.path.to_str().unwrap_or("<non-utf8 path>")
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_accessible(&self) -> bool {
        self.path.exists()
    }
}

pub struct FileProducer {
    core: ProducerCore,
    streams: Vec<StreamId>,
    base_path: PathBuf,
    assembly: WriterAssembly<OpenFile>,
    sequence: AtomicU32,
}

impl FileProducer {
    pub fn new(name: impl Into<String>, streams: Vec<StreamId>, config: FileConfig) -> Self {
        let fallback_stream = config.fallback.as_deref().map(StreamId::from_name);
        let core = ProducerCore::new(name, fallback_stream)
            .with_revert_stream_on_drop(config.revert_stream_on_drop);
        Self {
            core,
            streams,
            base_path: PathBuf::from(config.path),
            assembly: WriterAssembly::new(config.rotation.to_policy()),
            sequence: AtomicU32::new(0),
        }
    }

    fn open_next(base_path: &Path, sequence: &AtomicU32) -> Result<OpenFile, String> {
        let n = sequence.fetch_add(1, Ordering::SeqCst);
        let path = if n == 0 {
            base_path.to_path_buf()
        } else {
            base_path.with_extension(format!("{n}"))
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| e.to_string())?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(OpenFile { path, file, size })
    }
}

#[async_trait]
impl Producer for FileProducer {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn configure(&mut self, router: Arc<Router>) -> Result<(), ProducerError> {
        self.core.bind_router(router);
        Ok(())
    }

    async fn control(&mut self, command: Control) -> Result<(), ProducerError> {
        if command == Control::Roll {
            let base_path = self.base_path.clone();
            let sequence = &self.sequence;
            self.assembly
                .rotate_now(|| Self::open_next(&base_path, sequence))
                .map_err(|e| ProducerError::Delivery(self.core.name().to_owned(), e.to_string()))?;
            metrics::counter!("rotations_total", "producer" => self.core.name().to_owned())
                .increment(1);
        }
        Ok(())
    }

    async fn produce(&mut self, message: Message) -> Result<(), ProducerError> {
        let base_path = self.base_path.clone();
        let sequence = &self.sequence;
        let producer_name = self.core.name().to_owned();
        let rotation_count_before = self.assembly.rotation_count();

        let writer = match self.assembly.current(|| Self::open_next(&base_path, sequence)) {
            Ok(writer) => writer,
            Err(e) => {
                let reason = e.to_string();
                self.core.drop_message(message);
                return Err(ProducerError::Delivery(producer_name, reason));
            }
        };

        if self.assembly.rotation_count() != rotation_count_before {
            metrics::counter!("rotations_total", "producer" => producer_name.clone())
                .increment(1);
        }

        let write_result = writer
            .file
            .write_all(message.payload())
            .and_then(|_| writer.file.write_all(b"\n"));

        match write_result {
            Ok(()) => {
                writer.size += message.payload().len() as u64 + 1;
                self.core.record_produced();
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.core.drop_message(message);
                Err(ProducerError::Delivery(producer_name, reason))
            }
        }
    }

    fn streams(&self) -> Vec<StreamId> {
        self.streams.clone()
    }

    async fn flush(&mut self) -> Result<(), ProducerError> {
        Ok(())
    }

    fn abandon(&self, message: Message) {
        self.core.drop_message(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_payload_lines_to_file() {
        let dir = std::env::temp_dir().join(format!("gollum-file-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.log");

        let mut producer = FileProducer::new(
            "file",
            vec![StreamId::from_name("default")],
            FileConfig {
                path: path.to_str().unwrap().to_owned(),
                fallback: None,
                revert_stream_on_drop: false,
                rotation: RotationConfig {
                    max_size_bytes: 0,
                    max_age_secs: 0,
                    at_clock_hour: None,
                    at_clock_minute: 0,
                },
            },
        );

        producer
            .produce(Message::new("line one", StreamId::from_name("default")))
            .await
            .unwrap();
        producer
            .produce(Message::new("line two", StreamId::from_name("default")))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "line one\nline two\n");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn size_rotation_creates_a_new_file() {
        let dir = std::env::temp_dir().join(format!("gollum-file-test-rot-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.log");

        let mut producer = FileProducer::new(
            "file",
            vec![StreamId::from_name("default")],
            FileConfig {
                path: path.to_str().unwrap().to_owned(),
                fallback: None,
                revert_stream_on_drop: false,
                rotation: RotationConfig {
                    max_size_bytes: 5,
                    max_age_secs: 0,
                    at_clock_hour: None,
                    at_clock_minute: 0,
                },
            },
        );

        producer
            .produce(Message::new("123456", StreamId::from_name("default")))
            .await
            .unwrap();
        producer
            .produce(Message::new("more", StreamId::from_name("default")))
            .await
            .unwrap();

        assert_eq!(producer.assembly.rotation_count(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn write_failure_routes_to_fallback_instead_of_silently_dropping() {
        use gollum_core::router::{MessageSink, Router, RouterError};
        use std::sync::Mutex;

        struct RecordingSink {
            received: Mutex<Vec<Message>>,
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

        let fallback_stream = StreamId::from_name("_DROPPED_");
        let router = Arc::new(Router::new());
        let sink = Arc::new(RecordingSink {
            received: Mutex::new(Vec::new()),
        });
        router.add_producer(fallback_stream, sink.clone());

        // A path under a directory that cannot exist routes every write to
        // the fallback stream instead of being silently discarded.
        let mut producer = FileProducer::new(
            "file",
            vec![StreamId::from_name("events")],
            FileConfig {
                path: "/nonexistent-gollum-test-dir/out.log".to_owned(),
                fallback: Some("_DROPPED_".to_owned()),
                revert_stream_on_drop: false,
                rotation: RotationConfig {
                    max_size_bytes: 0,
                    max_age_secs: 0,
                    at_clock_hour: None,
                    at_clock_minute: 0,
                },
            },
        );
        producer.configure(router).await.unwrap();

        let result = producer
            .produce(Message::new("payload", StreamId::from_name("events")))
            .await;
        assert!(result.is_err());
        assert_eq!(sink.received.lock().unwrap().len(), 1);
        assert_eq!(producer.core.dropped_count(), 1);
    }
}
