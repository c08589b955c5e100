//! The Spooling producer: the last-resort overflow path. Writes messages to
//! length-prefixed segment files on disk, one directory per stream, so they
//! survive a restart even if every other producer is down. A separate
//! reader task tails those segments and replays their messages back through
//! the router once it's called.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use gollum_core::assembly::WriterAssembly;
use gollum_core::config::RotationConfig;
use gollum_core::message::{Message, StreamId};
use gollum_core::producer::{Control, Producer, ProducerCore, ProducerError};
use gollum_core::rotation::BatchedWriter;
use gollum_core::router::Router;
use gollum_core::StreamRegistry;
use std::sync::Arc;
use tracing::warn;

#[derive(Envconfig, Clone)]
pub struct SpoolConfig {
    pub path: String,

    /// Upper bound on how fast the respool reader re-routes spooled
    /// messages once replay runs; 0 means unbounded.
    #[envconfig(default = "0")]
    pub max_messages_sec: u32,

    #[envconfig(nested = true)]
    pub rotation: RotationConfig,
}

struct SpoolSegment {
    path: PathBuf,
    file: File,
    size: u64,
}

impl BatchedWriter for SpoolSegment {
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

struct StreamSpool {
    assembly: WriterAssembly<SpoolSegment>,
    sequence: u32,
}

pub struct SpoolProducer {
    core: ProducerCore,
    streams: Vec<StreamId>,
    base_path: PathBuf,
    registry: StreamRegistry,
    rotation: RotationConfig,
    per_stream: HashMap<StreamId, StreamSpool>,
}

/// Serializes a full [`Message`] (payload, metadata, both stream ids, and
/// creation time) so a respool reader can reconstruct it well enough to
/// re-route it to its origin stream after a restart.
fn write_frame(file: &mut File, message: &Message) -> std::io::Result<u64> {
    let mut buf = Vec::with_capacity(32 + message.payload().len());

    buf.extend_from_slice(&(message.payload().len() as u32).to_le_bytes());
    buf.extend_from_slice(message.payload());

    buf.extend_from_slice(&message.stream_id().as_u64().to_le_bytes());
    match message.prev_stream_id() {
        Some(prev) => {
            buf.push(1);
            buf.extend_from_slice(&prev.as_u64().to_le_bytes());
        }
        None => buf.push(0),
    }

    let metadata = message.metadata();
    let count = metadata.map(|m| m.len()).unwrap_or(0) as u32;
    buf.extend_from_slice(&count.to_le_bytes());
    if let Some(metadata) = metadata {
        for (key, value) in metadata {
            buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
            buf.extend_from_slice(value);
        }
    }

    buf.extend_from_slice(&message.created_at().timestamp_millis().to_le_bytes());

    let frame_len = buf.len() as u64;
    let outer_len = (buf.len() as u32).to_le_bytes();
    file.write_all(&outer_len)?;
    file.write_all(&buf)?;
    Ok(4 + frame_len)
}

impl SpoolProducer {
    pub fn new(
        name: impl Into<String>,
        streams: Vec<StreamId>,
        config: SpoolConfig,
        registry: StreamRegistry,
    ) -> Self {
        Self {
            core: ProducerCore::new(name, None),
            streams,
            base_path: PathBuf::from(config.path),
            registry,
            rotation: config.rotation,
            per_stream: HashMap::new(),
        }
    }

    fn stream_dir(&self, stream_id: StreamId) -> PathBuf {
        let name = self
            .registry
            .name_of(stream_id)
            .unwrap_or_else(|| format!("{:016x}", stream_id.as_u64()));
        self.base_path.join(name)
    }

    fn open_next_segment(dir: &Path, sequence: u32) -> Result<SpoolSegment, String> {
        fs::create_dir_all(dir).map_err(|e| e.to_string())?;
        let path = dir.join(format!("{sequence:08}.spl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| e.to_string())?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(SpoolSegment { path, file, size })
    }
}

#[async_trait]
impl Producer for SpoolProducer {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn configure(&mut self, _router: Arc<Router>) -> Result<(), ProducerError> {
        Ok(())
    }

    async fn control(&mut self, command: Control) -> Result<(), ProducerError> {
        if command == Control::Roll {
            for (stream_id, spool) in self.per_stream.iter_mut() {
                let dir = self.registry.name_of(*stream_id).map(|name| self.base_path.join(name));
                if let Some(dir) = dir {
                    spool.sequence += 1;
                    let sequence = spool.sequence;
                    spool
                        .assembly
                        .rotate_now(|| Self::open_next_segment(&dir, sequence))
                        .map_err(|e| ProducerError::Delivery(self.core.name().to_owned(), e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    async fn produce(&mut self, message: Message) -> Result<(), ProducerError> {
        let stream_id = message.stream_id();
        let dir = self.stream_dir(stream_id);
        let producer_name = self.core.name().to_owned();
        let policy = self.rotation.to_policy();

        let entry = self.per_stream.entry(stream_id).or_insert_with(|| StreamSpool {
            assembly: WriterAssembly::new(policy),
            sequence: 0,
        });

        let rotation_before = entry.assembly.rotation_count();
        let sequence = entry.sequence;
        let segment = entry
            .assembly
            .current(|| Self::open_next_segment(&dir, sequence))
            .map_err(|e| ProducerError::Delivery(producer_name.clone(), e.to_string()))?;
        if entry.assembly.rotation_count() != rotation_before {
            entry.sequence += 1;
        }

        let written = write_frame(&mut segment.file, &message)
            .map_err(|e| ProducerError::Delivery(producer_name.clone(), e.to_string()))?;
        segment.size += written;

        self.core.record_produced();
        Ok(())
    }

    fn streams(&self) -> Vec<StreamId> {
        self.streams.clone()
    }

    fn abandon(&self, message: Message) {
        // `abandon` is synchronous and spooling a segment requires &mut
        // self, so a message abandoned mid-drain just counts as discarded
        // rather than being written to disk.
        self.core.drop_message(message);
    }
}

/// Reads every spooled segment under `base_path` and re-routes the messages
/// it contains. A segment that reads cleanly to EOF is renamed to
/// `<name>.spl.done`; a segment that errors partway through (truncated
/// frame, I/O error) is renamed whole to `<name>.spl.failed` rather than
/// re-routing only the prefix that parsed — partial replay from a corrupt
/// segment risks silently duplicating or losing messages, and the failed
/// file is left for an operator to inspect.
pub fn replay_spooled(base_path: &Path, router: &Router, registry: &StreamRegistry) -> std::io::Result<usize> {
    replay_spooled_rate_limited(base_path, router, registry, 0)
}

/// As [`replay_spooled`], but paces replay to at most `max_messages_sec`
/// re-routed messages per second (0 means unbounded). This is the respool
/// reader's `max_messages_sec` bound.
pub fn replay_spooled_rate_limited(
    base_path: &Path,
    router: &Router,
    registry: &StreamRegistry,
    max_messages_sec: u32,
) -> std::io::Result<usize> {
    let mut replayed = 0;
    if !base_path.exists() {
        return Ok(0);
    }

    let pace = if max_messages_sec > 0 {
        Some(Duration::from_secs_f64(1.0 / max_messages_sec as f64))
    } else {
        None
    };

    for stream_dir in fs::read_dir(base_path)? {
        let stream_dir = stream_dir?.path();
        if !stream_dir.is_dir() {
            continue;
        }
        let stream_name = stream_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_owned();
        // Registering the directory's own stream name keeps the registry
        // populated even if every frame in it already carries its own ids.
        registry.register(&stream_name);

        let mut entries: Vec<_> = fs::read_dir(&stream_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("spl"))
            .collect();
        entries.sort();

        for segment_path in entries {
            match replay_segment(&segment_path, router, pace) {
                Ok(count) => {
                    replayed += count;
                    let done_path = segment_path.with_extension("spl.done");
                    let _ = fs::rename(&segment_path, done_path);
                }
                Err(err) => {
                    warn!(path = %segment_path.display(), %err, "spool segment failed to replay, quarantining");
                    let failed_path = segment_path.with_extension("spl.failed");
                    let _ = fs::rename(&segment_path, failed_path);
                }
            }
        }
    }

    Ok(replayed)
}

/// Deserializes one frame written by [`write_frame`]: payload, stream ids,
/// metadata, and creation time.
fn decode_frame(buf: &[u8]) -> Option<Message> {
    let mut cursor = 0usize;
    let read_u32 = |buf: &[u8], cursor: &mut usize| -> Option<u32> {
        let bytes = buf.get(*cursor..*cursor + 4)?;
        *cursor += 4;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    };
    let read_u64 = |buf: &[u8], cursor: &mut usize| -> Option<u64> {
        let bytes = buf.get(*cursor..*cursor + 8)?;
        *cursor += 8;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    };

    let payload_len = read_u32(buf, &mut cursor)? as usize;
    let payload = buf.get(cursor..cursor + payload_len)?.to_vec();
    cursor += payload_len;

    let stream_id = StreamId::from_raw(read_u64(buf, &mut cursor)?);
    let has_prev = *buf.get(cursor)?;
    cursor += 1;
    let prev_stream_id = if has_prev == 1 {
        Some(StreamId::from_raw(read_u64(buf, &mut cursor)?))
    } else {
        None
    };

    let metadata_count = read_u32(buf, &mut cursor)?;
    let mut metadata = HashMap::new();
    for _ in 0..metadata_count {
        let key_len = read_u32(buf, &mut cursor)? as usize;
        let key = String::from_utf8(buf.get(cursor..cursor + key_len)?.to_vec()).ok()?;
        cursor += key_len;
        let val_len = read_u32(buf, &mut cursor)? as usize;
        let value = buf.get(cursor..cursor + val_len)?.to_vec();
        cursor += val_len;
        metadata.insert(key, value);
    }

    let created_at_millis = i64::from_le_bytes(buf.get(cursor..cursor + 8)?.try_into().ok()?);
    let created_at = chrono::DateTime::from_timestamp_millis(created_at_millis)?;

    // Respool always re-routes to the message's origin: the stream it was on
    // before whatever fallback spooled it, or (lacking that) the stream it
    // was spooled from directly.
    let mut message = Message::new(payload, prev_stream_id.unwrap_or(stream_id));
    message.set_created_at(created_at);
    for (key, value) in metadata {
        message.set_metadata(key, value);
    }
    Some(message)
}

fn replay_segment(path: &Path, router: &Router, pace: Option<Duration>) -> std::io::Result<usize> {
    let mut file = File::open(path)?;
    let mut count = 0;
    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut frame = vec![0u8; len];
        file.read_exact(&mut frame)?;

        let message = decode_frame(&frame).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed spool frame")
        })?;
        let _ = router.route(message);
        count += 1;

        if let Some(pace) = pace {
            std::thread::sleep(pace);
        }
    }
    Ok(count)
}
