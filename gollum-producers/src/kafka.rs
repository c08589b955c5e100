//! The Kafka-like batched network producer: a Batched-flavor sink that
//! accumulates messages in a [`MessageBatch`] and flushes them as a single
//! round of async sends against an `rdkafka` `FutureProducer`, tracking
//! per-stream topic resolution and connection health.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use envconfig::Envconfig;
use gollum_core::batch::{BatchError, MessageBatch, PushOutcome};
use gollum_core::config::EnvMsDuration;
use gollum_core::health_state::ConnectionHealth;
use gollum_core::mapping::{StreamMapping, TopicHandle};
use gollum_core::message::{Message, StreamId};
use gollum_core::producer::{Control, ControlLoopFlavor, Producer, ProducerCore, ProducerError};
use gollum_core::router::Router;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tokio::task::JoinSet;
use tracing::{error, warn};

/// Parses the `topics` config value: `stream:topic;stream:topic` pairs
/// giving an explicit stream-name-to-topic override. `envconfig` has no
/// native map type, so this is the wire format for one.
fn parse_explicit_topics(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| pair.split_once(':'))
        .map(|(stream, topic)| (stream.trim().to_owned(), topic.trim().to_owned()))
        .filter(|(stream, topic)| !stream.is_empty() && !topic.is_empty())
        .collect()
}

/// Partition selection strategy for a message with no partition of its own.
/// `random` and `hash` are delegated to librdkafka's own partitioner;
/// `round_robin` is tracked here because librdkafka has no built-in
/// round-robin producer partitioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioner {
    Random,
    RoundRobin,
    Hash,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsePartitionerError;

impl std::str::FromStr for Partitioner {
    type Err = ParsePartitionerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Partitioner::Random),
            "round_robin" | "round-robin" => Ok(Partitioner::RoundRobin),
            "hash" => Ok(Partitioner::Hash),
            _ => Err(ParsePartitionerError),
        }
    }
}

/// Looks up a topic's current partition count via a blocking metadata
/// fetch; the caller is responsible for keeping this off the async
/// executor (see `KafkaProducer::next_round_robin_partition`).
fn partition_count(producer: &FutureProducer, topic: &str, timeout: Duration) -> Result<i32, String> {
    let metadata = producer
        .client()
        .fetch_metadata(Some(topic), Timeout::After(timeout))
        .map_err(|e| e.to_string())?;
    metadata
        .topics()
        .first()
        .map(|t| t.partitions().len() as i32)
        .filter(|&n| n > 0)
        .ok_or_else(|| format!("topic {topic} reported no partitions"))
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    pub hosts: String,

    /// Default topic used when no per-stream mapping is configured;
    /// real deployments typically override this by naming the stream
    /// after the desired topic and letting the identity mapping apply.
    pub default_topic: String,

    /// Explicit `stream:topic;stream:topic` overrides, checked before the
    /// wildcard topic and the stream-name-verbatim fallback.
    pub topics: Option<String>,

    /// Topic used for every stream that has no explicit override, checked
    /// before falling back to the stream's own name.
    pub wildcard_topic: Option<String>,

    /// How often, while the connection is down, a send is allowed through
    /// anyway as a liveness probe.
    #[envconfig(default = "10000")]
    pub dial_timeout_ms: EnvMsDuration,

    /// Stream name to re-route a message to when delivery fails and no
    /// further recovery is defined. Unset means drop-and-count.
    pub fallback: Option<String>,

    #[envconfig(default = "false")]
    pub revert_stream_on_drop: bool,

    /// A zero-length payload is dropped (counted, not delivered) unless
    /// this is set.
    #[envconfig(default = "false")]
    pub allow_nil_value: bool,

    #[envconfig(default = "0")]
    pub linger_ms: u64,

    #[envconfig(default = "30000")]
    pub message_timeout_ms: EnvMsDuration,

    /// Guards against the client library blocking on a full internal queue;
    /// a send that doesn't resolve within this window is treated as failed
    /// and the message goes to fallback instead.
    #[envconfig(default = "5000")]
    pub grace_timeout_ms: EnvMsDuration,

    #[envconfig(default = "none")]
    pub compression_codec: String,

    /// `random`, `round_robin`, or `hash` (keys off the `key_from` metadata
    /// field when present).
    #[envconfig(default = "random")]
    pub partitioner: Partitioner,

    /// Passed straight through to librdkafka's `request.required.acks`:
    /// `0` (fire-and-forget), `1` (leader only), or `-1` (full ISR).
    #[envconfig(default = "-1")]
    pub required_acks: String,

    #[envconfig(nested = true)]
    pub batch: gollum_core::config::BatchConfig,
}

/// Distinguishes a permanent, single-message problem from one that
/// implicates the broker connection as a whole.
enum SendFailure {
    Payload(String),
    Connection(String),
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendFailure::Payload(reason) | SendFailure::Connection(reason) => {
                write!(f, "{reason}")
            }
        }
    }
}

pub struct KafkaProducer {
    core: ProducerCore,
    streams: Vec<StreamId>,
    producer: FutureProducer,
    mapping: StreamMapping<Box<dyn Fn(StreamId) -> TopicHandle + Send + Sync>>,
    batch: MessageBatch,
    flush_count: usize,
    max_linger: Duration,
    grace_timeout: Duration,
    allow_nil_value: bool,
    health: ConnectionHealth,
    dial_timeout: Duration,
    last_attempt: Option<Instant>,
    partitioner: Partitioner,
    round_robin_counts: Mutex<HashMap<String, (i32, u32)>>,
}

impl KafkaProducer {
    pub fn new(
        name: impl Into<String>,
        streams: Vec<StreamId>,
        config: KafkaConfig,
        registry: gollum_core::StreamRegistry,
    ) -> Result<Self, ProducerError> {
        let name = name.into();
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.message_timeout_ms.0.as_millis().to_string(),
            )
            .set("compression.codec", &config.compression_codec)
            .set("request.required.acks", &config.required_acks)
            .set(
                "partitioner",
                match config.partitioner {
                    Partitioner::Random => "random",
                    Partitioner::Hash => "consistent_random",
                    // Round-robin partition assignment is done explicitly per
                    // message (see `next_round_robin_partition`); librdkafka's
                    // own partitioner is never consulted for it.
                    Partitioner::RoundRobin => "random",
                },
            );

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| ProducerError::Configure(name.clone(), e.to_string()))?;

        let default_topic = config.default_topic.clone();
        let explicit_topics = parse_explicit_topics(config.topics.as_deref().unwrap_or_default());
        let wildcard_topic = config.wildcard_topic.clone();
        // Explicit override -> wildcard topic -> the stream's own name ->
        // default_topic as the last resort.
        let mapping: StreamMapping<Box<dyn Fn(StreamId) -> TopicHandle + Send + Sync>> =
            StreamMapping::new(Box::new(move |stream_id| {
                let stream_name = registry.name_of(stream_id);
                if let Some(topic) = stream_name
                    .as_deref()
                    .and_then(|name| explicit_topics.get(name))
                {
                    return TopicHandle::new(topic.clone());
                }
                if let Some(topic) = &wildcard_topic {
                    return TopicHandle::new(topic.clone());
                }
                stream_name
                    .map(TopicHandle::new)
                    .unwrap_or_else(|| TopicHandle::new(default_topic.clone()))
            }));

        let fallback_stream = config.fallback.as_deref().map(StreamId::from_name);
        let core = ProducerCore::new(name, fallback_stream)
            .with_revert_stream_on_drop(config.revert_stream_on_drop);

        let mut health = ConnectionHealth::new();
        // A successful NewClient+NewProducer counts as the first successful
        // connect; without this the connection would start `down` and never
        // get a chance to attempt its first real send.
        health.record_success();

        Ok(Self {
            core,
            streams,
            producer,
            mapping,
            batch: MessageBatch::new(config.batch.max_count),
            flush_count: config.batch.flush_count,
            max_linger: config.batch.max_linger.0,
            grace_timeout: config.grace_timeout_ms.0,
            allow_nil_value: config.allow_nil_value,
            health,
            dial_timeout: config.dial_timeout_ms.0,
            last_attempt: None,
            partitioner: config.partitioner,
            round_robin_counts: Mutex::new(HashMap::new()),
        })
    }

    /// Assigns the next partition for `topic` under round-robin, fetching
    /// and caching its partition count on first use. Returns `None` (let
    /// librdkafka pick) if the metadata fetch fails.
    async fn next_round_robin_partition(&self, topic: &str) -> Option<i32> {
        {
            let mut counts = self.round_robin_counts.lock().unwrap();
            if let Some((count, next)) = counts.get_mut(topic) {
                let partition = (*next as i32) % (*count).max(1);
                *next = next.wrapping_add(1);
                return Some(partition);
            }
        }

        let producer = self.producer.clone();
        let topic_owned = topic.to_owned();
        let timeout = self.grace_timeout;
        let count = tokio::task::spawn_blocking(move || partition_count(&producer, &topic_owned, timeout))
            .await
            .ok()
            .and_then(Result::ok)?;

        let mut counts = self.round_robin_counts.lock().unwrap();
        let entry = counts.entry(topic.to_owned()).or_insert((count, 0));
        let partition = (entry.1 as i32) % entry.0.max(1);
        entry.1 = entry.1.wrapping_add(1);
        Some(partition)
    }

    /// Read by the coordinator when wiring this producer into
    /// `control_loop::batch_message_loop`.
    pub fn max_linger(&self) -> Duration {
        self.max_linger
    }

    /// A send failure is either a permanent, single-message payload problem
    /// (too large for the broker to accept — retrying or reconnecting can
    /// never fix it) or a fault that implicates the connection itself. Only
    /// the latter should flip [`ConnectionHealth`] down: a too-large message
    /// must drop without triggering a reconnect.
    async fn send_one(
        producer: &FutureProducer,
        topic: &str,
        partition: Option<i32>,
        message: &Message,
        grace_timeout: Duration,
    ) -> Result<(), SendFailure> {
        let key = message.metadata_value("key_from").map(|b| b.to_vec());
        let record = FutureRecord {
            topic,
            payload: Some(message.payload().as_ref()),
            partition,
            key: key.as_deref(),
            timestamp: None,
            headers: None,
        };
        match tokio::time::timeout(grace_timeout, producer.send(record, Duration::from_secs(0))).await {
            Err(_) => Err(SendFailure::Connection(format!(
                "send to topic {topic} did not resolve within grace_timeout"
            ))),
            Ok(Ok(_)) => Ok(()),
            Ok(Err((err, _))) => match err.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => Err(SendFailure::Payload(format!(
                    "message too large for topic {topic}"
                ))),
                _ => Err(SendFailure::Connection(format!("kafka produce error: {err}"))),
            },
        }
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn control_loop_flavor(&self) -> ControlLoopFlavor {
        ControlLoopFlavor::Batched(self.max_linger)
    }

    async fn configure(&mut self, router: Arc<Router>) -> Result<(), ProducerError> {
        self.core.bind_router(router);
        Ok(())
    }

    async fn control(&mut self, _command: Control) -> Result<(), ProducerError> {
        // `Control::Stop` never reaches here: the batch control loop
        // intercepts it directly and calls `flush` itself after draining the
        // input channel. Kafka has no rotation concept, so `Roll` is a no-op.
        Ok(())
    }

    fn abandon(&self, message: Message) {
        self.core.drop_message(message);
    }

    async fn produce(&mut self, message: Message) -> Result<(), ProducerError> {
        if message.payload().is_empty() && !self.allow_nil_value {
            self.core.drop_message(message);
            return Ok(());
        }

        match self.batch.push(message, self.flush_count) {
            Ok(PushOutcome::ShouldFlush) => self.flush().await,
            Ok(PushOutcome::Accepted) => Ok(()),
            Err(BatchError::Full(_)) => {
                self.flush().await?;
                // The caller handed us one message; after draining the full
                // batch there is always room, so this cannot recurse.
                Ok(())
            }
        }
    }

    fn streams(&self) -> Vec<StreamId> {
        self.streams.clone()
    }

    async fn flush(&mut self) -> Result<(), ProducerError> {
        let drained = self.batch.swap();
        if drained.is_empty() {
            return Ok(());
        }

        let name = self.core.name().to_owned();

        // While down, only let a send through once per dial_timeout as a
        // liveness probe; otherwise the whole drained batch goes straight to
        // fallback without touching the broker.
        if !self.health.is_up() {
            let due = match self.last_attempt {
                None => true,
                Some(at) => at.elapsed() >= self.dial_timeout,
            };
            if !due {
                let count = drained.len() as u64;
                for message in drained {
                    self.core.drop_message(message);
                }
                return Err(ProducerError::Delivery(
                    name,
                    format!("connection down, dropped {count} message(s) before the next heartbeat"),
                ));
            }
        }
        self.last_attempt = Some(Instant::now());

        let grace_timeout = self.grace_timeout;
        let mut set = JoinSet::new();
        for message in drained {
            let topic = self.mapping.resolve(message.stream_id()).name;
            let partition = match self.partitioner {
                Partitioner::RoundRobin => self.next_round_robin_partition(&topic).await,
                Partitioner::Random | Partitioner::Hash => None,
            };
            let producer = self.producer.clone();
            set.spawn(async move {
                let result = Self::send_one(&producer, &topic, partition, &message, grace_timeout).await;
                (message, result)
            });
        }

        let mut failures = 0u64;
        let mut connection_faulted = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => self.core.record_produced(),
                Ok((message, Err(reason))) => {
                    warn!(producer = name.as_str(), %reason, "kafka delivery failed");
                    if matches!(reason, SendFailure::Connection(_)) {
                        connection_faulted = true;
                    }
                    self.core.drop_message(message);
                    failures += 1;
                }
                Err(join_err) => {
                    error!(producer = name.as_str(), %join_err, "kafka ack task panicked");
                    connection_faulted = true;
                    failures += 1;
                }
            }
        }

        if connection_faulted {
            self.health.record_failure();
        } else {
            self.health.record_success();
        }

        if failures == 0 {
            Ok(())
        } else {
            Err(ProducerError::Delivery(
                name,
                format!("{failures} message(s) failed to deliver"),
            ))
        }
    }
}

impl KafkaProducer {
    pub fn connection_is_up(&self) -> bool {
        self.health.is_up()
    }
}
