//! The coordinator drives gollum through its lifecycle:
//! `configure -> start_producers -> start_consumers -> running ->
//! stop_consumers -> stop_producers -> stopped`.
//!
//! This binary's scope stops at producers; "start/stop_consumers" is kept
//! as an explicit, currently-empty phase so a future consumer subsystem has
//! a well-defined place to plug into the same shutdown ordering (consumers
//! stop taking in new work before producers are allowed to drain and exit).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gollum_core::error::CoordinatorError;
use gollum_core::message::StreamId;
use gollum_core::producer::{Control, ControlLoopFlavor, Producer};
use gollum_core::router::Router;
use gollum_core::StreamRegistry;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::registry::{declare_streams, ProducerDef, ProducerTypeRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Configuring,
    StartingProducers,
    StartingConsumers,
    Running,
    StoppingConsumers,
    StoppingProducers,
    Stopped,
}

#[derive(Deserialize)]
pub struct TopologyEntry {
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: String,
    pub streams: Vec<String>,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Deserialize)]
pub struct Topology {
    pub producers: Vec<TopologyEntry>,
}

pub fn load_topology(path: &Path) -> Result<Topology, CoordinatorError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CoordinatorError::Configure(format!("reading {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| CoordinatorError::Configure(format!("parsing {}: {e}", path.display())))
}

struct RunningProducer {
    name: String,
    control_tx: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

pub struct Coordinator {
    state: CoordinatorState,
    router: Arc<Router>,
    stream_registry: StreamRegistry,
    health: health::HealthRegistry,
    producers: Vec<RunningProducer>,
    shutdown_timeout: Duration,
}

impl Coordinator {
    pub fn new(stream_registry: StreamRegistry, shutdown_timeout: Duration) -> Self {
        Self {
            state: CoordinatorState::Configuring,
            router: Arc::new(Router::new()),
            stream_registry,
            health: health::HealthRegistry::new("gollum"),
            producers: Vec::new(),
            shutdown_timeout,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    pub fn health_registry(&self) -> health::HealthRegistry {
        self.health.clone()
    }

    /// `configure` phase: constructs every producer from the topology,
    /// declares its stream interest, and attaches wildcard producers.
    pub async fn configure(
        &mut self,
        topology: Topology,
        producer_registry: &ProducerTypeRegistry,
    ) -> Result<Vec<Box<dyn Producer>>, CoordinatorError> {
        self.state = CoordinatorState::Configuring;

        let mut built = Vec::new();
        for entry in topology.producers {
            let streams = entry
                .streams
                .iter()
                .map(|name| {
                    if name == "*" {
                        StreamId::WILDCARD
                    } else {
                        self.stream_registry.register(name)
                    }
                })
                .collect();

            let def = ProducerDef {
                type_name: entry.type_name,
                producer_name: entry.name,
                streams,
                options: entry.options,
            };
            match producer_registry.construct(&def, &self.stream_registry) {
                Ok(producer) => built.push(producer),
                Err(e) => warn!(
                    producer = def.producer_name.as_str(),
                    type_name = def.type_name.as_str(),
                    error = %e,
                    "producer failed to construct, skipping it and continuing to configure the rest of the topology"
                ),
            }
        }

        declare_streams(&built, &self.router);
        self.router.attach_wildcards()?;

        Ok(built)
    }

    /// `start_producers` phase: spawns one control-loop task per producer
    /// and wires its input channel into the router.
    pub async fn start_producers(
        &mut self,
        mut producers: Vec<Box<dyn Producer>>,
    ) -> Result<(), CoordinatorError> {
        self.state = CoordinatorState::StartingProducers;

        for mut producer in producers.drain(..) {
            let name = producer.name().to_owned();
            producer
                .configure(self.router.clone())
                .await
                .map_err(|e| CoordinatorError::ProducerStartFailed(name.clone(), e.to_string()))?;

            let streams = producer.streams();
            let (message_tx, message_rx) = mpsc::channel(1024);
            let (control_tx, control_rx) = mpsc::channel(8);

            let handle = gollum_core::ProducerHandle::new(name.clone(), message_tx.clone());
            let sink: Arc<dyn gollum_core::MessageSink> = Arc::new(handle);
            for stream_id in streams {
                self.router.add_producer(stream_id, sink.clone());
            }

            let health_handle = self
                .health
                .register(format!("producer:{name}"), time::Duration::seconds(30))
                .await;

            let task = match producer.control_loop_flavor() {
                ControlLoopFlavor::Direct => tokio::spawn(gollum_core::control_loop::message_control_loop(
                    producer,
                    message_rx,
                    control_rx,
                    health_handle,
                )),
                ControlLoopFlavor::Ticker(tick) => {
                    tokio::spawn(gollum_core::control_loop::ticker_message_control_loop(
                        producer,
                        message_rx,
                        control_rx,
                        health_handle,
                        tick,
                    ))
                }
                ControlLoopFlavor::Batched(max_linger) => {
                    tokio::spawn(gollum_core::control_loop::batch_message_loop(
                        producer,
                        message_rx,
                        control_rx,
                        health_handle,
                        max_linger,
                    ))
                }
            };

            self.producers.push(RunningProducer {
                name,
                control_tx,
                task,
            });
        }

        Ok(())
    }

    /// `start_consumers` phase: a no-op placeholder, see module docs.
    pub fn start_consumers(&mut self) {
        self.state = CoordinatorState::StartingConsumers;
        self.state = CoordinatorState::Running;
    }

    /// Broadcasts `Control::Roll` to every running producer (SIGHUP).
    pub async fn roll(&self) {
        for producer in &self.producers {
            if producer.control_tx.send(Control::Roll).await.is_err() {
                warn!(producer = producer.name.as_str(), "roll command dropped, producer already gone");
            }
        }
    }

    /// `stop_consumers -> stop_producers -> stopped`: asks every producer
    /// to stop, then waits up to `shutdown_timeout` for all tasks to exit.
    pub async fn shutdown(mut self) -> Result<(), CoordinatorError> {
        self.state = CoordinatorState::StoppingConsumers;
        self.state = CoordinatorState::StoppingProducers;

        for producer in &self.producers {
            let _ = producer.control_tx.send(Control::Stop).await;
        }

        let deadline = tokio::time::sleep(self.shutdown_timeout);
        tokio::pin!(deadline);

        for producer in self.producers.drain(..) {
            tokio::select! {
                result = producer.task => {
                    if let Err(join_err) = result {
                        warn!(producer = producer.name.as_str(), %join_err, "producer task panicked during shutdown");
                    }
                }
                _ = &mut deadline => {
                    warn!("shutdown timed out waiting for producers to drain");
                    self.state = CoordinatorState::Stopped;
                    return Err(CoordinatorError::ShutdownTimedOut);
                }
            }
        }

        self.state = CoordinatorState::Stopped;
        info!("all producers stopped cleanly");
        Ok(())
    }
}
