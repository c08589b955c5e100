//! The Socket producer: a Ticker-flavor sink that writes to a TCP, UDP, or
//! Unix-domain endpoint, flushing whatever has accumulated on a fixed
//! interval rather than per message, and tracking connection health so a
//! dead endpoint fails fast into the fallback path instead of blocking on
//! every write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use gollum_core::config::EnvMsDuration;
use gollum_core::health_state::ConnectionHealth;
use gollum_core::message::{Message, StreamId};
use gollum_core::producer::{Control, ControlLoopFlavor, Producer, ProducerCore, ProducerError};
use gollum_core::router::Router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, UnixStream};

const DEFAULT_PORT: u16 = 5880;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Tcp,
    Udp,
    Unix,
}

impl Protocol {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            "unix" => Some(Protocol::Unix),
            _ => None,
        }
    }
}

/// The result of parsing the `address` config value: `proto://host:port`,
/// with `:5880` assumed when the port is omitted (tcp/udp only). A `unix`
/// address names a socket path instead of a host/port pair.
#[derive(Debug, Clone)]
struct Endpoint {
    protocol: Protocol,
    target: String,
}

fn parse_address(address: &str) -> Result<Endpoint, String> {
    let (proto_raw, rest) = address
        .split_once("://")
        .ok_or_else(|| format!("address {address} is missing a proto:// prefix"))?;
    let protocol = Protocol::parse(proto_raw)
        .ok_or_else(|| format!("unsupported socket protocol {proto_raw}"))?;

    let target = match protocol {
        Protocol::Unix => rest.to_owned(),
        Protocol::Tcp | Protocol::Udp => {
            if rest.contains(':') {
                rest.to_owned()
            } else {
                format!("{rest}:{DEFAULT_PORT}")
            }
        }
    };

    Ok(Endpoint { protocol, target })
}

#[derive(Envconfig, Clone)]
pub struct SocketConfig {
    pub address: String,

    #[envconfig(default = "1000")]
    pub tick_interval: EnvMsDuration,

    /// Stream name to re-route a message to when delivery fails and no
    /// further recovery is defined. Unset means drop-and-count.
    pub fallback: Option<String>,

    #[envconfig(default = "false")]
    pub revert_stream_on_drop: bool,

    /// Forces the tcp protocol and, after each write, waits up to
    /// `ack_timeout` for this exact byte sequence to come back before the
    /// write is considered delivered.
    pub acknowledge: Option<String>,

    #[envconfig(default = "1000")]
    pub ack_timeout_ms: EnvMsDuration,

    /// Messages per write: `pending` is chunked into groups of this size,
    /// each chunk concatenated (newline-joined) into a single write with one
    /// ack read per chunk, rather than one write per message.
    #[envconfig(default = "1")]
    pub flush_count: usize,
}

enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Unix(UnixStream),
}

pub struct SocketProducer {
    core: ProducerCore,
    streams: Vec<StreamId>,
    endpoint: Endpoint,
    tick_interval: Duration,
    acknowledge: Option<Vec<u8>>,
    ack_timeout: Duration,
    connection: Option<Connection>,
    health: ConnectionHealth,
    pending: Vec<Message>,
    flush_count: usize,
}

impl SocketProducer {
    pub fn new(
        name: impl Into<String>,
        streams: Vec<StreamId>,
        config: SocketConfig,
    ) -> Result<Self, ProducerError> {
        let name = name.into();
        let endpoint = parse_address(&config.address)
            .map_err(|e| ProducerError::Configure(name.clone(), e))?;

        if config.acknowledge.is_some() && endpoint.protocol != Protocol::Tcp {
            return Err(ProducerError::Configure(
                name,
                "acknowledge requires the tcp protocol".to_owned(),
            ));
        }

        let fallback_stream = config.fallback.as_deref().map(StreamId::from_name);
        let core = ProducerCore::new(name, fallback_stream)
            .with_revert_stream_on_drop(config.revert_stream_on_drop);

        Ok(Self {
            core,
            streams,
            endpoint,
            tick_interval: config.tick_interval.0,
            acknowledge: config.acknowledge.map(|s| s.into_bytes()),
            ack_timeout: config.ack_timeout_ms.0,
            connection: None,
            health: ConnectionHealth::new(),
            pending: Vec::new(),
            flush_count: config.flush_count.max(1),
        })
    }

    /// Read by the coordinator when wiring this producer into
    /// `control_loop::ticker_message_control_loop`.
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    async fn ensure_connected(&mut self) -> std::io::Result<&mut Connection> {
        if self.connection.is_none() {
            let connection = match self.endpoint.protocol {
                Protocol::Tcp => Connection::Tcp(TcpStream::connect(&self.endpoint.target).await?),
                Protocol::Unix => Connection::Unix(UnixStream::connect(&self.endpoint.target).await?),
                Protocol::Udp => {
                    let socket = UdpSocket::bind("0.0.0.0:0").await?;
                    socket.connect(&self.endpoint.target).await?;
                    Connection::Udp(socket)
                }
            };
            self.connection = Some(connection);
        }
        Ok(self.connection.as_mut().expect("just set above"))
    }

    async fn write_and_acknowledge(
        connection: &mut Connection,
        payload: &[u8],
        acknowledge: Option<&[u8]>,
        ack_timeout: Duration,
    ) -> std::io::Result<()> {
        match connection {
            Connection::Tcp(stream) => {
                stream.write_all(payload).await?;
                stream.write_all(b"\n").await?;
                stream.flush().await?;
                if let Some(expected) = acknowledge {
                    let mut buf = vec![0u8; expected.len().max(1)];
                    let read = tokio::time::timeout(ack_timeout, stream.read(&mut buf))
                        .await
                        .map_err(|_| {
                            std::io::Error::new(std::io::ErrorKind::TimedOut, "ack_timeout elapsed")
                        })??;
                    if &buf[..read] != expected {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "unexpected acknowledgement",
                        ));
                    }
                }
            }
            Connection::Unix(stream) => {
                stream.write_all(payload).await?;
                stream.write_all(b"\n").await?;
                stream.flush().await?;
            }
            Connection::Udp(socket) => {
                socket.send(payload).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Producer for SocketProducer {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn control_loop_flavor(&self) -> ControlLoopFlavor {
        ControlLoopFlavor::Ticker(self.tick_interval)
    }

    async fn configure(&mut self, router: Arc<Router>) -> Result<(), ProducerError> {
        self.core.bind_router(router);
        Ok(())
    }

    async fn control(&mut self, command: Control) -> Result<(), ProducerError> {
        match command {
            Control::Roll => {
                // A fresh connection on roll, same as a rotating writer.
                self.connection = None;
                self.flush().await
            }
            // `Control::Stop` never reaches here: the ticker control loop
            // intercepts it directly and calls `flush` itself after draining
            // the input channel.
            Control::Stop | Control::FuseActive | Control::FuseBurn => Ok(()),
        }
    }

    async fn produce(&mut self, message: Message) -> Result<(), ProducerError> {
        self.pending.push(message);
        Ok(())
    }

    fn streams(&self) -> Vec<StreamId> {
        self.streams.clone()
    }

    async fn flush(&mut self) -> Result<(), ProducerError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let pending = std::mem::take(&mut self.pending);
        let acknowledge = self.acknowledge.clone();
        let ack_timeout = self.ack_timeout;

        let connection = match self.ensure_connected().await {
            Ok(connection) => connection,
            Err(e) => {
                self.health.record_failure();
                self.connection = None;
                let name = self.core.name().to_owned();
                for message in pending {
                    self.core.drop_message(message);
                }
                return Err(ProducerError::Delivery(name, e.to_string()));
            }
        };

        let mut delivered = 0usize;
        let mut first_failure = None;
        let mut failed_at = pending.len();
        for chunk in pending.chunks(self.flush_count) {
            let mut payload = Vec::new();
            for (i, message) in chunk.iter().enumerate() {
                if i > 0 {
                    payload.push(b'\n');
                }
                payload.extend_from_slice(message.payload());
            }

            match Self::write_and_acknowledge(
                connection,
                &payload,
                acknowledge.as_deref(),
                ack_timeout,
            )
            .await
            {
                Ok(()) => delivered += chunk.len(),
                Err(e) => {
                    first_failure = Some(e.to_string());
                    failed_at = delivered;
                    break;
                }
            }
        }

        if let Some(reason) = first_failure {
            self.health.record_failure();
            self.connection = None;
            let name = self.core.name().to_owned();
            for message in pending.into_iter().skip(failed_at) {
                self.core.drop_message(message);
            }
            self.core.record_produced_n(delivered as u64);
            Err(ProducerError::Delivery(name, reason))
        } else {
            self.health.record_success();
            self.core.record_produced_n(delivered as u64);
            Ok(())
        }
    }

    fn abandon(&self, message: Message) {
        self.core.drop_message(message);
    }
}
