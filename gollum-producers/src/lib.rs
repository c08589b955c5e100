//! Concrete producer implementations: Null, Console, File, Socket, the
//! Kafka-like batched network producer, and Spooling.

pub mod console;
pub mod file;
pub mod kafka;
pub mod null;
pub mod socket;
pub mod spool;

pub use console::{ConsoleConfig, ConsoleProducer};
pub use file::{FileConfig, FileProducer};
pub use kafka::{KafkaConfig, KafkaProducer};
pub use null::NullProducer;
pub use socket::{SocketConfig, SocketProducer};
pub use spool::{replay_spooled, SpoolConfig, SpoolProducer};
