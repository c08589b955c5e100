//! Core data model and runtime primitives shared by every gollum producer:
//! the message and stream-id types, the router, the double-buffered batch,
//! rotation policy, connection health, stream→target mapping, the fallback
//! discipline, the producer contract, and the control loops that drive it.

pub mod assembly;
pub mod batch;
pub mod config;
pub mod control_loop;
pub mod error;
pub mod fallback;
pub mod health_state;
pub mod mapping;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod rotation;
pub mod router;

pub use error::GollumError;
pub use message::{Message, StreamId, StreamRegistry};
pub use producer::{Control, Producer, ProducerCore, ProducerError, ProducerHandle};
pub use router::{MessageSink, Router, RouterError};
