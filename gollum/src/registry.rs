//! An explicit, string-keyed registry of producer constructors.
//!
//! Rather than discover producer types through reflection, every type this
//! binary knows how to build is registered by name up front; an unknown
//! `type` in the daemon's configuration is a `ConfigError`, not a silent
//! no-op.

use std::collections::HashMap;
use std::sync::Arc;

use envconfig::Envconfig;
use gollum_core::error::ConfigError;
use gollum_core::message::StreamId;
use gollum_core::producer::Producer;
use gollum_core::router::Router;
use gollum_core::StreamRegistry;
use gollum_producers::{
    ConsoleConfig, ConsoleProducer, FileConfig, FileProducer, KafkaConfig, KafkaProducer,
    NullProducer, SocketConfig, SocketProducer, SpoolConfig, SpoolProducer,
};

/// The fully-resolved definition of one producer instance, independent of
/// which concrete type it is. `options` carries the raw key/value pairs a
/// constructor parses with its own `envconfig::Envconfig` struct.
pub struct ProducerDef {
    pub type_name: String,
    pub producer_name: String,
    pub streams: Vec<StreamId>,
    pub options: HashMap<String, String>,
}

type Constructor =
    Box<dyn Fn(&ProducerDef, &StreamRegistry) -> Result<Box<dyn Producer>, ConfigError> + Send + Sync>;

pub struct ProducerTypeRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ProducerTypeRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        type_name: &str,
        constructor: impl Fn(&ProducerDef, &StreamRegistry) -> Result<Box<dyn Producer>, ConfigError>
            + Send
            + Sync
            + 'static,
    ) {
        self.constructors
            .insert(type_name.to_owned(), Box::new(constructor));
    }

    pub fn construct(
        &self,
        def: &ProducerDef,
        registry: &StreamRegistry,
    ) -> Result<Box<dyn Producer>, ConfigError> {
        let constructor = self
            .constructors
            .get(&def.type_name)
            .ok_or_else(|| ConfigError::UnknownProducerType(def.type_name.clone()))?;
        constructor(def, registry)
    }
}

impl Default for ProducerTypeRegistry {
    fn default() -> Self {
        Self::with_builtin_producers()
    }
}

fn parse_options<C: Envconfig>(def: &ProducerDef) -> Result<C, ConfigError> {
    C::init_from_hashmap(&def.options).map_err(|e| ConfigError::InvalidValue {
        field: def.type_name.clone(),
        reason: e.to_string(),
    })
}

impl ProducerTypeRegistry {
    pub fn with_builtin_producers() -> Self {
        let mut registry = Self::new();

        registry.register("null", |def, _streams| {
            Ok(Box::new(NullProducer::new(
                def.producer_name.clone(),
                def.streams.clone(),
            )))
        });

        registry.register("console", |def, _streams| {
            let config: ConsoleConfig = parse_options(def)?;
            Ok(Box::new(ConsoleProducer::new(
                def.producer_name.clone(),
                def.streams.clone(),
                config,
            )))
        });

        registry.register("file", |def, _streams| {
            let config: FileConfig = parse_options(def)?;
            Ok(Box::new(FileProducer::new(
                def.producer_name.clone(),
                def.streams.clone(),
                config,
            )))
        });

        registry.register("socket", |def, _streams| {
            let config: SocketConfig = parse_options(def)?;
            let producer = SocketProducer::new(def.producer_name.clone(), def.streams.clone(), config)
                .map_err(|e| ConfigError::InvalidValue {
                    field: "socket".to_owned(),
                    reason: e.to_string(),
                })?;
            Ok(Box::new(producer) as Box<dyn Producer>)
        });

        registry.register("kafka", |def, stream_registry| {
            let config: KafkaConfig = parse_options(def)?;
            let producer = KafkaProducer::new(
                def.producer_name.clone(),
                def.streams.clone(),
                config,
                stream_registry.clone(),
            )
            .map_err(|e| ConfigError::InvalidValue {
                field: "kafka".to_owned(),
                reason: e.to_string(),
            })?;
            Ok(Box::new(producer) as Box<dyn Producer>)
        });

        registry.register("spool", |def, stream_registry| {
            let config: SpoolConfig = parse_options(def)?;
            Ok(Box::new(SpoolProducer::new(
                def.producer_name.clone(),
                def.streams.clone(),
                config,
                stream_registry.clone(),
            )))
        });

        registry
    }
}

/// Declares every producer's stream interest against `router` before any
/// producer starts running, so wildcard attachment later sees a complete
/// picture.
pub fn declare_streams(producers: &[Box<dyn Producer>], router: &Arc<Router>) {
    for producer in producers {
        for stream_id in producer.streams() {
            router.ensure_stream(stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_a_config_error() {
        let registry = ProducerTypeRegistry::with_builtin_producers();
        let def = ProducerDef {
            type_name: "not-a-real-type".to_owned(),
            producer_name: "p".to_owned(),
            streams: vec![],
            options: HashMap::new(),
        };
        let err = registry
            .construct(&def, &StreamRegistry::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProducerType(_)));
    }

    #[test]
    fn null_producer_constructs_with_no_options() {
        let registry = ProducerTypeRegistry::with_builtin_producers();
        let def = ProducerDef {
            type_name: "null".to_owned(),
            producer_name: "sink".to_owned(),
            streams: vec![StreamId::WILDCARD],
            options: HashMap::new(),
        };
        let producer = registry.construct(&def, &StreamRegistry::new()).unwrap();
        assert_eq!(producer.name(), "sink");
    }

    #[test]
    fn console_producer_parses_its_options() {
        let registry = ProducerTypeRegistry::with_builtin_producers();
        let mut options = HashMap::new();
        options.insert("BUFFER_LINES".to_owned(), "16".to_owned());
        let def = ProducerDef {
            type_name: "console".to_owned(),
            producer_name: "console".to_owned(),
            streams: vec![StreamId::from_name("default")],
            options,
        };
        let producer = registry.construct(&def, &StreamRegistry::new()).unwrap();
        assert_eq!(producer.name(), "console");
    }
}
