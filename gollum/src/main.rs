//! gollum: routes messages from consumers to producers by stream, with
//! batching, rotation, and a spooling overflow path.

use std::path::Path;
use std::time::Duration;

use axum::routing::get;
use axum::Router as AxumRouter;
use envconfig::Envconfig;
use std::future::ready;

use gollum::config::Config;
use gollum::coordinator::{load_topology, Coordinator};
use gollum::error::GollumBinError;
use gollum::registry::ProducerTypeRegistry;
use gollum::signals::{next_signal, SignalOutcome};
use gollum_core::StreamRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(err) = run().await {
        tracing::error!(%err, "gollum exiting with an error");
        std::process::exit(err.exit_code());
    }
}

async fn run() -> Result<(), GollumBinError> {
    let config = Config::init_from_env()
        .map_err(|e| GollumBinError::Config(e.to_string()))?;

    let topology = load_topology(Path::new(&config.topology_path))?;
    let producer_types = ProducerTypeRegistry::with_builtin_producers();

    let stream_registry = StreamRegistry::new();
    let shutdown_timeout: Duration = config.shutdown.timeout.0;
    let mut coordinator = Coordinator::new(stream_registry.clone(), shutdown_timeout);

    let producers = coordinator
        .configure(topology, &producer_types)
        .await
        .map_err(GollumBinError::Coordinator)?;
    coordinator
        .start_producers(producers)
        .await
        .map_err(GollumBinError::Coordinator)?;

    match gollum_producers::spool::replay_spooled(
        Path::new(&config.spool_path),
        &coordinator.router(),
        &stream_registry,
    ) {
        Ok(replayed) if replayed > 0 => {
            tracing::info!(replayed, "respooled messages from a prior run")
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(%err, "spool replay failed, continuing without it"),
    }

    coordinator.start_consumers();

    let health = coordinator.health_registry();
    let app = AxumRouter::new()
        .route("/_readiness", get(|| ready("ok")))
        .route("/_liveness", get(move || ready(health.get_status())))
        .merge(gollum_core::metrics::setup_metrics_router());

    let bind = config.bind();
    let http_server = tokio::spawn(async move {
        if let Err(err) = gollum_core::metrics::serve(app, &bind).await {
            tracing::error!(%err, "ambient HTTP surface exited");
        }
    });

    loop {
        match next_signal().await {
            SignalOutcome::Roll => coordinator.roll().await,
            SignalOutcome::Shutdown => break,
        }
    }

    coordinator
        .shutdown()
        .await
        .map_err(GollumBinError::Coordinator)?;
    http_server.abort();

    Ok(())
}
