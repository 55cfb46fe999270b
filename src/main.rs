//! Tracker service: consume the live feed until Ctrl-C.
//!
//! Configuration comes from the environment (`FEED_URL`, `RM_API`,
//! `TRACKER_CONFIG`, ...), see [`TrackerConfig::from_env`].

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;

use shuttle_tracker::{
    Collaborators, FeedConsumer, HttpLaneClassifier, HttpLapEventSink, Result, TrackerConfig,
    TrackerEngine,
};

fn collaborators(config: &TrackerConfig) -> Result<Collaborators> {
    let mut collaborators = Collaborators::in_memory();
    let timeout = config.collaborator_timeout();

    if let Some(url) = &config.classifier_url {
        let classifier = HttpLaneClassifier::new(url, timeout)?;
        info!("[Tracker] Lane classifier at {}", classifier.endpoint());
        collaborators = collaborators.with_classifier(Arc::new(classifier));
    }
    if let Some(url) = &config.lap_event_url {
        info!("[Tracker] Lap events pushed to {}", url);
        collaborators = collaborators.with_event_sink(Arc::new(HttpLapEventSink::new(url, timeout)?));
    }
    Ok(collaborators)
}

async fn run(config: TrackerConfig) -> Result<()> {
    let feed = FeedConsumer::new(config.feed.clone());
    let engine = TrackerEngine::campus(config.clone(), collaborators(&config)?)?;

    if let Err(e) = engine.bootstrap().await {
        warn!("[Tracker] Bootstrap failed, starting empty: {}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("[Tracker] Shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    let ticker = engine.spawn_interpolation_ticker(shutdown_rx.clone());
    feed.run(
        |payload| {
            // malformed payloads are logged by the engine
            let _ = engine.ingest_message(payload);
        },
        shutdown_rx,
    )
    .await;

    if let Err(e) = ticker.await {
        warn!("[Tracker] Ticker task failed: {}", e);
    }
    engine.flush_collaborators().await;

    let stats = engine.stats();
    info!(
        "[Tracker] Processed {} fixes from {} messages ({} malformed), {} laps completed",
        stats.fixes, stats.messages, stats.malformed_messages, stats.laps_completed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match TrackerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("[Tracker] Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[Tracker] {}", e);
            ExitCode::FAILURE
        }
    }
}
