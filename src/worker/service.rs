//! Worker service connected to the pub/sub broker

use super::handlers::Handlers;
use super::writer::BatchWriter;
use crate::config::EngineConfig;
use crate::error::JobFailure;
use crate::pubsub::{Incoming, IncomingRequest, PubsubClient};
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

/// Wait between connection attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Serve requests on the configured channels until interrupted, reconnecting
/// whenever the broker goes away
pub async fn serve(config: &EngineConfig, db_path: PathBuf, name: &str) -> Result<()> {
    let writer = BatchWriter::spawn(
        &db_path,
        config.worker.flush_max_age(),
        config.worker.flush_idle(),
    )
    .context("Failed to start database writer")?;
    let writer = Arc::new(writer);
    let handlers = Arc::new(Handlers::new(
        db_path,
        writer.clone(),
        config.highlight.clone(),
    ));
    let parallel = config.worker.parallel_requests.max(1);
    let slots = Arc::new(Semaphore::new(parallel));

    info!(
        name,
        address = %config.pubsub.address,
        parallel,
        channels = ?config.worker.channels,
        "Worker starting"
    );

    loop {
        match PubsubClient::connect(
            &config.pubsub.address,
            name,
            parallel,
            config.pubsub.request_timeout(),
        )
        .await
        {
            Ok((client, incoming)) => {
                let client = Arc::new(client);
                for channel in &config.worker.channels {
                    client.subscribe(channel, None)?;
                }
                info!("Connected to broker");

                tokio::select! {
                    _ = serve_requests(client, incoming, handlers.clone(), slots.clone()) => {
                        warn!("Lost connection to broker");
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            Err(e) => warn!(error = %e, "Failed to connect to broker"),
        }

        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Worker stopping");
    drop(handlers);
    if let Ok(writer) = Arc::try_unwrap(writer) {
        writer.shutdown();
    }
    Ok(())
}

async fn serve_requests(
    client: Arc<PubsubClient>,
    mut incoming: mpsc::UnboundedReceiver<Incoming>,
    handlers: Arc<Handlers>,
    slots: Arc<Semaphore>,
) {
    while let Some(record) = incoming.recv().await {
        let request = match record {
            Incoming::Request(request) => request,
            Incoming::Message(message) => {
                debug!(channel = %message.channel, "Ignoring published message");
                continue;
            }
        };
        let Ok(permit) = slots.clone().acquire_owned().await else {
            return;
        };
        if client.delivered(request.request_id).is_err() {
            return;
        }

        let client = client.clone();
        let handlers = handlers.clone();
        tokio::spawn(async move {
            let IncomingRequest {
                request_id,
                channel,
                payload,
            } = request;
            let result = handle_guarded(handlers, channel.clone(), payload).await;
            if let Err(failure) = &result {
                warn!(channel = %channel, request_id, error = %failure, "Request failed");
            }
            let _ = client.respond(request_id, result.map_err(|f| f.to_wire()));
            drop(permit);
        });
    }
}

/// Run a handler in its own task so a panic becomes an internal failure
pub(crate) async fn handle_guarded(
    handlers: Arc<Handlers>,
    channel: String,
    payload: Value,
) -> Result<Value, JobFailure> {
    match tokio::spawn(async move { handlers.handle(&channel, payload).await }).await {
        Ok(result) => result,
        Err(e) => Err(JobFailure::internal(format!("Handler task failed: {}", e))),
    }
}
