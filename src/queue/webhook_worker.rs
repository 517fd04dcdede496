//! Webhook delivery worker.
//!
//! Posts queued payloads with the originating correlation id in the
//! `X-Correlation-Id` header. A non-2xx response or transport error counts
//! as a failed attempt and goes back through the queue's backoff schedule.

use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{info_span, Instrument};

use super::{Job, WebhookJob};
use crate::security::CORRELATION_ID_HEADER;
use crate::shared::state::AppState;

const CONCURRENCY: usize = 5;
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    std::future::pending::<()>().await;
}

pub async fn run_webhook_worker(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let semaphore = Arc::new(Semaphore::new(CONCURRENCY));
    let client = match reqwest::Client::builder().timeout(DELIVERY_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            warn!("webhook worker failed to build http client: {err}");
            return;
        }
    };

    info!("webhook worker started (concurrency {CONCURRENCY})");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match state.webhook_queue.fetch_next().await {
            Ok(Some(job)) => {
                let state = Arc::clone(&state);
                let client = client.clone();
                tokio::spawn(async move {
                    deliver(state, client, job).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
            Err(err) => {
                drop(permit);
                warn!("webhook queue fetch failed: {err}");
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }

    let _ = semaphore.acquire_many(CONCURRENCY as u32).await;
    info!("webhook worker drained");
}

async fn deliver(state: Arc<AppState>, client: reqwest::Client, job: Job) {
    let payload: WebhookJob = match serde_json::from_str(&job.payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("webhook job {} has undecodable payload: {err}", job.id);
            let _ = state
                .webhook_queue
                .fail(&job.id, &format!("payload decode: {err}"))
                .await;
            return;
        }
    };

    let span = info_span!(
        "webhook_delivery",
        job_id = %job.id,
        correlation_id = %payload.correlation_id
    );

    async {
        let result = client
            .post(&payload.webhook_url)
            .header(CORRELATION_ID_HEADER, &payload.correlation_id)
            .json(&payload.payload)
            .send()
            .await;

        let outcome = match result {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("webhook returned {}", response.status())),
            Err(err) => Err(format!("webhook request failed: {err}")),
        };

        match outcome {
            Ok(()) => {
                info!("webhook delivered to {}", payload.webhook_url);
                let _ = state
                    .webhook_queue
                    .complete(&job.id, &serde_json::json!({"delivered": true}))
                    .await;
            }
            Err(err) => {
                warn!("webhook delivery to {} failed: {err}", payload.webhook_url);
                let _ = state.webhook_queue.fail(&job.id, &err).await;
            }
        }
    }
    .instrument(span)
    .await;
}
