//! Extraction worker: drains the extraction queue through the LLM client
//! and storage, reporting progress and handing deliveries to the webhook
//! queue.
//!
//! Concurrency is capped at three jobs; a direct rate limiter holds the
//! fleet to the LLM vendor's per-minute quota independently of any tenant
//! limit. On shutdown the loop stops fetching and waits for in-flight jobs
//! to finish.

use governor::{Quota, RateLimiter};
use log::{error, info, warn};
use serde_json::json;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{info_span, Instrument};

use super::{ExtractionJob, FailOutcome, Job, WebhookJob};
use crate::llm::CancelSignal;
use crate::shared::models::ExtractionType;
use crate::shared::state::AppState;
use crate::storage::mapping::new_order_from_extraction;

const CONCURRENCY: usize = 3;
const JOBS_PER_MINUTE: u32 = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

type VendorLimiter = governor::DefaultDirectRateLimiter;

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

pub async fn run_extraction_worker(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let semaphore = Arc::new(Semaphore::new(CONCURRENCY));
    let limiter: Arc<VendorLimiter> = Arc::new(RateLimiter::direct(Quota::per_minute(
        NonZeroU32::new(JOBS_PER_MINUTE).expect("nonzero quota"),
    )));

    info!(
        "extraction worker started (concurrency {CONCURRENCY}, {JOBS_PER_MINUTE} jobs/min)"
    );

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

        match state.extraction_queue.fetch_next().await {
            Ok(Some(job)) => {
                let state = Arc::clone(&state);
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    process_job(state, limiter, job).await;
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
                warn!("extraction queue fetch failed: {err}");
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }

    // Drain: once every permit is reacquired, no job is still in flight.
    let _ = semaphore.acquire_many(CONCURRENCY as u32).await;
    info!("extraction worker drained");
}

async fn process_job(state: Arc<AppState>, limiter: Arc<VendorLimiter>, job: Job) {
    let payload: ExtractionJob = match serde_json::from_str(&job.payload) {
        Ok(payload) => payload,
        Err(err) => {
            error!("extraction job {} has undecodable payload: {err}", job.id);
            let _ = state
                .extraction_queue
                .fail(&job.id, &format!("payload decode: {err}"))
                .await;
            return;
        }
    };

    // Re-establish the originating request's correlation id for every log
    // line and nested webhook job this execution produces.
    let span = info_span!(
        "extraction_job",
        job_id = %job.id,
        correlation_id = %payload.correlation_id()
    );

    async {
        match run_extraction(&state, &limiter, &job, &payload).await {
            Ok(order_id) => {
                info!("extraction job {} completed with order {order_id}", job.id);
            }
            Err(err) => {
                warn!("extraction job {} attempt failed: {err}", job.id);
                match state.extraction_queue.fail(&job.id, &err).await {
                    Ok(FailOutcome::Retrying { attempt, delay }) => {
                        info!(
                            "extraction job {} re-scheduled (attempt {attempt}) in {delay:?}",
                            job.id
                        );
                    }
                    Ok(FailOutcome::Dead) => {
                        enqueue_failure_webhook(&state, &job.id, &payload, &err).await;
                    }
                    Err(queue_err) => {
                        error!("failed to record failure for job {}: {queue_err}", job.id);
                    }
                }
            }
        }
    }
    .instrument(span)
    .await;
}

async fn run_extraction(
    state: &AppState,
    limiter: &VendorLimiter,
    job: &Job,
    payload: &ExtractionJob,
) -> Result<uuid::Uuid, String> {
    let queue = &state.extraction_queue;
    let _ = queue.progress(&job.id, 10).await;

    limiter.until_ready().await;

    let (extracted, extraction_type, raw_messages, fallback_customer) = match payload {
        ExtractionJob::SingleMessage { message, .. } => {
            let extracted = state
                .llm
                .extract_single(message, CancelSignal::none())
                .await
                .map_err(|e| e.to_string())?;
            (
                extracted,
                ExtractionType::SingleMessage,
                json!([message]),
                None,
            )
        }
        ExtractionJob::ChatLog { messages, .. } => {
            let extracted = state
                .llm
                .extract_chat(messages, CancelSignal::none())
                .await
                .map_err(|e| e.to_string())?;
            let fallback = messages.first().map(|m| m.sender.clone());
            (
                extracted,
                ExtractionType::ChatLog,
                serde_json::to_value(messages).unwrap_or_default(),
                fallback,
            )
        }
    };

    let _ = queue.progress(&job.id, 70).await;

    let new_order =
        new_order_from_extraction(extraction_type, &extracted, raw_messages, fallback_customer);
    let org_id = payload.org_id();
    let record = match extraction_type {
        ExtractionType::SingleMessage => state.store.add_order(org_id, new_order).await,
        ExtractionType::ChatLog => state.store.add_chat_order(org_id, new_order).await,
    }
    .map_err(|e| e.to_string())?;

    let _ = queue.progress(&job.id, 90).await;

    // Delivery goes through the webhook queue; a delivery failure must never
    // fail the extraction.
    if let Some(webhook_url) = payload.webhook_url() {
        let delivery = WebhookJob {
            webhook_url: webhook_url.to_string(),
            payload: json!({
                "jobId": job.id,
                "status": "completed",
                "orderId": record.id,
                "order": record,
            }),
            correlation_id: payload.correlation_id().to_string(),
        };
        if let Err(err) = state.webhook_queue.enqueue(&delivery, 1).await {
            warn!("failed to enqueue success webhook for job {}: {err}", job.id);
        }
    }

    queue
        .complete(&job.id, &json!({"orderId": record.id, "status": "completed"}))
        .await
        .map_err(|e| e.to_string())?;

    Ok(record.id)
}

/// Permanent failures notify the caller's webhook with the error message.
async fn enqueue_failure_webhook(
    state: &AppState,
    job_id: &str,
    payload: &ExtractionJob,
    error: &str,
) {
    let Some(webhook_url) = payload.webhook_url() else {
        return;
    };
    let delivery = WebhookJob {
        webhook_url: webhook_url.to_string(),
        payload: json!({
            "jobId": job_id,
            "status": "failed",
            "error": error,
        }),
        correlation_id: payload.correlation_id().to_string(),
    };
    if let Err(err) = state.webhook_queue.enqueue(&delivery, 1).await {
        warn!("failed to enqueue failure webhook for job {job_id}: {err}");
    }
}
