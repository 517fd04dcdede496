//! Redis-backed job queues.
//!
//! Two queues share one Redis client: extraction (priority-aware, failed
//! jobs retained indefinitely as the dead-letter queue) and webhook
//! delivery (longer retry schedule, failed jobs expire after a retention
//! window). Job state lives in a per-job hash; waiting and delayed sets are
//! sorted sets whose scores encode priority-then-FIFO and promote-at time
//! respectively.

use anyhow::{Context, Result};
use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::shared::models::ChatMessage;

pub mod extraction_worker;
pub mod webhook_worker;

pub use extraction_worker::run_extraction_worker;
pub use webhook_worker::run_webhook_worker;

/// Priority multiplier keeps FIFO sequence numbers from ever outranking a
/// priority band.
const PRIORITY_BAND: f64 = 1e15;

pub const STATE_WAITING: &str = "waiting";
pub const STATE_DELAYED: &str = "delayed";
pub const STATE_ACTIVE: &str = "active";
pub const STATE_COMPLETED: &str = "completed";
pub const STATE_FAILED: &str = "failed";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: &'static str,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub keep_completed: Duration,
    /// `None` keeps failed jobs forever; they are the DLQ.
    pub keep_failed: Option<Duration>,
}

impl QueueConfig {
    pub fn extraction() -> Self {
        Self {
            name: "extraction",
            max_attempts: 3,
            backoff_base: Duration::from_secs(3),
            keep_completed: Duration::from_secs(24 * 60 * 60),
            keep_failed: None,
        }
    }

    pub fn webhook() -> Self {
        Self {
            name: "webhook",
            max_attempts: 10,
            backoff_base: Duration::from_secs(5),
            keep_completed: Duration::from_secs(24 * 60 * 60),
            keep_failed: Some(Duration::from_secs(72 * 60 * 60)),
        }
    }
}

/// Extraction job payload: a tagged union over the two extraction shapes.
/// The correlation id of the originating request travels with the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractionJob {
    SingleMessage {
        org_id: Uuid,
        correlation_id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        webhook_url: Option<String>,
    },
    ChatLog {
        org_id: Uuid,
        correlation_id: String,
        messages: Vec<ChatMessage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        webhook_url: Option<String>,
    },
}

impl ExtractionJob {
    pub fn org_id(&self) -> Uuid {
        match self {
            Self::SingleMessage { org_id, .. } | Self::ChatLog { org_id, .. } => *org_id,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::SingleMessage { correlation_id, .. } | Self::ChatLog { correlation_id, .. } => {
                correlation_id
            }
        }
    }

    pub fn webhook_url(&self) -> Option<&str> {
        match self {
            Self::SingleMessage { webhook_url, .. } | Self::ChatLog { webhook_url, .. } => {
                webhook_url.as_deref()
            }
        }
    }

    /// Single messages jump the line ahead of chat logs.
    pub fn priority(&self) -> u8 {
        match self {
            Self::SingleMessage { .. } => 1,
            Self::ChatLog { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJob {
    pub webhook_url: String,
    pub payload: Value,
    pub correlation_id: String,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub payload: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub state: String,
    pub progress: u8,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug)]
pub enum FailOutcome {
    /// Re-scheduled onto the delayed set.
    Retrying { attempt: u32, delay: Duration },
    /// Attempts exhausted; parked in the failed set.
    Dead,
}

pub struct JobQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(client: redis::Client, config: QueueConfig) -> Self {
        Self { client, config }
    }

    pub fn name(&self) -> &str {
        self.config.name
    }

    fn key(&self, suffix: &str) -> String {
        format!("queue:{}:{}", self.config.name, suffix)
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("queue:{}:job:{}", self.config.name, job_id)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .context("redis connection")
    }

    pub async fn enqueue<T: Serialize>(&self, payload: &T, priority: u8) -> Result<String> {
        let mut conn = self.connection().await?;
        let job_id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(payload)?;

        let seq: u64 = conn.incr(self.key("seq"), 1).await?;
        let score = priority as f64 * PRIORITY_BAND + seq as f64;

        let priority_field = priority.to_string();
        let created_at = Utc::now().timestamp_millis().to_string();
        let _: () = conn
            .hset_multiple(
                self.job_key(&job_id),
                &[
                    ("payload", body.as_str()),
                    ("state", STATE_WAITING),
                    ("progress", "0"),
                    ("attempts", "0"),
                    ("priority", priority_field.as_str()),
                    ("created_at", created_at.as_str()),
                ],
            )
            .await?;
        let _: () = conn.zadd(self.key("waiting"), &job_id, score).await?;

        Ok(job_id)
    }

    /// Promotes due delayed jobs, then pops the highest-priority waiting job
    /// and marks it active.
    pub async fn fetch_next(&self) -> Result<Option<Job>> {
        let mut conn = self.connection().await?;
        self.promote_due(&mut conn).await?;

        let popped: Vec<(String, f64)> = conn.zpopmin(self.key("waiting"), 1).await?;
        let Some((job_id, _)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let _: () = conn.hset(self.job_key(&job_id), "state", STATE_ACTIVE).await?;
        let _: () = conn.sadd(self.key("active"), &job_id).await?;

        let payload: Option<String> = conn.hget(self.job_key(&job_id), "payload").await?;
        let attempts: Option<u32> = conn.hget(self.job_key(&job_id), "attempts").await?;

        match payload {
            Some(payload) => Ok(Some(Job {
                id: job_id,
                payload,
                attempts: attempts.unwrap_or(0),
            })),
            // Hash expired out from under the sets; skip the orphan.
            None => Ok(None),
        }
    }

    async fn promote_due(&self, conn: &mut redis::aio::MultiplexedConnection) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore(self.key("delayed"), f64::MIN, now as f64)
            .await?;
        for job_id in due {
            let removed: u64 = conn.zrem(self.key("delayed"), &job_id).await?;
            if removed == 0 {
                continue;
            }
            let priority: Option<u8> = conn.hget(self.job_key(&job_id), "priority").await?;
            let seq: u64 = conn.incr(self.key("seq"), 1).await?;
            let score = priority.unwrap_or(1) as f64 * PRIORITY_BAND + seq as f64;
            let _: () = conn.hset(self.job_key(&job_id), "state", STATE_WAITING).await?;
            let _: () = conn.zadd(self.key("waiting"), &job_id, score).await?;
        }
        Ok(())
    }

    pub async fn progress(&self, job_id: &str, progress: u8) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .hset(self.job_key(job_id), "progress", progress.to_string())
            .await?;
        Ok(())
    }

    pub async fn complete(&self, job_id: &str, result: &Value) -> Result<()> {
        let mut conn = self.connection().await?;
        let now = Utc::now().timestamp_millis();

        let encoded = serde_json::to_string(result)?;
        let finished_at = now.to_string();
        let _: () = conn
            .hset_multiple(
                self.job_key(job_id),
                &[
                    ("state", STATE_COMPLETED),
                    ("progress", "100"),
                    ("result", encoded.as_str()),
                    ("finished_at", finished_at.as_str()),
                ],
            )
            .await?;
        let _: () = conn.srem(self.key("active"), job_id).await?;
        let _: () = conn.zadd(self.key("completed"), job_id, now as f64).await?;
        let _: () = conn
            .expire(self.job_key(job_id), self.config.keep_completed.as_secs() as i64)
            .await?;

        // Drop completed-set entries whose hashes have expired.
        let horizon = now - self.config.keep_completed.as_millis() as i64;
        let _: () = conn
            .zrembyscore(self.key("completed"), f64::MIN, horizon as f64)
            .await?;
        Ok(())
    }

    /// Records a failed attempt: re-schedules with exponential backoff while
    /// attempts remain, otherwise parks the job in the failed set.
    pub async fn fail(&self, job_id: &str, error: &str) -> Result<FailOutcome> {
        let mut conn = self.connection().await?;
        let attempt: u32 = conn.hincr(self.job_key(job_id), "attempts", 1).await?;
        let _: () = conn.hset(self.job_key(job_id), "error", error).await?;
        let _: () = conn.srem(self.key("active"), job_id).await?;

        if attempt < self.config.max_attempts {
            let delay = self.config.backoff_base * 2u32.saturating_pow(attempt - 1);
            let run_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            let _: () = conn.hset(self.job_key(job_id), "state", STATE_DELAYED).await?;
            let _: () = conn.zadd(self.key("delayed"), job_id, run_at as f64).await?;
            return Ok(FailOutcome::Retrying { attempt, delay });
        }

        let now = Utc::now().timestamp_millis();
        let failed_at = now.to_string();
        let _: () = conn
            .hset_multiple(
                self.job_key(job_id),
                &[("state", STATE_FAILED), ("failed_at", failed_at.as_str())],
            )
            .await?;
        let _: () = conn.zadd(self.key("failed"), job_id, now as f64).await?;
        if let Some(keep) = self.config.keep_failed {
            let _: () = conn
                .expire(self.job_key(job_id), keep.as_secs() as i64)
                .await?;
            let horizon = now - keep.as_millis() as i64;
            let _: () = conn
                .zrembyscore(self.key("failed"), f64::MIN, horizon as f64)
                .await?;
        }
        Ok(FailOutcome::Dead)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let mut conn = self.connection().await?;
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(self.job_key(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(status_from_fields(job_id, &fields)))
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut conn = self.connection().await?;
        Ok(QueueCounts {
            waiting: conn.zcard(self.key("waiting")).await?,
            delayed: conn.zcard(self.key("delayed")).await?,
            active: conn.scard(self.key("active")).await?,
            completed: conn.zcard(self.key("completed")).await?,
            failed: conn.zcard(self.key("failed")).await?,
        })
    }

    /// DLQ listing, newest failures first.
    pub async fn list_failed(&self, start: isize, end: isize) -> Result<Vec<JobStatus>> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn.zrevrange(self.key("failed"), start, end).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for job_id in ids {
            let fields: std::collections::HashMap<String, String> =
                conn.hgetall(self.job_key(&job_id)).await?;
            if !fields.is_empty() {
                jobs.push(status_from_fields(&job_id, &fields));
            }
        }
        Ok(jobs)
    }

    /// Re-schedules a dead job in place: same id, attempts reset, back on
    /// the waiting set. Nothing is copied.
    pub async fn retry_failed(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn.zrem(self.key("failed"), job_id).await?;
        if removed == 0 {
            return Ok(false);
        }

        let _: () = conn.persist(self.job_key(job_id)).await?;
        let _: () = conn
            .hset_multiple(
                self.job_key(job_id),
                &[("state", STATE_WAITING), ("attempts", "0"), ("progress", "0")],
            )
            .await?;
        let _: () = conn.hdel(self.job_key(job_id), "error").await?;

        let priority: Option<u8> = conn.hget(self.job_key(job_id), "priority").await?;
        let seq: u64 = conn.incr(self.key("seq"), 1).await?;
        let score = priority.unwrap_or(1) as f64 * PRIORITY_BAND + seq as f64;
        let _: () = conn.zadd(self.key("waiting"), job_id, score).await?;
        Ok(true)
    }

    pub async fn retry_all_failed(&self) -> Result<u64> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn.zrange(self.key("failed"), 0, -1).await?;
        drop(conn);
        let mut retried = 0;
        for job_id in ids {
            if self.retry_failed(&job_id).await? {
                retried += 1;
            }
        }
        Ok(retried)
    }
}

fn status_from_fields(
    job_id: &str,
    fields: &std::collections::HashMap<String, String>,
) -> JobStatus {
    JobStatus {
        job_id: job_id.to_string(),
        state: fields
            .get("state")
            .cloned()
            .unwrap_or_else(|| STATE_WAITING.to_string()),
        progress: fields
            .get("progress")
            .and_then(|p| p.parse().ok())
            .unwrap_or(0),
        attempts: fields
            .get("attempts")
            .and_then(|a| a.parse().ok())
            .unwrap_or(0),
        result: fields
            .get("result")
            .and_then(|r| serde_json::from_str(r).ok()),
        error: fields.get("error").cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extraction_job_round_trips_through_discriminator() {
        let job = ExtractionJob::ChatLog {
            org_id: Uuid::new_v4(),
            correlation_id: "corr-1".into(),
            messages: vec![ChatMessage {
                sender: "Rahul".into(),
                text: "5 kg rice".into(),
            }],
            webhook_url: Some("https://example.com/hook".into()),
        };
        let encoded = serde_json::to_value(&job).unwrap();
        assert_eq!(encoded["type"], "chat_log");

        let decoded: ExtractionJob = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.priority(), 2);
        assert_eq!(decoded.correlation_id(), "corr-1");
        assert_eq!(decoded.webhook_url(), Some("https://example.com/hook"));
    }

    #[test]
    fn single_message_outranks_chat() {
        let single = ExtractionJob::SingleMessage {
            org_id: Uuid::new_v4(),
            correlation_id: "c".into(),
            message: "2 kg dal".into(),
            webhook_url: None,
        };
        assert!(single.priority() < 2);
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let result = serde_json::from_value::<ExtractionJob>(json!({
            "type": "bulk_import",
            "org_id": Uuid::new_v4(),
            "correlation_id": "c"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn queue_presets_match_retention_policy() {
        let extraction = QueueConfig::extraction();
        assert_eq!(extraction.max_attempts, 3);
        assert_eq!(extraction.backoff_base, Duration::from_secs(3));
        assert!(extraction.keep_failed.is_none());

        let webhook = QueueConfig::webhook();
        assert_eq!(webhook.max_attempts, 10);
        assert_eq!(webhook.backoff_base, Duration::from_secs(5));
        assert_eq!(webhook.keep_failed, Some(Duration::from_secs(72 * 60 * 60)));
    }

    #[test]
    fn status_parsing_tolerates_partial_hashes() {
        let mut fields = std::collections::HashMap::new();
        fields.insert("state".to_string(), "active".to_string());
        let status = status_from_fields("job-1", &fields);
        assert_eq!(status.state, "active");
        assert_eq!(status.progress, 0);
        assert_eq!(status.result, None);
    }
}
