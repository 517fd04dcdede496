//! Structured order extraction against the LLM vendor.
//!
//! The model is treated as an unreliable remote: every call is forced to a
//! single tool invocation, the returned payload is coerced to the schema,
//! and transport failures are retried with backoff.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::shared::error::ApiError;
use crate::shared::models::ChatMessage;

pub mod anthropic;
pub mod coerce;
pub mod prompt;

pub use anthropic::AnthropicExtractor;

#[derive(Debug)]
pub enum ExtractError {
    /// The vendor rejected the request (4xx other than 429); not retried.
    UpstreamBadRequest(String),
    /// The vendor stayed unreachable or kept failing after all retries.
    Unavailable(String),
    /// The response carried no tool-use block matching the schema.
    Malformed(String),
    Cancelled,
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamBadRequest(msg) => write!(f, "llm rejected request: {msg}"),
            Self::Unavailable(msg) => write!(f, "llm unavailable: {msg}"),
            Self::Malformed(msg) => write!(f, "llm response malformed: {msg}"),
            Self::Cancelled => write!(f, "llm call cancelled"),
        }
    }
}

impl std::error::Error for ExtractError {}

impl From<ExtractError> for ApiError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::UpstreamBadRequest(msg) => ApiError::UpstreamBadRequest(msg),
            ExtractError::Unavailable(msg) => ApiError::UpstreamUnavailable(msg),
            ExtractError::Malformed(msg) => ApiError::ExtractionMalformed(msg),
            ExtractError::Cancelled => ApiError::Internal(anyhow::anyhow!("extraction cancelled")),
        }
    }
}

/// Cancellation handle passed into every extraction call. Wraps the shutdown
/// watch channel so callers hand over a value, not an ambient thread-local.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Option<watch::Receiver<bool>>);

impl CancelSignal {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn from_watch(rx: watch::Receiver<bool>) -> Self {
        Self(Some(rx))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves when cancellation fires; pends forever for `none()`.
    pub async fn cancelled(&mut self) {
        match &mut self.0 {
            Some(rx) => {
                if *rx.borrow() {
                    return;
                }
                while rx.changed().await.is_ok() {
                    if *rx.borrow() {
                        return;
                    }
                }
                // Sender dropped without signalling; treat as never-cancel.
                std::future::pending::<()>().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub product_name: String,
    pub quantity: f64,
    pub unit: Option<String>,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionConfidence {
    /// Chat-log extractions report a level: high, medium or low.
    Level(String),
    /// Single-message extractions report a score in [0, 1].
    Score(f64),
}

#[derive(Debug, Clone)]
pub struct ExtractedOrder {
    pub customer_name: Option<String>,
    pub items: Vec<ExtractedItem>,
    pub delivery_address: Option<String>,
    pub delivery_date: Option<String>,
    pub notes: Option<String>,
    pub total_amount: Option<f64>,
    pub confidence: ExtractionConfidence,
    /// Verbatim tool payload, persisted as the audit copy.
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait OrderExtractor: Send + Sync {
    async fn extract_single(
        &self,
        message: &str,
        cancel: CancelSignal,
    ) -> Result<ExtractedOrder, ExtractError>;

    async fn extract_chat(
        &self,
        messages: &[ChatMessage],
        cancel: CancelSignal,
    ) -> Result<ExtractedOrder, ExtractError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_signal_none_never_fires() {
        let mut signal = CancelSignal::none();
        assert!(!signal.is_cancelled());
        let timed = tokio::time::timeout(std::time::Duration::from_millis(20), signal.cancelled());
        assert!(timed.await.is_err());
    }

    #[tokio::test]
    async fn cancel_signal_observes_watch() {
        let (tx, rx) = watch::channel(false);
        let mut signal = CancelSignal::from_watch(rx);
        assert!(!signal.is_cancelled());
        tx.send(true).unwrap();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }
}
