use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use rand::Rng;
use tracing::warn;

use scribe_core::context::LlmContext;
use scribe_core::errors::GatewayError;
use scribe_core::provider::{EventStream, LlmProvider, StreamOptions};
use scribe_core::stream::StreamEvent;

#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the backoff added or removed at random.
    pub jitter_factor: f64,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
            jitter_factor: 0.2,
        }
    }
}

/// Retries retryable provider failures with exponential backoff and jitter.
///
/// A failure is retried only while nothing has reached the caller: either the
/// `stream()` call itself failed, or the stream errored before its first
/// content event. Once content was yielded the stream is committed.
pub struct ReliableProvider {
    inner: Arc<dyn LlmProvider>,
    config: ReliableConfig,
    total_retries: AtomicU64,
}

impl ReliableProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay.min(self.config.max_delay);
        }
        let exp = self.config.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = exp.min(self.config.max_delay.as_millis() as f64);
        let spread = capped * self.config.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Open a stream and pull events up to the first content-bearing one.
    async fn open(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let mut inner = self.inner.stream(context, options).await?;
        let mut head = Vec::new();
        while let Some(event) = inner.next().await {
            match event {
                StreamEvent::Error { error } => return Err(error),
                StreamEvent::Start | StreamEvent::Retry { .. } => head.push(event),
                other => {
                    head.push(other);
                    return Ok(Box::pin(stream::iter(head).chain(inner)));
                }
            }
        }
        Ok(Box::pin(stream::iter(head)))
    }
}

#[async_trait]
impl LlmProvider for ReliableProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let mut attempt = 0;
        loop {
            match self.open(context, options).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        provider = self.inner.name(),
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying provider call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
