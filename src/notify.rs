//! Outbound alert notification
//!
//! Emitted alerts are joined into one message and handed to an [`AlertSink`]
//! no more often than the configured interval. The transport behind the sink
//! (mail relay, webhook, ...) lives outside this crate; the default sink
//! writes to the log.

use crate::alerts::Alert;
use crate::config::AlertsConfig;
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Header of the startup failure notification
pub const STARTUP_FAILURE_HEADER: &str = "Startup self-test failures:";

/// Destination for alert notifications
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<()>;
}

/// Writes notifications to the log
pub struct LogSink {
    logger: StructuredLogger,
}

impl Default for LogSink {
    fn default() -> Self {
        Self {
            logger: get_logger("notify"),
        }
    }
}

#[async_trait]
impl AlertSink for LogSink {
    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        self.logger
            .warn(&format!("{}: {}", subject, body.replace('\n', "; ")));
        Ok(())
    }
}

/// Keeps every notification in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(subject, body)` pairs in send order
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

/// Rate-limited front end to an [`AlertSink`]
pub struct RateLimitedNotifier {
    sink: Arc<dyn AlertSink>,
    subject: String,
    interval: Duration,
    last_sent: Option<Instant>,
    logger: StructuredLogger,
}

impl RateLimitedNotifier {
    pub fn new(sink: Arc<dyn AlertSink>, config: &AlertsConfig) -> Self {
        Self {
            sink,
            subject: config.subject.clone(),
            interval: Duration::from_secs(config.notify_interval_secs),
            last_sent: None,
            logger: get_logger("notify"),
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.last_sent
            .is_none_or(|last| now.duration_since(last) >= self.interval)
    }

    /// Send `body` unless a notification went out within the interval
    ///
    /// Returns whether the sink accepted the message.
    pub async fn notify(&mut self, body: &str) -> bool {
        let now = Instant::now();
        if !self.due(now) {
            self.logger.debug("Notification suppressed by rate limit");
            return false;
        }
        match self.sink.send(&self.subject, body).await {
            Ok(()) => {
                self.last_sent = Some(now);
                true
            }
            Err(e) => {
                self.logger
                    .error(&format!("Failed to send notification: {}", e));
                false
            }
        }
    }

    /// One message listing every alert
    pub async fn notify_alerts(&mut self, alerts: &[Alert]) -> bool {
        if alerts.is_empty() {
            return false;
        }
        let body = alerts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        self.notify(&body).await
    }

    pub async fn notify_startup_failures(&mut self, failures: &[String]) -> bool {
        if failures.is_empty() {
            return false;
        }
        let body = format!("{}\n{}", STARTUP_FAILURE_HEADER, failures.join("\n"));
        self.notify(&body).await
    }
}
