//! Temperature acquisition over the Modbus RTU-over-TCP gateway
//!
//! One request per cycle reads every channel. Connect, send, settle, read and
//! decode failures all count as a failed attempt; exhausted retries surface as
//! [`BmsError::Acquisition`].

use crate::config::TemperatureConfig;
use crate::error::{BmsError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::modbus::{build_read_query, decode_response};
use crate::retry::{Backoff, RetryPolicy, with_retries};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Receive buffer bound
const RESPONSE_BUFFER_LEN: usize = 1024;

/// Source of scaled per-channel temperatures
#[async_trait]
pub trait TemperatureSource: Send + Sync {
    /// Read `channels` consecutive registers, scaled, in channel order
    async fn read(&self, channels: u16, policy: RetryPolicy) -> Result<Vec<f64>>;

    /// Human-readable endpoint for log and error context
    fn endpoint(&self) -> String;
}

/// TCP client for the temperature gateway
pub struct TemperatureLink {
    endpoint: String,
    scaling_factor: f64,
    query_delay: Duration,
    io_timeout: Duration,
    logger: StructuredLogger,
}

impl TemperatureLink {
    pub fn new(config: &TemperatureConfig) -> Self {
        Self {
            endpoint: config.endpoint(),
            scaling_factor: config.scaling_factor,
            query_delay: config.query_delay(),
            io_timeout: config.io_timeout(),
            logger: get_logger("temperature"),
        }
    }

    /// Retry policy for a full read, from configuration
    pub const fn policy(config: &TemperatureConfig) -> RetryPolicy {
        RetryPolicy::new(
            config.max_retries,
            Backoff::Exponential {
                base: config.retry_backoff_base,
            },
        )
    }

    async fn read_once(&self, channels: u16) -> Result<Vec<f64>> {
        let connect = TcpStream::connect(self.endpoint.as_str());
        let mut stream = match timeout(self.io_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(BmsError::network(format!(
                    "connect to {} failed: {}",
                    self.endpoint, e
                )));
            }
            Err(_) => {
                return Err(BmsError::timeout(format!(
                    "connect to {} timed out",
                    self.endpoint
                )));
            }
        };

        let query = build_read_query(channels);
        self.logger.trace(&format!(
            "Sending query for {} registers to {}: {:02X?}",
            channels, self.endpoint, query
        ));
        match timeout(self.io_timeout, stream.write_all(&query)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(BmsError::network(format!(
                    "send to {} failed: {}",
                    self.endpoint, e
                )));
            }
            Err(_) => {
                return Err(BmsError::timeout(format!(
                    "send to {} timed out",
                    self.endpoint
                )));
            }
        }

        sleep(self.query_delay).await;

        let mut buf = vec![0u8; RESPONSE_BUFFER_LEN];
        let n = match timeout(self.io_timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                return Err(BmsError::network(format!(
                    "receive from {} failed: {}",
                    self.endpoint, e
                )));
            }
            Err(_) => {
                return Err(BmsError::timeout(format!(
                    "receive from {} timed out",
                    self.endpoint
                )));
            }
        };

        decode_response(&buf[..n], channels, self.scaling_factor)
    }
}

#[async_trait]
impl TemperatureSource for TemperatureLink {
    async fn read(&self, channels: u16, policy: RetryPolicy) -> Result<Vec<f64>> {
        let result = with_retries(policy, |attempt| async move {
            let outcome = self.read_once(channels).await;
            if let Err(ref e) = outcome {
                self.logger.warn(&format!(
                    "Temperature read attempt {}/{} from {} failed: {}",
                    attempt + 1,
                    policy.attempts.max(1),
                    self.endpoint,
                    e
                ));
            }
            outcome
        })
        .await;

        result.map_err(|e| {
            self.logger.error(&format!(
                "Temperature acquisition from {} failed after {} attempts (channels={}, scaling={}): {}",
                self.endpoint, e.attempts, channels, self.scaling_factor, e.last
            ));
            BmsError::acquisition(self.endpoint.clone(), e.attempts, e.last)
        })
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::build_read_response;
    use tokio::net::TcpListener;

    fn config_for(port: u16) -> TemperatureConfig {
        TemperatureConfig {
            host: "127.0.0.1".to_string(),
            port,
            query_delay_secs: 0.0,
            io_timeout_secs: 1,
            ..TemperatureConfig::default()
        }
    }

    #[tokio::test]
    async fn reads_scaled_values_from_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 8];
            sock.read_exact(&mut req).await.unwrap();
            assert_eq!(req.to_vec(), build_read_query(3));
            sock.write_all(&build_read_response(&[2500, 2550, 0]))
                .await
                .unwrap();
        });

        let link = TemperatureLink::new(&config_for(port));
        let values = link.read(3, RetryPolicy::once()).await.unwrap();
        assert_eq!(values, vec![25.0, 25.5, 0.0]);
    }

    #[tokio::test]
    async fn exhausted_retries_carry_last_cause() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for _ in 0..2 {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut req = [0u8; 8];
                let _ = sock.read_exact(&mut req).await;
                let _ = sock.write_all(&[0x01, 0x03]).await;
            }
        });

        let link = TemperatureLink::new(&config_for(port));
        let err = link
            .read(2, RetryPolicy::new(2, Backoff::None))
            .await
            .unwrap_err();
        match err {
            BmsError::Acquisition {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*source, BmsError::ShortFrame { len: 2 }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
