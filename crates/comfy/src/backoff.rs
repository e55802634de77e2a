//! Exponential-backoff connection retry for the ComfyUI WebSocket.
//!
//! A worker that cannot reach its ComfyUI server retries with growing
//! delays until the connection succeeds, the attempt budget runs out,
//! or the job's cancel token fires.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyClient, ComfyConnection};

/// Tunable parameters for the backoff strategy.
pub struct BackoffConfig {
    /// Delay before the second attempt (the first is immediate).
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Growth factor applied after each failure.
    pub multiplier: f64,
    /// Total connection attempts before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Next delay from the current one, clamped to the configured maximum.
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Connect with retries. Returns `None` when cancelled or out of
/// attempts; the caller maps that onto a worker failure.
pub async fn connect_with_backoff(
    client: &ComfyClient,
    config: &BackoffConfig,
    cancel: &CancellationToken,
) -> Option<ComfyConnection> {
    let mut delay = config.initial_delay;

    for attempt in 1..=config.max_attempts {
        if cancel.is_cancelled() {
            return None;
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            result = client.connect() => match result {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        "ComfyUI connection attempt failed",
                    );
                }
            }
        }

        if attempt < config.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay, config);
        }
    }

    None
}
