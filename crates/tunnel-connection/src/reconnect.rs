//! Reconnection logic with exponential backoff
//!
//! The backoff starts at `initial_backoff` and grows by `multiplier` after
//! every failed attempt. There is no upper bound on either the delay or the
//! number of attempts: the client keeps trying until it is told to stop.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    #[serde(with = "crate::duration_ms")]
    pub initial_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            multiplier: 1.2,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Reconnection manager with exponential backoff
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Wait before next reconnection attempt
    ///
    /// Returns `Cancelled` as soon as `cancel` fires, without waiting out the
    /// rest of the delay.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        debug!(
            attempt = self.attempt,
            backoff_ms = self.current_backoff.as_millis() as u64,
            "Waiting before reconnection attempt"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = sleep(self.current_backoff) => {}
        }

        self.current_backoff = grow(self.current_backoff, self.config.multiplier);

        Ok(())
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get current backoff duration
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

/// `backoff * multiplier`, saturating at `Duration::MAX`
fn grow(backoff: Duration, multiplier: f64) -> Duration {
    Duration::try_from_secs_f64(backoff.as_secs_f64() * multiplier).unwrap_or(Duration::MAX)
}
