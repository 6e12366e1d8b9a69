//! Control-channel reconnection with a fixed delay and host rotation

use crate::config::ReconnectPolicy;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Counts retries and rotates the candidate hosts between attempts
pub struct ReconnectManager {
    policy: ReconnectPolicy,
    hosts: VecDeque<String>,
    retry_count: u32,
}

impl ReconnectManager {
    pub fn new(policy: ReconnectPolicy, hosts: Vec<String>) -> Self {
        Self {
            policy,
            hosts: hosts.into(),
            retry_count: 0,
        }
    }

    /// Host to dial next
    pub fn current_host(&self) -> Option<&str> {
        self.hosts.front().map(String::as_str)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    /// True once no further attempt is allowed
    pub fn exhausted(&self) -> bool {
        self.retry_count >= self.policy.max_retries
    }

    /// Wait out the delay before the next attempt, then move the host that
    /// just failed to the back of the list
    ///
    /// Returns `MaxAttemptsReached` without waiting once the policy is spent,
    /// and `Cancelled` if `cancel` fires during the delay.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        if self.exhausted() {
            return Err(ReconnectError::MaxAttemptsReached);
        }
        self.retry_count += 1;

        debug!(
            retry = self.retry_count,
            max_retries = self.policy.max_retries,
            delay_ms = self.policy.delay.as_millis() as u64,
            "Waiting before reconnection attempt"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = sleep(self.policy.delay) => {}
        }

        if cancel.is_cancelled() {
            return Err(ReconnectError::Cancelled);
        }

        self.hosts.rotate_left(1.min(self.hosts.len()));
        Ok(())
    }
}
