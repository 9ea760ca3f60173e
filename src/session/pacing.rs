//! Command pacing and retry
//!
//! Sensors process one command at a time and need a short pause between
//! commands. Every command a session sends goes through [`CommandPacer`],
//! which waits `pacing` before the call and retries once after
//! `retry_delay` when the device rejects it.

use crate::device::{DeviceError, DeviceResult};
use std::future::Future;
use std::time::Duration;

/// Result of a paced command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Accepted,
    /// Accepted on the second attempt
    AcceptedAfterRetry,
    Failed(DeviceError),
}

impl CommandOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, CommandOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandPacer {
    pacing: Duration,
    retry_delay: Duration,
}

impl CommandPacer {
    pub fn new(pacing: Duration, retry_delay: Duration) -> Self {
        Self {
            pacing,
            retry_delay,
        }
    }

    /// Wait the pacing delay
    async fn pace(&self) {
        if !self.pacing.is_zero() {
            tokio::time::sleep(self.pacing).await;
        }
    }

    /// Paced single attempt
    pub async fn send<F, Fut>(&self, command: &str, address: &str, f: F) -> DeviceResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DeviceResult<()>>,
    {
        self.pace().await;
        let result = f().await;
        match &result {
            Ok(()) => tracing::debug!("{} accepted by {}", command, address),
            Err(e) => tracing::warn!("{} failed on {}: {}", command, address, e),
        }
        result
    }

    /// Paced attempt with one retry
    pub async fn send_with_retry<F, Fut>(&self, command: &str, address: &str, mut f: F) -> CommandOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DeviceResult<()>>,
    {
        self.pace().await;
        match f().await {
            Ok(()) => {
                tracing::debug!("{} accepted by {}", command, address);
                CommandOutcome::Accepted
            }
            Err(first) => {
                tracing::debug!("{} rejected by {} ({}), retrying", command, address, first);
                tokio::time::sleep(self.retry_delay).await;
                match f().await {
                    Ok(()) => {
                        tracing::debug!("{} retry accepted by {}", command, address);
                        CommandOutcome::AcceptedAfterRetry
                    }
                    Err(e) => {
                        tracing::warn!("{} failed on {} after retry: {}", command, address, e);
                        CommandOutcome::Failed(e)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rejected() -> DeviceError {
        DeviceError::Rejected {
            address: "A".into(),
            command: "test".into(),
        }
    }

    #[tokio::test]
    async fn test_retries_exactly_once() {
        let pacer = CommandPacer::new(Duration::ZERO, Duration::from_millis(1));
        let counter = AtomicUsize::new(0);
        let attempts = &counter;

        let outcome = pacer
            .send_with_retry("start", "A", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(rejected())
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(!outcome.is_accepted());
    }

    #[tokio::test]
    async fn test_second_attempt_success() {
        let pacer = CommandPacer::new(Duration::ZERO, Duration::from_millis(1));
        let counter = AtomicUsize::new(0);
        let attempts = &counter;

        let outcome = pacer
            .send_with_retry("start", "A", move || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(rejected())
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(outcome, CommandOutcome::AcceptedAfterRetry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_delay_precedes_command() {
        let pacer = CommandPacer::new(Duration::from_millis(30), Duration::ZERO);
        let start = tokio::time::Instant::now();
        pacer.send("notify", "A", || async { Ok(()) }).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
