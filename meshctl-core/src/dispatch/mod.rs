//! Request/response boundary towards the live network.
//!
//! Every component that needs the network holds an `Arc<dyn NetworkDispatch>`
//! and wraps each call in a [`DispatchPolicy`], which bounds the wait with a
//! per-attempt response timeout and a retransmit budget.

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::ErrorKind;
use crate::config::DispatchConfig;
use crate::multicast::{Bitmap, PathReplication};
use crate::schedule::{Cell, FrameId};
use crate::topology::Eui64;

/// One hop of a source route as reported by the network: the address bytes
/// of the hop, most significant first.
pub type RawHop = Vec<u8>;

/// Errors reported by the network or by the bounded-wait policy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("No response after {attempts} attempt(s) of {timeout:?}")]
    Timeout { attempts: u32, timeout: Duration },

    #[error("Request rejected by network: {reason}")]
    Rejected { reason: String },

    #[error("Network unreachable: {reason}")]
    Unreachable { reason: String },
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Timeout { .. } => ErrorKind::DispatchTimeout,
            DispatchError::Rejected { .. } | DispatchError::Unreachable { .. } => {
                ErrorKind::Dispatch
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Timeout { .. })
    }
}

/// Network operations the control plane depends on.
///
/// Implemented by the live-network transport and by the simulated network.
/// Implementations only need to answer one attempt; timeouts and
/// retransmissions are applied by the caller through [`DispatchPolicy`].
#[async_trait]
pub trait NetworkDispatch: Send + Sync {
    /// Installs one cell in a slotframe of the live network.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Rejected` - If the network refuses the cell
    /// - `DispatchError::Unreachable` - If the network cannot be contacted
    async fn add_cell(&self, frame: FrameId, cell: &Cell) -> Result<(), DispatchError>;

    /// Removes one cell from a slotframe of the live network.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Rejected` - If the network refuses the removal
    /// - `DispatchError::Unreachable` - If the network cannot be contacted
    async fn remove_cell(&self, frame: FrameId, cell: &Cell) -> Result<(), DispatchError>;

    /// Replaces the forwarding bitmap used by bit-indexed multicast.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Rejected` - If the forwarding layer refuses the bitmap
    async fn push_bitmap(&self, bitmap: &Bitmap) -> Result<(), DispatchError>;

    /// Switches between bit-indexed forwarding and plain flooding.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Rejected` - If the forwarding layer refuses the change
    async fn set_multicast(&self, enabled: bool) -> Result<(), DispatchError>;

    /// Queries the routing table for the path from the DAG root to
    /// `destination`, computed with the given replication strategy.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Unreachable` - If the routing layer has no answer
    async fn source_route(
        &self,
        destination: Eui64,
        replication: PathReplication,
    ) -> Result<Vec<RawHop>, DispatchError>;
}

/// Bounded-wait policy applied to every dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub response_timeout: Duration,
    pub max_retransmit: u32,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

impl DispatchPolicy {
    pub fn new(response_timeout: Duration, max_retransmit: u32) -> Self {
        Self {
            response_timeout,
            max_retransmit,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.response_timeout, config.max_retransmit)
    }

    /// Total attempts including the first transmission.
    pub fn attempts(&self) -> u32 {
        self.max_retransmit.saturating_add(1)
    }

    /// Longest time a single request can take before it fails.
    pub fn max_wait(&self) -> Duration {
        self.response_timeout.saturating_mul(self.attempts())
    }

    /// Runs `attempt` until it answers or the retransmit budget is spent.
    ///
    /// Only unanswered attempts are retried. An explicit refusal from the
    /// network is returned immediately.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Timeout` - If no attempt answered within the timeout
    /// - Any error returned by the attempt itself
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, DispatchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let attempts = self.attempts();
        for number in 1..=attempts {
            match tokio::time::timeout(self.response_timeout, attempt()).await {
                Ok(result) => return result,
                Err(_) => {
                    tracing::debug!(
                        operation,
                        attempt = number,
                        of = attempts,
                        "Dispatch attempt timed out"
                    );
                }
            }
        }

        tracing::warn!(
            operation,
            attempts,
            timeout_ms = self.response_timeout.as_millis() as u64,
            "Dispatch gave up after exhausting retransmissions"
        );
        Err(DispatchError::Timeout {
            attempts,
            timeout: self.response_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> DispatchPolicy {
        DispatchPolicy::new(Duration::from_millis(20), 2)
    }

    #[test]
    fn test_budget() {
        let policy = policy();
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.max_wait(), Duration::from_millis(60));

        let defaults = DispatchPolicy::default();
        assert_eq!(defaults.attempts(), 2);
        assert_eq!(defaults.max_wait(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_first_answer_wins() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .run("probe", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, DispatchError>(7) }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .run("probe", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(DispatchError::Rejected {
                        reason: "busy".to_string(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(DispatchError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_silence_exhausts_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();
        let result: Result<(), _> = policy()
            .run("probe", || {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending()
            })
            .await;

        assert_eq!(
            result,
            Err(DispatchError::Timeout {
                attempts: 3,
                timeout: Duration::from_millis(20),
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert!(result.unwrap_err().kind() == ErrorKind::DispatchTimeout);
    }

    #[tokio::test]
    async fn test_retransmit_recovers() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .run("probe", || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        std::future::pending::<()>().await;
                    }
                    Ok::<_, DispatchError>(call)
                }
            })
            .await;
        assert_eq!(result, Ok(1));
    }
}
