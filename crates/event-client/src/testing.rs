//! Transport test doubles.
//!
//! [`LoopbackTransport`] and [`FailingTransport`] stand in for a real
//! ledger connection in unit tests, in the style of this workspace's own
//! `#[tokio::test]`-based fixtures (`crates/tx-cache`, `crates/sim`), which
//! prefer a minimal in-memory double over mocking a whole crate.

use crate::transport::Transport;
use async_trait::async_trait;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A transport whose `open`/`close` always succeed immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackTransport;

#[async_trait]
impl Transport for LoopbackTransport {
    type Error = Infallible;

    async fn open(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// The error returned by every [`FailingTransport::open`] call.
#[derive(Debug, thiserror::Error)]
#[error("simulated connect failure")]
pub struct AlwaysFails;

/// A transport whose `open` always fails; exercises retry/backoff paths
/// without a real ledger connection. `close` always succeeds.
#[derive(Debug, Default)]
pub struct FailingTransport {
    attempts: AtomicUsize,
}

impl FailingTransport {
    /// Number of `open` calls made so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for FailingTransport {
    type Error = AlwaysFails;

    async fn open(&self) -> Result<(), Self::Error> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        Err(AlwaysFails)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Initialize tracing for local debugging when running this crate's own
/// tests. Not part of the `test-util` feature surface: downstream crates
/// bring their own subscriber.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
