//! The adapter contract a concrete ledger connection implements.
//!
//! A real transport owns the wire protocol (TLS, framing, protobuf decode)
//! entirely out of scope here (see the crate's top-level docs); all the
//! dispatcher needs from it is `open`/`close`, and a way to push decoded
//! [`crate::event::Block`]/[`crate::event::FilteredBlock`] values and
//! failures back in. The `async_trait`-based adapter-trait shape follows
//! this workspace's call adapters (`crates/bundle/src/call/alloy.rs`).

use async_trait::async_trait;
use std::error::Error;

/// Opens and closes the upstream connection used by a
/// [`Dispatcher`](crate::dispatcher::Dispatcher).
///
/// Implementations are expected to push [`crate::dispatcher::Event::Block`],
/// [`crate::dispatcher::Event::FilteredBlock`], and
/// [`crate::dispatcher::Event::TransportFailure`] onto the dispatcher via
/// [`crate::dispatcher::Dispatcher::submit`] as they arrive, from whatever
/// background task `open` spawns; that plumbing is the transport's
/// responsibility, not the dispatcher's.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The error type returned by `open`/`close`.
    type Error: Error + Send + Sync + 'static;

    /// Establish the upstream connection.
    async fn open(&self) -> Result<(), Self::Error>;

    /// Tear down the upstream connection. Must be safe to call on an
    /// already-closed transport.
    async fn close(&self) -> Result<(), Self::Error>;
}
