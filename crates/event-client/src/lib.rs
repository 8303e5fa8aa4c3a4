//! A single-threaded event dispatcher and reconnecting client for a
//! distributed ledger's event stream.
//!
//! This crate has two tightly coupled halves:
//!
//! - [`dispatcher::Dispatcher`] owns every subscription table and fans raw
//!   blocks, filtered blocks, per-transaction status, and per-chaincode
//!   application events out to independent typed channels. All subscription
//!   state lives on one task, so no locks are needed around it.
//! - [`client::Client`] wraps a [`dispatcher::Dispatcher`] with a lock-free
//!   connection-state machine, a once-only monitor task, and configurable
//!   reconnect/backoff policy.
//!
//! The concrete transport to an upstream ledger (gRPC/deliver streams,
//! protobuf message definitions, identity/credential loading) is out of
//! scope; [`transport::Transport`] is the narrow adapter contract a
//! concrete binding implements, and [`event::Block`]/[`event::FilteredBlock`]
//! model the already-decoded shape such a binding produces.
//!
//! ## Usage example
//!
//! ```rust
//! # use ledger_event_client::{
//! #     client::Client,
//! #     config::{ClientConfig, DispatcherConfig},
//! #     dispatcher::Dispatcher,
//! #     transport::Transport,
//! # };
//! # #[derive(Debug, Default)]
//! # struct NoopTransport;
//! # #[async_trait::async_trait]
//! # impl Transport for NoopTransport {
//! #     type Error = std::convert::Infallible;
//! #     async fn open(&self) -> Result<(), Self::Error> { Ok(()) }
//! #     async fn close(&self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//! # async fn f() -> ledger_event_client::error::Result<()> {
//! let dispatcher = Dispatcher::new(DispatcherConfig::default(), NoopTransport);
//! dispatcher.start()?;
//!
//! let client = Client::new(true, dispatcher, ClientConfig::default());
//! client.connect().await?;
//!
//! let (_handle, mut blocks) = client.register_block_event(None).await?;
//! while let Some(_block) = blocks.recv().await {
//!     // handle the block
//!     break;
//! }
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    clippy::missing_const_for_fn,
    rustdoc::all
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

/// The connection-state machine wrapping a [`dispatcher::Dispatcher`].
pub mod client;

/// Configuration for the [`dispatcher::Dispatcher`] and [`client::Client`].
pub mod config;

/// The single-threaded event pump owning all subscription state.
pub mod dispatcher;

/// Crate-wide error taxonomy.
pub mod error;

/// Ledger data types and the payloads delivered to subscribers.
pub mod event;

/// Derives a `FilteredBlock` summary from a `Block`.
pub mod filtered;

/// Registration handles and the tables that back them.
pub mod registration;

/// The transport adapter contract.
pub mod transport;

pub use client::Client;
pub use dispatcher::Dispatcher;
pub use error::{EventClientError, Result};

/// Transport test doubles, exported for downstream integration tests and
/// doctests. Not intended for production use.
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
