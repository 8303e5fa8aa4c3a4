//! The connection-state machine wrapping a [`Dispatcher`].
//!
//! Where the dispatcher serializes subscription state onto one task, the
//! client serializes *connection* state onto a pair of atomics
//! (`connection_state`, `stopped`) plus a single monitor task, following this
//! workspace's `RpcServerGuard` (`crates/rpc/src/config.rs`) pattern of a
//! small guard type around spawned tasks, generalized here into a full
//! connect/monitor/reconnect state machine.

use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, Event};
use crate::error::{EventClientError, Result};
use crate::event::{BlockEvent, ChaincodeEvent, ConnectionEvent, FilteredBlockEvent, TxStatusEvent};
use crate::registration::{BlockFilter, Registration};
use crate::transport::Transport;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// A hook invoked after a successful `Connect` handshake, before the
/// connection is considered `Connected`. Returning an error aborts the
/// connect attempt and disconnects.
#[async_trait]
pub trait AfterConnectHook: Send + Sync + 'static {
    /// Run the hook.
    async fn call(&self) -> Result<()>;
}

#[async_trait]
impl<F, Fut> AfterConnectHook for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self) -> Result<()> {
        (self)().await
    }
}

/// A hook invoked before a reconnect cycle begins, after
/// `reconn_initial_delay` has elapsed. Returning an error aborts the
/// reconnect cycle, leaving the client `Disconnected`.
#[async_trait]
pub trait BeforeReconnectHook: Send + Sync + 'static {
    /// Run the hook.
    async fn call(&self) -> Result<()>;
}

#[async_trait]
impl<F, Fut> BeforeReconnectHook for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self) -> Result<()> {
        (self)().await
    }
}

/// The client's view of the upstream connection.
///
/// Transitions are enforced by atomic compare-and-swap in [`Client`]; direct
/// `Disconnected` <-> `Connected` transitions never happen except the reset
/// `Close` performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No upstream connection. The initial state, and the state after
    /// `Close` or a failed reconnect cycle.
    Disconnected = 0,
    /// A connect attempt (initial or reconnect) is in flight.
    Connecting = 1,
    /// The upstream connection is established and the `afterConnect` hook
    /// (if any) has succeeded.
    Connected = 2,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            _ => Self::Connected,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

struct Inner<T> {
    dispatcher: Dispatcher<T>,
    permit_block_events: bool,
    params: ClientConfig,
    connection_state: AtomicU8,
    stopped: AtomicBool,
    register_once: AtomicBool,
    after_connect: Mutex<Option<Arc<dyn AfterConnectHook>>>,
    before_reconnect: Mutex<Option<Arc<dyn BeforeReconnectHook>>>,
}

/// Wraps a [`Dispatcher`] with a connection-state machine, reconnect policy,
/// and the public subscription API. Cheap to clone; every clone shares the
/// same connection state and dispatcher.
pub struct Client<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> core::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Client")
            .field("connection_state", &self.connection_state())
            .field("stopped", &self.stopped())
            .finish_non_exhaustive()
    }
}

impl<T> Client<T>
where
    T: Transport,
{
    /// Create a new client wrapping `dispatcher`, which must not yet be
    /// started; the caller is responsible for calling
    /// [`Dispatcher::start`](crate::dispatcher::Dispatcher::start) before
    /// the first [`Client::connect`].
    pub fn new(permit_block_events: bool, dispatcher: Dispatcher<T>, params: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                permit_block_events,
                params,
                connection_state: AtomicU8::new(ConnectionState::Disconnected as u8),
                stopped: AtomicBool::new(false),
                register_once: AtomicBool::new(false),
                after_connect: Mutex::new(None),
                before_reconnect: Mutex::new(None),
            }),
        }
    }

    /// The current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.connection_state.load(Ordering::Acquire))
    }

    /// True once [`Client::close`] has been called, even if it is still in
    /// progress.
    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Install (or replace) the `afterConnect` hook.
    pub fn set_after_connect_handler<H: AfterConnectHook>(&self, hook: H) {
        *self.inner.after_connect.lock().expect("after_connect mutex poisoned") = Some(Arc::new(hook));
    }

    /// Install (or replace) the `beforeReconnect` hook.
    pub fn set_before_reconnect_handler<H: BeforeReconnectHook>(&self, hook: H) {
        *self.inner.before_reconnect.lock().expect("before_reconnect mutex poisoned") = Some(Arc::new(hook));
    }

    fn cas_state(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.inner
            .connection_state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Connect to the upstream event source.
    ///
    /// One-shot when `params.max_conn_attempts == 1` (the default);
    /// otherwise retries per [`Client::connect_with_retry`].
    pub async fn connect(&self) -> Result<()> {
        if self.inner.params.max_conn_attempts == 1 {
            self.connect_once().await
        } else {
            let budget = RetryBudget {
                max_attempts: self.inner.params.max_conn_attempts,
                between: self.inner.params.time_between_conn_attempts,
            };
            self.connect_with_retry(budget).await
        }
    }

    /// Attempt to connect up to `max_attempts` times (`0` means unbounded),
    /// sleeping `time_between_conn_attempts` (clamped to at least one
    /// second) between failures.
    pub async fn connect_with_retry(&self, attempts: RetryBudget) -> Result<()> {
        let RetryBudget { max_attempts, between } = attempts;
        let between = between.max(std::time::Duration::from_secs(1));

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if max_attempts != 0 && attempt >= max_attempts {
                        warn!(attempt, max_attempts, "exhausted connect attempt budget");
                        return Err(EventClientError::RetryBudgetExhausted);
                    }
                    debug!(attempt, %err, "connect attempt failed, retrying");
                    tokio::time::sleep(between).await;
                }
            }
        }
    }

    /// Run the single-attempt connect state machine.
    async fn connect_once(&self) -> Result<()> {
        if self.stopped() {
            return Err(EventClientError::ClientClosed);
        }

        if !self.cas_state(ConnectionState::Disconnected, ConnectionState::Connecting) {
            let current = self.connection_state();
            return Err(EventClientError::InvalidConnectState(current.as_str()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.dispatcher.submit(Event::Connect { reply: reply_tx }).await?;
        let connect_result = reply_rx.await.map_err(|_| EventClientError::DispatcherGone)?;

        if let Err(err) = connect_result {
            self.inner.connection_state.store(ConnectionState::Disconnected as u8, Ordering::Release);
            return Err(err);
        }

        if !self.inner.register_once.swap(true, Ordering::AcqRel) {
            self.start_monitor().await?;
        }

        let hook = self.inner.after_connect.lock().expect("after_connect mutex poisoned").clone();
        if let Some(hook) = hook {
            if let Err(err) = hook.call().await {
                let (disc_tx, disc_rx) = oneshot::channel();
                if self.inner.dispatcher.submit(Event::Disconnect { reply: disc_tx }).await.is_ok() {
                    let _ = tokio::time::timeout(self.inner.params.resp_timeout, disc_rx).await;
                }
                self.inner.connection_state.store(ConnectionState::Disconnected as u8, Ordering::Release);
                return Err(EventClientError::transport(HookFailed(err.to_string())));
            }
        }
        self.inner.connection_state.store(ConnectionState::Connected as u8, Ordering::Release);

        if self.inner.dispatcher.submit(Event::Connected).await.is_err() {
            debug!("dispatcher gone while publishing Connected transition");
        }

        Ok(())
    }

    /// Register the client's internal connection-event subscription and
    /// spawn the monitor task. Runs exactly once per client lifetime,
    /// guarded by `register_once` in [`Client::connect_once`].
    async fn start_monitor(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.dispatcher.submit(Event::RegisterConnection { reply: reply_tx }).await?;
        let (_handle, rx) = reply_rx.await.map_err(|_| EventClientError::DispatcherGone)??;

        let client = self.clone();
        tokio::spawn(async move { client.monitor(rx).await });
        Ok(())
    }

    /// The monitor task: reacts to every connection transition and drives
    /// the reconnect policy. Exits when the internal channel closes or the
    /// client is stopped.
    async fn monitor(self, mut rx: mpsc::Receiver<ConnectionEvent>) {
        debug!("connection monitor started");
        while let Some(event) = rx.recv().await {
            if self.stopped() {
                break;
            }

            if event.connected {
                debug!("observed connected transition");
                continue;
            }

            if self.inner.params.reconn {
                if self.cas_state(ConnectionState::Connected, ConnectionState::Disconnected) {
                    let client = self.clone();
                    tokio::spawn(async move { client.reconnect().await });
                } else if self.cas_state(ConnectionState::Connecting, ConnectionState::Disconnected) {
                    debug!("reconnect already in progress, leaving it");
                } else {
                    debug!("already disconnected, nothing to do");
                }
            } else {
                info!("connection lost and reconn disabled, closing");
                let client = self.clone();
                tokio::spawn(async move { let _ = client.close().await; });
                break;
            }
        }
        debug!("connection monitor exiting");
    }

    /// The reconnect task: waits `reconn_initial_delay`, runs
    /// `beforeReconnect`, then retries the connect up to
    /// `max_reconn_attempts` times. Closes the client on permanent failure.
    async fn reconnect(self) {
        tokio::time::sleep(self.inner.params.reconn_initial_delay).await;

        let hook = self.inner.before_reconnect.lock().expect("before_reconnect mutex poisoned").clone();
        if let Some(hook) = hook {
            if let Err(err) = hook.call().await {
                warn!(%err, "beforeReconnect hook failed, aborting reconnect");
                return;
            }
        }

        let budget = RetryBudget {
            max_attempts: self.inner.params.max_reconn_attempts,
            between: self.inner.params.time_between_conn_attempts,
        };
        if let Err(err) = self.connect_with_retry(budget).await {
            warn!(%err, "reconnect cycle exhausted, closing client");
            let _ = self.close().await;
        }
    }

    /// Close the client: idempotent. Disconnects the transport, stops the
    /// dispatcher (closing every subscriber channel), and resets connection
    /// state to `Disconnected`.
    pub async fn close(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (disc_tx, disc_rx) = oneshot::channel();
        if self.inner.dispatcher.submit(Event::Disconnect { reply: disc_tx }).await.is_ok() {
            let _ = disc_rx.await;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        if self.inner.dispatcher.submit(Event::Stop { reply: stop_tx }).await.is_ok() {
            let _ = stop_rx.await;
        }

        self.inner.connection_state.store(ConnectionState::Disconnected as u8, Ordering::Release);
        Ok(())
    }

    /// Register a block-event subscriber. Fails with
    /// [`EventClientError::BlockEventsNotPermitted`] if the client was
    /// constructed with `permit_block_events = false`.
    pub async fn register_block_event(
        &self,
        filter: Option<BlockFilter>,
    ) -> Result<(Registration, mpsc::Receiver<BlockEvent>)> {
        if !self.inner.permit_block_events {
            return Err(EventClientError::BlockEventsNotPermitted);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.dispatcher.submit(Event::RegisterBlock { filter, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EventClientError::DispatcherGone)?
    }

    /// Register a filtered-block-event subscriber.
    pub async fn register_filtered_block_event(&self) -> Result<(Registration, mpsc::Receiver<FilteredBlockEvent>)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.dispatcher.submit(Event::RegisterFilteredBlock { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EventClientError::DispatcherGone)?
    }

    /// Register a transaction-status subscriber for an exact transaction
    /// id. Fails with [`EventClientError::DuplicateRegistration`] if `txid`
    /// already has a subscriber.
    pub async fn register_tx_status_event(&self, txid: impl Into<String>) -> Result<(Registration, mpsc::Receiver<TxStatusEvent>)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.dispatcher.submit(Event::RegisterTxStatus { txid: txid.into(), reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EventClientError::DispatcherGone)?
    }

    /// Register a chaincode-event subscriber for a chaincode id and an
    /// event-name filter (compiled as a regular expression). Fails with
    /// [`EventClientError::DuplicateRegistration`] if the `(chaincode_id,
    /// filter)` pair already has a subscriber, or
    /// [`EventClientError::InvalidFilter`] if `filter` does not compile.
    pub async fn register_chaincode_event(
        &self,
        chaincode_id: impl Into<String>,
        filter: impl Into<String>,
    ) -> Result<(Registration, mpsc::Receiver<ChaincodeEvent>)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .dispatcher
            .submit(Event::RegisterChaincode { chaincode_id: chaincode_id.into(), filter: filter.into(), reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| EventClientError::DispatcherGone)?
    }

    /// Register a connection-event subscriber, receiving every connection
    /// transition observed from this point forward.
    pub async fn register_connection_event(&self) -> Result<(Registration, mpsc::Receiver<ConnectionEvent>)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.dispatcher.submit(Event::RegisterConnection { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EventClientError::DispatcherGone)?
    }

    /// Remove a registration and close its outbound channel.
    pub async fn unregister(&self, handle: Registration) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.dispatcher.submit(Event::Unregister { handle, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EventClientError::DispatcherGone)?
    }

    /// The highest block number observed by the dispatcher so far.
    pub fn last_block_num(&self) -> Option<u64> {
        self.inner.dispatcher.last_block_num()
    }
}

/// The attempt budget and interval passed to [`Client::connect_with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    /// Maximum number of attempts (`0` means unbounded).
    pub max_attempts: u32,
    /// Sleep between failed attempts; clamped to at least one second.
    pub between: std::time::Duration,
}

/// Wraps an `afterConnect` hook failure so it can be carried through
/// [`EventClientError::Transport`] without inventing a dedicated variant for
/// what is, structurally, the same "collaborator failed" shape.
#[derive(Debug, thiserror::Error)]
#[error("after-connect hook failed: {0}")]
struct HookFailed(String);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::dispatcher::Dispatcher;
    use crate::testing::{FailingTransport, LoopbackTransport};
    use std::time::Duration;

    fn client(params: ClientConfig) -> Client<LoopbackTransport> {
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), LoopbackTransport::default());
        dispatcher.start().unwrap();
        Client::new(true, dispatcher, params)
    }

    #[tokio::test]
    async fn connect_then_close_is_idempotent() {
        let c = client(ClientConfig::default());
        c.connect().await.unwrap();
        assert_eq!(c.connection_state(), ConnectionState::Connected);

        c.close().await.unwrap();
        assert!(c.stopped());
        assert_eq!(c.connection_state(), ConnectionState::Disconnected);

        // second close is a silent no-op
        c.close().await.unwrap();
    }

    #[tokio::test]
    async fn connect_after_close_fails() {
        let c = client(ClientConfig::default());
        c.close().await.unwrap();
        assert!(matches!(c.connect().await, Err(EventClientError::ClientClosed)));
    }

    #[tokio::test]
    async fn double_connect_from_connected_state_fails() {
        let c = client(ClientConfig::default());
        c.connect().await.unwrap();
        assert!(matches!(c.connect().await, Err(EventClientError::InvalidConnectState(_))));
    }

    #[tokio::test]
    async fn block_events_denied_when_not_permitted() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), LoopbackTransport::default());
        dispatcher.start().unwrap();
        let c = Client::new(false, dispatcher, ClientConfig::default());
        assert!(matches!(
            c.register_block_event(None).await,
            Err(EventClientError::BlockEventsNotPermitted)
        ));
    }

    #[tokio::test]
    async fn after_connect_failure_reverts_to_disconnected() {
        let c = client(ClientConfig::default());
        c.set_after_connect_handler(|| async { Result::<()>::Err(EventClientError::ClientClosed) });
        assert!(c.connect().await.is_err());
        assert_eq!(c.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_with_retry_exhausts_budget_against_failing_transport() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), FailingTransport::default());
        dispatcher.start().unwrap();
        let params = ClientConfig {
            max_conn_attempts: 3,
            time_between_conn_attempts: Duration::from_secs(1),
            ..ClientConfig::default()
        };
        let c = Client::new(true, dispatcher, params);
        assert!(matches!(c.connect().await, Err(EventClientError::RetryBudgetExhausted)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_path_recovers_after_transport_failure() {
        crate::testing::init_tracing();

        let c = client(ClientConfig {
            reconn: true,
            max_reconn_attempts: 3,
            time_between_conn_attempts: Duration::from_secs(1),
            reconn_initial_delay: Duration::from_millis(10),
            ..ClientConfig::default()
        });
        c.connect().await.unwrap();

        let (_handle, mut conn_rx) = c.register_connection_event().await.unwrap();
        c.inner
            .dispatcher
            .submit(Event::TransportFailure { err: "stream reset".into() })
            .await
            .unwrap();

        let event = conn_rx.recv().await.unwrap();
        assert!(!event.connected);

        // allow the monitor + reconnect task to run
        for _ in 0..20 {
            if c.connection_state() == ConnectionState::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(c.connection_state(), ConnectionState::Connected);
    }
}
