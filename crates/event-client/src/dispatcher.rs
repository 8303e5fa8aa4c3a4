//! The single-threaded event pump.
//!
//! Everything this module does is concentrated in one idea: serialize every
//! subscription-table mutation and every delivery decision through one
//! `tokio` task, so the tables never need a lock. The
//! task-per-subscription-manager structure, atomic id allocation, and
//! `tracing`-span-per-iteration style generalize the workspace's
//! `SubscriptionManager`/`SubscriptionTask` (`crates/rpc/src/interest/subs.rs`)
//! from many concurrent per-client tasks into one dispatcher loop shared by
//! every subscriber kind.

use crate::config::{DeliveryTimeout, DispatcherConfig};
use crate::error::{EventClientError, Result};
use crate::event::{
    Block, BlockEvent, ChaincodeEvent, ChaincodeEventData, ConnectionEvent, FilteredBlock, FilteredBlockEvent,
    TxStatusEvent,
};
use crate::filtered::to_filtered_block;
use crate::registration::{
    BlockFilter, BlockReg, ChaincodeReg, ConnectionReg, FilteredBlockReg, RegId, RegIdAllocator, Registration,
    RegistrationTables, TxStatusReg,
};
use crate::transport::Transport;
use regex::Regex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, trace, warn, Instrument};

/// Control and data events accepted by [`Dispatcher::submit`].
///
/// A type-keyed handler map in the source this crate generalizes from is
/// replaced here with a plain sum type and an exhaustive match, per the
/// "type-keyed handler map -> tagged variants" design note: there is no
/// runtime type reflection, and no "unknown variant" case to fall through
/// to, since the compiler enforces exhaustiveness.
pub enum Event {
    /// Open the upstream connection via the configured [`Transport`].
    Connect { reply: oneshot::Sender<Result<()>> },
    /// Close the upstream connection via the configured [`Transport`].
    Disconnect { reply: oneshot::Sender<Result<()>> },
    /// Notify connection-event subscribers that the client is now
    /// connected. Carries no reply; this is fire-and-forget observation.
    Connected,
    /// Reported by a transport (or by the client's monitor) when the
    /// stream fails asynchronously, after a successful connect.
    TransportFailure { err: String },
    /// Register a block-event subscriber.
    RegisterBlock {
        filter: Option<BlockFilter>,
        reply: oneshot::Sender<Result<(Registration, mpsc::Receiver<BlockEvent>)>>,
    },
    /// Register a filtered-block-event subscriber.
    RegisterFilteredBlock { reply: oneshot::Sender<Result<(Registration, mpsc::Receiver<FilteredBlockEvent>)>> },
    /// Register a transaction-status subscriber for an exact transaction
    /// id.
    RegisterTxStatus { txid: String, reply: oneshot::Sender<Result<(Registration, mpsc::Receiver<TxStatusEvent>)>> },
    /// Register a chaincode-event subscriber for a chaincode id and an
    /// event-name filter (compiled as a regular expression).
    RegisterChaincode {
        chaincode_id: String,
        filter: String,
        reply: oneshot::Sender<Result<(Registration, mpsc::Receiver<ChaincodeEvent>)>>,
    },
    /// Register a connection-event subscriber.
    RegisterConnection { reply: oneshot::Sender<Result<(Registration, mpsc::Receiver<ConnectionEvent>)>> },
    /// Remove a registration and close its outbound channel.
    Unregister { handle: Registration, reply: oneshot::Sender<Result<()>> },
    /// Stop the dispatcher: close every outbound channel and empty every
    /// table.
    Stop { reply: oneshot::Sender<Result<()>> },
    /// A raw block delivered by the transport.
    Block(Block),
    /// A filtered block delivered by the transport.
    FilteredBlock(FilteredBlock),
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::Connected => "connected",
            Self::TransportFailure { .. } => "transport_failure",
            Self::RegisterBlock { .. } => "register_block",
            Self::RegisterFilteredBlock { .. } => "register_filtered_block",
            Self::RegisterTxStatus { .. } => "register_tx_status",
            Self::RegisterChaincode { .. } => "register_chaincode",
            Self::RegisterConnection { .. } => "register_connection",
            Self::Unregister { .. } => "unregister",
            Self::Stop { .. } => "stop",
            Self::Block(_) => "block",
            Self::FilteredBlock(_) => "filtered_block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum DispatcherState {
    Initial = 0,
    Started = 1,
    Stopped = 2,
}

/// No block has been observed yet.
const NO_BLOCK: u64 = u64::MAX;

struct Inner<T> {
    state: AtomicU8,
    last_block_num: AtomicU64,
    id_alloc: RegIdAllocator,
    config: DispatcherConfig,
    inbox_tx: mpsc::Sender<Event>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    transport: T,
}

/// The single-threaded event pump. Cheap to clone; every clone shares the
/// same inbox, subscription state, and transport.
pub struct Dispatcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> core::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.inner.state.load(Ordering::Relaxed))
            .field("last_block_num", &self.last_block_num())
            .finish_non_exhaustive()
    }
}

impl<T> Dispatcher<T>
where
    T: Transport,
{
    /// Create a new, unstarted dispatcher wrapping `transport`.
    pub fn new(config: DispatcherConfig, transport: T) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.event_consumer_buffer_size);
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(DispatcherState::Initial as u8),
                last_block_num: AtomicU64::new(NO_BLOCK),
                id_alloc: RegIdAllocator::default(),
                config,
                inbox_tx,
                inbox_rx: Mutex::new(Some(inbox_rx)),
                transport,
            }),
        }
    }

    /// Start the processing loop. May only be called once; subsequent
    /// calls fail with [`EventClientError::DispatcherNotInitial`].
    pub fn start(&self) -> Result<()> {
        self.inner
            .state
            .compare_exchange(
                DispatcherState::Initial as u8,
                DispatcherState::Started as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| EventClientError::DispatcherNotInitial)?;

        let inbox = self
            .inner
            .inbox_rx
            .lock()
            .expect("inbox mutex poisoned")
            .take()
            .expect("inbox receiver taken exactly once, guarded by the state CAS above");

        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run(inbox).await });
        Ok(())
    }

    /// Submit an event to the dispatcher. Fails if the dispatcher has not
    /// been started, or has already stopped.
    pub async fn submit(&self, event: Event) -> Result<()> {
        if self.inner.state.load(Ordering::Acquire) != DispatcherState::Started as u8 {
            return Err(EventClientError::DispatcherNotStarted);
        }
        self.inner.inbox_tx.send(event).await.map_err(|_| EventClientError::DispatcherGone)
    }

    /// The highest block number observed so far, or `None` if no block has
    /// been accepted yet.
    ///
    /// Internally this is a `u64` with a sentinel meaning "none observed";
    /// surfacing that sentinel through the public API would not be idiomatic,
    /// so it is represented as `Option<u64>` instead.
    pub fn last_block_num(&self) -> Option<u64> {
        let value = self.inner.last_block_num.load(Ordering::Acquire);
        (value != NO_BLOCK).then_some(value)
    }

    async fn run(self, mut inbox: mpsc::Receiver<Event>) {
        let mut tables = RegistrationTables::default();
        debug!("dispatcher loop started");

        while let Some(event) = inbox.recv().await {
            let span = debug_span!("dispatcher_event", kind = event.kind());
            let stop = self.handle_event(&mut tables, event).instrument(span).await;
            if stop {
                break;
            }
        }

        debug!(remaining = tables.len(), "dispatcher loop exiting");
    }

    /// Handle a single event. Returns `true` if the loop should exit.
    async fn handle_event(&self, tables: &mut RegistrationTables, event: Event) -> bool {
        match event {
            Event::Connect { reply } => {
                let result = self.inner.transport.open().await.map_err(EventClientError::transport);
                let _ = reply.send(result);
            }
            Event::Disconnect { reply } => {
                let result = self.inner.transport.close().await.map_err(EventClientError::transport);
                let _ = reply.send(result);
            }
            Event::Connected => {
                self.publish_connection_event(tables, ConnectionEvent::connected()).await;
            }
            Event::TransportFailure { err } => {
                self.publish_connection_event(tables, ConnectionEvent::failed(err)).await;
            }
            Event::RegisterBlock { filter, reply } => self.register_block(tables, filter, reply),
            Event::RegisterFilteredBlock { reply } => self.register_filtered_block(tables, reply),
            Event::RegisterTxStatus { txid, reply } => self.register_tx_status(tables, txid, reply),
            Event::RegisterChaincode { chaincode_id, filter, reply } => {
                self.register_chaincode(tables, chaincode_id, filter, reply)
            }
            Event::RegisterConnection { reply } => self.register_connection(tables, reply),
            Event::Unregister { handle, reply } => {
                let result = if tables.remove(handle) { Ok(()) } else { Err(EventClientError::UnknownRegistration) };
                let _ = reply.send(result);
            }
            Event::Stop { reply } => {
                self.handle_stop(tables, reply);
                return true;
            }
            Event::Block(block) => self.handle_block(tables, block).await,
            Event::FilteredBlock(fb) => self.handle_filtered_block(tables, fb).await,
        }
        false
    }

    fn handle_stop(&self, tables: &mut RegistrationTables, reply: oneshot::Sender<Result<()>>) {
        let transitioned = self
            .inner
            .state
            .compare_exchange(
                DispatcherState::Started as u8,
                DispatcherState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if transitioned {
            debug!(registrations = tables.len(), "stopping dispatcher, closing all subscriber channels");
            tables.clear_all();
        } else {
            debug!("stop is a no-op: dispatcher already stopped");
        }
        let _ = reply.send(Ok(()));
    }

    fn register_block(
        &self,
        tables: &mut RegistrationTables,
        filter: Option<BlockFilter>,
        reply: oneshot::Sender<Result<(Registration, mpsc::Receiver<BlockEvent>)>>,
    ) {
        let (tx, rx) = mpsc::channel(self.inner.config.event_consumer_buffer_size);
        let id = self.inner.id_alloc.next();
        tables.block.push(BlockReg { id, filter, tx });
        debug!(?id, "registered block subscriber");
        let _ = reply.send(Ok((Registration::Block(id), rx)));
    }

    fn register_filtered_block(
        &self,
        tables: &mut RegistrationTables,
        reply: oneshot::Sender<Result<(Registration, mpsc::Receiver<FilteredBlockEvent>)>>,
    ) {
        let (tx, rx) = mpsc::channel(self.inner.config.event_consumer_buffer_size);
        let id = self.inner.id_alloc.next();
        tables.filtered_block.push(FilteredBlockReg { id, tx });
        debug!(?id, "registered filtered-block subscriber");
        let _ = reply.send(Ok((Registration::FilteredBlock(id), rx)));
    }

    fn register_tx_status(
        &self,
        tables: &mut RegistrationTables,
        txid: String,
        reply: oneshot::Sender<Result<(Registration, mpsc::Receiver<TxStatusEvent>)>>,
    ) {
        if tables.tx_status.iter().any(|reg| reg.txid == txid) {
            let _ = reply.send(Err(EventClientError::DuplicateRegistration));
            return;
        }
        let (tx, rx) = mpsc::channel(self.inner.config.event_consumer_buffer_size);
        let id = self.inner.id_alloc.next();
        tables.tx_status.push(TxStatusReg { id, txid, tx });
        debug!(?id, "registered tx-status subscriber");
        let _ = reply.send(Ok((Registration::TxStatus(id), rx)));
    }

    fn register_chaincode(
        &self,
        tables: &mut RegistrationTables,
        chaincode_id: String,
        filter_src: String,
        reply: oneshot::Sender<Result<(Registration, mpsc::Receiver<ChaincodeEvent>)>>,
    ) {
        let key = ChaincodeReg::key(&chaincode_id, &filter_src);
        if tables.chaincode.iter().any(|reg| ChaincodeReg::key(&reg.chaincode_id, &reg.filter_src) == key) {
            let _ = reply.send(Err(EventClientError::DuplicateRegistration));
            return;
        }
        let filter = match Regex::new(&filter_src) {
            Ok(filter) => filter,
            Err(err) => {
                let _ = reply.send(Err(EventClientError::InvalidFilter(err)));
                return;
            }
        };
        let (tx, rx) = mpsc::channel(self.inner.config.event_consumer_buffer_size);
        let id = self.inner.id_alloc.next();
        tables.chaincode.push(ChaincodeReg { id, chaincode_id, filter_src, filter, tx });
        debug!(?id, "registered chaincode subscriber");
        let _ = reply.send(Ok((Registration::Chaincode(id), rx)));
    }

    fn register_connection(
        &self,
        tables: &mut RegistrationTables,
        reply: oneshot::Sender<Result<(Registration, mpsc::Receiver<ConnectionEvent>)>>,
    ) {
        let (tx, rx) = mpsc::channel(self.inner.config.event_consumer_buffer_size);
        let id = self.inner.id_alloc.next();
        tables.connection.push(ConnectionReg { id, tx });
        debug!(?id, "registered connection-event subscriber");
        let _ = reply.send(Ok((Registration::Connection(id), rx)));
    }

    /// Update `last_block_num`, rejecting arrivals that are not strictly
    /// greater than the stored value. Returns the prior value on rejection,
    /// so callers can log `(expected, observed)` as a genuine pair instead
    /// of the same value twice.
    fn update_last_block_num(&self, observed: u64) -> core::result::Result<(), u64> {
        let prior = self.inner.last_block_num.load(Ordering::Acquire);
        if prior != NO_BLOCK && observed <= prior {
            return Err(prior);
        }
        self.inner.last_block_num.store(observed, Ordering::Release);
        Ok(())
    }

    async fn handle_block(&self, tables: &mut RegistrationTables, block: Block) {
        let block = Arc::new(block);
        if let Err(expected) = self.update_last_block_num(block.number) {
            warn!(expected, observed = block.number, "dropping non-monotonic block");
            return;
        }

        self.publish_block_events(tables, &block).await;
        let filtered = Arc::new(to_filtered_block(&block));
        self.publish_filtered_block_events(tables, filtered).await;
    }

    async fn handle_filtered_block(&self, tables: &mut RegistrationTables, fb: FilteredBlock) {
        if let Err(expected) = self.update_last_block_num(fb.number) {
            warn!(expected, observed = fb.number, "dropping non-monotonic filtered block");
            return;
        }
        self.publish_filtered_block_events(tables, Arc::new(fb)).await;
    }

    async fn publish_block_events(&self, tables: &RegistrationTables, block: &Arc<Block>) {
        for reg in &tables.block {
            if reg.accepts(block) {
                self.deliver(&reg.tx, BlockEvent(block.clone()), "block").await;
            }
        }
    }

    async fn publish_filtered_block_events(&self, tables: &RegistrationTables, fb: Arc<FilteredBlock>) {
        for reg in &tables.filtered_block {
            self.deliver(&reg.tx, FilteredBlockEvent(fb.clone()), "filtered_block").await;
        }

        for tx_entry in &fb.filtered_tx {
            if let Some(reg) = tables.tx_status.iter().find(|reg| reg.txid == tx_entry.txid) {
                let event = TxStatusEvent { txid: tx_entry.txid.clone(), validation_code: tx_entry.validation_code };
                self.deliver(&reg.tx, event, "tx_status").await;
            }

            if !tx_entry.validation_code.is_valid() {
                continue;
            }
            for action in &tx_entry.chaincode_actions {
                if let Some(ccevent) = &action.ccevent {
                    self.publish_cc_events(tables, ccevent).await;
                }
            }
        }
    }

    async fn publish_cc_events(&self, tables: &RegistrationTables, cce: &ChaincodeEventData) {
        for reg in &tables.chaincode {
            if reg.chaincode_id == cce.chaincode_id && reg.filter.is_match(&cce.event_name) {
                let event = ChaincodeEvent {
                    chaincode_id: cce.chaincode_id.clone(),
                    event_name: cce.event_name.clone(),
                    tx_id: cce.tx_id.clone(),
                };
                self.deliver(&reg.tx, event, "chaincode").await;
            }
        }
    }

    async fn publish_connection_event(&self, tables: &RegistrationTables, event: ConnectionEvent) {
        for reg in &tables.connection {
            self.deliver(&reg.tx, event.clone(), "connection").await;
        }
    }

    /// Deliver `item` to `tx` under the configured [`DeliveryTimeout`]
    /// policy. `label` is only used for logging.
    async fn deliver<I: Send + 'static>(&self, tx: &mpsc::Sender<I>, item: I, label: &'static str) {
        match self.inner.config.event_consumer_timeout {
            DeliveryTimeout::NonBlocking => match tx.try_send(item) {
                Ok(()) => trace!(label, "delivered"),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(label, "dropping event: subscriber channel full (non-blocking mode)");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(label, "subscriber channel closed");
                }
            },
            DeliveryTimeout::Blocking => {
                if tx.send(item).await.is_err() {
                    debug!(label, "subscriber channel closed");
                } else {
                    trace!(label, "delivered");
                }
            }
            DeliveryTimeout::Bounded(duration) => match tokio::time::timeout(duration, tx.send(item)).await {
                Ok(Ok(())) => trace!(label, "delivered"),
                Ok(Err(_)) => debug!(label, "subscriber channel closed"),
                Err(_) => warn!(label, "dropping event: subscriber did not accept within timeout"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EnvelopeType, ValidationCode};
    use crate::testing::LoopbackTransport;
    use std::time::Duration;

    fn dispatcher(config: DispatcherConfig) -> Dispatcher<LoopbackTransport> {
        let d = Dispatcher::new(config, LoopbackTransport::default());
        d.start().unwrap();
        d
    }

    fn valid_block_with_cc_event(number: u64, txid: &str, ccid: &str, event_name: &str) -> Block {
        Block {
            number,
            envelopes: vec![Ok(crate::event::Envelope {
                channel_id: "mychannel".into(),
                tx_id: txid.into(),
                tx_type: EnvelopeType::EndorserTransaction,
                ccevent: Some(ChaincodeEventData {
                    chaincode_id: ccid.into(),
                    event_name: event_name.into(),
                    tx_id: txid.into(),
                    payload: vec![],
                }),
            })],
            validation_codes: vec![ValidationCode::Valid],
        }
    }

    #[tokio::test]
    async fn happy_block_fan_out() {
        crate::testing::init_tracing();

        let d = dispatcher(DispatcherConfig::default());

        let (_, mut block_rx_1) = register_block(&d, None).await;
        let (_, mut block_rx_2) = register_block(&d, None).await;
        let (_, mut tx_rx) = register_tx_status(&d, "T1").await;
        let (_, mut cc_rx) = register_chaincode(&d, "C", ".*").await;

        let block = valid_block_with_cc_event(7, "T1", "C", "E");
        d.submit(Event::Block(block)).await.unwrap();

        assert!(block_rx_1.recv().await.is_some());
        assert!(block_rx_2.recv().await.is_some());
        let tx_status = tx_rx.recv().await.unwrap();
        assert_eq!(tx_status.txid, "T1");
        assert_eq!(tx_status.validation_code, ValidationCode::Valid);
        let cc_event = cc_rx.recv().await.unwrap();
        assert_eq!(cc_event.chaincode_id, "C");
        assert_eq!(cc_event.event_name, "E");
        assert_eq!(cc_event.tx_id, "T1");

        assert_eq!(d.last_block_num(), Some(7));
    }

    #[tokio::test]
    async fn invalid_tx_gates_chaincode_event_but_not_tx_status() {
        let d = dispatcher(DispatcherConfig::default());
        let (_, mut tx_rx) = register_tx_status(&d, "T1").await;
        let (_, mut cc_rx) = register_chaincode(&d, "C", ".*").await;

        let mut block = valid_block_with_cc_event(1, "T1", "C", "E");
        block.validation_codes[0] = ValidationCode::InvalidEndorsement;
        d.submit(Event::Block(block)).await.unwrap();

        let tx_status = tx_rx.recv().await.unwrap();
        assert_eq!(tx_status.validation_code, ValidationCode::InvalidEndorsement);
        assert!(cc_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn out_of_order_blocks_are_dropped() {
        let d = dispatcher(DispatcherConfig::default());
        let (_, mut fb_rx) = register_filtered_block(&d).await;

        for number in [5, 7, 6] {
            d.submit(Event::Block(Block { number, envelopes: vec![], validation_codes: vec![] })).await.unwrap();
        }

        let first = fb_rx.recv().await.unwrap();
        assert_eq!(first.0.number, 5);
        let second = fb_rx.recv().await.unwrap();
        assert_eq!(second.0.number, 7);
        assert!(fb_rx.try_recv().is_err(), "block 6 must have been dropped");
        assert_eq!(d.last_block_num(), Some(7));
    }

    #[tokio::test]
    async fn duplicate_tx_status_registration_is_rejected() {
        let d = dispatcher(DispatcherConfig::default());
        let (reply_tx, reply_rx) = oneshot::channel();
        d.submit(Event::RegisterTxStatus { txid: "T1".into(), reply: reply_tx }).await.unwrap();
        let (first_handle, _first_rx) = reply_rx.await.unwrap().unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        d.submit(Event::RegisterTxStatus { txid: "T1".into(), reply: reply_tx }).await.unwrap();
        assert!(matches!(reply_rx.await.unwrap(), Err(EventClientError::DuplicateRegistration)));

        // the first registration must still be unregisterable
        let (reply_tx, reply_rx) = oneshot::channel();
        d.submit(Event::Unregister { handle: first_handle, reply: reply_tx }).await.unwrap();
        assert!(reply_rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_in_non_blocking_mode() {
        let mut config = DispatcherConfig::default();
        config.event_consumer_buffer_size = 1;
        config.event_consumer_timeout = DeliveryTimeout::NonBlocking;
        let d = dispatcher(config);

        let (_, mut fb_rx) = register_filtered_block(&d).await;

        let start = std::time::Instant::now();
        for number in 1..=3 {
            d.submit(Event::FilteredBlock(FilteredBlock { channel_id: "c".into(), number, filtered_tx: vec![] }))
                .await
                .unwrap();
        }
        // dispatcher never blocks on a full, unread subscriber channel
        assert!(start.elapsed() < Duration::from_millis(500));

        let only = fb_rx.recv().await.unwrap();
        assert_eq!(only.0.number, 1);
        assert!(fb_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_closes_the_channel() {
        let d = dispatcher(DispatcherConfig::default());
        let (handle, mut rx) = register_filtered_block(&d).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        d.submit(Event::Unregister { handle, reply: reply_tx }).await.unwrap();
        assert!(reply_rx.await.unwrap().is_ok());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unregister_unknown_handle_errors() {
        let d = dispatcher(DispatcherConfig::default());
        let (handle, _rx) = register_filtered_block(&d).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        d.submit(Event::Unregister { handle, reply: reply_tx }).await.unwrap();
        reply_rx.await.unwrap().unwrap();

        // unregistering the same (now-removed) handle again must fail
        let (reply_tx, reply_rx) = oneshot::channel();
        d.submit(Event::Unregister { handle, reply: reply_tx }).await.unwrap();
        assert!(matches!(reply_rx.await.unwrap(), Err(EventClientError::UnknownRegistration)));
    }

    #[tokio::test]
    async fn stop_closes_every_channel_and_is_idempotent() {
        let d = dispatcher(DispatcherConfig::default());
        let (_, mut block_rx) = register_block(&d, None).await;
        let (_, mut fb_rx) = register_filtered_block(&d).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        d.submit(Event::Stop { reply: reply_tx }).await.unwrap();
        assert!(reply_rx.await.unwrap().is_ok());

        assert!(block_rx.recv().await.is_none());
        assert!(fb_rx.recv().await.is_none());

        // further submits are rejected now that the dispatcher has stopped
        assert!(matches!(
            d.submit(Event::Connected).await,
            Err(EventClientError::DispatcherNotStarted)
        ));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let d = dispatcher(DispatcherConfig::default());
        assert!(matches!(d.start(), Err(EventClientError::DispatcherNotInitial)));
    }

    proptest::proptest! {
        #[test]
        fn last_block_num_is_monotonic_across_random_interleavings(
            blocks in proptest::collection::vec(0u64..1_000, 1..40)
        ) {
            let d = Dispatcher::new(DispatcherConfig::default(), LoopbackTransport::default());
            let mut highest = None;
            for b in blocks {
                let before = d.last_block_num();
                let accepted = d.update_last_block_num(b).is_ok();
                let after = d.last_block_num();
                if accepted {
                    proptest::prop_assert_eq!(after, Some(b));
                    if let Some(h) = highest {
                        proptest::prop_assert!(b > h);
                    }
                    highest = Some(b);
                } else {
                    proptest::prop_assert_eq!(after, before);
                }
            }
        }
    }

    async fn register_block(
        d: &Dispatcher<LoopbackTransport>,
        filter: Option<BlockFilter>,
    ) -> (Registration, mpsc::Receiver<BlockEvent>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        d.submit(Event::RegisterBlock { filter, reply: reply_tx }).await.unwrap();
        reply_rx.await.unwrap().unwrap()
    }

    async fn register_filtered_block(
        d: &Dispatcher<LoopbackTransport>,
    ) -> (Registration, mpsc::Receiver<FilteredBlockEvent>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        d.submit(Event::RegisterFilteredBlock { reply: reply_tx }).await.unwrap();
        reply_rx.await.unwrap().unwrap()
    }

    async fn register_tx_status(
        d: &Dispatcher<LoopbackTransport>,
        txid: &str,
    ) -> (Registration, mpsc::Receiver<TxStatusEvent>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        d.submit(Event::RegisterTxStatus { txid: txid.into(), reply: reply_tx }).await.unwrap();
        reply_rx.await.unwrap().unwrap()
    }

    async fn register_chaincode(
        d: &Dispatcher<LoopbackTransport>,
        chaincode_id: &str,
        filter: &str,
    ) -> (Registration, mpsc::Receiver<ChaincodeEvent>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        d.submit(Event::RegisterChaincode { chaincode_id: chaincode_id.into(), filter: filter.into(), reply: reply_tx })
            .await
            .unwrap();
        reply_rx.await.unwrap().unwrap()
    }
}
