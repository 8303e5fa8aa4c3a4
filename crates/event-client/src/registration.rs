//! Registration handles and the tables that back them.
//!
//! Every table here is owned exclusively by [`Dispatcher`]'s processing
//! loop; nothing outside that loop ever reads or writes
//! them, so plain owned collections are used instead of concurrent maps.
//!
//! [`Dispatcher`]: crate::dispatcher::Dispatcher

use crate::event::{Block, BlockEvent, ChaincodeEvent, ConnectionEvent, FilteredBlockEvent, TxStatusEvent};
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A predicate used by a `BlockReg` to decide whether a given block should
/// be delivered. The default (`None` on [`crate::client::Client::register_block_event`])
/// accepts every block.
pub type BlockFilter = Arc<dyn Fn(&Block) -> bool + Send + Sync>;

/// Opaque, dispatcher-assigned identity for a single registration.
///
/// Stable for the lifetime of the registration; used for identity-based
/// removal (spec: "The removal predicate is identity ... not structural
/// equality").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegId(u64);

/// Monotonically allocates [`RegId`]s. Lives on the dispatcher, but the
/// counter itself is atomic so it can be read without borrowing the
/// dispatcher's other state.
#[derive(Debug, Default)]
pub(crate) struct RegIdAllocator(AtomicU64);

impl RegIdAllocator {
    pub(crate) fn next(&self) -> RegId {
        RegId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// An opaque handle returned by a `Register*` call and consumed by
/// `unregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Registration {
    /// A `BlockReg` handle.
    Block(RegId),
    /// A `FilteredBlockReg` handle.
    FilteredBlock(RegId),
    /// A `TxStatusReg` handle.
    TxStatus(RegId),
    /// A `ChaincodeReg` handle.
    Chaincode(RegId),
    /// A `ConnectionReg` handle.
    Connection(RegId),
}

/// A registered block-event subscriber.
pub struct BlockReg {
    pub(crate) id: RegId,
    pub(crate) filter: Option<BlockFilter>,
    pub(crate) tx: mpsc::Sender<BlockEvent>,
}

impl core::fmt::Debug for BlockReg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockReg")
            .field("id", &self.id)
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

impl BlockReg {
    /// True if this registration accepts the given block.
    pub(crate) fn accepts(&self, block: &Block) -> bool {
        self.filter.as_ref().map_or(true, |f| f(block))
    }
}

/// A registered filtered-block subscriber.
#[derive(Debug)]
pub struct FilteredBlockReg {
    pub(crate) id: RegId,
    pub(crate) tx: mpsc::Sender<FilteredBlockEvent>,
}

/// A registered transaction-status subscriber, keyed by an exact
/// transaction id.
#[derive(Debug)]
pub struct TxStatusReg {
    pub(crate) id: RegId,
    pub(crate) txid: String,
    pub(crate) tx: mpsc::Sender<TxStatusEvent>,
}

/// A registered chaincode-event subscriber, keyed by chaincode id plus its
/// compiled event-name filter.
#[derive(Debug)]
pub struct ChaincodeReg {
    pub(crate) id: RegId,
    pub(crate) chaincode_id: String,
    pub(crate) filter_src: String,
    pub(crate) filter: Regex,
    pub(crate) tx: mpsc::Sender<ChaincodeEvent>,
}

impl ChaincodeReg {
    /// The compound key this registration is stored under:
    /// `"{chaincode_id}/{filter_src}"`.
    pub(crate) fn key(chaincode_id: &str, filter_src: &str) -> String {
        format!("{chaincode_id}/{filter_src}")
    }
}

/// A registered connection-event subscriber.
#[derive(Debug)]
pub struct ConnectionReg {
    pub(crate) id: RegId,
    pub(crate) tx: mpsc::Sender<ConnectionEvent>,
}

/// All subscription tables owned by the dispatcher loop.
#[derive(Debug, Default)]
pub(crate) struct RegistrationTables {
    pub(crate) block: Vec<BlockReg>,
    pub(crate) filtered_block: Vec<FilteredBlockReg>,
    pub(crate) tx_status: Vec<TxStatusReg>,
    pub(crate) chaincode: Vec<ChaincodeReg>,
    pub(crate) connection: Vec<ConnectionReg>,
}

impl RegistrationTables {
    /// Remove and close the registration identified by `handle`.
    ///
    /// Returns `true` if a registration was found and removed.
    pub(crate) fn remove(&mut self, handle: Registration) -> bool {
        match handle {
            Registration::Block(id) => swap_remove_by_id(&mut self.block, id, |r| r.id),
            Registration::FilteredBlock(id) => swap_remove_by_id(&mut self.filtered_block, id, |r| r.id),
            Registration::TxStatus(id) => swap_remove_by_id(&mut self.tx_status, id, |r| r.id),
            Registration::Chaincode(id) => swap_remove_by_id(&mut self.chaincode, id, |r| r.id),
            Registration::Connection(id) => swap_remove_by_id(&mut self.connection, id, |r| r.id),
        }
    }

    /// Drop every registration, closing all outbound channels. Leaves the
    /// tables empty. Closing happens implicitly: dropping the last
    /// `mpsc::Sender` closes the channel for its receiver.
    pub(crate) fn clear_all(&mut self) {
        self.block.clear();
        self.filtered_block.clear();
        self.tx_status.clear();
        self.chaincode.clear();
        self.connection.clear();
    }

    /// Total number of live registrations across every table.
    pub(crate) fn len(&self) -> usize {
        self.block.len()
            + self.filtered_block.len()
            + self.tx_status.len()
            + self.chaincode.len()
            + self.connection.len()
    }
}

/// Find `id` in `items` by its id accessor and remove it via
/// swap-with-last, which is O(1) since subscriber order is not observable.
fn swap_remove_by_id<T>(items: &mut Vec<T>, id: RegId, id_of: impl Fn(&T) -> RegId) -> bool {
    if let Some(pos) = items.iter().position(|item| id_of(item) == id) {
        items.swap_remove(pos);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_id_allocator_is_monotone_and_unique() {
        let alloc = RegIdAllocator::default();
        let a = alloc.next();
        let b = alloc.next();
        let c = alloc.next();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn chaincode_key_is_compound() {
        assert_eq!(ChaincodeReg::key("cc", ".*"), "cc/.*");
    }

    #[tokio::test]
    async fn swap_remove_drops_only_matching_registration() {
        let mut tables = RegistrationTables::default();
        let alloc = RegIdAllocator::default();

        let (tx1, mut rx1) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(1);
        let id1 = alloc.next();
        let id2 = alloc.next();
        tables.filtered_block.push(FilteredBlockReg { id: id1, tx: tx1 });
        tables.filtered_block.push(FilteredBlockReg { id: id2, tx: tx2 });

        assert!(tables.remove(Registration::FilteredBlock(id1)));
        assert_eq!(tables.filtered_block.len(), 1);
        assert!(rx1.recv().await.is_none(), "removed registration's channel must be closed");
        assert!(!tables.remove(Registration::FilteredBlock(id1)), "double-removal is a no-op");

        // the surviving registration's sender must still be usable
        assert!(tables.filtered_block[0].tx.try_send(FilteredBlockEvent(Arc::new(crate::event::FilteredBlock {
            channel_id: "c".into(),
            number: 1,
            filtered_tx: vec![],
        }))).is_ok());
        assert!(rx2.recv().await.is_some());
    }
}
