//! Ledger data types and the payloads delivered to subscribers.
//!
//! The wire-level envelope/payload/proposal-response structures a real
//! transport binds to are out of scope (see the crate's top-level docs);
//! [`Envelope`] models the already-decoded shape a concrete transport
//! produces, which is all [`crate::filtered::to_filtered_block`] needs.

use std::sync::Arc;

/// A transaction's validation outcome, as recorded in a block's metadata or
/// a filtered block's per-transaction entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationCode {
    /// The transaction was endorsed and committed.
    Valid,
    /// Endorsement policy was not satisfied.
    InvalidEndorsement,
    /// MVCC read conflict with a concurrently committed transaction.
    MvccReadConflict,
    /// Any validation outcome not named above, carrying the raw code.
    Other(u8),
}

impl ValidationCode {
    /// True for [`ValidationCode::Valid`].
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Decode a raw per-transaction validation byte.
    pub const fn from_raw(byte: u8) -> Self {
        match byte {
            0 => Self::Valid,
            1 => Self::InvalidEndorsement,
            11 => Self::MvccReadConflict,
            other => Self::Other(other),
        }
    }
}

/// The kind of a decoded envelope's channel header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    /// An ordinary endorser transaction; the only type that may carry a
    /// chaincode event.
    EndorserTransaction,
    /// A channel configuration update.
    ConfigUpdate,
    /// Any other channel header type.
    Other(i32),
}

/// An application-level event emitted by on-ledger code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaincodeEventData {
    /// The chaincode that emitted the event.
    pub chaincode_id: String,
    /// The event's name, matched against a [`ChaincodeReg`]'s compiled
    /// filter.
    ///
    /// [`ChaincodeReg`]: crate::registration::ChaincodeReg
    pub event_name: String,
    /// The id of the transaction that emitted the event.
    pub tx_id: String,
    /// The event's opaque payload.
    pub payload: Vec<u8>,
}

/// A single decoded envelope from a [`Block`]'s transaction list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// The channel this envelope was submitted on.
    pub channel_id: String,
    /// The transaction id.
    pub tx_id: String,
    /// The envelope's channel header type.
    pub tx_type: EnvelopeType,
    /// The chaincode event embedded in this envelope's proposal response,
    /// if any. Only ever present when `tx_type` is
    /// [`EnvelopeType::EndorserTransaction`].
    pub ccevent: Option<ChaincodeEventData>,
}

/// The result of decoding a single envelope slot in a block. A real
/// transport's protobuf layer is what can fail here (see the crate's
/// top-level docs on the out-of-scope wire protocol); a decode failure is
/// logged and the slot skipped by [`crate::filtered::to_filtered_block`],
/// never surfaced to subscribers.
pub type EnvelopeSlot = Result<Envelope, String>;

/// A raw ledger block.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// The block number. Monotonically increasing within a channel.
    pub number: u64,
    /// Envelope slots in this block, in delivery order. A slot is `Err`
    /// when the transport could not decode that envelope.
    pub envelopes: Vec<EnvelopeSlot>,
    /// Per-envelope validation codes, same length and order as
    /// `envelopes`, regardless of whether the envelope itself decoded.
    pub validation_codes: Vec<ValidationCode>,
}

impl Block {
    /// The validation code for the envelope at `index`, if present.
    pub fn validation_code_at(&self, index: usize) -> Option<ValidationCode> {
        self.validation_codes.get(index).copied()
    }
}

/// A single chaincode action inside a [`FilteredTransaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredChaincodeAction {
    /// The embedded chaincode event, if the action's proposal response
    /// carried one.
    pub ccevent: Option<ChaincodeEventData>,
}

/// The summary form of one transaction inside a [`FilteredBlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredTransaction {
    /// The transaction id.
    pub txid: String,
    /// The envelope's channel header type.
    pub tx_type: EnvelopeType,
    /// The transaction's validation outcome.
    pub validation_code: ValidationCode,
    /// Chaincode actions carried by this transaction. Populated only for
    /// [`EnvelopeType::EndorserTransaction`] envelopes that embedded a
    /// chaincode event.
    pub chaincode_actions: Vec<FilteredChaincodeAction>,
}

/// The summary form of a [`Block`], as derived by
/// [`crate::filtered::to_filtered_block`] or received directly from a
/// transport that only speaks filtered blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredBlock {
    /// The channel this block belongs to. Inherited from the last
    /// successfully decoded envelope when derived from a [`Block`].
    pub channel_id: String,
    /// The block number.
    pub number: u64,
    /// Per-transaction summaries, in block order.
    pub filtered_tx: Vec<FilteredTransaction>,
}

/// Delivered to every matching `BlockReg` subscriber.
#[derive(Debug, Clone)]
pub struct BlockEvent(pub Arc<Block>);

/// Delivered to every `FilteredBlockReg` subscriber.
#[derive(Debug, Clone)]
pub struct FilteredBlockEvent(pub Arc<FilteredBlock>);

/// Delivered to the `TxStatusReg` matching a transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStatusEvent {
    /// The transaction id.
    pub txid: String,
    /// The transaction's validation outcome.
    pub validation_code: ValidationCode,
}

/// Delivered to every `ChaincodeReg` whose chaincode id and event-name
/// filter match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaincodeEvent {
    /// The chaincode that emitted the event.
    pub chaincode_id: String,
    /// The event's name.
    pub event_name: String,
    /// The id of the transaction that emitted the event.
    pub tx_id: String,
}

/// Describes a transport connection transition, delivered to every
/// `ConnectionReg` subscriber.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// `true` if the transport is now connected.
    pub connected: bool,
    /// A human-readable description of the failure, when `connected` is
    /// `false` and the transition was caused by an error rather than a
    /// deliberate `Disconnect`.
    pub err: Option<Arc<str>>,
}

impl ConnectionEvent {
    /// Build a successful connection transition.
    pub const fn connected() -> Self {
        Self { connected: true, err: None }
    }

    /// Build a disconnection transition with no associated error
    /// (deliberate disconnect).
    pub const fn disconnected() -> Self {
        Self { connected: false, err: None }
    }

    /// Build a disconnection transition caused by a transport failure.
    pub fn failed(err: impl Into<Arc<str>>) -> Self {
        Self { connected: false, err: Some(err.into()) }
    }
}
