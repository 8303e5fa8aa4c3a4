//! Derives a [`FilteredBlock`] summary from a [`Block`].

use crate::event::{Block, EnvelopeType, FilteredBlock, FilteredChaincodeAction, FilteredTransaction};
use tracing::debug;

/// Convert a [`Block`] into its [`FilteredBlock`] summary.
///
/// For each envelope slot: a decode failure is logged and the slot is
/// skipped entirely (it contributes no [`FilteredTransaction`]). Only
/// [`EnvelopeType::EndorserTransaction`] envelopes may carry a chaincode
/// event forward into `chaincode_actions`. The result's `channel_id` is
/// inherited from the last successfully decoded envelope; if every
/// envelope failed to decode, it is empty.
pub fn to_filtered_block(block: &Block) -> FilteredBlock {
    let mut channel_id = String::new();
    let mut filtered_tx = Vec::with_capacity(block.envelopes.len());

    for (index, slot) in block.envelopes.iter().enumerate() {
        let envelope = match slot {
            Ok(envelope) => envelope,
            Err(reason) => {
                debug!(block = block.number, index, %reason, "skipping envelope that failed to decode");
                continue;
            }
        };

        channel_id = envelope.channel_id.clone();

        let validation_code = block.validation_code_at(index).unwrap_or_else(|| {
            debug!(block = block.number, index, "missing validation code, defaulting to Other(0xff)");
            crate::event::ValidationCode::Other(0xff)
        });

        let chaincode_actions = if matches!(envelope.tx_type, EnvelopeType::EndorserTransaction) {
            match &envelope.ccevent {
                Some(ccevent) => vec![FilteredChaincodeAction { ccevent: Some(ccevent.clone()) }],
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        filtered_tx.push(FilteredTransaction {
            txid: envelope.tx_id.clone(),
            tx_type: envelope.tx_type,
            validation_code,
            chaincode_actions,
        });
    }

    FilteredBlock { channel_id, number: block.number, filtered_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChaincodeEventData, Envelope, ValidationCode};

    fn endorser_envelope(channel: &str, tx_id: &str, ccevent: Option<ChaincodeEventData>) -> Envelope {
        Envelope {
            channel_id: channel.to_string(),
            tx_id: tx_id.to_string(),
            tx_type: EnvelopeType::EndorserTransaction,
            ccevent,
        }
    }

    #[test]
    fn derives_one_entry_per_successfully_decoded_envelope() {
        let block = Block {
            number: 7,
            envelopes: vec![
                Ok(endorser_envelope("mychannel", "T1", None)),
                Err("malformed payload".into()),
                Ok(endorser_envelope("mychannel", "T2", None)),
            ],
            validation_codes: vec![ValidationCode::Valid, ValidationCode::Valid, ValidationCode::Valid],
        };

        let fb = to_filtered_block(&block);
        assert_eq!(fb.number, 7);
        assert_eq!(fb.channel_id, "mychannel");
        assert_eq!(fb.filtered_tx.len(), 2);
        assert_eq!(fb.filtered_tx[0].txid, "T1");
        assert_eq!(fb.filtered_tx[1].txid, "T2");
    }

    #[test]
    fn carries_chaincode_event_only_for_endorser_transactions() {
        let cc = ChaincodeEventData {
            chaincode_id: "cc".into(),
            event_name: "E".into(),
            tx_id: "T1".into(),
            payload: vec![],
        };
        let block = Block {
            number: 1,
            envelopes: vec![
                Ok(endorser_envelope("c", "T1", Some(cc.clone()))),
                Ok(Envelope {
                    channel_id: "c".into(),
                    tx_id: "T2".into(),
                    tx_type: EnvelopeType::ConfigUpdate,
                    ccevent: None,
                }),
            ],
            validation_codes: vec![ValidationCode::Valid, ValidationCode::Valid],
        };

        let fb = to_filtered_block(&block);
        assert_eq!(fb.filtered_tx[0].chaincode_actions.len(), 1);
        assert_eq!(fb.filtered_tx[0].chaincode_actions[0].ccevent.as_ref(), Some(&cc));
        assert!(fb.filtered_tx[1].chaincode_actions.is_empty());
    }

    #[test]
    fn channel_id_inherited_from_last_decoded_envelope() {
        let block = Block {
            number: 2,
            envelopes: vec![Ok(endorser_envelope("first", "T1", None)), Ok(endorser_envelope("second", "T2", None))],
            validation_codes: vec![ValidationCode::Valid, ValidationCode::Valid],
        };
        assert_eq!(to_filtered_block(&block).channel_id, "second");
    }

    #[test]
    fn empty_channel_id_when_every_envelope_fails_to_decode() {
        let block = Block {
            number: 3,
            envelopes: vec![Err("bad".into())],
            validation_codes: vec![ValidationCode::Valid],
        };
        let fb = to_filtered_block(&block);
        assert_eq!(fb.channel_id, "");
        assert!(fb.filtered_tx.is_empty());
    }
}
