//! Enriched transaction view and sender recovery.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::Serialize;

use crate::types::Transaction;

/// A transaction plus the context the processor derives for it.
///
/// Built once per `NewTransaction` event and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    /// Recovered sender; `None` when recovery failed.
    pub from: Option<Address>,
    /// Recipient; `None` for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: U256,
    pub gas: u64,
    pub input: Bytes,
    /// `true` iff the input is non-empty and there is a recipient.
    pub is_contract_call: bool,
}

impl TransactionInfo {
    pub fn new(
        block_hash: B256,
        block_number: u64,
        tx: &Transaction,
        from: Option<Address>,
    ) -> Self {
        Self {
            hash: tx.hash,
            block_hash,
            block_number,
            from,
            to: tx.to,
            value: tx.value,
            gas_price: tx.gas_price,
            gas: tx.gas,
            input: tx.input.clone(),
            is_contract_call: !tx.input.is_empty() && tx.to.is_some(),
        }
    }
}

/// Determines the sender of a transaction.
///
/// Recovery is best-effort: return `None` rather than a placeholder
/// address when the sender cannot be established.
///
/// The default, [`ReportedSender`], does not verify signatures. It uses the
/// `from` the node reports, which every mainstream client fills in from
/// the signature already. Plug in an implementation that recovers from
/// `(v, r, s)` via [`TransactionProcessor::with_recovery`] when the upstream
/// is not trusted.
///
/// [`TransactionProcessor::with_recovery`]: crate::TransactionProcessor::with_recovery
pub trait SenderRecovery: Send + Sync {
    fn recover(&self, tx: &Transaction) -> Option<Address>;
}

/// Trusts the `from` field reported by the node. The zero address is
/// treated as unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportedSender;

impl SenderRecovery for ReportedSender {
    fn recover(&self, tx: &Transaction) -> Option<Address> {
        tx.from.filter(|addr| !addr.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::sample_block;

    #[test]
    fn contract_call_needs_input_and_recipient() {
        let block = sample_block(5, 1);
        let mut tx = block.transactions[0].clone();

        tx.input = Bytes::new();
        let info = TransactionInfo::new(block.hash, 5, &tx, tx.from);
        assert!(!info.is_contract_call);

        tx.input = Bytes::from(vec![0xa9, 0x05, 0x9c, 0xbb]);
        let info = TransactionInfo::new(block.hash, 5, &tx, tx.from);
        assert!(info.is_contract_call);

        tx.to = None;
        let info = TransactionInfo::new(block.hash, 5, &tx, tx.from);
        assert!(!info.is_contract_call);
    }

    #[test]
    fn reported_sender_rejects_zero_address() {
        let block = sample_block(5, 1);
        let mut tx = block.transactions[0].clone();
        assert_eq!(ReportedSender.recover(&tx), tx.from);

        tx.from = Some(Address::ZERO);
        assert_eq!(ReportedSender.recover(&tx), None);

        tx.from = None;
        assert_eq!(ReportedSender.recover(&tx), None);
    }
}
