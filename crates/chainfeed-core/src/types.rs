//! Chain records carried inside events.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// A new-head notification, enough to fetch the full block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: u64,
}

impl BlockHeader {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A full block with its transactions in index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The header view of this block.
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            number: self.number,
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp: self.timestamp,
        }
    }

    /// Number of transactions in the block.
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}

// ─── Transaction ──────────────────────────────────────────────────────────────

/// A transaction as included in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: B256,
    /// Position of the transaction within its block.
    pub transaction_index: u64,
    /// Sender as reported by the node, if any.
    pub from: Option<Address>,
    /// Recipient; `None` for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: U256,
    /// Gas limit.
    pub gas: u64,
    pub nonce: u64,
    pub input: Bytes,
}

impl Transaction {
    /// Returns `true` if this transaction deploys a contract.
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }

    /// The 4-byte method selector, if the input is long enough to carry one.
    pub fn method_id(&self) -> Option<[u8; 4]> {
        let selector = self.input.get(..4)?;
        let mut out = [0u8; 4];
        out.copy_from_slice(selector);
        Some(out)
    }
}

// ─── Log ──────────────────────────────────────────────────────────────────────

/// A contract log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// Contract that emitted the log.
    pub address: Address,
    /// topics[0] is the event signature hash; the rest are indexed params.
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub log_index: u64,
    /// `true` if the log was dropped by a chain reorganization.
    #[serde(default)]
    pub removed: bool,
}

// ─── LogFilter ────────────────────────────────────────────────────────────────

/// Address and topic constraints for a log subscription.
///
/// `topics[i]` lists the accepted values for position `i`; an empty list
/// at a position accepts anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    /// Only logs from these contracts (empty = all contracts).
    pub addresses: Vec<Address>,
    pub topics: Vec<Vec<B256>>,
}

impl LogFilter {
    /// Create a filter for a single contract address.
    pub fn address(addr: Address) -> Self {
        Self {
            addresses: vec![addr],
            ..Default::default()
        }
    }

    /// Constrain topic[0] to one of `values`.
    pub fn topic0(mut self, values: Vec<B256>) -> Self {
        if self.topics.is_empty() {
            self.topics.push(values);
        } else {
            self.topics[0] = values;
        }
        self
    }

    /// Returns `true` if `log` satisfies the address and topic constraints.
    pub fn matches(&self, log: &Log) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, accepted)| {
            accepted.is_empty()
                || log
                    .topics
                    .get(i)
                    .map(|topic| accepted.contains(topic))
                    .unwrap_or(false)
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
