//! The uniform event model produced by the listener.

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::EventError;
use crate::types::{Block, Log, Transaction};

/// The three kinds of event the listener emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewBlock,
    NewTransaction,
    #[serde(rename = "contract_event")]
    ContractLog,
}

impl EventKind {
    /// Every kind, in emission order for a block.
    pub const ALL: [EventKind; 3] = [
        EventKind::NewBlock,
        EventKind::NewTransaction,
        EventKind::ContractLog,
    ];

    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewBlock => "new_block",
            Self::NewTransaction => "new_transaction",
            Self::ContractLog => "contract_event",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_block" => Ok(Self::NewBlock),
            "new_transaction" => Ok(Self::NewTransaction),
            "contract_event" => Ok(Self::ContractLog),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// The record an event carries. Blocks are reference-counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Block(Arc<Block>),
    Transaction(Transaction),
    Log(Log),
}

/// A normalized chain event. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    kind: EventKind,
    block_hash: B256,
    block_number: u64,
    tx_hash: Option<B256>,
    payload: EventPayload,
}

impl Event {
    /// A `NewBlock` event for `block`.
    pub fn new_block(block: Arc<Block>) -> Result<Self, EventError> {
        check_number(block.hash, block.number)?;
        Ok(Self {
            kind: EventKind::NewBlock,
            block_hash: block.hash,
            block_number: block.number,
            tx_hash: None,
            payload: EventPayload::Block(block),
        })
    }

    /// A `NewTransaction` event for `tx`, included in the given block.
    pub fn new_transaction(
        block_hash: B256,
        block_number: u64,
        tx: Transaction,
    ) -> Result<Self, EventError> {
        check_number(block_hash, block_number)?;
        Ok(Self {
            kind: EventKind::NewTransaction,
            block_hash,
            block_number,
            tx_hash: Some(tx.hash),
            payload: EventPayload::Transaction(tx),
        })
    }

    /// A `ContractLog` event for `log`.
    pub fn contract_log(log: Log) -> Result<Self, EventError> {
        check_number(log.block_hash, log.block_number)?;
        Ok(Self {
            kind: EventKind::ContractLog,
            block_hash: log.block_hash,
            block_number: log.block_number,
            tx_hash: Some(log.transaction_hash),
            payload: EventPayload::Log(log),
        })
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn block_hash(&self) -> B256 {
        self.block_hash
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    /// Transaction hash; `None` for block events.
    pub fn tx_hash(&self) -> Option<B256> {
        self.tx_hash
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// The transaction carried by a `NewTransaction` event.
    pub fn transaction(&self) -> Option<&Transaction> {
        match &self.payload {
            EventPayload::Transaction(tx) => Some(tx),
            _ => None,
        }
    }

    /// The log carried by a `ContractLog` event.
    pub fn log(&self) -> Option<&Log> {
        match &self.payload {
            EventPayload::Log(log) => Some(log),
            _ => None,
        }
    }
}

fn check_number(hash: B256, number: u64) -> Result<(), EventError> {
    if number == 0 {
        return Err(EventError::ZeroBlockNumber { hash });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::sample_block;

    #[test]
    fn kind_wire_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert!("pending".parse::<EventKind>().is_err());
    }

    #[test]
    fn block_zero_is_rejected() {
        let block = sample_block(0, 1);
        let err = Event::new_block(Arc::new(block.clone())).unwrap_err();
        assert_eq!(err, EventError::ZeroBlockNumber { hash: block.hash });

        let tx = block.transactions[0].clone();
        assert!(Event::new_transaction(block.hash, 0, tx).is_err());
    }

    #[test]
    fn transaction_event_carries_hashes() {
        let block = sample_block(7, 2);
        let tx = block.transactions[1].clone();
        let ev = Event::new_transaction(block.hash, block.number, tx.clone()).unwrap();
        assert_eq!(ev.kind(), EventKind::NewTransaction);
        assert_eq!(ev.block_number(), 7);
        assert_eq!(ev.tx_hash(), Some(tx.hash));
        assert_eq!(ev.transaction(), Some(&tx));
        assert!(ev.log().is_none());
    }

    #[test]
    fn block_event_has_no_tx_hash() {
        let block = Arc::new(sample_block(3, 0));
        let ev = Event::new_block(block.clone()).unwrap();
        assert_eq!(ev.tx_hash(), None);
        assert_eq!(ev.block_hash(), block.hash);
        assert_eq!(ev.payload(), &EventPayload::Block(block));
    }
}
