//! Node JSON → chain records.
//!
//! Hashes, addresses and byte strings deserialize directly through
//! `alloy-primitives`; hex quantities are carried as strings and converted
//! explicitly so a malformed field is reported rather than read as zero.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::Deserialize;
use serde_json::{json, Value};

use chainfeed_core::{Block, BlockHeader, Log, LogFilter, Transaction};

use crate::error::TransportError;

/// Parse a `0x`-prefixed hex quantity to u64.
pub fn parse_hex_u64(field: &'static str, s: &str) -> Result<u64, TransportError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|_| TransportError::invalid(field, s))
}

/// Parse a `0x`-prefixed hex quantity to U256.
pub fn parse_hex_u256(field: &'static str, s: &str) -> Result<U256, TransportError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    U256::from_str_radix(digits, 16).map_err(|_| TransportError::invalid(field, s))
}

/// A `newHeads` notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHeader {
    pub number: String,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: String,
}

impl RawHeader {
    pub fn into_header(self) -> Result<BlockHeader, TransportError> {
        Ok(BlockHeader {
            number: parse_hex_u64("number", &self.number)?,
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp: parse_hex_u64("timestamp", &self.timestamp)?,
        })
    }
}

/// A transaction object from `eth_getBlockByHash(hash, true)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub hash: B256,
    pub transaction_index: String,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: String,
    pub gas_price: Option<String>,
    pub gas: String,
    pub nonce: String,
    #[serde(default)]
    pub input: Bytes,
}

impl RawTransaction {
    pub fn into_transaction(self) -> Result<Transaction, TransportError> {
        let gas_price = match &self.gas_price {
            Some(p) => parse_hex_u256("gasPrice", p)?,
            None => U256::ZERO,
        };
        Ok(Transaction {
            hash: self.hash,
            transaction_index: parse_hex_u64("transactionIndex", &self.transaction_index)?,
            from: self.from,
            to: self.to,
            value: parse_hex_u256("value", &self.value)?,
            gas_price,
            gas: parse_hex_u64("gas", &self.gas)?,
            nonce: parse_hex_u64("nonce", &self.nonce)?,
            input: self.input,
        })
    }
}

/// A block from `eth_getBlockByHash(hash, true)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    pub number: String,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: String,
    pub gas_used: String,
    pub gas_limit: String,
    #[serde(default)]
    pub transactions: Vec<RawTransaction>,
}

impl RawBlock {
    pub fn into_block(self) -> Result<Block, TransportError> {
        let transactions = self
            .transactions
            .into_iter()
            .map(RawTransaction::into_transaction)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Block {
            number: parse_hex_u64("number", &self.number)?,
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp: parse_hex_u64("timestamp", &self.timestamp)?,
            gas_used: parse_hex_u64("gasUsed", &self.gas_used)?,
            gas_limit: parse_hex_u64("gasLimit", &self.gas_limit)?,
            transactions,
        })
    }
}

/// A log from a `logs` subscription.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
    pub block_number: String,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub log_index: String,
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn into_log(self) -> Result<Log, TransportError> {
        Ok(Log {
            address: self.address,
            topics: self.topics,
            data: self.data,
            block_number: parse_hex_u64("blockNumber", &self.block_number)?,
            block_hash: self.block_hash,
            transaction_hash: self.transaction_hash,
            log_index: parse_hex_u64("logIndex", &self.log_index)?,
            removed: self.removed.unwrap_or(false),
        })
    }
}

pub fn header_from_json(v: Value) -> Result<BlockHeader, TransportError> {
    serde_json::from_value::<RawHeader>(v)?.into_header()
}

pub fn block_from_json(v: Value) -> Result<Block, TransportError> {
    serde_json::from_value::<RawBlock>(v)?.into_block()
}

pub fn log_from_json(v: Value) -> Result<Log, TransportError> {
    serde_json::from_value::<RawLog>(v)?.into_log()
}

/// Build the `eth_subscribe("logs", ...)` filter object.
pub fn log_filter_params(filter: &LogFilter) -> Value {
    let mut obj = serde_json::Map::new();
    match filter.addresses.as_slice() {
        [] => {}
        [one] => {
            obj.insert("address".into(), json!(one));
        }
        many => {
            obj.insert("address".into(), json!(many));
        }
    }
    if !filter.topics.is_empty() {
        let topics: Vec<Value> = filter
            .topics
            .iter()
            .map(|pos| match pos.as_slice() {
                [] => Value::Null,
                [one] => json!(one),
                many => json!(many),
            })
            .collect();
        obj.insert("topics".into(), Value::Array(topics));
    }
    Value::Object(obj)
}
