//! Wire protocol between the hub and its subscribers.
//!
//! Server → client messages are serialized once per event and shared by
//! every connection as an `Arc<str>`.

use alloy_primitives::{Address, B256};
use chainfeed_core::{Event, EventKind, EventPayload, TransactionInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The `type` of a server → client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    NewBlock,
    NewTransaction,
    ContractEvent,
    HighValueTransaction,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewBlock => "new_block",
            Self::NewTransaction => "new_transaction",
            Self::ContractEvent => "contract_event",
            Self::HighValueTransaction => "high_value_transaction",
        }
    }
}

impl From<EventKind> for MessageKind {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::NewBlock => Self::NewBlock,
            EventKind::NewTransaction => Self::NewTransaction,
            EventKind::ContractLog => Self::ContractEvent,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_block" => Ok(Self::NewBlock),
            "new_transaction" => Ok(Self::NewTransaction),
            "contract_event" => Ok(Self::ContractEvent),
            "high_value_transaction" => Ok(Self::HighValueTransaction),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventEnvelope<'a> {
    #[serde(rename = "type")]
    kind: MessageKind,
    block_hash: B256,
    block_num: u64,
    tx_hash: Option<B256>,
    data: &'a EventPayload,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HighValueEnvelope {
    #[serde(rename = "type")]
    kind: MessageKind,
    hash: B256,
    from: Option<Address>,
    to: Option<Address>,
    /// Decimal wei.
    value: String,
    block_hash: B256,
}

/// A serialized message ready to be queued on any number of connections.
#[derive(Debug, Clone)]
pub struct WireMessage {
    kind: MessageKind,
    contract: Option<Address>,
    payload: Arc<str>,
}

impl WireMessage {
    /// `{type, blockHash, blockNum, txHash, data}` for a chain event.
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        let kind = MessageKind::from(event.kind());
        let json = serde_json::to_string(&EventEnvelope {
            kind,
            block_hash: event.block_hash(),
            block_num: event.block_number(),
            tx_hash: event.tx_hash(),
            data: event.payload(),
        })?;
        Ok(Self {
            kind,
            contract: event.log().map(|log| log.address),
            payload: json.into(),
        })
    }

    /// `{type: "high_value_transaction", hash, from, to, value, blockHash}`.
    pub fn high_value(info: &TransactionInfo) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(&HighValueEnvelope {
            kind: MessageKind::HighValueTransaction,
            hash: info.hash,
            from: info.from,
            to: info.to,
            value: info.value.to_string(),
            block_hash: info.block_hash,
        })?;
        Ok(Self {
            kind: MessageKind::HighValueTransaction,
            contract: None,
            payload: json.into(),
        })
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Emitting contract, for `contract_event` messages.
    pub fn contract(&self) -> Option<Address> {
        self.contract
    }

    pub fn payload(&self) -> &Arc<str> {
        &self.payload
    }
}

// ─── Interest ─────────────────────────────────────────────────────────────────

/// What a subscriber asked to receive.
///
/// An empty kind set admits every kind. The contract set only constrains
/// `contract_event` messages; empty admits every contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interest {
    pub kinds: HashSet<MessageKind>,
    pub contracts: HashSet<Address>,
}

impl Interest {
    pub fn admits(&self, msg: &WireMessage) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&msg.kind) {
            return false;
        }
        if msg.kind == MessageKind::ContractEvent && !self.contracts.is_empty() {
            return msg
                .contract
                .map(|c| self.contracts.contains(&c))
                .unwrap_or(false);
        }
        true
    }
}

// ─── Client → server ──────────────────────────────────────────────────────────

/// Control messages a subscriber may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a log subscription for `contract`; no `events` means every event.
    Subscribe {
        contract: Address,
        #[serde(default)]
        events: Vec<String>,
    },
    /// Replace the provided parts of the interest set.
    Filter {
        #[serde(rename = "eventTypes", default)]
        event_types: Option<Vec<String>>,
        #[serde(default)]
        contracts: Option<Vec<Address>>,
    },
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use chainfeed_core::mock::{sample_block, sample_log};
    use serde_json::Value;

    #[test]
    fn block_message_shape() {
        let block = Arc::new(sample_block(42, 1));
        let ev = Event::new_block(block.clone()).unwrap();
        let msg = WireMessage::from_event(&ev).unwrap();
        let v: Value = serde_json::from_str(msg.payload()).unwrap();

        assert_eq!(v["type"], "new_block");
        assert_eq!(v["blockNum"], 42);
        assert_eq!(v["blockHash"], serde_json::to_value(block.hash).unwrap());
        assert!(v["txHash"].is_null());
        assert_eq!(v["data"]["number"], 42);
        assert_eq!(v["data"]["transactions"].as_array().unwrap().len(), 1);
        assert_eq!(msg.contract(), None);
    }

    #[test]
    fn contract_message_carries_address() {
        let contract = Address::repeat_byte(0xcc);
        let ev = Event::contract_log(sample_log(contract, 9, 0)).unwrap();
        let msg = WireMessage::from_event(&ev).unwrap();
        assert_eq!(msg.kind(), MessageKind::ContractEvent);
        assert_eq!(msg.contract(), Some(contract));
        let v: Value = serde_json::from_str(msg.payload()).unwrap();
        assert_eq!(v["type"], "contract_event");
        assert!(v["txHash"].is_string());
    }

    #[test]
    fn high_value_message_shape() {
        let block = sample_block(7, 1);
        let tx = &block.transactions[0];
        let mut info = TransactionInfo::new(block.hash, 7, tx, None);
        info.value = U256::from(10u64).pow(U256::from(18u64));
        info.to = None;

        let msg = WireMessage::high_value(&info).unwrap();
        let v: Value = serde_json::from_str(msg.payload()).unwrap();
        assert_eq!(v["type"], "high_value_transaction");
        assert_eq!(v["value"], "1000000000000000000");
        assert!(v["from"].is_null());
        assert!(v["to"].is_null());
        assert_eq!(v["hash"], serde_json::to_value(tx.hash).unwrap());
    }

    #[test]
    fn interest_admits() {
        let contract = Address::repeat_byte(0xcc);
        let block_msg =
            WireMessage::from_event(&Event::new_block(Arc::new(sample_block(1, 0))).unwrap())
                .unwrap();
        let log_msg =
            WireMessage::from_event(&Event::contract_log(sample_log(contract, 1, 0)).unwrap())
                .unwrap();

        let everything = Interest::default();
        assert!(everything.admits(&block_msg));
        assert!(everything.admits(&log_msg));

        let only_logs = Interest {
            kinds: [MessageKind::ContractEvent].into_iter().collect(),
            contracts: HashSet::new(),
        };
        assert!(!only_logs.admits(&block_msg));
        assert!(only_logs.admits(&log_msg));

        let other_contract = Interest {
            kinds: HashSet::new(),
            contracts: [Address::repeat_byte(0x01)].into_iter().collect(),
        };
        assert!(other_contract.admits(&block_msg));
        assert!(!other_contract.admits(&log_msg));
    }

    #[test]
    fn client_messages_parse() {
        let sub: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","contract":"0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"}"#,
        )
        .unwrap();
        assert!(matches!(sub, ClientMessage::Subscribe { ref events, .. } if events.is_empty()));

        let filter: ClientMessage =
            serde_json::from_str(r#"{"type":"filter","eventTypes":["new_block"]}"#).unwrap();
        assert_eq!(
            filter,
            ClientMessage::Filter {
                event_types: Some(vec!["new_block".into()]),
                contracts: None,
            }
        );

        let unknown: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(unknown, ClientMessage::Unknown);
    }
}
