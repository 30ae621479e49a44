//! Declarative transaction filters.
//!
//! A [`TransactionFilter`] is a conjunction of optional predicates. A
//! [`FilterSet`] holds any number of them and matches if any one does;
//! an empty set matches everything.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::transaction::TransactionInfo;

/// Predicates over a [`TransactionInfo`]. Absent fields impose no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFilter {
    /// Sender must equal this address. An unknown sender never matches.
    pub from: Option<Address>,
    /// Recipient must equal this address.
    pub to: Option<Address>,
    /// Value must be at least this many wei.
    pub min_value: Option<U256>,
    /// Only transactions calling a contract.
    #[serde(default)]
    pub only_contract_calls: bool,
    /// 4-byte selector as hex, with or without `0x`.
    pub method_signature: Option<String>,
}

impl TransactionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, addr: Address) -> Self {
        self.from = Some(addr);
        self
    }

    pub fn to(mut self, addr: Address) -> Self {
        self.to = Some(addr);
        self
    }

    pub fn min_value(mut self, wei: U256) -> Self {
        self.min_value = Some(wei);
        self
    }

    pub fn only_contract_calls(mut self) -> Self {
        self.only_contract_calls = true;
        self
    }

    pub fn method_signature(mut self, sig: impl Into<String>) -> Self {
        self.method_signature = Some(sig.into());
        self
    }

    /// Returns `true` if no predicate is set.
    pub fn is_empty(&self) -> bool {
        self.from.is_none()
            && self.to.is_none()
            && self.min_value.is_none()
            && !self.only_contract_calls
            && self.method_signature.is_none()
    }

    /// Check the predicates in order: sender, recipient, minimum value,
    /// contract-call flag, method signature. Stops at the first failure.
    pub fn matches(&self, info: &TransactionInfo) -> bool {
        if let Some(want) = self.from {
            if info.from != Some(want) {
                return false;
            }
        }
        if let Some(want) = self.to {
            if info.to != Some(want) {
                return false;
            }
        }
        if let Some(min) = self.min_value {
            if info.value < min {
                return false;
            }
        }
        if self.only_contract_calls && !info.is_contract_call {
            return false;
        }
        if let Some(sig) = &self.method_signature {
            if !selector_matches(sig, &info.input) {
                return false;
            }
        }
        true
    }
}

/// Compare the first 4 bytes of `input` against a hex selector.
fn selector_matches(sig: &str, input: &[u8]) -> bool {
    let hex_sig = sig
        .strip_prefix("0x")
        .or_else(|| sig.strip_prefix("0X"))
        .unwrap_or(sig);
    let Some(want) = hex_sig.get(..8) else {
        return false;
    };
    let Some(selector) = input.get(..4) else {
        return false;
    };
    hex::encode(selector).eq_ignore_ascii_case(want)
}

// ─── FilterSet ────────────────────────────────────────────────────────────────

/// Handle for a filter held in a [`FilterSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterId(pub u64);

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "filter-{}", self.0)
    }
}

/// Independently evaluated filters: OR across filters, AND within each.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    next_id: u64,
    filters: Vec<(FilterId, TransactionFilter)>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every filter and install `filter` as the only one.
    pub fn replace(&mut self, filter: TransactionFilter) -> FilterId {
        self.filters.clear();
        self.add(filter)
    }

    /// Append `filter`.
    pub fn add(&mut self, filter: TransactionFilter) -> FilterId {
        self.next_id += 1;
        let id = FilterId(self.next_id);
        self.filters.push((id, filter));
        id
    }

    /// Remove the filter with `id`. Returns `false` if it was not present.
    pub fn remove(&mut self, id: FilterId) -> bool {
        let before = self.filters.len();
        self.filters.retain(|(fid, _)| *fid != id);
        self.filters.len() != before
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FilterId, &TransactionFilter)> {
        self.filters.iter().map(|(id, f)| (*id, f))
    }

    /// An empty set matches everything; otherwise any single filter must match.
    pub fn matches(&self, info: &TransactionInfo) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|(_, f)| f.matches(info))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
