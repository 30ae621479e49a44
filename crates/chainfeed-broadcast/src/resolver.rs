//! Event signature → topic resolution.
//!
//! The topic of an EVM event is the keccak256 hash of its canonical
//! signature string, e.g.:
//!   keccak256("Transfer(address,address,uint256)")
//!   → 0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef

use alloy_primitives::B256;
use tiny_keccak::{Hasher, Keccak};

use crate::error::ResolveError;

/// Maps a human-readable event signature to a topic-0 filter value.
pub trait SignatureResolver: Send + Sync {
    fn resolve(&self, signature: &str) -> Result<B256, ResolveError>;
}

/// Compute the keccak256 hash of an event signature string.
pub fn keccak256_signature(signature: &str) -> B256 {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(signature.as_bytes());
    hasher.finalize(&mut output);
    B256::from(output)
}

/// Accepts either a ready-made topic hash (`0x` + 64 hex chars) or a
/// canonical signature like `Transfer(address,address,uint256)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeccakResolver;

impl SignatureResolver for KeccakResolver {
    fn resolve(&self, signature: &str) -> Result<B256, ResolveError> {
        let sig = signature.trim();
        if sig.is_empty() {
            return Err(ResolveError::Empty);
        }
        if let Some(hex_part) = sig.strip_prefix("0x") {
            if hex_part.len() == 64 {
                let bytes = hex::decode(hex_part)
                    .map_err(|_| ResolveError::InvalidTopic(sig.to_string()))?;
                return Ok(B256::from_slice(&bytes));
            }
        }
        let canonical: String = sig.chars().filter(|c| !c.is_whitespace()).collect();
        Ok(keccak256_signature(&canonical))
    }
}
