//! Transaction submission support: nonce tracking and stuck transaction escalation

mod gas;
mod mining;
mod nonce;

pub use gas::{escalate_dynamic, escalate_legacy, min_replacement_fee_cap, DynamicEscalation, GasPrice};
pub use mining::{GiveUpReason, MiningOutcome, MiningWaiter, DEFAULT_RECEIPT_POLL_INTERVAL};
pub use nonce::NonceManager;

use ethers::types::{H256, U256};

/// A broadcast transaction awaiting inclusion.
///
/// Immutable once created: escalation produces a new `PendingTransaction` with
/// the same nonce instead of changing this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    hash: H256,
    nonce: U256,
    gas_limit: U256,
    gas_price: GasPrice,
}

impl PendingTransaction {
    pub fn new(hash: H256, nonce: impl Into<U256>, gas_limit: impl Into<U256>, gas_price: GasPrice) -> Self {
        Self {
            hash,
            nonce: nonce.into(),
            gas_limit: gas_limit.into(),
            gas_price,
        }
    }

    pub fn hash(&self) -> H256 {
        self.hash
    }

    pub fn nonce(&self) -> U256 {
        self.nonce
    }

    pub fn gas_limit(&self) -> U256 {
        self.gas_limit
    }

    pub fn gas_price(&self) -> &GasPrice {
        &self.gas_price
    }
}

/// Parameters handed to a resubmission callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasOptions {
    /// Nonce of the transaction being replaced
    pub nonce: U256,
    /// Carried over unchanged from the transaction being replaced
    pub gas_limit: U256,
    pub gas_price: GasPrice,
}
