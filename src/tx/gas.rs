//! Fee descriptors and the escalation policies for stuck transactions

use ethers::types::U256;

/// Each resubmission raises the price (or tip) to `6/5` of its value, i.e. +20%
const ESCALATION_NUMERATOR: u64 = 6;
const ESCALATION_DIVISOR: u64 = 5;

/// Replacement dynamic fee transactions must raise the fee cap by at least `1/10`
const MIN_FEE_CAP_BUMP_DIVISOR: u64 = 10;

/// Gas price types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Price compared against the escalation ceiling: the gas price for legacy
    /// transactions, the fee cap for dynamic fee ones
    pub fn ceiling_price(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }

    /// Label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            GasPrice::Legacy(_) => "legacy",
            GasPrice::Eip1559 { .. } => "eip1559",
        }
    }

    /// Calculate the most the transaction can cost in wei
    pub fn max_cost(&self, gas_limit: U256) -> U256 {
        gas_limit.saturating_mul(self.ceiling_price())
    }
}

/// `value * 1.2` rounded to the nearest wei, and at least one wei above `value`
fn bump_by_fifth(value: U256) -> U256 {
    let rounded = value
        .saturating_mul(U256::from(ESCALATION_NUMERATOR))
        .saturating_add(U256::from(ESCALATION_DIVISOR / 2))
        / ESCALATION_DIVISOR;
    rounded.max(value.saturating_add(U256::one()))
}

/// Next legacy gas price: +20%, clamped to `ceiling`
pub fn escalate_legacy(price: U256, ceiling: U256) -> U256 {
    bump_by_fifth(price).min(ceiling)
}

/// Result of escalating a dynamic fee transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicEscalation {
    Bump {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
    /// The ceiling sits below the minimum accepted replacement fee cap
    FloorAboveCeiling { floor: U256 },
}

/// Smallest fee cap a node accepts for a replacement: 110% of the current one,
/// and at least one wei more
pub fn min_replacement_fee_cap(fee_cap: U256) -> U256 {
    fee_cap
        .saturating_add(fee_cap / MIN_FEE_CAP_BUMP_DIVISOR)
        .max(fee_cap.saturating_add(U256::one()))
}

/// Next dynamic fee: tip +20%, fee cap `2 * base_fee + tip`, never below 110% of
/// the current fee cap and never above `ceiling`
pub fn escalate_dynamic(
    fee_cap: U256,
    tip_cap: U256,
    base_fee: U256,
    ceiling: U256,
) -> DynamicEscalation {
    let new_tip = bump_by_fifth(tip_cap);
    let floor = min_replacement_fee_cap(fee_cap);

    let mut new_fee_cap = base_fee.saturating_mul(U256::from(2)).saturating_add(new_tip);
    if new_fee_cap < floor {
        new_fee_cap = floor;
    }
    if new_fee_cap > ceiling {
        new_fee_cap = ceiling;
    }
    if new_fee_cap < floor {
        return DynamicEscalation::FloorAboveCeiling { floor };
    }

    DynamicEscalation::Bump {
        max_fee_per_gas: new_fee_cap,
        // A clamped fee cap can fall below the bumped tip; the tip never exceeds the cap
        max_priority_fee_per_gas: new_tip.min(new_fee_cap),
    }
}
