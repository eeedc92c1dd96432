//! Gas limit buffering and replacement pricing

use super::record::GasPrice;

use ethers::types::U256;

/// Default safety margin over the network's gas estimate
pub const DEFAULT_GAS_LIMIT_BUFFER_PERCENT: u64 = 20;

/// Estimate plus `buffer_percent`, covering state drift between estimation and inclusion
pub fn buffered_gas_limit(estimate: U256, buffer_percent: u64) -> U256 {
    let margin = estimate.saturating_mul(U256::from(buffer_percent)) / 100;
    estimate.saturating_add(margin)
}

/// Price for a same-nonce replacement: the prior price scaled by `bump_percent`,
/// raised to the current network price when that is higher.
pub fn replacement_price(prior: &GasPrice, network: Option<&GasPrice>, bump_percent: u64) -> GasPrice {
    let bumped = prior.bump(bump_percent);
    match network {
        Some(current) => bumped.at_least(current),
        None => bumped,
    }
}

/// Calculate total cost in wei, `None` when it does not fit in 256 bits
pub fn max_cost(gas_limit: U256, gas_price: &GasPrice) -> Option<U256> {
    gas_limit.checked_mul(gas_price.ceiling())
}
