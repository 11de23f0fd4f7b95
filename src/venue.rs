//! Symbol filters and tick/lot rounding, centralised in one place so every
//! venue-bound price/size goes through it exactly once (§3.1).
//!
//! Grounded on the teacher's scattered helpers: `exchange::round_to_5_sig_figs`,
//! `exchange::round_f64`, and `market_maker::snap_to_tick`, unified into a
//! single rounding surface keyed by symbol filters instead of ad hoc calls.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ValidationError;
use crate::market_data::Side;

/// Tick/lot/min-notional filters for one symbol, as exposed by the venue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolFilter {
    pub tick_size: f64,
    pub lot_step: f64,
    pub min_notional: Option<f64>,
}

/// Read-only after first population; a single `HashMap` populated on first
/// use per §5 ("A symbol-filter cache is populated on first use and
/// read-only thereafter").
#[derive(Debug, Default)]
pub struct SymbolFilterCache {
    filters: HashMap<String, SymbolFilter>,
}

impl SymbolFilterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(&mut self, symbol: &str, filter: SymbolFilter) -> SymbolFilter {
        *self.filters.entry(symbol.to_string()).or_insert(filter)
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolFilter> {
        self.filters.get(symbol).copied()
    }
}

/// Rounds a price down (bids) or up (asks) to the symbol's tick size.
pub fn round_price_to_tick(price: f64, tick_size: f64, side: Side) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    let ticks = price / tick_size;
    let rounded_ticks = match side {
        Side::Buy => ticks.floor(),
        Side::Sell => ticks.ceil(),
    };
    rounded_ticks * tick_size
}

/// Rounds a size down to the symbol's lot step.
pub fn round_size_to_lot(size: f64, lot_step: f64) -> f64 {
    if lot_step <= 0.0 {
        return size;
    }
    (size / lot_step).floor() * lot_step
}

/// Applies tick/lot rounding and the min-notional bump-up rule from §4.6:
/// if `size * price < min_notional`, bump size upward by whole lot steps.
/// Returns a `ValidationError` if the order remains invalid after bumping
/// (e.g. non-finite or non-positive inputs).
pub fn apply_filters(
    price: f64,
    size: f64,
    side: Side,
    filter: SymbolFilter,
) -> Result<(f64, f64), ValidationError> {
    if !price.is_finite() {
        return Err(ValidationError::NonFinitePrice(price));
    }
    if !size.is_finite() {
        return Err(ValidationError::NonFiniteSize(size));
    }
    if size < 0.0 {
        return Err(ValidationError::NegativeAmount(size));
    }

    let rounded_price = round_price_to_tick(price, filter.tick_size, side);
    let mut rounded_size = round_size_to_lot(size, filter.lot_step);

    if let Some(min_notional) = filter.min_notional {
        while rounded_size * rounded_price < min_notional && filter.lot_step > 0.0 {
            rounded_size += filter.lot_step;
        }
    }

    if rounded_price <= 0.0 || rounded_size <= 0.0 {
        return Err(ValidationError::NegativeAmount(rounded_size));
    }

    Ok((rounded_price, rounded_size))
}
