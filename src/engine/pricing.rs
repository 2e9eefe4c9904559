//! Conversion of model quotes into prices the venue accepts.

use crate::types::{Quote, Side};

/// One cent.
pub const TICK_SIZE: f64 = 0.01;
/// Resting orders within half a tick of the fresh quote are kept.
pub const PRICE_TOLERANCE: f64 = TICK_SIZE / 2.0;
pub const MIN_TICKS: i64 = 1;
pub const MAX_TICKS: i64 = 99;

// Absorbs binary representation error such as 0.45 / 0.01 = 44.999...
const ROUNDING_EPSILON: f64 = 1e-9;

/// Rounds bids down and asks up to the tick grid, clamped to the price band.
pub fn to_ticks(price: f64, side: Side) -> i64 {
    if !price.is_finite() {
        return match side {
            Side::Buy => MIN_TICKS,
            Side::Sell => MAX_TICKS,
        };
    }
    let ticks = price / TICK_SIZE;
    let rounded = match side {
        Side::Buy => (ticks + ROUNDING_EPSILON).floor(),
        Side::Sell => (ticks - ROUNDING_EPSILON).ceil(),
    };
    (rounded as i64).clamp(MIN_TICKS, MAX_TICKS)
}

pub fn from_ticks(ticks: i64) -> f64 {
    ticks as f64 / 100.0
}

/// Returns `quote` with venue prices and with every side suppressed that
/// would be marketable against `mid`. A book crossed by rounding quotes
/// nothing for the tick.
pub fn to_venue_quote(quote: &Quote, mid: f64) -> Quote {
    let mut venue = quote.clone();
    for side in Side::ALL {
        let slot = venue.side_mut(side);
        slot.price = from_ticks(to_ticks(slot.price, side));
    }
    if venue.bid.is_active() && venue.ask.is_active() && venue.bid.price >= venue.ask.price {
        tracing::warn!(
            bid = venue.bid.price,
            ask = venue.ask.price,
            "rounded quote crosses; skipping both sides"
        );
        venue.bid.suppress();
        venue.ask.suppress();
        return venue;
    }
    for side in Side::ALL {
        let slot = venue.side_mut(side);
        let marketable = match side {
            Side::Buy => slot.price >= mid,
            Side::Sell => slot.price <= mid,
        };
        if marketable && slot.is_active() {
            tracing::debug!(%side, price = slot.price, mid, "suppressing marketable side");
            slot.suppress();
        }
    }
    venue
}
