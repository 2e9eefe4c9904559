use super::apply_position_limit;
use crate::types::{MarketState, Quote, QuoteSide};

#[derive(Clone, Debug)]
pub struct SimpleParams {
    pub spread: f64,
    pub inventory_skew_factor: f64,
    pub order_size: i64,
    pub max_position: i64,
}

/// Fixed-spread maker centred on the mid, shifted against inventory.
#[derive(Clone, Debug)]
pub struct SimpleQuoter {
    params: SimpleParams,
}

impl SimpleQuoter {
    pub fn new(params: SimpleParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SimpleParams {
        &self.params
    }

    pub fn compute(&self, market: &MarketState, position: i64) -> Quote {
        let half = self.params.spread / 2.0;
        let center = market.mid_price - self.params.inventory_skew_factor * position as f64;
        let mut quote = Quote {
            bid: QuoteSide::new(center - half, self.params.order_size),
            ask: QuoteSide::new(center + half, self.params.order_size),
            reservation_price: center,
            spread: self.params.spread,
            computed_at: market.observed_at,
        };
        apply_position_limit(&mut quote, position, self.params.max_position);
        quote
    }
}
