use super::apply_position_limit;
use crate::types::{MarketState, Quote, QuoteSide};

#[derive(Clone, Debug)]
pub struct AvellanedaParams {
    pub gamma: f64,
    pub k: f64,
    pub sigma: f64,
    /// Session horizon `T` in seconds.
    pub horizon_secs: f64,
    pub min_spread: f64,
    pub position_limit_buffer: f64,
    pub inventory_skew_factor: f64,
    pub dynamic_gamma: bool,
    pub order_size: i64,
    pub max_position: i64,
    /// Remaining time never drops below this (one tick).
    pub time_floor_secs: f64,
}

impl AvellanedaParams {
    pub fn time_left(&self, elapsed_secs: f64) -> f64 {
        (self.horizon_secs - elapsed_secs).max(self.time_floor_secs)
    }

    /// Risk aversion used for inventory `q`. With `dynamic_gamma` the maker
    /// gets less risk averse as inventory builds up, so quotes tighten toward
    /// the unwinding side.
    pub fn effective_gamma(&self, q: i64) -> f64 {
        if !self.dynamic_gamma || self.max_position <= 0 {
            return self.gamma;
        }
        let ratio = q.unsigned_abs() as f64 / self.max_position as f64;
        self.gamma * (-ratio).exp()
    }

    /// Position cap after the buffer, used to decide which side to suppress.
    pub fn effective_cap(&self) -> i64 {
        let buffer = self.position_limit_buffer.clamp(0.0, 1.0);
        ((self.max_position as f64) * (1.0 - buffer)).floor() as i64
    }
}

pub fn reservation_price(mid: f64, q: f64, gamma: f64, sigma: f64, time_left: f64) -> f64 {
    let variance_horizon = (sigma * sigma) * time_left;
    mid - q * gamma * variance_horizon
}

pub fn optimal_spread(gamma: f64, sigma: f64, time_left: f64, k: f64) -> f64 {
    let risk_term = gamma * (sigma * sigma) * time_left;
    let liquidity_term = (2.0 / gamma) * (1.0 + gamma / k).ln();
    (risk_term + liquidity_term).max(0.0)
}

#[derive(Clone, Debug)]
pub struct AvellanedaQuoter {
    params: AvellanedaParams,
}

impl AvellanedaQuoter {
    pub fn new(params: AvellanedaParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &AvellanedaParams {
        &self.params
    }

    pub fn compute(&self, market: &MarketState, position: i64, elapsed_secs: f64) -> Quote {
        let p = &self.params;
        let time_left = p.time_left(elapsed_secs);
        let gamma = p.effective_gamma(position);
        let q = position as f64;

        let reservation = reservation_price(market.mid_price, q, gamma, p.sigma, time_left)
            - p.inventory_skew_factor * q;
        let spread = optimal_spread(gamma, p.sigma, time_left, p.k).max(p.min_spread);
        let half = spread / 2.0;

        let mut quote = Quote {
            bid: QuoteSide::new(reservation - half, p.order_size),
            ask: QuoteSide::new(reservation + half, p.order_size),
            reservation_price: reservation,
            spread,
            computed_at: market.observed_at,
        };
        apply_position_limit(&mut quote, position, p.effective_cap());
        quote
    }
}
