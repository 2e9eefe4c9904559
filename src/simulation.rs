//! In-process exchange used for backtests and dry runs.
//!
//! The mid follows a clamped Gaussian random walk driven by a seeded RNG, so
//! the same seed, volatility and `dt` always reproduce the same path. Resting
//! orders fill in full, at their limit price, on the first step whose mid
//! touches or crosses the limit.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use ringbuffer::{AllocRingBuffer, RingBufferExt, RingBufferWrite};
use statrs::distribution::Normal;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    client::TradingApi,
    config::SimulationConfig,
    errors::{Error, Result},
    types::{Fill, MarketState, Order, OrderId, OrderRequest, OrderStatus, Side, TradeSide},
};

pub const MIN_PRICE: f64 = 0.01;
pub const MAX_PRICE: f64 = 0.99;
const PRICE_HISTORY_CAPACITY: usize = 1024;
/// Fills reported by `get_fills`; older fills are dropped.
pub const FILL_HISTORY_CAPACITY: usize = 256;

/// Start of the simulated clock: 2024-01-01T00:00:00Z.
const CLOCK_ORIGIN_SECS: i64 = 1_704_067_200;

/// Synchronous core of the simulator.
pub struct SimulatedMarket {
    price: f64,
    volatility: f64,
    dt: Duration,
    rng: StdRng,
    normal: Normal,
    origin: DateTime<Utc>,
    steps: u64,
    history: AllocRingBuffer<f64>,
    open_orders: Vec<Order>,
    fills: AllocRingBuffer<Fill>,
    position: i64,
    next_order_id: u64,
}

impl SimulatedMarket {
    pub fn new(config: &SimulationConfig, dt: Duration) -> Result<Self> {
        if !config.initial_price.is_finite()
            || !(MIN_PRICE..=MAX_PRICE).contains(&config.initial_price)
        {
            return Err(Error::Simulation(format!(
                "initial_price {} outside [{MIN_PRICE}, {MAX_PRICE}]",
                config.initial_price
            )));
        }
        if !config.volatility.is_finite() || config.volatility < 0.0 {
            return Err(Error::Simulation(format!(
                "volatility must be finite and non-negative, got {}",
                config.volatility
            )));
        }
        if dt.is_zero() {
            return Err(Error::Simulation("dt must be positive".into()));
        }
        let normal = Normal::new(0.0, 1.0).map_err(|err| Error::Simulation(err.to_string()))?;
        let origin = Utc
            .timestamp_opt(CLOCK_ORIGIN_SECS, 0)
            .single()
            .ok_or_else(|| Error::Simulation("invalid clock origin".into()))?;

        let mut history = AllocRingBuffer::with_capacity(PRICE_HISTORY_CAPACITY);
        history.push(config.initial_price);

        Ok(Self {
            price: config.initial_price,
            volatility: config.volatility,
            dt,
            rng: StdRng::seed_from_u64(config.seed),
            normal,
            origin,
            steps: 0,
            history,
            open_orders: Vec::new(),
            fills: AllocRingBuffer::with_capacity(FILL_HISTORY_CAPACITY),
            position: 0,
            next_order_id: 1,
        })
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Logical time: origin + steps·dt.
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = self
            .dt
            .saturating_mul(u32::try_from(self.steps).unwrap_or(u32::MAX));
        self.origin + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn open_orders(&self) -> &[Order] {
        &self.open_orders
    }

    /// Most recent fills, oldest first.
    pub fn fills(&self) -> Vec<Fill> {
        self.fills.iter().cloned().collect()
    }

    /// Most recent mids, oldest first.
    pub fn price_history(&self) -> Vec<f64> {
        self.history.iter().copied().collect()
    }

    /// Advances the clock by one `dt`, moves the mid, expires and matches
    /// resting orders. Returns the new mid.
    pub fn step(&mut self) -> f64 {
        let z: f64 = self.rng.sample(self.normal);
        let shock = self.volatility * self.dt.as_secs_f64().sqrt() * z;
        self.price = (self.price + shock).clamp(MIN_PRICE, MAX_PRICE);
        self.steps += 1;
        self.history.push(self.price);

        let now = self.now();
        self.expire(now);
        self.match_orders(now);
        self.price
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        self.open_orders.retain_mut(|order| {
            let expired = order.expires_at.is_some_and(|at| at <= now);
            if expired {
                let _ = order.transition(OrderStatus::Expired);
                debug!(order_id = %order.id, "simulated order expired");
            }
            !expired
        });
    }

    fn match_orders(&mut self, now: DateTime<Utc>) {
        let mid = self.price;
        let mut filled = Vec::new();
        self.open_orders.retain(|order| {
            let touched = match order.side {
                Side::Buy => mid <= order.price,
                Side::Sell => mid >= order.price,
            };
            if touched {
                filled.push(order.clone());
            }
            !touched
        });
        for mut order in filled {
            let size = order.remaining;
            let _ = order.transition(OrderStatus::Filled);
            self.position += order.side.signed(size);
            debug!(
                order_id = %order.id,
                side = %order.side,
                price = order.price,
                size,
                mid,
                "simulated fill"
            );
            self.fills.push(Fill {
                fill_id: order.id.to_string(),
                order_id: order.id,
                side: order.side,
                price: order.price,
                size,
                filled_at: now,
            });
        }
    }

    pub fn place(&mut self, request: &OrderRequest) -> Result<OrderId> {
        if !request.price.is_finite() || request.price <= 0.0 || request.price >= 1.0 {
            return Err(Error::Simulation(format!(
                "order price {} outside (0, 1)",
                request.price
            )));
        }
        if request.size <= 0 {
            return Err(Error::Simulation(format!(
                "order size must be positive, got {}",
                request.size
            )));
        }
        if let Some(existing) = request.client_order_id.as_deref().and_then(|client_id| {
            self.open_orders
                .iter()
                .find(|o| o.client_order_id.as_deref() == Some(client_id))
        }) {
            debug!(order_id = %existing.id, "duplicate client order id; returning resting order");
            return Ok(existing.id.clone());
        }
        let id = OrderId::new(format!("sim-{}", self.next_order_id));
        self.next_order_id += 1;
        let mut order = Order::new(
            id.clone(),
            request.side,
            request.price,
            request.size,
            self.now(),
            request.expires_at,
        );
        order.transition(OrderStatus::Open)?;
        order.client_order_id = request.client_order_id.clone();
        self.open_orders.push(order);
        Ok(id)
    }

    /// Removes `order_id` if it is still resting. Unknown ids are ignored.
    pub fn cancel(&mut self, order_id: &OrderId) -> bool {
        let before = self.open_orders.len();
        self.open_orders.retain(|order| &order.id != order_id);
        before != self.open_orders.len()
    }
}

/// [`TradingApi`] over a shared [`SimulatedMarket`].
#[derive(Clone)]
pub struct SimulatedExchange {
    market_ticker: String,
    trade_side: TradeSide,
    inner: Arc<Mutex<SimulatedMarket>>,
}

impl SimulatedExchange {
    pub fn new(
        config: &SimulationConfig,
        market_ticker: String,
        trade_side: TradeSide,
        dt: Duration,
    ) -> Result<Self> {
        Ok(Self {
            market_ticker,
            trade_side,
            inner: Arc::new(Mutex::new(SimulatedMarket::new(config, dt)?)),
        })
    }

    /// Runs `f` against the underlying market; used by tests and diagnostics.
    pub async fn with_market<T>(&self, f: impl FnOnce(&mut SimulatedMarket) -> T) -> T {
        let mut market = self.inner.lock().await;
        f(&mut market)
    }
}

#[async_trait]
impl TradingApi for SimulatedExchange {
    fn market_ticker(&self) -> &str {
        &self.market_ticker
    }

    fn trade_side(&self) -> TradeSide {
        self.trade_side
    }

    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    async fn get_market_state(&self) -> Result<MarketState> {
        let mut market = self.inner.lock().await;
        let mid_price = market.step();
        Ok(MarketState {
            ticker: self.market_ticker.clone(),
            mid_price,
            observed_at: market.now(),
        })
    }

    async fn get_open_orders(&self) -> Result<Vec<Order>> {
        let market = self.inner.lock().await;
        Ok(market.open_orders().to_vec())
    }

    async fn get_position(&self) -> Result<i64> {
        Ok(self.inner.lock().await.position())
    }

    async fn get_fills(&self) -> Result<Vec<Fill>> {
        Ok(self.inner.lock().await.fills())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderId> {
        self.inner.lock().await.place(request)
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<()> {
        if !self.inner.lock().await.cancel(order_id) {
            debug!(%order_id, "cancel of unknown or terminal simulated order ignored");
        }
        Ok(())
    }
}
