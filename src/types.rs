use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Identifier assigned to an order by the venue (or the simulator).
#[repr(transparent)]
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OrderId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic client order ids seeded from the wall clock, so ids stay unique
/// across restarts.
#[derive(Debug, Default)]
pub struct ClientOrderIds {
    high_water: AtomicI64,
}

impl ClientOrderIds {
    pub fn next(&self) -> String {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        let candidate = now_ms << 4;
        let bump = |prev: i64| if candidate <= prev { prev + 1 } else { candidate };
        let id = self
            .high_water
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| Some(bump(prev)))
            .map(bump)
            .unwrap_or(candidate);
        format!("mm-{id}")
    }
}

/// Direction of an order: buying or selling contracts of the traded side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Buy, Side::Sell];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    /// Signed position change produced by filling `size` contracts.
    pub fn signed(self, size: i64) -> i64 {
        match self {
            Self::Buy => size,
            Self::Sell => -size,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which contract of a binary market the strategy trades.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    #[default]
    Yes,
    No,
}

impl TradeSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Open)
    }

    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Pending) => false,
            (Self::Pending, _) => true,
            (Self::Open, Self::Filled | Self::Canceled | Self::Expired) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub side: Side,
    pub price: f64,
    pub size: i64,
    pub remaining: i64,
    pub placed_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    pub client_order_id: Option<String>,
}

impl Order {
    pub fn new(
        id: OrderId,
        side: Side,
        price: f64,
        size: i64,
        placed_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            side,
            price,
            size,
            remaining: size,
            placed_at,
            expires_at,
            status: OrderStatus::Pending,
            client_order_id: None,
        }
    }

    /// Moves the order to `next`. Terminal states never change; an illegal
    /// move leaves the order untouched.
    pub fn transition(&mut self, next: OrderStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                order_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next == OrderStatus::Filled {
            self.remaining = 0;
        }
        Ok(())
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.placed_at)
    }
}

/// Limit order submission.
///
/// `client_order_id` is fixed before the first attempt and reused on every
/// retry, so a venue that already accepted the order can be asked for it.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderRequest {
    pub side: Side,
    pub price: f64,
    pub size: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub client_order_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: OrderId,
    pub side: Side,
    pub price: f64,
    pub size: i64,
    pub filled_at: DateTime<Utc>,
}

/// Mid-price snapshot, valid for a single tick.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MarketState {
    pub ticker: String,
    pub mid_price: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct QuoteSide {
    pub price: f64,
    pub size: i64,
}

impl QuoteSide {
    pub fn new(price: f64, size: i64) -> Self {
        Self { price, size }
    }

    pub fn is_active(&self) -> bool {
        self.size > 0
    }

    pub fn suppress(&mut self) {
        self.size = 0;
    }
}

/// Output of a quote calculator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Quote {
    pub bid: QuoteSide,
    pub ask: QuoteSide,
    pub reservation_price: f64,
    pub spread: f64,
    pub computed_at: DateTime<Utc>,
}

impl Quote {
    pub fn side(&self, side: Side) -> &QuoteSide {
        match side {
            Side::Buy => &self.bid,
            Side::Sell => &self.ask,
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut QuoteSide {
        match side {
            Side::Buy => &mut self.bid,
            Side::Sell => &mut self.ask,
        }
    }
}
