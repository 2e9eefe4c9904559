//! Per-tick telemetry, published one-way on a broadcast channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    inventory::PositionSnapshot,
    types::{Quote, TradeSide},
};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OrdersBySide {
    pub buy: usize,
    pub sell: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct TelemetryRecord {
    pub strategy_name: String,
    pub trade_side: TradeSide,
    pub market_ticker: String,
    pub open_orders_by_side: OrdersBySide,
    pub position: PositionSnapshot,
    pub mid_price: f64,
    pub quote: Option<Quote>,
    pub timestamp: DateTime<Utc>,
}

/// Fan-out for [`TelemetryRecord`]s. Cloning shares the channel.
#[derive(Clone, Debug)]
pub struct TelemetryFeed {
    sender: broadcast::Sender<TelemetryRecord>,
}

impl Default for TelemetryFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TelemetryFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishing without subscribers is not an error; the record is dropped.
    pub fn publish(&self, record: TelemetryRecord) {
        let _ = self.sender.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryRecord> {
        self.sender.subscribe()
    }
}
