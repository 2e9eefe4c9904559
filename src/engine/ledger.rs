use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::types::{Fill, Order, OrderId, OrderRequest, OrderStatus};

/// Local record of the orders this instance placed.
///
/// Entries are `Pending` from submission until the venue reports them
/// resting, then move to a terminal state and are pruned.
#[derive(Debug, Default)]
pub struct OrderLedger {
    orders: HashMap<OrderId, Order>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn get(&self, id: &OrderId) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn record_submitted(&mut self, id: OrderId, request: &OrderRequest, now: DateTime<Utc>) {
        let mut order = Order::new(
            id.clone(),
            request.side,
            request.price,
            request.size,
            now,
            request.expires_at,
        );
        order.client_order_id = request.client_order_id.clone();
        self.orders.insert(id, order);
    }

    /// Moves `id` to `next`, logging illegal moves instead of failing the tick.
    fn transition(&mut self, id: &OrderId, next: OrderStatus) {
        if let Some(order) = self.orders.get_mut(id) {
            if let Err(err) = order.transition(next) {
                warn!(error = %err, "ledger transition rejected");
            }
        }
    }

    pub fn apply_fill(&mut self, fill: &Fill) {
        let Some(order) = self.orders.get_mut(&fill.order_id) else {
            return;
        };
        if order.status.is_terminal() {
            debug!(order_id = %fill.order_id, status = ?order.status, "fill for settled ledger entry");
            return;
        }
        order.remaining -= fill.size;
        if order.remaining <= 0 {
            self.transition(&fill.order_id, OrderStatus::Filled);
        }
    }

    /// Syncs the ledger with the venue's resting orders. Pending and open
    /// entries the venue no longer reports are treated as expired.
    pub fn observe_open(&mut self, resting: &[Order]) {
        let mut seen = HashSet::with_capacity(resting.len());
        for venue in resting {
            seen.insert(&venue.id);
            if let Some(order) = self.orders.get_mut(&venue.id) {
                order.remaining = venue.remaining;
                if order.status == OrderStatus::Pending {
                    self.transition(&venue.id, OrderStatus::Open);
                }
            }
        }
        let vanished: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| o.status.is_live() && !seen.contains(&o.id))
            .map(|o| o.id.clone())
            .collect();
        for id in vanished {
            debug!(order_id = %id, "order no longer resting");
            self.transition(&id, OrderStatus::Expired);
        }
    }

    pub fn mark_canceled(&mut self, id: &OrderId) {
        self.transition(id, OrderStatus::Canceled);
    }

    /// Drops terminal entries; returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let before = self.orders.len();
        self.orders.retain(|_, order| order.status.is_live());
        before - self.orders.len()
    }

    pub fn live_ids(&self) -> Vec<OrderId> {
        self.orders
            .values()
            .filter(|o| o.status.is_live())
            .map(|o| o.id.clone())
            .collect()
    }
}
