//! Pure reconciliation of resting orders against a fresh venue quote.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};

use super::pricing::PRICE_TOLERANCE;
use crate::types::{Order, OrderId, OrderRequest, Quote, Side};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    Expired,
    StalePrice,
    SizeMismatch,
    SideSuppressed,
    Duplicate,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::StalePrice => "stale_price",
            Self::SizeMismatch => "size_mismatch",
            Self::SideSuppressed => "side_suppressed",
            Self::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannedCancel {
    pub order_id: OrderId,
    pub side: Side,
    pub reason: CancelReason,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcilePlan {
    pub cancels: Vec<PlannedCancel>,
    pub placements: Vec<OrderRequest>,
    pub kept: Vec<(Side, OrderId)>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.cancels.is_empty() && self.placements.is_empty()
    }

    pub fn kept_on(&self, side: Side) -> usize {
        self.kept.iter().filter(|(s, _)| *s == side).count()
    }
}

fn is_expired(order: &Order, now: DateTime<Utc>, order_expiration: Duration) -> bool {
    let past_venue_expiry = order.expires_at.is_some_and(|at| at <= now);
    let too_old = order
        .age(now)
        .to_std()
        .map(|age| age > order_expiration)
        .unwrap_or(false);
    past_venue_expiry || too_old
}

/// Plans the cancels and placements that leave at most one resting order per
/// side, matching `quote`.
///
/// Per side the newest order that is unexpired, within [`PRICE_TOLERANCE`] of
/// the quoted price and sized exactly as quoted is kept; everything else on
/// that side is cancelled. A new order is planned only when nothing was kept
/// and the quoted size is positive. Placements carry no client order id; the
/// caller assigns one before submitting.
pub fn plan(
    open_orders: &[Order],
    quote: &Quote,
    now: DateTime<Utc>,
    order_expiration: Duration,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    let expires_at = chrono::Duration::from_std(order_expiration)
        .ok()
        .map(|ttl| now + ttl);

    for side in Side::ALL {
        let target = quote.side(side);
        let mut resting: Vec<&Order> = open_orders.iter().filter(|o| o.side == side).collect();
        resting.sort_by(|a, b| b.placed_at.cmp(&a.placed_at));

        let mut kept: Option<&OrderId> = None;
        for order in resting {
            let reason = if is_expired(order, now, order_expiration) {
                Some(CancelReason::Expired)
            } else if !target.is_active() {
                Some(CancelReason::SideSuppressed)
            } else if kept.is_some() {
                Some(CancelReason::Duplicate)
            } else if (order.price - target.price).abs() > PRICE_TOLERANCE {
                Some(CancelReason::StalePrice)
            } else if order.remaining != target.size {
                Some(CancelReason::SizeMismatch)
            } else {
                None
            };
            match reason {
                Some(reason) => plan.cancels.push(PlannedCancel {
                    order_id: order.id.clone(),
                    side,
                    reason,
                }),
                None => kept = Some(&order.id),
            }
        }

        match kept {
            Some(id) => plan.kept.push((side, id.clone())),
            None if target.is_active() => plan.placements.push(OrderRequest {
                side,
                price: target.price,
                size: target.size,
                expires_at,
                client_order_id: None,
            }),
            None => {}
        }
    }
    plan
}
