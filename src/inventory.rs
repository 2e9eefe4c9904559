use std::collections::HashSet;

use chrono::{DateTime, Utc};
use ringbuffer::{AllocRingBuffer, RingBuffer, RingBufferRead, RingBufferWrite};
use serde::Serialize;

use crate::types::Fill;

/// Fill ids remembered for deduplication. Must be a power of two.
const FILL_ID_WINDOW: usize = 4096;

/// Snapshot of the position used for telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PositionSnapshot {
    pub net_position: i64,
    pub max_position: i64,
    pub last_updated: DateTime<Utc>,
}

/// Net contract position of one strategy instance.
///
/// Only confirmed fills move the position, and each fill is applied at most
/// once no matter how many times the venue reports it. The most recent
/// [`FILL_ID_WINDOW`] fill ids are remembered; a fill no newer than anything
/// forgotten is treated as already applied.
#[derive(Clone, Debug)]
pub struct PositionState {
    net_position: i64,
    max_position: i64,
    last_updated: DateTime<Utc>,
    applied_fills: HashSet<String>,
    recent_fills: AllocRingBuffer<(String, DateTime<Utc>)>,
    forgotten_until: Option<DateTime<Utc>>,
}

impl PositionState {
    pub fn new(max_position: i64) -> Self {
        Self::with_fill_window(max_position, FILL_ID_WINDOW)
    }

    fn with_fill_window(max_position: i64, window: usize) -> Self {
        Self {
            net_position: 0,
            max_position,
            last_updated: Utc::now(),
            applied_fills: HashSet::with_capacity(window),
            recent_fills: AllocRingBuffer::with_capacity(window),
            forgotten_until: None,
        }
    }

    pub fn net_position(&self) -> i64 {
        self.net_position
    }

    pub fn max_position(&self) -> i64 {
        self.max_position
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Number of fill ids currently held for deduplication.
    pub fn remembered_fills(&self) -> usize {
        self.applied_fills.len()
    }

    /// Applies `fill` unless its id was seen before. Returns whether the
    /// position changed.
    pub fn apply_fill(&mut self, fill: &Fill) -> bool {
        let stale = self
            .forgotten_until
            .is_some_and(|until| fill.filled_at <= until);
        if stale || self.applied_fills.contains(&fill.fill_id) {
            return false;
        }
        self.remember(fill);
        self.net_position += fill.side.signed(fill.size);
        self.last_updated = fill.filled_at;
        if self.breaches_limit() {
            tracing::error!(
                net_position = self.net_position,
                max_position = self.max_position,
                fill_id = %fill.fill_id,
                "position limit breached by confirmed fill"
            );
        }
        true
    }

    fn remember(&mut self, fill: &Fill) {
        if self.recent_fills.is_full() {
            if let Some((fill_id, filled_at)) = self.recent_fills.dequeue() {
                self.applied_fills.remove(&fill_id);
                self.forgotten_until = Some(
                    self.forgotten_until
                        .map_or(filled_at, |until| until.max(filled_at)),
                );
            }
        }
        self.applied_fills.insert(fill.fill_id.clone());
        self.recent_fills.push((fill.fill_id.clone(), fill.filled_at));
    }

    /// Overwrites the position with the venue's figure.
    pub fn resync(&mut self, venue_position: i64, at: DateTime<Utc>) {
        self.net_position = venue_position;
        self.last_updated = at;
    }

    pub fn breaches_limit(&self) -> bool {
        self.net_position.abs() > self.max_position
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            net_position: self.net_position,
            max_position: self.max_position,
            last_updated: self.last_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderId, Side};

    fn fill_at(id: &str, side: Side, size: i64, secs: i64) -> Fill {
        Fill {
            fill_id: id.to_string(),
            order_id: OrderId::from(id),
            side,
            price: 0.5,
            size,
            filled_at: DateTime::from_timestamp(1_714_564_800 + secs, 0).unwrap(),
        }
    }

    fn fill(id: &str, side: Side, size: i64) -> Fill {
        fill_at(id, side, size, 0)
    }

    #[test]
    fn test_fills_move_position() {
        let mut pos = PositionState::new(10);
        assert!(pos.apply_fill(&fill("a", Side::Buy, 3)));
        assert!(pos.apply_fill(&fill("b", Side::Sell, 1)));
        assert_eq!(pos.net_position(), 2);
        assert_eq!(pos.snapshot().net_position, 2);
        assert_eq!(pos.snapshot().max_position, 10);
    }

    #[test]
    fn test_duplicate_fill_applied_once() {
        let mut pos = PositionState::new(10);
        let f = fill("a", Side::Buy, 2);
        assert!(pos.apply_fill(&f));
        assert!(!pos.apply_fill(&f));
        assert!(!pos.apply_fill(&f));
        assert_eq!(pos.net_position(), 2);
    }

    #[test]
    fn test_fill_memory_is_bounded() {
        let mut pos = PositionState::with_fill_window(1_000, 4);
        for n in 0..100 {
            assert!(pos.apply_fill(&fill_at(&format!("f{n}"), Side::Buy, 1, n)));
            assert!(pos.remembered_fills() <= 4);
        }
        assert_eq!(pos.net_position(), 100);

        // forgotten and remembered fills are both rejected on replay
        assert!(!pos.apply_fill(&fill_at("f0", Side::Buy, 1, 0)));
        assert!(!pos.apply_fill(&fill_at("f99", Side::Buy, 1, 99)));
        assert_eq!(pos.net_position(), 100);

        assert!(pos.apply_fill(&fill_at("f100", Side::Sell, 1, 100)));
        assert_eq!(pos.net_position(), 99);
    }

    #[test]
    fn test_resync_overrides() {
        let mut pos = PositionState::new(5);
        pos.apply_fill(&fill("a", Side::Sell, 2));
        pos.resync(4, Utc::now());
        assert_eq!(pos.net_position(), 4);
        assert!(!pos.breaches_limit());
    }
}
