//! Reject countdown for placed orders.
//!
//! A timer starts at the reject window the first time an order is seen in the
//! placed bucket and counts down one second per tick. At zero it simply stops:
//! the order keeps its status, only the reject action goes away.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::model::Order;

/// Countdown state of one order as the view renders it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountdownView {
    pub remaining_secs: u64,
    /// Remaining share of the window, 0..=100.
    pub percent: u8,
}

#[derive(Debug)]
pub struct Countdowns {
    window_secs: u64,
    timers: HashMap<String, u64>,
}

impl Countdowns {
    pub fn new(window: Duration) -> Self {
        Self {
            window_secs: window.as_secs().max(1),
            timers: HashMap::new(),
        }
    }

    /// Start timers for newly placed orders and drop timers of orders that are
    /// no longer placed.
    pub fn observe<'a>(&mut self, placed: impl IntoIterator<Item = &'a Order>) {
        let mut still_placed = Vec::new();
        for order in placed {
            still_placed.push(order.order_id.as_str());
            if self.timers.contains_key(&order.order_id) {
                continue;
            }
            let start = if order.date_time.is_some() {
                self.window_secs
            } else {
                0
            };
            debug!(order_id = %order.order_id, secs = start, "reject countdown started");
            self.timers.insert(order.order_id.clone(), start);
        }
        self.timers
            .retain(|id, _| still_placed.contains(&id.as_str()));
    }

    /// Advance every running timer by one second. Returns whether anything
    /// changed.
    pub fn tick(&mut self) -> bool {
        let mut changed = false;
        for remaining in self.timers.values_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                changed = true;
            }
        }
        changed
    }

    pub fn remaining(&self, order_id: &str) -> Option<u64> {
        self.timers.get(order_id).copied()
    }

    /// Whether reject is still offered for this order.
    pub fn is_active(&self, order_id: &str) -> bool {
        self.remaining(order_id).is_some_and(|r| r > 0)
    }

    pub fn remove(&mut self, order_id: &str) {
        self.timers.remove(order_id);
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }

    pub fn views(&self) -> HashMap<String, CountdownView> {
        self.timers
            .iter()
            .map(|(id, remaining)| {
                let clamped = (*remaining).min(self.window_secs);
                let percent = (clamped * 100 / self.window_secs) as u8;
                (
                    id.clone(),
                    CountdownView {
                        remaining_secs: clamped,
                        percent,
                    },
                )
            })
            .collect()
    }
}
