//! New-item detection for orders that gain lines while on the board.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::model::{LineStatus, Order, Snapshot};

/// How long an added line stays flagged.
pub const HIGHLIGHT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct NewItemTracker {
    /// order id -> menu names in the previous snapshot
    seen: HashMap<String, HashSet<String>>,
    /// order id -> line id -> when it was first seen
    flagged: HashMap<String, HashMap<String, Instant>>,
    highlight: Duration,
}

impl Default for NewItemTracker {
    fn default() -> Self {
        Self::new(HIGHLIGHT_WINDOW)
    }
}

impl NewItemTracker {
    pub fn new(highlight: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            flagged: HashMap::new(),
            highlight,
        }
    }

    /// Compare `snapshot` with the previous one. Orders seen for the first
    /// time flag nothing.
    pub fn observe(&mut self, snapshot: &Snapshot, now: Instant) {
        let mut seen = HashMap::new();
        for order in snapshot.orders() {
            let names: HashSet<String> = order
                .menu_details
                .iter()
                .map(|l| l.menu_name.clone())
                .collect();
            if let Some(previous) = self.seen.get(&order.order_id) {
                for line in &order.menu_details {
                    if line.status == LineStatus::Served || previous.contains(&line.menu_name) {
                        continue;
                    }
                    debug!(order_id = %order.order_id, line_id = %line.line_id, "new item on order");
                    self.flagged
                        .entry(order.order_id.clone())
                        .or_default()
                        .entry(line.line_id.clone())
                        .or_insert(now);
                }
            }
            seen.insert(order.order_id.clone(), names);
        }
        self.seen = seen;

        let highlight = self.highlight;
        let seen = &self.seen;
        self.flagged.retain(|order_id, lines| {
            lines.retain(|_, since| now.duration_since(*since) < highlight);
            seen.contains_key(order_id) && !lines.is_empty()
        });
    }

    pub fn is_new(&self, order_id: &str, line_id: &str, now: Instant) -> bool {
        self.flagged
            .get(order_id)
            .and_then(|lines| lines.get(line_id))
            .is_some_and(|since| now.duration_since(*since) < self.highlight)
    }

    /// Move flagged lines to the front of each order (stable otherwise) and
    /// return the flagged line ids per order.
    pub fn apply(&self, orders: &mut [Order], now: Instant) -> BTreeMap<String, Vec<String>> {
        let mut flagged = BTreeMap::new();
        for order in orders.iter_mut() {
            let order_id = order.order_id.clone();
            order
                .menu_details
                .sort_by_key(|l| !self.is_new(&order_id, &l.line_id, now));
            let ids: Vec<String> = order
                .menu_details
                .iter()
                .filter(|l| self.is_new(&order_id, &l.line_id, now))
                .map(|l| l.line_id.clone())
                .collect();
            if !ids.is_empty() {
                flagged.insert(order_id, ids);
            }
        }
        flagged
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.flagged.clear();
    }
}
