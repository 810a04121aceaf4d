//! Auto-accept: in auto mode every placed order is moved to cooking without
//! an operator, once per order while the command is in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::api::OrderSource;
use crate::board::Board;

/// Order ids with an auto-accept command in flight.
#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
    ids: Arc<Mutex<HashSet<String>>>,
}

/// Held while an auto-accept command runs; releases the id on drop.
#[derive(Debug)]
pub struct InFlightClaim {
    ids: Arc<Mutex<HashSet<String>>>,
    order_id: String,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.remove(&self.order_id);
        }
    }
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `order_id`, or `None` when it is already in flight.
    pub fn try_claim(&self, order_id: &str) -> Option<InFlightClaim> {
        let mut ids = self.ids.lock().ok()?;
        if !ids.insert(order_id.to_string()) {
            return None;
        }
        Some(InFlightClaim {
            ids: self.ids.clone(),
            order_id: order_id.to_string(),
        })
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.ids.lock().map(|ids| ids.contains(order_id)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dispatch `accept_to_cooking` for every id not already in flight.
///
/// Outside a Tokio runtime nothing is dispatched; the orders are picked up
/// again by the next view published from inside one.
pub fn schedule_auto_accept<S: OrderSource>(board: &Arc<Board<S>>, placed: Vec<String>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!(pending = placed.len(), "no runtime, auto-accept deferred");
        return;
    };
    for order_id in placed {
        let Some(claim) = board.auto_accept().try_claim(&order_id) else {
            continue;
        };
        debug!(order_id = %order_id, "auto-accepting order");
        let board = board.clone();
        runtime.spawn(async move {
            let _claim = claim;
            if let Err(e) = board.auto_accept_order(&order_id).await {
                warn!(order_id = %order_id, error = %e, "auto-accept failed");
            }
        });
    }
}
