//! Optimistic update overlay.
//!
//! Holds the local effect of every status command that has been applied but
//! not yet confirmed by a snapshot: whole-order moves (one entry per order
//! id) and single served lines. Entries leave only through [`Overlay::clear`]
//! (rollback, cancellation) or [`Overlay::reconcile`] (confirmation); a
//! snapshot that lags behind keeps them alive indefinitely.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::model::{LineStatus, Order, OrderStatus, Snapshot};

/// An order as it was optimistically moved, plus the sequence number of the
/// command that moved it.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayEntry {
    pub order: Order,
    pub seq: u64,
}

impl OverlayEntry {
    pub fn target(&self) -> OrderStatus {
        self.order.status
    }
}

#[derive(Debug, Default)]
pub struct Overlay {
    entries: HashMap<String, OverlayEntry>,
    /// order id -> line ids served locally but not yet confirmed
    line_patches: HashMap<String, BTreeSet<String>>,
    next_seq: u64,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `order.order_id`. The returned sequence
    /// number identifies this particular record for [`Overlay::clear_if_current`].
    pub fn record(&mut self, order: Order) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        if let Some(prev) = self.entries.get(&order.order_id) {
            debug!(
                order_id = %order.order_id,
                from = %prev.target(),
                to = %order.status,
                "replacing pending overlay entry"
            );
        }
        self.entries
            .insert(order.order_id.clone(), OverlayEntry { order, seq });
        seq
    }

    pub fn clear(&mut self, order_id: &str) -> Option<OverlayEntry> {
        self.entries.remove(order_id)
    }

    /// Remove the entry only if it is still the one recorded as `seq`; a newer
    /// command for the same order must not be rolled back by an older one.
    pub fn clear_if_current(&mut self, order_id: &str, seq: u64) -> bool {
        match self.entries.get(order_id) {
            Some(entry) if entry.seq == seq => {
                self.entries.remove(order_id);
                true
            }
            _ => false,
        }
    }

    /// Drop all entries and line patches. Sequence numbers keep counting, so
    /// a command issued before the reset can never match a later record.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.line_patches.clear();
    }

    /// Drop every local trace of an order: its entry and its line patches.
    pub fn forget_order(&mut self, order_id: &str) {
        self.entries.remove(order_id);
        self.line_patches.remove(order_id);
    }

    pub fn get(&self, order_id: &str) -> Option<&OverlayEntry> {
        self.entries.get(order_id)
    }

    /// Entries in the order their commands were issued.
    pub fn entries(&self) -> Vec<&OverlayEntry> {
        let mut entries: Vec<&OverlayEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.line_patches.is_empty()
    }

    /// Evict every entry the snapshot confirms (same id, same status) and
    /// every line patch the snapshot shows served. Returns the confirmed
    /// entries.
    pub fn reconcile(&mut self, snapshot: &Snapshot) -> Vec<OverlayEntry> {
        let confirmed_ids: Vec<String> = self
            .entries
            .values()
            .filter(|entry| {
                snapshot
                    .find(&entry.order.order_id)
                    .is_some_and(|o| o.status == entry.target())
            })
            .map(|entry| entry.order.order_id.clone())
            .collect();

        let mut confirmed = Vec::with_capacity(confirmed_ids.len());
        for id in confirmed_ids {
            if let Some(entry) = self.entries.remove(&id) {
                debug!(order_id = %id, status = %entry.target(), "overlay entry confirmed by snapshot");
                confirmed.push(entry);
            }
        }

        self.line_patches.retain(|order_id, lines| {
            if let Some(order) = snapshot.find(order_id) {
                lines.retain(|line_id| {
                    order.status != OrderStatus::Served
                        && order
                            .line(line_id)
                            .map_or(true, |l| l.status != LineStatus::Served)
                });
            }
            !lines.is_empty()
        });

        confirmed
    }

    /// Mark one line of an order as served locally. Returns `false` when the
    /// line was already patched.
    pub fn patch_line(&mut self, order_id: &str, line_id: &str) -> bool {
        self.line_patches
            .entry(order_id.to_string())
            .or_default()
            .insert(line_id.to_string())
    }

    pub fn revert_line(&mut self, order_id: &str, line_id: &str) -> bool {
        let Some(lines) = self.line_patches.get_mut(order_id) else {
            return false;
        };
        let removed = lines.remove(line_id);
        if lines.is_empty() {
            self.line_patches.remove(order_id);
        }
        removed
    }

    pub fn is_line_patched(&self, order_id: &str, line_id: &str) -> bool {
        self.line_patches
            .get(order_id)
            .is_some_and(|lines| lines.contains(line_id))
    }

    /// Apply this overlay's line patches to a copy of an order.
    pub fn apply_line_patches(&self, order: &mut Order) {
        if let Some(lines) = self.line_patches.get(&order.order_id) {
            for line in &mut order.menu_details {
                if lines.contains(&line.line_id) {
                    line.status = LineStatus::Served;
                }
            }
        }
    }
}
