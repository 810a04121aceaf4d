//! Reconciliation of the latest snapshot, the optimistic overlay and the
//! served-order cache into the four rendered buckets.
//!
//! [`merge`] is a pure function; the board calls it after every snapshot and
//! every overlay mutation.

use serde::Serialize;
use std::collections::HashSet;

use crate::model::{Bucket, Order, OrderStatus, Snapshot};
use crate::overlay::Overlay;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Buckets {
    pub placed: Vec<Order>,
    pub cooking: Vec<Order>,
    pub paid: Vec<Order>,
    pub served: Vec<Order>,
}

impl Buckets {
    pub fn get(&self, bucket: Bucket) -> &[Order] {
        match bucket {
            Bucket::Placed => &self.placed,
            Bucket::Cooking => &self.cooking,
            Bucket::Paid => &self.paid,
            Bucket::Served => &self.served,
        }
    }

    fn get_mut(&mut self, bucket: Bucket) -> &mut Vec<Order> {
        match bucket {
            Bucket::Placed => &mut self.placed,
            Bucket::Cooking => &mut self.cooking,
            Bucket::Paid => &mut self.paid,
            Bucket::Served => &mut self.served,
        }
    }

    pub fn find(&self, bucket: Bucket, order_id: &str) -> Option<&Order> {
        self.get(bucket).iter().find(|o| o.order_id == order_id)
    }

    pub fn contains(&self, bucket: Bucket, order_id: &str) -> bool {
        self.find(bucket, order_id).is_some()
    }

    /// Buckets the order currently appears in. Never more than one.
    pub fn buckets_of(&self, order_id: &str) -> Vec<Bucket> {
        Bucket::ALL
            .into_iter()
            .filter(|b| self.contains(*b, order_id))
            .collect()
    }

    pub fn ids(&self, bucket: Bucket) -> Vec<String> {
        self.get(bucket).iter().map(|o| o.order_id.clone()).collect()
    }
}

/// Merge the three sources into rendered buckets.
///
/// Bucket placement: the overlay beats the snapshot, and the snapshot beats
/// the cache. Within the served bucket field values follow snapshot, then
/// overlay, then cache. Orders in `cancelled` never appear. Each bucket keeps
/// only the lines relevant to it, and drops orders left without any; a
/// cooking order whose every line is served moves to the served bucket
/// instead of disappearing.
pub fn merge<'a>(
    snapshot: &Snapshot,
    overlay: &Overlay,
    cached: impl IntoIterator<Item = &'a Order>,
    cancelled: &HashSet<String>,
) -> Buckets {
    let mut buckets = Buckets::default();

    for bucket in Bucket::ALL {
        let target = bucket.status();

        let mut list: Vec<Order> = snapshot
            .list(bucket)
            .iter()
            .filter(|o| !cancelled.contains(&o.order_id))
            .filter(|o| {
                overlay
                    .get(&o.order_id)
                    .map_or(true, |entry| entry.target() == target)
            })
            .cloned()
            .collect();

        for entry in overlay.entries() {
            if entry.target() != target || cancelled.contains(&entry.order.order_id) {
                continue;
            }
            match list
                .iter()
                .position(|o| o.order_id == entry.order.order_id)
            {
                // The snapshot already agrees and its record wins for served.
                Some(_) if bucket == Bucket::Served => {}
                Some(pos) => list[pos] = entry.order.clone(),
                None => list.push(entry.order.clone()),
            }
        }

        *buckets.get_mut(bucket) = list;
    }

    // A cooking order with nothing left to cook is shown as served. An order
    // a pending command pinned to cooking stays there with its lines.
    let mut still_cooking = Vec::with_capacity(buckets.cooking.len());
    for mut order in std::mem::take(&mut buckets.cooking) {
        overlay.apply_line_patches(&mut order);
        let finished = !order.menu_details.is_empty() && order.all_lines_served();
        if !finished {
            order
                .menu_details
                .retain(|line| Bucket::Cooking.shows_line(line.status));
            if !order.menu_details.is_empty() {
                still_cooking.push(order);
            }
        } else if overlay.get(&order.order_id).is_some() {
            still_cooking.push(order);
        } else if !buckets.contains(Bucket::Served, &order.order_id) {
            buckets.served.push(order.moved_to(OrderStatus::Served));
        }
    }
    buckets.cooking = still_cooking;

    // Cached served orders fill gaps the snapshot leaves, unless the order is
    // known to be somewhere else right now.
    let mut from_cache = Vec::new();
    for order in cached {
        let id = &order.order_id;
        if cancelled.contains(id)
            || buckets.contains(Bucket::Served, id)
            || snapshot.find(id).is_some()
            || overlay
                .get(id)
                .is_some_and(|e| e.target() != OrderStatus::Served)
        {
            continue;
        }
        from_cache.push(order.moved_to(OrderStatus::Served));
    }
    buckets.served.extend(from_cache);

    buckets.served.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.order_id.cmp(&b.order_id))
    });

    // Cooking lines were filtered above.
    for bucket in [Bucket::Placed, Bucket::Paid, Bucket::Served] {
        let list = buckets.get_mut(bucket);
        for order in list.iter_mut() {
            overlay.apply_line_patches(order);
            order.menu_details.retain(|line| bucket.shows_line(line.status));
        }
        list.retain(|o| !o.menu_details.is_empty());
    }

    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LineStatus;
    use crate::test_support::{order, order_at, snapshot_with};

    const NO_CACHE: &[Order] = &[];

    fn no_cancelled() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn overlay_order_only_in_its_target_bucket() {
        let o1 = order("o1", OrderStatus::Placed, &["a"]);
        let o2 = order("o2", OrderStatus::Cooking, &["b"]);
        let o3 = order("o3", OrderStatus::Cooking, &["c"]);
        let snapshot = snapshot_with(vec![o1.clone()], vec![o2.clone(), o3.clone()], vec![]);

        let mut overlay = Overlay::new();
        overlay.record(o1.moved_to(OrderStatus::Cooking));
        overlay.record(o2.moved_to(OrderStatus::Served));
        overlay.record(o3.moved_to(OrderStatus::Placed));

        let buckets = merge(&snapshot, &overlay, NO_CACHE, &no_cancelled());
        assert_eq!(buckets.buckets_of("o1"), vec![Bucket::Cooking]);
        assert_eq!(buckets.buckets_of("o2"), vec![Bucket::Served]);
        assert_eq!(buckets.buckets_of("o3"), vec![Bucket::Placed]);
    }

    #[test]
    fn accept_moves_order_before_confirmation() {
        let o1 = order("o1", OrderStatus::Placed, &["a"]);
        let snapshot = snapshot_with(vec![o1.clone()], vec![], vec![]);
        let mut overlay = Overlay::new();
        overlay.record(o1.moved_to(OrderStatus::Cooking));

        let buckets = merge(&snapshot, &overlay, NO_CACHE, &no_cancelled());
        assert!(buckets.placed.is_empty());
        assert!(buckets.served.is_empty());
        assert_eq!(buckets.cooking.len(), 1);
        assert_eq!(buckets.cooking[0].status, OrderStatus::Cooking);
    }

    #[test]
    fn cached_served_order_survives_omission() {
        let o5 = order("o5", OrderStatus::Served, &["a"]);
        let snapshot = snapshot_with(vec![], vec![], vec![]);
        let buckets = merge(&snapshot, &Overlay::new(), &[o5], &no_cancelled());
        assert_eq!(buckets.ids(Bucket::Served), vec!["o5".to_string()]);
    }

    #[test]
    fn served_union_prefers_snapshot_then_overlay_then_cache() {
        let mut from_snapshot = order("s1", OrderStatus::Served, &["a"]);
        from_snapshot.order_number = "snapshot".into();
        let mut stale_cache = from_snapshot.clone();
        stale_cache.order_number = "cache".into();

        let cooking = order("s2", OrderStatus::Cooking, &["b"]);
        let mut moved = cooking.moved_to(OrderStatus::Served);
        moved.order_number = "overlay".into();
        let mut cached_s2 = moved.clone();
        cached_s2.order_number = "cache".into();

        let snapshot = snapshot_with(vec![], vec![cooking], vec![from_snapshot]);
        let mut overlay = Overlay::new();
        overlay.record(moved);

        let buckets = merge(&snapshot, &overlay, &[stale_cache, cached_s2], &no_cancelled());
        assert_eq!(buckets.served.len(), 2);
        assert_eq!(buckets.find(Bucket::Served, "s1").unwrap().order_number, "snapshot");
        assert_eq!(buckets.find(Bucket::Served, "s2").unwrap().order_number, "overlay");
        assert!(buckets.cooking.is_empty());
    }

    #[test]
    fn cached_order_listed_elsewhere_is_not_duplicated() {
        let paid = order("p1", OrderStatus::Paid, &["a"]);
        let cached = paid.moved_to(OrderStatus::Served);
        let snapshot = snapshot_with(vec![], vec![], vec![]);
        let snapshot = Snapshot {
            paid: vec![paid],
            ..snapshot
        };
        let buckets = merge(&snapshot, &Overlay::new(), &[cached], &no_cancelled());
        assert_eq!(buckets.buckets_of("p1"), vec![Bucket::Paid]);
    }

    #[test]
    fn served_bucket_sorted_newest_first() {
        let old = order_at("old", OrderStatus::Served, "2025-09-23 09:00:00");
        let new = order_at("new", OrderStatus::Served, "2025-09-23 11:00:00");
        let mid = order_at("mid", OrderStatus::Served, "2025-09-23 10:00:00");
        let snapshot = snapshot_with(vec![], vec![], vec![old]);
        let buckets = merge(&snapshot, &Overlay::new(), &[new, mid], &no_cancelled());
        assert_eq!(
            buckets.ids(Bucket::Served),
            vec!["new".to_string(), "mid".to_string(), "old".to_string()]
        );
    }

    #[test]
    fn line_patch_filters_cooking_lines_and_keeps_order_out_of_served() {
        let o2 = order("o2", OrderStatus::Cooking, &["line1", "line2"]);
        let snapshot = snapshot_with(vec![], vec![o2], vec![]);
        let mut overlay = Overlay::new();
        overlay.patch_line("o2", "line1");

        let buckets = merge(&snapshot, &overlay, NO_CACHE, &no_cancelled());
        let card = buckets.find(Bucket::Cooking, "o2").expect("still cooking");
        let lines: Vec<&str> = card.menu_details.iter().map(|l| l.line_id.as_str()).collect();
        assert_eq!(lines, vec!["line2"]);
        assert!(!buckets.contains(Bucket::Served, "o2"));
    }

    #[test]
    fn cooking_order_with_every_line_served_moves_to_served() {
        let mut o = order("o9", OrderStatus::Cooking, &["a", "b"]);
        for line in &mut o.menu_details {
            line.status = LineStatus::Served;
        }
        let snapshot = snapshot_with(vec![], vec![o], vec![]);
        let buckets = merge(&snapshot, &Overlay::new(), NO_CACHE, &no_cancelled());
        assert_eq!(buckets.buckets_of("o9"), vec![Bucket::Served]);
        let card = buckets.find(Bucket::Served, "o9").unwrap();
        assert_eq!(card.status, OrderStatus::Served);
        assert_eq!(card.menu_details.len(), 2);
    }

    #[test]
    fn patching_every_line_moves_order_to_served() {
        let o2 = order("o2", OrderStatus::Cooking, &["l1", "l2"]);
        let snapshot = snapshot_with(vec![], vec![o2], vec![]);
        let mut overlay = Overlay::new();
        overlay.patch_line("o2", "l1");
        overlay.patch_line("o2", "l2");

        let buckets = merge(&snapshot, &overlay, NO_CACHE, &no_cancelled());
        assert_eq!(buckets.buckets_of("o2"), vec![Bucket::Served]);
        assert!(buckets.find(Bucket::Served, "o2").unwrap().all_lines_served());
    }

    #[test]
    fn accepted_order_with_served_lines_stays_in_cooking() {
        let mut o = order("o8", OrderStatus::Placed, &["a"]);
        o.menu_details[0].status = LineStatus::Served;
        let snapshot = snapshot_with(vec![o.clone()], vec![], vec![]);
        let mut overlay = Overlay::new();
        overlay.record(o.moved_to(OrderStatus::Cooking));

        let buckets = merge(&snapshot, &overlay, NO_CACHE, &no_cancelled());
        assert_eq!(buckets.buckets_of("o8"), vec![Bucket::Cooking]);
    }

    #[test]
    fn serve_order_overlay_shows_every_line_served() {
        let o3 = order("o3", OrderStatus::Cooking, &["a", "b", "c"]);
        let snapshot = snapshot_with(vec![], vec![o3.clone()], vec![]);
        let mut overlay = Overlay::new();
        overlay.record(o3.moved_to(OrderStatus::Served));

        let buckets = merge(&snapshot, &overlay, NO_CACHE, &no_cancelled());
        let served = buckets.find(Bucket::Served, "o3").expect("served");
        assert_eq!(served.menu_details.len(), 3);
        assert!(served.all_lines_served());
    }

    #[test]
    fn cancelled_ids_vanish_from_every_source() {
        let placed = order("c1", OrderStatus::Placed, &["a"]);
        let cached = order("c1", OrderStatus::Served, &["a"]);
        let snapshot = snapshot_with(vec![placed.clone()], vec![], vec![]);
        let mut overlay = Overlay::new();
        overlay.record(placed.moved_to(OrderStatus::Cooking));
        let cancelled: HashSet<String> = ["c1".to_string()].into_iter().collect();

        let buckets = merge(&snapshot, &overlay, &[cached], &cancelled);
        assert!(buckets.buckets_of("c1").is_empty());
    }

    #[test]
    fn every_overlay_status_lands_in_exactly_its_bucket() {
        let statuses = [
            OrderStatus::Placed,
            OrderStatus::Cooking,
            OrderStatus::Paid,
            OrderStatus::Served,
        ];
        for from in statuses {
            for to in statuses {
                let mut base = order("x", from, &["a"]);
                base.menu_details[0].status = LineStatus::Cooking;
                let listed = base.moved_to(from);
                let snapshot = match from {
                    OrderStatus::Placed => snapshot_with(vec![listed], vec![], vec![]),
                    OrderStatus::Cooking => snapshot_with(vec![], vec![listed], vec![]),
                    OrderStatus::Served => snapshot_with(vec![], vec![], vec![listed]),
                    _ => Snapshot {
                        paid: vec![listed],
                        ..Snapshot::default()
                    },
                };
                let mut overlay = Overlay::new();
                overlay.record(base.moved_to(to));
                let buckets = merge(&snapshot, &overlay, NO_CACHE, &no_cancelled());
                assert_eq!(
                    buckets.buckets_of("x"),
                    vec![to.bucket().unwrap()],
                    "{from} -> {to}"
                );
            }
        }
    }
}
