//! Order records as the board sees them, and ingestion of the remote
//! order-list response into a [`Snapshot`].
//!
//! The remote payload is loosely typed (numeric ids, 0/1 flags, optional
//! lists), so ingestion walks `serde_json::Value` and tolerates missing or
//! malformed pieces instead of failing the whole poll. The typed records are
//! serde-serializable in their own shape for the served-order cache.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

use crate::error::ApiError;

/// Role that may watch the board but never act on it.
pub const READ_ONLY_ROLE: &str = "super_owner";

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Placed,
    Cooking,
    Served,
    Paid,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Placed => "placed",
            OrderStatus::Cooking => "cooking",
            OrderStatus::Served => "served",
            OrderStatus::Paid => "paid",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a wire status. Unknown strings yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "placed" => Some(OrderStatus::Placed),
            "cooking" => Some(OrderStatus::Cooking),
            "served" => Some(OrderStatus::Served),
            "paid" => Some(OrderStatus::Paid),
            "cancelled" | "canceled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// The bucket an order with this status is rendered in.
    pub fn bucket(self) -> Option<Bucket> {
        match self {
            OrderStatus::Placed => Some(Bucket::Placed),
            OrderStatus::Cooking => Some(Bucket::Cooking),
            OrderStatus::Paid => Some(Bucket::Paid),
            OrderStatus::Served => Some(Bucket::Served),
            OrderStatus::Cancelled => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineStatus {
    #[default]
    Cooking,
    Served,
}

impl LineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LineStatus::Cooking => "cooking",
            LineStatus::Served => "served",
        }
    }
}

/// Food-type tag shown next to each line.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FoodType {
    Veg,
    NonVeg,
    Vegan,
    #[default]
    Other,
}

impl FoodType {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "veg" => FoodType::Veg,
            "nonveg" => FoodType::NonVeg,
            "vegan" => FoodType::Vegan,
            _ => FoodType::Other,
        }
    }
}

/// One of the four rendered order groupings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Placed,
    Cooking,
    Paid,
    Served,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [Bucket::Placed, Bucket::Cooking, Bucket::Paid, Bucket::Served];

    pub fn status(self) -> OrderStatus {
        match self {
            Bucket::Placed => OrderStatus::Placed,
            Bucket::Cooking => OrderStatus::Cooking,
            Bucket::Paid => OrderStatus::Paid,
            Bucket::Served => OrderStatus::Served,
        }
    }

    /// Key of this bucket's list in the order-list response.
    fn wire_key(self) -> &'static str {
        match self {
            Bucket::Placed => "placed_orders",
            Bucket::Cooking => "cooking_orders",
            Bucket::Paid => "paid_orders",
            Bucket::Served => "served_orders",
        }
    }

    /// Whether a line with `status` is shown on an order card in this bucket.
    pub fn shows_line(self, status: LineStatus) -> bool {
        match self {
            Bucket::Cooking => status != LineStatus::Served,
            Bucket::Served => status == LineStatus::Served,
            Bucket::Placed | Bucket::Paid => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuLine {
    /// Identifier used by `serve_menu_line`: the menu id, qualified with the
    /// portion id when the line has one.
    pub line_id: String,
    pub menu_id: String,
    pub menu_name: String,
    #[serde(default)]
    pub food_type: FoodType,
    pub quantity: u32,
    #[serde(default)]
    pub status: LineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portion_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_or_full: Option<String>,
}

impl MenuLine {
    fn from_wire(v: &Value, index: usize) -> Self {
        let menu_id = id_any(v, &["menu_id", "id"]).unwrap_or_else(|| format!("line-{index}"));
        let portion_id = id_any(v, &["portion_id"]).filter(|p| p != "0");
        let line_id = match &portion_id {
            Some(portion) => format!("{menu_id}:{portion}"),
            None => menu_id.clone(),
        };
        let status = match str_any(v, &["menu_status", "status"]).as_deref() {
            Some(s) if s.eq_ignore_ascii_case("served") => LineStatus::Served,
            _ => LineStatus::Cooking,
        };
        Self {
            line_id,
            menu_name: str_any(v, &["menu_name", "name"]).unwrap_or_else(|| menu_id.clone()),
            menu_id,
            food_type: str_any(v, &["food_type"])
                .map(|f| FoodType::parse(&f))
                .unwrap_or_default(),
            quantity: u32_any(v, &["quantity", "qty"]).unwrap_or(1),
            status,
            comment: str_any(v, &["comment"]),
            portion_id,
            half_or_full: str_any(v, &["half_or_full", "portion_name"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub order_number: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub menu_details: Vec<MenuLine>,
    /// Creation time as the server sent it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    /// `date_time` parsed, when it is in a recognised format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<NaiveDateTime>,
    /// Whether the operator may act on this order right now.
    #[serde(default)]
    pub actions_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub table_number: Vec<String>,
}

impl Order {
    /// Build an order from one entry of a bucket list. The list the entry came
    /// from decides its status. Returns `None` when the entry has no usable id.
    pub fn from_wire(v: &Value, status: OrderStatus) -> Option<Self> {
        if !v.is_object() {
            return None;
        }
        let order_id = id_any(v, &["order_id", "id"])?;

        if let Some(wire_status) = str_any(v, &["order_status", "status"]) {
            if OrderStatus::parse(&wire_status) != Some(status) {
                debug!(
                    order_id = %order_id,
                    wire_status = %wire_status,
                    list_status = %status,
                    "order status disagrees with its list, using the list"
                );
            }
        }

        let menu_details = v
            .get("menu_details")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| l.is_object())
                    .map(|(i, l)| MenuLine::from_wire(l, i))
                    .collect()
            })
            .unwrap_or_default();

        let date_time = str_any(v, &["date_time", "created_at"]);
        let created_at = date_time.as_deref().and_then(parse_order_time);

        let table_number = match v.get("table_number") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|t| match t {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
            Some(Value::Number(n)) => vec![n.to_string()],
            _ => Vec::new(),
        };

        let mut order = Self {
            order_number: id_any(v, &["order_number"]).unwrap_or_else(|| order_id.clone()),
            order_id,
            status,
            menu_details,
            date_time,
            created_at,
            actions_enabled: bool_any(v, &["kds_button_enabled"]).unwrap_or(false),
            section_name: str_any(v, &["section_name"]),
            order_type: str_any(v, &["order_type"]),
            table_number,
        };
        if status == OrderStatus::Served {
            order.mark_all_lines_served();
        }
        Some(order)
    }

    /// Every line of a served order is served.
    pub fn mark_all_lines_served(&mut self) {
        for line in &mut self.menu_details {
            line.status = LineStatus::Served;
        }
    }

    /// Copy of this order moved to `status`, with lines normalized when the
    /// target is served.
    pub fn moved_to(&self, status: OrderStatus) -> Order {
        let mut moved = self.clone();
        moved.status = status;
        if status == OrderStatus::Served {
            moved.mark_all_lines_served();
        }
        moved
    }

    pub fn line(&self, line_id: &str) -> Option<&MenuLine> {
        self.menu_details.iter().find(|l| l.line_id == line_id)
    }

    pub fn all_lines_served(&self) -> bool {
        self.menu_details
            .iter()
            .all(|l| l.status == LineStatus::Served)
    }

    /// Section name, or the order type with its table numbers.
    pub fn table_label(&self) -> String {
        if let Some(section) = &self.section_name {
            return section.clone();
        }
        let order_type = self.order_type.clone().unwrap_or_default();
        if self.table_number.is_empty() {
            order_type
        } else {
            format!("{order_type} - {}", self.table_number.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionUrgency {
    Ok,
    Warning,
    Critical,
}

/// Subscription details the order list carries alongside the buckets. Fields
/// the board does not interpret are kept verbatim for the session layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl SubscriptionDetails {
    fn start(&self) -> Option<NaiveDate> {
        self.start_date.as_deref().and_then(parse_date)
    }

    fn end(&self) -> Option<NaiveDate> {
        self.end_date.as_deref().and_then(parse_date)
    }

    /// Length of the subscription in days, when both ends are known.
    pub fn total_days(&self) -> Option<i64> {
        Some((self.end()? - self.start()?).num_days())
    }

    /// Days left until `end_date`, never negative.
    pub fn remaining_days(&self, today: NaiveDate) -> Option<i64> {
        Some((self.end()? - today).num_days().max(0))
    }

    pub fn urgency(&self, today: NaiveDate) -> Option<SubscriptionUrgency> {
        let remaining = self.remaining_days(today)?;
        Some(if remaining <= 5 {
            SubscriptionUrgency::Critical
        } else if remaining <= 15 {
            SubscriptionUrgency::Warning
        } else {
            SubscriptionUrgency::Ok
        })
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One poll's full partition of orders by status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub placed: Vec<Order>,
    pub cooking: Vec<Order>,
    pub paid: Vec<Order>,
    pub served: Vec<Order>,
    pub subscription: Option<SubscriptionDetails>,
}

impl Snapshot {
    /// Ingest an order-list response body.
    ///
    /// A missing or non-array list is an empty bucket, and an entry that
    /// cannot be read is skipped; only a body that is not a JSON object at
    /// all is an error.
    pub fn from_response(body: &Value) -> Result<Self, ApiError> {
        if !body.is_object() {
            return Err(ApiError::Decode("expected a JSON object".into()));
        }

        let mut snapshot = Snapshot::default();
        let mut seen: HashSet<String> = HashSet::new();

        for bucket in Bucket::ALL {
            let key = bucket.wire_key();
            let entries = match body.get(key) {
                Some(Value::Array(entries)) => entries,
                None | Some(Value::Null) => {
                    debug!(list = key, "order list missing from response, treating as empty");
                    continue;
                }
                Some(other) => {
                    warn!(list = key, kind = %json_kind(other), "order list is not an array, treating as empty");
                    continue;
                }
            };

            let list = snapshot.list_mut(bucket);
            for entry in entries {
                let Some(order) = Order::from_wire(entry, bucket.status()) else {
                    warn!(list = key, "skipping order entry without an order id");
                    continue;
                };
                if !seen.insert(order.order_id.clone()) {
                    warn!(list = key, order_id = %order.order_id, "order listed twice in one snapshot, keeping the first");
                    continue;
                }
                list.push(order);
            }
        }

        snapshot.subscription = match body.get("subscription_details") {
            Some(v) if v.is_object() => serde_json::from_value(v.clone())
                .map_err(|e| warn!("ignoring unreadable subscription_details: {e}"))
                .ok(),
            _ => None,
        };

        Ok(snapshot)
    }

    pub fn list(&self, bucket: Bucket) -> &[Order] {
        match bucket {
            Bucket::Placed => &self.placed,
            Bucket::Cooking => &self.cooking,
            Bucket::Paid => &self.paid,
            Bucket::Served => &self.served,
        }
    }

    fn list_mut(&mut self, bucket: Bucket) -> &mut Vec<Order> {
        match bucket {
            Bucket::Placed => &mut self.placed,
            Bucket::Cooking => &mut self.cooking,
            Bucket::Paid => &mut self.paid,
            Bucket::Served => &mut self.served,
        }
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        Bucket::ALL.into_iter().flat_map(|b| self.list(b).iter())
    }

    pub fn find(&self, order_id: &str) -> Option<&Order> {
        self.orders().find(|o| o.order_id == order_id)
    }

    pub fn is_empty(&self) -> bool {
        self.orders().next().is_none()
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn str_any(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(Value::as_str) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Identifiers arrive as strings or numbers; both compare as strings.
fn id_any(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn u32_any(v: &Value, keys: &[&str]) -> Option<u32> {
    for key in keys {
        match v.get(*key) {
            Some(Value::Number(n)) => {
                if let Some(q) = n.as_u64().and_then(|q| u32::try_from(q).ok()) {
                    return Some(q);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(q) = s.trim().parse::<u32>() {
                    return Some(q);
                }
            }
            _ => {}
        }
    }
    None
}

fn bool_any(v: &Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        let value = match v.get(*key) {
            Some(value) => value,
            None => continue,
        };

        if let Some(flag) = value.as_bool() {
            return Some(flag);
        }
        if let Some(flag) = value.as_i64() {
            return Some(flag == 1);
        }
        if let Some(flag) = value.as_str() {
            let normalized = flag.trim().to_ascii_lowercase();
            if matches!(normalized.as_str(), "true" | "1" | "yes" | "on") {
                return Some(true);
            }
            if matches!(normalized.as_str(), "false" | "0" | "no" | "off") {
                return Some(false);
            }
        }
    }
    None
}

const ORDER_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d %b %Y %I:%M:%S %p",
    "%d %b %Y %I:%M %p",
    "%d-%m-%Y %H:%M:%S",
    "%d-%b-%Y %I:%M:%S %p",
];

/// Parse the order creation time in any of the formats the service emits.
pub fn parse_order_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    ORDER_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d %b %Y"))
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d-%m-%Y"))
        .ok()
        .or_else(|| parse_order_time(raw).map(|dt| dt.date()))
}
