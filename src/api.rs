//! Order service API client.
//!
//! [`OrderSource`] is the seam between the board and the remote service: the
//! board only ever talks to it, and [`HttpOrderSource`] is the reqwest
//! implementation used by the runner. Tests use a scripted source instead.

use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::fetcher::FetchKey;
use crate::model::{LineStatus, OrderStatus, Snapshot};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const ORDER_LIST_PATH: &str = "/v2/common/cds_kds_order_listview";
const ORDER_STATUS_PATH: &str = "/v2/common/update_order_status";
const MENU_STATUS_PATH: &str = "/v2/common/update_menu_status";
const TOKEN_REFRESH_PATH: &str = "/common_api/token/refresh";

/// Who is issuing a status mutation. Sent along with every mutation body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationContext {
    pub outlet_id: String,
    pub user_id: Option<String>,
    pub device_token: Option<String>,
    pub app_source: String,
}

/// The menu line a line-level mutation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRef {
    pub menu_id: String,
    pub portion_id: Option<String>,
}

/// Remote order service as the board consumes it.
pub trait OrderSource: Send + Sync + 'static {
    fn fetch_snapshot(
        &self,
        access_token: &str,
        key: &FetchKey,
    ) -> impl Future<Output = Result<Snapshot, ApiError>> + Send;

    fn set_order_status(
        &self,
        access_token: &str,
        order_id: &str,
        status: OrderStatus,
        ctx: &MutationContext,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn set_menu_line_status(
        &self,
        access_token: &str,
        order_id: &str,
        line: &LineRef,
        status: LineStatus,
        ctx: &MutationContext,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Exchange a refresh token for a new access token.
    fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<String, ApiError>> + Send;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the API host:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_api_host(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach order service at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid order service URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        403 => "Not authorized for this outlet".to_string(),
        404 => "Order service endpoint not found".to_string(),
        s if s >= 500 => format!("Order service error (HTTP {s})"),
        s => format!("Unexpected response from order service (HTTP {s})"),
    }
}

/// Best message out of an error body: `detail`, `message` or `error`, else
/// the raw text, else a description of the status.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    let trimmed = body_text.trim();
    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        let message = ["detail", "message", "error", "msg"]
            .iter()
            .find_map(|k| json.get(*k).and_then(Value::as_str))
            .map(str::to_string);
        if let Some(message) = message {
            return message;
        }
    }
    if trimmed.is_empty() || trimmed.starts_with('<') {
        status_error(status)
    } else {
        trimmed.to_string()
    }
}

/// Numeric menu and portion ids go out as JSON numbers, anything else as a
/// string.
fn wire_id(id: &str) -> Value {
    match id.trim().parse::<u64>() {
        Ok(n) => json!(n),
        Err(_) => json!(id),
    }
}

// ---------------------------------------------------------------------------
// Mutation bodies
// ---------------------------------------------------------------------------

/// Ids go out as the strings the session stores.
fn order_status_body(order_id: &str, status: OrderStatus, ctx: &MutationContext) -> Value {
    json!({
        "order_id": order_id,
        "order_status": status.as_str(),
        "outlet_id": ctx.outlet_id,
        "user_id": ctx.user_id,
        "device_token": ctx.device_token,
        "app_source": ctx.app_source,
    })
}

fn menu_status_body(
    order_id: &str,
    line: &LineRef,
    status: LineStatus,
    ctx: &MutationContext,
) -> Value {
    let mut item = json!({ "menu_id": wire_id(&line.menu_id) });
    if let Some(portion) = &line.portion_id {
        item["portion_id"] = wire_id(portion);
    }
    json!({
        "outlet_id": ctx.outlet_id,
        "order_id": order_id,
        "menu_items": [item],
        "menu_status": status.as_str(),
        "app_source": ctx.app_source,
    })
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpOrderSource {
    client: Client,
    base: String,
}

impl HttpOrderSource {
    pub fn new(api_host: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base: normalize_api_host(api_host),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Send a JSON request and return the JSON response (null when empty).
    async fn send_json(
        &self,
        method: Method,
        path: &str,
        access_token: Option<&str>,
        body: &Value,
    ) -> Result<Value, ApiError> {
        let full_url = format!("{}{path}", self.base);
        let mut req = self
            .client
            .request(method.clone(), &full_url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = access_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::Network(friendly_error(&self.base, &e)))?;
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED {
            debug!(path, "order service answered 401");
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            let detail = error_detail(status, &body_text);
            warn!(%method, path, status = status.as_u16(), detail = %detail, "order service request failed");
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }

        let body_text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(friendly_error(&self.base, &e)))?;
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| ApiError::Decode(format!("{path}: {e}")))
    }
}

impl OrderSource for HttpOrderSource {
    async fn fetch_snapshot(&self, access_token: &str, key: &FetchKey) -> Result<Snapshot, ApiError> {
        let body = json!({
            "outlet_id": key.outlet_number().map(Value::from).unwrap_or_else(|| json!(key.outlet_id)),
            "date_filter": key.date_filter.as_str(),
        });
        let response = self
            .send_json(Method::POST, ORDER_LIST_PATH, Some(access_token), &body)
            .await?;
        Snapshot::from_response(&response)
    }

    async fn set_order_status(
        &self,
        access_token: &str,
        order_id: &str,
        status: OrderStatus,
        ctx: &MutationContext,
    ) -> Result<(), ApiError> {
        let body = order_status_body(order_id, status, ctx);
        self.send_json(Method::PATCH, ORDER_STATUS_PATH, Some(access_token), &body)
            .await?;
        debug!(order_id, status = %status, "order status updated remotely");
        Ok(())
    }

    async fn set_menu_line_status(
        &self,
        access_token: &str,
        order_id: &str,
        line: &LineRef,
        status: LineStatus,
        ctx: &MutationContext,
    ) -> Result<(), ApiError> {
        let body = menu_status_body(order_id, line, status, ctx);
        self.send_json(Method::PATCH, MENU_STATUS_PATH, Some(access_token), &body)
            .await?;
        debug!(order_id, menu_id = %line.menu_id, "menu line status updated remotely");
        Ok(())
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<String, ApiError> {
        let response = self
            .send_json(
                Method::POST,
                TOKEN_REFRESH_PATH,
                None,
                &json!({ "refresh": refresh_token }),
            )
            .await?;
        response
            .get("access")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| ApiError::Decode("token refresh response has no access token".into()))
    }
}
