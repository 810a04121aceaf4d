//! Remote order fetcher.
//!
//! One fetch at a time per [`FetchKey`]: a caller that arrives while a fetch
//! for the same key is in flight waits for that result instead of issuing a
//! second request.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::api::OrderSource;
use crate::error::ApiError;
use crate::model::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateFilter {
    #[default]
    Today,
    All,
}

impl DateFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            DateFilter::Today => "today",
            DateFilter::All => "all",
        }
    }
}

impl fmt::Display for DateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DateFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "today" => Ok(DateFilter::Today),
            "all" => Ok(DateFilter::All),
            other => Err(format!("unknown date filter: {other}")),
        }
    }
}

/// What a snapshot is fetched for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    pub outlet_id: String,
    pub date_filter: DateFilter,
}

impl FetchKey {
    pub fn new(outlet_id: impl Into<String>, date_filter: DateFilter) -> Self {
        Self {
            outlet_id: outlet_id.into(),
            date_filter,
        }
    }

    /// The outlet id as the service expects it: a positive integer.
    pub fn outlet_number(&self) -> Option<u64> {
        self.outlet_id.trim().parse::<u64>().ok().filter(|n| *n > 0)
    }
}

type Waiters = Vec<oneshot::Sender<Result<Snapshot, ApiError>>>;

pub struct Fetcher<S> {
    source: Arc<S>,
    in_flight: Mutex<HashMap<FetchKey, Waiters>>,
}

/// Unregisters the key if the leading fetch is dropped before it finishes,
/// so waiters see a closed channel rather than hanging.
struct LeaderGuard<'a> {
    in_flight: &'a Mutex<HashMap<FetchKey, Waiters>>,
    key: &'a FetchKey,
    done: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Ok(mut map) = self.in_flight.lock() {
                map.remove(self.key);
            }
        }
    }
}

impl<S: OrderSource> Fetcher<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Fetch a snapshot for `key`, joining an in-flight fetch when there is one.
    pub async fn fetch(&self, access_token: &str, key: &FetchKey) -> Result<Snapshot, ApiError> {
        let waiter = {
            let mut map = self
                .in_flight
                .lock()
                .map_err(|e| ApiError::Network(format!("fetcher state poisoned: {e}")))?;
            match map.get_mut(key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    map.insert(key.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            debug!(outlet_id = %key.outlet_id, filter = %key.date_filter, "joining in-flight fetch");
            return rx
                .await
                .unwrap_or_else(|_| Err(ApiError::Network("fetch was abandoned".into())));
        }

        let mut guard = LeaderGuard {
            in_flight: &self.in_flight,
            key,
            done: false,
        };
        let result = self.source.fetch_snapshot(access_token, key).await;

        let waiters = match self.in_flight.lock() {
            Ok(mut map) => map.remove(key).unwrap_or_default(),
            Err(e) => {
                warn!("fetcher state poisoned: {e}");
                Vec::new()
            }
        };
        guard.done = true;

        if !waiters.is_empty() {
            debug!(waiters = waiters.len(), "sharing fetch result");
        }
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
        result
    }

    #[cfg(test)]
    fn waiters(&self, key: &FetchKey) -> Option<usize> {
        self.in_flight.lock().unwrap().get(key).map(Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderStatus;
    use crate::test_support::{order, snapshot_with, FakeSource};
    use std::time::Duration;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn date_filter_parsing() {
        assert_eq!("today".parse::<DateFilter>(), Ok(DateFilter::Today));
        assert_eq!(" ALL ".parse::<DateFilter>(), Ok(DateFilter::All));
        assert!("week".parse::<DateFilter>().is_err());
        assert_eq!(DateFilter::default().as_str(), "today");
    }

    #[test]
    fn outlet_must_be_a_positive_integer() {
        assert_eq!(FetchKey::new("42", DateFilter::Today).outlet_number(), Some(42));
        assert_eq!(FetchKey::new("0", DateFilter::Today).outlet_number(), None);
        assert_eq!(FetchKey::new("abc", DateFilter::All).outlet_number(), None);
        assert_eq!(FetchKey::new("", DateFilter::All).outlet_number(), None);
    }

    #[tokio::test]
    async fn concurrent_fetches_for_one_key_share_a_request() {
        let source = FakeSource::new();
        source.push_snapshot(snapshot_with(
            vec![order("o1", OrderStatus::Placed, &["a"])],
            vec![],
            vec![],
        ));
        let gate = source.hold_fetches();
        let fetcher = Arc::new(Fetcher::new(source.clone()));
        let key = FetchKey::new("7", DateFilter::Today);

        let first = tokio::spawn({
            let (fetcher, key) = (fetcher.clone(), key.clone());
            async move { fetcher.fetch("tok", &key).await }
        });
        wait_until(|| source.fetches() == 1).await;

        let second = tokio::spawn({
            let (fetcher, key) = (fetcher.clone(), key.clone());
            async move { fetcher.fetch("tok", &key).await }
        });
        wait_until(|| fetcher.waiters(&key) == Some(1)).await;

        gate.add_permits(1);
        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.placed[0].order_id, "o1");
        assert_eq!(source.fetches(), 1);
        assert_eq!(fetcher.waiters(&key), None);
    }

    #[tokio::test]
    async fn different_keys_fetch_independently() {
        let source = FakeSource::new();
        let fetcher = Fetcher::new(source.clone());
        fetcher
            .fetch("tok", &FetchKey::new("7", DateFilter::Today))
            .await
            .unwrap();
        fetcher
            .fetch("tok", &FetchKey::new("7", DateFilter::All))
            .await
            .unwrap();
        assert_eq!(source.fetches(), 2);
        let keys = source.keys_seen.lock().unwrap().clone();
        assert_eq!(keys[1].date_filter, DateFilter::All);
    }

    #[tokio::test]
    async fn errors_are_shared_too() {
        let source = FakeSource::new();
        source.push_fetch_error(ApiError::Unauthorized);
        let fetcher = Fetcher::new(source.clone());
        let err = fetcher
            .fetch("tok", &FetchKey::new("7", DateFilter::Today))
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn dropped_leader_releases_the_key() {
        let source = FakeSource::new();
        let gate = source.hold_fetches();
        let fetcher = Arc::new(Fetcher::new(source.clone()));
        let key = FetchKey::new("7", DateFilter::Today);

        let leader = tokio::spawn({
            let (fetcher, key) = (fetcher.clone(), key.clone());
            async move { fetcher.fetch("tok", &key).await }
        });
        wait_until(|| source.fetches() == 1).await;
        leader.abort();
        let _ = leader.await;
        assert_eq!(fetcher.waiters(&key), None);

        gate.add_permits(1);
        fetcher.fetch("tok", &key).await.unwrap();
        assert_eq!(source.fetches(), 2);
    }
}
