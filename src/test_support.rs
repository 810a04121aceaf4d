//! Builders and a scripted [`OrderSource`] shared by the unit tests.

use rusqlite::Connection;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::api::{LineRef, MutationContext, OrderSource};
use crate::board::Board;
use crate::config::BoardConfig;
use crate::db::{self, DbState};
use crate::error::ApiError;
use crate::fetcher::FetchKey;
use crate::model::{
    parse_order_time, FoodType, LineStatus, MenuLine, Order, OrderStatus, Snapshot,
};
use crate::session::{
    MemoryStore, Session, KEY_ACCESS_TOKEN, KEY_OUTLET_ID, KEY_REFRESH_TOKEN, KEY_USER_ID,
};

pub fn order(id: &str, status: OrderStatus, line_ids: &[&str]) -> Order {
    let menu_details = line_ids
        .iter()
        .map(|line_id| MenuLine {
            line_id: line_id.to_string(),
            menu_id: line_id.to_string(),
            menu_name: format!("dish {line_id}"),
            food_type: FoodType::Veg,
            quantity: 1,
            status: LineStatus::Cooking,
            comment: None,
            portion_id: None,
            half_or_full: None,
        })
        .collect();
    let mut order = Order {
        order_id: id.to_string(),
        order_number: format!("#{id}"),
        status,
        menu_details,
        date_time: Some("2025-09-23 12:00:00".into()),
        created_at: parse_order_time("2025-09-23 12:00:00"),
        actions_enabled: true,
        section_name: None,
        order_type: Some("dine-in".into()),
        table_number: Vec::new(),
    };
    if status == OrderStatus::Served {
        order.mark_all_lines_served();
    }
    order
}

pub fn order_at(id: &str, status: OrderStatus, date_time: &str) -> Order {
    let mut order = order(id, status, &["a"]);
    order.date_time = Some(date_time.to_string());
    order.created_at = parse_order_time(date_time);
    order
}

pub fn snapshot_with(placed: Vec<Order>, cooking: Vec<Order>, served: Vec<Order>) -> Snapshot {
    Snapshot {
        placed,
        cooking,
        paid: Vec::new(),
        served,
        subscription: None,
    }
}

pub fn test_db() -> Arc<DbState> {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .expect("pragma setup");
    db::run_migrations_for_test(&conn);
    Arc::new(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// A board for outlet 7 with a complete session; `pairs` override or add
/// session keys.
pub fn board_with(source: &Arc<FakeSource>, pairs: &[(&str, &str)]) -> Arc<Board<FakeSource>> {
    board_on(source, test_db(), pairs)
}

pub fn board_on(
    source: &Arc<FakeSource>,
    db: Arc<DbState>,
    pairs: &[(&str, &str)],
) -> Arc<Board<FakeSource>> {
    let mut values = vec![
        (KEY_ACCESS_TOKEN, "tok"),
        (KEY_REFRESH_TOKEN, "refresh"),
        (KEY_USER_ID, "9"),
        (KEY_OUTLET_ID, "7"),
    ];
    values.extend_from_slice(pairs);
    let session = Session::new(Arc::new(MemoryStore::with(&values)));
    Board::new(source.clone(), session, db, &BoardConfig::default())
}

/// A recorded remote mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    OrderStatus { order_id: String, status: String },
    LineStatus { order_id: String, menu_id: String },
}

/// Scripted order source. Queued responses are consumed first; once a queue
/// runs dry fetches repeat the last snapshot and mutations succeed.
#[derive(Default)]
pub struct FakeSource {
    snapshots: Mutex<VecDeque<Result<Snapshot, ApiError>>>,
    last_snapshot: Mutex<Snapshot>,
    mutation_results: Mutex<VecDeque<Result<(), ApiError>>>,
    refresh_results: Mutex<VecDeque<Result<String, ApiError>>>,
    pub fetch_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub mutations: Mutex<Vec<Mutation>>,
    pub tokens_seen: Mutex<Vec<String>>,
    pub keys_seen: Mutex<Vec<FetchKey>>,
    fetch_gate: Mutex<Option<Arc<Semaphore>>>,
    mutation_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_snapshot(&self, snapshot: Snapshot) {
        self.snapshots.lock().unwrap().push_back(Ok(snapshot));
    }

    pub fn push_fetch_error(&self, err: ApiError) {
        self.snapshots.lock().unwrap().push_back(Err(err));
    }

    pub fn push_mutation_result(&self, result: Result<(), ApiError>) {
        self.mutation_results.lock().unwrap().push_back(result);
    }

    pub fn push_refresh_result(&self, result: Result<String, ApiError>) {
        self.refresh_results.lock().unwrap().push_back(result);
    }

    /// Block fetches until permits are added to the returned semaphore.
    pub fn hold_fetches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.fetch_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Block mutations until permits are added to the returned semaphore.
    pub fn hold_mutations(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.mutation_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.mutations.lock().unwrap().clone()
    }

    async fn pass_gate(gate: &Mutex<Option<Arc<Semaphore>>>) {
        let gate = gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }

    fn next_mutation_result(&self) -> Result<(), ApiError> {
        self.mutation_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

impl OrderSource for FakeSource {
    async fn fetch_snapshot(&self, access_token: &str, key: &FetchKey) -> Result<Snapshot, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.tokens_seen.lock().unwrap().push(access_token.to_string());
        self.keys_seen.lock().unwrap().push(key.clone());
        Self::pass_gate(&self.fetch_gate).await;
        let next = self.snapshots.lock().unwrap().pop_front();
        match next {
            Some(Ok(snapshot)) => {
                *self.last_snapshot.lock().unwrap() = snapshot.clone();
                Ok(snapshot)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last_snapshot.lock().unwrap().clone()),
        }
    }

    async fn set_order_status(
        &self,
        access_token: &str,
        order_id: &str,
        status: OrderStatus,
        _ctx: &MutationContext,
    ) -> Result<(), ApiError> {
        self.tokens_seen.lock().unwrap().push(access_token.to_string());
        self.mutations.lock().unwrap().push(Mutation::OrderStatus {
            order_id: order_id.to_string(),
            status: status.as_str().to_string(),
        });
        Self::pass_gate(&self.mutation_gate).await;
        self.next_mutation_result()
    }

    async fn set_menu_line_status(
        &self,
        access_token: &str,
        order_id: &str,
        line: &LineRef,
        _status: LineStatus,
        _ctx: &MutationContext,
    ) -> Result<(), ApiError> {
        self.tokens_seen.lock().unwrap().push(access_token.to_string());
        self.mutations.lock().unwrap().push(Mutation::LineStatus {
            order_id: order_id.to_string(),
            menu_id: line.menu_id.clone(),
        });
        Self::pass_gate(&self.mutation_gate).await;
        self.next_mutation_result()
    }

    async fn refresh_access_token(&self, _refresh_token: &str) -> Result<String, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("refreshed-token".to_string()))
    }
}
