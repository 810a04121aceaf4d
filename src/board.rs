//! The live board: shared state, the published view, and the background
//! poll and countdown tasks.
//!
//! All state sits behind one `std::sync::Mutex` that is never held across an
//! await. Every effect takes the lock, mutates, re-renders and publishes a new
//! [`BoardView`] on a `watch` channel before releasing it, so the published
//! views are totally ordered. The only suspension points are network calls.
//!
//! Switching outlet or date filter starts a new generation: in-flight fetches
//! of the old one are cancelled and any result that still arrives tagged with
//! an older generation is dropped.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::api::OrderSource;
use crate::config::BoardConfig;
use crate::countdown::{CountdownView, Countdowns};
use crate::db::{self, DbState};
use crate::error::{ApiError, BoardError};
use crate::fetcher::{DateFilter, FetchKey, Fetcher};
use crate::merge::{merge, Buckets};
use crate::model::{Bucket, Snapshot, SubscriptionDetails};
use crate::new_items::NewItemTracker;
use crate::overlay::Overlay;
use crate::scheduler::{self, InFlightSet};
use crate::served_cache::ServedCache;
use crate::session::Session;

/// Everything the rendering layer needs to draw the board.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BoardView {
    pub outlet_id: Option<String>,
    pub date_filter: DateFilter,
    pub buckets: Buckets,
    /// Cooking-bucket lines added since the order was first seen.
    pub new_line_ids: BTreeMap<String, Vec<String>>,
    /// Reject countdowns. Empty in auto mode.
    pub countdowns: BTreeMap<String, CountdownView>,
    pub last_refreshed: Option<DateTime<Local>>,
    pub loading: bool,
    pub error: Option<String>,
    pub session_invalid: bool,
    pub manual_mode: bool,
    pub read_only: bool,
    pub subscription: Option<SubscriptionDetails>,
}

pub type SubscriptionListener = Box<dyn Fn(Option<&SubscriptionDetails>) + Send + Sync>;

pub(crate) struct BoardState {
    pub(crate) outlet_id: Option<String>,
    pub(crate) date_filter: DateFilter,
    pub(crate) generation: u64,
    pub(crate) key_token: CancellationToken,
    pub(crate) snapshot: Snapshot,
    pub(crate) overlay: Overlay,
    /// Orders cancelled on this board; ignored in every later snapshot.
    pub(crate) cancelled: HashSet<String>,
    pub(crate) cache: Option<ServedCache>,
    pub(crate) new_items: NewItemTracker,
    pub(crate) countdowns: Countdowns,
    pub(crate) subscription: Option<SubscriptionDetails>,
    pub(crate) last_refreshed: Option<DateTime<Local>>,
    pub(crate) loading: bool,
    pub(crate) error: Option<String>,
    pub(crate) session_invalid: bool,
    pub(crate) manual_mode: bool,
}

impl BoardState {
    pub(crate) fn key(&self) -> Option<FetchKey> {
        self.outlet_id
            .as_ref()
            .map(|outlet| FetchKey::new(outlet.clone(), self.date_filter))
    }
}

pub struct Board<S: OrderSource> {
    pub(crate) fetcher: Fetcher<S>,
    pub(crate) session: Session,
    pub(crate) db: Arc<DbState>,
    poll_interval: Duration,
    pub(crate) app_source: String,
    pub(crate) device_token: Option<String>,
    pub(crate) read_only: bool,
    state: Mutex<BoardState>,
    views: watch::Sender<BoardView>,
    subscription_listener: Mutex<Option<SubscriptionListener>>,
    auto_accept: InFlightSet,
    reauth: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

fn open_cache(db: &Arc<DbState>, outlet_id: &str) -> ServedCache {
    match ServedCache::open(db.clone(), outlet_id) {
        Ok(cache) => cache,
        Err(e) => {
            warn!(outlet_id, error = %e, "served cache unreadable, starting empty");
            ServedCache::empty(db.clone(), outlet_id)
        }
    }
}

impl<S: OrderSource> Board<S> {
    /// Build a board for the outlet stored in the session, if any. Nothing is
    /// fetched until [`Board::start`] or [`Board::refresh_now`].
    pub fn new(source: Arc<S>, session: Session, db: Arc<DbState>, config: &BoardConfig) -> Arc<Self> {
        let (manual_mode, stored_device) = match db.conn.lock() {
            Ok(conn) => (
                db::load_manual_mode(&conn),
                db::device_id(&conn)
                    .map_err(|e| warn!("device id unavailable: {e}"))
                    .ok(),
            ),
            Err(e) => {
                warn!("database lock poisoned: {e}");
                (true, None)
            }
        };
        let device_token = session.device_id().or(stored_device);
        let outlet_id = session.outlet_id();
        let cache = outlet_id.as_deref().map(|outlet| open_cache(&db, outlet));
        let read_only = session.is_read_only();

        let state = BoardState {
            outlet_id,
            date_filter: config.date_filter,
            generation: 0,
            key_token: CancellationToken::new(),
            snapshot: Snapshot::default(),
            overlay: Overlay::new(),
            cancelled: HashSet::new(),
            cache,
            new_items: NewItemTracker::default(),
            countdowns: Countdowns::new(config.reject_window),
            subscription: None,
            last_refreshed: None,
            loading: false,
            error: None,
            session_invalid: false,
            manual_mode,
        };

        let (views, _) = watch::channel(BoardView::default());
        let board = Arc::new(Self {
            fetcher: Fetcher::new(source),
            session,
            db,
            poll_interval: config.poll_interval,
            app_source: config.app_source.clone(),
            device_token,
            read_only,
            state: Mutex::new(state),
            views,
            subscription_listener: Mutex::new(None),
            auto_accept: InFlightSet::new(),
            reauth: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        });
        {
            let mut state = board.lock();
            board.publish(&mut state);
        }
        info!(manual_mode, read_only, "board created");
        board
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> watch::Receiver<BoardView> {
        self.views.subscribe()
    }

    /// The most recently published view.
    pub fn view(&self) -> BoardView {
        self.views.borrow().clone()
    }

    /// Called whenever a snapshot carries different subscription details
    /// than the one before it.
    pub fn on_subscription_change(
        &self,
        listener: impl Fn(Option<&SubscriptionDetails>) + Send + Sync + 'static,
    ) {
        if let Ok(mut slot) = self.subscription_listener.lock() {
            *slot = Some(Box::new(listener));
        }
    }

    pub(crate) fn auto_accept(&self) -> &InFlightSet {
        &self.auto_accept
    }

    pub fn is_session_invalid(&self) -> bool {
        self.lock().session_invalid
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    /// Render the current state and publish it. Returns the placed orders the
    /// auto-accept scheduler should pick up.
    pub(crate) fn publish(&self, state: &mut BoardState) -> Vec<String> {
        let now = Instant::now();
        let mut buckets = merge(
            &state.snapshot,
            &state.overlay,
            state.cache.iter().flat_map(|cache| cache.values()),
            &state.cancelled,
        );
        state.countdowns.observe(&buckets.placed);
        let new_line_ids = state.new_items.apply(&mut buckets.cooking, now);

        let countdowns = if state.manual_mode {
            state.countdowns.views().into_iter().collect()
        } else {
            BTreeMap::new()
        };
        let auto_accept = if !state.manual_mode && !state.session_invalid {
            buckets.ids(Bucket::Placed)
        } else {
            Vec::new()
        };

        let view = BoardView {
            outlet_id: state.outlet_id.clone(),
            date_filter: state.date_filter,
            buckets,
            new_line_ids,
            countdowns,
            last_refreshed: state.last_refreshed,
            loading: state.loading,
            error: state.error.clone(),
            session_invalid: state.session_invalid,
            manual_mode: state.manual_mode,
            read_only: self.read_only,
            subscription: state.subscription.clone(),
        };
        self.views.send_replace(view);
        auto_accept
    }

    /// Publish and release the lock, then hand placed orders to auto-accept.
    pub(crate) fn commit(self: &Arc<Self>, mut state: MutexGuard<'_, BoardState>) {
        let accept = self.publish(&mut state);
        drop(state);
        if !accept.is_empty() {
            scheduler::schedule_auto_accept(self, accept);
        }
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    pub(crate) fn current_token(&self) -> Result<Zeroizing<String>, BoardError> {
        self.session.access_token().map_err(|e| {
            self.invalidate_session("no access token in session");
            e
        })
    }

    /// Stop acting on behalf of the session. The poll loop ends on its next
    /// pass and the view reports `session_invalid`.
    pub(crate) fn invalidate_session(&self, reason: &str) {
        let mut state = self.lock();
        if state.session_invalid {
            return;
        }
        warn!(reason, "session is no longer valid");
        state.session_invalid = true;
        state.loading = false;
        state.error = Some(BoardError::SessionInvalid.to_string());
        self.publish(&mut state);
    }

    /// Replace a rejected access token. Concurrent callers refresh once: a
    /// caller that finds the token already replaced uses the new one.
    pub(crate) async fn reauthenticate(&self, rejected: &str) -> Result<Zeroizing<String>, BoardError> {
        let _guard = self.reauth.lock().await;
        if let Ok(current) = self.session.access_token() {
            if current.as_str() != rejected {
                return Ok(current);
            }
        }

        let Some(refresh_token) = self.session.refresh_token() else {
            self.invalidate_session("no refresh token in session");
            return Err(BoardError::SessionInvalid);
        };
        info!("access token rejected, refreshing");
        match self
            .fetcher
            .source()
            .refresh_access_token(&refresh_token)
            .await
        {
            Ok(token) => {
                if let Err(e) = self.session.store_access_token(&token) {
                    warn!(error = %e, "refreshed token could not be stored");
                }
                Ok(Zeroizing::new(token))
            }
            Err(e) => {
                self.invalidate_session(&format!("token refresh failed: {e}"));
                Err(BoardError::SessionInvalid)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Fetching
    // -----------------------------------------------------------------------

    async fn fetch_with_reauth(&self, key: &FetchKey) -> Result<Snapshot, BoardError> {
        let token = self.current_token()?;
        match self.fetcher.fetch(&token, key).await {
            Err(ApiError::Unauthorized) => {
                let token = self.reauthenticate(&token).await?;
                match self.fetcher.fetch(&token, key).await {
                    Err(ApiError::Unauthorized) => {
                        self.invalidate_session("access token rejected after refresh");
                        Err(BoardError::SessionInvalid)
                    }
                    other => other.map_err(BoardError::from),
                }
            }
            other => other.map_err(BoardError::from),
        }
    }

    /// Fetch and apply a snapshot for the current outlet and filter now.
    ///
    /// Returns `Ok` when the fetch was superseded by an outlet or filter
    /// change; its result is simply not applied.
    pub async fn refresh_now(self: &Arc<Self>) -> Result<(), BoardError> {
        let (key, generation, cancel) = {
            let mut state = self.lock();
            if state.session_invalid {
                return Err(BoardError::SessionInvalid);
            }
            let Some(key) = state.key() else {
                return Err(BoardError::Config("no outlet selected".into()));
            };
            if key.outlet_number().is_none() {
                let err = BoardError::Config(format!(
                    "outlet id {:?} is not a positive integer",
                    key.outlet_id
                ));
                state.error = Some(err.to_string());
                self.commit(state);
                return Err(err);
            }
            state.loading = true;
            let ticket = (key, state.generation, state.key_token.clone());
            self.commit(state);
            ticket
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(generation, "fetch superseded");
                return Ok(());
            }
            _ = self.shutdown.cancelled() => return Ok(()),
            result = self.fetch_with_reauth(&key) => result,
        };
        self.apply_fetch_result(generation, result)
    }

    fn apply_fetch_result(
        self: &Arc<Self>,
        generation: u64,
        result: Result<Snapshot, BoardError>,
    ) -> Result<(), BoardError> {
        let mut state = self.lock();
        if state.generation != generation {
            debug!(generation, current = state.generation, "discarding stale fetch result");
            return Ok(());
        }
        state.loading = false;
        match result {
            Ok(snapshot) => {
                let subscription_change = Self::apply_snapshot(&mut state, snapshot);
                self.commit(state);
                if let Some(subscription) = subscription_change {
                    self.notify_subscription(subscription.as_ref());
                }
                Ok(())
            }
            Err(e) => {
                if e != BoardError::SessionInvalid {
                    warn!(error = %e, "order fetch failed");
                    state.error = Some(e.to_string());
                }
                self.commit(state);
                Err(e)
            }
        }
    }

    /// Take in a new snapshot: confirm overlay entries, remember served orders,
    /// track new items. Returns the new subscription details when they changed.
    fn apply_snapshot(
        state: &mut BoardState,
        snapshot: Snapshot,
    ) -> Option<Option<SubscriptionDetails>> {
        let confirmed = state.overlay.reconcile(&snapshot);
        if !confirmed.is_empty() {
            debug!(confirmed = confirmed.len(), "snapshot confirmed pending commands");
        }

        if let Some(cache) = state.cache.as_mut() {
            for order in &snapshot.served {
                if state.cancelled.contains(&order.order_id) {
                    continue;
                }
                if let Err(e) = cache.put(order) {
                    warn!(order_id = %order.order_id, error = %e, "could not persist served order");
                }
            }
        }

        state.new_items.observe(&snapshot, Instant::now());

        let subscription_change = if state.subscription != snapshot.subscription {
            state.subscription = snapshot.subscription.clone();
            Some(snapshot.subscription.clone())
        } else {
            None
        };

        debug!(
            placed = snapshot.placed.len(),
            cooking = snapshot.cooking.len(),
            paid = snapshot.paid.len(),
            served = snapshot.served.len(),
            "snapshot applied"
        );
        state.snapshot = snapshot;
        state.last_refreshed = Some(Local::now());
        state.error = None;
        subscription_change
    }

    fn notify_subscription(&self, subscription: Option<&SubscriptionDetails>) {
        if let Ok(slot) = self.subscription_listener.lock() {
            if let Some(listener) = slot.as_ref() {
                listener(subscription);
            }
        }
    }

    /// Start a new generation: anything in flight for the old one is
    /// cancelled or ignored.
    fn begin_generation(state: &mut BoardState) {
        state.key_token.cancel();
        state.key_token = CancellationToken::new();
        state.generation += 1;
        state.loading = false;
        state.error = None;
    }

    // -----------------------------------------------------------------------
    // Operator settings
    // -----------------------------------------------------------------------

    /// Show another outlet. Pending local state of the previous outlet is
    /// dropped; its served cache is left on disk.
    pub async fn set_outlet(self: &Arc<Self>, outlet_id: impl Into<String>) -> Result<(), BoardError> {
        let outlet_id = outlet_id.into();
        {
            let mut state = self.lock();
            if state.outlet_id.as_deref() != Some(outlet_id.as_str()) {
                info!(outlet_id = %outlet_id, "switching outlet");
                Self::begin_generation(&mut state);
                state.cache = Some(open_cache(&self.db, &outlet_id));
                state.outlet_id = Some(outlet_id);
                state.snapshot = Snapshot::default();
                state.overlay.reset();
                state.countdowns.clear();
                state.new_items.clear();
                state.subscription = None;
                state.last_refreshed = None;
                self.commit(state);
            }
        }
        self.refresh_now().await
    }

    pub async fn set_filter(self: &Arc<Self>, filter: DateFilter) -> Result<(), BoardError> {
        {
            let mut state = self.lock();
            if state.date_filter != filter {
                info!(filter = %filter, "switching date filter");
                Self::begin_generation(&mut state);
                state.date_filter = filter;
                self.commit(state);
            }
        }
        self.refresh_now().await
    }

    /// Switch between manual and auto-accept. Takes effect on the view
    /// published by this call. Auto-accept commands are only dispatched when
    /// called inside a Tokio runtime; otherwise they start with the next poll.
    pub fn set_manual_mode(self: &Arc<Self>, manual: bool) {
        match self.db.conn.lock() {
            Ok(conn) => {
                if let Err(e) = db::store_manual_mode(&conn, manual) {
                    warn!("could not persist manual mode: {e}");
                }
            }
            Err(e) => warn!("database lock poisoned: {e}"),
        }
        let mut state = self.lock();
        state.manual_mode = manual;
        info!(manual, "manual mode changed");
        self.commit(state);
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    /// Spawn the poll loop and the countdown tick. Both stop on
    /// [`Board::shutdown`]; the poll loop also stops once the session is
    /// invalid.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let poller = {
            let board = self.clone();
            tokio::spawn(async move { board.poll_loop().await })
        };
        let ticker = {
            let board = self.clone();
            tokio::spawn(async move { board.tick_loop().await })
        };
        vec![poller, ticker]
    }

    async fn poll_loop(self: &Arc<Self>) {
        info!(interval_secs = self.poll_interval.as_secs(), "Poll loop started");
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Poll loop stopped");
                    break;
                }
                _ = interval.tick() => {}
            }

            match self.refresh_now().await {
                Ok(()) => {}
                Err(BoardError::SessionInvalid) => {
                    warn!("Session invalid, poll loop stopped");
                    break;
                }
                Err(BoardError::Config(msg)) => debug!("poll skipped: {msg}"),
                Err(e) => debug!(error = %e, "poll failed, retrying next interval"),
            }
        }
    }

    async fn tick_loop(self: &Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.tick_countdowns(),
            }
        }
    }

    pub(crate) fn tick_countdowns(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.countdowns.tick() {
            self.commit(state);
        }
    }

    pub fn shutdown(&self) {
        info!("board shutting down");
        self.shutdown.cancel();
        self.lock().key_token.cancel();
    }
}
