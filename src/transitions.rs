//! Status transition commands.
//!
//! Each command applies its local effect and publishes the new view before
//! the remote mutation goes out. A failed mutation rolls the local effect
//! back and forces a refetch; cancellation is the exception and stands
//! locally whatever the service answers.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{LineRef, MutationContext, OrderSource};
use crate::board::{Board, BoardState};
use crate::error::{ApiError, BoardError};
use crate::model::{Bucket, LineStatus, Order, OrderStatus};
use crate::served_cache::ServedCache;

/// Checks applied before a command touches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Guard {
    /// Scheduler-issued: no operator checks.
    None,
    /// Operator must not be read-only.
    Role,
    /// Read-only check plus the order's own `actions_enabled` flag.
    RoleAndActions,
}

enum RemoteMutation<'a> {
    OrderStatus(OrderStatus),
    LineServed(&'a LineRef),
}

/// The order as currently shown: pending overlay record first, then the
/// snapshot, then the served cache.
fn visible_order(state: &BoardState, order_id: &str) -> Result<Order, BoardError> {
    if state.cancelled.contains(order_id) {
        return Err(BoardError::UnknownOrder(order_id.to_string()));
    }
    if let Some(entry) = state.overlay.get(order_id) {
        return Ok(entry.order.clone());
    }
    if let Some(order) = state.snapshot.find(order_id) {
        return Ok(order.clone());
    }
    state
        .cache
        .as_ref()
        .and_then(|cache| cache.values().find(|o| o.order_id == order_id))
        .cloned()
        .ok_or_else(|| BoardError::UnknownOrder(order_id.to_string()))
}

impl<S: OrderSource> Board<S> {
    fn check_guard(&self, order: &Order, guard: Guard) -> Result<(), BoardError> {
        if guard == Guard::None {
            return Ok(());
        }
        if self.read_only {
            return Err(BoardError::ActionNotPermitted {
                order_id: order.order_id.clone(),
                reason: "this account can only view the board".into(),
            });
        }
        if guard == Guard::RoleAndActions && !order.actions_enabled {
            return Err(BoardError::ActionNotPermitted {
                order_id: order.order_id.clone(),
                reason: "actions are disabled for this order".into(),
            });
        }
        Ok(())
    }

    fn mutation_context(&self, state: &BoardState) -> Result<MutationContext, BoardError> {
        let outlet_id = state
            .outlet_id
            .clone()
            .ok_or_else(|| BoardError::Config("no outlet selected".into()))?;
        Ok(MutationContext {
            outlet_id,
            user_id: self.session.user_id(),
            device_token: self.device_token.clone(),
            app_source: self.app_source.clone(),
        })
    }

    async fn send_mutation(
        &self,
        access_token: &str,
        order_id: &str,
        mutation: &RemoteMutation<'_>,
        ctx: &MutationContext,
    ) -> Result<(), ApiError> {
        let source = self.fetcher.source();
        match mutation {
            RemoteMutation::OrderStatus(status) => {
                source
                    .set_order_status(access_token, order_id, *status, ctx)
                    .await
            }
            RemoteMutation::LineServed(line) => {
                source
                    .set_menu_line_status(access_token, order_id, line, LineStatus::Served, ctx)
                    .await
            }
        }
    }

    /// Send a mutation, refreshing the access token once on 401.
    async fn dispatch(
        &self,
        order_id: &str,
        mutation: RemoteMutation<'_>,
        ctx: &MutationContext,
    ) -> Result<(), BoardError> {
        let token = self.current_token()?;
        match self.send_mutation(&token, order_id, &mutation, ctx).await {
            Err(ApiError::Unauthorized) => {
                let token = self.reauthenticate(&token).await?;
                match self.send_mutation(&token, order_id, &mutation, ctx).await {
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

    /// Force a refetch after a failed command. Its own failure is already
    /// reported through the view.
    async fn refetch_after_failure(self: &Arc<Self>) {
        if let Err(e) = self.refresh_now().await {
            debug!(error = %e, "refetch after failed command did not complete");
        }
    }

    fn command_failed(command: &'static str, order_id: &str, err: BoardError) -> BoardError {
        match err {
            BoardError::SessionInvalid => BoardError::SessionInvalid,
            other => BoardError::CommandFailed {
                command,
                order_id: order_id.to_string(),
                reason: other.to_string(),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Whole-order moves
    // -----------------------------------------------------------------------

    async fn move_order(
        self: &Arc<Self>,
        command: &'static str,
        order_id: &str,
        target: OrderStatus,
        guard: Guard,
    ) -> Result<(), BoardError> {
        let (seq, moved, ctx) = {
            let mut state = self.lock();
            if state.session_invalid {
                return Err(BoardError::SessionInvalid);
            }
            let order = visible_order(&state, order_id)?;
            self.check_guard(&order, guard)?;
            let ctx = self.mutation_context(&state)?;
            let moved = order.moved_to(target);
            let seq = state.overlay.record(moved.clone());
            info!(order_id, command, from = %order.status, to = %target, "status change applied locally");
            let ticket = (seq, moved, ctx);
            self.commit(state);
            ticket
        };

        match self
            .dispatch(order_id, RemoteMutation::OrderStatus(target), &ctx)
            .await
        {
            Ok(()) => {
                debug!(order_id, command, "status change accepted by order service");
                if target == OrderStatus::Served {
                    let mut state = self.lock();
                    if !state.cancelled.contains(order_id) {
                        // Persist into the cache of the outlet the command was
                        // issued for, even if the board has switched since.
                        let stored = match state
                            .cache
                            .as_mut()
                            .filter(|cache| cache.outlet_id() == ctx.outlet_id)
                        {
                            Some(cache) => cache.put(&moved),
                            None => ServedCache::open(self.db.clone(), &ctx.outlet_id)
                                .and_then(|mut cache| cache.put(&moved)),
                        };
                        if let Err(e) = stored {
                            warn!(order_id, error = %e, "could not persist served order");
                        }
                    }
                    self.commit(state);
                }
                Ok(())
            }
            Err(e) => {
                warn!(order_id, command, error = %e, "status change failed, rolling back");
                {
                    let mut state = self.lock();
                    state.overlay.clear_if_current(order_id, seq);
                    self.commit(state);
                }
                self.refetch_after_failure().await;
                Err(Self::command_failed(command, order_id, e))
            }
        }
    }

    /// Move a placed order to cooking.
    pub async fn accept_to_cooking(self: &Arc<Self>, order_id: &str) -> Result<(), BoardError> {
        self.move_order("accept_to_cooking", order_id, OrderStatus::Cooking, Guard::Role)
            .await
    }

    /// Scheduler entry point: accept without operator checks, and only while
    /// the order is still shown as placed.
    pub(crate) async fn auto_accept_order(self: &Arc<Self>, order_id: &str) -> Result<(), BoardError> {
        let shown_placed = self.view().buckets.contains(Bucket::Placed, order_id);
        let still_placed = {
            let state = self.lock();
            shown_placed && !state.manual_mode && !state.cancelled.contains(order_id)
        };
        if !still_placed {
            debug!(order_id, "order no longer awaiting auto-accept");
            return Ok(());
        }
        self.move_order("auto_accept", order_id, OrderStatus::Cooking, Guard::None)
            .await
    }

    /// Mark a whole order served. Every line becomes served with it.
    pub async fn serve_order(self: &Arc<Self>, order_id: &str) -> Result<(), BoardError> {
        self.move_order("serve_order", order_id, OrderStatus::Served, Guard::RoleAndActions)
            .await
    }

    // -----------------------------------------------------------------------
    // Single line
    // -----------------------------------------------------------------------

    /// Mark one menu line of an order served.
    pub async fn serve_menu_line(self: &Arc<Self>, order_id: &str, line_id: &str) -> Result<(), BoardError> {
        let (line_ref, ctx) = {
            let mut state = self.lock();
            if state.session_invalid {
                return Err(BoardError::SessionInvalid);
            }
            let order = visible_order(&state, order_id)?;
            self.check_guard(&order, Guard::RoleAndActions)?;
            let line = order
                .line(line_id)
                .ok_or_else(|| BoardError::ActionNotPermitted {
                    order_id: order_id.to_string(),
                    reason: format!("no menu line {line_id} on this order"),
                })?;
            if line.status == LineStatus::Served {
                return Ok(());
            }
            let line_ref = LineRef {
                menu_id: line.menu_id.clone(),
                portion_id: line.portion_id.clone(),
            };
            let ctx = self.mutation_context(&state)?;
            if !state.overlay.patch_line(order_id, line_id) {
                debug!(order_id, line_id, "line already being served");
                return Ok(());
            }
            info!(order_id, line_id, "menu line served locally");
            self.commit(state);
            (line_ref, ctx)
        };

        match self
            .dispatch(order_id, RemoteMutation::LineServed(&line_ref), &ctx)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(order_id, line_id, error = %e, "serving menu line failed, rolling back");
                {
                    let mut state = self.lock();
                    if state.outlet_id.as_deref() == Some(ctx.outlet_id.as_str()) {
                        state.overlay.revert_line(order_id, line_id);
                    }
                    self.commit(state);
                }
                self.refetch_after_failure().await;
                Err(Self::command_failed("serve_menu_line", order_id, e))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    async fn cancel_with_guard(
        self: &Arc<Self>,
        command: &'static str,
        order_id: &str,
        guard: Guard,
        require_countdown: bool,
    ) -> Result<(), BoardError> {
        let ctx = {
            let mut state = self.lock();
            if state.session_invalid {
                return Err(BoardError::SessionInvalid);
            }
            let order = visible_order(&state, order_id)?;
            self.check_guard(&order, guard)?;
            if require_countdown && !state.countdowns.is_active(order_id) {
                return Err(BoardError::ActionNotPermitted {
                    order_id: order_id.to_string(),
                    reason: "the reject window has closed".into(),
                });
            }
            let ctx = self.mutation_context(&state)?;

            state.cancelled.insert(order_id.to_string());
            state.overlay.forget_order(order_id);
            state.countdowns.remove(order_id);
            if let Some(cache) = state.cache.as_mut() {
                if let Err(e) = cache.remove(order_id) {
                    warn!(order_id, error = %e, "could not drop cancelled order from served cache");
                }
            }
            info!(order_id, command, "order cancelled locally");
            self.commit(state);
            ctx
        };

        match self
            .dispatch(order_id, RemoteMutation::OrderStatus(OrderStatus::Cancelled), &ctx)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(order_id, error = %e, "cancel was not confirmed, keeping it locally");
                self.refetch_after_failure().await;
                Err(Self::command_failed(command, order_id, e))
            }
        }
    }

    /// Cancel an order. It disappears from every bucket and from the served
    /// cache immediately, and stays gone for the rest of the session.
    pub async fn cancel_order(self: &Arc<Self>, order_id: &str) -> Result<(), BoardError> {
        self.cancel_with_guard("cancel_order", order_id, Guard::Role, false)
            .await
    }

    /// Cancel a placed order while its reject countdown is running.
    pub async fn reject(self: &Arc<Self>, order_id: &str) -> Result<(), BoardError> {
        self.cancel_with_guard("reject", order_id, Guard::RoleAndActions, true)
            .await
    }
}
