//! Timer-driven executor for scheduled TWAP slices.
//!
//! Plans are persisted atomically with the ledger, then each child slice gets
//! a timer task that fires at its scheduled time, re-runs the admission
//! safety gates, reserves position headroom, and submits with the child's
//! deterministic id. Transient broker errors retry with bounded backoff;
//! everything else resolves the slice one way or the other.

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, BrokerError};
use crate::coordinator::Coordinator;
use crate::error::GatewayError;
use crate::ledger::{Ledger, LedgerError, StatusUpdate};
use crate::models::{
    ExecutionStyle, Order, OrderRequest, OrderStatus, SliceDetail, SlicingPlan, SourcePriority,
};
use crate::recovery::RecoveryManager;
use crate::reconciliation::StartupReconciler;

const RETRY_BACKOFF_BASE_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub dry_run: bool,
    pub max_position_qty: Decimal,
    pub slice_max_retries: u32,
}

/// Result of registering a plan; retries of the same parent id return the
/// stored plan instead of a fresh one.
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub plan: SlicingPlan,
    pub already_existed: bool,
}

/// Everything a timer task needs, cheap to clone into the spawned future.
#[derive(Clone)]
struct SliceRunner {
    ledger: Arc<dyn Ledger>,
    broker: Arc<dyn BrokerClient>,
    coordinator: Arc<dyn Coordinator>,
    recovery: Arc<RecoveryManager>,
    reconciler: Arc<StartupReconciler>,
    config: SchedulerConfig,
}

pub struct SliceScheduler {
    runner: SliceRunner,
    running: AtomicBool,
    timers: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl SliceScheduler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        broker: Arc<dyn BrokerClient>,
        coordinator: Arc<dyn Coordinator>,
        recovery: Arc<RecoveryManager>,
        reconciler: Arc<StartupReconciler>,
        config: SchedulerConfig,
    ) -> Self {
        SliceScheduler {
            runner: SliceRunner {
                ledger,
                broker,
                coordinator,
                recovery,
                reconciler,
                config,
            },
            running: AtomicBool::new(false),
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start (or restart) the scheduler and re-arm timers for every slice
    /// still pending in the ledger.
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.running.store(true, Ordering::SeqCst);

        let active = self.runner.ledger.get_active_orders().await?;
        let mut rearmed = 0usize;
        for order in active {
            if order.parent_order_id.is_some()
                && order.status == OrderStatus::PendingNew
                && order.broker_order_id.is_none()
                && order.scheduled_time.is_some()
            {
                self.arm_slice(order);
                rearmed += 1;
            }
        }
        if rearmed > 0 {
            info!(slices = rearmed, "re-armed pending slice timers");
        }
        Ok(())
    }

    /// Stop firing timers. Pending slices stay in the ledger and are re-armed
    /// on the next start.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut timers = self.timers.lock();
        for (_, handles) in timers.drain() {
            for handle in handles {
                handle.abort();
            }
        }
    }

    /// Persist the plan and arm its timers. Duplicate parent ids (including
    /// a concurrent registration racing this one) return the stored plan.
    pub async fn register_plan(
        &self,
        plan: &SlicingPlan,
        template: &OrderRequest,
        strategy_id: &str,
        legacy_parent_id: Option<&str>,
    ) -> Result<RegisterOutcome, GatewayError> {
        if let Some(stored) = self.stored_plan(&plan.parent_order_id).await? {
            debug!(parent_order_id = %plan.parent_order_id, "slicing plan already registered");
            return Ok(RegisterOutcome {
                plan: stored,
                already_existed: true,
            });
        }
        if let Some(legacy_id) = legacy_parent_id {
            if let Some(stored) = self.stored_plan(legacy_id).await? {
                debug!(
                    parent_order_id = %legacy_id,
                    "slicing plan found under legacy parent id"
                );
                return Ok(RegisterOutcome {
                    plan: stored,
                    already_existed: true,
                });
            }
        }

        match self
            .runner
            .ledger
            .create_slice_plan(plan, template, strategy_id)
            .await
        {
            Ok(()) => {}
            Err(LedgerError::Duplicate(_)) => {
                let stored = self
                    .stored_plan(&plan.parent_order_id)
                    .await?
                    .ok_or_else(|| {
                        GatewayError::Internal(
                            "slice plan vanished after duplicate violation".into(),
                        )
                    })?;
                return Ok(RegisterOutcome {
                    plan: stored,
                    already_existed: true,
                });
            }
            Err(e) => return Err(e.into()),
        }

        if self.is_running() {
            let children = self
                .runner
                .ledger
                .get_slices_by_parent_id(&plan.parent_order_id)
                .await?;
            for child in children {
                self.arm_slice(child);
            }
        }

        info!(
            parent_order_id = %plan.parent_order_id,
            slices = plan.total_slices,
            symbol = %plan.symbol,
            "slicing plan registered"
        );
        Ok(RegisterOutcome {
            plan: plan.clone(),
            already_existed: false,
        })
    }

    /// Cancel all not-yet-submitted children and drop their timers.
    pub async fn cancel_remaining_slices(
        &self,
        parent_order_id: &str,
    ) -> Result<u64, GatewayError> {
        if let Some(handles) = self.timers.lock().remove(parent_order_id) {
            for handle in handles {
                handle.abort();
            }
        }
        let canceled = self
            .runner
            .ledger
            .cancel_pending_slices(parent_order_id)
            .await?;
        info!(parent_order_id, canceled, "remaining slices canceled");
        Ok(canceled)
    }

    /// Stored plan reconstructed from the parent row and its children.
    pub async fn stored_plan(
        &self,
        parent_order_id: &str,
    ) -> Result<Option<SlicingPlan>, GatewayError> {
        let Some(parent) = self
            .runner
            .ledger
            .get_order_by_client_id(parent_order_id)
            .await?
        else {
            return Ok(None);
        };
        let children = self
            .runner
            .ledger
            .get_slices_by_parent_id(parent_order_id)
            .await?;
        let slices: Vec<SliceDetail> = children
            .iter()
            .map(|c| SliceDetail {
                slice_num: c.slice_num.unwrap_or(0),
                qty: c.qty.to_u32().unwrap_or(0),
                scheduled_time: c.scheduled_time.unwrap_or(c.created_at),
                client_order_id: c.client_order_id.clone(),
                status: c.status,
            })
            .collect();
        let interval_seconds = match slices.windows(2).next() {
            Some(pair) => (pair[1].scheduled_time - pair[0].scheduled_time)
                .num_seconds()
                .max(1) as u32,
            None => 60,
        };
        Ok(Some(SlicingPlan {
            parent_order_id: parent.client_order_id.clone(),
            symbol: parent.symbol.clone(),
            side: parent.side,
            total_qty: parent.qty.to_u32().unwrap_or(0),
            total_slices: parent.total_slices.unwrap_or(slices.len() as u32),
            duration_minutes: (interval_seconds as u64 * slices.len() as u64 / 60).max(1) as u32,
            interval_seconds,
            trade_date: parent.created_at.date_naive(),
            slices,
        }))
    }

    fn arm_slice(&self, child: Order) {
        let Some(parent_id) = child.parent_order_id.clone() else {
            return;
        };
        let runner = self.runner.clone();
        let handle = tokio::spawn(async move {
            if let Some(scheduled) = child.scheduled_time {
                let delay = scheduled.signed_duration_since(Utc::now());
                if let Ok(wait) = delay.to_std() {
                    tokio::time::sleep(wait).await;
                }
            }
            runner.execute_slice(child).await;
        });
        self.timers.lock().entry(parent_id).or_default().push(handle);
    }
}

impl SliceRunner {
    /// Run one due slice through the gates and out to the broker.
    async fn execute_slice(&self, child: Order) {
        let client_order_id = child.client_order_id.clone();

        // Re-read: the slice may have been canceled while we slept.
        let current = match self.ledger.get_order_by_client_id(&client_order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => return,
            Err(e) => {
                warn!(%client_order_id, error = %e, "slice read failed at fire time");
                return;
            }
        };
        if current.status != OrderStatus::PendingNew || current.broker_order_id.is_some() {
            debug!(%client_order_id, status = current.status.as_str(), "slice no longer pending; skipping");
            return;
        }

        let req = OrderRequest {
            symbol: current.symbol.clone(),
            side: current.side,
            qty: current.qty.to_u32().unwrap_or(0),
            order_type: current.order_type,
            limit_price: current.limit_price,
            stop_price: current.stop_price,
            time_in_force: current.time_in_force,
            execution_style: ExecutionStyle::Twap,
        };

        if !self.gates_pass(&req, &client_order_id).await {
            return;
        }

        if self.config.dry_run {
            let update = StatusUpdate {
                client_order_id: client_order_id.clone(),
                status: OrderStatus::DryRun,
                broker_updated_at: Utc::now(),
                source_priority: SourcePriority::Manual,
                filled_qty: None,
                filled_avg_price: None,
                filled_at: None,
                broker_order_id: None,
            };
            if let Err(e) = self.ledger.update_order_status_cas(&update).await {
                warn!(%client_order_id, error = %e, "dry-run slice status write failed");
            }
            return;
        }

        // Reserve headroom for just this slice.
        let Some(reservation) = self.recovery.position_reservation() else {
            warn!(%client_order_id, "position reservation unavailable; slice left pending");
            return;
        };
        let current_position = match self.ledger.get_position_by_symbol(&req.symbol).await {
            Ok(p) => p.map(|p| p.qty).unwrap_or(Decimal::ZERO),
            Err(e) => {
                warn!(%client_order_id, error = %e, "position read failed; slice left pending");
                return;
            }
        };
        let outcome = match reservation
            .reserve(
                &req.symbol,
                req.side,
                Decimal::from(req.qty),
                self.config.max_position_qty,
                current_position,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%client_order_id, error = %e, "slice reservation failed; left pending");
                return;
            }
        };
        if !outcome.approved {
            warn!(
                %client_order_id,
                reason = outcome.reason.as_deref().unwrap_or("unknown"),
                "slice blocked by position limits; left pending"
            );
            return;
        }
        let token = match outcome.token {
            Some(token) => token,
            None => {
                warn!(%client_order_id, "reservation approved without token; slice left pending");
                return;
            }
        };

        self.submit_with_retries(&req, &client_order_id, &reservation, &token)
            .await;
    }

    /// All pre-dispatch gates. A failed or unavailable gate leaves the slice
    /// pending; nothing is submitted.
    async fn gates_pass(&self, req: &OrderRequest, client_order_id: &str) -> bool {
        if self.recovery.needs_recovery() {
            warn!(client_order_id, "safety mechanism unavailable; slice left pending");
            return false;
        }

        let Some(kill_switch) = self.recovery.kill_switch() else {
            return false;
        };
        match kill_switch.is_engaged().await {
            Ok(false) => {}
            Ok(true) => {
                warn!(client_order_id, "kill-switch engaged; slice left pending");
                return false;
            }
            Err(e) => {
                warn!(client_order_id, error = %e, "kill-switch probe failed; slice left pending");
                self.recovery.set_kill_switch_unavailable(true);
                return false;
            }
        }

        let Some(breaker) = self.recovery.circuit_breaker() else {
            return false;
        };
        match breaker.is_tripped().await {
            Ok(false) => {}
            Ok(true) => {
                warn!(client_order_id, "circuit breaker tripped; slice left pending");
                return false;
            }
            Err(e) => {
                warn!(client_order_id, error = %e, "breaker probe failed; slice left pending");
                self.recovery.set_circuit_breaker_unavailable(true);
                return false;
            }
        }

        match self.coordinator.is_symbol_quarantined(&req.symbol).await {
            Ok(false) => {}
            Ok(true) => {
                warn!(client_order_id, symbol = %req.symbol, "symbol quarantined; slice left pending");
                return false;
            }
            Err(e) => {
                warn!(client_order_id, error = %e, "quarantine check failed; slice left pending");
                return false;
            }
        }

        if let Err(e) = self.reconciler.admission_gate(req).await {
            warn!(client_order_id, error = %e, "reconciliation gate blocked slice");
            return false;
        }

        true
    }

    async fn submit_with_retries(
        &self,
        req: &OrderRequest,
        client_order_id: &str,
        reservation: &Arc<crate::reservation::PositionReservation>,
        token: &str,
    ) {
        let mut attempt = 0u32;
        loop {
            match self.broker.submit_order(req, client_order_id).await {
                Ok(ack) => {
                    if let Err(e) = self
                        .ledger
                        .update_order_broker_id(client_order_id, &ack.id, ack.status)
                        .await
                    {
                        warn!(client_order_id, error = %e, "slice broker id write failed");
                    }
                    if let Err(e) = reservation.confirm(&req.symbol, token).await {
                        warn!(client_order_id, error = %e, "slice reservation confirm failed");
                    }
                    info!(
                        client_order_id,
                        broker_order_id = %ack.id,
                        "slice submitted"
                    );
                    return;
                }
                Err(BrokerError::Connection(msg)) => {
                    if attempt < self.config.slice_max_retries {
                        let backoff =
                            Duration::from_millis(RETRY_BACKOFF_BASE_MS << attempt.min(6));
                        warn!(
                            client_order_id,
                            attempt,
                            error = %msg,
                            backoff_ms = backoff.as_millis() as u64,
                            "transient broker error; retrying slice"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }
                    warn!(
                        client_order_id,
                        error = %msg,
                        "slice submission exhausted retries; left pending"
                    );
                    reservation.release(&req.symbol, token).await;
                    return;
                }
                Err(err) => {
                    // Validation or rejection: the slice is dead.
                    warn!(client_order_id, error = %err, "slice rejected by broker");
                    let update = StatusUpdate {
                        client_order_id: client_order_id.to_string(),
                        status: OrderStatus::Rejected,
                        broker_updated_at: Utc::now(),
                        source_priority: SourcePriority::Manual,
                        filled_qty: None,
                        filled_avg_price: None,
                        filled_at: None,
                        broker_order_id: None,
                    };
                    if let Err(e) = self.ledger.update_order_status_cas(&update).await {
                        warn!(client_order_id, error = %e, "slice reject status write failed");
                    }
                    reservation.release(&req.symbol, token).await;
                    return;
                }
            }
        }
    }
}
