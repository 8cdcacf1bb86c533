//! Startup reconciliation and the reduce-only gate.
//!
//! After a restart the local ledger may disagree with the broker. Until the
//! two are reconciled, admission only accepts orders that strictly shrink an
//! existing position, judged against the broker's authoritative view. An
//! operator can force the gate open with a TTL-bearing override capability
//! stored in the coordinator.
//!
//! The same component owns the periodic recovery of pending modifications
//! whose finalization writes were lost after a successful broker replace.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::{BrokerClient, OrderQueryStatus};
use crate::coordinator::Coordinator;
use crate::error::GatewayError;
use crate::ledger::{FinalizeModification, Ledger, StatusUpdate};
use crate::models::{
    ModificationStatus, Order, OrderRequest, Side, SourcePriority, TimeInForce,
};

/// Gate state as seen by admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationState {
    InProgress,
    Complete,
    OverrideActive,
}

/// How many broker orders one reconciliation sweep pulls.
const RECONCILE_ORDER_LIMIT: u32 = 500;

pub struct StartupReconciler {
    ledger: Arc<dyn Ledger>,
    broker: Arc<dyn BrokerClient>,
    coordinator: Arc<dyn Coordinator>,
    started_at: DateTime<Utc>,
    timeout: Duration,
    complete: AtomicBool,
}

impl StartupReconciler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        broker: Arc<dyn BrokerClient>,
        coordinator: Arc<dyn Coordinator>,
        timeout_secs: u64,
    ) -> Self {
        StartupReconciler {
            ledger,
            broker,
            coordinator,
            started_at: Utc::now(),
            timeout: Duration::seconds(timeout_secs as i64),
            complete: AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> ReconciliationState {
        if self.complete.load(Ordering::SeqCst) {
            return ReconciliationState::Complete;
        }
        match self.coordinator.reconciliation_override().await {
            Ok(Some(cap)) => {
                info!(operator = %cap.operator, note = %cap.note, "reconciliation override active");
                ReconciliationState::OverrideActive
            }
            _ => ReconciliationState::InProgress,
        }
    }

    /// Advisory only: a timed-out reconciliation still gates, it just gets
    /// logged with the elapsed time.
    pub fn is_timed_out(&self) -> bool {
        Utc::now().signed_duration_since(self.started_at) > self.timeout
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
        info!("startup reconciliation complete; admission gate open");
    }

    /// Reconcile local orders and positions against the broker, then signal
    /// completion. Broker transport failures leave the gate closed for the
    /// next periodic attempt.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let broker_orders = self
            .broker
            .get_orders(OrderQueryStatus::Open, RECONCILE_ORDER_LIMIT, None)
            .await
            .map_err(|e| GatewayError::Unavailable(format!("reconciliation order fetch: {e}")))?;

        let mut symbols: Vec<String> = Vec::new();
        let mut merged = 0usize;
        for broker_order in &broker_orders {
            if !symbols.contains(&broker_order.symbol) {
                symbols.push(broker_order.symbol.clone());
            }
            if self.merge_broker_order(broker_order).await? {
                merged += 1;
            }
        }

        // Local orders the broker sweep did not cover: look each up directly.
        let active = self.ledger.get_active_orders().await?;
        for order in &active {
            if broker_orders
                .iter()
                .any(|b| b.client_order_id == order.client_order_id)
            {
                continue;
            }
            if !symbols.contains(&order.symbol) {
                symbols.push(order.symbol.clone());
            }
            match self.broker.get_order_by_client_id(&order.client_order_id).await {
                Ok(Some(broker_order)) => {
                    if self.merge_broker_order(&broker_order).await? {
                        merged += 1;
                    }
                }
                Ok(None) => {
                    warn!(
                        client_order_id = %order.client_order_id,
                        "local active order unknown at broker; leaving for operator review"
                    );
                }
                Err(e) => {
                    return Err(GatewayError::Unavailable(format!(
                        "reconciliation order lookup: {e}"
                    )));
                }
            }
        }

        for symbol in &symbols {
            match self.broker.get_open_position(symbol).await {
                Ok(Some(position)) => {
                    self.ledger
                        .sync_position_from_broker(symbol, position.qty, position.avg_entry_price)
                        .await?;
                }
                Ok(None) => {
                    self.ledger
                        .sync_position_from_broker(symbol, Decimal::ZERO, Decimal::ZERO)
                        .await?;
                }
                Err(e) => {
                    return Err(GatewayError::Unavailable(format!(
                        "reconciliation position fetch: {e}"
                    )));
                }
            }
        }

        info!(
            orders_merged = merged,
            positions_synced = symbols.len(),
            "startup reconciliation sweep finished"
        );
        self.mark_complete();
        Ok(())
    }

    async fn merge_broker_order(
        &self,
        broker_order: &crate::broker::BrokerOrder,
    ) -> Result<bool, GatewayError> {
        if self
            .ledger
            .get_order_by_client_id(&broker_order.client_order_id)
            .await?
            .is_none()
        {
            warn!(
                client_order_id = %broker_order.client_order_id,
                "broker order has no local row; skipping merge"
            );
            return Ok(false);
        }
        let update = StatusUpdate {
            client_order_id: broker_order.client_order_id.clone(),
            status: broker_order.status,
            broker_updated_at: broker_order.updated_at.unwrap_or_else(Utc::now),
            source_priority: SourcePriority::Reconciliation,
            filled_qty: Some(broker_order.filled_qty),
            filled_avg_price: broker_order.filled_avg_price,
            filled_at: None,
            broker_order_id: Some(broker_order.id.clone()),
        };
        Ok(self.ledger.update_order_status_cas(&update).await?)
    }

    // ------------------------------------------------------------------
    // Admission gate
    // ------------------------------------------------------------------

    /// Gate 5 of admission: while reconciliation is incomplete and no
    /// override is active, only strictly reduce-only orders pass.
    pub async fn admission_gate(&self, req: &OrderRequest) -> Result<(), GatewayError> {
        match self.state().await {
            ReconciliationState::Complete | ReconciliationState::OverrideActive => Ok(()),
            ReconciliationState::InProgress => {
                if self.is_timed_out() {
                    let elapsed = Utc::now().signed_duration_since(self.started_at);
                    warn!(
                        elapsed_secs = elapsed.num_seconds(),
                        "startup reconciliation timed out; still allowing only reduce-only orders"
                    );
                }
                if self.is_reduce_only(req).await? {
                    Ok(())
                } else {
                    Err(GatewayError::SafetyGate(
                        "reconciliation in progress - only reduce-only orders accepted".into(),
                    ))
                }
            }
        }
    }

    /// An order is reduce-only iff it shrinks the broker-side position even
    /// after all pending same-side open orders execute.
    ///
    /// A broker position lookup failure fails the request (no admission
    /// without authoritative state); an open-order fetch failure degrades to
    /// a pending quantity of zero.
    pub async fn is_reduce_only(&self, req: &OrderRequest) -> Result<bool, GatewayError> {
        let position = self
            .broker
            .get_open_position(&req.symbol)
            .await
            .map_err(|e| {
                GatewayError::Unavailable(format!(
                    "broker position lookup failed during reconciliation gate: {e}"
                ))
            })?;
        let p = position.map(|p| p.qty).unwrap_or(Decimal::ZERO);

        let pending_same_side = match self
            .broker
            .get_orders(OrderQueryStatus::Open, RECONCILE_ORDER_LIMIT, None)
            .await
        {
            Ok(orders) => orders
                .iter()
                .filter(|o| o.symbol == req.symbol && o.side == req.side)
                .map(|o| o.qty - o.filled_qty)
                .sum::<Decimal>(),
            Err(e) => {
                warn!(
                    symbol = %req.symbol,
                    error = %e,
                    "open-order fetch failed; assuming zero pending qty for reduce-only check"
                );
                Decimal::ZERO
            }
        };

        let qty = Decimal::from(req.qty);
        let reduce_only = match req.side {
            Side::Sell => p > Decimal::ZERO && qty <= p - pending_same_side,
            Side::Buy => p < Decimal::ZERO && qty <= p.abs() - pending_same_side,
        };
        Ok(reduce_only)
    }

    // ------------------------------------------------------------------
    // Pending-modification recovery
    // ------------------------------------------------------------------

    /// Converge modifications stuck in `pending` (or `submitted_unconfirmed`
    /// finalization losses) older than `stale_after`: if the broker shows the
    /// replacement, finalize; if not, mark failed. Returns how many records
    /// were finalized.
    pub async fn reconcile_pending_modifications(
        &self,
        stale_after: Duration,
    ) -> Result<usize, GatewayError> {
        let cutoff = Utc::now() - stale_after;
        let pending = self
            .ledger
            .get_pending_modifications_older_than(cutoff)
            .await?;
        let mut recovered = 0usize;

        for record in pending {
            let broker_order = match self
                .broker
                .get_order_by_client_id(&record.new_client_order_id)
                .await
            {
                Ok(order) => order,
                Err(e) => {
                    warn!(
                        modification_id = %record.modification_id,
                        error = %e,
                        "pending modification broker lookup failed"
                    );
                    continue;
                }
            };

            let Some(broker_order) = broker_order else {
                self.ledger
                    .update_modification_status(
                        &record.modification_id,
                        ModificationStatus::Failed,
                        Some("replacement order not found at broker after timeout"),
                    )
                    .await?;
                warn!(
                    modification_id = %record.modification_id,
                    new_client_order_id = %record.new_client_order_id,
                    "pending modification not found at broker; marked failed"
                );
                continue;
            };

            let Some(original) = self
                .ledger
                .get_order_by_client_id(&record.original_client_order_id)
                .await?
            else {
                self.ledger
                    .update_modification_status(
                        &record.modification_id,
                        ModificationStatus::Failed,
                        Some("original order missing during modification recovery"),
                    )
                    .await?;
                continue;
            };

            let replacement =
                build_replacement_order(&original, &record.changes, &broker_order);
            self.ledger
                .finalize_modification(&FinalizeModification {
                    modification_id: record.modification_id.clone(),
                    new_broker_order_id: Some(broker_order.id.clone()),
                    replacement,
                    original_client_order_id: record.original_client_order_id.clone(),
                })
                .await?;
            info!(
                modification_id = %record.modification_id,
                "pending modification recovered from broker state"
            );
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Background loop: periodic pending-modification recovery.
    pub fn spawn_periodic(
        self: Arc<Self>,
        every: std::time::Duration,
        stale_after_secs: u64,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match self
                    .reconcile_pending_modifications(Duration::seconds(stale_after_secs as i64))
                    .await
                {
                    Ok(0) => {}
                    Ok(n) => info!(recovered = n, "background modification reconciliation"),
                    Err(e) => warn!(error = %e, "background modification reconciliation failed"),
                }
            }
        })
    }
}

/// Effective replacement row: the original order with the recorded changes
/// applied and the broker's view of status and fills layered on top.
fn build_replacement_order(
    original: &Order,
    changes: &serde_json::Value,
    broker_order: &crate::broker::BrokerOrder,
) -> Order {
    let now = Utc::now();

    let changed_dec = |field: &str| -> Option<Decimal> {
        changes
            .get(field)
            .and_then(|pair| pair.get(1))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    };
    let changed_tif = changes
        .get("time_in_force")
        .and_then(|pair| pair.get(1))
        .and_then(|v| v.as_str())
        .and_then(TimeInForce::parse);

    Order {
        client_order_id: broker_order.client_order_id.clone(),
        broker_order_id: Some(broker_order.id.clone()),
        qty: changed_dec("qty").unwrap_or(original.qty),
        limit_price: changed_dec("limit_price").or(original.limit_price),
        stop_price: changed_dec("stop_price").or(original.stop_price),
        time_in_force: changed_tif.unwrap_or(original.time_in_force),
        status: broker_order.status,
        filled_qty: broker_order.filled_qty,
        filled_avg_price: broker_order.filled_avg_price,
        created_at: now,
        updated_at: now,
        submitted_at: Some(now),
        broker_updated_at: broker_order.updated_at,
        source_priority: SourcePriority::Reconciliation,
        metadata: serde_json::json!({}),
        ..original.clone()
    }
}
