//! Order admission pipeline.
//!
//! The single ingress for new orders. Safety gates run in a strict order and
//! the first failure aborts the request; once a position reservation is
//! taken, every later failure path releases it before returning. Identical
//! requests on the same trading date hash to the same client order id, so
//! retries resolve to the already-persisted order instead of duplicating it.
//!
//! Gate order: availability, kill-switch, circuit breaker, quarantine,
//! reconciliation, fat-finger, reservation, idempotency, persistence, broker
//! dispatch.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::broker::{BrokerClient, BrokerError};
use crate::config::GatewayConfig;
use crate::coordinator::Coordinator;
use crate::error::GatewayError;
use crate::fat_finger::FatFingerValidator;
use crate::ids::generate_client_order_id;
use crate::ledger::{Ledger, LedgerError, StatusUpdate};
use crate::market::{LiquidityProvider, PriceCache};
use crate::models::{
    AuthContext, ExecutionStyle, Order, OrderRequest, OrderResponse, OrderStatus, SourcePriority,
};
use crate::recovery::RecoveryManager;
use crate::reconciliation::StartupReconciler;
use crate::reservation::PositionReservation;
use crate::scheduler::RegisterOutcome;
use crate::slicer::{TwapRequest, TwapSlicer};

pub struct OrderAdmission {
    config: GatewayConfig,
    ledger: Arc<dyn Ledger>,
    broker: Option<Arc<dyn BrokerClient>>,
    coordinator: Arc<dyn Coordinator>,
    recovery: Arc<RecoveryManager>,
    reconciler: Arc<StartupReconciler>,
    fat_finger: Arc<FatFingerValidator>,
    liquidity: Option<Arc<dyn LiquidityProvider>>,
    prices: Arc<PriceCache>,
    slicer: TwapSlicer,
}

impl OrderAdmission {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GatewayConfig,
        ledger: Arc<dyn Ledger>,
        broker: Option<Arc<dyn BrokerClient>>,
        coordinator: Arc<dyn Coordinator>,
        recovery: Arc<RecoveryManager>,
        reconciler: Arc<StartupReconciler>,
        fat_finger: Arc<FatFingerValidator>,
        liquidity: Option<Arc<dyn LiquidityProvider>>,
        prices: Arc<PriceCache>,
    ) -> Self {
        OrderAdmission {
            config,
            ledger,
            broker,
            coordinator,
            recovery,
            reconciler,
            fat_finger,
            liquidity,
            prices,
            slicer: TwapSlicer::new(),
        }
    }

    /// Submit a single order through the full gate pipeline.
    pub async fn submit(
        &self,
        order: &OrderRequest,
        _auth: &AuthContext,
    ) -> Result<OrderResponse, GatewayError> {
        order.validate()?;
        if order.execution_style == ExecutionStyle::Twap {
            return Err(GatewayError::Validation(
                "TWAP execution uses the slicing endpoint, not single-order submission".into(),
            ));
        }

        let client_order_id =
            generate_client_order_id(order, &self.config.strategy_id, None);
        info!(
            client_order_id = %client_order_id,
            symbol = %order.symbol,
            side = order.side.as_str(),
            qty = order.qty,
            order_type = order.order_type.as_str(),
            "order request received"
        );

        // Gates 1-6.
        self.run_pre_trade_gates(order, &client_order_id).await?;

        // Gate 7: position reservation (skipped in dry-run).
        let mut reservation_token: Option<(Arc<PositionReservation>, String)> = None;
        if !self.config.dry_run {
            let reservation = self
                .recovery
                .position_reservation()
                .ok_or_else(|| {
                    GatewayError::Unavailable("position reservation service unavailable".into())
                })?;
            let current_position = self
                .ledger
                .get_position_by_symbol(&order.symbol)
                .await?
                .map(|p| p.qty)
                .unwrap_or(Decimal::ZERO);
            let outcome = reservation
                .reserve(
                    &order.symbol,
                    order.side,
                    Decimal::from(order.qty),
                    self.config.max_position_qty,
                    current_position,
                )
                .await?;
            if !outcome.approved {
                let reason = outcome.reason.unwrap_or_else(|| "limit exceeded".into());
                warn!(client_order_id = %client_order_id, %reason, "order blocked by position limits");
                return Err(GatewayError::PositionLimit(reason));
            }
            let token = outcome.token.ok_or_else(|| {
                GatewayError::Internal("reservation approved without a token".into())
            })?;
            reservation_token = Some((reservation, token));
        }

        // Gate 8: idempotency. A replay releases the fresh reservation and
        // returns the stored order.
        match self.ledger.get_order_by_client_id(&client_order_id).await {
            Ok(Some(existing)) => {
                info!(client_order_id = %client_order_id, status = existing.status.as_str(), "order already exists (idempotent)");
                self.release_if_reserved(&order.symbol, &reservation_token).await;
                return Ok(OrderResponse::from_order(
                    &existing,
                    "Order already exists (idempotent retry)",
                ));
            }
            Ok(None) => {}
            Err(e) => {
                self.release_if_reserved(&order.symbol, &reservation_token).await;
                return Err(GatewayError::Unavailable(format!(
                    "idempotency check failed: {e}"
                )));
            }
        }

        // Gate 9: persistence.
        let status = if self.config.dry_run {
            OrderStatus::DryRun
        } else {
            OrderStatus::PendingNew
        };
        let row = self.build_order_row(order, &client_order_id, status);
        match self.ledger.create_order(&row).await {
            Ok(()) => {}
            Err(LedgerError::Duplicate(_)) => {
                // Concurrent identical submission won the insert race.
                self.release_if_reserved(&order.symbol, &reservation_token).await;
                let existing = self
                    .ledger
                    .get_order_by_client_id(&client_order_id)
                    .await?
                    .ok_or_else(|| {
                        GatewayError::Internal(
                            "order missing after unique violation".into(),
                        )
                    })?;
                info!(client_order_id = %client_order_id, "order already exists (concurrent retry)");
                return Ok(OrderResponse::from_order(
                    &existing,
                    "Order already exists (concurrent retry)",
                ));
            }
            Err(e) => {
                self.release_if_reserved(&order.symbol, &reservation_token).await;
                return Err(e.into());
            }
        }

        // Gate 10: broker dispatch (live only).
        let mut broker_order_id = None;
        if !self.config.dry_run {
            let Some(broker) = &self.broker else {
                self.release_if_reserved(&order.symbol, &reservation_token).await;
                error!(client_order_id = %client_order_id, "broker client not initialized");
                return Err(GatewayError::Unavailable(
                    "broker client not initialized".into(),
                ));
            };

            match broker.submit_order(order, &client_order_id).await {
                Ok(ack) => {
                    broker_order_id = Some(ack.id.clone());
                    self.ledger
                        .update_order_broker_id(&client_order_id, &ack.id, ack.status)
                        .await?;
                    if let Some((reservation, token)) = &reservation_token {
                        if let Err(e) = reservation.confirm(&order.symbol, token).await {
                            warn!(client_order_id = %client_order_id, error = %e, "reservation confirm failed");
                        }
                    }
                    info!(
                        client_order_id = %client_order_id,
                        broker_order_id = %ack.id,
                        "order submitted to broker"
                    );
                }
                Err(err) => {
                    self.release_if_reserved(&order.symbol, &reservation_token).await;
                    match &err {
                        BrokerError::Validation(_) | BrokerError::Rejection(_) => {
                            warn!(client_order_id = %client_order_id, error = %err, "order refused by broker");
                            self.mark_rejected(&client_order_id).await;
                        }
                        BrokerError::Connection(_) => {
                            error!(client_order_id = %client_order_id, error = %err, "broker connection error");
                        }
                    }
                    return Err(err.into());
                }
            }
        }

        let stored = self
            .ledger
            .get_order_by_client_id(&client_order_id)
            .await?
            .ok_or_else(|| {
                GatewayError::Internal("order inserted but not found in ledger".into())
            })?;
        let message = if self.config.dry_run {
            "Order logged (DRY_RUN mode)"
        } else {
            "Order submitted"
        };
        info!(
            client_order_id = %client_order_id,
            broker_order_id = broker_order_id.as_deref().unwrap_or("-"),
            status = stored.status.as_str(),
            "order admission complete"
        );
        Ok(OrderResponse::from_order(&stored, message))
    }

    /// Look up an order. Cross-strategy callers see NotFound, never a hint
    /// that the id exists.
    pub async fn get_order(
        &self,
        client_order_id: &str,
        auth: &AuthContext,
    ) -> Result<Order, GatewayError> {
        let order = self
            .ledger
            .get_order_by_client_id(client_order_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("order {client_order_id}")))?;
        if !auth.can_access_strategy(&order.strategy_id) {
            return Err(GatewayError::NotFound(format!("order {client_order_id}")));
        }
        Ok(order)
    }

    /// Cancel a single order. Terminal orders are a successful no-op.
    pub async fn cancel_order(
        &self,
        client_order_id: &str,
        auth: &AuthContext,
    ) -> Result<OrderResponse, GatewayError> {
        let order = self.get_order(client_order_id, auth).await?;

        if order.status.is_terminal() {
            return Ok(OrderResponse::from_order(
                &order,
                "Order already in terminal state",
            ));
        }

        if !self.config.dry_run {
            let Some(broker) = &self.broker else {
                return Err(GatewayError::Unavailable(
                    "broker client not initialized".into(),
                ));
            };
            if let Some(broker_order_id) = &order.broker_order_id {
                broker.cancel_order(broker_order_id).await?;
            }
        }

        let update = StatusUpdate {
            client_order_id: client_order_id.to_string(),
            status: OrderStatus::Canceled,
            broker_updated_at: Utc::now(),
            source_priority: SourcePriority::Manual,
            filled_qty: Some(order.filled_qty),
            filled_avg_price: order.filled_avg_price,
            filled_at: order.filled_at,
            broker_order_id: order.broker_order_id.clone(),
        };
        self.ledger.update_order_status_cas(&update).await?;

        let stored = self
            .ledger
            .get_order_by_client_id(client_order_id)
            .await?
            .unwrap_or(order);
        info!(client_order_id, status = stored.status.as_str(), "order canceled");
        Ok(OrderResponse::from_order(&stored, "Order canceled"))
    }

    /// TWAP entry point: parent-level gates, deterministic plan, atomic
    /// registration with the scheduler.
    pub async fn submit_sliced(
        &self,
        req: &TwapRequest,
        _auth: &AuthContext,
    ) -> Result<RegisterOutcome, GatewayError> {
        let bounds = &self.config.slicer;
        if req.duration_minutes < bounds.min_duration_minutes
            || req.duration_minutes > bounds.max_duration_minutes
        {
            return Err(GatewayError::Validation(format!(
                "duration_minutes must be within [{}, {}]",
                bounds.min_duration_minutes, bounds.max_duration_minutes
            )));
        }
        if req.interval_seconds < bounds.min_interval_seconds
            || req.interval_seconds > bounds.max_interval_seconds
        {
            return Err(GatewayError::Validation(format!(
                "interval_seconds must be within [{}, {}]",
                bounds.min_interval_seconds, bounds.max_interval_seconds
            )));
        }

        let template = OrderRequest {
            symbol: req.symbol.clone(),
            side: req.side,
            qty: req.qty,
            order_type: req.order_type,
            limit_price: req.limit_price,
            stop_price: req.stop_price,
            time_in_force: req.time_in_force,
            execution_style: ExecutionStyle::Twap,
        };
        template.validate()?;

        let plan = self.slicer.plan(req)?;
        if plan.total_slices < bounds.min_slices {
            return Err(GatewayError::Validation(format!(
                "plan produces {} slices, below the minimum of {}",
                plan.total_slices, bounds.min_slices
            )));
        }
        if let Some(smallest) = plan.slices.iter().map(|s| s.qty).min() {
            if smallest < bounds.min_slice_qty {
                return Err(GatewayError::Validation(format!(
                    "slice qty {} is below the minimum of {}",
                    smallest, bounds.min_slice_qty
                )));
            }
        }

        // Parent-level safety gates over the full quantity.
        self.run_pre_trade_gates(&template, &plan.parent_order_id)
            .await?;

        let scheduler = self
            .recovery
            .slice_scheduler()
            .ok_or_else(|| GatewayError::Unavailable("slice scheduler unavailable".into()))?;
        let legacy = self.slicer.legacy_parent_id(req, plan.trade_date);
        scheduler
            .register_plan(&plan, &template, &self.config.strategy_id, legacy.as_deref())
            .await
    }

    /// Cancel every not-yet-submitted child of a TWAP parent.
    pub async fn cancel_slices_for_parent(
        &self,
        parent_order_id: &str,
        auth: &AuthContext,
    ) -> Result<u64, GatewayError> {
        // Scope check rides on the parent row.
        self.get_order(parent_order_id, auth).await?;
        let scheduler = self
            .recovery
            .slice_scheduler()
            .ok_or_else(|| GatewayError::Unavailable("slice scheduler unavailable".into()))?;
        scheduler.cancel_remaining_slices(parent_order_id).await
    }

    /// Child slices of a TWAP parent, in slice order.
    pub async fn get_slices_for_parent(
        &self,
        parent_order_id: &str,
        auth: &AuthContext,
    ) -> Result<Vec<Order>, GatewayError> {
        self.get_order(parent_order_id, auth).await?;
        Ok(self.ledger.get_slices_by_parent_id(parent_order_id).await?)
    }

    // ------------------------------------------------------------------
    // Gates 1-6, shared between single and sliced submission
    // ------------------------------------------------------------------

    async fn run_pre_trade_gates(
        &self,
        order: &OrderRequest,
        client_order_id: &str,
    ) -> Result<(), GatewayError> {
        // Gate 1: fail-closed availability.
        if self.recovery.needs_recovery() {
            error!(
                client_order_id,
                "order blocked: safety mechanism unavailable (fail closed)"
            );
            return Err(GatewayError::Unavailable(
                "safety mechanism unavailable (fail-closed)".into(),
            ));
        }

        // Gate 2: kill switch.
        let kill_switch = self.recovery.kill_switch().ok_or_else(|| {
            GatewayError::Unavailable("kill-switch state unavailable (fail-closed)".into())
        })?;
        match kill_switch.is_engaged().await {
            Ok(false) => {}
            Ok(true) => {
                warn!(client_order_id, "order blocked by kill-switch");
                return Err(GatewayError::SafetyGate(
                    "kill-switch engaged - new orders blocked".into(),
                ));
            }
            Err(e) => {
                self.recovery.set_kill_switch_unavailable(true);
                error!(client_order_id, error = %e, "kill-switch probe failed (fail closed)");
                return Err(GatewayError::Unavailable(
                    "kill-switch state unavailable (fail-closed)".into(),
                ));
            }
        }

        // Gate 3: circuit breaker.
        let breaker = self.recovery.circuit_breaker().ok_or_else(|| {
            GatewayError::Unavailable("circuit-breaker state unavailable (fail-closed)".into())
        })?;
        match breaker.is_tripped().await {
            Ok(false) => {}
            Ok(true) => {
                warn!(client_order_id, "order blocked by circuit breaker");
                return Err(GatewayError::SafetyGate(
                    "circuit breaker tripped - trading paused".into(),
                ));
            }
            Err(e) => {
                self.recovery.set_circuit_breaker_unavailable(true);
                error!(client_order_id, error = %e, "circuit-breaker probe failed (fail closed)");
                return Err(GatewayError::Unavailable(
                    "circuit-breaker state unavailable (fail-closed)".into(),
                ));
            }
        }

        // Gate 4: symbol quarantine.
        match self.coordinator.is_symbol_quarantined(&order.symbol).await {
            Ok(false) => {}
            Ok(true) => {
                warn!(client_order_id, symbol = %order.symbol, "order blocked by quarantine");
                return Err(GatewayError::SafetyGate(format!(
                    "symbol {} is quarantined due to repeated order failures",
                    order.symbol
                )));
            }
            Err(e) => {
                error!(client_order_id, error = %e, "quarantine check unavailable (fail closed)");
                return Err(GatewayError::Unavailable(
                    "quarantine check unavailable".into(),
                ));
            }
        }

        // Gate 5: reconciliation / reduce-only.
        self.reconciler.admission_gate(order).await?;

        // Gate 6: fat-finger thresholds.
        let thresholds = self.fat_finger.effective_thresholds(&order.symbol);
        let price = order
            .limit_price
            .or(order.stop_price)
            .or_else(|| {
                self.prices
                    .latest_price(&order.symbol, self.config.max_price_age_seconds)
            });
        let adv = if thresholds.max_adv_pct.is_some() {
            match &self.liquidity {
                Some(liquidity) => liquidity.adv(&order.symbol).await,
                None => None,
            }
        } else {
            None
        };
        let result = self
            .fat_finger
            .validate(&order.symbol, order.qty, price, adv);
        if result.breached {
            let reason = result.breach_summary();
            warn!(
                client_order_id,
                symbol = %order.symbol,
                qty = order.qty,
                breaches = %reason,
                "order blocked by fat-finger validation"
            );
            return Err(GatewayError::FatFinger {
                reason,
                report: serde_json::to_value(&result)
                    .unwrap_or(serde_json::Value::Null),
            });
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn release_if_reserved(
        &self,
        symbol: &str,
        reservation_token: &Option<(Arc<PositionReservation>, String)>,
    ) {
        if let Some((reservation, token)) = reservation_token {
            reservation.release(symbol, token).await;
        }
    }

    async fn mark_rejected(&self, client_order_id: &str) {
        let update = StatusUpdate {
            client_order_id: client_order_id.to_string(),
            status: OrderStatus::Rejected,
            broker_updated_at: Utc::now(),
            source_priority: SourcePriority::Manual,
            filled_qty: Some(Decimal::ZERO),
            filled_avg_price: None,
            filled_at: None,
            broker_order_id: None,
        };
        if let Err(e) = self.ledger.update_order_status_cas(&update).await {
            error!(client_order_id, error = %e, "failed to mark order rejected");
        }
    }

    fn build_order_row(
        &self,
        order: &OrderRequest,
        client_order_id: &str,
        status: OrderStatus,
    ) -> Order {
        let now = Utc::now();
        Order {
            client_order_id: client_order_id.to_string(),
            strategy_id: self.config.strategy_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: Decimal::from(order.qty),
            order_type: order.order_type,
            limit_price: order.limit_price,
            stop_price: order.stop_price,
            time_in_force: order.time_in_force,
            execution_style: order.execution_style,
            status,
            broker_order_id: None,
            retry_count: 0,
            parent_order_id: None,
            slice_num: None,
            total_slices: None,
            scheduled_time: None,
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            filled_at: None,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            broker_updated_at: None,
            source_priority: SourcePriority::Manual,
            metadata: serde_json::json!({}),
        }
    }
}
