//! Idempotent in-place order modification.
//!
//! Replacement is broker-mediated: the original keeps trading until the
//! broker acknowledges the replace, then a single transaction marks it
//! `replaced`, inserts the successor under its own deterministic id, and
//! completes the modification record. If those writes are lost after the
//! broker succeeded, the record drops to `submitted_unconfirmed` and the
//! background reconciler converges it later.
//!
//! Risk-reducing modifications (pure qty decrease) bypass the kill-switch
//! and breaker gates: de-risking stays possible while trading is halted.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, BrokerError, ReplaceParams};
use crate::coordinator::Coordinator;
use crate::error::GatewayError;
use crate::ids::replacement_order_id;
use crate::ledger::{FinalizeModification, Ledger, LedgerError};
use crate::models::{
    AuthContext, ModificationRecord, ModificationStatus, ModifyRequest, ModifyResponse, Order,
    OrderStatus, OrderType, Side, SourcePriority,
};
use crate::recovery::RecoveryManager;
use crate::reservation::PositionReservation;

pub struct ModificationEngine {
    ledger: Arc<dyn Ledger>,
    broker: Arc<dyn BrokerClient>,
    coordinator: Arc<dyn Coordinator>,
    recovery: Arc<RecoveryManager>,
    lock_timeout: Duration,
    max_position_qty: Decimal,
    locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ModificationEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        broker: Arc<dyn BrokerClient>,
        coordinator: Arc<dyn Coordinator>,
        recovery: Arc<RecoveryManager>,
        lock_timeout: Duration,
        max_position_qty: Decimal,
    ) -> Self {
        ModificationEngine {
            ledger,
            broker,
            coordinator,
            recovery,
            lock_timeout,
            max_position_qty,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub async fn modify(
        &self,
        original_client_order_id: &str,
        changes: &ModifyRequest,
        idempotency_key: &str,
        auth: &AuthContext,
    ) -> Result<ModifyResponse, GatewayError> {
        if changes.is_empty() {
            return Err(GatewayError::Validation("no changes requested".into()));
        }

        // Short-lived per-order lock; contention resolves as a conflict so a
        // concurrent retry can observe the pending record instead.
        let lock = self.order_lock(original_client_order_id);
        let _guard = tokio::time::timeout(self.lock_timeout, lock.lock())
            .await
            .map_err(|_| {
                GatewayError::Conflict(format!(
                    "modification already in progress for {original_client_order_id}"
                ))
            })?;

        // Idempotency replay.
        if let Some(existing) = self
            .ledger
            .get_modification_by_idempotency_key(idempotency_key)
            .await?
        {
            return self.replay_response(existing);
        }

        let original = self
            .ledger
            .get_order_by_client_id(original_client_order_id)
            .await?
            .ok_or_else(|| {
                GatewayError::NotFound(format!("order {original_client_order_id}"))
            })?;
        if !auth.can_access_strategy(&original.strategy_id) {
            return Err(GatewayError::NotFound(format!(
                "order {original_client_order_id}"
            )));
        }

        self.check_eligibility(&original)?;
        let (change_map, effective) = compute_changes(&original, changes)?;
        self.check_price_monotonicity(&original, &effective)?;

        // Risk-reducing changes stay possible while trading is halted.
        let risk_reducing = is_risk_reducing(&original, changes);
        let mut reservation_token: Option<(Arc<PositionReservation>, String)> = None;
        if !risk_reducing {
            self.run_safety_gates(&original).await?;
            let qty_delta = effective.qty - original.qty;
            if qty_delta > Decimal::ZERO {
                reservation_token = Some(
                    self.reserve_delta(&original, qty_delta).await?,
                );
            }
        } else {
            info!(
                original_client_order_id,
                "risk-reducing modification bypasses kill-switch and breaker gates"
            );
        }

        let new_client_order_id =
            replacement_order_id(original_client_order_id, idempotency_key, None);
        let record = ModificationRecord {
            modification_id: Uuid::new_v4().simple().to_string(),
            original_client_order_id: original_client_order_id.to_string(),
            new_client_order_id: new_client_order_id.clone(),
            idempotency_key: idempotency_key.to_string(),
            changes: change_map.clone(),
            status: ModificationStatus::Pending,
            error_message: None,
            seq: 0,
            modified_at: Utc::now(),
        };
        match self.ledger.insert_pending_modification(&record).await {
            Ok(_) => {}
            Err(LedgerError::Duplicate(_)) => {
                // Another retry with the same key inserted first.
                self.release_if_reserved(&original.symbol, &reservation_token)
                    .await;
                let existing = self
                    .ledger
                    .get_modification_by_idempotency_key(idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        GatewayError::Internal(
                            "modification missing after unique violation".into(),
                        )
                    })?;
                return self.replay_response(existing);
            }
            Err(e) => {
                self.release_if_reserved(&original.symbol, &reservation_token)
                    .await;
                return Err(e.into());
            }
        }

        // Broker-mediated replace.
        let broker_order_id = original.broker_order_id.clone().ok_or_else(|| {
            GatewayError::Internal("eligible order lost its broker id".into())
        })?;
        let broker_order_id = broker_order_id.as_str();
        let params = ReplaceParams {
            qty: changes.qty,
            limit_price: changes.limit_price,
            stop_price: changes.stop_price,
            time_in_force: changes.time_in_force,
        };
        let ack = match self
            .broker
            .replace_order(broker_order_id, &params, &new_client_order_id)
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                self.release_if_reserved(&original.symbol, &reservation_token)
                    .await;
                return match err {
                    BrokerError::Connection(_) => {
                        // Outcome unknown: keep the record pending so the
                        // background reconciler can converge it.
                        warn!(
                            modification_id = %record.modification_id,
                            error = %err,
                            "replace outcome unknown; left pending for reconciliation"
                        );
                        Err(err.into())
                    }
                    _ => {
                        self.ledger
                            .update_modification_status(
                                &record.modification_id,
                                ModificationStatus::Failed,
                                Some(&err.to_string()),
                            )
                            .await?;
                        Err(err.into())
                    }
                };
            }
        };

        // Finalize in one transaction.
        let replacement = build_replacement(&original, &effective, &ack.id, &new_client_order_id, ack.status);
        match self
            .ledger
            .finalize_modification(&FinalizeModification {
                modification_id: record.modification_id.clone(),
                new_broker_order_id: Some(ack.id.clone()),
                replacement,
                original_client_order_id: original_client_order_id.to_string(),
            })
            .await
        {
            Ok(()) => {
                if let Some((reservation, token)) = &reservation_token {
                    if let Err(e) = reservation.confirm(&original.symbol, token).await {
                        warn!(error = %e, "modification reservation confirm failed");
                    }
                }
                info!(
                    modification_id = %record.modification_id,
                    original_client_order_id,
                    new_client_order_id = %new_client_order_id,
                    "order modification completed"
                );
                Ok(ModifyResponse {
                    modification_id: record.modification_id,
                    original_client_order_id: original_client_order_id.to_string(),
                    new_client_order_id,
                    status: ModificationStatus::Completed,
                    message: "Order replaced".into(),
                })
            }
            Err(e) => {
                // Broker replaced the order but our writes failed. Flag for
                // the reconciler and surface the inconsistency.
                error!(
                    modification_id = %record.modification_id,
                    error = %e,
                    "finalization failed after successful broker replace"
                );
                if let Err(e2) = self
                    .ledger
                    .update_modification_status(
                        &record.modification_id,
                        ModificationStatus::SubmittedUnconfirmed,
                        Some("finalization writes failed after broker replace"),
                    )
                    .await
                {
                    error!(error = %e2, "could not mark modification submitted_unconfirmed");
                }
                Err(GatewayError::Internal(
                    "replacement submitted but finalization failed; background reconciliation will converge"
                        .into(),
                ))
            }
        }
    }

    fn order_lock(&self, client_order_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(client_order_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn replay_response(
        &self,
        record: ModificationRecord,
    ) -> Result<ModifyResponse, GatewayError> {
        match record.status {
            ModificationStatus::Pending => Ok(ModifyResponse {
                modification_id: record.modification_id,
                original_client_order_id: record.original_client_order_id,
                new_client_order_id: record.new_client_order_id,
                status: ModificationStatus::Pending,
                message: "Modification in flight (accepted)".into(),
            }),
            ModificationStatus::Completed => Ok(ModifyResponse {
                modification_id: record.modification_id,
                original_client_order_id: record.original_client_order_id,
                new_client_order_id: record.new_client_order_id,
                status: ModificationStatus::Completed,
                message: "Modification already completed (idempotent)".into(),
            }),
            ModificationStatus::Failed => Err(GatewayError::Conflict(format!(
                "modification previously failed: {}",
                record.error_message.unwrap_or_else(|| "unknown".into())
            ))),
            ModificationStatus::SubmittedUnconfirmed => Err(GatewayError::Conflict(
                "modification submitted but unconfirmed; reconciliation pending".into(),
            )),
        }
    }

    fn check_eligibility(&self, original: &Order) -> Result<(), GatewayError> {
        if original.status.is_terminal() {
            return Err(GatewayError::Validation(format!(
                "order in terminal status {} cannot be modified",
                original.status.as_str()
            )));
        }
        if original.broker_order_id.is_none() {
            return Err(GatewayError::Validation(
                "order has no broker id yet; replacements are broker-mediated".into(),
            ));
        }
        if original.execution_style == crate::models::ExecutionStyle::Twap
            || original.parent_order_id.is_some()
            || original.total_slices.is_some()
        {
            return Err(GatewayError::Validation(
                "TWAP parents and slices cannot be modified through this path".into(),
            ));
        }
        Ok(())
    }

    fn check_price_monotonicity(
        &self,
        original: &Order,
        effective: &EffectiveParams,
    ) -> Result<(), GatewayError> {
        if original.order_type != OrderType::StopLimit {
            return Ok(());
        }
        let (Some(limit), Some(stop)) = (effective.limit_price, effective.stop_price) else {
            return Ok(());
        };
        match original.side {
            Side::Buy if limit < stop => Err(GatewayError::Validation(
                "buy stop_limit requires limit_price >= stop_price".into(),
            )),
            Side::Sell if limit > stop => Err(GatewayError::Validation(
                "sell stop_limit requires limit_price <= stop_price".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Gates 2-4 of the admission pipeline for non-reducing modifications.
    async fn run_safety_gates(&self, original: &Order) -> Result<(), GatewayError> {
        if self.recovery.needs_recovery() {
            return Err(GatewayError::Unavailable(
                "safety mechanism unavailable (fail-closed)".into(),
            ));
        }
        let kill_switch = self.recovery.kill_switch().ok_or_else(|| {
            GatewayError::Unavailable("kill-switch state unavailable".into())
        })?;
        match kill_switch.is_engaged().await {
            Ok(false) => {}
            Ok(true) => {
                return Err(GatewayError::SafetyGate(
                    "kill-switch engaged - modification blocked".into(),
                ));
            }
            Err(_) => {
                self.recovery.set_kill_switch_unavailable(true);
                return Err(GatewayError::Unavailable(
                    "kill-switch state unavailable".into(),
                ));
            }
        }
        let breaker = self.recovery.circuit_breaker().ok_or_else(|| {
            GatewayError::Unavailable("circuit-breaker state unavailable".into())
        })?;
        match breaker.is_tripped().await {
            Ok(false) => {}
            Ok(true) => {
                return Err(GatewayError::SafetyGate(
                    "circuit breaker tripped - modification blocked".into(),
                ));
            }
            Err(_) => {
                self.recovery.set_circuit_breaker_unavailable(true);
                return Err(GatewayError::Unavailable(
                    "circuit-breaker state unavailable".into(),
                ));
            }
        }
        match self.coordinator.is_symbol_quarantined(&original.symbol).await {
            Ok(false) => Ok(()),
            Ok(true) => Err(GatewayError::SafetyGate(format!(
                "symbol {} is quarantined",
                original.symbol
            ))),
            Err(_) => Err(GatewayError::Unavailable(
                "quarantine check unavailable".into(),
            )),
        }
    }

    async fn reserve_delta(
        &self,
        original: &Order,
        qty_delta: Decimal,
    ) -> Result<(Arc<PositionReservation>, String), GatewayError> {
        let reservation = self.recovery.position_reservation().ok_or_else(|| {
            GatewayError::Unavailable("position reservation service unavailable".into())
        })?;
        let current_position = self
            .ledger
            .get_position_by_symbol(&original.symbol)
            .await?
            .map(|p| p.qty)
            .unwrap_or(Decimal::ZERO);
        let outcome = reservation
            .reserve(
                &original.symbol,
                original.side,
                qty_delta,
                self.max_position_qty,
                current_position,
            )
            .await?;
        if !outcome.approved {
            return Err(GatewayError::PositionLimit(
                outcome.reason.unwrap_or_else(|| "limit exceeded".into()),
            ));
        }
        let token = outcome.token.ok_or_else(|| {
            GatewayError::Internal("reservation approved without a token".into())
        })?;
        Ok((reservation, token))
    }

    async fn release_if_reserved(
        &self,
        symbol: &str,
        reservation_token: &Option<(Arc<PositionReservation>, String)>,
    ) {
        if let Some((reservation, token)) = reservation_token {
            reservation.release(symbol, token).await;
        }
    }
}

struct EffectiveParams {
    qty: Decimal,
    limit_price: Option<Decimal>,
    stop_price: Option<Decimal>,
    time_in_force: crate::models::TimeInForce,
}

/// Field-by-field `{name: [old, new]}` map and the resulting parameters.
/// Only actually-changed fields count; requesting the current value is not a
/// change.
fn compute_changes(
    original: &Order,
    changes: &ModifyRequest,
) -> Result<(serde_json::Value, EffectiveParams), GatewayError> {
    let mut map = serde_json::Map::new();

    let mut effective = EffectiveParams {
        qty: original.qty,
        limit_price: original.limit_price,
        stop_price: original.stop_price,
        time_in_force: original.time_in_force,
    };

    if let Some(new_qty) = changes.qty {
        let new_qty = Decimal::from(new_qty);
        if new_qty < original.filled_qty {
            return Err(GatewayError::Validation(format!(
                "cannot reduce qty below filled quantity ({} < {})",
                new_qty, original.filled_qty
            )));
        }
        if new_qty != original.qty {
            map.insert(
                "qty".into(),
                serde_json::json!([original.qty.to_string(), new_qty.to_string()]),
            );
            effective.qty = new_qty;
        }
    }
    if let Some(new_limit) = changes.limit_price {
        if Some(new_limit) != original.limit_price {
            map.insert(
                "limit_price".into(),
                serde_json::json!([
                    original.limit_price.map(|p| p.to_string()),
                    new_limit.to_string()
                ]),
            );
            effective.limit_price = Some(new_limit);
        }
    }
    if let Some(new_stop) = changes.stop_price {
        if Some(new_stop) != original.stop_price {
            map.insert(
                "stop_price".into(),
                serde_json::json!([
                    original.stop_price.map(|p| p.to_string()),
                    new_stop.to_string()
                ]),
            );
            effective.stop_price = Some(new_stop);
        }
    }
    if let Some(new_tif) = changes.time_in_force {
        if new_tif != original.time_in_force {
            map.insert(
                "time_in_force".into(),
                serde_json::json!([original.time_in_force.as_str(), new_tif.as_str()]),
            );
            effective.time_in_force = new_tif;
        }
    }

    if map.is_empty() {
        return Err(GatewayError::Validation(
            "requested changes match the current order".into(),
        ));
    }
    Ok((serde_json::Value::Object(map), effective))
}

/// Strictly risk-reducing: qty decrease only, no price or tif changes.
fn is_risk_reducing(original: &Order, changes: &ModifyRequest) -> bool {
    if changes.limit_price.is_some()
        || changes.stop_price.is_some()
        || changes.time_in_force.is_some()
    {
        return false;
    }
    match changes.qty {
        Some(new_qty) => Decimal::from(new_qty) < original.qty,
        None => false,
    }
}

fn build_replacement(
    original: &Order,
    effective: &EffectiveParams,
    broker_order_id: &str,
    new_client_order_id: &str,
    status: OrderStatus,
) -> Order {
    let now = Utc::now();
    Order {
        client_order_id: new_client_order_id.to_string(),
        qty: effective.qty,
        limit_price: effective.limit_price,
        stop_price: effective.stop_price,
        time_in_force: effective.time_in_force,
        status,
        broker_order_id: Some(broker_order_id.to_string()),
        filled_qty: Decimal::ZERO,
        filled_avg_price: None,
        filled_at: None,
        created_at: now,
        updated_at: now,
        submitted_at: Some(now),
        broker_updated_at: None,
        source_priority: SourcePriority::Manual,
        metadata: serde_json::json!({}),
        ..original.clone()
    }
}
