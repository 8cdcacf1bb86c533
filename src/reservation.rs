//! Position reservation service.
//!
//! Soft-reserve overlay on the coordinator that stops racing admissions from
//! jointly blowing through a position limit. Reserve before dispatch, then
//! confirm on broker success or release on any later failure; unreleased
//! reservations expire on their TTL so a crashed handler cannot wedge the
//! limit.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::coordinator::{Coordinator, CoordinatorError, ReserveOutcome, ReserveRequest};
use crate::error::GatewayError;
use crate::models::Side;

#[derive(Clone)]
pub struct PositionReservation {
    coordinator: Arc<dyn Coordinator>,
    ttl: Duration,
}

impl PositionReservation {
    pub fn new(coordinator: Arc<dyn Coordinator>, ttl: Duration) -> Self {
        PositionReservation { coordinator, ttl }
    }

    /// Atomically reserve headroom for `(side, qty)` against
    /// `|current + reserved + delta| <= max_limit`.
    ///
    /// Coordinator transport errors surface as `Unavailable` so the caller
    /// fails closed.
    pub async fn reserve(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        max_limit: Decimal,
        current_position: Decimal,
    ) -> Result<ReserveOutcome, GatewayError> {
        let req = ReserveRequest {
            symbol: symbol.to_string(),
            side,
            qty,
            max_limit,
            current_position,
            ttl: self.ttl,
        };
        let outcome = self.coordinator.reserve_position(&req).await.map_err(|e| {
            warn!(symbol, error = %e, "position reserve failed at coordinator");
            GatewayError::Unavailable(format!("position reservation: {e}"))
        })?;

        if outcome.approved {
            info!(
                symbol,
                side = side.as_str(),
                %qty,
                previous = %outcome.previous_position,
                new = %outcome.new_position,
                "position reserved"
            );
        }
        Ok(outcome)
    }

    /// Mark the reservation confirmed after broker acceptance. The record
    /// keeps counting toward the limit until its TTL lapses.
    pub async fn confirm(&self, symbol: &str, token: &str) -> Result<bool, CoordinatorError> {
        self.coordinator.confirm_reservation(symbol, token).await
    }

    /// Release a reservation after a failed dispatch. Best-effort: an
    /// unreleased record still expires on TTL.
    pub async fn release(&self, symbol: &str, token: &str) -> bool {
        match self.coordinator.release_reservation(symbol, token).await {
            Ok(released) => released,
            Err(e) => {
                warn!(symbol, token, error = %e, "reservation release failed; TTL will reap it");
                false
            }
        }
    }

    /// Coordinator reachability, used by the recovery manager's probe.
    pub async fn health_check(&self) -> Result<(), CoordinatorError> {
        self.coordinator.health_check().await
    }
}
