//! In-process coordinator.
//!
//! Reference implementation of [`Coordinator`] for single-process
//! deployments and tests. All state sits behind one mutex; reservation
//! arithmetic is atomic under it, which is the property the distributed
//! store provides per symbol.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

use super::{
    CircuitBreakerStatus, Coordinator, CoordinatorError, KillSwitchEvent, KillSwitchStatus,
    OverrideCapability, ReserveOutcome, ReserveRequest,
};

/// Kill-switch history entries kept (append-only, bounded).
const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone)]
struct Reservation {
    token: String,
    /// Signed contribution to the effective position.
    delta: Decimal,
    expires_at: DateTime<Utc>,
    confirmed: bool,
}

#[derive(Default)]
struct State {
    kill_engaged: bool,
    kill_reason: Option<String>,
    kill_operator: Option<String>,
    kill_engaged_at: Option<DateTime<Utc>>,
    kill_details: Option<String>,
    kill_history: VecDeque<KillSwitchEvent>,

    breaker_tripped: bool,
    breaker_reason: Option<String>,
    breaker_tripped_at: Option<DateTime<Utc>>,

    quarantined: HashMap<String, DateTime<Utc>>,
    reservations: HashMap<String, Vec<Reservation>>,
    override_capability: Option<OverrideCapability>,
    invalidated_dates: Vec<NaiveDate>,
}

/// Process-local [`Coordinator`].
#[derive(Default)]
pub struct MemoryCoordinator {
    state: Mutex<State>,
    /// Simulated outage switch for recovery tests.
    unavailable: Mutex<bool>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a coordination-store outage: every operation returns
    /// `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    /// Dates whose derived caches were invalidated, oldest first.
    pub fn invalidated_dates(&self) -> Vec<NaiveDate> {
        self.state.lock().invalidated_dates.clone()
    }

    /// Count of live (unexpired) reservations for a symbol.
    pub fn active_reservation_count(&self, symbol: &str) -> usize {
        let now = Utc::now();
        self.state
            .lock()
            .reservations
            .get(&symbol.to_ascii_uppercase())
            .map(|rs| rs.iter().filter(|r| r.expires_at > now).count())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), CoordinatorError> {
        if *self.unavailable.lock() {
            Err(CoordinatorError::Unavailable(
                "simulated coordinator outage".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn push_history(state: &mut State, event: KillSwitchEvent) {
        if state.kill_history.len() >= HISTORY_LIMIT {
            state.kill_history.pop_front();
        }
        state.kill_history.push_back(event);
    }

    fn prune_reservations(reservations: &mut Vec<Reservation>, now: DateTime<Utc>) {
        reservations.retain(|r| r.expires_at > now);
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn health_check(&self) -> Result<(), CoordinatorError> {
        self.check_available()
    }

    async fn engage_kill_switch(
        &self,
        reason: &str,
        operator: &str,
        details: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.kill_engaged = true;
        state.kill_reason = Some(reason.to_string());
        state.kill_operator = Some(operator.to_string());
        state.kill_engaged_at = Some(Utc::now());
        state.kill_details = details.map(|d| d.to_string());
        Self::push_history(
            &mut state,
            KillSwitchEvent {
                action: "engaged".to_string(),
                operator: operator.to_string(),
                note: Some(reason.to_string()),
                at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn disengage_kill_switch(
        &self,
        operator: &str,
        notes: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.kill_engaged = false;
        state.kill_reason = None;
        state.kill_operator = None;
        state.kill_engaged_at = None;
        state.kill_details = None;
        Self::push_history(
            &mut state,
            KillSwitchEvent {
                action: "disengaged".to_string(),
                operator: operator.to_string(),
                note: notes.map(|n| n.to_string()),
                at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn is_kill_switch_engaged(&self) -> Result<bool, CoordinatorError> {
        self.check_available()?;
        Ok(self.state.lock().kill_engaged)
    }

    async fn kill_switch_status(&self) -> Result<KillSwitchStatus, CoordinatorError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(KillSwitchStatus {
            engaged: state.kill_engaged,
            reason: state.kill_reason.clone(),
            operator: state.kill_operator.clone(),
            engaged_at: state.kill_engaged_at,
            details: state.kill_details.clone(),
        })
    }

    async fn kill_switch_history(&self) -> Result<Vec<KillSwitchEvent>, CoordinatorError> {
        self.check_available()?;
        Ok(self.state.lock().kill_history.iter().cloned().collect())
    }

    async fn is_circuit_breaker_tripped(&self) -> Result<bool, CoordinatorError> {
        self.check_available()?;
        Ok(self.state.lock().breaker_tripped)
    }

    async fn trip_circuit_breaker(&self, reason: &str) -> Result<(), CoordinatorError> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.breaker_tripped = true;
        state.breaker_reason = Some(reason.to_string());
        state.breaker_tripped_at = Some(Utc::now());
        Ok(())
    }

    async fn reset_circuit_breaker(&self) -> Result<(), CoordinatorError> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.breaker_tripped = false;
        state.breaker_reason = None;
        state.breaker_tripped_at = None;
        Ok(())
    }

    async fn circuit_breaker_status(&self) -> Result<CircuitBreakerStatus, CoordinatorError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(CircuitBreakerStatus {
            tripped: state.breaker_tripped,
            reason: state.breaker_reason.clone(),
            tripped_at: state.breaker_tripped_at,
        })
    }

    async fn is_symbol_quarantined(&self, symbol: &str) -> Result<bool, CoordinatorError> {
        self.check_available()?;
        let key = symbol.to_ascii_uppercase();
        let mut state = self.state.lock();
        match state.quarantined.get(&key) {
            Some(expires) if *expires > Utc::now() => Ok(true),
            Some(_) => {
                state.quarantined.remove(&key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn quarantine_symbol(
        &self,
        symbol: &str,
        ttl: Duration,
    ) -> Result<(), CoordinatorError> {
        self.check_available()?;
        let expires = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| CoordinatorError::Internal(e.to_string()))?;
        self.state
            .lock()
            .quarantined
            .insert(symbol.to_ascii_uppercase(), expires);
        Ok(())
    }

    async fn reserve_position(
        &self,
        req: &ReserveRequest,
    ) -> Result<ReserveOutcome, CoordinatorError> {
        self.check_available()?;
        let now = Utc::now();
        let delta = req.side.signed(req.qty);

        let mut state = self.state.lock();
        let reservations = state
            .reservations
            .entry(req.symbol.to_ascii_uppercase())
            .or_default();
        Self::prune_reservations(reservations, now);

        let reserved: Decimal = reservations.iter().map(|r| r.delta).sum();
        let previous = req.current_position + reserved;
        let projected = previous + delta;

        if projected.abs() > req.max_limit {
            return Ok(ReserveOutcome {
                approved: false,
                token: None,
                reason: Some(format!(
                    "projected position {} exceeds limit {} (current {}, reserved {})",
                    projected, req.max_limit, req.current_position, reserved
                )),
                previous_position: previous,
                new_position: previous,
            });
        }

        let token = Uuid::new_v4().simple().to_string();
        let expires_at = now
            + chrono::Duration::from_std(req.ttl)
                .map_err(|e| CoordinatorError::Internal(e.to_string()))?;
        reservations.push(Reservation {
            token: token.clone(),
            delta,
            expires_at,
            confirmed: false,
        });

        Ok(ReserveOutcome {
            approved: true,
            token: Some(token),
            reason: None,
            previous_position: previous,
            new_position: projected,
        })
    }

    async fn confirm_reservation(
        &self,
        symbol: &str,
        token: &str,
    ) -> Result<bool, CoordinatorError> {
        self.check_available()?;
        // Confirmation is a no-op state transition: the reservation keeps
        // counting toward the limit until its TTL expires, covering the
        // window before the fill lands in the authoritative position.
        let mut state = self.state.lock();
        let Some(reservations) = state.reservations.get_mut(&symbol.to_ascii_uppercase()) else {
            return Ok(false);
        };
        match reservations.iter_mut().find(|r| r.token == token) {
            Some(r) if !r.confirmed => {
                r.confirmed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_reservation(
        &self,
        symbol: &str,
        token: &str,
    ) -> Result<bool, CoordinatorError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(reservations) = state.reservations.get_mut(&symbol.to_ascii_uppercase()) else {
            return Ok(false);
        };
        let before = reservations.len();
        reservations.retain(|r| r.token != token || r.confirmed);
        Ok(reservations.len() < before)
    }

    async fn set_reconciliation_override(
        &self,
        operator: &str,
        note: &str,
        ttl: Duration,
    ) -> Result<(), CoordinatorError> {
        self.check_available()?;
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| CoordinatorError::Internal(e.to_string()))?;
        self.state.lock().override_capability = Some(OverrideCapability {
            operator: operator.to_string(),
            note: note.to_string(),
            issued_at: now,
            expires_at,
        });
        Ok(())
    }

    async fn reconciliation_override(
        &self,
    ) -> Result<Option<OverrideCapability>, CoordinatorError> {
        self.check_available()?;
        let mut state = self.state.lock();
        match &state.override_capability {
            Some(cap) if cap.expires_at > Utc::now() => Ok(Some(cap.clone())),
            Some(_) => {
                state.override_capability = None;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn invalidate_performance_cache(
        &self,
        date: NaiveDate,
    ) -> Result<(), CoordinatorError> {
        self.check_available()?;
        self.state.lock().invalidated_dates.push(date);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use rust_decimal_macros::dec;

    fn reserve_req(side: Side, qty: Decimal, current: Decimal) -> ReserveRequest {
        ReserveRequest {
            symbol: "AAPL".to_string(),
            side,
            qty,
            max_limit: dec!(1000),
            current_position: current,
            ttl: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn reservations_stack_until_limit() {
        let coord = MemoryCoordinator::new();
        let first = coord
            .reserve_position(&reserve_req(Side::Buy, dec!(600), dec!(0)))
            .await
            .unwrap();
        assert!(first.approved);
        assert_eq!(first.new_position, dec!(600));

        let second = coord
            .reserve_position(&reserve_req(Side::Buy, dec!(600), dec!(0)))
            .await
            .unwrap();
        assert!(!second.approved);
        assert_eq!(second.previous_position, dec!(600));

        // Selling against the reserved exposure still fits.
        let third = coord
            .reserve_position(&reserve_req(Side::Sell, dec!(600), dec!(0)))
            .await
            .unwrap();
        assert!(third.approved);
    }

    #[tokio::test]
    async fn release_frees_the_reserved_amount() {
        let coord = MemoryCoordinator::new();
        let first = coord
            .reserve_position(&reserve_req(Side::Buy, dec!(900), dec!(0)))
            .await
            .unwrap();
        let token = first.token.unwrap();

        assert!(
            !coord
                .reserve_position(&reserve_req(Side::Buy, dec!(200), dec!(0)))
                .await
                .unwrap()
                .approved
        );

        assert!(coord.release_reservation("AAPL", &token).await.unwrap());
        assert!(
            coord
                .reserve_position(&reserve_req(Side::Buy, dec!(200), dec!(0)))
                .await
                .unwrap()
                .approved
        );
    }

    #[tokio::test]
    async fn tokens_are_single_use() {
        let coord = MemoryCoordinator::new();
        let outcome = coord
            .reserve_position(&reserve_req(Side::Buy, dec!(10), dec!(0)))
            .await
            .unwrap();
        let token = outcome.token.unwrap();
        assert!(coord.release_reservation("AAPL", &token).await.unwrap());
        assert!(!coord.release_reservation("AAPL", &token).await.unwrap());
    }

    #[tokio::test]
    async fn confirmed_reservation_counts_until_ttl() {
        let coord = MemoryCoordinator::new();
        let outcome = coord
            .reserve_position(&reserve_req(Side::Buy, dec!(10), dec!(0)))
            .await
            .unwrap();
        let token = outcome.token.unwrap();
        assert!(coord.confirm_reservation("AAPL", &token).await.unwrap());
        // Second confirm and post-confirm release are both refused.
        assert!(!coord.confirm_reservation("AAPL", &token).await.unwrap());
        assert!(!coord.release_reservation("AAPL", &token).await.unwrap());
        assert_eq!(coord.active_reservation_count("AAPL"), 1);
    }

    #[tokio::test]
    async fn expired_reservations_stop_counting() {
        let coord = MemoryCoordinator::new();
        let mut req = reserve_req(Side::Buy, dec!(900), dec!(0));
        req.ttl = Duration::from_secs(0);
        coord.reserve_position(&req).await.unwrap();

        // TTL of zero expires immediately, so the next reserve sees nothing.
        let outcome = coord
            .reserve_position(&reserve_req(Side::Buy, dec!(900), dec!(0)))
            .await
            .unwrap();
        assert!(outcome.approved);
    }

    #[tokio::test]
    async fn current_position_counts_toward_limit() {
        let coord = MemoryCoordinator::new();
        let outcome = coord
            .reserve_position(&reserve_req(Side::Buy, dec!(200), dec!(900)))
            .await
            .unwrap();
        assert!(!outcome.approved);

        let outcome = coord
            .reserve_position(&reserve_req(Side::Sell, dec!(200), dec!(900)))
            .await
            .unwrap();
        assert!(outcome.approved);
        assert_eq!(outcome.new_position, dec!(700));
    }

    #[tokio::test]
    async fn short_limit_is_symmetric() {
        let coord = MemoryCoordinator::new();
        let outcome = coord
            .reserve_position(&reserve_req(Side::Sell, dec!(1200), dec!(0)))
            .await
            .unwrap();
        assert!(!outcome.approved);

        let outcome = coord
            .reserve_position(&reserve_req(Side::Sell, dec!(1000), dec!(0)))
            .await
            .unwrap();
        assert!(outcome.approved);
        assert_eq!(outcome.new_position, dec!(-1000));
    }

    #[tokio::test]
    async fn outage_mode_fails_every_operation() {
        let coord = MemoryCoordinator::new();
        coord.set_unavailable(true);
        assert!(coord.health_check().await.is_err());
        assert!(coord.is_kill_switch_engaged().await.is_err());
        assert!(coord
            .reserve_position(&reserve_req(Side::Buy, dec!(1), dec!(0)))
            .await
            .is_err());

        coord.set_unavailable(false);
        assert!(coord.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn kill_switch_history_is_bounded_and_append_only() {
        let coord = MemoryCoordinator::new();
        for i in 0..(HISTORY_LIMIT + 10) {
            coord
                .engage_kill_switch(&format!("reason {i}"), "ops", None)
                .await
                .unwrap();
        }
        let history = coord.kill_switch_history().await.unwrap();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.last().unwrap().note.as_deref(), Some("reason 59"));
    }

    #[tokio::test]
    async fn quarantine_expires_after_ttl() {
        let coord = MemoryCoordinator::new();
        coord
            .quarantine_symbol("GME", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(coord.is_symbol_quarantined("GME").await.unwrap());
        assert!(coord.is_symbol_quarantined("gme").await.unwrap());

        coord
            .quarantine_symbol("AMC", Duration::from_secs(0))
            .await
            .unwrap();
        assert!(!coord.is_symbol_quarantined("AMC").await.unwrap());
    }

    #[tokio::test]
    async fn override_capability_expires() {
        let coord = MemoryCoordinator::new();
        coord
            .set_reconciliation_override("ops", "forced after manual check", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(coord.reconciliation_override().await.unwrap().is_some());

        coord
            .set_reconciliation_override("ops", "expired", Duration::from_secs(0))
            .await
            .unwrap();
        assert!(coord.reconciliation_override().await.unwrap().is_none());
    }
}
