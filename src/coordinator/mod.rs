//! Shared safety-state seam.
//!
//! Kill-switch, circuit breaker, symbol quarantine, position reservations,
//! and the reconciliation override capability all live in a coordination
//! store shared across gateway processes. The store itself is an external
//! collaborator; this module defines the operations the core invokes plus
//! thin typed handles used by the gates, and ships an in-memory
//! implementation for single-process deployments and tests.

mod memory;

pub use memory::MemoryCoordinator;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::Side;

#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    /// The store is unreachable. Every caller fails closed on this.
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),

    #[error("coordinator error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchStatus {
    pub engaged: bool,
    pub reason: Option<String>,
    pub operator: Option<String>,
    pub engaged_at: Option<DateTime<Utc>>,
    pub details: Option<String>,
}

/// One entry of the bounded append-only kill-switch history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchEvent {
    pub action: String,
    pub operator: String,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub tripped: bool,
    pub reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
}

/// Inputs to an atomic soft-reserve against the position limit.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub max_limit: Decimal,
    /// Authoritative local balance at the time of the call.
    pub current_position: Decimal,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ReserveOutcome {
    pub approved: bool,
    /// Opaque single-use token; present iff approved.
    pub token: Option<String>,
    pub reason: Option<String>,
    pub previous_position: Decimal,
    pub new_position: Decimal,
}

/// Operator-issued capability that forces the reconciliation gate open.
/// TTL-bearing so a forgotten override cannot linger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideCapability {
    pub operator: String,
    pub note: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Operations the core invokes against the shared coordination store.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Liveness probe used by the recovery manager before clearing
    /// availability flags.
    async fn health_check(&self) -> Result<(), CoordinatorError>;

    // Kill switch
    async fn engage_kill_switch(
        &self,
        reason: &str,
        operator: &str,
        details: Option<&str>,
    ) -> Result<(), CoordinatorError>;
    async fn disengage_kill_switch(
        &self,
        operator: &str,
        notes: Option<&str>,
    ) -> Result<(), CoordinatorError>;
    async fn is_kill_switch_engaged(&self) -> Result<bool, CoordinatorError>;
    async fn kill_switch_status(&self) -> Result<KillSwitchStatus, CoordinatorError>;
    async fn kill_switch_history(&self) -> Result<Vec<KillSwitchEvent>, CoordinatorError>;

    // Circuit breaker
    async fn is_circuit_breaker_tripped(&self) -> Result<bool, CoordinatorError>;
    async fn trip_circuit_breaker(&self, reason: &str) -> Result<(), CoordinatorError>;
    async fn reset_circuit_breaker(&self) -> Result<(), CoordinatorError>;
    async fn circuit_breaker_status(&self) -> Result<CircuitBreakerStatus, CoordinatorError>;

    // Symbol quarantine
    async fn is_symbol_quarantined(&self, symbol: &str) -> Result<bool, CoordinatorError>;
    async fn quarantine_symbol(&self, symbol: &str, ttl: Duration)
        -> Result<(), CoordinatorError>;

    // Position reservations (TTL-backed)
    async fn reserve_position(
        &self,
        req: &ReserveRequest,
    ) -> Result<ReserveOutcome, CoordinatorError>;
    async fn confirm_reservation(&self, symbol: &str, token: &str)
        -> Result<bool, CoordinatorError>;
    async fn release_reservation(&self, symbol: &str, token: &str)
        -> Result<bool, CoordinatorError>;

    // Reconciliation override capability
    async fn set_reconciliation_override(
        &self,
        operator: &str,
        note: &str,
        ttl: Duration,
    ) -> Result<(), CoordinatorError>;
    async fn reconciliation_override(
        &self,
    ) -> Result<Option<OverrideCapability>, CoordinatorError>;

    /// Best-effort fan-out invalidation of derived caches for a trading
    /// date. Failures are logged by callers, never fatal.
    async fn invalidate_performance_cache(&self, date: NaiveDate)
        -> Result<(), CoordinatorError>;
}

/// Typed handle over the coordinator's kill-switch keys.
#[derive(Clone)]
pub struct KillSwitch {
    coordinator: Arc<dyn Coordinator>,
}

impl KillSwitch {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        KillSwitch { coordinator }
    }

    pub async fn is_engaged(&self) -> Result<bool, CoordinatorError> {
        self.coordinator.is_kill_switch_engaged().await
    }

    pub async fn engage(
        &self,
        reason: &str,
        operator: &str,
        details: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        self.coordinator
            .engage_kill_switch(reason, operator, details)
            .await
    }

    pub async fn disengage(
        &self,
        operator: &str,
        notes: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        self.coordinator.disengage_kill_switch(operator, notes).await
    }

    pub async fn status(&self) -> Result<KillSwitchStatus, CoordinatorError> {
        self.coordinator.kill_switch_status().await
    }

    pub async fn history(&self) -> Result<Vec<KillSwitchEvent>, CoordinatorError> {
        self.coordinator.kill_switch_history().await
    }
}

/// Typed handle over the coordinator's circuit-breaker keys.
#[derive(Clone)]
pub struct CircuitBreaker {
    coordinator: Arc<dyn Coordinator>,
}

impl CircuitBreaker {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        CircuitBreaker { coordinator }
    }

    pub async fn is_tripped(&self) -> Result<bool, CoordinatorError> {
        self.coordinator.is_circuit_breaker_tripped().await
    }

    pub async fn trip(&self, reason: &str) -> Result<(), CoordinatorError> {
        self.coordinator.trip_circuit_breaker(reason).await
    }

    pub async fn reset(&self) -> Result<(), CoordinatorError> {
        self.coordinator.reset_circuit_breaker().await
    }

    pub async fn status(&self) -> Result<CircuitBreakerStatus, CoordinatorError> {
        self.coordinator.circuit_breaker_status().await
    }
}
