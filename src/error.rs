//! Gateway error taxonomy.
//!
//! Collaborator failures are translated into these variants at the seam; the
//! transport layer maps `http_status()` onto real status codes.

use thiserror::Error;

use crate::broker::BrokerError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Inputs violate type/price/tif constraints. Non-retriable.
    #[error("invalid order: {0}")]
    Validation(String),

    /// Caller outside its strategy scope. Cross-strategy lookups report
    /// NotFound instead to avoid leaking existence.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Kill-switch, circuit breaker, quarantine, or reconciliation-gate
    /// refusal. Retriable after operator action.
    #[error("blocked by safety gate: {0}")]
    SafetyGate(String),

    /// A safety mechanism or the coordinator is unavailable. Fail-closed,
    /// retriable.
    #[error("safety mechanism unavailable: {0}")]
    Unavailable(String),

    /// One or more fat-finger thresholds breached; payload carries the
    /// structured report.
    #[error("order rejected by fat-finger checks: {reason}")]
    FatFinger {
        reason: String,
        report: serde_json::Value,
    },

    /// Position reservation refused the order.
    #[error("order blocked by position limits: {0}")]
    PositionLimit(String),

    #[error("broker validation failed: {0}")]
    BrokerValidation(String),

    #[error("order rejected by broker: {0}")]
    BrokerRejection(String),

    /// Network/timeout talking to the broker. Retriable; the reservation has
    /// already been released when this surfaces from admission.
    #[error("broker connection error: {0}")]
    BrokerTransport(String),

    /// Modification lock contention or stale idempotency state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Finalization failed after broker success, or another invariant broke.
    /// Recovered by the background reconciler.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP-equivalent status the transport should report.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::FatFinger { .. } => 400,
            GatewayError::BrokerValidation(_) => 400,
            GatewayError::Forbidden(_) => 403,
            GatewayError::NotFound(_) => 404,
            GatewayError::Conflict(_) => 409,
            GatewayError::BrokerRejection(_) => 422,
            GatewayError::PositionLimit(_) => 422,
            GatewayError::Internal(_) => 500,
            GatewayError::BrokerTransport(_) => 502,
            GatewayError::SafetyGate(_) => 503,
            GatewayError::Unavailable(_) => 503,
        }
    }

    /// Whether the caller may retry the identical request and expect it to
    /// eventually succeed without operator intervention.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GatewayError::Unavailable(_)
                | GatewayError::BrokerTransport(_)
                | GatewayError::Conflict(_)
        )
    }
}

impl From<BrokerError> for GatewayError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Validation(msg) => GatewayError::BrokerValidation(msg),
            BrokerError::Rejection(msg) => GatewayError::BrokerRejection(msg),
            BrokerError::Connection(msg) => GatewayError::BrokerTransport(msg),
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(format!("{err:#}"))
    }
}

impl From<crate::ledger::LedgerError> for GatewayError {
    fn from(err: crate::ledger::LedgerError) -> Self {
        use crate::ledger::LedgerError;
        match err {
            LedgerError::Duplicate(what) => GatewayError::Conflict(format!("duplicate {what}")),
            LedgerError::NotFound(what) => GatewayError::NotFound(what),
            LedgerError::Storage(e) => GatewayError::Internal(format!("{e:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_transport_contract() {
        assert_eq!(GatewayError::Validation("x".into()).http_status(), 400);
        assert_eq!(GatewayError::NotFound("x".into()).http_status(), 404);
        assert_eq!(GatewayError::Conflict("x".into()).http_status(), 409);
        assert_eq!(GatewayError::SafetyGate("x".into()).http_status(), 503);
        assert_eq!(GatewayError::BrokerTransport("x".into()).http_status(), 502);
    }

    #[test]
    fn broker_errors_translate_at_the_seam() {
        let e: GatewayError = BrokerError::Connection("timeout".into()).into();
        assert!(e.is_retriable());
        let e: GatewayError = BrokerError::Rejection("no".into()).into();
        assert!(!e.is_retriable());
        assert_eq!(e.http_status(), 422);
    }
}
