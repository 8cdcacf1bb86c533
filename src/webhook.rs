//! Broker webhook ingestion.
//!
//! Broker callbacks are the authoritative source of order state. Each event
//! is HMAC-verified, then merged into the ledger under the CAS precedence
//! rule so replays and reordering can never roll state backwards. Fill
//! events additionally update the position row and append an idempotent fill
//! descriptor to the order metadata, all in the same transaction.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::error::GatewayError;
use crate::ledger::{FillEvent, Ledger, StatusUpdate};
use crate::models::{OrderStatus, SourcePriority};

type HmacSha256 = Hmac<Sha256>;

/// Decimal fields may arrive as JSON numbers or strings.
fn decimal_opt<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => Decimal::from_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(serde_json::Value::Number(n)) => Decimal::from_str(&n.to_string())
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected decimal, got {other}"
        ))),
    }
}

/// Order payload inside the webhook envelope. Only the fields the core
/// reads; everything else the broker sends is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookOrder {
    pub client_order_id: String,
    pub status: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, deserialize_with = "decimal_opt")]
    pub filled_qty: Option<Decimal>,
    #[serde(default, deserialize_with = "decimal_opt")]
    pub filled_avg_price: Option<Decimal>,
    #[serde(default)]
    pub filled_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub order: WebhookOrder,
    #[serde(default, deserialize_with = "decimal_opt")]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub fill_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub client_order_id: String,
    pub status: OrderStatus,
    pub status_applied: bool,
    pub fill_applied: bool,
}

pub struct WebhookIngestor {
    ledger: Arc<dyn Ledger>,
    coordinator: Arc<dyn Coordinator>,
    secret: String,
}

impl WebhookIngestor {
    /// An empty secret disables signature verification (tests only).
    pub fn new(ledger: Arc<dyn Ledger>, coordinator: Arc<dyn Coordinator>, secret: String) -> Self {
        WebhookIngestor {
            ledger,
            coordinator,
            secret,
        }
    }

    /// Verify, parse, and merge one webhook callback.
    pub async fn ingest(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestOutcome, GatewayError> {
        self.verify_signature(body, signature)?;

        let envelope: WebhookEnvelope = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Validation(format!("malformed webhook body: {e}")))?;
        self.apply(&envelope).await
    }

    /// Constant-time HMAC-SHA256 check over the raw request body.
    pub fn verify_signature(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<(), GatewayError> {
        if self.secret.is_empty() {
            warn!("webhook signature verification disabled (empty secret)");
            return Ok(());
        }
        let signature = signature
            .ok_or_else(|| GatewayError::Forbidden("missing webhook signature".into()))?;
        let expected = hex::decode(signature.trim())
            .map_err(|_| GatewayError::Forbidden("malformed webhook signature".into()))?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| GatewayError::Internal(format!("hmac key setup: {e}")))?;
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| GatewayError::Forbidden("invalid webhook signature".into()))
    }

    async fn apply(&self, envelope: &WebhookEnvelope) -> Result<IngestOutcome, GatewayError> {
        let status = OrderStatus::parse(&envelope.order.status).ok_or_else(|| {
            GatewayError::Validation(format!(
                "unknown order status {:?}",
                envelope.order.status
            ))
        })?;

        // First parseable of broker updated_at, envelope timestamp; else now.
        let broker_updated_at = parse_timestamp(&[
            envelope.order.updated_at.as_deref(),
            envelope.timestamp.as_deref(),
        ])
        .unwrap_or_else(Utc::now);
        let filled_at = parse_timestamp(&[
            envelope.order.filled_at.as_deref(),
            envelope.order.updated_at.as_deref(),
            envelope.timestamp.as_deref(),
        ]);

        let update = StatusUpdate {
            client_order_id: envelope.order.client_order_id.clone(),
            status,
            broker_updated_at,
            source_priority: SourcePriority::Webhook,
            filled_qty: envelope.order.filled_qty,
            filled_avg_price: envelope.order.filled_avg_price,
            filled_at,
            broker_order_id: envelope.order.id.clone(),
        };

        let fill = self.fill_event_for(envelope, status);
        let outcome = self
            .ledger
            .apply_broker_update(&update, fill.as_ref())
            .await?;

        if outcome.status_applied || outcome.fill_applied {
            // Derived caches for the trading date are stale now. Best effort:
            // a failed invalidation is logged, never fatal.
            let date = filled_at.unwrap_or(broker_updated_at).date_naive();
            if let Err(e) = self.coordinator.invalidate_performance_cache(date).await {
                warn!(%date, error = %e, "performance cache invalidation failed");
            }
            info!(
                client_order_id = %envelope.order.client_order_id,
                event = %envelope.event,
                status = status.as_str(),
                status_applied = outcome.status_applied,
                fill_applied = outcome.fill_applied,
                "webhook merged"
            );
        } else {
            debug!(
                client_order_id = %envelope.order.client_order_id,
                event = %envelope.event,
                "webhook did not dominate stored state; no-op"
            );
        }

        Ok(IngestOutcome {
            client_order_id: envelope.order.client_order_id.clone(),
            status: outcome.order.status,
            status_applied: outcome.status_applied,
            fill_applied: outcome.fill_applied,
        })
    }

    /// A fill event is anything that advances executed quantity. The broker
    /// tag keys the idempotent metadata append; when absent, the cumulative
    /// quantity stands in so replays still dedupe.
    fn fill_event_for(
        &self,
        envelope: &WebhookEnvelope,
        status: OrderStatus,
    ) -> Option<FillEvent> {
        let is_fill = matches!(
            status,
            OrderStatus::Filled | OrderStatus::PartiallyFilled
        ) || envelope.event.contains("fill");
        if !is_fill {
            return None;
        }
        let fill_id = envelope.fill_id.clone().unwrap_or_else(|| {
            format!(
                "cum:{}",
                envelope
                    .order
                    .filled_qty
                    .map(|q| q.to_string())
                    .unwrap_or_else(|| "0".into())
            )
        });
        Some(FillEvent {
            fill_id,
            price: envelope.price.or(envelope.order.filled_avg_price),
        })
    }
}

fn parse_timestamp(candidates: &[Option<&str>]) -> Option<DateTime<Utc>> {
    for candidate in candidates.iter().flatten() {
        if candidate.is_empty() {
            continue;
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(candidate) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    None
}

/// Sign a body the way the broker does; shared by tests and local tooling.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryCoordinator;
    use crate::ledger::SqliteLedger;
    use crate::models::{
        ExecutionStyle, Order, OrderType, Side, TimeInForce,
    };
    use rust_decimal_macros::dec;

    fn ingestor(secret: &str) -> (WebhookIngestor, Arc<SqliteLedger>, Arc<MemoryCoordinator>) {
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let coordinator = Arc::new(MemoryCoordinator::new());
        (
            WebhookIngestor::new(ledger.clone(), coordinator.clone(), secret.to_string()),
            ledger,
            coordinator,
        )
    }

    async fn seed_order(ledger: &SqliteLedger, client_order_id: &str) {
        let now = Utc::now();
        ledger
            .create_order(&Order {
                client_order_id: client_order_id.to_string(),
                strategy_id: "alpha_baseline".to_string(),
                symbol: "AAPL".to_string(),
                side: Side::Buy,
                qty: dec!(10),
                order_type: OrderType::Market,
                limit_price: None,
                stop_price: None,
                time_in_force: TimeInForce::Day,
                execution_style: ExecutionStyle::Instant,
                status: OrderStatus::PendingNew,
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
            })
            .await
            .unwrap();
    }

    fn fill_body(client_order_id: &str, filled_qty: &str, ts: &str) -> Vec<u8> {
        serde_json::json!({
            "event": "fill",
            "timestamp": ts,
            "fill_id": format!("fill-{filled_qty}"),
            "price": "150.25",
            "order": {
                "client_order_id": client_order_id,
                "id": "brk-1",
                "status": "filled",
                "symbol": "AAPL",
                "side": "buy",
                "filled_qty": filled_qty,
                "filled_avg_price": "150.25",
                "updated_at": ts,
            }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn signature_required_and_verified() {
        let (ingestor, ledger, _) = ingestor("topsecret");
        let id = "a".repeat(24);
        seed_order(&ledger, &id).await;
        let body = fill_body(&id, "10", "2024-10-17T16:30:00Z");

        // Missing and wrong signatures both refuse.
        assert!(matches!(
            ingestor.ingest(&body, None).await,
            Err(GatewayError::Forbidden(_))
        ));
        assert!(matches!(
            ingestor.ingest(&body, Some("deadbeef")).await,
            Err(GatewayError::Forbidden(_))
        ));

        let sig = sign_body("topsecret", &body);
        let outcome = ingestor.ingest(&body, Some(&sig)).await.unwrap();
        assert!(outcome.status_applied);
        assert!(outcome.fill_applied);
    }

    #[tokio::test]
    async fn empty_secret_disables_verification() {
        let (ingestor, ledger, _) = ingestor("");
        let id = "b".repeat(24);
        seed_order(&ledger, &id).await;
        let body = fill_body(&id, "10", "2024-10-17T16:30:00Z");
        assert!(ingestor.ingest(&body, None).await.is_ok());
    }

    #[tokio::test]
    async fn replayed_fill_leaves_state_unchanged() {
        let (ingestor, ledger, _) = ingestor("");
        let id = "c".repeat(24);
        seed_order(&ledger, &id).await;
        let body = fill_body(&id, "10", "2024-10-17T16:30:00Z");

        let first = ingestor.ingest(&body, None).await.unwrap();
        assert!(first.fill_applied);

        let second = ingestor.ingest(&body, None).await.unwrap();
        assert!(!second.fill_applied);
        assert!(!second.status_applied);

        let position = ledger.get_position_by_symbol("AAPL").await.unwrap().unwrap();
        assert_eq!(position.qty, dec!(10));
    }

    #[tokio::test]
    async fn late_stale_event_does_not_roll_back_fill() {
        let (ingestor, ledger, _) = ingestor("");
        let id = "d".repeat(24);
        seed_order(&ledger, &id).await;

        let fill = fill_body(&id, "10", "2024-10-17T16:30:05Z");
        ingestor.ingest(&fill, None).await.unwrap();

        // An `accepted` event stamped five seconds earlier arrives late.
        let stale = serde_json::json!({
            "event": "order_update",
            "timestamp": "2024-10-17T16:30:00Z",
            "order": {
                "client_order_id": id,
                "status": "accepted",
                "updated_at": "2024-10-17T16:30:00Z",
            }
        })
        .to_string()
        .into_bytes();
        let outcome = ingestor.ingest(&stale, None).await.unwrap();
        assert!(!outcome.status_applied);
        assert_eq!(outcome.status, OrderStatus::Filled);

        let position = ledger.get_position_by_symbol("AAPL").await.unwrap().unwrap();
        assert_eq!(position.realized_pl, dec!(0));
        assert_eq!(position.qty, dec!(10));
    }

    #[tokio::test]
    async fn cache_invalidated_for_the_fill_date() {
        let (ingestor, ledger, coordinator) = ingestor("");
        let id = "e".repeat(24);
        seed_order(&ledger, &id).await;
        let body = fill_body(&id, "10", "2024-10-17T16:30:00Z");
        ingestor.ingest(&body, None).await.unwrap();

        let dates = coordinator.invalidated_dates();
        assert_eq!(dates.len(), 1);
        assert_eq!(dates[0].to_string(), "2024-10-17");
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let (ingestor, _, _) = ingestor("");
        let body = fill_body(&"f".repeat(24), "10", "2024-10-17T16:30:00Z");
        assert!(matches!(
            ingestor.ingest(&body, None).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_body_is_a_validation_error() {
        let (ingestor, _, _) = ingestor("");
        assert!(matches!(
            ingestor.ingest(b"not json", None).await,
            Err(GatewayError::Validation(_))
        ));
    }
}
