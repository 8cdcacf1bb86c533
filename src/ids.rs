//! Deterministic client order id generation.
//!
//! Identical order parameters on the same trading date always hash to the
//! same 24-hex id, which is what makes submission retries and TWAP replays
//! idempotent end to end. Prices are quantized to two decimals (half-up)
//! before hashing so `150.0` and `150.00` agree.

use chrono::{NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sha2::{Digest, Sha256};

use crate::models::{OrderRequest, OrderType, Side, TimeInForce};

/// Bytes of the SHA-256 digest kept for the id (24 hex chars).
const ID_BYTES: usize = 12;

fn quantize_price(price: Option<Decimal>) -> String {
    match price {
        None => "null".to_string(),
        Some(p) => {
            let q = p.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
            format!("{q:.2}")
        }
    }
}

fn hash_canonical(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(&digest[..ID_BYTES])
}

/// Stable hash over the semantic order parameters.
///
/// Canonical form:
/// `symbol|side|qty|limit_price|stop_price|order_type|time_in_force|strategy_id|date`
#[allow(clippy::too_many_arguments)]
pub fn order_params_hash(
    symbol: &str,
    side: Side,
    qty: u32,
    limit_price: Option<Decimal>,
    stop_price: Option<Decimal>,
    order_type: OrderType,
    time_in_force: TimeInForce,
    strategy_id: &str,
    order_date: NaiveDate,
) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}",
        symbol.to_ascii_uppercase(),
        side.as_str(),
        qty,
        quantize_price(limit_price),
        quantize_price(stop_price),
        order_type.as_str(),
        time_in_force.as_str(),
        strategy_id,
        order_date.format("%Y-%m-%d"),
    );
    hash_canonical(&canonical)
}

/// Deterministic id for a submitted order request.
///
/// `as_of_date` pins the trading date; callers retrying across midnight UTC
/// pass the original date to keep the id stable.
pub fn generate_client_order_id(
    order: &OrderRequest,
    strategy_id: &str,
    as_of_date: Option<NaiveDate>,
) -> String {
    let date = as_of_date.unwrap_or_else(|| Utc::now().date_naive());
    order_params_hash(
        &order.symbol,
        order.side,
        order.qty,
        order.limit_price,
        order.stop_price,
        order.order_type,
        order.time_in_force,
        strategy_id,
        date,
    )
}

/// Parallel recipe for operator-initiated flows (flatten/close). These ids
/// never pass through order admission.
pub fn manual_operation_id(
    action: &str,
    symbol: &str,
    side: Side,
    qty: u32,
    user: &str,
    as_of_date: Option<NaiveDate>,
) -> String {
    let date = as_of_date.unwrap_or_else(|| Utc::now().date_naive());
    let canonical = format!(
        "manual|{}|{}|{}|{}|{}|{}",
        action,
        symbol.to_ascii_uppercase(),
        side.as_str(),
        qty,
        user,
        date.format("%Y-%m-%d"),
    );
    hash_canonical(&canonical)
}

/// Deterministic id for the order replacing `original_client_order_id`.
/// Retries with the same idempotency key on the same date reuse the id, so
/// the broker sees exactly one replacement.
pub fn replacement_order_id(
    original_client_order_id: &str,
    idempotency_key: &str,
    as_of_date: Option<NaiveDate>,
) -> String {
    let date = as_of_date.unwrap_or_else(|| Utc::now().date_naive());
    let canonical = format!(
        "replace|{}|{}|{}",
        original_client_order_id,
        idempotency_key,
        date.format("%Y-%m-%d"),
    );
    hash_canonical(&canonical)
}

/// True iff `id` is a well-formed 24-char lowercase hex client order id.
pub fn validate_client_order_id(id: &str) -> bool {
    id.len() == ID_BYTES * 2 && id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionStyle;
    use rust_decimal_macros::dec;

    fn request(symbol: &str, side: Side, qty: u32) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_string(),
            side,
            qty,
            order_type: OrderType::Market,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day,
            execution_style: ExecutionStyle::Instant,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn same_params_same_date_same_id() {
        let a = generate_client_order_id(&request("AAPL", Side::Buy, 10), "alpha_baseline", Some(day(2024, 10, 17)));
        let b = generate_client_order_id(&request("AAPL", Side::Buy, 10), "alpha_baseline", Some(day(2024, 10, 17)));
        assert_eq!(a, b);
    }

    #[test]
    fn every_semantic_field_perturbs_the_id() {
        let date = day(2024, 10, 17);
        let base = generate_client_order_id(&request("AAPL", Side::Buy, 10), "alpha_baseline", Some(date));

        let by_symbol = generate_client_order_id(&request("MSFT", Side::Buy, 10), "alpha_baseline", Some(date));
        let by_side = generate_client_order_id(&request("AAPL", Side::Sell, 10), "alpha_baseline", Some(date));
        let by_qty = generate_client_order_id(&request("AAPL", Side::Buy, 11), "alpha_baseline", Some(date));
        let by_strategy = generate_client_order_id(&request("AAPL", Side::Buy, 10), "alpha_v2", Some(date));
        let by_date = generate_client_order_id(&request("AAPL", Side::Buy, 10), "alpha_baseline", Some(day(2024, 10, 18)));

        for other in [by_symbol, by_side, by_qty, by_strategy, by_date] {
            assert_ne!(base, other);
        }
    }

    #[test]
    fn limit_price_changes_the_id() {
        let date = day(2024, 10, 17);
        let mut req = request("AAPL", Side::Buy, 10);
        req.order_type = OrderType::Limit;
        req.limit_price = Some(dec!(150.00));
        let a = generate_client_order_id(&req, "alpha_baseline", Some(date));

        req.limit_price = Some(dec!(151.00));
        let b = generate_client_order_id(&req, "alpha_baseline", Some(date));
        assert_ne!(a, b);
    }

    #[test]
    fn equivalent_price_representations_agree() {
        let date = day(2024, 10, 17);
        let mut req = request("AAPL", Side::Buy, 10);
        req.order_type = OrderType::Limit;

        req.limit_price = Some(dec!(150.0));
        let a = generate_client_order_id(&req, "alpha_baseline", Some(date));
        req.limit_price = Some(dec!(150.00));
        let b = generate_client_order_id(&req, "alpha_baseline", Some(date));
        req.limit_price = Some(dec!(150));
        let c = generate_client_order_id(&req, "alpha_baseline", Some(date));

        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn quantization_never_emits_scientific_notation() {
        for price in [dec!(0.00000001), dec!(1e3), dec!(123456789.999)] {
            let s = quantize_price(Some(price));
            assert!(!s.contains('e') && !s.contains('E'), "got {s}");
            assert!(s.contains('.'));
        }
    }

    #[test]
    fn half_up_rounding() {
        assert_eq!(quantize_price(Some(dec!(1.005))), "1.01");
        assert_eq!(quantize_price(Some(dec!(1.004))), "1.00");
    }

    #[test]
    fn id_format_is_24_lowercase_hex() {
        let id = generate_client_order_id(&request("AAPL", Side::Buy, 10), "alpha_baseline", None);
        assert_eq!(id.len(), 24);
        assert!(validate_client_order_id(&id));
        assert!(!validate_client_order_id("XYZ"));
        assert!(!validate_client_order_id(&id.to_uppercase()));
    }

    #[test]
    fn manual_operation_ids_are_scoped_by_user_and_action() {
        let date = Some(day(2024, 10, 17));
        let a = manual_operation_id("flatten", "AAPL", Side::Sell, 100, "ops_alice", date);
        let b = manual_operation_id("flatten", "AAPL", Side::Sell, 100, "ops_bob", date);
        let c = manual_operation_id("close", "AAPL", Side::Sell, 100, "ops_alice", date);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(validate_client_order_id(&a));
    }
}
