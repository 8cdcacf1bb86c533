//! Core domain types for the execution gateway.
//!
//! Orders, positions, slicing plans, and modification records. Everything the
//! ledger persists or the broker echoes back lives here; money and quantity
//! fields are `rust_decimal::Decimal` throughout.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }

    /// Signed quantity delta this side contributes to a position.
    pub fn signed(&self, qty: Decimal) -> Decimal {
        match self {
            Side::Buy => qty,
            Side::Sell => -qty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop_limit",
        }
    }

    pub fn parse(s: &str) -> Option<OrderType> {
        match s {
            "market" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            "stop" => Some(OrderType::Stop),
            "stop_limit" => Some(OrderType::StopLimit),
            _ => None,
        }
    }

    pub fn requires_limit_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLimit)
    }

    pub fn requires_stop_price(&self) -> bool {
        matches!(self, OrderType::Stop | OrderType::StopLimit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Day => "day",
            TimeInForce::Gtc => "gtc",
            TimeInForce::Ioc => "ioc",
            TimeInForce::Fok => "fok",
        }
    }

    pub fn parse(s: &str) -> Option<TimeInForce> {
        match s {
            "day" => Some(TimeInForce::Day),
            "gtc" => Some(TimeInForce::Gtc),
            "ioc" => Some(TimeInForce::Ioc),
            "fok" => Some(TimeInForce::Fok),
            _ => None,
        }
    }
}

impl Default for TimeInForce {
    fn default() -> Self {
        TimeInForce::Day
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStyle {
    Instant,
    Twap,
}

impl ExecutionStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStyle::Instant => "instant",
            ExecutionStyle::Twap => "twap",
        }
    }

    pub fn parse(s: &str) -> Option<ExecutionStyle> {
        match s {
            "instant" => Some(ExecutionStyle::Instant),
            "twap" => Some(ExecutionStyle::Twap),
            _ => None,
        }
    }
}

impl Default for ExecutionStyle {
    fn default() -> Self {
        ExecutionStyle::Instant
    }
}

/// Order lifecycle status.
///
/// The rank is a total order over the state machine used by the CAS merge:
/// a broker event may only move an order to a strictly dominating
/// `(rank, broker_updated_at, source_priority)` tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    DryRun,
    PendingNew,
    New,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Replaced,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::DryRun => "dry_run",
            OrderStatus::PendingNew => "pending_new",
            OrderStatus::New => "new",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
            OrderStatus::Replaced => "replaced",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "dry_run" => Some(OrderStatus::DryRun),
            "pending_new" => Some(OrderStatus::PendingNew),
            "new" => Some(OrderStatus::New),
            "accepted" => Some(OrderStatus::Accepted),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "canceled" => Some(OrderStatus::Canceled),
            "rejected" => Some(OrderStatus::Rejected),
            "expired" => Some(OrderStatus::Expired),
            "replaced" => Some(OrderStatus::Replaced),
            _ => None,
        }
    }

    /// Total order over statuses for the CAS merge.
    pub fn rank(&self) -> i64 {
        match self {
            OrderStatus::DryRun => 0,
            OrderStatus::PendingNew => 1,
            OrderStatus::New => 2,
            OrderStatus::Accepted => 3,
            OrderStatus::PartiallyFilled => 4,
            OrderStatus::Filled => 5,
            OrderStatus::Canceled => 6,
            OrderStatus::Rejected => 7,
            OrderStatus::Expired => 8,
            OrderStatus::Replaced => 9,
        }
    }

    /// Terminal statuses never transition further, except the `replaced`
    /// linkage written by the modification engine.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Replaced
        )
    }
}

/// Precedence of the update source when CAS tuples tie on rank and
/// timestamp: webhook beats reconciliation beats manual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePriority {
    Manual,
    Reconciliation,
    Webhook,
}

impl SourcePriority {
    pub fn as_i64(&self) -> i64 {
        match self {
            SourcePriority::Manual => 1,
            SourcePriority::Reconciliation => 2,
            SourcePriority::Webhook => 3,
        }
    }

    pub fn from_i64(v: i64) -> SourcePriority {
        match v {
            3 => SourcePriority::Webhook,
            2 => SourcePriority::Reconciliation,
            _ => SourcePriority::Manual,
        }
    }
}

/// Incoming single-order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: u32,
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub execution_style: ExecutionStyle,
}

impl OrderRequest {
    /// Type/price constraint checks from the data model.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let sym_ok = (1..=5).contains(&self.symbol.len())
            && self
                .symbol
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        if !sym_ok {
            return Err(GatewayError::Validation(format!(
                "symbol must be 1-5 uppercase alphanumeric characters, got {:?}",
                self.symbol
            )));
        }

        if self.qty < 1 {
            return Err(GatewayError::Validation("qty must be at least 1".into()));
        }

        match self.order_type {
            OrderType::Market => {
                if self.limit_price.is_some() || self.stop_price.is_some() {
                    return Err(GatewayError::Validation(
                        "market orders must not carry limit_price or stop_price".into(),
                    ));
                }
            }
            OrderType::Limit => {
                if self.limit_price.is_none() {
                    return Err(GatewayError::Validation(
                        "limit orders require limit_price".into(),
                    ));
                }
                if self.stop_price.is_some() {
                    return Err(GatewayError::Validation(
                        "limit orders must not carry stop_price".into(),
                    ));
                }
            }
            OrderType::Stop => {
                if self.stop_price.is_none() {
                    return Err(GatewayError::Validation(
                        "stop orders require stop_price".into(),
                    ));
                }
                if self.limit_price.is_some() {
                    return Err(GatewayError::Validation(
                        "stop orders must not carry limit_price".into(),
                    ));
                }
            }
            OrderType::StopLimit => {
                if self.limit_price.is_none() || self.stop_price.is_none() {
                    return Err(GatewayError::Validation(
                        "stop_limit orders require both limit_price and stop_price".into(),
                    ));
                }
            }
        }

        for (name, price) in [("limit_price", self.limit_price), ("stop_price", self.stop_price)] {
            if let Some(p) = price {
                if p <= Decimal::ZERO {
                    return Err(GatewayError::Validation(format!("{name} must be positive")));
                }
            }
        }

        Ok(())
    }
}

/// Fully persisted order row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: Side,
    /// Integer on submission; the broker may report fractional fills.
    pub qty: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub execution_style: ExecutionStyle,
    pub status: OrderStatus,
    pub broker_order_id: Option<String>,
    pub retry_count: i64,
    pub parent_order_id: Option<String>,
    pub slice_num: Option<u32>,
    pub total_slices: Option<u32>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub broker_updated_at: Option<DateTime<Utc>>,
    pub source_priority: SourcePriority,
    /// Append-only JSON container: recorded fills and replacement linkage.
    pub metadata: serde_json::Value,
}

impl Order {
    /// CAS precedence tuple currently stored for this order.
    pub fn cas_tuple(&self) -> (i64, DateTime<Utc>, i64) {
        (
            self.status.rank(),
            self.broker_updated_at.unwrap_or(self.created_at),
            self.source_priority.as_i64(),
        )
    }
}

/// Response returned to the submitting caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub client_order_id: String,
    pub status: OrderStatus,
    pub broker_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub message: String,
}

impl OrderResponse {
    pub fn from_order(order: &Order, message: impl Into<String>) -> Self {
        OrderResponse {
            client_order_id: order.client_order_id.clone(),
            status: order.status,
            broker_order_id: order.broker_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            order_type: order.order_type,
            limit_price: order.limit_price,
            created_at: order.created_at,
            message: message.into(),
        }
    }
}

/// Net position per symbol. Positive qty is long, negative is short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pl: Decimal,
    pub updated_at: DateTime<Utc>,
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn flat(symbol: &str, now: DateTime<Utc>) -> Self {
        Position {
            symbol: symbol.to_string(),
            qty: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pl: Decimal::ZERO,
            updated_at: now,
            last_trade_at: None,
        }
    }
}

/// One scheduled child of a TWAP parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceDetail {
    pub slice_num: u32,
    pub qty: u32,
    pub scheduled_time: DateTime<Utc>,
    pub client_order_id: String,
    pub status: OrderStatus,
}

/// Immutable decomposition of a parent order into timed child slices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlicingPlan {
    pub parent_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub total_qty: u32,
    pub total_slices: u32,
    pub duration_minutes: u32,
    pub interval_seconds: u32,
    pub trade_date: NaiveDate,
    pub slices: Vec<SliceDetail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationStatus {
    Pending,
    Completed,
    Failed,
    SubmittedUnconfirmed,
}

impl ModificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModificationStatus::Pending => "pending",
            ModificationStatus::Completed => "completed",
            ModificationStatus::Failed => "failed",
            ModificationStatus::SubmittedUnconfirmed => "submitted_unconfirmed",
        }
    }

    pub fn parse(s: &str) -> Option<ModificationStatus> {
        match s {
            "pending" => Some(ModificationStatus::Pending),
            "completed" => Some(ModificationStatus::Completed),
            "failed" => Some(ModificationStatus::Failed),
            "submitted_unconfirmed" => Some(ModificationStatus::SubmittedUnconfirmed),
            _ => None,
        }
    }
}

/// Record of an in-place order replacement attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub modification_id: String,
    pub original_client_order_id: String,
    pub new_client_order_id: String,
    pub idempotency_key: String,
    /// Map of field name to `[old, new]`.
    pub changes: serde_json::Value,
    pub status: ModificationStatus,
    pub error_message: Option<String>,
    pub seq: i64,
    pub modified_at: DateTime<Utc>,
}

/// Requested field changes for an order modification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyRequest {
    #[serde(default)]
    pub qty: Option<u32>,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub time_in_force: Option<TimeInForce>,
}

impl ModifyRequest {
    pub fn is_empty(&self) -> bool {
        self.qty.is_none()
            && self.limit_price.is_none()
            && self.stop_price.is_none()
            && self.time_in_force.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyResponse {
    pub modification_id: String,
    pub original_client_order_id: String,
    pub new_client_order_id: String,
    pub status: ModificationStatus,
    pub message: String,
}

/// Caller identity as handed over by the (external) transport layer.
/// Opaque to the core apart from strategy scoping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: String,
    /// When set, the caller may only see orders for this strategy.
    pub strategy_scope: Option<String>,
}

impl AuthContext {
    pub fn service(user_id: &str) -> Self {
        AuthContext {
            user_id: user_id.to_string(),
            strategy_scope: None,
        }
    }

    pub fn can_access_strategy(&self, strategy_id: &str) -> bool {
        match &self.strategy_scope {
            Some(scope) => scope == strategy_id,
            None => true,
        }
    }
}
