//! Broker client seam.
//!
//! The wire protocol (and its bounded retry policy) lives in the external
//! client; the core only sees these operations and the three error classes.
//! A connection error means the outcome is unknown and the caller must treat
//! the request as retriable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{OrderRequest, OrderStatus, Side, TimeInForce};

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Permanent request defect (bad params). 4xx-equivalent.
    #[error("broker validation error: {0}")]
    Validation(String),

    /// Broker declined the order.
    #[error("broker rejection: {0}")]
    Rejection(String),

    /// Transport failure or timeout after the client exhausted its retries.
    #[error("broker connection error: {0}")]
    Connection(String),
}

/// Acknowledgment returned by a successful submit/replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAck {
    pub id: String,
    pub status: OrderStatus,
    pub client_order_id: String,
}

/// Broker-side view of an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Broker-side open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Signed: positive long, negative short.
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Replacement parameters for an in-place modify.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplaceParams {
    pub qty: Option<u32>,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderQueryStatus {
    Open,
    Closed,
    All,
}

/// Operations the core invokes against the external broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn submit_order(
        &self,
        req: &OrderRequest,
        client_order_id: &str,
    ) -> Result<BrokerAck, BrokerError>;

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;

    async fn replace_order(
        &self,
        broker_order_id: &str,
        params: &ReplaceParams,
        new_client_order_id: &str,
    ) -> Result<BrokerAck, BrokerError>;

    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<BrokerOrder>, BrokerError>;

    async fn get_open_position(&self, symbol: &str)
        -> Result<Option<BrokerPosition>, BrokerError>;

    async fn get_orders(
        &self,
        status: OrderQueryStatus,
        limit: u32,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<BrokerOrder>, BrokerError>;

    async fn get_latest_quotes(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Quote>, BrokerError>;
}
