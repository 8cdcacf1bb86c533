//! TWAP order slicing.
//!
//! Splits a large parent order into smaller child slices spread evenly over
//! time to limit market impact. The slicer is stateless: identical inputs on
//! the same trade date yield byte-identical plans, ids included, which is
//! what makes retries of the slicing endpoint idempotent.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::error::GatewayError;
use crate::ids::order_params_hash;
use crate::models::{OrderStatus, OrderType, Side, SliceDetail, SlicingPlan, TimeInForce};

/// Interval the legacy parent-id form assumed before `interval_seconds`
/// became part of the strategy tag. Kept for duplicate-plan lookups only.
pub const LEGACY_TWAP_INTERVAL_SECONDS: u32 = 60;

#[derive(Debug, Clone)]
pub struct TwapRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: u32,
    pub duration_minutes: u32,
    pub interval_seconds: u32,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    /// Pin the trade date to keep ids stable when retrying across midnight
    /// UTC. Defaults to today.
    pub trade_date: Option<NaiveDate>,
}

/// Stateless TWAP slicer.
pub struct TwapSlicer;

impl TwapSlicer {
    pub fn new() -> Self {
        TwapSlicer
    }

    /// Build the slicing plan with scheduled times starting now.
    pub fn plan(&self, req: &TwapRequest) -> Result<SlicingPlan, GatewayError> {
        self.plan_at(req, Utc::now())
    }

    /// Like [`plan`](Self::plan) with an explicit planning instant.
    pub fn plan_at(
        &self,
        req: &TwapRequest,
        now: DateTime<Utc>,
    ) -> Result<SlicingPlan, GatewayError> {
        if req.qty < 1 {
            return Err(GatewayError::Validation(format!(
                "qty must be at least 1, got {}",
                req.qty
            )));
        }
        if req.duration_minutes < 1 {
            return Err(GatewayError::Validation(format!(
                "duration_minutes must be at least 1, got {}",
                req.duration_minutes
            )));
        }
        if req.interval_seconds < 1 {
            return Err(GatewayError::Validation(format!(
                "interval_seconds must be at least 1, got {}",
                req.interval_seconds
            )));
        }

        if req.order_type.requires_limit_price() && req.limit_price.is_none() {
            return Err(GatewayError::Validation(format!(
                "{} orders require limit_price",
                req.order_type.as_str()
            )));
        }
        if req.order_type.requires_stop_price() && req.stop_price.is_none() {
            return Err(GatewayError::Validation(format!(
                "{} orders require stop_price",
                req.order_type.as_str()
            )));
        }

        let num_slices =
            (u64::from(req.duration_minutes) * 60).div_ceil(u64::from(req.interval_seconds)).max(1)
                as u32;

        if req.qty < num_slices {
            return Err(GatewayError::Validation(format!(
                "qty ({}) must be >= slice count ({}) to avoid zero-quantity slices",
                req.qty, num_slices
            )));
        }

        // Front-loaded remainder: the first `qty % n` slices carry one extra.
        let base_qty = req.qty / num_slices;
        let remainder = req.qty % num_slices;

        let trade_date = req.trade_date.unwrap_or_else(|| now.date_naive());
        let parent_order_id = parent_id(req, trade_date);

        let mut slices = Vec::with_capacity(num_slices as usize);
        for i in 0..num_slices {
            let slice_qty = if i < remainder { base_qty + 1 } else { base_qty };
            let scheduled_time =
                now + chrono::Duration::seconds(i64::from(i) * i64::from(req.interval_seconds));
            let child_order_id = order_params_hash(
                &req.symbol,
                req.side,
                slice_qty,
                req.limit_price,
                req.stop_price,
                req.order_type,
                req.time_in_force,
                &format!("twap_slice_{parent_order_id}_{i}"),
                trade_date,
            );
            slices.push(SliceDetail {
                slice_num: i,
                qty: slice_qty,
                scheduled_time,
                client_order_id: child_order_id,
                status: OrderStatus::PendingNew,
            });
        }

        Ok(SlicingPlan {
            parent_order_id,
            symbol: req.symbol.clone(),
            side: req.side,
            total_qty: req.qty,
            total_slices: num_slices,
            duration_minutes: req.duration_minutes,
            interval_seconds: req.interval_seconds,
            trade_date,
            slices,
        })
    }

    /// Parent id under the pre-interval strategy tag, honored for duplicate
    /// lookups of plans created before the tag carried `interval_seconds`.
    /// Only defined for the historical default interval.
    pub fn legacy_parent_id(&self, req: &TwapRequest, trade_date: NaiveDate) -> Option<String> {
        if req.interval_seconds != LEGACY_TWAP_INTERVAL_SECONDS {
            return None;
        }
        Some(order_params_hash(
            &req.symbol,
            req.side,
            req.qty,
            req.limit_price,
            req.stop_price,
            req.order_type,
            req.time_in_force,
            &format!("twap_parent_{}m", req.duration_minutes),
            trade_date,
        ))
    }
}

impl Default for TwapSlicer {
    fn default() -> Self {
        TwapSlicer::new()
    }
}

fn parent_id(req: &TwapRequest, trade_date: NaiveDate) -> String {
    order_params_hash(
        &req.symbol,
        req.side,
        req.qty,
        req.limit_price,
        req.stop_price,
        req.order_type,
        req.time_in_force,
        &format!(
            "twap_parent_{}m_{}s",
            req.duration_minutes, req.interval_seconds
        ),
        trade_date,
    )
}
