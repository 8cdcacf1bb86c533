//! Gateway configuration.
//!
//! Typed defaults with environment overrides. `from_env()` reads the same
//! variable-per-field layout the deployment tooling exports; everything has a
//! safe default so tests can construct configs directly.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use crate::fat_finger::FatFingerThresholds;

/// Bounds enforced when a caller requests a sliced (TWAP) execution.
#[derive(Debug, Clone)]
pub struct SlicerBounds {
    pub min_slices: u32,
    pub min_slice_qty: u32,
    pub min_duration_minutes: u32,
    pub max_duration_minutes: u32,
    pub min_interval_seconds: u32,
    pub max_interval_seconds: u32,
}

impl Default for SlicerBounds {
    fn default() -> Self {
        SlicerBounds {
            min_slices: 2,
            min_slice_qty: 1,
            min_duration_minutes: 1,
            max_duration_minutes: 390, // one US equities session
            min_interval_seconds: 10,
            max_interval_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// When true, orders are persisted but never dispatched to the broker and
    /// no position is reserved.
    pub dry_run: bool,
    /// Default strategy tag for incoming orders.
    pub strategy_id: String,
    /// HMAC key for webhook verification. Empty disables verification
    /// (tests only).
    pub webhook_secret: String,
    /// Freshness limit for cached prices used by fat-finger notional checks.
    pub max_price_age_seconds: u64,
    pub fat_finger_defaults: FatFingerThresholds,
    pub fat_finger_overrides: HashMap<String, FatFingerThresholds>,
    pub slicer: SlicerBounds,
    /// Per-symbol absolute position cap used by the reservation check.
    pub max_position_qty: Decimal,
    pub reservation_ttl_secs: u64,
    pub modification_lock_timeout_ms: u64,
    pub reconciliation_timeout_secs: u64,
    /// How stale a pending modification must be before the background
    /// reconciler inspects it.
    pub modification_stale_after_secs: u64,
    /// Bounded retries for transient broker errors on scheduled slices.
    pub slice_max_retries: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            dry_run: true, // Safe default
            strategy_id: "alpha_baseline".to_string(),
            webhook_secret: String::new(),
            max_price_age_seconds: 300,
            fat_finger_defaults: FatFingerThresholds {
                max_notional: Some(Decimal::from(250_000)),
                max_qty: Some(10_000),
                max_adv_pct: Some(Decimal::new(5, 2)), // 5%
            },
            fat_finger_overrides: HashMap::new(),
            slicer: SlicerBounds::default(),
            max_position_qty: Decimal::from(10_000),
            reservation_ttl_secs: 120,
            modification_lock_timeout_ms: 2_000,
            reconciliation_timeout_secs: 300,
            modification_stale_after_secs: 300,
            slice_max_retries: 3,
        }
    }
}

fn env_parse<T: FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_flag(var: &str, default: bool) -> bool {
    env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl GatewayConfig {
    /// Load config from the environment on top of the defaults.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = GatewayConfig::default();

        let fat_finger_defaults = FatFingerThresholds {
            max_notional: env_parse::<Decimal>("FAT_FINGER_MAX_NOTIONAL")
                .map(Some)
                .unwrap_or(defaults.fat_finger_defaults.max_notional),
            max_qty: env_parse::<u32>("FAT_FINGER_MAX_QTY")
                .map(Some)
                .unwrap_or(defaults.fat_finger_defaults.max_qty),
            max_adv_pct: env_parse::<Decimal>("FAT_FINGER_MAX_ADV_PCT")
                .map(Some)
                .unwrap_or(defaults.fat_finger_defaults.max_adv_pct),
        };

        let slicer = SlicerBounds {
            min_slices: env_parse("TWAP_MIN_SLICES").unwrap_or(defaults.slicer.min_slices),
            min_slice_qty: env_parse("TWAP_MIN_SLICE_QTY").unwrap_or(defaults.slicer.min_slice_qty),
            min_duration_minutes: env_parse("TWAP_MIN_DURATION_MINUTES")
                .unwrap_or(defaults.slicer.min_duration_minutes),
            max_duration_minutes: env_parse("TWAP_MAX_DURATION_MINUTES")
                .unwrap_or(defaults.slicer.max_duration_minutes),
            min_interval_seconds: env_parse("TWAP_MIN_INTERVAL_SECONDS")
                .unwrap_or(defaults.slicer.min_interval_seconds),
            max_interval_seconds: env_parse("TWAP_MAX_INTERVAL_SECONDS")
                .unwrap_or(defaults.slicer.max_interval_seconds),
        };

        GatewayConfig {
            dry_run: env_flag("DRY_RUN", defaults.dry_run),
            strategy_id: env::var("STRATEGY_ID").unwrap_or(defaults.strategy_id),
            webhook_secret: env::var("WEBHOOK_SECRET").unwrap_or(defaults.webhook_secret),
            max_price_age_seconds: env_parse("MAX_PRICE_AGE_SECONDS")
                .unwrap_or(defaults.max_price_age_seconds),
            fat_finger_defaults,
            fat_finger_overrides: HashMap::new(),
            slicer,
            max_position_qty: env_parse("MAX_POSITION_QTY").unwrap_or(defaults.max_position_qty),
            reservation_ttl_secs: env_parse("RESERVATION_TTL_SECS")
                .unwrap_or(defaults.reservation_ttl_secs),
            modification_lock_timeout_ms: env_parse("MODIFICATION_LOCK_TIMEOUT_MS")
                .unwrap_or(defaults.modification_lock_timeout_ms),
            reconciliation_timeout_secs: env_parse("RECONCILIATION_TIMEOUT_SECS")
                .unwrap_or(defaults.reconciliation_timeout_secs),
            modification_stale_after_secs: env_parse("MODIFICATION_STALE_AFTER_SECS")
                .unwrap_or(defaults.modification_stale_after_secs),
            slice_max_retries: env_parse("SLICE_MAX_RETRIES")
                .unwrap_or(defaults.slice_max_retries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_fail_safe() {
        let cfg = GatewayConfig::default();
        assert!(cfg.dry_run);
        assert!(cfg.webhook_secret.is_empty());
        assert!(cfg.fat_finger_defaults.max_qty.is_some());
        assert!(cfg.slicer.min_interval_seconds >= 1);
    }
}
