//! Market data used by pre-trade checks.
//!
//! A freshness-bounded price cache fed by an external feed, and the liquidity
//! (ADV) lookup seam for the fat-finger `adv_pct` check.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Average-daily-volume lookup. Backed by an external liquidity service in
/// production.
#[async_trait]
pub trait LiquidityProvider: Send + Sync {
    /// 20-day ADV in shares, or `None` when unknown.
    async fn adv(&self, symbol: &str) -> Option<u64>;
}

/// Fixed ADV table, for tests and offline runs.
#[derive(Debug, Default)]
pub struct StaticLiquidity {
    adv_by_symbol: HashMap<String, u64>,
}

impl StaticLiquidity {
    pub fn new(adv_by_symbol: HashMap<String, u64>) -> Self {
        StaticLiquidity { adv_by_symbol }
    }
}

#[async_trait]
impl LiquidityProvider for StaticLiquidity {
    async fn adv(&self, symbol: &str) -> Option<u64> {
        self.adv_by_symbol.get(&symbol.to_ascii_uppercase()).copied()
    }
}

/// Last-seen mid price per symbol with its observation time.
///
/// Consumers pass a maximum acceptable age; stale entries read as absent so
/// the fat-finger notional check fails closed instead of pricing off old
/// data.
#[derive(Default)]
pub struct PriceCache {
    prices: RwLock<HashMap<String, (Decimal, DateTime<Utc>)>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, symbol: &str, price: Decimal, observed_at: DateTime<Utc>) {
        self.prices
            .write()
            .insert(symbol.to_ascii_uppercase(), (price, observed_at));
    }

    /// The cached price if it is younger than `max_age_seconds`.
    pub fn latest_price(&self, symbol: &str, max_age_seconds: u64) -> Option<Decimal> {
        let prices = self.prices.read();
        let (price, observed_at) = prices.get(&symbol.to_ascii_uppercase())?;
        let age = Utc::now().signed_duration_since(*observed_at);
        if age <= Duration::seconds(max_age_seconds as i64) && age >= Duration::zero() {
            Some(*price)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fresh_price_is_returned() {
        let cache = PriceCache::new();
        cache.record("aapl", dec!(150.25), Utc::now());
        assert_eq!(cache.latest_price("AAPL", 300), Some(dec!(150.25)));
    }

    #[test]
    fn stale_price_reads_as_absent() {
        let cache = PriceCache::new();
        cache.record("AAPL", dec!(150.25), Utc::now() - Duration::seconds(600));
        assert_eq!(cache.latest_price("AAPL", 300), None);
    }

    #[test]
    fn unknown_symbol_reads_as_absent() {
        let cache = PriceCache::new();
        assert_eq!(cache.latest_price("MSFT", 300), None);
    }

    #[tokio::test]
    async fn static_liquidity_lookup_is_case_insensitive() {
        let mut adv = HashMap::new();
        adv.insert("AAPL".to_string(), 50_000_000);
        let provider = StaticLiquidity::new(adv);
        assert_eq!(provider.adv("aapl").await, Some(50_000_000));
        assert_eq!(provider.adv("MSFT").await, None);
    }
}
