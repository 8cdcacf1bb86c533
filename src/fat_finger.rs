//! Fat-finger order validation.
//!
//! Threshold-based checks that catch suspiciously large orders (typo
//! quantities, runaway notional, outsized liquidity footprint) before they
//! reach the broker. Side-effect free so it can be shared by admission, the
//! slice scheduler, and tests.

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configured limits. `None` disables the corresponding check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FatFingerThresholds {
    pub max_notional: Option<Decimal>,
    pub max_qty: Option<u32>,
    /// Maximum order size as a fraction of 20-day ADV (0.01 = 1%).
    pub max_adv_pct: Option<Decimal>,
}

impl FatFingerThresholds {
    /// Override wins when set; base fills the gaps.
    fn merged_over(&self, base: &FatFingerThresholds) -> FatFingerThresholds {
        FatFingerThresholds {
            max_notional: self.max_notional.or(base.max_notional),
            max_qty: self.max_qty.or(base.max_qty),
            max_adv_pct: self.max_adv_pct.or(base.max_adv_pct),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachType {
    Notional,
    Qty,
    AdvPct,
    DataUnavailable,
}

impl BreachType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachType::Notional => "notional",
            BreachType::Qty => "qty",
            BreachType::AdvPct => "adv_pct",
            BreachType::DataUnavailable => "data_unavailable",
        }
    }
}

/// A single threshold breach with the limit and observed value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FatFingerBreach {
    pub breach_type: BreachType,
    pub limit: Option<Decimal>,
    pub actual: Option<Decimal>,
    pub metadata: serde_json::Value,
}

/// Validation outcome. `breached` orders never proceed to reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FatFingerResult {
    pub breached: bool,
    pub breaches: Vec<FatFingerBreach>,
    pub thresholds: FatFingerThresholds,
    pub notional: Option<Decimal>,
    pub adv: Option<u64>,
    pub adv_pct: Option<Decimal>,
    pub price: Option<Decimal>,
}

impl FatFingerResult {
    /// Comma-joined breach types, for log lines and error messages.
    pub fn breach_summary(&self) -> String {
        self.breaches
            .iter()
            .map(|b| b.breach_type.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Thread-safe policy engine with per-symbol overrides.
pub struct FatFingerValidator {
    inner: RwLock<ValidatorState>,
}

struct ValidatorState {
    defaults: FatFingerThresholds,
    symbol_overrides: HashMap<String, FatFingerThresholds>,
}

impl FatFingerValidator {
    pub fn new(
        defaults: FatFingerThresholds,
        symbol_overrides: HashMap<String, FatFingerThresholds>,
    ) -> Self {
        let symbol_overrides = symbol_overrides
            .into_iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v))
            .collect();
        FatFingerValidator {
            inner: RwLock::new(ValidatorState {
                defaults,
                symbol_overrides,
            }),
        }
    }

    pub fn default_thresholds(&self) -> FatFingerThresholds {
        self.inner.read().defaults.clone()
    }

    pub fn symbol_overrides(&self) -> HashMap<String, FatFingerThresholds> {
        self.inner.read().symbol_overrides.clone()
    }

    pub fn update_defaults(&self, new_defaults: FatFingerThresholds) {
        self.inner.write().defaults = new_defaults;
    }

    /// Patch per-symbol overrides; a `None` value removes the override.
    pub fn update_symbol_overrides(
        &self,
        overrides: HashMap<String, Option<FatFingerThresholds>>,
    ) {
        let mut state = self.inner.write();
        for (symbol, patch) in overrides {
            let key = symbol.to_ascii_uppercase();
            match patch {
                None => {
                    state.symbol_overrides.remove(&key);
                }
                Some(patch) => {
                    let existing = state.symbol_overrides.remove(&key).unwrap_or_default();
                    state.symbol_overrides.insert(key, patch.merged_over(&existing));
                }
            }
        }
    }

    /// Merged thresholds for the symbol (override wins per field).
    pub fn effective_thresholds(&self, symbol: &str) -> FatFingerThresholds {
        let state = self.inner.read();
        match state.symbol_overrides.get(&symbol.to_ascii_uppercase()) {
            Some(ov) => ov.merged_over(&state.defaults),
            None => state.defaults.clone(),
        }
    }

    /// Validate one order against the effective thresholds.
    ///
    /// `price` is the notional reference (limit, stop, or fresh market
    /// price); `adv` is the 20-day average daily volume. Missing data for an
    /// enabled check is itself a breach (fail closed).
    pub fn validate(
        &self,
        symbol: &str,
        qty: u32,
        price: Option<Decimal>,
        adv: Option<u64>,
    ) -> FatFingerResult {
        let effective = self.effective_thresholds(symbol);
        let mut breaches = Vec::new();
        let mut missing: Vec<&str> = Vec::new();

        let qty_dec = Decimal::from(qty);

        let mut notional = None;
        if let Some(max_notional) = effective.max_notional {
            match price {
                None => missing.push("price"),
                Some(p) => {
                    let n = p * qty_dec;
                    notional = Some(n);
                    if n > max_notional {
                        breaches.push(FatFingerBreach {
                            breach_type: BreachType::Notional,
                            limit: Some(max_notional),
                            actual: Some(n),
                            metadata: serde_json::json!({ "price": p.to_string(), "qty": qty }),
                        });
                    }
                }
            }
        }

        if let Some(max_qty) = effective.max_qty {
            if qty > max_qty {
                breaches.push(FatFingerBreach {
                    breach_type: BreachType::Qty,
                    limit: Some(Decimal::from(max_qty)),
                    actual: Some(qty_dec),
                    metadata: serde_json::Value::Null,
                });
            }
        }

        let mut adv_pct = None;
        if let Some(max_adv_pct) = effective.max_adv_pct {
            match adv {
                None | Some(0) => missing.push("adv"),
                Some(adv_value) => {
                    let pct = qty_dec / Decimal::from(adv_value);
                    adv_pct = Some(pct);
                    if pct > max_adv_pct {
                        breaches.push(FatFingerBreach {
                            breach_type: BreachType::AdvPct,
                            limit: Some(max_adv_pct),
                            actual: Some(pct),
                            metadata: serde_json::json!({ "adv": adv_value, "qty": qty }),
                        });
                    }
                }
            }
        }

        if !missing.is_empty() {
            breaches.push(FatFingerBreach {
                breach_type: BreachType::DataUnavailable,
                limit: None,
                actual: None,
                metadata: serde_json::json!({ "missing": missing }),
            });
        }

        FatFingerResult {
            breached: !breaches.is_empty(),
            breaches,
            thresholds: effective,
            notional,
            adv,
            adv_pct,
            price,
        }
    }
}
