//! Parameter construction and validation (spec §3.7, §9).
//!
//! Merge priority is `tickerOverride > requestBody > globalDefault >
//! hardcoded`, applied once per run; the resulting `Params` is then cloned
//! rather than re-merged for the rest of the run's lifetime.

use serde_json::Value;

use crate::errors::EngineError;
use crate::types::Params;

pub struct ParamBuilder;

impl ParamBuilder {
    /// `global`/`overrides`/`ticker_override` are each a (possibly empty)
    /// JSON object of field overrides; any field absent from all three
    /// keeps `Params::default()`'s hardcoded value.
    pub fn merge(global: &Value, overrides: &Value, ticker_override: &Value) -> Result<Params, EngineError> {
        let mut merged = serde_json::to_value(Params::default())
            .map_err(|e| EngineError::validation("params", e.to_string()))?;
        shallow_merge(&mut merged, global);
        shallow_merge(&mut merged, overrides);
        shallow_merge(&mut merged, ticker_override);
        serde_json::from_value(merged).map_err(|e| EngineError::validation("params", e.to_string()))
    }
}

fn shallow_merge(base: &mut Value, patch: &Value) {
    let (Value::Object(base_map), Value::Object(patch_map)) = (base, patch) else {
        return;
    };
    for (key, value) in patch_map {
        base_map.insert(key.clone(), value.clone());
    }
}

impl Params {
    /// Range/enum invariants from spec §3; called once per run before day 1.
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_unit_fraction("trailingBuyActivationPercent", self.trailing_buy_activation_percent)?;
        validate_unit_fraction("trailingBuyReboundPercent", self.trailing_buy_rebound_percent)?;
        validate_unit_fraction("trailingSellActivationPercent", self.trailing_sell_activation_percent)?;
        validate_unit_fraction("trailingSellPullbackPercent", self.trailing_sell_pullback_percent)?;

        if self.grid_interval_percent < 0.0 {
            return Err(EngineError::validation("gridIntervalPercent", "must be non-negative"));
        }
        if self.profit_requirement < 0.0 {
            return Err(EngineError::validation("profitRequirement", "must be non-negative"));
        }
        if self.dynamic_grid_multiplier <= 0.0 {
            return Err(EngineError::validation("dynamicGridMultiplier", "must be positive"));
        }
        if self.grid_consecutive_increment < 0.0 {
            return Err(EngineError::validation("gridConsecutiveIncrement", "must be non-negative"));
        }
        if self.max_lots < 1 {
            return Err(EngineError::validation("maxLots", "must be at least 1"));
        }
        if self.max_lots_to_sell < 1 {
            return Err(EngineError::validation("maxLotsToSell", "must be at least 1"));
        }
        if self.lot_size_usd <= rust_decimal::Decimal::ZERO {
            return Err(EngineError::validation("lotSizeUsd", "must be positive"));
        }
        if self.per_trade_fee < rust_decimal::Decimal::ZERO {
            return Err(EngineError::validation("perTradeFee", "must be non-negative"));
        }
        let _ = self.strategy_mode; // StrategyMode/TrailingStopOrderType are closed enums; any
        let _ = self.trailing_stop_order_type; // deserialized value is already valid by construction.
        Ok(())
    }
}

fn validate_unit_fraction(field: &str, value: f64) -> Result<(), EngineError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(EngineError::validation(field, "must be within [0, 1]"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_priority_ticker_wins() {
        let global = json!({ "gridIntervalPercent": 0.2 });
        let overrides = json!({ "gridIntervalPercent": 0.3, "maxLots": 5 });
        let ticker = json!({ "gridIntervalPercent": 0.4 });
        let params = ParamBuilder::merge(&global, &overrides, &ticker).unwrap();
        assert_eq!(params.grid_interval_percent, 0.4);
        assert_eq!(params.max_lots, 5);
    }

    #[test]
    fn default_values_survive_empty_overrides() {
        let empty = json!({});
        let params = ParamBuilder::merge(&empty, &empty, &empty).unwrap();
        assert_eq!(params, Params::default());
    }

    #[test]
    fn validate_rejects_out_of_range_activation() {
        let params = Params {
            trailing_buy_activation_percent: 1.5,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_max_lots() {
        let params = Params {
            max_lots: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(Params::default().validate().is_ok());
    }
}
