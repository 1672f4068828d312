//! Batch runner (spec §4.4): cartesian product of parameter ranges, dispatched
//! across a bounded `rayon` thread pool, one progress callback per completed
//! combination, cooperative cancellation between combinations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::engine::{self, AlwaysAdmit};
use crate::errors::EngineError;
use crate::types::{Params, PriceSeries, SingleRunResult};

/// One parameter's sweep values. The field name must match a `Params` JSON
/// key (spec §9's merge layering); unrecognized keys fail validation at
/// `expand`.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct ParamRange {
    pub field: String,
    pub values: Vec<serde_json::Value>,
}

#[derive(Clone, Debug, Default)]
pub struct BatchConfig {
    pub max_parallelism: Option<usize>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct BatchRunResult {
    pub overrides: serde_json::Value,
    pub result: SingleRunResult,
}

/// Expand `ranges` into the cartesian product of parameter combinations, in
/// deterministic left-to-right, first-varies-fastest order (not hash-map
/// iteration order) so repeated runs produce an identical combination list.
pub fn expand(base: &Params, ranges: &[ParamRange]) -> Result<Vec<(serde_json::Value, Params)>, EngineError> {
    let mut combos: Vec<serde_json::Map<String, serde_json::Value>> = vec![serde_json::Map::new()];
    for range in ranges {
        if range.values.is_empty() {
            return Err(EngineError::validation(range.field.as_str(), "parameter range must not be empty"));
        }
        let mut next = Vec::with_capacity(combos.len() * range.values.len());
        for combo in &combos {
            for value in &range.values {
                let mut extended = combo.clone();
                extended.insert(range.field.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }

    let base_value = serde_json::to_value(base).map_err(|e| EngineError::validation("params", e.to_string()))?;
    let empty = serde_json::Value::Object(serde_json::Map::new());
    let mut out = Vec::with_capacity(combos.len());
    for combo in combos {
        let overrides = serde_json::Value::Object(combo);
        let params = crate::config::ParamBuilder::merge(&base_value, &overrides, &empty)?;
        params.validate()?;
        out.push((overrides, params));
    }
    Ok(out)
}

/// A cooperative cancellation flag, checked between combinations (not mid
/// combination — a single backtest run is short enough that checking more
/// often isn't worth the overhead).
#[derive(Clone, Default)]
pub struct CancelToken(Arc<std::sync::atomic::AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(std::sync::atomic::AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Run every combination against `series`, most-profitable first.
/// `on_progress(done, total)` fires once per completed combination.
pub fn run_batch(
    symbol: &str,
    series: &PriceSeries,
    base: &Params,
    ranges: &[ParamRange],
    config: &BatchConfig,
    cancel: &CancelToken,
    on_progress: &(dyn Fn(usize, usize) + Sync),
) -> Result<Vec<BatchRunResult>, EngineError> {
    let combos = expand(base, ranges)?;
    let total = combos.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let threads = config.max_parallelism.unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .map_err(|e| EngineError::validation("max_parallelism", e.to_string()))?;

    let completed = AtomicUsize::new(0);

    let mut results: Vec<BatchRunResult> = pool.install(|| {
        combos
            .into_par_iter()
            .filter_map(|(overrides, params)| {
                if cancel.is_cancelled() {
                    return None;
                }
                let mut admit = AlwaysAdmit;
                let result = engine::run_single(symbol, series, &params, &mut admit);
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                on_progress(done, total);
                Some(BatchRunResult { overrides, result })
            })
            .collect()
    });

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled { last_completed_day: None });
    }

    results.sort_by(|a, b| b.result.summary.total_return.partial_cmp(&a.result.summary.total_return).unwrap_or(std::cmp::Ordering::Equal));
    Ok(results)
}

/// Top `k` results, already sorted by `run_batch`.
pub fn top_k(results: &[BatchRunResult], k: usize) -> &[BatchRunResult] {
    &results[..k.min(results.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn series() -> PriceSeries {
        (1..=10)
            .map(|d| {
                let close = Decimal::from(100 - d);
                crate::types::Bar {
                    date: NaiveDate::from_ymd_opt(2024, 1, d as u32).unwrap(),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    adjusted_close: close,
                }
            })
            .collect()
    }

    #[test]
    fn expand_is_cartesian_and_deterministic() {
        let base = Params::default();
        let ranges = vec![
            ParamRange { field: "maxLots".to_string(), values: vec![json!(1), json!(2)] },
            ParamRange { field: "gridIntervalPercent".to_string(), values: vec![json!(0.1), json!(0.2), json!(0.3)] },
        ];
        let combos = expand(&base, &ranges).unwrap();
        assert_eq!(combos.len(), 6);
    }

    #[test]
    fn expand_rejects_empty_range() {
        let base = Params::default();
        let ranges = vec![ParamRange { field: "maxLots".to_string(), values: vec![] }];
        assert!(expand(&base, &ranges).is_err());
    }

    #[test]
    fn run_batch_sorts_descending_by_return() {
        let base = Params::default();
        let ranges = vec![ParamRange { field: "maxLots".to_string(), values: vec![json!(1), json!(3), json!(5)] }];
        let config = BatchConfig { max_parallelism: Some(2) };
        let cancel = CancelToken::new();
        let results = run_batch("TEST", &series(), &base, &ranges, &config, &cancel, &|_, _| {}).unwrap();
        assert_eq!(results.len(), 3);
        for w in results.windows(2) {
            assert!(w[0].result.summary.total_return >= w[1].result.summary.total_return);
        }
    }

    #[test]
    fn run_batch_respects_cancellation() {
        let base = Params::default();
        let ranges = vec![ParamRange { field: "maxLots".to_string(), values: vec![json!(1), json!(2)] }];
        let config = BatchConfig::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = run_batch("TEST", &series(), &base, &ranges, &config, &cancel, &|_, _| {});
        assert!(result.is_err());
    }
}
