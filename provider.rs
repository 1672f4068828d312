//! External interfaces (spec §6): price history and beta lookups the engine
//! consumes but never fetches itself. No `async` — the day loop is pure CPU
//! once a run's bars are in hand, so callers resolve I/O ahead of time and
//! hand the engine an in-memory provider.

use std::collections::HashMap;

use chrono::NaiveDate;

use crate::errors::EngineError;
use crate::types::{Bar, PriceSeries};

pub trait PriceProvider {
    fn bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<PriceSeries, EngineError>;
}

pub trait BetaProvider {
    fn beta(&self, symbol: &str) -> Option<f64>;
}

/// `HashMap`-backed provider for tests and simple embedding: bars are
/// supplied up front, in whatever order, and sliced/sorted on lookup.
#[derive(Default)]
pub struct InMemoryPriceProvider {
    series: HashMap<String, PriceSeries>,
}

impl InMemoryPriceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: impl Into<String>, mut bars: PriceSeries) {
        bars.sort_by_key(|b| b.date);
        self.series.insert(symbol.into(), bars);
    }
}

impl PriceProvider for InMemoryPriceProvider {
    fn bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<PriceSeries, EngineError> {
        let series = self
            .series
            .get(symbol)
            .ok_or_else(|| EngineError::MissingPriceData { symbol: symbol.to_string() })?;
        let slice: Vec<Bar> = series.iter().filter(|b| b.date >= start && b.date <= end).cloned().collect();
        if slice.is_empty() {
            return Err(EngineError::MissingPriceData { symbol: symbol.to_string() });
        }
        Ok(slice)
    }
}

#[derive(Default)]
pub struct InMemoryBetaProvider {
    betas: HashMap<String, f64>,
}

impl InMemoryBetaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: impl Into<String>, beta: f64) {
        self.betas.insert(symbol.into(), beta);
    }
}

impl BetaProvider for InMemoryBetaProvider {
    fn beta(&self, symbol: &str) -> Option<f64> {
        self.betas.get(symbol).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(y: i32, m: u32, d: u32, close: rust_decimal::Decimal) -> Bar {
        let date = NaiveDate::from_ymd_opt(y, m, d).unwrap();
        Bar {
            date,
            open: close,
            high: close,
            low: close,
            close,
            adjusted_close: close,
        }
    }

    #[test]
    fn missing_symbol_is_an_error() {
        let provider = InMemoryPriceProvider::new();
        let err = provider.bars("AAA", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert!(err.is_err());
    }

    #[test]
    fn slices_to_requested_range() {
        let mut provider = InMemoryPriceProvider::new();
        provider.insert(
            "AAA",
            vec![bar(2024, 1, 1, dec!(10)), bar(2024, 1, 2, dec!(11)), bar(2024, 1, 3, dec!(12))],
        );
        let slice = provider
            .bars("AAA", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), NaiveDate::from_ymd_opt(2024, 1, 3).unwrap())
            .unwrap();
        assert_eq!(slice.len(), 2);
    }
}
