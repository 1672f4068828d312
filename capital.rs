//! Portfolio cash ledger (spec §4.3.2): admission control, commit, and the
//! capital invariant check. Kept separate from `portfolio.rs` so the day
//! loop stays a thin driver over a ledger whose own correctness can be unit
//! tested in isolation.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::error;

use crate::engine::Admit;
use crate::errors::EngineError;
use crate::types::Rejection;

/// Per-symbol-day tolerance on `deployed + cash == total` (spec §4.3.2: "≤ 1¢
/// per symbol-day").
const CAPITAL_EPSILON_PER_SYMBOL: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01

/// Shared cash ledger for a portfolio run. Not `Sync` — `portfolio.rs` only
/// ever touches it from the single serial admission/commit phase of a day,
/// never from the parallel per-symbol evaluation phase.
#[derive(Debug)]
pub struct CashLedger {
    pub total_capital: Decimal,
    pub cash_reserve: Decimal,
    pub deployed_capital: Decimal,
    pub margin_fraction: Decimal,
    pub realized_pnl_to_date: Decimal,
    pub rejected_orders: Vec<Rejection>,
}

impl CashLedger {
    pub fn new(total_capital: Decimal) -> Self {
        Self {
            total_capital,
            cash_reserve: total_capital,
            deployed_capital: Decimal::ZERO,
            margin_fraction: Decimal::ZERO,
            realized_pnl_to_date: Decimal::ZERO,
            rejected_orders: Vec::new(),
        }
    }

    pub fn with_margin_fraction(mut self, margin_fraction: Decimal) -> Self {
        self.margin_fraction = margin_fraction;
        self
    }

    /// Buying power available right now (spec §4.3.2): headroom under the
    /// admission cap `totalCapital * (1 + marginFraction)`, not a scaling of
    /// `cash_reserve` itself — `marginFraction` raises how far `deployed_capital`
    /// may run ahead of `cash_reserve`, it never multiplies cash on hand.
    pub fn buying_power(&self) -> Decimal {
        let cap = self.total_capital * (Decimal::ONE + self.margin_fraction);
        (cap - self.deployed_capital).max(Decimal::ZERO)
    }

    /// Admit a single order against current buying power, deterministically.
    /// Callers must present orders in the ordering rule from spec §4.3.1
    /// (lexicographic by symbol) — this method itself is order-agnostic,
    /// it only ever sees one order at a time.
    pub fn try_admit(&mut self, symbol: &str, date: NaiveDate, amount: Decimal) -> bool {
        if amount <= self.buying_power() {
            self.cash_reserve -= amount;
            self.deployed_capital += amount;
            true
        } else {
            self.rejected_orders.push(Rejection {
                date,
                symbol: symbol.to_string(),
                required: amount,
                available: self.buying_power(),
                reason: "insufficient buying power".to_string(),
            });
            false
        }
    }

    /// Release capital back to cash on a closing trade (sell proceeds or a
    /// forced liquidation). `proceeds` is the cash value realized;
    /// `freed_cost_basis` is the slice of `deployed_capital` the closed
    /// position had been holding. Margin never enters here: the position's
    /// cost basis moves out of `deployed_capital` and the full proceeds land
    /// in `cash_reserve`, keeping `deployed + cash` unchanged by the move
    /// itself (spec §3.6) regardless of `margin_fraction`.
    pub fn release(&mut self, freed_cost_basis: Decimal, proceeds: Decimal) {
        self.deployed_capital -= freed_cost_basis;
        self.cash_reserve += proceeds;
        self.realized_pnl_to_date += proceeds - freed_cost_basis;
    }

    /// Verify `deployed + cash == total + realized P&L to date` within the
    /// per-symbol-day epsilon (spec §4.3.2). `symbol_count` scales the
    /// tolerance for the day.
    pub fn check_invariant(&self, day: NaiveDate, symbol_count: usize, symbols: &[String]) -> Result<(), EngineError> {
        let sum = self.cash_reserve + self.deployed_capital;
        let expected_total = self.total_capital + self.realized_pnl_to_date;
        let delta = (sum - expected_total).abs();
        let tolerance = CAPITAL_EPSILON_PER_SYMBOL * Decimal::from(symbol_count.max(1) as u64);
        if delta > tolerance {
            error!(%day, %delta, %tolerance, "capital invariant violated");
            return Err(EngineError::CapitalLeak {
                day,
                deployed: self.deployed_capital,
                cash: self.cash_reserve,
                total: expected_total,
                delta,
                symbols: symbols.to_vec(),
            });
        }
        Ok(())
    }
}

/// Adapter so `engine::run_single` can admit against a `CashLedger` it
/// doesn't otherwise know about. `portfolio.rs` wires this in per symbol.
pub struct LedgerAdmit<'a> {
    pub ledger: &'a mut CashLedger,
}

impl<'a> Admit for LedgerAdmit<'a> {
    fn admit(&mut self, symbol: &str, date: NaiveDate, amount: Decimal) -> bool {
        self.ledger.try_admit(symbol, date, amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn admits_within_buying_power() {
        let mut ledger = CashLedger::new(dec!(10000));
        assert!(ledger.try_admit("AAA", d(2024, 1, 1), dec!(1000)));
        assert_eq!(ledger.cash_reserve, dec!(9000));
        assert_eq!(ledger.deployed_capital, dec!(1000));
    }

    #[test]
    fn rejects_when_capital_exhausted() {
        let mut ledger = CashLedger::new(dec!(1000));
        assert!(ledger.try_admit("AAA", d(2024, 1, 1), dec!(900)));
        assert!(!ledger.try_admit("BBB", d(2024, 1, 1), dec!(200)));
        assert_eq!(ledger.rejected_orders.len(), 1);
    }

    #[test]
    fn invariant_holds_after_admit_and_release() {
        let mut ledger = CashLedger::new(dec!(10000));
        ledger.try_admit("AAA", d(2024, 1, 1), dec!(1000));
        ledger.release(dec!(1000), dec!(1100));
        assert!(ledger.check_invariant(d(2024, 1, 1), 1, &["AAA".to_string()]).is_ok());
        assert_eq!(ledger.cash_reserve, dec!(10100));
    }

    #[test]
    fn invariant_flags_a_leak() {
        let mut ledger = CashLedger::new(dec!(10000));
        ledger.cash_reserve -= dec!(50); // simulate a leak
        let err = ledger.check_invariant(d(2024, 1, 1), 1, &["AAA".to_string()]);
        assert!(err.is_err());
    }

    #[test]
    fn margin_fraction_raises_the_cap_additively() {
        let mut ledger = CashLedger::new(dec!(10000)).with_margin_fraction(dec!(0.5));
        // cap = 10000 * 1.5 = 15000, not 10000 / 0.5
        assert_eq!(ledger.buying_power(), dec!(15000));
        assert!(ledger.try_admit("AAA", d(2024, 1, 1), dec!(12000)));
        assert_eq!(ledger.buying_power(), dec!(3000));
        assert!(!ledger.try_admit("BBB", d(2024, 1, 1), dec!(4000)));
        assert!(ledger.check_invariant(d(2024, 1, 1), 1, &["AAA".to_string()]).is_ok());
    }
}
