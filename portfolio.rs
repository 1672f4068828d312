//! Portfolio coordinator (spec §4.3): a day-synchronized driver over several
//! symbols sharing one cash ledger, with index-membership admission and
//! liquidation.
//!
//! Per day: the per-symbol bar lookup (step 2 of spec §4.3.1) runs in
//! parallel via `rayon`, since it only reads each symbol's own series; the
//! admission/commit that follows (steps 3-4) walks symbols in lexicographic
//! order and touches the shared `CashLedger` strictly single-threaded, so no
//! mutex is needed around it.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rayon::prelude::*;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::capital::{CashLedger, LedgerAdmit};
use crate::engine::{self, buy_and_hold_baseline, compound, unrealized_pnl};
use crate::errors::EngineError;
use crate::types::{
    DeferredSell, Params, PortfolioResult, PriceSeries, RunSummary, SingleRunResult,
    SymbolRunState, Transaction, TransactionKind,
};

/// One symbol's full configuration for a portfolio run.
#[derive(Clone)]
pub struct SymbolSpec {
    pub symbol: String,
    pub series: PriceSeries,
    pub params: Params,
    /// First day this symbol is part of the tracked index; `None` means
    /// from the start of the run.
    pub join_date: Option<NaiveDate>,
    /// Day this symbol leaves the index and is liquidated; `None` means it
    /// stays for the whole run.
    pub leave_date: Option<NaiveDate>,
}

pub struct PortfolioConfig {
    pub total_capital: Decimal,
    pub margin_fraction: Decimal,
    pub max_parallelism: usize,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            total_capital: Decimal::new(100_000, 0),
            margin_fraction: Decimal::ZERO,
            max_parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
        }
    }
}

#[derive(Default)]
struct Metrics {
    equity_peak: Decimal,
    prev_equity: Decimal,
    max_drawdown: f64,
    daily_returns: Vec<f64>,
    total_invested: Decimal,
}

struct Active {
    spec: SymbolSpec,
    state: SymbolRunState,
    metrics: Metrics,
}

/// Run a multi-symbol portfolio, day-synchronized across the union of all
/// symbols' trading dates. `cancel` is polled once per day; returning
/// `true` stops the run early with `EngineError::Cancelled`.
pub fn run_portfolio(specs: Vec<SymbolSpec>, config: PortfolioConfig, cancel: &dyn Fn() -> bool) -> Result<PortfolioResult, EngineError> {
    for spec in &specs {
        spec.params.validate()?;
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.max_parallelism.max(1))
        .build()
        .map_err(|e| EngineError::validation("max_parallelism", e.to_string()))?;

    let mut ledger = CashLedger::new(config.total_capital).with_margin_fraction(config.margin_fraction);

    let all_dates = union_of_dates(&specs);
    let mut active: BTreeMap<String, Active> = BTreeMap::new();
    let mut skipped_symbols = Vec::new();
    let mut capital_time_series = Vec::new();
    let mut last_completed_day: Option<NaiveDate> = None;
    let mut cancelled = false;

    for &day in &all_dates {
        if cancel() {
            cancelled = true;
            break;
        }

        admit_and_liquidate_membership(&specs, day, &mut active, &mut ledger, &mut skipped_symbols);

        let lookups: Vec<(String, Option<usize>)> = pool.install(|| {
            active
                .par_iter()
                .map(|(symbol, a)| (symbol.clone(), a.spec.series.iter().position(|b| b.date == day)))
                .collect()
        });
        let idx_by_symbol: BTreeMap<String, usize> = lookups.into_iter().filter_map(|(s, i)| i.map(|i| (s, i))).collect();

        // Sell-before-buy commit ordering (spec §5): every symbol's protect
        // (closing) half runs, and its sell proceeds land in the shared
        // ledger, before any symbol's acquire (opening) half is evaluated
        // against that ledger. Otherwise a same-day sell-then-buy on one
        // symbol -- or a sell on one symbol funding a buy on another,
        // lexicographically later one -- would see stale buying power.
        let symbols_today: Vec<String> = idx_by_symbol.keys().cloned().collect();
        let mut stepped_today: BTreeMap<String, bool> = BTreeMap::new();

        for symbol in &symbols_today {
            let idx = idx_by_symbol[symbol];
            let a = active.get_mut(symbol).expect("symbol present in active map");
            let txns_before = a.state.txn_log.len();
            let series = a.spec.series.clone();
            let params = a.spec.params.clone();
            let stepped = engine::step_day_protect(&mut a.state, &series, idx, &params);
            if stepped {
                apply_realized_pnl_to_ledger(&mut a.state, &mut ledger, txns_before);
            }
            stepped_today.insert(symbol.clone(), stepped);
        }

        for symbol in &symbols_today {
            if !stepped_today[symbol] {
                continue;
            }
            let idx = idx_by_symbol[symbol];
            let a = active.get_mut(symbol).expect("symbol present in active map");
            let mut gate = LedgerAdmit { ledger: &mut ledger };
            let series = a.spec.series.clone();
            let params = a.spec.params.clone();
            engine::step_day_acquire(&mut a.state, &series, idx, &params, &mut gate);
            update_metrics(a, &series[idx].close);
        }

        if !symbols_today.is_empty() {
            ledger.check_invariant(day, symbols_today.len(), &symbols_today)?;
        }

        capital_time_series.push((day, ledger.cash_reserve, ledger.deployed_capital));
        last_completed_day = Some(day);
    }

    let mut per_symbol = BTreeMap::new();
    for (symbol, a) in active.into_iter() {
        per_symbol.insert(symbol, finalize(a));
    }

    Ok(PortfolioResult {
        per_symbol,
        rejected_orders: ledger.rejected_orders,
        skipped_symbols,
        capital_time_series,
        cancelled,
        deadline_exceeded: false,
    })
}

fn admit_and_liquidate_membership(
    specs: &[SymbolSpec],
    day: NaiveDate,
    active: &mut BTreeMap<String, Active>,
    ledger: &mut CashLedger,
    skipped_symbols: &mut Vec<String>,
) {
    for spec in specs {
        let leaves_today = spec.leave_date == Some(day);
        if leaves_today {
            if let Some(a) = active.remove(&spec.symbol) {
                liquidate(a, day, ledger);
            }
            continue;
        }

        let joins_today = spec.join_date.map(|d| d == day).unwrap_or(false);
        let already_active = active.contains_key(&spec.symbol);
        let within_window = spec.join_date.map(|d| day >= d).unwrap_or(true) && spec.leave_date.map(|d| day < d).unwrap_or(true);

        if (joins_today || (spec.join_date.is_none() && !already_active)) && within_window && !already_active {
            let first_price = spec
                .series
                .iter()
                .find(|b| b.date >= day)
                .map(|b| b.decision_price(spec.params.use_adjusted_close));
            let Some(first_price) = first_price else {
                skipped_symbols.push(spec.symbol.clone());
                continue;
            };
            active.insert(
                spec.symbol.clone(),
                Active {
                    spec: spec.clone(),
                    state: SymbolRunState::new(&spec.symbol, first_price),
                    metrics: Metrics {
                        equity_peak: Decimal::ZERO,
                        prev_equity: Decimal::ZERO,
                        max_drawdown: 0.0,
                        daily_returns: Vec::new(),
                        total_invested: Decimal::ZERO,
                    },
                },
            );
            info!(symbol = %spec.symbol, %day, "admitted to portfolio");
        }
    }
}

fn liquidate(mut a: Active, day: NaiveDate, ledger: &mut CashLedger) {
    if a.state.lots.is_empty() {
        return;
    }
    let price = a
        .spec
        .series
        .iter()
        .rev()
        .find(|b| b.date <= day)
        .map(|b| b.decision_price(a.spec.params.use_adjusted_close))
        .unwrap_or(Decimal::ZERO);

    let shares: Decimal = a.state.lots.iter().map(|l| l.shares).sum();
    let cost_basis: Decimal = a.state.lots.iter().map(|l| l.cost_basis).sum();
    let proceeds = shares * price;
    ledger.release(cost_basis, proceeds);

    a.state.txn_log.push(Transaction {
        date: day,
        symbol: a.spec.symbol.clone(),
        kind: TransactionKind::Liquidation,
        price,
        shares,
        value: proceeds,
        lots_affected: Some(a.state.lots.len() as u32),
        realized_pnl: Some(proceeds - cost_basis),
        reason: Some("removed from index".to_string()),
    });
    a.state.lots.clear();
    warn!(symbol = %a.spec.symbol, %day, "liquidated on index removal");
}

/// Mirrors any closing trades `step_day` committed against the symbol's own
/// state into the shared ledger. `step_day`'s `Admit` gate only covers the
/// buy side, so sells (which never need admission) release their capital
/// here instead, over every transaction appended since `txns_before` — a
/// single day can both close and reopen a position.
fn apply_realized_pnl_to_ledger(state: &mut SymbolRunState, ledger: &mut CashLedger, txns_before: usize) {
    for txn in &state.txn_log[txns_before..] {
        if matches!(txn.kind, TransactionKind::TrailingSell | TransactionKind::Sell) {
            let cost_basis = txn.value - txn.realized_pnl.unwrap_or(Decimal::ZERO);
            ledger.release(cost_basis, txn.value);
        }
    }
}

fn update_metrics(a: &mut Active, close: &Decimal) {
    let equity = a.state.open_shares() * close;
    if a.metrics.equity_peak.is_zero() {
        a.metrics.equity_peak = equity;
        a.metrics.prev_equity = equity;
        return;
    }
    if equity > a.metrics.equity_peak {
        a.metrics.equity_peak = equity;
    }
    if a.metrics.equity_peak > Decimal::ZERO {
        let dd = ((a.metrics.equity_peak - equity) / a.metrics.equity_peak).to_string().parse::<f64>().unwrap_or(0.0);
        if dd > a.metrics.max_drawdown {
            a.metrics.max_drawdown = dd;
        }
    }
    if a.metrics.prev_equity > Decimal::ZERO {
        let r = ((equity - a.metrics.prev_equity) / a.metrics.prev_equity).to_string().parse::<f64>().unwrap_or(0.0);
        a.metrics.daily_returns.push(r);
    }
    a.metrics.prev_equity = equity;

    if let Some(last) = a.state.txn_log.last() {
        if matches!(last.kind, TransactionKind::TrailingBuy | TransactionKind::Buy) {
            a.metrics.total_invested += last.value;
        }
    }
}

fn finalize(a: Active) -> SingleRunResult {
    let realized_pnl: Decimal = a.state.txn_log.iter().filter_map(|t| t.realized_pnl).fold(Decimal::ZERO, |acc, x| acc + x);
    let last_bar = a.spec.series.last();
    let unrealized = unrealized_pnl(&a.state, last_bar);
    let total_return = if a.metrics.total_invested > Decimal::ZERO {
        ((realized_pnl + unrealized) / a.metrics.total_invested).to_string().parse::<f64>().unwrap_or(0.0)
    } else {
        0.0
    };
    let buy_and_hold = buy_and_hold_baseline(&a.spec.series, &a.spec.params);

    SingleRunResult {
        symbol: a.spec.symbol.clone(),
        end_date: last_bar.map(|b| b.date),
        summary: RunSummary {
            total_return,
            time_weighted_return: compound(&a.metrics.daily_returns),
            realized_pnl,
            unrealized_pnl: unrealized,
            max_drawdown: a.metrics.max_drawdown,
            counters: a.state.counters,
            buy_and_hold,
        },
        transactions: a.state.txn_log,
        open_lots: a.state.lots,
    }
}

fn union_of_dates(specs: &[SymbolSpec]) -> Vec<NaiveDate> {
    let mut set = std::collections::BTreeSet::new();
    for spec in specs {
        for bar in &spec.series {
            set.insert(bar.date);
        }
    }
    set.into_iter().collect()
}

/// Reserved for spec §4.3.3: queues a sell that couldn't be committed this
/// day so it can be retried next day instead of being dropped. Not wired
/// into `run_portfolio` while `enable_deferred_selling` stays off — no
/// scenario in this engine currently produces an un-committable sell, since
/// closing trades never consume capital.
#[allow(dead_code)]
fn queue_deferred_sell(symbol: &str, day: NaiveDate) -> DeferredSell {
    DeferredSell {
        symbol: symbol.to_string(),
        queued_date: day,
        age_days: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn series(prices: &[(i32, u32, u32, f64)]) -> PriceSeries {
        prices
            .iter()
            .map(|&(y, m, d, c)| {
                let close = Decimal::from_f64_retain(c).unwrap();
                crate::types::Bar {
                    date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
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
    fn rejects_buys_once_capital_is_exhausted() {
        let specs = vec![
            SymbolSpec {
                symbol: "AAA".to_string(),
                series: series(&[(2024, 1, 1, 100.0), (2024, 1, 2, 80.0), (2024, 1, 3, 79.9)]),
                params: Params {
                    lot_size_usd: dec!(6000),
                    trailing_buy_activation_percent: 0.0,
                    trailing_buy_rebound_percent: 0.001,
                    trailing_stop_order_type: crate::types::TrailingStopOrderType::Market,
                    ..Default::default()
                },
                join_date: None,
                leave_date: None,
            },
            SymbolSpec {
                symbol: "BBB".to_string(),
                series: series(&[(2024, 1, 1, 100.0), (2024, 1, 2, 80.0), (2024, 1, 3, 79.9)]),
                params: Params {
                    lot_size_usd: dec!(6000),
                    trailing_buy_activation_percent: 0.0,
                    trailing_buy_rebound_percent: 0.001,
                    trailing_stop_order_type: crate::types::TrailingStopOrderType::Market,
                    ..Default::default()
                },
                join_date: None,
                leave_date: None,
            },
        ];
        let config = PortfolioConfig {
            total_capital: dec!(10000),
            margin_fraction: Decimal::ZERO,
            max_parallelism: 2,
        };
        let result = run_portfolio(specs, config, &|| false).unwrap();
        assert!(!result.rejected_orders.is_empty());
    }

    /// Spec §5: a same-day sell's proceeds must be credited to the shared
    /// ledger before that same day's buy is admitted. Zero activation/rebound
    /// on both sides makes every armed day both close and reopen a position,
    /// and capital is sized so the reopen can only be admitted if the close's
    /// proceeds landed first.
    #[test]
    fn same_day_sell_funds_the_same_day_buy() {
        let params = Params {
            lot_size_usd: dec!(6000),
            trailing_buy_activation_percent: 0.0,
            trailing_buy_rebound_percent: 0.0,
            trailing_sell_activation_percent: 0.0,
            trailing_sell_pullback_percent: 0.0,
            profit_requirement: 0.0,
            grid_interval_percent: 0.0,
            trailing_stop_order_type: crate::types::TrailingStopOrderType::Market,
            max_lots: 5,
            ..Default::default()
        };
        let specs = vec![SymbolSpec {
            symbol: "AAA".to_string(),
            series: series(&[(2024, 1, 1, 100.0), (2024, 1, 2, 100.0), (2024, 1, 3, 100.0)]),
            params,
            join_date: None,
            leave_date: None,
        }];
        let config = PortfolioConfig {
            total_capital: dec!(6000),
            margin_fraction: Decimal::ZERO,
            max_parallelism: 1,
        };
        let result = run_portfolio(specs, config, &|| false).unwrap();

        assert!(result.rejected_orders.is_empty(), "day 3's reopen should be funded by day 3's own close");
        let counters = &result.per_symbol["AAA"].summary.counters;
        assert_eq!(counters.sell_count, 1);
        assert_eq!(counters.buy_count, 2);
    }
}
