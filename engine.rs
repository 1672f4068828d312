//! Single-symbol DCA trailing-stop engine (spec §4.2).
//!
//! `run_single` walks one symbol's price series one bar at a time in the
//! mandated order: observe, protect (sell side), acquire (buy side), re-arm.
//! Capital admission is delegated to an `Admit` callback so this module has
//! no notion of a shared cash ledger — `portfolio.rs` supplies a real gate,
//! direct callers get the default (always admit).

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::stops::{self, StopOutcome};
use crate::types::{
    Bar, BuyAndHoldBaseline, Lot, Params, PriceSeries, RunSummary, SingleRunResult, StrategyMode,
    SymbolRunState, Transaction, TransactionKind,
};

/// Called before committing capital to a new lot. Returns `true` if the
/// requested dollar amount may be spent. The default always admits; the
/// portfolio coordinator supplies a ledger-backed gate instead.
pub trait Admit {
    fn admit(&mut self, symbol: &str, date: NaiveDate, amount: Decimal) -> bool;
}

/// Always-admit gate for standalone single-symbol runs.
pub struct AlwaysAdmit;

impl Admit for AlwaysAdmit {
    fn admit(&mut self, _symbol: &str, _date: NaiveDate, _amount: Decimal) -> bool {
        true
    }
}

const MOMENTUM_WINDOW: usize = 5;

/// Run one symbol's full price series against `params`, returning the
/// transaction log, remaining open lots, and summary metrics.
pub fn run_single(symbol: &str, series: &PriceSeries, params: &Params, admit: &mut dyn Admit) -> SingleRunResult {
    let mut state = SymbolRunState::new(symbol, series.first().map(|b| b.decision_price(params.use_adjusted_close)).unwrap_or(Decimal::ZERO));

    let mut equity_peak = state_equity(&state, series.first());
    let mut max_drawdown = 0.0_f64;
    let mut daily_returns = Vec::with_capacity(series.len());
    let mut prev_equity = equity_peak;

    for (idx, bar) in series.iter().enumerate() {
        if !step_day(&mut state, series, idx, params, admit) {
            continue;
        }

        let equity = state_equity(&state, Some(bar));
        if equity > equity_peak {
            equity_peak = equity;
        }
        if equity_peak > Decimal::ZERO {
            let dd = ((equity_peak - equity) / equity_peak).to_string().parse::<f64>().unwrap_or(0.0);
            if dd > max_drawdown {
                max_drawdown = dd;
            }
        }
        if prev_equity > Decimal::ZERO {
            let r = ((equity - prev_equity) / prev_equity).to_string().parse::<f64>().unwrap_or(0.0);
            daily_returns.push(r);
        }
        prev_equity = equity;
    }

    let end_date = series.last().map(|b| b.date);
    let realized_pnl: Decimal = state
        .txn_log
        .iter()
        .filter_map(|t| t.realized_pnl)
        .fold(Decimal::ZERO, |acc, x| acc + x);
    let unrealized_pnl = unrealized_pnl(&state, series.last());
    let total_invested = state.txn_log.iter().filter(|t| matches!(t.kind, TransactionKind::Buy | TransactionKind::TrailingBuy)).map(|t| t.value).fold(Decimal::ZERO, |a, b| a + b);
    let total_return = if total_invested > Decimal::ZERO {
        ((realized_pnl + unrealized_pnl) / total_invested).to_string().parse::<f64>().unwrap_or(0.0)
    } else {
        0.0
    };
    let time_weighted_return = compound(&daily_returns);

    let buy_and_hold = buy_and_hold_baseline(series, params);

    SingleRunResult {
        symbol: symbol.to_string(),
        transactions: state.txn_log,
        open_lots: state.lots,
        end_date,
        summary: RunSummary {
            total_return,
            time_weighted_return,
            realized_pnl,
            unrealized_pnl,
            max_drawdown,
            counters: state.counters,
            buy_and_hold,
        },
    }
}

/// Advance one symbol by one bar: observe, protect, acquire, re-arm (spec
/// §4.1/§4.2). Returns `false` (no-op) for a non-positive price.
///
/// Single-symbol runs have no shared ledger to interleave, so this just
/// chains the two half-steps below. `portfolio.rs` calls them separately
/// instead, so it can credit a same-day sell's proceeds into the shared
/// ledger before that day's buy admission is evaluated for any symbol
/// (spec §5's sell-before-buy commit ordering).
pub fn step_day(state: &mut SymbolRunState, series: &PriceSeries, idx: usize, params: &Params, admit: &mut dyn Admit) -> bool {
    if !step_day_protect(state, series, idx, params) {
        return false;
    }
    step_day_acquire(state, series, idx, params, admit);
    true
}

/// First half of a day: observe the running peak/trough, then evaluate the
/// protective (closing) side. Returns `false` (no-op) for a non-positive
/// price. Must run, for every symbol trading that day, before any symbol's
/// [`step_day_acquire`].
pub fn step_day_protect(state: &mut SymbolRunState, series: &PriceSeries, idx: usize, params: &Params) -> bool {
    let bar = &series[idx];
    let close = bar.decision_price(params.use_adjusted_close);
    if close <= Decimal::ZERO {
        warn!(symbol = %state.symbol, date = %bar.date, "non-positive price, skipping day");
        return false;
    }

    observe(state, close);
    protect(state, series, idx, bar, close, params);
    true
}

/// Second half of a day: evaluate the acquiring (opening) side against
/// `admit`, then re-arm. Only call this after [`step_day_protect`] returned
/// `true` for the same `(state, idx)`.
pub fn step_day_acquire(state: &mut SymbolRunState, series: &PriceSeries, idx: usize, params: &Params, admit: &mut dyn Admit) {
    let bar = &series[idx];
    let close = bar.decision_price(params.use_adjusted_close);
    let symbol = state.symbol.clone();
    acquire(&symbol, state, series, idx, bar, close, params, admit);
    re_arm(state, close, params);
}

pub(crate) fn state_equity(state: &SymbolRunState, bar: Option<&Bar>) -> Decimal {
    match bar {
        Some(b) => state.open_shares() * b.close,
        None => Decimal::ZERO,
    }
}

pub(crate) fn unrealized_pnl(state: &SymbolRunState, bar: Option<&Bar>) -> Decimal {
    match bar {
        Some(b) => state.open_shares() * b.close - state.open_cost_basis(),
        None => Decimal::ZERO,
    }
}

pub(crate) fn compound(returns: &[f64]) -> f64 {
    returns.iter().fold(1.0_f64, |acc, r| acc * (1.0 + r)) - 1.0
}

/// Step 1: update the running peak/trough off today's decision price.
fn observe(state: &mut SymbolRunState, close: Decimal) {
    if close > state.recent_peak {
        state.recent_peak = close;
    }
    if close < state.recent_trough {
        state.recent_trough = close;
    }
}

/// Step 2: evaluate the protective (closing) side first, before any new
/// capital is committed for the day (spec §4.1 day-ordering requirement).
fn protect(state: &mut SymbolRunState, series: &PriceSeries, idx: usize, bar: &Bar, close: Decimal, params: &Params) {
    let closing_side_is_sell = params.strategy_mode == StrategyMode::Long;
    let outcome = if closing_side_is_sell {
        stops::step_sell(&mut state.ts_sell, close, params.trailing_stop_order_type)
    } else {
        stops::step_buy(&mut state.ts_buy, close, params.trailing_stop_order_type)
    };

    match outcome {
        StopOutcome::None => {}
        StopOutcome::Cancelled => {
            if closing_side_is_sell {
                state.counters.trailing_sell_cancelled += 1;
            } else {
                state.counters.trailing_buy_cancelled += 1;
            }
            debug!(symbol = %state.symbol, date = %bar.date, "closing trailing stop cancelled");
        }
        StopOutcome::Fired => {
            try_close(state, series, idx, bar, close, params);
        }
    }
}

fn try_close(state: &mut SymbolRunState, series: &PriceSeries, idx: usize, bar: &Bar, close: Decimal, params: &Params) {
    if state.lots.is_empty() {
        state.counters.sell_blocked_by_direction += 1;
        warn!(symbol = %state.symbol, date = %bar.date, "closing stop fired with no open lots");
        return;
    }

    let avg_cost = match state.avg_cost() {
        Some(c) => c,
        None => return,
    };

    let effective_profit = effective_profit_requirement(params, state.consecutive_buys_since_last_sell);
    let profitable = match params.strategy_mode {
        StrategyMode::Long => close >= avg_cost * decimal_from(1.0 + effective_profit),
        StrategyMode::Short => close <= avg_cost * decimal_from(1.0 - effective_profit),
    };

    if params.momentum_based_sell && !momentum_confirms_close(series, idx, params) {
        state.counters.sell_blocked_by_momentum += 1;
        warn!(symbol = %state.symbol, date = %bar.date, "closing trade blocked by momentum gate");
        return;
    }

    if !params.enable_adaptive_trailing_sell && !short_term_uptrend(series, idx, params) {
        state.counters.sell_blocked_by_direction += 1;
        warn!(symbol = %state.symbol, date = %bar.date, "sell blocked: traditional_downtrend_only");
        return;
    }

    if !profitable {
        state.counters.sell_blocked_by_pnl += 1;
        let reason = "profit requirement not met";
        state.txn_log.push(Transaction::rejected(bar.date, &state.symbol, close, reason));
        warn!(symbol = %state.symbol, date = %bar.date, %avg_cost, %close, "profit gate blocked close");
        return;
    }

    let n_to_close = params.max_lots_to_sell.min(state.lots.len() as u32) as usize;
    let mut shares_closed = Decimal::ZERO;
    let mut cost_closed = Decimal::ZERO;
    for _ in 0..n_to_close {
        let lot = state.lots.remove(0);
        shares_closed += lot.shares;
        cost_closed += lot.cost_basis;
    }
    let value = shares_closed * close - params.per_trade_fee;
    let realized = value - cost_closed;

    state.txn_log.push(Transaction {
        date: bar.date,
        symbol: state.symbol.clone(),
        kind: TransactionKind::TrailingSell,
        price: close,
        shares: shares_closed,
        value,
        lots_affected: Some(n_to_close as u32),
        realized_pnl: Some(realized),
        reason: None,
    });
    state.counters.sell_count += 1;
    state.consecutive_buys_since_last_sell = 0;
    info!(symbol = %state.symbol, date = %bar.date, %close, shares = %shares_closed, realized_pnl = %realized, "closed position");
}

/// Step 3: evaluate the acquiring (opening) side.
fn acquire(
    symbol: &str,
    state: &mut SymbolRunState,
    series: &PriceSeries,
    idx: usize,
    bar: &Bar,
    close: Decimal,
    params: &Params,
    admit: &mut dyn Admit,
) {
    let opening_side_is_buy = params.strategy_mode == StrategyMode::Long;
    let outcome = if opening_side_is_buy {
        stops::step_buy(&mut state.ts_buy, close, params.trailing_stop_order_type)
    } else {
        stops::step_sell(&mut state.ts_sell, close, params.trailing_stop_order_type)
    };

    match outcome {
        StopOutcome::None => {}
        StopOutcome::Cancelled => {
            if opening_side_is_buy {
                state.counters.trailing_buy_cancelled += 1;
            } else {
                state.counters.trailing_sell_cancelled += 1;
            }
            debug!(symbol, date = %bar.date, "opening trailing stop cancelled");
        }
        StopOutcome::Fired => {
            try_open(symbol, state, series, idx, bar, close, params, admit);
        }
    }
}

fn try_open(
    symbol: &str,
    state: &mut SymbolRunState,
    series: &PriceSeries,
    idx: usize,
    bar: &Bar,
    close: Decimal,
    params: &Params,
    admit: &mut dyn Admit,
) {
    if state.lots.len() as u32 >= params.max_lots {
        state.counters.buy_blocked_by_cap += 1;
        warn!(symbol, date = %bar.date, "buy blocked: max lots reached");
        return;
    }

    let effective_grid = effective_grid_percent(params, state.consecutive_buys_since_last_sell);
    if let Some(last_lot) = state.lots.last() {
        let grid_ok = match params.strategy_mode {
            StrategyMode::Long => close <= last_lot.entry_price * decimal_from(1.0 - effective_grid),
            StrategyMode::Short => close >= last_lot.entry_price * decimal_from(1.0 + effective_grid),
        };
        if !grid_ok {
            state.counters.buy_blocked_by_grid += 1;
            warn!(symbol, date = %bar.date, effective_grid, "buy blocked by grid gate");
            return;
        }
    }

    if params.momentum_based_buy && !state.lots.is_empty() {
        if let Some(avg_cost) = state.avg_cost() {
            let position_profitable = match params.strategy_mode {
                StrategyMode::Long => close > avg_cost,
                StrategyMode::Short => close < avg_cost,
            };
            if !position_profitable {
                state.counters.buy_blocked_by_momentum += 1;
                warn!(symbol, date = %bar.date, "buy blocked by momentum gate");
                return;
            }
        }
    }

    if !params.enable_adaptive_trailing_buy && short_term_uptrend(series, idx, params) {
        state.counters.buy_blocked_by_direction += 1;
        warn!(symbol, date = %bar.date, "buy blocked: traditional_downtrend_only");
        return;
    }

    let shares = if close > Decimal::ZERO {
        params.lot_size_usd / close
    } else {
        return;
    };
    let amount = shares * close + params.per_trade_fee;

    if !admit.admit(symbol, bar.date, amount) {
        state.counters.buy_rejected_by_capital += 1;
        state
            .txn_log
            .push(Transaction::rejected(bar.date, symbol, close, "insufficient capital"));
        warn!(symbol, date = %bar.date, %amount, "buy rejected by capital gate");
        return;
    }

    state.lots.push(Lot::new(bar.date, close, shares));
    state.txn_log.push(Transaction {
        date: bar.date,
        symbol: symbol.to_string(),
        kind: TransactionKind::TrailingBuy,
        price: close,
        shares,
        value: amount,
        lots_affected: Some(1),
        realized_pnl: None,
        reason: None,
    });
    state.counters.buy_count += 1;
    state.consecutive_buys_since_last_sell += 1;
    info!(symbol, date = %bar.date, %close, %shares, "opened lot");
}

/// Step 4: re-arm whichever side is currently inactive.
fn re_arm(state: &mut SymbolRunState, close: Decimal, params: &Params) {
    stops::try_arm_buy(
        &mut state.ts_buy,
        close,
        state.recent_peak,
        params.trailing_buy_activation_percent,
        params.trailing_buy_rebound_percent,
    );
    stops::try_arm_sell(
        &mut state.ts_sell,
        close,
        state.recent_trough,
        params.trailing_sell_activation_percent,
        params.trailing_sell_pullback_percent,
    );
}

/// Grid spacing widened by a sqrt-scaled dynamic factor and/or a linear
/// consecutive-buy increment (spec §4.2.2).
pub fn effective_grid_percent(params: &Params, consecutive_buys: u32) -> f64 {
    let mut grid = params.grid_interval_percent;
    if params.enable_dynamic_grid {
        grid *= params.dynamic_grid_multiplier * ((consecutive_buys as f64) + 1.0).sqrt();
    }
    if params.enable_consecutive_incremental_buy_grid {
        grid *= 1.0 + params.grid_consecutive_increment * consecutive_buys as f64;
    }
    grid
}

/// Profit requirement widened by the same consecutive-buy increment when
/// `enableConsecutiveIncrementalSellProfit` is set.
pub fn effective_profit_requirement(params: &Params, consecutive_buys: u32) -> f64 {
    let mut req = params.profit_requirement;
    if params.enable_consecutive_incremental_sell_profit {
        req *= 1.0 + params.grid_consecutive_increment * consecutive_buys as f64;
    }
    req
}

/// Directional gate signal (§4.2.1.3.d): price above its trailing SMA reads
/// as a short-term uptrend. With no history yet to compute the average the
/// gate has nothing to block on, so it reads as "not an uptrend".
fn short_term_uptrend(series: &PriceSeries, idx: usize, params: &Params) -> bool {
    match trailing_sma(series, idx, params.use_adjusted_close) {
        Some(avg) => series[idx].decision_price(params.use_adjusted_close) > avg,
        None => false,
    }
}

/// Only take profit into a confirmed short-term downtrend, so a close that
/// fires the trailing stop mid-rally doesn't cut a winner short.
fn momentum_confirms_close(series: &PriceSeries, idx: usize, params: &Params) -> bool {
    match trailing_sma(series, idx, params.use_adjusted_close) {
        Some(avg) => series[idx].decision_price(params.use_adjusted_close) <= avg,
        None => true,
    }
}

fn trailing_sma(series: &PriceSeries, idx: usize, use_adjusted: bool) -> Option<Decimal> {
    if idx + 1 < MOMENTUM_WINDOW {
        return None;
    }
    let start = idx + 1 - MOMENTUM_WINDOW;
    let sum: Decimal = series[start..=idx].iter().map(|b| b.decision_price(use_adjusted)).sum();
    Some(sum / Decimal::from(MOMENTUM_WINDOW as u64))
}

fn decimal_from(f: f64) -> Decimal {
    Decimal::from_f64_retain(f).unwrap_or(Decimal::ONE)
}

/// Buy-and-hold comparison baseline (spec §4.2's RunSummary companion figure).
pub(crate) fn buy_and_hold_baseline(series: &PriceSeries, params: &Params) -> BuyAndHoldBaseline {
    let (Some(first), Some(last)) = (series.first(), series.last()) else {
        return BuyAndHoldBaseline::default();
    };
    let entry = first.decision_price(params.use_adjusted_close);
    if entry <= Decimal::ZERO {
        return BuyAndHoldBaseline::default();
    }
    let exit = last.decision_price(params.use_adjusted_close);
    let total_return = ((exit - entry) / entry).to_string().parse::<f64>().unwrap_or(0.0);

    let years = (series.len() as f64 / 252.0).max(1.0 / 252.0);
    let cagr = if total_return > -1.0 {
        (1.0 + total_return).powf(1.0 / years) - 1.0
    } else {
        -1.0
    };

    let mut peak = entry;
    let mut max_drawdown = 0.0_f64;
    for bar in series {
        let p = bar.decision_price(params.use_adjusted_close);
        if p > peak {
            peak = p;
        }
        if peak > Decimal::ZERO {
            let dd = ((peak - p) / peak).to_string().parse::<f64>().unwrap_or(0.0);
            if dd > max_drawdown {
                max_drawdown = dd;
            }
        }
    }

    BuyAndHoldBaseline {
        total_return,
        cagr,
        max_drawdown,
    }
}
