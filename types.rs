//! Core data model: bars, lots, parameter set, transaction records, and the
//! per-symbol / portfolio run state that the engine threads through a run.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ─── Daily bar ─────────────────────────────────────────────────────────────

/// One daily OHLC(+adjusted close) observation for a symbol.
///
/// Invariant: `low <= open, close <= high` and `adjusted_close > 0`. Callers
/// constructing bars from a `PriceProvider` are expected to uphold this; the
/// engine does not re-validate it on every bar (see `Params::use_adjusted_close`
/// for which price drives decisions).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub adjusted_close: Decimal,
}

impl Bar {
    /// The price the engine uses to make decisions for this day.
    #[inline]
    pub fn decision_price(&self, use_adjusted: bool) -> Decimal {
        if use_adjusted {
            self.adjusted_close
        } else {
            self.close
        }
    }
}

pub type PriceSeries = Vec<Bar>;

// ─── Lots ──────────────────────────────────────────────────────────────────

/// A single open long lot (or, in short mode, a single open short cover).
/// Closed FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    pub entry_date: NaiveDate,
    pub entry_price: Decimal,
    pub shares: Decimal,
    pub cost_basis: Decimal,
}

impl Lot {
    pub fn new(entry_date: NaiveDate, entry_price: Decimal, shares: Decimal) -> Self {
        Self {
            entry_date,
            entry_price,
            shares,
            cost_basis: entry_price * shares,
        }
    }
}

// ─── Strategy-wide enums ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    Long,
    Short,
}

impl Default for StrategyMode {
    fn default() -> Self {
        StrategyMode::Long
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingStopOrderType {
    Limit,
    Market,
}

impl Default for TrailingStopOrderType {
    fn default() -> Self {
        TrailingStopOrderType::Limit
    }
}

// ─── Trailing-stop state (buy side) ────────────────────────────────────────

/// Parameters captured at arming time so a later change to `Params` cannot
/// retroactively affect an already-open order (spec §3.3).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArmedBuyParams {
    pub activation_percent: f64,
    pub rebound_percent: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TrailingBuyState {
    Inactive,
    Armed {
        recent_peak_reference: Decimal,
        recent_trough_since_armed: Decimal,
        captured: ArmedBuyParams,
    },
}

impl Default for TrailingBuyState {
    fn default() -> Self {
        TrailingBuyState::Inactive
    }
}

/// Mirror of `ArmedBuyParams` for the sell side.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArmedSellParams {
    pub activation_percent: f64,
    pub pullback_percent: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TrailingSellState {
    Inactive,
    Armed {
        recent_bottom_reference: Decimal,
        recent_peak_since_armed: Decimal,
        captured: ArmedSellParams,
    },
}

impl Default for TrailingSellState {
    fn default() -> Self {
        TrailingSellState::Inactive
    }
}

// ─── Parameter set ──────────────────────────────────────────────────────────

/// Immutable configuration for one run. Constructed once (see `config.rs`'s
/// merge logic) and never mutated for the duration of a run (spec §3.7
/// "Lifecycle").
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub lot_size_usd: Decimal,
    pub max_lots: u32,
    pub max_lots_to_sell: u32,

    pub grid_interval_percent: f64,
    pub profit_requirement: f64,

    pub trailing_buy_activation_percent: f64,
    pub trailing_buy_rebound_percent: f64,
    pub trailing_sell_activation_percent: f64,
    pub trailing_sell_pullback_percent: f64,
    pub trailing_stop_order_type: TrailingStopOrderType,

    pub enable_dynamic_grid: bool,
    pub normalize_to_reference: bool,
    pub dynamic_grid_multiplier: f64,

    pub enable_consecutive_incremental_buy_grid: bool,
    pub grid_consecutive_increment: f64,
    pub enable_consecutive_incremental_sell_profit: bool,

    pub enable_adaptive_trailing_buy: bool,
    pub enable_adaptive_trailing_sell: bool,

    pub momentum_based_buy: bool,
    pub momentum_based_sell: bool,

    pub strategy_mode: StrategyMode,

    /// Use `adjusted_close` instead of `close` as the decision price.
    pub use_adjusted_close: bool,

    /// Reserved hooks (spec §4.3.3 / §9): off by default, no mechanism yet.
    pub enable_deferred_selling: bool,
    pub deferred_selling_max_age_days: u32,
    pub enable_adaptive_lot_sizing: bool,
    pub enable_cash_yield: bool,

    /// Flat per-trade fee, if any (spec §1 non-goals: no tax/commission
    /// modeling beyond this).
    pub per_trade_fee: Decimal,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            lot_size_usd: Decimal::new(1000, 0),
            max_lots: 10,
            max_lots_to_sell: 1,

            grid_interval_percent: 0.10,
            profit_requirement: 0.05,

            trailing_buy_activation_percent: 0.05,
            trailing_buy_rebound_percent: 0.03,
            trailing_sell_activation_percent: 0.05,
            trailing_sell_pullback_percent: 0.03,
            trailing_stop_order_type: TrailingStopOrderType::Limit,

            enable_dynamic_grid: false,
            normalize_to_reference: false,
            dynamic_grid_multiplier: 1.0,

            enable_consecutive_incremental_buy_grid: false,
            grid_consecutive_increment: 0.0,
            enable_consecutive_incremental_sell_profit: false,

            enable_adaptive_trailing_buy: true,
            enable_adaptive_trailing_sell: true,

            momentum_based_buy: false,
            momentum_based_sell: false,

            strategy_mode: StrategyMode::Long,
            use_adjusted_close: false,

            enable_deferred_selling: false,
            deferred_selling_max_age_days: 0,
            enable_adaptive_lot_sizing: false,
            enable_cash_yield: false,

            per_trade_fee: Decimal::ZERO,
        }
    }
}

// ─── Transaction log ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Buy,
    Sell,
    TrailingBuy,
    TrailingSell,
    Rejected,
    Liquidation,
}

/// One entry in the append-only transaction log. A tagged union rather than
/// a bag of optional fields, because consumers pattern-match to aggregate
/// (spec §9).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub date: NaiveDate,
    pub symbol: String,
    pub kind: TransactionKind,
    pub price: Decimal,
    pub shares: Decimal,
    pub value: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lots_affected: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Transaction {
    pub fn rejected(date: NaiveDate, symbol: &str, price: Decimal, reason: &str) -> Self {
        Self {
            date,
            symbol: symbol.to_string(),
            kind: TransactionKind::Rejected,
            price,
            shares: Decimal::ZERO,
            value: Decimal::ZERO,
            lots_affected: None,
            realized_pnl: None,
            reason: Some(reason.to_string()),
        }
    }
}

// ─── Counters ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub buy_count: u64,
    pub sell_count: u64,
    pub buy_blocked_by_grid: u64,
    pub buy_blocked_by_momentum: u64,
    pub buy_blocked_by_direction: u64,
    pub buy_blocked_by_cap: u64,
    pub buy_rejected_by_capital: u64,
    pub sell_blocked_by_pnl: u64,
    pub sell_blocked_by_direction: u64,
    pub sell_blocked_by_momentum: u64,
    pub trailing_buy_cancelled: u64,
    pub trailing_sell_cancelled: u64,
}

// ─── Per-symbol run state ───────────────────────────────────────────────────

/// Everything the single-symbol engine threads through a run, plus what the
/// portfolio coordinator additionally needs (indices/ids, never back-pointers
/// to the portfolio — spec §9 "Loop-carried state, cyclic references").
#[derive(Clone, Debug)]
pub struct SymbolRunState {
    pub symbol: String,
    pub lots: Vec<Lot>,
    pub ts_buy: TrailingBuyState,
    pub ts_sell: TrailingSellState,
    pub recent_peak: Decimal,
    pub recent_trough: Decimal,
    pub consecutive_buys_since_last_sell: u32,
    pub txn_log: Vec<Transaction>,
    pub counters: Counters,
}

impl SymbolRunState {
    pub fn new(symbol: &str, first_price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            lots: Vec::new(),
            ts_buy: TrailingBuyState::Inactive,
            ts_sell: TrailingSellState::Inactive,
            recent_peak: first_price,
            recent_trough: first_price,
            consecutive_buys_since_last_sell: 0,
            txn_log: Vec::new(),
            counters: Counters::default(),
        }
    }

    pub fn open_shares(&self) -> Decimal {
        self.lots.iter().map(|l| l.shares).sum()
    }

    pub fn open_cost_basis(&self) -> Decimal {
        self.lots.iter().map(|l| l.cost_basis).sum()
    }

    /// Average cost per share over all open lots. `None` if no open lots or
    /// zero shares (division-by-zero guard, spec §4.2.4).
    pub fn avg_cost(&self) -> Option<Decimal> {
        let shares = self.open_shares();
        if shares.is_zero() {
            None
        } else {
            Some(self.open_cost_basis() / shares)
        }
    }
}

// ─── Summary / run output ───────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BuyAndHoldBaseline {
    pub total_return: f64,
    pub cagr: f64,
    pub max_drawdown: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_return: f64,
    pub time_weighted_return: f64,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub max_drawdown: f64,
    pub counters: Counters,
    pub buy_and_hold: BuyAndHoldBaseline,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SingleRunResult {
    pub symbol: String,
    pub transactions: Vec<Transaction>,
    pub open_lots: Vec<Lot>,
    pub end_date: Option<NaiveDate>,
    pub summary: RunSummary,
}

// ─── Portfolio ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rejection {
    pub date: NaiveDate,
    pub symbol: String,
    pub required: Decimal,
    pub available: Decimal,
    pub reason: String,
}

/// Reserved hook for spec §4.3.3; not exercised while
/// `enable_deferred_selling` is off (the default).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeferredSell {
    pub symbol: String,
    pub queued_date: NaiveDate,
    pub age_days: u32,
}

#[derive(Clone, Debug)]
pub struct PortfolioState {
    pub total_capital: Decimal,
    pub cash_reserve: Decimal,
    pub deployed_capital: Decimal,
    pub symbol_states: std::collections::BTreeMap<String, SymbolRunState>,
    pub rejected_orders: Vec<Rejection>,
    pub deferred_sells: Vec<DeferredSell>,
    pub capital_time_series: Vec<(NaiveDate, Decimal, Decimal)>, // (date, cash, deployed)
}

impl PortfolioState {
    pub fn new(total_capital: Decimal) -> Self {
        Self {
            total_capital,
            cash_reserve: total_capital,
            deployed_capital: Decimal::ZERO,
            symbol_states: std::collections::BTreeMap::new(),
            rejected_orders: Vec::new(),
            deferred_sells: Vec::new(),
            capital_time_series: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortfolioResult {
    pub per_symbol: std::collections::BTreeMap<String, SingleRunResult>,
    pub rejected_orders: Vec<Rejection>,
    pub skipped_symbols: Vec<String>,
    pub capital_time_series: Vec<(NaiveDate, Decimal, Decimal)>,
    pub cancelled: bool,
    pub deadline_exceeded: bool,
}
