//! Trailing-stop state machines (spec §4.1).
//!
//! Two independent machines per symbol, buy and sell. The sell machine is
//! the buy machine's mirror image (invert inequalities, swap peak/trough),
//! so the two halves of this file read in lockstep on purpose.
//!
//! `recentPeakReference` / `recentBottomReference` are captured at arming
//! time (spec §3.3/§3.4) from the continuously-tracked `recent_peak`/
//! `recent_trough` the engine passes in, and stay fixed for the life of that
//! one armed episode. They aren't stale, though: every re-arm (including the
//! same-day re-arm that follows a cancellation, spec §4.1's "inactive ->
//! armed") recaptures them from whatever the running peak/trough has grown
//! to by then, so the reference a cancellation is checked against is always
//! the most recent one established while the order has been continuously
//! armed. Freezing it *within* an episode is what makes the cancel check
//! mean anything: since the reference starts out as the running peak at arm
//! time, any later close that is itself a new high is, by construction, also
//! a close above that reference — if the reference tracked new highs too,
//! "close > reference" could never hold and limit mode would never cancel.

use rust_decimal::Decimal;

use crate::types::{
    ArmedBuyParams, ArmedSellParams, TrailingBuyState, TrailingSellState, TrailingStopOrderType,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    None,
    Cancelled,
    Fired,
}

// ─── Buy side ───────────────────────────────────────────────────────────────

/// Advance the buy machine by one day. Must be called after the day's
/// `recent_peak`/`recent_trough` observe-update (spec §4.1 step 1), and
/// before the re-arm step (step 4).
///
/// Order of checks while armed, matching the transition list in spec §4.1:
/// update trough, then cancel (limit only), then fire.
pub fn step_buy(state: &mut TrailingBuyState, close: Decimal, order_type: TrailingStopOrderType) -> StopOutcome {
    let (recent_peak_reference, recent_trough_since_armed) = match state {
        TrailingBuyState::Inactive => return StopOutcome::None,
        TrailingBuyState::Armed {
            recent_peak_reference,
            recent_trough_since_armed,
            ..
        } => (*recent_peak_reference, recent_trough_since_armed),
    };

    if close < *recent_trough_since_armed {
        *recent_trough_since_armed = close;
    }
    let trough = *recent_trough_since_armed;

    if order_type == TrailingStopOrderType::Limit && close > recent_peak_reference {
        *state = TrailingBuyState::Inactive;
        return StopOutcome::Cancelled;
    }

    if close >= trough * rebound_factor(state) {
        *state = TrailingBuyState::Inactive;
        return StopOutcome::Fired;
    }

    StopOutcome::None
}

fn rebound_factor(state: &TrailingBuyState) -> Decimal {
    match state {
        TrailingBuyState::Armed { captured, .. } => {
            Decimal::from_f64_retain(1.0 + captured.rebound_percent).unwrap_or(Decimal::ONE)
        }
        TrailingBuyState::Inactive => Decimal::ONE,
    }
}

/// Arm the buy machine if currently inactive and the activation threshold
/// holds at `close` (spec §4.1 "inactive -> armed").
pub fn try_arm_buy(
    state: &mut TrailingBuyState,
    close: Decimal,
    recent_peak: Decimal,
    activation_percent: f64,
    rebound_percent: f64,
) {
    if !matches!(state, TrailingBuyState::Inactive) {
        return;
    }
    let threshold = recent_peak * activation_factor_down(activation_percent);
    if close <= threshold {
        *state = TrailingBuyState::Armed {
            recent_peak_reference: recent_peak,
            recent_trough_since_armed: close,
            captured: ArmedBuyParams {
                activation_percent,
                rebound_percent,
            },
        };
    }
}

// ─── Sell side (mirror) ─────────────────────────────────────────────────────

pub fn step_sell(state: &mut TrailingSellState, close: Decimal, order_type: TrailingStopOrderType) -> StopOutcome {
    let (recent_bottom_reference, recent_peak_since_armed) = match state {
        TrailingSellState::Inactive => return StopOutcome::None,
        TrailingSellState::Armed {
            recent_bottom_reference,
            recent_peak_since_armed,
            ..
        } => (*recent_bottom_reference, recent_peak_since_armed),
    };

    if close > *recent_peak_since_armed {
        *recent_peak_since_armed = close;
    }
    let peak = *recent_peak_since_armed;

    if order_type == TrailingStopOrderType::Limit && close < recent_bottom_reference {
        *state = TrailingSellState::Inactive;
        return StopOutcome::Cancelled;
    }

    if close <= peak * pullback_factor(state) {
        *state = TrailingSellState::Inactive;
        return StopOutcome::Fired;
    }

    StopOutcome::None
}

fn pullback_factor(state: &TrailingSellState) -> Decimal {
    match state {
        TrailingSellState::Armed { captured, .. } => {
            Decimal::from_f64_retain(1.0 - captured.pullback_percent).unwrap_or(Decimal::ONE)
        }
        TrailingSellState::Inactive => Decimal::ONE,
    }
}

pub fn try_arm_sell(
    state: &mut TrailingSellState,
    close: Decimal,
    recent_trough: Decimal,
    activation_percent: f64,
    pullback_percent: f64,
) {
    if !matches!(state, TrailingSellState::Inactive) {
        return;
    }
    let threshold = recent_trough * activation_factor_up(activation_percent);
    if close >= threshold {
        *state = TrailingSellState::Armed {
            recent_bottom_reference: recent_trough,
            recent_peak_since_armed: close,
            captured: ArmedSellParams {
                activation_percent,
                pullback_percent,
            },
        };
    }
}

// ─── Shared helpers ──────────────────────────────────────────────────────────

fn activation_factor_down(activation_percent: f64) -> Decimal {
    Decimal::from_f64_retain(1.0 - activation_percent).unwrap_or(Decimal::ONE)
}

fn activation_factor_up(activation_percent: f64) -> Decimal {
    Decimal::from_f64_retain(1.0 + activation_percent).unwrap_or(Decimal::ONE)
}
