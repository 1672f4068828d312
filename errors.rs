//! Error taxonomy for the DCA backtest engine.
//!
//! Mirrors the source repository's split between a typed library error and
//! an `anyhow`-wrapped CLI boundary: the engine itself never deals in
//! `anyhow`, only `EngineError`.

use chrono::NaiveDate;
use rust_decimal::Decimal;

/// All fatal/terminal conditions the engine can surface.
///
/// `OrderRejected` is deliberately absent: gate and admission failures are
/// data (`Transaction::Rejected`), not errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {message} (field: {field})")]
    Validation { field: String, message: String },

    #[error("no price data for symbol {symbol}")]
    MissingPriceData { symbol: String },

    #[error(
        "capital leak detected on {day}: deployed={deployed} cash={cash} total={total} delta={delta}"
    )]
    CapitalLeak {
        day: NaiveDate,
        deployed: Decimal,
        cash: Decimal,
        total: Decimal,
        delta: Decimal,
        symbols: Vec<String>,
    },

    #[error("run cancelled after {last_completed_day:?}")]
    Cancelled {
        last_completed_day: Option<NaiveDate>,
    },

    #[error("deadline exceeded after {last_completed_day:?}")]
    DeadlineExceeded {
        last_completed_day: Option<NaiveDate>,
    },

    #[error("internal invariant violated: {message}")]
    InternalInvariant {
        message: String,
        snapshot: String,
    },
}

impl EngineError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Exit code per the CLI surface documented in spec §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Validation { .. } => 1,
            EngineError::Cancelled { .. } | EngineError::DeadlineExceeded { .. } => 3,
            EngineError::MissingPriceData { .. }
            | EngineError::CapitalLeak { .. }
            | EngineError::InternalInvariant { .. } => 2,
        }
    }
}
