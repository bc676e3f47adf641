//! Error types for frontier-mc.

use chrono::NaiveDate;
use thiserror::Error;

/// Result type alias for frontier-mc operations.
pub type Result<T> = std::result::Result<T, FrontierError>;

/// Failures surfaced by the price repository and the portfolio simulator.
///
/// None of these are retried inside the crate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrontierError {
    /// Malformed or out-of-range caller input.
    #[error("Invalid {field}: {message}")]
    InvalidInput { field: String, message: String },

    /// The provider has no data at all for a symbol.
    #[error("Symbol {symbol} not found for {start}..{end}")]
    SymbolNotFound {
        symbol: String,
        start: NaiveDate,
        end: NaiveDate,
    },

    /// Not enough symbols or rows left to optimize over.
    #[error("Insufficient data for {context}: need at least {required}, got {available}")]
    InsufficientData {
        required: usize,
        available: usize,
        context: String,
    },

    /// Upstream provider unreachable, timed out or returned garbage.
    #[error("Data source error for {symbol}: {message}")]
    DataSource { symbol: String, message: String },
}

impl FrontierError {
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn symbol_not_found(symbol: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self::SymbolNotFound {
            symbol: symbol.into(),
            start,
            end,
        }
    }

    pub fn insufficient_data(required: usize, available: usize, context: impl Into<String>) -> Self {
        Self::InsufficientData {
            required,
            available,
            context: context.into(),
        }
    }

    pub fn data_source(symbol: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataSource {
            symbol: symbol.into(),
            message: message.into(),
        }
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::SymbolNotFound { .. } => "symbol_not_found",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::DataSource { .. } => "data_source",
        }
    }
}
