//! Monte Carlo approximation of the mean-variance efficient frontier.
//!
//! [`PriceRepository`] turns ticker symbols and a date window into a clean
//! [`PriceTable`]; [`PortfolioSimulator`] samples random long-only portfolios
//! over that table and picks the max-Sharpe, min-variance and max-return ones.

pub mod config;
pub mod data;
pub mod error;
pub mod portfolio;
pub mod provider;
pub mod repository;
pub mod webui;

pub use config::AppConfig;
pub use data::{DataQuality, PriceTable, Symbol};
pub use error::{FrontierError, Result};
pub use portfolio::{
    OptimalSet, PortfolioSample, PortfolioSimulator, SimulationConfig, SimulationResult,
    WeightSampling,
};
pub use provider::{MemoryProvider, PolygonProvider, PriceProvider, Provider, YahooProvider};
pub use repository::{MissingSymbolPolicy, PriceRepository, RepositoryConfig};
