use crate::portfolio::WeightSampling;
use crate::repository::{MissingSymbolPolicy, RepositoryConfig};
use rayon::ThreadPoolBuilder;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

/// Annual trading days for annualization.
pub const TRADING_DAYS: f64 = 252.0;

/// Inclusive bounds on the number of random portfolios per run.
pub const MIN_SAMPLES: usize = 100;
pub const MAX_SAMPLES: usize = 10_000;
pub const DEFAULT_SAMPLES: usize = 5_000;

/// Portfolio optimization is meaningless with fewer assets.
pub const MIN_SYMBOLS: usize = 2;

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;
/// Calendar days fetched before the window start so forward-fill has a seed.
pub const DEFAULT_FETCH_LOOKBACK_DAYS: i64 = 10;
/// Longest run of consecutive missing rows forward-fill may cover.
pub const DEFAULT_MAX_FILL_GAP: usize = 5;
/// Share of in-window rows a symbol may still be missing after forward-fill.
pub const DEFAULT_MAX_MISSING_RATIO: f64 = 0.5;

pub const DEFAULT_WEBUI_PORT: u16 = 8080;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataProviderMode {
    Polygon,
    Yfinance,
}

impl DataProviderMode {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "polygon" => Self::Polygon,
            "yfinance" | "yahoo" => Self::Yfinance,
            other => {
                warn!(
                    "Unknown FRONTIER_DATA_PROVIDER={} ; defaulting to yfinance. Allowed values: polygon | yfinance",
                    other
                );
                Self::Yfinance
            }
        }
    }
}

/// Runtime settings resolved from the environment. CLI flags override these.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub provider: DataProviderMode,
    pub polygon_api_key: Option<String>,
    pub fetch_timeout: Duration,
    pub repository: RepositoryConfig,
    pub sampling: WeightSampling,
    pub seed: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: DataProviderMode::Yfinance,
            polygon_api_key: None,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            repository: RepositoryConfig::default(),
            sampling: WeightSampling::default(),
            seed: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let provider = var("FRONTIER_DATA_PROVIDER")
            .map(|v| DataProviderMode::parse(&v))
            .unwrap_or(DataProviderMode::Yfinance);

        let fetch_timeout_secs = var("FRONTIER_FETCH_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 120))
            .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);

        let lookback_days = var("FRONTIER_FETCH_LOOKBACK_DAYS")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|v| v.clamp(0, 60))
            .unwrap_or(DEFAULT_FETCH_LOOKBACK_DAYS);

        let max_fill_gap = var("FRONTIER_MAX_FILL_GAP")
            .and_then(|v| v.parse::<usize>().ok())
            .map(|v| v.clamp(0, 30))
            .unwrap_or(DEFAULT_MAX_FILL_GAP);

        let max_missing_ratio = var("FRONTIER_MAX_MISSING_RATIO")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 1.0))
            .unwrap_or(DEFAULT_MAX_MISSING_RATIO);

        let missing_symbols = match var("FRONTIER_MISSING_SYMBOL_POLICY") {
            Some(raw) => raw.parse::<MissingSymbolPolicy>().unwrap_or_else(|e| {
                warn!("{}; defaulting to drop", e);
                MissingSymbolPolicy::Drop
            }),
            None => MissingSymbolPolicy::Drop,
        };

        let sampling = match var("FRONTIER_SAMPLER") {
            Some(raw) => raw.parse::<WeightSampling>().unwrap_or_else(|e| {
                warn!("{}; defaulting to dirichlet", e);
                WeightSampling::Dirichlet
            }),
            None => WeightSampling::Dirichlet,
        };

        let seed = var("FRONTIER_SEED").and_then(|v| match v.parse::<u64>() {
            Ok(seed) => Some(seed),
            Err(_) => {
                warn!("Ignoring non-numeric FRONTIER_SEED={}", v);
                None
            }
        });

        Self {
            provider,
            polygon_api_key: var("POLYGON_API_KEY"),
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
            repository: RepositoryConfig {
                missing_symbols,
                lookback_days,
                max_fill_gap,
                max_missing_ratio,
            },
            sampling,
            seed,
        }
    }
}

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> AppConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let cfg = config_from(&[]);
        assert_eq!(cfg.provider, DataProviderMode::Yfinance);
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS));
        assert_eq!(cfg.repository.missing_symbols, MissingSymbolPolicy::Drop);
        assert_eq!(cfg.repository.max_fill_gap, DEFAULT_MAX_FILL_GAP);
        assert_eq!(cfg.sampling, WeightSampling::Dirichlet);
        assert!(cfg.seed.is_none());
        assert!(cfg.polygon_api_key.is_none());
    }

    #[test]
    fn test_env_values_are_trimmed_and_clamped() {
        let cfg = config_from(&[
            ("FRONTIER_DATA_PROVIDER", " Polygon "),
            ("POLYGON_API_KEY", "  key123 "),
            ("FRONTIER_FETCH_TIMEOUT_SECS", "9999"),
            ("FRONTIER_MAX_MISSING_RATIO", "1.7"),
            ("FRONTIER_MISSING_SYMBOL_POLICY", "ABORT"),
            ("FRONTIER_SAMPLER", "normalized"),
            ("FRONTIER_SEED", "42"),
        ]);
        assert_eq!(cfg.provider, DataProviderMode::Polygon);
        assert_eq!(cfg.polygon_api_key.as_deref(), Some("key123"));
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(120));
        assert_eq!(cfg.repository.max_missing_ratio, 1.0);
        assert_eq!(cfg.repository.missing_symbols, MissingSymbolPolicy::Abort);
        assert_eq!(cfg.sampling, WeightSampling::Normalized);
        assert_eq!(cfg.seed, Some(42));
    }

    #[test]
    fn test_garbage_falls_back_to_defaults() {
        let cfg = config_from(&[
            ("FRONTIER_DATA_PROVIDER", "bloomberg"),
            ("FRONTIER_MAX_FILL_GAP", "lots"),
            ("FRONTIER_MISSING_SYMBOL_POLICY", "maybe"),
            ("FRONTIER_SEED", "-3"),
        ]);
        assert_eq!(cfg.provider, DataProviderMode::Yfinance);
        assert_eq!(cfg.repository.max_fill_gap, DEFAULT_MAX_FILL_GAP);
        assert_eq!(cfg.repository.missing_symbols, MissingSymbolPolicy::Drop);
        assert!(cfg.seed.is_none());
    }
}
