//! Price acquisition and cleaning.
//!
//! `load` runs three stages that can also be driven one at a time:
//! `fetch` -> `clean` -> `filter`. Each stage consumes the previous stage's
//! output, so they cannot be called out of order.

use crate::config::{
    DEFAULT_FETCH_LOOKBACK_DAYS, DEFAULT_MAX_FILL_GAP, DEFAULT_MAX_MISSING_RATIO, MIN_SYMBOLS,
};
use crate::data::{
    check_window, DataQuality, DropReason, DroppedSymbol, PriceSeries, PriceTable, Symbol,
};
use crate::error::{FrontierError, Result};
use crate::provider::PriceProvider;
use chrono::{Duration, NaiveDate};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use tracing::{info, warn};

/// What to do when the provider has no data for one of the requested symbols.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingSymbolPolicy {
    /// Warn, record the symbol as dropped and continue with the rest.
    #[default]
    Drop,
    /// Fail the whole request with `SymbolNotFound`.
    Abort,
}

impl FromStr for MissingSymbolPolicy {
    type Err = FrontierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "abort" => Ok(Self::Abort),
            other => Err(FrontierError::invalid_input(
                "missing symbol policy",
                format!("unknown policy '{}', expected drop | abort", other),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RepositoryConfig {
    pub missing_symbols: MissingSymbolPolicy,
    /// Calendar days fetched before the window start.
    pub lookback_days: i64,
    /// Longest run of consecutive rows one observation may be carried over.
    pub max_fill_gap: usize,
    /// Symbols missing more than this share of in-window rows are dropped.
    pub max_missing_ratio: f64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            missing_symbols: MissingSymbolPolicy::Drop,
            lookback_days: DEFAULT_FETCH_LOOKBACK_DAYS,
            max_fill_gap: DEFAULT_MAX_FILL_GAP,
            max_missing_ratio: DEFAULT_MAX_MISSING_RATIO,
        }
    }
}

/// Output of the fetch stage: one raw series per surviving symbol.
#[derive(Clone, Debug)]
pub struct FetchedPrices {
    start: NaiveDate,
    end: NaiveDate,
    series: Vec<PriceSeries>,
    quality: DataQuality,
}

impl FetchedPrices {
    pub fn series(&self) -> &[PriceSeries] {
        &self.series
    }

    pub fn quality(&self) -> &DataQuality {
        &self.quality
    }
}

/// Output of the clean stage: an aligned table whose index may still extend
/// before the requested window.
#[derive(Clone, Debug)]
pub struct CleanedPrices {
    start: NaiveDate,
    end: NaiveDate,
    table: PriceTable,
}

impl CleanedPrices {
    pub fn table(&self) -> &PriceTable {
        &self.table
    }
}

pub struct PriceRepository<P> {
    provider: P,
    config: RepositoryConfig,
}

impl<P: PriceProvider + Sync> PriceRepository<P> {
    pub fn new(provider: P, config: RepositoryConfig) -> Self {
        Self { provider, config }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Fetch, clean and filter in one call.
    pub async fn load(
        &self,
        symbols: &[Symbol],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceTable> {
        let fetched = self.fetch(symbols, start, end).await?;
        let cleaned = self.clean(fetched)?;
        self.filter(cleaned)
    }

    /// Requests every symbol concurrently. Input is validated before any
    /// request is issued.
    pub async fn fetch(
        &self,
        symbols: &[Symbol],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchedPrices> {
        if symbols.is_empty() {
            return Err(FrontierError::invalid_input(
                "symbols",
                "at least one symbol is required",
            ));
        }
        check_window(start, end)?;

        let mut seen = HashSet::new();
        let symbols: Vec<&Symbol> = symbols.iter().filter(|s| seen.insert(*s)).collect();
        if symbols.len() < MIN_SYMBOLS {
            return Err(FrontierError::insufficient_data(
                MIN_SYMBOLS,
                symbols.len(),
                "requested symbols",
            ));
        }

        let fetch_start = start - Duration::days(self.config.lookback_days.max(0));
        info!(
            "Fetching {} symbols from {} ({}..{}, window starts {})",
            symbols.len(),
            self.provider.name(),
            fetch_start,
            end,
            start
        );

        let responses = join_all(
            symbols
                .iter()
                .map(|symbol| self.provider.fetch_history(symbol, fetch_start, end)),
        )
        .await;

        let mut quality = DataQuality::default();
        let mut series = Vec::with_capacity(symbols.len());

        for (symbol, response) in symbols.iter().zip(responses) {
            let found = match response {
                Ok(raw) => {
                    quality.discarded_observations += raw.discarded;
                    if raw.series.count_within(start, end) > 0 {
                        Some(raw.series)
                    } else {
                        None
                    }
                }
                Err(FrontierError::SymbolNotFound { .. }) => None,
                Err(err) => return Err(err),
            };

            match found {
                Some(s) => series.push(s),
                None => match self.config.missing_symbols {
                    MissingSymbolPolicy::Abort => {
                        return Err(FrontierError::symbol_not_found(symbol.as_str(), start, end));
                    }
                    MissingSymbolPolicy::Drop => {
                        warn!("{}: no data between {} and {}; dropping", symbol, start, end);
                        quality.dropped.push(DroppedSymbol {
                            symbol: (*symbol).clone(),
                            reason: DropReason::NotFound,
                        });
                    }
                },
            }
        }

        if quality.discarded_observations > 0 {
            warn!(
                "Discarded {} unusable provider observations",
                quality.discarded_observations
            );
        }
        ensure_enough_symbols(series.len(), "symbols with data")?;

        Ok(FetchedPrices {
            start,
            end,
            series,
            quality,
        })
    }

    /// Aligns all series on the union of their dates and repairs gaps with a
    /// bounded forward-fill.
    pub fn clean(&self, fetched: FetchedPrices) -> Result<CleanedPrices> {
        let FetchedPrices {
            start,
            end,
            series,
            mut quality,
        } = fetched;

        let index: Vec<NaiveDate> = series
            .iter()
            .flat_map(|s| s.points().iter().map(|(d, _)| *d))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let in_window = index.iter().filter(|d| **d >= start && **d <= end).count();

        let mut symbols = Vec::new();
        let mut columns = Vec::new();
        for s in &series {
            let mut column = align(s, &index);
            let filled = forward_fill(&mut column, self.config.max_fill_gap);

            let missing = index
                .iter()
                .zip(column.iter())
                .filter(|(d, v)| **d >= start && **d <= end && v.is_none())
                .count();
            let missing_ratio = if in_window == 0 {
                1.0
            } else {
                missing as f64 / in_window as f64
            };

            if missing_ratio > self.config.max_missing_ratio {
                warn!(
                    "{}: {:.1}% of the window still missing after forward-fill; dropping",
                    s.symbol(),
                    missing_ratio * 100.0
                );
                quality.dropped.push(DroppedSymbol {
                    symbol: s.symbol().clone(),
                    reason: DropReason::TooSparse { missing_ratio },
                });
                continue;
            }

            if filled > 0 {
                info!("{}: forward-filled {} missing prices", s.symbol(), filled);
            }
            quality.filled_cells += filled;
            symbols.push(s.symbol().clone());
            columns.push(column);
        }

        ensure_enough_symbols(symbols.len(), "symbols after cleaning")?;

        let mut dates = Vec::with_capacity(index.len());
        let mut rows = Vec::with_capacity(index.len());
        for (t, date) in index.iter().enumerate() {
            let row: Option<Vec<f64>> = columns.iter().map(|c| c[t]).collect();
            match row {
                Some(row) => {
                    dates.push(*date);
                    rows.push(row);
                }
                None => quality.discarded_rows += 1,
            }
        }
        if quality.discarded_rows > 0 {
            info!(
                "Discarded {} dates where a retained symbol had no usable price",
                quality.discarded_rows
            );
        }

        let table = PriceTable::new(symbols, dates, rows)?.with_quality(quality);
        Ok(CleanedPrices { start, end, table })
    }

    /// Restricts the cleaned table to `[start, end]`.
    pub fn filter(&self, cleaned: CleanedPrices) -> Result<PriceTable> {
        let CleanedPrices { start, end, table } = cleaned;
        let (dates, rows): (Vec<NaiveDate>, Vec<Vec<f64>>) = table
            .dates()
            .iter()
            .zip(table.rows().iter())
            .filter(|(d, _)| **d >= start && **d <= end)
            .map(|(d, r)| (*d, r.clone()))
            .unzip();

        if dates.len() < 2 {
            return Err(FrontierError::insufficient_data(
                2,
                dates.len(),
                format!("price rows between {} and {}", start, end),
            ));
        }

        let filtered = PriceTable::new(table.symbols().to_vec(), dates, rows)?
            .with_quality(table.quality().clone());
        info!(
            "Loaded {} rows x {} symbols ({} dropped, {} cells filled)",
            filtered.n_rows(),
            filtered.n_symbols(),
            filtered.quality().dropped.len(),
            filtered.quality().filled_cells
        );
        Ok(filtered)
    }
}

fn ensure_enough_symbols(available: usize, context: &str) -> Result<()> {
    if available < MIN_SYMBOLS {
        return Err(FrontierError::insufficient_data(MIN_SYMBOLS, available, context));
    }
    Ok(())
}

/// Places a series on `index`; dates the series lacks become `None`.
fn align(series: &PriceSeries, index: &[NaiveDate]) -> Vec<Option<f64>> {
    let mut points = series.points().iter().peekable();
    index
        .iter()
        .map(|date| {
            while points.next_if(|(d, _)| d < date).is_some() {}
            points.next_if(|(d, _)| d == date).map(|(_, p)| *p)
        })
        .collect()
}

/// Carries the last observation forward over at most `max_gap` consecutive
/// missing cells. Leading gaps stay missing. Returns the number of cells filled.
fn forward_fill(column: &mut [Option<f64>], max_gap: usize) -> usize {
    let mut last = None;
    let mut gap = 0;
    let mut filled = 0;
    for cell in column.iter_mut() {
        match cell {
            Some(v) => {
                last = Some(*v);
                gap = 0;
            }
            None => {
                gap += 1;
                if gap <= max_gap {
                    if let Some(v) = last {
                        *cell = Some(v);
                        filled += 1;
                    }
                }
            }
        }
    }
    filled
}
