use crate::error::{FrontierError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Uppercase ticker identifier matching `^[A-Z0-9.\-]+$`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Validates an already-normalized ticker. Surrounding whitespace is ignored,
    /// case is not: `aapl` is rejected.
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FrontierError::invalid_input("symbol", "symbol cannot be empty"));
        }
        let valid = trimmed
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-');
        if !valid {
            return Err(FrontierError::invalid_input(
                "symbol",
                format!(
                    "'{}' may only contain uppercase letters, digits, dots or dashes",
                    trimmed
                ),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Parses user text such as `"aapl, msft,,AAPL"` into unique symbols,
    /// uppercasing each entry and keeping first-seen order.
    pub fn parse_list(raw: &str) -> Result<Vec<Symbol>> {
        Self::from_strings(raw.split(','))
    }

    pub fn from_strings<I, S>(items: I) -> Result<Vec<Symbol>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for item in items {
            let upper = item.as_ref().trim().to_uppercase();
            if upper.is_empty() {
                continue;
            }
            let symbol = Symbol::new(&upper)?;
            if seen.insert(symbol.clone()) {
                out.push(symbol);
            }
        }
        if out.is_empty() {
            return Err(FrontierError::invalid_input(
                "symbols",
                "at least one symbol is required",
            ));
        }
        Ok(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Symbol {
    type Err = FrontierError;

    fn from_str(s: &str) -> Result<Self> {
        Symbol::new(s)
    }
}

impl TryFrom<String> for Symbol {
    type Error = FrontierError;

    fn try_from(value: String) -> Result<Self> {
        Symbol::new(&value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}

/// Parses an ISO-8601 calendar date (`YYYY-MM-DD`).
pub fn parse_date(field: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| {
        FrontierError::invalid_input(field, format!("'{}' is not a YYYY-MM-DD date ({})", raw.trim(), e))
    })
}

/// Rejects windows whose start lies after their end.
pub fn check_window(start: NaiveDate, end: NaiveDate) -> Result<()> {
    if start > end {
        return Err(FrontierError::invalid_input(
            "date range",
            format!("start date {} is after end date {}", start, end),
        ));
    }
    Ok(())
}

fn is_valid_price(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

/// Daily prices for one symbol, dates strictly increasing.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceSeries {
    symbol: Symbol,
    points: Vec<(NaiveDate, f64)>,
}

impl PriceSeries {
    /// Strict constructor: sorts by date, rejects duplicate dates and
    /// non-positive or non-finite prices.
    pub fn new(symbol: Symbol, mut points: Vec<(NaiveDate, f64)>) -> Result<Self> {
        points.sort_by_key(|(date, _)| *date);
        if let Some(w) = points.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(FrontierError::invalid_input(
                "prices",
                format!("duplicate date {} in {} series", w[0].0, symbol),
            ));
        }
        if let Some((date, price)) = points.iter().find(|(_, p)| !is_valid_price(*p)) {
            return Err(FrontierError::invalid_input(
                "prices",
                format!("{} has invalid price {} on {}", symbol, price, date),
            ));
        }
        Ok(Self { symbol, points })
    }

    /// Lenient constructor for raw provider output. Invalid prices are
    /// discarded and a repeated date keeps its last observation. Returns the
    /// series and the number of discarded observations.
    pub fn from_observations(symbol: Symbol, mut points: Vec<(NaiveDate, f64)>) -> (Self, usize) {
        let raw_len = points.len();
        points.retain(|(_, p)| is_valid_price(*p));
        // stable sort keeps provider order within a date, so the last one wins
        points.sort_by_key(|(date, _)| *date);
        let mut deduped: Vec<(NaiveDate, f64)> = Vec::with_capacity(points.len());
        for point in points {
            match deduped.last_mut() {
                Some(last) if last.0 == point.0 => *last = point,
                _ => deduped.push(point),
            }
        }
        let discarded = raw_len - deduped.len();
        (
            Self {
                symbol,
                points: deduped,
            },
            discarded,
        )
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn points(&self) -> &[(NaiveDate, f64)] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of observations dated inside `[start, end]`.
    pub fn count_within(&self, start: NaiveDate, end: NaiveDate) -> usize {
        self.points
            .iter()
            .filter(|(d, _)| *d >= start && *d <= end)
            .count()
    }
}

/// Why a requested symbol is absent from the final table.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    /// Provider returned no observations for the window.
    NotFound,
    /// Still missing this share of in-window rows after forward-fill.
    TooSparse { missing_ratio: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DroppedSymbol {
    pub symbol: Symbol,
    #[serde(flatten)]
    pub reason: DropReason,
}

/// Data-quality record attached to a cleaned table.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DataQuality {
    pub dropped: Vec<DroppedSymbol>,
    /// Cells imputed by forward-fill.
    pub filled_cells: usize,
    /// Union rows removed because a retained symbol had no value there.
    pub discarded_rows: usize,
    /// Provider observations rejected as null, non-positive or duplicated.
    pub discarded_observations: usize,
}

/// Aligned prices: rows are dates (ascending, unique), columns are symbols.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PriceTable {
    symbols: Vec<Symbol>,
    dates: Vec<NaiveDate>,
    rows: Vec<Vec<f64>>,
    quality: DataQuality,
}

impl PriceTable {
    pub fn new(symbols: Vec<Symbol>, dates: Vec<NaiveDate>, rows: Vec<Vec<f64>>) -> Result<Self> {
        let unique: HashSet<&Symbol> = symbols.iter().collect();
        if unique.len() != symbols.len() {
            return Err(FrontierError::invalid_input("price table", "duplicate symbol column"));
        }
        if rows.len() != dates.len() {
            return Err(FrontierError::invalid_input(
                "price table",
                format!("{} dates but {} rows", dates.len(), rows.len()),
            ));
        }
        if dates.windows(2).any(|w| w[0] >= w[1]) {
            return Err(FrontierError::invalid_input(
                "price table",
                "dates must be strictly increasing",
            ));
        }
        for (date, row) in dates.iter().zip(rows.iter()) {
            if row.len() != symbols.len() {
                return Err(FrontierError::invalid_input(
                    "price table",
                    format!("row {} has {} cells, expected {}", date, row.len(), symbols.len()),
                ));
            }
            if let Some(bad) = row.iter().find(|p| !is_valid_price(**p)) {
                return Err(FrontierError::invalid_input(
                    "price table",
                    format!("invalid price {} on {}", bad, date),
                ));
            }
        }
        Ok(Self {
            symbols,
            dates,
            rows,
            quality: DataQuality::default(),
        })
    }

    /// Column-major convenience constructor.
    pub fn from_columns(
        symbols: Vec<Symbol>,
        dates: Vec<NaiveDate>,
        columns: Vec<Vec<f64>>,
    ) -> Result<Self> {
        if columns.len() != symbols.len() {
            return Err(FrontierError::invalid_input(
                "price table",
                format!("{} symbols but {} columns", symbols.len(), columns.len()),
            ));
        }
        if let Some(col) = columns.iter().find(|c| c.len() != dates.len()) {
            return Err(FrontierError::invalid_input(
                "price table",
                format!("column has {} values, expected {}", col.len(), dates.len()),
            ));
        }
        let rows = (0..dates.len())
            .map(|t| columns.iter().map(|c| c[t]).collect())
            .collect();
        Self::new(symbols, dates, rows)
    }

    pub fn with_quality(mut self, quality: DataQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn quality(&self) -> &DataQuality {
        &self.quality
    }

    pub fn n_rows(&self) -> usize {
        self.dates.len()
    }

    pub fn n_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn column(&self, j: usize) -> Vec<f64> {
        self.rows.iter().map(|row| row[j]).collect()
    }

    /// Daily fractional returns, `price[t] / price[t-1] - 1`.
    pub fn returns(&self) -> ReturnMatrix {
        let rows = self
            .rows
            .windows(2)
            .map(|w| {
                w[1].iter()
                    .zip(w[0].iter())
                    .map(|(curr, prev)| curr / prev - 1.0)
                    .collect()
            })
            .collect();
        ReturnMatrix {
            dates: self.dates.iter().skip(1).copied().collect(),
            rows,
        }
    }
}

/// Per-date fractional price change; one row fewer than its price table.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnMatrix {
    pub dates: Vec<NaiveDate>,
    pub rows: Vec<Vec<f64>>,
}

impl ReturnMatrix {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    #[test]
    fn test_symbol_validation() {
        assert!(Symbol::new("BRK.B").is_ok());
        assert!(Symbol::new("RDS-A").is_ok());
        assert!(Symbol::new(" SPY ").is_ok());
        assert!(Symbol::new("").is_err());
        assert!(Symbol::new("aapl").is_err());
        assert!(Symbol::new("AA PL").is_err());
        assert!(Symbol::new("$SPY").is_err());
    }

    #[test]
    fn test_parse_list_normalizes_and_dedups() {
        let symbols = Symbol::parse_list(" aapl, msft,,AAPL , brk.b").unwrap();
        let names: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["AAPL", "MSFT", "BRK.B"]);

        assert!(matches!(
            Symbol::parse_list(" , ,"),
            Err(FrontierError::InvalidInput { .. })
        ));
        assert!(Symbol::parse_list("AAPL,MS FT").is_err());
    }

    #[test]
    fn test_symbol_serde_validates() {
        let ok: Symbol = serde_json::from_str("\"QQQ\"").unwrap();
        assert_eq!(ok.as_str(), "QQQ");
        assert!(serde_json::from_str::<Symbol>("\"q q\"").is_err());
    }

    #[test]
    fn test_parse_date_and_window() {
        let start = parse_date("start_date", "2024-06-01").unwrap();
        let end = parse_date("end_date", "2024-01-01").unwrap();
        assert!(parse_date("start_date", "06/01/2024").is_err());
        assert!(matches!(
            check_window(start, end),
            Err(FrontierError::InvalidInput { .. })
        ));
        assert!(check_window(end, start).is_ok());
        assert!(check_window(start, start).is_ok());
    }

    #[test]
    fn test_price_series_strict_constructor() {
        let series = PriceSeries::new(
            sym("AAA"),
            vec![(d(2024, 1, 3), 11.0), (d(2024, 1, 2), 10.0)],
        )
        .unwrap();
        assert_eq!(series.points()[0].0, d(2024, 1, 2));

        assert!(PriceSeries::new(sym("AAA"), vec![(d(2024, 1, 2), 1.0), (d(2024, 1, 2), 2.0)]).is_err());
        assert!(PriceSeries::new(sym("AAA"), vec![(d(2024, 1, 2), 0.0)]).is_err());
        assert!(PriceSeries::new(sym("AAA"), vec![(d(2024, 1, 2), f64::NAN)]).is_err());
    }

    #[test]
    fn test_price_series_from_observations_cleans_provider_noise() {
        let (series, discarded) = PriceSeries::from_observations(
            sym("AAA"),
            vec![
                (d(2024, 1, 4), 12.0),
                (d(2024, 1, 2), 10.0),
                (d(2024, 1, 3), -1.0),
                (d(2024, 1, 4), 12.5),
                (d(2024, 1, 5), f64::NAN),
            ],
        );
        assert_eq!(discarded, 3);
        assert_eq!(series.points(), &[(d(2024, 1, 2), 10.0), (d(2024, 1, 4), 12.5)]);
        assert_eq!(series.count_within(d(2024, 1, 3), d(2024, 1, 31)), 1);
    }

    #[test]
    fn test_price_table_shape_checks() {
        let dates = vec![d(2024, 1, 2), d(2024, 1, 3)];
        assert!(PriceTable::from_columns(
            vec![sym("A"), sym("B")],
            dates.clone(),
            vec![vec![1.0, 2.0], vec![3.0]],
        )
        .is_err());
        assert!(PriceTable::from_columns(
            vec![sym("A"), sym("A")],
            dates.clone(),
            vec![vec![1.0, 2.0], vec![3.0, 4.0]],
        )
        .is_err());
        assert!(PriceTable::from_columns(
            vec![sym("A")],
            vec![d(2024, 1, 3), d(2024, 1, 2)],
            vec![vec![1.0, 2.0]],
        )
        .is_err());
    }

    #[test]
    fn test_returns_are_fractional_changes() {
        let table = PriceTable::from_columns(
            vec![sym("A"), sym("B")],
            vec![d(2024, 1, 2), d(2024, 1, 3), d(2024, 1, 4)],
            vec![vec![100.0, 110.0, 99.0], vec![50.0, 50.0, 50.0]],
        )
        .unwrap();
        let returns = table.returns();
        assert_eq!(returns.n_rows(), 2);
        assert_eq!(returns.dates, vec![d(2024, 1, 3), d(2024, 1, 4)]);
        assert!((returns.rows[0][0] - 0.10).abs() < 1e-12);
        assert!((returns.rows[1][0] + 0.10).abs() < 1e-12);
        assert_eq!(returns.rows[1][1], 0.0);
        assert_eq!(table.column(1), vec![50.0, 50.0, 50.0]);
    }
}
