//! Historical price providers.
//!
//! Each provider answers one question: the daily closes of a symbol between
//! two dates. "No data" and "provider broken" are kept apart so the
//! repository can apply its missing-symbol policy to the former only.

use crate::config::{AppConfig, DataProviderMode};
use crate::data::{PriceSeries, Symbol};
use crate::error::{FrontierError, Result};
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const YAHOO_CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const POLYGON_API_URL: &str = "https://api.polygon.io";

/// Provider output before repository-level cleaning.
#[derive(Clone, Debug)]
pub struct RawHistory {
    pub series: PriceSeries,
    /// Observations rejected as null, non-positive or duplicated.
    pub discarded: usize,
}

impl RawHistory {
    fn from_observations(symbol: &Symbol, points: Vec<(NaiveDate, f64)>) -> Self {
        let (series, discarded) = PriceSeries::from_observations(symbol.clone(), points);
        if discarded > 0 {
            debug!("{}: discarded {} unusable provider observations", symbol, discarded);
        }
        Self { series, discarded }
    }
}

pub trait PriceProvider {
    /// Daily prices for `symbol` dated within `[start, end]`.
    ///
    /// An empty series means the provider knows nothing about the symbol in
    /// that window; transport and protocol failures are `DataSource` errors.
    fn fetch_history(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Future<Output = Result<RawHistory>> + Send;

    fn name(&self) -> &'static str;
}

fn transport_error(symbol: &Symbol, provider: &str, err: reqwest::Error) -> FrontierError {
    let message = if err.is_timeout() {
        format!("{} request timed out", provider)
    } else if err.is_connect() {
        format!("{} unreachable: {}", provider, err)
    } else {
        format!("{} request failed: {}", provider, err)
    };
    FrontierError::data_source(symbol.as_str(), message)
}

fn build_client(timeout: std::time::Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent("Mozilla/5.0")
        .build()
        .map_err(|e| FrontierError::data_source("*", format!("failed to build HTTP client: {}", e)))
}

// ──────────────────────────────────────────────────────────────────────────────
// Yahoo Finance chart API
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Debug)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
    error: Option<YahooApiError>,
}

#[derive(Deserialize, Debug)]
struct YahooApiError {
    code: String,
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
struct YahooResult {
    meta: Option<YahooMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Debug)]
struct YahooMeta {
    gmtoffset: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
    adjclose: Option<Vec<YahooAdjClose>>,
}

#[derive(Deserialize, Debug)]
struct YahooQuote {
    close: Option<Vec<Option<f64>>>,
}

#[derive(Deserialize, Debug)]
struct YahooAdjClose {
    adjclose: Option<Vec<Option<f64>>>,
}

#[derive(Clone, Debug)]
pub struct YahooProvider {
    client: reqwest::Client,
    base_url: String,
}

impl YahooProvider {
    pub fn new(timeout: std::time::Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: YAHOO_CHART_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Converts a chart API body into a price history. Adjusted closes are
/// preferred; raw closes are used when the response has none.
fn parse_yahoo_chart(
    symbol: &Symbol,
    body: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<RawHistory> {
    let response: YahooChartResponse = serde_json::from_str(body).map_err(|e| {
        FrontierError::data_source(symbol.as_str(), format!("malformed Yahoo response: {}", e))
    })?;

    if let Some(err) = response.chart.error {
        if err.code.eq_ignore_ascii_case("Not Found") {
            return Err(FrontierError::symbol_not_found(symbol.as_str(), start, end));
        }
        return Err(FrontierError::data_source(
            symbol.as_str(),
            format!(
                "Yahoo error {}: {}",
                err.code,
                err.description.unwrap_or_default()
            ),
        ));
    }

    let Some(result) = response.chart.result.and_then(|r| r.into_iter().next()) else {
        return Ok(RawHistory::from_observations(symbol, Vec::new()));
    };
    let timestamps = result.timestamp.unwrap_or_default();
    let offset = result.meta.and_then(|m| m.gmtoffset).unwrap_or(0);

    let adjusted = result
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .and_then(|a| a.adjclose);
    let closes = match adjusted {
        Some(values) => values,
        None => result
            .indicators
            .quote
            .into_iter()
            .next()
            .and_then(|q| q.close)
            .unwrap_or_default(),
    };

    if closes.len() != timestamps.len() {
        warn!(
            "{}: Yahoo returned {} timestamps but {} closes; truncating",
            symbol,
            timestamps.len(),
            closes.len()
        );
    }

    let points = timestamps
        .iter()
        .zip(closes.iter())
        .filter_map(|(&ts, close)| {
            let date = Utc.timestamp_opt(ts + offset, 0).single()?.date_naive();
            Some((date, close.unwrap_or(f64::NAN)))
        })
        .filter(|(date, _)| *date >= start && *date <= end)
        .collect();

    Ok(RawHistory::from_observations(symbol, points))
}

impl PriceProvider for YahooProvider {
    async fn fetch_history(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RawHistory> {
        let period1 = start.and_hms_opt(0, 0, 0).map(|t| t.and_utc().timestamp()).unwrap_or(0);
        let period2 = (end + Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().timestamp())
            .unwrap_or(period1);
        let url = format!(
            "{}/{}?period1={}&period2={}&interval=1d&events=history",
            self.base_url, symbol, period1, period2
        );
        debug!("Fetching {} from Yahoo ({}..{})", symbol, start, end);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(symbol, "Yahoo", e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FrontierError::symbol_not_found(symbol.as_str(), start, end));
        }
        if !status.is_success() {
            return Err(FrontierError::data_source(
                symbol.as_str(),
                format!("Yahoo responded with HTTP {}", status),
            ));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| transport_error(symbol, "Yahoo", e))?;
        parse_yahoo_chart(symbol, &body, start, end)
    }

    fn name(&self) -> &'static str {
        "yfinance"
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Polygon aggregates API
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct PolygonAggsResponse {
    status: Option<String>,
    results: Option<Vec<PolygonAgg>>,
}

#[derive(Deserialize, Debug)]
struct PolygonAgg {
    #[serde(rename = "t")]
    timestamp_ms: i64,
    #[serde(rename = "c")]
    close: f64,
}

#[derive(Clone, Debug)]
pub struct PolygonProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PolygonProvider {
    pub fn new(api_key: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: POLYGON_API_URL.to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

fn parse_polygon_aggs(
    symbol: &Symbol,
    body: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<RawHistory> {
    let response: PolygonAggsResponse = serde_json::from_str(body).map_err(|e| {
        FrontierError::data_source(symbol.as_str(), format!("malformed Polygon response: {}", e))
    })?;

    if let Some(status) = response.status.as_deref() {
        if status.eq_ignore_ascii_case("ERROR") {
            return Err(FrontierError::data_source(
                symbol.as_str(),
                "Polygon reported status ERROR",
            ));
        }
    }

    let points = response
        .results
        .unwrap_or_default()
        .into_iter()
        .filter_map(|bar| {
            let date = Utc.timestamp_millis_opt(bar.timestamp_ms).single()?.date_naive();
            Some((date, bar.close))
        })
        .filter(|(date, _)| *date >= start && *date <= end)
        .collect();

    Ok(RawHistory::from_observations(symbol, points))
}

impl PriceProvider for PolygonProvider {
    async fn fetch_history(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RawHistory> {
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/1/day/{}/{}?adjusted=true&sort=asc&limit=50000&apiKey={}",
            self.base_url,
            symbol,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d"),
            self.api_key
        );
        debug!("Fetching {} from Polygon ({}..{})", symbol, start, end);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(symbol, "Polygon", e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FrontierError::symbol_not_found(symbol.as_str(), start, end));
        }
        if !status.is_success() {
            return Err(FrontierError::data_source(
                symbol.as_str(),
                format!("Polygon responded with HTTP {}", status),
            ));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| transport_error(symbol, "Polygon", e))?;
        parse_polygon_aggs(symbol, &body, start, end)
    }

    fn name(&self) -> &'static str {
        "polygon"
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// In-memory fixtures
// ──────────────────────────────────────────────────────────────────────────────

/// Serves prices from memory. Used for offline runs and tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryProvider {
    series: HashMap<Symbol, Vec<(NaiveDate, f64)>>,
    failing: HashSet<Symbol>,
    calls: Arc<AtomicUsize>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, symbol: Symbol, points: Vec<(NaiveDate, f64)>) -> Self {
        self.series.insert(symbol, points);
        self
    }

    /// Makes every fetch of `symbol` fail as if the upstream were down.
    pub fn with_failure(mut self, symbol: Symbol) -> Self {
        self.failing.insert(symbol);
        self
    }

    /// Number of fetches issued so far, across clones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PriceProvider for MemoryProvider {
    async fn fetch_history(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RawHistory> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(symbol) {
            return Err(FrontierError::data_source(
                symbol.as_str(),
                "in-memory provider configured to fail",
            ));
        }
        let points = self
            .series
            .get(symbol)
            .map(|pts| {
                pts.iter()
                    .copied()
                    .filter(|(date, _)| *date >= start && *date <= end)
                    .collect()
            })
            .unwrap_or_default();
        Ok(RawHistory::from_observations(symbol, points))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Dispatch
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum Provider {
    Yahoo(YahooProvider),
    Polygon(PolygonProvider),
    Memory(MemoryProvider),
}

impl Provider {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        match config.provider {
            DataProviderMode::Yfinance => Ok(Self::Yahoo(YahooProvider::new(config.fetch_timeout)?)),
            DataProviderMode::Polygon => {
                let api_key = config.polygon_api_key.clone().ok_or_else(|| {
                    FrontierError::invalid_input(
                        "POLYGON_API_KEY",
                        "FRONTIER_DATA_PROVIDER=polygon but POLYGON_API_KEY is missing",
                    )
                })?;
                Ok(Self::Polygon(PolygonProvider::new(api_key, config.fetch_timeout)?))
            }
        }
    }
}

impl PriceProvider for Provider {
    async fn fetch_history(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RawHistory> {
        match self {
            Self::Yahoo(p) => p.fetch_history(symbol, start, end).await,
            Self::Polygon(p) => p.fetch_history(symbol, start, end).await,
            Self::Memory(p) => p.fetch_history(symbol, start, end).await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Yahoo(p) => p.name(),
            Self::Polygon(p) => p.name(),
            Self::Memory(p) => p.name(),
        }
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

    fn ts(date: NaiveDate, hour: u32) -> i64 {
        date.and_hms_opt(hour, 30, 0).unwrap().and_utc().timestamp()
    }

    #[test]
    fn test_parse_yahoo_prefers_adjclose_and_skips_nulls() {
        let body = format!(
            r#"{{"chart":{{"result":[{{
                "meta":{{"gmtoffset":-18000}},
                "timestamp":[{},{},{}],
                "indicators":{{
                    "quote":[{{"close":[100.0,null,102.0]}}],
                    "adjclose":[{{"adjclose":[99.0,null,101.0]}}]
                }}
            }}],"error":null}}}}"#,
            ts(d(2024, 1, 2), 14),
            ts(d(2024, 1, 3), 14),
            ts(d(2024, 1, 4), 14)
        );
        let raw = parse_yahoo_chart(&sym("SPY"), &body, d(2024, 1, 1), d(2024, 1, 31)).unwrap();
        assert_eq!(raw.series.points(), &[(d(2024, 1, 2), 99.0), (d(2024, 1, 4), 101.0)]);
        assert_eq!(raw.discarded, 1);
    }

    #[test]
    fn test_parse_yahoo_falls_back_to_close() {
        let body = format!(
            r#"{{"chart":{{"result":[{{"timestamp":[{}],"indicators":{{"quote":[{{"close":[42.5]}}]}}}}],"error":null}}}}"#,
            ts(d(2024, 2, 1), 15)
        );
        let raw = parse_yahoo_chart(&sym("QQQ"), &body, d(2024, 1, 1), d(2024, 12, 31)).unwrap();
        assert_eq!(raw.series.points(), &[(d(2024, 2, 1), 42.5)]);
    }

    #[test]
    fn test_parse_yahoo_not_found_and_garbage() {
        let body = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        let err = parse_yahoo_chart(&sym("NOPE"), body, d(2024, 1, 1), d(2024, 2, 1)).unwrap_err();
        assert!(matches!(err, FrontierError::SymbolNotFound { ref symbol, .. } if symbol == "NOPE"));

        let err = parse_yahoo_chart(&sym("SPY"), "<html>", d(2024, 1, 1), d(2024, 2, 1)).unwrap_err();
        assert!(matches!(err, FrontierError::DataSource { .. }));

        let body = r#"{"chart":{"result":null,"error":{"code":"Bad Request","description":"Invalid input"}}}"#;
        let err = parse_yahoo_chart(&sym("SPY"), body, d(2024, 1, 1), d(2024, 2, 1)).unwrap_err();
        assert!(matches!(err, FrontierError::DataSource { .. }));
    }

    #[test]
    fn test_parse_yahoo_without_timestamps_is_empty() {
        let body = r#"{"chart":{"result":[{"indicators":{"quote":[{}]}}],"error":null}}"#;
        let raw = parse_yahoo_chart(&sym("SPY"), body, d(2024, 1, 1), d(2024, 2, 1)).unwrap();
        assert!(raw.series.is_empty());
    }

    #[test]
    fn test_parse_polygon_aggs_filters_window() {
        let inside = d(2024, 3, 1).and_hms_opt(5, 0, 0).unwrap().and_utc().timestamp_millis();
        let outside = d(2024, 4, 1).and_hms_opt(5, 0, 0).unwrap().and_utc().timestamp_millis();
        let body = format!(
            r#"{{"status":"OK","results":[{{"t":{},"c":10.5,"o":10.0}},{{"t":{},"c":11.0}}]}}"#,
            inside, outside
        );
        let raw = parse_polygon_aggs(&sym("NVDA"), &body, d(2024, 3, 1), d(2024, 3, 31)).unwrap();
        assert_eq!(raw.series.points(), &[(d(2024, 3, 1), 10.5)]);

        let err = parse_polygon_aggs(&sym("NVDA"), r#"{"status":"ERROR"}"#, d(2024, 3, 1), d(2024, 3, 31))
            .unwrap_err();
        assert!(matches!(err, FrontierError::DataSource { .. }));
    }

    #[tokio::test]
    async fn test_memory_provider_windows_and_failures() {
        let provider = MemoryProvider::new()
            .with_series(sym("AAA"), vec![(d(2024, 1, 2), 1.0), (d(2024, 1, 10), 2.0)])
            .with_failure(sym("BAD"));

        let raw = provider.fetch_history(&sym("AAA"), d(2024, 1, 1), d(2024, 1, 5)).await.unwrap();
        assert_eq!(raw.series.len(), 1);

        let raw = provider.fetch_history(&sym("ZZZ"), d(2024, 1, 1), d(2024, 1, 5)).await.unwrap();
        assert!(raw.series.is_empty());

        let err = provider.fetch_history(&sym("BAD"), d(2024, 1, 1), d(2024, 1, 5)).await.unwrap_err();
        assert!(matches!(err, FrontierError::DataSource { .. }));
        assert_eq!(provider.calls(), 3);
    }

    /// Local upstream: `/ok` serves one Yahoo bar, `/missing` 404s, `/down`
    /// 503s and `/stall` never answers.
    async fn stub_upstream() -> String {
        use axum::routing::get;

        let body = format!(
            r#"{{"chart":{{"result":[{{"timestamp":[{}],"indicators":{{"quote":[{{"close":[42.5]}}]}}}}],"error":null}}}}"#,
            ts(d(2024, 2, 1), 15)
        );
        let app = axum::Router::new()
            .route("/ok/*rest", get(move || async move { body }))
            .route("/missing/*rest", get(|| async { reqwest::StatusCode::NOT_FOUND }))
            .route("/down/*rest", get(|| async { reqwest::StatusCode::SERVICE_UNAVAILABLE }))
            .route(
                "/stall/*rest",
                get(|| async {
                    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                    "late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn yahoo_at(base: &str, route: &str) -> YahooProvider {
        YahooProvider::new(std::time::Duration::from_millis(200))
            .unwrap()
            .with_base_url(format!("{}/{}", base, route))
    }

    fn polygon_at(base: &str, route: &str) -> PolygonProvider {
        PolygonProvider::new("test-key", std::time::Duration::from_millis(200))
            .unwrap()
            .with_base_url(format!("{}/{}", base, route))
    }

    #[tokio::test]
    async fn test_yahoo_http_status_mapping() {
        let base = stub_upstream().await;
        let (start, end) = (d(2024, 1, 1), d(2024, 3, 1));

        let raw = yahoo_at(&base, "ok").fetch_history(&sym("QQQ"), start, end).await.unwrap();
        assert_eq!(raw.series.points(), &[(d(2024, 2, 1), 42.5)]);

        let err = yahoo_at(&base, "missing")
            .fetch_history(&sym("NOPE"), start, end)
            .await
            .unwrap_err();
        assert!(matches!(err, FrontierError::SymbolNotFound { ref symbol, .. } if symbol == "NOPE"));

        let err = yahoo_at(&base, "down")
            .fetch_history(&sym("SPY"), start, end)
            .await
            .unwrap_err();
        assert!(matches!(err, FrontierError::DataSource { ref message, .. } if message.contains("503")));
    }

    #[tokio::test]
    async fn test_yahoo_timeout_is_data_source() {
        let base = stub_upstream().await;
        let started = std::time::Instant::now();
        let err = yahoo_at(&base, "stall")
            .fetch_history(&sym("SPY"), d(2024, 1, 1), d(2024, 3, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FrontierError::DataSource { ref symbol, .. } if symbol == "SPY"));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_polygon_http_status_mapping() {
        let base = stub_upstream().await;
        let (start, end) = (d(2024, 1, 1), d(2024, 3, 1));

        let err = polygon_at(&base, "missing")
            .fetch_history(&sym("NOPE"), start, end)
            .await
            .unwrap_err();
        assert!(matches!(err, FrontierError::SymbolNotFound { .. }));

        let err = polygon_at(&base, "down")
            .fetch_history(&sym("NVDA"), start, end)
            .await
            .unwrap_err();
        assert!(matches!(err, FrontierError::DataSource { .. }));

        let err = polygon_at(&base, "stall")
            .fetch_history(&sym("NVDA"), start, end)
            .await
            .unwrap_err();
        assert!(matches!(err, FrontierError::DataSource { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_data_source() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = yahoo_at(&format!("http://{}", addr), "ok")
            .fetch_history(&sym("SPY"), d(2024, 1, 1), d(2024, 3, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FrontierError::DataSource { .. }));
    }

    #[test]
    fn test_polygon_requires_api_key() {
        let config = AppConfig {
            provider: DataProviderMode::Polygon,
            ..AppConfig::default()
        };
        assert!(matches!(
            Provider::from_config(&config),
            Err(FrontierError::InvalidInput { .. })
        ));
    }
}
