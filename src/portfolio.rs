use crate::config::{MAX_SAMPLES, MIN_SAMPLES, MIN_SYMBOLS, TRADING_DAYS};
use crate::data::{PriceTable, ReturnMatrix, Symbol};
use crate::error::{FrontierError, Result};
use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp1};
use rayon::prelude::*;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::str::FromStr;
use std::time::Instant;
use tracing::info;

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

/// How random weight vectors are drawn from the simplex.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightSampling {
    /// Exp(1) draws divided by their sum: uniform over the simplex.
    #[default]
    Dirichlet,
    /// U[0,1) draws divided by their sum. Covers the simplex but leans
    /// towards equal weights.
    Normalized,
}

impl FromStr for WeightSampling {
    type Err = FrontierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dirichlet" => Ok(Self::Dirichlet),
            "normalized" | "uniform" => Ok(Self::Normalized),
            other => Err(FrontierError::invalid_input(
                "sampler",
                format!("unknown sampler '{}', expected dirichlet | normalized", other),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimulationConfig {
    /// Number of random portfolios, within `[MIN_SAMPLES, MAX_SAMPLES]`.
    pub sample_count: usize,
    /// Annual risk-free rate used in the Sharpe ratio.
    pub risk_free_rate: f64,
    /// Fixed seed for reproducible runs; a random one is drawn when absent.
    pub seed: Option<u64>,
    pub sampling: WeightSampling,
}

impl SimulationConfig {
    pub fn new(sample_count: usize, risk_free_rate: f64) -> Self {
        Self {
            sample_count,
            risk_free_rate,
            seed: None,
            sampling: WeightSampling::default(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_sampling(mut self, sampling: WeightSampling) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_SAMPLES..=MAX_SAMPLES).contains(&self.sample_count) {
            return Err(FrontierError::invalid_input(
                "sample count",
                format!(
                    "{} is outside [{}, {}]",
                    self.sample_count, MIN_SAMPLES, MAX_SAMPLES
                ),
            ));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(FrontierError::invalid_input(
                "risk-free rate",
                format!("{} is not a finite number", self.risk_free_rate),
            ));
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// One random portfolio and its annualized statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct PortfolioSample {
    /// One weight per table column, summing to 1.
    pub weights: Vec<f64>,
    pub expected_return: f64,
    pub risk: f64,
    /// NaN when `risk` is zero.
    pub sharpe: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimalSet {
    pub max_sharpe: PortfolioSample,
    pub min_variance: PortfolioSample,
    pub max_return: PortfolioSample,
}

impl OptimalSet {
    /// The three portfolios with their conventional labels.
    pub fn labeled(&self) -> [(&'static str, &PortfolioSample); 3] {
        [
            ("max_sharpe", &self.max_sharpe),
            ("min_variance", &self.min_variance),
            ("max_return", &self.max_return),
        ]
    }
}

/// Annualized mean vector and covariance matrix of daily returns.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnStatistics {
    pub mean: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimulationResult {
    pub symbols: Vec<Symbol>,
    /// Metrics table in generation order.
    pub samples: Vec<PortfolioSample>,
    pub optimal: OptimalSet,
    pub statistics: ReturnStatistics,
    /// Seed the run actually used; replaying it reproduces the table.
    pub seed: u64,
    pub sampling: WeightSampling,
    pub risk_free_rate: f64,
}

// ──────────────────────────────────────────────────────────────────────────────
// Return Statistics
// ──────────────────────────────────────────────────────────────────────────────

/// Sample mean and covariance (n - 1 denominator) of daily returns, scaled
/// by the trading-days constant. Variance scales linearly, so the covariance
/// factor is the same as the mean's.
pub fn compute_return_statistics(returns: &ReturnMatrix) -> Result<ReturnStatistics> {
    let num_rows = returns.n_rows();
    if num_rows < 2 {
        return Err(FrontierError::insufficient_data(
            2,
            num_rows,
            "daily returns for covariance",
        ));
    }
    let n = returns.rows[0].len();

    let mut means = vec![0.0; n];
    for row in &returns.rows {
        for (m, r) in means.iter_mut().zip(row.iter()) {
            *m += r;
        }
    }
    means.iter_mut().for_each(|m| *m /= num_rows as f64);

    let mut cov = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let mut sum = 0.0;
            for row in &returns.rows {
                sum += (row[i] - means[i]) * (row[j] - means[j]);
            }
            let covariance = sum / (num_rows as f64 - 1.0) * TRADING_DAYS;
            cov[i][j] = covariance;
            cov[j][i] = covariance;
        }
    }

    Ok(ReturnStatistics {
        mean: means.into_iter().map(|m| m * TRADING_DAYS).collect(),
        covariance: cov,
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Portfolio Helpers
// ──────────────────────────────────────────────────────────────────────────────

fn portfolio_return(weights: &[f64], means: &[f64]) -> f64 {
    weights.iter().zip(means.iter()).map(|(w, r)| w * r).sum()
}

fn portfolio_variance(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    let n = weights.len();
    let mut var = 0.0;
    for i in 0..n {
        for j in 0..n {
            var += weights[i] * weights[j] * cov[i][j];
        }
    }
    var
}

/// Standard deviation from the quadratic form; rounding can push a singular
/// matrix's form slightly below zero, which is read as zero.
fn portfolio_risk(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    portfolio_variance(weights, cov).max(0.0).sqrt()
}

fn evaluate(weights: Vec<f64>, stats: &ReturnStatistics, risk_free_rate: f64) -> PortfolioSample {
    let expected_return = portfolio_return(&weights, &stats.mean);
    let risk = portfolio_risk(&weights, &stats.covariance);
    let sharpe = if risk > 0.0 {
        (expected_return - risk_free_rate) / risk
    } else {
        f64::NAN
    };
    PortfolioSample {
        weights,
        expected_return,
        risk,
        sharpe,
    }
}

/// Draws a weight vector on the probability simplex.
fn generate_random_weights(n: usize, sampling: WeightSampling, rng: &mut impl Rng) -> Vec<f64> {
    let raw: Vec<f64> = match sampling {
        WeightSampling::Dirichlet => (0..n).map(|_| Exp1.sample(rng)).collect(),
        WeightSampling::Normalized => (0..n).map(|_| rng.r#gen::<f64>()).collect(),
    };
    let sum: f64 = raw.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![1.0 / n as f64; n];
    }
    raw.iter().map(|v| v / sum).collect()
}

/// Single pass over the metrics table. Ties keep the earliest sample. When no
/// sample has a finite Sharpe ratio the first sample stands in for
/// `max_sharpe`.
pub fn select_optimal(samples: &[PortfolioSample]) -> Option<OptimalSet> {
    let first = samples.first()?;
    let mut max_sharpe: Option<&PortfolioSample> = None;
    let mut min_variance = first;
    let mut max_return = first;

    for sample in samples {
        if sample.sharpe.is_finite() && max_sharpe.is_none_or(|best| sample.sharpe > best.sharpe) {
            max_sharpe = Some(sample);
        }
        if sample.risk < min_variance.risk {
            min_variance = sample;
        }
        if sample.expected_return > max_return.expected_return {
            max_return = sample;
        }
    }

    Some(OptimalSet {
        max_sharpe: max_sharpe.unwrap_or(first).clone(),
        min_variance: min_variance.clone(),
        max_return: max_return.clone(),
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Simulator
// ──────────────────────────────────────────────────────────────────────────────

/// Monte Carlo approximation of the efficient frontier.
///
/// Weight vectors are drawn one after another from a single seeded RNG, then
/// scored in parallel. Rayon's indexed collect keeps generation order, so a
/// fixed seed reproduces the metrics table bit for bit on any thread count.
#[derive(Clone, Debug)]
pub struct PortfolioSimulator {
    config: SimulationConfig,
}

impl PortfolioSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn simulate(&self, table: &PriceTable) -> Result<SimulationResult> {
        self.config.validate()?;
        if table.n_symbols() < MIN_SYMBOLS {
            return Err(FrontierError::insufficient_data(
                MIN_SYMBOLS,
                table.n_symbols(),
                "price table columns",
            ));
        }

        let started = Instant::now();
        let stats = compute_return_statistics(&table.returns())?;
        let n = table.n_symbols();
        let seed = self.config.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);

        info!(
            "Simulating {} portfolios over {} assets ({} return rows, sampler={:?}, seed={})",
            self.config.sample_count,
            n,
            table.n_rows() - 1,
            self.config.sampling,
            seed
        );
        for (symbol, (mean, var)) in table
            .symbols()
            .iter()
            .zip(stats.mean.iter().zip((0..n).map(|i| stats.covariance[i][i])))
        {
            info!("  {}: E[r]={:.4}, σ={:.4}", symbol, mean, var.max(0.0).sqrt());
        }

        let draws: Vec<Vec<f64>> = (0..self.config.sample_count)
            .map(|_| generate_random_weights(n, self.config.sampling, &mut rng))
            .collect();

        let risk_free_rate = self.config.risk_free_rate;
        let samples: Vec<PortfolioSample> = draws
            .into_par_iter()
            .map(|weights| evaluate(weights, &stats, risk_free_rate))
            .collect();

        let optimal = select_optimal(&samples).ok_or_else(|| {
            FrontierError::insufficient_data(MIN_SAMPLES, 0, "simulated portfolios")
        })?;

        info!(
            "Simulation finished in {:.1?}: max Sharpe {:.3}, min risk {:.4}, max return {:.4}",
            started.elapsed(),
            optimal.max_sharpe.sharpe,
            optimal.min_variance.risk,
            optimal.max_return.expected_return
        );

        Ok(SimulationResult {
            symbols: table.symbols().to_vec(),
            samples,
            optimal,
            statistics: stats,
            seed,
            sampling: self.config.sampling,
            risk_free_rate,
        })
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Growth Curve
// ──────────────────────────────────────────────────────────────────────────────

/// Value of 1.0 invested at the first date and rebalanced daily to `weights`.
pub fn growth_curve(table: &PriceTable, weights: &[f64]) -> Vec<(NaiveDate, f64)> {
    let Some(first) = table.dates().first() else {
        return Vec::new();
    };
    let mut value = 1.0;
    let mut curve = Vec::with_capacity(table.n_rows());
    curve.push((*first, value));

    let returns = table.returns();
    for (date, row) in returns.dates.iter().zip(returns.rows.iter()) {
        value *= 1.0 + portfolio_return(weights, row);
        curve.push((*date, value));
    }
    curve
}

// ──────────────────────────────────────────────────────────────────────────────
// Output
// ──────────────────────────────────────────────────────────────────────────────

fn finite_or_none(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

/// Row view: `Return`, `Risk`, `Sharpe`, then one weight per symbol.
pub struct SampleView<'a> {
    pub symbols: &'a [Symbol],
    pub sample: &'a PortfolioSample,
}

impl Serialize for SampleView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3 + self.symbols.len()))?;
        map.serialize_entry("Return", &self.sample.expected_return)?;
        map.serialize_entry("Risk", &self.sample.risk)?;
        map.serialize_entry("Sharpe", &finite_or_none(self.sample.sharpe))?;
        for (symbol, weight) in self.symbols.iter().zip(self.sample.weights.iter()) {
            map.serialize_entry(symbol.as_str(), weight)?;
        }
        map.end()
    }
}

#[derive(Serialize)]
struct OptimalView<'a> {
    max_sharpe: SampleView<'a>,
    min_variance: SampleView<'a>,
    max_return: SampleView<'a>,
}

#[derive(Serialize)]
struct ResultView<'a> {
    symbols: &'a [Symbol],
    seed: u64,
    sampling: WeightSampling,
    risk_free_rate: f64,
    metrics: Vec<SampleView<'a>>,
    optimal: OptimalView<'a>,
}

impl SimulationResult {
    pub fn view<'a>(&'a self, sample: &'a PortfolioSample) -> SampleView<'a> {
        SampleView {
            symbols: &self.symbols,
            sample,
        }
    }
}

impl Serialize for SimulationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ResultView {
            symbols: &self.symbols,
            seed: self.seed,
            sampling: self.sampling,
            risk_free_rate: self.risk_free_rate,
            metrics: self.samples.iter().map(|s| self.view(s)).collect(),
            optimal: OptimalView {
                max_sharpe: self.view(&self.optimal.max_sharpe),
                min_variance: self.view(&self.optimal.min_variance),
                max_return: self.view(&self.optimal.max_return),
            },
        }
        .serialize(serializer)
    }
}

/// Writes the metrics table as CSV. An undefined Sharpe ratio is left empty.
pub fn write_metrics_csv<W: std::io::Write>(result: &SimulationResult, writer: W) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    let mut header = vec!["Return".to_string(), "Risk".to_string(), "Sharpe".to_string()];
    header.extend(result.symbols.iter().map(|s| s.to_string()));
    wtr.write_record(&header)?;

    for sample in &result.samples {
        let mut record = vec![
            sample.expected_return.to_string(),
            sample.risk.to_string(),
            finite_or_none(sample.sharpe)
                .map(|v| v.to_string())
                .unwrap_or_default(),
        ];
        record.extend(sample.weights.iter().map(|w| w.to_string()));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Pretty-prints the optimal portfolios to stdout.
pub fn print_summary(result: &SimulationResult, table: &PriceTable) {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║           Monte Carlo Efficient Frontier                   ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!(
        "║  Window     : {} → {}                      ║",
        table.dates().first().map(|d| d.to_string()).unwrap_or_default(),
        table.dates().last().map(|d| d.to_string()).unwrap_or_default()
    );
    println!(
        "║  Portfolios : {:>6}   Seed: {:<20}        ║",
        result.samples.len(),
        result.seed
    );
    println!(
        "║  Risk-free  : {:>6.2}%                                      ║",
        result.risk_free_rate * 100.0
    );

    for (label, sample) in result.optimal.labeled() {
        println!("╠════════════════════════════════════════════════════════════╣");
        let sharpe = finite_or_none(sample.sharpe)
            .map(|s| format!("{:>6.2}", s))
            .unwrap_or_else(|| "   n/a".to_string());
        println!(
            "║  {:<12}  Return {:>+7.2}%  Risk {:>6.2}%  Sharpe {} ║",
            label,
            sample.expected_return * 100.0,
            sample.risk * 100.0,
            sharpe
        );

        let mut sorted: Vec<(&Symbol, f64)> = result
            .symbols
            .iter()
            .zip(sample.weights.iter().copied())
            .collect();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
        for (symbol, weight) in sorted {
            println!("║      {:<10} {:>7.2}%                                    ║", symbol, weight * 100.0);
        }
    }

    let quality = table.quality();
    if !quality.dropped.is_empty() || quality.filled_cells > 0 {
        println!("╠════════════════════════════════════════════════════════════╣");
        for dropped in &quality.dropped {
            println!("║  dropped {:<10} {:?}", dropped.symbol, dropped.reason);
        }
        println!(
            "║  forward-filled cells: {:<6} discarded rows: {:<6}         ║",
            quality.filled_cells, quality.discarded_rows
        );
    }

    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("⚠  Educational use only. Not financial advice.");
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
