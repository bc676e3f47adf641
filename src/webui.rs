use crate::config::AppConfig;
use crate::data::{check_window, parse_date, DataQuality, Symbol};
use crate::error::FrontierError;
use crate::portfolio::{self, PortfolioSimulator, SimulationConfig, SimulationResult, WeightSampling};
use crate::provider::{PriceProvider, Provider};
use crate::repository::PriceRepository;
use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone)]
struct WebState {
    repository: Arc<PriceRepository<Provider>>,
    sampling: WeightSampling,
    seed: Option<u64>,
    results: ResultStore,
}

#[derive(Clone, Debug, Serialize)]
struct ApiError {
    error: String,
    kind: &'static str,
}

type ApiResult<T> = std::result::Result<Json<T>, (StatusCode, Json<ApiError>)>;

/// Holds the most recent successful run. Each run replaces the previous one.
#[derive(Clone, Default)]
pub struct ResultStore {
    slot: Arc<Mutex<Option<StoredRun>>>,
}

impl ResultStore {
    pub async fn put(&self, run: StoredRun) {
        *self.slot.lock().await = Some(run);
    }

    pub async fn get(&self) -> Option<StoredRun> {
        self.slot.lock().await.clone()
    }
}

/// Inputs as they were accepted, after normalization.
#[derive(Clone, Debug, Serialize)]
pub struct RunInputs {
    pub symbols: Vec<Symbol>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub num_portfolios: usize,
    pub risk_free_rate: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct GrowthPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct StoredRun {
    pub inputs: RunInputs,
    pub result: SimulationResult,
    /// Value of 1.0 held in the max-Sharpe portfolio over the window.
    pub growth: Vec<GrowthPoint>,
    pub quality: DataQuality,
    pub updated_at: String,
}

/// Symbols arrive either as a JSON list or as the comma-separated text a
/// form field would carry.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SymbolInput {
    List(Vec<String>),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct OptimizeRequest {
    symbols: SymbolInput,
    start_date: String,
    end_date: String,
    num_portfolios: usize,
    #[serde(default)]
    risk_free_rate: f64,
    seed: Option<u64>,
    sampler: Option<WeightSampling>,
}

pub async fn run_webui_server(port: u16, config: AppConfig) -> Result<()> {
    let provider = Provider::from_config(&config).context("Failed to set up price provider")?;
    info!("Using {} price provider", provider.name());
    let state = WebState {
        repository: Arc::new(PriceRepository::new(provider, config.repository.clone())),
        sampling: config.sampling,
        seed: config.seed,
        results: ResultStore::default(),
    };

    let addr = format!("0.0.0.0:{}", port);
    info!("WebUI listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/optimize", post(optimize))
        .route("/api/results", get(results))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn optimize(
    State(state): State<WebState>,
    payload: std::result::Result<Json<OptimizeRequest>, JsonRejection>,
) -> ApiResult<StoredRun> {
    let Json(req) = payload.map_err(|rejection| {
        frontier_err(FrontierError::invalid_input("request body", rejection.body_text()))
    })?;
    let symbols = match req.symbols {
        SymbolInput::List(items) => Symbol::from_strings(items),
        SymbolInput::Text(text) => Symbol::parse_list(&text),
    }
    .map_err(frontier_err)?;
    let start = parse_date("start date", &req.start_date).map_err(frontier_err)?;
    let end = parse_date("end date", &req.end_date).map_err(frontier_err)?;
    check_window(start, end).map_err(frontier_err)?;

    let mut sim_config = SimulationConfig::new(req.num_portfolios, req.risk_free_rate)
        .with_sampling(req.sampler.unwrap_or(state.sampling));
    if let Some(seed) = req.seed.or(state.seed) {
        sim_config = sim_config.with_seed(seed);
    }
    sim_config.validate().map_err(frontier_err)?;

    info!(
        "Optimize request: {} symbols, {} → {}, {} portfolios",
        symbols.len(),
        start,
        end,
        req.num_portfolios
    );

    let table = state
        .repository
        .load(&symbols, start, end)
        .await
        .map_err(frontier_err)?;

    let simulator = PortfolioSimulator::new(sim_config);
    let (result, growth, table) = tokio::task::spawn_blocking(move || {
        let result = simulator.simulate(&table)?;
        let growth = portfolio::growth_curve(&table, &result.optimal.max_sharpe.weights);
        Ok::<_, FrontierError>((result, growth, table))
    })
    .await
    .map_err(internal_err)?
    .map_err(frontier_err)?;

    let run = StoredRun {
        inputs: RunInputs {
            symbols,
            start_date: start,
            end_date: end,
            num_portfolios: req.num_portfolios,
            risk_free_rate: req.risk_free_rate,
        },
        result,
        growth: growth
            .into_iter()
            .map(|(date, value)| GrowthPoint { date, value })
            .collect(),
        quality: table.quality().clone(),
        updated_at: chrono::Local::now().to_rfc3339(),
    };
    state.results.put(run.clone()).await;

    Ok(Json(run))
}

async fn results(State(state): State<WebState>) -> ApiResult<StoredRun> {
    match state.results.get().await {
        Some(run) => Ok(Json(run)),
        None => Err(api_err(StatusCode::NOT_FOUND, "no_results", "no optimization has been run yet")),
    }
}

fn api_err(status: StatusCode, kind: &'static str, message: &str) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: message.to_string(),
            kind,
        }),
    )
}

fn frontier_err(err: FrontierError) -> (StatusCode, Json<ApiError>) {
    let status = match err {
        FrontierError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        FrontierError::SymbolNotFound { .. } => StatusCode::NOT_FOUND,
        FrontierError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        FrontierError::DataSource { .. } => StatusCode::BAD_GATEWAY,
    };
    warn!("Optimize request failed ({}): {}", status, err);
    api_err(status, err.kind(), &err.to_string())
}

fn internal_err<E: std::fmt::Display>(err: E) -> (StatusCode, Json<ApiError>) {
    api_err(StatusCode::INTERNAL_SERVER_ERROR, "internal", &err.to_string())
}
