use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{
    CriticalDeclineConfig, CriticalDeclineResult, PeriodComparison, SimulationCache,
    SimulationConfig, SimulationPoint, SimulationResult, StrategyParameters, compare_periods,
    describe_crossover, solve_critical_decline,
};

const DEFAULT_COMPARE_PERIODS: [f64; 3] = [3.0, 6.0, 9.0];

#[derive(Debug, Parser)]
#[command(
    name = "twap-runway",
    about = "Treasury runway projection under an immediate sale plus TWAP liquidation"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        help = "Log level or filter directive; defaults to RUST_LOG"
    )]
    pub log_level: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Project one strategy and print the series as JSON.
    Simulate(StrategyArgs),
    /// Project the strategy for several TWAP periods.
    Compare {
        #[command(flatten)]
        strategy: StrategyArgs,
        #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_COMPARE_PERIODS.to_vec())]
        periods: Vec<f64>,
    },
    /// Solve for the TWAP price decline that breaches the threshold by a month.
    CriticalDecline {
        #[command(flatten)]
        strategy: StrategyArgs,
        #[command(flatten)]
        solver: SolverArgs,
    },
}

#[derive(Debug, Clone, Args)]
pub struct StrategyArgs {
    #[arg(long, default_value_t = 6_000.0)]
    total_units: f64,
    #[arg(long, default_value_t = 1_000.0, help = "Units sold at t=0")]
    immediate_units: f64,
    #[arg(long, default_value_t = 3_200.0)]
    unit_price: f64,
    #[arg(long, default_value_t = 17_500_000.0 / 12.0)]
    monthly_spend: f64,
    #[arg(long, default_value_t = 3.0)]
    twap_period: f64,
    #[arg(long, default_value_t = 2_000_000.0)]
    minimum_safe_balance: f64,
    #[arg(
        long,
        default_value_t = 45.0,
        help = "Annualized unit price volatility in percent"
    )]
    annual_volatility: f64,
    #[arg(long, default_value_t = 12.0)]
    horizon_months: f64,
    #[arg(
        long,
        default_value_t = 0.05,
        help = "Internal integration step; drives crossover precision"
    )]
    step_months: f64,
    #[arg(
        long,
        help = "Output sampling interval; defaults to the smallest step multiple >= 0.1"
    )]
    sample_interval_months: Option<f64>,
}

#[derive(Debug, Clone, Args)]
pub struct SolverArgs {
    #[arg(long, default_value_t = 12.0)]
    target_month: f64,
    #[arg(long, default_value_t = 0.0, help = "Lower decline bound in percent")]
    decline_search_min: f64,
    #[arg(long, default_value_t = 99.0, help = "Upper decline bound in percent")]
    decline_search_max: f64,
    #[arg(long, default_value_t = 0.01, help = "Decline tolerance in percent")]
    decline_tolerance: f64,
    #[arg(long, default_value_t = 40)]
    max_iterations: u32,
}

impl Default for StrategyArgs {
    fn default() -> Self {
        Self {
            total_units: 6_000.0,
            immediate_units: 1_000.0,
            unit_price: 3_200.0,
            monthly_spend: 17_500_000.0 / 12.0,
            twap_period: 3.0,
            minimum_safe_balance: 2_000_000.0,
            annual_volatility: 45.0,
            horizon_months: 12.0,
            step_months: 0.05,
            sample_interval_months: None,
        }
    }
}

impl Default for SolverArgs {
    fn default() -> Self {
        Self {
            target_month: 12.0,
            decline_search_min: 0.0,
            decline_search_max: 99.0,
            decline_tolerance: 0.01,
            max_iterations: 40,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PeriodList {
    List(Vec<f64>),
    Csv(String),
}

impl PeriodList {
    fn into_periods(self) -> Result<Vec<f64>, String> {
        match self {
            PeriodList::List(periods) => Ok(periods),
            PeriodList::Csv(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| {
                    part.parse::<f64>()
                        .map_err(|_| format!("twapPeriods entry '{part}' is not a number"))
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    total_units: Option<f64>,
    immediate_units: Option<f64>,
    unit_price: Option<f64>,
    monthly_spend: Option<f64>,
    #[serde(alias = "period", alias = "twapPeriodMonths")]
    twap_period: Option<f64>,
    #[serde(alias = "minimumSafe")]
    minimum_safe_balance: Option<f64>,
    #[serde(alias = "volatility")]
    annual_volatility: Option<f64>,
    horizon_months: Option<f64>,
    step_months: Option<f64>,
    sample_interval_months: Option<f64>,
    twap_periods: Option<PeriodList>,
    target_month: Option<f64>,
    decline_search_min: Option<f64>,
    decline_search_max: Option<f64>,
    decline_tolerance: Option<f64>,
    max_iterations: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct StrategyRequest {
    params: StrategyParameters,
    config: SimulationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    twap_period_months: f64,
    annual_volatility: f64,
    minimum_safe_balance: f64,
    crossover_month: Option<f64>,
    crossover_label: String,
    points: Vec<SimulationPoint>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompareResponse {
    annual_volatility: f64,
    minimum_safe_balance: f64,
    scenarios: Vec<SimulateResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CriticalDeclineResponse {
    twap_period_months: f64,
    minimum_safe_balance: f64,
    #[serde(flatten)]
    result: CriticalDeclineResult,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Clone, Default)]
struct AppState {
    cache: Arc<Mutex<SimulationCache>>,
}

fn build_request(args: &StrategyArgs) -> Result<StrategyRequest, String> {
    if !args.annual_volatility.is_finite() || args.annual_volatility <= 0.0 {
        return Err("--annual-volatility must be > 0".to_string());
    }
    if args.immediate_units > args.total_units {
        return Err("--immediate-units must be <= --total-units".to_string());
    }

    let mut config = SimulationConfig::new(args.horizon_months, args.step_months);
    if let Some(interval) = args.sample_interval_months {
        config.sample_interval_months = interval;
    }

    Ok(StrategyRequest {
        params: StrategyParameters {
            total_units: args.total_units,
            immediate_units: args.immediate_units,
            unit_price: args.unit_price,
            monthly_spend: args.monthly_spend,
            twap_period_months: args.twap_period,
            minimum_safe_balance: args.minimum_safe_balance,
            annual_volatility: args.annual_volatility / 100.0,
        },
        config,
    })
}

fn build_solver_config(args: &SolverArgs) -> CriticalDeclineConfig {
    CriticalDeclineConfig {
        target_month: args.target_month,
        search_min: args.decline_search_min / 100.0,
        search_max: args.decline_search_max / 100.0,
        tolerance: args.decline_tolerance / 100.0,
        max_iterations: args.max_iterations,
    }
}

fn strategy_args_from_payload(payload: &SimulatePayload) -> StrategyArgs {
    let mut args = StrategyArgs::default();
    if let Some(v) = payload.total_units {
        args.total_units = v;
    }
    if let Some(v) = payload.immediate_units {
        args.immediate_units = v;
    }
    if let Some(v) = payload.unit_price {
        args.unit_price = v;
    }
    if let Some(v) = payload.monthly_spend {
        args.monthly_spend = v;
    }
    if let Some(v) = payload.twap_period {
        args.twap_period = v;
    }
    if let Some(v) = payload.minimum_safe_balance {
        args.minimum_safe_balance = v;
    }
    if let Some(v) = payload.annual_volatility {
        args.annual_volatility = v;
    }
    if let Some(v) = payload.horizon_months {
        args.horizon_months = v;
    }
    if let Some(v) = payload.step_months {
        args.step_months = v;
    }
    if payload.sample_interval_months.is_some() {
        args.sample_interval_months = payload.sample_interval_months;
    }
    args
}

fn solver_args_from_payload(payload: &SimulatePayload) -> SolverArgs {
    let mut args = SolverArgs::default();
    if let Some(v) = payload.target_month {
        args.target_month = v;
    }
    if let Some(v) = payload.decline_search_min {
        args.decline_search_min = v;
    }
    if let Some(v) = payload.decline_search_max {
        args.decline_search_max = v;
    }
    if let Some(v) = payload.decline_tolerance {
        args.decline_tolerance = v;
    }
    if let Some(v) = payload.max_iterations {
        args.max_iterations = v;
    }
    args
}

fn simulate_response(params: &StrategyParameters, result: &SimulationResult) -> SimulateResponse {
    SimulateResponse {
        twap_period_months: params.twap_period_months,
        annual_volatility: params.annual_volatility,
        minimum_safe_balance: params.minimum_safe_balance,
        crossover_month: result.crossover_month,
        crossover_label: describe_crossover(result.crossover_month),
        points: result.points.clone(),
    }
}

fn compare_response(
    params: &StrategyParameters,
    comparisons: &[PeriodComparison],
) -> CompareResponse {
    CompareResponse {
        annual_volatility: params.annual_volatility,
        minimum_safe_balance: params.minimum_safe_balance,
        scenarios: comparisons
            .iter()
            .map(|c| simulate_response(&params.with_twap_period(c.twap_period_months), &c.result))
            .collect(),
    }
}

fn run_simulate(
    cache: &Mutex<SimulationCache>,
    args: &StrategyArgs,
) -> Result<SimulateResponse, String> {
    let request = build_request(args)?;
    let mut cache = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let result = cache
        .get_or_simulate(&request.params, request.config)
        .map_err(|e| e.to_string())?;
    Ok(simulate_response(&request.params, &result))
}

fn run_compare(args: &StrategyArgs, periods: &[f64]) -> Result<CompareResponse, String> {
    let request = build_request(args)?;
    let comparisons =
        compare_periods(&request.params, periods, request.config).map_err(|e| e.to_string())?;
    Ok(compare_response(&request.params, &comparisons))
}

fn run_critical_decline(
    args: &StrategyArgs,
    solver: &SolverArgs,
) -> Result<CriticalDeclineResponse, String> {
    let request = build_request(args)?;
    let solver_config = build_solver_config(solver);
    let result = solve_critical_decline(&request.params, request.config, solver_config)
        .map_err(|e| e.to_string())?;
    Ok(CriticalDeclineResponse {
        twap_period_months: request.params.twap_period_months,
        minimum_safe_balance: request.params.minimum_safe_balance,
        result,
    })
}

/// Executes a one-shot CLI command and returns its JSON output.
pub fn run_cli_command(command: &Command) -> Result<String, String> {
    let json = match command {
        Command::Serve { .. } => return Err("serve is not a one-shot command".to_string()),
        Command::Simulate(strategy) => {
            let cache = Mutex::new(SimulationCache::new(1));
            serde_json::to_string_pretty(&run_simulate(&cache, strategy)?)
        }
        Command::Compare { strategy, periods } => {
            serde_json::to_string_pretty(&run_compare(strategy, periods)?)
        }
        Command::CriticalDecline { strategy, solver } => {
            serde_json::to_string_pretty(&run_critical_decline(strategy, solver)?)
        }
    };
    json.map_err(|e| format!("failed to encode response: {e}"))
}

fn router() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route(
            "/api/compare",
            get(compare_get_handler).post(compare_post_handler),
        )
        .route(
            "/api/critical-decline",
            get(critical_decline_get_handler).post(critical_decline_post_handler),
        )
        .fallback(not_found_handler)
        .with_state(AppState::default())
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "TWAP runway API listening");
    info!("Local access: http://127.0.0.1:{port}/api/simulate");

    axum::serve(listener, router()).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(
    State(state): State<AppState>,
    Query(payload): Query<SimulatePayload>,
) -> Response {
    simulate_handler_impl(state, payload)
}

async fn simulate_post_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    simulate_handler_impl(state, payload)
}

fn simulate_handler_impl(state: AppState, payload: SimulatePayload) -> Response {
    let args = strategy_args_from_payload(&payload);
    match run_simulate(&state.cache, &args) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(msg) => bad_request(&msg),
    }
}

async fn compare_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    compare_handler_impl(payload)
}

async fn compare_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    compare_handler_impl(payload)
}

fn compare_handler_impl(payload: SimulatePayload) -> Response {
    let args = strategy_args_from_payload(&payload);
    let periods = match payload.twap_periods {
        Some(list) => match list.into_periods() {
            Ok(periods) => periods,
            Err(msg) => return bad_request(&msg),
        },
        None => DEFAULT_COMPARE_PERIODS.to_vec(),
    };
    match run_compare(&args, &periods) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(msg) => bad_request(&msg),
    }
}

async fn critical_decline_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    critical_decline_handler_impl(payload)
}

async fn critical_decline_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    critical_decline_handler_impl(payload)
}

fn critical_decline_handler_impl(payload: SimulatePayload) -> Response {
    let args = strategy_args_from_payload(&payload);
    let solver = solver_args_from_payload(&payload);
    match run_critical_decline(&args, &solver) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(msg) => bad_request(&msg),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn bad_request(msg: &str) -> Response {
    warn!(error = msg, "rejected request");
    error_response(StatusCode::BAD_REQUEST, msg)
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn payload_from_json(json: &str) -> Result<SimulatePayload, String> {
    serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))
}
