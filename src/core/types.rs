use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_HORIZON_MONTHS: f64 = 12.0;
pub const DEFAULT_STEP_MONTHS: f64 = 0.05;
pub const DEFAULT_SAMPLE_INTERVAL_MONTHS: f64 = 0.1;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimulationError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid horizon: {0}")]
    InvalidHorizon(String),
    #[error("invalid solver configuration: {0}")]
    InvalidSolver(String),
}

/// Inputs of one liquidation strategy run. Volatility is a fraction (0.45 = 45%).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyParameters {
    pub total_units: f64,
    pub immediate_units: f64,
    pub unit_price: f64,
    pub monthly_spend: f64,
    pub twap_period_months: f64,
    pub minimum_safe_balance: f64,
    pub annual_volatility: f64,
}

impl StrategyParameters {
    pub fn remaining_units(&self) -> f64 {
        self.total_units - self.immediate_units
    }

    pub fn immediate_proceeds(&self) -> f64 {
        self.immediate_units * self.unit_price
    }

    pub fn monthly_volatility(&self) -> f64 {
        self.annual_volatility / 12f64.sqrt()
    }

    pub fn with_twap_period(self, twap_period_months: f64) -> Self {
        Self {
            twap_period_months,
            ..self
        }
    }
}

/// Integration step and output sampling are decoupled: the step drives
/// crossover precision, the sample interval drives the size of the series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationConfig {
    pub horizon_months: f64,
    pub step_months: f64,
    pub sample_interval_months: f64,
}

impl SimulationConfig {
    /// Picks the smallest whole multiple of `step_months` that is at least the
    /// default sample interval, so any positive step yields an aligned grid.
    pub fn new(horizon_months: f64, step_months: f64) -> Self {
        let stride = if step_months > 0.0 && step_months.is_finite() {
            (DEFAULT_SAMPLE_INTERVAL_MONTHS / step_months - 1e-6).ceil().max(1.0)
        } else {
            1.0
        };
        Self {
            horizon_months,
            step_months,
            sample_interval_months: stride * step_months,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HORIZON_MONTHS, DEFAULT_STEP_MONTHS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationPoint {
    pub month: f64,
    pub expected_balance: f64,
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub is_crossover_sample: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub points: Vec<SimulationPoint>,
    pub crossover_month: Option<f64>,
}

impl SimulationResult {
    pub fn crossover_sample(&self) -> Option<&SimulationPoint> {
        self.points.iter().find(|p| p.is_crossover_sample)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodComparison {
    pub twap_period_months: f64,
    pub result: SimulationResult,
}
