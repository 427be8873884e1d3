use serde::Serialize;
use tracing::debug;

use super::engine::decline_crossover_month;
use super::types::{SimulationConfig, SimulationError, StrategyParameters};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CriticalDeclineConfig {
    pub target_month: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
}

impl Default for CriticalDeclineConfig {
    fn default() -> Self {
        Self {
            target_month: 12.0,
            search_min: 0.0,
            search_max: 0.99,
            tolerance: 1e-4,
            max_iterations: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalDeclineIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_decline: f64,
    pub crossover_month: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalDeclineResult {
    pub target_month: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub solved_decline: Option<f64>,
    pub achieved_crossover_month: Option<f64>,
    pub iterations: Vec<CriticalDeclineIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

/// Finds the smallest decline in the TWAP sale price that makes the expected
/// balance fall below the minimum safe balance no later than `target_month`.
///
/// The crossing month is non-increasing in the decline, so a bisection over
/// `[search_min, search_max]` brackets the critical value.
pub fn solve_critical_decline(
    params: &StrategyParameters,
    sim_config: SimulationConfig,
    config: CriticalDeclineConfig,
) -> Result<CriticalDeclineResult, SimulationError> {
    validate_config(sim_config, config)?;

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let low_eval = evaluate_candidate(params, sim_config, config, config.search_min)?;
    let high_eval = evaluate_candidate(params, sim_config, config, config.search_max)?;

    let mut solved_decline = None;
    let mut converged = false;
    let feasible;
    let message;

    if low_eval.hits_target {
        solved_decline = Some(config.search_min);
        converged = true;
        feasible = true;
        message = "Already breaches the threshold by the target month at the lower decline bound."
            .to_string();
    } else if !high_eval.hits_target {
        feasible = false;
        message = "No decline within the search bounds breaches the threshold by the target month."
            .to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = config.search_max;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let eval = evaluate_candidate(params, sim_config, config, mid)?;
            iterations.push(CriticalDeclineIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_decline: mid,
                crossover_month: eval.crossover_month,
            });

            if eval.hits_target {
                hi = mid;
            } else {
                lo = mid;
            }

            if (hi - lo).abs() <= config.tolerance {
                converged = true;
                solved_decline = Some(hi);
                break;
            }
        }
        if solved_decline.is_none() {
            solved_decline = Some(hi);
        }
        feasible = true;
        message = if converged {
            "Solved critical price decline.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        };
    }

    let achieved_crossover_month = match solved_decline {
        Some(decline) => decline_crossover_month(params, sim_config, decline)?,
        None => None,
    };

    debug!(
        target_month = config.target_month,
        ?solved_decline,
        iterations = iterations.len(),
        converged,
        "critical decline search finished"
    );

    Ok(CriticalDeclineResult {
        target_month: config.target_month,
        search_min: config.search_min,
        search_max: config.search_max,
        tolerance: config.tolerance,
        max_iterations: config.max_iterations,
        solved_decline,
        achieved_crossover_month,
        iterations,
        converged,
        feasible,
        message,
    })
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    crossover_month: Option<f64>,
    hits_target: bool,
}

fn evaluate_candidate(
    params: &StrategyParameters,
    sim_config: SimulationConfig,
    config: CriticalDeclineConfig,
    decline: f64,
) -> Result<CandidateEval, SimulationError> {
    let crossover_month = decline_crossover_month(params, sim_config, decline)?;
    Ok(CandidateEval {
        crossover_month,
        hits_target: crossover_month.is_some_and(|m| m <= config.target_month),
    })
}

fn validate_config(
    sim_config: SimulationConfig,
    config: CriticalDeclineConfig,
) -> Result<(), SimulationError> {
    let invalid = |msg: &str| -> Result<(), SimulationError> {
        Err(SimulationError::InvalidSolver(msg.to_string()))
    };

    if !config.target_month.is_finite() || config.target_month <= 0.0 {
        return invalid("target_month must be > 0");
    }
    if config.target_month > sim_config.horizon_months {
        return invalid("target_month must be <= horizon_months");
    }
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return invalid("search bounds must be finite");
    }
    if config.search_min < 0.0 || config.search_max >= 1.0 {
        return invalid("search bounds must lie in [0, 1)");
    }
    if config.search_max <= config.search_min {
        return invalid("search_max must be greater than search_min");
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return invalid("tolerance must be > 0");
    }
    if config.max_iterations == 0 {
        return invalid("max_iterations must be > 0");
    }
    Ok(())
}
