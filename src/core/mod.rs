mod cache;
mod engine;
mod solver;
mod types;

pub use cache::{DEFAULT_CACHE_CAPACITY, SimulationCache};
pub use engine::{
    compare_periods, decline_crossover_month, describe_crossover, simulate, simulate_with_config,
};
pub use solver::{
    CriticalDeclineConfig, CriticalDeclineIteration, CriticalDeclineResult, solve_critical_decline,
};
pub use types::{
    DEFAULT_HORIZON_MONTHS, DEFAULT_SAMPLE_INTERVAL_MONTHS, DEFAULT_STEP_MONTHS, PeriodComparison,
    SimulationConfig, SimulationError, SimulationPoint, SimulationResult, StrategyParameters,
};
