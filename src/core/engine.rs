use tracing::{debug, trace};

use super::types::{
    PeriodComparison, SimulationConfig, SimulationError, SimulationPoint, SimulationResult,
    StrategyParameters,
};

const GRID_TOLERANCE: f64 = 1e-6;
const STEP_COUNT_EPSILON: f64 = 1e-9;
const MAX_STEPS: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy)]
struct StepProjection {
    expected_balance: f64,
    bound_delta: f64,
}

impl StepProjection {
    fn lower_bound(self) -> f64 {
        self.expected_balance - self.bound_delta
    }

    fn upper_bound(self) -> f64 {
        self.expected_balance + self.bound_delta
    }
}

/// Tracks the first downward crossing of a threshold across consecutive steps.
#[derive(Debug)]
struct CrossoverDetector {
    threshold: f64,
    step_months: f64,
    previous: Option<(f64, f64)>,
    crossover_month: Option<f64>,
}

impl CrossoverDetector {
    fn new(threshold: f64, step_months: f64) -> Self {
        Self {
            threshold,
            step_months,
            previous: None,
            crossover_month: None,
        }
    }

    fn observe(&mut self, month: f64, value: f64) {
        if self.crossover_month.is_none()
            && let Some((prev_month, prev_value)) = self.previous
            && prev_value >= self.threshold
            && value < self.threshold
        {
            let ratio = (self.threshold - prev_value) / (value - prev_value);
            let crossing = prev_month + ratio * self.step_months;
            debug!(
                month,
                prev_value, value, ratio, crossing, "lower bound crossed minimum safe balance"
            );
            self.crossover_month = Some(crossing);
        }
        self.previous = Some((month, value));
    }

    fn crossover_month(&self) -> Option<f64> {
        self.crossover_month
    }
}

/// Runs the trajectory simulation, sampling the output roughly every 0.1 month.
pub fn simulate(
    params: &StrategyParameters,
    horizon_months: f64,
    step_months: f64,
) -> Result<SimulationResult, SimulationError> {
    simulate_with_config(params, SimulationConfig::new(horizon_months, step_months))
}

pub fn simulate_with_config(
    params: &StrategyParameters,
    config: SimulationConfig,
) -> Result<SimulationResult, SimulationError> {
    validate_parameters(params)?;
    let stride = validate_config(config)?;

    let steps = step_count(config);
    let mut detector = CrossoverDetector::new(params.minimum_safe_balance, config.step_months);
    let mut points = Vec::with_capacity((steps / stride).saturating_add(1));

    for i in 0..=steps {
        let month = i as f64 * config.step_months;
        let projection = project_step(params, month);
        detector.observe(month, projection.lower_bound());

        if i % stride == 0 {
            points.push(SimulationPoint {
                month,
                expected_balance: projection.expected_balance,
                upper_bound: projection.upper_bound(),
                lower_bound: projection.lower_bound(),
                is_crossover_sample: false,
            });
        }
    }

    let crossover_month = detector.crossover_month();
    if let Some(crossing) = crossover_month {
        mark_crossover_sample(&mut points, crossing, config.sample_interval_months);
    }

    trace!(
        twap_period_months = params.twap_period_months,
        annual_volatility = params.annual_volatility,
        samples = points.len(),
        ?crossover_month,
        "simulation finished"
    );

    Ok(SimulationResult {
        points,
        crossover_month,
    })
}

/// Evaluates the same strategy for each TWAP period, in the order given.
pub fn compare_periods(
    params: &StrategyParameters,
    periods: &[f64],
    config: SimulationConfig,
) -> Result<Vec<PeriodComparison>, SimulationError> {
    if periods.is_empty() {
        return Err(SimulationError::InvalidParameter(
            "at least one twap period is required".to_string(),
        ));
    }

    periods
        .iter()
        .map(|&period| {
            let scenario = params.with_twap_period(period);
            simulate_with_config(&scenario, config).map(|result| PeriodComparison {
                twap_period_months: period,
                result,
            })
        })
        .collect()
}

/// First month at which the expected balance falls below the minimum safe
/// balance when the TWAP units sell at `unit_price * (1 - decline)`.
pub fn decline_crossover_month(
    params: &StrategyParameters,
    config: SimulationConfig,
    decline: f64,
) -> Result<Option<f64>, SimulationError> {
    validate_parameters(params)?;
    validate_config(config)?;
    if !decline.is_finite() || !(0.0..1.0).contains(&decline) {
        return Err(SimulationError::InvalidParameter(
            "decline must be in [0, 1)".to_string(),
        ));
    }

    let declined_price = params.unit_price * (1.0 - decline);
    let mut detector = CrossoverDetector::new(params.minimum_safe_balance, config.step_months);
    for i in 0..=step_count(config) {
        let month = i as f64 * config.step_months;
        let twap_proceeds =
            params.remaining_units() * declined_price * twap_progress(params, month);
        let balance = params.immediate_proceeds() + twap_proceeds - params.monthly_spend * month;
        detector.observe(month, balance);
    }
    Ok(detector.crossover_month())
}

/// Renders a crossover month the way the summary line shows it.
pub fn describe_crossover(crossover_month: Option<f64>) -> String {
    match crossover_month {
        Some(month) => format!("month {month:.1}"),
        None => "no crossing".to_string(),
    }
}

fn project_step(params: &StrategyParameters, month: f64) -> StepProjection {
    let twap_proceeds =
        params.remaining_units() * params.unit_price * twap_progress(params, month);
    let expected_balance =
        params.immediate_proceeds() + twap_proceeds - params.monthly_spend * month;

    // Only the TWAP-sold portion is price exposed, and only until the sale completes.
    let exposure_months = month.min(params.twap_period_months);
    let cumulative_vol = params.monthly_volatility() * exposure_months.sqrt();

    StepProjection {
        expected_balance,
        bound_delta: twap_proceeds * cumulative_vol,
    }
}

fn twap_progress(params: &StrategyParameters, month: f64) -> f64 {
    (month / params.twap_period_months).min(1.0)
}

fn step_count(config: SimulationConfig) -> usize {
    (config.horizon_months / config.step_months + STEP_COUNT_EPSILON).floor() as usize
}

fn mark_crossover_sample(points: &mut [SimulationPoint], crossing: f64, sample_interval: f64) {
    let nearest = points
        .iter_mut()
        .map(|p| ((p.month - crossing).abs(), p))
        .min_by(|a, b| a.0.total_cmp(&b.0));

    if let Some((distance, point)) = nearest
        && distance <= sample_interval * 0.5 + GRID_TOLERANCE
    {
        point.is_crossover_sample = true;
    }
}

fn validate_parameters(params: &StrategyParameters) -> Result<(), SimulationError> {
    let fields = [
        ("total_units", params.total_units),
        ("immediate_units", params.immediate_units),
        ("unit_price", params.unit_price),
        ("monthly_spend", params.monthly_spend),
        ("twap_period_months", params.twap_period_months),
        ("minimum_safe_balance", params.minimum_safe_balance),
        ("annual_volatility", params.annual_volatility),
    ];
    if let Some((name, _)) = fields.iter().find(|(_, v)| !v.is_finite()) {
        return Err(SimulationError::InvalidParameter(format!(
            "{name} must be finite"
        )));
    }

    if params.twap_period_months <= 0.0 {
        return Err(SimulationError::InvalidParameter(
            "twap_period_months must be > 0".to_string(),
        ));
    }
    if params.unit_price <= 0.0 {
        return Err(SimulationError::InvalidParameter(
            "unit_price must be > 0".to_string(),
        ));
    }
    if params.immediate_units < 0.0 {
        return Err(SimulationError::InvalidParameter(
            "immediate_units must be >= 0".to_string(),
        ));
    }
    if params.immediate_units > params.total_units {
        return Err(SimulationError::InvalidParameter(
            "immediate_units must be <= total_units".to_string(),
        ));
    }
    if params.monthly_spend < 0.0 {
        return Err(SimulationError::InvalidParameter(
            "monthly_spend must be >= 0".to_string(),
        ));
    }
    if params.annual_volatility <= 0.0 {
        return Err(SimulationError::InvalidParameter(
            "annual_volatility must be > 0".to_string(),
        ));
    }
    Ok(())
}

/// Returns the step-index stride between retained output samples.
fn validate_config(config: SimulationConfig) -> Result<usize, SimulationError> {
    if !config.horizon_months.is_finite()
        || !config.step_months.is_finite()
        || !config.sample_interval_months.is_finite()
    {
        return Err(SimulationError::InvalidHorizon(
            "horizon, step and sample interval must be finite".to_string(),
        ));
    }
    if config.step_months <= 0.0 {
        return Err(SimulationError::InvalidHorizon(
            "step_months must be > 0".to_string(),
        ));
    }
    if config.step_months > config.horizon_months {
        return Err(SimulationError::InvalidHorizon(
            "step_months must be <= horizon_months".to_string(),
        ));
    }
    if config.horizon_months / config.step_months > MAX_STEPS {
        return Err(SimulationError::InvalidHorizon(format!(
            "horizon_months / step_months must be <= {MAX_STEPS}"
        )));
    }
    if config.sample_interval_months < config.step_months {
        return Err(SimulationError::InvalidHorizon(
            "sample_interval_months must be >= step_months".to_string(),
        ));
    }

    let ratio = config.sample_interval_months / config.step_months;
    let stride = ratio.round();
    if (ratio - stride).abs() > GRID_TOLERANCE {
        return Err(SimulationError::InvalidHorizon(
            "sample_interval_months must be a whole multiple of step_months".to_string(),
        ));
    }
    Ok(stride as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, prop_assume, proptest};

    const EPS: f64 = 1e-6;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn treasury_params() -> StrategyParameters {
        StrategyParameters {
            total_units: 6_000.0,
            immediate_units: 1_000.0,
            unit_price: 3_200.0,
            monthly_spend: 1_458_333.33,
            twap_period_months: 3.0,
            minimum_safe_balance: 2_000_000.0,
            annual_volatility: 0.45,
        }
    }

    fn reference_crossover(params: &StrategyParameters, horizon: f64, step: f64) -> Option<f64> {
        let steps = (horizon / step + STEP_COUNT_EPSILON).floor() as usize;
        let mut prev: Option<f64> = None;
        for i in 0..=steps {
            let t = i as f64 * step;
            let lower = project_step(params, t).lower_bound();
            if let Some(p) = prev
                && p >= params.minimum_safe_balance
                && lower < params.minimum_safe_balance
            {
                return Some((i - 1) as f64 * step
                    + (params.minimum_safe_balance - p) / (lower - p) * step);
            }
            prev = Some(lower);
        }
        None
    }

    #[test]
    fn treasury_scenario_starts_at_immediate_proceeds() {
        let result = simulate(&treasury_params(), 12.0, 0.05).expect("valid inputs");
        let first = result.points[0];
        assert_eq!(first.month, 0.0);
        assert_eq!(first.expected_balance, 3_200_000.0);
        assert_eq!(first.lower_bound, 3_200_000.0);
        assert_eq!(first.upper_bound, 3_200_000.0);
    }

    #[test]
    fn treasury_scenario_samples_every_tenth_of_a_month() {
        let result = simulate(&treasury_params(), 12.0, 0.05).expect("valid inputs");
        assert_eq!(result.points.len(), 121);
        for (idx, point) in result.points.iter().enumerate() {
            assert_close(point.month, idx as f64 * 0.1, EPS);
        }
        assert_close(result.points[120].month, 12.0, EPS);
    }

    #[test]
    fn treasury_scenario_crosses_after_twap_completes() {
        let params = treasury_params();
        let result = simulate(&params, 12.0, 0.05).expect("valid inputs");
        let crossing = result.crossover_month.expect("crossing expected");
        assert!(crossing > 3.0 && crossing < 12.0, "crossing at {crossing}");

        let expected = reference_crossover(&params, 12.0, 0.05).expect("reference crossing");
        assert_close(crossing, expected, 1e-12);
        assert_close(crossing, 9.3257, 1e-3);
    }

    #[test]
    fn treasury_scenario_balance_falls_faster_after_twap() {
        let result = simulate(&treasury_params(), 12.0, 0.05).expect("valid inputs");
        let at = |month: f64| {
            result
                .points
                .iter()
                .find(|p| (p.month - month).abs() < EPS)
                .expect("sample exists")
                .expected_balance
        };
        let slope_during = at(2.0) - at(1.0);
        let slope_after = at(5.0) - at(4.0);
        assert!(slope_during > 0.0);
        assert!(slope_after < slope_during);
        assert_close(slope_after, -1_458_333.33, 1e-3);
    }

    #[test]
    fn exactly_one_sample_marks_the_crossover() {
        let result = simulate(&treasury_params(), 12.0, 0.05).expect("valid inputs");
        let crossing = result.crossover_month.expect("crossing expected");
        let marked = result
            .points
            .iter()
            .filter(|p| p.is_crossover_sample)
            .collect::<Vec<_>>();
        assert_eq!(marked.len(), 1);
        assert!((marked[0].month - crossing).abs() <= 0.05 + EPS);
        assert_eq!(result.crossover_sample(), Some(marked[0]));
    }

    #[test]
    fn crossover_interpolation_reproduces_threshold() {
        let params = treasury_params();
        let step = 0.05;
        let result = simulate(&params, 12.0, step).expect("valid inputs");
        let crossing = result.crossover_month.expect("crossing expected");

        let prev_index = (crossing / step).floor();
        let prev_t = prev_index * step;
        let next_t = prev_t + step;
        assert!(crossing >= prev_t && crossing < next_t);

        let prev = project_step(&params, prev_t).lower_bound();
        let next = project_step(&params, next_t).lower_bound();
        assert!(prev >= params.minimum_safe_balance);
        assert!(next < params.minimum_safe_balance);
        let interpolated = prev + (next - prev) * (crossing - prev_t) / step;
        assert_close(interpolated, params.minimum_safe_balance, 1e-4);
    }

    #[test]
    fn no_crossing_when_threshold_is_unreachable() {
        let mut params = treasury_params();
        params.minimum_safe_balance = -1e12;
        let result = simulate(&params, 12.0, 0.05).expect("valid inputs");
        assert!(result.crossover_month.is_none());
        assert!(result.points.iter().all(|p| !p.is_crossover_sample));
    }

    #[test]
    fn already_unsafe_at_start_is_not_a_crossing() {
        let mut params = treasury_params();
        params.minimum_safe_balance = 20_000_000.0;
        params.monthly_spend = 2_000_000.0;
        let result = simulate(&params, 12.0, 0.05).expect("valid inputs");
        assert!(
            result
                .points
                .iter()
                .all(|p| p.lower_bound < params.minimum_safe_balance)
        );
        assert!(result.crossover_month.is_none());
        assert!(result.points.iter().all(|p| !p.is_crossover_sample));
    }

    #[test]
    fn unsafe_start_that_recovers_then_crosses_is_reported() {
        // Lower bound starts at 3.2M, climbs to 9.6M by month 3, then falls
        // as 15.6M - 2M * t once the TWAP completes.
        let mut params = treasury_params();
        params.minimum_safe_balance = 5_000_000.0;
        params.monthly_spend = 2_000_000.0;
        let result = simulate(&params, 12.0, 0.05).expect("valid inputs");
        assert!(result.points[0].lower_bound < params.minimum_safe_balance);
        assert_close(result.crossover_month.expect("crossing expected"), 5.3, 1e-6);
    }

    #[test]
    fn only_first_crossing_is_recorded() {
        let mut detector = CrossoverDetector::new(8.0, 1.0);
        for (month, value) in [(0.0, 10.0), (1.0, 6.0), (2.0, 12.0), (3.0, 2.0)] {
            detector.observe(month, value);
        }
        assert_close(detector.crossover_month().expect("crossing"), 0.5, EPS);
    }

    #[test]
    fn crossing_from_exactly_the_threshold_starts_at_previous_step() {
        let mut detector = CrossoverDetector::new(8.0, 0.5);
        detector.observe(0.0, 8.0);
        detector.observe(0.5, 4.0);
        assert_eq!(detector.crossover_month(), Some(0.0));
    }

    #[test]
    fn simulate_is_idempotent() {
        let params = treasury_params();
        let a = simulate(&params, 12.0, 0.05).expect("valid inputs");
        let b = simulate(&params, 12.0, 0.05).expect("valid inputs");
        assert_eq!(a, b);
    }

    #[test]
    fn bounds_stop_widening_once_twap_completes() {
        let result = simulate(&treasury_params(), 12.0, 0.05).expect("valid inputs");
        let widths = result
            .points
            .iter()
            .filter(|p| p.month >= 3.0 - EPS)
            .map(|p| p.upper_bound - p.lower_bound)
            .collect::<Vec<_>>();
        for width in &widths {
            assert_close(*width, widths[0], 1e-6);
        }
    }

    #[test]
    fn coarser_sample_interval_keeps_crossover_precision() {
        let params = treasury_params();
        let fine = simulate(&params, 12.0, 0.05).expect("valid inputs");
        let coarse = simulate_with_config(
            &params,
            SimulationConfig {
                horizon_months: 12.0,
                step_months: 0.05,
                sample_interval_months: 1.0,
            },
        )
        .expect("valid inputs");
        assert_eq!(coarse.points.len(), 13);
        assert_eq!(fine.crossover_month, coarse.crossover_month);
        assert_eq!(
            coarse.points.iter().filter(|p| p.is_crossover_sample).count(),
            1
        );
    }

    #[test]
    fn rejects_invalid_parameters() {
        let cases: [fn(&mut StrategyParameters); 7] = [
            |p| p.twap_period_months = 0.0,
            |p| p.unit_price = 0.0,
            |p| p.immediate_units = 7_000.0,
            |p| p.immediate_units = -1.0,
            |p| p.annual_volatility = 0.0,
            |p| p.monthly_spend = -1.0,
            |p| p.total_units = f64::NAN,
        ];
        for mutate in cases {
            let mut params = treasury_params();
            mutate(&mut params);
            let err = simulate(&params, 12.0, 0.05).expect_err("must reject");
            assert!(matches!(err, SimulationError::InvalidParameter(_)), "{err}");
        }
    }

    #[test]
    fn rejects_invalid_horizon() {
        let params = treasury_params();
        for (horizon, step) in [(12.0, 0.0), (12.0, -0.05), (0.01, 0.05), (f64::INFINITY, 0.05)] {
            let err = simulate(&params, horizon, step).expect_err("must reject");
            assert!(matches!(err, SimulationError::InvalidHorizon(_)), "{err}");
        }

        let err = simulate_with_config(
            &params,
            SimulationConfig {
                horizon_months: 12.0,
                step_months: 0.05,
                sample_interval_months: 0.12,
            },
        )
        .expect_err("must reject misaligned interval");
        assert!(matches!(err, SimulationError::InvalidHorizon(_)));
    }

    #[test]
    fn rejects_unbounded_step_counts() {
        let params = treasury_params();
        for (horizon, step) in [(1e19, 1.0), (1e300, 1.0), (12.0, 1e-12)] {
            let err = simulate(&params, horizon, step).expect_err("must reject");
            assert!(matches!(err, SimulationError::InvalidHorizon(_)), "{err}");
        }
        let tiny_step = SimulationConfig::new(12.0, 1e-12);
        assert!(decline_crossover_month(&params, tiny_step, 0.1).is_err());

        let fine = simulate(&params, 100.0, 0.001).expect("within step budget");
        assert_eq!(fine.points.len(), 1_001);
    }

    #[test]
    fn compare_periods_preserves_order_and_shortens_runway_for_longer_twaps() {
        let comparisons = compare_periods(
            &treasury_params(),
            &[3.0, 6.0, 9.0],
            SimulationConfig::default(),
        )
        .expect("valid inputs");
        let periods = comparisons
            .iter()
            .map(|c| c.twap_period_months)
            .collect::<Vec<_>>();
        assert_eq!(periods, vec![3.0, 6.0, 9.0]);

        let crossings = comparisons
            .iter()
            .map(|c| c.result.crossover_month.expect("crossing expected"))
            .collect::<Vec<_>>();
        assert!(crossings[0] > crossings[1]);
        assert!(crossings[1] > crossings[2]);
    }

    #[test]
    fn compare_periods_rejects_empty_and_invalid_periods() {
        let params = treasury_params();
        assert!(compare_periods(&params, &[], SimulationConfig::default()).is_err());
        assert!(compare_periods(&params, &[3.0, 0.0], SimulationConfig::default()).is_err());
    }

    #[test]
    fn decline_crossover_moves_earlier_with_deeper_declines() {
        let params = treasury_params();
        let config = SimulationConfig::default();
        let none = decline_crossover_month(&params, config, 0.0)
            .expect("valid")
            .expect("crossing expected");
        let deep = decline_crossover_month(&params, config, 0.5)
            .expect("valid")
            .expect("crossing expected");
        assert!(deep < none);
        assert!(decline_crossover_month(&params, config, 1.0).is_err());
    }

    #[test]
    fn describe_crossover_formats_summary() {
        assert_eq!(describe_crossover(Some(9.3257)), "month 9.3");
        assert_eq!(describe_crossover(None), "no crossing");
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(48))]

        #[test]
        fn prop_bounds_bracket_expected_balance(
            total in 1u32..20_000,
            immediate_pct in 0u32..101,
            price in 1u32..10_000,
            spend in 0u32..5_000_000,
            period_tenths in 1u32..240,
            vol_bp in 1u32..20_000,
            threshold in 0u32..10_000_000
        ) {
            let total_units = total as f64;
            let params = StrategyParameters {
                total_units,
                immediate_units: total_units * immediate_pct as f64 / 100.0,
                unit_price: price as f64,
                monthly_spend: spend as f64,
                twap_period_months: period_tenths as f64 / 10.0,
                minimum_safe_balance: threshold as f64,
                annual_volatility: vol_bp as f64 / 10_000.0,
            };
            let result = simulate(&params, 12.0, 0.05).expect("valid inputs");

            prop_assert!(result.points[0].expected_balance == params.immediate_proceeds());
            for pair in result.points.windows(2) {
                prop_assert!(pair[0].month < pair[1].month);
            }
            for point in &result.points {
                prop_assert!(point.lower_bound <= point.expected_balance);
                prop_assert!(point.expected_balance <= point.upper_bound);
            }
            prop_assert!(result.points.iter().filter(|p| p.is_crossover_sample).count() <= 1);
            if let Some(crossing) = result.crossover_month {
                prop_assert!((0.0..=12.0).contains(&crossing));
            }
        }

        #[test]
        fn prop_post_twap_slope_is_monthly_spend(
            spend in 0u32..5_000_000,
            period_tenths in 1u32..100
        ) {
            let mut params = treasury_params();
            params.monthly_spend = spend as f64;
            params.twap_period_months = period_tenths as f64 / 10.0;
            let result = simulate(&params, 12.0, 0.05).expect("valid inputs");
            let after = result
                .points
                .iter()
                .filter(|p| p.month >= params.twap_period_months + EPS)
                .collect::<Vec<_>>();
            for pair in after.windows(2) {
                let slope = (pair[1].expected_balance - pair[0].expected_balance)
                    / (pair[1].month - pair[0].month);
                let tolerance = 1e-3 * (1.0 + params.monthly_spend);
                prop_assert!((slope + params.monthly_spend).abs() <= tolerance);
            }
        }

        #[test]
        fn prop_doubling_volatility_widens_band_and_never_delays_crossing(
            vol_bp in 100u32..10_000,
            threshold in 0u32..4_000_000,
            period_tenths in 5u32..120
        ) {
            let mut base = treasury_params();
            base.annual_volatility = vol_bp as f64 / 10_000.0;
            base.minimum_safe_balance = threshold as f64;
            base.twap_period_months = period_tenths as f64 / 10.0;
            let mut doubled = base;
            doubled.annual_volatility *= 2.0;

            let a = simulate(&base, 12.0, 0.05).expect("valid inputs");
            let b = simulate(&doubled, 12.0, 0.05).expect("valid inputs");
            for (pa, pb) in a.points.iter().zip(&b.points).skip(1) {
                let delta_a = pa.upper_bound - pa.expected_balance;
                let delta_b = pb.upper_bound - pb.expected_balance;
                prop_assert!(delta_b > delta_a);
            }

            // Both runs start above the threshold, so a wider band can only cross earlier.
            prop_assume!(a.points[0].lower_bound >= base.minimum_safe_balance);
            if let Some(crossing_a) = a.crossover_month {
                let crossing_b = b.crossover_month.expect("wider band must also cross");
                prop_assert!(crossing_b <= crossing_a + 1e-9);
            }
        }
    }
}
