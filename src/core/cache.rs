use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use super::engine::simulate_with_config;
use super::types::{SimulationConfig, SimulationError, SimulationResult, StrategyParameters};

pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Bit patterns of every input field. Any change in any field is a new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SimulationKey([u64; 10]);

impl SimulationKey {
    fn new(params: &StrategyParameters, config: SimulationConfig) -> Self {
        Self([
            params.total_units.to_bits(),
            params.immediate_units.to_bits(),
            params.unit_price.to_bits(),
            params.monthly_spend.to_bits(),
            params.twap_period_months.to_bits(),
            params.minimum_safe_balance.to_bits(),
            params.annual_volatility.to_bits(),
            config.horizon_months.to_bits(),
            config.step_months.to_bits(),
            config.sample_interval_months.to_bits(),
        ])
    }
}

/// Memoises simulation results for repeated requests with identical inputs.
#[derive(Debug)]
pub struct SimulationCache {
    capacity: usize,
    entries: HashMap<SimulationKey, Arc<SimulationResult>>,
}

impl SimulationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn get_or_simulate(
        &mut self,
        params: &StrategyParameters,
        config: SimulationConfig,
    ) -> Result<Arc<SimulationResult>, SimulationError> {
        let key = SimulationKey::new(params, config);
        if let Some(hit) = self.entries.get(&key) {
            trace!("simulation cache hit");
            return Ok(Arc::clone(hit));
        }

        let result = Arc::new(simulate_with_config(params, config)?);
        if self.entries.len() >= self.capacity {
            trace!(entries = self.entries.len(), "simulation cache full, clearing");
            self.entries.clear();
        }
        self.entries.insert(key, Arc::clone(&result));
        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for SimulationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
