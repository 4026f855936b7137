//! Execution parameters.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bound on concurrently executing nodes.
    pub max_concurrent: usize,
    /// Per-node wait on the input tracker.
    pub input_timeout: Duration,
    /// Iteration cap for loop nodes without their own configured cap.
    pub max_iterations: usize,
    /// Wall-clock bound for a single loop iteration.
    pub iteration_timeout: Duration,
    /// Wall-clock bound for a whole loop (all iterations).
    pub total_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            input_timeout: Duration::from_secs(60),
            max_iterations: 100,
            iteration_timeout: Duration::from_millis(30_000),
            total_timeout: Duration::from_millis(300_000),
        }
    }
}

impl ExecutorConfig {
    pub fn with_input_timeout(mut self, timeout: Duration) -> Self {
        self.input_timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.input_timeout, Duration::from_secs(60));
        assert_eq!(config.max_iterations, 100);
    }

    #[test]
    fn max_concurrent_floor_is_one() {
        let config = ExecutorConfig::default().with_max_concurrent(0);
        assert_eq!(config.max_concurrent, 1);
    }
}
