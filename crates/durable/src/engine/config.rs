//! Orchestrator configuration

use std::time::Duration;

use crate::reliability::RetryPolicy;
use crate::workflow::ContinueOnFailurePolicy;

/// Configuration for the workflow orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Maximum step handlers running at once across all transactions
    pub max_concurrent_handlers: usize,

    /// Policy for workflows that do not set their own
    pub continue_on_failure: ContinueOnFailurePolicy,

    /// Retry of scheduled re-entries that hit a storage failure
    pub dispatch_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 64,
            continue_on_failure: ContinueOnFailurePolicy::default(),
            dispatch_retry: RetryPolicy::exponential()
                .with_max_retries(5)
                .with_interval(Duration::from_millis(200))
                .with_max_interval(Duration::from_secs(10)),
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from environment variables
    ///
    /// - `SAGA_MAX_CONCURRENT_HANDLERS`: handler concurrency limit
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = std::env::var("SAGA_MAX_CONCURRENT_HANDLERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config = config.with_max_concurrent_handlers(max);
        }
        config
    }

    pub fn with_max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = max.max(1);
        self
    }

    pub fn with_continue_on_failure(mut self, policy: ContinueOnFailurePolicy) -> Self {
        self.continue_on_failure = policy;
        self
    }

    pub fn with_dispatch_retry(mut self, policy: RetryPolicy) -> Self {
        self.dispatch_retry = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_handlers, 64);
        assert_eq!(
            config.continue_on_failure,
            ContinueOnFailurePolicy::CompensateAffected
        );
        assert_eq!(config.dispatch_retry.max_retries, 5);
    }

    #[test]
    fn test_builder() {
        let config = OrchestratorConfig::new()
            .with_max_concurrent_handlers(0)
            .with_continue_on_failure(ContinueOnFailurePolicy::CompensateAll)
            .with_dispatch_retry(RetryPolicy::no_retry());
        assert_eq!(config.max_concurrent_handlers, 1);
        assert_eq!(config.continue_on_failure, ContinueOnFailurePolicy::CompensateAll);
        assert_eq!(config.dispatch_retry, RetryPolicy::no_retry());
    }
}
