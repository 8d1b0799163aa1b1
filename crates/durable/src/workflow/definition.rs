//! Step and workflow definitions

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ResultSelector;
use crate::duration_serde::option_millis;
use crate::reliability::RetryPolicy;
use crate::step::Handler;

/// Predicate deciding whether a step runs, given the transaction input and
/// the outputs of completed steps
pub type Condition = Arc<dyn Fn(&Value, &BTreeMap<String, Value>) -> bool + Send + Sync>;

/// One node of a workflow graph
///
/// # Example
///
/// ```ignore
/// let charge = StepDefinition::new("charge_payment", handler_fn(charge))
///     .with_compensation(handler_fn(refund))
///     .with_max_retries(3)
///     .with_retry_interval(Duration::from_secs(2))
///     .with_timeout(Duration::from_secs(10))
///     .depends_on(["reserve_inventory"]);
/// ```
#[derive(Clone)]
pub struct StepDefinition {
    pub(crate) id: String,
    pub(crate) invoke: Handler,
    pub(crate) compensate: Option<Handler>,
    pub(crate) retry: RetryPolicy,
    pub(crate) timeout: Option<Duration>,
    pub(crate) depends_on: BTreeSet<String>,
    pub(crate) continue_on_permanent_failure: bool,
    pub(crate) tolerate_skipped: bool,
    pub(crate) is_async: bool,
    pub(crate) condition: Option<Condition>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, invoke: Handler) -> Self {
        Self {
            id: id.into(),
            invoke,
            compensate: None,
            retry: RetryPolicy::no_retry(),
            timeout: None,
            depends_on: BTreeSet::new(),
            continue_on_permanent_failure: false,
            tolerate_skipped: false,
            is_async: false,
            condition: None,
        }
    }

    /// Handler that undoes the effects of a completed invoke
    pub fn with_compensation(mut self, compensate: Handler) -> Self {
        self.compensate = Some(compensate);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry = self.retry.with_interval(interval);
        self
    }

    /// Per-attempt deadline; async steps measure it until their callback
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Steps that must complete before this one starts
    pub fn depends_on<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(steps.into_iter().map(Into::into));
        self
    }

    /// A permanent failure of this step does not revert the transaction;
    /// independent branches keep running
    pub fn continue_on_permanent_failure(mut self) -> Self {
        self.continue_on_permanent_failure = true;
        self
    }

    /// Run even when a predecessor was skipped
    pub fn tolerate_skipped(mut self) -> Self {
        self.tolerate_skipped = true;
        self
    }

    /// The invoke handler only starts the work; completion arrives later via
    /// `register_step_success` / `register_step_failure`
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// Skip the step unless the predicate holds
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Value, &BTreeMap<String, Value>) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn invoke_handler(&self) -> &Handler {
        &self.invoke
    }

    pub fn compensate_handler(&self) -> Option<&Handler> {
        self.compensate.as_ref()
    }

    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.depends_on
    }

    pub fn continues_on_permanent_failure(&self) -> bool {
        self.continue_on_permanent_failure
    }

    pub fn tolerates_skipped(&self) -> bool {
        self.tolerate_skipped
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Evaluate the step condition
    pub fn should_run(&self, input: &Value, outputs: &BTreeMap<String, Value>) -> bool {
        self.condition
            .as_ref()
            .map_or(true, |condition| condition(input, outputs))
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("has_compensation", &self.compensate.is_some())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("depends_on", &self.depends_on)
            .field(
                "continue_on_permanent_failure",
                &self.continue_on_permanent_failure,
            )
            .field("tolerate_skipped", &self.tolerate_skipped)
            .field("is_async", &self.is_async)
            .field("has_condition", &self.condition.is_some())
            .finish()
    }
}

/// What happens once a workflow with tolerated permanent failures settles
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContinueOnFailurePolicy {
    /// Compensate the failed steps' descendants and any ancestors that only
    /// fed them, then finish as failed
    #[default]
    CompensateAffected,

    /// Revert every completed step
    CompensateAll,

    /// Finish as failed without compensating anything
    FailWithoutCompensation,
}

/// Workflow-wide options
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowOptions {
    /// Keep the execution record of finished transactions this long
    #[serde(default, with = "option_millis")]
    pub retention_time: Option<Duration>,

    /// Transaction deadline measured from its start
    #[serde(default, with = "option_millis")]
    pub timeout: Option<Duration>,

    /// Expiry applied to in-flight checkpoints
    #[serde(default, with = "option_millis")]
    pub store_ttl: Option<Duration>,

    /// Overrides the orchestrator-wide policy
    #[serde(default)]
    pub continue_on_failure: Option<ContinueOnFailurePolicy>,
}

/// A validated, registered workflow graph
///
/// Built with [`WorkflowBuilder`](super::WorkflowBuilder). Steps are stored
/// in a topological order so dependencies always precede dependents.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub(crate) id: String,
    pub(crate) steps: Vec<StepDefinition>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) successors: HashMap<String, BTreeSet<String>>,
    pub(crate) result_from: Option<ResultSelector>,
    pub(crate) options: WorkflowOptions,
}

impl WorkflowDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Steps in topological order
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.index.get(step_id).map(|&i| &self.steps[i])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps that directly depend on `step_id`
    pub fn successors(&self, step_id: &str) -> impl Iterator<Item = &str> {
        self.successors
            .get(step_id)
            .into_iter()
            .flat_map(|s| s.iter().map(String::as_str))
    }

    /// Steps `step_id` directly depends on
    pub fn predecessors(&self, step_id: &str) -> impl Iterator<Item = &str> {
        self.step(step_id)
            .into_iter()
            .flat_map(|s| s.depends_on.iter().map(String::as_str))
    }

    /// Every step reachable from `roots` through successor edges, roots excluded
    pub fn descendants<I, S>(&self, roots: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut found = BTreeSet::new();
        let mut stack: Vec<String> = roots
            .into_iter()
            .map(|root| root.as_ref().to_string())
            .collect();
        while let Some(current) = stack.pop() {
            for next in self.successors(&current) {
                if found.insert(next.to_string()) {
                    stack.push(next.to_string());
                }
            }
        }
        found
    }

    pub fn result_from(&self) -> Option<&ResultSelector> {
        self.result_from.as_ref()
    }

    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("steps", &self.steps)
            .field("result_from", &self.result_from)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::handler_fn;
    use crate::workflow::WorkflowBuilder;

    fn noop() -> Handler {
        handler_fn(|_| async { Ok(Value::Null) })
    }

    #[test]
    fn test_step_builder() {
        let step = StepDefinition::new("charge", noop())
            .with_compensation(noop())
            .with_max_retries(2)
            .with_retry_interval(Duration::from_millis(50))
            .with_timeout(Duration::from_secs(1))
            .depends_on(["reserve"])
            .asynchronous();

        assert_eq!(step.id(), "charge");
        assert!(step.has_compensation());
        assert_eq!(step.retry_policy().max_retries, 2);
        assert_eq!(step.retry_policy().interval, Duration::from_millis(50));
        assert_eq!(step.timeout(), Some(Duration::from_secs(1)));
        assert!(step.dependencies().contains("reserve"));
        assert!(step.is_async());
        assert!(!step.continues_on_permanent_failure());
    }

    #[test]
    fn test_condition() {
        let step = StepDefinition::new("gift_wrap", noop())
            .when(|input, _| input["gift"].as_bool().unwrap_or(false));

        let outputs = BTreeMap::new();
        assert!(step.should_run(&serde_json::json!({"gift": true}), &outputs));
        assert!(!step.should_run(&serde_json::json!({}), &outputs));
        assert!(StepDefinition::new("plain", noop()).should_run(&Value::Null, &outputs));
    }

    #[test]
    fn test_graph_navigation() {
        //   a → b → d
        //   a → c ↗
        let def = WorkflowBuilder::new("diamond")
            .step(StepDefinition::new("a", noop()))
            .step(StepDefinition::new("b", noop()).depends_on(["a"]))
            .step(StepDefinition::new("c", noop()).depends_on(["a"]))
            .step(StepDefinition::new("d", noop()).depends_on(["b", "c"]))
            .build()
            .unwrap();

        let succ: Vec<&str> = def.successors("a").collect();
        assert_eq!(succ, vec!["b", "c"]);
        let pred: Vec<&str> = def.predecessors("d").collect();
        assert_eq!(pred, vec!["b", "c"]);
        assert_eq!(def.successors("d").count(), 0);

        let desc = def.descendants(["b"]);
        assert_eq!(desc.into_iter().collect::<Vec<_>>(), vec!["d".to_string()]);
        assert_eq!(def.descendants(["a"]).len(), 3);
    }

    #[test]
    fn test_options_serialization() {
        let options = WorkflowOptions {
            retention_time: Some(Duration::from_secs(60)),
            timeout: None,
            store_ttl: None,
            continue_on_failure: Some(ContinueOnFailurePolicy::CompensateAll),
        };
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["retention_time"], 60_000);
        assert_eq!(json["continue_on_failure"], "compensate_all");
    }
}
