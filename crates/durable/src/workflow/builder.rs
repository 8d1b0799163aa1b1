//! Workflow graph construction and validation

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use super::definition::{ContinueOnFailurePolicy, StepDefinition, WorkflowDefinition, WorkflowOptions};
use super::ResultSelector;
use crate::transaction::KEY_SEPARATOR;

/// Separator between a sub-flow prefix and the nested step id
pub const SUB_FLOW_SEPARATOR: char = '.';

/// Errors from building a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow {0} has no steps")]
    Empty(String),

    #[error("invalid identifier '{0}': must be non-empty and must not contain ':'")]
    InvalidId(String),

    #[error("workflow {workflow_id} defines step {step_id} more than once")]
    DuplicateStep { workflow_id: String, step_id: String },

    #[error("step {step_id} depends on unknown step {dependency}")]
    UnknownDependency { step_id: String, dependency: String },

    #[error("workflow {workflow_id} has a dependency cycle through {steps:?}")]
    Cycle {
        workflow_id: String,
        steps: Vec<String>,
    },

    #[error("result selector references unknown step {0}")]
    UnknownResultStep(String),
}

/// Builder for [`WorkflowDefinition`]
///
/// # Example
///
/// ```ignore
/// let workflow = WorkflowBuilder::new("order_placement")
///     .step(StepDefinition::new("reserve_inventory", reserve).with_compensation(release))
///     .step(StepDefinition::new("authorize_payment", authorize).with_compensation(void))
///     .step(
///         StepDefinition::new("create_shipment", ship)
///             .depends_on(["reserve_inventory", "authorize_payment"]),
///     )
///     .result_from("create_shipment")
///     .timeout(Duration::from_secs(60))
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    id: String,
    steps: Vec<StepDefinition>,
    result_from: Option<ResultSelector>,
    options: WorkflowOptions,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
            result_from: None,
            options: WorkflowOptions::default(),
        }
    }

    /// Add a step with its declared dependencies
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Add a step that depends on the previously added step
    ///
    /// Steps that already declare dependencies are added unchanged.
    pub fn then(self, step: StepDefinition) -> Self {
        let step = match self.steps.last() {
            Some(previous) if step.depends_on.is_empty() => {
                let previous = previous.id.clone();
                step.depends_on([previous])
            }
            _ => step,
        };
        self.step(step)
    }

    /// Inline every step of another workflow under `prefix`
    ///
    /// Nested step ids become `prefix.step_id`; the nested root steps depend
    /// on `depends_on`. Options and result selection of the nested workflow
    /// are not carried over.
    pub fn sub_flow<I, S>(mut self, prefix: &str, flow: &WorkflowDefinition, depends_on: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let roots: BTreeSet<String> = depends_on.into_iter().map(Into::into).collect();
        let prefixed = |id: &str| format!("{prefix}{SUB_FLOW_SEPARATOR}{id}");

        for nested in flow.steps() {
            let mut step = nested.clone();
            step.id = prefixed(nested.id.as_str());
            step.depends_on = if nested.depends_on.is_empty() {
                roots.clone()
            } else {
                nested.depends_on.iter().map(|d| prefixed(d.as_str())).collect()
            };
            self.steps.push(step);
        }
        self
    }

    /// How the transaction result is selected
    pub fn result_from(mut self, selector: impl Into<ResultSelector>) -> Self {
        self.result_from = Some(selector.into());
        self
    }

    pub fn retention_time(mut self, retention: Duration) -> Self {
        self.options.retention_time = Some(retention);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn store_ttl(mut self, ttl: Duration) -> Self {
        self.options.store_ttl = Some(ttl);
        self
    }

    pub fn continue_on_failure(mut self, policy: ContinueOnFailurePolicy) -> Self {
        self.options.continue_on_failure = Some(policy);
        self
    }

    /// Validate the graph and order it topologically
    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        validate_id(&self.id)?;
        if self.steps.is_empty() {
            return Err(DefinitionError::Empty(self.id));
        }

        let mut position = HashMap::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            validate_id(&step.id)?;
            if position.insert(step.id.clone(), i).is_some() {
                return Err(DefinitionError::DuplicateStep {
                    workflow_id: self.id.clone(),
                    step_id: step.id.clone(),
                });
            }
        }

        let mut successors: HashMap<String, BTreeSet<String>> = HashMap::new();
        for step in &self.steps {
            for dependency in &step.depends_on {
                if !position.contains_key(dependency) || dependency == &step.id {
                    return Err(DefinitionError::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                successors
                    .entry(dependency.clone())
                    .or_default()
                    .insert(step.id.clone());
            }
        }

        if let Some(selector) = &self.result_from {
            if let Some(unknown) = selector
                .referenced_steps()
                .into_iter()
                .find(|id| !position.contains_key(*id))
            {
                return Err(DefinitionError::UnknownResultStep(unknown.to_string()));
            }
        }

        let order = topological_order(&self.id, &self.steps, &position, &successors)?;

        let mut slots: Vec<Option<StepDefinition>> = self.steps.into_iter().map(Some).collect();
        let steps: Vec<StepDefinition> = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();
        let index = steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.id.clone(), i))
            .collect();

        Ok(WorkflowDefinition {
            id: self.id,
            steps,
            index,
            successors,
            result_from: self.result_from,
            options: self.options,
        })
    }
}

fn validate_id(id: &str) -> Result<(), DefinitionError> {
    if id.is_empty() || id.contains(KEY_SEPARATOR) {
        return Err(DefinitionError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Kahn's algorithm, ties broken by declaration order
fn topological_order(
    workflow_id: &str,
    steps: &[StepDefinition],
    position: &HashMap<String, usize>,
    successors: &HashMap<String, BTreeSet<String>>,
) -> Result<Vec<usize>, DefinitionError> {
    let mut in_degree: Vec<usize> = steps.iter().map(|s| s.depends_on.len()).collect();
    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(current) = queue.pop_front() {
        order.push(current);

        let mut next: Vec<usize> = successors
            .get(&steps[current].id)
            .into_iter()
            .flatten()
            .filter_map(|id| position.get(id).copied())
            .collect();
        next.sort_unstable();

        for successor in next {
            in_degree[successor] -= 1;
            if in_degree[successor] == 0 {
                queue.push_back(successor);
            }
        }
    }

    if order.len() < steps.len() {
        let cyclic = (0..steps.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| steps[i].id.clone())
            .collect();
        return Err(DefinitionError::Cycle {
            workflow_id: workflow_id.to_string(),
            steps: cyclic,
        });
    }

    Ok(order)
}
