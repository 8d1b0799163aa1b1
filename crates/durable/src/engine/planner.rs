//! Graph decisions over a transaction snapshot
//!
//! Pure functions: given a definition, a checkpoint and the set of handlers
//! currently running, decide what may run next. The executor applies the
//! decisions, persists them and spawns handlers.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::duration_serde::to_chrono;
use crate::reliability::Deadline;
use crate::transaction::{StepState, StepStatus, TransactionCheckpoint, TransactionState};
use crate::workflow::WorkflowDefinition;

/// Outcome of resolving not-yet-finished forward steps
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ForwardPlan {
    /// Steps to invoke now, in topological order
    pub ready: Vec<String>,
    /// Steps marked skipped by this pass
    pub skipped: Vec<String>,
}

enum Dependencies {
    Satisfied,
    Pending,
    Unsatisfiable,
}

fn dependencies(definition: &WorkflowDefinition, checkpoint: &TransactionCheckpoint, step_id: &str) -> Dependencies {
    let tolerates_skipped = definition
        .step(step_id)
        .map_or(false, |s| s.tolerates_skipped());

    let mut pending = false;
    for dependency in definition.predecessors(step_id) {
        let Some(record) = checkpoint.step(dependency) else {
            return Dependencies::Unsatisfiable;
        };
        match record.state {
            StepState::Done => {}
            StepState::Skipped if tolerates_skipped => {}
            StepState::NotStarted | StepState::Invoking => pending = true,
            _ => return Dependencies::Unsatisfiable,
        }
    }

    if pending {
        Dependencies::Pending
    } else {
        Dependencies::Satisfied
    }
}

/// Skip unreachable steps and collect the steps ready to invoke
///
/// A single pass in topological order is enough: a predecessor is always
/// resolved before its dependents.
pub(crate) fn resolve_pending(
    definition: &WorkflowDefinition,
    checkpoint: &mut TransactionCheckpoint,
    now: DateTime<Utc>,
    is_running: impl Fn(&str) -> bool,
) -> ForwardPlan {
    let mut plan = ForwardPlan::default();

    for step in definition.steps() {
        let id = step.id();
        let Some(record) = checkpoint.step(id) else {
            continue;
        };

        let (ready, skip) = match record.state {
            StepState::NotStarted => match dependencies(definition, checkpoint, id) {
                Dependencies::Pending => (false, false),
                Dependencies::Unsatisfiable => (false, true),
                Dependencies::Satisfied => {
                    let run =
                        step.should_run(&checkpoint.context.payload, &checkpoint.context.invoke);
                    (run, !run)
                }
            },
            StepState::Invoking if is_running(id) => (false, false),
            StepState::Invoking => match record.status {
                StepStatus::TemporaryFailure => {
                    (record.next_attempt_at.map_or(true, |at| at <= now), false)
                }
                // Attempt interrupted before its outcome was recorded
                StepStatus::Idle => (true, false),
                _ => (false, false),
            },
            _ => (false, false),
        };

        if ready {
            plan.ready.push(id.to_string());
        } else if skip {
            if let Some(record) = checkpoint.step_mut(id) {
                record.state = StepState::Skipped;
            }
            checkpoint.flow.has_skipped_steps = true;
            plan.skipped.push(id.to_string());
        }
    }

    plan
}

/// Steps whose compensation may start now
///
/// A step is compensated only after every successor has been compensated
/// (or never needed it), which walks the graph in reverse dependency order
/// while letting independent branches unwind concurrently.
pub(crate) fn compensation_ready(
    definition: &WorkflowDefinition,
    checkpoint: &TransactionCheckpoint,
    is_running: impl Fn(&str) -> bool,
) -> Vec<String> {
    definition
        .steps()
        .iter()
        .rev()
        .map(|step| step.id())
        .filter(|id| {
            checkpoint
                .step(id)
                .map_or(false, |record| record.is_pending_compensation())
                && !is_running(id)
        })
        .filter(|id| {
            definition.successors(id).all(|successor| {
                !is_running(successor)
                    && checkpoint
                        .step(successor)
                        .map_or(true, |record| !record.is_pending_compensation())
            })
        })
        .map(str::to_string)
        .collect()
}

/// Steps to unwind when failures were tolerated
///
/// The failed steps, everything downstream of them, and every completed
/// step whose completed successors are all affected.
pub(crate) fn affected_steps(
    definition: &WorkflowDefinition,
    checkpoint: &TransactionCheckpoint,
) -> BTreeSet<String> {
    let failed: Vec<&str> = checkpoint
        .flow
        .steps
        .values()
        .filter(|record| record.state.is_forward_failure())
        .map(|record| record.id.as_str())
        .collect();

    let mut affected = definition.descendants(failed.iter().copied());
    affected.extend(failed.iter().map(|id| id.to_string()));

    for step in definition.steps().iter().rev() {
        let id = step.id();
        if affected.contains(id)
            || checkpoint.step(id).map(|r| r.state) != Some(StepState::Done)
        {
            continue;
        }

        let mut feeds_affected = false;
        let mut feeds_healthy = false;
        for successor in definition.successors(id) {
            if affected.contains(successor) {
                feeds_affected = true;
            } else if checkpoint.step(successor).map(|r| r.state) == Some(StepState::Done) {
                feeds_healthy = true;
            }
        }

        if feeds_affected && !feeds_healthy {
            affected.insert(id.to_string());
        }
    }

    affected
}

/// Earliest instant the driving loop must wake up without a handler outcome
///
/// Covers the transaction deadline, deadlines of async steps awaiting their
/// callback and due times of pending retries.
pub(crate) fn next_wakeup(
    definition: &WorkflowDefinition,
    checkpoint: &TransactionCheckpoint,
) -> Option<Deadline> {
    if checkpoint.state() != TransactionState::Invoking {
        return None;
    }

    let mut wakeup = checkpoint.deadline();
    for step in definition.steps() {
        let Some(record) = checkpoint.step(step.id()) else {
            continue;
        };

        if record.is_waiting() {
            if let (Some(timeout), Some(started)) = (step.timeout(), record.last_attempt_at) {
                wakeup = Deadline::earliest(wakeup, Some(Deadline::after(started, timeout)));
            }
        } else if record.is_retry_pending() {
            if let Some(at) = record.next_attempt_at {
                wakeup = Deadline::earliest(wakeup, Some(Deadline::at(at)));
            }
        }
    }
    wakeup
}

/// Async steps whose deadline has passed while awaiting their callback
pub(crate) fn expired_waiting_steps(
    definition: &WorkflowDefinition,
    checkpoint: &TransactionCheckpoint,
    now: DateTime<Utc>,
) -> Vec<String> {
    definition
        .steps()
        .iter()
        .filter_map(|step| {
            let record = checkpoint.step(step.id())?;
            let timeout = step.timeout()?;
            let started = record.last_attempt_at?;
            (record.is_waiting() && started + to_chrono(timeout) <= now)
                .then(|| step.id().to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::handler_fn;
    use crate::workflow::{StepDefinition, WorkflowBuilder};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn noop() -> crate::step::Handler {
        handler_fn(|_| async { Ok(Value::Null) })
    }

    /// a → b → d, a → c → d
    fn diamond() -> WorkflowDefinition {
        WorkflowBuilder::new("diamond")
            .step(StepDefinition::new("a", noop()))
            .step(StepDefinition::new("b", noop()).depends_on(["a"]))
            .step(StepDefinition::new("c", noop()).depends_on(["a"]))
            .step(StepDefinition::new("d", noop()).depends_on(["b", "c"]))
            .build()
            .unwrap()
    }

    fn set_state(cp: &mut TransactionCheckpoint, id: &str, state: StepState) {
        cp.step_mut(id).unwrap().state = state;
    }

    fn never_running(_: &str) -> bool {
        false
    }

    #[test]
    fn test_roots_ready_first() {
        let def = diamond();
        let mut cp = TransactionCheckpoint::new(&def, "tx", Value::Null, Value::Null);

        let plan = resolve_pending(&def, &mut cp, Utc::now(), never_running);
        assert_eq!(plan.ready, vec!["a"]);
        assert!(plan.skipped.is_empty());

        set_state(&mut cp, "a", StepState::Done);
        let plan = resolve_pending(&def, &mut cp, Utc::now(), never_running);
        assert_eq!(plan.ready, vec!["b", "c"]);
    }

    #[test]
    fn test_failed_dependency_skips_descendants() {
        let def = diamond();
        let mut cp = TransactionCheckpoint::new(&def, "tx", Value::Null, Value::Null);
        set_state(&mut cp, "a", StepState::Done);
        set_state(&mut cp, "b", StepState::Failed);
        set_state(&mut cp, "c", StepState::Done);

        let plan = resolve_pending(&def, &mut cp, Utc::now(), never_running);
        assert!(plan.ready.is_empty());
        assert_eq!(plan.skipped, vec!["d"]);
        assert_eq!(cp.step("d").unwrap().state, StepState::Skipped);
        assert!(cp.flow.has_skipped_steps);
    }

    #[test]
    fn test_condition_false_skips_and_tolerant_dependent_runs() {
        let def = WorkflowBuilder::new("branch")
            .step(StepDefinition::new("check", noop()))
            .step(
                StepDefinition::new("express", noop())
                    .depends_on(["check"])
                    .when(|input, _| input["express"] == json!(true)),
            )
            .step(
                StepDefinition::new("notify", noop())
                    .depends_on(["express"])
                    .tolerate_skipped(),
            )
            .build()
            .unwrap();
        let mut cp = TransactionCheckpoint::new(&def, "tx", json!({"express": false}), Value::Null);
        set_state(&mut cp, "check", StepState::Done);

        let plan = resolve_pending(&def, &mut cp, Utc::now(), never_running);
        assert_eq!(plan.skipped, vec!["express"]);
        assert_eq!(plan.ready, vec!["notify"]);
    }

    #[test]
    fn test_retry_ready_only_when_due() {
        let def = diamond();
        let mut cp = TransactionCheckpoint::new(&def, "tx", Value::Null, Value::Null);
        let now = Utc::now();
        {
            let a = cp.step_mut("a").unwrap();
            a.state = StepState::Invoking;
            a.status = StepStatus::TemporaryFailure;
            a.next_attempt_at = Some(now + chrono::Duration::seconds(5));
        }

        assert!(resolve_pending(&def, &mut cp, now, never_running).ready.is_empty());
        let later = now + chrono::Duration::seconds(6);
        assert_eq!(resolve_pending(&def, &mut cp, later, never_running).ready, vec!["a"]);

        let wakeup = next_wakeup(&def, &{
            let mut invoking = cp.clone();
            invoking.flow.state = TransactionState::Invoking;
            invoking
        });
        assert_eq!(wakeup.map(|d| d.instant()), cp.step("a").unwrap().next_attempt_at);
    }

    #[test]
    fn test_interrupted_attempt_is_ready_unless_running() {
        let def = diamond();
        let mut cp = TransactionCheckpoint::new(&def, "tx", Value::Null, Value::Null);
        set_state(&mut cp, "a", StepState::Invoking);

        assert_eq!(resolve_pending(&def, &mut cp, Utc::now(), never_running).ready, vec!["a"]);
        assert!(resolve_pending(&def, &mut cp, Utc::now(), |id| id == "a")
            .ready
            .is_empty());
    }

    #[test]
    fn test_compensation_runs_in_reverse_order() {
        let def = diamond();
        let mut cp = TransactionCheckpoint::new(&def, "tx", Value::Null, Value::Null);
        for id in ["a", "b", "c", "d"] {
            let record = cp.step_mut(id).unwrap();
            record.state = StepState::Done;
            record.compensate_on_revert = true;
        }

        assert_eq!(compensation_ready(&def, &cp, never_running), vec!["d"]);

        cp.step_mut("d").unwrap().compensated = true;
        let mut ready = compensation_ready(&def, &cp, never_running);
        ready.sort();
        assert_eq!(ready, vec!["b", "c"]);
        assert_eq!(compensation_ready(&def, &cp, |id| id == "b"), vec!["c"]);

        cp.step_mut("b").unwrap().compensated = true;
        assert_eq!(compensation_ready(&def, &cp, never_running), vec!["c"]);
        cp.step_mut("c").unwrap().compensated = true;
        assert_eq!(compensation_ready(&def, &cp, never_running), vec!["a"]);
    }

    #[test]
    fn test_running_successor_blocks_compensation() {
        let def = diamond();
        let mut cp = TransactionCheckpoint::new(&def, "tx", Value::Null, Value::Null);
        let a = cp.step_mut("a").unwrap();
        a.state = StepState::Done;
        a.compensate_on_revert = true;
        set_state(&mut cp, "b", StepState::Invoking);

        assert!(compensation_ready(&def, &cp, |id| id == "b").is_empty());
        assert_eq!(compensation_ready(&def, &cp, never_running), vec!["a"]);
    }

    #[test]
    fn test_affected_steps() {
        // root → pay → ship, root → email; prep → pay
        let def = WorkflowBuilder::new("order")
            .step(StepDefinition::new("root", noop()))
            .step(StepDefinition::new("prep", noop()))
            .step(StepDefinition::new("pay", noop()).depends_on(["root", "prep"]))
            .step(StepDefinition::new("ship", noop()).depends_on(["pay"]))
            .step(StepDefinition::new("email", noop()).depends_on(["root"]))
            .build()
            .unwrap();
        let mut cp = TransactionCheckpoint::new(&def, "tx", Value::Null, Value::Null);
        set_state(&mut cp, "root", StepState::Done);
        set_state(&mut cp, "prep", StepState::Done);
        set_state(&mut cp, "pay", StepState::Failed);
        set_state(&mut cp, "ship", StepState::Skipped);
        set_state(&mut cp, "email", StepState::Done);

        let affected = affected_steps(&def, &cp);
        // root also feeds the healthy email branch, prep only fed pay
        let expected: BTreeSet<String> = ["pay", "ship", "prep"].iter().map(|s| s.to_string()).collect();
        assert_eq!(affected, expected);
    }

    #[test]
    fn test_expired_waiting_steps() {
        let def = WorkflowBuilder::new("async")
            .step(
                StepDefinition::new("callback", noop())
                    .asynchronous()
                    .with_timeout(Duration::from_millis(100)),
            )
            .build()
            .unwrap();
        let mut cp = TransactionCheckpoint::new(&def, "tx", Value::Null, Value::Null);
        cp.flow.state = TransactionState::Invoking;
        let started = Utc::now();
        {
            let record = cp.step_mut("callback").unwrap();
            record.state = StepState::Invoking;
            record.status = StepStatus::Waiting;
            record.last_attempt_at = Some(started);
        }

        assert!(expired_waiting_steps(&def, &cp, started).is_empty());
        let later = started + chrono::Duration::milliseconds(150);
        assert_eq!(expired_waiting_steps(&def, &cp, later), vec!["callback"]);
        assert_eq!(
            next_wakeup(&def, &cp).map(|d| d.instant()),
            Some(started + chrono::Duration::milliseconds(100))
        );
    }
}
