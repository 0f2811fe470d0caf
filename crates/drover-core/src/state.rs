use crate::model::{DatasetHash, Pipeline, RunId, Transformation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Pending,
    Running,
    Successful,
    Failing,
    Failed,
    Cancelling,
    Cancelled,
    Quarantined,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Successful | RunState::Failed | RunState::Cancelled | RunState::Quarantined
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Successful => "successful",
            RunState::Failing => "failing",
            RunState::Failed => "failed",
            RunState::Cancelling => "cancelling",
            RunState::Cancelled => "cancelled",
            RunState::Quarantined => "quarantined",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentState {
    Pending,
    Running,
    Successful,
    Failed,
    Cancelled,
    Quarantined,
}

impl ComponentState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ComponentState::Pending | ComponentState::Running)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComponentState::Pending => "pending",
            ComponentState::Running => "running",
            ComponentState::Successful => "successful",
            ComponentState::Failed => "failed",
            ComponentState::Cancelled => "cancelled",
            ComponentState::Quarantined => "quarantined",
        };
        f.write_str(s)
    }
}

/// One schedulable unit of a run. The source modeled this as duck-typed
/// multi-table inheritance over RunStep/RunSIC/RunOutputCable; here it is a
/// closed tagged union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ComponentId {
    InputCable { step: usize, cable: usize },
    Step { step: usize },
    OutputCable { output: usize },
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentId::InputCable { step, cable } => write!(f, "cable {}.{}", step, cable),
            ComponentId::Step { step } => write!(f, "step {}", step),
            ComponentId::OutputCable { output } => write!(f, "outcable {}", output),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunComponent {
    pub id: ComponentId,
    pub state: ComponentState,
    /// True when this component was satisfied by an existing execution
    /// record instead of fresh execution.
    #[serde(default)]
    pub reused: bool,
    #[serde(default)]
    pub redacted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunComponent {
    pub fn new(id: ComponentId) -> Self {
        Self {
            id,
            state: ComponentState::Pending,
            reused: false,
            redacted: false,
            fingerprint: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn progress_glyph(&self) -> char {
        match self.state {
            ComponentState::Pending => '.',
            ComponentState::Running => '+',
            ComponentState::Successful if self.reused => '=',
            ComponentState::Successful => '*',
            ComponentState::Failed => '!',
            ComponentState::Cancelled => 'x',
            ComponentState::Quarantined => '#',
        }
    }
}

/// Why a run ended the way it did, when the reason is not a plain driver
/// failure. `ExceedsSystemCapabilities` is deliberately distinct so an
/// operator can tell "this can never run here" from "something crashed".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunCondition {
    InvalidPipeline { message: String },
    ExceedsSystemCapabilities {
        threads: u32,
        memory_mb: u64,
        max_threads: u32,
        max_memory_mb: u64,
    },
    SubmitFailed { message: String },
    TaskLost { component: String },
    RecoveryFailed { component: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildLink {
    pub step: usize,
    pub run: RunId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentLink {
    pub run: RunId,
    pub step: usize,
}

/// One execution attempt of a pipeline against a fixed ordered input list.
/// Serialized as `run.json` inside the run's sandbox directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub pipeline: Pipeline,
    pub owner: String,
    pub inputs: Vec<DatasetHash>,
    pub state: RunState,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<RunCondition>,
    pub components: Vec<RunComponent>,
    #[serde(default)]
    pub children: Vec<ChildLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Builds a pending run with one component per cable, step, and output
    /// cable, in canonical order: for each step its input cables then the
    /// step itself, then the pipeline's output cables.
    pub fn new(id: RunId, pipeline: Pipeline, inputs: Vec<DatasetHash>, owner: String) -> Self {
        let mut components = Vec::new();
        for (step_idx, step) in pipeline.steps.iter().enumerate() {
            for cable_idx in 0..step.cables.len() {
                components.push(RunComponent::new(ComponentId::InputCable {
                    step: step_idx,
                    cable: cable_idx,
                }));
            }
            components.push(RunComponent::new(ComponentId::Step { step: step_idx }));
        }
        for output_idx in 0..pipeline.outputs.len() {
            components.push(RunComponent::new(ComponentId::OutputCable { output: output_idx }));
        }

        Self {
            id,
            pipeline,
            owner,
            inputs,
            state: RunState::Pending,
            cancel_requested: false,
            condition: None,
            components,
            children: Vec::new(),
            parent: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn component(&self, id: ComponentId) -> Option<&RunComponent> {
        self.components.iter().find(|c| c.id == id)
    }

    pub fn component_mut(&mut self, id: ComponentId) -> Option<&mut RunComponent> {
        self.components.iter_mut().find(|c| c.id == id)
    }

    pub fn child_for_step(&self, step: usize) -> Option<&RunId> {
        self.children.iter().find(|c| c.step == step).map(|c| &c.run)
    }

    /// Does the step wrap a nested pipeline?
    pub fn step_is_subpipeline(&self, step: usize) -> bool {
        matches!(
            self.pipeline.steps.get(step).map(|s| &s.transformation),
            Some(Transformation::Pipeline(_))
        )
    }

    /// One character per component, in canonical order.
    pub fn render_progress(&self) -> String {
        self.components.iter().map(|c| c.progress_glyph()).collect()
    }

    /// Recomputes this run's state from its components and children and
    /// applies it, maintaining start/end timestamps. Child runs this run
    /// has spawned but whose state is unknown to the caller are treated as
    /// still active.
    pub fn apply_roll_up(&mut self, child_states: &HashMap<RunId, RunState>) -> RunState {
        let component_states: Vec<ComponentState> =
            self.components.iter().map(|c| c.state).collect();
        let children: Vec<RunState> = self
            .children
            .iter()
            .map(|link| {
                child_states
                    .get(&link.run)
                    .copied()
                    .unwrap_or(RunState::Running)
            })
            .collect();

        let next = roll_up(
            &component_states,
            &children,
            self.cancel_requested,
            self.condition.is_some(),
        );
        if next != self.state {
            tracing::debug!("Run {}: {} -> {}", self.id.short_id(), self.state, next);
        }
        if self.started_at.is_none() && next != RunState::Pending {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        self.state = next;
        next
    }
}

impl Run {
    pub fn load(path: &std::path::Path) -> Result<Self, crate::errors::ConfigError> {
        let content = fs_err::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<(), crate::errors::ConfigError> {
        let tmp = path.with_extension("json.tmp");
        fs_err::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs_err::rename(&tmp, path)?;
        Ok(())
    }
}

fn child_as_component(state: RunState) -> ComponentState {
    match state {
        RunState::Successful => ComponentState::Successful,
        RunState::Failed => ComponentState::Failed,
        RunState::Cancelled => ComponentState::Cancelled,
        RunState::Quarantined => ComponentState::Quarantined,
        RunState::Pending
        | RunState::Running
        | RunState::Failing
        | RunState::Cancelling => ComponentState::Running,
    }
}

/// The single roll-up function. Both the incremental scheduling path and the
/// `check-runs` audit recompute run state through here, so the cached value
/// and the fresh value cannot drift.
///
/// Precedence: a cancellation request wins over everything, then a fatal
/// run condition, then component failure, then quarantine, then
/// component-level cancellation; the run only becomes `Successful` when
/// every component (and every child run) is successful. The `-ing` forms
/// hold while dispatched work is still draining. `fatal` is set when the
/// run carries a `RunCondition` (invalid pipeline, capacity exceeded, lost
/// task): such a run fails even though no component may have run.
pub fn roll_up(
    components: &[ComponentState],
    children: &[RunState],
    cancel_requested: bool,
    fatal: bool,
) -> RunState {
    let mut any_running = false;
    let mut any_failed = false;
    let mut any_cancelled = false;
    let mut any_quarantined = false;
    let mut any_terminal = false;
    let mut all_successful = true;

    let combined = components
        .iter()
        .copied()
        .chain(children.iter().map(|&c| child_as_component(c)));

    let mut total = 0usize;
    for state in combined {
        total += 1;
        match state {
            ComponentState::Running => {
                any_running = true;
                all_successful = false;
            }
            ComponentState::Pending => all_successful = false,
            ComponentState::Successful => any_terminal = true,
            ComponentState::Failed => {
                any_failed = true;
                any_terminal = true;
                all_successful = false;
            }
            ComponentState::Cancelled => {
                any_cancelled = true;
                any_terminal = true;
                all_successful = false;
            }
            ComponentState::Quarantined => {
                any_quarantined = true;
                any_terminal = true;
                all_successful = false;
            }
        }
    }

    if cancel_requested {
        return if any_running {
            RunState::Cancelling
        } else {
            RunState::Cancelled
        };
    }
    if fatal {
        return if any_running {
            RunState::Failing
        } else {
            RunState::Failed
        };
    }
    if any_failed {
        return if any_running {
            RunState::Failing
        } else {
            RunState::Failed
        };
    }
    if any_quarantined && !any_running {
        return RunState::Quarantined;
    }
    if any_cancelled {
        return if any_running {
            RunState::Cancelling
        } else {
            RunState::Cancelled
        };
    }
    if total > 0 && all_successful {
        return RunState::Successful;
    }
    if any_running || any_terminal {
        return RunState::Running;
    }
    RunState::Pending
}

#[cfg(test)]
mod tests {
    use super::*;

    use ComponentState as C;

    #[test]
    fn test_all_pending_is_pending() {
        assert_eq!(roll_up(&[C::Pending, C::Pending], &[], false, false), RunState::Pending);
    }

    #[test]
    fn test_any_running_is_running() {
        assert_eq!(
            roll_up(&[C::Running, C::Pending], &[], false, false),
            RunState::Running
        );
    }

    #[test]
    fn test_partial_completion_is_running() {
        assert_eq!(
            roll_up(&[C::Successful, C::Pending], &[], false, false),
            RunState::Running
        );
    }

    #[test]
    fn test_all_successful_is_successful() {
        assert_eq!(
            roll_up(&[C::Successful, C::Successful], &[], false, false),
            RunState::Successful
        );
    }

    #[test]
    fn test_failure_with_inflight_is_failing() {
        assert_eq!(
            roll_up(&[C::Failed, C::Running], &[], false, false),
            RunState::Failing
        );
    }

    #[test]
    fn test_failure_drained_is_failed_even_with_pending() {
        // Dependents of a failed component stay pending forever; the run
        // still reaches Failed once nothing is running.
        assert_eq!(
            roll_up(&[C::Failed, C::Pending], &[], false, false),
            RunState::Failed
        );
    }

    #[test]
    fn test_cancel_request_waits_for_drain() {
        assert_eq!(
            roll_up(&[C::Running, C::Pending], &[], true, false),
            RunState::Cancelling
        );
        assert_eq!(
            roll_up(&[C::Successful, C::Pending], &[], true, false),
            RunState::Cancelled
        );
    }

    #[test]
    fn test_cancel_wins_over_failure() {
        assert_eq!(roll_up(&[C::Failed, C::Running], &[], true, false), RunState::Cancelling);
        assert_eq!(roll_up(&[C::Failed, C::Pending], &[], true, false), RunState::Cancelled);
    }

    #[test]
    fn test_quarantined_component_quarantines_drained_run() {
        assert_eq!(
            roll_up(&[C::Quarantined, C::Successful], &[], false, false),
            RunState::Quarantined
        );
        assert_eq!(
            roll_up(&[C::Quarantined, C::Running], &[], false, false),
            RunState::Running
        );
    }

    #[test]
    fn test_child_run_failure_rolls_up() {
        assert_eq!(
            roll_up(&[C::Successful], &[RunState::Failed], false, false),
            RunState::Failed
        );
        assert_eq!(
            roll_up(&[C::Running], &[RunState::Failed], false, false),
            RunState::Failing
        );
    }

    #[test]
    fn test_active_child_keeps_run_running() {
        assert_eq!(
            roll_up(&[C::Successful], &[RunState::Running], false, false),
            RunState::Running
        );
        assert_eq!(
            roll_up(&[C::Successful], &[RunState::Failing], false, false),
            RunState::Running
        );
    }

    #[test]
    fn test_empty_run_is_pending() {
        assert_eq!(roll_up(&[], &[], false, false), RunState::Pending);
    }

    #[test]
    fn test_fatal_condition_fails_run_without_failed_components() {
        // An invalid pipeline or capacity rejection fails the run even
        // though nothing ever dispatched.
        assert_eq!(roll_up(&[C::Pending], &[], false, true), RunState::Failed);
        assert_eq!(roll_up(&[C::Running], &[], false, true), RunState::Failing);
        // Cancellation still wins.
        assert_eq!(roll_up(&[C::Pending], &[], true, true), RunState::Cancelled);
    }

    /// The final state must not depend on the order independent components
    /// completed in: replay every permutation of a mixed outcome set and
    /// check the roll-up agrees at the end.
    #[test]
    fn test_roll_up_order_independent() {
        let outcomes = [C::Successful, C::Failed, C::Successful, C::Cancelled];
        let n = outcomes.len();

        let mut indices: Vec<usize> = (0..n).collect();
        let mut permutations = Vec::new();
        heap_permutations(&mut indices, n, &mut permutations);

        let mut finals = Vec::new();
        for perm in &permutations {
            let mut states = vec![C::Pending; n];
            for &i in perm {
                states[i] = C::Running;
            }
            for &i in perm {
                states[i] = outcomes[i];
            }
            finals.push(roll_up(&states, &[], false, false));
        }
        assert!(finals.windows(2).all(|w| w[0] == w[1]),
            "final state varied with completion order: {:?}", finals);
        assert_eq!(finals[0], RunState::Failed);
    }

    fn heap_permutations(items: &mut Vec<usize>, k: usize, out: &mut Vec<Vec<usize>>) {
        if k <= 1 {
            out.push(items.clone());
            return;
        }
        for i in 0..k {
            heap_permutations(items, k - 1, out);
            if k % 2 == 0 {
                items.swap(i, k - 1);
            } else {
                items.swap(0, k - 1);
            }
        }
    }

    #[test]
    fn test_progress_glyphs() {
        let mut c = RunComponent::new(ComponentId::Step { step: 0 });
        assert_eq!(c.progress_glyph(), '.');
        c.state = C::Successful;
        assert_eq!(c.progress_glyph(), '*');
        c.reused = true;
        assert_eq!(c.progress_glyph(), '=');
        c.state = C::Failed;
        assert_eq!(c.progress_glyph(), '!');
    }
}
