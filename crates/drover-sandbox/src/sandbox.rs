use crate::error::{Result, SandboxError};
use crate::layout::RunLayout;
use chrono::Utc;
use drover_cluster::{TaskDescriptor, TaskId, TaskKind, TaskOutcome};
use drover_core::model::{CableSource, DatasetHash, Method, Pipeline, RunId, Transformation};
use drover_core::record::{
    fingerprint, Claim, ExecRecord, Fingerprint, RecordLookup, RecordOutput, RecordStore,
};
use drover_core::registry::{hash_file, DatasetRegistry, RegistryError};
use drover_core::state::{
    ChildLink, ComponentId, ComponentState, ParentLink, Run, RunCondition, RunState,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CABLE_MEMORY_MB: u64 = 64;

/// What the manager should do for one ready component.
pub enum Action {
    Dispatch(TaskDescriptor),
    /// The ready component wraps a nested pipeline; the manager must create
    /// a child run fed by these already-materialized files.
    SpawnChild {
        step: usize,
        pipeline: Pipeline,
        input_files: Vec<PathBuf>,
    },
}

/// Per-run working area and DAG advancement. Owns the run record, decides
/// reuse-vs-execute for every component through the record store, and
/// materializes task descriptors for the ones that must actually run.
pub struct Sandbox {
    run: Run,
    layout: RunLayout,
    registry: Arc<DatasetRegistry>,
    store: Arc<dyn RecordStore>,
    /// Fingerprint and input tuple captured at dispatch, consumed when the
    /// result comes back.
    dispatched: HashMap<ComponentId, (Fingerprint, Vec<DatasetHash>)>,
    child_states: HashMap<RunId, RunState>,
}

impl Sandbox {
    /// Stages inputs, persists a pending run record, and returns the
    /// sandbox. A pipeline that fails validation (or a wrong input count)
    /// yields a sandbox whose run is already `Failed` with an
    /// `InvalidPipeline` condition; no task will ever be produced for it.
    pub fn create(
        id: RunId,
        pipeline: Pipeline,
        input_files: &[PathBuf],
        owner: String,
        sandbox_root: &Path,
        registry: Arc<DatasetRegistry>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Sandbox> {
        let layout = RunLayout::new(sandbox_root.join(&id.0));
        fs_err::create_dir_all(layout.root())?;

        let validation = pipeline.validate().err().or_else(|| {
            if input_files.len() != pipeline.inputs.len() {
                Some(drover_core::errors::PipelineError::WrongInputCount {
                    given: input_files.len(),
                    declared: pipeline.inputs.len(),
                })
            } else {
                None
            }
        });

        if let Some(error) = validation {
            tracing::error!("Run {} rejected: {}", id.short_id(), error);
            let mut run = Run::new(id, pipeline, Vec::new(), owner);
            run.condition = Some(RunCondition::InvalidPipeline {
                message: error.to_string(),
            });
            run.apply_roll_up(&HashMap::new());
            run.save(&layout.run_json())?;
            return Ok(Sandbox {
                run,
                layout,
                registry,
                store,
                dispatched: HashMap::new(),
                child_states: HashMap::new(),
            });
        }

        let mut input_hashes = Vec::with_capacity(input_files.len());
        for (index, file) in input_files.iter().enumerate() {
            let (hash, _size) = registry.store(file)?;
            let staged = layout.input_path(index, &pipeline.inputs[index]);
            registry.materialize(&hash, &staged)?;
            input_hashes.push(hash);
        }

        let run = Run::new(id, pipeline, input_hashes, owner);
        tracing::info!(
            "Run {} created: pipeline '{}', {} component(s)",
            run.id.short_id(),
            run.pipeline.name,
            run.components.len()
        );
        run.save(&layout.run_json())?;

        Ok(Sandbox {
            run,
            layout,
            registry,
            store,
            dispatched: HashMap::new(),
            child_states: HashMap::new(),
        })
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn set_parent(&mut self, parent: ParentLink) -> Result<()> {
        self.run.parent = Some(parent);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        self.run.save(&self.layout.run_json())?;
        Ok(())
    }

    fn component_state(&self, id: ComponentId) -> Result<ComponentState> {
        self.run
            .component(id)
            .map(|c| c.state)
            .ok_or(SandboxError::UnknownComponent(id))
    }

    fn set_component_state(&mut self, id: ComponentId, state: ComponentState) -> Result<()> {
        let component = self
            .run
            .component_mut(id)
            .ok_or(SandboxError::UnknownComponent(id))?;
        component.state = state;
        match state {
            ComponentState::Running => component.started_at = Some(Utc::now()),
            s if s.is_terminal() => component.ended_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Scans the DAG for pending components whose predecessors are all
    /// successful and decides, for each, between reuse and fresh execution.
    /// Components whose fingerprint is already executing elsewhere are left
    /// pending; they will observe the record on a later cycle.
    pub fn startable_tasks(&mut self) -> Result<Vec<Action>> {
        if self.run.cancel_requested
            || self.run.state.is_terminal()
            || self.run.condition.is_some()
        {
            return Ok(Vec::new());
        }

        let ids: Vec<ComponentId> = self
            .run
            .components
            .iter()
            .filter(|c| c.state == ComponentState::Pending)
            .map(|c| c.id)
            .collect();

        let mut actions = Vec::new();
        for id in ids {
            if self.run.condition.is_some() {
                break;
            }
            // A recovery reset earlier in this pass may have touched it.
            if self.component_state(id)? != ComponentState::Pending {
                continue;
            }
            if !self.deps_met(id) {
                continue;
            }
            if let Some(action) = self.try_start(id)? {
                actions.push(action);
            }
        }
        self.persist()?;
        Ok(actions)
    }

    fn deps_met(&self, id: ComponentId) -> bool {
        let step_done = |step: usize| {
            self.run
                .component(ComponentId::Step { step })
                .map(|c| c.state == ComponentState::Successful)
                .unwrap_or(false)
        };
        match id {
            ComponentId::InputCable { step, cable } => {
                match &self.run.pipeline.steps[step].cables[cable].source {
                    CableSource::RunInput { .. } => true,
                    CableSource::StepOutput { step: source, .. } => step_done(*source),
                }
            }
            ComponentId::Step { step } => (0..self.run.pipeline.steps[step].cables.len()).all(
                |cable| {
                    self.run
                        .component(ComponentId::InputCable { step, cable })
                        .map(|c| c.state == ComponentState::Successful)
                        .unwrap_or(false)
                },
            ),
            ComponentId::OutputCable { output } => {
                match &self.run.pipeline.outputs[output].source {
                    CableSource::RunInput { .. } => true,
                    CableSource::StepOutput { step: source, .. } => step_done(*source),
                }
            }
        }
    }

    fn try_start(&mut self, id: ComponentId) -> Result<Option<Action>> {
        if let ComponentId::Step { step } = id {
            if self.run.step_is_subpipeline(step) {
                return self.start_subpipeline(step);
            }
        }

        let Some(inputs) = self.input_hashes(id)? else {
            // Resolution reset something for recovery; retry next cycle.
            return Ok(None);
        };
        let fp = fingerprint(&self.transformation_identity(id), &inputs);
        if let Some(component) = self.run.component_mut(id) {
            component.fingerprint = Some(fp.0.clone());
        }

        match self.store.begin(&fp)? {
            Claim::Claimed => self.dispatch(id, fp, inputs),
            Claim::InFlight => {
                tracing::debug!(
                    "Run {} {}: identical execution already in flight, waiting",
                    self.run.id.short_id(),
                    id
                );
                Ok(None)
            }
            Claim::Complete(record) => self.consider_reuse(id, fp, inputs, record),
        }
    }

    fn start_subpipeline(&mut self, step: usize) -> Result<Option<Action>> {
        if self.run.child_for_step(step).is_some() {
            return Ok(None);
        }
        let Transformation::Pipeline(child) = &self.run.pipeline.steps[step].transformation
        else {
            return Ok(None);
        };
        let pipeline = (**child).clone();
        let input_files: Vec<PathBuf> = pipeline
            .inputs
            .iter()
            .map(|name| self.layout.step_input_path(step, name))
            .collect();
        self.set_component_state(ComponentId::Step { step }, ComponentState::Running)?;
        Ok(Some(Action::SpawnChild {
            step,
            pipeline,
            input_files,
        }))
    }

    /// A complete record exists for this fingerprint. Reuse it if it is
    /// trustworthy and its data still exists; otherwise claim regeneration.
    fn consider_reuse(
        &mut self,
        id: ComponentId,
        fp: Fingerprint,
        inputs: Vec<DatasetHash>,
        record: ExecRecord,
    ) -> Result<Option<Action>> {
        if record.quarantined || record.redacted {
            tracing::info!(
                "Run {} {}: cached record is {}; executing fresh",
                self.run.id.short_id(),
                id,
                if record.quarantined { "quarantined" } else { "redacted" }
            );
            return if self.store.reclaim(&fp)? {
                self.dispatch(id, fp, inputs)
            } else {
                Ok(None)
            };
        }

        if !record.successful {
            tracing::info!(
                "Run {} {}: reusing recorded failure (rc {})",
                self.run.id.short_id(),
                id,
                record.exit_code
            );
            if let Some(component) = self.run.component_mut(id) {
                component.reused = true;
            }
            self.set_component_state(id, ComponentState::Failed)?;
            return Ok(None);
        }

        let all_present = record
            .outputs
            .iter()
            .all(|out| self.registry.contains(&out.dataset));
        if !all_present {
            // The metadata survived a purge of the data itself: recovery,
            // not failure. Regenerate with the same inputs.
            tracing::info!(
                "Run {} {}: cached outputs purged from registry; recovering",
                self.run.id.short_id(),
                id
            );
            return if self.store.reclaim(&fp)? {
                self.dispatch(id, fp, inputs)
            } else {
                Ok(None)
            };
        }

        for (out, (_name, dest)) in record.outputs.iter().zip(self.output_files(id)) {
            self.registry.materialize(&out.dataset, &dest)?;
        }
        if let Some(component) = self.run.component_mut(id) {
            component.reused = true;
        }
        self.set_component_state(id, ComponentState::Successful)?;
        tracing::debug!("Run {} {}: reused", self.run.id.short_id(), id);
        Ok(None)
    }

    /// The caller holds the execution claim for `fp`. Make sure every
    /// concrete input file is on disk, then emit the descriptor.
    fn dispatch(
        &mut self,
        id: ComponentId,
        fp: Fingerprint,
        inputs: Vec<DatasetHash>,
    ) -> Result<Option<Action>> {
        if !self.ensure_inputs_on_disk(id)? {
            // Recovery was requested upstream; give the claim back so the
            // retry (here or in another run) can take it.
            self.store.abandon(&fp)?;
            return Ok(None);
        }

        let task = self.build_task(id)?;
        self.dispatched.insert(id, (fp, inputs));
        self.set_component_state(id, ComponentState::Running)?;
        Ok(Some(Action::Dispatch(task)))
    }

    /// Returns false when a missing file forced a recovery reset; the
    /// component should be retried on a later cycle.
    fn ensure_inputs_on_disk(&mut self, id: ComponentId) -> Result<bool> {
        match id {
            ComponentId::Step { step } => {
                let dests: Vec<(usize, String)> = self.run.pipeline.steps[step]
                    .cables
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (i, c.dest.clone()))
                    .collect();
                let mut ok = true;
                for (cable, dest) in dests {
                    if !self.layout.step_input_path(step, &dest).exists() {
                        tracing::info!(
                            "Run {} step {}: input '{}' missing on disk; re-running its cable",
                            self.run.id.short_id(),
                            step,
                            dest
                        );
                        self.reset_component(ComponentId::InputCable { step, cable })?;
                        ok = false;
                    }
                }
                Ok(ok)
            }
            ComponentId::InputCable { step, cable } => {
                let source = self.run.pipeline.steps[step].cables[cable].source.clone();
                self.ensure_source_on_disk(id, &source)
            }
            ComponentId::OutputCable { output } => {
                let source = self.run.pipeline.outputs[output].source.clone();
                self.ensure_source_on_disk(id, &source)
            }
        }
    }

    fn ensure_source_on_disk(&mut self, id: ComponentId, source: &CableSource) -> Result<bool> {
        let path = self.source_path(source);
        if path.exists() {
            return Ok(true);
        }
        match source {
            CableSource::RunInput { index } => {
                let hash = self.run.inputs[*index].clone();
                match self.registry.materialize(&hash, &path) {
                    Ok(()) => Ok(true),
                    Err(RegistryError::Missing(_)) => {
                        // Run inputs cannot be regenerated by any step.
                        self.fail(RunCondition::RecoveryFailed {
                            component: id.to_string(),
                        })?;
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            CableSource::StepOutput { step, output } => {
                if let Some(hash) = self.recorded_output_hash(*step, output)? {
                    if self.registry.contains(&hash) {
                        self.registry.materialize(&hash, &path)?;
                        return Ok(true);
                    }
                }
                // Neither the sandbox file nor the registry copy exists:
                // the producing step must run again. Chains transitively,
                // since its own inputs may be gone too.
                tracing::info!(
                    "Run {} {}: source from step {} is gone; recovering producer",
                    self.run.id.short_id(),
                    id,
                    step
                );
                self.recover_step(*step)?;
                Ok(false)
            }
        }
    }

    /// Put a previously-successful step (and any of its cables whose output
    /// files are gone) back to pending so the normal scheduling pass
    /// regenerates it.
    fn recover_step(&mut self, step: usize) -> Result<()> {
        self.reset_component(ComponentId::Step { step })?;
        let dests: Vec<(usize, String)> = self.run.pipeline.steps[step]
            .cables
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.dest.clone()))
            .collect();
        for (cable, dest) in dests {
            if !self.layout.step_input_path(step, &dest).exists() {
                self.reset_component(ComponentId::InputCable { step, cable })?;
            }
        }
        Ok(())
    }

    fn reset_component(&mut self, id: ComponentId) -> Result<()> {
        let component = self
            .run
            .component_mut(id)
            .ok_or(SandboxError::UnknownComponent(id))?;
        component.state = ComponentState::Pending;
        component.reused = false;
        component.started_at = None;
        component.ended_at = None;
        Ok(())
    }

    /// Ordered input dataset hashes for a component, resolved from run
    /// inputs and producing records. `None` means resolution is not
    /// possible this cycle (recovery was requested).
    fn input_hashes(&mut self, id: ComponentId) -> Result<Option<Vec<DatasetHash>>> {
        let sources: Vec<CableSource> = match id {
            ComponentId::InputCable { step, cable } => {
                vec![self.run.pipeline.steps[step].cables[cable].source.clone()]
            }
            ComponentId::Step { step } => {
                let step_def = &self.run.pipeline.steps[step];
                let mut ordered = Vec::new();
                for input_name in step_def.transformation.input_names() {
                    let cable = step_def
                        .cables
                        .iter()
                        .find(|c| c.dest == input_name)
                        .ok_or_else(|| {
                            SandboxError::Pipeline(
                                drover_core::errors::PipelineError::UnresolvableSource {
                                    step,
                                    input: input_name.to_string(),
                                },
                            )
                        })?;
                    ordered.push(cable.source.clone());
                }
                ordered
            }
            ComponentId::OutputCable { output } => {
                vec![self.run.pipeline.outputs[output].source.clone()]
            }
        };

        let mut hashes = Vec::with_capacity(sources.len());
        for source in &sources {
            match self.source_hash(source)? {
                Some(hash) => hashes.push(hash),
                None => return Ok(None),
            }
        }
        Ok(Some(hashes))
    }

    fn source_hash(&mut self, source: &CableSource) -> Result<Option<DatasetHash>> {
        match source {
            CableSource::RunInput { index } => Ok(Some(self.run.inputs[*index].clone())),
            CableSource::StepOutput { step, output } => {
                if let Some(hash) = self.recorded_output_hash(*step, output)? {
                    return Ok(Some(hash));
                }
                // No record (sub-pipeline step, or a reclaimed one): fall
                // back to the file the producer left in the sandbox.
                let path = self.layout.step_output_path(*step, output);
                if path.exists() {
                    return Ok(Some(hash_file(&path)?));
                }
                self.recover_step(*step)?;
                Ok(None)
            }
        }
    }

    fn recorded_output_hash(
        &self,
        step: usize,
        output: &str,
    ) -> Result<Option<DatasetHash>> {
        let Some(fp) = self
            .run
            .component(ComponentId::Step { step })
            .and_then(|c| c.fingerprint.clone())
        else {
            return Ok(None);
        };
        match self.store.lookup(&Fingerprint(fp))? {
            RecordLookup::Complete(record) => Ok(record
                .outputs
                .iter()
                .find(|o| o.name == output)
                .map(|o| o.dataset.clone())),
            _ => Ok(None),
        }
    }

    fn source_path(&self, source: &CableSource) -> PathBuf {
        match source {
            CableSource::RunInput { index } => self
                .layout
                .input_path(*index, &self.run.pipeline.inputs[*index]),
            CableSource::StepOutput { step, output } => {
                self.layout.step_output_path(*step, output)
            }
        }
    }

    fn transformation_identity(&self, id: ComponentId) -> String {
        let pipeline = &self.run.pipeline;
        match id {
            ComponentId::Step { step } => {
                pipeline.steps[step].transformation.identity().to_string()
            }
            ComponentId::InputCable { step, cable } => {
                let dest = &pipeline.steps[step].cables[cable].dest;
                format!("{}::s{}c{}:{}", pipeline.id, step, cable, dest)
            }
            ComponentId::OutputCable { output } => {
                let name = &pipeline.outputs[output].name;
                format!("{}::out{}:{}", pipeline.id, output, name)
            }
        }
    }

    /// Name/path pairs this component produces, in record order.
    fn output_files(&self, id: ComponentId) -> Vec<(String, PathBuf)> {
        match id {
            ComponentId::Step { step } => self.run.pipeline.steps[step]
                .transformation
                .output_names()
                .iter()
                .map(|name| {
                    (
                        name.to_string(),
                        self.layout.step_output_path(step, name),
                    )
                })
                .collect(),
            ComponentId::InputCable { step, cable } => {
                let dest = &self.run.pipeline.steps[step].cables[cable].dest;
                vec![(dest.clone(), self.layout.step_input_path(step, dest))]
            }
            ComponentId::OutputCable { output } => {
                let name = &self.run.pipeline.outputs[output].name;
                vec![(name.clone(), self.layout.output_path(name))]
            }
        }
    }

    fn build_task(&self, id: ComponentId) -> Result<TaskDescriptor> {
        match id {
            ComponentId::Step { step } => {
                let method = self.step_method(step)?;
                Ok(TaskDescriptor {
                    id: TaskId::new(&self.run.id, id),
                    run: self.run.id.clone(),
                    component: id,
                    kind: TaskKind::Step,
                    driver: method.driver.clone(),
                    args: method.args.clone(),
                    inputs: method
                        .inputs
                        .iter()
                        .map(|name| self.layout.step_input_path(step, name))
                        .collect(),
                    outputs: method
                        .outputs
                        .iter()
                        .map(|name| self.layout.step_output_path(step, name))
                        .collect(),
                    threads: method.resources.threads,
                    memory_mb: method.resources.memory_mb,
                    workdir: self.layout.step_dir(step),
                    log_dir: self.layout.step_logs_dir(step),
                })
            }
            ComponentId::InputCable { step, cable } => {
                let source = self.source_path(&self.run.pipeline.steps[step].cables[cable].source);
                let dest = self
                    .layout
                    .step_input_path(step, &self.run.pipeline.steps[step].cables[cable].dest);
                Ok(self.cable_task(id, source, dest))
            }
            ComponentId::OutputCable { output } => {
                let source = self.source_path(&self.run.pipeline.outputs[output].source);
                let dest = self.layout.output_path(&self.run.pipeline.outputs[output].name);
                Ok(self.cable_task(id, source, dest))
            }
        }
    }

    fn cable_task(&self, id: ComponentId, source: PathBuf, dest: PathBuf) -> TaskDescriptor {
        TaskDescriptor {
            id: TaskId::new(&self.run.id, id),
            run: self.run.id.clone(),
            component: id,
            kind: TaskKind::Cable,
            driver: PathBuf::from(drover_core::constants::COPY_DRIVER),
            args: Vec::new(),
            inputs: vec![source],
            outputs: vec![dest],
            threads: 1,
            memory_mb: CABLE_MEMORY_MB,
            workdir: self.layout.cable_dir(id),
            log_dir: self.layout.cable_logs_dir(id),
        }
    }

    fn step_method(&self, step: usize) -> Result<&Method> {
        match &self.run.pipeline.steps[step].transformation {
            Transformation::Method(method) => Ok(method),
            Transformation::Pipeline(_) => Err(SandboxError::UnknownComponent(
                ComponentId::Step { step },
            )),
        }
    }

    /// Records the result of a finished task: writes the execution record,
    /// registers output datasets, and updates the component. A zero exit
    /// code with missing outputs is still a failure.
    pub fn finish_task(&mut self, component: ComponentId, outcome: &TaskOutcome) -> Result<()> {
        let (fp, inputs) = self
            .dispatched
            .remove(&component)
            .ok_or(SandboxError::NotDispatched(component))?;
        let transformation = self.transformation_identity(component);

        let mut record_outputs = Vec::new();
        let mut successful = outcome.success();
        if successful {
            for (name, path) in self.output_files(component) {
                match self.registry.store(&path) {
                    Ok((hash, size)) => record_outputs.push(RecordOutput {
                        name,
                        dataset: hash,
                        size,
                    }),
                    Err(e) => {
                        tracing::error!(
                            "Run {} {}: driver exited 0 but output '{}' is unusable: {}",
                            self.run.id.short_id(),
                            component,
                            name,
                            e
                        );
                        successful = false;
                        record_outputs.clear();
                        break;
                    }
                }
            }
        }

        let record = ExecRecord {
            fingerprint: fp,
            transformation,
            inputs,
            outputs: record_outputs,
            exit_code: outcome.exit_code,
            successful,
            quarantined: false,
            redacted: false,
            created_at: Utc::now(),
        };
        self.store.complete(record)?;

        let next = if successful {
            ComponentState::Successful
        } else {
            ComponentState::Failed
        };
        self.set_component_state(component, next)?;
        tracing::info!(
            "Run {} {}: {} (rc {})",
            self.run.id.short_id(),
            component,
            if successful { "successful" } else { "failed" },
            outcome.exit_code
        );
        self.persist()
    }

    /// The cluster lost track of this task. Failure, never a silent drop;
    /// the claim is released so a later attempt can execute.
    pub fn task_lost(&mut self, component: ComponentId) -> Result<()> {
        if let Some((fp, _)) = self.dispatched.remove(&component) {
            self.store.abandon(&fp)?;
        }
        self.set_component_state(component, ComponentState::Failed)?;
        self.run.condition = Some(RunCondition::TaskLost {
            component: component.to_string(),
        });
        self.persist()
    }

    /// Fails the run outright (invalid pipeline, capacity, submission).
    /// In-flight components keep draining; nothing new starts.
    pub fn fail(&mut self, condition: RunCondition) -> Result<()> {
        tracing::error!("Run {} failed: {:?}", self.run.id.short_id(), condition);
        if self.run.condition.is_none() {
            self.run.condition = Some(condition);
        }
        self.run.apply_roll_up(&self.child_states);
        self.persist()
    }

    /// Cooperative cancellation: no new dispatch, wait for drain.
    pub fn cancel(&mut self) -> Result<()> {
        self.run.cancel_requested = true;
        tracing::info!("Run {} cancellation requested", self.run.id.short_id());
        self.run.apply_roll_up(&self.child_states);
        self.persist()
    }

    /// Releases the execution claim of a dispatched-but-never-submitted
    /// component and marks it cancelled.
    pub fn abandon_component(&mut self, component: ComponentId) -> Result<()> {
        if let Some((fp, _)) = self.dispatched.remove(&component) {
            self.store.abandon(&fp)?;
        }
        self.set_component_state(component, ComponentState::Cancelled)?;
        self.persist()
    }

    /// Registers a freshly spawned child run for a sub-pipeline step.
    pub fn register_child(&mut self, step: usize, child: RunId) -> Result<()> {
        self.child_states.insert(child.clone(), RunState::Pending);
        self.run.children.push(ChildLink { step, run: child });
        self.persist()
    }

    /// Folds a child run's progress into the parent step. On success the
    /// child's outputs are copied into the parent step's out directory so
    /// downstream cables see them like any other step output.
    pub fn finish_child(
        &mut self,
        step: usize,
        state: RunState,
        outputs: &[(String, PathBuf)],
    ) -> Result<()> {
        if let Some(child) = self.run.child_for_step(step).cloned() {
            self.child_states.insert(child, state);
        }
        let next = match state {
            RunState::Successful => {
                for (name, path) in outputs {
                    let dest = self.layout.step_output_path(step, name);
                    if let Some(parent) = dest.parent() {
                        fs_err::create_dir_all(parent)?;
                    }
                    fs_err::copy(path, &dest)?;
                }
                ComponentState::Successful
            }
            RunState::Failed | RunState::Quarantined => ComponentState::Failed,
            RunState::Cancelled => ComponentState::Cancelled,
            _ => return Ok(()),
        };
        self.set_component_state(ComponentId::Step { step }, next)?;
        self.persist()
    }

    /// Re-evaluates the whole run through the roll-up and persists. The
    /// roll-up recurses through child links the caller has reported via
    /// `finish_child`, so any depth of nesting resolves in one cycle.
    pub fn advance(&mut self) -> Result<RunState> {
        let state = self.run.apply_roll_up(&self.child_states);
        self.persist()?;
        Ok(state)
    }

    /// The run's declared outputs, as materialized files.
    pub fn collect_outputs(&self) -> Vec<(String, PathBuf)> {
        self.run
            .pipeline
            .outputs
            .iter()
            .map(|out| (out.name.clone(), self.layout.output_path(&out.name)))
            .collect()
    }
}
