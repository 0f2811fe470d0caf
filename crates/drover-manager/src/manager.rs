use crate::error::Result;
use crate::idle::{DatasetPurgeTask, IdleScheduler, LogPurgeTask, SandboxPurgeTask};
use crate::queue::{drain_spool, RunRequest};
use drover_cluster::{
    ClusterCapacity, ClusterInterface, LocalPool, SlurmClient, TaskDescriptor, TaskHandle,
    TaskPoll,
};
use drover_core::config::Config;
use drover_core::model::{RunId, SchedulerType};
use drover_core::record::{FsRecordStore, RecordStore};
use drover_core::registry::DatasetRegistry;
use drover_core::state::{ComponentId, ParentLink, RunCondition, RunState};
use drover_sandbox::{Action, Sandbox};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// System-wide reservation of cluster resources. The manager never lets
/// in-flight reservations exceed the cluster's total capacity, whatever
/// queueing the backend does internally.
struct ResourceBudget {
    capacity: ClusterCapacity,
    used_threads: u32,
    used_memory_mb: u64,
    held: HashMap<TaskHandle, (u32, u64)>,
}

impl ResourceBudget {
    fn new(capacity: ClusterCapacity) -> Self {
        Self {
            capacity,
            used_threads: 0,
            used_memory_mb: 0,
            held: HashMap::new(),
        }
    }

    fn can_fit(&self, threads: u32, memory_mb: u64) -> bool {
        if self.held.is_empty() {
            return true;
        }
        self.used_threads + threads <= self.capacity.max_threads
            && self.used_memory_mb + memory_mb <= self.capacity.max_memory_mb
    }

    fn reserve(&mut self, handle: TaskHandle, threads: u32, memory_mb: u64) {
        self.used_threads += threads;
        self.used_memory_mb += memory_mb;
        self.held.insert(handle, (threads, memory_mb));
    }

    fn release(&mut self, handle: TaskHandle) {
        if let Some((threads, memory_mb)) = self.held.remove(&handle) {
            self.used_threads = self.used_threads.saturating_sub(threads);
            self.used_memory_mb = self.used_memory_mb.saturating_sub(memory_mb);
        }
    }
}

struct ActiveRun {
    sandbox: Sandbox,
    in_flight: HashMap<TaskHandle, ComponentId>,
    /// Dispatched by the sandbox but still waiting for budget.
    awaiting_submit: VecDeque<TaskDescriptor>,
}

impl ActiveRun {
    fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox,
            in_flight: HashMap::new(),
            awaiting_submit: VecDeque::new(),
        }
    }

    fn id(&self) -> RunId {
        self.sandbox.run().id.clone()
    }
}

/// The top-level scheduling loop: owns the queue of pending run requests,
/// the pool of active sandboxes, and the cluster interface. Constructed
/// and started explicitly by the host entry point; nothing starts as a
/// side effect of loading code.
pub struct Manager {
    config: Config,
    cluster: Box<dyn ClusterInterface>,
    registry: Arc<DatasetRegistry>,
    store: Arc<dyn RecordStore>,
    queue: VecDeque<(RunId, RunRequest)>,
    active: Vec<ActiveRun>,
    budget: ResourceBudget,
    idle: IdleScheduler,
}

impl Manager {
    pub fn new(config: Config) -> Result<Self> {
        let cluster: Box<dyn ClusterInterface> = match config.scheduler {
            SchedulerType::Local => Box::new(LocalPool::new(&config.local)),
            SchedulerType::Slurm => Box::new(SlurmClient::new(config.slurm.clone())),
        };
        let registry = Arc::new(DatasetRegistry::open(config.datasets_dir())?);
        let store: Arc<dyn RecordStore> = Arc::new(FsRecordStore::open(config.records_dir())?);
        Ok(Self::with_cluster(config, cluster, registry, store))
    }

    /// Injection point for tests and alternative backends.
    pub fn with_cluster(
        config: Config,
        cluster: Box<dyn ClusterInterface>,
        registry: Arc<DatasetRegistry>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let capacity = cluster.capacity();
        let mut idle = IdleScheduler::new();
        idle.register(Box::new(SandboxPurgeTask::new(
            config.sandboxes_dir(),
            &config.purge,
        )));
        idle.register(Box::new(DatasetPurgeTask::new(
            config.datasets_dir(),
            &config.purge,
        )));
        idle.register(Box::new(LogPurgeTask::new(config.logging.clone())));

        Self {
            config,
            cluster,
            registry,
            store,
            queue: VecDeque::new(),
            active: Vec::new(),
            budget: ResourceBudget::new(capacity),
            idle,
        }
    }

    pub fn enqueue(&mut self, request: RunRequest) -> RunId {
        let id = RunId::generate();
        tracing::info!(
            "Queued run {} for pipeline '{}'",
            id.short_id(),
            request.pipeline.name
        );
        self.queue.push_back((id.clone(), request));
        id
    }

    /// Requests cooperative cancellation: no new dispatch for the run,
    /// already-submitted tasks drain. Returns false for unknown runs.
    pub fn cancel_run(&mut self, id: &RunId) -> bool {
        let Some(run) = self.active.iter_mut().find(|r| &r.sandbox.run().id == id) else {
            return false;
        };
        if let Err(e) = run.sandbox.cancel() {
            tracing::error!("Failed to record cancellation for {}: {}", id.short_id(), e);
        }
        let waiting: Vec<TaskDescriptor> = run.awaiting_submit.drain(..).collect();
        for task in waiting {
            if let Err(e) = run.sandbox.abandon_component(task.component) {
                tracing::error!("Failed to abandon {}: {}", task.id, e);
            }
        }
        true
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// One scheduling cycle: admit, poll completions, dispatch, advance,
    /// then spend the idle budget on maintenance.
    pub fn cycle(&mut self) -> Result<()> {
        self.scan_spool();
        self.admit();
        self.poll_in_flight();
        self.dispatch();
        self.advance_and_retire();
        let budget = Duration::from_millis(self.config.manager.idle_budget_ms);
        self.idle.run_until(Instant::now() + budget);
        Ok(())
    }

    /// Runs cycles until shut down, or, with `quit_idle`, until no runs
    /// remain.
    pub fn run(&mut self, quit_idle: bool, shutdown: &AtomicBool) -> Result<()> {
        tracing::info!(
            "Manager started: {} scheduler, {} max active run(s)",
            self.config.scheduler,
            self.config.manager.max_active_runs
        );
        loop {
            if shutdown.load(Ordering::Relaxed) {
                tracing::info!("Shutdown requested; leaving the scheduling loop");
                break;
            }
            self.cycle()?;
            if quit_idle && self.queue.is_empty() && self.active.is_empty() {
                tracing::info!("No runs remain; quitting idle manager");
                break;
            }
            thread::sleep(Duration::from_millis(self.config.manager.poll_interval_ms));
        }
        Ok(())
    }

    fn scan_spool(&mut self) {
        match drain_spool(&self.config.queue_dir()) {
            Ok(requests) => {
                for request in requests {
                    self.enqueue(request);
                }
            }
            Err(e) => tracing::warn!("Failed to drain run queue spool: {}", e),
        }
    }

    fn admit(&mut self) {
        while self.active.len() < self.config.manager.max_active_runs {
            let Some((id, request)) = self.queue.pop_front() else {
                break;
            };
            let owner = request
                .owner
                .clone()
                .unwrap_or_else(whoami::username);
            match Sandbox::create(
                id.clone(),
                request.pipeline,
                &request.inputs,
                owner,
                &self.config.sandboxes_dir(),
                self.registry.clone(),
                self.store.clone(),
            ) {
                Ok(sandbox) => self.active.push(ActiveRun::new(sandbox)),
                Err(e) => {
                    // Admission failure is isolated to this request.
                    tracing::error!("Could not create sandbox for run {}: {}", id.short_id(), e);
                }
            }
        }
    }

    fn poll_in_flight(&mut self) {
        for run in &mut self.active {
            let handles: Vec<TaskHandle> = run.in_flight.keys().copied().collect();
            for handle in handles {
                let component = run.in_flight[&handle];
                match self.cluster.poll(handle) {
                    Ok(TaskPoll::Done(outcome)) => {
                        self.budget.release(handle);
                        run.in_flight.remove(&handle);
                        if let Err(e) = run.sandbox.finish_task(component, &outcome) {
                            tracing::error!(
                                "Run {} {}: failed to record completion: {}",
                                run.sandbox.run().id.short_id(),
                                component,
                                e
                            );
                        }
                    }
                    Ok(TaskPoll::Lost) => {
                        self.budget.release(handle);
                        run.in_flight.remove(&handle);
                        tracing::error!(
                            "Run {} {}: task lost by the cluster",
                            run.sandbox.run().id.short_id(),
                            component
                        );
                        if let Err(e) = run.sandbox.task_lost(component) {
                            tracing::error!("Failed to record lost task: {}", e);
                        }
                    }
                    Ok(TaskPoll::Pending | TaskPoll::Running) => {}
                    Err(e) => {
                        // Transient; the backend applies its own retry
                        // bound before reporting Lost.
                        tracing::warn!("Poll failed for {}: {}", handle, e);
                    }
                }
            }
        }
    }

    fn dispatch(&mut self) {
        let mut spawns: Vec<(RunId, usize, RunRequest)> = Vec::new();

        for run in &mut self.active {
            if run.sandbox.run().cancel_requested {
                continue;
            }
            let actions = match run.sandbox.startable_tasks() {
                Ok(actions) => actions,
                Err(e) => {
                    tracing::error!(
                        "Run {}: scheduling failed: {}",
                        run.sandbox.run().id.short_id(),
                        e
                    );
                    continue;
                }
            };
            for action in actions {
                match action {
                    Action::Dispatch(task) => run.awaiting_submit.push_back(task),
                    Action::SpawnChild {
                        step,
                        pipeline,
                        input_files,
                    } => {
                        spawns.push((
                            run.id(),
                            step,
                            RunRequest {
                                pipeline,
                                inputs: input_files,
                                owner: Some(run.sandbox.run().owner.clone()),
                            },
                        ));
                    }
                }
            }

            Self::submit_waiting(
                run,
                self.cluster.as_mut(),
                &mut self.budget,
                &self.config,
            );
        }

        for (parent, step, request) in spawns {
            self.spawn_child(parent, step, request);
        }
    }

    fn submit_waiting(
        run: &mut ActiveRun,
        cluster: &mut dyn ClusterInterface,
        budget: &mut ResourceBudget,
        config: &Config,
    ) {
        let capacity = cluster.capacity();
        while let Some(task) = run.awaiting_submit.front() {
            // A request no node can ever satisfy fails the run outright;
            // queueing it would wait forever.
            if !capacity.can_ever_fit(task.threads, task.memory_mb) {
                let task = run
                    .awaiting_submit
                    .pop_front()
                    .expect("front() just succeeded");
                let condition = RunCondition::ExceedsSystemCapabilities {
                    threads: task.threads,
                    memory_mb: task.memory_mb,
                    max_threads: capacity.max_threads,
                    max_memory_mb: capacity.max_memory_mb,
                };
                if let Err(e) = run.sandbox.abandon_component(task.component) {
                    tracing::error!("Failed to abandon {}: {}", task.id, e);
                }
                if let Err(e) = run.sandbox.fail(condition) {
                    tracing::error!("Failed to fail run: {}", e);
                }
                Self::abandon_waiting(run);
                return;
            }

            if !budget.can_fit(task.threads, task.memory_mb) {
                break;
            }

            let task = run
                .awaiting_submit
                .pop_front()
                .expect("front() just succeeded");
            match Self::submit_with_retry(cluster, &task, config) {
                Ok(handle) => {
                    budget.reserve(handle, task.threads, task.memory_mb);
                    run.in_flight.insert(handle, task.component);
                }
                Err(e) => {
                    tracing::error!("Submission of {} failed permanently: {}", task.id, e);
                    if let Err(e) = run.sandbox.abandon_component(task.component) {
                        tracing::error!("Failed to abandon {}: {}", task.id, e);
                    }
                    if let Err(e) = run.sandbox.fail(RunCondition::SubmitFailed {
                        message: e.to_string(),
                    }) {
                        tracing::error!("Failed to fail run: {}", e);
                    }
                    Self::abandon_waiting(run);
                    return;
                }
            }
        }
    }

    fn abandon_waiting(run: &mut ActiveRun) {
        let waiting: Vec<TaskDescriptor> = run.awaiting_submit.drain(..).collect();
        for task in waiting {
            if let Err(e) = run.sandbox.abandon_component(task.component) {
                tracing::error!("Failed to abandon {}: {}", task.id, e);
            }
        }
    }

    fn submit_with_retry(
        cluster: &mut dyn ClusterInterface,
        task: &TaskDescriptor,
        config: &Config,
    ) -> drover_cluster::Result<TaskHandle> {
        let mut attempt = 0;
        loop {
            match cluster.submit(task) {
                Ok(handle) => return Ok(handle),
                Err(e) if attempt < config.manager.submit_retries => {
                    attempt += 1;
                    let backoff =
                        Duration::from_millis(config.manager.submit_backoff_ms * attempt as u64);
                    tracing::warn!(
                        "Submission of {} failed (attempt {}): {}; retrying in {:?}",
                        task.id,
                        attempt,
                        e,
                        backoff
                    );
                    thread::sleep(backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_child(&mut self, parent: RunId, step: usize, request: RunRequest) {
        let child_id = RunId::generate();
        tracing::info!(
            "Run {} step {}: spawning child run {} for nested pipeline '{}'",
            parent.short_id(),
            step,
            child_id.short_id(),
            request.pipeline.name
        );
        let owner = request.owner.clone().unwrap_or_else(whoami::username);
        match Sandbox::create(
            child_id.clone(),
            request.pipeline,
            &request.inputs,
            owner,
            &self.config.sandboxes_dir(),
            self.registry.clone(),
            self.store.clone(),
        ) {
            Ok(mut sandbox) => {
                if let Err(e) = sandbox.set_parent(ParentLink {
                    run: parent.clone(),
                    step,
                }) {
                    tracing::error!("Failed to link child run: {}", e);
                }
                if let Some(parent_run) =
                    self.active.iter_mut().find(|r| r.sandbox.run().id == parent)
                {
                    if let Err(e) = parent_run.sandbox.register_child(step, child_id) {
                        tracing::error!("Failed to register child run: {}", e);
                    }
                }
                self.active.push(ActiveRun::new(sandbox));
            }
            Err(e) => {
                tracing::error!("Could not create child sandbox: {}", e);
                if let Some(parent_run) =
                    self.active.iter_mut().find(|r| r.sandbox.run().id == parent)
                {
                    let _ = parent_run.sandbox.fail(RunCondition::SubmitFailed {
                        message: format!("child run creation failed: {}", e),
                    });
                }
            }
        }
    }

    /// Rolls every run up and retires the terminal ones, folding child
    /// results into their parents. Loops to a fixpoint so any depth of
    /// sub-pipeline nesting resolves within this one cycle.
    fn advance_and_retire(&mut self) {
        loop {
            let mut notifications: Vec<(RunId, usize, RunState, Vec<(String, PathBuf)>)> =
                Vec::new();
            let mut retired = Vec::new();

            for (index, run) in self.active.iter_mut().enumerate() {
                let state = match run.sandbox.advance() {
                    Ok(state) => state,
                    Err(e) => {
                        tracing::error!(
                            "Run {}: advance failed: {}",
                            run.sandbox.run().id.short_id(),
                            e
                        );
                        continue;
                    }
                };
                if state.is_terminal()
                    && run.in_flight.is_empty()
                    && run.awaiting_submit.is_empty()
                {
                    tracing::info!(
                        "Run {} finished: {} [{}]",
                        run.sandbox.run().id.short_id(),
                        state,
                        run.sandbox.run().render_progress()
                    );
                    if let Some(parent) = run.sandbox.run().parent.clone() {
                        notifications.push((
                            parent.run,
                            parent.step,
                            state,
                            run.sandbox.collect_outputs(),
                        ));
                    }
                    retired.push(index);
                }
            }

            for index in retired.iter().rev() {
                self.active.remove(*index);
            }

            let progressed = !notifications.is_empty();
            for (parent, step, state, outputs) in notifications {
                if let Some(run) = self
                    .active
                    .iter_mut()
                    .find(|r| r.sandbox.run().id == parent)
                {
                    if let Err(e) = run.sandbox.finish_child(step, state, &outputs) {
                        tracing::error!(
                            "Run {}: failed to fold child result in: {}",
                            parent.short_id(),
                            e
                        );
                    }
                } else {
                    tracing::warn!(
                        "Child of run {} finished, but the parent is no longer active",
                        parent.short_id()
                    );
                }
            }

            if !progressed {
                break;
            }
        }
    }
}
