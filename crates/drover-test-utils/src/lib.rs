//! Shared builders and a scripted cluster for integration tests.

use drover_cluster::{
    ClusterCapacity, ClusterInterface, TaskDescriptor, TaskHandle, TaskId, TaskOutcome, TaskPoll,
};
use drover_core::model::{
    CableSource, InputCable, Method, OutputCable, Pipeline, PipelineId, ResourceRequest, Step,
    Transformation,
};
use drover_core::record::MemoryRecordStore;
use drover_core::registry::DatasetRegistry;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// A method whose driver is `/bin/sh -c <script>`, for tests that execute
/// for real. Scripts run with the step directory as cwd, so `in/` and
/// `out/` are relative.
pub fn sh_method(id: &str, script: &str, inputs: &[&str], outputs: &[&str]) -> Transformation {
    Transformation::Method(Method {
        id: id.to_string(),
        driver: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), script.to_string()],
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        resources: ResourceRequest::default(),
    })
}

pub fn method_with_resources(
    id: &str,
    threads: u32,
    memory_mb: u64,
    inputs: &[&str],
    outputs: &[&str],
) -> Transformation {
    Transformation::Method(Method {
        id: id.to_string(),
        driver: PathBuf::from("/bin/true"),
        args: vec![],
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        resources: ResourceRequest::new(threads, memory_mb),
    })
}

/// A chain of n steps, each consuming the previous step's output:
/// run input -> step 0 -> ... -> step n-1 -> pipeline output "result".
pub fn linear_pipeline(id: &str, steps: usize) -> Pipeline {
    let mut pipeline_steps = Vec::new();
    for i in 0..steps {
        let source = if i == 0 {
            CableSource::RunInput { index: 0 }
        } else {
            CableSource::StepOutput {
                step: i - 1,
                output: "out".to_string(),
            }
        };
        pipeline_steps.push(Step {
            name: format!("step-{}", i),
            transformation: sh_method(
                &format!("{}-m{}", id, i),
                "cat in/in > out/out",
                &["in"],
                &["out"],
            ),
            cables: vec![InputCable {
                source,
                dest: "in".to_string(),
            }],
        });
    }
    Pipeline {
        id: PipelineId(id.to_string()),
        name: id.to_string(),
        inputs: vec!["data".to_string()],
        steps: pipeline_steps,
        outputs: vec![OutputCable {
            name: "result".to_string(),
            source: CableSource::StepOutput {
                step: steps - 1,
                output: "out".to_string(),
            },
        }],
    }
}

/// Temp directories plus the shared stores every integration test needs.
pub struct TestContext {
    pub _temp_dir: tempfile::TempDir,
    pub data_root: PathBuf,
    pub sandbox_root: PathBuf,
    pub registry: Arc<DatasetRegistry>,
    pub store: Arc<MemoryRecordStore>,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = tempfile::Builder::new()
            .prefix("drover-test-")
            .tempdir()
            .expect("failed to create temp dir");
        let data_root = temp_dir.path().to_path_buf();
        let sandbox_root = data_root.join("sandboxes");
        fs::create_dir_all(&sandbox_root).expect("failed to create sandbox root");
        let registry = Arc::new(
            DatasetRegistry::open(data_root.join("datasets")).expect("failed to open registry"),
        );
        Self {
            _temp_dir: temp_dir,
            data_root,
            sandbox_root,
            registry,
            store: Arc::new(MemoryRecordStore::new()),
        }
    }

    pub fn write_input(&self, name: &str, content: &str) -> PathBuf {
        let path = self.data_root.join(name);
        fs::write(&path, content).expect("failed to write input file");
        path
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Succeed,
    Fail(i32),
    Lose,
    /// Report Running for this many polls, then succeed.
    SucceedAfter(u32),
    /// Refuse the submission itself.
    RejectSubmit,
}

/// A cluster that plays back predetermined outcomes instead of executing
/// anything. Successful tasks get their output files written with content
/// derived from their inputs, so fingerprints stay deterministic across
/// identical runs.
pub struct ScriptedCluster {
    capacity: ClusterCapacity,
    rules: Vec<(String, ScriptedOutcome)>,
    pub submissions: Vec<TaskId>,
    tasks: HashMap<TaskHandle, (TaskDescriptor, ScriptedOutcome)>,
    resolved: HashMap<TaskHandle, TaskPoll>,
    next_handle: u64,
}

impl ScriptedCluster {
    pub fn new(capacity: ClusterCapacity) -> Self {
        Self {
            capacity,
            rules: Vec::new(),
            submissions: Vec::new(),
            tasks: HashMap::new(),
            resolved: HashMap::new(),
            next_handle: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ClusterCapacity {
            max_threads: 8,
            max_memory_mb: 16 * 1024,
        })
    }

    /// Tasks whose id contains `pattern` get this outcome; everything else
    /// succeeds.
    pub fn on(mut self, pattern: &str, outcome: ScriptedOutcome) -> Self {
        self.rules.push((pattern.to_string(), outcome));
        self
    }

    /// Same as `on`, for a cluster already handed to a manager.
    pub fn add_rule(&mut self, pattern: &str, outcome: ScriptedOutcome) {
        self.rules.push((pattern.to_string(), outcome));
    }

    fn outcome_for(&self, task: &TaskDescriptor) -> ScriptedOutcome {
        for (pattern, outcome) in &self.rules {
            if task.id.0.contains(pattern.as_str()) {
                return outcome.clone();
            }
        }
        ScriptedOutcome::Succeed
    }

    fn write_outputs(task: &TaskDescriptor) {
        let mut content = format!("{}\n", task.component);
        for input in &task.inputs {
            if let Ok(data) = fs::read_to_string(input) {
                content.push_str(&data);
            }
        }
        for output in &task.outputs {
            if let Some(parent) = output.parent() {
                let _ = fs::create_dir_all(parent);
            }
            fs::write(output, &content).expect("scripted cluster failed to write output");
        }
    }
}

/// Shares a `ScriptedCluster` between the manager (which owns its cluster
/// box) and the test (which wants to inspect submissions afterwards).
pub struct SharedCluster(Arc<std::sync::Mutex<ScriptedCluster>>);

impl SharedCluster {
    pub fn new(cluster: ScriptedCluster) -> (Self, Arc<std::sync::Mutex<ScriptedCluster>>) {
        let inner = Arc::new(std::sync::Mutex::new(cluster));
        (Self(inner.clone()), inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedCluster> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ClusterInterface for SharedCluster {
    fn submit(&mut self, task: &TaskDescriptor) -> drover_cluster::Result<TaskHandle> {
        self.lock().submit(task)
    }

    fn poll(&mut self, handle: TaskHandle) -> drover_cluster::Result<TaskPoll> {
        self.lock().poll(handle)
    }

    fn cancel(&mut self, handle: TaskHandle) -> drover_cluster::Result<()> {
        self.lock().cancel(handle)
    }

    fn capacity(&self) -> ClusterCapacity {
        self.lock().capacity()
    }
}

impl ClusterInterface for ScriptedCluster {
    fn submit(&mut self, task: &TaskDescriptor) -> drover_cluster::Result<TaskHandle> {
        let outcome = self.outcome_for(task);
        if matches!(outcome, ScriptedOutcome::RejectSubmit) {
            return Err(drover_cluster::ClusterError::SubmitRejected {
                stderr: "scripted rejection".to_string(),
            });
        }
        task.prepare()?;
        let handle = TaskHandle(self.next_handle);
        self.next_handle += 1;
        self.submissions.push(task.id.clone());
        self.tasks.insert(handle, (task.clone(), outcome));
        Ok(handle)
    }

    fn poll(&mut self, handle: TaskHandle) -> drover_cluster::Result<TaskPoll> {
        if let Some(poll) = self.resolved.get(&handle) {
            return Ok(poll.clone());
        }
        let (task, outcome) = self
            .tasks
            .get_mut(&handle)
            .ok_or(drover_cluster::ClusterError::UnknownHandle(handle))?;

        let poll = match outcome {
            ScriptedOutcome::SucceedAfter(remaining) if *remaining > 0 => {
                *remaining -= 1;
                return Ok(TaskPoll::Running);
            }
            ScriptedOutcome::Succeed | ScriptedOutcome::SucceedAfter(_) => {
                Self::write_outputs(task);
                TaskPoll::Done(TaskOutcome { exit_code: 0 })
            }
            ScriptedOutcome::Fail(code) => TaskPoll::Done(TaskOutcome { exit_code: *code }),
            ScriptedOutcome::Lose => TaskPoll::Lost,
            ScriptedOutcome::RejectSubmit => unreachable!("rejected at submit"),
        };
        self.resolved.insert(handle, poll.clone());
        Ok(poll)
    }

    fn cancel(&mut self, _handle: TaskHandle) -> drover_cluster::Result<()> {
        Ok(())
    }

    fn capacity(&self) -> ClusterCapacity {
        self.capacity
    }
}
