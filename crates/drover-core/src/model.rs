use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct PipelineId(pub String);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PipelineId {
    fn from(s: String) -> Self {
        PipelineId(s)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    /// First hash block of the id, for log lines and status listings.
    pub fn short_id(&self) -> &str {
        match self.0.split_once('-') {
            Some((head, _)) if head.len() >= 7 => head,
            _ => &self.0,
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RunId(s.to_string()))
    }
}

/// Content identity of a dataset: lowercase hex SHA-256 of its bytes.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct DatasetHash(pub String);

impl fmt::Display for DatasetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerType {
    #[default]
    Local,
    Slurm,
}

impl fmt::Display for SchedulerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerType::Local => write!(f, "local"),
            SchedulerType::Slurm => write!(f, "slurm"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSchedulerTypeError(pub String);

impl fmt::Display for ParseSchedulerTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid scheduler type: '{}'. Valid values are: local, slurm",
            self.0
        )
    }
}

impl std::error::Error for ParseSchedulerTypeError {}

impl FromStr for SchedulerType {
    type Err = ParseSchedulerTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(SchedulerType::Local),
            "slurm" => Ok(SchedulerType::Slurm),
            _ => Err(ParseSchedulerTypeError(s.to_string())),
        }
    }
}

/// Where a cable draws its data from.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CableSource {
    /// The n-th declared input of the run, 0-based.
    RunInput { index: usize },
    /// A named output of an upstream step, 0-based step index.
    StepOutput { step: usize, output: String },
}

/// Wiring for one input of a step's transformation.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct InputCable {
    pub source: CableSource,
    /// Name of the transformation input this cable feeds.
    pub dest: String,
}

/// Wiring for one declared output of the pipeline.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutputCable {
    pub name: String,
    pub source: CableSource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRequest {
    #[serde(default = "default_threads")]
    pub threads: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
}

fn default_threads() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    1024
}

impl ResourceRequest {
    pub fn new(threads: u32, memory_mb: u64) -> Self {
        Self { threads, memory_mb }
    }
}

/// A concrete driver program with declared, ordered inputs and outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Method {
    /// Stable identity of this method revision; part of every fingerprint.
    pub id: String,
    pub driver: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub resources: ResourceRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Transformation {
    Method(Method),
    /// A nested pipeline; executing the step spawns a child run.
    Pipeline(Box<Pipeline>),
}

impl Transformation {
    pub fn identity(&self) -> &str {
        match self {
            Transformation::Method(m) => &m.id,
            Transformation::Pipeline(p) => &p.id.0,
        }
    }

    pub fn input_names(&self) -> Vec<&str> {
        match self {
            Transformation::Method(m) => m.inputs.iter().map(String::as_str).collect(),
            Transformation::Pipeline(p) => p.inputs.iter().map(String::as_str).collect(),
        }
    }

    pub fn output_names(&self) -> Vec<&str> {
        match self {
            Transformation::Method(m) => m.outputs.iter().map(String::as_str).collect(),
            Transformation::Pipeline(p) => p.outputs.iter().map(|o| o.name.as_str()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub transformation: Transformation,
    pub cables: Vec<InputCable>,
}

impl Step {
    pub fn produces(&self, output: &str) -> bool {
        self.transformation.output_names().contains(&output)
    }
}

/// A directed acyclic graph of steps and cables. Read-only to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    /// Names of the declared run inputs, in order.
    pub inputs: Vec<String>,
    pub steps: Vec<Step>,
    pub outputs: Vec<OutputCable>,
}

impl Pipeline {
    /// Step indices that `step` draws data from through its input cables.
    pub fn upstream_of(&self, step: usize) -> HashSet<usize> {
        self.steps[step]
            .cables
            .iter()
            .filter_map(|c| match &c.source {
                CableSource::StepOutput { step, .. } => Some(*step),
                CableSource::RunInput { .. } => None,
            })
            .collect()
    }

    /// Checks wiring and acyclicity. A pipeline that fails here can never
    /// produce a task; the run is failed immediately.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.steps.is_empty() {
            return Err(PipelineError::Empty(self.name.clone()));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            let input_names = step.transformation.input_names();
            let mut wired: HashSet<&str> = HashSet::new();

            for cable in &step.cables {
                if !input_names.contains(&cable.dest.as_str()) {
                    return Err(PipelineError::NotAnInput {
                        step: idx,
                        input: cable.dest.clone(),
                    });
                }
                if !wired.insert(cable.dest.as_str()) {
                    return Err(PipelineError::DuplicateWiring {
                        step: idx,
                        input: cable.dest.clone(),
                    });
                }
                self.check_source(&cable.source, idx)?;
            }

            for name in input_names {
                if !wired.contains(name) {
                    return Err(PipelineError::UnresolvableSource {
                        step: idx,
                        input: name.to_string(),
                    });
                }
            }

            if let Transformation::Pipeline(child) = &step.transformation {
                child.validate()?;
            }
        }

        for out in &self.outputs {
            match &out.source {
                CableSource::RunInput { index } if *index >= self.inputs.len() => {
                    return Err(PipelineError::UnresolvableOutput {
                        name: out.name.clone(),
                    });
                }
                CableSource::StepOutput { step, output } => {
                    let ok = self
                        .steps
                        .get(*step)
                        .map(|s| s.produces(output))
                        .unwrap_or(false);
                    if !ok {
                        return Err(PipelineError::UnresolvableOutput {
                            name: out.name.clone(),
                        });
                    }
                }
                CableSource::RunInput { .. } => {}
            }
        }

        self.check_acyclic()?;
        Ok(())
    }

    fn check_source(&self, source: &CableSource, step: usize) -> Result<(), PipelineError> {
        match source {
            CableSource::RunInput { index } => {
                if *index >= self.inputs.len() {
                    return Err(PipelineError::InputOutOfRange {
                        index: *index,
                        declared: self.inputs.len(),
                    });
                }
            }
            CableSource::StepOutput {
                step: source_step,
                output,
            } => {
                let source = self
                    .steps
                    .get(*source_step)
                    .ok_or(PipelineError::UnknownStep {
                        step,
                        referenced: *source_step,
                    })?;
                if !source.produces(output) {
                    return Err(PipelineError::UnknownOutput {
                        step,
                        referenced: *source_step,
                        output: output.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<(), PipelineError> {
        let mut in_degree: HashMap<usize, usize> = HashMap::new();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();

        for idx in 0..self.steps.len() {
            let upstream = self.upstream_of(idx);
            in_degree.insert(idx, upstream.len());
            for dep in upstream {
                dependents.entry(dep).or_default().push(idx);
            }
        }

        let mut queue: Vec<usize> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut visited = 0usize;

        while let Some(idx) = queue.pop() {
            visited += 1;
            if let Some(deps) = dependents.get(&idx) {
                for &dep in deps {
                    let deg = in_degree.entry(dep).or_insert(0);
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push(dep);
                    }
                }
            }
        }

        if visited != self.steps.len() {
            return Err(PipelineError::CycleDetected(self.name.clone()));
        }
        Ok(())
    }
}
