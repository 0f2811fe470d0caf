use drover_core::constants::{dirs, files};
use drover_core::state::ComponentId;
use std::path::{Path, PathBuf};

/// Filesystem layout of one run's sandbox:
///
/// ```text
/// <root>/
///   run.json
///   inputs/<index>_<name>
///   step_<n>/{in,out,logs}
///   cables/<id>/{logs}
///   outputs/<name>
/// ```
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_json(&self) -> PathBuf {
        self.root.join(files::RUN_JSON)
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.root.join(dirs::INPUTS)
    }

    pub fn input_path(&self, index: usize, name: &str) -> PathBuf {
        self.inputs_dir().join(format!("{}_{}", index, name))
    }

    pub fn step_dir(&self, step: usize) -> PathBuf {
        self.root.join(format!("step_{}", step))
    }

    pub fn step_in_dir(&self, step: usize) -> PathBuf {
        self.step_dir(step).join("in")
    }

    pub fn step_out_dir(&self, step: usize) -> PathBuf {
        self.step_dir(step).join("out")
    }

    pub fn step_logs_dir(&self, step: usize) -> PathBuf {
        self.step_dir(step).join(dirs::LOGS)
    }

    pub fn step_input_path(&self, step: usize, name: &str) -> PathBuf {
        self.step_in_dir(step).join(name)
    }

    pub fn step_output_path(&self, step: usize, name: &str) -> PathBuf {
        self.step_out_dir(step).join(name)
    }

    pub fn cable_dir(&self, id: ComponentId) -> PathBuf {
        let leaf = match id {
            ComponentId::InputCable { step, cable } => format!("s{}_c{}", step, cable),
            ComponentId::OutputCable { output } => format!("out_{}", output),
            ComponentId::Step { step } => format!("s{}", step),
        };
        self.root.join(dirs::CABLES).join(leaf)
    }

    pub fn cable_logs_dir(&self, id: ComponentId) -> PathBuf {
        self.cable_dir(id).join(dirs::LOGS)
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join(dirs::OUTPUTS)
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        self.outputs_dir().join(name)
    }
}
