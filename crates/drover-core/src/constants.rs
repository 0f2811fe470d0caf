pub mod dirs {
    pub const SANDBOXES: &str = "sandboxes";
    pub const QUEUE: &str = "queue";
    pub const INPUTS: &str = "inputs";
    pub const OUTPUTS: &str = "outputs";
    pub const CABLES: &str = "cables";
    pub const LOGS: &str = "logs";
    pub const DATASETS: &str = "datasets";
    pub const RECORDS: &str = "records";
}

pub mod files {
    pub const RUN_JSON: &str = "run.json";
    pub const TASK_JSON: &str = "task.json";
}

pub mod logs {
    pub const STDOUT: &str = "stdout.log";
    pub const STDERR: &str = "stderr.log";
    pub const RC: &str = "task.rc";
}

/// Built-in driver used for cable tasks. Cables only move one file.
pub const COPY_DRIVER: &str = "/bin/cp";
