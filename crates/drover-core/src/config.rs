use crate::constants::dirs;
use crate::errors::ConfigError;
use crate::model::SchedulerType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root under which sandboxes, the run queue, the dataset registry, and
    /// execution records live.
    pub data_root: PathBuf,
    pub scheduler: SchedulerType,
    pub manager: ManagerConfig,
    pub local: LocalConfig,
    pub slurm: SlurmConfig,
    pub purge: PurgeConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("drover-data"),
            scheduler: SchedulerType::Local,
            manager: ManagerConfig::default(),
            local: LocalConfig::default(),
            slurm: SlurmConfig::default(),
            purge: PurgeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub poll_interval_ms: u64,
    pub max_active_runs: usize,
    /// Wall-clock budget granted to the idle-task scheduler each cycle.
    pub idle_budget_ms: u64,
    pub submit_retries: u32,
    pub submit_backoff_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            max_active_runs: 4,
            idle_budget_ms: 100,
            submit_retries: 3,
            submit_backoff_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Caps for the in-process pool; autodetected from the host when unset.
    pub max_threads: Option<u32>,
    pub max_memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    pub sbatch: PathBuf,
    pub squeue: PathBuf,
    pub scancel: PathBuf,
    pub partition: Option<String>,
    /// Largest node the cluster offers; requests beyond this can never run.
    pub max_node_threads: u32,
    pub max_node_memory_mb: u64,
    /// Consecutive poll failures tolerated before a job is declared lost.
    pub poll_failure_limit: u32,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            sbatch: PathBuf::from("sbatch"),
            squeue: PathBuf::from("squeue"),
            scancel: PathBuf::from("scancel"),
            partition: None,
            max_node_threads: 32,
            max_node_memory_mb: 64 * 1024,
            poll_failure_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeConfig {
    pub sandbox_age_days: u64,
    pub dataset_age_days: u64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            sandbox_age_days: 14,
            dataset_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub max_files: usize,
    pub max_age_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_files: 10,
            max_age_days: 14,
        }
    }
}

impl Config {
    /// Loads from an explicit path, or the XDG config home, or defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::ConfigNotFound(path.to_path_buf()));
            }
            let content = fs_err::read_to_string(path)?;
            return Ok(toml::from_str(&content)?);
        }

        let xdg_dirs = xdg::BaseDirectories::with_prefix("drover");
        if let Some(path) = xdg_dirs.find_config_file("config.toml") {
            let content = fs_err::read_to_string(&path)?;
            return Ok(toml::from_str(&content)?);
        }
        Ok(Self::default())
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.data_root.join(dirs::SANDBOXES)
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.data_root.join(dirs::QUEUE)
    }

    pub fn datasets_dir(&self) -> PathBuf {
        self.data_root.join(dirs::DATASETS)
    }

    pub fn records_dir(&self) -> PathBuf {
        self.data_root.join(dirs::RECORDS)
    }
}
