use crate::error::{ClusterError, Result};
use crate::task::TaskDescriptor;
use crate::{ClusterCapacity, ClusterInterface, TaskHandle, TaskOutcome, TaskPoll};
use drover_core::config::SlurmConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Pulls the job id out of sbatch's acknowledgement, canonically
/// "Submitted batch job 12345".
fn parse_job_id(stdout: &str) -> Option<u64> {
    stdout.split_whitespace().next_back()?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Waiting,
    Started,
}

/// Scans `squeue --noheader -o "%i %t"` output for a job.
fn find_in_queue(output: &str, job_id: u64) -> Option<QueueState> {
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let id: u64 = match parts.next().and_then(|t| t.parse().ok()) {
            Some(id) => id,
            None => continue,
        };
        if id != job_id {
            continue;
        }
        return match parts.next() {
            Some("PD") => Some(QueueState::Waiting),
            _ => Some(QueueState::Started),
        };
    }
    None
}

struct SlurmJob {
    job_id: u64,
    rc_path: PathBuf,
    poll_failures: u32,
    resolved: Option<TaskPoll>,
}

/// Batch-scheduler realization of the cluster: jobs are handed to sbatch
/// and observed through squeue plus an exit-code marker file, since the
/// driver process itself runs on some remote node.
pub struct SlurmClient {
    config: SlurmConfig,
    next_handle: u64,
    jobs: HashMap<TaskHandle, SlurmJob>,
}

impl SlurmClient {
    pub fn new(config: SlurmConfig) -> Self {
        Self {
            config,
            next_handle: 0,
            jobs: HashMap::new(),
        }
    }

    fn sbatch_args(&self, task: &TaskDescriptor) -> Vec<String> {
        let (program, args) = task.command();
        let mut command_line = shell_quote(&program.to_string_lossy());
        for arg in &args {
            command_line.push(' ');
            command_line.push_str(&shell_quote(arg));
        }
        // The wrapper records the driver's exit code where poll() can find
        // it after the job leaves the queue.
        command_line.push_str(&format!(
            "; echo $? > {}",
            shell_quote(&task.rc_path().to_string_lossy())
        ));

        let mut sbatch_args = vec![
            format!("--mem={}M", task.memory_mb),
            format!("--cpus-per-task={}", task.threads),
            format!("--output={}", task.stdout_path().display()),
            format!("--error={}", task.stderr_path().display()),
        ];
        if let Some(partition) = &self.config.partition {
            sbatch_args.push(format!("--partition={}", partition));
        }
        sbatch_args.push(format!("--wrap={}", command_line));
        sbatch_args
    }

    fn run_squeue(&self, job_id: u64) -> Result<String> {
        let output = Command::new(&self.config.squeue)
            .arg("--noheader")
            .arg("-o")
            .arg("%i %t")
            .arg("-j")
            .arg(job_id.to_string())
            .output()
            .map_err(|e| ClusterError::CommandFailed {
                command: self.config.squeue.display().to_string(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(ClusterError::PollFailed {
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl ClusterInterface for SlurmClient {
    fn submit(&mut self, task: &TaskDescriptor) -> Result<TaskHandle> {
        task.prepare()?;

        let output = Command::new(&self.config.sbatch)
            .args(self.sbatch_args(task))
            .output()
            .map_err(|e| ClusterError::CommandFailed {
                command: self.config.sbatch.display().to_string(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ClusterError::SubmitRejected {
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let job_id = parse_job_id(&stdout).ok_or(ClusterError::JobIdParse { stdout })?;

        let handle = TaskHandle(self.next_handle);
        self.next_handle += 1;
        tracing::info!("Submitted {} as slurm job {}", task.id, job_id);
        self.jobs.insert(
            handle,
            SlurmJob {
                job_id,
                rc_path: task.rc_path(),
                poll_failures: 0,
                resolved: None,
            },
        );
        Ok(handle)
    }

    fn poll(&mut self, handle: TaskHandle) -> Result<TaskPoll> {
        let limit = self.config.poll_failure_limit;
        let (job_id, rc_path, resolved) = {
            let job = self
                .jobs
                .get(&handle)
                .ok_or(ClusterError::UnknownHandle(handle))?;
            (job.job_id, job.rc_path.clone(), job.resolved.clone())
        };
        if let Some(resolved) = resolved {
            return Ok(resolved);
        }

        // The rc marker is authoritative; check it before squeue so a
        // finished job never counts as a poll failure.
        if let Ok(content) = fs_err::read_to_string(&rc_path) {
            if let Ok(exit_code) = content.trim().parse::<i32>() {
                let poll = TaskPoll::Done(TaskOutcome { exit_code });
                if let Some(job) = self.jobs.get_mut(&handle) {
                    job.resolved = Some(poll.clone());
                }
                tracing::debug!("Slurm job {} finished with rc {}", job_id, exit_code);
                return Ok(poll);
            }
        }

        let squeue_output = self.run_squeue(job_id);
        let job = self
            .jobs
            .get_mut(&handle)
            .ok_or(ClusterError::UnknownHandle(handle))?;

        match squeue_output {
            Ok(output) => match find_in_queue(&output, job.job_id) {
                Some(QueueState::Waiting) => {
                    job.poll_failures = 0;
                    Ok(TaskPoll::Pending)
                }
                Some(QueueState::Started) => {
                    job.poll_failures = 0;
                    Ok(TaskPoll::Running)
                }
                None => {
                    // Gone from the queue with no rc marker yet. Either the
                    // marker write is lagging or the job vanished; give it a
                    // bounded number of chances.
                    job.poll_failures += 1;
                    if job.poll_failures >= limit {
                        tracing::error!(
                            "Slurm job {} left the queue without an exit marker; declaring it lost",
                            job.job_id
                        );
                        job.resolved = Some(TaskPoll::Lost);
                        Ok(TaskPoll::Lost)
                    } else {
                        Ok(TaskPoll::Running)
                    }
                }
            },
            Err(e) => {
                job.poll_failures += 1;
                tracing::warn!(
                    "squeue failed for job {} ({} consecutive): {}",
                    job.job_id,
                    job.poll_failures,
                    e
                );
                if job.poll_failures >= limit {
                    job.resolved = Some(TaskPoll::Lost);
                    Ok(TaskPoll::Lost)
                } else {
                    Ok(TaskPoll::Running)
                }
            }
        }
    }

    fn cancel(&mut self, handle: TaskHandle) -> Result<()> {
        let job = self
            .jobs
            .get(&handle)
            .ok_or(ClusterError::UnknownHandle(handle))?;
        let status = Command::new(&self.config.scancel)
            .arg(job.job_id.to_string())
            .status()
            .map_err(|e| ClusterError::CommandFailed {
                command: self.config.scancel.display().to_string(),
                source: e,
            })?;
        if !status.success() {
            tracing::warn!("scancel for job {} exited nonzero", job.job_id);
        }
        Ok(())
    }

    fn capacity(&self) -> ClusterCapacity {
        ClusterCapacity {
            max_threads: self.config.max_node_threads,
            max_memory_mb: self.config.max_node_memory_mb,
        }
    }
}
