use crate::error::{ClusterError, Result};
use crate::task::TaskDescriptor;
use crate::{ClusterCapacity, ClusterInterface, TaskHandle, TaskOutcome, TaskPoll};
use drover_core::config::LocalConfig;
use std::collections::{HashMap, VecDeque};
use std::process::{Command, Stdio};
use std::thread;
use sysinfo::System;

fn format_mb(mb: u64) -> String {
    if mb >= 1024 {
        format!("{}G", mb / 1024)
    } else {
        format!("{}M", mb)
    }
}

struct ResourceTracker {
    total_memory_mb: u64,
    total_threads: u32,
    used_memory_mb: u64,
    used_threads: u32,
    in_flight: HashMap<TaskHandle, (u64, u32)>,
}

impl ResourceTracker {
    fn new(capacity: ClusterCapacity) -> Self {
        Self {
            total_memory_mb: capacity.max_memory_mb,
            total_threads: capacity.max_threads,
            used_memory_mb: 0,
            used_threads: 0,
            in_flight: HashMap::new(),
        }
    }

    fn can_fit(&self, handle: TaskHandle, memory_mb: u64, threads: u32) -> bool {
        if self.in_flight.is_empty() {
            if memory_mb > self.total_memory_mb || threads > self.total_threads {
                tracing::warn!(
                    "{} requests {} RAM and {} threads, exceeding pool limits ({} RAM, {} threads). Running anyway.",
                    handle,
                    format_mb(memory_mb),
                    threads,
                    format_mb(self.total_memory_mb),
                    self.total_threads
                );
            }
            return true;
        }
        self.used_memory_mb + memory_mb <= self.total_memory_mb
            && self.used_threads + threads <= self.total_threads
    }

    fn reserve(&mut self, handle: TaskHandle, memory_mb: u64, threads: u32) {
        self.used_memory_mb += memory_mb;
        self.used_threads += threads;
        self.in_flight.insert(handle, (memory_mb, threads));
    }

    fn release(&mut self, handle: TaskHandle) {
        if let Some((memory_mb, threads)) = self.in_flight.remove(&handle) {
            self.used_memory_mb = self.used_memory_mb.saturating_sub(memory_mb);
            self.used_threads = self.used_threads.saturating_sub(threads);
        }
    }
}

/// In-process realization of the cluster: a bounded set of OS threads, each
/// running one driver process to completion. Capacity defaults to the
/// host's CPU count and physical memory.
pub struct LocalPool {
    capacity: ClusterCapacity,
    tracker: ResourceTracker,
    next_handle: u64,
    queued: VecDeque<(TaskHandle, TaskDescriptor)>,
    running: HashMap<TaskHandle, thread::JoinHandle<i32>>,
    finished: HashMap<TaskHandle, TaskPoll>,
}

impl LocalPool {
    pub fn new(config: &LocalConfig) -> Self {
        let max_threads = config.max_threads.unwrap_or_else(|| num_cpus::get() as u32);
        let max_memory_mb = config.max_memory_mb.unwrap_or_else(|| {
            let sys = System::new_all();
            sys.total_memory() / (1024 * 1024)
        });
        let capacity = ClusterCapacity {
            max_threads,
            max_memory_mb,
        };
        tracing::debug!(
            "Local pool capacity: {} RAM, {} threads",
            format_mb(max_memory_mb),
            max_threads
        );
        Self {
            capacity,
            tracker: ResourceTracker::new(capacity),
            next_handle: 0,
            queued: VecDeque::new(),
            running: HashMap::new(),
            finished: HashMap::new(),
        }
    }

    /// Move queued tasks into worker threads while resources allow.
    fn pump(&mut self) {
        loop {
            let fits = match self.queued.front() {
                Some((handle, task)) => self.tracker.can_fit(*handle, task.memory_mb, task.threads),
                None => break,
            };
            if !fits {
                break;
            }
            let (handle, task) = match self.queued.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            self.tracker.reserve(handle, task.memory_mb, task.threads);
            tracing::debug!("Starting {} ({})", task.id, handle);
            let worker = thread::spawn(move || run_task(&task));
            self.running.insert(handle, worker);
        }
    }

    fn reap(&mut self) {
        let done: Vec<TaskHandle> = self
            .running
            .iter()
            .filter(|(_, worker)| worker.is_finished())
            .map(|(&handle, _)| handle)
            .collect();

        for handle in done {
            let Some(worker) = self.running.remove(&handle) else {
                continue;
            };
            self.tracker.release(handle);
            let poll = match worker.join() {
                Ok(exit_code) => TaskPoll::Done(TaskOutcome { exit_code }),
                Err(_) => {
                    tracing::error!("Worker thread for {} panicked; task is lost", handle);
                    TaskPoll::Lost
                }
            };
            self.finished.insert(handle, poll);
        }
    }
}

/// Runs one task to completion on the worker thread. A driver that cannot
/// be spawned is a task failure (exit 127), not a lost task.
fn run_task(task: &TaskDescriptor) -> i32 {
    let exit_code = match spawn_and_wait(task) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("Failed to execute driver for {}: {}", task.id, e);
            127
        }
    };
    if let Err(e) = fs_err::write(task.rc_path(), exit_code.to_string()) {
        tracing::warn!("Failed to write rc marker for {}: {}", task.id, e);
    }
    exit_code
}

fn spawn_and_wait(task: &TaskDescriptor) -> Result<i32> {
    let stdout = fs_err::File::create(task.stdout_path())?;
    let stderr = fs_err::File::create(task.stderr_path())?;

    let (program, args) = task.command();
    let status = Command::new(&program)
        .args(&args)
        .current_dir(&task.workdir)
        .stdin(Stdio::null())
        .stdout(stdout.into_parts().0)
        .stderr(stderr.into_parts().0)
        .status()
        .map_err(|e| ClusterError::CommandFailed {
            command: program.display().to_string(),
            source: e,
        })?;
    Ok(status.code().unwrap_or(-1))
}

impl ClusterInterface for LocalPool {
    fn submit(&mut self, task: &TaskDescriptor) -> Result<TaskHandle> {
        task.prepare()?;
        let handle = TaskHandle(self.next_handle);
        self.next_handle += 1;
        self.queued.push_back((handle, task.clone()));
        self.pump();
        Ok(handle)
    }

    fn poll(&mut self, handle: TaskHandle) -> Result<TaskPoll> {
        self.reap();
        self.pump();

        if let Some(poll) = self.finished.get(&handle) {
            return Ok(poll.clone());
        }
        if self.running.contains_key(&handle) {
            return Ok(TaskPoll::Running);
        }
        if self.queued.iter().any(|(h, _)| *h == handle) {
            return Ok(TaskPoll::Pending);
        }
        Err(ClusterError::UnknownHandle(handle))
    }

    fn cancel(&mut self, handle: TaskHandle) -> Result<()> {
        let before = self.queued.len();
        self.queued.retain(|(h, _)| *h != handle);
        if self.queued.len() < before {
            self.finished.insert(
                handle,
                TaskPoll::Done(TaskOutcome { exit_code: -1 }),
            );
            tracing::debug!("Cancelled queued {}", handle);
        }
        // A task already on a worker thread is left to drain.
        Ok(())
    }

    fn capacity(&self) -> ClusterCapacity {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskId, TaskKind};
    use drover_core::model::RunId;
    use drover_core::state::ComponentId;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn shell_task(dir: &Path, name: &str, script: &str, threads: u32) -> TaskDescriptor {
        let workdir = dir.join(name);
        TaskDescriptor {
            id: TaskId(format!("test/{}", name)),
            run: RunId("test".into()),
            component: ComponentId::Step { step: 0 },
            kind: TaskKind::Step,
            driver: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            inputs: vec![],
            outputs: vec![],
            threads,
            memory_mb: 16,
            workdir: workdir.clone(),
            log_dir: workdir.join("logs"),
        }
    }

    fn wait_done(pool: &mut LocalPool, handle: TaskHandle) -> TaskPoll {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match pool.poll(handle).unwrap() {
                TaskPoll::Done(outcome) => return TaskPoll::Done(outcome),
                TaskPoll::Lost => return TaskPoll::Lost,
                _ if Instant::now() > deadline => panic!("task did not finish in time"),
                _ => thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    #[test]
    fn test_successful_task_produces_output_and_rc() {
        let dir = tempfile::tempdir().unwrap();
        let task = shell_task(dir.path(), "ok", "echo hello > produced.txt", 1);
        let mut pool = LocalPool::new(&LocalConfig {
            max_threads: Some(2),
            max_memory_mb: Some(1024),
        });

        let handle = pool.submit(&task).unwrap();
        match wait_done(&mut pool, handle) {
            TaskPoll::Done(outcome) => assert_eq!(outcome.exit_code, 0),
            other => panic!("unexpected poll result: {:?}", other),
        }
        assert!(task.workdir.join("produced.txt").exists());
        assert_eq!(
            std::fs::read_to_string(task.rc_path()).unwrap().trim(),
            "0"
        );
    }

    #[test]
    fn test_failing_task_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let task = shell_task(dir.path(), "fail", "echo boom >&2; exit 3", 1);
        let mut pool = LocalPool::new(&LocalConfig {
            max_threads: Some(2),
            max_memory_mb: Some(1024),
        });

        let handle = pool.submit(&task).unwrap();
        match wait_done(&mut pool, handle) {
            TaskPoll::Done(outcome) => assert_eq!(outcome.exit_code, 3),
            other => panic!("unexpected poll result: {:?}", other),
        }
        let stderr = std::fs::read_to_string(task.stderr_path()).unwrap();
        assert!(stderr.contains("boom"));
    }

    #[test]
    fn test_missing_driver_is_failure_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = shell_task(dir.path(), "missing", "", 1);
        task.driver = "/nonexistent/driver".into();
        let mut pool = LocalPool::new(&LocalConfig {
            max_threads: Some(2),
            max_memory_mb: Some(1024),
        });

        let handle = pool.submit(&task).unwrap();
        match wait_done(&mut pool, handle) {
            TaskPoll::Done(outcome) => assert_eq!(outcome.exit_code, 127),
            other => panic!("unexpected poll result: {:?}", other),
        }
    }

    #[test]
    fn test_queueing_beyond_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let slow = shell_task(dir.path(), "slow", "sleep 0.3", 1);
        let quick = shell_task(dir.path(), "quick", "true", 1);
        let mut pool = LocalPool::new(&LocalConfig {
            max_threads: Some(1),
            max_memory_mb: Some(1024),
        });

        let first = pool.submit(&slow).unwrap();
        let second = pool.submit(&quick).unwrap();

        assert_eq!(pool.poll(second).unwrap(), TaskPoll::Pending);
        assert!(matches!(wait_done(&mut pool, first), TaskPoll::Done(_)));
        assert!(matches!(wait_done(&mut pool, second), TaskPoll::Done(_)));
    }

    #[test]
    fn test_cancel_queued_task() {
        let dir = tempfile::tempdir().unwrap();
        let slow = shell_task(dir.path(), "slow", "sleep 0.3", 1);
        let queued = shell_task(dir.path(), "queued", "true", 1);
        let mut pool = LocalPool::new(&LocalConfig {
            max_threads: Some(1),
            max_memory_mb: Some(1024),
        });

        let _first = pool.submit(&slow).unwrap();
        let second = pool.submit(&queued).unwrap();
        pool.cancel(second).unwrap();

        match pool.poll(second).unwrap() {
            TaskPoll::Done(outcome) => assert_ne!(outcome.exit_code, 0),
            other => panic!("cancelled task should look finished, got {:?}", other),
        }
        assert!(!queued.workdir.join("logs").join("task.rc").exists());
    }

    #[test]
    fn test_unknown_handle_is_an_error() {
        let mut pool = LocalPool::new(&LocalConfig::default());
        assert!(matches!(
            pool.poll(TaskHandle(99)),
            Err(ClusterError::UnknownHandle(_))
        ));
    }
}
