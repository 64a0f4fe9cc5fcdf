//! Queue worker loop.
//!
//! Any number of queue processes may share a run store. Each poll claims
//! staged runs while holding the run-status lock, flipping them to pending
//! before the lock is released, and starts them afterwards. A run is
//! therefore started by at most one queue.

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::SweepError;
use crate::lock::StatusLock;
use crate::run::{Run, RunStatus, RunStore};
use crate::trial::{RunningTrial, TrialOutcome, TrialRunner};

pub const QUEUE_OP: &str = "queue";

const REAP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub poll_interval: Duration,
    /// Drain staged runs once and return instead of polling forever.
    pub run_once: bool,
    /// Hold staged runs while other runs are running.
    pub wait_for_running: bool,
    /// Only start runs whose `gpus` run parameter is unset or equal to this.
    pub gpus: Option<String>,
    /// Runs this queue may have in flight at once.
    pub concurrency: usize,
    /// Run id of the queue itself, excluded from blocking runs.
    pub self_run_id: Option<String>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            name: name.into(),
            poll_interval,
            run_once: false,
            wait_for_running: false,
            gpus: None,
            concurrency: 1,
            self_run_id: None,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    waiting: BTreeSet<String>,
    logged_gpu_mismatch: BTreeSet<String>,
    logged_waiting: bool,
    started: usize,
}

pub struct Queue {
    store: RunStore,
    lock: Arc<dyn StatusLock>,
    runner: TrialRunner,
    config: QueueConfig,
    state: QueueState,
    in_flight: Vec<RunningTrial>,
}

impl Queue {
    pub fn new(
        store: RunStore,
        lock: Arc<dyn StatusLock>,
        runner: TrialRunner,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            lock,
            runner,
            config,
            state: QueueState::default(),
            in_flight: Vec::new(),
        }
    }

    /// Runs started by this queue so far.
    pub fn started(&self) -> usize {
        self.state.started
    }

    pub fn run(&mut self) -> Result<()> {
        if self.config.run_once {
            self.run_once()
        } else {
            self.poll_forever()
        }
    }

    fn poll_forever(&mut self) -> Result<()> {
        let mut logged_idle = false;
        while !self.runner.shutdown().is_exiting() {
            self.reap_finished()?;
            let runs = self.next_runs(self.startable());
            if runs.is_empty() {
                if !logged_idle {
                    info!("Waiting for staged runs");
                    logged_idle = true;
                }
            } else {
                self.start_runs(runs);
                logged_idle = false;
            }
            self.sleep_poll_interval();
        }
        Ok(())
    }

    fn run_once(&mut self) -> Result<()> {
        let t0 = Instant::now();
        loop {
            if self.runner.shutdown().is_exiting() {
                break;
            }
            if self.startable() == 0 {
                self.wait_for_one()?;
                continue;
            }
            let runs = self.next_runs(self.startable());
            if runs.is_empty() {
                if self.in_flight.is_empty() {
                    break;
                }
                self.wait_for_one()?;
                continue;
            }
            self.start_runs(runs);
        }
        self.wait_all()?;
        info!(
            "{} processed {} run(s) in {:.3} seconds",
            self.config.name,
            self.state.started,
            t0.elapsed().as_secs_f64()
        );
        Ok(())
    }

    fn startable(&self) -> usize {
        self.config.concurrency.max(1).saturating_sub(self.in_flight.len())
    }

    fn sleep_poll_interval(&self) {
        let deadline = Instant::now() + self.config.poll_interval;
        while Instant::now() < deadline && !self.runner.shutdown().is_exiting() {
            thread::sleep(REAP_INTERVAL.min(self.config.poll_interval));
        }
    }

    /// Claims up to `max` staged runs. Lock timeouts and listing errors are
    /// logged and produce an empty claim so the next poll can retry.
    pub fn next_runs(&mut self, max: usize) -> Vec<Run> {
        if max == 0 {
            return Vec::new();
        }
        let lock = Arc::clone(&self.lock);
        let claimed = match lock.acquire() {
            Ok(_guard) => self.unsafe_next_runs(max),
            Err(e) => Err(e),
        };
        claimed.unwrap_or_else(|e| {
            match e.downcast_ref::<SweepError>() {
                Some(SweepError::LockTimeout { path }) => warn!(
                    "could not acquire lock for reading staged runs\n\
                     If this error persists, try stopping all queues and deleting {}",
                    path.display()
                ),
                _ => warn!("error reading staged runs: {:#}", e),
            }
            Vec::new()
        })
    }

    /// Must be called with the status lock held.
    fn unsafe_next_runs(&mut self, max: usize) -> Result<Vec<Run>> {
        let blocking = if self.config.wait_for_running {
            self.blocking_runs()?
        } else {
            Vec::new()
        };
        let staged = self.store.runs_with_status(&[RunStatus::Staged])?;
        let staged_ids: BTreeSet<&str> = staged.iter().map(|r| r.id()).collect();
        self.state.waiting.retain(|id| staged_ids.contains(id.as_str()));
        self.state
            .logged_gpu_mismatch
            .retain(|id| staged_ids.contains(id.as_str()));

        let mut claimed = Vec::new();
        for run in staged {
            if claimed.len() >= max {
                break;
            }
            if self.can_start(&run, &blocking)? {
                claimed.push(run);
            }
        }
        for run in &claimed {
            run.set_pending()?;
        }
        Ok(claimed)
    }

    fn blocking_runs(&self) -> Result<Vec<Run>> {
        let self_id = self.config.self_run_id.as_deref();
        let mut blocking = Vec::new();
        for run in self.store.runs_with_status(&[RunStatus::Running])? {
            if Some(run.id()) == self_id || is_queue(&run)? {
                continue;
            }
            blocking.push(run);
        }
        Ok(blocking)
    }

    fn can_start(&mut self, run: &Run, blocking: &[Run]) -> Result<bool> {
        if let Some(run_gpus) = self.gpu_mismatch(run)? {
            if self.state.logged_gpu_mismatch.insert(run.id().to_string()) {
                info!(
                    "Ignoring staged run {} (GPU spec mismatch: run is {}, queue is {})",
                    run.id(),
                    run_gpus,
                    self.config.gpus.as_deref().unwrap_or_default()
                );
            }
            return Ok(false);
        }
        if !blocking.is_empty() {
            if self.state.waiting.insert(run.id().to_string()) || !self.state.logged_waiting {
                let ids: Vec<&str> = blocking.iter().map(|r| r.short_id()).collect();
                info!(
                    "Found staged run {} (waiting for runs to finish: {})",
                    run.id(),
                    ids.join(", ")
                );
                self.state.logged_waiting = true;
            }
            return Ok(false);
        }
        Ok(true)
    }

    fn gpu_mismatch(&self, run: &Run) -> Result<Option<String>> {
        let Some(queue_gpus) = self.config.gpus.as_deref() else {
            return Ok(None);
        };
        let run_gpus = match run.run_param("gpus")? {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => return Ok(None),
            Some(other) => other.to_string(),
        };
        Ok((run_gpus != queue_gpus).then_some(run_gpus))
    }

    fn start_runs(&mut self, runs: Vec<Run>) {
        for run in runs {
            info!("Starting staged run {}", run.id());
            match self.runner.start(&run) {
                Ok(trial) => {
                    self.in_flight.push(trial);
                    self.state.started += 1;
                }
                Err(e) => error!("failed to start run {}: {:#}", run.id(), e),
            }
        }
        self.state.logged_waiting = false;
    }

    fn reap_finished(&mut self) -> Result<()> {
        let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|t| t.is_finished());
        self.in_flight = running;
        for trial in done {
            log_outcome(trial)?;
        }
        Ok(())
    }

    fn wait_for_one(&mut self) -> Result<()> {
        loop {
            if self.in_flight.is_empty() || self.in_flight.iter().any(|t| t.is_finished()) {
                return self.reap_finished();
            }
            thread::sleep(REAP_INTERVAL);
        }
    }

    fn wait_all(&mut self) -> Result<()> {
        for trial in std::mem::take(&mut self.in_flight) {
            log_outcome(trial)?;
        }
        Ok(())
    }
}

fn is_queue(run: &Run) -> Result<bool> {
    Ok(run.op()?.as_deref() == Some(QUEUE_OP))
}

fn log_outcome(trial: RunningTrial) -> Result<()> {
    let id = trial.run().id().to_string();
    match trial.wait()? {
        TrialOutcome::Completed => info!("Run {} completed", id),
        TrialOutcome::Terminated | TrialOutcome::Interrupted => info!("Run {} was terminated", id),
        TrialOutcome::Error(code) => error!("Run {} exited with an error ({})", id, code),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{FileLock, MemoryLock};
    use crate::shutdown::Shutdown;
    use crate::trial::CommandLauncher;
    use serde_json::json;
    use std::fs;

    fn queue(store: &RunStore, lock: Arc<dyn StatusLock>, config: QueueConfig) -> Queue {
        let runner = TrialRunner::new(
            Arc::new(CommandLauncher),
            Shutdown::new("queue", Duration::from_secs(5)),
        );
        Queue::new(store.clone(), lock, runner, config)
    }

    fn staged_run(store: &RunStore, script: &str) -> Run {
        let run = store.init_run(None).expect("init run");
        run.write_attr("cmd", &vec!["sh", "-c", script]).expect("cmd");
        run.set_staged().expect("stage");
        run
    }

    fn config() -> QueueConfig {
        let mut config = QueueConfig::new("test-queue", Duration::from_millis(10));
        config.run_once = true;
        config
    }

    #[test]
    fn concurrent_claims_never_overlap() {
        let root = crate::test_dir("queue_claims");
        let store = RunStore::new(&root);
        let mut expected = BTreeSet::new();
        for _ in 0..24 {
            expected.insert(staged_run(&store, "true").id().to_string());
        }
        let lock: Arc<dyn StatusLock> = Arc::new(MemoryLock::new("status", Duration::from_secs(10)));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let mut q = queue(&store, Arc::clone(&lock), config());
                thread::spawn(move || {
                    let mut claimed = Vec::new();
                    loop {
                        let runs = q.next_runs(1);
                        if runs.is_empty() {
                            return claimed;
                        }
                        claimed.extend(runs.into_iter().map(|r| r.id().to_string()));
                    }
                })
            })
            .collect();

        let mut all = Vec::new();
        for worker in workers {
            all.extend(worker.join().expect("worker"));
        }
        let unique: BTreeSet<String> = all.iter().cloned().collect();
        assert_eq!(all.len(), unique.len(), "a run was claimed twice");
        assert_eq!(unique, expected);
        for run in store.runs().expect("runs") {
            assert_eq!(run.status(), RunStatus::Pending);
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn run_once_drains_staged_runs_in_order() {
        let root = crate::test_dir("queue_once");
        let store = RunStore::new(&root);
        let order = root.join("order.txt");
        let script = format!("echo $RUN_ID >> {}", order.display());
        let runs: Vec<Run> = (0..3).map(|_| staged_run(&store, &script)).collect();
        let lock: Arc<dyn StatusLock> = Arc::new(FileLock::named(&root.join("locks"), "status", Duration::from_secs(5)));

        let mut q = queue(&store, lock, config());
        q.run().expect("queue run");
        assert_eq!(q.started(), 3);
        for run in &runs {
            assert_eq!(run.status(), RunStatus::Completed);
        }
        let started: Vec<String> = fs::read_to_string(&order)
            .expect("order")
            .lines()
            .map(str::to_string)
            .collect();
        let expected: Vec<String> = runs.iter().map(|r| r.id().to_string()).collect();
        assert_eq!(started, expected);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn skips_gpu_mismatch() {
        let root = crate::test_dir("queue_gpu");
        let store = RunStore::new(&root);
        let other = staged_run(&store, "true");
        other.write_attr("run_params", &json!({"gpus": "1"})).expect("params");
        let same = staged_run(&store, "true");
        same.write_attr("run_params", &json!({"gpus": "0"})).expect("params");
        let any = staged_run(&store, "true");

        let mut cfg = config();
        cfg.gpus = Some("0".to_string());
        cfg.concurrency = 5;
        let lock: Arc<dyn StatusLock> = Arc::new(MemoryLock::new("status", Duration::from_secs(1)));
        let mut q = queue(&store, lock, cfg);
        let ids: Vec<String> = q.next_runs(5).iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec![same.id().to_string(), any.id().to_string()]);
        assert_eq!(other.status(), RunStatus::Staged);
        assert!(q.state.logged_gpu_mismatch.contains(other.id()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn waits_for_running_runs_except_queues() {
        let root = crate::test_dir("queue_blocking");
        let store = RunStore::new(&root);
        let busy = store.init_run(None).expect("busy");
        busy.write_lock(std::process::id()).expect("busy lock");
        let other_queue = store.init_run(None).expect("queue run");
        other_queue.write_attr("op", QUEUE_OP).expect("op");
        other_queue.write_lock(std::process::id()).expect("queue lock");
        let staged = staged_run(&store, "true");

        let mut cfg = config();
        cfg.wait_for_running = true;
        let lock: Arc<dyn StatusLock> = Arc::new(MemoryLock::new("status", Duration::from_secs(1)));
        let mut q = queue(&store, Arc::clone(&lock), cfg.clone());
        assert!(q.next_runs(1).is_empty());
        assert!(q.state.waiting.contains(staged.id()));
        assert_eq!(staged.status(), RunStatus::Staged);

        cfg.self_run_id = Some(busy.id().to_string());
        let mut q = queue(&store, lock, cfg);
        let claimed = q.next_runs(1);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id(), staged.id());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn lock_timeout_yields_empty_claim() {
        let root = crate::test_dir("queue_timeout");
        let store = RunStore::new(&root);
        let staged = staged_run(&store, "true");
        let lock = Arc::new(MemoryLock::new("status", Duration::from_millis(50)));
        let held = lock.acquire().expect("hold lock");
        let mut q = queue(&store, lock.clone(), config());
        assert!(q.next_runs(1).is_empty());
        drop(held);
        assert_eq!(staged.status(), RunStatus::Staged);
        assert_eq!(q.next_runs(1).len(), 1);
        let _ = fs::remove_dir_all(root);
    }
}
