//! Job supervisor (4.9, C11): lifecycle (start/stop/restart/status) of the
//! periodic jobs (fast-claim, flywheel, balance refresh, reactive
//! reconciler), each run as an explicit process-lifetime service rather
//! than ambient state (9). Cooperative cancellation honors SIGTERM/SIGINT
//! within a 10s grace window: a job's current tick is allowed to finish,
//! but no further tick starts once cancellation is requested.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;

pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Anything the supervisor can drive on an interval. Implemented directly
/// by `FlywheelScheduler`, `ClaimsEngine`, `BalanceCache`, and
/// `ReactiveEngine` (each already exposes a same-shaped inherent `tick`/
/// `refresh_all` method; the trait just gives the supervisor one uniform
/// handle to hold).
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    async fn tick(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub name: String,
    pub state: JobState,
    pub interval: Duration,
}

struct JobEntry {
    runner: Arc<dyn PeriodicJob>,
    interval: Duration,
    handle: Option<JoinHandle<()>>,
    cancel: watch::Sender<bool>,
}

impl JobEntry {
    fn state(&self) -> JobState {
        if self.handle.is_some() {
            JobState::Running
        } else {
            JobState::Stopped
        }
    }
}

/// Owns every periodic job's task handle and cancellation signal. `start`/
/// `stop`/`restart` are the only mutators; `status` is a point-in-time
/// snapshot for the admin surface.
pub struct JobSupervisor {
    jobs: AsyncMutex<HashMap<String, JobEntry>>,
}

impl JobSupervisor {
    pub fn new() -> Self {
        Self {
            jobs: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Registers a job under `name` at `interval`, stopped. Call `start` to
    /// actually spawn its loop.
    pub async fn register(&self, name: &str, runner: Arc<dyn PeriodicJob>, interval: Duration) {
        let (cancel, _) = watch::channel(false);
        self.jobs.lock().await.insert(
            name.to_string(),
            JobEntry {
                runner,
                interval,
                handle: None,
                cancel,
            },
        );
    }

    /// Spawns the job's tick loop if it isn't already running. A no-op on
    /// an already-running job.
    pub async fn start(&self, name: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get_mut(name) else {
            return Err(crate::error::EngineError::Init(format!("unknown job: {name}")));
        };
        if entry.handle.is_some() {
            return Ok(());
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        entry.cancel = cancel_tx;
        let runner = entry.runner.clone();
        let interval = entry.interval;
        let job_name = name.to_string();

        entry.handle = Some(tokio::spawn(run_loop(job_name, runner, interval, cancel_rx)));
        info!(job = name, interval_sec = interval.as_secs(), "job started");
        Ok(())
    }

    /// Signals cancellation and waits (up to `SHUTDOWN_GRACE`) for the
    /// job's current tick to finish; a job mid-attempt is allowed to
    /// complete its attempt but not begin a retry (4.9, 5).
    pub async fn stop(&self, name: &str) -> Result<()> {
        let handle = {
            let mut jobs = self.jobs.lock().await;
            let Some(entry) = jobs.get_mut(name) else {
                return Err(crate::error::EngineError::Init(format!("unknown job: {name}")));
            };
            let _ = entry.cancel.send(true);
            entry.handle.take()
        };

        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!(job = name, "job did not stop within grace window");
            }
        }
        info!(job = name, "job stopped");
        Ok(())
    }

    /// Stops then restarts a job, optionally at a new interval (4.9).
    pub async fn restart(&self, name: &str, new_interval: Option<Duration>) -> Result<()> {
        self.stop(name).await?;
        if let Some(interval) = new_interval {
            let mut jobs = self.jobs.lock().await;
            if let Some(entry) = jobs.get_mut(name) {
                entry.interval = interval;
            }
        }
        self.start(name).await
    }

    pub async fn status(&self) -> Vec<JobStatus> {
        let jobs = self.jobs.lock().await;
        let mut statuses: Vec<JobStatus> = jobs
            .iter()
            .map(|(name, entry)| JobStatus {
                name: name.clone(),
                state: entry.state(),
                interval: entry.interval,
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Stops every registered job within the shared grace window. Called
    /// once, from the SIGTERM/SIGINT handler in `main`.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!(job = %name, error = %e, "error stopping job during shutdown");
            }
        }
    }
}

impl Default for JobSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_loop(
    name: String,
    runner: Arc<dyn PeriodicJob>,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = runner.tick().await {
                    warn!(job = %name, error = %e, "job tick failed");
                }
            }
            result = cancel.changed() => {
                if result.is_err() || *cancel.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingJob {
        ticks: Arc<AtomicU32>,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        async fn tick(&self) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_runs_ticks_until_stopped() {
        let ticks = Arc::new(AtomicU32::new(0));
        let supervisor = JobSupervisor::new();
        supervisor
            .register("test", Arc::new(CountingJob { ticks: ticks.clone() }), Duration::from_millis(10))
            .await;

        supervisor.start("test").await.unwrap();
        tokio::time::sleep(Duration::from_millis(55)).await;
        supervisor.stop("test").await.unwrap();

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least a couple ticks, got {seen}");

        let after_stop = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop, "stopped job must not keep ticking");
    }

    #[tokio::test]
    async fn status_reports_running_and_stopped() {
        let ticks = Arc::new(AtomicU32::new(0));
        let supervisor = JobSupervisor::new();
        supervisor
            .register("a", Arc::new(CountingJob { ticks: ticks.clone() }), Duration::from_secs(60))
            .await;

        assert_eq!(supervisor.status().await[0].state, JobState::Stopped);
        supervisor.start("a").await.unwrap();
        assert_eq!(supervisor.status().await[0].state, JobState::Running);
        supervisor.stop("a").await.unwrap();
        assert_eq!(supervisor.status().await[0].state, JobState::Stopped);
    }

    #[tokio::test]
    async fn restart_applies_new_interval() {
        let ticks = Arc::new(AtomicU32::new(0));
        let supervisor = JobSupervisor::new();
        supervisor
            .register("a", Arc::new(CountingJob { ticks }), Duration::from_secs(60))
            .await;
        supervisor.start("a").await.unwrap();
        supervisor.restart("a", Some(Duration::from_secs(5))).await.unwrap();

        let status = supervisor.status().await;
        assert_eq!(status[0].interval, Duration::from_secs(5));
        assert_eq!(status[0].state, JobState::Running);
        supervisor.stop("a").await.unwrap();
    }
}
