//! Cron-driven job table: resolves each job's cron expression from the
//! bus — per-agent hash, falling back to the global hash, via
//! [`vortex_bus::hget_with_global_fallback`] — and runs it on a dedicated
//! tokio task.
//!
//! Jobs run serially per definition: overlapping fires for the same job are
//! dropped rather than queued. Live reload swaps a job's cron expression in
//! place; in-flight runs of the old schedule complete undisturbed.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vortex_bus::{hget_with_global_fallback, Bus};

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
/// A job's body. Cloned cheaply (it's an `Arc`) so the same executor can be
/// re-spawned under a new schedule on live reload.
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("bus error resolving cron for job {job}: {source}")]
    Bus {
        job: String,
        #[source]
        source: vortex_bus::BusError,
    },
    #[error("no cron expression configured for job {0} (expected {0}_CRON in agent_config)")]
    MissingCron(String),
    #[error("invalid cron expression {expr:?} for job {job}: {source}")]
    InvalidCron {
        job: String,
        expr: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("unknown job {0:?}")]
    UnknownJob(String),
}

struct RunningJob {
    cron_expr: String,
    executor: JobFn,
    handle: JoinHandle<()>,
}

/// Owns the live set of scheduled jobs. Construct with [`Scheduler::start`],
/// which spawns one tokio task per job definition; tear down with
/// [`Scheduler::stop`].
pub struct Scheduler {
    bus: Arc<dyn Bus>,
    agent_id: String,
    jobs: Mutex<HashMap<String, RunningJob>>,
}

impl Scheduler {
    /// Start the scheduler: for every `(name, executor)` in `definitions`,
    /// resolve `<name>_CRON` from the bus and spawn its loop task.
    pub async fn start(
        bus: Arc<dyn Bus>,
        agent_id: impl Into<String>,
        definitions: Vec<(&str, JobFn)>,
    ) -> Result<Arc<Self>, SchedulerError> {
        let scheduler = Arc::new(Self {
            bus,
            agent_id: agent_id.into(),
            jobs: Mutex::new(HashMap::new()),
        });

        let mut jobs = scheduler.jobs.lock().await;
        for (name, executor) in definitions {
            let cron_expr = scheduler.resolve_cron(name).await?;
            let schedule = validate_cron(name, &cron_expr)?;
            let handle = spawn_job_loop(name.to_string(), schedule, executor.clone());
            jobs.insert(
                name.to_string(),
                RunningJob {
                    cron_expr,
                    executor,
                    handle,
                },
            );
        }
        drop(jobs);
        Ok(scheduler)
    }

    /// Live-reload a job's cron expression. `cron_key` is the bus config key
    /// as it arrives on a `config_change` task, e.g. `AGENT_REPORT_STAT_JOB_CRON`
    /// — the `_CRON` suffix is stripped to find the job name, the new
    /// expression is re-resolved from the bus, and the job's task is
    /// atomically replaced. The job's in-flight run, if any, is left to
    /// finish on the old task.
    pub async fn reload(&self, cron_key: &str) -> Result<(), SchedulerError> {
        let job_name = cron_key
            .strip_suffix("_CRON")
            .ok_or_else(|| SchedulerError::MissingCron(cron_key.to_string()))?;

        let new_cron = self.resolve_cron(job_name).await?;
        let schedule = validate_cron(job_name, &new_cron)?;

        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_name)
            .ok_or_else(|| SchedulerError::UnknownJob(job_name.to_string()))?;

        job.handle.abort();
        job.handle = spawn_job_loop(job_name.to_string(), schedule, job.executor.clone());
        job.cron_expr = new_cron.clone();
        info!(job = job_name, cron = %new_cron, "live-reloaded job cron");
        Ok(())
    }

    /// The cron expression currently registered for `job_name`, if any.
    pub async fn current_cron(&self, job_name: &str) -> Option<String> {
        self.jobs
            .lock()
            .await
            .get(job_name)
            .map(|j| j.cron_expr.clone())
    }

    async fn resolve_cron(&self, job_name: &str) -> Result<String, SchedulerError> {
        let field = format!("{job_name}_CRON");
        hget_with_global_fallback(self.bus.as_ref(), &self.agent_id, &field)
            .await
            .map_err(|source| SchedulerError::Bus {
                job: job_name.to_string(),
                source,
            })?
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SchedulerError::MissingCron(job_name.to_string()))
    }

    /// Abort every running job task. Errors from individual aborts are not
    /// possible (abort is infallible); this simply stops the loops.
    pub async fn stop(&self) {
        let jobs = self.jobs.lock().await;
        for (name, job) in jobs.iter() {
            job.handle.abort();
            debug!(job = name, "scheduler job stopped");
        }
    }
}

fn validate_cron(job: &str, expr: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(expr).map_err(|source| SchedulerError::InvalidCron {
        job: job.to_string(),
        expr: expr.to_string(),
        source,
    })
}

/// Loop forever: sleep until the next cron fire, then run `executor` in its
/// own task guarded by `busy` so a slow run doesn't pile up concurrent
/// invocations — the next tick that finds the guard held is simply dropped.
fn spawn_job_loop(name: String, schedule: Schedule, executor: JobFn) -> JoinHandle<()> {
    tokio::spawn(async move {
        let busy = Arc::new(Mutex::new(()));
        loop {
            let now = Utc::now();
            let Some(next) = schedule.after(&now).next() else {
                warn!(job = %name, "cron schedule yields no future fire time, stopping");
                return;
            };
            let sleep_for = (next - now).to_std().unwrap_or(std::time::Duration::from_secs(0));
            tokio::time::sleep(sleep_for).await;

            let Ok(permit) = busy.clone().try_lock_owned() else {
                debug!(job = %name, "previous run still in flight, dropping this fire");
                continue;
            };
            let exec = executor.clone();
            let job_name = name.clone();
            tokio::spawn(async move {
                let _permit = permit;
                exec().await;
                debug!(job = %job_name, "job run complete");
            });
        }
    })
}
