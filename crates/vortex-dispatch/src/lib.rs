//! Decodes inbound tasks, runs each through its handler on a bounded pool of
//! concurrent slots, and reports the outcome back over the bus.
//!
//! The source fans every task out onto its own unbounded goroutine; this
//! reimplementation gates concurrent handler execution behind a
//! [`tokio::sync::Semaphore`] sized at construction, so a burst of forward
//! or shell tasks cannot exhaust the process's file descriptors or fork
//! budget.

mod context;
mod envelope;
mod handlers;

pub use context::{DispatchContext, LogReload};
pub use envelope::{decode, EnvelopeError, TaskBody, TaskEnvelope};
pub use handlers::PingReport;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// One task's outcome, reported back on `agent_task_result_<agent_id>`.
///
/// `extra` carries the handler's reported body on success, or the error text
/// on failure — both modeled under the same wire field rather than two
/// separate ones.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskResult {
    id: String,
    success: bool,
    extra: Option<String>,
}

/// Routes decoded tasks to their handlers with bounded concurrency.
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    /// `max_concurrent` bounds how many task handlers may run at once;
    /// additional tasks queue for a permit rather than spawning unbounded.
    pub fn new(ctx: Arc<DispatchContext>, max_concurrent: usize) -> Self {
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Decode and dispatch one raw task message. Spawns a tokio task that
    /// waits for a free permit, runs the handler, and publishes the result —
    /// `handle` itself returns as soon as the task is queued, so the
    /// subscription loop stays responsive to the next inbound message.
    pub fn dispatch(&self, raw: String) {
        let ctx = self.ctx.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let envelope = match envelope::decode(&raw) {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "dropping malformed task envelope");
                    return;
                }
            };

            let Ok(_permit) = permits.acquire_owned().await else {
                error!("dispatch semaphore closed, dropping task");
                return;
            };

            let id = envelope.id.clone();
            if matches!(envelope.body, TaskBody::Unknown(_)) {
                if let TaskBody::Unknown(task_type) = envelope.body {
                    warn!(task_type, id, "no handler registered for task type, dropping");
                }
                return;
            }

            let outcome = run_handler(&ctx, envelope.body).await;
            // A handler reporting `Ok(None)` (e.g. `config_change`) has
            // nothing to say back to the controller — no result at all,
            // as opposed to an empty one.
            let result = match outcome {
                Ok(None) => return,
                Ok(Some(extra)) => TaskResult {
                    id: id.clone(),
                    success: true,
                    extra: Some(extra),
                },
                Err(e) => {
                    warn!(error = %e, id, "task handler failed");
                    TaskResult {
                        id: id.clone(),
                        success: false,
                        extra: Some(e.to_string()),
                    }
                }
            };

            if let Err(e) = report_result(&ctx, &result).await {
                error!(error = %e, id, "failed to publish task result");
            }
        });
    }
}

async fn run_handler(
    ctx: &DispatchContext,
    body: TaskBody,
) -> anyhow::Result<Option<String>> {
    match body {
        TaskBody::Hello => handlers::hello(ctx).await,
        TaskBody::ConfigChange(body) => handlers::config_change(ctx, body).await,
        TaskBody::Forward(rule) => handlers::forward(ctx, rule).await,
        TaskBody::Shell(body) => handlers::shell(ctx, body).await,
        TaskBody::Ping(body) => handlers::ping(ctx, body).await,
        TaskBody::ReportStat => handlers::report_stat(ctx).await,
        TaskBody::ReportTraffic => handlers::report_traffic(ctx).await,
        TaskBody::Unknown(_) => unreachable!("Unknown is filtered out before run_handler"),
    }
}

/// The `AGENT_REPORT_STAT_JOB` cron body: sample and publish telemetry, the
/// same work `report_stat` does on demand. Registered with
/// [`vortex_scheduler::Scheduler::start`] by the lifecycle crate.
pub async fn scheduled_report_stat(ctx: Arc<DispatchContext>) {
    if let Err(e) = handlers::report_stat(&ctx).await {
        error!(error = %e, "scheduled report_stat failed");
    }
}

/// The `AGENT_REPORT_TRAFFIC_JOB` cron body, mirroring `scheduled_report_stat`.
pub async fn scheduled_report_traffic(ctx: Arc<DispatchContext>) {
    if let Err(e) = handlers::report_traffic(&ctx).await {
        error!(error = %e, "scheduled report_traffic failed");
    }
}

async fn report_result(ctx: &DispatchContext, result: &TaskResult) -> anyhow::Result<()> {
    let payload = serde_json::to_string(result)?;
    let channel = format!("agent_task_result_{}", ctx.agent_id);
    ctx.bus.publish(&channel, &payload).await?;
    info!(id = %result.id, success = result.success, "task result reported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    use vortex_bus::mock::MockBus;
    use vortex_forward::ForwardManager;
    use vortex_scheduler::Scheduler;
    use vortex_shell::ShellRunner;
    use vortex_telemetry::TelemetrySampler;

    struct NoopLogReload {
        calls: StdArc<AtomicUsize>,
    }

    impl LogReload for NoopLogReload {
        fn set_level(&self, _level: &str) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn test_ctx() -> (Arc<DispatchContext>, Arc<MockBus>, StdArc<AtomicUsize>) {
        let bus = Arc::new(MockBus::new());
        let calls = StdArc::new(AtomicUsize::new(0));
        let ctx = Arc::new(DispatchContext::new(
            bus.clone(),
            "a1",
            ShellRunner::default(),
            ForwardManager::with_defaults(ShellRunner::default()),
            TelemetrySampler::new(ShellRunner::default(), "test"),
            Arc::new(NoopLogReload { calls: calls.clone() }),
        ));
        let scheduler = Scheduler::start(bus.clone(), "a1", vec![]).await.unwrap();
        ctx.set_scheduler(scheduler);
        (ctx, bus, calls)
    }

    #[tokio::test]
    async fn hello_reports_success_with_literal_body() {
        let (ctx, bus, _calls) = test_ctx().await;
        let dispatcher = Dispatcher::new(ctx, 4);

        dispatcher.dispatch(r#"{"id":"t1","type":"hello"}"#.to_string());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let published = bus.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "agent_task_result_a1");
        let result: serde_json::Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(result["id"], "t1");
        assert_eq!(result["success"], true);
        assert_eq!(result["extra"], "hello");
    }

    #[tokio::test]
    async fn config_change_reports_no_result_on_success() {
        let (ctx, bus, _calls) = test_ctx().await;
        let dispatcher = Dispatcher::new(ctx, 4);

        dispatcher.dispatch(
            r#"{"id":"t9","type":"config_change","key":"AGENT_UNRECOGNIZED","value":"x"}"#
                .to_string(),
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(bus.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_envelope_is_dropped_without_publishing() {
        let (ctx, bus, _calls) = test_ctx().await;
        let dispatcher = Dispatcher::new(ctx, 4);

        dispatcher.dispatch("not json at all".to_string());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(bus.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_task_type_is_dropped_without_publishing() {
        let (ctx, bus, _calls) = test_ctx().await;
        let dispatcher = Dispatcher::new(ctx, 4);

        dispatcher.dispatch(r#"{"id":"t2","type":"frobnicate"}"#.to_string());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(bus.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn config_change_log_level_invokes_log_reload_and_reports_nothing() {
        let (ctx, bus, calls) = test_ctx().await;
        let dispatcher = Dispatcher::new(ctx, 4);

        dispatcher.dispatch(
            r#"{"id":"t3","type":"config_change","key":"AGENT_LOG_LEVEL","value":"debug"}"#
                .to_string(),
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(bus.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn config_change_unknown_cron_job_reports_failure() {
        let (ctx, bus, _calls) = test_ctx().await;
        let dispatcher = Dispatcher::new(ctx, 4);

        dispatcher.dispatch(
            r#"{"id":"t4","type":"config_change","key":"NO_SUCH_JOB_CRON","value":"* * * * * *"}"#
                .to_string(),
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let published = bus.published.lock().unwrap();
        let result: serde_json::Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(result["success"], false);
        assert!(result["extra"].as_str().unwrap().contains("NO_SUCH_JOB"));
    }

    #[tokio::test]
    async fn dispatch_is_bounded_by_max_concurrent() {
        let (ctx, bus, _calls) = test_ctx().await;
        // Only one permit: two concurrently-dispatched hello tasks still
        // both eventually complete, just serialized through the semaphore.
        let dispatcher = Dispatcher::new(ctx, 1);

        dispatcher.dispatch(r#"{"id":"t5","type":"hello"}"#.to_string());
        dispatcher.dispatch(r#"{"id":"t6","type":"hello"}"#.to_string());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(bus.published.lock().unwrap().len(), 2);
    }
}
