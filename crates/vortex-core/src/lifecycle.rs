//! Assembles every subsystem into one running agent: bus client,
//! dispatcher, scheduler, dual-sink logging, and the task subscription loop.
//!
//! This is the single entry point an agent binary calls after enrollment;
//! everything downstream is reached through the returned [`Agent`] handle,
//! not a global.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use vortex_bus::{Bus, BusCredentials, RedisBus};
use vortex_config::AgentStartConfig;
use vortex_dispatch::{DispatchContext, Dispatcher, LogReload};
use vortex_enroll::AgentIdentity;
use vortex_forward::ForwardManager;
use vortex_scheduler::{JobFn, Scheduler};
use vortex_shell::ShellRunner;
use vortex_telemetry::TelemetrySampler;

use crate::logging;

/// Bounds how many task handlers may run concurrently; sized well above
/// the expected steady-state task rate so it backpressures only on a burst.
const MAX_CONCURRENT_TASKS: usize = 32;

/// A fully started agent. Dropping this without calling [`Agent::shutdown`]
/// leaves the background tasks running detached — `shutdown` is the
/// intended teardown path for a clean exit.
pub struct Agent {
    pub agent_id: String,
    scheduler: Arc<Scheduler>,
    subscription: JoinHandle<()>,
    remote_forwarder: Option<JoinHandle<()>>,
}

impl Agent {
    /// Stop the task subscription loop, then the scheduler's cron tasks,
    /// then the remote log forwarder.
    pub async fn shutdown(self) {
        self.subscription.abort();
        self.scheduler.stop().await;
        if let Some(handle) = self.remote_forwarder {
            handle.abort();
        }
        info!(agent_id = %self.agent_id, "agent shut down");
    }
}

/// Start the agent: connect to the bus, install logging, start the cron job
/// table, and begin consuming `agent_task_<id>`. Returns once the
/// subscription loop is running in the background.
pub async fn run(
    identity: AgentIdentity,
    creds: BusCredentials,
    start_config: &AgentStartConfig,
) -> anyhow::Result<Agent> {
    let bus: Arc<dyn Bus> = Arc::new(RedisBus::from_credentials(&creds)?);

    let logging = logging::init(
        start_config.log_dest,
        start_config.log_level,
        bus.clone(),
        &identity.agent_id,
    );

    let shell = ShellRunner::new(start_config.dir.clone());
    let forward = ForwardManager::with_defaults(shell.clone());
    let telemetry = TelemetrySampler::new(shell.clone(), env!("CARGO_PKG_VERSION"));

    let log_reload: Arc<dyn LogReload> = logging.log_reload.clone();
    let ctx = Arc::new(DispatchContext::new(
        bus.clone(),
        identity.agent_id.clone(),
        shell,
        forward,
        telemetry,
        log_reload,
    ));

    let scheduler = Scheduler::start(
        bus.clone(),
        identity.agent_id.clone(),
        vec![
            ("AGENT_REPORT_STAT_JOB", report_stat_job(ctx.clone())),
            ("AGENT_REPORT_TRAFFIC_JOB", report_traffic_job(ctx.clone())),
        ],
    )
    .await?;
    ctx.set_scheduler(scheduler.clone());

    let dispatcher = Dispatcher::new(ctx.clone(), MAX_CONCURRENT_TASKS);

    let channel = format!("agent_task_{}", identity.agent_id);
    let mut stream = bus.subscribe(&channel).await?;
    let subscription = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            dispatcher.dispatch(msg.payload);
        }
        warn!(channel = %channel, "task subscription stream ended, no supervisor-level reconnect here");
    });

    info!(agent_id = %identity.agent_id, "agent started");

    Ok(Agent {
        agent_id: identity.agent_id,
        scheduler,
        subscription,
        remote_forwarder: logging.remote_forwarder,
    })
}

fn report_stat_job(ctx: Arc<DispatchContext>) -> JobFn {
    Arc::new(move || {
        let ctx = ctx.clone();
        Box::pin(async move { vortex_dispatch::scheduled_report_stat(ctx).await })
    })
}

fn report_traffic_job(ctx: Arc<DispatchContext>) -> JobFn {
    Arc::new(move || {
        let ctx = ctx.clone();
        Box::pin(async move { vortex_dispatch::scheduled_report_traffic(ctx).await })
    })
}
