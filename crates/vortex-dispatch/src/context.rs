//! Everything a task handler needs, threaded through explicitly rather than
//! reached for via a global — there is exactly one [`DispatchContext`] per
//! running agent, owned by the lifecycle that constructs it.

use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use vortex_bus::Bus;
use vortex_forward::ForwardManager;
use vortex_scheduler::Scheduler;
use vortex_shell::ShellRunner;
use vortex_telemetry::TelemetrySampler;

/// Lets the `config_change` handler apply an `AGENT_LOG_LEVEL` update without
/// restarting the process — implemented by the lifecycle crate wrapping a
/// `tracing_subscriber::reload::Handle`.
pub trait LogReload: Send + Sync {
    fn set_level(&self, level: &str) -> anyhow::Result<()>;
}

/// Shared, per-agent state each task handler is given a reference to.
///
/// `scheduler` is bound after construction via [`DispatchContext::set_scheduler`]
/// rather than taken in `new`: the scheduler's own job bodies close over an
/// `Arc<DispatchContext>`, so the context must exist before the scheduler
/// that will be stored inside it is started.
///
/// `telemetry` is behind a `Mutex` because sampling needs `&mut` access;
/// everything else here is either already internally synchronized or
/// read-only.
pub struct DispatchContext {
    pub bus: Arc<dyn Bus>,
    pub agent_id: String,
    pub shell: ShellRunner,
    pub forward: ForwardManager,
    pub telemetry: Mutex<TelemetrySampler>,
    scheduler: OnceCell<Arc<Scheduler>>,
    pub log_reload: Arc<dyn LogReload>,
}

impl DispatchContext {
    pub fn new(
        bus: Arc<dyn Bus>,
        agent_id: impl Into<String>,
        shell: ShellRunner,
        forward: ForwardManager,
        telemetry: TelemetrySampler,
        log_reload: Arc<dyn LogReload>,
    ) -> Self {
        Self {
            bus,
            agent_id: agent_id.into(),
            shell,
            forward,
            telemetry: Mutex::new(telemetry),
            scheduler: OnceCell::new(),
            log_reload,
        }
    }

    /// Bind the running scheduler. Must be called exactly once, before any
    /// task is dispatched.
    pub fn set_scheduler(&self, scheduler: Arc<Scheduler>) {
        self.scheduler
            .set(scheduler)
            .unwrap_or_else(|_| panic!("scheduler already bound"));
    }

    /// # Panics
    /// If called before [`DispatchContext::set_scheduler`].
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.scheduler.get().expect("scheduler not yet bound")
    }
}
