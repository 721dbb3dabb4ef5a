//! Dual-sink logging: always a local console writer, plus — when
//! `--log-dest remote` is selected — a [`tracing_subscriber::Layer`] that
//! publishes every event as a JSON line to `agent_log:<id>` on the bus.
//!
//! `AGENT_LOG_LEVEL` can change the active filter without a process
//! restart: the `EnvFilter` is wrapped in a [`tracing_subscriber::reload`]
//! handle, and [`TracingLogReload`] is the `vortex_dispatch::LogReload`
//! the `config_change` handler calls into.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

use vortex_bus::Bus;
use vortex_config::LogDest;
use vortex_dispatch::LogReload;

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// `vortex_dispatch::LogReload` implementation backed by a live `EnvFilter`
/// reload handle.
pub struct TracingLogReload {
    handle: FilterHandle,
}

impl LogReload for TracingLogReload {
    fn set_level(&self, level: &str) -> anyhow::Result<()> {
        let parsed = vortex_config::LogLevel::parse(level)?;
        let directive = format!("{:?}", parsed.as_tracing_level()).to_lowercase();
        let filter = EnvFilter::try_new(&directive)?;
        self.handle.reload(filter)?;
        Ok(())
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

/// Formats each event as one JSON line and hands it to an unbounded
/// channel; a background task drains the channel into the bus so the
/// `tracing` call site never awaits network I/O.
struct RemoteLayer {
    tx: mpsc::UnboundedSender<String>,
}

impl<S: Subscriber> Layer<S> for RemoteLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        let line = serde_json::json!({
            "level": event.metadata().level().as_str(),
            "target": event.metadata().target(),
            "message": visitor.message,
            "time": time,
        })
        .to_string();

        // Channel only fails once the forwarder task has been dropped
        // (shutdown in progress); dropping the line is correct there.
        let _ = self.tx.send(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vortex_bus::mock::MockBus;

    #[test]
    fn set_level_rejects_invalid_level() {
        let (_layer, handle) = reload::Layer::new(EnvFilter::new("info"));
        let reload = TracingLogReload { handle };
        assert!(reload.set_level("deafening").is_err());
    }

    #[tokio::test]
    async fn remote_forwarder_pushes_lines_to_agent_log_key() {
        let mock = Arc::new(MockBus::new());
        let bus: Arc<dyn Bus> = mock.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_remote_forwarder(bus, "a1".to_string(), rx);

        tx.send(r#"{"level":"INFO","message":"hi"}"#.to_string())
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        let pushed = mock.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, "agent_log:a1");
        assert!(pushed[0].1.contains("\"hi\""));
    }
}

fn spawn_remote_forwarder(
    bus: Arc<dyn Bus>,
    agent_id: String,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let key = format!("agent_log:{agent_id}");
        while let Some(line) = rx.recv().await {
            if let Err(e) = bus.lpush(&key, &line).await {
                // Can't go through `tracing` here without risking a loop
                // back into this same layer.
                eprintln!("remote log forwarder: lpush {key} failed: {e}");
            }
        }
    })
}

/// Handles returned by [`init`]; keep both alive for the process lifetime.
pub struct LoggingHandles {
    pub log_reload: Arc<TracingLogReload>,
    pub remote_forwarder: Option<JoinHandle<()>>,
}

/// Install the global `tracing` subscriber. `RUST_LOG`, if set, overrides
/// `level`; otherwise `level` seeds the initial filter.
pub fn init(
    log_dest: LogDest,
    level: vortex_config::LogLevel,
    bus: Arc<dyn Bus>,
    agent_id: &str,
) -> LoggingHandles {
    let default_directive = format!("{:?}", level.as_tracing_level()).to_lowercase();
    let initial_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let (filter_layer, handle) = reload::Layer::new(initial_filter);

    let mut remote_forwarder = None;
    let remote_layer: Option<RemoteLayer> = if matches!(log_dest, LogDest::Remote) {
        let (tx, rx) = mpsc::unbounded_channel();
        remote_forwarder = Some(spawn_remote_forwarder(bus, agent_id.to_string(), rx));
        Some(RemoteLayer { tx })
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .with(remote_layer)
        .init();

    LoggingHandles {
        log_reload: Arc::new(TracingLogReload { handle }),
        remote_forwarder,
    }
}
