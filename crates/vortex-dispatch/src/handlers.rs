//! One function per task type, each taking the decoded body plus the shared
//! [`DispatchContext`] and returning the string that gets reported back as
//! the task result — `Ok(None)` when a type has nothing to report.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::Engine;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

use vortex_bus::hget_with_global_fallback;
use vortex_forward::{encode_result, Method, PortRange};
use vortex_shell::ShellRequest;

use crate::context::DispatchContext;
use crate::envelope::{ConfigChangeBody, PingBody, ShellBody};

/// `hello`: liveness probe, reports the literal body `"hello"`.
pub async fn hello(_ctx: &DispatchContext) -> anyhow::Result<Option<String>> {
    Ok(Some("hello".to_string()))
}

/// `config_change`: applies one `(key, value)` bus setting immediately.
/// Keys ending in `_CRON` reload the matching scheduler job; `AGENT_LOG_LEVEL`
/// swaps the tracing filter in place; `AGENT_GOST_CONFIG` rewrites and
/// restarts the GOST backend. Anything else is logged and dropped — the
/// agent does not know every key the controller might ever send.
pub async fn config_change(
    ctx: &DispatchContext,
    body: ConfigChangeBody,
) -> anyhow::Result<Option<String>> {
    match body.key.as_str() {
        key if key.ends_with("_CRON") => {
            ctx.scheduler().reload(key).await?;
        }
        "AGENT_LOG_LEVEL" => {
            ctx.log_reload.set_level(&body.value)?;
        }
        "AGENT_GOST_CONFIG" => {
            ctx.forward
                .write_and_restart_gost(body.value.as_bytes())
                .await?;
        }
        other => {
            warn!(key = other, "config_change: unrecognized key, ignoring");
        }
    }
    Ok(None)
}

/// `forward`: add/delete a forward rule against one of the three backends.
/// The port range the selector draws from is itself a bus setting,
/// `AGENT_PORT_RANGE`, falling back to [`PortRange::default`] when unset.
pub async fn forward(
    ctx: &DispatchContext,
    rule: vortex_forward::ForwardRule,
) -> anyhow::Result<Option<String>> {
    let range = hget_with_global_fallback(ctx.bus.as_ref(), &ctx.agent_id, "AGENT_PORT_RANGE")
        .await?
        .and_then(|v| PortRange::parse(&v))
        .unwrap_or_default();

    let result = ctx.forward.handle(rule, range).await?;
    Ok(Some(encode_result(&result)?))
}

/// `shell`: split the command by whitespace into head + args and run it,
/// internal or external per the `internal` flag. Always reports success —
/// a non-zero exit or missing script just yields empty captured stdout,
/// per spec (stderr loss on this task type is an accepted simplification).
pub async fn shell(ctx: &DispatchContext, body: ShellBody) -> anyhow::Result<Option<String>> {
    let mut parts = body.shell.split_whitespace();
    let command = parts.next().unwrap_or_default().to_string();
    let args: Vec<String> = parts.map(str::to_string).collect();

    let req = if body.internal {
        ShellRequest::internal(command, args)
    } else {
        ShellRequest::external(command, args)
    };

    let output = match ctx.shell.run(req).await {
        Ok(stdout) => stdout,
        Err(e) => {
            warn!(error = %e, "shell: command failed, reporting empty stdout");
            Vec::new()
        }
    };
    Ok(Some(base64::engine::general_purpose::STANDARD.encode(output)))
}

/// `report_stat`: sample host/cpu/memory/network telemetry right now and
/// publish it to `agent_status:<id>`, outside of the scheduler's regular
/// cadence. A sampling failure is logged, not surfaced as a task failure —
/// the task's job is to have asked for a sample, not to have received one.
pub async fn report_stat(ctx: &DispatchContext) -> anyhow::Result<Option<String>> {
    let mut sampler = ctx.telemetry.lock().await;
    if let Err(e) = sampler.sample_and_publish(ctx.bus.as_ref(), &ctx.agent_id).await {
        warn!(error = %e, "report_stat: telemetry sample failed");
    }
    Ok(Some("check the status report in the logs".to_string()))
}

#[derive(Debug, Serialize)]
struct TrafficDocument {
    time: u128,
    traffic: String,
}

/// `report_traffic`: runs the IPTABLES traffic-monitor listing script and
/// publishes `{time, traffic}` — traffic being the base64-encoded output —
/// to `agent_traffic:<id>`.
pub async fn report_traffic(ctx: &DispatchContext) -> anyhow::Result<Option<String>> {
    let req = ShellRequest::internal("iptables.sh", vec!["list_all".to_string()]);
    match ctx.shell.run(req).await {
        Ok(output) => {
            let traffic = base64::engine::general_purpose::STANDARD.encode(output);
            let time = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            let doc = TrafficDocument { time, traffic };
            let key = format!("agent_traffic:{}", ctx.agent_id);
            match serde_json::to_string(&doc) {
                Ok(payload) => {
                    if let Err(e) = ctx.bus.lpush(&key, &payload).await {
                        warn!(error = %e, "report_traffic: publishing to bus failed");
                    }
                }
                Err(e) => warn!(error = %e, "report_traffic: serializing traffic document failed"),
            }
        }
        Err(e) => warn!(error = %e, "report_traffic: listing traffic monitors failed"),
    }
    Ok(Some("check the traffic report in the logs".to_string()))
}

fn rtt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"= ([\d.]+)/([\d.]+)/([\d.]+)/[\d.]+ ms").expect("static regex is valid")
    })
}

fn loss_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+) packets transmitted, (\d+) (?:packets )?received, ([\d.]+)% packet loss")
            .expect("static regex is valid")
    })
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IcmpStats {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packet_loss_percent: f64,
    pub rtt_min_ms: f64,
    pub rtt_avg_ms: f64,
    pub rtt_max_ms: f64,
}

/// Result of probing `agent_port` via `ss -tunlp`, only populated when a
/// forward method that owns a local listening port named itself in the
/// task body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub is_active: bool,
    pub details: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReport {
    pub icmp: IcmpStats,
    pub tcp_rtts_ms: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_status: Option<ServiceStatus>,
}

/// `ping`: ICMP reachability (shelled `ping`, parsed from its own text
/// output — spec treats `ping` as an external tool, not a protocol this
/// agent implements over raw sockets), `count` independent TCP connect-RTT
/// samples against `host:port` (port defaults to 80 when `host` names
/// none), and, for GOST/REALM-forwarded targets, a liveness probe of the
/// locally bound `agent_port`.
pub async fn ping(ctx: &DispatchContext, body: PingBody) -> anyhow::Result<Option<String>> {
    let count = body.count.max(1);
    let timeout_s = body.timeout_s;
    let (host, port) = body.host_and_port();

    let icmp = run_icmp_ping(ctx, host, count, timeout_s).await;

    let mut tcp_rtts_ms = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if let Some(rtt) = tcp_rtt_ms(host, port, timeout_s).await {
            tcp_rtts_ms.push(rtt);
        }
    }

    let service_status = if body.agent_port != 0
        && matches!(body.forward_method, Some(Method::GOST) | Some(Method::REALM))
    {
        Some(probe_service_status(ctx, body.agent_port, body.forward_method.unwrap()).await)
    } else {
        None
    };

    let report = PingReport {
        icmp,
        tcp_rtts_ms,
        service_status,
    };

    let json = serde_json::to_vec(&report)?;
    Ok(Some(base64::engine::general_purpose::STANDARD.encode(json)))
}

async fn run_icmp_ping(ctx: &DispatchContext, host: &str, count: u32, timeout_s: u64) -> IcmpStats {
    let mut args = vec!["-c".to_string(), count.to_string()];
    if timeout_s > 0 {
        args.push("-W".to_string());
        args.push(timeout_s.to_string());
    }
    args.push(host.to_string());

    let mut stats = IcmpStats::default();
    match ctx.shell.run(ShellRequest::external("ping", args)).await {
        Ok(stdout) => {
            let text = String::from_utf8_lossy(&stdout);
            if let Some(caps) = loss_re().captures(&text) {
                stats.packets_sent = caps[1].parse().unwrap_or_default();
                stats.packets_received = caps[2].parse().unwrap_or_default();
                stats.packet_loss_percent = caps[3].parse().unwrap_or_default();
            }
            if let Some(caps) = rtt_re().captures(&text) {
                stats.rtt_min_ms = caps[1].parse().unwrap_or_default();
                stats.rtt_avg_ms = caps[2].parse().unwrap_or_default();
                stats.rtt_max_ms = caps[3].parse().unwrap_or_default();
            }
        }
        Err(e) => {
            warn!(error = %e, host, "ping command failed, reporting full packet loss");
            stats.packets_sent = count;
            stats.packet_loss_percent = 100.0;
        }
    }
    stats
}

/// One TCP connect to `host:port`, timing out after `timeout_s` seconds (0
/// means no explicit timeout beyond the OS default). Returns `None` on any
/// connect failure — dropped from the RTT list, not a task failure.
async fn tcp_rtt_ms(host: &str, port: u16, timeout_s: u64) -> Option<f64> {
    let addr = format!("{host}:{port}");
    let started = Instant::now();
    let connect = tokio::net::TcpStream::connect(&addr);
    let result = if timeout_s > 0 {
        tokio::time::timeout(Duration::from_secs(timeout_s), connect)
            .await
            .ok()
    } else {
        Some(connect.await)
    };
    match result {
        Some(Ok(_stream)) => Some(started.elapsed().as_secs_f64() * 1000.0),
        _ => None,
    }
}

/// `is_active` is a case-insensitive substring match of `method`'s name
/// against the raw `ss -tunlp` output for `port` — not just whether the
/// grep matched a line.
async fn probe_service_status(ctx: &DispatchContext, port: u16, method: Method) -> ServiceStatus {
    let cmd = format!("ss -tunlp | grep :{port}");
    let req = ShellRequest::external("bash", vec!["-c".to_string(), cmd]);
    let details = match ctx.shell.run(req).await {
        Ok(stdout) => String::from_utf8_lossy(&stdout).into_owned(),
        Err(_) => String::new(),
    };
    let is_active = service_is_active(&details, method);
    ServiceStatus { is_active, details }
}

fn service_is_active(details: &str, method: Method) -> bool {
    let method_name = format!("{method:?}").to_lowercase();
    details.to_lowercase().contains(&method_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use vortex_bus::mock::MockBus;
    use vortex_forward::ForwardManager;
    use vortex_shell::ShellRunner;
    use vortex_telemetry::TelemetrySampler;

    struct NoopLogReload;
    impl crate::context::LogReload for NoopLogReload {
        fn set_level(&self, _level: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_ctx(bus: Arc<MockBus>, shell: ShellRunner) -> DispatchContext {
        DispatchContext::new(
            bus,
            "a1",
            shell.clone(),
            ForwardManager::with_defaults(shell.clone()),
            TelemetrySampler::new(shell, "test"),
            Arc::new(NoopLogReload),
        )
    }

    #[tokio::test]
    async fn shell_splits_whitespace_into_command_and_args() {
        let ctx = test_ctx(Arc::new(MockBus::new()), ShellRunner::default());
        let body = ShellBody {
            shell: "echo hello-from-shell".to_string(),
            internal: false,
        };
        let extra = shell(&ctx, body).await.unwrap().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(extra)
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&decoded).trim(), "hello-from-shell");
    }

    #[tokio::test]
    async fn shell_reports_success_with_empty_stdout_on_non_zero_exit() {
        let ctx = test_ctx(Arc::new(MockBus::new()), ShellRunner::default());
        let body = ShellBody {
            shell: "false".to_string(),
            internal: false,
        };
        let extra = shell(&ctx, body).await.unwrap().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(extra)
            .unwrap();
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn shell_reports_success_when_internal_script_is_not_found() {
        let ctx = test_ctx(Arc::new(MockBus::new()), ShellRunner::default());
        let body = ShellBody {
            shell: "does-not-exist.sh arg1".to_string(),
            internal: true,
        };
        let result = shell(&ctx, body).await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn report_traffic_wraps_payload_as_time_and_traffic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("iptables.sh"),
            "#!/bin/bash\necho monitored-traffic\n",
        )
        .unwrap();
        let shell = ShellRunner::new(Some(dir.path().to_path_buf()));

        let bus = Arc::new(MockBus::new());
        let ctx = test_ctx(bus.clone(), shell);

        report_traffic(&ctx).await.unwrap();

        let pushed = bus.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, "agent_traffic:a1");
        let doc: serde_json::Value = serde_json::from_str(&pushed[0].1).unwrap();
        assert!(doc.get("time").and_then(|v| v.as_u64()).is_some());
        assert!(doc.get("traffic").and_then(|v| v.as_str()).is_some());
    }

    #[test]
    fn rtt_regex_parses_standard_ping_summary() {
        let text = "rtt min/avg/max/mdev = 10.123/12.456/15.789/1.234 ms";
        let caps = rtt_re().captures(text).unwrap();
        assert_eq!(&caps[1], "10.123");
        assert_eq!(&caps[2], "12.456");
        assert_eq!(&caps[3], "15.789");
    }

    #[test]
    fn loss_regex_parses_standard_ping_summary() {
        let text = "4 packets transmitted, 4 received, 0% packet loss, time 3005ms";
        let caps = loss_re().captures(text).unwrap();
        assert_eq!(&caps[1], "4");
        assert_eq!(&caps[2], "4");
        assert_eq!(&caps[3], "0");
    }

    #[tokio::test]
    async fn tcp_rtt_ms_none_on_connection_refused() {
        // Port 0 is never a connectable address.
        assert!(tcp_rtt_ms("127.0.0.1", 0, 1).await.is_none());
    }

    #[test]
    fn service_is_active_matches_method_name_case_insensitively() {
        assert!(service_is_active(
            "tcp LISTEN 0 128 *:8080 users:((\"gost\",pid=1,fd=6))",
            Method::GOST
        ));
        assert!(!service_is_active(
            "tcp LISTEN 0 128 *:8080 users:((\"realm\",pid=1,fd=6))",
            Method::GOST
        ));
    }
}
