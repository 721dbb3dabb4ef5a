//! Reconciles a [`ForwardRule`] — an (action, method) pair — against one of
//! three backends: stateless kernel NAT rules (IPTABLES), and two userspace
//! proxies reconfigured via on-disk config plus service restart (GOST,
//! REALM). Includes the port selector used when a rule arrives with
//! `agent_port == 0`.
//!
//! The authoritative state always lives in the backend's own files and
//! processes — this manager holds no state across calls beyond the path
//! configuration it was constructed with.

use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use vortex_shell::{ShellError, ShellRequest, ShellRunner};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("unsupported forward method for {action:?}: {method:?}")]
    UnsupportedMethod { action: Action, method: Method },
    #[error("shell error: {0}")]
    Shell(#[from] ShellError),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("options document missing endpoints[0]")]
    MissingEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Method {
    IPTABLES,
    GOST,
    REALM,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRule {
    pub forward_id: String,
    pub action: Action,
    pub method: Method,
    #[serde(default)]
    pub agent_port: u16,
    pub target: String,
    pub target_port: u16,
    #[serde(default = "serde_json::Value::default")]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardResult {
    pub agent_port: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            lo: 1024,
            hi: 49151,
        }
    }
}

impl PortRange {
    /// Parse the `AGENT_PORT_RANGE` bus config value, `"lo-hi"`. Falls back
    /// to the default on any malformed input rather than erroring — a bad
    /// override should not block the selector.
    pub fn parse(s: &str) -> Option<Self> {
        let (lo, hi) = s.split_once('-')?;
        Some(Self {
            lo: lo.trim().parse().ok()?,
            hi: hi.trim().parse().ok()?,
        })
    }
}

pub struct ForwardManager {
    shell: ShellRunner,
    gost_config_path: PathBuf,
    realm_config_dir: PathBuf,
}

impl ForwardManager {
    pub fn new(shell: ShellRunner, gost_config_path: PathBuf, realm_config_dir: PathBuf) -> Self {
        Self {
            shell,
            gost_config_path,
            realm_config_dir,
        }
    }

    pub fn with_defaults(shell: ShellRunner) -> Self {
        Self::new(
            shell,
            PathBuf::from("/etc/gost/config.json"),
            PathBuf::from("/etc/realm/configs"),
        )
    }

    /// Dispatch `rule` to its (action, method) handler, selecting a port
    /// first when the rule requests one.
    pub async fn handle(
        &self,
        rule: ForwardRule,
        range: PortRange,
    ) -> Result<ForwardResult, ForwardError> {
        match (rule.action, rule.method) {
            (Action::Add, Method::IPTABLES) => self.add_iptables(rule, range).await,
            (Action::Delete, Method::IPTABLES) => self.delete_iptables(rule).await,
            (Action::Add, Method::GOST) => self.add_gost(rule, range).await,
            (Action::Delete, Method::GOST) => self.delete_gost(rule).await,
            (Action::Add, Method::REALM) => self.add_realm(rule, range).await,
            (Action::Delete, Method::REALM) => self.delete_realm(rule).await,
        }
    }

    // ---- port selection ------------------------------------------------

    /// If `requested == 0`, draw a port at random; if non-zero but already
    /// occupied, fall back to a random draw. No retry bound — the range is
    /// sparse enough in practice per spec.
    pub async fn select_port(&self, requested: u16, range: PortRange) -> u16 {
        if requested == 0 {
            return self.generate_unused_port(range).await;
        }
        if self.port_is_used(requested).await {
            debug!(port = requested, "requested port occupied, selecting random");
            return self.generate_unused_port(range).await;
        }
        requested
    }

    async fn generate_unused_port(&self, range: PortRange) -> u16 {
        loop {
            let candidate = Self::random_port(range);
            if !self.port_is_used(candidate).await {
                return candidate;
            }
        }
    }

    fn random_port(range: PortRange) -> u16 {
        rand::thread_rng().gen_range(range.lo..=range.hi)
    }

    /// Spawn a single shell that pipes `ss -tunlp` into `grep`, matching by
    /// substring on `:<port>` — a single shell invocation, not pipe
    /// arguments passed to the first binary's argv directly.
    async fn port_is_used(&self, port: u16) -> bool {
        let cmd = format!("ss -tunlp | grep :{port}");
        let req = ShellRequest::external("bash", vec!["-c".to_string(), cmd]);
        match self.shell.run(req).await {
            Ok(_) => true,
            Err(ShellError::NonZeroExit { .. }) => false,
            Err(e) => {
                warn!(error = %e, port, "port probe failed to run, assuming free");
                false
            }
        }
    }

    // ---- IPTABLES --------------------------------------------------------

    async fn add_iptables(
        &self,
        rule: ForwardRule,
        range: PortRange,
    ) -> Result<ForwardResult, ForwardError> {
        let agent_port = self.select_port(rule.agent_port, range).await;
        let req = ShellRequest::internal(
            "iptables.sh",
            vec![
                "forward".to_string(),
                agent_port.to_string(),
                rule.target.clone(),
                rule.target_port.to_string(),
            ],
        );
        self.shell.run(req).await?;
        self.add_traffic_monitor(agent_port, &rule.target, rule.target_port)
            .await;
        Ok(ForwardResult { agent_port })
    }

    async fn delete_iptables(&self, rule: ForwardRule) -> Result<ForwardResult, ForwardError> {
        let req = ShellRequest::internal(
            "iptables.sh",
            vec!["delete".to_string(), rule.agent_port.to_string()],
        );
        self.shell.run(req).await?;
        self.remove_traffic_monitor(rule.agent_port).await;
        Ok(ForwardResult {
            agent_port: rule.agent_port,
        })
    }

    /// IPTABLES-backed traffic monitor registration, invoked alongside
    /// forward add/delete. A failure here is logged, not propagated — the
    /// forward rule itself already succeeded.
    async fn add_traffic_monitor(&self, local_port: u16, remote_host: &str, remote_port: u16) {
        let req = ShellRequest::internal(
            "iptables.sh",
            vec![
                "monitor".to_string(),
                local_port.to_string(),
                remote_host.to_string(),
                remote_port.to_string(),
            ],
        );
        if let Err(e) = self.shell.run(req).await {
            warn!(error = %e, local_port, "adding traffic monitor failed");
        }
    }

    async fn remove_traffic_monitor(&self, local_port: u16) {
        let req = ShellRequest::internal(
            "iptables.sh",
            vec!["delete".to_string(), local_port.to_string()],
        );
        if let Err(e) = self.shell.run(req).await {
            warn!(error = %e, local_port, "removing traffic monitor failed");
        }
    }

    // ---- GOST --------------------------------------------------------

    async fn add_gost(
        &self,
        rule: ForwardRule,
        range: PortRange,
    ) -> Result<ForwardResult, ForwardError> {
        let agent_port = self.select_port(rule.agent_port, range).await;
        let placeholder = format!("{}-agentPort", rule.forward_id);
        let replacement = format!(":{agent_port}");
        let options = serde_json::to_string(&rule.options)?;
        let rewritten = options.replace(&placeholder, &replacement);

        self.write_gost_config(rewritten.as_bytes())?;
        self.restart_service("gost").await?;
        Ok(ForwardResult { agent_port })
    }

    async fn delete_gost(&self, rule: ForwardRule) -> Result<ForwardResult, ForwardError> {
        let options = serde_json::to_string(&rule.options)?;
        self.write_gost_config(options.as_bytes())?;
        self.restart_service("gost").await?;
        Ok(ForwardResult {
            agent_port: rule.agent_port,
        })
    }

    fn write_gost_config(&self, config: &[u8]) -> Result<(), ForwardError> {
        if let Some(parent) = self.gost_config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.gost_config_path, config)?;
        Ok(())
    }

    /// Write a full replacement GOST config and restart the backend. Used
    /// directly by the `config_change` handler for `AGENT_GOST_CONFIG`,
    /// outside the normal add/delete forward-rule flow.
    pub async fn write_and_restart_gost(&self, config: &[u8]) -> Result<(), ForwardError> {
        self.write_gost_config(config)?;
        self.restart_service("gost").await
    }

    // ---- REALM --------------------------------------------------------

    async fn add_realm(
        &self,
        rule: ForwardRule,
        range: PortRange,
    ) -> Result<ForwardResult, ForwardError> {
        let mut options = rule.options.clone();
        let agent_port = if rule.agent_port == 0 {
            let port = self.select_port(0, range).await;
            let endpoint = options
                .get_mut("endpoints")
                .and_then(|e| e.as_array_mut())
                .and_then(|arr| arr.get_mut(0))
                .ok_or(ForwardError::MissingEndpoint)?;
            endpoint["listen"] = serde_json::Value::String(format!("0.0.0.0:{port}"));
            port
        } else {
            self.select_port(rule.agent_port, range).await
        };

        let path = self.realm_config_path(&rule.forward_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(&options)?;
        std::fs::write(&path, body)?;
        self.restart_service("realm").await?;
        Ok(ForwardResult { agent_port })
    }

    async fn delete_realm(&self, rule: ForwardRule) -> Result<ForwardResult, ForwardError> {
        let path = self.realm_config_path(&rule.forward_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.restart_service("realm").await?;
        Ok(ForwardResult {
            agent_port: rule.agent_port,
        })
    }

    fn realm_config_path(&self, forward_id: &str) -> PathBuf {
        self.realm_config_dir.join(format!("{forward_id}.json"))
    }

    async fn restart_service(&self, name: &str) -> Result<(), ForwardError> {
        let req = ShellRequest::external("systemctl", vec!["restart".to_string(), name.to_string()]);
        self.shell.run(req).await?;
        Ok(())
    }
}

/// Encode a [`ForwardResult`] the way the dispatcher reports it on success:
/// base64 of the JSON document.
pub fn encode_result(result: &ForwardResult) -> Result<String, ForwardError> {
    use base64::Engine;
    let json = serde_json::to_vec(result)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}
