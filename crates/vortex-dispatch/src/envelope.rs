//! Task envelope decoding.
//!
//! The source decodes the same message bytes twice: once into a thin
//! envelope to find `type`, then again into a type-specific shape inside
//! each handler. Here the message is parsed into a [`serde_json::Value`]
//! exactly once; the `type` field selects which typed shape the *same*
//! value is then converted into — no second pass over the raw bytes, and
//! unknown types are an explicit [`TaskBody::Unknown`] arm rather than a
//! nil map lookup.

use serde::Deserialize;
use thiserror::Error;

use vortex_forward::ForwardRule;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope missing required field {0:?}")]
    MissingField(&'static str),
}

/// One inbound task, ephemeral: decoded, dispatched, and discarded — the
/// handler's derived typed view lives only for the duration of one
/// invocation.
#[derive(Debug)]
pub struct TaskEnvelope {
    pub id: String,
    pub body: TaskBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChangeBody {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct ShellBody {
    pub shell: String,
    #[serde(default)]
    pub internal: bool,
}

fn default_ping_count() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingBody {
    /// `HOST` or `HOST:PORT`; port defaults to 80 when absent — see
    /// [`PingBody::host_and_port`].
    pub host: String,
    #[serde(default = "default_ping_count")]
    pub count: u32,
    #[serde(default)]
    pub timeout_s: u64,
    #[serde(default)]
    pub agent_port: u16,
    #[serde(default)]
    pub forward_method: Option<vortex_forward::Method>,
}

impl PingBody {
    /// Split `host` on its last `:` into (host, port), defaulting the port
    /// to 80 when `host` carries no port of its own.
    pub fn host_and_port(&self) -> (&str, u16) {
        match self.host.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host, port),
                Err(_) => (self.host.as_str(), 80),
            },
            None => (self.host.as_str(), 80),
        }
    }
}

/// The handler-selecting body of a [`TaskEnvelope`]. Each variant carries
/// exactly the fields its handler needs, already typed.
#[derive(Debug)]
pub enum TaskBody {
    Hello,
    ConfigChange(ConfigChangeBody),
    Forward(ForwardRule),
    Shell(ShellBody),
    Ping(PingBody),
    ReportStat,
    ReportTraffic,
    /// `type` did not match any registered handler. Logged and dropped by
    /// the dispatcher without ever reaching a handler or a result report.
    Unknown(String),
}

/// Parse `raw` into a [`TaskEnvelope`], reading the wire JSON once.
pub fn decode(raw: &str) -> Result<TaskEnvelope, EnvelopeError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;

    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or(EnvelopeError::MissingField("id"))?
        .to_string();
    let task_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(EnvelopeError::MissingField("type"))?;

    let body = match task_type {
        "hello" => TaskBody::Hello,
        "config_change" => TaskBody::ConfigChange(serde_json::from_value(value)?),
        "forward" => TaskBody::Forward(serde_json::from_value(value)?),
        "shell" => TaskBody::Shell(serde_json::from_value(value)?),
        "ping" => TaskBody::Ping(serde_json::from_value(value)?),
        "report_stat" => TaskBody::ReportStat,
        "report_traffic" => TaskBody::ReportTraffic,
        other => TaskBody::Unknown(other.to_string()),
    };

    Ok(TaskEnvelope { id, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_port_splits_explicit_port() {
        let body = PingBody {
            host: "10.0.0.5:8443".to_string(),
            count: 1,
            timeout_s: 0,
            agent_port: 0,
            forward_method: None,
        };
        assert_eq!(body.host_and_port(), ("10.0.0.5", 8443));
    }

    #[test]
    fn host_and_port_defaults_to_80_without_a_port() {
        let body = PingBody {
            host: "10.0.0.5".to_string(),
            count: 1,
            timeout_s: 0,
            agent_port: 0,
            forward_method: None,
        };
        assert_eq!(body.host_and_port(), ("10.0.0.5", 80));
    }

    #[test]
    fn decodes_hello() {
        let env = decode(r#"{"id":"t1","type":"hello"}"#).unwrap();
        assert_eq!(env.id, "t1");
        assert!(matches!(env.body, TaskBody::Hello));
    }

    #[test]
    fn decodes_unknown_type_as_explicit_variant() {
        let env = decode(r#"{"id":"t3","type":"frobnicate"}"#).unwrap();
        assert!(matches!(env.body, TaskBody::Unknown(t) if t == "frobnicate"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(decode("not json"), Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn missing_type_field_is_an_error() {
        assert!(matches!(
            decode(r#"{"id":"t1"}"#),
            Err(EnvelopeError::MissingField("type"))
        ));
    }

    #[test]
    fn decodes_forward_rule() {
        let raw = r#"{"id":"t2","type":"forward","action":"add","method":"IPTABLES","forwardId":"f1","agentPort":0,"target":"10.0.0.5","targetPort":443}"#;
        let env = decode(raw).unwrap();
        match env.body {
            TaskBody::Forward(rule) => {
                assert_eq!(rule.forward_id, "f1");
                assert_eq!(rule.target_port, 443);
            }
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_forward_method_fails_to_decode() {
        let raw = r#"{"id":"t2","type":"forward","action":"add","method":"WIREGUARD","forwardId":"f1","agentPort":0,"target":"10.0.0.5","targetPort":443}"#;
        assert!(matches!(decode(raw), Err(EnvelopeError::Malformed(_))));
    }
}
