//! The enrollment handshake: one HTTP round-trip that derives a shared
//! secret via P-256 ECDH, signs the request body with HMAC under that
//! secret, and decrypts the controller's response to recover the agent's
//! bus credentials.
//!
//! Failure anywhere in this module is fatal to agent startup — there is no
//! retry loop here by design; a supervisor restarts the process.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use vortex_bus::BusCredentials;
use vortex_crypto::ecdh::{EcdhError, Keypair};
use vortex_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("decoding server public key: {0}")]
    ServerKey(#[from] EcdhError),
    #[error("signing install request: {0}")]
    Sign(CryptoError),
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("install request rejected: HTTP {status}: {body}")]
    InstallRejected { status: u16, body: String },
    #[error("decrypting bus credentials: {0}")]
    Decrypt(CryptoError),
    #[error("parsing decrypted bus credentials: {0}")]
    ParseCredentials(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
struct InstallSignaturePayload<'a> {
    id: &'a str,
    key: &'a str,
}

#[derive(Debug, Serialize)]
struct InstallRequestBody {
    id: String,
    key: String,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct InstallResponseBody {
    link: String,
}

/// The identity established by a successful enrollment: the agent id, the
/// shared secret derived via ECDH (lowercase hex, 64 ASCII chars — both the
/// HMAC signing key and the AES key-material source throughout the
/// handshake), and the bus endpoint the delivered credentials point at.
///
/// Immutable and created exactly once; there is nothing to update in place.
pub struct AgentIdentity {
    pub agent_id: String,
    pub shared_secret_hex: String,
    pub bus_endpoint: String,
}

/// Perform the enrollment handshake against `server` and return the
/// established identity plus the decrypted bus credentials.
///
/// 1. Generate an ephemeral P-256 keypair.
/// 2. Agree on a shared secret with the server's public key.
/// 3. POST `{id, key, signature}` to `<server>/api/v1/agent/install`.
/// 4. Decrypt the returned `link` ciphertext and parse it as [`BusCredentials`].
pub async fn enroll(
    http: &reqwest::Client,
    server: &str,
    agent_id: &str,
    server_key_hex: &str,
) -> Result<(AgentIdentity, BusCredentials), EnrollError> {
    let keypair = Keypair::generate();
    let shared = keypair.agree(server_key_hex)?;
    let secret_hex = shared.to_hex();

    let public_key_hex = keypair.public_hex();
    let signature = vortex_crypto::sign(
        &InstallSignaturePayload {
            id: agent_id,
            key: &public_key_hex,
        },
        &secret_hex,
    )
    .map_err(EnrollError::Sign)?;

    let body = InstallRequestBody {
        id: agent_id.to_string(),
        key: public_key_hex,
        signature,
    };

    let url = format!("{}/api/v1/agent/install", server.trim_end_matches('/'));
    debug!(url = %url, id = agent_id, "posting enrollment request");
    let response = http.post(&url).json(&body).send().await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(EnrollError::InstallRejected {
            status: status.as_u16(),
            body,
        });
    }

    let install_response: InstallResponseBody = response.json().await?;

    // The AES key/IV source is the ASCII bytes of the hex string, not the
    // raw 32-byte shared secret.
    let plaintext = vortex_crypto::decrypt(&install_response.link, secret_hex.as_bytes())
        .map_err(EnrollError::Decrypt)?;
    let credentials: BusCredentials = serde_json::from_slice(&plaintext)?;

    let identity = AgentIdentity {
        agent_id: agent_id.to_string(),
        shared_secret_hex: secret_hex,
        bus_endpoint: credentials.address.clone(),
    };

    Ok((identity, credentials))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_server_key_hex_fails_before_any_network_call() {
        // `enroll` resolves the ECDH agreement before touching the network;
        // this exercises that ordering without needing a live server.
        let keypair = Keypair::generate();
        let err = keypair.agree("not-hex").unwrap_err();
        assert!(matches!(err, EcdhError::HexDecode(_)));
    }

    #[tokio::test]
    async fn enroll_surfaces_connection_errors_as_http() {
        let http = reqwest::Client::new();
        // Port 0 never accepts connections; this exercises the transport
        // error path end-to-end without a mock server.
        let server_keypair = Keypair::generate();
        let err = enroll(
            &http,
            "http://127.0.0.1:0",
            "a1",
            &server_keypair.public_hex(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EnrollError::Http(_)));
    }
}
