//! Cloud bridge connection probe: a one-off `GET /health` against an endpoint.

use crate::settings::EndpointConfig;
use serde::Serialize;
use std::time::Duration;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub success: bool,
    pub message: String,
}

#[derive(serde::Deserialize)]
struct HealthBody {
    status: String,
}

/// Check that the bridge at `endpoint` answers its health route.
pub async fn test_connection(
    client: &reqwest::Client,
    endpoint: &EndpointConfig,
    tls: bool,
) -> ProbeResult {
    let url = format!("{}/health", endpoint.http_base(tls));
    let response = match client.get(&url).timeout(PROBE_TIMEOUT).send().await {
        Ok(r) => r,
        Err(e) => {
            return ProbeResult {
                success: false,
                message: format!("Cannot connect to Cloud Bridge server: {}", e),
            };
        }
    };

    let status = response.status();
    if !status.is_success() {
        return ProbeResult {
            success: false,
            message: format!(
                "Server responded with error: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .trim_end()
            .to_owned(),
        };
    }

    let message = match response.json::<HealthBody>().await {
        Ok(body) => format!("Successful connection to Cloud Bridge server ({})", body.status),
        Err(_) => "Successfully connected to Cloud Bridge server".to_owned(),
    };
    ProbeResult {
        success: true,
        message,
    }
}
