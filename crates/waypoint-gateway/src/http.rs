use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use tracing::warn;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::Agent;
use waypoint_core::types::{AgentReply, AgentRequest};

/// Agent reached over HTTP. Posts the `AgentRequest` as JSON and expects an
/// `AgentReply` body back.
pub struct HttpAgent {
    role: String,
    endpoint: String,
    api_key: Option<String>,
    http: Client,
}

impl HttpAgent {
    pub fn new(role: &str, endpoint: &str, api_key: Option<String>) -> Self {
        Self {
            role: role.to_string(),
            endpoint: endpoint.to_string(),
            api_key,
            http: Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transport_error(&self, err: reqwest::Error, timeout_ms: u64) -> WaypointError {
        if err.is_timeout() {
            WaypointError::AgentTimeout {
                role: self.role.clone(),
                timeout_ms,
            }
        } else {
            WaypointError::AgentUnavailable {
                role: self.role.clone(),
                reason: err.to_string(),
            }
        }
    }
}

/// Map a non-2xx status onto the reply-level error kind.
fn status_error_kind(status: StatusCode) -> &'static str {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => "timeout",
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE => "unavailable",
        _ => "rejected",
    }
}

impl Agent for HttpAgent {
    fn role(&self) -> &str {
        &self.role
    }

    fn invoke(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentReply>> {
        Box::pin(async move {
            let timeout_ms = request.timeout_ms;
            let mut req = self
                .http
                .post(&self.endpoint)
                .timeout(Duration::from_millis(timeout_ms))
                .json(&request);

            if let Some(api_key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
                .send()
                .await
                .map_err(|e| self.transport_error(e, timeout_ms))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                warn!(role = %self.role, %status, body = %body, "Agent returned error status");
                return Ok(AgentReply::error(status_error_kind(status)));
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| self.transport_error(e, timeout_ms))?;

            match serde_json::from_slice::<AgentReply>(&bytes) {
                Ok(reply) => Ok(reply),
                Err(e) => {
                    warn!(role = %self.role, error = %e, "Undecodable agent reply");
                    Ok(AgentReply::error("malformed"))
                }
            }
        })
    }
}
