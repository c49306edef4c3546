use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use waypoint_core::config::GatewayConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::types::{AgentCall, AgentFailureKind, AgentReply, AgentResult, AgentRole};

use crate::registry::AgentRegistry;

/// Uniform call interface to external agents.
///
/// Every attempt is bounded by the call's timeout. Transient failures
/// (timeouts, refused connections, replies reporting `timeout` or
/// `unavailable`) are retried `call.retries` times with exponential backoff.
/// Anything else the agent reports is folded into a failed `AgentResult`.
pub struct AgentGateway {
    registry: Arc<AgentRegistry>,
    config: GatewayConfig,
}

/// Outcome of one attempt.
enum Attempt {
    Done(AgentResult),
    Transient(WaypointError),
}

impl AgentGateway {
    pub fn new(registry: AgentRegistry, config: GatewayConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Build a call for `role` with the configured timeout and retry count.
    pub fn call(&self, role: &AgentRole, payload: serde_json::Value) -> AgentCall {
        AgentCall::new(role.clone(), payload)
            .with_timeout(self.config.timeout_for(role.as_str()))
            .with_retries(self.config.max_retries)
    }

    /// Perform a call, retrying transient failures.
    ///
    /// Returns `AgentTimeout` or `AgentUnavailable` once retries are
    /// exhausted, and `AgentNotRegistered` for unknown roles.
    pub async fn invoke(&self, call: AgentCall) -> Result<AgentResult> {
        let agent = self
            .registry
            .get(call.role.as_str())
            .ok_or_else(|| WaypointError::AgentNotRegistered(call.role.0.clone()))?;

        let mut last_err = None;
        for attempt in 0..=call.retries {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(call.timeout, agent.invoke(call.to_request())).await {
                Err(_) => Attempt::Transient(WaypointError::AgentTimeout {
                    role: call.role.0.clone(),
                    timeout_ms: call.timeout.as_millis() as u64,
                }),
                Ok(Err(e)) if e.is_transient() => Attempt::Transient(e),
                Ok(Err(e)) => Attempt::Done(AgentResult::failure(AgentFailureKind::Rejected, e.to_string())),
                Ok(Ok(reply)) => fold_reply(&call, reply),
            };

            match outcome {
                Attempt::Done(result) => {
                    debug!(
                        role = %call.role,
                        attempt = attempt + 1,
                        success = result.is_success(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Agent call finished"
                    );
                    return Ok(result);
                }
                Attempt::Transient(e) => {
                    if attempt < call.retries {
                        let backoff = calculate_backoff(attempt, &self.config);
                        warn!(
                            role = %call.role,
                            attempt = attempt + 1,
                            retries = call.retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying agent call"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| WaypointError::AgentUnavailable {
            role: call.role.0.clone(),
            reason: "no attempt made".into(),
        }))
    }
}

fn fold_reply(call: &AgentCall, reply: AgentReply) -> Attempt {
    if reply.success {
        return match reply.result {
            Some(payload) if !payload.is_null() => Attempt::Done(AgentResult::Success { payload }),
            _ => Attempt::Done(AgentResult::failure(
                AgentFailureKind::Malformed,
                "success reply without a result",
            )),
        };
    }

    let kind = reply.error_kind.unwrap_or_else(|| "unknown".to_string());
    match kind.as_str() {
        "timeout" => Attempt::Transient(WaypointError::AgentTimeout {
            role: call.role.0.clone(),
            timeout_ms: call.timeout.as_millis() as u64,
        }),
        "unavailable" => Attempt::Transient(WaypointError::AgentUnavailable {
            role: call.role.0.clone(),
            reason: "agent reported unavailable".into(),
        }),
        "malformed" => Attempt::Done(AgentResult::failure(
            AgentFailureKind::Malformed,
            "agent reply could not be decoded",
        )),
        other => Attempt::Done(AgentResult::failure(
            AgentFailureKind::Rejected,
            format!("agent reported {}", other),
        )),
    }
}

fn calculate_backoff(attempt: u32, config: &GatewayConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_test_utils::{MockAgent, MockReply};

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            call_timeout_secs: 1,
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..GatewayConfig::default()
        }
    }

    fn gateway_with(agent: MockAgent) -> AgentGateway {
        let mut registry = AgentRegistry::new();
        registry.register(agent);
        AgentGateway::new(registry, fast_config())
    }

    #[tokio::test]
    async fn success_returns_payload() {
        let agent = MockAgent::text("knowledge", "Logs rotate weekly.");
        let gateway = gateway_with(agent.clone());
        let call = gateway.call(&"knowledge".into(), serde_json::json!({"query": "q"}));

        let result = gateway.invoke(call).await.unwrap();
        assert_eq!(result.text().as_deref(), Some("Logs rotate weekly."));
        assert_eq!(agent.call_count(), 1);
    }

    #[tokio::test]
    async fn unknown_role_is_not_registered() {
        let gateway = gateway_with(MockAgent::text("knowledge", "x"));
        let call = gateway.call(&"ghost".into(), serde_json::json!({}));
        let err = gateway.invoke(call).await.unwrap_err();
        assert!(matches!(err, WaypointError::AgentNotRegistered(r) if r == "ghost"));
    }

    #[tokio::test]
    async fn transient_failure_retried_once_then_succeeds() {
        let agent = MockAgent::text("knowledge", "recovered").with_script(vec![MockReply::Unavailable]);
        let gateway = gateway_with(agent.clone());
        let call = gateway.call(&"knowledge".into(), serde_json::json!({}));

        let result = gateway.invoke(call).await.unwrap();
        assert!(result.is_success());
        assert_eq!(agent.call_count(), 2);
    }

    #[tokio::test]
    async fn unavailable_after_retries_exhausted() {
        let agent = MockAgent::unavailable("knowledge");
        let gateway = gateway_with(agent.clone());
        let call = gateway.call(&"knowledge".into(), serde_json::json!({}));

        let err = gateway.invoke(call).await.unwrap_err();
        assert!(matches!(err, WaypointError::AgentUnavailable { .. }));
        assert_eq!(agent.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_agent_times_out() {
        let agent = MockAgent::hanging("essay-guidance");
        let gateway = gateway_with(agent.clone());
        let call = AgentCall::new("essay-guidance", serde_json::json!({}))
            .with_timeout(Duration::from_millis(50))
            .with_retries(1);

        let err = gateway.invoke(call).await.unwrap_err();
        assert!(matches!(err, WaypointError::AgentTimeout { timeout_ms: 50, .. }));
        assert_eq!(agent.call_count(), 2);
    }

    #[tokio::test]
    async fn reply_level_timeout_is_transient() {
        let agent = MockAgent::text("knowledge", "second try")
            .with_script(vec![MockReply::Error("timeout".into())]);
        let gateway = gateway_with(agent.clone());
        let call = gateway.call(&"knowledge".into(), serde_json::json!({}));

        assert!(gateway.invoke(call).await.unwrap().is_success());
        assert_eq!(agent.call_count(), 2);
    }

    #[tokio::test]
    async fn rejected_reply_is_not_retried() {
        let agent = MockAgent::new("knowledge", MockReply::Error("policy".into()));
        let gateway = gateway_with(agent.clone());
        let call = gateway.call(&"knowledge".into(), serde_json::json!({}));

        let result = gateway.invoke(call).await.unwrap();
        assert!(matches!(
            result,
            AgentResult::Failure { kind: AgentFailureKind::Rejected, .. }
        ));
        assert_eq!(agent.call_count(), 1);
    }

    #[tokio::test]
    async fn null_result_is_malformed() {
        let agent = MockAgent::new("knowledge", MockReply::Json(serde_json::Value::Null));
        let gateway = gateway_with(agent);
        let call = gateway.call(&"knowledge".into(), serde_json::json!({}));

        let result = gateway.invoke(call).await.unwrap();
        assert!(matches!(
            result,
            AgentResult::Failure { kind: AgentFailureKind::Malformed, .. }
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = GatewayConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
            ..GatewayConfig::default()
        };
        let first = calculate_backoff(0, &config).as_millis();
        assert!((80..=120).contains(&first));
        let capped = calculate_backoff(5, &config).as_millis();
        assert!((240..=360).contains(&capped));
    }
}
