pub mod gateway;
pub mod http;
pub mod registry;

use tracing::debug;

use waypoint_core::config::GatewayConfig;

pub use gateway::AgentGateway;
pub use http::HttpAgent;
pub use registry::AgentRegistry;

/// Build a registry with an HTTP agent for every configured role.
pub fn registry_from_config(config: &GatewayConfig) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for (role, endpoint) in &config.agents {
        debug!(role = %role, endpoint = %endpoint.endpoint, "Registering HTTP agent");
        registry.register(HttpAgent::new(role, &endpoint.endpoint, endpoint.api_key.clone()));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_from_config_registers_each_role() {
        let config: waypoint_core::AppConfig = toml::from_str(
            r#"
[gateway.agents.knowledge]
endpoint = "http://127.0.0.1:9002/invoke"

[gateway.agents.essay-guidance]
endpoint = "http://127.0.0.1:9001/invoke"
"#,
        )
        .unwrap();
        let registry = registry_from_config(&config.gateway);
        assert_eq!(registry.roles(), vec!["essay-guidance", "knowledge"]);
    }
}
