//! Tunnel configuration

use crate::error::TunnelError;
use pnode_proto::{gateway_hostname, routing_server_name, Handshake, DEFAULT_GATEWAY_SUBDOMAIN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default delay between control reconnection attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5_000);

/// Default number of reconnection attempts after the first connection
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default bound on a single gateway liveness probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How the agent authenticates its control channel
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AgentCredentials {
    /// Project id, agent id and access token
    Full {
        project_id: String,
        agent_id: String,
        agent_access_token: String,
    },
    /// Access token only, for ephemeral/anonymous tunnels
    TokenOnly { agent_access_token: String },
}

impl AgentCredentials {
    pub fn access_token(&self) -> &str {
        match self {
            AgentCredentials::Full {
                agent_access_token, ..
            }
            | AgentCredentials::TokenOnly { agent_access_token } => agent_access_token,
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            AgentCredentials::Full { project_id, .. } => Some(project_id),
            AgentCredentials::TokenOnly { .. } => None,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            AgentCredentials::Full { agent_id, .. } => Some(agent_id),
            AgentCredentials::TokenOnly { .. } => None,
        }
    }

    /// Control-channel frame for these credentials
    pub fn handshake(&self) -> Handshake {
        match self {
            AgentCredentials::Full {
                project_id,
                agent_id,
                agent_access_token,
            } => Handshake::Control {
                project_id: project_id.clone(),
                agent_id: agent_id.clone(),
                agent_access_token: agent_access_token.clone(),
            },
            AgentCredentials::TokenOnly { agent_access_token } => Handshake::AnonymousControl {
                agent_access_token: agent_access_token.clone(),
            },
        }
    }
}

// Keep the token out of logs
impl fmt::Debug for AgentCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentCredentials::Full {
                project_id,
                agent_id,
                ..
            } => f
                .debug_struct("Full")
                .field("project_id", project_id)
                .field("agent_id", agent_id)
                .field("agent_access_token", &"<redacted>")
                .finish(),
            AgentCredentials::TokenOnly { .. } => f
                .debug_struct("TokenOnly")
                .field("agent_access_token", &"<redacted>")
                .finish(),
        }
    }
}

/// Control-channel reconnection policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Fixed delay before each reconnection attempt
    #[serde(with = "duration_millis", rename = "delay_ms")]
    pub delay: Duration,
    /// Reconnection attempts allowed after a disconnect
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// TLS options shared by control and session connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Verify the gateway certificate against the web PKI roots
    pub verify_server_certificate: bool,
    /// Additional DER-encoded trust anchors (private gateway CAs)
    #[serde(skip)]
    pub extra_root_certificates: Vec<Vec<u8>>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify_server_certificate: true,
            extra_root_certificates: Vec::new(),
        }
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub domain: String,
    pub gateway_subdomain: String,
    pub gateway_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub credentials: AgentCredentials,
    pub tls: TlsOptions,
    pub test_mode: bool,
    pub reconnect: ReconnectPolicy,
    #[serde(with = "duration_millis", rename = "probe_timeout_ms")]
    pub probe_timeout: Duration,
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// DNS name listing the gateway pool
    pub fn gateway_hostname(&self) -> String {
        gateway_hostname(&self.gateway_subdomain, &self.domain)
    }

    /// SNI for a connection routed by `routing_key`
    pub fn server_name(&self, routing_key: &str) -> String {
        routing_server_name(&self.gateway_subdomain, routing_key, &self.domain)
    }

    /// `host:port` of the tunneled local service
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// Builder for TunnelConfig
pub struct TunnelConfigBuilder {
    domain: Option<String>,
    gateway_subdomain: String,
    gateway_port: Option<u16>,
    local_host: String,
    local_port: Option<u16>,
    project_id: Option<String>,
    agent_id: Option<String>,
    agent_access_token: Option<String>,
    tls: TlsOptions,
    test_mode: bool,
    reconnect: ReconnectPolicy,
    probe_timeout: Duration,
}

impl Default for TunnelConfigBuilder {
    fn default() -> Self {
        Self {
            domain: None,
            gateway_subdomain: DEFAULT_GATEWAY_SUBDOMAIN.to_string(),
            gateway_port: None,
            local_host: "localhost".to_string(),
            local_port: None,
            project_id: None,
            agent_id: None,
            agent_access_token: None,
            tls: TlsOptions::default(),
            test_mode: false,
            reconnect: ReconnectPolicy::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl TunnelConfigBuilder {
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn gateway_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.gateway_subdomain = subdomain.into();
        self
    }

    pub fn gateway_port(mut self, port: u16) -> Self {
        self.gateway_port = Some(port);
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn project_id(mut self, id: impl Into<String>) -> Self {
        self.project_id = Some(id.into());
        self
    }

    pub fn agent_id(mut self, id: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    pub fn agent_access_token(mut self, token: impl Into<String>) -> Self {
        self.agent_access_token = Some(token.into());
        self
    }

    /// Use already-assembled credentials
    pub fn credentials(mut self, credentials: AgentCredentials) -> Self {
        self.project_id = credentials.project_id().map(str::to_string);
        self.agent_id = credentials.agent_id().map(str::to_string);
        self.agent_access_token = Some(credentials.access_token().to_string());
        self
    }

    pub fn verify_server_certificate(mut self, verify: bool) -> Self {
        self.tls.verify_server_certificate = verify;
        self
    }

    /// Trust an additional DER-encoded root certificate
    pub fn add_root_certificate(mut self, der: Vec<u8>) -> Self {
        self.tls.extra_root_certificates.push(der);
        self
    }

    pub fn test_mode(mut self, enabled: bool) -> Self {
        self.test_mode = enabled;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TunnelConfig, TunnelError> {
        let domain = self
            .domain
            .filter(|d| !d.is_empty())
            .ok_or_else(|| TunnelError::Config("domain is required".to_string()))?;

        let gateway_port = self
            .gateway_port
            .filter(|p| *p != 0)
            .ok_or_else(|| TunnelError::Config("gateway_port is required".to_string()))?;

        let local_port = self
            .local_port
            .filter(|p| *p != 0)
            .ok_or_else(|| TunnelError::Config("local_port is required".to_string()))?;

        if self.gateway_subdomain.is_empty() {
            return Err(TunnelError::Config(
                "gateway_subdomain cannot be empty".to_string(),
            ));
        }

        let agent_access_token = self
            .agent_access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TunnelError::Config("agent_access_token is required".to_string()))?;

        let credentials = match (self.project_id, self.agent_id) {
            (Some(project_id), Some(agent_id)) => AgentCredentials::Full {
                project_id,
                agent_id,
                agent_access_token,
            },
            (None, None) => AgentCredentials::TokenOnly { agent_access_token },
            _ => {
                return Err(TunnelError::Config(
                    "project_id and agent_id must be provided together".to_string(),
                ))
            }
        };

        Ok(TunnelConfig {
            domain,
            gateway_subdomain: self.gateway_subdomain,
            gateway_port,
            local_host: self.local_host,
            local_port,
            credentials,
            tls: self.tls,
            test_mode: self.test_mode,
            reconnect: self.reconnect,
            probe_timeout: self.probe_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TunnelConfigBuilder {
        TunnelConfig::builder()
            .domain("pnode.site")
            .gateway_port(50000)
            .local_port(3000)
    }

    #[test]
    fn test_config_builder_full_auth() {
        let config = base()
            .project_id("project")
            .agent_id("agent")
            .agent_access_token("token")
            .build()
            .unwrap();

        assert_eq!(config.credentials.project_id(), Some("project"));
        assert_eq!(config.credentials.agent_id(), Some("agent"));
        assert_eq!(config.credentials.access_token(), "token");
        assert_eq!(config.gateway_hostname(), "agent-gateway.pnode.site");
        assert_eq!(config.local_address(), "localhost:3000");
        assert!(config.tls.verify_server_certificate);
    }

    #[test]
    fn test_config_builder_token_only() {
        let config = base().agent_access_token("token").build().unwrap();

        assert_eq!(
            config.credentials,
            AgentCredentials::TokenOnly {
                agent_access_token: "token".to_string()
            }
        );
        assert_eq!(config.credentials.handshake().encode().as_ref(), b"3token");
    }

    #[test]
    fn test_config_builder_missing_token() {
        let result = base().project_id("p").agent_id("a").build();
        assert!(matches!(result, Err(TunnelError::Config(_))));

        let result = base().agent_access_token("").build();
        assert!(matches!(result, Err(TunnelError::Config(_))));
    }

    #[test]
    fn test_config_builder_partial_identity() {
        let result = base().project_id("p").agent_access_token("t").build();
        assert!(matches!(result, Err(TunnelError::Config(_))));

        let result = base().agent_id("a").agent_access_token("t").build();
        assert!(matches!(result, Err(TunnelError::Config(_))));
    }

    #[test]
    fn test_config_builder_missing_ports() {
        let result = TunnelConfig::builder()
            .domain("pnode.site")
            .local_port(3000)
            .agent_access_token("t")
            .build();
        assert!(result.is_err());

        let result = TunnelConfig::builder()
            .domain("pnode.site")
            .gateway_port(50000)
            .agent_access_token("t")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_server_name_uses_routing_key() {
        let config = base().agent_access_token("t").build().unwrap();
        assert_eq!(
            config.server_name("abc123"),
            "agent-gateway-abc123.pnode.site"
        );
    }

    #[test]
    fn test_credentials_debug_redacts_token() {
        let credentials = AgentCredentials::TokenOnly {
            agent_access_token: "super-secret".to_string(),
        };
        let rendered = format!("{:?}", credentials);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_config_durations_in_millis() {
        let config = base()
            .agent_access_token("t")
            .reconnect(ReconnectPolicy {
                delay: Duration::from_millis(250),
                max_retries: 7,
            })
            .build()
            .unwrap();

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["reconnect"]["delay_ms"], 250);
        assert_eq!(json["reconnect"]["max_retries"], 7);
        assert_eq!(json["probe_timeout_ms"], 2000);
        assert_eq!(json["credentials"]["mode"], "token_only");
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
domain: pnode.site
gateway_subdomain: agent-gateway
gateway_port: 50000
local_host: 127.0.0.1
local_port: 8080
credentials:
  mode: full
  project_id: p
  agent_id: a
  agent_access_token: t
tls:
  verify_server_certificate: false
test_mode: true
reconnect:
  delay_ms: 1500
  max_retries: 5
probe_timeout_ms: 750
"#;
        let config: TunnelConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.local_address(), "127.0.0.1:8080");
        assert_eq!(config.credentials.project_id(), Some("p"));
        assert!(!config.tls.verify_server_certificate);
        assert!(config.tls.extra_root_certificates.is_empty());
        assert_eq!(config.reconnect.delay, Duration::from_millis(1500));
        assert_eq!(config.probe_timeout, Duration::from_millis(750));
    }
}
