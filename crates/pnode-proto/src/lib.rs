//! Agent ↔ gateway wire protocol
//!
//! The protocol has no length framing of its own. Every connection the agent
//! opens starts with a single connection-type byte followed by a payload, and
//! the gateway pushes session-open notifications on the control connection as
//! a plain concatenation of 36-byte session identifiers.

pub mod codec;
pub mod messages;

pub use codec::SessionIdCodec;
pub use messages::{ConnectionType, Handshake, MessageError, SessionId, SESSION_ID_LEN};

/// Subdomain the gateway pool is published under
pub const DEFAULT_GATEWAY_SUBDOMAIN: &str = "agent-gateway";

/// DNS name whose A records list the gateway pool (e.g. `agent-gateway.pnode.site`)
pub fn gateway_hostname(gateway_subdomain: &str, domain: &str) -> String {
    format!("{}.{}", gateway_subdomain, domain)
}

/// TLS server name used to route a connection at the gateway
///
/// The gateway steers connections during the handshake, before any payload is
/// read, so the routing key has to travel in SNI:
/// `<gateway_subdomain>-<routing_key>.<domain>`.
pub fn routing_server_name(gateway_subdomain: &str, routing_key: &str, domain: &str) -> String {
    format!("{}-{}.{}", gateway_subdomain, routing_key, domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_hostname() {
        assert_eq!(
            gateway_hostname(DEFAULT_GATEWAY_SUBDOMAIN, "pnode.site"),
            "agent-gateway.pnode.site"
        );
    }

    #[test]
    fn test_routing_server_name() {
        let name = routing_server_name("agent-gateway", "0f3c9a", "pnode.site");
        assert_eq!(name, "agent-gateway-0f3c9a.pnode.site");
    }
}
