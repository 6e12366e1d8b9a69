//! Reverse-tunnel agent client
//!
//! Dials out to a gateway over TLS, keeps an authenticated control channel
//! open, and answers every session notification with a fresh gateway
//! connection bridged to the local service.

pub mod bridge;
pub mod config;
pub mod control;
pub mod error;
pub mod reconnect;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod tls;
pub mod tunnel;

pub use bridge::{bridge, BridgeStats};
pub use config::{AgentCredentials, ReconnectPolicy, TlsOptions, TunnelConfig, TunnelConfigBuilder};
pub use control::{ControlChannel, ControlSession, ControlState};
pub use error::TunnelError;
pub use registry::{SessionInfo, SessionRegistry};
pub use resolver::{GatewayCandidate, GatewayResolver};
pub use session::{SessionChannel, SessionContext, SessionError};
pub use tls::{GatewayConnector, GatewayStream};
pub use tunnel::{Tunnel, TunnelEvent};

pub use pnode_proto::{SessionId, DEFAULT_GATEWAY_SUBDOMAIN};
