//! Gateway discovery and liveness probing

use crate::config::DEFAULT_PROBE_TIMEOUT;
use crate::error::TunnelError;
use futures::future::join_all;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

/// Outcome of probing one resolved gateway address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCandidate {
    pub address: IpAddr,
    pub reachable: bool,
    pub latency: Duration,
}

impl GatewayCandidate {
    /// Host string suitable for dialing
    pub fn host(&self) -> String {
        self.address.to_string()
    }
}

/// Resolves the gateway pool name and probes every address concurrently
#[derive(Debug, Clone)]
pub struct GatewayResolver {
    port: u16,
    probe_timeout: Duration,
}

impl GatewayResolver {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// A-record lookup. IPv6 results are ignored.
    pub async fn lookup(&self, hostname: &str) -> Result<Vec<IpAddr>, TunnelError> {
        let addrs = lookup_host((hostname, self.port))
            .await
            .map_err(|e| TunnelError::Discovery {
                host: hostname.to_string(),
                reason: e.to_string(),
            })?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs.filter(SocketAddr::is_ipv4) {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }

        if ips.is_empty() {
            return Err(TunnelError::Discovery {
                host: hostname.to_string(),
                reason: "no IPv4 addresses".to_string(),
            });
        }

        debug!(hostname, addresses = ?ips, "Resolved gateway pool");
        Ok(ips)
    }

    /// Raw TCP connect bounded by the probe timeout
    pub async fn probe(&self, address: IpAddr) -> GatewayCandidate {
        let started = Instant::now();
        let result = timeout(self.probe_timeout, TcpStream::connect((address, self.port))).await;
        let latency = started.elapsed();

        let reachable = match result {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(%address, error = %e, "Gateway probe failed");
                false
            }
            Err(_) => {
                debug!(%address, timeout_ms = self.probe_timeout.as_millis() as u64, "Gateway probe timed out");
                false
            }
        };

        GatewayCandidate {
            address,
            reachable,
            latency,
        }
    }

    /// Probe all addresses concurrently; results keep input order
    pub async fn probe_all(&self, addresses: &[IpAddr]) -> Vec<GatewayCandidate> {
        join_all(addresses.iter().map(|addr| self.probe(*addr))).await
    }

    /// Reachable candidates for `hostname`, fastest first
    ///
    /// An empty list means every probe failed; lookup failures are errors.
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<GatewayCandidate>, TunnelError> {
        let addresses = self.lookup(hostname).await?;
        let total = addresses.len();

        let mut live: Vec<GatewayCandidate> = self
            .probe_all(&addresses)
            .await
            .into_iter()
            .filter(|c| c.reachable)
            .collect();
        live.sort_by_key(|c| c.latency);

        info!(
            hostname,
            reachable = live.len(),
            total,
            "Gateway discovery complete"
        );
        Ok(live)
    }
}
