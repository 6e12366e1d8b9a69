//! Session channels: one gateway connection per session notification

use crate::bridge::bridge;
use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::registry::{SessionInfo, SessionRegistry};
use crate::tls::GatewayConnector;
use chrono::{DateTime, SecondsFormat, Utc};
use pnode_proto::{Handshake, SessionId};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session-level failures. These never reach the control channel.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Gateway connection failed: {0}")]
    Remote(#[from] TunnelError),

    #[error("Local service at {address} unavailable: {source}")]
    LocalConnect {
        address: String,
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Shared state every session channel needs
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<TunnelConfig>,
    pub connector: GatewayConnector,
    pub registry: SessionRegistry,
}

/// One session channel
pub struct SessionChannel {
    ctx: SessionContext,
    host: String,
    routing_key: String,
    session_id: SessionId,
}

impl SessionChannel {
    pub fn new(
        ctx: SessionContext,
        host: impl Into<String>,
        routing_key: impl Into<String>,
        session_id: SessionId,
    ) -> Self {
        Self {
            ctx,
            host: host.into(),
            routing_key: routing_key.into(),
            session_id,
        }
    }

    /// Run on its own task; failures are logged and contained
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let session_id = self.session_id.clone();
            if let Err(e) = self.run().await {
                warn!(session_id = %session_id, error = %e, "Session failed");
            }
        })
    }

    pub async fn run(self) -> Result<(), SessionError> {
        let handle = self
            .ctx
            .registry
            .register(SessionInfo {
                session_id: self.session_id.clone(),
                host: self.host.clone(),
                test_mode: self.ctx.config.test_mode,
                established_at: Instant::now(),
            })
            .await;

        let result = self.serve().await;

        self.ctx.registry.unregister(handle).await;
        result
    }

    async fn serve(&self) -> Result<(), SessionError> {
        let config = &self.ctx.config;
        let server_name = config.server_name(&self.routing_key);

        let mut remote = self.ctx.connector.connect(&self.host, &server_name).await?;

        let open = Handshake::Session {
            session_id: self.session_id.clone(),
        };
        remote.write_all(&open.encode()).await?;
        remote.flush().await?;

        debug!(session_id = %self.session_id, host = %self.host, "Session opened");

        if config.test_mode {
            if serve_test_page(&mut remote, config, &self.host).await? {
                info!(session_id = %self.session_id, "Served test page");
            }
            return Ok(());
        }

        let address = config.local_address();
        let local = match TcpStream::connect(&address).await {
            Ok(stream) => stream,
            Err(source) => {
                let _ = remote.shutdown().await;
                return Err(SessionError::LocalConnect { address, source });
            }
        };
        let _ = local.set_nodelay(true);

        let stats = bridge(remote, local).await?;
        debug!(
            session_id = %self.session_id,
            remote_to_local = stats.remote_to_local,
            local_to_remote = stats.local_to_remote,
            "Bridge finished"
        );

        Ok(())
    }
}

/// Wait for the peer's first bytes, answer with the diagnostic page and close
///
/// Returns `false` if the peer closed before sending anything.
pub async fn serve_test_page<S>(
    stream: &mut S,
    config: &TunnelConfig,
    remote_host: &str,
) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 1024];
    if stream.read(&mut buf).await? == 0 {
        let _ = stream.shutdown().await;
        return Ok(false);
    }

    let response = test_response(config, remote_host, Utc::now());
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    let _ = stream.shutdown().await;

    Ok(true)
}

/// Complete HTTP/1.1 response describing this agent
pub fn test_response(config: &TunnelConfig, remote_host: &str, now: DateTime<Utc>) -> String {
    let html = test_page(config, remote_host, now);

    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html; charset=UTF-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        html.len(),
        html
    )
}

fn test_page(config: &TunnelConfig, remote_host: &str, now: DateTime<Utc>) -> String {
    let credentials = &config.credentials;
    let rows = [
        ("Agent ID", credentials.agent_id().unwrap_or("-")),
        ("Project ID", credentials.project_id().unwrap_or("-")),
        ("Domain", config.domain.as_str()),
        ("Remote Host", remote_host),
    ];

    let mut table = String::new();
    for (label, value) in rows {
        table.push_str(&format!(
            "<tr><th>{}</th><td>{}</td></tr>\n",
            label,
            escape_html(value)
        ));
    }
    table.push_str(&format!(
        "<tr><th>Current Time</th><td>{}</td></tr>\n",
        now.to_rfc3339_opts(SecondsFormat::Millis, true)
    ));

    format!(
        "<!DOCTYPE html>\n\
         <html lang=\"en\">\n\
         <head>\n\
         <meta charset=\"UTF-8\">\n\
         <title>Agent Test Info</title>\n\
         <style>table {{ border-collapse: collapse; }} td, th {{ border: 1px solid #000; padding: 6px; }}</style>\n\
         </head>\n\
         <body>\n\
         <h2>Agent Test Information</h2>\n\
         <table>\n{}</table>\n\
         </body>\n\
         </html>\n",
        table
    )
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
