//! Control channel: authenticates, receives session notifications, reconnects

use crate::error::TunnelError;
use crate::reconnect::{ReconnectError, ReconnectManager};
use crate::session::{SessionChannel, SessionContext};
use crate::tunnel::TunnelEvent;
use futures::StreamExt;
use pnode_proto::SessionIdCodec;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on the TLS close_notify exchange when dropping a connection
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Control channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Disconnected,
    Connecting,
    Authenticated,
    Reconnecting,
    Stopped,
}

/// Per-attempt connection identity
#[derive(Debug, Clone)]
pub struct ControlSession {
    /// Routing key placed in the SNI; fresh for every attempt
    pub session_key_id: String,
    pub retry_count: u32,
}

impl ControlSession {
    pub fn new(retry_count: u32) -> Self {
        Self {
            session_key_id: uuid::Uuid::new_v4().simple().to_string(),
            retry_count,
        }
    }
}

enum ConnectionOutcome {
    Closed { notifications: u64 },
    Cancelled,
}

/// Owns the single control connection and the reconnection loop
pub struct ControlChannel {
    ctx: SessionContext,
    state: Arc<watch::Sender<ControlState>>,
    events: broadcast::Sender<TunnelEvent>,
    cancel: CancellationToken,
}

impl ControlChannel {
    pub fn new(
        ctx: SessionContext,
        state: Arc<watch::Sender<ControlState>>,
        events: broadcast::Sender<TunnelEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            state,
            events,
            cancel,
        }
    }

    /// Connect to `hosts` in order, reconnecting per the configured policy
    ///
    /// Returns `Ok` after cancellation and `RetriesExhausted` once the policy
    /// gives up. Only one connection is open at any time.
    pub async fn run(self, hosts: Vec<String>) -> Result<(), TunnelError> {
        let mut reconnect = ReconnectManager::new(self.ctx.config.reconnect.clone(), hosts);

        loop {
            let host = match reconnect.current_host() {
                Some(host) => host.to_string(),
                None => {
                    return Err(TunnelError::NoReachableGateway(
                        self.ctx.config.gateway_hostname(),
                    ))
                }
            };
            let session = ControlSession::new(reconnect.retry_count());

            match self.connect_and_serve(&host, &session).await {
                Ok(ConnectionOutcome::Cancelled) => break,
                Ok(ConnectionOutcome::Closed { notifications }) => {
                    info!(host = %host, notifications, "Control connection closed");
                }
                Err(e) => {
                    warn!(host = %host, retry = session.retry_count, error = %e, "Control connection failed");
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            if reconnect.exhausted() {
                return Err(self.give_up(reconnect.max_retries()));
            }

            self.set_state(ControlState::Reconnecting);
            match reconnect.wait(&self.cancel).await {
                Ok(()) => {}
                Err(ReconnectError::Cancelled) => break,
                Err(ReconnectError::MaxAttemptsReached) => {
                    return Err(self.give_up(reconnect.max_retries()));
                }
            }
        }

        self.set_state(ControlState::Stopped);
        debug!("Control channel stopped");
        Ok(())
    }

    async fn connect_and_serve(
        &self,
        host: &str,
        session: &ControlSession,
    ) -> Result<ConnectionOutcome, TunnelError> {
        let config = &self.ctx.config;
        self.set_state(ControlState::Connecting);

        let server_name = config.server_name(&session.session_key_id);
        info!(host, retry = session.retry_count, "Connecting to gateway");

        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(ConnectionOutcome::Cancelled),
            result = self.ctx.connector.connect(host, &server_name) => result?,
        };

        let (read_half, mut write_half) = tokio::io::split(stream);

        let handshake = config.credentials.handshake();
        write_half.write_all(&handshake.encode()).await?;
        write_half.flush().await?;

        self.set_state(ControlState::Authenticated);
        info!(host, mode = ?handshake.connection_type(), "Control channel authenticated");
        let _ = self.events.send(TunnelEvent::Started {
            host: host.to_string(),
        });

        let mut notifications = FramedRead::new(read_half, SessionIdCodec::new());
        let mut count = 0u64;

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break ConnectionOutcome::Cancelled,
                frame = notifications.next() => match frame {
                    Some(Ok(session_id)) => {
                        count += 1;
                        debug!(host, session_id = %session_id, "Session requested");
                        SessionChannel::new(
                            self.ctx.clone(),
                            host,
                            session.session_key_id.clone(),
                            session_id,
                        )
                        .spawn();
                    }
                    Some(Err(e)) => {
                        warn!(host, error = %e, "Control stream read failed");
                        break ConnectionOutcome::Closed { notifications: count };
                    }
                    None => break ConnectionOutcome::Closed { notifications: count },
                }
            }
        };

        let _ = tokio::time::timeout(CLOSE_TIMEOUT, write_half.shutdown()).await;

        self.set_state(ControlState::Disconnected);
        let _ = self.events.send(TunnelEvent::Stopped {
            host: host.to_string(),
        });

        Ok(outcome)
    }

    fn give_up(&self, retries: u32) -> TunnelError {
        let err = TunnelError::RetriesExhausted { retries };
        error!(retries, "Giving up on control connection");

        let _ = self.events.send(TunnelEvent::Error(err.to_string()));
        self.set_state(ControlState::Stopped);
        err
    }

    fn set_state(&self, state: ControlState) {
        // A stop wins over any transition the loop is still making
        if self.cancel.is_cancelled() && state != ControlState::Stopped {
            return;
        }
        self.state.send_replace(state);
    }
}
