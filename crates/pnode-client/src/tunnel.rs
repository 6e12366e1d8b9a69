//! Tunnel orchestrator: discovery, control channel lifecycle and events

use crate::config::TunnelConfig;
use crate::control::{ControlChannel, ControlState};
use crate::error::TunnelError;
use crate::registry::{SessionInfo, SessionRegistry};
use crate::resolver::{GatewayCandidate, GatewayResolver};
use crate::session::SessionContext;
use crate::tls::GatewayConnector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Control channel authenticated with `host`
    Started { host: String },
    /// Control connection to `host` closed
    Stopped { host: String },
    /// Fatal failure; the tunnel has stopped
    Error(String),
}

enum Targets {
    Discover,
    Hosts(Vec<String>),
}

/// A reverse tunnel from a gateway to a local service
pub struct Tunnel {
    config: Arc<TunnelConfig>,
    connector: GatewayConnector,
    registry: SessionRegistry,
    events: broadcast::Sender<TunnelEvent>,
    state: Arc<watch::Sender<ControlState>>,
    active: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<Result<(), TunnelError>>>>,
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Result<Self, TunnelError> {
        let connector = GatewayConnector::new(&config.tls, config.gateway_port)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ControlState::Disconnected);

        Ok(Self {
            config: Arc::new(config),
            connector,
            registry: SessionRegistry::new(),
            events,
            state: Arc::new(state),
            active: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Start the tunnel in the background
    ///
    /// With `host` the control channel dials it directly; otherwise the
    /// gateway pool is resolved and probed first, and the reachable
    /// addresses are tried fastest first.
    pub async fn start(&self, host: Option<String>) -> Result<(), TunnelError> {
        match host {
            Some(host) => self.launch(Targets::Hosts(vec![host])).await,
            None => self.launch(Targets::Discover).await,
        }
    }

    /// Start against an already chosen, ordered list of gateway hosts
    pub async fn start_with_candidates(&self, hosts: Vec<String>) -> Result<(), TunnelError> {
        if hosts.is_empty() {
            return Err(TunnelError::Config(
                "at least one gateway host is required".to_string(),
            ));
        }
        self.launch(Targets::Hosts(hosts)).await
    }

    async fn launch(&self, targets: Targets) -> Result<(), TunnelError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TunnelError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());
        self.state.send_replace(ControlState::Disconnected);

        let ctx = SessionContext {
            config: self.config.clone(),
            connector: self.connector.clone(),
            registry: self.registry.clone(),
        };
        let channel = ControlChannel::new(ctx, self.state.clone(), self.events.clone(), cancel.clone());

        let config = self.config.clone();
        let events = self.events.clone();
        let state = self.state.clone();
        let active = self.active.clone();

        let handle = tokio::spawn(async move {
            let result = run(config, channel, targets, cancel).await;

            if let Err(e) = &result {
                // Retry exhaustion is reported by the control channel itself
                if !matches!(e, TunnelError::RetriesExhausted { .. }) {
                    error!(error = %e, "Tunnel failed");
                    let _ = events.send(TunnelEvent::Error(e.to_string()));
                }
            }
            state.send_replace(ControlState::Stopped);
            active.store(false, Ordering::SeqCst);

            result
        });

        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Close the control connection and stop reconnecting
    ///
    /// Safe to call before `start` and more than once. Open sessions are
    /// left to finish on their own.
    pub async fn stop(&self) {
        if let Some(token) = self.cancel.lock().await.take() {
            info!("Stopping tunnel");
            token.cancel();
        }

        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_mut() {
            let _ = handle.await;
            *task = None;
        }

        self.state.send_replace(ControlState::Stopped);
    }

    /// Wait for the background task to finish
    ///
    /// Returns immediately if the tunnel was never started or has already
    /// been joined.
    pub async fn wait(&self) -> Result<(), TunnelError> {
        let mut task = self.task.lock().await;
        let Some(handle) = task.as_mut() else {
            return Ok(());
        };

        let joined = handle.await;
        *task = None;
        joined.map_err(|e| TunnelError::Task(e.to_string()))?
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ControlState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ControlState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    pub async fn active_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list().await
    }
}

async fn run(
    config: Arc<TunnelConfig>,
    channel: ControlChannel,
    targets: Targets,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let hosts = match targets {
        Targets::Hosts(hosts) => hosts,
        Targets::Discover => {
            let hostname = config.gateway_hostname();
            let resolver =
                GatewayResolver::new(config.gateway_port).with_probe_timeout(config.probe_timeout);

            let candidates = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = resolver.resolve(&hostname) => result?,
            };
            if candidates.is_empty() {
                return Err(TunnelError::NoReachableGateway(hostname));
            }

            candidates.iter().map(GatewayCandidate::host).collect()
        }
    };

    info!(gateways = ?hosts, "Starting control channel");
    channel.run(hosts).await
}
