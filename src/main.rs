//! pnode - expose a local service through a pnode gateway
//!
//! Dials out to the gateway pool over TLS and forwards every incoming
//! session to `localhost:<port>`.

mod provision;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use pnode_client::{AgentCredentials, ReconnectPolicy, Tunnel, TunnelConfig, TunnelEvent};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_DOMAIN: &str = "pnode.site";
const DEFAULT_GATEWAY_PORT: u16 = 50000;
const DEFAULT_LOCAL_PORT: u16 = 3000;
const DEFAULT_LOCAL_HOST: &str = "localhost";

/// CLI for launching an http tunnel
#[derive(Parser, Debug)]
#[command(name = "pnode")]
#[command(about = "CLI for launching an http tunnel")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
#[command(long_about = r#"
Expose a service running on this machine through a pnode gateway.

Without credentials a temporary project is created for this machine.

EXAMPLES:
  # Tunnel localhost:3000 through a temporary project
  pnode

  # Tunnel localhost:8080 with existing credentials
  pnode run --project $PROJECT_ID --agent $AGENT_ID --token $AGENT_TOKEN --port 8080

  # Serve the diagnostic page instead of a local service
  pnode --test

ENVIRONMENT VARIABLES:
  PROJECT_ID    Project id
  AGENT_ID      Agent id
  AGENT_TOKEN   Agent access token
  LOCAL_PORT    Local forwarded port
  TEST_MODE     Test mode
"#)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start local tunnel (default)
    Run(RunArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    /// Project id
    #[arg(long = "project", env = "PROJECT_ID")]
    project_id: Option<String>,

    /// Agent id
    #[arg(long = "agent", env = "AGENT_ID")]
    agent_id: Option<String>,

    /// Agent token
    #[arg(long = "token", env = "AGENT_TOKEN")]
    token: Option<String>,

    /// Local forwarded port [default: 3000]
    #[arg(long, env = "LOCAL_PORT", value_parser = parse_local_port)]
    port: Option<u16>,

    /// Test mode: answer every session with a diagnostic page
    #[arg(short = 't', long = "test", env = "TEST_MODE")]
    test: bool,

    /// Base domain of the gateway pool [default: pnode.site]
    #[arg(long, env = "PNODE_DOMAIN")]
    domain: Option<String>,

    /// Gateway port [default: 50000]
    #[arg(long, env = "PNODE_GATEWAY_PORT")]
    gateway_port: Option<u16>,

    /// Connect to this gateway host instead of discovering the pool
    #[arg(long, env = "PNODE_GATEWAY_HOST")]
    gateway_host: Option<String>,

    /// Project API base URL [default: https://api.<domain>]
    #[arg(long, env = "PNODE_API_URL")]
    api_url: Option<String>,

    /// Verify the gateway TLS certificate
    #[arg(long, env = "PNODE_VERIFY_CERTIFICATE")]
    verify_certificate: bool,

    /// Delay between control reconnection attempts, in milliseconds [default: 5000]
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,

    /// Reconnection attempts before giving up [default: 3]
    #[arg(long)]
    max_retries: Option<u32>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    gateway: GatewayFile,
    agent: AgentFile,
    reconnect: ReconnectFile,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct GatewayFile {
    domain: Option<String>,
    port: Option<u16>,
    host: Option<String>,
    api_url: Option<String>,
    verify_certificate: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct AgentFile {
    project_id: Option<String>,
    agent_id: Option<String>,
    /// Environment variable holding the token
    token_env: Option<String>,
    /// Direct token (prefer token_env)
    token: Option<String>,
    local_host: Option<String>,
    local_port: Option<u16>,
    test_mode: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ReconnectFile {
    delay_ms: Option<u64>,
    max_retries: Option<u32>,
}

/// Where the agent's credentials come from
#[derive(Debug, Clone, PartialEq, Eq)]
enum CredentialSource {
    Provided(AgentCredentials),
    Provision,
}

/// Merged CLI, environment and file settings
#[derive(Debug)]
struct Settings {
    domain: String,
    gateway_port: u16,
    gateway_host: Option<String>,
    api_url: String,
    local_host: String,
    local_port: u16,
    test_mode: bool,
    verify_certificate: bool,
    reconnect: ReconnectPolicy,
    credentials: CredentialSource,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn parse_local_port(value: &str) -> Result<u16, String> {
    let port: u32 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a port number", value))?;
    validate_local_port(port).map_err(|e| e.to_string())
}

/// Accepts 1..=65534
fn validate_local_port(port: u32) -> Result<u16> {
    if port == 0 || port >= 65535 {
        bail!("Invalid port {}", port);
    }
    Ok(port as u16)
}

fn resolve_credentials(
    project_id: Option<String>,
    agent_id: Option<String>,
    token: Option<String>,
) -> Result<CredentialSource> {
    let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

    match (non_empty(project_id), non_empty(agent_id), non_empty(token)) {
        (Some(project_id), Some(agent_id), Some(agent_access_token)) => {
            Ok(CredentialSource::Provided(AgentCredentials::Full {
                project_id,
                agent_id,
                agent_access_token,
            }))
        }
        (None, None, Some(agent_access_token)) => Ok(CredentialSource::Provided(
            AgentCredentials::TokenOnly { agent_access_token },
        )),
        (None, None, None) => Ok(CredentialSource::Provision),
        _ => bail!("--project, --agent and --token must be given together (or --token alone)"),
    }
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with the config file, giving precedence to CLI args
fn build_settings(args: RunArgs) -> Result<Settings> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let file_token = match &file.agent.token_env {
        Some(var) => Some(
            std::env::var(var).with_context(|| format!("Environment variable {} not set", var))?,
        ),
        None => file.agent.token,
    };

    let local_port = match args.port {
        Some(port) => port,
        None => match file.agent.local_port {
            Some(port) => validate_local_port(port.into())?,
            None => DEFAULT_LOCAL_PORT,
        },
    };

    let domain = args
        .domain
        .or(file.gateway.domain)
        .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());
    let api_url = args
        .api_url
        .or(file.gateway.api_url)
        .unwrap_or_else(|| format!("https://api.{}", domain));

    let defaults = ReconnectPolicy::default();
    let reconnect = ReconnectPolicy {
        delay: args
            .reconnect_delay_ms
            .or(file.reconnect.delay_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.delay),
        max_retries: args
            .max_retries
            .or(file.reconnect.max_retries)
            .unwrap_or(defaults.max_retries),
    };

    let credentials = resolve_credentials(
        args.project_id.or(file.agent.project_id),
        args.agent_id.or(file.agent.agent_id),
        args.token.or(file_token),
    )?;

    Ok(Settings {
        gateway_port: args
            .gateway_port
            .or(file.gateway.port)
            .unwrap_or(DEFAULT_GATEWAY_PORT),
        gateway_host: args.gateway_host.or(file.gateway.host),
        local_host: file
            .agent
            .local_host
            .unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string()),
        local_port,
        test_mode: args.test || file.agent.test_mode.unwrap_or(false),
        verify_certificate: args.verify_certificate
            || file.gateway.verify_certificate.unwrap_or(false),
        domain,
        api_url,
        reconnect,
        credentials,
    })
}

fn build_tunnel_config(settings: &Settings, credentials: AgentCredentials) -> Result<TunnelConfig> {
    TunnelConfig::builder()
        .domain(settings.domain.clone())
        .gateway_port(settings.gateway_port)
        .local_host(settings.local_host.clone())
        .local_port(settings.local_port)
        .credentials(credentials)
        .verify_server_certificate(settings.verify_certificate)
        .test_mode(settings.test_mode)
        .reconnect(settings.reconnect.clone())
        .build()
        .context("Invalid tunnel configuration")
}

async fn log_events(mut events: broadcast::Receiver<TunnelEvent>) {
    loop {
        match events.recv().await {
            Ok(TunnelEvent::Started { host }) => info!(%host, "Tunnel started"),
            Ok(TunnelEvent::Stopped { host }) => warn!(%host, "Tunnel connection closed"),
            Ok(TunnelEvent::Error(message)) => error!("Tunnel error: {}", message),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let args = match cli.command {
        Some(Commands::Run(args)) => args,
        None => cli.run,
    };

    setup_logging(&args.log_level)?;

    let settings = build_settings(args).context("Failed to build configuration")?;

    let credentials = match settings.credentials.clone() {
        CredentialSource::Provided(credentials) => credentials,
        CredentialSource::Provision => {
            println!("Starting temporary tunnel");
            let project = provision::create_temp_project(&settings.api_url)
                .await
                .context("Project creating error")?;
            println!("Created project https://{}.{}", project.name, settings.domain);

            AgentCredentials::Full {
                project_id: project.id,
                agent_id: project.agent_id,
                agent_access_token: project.agent_access_token,
            }
        }
    };

    let config = build_tunnel_config(&settings, credentials)?;

    info!(
        domain = %config.domain,
        gateway_port = config.gateway_port,
        local = %config.local_address(),
        test_mode = config.test_mode,
        "pnode agent starting"
    );

    let tunnel = Tunnel::new(config).context("Failed to create tunnel")?;
    tokio::spawn(log_events(tunnel.subscribe()));

    tunnel
        .start(settings.gateway_host.clone())
        .await
        .context("Failed to start tunnel")?;

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            tunnel.stop().await;
        }
        result = tunnel.wait() => {
            result.context("Tunnel stopped")?;
        }
    }

    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(argv.iter().copied()).unwrap();
        match cli.command {
            Some(Commands::Run(args)) => args,
            None => cli.run,
        }
    }

    #[test]
    fn test_resolve_credentials() {
        let s = |v: &str| Some(v.to_string());

        assert!(matches!(
            resolve_credentials(s("p"), s("a"), s("t")).unwrap(),
            CredentialSource::Provided(AgentCredentials::Full { .. })
        ));
        assert_eq!(
            resolve_credentials(None, None, s("t")).unwrap(),
            CredentialSource::Provided(AgentCredentials::TokenOnly {
                agent_access_token: "t".to_string()
            })
        );
        assert_eq!(
            resolve_credentials(None, None, None).unwrap(),
            CredentialSource::Provision
        );
        assert_eq!(
            resolve_credentials(None, None, s("")).unwrap(),
            CredentialSource::Provision
        );

        assert!(resolve_credentials(s("p"), None, s("t")).is_err());
        assert!(resolve_credentials(None, s("a"), s("t")).is_err());
        assert!(resolve_credentials(s("p"), s("a"), None).is_err());
    }

    #[test]
    fn test_port_validation() {
        assert_eq!(parse_local_port("3000"), Ok(3000));
        assert_eq!(parse_local_port("1"), Ok(1));
        assert_eq!(parse_local_port("65534"), Ok(65534));

        assert!(parse_local_port("0").is_err());
        assert!(parse_local_port("65535").is_err());
        assert!(parse_local_port("70000").is_err());
        assert!(parse_local_port("http").is_err());
    }

    #[test]
    fn test_run_is_the_default_command() {
        let bare = parse(&["pnode", "--token", "abc", "--port", "8080", "-t"]);
        assert_eq!(bare.token.as_deref(), Some("abc"));
        assert_eq!(bare.port, Some(8080));
        assert!(bare.test);

        let explicit = parse(&["pnode", "run", "--token", "abc", "--port", "8080"]);
        assert_eq!(explicit.token.as_deref(), Some("abc"));
        assert_eq!(explicit.port, Some(8080));
    }

    #[test]
    fn test_cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["pnode", "--port", "0"]).is_err());
        assert!(Cli::try_parse_from(["pnode", "--port", "65535"]).is_err());
    }

    #[test]
    fn test_settings_defaults() {
        let args = RunArgs {
            token: Some("tok".to_string()),
            log_level: "info".to_string(),
            ..Default::default()
        };
        let settings = build_settings(args).unwrap();

        assert_eq!(settings.domain, "pnode.site");
        assert_eq!(settings.api_url, "https://api.pnode.site");
        assert_eq!(settings.gateway_port, 50000);
        assert_eq!(settings.local_port, 3000);
        assert_eq!(settings.local_host, "localhost");
        assert!(!settings.verify_certificate);
        assert_eq!(settings.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn test_config_file_merge() {
        let dir = std::env::temp_dir().join(format!("pnode-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("agent.yaml");
        fs::write(
            &path,
            r#"
gateway:
  domain: example.test
  port: 6000
agent:
  project_id: file-project
  agent_id: file-agent
  token: file-token
  local_port: 8081
  test_mode: true
reconnect:
  delay_ms: 250
  max_retries: 9
"#,
        )
        .unwrap();

        let args = RunArgs {
            config: Some(path.clone()),
            port: Some(9000),
            max_retries: Some(1),
            log_level: "info".to_string(),
            ..Default::default()
        };
        let settings = build_settings(args).unwrap();

        assert_eq!(settings.domain, "example.test");
        assert_eq!(settings.api_url, "https://api.example.test");
        assert_eq!(settings.gateway_port, 6000);
        // CLI wins over the file
        assert_eq!(settings.local_port, 9000);
        assert_eq!(settings.reconnect.max_retries, 1);
        assert_eq!(settings.reconnect.delay, Duration::from_millis(250));
        assert!(settings.test_mode);
        assert!(matches!(
            settings.credentials,
            CredentialSource::Provided(AgentCredentials::Full { .. })
        ));

        let config = match settings.credentials.clone() {
            CredentialSource::Provided(credentials) => {
                build_tunnel_config(&settings, credentials).unwrap()
            }
            CredentialSource::Provision => unreachable!(),
        };
        assert_eq!(config.gateway_hostname(), "agent-gateway.example.test");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_config_file_rejects_bad_port() {
        let dir = std::env::temp_dir().join(format!("pnode-badport-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("agent.yaml");
        fs::write(&path, "agent:\n  token: t\n  local_port: 65535\n").unwrap();

        let args = RunArgs {
            config: Some(path),
            log_level: "info".to_string(),
            ..Default::default()
        };
        assert!(build_settings(args).is_err());

        fs::remove_dir_all(&dir).unwrap();
    }
}
