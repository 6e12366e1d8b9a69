//! Ephemeral project provisioning
//!
//! When the agent is started without credentials it asks the API for a
//! short-lived project bound to a fingerprint of this machine.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::debug;

/// A project created for this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralProject {
    pub id: String,
    pub name: String,
    pub agent_id: String,
    pub agent_access_token: String,
    /// Expiry as reported by the API (epoch milliseconds)
    pub expired_timestamp: Option<i64>,
}

/// Host description sent along with the device id
#[derive(Debug, Serialize)]
struct DeviceMeta {
    hostname: String,
    arch: &'static str,
    platform: &'static str,
    /// Minutes behind UTC, positive west of Greenwich
    tz: i32,
    version: &'static str,
}

/// Stable machine fingerprint
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_id: String,
    pub meta: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EphemeralRequest<'a> {
    device_id: &'a str,
    meta: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EphemeralResponse {
    id: Option<String>,
    name: Option<String>,
    agent_id: Option<String>,
    agent_access_token: Option<String>,
    expired_timestamp: Option<i64>,
}

pub fn device_info() -> Result<DeviceInfo> {
    let hostname = hostname::get()
        .context("Failed to read hostname")?
        .to_string_lossy()
        .into_owned();

    let offset_secs = chrono::Local::now().offset().local_minus_utc();

    let meta = DeviceMeta {
        hostname,
        arch: arch_name(std::env::consts::ARCH),
        platform: platform_name(std::env::consts::OS),
        tz: -offset_secs / 60,
        version: env!("CARGO_PKG_VERSION"),
    };
    let meta = serde_json::to_string(&meta).context("Failed to encode device metadata")?;
    let macs = mac_addresses();
    debug!(interfaces = macs.len(), "Collected device MAC addresses");

    Ok(DeviceInfo {
        device_id: fingerprint(&meta, &macs),
        meta,
    })
}

/// Architecture names as the API has always received them
fn arch_name(arch: &'static str) -> &'static str {
    match arch {
        "x86_64" => "x64",
        "x86" => "ia32",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64",
        other => other,
    }
}

fn platform_name(os: &'static str) -> &'static str {
    match os {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

/// Lowercase colon-separated hardware addresses, all-zero ones skipped
fn mac_addresses() -> Vec<String> {
    let iter = match mac_address::MacAddressIterator::new() {
        Ok(iter) => iter,
        Err(e) => {
            debug!(error = %e, "Failed to list network interfaces");
            return Vec::new();
        }
    };

    iter.filter(|mac| mac.bytes() != [0u8; 6])
        .map(|mac| mac.to_string().to_lowercase())
        .collect()
}

/// SHA-1 hex of `meta` and the MAC addresses joined with commas
fn fingerprint(meta: &str, macs: &[String]) -> String {
    let mut parts = Vec::with_capacity(macs.len() + 1);
    parts.push(meta);
    parts.extend(macs.iter().map(String::as_str));
    format!("{:x}", Sha1::digest(parts.join(",").as_bytes()))
}

/// `POST {api_url}/projects/ephemeral`
pub async fn create_temp_project(api_url: &str) -> Result<EphemeralProject> {
    let device = device_info()?;
    let url = format!("{}/projects/ephemeral", api_url.trim_end_matches('/'));
    debug!(%url, device_id = %device.device_id, "Requesting ephemeral project");

    let response = reqwest::Client::new()
        .post(&url)
        .json(&EphemeralRequest {
            device_id: &device.device_id,
            meta: &device.meta,
        })
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("Project creating error ({}): {}", status, body);
    }

    let body: EphemeralResponse = response
        .json()
        .await
        .context("Failed to decode project response")?;

    match body {
        EphemeralResponse {
            id: Some(id),
            name,
            agent_id: Some(agent_id),
            agent_access_token: Some(agent_access_token),
            expired_timestamp,
        } if !id.is_empty() && !agent_id.is_empty() && !agent_access_token.is_empty() => {
            Ok(EphemeralProject {
                name: name.unwrap_or_else(|| id.clone()),
                id,
                agent_id,
                agent_access_token,
                expired_timestamp,
            })
        }
        _ => bail!("Incorrect response"),
    }
}
