use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use common::AgentKeypair;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Resolve the agent data directory in a platform-appropriate location.
pub fn agent_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or(std::env::temp_dir()).join("devicelab-agent")
}

fn settings_path() -> PathBuf {
    agent_data_dir().join("agent.toml")
}

fn agent_id_path() -> PathBuf {
    agent_data_dir().join("agent.id")
}

fn keypair_path() -> PathBuf {
    agent_data_dir().join("agent.key.json")
}

/// Lifecycle of the agent's registry session. Reconciliation only runs in `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    NotLogged,
    Configuring,
    Ready,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    /// Enroll unknown devices as soon as they show up on the bridge.
    pub auto_enroll: bool,
    /// Reconnect registered devices over TCP when they drop off the bridge.
    pub enable_tcp: bool,
    pub reconcile_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub enroll_timeout_ms: u64,
    /// Lifetime of device credentials issued during enrollment.
    pub device_token_ttl_secs: u64,
    /// Service package installed on devices during enrollment.
    pub service_apk: Option<PathBuf>,
    /// Explicit adb executable; looked up on PATH when unset.
    pub adb_path: Option<PathBuf>,
    /// Base URL of the registry document API, or `memory`.
    pub registry_url: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            auto_enroll: true,
            enable_tcp: true,
            reconcile_interval_ms: 2_000,
            handshake_timeout_ms: 5_000,
            enroll_timeout_ms: 50_000,
            device_token_ttl_secs: 3_600,
            service_apk: None,
            adb_path: None,
            registry_url: None,
        }
    }
}

impl AgentSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(100))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn enroll_timeout(&self) -> Duration {
        Duration::from_millis(self.enroll_timeout_ms)
    }
}

pub fn load_settings() -> AgentSettings {
    match fs::read_to_string(settings_path()) {
        Ok(text) => match toml::from_str::<AgentSettings>(&text) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error=%e, "Failed to parse agent settings, using defaults");
                AgentSettings::default()
            }
        },
        Err(_) => AgentSettings::default(),
    }
}

pub fn save_settings(settings: &AgentSettings) -> anyhow::Result<()> {
    fs::create_dir_all(agent_data_dir())?;
    fs::write(settings_path(), toml::to_string_pretty(settings)?)?;
    Ok(())
}

/// Stable identifier of this agent, created on first run.
pub fn load_or_create_agent_id() -> String {
    if let Ok(id) = fs::read_to_string(agent_id_path()) {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    let _ = fs::create_dir_all(agent_data_dir());
    if let Err(e) = fs::write(agent_id_path(), id.as_bytes()) {
        warn!(error=%e, "Failed to persist agent id; a new one will be generated next run");
    }
    id
}

/// Signing key used for device credentials, created on first run.
pub fn load_or_create_keypair() -> anyhow::Result<AgentKeypair> {
    if let Ok(bytes) = fs::read(keypair_path()) {
        if let Ok(kp) = serde_json::from_slice::<AgentKeypair>(&bytes) {
            return AgentKeypair::from_private_hex(&kp.private_hex);
        }
    }
    let kp = AgentKeypair::generate();
    fs::create_dir_all(agent_data_dir())?;
    fs::write(keypair_path(), serde_json::to_vec_pretty(&kp)?)?;
    Ok(kp)
}
