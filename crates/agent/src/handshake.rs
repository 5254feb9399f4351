//! Resolves a bridge-visible device to its registry identifier.
//!
//! The agent starts the service's identity activity with a fresh correlation
//! token; the service answers by logging `<token> {"device_id": "..."}`, which
//! the agent picks up from the device log.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tracing::debug;

use crate::bridge::BridgeClient;
use crate::error::{AgentError, Result};
use common::SERVICE_PACKAGE;

pub const IDENTITY_ACTIVITY: &str = "com.leroymerlin.pandalab/.GenerateUniqueId";

#[derive(Deserialize)]
struct IdentityReply {
    device_id: String,
}

/// Ask the device service for its registry identifier.
///
/// `timeout` bounds the whole exchange, bridge calls included.
pub async fn resolve_device_id(
    bridge: &dyn BridgeClient,
    serial: &str,
    agent_id: &str,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, exchange(bridge, serial, agent_id)).await {
        Ok(res) => res,
        Err(_) => Err(AgentError::HandshakeTimeout(timeout)),
    }
}

async fn exchange(bridge: &dyn BridgeClient, serial: &str, agent_id: &str) -> Result<String> {
    let installed = bridge
        .is_installed(serial, SERVICE_PACKAGE)
        .await
        .map_err(AgentError::Bridge)?;
    if !installed {
        return Err(AgentError::NotInstalled);
    }

    let token = uuid::Uuid::new_v4().to_string();
    // start reading before launching so the reply cannot be missed
    let mut lines = bridge
        .read_log_lines(serial, &token)
        .await
        .map_err(AgentError::Bridge)?;

    let params = BTreeMap::from([
        ("transaction_id".to_string(), token.clone()),
        ("agent_id".to_string(), agent_id.to_string()),
    ]);
    let reply = async {
        lines
            .next()
            .await
            .ok_or_else(|| AgentError::HandshakeParseFailure("device log closed".into()))
    };
    let launch = async {
        bridge
            .launch_activity(serial, IDENTITY_ACTIVITY, &params)
            .await
            .map_err(AgentError::Bridge)
    };
    let (line, ()) = tokio::try_join!(reply, launch)?;
    debug!(device=%serial, token=%token, "identity reply received");
    parse_identity_reply(&line)
}

/// Extract `device_id` from the JSON object embedded in a log line.
fn parse_identity_reply(line: &str) -> Result<String> {
    let start = line
        .find('{')
        .ok_or_else(|| AgentError::HandshakeParseFailure(format!("no payload in {line:?}")))?;
    let reply: IdentityReply = serde_json::from_str(line[start..].trim())
        .map_err(|e| AgentError::HandshakeParseFailure(e.to_string()))?;
    if reply.device_id.trim().is_empty() {
        return Err(AgentError::HandshakeParseFailure("empty device_id".into()));
    }
    Ok(reply.device_id)
}
