//! Actions started by the controller: enrollment, TCP reconnection and
//! status updates. Each runs on its own task with its own log.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::action::{Action, ActionType};
use crate::context::AgentContext;
use crate::controller::RegisteredDevice;
use crate::error::{AgentError, Result};
use crate::handshake::resolve_device_id;
use common::registry::fields;
use common::DEVICES;

pub const HOME_ACTIVITY: &str = "com.leroymerlin.pandalab/.home.HomeActivity";

/// Start the action for `kind` on a detached task and return its log.
///
/// The task is never cancelled by the controller; it ends on its own
/// success, failure or timeout.
pub fn spawn_action(
    ctx: Arc<AgentContext>,
    kind: ActionType,
    serial: Option<String>,
    device: Option<RegisteredDevice>,
) -> Option<Arc<Action>> {
    let action = match (kind, serial, device) {
        (ActionType::Enroll, Some(serial), _) => {
            let action = Action::new(kind);
            let log = action.clone();
            tokio::spawn(async move {
                let res = enroll(&ctx, &serial, &log).await;
                settle(&log, &serial, res);
            });
            action
        }
        (ActionType::TryConnect, _, Some(device)) => {
            let action = Action::new(kind);
            let log = action.clone();
            tokio::spawn(async move {
                let res = try_connect(&ctx, device.clone(), &log).await;
                settle(&log, &device.id, res);
            });
            action
        }
        (ActionType::UpdateStatus, _, Some(device)) => {
            let action = Action::new(kind);
            let log = action.clone();
            tokio::spawn(async move {
                let res = update_status(&ctx, &device, "save device status", &log).await;
                settle(&log, &device.id, res);
            });
            action
        }
        _ => return None,
    };
    Some(action)
}

fn settle(log: &Action, device: &str, res: Result<()>) {
    match res {
        Ok(()) => log.finish(),
        Err(e) => {
            warn!(device=%device, action=?log.kind(), error=%e, "device action failed");
            log.fail(format!("Error: {e}"));
        }
    }
}

/// Install the service, resolve the device identity, hand the device its
/// credential and wait until it shows up in the registry.
pub async fn enroll(ctx: &AgentContext, serial: &str, log: &Action) -> Result<()> {
    let limit = ctx.settings.enroll_timeout();
    match tokio::time::timeout(limit, enroll_steps(ctx, serial, log)).await {
        Ok(res) => res,
        Err(_) => Err(AgentError::PipelineTimeout(limit)),
    }
}

async fn enroll_steps(ctx: &AgentContext, serial: &str, log: &Action) -> Result<()> {
    log.info("installing service package");
    let apk = ctx.settings.service_apk.as_deref().ok_or_else(|| {
        AgentError::step("install service package")(anyhow::anyhow!("no service_apk configured"))
    })?;
    ctx.bridge
        .install(serial, apk)
        .await
        .map_err(AgentError::step("install service package"))?;

    log.info("retrieving device identity");
    let device_id = resolve_device_id(
        ctx.bridge.as_ref(),
        serial,
        &ctx.agent_id,
        ctx.settings.handshake_timeout(),
    )
    .await?;

    log.info("generating device credential");
    let token = ctx
        .tokens
        .create_device_token(&device_id)
        .await
        .map_err(AgentError::step("generate device credential"))?;

    log.info("launching service");
    let params = BTreeMap::from([
        ("token".to_string(), token),
        ("agent_id".to_string(), ctx.agent_id.clone()),
    ]);
    ctx.bridge
        .launch_activity(serial, HOME_ACTIVITY, &params)
        .await
        .map_err(AgentError::step("launch service"))?;

    log.info("waiting for device in registry");
    let mut doc = ctx.registry.listen_document(DEVICES, &device_id).await?;
    while let Some(snapshot) = doc.next().await {
        if snapshot?.is_some() {
            info!(device=%serial, device_id=%device_id, "device enrolled");
            log.info("device enrolled");
            return Ok(());
        }
    }
    Err(AgentError::step("wait for registry")(anyhow::anyhow!("registry subscription closed")))
}

/// Persist the offline status, then try to reach the device over its stored IP.
/// An unreachable IP is cleared from the registry.
pub async fn try_connect(ctx: &AgentContext, mut device: RegisteredDevice, log: &Action) -> Result<()> {
    update_status(ctx, &device, "save device status", log).await?;

    let Some(ip) = device.doc.known_ip().map(str::to_string) else {
        return Ok(());
    };
    log.info(format!("try to connect to ip {ip}"));
    match ctx.bridge.connect(&ip).await {
        Ok(()) => {
            log.info("connected to device");
            Ok(())
        }
        Err(e) => {
            warn!(device=%device.id, ip=%ip, error=%e, "Can't connect to device");
            device.doc.ip = Some(String::new());
            update_status(ctx, &device, "remove device ip", log).await
        }
    }
}

/// Merge the device's current status (and IP, when set) into the registry.
pub async fn update_status(
    ctx: &AgentContext,
    device: &RegisteredDevice,
    message: &str,
    log: &Action,
) -> Result<()> {
    log.info(message);
    let mut update = fields(json!({ "status": device.doc.status }));
    if let Some(ip) = &device.doc.ip {
        update.insert("ip".to_string(), Value::String(ip.clone()));
    }
    ctx.registry.set(DEVICES, &device.id, update, true).await?;
    log.info("update success");
    Ok(())
}
