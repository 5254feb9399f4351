use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, Notify};

use super::{BridgeClient, ConnectionKind, DeviceHandle, LogLines};
use crate::handshake::IDENTITY_ACTIVITY;

/// Scriptable bridge. Launching the identity activity on a device with a
/// configured reply emits a log line carrying the correlation token.
pub struct FakeBridge {
    devices: Mutex<Vec<DeviceHandle>>,
    installed: Mutex<HashSet<String>>,
    replies: Mutex<HashMap<String, String>>,
    connectable: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
    broken_installs: Mutex<HashSet<String>>,
    logs: broadcast::Sender<(String, String)>,
    install_gate: Mutex<Option<Arc<Notify>>>,
    pub installs: AtomicUsize,
    pub launches: Mutex<Vec<(String, String, BTreeMap<String, String>)>>,
    pub connects: Mutex<Vec<String>>,
}

impl FakeBridge {
    pub fn new() -> Arc<Self> {
        let (logs, _) = broadcast::channel(64);
        Arc::new(Self {
            devices: Mutex::new(Vec::new()),
            installed: Mutex::new(HashSet::new()),
            replies: Mutex::new(HashMap::new()),
            connectable: Mutex::new(HashSet::new()),
            stalled: Mutex::new(HashSet::new()),
            broken_installs: Mutex::new(HashSet::new()),
            logs,
            install_gate: Mutex::new(None),
            installs: AtomicUsize::new(0),
            launches: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
        })
    }

    pub fn attach(&self, serial: &str) {
        self.devices.lock().unwrap().push(DeviceHandle {
            serial: serial.to_string(),
            path: format!("usb:{serial}"),
            kind: ConnectionKind::Usb,
        });
    }

    /// Mark the service as installed and answer handshakes with `device_id`.
    pub fn enrolled(&self, serial: &str, device_id: &str) {
        self.installed.lock().unwrap().insert(serial.to_string());
        self.reply_with(serial, &format!("{{\"device_id\":\"{device_id}\"}}"));
    }

    /// Raw payload logged after the token when the identity activity starts.
    pub fn reply_with(&self, serial: &str, payload: &str) {
        self.replies.lock().unwrap().insert(serial.to_string(), payload.to_string());
    }

    pub fn mark_installed(&self, serial: &str) {
        self.installed.lock().unwrap().insert(serial.to_string());
    }

    pub fn allow_connect(&self, ip: &str) {
        self.connectable.lock().unwrap().insert(ip.to_string());
    }

    /// Make the package check on `serial` hang forever.
    pub fn stall_install_check(&self, serial: &str) {
        self.stalled.lock().unwrap().insert(serial.to_string());
    }

    /// Make every install on `serial` fail.
    pub fn fail_installs(&self, serial: &str) {
        self.broken_installs.lock().unwrap().insert(serial.to_string());
    }

    /// Make `install` block until the returned notify fires.
    pub fn hold_installs(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.install_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn launched(&self, component: &str) -> Vec<BTreeMap<String, String>> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c, _)| c == component)
            .map(|(_, _, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl BridgeClient for FakeBridge {
    async fn list_devices(&self) -> anyhow::Result<Vec<DeviceHandle>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn is_installed(&self, serial: &str, _package: &str) -> anyhow::Result<bool> {
        let stalled = self.stalled.lock().unwrap().contains(serial);
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(self.installed.lock().unwrap().contains(serial))
    }

    async fn install(&self, serial: &str, _apk: &Path) -> anyhow::Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        let broken = self.broken_installs.lock().unwrap().contains(serial);
        if broken {
            return Err(anyhow::anyhow!("INSTALL_FAILED_INSUFFICIENT_STORAGE"));
        }
        let gate = self.install_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.installed.lock().unwrap().insert(serial.to_string());
        Ok(())
    }

    async fn launch_activity(
        &self,
        serial: &str,
        component: &str,
        params: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        self.launches
            .lock()
            .unwrap()
            .push((serial.to_string(), component.to_string(), params.clone()));
        if component == IDENTITY_ACTIVITY {
            let reply = self.replies.lock().unwrap().get(serial).cloned();
            if let (Some(reply), Some(token)) = (reply, params.get("transaction_id")) {
                let line = format!("I/PandaLab( 4242): {token} {reply}");
                let _ = self.logs.send((serial.to_string(), line));
            }
        }
        Ok(())
    }

    async fn read_log_lines(&self, serial: &str, filter_token: &str) -> anyhow::Result<LogLines> {
        let rx = self.logs.subscribe();
        let serial = serial.to_string();
        let token = filter_token.to_string();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let serial = serial.clone();
            let token = token.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((s, line)) if s == serial && line.contains(&token) => return Some((line, rx)),
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn connect(&self, ip: &str) -> anyhow::Result<()> {
        self.connects.lock().unwrap().push(ip.to_string());
        if self.connectable.lock().unwrap().contains(ip) {
            Ok(())
        } else {
            Err(anyhow::anyhow!("failed to connect to {ip}"))
        }
    }
}
