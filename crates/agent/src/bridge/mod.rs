//! Local debugging bridge to attached Android devices.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use futures::stream::BoxStream;

mod adb;
#[cfg(test)]
pub mod fake;

pub use adb::AdbBridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Usb,
    Tcp,
}

/// A device as the bridge reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Bridge-local serial, e.g. `emulator-5554` or `192.168.1.20:5555`.
    pub serial: String,
    /// Connection path, e.g. `usb:1-1.2`; the serial for network devices.
    pub path: String,
    pub kind: ConnectionKind,
}

/// Device log lines, unbounded; dropping the stream stops reading.
pub type LogLines = BoxStream<'static, String>;

#[async_trait]
pub trait BridgeClient: Send + Sync {
    async fn list_devices(&self) -> anyhow::Result<Vec<DeviceHandle>>;

    async fn is_installed(&self, serial: &str, package: &str) -> anyhow::Result<bool>;

    async fn install(&self, serial: &str, apk: &Path) -> anyhow::Result<()>;

    async fn launch_activity(
        &self,
        serial: &str,
        component: &str,
        params: &BTreeMap<String, String>,
    ) -> anyhow::Result<()>;

    /// Log lines of the device that contain `filter_token`.
    async fn read_log_lines(&self, serial: &str, filter_token: &str) -> anyhow::Result<LogLines>;

    async fn connect(&self, ip: &str) -> anyhow::Result<()>;
}
