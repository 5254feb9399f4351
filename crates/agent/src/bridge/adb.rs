use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{BridgeClient, ConnectionKind, DeviceHandle, LogLines};

const DEFAULT_TCP_PORT: u16 = 5555;

/// Bridge backed by the `adb` executable.
pub struct AdbBridge {
    adb: PathBuf,
}

impl AdbBridge {
    /// Use `adb_path` when given, otherwise find `adb` on PATH.
    pub fn locate(adb_path: Option<&Path>) -> anyhow::Result<Self> {
        let adb = match adb_path {
            Some(p) => p.to_path_buf(),
            None => which::which("adb").context("adb not found on PATH; set adb_path in agent.toml")?,
        };
        Ok(Self { adb })
    }

    async fn run(&self, args: &[&str]) -> anyhow::Result<String> {
        debug!(adb=%self.adb.display(), args=?args, "running adb");
        let out = Command::new(&self.adb)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawn {}", self.adb.display()))?;
        if !out.status.success() {
            return Err(anyhow!(
                "adb {} exited with {}: {}",
                args.join(" "),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Parse `adb devices -l`, keeping only devices in the `device` state.
fn parse_devices(output: &str) -> Vec<DeviceHandle> {
    output
        .lines()
        .skip_while(|l| !l.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            if state != "device" {
                return None;
            }
            let usb = parts.find(|p| p.starts_with("usb:"));
            let (path, kind) = match usb {
                Some(p) => (p.to_string(), ConnectionKind::Usb),
                None if serial.contains(':') => (serial.to_string(), ConnectionKind::Tcp),
                None => (serial.to_string(), ConnectionKind::Usb),
            };
            Some(DeviceHandle { serial: serial.to_string(), path, kind })
        })
        .collect()
}

fn with_default_port(ip: &str) -> String {
    if ip.contains(':') {
        ip.to_string()
    } else {
        format!("{ip}:{DEFAULT_TCP_PORT}")
    }
}

#[async_trait]
impl BridgeClient for AdbBridge {
    async fn list_devices(&self) -> anyhow::Result<Vec<DeviceHandle>> {
        Ok(parse_devices(&self.run(&["devices", "-l"]).await?))
    }

    async fn is_installed(&self, serial: &str, package: &str) -> anyhow::Result<bool> {
        let out = self.run(&["-s", serial, "shell", "pm", "list", "packages", package]).await?;
        let wanted = format!("package:{package}");
        Ok(out.lines().any(|l| l.trim() == wanted))
    }

    async fn install(&self, serial: &str, apk: &Path) -> anyhow::Result<()> {
        let apk = apk.to_str().ok_or_else(|| anyhow!("apk path is not valid UTF-8"))?;
        let out = self.run(&["-s", serial, "install", "-r", "-g", apk]).await?;
        if !out.contains("Success") {
            return Err(anyhow!("install rejected: {}", out.trim()));
        }
        Ok(())
    }

    async fn launch_activity(
        &self,
        serial: &str,
        component: &str,
        params: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let mut args = vec!["-s", serial, "shell", "am", "start", "-n", component];
        for (k, v) in params {
            args.extend(["--es", k.as_str(), v.as_str()]);
        }
        let out = self.run(&args).await?;
        if out.contains("Error") {
            return Err(anyhow!("activity launch failed: {}", out.trim()));
        }
        Ok(())
    }

    async fn read_log_lines(&self, serial: &str, filter_token: &str) -> anyhow::Result<LogLines> {
        let mut child = Command::new(&self.adb)
            .args(["-s", serial, "logcat", "-v", "brief"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn logcat for {serial}"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("logcat stdout unavailable"))?;
        let lines = BufReader::new(stdout).lines();
        let token = filter_token.to_string();
        // the child rides along in the stream state so dropping the stream kills logcat
        let stream = futures::stream::unfold((child, lines, token), |(child, mut lines, token)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.contains(&token) => return Some((line, (child, lines, token))),
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn connect(&self, ip: &str) -> anyhow::Result<()> {
        let target = with_default_port(ip);
        let out = self.run(&["connect", &target]).await?;
        // adb exits 0 even when the connection is refused
        if out.contains("connected to") {
            Ok(())
        } else {
            Err(anyhow!("cannot connect to {target}: {}", out.trim()))
        }
    }
}
