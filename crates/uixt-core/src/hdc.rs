//! HarmonyOS devices reached through `hdc`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::UixtConfig;
use crate::device::{pick_free_port, Device, Platform};
use crate::driver::{DriverError, Result};
use crate::info::AppInfo;
use crate::shell::{shell_quote, ShellChannel};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(180);

/// Parses `hdc list targets`.
pub fn parse_targets(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("[Empty]"))
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Extracts version facts from `bm dump -n <bundle>` JSON output.
///
/// The dump starts with the bundle name on its own line, followed by JSON.
pub fn parse_bundle_dump(bundle: &str, output: &str) -> Option<AppInfo> {
    let json_start = output.find('{')?;
    let value: serde_json::Value = serde_json::from_str(&output[json_start..]).ok()?;
    let app = value
        .get("applicationInfo")
        .or_else(|| value.get("hapModuleInfos").and_then(|m| m.get(0)))?;
    let version_name = app
        .get("versionName")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let version_code = app.get("versionCode").map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    let activity = value
        .get("mainEntry")
        .or_else(|| value.get("mainAbility"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some(AppInfo {
        version_name,
        version_code,
        activity,
        ..AppInfo::new(bundle)
    })
}

/// A HarmonyOS device addressed by connect key.
pub struct HarmonyDevice {
    serial: String,
    hdc_path: PathBuf,
    shell: ShellChannel,
    /// local port -> device port
    forwards: Mutex<HashMap<u16, u16>>,
}

impl HarmonyDevice {
    pub fn new(serial: impl Into<String>, config: &UixtConfig) -> Self {
        let serial = serial.into();
        let shell = ShellChannel::hdc(&config.hdc_path, &serial, config.request_timeout());
        Self {
            hdc_path: config.hdc_path.clone(),
            serial,
            shell,
            forwards: Mutex::new(HashMap::new()),
        }
    }

    pub async fn list(config: &UixtConfig) -> Result<Vec<String>> {
        let channel = ShellChannel::new(&config.hdc_path, vec![], config.request_timeout());
        Ok(parse_targets(&channel.run(&["list", "targets"]).await?))
    }

    pub fn shell(&self) -> &ShellChannel {
        &self.shell
    }

    pub fn hdc_path(&self) -> &Path {
        &self.hdc_path
    }

    pub async fn param(&self, name: &str) -> Result<String> {
        self.shell.shell(&format!("param get {name}")).await
    }

    pub async fn remove_forward(&self, local_port: u16) -> Result<()> {
        let removed = self.forwards.lock().await.remove(&local_port);
        if let Some(remote) = removed {
            self.shell
                .run(&[
                    "fport",
                    "rm",
                    &format!("tcp:{local_port}"),
                    &format!("tcp:{remote}"),
                ])
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Device for HarmonyDevice {
    fn uuid(&self) -> &str {
        &self.serial
    }

    fn platform(&self) -> Platform {
        Platform::Harmony
    }

    async fn setup(&self) -> Result<()> {
        let channel = ShellChannel::new(&self.hdc_path, vec![], self.shell.timeout());
        let targets = parse_targets(&channel.run(&["list", "targets"]).await?);
        if !targets.iter().any(|t| t == &self.serial) {
            return Err(DriverError::NotConnected);
        }
        debug!(serial = %self.serial, "harmony device ready");
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        let ports: Vec<u16> = self.forwards.lock().await.keys().copied().collect();
        for port in ports {
            if let Err(e) = self.remove_forward(port).await {
                warn!(port, error = %e, "failed to remove fport");
            }
        }
        Ok(())
    }

    async fn install(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        let out = self
            .shell
            .run_raw(&["install", "-r", &path], INSTALL_TIMEOUT)
            .await?;
        let out = String::from_utf8_lossy(&out);
        if out.contains("fail") {
            return Err(DriverError::CommandFailed(format!("install failed: {}", out.trim())));
        }
        Ok(())
    }

    async fn uninstall(&self, package: &str) -> Result<()> {
        let out = self.shell.run(&["uninstall", package]).await?;
        if out.contains("fail") {
            return Err(DriverError::CommandFailed(format!("uninstall failed: {out}")));
        }
        Ok(())
    }

    async fn list_packages(&self) -> Result<Vec<String>> {
        let out = self.shell.shell("bm dump -a").await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.contains(':'))
            .map(str::to_string)
            .collect())
    }

    async fn package_info(&self, package: &str) -> Result<AppInfo> {
        let out = self
            .shell
            .shell(&format!("bm dump -n {}", shell_quote(package)))
            .await?;
        parse_bundle_dump(package, &out)
            .ok_or_else(|| DriverError::NotFound(format!("package {package}")))
    }

    async fn forward(&self, local_port: u16, remote_port: u16) -> Result<u16> {
        let local_port = if local_port == 0 {
            pick_free_port()?
        } else {
            if self.forwards.lock().await.contains_key(&local_port) {
                self.remove_forward(local_port).await?;
            }
            local_port
        };
        let out = self
            .shell
            .run(&[
                "fport",
                &format!("tcp:{local_port}"),
                &format!("tcp:{remote_port}"),
            ])
            .await?;
        if out.contains("Fail") {
            return Err(DriverError::CommandFailed(format!("hdc fport: {out}")));
        }
        self.forwards.lock().await.insert(local_port, remote_port);
        debug!(local_port, remote_port, "hdc fport added");
        Ok(local_port)
    }
}
