//! Android devices reached through `adb`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::UixtConfig;
use crate::device::{Device, Platform};
use crate::driver::{DriverError, Result};
use crate::info::AppInfo;
use crate::shell::{shell_quote, ShellChannel};

/// Timeout for `adb install`, which is much slower than regular commands.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(180);

const UIA2_SERVER_PACKAGE: &str = "io.appium.uiautomator2.server";
const UIA2_TEST_PACKAGE: &str = "io.appium.uiautomator2.server.test";
const UIA2_RUNNER: &str =
    "io.appium.uiautomator2.server.test/androidx.test.runner.AndroidJUnitRunner";

/// One line of `adb devices -l`.
#[derive(Debug, Clone, PartialEq)]
pub struct AdbDeviceEntry {
    pub serial: String,
    /// `device`, `offline`, `unauthorized`, ...
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
}

/// Parses `adb devices -l` output.
pub fn parse_devices(output: &str) -> Vec<AdbDeviceEntry> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("List of devices") && !l.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?.to_string();
            let state = parts.next()?.to_string();
            let mut entry = AdbDeviceEntry {
                serial,
                state,
                model: None,
                product: None,
            };
            for part in parts {
                if let Some(model) = part.strip_prefix("model:") {
                    entry.model = Some(model.to_string());
                } else if let Some(product) = part.strip_prefix("product:") {
                    entry.product = Some(product.to_string());
                }
            }
            Some(entry)
        })
        .collect()
}

/// Extracts version name/code from `dumpsys package <pkg>` output.
pub fn parse_package_version(package: &str, output: &str) -> Option<AppInfo> {
    static NAME: OnceLock<Option<Regex>> = OnceLock::new();
    static CODE: OnceLock<Option<Regex>> = OnceLock::new();
    let name_re = NAME.get_or_init(|| Regex::new(r"versionName=(\S+)").ok()).as_ref()?;
    let code_re = CODE.get_or_init(|| Regex::new(r"versionCode=(\d+)").ok()).as_ref()?;

    let version_name = name_re.captures(output).map(|c| c[1].to_string());
    let version_code = code_re.captures(output).map(|c| c[1].to_string());
    if version_name.is_none() && version_code.is_none() {
        return None;
    }
    Some(AppInfo {
        version_name,
        version_code,
        ..AppInfo::new(package)
    })
}

/// An Android device addressed by serial.
pub struct AndroidDevice {
    serial: String,
    adb_path: PathBuf,
    shell: ShellChannel,
    /// local port -> device port
    forwards: Mutex<HashMap<u16, u16>>,
    uia2_server: Mutex<Option<Child>>,
}

impl AndroidDevice {
    pub fn new(serial: impl Into<String>, config: &UixtConfig) -> Self {
        let serial = serial.into();
        let shell = ShellChannel::adb(&config.adb_path, &serial, config.request_timeout());
        Self {
            adb_path: config.adb_path.clone(),
            serial,
            shell,
            forwards: Mutex::new(HashMap::new()),
            uia2_server: Mutex::new(None),
        }
    }

    /// Lists devices known to the adb server.
    pub async fn list(config: &UixtConfig) -> Result<Vec<AdbDeviceEntry>> {
        let channel = ShellChannel::new(&config.adb_path, vec![], config.request_timeout());
        Ok(parse_devices(&channel.run(&["devices", "-l"]).await?))
    }

    /// The device-scoped adb channel.
    pub fn shell(&self) -> &ShellChannel {
        &self.shell
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb_path
    }

    pub async fn getprop(&self, name: &str) -> Result<String> {
        self.shell.shell(&format!("getprop {name}")).await
    }

    /// Current forward rules (local port -> device port).
    pub async fn forwards(&self) -> HashMap<u16, u16> {
        self.forwards.lock().await.clone()
    }

    pub async fn remove_forward(&self, local_port: u16) -> Result<()> {
        let removed = self.forwards.lock().await.remove(&local_port);
        if removed.is_some() {
            self.shell
                .run(&["forward", "--remove", &format!("tcp:{local_port}")])
                .await?;
        }
        Ok(())
    }

    /// Launches the UiAutomator2 server instrumentation in the background.
    ///
    /// Any server started earlier by this device is stopped first.
    pub async fn start_uia2_server(&self) -> Result<()> {
        self.stop_uia2_server().await?;

        let line = self
            .shell
            .command_line(["shell", "am", "instrument", "-w", "-e", "disableAnalytics", "true", UIA2_RUNNER]);
        let mut cmd = Command::new(&line[0]);
        cmd.args(&line[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let child = cmd.spawn()?;
        info!(serial = %self.serial, "uiautomator2 server launched");
        *self.uia2_server.lock().await = Some(child);
        Ok(())
    }

    /// Stops the UiAutomator2 server (ours and any stray instance).
    pub async fn stop_uia2_server(&self) -> Result<()> {
        if let Some(mut child) = self.uia2_server.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        for package in [UIA2_TEST_PACKAGE, UIA2_SERVER_PACKAGE] {
            if let Err(e) = self.shell.shell(&format!("am force-stop {package}")).await {
                debug!(package, error = %e, "force-stop failed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Device for AndroidDevice {
    fn uuid(&self) -> &str {
        &self.serial
    }

    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn setup(&self) -> Result<()> {
        let state = self.shell.run(&["get-state"]).await?;
        if state != "device" {
            return Err(DriverError::NotConnected);
        }
        debug!(serial = %self.serial, "android device ready");
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        let ports: Vec<u16> = self.forwards.lock().await.keys().copied().collect();
        for port in ports {
            if let Err(e) = self.remove_forward(port).await {
                warn!(port, error = %e, "failed to remove forward");
            }
        }
        self.stop_uia2_server().await
    }

    async fn install(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        let out = self
            .shell
            .run_raw(&["install", "-r", "-g", &path], INSTALL_TIMEOUT)
            .await?;
        let out = String::from_utf8_lossy(&out);
        if out.contains("Failure") {
            return Err(DriverError::CommandFailed(format!("install failed: {}", out.trim())));
        }
        Ok(())
    }

    async fn uninstall(&self, package: &str) -> Result<()> {
        let out = self.shell.run(&["uninstall", package]).await?;
        if out.contains("Failure") {
            return Err(DriverError::CommandFailed(format!("uninstall failed: {out}")));
        }
        Ok(())
    }

    async fn list_packages(&self) -> Result<Vec<String>> {
        let out = self.shell.shell("pm list packages").await?;
        Ok(out
            .lines()
            .filter_map(|l| l.trim().strip_prefix("package:"))
            .map(str::to_string)
            .collect())
    }

    async fn package_info(&self, package: &str) -> Result<AppInfo> {
        let out = self
            .shell
            .shell(&format!("dumpsys package {}", shell_quote(package)))
            .await?;
        parse_package_version(package, &out)
            .ok_or_else(|| DriverError::NotFound(format!("package {package}")))
    }

    async fn forward(&self, local_port: u16, remote_port: u16) -> Result<u16> {
        let remote = format!("tcp:{remote_port}");
        if local_port == 0 {
            let out = self.shell.run(&["forward", "tcp:0", &remote]).await?;
            let port: u16 = out.trim().parse().map_err(|_| {
                DriverError::CommandFailed(format!("unexpected adb forward output: {out}"))
            })?;
            self.forwards.lock().await.insert(port, remote_port);
            return Ok(port);
        }

        if self.forwards.lock().await.contains_key(&local_port) {
            self.remove_forward(local_port).await?;
        }
        self.shell
            .run(&["forward", &format!("tcp:{local_port}"), &remote])
            .await?;
        self.forwards.lock().await.insert(local_port, remote_port);
        debug!(local_port, remote_port, "adb forward added");
        Ok(local_port)
    }
}
