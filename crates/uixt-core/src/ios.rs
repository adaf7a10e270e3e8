//! iOS devices reached through usbmuxd.
//!
//! Port forwards are local relays owned by a [`PortForwarder`]; each accepted
//! connection opens a fresh usbmuxd tunnel to the device port. Package
//! management shells out to `ideviceinstaller`.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::UixtConfig;
use crate::device::{Device, Platform};
use crate::driver::{DriverError, Result};
use crate::forward::{PortForwarder, StreamConnector, UsbTunnelConnector};
use crate::info::AppInfo;
use crate::shell::ShellChannel;
use crate::usb_tunnel::{self, UsbTunnelError};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// One row of `ideviceinstaller -l`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledApp {
    pub bundle_id: String,
    pub version: Option<String>,
    pub name: Option<String>,
}

/// Parses `ideviceinstaller -l` CSV-ish output.
///
/// ```text
/// CFBundleIdentifier, CFBundleVersion, CFBundleDisplayName
/// com.example.app, "42", "Example"
/// ```
pub fn parse_app_list(output: &str) -> Vec<InstalledApp> {
    let unquote = |s: &str| {
        let s = s.trim().trim_matches('"');
        (!s.is_empty()).then(|| s.to_string())
    };
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("CFBundleIdentifier"))
        .filter_map(|line| {
            let mut cols = line.splitn(3, ',');
            let bundle_id = unquote(cols.next()?)?;
            Some(InstalledApp {
                bundle_id,
                version: cols.next().and_then(unquote),
                name: cols.next().and_then(unquote),
            })
        })
        .collect()
}

/// An iOS device addressed by UDID.
pub struct IOSDevice {
    udid: String,
    forwarder: PortForwarder,
    installer: ShellChannel,
}

impl IOSDevice {
    pub fn new(udid: impl Into<String>, config: &UixtConfig) -> Self {
        let udid = udid.into();
        let installer = ShellChannel::ideviceinstaller(&udid, config.request_timeout());
        Self {
            udid,
            forwarder: PortForwarder::new(),
            installer,
        }
    }

    /// Forwards `local_port` through an arbitrary connector.
    pub async fn forward_to(&self, local_port: u16, connector: Arc<dyn StreamConnector>) -> Result<u16> {
        self.forwarder.forward(local_port, connector).await
    }

    pub async fn forwarded_ports(&self) -> Vec<u16> {
        self.forwarder.ports().await
    }

    /// `idevicesyslog` command line for log capture.
    pub fn syslog_command(&self) -> Vec<OsString> {
        vec!["idevicesyslog".into(), "-u".into(), self.udid.clone().into()]
    }

    async fn installed_apps(&self) -> Result<Vec<InstalledApp>> {
        let out = self.installer.run(&["-l"]).await?;
        Ok(parse_app_list(&out))
    }
}

#[async_trait]
impl Device for IOSDevice {
    fn uuid(&self) -> &str {
        &self.udid
    }

    fn platform(&self) -> Platform {
        Platform::Ios
    }

    async fn setup(&self) -> Result<()> {
        let devices = usb_tunnel::list_devices().await?;
        if !devices.iter().any(|d| d.udid == self.udid) {
            return Err(UsbTunnelError::DeviceNotFound(self.udid.clone()).into());
        }
        info!(udid = %self.udid, "ios device attached");
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.forwarder.remove_all().await;
        debug!(udid = %self.udid, "ios forwards removed");
        Ok(())
    }

    async fn install(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.installer.run_raw(&["-i", &path], INSTALL_TIMEOUT).await?;
        Ok(())
    }

    async fn uninstall(&self, package: &str) -> Result<()> {
        self.installer.run(&["-U", package]).await?;
        Ok(())
    }

    async fn list_packages(&self) -> Result<Vec<String>> {
        Ok(self
            .installed_apps()
            .await?
            .into_iter()
            .map(|app| app.bundle_id)
            .collect())
    }

    async fn package_info(&self, package: &str) -> Result<AppInfo> {
        let app = self
            .installed_apps()
            .await?
            .into_iter()
            .find(|app| app.bundle_id == package)
            .ok_or_else(|| DriverError::NotFound(format!("package {package}")))?;
        Ok(AppInfo {
            version_name: app.version,
            ..AppInfo::new(app.bundle_id)
        })
    }

    async fn forward(&self, local_port: u16, remote_port: u16) -> Result<u16> {
        let connector = Arc::new(UsbTunnelConnector::new(self.udid.clone(), remote_port));
        self.forwarder.forward(local_port, connector).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_installer_listing() {
        let out = "CFBundleIdentifier, CFBundleVersion, CFBundleDisplayName\n\
                   com.apple.Pages, \"7421\", \"Pages\"\n\
                   com.example.app, \"42\", \"Example, Inc\"\n";
        let apps = parse_app_list(out);
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].bundle_id, "com.apple.Pages");
        assert_eq!(apps[0].version.as_deref(), Some("7421"));
        assert_eq!(apps[1].name.as_deref(), Some("Example, Inc"));
    }

    #[test]
    fn syslog_command_targets_udid() {
        let device = IOSDevice::new("00008110-AB", &UixtConfig::default());
        let line: Vec<String> = device
            .syslog_command()
            .into_iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        assert_eq!(line, ["idevicesyslog", "-u", "00008110-AB"]);
    }
}
