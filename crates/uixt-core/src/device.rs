//! The device contract.
//!
//! A [`Device`] is the identity and lifecycle of one device under test:
//! its serial/UDID, setup and teardown, app package management and port
//! forwarding. A driver holds exactly one device for its lifetime; a device
//! may outlive several drivers.
//!
//! Implementations: [`AndroidDevice`](crate::adb::AndroidDevice),
//! [`HarmonyDevice`](crate::hdc::HarmonyDevice),
//! [`IOSDevice`](crate::ios::IOSDevice) and
//! [`BrowserDevice`](crate::browser::BrowserDevice).

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::driver::{DriverError, Result};
use crate::info::AppInfo;

/// Device operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    Harmony,
    Browser,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Harmony => "harmony",
            Platform::Browser => "browser",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait Device: Send + Sync {
    /// Serial, UDID or browser-agent key.
    fn uuid(&self) -> &str;

    fn platform(&self) -> Platform;

    /// Verifies the device is reachable and prepares it for automation.
    async fn setup(&self) -> Result<()>;

    /// Releases everything `setup` and `forward` acquired.
    async fn teardown(&self) -> Result<()>;

    async fn install(&self, path: &Path) -> Result<()> {
        let _ = path;
        Err(DriverError::not_implemented("install"))
    }

    async fn uninstall(&self, package: &str) -> Result<()> {
        let _ = package;
        Err(DriverError::not_implemented("uninstall"))
    }

    async fn list_packages(&self) -> Result<Vec<String>> {
        Err(DriverError::not_implemented("list_packages"))
    }

    async fn package_info(&self, package: &str) -> Result<AppInfo> {
        let _ = package;
        Err(DriverError::not_implemented("package_info"))
    }

    /// Forwards `127.0.0.1:local_port` to `remote_port` on the device.
    ///
    /// A `local_port` of 0 picks a free port. Re-forwarding a local port
    /// replaces the previous rule. Returns the local port in use.
    async fn forward(&self, local_port: u16, remote_port: u16) -> Result<u16> {
        let _ = (local_port, remote_port);
        Err(DriverError::not_implemented("forward"))
    }
}

/// Asks the OS for a currently free loopback port.
pub fn pick_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
