//! Builds drivers from a [`DriverConfig`].
//!
//! Backend selection happens here and only here; everything downstream holds
//! an `Arc<dyn AutomationDriver>`. Drivers are returned un-setup: call
//! [`setup`](AutomationDriver::setup) before the first operation.

use std::sync::Arc;

use tracing::info;

use crate::adb::AndroidDevice;
use crate::adb_driver::AdbDriver;
use crate::browser::BrowserDevice;
use crate::browser_driver::BrowserDriver;
use crate::config::UixtConfig;
use crate::driver::{AutomationDriver, DriverConfig, Result};
use crate::hdc::HarmonyDevice;
use crate::hdc_driver::HdcDriver;
use crate::ios::IOSDevice;
use crate::session::SessionSettings;
use crate::stub_driver::StubDriver;
use crate::uia2_driver::Uia2Driver;
use crate::wda_driver::WdaDriver;

/// Creates the driver selected by `config`.
///
/// `Stub` configs build their base driver first and wrap it.
pub fn create_driver(config: DriverConfig, defaults: &UixtConfig) -> Result<Arc<dyn AutomationDriver>> {
    let settings = SessionSettings::from_config(defaults);
    info!(backend = config.backend_name(), "creating driver");

    let driver: Arc<dyn AutomationDriver> = match config {
        DriverConfig::Adb { serial } => {
            let device = Arc::new(AndroidDevice::new(serial, defaults));
            Arc::new(AdbDriver::new(device, settings)?)
        }
        DriverConfig::Uia2 { serial, port } => {
            let device = Arc::new(AndroidDevice::new(serial, defaults));
            Arc::new(Uia2Driver::new(device, port.unwrap_or(defaults.uia2_port), settings)?)
        }
        DriverConfig::Wda { udid, port, mjpeg_port } => {
            let device = Arc::new(IOSDevice::new(udid, defaults));
            Arc::new(WdaDriver::new(
                device,
                port.unwrap_or(defaults.wda_port),
                mjpeg_port.unwrap_or(defaults.wda_mjpeg_port),
                settings,
            )?)
        }
        DriverConfig::Hdc { serial } => {
            let device = Arc::new(HarmonyDevice::new(serial, defaults));
            Arc::new(HdcDriver::new(device, settings)?)
        }
        DriverConfig::Browser {
            base_url,
            browser_id,
            width,
            height,
        } => {
            let base_url =
                base_url.unwrap_or_else(|| format!("http://127.0.0.1:{}", defaults.browser_port));
            let device = match browser_id {
                Some(id) => BrowserDevice::attach(base_url, id, defaults.request_timeout())?,
                None => BrowserDevice::new(base_url, width, height, defaults.request_timeout())?,
            };
            Arc::new(BrowserDriver::new(Arc::new(device), settings)?)
        }
        DriverConfig::Stub { base, port } => {
            let base = create_driver(*base, defaults)?;
            Arc::new(StubDriver::new(base, port.unwrap_or(defaults.stub_port)))
        }
    };
    Ok(driver)
}
