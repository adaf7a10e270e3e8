//! # uixt-core
//!
//! Unified device-driver layer for Android, iOS, HarmonyOS and browser UI
//! automation.
//!
//! Every backend implements one capability contract,
//! [`AutomationDriver`](driver::AutomationDriver). A caller picks a backend
//! with a [`DriverConfig`](driver::DriverConfig), wraps the driver in a
//! [`VisionDriver`](vision::VisionDriver) for OCR and icon lookups, and issues
//! either direct calls or data-described actions through the
//! [`ActionExecutor`](executor::ActionExecutor).
//!
//! ## Modules
//!
//! - [`driver`] - The driver contract, error taxonomy and backend selection
//! - [`session`] - HTTP transport with reset-and-retry, request history and screen cache
//! - [`adb_driver`], [`uia2_driver`], [`wda_driver`], [`hdc_driver`], [`browser_driver`], [`stub_driver`] - Backends
//! - [`adb`], [`ios`], [`hdc`], [`browser`] - Devices: lifecycle, packages, port forwards
//! - [`recognition`], [`vision`] - Screenshot recognition and intent-level taps
//! - [`search`] - Swipe-until-found loop
//! - [`action`], [`params`], [`executor`] - Action interpreter
//! - [`config`], [`logging`] - Ambient configuration and tracing setup
//!
//! ## External Dependencies
//!
//! Backends shell out to the platform tools when they need them:
//!
//! - **adb** - Android devices (ADB and UiAutomator2 backends)
//! - **hdc** - HarmonyOS devices
//! - **usbmuxd**, **ideviceinstaller**, **idevicesyslog** - iOS devices
//!
//! ## Example
//!
//! ```no_run
//! use uixt_core::config::UixtConfig;
//! use uixt_core::driver::DriverConfig;
//! use uixt_core::factory::create_driver;
//! use uixt_core::options::ActionOptions;
//!
//! # async fn example() -> Result<(), uixt_core::driver::DriverError> {
//! let config = DriverConfig::Uia2 { serial: "emulator-5554".to_string(), port: None };
//! let driver = create_driver(config, &UixtConfig::load())?;
//!
//! driver.setup().await?;
//! driver.tap_xy(0.5, 0.5, &ActionOptions::new()).await?;
//! driver.teardown().await?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod adb;
pub mod adb_driver;
pub mod browser;
pub mod browser_driver;
pub mod config;
pub mod device;
pub mod driver;
pub mod e2e_delay;
pub mod executor;
pub mod factory;
pub mod forward;
pub mod geometry;
pub mod hdc;
pub mod hdc_driver;
pub mod info;
pub mod ios;
pub mod log_capture;
pub mod logging;
pub mod options;
pub mod params;
pub mod recognition;
pub mod search;
pub mod session;
pub mod shell;
pub mod stub_client;
pub mod stub_driver;
pub mod stub_protocol;
pub mod uia2_driver;
pub mod usb_tunnel;
pub mod vision;
pub mod wda_driver;
pub mod webdriver;
