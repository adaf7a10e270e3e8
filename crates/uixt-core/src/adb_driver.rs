//! [`AutomationDriver`] implementation over plain `adb shell` commands.
//!
//! [`AdbDriver`] needs nothing installed on the device: gestures go through
//! `input`, introspection through `wm`, `dumpsys` and `getprop`, and the
//! screenshot through `exec-out screencap -p`, which returns PNG bytes
//! without any text decoding.
//!
//! Textual output is parsed with the small `parse_*` helpers in this module;
//! they are public so other Android backends can reuse them.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::adb::AndroidDevice;
use crate::device::Device;
use crate::driver::{AutomationDriver, DriverError, Result};
use crate::geometry::{Orientation, Point, Rotation, Size};
use crate::info::{AppInfo, BackendStatus, BatteryInfo, BatteryState, DeviceInfo};
use crate::log_capture::CaptureSlot;
use crate::options::ActionOptions;
use crate::session::{DriverSession, SessionSettings};
use crate::shell::{shell_quote, ShellChannel};

const KEYCODE_HOME: u32 = 3;
const KEYCODE_BACK: u32 = 4;
const KEYCODE_DEL: u32 = 67;

const SCREEN_RECORD_PATH: &str = "/sdcard/uixt_record.mp4";
const UI_DUMP_PATH: &str = "/sdcard/uixt_window_dump.xml";

// ---------------------------------------------------------------------------
// Output parsers
// ---------------------------------------------------------------------------

fn regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Parses `wm size`, preferring the override size when present.
pub fn parse_wm_size(output: &str) -> Option<Size> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = regex(&RE, r"(Physical|Override) size:\s*(\d+)x(\d+)")?;
    let mut physical = None;
    let mut override_size = None;
    for caps in re.captures_iter(output) {
        let size = Size::new(caps[2].parse().ok()?, caps[3].parse().ok()?);
        if &caps[1] == "Override" {
            override_size = Some(size);
        } else {
            physical = Some(size);
        }
    }
    override_size.or(physical)
}

/// Parses `SurfaceOrientation: N` out of `dumpsys input`.
pub fn parse_surface_orientation(output: &str) -> Option<Orientation> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = regex(&RE, r"SurfaceOrientation:\s*(\d)")?;
    let turns: u32 = re.captures(output)?[1].parse().ok()?;
    Some(Orientation::from_quarter_turns(turns))
}

/// Parses `mCurrentFocus` (or `mFocusedApp`) out of `dumpsys window`.
pub fn parse_focused_app(output: &str) -> Option<AppInfo> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = regex(
        &RE,
        r"(?:mCurrentFocus|mFocusedApp)=.*?\s([A-Za-z0-9_.]+)/([A-Za-z0-9_.$]+)",
    )?;
    let caps = re.captures(output)?;
    let package = caps[1].to_string();
    let mut activity = caps[2].to_string();
    if activity.starts_with('.') {
        activity = format!("{package}{activity}");
    }
    Some(AppInfo {
        activity: Some(activity),
        ..AppInfo::new(package)
    })
}

/// Parses `getprop` into a key/value map.
pub fn parse_getprop(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once("]: [")?;
            Some((
                key.trim_start_matches('[').to_string(),
                value.trim_end_matches(']').to_string(),
            ))
        })
        .collect()
}

/// Parses `dumpsys battery`.
pub fn parse_battery(output: &str) -> Option<BatteryInfo> {
    let mut level = None;
    let mut scale = 100.0;
    let mut state = BatteryState::Unknown;
    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "level" => level = value.parse::<f64>().ok(),
            "scale" => scale = value.parse::<f64>().unwrap_or(100.0),
            "status" => {
                state = match value {
                    "2" => BatteryState::Charging,
                    "3" => BatteryState::Discharging,
                    "4" => BatteryState::NotCharging,
                    "5" => BatteryState::Full,
                    _ => BatteryState::Unknown,
                }
            }
            _ => {}
        }
    }
    let level = level?;
    let level = if scale > 0.0 { level * 100.0 / scale } else { level };
    Some(BatteryInfo { level, state })
}

/// Escapes text for `input text`: spaces become `%s`, the rest is quoted.
pub fn escape_input_text(text: &str) -> String {
    shell_quote(&text.replace(' ', "%s"))
}

// ---------------------------------------------------------------------------
// AdbDriver
// ---------------------------------------------------------------------------

/// Shell-only Android driver.
pub struct AdbDriver {
    device: Arc<AndroidDevice>,
    session: Arc<DriverSession>,
    shell: ShellChannel,
    logcat: CaptureSlot,
}

impl AdbDriver {
    pub fn new(device: Arc<AndroidDevice>, settings: SessionSettings) -> Result<Self> {
        let session = Arc::new(DriverSession::new(settings)?);
        let shell = device.shell().clone().with_session(session.clone());
        Ok(Self {
            device,
            session,
            shell,
            logcat: CaptureSlot::new(),
        })
    }

    pub fn android_device(&self) -> &Arc<AndroidDevice> {
        &self.device
    }

    /// The session-recording shell channel used by this driver.
    pub fn shell(&self) -> &ShellChannel {
        &self.shell
    }

    async fn keyevent(&self, code: u32) -> Result<()> {
        self.shell.shell(&format!("input keyevent {code}")).await?;
        Ok(())
    }

    async fn current_orientation(&self) -> Result<Orientation> {
        let out = self.shell.shell("dumpsys input").await?;
        Ok(parse_surface_orientation(&out).unwrap_or_default())
    }
}

#[async_trait]
impl AutomationDriver for AdbDriver {
    fn device(&self) -> Arc<dyn Device> {
        self.device.clone()
    }

    fn session(&self) -> &DriverSession {
        &self.session
    }

    async fn setup(&self) -> Result<()> {
        self.device.setup().await
    }

    async fn teardown(&self) -> Result<()> {
        if self.logcat.is_running().await {
            if let Err(e) = self.logcat.stop().await {
                warn!(error = %e, "failed to stop logcat capture during teardown");
            }
        }
        self.session.invalidate_screen_cache().await;
        Ok(())
    }

    async fn status(&self) -> Result<BackendStatus> {
        let state = self.shell.run(&["get-state"]).await?;
        Ok(BackendStatus {
            ready: state == "device",
            message: Some(state),
            raw: serde_json::Value::Null,
        })
    }

    async fn device_info(&self) -> Result<DeviceInfo> {
        let props = parse_getprop(&self.shell.shell("getprop").await?);
        let get = |key: &str| props.get(key).filter(|v| !v.is_empty()).cloned();
        let mut info = DeviceInfo {
            model: get("ro.product.model"),
            brand: get("ro.product.brand"),
            os_version: get("ro.build.version.release"),
            sdk_version: get("ro.build.version.sdk"),
            ..DeviceInfo::default()
        };
        if let Some(abi) = get("ro.product.cpu.abi") {
            info.extra.insert("abi".into(), abi.into());
        }
        info.extra
            .insert("serial".into(), self.device.uuid().to_string().into());
        Ok(info)
    }

    async fn battery_info(&self) -> Result<BatteryInfo> {
        let out = self.shell.shell("dumpsys battery").await?;
        parse_battery(&out)
            .ok_or_else(|| DriverError::CommandFailed(format!("unexpected dumpsys battery output: {out}")))
    }

    async fn foreground_info(&self) -> Result<AppInfo> {
        let out = self.shell.shell("dumpsys window windows").await?;
        parse_focused_app(&out).ok_or_else(|| DriverError::NotFound("foreground app".into()))
    }

    #[instrument(skip(self))]
    async fn fetch_window_size(&self) -> Result<Size> {
        let out = self.shell.shell("wm size").await?;
        let size = parse_wm_size(&out)
            .ok_or_else(|| DriverError::CommandFailed(format!("unexpected wm size output: {out}")))?;
        let orientation = self.current_orientation().await?;
        let size = size.for_orientation(orientation);
        debug!(width = size.width, height = size.height, ?orientation, "window size");
        Ok(size)
    }

    async fn orientation(&self) -> Result<Orientation> {
        self.current_orientation().await
    }

    async fn rotation(&self) -> Result<Rotation> {
        let turns = match self.current_orientation().await? {
            Orientation::Portrait => 0,
            Orientation::LandscapeLeft => 1,
            Orientation::PortraitUpsideDown => 2,
            Orientation::LandscapeRight => 3,
        };
        Ok(Rotation::z(turns * 90))
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let png = self.shell.exec_out("screencap -p").await?;
        if png.is_empty() {
            return Err(DriverError::CommandFailed("screencap returned no data".into()));
        }
        Ok(png)
    }

    async fn screen_record(&self, duration: Duration) -> Result<Vec<u8>> {
        let secs = duration.as_secs().clamp(1, 180);
        self.shell
            .shell_with_timeout(
                &format!("screenrecord --time-limit {secs} {SCREEN_RECORD_PATH}"),
                duration + self.shell.timeout(),
            )
            .await?;
        let video = self.shell.exec_out(&format!("cat {SCREEN_RECORD_PATH}")).await?;
        let _ = self.shell.shell(&format!("rm -f {SCREEN_RECORD_PATH}")).await;
        Ok(video)
    }

    async fn source(&self, _opts: &ActionOptions) -> Result<String> {
        self.shell
            .shell(&format!("uiautomator dump {UI_DUMP_PATH}"))
            .await?;
        let xml = self.shell.shell(&format!("cat {UI_DUMP_PATH}")).await?;
        let _ = self.shell.shell(&format!("rm -f {UI_DUMP_PATH}")).await;
        Ok(xml)
    }

    async fn set_rotation(&self, rotation: Rotation) -> Result<()> {
        let turns = rotation.z.rem_euclid(360) / 90;
        self.shell
            .shell("settings put system accelerometer_rotation 0")
            .await?;
        self.shell
            .shell(&format!("settings put system user_rotation {turns}"))
            .await?;
        self.session.invalidate_screen_cache().await;
        Ok(())
    }

    async fn set_ime(&self, ime: &str) -> Result<()> {
        let ime = shell_quote(ime);
        self.shell.shell(&format!("ime enable {ime}")).await?;
        self.shell.shell(&format!("ime set {ime}")).await?;
        Ok(())
    }

    #[instrument(skip(self, _opts))]
    async fn tap_abs_xy(&self, x: f64, y: f64, _opts: &ActionOptions) -> Result<()> {
        self.shell
            .shell(&format!("input tap {x:.0} {y:.0}"))
            .await?;
        Ok(())
    }

    async fn double_tap_abs_xy(&self, x: f64, y: f64, _opts: &ActionOptions) -> Result<()> {
        let tap = format!("input tap {x:.0} {y:.0}");
        self.shell.shell(&format!("{tap} && {tap}")).await?;
        Ok(())
    }

    async fn touch_and_hold_abs_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()> {
        let ms = opts.press_duration().as_millis();
        self.shell
            .shell(&format!("input swipe {x:.0} {y:.0} {x:.0} {y:.0} {ms}"))
            .await?;
        Ok(())
    }

    async fn drag_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        let ms = opts.swipe_duration().as_millis();
        self.shell
            .shell(&format!(
                "input draganddrop {:.0} {:.0} {:.0} {:.0} {ms}",
                from.x, from.y, to.x, to.y
            ))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, opts))]
    async fn swipe_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        let ms = opts.swipe_duration().as_millis();
        self.shell
            .shell(&format!(
                "input swipe {:.0} {:.0} {:.0} {:.0} {ms}",
                from.x, from.y, to.x, to.y
            ))
            .await?;
        Ok(())
    }

    async fn input(&self, text: &str, _opts: &ActionOptions) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.shell
            .shell(&format!("input text {}", escape_input_text(text)))
            .await?;
        Ok(())
    }

    async fn backspace(&self, count: usize, _opts: &ActionOptions) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let codes = vec![KEYCODE_DEL.to_string(); count].join(" ");
        self.shell.shell(&format!("input keyevent {codes}")).await?;
        Ok(())
    }

    async fn home(&self) -> Result<()> {
        self.keyevent(KEYCODE_HOME).await
    }

    async fn back(&self) -> Result<()> {
        self.keyevent(KEYCODE_BACK).await
    }

    async fn app_launch(&self, package: &str) -> Result<()> {
        let out = self
            .shell
            .shell(&format!(
                "monkey -p {} -c android.intent.category.LAUNCHER 1",
                shell_quote(package)
            ))
            .await?;
        if out.contains("No activities found") || out.contains("monkey aborted") {
            return Err(DriverError::NotFound(format!("launchable activity for {package}")));
        }
        Ok(())
    }

    async fn app_terminate(&self, package: &str) -> Result<bool> {
        let package = shell_quote(package);
        let running = match self.shell.shell(&format!("pidof {package}")).await {
            Ok(pid) => !pid.is_empty(),
            Err(DriverError::CommandFailed(_)) => false,
            Err(e) => return Err(e),
        };
        if !running {
            return Ok(false);
        }
        self.shell.shell(&format!("am force-stop {package}")).await?;
        Ok(true)
    }

    async fn app_clear(&self, package: &str) -> Result<()> {
        let out = self
            .shell
            .shell(&format!("pm clear {}", shell_quote(package)))
            .await?;
        if !out.contains("Success") {
            return Err(DriverError::CommandFailed(format!("pm clear {package}: {out}")));
        }
        Ok(())
    }

    async fn start_capture_log(&self, identifier: &str) -> Result<()> {
        self.shell.run(&["logcat", "-c"]).await?;
        let command = self.shell.command_line(["logcat", "-v", "time"]);
        self.logcat.start(command, identifier).await
    }

    async fn stop_capture_log(&self) -> Result<Vec<String>> {
        self.logcat.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wm_size_prefers_override() {
        assert_eq!(
            parse_wm_size("Physical size: 1080x2400"),
            Some(Size::new(1080.0, 2400.0))
        );
        assert_eq!(
            parse_wm_size("Physical size: 1440x3200\nOverride size: 1080x2400"),
            Some(Size::new(1080.0, 2400.0))
        );
        assert_eq!(parse_wm_size("error"), None);
    }

    #[test]
    fn surface_orientation() {
        let out = "  Viewport: ...\n    SurfaceOrientation: 1\n    Translation...";
        assert_eq!(parse_surface_orientation(out), Some(Orientation::LandscapeLeft));
        assert_eq!(parse_surface_orientation("nothing"), None);
    }

    #[test]
    fn focused_app() {
        let out = "  mCurrentFocus=Window{a1b2c3 u0 com.android.settings/.Settings}\n";
        let app = parse_focused_app(out).unwrap();
        assert_eq!(app.package_name, "com.android.settings");
        assert_eq!(app.activity.as_deref(), Some("com.android.settings.Settings"));

        let out = "mCurrentFocus=Window{4f u0 com.example.app/com.example.app.MainActivity}";
        let app = parse_focused_app(out).unwrap();
        assert_eq!(app.activity.as_deref(), Some("com.example.app.MainActivity"));
    }

    #[test]
    fn getprop_and_battery() {
        let props = parse_getprop("[ro.product.model]: [Pixel 7]\n[ro.build.version.sdk]: [34]\n");
        assert_eq!(props["ro.product.model"], "Pixel 7");
        assert_eq!(props["ro.build.version.sdk"], "34");

        let battery = parse_battery("Current Battery Service state:\n  status: 2\n  level: 85\n  scale: 100\n").unwrap();
        assert_eq!(battery.level, 85.0);
        assert_eq!(battery.state, BatteryState::Charging);
        assert!(parse_battery("garbage").is_none());
    }

    #[test]
    fn input_text_escaping() {
        assert_eq!(escape_input_text("hello"), "hello");
        assert_eq!(escape_input_text("hello world"), "hello%sworld");
        assert_eq!(escape_input_text("a&b"), "'a&b'");
    }
}
