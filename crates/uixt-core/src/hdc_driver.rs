//! [`AutomationDriver`] implementation for HarmonyOS over `hdc shell`.
//!
//! Gestures and key events go through `uitest uiInput`, the screen size
//! through `hidumper`, and screenshots through `snapshot_display` followed by
//! `hdc file recv`.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::device::Device;
use crate::driver::{AutomationDriver, DriverError, Result};
use crate::geometry::{Orientation, Point, Size};
use crate::hdc::HarmonyDevice;
use crate::info::{AppInfo, BackendStatus, DeviceInfo};
use crate::log_capture::CaptureSlot;
use crate::options::ActionOptions;
use crate::session::{DriverSession, SessionSettings};
use crate::shell::{shell_quote, ShellChannel};

const KEYCODE_DEL: u32 = 2055;
const REMOTE_SNAPSHOT: &str = "/data/local/tmp/uixt_snapshot.jpeg";
const REMOTE_LAYOUT: &str = "/data/local/tmp/uixt_layout.json";
const DEFAULT_ABILITY: &str = "EntryAbility";

/// `uitest` swipe speeds are in px/s and clamped to this range.
const MIN_SWIPE_SPEED: f64 = 200.0;
const MAX_SWIPE_SPEED: f64 = 40_000.0;

/// Parses the active display mode out of `hidumper -s RenderService -a screen`.
pub fn parse_screen_size(output: &str) -> Option<Size> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"activeMode:\s*(\d+)x(\d+)").ok())
        .as_ref()?;
    let caps = re.captures(output)?;
    Some(Size::new(caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Parses `rotation=N` out of the same dump (0..3 quarter turns).
pub fn parse_screen_rotation(output: &str) -> Option<Orientation> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"rotation[=:]\s*(\d)").ok())
        .as_ref()?;
    let turns: u32 = re.captures(output)?[1].parse().ok()?;
    Some(Orientation::from_quarter_turns(turns))
}

/// Finds the foreground ability in `aa dump -l`.
pub fn parse_foreground_ability(output: &str) -> Option<AppInfo> {
    let mut bundle = None;
    let mut ability = None;
    for line in output.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("bundle name [") {
            bundle = rest.strip_suffix(']').map(str::to_string);
        } else if let Some(rest) = line.strip_prefix("ability name [") {
            ability = rest.strip_suffix(']').map(str::to_string);
        } else if line.starts_with("state #FOREGROUND") {
            if let Some(bundle) = bundle.take() {
                return Some(AppInfo {
                    activity: ability.take(),
                    ..AppInfo::new(bundle)
                });
            }
        }
    }
    None
}

/// Swipe speed for `uitest` so the gesture roughly takes `duration`.
pub fn swipe_speed(from: Point, to: Point, duration: Duration) -> u32 {
    let distance = ((to.x - from.x).powi(2) + (to.y - from.y).powi(2)).sqrt();
    let secs = duration.as_secs_f64().max(0.05);
    (distance / secs).clamp(MIN_SWIPE_SPEED, MAX_SWIPE_SPEED).round() as u32
}

/// HarmonyOS shell driver.
pub struct HdcDriver {
    device: Arc<HarmonyDevice>,
    session: Arc<DriverSession>,
    shell: ShellChannel,
    hilog: CaptureSlot,
}

impl HdcDriver {
    pub fn new(device: Arc<HarmonyDevice>, settings: SessionSettings) -> Result<Self> {
        let session = Arc::new(DriverSession::new(settings)?);
        let shell = device.shell().clone().with_session(session.clone());
        Ok(Self {
            device,
            session,
            shell,
            hilog: CaptureSlot::new(),
        })
    }

    async fn ui_input(&self, args: &str) -> Result<()> {
        let out = self.shell.shell(&format!("uitest uiInput {args}")).await?;
        if out.to_ascii_lowercase().contains("error") {
            return Err(DriverError::CommandFailed(format!("uiInput {args}: {out}")));
        }
        Ok(())
    }

    async fn screen_dump(&self) -> Result<String> {
        self.shell.shell("hidumper -s RenderService -a screen").await
    }
}

#[async_trait]
impl AutomationDriver for HdcDriver {
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
        if self.hilog.is_running().await {
            if let Err(e) = self.hilog.stop().await {
                warn!(error = %e, "failed to stop hilog capture during teardown");
            }
        }
        self.session.invalidate_screen_cache().await;
        Ok(())
    }

    async fn status(&self) -> Result<BackendStatus> {
        let out = self.shell.shell("echo ready").await?;
        Ok(BackendStatus {
            ready: out == "ready",
            message: Some(out),
            raw: serde_json::Value::Null,
        })
    }

    async fn device_info(&self) -> Result<DeviceInfo> {
        let model = self.device.param("const.product.model").await.ok();
        let brand = self.device.param("const.product.brand").await.ok();
        let os_version = self.device.param("const.product.software.version").await.ok();
        let sdk_version = self.device.param("const.ohos.apiversion").await.ok();
        Ok(DeviceInfo {
            model,
            brand,
            os_version,
            sdk_version,
            ..DeviceInfo::default()
        })
    }

    async fn foreground_info(&self) -> Result<AppInfo> {
        let out = self.shell.shell("aa dump -l").await?;
        parse_foreground_ability(&out).ok_or_else(|| DriverError::NotFound("foreground app".into()))
    }

    #[instrument(skip(self))]
    async fn fetch_window_size(&self) -> Result<Size> {
        let out = self.screen_dump().await?;
        let size = parse_screen_size(&out)
            .ok_or_else(|| DriverError::CommandFailed("no activeMode in hidumper output".into()))?;
        let orientation = parse_screen_rotation(&out).unwrap_or_default();
        debug!(width = size.width, height = size.height, ?orientation, "window size");
        Ok(size.for_orientation(orientation))
    }

    async fn orientation(&self) -> Result<Orientation> {
        let out = self.screen_dump().await?;
        Ok(parse_screen_rotation(&out).unwrap_or_default())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.shell
            .shell(&format!("snapshot_display -f {REMOTE_SNAPSHOT}"))
            .await?;
        let local: PathBuf = std::env::temp_dir().join(format!("uixt-{}.jpeg", Uuid::new_v4()));
        let local_str = local.to_string_lossy().into_owned();
        let received = self
            .shell
            .run(&["file", "recv", REMOTE_SNAPSHOT, &local_str])
            .await;
        let image = match received {
            Ok(_) => tokio::fs::read(&local).await.map_err(DriverError::from),
            Err(e) => Err(e),
        };
        let _ = tokio::fs::remove_file(&local).await;
        let _ = self.shell.shell(&format!("rm -f {REMOTE_SNAPSHOT}")).await;
        image
    }

    async fn source(&self, _opts: &ActionOptions) -> Result<String> {
        self.shell
            .shell(&format!("uitest dumpLayout -p {REMOTE_LAYOUT}"))
            .await?;
        let layout = self.shell.shell(&format!("cat {REMOTE_LAYOUT}")).await?;
        let _ = self.shell.shell(&format!("rm -f {REMOTE_LAYOUT}")).await;
        Ok(layout)
    }

    #[instrument(skip(self, _opts))]
    async fn tap_abs_xy(&self, x: f64, y: f64, _opts: &ActionOptions) -> Result<()> {
        self.ui_input(&format!("click {x:.0} {y:.0}")).await
    }

    async fn double_tap_abs_xy(&self, x: f64, y: f64, _opts: &ActionOptions) -> Result<()> {
        self.ui_input(&format!("doubleClick {x:.0} {y:.0}")).await
    }

    async fn touch_and_hold_abs_xy(&self, x: f64, y: f64, _opts: &ActionOptions) -> Result<()> {
        self.ui_input(&format!("longClick {x:.0} {y:.0}")).await
    }

    async fn drag_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        let speed = swipe_speed(from, to, opts.swipe_duration());
        self.ui_input(&format!(
            "drag {:.0} {:.0} {:.0} {:.0} {speed}",
            from.x, from.y, to.x, to.y
        ))
        .await
    }

    #[instrument(skip(self, opts))]
    async fn swipe_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        let speed = swipe_speed(from, to, opts.swipe_duration());
        self.ui_input(&format!(
            "swipe {:.0} {:.0} {:.0} {:.0} {speed}",
            from.x, from.y, to.x, to.y
        ))
        .await
    }

    async fn input(&self, text: &str, _opts: &ActionOptions) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.ui_input(&format!("text {}", shell_quote(text))).await
    }

    async fn backspace(&self, count: usize, _opts: &ActionOptions) -> Result<()> {
        for _ in 0..count {
            self.ui_input(&format!("keyEvent {KEYCODE_DEL}")).await?;
        }
        Ok(())
    }

    async fn home(&self) -> Result<()> {
        self.ui_input("keyEvent Home").await
    }

    async fn back(&self) -> Result<()> {
        self.ui_input("keyEvent Back").await
    }

    /// Accepts `bundle` or `bundle/ability`.
    async fn app_launch(&self, package: &str) -> Result<()> {
        let (bundle, ability) = package.split_once('/').unwrap_or((package, DEFAULT_ABILITY));
        let out = self
            .shell
            .shell(&format!(
                "aa start -b {} -a {}",
                shell_quote(bundle),
                shell_quote(ability)
            ))
            .await?;
        if !out.contains("successfully") {
            return Err(DriverError::CommandFailed(format!("aa start {package}: {out}")));
        }
        Ok(())
    }

    async fn app_terminate(&self, package: &str) -> Result<bool> {
        let bundle = shell_quote(package.split('/').next().unwrap_or(package));
        let running = match self.shell.shell(&format!("pidof {bundle}")).await {
            Ok(pid) => !pid.is_empty(),
            Err(DriverError::CommandFailed(_)) => false,
            Err(e) => return Err(e),
        };
        if !running {
            return Ok(false);
        }
        self.shell.shell(&format!("aa force-stop {bundle}")).await?;
        Ok(true)
    }

    async fn app_clear(&self, package: &str) -> Result<()> {
        let bundle = shell_quote(package);
        self.shell.shell(&format!("bm clean -n {bundle} -d")).await?;
        self.shell.shell(&format!("bm clean -n {bundle} -c")).await?;
        Ok(())
    }

    async fn start_capture_log(&self, identifier: &str) -> Result<()> {
        let _ = self.shell.shell("hilog -r").await;
        let command = self.shell.command_line(["shell", "hilog"]);
        self.hilog.start(command, identifier).await
    }

    async fn stop_capture_log(&self) -> Result<Vec<String>> {
        self.hilog.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_size_and_rotation() {
        let out = "[screen] id=0, powerstatus=POWER_STATUS_ON, backlight=255, screenType=REAL, \
                   render size: 1260x2720, physical screen resolution: 1260x2720, isvirtual=false\n\
                   supportedMode:\n    1260x2720, refreshrate=120\nactiveMode: 1260x2720, refreshrate=120\n\
                   ModeId=0, rotation=1\n";
        assert_eq!(parse_screen_size(out), Some(Size::new(1260.0, 2720.0)));
        assert_eq!(parse_screen_rotation(out), Some(Orientation::LandscapeLeft));
    }

    #[test]
    fn foreground_ability() {
        let out = "  Mission ID #12\n    AbilityRecord ID #3\n      app name [com.example.app]\n      \
                   bundle name [com.example.app]\n      ability name [EntryAbility]\n      \
                   state #FOREGROUND\n";
        let app = parse_foreground_ability(out).unwrap();
        assert_eq!(app.package_name, "com.example.app");
        assert_eq!(app.activity.as_deref(), Some("EntryAbility"));

        let bg = "bundle name [com.a]\nability name [Main]\nstate #BACKGROUND\n";
        assert!(parse_foreground_ability(bg).is_none());
    }

    #[test]
    fn swipe_speed_is_clamped() {
        let from = Point::new(500.0, 1500.0);
        let to = Point::new(500.0, 500.0);
        assert_eq!(swipe_speed(from, to, Duration::from_millis(500)), 2000);
        assert_eq!(swipe_speed(from, from, Duration::from_millis(500)), 200);
        assert_eq!(swipe_speed(from, to, Duration::from_millis(0)), 20_000);
    }
}
