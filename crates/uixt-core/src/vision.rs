//! Vision-augmented driver facade.
//!
//! [`VisionDriver`] wraps any [`AutomationDriver`] and an [`ImageRecognizer`]
//! and adds the intent-level operations: tap a text found by OCR, tap an icon
//! found by UI detection, dismiss popups and swipe until something shows up.
//!
//! Recognition boxes are in screenshot pixels. Taps are mapped onto the
//! driver's window size before being sent, so backends whose screenshots are
//! downscaled still receive device pixels.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::driver::{AutomationDriver, DriverError, ErrorKind, Result};
use crate::geometry::{Point, Size};
use crate::options::{ActionOptions, Direction, ScreenShotOptions};
use crate::recognition::{image_resolution, ImageRecognizer, Recognition, ScreenResult};
use crate::search;

/// Attempts made by [`VisionDriver::get_screen_result`].
pub const SCREEN_RESULT_ATTEMPTS: usize = 3;

const RETRY_PAUSE: Duration = Duration::from_millis(200);

pub struct VisionDriver {
    driver: Arc<dyn AutomationDriver>,
    recognizer: Arc<dyn ImageRecognizer>,
}

impl VisionDriver {
    pub fn new(driver: Arc<dyn AutomationDriver>, recognizer: Arc<dyn ImageRecognizer>) -> Self {
        Self { driver, recognizer }
    }

    pub fn driver(&self) -> &Arc<dyn AutomationDriver> {
        &self.driver
    }

    // -----------------------------------------------------------------------
    // Screen results
    // -----------------------------------------------------------------------

    /// Captures the screen, runs the requested recognition passes and caches
    /// the result in the session.
    ///
    /// Transport and recognition failures are retried up to
    /// [`SCREEN_RESULT_ATTEMPTS`] times.
    pub async fn get_screen_result(&self, opts: &ScreenShotOptions) -> Result<Arc<ScreenResult>> {
        let mut last_err = DriverError::Recognition("no attempt made".into());
        for attempt in 1..=SCREEN_RESULT_ATTEMPTS {
            match self.capture(opts).await {
                Ok(result) => {
                    let result = Arc::new(result);
                    self.driver.session().push_screen_result(result.clone()).await;
                    return Ok(result);
                }
                Err(e) if e.is_transport() || e.kind() == ErrorKind::Recognition => {
                    warn!(attempt, error = %e, "screen result attempt failed");
                    last_err = e;
                    if attempt < SCREEN_RESULT_ATTEMPTS {
                        tokio::time::sleep(RETRY_PAUSE).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn capture(&self, opts: &ScreenShotOptions) -> Result<ScreenResult> {
        let started = Instant::now();
        let image = self.driver.screenshot().await?;
        let resolution = match image_resolution(&image) {
            Ok(size) => size,
            Err(e) => {
                debug!(error = %e, "falling back to window size for screenshot resolution");
                self.driver.window_size().await?
            }
        };
        let recognition = if opts.needs_recognition() {
            self.recognizer.recognize(&image, opts).await?
        } else {
            Recognition::default()
        };
        let result = ScreenResult::new(image, resolution, recognition, started.elapsed());
        debug!(
            id = %result.id,
            texts = result.texts.len(),
            icons = result.icons.total(),
            elapsed_ms = result.elapsed_ms,
            "screen result captured"
        );
        Ok(result)
    }

    fn ocr_options(opts: &ActionOptions) -> ScreenShotOptions {
        let mut shot = opts.screenshot.clone();
        shot.with_ocr = true;
        shot
    }

    fn ui_options(opts: &ActionOptions, ui_types: &[String]) -> ScreenShotOptions {
        let mut shot = opts.screenshot.clone();
        shot.with_ui_types = ui_types.to_vec();
        shot
    }

    /// Taps a point given in screenshot pixels.
    async fn tap_screen_point(&self, point: Point, resolution: Size, opts: &ActionOptions) -> Result<()> {
        let window = self.driver.window_size().await?;
        let scale_x = if resolution.width > 0.0 { window.width / resolution.width } else { 1.0 };
        let scale_y = if resolution.height > 0.0 { window.height / resolution.height } else { 1.0 };
        let target = opts.apply_offset(Point::new(point.x * scale_x, point.y * scale_y));
        self.driver.tap_abs_xy(target.x, target.y, opts).await
    }

    // -----------------------------------------------------------------------
    // Vision taps
    // -----------------------------------------------------------------------

    /// Taps the text found by OCR. Honours scope, regex, index and
    /// `ignore_not_found`.
    #[instrument(skip(self, opts))]
    pub async fn tap_by_ocr(&self, text: &str, opts: &ActionOptions) -> Result<()> {
        let screen = self.get_screen_result(&Self::ocr_options(opts)).await?;
        let hit = match screen.find_text(text, opts) {
            Ok(hit) => hit,
            Err(e) if e.is_not_found() && opts.ignore_not_found => {
                info!(text, "text not found, ignored");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.tap_screen_point(hit.center(), screen.resolution, opts).await
    }

    /// Taps the first icon of any of `ui_types`.
    #[instrument(skip(self, opts))]
    pub async fn tap_by_ui_detection(&self, ui_types: &[String], opts: &ActionOptions) -> Result<()> {
        if ui_types.is_empty() {
            return Err(DriverError::InvalidParams("no ui types to detect".into()));
        }
        let screen = self.get_screen_result(&Self::ui_options(opts, ui_types)).await?;
        let hit = match screen.find_ui(ui_types, opts) {
            Ok(hit) => hit,
            Err(e) if e.is_not_found() && opts.ignore_not_found => {
                info!(?ui_types, "ui type not found, ignored");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.tap_screen_point(hit.rect.center(), screen.resolution, opts).await
    }

    // -----------------------------------------------------------------------
    // Popups
    // -----------------------------------------------------------------------

    /// Dismisses popups reported by the recognition service.
    ///
    /// Each round captures a screen with popup detection; a reported close
    /// button is tapped, an absent popup ends the call. Returns the number of
    /// popups closed, so a screen without popups yields `Ok(0)` and no tap.
    /// `max_retry_times` bounds the rounds (default one).
    #[instrument(skip(self, opts))]
    pub async fn close_popups(&self, opts: &ActionOptions) -> Result<usize> {
        let rounds = opts.max_retry_times.unwrap_or(1).max(1);
        let mut shot = opts.screenshot.clone();
        shot.with_close_popup = true;

        let mut closed = 0;
        for round in 1..=rounds {
            let screen = self.get_screen_result(&shot).await?;
            let Some(close_point) = screen.popup.as_ref().and_then(|p| p.close_point()) else {
                debug!(round, "no popup detected");
                break;
            };
            info!(round, x = close_point.x, y = close_point.y, "closing popup");
            self.tap_screen_point(close_point, screen.resolution, &ActionOptions::new())
                .await?;
            closed += 1;
            if round < rounds {
                tokio::time::sleep(opts.interval()).await;
            }
        }
        Ok(closed)
    }

    // -----------------------------------------------------------------------
    // Swipe search
    // -----------------------------------------------------------------------

    /// Swipes until the OCR text `app_name` is visible, then taps it.
    ///
    /// Starts from the home screen and swipes left unless `opts.direction`
    /// says otherwise.
    #[instrument(skip(self, opts))]
    pub async fn swipe_to_tap_app(&self, app_name: &str, opts: &ActionOptions) -> Result<()> {
        self.driver.home().await?;
        let mut opts = opts.clone();
        if opts.direction.is_none() {
            opts.direction = Some(Direction::Left.into());
        }
        self.swipe_to_tap_texts(&[app_name.to_string()], &opts).await
    }

    pub async fn swipe_to_tap_text(&self, text: &str, opts: &ActionOptions) -> Result<()> {
        self.swipe_to_tap_texts(&[text.to_string()], opts).await
    }

    /// Swipes until one of `texts` is visible, then taps the first one found.
    #[instrument(skip(self, opts))]
    pub async fn swipe_to_tap_texts(&self, texts: &[String], opts: &ActionOptions) -> Result<()> {
        if texts.is_empty() {
            return Err(DriverError::InvalidParams("no texts to search for".into()));
        }
        let mut find_opts = opts.clone();
        find_opts.match_one = true;
        let shot = Self::ocr_options(opts);

        let outcome = self
            .swipe_until(
                opts,
                |screen: Arc<ScreenResult>| {
                    let hits = screen.find_texts(texts, &find_opts)?;
                    let hit = hits
                        .into_iter()
                        .next()
                        .ok_or_else(|| DriverError::NotFound(format!("texts {texts:?}")))?;
                    Ok((hit.center(), screen.resolution))
                },
                &shot,
            )
            .await;

        match outcome {
            Ok((point, resolution)) => self.tap_screen_point(point, resolution, opts).await,
            Err(e) if e.is_not_found() && opts.ignore_not_found => {
                info!(?texts, "texts not found after swiping, ignored");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Swipes in `opts.direction` until `check` accepts a fresh screen.
    pub async fn swipe_until<T, K>(&self, opts: &ActionOptions, check: K, shot: &ScreenShotOptions) -> Result<T>
    where
        T: Send,
        K: Fn(Arc<ScreenResult>) -> Result<T> + Send + Sync,
    {
        let driver = &self.driver;
        let check = &check;
        search::loop_until(
            opts,
            move || Box::pin(driver.swipe_direction(opts)),
            move || {
                Box::pin(async move {
                    let screen = self.get_screen_result(shot).await?;
                    check(screen)
                })
            },
            |found| Box::pin(async move { Ok(found) }),
        )
        .await
    }
}
