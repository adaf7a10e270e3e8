//! Screen geometry shared by every backend.
//!
//! All drivers work in absolute device pixels. Callers may express positions
//! relative to the screen (`0.0..=1.0` on each axis); [`to_absolute_point`]
//! and [`to_absolute_swipe`] are the only places where relative coordinates
//! become pixels, and they reject out-of-range input before anything reaches
//! the wire.

use serde::{Deserialize, Serialize};

use crate::driver::DriverError;

/// Screen dimensions in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Returns the size as it appears in the given orientation.
    ///
    /// Backends disagree on whether they report the natural or the rotated
    /// size, so this normalizes to "long side vertical" in portrait and "long
    /// side horizontal" in landscape instead of blindly swapping.
    pub fn for_orientation(self, orientation: Orientation) -> Self {
        let (short, long) = if self.width <= self.height {
            (self.width, self.height)
        } else {
            (self.height, self.width)
        };
        if orientation.is_landscape() {
            Size::new(long, short)
        } else {
            Size::new(short, long)
        }
    }

    pub fn scaled(self, factor: f64) -> Self {
        Size::new(self.width * factor, self.height * factor)
    }
}

/// A point in absolute device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle in absolute device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Builds a rectangle from `[x1, y1, x2, y2]` corner coordinates.
    pub fn from_corners(corners: [f64; 4]) -> Self {
        let [x1, y1, x2, y2] = corners;
        Rect::new(x1.min(x2), y1.min(y2), (x2 - x1).abs(), (y2 - y1).abs())
    }

    pub fn max_x(&self) -> f64 {
        self.x + self.width
    }

    pub fn max_y(&self) -> f64 {
        self.y + self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// True when `other` lies entirely inside `self` (edges inclusive).
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.max_x() <= self.max_x()
            && other.max_y() <= self.max_y()
    }
}

/// Device orientation as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Orientation {
    #[default]
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

impl Orientation {
    pub fn is_landscape(self) -> bool {
        matches!(self, Orientation::LandscapeLeft | Orientation::LandscapeRight)
    }

    /// Maps a surface rotation index (0, 1, 2, 3 quarter turns) to an orientation.
    pub fn from_quarter_turns(turns: u32) -> Self {
        match turns % 4 {
            1 => Orientation::LandscapeLeft,
            2 => Orientation::PortraitUpsideDown,
            3 => Orientation::LandscapeRight,
            _ => Orientation::Portrait,
        }
    }

    /// Parses the upper-case names used by the WebDriver-style servers.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PORTRAIT" | "UIA_DEVICE_ORIENTATION_PORTRAIT" => Some(Orientation::Portrait),
            "PORTRAIT_UPSIDEDOWN" | "PORTRAIT_UPSIDE_DOWN" | "UIA_DEVICE_ORIENTATION_PORTRAIT_UPSIDEDOWN" => {
                Some(Orientation::PortraitUpsideDown)
            }
            "LANDSCAPE" | "LANDSCAPE_LEFT" | "UIA_DEVICE_ORIENTATION_LANDSCAPELEFT" => {
                Some(Orientation::LandscapeLeft)
            }
            "LANDSCAPE_RIGHT" | "UIA_DEVICE_ORIENTATION_LANDSCAPERIGHT" => {
                Some(Orientation::LandscapeRight)
            }
            _ => None,
        }
    }
}

/// Device rotation in degrees around each axis (only `z` matters for phones).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Rotation {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Rotation {
    pub fn z(z: i32) -> Self {
        Self { x: 0, y: 0, z }
    }
}

/// Checks that a relative coordinate pair lies within `[0, 1]`.
pub fn validate_relative(x: f64, y: f64) -> Result<(), DriverError> {
    let in_range = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
    if in_range(x) && in_range(y) {
        Ok(())
    } else {
        Err(DriverError::InvalidCoordinate { x, y })
    }
}

/// Converts a relative point into absolute pixels using `size`.
pub fn to_absolute_point(x: f64, y: f64, size: Size) -> Result<Point, DriverError> {
    validate_relative(x, y)?;
    Ok(Point::new(x * size.width, y * size.height))
}

/// Converts a relative `(from, to)` pair into absolute pixels.
///
/// Both points are validated before either is converted, so a bad `to`
/// never produces a half-converted result.
pub fn to_absolute_swipe(
    from_x: f64,
    from_y: f64,
    to_x: f64,
    to_y: f64,
    size: Size,
) -> Result<(Point, Point), DriverError> {
    validate_relative(from_x, from_y)?;
    validate_relative(to_x, to_y)?;
    Ok((
        Point::new(from_x * size.width, from_y * size.height),
        Point::new(to_x * size.width, to_y * size.height),
    ))
}
