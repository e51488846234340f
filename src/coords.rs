//! Mapping of model-reported boxes onto the live viewport.
//!
//! Boxes arrive on a 0..=1000 grid independent of the device resolution.
//! Values are not clamped; callers that need bounds safety clamp the point.

use serde::{Deserialize, Serialize};

pub const NORMALIZED_SCALE: f64 = 1000.0;

/// Logical (CSS pixel) size of the page viewport.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn clamped(self, viewport: Viewport) -> Point {
        Point {
            x: self.x.clamp(0.0, viewport.width.max(0.0)),
            y: self.y.clamp(0.0, viewport.height.max(0.0)),
        }
    }
}

/// Order of the four numbers in a located box. Part of the prompt contract,
/// so it is configured rather than assumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionOrder {
    /// `[top, left, bottom, right]`, i.e. `[ymin, xmin, ymax, xmax]`.
    #[default]
    TopLeftBottomRight,
    /// `[left, top, right, bottom]`, i.e. `[xmin, ymin, xmax, ymax]`.
    LeftTopRightBottom,
}

/// Box on the normalized grid.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub top: f64,
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
}

impl Region {
    pub fn from_array(values: [f64; 4], order: RegionOrder) -> Self {
        let [a, b, c, d] = values;
        match order {
            RegionOrder::TopLeftBottomRight => Region { top: a, left: b, bottom: c, right: d },
            RegionOrder::LeftTopRightBottom => Region { left: a, top: b, right: c, bottom: d },
        }
    }

    /// Center of the box scaled independently on each axis.
    pub fn center_on(&self, viewport: Viewport) -> Point {
        Point {
            x: (self.left + self.right) / 2.0 / NORMALIZED_SCALE * viewport.width,
            y: (self.top + self.bottom) / 2.0 / NORMALIZED_SCALE * viewport.height,
        }
    }
}
