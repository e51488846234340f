use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::coords::{Point, Region, RegionOrder, Viewport};
use crate::protocol::ActionDescriptor;

const DEFAULT_SCROLL_DISTANCE: f64 = 500.0;
const EDGE_SCROLL_REPEAT: u32 = 10;
const DEFAULT_SLEEP_MS: u64 = 1000;
const MAX_SLEEP_MS: u64 = 60_000;

// ========================= Planned actions =========================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputMode {
    #[default]
    Replace,
    Clear,
    TypeOnly,
    Append,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    #[default]
    Down,
    Up,
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScrollType {
    #[default]
    SingleAction,
    ScrollToBottom,
    ScrollToTop,
    ScrollToRight,
    ScrollToLeft,
}

/// Typed form of an [`ActionDescriptor`], still on the normalized grid.
#[derive(Clone, Debug, PartialEq)]
pub enum PlannedAction {
    Launch { url: String },
    Tap { target: Region },
    Input { value: String, target: Option<Region>, mode: InputMode },
    Scroll {
        scroll_type: ScrollType,
        direction: ScrollDirection,
        distance: Option<f64>,
        target: Option<Region>,
    },
    Sleep { duration: Duration },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActionError {
    #[error("unsupported action type '{0}'")]
    Unsupported(String),
    #[error("missing parameter '{0}'")]
    MissingParam(&'static str),
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParam { name: &'static str, reason: String },
}

impl PlannedAction {
    pub fn from_descriptor(
        descriptor: &ActionDescriptor,
        order: RegionOrder,
    ) -> Result<Self, ActionError> {
        let empty = Map::new();
        let param = descriptor.param.as_ref().unwrap_or(&empty);

        match descriptor.kind.to_ascii_lowercase().as_str() {
            "launch" => {
                let url = str_param(param, "url")?.ok_or(ActionError::MissingParam("url"))?;
                Ok(PlannedAction::Launch { url: url.to_string() })
            }
            "tap" | "click" => {
                let target = locate(param, order)?.ok_or(ActionError::MissingParam("locate"))?;
                Ok(PlannedAction::Tap { target })
            }
            "input" | "type" => Ok(PlannedAction::Input {
                value: str_param(param, "value")?.unwrap_or_default().to_string(),
                target: locate(param, order)?,
                mode: enum_param(param, "mode")?.unwrap_or_default(),
            }),
            "scroll" => Ok(PlannedAction::Scroll {
                scroll_type: enum_param(param, "scrollType")?.unwrap_or_default(),
                direction: enum_param(param, "direction")?.unwrap_or_default(),
                distance: num_param(param, "distance")?,
                target: locate(param, order)?,
            }),
            "sleep" => {
                let ms = match num_param(param, "timeMs")? {
                    Some(ms) if ms < 0.0 => {
                        return Err(ActionError::InvalidParam {
                            name: "timeMs",
                            reason: "must not be negative".into(),
                        })
                    }
                    Some(ms) if ms > MAX_SLEEP_MS as f64 => {
                        return Err(ActionError::InvalidParam {
                            name: "timeMs",
                            reason: format!("must be at most {MAX_SLEEP_MS}"),
                        })
                    }
                    Some(ms) => ms as u64,
                    None => DEFAULT_SLEEP_MS,
                };
                Ok(PlannedAction::Sleep { duration: Duration::from_millis(ms) })
            }
            _ => Err(ActionError::Unsupported(descriptor.kind.clone())),
        }
    }

    /// Turns normalized targets into viewport points.
    pub fn resolve(&self, viewport: Viewport) -> Action {
        match self {
            PlannedAction::Launch { url } => Action::Navigate { url: url.clone() },
            PlannedAction::Tap { target } => {
                Action::Click { at: target.center_on(viewport), click_count: 1 }
            }
            PlannedAction::Input { value, target, mode } => Action::Input {
                at: target.map(|r| r.center_on(viewport)),
                value: value.clone(),
                mode: *mode,
            },
            PlannedAction::Scroll { scroll_type, direction, distance, target } => {
                let step = distance.unwrap_or(DEFAULT_SCROLL_DISTANCE);
                let (direction, repeat) = match scroll_type {
                    ScrollType::SingleAction => (*direction, 1),
                    ScrollType::ScrollToBottom => (ScrollDirection::Down, EDGE_SCROLL_REPEAT),
                    ScrollType::ScrollToTop => (ScrollDirection::Up, EDGE_SCROLL_REPEAT),
                    ScrollType::ScrollToRight => (ScrollDirection::Right, EDGE_SCROLL_REPEAT),
                    ScrollType::ScrollToLeft => (ScrollDirection::Left, EDGE_SCROLL_REPEAT),
                };
                let (dx, dy) = match direction {
                    ScrollDirection::Down => (0.0, step),
                    ScrollDirection::Up => (0.0, -step),
                    ScrollDirection::Right => (step, 0.0),
                    ScrollDirection::Left => (-step, 0.0),
                };
                Action::Scroll { at: target.map(|r| r.center_on(viewport)), dx, dy, repeat }
            }
            PlannedAction::Sleep { duration } => Action::Wait { duration: *duration },
        }
    }
}

// ========================= Device actions =========================

/// What the actuator performs, in viewport pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Navigate { url: String },
    Click { at: Point, click_count: u32 },
    Input { at: Option<Point>, value: String, mode: InputMode },
    Scroll { at: Option<Point>, dx: f64, dy: f64, repeat: u32 },
    Wait { duration: Duration },
}

impl Action {
    /// Pulls every pixel point inside `viewport`; other fields are untouched.
    pub fn clamped(&self, viewport: Viewport) -> Action {
        let mut action = self.clone();
        match &mut action {
            Action::Click { at, .. } => *at = at.clamped(viewport),
            Action::Input { at, .. } | Action::Scroll { at, .. } => {
                *at = at.map(|p| p.clamped(viewport));
            }
            Action::Navigate { .. } | Action::Wait { .. } => {}
        }
        action
    }

    /// Whether the action carries a point that should be checked against the viewport.
    pub fn needs_viewport(&self) -> bool {
        match self {
            Action::Click { .. } => true,
            Action::Input { at, .. } | Action::Scroll { at, .. } => at.is_some(),
            Action::Navigate { .. } | Action::Wait { .. } => false,
        }
    }
}

// ========================= Param helpers =========================

fn str_param<'a>(param: &'a Map<String, Value>, name: &'static str) -> Result<Option<&'a str>, ActionError> {
    match param.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(ActionError::InvalidParam {
            name,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

fn num_param(param: &Map<String, Value>, name: &'static str) -> Result<Option<f64>, ActionError> {
    match param.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or_else(|| ActionError::InvalidParam {
            name,
            reason: format!("expected a number, got {v}"),
        }),
    }
}

fn enum_param<T>(param: &Map<String, Value>, name: &'static str) -> Result<Option<T>, ActionError>
where
    T: serde::de::DeserializeOwned,
{
    match param.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|e| {
            ActionError::InvalidParam { name, reason: e.to_string() }
        }),
    }
}

/// Reads `locate.bbox` (or `locate.bbox_2d`).
fn locate(param: &Map<String, Value>, order: RegionOrder) -> Result<Option<Region>, ActionError> {
    let Some(locate) = param.get("locate").filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let bbox = locate
        .get("bbox")
        .filter(|v| !v.is_null())
        .or_else(|| locate.get("bbox_2d").filter(|v| !v.is_null()));
    let Some(bbox) = bbox else {
        return Ok(None);
    };

    let invalid = |reason: &str| ActionError::InvalidParam { name: "locate", reason: reason.to_string() };
    let values = bbox.as_array().ok_or_else(|| invalid("bbox must be an array"))?;
    if values.len() != 4 {
        return Err(invalid("bbox must have exactly four numbers"));
    }
    let mut out = [0.0; 4];
    for (slot, value) in out.iter_mut().zip(values) {
        *slot = value
            .as_f64()
            .filter(|n| n.is_finite())
            .ok_or_else(|| invalid("bbox entries must be numbers"))?;
    }
    Ok(Some(Region::from_array(out, order)))
}
