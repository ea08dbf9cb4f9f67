//! The drawing command set and its journal/wire representation.
//!
//! Commands are journaled as one `name\tjson` line each and replayed (or
//! relayed to command-mode clients) through the same closed dispatch, so
//! unknown names are an explicit, non-fatal branch instead of an open
//! string switch.

use crate::error::{DisplayError, Result};
use serde::{Deserialize, Serialize};

fn default_font_size() -> f32 {
    32.0
}

fn default_font_weight() -> u32 {
    400
}

fn default_font_width() -> u32 {
    5
}

fn default_color() -> String {
    "#000000".to_string()
}

/// Place a decoded image file at `(x, y)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAction {
    pub x: i32,
    pub y: i32,
    pub filename: String,
    #[serde(default)]
    pub delay: bool,
}

/// Draw a vector fragment (or bare color fill) in a `width`×`height` box
/// at `(x, y)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawAction {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub fragment: Option<String>,
    #[serde(default)]
    pub delay: bool,
}

/// Place text anchored at `(x, y)` under the given alignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextAction {
    pub x: i32,
    pub y: i32,
    pub value: String,
    #[serde(default)]
    pub horiz_align: i8,
    #[serde(default)]
    pub vert_align: i8,
    #[serde(default)]
    pub font: Option<String>,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default = "default_font_weight")]
    pub font_weight: u32,
    #[serde(default = "default_font_width")]
    pub font_width: u32,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub delay: bool,
}

/// A requested region export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenAtAction {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// The closed set of replayable commands.
#[derive(Debug, Clone)]
pub enum RenderCommand {
    Clear,
    Refresh,
    /// Emitted after a state import; replay-only, never re-executed.
    Update,
    Image(ImageAction),
    Draw(DrawAction),
    Text(TextAction),
}

impl RenderCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RenderCommand::Clear => "clear",
            RenderCommand::Refresh => "refresh",
            RenderCommand::Update => "update",
            RenderCommand::Image(_) => "image",
            RenderCommand::Draw(_) => "draw",
            RenderCommand::Text(_) => "text",
        }
    }

    /// JSON argument payload, if the command carries one.
    pub fn values(&self) -> Option<String> {
        match self {
            RenderCommand::Clear | RenderCommand::Refresh | RenderCommand::Update => None,
            RenderCommand::Image(a) => serde_json::to_string(a).ok(),
            RenderCommand::Draw(a) => serde_json::to_string(a).ok(),
            RenderCommand::Text(a) => serde_json::to_string(a).ok(),
        }
    }

    /// Dispatch a `(name, json)` pair back into a command.
    ///
    /// Returns `Ok(None)` for names outside the closed set (callers log
    /// and continue); malformed payloads for known names are a validation
    /// error.
    pub fn parse(name: &str, values: Option<&str>) -> Result<Option<RenderCommand>> {
        let parsed = match name.to_ascii_lowercase().as_str() {
            "clear" => Some(RenderCommand::Clear),
            "refresh" => Some(RenderCommand::Refresh),
            "update" => Some(RenderCommand::Update),
            "image" => Some(RenderCommand::Image(Self::args(name, values)?)),
            "draw" => Some(RenderCommand::Draw(Self::args(name, values)?)),
            "text" => Some(RenderCommand::Text(Self::args(name, values)?)),
            _ => None,
        };
        Ok(parsed)
    }

    fn args<T: for<'de> Deserialize<'de>>(name: &str, values: Option<&str>) -> Result<T> {
        let values = values.ok_or_else(|| {
            DisplayError::validation("command", format!("{name} requires arguments"))
        })?;
        serde_json::from_str(values).map_err(|err| {
            DisplayError::validation("command", format!("bad {name} arguments: {err}"))
        })
    }
}

/// Copy of the originating command attached to change notifications when
/// the settings ask for it (networked consumers relay these verbatim).
#[derive(Debug, Clone)]
pub struct CommandEcho {
    pub name: String,
    pub values: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_is_closed_and_case_insensitive() {
        assert!(matches!(
            RenderCommand::parse("CLEAR", None).unwrap(),
            Some(RenderCommand::Clear)
        ));
        assert!(RenderCommand::parse("reorder", None).unwrap().is_none());
    }

    #[test]
    fn image_round_trips_through_journal_form() {
        let cmd = RenderCommand::Image(ImageAction {
            x: 4,
            y: 9,
            filename: "weather.png".into(),
            delay: true,
        });
        let values = cmd.values().unwrap();
        let parsed = RenderCommand::parse(cmd.name(), Some(&values))
            .unwrap()
            .unwrap();
        match parsed {
            RenderCommand::Image(a) => {
                assert_eq!((a.x, a.y), (4, 9));
                assert_eq!(a.filename, "weather.png");
                assert!(a.delay);
            }
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn text_defaults_apply_when_fields_missing() {
        let parsed = RenderCommand::parse("text", Some(r#"{"x":1,"y":2,"value":"hi"}"#))
            .unwrap()
            .unwrap();
        match parsed {
            RenderCommand::Text(t) => {
                assert_eq!(t.font_size, 32.0);
                assert_eq!(t.font_weight, 400);
                assert_eq!(t.font_width, 5);
                assert_eq!(t.color, "#000000");
                assert_eq!(t.horiz_align, 0);
            }
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_a_validation_error() {
        let err = RenderCommand::parse("draw", Some("{not json")).unwrap_err();
        assert!(matches!(err, DisplayError::Validation { .. }));
        let err = RenderCommand::parse("image", None).unwrap_err();
        assert!(matches!(err, DisplayError::Validation { .. }));
    }
}
