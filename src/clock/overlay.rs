//! A single clock overlay: a zone, a background color and an ordered list
//! of overlay commands redrawn by a minute-aligned tick task.

use crate::render::{DisplayEngine, DrawAction, ImageAction, TextAction};
use crate::timer::{PrecisionTimer, TimerHandle};
use chrono::{DateTime, Local, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Tick target within the minute. Firing just before the minute boundary
/// lets the rendered value round up to the minute being entered, so slow
/// panels show the new time as it arrives rather than after.
pub(crate) const TICK_TARGET_MS: u32 = 55_000;
pub(crate) const TICK_TOLERANCE_MS: u32 = 5_000;

/// Seconds value at which a tick formats the upcoming minute instead of
/// the current one.
pub(crate) const ROUND_UP_SECOND: u32 = 50;

/// Time zone a clock renders in.
#[derive(Debug, Clone)]
pub enum ClockZone {
    Local,
    Named(Tz),
}

impl ClockZone {
    /// Format the current zone time, rounded up past [`ROUND_UP_SECOND`].
    pub fn format_now(&self, fmt: &str) -> String {
        match self {
            ClockZone::Local => rounded(Local::now()).format(fmt).to_string(),
            ClockZone::Named(tz) => rounded(Utc::now().with_timezone(tz)).format(fmt).to_string(),
        }
    }
}

fn rounded<Z: TimeZone>(now: DateTime<Z>) -> DateTime<Z>
where
    Z::Offset: std::fmt::Display,
{
    if now.second() >= ROUND_UP_SECOND {
        let next = now.clone() + chrono::Duration::seconds(60 - now.second() as i64);
        next.with_nanosecond(0).unwrap_or(next)
    } else {
        now
    }
}

/// Replace every `{0:<fmt>}` placeholder using `format`. Unterminated
/// placeholders pass through untouched.
pub(crate) fn substitute_time(fragment: &str, format: &dyn Fn(&str) -> String) -> String {
    let mut out = String::new();
    let mut rest = fragment;
    while let Some(start) = rest.find("{0:") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&format(&after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// One element of a clock overlay, in draw order. `last` caches the most
/// recently rendered value for diffing and erasure; it persists with the
/// clock so text restored from a snapshot can still be erased after a
/// restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OverlayCommand {
    Image {
        x: i32,
        y: i32,
        filename: String,
        width: u32,
        height: u32,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        drawn: bool,
    },
    Draw {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        fragment: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last: Option<String>,
    },
    Time {
        x: i32,
        y: i32,
        format: String,
        horiz_align: i8,
        vert_align: i8,
        font: Option<String>,
        font_size: f32,
        font_weight: u32,
        font_width: u32,
        color: String,
        background: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last: Option<String>,
    },
}

/// A live clock: its commands plus the tick task keeping them current.
/// Dropping the clock aborts the tick task.
pub struct DisplayClock {
    key: String,
    zone: ClockZone,
    background: String,
    commands: Arc<Mutex<Vec<OverlayCommand>>>,
    state_path: PathBuf,
    _timer: TimerHandle,
}

impl DisplayClock {
    /// Spawn the tick task and return the handle owning it.
    pub fn start(
        key: String,
        zone: ClockZone,
        background: String,
        commands: Vec<OverlayCommand>,
        engine: Arc<DisplayEngine>,
        state_path: PathBuf,
    ) -> Self {
        let commands = Arc::new(Mutex::new(commands));
        let timer = PrecisionTimer::cyclic(TICK_TARGET_MS, TICK_TOLERANCE_MS);
        let (handle, mut ticks) = timer.spawn();

        let tick_zone = zone.clone();
        let tick_background = background.clone();
        let tick_commands = Arc::clone(&commands);
        let tick_key = key.clone();
        let tick_path = state_path.clone();
        tokio::spawn(async move {
            while ticks.recv().await.is_some() {
                debug!(clock = %tick_key, "clock tick");
                if render_pass(&engine, &tick_zone, &tick_background, &tick_commands, false) {
                    persist_commands(&tick_path, &tick_commands, &tick_key);
                }
            }
        });

        Self {
            key,
            zone,
            background,
            commands,
            state_path,
            _timer: handle,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn push(&self, command: OverlayCommand) {
        lock(&self.commands).push(command);
    }

    pub fn commands_snapshot(&self) -> Vec<OverlayCommand> {
        lock(&self.commands).clone()
    }

    /// Rewrite this clock's state file, including cached last-rendered
    /// values. Best-effort.
    pub fn persist(&self) {
        persist_commands(&self.state_path, &self.commands, &self.key);
    }

    /// Redraw everything now, ignoring the change diff. Used right after a
    /// mutation or an import so the screen reflects it without waiting for
    /// the next tick.
    pub fn render_now(&self, engine: &DisplayEngine) {
        render_pass(engine, &self.zone, &self.background, &self.commands, true);
        self.persist();
    }

    /// Paint over every overlay element in the clock background color,
    /// for deletion.
    pub fn erase_all(&self, engine: &DisplayEngine) {
        let commands = lock(&self.commands);
        for command in commands.iter() {
            match command {
                OverlayCommand::Image {
                    x,
                    y,
                    width,
                    height,
                    ..
                }
                | OverlayCommand::Draw {
                    x,
                    y,
                    width,
                    height,
                    ..
                } => {
                    let action = DrawAction {
                        x: *x,
                        y: *y,
                        width: *width,
                        height: *height,
                        fragment: Some(self.background.clone()),
                        delay: true,
                    };
                    if let Err(err) = engine.draw(&action, false) {
                        warn!(clock = %self.key, "overlay erase failed: {err}");
                    }
                }
                OverlayCommand::Time { last, .. } => {
                    if let Some(text) = last.as_deref().filter(|t| !t.is_empty()) {
                        if let Err(err) =
                            erase_time(engine, command, text, pick_background(command, &self.background))
                        {
                            warn!(clock = %self.key, "overlay erase failed: {err}");
                        }
                    }
                }
            }
        }
    }
}

fn pick_background<'a>(command: &'a OverlayCommand, clock_background: &'a str) -> &'a str {
    match command {
        OverlayCommand::Time {
            background: Some(bg),
            ..
        } => bg,
        _ => clock_background,
    }
}

/// Draw the previous text over itself in the background color, bold so
/// the heavier strokes fully cover the original glyphs.
fn erase_time(
    engine: &DisplayEngine,
    command: &OverlayCommand,
    text: &str,
    background: &str,
) -> crate::error::Result<()> {
    let OverlayCommand::Time {
        x,
        y,
        horiz_align,
        vert_align,
        font,
        font_size,
        font_weight,
        font_width,
        ..
    } = command
    else {
        return Ok(());
    };
    let action = TextAction {
        x: *x,
        y: *y,
        value: text.to_string(),
        horiz_align: *horiz_align,
        vert_align: *vert_align,
        font: font.clone(),
        font_size: *font_size,
        font_weight: *font_weight,
        font_width: *font_width,
        color: background.to_string(),
        delay: true,
    };
    engine.text(&action, true, false)
}

/// One rendering pass over a clock's commands. Erases stale time text,
/// then redraws in order, skipping any command whose rendered content
/// still matches its cached value (static images draw only once). The
/// first write of a pass goes out without the batching delay so the panel
/// refreshes promptly; the rest of the pass rides along with it. Returns
/// whether anything was drawn.
fn render_pass(
    engine: &DisplayEngine,
    zone: &ClockZone,
    clock_background: &str,
    commands: &Mutex<Vec<OverlayCommand>>,
    force: bool,
) -> bool {
    let mut commands = lock(commands);

    // Erase pass: stale time text gets painted over before anything new
    // lands, so partial glyph overlap never accumulates.
    for command in commands.iter() {
        if let OverlayCommand::Time { format, last, .. } = command {
            let next = zone.format_now(format);
            if let Some(prev) = last.as_deref().filter(|p| !p.is_empty() && **p != next) {
                let background = pick_background(command, clock_background).to_string();
                if let Err(err) = erase_time(engine, command, prev, &background) {
                    warn!("time erase failed: {err}");
                }
            }
        }
    }

    // Draw pass.
    let mut has_drawn = false;
    for command in commands.iter_mut() {
        let result = match command {
            OverlayCommand::Image {
                x,
                y,
                filename,
                drawn,
                ..
            } => {
                if *drawn && !force {
                    continue;
                }
                let action = ImageAction {
                    x: *x,
                    y: *y,
                    filename: filename.clone(),
                    delay: has_drawn,
                };
                let result = engine.place_image(&action, false).map(|_| ());
                if result.is_ok() {
                    *drawn = true;
                }
                result
            }
            OverlayCommand::Draw {
                x,
                y,
                width,
                height,
                fragment,
                last,
            } => {
                let rendered = fragment
                    .as_deref()
                    .map(|f| substitute_time(f, &|fmt| zone.format_now(fmt)));
                let cache = rendered.clone().unwrap_or_default();
                if !force && last.as_deref() == Some(cache.as_str()) {
                    continue;
                }
                let action = DrawAction {
                    x: *x,
                    y: *y,
                    width: *width,
                    height: *height,
                    fragment: rendered,
                    delay: has_drawn,
                };
                let result = engine.draw(&action, false);
                if result.is_ok() {
                    *last = Some(cache);
                }
                result
            }
            OverlayCommand::Time {
                x,
                y,
                format,
                horiz_align,
                vert_align,
                font,
                font_size,
                font_weight,
                font_width,
                color,
                last,
                ..
            } => {
                let next = zone.format_now(format);
                if !force && last.as_deref() == Some(next.as_str()) {
                    continue;
                }
                let action = TextAction {
                    x: *x,
                    y: *y,
                    value: next.clone(),
                    horiz_align: *horiz_align,
                    vert_align: *vert_align,
                    font: font.clone(),
                    font_size: *font_size,
                    font_weight: *font_weight,
                    font_width: *font_width,
                    color: color.clone(),
                    delay: has_drawn,
                };
                let result = engine.text(&action, false, false);
                if result.is_ok() {
                    *last = Some(next);
                }
                result
            }
        };
        match result {
            Ok(()) => has_drawn = true,
            Err(err) => warn!("overlay draw failed: {err}"),
        }
    }
    has_drawn
}

fn persist_commands(path: &PathBuf, commands: &Mutex<Vec<OverlayCommand>>, key: &str) {
    let snapshot = lock(commands).clone();
    let result = serde_json::to_string(&snapshot)
        .map_err(std::io::Error::other)
        .and_then(|json| std::fs::write(path, json));
    if let Err(err) = result {
        warn!(clock = %key, "clock persist failed: {err}");
    }
}

fn lock(commands: &Mutex<Vec<OverlayCommand>>) -> MutexGuard<'_, Vec<OverlayCommand>> {
    commands.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::raster::BlockRasterizer;
    use crate::render::RenderSettings;
    use image::Rgba;
    use std::path::Path;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "inkboard-overlay-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn engine_at(dir: &Path) -> DisplayEngine {
        let settings = RenderSettings::new(
            400,
            300,
            0,
            Rgba([255, 255, 255, 255]),
            Rgba([0, 0, 0, 255]),
            dir,
        )
        .unwrap();
        DisplayEngine::new(settings, Box::new(BlockRasterizer)).unwrap()
    }

    fn time_overlay(x: i32, last: Option<&str>) -> OverlayCommand {
        OverlayCommand::Time {
            x,
            y: 40,
            format: "%Y".into(),
            horiz_align: 0,
            vert_align: 0,
            font: None,
            font_size: 16.0,
            font_weight: 0,
            font_width: 0,
            color: "#000000".into(),
            background: None,
            last: last.map(str::to_string),
        }
    }

    #[test]
    fn placeholder_substitution() {
        let fixed = |fmt: &str| {
            assert_eq!(fmt, "%H:%M");
            "12:30".to_string()
        };
        assert_eq!(
            substitute_time("<text>{0:%H:%M}</text>", &fixed),
            "<text>12:30</text>"
        );
        assert_eq!(
            substitute_time("{0:%H:%M} and {0:%H:%M}", &fixed),
            "12:30 and 12:30"
        );
    }

    #[test]
    fn unterminated_placeholder_passes_through() {
        let fixed = |_: &str| unreachable!();
        assert_eq!(substitute_time("oops {0:%H:%M", &fixed), "oops {0:%H:%M");
        assert_eq!(substitute_time("plain", &fixed), "plain");
    }

    #[test]
    fn rounding_past_threshold_formats_next_minute() {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 9, 41, 55).unwrap();
        assert_eq!(rounded(base).format("%H:%M:%S").to_string(), "09:42:00");
        let early = Utc.with_ymd_and_hms(2024, 3, 1, 9, 41, 49).unwrap();
        assert_eq!(rounded(early).format("%H:%M:%S").to_string(), "09:41:49");
    }

    #[test]
    fn hour_boundary_rounds_forward() {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 9, 59, 51).unwrap();
        assert_eq!(rounded(base).format("%H:%M").to_string(), "10:00");
    }

    #[test]
    fn overlay_serialization_keeps_cached_text() {
        let cmd = OverlayCommand::Time {
            x: 10,
            y: 20,
            format: "%H:%M".into(),
            horiz_align: 0,
            vert_align: 0,
            font: None,
            font_size: 32.0,
            font_weight: 0,
            font_width: 0,
            color: "#000000".into(),
            background: None,
            last: Some("12:30".into()),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: OverlayCommand = serde_json::from_str(&json).unwrap();
        match back {
            OverlayCommand::Time { last, format, .. } => {
                assert_eq!(last.as_deref(), Some("12:30"));
                assert_eq!(format, "%H:%M");
            }
            other => panic!("wrong variant: {other:?}"),
        }
        let bare: OverlayCommand =
            serde_json::from_str(r##"{"type":"time","x":1,"y":2,"format":"%H:%M","horiz_align":0,"vert_align":0,"font":null,"font_size":32.0,"font_weight":0,"font_width":0,"color":"#000000","background":null}"##)
                .unwrap();
        match bare {
            OverlayCommand::Time { last, .. } => assert!(last.is_none()),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unchanged_overlays_skip_redraw_on_tick() {
        let dir = scratch_dir("tick-diff");
        let engine = engine_at(&dir);
        let mut changes = engine.subscribe();

        let year = ClockZone::Local.format_now("%Y");
        let commands = Mutex::new(vec![
            time_overlay(40, Some("1999")),
            time_overlay(200, Some(year.as_str())),
        ]);

        assert!(render_pass(
            &engine,
            &ClockZone::Local,
            "#FFFFFF",
            &commands,
            false
        ));
        let mut writes = 0;
        while changes.try_recv().is_ok() {
            writes += 1;
        }
        // One erase and one redraw for the stale overlay; the overlay
        // whose formatted value matches its cache is left untouched.
        assert_eq!(writes, 2);
        match &lock(&commands)[0] {
            OverlayCommand::Time { last, .. } => assert_eq!(last.as_deref(), Some(year.as_str())),
            other => panic!("wrong variant: {other:?}"),
        }

        // With both caches current, a tick draws nothing at all.
        assert!(!render_pass(
            &engine,
            &ClockZone::Local,
            "#FFFFFF",
            &commands,
            false
        ));
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn static_images_draw_once() {
        let dir = scratch_dir("image-once");
        let engine = engine_at(&dir);
        let mut changes = engine.subscribe();

        let path = dir.join("badge.png");
        image::RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255]))
            .save(&path)
            .unwrap();
        let commands = Mutex::new(vec![OverlayCommand::Image {
            x: 10,
            y: 10,
            filename: path.to_string_lossy().into_owned(),
            width: 8,
            height: 8,
            drawn: false,
        }]);

        assert!(render_pass(
            &engine,
            &ClockZone::Local,
            "#FFFFFF",
            &commands,
            false
        ));
        assert!(changes.try_recv().is_ok());
        assert!(changes.try_recv().is_err());

        assert!(!render_pass(
            &engine,
            &ClockZone::Local,
            "#FFFFFF",
            &commands,
            false
        ));
        assert!(changes.try_recv().is_err());
    }
}
