//! Clock overlays: per-zone clocks composited onto the canvas and kept
//! current by minute-aligned timers. Clock definitions persist in their
//! own files, separate from the command journal, and are rewritten
//! whenever the set of clocks or their commands change.

pub mod overlay;

pub use overlay::{ClockZone, DisplayClock, OverlayCommand};

use crate::error::{DisplayError, Result};
use crate::render::color::{format_color, parse_color};
use crate::render::DisplayEngine;
use chrono::format::{Item, StrftimeItems};
use chrono::{Local, Timelike};
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Key used for the host-local zone when a request leaves the zone blank.
const LOCAL_KEY: &str = "Local";

/// `clock_clear` issued this late in the minute waits for the boundary to
/// pass, so a tick task mid-rollover cannot repaint a clock that is being
/// torn down.
const CLEAR_HOLD_SECOND: u32 = 48;

fn default_time_format() -> String {
    "%H:%M".to_string()
}

fn default_font_size() -> f32 {
    32.0
}

fn default_color() -> String {
    "#000000".to_string()
}

/// Register an image element on a clock.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockImageRequest {
    #[serde(default)]
    pub timezone: String,
    pub x: i32,
    pub y: i32,
    pub filename: String,
}

/// Register a drawn element on a clock. The fragment may embed
/// `{0:<fmt>}` placeholders substituted with the zone time on each tick.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockDrawRequest {
    #[serde(default)]
    pub timezone: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub fragment: Option<String>,
}

/// Register a time text element on a clock.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockTimeRequest {
    #[serde(default)]
    pub timezone: String,
    pub x: i32,
    pub y: i32,
    #[serde(default = "default_time_format")]
    pub format: String,
    #[serde(default)]
    pub horiz_align: i8,
    #[serde(default)]
    pub vert_align: i8,
    #[serde(default)]
    pub font: Option<String>,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default)]
    pub font_weight: u32,
    #[serde(default)]
    pub font_width: u32,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub background: Option<String>,
}

/// Owns all live clocks. Mutations replace the on-disk clock files so a
/// restart restores the same set.
pub struct ClockManager {
    engine: Arc<DisplayEngine>,
    clocks: Mutex<HashMap<String, DisplayClock>>,
}

impl ClockManager {
    pub fn new(engine: Arc<DisplayEngine>) -> Self {
        Self {
            engine,
            clocks: Mutex::new(HashMap::new()),
        }
    }

    /// Add a clock for a zone. Re-adding a zone erases and replaces the
    /// existing clock.
    pub async fn clock(&self, timezone: &str) -> Result<()> {
        let (key, zone) = resolve_zone(timezone)?;
        let mut clocks = self.clocks.lock().await;
        if let Some(old) = clocks.remove(&key) {
            old.erase_all(&self.engine);
        }
        info!(clock = %key, "clock added");
        let clock = DisplayClock::start(
            key.clone(),
            zone,
            self.background(),
            Vec::new(),
            Arc::clone(&self.engine),
            self.engine.settings().clock_path(&sanitize_key(&key)),
        );
        clock.persist();
        clocks.insert(key, clock);
        self.persist_index(&clocks);
        Ok(())
    }

    pub async fn clock_image(&self, request: &ClockImageRequest) -> Result<()> {
        let (key, _) = resolve_zone(&request.timezone)?;
        self.check_point("x", request.x, self.engine.settings().width())?;
        self.check_point("y", request.y, self.engine.settings().height())?;
        let path = Path::new(&request.filename);
        if !path.exists() {
            return Err(DisplayError::validation("filename", "file not found"));
        }
        let (width, height) = image::image_dimensions(path).map_err(|err| {
            DisplayError::validation("filename", format!("unable to decode image: {err}"))
        })?;

        let clocks = self.clocks.lock().await;
        let clock = Self::find(&clocks, &key)?;
        clock.push(OverlayCommand::Image {
            x: request.x,
            y: request.y,
            filename: request.filename.clone(),
            width,
            height,
            drawn: false,
        });
        clock.render_now(&self.engine);
        Ok(())
    }

    pub async fn clock_draw(&self, request: &ClockDrawRequest) -> Result<()> {
        let (key, zone) = resolve_zone(&request.timezone)?;
        self.check_point("x", request.x, self.engine.settings().width())?;
        self.check_point("y", request.y, self.engine.settings().height())?;
        if request.width == 0 || request.height == 0 {
            return Err(DisplayError::validation(
                "width",
                "width and height must be greater than zero",
            ));
        }
        if let Some(fragment) = request.fragment.as_deref() {
            let rendered = overlay::substitute_time(fragment, &|fmt| zone.format_now(fmt));
            self.engine
                .validate_fragment(request.width, request.height, &rendered)?;
        }

        let clocks = self.clocks.lock().await;
        let clock = Self::find(&clocks, &key)?;
        clock.push(OverlayCommand::Draw {
            x: request.x,
            y: request.y,
            width: request.width,
            height: request.height,
            fragment: request.fragment.clone(),
            last: None,
        });
        clock.render_now(&self.engine);
        Ok(())
    }

    pub async fn clock_time(&self, request: &ClockTimeRequest) -> Result<()> {
        let (key, _) = resolve_zone(&request.timezone)?;
        self.check_point("x", request.x, self.engine.settings().width())?;
        self.check_point("y", request.y, self.engine.settings().height())?;
        let format = if request.format.trim().is_empty() {
            default_time_format()
        } else {
            request.format.clone()
        };
        validate_format(&format)?;
        if !(-1..=1).contains(&request.horiz_align) || !(-1..=1).contains(&request.vert_align) {
            return Err(DisplayError::validation(
                "horizAlign",
                "alignment must be -1, 0 or 1",
            ));
        }
        parse_color(&request.color)
            .map_err(|_| DisplayError::validation("color", format!("bad color {}", request.color)))?;
        if let Some(bg) = request.background.as_deref() {
            parse_color(bg)
                .map_err(|_| DisplayError::validation("background", format!("bad color {bg}")))?;
        }

        let clocks = self.clocks.lock().await;
        let clock = Self::find(&clocks, &key)?;
        clock.push(OverlayCommand::Time {
            x: request.x,
            y: request.y,
            format,
            horiz_align: request.horiz_align,
            vert_align: request.vert_align,
            font: request.font.clone(),
            font_size: if request.font_size == 0.0 {
                default_font_size()
            } else {
                request.font_size
            },
            font_weight: request.font_weight,
            font_width: request.font_width,
            color: request.color.clone(),
            background: request.background.clone(),
            last: None,
        });
        clock.render_now(&self.engine);
        Ok(())
    }

    /// Remove one clock, erasing its elements from the canvas.
    pub async fn clock_delete(&self, timezone: &str) -> Result<()> {
        let (key, _) = resolve_zone(timezone)?;
        let mut clocks = self.clocks.lock().await;
        let Some(clock) = clocks.remove(&key) else {
            return Err(DisplayError::validation("timezone", "clock not found"));
        };
        clock.erase_all(&self.engine);
        self.remove_clock_file(&key);
        self.persist_index(&clocks);
        info!(clock = %key, "clock deleted");
        Ok(())
    }

    /// Remove every clock. If the minute is about to roll over, wait for
    /// the boundary first so tick redraws cannot race the teardown.
    pub async fn clock_clear(&self) -> Result<()> {
        let second = Local::now().second();
        if second > CLEAR_HOLD_SECOND {
            tokio::time::sleep(Duration::from_secs((61 - second) as u64)).await;
        }
        let mut clocks = self.clocks.lock().await;
        for (key, clock) in clocks.drain() {
            clock.erase_all(&self.engine);
            self.remove_clock_file(&key);
        }
        self.persist_index(&clocks);
        Ok(())
    }

    /// Restore clocks written by a previous run. Per-clock failures are
    /// logged and skipped.
    pub async fn import(&self) -> Result<()> {
        let index = self.engine.settings().clocks_index_path();
        if !index.exists() {
            return Ok(());
        }
        let contents = fs::read_to_string(&index)?;
        let mut clocks = self.clocks.lock().await;
        for key in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let zone = if key == LOCAL_KEY {
                ClockZone::Local
            } else {
                match key.parse::<Tz>() {
                    Ok(tz) => ClockZone::Named(tz),
                    Err(_) => {
                        warn!(clock = %key, "stored clock has an unknown zone, skipping");
                        continue;
                    }
                }
            };
            let path = self.engine.settings().clock_path(&sanitize_key(key));
            let commands = match fs::read_to_string(&path) {
                Ok(json) => match serde_json::from_str::<Vec<OverlayCommand>>(&json) {
                    Ok(commands) => commands,
                    Err(err) => {
                        warn!(clock = %key, "stored clock is corrupt, starting empty: {err}");
                        Vec::new()
                    }
                },
                Err(err) => {
                    warn!(clock = %key, "stored clock unreadable, starting empty: {err}");
                    Vec::new()
                }
            };
            let clock = DisplayClock::start(
                key.to_string(),
                zone,
                self.background(),
                commands,
                Arc::clone(&self.engine),
                path,
            );
            clock.render_now(&self.engine);
            clocks.insert(key.to_string(), clock);
        }
        info!(count = clocks.len(), "clocks restored");
        Ok(())
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.clocks.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn find<'a>(
        clocks: &'a HashMap<String, DisplayClock>,
        key: &str,
    ) -> Result<&'a DisplayClock> {
        clocks
            .get(key)
            .ok_or_else(|| DisplayError::validation("timezone", "clock not found"))
    }

    fn background(&self) -> String {
        format_color(self.engine.settings().background())
    }

    fn check_point(&self, field: &'static str, value: i32, limit: u32) -> Result<()> {
        if value < 0 || value as u32 >= limit {
            return Err(DisplayError::validation(
                field,
                format!("{value} is not within the screen"),
            ));
        }
        Ok(())
    }

    // Index persistence is best-effort, like the command journal: a failed
    // write is logged and the in-memory clocks stay authoritative.
    fn persist_index(&self, clocks: &HashMap<String, DisplayClock>) {
        let index = self.engine.settings().clocks_index_path();
        if clocks.is_empty() {
            if index.exists() {
                if let Err(err) = fs::remove_file(&index) {
                    warn!("clock index remove failed: {err}");
                }
            }
            return;
        }
        let mut keys: Vec<&str> = clocks.keys().map(String::as_str).collect();
        keys.sort_unstable();
        let mut contents = keys.join("\n");
        contents.push('\n');
        if let Err(err) = fs::write(&index, contents) {
            warn!("clock index persist failed: {err}");
        }
    }

    fn remove_clock_file(&self, key: &str) {
        let path = self.engine.settings().clock_path(&sanitize_key(key));
        if path.exists() {
            if let Err(err) = fs::remove_file(&path) {
                warn!(clock = %key, "clock file remove failed: {err}");
            }
        }
    }
}

/// Map a zone request to a canonical clock key. Blank means host-local.
fn resolve_zone(timezone: &str) -> Result<(String, ClockZone)> {
    let trimmed = timezone.trim();
    if trimmed.is_empty() {
        return Ok((LOCAL_KEY.to_string(), ClockZone::Local));
    }
    match trimmed.parse::<Tz>() {
        Ok(tz) => Ok((tz.name().to_string(), ClockZone::Named(tz))),
        Err(_) => Err(DisplayError::validation(
            "timezone",
            format!("unknown time zone {trimmed}"),
        )),
    }
}

/// Zone names contain `/`; file names must not.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn validate_format(fmt: &str) -> Result<()> {
    if StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error)) {
        return Err(DisplayError::validation(
            "format",
            format!("bad time format {fmt}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::raster::BlockRasterizer;
    use crate::render::RenderSettings;
    use image::Rgba;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    static SCRATCH_SEQ: AtomicU32 = AtomicU32::new(0);

    fn scratch_dir(tag: &str) -> PathBuf {
        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "inkboard-clock-{tag}-{}-{seq}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager_at(dir: &Path) -> ClockManager {
        let settings = RenderSettings::new(
            400,
            300,
            0,
            Rgba([255, 255, 255, 255]),
            Rgba([0, 0, 0, 255]),
            dir,
        )
        .unwrap();
        let engine = Arc::new(DisplayEngine::new(settings, Box::new(BlockRasterizer)).unwrap());
        ClockManager::new(engine)
    }

    fn time_request(timezone: &str) -> ClockTimeRequest {
        ClockTimeRequest {
            timezone: timezone.to_string(),
            x: 50,
            y: 50,
            format: "%H:%M".into(),
            horiz_align: 0,
            vert_align: 0,
            font: None,
            font_size: 16.0,
            font_weight: 0,
            font_width: 0,
            color: "#000000".into(),
            background: None,
        }
    }

    #[test]
    fn zone_resolution() {
        assert_eq!(resolve_zone("").unwrap().0, "Local");
        assert_eq!(resolve_zone("   ").unwrap().0, "Local");
        assert_eq!(
            resolve_zone("America/New_York").unwrap().0,
            "America/New_York"
        );
        assert!(matches!(
            resolve_zone("Mars/Olympus"),
            Err(DisplayError::Validation {
                field: "timezone",
                ..
            })
        ));
    }

    #[test]
    fn key_sanitization() {
        assert_eq!(sanitize_key("America/New_York"), "America_New_York");
        assert_eq!(sanitize_key("Local"), "Local");
    }

    #[test]
    fn format_validation() {
        assert!(validate_format("%H:%M").is_ok());
        assert!(validate_format("%Y-%m-%d %H:%M:%S").is_ok());
        assert!(validate_format("%Q nope").is_err());
    }

    #[tokio::test]
    async fn overlay_on_missing_clock_is_rejected() {
        let dir = scratch_dir("missing");
        let manager = manager_at(&dir);
        let err = manager.clock_time(&time_request("")).await.unwrap_err();
        assert!(matches!(
            err,
            DisplayError::Validation {
                field: "timezone",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn clock_files_track_the_clock_set() {
        let dir = scratch_dir("files");
        let manager = manager_at(&dir);
        manager.clock("").await.unwrap();
        manager.clock("America/New_York").await.unwrap();
        manager.clock_time(&time_request("")).await.unwrap();

        let index = manager.engine.settings().clocks_index_path();
        let listed = fs::read_to_string(&index).unwrap();
        assert_eq!(listed, "America/New_York\nLocal\n");
        assert!(manager
            .engine
            .settings()
            .clock_path("America_New_York")
            .exists());

        manager.clock_delete("America/New_York").await.unwrap();
        assert!(!manager
            .engine
            .settings()
            .clock_path("America_New_York")
            .exists());
        assert_eq!(fs::read_to_string(&index).unwrap(), "Local\n");

        manager.clock_clear().await.unwrap();
        assert!(!index.exists());
    }

    #[tokio::test]
    async fn import_restores_clocks_and_redraws() {
        let dir = scratch_dir("import");
        let manager = manager_at(&dir);
        manager.clock("").await.unwrap();
        manager.clock_time(&time_request("")).await.unwrap();

        let fresh = manager_at(&dir);
        fresh.engine.restore().unwrap();
        fresh.import().await.unwrap();
        assert_eq!(fresh.keys().await, vec!["Local".to_string()]);
        // The restored clock repaints its time on import.
        assert_ne!(
            fresh.engine.screen().unwrap(),
            DisplayEngine::new(
                RenderSettings::new(
                    400,
                    300,
                    0,
                    Rgba([255, 255, 255, 255]),
                    Rgba([0, 0, 0, 255]),
                    &dir,
                )
                .unwrap(),
                Box::new(BlockRasterizer),
            )
            .unwrap()
            .screen()
            .unwrap()
        );
    }

    #[tokio::test]
    async fn readding_a_zone_replaces_the_clock() {
        let dir = scratch_dir("readd");
        let manager = manager_at(&dir);
        manager.clock("").await.unwrap();
        manager.clock_time(&time_request("")).await.unwrap();
        manager.clock("").await.unwrap();
        let clocks = manager.clocks.lock().await;
        assert!(clocks.get("Local").unwrap().commands_snapshot().is_empty());
    }
}
