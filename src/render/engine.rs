//! Canvas state engine: single source of truth for screen content,
//! durable across restarts through an append-only command journal with
//! snapshot checkpointing.

use crate::error::{DisplayError, Result};
use crate::geom::Rect;
use crate::render::color::parse_color;
use crate::render::commands::{
    CommandEcho, DrawAction, ImageAction, RenderCommand, ScreenAtAction, TextAction,
};
use crate::render::raster::{fill_rect, layout_text, FontSpec, Rasterizer};
use crate::render::settings::RenderSettings;
use image::{imageops, DynamicImage, ImageFormat, RgbaImage};
use std::fs;
use std::io::Cursor;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Journal size (bytes) at which the next persisted command triggers a
/// checkpoint instead of an append. A tunable cadence knob, not a
/// correctness constraint.
const JOURNAL_LIMIT: u64 = 4096;

/// Bounded wait for the journal/snapshot state lock.
const STATE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Persistence lifecycle: a fresh engine restores snapshot + journal once,
/// then serves live mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Empty = 0,
    Restoring = 1,
    Live = 2,
}

/// One canvas change, published synchronously after the mutation and its
/// journal write complete.
#[derive(Debug, Clone)]
pub struct ScreenChange {
    /// Changed area, clipped to the screen.
    pub rect: Rect,
    /// The change tolerates a longer batching delay.
    pub delay: bool,
    /// Originating command, when `include_command` is set.
    pub command: Option<CommandEcho>,
}

/// The canvas engine. Shared as `Arc<DisplayEngine>`; drawing primitives
/// take `&self` and serialize internally on the canvas, while journal and
/// snapshot I/O serialize on a separate state lock with a bounded wait.
pub struct DisplayEngine {
    settings: RenderSettings,
    rasterizer: Box<dyn Rasterizer>,
    canvas: Mutex<RgbaImage>,
    state_lock: Mutex<()>,
    phase: AtomicU8,
    changes: broadcast::Sender<ScreenChange>,
}

impl DisplayEngine {
    /// Create an engine with a background-filled canvas. Call
    /// [`DisplayEngine::restore`] before serving traffic.
    pub fn new(settings: RenderSettings, rasterizer: Box<dyn Rasterizer>) -> Result<Self> {
        if let Err(err) = fs::create_dir_all(settings.state_dir()) {
            warn!(dir = %settings.state_dir().display(), "state dir unavailable: {err}");
        }
        let canvas = RgbaImage::from_pixel(settings.width(), settings.height(), settings.background());
        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            settings,
            rasterizer,
            canvas: Mutex::new(canvas),
            state_lock: Mutex::new(()),
            phase: AtomicU8::new(Phase::Empty as u8),
            changes,
        })
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            0 => Phase::Empty,
            1 => Phase::Restoring,
            _ => Phase::Live,
        }
    }

    /// Subscribe to change notifications. Consumers subscribe at
    /// construction and drop the receiver on teardown.
    pub fn subscribe(&self) -> broadcast::Receiver<ScreenChange> {
        self.changes.subscribe()
    }

    /// Restore persisted state: snapshot, then journal replay in order.
    /// If neither exists the splash image is shown and no `update`
    /// notification fires, distinguishing "freshly provisioned" from
    /// "resumed".
    pub fn restore(&self) -> Result<()> {
        self.phase.store(Phase::Restoring as u8, Ordering::Release);
        let result = self.import();
        self.phase.store(Phase::Live as u8, Ordering::Release);
        result
    }

    /// Fill the canvas with the background color. With `reset_state` the
    /// snapshot and journal files are deleted too (hard reset).
    pub fn clear(&self, reset_state: bool) -> Result<()> {
        {
            let mut canvas = lock_canvas(&self.canvas);
            for pixel in canvas.pixels_mut() {
                *pixel = self.settings.background();
            }
        }

        if reset_state {
            for path in [self.settings.snapshot_path(), self.settings.journal_path()] {
                if path.exists() {
                    if let Err(err) = fs::remove_file(&path) {
                        warn!(path = %path.display(), "state reset failed: {err}");
                    }
                }
            }
        }

        self.notify(
            Rect::new(0, 0, self.settings.width(), self.settings.height()),
            false,
            false,
            "clear",
            None,
        );
        Ok(())
    }

    /// Clear pixels and re-import snapshot + journal, for an in-memory
    /// refresh after a panel flash cycle.
    pub fn refresh(&self) -> Result<()> {
        self.import()?;
        self.notify(
            Rect::new(0, 0, self.settings.width(), self.settings.height()),
            false,
            false,
            "refresh",
            None,
        );
        Ok(())
    }

    /// Decode and composite an image file at `(x, y)`. Returns the decoded
    /// dimensions.
    pub fn place_image(&self, action: &ImageAction, persist: bool) -> Result<(u32, u32)> {
        self.check_point("x", action.x, self.settings.width())?;
        self.check_point("y", action.y, self.settings.height())?;
        let img = decode_image(&action.filename)?;
        let (width, height) = img.dimensions();
        {
            let mut canvas = lock_canvas(&self.canvas);
            imageops::overlay(&mut *canvas, &img, action.x as i64, action.y as i64);
        }
        self.notify(
            Rect::new(action.x, action.y, width, height),
            action.delay,
            persist,
            "image",
            serde_json::to_string(action).ok(),
        );
        Ok((width, height))
    }

    /// Draw a vector fragment (or a bare color as a filled rectangle) in a
    /// `width`×`height` box at `(x, y)`.
    pub fn draw(&self, action: &DrawAction, persist: bool) -> Result<()> {
        self.check_point("x", action.x, self.settings.width())?;
        self.check_point("y", action.y, self.settings.height())?;
        if action.width == 0 {
            return Err(DisplayError::validation(
                "width",
                "width must be greater than zero",
            ));
        }
        if action.height == 0 {
            return Err(DisplayError::validation(
                "height",
                "height must be greater than zero",
            ));
        }

        let fragment = match action.fragment.as_deref() {
            Some(f) if !f.trim().is_empty() => f.to_string(),
            _ => crate::render::color::format_color(self.settings.foreground()),
        };

        if let Ok(color) = parse_color(&fragment) {
            let mut canvas = lock_canvas(&self.canvas);
            fill_rect(
                &mut canvas,
                action.x,
                action.y,
                action.width,
                action.height,
                color,
            );
        } else {
            let img = self
                .rasterizer
                .draw_fragment(action.width, action.height, &fragment)?;
            let mut canvas = lock_canvas(&self.canvas);
            imageops::overlay(&mut *canvas, &img, action.x as i64, action.y as i64);
        }

        self.notify(
            Rect::new(action.x, action.y, action.width, action.height),
            action.delay,
            persist,
            "draw",
            serde_json::to_string(action).ok(),
        );
        Ok(())
    }

    /// Place text anchored at `(x, y)`. Empty or whitespace text is a
    /// no-op, not an error.
    pub fn text(&self, action: &TextAction, bold: bool, persist: bool) -> Result<()> {
        if action.value.trim().is_empty() {
            return Ok(());
        }
        let mut action = action.clone();
        action.value = action.value.replace('\r', " ").replace('\n', "");
        if action.font_size == 0.0 {
            action.font_size = 32.0;
        }
        self.validate_text(&action)?;

        let color = parse_color(&action.color)
            .map_err(|_| DisplayError::validation("color", format!("bad color {}", action.color)))?;
        let font = FontSpec {
            family: action.font.clone(),
            size: action.font_size,
            weight: action.font_weight,
            width: action.font_width,
            bold,
        };
        let metrics = self.rasterizer.measure_text(&action.value, &font)?;
        let layout = layout_text(&metrics, action.x, action.y, action.horiz_align, action.vert_align);
        {
            let mut canvas = lock_canvas(&self.canvas);
            self.rasterizer.draw_text(
                &mut canvas,
                action.x + layout.hoffset,
                action.y + layout.voffset,
                &action.value,
                &font,
                color,
            )?;
        }

        self.notify(
            Rect::new(layout.left, layout.top, layout.width, layout.height),
            action.delay,
            persist,
            "text",
            serde_json::to_string(&action).ok(),
        );
        Ok(())
    }

    /// Full-frame PNG export with the configured rotation applied at
    /// encode time; the canvas itself is never stored rotated.
    pub fn screen(&self) -> Result<Vec<u8>> {
        let canvas = lock_canvas(&self.canvas).clone();
        encode_rotated(canvas, self.settings.rotation())
    }

    /// Region PNG export. The region is validated against logical bounds,
    /// then extracted and rotated like the full frame.
    pub fn screen_at(&self, area: &ScreenAtAction) -> Result<Vec<u8>> {
        self.check_point("x", area.x, self.settings.width())?;
        self.check_point("y", area.y, self.settings.height())?;
        if area.width == 0 {
            return Err(DisplayError::validation(
                "width",
                "width must be greater than zero",
            ));
        }
        if area.height == 0 {
            return Err(DisplayError::validation(
                "height",
                "height must be greater than zero",
            ));
        }
        if area.x as u32 + area.width > self.settings.width() {
            return Err(DisplayError::validation(
                "width",
                "area is wider than the screen",
            ));
        }
        if area.y as u32 + area.height > self.settings.height() {
            return Err(DisplayError::validation(
                "height",
                "area is taller than the screen",
            ));
        }

        let cropped = {
            let canvas = lock_canvas(&self.canvas);
            imageops::crop_imm(&*canvas, area.x as u32, area.y as u32, area.width, area.height)
                .to_image()
        };
        encode_rotated(cropped, self.settings.rotation())
    }

    /// Rasterize a fragment without compositing it, to reject bad input at
    /// registration time instead of at the next redraw.
    pub fn validate_fragment(&self, width: u32, height: u32, fragment: &str) -> Result<()> {
        if parse_color(fragment).is_ok() {
            return Ok(());
        }
        self.rasterizer.draw_fragment(width, height, fragment).map(|_| ())
    }

    /// Dispatch a journaled or relayed command back through the mutation
    /// path with journaling suppressed. Returns `false` for names outside
    /// the closed command set.
    pub fn render_command(&self, name: &str, values: Option<&str>) -> Result<bool> {
        let Some(command) = RenderCommand::parse(name, values)? else {
            return Ok(false);
        };
        match command {
            RenderCommand::Clear => self.clear(true)?,
            RenderCommand::Refresh => self.refresh()?,
            RenderCommand::Update => {}
            RenderCommand::Image(mut action) => {
                action.delay = true;
                self.place_image(&action, false)?;
            }
            RenderCommand::Draw(mut action) => {
                action.delay = true;
                self.draw(&action, false)?;
            }
            RenderCommand::Text(mut action) => {
                action.delay = true;
                self.text(&action, false, false)?;
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Clear pixels and replay snapshot + journal. Fires `update` when
    /// anything was restored, otherwise shows the splash image.
    fn import(&self) -> Result<()> {
        let _state = lock_deadline(&self.state_lock, "state", STATE_LOCK_TIMEOUT)?;
        self.clear(false)?;

        let mut updated = false;
        let snapshot = self.settings.snapshot_path();
        if snapshot.exists() {
            let action = ImageAction {
                x: 0,
                y: 0,
                filename: snapshot.to_string_lossy().into_owned(),
                delay: true,
            };
            match self.place_image(&action, false) {
                Ok(_) => {
                    info!("previous screen restored");
                    updated = true;
                }
                Err(err) => warn!("snapshot restore failed: {err}"),
            }
        }

        let journal = self.settings.journal_path();
        if journal.exists() {
            match fs::read_to_string(&journal) {
                Ok(contents) => {
                    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                        let (name, values) = match line.split_once('\t') {
                            Some((n, v)) => (n, Some(v)),
                            None => (line, None),
                        };
                        match self.render_command(name, values) {
                            Ok(true) => updated = true,
                            Ok(false) => warn!("unknown command in journal: {name}"),
                            Err(err) => warn!("journal replay of {name} failed: {err}"),
                        }
                    }
                }
                Err(err) => warn!("journal read failed: {err}"),
            }
        }

        if updated {
            self.notify(
                Rect::new(0, 0, self.settings.width(), self.settings.height()),
                false,
                false,
                "update",
                None,
            );
        } else if let Some(splash) = self.settings.splash() {
            if splash.exists() {
                let action = ImageAction {
                    x: 0,
                    y: 0,
                    filename: splash.to_string_lossy().into_owned(),
                    delay: false,
                };
                if let Err(err) = self.place_image(&action, false) {
                    warn!("splash image failed: {err}");
                }
            }
        }
        Ok(())
    }

    /// Append one journal line, checkpointing (snapshot + truncate) once
    /// the journal has reached [`JOURNAL_LIMIT`] bytes. The triggering
    /// command is absorbed by the snapshot rather than appended.
    /// Best-effort: failures are logged, the in-memory canvas stays
    /// authoritative.
    fn export_command(&self, name: &str, values: Option<&str>) {
        let result = (|| -> Result<()> {
            let _state = lock_deadline(&self.state_lock, "state", STATE_LOCK_TIMEOUT)?;
            let journal = self.settings.journal_path();
            let mut line = match values {
                Some(v) => format!("{name}\t{v}"),
                None => name.to_string(),
            };
            line = line.replace('\r', " ").replace('\n', "");
            line.push('\n');

            let journal_len = fs::metadata(&journal).map(|m| m.len()).unwrap_or(0);
            if !journal.exists() {
                fs::write(&journal, line)?;
            } else if journal_len < JOURNAL_LIMIT {
                let mut contents = fs::read_to_string(&journal)?;
                contents.push_str(&line);
                fs::write(&journal, contents)?;
            } else {
                let png = {
                    let canvas = lock_canvas(&self.canvas).clone();
                    encode_rotated(canvas, 0)?
                };
                fs::write(self.settings.snapshot_path(), png)?;
                fs::remove_file(&journal)?;
                info!("journal checkpointed to snapshot");
            }
            Ok(())
        })();
        if let Err(err) = result {
            warn!("journal write for {name} failed: {err}");
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn notify(&self, rect: Rect, delay: bool, persist: bool, name: &str, values: Option<String>) {
        if persist {
            self.export_command(name, values.as_deref());
        }
        let Some(rect) = rect.clipped(self.settings.width(), self.settings.height()) else {
            return;
        };
        let command = self.settings.include_command().then(|| CommandEcho {
            name: name.to_string(),
            values,
        });
        // Err means no live subscribers, which is fine.
        let _ = self.changes.send(ScreenChange {
            rect,
            delay,
            command,
        });
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

    fn validate_text(&self, action: &TextAction) -> Result<()> {
        self.check_point("x", action.x, self.settings.width())?;
        self.check_point("y", action.y, self.settings.height())?;
        if !(-1..=1).contains(&action.horiz_align) {
            return Err(DisplayError::validation(
                "horizAlign",
                "horizontal alignment must be -1, 0 or 1",
            ));
        }
        if !(-1..=1).contains(&action.vert_align) {
            return Err(DisplayError::validation(
                "vertAlign",
                "vertical alignment must be -1, 0 or 1",
            ));
        }
        if action.font_size <= 0.0 || action.font_size > 9999.0 {
            return Err(DisplayError::validation(
                "fontSize",
                "font size must be greater than zero and less than 10000",
            ));
        }
        if (action.font_weight != 0 && action.font_weight < 100) || action.font_weight > 900 {
            return Err(DisplayError::validation(
                "fontWeight",
                "font weight must be between 100 and 900",
            ));
        }
        if action.font_width > 9 {
            return Err(DisplayError::validation(
                "fontWidth",
                "font width must be between 1 and 9",
            ));
        }
        Ok(())
    }
}

fn decode_image(filename: &str) -> Result<RgbaImage> {
    let path = std::path::Path::new(filename);
    if !path.exists() {
        return Err(DisplayError::validation("filename", "file not found"));
    }
    let img = image::open(path)
        .map_err(|err| DisplayError::validation("filename", format!("unable to decode image: {err}")))?;
    Ok(img.to_rgba8())
}

fn encode_rotated(canvas: RgbaImage, rotation: u16) -> Result<Vec<u8>> {
    let rotated = match rotation {
        90 => imageops::rotate90(&canvas),
        180 => imageops::rotate180(&canvas),
        270 => imageops::rotate270(&canvas),
        _ => canvas,
    };
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(rotated).write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

fn lock_canvas(canvas: &Mutex<RgbaImage>) -> MutexGuard<'_, RgbaImage> {
    canvas.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bounded-wait lock acquisition: polls `try_lock` until the deadline and
/// surfaces a timeout as a retryable error instead of blocking forever.
fn lock_deadline<'a, T>(
    lock: &'a Mutex<T>,
    name: &'static str,
    timeout: Duration,
) -> Result<MutexGuard<'a, T>> {
    let deadline = Instant::now() + timeout;
    loop {
        match lock.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return Err(DisplayError::LockTimeout { name });
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}
