//! Render settings: geometry, rotation, colors, state storage location.

use crate::error::{DisplayError, Result};
use image::Rgba;
use std::path::{Path, PathBuf};

/// Immutable-after-construction settings shared by the engine and every
/// sink.
///
/// Width and height are stored in the *logical* (user-facing) orientation:
/// when rotation is 90 or 270 the native panel dimensions are swapped so
/// `width()`/`height()` always match what callers draw against. Rotation is
/// applied as a transform at export time only.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    width: u32,
    height: u32,
    rotation: u16,
    is_portrait: bool,
    background: Rgba<u8>,
    foreground: Rgba<u8>,
    state_dir: PathBuf,
    splash: Option<PathBuf>,
    include_command: bool,
}

impl RenderSettings {
    /// Build settings from native panel dimensions.
    pub fn new(
        native_width: u32,
        native_height: u32,
        rotation: u16,
        background: Rgba<u8>,
        foreground: Rgba<u8>,
        state_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        if native_width == 0 || native_width > 9999 {
            return Err(DisplayError::validation(
                "width",
                "width must be greater than 0 and less than 10000",
            ));
        }
        if native_height == 0 || native_height > 9999 {
            return Err(DisplayError::validation(
                "height",
                "height must be greater than 0 and less than 10000",
            ));
        }
        let (width, height, is_portrait) = match rotation {
            0 | 180 => (native_width, native_height, false),
            90 | 270 => (native_height, native_width, true),
            _ => {
                return Err(DisplayError::validation(
                    "rotation",
                    "rotation must be 0, 90, 180 or 270",
                ))
            }
        };
        Ok(Self {
            width,
            height,
            rotation,
            is_portrait,
            background,
            foreground,
            state_dir: state_dir.into(),
            splash: None,
            include_command: false,
        })
    }

    /// Splash image drawn on a freshly provisioned canvas (no snapshot and
    /// no journal present).
    pub fn with_splash(mut self, splash: Option<PathBuf>) -> Self {
        self.splash = splash;
        self
    }

    /// Whether change notifications carry the originating command. Needed
    /// by networked consumers, wasteful for the panel-only case.
    pub fn with_include_command(mut self, include: bool) -> Self {
        self.include_command = include;
        self
    }

    /// Logical width (already rotated for the user-facing orientation).
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Logical height.
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rotation(&self) -> u16 {
        self.rotation
    }

    pub fn is_portrait(&self) -> bool {
        self.is_portrait
    }

    pub fn background(&self) -> Rgba<u8> {
        self.background
    }

    pub fn foreground(&self) -> Rgba<u8> {
        self.foreground
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn splash(&self) -> Option<&Path> {
        self.splash.as_deref()
    }

    pub fn include_command(&self) -> bool {
        self.include_command
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join("Screen.png")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join("Commands.txt")
    }

    pub fn clocks_index_path(&self) -> PathBuf {
        self.state_dir.join("Clocks.txt")
    }

    pub fn clock_path(&self, sanitized_key: &str) -> PathBuf {
        self.state_dir.join(format!("Clock-{sanitized_key}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn settings(rotation: u16) -> RenderSettings {
        RenderSettings::new(
            800,
            480,
            rotation,
            Rgba([255, 255, 255, 255]),
            Rgba([0, 0, 0, 255]),
            "/tmp/state",
        )
        .unwrap()
    }

    #[test]
    fn swaps_dimensions_for_portrait_rotations() {
        let landscape = settings(180);
        assert_eq!((landscape.width(), landscape.height()), (800, 480));
        assert!(!landscape.is_portrait());

        let portrait = settings(270);
        assert_eq!((portrait.width(), portrait.height()), (480, 800));
        assert!(portrait.is_portrait());
    }

    #[test]
    fn rejects_bad_rotation_and_dimensions() {
        assert!(RenderSettings::new(
            800,
            480,
            45,
            Rgba([0, 0, 0, 255]),
            Rgba([0, 0, 0, 255]),
            "/tmp"
        )
        .is_err());
        assert!(RenderSettings::new(
            0,
            480,
            0,
            Rgba([0, 0, 0, 255]),
            Rgba([0, 0, 0, 255]),
            "/tmp"
        )
        .is_err());
    }

    #[test]
    fn state_paths_follow_layout() {
        let s = settings(0);
        assert!(s.snapshot_path().ends_with("Screen.png"));
        assert!(s.journal_path().ends_with("Commands.txt"));
        assert!(s.clock_path("US_Pacific").ends_with("Clock-US_Pacific.json"));
    }
}
