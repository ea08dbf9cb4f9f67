//! Canvas rendering: the state engine, drawing commands, color parsing,
//! text layout and render settings.

pub mod color;
pub mod commands;
pub mod engine;
pub mod raster;
pub mod settings;

pub use commands::{
    CommandEcho, DrawAction, ImageAction, RenderCommand, ScreenAtAction, TextAction,
};
pub use engine::{DisplayEngine, Phase, ScreenChange};
pub use raster::{BlockRasterizer, FontSpec, Rasterizer};
pub use settings::RenderSettings;
