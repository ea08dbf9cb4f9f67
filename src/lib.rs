//! Inkboard: a persistent raster display server for slow e-paper panels.
//!
//! The canvas engine holds the authoritative screen state and makes it
//! durable through an append-only command journal with snapshot
//! checkpointing. Clock overlays, the panel sink and the TCP update
//! socket all sit on top of the engine's change notifications.

pub mod clock;
pub mod config;
pub mod error;
pub mod geom;
pub mod render;
pub mod server;
pub mod sink;
pub mod timer;

pub use clock::ClockManager;
pub use error::{DisplayError, Result};
pub use geom::{DirtyRegion, Rect};
pub use render::{DisplayEngine, RenderSettings};
pub use server::SocketServer;
pub use sink::{DisplaySink, EpaperPanel, NullPanel, PanelSink};
pub use timer::{PrecisionTimer, TimerHandle};
