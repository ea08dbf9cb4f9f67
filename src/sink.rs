//! Pushes canvas changes to an attached e-paper panel. Changes are
//! batched on a coarse timer because panel refreshes are slow and visible;
//! a daily flash cycle clears ghosting.

use crate::error::{DisplayError, Result};
use crate::render::DisplayEngine;
use crate::timer::PrecisionTimer;
use chrono::{DateTime, Local, NaiveTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Update timer cadence. The timer also fires early (5s) after the first
/// non-delayed change of a batch.
const UPDATE_TARGET_MS: u32 = 300_000;
const UPDATE_TOLERANCE_MS: u32 = 5_000;
const UPDATE_FIRE_IN: Duration = Duration::from_secs(5);

/// Daily refresh may land anywhere within 3 minutes of the configured
/// time without being skipped.
const REFRESH_TOLERANCE_MS: u32 = 180_000;
const FLASH_CYCLES: u32 = 6;

/// Panel hardware takes tens of seconds per refresh; waiting longer than
/// this for the display lock means something is wedged.
const DISPLAY_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Anything that receives rendered frames.
pub trait DisplaySink {
    fn driver_name(&self) -> &str;
    fn last_updated(&self) -> Option<DateTime<Local>>;
}

/// Hardware abstraction for an e-paper panel. Implementations drive the
/// actual controller; [`NullPanel`] just logs.
pub trait EpaperPanel: Send {
    fn name(&self) -> &str;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn power_on(&mut self) -> Result<()>;
    /// Display a full-frame PNG in the panel's native orientation.
    fn display_image(&mut self, png: &[u8]) -> Result<()>;
    /// Flash the panel to its white state.
    fn clear(&mut self) -> Result<()>;
    /// Flash the panel to its black state.
    fn clear_black(&mut self) -> Result<()>;
    fn sleep(&mut self) -> Result<()>;
}

/// Panel stand-in for hosts without attached hardware.
pub struct NullPanel {
    width: u32,
    height: u32,
}

impl NullPanel {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl EpaperPanel for NullPanel {
    fn name(&self) -> &str {
        "none"
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn power_on(&mut self) -> Result<()> {
        Ok(())
    }

    fn display_image(&mut self, png: &[u8]) -> Result<()> {
        debug!(bytes = png.len(), "panel frame (no hardware attached)");
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        Ok(())
    }

    fn clear_black(&mut self) -> Result<()> {
        Ok(())
    }

    fn sleep(&mut self) -> Result<()> {
        Ok(())
    }
}

struct SinkShared {
    engine: Arc<DisplayEngine>,
    panel: AsyncMutex<Box<dyn EpaperPanel>>,
    updating: AtomicBool,
    delayed: AtomicBool,
    last_updated: Mutex<Option<DateTime<Local>>>,
}

/// Subscribes to engine changes and drives the panel. Dropping the sink
/// stops its timers and tasks.
pub struct PanelSink {
    shared: Arc<SinkShared>,
    driver: String,
    tasks: Vec<JoinHandle<()>>,
}

impl PanelSink {
    pub fn start(
        engine: Arc<DisplayEngine>,
        panel: Box<dyn EpaperPanel>,
        refresh_time: Option<NaiveTime>,
    ) -> Self {
        let driver = panel.name().to_string();
        let shared = Arc::new(SinkShared {
            engine,
            panel: AsyncMutex::new(panel),
            updating: AtomicBool::new(false),
            delayed: AtomicBool::new(false),
            last_updated: Mutex::new(None),
        });
        let mut tasks = Vec::new();

        // Change listener: a delayed change waits for the cyclic tick, an
        // immediate one pulls the next tick forward once per batch.
        let (update_handle, mut update_ticks) =
            PrecisionTimer::cyclic(UPDATE_TARGET_MS, UPDATE_TOLERANCE_MS).spawn();
        let update_handle = Arc::new(update_handle);
        {
            let shared = Arc::clone(&shared);
            let mut changes = shared.engine.subscribe();
            let update_handle = Arc::clone(&update_handle);
            tasks.push(tokio::spawn(async move {
                loop {
                    match changes.recv().await {
                        Ok(change) => {
                            if change.delay {
                                shared.delayed.store(true, Ordering::Release);
                            } else if !shared.updating.swap(true, Ordering::AcqRel) {
                                update_handle.fire_in(UPDATE_FIRE_IN);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "panel sink lagged behind change stream");
                            shared.updating.store(true, Ordering::Release);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        // Update tick: push a frame when anything accumulated.
        {
            let shared = Arc::clone(&shared);
            tasks.push(tokio::spawn(async move {
                let _keep_alive = update_handle;
                while update_ticks.recv().await.is_some() {
                    let pending = shared.updating.swap(false, Ordering::AcqRel)
                        | shared.delayed.swap(false, Ordering::AcqRel);
                    if !pending {
                        continue;
                    }
                    if let Err(err) = push_frame(&shared).await {
                        error!("panel update failed: {err}");
                    }
                }
            }));
        }

        // Daily refresh flash.
        if let Some(time) = refresh_time {
            let (refresh_handle, mut refresh_ticks) =
                PrecisionTimer::daily(time, REFRESH_TOLERANCE_MS).spawn();
            let shared = Arc::clone(&shared);
            tasks.push(tokio::spawn(async move {
                let _keep_alive = refresh_handle;
                while refresh_ticks.recv().await.is_some() {
                    if let Err(err) = flash_refresh(&shared).await {
                        error!("panel refresh failed: {err}");
                    }
                }
            }));
        }

        info!(driver = %driver, "panel sink started");
        Self {
            shared,
            driver,
            tasks,
        }
    }
}

async fn push_frame(shared: &SinkShared) -> Result<()> {
    let png = shared.engine.screen()?;
    let mut panel = tokio::time::timeout(DISPLAY_LOCK_TIMEOUT, shared.panel.lock())
        .await
        .map_err(|_| DisplayError::LockTimeout { name: "display" })?;
    panel.power_on()?;
    panel.display_image(&png)?;
    panel.sleep()?;
    drop(panel);
    let now = Local::now();
    *shared
        .last_updated
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(now);
    debug!("panel frame pushed");
    Ok(())
}

/// Full flash cycle to lift ghosting, then re-import state so the panel
/// shows a cleanly rebuilt frame.
async fn flash_refresh(shared: &SinkShared) -> Result<()> {
    info!("daily panel refresh");
    {
        let mut panel = tokio::time::timeout(DISPLAY_LOCK_TIMEOUT, shared.panel.lock())
            .await
            .map_err(|_| DisplayError::LockTimeout { name: "display" })?;
        panel.power_on()?;
        for _ in 0..FLASH_CYCLES {
            panel.clear_black()?;
            panel.clear()?;
        }
        panel.sleep()?;
    }
    shared.engine.refresh()
}

impl DisplaySink for PanelSink {
    fn driver_name(&self) -> &str {
        &self.driver
    }

    fn last_updated(&self) -> Option<DateTime<Local>> {
        *self
            .shared
            .last_updated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PanelSink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
