//! Update-distribution socket server.
//!
//! Clients connect over TCP, send an 11-byte mode token, immediately
//! receive a full-frame patch, and from then on receive either structured
//! command frames (command mode) or batched `graphics` patches (graphic
//! mode). Changed regions are coalesced into one bounding box between
//! flushes so a burst of small updates costs one patch.

pub mod frame;

pub use frame::{ClientMode, Frame, MODE_TOKEN_LEN};

use crate::error::{DisplayError, Result};
use crate::geom::{DirtyRegion, Rect};
use crate::render::{DisplayEngine, ScreenAtAction, ScreenChange};
use crate::sink::DisplaySink;
use crate::timer::{PrecisionTimer, TimerHandle};
use chrono::{DateTime, Local, NaiveDate};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Flush timer cadence; idle ticks become heartbeats.
const FLUSH_TARGET_MS: u32 = 300_000;
const FLUSH_TOLERANCE_MS: u32 = 5_000;

/// Batch windows after the first change of a flush cycle.
const FLUSH_DELAY: Duration = Duration::from_secs(1);
const FLUSH_DELAY_RELAXED: Duration = Duration::from_secs(5);

/// The accept loop may be restarted this many times per calendar day
/// before accept capability is considered lost.
const MAX_RESTARTS_PER_DAY: u32 = 20;

const DIRTY_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

struct Client {
    id: u64,
    mode: ClientMode,
    tx: mpsc::UnboundedSender<Frame>,
}

struct DirtyState {
    region: DirtyRegion,
    updating: bool,
}

struct RestartBudget {
    date: NaiveDate,
    used: u32,
}

struct ServerShared {
    engine: Arc<DisplayEngine>,
    listen: SocketAddr,
    clients: Mutex<Vec<Client>>,
    next_client_id: AtomicU64,
    dirty: AsyncMutex<DirtyState>,
    flush_handle: TimerHandle,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    restarts: Mutex<RestartBudget>,
    exhausted: AtomicBool,
    last_updated: Mutex<Option<DateTime<Local>>>,
}

/// The running server. Dropping it stops all of its tasks and
/// disconnects every client.
pub struct SocketServer {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketServer {
    /// Bind and start serving. The returned handle owns the accept loop,
    /// the change fan-out and the flush timer.
    pub async fn start(engine: Arc<DisplayEngine>, listen: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "update socket listening");

        let (flush_handle, mut flush_ticks) =
            PrecisionTimer::cyclic(FLUSH_TARGET_MS, FLUSH_TOLERANCE_MS).spawn();
        let shared = Arc::new(ServerShared {
            engine,
            listen: local_addr,
            clients: Mutex::new(Vec::new()),
            next_client_id: AtomicU64::new(1),
            dirty: AsyncMutex::new(DirtyState {
                region: DirtyRegion::new(),
                updating: false,
            }),
            flush_handle,
            accept_task: Mutex::new(None),
            restarts: Mutex::new(RestartBudget {
                date: Local::now().date_naive(),
                used: 0,
            }),
            exhausted: AtomicBool::new(false),
            last_updated: Mutex::new(None),
        });

        *lock(&shared.accept_task) = Some(spawn_accept_loop(Arc::clone(&shared), listener));

        let mut tasks = Vec::new();
        {
            let shared = Arc::clone(&shared);
            let mut changes = shared.engine.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    match changes.recv().await {
                        Ok(change) => handle_change(&shared, change).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "socket server lagged behind change stream");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        {
            let shared = Arc::clone(&shared);
            tasks.push(tokio::spawn(async move {
                while flush_ticks.recv().await.is_some() {
                    flush(&shared).await;
                }
            }));
        }

        Ok(Self {
            shared,
            local_addr,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        lock(&self.shared.clients).len()
    }

    /// True once the daily restart budget is spent and the accept loop
    /// can no longer be revived.
    pub fn is_exhausted(&self) -> bool {
        self.shared.exhausted.load(Ordering::Acquire)
    }
}

impl DisplaySink for SocketServer {
    fn driver_name(&self) -> &str {
        "socket"
    }

    fn last_updated(&self) -> Option<DateTime<Local>> {
        *lock(&self.shared.last_updated)
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(task) = lock(&self.shared.accept_task).take() {
            task.abort();
        }
        lock(&self.shared.clients).clear();
    }
}

// ======================================================================
// Accept loop
// ======================================================================

fn spawn_accept_loop(shared: Arc<ServerShared>, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "client connected");
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        serve_client(shared, stream).await;
                    });
                }
                Err(err) => {
                    // Leave the loop dead; the next screen change's health
                    // check restarts it against the budget.
                    error!("accept failed: {err}");
                    return;
                }
            }
        }
    })
}

async fn serve_client(shared: Arc<ServerShared>, stream: TcpStream) {
    let (mut read_half, mut write_half) = stream.into_split();

    let mut token = [0u8; MODE_TOKEN_LEN];
    if read_half.read_exact(&mut token).await.is_err() {
        return;
    }
    let mode = ClientMode::from_token(&token);

    // Every new client starts from a known-good full frame.
    let full = match full_frame(&shared.engine) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("full frame render failed: {err}");
            return;
        }
    };

    let id = shared.next_client_id.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            if write_half.write_all(&full.encode()).await.is_err() {
                remove_client(&shared, id);
                return;
            }
            while let Some(frame) = rx.recv().await {
                if write_half.write_all(&frame.encode()).await.is_err() {
                    break;
                }
            }
            remove_client(&shared, id);
        });
    }
    lock(&shared.clients).push(Client { id, mode, tx });
    info!(client = id, ?mode, "client registered");

    // Clients only speak during mode negotiation; the rest of the read
    // side just watches for disconnect.
    let mut sink = [0u8; 1024];
    loop {
        match read_half.read(&mut sink).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    remove_client(&shared, id);
}

fn remove_client(shared: &ServerShared, id: u64) {
    let mut clients = lock(&shared.clients);
    let before = clients.len();
    clients.retain(|c| c.id != id);
    if clients.len() != before {
        info!(client = id, "client disconnected");
    }
}

/// Restart a dead accept loop, spending one unit of the daily budget.
async fn restart_accept(shared: &Arc<ServerShared>) {
    if shared.exhausted.load(Ordering::Acquire) {
        return;
    }
    {
        let mut budget = lock(&shared.restarts);
        let today = Local::now().date_naive();
        if budget.date != today {
            budget.date = today;
            budget.used = 0;
        }
        if budget.used >= MAX_RESTARTS_PER_DAY {
            shared.exhausted.store(true, Ordering::Release);
            error!("{}", DisplayError::ListenerExhausted);
            return;
        }
        budget.used += 1;
        warn!(restart = budget.used, "accept loop dead, restarting");
    }

    // Dangling connections belong to the dead loop; drop them all so
    // clients reconnect cleanly.
    lock(&shared.clients).clear();

    match TcpListener::bind(shared.listen).await {
        Ok(listener) => {
            *lock(&shared.accept_task) = Some(spawn_accept_loop(Arc::clone(shared), listener));
        }
        Err(err) => error!("rebind failed: {err}"),
    }
}

// ======================================================================
// Change handling
// ======================================================================

async fn handle_change(shared: &Arc<ServerShared>, change: ScreenChange) {
    let accept_dead = lock(&shared.accept_task)
        .as_ref()
        .map(|t| t.is_finished())
        .unwrap_or(true);
    if accept_dead {
        restart_accept(shared).await;
    }

    if let Some(echo) = &change.command {
        fan_out_command(shared, echo.name.as_str(), echo.values.as_deref(), change.rect);
    }

    let Ok(mut dirty) = tokio::time::timeout(DIRTY_LOCK_TIMEOUT, shared.dirty.lock()).await else {
        warn!("dirty region lock timed out, change dropped from batch");
        return;
    };
    dirty.region.include(change.rect);
    if !dirty.updating {
        dirty.updating = true;
        shared.flush_handle.fire_in(if change.delay {
            FLUSH_DELAY_RELAXED
        } else {
            FLUSH_DELAY
        });
    }
}

/// Forward a change to command-mode clients. Drawing commands go out
/// verbatim; an image command is converted to a rendered patch of its
/// change rectangle so clients never need access to the source file.
/// Lifecycle commands (`refresh`, `update`) stay server-side.
fn fan_out_command(shared: &ServerShared, name: &str, values: Option<&str>, rect: Rect) {
    let frame = match name {
        "clear" | "draw" | "text" => Frame::new(
            name,
            values.map(|v| v.as_bytes().to_vec()).unwrap_or_default(),
        ),
        "image" => match patch_frame(&shared.engine, rect) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("image patch render failed: {err}");
                return;
            }
        },
        _ => return,
    };
    send_to(shared, ClientMode::Command, &frame);
}

fn send_to(shared: &ServerShared, mode: ClientMode, frame: &Frame) {
    let mut clients = lock(&shared.clients);
    clients.retain(|c| c.mode != mode || c.tx.send(frame.clone()).is_ok());
}

fn send_to_all(shared: &ServerShared, frame: &Frame) {
    let mut clients = lock(&shared.clients);
    clients.retain(|c| c.tx.send(frame.clone()).is_ok());
}

// ======================================================================
// Flush
// ======================================================================

async fn flush(shared: &Arc<ServerShared>) {
    let pending = {
        let Ok(mut dirty) = tokio::time::timeout(DIRTY_LOCK_TIMEOUT, shared.dirty.lock()).await
        else {
            warn!("dirty region lock timed out, flush skipped");
            return;
        };
        if dirty.updating {
            dirty.updating = false;
            dirty.region.take()
        } else {
            None
        }
    };

    match pending {
        Some(rect) => {
            let has_graphic = lock(&shared.clients)
                .iter()
                .any(|c| c.mode == ClientMode::Graphic);
            if !has_graphic {
                return;
            }
            let settings = shared.engine.settings();
            // Past half the screen a patch saves nothing; ship the frame.
            let rect = if rect.area() > settings.width() as u64 * settings.height() as u64 / 2 {
                Rect::new(0, 0, settings.width(), settings.height())
            } else {
                rect
            };
            match patch_frame(&shared.engine, rect) {
                Ok(frame) => {
                    debug!(?rect, "patch flushed");
                    send_to(shared, ClientMode::Graphic, &frame);
                    *lock(&shared.last_updated) = Some(Local::now());
                }
                Err(err) => warn!("patch render failed: {err}"),
            }
        }
        None => send_to_all(shared, &Frame::heartbeat()),
    }
}

/// Render a `graphics` patch for a logical-coordinate rectangle. The
/// header advertises native-axis coordinates, so portrait rotations swap
/// the pair.
fn patch_frame(engine: &DisplayEngine, rect: Rect) -> Result<Frame> {
    let png = engine.screen_at(&ScreenAtAction {
        x: rect.x,
        y: rect.y,
        width: rect.width,
        height: rect.height,
    })?;
    let portrait = matches!(engine.settings().rotation(), 90 | 270);
    let (x, y, width, height) = if portrait {
        (rect.y, rect.x, rect.height, rect.width)
    } else {
        (rect.x, rect.y, rect.width, rect.height)
    };
    Ok(Frame::graphics(x, y, width, height, png))
}

fn full_frame(engine: &DisplayEngine) -> Result<Frame> {
    let settings = engine.settings();
    patch_frame(
        engine,
        Rect::new(0, 0, settings.width(), settings.height()),
    )
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::raster::BlockRasterizer;
    use crate::render::{DrawAction, RenderSettings, TextAction};
    use image::Rgba;
    use std::sync::atomic::AtomicU32;

    static SCRATCH_SEQ: AtomicU32 = AtomicU32::new(0);

    fn engine(rotation: u16) -> Arc<DisplayEngine> {
        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "inkboard-server-{}-{seq}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let settings = RenderSettings::new(
            200,
            100,
            rotation,
            Rgba([255, 255, 255, 255]),
            Rgba([0, 0, 0, 255]),
            &dir,
        )
        .unwrap()
        .with_include_command(true);
        Arc::new(DisplayEngine::new(settings, Box::new(BlockRasterizer)).unwrap())
    }

    async fn connect(addr: SocketAddr, token: &[u8; MODE_TOKEN_LEN]) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(token).await.unwrap();
        stream
    }

    /// Next frame that is not a keep-alive; idle flush ticks may inject
    /// heartbeats at any point.
    async fn next_frame(stream: &mut TcpStream) -> Frame {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), Frame::read(stream))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if frame.command != "heartbeat" {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn new_connections_get_a_full_frame() {
        let engine = engine(0);
        let server = SocketServer::start(Arc::clone(&engine), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut client = connect(server.local_addr(), b"graphicmode").await;
        let frame = next_frame(&mut client).await;
        assert_eq!(frame.command, "graphics 0,0,200,100");
        assert_eq!(frame.payload, engine.screen().unwrap());
    }

    #[tokio::test]
    async fn graphic_clients_receive_coalesced_patches() {
        let engine = engine(0);
        let server = SocketServer::start(Arc::clone(&engine), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut client = connect(server.local_addr(), b"graphicmode").await;
        let _full = next_frame(&mut client).await;
        // Wait until the notification task sees a registered client.
        tokio::time::sleep(Duration::from_millis(50)).await;

        for x in [10, 40] {
            engine
                .draw(
                    &DrawAction {
                        x,
                        y: 10,
                        width: 10,
                        height: 10,
                        fragment: Some("#FF0000".into()),
                        delay: false,
                    },
                    false,
                )
                .unwrap();
        }

        let frame = next_frame(&mut client).await;
        // Both draws coalesce into one bounding box.
        assert_eq!(frame.command, "graphics 10,10,40,10");
        assert_eq!(
            frame.payload,
            engine
                .screen_at(&ScreenAtAction {
                    x: 10,
                    y: 10,
                    width: 40,
                    height: 10,
                })
                .unwrap()
        );
    }

    #[tokio::test]
    async fn command_clients_get_commands_not_patches() {
        let engine = engine(0);
        let server = SocketServer::start(Arc::clone(&engine), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut client = connect(server.local_addr(), b"commandmode").await;
        let full = next_frame(&mut client).await;
        assert!(full.command.starts_with("graphics "));
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine
            .text(
                &TextAction {
                    x: 20,
                    y: 50,
                    value: "hi".into(),
                    horiz_align: -1,
                    vert_align: -1,
                    font: None,
                    font_size: 16.0,
                    font_weight: 0,
                    font_width: 0,
                    color: "#000000".into(),
                    delay: false,
                },
                false,
                false,
            )
            .unwrap();

        let frame = next_frame(&mut client).await;
        assert_eq!(frame.command, "text");
        let echo: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(echo["value"], "hi");
    }

    #[tokio::test]
    async fn image_commands_become_rendered_patches() {
        let engine = engine(0);
        let dir = engine.settings().state_dir().to_path_buf();
        let image_path = dir.join("stamp.png");
        image::RgbaImage::from_pixel(8, 8, Rgba([1, 2, 3, 255]))
            .save(&image_path)
            .unwrap();

        let server = SocketServer::start(Arc::clone(&engine), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut client = connect(server.local_addr(), b"commandmode").await;
        let _full = next_frame(&mut client).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine
            .place_image(
                &crate::render::ImageAction {
                    x: 30,
                    y: 40,
                    filename: image_path.to_string_lossy().into_owned(),
                    delay: false,
                },
                false,
            )
            .unwrap();

        let frame = next_frame(&mut client).await;
        assert_eq!(frame.command, "graphics 30,40,8,8");
        assert!(!frame.payload.is_empty());
    }

    #[tokio::test]
    async fn portrait_patch_headers_swap_axes() {
        // Native 200x100 rotated 90 is logical 100x200.
        let engine = engine(90);
        let frame = patch_frame(&engine, Rect::new(10, 20, 30, 40)).unwrap();
        assert_eq!(frame.command, "graphics 20,10,40,30");
        let full = full_frame(&engine).unwrap();
        assert_eq!(full.command, "graphics 0,0,200,100");
    }

    #[tokio::test]
    async fn disconnected_clients_are_dropped() {
        let engine = engine(0);
        let server = SocketServer::start(Arc::clone(&engine), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client = connect(server.local_addr(), b"graphicmode").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.client_count(), 1);
        drop(client);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.client_count(), 0);
    }
}
