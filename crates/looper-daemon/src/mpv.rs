/// mpv IPC player with separated reader/writer tasks.
///
/// Architecture:
///
/// ```text
///   MpvPlayer::spawn()
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event / property-change   → event_tx channel
/// ```
///
/// mpv resolves watch URLs through its ytdl hook, so loading a media
/// reference is a `loadfile` of its canonical watch URL.  Unsolicited events
/// are turned into `PlayerEvent`s by `translate`.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use looper_proto::config::MpvConfig;
use looper_proto::media_ref::MediaRef;
use looper_proto::platform;
use looper_proto::protocol::PlayerHealth;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::player::{Player, PlayerError, PlayerErrorCode, PlayerEvent, PlayerState};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

pub const OBS_PAUSE: u64 = 1;
pub const OBS_EOF_REACHED: u64 = 2;
pub const OBS_DURATION: u64 = 3;

const IPC_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, IpcError>>>>>;

#[derive(Debug, Clone, Error)]
pub enum IpcError {
    /// mpv answered with something other than `success`.
    #[error("mpv error: {0}")]
    Rejected(String),
    #[error("mpv IPC connection closed")]
    Closed,
    #[error("mpv IPC timeout for req={0}")]
    Timeout(u64),
    #[error("mpv IPC encode error: {0}")]
    Encode(String),
}

impl From<IpcError> for PlayerError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::Closed => PlayerError::Unavailable,
            other => PlayerError::Command(other.to_string()),
        }
    }
}

struct PendingRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<Result<Value, IpcError>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

/// Map an mpv notification onto the player interface.  Everything the
/// controllers do not care about maps to `None`.
pub fn translate(event: &MpvEvent) -> Option<PlayerEvent> {
    if let Some((id, data)) = event.as_property_change() {
        return match id {
            OBS_EOF_REACHED if data.as_bool() == Some(true) => {
                Some(PlayerEvent::StateChange(PlayerState::Ended))
            }
            OBS_PAUSE => match data.as_bool()? {
                true => Some(PlayerEvent::StateChange(PlayerState::Paused)),
                false => Some(PlayerEvent::StateChange(PlayerState::Playing)),
            },
            OBS_DURATION => data
                .as_f64()
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(PlayerEvent::DurationChange),
            _ => None,
        };
    }

    match event.event_name()? {
        "file-loaded" => Some(PlayerEvent::Ready),
        "start-file" => Some(PlayerEvent::StateChange(PlayerState::Buffering)),
        "end-file" if event.raw.get("reason").and_then(Value::as_str) == Some("error") => {
            let detail = event
                .raw
                .get("file_error")
                .and_then(Value::as_str)
                .unwrap_or("");
            debug!("mpv: end-file error '{}'", detail);
            let code = if detail.contains("not found") || detail.contains("404") {
                PlayerErrorCode::NotFound
            } else if detail.contains("unrecognized file format") {
                PlayerErrorCode::NotEmbeddable
            } else {
                PlayerErrorCode::Other(-1)
            };
            Some(PlayerEvent::Error(code))
        }
        _ => None,
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> Result<Value, IpcError> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg).map_err(|e| IpcError::Encode(e.to_string()))?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| IpcError::Closed)?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| IpcError::Timeout(req_id))?
            .map_err(|_| IpcError::Closed)?
    }

    async fn set_property(&self, name: &str, value: Value) -> Result<(), IpcError> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    /// `None` while mpv reports the property as unavailable (nothing loaded,
    /// still demuxing).
    async fn get_property(&self, name: &str) -> Result<Option<Value>, IpcError> {
        match self.send(json!(["get_property", name])).await {
            Ok(resp) => Ok(resp.get("data").cloned().filter(|v| !v.is_null())),
            Err(IpcError::Rejected(msg)) if msg == "property unavailable" => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_flag(&self, name: &str) -> Result<bool, IpcError> {
        Ok(self
            .get_property(name)
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Must be called after every fresh connection.
    async fn observe_properties(&self) {
        let props = [
            (OBS_PAUSE, "pause"),
            (OBS_EOF_REACHED, "eof-reached"),
            (OBS_DURATION, "duration"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }

    /// Health-check: returns Ok(()) if mpv is responsive.
    pub async fn ping(&self) -> Result<(), IpcError> {
        self.send(json!(["get_property", "mpv-version"])).await?;
        Ok(())
    }
}

// ── player ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.  Dropping the player kills it.
pub struct MpvPlayer {
    handle: MpvHandle,
    process: std::sync::Mutex<tokio::process::Child>,
    socket_name: String,
}

impl MpvPlayer {
    /// Start mpv with a video window and connect to its IPC server.
    /// Fails if the binary is missing or the socket never answers.
    pub async fn spawn(
        config: &MpvConfig,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<Self> {
        let socket_name = platform::mpv_socket_name();
        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&socket_name).await;

        info!("mpv: spawning new process");
        let mpv_binary = platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--idle=yes")
            .arg("--keep-open=yes")
            .arg("--force-window=yes")
            .arg("--pause")
            .arg(platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(format!("--volume={}", config.default_volume.min(100)))
            .args(&config.extra_args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let handle = connect(&socket_name, event_tx).await?;
        handle.ping().await?;
        handle.observe_properties().await;
        info!("mpv: player ready");

        Ok(Self {
            handle,
            process: std::sync::Mutex::new(child),
            socket_name,
        })
    }
}

impl Drop for MpvPlayer {
    fn drop(&mut self) {
        if let Ok(mut child) = self.process.lock() {
            let _ = child.start_kill();
        }
        #[cfg(unix)]
        let _ = std::fs::remove_file(&self.socket_name);
    }
}

impl Player for MpvPlayer {
    async fn load(&self, media: &MediaRef) -> Result<(), PlayerError> {
        self.handle.set_property("pause", json!(true)).await?;
        self.handle
            .send(json!(["loadfile", media.watch_url(), "replace"]))
            .await?;
        Ok(())
    }

    async fn seek_to(&self, seconds: f64, allow_seek_ahead: bool) -> Result<(), PlayerError> {
        let flags = if allow_seek_ahead {
            "absolute"
        } else {
            "absolute+exact"
        };
        self.handle.send(json!(["seek", seconds, flags])).await?;
        Ok(())
    }

    async fn play(&self) -> Result<(), PlayerError> {
        Ok(self.handle.set_property("pause", json!(false)).await?)
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        Ok(self.handle.set_property("pause", json!(true)).await?)
    }

    async fn stop(&self) -> Result<(), PlayerError> {
        self.handle.send(json!(["stop"])).await?;
        Ok(())
    }

    async fn current_time(&self) -> Result<Option<f64>, PlayerError> {
        Ok(self
            .handle
            .get_property("time-pos")
            .await?
            .and_then(|v| v.as_f64()))
    }

    async fn duration(&self) -> Result<Option<f64>, PlayerError> {
        Ok(self
            .handle
            .get_property("duration")
            .await?
            .and_then(|v| v.as_f64()))
    }

    async fn set_playback_rate(&self, rate: f64) -> Result<(), PlayerError> {
        Ok(self.handle.set_property("speed", json!(rate)).await?)
    }

    async fn set_volume(&self, volume: u8) -> Result<(), PlayerError> {
        Ok(self
            .handle
            .set_property("volume", json!(volume.min(100)))
            .await?)
    }

    async fn state(&self) -> Result<PlayerState, PlayerError> {
        if self.handle.get_flag("idle-active").await? {
            return Ok(PlayerState::Unstarted);
        }
        if self.handle.get_flag("eof-reached").await? {
            return Ok(PlayerState::Ended);
        }
        if self.handle.get_flag("paused-for-cache").await? {
            return Ok(PlayerState::Buffering);
        }
        if self.handle.get_flag("pause").await? {
            Ok(PlayerState::Paused)
        } else {
            Ok(PlayerState::Playing)
        }
    }

    fn health(&self) -> PlayerHealth {
        let Ok(mut child) = self.process.lock() else {
            return PlayerHealth::Dead;
        };
        match child.try_wait() {
            Ok(None) => PlayerHealth::Running,
            Ok(Some(status)) => {
                debug!("mpv: process exited with {}", status);
                PlayerHealth::Dead
            }
            Err(_) => PlayerHealth::Dead,
        }
    }
}

// ── connection ────────────────────────────────────────────────────────────────

#[cfg(unix)]
async fn connect(socket_name: &str, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
    let socket_path = std::path::PathBuf::from(socket_name);
    for _ in 0..50 {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if socket_path.exists() {
            break;
        }
    }
    if !socket_path.exists() {
        anyhow::bail!("mpv IPC socket did not appear");
    }
    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

    let stream = UnixStream::connect(&socket_path).await?;
    info!("mpv: connected to IPC socket");
    let (read_half, write_half) = stream.into_split();
    Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx))
}

#[cfg(windows)]
async fn connect(socket_name: &str, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
    let pipe_path = format!(r"\\.\pipe\{}", socket_name);
    for _ in 0..50 {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if let Ok(client) = ClientOptions::new().open(&pipe_path) {
            info!("mpv: connected to named pipe");
            let (read_half, write_half) = tokio::io::split(client);
            return Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx));
        }
    }
    anyhow::bail!("mpv named pipe did not appear")
}

fn start_io_tasks<R, W>(
    reader: BufReader<R>,
    writer: W,
    event_tx: mpsc::Sender<MpvEvent>,
) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

/// Resolve a response line against the pending map, or hand it back as an
/// unsolicited event.
async fn route_line(val: Value, pending: &PendingMap) -> Option<MpvEvent> {
    let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) else {
        return Some(MpvEvent { raw: val });
    };
    let mut map = pending.lock().await;
    if let Some(tx) = map.remove(&req_id) {
        let result = match val["error"].as_str() {
            Some("success") => Ok(val),
            other => {
                let err = other.unwrap_or("unknown error").to_string();
                debug!("mpv reader: response req={} err={}", req_id, err);
                Err(IpcError::Rejected(err))
            }
        };
        let _ = tx.send(result);
    } else {
        debug!("mpv reader: response for unknown req={}", req_id);
    }
    None
}

async fn fail_pending(pending: &PendingMap) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(IpcError::Closed));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending).await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };
                if let Some(event) = route_line(val, &pending).await {
                    debug!("mpv reader: event {}", trimmed);
                    if event_tx.send(event).await.is_err() {
                        debug!("mpv reader: event receiver gone");
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending).await;
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(IpcError::Closed));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}
