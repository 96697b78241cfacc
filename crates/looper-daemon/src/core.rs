/// SessionCore: single-owner event loop for all mutable session state.
///
/// HTTP handlers, the mpv event forwarder, scheduled timers, metadata
/// lookups and the heartbeat all send `CoreEvent`s into one channel.  The
/// core owns the store, both controllers and the player; nothing else
/// touches them.  Every command carries a oneshot for its `Reply`.
///
/// The player lives in exactly one controller at a time.  Playing the set
/// list moves it from the loop controller to the playlist controller; stopping
/// the set list (or loading media) moves it back.
use std::time::Duration;

use looper_proto::config::Config;
use looper_proto::error::{StoreError, ValidationError};
use looper_proto::kv::KvStore;
use looper_proto::media_ref::{self, MediaRef};
use looper_proto::protocol::{Command, Mode, PlayerHealth, Reply, SessionState};
use looper_proto::records::{
    DefaultItemDraft, LoopConfigDraft, MediaMetadata, RecentItemDraft, MAX_URL_LEN,
};
use looper_proto::store::PersistenceStore;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::ControlError;
use crate::loop_controller::{LoadOrigin, LoopController, LoopDefaults};
use crate::metadata::{LookupError, MetadataClient};
use crate::player::{Player, PlayerEvent};
use crate::playlist_controller::{PlaylistController, PlaylistSettings};
use crate::scheduler::{Scheduler, Timer};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

// ── CoreEvent ─────────────────────────────────────────────────────────────────

/// All inputs into the SessionCore loop.
#[derive(Debug)]
pub enum CoreEvent {
    /// A command from the HTTP API.
    Request {
        command: Command,
        reply: oneshot::Sender<Reply>,
    },
    /// Player notification (translated from mpv by the forwarder task).
    Player(PlayerEvent),
    Timer(Timer),
    /// Result of a metadata lookup started after a load.
    Metadata {
        media_ref: MediaRef,
        result: Result<MediaMetadata, LookupError>,
    },
    /// Heartbeat: check player liveness.
    HeartbeatTick,
    Shutdown,
}

// ── SessionCore ───────────────────────────────────────────────────────────────

pub struct SessionCore<P: Player, K: KvStore, S: Scheduler + Clone> {
    store: PersistenceStore<K>,
    looper: LoopController<P, S>,
    playlist: PlaylistController<P, S>,
    mode: Mode,
    metadata: Option<MetadataClient>,
    /// Used to feed metadata results and heartbeats back into the loop.
    event_tx: mpsc::Sender<CoreEvent>,
    loaded_playlist_id: Option<String>,
    volume: u8,
    player_health: PlayerHealth,
    error: Option<String>,
    rev: u64,
}

impl<P: Player, K: KvStore, S: Scheduler + Clone> SessionCore<P, K, S> {
    pub fn new(
        config: &Config,
        store: PersistenceStore<K>,
        scheduler: S,
        event_tx: mpsc::Sender<CoreEvent>,
    ) -> Self {
        Self {
            store,
            looper: LoopController::new(scheduler.clone(), LoopDefaults::from(&config.looping)),
            playlist: PlaylistController::new(scheduler, PlaylistSettings::from(&config.playlist)),
            mode: Mode::Loop,
            metadata: config
                .metadata
                .enabled
                .then(|| MetadataClient::new(&config.metadata)),
            event_tx,
            loaded_playlist_id: None,
            volume: config.mpv.default_volume.min(100),
            player_health: PlayerHealth::Absent,
            error: None,
            rev: 0,
        }
    }

    pub fn without_metadata(mut self) -> Self {
        self.metadata = None;
        self
    }

    /// Hand the player to the loop controller.
    pub fn attach_player(&mut self, player: P) {
        self.player_health = player.health();
        self.looper.attach(player);
        self.mode = Mode::Loop;
    }

    /// Restore the working set list and auto-load the default item.
    pub async fn restore(&mut self) {
        let working = self.store.load_working_playlist();
        if !working.records.is_empty() {
            info!(
                "SessionCore: restored working set list ({} entries, {} dropped)",
                working.records.len(),
                working.dropped
            );
        }
        self.playlist.set_entries(working.records).await;

        if let Some(item) = self.store.load_default() {
            info!("SessionCore: loading default item {}", item.media_ref);
            if let Err(e) = self
                .load(item.media_ref, item.source_url, LoadOrigin::Fresh)
                .await
            {
                warn!("SessionCore: failed to load default item: {}", e);
                self.error = Some(e.to_string());
            }
        }
        self.rev += 1;
    }

    /// Run the core event loop.  Returns on `Shutdown` or when every sender
    /// is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!("SessionCore: starting event loop");

        let heartbeat_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if heartbeat_tx.send(CoreEvent::HeartbeatTick).await.is_err() {
                    break;
                }
            }
        });

        while let Some(event) = event_rx.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Process one event.  Returns `false` once shutdown was requested.
    pub async fn handle_event(&mut self, event: CoreEvent) -> bool {
        match event {
            CoreEvent::Shutdown => {
                info!("SessionCore: shutdown requested");
                return false;
            }
            CoreEvent::Request { command, reply } => {
                let response = self.handle_command(command).await;
                if reply.send(response).is_err() {
                    debug!("SessionCore: requester went away before the reply");
                }
            }
            CoreEvent::Player(event) => self.handle_player_event(event).await,
            CoreEvent::Timer(timer) => self.handle_timer(timer).await,
            CoreEvent::Metadata { media_ref, result } => self.apply_metadata(media_ref, result),
            CoreEvent::HeartbeatTick => self.heartbeat(),
        }
        true
    }

    async fn cleanup(&mut self) {
        self.looper.shutdown();
        self.playlist.shutdown();
        let player = match self.mode {
            Mode::Loop => self.looper.player(),
            Mode::Playlist => self.playlist.player(),
        };
        if let Some(player) = player {
            if let Err(e) = player.stop().await {
                debug!("SessionCore: stop on shutdown failed: {}", e);
            }
        }
        info!("SessionCore: stopped");
    }

    // ── snapshot ──────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> SessionState {
        SessionState {
            rev: self.rev,
            mode: self.mode,
            loop_status: self.looper.status(),
            playlist: self.playlist.status(self.loaded_playlist_id.clone()),
            player_health: self.player_health.clone(),
            volume: self.volume,
            error: self.error.clone(),
        }
    }

    // ── commands ──────────────────────────────────────────────────────────────

    pub async fn handle_command(&mut self, command: Command) -> Reply {
        let mutates = !matches!(
            command,
            Command::GetState
                | Command::ListRecent
                | Command::GetDefault
                | Command::ListLoopConfigs
                | Command::ListPlaylists
        );
        if mutates {
            debug!("SessionCore: command {:?}", command);
        }

        let result = self.dispatch(command).await;
        if mutates {
            self.rev += 1;
        }
        match result {
            Ok(Some(reply)) => reply,
            Ok(None) => Reply::State {
                data: self.snapshot(),
            },
            Err(e) => {
                warn!("SessionCore: command failed: {}", e);
                Reply::error(e.kind(), e.to_string())
            }
        }
    }

    /// `Ok(None)` means "reply with the current snapshot".
    async fn dispatch(&mut self, command: Command) -> Result<Option<Reply>, ControlError> {
        match command {
            // media
            Command::LoadMedia { input } => {
                let media = media_ref::extract(&input).ok_or(ValidationError::InvalidMediaRef)?;
                let source_url = source_url_for(&input, &media);
                self.load(media, source_url, LoadOrigin::Fresh).await?;
            }
            Command::LoadRecent { media_ref } => {
                let media = MediaRef::parse(&media_ref)?;
                let source_url = media.watch_url();
                self.load(media, source_url, LoadOrigin::Recent).await?;
            }
            Command::LoadDefault => {
                let item = self
                    .store
                    .load_default()
                    .ok_or_else(|| StoreError::NotFound("default item".to_string()))?;
                self.load(item.media_ref, item.source_url, LoadOrigin::Fresh)
                    .await?;
            }
            Command::LoadLoopConfig { id } => {
                let config = self
                    .store
                    .find_loop_config(&id)
                    .ok_or(ControlError::NoSuchConfig(id))?;
                let media = config.media_ref.clone();
                let source_url = config.source_url.clone();
                self.load(media, source_url, LoadOrigin::Saved(config)).await?;
            }

            // segment / settings
            Command::SetStart { text, commit } => self.looper.set_start_text(&text, commit),
            Command::SetEnd { text, commit } => self.looper.set_end_text(&text, commit),
            Command::CaptureStart => {
                self.ensure_loop_mode("capture start").await?;
                self.looper.capture_start().await?;
            }
            Command::CaptureEnd => {
                self.ensure_loop_mode("capture end").await?;
                self.looper.capture_end().await?;
            }
            Command::SetTargetLoops { count } => self.looper.set_target_loops(count)?,
            Command::SetPlaybackRate { rate } => self.looper.set_playback_rate(rate).await?,
            Command::SetVolume { volume } => self.set_volume(volume).await?,

            // loop control
            Command::StartLoop => {
                self.ensure_loop_mode("start loop").await?;
                self.looper.start().await?;
            }
            Command::PauseLoop => {
                self.ensure_loop_mode("pause loop").await?;
                self.looper.pause().await?;
            }
            Command::ToggleLoop => {
                self.ensure_loop_mode("toggle loop").await?;
                self.looper.toggle().await?;
            }
            Command::ResetLoop => {
                self.ensure_loop_mode("reset loop").await?;
                self.looper.reset().await?;
            }
            Command::ResetConfiguration => {
                self.ensure_loop_mode("reset configuration").await?;
                self.looper.reset_configuration().await;
            }

            // storage
            Command::SaveLoopConfig => {
                let media = self.looper.media().cloned().ok_or(ControlError::NoMedia)?;
                let (start, end, target, rate) = self.looper.segment();
                let meta = self.known_metadata(&media);
                self.store.save_loop_config(LoopConfigDraft {
                    media_ref: Some(media.to_string()),
                    source_url: self.looper.source_url().map(str::to_string),
                    start_time: Some(start),
                    end_time: Some(end),
                    target_loop_count: Some(i64::from(target)),
                    playback_rate: Some(rate),
                    title: Some(meta.title),
                    author: Some(meta.author),
                    thumbnail_url: Some(meta.thumbnail_url),
                    ..Default::default()
                })?;
                return Ok(Some(self.list_loop_configs()));
            }
            Command::DeleteLoopConfig { id } => {
                let items = self.store.delete_loop_config(&id)?;
                return Ok(Some(Reply::LoopConfigs { items, dropped: 0 }));
            }
            Command::DeleteRecent { media_ref } => {
                let media = MediaRef::parse(&media_ref)?;
                let items = self.store.delete_recent(&media)?;
                return Ok(Some(Reply::Recent { items, dropped: 0 }));
            }
            Command::SetDefault => {
                let media = self.looper.media().cloned().ok_or(ControlError::NoMedia)?;
                let meta = self.known_metadata(&media);
                let item = self.store.save_default(DefaultItemDraft {
                    media_ref: Some(media.to_string()),
                    source_url: self.looper.source_url().map(str::to_string),
                    title: Some(meta.title),
                    author: Some(meta.author),
                    thumbnail_url: Some(meta.thumbnail_url),
                    set_at: None,
                })?;
                info!("SessionCore: default item set to {}", item.media_ref);
                return Ok(Some(Reply::Default { item: Some(item) }));
            }
            Command::ClearDefault => {
                self.store.clear_default()?;
                return Ok(Some(Reply::Default { item: None }));
            }

            // playlists
            Command::SavePlaylist { name } => {
                // a list loaded from a saved playlist is saved back over it
                let id = match self.loaded_playlist_id.as_deref() {
                    Some(id) => self
                        .store
                        .update_playlist(id, &name, self.playlist.entries())?
                        .playlist()
                        .id
                        .clone(),
                    None => self.store.save_playlist(&name, self.playlist.entries())?.id,
                };
                self.loaded_playlist_id = Some(id);
                return Ok(Some(self.list_playlists()));
            }
            Command::UpdatePlaylist { id, name } => {
                let saved = self
                    .store
                    .update_playlist(&id, &name, self.playlist.entries())?;
                self.loaded_playlist_id = Some(saved.playlist().id.clone());
                return Ok(Some(self.list_playlists()));
            }
            Command::LoadPlaylist { id } => {
                let saved = self
                    .store
                    .find_playlist(&id)
                    .ok_or_else(|| StoreError::NotFound(id.clone()))?;
                self.stop_playlist().await;
                self.playlist.set_entries(saved.entries).await;
                self.loaded_playlist_id = Some(saved.id);
                self.persist_working_playlist();
            }
            Command::DeletePlaylist { id } => {
                let items = self.store.delete_playlist(&id)?;
                if self.loaded_playlist_id.as_deref() == Some(id.as_str()) {
                    self.loaded_playlist_id = None;
                }
                return Ok(Some(Reply::Playlists { items, dropped: 0 }));
            }
            Command::NewPlaylist => {
                self.stop_playlist().await;
                self.playlist.set_entries(Vec::new()).await;
                self.loaded_playlist_id = None;
                self.persist_working_playlist();
            }
            Command::AddPlaylistEntry { config_id, index } => {
                let entry = self
                    .store
                    .find_loop_config(&config_id)
                    .ok_or(ControlError::NoSuchConfig(config_id))?;
                self.playlist.add_entry(entry, index)?;
                self.persist_working_playlist();
            }
            Command::RemovePlaylistEntry { index } => {
                self.playlist.remove_entry(index).await?;
                self.persist_working_playlist();
                self.reclaim_if_stopped().await;
            }
            Command::MovePlaylistEntry { from, to } => {
                self.playlist.move_entry(from, to).await?;
                self.persist_working_playlist();
                self.reclaim_if_stopped().await;
            }
            Command::PlayPlaylist => self.play_playlist().await?,
            Command::StopPlaylist => self.stop_playlist().await,

            // queries
            Command::GetState => {}
            Command::ListRecent => {
                let loaded = self.store.load_recent();
                return Ok(Some(Reply::Recent {
                    items: loaded.records,
                    dropped: loaded.dropped,
                }));
            }
            Command::GetDefault => {
                return Ok(Some(Reply::Default {
                    item: self.store.load_default(),
                }));
            }
            Command::ListLoopConfigs => return Ok(Some(self.list_loop_configs())),
            Command::ListPlaylists => return Ok(Some(self.list_playlists())),
        }
        Ok(None)
    }

    fn list_loop_configs(&self) -> Reply {
        let loaded = self.store.load_loop_configs();
        Reply::LoopConfigs {
            items: loaded.records,
            dropped: loaded.dropped,
        }
    }

    fn list_playlists(&self) -> Reply {
        let loaded = self.store.load_playlists();
        Reply::Playlists {
            items: loaded.records,
            dropped: loaded.dropped,
        }
    }

    // ── media loading ─────────────────────────────────────────────────────────

    async fn load(
        &mut self,
        media: MediaRef,
        source_url: String,
        origin: LoadOrigin,
    ) -> Result<(), ControlError> {
        if self.mode == Mode::Playlist {
            self.playlist.stop().await;
            self.reclaim_player();
        }
        self.looper
            .load_media(media.clone(), source_url, origin)
            .await?;
        self.error = None;
        self.record_recent(&media);
        self.lookup_metadata(media);
        Ok(())
    }

    /// Move the media to the front of the recent list, keeping whatever
    /// metadata is already known for it.
    fn record_recent(&mut self, media: &MediaRef) {
        let meta = self.known_metadata(media);
        let draft = RecentItemDraft {
            media_ref: Some(media.to_string()),
            title: Some(meta.title),
            author: Some(meta.author),
            thumbnail_url: Some(meta.thumbnail_url),
            last_used_at: None,
        };
        if let Err(e) = self.store.save_recent(draft) {
            warn!("SessionCore: failed to record recent item: {}", e);
        }
    }

    /// Metadata from the recent list, or the placeholder.
    fn known_metadata(&self, media: &MediaRef) -> MediaMetadata {
        self.store
            .load_recent()
            .records
            .into_iter()
            .find(|r| &r.media_ref == media)
            .map(|r| MediaMetadata {
                title: r.title,
                author: r.author,
                thumbnail_url: r.thumbnail_url,
            })
            .unwrap_or_else(|| MediaMetadata::placeholder(media))
    }

    fn lookup_metadata(&self, media: MediaRef) {
        let Some(client) = self.metadata.clone() else {
            return;
        };
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = client.fetch(&media).await;
            if tx
                .send(CoreEvent::Metadata {
                    media_ref: media,
                    result,
                })
                .await
                .is_err()
            {
                debug!("metadata: session gone, dropping lookup result");
            }
        });
    }

    fn apply_metadata(&mut self, media: MediaRef, result: Result<MediaMetadata, LookupError>) {
        let meta = match result {
            Ok(meta) => meta,
            Err(e) => {
                warn!("SessionCore: metadata lookup for {} failed: {}", media, e);
                MediaMetadata::placeholder(&media)
            }
        };
        match self.store.refresh_recent(&media, &meta) {
            Ok(true) => debug!("SessionCore: refreshed recent item {}", media),
            Ok(false) => {}
            Err(e) => warn!("SessionCore: failed to refresh recent item: {}", e),
        }
        if let Err(e) = self.store.refresh_default(&media, &meta) {
            warn!("SessionCore: failed to refresh default item: {}", e);
        }
        self.rev += 1;
    }

    async fn set_volume(&mut self, volume: i64) -> Result<(), ControlError> {
        self.volume = volume.clamp(0, 100) as u8;
        let player = match self.mode {
            Mode::Loop => self.looper.player(),
            Mode::Playlist => self.playlist.player(),
        };
        if let Some(player) = player {
            player.set_volume(self.volume).await?;
        }
        Ok(())
    }

    // ── mode switching ────────────────────────────────────────────────────────

    async fn play_playlist(&mut self) -> Result<(), ControlError> {
        if self.playlist.entries().is_empty() {
            return Err(ControlError::EmptyPlaylist);
        }
        if self.mode == Mode::Loop {
            let player = self.looper.detach().ok_or(ControlError::NoPlayer)?;
            self.playlist.attach(player);
            self.mode = Mode::Playlist;
            info!("SessionCore: player moved to the set list");
        }
        if let Err(e) = self.playlist.play().await {
            self.return_to_loop().await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop set-list playback (if any) and give the player back to the loop
    /// controller.
    async fn stop_playlist(&mut self) {
        if self.mode != Mode::Playlist {
            return;
        }
        self.playlist.stop().await;
        self.return_to_loop().await;
    }

    /// After an edit stopped the set list, hand the player back.
    async fn reclaim_if_stopped(&mut self) {
        if self.mode == Mode::Playlist && !self.playlist.state().is_active() {
            self.return_to_loop().await;
        }
    }

    /// Loop commands need the player.  A set list that is no longer playing
    /// gives it up; one that is playing must be stopped first.
    async fn ensure_loop_mode(&mut self, op: &'static str) -> Result<(), ControlError> {
        if self.mode == Mode::Loop {
            return Ok(());
        }
        if self.playlist.state().is_active() {
            return Err(ControlError::invalid_state(op, self.playlist.state()));
        }
        self.return_to_loop().await;
        Ok(())
    }

    /// Give the player back and load the loop media again.
    async fn return_to_loop(&mut self) {
        if self.mode == Mode::Loop {
            return;
        }
        self.reclaim_player();
        if let Err(e) = self.looper.reload().await {
            warn!("SessionCore: failed to reload loop media: {}", e);
        }
    }

    fn reclaim_player(&mut self) {
        if let Some(player) = self.playlist.detach() {
            self.looper.attach(player);
        }
        self.mode = Mode::Loop;
        info!("SessionCore: player returned to the loop controller");
    }

    fn persist_working_playlist(&mut self) {
        if let Err(e) = self.store.save_working_playlist(self.playlist.entries()) {
            warn!("SessionCore: failed to persist working set list: {}", e);
        }
    }

    // ── events ────────────────────────────────────────────────────────────────

    async fn handle_player_event(&mut self, event: PlayerEvent) {
        debug!("SessionCore: player event {:?} ({:?} mode)", event, self.mode);
        match self.mode {
            Mode::Loop => {
                if let PlayerEvent::Error(code) = &event {
                    self.error = Some(code.message().to_string());
                }
                self.looper.on_player_event(&event).await;
            }
            Mode::Playlist => {
                if let Some(message) = self.playlist.on_player_event(&event).await {
                    self.error = Some(message);
                }
            }
        }
        self.rev += 1;
    }

    async fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::LoopPoll { generation } => self.looper.on_poll(generation).await,
            Timer::LoopNotice { generation } => self.looper.on_notice_timer(generation),
            Timer::DurationProbe { generation } => self.looper.on_duration_probe(generation).await,
            Timer::Countdown { generation } => {
                if let Some(message) = self.playlist.on_countdown_tick(generation).await {
                    self.error = Some(message);
                }
            }
            Timer::PlaylistNotice { generation } => self.playlist.on_notice_timer(generation),
        }
        self.rev += 1;
    }

    fn heartbeat(&mut self) {
        let player = match self.mode {
            Mode::Loop => self.looper.player(),
            Mode::Playlist => self.playlist.player(),
        };
        let health = player.map_or(PlayerHealth::Absent, |p| p.health());
        if health != self.player_health {
            if health.is_unhealthy() {
                error!(
                    "SessionCore: heartbeat: player health {:?} → {:?}",
                    self.player_health, health
                );
                self.error = Some("The video player stopped. Please restart the player.".into());
            } else {
                info!(
                    "SessionCore: player health {:?} → {:?}",
                    self.player_health, health
                );
            }
            self.player_health = health;
            self.rev += 1;
        }
    }
}

/// Keep a pasted URL as the source; bare ids get the canonical watch URL.
fn source_url_for(input: &str, media: &MediaRef) -> String {
    let input = input.trim();
    if (input.starts_with("http://") || input.starts_with("https://"))
        && input.chars().count() <= MAX_URL_LEN
    {
        input.to_string()
    } else {
        media.watch_url()
    }
}
