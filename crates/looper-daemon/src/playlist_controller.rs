/// PlaylistController: plays the working set list end to end.
///
/// Each entry plays once from the top at its saved rate.  When an entry
/// ends the controller counts down (once per second) and then starts the
/// next one; after the last entry it shows a completion notice that clears
/// itself.  Countdown ticks carry a generation like the loop polls do, so a
/// stop or edit in the middle of a countdown cancels it deterministically.
use std::time::Duration;

use looper_proto::config::PlaylistConfig;
use looper_proto::protocol::{PlaylistState, PlaylistStatus};
use looper_proto::records::{PlaylistEntry, MAX_PLAYLIST_ENTRIES};
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::player::{Player, PlayerEvent, PlayerState};
use crate::scheduler::{Scheduler, Timer, TimerHandle};

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PlaylistSettings {
    pub countdown_secs: u32,
    pub completion_notice: Duration,
}

impl From<&PlaylistConfig> for PlaylistSettings {
    fn from(c: &PlaylistConfig) -> Self {
        Self {
            countdown_secs: c.countdown_secs.max(1),
            completion_notice: Duration::from_secs(c.completion_notice_secs),
        }
    }
}

impl Default for PlaylistSettings {
    fn default() -> Self {
        Self::from(&PlaylistConfig::default())
    }
}

pub struct PlaylistController<P: Player, S: Scheduler> {
    player: Option<P>,
    scheduler: S,
    settings: PlaylistSettings,
    entries: Vec<PlaylistEntry>,
    state: PlaylistState,
    generation: u64,
    countdown_timer: TimerHandle,
    notice: Option<String>,
    notice_generation: u64,
    notice_timer: TimerHandle,
}

impl<P: Player, S: Scheduler> PlaylistController<P, S> {
    pub fn new(scheduler: S, settings: PlaylistSettings) -> Self {
        Self {
            player: None,
            scheduler,
            settings,
            entries: Vec::new(),
            state: PlaylistState::Idle,
            generation: 0,
            countdown_timer: TimerHandle::detached(),
            notice: None,
            notice_generation: 0,
            notice_timer: TimerHandle::detached(),
        }
    }

    // ── player ownership ─────────────────────────────────────────────────────

    pub fn attach(&mut self, player: P) {
        self.player = Some(player);
    }

    /// Give the player up, ending playback without touching it.
    pub fn detach(&mut self) -> Option<P> {
        self.cancel_countdown();
        if self.state.is_active() {
            self.state = PlaylistState::Idle;
        }
        self.player.take()
    }

    pub fn player(&self) -> Option<&P> {
        self.player.as_ref()
    }

    // ── entries ──────────────────────────────────────────────────────────────

    pub fn entries(&self) -> &[PlaylistEntry] {
        &self.entries
    }

    /// Replace the whole list.  Any playback in progress is stopped.
    pub async fn set_entries(&mut self, entries: Vec<PlaylistEntry>) {
        if self.state.is_active() {
            self.stop().await;
        }
        self.entries = entries;
        self.entries.truncate(MAX_PLAYLIST_ENTRIES);
    }

    /// Insert an entry at `index` (or append).  Media already present in the
    /// list is rejected.
    pub fn add_entry(
        &mut self,
        entry: PlaylistEntry,
        index: Option<usize>,
    ) -> Result<(), ControlError> {
        if self
            .entries
            .iter()
            .any(|e| e.media_ref == entry.media_ref)
        {
            return Err(ControlError::DuplicateEntry);
        }
        if self.entries.len() >= MAX_PLAYLIST_ENTRIES {
            return Err(ControlError::PlaylistFull(MAX_PLAYLIST_ENTRIES));
        }
        let at = index.unwrap_or(self.entries.len()).min(self.entries.len());
        self.entries.insert(at, entry);

        if let Some(current) = self.state.current_index() {
            if at <= current {
                self.set_current_index(current + 1);
            }
        }
        Ok(())
    }

    /// Remove the entry at `index`.  Removing the entry that is playing (or
    /// that just finished, during a countdown) stops playback; removing an
    /// earlier one shifts the current index down.
    pub async fn remove_entry(&mut self, index: usize) -> Result<PlaylistEntry, ControlError> {
        if index >= self.entries.len() {
            return Err(ControlError::NoSuchEntry(index));
        }
        let removed = self.entries.remove(index);

        if let Some(current) = self.state.current_index() {
            if index == current {
                info!("PlaylistController: current entry removed, stopping");
                self.stop().await;
            } else if index < current {
                self.set_current_index(current - 1);
            }
        }
        Ok(removed)
    }

    /// Move an entry.  Only interrupts playback when the moved entry is the
    /// one playing.
    pub async fn move_entry(&mut self, from: usize, to: usize) -> Result<(), ControlError> {
        let len = self.entries.len();
        if from >= len {
            return Err(ControlError::NoSuchEntry(from));
        }
        if to >= len {
            return Err(ControlError::NoSuchEntry(to));
        }
        if from == to {
            return Ok(());
        }
        let entry = self.entries.remove(from);
        self.entries.insert(to, entry);

        if let Some(current) = self.state.current_index() {
            if current == from {
                info!("PlaylistController: current entry moved, stopping");
                self.stop().await;
            } else if from < current && to >= current {
                self.set_current_index(current - 1);
            } else if from > current && to <= current {
                self.set_current_index(current + 1);
            }
        }
        Ok(())
    }

    fn set_current_index(&mut self, new_index: usize) {
        self.state = match self.state {
            PlaylistState::Playing { .. } => PlaylistState::Playing { index: new_index },
            PlaylistState::Countdown { remaining, .. } => PlaylistState::Countdown {
                index: new_index,
                remaining,
            },
            other => other,
        };
    }

    // ── playback ─────────────────────────────────────────────────────────────

    /// Play from the first entry.
    pub async fn play(&mut self) -> Result<(), ControlError> {
        if self.entries.is_empty() {
            return Err(ControlError::EmptyPlaylist);
        }
        self.cancel_countdown();
        self.clear_notice();
        self.play_index(0).await
    }

    pub async fn play_index(&mut self, index: usize) -> Result<(), ControlError> {
        let entry = self
            .entries
            .get(index)
            .ok_or(ControlError::NoSuchEntry(index))?;
        let player = self.player.as_ref().ok_or(ControlError::NoPlayer)?;

        player.load(&entry.media_ref).await?;
        player.set_playback_rate(entry.playback_rate).await?;
        player.play().await?;

        info!(
            "PlaylistController: playing entry {} ({})",
            index, entry.media_ref
        );
        self.state = PlaylistState::Playing { index };
        Ok(())
    }

    /// Stop playback and return to `Idle`.  Player failures are logged.
    pub async fn stop(&mut self) {
        self.cancel_countdown();
        if let Some(player) = self.player.as_ref() {
            if let Err(e) = player.stop().await {
                warn!("PlaylistController: stop failed: {}", e);
            }
        }
        self.state = PlaylistState::Idle;
    }

    /// React to player notifications.  Returns a message when playback had
    /// to stop because of a failure.
    pub async fn on_player_event(&mut self, event: &PlayerEvent) -> Option<String> {
        match event {
            PlayerEvent::StateChange(PlayerState::Ended) => {
                self.on_entry_ended();
                None
            }
            PlayerEvent::Error(code) => {
                if !self.state.is_active() {
                    return None;
                }
                warn!("PlaylistController: player error {:?}, stopping", code);
                self.cancel_countdown();
                self.state = PlaylistState::Idle;
                Some(code.message().to_string())
            }
            _ => None,
        }
    }

    fn on_entry_ended(&mut self) {
        let PlaylistState::Playing { index } = self.state else {
            return;
        };
        if index + 1 >= self.entries.len() {
            self.finish();
            return;
        }
        debug!("PlaylistController: entry {} ended, counting down", index);
        self.state = PlaylistState::Countdown {
            index,
            remaining: self.settings.countdown_secs,
        };
        self.generation += 1;
        self.schedule_tick();
    }

    /// One countdown second elapsed.  Returns a message when starting the
    /// next entry failed.
    pub async fn on_countdown_tick(&mut self, generation: u64) -> Option<String> {
        if generation != self.generation {
            return None;
        }
        let PlaylistState::Countdown { index, remaining } = self.state else {
            return None;
        };

        let remaining = remaining.saturating_sub(1);
        if remaining > 0 {
            self.state = PlaylistState::Countdown { index, remaining };
            self.schedule_tick();
            return None;
        }

        let next = index + 1;
        if next >= self.entries.len() {
            self.finish();
            return None;
        }
        match self.play_index(next).await {
            Ok(()) => None,
            Err(e) => {
                warn!("PlaylistController: failed to start entry {}: {}", next, e);
                self.state = PlaylistState::Idle;
                Some("Error loading video. Please try again.".to_string())
            }
        }
    }

    fn finish(&mut self) {
        info!("PlaylistController: set list complete");
        self.cancel_countdown();
        self.state = PlaylistState::Finished;
        self.notice = Some("Set list complete".to_string());
        self.notice_generation += 1;
        self.notice_timer = self.scheduler.schedule(
            self.settings.completion_notice,
            Timer::PlaylistNotice {
                generation: self.notice_generation,
            },
        );
    }

    fn schedule_tick(&mut self) {
        self.countdown_timer = self.scheduler.schedule(
            COUNTDOWN_TICK,
            Timer::Countdown {
                generation: self.generation,
            },
        );
    }

    fn cancel_countdown(&mut self) {
        self.countdown_timer.cancel();
        self.generation += 1;
    }

    fn clear_notice(&mut self) {
        self.notice_timer.cancel();
        self.notice_generation += 1;
        self.notice = None;
    }

    pub fn on_notice_timer(&mut self, generation: u64) {
        if generation == self.notice_generation {
            self.notice = None;
        }
    }

    // ── reporting ────────────────────────────────────────────────────────────

    pub fn state(&self) -> PlaylistState {
        self.state
    }

    pub fn status(&self, loaded_playlist_id: Option<String>) -> PlaylistStatus {
        PlaylistStatus {
            state: self.state,
            entries: self.entries.clone(),
            loaded_playlist_id,
            notice: self.notice.clone(),
        }
    }

    pub fn shutdown(&mut self) {
        self.cancel_countdown();
        self.notice_timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::fake::{Call, FakePlayer};
    use crate::scheduler::manual::ManualScheduler;
    use looper_proto::records::LoopConfigDraft;

    type Controller = PlaylistController<FakePlayer, ManualScheduler>;

    fn entry(media: &str, rate: f64) -> PlaylistEntry {
        LoopConfigDraft {
            media_ref: Some(media.into()),
            start_time: Some(0.0),
            end_time: Some(10.0),
            target_loop_count: Some(1),
            playback_rate: Some(rate),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    async fn controller(player: &FakePlayer, n: usize) -> (Controller, ManualScheduler) {
        let scheduler = ManualScheduler::new();
        let mut c = PlaylistController::new(scheduler.clone(), PlaylistSettings::default());
        c.attach(player.clone());
        let ids = ["aaaaaaaaaaa", "bbbbbbbbbbb", "ccccccccccc", "ddddddddddd"];
        c.set_entries(ids[..n].iter().map(|id| entry(id, 1.0)).collect())
            .await;
        (c, scheduler)
    }

    async fn fire_countdown(c: &mut Controller, s: &ManualScheduler) -> usize {
        let mut ticks = 0;
        loop {
            let pending = s.take();
            let Some(generation) = pending.iter().rev().find_map(|(delay, t)| match t {
                Timer::Countdown { generation } => {
                    assert_eq!(*delay, COUNTDOWN_TICK);
                    Some(*generation)
                }
                _ => None,
            }) else {
                return ticks;
            };
            ticks += 1;
            c.on_countdown_tick(generation).await;
        }
    }

    #[tokio::test]
    async fn test_three_entries_countdown_then_finish() {
        let player = FakePlayer::new();
        let (mut c, s) = controller(&player, 3).await;

        c.play().await.unwrap();
        assert_eq!(c.state(), PlaylistState::Playing { index: 0 });

        c.on_player_event(&PlayerEvent::StateChange(PlayerState::Ended))
            .await;
        assert_eq!(
            c.state(),
            PlaylistState::Countdown {
                index: 0,
                remaining: 5
            }
        );
        assert_eq!(fire_countdown(&mut c, &s).await, 5);
        assert_eq!(c.state(), PlaylistState::Playing { index: 1 });

        c.on_player_event(&PlayerEvent::StateChange(PlayerState::Ended))
            .await;
        assert_eq!(fire_countdown(&mut c, &s).await, 5);
        assert_eq!(c.state(), PlaylistState::Playing { index: 2 });

        c.on_player_event(&PlayerEvent::StateChange(PlayerState::Ended))
            .await;
        assert_eq!(c.state(), PlaylistState::Finished);
        assert_eq!(c.status(None).notice.as_deref(), Some("Set list complete"));

        let pending = s.take();
        assert_eq!(pending.len(), 1);
        let (delay, Timer::PlaylistNotice { generation }) = pending[0] else {
            panic!("expected notice timer, got {:?}", pending);
        };
        assert_eq!(delay, Duration::from_secs(5));
        c.on_notice_timer(generation);
        assert!(c.status(None).notice.is_none());

        let loads: Vec<Call> = player
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Load(_)))
            .collect();
        assert_eq!(
            loads,
            vec![
                Call::Load("aaaaaaaaaaa".into()),
                Call::Load("bbbbbbbbbbb".into()),
                Call::Load("ccccccccccc".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_playlist_rejected() {
        let player = FakePlayer::new();
        let (mut c, _s) = controller(&player, 0).await;
        assert!(matches!(c.play().await, Err(ControlError::EmptyPlaylist)));
        assert!(player.calls().is_empty());
    }

    #[tokio::test]
    async fn test_entry_played_at_saved_rate() {
        let player = FakePlayer::new();
        let scheduler = ManualScheduler::new();
        let mut c: Controller = PlaylistController::new(scheduler, PlaylistSettings::default());
        c.attach(player.clone());
        c.set_entries(vec![entry("aaaaaaaaaaa", 0.5)]).await;
        c.play().await.unwrap();
        assert_eq!(
            player.calls(),
            vec![
                Call::Load("aaaaaaaaaaa".into()),
                Call::SetRate(0.5),
                Call::Play
            ]
        );
    }

    #[tokio::test]
    async fn test_remove_current_stops_playback() {
        let player = FakePlayer::new();
        let (mut c, _s) = controller(&player, 3).await;
        c.play_index(1).await.unwrap();
        player.clear_calls();

        c.remove_entry(1).await.unwrap();
        assert_eq!(c.state(), PlaylistState::Idle);
        assert_eq!(player.calls(), vec![Call::Stop]);
        assert_eq!(c.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_earlier_shifts_index() {
        let player = FakePlayer::new();
        let (mut c, _s) = controller(&player, 3).await;
        c.play_index(2).await.unwrap();
        c.remove_entry(0).await.unwrap();
        assert_eq!(c.state(), PlaylistState::Playing { index: 1 });
        c.remove_entry(1).await.unwrap();
        assert_eq!(c.state(), PlaylistState::Idle);
    }

    #[tokio::test]
    async fn test_remove_during_countdown() {
        let player = FakePlayer::new();
        let (mut c, s) = controller(&player, 3).await;
        c.play().await.unwrap();
        c.on_player_event(&PlayerEvent::StateChange(PlayerState::Ended))
            .await;
        let stale = s.take();

        // removing a later entry keeps the countdown going
        c.remove_entry(2).await.unwrap();
        assert!(matches!(c.state(), PlaylistState::Countdown { index: 0, .. }));

        // removing the finished entry stops it; the pending tick is dead
        c.remove_entry(0).await.unwrap();
        assert_eq!(c.state(), PlaylistState::Idle);
        for (_, timer) in stale {
            if let Timer::Countdown { generation } = timer {
                assert!(c.on_countdown_tick(generation).await.is_none());
            }
        }
        assert_eq!(c.state(), PlaylistState::Idle);
    }

    #[tokio::test]
    async fn test_move_entry_rules() {
        let player = FakePlayer::new();
        let (mut c, _s) = controller(&player, 4).await;
        c.play_index(1).await.unwrap();

        // move something from after to before the current entry
        c.move_entry(3, 0).await.unwrap();
        assert_eq!(c.state(), PlaylistState::Playing { index: 2 });
        assert_eq!(c.entries()[2].media_ref.as_str(), "bbbbbbbbbbb");

        // move something from before to after
        c.move_entry(0, 3).await.unwrap();
        assert_eq!(c.state(), PlaylistState::Playing { index: 1 });
        assert_eq!(c.entries()[1].media_ref.as_str(), "bbbbbbbbbbb");

        // moving the playing entry stops
        c.move_entry(1, 0).await.unwrap();
        assert_eq!(c.state(), PlaylistState::Idle);
    }

    #[tokio::test]
    async fn test_duplicate_media_rejected() {
        let player = FakePlayer::new();
        let (mut c, _s) = controller(&player, 2).await;
        assert!(matches!(
            c.add_entry(entry("aaaaaaaaaaa", 1.0), None),
            Err(ControlError::DuplicateEntry)
        ));
        c.play_index(0).await.unwrap();
        c.add_entry(entry("eeeeeeeeeee", 1.0), Some(0)).unwrap();
        assert_eq!(c.state(), PlaylistState::Playing { index: 1 });
        assert_eq!(c.entries().len(), 3);
    }

    #[tokio::test]
    async fn test_full_list_rejects_more_entries() {
        let player = FakePlayer::new();
        let (mut c, _s) = controller(&player, 0).await;
        for i in 0..MAX_PLAYLIST_ENTRIES {
            c.add_entry(entry(&format!("entry{:06}", i), 1.0), None)
                .unwrap();
        }
        let err = c
            .add_entry(entry("eeeeeeeeeee", 1.0), None)
            .unwrap_err();
        assert_eq!(err.to_string(), "The set list is full (100 songs).");
        assert_eq!(c.entries().len(), MAX_PLAYLIST_ENTRIES);
    }

    #[tokio::test]
    async fn test_player_error_stops_with_message() {
        let player = FakePlayer::new();
        let (mut c, _s) = controller(&player, 2).await;
        c.play().await.unwrap();
        let msg = c
            .on_player_event(&PlayerEvent::Error(
                crate::player::PlayerErrorCode::NotFound,
            ))
            .await;
        assert!(msg.unwrap().starts_with("Video not found"));
        assert_eq!(c.state(), PlaylistState::Idle);
    }

    #[tokio::test]
    async fn test_failed_advance_returns_to_idle() {
        let player = FakePlayer::new();
        let (mut c, s) = controller(&player, 2).await;
        c.play().await.unwrap();
        c.on_player_event(&PlayerEvent::StateChange(PlayerState::Ended))
            .await;
        player.fail_play(true);
        for _ in 0..4 {
            let Some((_, Timer::Countdown { generation })) = s.take().pop() else {
                panic!("expected countdown tick");
            };
            assert!(c.on_countdown_tick(generation).await.is_none());
        }
        let Some((_, Timer::Countdown { generation })) = s.take().pop() else {
            panic!("expected final countdown tick");
        };
        assert!(c.on_countdown_tick(generation).await.is_some());
        assert_eq!(c.state(), PlaylistState::Idle);
    }
}
