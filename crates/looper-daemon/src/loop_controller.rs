/// LoopController: repeats one segment of the loaded media a bounded number
/// of times.
///
/// States:
///
/// ```text
///   Idle ──Ready──▶ Armed ──start──▶ Looping ⇄ Paused
///                     ▲                 │
///                     └────reset────────┤
///                                       └──target reached──▶ Completed
/// ```
///
/// While `Looping` the controller polls the player position: every 500 ms
/// while more than 5 s of the segment remain, every 100 ms near the end.
/// Crossing the end boundary is edge-triggered (a position at or past `end`
/// counts once, and re-arms only after a reading below `end`).  A player
/// `Ended` event while looping counts as a crossing too: a player that holds
/// the last frame never reports a position at the media duration.  Each poll
/// carries the generation it was scheduled under; `pause`, `reset`,
/// completion and `detach` bump the generation, which turns any poll still in
/// flight into a no-op.
use std::time::Duration;

use looper_proto::config::LoopingConfig;
use looper_proto::error::ValidationError;
use looper_proto::media_ref::MediaRef;
use looper_proto::protocol::{LoopState, LoopStatus};
use looper_proto::records::{
    snap_playback_rate, validate_playback_rate, validate_segment, validate_target_loops,
    LoopConfig,
};
use looper_proto::timecode;
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::player::{Player, PlayerError, PlayerEvent, PlayerState};
use crate::scheduler::{Scheduler, Timer, TimerHandle};

pub const POLL_SLOW: Duration = Duration::from_millis(500);
pub const POLL_FAST: Duration = Duration::from_millis(100);
/// Remaining segment time below which polling switches to `POLL_FAST`.
pub const FAST_POLL_THRESHOLD_SECS: f64 = 5.0;

const DURATION_PROBE_INTERVAL: Duration = Duration::from_millis(250);
const DURATION_PROBE_ATTEMPTS: u32 = 40;

/// Where the media being loaded came from.  Decides whether the end time
/// follows the media duration once it is known.
#[derive(Debug, Clone)]
pub enum LoadOrigin {
    /// Typed or pasted by the user.
    Fresh,
    /// Picked from the recent list.
    Recent,
    /// A saved loop configuration: its bounds, target and rate are kept.
    Saved(LoopConfig),
}

/// Form values used on start-up and by "reset configuration".
#[derive(Debug, Clone)]
pub struct LoopDefaults {
    pub target_loops: u32,
    pub start_secs: f64,
    pub end_secs: f64,
    pub playback_rate: f64,
    pub completion_notice: Duration,
}

impl From<&LoopingConfig> for LoopDefaults {
    fn from(c: &LoopingConfig) -> Self {
        Self {
            target_loops: validate_target_loops(i64::from(c.default_target_loops)).unwrap_or(5),
            start_secs: timecode::clamp_seconds(c.default_start_secs),
            end_secs: timecode::clamp_seconds(c.default_end_secs),
            playback_rate: validate_playback_rate(c.default_playback_rate)
                .map(snap_playback_rate)
                .unwrap_or(1.0),
            completion_notice: Duration::from_secs(c.completion_notice_secs),
        }
    }
}

impl Default for LoopDefaults {
    fn default() -> Self {
        Self::from(&LoopingConfig::default())
    }
}

pub struct LoopController<P: Player, S: Scheduler> {
    player: Option<P>,
    scheduler: S,
    defaults: LoopDefaults,
    state: LoopState,

    media: Option<MediaRef>,
    source_url: Option<String>,
    /// End time stays as loaded instead of following the duration.
    keep_bounds: bool,
    media_ready: bool,

    start_secs: f64,
    end_secs: f64,
    start_text: String,
    end_text: String,
    target_loops: u32,
    playback_rate: f64,
    duration: Option<f64>,
    position: Option<f64>,
    validation_error: Option<ValidationError>,

    loops_completed: u32,
    /// Set once a reading at/past the end has been counted.
    at_boundary: bool,
    /// The seek back to start failed; retried on the next poll.
    seek_pending: bool,

    poll_generation: u64,
    poll_timer: TimerHandle,
    probe_generation: u64,
    probe_attempts: u32,
    probe_timer: TimerHandle,
    notice: Option<String>,
    notice_generation: u64,
    notice_timer: TimerHandle,
}

impl<P: Player, S: Scheduler> LoopController<P, S> {
    pub fn new(scheduler: S, defaults: LoopDefaults) -> Self {
        let mut controller = Self {
            player: None,
            scheduler,
            state: LoopState::Idle,
            media: None,
            source_url: None,
            keep_bounds: false,
            media_ready: false,
            start_secs: defaults.start_secs,
            end_secs: defaults.end_secs,
            start_text: timecode::format(defaults.start_secs),
            end_text: timecode::format(defaults.end_secs),
            target_loops: defaults.target_loops,
            playback_rate: defaults.playback_rate,
            duration: None,
            position: None,
            validation_error: None,
            loops_completed: 0,
            at_boundary: false,
            seek_pending: false,
            poll_generation: 0,
            poll_timer: TimerHandle::detached(),
            probe_generation: 0,
            probe_attempts: 0,
            probe_timer: TimerHandle::detached(),
            notice: None,
            notice_generation: 0,
            notice_timer: TimerHandle::detached(),
            defaults,
        };
        controller.revalidate();
        controller
    }

    // ── player ownership ─────────────────────────────────────────────────────

    pub fn attach(&mut self, player: P) {
        self.player = Some(player);
    }

    /// Give the player up.  Looping stops; the form values and media
    /// reference stay so `reload` can bring the media back.
    pub fn detach(&mut self) -> Option<P> {
        self.stop_polling();
        self.stop_probing();
        self.media_ready = false;
        self.position = None;
        self.state = LoopState::Idle;
        self.player.take()
    }

    pub fn player(&self) -> Option<&P> {
        self.player.as_ref()
    }

    /// Load the current media again, e.g. after getting the player back.
    pub async fn reload(&mut self) -> Result<(), ControlError> {
        let Some(media) = self.media.clone() else {
            return Ok(());
        };
        let player = self.player.as_ref().ok_or(ControlError::NoPlayer)?;
        player.load(&media).await?;
        self.media_ready = false;
        self.state = LoopState::Idle;
        Ok(())
    }

    // ── media ────────────────────────────────────────────────────────────────

    pub async fn load_media(
        &mut self,
        media: MediaRef,
        source_url: String,
        origin: LoadOrigin,
    ) -> Result<(), ControlError> {
        let player = self.player.as_ref().ok_or(ControlError::NoPlayer)?;
        player.load(&media).await?;

        self.stop_polling();
        self.stop_probing();
        self.clear_notice();
        self.state = LoopState::Idle;
        self.media_ready = false;
        self.duration = None;
        self.position = None;
        self.loops_completed = 0;
        self.at_boundary = false;
        self.seek_pending = false;

        match origin {
            LoadOrigin::Saved(config) => {
                self.keep_bounds = true;
                self.set_bounds(config.start_time, config.end_time);
                self.target_loops = config.target_loop_count;
                self.playback_rate = snap_playback_rate(config.playback_rate);
            }
            LoadOrigin::Fresh | LoadOrigin::Recent => {
                self.keep_bounds = false;
                self.set_bounds(self.defaults.start_secs, self.defaults.end_secs);
            }
        }

        info!("LoopController: loaded {} (keep_bounds={})", media, self.keep_bounds);
        self.media = Some(media);
        self.source_url = Some(source_url);
        self.revalidate();
        Ok(())
    }

    pub fn media(&self) -> Option<&MediaRef> {
        self.media.as_ref()
    }

    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    pub async fn on_player_event(&mut self, event: &PlayerEvent) {
        match event {
            PlayerEvent::Ready => {
                if self.media.is_none() || self.media_ready {
                    return;
                }
                self.media_ready = true;
                self.state = LoopState::Armed;
                debug!("LoopController: media ready");
                self.probe_attempts = 0;
                self.probe_generation += 1;
                self.probe_duration().await;
            }
            PlayerEvent::Error(code) => {
                warn!("LoopController: player error {:?}", code);
                self.stop_polling();
                self.stop_probing();
                self.media_ready = false;
                self.state = LoopState::Idle;
            }
            PlayerEvent::DurationChange(duration) => {
                if !self.media_ready {
                    return;
                }
                self.stop_probing();
                self.set_duration(*duration);
            }
            PlayerEvent::StateChange(PlayerState::Ended)
                if self.state == LoopState::Looping =>
            {
                if self.at_boundary || self.seek_pending {
                    return;
                }
                debug!("LoopController: media ended inside the segment");
                self.cross_boundary().await;
            }
            PlayerEvent::StateChange(state) => {
                debug!("LoopController: player state {:?}", state);
            }
        }
    }

    /// Record the media duration.  Unless the media came from a saved
    /// configuration, the end time follows it.
    pub fn set_duration(&mut self, duration: f64) {
        if !duration.is_finite() || duration <= 0.0 {
            return;
        }
        self.duration = Some(duration);
        if !self.keep_bounds {
            let end = timecode::clamp_seconds(duration);
            self.end_secs = end;
            self.end_text = timecode::format(end);
        }
        self.revalidate();
    }

    async fn probe_duration(&mut self) {
        let Some(player) = self.player.as_ref() else {
            return;
        };
        match player.duration().await {
            Ok(Some(d)) if d > 0.0 => {
                self.set_duration(d);
                return;
            }
            Ok(_) => {}
            Err(e) => debug!("LoopController: duration probe failed: {}", e),
        }
        self.probe_attempts += 1;
        if self.probe_attempts < DURATION_PROBE_ATTEMPTS {
            self.probe_timer = self.scheduler.schedule(
                DURATION_PROBE_INTERVAL,
                Timer::DurationProbe {
                    generation: self.probe_generation,
                },
            );
        } else {
            warn!("LoopController: duration never became available");
        }
    }

    pub async fn on_duration_probe(&mut self, generation: u64) {
        if generation != self.probe_generation || !self.media_ready || self.duration.is_some() {
            return;
        }
        self.probe_duration().await;
    }

    // ── form values ──────────────────────────────────────────────────────────

    /// Update the start field.  `commit` (end of editing) also carries an
    /// overflowed seconds field into the minutes.
    pub fn set_start_text(&mut self, text: &str, commit: bool) {
        self.start_text = if commit {
            timecode::normalize(text)
        } else {
            text.to_string()
        };
        self.start_secs = timecode::parse(&self.start_text);
        self.revalidate();
    }

    pub fn set_end_text(&mut self, text: &str, commit: bool) {
        self.end_text = if commit {
            timecode::normalize(text)
        } else {
            text.to_string()
        };
        self.end_secs = timecode::parse(&self.end_text);
        self.keep_bounds = true;
        self.revalidate();
    }

    /// Use the current playback position as the start time.
    pub async fn capture_start(&mut self) -> Result<(), ControlError> {
        let now = self.read_position().await?;
        self.start_text = timecode::format(now);
        self.start_secs = timecode::parse(&self.start_text);
        self.revalidate();
        Ok(())
    }

    /// Use the current playback position as the end time.
    pub async fn capture_end(&mut self) -> Result<(), ControlError> {
        let now = self.read_position().await?;
        self.end_text = timecode::format(now);
        self.end_secs = timecode::parse(&self.end_text);
        self.keep_bounds = true;
        self.revalidate();
        Ok(())
    }

    async fn read_position(&mut self) -> Result<f64, ControlError> {
        if !self.media_ready {
            return Err(ControlError::NoMedia);
        }
        let player = self.player.as_ref().ok_or(ControlError::NoPlayer)?;
        let now = player
            .current_time()
            .await?
            .ok_or(ControlError::Player(PlayerError::NotReady))?;
        self.position = Some(now);
        Ok(timecode::clamp_seconds(now))
    }

    pub fn set_target_loops(&mut self, count: i64) -> Result<(), ControlError> {
        self.target_loops = validate_target_loops(count)?;
        Ok(())
    }

    /// Set the playback rate, snapped to 0.05 steps.  Applied to the player
    /// immediately when media is loaded.
    pub async fn set_playback_rate(&mut self, rate: f64) -> Result<(), ControlError> {
        let rate = snap_playback_rate(validate_playback_rate(rate)?);
        self.playback_rate = rate;
        if self.media_ready {
            if let Some(player) = self.player.as_ref() {
                player.set_playback_rate(rate).await?;
            }
        }
        Ok(())
    }

    /// Put start, end, target and rate back to their defaults.
    pub async fn reset_configuration(&mut self) {
        if matches!(
            self.state,
            LoopState::Looping | LoopState::Paused | LoopState::Completed
        ) {
            if let Err(e) = self.reset().await {
                warn!("LoopController: reset before reconfigure failed: {}", e);
            }
        }
        self.keep_bounds = false;
        self.set_bounds(self.defaults.start_secs, self.defaults.end_secs);
        if let Some(d) = self.duration {
            self.end_secs = timecode::clamp_seconds(d);
            self.end_text = timecode::format(self.end_secs);
        }
        self.target_loops = self.defaults.target_loops;
        self.playback_rate = self.defaults.playback_rate;
        if self.media_ready {
            if let Some(player) = self.player.as_ref() {
                if let Err(e) = player.set_playback_rate(self.playback_rate).await {
                    warn!("LoopController: failed to restore playback rate: {}", e);
                }
            }
        }
        self.revalidate();
    }

    fn set_bounds(&mut self, start: f64, end: f64) {
        self.start_secs = timecode::clamp_seconds(start);
        self.end_secs = timecode::clamp_seconds(end);
        self.start_text = timecode::format(self.start_secs);
        self.end_text = timecode::format(self.end_secs);
    }

    fn revalidate(&mut self) {
        self.validation_error = validate_segment(self.start_secs, self.end_secs)
            .and_then(|_| match self.duration {
                Some(d) if self.start_secs >= d => Err(ValidationError::StartBeyondDuration),
                Some(d) if self.end_secs > d => Err(ValidationError::EndBeyondDuration),
                _ => Ok(()),
            })
            .err();
    }

    // ── transport ────────────────────────────────────────────────────────────

    /// Seek to the start, apply the rate and play from a zero count.
    pub async fn start(&mut self) -> Result<(), ControlError> {
        if !matches!(
            self.state,
            LoopState::Armed | LoopState::Paused | LoopState::Completed
        ) {
            return Err(ControlError::invalid_state("start", self.state));
        }
        if let Some(e) = &self.validation_error {
            return Err(ControlError::Validation(e.clone()));
        }
        let player = self.player.as_ref().ok_or(ControlError::NoPlayer)?;
        player.seek_to(self.start_secs, true).await?;
        player.set_playback_rate(self.playback_rate).await?;
        player.play().await?;

        self.loops_completed = 0;
        self.at_boundary = false;
        self.seek_pending = false;
        self.position = Some(self.start_secs);
        self.clear_notice();
        self.state = LoopState::Looping;
        info!(
            "LoopController: looping {}..{} x{} at {}x",
            self.start_secs, self.end_secs, self.target_loops, self.playback_rate
        );
        self.stop_polling();
        self.schedule_poll(self.end_secs - self.start_secs);
        Ok(())
    }

    /// Pause in place, keeping position and count.
    pub async fn pause(&mut self) -> Result<(), ControlError> {
        if self.state != LoopState::Looping {
            return Err(ControlError::invalid_state("pause", self.state));
        }
        let player = self.player.as_ref().ok_or(ControlError::NoPlayer)?;
        player.pause().await?;
        self.stop_polling();
        self.state = LoopState::Paused;
        Ok(())
    }

    /// Continue from where `pause` left off.  No seek.
    pub async fn resume(&mut self) -> Result<(), ControlError> {
        if self.state != LoopState::Paused {
            return Err(ControlError::invalid_state("resume", self.state));
        }
        let player = self.player.as_ref().ok_or(ControlError::NoPlayer)?;
        player.play().await?;
        self.state = LoopState::Looping;
        self.stop_polling();
        let remaining = self
            .position
            .map(|p| self.end_secs - p)
            .unwrap_or(self.end_secs - self.start_secs);
        self.schedule_poll(remaining);
        Ok(())
    }

    pub async fn toggle(&mut self) -> Result<(), ControlError> {
        match self.state {
            LoopState::Looping => self.pause().await,
            LoopState::Paused => self.resume().await,
            LoopState::Armed | LoopState::Completed => self.start().await,
            LoopState::Idle => Err(ControlError::invalid_state("toggle", self.state)),
        }
    }

    /// Stop looping: pause at the start with a zero count.
    pub async fn reset(&mut self) -> Result<(), ControlError> {
        self.stop_polling();
        self.loops_completed = 0;
        self.at_boundary = false;
        self.seek_pending = false;
        self.clear_notice();
        if !self.media_ready {
            self.state = LoopState::Idle;
            return Ok(());
        }
        self.state = LoopState::Armed;
        let player = self.player.as_ref().ok_or(ControlError::NoPlayer)?;
        player.pause().await?;
        player.seek_to(self.start_secs, true).await?;
        self.position = Some(self.start_secs);
        Ok(())
    }

    // ── polling ──────────────────────────────────────────────────────────────

    pub async fn on_poll(&mut self, generation: u64) {
        if generation != self.poll_generation || self.state != LoopState::Looping {
            debug!("LoopController: ignoring stale poll gen={}", generation);
            return;
        }
        let Some(player) = self.player.as_ref() else {
            return;
        };

        match player.current_time().await {
            Ok(Some(now)) => {
                self.position = Some(now);
                if self.seek_pending {
                    self.seek_to_start().await;
                } else if now >= self.end_secs {
                    if !self.at_boundary && self.cross_boundary().await {
                        return;
                    }
                } else {
                    self.at_boundary = false;
                }
            }
            Ok(None) => debug!("LoopController: position not available yet"),
            Err(e) => warn!("LoopController: position read failed: {}", e),
        }

        let remaining = self
            .position
            .map(|p| self.end_secs - p)
            .unwrap_or(f64::INFINITY);
        self.schedule_poll(remaining);
    }

    /// Count one loop, then either complete or go back to the start.
    /// Returns true when the target was reached.
    async fn cross_boundary(&mut self) -> bool {
        self.at_boundary = true;
        self.loops_completed += 1;
        debug!(
            "LoopController: loop {}/{}",
            self.loops_completed, self.target_loops
        );
        if self.loops_completed >= self.target_loops {
            self.complete().await;
            return true;
        }
        self.seek_to_start().await;
        false
    }

    async fn seek_to_start(&mut self) {
        let Some(player) = self.player.as_ref() else {
            return;
        };
        match player.seek_to(self.start_secs, true).await {
            Ok(()) => {
                self.seek_pending = false;
                self.position = Some(self.start_secs);
                if let Err(e) = player.set_playback_rate(self.playback_rate).await {
                    warn!("LoopController: failed to reapply playback rate: {}", e);
                }
            }
            Err(e) => {
                warn!("LoopController: seek to start failed, retrying next tick: {}", e);
                self.seek_pending = true;
            }
        }
    }

    async fn complete(&mut self) {
        self.stop_polling();
        self.state = LoopState::Completed;
        if let Some(player) = self.player.as_ref() {
            if let Err(e) = player.pause().await {
                warn!("LoopController: pause on completion failed: {}", e);
            }
        }
        let n = self.loops_completed;
        info!("LoopController: completed {} loop(s)", n);
        self.show_notice(format!(
            "Completed {} loop{}!",
            n,
            if n == 1 { "" } else { "s" }
        ));
    }

    fn schedule_poll(&mut self, remaining_secs: f64) {
        let delay = if remaining_secs > FAST_POLL_THRESHOLD_SECS {
            POLL_SLOW
        } else {
            POLL_FAST
        };
        self.poll_timer = self.scheduler.schedule(
            delay,
            Timer::LoopPoll {
                generation: self.poll_generation,
            },
        );
    }

    fn stop_polling(&mut self) {
        self.poll_timer.cancel();
        self.poll_generation += 1;
    }

    fn stop_probing(&mut self) {
        self.probe_timer.cancel();
        self.probe_generation += 1;
    }

    // ── notice ───────────────────────────────────────────────────────────────

    fn show_notice(&mut self, text: String) {
        self.notice = Some(text);
        self.notice_generation += 1;
        self.notice_timer = self.scheduler.schedule(
            self.defaults.completion_notice,
            Timer::LoopNotice {
                generation: self.notice_generation,
            },
        );
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

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn loops_completed(&self) -> u32 {
        self.loops_completed
    }

    pub fn can_start(&self) -> bool {
        self.validation_error.is_none()
            && self.player.is_some()
            && matches!(
                self.state,
                LoopState::Armed | LoopState::Paused | LoopState::Completed
            )
    }

    /// The form as a loop configuration draft's numeric core.
    pub fn segment(&self) -> (f64, f64, u32, f64) {
        (
            self.start_secs,
            self.end_secs,
            self.target_loops,
            self.playback_rate,
        )
    }

    pub fn status(&self) -> LoopStatus {
        let segment_progress = match (self.state, self.position) {
            (LoopState::Looping, Some(pos)) if self.end_secs > self.start_secs => {
                ((pos - self.start_secs) / (self.end_secs - self.start_secs) * 100.0)
                    .clamp(0.0, 100.0)
            }
            _ => 0.0,
        };
        let overall_progress = if self.target_loops == 0 {
            0
        } else {
            (f64::from(self.loops_completed) / f64::from(self.target_loops) * 100.0).round()
                as u32
        };

        LoopStatus {
            state: self.state,
            media_ref: self.media.clone(),
            source_url: self.source_url.clone(),
            start_text: self.start_text.clone(),
            end_text: self.end_text.clone(),
            start_secs: self.start_secs,
            end_secs: self.end_secs,
            target_loops: self.target_loops,
            playback_rate: self.playback_rate,
            duration_secs: self.duration,
            position_secs: self.position,
            position_text: timecode::format(self.position.unwrap_or(0.0)),
            loops_completed: self.loops_completed,
            segment_progress,
            overall_progress,
            validation_error: self.validation_error.as_ref().map(|e| e.to_string()),
            can_start: self.can_start(),
            notice: self.notice.clone(),
        }
    }

    /// Cancel every timer.  Called on session teardown.
    pub fn shutdown(&mut self) {
        self.stop_polling();
        self.stop_probing();
        self.notice_timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::fake::{Call, FakePlayer};
    use crate::scheduler::manual::ManualScheduler;

    type Controller = LoopController<FakePlayer, ManualScheduler>;

    fn media() -> MediaRef {
        MediaRef::parse("dQw4w9WgXcQ").unwrap()
    }

    /// Controller with media loaded and ready, bounds 0–10, target `target`.
    async fn armed(player: &FakePlayer, target: i64) -> (Controller, ManualScheduler) {
        let scheduler = ManualScheduler::new();
        let mut c = LoopController::new(scheduler.clone(), LoopDefaults::default());
        c.attach(player.clone());
        c.load_media(media(), media().watch_url(), LoadOrigin::Fresh)
            .await
            .unwrap();
        c.on_player_event(&PlayerEvent::Ready).await;
        c.set_start_text("0:00", true);
        c.set_end_text("0:10", true);
        c.set_target_loops(target).unwrap();
        scheduler.take();
        (c, scheduler)
    }

    /// Fire the most recently scheduled poll, as the event loop would.
    async fn tick(c: &mut Controller, s: &ManualScheduler) -> bool {
        let pending = s.take();
        let Some((_, Timer::LoopPoll { generation })) = pending
            .into_iter()
            .rev()
            .find(|(_, t)| matches!(t, Timer::LoopPoll { .. }))
        else {
            return false;
        };
        c.on_poll(generation).await;
        true
    }

    #[tokio::test]
    async fn test_three_loops_seek_exactly_twice() {
        let player = FakePlayer::new().with_step(2.5);
        let (mut c, s) = armed(&player, 3).await;

        c.start().await.unwrap();
        assert_eq!(player.seeks(), vec![0.0]);
        player.clear_calls();

        let mut ticks = 0;
        while c.state() == LoopState::Looping && ticks < 100 {
            assert!(tick(&mut c, &s).await);
            ticks += 1;
        }

        assert_eq!(c.state(), LoopState::Completed);
        assert_eq!(c.loops_completed(), 3);
        assert_eq!(player.seeks(), vec![0.0, 0.0]);
        assert_eq!(player.calls().last(), Some(&Call::Pause));
        assert_eq!(c.status().notice.as_deref(), Some("Completed 3 loops!"));
        assert_eq!(c.status().overall_progress, 100);

        // nothing left to poll, and a late poll does nothing
        assert!(!tick(&mut c, &s).await);
        c.on_poll(0).await;
        assert_eq!(player.seeks().len(), 2);
    }

    #[tokio::test]
    async fn test_boundary_is_edge_triggered() {
        let player = FakePlayer::new();
        let (mut c, s) = armed(&player, 100).await;
        c.start().await.unwrap();
        player.push_readings(&[9.0, 10.0, 10.0, 10.0, 0.0, 10.0]);

        for _ in 0..6 {
            assert!(tick(&mut c, &s).await);
        }
        assert_eq!(c.loops_completed(), 2);
        assert_eq!(c.state(), LoopState::Looping);
    }

    #[tokio::test]
    async fn test_media_end_counts_when_last_frame_is_short_of_duration() {
        let player = FakePlayer::new().with_duration(120.0);
        let scheduler = ManualScheduler::new();
        let mut c = LoopController::new(scheduler.clone(), LoopDefaults::default());
        c.attach(player.clone());
        c.load_media(media(), media().watch_url(), LoadOrigin::Fresh)
            .await
            .unwrap();
        c.on_player_event(&PlayerEvent::Ready).await;
        assert_eq!(c.status().end_secs, 120.0);
        c.set_target_loops(3).unwrap();
        c.start().await.unwrap();
        player.clear_calls();

        for expected in 1..=2 {
            player.set_position(119.96);
            for _ in 0..5 {
                assert!(tick(&mut c, &scheduler).await);
            }
            assert_eq!(c.loops_completed(), expected - 1);

            c.on_player_event(&PlayerEvent::StateChange(PlayerState::Ended))
                .await;
            assert_eq!(c.loops_completed(), expected);
            assert_eq!(c.state(), LoopState::Looping);
            assert!(tick(&mut c, &scheduler).await);
        }
        assert_eq!(player.seeks(), vec![0.0, 0.0]);

        player.set_position(119.96);
        c.on_player_event(&PlayerEvent::StateChange(PlayerState::Ended))
            .await;
        assert_eq!(c.state(), LoopState::Completed);
        assert_eq!(c.loops_completed(), 3);
        assert_eq!(player.seeks().len(), 2);
    }

    #[tokio::test]
    async fn test_media_end_after_counted_poll_is_not_double_counted() {
        let player = FakePlayer::new();
        let (mut c, s) = armed(&player, 5).await;
        c.start().await.unwrap();
        player.push_readings(&[10.0]);
        assert!(tick(&mut c, &s).await);
        assert_eq!(c.loops_completed(), 1);

        c.on_player_event(&PlayerEvent::StateChange(PlayerState::Ended))
            .await;
        assert_eq!(c.loops_completed(), 1);
        assert_eq!(player.seeks(), vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_adaptive_poll_interval() {
        let player = FakePlayer::new();
        let (mut c, s) = armed(&player, 5).await;
        c.start().await.unwrap();
        assert_eq!(s.last().unwrap().0, POLL_SLOW);

        player.push_readings(&[6.0]);
        assert!(tick(&mut c, &s).await);
        assert_eq!(s.last().unwrap().0, POLL_FAST);
    }

    #[tokio::test]
    async fn test_stale_poll_ignored_after_pause() {
        let player = FakePlayer::new().with_step(1.0);
        let (mut c, s) = armed(&player, 3).await;
        c.start().await.unwrap();
        let stale = match s.take().pop() {
            Some((_, Timer::LoopPoll { generation })) => generation,
            other => panic!("expected a poll, got {:?}", other),
        };
        c.pause().await.unwrap();
        player.clear_calls();

        c.on_poll(stale).await;
        assert!(player.calls().is_empty());
        assert_eq!(s.len(), 0);
        assert_eq!(c.state(), LoopState::Paused);
    }

    #[tokio::test]
    async fn test_resume_does_not_reseek() {
        let player = FakePlayer::new().with_step(1.0);
        let (mut c, s) = armed(&player, 3).await;
        c.start().await.unwrap();
        tick(&mut c, &s).await;
        c.toggle().await.unwrap();
        assert_eq!(c.state(), LoopState::Paused);
        player.clear_calls();

        c.toggle().await.unwrap();
        assert_eq!(c.state(), LoopState::Looping);
        assert_eq!(player.calls(), vec![Call::Play]);
        assert_eq!(c.loops_completed(), 0);
    }

    #[tokio::test]
    async fn test_validation_blocks_start() {
        let player = FakePlayer::new();
        let (mut c, _s) = armed(&player, 3).await;
        c.set_start_text("0:20", false);
        assert!(!c.can_start());
        assert_eq!(
            c.status().validation_error.as_deref(),
            Some("End time must be greater than start time")
        );
        player.clear_calls();
        assert!(matches!(
            c.start().await,
            Err(ControlError::Validation(ValidationError::EndNotAfterStart))
        ));
        assert!(player.calls().is_empty());
    }

    #[tokio::test]
    async fn test_duration_fills_end_for_fresh_load_only() {
        let player = FakePlayer::new().with_duration(212.0);
        let scheduler = ManualScheduler::new();
        let mut c = LoopController::new(scheduler.clone(), LoopDefaults::default());
        c.attach(player.clone());

        c.load_media(media(), media().watch_url(), LoadOrigin::Fresh)
            .await
            .unwrap();
        c.on_player_event(&PlayerEvent::Ready).await;
        assert_eq!(c.status().end_text, "3:32");
        assert_eq!(c.status().duration_secs, Some(212.0));

        let saved = looper_proto::records::LoopConfigDraft {
            media_ref: Some("dQw4w9WgXcQ".into()),
            start_time: Some(30.0),
            end_time: Some(45.0),
            target_loop_count: Some(7),
            playback_rate: Some(0.75),
            ..Default::default()
        }
        .validate()
        .unwrap();
        c.load_media(media(), media().watch_url(), LoadOrigin::Saved(saved))
            .await
            .unwrap();
        c.on_player_event(&PlayerEvent::Ready).await;
        let status = c.status();
        assert_eq!((status.start_secs, status.end_secs), (30.0, 45.0));
        assert_eq!(status.target_loops, 7);
        assert_eq!(status.playback_rate, 0.75);
    }

    #[tokio::test]
    async fn test_duration_event_replaces_probing() {
        let player = FakePlayer::new();
        let scheduler = ManualScheduler::new();
        let mut c = LoopController::new(scheduler.clone(), LoopDefaults::default());
        c.attach(player.clone());
        c.load_media(media(), media().watch_url(), LoadOrigin::Fresh)
            .await
            .unwrap();

        // before the media is ready the probe owns the duration
        c.on_player_event(&PlayerEvent::DurationChange(90.0)).await;
        assert_eq!(c.status().duration_secs, None);

        c.on_player_event(&PlayerEvent::Ready).await;
        let probe = match scheduler.take().pop() {
            Some((_, Timer::DurationProbe { generation })) => generation,
            other => panic!("expected a duration probe, got {:?}", other),
        };
        c.on_player_event(&PlayerEvent::DurationChange(90.0)).await;
        assert_eq!(c.status().duration_secs, Some(90.0));
        assert_eq!(c.status().end_text, "1:30");

        c.on_duration_probe(probe).await;
        assert_eq!(scheduler.len(), 0);
    }

    #[tokio::test]
    async fn test_duration_bounds_validation() {
        let player = FakePlayer::new().with_duration(60.0);
        let (mut c, _s) = armed(&player, 3).await;
        c.set_end_text("1:30", true);
        assert_eq!(
            c.status().validation_error.as_deref(),
            Some("End time must not exceed the video duration")
        );
        c.set_start_text("61", true);
        assert!(c.status().validation_error.is_some());
        c.set_start_text("0", true);
        c.set_end_text("0:60", true);
        assert_eq!(c.status().end_text, "1:00");
        assert!(c.status().validation_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_seek_retried_next_tick() {
        let player = FakePlayer::new();
        let (mut c, s) = armed(&player, 5).await;
        c.start().await.unwrap();
        player.clear_calls();

        player.fail_next_seeks(1);
        player.push_readings(&[10.0, 10.0]);
        assert!(tick(&mut c, &s).await);
        assert_eq!(c.loops_completed(), 1);
        assert!(player.seeks().is_empty());

        assert!(tick(&mut c, &s).await);
        assert_eq!(player.seeks(), vec![0.0]);
        assert_eq!(c.loops_completed(), 1);
        assert_eq!(c.state(), LoopState::Looping);
    }

    #[tokio::test]
    async fn test_reset_returns_to_armed() {
        let player = FakePlayer::new().with_step(4.0);
        let (mut c, s) = armed(&player, 5).await;
        c.start().await.unwrap();
        tick(&mut c, &s).await;
        tick(&mut c, &s).await;
        tick(&mut c, &s).await;
        assert_eq!(c.loops_completed(), 1);

        player.clear_calls();
        c.reset().await.unwrap();
        assert_eq!(c.state(), LoopState::Armed);
        assert_eq!(c.loops_completed(), 0);
        assert_eq!(player.calls(), vec![Call::Pause, Call::SeekTo(0.0)]);
    }

    #[tokio::test]
    async fn test_rate_and_target_bounds() {
        let player = FakePlayer::new();
        let (mut c, _s) = armed(&player, 5).await;
        assert!(c.set_target_loops(0).is_err());
        assert!(c.set_target_loops(10_001).is_err());
        assert!(c.set_playback_rate(3.0).await.is_err());
        c.set_playback_rate(1.23).await.unwrap();
        assert_eq!(c.status().playback_rate, 1.25);
        assert_eq!(player.calls().last(), Some(&Call::SetRate(1.25)));
    }

    #[tokio::test]
    async fn test_completion_notice_clears() {
        let player = FakePlayer::new().with_step(10.0);
        let (mut c, s) = armed(&player, 1).await;
        c.start().await.unwrap();
        tick(&mut c, &s).await;
        assert_eq!(c.state(), LoopState::Completed);
        assert_eq!(c.status().notice.as_deref(), Some("Completed 1 loop!"));

        let (delay, timer) = s.last().unwrap();
        assert_eq!(delay, Duration::from_secs(3));
        let Timer::LoopNotice { generation } = timer else {
            panic!("expected notice timer, got {:?}", timer);
        };
        c.on_notice_timer(generation);
        assert!(c.status().notice.is_none());
    }

    #[tokio::test]
    async fn test_capture_position() {
        let player = FakePlayer::new();
        let (mut c, _s) = armed(&player, 5).await;
        player.set_position(75.4);
        c.capture_end().await.unwrap();
        assert_eq!(c.status().end_text, "1:15");
        assert_eq!(c.status().end_secs, 75.0);
        player.set_position(12.9);
        c.capture_start().await.unwrap();
        assert_eq!(c.status().start_secs, 12.0);
    }

    #[tokio::test]
    async fn test_detach_stops_looping() {
        let player = FakePlayer::new().with_step(1.0);
        let (mut c, s) = armed(&player, 5).await;
        c.start().await.unwrap();
        let pending = s.take();
        assert!(c.detach().is_some());
        assert_eq!(c.state(), LoopState::Idle);
        for (_, timer) in pending {
            if let Timer::LoopPoll { generation } = timer {
                c.on_poll(generation).await;
            }
        }
        assert_eq!(s.len(), 0);
        assert!(c.start().await.is_err());
    }
}
