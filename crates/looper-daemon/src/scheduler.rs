//! Delayed callbacks for the controllers.
//!
//! A controller never sleeps itself.  It asks the scheduler to deliver a
//! `Timer` after a delay; the timer comes back through the session's event
//! loop and the controller checks the generation it carries against its own
//! before acting, so a timer that outlived the state that scheduled it is a
//! no-op.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::core::CoreEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    LoopPoll { generation: u64 },
    LoopNotice { generation: u64 },
    DurationProbe { generation: u64 },
    Countdown { generation: u64 },
    PlaylistNotice { generation: u64 },
}

pub trait Scheduler {
    fn schedule(&self, delay: Duration, timer: Timer) -> TimerHandle;
}

/// Cancels the pending delivery when cancelled or dropped.
#[derive(Debug, Default)]
pub struct TimerHandle {
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    /// A handle with nothing behind it.
    pub fn detached() -> Self {
        Self { abort: None }
    }

    pub fn cancel(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Delivers timers as `CoreEvent::Timer` on the session channel.
#[derive(Clone)]
pub struct TokioScheduler {
    tx: mpsc::Sender<CoreEvent>,
}

impl TokioScheduler {
    pub fn new(tx: mpsc::Sender<CoreEvent>) -> Self {
        Self { tx }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, timer: Timer) -> TimerHandle {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(CoreEvent::Timer(timer)).await.is_err() {
                debug!("scheduler: session gone, dropping {:?}", timer);
            }
        });
        TimerHandle {
            abort: Some(task.abort_handle()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_scheduler_delivers_and_cancels() {
        let (tx, mut rx) = mpsc::channel(4);
        let scheduler = TokioScheduler::new(tx);

        let mut cancelled = scheduler.schedule(
            Duration::from_millis(5),
            Timer::LoopPoll { generation: 1 },
        );
        cancelled.cancel();
        let _kept = scheduler.schedule(
            Duration::from_millis(20),
            Timer::LoopPoll { generation: 2 },
        );

        match rx.recv().await {
            Some(CoreEvent::Timer(Timer::LoopPoll { generation })) => assert_eq!(generation, 2),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
