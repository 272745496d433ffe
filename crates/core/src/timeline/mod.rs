use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Shared position source for a playing track.
///
/// The realtime variant follows tokio's clock, so paused-time tests advance it
/// together with timers. The manual variant only moves when [`advance`] is
/// called and backs deterministic offline rendering.
///
/// [`advance`]: PlaybackClock::advance
#[derive(Clone)]
pub struct PlaybackClock {
    kind: Arc<ClockKind>,
}

enum ClockKind {
    Realtime(Instant),
    Manual(AtomicU64),
}

impl PlaybackClock {
    /// Starts a clock that runs with wall time from now on.
    pub fn realtime() -> Self {
        Self {
            kind: Arc::new(ClockKind::Realtime(Instant::now())),
        }
    }

    /// Creates a clock parked at zero.
    pub fn manual() -> Self {
        Self {
            kind: Arc::new(ClockKind::Manual(AtomicU64::new(0))),
        }
    }

    /// True for clocks that only move on [`advance`](Self::advance).
    pub fn is_manual(&self) -> bool {
        matches!(*self.kind, ClockKind::Manual(_))
    }

    /// Time since the clock started.
    pub fn elapsed(&self) -> Duration {
        match &*self.kind {
            ClockKind::Realtime(origin) => origin.elapsed(),
            ClockKind::Manual(nanos) => Duration::from_nanos(nanos.load(Ordering::Acquire)),
        }
    }

    /// Moves a manual clock forward. Realtime clocks ignore the call.
    pub fn advance(&self, delta: Duration) {
        if let ClockKind::Manual(nanos) = &*self.kind {
            let delta = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
            nanos.fetch_add(delta, Ordering::AcqRel);
        }
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::realtime()
    }
}

impl fmt::Debug for PlaybackClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackClock")
            .field("manual", &self.is_manual())
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

/// Duration of one frame at `fps`.
pub fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / fps.max(1) as f64)
}

/// Number of whole frames needed to cover `duration_ms`, rounded up.
pub fn frames_for(duration_ms: u64, fps: u32) -> u64 {
    (duration_ms * fps.max(1) as u64).div_ceil(1000)
}

/// Paces work to a display-like refresh.
///
/// Missed frames are skipped rather than replayed in a burst, the way a
/// compositor drops frames for a busy client.
#[derive(Debug)]
pub struct FrameTicker {
    interval: Interval,
    period: Duration,
    frame: u64,
}

impl FrameTicker {
    /// Must be called from within a tokio runtime.
    pub fn new(fps: u32) -> Self {
        let period = frame_interval(fps);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval,
            period,
            frame: 0,
        }
    }

    /// Time between two frames.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Waits for the next frame boundary and returns its index. The first
    /// call completes immediately.
    pub async fn next_frame(&mut self) -> u64 {
        self.interval.tick().await;
        let frame = self.frame;
        self.frame += 1;
        frame
    }
}
