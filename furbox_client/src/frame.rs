//! Frame scheduling.
//!
//! Stands in for the display refresh callback: one tick per frame interval,
//! missed ticks are skipped rather than burst, and a cancelled loop never
//! ticks again.

use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Cancelable fixed-rate frame ticker.
pub struct FrameLoop {
    interval: Option<Interval>,
    last: Option<Instant>,
    frames: u64,
}

impl FrameLoop {
    pub fn new(period: Duration) -> Self {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval: Some(interval),
            last: None,
            frames: 0,
        }
    }

    /// Waits for the next frame and returns the time since the previous one.
    ///
    /// The first frame reports `Duration::ZERO`. Returns `None` once cancelled.
    pub async fn next_frame(&mut self) -> Option<Duration> {
        let interval = self.interval.as_mut()?;
        let now = interval.tick().await;
        let dt = self.last.map(|prev| now - prev).unwrap_or(Duration::ZERO);
        self.last = Some(now);
        self.frames += 1;
        Some(dt)
    }

    /// Stops the loop. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        self.interval = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.interval.is_none()
    }

    /// Frames delivered so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_at_period() {
        let mut frames = FrameLoop::new(Duration::from_millis(16));
        assert_eq!(frames.next_frame().await, Some(Duration::ZERO));
        assert_eq!(frames.next_frame().await, Some(Duration::from_millis(16)));
        assert_eq!(frames.next_frame().await, Some(Duration::from_millis(16)));
        assert_eq!(frames.frames(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_loop_never_ticks() {
        let mut frames = FrameLoop::new(Duration::from_millis(16));
        frames.next_frame().await;
        frames.cancel();
        frames.cancel();
        assert!(frames.is_cancelled());
        assert_eq!(frames.next_frame().await, None);
        assert_eq!(frames.frames(), 1);
    }
}
