//! Playback pacing.
//!
//! Wall-clock time is folded into a frame-timer accumulator; once per
//! tick the clock reports how many source frames have come due. After
//! a stall the count exceeds one and the session catches up by
//! decoding through the backlog.

use std::time::Instant;

const DEFAULT_FRAME_RATE: f64 = 30.0;

pub struct PlaybackClock {
    /// Seconds per frame, `1 / frame_rate`.
    frame_period: f64,
    /// Accumulated not-yet-consumed playback time in seconds.
    frame_timer: f64,
    last_tick: Option<Instant>,
}

impl PlaybackClock {
    pub fn new(frame_rate: f64) -> Self {
        Self {
            frame_period: period_for(frame_rate),
            frame_timer: 0.0,
            last_tick: None,
        }
    }

    pub fn set_frame_rate(&mut self, frame_rate: f64) {
        self.frame_period = period_for(frame_rate);
    }

    pub fn frame_period(&self) -> f64 {
        self.frame_period
    }

    /// Accumulate elapsed time and report how many frames are due.
    /// Normally 0 or 1; more than 1 after a stall.
    pub fn tick(&mut self, now: Instant) -> u32 {
        let last = self.last_tick.replace(now);
        if let Some(last) = last {
            self.frame_timer += now.saturating_duration_since(last).as_secs_f64();
        }

        let mut due = 0;
        while self.frame_timer >= self.frame_period {
            self.frame_timer -= self.frame_period;
            due += 1;
        }
        due
    }

    /// Zero the accumulator across a discontinuity (stop/seek) so the
    /// next tick does not burst through catch-up frames.
    pub fn reset(&mut self, now: Instant) {
        self.frame_timer = 0.0;
        self.last_tick = Some(now);
    }

    /// Drop the anchor entirely. The next tick re-anchors and reports
    /// zero due frames, so time spent paused is never counted.
    pub fn clear(&mut self) {
        self.frame_timer = 0.0;
        self.last_tick = None;
    }
}

fn period_for(frame_rate: f64) -> f64 {
    if frame_rate > 0.0 {
        1.0 / frame_rate
    } else {
        1.0 / DEFAULT_FRAME_RATE
    }
}
