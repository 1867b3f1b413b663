use std::time::Instant;

use crate::{
    assets::AssetStore,
    model::{CompositionSettings, Layer, DEFAULT_LOOP_MS},
};

pub const SPEED_MIN: f64 = 0.1;
pub const SPEED_MAX: f64 = 2.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Wall-clock playback position over a fixed loop. All time arithmetic lives
/// in [`TimelineClock::advance`]; [`TimelineClock::tick`] only measures the
/// elapsed interval, so tests drive `advance` directly.
#[derive(Clone, Debug)]
pub struct TimelineClock {
    state: PlaybackState,
    current_time_ms: f64,
    speed: f64,
    loop_duration_ms: f64,
    last_tick: Option<Instant>,
}

impl TimelineClock {
    pub fn new(loop_duration_ms: f64) -> Self {
        Self {
            state: PlaybackState::Stopped,
            current_time_ms: 0.0,
            speed: 1.0,
            loop_duration_ms: loop_duration_ms.max(0.0),
            last_tick: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn current_time_ms(&self) -> f64 {
        self.current_time_ms
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn loop_duration_ms(&self) -> f64 {
        self.loop_duration_ms
    }

    pub fn play(&mut self) {
        self.state = PlaybackState::Playing;
        // Drop the stale timestamp so the first tick after resume measures
        // from now, not from before the pause.
        self.last_tick = None;
    }

    pub fn pause(&mut self) {
        if self.state == PlaybackState::Playing {
            self.state = PlaybackState::Paused;
        }
        self.last_tick = None;
    }

    /// Halt and rewind to zero.
    pub fn stop(&mut self) {
        self.state = PlaybackState::Stopped;
        self.current_time_ms = 0.0;
        self.last_tick = None;
    }

    /// Jump to `time_ms`, wrapped into the loop. Does not change state.
    pub fn seek(&mut self, time_ms: f64) {
        self.current_time_ms = self.wrap(time_ms);
        self.last_tick = None;
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.speed = if speed.is_finite() {
            speed.clamp(SPEED_MIN, SPEED_MAX)
        } else {
            1.0
        };
    }

    /// Replace the loop length and re-wrap the position so it stays inside
    /// the new loop.
    pub fn set_loop_duration_ms(&mut self, loop_duration_ms: f64) {
        self.loop_duration_ms = loop_duration_ms.max(0.0);
        self.current_time_ms = self.wrap(self.current_time_ms);
    }

    /// Advance by an externally measured interval. No-op unless playing.
    pub fn advance(&mut self, delta_ms: f64) -> f64 {
        if self.state == PlaybackState::Playing && delta_ms.is_finite() {
            self.current_time_ms = self.wrap(self.current_time_ms + delta_ms * self.speed);
        }
        self.current_time_ms
    }

    /// Advance by the wall-clock time since the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let delta_ms = match self.last_tick {
            Some(prev) => now.duration_since(prev).as_secs_f64() * 1000.0,
            None => 0.0,
        };
        self.last_tick = Some(now);
        self.advance(delta_ms)
    }

    fn wrap(&self, time_ms: f64) -> f64 {
        if self.loop_duration_ms > 0.0 {
            time_ms.rem_euclid(self.loop_duration_ms)
        } else {
            0.0
        }
    }
}

/// Deterministic evenly spaced frame times covering one loop. Frame `i` of
/// `n` sits at `i/n` of the loop; the last time is always strictly before the
/// loop end, which keeps seamless loops from rendering frame 0 twice.
#[derive(Clone, Copy, Debug)]
pub struct ExportTimeline {
    frame_count: usize,
    loop_duration_ms: f64,
}

impl ExportTimeline {
    pub fn new(loop_duration_ms: f64, fps: f64) -> Self {
        let frame_count = ((loop_duration_ms / 1000.0 * fps).ceil() as usize).max(1);
        Self {
            frame_count,
            loop_duration_ms,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn loop_duration_ms(&self) -> f64 {
        self.loop_duration_ms
    }

    pub fn time_at(&self, frame: usize) -> f64 {
        frame as f64 / self.frame_count as f64 * self.loop_duration_ms
    }

    pub fn times(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.frame_count).map(|i| self.time_at(i))
    }
}

/// Effective loop length for a composition: the explicit setting if present,
/// else the longest animated asset referenced by any layer, else
/// [`DEFAULT_LOOP_MS`].
pub fn resolve_loop_duration_ms(
    settings: &CompositionSettings,
    layers: &[Layer],
    assets: &AssetStore,
) -> f64 {
    if let Some(ms) = settings.loop_duration_ms {
        return ms;
    }
    layers
        .iter()
        .filter_map(|layer| assets.get(&layer.asset))
        .filter_map(|asset| asset.animated_duration_ms())
        .reduce(f64::max)
        .unwrap_or(DEFAULT_LOOP_MS)
}
