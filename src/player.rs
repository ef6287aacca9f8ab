//! Real-time playback loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::controller::LightingDevice;
use crate::error::Result;
use crate::layout::KeyMap;
use crate::sampler::{Fit, Sampler};
use crate::video::{Frame, VideoDecoder};

/// Frame interval assumed until the video reports its frame rate.
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Producer of timestamped video frames.
pub trait FrameSource {
    /// Next frame, `None` at the end of the video.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Nominal time between two frames.
    fn frame_interval(&self) -> Option<Duration>;
}

impl FrameSource for VideoDecoder {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        VideoDecoder::next_frame(self)
    }

    fn frame_interval(&self) -> Option<Duration> {
        self.info()
            .filter(|info| info.fps.is_finite() && info.fps > 0.)
            .map(|info| Duration::from_secs_f32(1. / info.fps))
    }
}

/// When to present the next frame.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Schedule {
    /// Frame is early, sleep for the duration.
    Wait(Duration),
    /// Frame is due.
    Now,
    /// Frame is late by more than one interval and the clock was moved forward.
    Late(Duration),
}

/// Maps video timestamps to wall-clock deadlines.
///
/// Playback never runs faster than real time to catch up: whenever a frame is
/// more than `max_lag` behind, the clock is shifted so it is exactly `max_lag`
/// behind.
#[derive(Debug)]
pub struct FrameClock {
    start: Option<(Instant, Duration)>,
    max_lag: Duration,
}

impl FrameClock {
    pub fn new(max_lag: Duration) -> Self {
        Self { start: None, max_lag }
    }

    pub fn schedule(&mut self, timestamp: Duration, now: Instant) -> Schedule {
        let (origin, base) = *self.start.get_or_insert((now, timestamp));
        let deadline = origin + timestamp.checked_sub(base).unwrap_or_default();

        if now < deadline {
            return Schedule::Wait(deadline - now);
        }

        let lag = now - deadline;
        if lag > self.max_lag {
            self.start = Some((origin + (lag - self.max_lag), base));
            Schedule::Late(lag)
        } else {
            Schedule::Now
        }
    }
}

/// Playback summary.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct PlaybackStats {
    pub frames: u64,
    pub late_frames: u64,
}

/// Play frames on the device until the video ends or `running` is cleared.
///
/// All LEDs are turned off before returning, also when playback failed.
pub fn play<S: FrameSource>(
    source: &mut S,
    device: &mut dyn LightingDevice,
    keymap: &mut KeyMap,
    fit: Fit,
    running: &AtomicBool,
) -> Result<PlaybackStats> {
    let mut stats = PlaybackStats::default();
    let played = play_frames(source, device, keymap, fit, running, &mut stats);

    debug!(?stats, "Playback stopped");

    keymap.clear();
    let cleared = device.set_colors(keymap.colors());

    // Report the playback error over the blackout error.
    played?;
    cleared?;

    Ok(stats)
}

fn play_frames<S: FrameSource>(
    source: &mut S,
    device: &mut dyn LightingDevice,
    keymap: &mut KeyMap,
    fit: Fit,
    running: &AtomicBool,
    stats: &mut PlaybackStats,
) -> Result<()> {
    let mut clock: Option<FrameClock> = None;
    let mut sampler: Option<Sampler> = None;

    while running.load(Ordering::SeqCst) {
        let frame = match source.next_frame()? {
            Some(frame) => frame,
            None => break,
        };

        let interval = source.frame_interval().unwrap_or(DEFAULT_FRAME_INTERVAL);
        let clock = clock.get_or_insert_with(|| FrameClock::new(interval));

        match clock.schedule(frame.timestamp, Instant::now()) {
            Schedule::Wait(duration) => thread::sleep(duration),
            Schedule::Late(lag) => {
                trace!("Frame {} is {:?} late", stats.frames, lag);
                stats.late_frames += 1;
            },
            Schedule::Now => (),
        }

        if !sampler.as_ref().map_or(false, |sampler| sampler.matches(&frame)) {
            sampler = Some(Sampler::new(keymap, frame.width, frame.height, fit));
        }

        if let Some(sampler) = &sampler {
            sampler.sample(&frame, keymap)?;
        }

        device.set_colors(keymap.colors())?;
        stats.frames += 1;
    }

    Ok(())
}
