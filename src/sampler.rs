//! Frame to keyboard color sampling.

use clap::ValueEnum;
use tracing::debug;

use crate::error::{Error, Result};
use crate::layout::KeyMap;
use crate::video::Frame;
use crate::Rgb;

/// Tolerance for keys sitting right on the edge of the video area.
const EDGE_EPSILON: f32 = 1e-4;

/// Placement of the video on the keyboard surface.
#[derive(ValueEnum, Default, PartialEq, Eq, Debug, Copy, Clone)]
pub enum Fit {
    /// Stretch the whole frame over the keyboard.
    #[default]
    Stretch,
    /// Keep the aspect ratio and leave uncovered keys dark.
    Contain,
    /// Keep the aspect ratio and crop the frame to the keyboard.
    Cover,
}

/// Precomputed sample points for a single frame size.
#[derive(Debug)]
pub struct Sampler {
    width: u32,
    height: u32,
    /// Color slot and pixel byte offset of every key.
    targets: Vec<(usize, Option<usize>)>,
}

impl Sampler {
    pub fn new(keymap: &KeyMap, width: u32, height: u32, fit: Fit) -> Self {
        let bounds = keymap.bounds();
        let keyboard_aspect = bounds.width / bounds.height;
        let video_aspect = width as f32 / height as f32;

        let targets = keymap
            .keys()
            .iter()
            .map(|key| {
                let (u, v) = bounds.normalize(key.x, key.y);
                let offset = place(u, v, keyboard_aspect, video_aspect, fit)
                    .map(|(u, v)| pixel_offset(u, v, width, height));
                (key.slot, offset)
            })
            .collect::<Vec<_>>();

        let covered = targets.iter().filter(|(_, offset)| offset.is_some()).count();
        debug!(width, height, ?fit, covered, keys = targets.len(), "Computed sample points");

        Self { width, height, targets }
    }

    /// Check if the sample points were computed for this frame's size.
    pub fn matches(&self, frame: &Frame) -> bool {
        self.width == frame.width && self.height == frame.height
    }

    /// Copy the pixel under every key into its color slot.
    pub fn sample(&self, frame: &Frame, keymap: &mut KeyMap) -> Result<()> {
        let expected = frame.width as usize * frame.height as usize * 3;
        if expected == 0 || frame.data.len() < expected {
            return Err(Error::Decode(format!(
                "frame has {} bytes, expected {} for {}x{} RGB",
                frame.data.len(),
                expected,
                frame.width,
                frame.height
            )));
        }

        for &(slot, offset) in &self.targets {
            let color = match offset {
                Some(index) => {
                    Rgb { r: frame.data[index], g: frame.data[index + 1], b: frame.data[index + 2] }
                },
                None => Rgb::default(),
            };
            keymap.set_color(slot, color);
        }

        Ok(())
    }
}

/// Map a normalized keyboard position to a normalized frame position.
///
/// Returns `None` if the key is not covered by the video.
fn place(u: f32, v: f32, keyboard_aspect: f32, video_aspect: f32, fit: Fit) -> Option<(f32, f32)> {
    // Aspect ratios are meaningless for keyboards without extent on one axis.
    if fit == Fit::Stretch || !keyboard_aspect.is_finite() || keyboard_aspect <= 0. {
        return Some((u, v));
    }

    let wide_keyboard = keyboard_aspect > video_aspect;

    match fit {
        Fit::Contain if wide_keyboard => {
            Some((letterbox(u, video_aspect / keyboard_aspect)?, v))
        },
        Fit::Contain => Some((u, letterbox(v, keyboard_aspect / video_aspect)?)),
        Fit::Cover if wide_keyboard => Some((u, crop(v, video_aspect / keyboard_aspect))),
        Fit::Cover => Some((crop(u, keyboard_aspect / video_aspect), v)),
        Fit::Stretch => Some((u, v)),
    }
}

/// Position inside a centered band covering `scale` of the axis.
fn letterbox(t: f32, scale: f32) -> Option<f32> {
    let t = (t - (1. - scale) / 2.) / scale;
    if t < -EDGE_EPSILON || t > 1. + EDGE_EPSILON {
        None
    } else {
        Some(t.max(0.).min(1.))
    }
}

/// Position inside the centered `scale` share of the axis.
#[inline]
fn crop(t: f32, scale: f32) -> f32 {
    (1. - scale) / 2. + t * scale
}

/// Byte offset of the pixel at a normalized position in a packed RGB frame.
fn pixel_offset(u: f32, v: f32, width: u32, height: u32) -> usize {
    let x = ((u * width as f32) as i64).max(0).min(width as i64 - 1) as usize;
    let y = ((v * height as f32) as i64).max(0).min(height as i64 - 1) as usize;
    3 * x + y * width as usize * 3
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::layout::LedPosition;

    /// Frame where each pixel encodes its own coordinates.
    fn coordinate_frame(width: u32, height: u32) -> Frame {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 0xff]);
            }
        }
        Frame { width, height, data, timestamp: Duration::ZERO }
    }

    /// Keyboard with 5 columns and 2 rows.
    fn grid() -> KeyMap {
        let mut positions = Vec::new();
        for row in 0..2 {
            for col in 0..5 {
                positions.push(LedPosition { id: row * 5 + col, x: col as f32, y: row as f32 });
            }
        }
        KeyMap::new(&positions).unwrap()
    }

    fn color_at(map: &KeyMap, id: u16) -> Rgb {
        map.colors().iter().find(|led| led.id == id).unwrap().color
    }

    #[test]
    fn stretch_covers_whole_frame() {
        let mut map = grid();
        let frame = coordinate_frame(100, 50);
        let sampler = Sampler::new(&map, 100, 50, Fit::Stretch);
        sampler.sample(&frame, &mut map).unwrap();

        assert_eq!(color_at(&map, 0), Rgb { r: 0, g: 0, b: 0xff });
        assert_eq!(color_at(&map, 2), Rgb { r: 50, g: 0, b: 0xff });
        // Right-most and bottom-most keys are clamped to the last pixel.
        assert_eq!(color_at(&map, 4), Rgb { r: 99, g: 0, b: 0xff });
        assert_eq!(color_at(&map, 9), Rgb { r: 99, g: 49, b: 0xff });
    }

    #[test]
    fn contain_leaves_uncovered_keys_dark() {
        let mut map = grid();
        // Square frame on a 4:1 keyboard only covers the center quarter.
        let frame = coordinate_frame(40, 40);
        let sampler = Sampler::new(&map, 40, 40, Fit::Contain);
        sampler.sample(&frame, &mut map).unwrap();

        assert_eq!(color_at(&map, 0), Rgb::default());
        assert_eq!(color_at(&map, 4), Rgb::default());
        assert_eq!(color_at(&map, 2), Rgb { r: 20, g: 0, b: 0xff });
        assert_eq!(color_at(&map, 7), Rgb { r: 20, g: 39, b: 0xff });
    }

    #[test]
    fn cover_crops_frame() {
        let mut map = grid();
        // Square frame on a 4:1 keyboard only shows the center band of rows.
        let frame = coordinate_frame(40, 40);
        let sampler = Sampler::new(&map, 40, 40, Fit::Cover);
        sampler.sample(&frame, &mut map).unwrap();

        assert_eq!(color_at(&map, 0), Rgb { r: 0, g: 15, b: 0xff });
        assert_eq!(color_at(&map, 9), Rgb { r: 39, g: 25, b: 0xff });
    }

    #[test]
    fn shared_slot_takes_last_key() {
        let mut map = KeyMap::new(&[
            LedPosition { id: 1, x: 0., y: 0. },
            LedPosition { id: 2, x: 1., y: 0. },
            LedPosition { id: 1, x: 1., y: 0. },
        ])
        .unwrap();
        let frame = coordinate_frame(10, 1);
        Sampler::new(&map, 10, 1, Fit::Stretch).sample(&frame, &mut map).unwrap();

        assert_eq!(color_at(&map, 1), Rgb { r: 9, g: 0, b: 0xff });
    }

    #[test]
    fn single_row_samples_center_line() {
        let mut map = KeyMap::new(&[
            LedPosition { id: 1, x: 0., y: 3. },
            LedPosition { id: 2, x: 1., y: 3. },
        ])
        .unwrap();
        let frame = coordinate_frame(4, 10);

        for fit in [Fit::Stretch, Fit::Contain, Fit::Cover].iter() {
            Sampler::new(&map, 4, 10, *fit).sample(&frame, &mut map).unwrap();
            assert_eq!(color_at(&map, 1), Rgb { r: 0, g: 5, b: 0xff });
        }
    }

    #[test]
    fn short_frame_is_rejected() {
        let mut map = grid();
        let mut frame = coordinate_frame(10, 10);
        frame.data.truncate(10);

        let sampler = Sampler::new(&map, 10, 10, Fit::Stretch);
        assert!(matches!(sampler.sample(&frame, &mut map), Err(Error::Decode(_))));
    }

    #[test]
    fn sampler_matches_frame_size() {
        let map = grid();
        let sampler = Sampler::new(&map, 10, 10, Fit::Stretch);
        assert!(sampler.matches(&coordinate_frame(10, 10)));
        assert!(!sampler.matches(&coordinate_frame(10, 11)));
    }
}
