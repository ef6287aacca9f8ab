//! Keyboard LED layout and per-key color slots.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::Rgb;

/// Device-assigned LED identifier.
pub type LedId = u16;

/// Physical position of one controllable key light.
#[derive(Deserialize, PartialEq, Debug, Copy, Clone)]
pub struct LedPosition {
    pub id: LedId,
    pub x: f32,
    pub y: f32,
}

/// Color of one LED, as sent to the device.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct LedColor {
    pub id: LedId,
    pub color: Rgb,
}

/// Key on the keyboard surface and the color slot it writes to.
#[derive(Debug, Copy, Clone)]
pub struct Key {
    pub id: LedId,
    pub x: f32,
    pub y: f32,
    pub slot: usize,
}

/// Bounding box of all key positions.
#[derive(PartialEq, Debug, Copy, Clone)]
pub struct Bounds {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    fn from_positions(positions: &[LedPosition]) -> Self {
        let (mut left, mut top) = (f32::MAX, f32::MAX);
        let (mut right, mut bottom) = (f32::MIN, f32::MIN);

        for pos in positions {
            left = left.min(pos.x);
            top = top.min(pos.y);
            right = right.max(pos.x);
            bottom = bottom.max(pos.y);
        }

        Self { left, top, width: right - left, height: bottom - top }
    }

    /// Position relative to the bounds in the range `0.0..=1.0`.
    ///
    /// Axes without any extent map to their center.
    pub fn normalize(&self, x: f32, y: f32) -> (f32, f32) {
        (fraction(x - self.left, self.width), fraction(y - self.top, self.height))
    }
}

#[inline]
fn fraction(offset: f32, span: f32) -> f32 {
    if span > 0. {
        offset / span
    } else {
        0.5
    }
}

/// Collect the distinct LEDs across all positions, initialized to black.
pub fn available_leds(positions: &[LedPosition]) -> Vec<LedColor> {
    let mut colors: Vec<LedColor> = Vec::new();
    for pos in positions {
        if colors.iter().all(|led| led.id != pos.id) {
            colors.push(LedColor { id: pos.id, color: Rgb::default() });
        }
    }
    colors
}

/// All keys of a keyboard with their shared color list.
#[derive(Debug, Clone)]
pub struct KeyMap {
    keys: Vec<Key>,
    colors: Vec<LedColor>,
    bounds: Bounds,
}

impl KeyMap {
    pub fn new(positions: &[LedPosition]) -> Result<Self> {
        if positions.is_empty() {
            return Err(Error::NoLeds);
        }

        let colors = available_leds(positions);
        let slots: HashMap<LedId, usize> =
            colors.iter().enumerate().map(|(slot, led)| (led.id, slot)).collect();

        let keys = positions
            .iter()
            .filter_map(|pos| {
                let slot = *slots.get(&pos.id)?;
                Some(Key { id: pos.id, x: pos.x, y: pos.y, slot })
            })
            .collect::<Vec<_>>();

        let bounds = Bounds::from_positions(positions);

        debug!(keys = keys.len(), leds = colors.len(), ?bounds, "Built key map");

        Ok(Self { keys, colors, bounds })
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn colors(&self) -> &[LedColor] {
        &self.colors
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    #[inline]
    pub fn set_color(&mut self, slot: usize, color: Rgb) {
        self.colors[slot].color = color;
    }

    /// Turn every LED black.
    pub fn clear(&mut self) {
        for led in &mut self.colors {
            led.color = Rgb::default();
        }
    }
}

/// LED layout file contents.
#[derive(Deserialize)]
struct LayoutFile {
    #[serde(rename = "led", default)]
    leds: Vec<LedPosition>,
}

/// Read LED positions from a TOML layout file.
///
/// ```toml
/// [[led]]
/// id = 41
/// x = 0.0
/// y = 0.0
/// ```
pub fn load_layout(path: &Path) -> Result<Vec<LedPosition>> {
    let text = fs::read_to_string(path)?;
    parse_layout(&text).map_err(|reason| Error::Layout { path: path.to_path_buf(), reason })
}

fn parse_layout(text: &str) -> std::result::Result<Vec<LedPosition>, String> {
    let file: LayoutFile = toml::from_str(text).map_err(|err| err.to_string())?;

    if file.leds.is_empty() {
        return Err("no [[led]] entries".into());
    }

    if let Some(pos) = file.leds.iter().find(|pos| !pos.x.is_finite() || !pos.y.is_finite()) {
        return Err(format!("LED {} has a non-finite position", pos.id));
    }

    Ok(file.leds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(id: LedId, x: f32, y: f32) -> LedPosition {
        LedPosition { id, x, y }
    }

    #[test]
    fn available_leds_are_distinct() {
        let leds = available_leds(&[pos(1, 0., 0.), pos(2, 1., 0.), pos(1, 2., 0.)]);
        assert_eq!(leds.len(), 2);
        assert_eq!(leds[0].id, 1);
        assert_eq!(leds[1].id, 2);
        assert!(leds.iter().all(|led| led.color == Rgb::default()));
    }

    #[test]
    fn keys_share_slots_by_id() {
        let map = KeyMap::new(&[pos(7, 0., 0.), pos(9, 1., 0.), pos(7, 2., 1.)]).unwrap();
        assert_eq!(map.keys().len(), 3);
        assert_eq!(map.colors().len(), 2);
        assert_eq!(map.keys()[0].slot, map.keys()[2].slot);
        assert_ne!(map.keys()[0].slot, map.keys()[1].slot);

        for key in map.keys() {
            assert_eq!(map.colors()[key.slot].id, key.id);
        }
    }

    #[test]
    fn empty_layout_has_no_leds() {
        assert!(matches!(KeyMap::new(&[]), Err(Error::NoLeds)));
    }

    #[test]
    fn bounds_span_all_keys() {
        let map = KeyMap::new(&[pos(1, 2., 1.), pos(2, 10., 4.), pos(3, 6., 3.)]).unwrap();
        assert_eq!(map.bounds(), Bounds { left: 2., top: 1., width: 8., height: 3. });
    }

    #[test]
    fn normalize_centers_degenerate_axes() {
        let bounds = Bounds { left: 1., top: 5., width: 4., height: 0. };
        assert_eq!(bounds.normalize(1., 5.), (0., 0.5));
        assert_eq!(bounds.normalize(5., 5.), (1., 0.5));
        assert_eq!(bounds.normalize(3., 5.), (0.5, 0.5));
    }

    #[test]
    fn clear_resets_colors() {
        let mut map = KeyMap::new(&[pos(1, 0., 0.), pos(2, 1., 0.)]).unwrap();
        map.set_color(1, Rgb { r: 1, g: 2, b: 3 });
        assert_eq!(map.colors()[1].color, Rgb { r: 1, g: 2, b: 3 });

        map.clear();
        assert!(map.colors().iter().all(|led| led.color == Rgb::default()));
    }

    #[test]
    fn parse_layout_file() {
        let leds = parse_layout(
            "[[led]]\nid = 41\nx = 0.0\ny = 0.0\n\n[[led]]\nid = 58\nx = 1.5\ny = 0.0\n",
        )
        .unwrap();
        assert_eq!(leds, vec![pos(41, 0., 0.), pos(58, 1.5, 0.)]);
    }

    #[test]
    fn parse_layout_rejects_empty_file() {
        assert!(parse_layout("").is_err());
        assert!(parse_layout("[[led]]\nid = 1\nx = 0.0\n").is_err());
    }

    #[test]
    fn load_layout_reports_path() {
        let path = std::env::temp_dir().join(format!("keyplay-layout-{}.toml", std::process::id()));
        fs::write(&path, "led = []\n").unwrap();

        let err = load_layout(&path).unwrap_err();
        let _ = fs::remove_file(&path);

        match err {
            Error::Layout { path: err_path, .. } => assert_eq!(err_path, path),
            err => panic!("unexpected error: {}", err),
        }
    }
}
