//! Terminal keyboard preview.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::{self, Write};

use crate::controller::LightingDevice;
use crate::error::Result;
use crate::layout::{LedColor, LedId, LedPosition};
use crate::{Brightness, Rgb};

/// Terminal columns per key cell.
const CELL_WIDTH: usize = 3;

/// Largest grid drawn, in key cells.
const MAX_COLUMNS: usize = 60;
const MAX_ROWS: usize = 20;

/// Keyboard drawn with ANSI true-color cells.
pub struct TerminalPreview {
    positions: Vec<LedPosition>,
    /// Grid cell `(row, col)` of every position.
    cells: Vec<(usize, usize)>,
    brightness: Brightness,
    /// Number of lines drawn by the previous frame.
    drawn_lines: usize,
}

impl TerminalPreview {
    pub fn new(positions: Vec<LedPosition>, brightness: Brightness) -> Self {
        let rows = Axis::new(positions.iter().map(|pos| pos.y), MAX_ROWS);
        let cols = Axis::new(positions.iter().map(|pos| pos.x), MAX_COLUMNS);
        let cells = positions.iter().map(|pos| (rows.cell(pos.y), cols.cell(pos.x))).collect();

        Self { positions, cells, brightness, drawn_lines: 0 }
    }

    /// Render a frame, moving the cursor back over the previous one.
    fn render(&self, colors: &[LedColor]) -> (String, usize) {
        let colors: HashMap<LedId, Rgb> =
            colors.iter().map(|led| (led.id, led.color.scale(self.brightness))).collect();

        // Place every LED into a character grid.
        let mut grid: Vec<Vec<Option<Rgb>>> = Vec::new();
        for (pos, &(row, col)) in self.positions.iter().zip(&self.cells) {
            if grid.len() <= row {
                grid.resize(row + 1, Vec::new());
            }
            if grid[row].len() <= col {
                grid[row].resize(col + 1, None);
            }

            grid[row][col] = Some(colors.get(&pos.id).copied().unwrap_or_default());
        }

        let mut out = String::new();
        if self.drawn_lines > 0 {
            let _ = write!(out, "\x1b[{}A", self.drawn_lines);
        }

        for row in &grid {
            for cell in row {
                match cell {
                    Some(Rgb { r, g, b }) => {
                        let cell = " ".repeat(CELL_WIDTH - 1);
                        let _ = write!(out, "\x1b[48;2;{};{};{}m{}\x1b[0m ", r, g, b, cell);
                    },
                    None => out.push_str(&" ".repeat(CELL_WIDTH)),
                }
            }
            out.push_str("\x1b[K\n");
        }

        (out, grid.len())
    }
}

/// Mapping from one layout coordinate axis to grid cells.
struct Axis {
    start: f32,
    pitch: f32,
    max_cell: usize,
}

impl Axis {
    /// Use the smallest gap between distinct positions as one cell, limited to `max_cells`.
    fn new(values: impl Iterator<Item = f32>, max_cells: usize) -> Self {
        let mut values = values.filter(|value| value.is_finite()).collect::<Vec<_>>();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        let start = values.first().copied().unwrap_or_default();
        let span = values.last().copied().unwrap_or_default() - start;
        if span <= 0. {
            return Self { start, pitch: 1., max_cell: 0 };
        }

        // Ignore jitter between keys that are meant to line up.
        let tolerance = span / (max_cells * 4) as f32;
        let smallest_gap = values
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .filter(|&gap| gap > tolerance)
            .fold(span, f32::min);

        let pitch = smallest_gap.max(span / (max_cells - 1) as f32);

        Self { start, pitch, max_cell: max_cells - 1 }
    }

    fn cell(&self, value: f32) -> usize {
        let cell = ((value - self.start) / self.pitch).round();
        if cell.is_nan() {
            return 0;
        }
        (cell.max(0.) as usize).min(self.max_cell)
    }
}

impl LightingDevice for TerminalPreview {
    fn name(&self) -> &str {
        "terminal preview"
    }

    fn led_positions(&self) -> Vec<LedPosition> {
        self.positions.clone()
    }

    fn set_colors(&mut self, colors: &[LedColor]) -> Result<()> {
        let (frame, lines) = self.render(colors);

        let mut stdout = io::stdout().lock();
        stdout.write_all(frame.as_bytes())?;
        stdout.flush()?;

        self.drawn_lines = lines;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preview() -> TerminalPreview {
        let positions = vec![
            LedPosition { id: 1, x: 0., y: 0. },
            LedPosition { id: 2, x: 2., y: 0. },
            LedPosition { id: 3, x: 1., y: 1. },
        ];
        TerminalPreview::new(positions, Brightness::max_value())
    }

    #[test]
    fn render_draws_grid() {
        let preview = preview();
        let colors = [
            LedColor { id: 1, color: Rgb { r: 255, g: 0, b: 0 } },
            LedColor { id: 2, color: Rgb { r: 0, g: 255, b: 0 } },
        ];
        let (frame, lines) = preview.render(&colors);

        assert_eq!(lines, 2);
        let rows = frame.lines().collect::<Vec<_>>();
        assert_eq!(rows.len(), 2);

        assert!(rows[0].starts_with("\x1b[48;2;255;0;0m"));
        assert!(rows[0].contains("\x1b[48;2;0;255;0m"));
        // Missing colors are drawn black, gaps stay blank.
        assert!(rows[1].starts_with("   \x1b[48;2;0;0;0m"));
    }

    #[test]
    fn millimeter_layouts_stay_compact() {
        let positions = vec![
            LedPosition { id: 1, x: 0., y: 0. },
            LedPosition { id: 2, x: 440., y: 150. },
            LedPosition { id: 3, x: 220., y: 0. },
        ];
        let preview = TerminalPreview::new(positions, Brightness::max_value());
        assert_eq!(preview.cells, vec![(0, 0), (1, 2), (0, 1)]);

        let (frame, lines) = preview.render(&[]);
        assert_eq!(lines, 2);
        assert_eq!(frame.lines().count(), 2);
    }

    #[test]
    fn grid_size_is_bounded() {
        let positions = (0..200)
            .map(|i| LedPosition { id: i, x: i as f32 * i as f32, y: (i % 7) as f32 * 1e6 })
            .collect::<Vec<_>>();
        let preview = TerminalPreview::new(positions, Brightness::max_value());

        assert!(preview.cells.iter().all(|&(row, col)| row < MAX_ROWS && col < MAX_COLUMNS));
        assert_eq!(preview.render(&[]).1, 7);
    }

    #[test]
    fn unit_layouts_keep_their_grid() {
        let preview = preview();
        assert_eq!(preview.cells, vec![(0, 0), (0, 2), (1, 1)]);
    }

    #[test]
    fn render_redraws_in_place() {
        let mut preview = preview();
        preview.drawn_lines = 2;
        let (frame, _) = preview.render(&[]);
        assert!(frame.starts_with("\x1b[2A"));
    }
}
