//! Heatmap raster for a full `t x t` attention matrix.
//!
//! Only the most recent [`MAX_TOKENS`] query and key positions are kept, so the
//! raster never exceeds `MAX_TOKENS^2` cells regardless of context length.

use std::path::Path;

use image::{Rgb, RgbImage};
use tracing::debug;

use crate::error::{InspectError, Result};
use crate::types::FullAttentionResponse;

pub const MAX_TOKENS: usize = 128;
pub const CELL_SIZE: u32 = 4;
pub const LABEL_WIDTH: u32 = 60;
pub const LABEL_HEIGHT: u32 = 20;
/// Axis labels are placed on every Nth retained position.
pub const LABEL_STRIDE: usize = 10;
pub const LABEL_CHARS: usize = 3;

const BACKGROUND: Rgb<u8> = Rgb([24, 24, 27]);
const LABEL_COLOR: Rgb<u8> = Rgb([161, 161, 170]);
const TICK_LENGTH: u32 = 4;
const LABEL_PADDING: u32 = 2;
const GLYPH_WIDTH: u32 = 3;
const GLYPH_HEIGHT: u32 = 5;
const GLYPH_ADVANCE: u32 = GLYPH_WIDTH + 1;

/// Two-segment linear color scale through a neutral midpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gradient {
    pub low: Rgb<u8>,
    pub mid: Rgb<u8>,
    pub high: Rgb<u8>,
}

impl Default for Gradient {
    fn default() -> Self {
        Self {
            low: Rgb([59, 130, 246]),
            mid: Rgb([255, 255, 255]),
            high: Rgb([255, 234, 179]),
        }
    }
}

impl Gradient {
    /// Color for a normalized value in `[0, 1]`.
    pub fn sample(&self, value: f32) -> Rgb<u8> {
        let value = if value.is_finite() {
            value.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if value < 0.5 {
            lerp(self.low, self.mid, value * 2.0)
        } else {
            lerp(self.mid, self.high, (value - 0.5) * 2.0)
        }
    }
}

fn lerp(from: Rgb<u8>, to: Rgb<u8>, t: f32) -> Rgb<u8> {
    let channel = |a: u8, b: u8| {
        let a = f32::from(a);
        let b = f32::from(b);
        (a + (b - a) * t).floor().clamp(0.0, 255.0) as u8
    };
    Rgb([
        channel(from[0], to[0]),
        channel(from[1], to[1]),
        channel(from[2], to[2]),
    ])
}

/// 3x5 bitmap rows, most significant bit on the left.
const fn glyph_bits(ch: char) -> [u8; 5] {
    match ch {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b010, 0b010, 0b010],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        'A' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'B' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'C' => [0b111, 0b100, 0b100, 0b100, 0b111],
        'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'E' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'F' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'G' => [0b111, 0b100, 0b101, 0b101, 0b111],
        'H' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'I' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'J' => [0b111, 0b001, 0b001, 0b101, 0b111],
        'K' => [0b101, 0b101, 0b110, 0b101, 0b101],
        'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'M' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'N' => [0b110, 0b101, 0b101, 0b101, 0b101],
        'O' => [0b111, 0b101, 0b101, 0b101, 0b111],
        'P' => [0b111, 0b101, 0b111, 0b100, 0b100],
        'Q' => [0b111, 0b101, 0b101, 0b111, 0b011],
        'R' => [0b111, 0b101, 0b111, 0b110, 0b101],
        'S' => [0b111, 0b100, 0b111, 0b001, 0b111],
        'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'U' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'V' => [0b101, 0b101, 0b101, 0b101, 0b010],
        'W' => [0b101, 0b101, 0b111, 0b111, 0b101],
        'X' => [0b101, 0b101, 0b010, 0b101, 0b101],
        'Y' => [0b101, 0b101, 0b010, 0b010, 0b010],
        'Z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        '+' => [0b000, 0b010, 0b111, 0b010, 0b000],
        '=' => [0b000, 0b111, 0b000, 0b111, 0b000],
        ':' => [0b000, 0b010, 0b000, 0b010, 0b000],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        ',' => [0b000, 0b000, 0b000, 0b010, 0b100],
        '\'' => [0b010, 0b010, 0b000, 0b000, 0b000],
        '"' => [0b101, 0b101, 0b000, 0b000, 0b000],
        '!' => [0b010, 0b010, 0b010, 0b000, 0b010],
        '?' => [0b111, 0b001, 0b010, 0b000, 0b010],
        '_' => [0b000, 0b000, 0b000, 0b000, 0b111],
        '/' => [0b001, 0b001, 0b010, 0b100, 0b100],
        '\\' => [0b100, 0b100, 0b010, 0b001, 0b001],
        '(' => [0b001, 0b010, 0b010, 0b010, 0b001],
        ')' => [0b100, 0b010, 0b010, 0b010, 0b100],
        '<' => [0b001, 0b010, 0b100, 0b010, 0b001],
        '>' => [0b100, 0b010, 0b001, 0b010, 0b100],
        ' ' => [0b000, 0b000, 0b000, 0b000, 0b000],
        _ => [0b111, 0b101, 0b010, 0b010, 0b111],
    }
}

fn text_width(text: &str) -> u32 {
    (text.chars().count() as u32 * GLYPH_ADVANCE).saturating_sub(1)
}

/// Draw `text` with its top-left corner at `(x, y)`, clipped to the image.
fn draw_text(image: &mut RgbImage, x: u32, y: u32, text: &str) {
    let (width, height) = image.dimensions();
    for (index, ch) in text.chars().enumerate() {
        let left = x + index as u32 * GLYPH_ADVANCE;
        let glyph = glyph_bits(ch.to_ascii_uppercase());
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                    continue;
                }
                let (px, py) = (left + col, y + row as u32);
                if px < width && py < height {
                    image.put_pixel(px, py, LABEL_COLOR);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisLabel {
    /// Index within the retained window.
    pub position: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    layer: usize,
    head: usize,
    total_tokens: usize,
    /// First retained position in the original matrix.
    offset: usize,
    size: usize,
    /// Row-major normalized values, `size * size`.
    cells: Vec<f32>,
    labels: Vec<AxisLabel>,
}

impl Heatmap {
    pub fn from_matrix(matrix: &FullAttentionResponse) -> Result<Self> {
        let total = matrix.attn.len();
        if let Some((row, values)) = matrix
            .attn
            .iter()
            .enumerate()
            .find(|(_, values)| values.len() != total)
        {
            return Err(InspectError::InvalidMatrix(format!(
                "row {row} has {} columns, expected {total}",
                values.len()
            )));
        }

        let offset = total.saturating_sub(MAX_TOKENS);
        let size = total - offset;

        let retained: Vec<f32> = matrix.attn[offset..]
            .iter()
            .flat_map(|row| row[offset..].iter().copied())
            .collect();

        let (min, max) = retained
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = if max > min { max - min } else { 1.0 };
        let cells = retained
            .iter()
            .map(|&v| {
                if v.is_finite() && min.is_finite() {
                    (v - min) / range
                } else {
                    0.0
                }
            })
            .collect();

        let labels = (0..size)
            .step_by(LABEL_STRIDE)
            .map(|position| AxisLabel {
                position,
                text: matrix
                    .tokens_display
                    .get(offset + position)
                    .map(|token| token.chars().take(LABEL_CHARS).collect())
                    .unwrap_or_default(),
            })
            .collect();

        debug!(total, retained = size, "built attention heatmap");
        Ok(Self {
            layer: matrix.layer,
            head: matrix.head,
            total_tokens: total,
            offset,
            size,
            cells,
            labels,
        })
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn head(&self) -> usize {
        self.head
    }

    /// Sequence length before downsampling.
    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    /// Positions retained per axis.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_truncated(&self) -> bool {
        self.offset > 0
    }

    /// Normalized value for a retained query row and key column.
    pub fn value(&self, row: usize, col: usize) -> Option<f32> {
        if row >= self.size || col >= self.size {
            return None;
        }
        self.cells.get(row * self.size + col).copied()
    }

    /// Labels shared by both axes: rows are queries, columns are keys.
    pub fn axis_labels(&self) -> &[AxisLabel] {
        &self.labels
    }

    pub fn dimensions(&self) -> (u32, u32) {
        let grid = self.size as u32 * CELL_SIZE;
        (grid + LABEL_WIDTH, grid + LABEL_HEIGHT)
    }

    pub fn render(&self, gradient: &Gradient) -> RgbImage {
        let (width, height) = self.dimensions();
        let mut image = RgbImage::from_pixel(width, height, BACKGROUND);

        for row in 0..self.size {
            for col in 0..self.size {
                let color = gradient.sample(self.cells[row * self.size + col]);
                let x0 = LABEL_WIDTH + col as u32 * CELL_SIZE;
                let y0 = LABEL_HEIGHT + row as u32 * CELL_SIZE;
                for y in y0..y0 + CELL_SIZE {
                    for x in x0..x0 + CELL_SIZE {
                        image.put_pixel(x, y, color);
                    }
                }
            }
        }

        for label in &self.labels {
            let along = label.position as u32 * CELL_SIZE;
            for offset in 0..TICK_LENGTH {
                image.put_pixel(LABEL_WIDTH + along, LABEL_HEIGHT - 1 - offset, LABEL_COLOR);
                image.put_pixel(LABEL_WIDTH - 1 - offset, LABEL_HEIGHT + along, LABEL_COLOR);
            }

            let text_gap = TICK_LENGTH + LABEL_PADDING;
            draw_text(
                &mut image,
                LABEL_WIDTH + along,
                LABEL_HEIGHT - text_gap - GLYPH_HEIGHT,
                &label.text,
            );
            let width = text_width(&label.text);
            draw_text(
                &mut image,
                (LABEL_WIDTH - text_gap).saturating_sub(width),
                LABEL_HEIGHT + along,
                &label.text,
            );
        }

        image
    }

    /// Render with the default gradient and write a PNG.
    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<()> {
        self.render(&Gradient::default()).save(path)?;
        Ok(())
    }
}
