//! Maps a per-step attention row onto the generated tokens shown on screen.
//!
//! The row covers the whole context (prompt followed by everything generated
//! so far). Only the generated tail is displayed.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::types::StepRecord;

/// Number of prior tokens highlighted as most attended.
pub const SALIENCE_COUNT: usize = 3;
pub const MIN_OPACITY: f32 = 0.3;
pub const MAX_OPACITY: f32 = 1.0;
/// Opacity of the secondary token track in UTF-8 mode.
pub const SECONDARY_TRACK_OPACITY: f32 = 0.5;
/// Glyph for token ids outside printable ASCII.
pub const PLACEHOLDER_GLYPH: char = '·';

/// Perceptual contrast applied before mapping a weight to opacity.
pub fn contrast(weight: f32) -> f32 {
    weight.max(0.0).sqrt()
}

pub fn opacity(weight: f32) -> f32 {
    MIN_OPACITY + contrast(weight).min(1.0) * (MAX_OPACITY - MIN_OPACITY)
}

pub fn ascii_glyph(token_id: u32) -> char {
    match token_id {
        32..=126 => char::from_u32(token_id).unwrap_or(PLACEHOLDER_GLYPH),
        _ => PLACEHOLDER_GLYPH,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignedAttention {
    pub prompt_len: usize,
    /// One weight per generated token up to and including the pointer.
    pub weights: Vec<f32>,
    /// Indices of the most attended prior tokens, strongest first.
    pub salient: Vec<usize>,
}

impl AlignedAttention {
    pub fn is_salient(&self, index: usize) -> bool {
        self.salient.contains(&index)
    }
}

/// Slice `row` down to the generated tokens visible at `pointer`.
pub fn align(row: &[f32], pointer: usize) -> AlignedAttention {
    let generated = pointer + 1;
    let prompt_len = row.len().saturating_sub(generated);

    let mut weights: Vec<f32> = row[prompt_len..]
        .iter()
        .map(|w| if w.is_finite() { *w } else { 0.0 })
        .collect();
    weights.resize(generated, 0.0);

    let mut prior: Vec<(usize, f32)> = weights[..pointer].iter().copied().enumerate().collect();
    prior.sort_by(|(ia, wa), (ib, wb)| {
        wb.partial_cmp(wa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| ia.cmp(ib))
    });
    let salient = prior
        .into_iter()
        .take(SALIENCE_COUNT)
        .map(|(index, _)| index)
        .collect();

    AlignedAttention {
        prompt_len,
        weights,
        salient,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RenderMode {
    /// One character per byte-level token.
    #[default]
    Ascii,
    /// Decoded text, with the token boxes as a secondary track.
    Utf8,
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderMode::Ascii => f.write_str("ascii"),
            RenderMode::Utf8 => f.write_str("utf-8"),
        }
    }
}

impl FromStr for RenderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ascii" => Ok(RenderMode::Ascii),
            "utf-8" | "utf8" => Ok(RenderMode::Utf8),
            other => Err(format!("unknown render mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenCell {
    pub index: usize,
    /// ASCII glyph or display form, depending on the mode.
    pub label: String,
    /// Escaped form of the token, for hover text.
    pub display: String,
    pub weight: f32,
    pub opacity: f32,
    pub current: bool,
    pub salient: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenTrack {
    pub mode: RenderMode,
    pub head: usize,
    pub attention: AlignedAttention,
    pub cells: Vec<TokenCell>,
    /// Concatenated token text, present in UTF-8 mode.
    pub decoded: Option<String>,
    /// Opacity applied to the whole cell track.
    pub track_opacity: f32,
}

/// Build the token track for the step at `pointer` and attention `head`.
///
/// Returns `None` when `pointer` is out of range. A head the trace did not
/// carry is treated as an all-zero row.
pub fn build_track(
    steps: &[StepRecord],
    pointer: usize,
    head: usize,
    mode: RenderMode,
) -> Option<TokenTrack> {
    let current = steps.get(pointer)?;
    let row = current.attention_row(head).unwrap_or(&[]);
    let attention = align(row, pointer);

    let cells = steps[..=pointer]
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let weight = attention.weights[index];
            let is_current = index == pointer;
            let label = match mode {
                RenderMode::Ascii => ascii_glyph(step.token_id).to_string(),
                RenderMode::Utf8 => step.token_display.clone(),
            };
            TokenCell {
                index,
                label,
                display: step.token_display.clone(),
                weight,
                opacity: if is_current { MAX_OPACITY } else { opacity(weight) },
                current: is_current,
                salient: attention.is_salient(index),
            }
        })
        .collect();

    let (decoded, track_opacity) = match mode {
        RenderMode::Ascii => (None, 1.0),
        RenderMode::Utf8 => (
            Some(steps[..=pointer].iter().map(|s| s.token_text.as_str()).collect()),
            SECONDARY_TRACK_OPACITY,
        ),
    };

    Some(TokenTrack {
        mode,
        head,
        attention,
        cells,
        decoded,
        track_opacity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn step(index: usize, token_id: u32, text: &str, attn: Vec<Vec<f32>>) -> StepRecord {
        StepRecord {
            step: index,
            token_id,
            token_text: text.into(),
            token_display: text.escape_default().to_string(),
            entropy: 1.0,
            topk: vec![],
            attn,
        }
    }

    #[test]
    fn test_align_slices_generated_tail() {
        let row = [0.1, 0.1, 0.2, 0.25, 0.35];
        let aligned = align(&row, 2);
        assert_eq!(aligned.prompt_len, 2);
        assert_eq!(aligned.weights, vec![0.2, 0.25, 0.35]);
    }

    #[test]
    fn test_align_slice_length_is_pointer_plus_one() {
        for pointer in 0..6 {
            for len in 0..6 {
                let row = vec![0.1; len];
                let aligned = align(&row, pointer);
                assert_eq!(aligned.weights.len(), pointer + 1);
                assert!(aligned.prompt_len <= row.len());
            }
        }
    }

    #[test]
    fn test_salience_top_three_excludes_current() {
        let row = [0.05, 0.3, 0.1, 0.3, 0.2, 0.9];
        let aligned = align(&row, 5);
        assert_eq!(aligned.prompt_len, 0);
        assert_eq!(aligned.salient, vec![1, 3, 4]);
        assert!(!aligned.is_salient(5));
    }

    #[test]
    fn test_salience_with_fewer_prior_tokens() {
        assert!(align(&[1.0], 0).salient.is_empty());
        assert_eq!(align(&[0.4, 0.6], 1).salient, vec![0]);
    }

    #[test]
    fn test_opacity_range() {
        assert_eq!(opacity(0.0), MIN_OPACITY);
        assert_eq!(opacity(1.0), MAX_OPACITY);
        assert!((opacity(0.25) - 0.65).abs() < 1e-6);
        assert_eq!(opacity(-1.0), MIN_OPACITY);
    }

    #[test]
    fn test_ascii_glyphs() {
        assert_eq!(ascii_glyph(32), ' ');
        assert_eq!(ascii_glyph(65), 'A');
        assert_eq!(ascii_glyph(126), '~');
        assert_eq!(ascii_glyph(10), PLACEHOLDER_GLYPH);
        assert_eq!(ascii_glyph(127), PLACEHOLDER_GLYPH);
        assert_eq!(ascii_glyph(200), PLACEHOLDER_GLYPH);
    }

    #[test]
    fn test_build_track_ascii() {
        let steps = vec![
            step(0, 104, "h", vec![vec![0.5, 0.5]]),
            step(1, 10, "\n", vec![vec![0.2, 0.2, 0.6]]),
            step(2, 105, "i", vec![vec![0.1, 0.64, 0.16, 0.1]]),
        ];
        let track = build_track(&steps, 2, 0, RenderMode::Ascii).unwrap();
        let labels: Vec<&str> = track.cells.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["h", "·", "i"]);
        assert_eq!(track.cells[1].display, "\\n");
        assert!((track.cells[0].opacity - (0.3 + 0.8 * 0.7)).abs() < 1e-6);
        assert_eq!(track.cells[2].opacity, MAX_OPACITY);
        assert!(track.cells[2].current);
        assert!(track.decoded.is_none());
    }

    #[test]
    fn test_build_track_utf8_decodes_up_to_pointer() {
        let steps = vec![
            step(0, 0xc3, "\u{e9}", vec![vec![1.0]]),
            step(1, 33, "!", vec![vec![0.5, 0.5]]),
            step(2, 33, "?", vec![vec![0.3, 0.3, 0.4]]),
        ];
        let track = build_track(&steps, 1, 0, RenderMode::Utf8).unwrap();
        assert_eq!(track.decoded.as_deref(), Some("\u{e9}!"));
        assert_eq!(track.cells.len(), 2);
        assert_eq!(track.track_opacity, SECONDARY_TRACK_OPACITY);
    }

    #[test]
    fn test_build_track_missing_head_or_pointer() {
        let steps = vec![step(0, 97, "a", vec![vec![1.0]])];
        assert!(build_track(&steps, 1, 0, RenderMode::Ascii).is_none());

        let track = build_track(&steps, 0, 3, RenderMode::Ascii).unwrap();
        assert_eq!(track.attention.weights, vec![0.0]);
    }

    #[test]
    fn test_render_mode_parse() {
        assert_eq!("utf-8".parse::<RenderMode>(), Ok(RenderMode::Utf8));
        assert_eq!("ASCII".parse::<RenderMode>(), Ok(RenderMode::Ascii));
        assert!("hex".parse::<RenderMode>().is_err());
    }
}
