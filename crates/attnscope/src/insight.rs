//! Per-step confidence and top-k candidate views.

use crate::types::StepRecord;

/// Entropy treated as "no confidence" for byte-level vocabularies.
pub const MAX_ENTROPY: f32 = 3.0;

const MIN_BUBBLE_DIAMETER: f32 = 60.0;
const BUBBLE_DIAMETER_RANGE: f32 = 80.0;

/// Lower entropy means higher confidence, in `[0, 1]`.
pub fn confidence(entropy: f32) -> f32 {
    1.0 - (entropy / MAX_ENTROPY).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlowTier {
    Strong,
    Medium,
    Weak,
    Faint,
}

impl GlowTier {
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence > 0.8 {
            GlowTier::Strong
        } else if confidence > 0.5 {
            GlowTier::Medium
        } else if confidence > 0.3 {
            GlowTier::Weak
        } else {
            GlowTier::Faint
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GlowTier::Strong => "strong",
            GlowTier::Medium => "medium",
            GlowTier::Weak => "weak",
            GlowTier::Faint => "faint",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateView {
    pub display: String,
    pub percent: f32,
    pub chosen: bool,
    pub diameter: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepInsight {
    pub step: usize,
    pub entropy: f32,
    pub confidence: f32,
    pub glow: GlowTier,
    pub candidates: Vec<CandidateView>,
}

impl StepInsight {
    pub fn new(record: &StepRecord) -> Self {
        let confidence = confidence(record.entropy);
        let candidates = record
            .topk
            .iter()
            .map(|candidate| CandidateView {
                display: candidate.token_display.clone(),
                percent: candidate.prob * 100.0,
                chosen: candidate.token_id == record.token_id,
                diameter: MIN_BUBBLE_DIAMETER + candidate.prob * BUBBLE_DIAMETER_RANGE,
            })
            .collect();
        Self {
            step: record.step,
            entropy: record.entropy,
            confidence,
            glow: GlowTier::from_confidence(confidence),
            candidates,
        }
    }

    pub fn chosen(&self) -> Option<&CandidateView> {
        self.candidates.iter().find(|c| c.chosen)
    }
}
