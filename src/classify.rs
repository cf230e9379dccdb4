//! Gesture classification from normalized hand features.
//!
//! Each alerting gesture is a fixed list of geometric checks; its confidence
//! is the fraction of checks the hand satisfies, so partial matches still
//! carry weight downstream.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{Frame, GestureLabel, GestureSample};
use crate::normalize::{self, FeatureVector, Finger, NormalizerConfig};

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Thumb tip closer than this (bone lengths) to the middle/ring knuckles is tucked.
    pub thumb_tuck_ratio: f32,
    /// Maximum angle between palm normal and camera axis for a palm facing the camera.
    pub palm_tilt_limit_deg: f32,
    /// More unknown features than this and the hand is not classified at all.
    pub max_unknown: usize,
    /// Best gesture score needed to report anything other than NONE.
    pub min_match: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            thumb_tuck_ratio: 0.7,
            palm_tilt_limit_deg: 55.0,
            max_unknown: 4,
            min_match: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    Extended(Finger),
    Folded(Finger),
    ThumbTucked,
    PalmFacing,
}

const KIDNAP_ALERT: &[Check] = &[
    Check::Extended(Finger::Thumb),
    Check::Extended(Finger::Index),
    Check::Folded(Finger::Middle),
    Check::Folded(Finger::Ring),
    Check::Folded(Finger::Little),
    Check::PalmFacing,
];

const SOS: &[Check] = &[
    Check::Folded(Finger::Thumb),
    Check::Folded(Finger::Index),
    Check::Folded(Finger::Middle),
    Check::Folded(Finger::Ring),
    Check::Folded(Finger::Little),
    Check::ThumbTucked,
    Check::PalmFacing,
];

const DISTRESS: &[Check] = &[
    Check::Folded(Finger::Thumb),
    Check::Extended(Finger::Index),
    Check::Extended(Finger::Middle),
    Check::Extended(Finger::Ring),
    Check::Extended(Finger::Little),
    Check::ThumbTucked,
    Check::PalmFacing,
];

fn checks(label: GestureLabel) -> &'static [Check] {
    match label {
        GestureLabel::KidnapAlert => KIDNAP_ALERT,
        GestureLabel::Sos => SOS,
        GestureLabel::Distress => DISTRESS,
        GestureLabel::None => &[],
    }
}

/// Highest score wins; equal scores go to the more severe gesture.
pub fn strongest(scores: &[(GestureLabel, f32)]) -> Option<(GestureLabel, f32)> {
    scores.iter().copied().max_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.priority().cmp(&b.0.priority()))
    })
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    pub normalizer: NormalizerConfig,
    pub config: ClassifierConfig,
}

impl Classifier {
    pub fn new(normalizer: NormalizerConfig, config: ClassifierConfig) -> Self {
        Self { normalizer, config }
    }

    fn evaluate(&self, check: Check, features: &FeatureVector) -> Option<bool> {
        match check {
            Check::Extended(finger) => features.is_extended(finger),
            Check::Folded(finger) => features.is_extended(finger).map(|e| !e),
            Check::ThumbTucked => features
                .thumb_tuck_ratio
                .map(|r| r < self.config.thumb_tuck_ratio),
            Check::PalmFacing => features
                .palm_tilt_deg
                .map(|t| t <= self.config.palm_tilt_limit_deg),
        }
    }

    pub fn score(&self, label: GestureLabel, features: &FeatureVector) -> f32 {
        let checks = checks(label);
        if checks.is_empty() {
            return 0.0;
        }
        let satisfied = checks
            .iter()
            .filter(|c| self.evaluate(**c, features) == Some(true))
            .count();
        satisfied as f32 / checks.len() as f32
    }

    pub fn classify(&self, features: &FeatureVector, timestamp: DateTime<Utc>) -> GestureSample {
        if features.unknown_count() > self.config.max_unknown {
            return GestureSample::none(timestamp);
        }

        let scores: Vec<(GestureLabel, f32)> = GestureLabel::ALERTING
            .iter()
            .map(|label| (*label, self.score(*label, features)))
            .collect();

        match strongest(&scores) {
            Some((label, score)) if score >= self.config.min_match => GestureSample {
                label,
                confidence: score,
                timestamp,
            },
            Some((_, score)) => GestureSample {
                label: GestureLabel::None,
                confidence: (1.0 - score).clamp(0.0, 1.0),
                timestamp,
            },
            None => GestureSample::none(timestamp),
        }
    }

    /// Classify every hand in a frame and keep the strongest alerting gesture.
    ///
    /// Malformed hands are dropped; a frame with nothing usable is NONE.
    pub fn classify_frame(&self, frame: &Frame) -> GestureSample {
        let mut samples = Vec::with_capacity(frame.hands.len());
        for hand in &frame.hands {
            match normalize::normalize(hand, &self.normalizer) {
                Ok(features) => samples.push(self.classify(&features, frame.timestamp)),
                Err(err) => debug!(timestamp = %frame.timestamp, "dropping hand: {err}"),
            }
        }

        let alerting: Vec<(GestureLabel, f32)> = samples
            .iter()
            .filter(|s| s.label != GestureLabel::None)
            .map(|s| (s.label, s.confidence))
            .collect();

        match strongest(&alerting) {
            Some((label, confidence)) => GestureSample {
                label,
                confidence,
                timestamp: frame.timestamp,
            },
            None => samples
                .into_iter()
                .max_by(|a, b| {
                    a.confidence
                        .partial_cmp(&b.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or_else(|| GestureSample::none(frame.timestamp)),
        }
    }
}
