//! Temporal aggregation of per-frame gesture samples.
//!
//! A gesture only counts once it has been held: a sliding time window of
//! recent samples must agree on one label for long enough, and with enough
//! confidence, before an incident is confirmed.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::models::{GestureLabel, GestureSample};

/// Fewest samples that can ever confirm, whatever the configuration says.
const SAMPLE_FLOOR: usize = 2;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// A non-NONE sample at or above this confidence starts accumulation.
    pub entry_threshold: f32,
    /// Mean confidence the agreeing samples must reach.
    pub sustain_threshold: f32,
    pub window: Duration,
    /// Agreeing samples must span at least this long.
    pub min_sustain: Duration,
    /// Share of the window that must carry the same label.
    pub agreement_ratio: f32,
    pub min_samples: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            entry_threshold: 0.5,
            sustain_threshold: 0.6,
            window: Duration::milliseconds(1500),
            min_sustain: Duration::milliseconds(1000),
            agreement_ratio: 0.7,
            min_samples: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Idle,
    Accumulating,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub label: GestureLabel,
    pub confirmed_at: DateTime<Utc>,
    pub samples: usize,
    pub agreement: f32,
    pub mean_confidence: f32,
}

pub struct TemporalAggregator {
    config: AggregatorConfig,
    state: AggregatorState,
    window: VecDeque<GestureSample>,
}

impl TemporalAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            state: AggregatorState::Idle,
            window: VecDeque::new(),
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    fn is_candidate(&self, sample: &GestureSample) -> bool {
        sample.label != GestureLabel::None && sample.confidence >= self.config.entry_threshold
    }

    fn reset(&mut self) {
        self.window.clear();
        self.state = AggregatorState::Idle;
    }

    /// Feed one sample; returns a confirmation at most once per held gesture.
    pub fn push(&mut self, sample: GestureSample) -> Option<Confirmation> {
        if let Some(last) = self.window.back() {
            if sample.timestamp < last.timestamp {
                debug!(timestamp = %sample.timestamp, "ignoring out-of-order sample");
                return None;
            }
        }

        if self.state != AggregatorState::Accumulating {
            if !self.is_candidate(&sample) {
                return None;
            }
            debug!(label = %sample.label, "accumulating");
            self.window.clear();
            self.state = AggregatorState::Accumulating;
        }

        self.window.push_back(sample);
        let horizon = sample.timestamp - self.config.window;
        while self
            .window
            .front()
            .is_some_and(|s| s.timestamp < horizon)
        {
            self.window.pop_front();
        }

        if !self.window.iter().any(|s| self.is_candidate(s)) {
            debug!("window drained without agreement");
            self.reset();
            return None;
        }

        let confirmation = GestureLabel::ALERTING
            .iter()
            .filter_map(|label| self.evaluate(*label))
            .max_by(|a, b| {
                a.agreement
                    .partial_cmp(&b.agreement)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.label.priority().cmp(&b.label.priority()))
            })?;

        self.state = AggregatorState::Confirmed;
        debug!(
            label = %confirmation.label,
            samples = confirmation.samples,
            agreement = confirmation.agreement,
            "gesture confirmed"
        );
        self.reset();
        Some(confirmation)
    }

    fn evaluate(&self, label: GestureLabel) -> Option<Confirmation> {
        let matching: Vec<&GestureSample> =
            self.window.iter().filter(|s| s.label == label).collect();
        let (first, last) = (matching.first()?, matching.last()?);

        if matching.len() < self.config.min_samples.max(SAMPLE_FLOOR) {
            return None;
        }
        if last.timestamp - first.timestamp < self.config.min_sustain {
            return None;
        }

        let agreement = matching.len() as f32 / self.window.len() as f32;
        let mean_confidence =
            matching.iter().map(|s| s.confidence).sum::<f32>() / matching.len() as f32;

        (agreement >= self.config.agreement_ratio
            && mean_confidence >= self.config.sustain_threshold)
            .then(|| Confirmation {
                label,
                confirmed_at: last.timestamp,
                samples: matching.len(),
                agreement,
                mean_confidence,
            })
    }
}
