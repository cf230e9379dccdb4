use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One keypoint as reported by the landmark detector, in normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
    #[serde(default = "full_visibility")]
    pub visibility: f32,
}

fn full_visibility() -> f32 {
    1.0
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            x,
            y,
            z,
            visibility: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandObservation {
    pub handedness: Option<String>,
    pub score: f32,
    pub landmarks: Vec<Landmark>,
    pub timestamp: DateTime<Utc>,
}

/// Everything the detector reported for a single camera frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp: DateTime<Utc>,
    pub hands: Vec<HandObservation>,
    /// Encoded frame written by the capture side, if it keeps one.
    pub image_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GestureLabel {
    None,
    Sos,
    Distress,
    KidnapAlert,
}

impl GestureLabel {
    pub const ALERTING: [GestureLabel; 3] = [Self::KidnapAlert, Self::Sos, Self::Distress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Sos => "SOS",
            Self::Distress => "DISTRESS",
            Self::KidnapAlert => "KIDNAP_ALERT",
        }
    }

    /// Severity rank used to break confidence ties; higher wins.
    pub fn priority(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Distress => 1,
            Self::Sos => 2,
            Self::KidnapAlert => 3,
        }
    }

    pub fn headline(&self) -> &'static str {
        match self {
            Self::None => "No gesture",
            Self::Sos => "SOS signal",
            Self::Distress => "Distress signal",
            Self::KidnapAlert => "Kidnap alert",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NONE" => Some(Self::None),
            "SOS" => Some(Self::Sos),
            "DISTRESS" => Some(Self::Distress),
            "KIDNAP_ALERT" => Some(Self::KidnapAlert),
            _ => None,
        }
    }
}

impl fmt::Display for GestureLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GestureSample {
    pub label: GestureLabel,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl GestureSample {
    pub fn none(timestamp: DateTime<Utc>) -> Self {
        Self {
            label: GestureLabel::None,
            confidence: 0.0,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentState {
    Confirmed,
    EvidenceGathered,
    Dispatching,
    Delivered,
    Failed,
    Suppressed,
}

impl IncidentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Suppressed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "CONFIRMED",
            Self::EvidenceGathered => "EVIDENCE_GATHERED",
            Self::Dispatching => "DISPATCHING",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
            Self::Suppressed => "SUPPRESSED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CONFIRMED" => Some(Self::Confirmed),
            "EVIDENCE_GATHERED" => Some(Self::EvidenceGathered),
            "DISPATCHING" => Some(Self::Dispatching),
            "DELIVERED" => Some(Self::Delivered),
            "FAILED" => Some(Self::Failed),
            "SUPPRESSED" => Some(Self::Suppressed),
            _ => None,
        }
    }
}

impl fmt::Display for IncidentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Whatsapp,
    Local,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Whatsapp => "whatsapp",
            Self::Local => "local",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sms" => Some(Self::Sms),
            "whatsapp" => Some(Self::Whatsapp),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::TransientFailure => "TRANSIENT_FAILURE",
            Self::PermanentFailure => "PERMANENT_FAILURE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUCCESS" => Some(Self::Success),
            "TRANSIENT_FAILURE" => Some(Self::TransientFailure),
            "PERMANENT_FAILURE" => Some(Self::PermanentFailure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub place: Option<String>,
}

impl Location {
    pub fn map_link(&self) -> String {
        format!(
            "https://maps.google.com/?q={},{}",
            self.latitude, self.longitude
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub gesture: GestureLabel,
    pub confidence: f32,
    pub confirmed_at: DateTime<Utc>,
    pub state: IncidentState,
    pub snapshot: Option<String>,
    pub location: Option<Location>,
    pub message: Option<String>,
    /// Incident that held the active slot when this one was suppressed.
    pub suppressed_by: Option<Uuid>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn confirmed(gesture: GestureLabel, confidence: f32, confirmed_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            gesture,
            confidence,
            confirmed_at,
            state: IncidentState::Confirmed,
            snapshot: None,
            location: None,
            message: None,
            suppressed_by: None,
            resolved_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub incident_id: Uuid,
    pub channel: Channel,
    pub attempt: u32,
    pub attempted_at: DateTime<Utc>,
    pub outcome: DeliveryOutcome,
    pub detail: Option<String>,
}

/// An incident in its latest recorded state together with its attempt history.
#[derive(Debug, Clone)]
pub struct IncidentRecord {
    pub incident: Incident,
    pub attempts: Vec<DeliveryAttempt>,
}

impl IncidentRecord {
    #[cfg(test)]
    pub fn attempts_on(&self, channel: Channel) -> impl Iterator<Item = &DeliveryAttempt> + '_ {
        self.attempts.iter().filter(move |a| a.channel == channel)
    }
}

#[derive(Debug, Clone)]
pub struct GestureSummary {
    pub gesture: GestureLabel,
    pub count: usize,
    pub delivered: usize,
    pub avg_confidence: f64,
}
