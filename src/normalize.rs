//! Landmark normalization.
//!
//! Maps one detected hand into a hand-local frame (wrist at the origin,
//! wrist-to-middle-knuckle bone of unit length pointing along +y) and derives
//! the geometric features the classifier works on. Every derived quantity is
//! an angle or a ratio of lengths in that frame, so it does not change when
//! the hand is moved, scaled, or rotated in the image plane.

use crate::error::AlertError;
use crate::models::HandObservation;

/// Hand topology reported by the detector (MediaPipe hand landmarker layout).
pub mod points {
    pub const COUNT: usize = 21;

    pub const WRIST: usize = 0;
    pub const THUMB_CMC: usize = 1;
    pub const THUMB_MCP: usize = 2;
    pub const THUMB_IP: usize = 3;
    pub const THUMB_TIP: usize = 4;
    pub const INDEX_MCP: usize = 5;
    pub const INDEX_PIP: usize = 6;
    pub const INDEX_DIP: usize = 7;
    pub const INDEX_TIP: usize = 8;
    pub const MIDDLE_MCP: usize = 9;
    pub const MIDDLE_PIP: usize = 10;
    pub const MIDDLE_DIP: usize = 11;
    pub const MIDDLE_TIP: usize = 12;
    pub const RING_MCP: usize = 13;
    pub const RING_PIP: usize = 14;
    pub const RING_DIP: usize = 15;
    pub const RING_TIP: usize = 16;
    pub const LITTLE_MCP: usize = 17;
    pub const LITTLE_PIP: usize = 18;
    pub const LITTLE_DIP: usize = 19;
    pub const LITTLE_TIP: usize = 20;

    pub const PALM: [usize; 5] = [WRIST, INDEX_MCP, MIDDLE_MCP, RING_MCP, LITTLE_MCP];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Finger {
    Thumb,
    Index,
    Middle,
    Ring,
    Little,
}

impl Finger {
    pub const ALL: [Finger; 5] = [
        Self::Thumb,
        Self::Index,
        Self::Middle,
        Self::Ring,
        Self::Little,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Joint chain from the wrist out to the fingertip.
    pub fn chain(&self) -> [usize; 5] {
        use points::*;
        match self {
            Self::Thumb => [WRIST, THUMB_CMC, THUMB_MCP, THUMB_IP, THUMB_TIP],
            Self::Index => [WRIST, INDEX_MCP, INDEX_PIP, INDEX_DIP, INDEX_TIP],
            Self::Middle => [WRIST, MIDDLE_MCP, MIDDLE_PIP, MIDDLE_DIP, MIDDLE_TIP],
            Self::Ring => [WRIST, RING_MCP, RING_PIP, RING_DIP, RING_TIP],
            Self::Little => [WRIST, LITTLE_MCP, LITTLE_PIP, LITTLE_DIP, LITTLE_TIP],
        }
    }

    pub fn tip(&self) -> usize {
        self.chain()[4]
    }
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Points reported below this visibility are treated as missing.
    pub min_visibility: f32,
    /// Total bend (degrees) along a finger above which it counts as folded.
    pub finger_curl_limit_deg: f32,
    /// Same, for the thumb, which bends less when folded.
    pub thumb_curl_limit_deg: f32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_visibility: 0.5,
            finger_curl_limit_deg: 60.0,
            thumb_curl_limit_deg: 50.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    /// Points in the hand-local frame; `None` where the detector was unsure.
    pub points: Vec<Option<[f32; 3]>>,
    pub extended: [Option<bool>; 5],
    pub curl_deg: [Option<f32>; 5],
    /// Fingertip to palm-center distance, in reference bone lengths.
    pub tip_palm_ratio: [Option<f32>; 5],
    /// Thumb tip to the middle/ring knuckle midpoint, in reference bone lengths.
    pub thumb_tuck_ratio: Option<f32>,
    /// Angle between the palm normal and the camera axis.
    pub palm_tilt_deg: Option<f32>,
}

impl FeatureVector {
    /// Number of derived features: five extension states, five tip ratios,
    /// thumb tuck and palm tilt.
    #[cfg(test)]
    pub const FEATURE_COUNT: usize = 12;

    pub fn unknown() -> Self {
        Self {
            points: vec![None; points::COUNT],
            extended: [None; 5],
            curl_deg: [None; 5],
            tip_palm_ratio: [None; 5],
            thumb_tuck_ratio: None,
            palm_tilt_deg: None,
        }
    }

    pub fn unknown_count(&self) -> usize {
        self.extended.iter().filter(|e| e.is_none()).count()
            + self.tip_palm_ratio.iter().filter(|r| r.is_none()).count()
            + usize::from(self.thumb_tuck_ratio.is_none())
            + usize::from(self.palm_tilt_deg.is_none())
    }

    pub fn is_extended(&self, finger: Finger) -> Option<bool> {
        self.extended[finger.index()]
    }
}

type Vec3 = [f64; 3];

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: Vec3) -> f64 {
    dot(a, a).sqrt()
}

fn angle_deg(a: Vec3, b: Vec3) -> f64 {
    let denom = norm(a) * norm(b);
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (dot(a, b) / denom).clamp(-1.0, 1.0).acos().to_degrees()
}

fn centroid(pts: &[Vec3]) -> Vec3 {
    let n = pts.len() as f64;
    let mut c = [0.0; 3];
    for p in pts {
        c[0] += p[0] / n;
        c[1] += p[1] / n;
        c[2] += p[2] / n;
    }
    c
}

/// Build the feature vector for one hand.
///
/// Fails only on a topology mismatch; low-visibility points degrade the
/// affected features to unknown instead.
pub fn normalize(
    observation: &HandObservation,
    config: &NormalizerConfig,
) -> Result<FeatureVector, AlertError> {
    if observation.landmarks.len() != points::COUNT {
        return Err(AlertError::MalformedObservation {
            expected: points::COUNT,
            got: observation.landmarks.len(),
        });
    }

    let raw: Vec<Option<Vec3>> = observation
        .landmarks
        .iter()
        .map(|lm| {
            let finite = lm.x.is_finite() && lm.y.is_finite() && lm.z.is_finite();
            (finite && lm.visibility >= config.min_visibility)
                .then(|| [lm.x as f64, lm.y as f64, lm.z as f64])
        })
        .collect();

    let (Some(wrist), Some(anchor)) = (raw[points::WRIST], raw[points::MIDDLE_MCP]) else {
        return Ok(FeatureVector::unknown());
    };

    let bone = sub(anchor, wrist);
    let length = norm(bone);
    if length <= 1e-9 {
        return Ok(FeatureVector::unknown());
    }

    // Rotate so the reference bone points along +y.
    let angle = bone[0].atan2(bone[1]);
    let (sin, cos) = angle.sin_cos();
    let local: Vec<Option<Vec3>> = raw
        .iter()
        .map(|p| {
            p.map(|p| {
                let d = sub(p, wrist);
                [
                    (d[0] * cos - d[1] * sin) / length,
                    (d[0] * sin + d[1] * cos) / length,
                    d[2] / length,
                ]
            })
        })
        .collect();

    let palm: Option<Vec<Vec3>> = points::PALM.iter().map(|&i| local[i]).collect();
    let palm_center = palm.as_deref().map(centroid);

    let mut features = FeatureVector::unknown();
    features.points = local
        .iter()
        .map(|p| p.map(|p| [p[0] as f32, p[1] as f32, p[2] as f32]))
        .collect();

    for finger in Finger::ALL {
        let chain: Option<Vec<Vec3>> = finger.chain().iter().map(|&i| local[i]).collect();
        if let Some(chain) = chain {
            let curl: f64 = chain
                .windows(3)
                .map(|w| angle_deg(sub(w[1], w[0]), sub(w[2], w[1])))
                .sum();
            let limit = match finger {
                Finger::Thumb => config.thumb_curl_limit_deg,
                _ => config.finger_curl_limit_deg,
            };
            features.curl_deg[finger.index()] = Some(curl as f32);
            features.extended[finger.index()] = Some(curl < limit as f64);
        }

        if let (Some(tip), Some(center)) = (local[finger.tip()], palm_center) {
            features.tip_palm_ratio[finger.index()] = Some(norm(sub(tip, center)) as f32);
        }
    }

    if let (Some(tip), Some(middle), Some(ring)) = (
        local[points::THUMB_TIP],
        local[points::MIDDLE_MCP],
        local[points::RING_MCP],
    ) {
        let knuckles = centroid(&[middle, ring]);
        features.thumb_tuck_ratio = Some(norm(sub(tip, knuckles)) as f32);
    }

    if let (Some(index), Some(little)) = (local[points::INDEX_MCP], local[points::LITTLE_MCP]) {
        let origin = local[points::WRIST].unwrap_or([0.0; 3]);
        let normal = cross(sub(index, origin), sub(little, origin));
        let n = norm(normal);
        if n > 1e-9 {
            features.palm_tilt_deg = Some((normal[2].abs() / n).clamp(0.0, 1.0).acos().to_degrees() as f32);
        }
    }

    Ok(features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Pose};

    const EPS_RATIO: f32 = 1e-3;
    const EPS_DEG: f32 = 0.5;

    fn features_for(landmarks: Vec<crate::models::Landmark>) -> FeatureVector {
        let obs = fixtures::observation(landmarks, fixtures::base_time());
        normalize(&obs, &NormalizerConfig::default()).unwrap()
    }

    fn assert_close(a: &FeatureVector, b: &FeatureVector) {
        assert_eq!(a.extended, b.extended);
        for i in 0..5 {
            let (x, y) = (a.curl_deg[i].unwrap(), b.curl_deg[i].unwrap());
            assert!((x - y).abs() < EPS_DEG, "curl {i}: {x} vs {y}");
            let (x, y) = (a.tip_palm_ratio[i].unwrap(), b.tip_palm_ratio[i].unwrap());
            assert!((x - y).abs() < EPS_RATIO, "tip ratio {i}: {x} vs {y}");
        }
        assert!((a.thumb_tuck_ratio.unwrap() - b.thumb_tuck_ratio.unwrap()).abs() < EPS_RATIO);
        assert!((a.palm_tilt_deg.unwrap() - b.palm_tilt_deg.unwrap()).abs() < EPS_DEG);
        for (p, q) in a.points.iter().zip(&b.points) {
            let (p, q) = (p.unwrap(), q.unwrap());
            for k in 0..3 {
                assert!((p[k] - q[k]).abs() < EPS_RATIO);
            }
        }
    }

    #[test]
    fn features_are_invariant_to_scale_and_rotation() {
        for pose in [Pose::Fist, Pose::Kidnap, Pose::Distress, Pose::OpenHand] {
            let base = fixtures::pose_points(pose);
            let reference = features_for(base.clone());
            for (scale, angle, dx, dy) in [
                (0.5, 0.0, 0.0, 0.0),
                (1.8, 0.0, -0.1, 0.05),
                (1.0, 37.0, 0.0, 0.0),
                (0.7, -120.0, 0.2, -0.3),
                (2.5, 180.0, -0.4, 0.1),
            ] {
                let moved = fixtures::transform(&base, scale, angle, dx, dy);
                assert_close(&reference, &features_for(moved));
            }
        }
    }

    #[test]
    fn reference_bone_lands_on_unit_y() {
        let features = features_for(fixtures::transform(
            &fixtures::pose_points(Pose::OpenHand),
            1.3,
            65.0,
            0.0,
            0.0,
        ));
        let wrist = features.points[points::WRIST].unwrap();
        let anchor = features.points[points::MIDDLE_MCP].unwrap();
        assert!(wrist.iter().all(|v| v.abs() < 1e-6));
        assert!(anchor[0].abs() < 1e-4);
        assert!((anchor[1] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn extension_pattern_matches_pose() {
        let fist = features_for(fixtures::pose_points(Pose::Fist));
        assert_eq!(fist.extended, [Some(false); 5]);

        let kidnap = features_for(fixtures::pose_points(Pose::Kidnap));
        assert_eq!(
            kidnap.extended,
            [Some(true), Some(true), Some(false), Some(false), Some(false)]
        );

        let open = features_for(fixtures::pose_points(Pose::OpenHand));
        assert_eq!(open.extended, [Some(true); 5]);
        assert!(open.palm_tilt_deg.unwrap() < 1.0);
        assert_eq!(open.unknown_count(), 0);
    }

    #[test]
    fn tucked_thumb_sits_near_the_knuckles() {
        let distress = features_for(fixtures::pose_points(Pose::Distress));
        let open = features_for(fixtures::pose_points(Pose::OpenHand));
        assert!(distress.thumb_tuck_ratio.unwrap() < 0.5);
        assert!(open.thumb_tuck_ratio.unwrap() > 0.9);
    }

    #[test]
    fn wrong_point_count_is_malformed() {
        let mut landmarks = fixtures::pose_points(Pose::Fist);
        landmarks.truncate(17);
        let obs = fixtures::observation(landmarks, fixtures::base_time());
        let err = normalize(&obs, &NormalizerConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            AlertError::MalformedObservation {
                expected: 21,
                got: 17
            }
        ));
    }

    #[test]
    fn low_visibility_points_make_features_unknown() {
        let mut landmarks = fixtures::pose_points(Pose::OpenHand);
        landmarks[points::INDEX_TIP].visibility = 0.1;
        let features = features_for(landmarks);
        assert_eq!(features.is_extended(Finger::Index), None);
        assert_eq!(features.tip_palm_ratio[Finger::Index.index()], None);
        assert_eq!(features.is_extended(Finger::Middle), Some(true));
        assert_eq!(features.unknown_count(), 2);
    }

    #[test]
    fn hidden_wrist_leaves_everything_unknown() {
        let mut landmarks = fixtures::pose_points(Pose::Fist);
        landmarks[points::WRIST].visibility = 0.0;
        let features = features_for(landmarks);
        assert_eq!(features.unknown_count(), FeatureVector::FEATURE_COUNT);
        assert!(features.points.iter().all(Option::is_none));
    }

    #[test]
    fn collapsed_hand_is_unknown_not_an_error() {
        let landmarks = vec![crate::models::Landmark::new(0.4, 0.4, 0.0); points::COUNT];
        let features = features_for(landmarks);
        assert_eq!(features.unknown_count(), FeatureVector::FEATURE_COUNT);
    }
}
