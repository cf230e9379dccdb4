//! Synthetic hand poses for tests.
//!
//! Poses are laid out in a hand-local frame (wrist at the origin, middle
//! knuckle at (0, 1)) and then mapped into normalized image coordinates the
//! way a detector would report them (y grows downwards).

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::models::{Frame, HandObservation, Landmark};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pose {
    /// All fingers folded over a tucked thumb.
    Fist,
    /// Thumb and index out, the rest folded.
    Kidnap,
    /// Four fingers up, thumb folded across the palm.
    Distress,
    /// Everything extended.
    OpenHand,
}

const FINGER_MCPS: [[f32; 3]; 4] = [
    [-0.30, 0.95, 0.0],
    [0.0, 1.0, 0.0],
    [0.27, 0.95, 0.0],
    [0.50, 0.85, 0.0],
];

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap()
}

pub fn at_ms(ms: i64) -> DateTime<Utc> {
    base_time() + Duration::milliseconds(ms)
}

fn add(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn scaled(a: [f32; 3], s: f32) -> [f32; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn unit(a: [f32; 3]) -> [f32; 3] {
    let len = (a[0] * a[0] + a[1] * a[1] + a[2] * a[2]).sqrt();
    scaled(a, 1.0 / len)
}

fn local_points(pose: Pose) -> Vec<[f32; 3]> {
    let (thumb_out, fingers_out) = match pose {
        Pose::Fist => (false, [false; 4]),
        Pose::Kidnap => (true, [true, false, false, false]),
        Pose::Distress => (false, [true; 4]),
        Pose::OpenHand => (true, [true; 4]),
    };

    let mut points = vec![[0.0, 0.0, 0.0]];

    let cmc = [-0.25, 0.2, 0.0];
    let mcp = [-0.45, 0.4, 0.0];
    points.push(cmc);
    points.push(mcp);
    if thumb_out {
        let dir = unit([mcp[0] - cmc[0], mcp[1] - cmc[1], 0.0]);
        let ip = add(mcp, scaled(dir, 0.3));
        points.push(ip);
        points.push(add(ip, scaled(dir, 0.25)));
    } else {
        points.push([-0.15, 0.55, -0.05]);
        points.push([0.1, 0.6, -0.08]);
    }

    for (mcp, out) in FINGER_MCPS.iter().zip(fingers_out) {
        let dir = unit(*mcp);
        points.push(*mcp);
        if out {
            let pip = add(*mcp, scaled(dir, 0.4));
            let dip = add(pip, scaled(dir, 0.3));
            points.push(pip);
            points.push(dip);
            points.push(add(dip, scaled(dir, 0.25)));
        } else {
            let pip = add(*mcp, [0.0, 0.0, -0.35]);
            let dip = add(pip, scaled(dir, -0.25));
            points.push(pip);
            points.push(dip);
            points.push(add(dip, [0.0, 0.0, 0.2]));
        }
    }

    points
}

/// Pose in image coordinates: a hand roughly a fifth of the frame tall.
pub fn pose_points(pose: Pose) -> Vec<Landmark> {
    local_points(pose)
        .into_iter()
        .map(|p| Landmark::new(0.5 + 0.2 * p[0], 0.7 - 0.2 * p[1], 0.2 * p[2]))
        .collect()
}

/// Uniformly scale and rotate (in the image plane) around the wrist, then translate.
pub fn transform(points: &[Landmark], scale: f32, angle_deg: f32, dx: f32, dy: f32) -> Vec<Landmark> {
    let origin = points[0];
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    points
        .iter()
        .map(|p| {
            let x = (p.x - origin.x) * scale;
            let y = (p.y - origin.y) * scale;
            Landmark {
                x: origin.x + x * cos - y * sin + dx,
                y: origin.y + x * sin + y * cos + dy,
                z: p.z * scale,
                visibility: p.visibility,
            }
        })
        .collect()
}

pub fn observation(landmarks: Vec<Landmark>, timestamp: DateTime<Utc>) -> HandObservation {
    HandObservation {
        handedness: Some("Right".to_string()),
        score: 0.95,
        landmarks,
        timestamp,
    }
}

pub fn frame(pose: Option<Pose>, ms: i64) -> Frame {
    let timestamp = at_ms(ms);
    Frame {
        timestamp,
        hands: pose
            .map(|p| vec![observation(pose_points(p), timestamp)])
            .unwrap_or_default(),
        image_path: None,
    }
}
