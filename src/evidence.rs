//! Best-effort evidence collaborators: where the alert came from and what the camera saw.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::AlertError;
use crate::models::{Frame, Incident, Location};

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_location(&self) -> Result<Location, AlertError>;
}

/// A configured, known location of the camera.
pub struct FixedLocation {
    location: Location,
}

impl FixedLocation {
    pub fn new(location: Location) -> Self {
        Self { location }
    }
}

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_location(&self) -> Result<Location, AlertError> {
        Ok(self.location.clone())
    }
}

pub struct NoLocation;

#[async_trait]
impl LocationProvider for NoLocation {
    async fn current_location(&self) -> Result<Location, AlertError> {
        Err(AlertError::EvidenceUnavailable(
            "no location configured".to_string(),
        ))
    }
}

#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Persist evidence of the confirming frame and return a reference to it.
    async fn capture(&self, incident: &Incident, frame: &Frame) -> Result<String, AlertError>;
}

/// Writes snapshots into a directory, one file per incident.
///
/// If the capture side saved the frame image, that file is copied; otherwise
/// the detected landmarks are written out as JSON.
pub struct DirectorySnapshotSink {
    dir: PathBuf,
}

impl DirectorySnapshotSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

fn unavailable(err: impl std::fmt::Display) -> AlertError {
    AlertError::EvidenceUnavailable(err.to_string())
}

#[async_trait]
impl SnapshotSink for DirectorySnapshotSink {
    async fn capture(&self, incident: &Incident, frame: &Frame) -> Result<String, AlertError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(unavailable)?;

        let stem = format!(
            "snapshot_{}_{}",
            incident.confirmed_at.format("%Y-%m-%d_%H-%M-%S"),
            incident.id.simple()
        );

        let target = match &frame.image_path {
            Some(source) => {
                let ext = source
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("jpg");
                let target = self.dir.join(format!("{stem}.{ext}"));
                tokio::fs::copy(source, &target).await.map_err(unavailable)?;
                target
            }
            None => {
                let target = self.dir.join(format!("{stem}.json"));
                let body = serde_json::to_vec_pretty(frame).map_err(unavailable)?;
                tokio::fs::write(&target, body).await.map_err(unavailable)?;
                target
            }
        };

        debug!(incident = %incident.id, path = %target.display(), "snapshot stored");
        Ok(target.display().to_string())
    }
}
