use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlertError {
    /// The detector reported a hand whose point count does not match the hand topology.
    #[error("malformed observation: expected {expected} landmarks, got {got}")]
    MalformedObservation { expected: usize, got: usize },

    #[error("evidence unavailable: {0}")]
    EvidenceUnavailable(String),
}
