//! Error types shared by the vertexing core and its collaborators.

use crate::track::TrackId;

/// Errors that can occur while configuring or running the vertex finder.
///
/// Only `MissingService` and `InvalidConfig` can escape to the caller, and only
/// at construction time. Everything raised during an event is absorbed inside
/// `find_vertices` and logged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VertexingError {
    #[error("Required service not configured: {0}")]
    MissingService(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Track {0} has no perigee covariance")]
    MissingCovariance(TrackId),

    #[error("Linearization failed: {0}")]
    Linearization(String),

    #[error("Impact point estimation failed: {0}")]
    ImpactPoint(String),
}

impl VertexingError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn linearization(msg: impl Into<String>) -> Self {
        Self::Linearization(msg.into())
    }

    pub fn impact_point(msg: impl Into<String>) -> Self {
        Self::ImpactPoint(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = VertexingError::MissingService("seed finder");
        assert_eq!(err.to_string(), "Required service not configured: seed finder");

        let err = VertexingError::invalid_config("max_vertices must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: max_vertices must be positive"
        );

        let err = VertexingError::MissingCovariance(TrackId(7));
        assert_eq!(err.to_string(), "Track 7 has no perigee covariance");
    }
}
