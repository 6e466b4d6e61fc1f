//! Errors raised by the simulation harness.

use secvtx_core::VertexingError;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Vertexing(#[from] VertexingError),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),
}
