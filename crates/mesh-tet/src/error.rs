//! Error types for the tetrahedralization pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tetrahedralization operations.
pub type TetResult<T> = Result<T, TetError>;

/// Errors that can occur while turning a triangle soup into a tet mesh.
///
/// Local operation rejections are not errors: a rejected split/collapse/swap
/// is silently discarded and the pass continues. Only pipeline-level failures
/// surface here. Hitting the pass budget is also not an error; the output
/// carries a `pass_limit_exceeded` flag together with the best mesh found.
#[derive(Debug, Error)]
pub enum TetError {
    /// Input coordinates or indices are unusable (NaN/Inf, empty face list,
    /// out-of-range indices, or a bounding box with no extent).
    #[error("invalid input: {details}")]
    InvalidInput { details: String },

    /// Preprocessing removed every triangle of the input surface.
    #[error("input surface vanished during preprocessing")]
    EmptyInput,

    /// The refined mesh cannot keep its tracked surface inside the envelope
    /// at the smallest allowed tolerance. The caller may retry with a larger
    /// `eps_rel` or a higher `stage`.
    #[error("surface cannot be kept inside the envelope at eps = {eps}")]
    EnvelopeInfeasible { eps: f64 },

    /// Error writing a mesh file.
    #[error("failed to write mesh to {path}: {source}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
