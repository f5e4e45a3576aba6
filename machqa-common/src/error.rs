//! Common error types for machqa

use thiserror::Error;

/// Common result type for machqa operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the machqa crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse error (wraps serde_json::Error)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image decode/encode error (wraps image::ImageError)
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Configuration loading or validation error; fatal for the affected
    /// target before any browser attempt is made
    #[error("Configuration error: {0}")]
    Config(String),

    /// Frame or audio capture failed; consumes one stage attempt
    #[error("Capture failed: {0}")]
    Capture(String),

    /// A UI action (click/navigate) failed; consumes one stage attempt
    #[error("Action failed: {0}")]
    Action(String),

    /// A reference image is unreadable or the comparison inputs are
    /// degenerate; scored as a non-match, never raised past the stage
    #[error("Comparison error: {0}")]
    Comparison(String),

    /// A stage attempt exceeded its configured timeout
    #[error("Stage '{stage}' timed out after {timeout_ms} ms")]
    Timeout { stage: String, timeout_ms: u64 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
