//! Library error type.

use thiserror::Error;

/// Errors raised by tracker construction and configuration.
///
/// Per-feature failures (out of bounds, ambiguous association, geometric
/// outliers) are never errors: they are encoded in the per-feature status.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// A tracking-mode code outside the supported set.
    #[error("unsupported tracking mode code {0}")]
    UnsupportedMode(i32),

    /// The normalization lookup table does not cover the full image.
    #[error("normalize table is {got_width}x{got_height}, image is {width}x{height}")]
    NormalizeTableSize {
        width: usize,
        height: usize,
        got_width: usize,
        got_height: usize,
    },

    /// Reference and current inputs disagree on the number of entries.
    #[error("{what}: expected {expected} entries, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// An input image has no pixels.
    #[error("{which} image is empty")]
    EmptyImage { which: &'static str },

    /// An input image does not match the camera resolution.
    #[error("{which} image is {got_width}x{got_height}, camera is {width}x{height}")]
    ImageSize {
        which: &'static str,
        width: usize,
        height: usize,
        got_width: usize,
        got_height: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
