//! Thunk pool errors

/// Errors surfaced by block acquisition and heap growth
///
/// Contract violations (freeing a foreign thunk, double free) are not
/// represented here: they are caller bugs and panic in debug builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThunkError {
    /// The mapping provider could not satisfy a batch request
    OutOfMemory,
    /// Executable thunks are unavailable on this platform/configuration
    Unsupported(String),
    /// Layout constants are inconsistent (zero sizes, overflow, misalignment)
    InvalidLayout(String),
}

impl core::fmt::Display for ThunkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "Out of memory while mapping thunk blocks"),
            Self::Unsupported(reason) => write!(f, "Thunks are not supported: {}", reason),
            Self::InvalidLayout(reason) => write!(f, "Invalid thunk layout: {}", reason),
        }
    }
}

impl std::error::Error for ThunkError {}
