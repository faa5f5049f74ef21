use thiserror::Error;

/// Error codes surfaced by the capture core.
///
/// The set is deliberately flat: every component speaks the same taxonomy so
/// that a failure can cross the reader/cursor/symbolicator boundaries without
/// translation. Success is `Ok(())`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The requested data (section, symbol, method, image) does not exist.
    #[error("requested resource was not found")]
    NotFound,
    /// The data exists but is malformed or inconsistent.
    #[error("data is corrupt or otherwise invalid")]
    Invalid,
    /// Task memory could not be read at the requested address.
    #[error("memory access was denied")]
    AccessDenied,
    /// An internal limit was exhausted (expression stack, state stack).
    #[error("internal resource exhausted")]
    Internal,
    /// The operation is not applicable; a frame reader returning this defers
    /// to the next reader in the cursor's list.
    #[error("unknown or unhandled input")]
    Unknown,
}

pub type Result<T> = std::result::Result<T, Error>;
