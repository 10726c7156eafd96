use std::io;

use thiserror::Error;

/// Errors returned by secure string operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A required input was absent or malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The secure value has been released.
    #[error("Secure value is no longer available")]
    Unavailable,

    /// The secure-memory facility could not allocate, encrypt or decrypt.
    #[error("Secure memory facility failure: {0}")]
    Facility(#[from] io::Error),
}

/// Convenience alias, `E` may be overridden by closures returning their own error.
pub type Result<T, E = Error> = core::result::Result<T, E>;
