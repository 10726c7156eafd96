//! Keep textual secrets encrypted in memory and reveal them only inside a scope.
//!
//! A [`SecureString`] is created from a plaintext buffer the caller owns.
//! The plaintext is copied into secret memory, encrypted in place, and the
//! caller's buffer is zeroed right away, even on failure. Afterwards the
//! secret can only be observed through [`SecureString::reveal`] and its
//! variants, which decrypt into a temporary locked buffer, hand the closure
//! a `&str` view of it, and zero the buffer before returning.
//!
//! ```
//! use sealed_str::{zero, SecureString};
//!
//! let mut token = String::from("s3cr3t-t0k3n");
//! let secret = SecureString::from_plaintext(&mut token)?;
//! assert!(token.is_empty());
//!
//! let is_v3 = secret.reveal(|t| t.starts_with("s3cr3t"))?;
//! assert!(is_v3);
//!
//! let mut scratch = String::from("We're going to Candy Mountain.");
//! zero(&mut scratch);
//! assert!(scratch.is_empty());
//! # Ok::<(), sealed_str::Error>(())
//! ```
//!
//! Encryption is performed by a [`SecureMemoryFacility`]. The default
//! [`SoftwareFacility`] uses AES-256-GCM with a per-process key held in
//! locked, read-only memory.

mod alloc;
mod builder;
pub mod erase;
mod error;
pub mod facility;
mod secure;
mod util;

pub use alloc::LockPolicy;
pub use builder::SecureStringBuilder;
pub use erase::{zero, PlaintextBuffer, ZeroOptions};
pub use error::{Error, Result};
pub use facility::{SecureMemoryFacility, SoftwareFacility};
pub use secure::SecureString;
