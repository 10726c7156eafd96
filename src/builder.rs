use core::{fmt, mem};

use crate::{
    erase::{PlaintextBuffer, ZeroOptions},
    error::Result,
    facility::SecureMemoryFacility,
    secure::SecureString,
};

/// Collects a secret piece by piece before sealing it into a [`SecureString`].
///
/// Useful for input that arrives one character at a time, such as a
/// password typed on a terminal. Growing the internal buffer never leaves
/// a stale copy behind: the old allocation is zeroed before it is freed.
/// Dropping an unfinished builder zeroes what was collected.
#[derive(Default)]
pub struct SecureStringBuilder {
    buffer: String,
}

impl SecureStringBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder that can hold `capacity` bytes without reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: String::with_capacity(capacity),
        }
    }

    /// Appends a single character.
    pub fn push(&mut self, ch: char) -> &mut Self {
        self.reserve(ch.len_utf8());
        self.buffer.push(ch);
        self
    }

    /// Appends `s`. Erasing the caller's own copy of `s` remains the caller's job.
    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.reserve(s.len());
        self.buffer.push_str(s);
        self
    }

    /// Number of bytes collected so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Seals the collected characters with the process-wide facility.
    pub fn build(mut self) -> Result<SecureString> {
        SecureString::from_plaintext(&mut self.buffer)
    }

    /// Seals the collected characters with `facility`.
    pub fn build_in<F: SecureMemoryFacility>(mut self, facility: F) -> Result<SecureString<F>> {
        SecureString::from_plaintext_in(Some(&mut self.buffer), facility, ZeroOptions::default())
    }

    fn reserve(&mut self, additional: usize) {
        if self.buffer.capacity() - self.buffer.len() >= additional {
            return;
        }

        let capacity = (self.buffer.capacity() * 2).max(self.buffer.len() + additional);
        let mut grown = String::with_capacity(capacity);
        grown.push_str(&self.buffer);

        mem::replace(&mut self.buffer, grown).zero();
    }
}

impl Drop for SecureStringBuilder {
    fn drop(&mut self) {
        self.buffer.zero();
    }
}

impl fmt::Debug for SecureStringBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureStringBuilder")
            .field("buffer", &"[REDACTED]")
            .finish()
    }
}
