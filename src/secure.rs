use core::{fmt, str};
use std::io;

use tracing::{debug, error};
use zeroize::Zeroize;

use crate::{
    erase::{PlaintextBuffer, ZeroOptions},
    error::{Error, Result},
    facility::{SecureMemoryFacility, SoftwareFacility},
};

/// A string kept encrypted in memory by a [`SecureMemoryFacility`].
///
/// The plaintext can only be observed inside the closure passed to
/// [`reveal`](Self::reveal) and its variants. The decrypted copy handed to
/// the closure is zeroed and returned to the facility as soon as the closure
/// returns, fails or panics.
///
/// Anything the closure itself copies out of the `&str` (formatting,
/// concatenation, pushing it into a collection, ...) escapes this
/// guarantee and is the caller's responsibility.
///
/// The content is fixed at construction. A value becomes unusable once
/// [`release`](Self::release)d or dropped.
pub struct SecureString<F: SecureMemoryFacility = SoftwareFacility> {
    facility: F,
    sealed: Option<F::Sealed>,
    len: usize,
}

impl SecureString {
    /// Encrypts `value` with the process-wide [`SoftwareFacility`] and then
    /// zeroes `value`, including its length.
    ///
    /// `value` is zeroed even when this function fails.
    ///
    /// # Example
    /// ```
    /// use sealed_str::SecureString;
    ///
    /// let mut password = String::from("Llama");
    /// let secret = SecureString::from_plaintext(&mut password)?;
    /// assert!(password.is_empty());
    ///
    /// let matches = secret.reveal(|plaintext| plaintext == "Llama")?;
    /// assert!(matches);
    /// # Ok::<(), sealed_str::Error>(())
    /// ```
    pub fn from_plaintext<B: PlaintextBuffer + ?Sized>(value: &mut B) -> Result<Self> {
        let source = EraseOnExit::new(value, ZeroOptions::default());
        let facility = SoftwareFacility::shared()?;

        let result = Self::seal(source.plaintext(), facility);
        drop(source);
        result
    }

    /// Same as [`from_plaintext`](Self::from_plaintext), for callers holding
    /// an optional buffer.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `value` is `None`.
    pub fn from_optional<B: PlaintextBuffer + ?Sized>(value: Option<&mut B>) -> Result<Self> {
        match value {
            Some(value) => Self::from_plaintext(value),
            None => Err(Error::InvalidArgument("plaintext is absent")),
        }
    }
}

impl<F: SecureMemoryFacility> SecureString<F> {
    /// Encrypts `value` with `facility`, then zeroes `value` according to `options`.
    ///
    /// `value` is zeroed whether sealing succeeds, fails, or panics.
    ///
    /// # Errors
    /// * [`Error::InvalidArgument`] if `value` is `None` (nothing is allocated)
    ///   or does not hold valid UTF-8.
    /// * [`Error::Facility`] if the facility cannot allocate or encrypt.
    pub fn from_plaintext_in<B: PlaintextBuffer + ?Sized>(
        value: Option<&mut B>,
        facility: F,
        options: ZeroOptions,
    ) -> Result<Self> {
        let value = value.ok_or(Error::InvalidArgument("plaintext is absent"))?;
        let source = EraseOnExit::new(value, options);

        let result = Self::seal(source.plaintext(), facility);
        drop(source);
        result
    }

    fn seal(plaintext: &[u8], facility: F) -> Result<Self> {
        if str::from_utf8(plaintext).is_err() {
            return Err(Error::InvalidArgument("plaintext is not valid UTF-8"));
        }

        let sealed = facility.seal(plaintext)?;
        debug!("Plaintext sealed into secure memory");

        Ok(Self {
            facility,
            sealed: Some(sealed),
            len: plaintext.len(),
        })
    }

    /// Length of the secret in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the secret is the empty string.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` once the encrypted block has been released.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.sealed.is_none()
    }

    /// Decrypts the secret into an ordinary `String`.
    ///
    /// **This leaks the secret.** The returned `String` is a plain heap
    /// allocation that is never erased by this crate. Prefer
    /// [`reveal`](Self::reveal) whenever the plaintext does not need to
    /// outlive a single operation. The temporary buffer the copy is made
    /// from is still zeroed.
    ///
    /// # Errors
    /// * [`Error::Unavailable`] after [`release`](Self::release).
    /// * [`Error::Facility`] if decryption fails.
    pub fn reveal_to_string(&self) -> Result<String> {
        let guard = self.unseal()?;
        let copy = guard.plaintext()?.to_owned();
        Ok(copy)
    }

    /// Runs `f` against the decrypted secret and returns its result.
    ///
    /// The temporary plaintext is zeroed and released before this returns,
    /// also when `f` panics. The value returned by `f` is passed through as is.
    ///
    /// # Errors
    /// * [`Error::Unavailable`] after [`release`](Self::release).
    /// * [`Error::Facility`] if decryption fails.
    pub fn reveal<T>(&self, f: impl FnOnce(&str) -> T) -> Result<T> {
        let guard = self.unseal()?;
        let plaintext = guard.plaintext()?;
        Ok(f(plaintext))
    }

    /// Like [`reveal`](Self::reveal), also handing `args` to `f`.
    pub fn reveal_with<A, T>(&self, args: A, f: impl FnOnce(&str, A) -> T) -> Result<T> {
        self.reveal(|plaintext| f(plaintext, args))
    }

    /// Like [`reveal`](Self::reveal) for a fallible `f`.
    ///
    /// An error returned by `f` is propagated unchanged, after the temporary
    /// plaintext has been zeroed and released.
    pub fn try_reveal<T, E: From<Error>>(
        &self,
        f: impl FnOnce(&str) -> Result<T, E>,
    ) -> Result<T, E> {
        let guard = self.unseal()?;
        let plaintext = guard.plaintext()?;
        f(plaintext)
    }

    /// Frees the encrypted block. Every later reveal fails with [`Error::Unavailable`].
    ///
    /// Releasing an already released value does nothing. If the facility
    /// reports an error the value is released anyway and the error is
    /// returned once.
    pub fn release(&mut self) -> Result<()> {
        let Some(sealed) = self.sealed.take() else {
            return Ok(());
        };

        self.facility.free(sealed)?;
        debug!("Secure value released");
        Ok(())
    }

    fn unseal(&self) -> Result<RevealGuard<'_, F>> {
        let sealed = self.sealed.as_ref().ok_or(Error::Unavailable)?;
        let revealed = self.facility.unseal(sealed)?;

        Ok(RevealGuard {
            facility: &self.facility,
            revealed: Some(revealed),
        })
    }
}

impl<F: SecureMemoryFacility> Drop for SecureString<F> {
    fn drop(&mut self) {
        if let Some(sealed) = self.sealed.take() {
            if let Err(err) = self.facility.free(sealed) {
                error!(error = %err, "Failed to release secure value");
            }
        }
    }
}

impl<F: SecureMemoryFacility> fmt::Debug for SecureString<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureString")
            .field("value", &"[REDACTED]")
            .field("released", &self.is_released())
            .finish()
    }
}

impl TryFrom<&mut String> for SecureString {
    type Error = Error;

    fn try_from(value: &mut String) -> Result<Self> {
        Self::from_plaintext(value)
    }
}

/// Zeroes the borrowed source buffer when dropped, on every exit path.
struct EraseOnExit<'a, B: PlaintextBuffer + ?Sized> {
    buffer: &'a mut B,
    options: ZeroOptions,
}

impl<'a, B: PlaintextBuffer + ?Sized> EraseOnExit<'a, B> {
    fn new(buffer: &'a mut B, options: ZeroOptions) -> Self {
        Self { buffer, options }
    }

    fn plaintext(&self) -> &[u8] {
        self.buffer.plaintext()
    }
}

impl<B: PlaintextBuffer + ?Sized> Drop for EraseOnExit<'_, B> {
    fn drop(&mut self) {
        self.buffer.zero_with(self.options);
    }
}

/// Owns a temporary plaintext for the duration of one reveal.
///
/// Dropping it zeroes the plaintext and hands it back to the facility.
struct RevealGuard<'a, F: SecureMemoryFacility> {
    facility: &'a F,
    revealed: Option<F::Revealed>,
}

impl<F: SecureMemoryFacility> RevealGuard<'_, F> {
    fn plaintext(&self) -> Result<&str> {
        let bytes: &[u8] = match &self.revealed {
            Some(revealed) => revealed.as_ref(),
            None => &[],
        };

        str::from_utf8(bytes).map_err(|_| {
            Error::Facility(io::Error::new(
                io::ErrorKind::InvalidData,
                "revealed plaintext is not valid UTF-8",
            ))
        })
    }
}

impl<F: SecureMemoryFacility> Drop for RevealGuard<'_, F> {
    fn drop(&mut self) {
        let Some(mut revealed) = self.revealed.take() else {
            return;
        };

        revealed.as_mut().zeroize();

        // The plaintext is already erased, a failure here only leaks the pages.
        if let Err(err) = self.facility.discard(revealed) {
            error!(error = %err, "Failed to discard revealed plaintext");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::LockPolicy;

    /// Facility that "encrypts" by XOR and records what it is handed back.
    #[derive(Clone, Default)]
    struct RecordingFacility {
        log: Arc<Mutex<Log>>,
        fail_seal: bool,
        corrupt_reveal: bool,
    }

    #[derive(Default)]
    struct Log {
        sealed: usize,
        freed: usize,
        discarded: Vec<Vec<u8>>,
    }

    impl RecordingFacility {
        fn sealed(&self) -> usize {
            self.log.lock().unwrap().sealed
        }

        fn freed(&self) -> usize {
            self.log.lock().unwrap().freed
        }

        fn discarded(&self) -> Vec<Vec<u8>> {
            self.log.lock().unwrap().discarded.clone()
        }
    }

    impl SecureMemoryFacility for RecordingFacility {
        type Sealed = Vec<u8>;
        type Revealed = Vec<u8>;

        fn seal(&self, plaintext: &[u8]) -> io::Result<Vec<u8>> {
            if self.fail_seal {
                return Err(io::Error::new(io::ErrorKind::OutOfMemory, "allocation failed"));
            }

            self.log.lock().unwrap().sealed += 1;
            Ok(plaintext.iter().map(|b| b ^ 0x5A).collect())
        }

        fn unseal(&self, sealed: &Vec<u8>) -> io::Result<Vec<u8>> {
            if self.corrupt_reveal {
                return Ok(vec![0xFF; sealed.len()]);
            }

            Ok(sealed.iter().map(|b| b ^ 0x5A).collect())
        }

        fn discard(&self, revealed: Vec<u8>) -> io::Result<()> {
            self.log.lock().unwrap().discarded.push(revealed);
            Ok(())
        }

        fn free(&self, _sealed: Vec<u8>) -> io::Result<()> {
            self.log.lock().unwrap().freed += 1;
            Ok(())
        }
    }

    fn recorded(secret: &str) -> (SecureString<RecordingFacility>, RecordingFacility) {
        let facility = RecordingFacility::default();
        let mut plaintext = secret.to_owned();
        let value = SecureString::from_plaintext_in(
            Some(&mut plaintext),
            facility.clone(),
            ZeroOptions::default(),
        )
        .expect("Failed to seal");

        (value, facility)
    }

    fn assert_all_discarded_zeroed(facility: &RecordingFacility, expected: usize) {
        let discarded = facility.discarded();
        assert_eq!(discarded.len(), expected);
        assert!(discarded.iter().flatten().all(|b| *b == 0));
    }

    #[test]
    fn test_from_plaintext_zeroes_source() {
        let mut plaintext = String::from("Llama");
        assert!(!plaintext.is_empty());

        let secret = SecureString::from_plaintext(&mut plaintext).expect("Failed to seal");

        assert!(plaintext.is_empty());
        let bytes = plaintext.into_bytes();
        let spare = unsafe { core::slice::from_raw_parts(bytes.as_ptr(), bytes.capacity()) };
        assert!(spare.iter().all(|b| *b == 0));
        assert_eq!(secret.len(), 5);
    }

    #[test]
    fn test_reveal_returns_sentinel() {
        const EXPECTED: i32 = 0xBADBEF;

        let mut plaintext = String::from("Llama");
        let secret = SecureString::from_plaintext(&mut plaintext).expect("Failed to seal");

        let result = secret
            .reveal(|s| if s == "Llama" { EXPECTED } else { 0x0 })
            .expect("Failed to reveal");

        assert_eq!(result, EXPECTED);
    }

    #[test]
    fn test_reveal_without_return_value() {
        let mut cache: Vec<String> = Vec::new();
        let mut plaintext = String::from("Secret");
        let secret = SecureString::from_plaintext(&mut plaintext).expect("Failed to seal");

        secret
            .reveal(|s| {
                // Deliberately leaks, as a closure is allowed to.
                cache.push(s.to_owned());
                cache.push(format!("Top{s}"));
            })
            .expect("Failed to reveal");

        assert!(cache.contains(&"Secret".to_owned()));
        assert!(cache.contains(&"TopSecret".to_owned()));
    }

    #[test]
    fn test_reveal_to_string() {
        let mut builder = crate::SecureStringBuilder::new();
        for ch in ['L', 'l', 'a', 'm', 'a'] {
            builder.push(ch);
        }
        let secret = builder.build().expect("Failed to seal");

        assert_eq!(secret.reveal_to_string().expect("Failed to reveal"), "Llama");
    }

    #[test]
    fn test_roundtrip_lengths() {
        for len in [0, 1, 10_000] {
            let expected: String = "abcdefghij".chars().cycle().take(len).collect();
            let mut plaintext = expected.clone();

            let secret = SecureString::from_plaintext(&mut plaintext).expect("Failed to seal");
            assert!(plaintext.is_empty());
            assert_eq!(secret.len(), len);
            assert_eq!(secret.is_empty(), len == 0);

            let equal = secret.reveal(|s| s == expected).expect("Failed to reveal");
            assert!(equal, "round trip failed for length {len}");
        }
    }

    #[test]
    fn test_roundtrip_multibyte() {
        let mut plaintext = String::from("pässwörd-🔑");
        let secret = SecureString::try_from(&mut plaintext).expect("Failed to seal");

        let chars = secret.reveal(|s| s.chars().count()).expect("Failed to reveal");
        assert_eq!(chars, 10);
    }

    #[test]
    fn test_reveal_with_args() {
        let (secret, _) = recorded("hunter2");

        let matched = secret
            .reveal_with("hunter", |s, prefix| s.starts_with(prefix))
            .expect("Failed to reveal");

        assert!(matched);
    }

    #[test]
    fn test_reveal_zeroes_temporary_on_success() {
        let (secret, facility) = recorded("Llama");

        let len = secret.reveal(|s| s.len()).expect("Failed to reveal");

        assert_eq!(len, 5);
        assert_all_discarded_zeroed(&facility, 1);
        assert_eq!(facility.discarded()[0].len(), 5);
    }

    #[test]
    fn test_try_reveal_propagates_closure_error() {
        #[derive(Debug, PartialEq)]
        enum CheckError {
            Mismatch,
            Secure,
        }

        impl From<Error> for CheckError {
            fn from(_: Error) -> Self {
                CheckError::Secure
            }
        }

        let (secret, facility) = recorded("Llama");

        let result: Result<(), CheckError> = secret.try_reveal(|s| match s {
            "Alpaca" => Ok(()),
            _ => Err(CheckError::Mismatch),
        });

        assert_eq!(result, Err(CheckError::Mismatch));
        assert_all_discarded_zeroed(&facility, 1);
    }

    #[test]
    fn test_reveal_zeroes_temporary_on_panic() {
        let (secret, facility) = recorded("Llama");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            secret.reveal(|_| panic!("closure failed")).ok();
        }));

        assert!(outcome.is_err());
        assert_all_discarded_zeroed(&facility, 1);
    }

    #[test]
    fn test_reveal_rejects_invalid_utf8_and_zeroes() {
        let facility = RecordingFacility {
            corrupt_reveal: true,
            ..Default::default()
        };
        let mut plaintext = String::from("Llama");
        let secret = SecureString::from_plaintext_in(
            Some(&mut plaintext),
            facility.clone(),
            ZeroOptions::default(),
        )
        .expect("Failed to seal");

        let result = secret.reveal(|_| ());

        assert!(matches!(result, Err(Error::Facility(_))));
        assert_all_discarded_zeroed(&facility, 1);
    }

    #[test]
    fn test_from_optional_none() {
        let result = SecureString::from_optional::<String>(None);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let facility = RecordingFacility::default();
        let result = SecureString::from_plaintext_in::<String>(
            None,
            facility.clone(),
            ZeroOptions::default(),
        );

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(facility.sealed(), 0);
    }

    #[test]
    fn test_seal_failure_still_zeroes_source() {
        let facility = RecordingFacility {
            fail_seal: true,
            ..Default::default()
        };
        let mut plaintext = String::from("We're going to Candy Mountain.");

        let result =
            SecureString::from_plaintext_in(Some(&mut plaintext), facility, ZeroOptions::default());

        assert!(matches!(result, Err(Error::Facility(_))));
        assert!(plaintext.is_empty());
    }

    #[test]
    fn test_invalid_utf8_source_is_rejected_and_zeroed() {
        let mut bytes = vec![b'o', b'k', 0xC3];

        let result = SecureString::from_plaintext(&mut bytes);

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_keep_length_option() {
        let mut plaintext = String::from("Llama");
        let facility = RecordingFacility::default();

        let _secret = SecureString::from_plaintext_in(
            Some(&mut plaintext),
            facility,
            ZeroOptions {
                erase_length: false,
            },
        )
        .expect("Failed to seal");

        assert_eq!(plaintext.len(), 5);
        assert!(plaintext.bytes().all(|b| b == 0));
    }

    #[test]
    fn test_release_makes_value_unavailable() {
        let (mut secret, facility) = recorded("Llama");

        secret.release().expect("Failed to release");
        assert!(secret.is_released());

        assert!(matches!(secret.reveal(|_| ()), Err(Error::Unavailable)));
        assert!(matches!(secret.reveal_to_string(), Err(Error::Unavailable)));
        assert!(matches!(
            secret.reveal_with((), |_, _| ()),
            Err(Error::Unavailable)
        ));
        assert!(matches!(
            secret.try_reveal(|_| Ok::<_, Error>(())),
            Err(Error::Unavailable)
        ));

        // Idempotent, and dropping does not free a second time.
        secret.release().expect("Second release must be a no-op");
        drop(secret);
        assert_eq!(facility.freed(), 1);
    }

    #[test]
    fn test_drop_releases_block() {
        let (secret, facility) = recorded("Llama");

        drop(secret);

        assert_eq!(facility.freed(), 1);
    }

    #[test]
    fn test_software_release_then_reveal() {
        let facility =
            SoftwareFacility::new(LockPolicy::BestEffort).expect("Failed to create facility");
        let mut plaintext = String::from("token");
        let mut secret =
            SecureString::from_plaintext_in(Some(&mut plaintext), facility, ZeroOptions::default())
                .expect("Failed to seal");

        secret.release().expect("Failed to release");

        assert!(matches!(secret.reveal_to_string(), Err(Error::Unavailable)));
    }

    #[test]
    fn test_debug_is_redacted() {
        let (secret, _) = recorded("Llama");

        let debug = format!("{secret:?}");

        assert!(!debug.contains("Llama"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_secure_string_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SecureString>();
    }
}
