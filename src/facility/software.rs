//! Software stand-in for a native encrypted-memory primitive.
//!
//! Secrets are encrypted in place with AES-256-GCM inside secret memory
//! pages. The random key is generated straight into locked memory and
//! expanded once into a cipher that also lives in locked, read-only pages.
//! The raw key is then freed.
//!
//! AES and GHASH routines spill round keys and counter blocks to the stack
//! while they run. The stack area below the calling frame is overwritten
//! after every key expansion, encryption and decryption, which removes
//! those copies in practice. Copies left in CPU registers, or deeper than
//! the overwritten area, cannot be ruled out from safe code.

use core::{fmt, mem, ptr};
use std::{
    io,
    sync::{Arc, OnceLock},
};

use aes_gcm::{
    aead::{self, rand_core::RngCore, AeadCore, AeadInPlace, KeyInit, Nonce, OsRng, Tag},
    Aes256Gcm, Key,
};
use tracing::debug;
use zeroize::Zeroize;

use super::SecureMemoryFacility;
use crate::alloc::{
    LockPolicy, PlatformSecretMemory, PlatformSecretMemoryMut, SecretMemory, SecretMemoryMut,
};

/// Size of AES-256 key in bytes
const KEY_SIZE: usize = 32;

/// Bytes of stack overwritten after each cipher operation.
const SCRUB_STACK_LEN: usize = 32 * 1024;

/// AES-256-GCM over locked secret memory.
///
/// Cloning is cheap and every clone shares the same key.
#[derive(Clone)]
pub struct SoftwareFacility {
    inner: Arc<Inner>,
}

struct Inner {
    cipher: LockedCipher,
    policy: LockPolicy,
}

/// An expanded `Aes256Gcm` stored inside read-only secret memory.
///
/// The cipher is never dropped in place, freeing the pages zeroes it.
struct LockedCipher {
    memory: PlatformSecretMemory,
}

/// An encrypted block owned by a [`SoftwareFacility`].
pub struct SoftwareSealed {
    ciphertext: PlatformSecretMemory,
    nonce: Nonce<Aes256Gcm>,
    tag: Tag<Aes256Gcm>,
}

/// Plaintext decrypted by a [`SoftwareFacility`], held in secret memory.
pub struct SoftwareRevealed {
    plaintext: PlatformSecretMemoryMut,
}

impl SoftwareFacility {
    /// Creates a facility with a fresh random key.
    ///
    /// `policy` applies to the key and to every block the facility allocates.
    pub fn new(policy: LockPolicy) -> io::Result<Self> {
        let mut key = PlatformSecretMemoryMut::allocate(KEY_SIZE, policy)?;
        OsRng
            .try_fill_bytes(key.as_bytes_mut())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let facility = Self::from_key(key.as_bytes(), policy)?;
        key.free()?;

        debug!(?policy, "Software secure-memory facility initialized");
        Ok(facility)
    }

    /// Returns the process-wide facility, creating it on first use with the
    /// default [`LockPolicy`].
    pub fn shared() -> io::Result<Self> {
        static SHARED: OnceLock<SoftwareFacility> = OnceLock::new();

        if let Some(facility) = SHARED.get() {
            return Ok(facility.clone());
        }

        // A racing initializer may win, its facility is kept and ours dropped.
        let facility = Self::new(LockPolicy::default())?;
        Ok(SHARED.get_or_init(|| facility).clone())
    }

    fn from_key(key: &[u8], policy: LockPolicy) -> io::Result<Self> {
        let cipher = LockedCipher::new(key, policy)?;
        Ok(Self {
            inner: Arc::new(Inner { cipher, policy }),
        })
    }
}

impl LockedCipher {
    fn new(key: &[u8], policy: LockPolicy) -> io::Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "AES-256 key must be 32 bytes",
            ));
        }

        // Mappings are page aligned, which satisfies the cipher's alignment.
        let mut memory = PlatformSecretMemoryMut::allocate(mem::size_of::<Aes256Gcm>(), policy)?;
        let slot = memory.as_bytes_mut().as_mut_ptr().cast::<Aes256Gcm>();
        unsafe { Self::expand_into(slot, Key::<Aes256Gcm>::from_slice(key)) };
        scrub_stack();

        // On error `memory` is dropped, zeroing the expanded key.
        Ok(Self {
            memory: memory.into_read_only()?,
        })
    }

    /// Writes the expanded cipher to `slot`.
    ///
    /// # Safety
    /// `slot` must be valid for writes and aligned for `Aes256Gcm`.
    #[inline(never)]
    unsafe fn expand_into(slot: *mut Aes256Gcm, key: &Key<Aes256Gcm>) {
        ptr::write(slot, Aes256Gcm::new(key));
    }

    fn get(&self) -> &Aes256Gcm {
        // SAFETY: `new` initialized the pages with an `Aes256Gcm`, and they
        // stay mapped and unchanged for as long as `self` lives.
        unsafe { &*self.memory.as_bytes().as_ptr().cast::<Aes256Gcm>() }
    }

    fn encrypt(&self, nonce: &Nonce<Aes256Gcm>, buffer: &mut [u8]) -> io::Result<Tag<Aes256Gcm>> {
        let tag = self.encrypt_unscrubbed(nonce, buffer);
        scrub_stack();
        tag.map_err(|_| io::Error::new(io::ErrorKind::Other, "encryption failed"))
    }

    fn decrypt(
        &self,
        nonce: &Nonce<Aes256Gcm>,
        buffer: &mut [u8],
        tag: &Tag<Aes256Gcm>,
    ) -> io::Result<()> {
        let result = self.decrypt_unscrubbed(nonce, buffer, tag);
        scrub_stack();
        result.map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "decryption failed (invalid key or corrupted data)",
            )
        })
    }

    #[inline(never)]
    fn encrypt_unscrubbed(
        &self,
        nonce: &Nonce<Aes256Gcm>,
        buffer: &mut [u8],
    ) -> aead::Result<Tag<Aes256Gcm>> {
        self.get().encrypt_in_place_detached(nonce, &[], buffer)
    }

    #[inline(never)]
    fn decrypt_unscrubbed(
        &self,
        nonce: &Nonce<Aes256Gcm>,
        buffer: &mut [u8],
        tag: &Tag<Aes256Gcm>,
    ) -> aead::Result<()> {
        self.get().decrypt_in_place_detached(nonce, &[], buffer, tag)
    }
}

/// Overwrites the stack area just below the caller's frame.
#[inline(never)]
fn scrub_stack() {
    let mut area = [0u8; SCRUB_STACK_LEN];
    area.zeroize();
    core::hint::black_box(&area);
}

impl SecureMemoryFacility for SoftwareFacility {
    type Sealed = SoftwareSealed;
    type Revealed = SoftwareRevealed;

    fn seal(&self, plaintext: &[u8]) -> io::Result<SoftwareSealed> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        // Dropping `block` on an error path zeroes the copied plaintext.
        let mut block = PlatformSecretMemoryMut::allocate(plaintext.len(), self.inner.policy)?;
        block.as_bytes_mut().copy_from_slice(plaintext);

        let tag = self.inner.cipher.encrypt(&nonce, block.as_bytes_mut())?;

        Ok(SoftwareSealed {
            ciphertext: block.into_read_only()?,
            nonce,
            tag,
        })
    }

    fn unseal(&self, sealed: &SoftwareSealed) -> io::Result<SoftwareRevealed> {
        let ciphertext = sealed.ciphertext.as_bytes();

        let mut plaintext = PlatformSecretMemoryMut::allocate(ciphertext.len(), self.inner.policy)?;
        plaintext.as_bytes_mut().copy_from_slice(ciphertext);

        self.inner
            .cipher
            .decrypt(&sealed.nonce, plaintext.as_bytes_mut(), &sealed.tag)?;

        Ok(SoftwareRevealed { plaintext })
    }

    fn discard(&self, revealed: SoftwareRevealed) -> io::Result<()> {
        revealed.plaintext.free()
    }

    fn free(&self, sealed: SoftwareSealed) -> io::Result<()> {
        sealed.ciphertext.free()
    }
}

impl AsRef<[u8]> for SoftwareRevealed {
    fn as_ref(&self) -> &[u8] {
        self.plaintext.as_ref()
    }
}

impl AsMut<[u8]> for SoftwareRevealed {
    fn as_mut(&mut self) -> &mut [u8] {
        self.plaintext.as_mut()
    }
}

impl fmt::Debug for SoftwareFacility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareFacility")
            .field("key", &"[REDACTED]")
            .field("policy", &self.inner.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facility() -> SoftwareFacility {
        SoftwareFacility::new(LockPolicy::BestEffort).expect("Failed to create facility")
    }

    #[test]
    fn test_seal_unseal_roundtrip() {
        let facility = facility();

        let sealed = facility.seal(b"Llama").expect("Failed to seal");
        assert_ne!(sealed.ciphertext.as_bytes(), b"Llama");

        let revealed = facility.unseal(&sealed).expect("Failed to unseal");
        assert_eq!(revealed.as_ref(), b"Llama");

        facility.discard(revealed).expect("Failed to discard");
        facility.free(sealed).expect("Failed to free");
    }

    #[test]
    fn test_seal_empty_plaintext() {
        let facility = facility();

        let sealed = facility.seal(b"").expect("Failed to seal");
        let revealed = facility.unseal(&sealed).expect("Failed to unseal");

        assert!(revealed.as_ref().is_empty());
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let facility = facility();

        let first = facility.seal(b"same secret").expect("Failed to seal");
        let second = facility.seal(b"same secret").expect("Failed to seal");

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext.as_bytes(), second.ciphertext.as_bytes());
    }

    #[test]
    fn test_unseal_detects_tampering() {
        let facility = facility();

        let mut sealed = facility.seal(b"Secret").expect("Failed to seal");
        sealed.tag[0] ^= 0x01;

        let err = facility.unseal(&sealed).err().expect("Tampered tag must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_unseal_with_foreign_key_fails() {
        let sealed = facility().seal(b"Secret").expect("Failed to seal");

        assert!(facility().unseal(&sealed).is_err());
    }

    #[test]
    fn test_required_lock_roundtrip() {
        let facility =
            SoftwareFacility::new(LockPolicy::Required).expect("Failed to create facility");

        let sealed = facility.seal(b"Llama").expect("Failed to seal");
        let revealed = facility.unseal(&sealed).expect("Failed to unseal");
        assert_eq!(revealed.as_ref(), b"Llama");

        facility.discard(revealed).expect("Failed to discard");
        facility.free(sealed).expect("Failed to free");
    }

    #[test]
    fn test_rejects_short_key() {
        let err = SoftwareFacility::from_key(&[0u8; 16], LockPolicy::BestEffort)
            .err()
            .expect("Short key must be rejected");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    static KNOWN_KEY: [u8; KEY_SIZE] = *b"sealed-str/stack-residue-key-32b";
    const STACK_WINDOW: usize = 16 * 1024;

    /// Reads the stale bytes of the stack area just below the caller.
    #[inline(never)]
    fn stale_stack_contains(needle: &[u8]) -> bool {
        let window = mem::MaybeUninit::<[u8; STACK_WINDOW]>::uninit();
        let base = window.as_ptr().cast::<u8>();
        let bytes: Vec<u8> = (0..STACK_WINDOW)
            .map(|i| unsafe { base.add(i).read_volatile() })
            .collect();

        bytes.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_key_bytes_do_not_linger_on_stack() {
        let facility = SoftwareFacility::from_key(&KNOWN_KEY, LockPolicy::BestEffort)
            .expect("Failed to create facility");
        assert!(!stale_stack_contains(&KNOWN_KEY[..16]));

        let sealed = facility.seal(b"Llama").expect("Failed to seal");
        assert!(!stale_stack_contains(&KNOWN_KEY[..16]));

        let revealed = facility.unseal(&sealed).expect("Failed to unseal");
        assert!(!stale_stack_contains(&KNOWN_KEY[..16]));
        assert_eq!(revealed.as_ref(), b"Llama");
    }

    #[test]
    fn test_shared_facility_reuses_key() {
        let first = SoftwareFacility::shared().expect("Failed to create shared facility");
        let second = SoftwareFacility::shared().expect("Failed to create shared facility");

        assert!(Arc::ptr_eq(&first.inner, &second.inner));

        let sealed = first.seal(b"TopSecret").expect("Failed to seal");
        let revealed = second.unseal(&sealed).expect("Failed to unseal");
        assert_eq!(revealed.as_ref(), b"TopSecret");
    }
}
