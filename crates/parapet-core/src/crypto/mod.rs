//! Authenticated encryption for stored blocks and key derivation.
//!
//! Every stored record is `flags ‖ nonce ‖ ciphertext ‖ tag` (AES-256-GCM,
//! 12-byte random nonce per call). The flags byte travels outside the
//! ciphertext but is bound into the tag as associated data, so flipping it
//! fails authentication.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use parapet_types::{ParapetError, Result};

/// Crypto format version recorded in the repository manifest.
pub const CRYPTO_FORMAT_VERSION: u32 = 1;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const SALT_LEN: usize = 16;

/// Default PBKDF2 iteration count written into new manifests.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Iteration bounds accepted when opening a repository. The lower bound
/// rejects manifests weakened below the format's floor; the upper bound
/// rejects maliciously crafted manifests that would stall key derivation.
pub const MIN_KDF_ITERATIONS: u32 = 100_000;
pub const MAX_KDF_ITERATIONS: u32 = 10_000_000;

/// Smallest well-formed record: flags + nonce + empty ciphertext + tag.
pub const MIN_RECORD_LEN: usize = 1 + NONCE_LEN + TAG_LEN;

/// The repository encryption key. Zeroized on drop so key material does not
/// linger in memory.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SealKey {
    key: [u8; 32],
}

impl SealKey {
    /// Derive the key from a passphrase and the manifest's salt via
    /// PBKDF2-HMAC-SHA-256.
    pub fn derive(passphrase: &[u8], salt: &[u8; SALT_LEN], iterations: u32) -> Result<Self> {
        if !(MIN_KDF_ITERATIONS..=MAX_KDF_ITERATIONS).contains(&iterations) {
            return Err(ParapetError::Config(format!(
                "KDF iteration count {iterations} outside accepted range \
                 [{MIN_KDF_ITERATIONS}, {MAX_KDF_ITERATIONS}]"
            )));
        }
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut key);
        Ok(SealKey { key })
    }

    /// Wrap raw key bytes (tests and key rotation tooling).
    pub fn from_bytes(key: [u8; 32]) -> Self {
        SealKey { key }
    }
}

/// Generate a fresh random salt for repository init.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Seal/open engine. Construct once per process from the derived key.
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    pub fn new(key: &SealKey) -> Self {
        let cipher =
            Aes256Gcm::new_from_slice(&key.key).expect("valid 32-byte key for AES-256-GCM");
        Sealer { cipher }
    }

    /// Encrypt a payload into a sealed record: `flags ‖ nonce ‖ ct ‖ tag`.
    pub fn seal(&self, flags: u8, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let aad = [flags];
        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| ParapetError::Config(format!("AES-GCM encrypt: {e}")))?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(flags);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a sealed record. Returns `(flags, plaintext)`.
    ///
    /// `MalformedRecord` for truncated input, `AuthFailure` when the tag does
    /// not verify (wrong key or corrupted block; fatal for that block).
    pub fn open(&self, record: &[u8]) -> Result<(u8, Vec<u8>)> {
        if record.len() < MIN_RECORD_LEN {
            return Err(ParapetError::MalformedRecord(format!(
                "record of {} bytes is shorter than the {MIN_RECORD_LEN}-byte minimum",
                record.len()
            )));
        }
        let flags = record[0];
        let nonce = Nonce::from_slice(&record[1..1 + NONCE_LEN]);
        let ciphertext = &record[1 + NONCE_LEN..];

        let aad = [flags];
        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| ParapetError::AuthFailure)?;
        Ok((flags, plaintext))
    }
}
