//! AES-256-GCM envelope encryption for secret payloads.
//!
//! Envelope layout: `tag(4) || nonce(12) || ciphertext || gcm_tag(16)`.
//! The 32-byte key is the SHA-256 digest of the key file contents and is
//! held for the life of the codec.

use std::fmt;
use std::path::Path;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

/// Format tag identifying version 1 envelopes.
pub const FORMAT_TAG: [u8; 4] = *b"SEv1";
/// Nonce size for AES-256-GCM (12 bytes).
const NONCE_SIZE: usize = 12;
/// Format tag plus nonce.
pub const HEADER_SIZE: usize = FORMAT_TAG.len() + NONCE_SIZE;
/// GCM tag size (16 bytes).
const TAG_SIZE: usize = 16;

/// Errors raised while encrypting or decrypting envelopes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    Decode(String),

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Key material error: {0}")]
    Key(String),
}

/// Encrypts and decrypts secret envelopes with one key.
#[derive(Clone)]
pub struct SecretCodec {
    cipher: Aes256Gcm,
}

impl fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCodec").finish_non_exhaustive()
    }
}

impl SecretCodec {
    /// Load keying material from `path`.
    ///
    /// Warns when the file is readable by group or others.
    pub fn from_key_file(path: &Path) -> Result<Self, CodecError> {
        let contents = std::fs::read(path)
            .map_err(|e| CodecError::Key(format!("cannot read {}: {e}", path.display())))?;
        if contents.is_empty() {
            return Err(CodecError::Key(format!("{} is empty", path.display())));
        }
        warn_if_exposed(path);
        info!(path = %path.display(), "loaded secret encryption key");
        Ok(Self::from_key_bytes(&contents))
    }

    /// Derive the key from a passphrase. Intended for tests and development.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::from_key_bytes(passphrase.as_bytes())
    }

    fn from_key_bytes(material: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(material).into();
        let key: &Key<Aes256Gcm> = (&digest).into();
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Seal `plaintext` into a new envelope with a random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CodecError::Encrypt(e.to_string()))?;

        let mut envelope = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        envelope.extend_from_slice(&FORMAT_TAG);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// Open an envelope produced by [`SecretCodec::encrypt`].
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CodecError> {
        if envelope.len() < HEADER_SIZE {
            return Err(CodecError::Decode(format!(
                "envelope is {} bytes, header needs {HEADER_SIZE}",
                envelope.len()
            )));
        }
        let (tag, rest) = envelope.split_at(FORMAT_TAG.len());
        if tag != FORMAT_TAG {
            return Err(CodecError::Decode("unrecognised format tag".into()));
        }
        if rest.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CodecError::Decode("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CodecError::Decrypt(e.to_string()))
    }
}

#[cfg(unix)]
fn warn_if_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{:o}", mode & 0o777),
                "encryption key file is accessible by group or others"
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_exposed(_path: &Path) {}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn round_trip() {
        let codec = SecretCodec::from_passphrase("test-key");
        for payload in [&b""[..], b"x", b"kubeconfig: secret\n", &[0u8; 4096]] {
            let envelope = codec.encrypt(payload).unwrap();
            assert_eq!(&envelope[..4], &FORMAT_TAG);
            assert_eq!(envelope.len(), HEADER_SIZE + payload.len() + TAG_SIZE);
            assert_eq!(codec.decrypt(&envelope).unwrap(), payload);
        }
    }

    #[test]
    fn nonces_differ() {
        let codec = SecretCodec::from_passphrase("k");
        assert_ne!(codec.encrypt(b"same").unwrap(), codec.encrypt(b"same").unwrap());
    }

    #[test]
    fn short_input_is_a_decode_error() {
        let codec = SecretCodec::from_passphrase("k");
        for len in 0..HEADER_SIZE {
            let err = codec.decrypt(&vec![0u8; len]).unwrap_err();
            assert!(matches!(err, CodecError::Decode(_)), "len {len}");
        }
    }

    #[test]
    fn foreign_tag_is_a_decode_error() {
        let codec = SecretCodec::from_passphrase("k");
        let mut envelope = codec.encrypt(b"payload").unwrap();
        envelope[0] ^= 0xff;
        assert!(matches!(codec.decrypt(&envelope), Err(CodecError::Decode(_))));
    }

    #[test]
    fn wrong_key_fails() {
        let envelope = SecretCodec::from_passphrase("right").encrypt(b"secret").unwrap();
        let err = SecretCodec::from_passphrase("wrong").decrypt(&envelope).unwrap_err();
        assert!(matches!(err, CodecError::Decrypt(_)));
    }

    #[test]
    fn key_file_matches_passphrase_of_same_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"file-key").unwrap();
        let from_file = SecretCodec::from_key_file(file.path()).unwrap();
        let envelope = from_file.encrypt(b"hello").unwrap();
        let decrypted = SecretCodec::from_passphrase("file-key").decrypt(&envelope).unwrap();
        assert_eq!(decrypted, b"hello");
    }

    #[test]
    fn empty_or_missing_key_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            SecretCodec::from_key_file(file.path()),
            Err(CodecError::Key(_))
        ));
        assert!(matches!(
            SecretCodec::from_key_file(Path::new("/nonexistent/strata.key")),
            Err(CodecError::Key(_))
        ));
    }
}
