// Segment decryption hook. Callers supply the key and IV; nothing here fetches
// keys.

use std::path::Path;
use std::sync::Arc;

use aes::Aes128;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use tracing::debug;

use crate::HarvestError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const KEY_LEN: usize = 16;

/// Key material for one job.
#[derive(Clone, PartialEq, Eq)]
pub struct SegmentKey {
    pub key: [u8; KEY_LEN],
    pub iv: [u8; KEY_LEN],
}

impl std::fmt::Debug for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentKey")
            .field("key", &"<redacted>")
            .field("iv", &hex::encode(self.iv))
            .finish()
    }
}

impl SegmentKey {
    pub fn new(key: [u8; KEY_LEN], iv: [u8; KEY_LEN]) -> Self {
        Self { key, iv }
    }

    /// Parses 32-digit hex strings, with or without a `0x` prefix.
    pub fn from_hex(key: &str, iv: &str) -> Result<Self, HarvestError> {
        Ok(Self {
            key: parse_hex16(key, "key")?,
            iv: parse_hex16(iv, "IV")?,
        })
    }
}

fn parse_hex16(input: &str, what: &str) -> Result<[u8; KEY_LEN], HarvestError> {
    let digits = input
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let mut bytes = [0u8; KEY_LEN];
    hex::decode_to_slice(digits, &mut bytes).map_err(|e| HarvestError::Decryption {
        reason: format!("failed to parse {what} '{input}': {e}"),
    })?;
    Ok(bytes)
}

/// `decrypt(ciphertext, key, iv) -> plaintext`.
pub trait SegmentDecryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, HarvestError>;
}

/// AES-128-CBC with PKCS#7 padding, the HLS `METHOD=AES-128` scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes128CbcDecryptor;

impl SegmentDecryptor for Aes128CbcDecryptor {
    fn decrypt(&self, ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, HarvestError> {
        let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
            HarvestError::Decryption {
                reason: format!("failed to initialize AES decryptor: {e}"),
            }
        })?;

        let mut buffer = ciphertext.to_vec();
        let plain_len = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|e| HarvestError::Decryption {
                reason: format!("decryption failed: {e}"),
            })?
            .len();
        buffer.truncate(plain_len);
        Ok(buffer)
    }
}

/// Reads `path` and returns its decrypted contents. The cipher runs on the
/// blocking pool; the file itself is left untouched.
pub async fn decrypt_file(
    decryptor: Arc<dyn SegmentDecryptor>,
    path: &Path,
    key: &SegmentKey,
) -> Result<Vec<u8>, HarvestError> {
    let ciphertext = tokio::fs::read(path).await?;
    let key = key.clone();
    let plaintext = tokio::task::spawn_blocking(move || {
        decryptor.decrypt(&ciphertext, &key.key, &key.iv)
    })
    .await
    .map_err(|e| HarvestError::Decryption {
        reason: format!("decryption task failed: {e}"),
    })??;

    debug!(path = %path.display(), size = plaintext.len(), "Decrypted segment");
    Ok(plaintext)
}
