// Keyring and AES-128 segment decryption
use std::time::{Duration, Instant};

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockModeDecrypt, KeyIvInit, block_padding::Pkcs7};
use manifest::{CommonEncryption, EncryptionMethod};
use moka::sync::Cache;
use tracing::{debug, warn};

use crate::error::EncryptionError;
use crate::http::{ChunkType, ConnectionManager};
use crate::metrics::PerformanceMetrics;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub type KeyMaterial = [u8; 16];

/// Keys by URI, shared by every stream of a session.
pub struct Keyring {
    keys: Cache<String, KeyMaterial>,
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new(64, Duration::from_secs(3600))
    }
}

impl Keyring {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            keys: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, uri: &str) -> Option<KeyMaterial> {
        self.keys.get(uri)
    }

    /// Validates and stores raw key bytes.
    pub fn insert(&self, uri: &str, raw: &[u8]) -> Result<KeyMaterial, EncryptionError> {
        let key: KeyMaterial = raw.try_into().map_err(|_| EncryptionError::InvalidKey {
            uri: uri.to_string(),
            len: raw.len(),
        })?;
        self.keys.insert(uri.to_string(), key);
        Ok(key)
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.keys.contains_key(uri)
    }

    /// Key for `uri`, retrieved through the low latency queue on a miss.
    pub async fn get_key(
        &self,
        connections: &ConnectionManager,
        metrics: &PerformanceMetrics,
        uri: &str,
    ) -> Result<KeyMaterial, EncryptionError> {
        if let Some(key) = self.get(uri) {
            metrics.record_key_cache_hit();
            return Ok(key);
        }
        metrics.record_key_fetch();
        let retrieved = connections
            .retrieve(ChunkType::Key, uri)
            .await
            .map_err(|source| EncryptionError::KeyFetch {
                uri: uri.to_string(),
                source,
            })?;
        debug!(uri, "Fetched decryption key");
        self.insert(uri, &retrieved.body)
    }

    /// Loads session keys ahead of the first segment. Failures are logged;
    /// the key is fetched again when a segment needs it.
    pub async fn preload(
        &self,
        connections: &ConnectionManager,
        metrics: &PerformanceMetrics,
        keys: &[CommonEncryption],
    ) {
        for key in keys {
            let (EncryptionMethod::Aes128, Some(uri)) = (key.method, key.uri.as_deref()) else {
                continue;
            };
            if let Err(e) = self.get_key(connections, metrics, uri).await {
                warn!(uri, error = %e, "Session key preload failed");
            }
        }
    }
}

/// Checks that a descriptor can be handled by [`decrypt_aes128`].
pub fn key_uri(encryption: &CommonEncryption) -> Result<&str, EncryptionError> {
    match encryption.method {
        EncryptionMethod::Aes128 => encryption
            .uri
            .as_deref()
            .ok_or(EncryptionError::MissingKeyUri),
        other => Err(EncryptionError::UnsupportedMethod {
            method: other.to_string(),
        }),
    }
}

/// Decrypts a whole AES-128-CBC segment and strips its PKCS#7 padding.
pub fn decrypt_aes128(
    data: &[u8],
    key: &KeyMaterial,
    iv: &[u8; 16],
    metrics: Option<&PerformanceMetrics>,
) -> Result<Bytes, EncryptionError> {
    let started = Instant::now();
    let mut buffer = data.to_vec();
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| EncryptionError::decrypt(format!("failed to initialize AES: {e}")))?;
    let len = cipher
        .decrypt_padded::<Pkcs7>(&mut buffer)
        .map_err(|e| EncryptionError::decrypt(e.to_string()))?
        .len();
    buffer.truncate(len);
    if let Some(metrics) = metrics {
        metrics.record_decryption(data.len() as u64, started.elapsed().as_millis() as u64);
    }
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipher::BlockModeEncrypt;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    fn encrypt(plain: &[u8], key: &KeyMaterial, iv: &[u8; 16]) -> Vec<u8> {
        let mut buffer = vec![0u8; plain.len() + 16];
        buffer[..plain.len()].copy_from_slice(plain);
        let len = Aes128CbcEnc::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded::<Pkcs7>(&mut buffer, plain.len())
            .unwrap()
            .len();
        buffer.truncate(len);
        buffer
    }

    #[test]
    fn decrypts_cbc_with_padding() {
        let key = [0x11u8; 16];
        let iv = CommonEncryption::aes128("k", None).iv_for_sequence(7);
        let plain = b"transport stream payload that is not block aligned";
        let encrypted = encrypt(plain, &key, &iv);
        assert_eq!(encrypted.len() % 16, 0);

        let metrics = PerformanceMetrics::new();
        let decrypted = decrypt_aes128(&encrypted, &key, &iv, Some(&metrics)).unwrap();
        assert_eq!(&decrypted[..], &plain[..]);
        assert_eq!(metrics.snapshot().decryptions_total, 1);
    }

    #[test]
    fn wrong_key_fails_padding_check_or_garbles() {
        let iv = [0u8; 16];
        let encrypted = encrypt(b"0123456789", &[1u8; 16], &iv);
        match decrypt_aes128(&encrypted, &[2u8; 16], &iv, None) {
            Ok(garbled) => assert_ne!(&garbled[..], b"0123456789"),
            Err(e) => assert!(matches!(e, EncryptionError::Decrypt { .. })),
        }
    }

    #[test]
    fn keyring_validates_key_length() {
        let keyring = Keyring::default();
        assert!(matches!(
            keyring.insert("http://h/k", b"short"),
            Err(EncryptionError::InvalidKey { len: 5, .. })
        ));
        let key = keyring.insert("http://h/k", &[3u8; 16]).unwrap();
        assert_eq!(keyring.get("http://h/k"), Some(key));
    }

    #[test]
    fn only_aes128_has_a_key_uri() {
        let enc = CommonEncryption::aes128("http://h/k", None);
        assert_eq!(key_uri(&enc).unwrap(), "http://h/k");
        let sample = CommonEncryption {
            method: EncryptionMethod::SampleAes,
            uri: Some("http://h/k".to_string()),
            iv: None,
        };
        assert!(matches!(
            key_uri(&sample),
            Err(EncryptionError::UnsupportedMethod { .. })
        ));
    }
}
