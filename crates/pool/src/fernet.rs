//! Fernet-style authenticated encryption for the credential file.
//!
//! Token layout (before base64url encoding):
//!
//! ```text
//! 0x80 ‖ timestamp_be64 ‖ IV(16) ‖ AES-128-CBC(PKCS7(plaintext)) ‖ HMAC-SHA256
//! ```
//!
//! The 32-byte key splits into a signing half (`key[0..16]`) and an
//! encryption half (`key[16..32]`). The HMAC covers everything before it
//! and is verified in constant time before the cipher ever sees the
//! ciphertext.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use swarm_domain::error::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub const KEY_SIZE: usize = 32;
const SIGNING_KEY_SIZE: usize = 16;
const IV_SIZE: usize = 16;
const TIMESTAMP_SIZE: usize = 8;
const VERSION_SIZE: usize = 1;
const HMAC_SIZE: usize = 32;
const FERNET_VERSION: u8 = 0x80;

/// Generate a fresh 32-byte key, returned base64url-encoded for storage.
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    URL_SAFE_NO_PAD.encode(key)
}

/// Decode a base64url key string into its 32 raw bytes.
pub fn decode_key(key_str: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(key_str.trim())
        .map_err(|e| Error::Crypto(format!("invalid key encoding: {e}")))?;
    let arr: [u8; KEY_SIZE] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("invalid key size".into()))?;
    Ok(arr)
}

/// Encrypt `plaintext` under the base64url `key_str`, returning a
/// base64url token.
pub fn encrypt(plaintext: &[u8], key_str: &str) -> Result<String> {
    let key = decode_key(key_str)?;
    let (signing_key, encryption_key) = key.split_at(SIGNING_KEY_SIZE);

    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let timestamp = chrono::Utc::now().timestamp().max(0) as u64;

    let ciphertext = Aes128CbcEnc::new(encryption_key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut payload =
        Vec::with_capacity(VERSION_SIZE + TIMESTAMP_SIZE + IV_SIZE + ciphertext.len() + HMAC_SIZE);
    payload.push(FERNET_VERSION);
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&ciphertext);

    let mut mac = HmacSha256::new_from_slice(signing_key)
        .map_err(|e| Error::Crypto(format!("HMAC init: {e}")))?;
    mac.update(&payload);
    payload.extend_from_slice(&mac.finalize().into_bytes());

    Ok(URL_SAFE_NO_PAD.encode(payload))
}

/// Verify and decrypt a base64url token. Fails without touching the cipher
/// if the version byte or HMAC does not check out.
pub fn decrypt(token: &str, key_str: &str) -> Result<Vec<u8>> {
    let key = decode_key(key_str)?;
    let (signing_key, encryption_key) = key.split_at(SIGNING_KEY_SIZE);

    let payload = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|e| Error::Crypto(format!("invalid token encoding: {e}")))?;

    if payload.len() < VERSION_SIZE + TIMESTAMP_SIZE + IV_SIZE + HMAC_SIZE {
        return Err(Error::Crypto("token too short".into()));
    }
    if payload[0] != FERNET_VERSION {
        return Err(Error::Crypto(format!(
            "unsupported token version: 0x{:02x}",
            payload[0]
        )));
    }

    let (signed, stored_hmac) = payload.split_at(payload.len() - HMAC_SIZE);
    let mut mac = HmacSha256::new_from_slice(signing_key)
        .map_err(|e| Error::Crypto(format!("HMAC init: {e}")))?;
    mac.update(signed);
    let computed = mac.finalize().into_bytes();
    if computed.as_slice().ct_eq(stored_hmac).unwrap_u8() != 1 {
        return Err(Error::Crypto("HMAC verification failed".into()));
    }

    let iv_start = VERSION_SIZE + TIMESTAMP_SIZE;
    let ct_start = iv_start + IV_SIZE;
    let iv: [u8; IV_SIZE] = signed[iv_start..ct_start]
        .try_into()
        .map_err(|_| Error::Crypto("malformed IV".into()))?;
    let ciphertext = &signed[ct_start..];

    Aes128CbcDec::new(encryption_key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Crypto("decryption failed".into()))
}
