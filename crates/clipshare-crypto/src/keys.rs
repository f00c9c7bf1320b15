use anyhow::Result;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand_core::{OsRng, RngCore};

/// AES-256 key size in bytes.
pub const KEY_LEN: usize = 32;

/// Generate a random 256-bit key, e.g. for a fresh deployment's `.env`.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encode a key to base64 for configuration files.
pub fn key_to_base64(key: &[u8; KEY_LEN]) -> String {
    BASE64.encode(key)
}

/// Decode a base64 key. Anything other than exactly 32 bytes is rejected.
pub fn key_from_base64(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = BASE64.decode(encoded.trim())?;
    let len = bytes.len();
    let key: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Invalid key length: {} bytes, expected {}", len, KEY_LEN))?;
    Ok(key)
}
