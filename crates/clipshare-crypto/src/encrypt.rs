use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand_core::{OsRng, RngCore};
use thiserror::Error;

use crate::keys::KEY_LEN;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size; also the IV size.
pub const IV_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("envelope too short: {0} bytes")]
    EnvelopeTooShort(usize),
    #[error("ciphertext length {0} is not a multiple of the block size")]
    Misaligned(usize),
    #[error("decryption failed: bad padding or wrong key")]
    Decryption,
}

/// Seal a payload with AES-256-CBC under a fresh random IV.
/// Returns `IV || ciphertext`.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(&(*key).into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut envelope = Vec::with_capacity(IV_LEN + ciphertext.len());
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&ciphertext);
    envelope
}

/// Open an envelope produced by [`seal`].
pub fn open(key: &[u8; KEY_LEN], envelope: &[u8]) -> Result<Vec<u8>, CipherError> {
    // PKCS#7 always emits at least one block, even for empty input.
    if envelope.len() < IV_LEN * 2 {
        return Err(CipherError::EnvelopeTooShort(envelope.len()));
    }

    let (iv, body) = envelope.split_at(IV_LEN);
    if body.len() % IV_LEN != 0 {
        return Err(CipherError::Misaligned(body.len()));
    }

    let mut iv_block = [0u8; IV_LEN];
    iv_block.copy_from_slice(iv);

    Aes256CbcDec::new(&(*key).into(), &iv_block.into())
        .decrypt_padded_vec_mut::<Pkcs7>(body)
        .map_err(|_| CipherError::Decryption)
}

/// Process-wide cipher holding the key injected at startup.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_LEN],
}

impl Cipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        seal(&self.key, plaintext)
    }

    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>, CipherError> {
        open(&self.key, envelope)
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher { key: <redacted> }")
    }
}
