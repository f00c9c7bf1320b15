//! Clipshare room code codec.
//!
//! Maps internal room ids to short codes over a salt-permuted A-Z0-9 alphabet.
//! Ids below 36^5 always produce exactly five characters: the id is first sent
//! through an affine permutation of `[0, 36^5)` keyed by the salt, so
//! consecutive ids do not produce visibly consecutive codes. Larger ids fall
//! back to a plain positional encoding and come out longer than five
//! characters, which callers must treat as a configuration error.

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DEFAULT_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of every code in the scrambled domain.
pub const CODE_LEN: usize = 5;

const BASE: u64 = 36;
/// 36^5, the number of distinct five-character codes.
const DOMAIN: u64 = BASE * BASE * BASE * BASE * BASE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid room code")]
    InvalidCode,
    #[error("codec salt must not be empty")]
    EmptySalt,
}

#[derive(Clone)]
pub struct RoomCodec {
    alphabet: [u8; BASE as usize],
    multiplier: u64,
    multiplier_inv: u64,
    offset: u64,
}

impl std::fmt::Debug for RoomCodec {
    // Keyed parameters stay out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomCodec").finish_non_exhaustive()
    }
}

impl RoomCodec {
    pub fn new(salt: &str) -> Result<Self, CodecError> {
        if salt.is_empty() {
            return Err(CodecError::EmptySalt);
        }

        let mut alphabet = [0u8; BASE as usize];
        alphabet.copy_from_slice(DEFAULT_ALPHABET.as_bytes());
        consistent_shuffle(&mut alphabet, salt.as_bytes());

        let digest = Sha256::digest(salt.as_bytes());
        let word = |i: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&digest[i * 8..i * 8 + 8]);
            u64::from_be_bytes(buf)
        };

        // DOMAIN = 2^10 * 3^10, so any multiplier coprime to 6 is invertible.
        let mut multiplier = word(0) % DOMAIN;
        if multiplier % 2 == 0 {
            multiplier += 1;
        }
        while multiplier % 3 == 0 {
            multiplier = (multiplier + 2) % DOMAIN;
        }
        let multiplier_inv = mod_inverse(multiplier, DOMAIN);
        let offset = word(1) % DOMAIN;

        Ok(Self {
            alphabet,
            multiplier,
            multiplier_inv,
            offset,
        })
    }

    pub fn encode(&self, id: u64) -> String {
        if id < DOMAIN {
            let scrambled = mul_mod(self.multiplier, id, DOMAIN) + self.offset;
            self.digits(scrambled % DOMAIN, CODE_LEN)
        } else {
            self.digits(id, 0)
        }
    }

    pub fn decode(&self, code: &str) -> Result<u64, CodecError> {
        if code.len() < CODE_LEN {
            return Err(CodecError::InvalidCode);
        }

        let mut value: u64 = 0;
        for byte in code.bytes() {
            let digit = self
                .alphabet
                .iter()
                .position(|&c| c == byte)
                .ok_or(CodecError::InvalidCode)? as u64;
            value = value
                .checked_mul(BASE)
                .and_then(|v| v.checked_add(digit))
                .ok_or(CodecError::InvalidCode)?;
        }

        let id = if code.len() == CODE_LEN {
            let shifted = (value + DOMAIN - self.offset) % DOMAIN;
            mul_mod(self.multiplier_inv, shifted, DOMAIN)
        } else {
            value
        };

        if self.encode(id) != code {
            return Err(CodecError::InvalidCode);
        }
        Ok(id)
    }

    /// Positional encoding, left-padded with the zero digit up to `min_len`.
    fn digits(&self, mut value: u64, min_len: usize) -> String {
        let mut out = Vec::with_capacity(min_len.max(CODE_LEN + 8));
        while value > 0 || out.len() < min_len.max(1) {
            out.push(self.alphabet[(value % BASE) as usize]);
            value /= BASE;
        }
        out.reverse();
        out.into_iter().map(char::from).collect()
    }
}

/// Salt-driven Fisher-Yates variant; the same salt always yields the same permutation.
fn consistent_shuffle(alphabet: &mut [u8], salt: &[u8]) {
    let mut v = 0usize;
    let mut p = 0usize;
    for i in (1..alphabet.len()).rev() {
        v %= salt.len();
        let c = salt[v] as usize;
        p += c;
        let j = (c + v + p) % i;
        alphabet.swap(i, j);
        v += 1;
    }
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((a as u128 * b as u128) % m as u128) as u64
}

/// `a` must be coprime to `m`.
fn mod_inverse(a: u64, m: u64) -> u64 {
    let (mut old_r, mut r) = (a as i128, m as i128);
    let (mut old_s, mut s) = (1i128, 0i128);
    while r != 0 {
        let q = old_r / r;
        (old_r, r) = (r, old_r - q * r);
        (old_s, s) = (s, old_s - q * s);
    }
    debug_assert_eq!(old_r, 1);
    old_s.rem_euclid(m as i128) as u64
}
