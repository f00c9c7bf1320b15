/// Clipshare Crypto Library
///
/// At-rest sealing of clipboard payloads with AES-256-CBC.
/// Every envelope carries its own random IV (`IV || ciphertext`), so
/// identical payloads never produce identical rows.
///
/// There is no authentication tag: a corrupted envelope usually fails the
/// padding check, but tampering is not cryptographically detected.
pub mod encrypt;
pub mod keys;

pub use encrypt::{Cipher, CipherError, open, seal};
pub use keys::KEY_LEN;
