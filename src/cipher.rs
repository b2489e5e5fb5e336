//! AES-256-CTR + HMAC-SHA-256 message cipher.
//!
//! A 32-byte message key is expanded into an AES key, a MAC key, and a CTR
//! IV. The MAC covers the entire message body from the version byte through
//! the ciphertext and is truncated to its leftmost eight bytes.

use std::ops::Range;

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Bytes of HMAC-SHA-256 output kept on the wire.
pub const MAC_LENGTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("message authentication failed")]
    BadMac,
}

/// Expanded per-message key block.
#[derive(Zeroize, ZeroizeOnDrop)]
struct MessageKeys {
    aes_key: [u8; 32],
    mac_key: [u8; 32],
    iv: [u8; 16],
}

/// The message cipher, parameterised by its key-expansion label.
pub struct MessageCipher {
    kdf_info: &'static [u8],
}

impl MessageCipher {
    pub const fn new(kdf_info: &'static [u8]) -> Self {
        Self { kdf_info }
    }

    pub fn mac_length(&self) -> usize {
        MAC_LENGTH
    }

    /// Ciphertext length for a plaintext. CTR mode adds no padding.
    pub fn ciphertext_length(&self, plaintext_length: usize) -> usize {
        plaintext_length
    }

    /// Upper bound on the plaintext recovered from a ciphertext.
    pub fn max_plaintext_length(&self, ciphertext_length: usize) -> usize {
        ciphertext_length
    }

    fn expand(&self, message_key: &[u8; 32]) -> MessageKeys {
        let hkdf = Hkdf::<Sha256>::new(None, message_key);
        let mut okm = Zeroizing::new([0u8; 80]);
        hkdf.expand(self.kdf_info, &mut okm[..]).unwrap();

        let mut keys = MessageKeys { aes_key: [0; 32], mac_key: [0; 32], iv: [0; 16] };
        keys.aes_key.copy_from_slice(&okm[..32]);
        keys.mac_key.copy_from_slice(&okm[32..64]);
        keys.iv.copy_from_slice(&okm[64..]);
        keys
    }

    /// Encrypt `plaintext` into the ciphertext region of `message` and
    /// append the truncated MAC over everything before it. `message` must
    /// already hold the encoded header; its last [`MAC_LENGTH`] bytes are
    /// overwritten.
    pub fn encrypt(
        &self,
        message_key: &[u8; 32],
        plaintext: &[u8],
        message: &mut [u8],
        ciphertext: Range<usize>,
    ) {
        debug_assert_eq!(ciphertext.len(), plaintext.len());
        let keys = self.expand(message_key);

        message[ciphertext.clone()].copy_from_slice(plaintext);
        let mut ctr = Aes256Ctr::new((&keys.aes_key).into(), (&keys.iv).into());
        ctr.apply_keystream(&mut message[ciphertext]);

        let mac_start = message.len() - MAC_LENGTH;
        let tag = Self::tag(&keys.mac_key, &message[..mac_start]);
        message[mac_start..].copy_from_slice(&tag[..MAC_LENGTH]);
    }

    /// Verify the trailing MAC of `message`, then decrypt its ciphertext
    /// region into `plaintext`. Returns the plaintext length.
    pub fn decrypt(
        &self,
        message_key: &[u8; 32],
        message: &[u8],
        ciphertext: Range<usize>,
        plaintext: &mut [u8],
    ) -> Result<usize, CipherError> {
        let keys = self.expand(message_key);

        let mac_start = message.len() - MAC_LENGTH;
        let mut mac = HmacSha256::new_from_slice(&keys.mac_key).unwrap();
        mac.update(&message[..mac_start]);
        mac.verify_truncated_left(&message[mac_start..])
            .map_err(|_| CipherError::BadMac)?;

        let length = ciphertext.len();
        plaintext[..length].copy_from_slice(&message[ciphertext]);
        let mut ctr = Aes256Ctr::new((&keys.aes_key).into(), (&keys.iv).into());
        ctr.apply_keystream(&mut plaintext[..length]);
        Ok(length)
    }

    fn tag(mac_key: &[u8; 32], data: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(mac_key).unwrap();
        mac.update(data);
        mac.finalize().into_bytes().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CIPHER: MessageCipher = MessageCipher::new(b"TEST_KEYS");

    fn build_message(key: &[u8; 32], header: &[u8], plaintext: &[u8]) -> (Vec<u8>, Range<usize>) {
        let mut message = vec![0u8; header.len() + plaintext.len() + MAC_LENGTH];
        message[..header.len()].copy_from_slice(header);
        let ciphertext = header.len()..header.len() + plaintext.len();
        CIPHER.encrypt(key, plaintext, &mut message, ciphertext.clone());
        (message, ciphertext)
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let key = [7u8; 32];
        let plaintext = b"attack at dawn";
        let (message, ciphertext) = build_message(&key, b"HEAD", plaintext);

        assert_ne!(&message[ciphertext.clone()], plaintext.as_slice());

        let mut decrypted = vec![0u8; plaintext.len()];
        let length = CIPHER.decrypt(&key, &message, ciphertext, &mut decrypted).unwrap();
        assert_eq!(&decrypted[..length], plaintext);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [7u8; 32];
        let (mut message, ciphertext) = build_message(&key, b"HEAD", b"payload");
        message[ciphertext.start] ^= 0x01;

        let mut decrypted = vec![0u8; ciphertext.len()];
        let result = CIPHER.decrypt(&key, &message, ciphertext, &mut decrypted);
        assert_eq!(result, Err(CipherError::BadMac));
    }

    #[test]
    fn test_tampered_header_fails() {
        let key = [7u8; 32];
        let (mut message, ciphertext) = build_message(&key, b"HEAD", b"payload");
        message[0] ^= 0x01;

        let mut decrypted = vec![0u8; ciphertext.len()];
        let result = CIPHER.decrypt(&key, &message, ciphertext, &mut decrypted);
        assert_eq!(result, Err(CipherError::BadMac));
    }

    #[test]
    fn test_wrong_key_fails() {
        let (message, ciphertext) = build_message(&[7u8; 32], b"HEAD", b"payload");

        let mut decrypted = vec![0u8; ciphertext.len()];
        let result = CIPHER.decrypt(&[8u8; 32], &message, ciphertext, &mut decrypted);
        assert_eq!(result, Err(CipherError::BadMac));
    }
}
