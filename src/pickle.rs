//! Binary persistence primitives.
//!
//! Fixed-width big-endian layout with no field tags; the struct being
//! persisted fixes the field order. Decoding must consume its input
//! exactly: short reads and trailing bytes are both errors.

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::keys::KEY_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PickleError {
    #[error("pickle ended before all fields were read")]
    UnexpectedEof,
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("{0} trailing bytes after the last field")]
    TrailingBytes(usize),
}

pub(crate) struct PickleWriter {
    buffer: Vec<u8>,
}

impl PickleWriter {
    pub fn new(capacity: usize) -> Self {
        Self { buffer: Vec::with_capacity(capacity) }
    }

    pub fn bool(&mut self, value: bool) {
        self.buffer.push(value as u8);
    }

    pub fn u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn bytes(&mut self, value: &[u8]) {
        self.buffer.extend_from_slice(value);
    }

    pub fn public_key(&mut self, key: &PublicKey) {
        self.bytes(key.as_bytes());
    }

    pub fn secret_key(&mut self, key: &StaticSecret) {
        self.bytes(key.as_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

pub(crate) struct PickleReader<'a> {
    input: &'a [u8],
}

impl<'a> PickleReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    fn take(&mut self, length: usize) -> Result<&'a [u8], PickleError> {
        if self.input.len() < length {
            return Err(PickleError::UnexpectedEof);
        }
        let (head, tail) = self.input.split_at(length);
        self.input = tail;
        Ok(head)
    }

    pub fn bool(&mut self) -> Result<bool, PickleError> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            byte => Err(PickleError::InvalidBool(byte)),
        }
    }

    pub fn u32(&mut self) -> Result<u32, PickleError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn key(&mut self) -> Result<[u8; KEY_LENGTH], PickleError> {
        let bytes = self.take(KEY_LENGTH)?;
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(bytes);
        Ok(key)
    }

    pub fn public_key(&mut self) -> Result<PublicKey, PickleError> {
        Ok(PublicKey::from(self.key()?))
    }

    pub fn secret_key(&mut self) -> Result<StaticSecret, PickleError> {
        let bytes = Zeroizing::new(self.key()?);
        Ok(StaticSecret::from(*bytes))
    }

    /// Ends decoding; any unread input is an error.
    pub fn finish(self) -> Result<(), PickleError> {
        if self.input.is_empty() {
            Ok(())
        } else {
            Err(PickleError::TrailingBytes(self.input.len()))
        }
    }
}
