//! Session state machine: handshake, envelope selection, persistence.
//!
//! A session binds the two identity keys together with an ephemeral base
//! key and one of the responder's one-time keys, derives the triple
//! Diffie-Hellman secret, and drives the message ratchet. Until the first
//! inbound message decrypts, every outbound message repeats the handshake
//! material in a pre-key envelope; afterwards only the ratchet body is
//! sent.

use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::cipher::MessageCipher;
use crate::keys::{KeyPair, LocalKey, OneTimeKeyStore, RemoteKey, KEY_LENGTH};
use crate::message::{self, PreKeyMessageReader, PROTOCOL_VERSION};
use crate::pickle::{PickleError, PickleReader, PickleWriter};
use crate::ratchet::{KdfInfo, Ratchet, RatchetError};

const ROOT_KDF_INFO: &[u8] = b"OLM_ROOT";
const RATCHET_KDF_INFO: &[u8] = b"OLM_RATCHET";
const CIPHER_KDF_INFO: &[u8] = b"OLM_KEYS";

const OLM_KDF_INFO: KdfInfo = KdfInfo { root: ROOT_KDF_INFO, ratchet: RATCHET_KDF_INFO };

/// Which envelope an outbound message uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Steady-state envelope carrying only the ratchet body.
    Message,
    /// Handshake envelope carrying identity key, base key, and key id
    /// alongside the first ratchet body.
    PreKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("not enough random bytes supplied")]
    NotEnoughRandom,
    #[error("output buffer too small")]
    OutputBufferTooSmall,
    #[error("pre-key message failed structural validation")]
    BadMessageFormat,
    #[error("no one-time key with the requested identifier")]
    BadMessageKeyId,
    #[error(transparent)]
    Ratchet(#[from] RatchetError),
}

/// Structural checks shared by inbound construction and matching: all
/// handshake fields present, both keys exactly 32 bytes.
fn handshake_fields<'m>(
    reader: &PreKeyMessageReader<'m>,
) -> Option<(u32, &'m [u8], &'m [u8], &'m [u8])> {
    match (reader.one_time_key_id, reader.base_key, reader.identity_key, reader.message) {
        (Some(id), Some(base_key), Some(identity_key), Some(body))
            if base_key.len() == KEY_LENGTH && identity_key.len() == KEY_LENGTH =>
        {
            Some((id, base_key, identity_key, body))
        }
        _ => None,
    }
}

fn to_public_key(bytes: &[u8]) -> PublicKey {
    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(bytes);
    PublicKey::from(key)
}

/// A two-party double-ratchet session.
pub struct Session {
    received_message: bool,
    alice_identity_key: RemoteKey,
    alice_base_key: PublicKey,
    bob_one_time_key_id: u32,
    ratchet: Ratchet,
}

impl Session {
    /// Random bytes `new_outbound_session` consumes: one seed for the base
    /// key and one for the initial ratchet key.
    pub fn new_outbound_session_random_length() -> usize {
        KEY_LENGTH * 2
    }

    fn new_ratchet() -> Ratchet {
        Ratchet::new(OLM_KDF_INFO, MessageCipher::new(CIPHER_KDF_INFO))
    }

    /// Create the initiator side of a session against a remote identity
    /// key and one of its one-time keys.
    pub fn new_outbound_session(
        local_identity: &LocalKey,
        remote_identity_key: &PublicKey,
        remote_one_time_key: &RemoteKey,
        random: &[u8],
    ) -> Result<Session, SessionError> {
        if random.len() < Self::new_outbound_session_random_length() {
            return Err(SessionError::NotEnoughRandom);
        }

        let mut seed = Zeroizing::new([0u8; KEY_LENGTH]);
        seed.copy_from_slice(&random[..KEY_LENGTH]);
        let base_key = KeyPair::from_seed(&seed);
        seed.copy_from_slice(&random[KEY_LENGTH..2 * KEY_LENGTH]);
        let ratchet_key = KeyPair::from_seed(&seed);

        let mut shared_secret = Zeroizing::new([0u8; 3 * KEY_LENGTH]);
        shared_secret[..32]
            .copy_from_slice(local_identity.key.shared_secret(&remote_one_time_key.key).as_bytes());
        shared_secret[32..64]
            .copy_from_slice(base_key.shared_secret(remote_identity_key).as_bytes());
        shared_secret[64..]
            .copy_from_slice(base_key.shared_secret(&remote_one_time_key.key).as_bytes());

        let mut ratchet = Self::new_ratchet();
        ratchet.initialise_as_alice(&shared_secret[..], ratchet_key);

        tracing::debug!(
            one_time_key_id = remote_one_time_key.id,
            remote_identity = %hex::encode(remote_identity_key.as_bytes()),
            "created outbound session"
        );

        // Only the base key's public half outlives the handshake; the pair
        // is dropped (and its scalar wiped) on return.
        Ok(Session {
            received_message: false,
            alice_identity_key: RemoteKey {
                id: local_identity.id,
                key: *local_identity.key.public_key(),
            },
            alice_base_key: *base_key.public_key(),
            bob_one_time_key_id: remote_one_time_key.id,
            ratchet,
        })
    }

    /// Create the responder side from a received pre-key message.
    ///
    /// This validates the envelope and derives the session, but does not
    /// decrypt the contained message; callers follow up with [`decrypt`]
    /// on the same bytes. The consumed one-time key is not removed from
    /// the store.
    ///
    /// [`decrypt`]: Session::decrypt
    pub fn new_inbound_session(
        local_identity: &KeyPair,
        one_time_keys: &(impl OneTimeKeyStore + ?Sized),
        message: &[u8],
    ) -> Result<Session, SessionError> {
        let mut ratchet = Self::new_ratchet();

        let reader = message::decode_one_time_key_message(message)
            .map_err(|_| SessionError::BadMessageFormat)?;
        let (one_time_key_id, base_key, identity_key, body) =
            handshake_fields(&reader).ok_or(SessionError::BadMessageFormat)?;

        let inner = message::decode_message(body, ratchet.mac_length())
            .map_err(|_| SessionError::BadMessageFormat)?;
        let ratchet_key = match inner.ratchet_key {
            Some(key) if key.len() == KEY_LENGTH => to_public_key(key),
            _ => return Err(SessionError::BadMessageFormat),
        };

        let alice_identity_key = RemoteKey { id: 0, key: to_public_key(identity_key) };
        let alice_base_key = to_public_key(base_key);

        let one_time_key = one_time_keys
            .one_time_key(one_time_key_id)
            .ok_or(SessionError::BadMessageKeyId)?;

        let mut shared_secret = Zeroizing::new([0u8; 3 * KEY_LENGTH]);
        shared_secret[..32]
            .copy_from_slice(one_time_key.shared_secret(&alice_identity_key.key).as_bytes());
        shared_secret[32..64]
            .copy_from_slice(local_identity.shared_secret(&alice_base_key).as_bytes());
        shared_secret[64..]
            .copy_from_slice(one_time_key.shared_secret(&alice_base_key).as_bytes());

        ratchet.initialise_as_bob(&shared_secret[..], ratchet_key);

        tracing::debug!(
            one_time_key_id,
            remote_identity = %hex::encode(alice_identity_key.key.as_bytes()),
            "created inbound session"
        );

        Ok(Session {
            received_message: false,
            alice_identity_key,
            alice_base_key,
            bob_one_time_key_id: one_time_key_id,
            ratchet,
        })
    }

    /// Whether a pre-key message names this session's handshake triple.
    ///
    /// Decode failures and missing fields answer `false`. Nothing mutates;
    /// callers holding several candidate sessions use this to pick the one
    /// a replayed pre-key message belongs to.
    pub fn matches_inbound_session(&self, message: &[u8]) -> bool {
        let reader = match message::decode_one_time_key_message(message) {
            Ok(reader) => reader,
            Err(_) => return false,
        };
        match handshake_fields(&reader) {
            Some((id, base_key, identity_key, _)) => {
                id == self.bob_one_time_key_id
                    && identity_key == self.alice_identity_key.key.as_bytes().as_slice()
                    && base_key == self.alice_base_key.as_bytes().as_slice()
            }
            None => false,
        }
    }

    /// Has any inbound message decrypted on this session?
    pub fn has_received_message(&self) -> bool {
        self.received_message
    }

    /// Envelope the next `encrypt` will produce.
    pub fn encrypt_message_type(&self) -> MessageType {
        if self.received_message {
            MessageType::Message
        } else {
            MessageType::PreKey
        }
    }

    /// Bytes `encrypt` writes for a plaintext of the given length.
    pub fn encrypt_message_length(&self, plaintext_length: usize) -> usize {
        let body_length = self.ratchet.encrypt_output_length(plaintext_length);
        if self.received_message {
            body_length
        } else {
            message::one_time_key_message_length(
                self.bob_one_time_key_id,
                KEY_LENGTH,
                KEY_LENGTH,
                body_length,
            )
        }
    }

    /// Random bytes the next `encrypt` consumes.
    pub fn encrypt_random_length(&self) -> usize {
        self.ratchet.encrypt_random_length()
    }

    /// Encrypt `plaintext` into `message`, wrapping the ratchet body in a
    /// pre-key envelope until the first inbound message has decrypted.
    /// Returns the number of bytes written.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        random: &[u8],
        message: &mut [u8],
    ) -> Result<usize, SessionError> {
        let message_length = self.encrypt_message_length(plaintext.len());
        if message.len() < message_length {
            return Err(SessionError::OutputBufferTooSmall);
        }
        let body_length = self.ratchet.encrypt_output_length(plaintext.len());

        if self.received_message {
            self.ratchet.encrypt(plaintext, random, &mut message[..body_length])?;
        } else {
            let envelope = &mut message[..message_length];
            let body = message::encode_one_time_key_message(
                PROTOCOL_VERSION,
                self.bob_one_time_key_id,
                self.alice_base_key.as_bytes(),
                self.alice_identity_key.key.as_bytes(),
                body_length,
                envelope,
            );
            self.ratchet.encrypt(plaintext, random, &mut envelope[body])?;
        }
        Ok(message_length)
    }

    /// Largest plaintext `decrypt` may produce for this message.
    pub fn decrypt_max_plaintext_length(
        &self,
        message_type: MessageType,
        message: &[u8],
    ) -> Result<usize, SessionError> {
        let body = message_body(message_type, message)?;
        Ok(self.ratchet.decrypt_max_plaintext_length(body)?)
    }

    /// Decrypt a message, stripping the pre-key envelope if present.
    ///
    /// The envelope's handshake fields are not re-checked here; the
    /// ratchet's MAC is the authentication boundary.
    pub fn decrypt(
        &mut self,
        message_type: MessageType,
        message: &[u8],
        plaintext: &mut [u8],
    ) -> Result<usize, SessionError> {
        let body = message_body(message_type, message)?;
        let length = self.ratchet.decrypt(body, plaintext)?;
        if !self.received_message {
            tracing::debug!("session established");
        }
        self.received_message = true;
        Ok(length)
    }

    /// Serialized size of this session.
    pub fn pickle_length(&self) -> usize {
        1 + 4 + KEY_LENGTH + KEY_LENGTH + 4 + self.ratchet.pickle_length()
    }

    /// Serialise the session. The field order is stable: received flag,
    /// identity key id, identity key, base key, one-time key id, ratchet.
    pub fn pickle(&self) -> Vec<u8> {
        let mut writer = PickleWriter::new(self.pickle_length());
        writer.bool(self.received_message);
        writer.u32(self.alice_identity_key.id);
        writer.public_key(&self.alice_identity_key.key);
        writer.public_key(&self.alice_base_key);
        writer.u32(self.bob_one_time_key_id);
        self.ratchet.pickle(&mut writer);
        writer.finish()
    }

    /// Rebuild a session from [`pickle`] output, consuming it exactly.
    ///
    /// [`pickle`]: Session::pickle
    pub fn unpickle(input: &[u8]) -> Result<Session, PickleError> {
        let mut reader = PickleReader::new(input);
        let received_message = reader.bool()?;
        let id = reader.u32()?;
        let identity_key = reader.public_key()?;
        let alice_base_key = reader.public_key()?;
        let bob_one_time_key_id = reader.u32()?;
        let mut ratchet = Self::new_ratchet();
        ratchet.unpickle(&mut reader)?;
        reader.finish()?;

        Ok(Session {
            received_message,
            alice_identity_key: RemoteKey { id, key: identity_key },
            alice_base_key,
            bob_one_time_key_id,
            ratchet,
        })
    }
}

fn message_body<'a>(message_type: MessageType, message: &'a [u8]) -> Result<&'a [u8], SessionError> {
    match message_type {
        MessageType::Message => Ok(message),
        MessageType::PreKey => {
            let reader = message::decode_one_time_key_message(message)
                .map_err(|_| SessionError::BadMessageFormat)?;
            reader.message.ok_or(SessionError::BadMessageFormat)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound_session() -> Session {
        let local_identity = LocalKey { id: 3, key: KeyPair::from_seed(&[1u8; 32]) };
        let remote_identity = KeyPair::from_seed(&[2u8; 32]);
        let remote_one_time_key =
            RemoteKey { id: 42, key: *KeyPair::from_seed(&[3u8; 32]).public_key() };
        Session::new_outbound_session(
            &local_identity,
            remote_identity.public_key(),
            &remote_one_time_key,
            &[7u8; 64],
        )
        .unwrap()
    }

    #[test]
    fn test_outbound_randomness_boundary() {
        let local_identity = LocalKey { id: 3, key: KeyPair::from_seed(&[1u8; 32]) };
        let remote_identity = KeyPair::from_seed(&[2u8; 32]);
        let remote_one_time_key =
            RemoteKey { id: 42, key: *KeyPair::from_seed(&[3u8; 32]).public_key() };

        let result = Session::new_outbound_session(
            &local_identity,
            remote_identity.public_key(),
            &remote_one_time_key,
            &[0u8; 63],
        );
        assert!(matches!(result, Err(SessionError::NotEnoughRandom)));
    }

    #[test]
    fn test_fresh_outbound_session_uses_pre_key_envelopes() {
        let session = outbound_session();
        assert_eq!(session.encrypt_message_type(), MessageType::PreKey);
        assert!(!session.has_received_message());
        assert_eq!(session.encrypt_random_length(), 0);
    }

    #[test]
    fn test_pre_key_envelope_overhead_is_accounted() {
        let session = outbound_session();
        // The pre-key envelope adds the two keys, the key id, and framing
        // on top of the ratchet body.
        assert!(session.encrypt_message_length(5) > 2 * KEY_LENGTH);
    }

    #[test]
    fn test_pickle_length_matches_output() {
        let session = outbound_session();
        assert_eq!(session.pickle().len(), session.pickle_length());
    }

    #[test]
    fn test_decrypt_max_plaintext_length_rejects_garbage_envelope() {
        let session = outbound_session();
        let result = session.decrypt_max_plaintext_length(MessageType::PreKey, &[0xFF, 0xFF]);
        assert!(matches!(result, Err(SessionError::BadMessageFormat)));
    }
}
