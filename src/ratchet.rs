//! Double ratchet state machine.
//!
//! Forward secrecy comes from the per-message symmetric chain; post-
//! compromise security from the Diffie-Hellman ratchet advanced on each
//! direction change. All randomness is supplied by the caller, and inbound
//! state is committed only after a message authenticates.

use std::ops::Range;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use x25519_dalek::PublicKey;
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::{CipherError, MessageCipher};
use crate::keys::{KeyPair, KEY_LENGTH};
use crate::message::{self, DecodeError, PROTOCOL_VERSION};
use crate::pickle::{PickleError, PickleReader, PickleWriter};

type HmacSha256 = Hmac<Sha256>;

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

/// Receiver chains kept alive for out-of-order traffic.
const MAX_RECEIVER_CHAINS: usize = 5;
/// Message keys retained for messages that have not arrived yet.
const MAX_SKIPPED_MESSAGE_KEYS: usize = 40;
/// Furthest a message counter may run ahead of its chain.
const MAX_MESSAGE_GAP: u32 = 2000;

/// KDF labels separating the root derivation from chain advances.
#[derive(Clone, Copy)]
pub struct KdfInfo {
    pub root: &'static [u8],
    pub ratchet: &'static [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RatchetError {
    #[error("ratchet not initialised")]
    NotInitialized,
    #[error("not enough random bytes supplied")]
    NotEnoughRandom,
    #[error("output buffer too small")]
    OutputBufferTooSmall,
    #[error("unsupported message version")]
    BadMessageVersion,
    #[error("message failed structural validation")]
    BadMessageFormat,
    #[error("message authentication failed")]
    BadMessageMac,
    #[error("message counter runs too far ahead of its chain")]
    CounterOutOfRange,
    #[error("no stored key for an already ratcheted message")]
    UnknownMessageIndex,
}

impl From<CipherError> for RatchetError {
    fn from(_: CipherError) -> Self {
        RatchetError::BadMessageMac
    }
}

impl From<DecodeError> for RatchetError {
    fn from(_: DecodeError) -> Self {
        RatchetError::BadMessageFormat
    }
}

fn derive(key: &[u8; 32], seed: u8) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(&[seed]);
    mac.finalize().into_bytes().into()
}

/// Chain key for the symmetric ratchet.
#[derive(Clone)]
struct ChainKey {
    index: u32,
    key: [u8; 32],
}

impl ChainKey {
    fn new(key: [u8; 32]) -> Self {
        Self { index: 0, key }
    }

    /// Message key for the current index.
    fn message_key(&self) -> MessageKey {
        MessageKey { index: self.index, key: derive(&self.key, MESSAGE_KEY_SEED) }
    }

    fn advance(&mut self) {
        self.key = derive(&self.key, CHAIN_KEY_SEED);
        self.index += 1;
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

struct MessageKey {
    index: u32,
    key: [u8; 32],
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

struct SenderChain {
    ratchet_key: KeyPair,
    chain_key: ChainKey,
}

struct ReceiverChain {
    ratchet_key: PublicKey,
    chain_key: ChainKey,
}

struct SkippedMessageKey {
    ratchet_key: PublicKey,
    message_key: MessageKey,
}

/// Double-ratchet state.
pub struct Ratchet {
    kdf_info: KdfInfo,
    cipher: MessageCipher,
    root_key: [u8; 32],
    sender_chain: Option<SenderChain>,
    receiver_chains: Vec<ReceiverChain>,
    skipped_message_keys: Vec<SkippedMessageKey>,
}

impl Drop for Ratchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

impl Ratchet {
    pub fn new(kdf_info: KdfInfo, cipher: MessageCipher) -> Self {
        Self {
            kdf_info,
            cipher,
            root_key: [0; 32],
            sender_chain: None,
            receiver_chains: Vec::new(),
            skipped_message_keys: Vec::new(),
        }
    }

    pub fn mac_length(&self) -> usize {
        self.cipher.mac_length()
    }

    fn expand_keys(salt: Option<&[u8]>, input: &[u8], info: &[u8]) -> (Zeroizing<[u8; 32]>, ChainKey) {
        let hkdf = Hkdf::<Sha256>::new(salt, input);
        let mut okm = Zeroizing::new([0u8; 64]);
        hkdf.expand(info, &mut okm[..]).unwrap();

        let mut root_key = Zeroizing::new([0u8; 32]);
        root_key.copy_from_slice(&okm[..32]);
        let mut chain_key = [0u8; 32];
        chain_key.copy_from_slice(&okm[32..]);
        (root_key, ChainKey::new(chain_key))
    }

    fn derive_initial_keys(&self, shared_secret: &[u8]) -> (Zeroizing<[u8; 32]>, ChainKey) {
        Self::expand_keys(None, shared_secret, self.kdf_info.root)
    }

    fn advance_root(&self, dh_output: &[u8]) -> (Zeroizing<[u8; 32]>, ChainKey) {
        Self::expand_keys(Some(&self.root_key), dh_output, self.kdf_info.ratchet)
    }

    /// Initialise as the session initiator: the supplied key pair becomes
    /// the sender ratchet key and seeds the sending chain.
    pub fn initialise_as_alice(&mut self, shared_secret: &[u8], ratchet_key: KeyPair) {
        let (root_key, chain_key) = self.derive_initial_keys(shared_secret);
        self.root_key = *root_key;
        self.sender_chain = Some(SenderChain { ratchet_key, chain_key });
    }

    /// Initialise as the responder: the remote ratchet key seeds the first
    /// receiving chain. The first send will open a sending chain of its own.
    pub fn initialise_as_bob(&mut self, shared_secret: &[u8], their_ratchet_key: PublicKey) {
        let (root_key, chain_key) = self.derive_initial_keys(shared_secret);
        self.root_key = *root_key;
        self.receiver_chains.push(ReceiverChain { ratchet_key: their_ratchet_key, chain_key });
    }

    /// Bytes `encrypt` writes for a plaintext of the given length.
    pub fn encrypt_output_length(&self, plaintext_length: usize) -> usize {
        let counter = self.sender_chain.as_ref().map(|chain| chain.chain_key.index).unwrap_or(0);
        message::message_length(
            counter,
            KEY_LENGTH,
            self.cipher.ciphertext_length(plaintext_length),
            self.cipher.mac_length(),
        )
    }

    /// Random bytes the next `encrypt` consumes: a ratchet key seed when a
    /// new sending chain must be opened, nothing otherwise.
    pub fn encrypt_random_length(&self) -> usize {
        if self.sender_chain.is_some() {
            0
        } else {
            KEY_LENGTH
        }
    }

    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        random: &[u8],
        output: &mut [u8],
    ) -> Result<usize, RatchetError> {
        if random.len() < self.encrypt_random_length() {
            return Err(RatchetError::NotEnoughRandom);
        }
        let output_length = self.encrypt_output_length(plaintext.len());
        if output.len() < output_length {
            return Err(RatchetError::OutputBufferTooSmall);
        }

        if self.sender_chain.is_none() {
            // Direction change: a fresh ratchet key against the newest
            // remote key opens the new sending chain.
            let remote_key = self
                .receiver_chains
                .first()
                .map(|chain| chain.ratchet_key)
                .ok_or(RatchetError::NotInitialized)?;
            let mut seed = Zeroizing::new([0u8; KEY_LENGTH]);
            seed.copy_from_slice(&random[..KEY_LENGTH]);
            let ratchet_key = KeyPair::from_seed(&seed);
            let shared = ratchet_key.shared_secret(&remote_key);
            let (root_key, chain_key) = self.advance_root(shared.as_bytes());
            self.root_key = *root_key;
            self.sender_chain = Some(SenderChain { ratchet_key, chain_key });
            tracing::debug!("advanced sender ratchet");
        }

        let (message_key, ratchet_public) = match self.sender_chain.as_mut() {
            Some(chain) => {
                let message_key = chain.chain_key.message_key();
                chain.chain_key.advance();
                (message_key, *chain.ratchet_key.public_key())
            }
            None => return Err(RatchetError::NotInitialized),
        };

        let body = &mut output[..output_length];
        let ciphertext = message::encode_message(
            PROTOCOL_VERSION,
            message_key.index,
            ratchet_public.as_bytes(),
            self.cipher.ciphertext_length(plaintext.len()),
            body,
        );
        self.cipher.encrypt(&message_key.key, plaintext, body, ciphertext);
        Ok(output_length)
    }

    /// Upper bound on the plaintext a message body can decrypt to.
    pub fn decrypt_max_plaintext_length(&self, message: &[u8]) -> Result<usize, RatchetError> {
        let reader = message::decode_message(message, self.cipher.mac_length())?;
        let ciphertext = reader.ciphertext.ok_or(RatchetError::BadMessageFormat)?;
        Ok(self.cipher.max_plaintext_length(ciphertext.len()))
    }

    pub fn decrypt(&mut self, message: &[u8], plaintext: &mut [u8]) -> Result<usize, RatchetError> {
        let reader = message::decode_message(message, self.cipher.mac_length())?;
        if reader.version != PROTOCOL_VERSION {
            return Err(RatchetError::BadMessageVersion);
        }
        let counter = reader.counter.ok_or(RatchetError::BadMessageFormat)?;
        let ratchet_key = reader.ratchet_key.ok_or(RatchetError::BadMessageFormat)?;
        let ciphertext = reader.ciphertext.ok_or(RatchetError::BadMessageFormat)?;
        if ratchet_key.len() != KEY_LENGTH {
            return Err(RatchetError::BadMessageFormat);
        }
        if plaintext.len() < self.cipher.max_plaintext_length(ciphertext.len()) {
            return Err(RatchetError::OutputBufferTooSmall);
        }

        let mut key_bytes = [0u8; KEY_LENGTH];
        key_bytes.copy_from_slice(ratchet_key);
        let ratchet_key = PublicKey::from(key_bytes);

        let position = self
            .receiver_chains
            .iter()
            .position(|chain| chain.ratchet_key == ratchet_key);
        match position {
            Some(position) => {
                self.decrypt_for_existing_chain(position, ratchet_key, counter, message, ciphertext, plaintext)
            }
            None => self.decrypt_for_new_chain(ratchet_key, counter, message, ciphertext, plaintext),
        }
    }

    fn decrypt_for_existing_chain(
        &mut self,
        position: usize,
        ratchet_key: PublicKey,
        counter: u32,
        message: &[u8],
        ciphertext: Range<usize>,
        plaintext: &mut [u8],
    ) -> Result<usize, RatchetError> {
        if counter < self.receiver_chains[position].chain_key.index {
            return self.decrypt_skipped(&ratchet_key, counter, message, ciphertext, plaintext);
        }

        let chain = self.receiver_chains[position].chain_key.clone();
        let (message_key, chain, skipped) = Self::advance_to(chain, counter, ratchet_key)?;
        let length = self.cipher.decrypt(&message_key.key, message, ciphertext, plaintext)?;

        self.receiver_chains[position].chain_key = chain;
        self.store_skipped(skipped);
        Ok(length)
    }

    fn decrypt_for_new_chain(
        &mut self,
        ratchet_key: PublicKey,
        counter: u32,
        message: &[u8],
        ciphertext: Range<usize>,
        plaintext: &mut [u8],
    ) -> Result<usize, RatchetError> {
        // The remote advanced its DH ratchet. Derive the candidate chain,
        // but commit nothing until the MAC verifies.
        let sender = self.sender_chain.as_ref().ok_or(RatchetError::NotInitialized)?;
        let shared = sender.ratchet_key.shared_secret(&ratchet_key);
        let (root_key, chain_key) = self.advance_root(shared.as_bytes());
        let (message_key, chain, skipped) = Self::advance_to(chain_key, counter, ratchet_key)?;
        let length = self.cipher.decrypt(&message_key.key, message, ciphertext, plaintext)?;

        self.root_key = *root_key;
        self.receiver_chains.insert(0, ReceiverChain { ratchet_key, chain_key: chain });
        self.receiver_chains.truncate(MAX_RECEIVER_CHAINS);
        // The old sending chain is dead; the next encrypt opens a new one.
        self.sender_chain = None;
        self.store_skipped(skipped);
        tracing::debug!("advanced receiver ratchet");
        Ok(length)
    }

    /// Advance a copy of `chain` to `counter`, collecting the keys of any
    /// messages jumped over. Callers commit the returned state only after
    /// the message authenticates.
    fn advance_to(
        mut chain: ChainKey,
        counter: u32,
        ratchet_key: PublicKey,
    ) -> Result<(MessageKey, ChainKey, Vec<SkippedMessageKey>), RatchetError> {
        if counter - chain.index > MAX_MESSAGE_GAP {
            return Err(RatchetError::CounterOutOfRange);
        }
        let mut skipped = Vec::new();
        while chain.index < counter {
            skipped.push(SkippedMessageKey { ratchet_key, message_key: chain.message_key() });
            chain.advance();
        }
        let message_key = chain.message_key();
        chain.advance();
        Ok((message_key, chain, skipped))
    }

    fn decrypt_skipped(
        &mut self,
        ratchet_key: &PublicKey,
        counter: u32,
        message: &[u8],
        ciphertext: Range<usize>,
        plaintext: &mut [u8],
    ) -> Result<usize, RatchetError> {
        let position = self
            .skipped_message_keys
            .iter()
            .position(|skipped| {
                skipped.message_key.index == counter && skipped.ratchet_key == *ratchet_key
            })
            .ok_or(RatchetError::UnknownMessageIndex)?;

        let key = &self.skipped_message_keys[position].message_key.key;
        let length = self.cipher.decrypt(key, message, ciphertext, plaintext)?;
        self.skipped_message_keys.remove(position);
        Ok(length)
    }

    fn store_skipped(&mut self, skipped: Vec<SkippedMessageKey>) {
        if skipped.is_empty() {
            return;
        }
        tracing::debug!(count = skipped.len(), "storing skipped message keys");
        self.skipped_message_keys.extend(skipped);
        if self.skipped_message_keys.len() > MAX_SKIPPED_MESSAGE_KEYS {
            let excess = self.skipped_message_keys.len() - MAX_SKIPPED_MESSAGE_KEYS;
            self.skipped_message_keys.drain(..excess);
        }
    }

    pub(crate) fn pickle_length(&self) -> usize {
        let chain_length = KEY_LENGTH + 4 + 32;
        32 + 4
            + self.sender_chain.as_ref().map(|_| chain_length).unwrap_or(0)
            + 4
            + self.receiver_chains.len() * chain_length
            + 4
            + self.skipped_message_keys.len() * chain_length
    }

    pub(crate) fn pickle(&self, writer: &mut PickleWriter) {
        writer.bytes(&self.root_key);
        match &self.sender_chain {
            Some(chain) => {
                writer.u32(1);
                writer.secret_key(chain.ratchet_key.secret());
                writer.u32(chain.chain_key.index);
                writer.bytes(&chain.chain_key.key);
            }
            None => writer.u32(0),
        }
        writer.u32(self.receiver_chains.len() as u32);
        for chain in &self.receiver_chains {
            writer.public_key(&chain.ratchet_key);
            writer.u32(chain.chain_key.index);
            writer.bytes(&chain.chain_key.key);
        }
        writer.u32(self.skipped_message_keys.len() as u32);
        for skipped in &self.skipped_message_keys {
            writer.public_key(&skipped.ratchet_key);
            writer.u32(skipped.message_key.index);
            writer.bytes(&skipped.message_key.key);
        }
    }

    pub(crate) fn unpickle(&mut self, reader: &mut PickleReader<'_>) -> Result<(), PickleError> {
        self.root_key = reader.key()?;
        if reader.u32()? != 0 {
            let secret = reader.secret_key()?;
            let index = reader.u32()?;
            let key = reader.key()?;
            self.sender_chain = Some(SenderChain {
                ratchet_key: KeyPair::from_secret(secret),
                chain_key: ChainKey { index, key },
            });
        }
        for _ in 0..reader.u32()? {
            let ratchet_key = reader.public_key()?;
            let index = reader.u32()?;
            let key = reader.key()?;
            self.receiver_chains.push(ReceiverChain { ratchet_key, chain_key: ChainKey { index, key } });
        }
        for _ in 0..reader.u32()? {
            let ratchet_key = reader.public_key()?;
            let index = reader.u32()?;
            let key = reader.key()?;
            self.skipped_message_keys.push(SkippedMessageKey {
                ratchet_key,
                message_key: MessageKey { index, key },
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KDF_INFO: KdfInfo = KdfInfo { root: b"TEST_ROOT", ratchet: b"TEST_RATCHET" };
    const CIPHER_INFO: &[u8] = b"TEST_KEYS";

    fn ratchet_pair(shared_secret: &[u8]) -> (Ratchet, Ratchet) {
        let alice_key = KeyPair::from_seed(&[1u8; 32]);
        let alice_public = *alice_key.public_key();

        let mut alice = Ratchet::new(KDF_INFO, MessageCipher::new(CIPHER_INFO));
        alice.initialise_as_alice(shared_secret, alice_key);

        let mut bob = Ratchet::new(KDF_INFO, MessageCipher::new(CIPHER_INFO));
        bob.initialise_as_bob(shared_secret, alice_public);

        (alice, bob)
    }

    fn encrypt(ratchet: &mut Ratchet, plaintext: &[u8], random: &[u8]) -> Vec<u8> {
        let mut message = vec![0u8; ratchet.encrypt_output_length(plaintext.len())];
        let written = ratchet.encrypt(plaintext, random, &mut message).unwrap();
        assert_eq!(written, message.len());
        message
    }

    fn decrypt(ratchet: &mut Ratchet, message: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let mut plaintext = vec![0u8; ratchet.decrypt_max_plaintext_length(message)?];
        let length = ratchet.decrypt(message, &mut plaintext)?;
        plaintext.truncate(length);
        Ok(plaintext)
    }

    #[test]
    fn test_exchange_in_both_directions() {
        let (mut alice, mut bob) = ratchet_pair(&[3u8; 96]);

        assert_eq!(alice.encrypt_random_length(), 0);
        let message = encrypt(&mut alice, b"first", &[]);
        assert_eq!(decrypt(&mut bob, &message).unwrap(), b"first");

        assert_eq!(bob.encrypt_random_length(), 32);
        let reply = encrypt(&mut bob, b"second", &[4u8; 32]);
        assert_eq!(decrypt(&mut alice, &reply).unwrap(), b"second");

        // Alice's old sending chain died with the direction change.
        assert_eq!(alice.encrypt_random_length(), 32);
        let next = encrypt(&mut alice, b"third", &[5u8; 32]);
        assert_eq!(decrypt(&mut bob, &next).unwrap(), b"third");
    }

    #[test]
    fn test_out_of_order_messages_use_skipped_keys() {
        let (mut alice, mut bob) = ratchet_pair(&[3u8; 96]);

        let first = encrypt(&mut alice, b"zero", &[]);
        let second = encrypt(&mut alice, b"one", &[]);
        let third = encrypt(&mut alice, b"two", &[]);

        assert_eq!(decrypt(&mut bob, &third).unwrap(), b"two");
        assert_eq!(decrypt(&mut bob, &first).unwrap(), b"zero");
        assert_eq!(decrypt(&mut bob, &second).unwrap(), b"one");

        // Each skipped key is single use.
        assert_eq!(decrypt(&mut bob, &second), Err(RatchetError::UnknownMessageIndex));
    }

    #[test]
    fn test_tampered_message_does_not_advance_state() {
        let (mut alice, mut bob) = ratchet_pair(&[3u8; 96]);

        let mut message = encrypt(&mut alice, b"payload", &[]);
        let last = message.len() - 1;
        message[last] ^= 0x01;
        assert_eq!(decrypt(&mut bob, &message), Err(RatchetError::BadMessageMac));

        // The untampered original still decrypts.
        message[last] ^= 0x01;
        assert_eq!(decrypt(&mut bob, &message).unwrap(), b"payload");
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let (mut alice, mut bob) = ratchet_pair(&[3u8; 96]);

        let mut message = encrypt(&mut alice, b"payload", &[]);
        message[0] = 0x02;
        assert_eq!(decrypt(&mut bob, &message), Err(RatchetError::BadMessageVersion));
    }

    #[test]
    fn test_counter_gap_is_bounded() {
        let (alice, mut bob) = ratchet_pair(&[3u8; 96]);
        let alice_public = match &alice.sender_chain {
            Some(chain) => *chain.ratchet_key.public_key(),
            None => unreachable!(),
        };

        let length = message::message_length(MAX_MESSAGE_GAP + 1, KEY_LENGTH, 4, crate::cipher::MAC_LENGTH);
        let mut message = vec![0u8; length];
        message::encode_message(PROTOCOL_VERSION, MAX_MESSAGE_GAP + 1, alice_public.as_bytes(), 4, &mut message);

        let mut plaintext = vec![0u8; 4];
        assert_eq!(bob.decrypt(&message, &mut plaintext), Err(RatchetError::CounterOutOfRange));
    }

    #[test]
    fn test_pickle_round_trip_continues_the_conversation() {
        let (mut alice, mut bob) = ratchet_pair(&[3u8; 96]);

        let message = encrypt(&mut alice, b"before", &[]);
        assert_eq!(decrypt(&mut bob, &message).unwrap(), b"before");

        let mut writer = PickleWriter::new(bob.pickle_length());
        bob.pickle(&mut writer);
        let pickled = writer.finish();
        assert_eq!(pickled.len(), bob.pickle_length());

        let mut restored = Ratchet::new(KDF_INFO, MessageCipher::new(CIPHER_INFO));
        let mut reader = PickleReader::new(&pickled);
        restored.unpickle(&mut reader).unwrap();
        reader.finish().unwrap();

        let reply = encrypt(&mut restored, b"after", &[9u8; 32]);
        assert_eq!(decrypt(&mut alice, &reply).unwrap(), b"after");
    }
}
