//! Curve25519 key material for the session handshake and ratchet.
//!
//! Every key pair is built deterministically from a caller-supplied 32-byte
//! seed; the crate never reads a PRNG of its own.

use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

/// Length of a Curve25519 key, public or private.
pub const KEY_LENGTH: usize = 32;

/// A Curve25519 key pair.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Build a key pair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; KEY_LENGTH]) -> Self {
        let secret = StaticSecret::from(*seed);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from a stored private scalar.
    pub(crate) fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// X25519 shared secret with a remote public key.
    pub(crate) fn shared_secret(&self, their_public: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(their_public)
    }
}

/// A key pair held by the local device, addressed by identifier.
pub struct LocalKey {
    pub id: u32,
    pub key: KeyPair,
}

/// A public key belonging to a remote device, addressed by identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteKey {
    pub id: u32,
    pub key: PublicKey,
}

/// The single capability the session needs from the enclosing account:
/// looking up the one-time key pair a pre-key message names.
pub trait OneTimeKeyStore {
    fn one_time_key(&self, id: u32) -> Option<&KeyPair>;
}

impl OneTimeKeyStore for [LocalKey] {
    fn one_time_key(&self, id: u32) -> Option<&KeyPair> {
        self.iter().find(|key| key.id == id).map(|key| &key.key)
    }
}

impl OneTimeKeyStore for Vec<LocalKey> {
    fn one_time_key(&self, id: u32) -> Option<&KeyPair> {
        self.as_slice().one_time_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_from_seed_is_deterministic() {
        let a = KeyPair::from_seed(&[7u8; 32]);
        let b = KeyPair::from_seed(&[7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());

        let c = KeyPair::from_seed(&[8u8; 32]);
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        let a = KeyPair::from_seed(&[1u8; 32]);
        let b = KeyPair::from_seed(&[2u8; 32]);

        let ab = a.shared_secret(b.public_key());
        let ba = b.shared_secret(a.public_key());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_one_time_key_lookup() {
        let store = vec![
            LocalKey { id: 1, key: KeyPair::from_seed(&[1u8; 32]) },
            LocalKey { id: 9, key: KeyPair::from_seed(&[9u8; 32]) },
        ];

        let found = store.one_time_key(9).unwrap();
        assert_eq!(found.public_key(), KeyPair::from_seed(&[9u8; 32]).public_key());
        assert!(store.one_time_key(2).is_none());
    }
}
