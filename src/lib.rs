//! Olm session core.
//!
//! Provides the session state machine of the Olm double-ratchet protocol:
//! the X3DH-style handshake over two identity keys, an ephemeral base key,
//! and a one-time key; pre-key and steady-state message envelopes; and
//! binary persistence of session state.
//!
//! The caller supplies all randomness and owns all buffers; the core
//! performs no I/O and reads no clock or PRNG. Sessions are single-owner
//! and not internally synchronised.

pub mod cipher;
pub mod keys;
pub mod message;
pub mod pickle;
pub mod ratchet;
pub mod session;

// Re-export the session surface.
pub use keys::{KeyPair, LocalKey, OneTimeKeyStore, RemoteKey, KEY_LENGTH};
pub use pickle::PickleError;
pub use ratchet::{Ratchet, RatchetError};
pub use session::{MessageType, Session, SessionError};
