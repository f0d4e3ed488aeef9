#![deny(unsafe_code)]

//! # authkex-handshake
//!
//! Sans-IO client state machine for the authkex authentication-key
//! handshake: a Diffie-Hellman-based mutual-authentication exchange that
//! derives a shared secret key bound to a trusted server public key.
//!
//! The crate holds protocol logic only. Bytes, scheduling, and deadlines
//! belong to `authkex-actor`; concrete cryptography (hashing, sealing,
//! factoring, modular exponentiation) is supplied by the embedder
//! through [`CryptoProvider`].
//!
//! ## Exchange shape
//!
//! ```text
//! Client                                    Server
//!   │  pq_request(client_nonce)               │
//!   │ ───────────────────────────────────────►│
//!   │        pq_response(nonces, pq, fprints) │
//!   │ ◄───────────────────────────────────────│
//!   │  dh_params_request(factors, sealed)     │
//!   │ ───────────────────────────────────────►│
//!   │        dh_params_response(enc. group)   │
//!   │ ◄───────────────────────────────────────│
//!   │  client_dh_params(enc. g^b)             │
//!   │ ───────────────────────────────────────►│
//!   │        dh_confirm(confirmation hash)    │
//!   │ ◄───────────────────────────────────────│
//! ```

pub mod crypto;
pub mod error;
pub mod messages;

mod handshake;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crypto::{
    CryptoProvider, HandshakeContext, KeyMaterial, ServerKey, ServerKeyDirectory, TempKey,
    HASH_LEN, TEMP_KEY_LEN,
};
pub use error::Error;
pub use handshake::{AuthKeyHandshake, Stage, ACCEPTED_GENERATORS};
