//! The crypto-primitives seam and key-material types.
//!
//! The state machine performs no concrete cryptography itself; everything
//! number-theoretic or cipher-shaped goes through [`CryptoProvider`], which
//! the embedder supplies. A deterministic provider for tests lives in
//! [`crate::testing`].

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::Error;

/// Output length of the provider hash.
pub const HASH_LEN: usize = 32;

/// Length of the temporary symmetric key used mid-handshake.
pub const TEMP_KEY_LEN: usize = 32;

/// Cryptographic capability consumed by the handshake state machine.
///
/// Implementations must be deterministic given their random source; the
/// state machine never retries a failed primitive.
pub trait CryptoProvider {
    /// Fill `out` with cryptographically secure random bytes.
    fn fill_random(&mut self, out: &mut [u8]);

    /// Hash the concatenation of `parts`.
    fn hash(&self, parts: &[&[u8]]) -> [u8; HASH_LEN];

    /// Factor a semiprime challenge into `(p, q)` with `p < q`.
    fn factor_semiprime(&self, pq: u64) -> Result<(u32, u32), Error>;

    /// Whether `prime` is an accepted safe prime for generator `g`.
    fn validate_group(&self, prime: &[u8], g: u32) -> bool;

    /// Compute `base ^ exponent mod modulus` over big-endian byte strings.
    fn mod_exp(&self, base: &[u8], exponent: &[u8], modulus: &[u8]) -> Vec<u8>;

    /// Seal `plaintext` so that only the holder of `key`'s private half
    /// can open it.
    fn seal_to_key(&mut self, key: &ServerKey, plaintext: &[u8]) -> Vec<u8>;

    /// Symmetric encryption with a mid-handshake temporary key.
    fn encrypt(&mut self, key: &TempKey, plaintext: &[u8]) -> Vec<u8>;

    /// Inverse of [`CryptoProvider::encrypt`].
    fn decrypt(&self, key: &TempKey, ciphertext: &[u8]) -> Result<Vec<u8>, Error>;
}

/// A trusted server public key together with its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKey {
    public: Vec<u8>,
    fingerprint: u64,
}

impl ServerKey {
    pub fn new(public: Vec<u8>, fingerprint: u64) -> Self {
        Self {
            public,
            fingerprint,
        }
    }

    pub fn public(&self) -> &[u8] {
        &self.public
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

/// Directory of server public keys the client is willing to trust.
#[derive(Debug, Clone, Default)]
pub struct ServerKeyDirectory {
    keys: Vec<ServerKey>,
}

impl ServerKeyDirectory {
    pub fn new(keys: Vec<ServerKey>) -> Self {
        Self { keys }
    }

    pub fn add(&mut self, key: ServerKey) {
        self.keys.push(key);
    }

    /// The first advertised fingerprint with a trusted key, in the
    /// server's preference order.
    pub fn select(&self, advertised: &[u64]) -> Option<&ServerKey> {
        advertised
            .iter()
            .find_map(|fp| self.keys.iter().find(|key| key.fingerprint == *fp))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Temporary symmetric key derived from the session nonces; wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TempKey([u8; TEMP_KEY_LEN]);

impl TempKey {
    pub fn from_bytes(bytes: [u8; TEMP_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TEMP_KEY_LEN] {
        &self.0
    }
}

/// The handshake's product: key bytes plus a short identifier derived
/// from the key hash. Key bytes are wiped on drop.
pub struct KeyMaterial {
    key: Zeroizing<Vec<u8>>,
    key_id: u64,
}

impl KeyMaterial {
    pub(crate) fn new(key: Vec<u8>, key_id: u64) -> Self {
        Self {
            key: Zeroizing::new(key),
            key_id,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn key_id(&self) -> u64 {
        self.key_id
    }
}

// Key bytes stay out of logs and panic messages.
impl core::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("key_len", &self.key.len())
            .finish()
    }
}

/// Context string mixed into the temporary-key derivation.
const TEMP_KEY_CONTEXT: &[u8] = b"authkex temp key v1";

/// Temporary key bound to the sealed secret nonce and the server nonce.
/// Both ends derive it independently once the proof payload is open.
pub(crate) fn derive_temp_key(
    provider: &dyn CryptoProvider,
    secret_nonce: &[u8],
    server_nonce: &[u8],
) -> TempKey {
    TempKey::from_bytes(provider.hash(&[TEMP_KEY_CONTEXT, secret_nonce, server_nonce]))
}

/// The confirmation hash binds the secret nonce to the derived key.
pub(crate) fn confirm_hash(
    provider: &dyn CryptoProvider,
    secret_nonce: &[u8],
    key_hash: &[u8; HASH_LEN],
) -> [u8; HASH_LEN] {
    provider.hash(&[secret_nonce, &[0x01], &key_hash[..8]])
}

/// Short key identifier: the first eight bytes of the key hash.
pub(crate) fn key_id_from_hash(key_hash: &[u8; HASH_LEN]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key_hash[..8]);
    u64::from_le_bytes(bytes)
}

/// Everything the state machine needs to decode and encode messages:
/// the crypto capability and the trusted key directory.
pub struct HandshakeContext {
    provider: Box<dyn CryptoProvider>,
    server_keys: ServerKeyDirectory,
}

impl HandshakeContext {
    pub fn new(provider: Box<dyn CryptoProvider>, server_keys: ServerKeyDirectory) -> Self {
        Self {
            provider,
            server_keys,
        }
    }

    pub fn provider_mut(&mut self) -> &mut dyn CryptoProvider {
        self.provider.as_mut()
    }

    pub fn provider(&self) -> &dyn CryptoProvider {
        self.provider.as_ref()
    }

    pub fn server_keys(&self) -> &ServerKeyDirectory {
        &self.server_keys
    }
}
