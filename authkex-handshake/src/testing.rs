//! Deterministic crypto provider and the server half of the protocol,
//! for this crate's unit tests and downstream integration tests.
//!
//! [`TestCrypto`] implements the full [`CryptoProvider`] contract with
//! real primitives where they are cheap (BLAKE2s hashing, x25519
//! sealing, ChaCha20-Poly1305 symmetric encryption) and a fixed 61-bit
//! Mersenne-prime group for the DH arithmetic, which keeps modular
//! exponentiation in `u128` range. [`ScriptedServer`] answers the three
//! client messages the way a well-behaved server would; tests tamper
//! with its replies to exercise the failure paths.

use blake2::{Blake2s256, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce as AeadNonce};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use x25519_dalek::{PublicKey as DhPublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::{
    confirm_hash, derive_temp_key, CryptoProvider, HandshakeContext, ServerKey,
    ServerKeyDirectory, TempKey, HASH_LEN,
};
use crate::error::Error;
use crate::messages::{
    ClientDhInner, ClientDhParams, DhConfirm, DhParamsAnswer, DhParamsRequest, DhParamsResponse,
    Message, Nonce,
    PqProof, PqResponse, SecretNonce,
};

/// The accepted test group: 2^61 - 1 (a Mersenne prime), generator 3.
const GROUP_PRIME: u64 = (1 << 61) - 1;
const GROUP_PRIME_BYTES: [u8; 8] = GROUP_PRIME.to_be_bytes();

/// Big-endian bytes of the accepted test group prime.
pub const TEST_GROUP_PRIME: &[u8] = &GROUP_PRIME_BYTES;

/// Generator of the accepted test group.
pub const TEST_GROUP_GENERATOR: u32 = 3;

/// Factoring challenge used by the scripted server.
const CHALLENGE_P: u32 = 10_007;
const CHALLENGE_Q: u32 = 10_009;

/// Server clock sample reported in the DH answer.
const SERVER_TIME: u64 = 1_754_000_000;

/// All-zero nonce for the sealing cipher; each sealing key is single-use.
const SEAL_NONCE: [u8; 12] = [0u8; 12];

/// Deterministic [`CryptoProvider`] seeded for reproducible tests.
pub struct TestCrypto {
    rng: StdRng,
}

impl TestCrypto {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl CryptoProvider for TestCrypto {
    fn fill_random(&mut self, out: &mut [u8]) {
        self.rng.fill_bytes(out);
    }

    fn hash(&self, parts: &[&[u8]]) -> [u8; HASH_LEN] {
        hash_parts(parts)
    }

    fn factor_semiprime(&self, pq: u64) -> Result<(u32, u32), Error> {
        if pq < 4 {
            return Err(Error::CryptoFailed);
        }
        let mut d = 2u64;
        while d * d <= pq {
            if pq % d == 0 {
                let (p, q) = (d, pq / d);
                let p = u32::try_from(p).map_err(|_| Error::CryptoFailed)?;
                let q = u32::try_from(q).map_err(|_| Error::CryptoFailed)?;
                return Ok((p, q));
            }
            d += 1;
        }
        Err(Error::CryptoFailed)
    }

    fn validate_group(&self, prime: &[u8], g: u32) -> bool {
        // The accepted group is a whitelist, the way production clients
        // pin known-good primes rather than re-proving primality.
        prime == TEST_GROUP_PRIME && (2..=7).contains(&g)
    }

    fn mod_exp(&self, base: &[u8], exponent: &[u8], modulus: &[u8]) -> Vec<u8> {
        let modulus = be_to_u64(modulus);
        if modulus <= 1 {
            return vec![0];
        }
        let base = be_reduce(base, modulus);
        let mut result: u64 = 1;
        for byte in exponent {
            for bit in (0..8).rev() {
                result = mul_mod(result, result, modulus);
                if byte >> bit & 1 == 1 {
                    result = mul_mod(result, base, modulus);
                }
            }
        }
        to_be_minimal(result)
    }

    fn seal_to_key(&mut self, key: &ServerKey, plaintext: &[u8]) -> Vec<u8> {
        let ephemeral = StaticSecret::random_from_rng(&mut self.rng);
        let ephemeral_public = DhPublicKey::from(&ephemeral);
        let server_public = public_from_bytes(key.public());
        let shared = ephemeral.diffie_hellman(&server_public);

        let sealing_key = seal_key(shared.as_bytes(), ephemeral_public.as_bytes(), key.public());
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&sealing_key));
        let ciphertext = cipher
            .encrypt(AeadNonce::from_slice(&SEAL_NONCE), plaintext)
            .expect("sealing never fails for in-memory plaintext");

        let mut out = ephemeral_public.as_bytes().to_vec();
        out.extend_from_slice(&ciphertext);
        out
    }

    fn encrypt(&mut self, key: &TempKey, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; 12];
        self.rng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let ciphertext = cipher
            .encrypt(AeadNonce::from_slice(&nonce), plaintext)
            .expect("encryption never fails for in-memory plaintext");

        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        out
    }

    fn decrypt(&self, key: &TempKey, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        if ciphertext.len() < 12 {
            return Err(Error::CryptoFailed);
        }
        let (nonce, body) = ciphertext.split_at(12);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        cipher
            .decrypt(AeadNonce::from_slice(nonce), body)
            .map_err(|_| Error::CryptoFailed)
    }
}

/// Generate a server keypair; the fingerprint is derived from the hash
/// of the public key, the same way a directory entry would be built.
pub fn test_server_key(seed: u64) -> (StaticSecret, ServerKey) {
    let mut rng = StdRng::seed_from_u64(seed);
    let secret = StaticSecret::random_from_rng(&mut rng);
    let public = DhPublicKey::from(&secret).as_bytes().to_vec();
    let fingerprint = fingerprint_of(&public);
    (secret, ServerKey::new(public, fingerprint))
}

/// A ready-made client context plus the matching scripted server.
pub fn test_context() -> (HandshakeContext, ScriptedServer) {
    let (secret, key) = test_server_key(7);
    let directory = ServerKeyDirectory::new(vec![key.clone()]);
    let ctx = HandshakeContext::new(Box::new(TestCrypto::seeded(1)), directory);
    let server = ScriptedServer::new(2, secret, key);
    (ctx, server)
}

/// The server half of the handshake, answering one message at a time.
///
/// Panics on messages a well-behaved client would never send; tests
/// that need hostile *server* behavior tamper with the replies instead.
pub struct ScriptedServer {
    crypto: TestCrypto,
    secret: StaticSecret,
    key: ServerKey,
    g: u32,
    prime: Vec<u8>,
    forced_public: Option<Vec<u8>>,
    client_nonce: Nonce,
    server_nonce: Nonce,
    secret_nonce: SecretNonce,
    temp_key: Option<TempKey>,
    exponent: Zeroizing<[u8; 32]>,
    derived: Vec<u8>,
}

impl ScriptedServer {
    pub fn new(seed: u64, secret: StaticSecret, key: ServerKey) -> Self {
        Self {
            crypto: TestCrypto::seeded(seed),
            secret,
            key,
            g: TEST_GROUP_GENERATOR,
            prime: TEST_GROUP_PRIME.to_vec(),
            forced_public: None,
            client_nonce: Nonce::default(),
            server_nonce: Nonce::default(),
            secret_nonce: SecretNonce::default(),
            temp_key: None,
            exponent: Zeroizing::new([0u8; 32]),
            derived: Vec::new(),
        }
    }

    /// Advertise a different generator in the DH answer.
    pub fn use_generator(&mut self, g: u32) {
        self.g = g;
    }

    /// Advertise a different prime in the DH answer.
    pub fn use_prime(&mut self, prime: Vec<u8>) {
        self.prime = prime;
    }

    /// Send a fixed public value instead of `g^a`.
    pub fn use_public_value(&mut self, g_a: Vec<u8>) {
        self.forced_public = Some(g_a);
    }

    /// The key the server derived, empty until the exchange completes.
    pub fn derived_key(&self) -> &[u8] {
        &self.derived
    }

    pub fn respond(&mut self, message: &Message) -> Message {
        match message {
            Message::PqRequest(m) => {
                self.client_nonce = m.client_nonce;
                self.crypto.fill_random(&mut self.server_nonce);
                Message::PqResponse(PqResponse {
                    client_nonce: self.client_nonce,
                    server_nonce: self.server_nonce,
                    pq: u64::from(CHALLENGE_P) * u64::from(CHALLENGE_Q),
                    fingerprints: vec![self.key.fingerprint()],
                })
            }
            Message::DhParamsRequest(m) => self.respond_dh_params(m),
            Message::ClientDhParams(m) => self.respond_confirm(m),
            other => panic!("scripted server cannot answer {}", other.kind()),
        }
    }

    fn respond_dh_params(&mut self, m: &DhParamsRequest) -> Message {
        assert_eq!(m.client_nonce, self.client_nonce);
        assert_eq!(m.server_nonce, self.server_nonce);
        assert_eq!((m.p, m.q), (CHALLENGE_P, CHALLENGE_Q));
        assert_eq!(m.fingerprint, self.key.fingerprint());

        let plaintext = open_sealed(&self.secret, self.key.public(), &m.sealed_proof)
            .expect("client proof should open with the server secret");
        let proof = PqProof::decode(&plaintext).expect("client proof should decode");
        assert_eq!(proof.client_nonce, self.client_nonce);
        assert_eq!(proof.server_nonce, self.server_nonce);
        self.secret_nonce = proof.secret_nonce;

        let temp_key = derive_temp_key(&self.crypto, &self.secret_nonce, &self.server_nonce);
        self.crypto.fill_random(&mut *self.exponent);
        let g_a = self
            .crypto
            .mod_exp(&self.g.to_be_bytes(), &*self.exponent, &self.prime);

        let answer = DhParamsAnswer {
            client_nonce: self.client_nonce,
            server_nonce: self.server_nonce,
            g: self.g,
            prime: self.prime.clone(),
            g_a: self.forced_public.clone().unwrap_or(g_a),
            server_time: SERVER_TIME,
        };
        let encrypted_answer = self.crypto.encrypt(&temp_key, &answer.encode());
        self.temp_key = Some(temp_key);

        Message::DhParamsResponse(DhParamsResponse {
            client_nonce: self.client_nonce,
            server_nonce: self.server_nonce,
            encrypted_answer,
        })
    }

    fn respond_confirm(&mut self, m: &ClientDhParams) -> Message {
        assert_eq!(m.client_nonce, self.client_nonce);
        assert_eq!(m.server_nonce, self.server_nonce);
        let temp_key = self
            .temp_key
            .as_ref()
            .expect("client DH params arrive after the DH answer");

        let plaintext = self
            .crypto
            .decrypt(temp_key, &m.encrypted_inner)
            .expect("client DH payload should decrypt");
        let inner = ClientDhInner::decode(&plaintext).expect("client DH payload should decode");
        assert_eq!(inner.client_nonce, self.client_nonce);
        assert_eq!(inner.server_nonce, self.server_nonce);

        self.derived = self.crypto.mod_exp(&inner.g_b, &*self.exponent, &self.prime);
        let key_hash = self.crypto.hash(&[&self.derived]);

        Message::DhConfirm(DhConfirm {
            client_nonce: self.client_nonce,
            server_nonce: self.server_nonce,
            confirm_hash: confirm_hash(&self.crypto, &self.secret_nonce, &key_hash),
        })
    }
}

fn hash_parts(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

fn fingerprint_of(public: &[u8]) -> u64 {
    let digest = hash_parts(&[public]);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn public_from_bytes(bytes: &[u8]) -> DhPublicKey {
    let array: [u8; 32] = bytes
        .try_into()
        .expect("test server keys are 32-byte x25519 keys");
    DhPublicKey::from(array)
}

fn seal_key(shared: &[u8], ephemeral_public: &[u8], server_public: &[u8]) -> [u8; HASH_LEN] {
    hash_parts(&[b"authkex seal v1", shared, ephemeral_public, server_public])
}

/// Open a payload sealed with [`CryptoProvider::seal_to_key`].
pub fn open_sealed(
    secret: &StaticSecret,
    server_public: &[u8],
    sealed: &[u8],
) -> Result<Vec<u8>, Error> {
    if sealed.len() < 32 {
        return Err(Error::CryptoFailed);
    }
    let (ephemeral_public, ciphertext) = sealed.split_at(32);
    let shared = secret.diffie_hellman(&public_from_bytes(ephemeral_public));

    let key = seal_key(shared.as_bytes(), ephemeral_public, server_public);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(AeadNonce::from_slice(&SEAL_NONCE), ciphertext)
        .map_err(|_| Error::CryptoFailed)
}

/// Parse a big-endian byte string, saturating at `u64::MAX`. Every value
/// the test group produces fits in 64 bits.
fn be_to_u64(bytes: &[u8]) -> u64 {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let stripped = &bytes[start..];
    if stripped.len() > 8 {
        return u64::MAX;
    }
    stripped
        .iter()
        .fold(0u64, |acc, byte| acc << 8 | u64::from(*byte))
}

/// Reduce a big-endian byte string modulo `m` (`m > 1`).
fn be_reduce(bytes: &[u8], m: u64) -> u64 {
    let mut acc: u128 = 0;
    for byte in bytes {
        acc = (acc << 8 | u128::from(*byte)) % u128::from(m);
    }
    acc as u64
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    (u128::from(a) * u128::from(b) % u128::from(m)) as u64
}

fn to_be_minimal(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(7);
    bytes[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mod_exp_matches_known_values() {
        let crypto = TestCrypto::seeded(0);
        // 3^5 mod 2^61-1 = 243
        let result = crypto.mod_exp(&3u32.to_be_bytes(), &[5], TEST_GROUP_PRIME);
        assert_eq!(result, vec![243]);
        // Fermat: g^(p-1) = 1 mod p for prime p.
        let exp = (GROUP_PRIME - 1).to_be_bytes();
        let result = crypto.mod_exp(&3u32.to_be_bytes(), &exp, TEST_GROUP_PRIME);
        assert_eq!(result, vec![1]);
    }

    #[test]
    fn dh_agreement_holds_in_the_test_group() {
        let mut crypto = TestCrypto::seeded(42);
        let g = TEST_GROUP_GENERATOR.to_be_bytes();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        crypto.fill_random(&mut a);
        crypto.fill_random(&mut b);

        let g_a = crypto.mod_exp(&g, &a, TEST_GROUP_PRIME);
        let g_b = crypto.mod_exp(&g, &b, TEST_GROUP_PRIME);
        let k_ab = crypto.mod_exp(&g_b, &a, TEST_GROUP_PRIME);
        let k_ba = crypto.mod_exp(&g_a, &b, TEST_GROUP_PRIME);
        assert_eq!(k_ab, k_ba);
    }

    #[test]
    fn sealing_round_trips_only_with_the_right_secret() {
        let (secret, key) = test_server_key(1);
        let (wrong_secret, _) = test_server_key(2);
        let mut crypto = TestCrypto::seeded(3);

        let sealed = crypto.seal_to_key(&key, b"proof payload");
        assert_eq!(
            open_sealed(&secret, key.public(), &sealed).unwrap(),
            b"proof payload"
        );
        assert!(open_sealed(&wrong_secret, key.public(), &sealed).is_err());
    }

    #[test]
    fn symmetric_round_trip_and_tamper_detection() {
        let mut crypto = TestCrypto::seeded(4);
        let temp_key = TempKey::from_bytes([7u8; 32]);

        let mut ciphertext = crypto.encrypt(&temp_key, b"group parameters");
        assert_eq!(
            crypto.decrypt(&temp_key, &ciphertext).unwrap(),
            b"group parameters"
        );

        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 1;
        assert_eq!(
            crypto.decrypt(&temp_key, &ciphertext),
            Err(Error::CryptoFailed)
        );
    }

    #[test]
    fn factoring_recovers_the_challenge_primes() {
        let crypto = TestCrypto::seeded(0);
        let pq = u64::from(CHALLENGE_P) * u64::from(CHALLENGE_Q);
        assert_eq!(crypto.factor_semiprime(pq), Ok((CHALLENGE_P, CHALLENGE_Q)));
        assert_eq!(crypto.factor_semiprime(3), Err(Error::CryptoFailed));
    }
}
