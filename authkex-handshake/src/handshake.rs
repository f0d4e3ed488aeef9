//! The authentication-key handshake state machine.
//!
//! Pure protocol logic: consumes decoded [`Message`]s, queues outgoing
//! ones, and walks the stage sequence forward until a key is derived or
//! a validation fails. All I/O, framing, and scheduling live elsewhere;
//! all concrete cryptography goes through the [`HandshakeContext`]
//! lent by the caller on every [`AuthKeyHandshake::apply_incoming`] call.

use core::cmp::Ordering;

use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{
    confirm_hash, derive_temp_key, key_id_from_hash, HandshakeContext, KeyMaterial,
};
use crate::error::Error;
use crate::messages::{
    ClientDhInner, ClientDhParams, DhConfirm, DhParamsAnswer, DhParamsRequest, DhParamsResponse,
    Message, Nonce, PqProof, PqRequest, PqResponse, SecretNonce,
};

/// Generators the client is willing to accept in a DH params answer.
pub const ACCEPTED_GENERATORS: core::ops::RangeInclusive<u32> = 2..=7;

/// Byte length of the client's random DH exponent.
const EXPONENT_LEN: usize = 32;

/// Stages advance strictly forward in this order, or jump to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    SentPqRequest,
    GotServerPq,
    SentDhParamsRequest,
    GotServerDhParams,
    SentClientDhParams,
    Confirmed,
    Failed,
}

/// Group parameters held only between the DH answer and confirmation.
struct EphemeralDh {
    prime: Vec<u8>,
    g_a: Vec<u8>,
    /// Own secret exponent; wiped on drop.
    b: Zeroizing<Vec<u8>>,
}

/// Client side of the authentication-key handshake.
pub struct AuthKeyHandshake {
    stage: Stage,
    client_nonce: Nonce,
    server_nonce: Nonce,
    secret_nonce: SecretNonce,
    fingerprint: Option<u64>,
    dh: Option<EphemeralDh>,
    derived_key: Option<KeyMaterial>,
    server_time: Option<u64>,
    pending_out: Option<Message>,
}

impl Drop for AuthKeyHandshake {
    fn drop(&mut self) {
        self.secret_nonce.zeroize();
    }
}

impl core::fmt::Debug for AuthKeyHandshake {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Redacts secret material (secret nonce, DH exponent, derived
        // key) to preserve the crate's zeroize hygiene.
        f.debug_struct("AuthKeyHandshake")
            .field("stage", &self.stage)
            .field("fingerprint", &self.fingerprint)
            .field("server_time", &self.server_time)
            .field("has_dh", &self.dh.is_some())
            .field("has_derived_key", &self.derived_key.is_some())
            .finish_non_exhaustive()
    }
}

impl AuthKeyHandshake {
    /// Create a handshake with a fresh client nonce and the opening
    /// request already queued.
    pub fn new(ctx: &mut HandshakeContext) -> Self {
        let mut client_nonce = Nonce::default();
        ctx.provider_mut().fill_random(&mut client_nonce);

        Self {
            stage: Stage::Start,
            client_nonce,
            server_nonce: Nonce::default(),
            secret_nonce: SecretNonce::default(),
            fingerprint: None,
            dh: None,
            derived_key: None,
            server_time: None,
            pending_out: Some(Message::PqRequest(PqRequest { client_nonce })),
        }
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// True only once the confirmation hash has been verified.
    pub fn is_ready_for_finish(&self) -> bool {
        self.stage == Stage::Confirmed
    }

    /// The server clock sample from the DH answer, once seen.
    pub fn server_time(&self) -> Option<u64> {
        self.server_time
    }

    /// Fingerprint of the server key the exchange was sealed to.
    pub fn key_fingerprint(&self) -> Option<u64> {
        self.fingerprint
    }

    /// Take the derived key material. Present only at `Confirmed`, and
    /// only until taken.
    pub fn take_derived_key(&mut self) -> Option<KeyMaterial> {
        self.derived_key.take()
    }

    /// The next message to put on the wire, if one is queued. Handing a
    /// message over advances the corresponding `Sent*` stage.
    pub fn next_outgoing(&mut self) -> Option<Message> {
        let message = self.pending_out.take()?;
        self.stage = match self.stage {
            Stage::Start => Stage::SentPqRequest,
            Stage::GotServerPq => Stage::SentDhParamsRequest,
            Stage::GotServerDhParams => Stage::SentClientDhParams,
            other => other,
        };
        Some(message)
    }

    /// Validate and apply one incoming message.
    ///
    /// Terminal stages never mutate: a message arriving in `Confirmed`
    /// or `Failed` is rejected and the stage (and any derived key) is
    /// left untouched. Every other validation failure moves the stage
    /// to `Failed` and discards intermediate secrets.
    pub fn apply_incoming(
        &mut self,
        message: Message,
        ctx: &mut HandshakeContext,
    ) -> Result<(), Error> {
        if matches!(self.stage, Stage::Confirmed | Stage::Failed) {
            return Err(Error::UnexpectedMessage);
        }

        let result = match (self.stage, message) {
            (Stage::SentPqRequest, Message::PqResponse(m)) => self.on_pq_response(m, ctx),
            (Stage::SentDhParamsRequest, Message::DhParamsResponse(m)) => {
                self.on_dh_params_response(m, ctx)
            }
            (Stage::SentClientDhParams, Message::DhConfirm(m)) => self.on_dh_confirm(m, ctx),
            _ => Err(Error::UnexpectedMessage),
        };

        if result.is_err() {
            self.stage = Stage::Failed;
            self.dh = None;
            self.pending_out = None;
        }
        result
    }

    /// Server PQ response: bind the server nonce, factor the challenge,
    /// and queue the sealed DH-params request.
    fn on_pq_response(&mut self, m: PqResponse, ctx: &mut HandshakeContext) -> Result<(), Error> {
        if m.client_nonce != self.client_nonce {
            return Err(Error::NonceMismatch);
        }
        self.server_nonce = m.server_nonce;

        let (p, q) = ctx.provider().factor_semiprime(m.pq)?;
        if p <= 1 || p >= q || u64::from(p) * u64::from(q) != m.pq {
            return Err(Error::BadChallenge);
        }

        let server_key = ctx
            .server_keys()
            .select(&m.fingerprints)
            .cloned()
            .ok_or(Error::UnknownFingerprint)?;

        ctx.provider_mut().fill_random(&mut self.secret_nonce);
        let proof = PqProof {
            pq: m.pq,
            p,
            q,
            client_nonce: self.client_nonce,
            server_nonce: self.server_nonce,
            secret_nonce: self.secret_nonce,
        };
        let sealed_proof = ctx.provider_mut().seal_to_key(&server_key, &proof.encode());

        self.fingerprint = Some(server_key.fingerprint());
        self.pending_out = Some(Message::DhParamsRequest(DhParamsRequest {
            client_nonce: self.client_nonce,
            server_nonce: self.server_nonce,
            p,
            q,
            fingerprint: server_key.fingerprint(),
            sealed_proof,
        }));
        self.stage = Stage::GotServerPq;
        Ok(())
    }

    /// Server DH answer: decrypt, validate the group, and queue our own
    /// public value.
    fn on_dh_params_response(
        &mut self,
        m: DhParamsResponse,
        ctx: &mut HandshakeContext,
    ) -> Result<(), Error> {
        if m.client_nonce != self.client_nonce || m.server_nonce != self.server_nonce {
            return Err(Error::NonceMismatch);
        }

        let temp_key = derive_temp_key(ctx.provider(), &self.secret_nonce, &self.server_nonce);
        let plaintext = ctx.provider().decrypt(&temp_key, &m.encrypted_answer)?;
        let answer = DhParamsAnswer::decode(&plaintext)?;

        if answer.client_nonce != self.client_nonce || answer.server_nonce != self.server_nonce {
            return Err(Error::NonceMismatch);
        }
        if !ACCEPTED_GENERATORS.contains(&answer.g) {
            return Err(Error::DhParamsRejected);
        }
        if !ctx.provider().validate_group(&answer.prime, answer.g) {
            return Err(Error::DhParamsRejected);
        }
        if !value_in_group(&answer.g_a, &answer.prime) {
            return Err(Error::DhParamsRejected);
        }
        self.server_time = Some(answer.server_time);

        let mut b = Zeroizing::new(vec![0u8; EXPONENT_LEN]);
        ctx.provider_mut().fill_random(&mut b[..]);
        let g_bytes = answer.g.to_be_bytes();
        let g_b = ctx.provider().mod_exp(&g_bytes, &b, &answer.prime);

        let inner = ClientDhInner {
            client_nonce: self.client_nonce,
            server_nonce: self.server_nonce,
            g_b,
        };
        let encrypted_inner = ctx.provider_mut().encrypt(&temp_key, &inner.encode());

        self.dh = Some(EphemeralDh {
            prime: answer.prime,
            g_a: answer.g_a,
            b,
        });
        self.pending_out = Some(Message::ClientDhParams(ClientDhParams {
            client_nonce: self.client_nonce,
            server_nonce: self.server_nonce,
            encrypted_inner,
        }));
        self.stage = Stage::GotServerDhParams;
        Ok(())
    }

    /// Server confirmation: derive the key and verify the hash binds the
    /// same key on both ends.
    fn on_dh_confirm(&mut self, m: DhConfirm, ctx: &mut HandshakeContext) -> Result<(), Error> {
        if m.client_nonce != self.client_nonce || m.server_nonce != self.server_nonce {
            return Err(Error::NonceMismatch);
        }
        let dh = self.dh.as_ref().ok_or(Error::UnexpectedMessage)?;

        let key = ctx.provider().mod_exp(&dh.g_a, &dh.b, &dh.prime);
        let key_hash = ctx.provider().hash(&[&key]);
        let expected = confirm_hash(ctx.provider(), &self.secret_nonce, &key_hash);

        if !bool::from(expected.ct_eq(&m.confirm_hash)) {
            return Err(Error::ConfirmMismatch);
        }

        self.derived_key = Some(KeyMaterial::new(key, key_id_from_hash(&key_hash)));
        self.dh = None;
        self.stage = Stage::Confirmed;
        Ok(())
    }
}

/// Numeric comparison of big-endian byte strings, ignoring leading zeros.
fn compare_be(a: &[u8], b: &[u8]) -> Ordering {
    let a = strip_leading_zeros(a);
    let b = strip_leading_zeros(b);
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// A public DH value must satisfy `1 < value < prime`.
fn value_in_group(value: &[u8], prime: &[u8]) -> bool {
    compare_be(value, &[1]) == Ordering::Greater && compare_be(value, prime) == Ordering::Less
}
