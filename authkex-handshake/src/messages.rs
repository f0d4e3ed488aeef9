//! Protocol messages and their byte codec.
//!
//! Six messages cross the wire during a handshake, three in each
//! direction, plus two inner payloads that only ever travel encrypted
//! (the sealed proof inside [`DhParamsRequest`] and the group answer
//! inside [`DhParamsResponse`]). The layout here is the subsystem's own
//! versioned schema; nothing outside this module touches raw bytes.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;

/// Length of the client and server session nonces.
pub const NONCE_LEN: usize = 16;

/// Length of the secret nonce carried only inside the sealed proof.
pub const SECRET_NONCE_LEN: usize = 32;

/// Session nonce, echoed by every message after the first.
pub type Nonce = [u8; NONCE_LEN];

/// Secret nonce, never transmitted in the clear.
pub type SecretNonce = [u8; SECRET_NONCE_LEN];

const TAG_PQ_REQUEST: u8 = 0x61;
const TAG_PQ_RESPONSE: u8 = 0x62;
const TAG_DH_PARAMS_REQUEST: u8 = 0x63;
const TAG_DH_PARAMS_RESPONSE: u8 = 0x64;
const TAG_CLIENT_DH_PARAMS: u8 = 0x65;
const TAG_DH_CONFIRM: u8 = 0x66;

/// First message: client opens the exchange with a fresh nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PqRequest {
    pub client_nonce: Nonce,
}

/// Server answers with its own nonce, a factoring challenge, and the
/// fingerprints of the public keys it can prove ownership of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PqResponse {
    pub client_nonce: Nonce,
    pub server_nonce: Nonce,
    /// Semiprime challenge; the client must factor it into `p < q`.
    pub pq: u64,
    pub fingerprints: Vec<u64>,
}

/// Client proves the factoring work and opens the DH phase. The proof
/// payload is sealed to the chosen server public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParamsRequest {
    pub client_nonce: Nonce,
    pub server_nonce: Nonce,
    pub p: u32,
    pub q: u32,
    pub fingerprint: u64,
    pub sealed_proof: Vec<u8>,
}

/// Inner payload of [`DhParamsRequest`]; travels only sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PqProof {
    pub pq: u64,
    pub p: u32,
    pub q: u32,
    pub client_nonce: Nonce,
    pub server_nonce: Nonce,
    pub secret_nonce: SecretNonce,
}

/// Server's group parameters, encrypted with the temporary key derived
/// from the secret nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParamsResponse {
    pub client_nonce: Nonce,
    pub server_nonce: Nonce,
    pub encrypted_answer: Vec<u8>,
}

/// Inner payload of [`DhParamsResponse`]; travels only encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParamsAnswer {
    pub client_nonce: Nonce,
    pub server_nonce: Nonce,
    pub g: u32,
    pub prime: Vec<u8>,
    pub g_a: Vec<u8>,
    /// Server clock sample (seconds); callers may use it for offset
    /// bookkeeping, the handshake itself does not.
    pub server_time: u64,
}

/// Client's DH public value, encrypted with the temporary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDhParams {
    pub client_nonce: Nonce,
    pub server_nonce: Nonce,
    pub encrypted_inner: Vec<u8>,
}

/// Inner payload of [`ClientDhParams`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDhInner {
    pub client_nonce: Nonce,
    pub server_nonce: Nonce,
    pub g_b: Vec<u8>,
}

/// Final message: server confirms it derived the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhConfirm {
    pub client_nonce: Nonce,
    pub server_nonce: Nonce,
    pub confirm_hash: [u8; 32],
}

/// Any protocol message, as framed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    PqRequest(PqRequest),
    PqResponse(PqResponse),
    DhParamsRequest(DhParamsRequest),
    DhParamsResponse(DhParamsResponse),
    ClientDhParams(ClientDhParams),
    DhConfirm(DhConfirm),
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PqRequest(_) => "pq_request",
            Self::PqResponse(_) => "pq_response",
            Self::DhParamsRequest(_) => "dh_params_request",
            Self::DhParamsResponse(_) => "dh_params_response",
            Self::ClientDhParams(_) => "client_dh_params",
            Self::DhConfirm(_) => "dh_confirm",
        }
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Self::PqRequest(m) => {
                buf.put_u8(TAG_PQ_REQUEST);
                buf.put_slice(&m.client_nonce);
            }
            Self::PqResponse(m) => {
                buf.put_u8(TAG_PQ_RESPONSE);
                buf.put_slice(&m.client_nonce);
                buf.put_slice(&m.server_nonce);
                buf.put_u64_le(m.pq);
                put_u64_list(&mut buf, &m.fingerprints);
            }
            Self::DhParamsRequest(m) => {
                buf.put_u8(TAG_DH_PARAMS_REQUEST);
                buf.put_slice(&m.client_nonce);
                buf.put_slice(&m.server_nonce);
                buf.put_u32_le(m.p);
                buf.put_u32_le(m.q);
                buf.put_u64_le(m.fingerprint);
                put_bytes(&mut buf, &m.sealed_proof);
            }
            Self::DhParamsResponse(m) => {
                buf.put_u8(TAG_DH_PARAMS_RESPONSE);
                buf.put_slice(&m.client_nonce);
                buf.put_slice(&m.server_nonce);
                put_bytes(&mut buf, &m.encrypted_answer);
            }
            Self::ClientDhParams(m) => {
                buf.put_u8(TAG_CLIENT_DH_PARAMS);
                buf.put_slice(&m.client_nonce);
                buf.put_slice(&m.server_nonce);
                put_bytes(&mut buf, &m.encrypted_inner);
            }
            Self::DhConfirm(m) => {
                buf.put_u8(TAG_DH_CONFIRM);
                buf.put_slice(&m.client_nonce);
                buf.put_slice(&m.server_nonce);
                buf.put_slice(&m.confirm_hash);
            }
        }
        buf.to_vec()
    }

    /// Decode one message from `bytes`, rejecting trailing garbage.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = bytes;
        let tag = get_u8(&mut buf)?;
        let message = match tag {
            TAG_PQ_REQUEST => Self::PqRequest(PqRequest {
                client_nonce: get_array(&mut buf)?,
            }),
            TAG_PQ_RESPONSE => Self::PqResponse(PqResponse {
                client_nonce: get_array(&mut buf)?,
                server_nonce: get_array(&mut buf)?,
                pq: get_u64(&mut buf)?,
                fingerprints: get_u64_list(&mut buf)?,
            }),
            TAG_DH_PARAMS_REQUEST => Self::DhParamsRequest(DhParamsRequest {
                client_nonce: get_array(&mut buf)?,
                server_nonce: get_array(&mut buf)?,
                p: get_u32(&mut buf)?,
                q: get_u32(&mut buf)?,
                fingerprint: get_u64(&mut buf)?,
                sealed_proof: get_bytes(&mut buf)?,
            }),
            TAG_DH_PARAMS_RESPONSE => Self::DhParamsResponse(DhParamsResponse {
                client_nonce: get_array(&mut buf)?,
                server_nonce: get_array(&mut buf)?,
                encrypted_answer: get_bytes(&mut buf)?,
            }),
            TAG_CLIENT_DH_PARAMS => Self::ClientDhParams(ClientDhParams {
                client_nonce: get_array(&mut buf)?,
                server_nonce: get_array(&mut buf)?,
                encrypted_inner: get_bytes(&mut buf)?,
            }),
            TAG_DH_CONFIRM => Self::DhConfirm(DhConfirm {
                client_nonce: get_array(&mut buf)?,
                server_nonce: get_array(&mut buf)?,
                confirm_hash: get_array(&mut buf)?,
            }),
            _ => return Err(Error::BadMessage),
        };
        if !buf.is_empty() {
            return Err(Error::BadMessage);
        }
        Ok(message)
    }
}

impl PqProof {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(96);
        buf.put_u64_le(self.pq);
        buf.put_u32_le(self.p);
        buf.put_u32_le(self.q);
        buf.put_slice(&self.client_nonce);
        buf.put_slice(&self.server_nonce);
        buf.put_slice(&self.secret_nonce);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = bytes;
        let proof = Self {
            pq: get_u64(&mut buf)?,
            p: get_u32(&mut buf)?,
            q: get_u32(&mut buf)?,
            client_nonce: get_array(&mut buf)?,
            server_nonce: get_array(&mut buf)?,
            secret_nonce: get_array(&mut buf)?,
        };
        if !buf.is_empty() {
            return Err(Error::BadMessage);
        }
        Ok(proof)
    }
}

impl DhParamsAnswer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64 + self.prime.len() + self.g_a.len());
        buf.put_slice(&self.client_nonce);
        buf.put_slice(&self.server_nonce);
        buf.put_u32_le(self.g);
        put_bytes(&mut buf, &self.prime);
        put_bytes(&mut buf, &self.g_a);
        buf.put_u64_le(self.server_time);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = bytes;
        let answer = Self {
            client_nonce: get_array(&mut buf)?,
            server_nonce: get_array(&mut buf)?,
            g: get_u32(&mut buf)?,
            prime: get_bytes(&mut buf)?,
            g_a: get_bytes(&mut buf)?,
            server_time: get_u64(&mut buf)?,
        };
        if !buf.is_empty() {
            return Err(Error::BadMessage);
        }
        Ok(answer)
    }
}

impl ClientDhInner {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(48 + self.g_b.len());
        buf.put_slice(&self.client_nonce);
        buf.put_slice(&self.server_nonce);
        put_bytes(&mut buf, &self.g_b);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = bytes;
        let inner = Self {
            client_nonce: get_array(&mut buf)?,
            server_nonce: get_array(&mut buf)?,
            g_b: get_bytes(&mut buf)?,
        };
        if !buf.is_empty() {
            return Err(Error::BadMessage);
        }
        Ok(inner)
    }
}

// Variable-length fields carry a u16 length prefix. Group elements for
// any realistic group stay far below that bound; `put_bytes` refuses
// larger inputs in debug builds.

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    debug_assert!(data.len() <= u16::MAX as usize);
    buf.put_u16_le(data.len() as u16);
    buf.put_slice(data);
}

fn put_u64_list(buf: &mut BytesMut, list: &[u64]) {
    debug_assert!(list.len() <= u8::MAX as usize);
    buf.put_u8(list.len() as u8);
    for value in list {
        buf.put_u64_le(*value);
    }
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, Error> {
    if buf.remaining() < 1 {
        return Err(Error::BadMessage);
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, Error> {
    if buf.remaining() < 4 {
        return Err(Error::BadMessage);
    }
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, Error> {
    if buf.remaining() < 8 {
        return Err(Error::BadMessage);
    }
    Ok(buf.get_u64_le())
}

fn get_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], Error> {
    if buf.remaining() < N {
        return Err(Error::BadMessage);
    }
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, Error> {
    if buf.remaining() < 2 {
        return Err(Error::BadMessage);
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(Error::BadMessage);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_u64_list(buf: &mut &[u8]) -> Result<Vec<u64>, Error> {
    let count = get_u8(buf)? as usize;
    let mut list = Vec::with_capacity(count);
    for _ in 0..count {
        list.push(get_u64(buf)?);
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonce(fill: u8) -> Nonce {
        [fill; NONCE_LEN]
    }

    #[test]
    fn round_trip_every_message() {
        let messages = [
            Message::PqRequest(PqRequest {
                client_nonce: nonce(1),
            }),
            Message::PqResponse(PqResponse {
                client_nonce: nonce(1),
                server_nonce: nonce(2),
                pq: 0x1234_5678_9abc_def0,
                fingerprints: vec![7, 11, 13],
            }),
            Message::DhParamsRequest(DhParamsRequest {
                client_nonce: nonce(1),
                server_nonce: nonce(2),
                p: 65_003,
                q: 65_011,
                fingerprint: 11,
                sealed_proof: vec![0xAA; 100],
            }),
            Message::DhParamsResponse(DhParamsResponse {
                client_nonce: nonce(1),
                server_nonce: nonce(2),
                encrypted_answer: vec![0xBB; 80],
            }),
            Message::ClientDhParams(ClientDhParams {
                client_nonce: nonce(1),
                server_nonce: nonce(2),
                encrypted_inner: vec![0xCC; 40],
            }),
            Message::DhConfirm(DhConfirm {
                client_nonce: nonce(1),
                server_nonce: nonce(2),
                confirm_hash: [9; 32],
            }),
        ];

        for message in messages {
            let bytes = message.encode();
            let decoded = Message::decode(&bytes).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn round_trip_inner_payloads() {
        let proof = PqProof {
            pq: 17 * 19,
            p: 17,
            q: 19,
            client_nonce: nonce(3),
            server_nonce: nonce(4),
            secret_nonce: [5; SECRET_NONCE_LEN],
        };
        assert_eq!(PqProof::decode(&proof.encode()).unwrap(), proof);

        let answer = DhParamsAnswer {
            client_nonce: nonce(3),
            server_nonce: nonce(4),
            g: 3,
            prime: vec![0xFF; 8],
            g_a: vec![0x42; 8],
            server_time: 1_700_000_000,
        };
        assert_eq!(DhParamsAnswer::decode(&answer.encode()).unwrap(), answer);

        let inner = ClientDhInner {
            client_nonce: nonce(3),
            server_nonce: nonce(4),
            g_b: vec![0x24; 8],
        };
        assert_eq!(ClientDhInner::decode(&inner.encode()).unwrap(), inner);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = Message::PqResponse(PqResponse {
            client_nonce: nonce(1),
            server_nonce: nonce(2),
            pq: 99,
            fingerprints: vec![1],
        })
        .encode();

        for cut in 0..bytes.len() {
            assert_eq!(Message::decode(&bytes[..cut]), Err(Error::BadMessage));
        }
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = Message::PqRequest(PqRequest {
            client_nonce: nonce(1),
        })
        .encode();
        bytes.push(0);
        assert_eq!(Message::decode(&bytes), Err(Error::BadMessage));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(Message::decode(&[0xF0, 0, 0]), Err(Error::BadMessage));
    }
}
