/// Errors produced while validating or applying protocol messages.
///
/// Every variant is terminal for the handshake attempt: the state machine
/// moves to `Stage::Failed` and will not accept further messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A message arrived that is not expected in the current stage.
    UnexpectedMessage,
    /// An echoed nonce does not match the session's nonce.
    NonceMismatch,
    /// No key in the local directory matches any advertised fingerprint.
    UnknownFingerprint,
    /// The server's factoring challenge is not a valid semiprime.
    BadChallenge,
    /// The DH group parameters were rejected (bad prime, bad generator,
    /// or a public value outside the group).
    DhParamsRejected,
    /// The server's confirmation hash does not match the expected value.
    ConfirmMismatch,
    /// A message or encrypted payload is malformed or truncated.
    BadMessage,
    /// A cryptographic operation failed (decryption, factoring).
    CryptoFailed,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnexpectedMessage => write!(f, "message not expected in current stage"),
            Self::NonceMismatch => write!(f, "echoed nonce does not match session"),
            Self::UnknownFingerprint => write!(f, "no trusted server key matches fingerprint"),
            Self::BadChallenge => write!(f, "factoring challenge is not a valid semiprime"),
            Self::DhParamsRejected => write!(f, "DH group parameters rejected"),
            Self::ConfirmMismatch => write!(f, "confirmation hash mismatch"),
            Self::BadMessage => write!(f, "malformed protocol message"),
            Self::CryptoFailed => write!(f, "cryptographic operation failed"),
        }
    }
}

impl core::error::Error for Error {}
