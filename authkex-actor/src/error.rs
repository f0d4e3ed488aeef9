use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Terminal outcome of a failed handshake attempt.
///
/// Every variant ends the attempt; nothing is retried internally. The
/// I/O error is shared behind an `Arc` because the same failure is
/// reported on both result channels.
#[derive(Debug, Clone, Error)]
pub enum HandshakeError {
    /// The underlying byte stream failed or was closed by the peer.
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    /// A protocol message failed validation.
    #[error("protocol error: {0}")]
    Protocol(#[from] authkex_handshake::Error),

    /// The deadline elapsed before the handshake was confirmed.
    #[error("handshake deadline elapsed")]
    Timeout,

    /// The handshake was cancelled from outside.
    #[error("handshake cancelled")]
    Cancelled,
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> Self {
        Self::Transport(Arc::new(err))
    }
}
