//! Fire-once result delivery back to the caller.

use tokio::sync::oneshot;

use crate::error::HandshakeError;

/// One-shot channel for a handshake result, with "nobody is listening"
/// modelled explicitly rather than as a nullable sender.
///
/// Settling consumes the sender, so a channel can deliver at most one
/// value by construction; the actor's lifecycle guard ensures `settle`
/// is reached at most once per channel.
pub struct ResultChannel<T> {
    sender: Option<oneshot::Sender<Result<T, HandshakeError>>>,
}

impl<T> ResultChannel<T> {
    /// A channel that delivers to `sender`.
    pub fn recipient(sender: oneshot::Sender<Result<T, HandshakeError>>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// No recipient: the resource is discarded on completion.
    pub fn absent() -> Self {
        Self { sender: None }
    }

    /// Create a channel together with its receiving half.
    pub fn pair() -> (Self, oneshot::Receiver<Result<T, HandshakeError>>) {
        let (tx, rx) = oneshot::channel();
        (Self::recipient(tx), rx)
    }

    /// Whether anyone is listening.
    pub fn has_recipient(&self) -> bool {
        self.sender.is_some()
    }

    /// Deliver the result. Returns `false` when there is no recipient or
    /// the recipient already went away.
    pub fn settle(&mut self, result: Result<T, HandshakeError>) -> bool {
        match self.sender.take() {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }
}
