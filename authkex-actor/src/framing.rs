//! Length-prefixed message framing for the handshake byte stream.
//!
//! Each protocol message is prefixed with a 4-byte little-endian length.
//! Bytes may arrive fragmented across any number of reads, so the framer
//! accumulates partial data — including partial length prefixes — until
//! a complete message is available.

use std::collections::VecDeque;

/// Error indicating that the byte stream does not carry valid frames.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidFrame;

/// Width of the length prefix.
const PREFIX_LEN: usize = 4;

/// Accumulates incoming bytes and yields complete framed messages.
#[derive(Default)]
pub struct MessageFramer {
    /// Buffer for a partial length prefix.
    prefix_buf: [u8; PREFIX_LEN],
    /// Number of valid bytes in `prefix_buf`.
    prefix_len: usize,
    /// In-progress message: (remaining_bytes, accumulated_data).
    message_in_progress: Option<(usize, Vec<u8>)>,
    /// Fully received messages ready for processing.
    messages_ready: VecDeque<Vec<u8>>,
}

impl MessageFramer {
    /// Maximum length of a single handshake message.
    ///
    /// Limits resource consumption from unauthenticated peers. The
    /// largest legitimate message (the sealed DH-params request) stays
    /// well under this for any realistic group size.
    pub const MESSAGE_LEN_MAX: usize = 4096;

    /// Maximum number of buffered ready messages before rejecting input.
    pub const MESSAGE_READY_MAX: usize = 4;

    /// Ingest incoming bytes from the transport.
    ///
    /// Returns `true` if at least one complete message is now available.
    pub fn ingest_bytes(&mut self, mut buffer: &[u8]) -> Result<bool, InvalidFrame> {
        while !buffer.is_empty() {
            match &mut self.message_in_progress {
                None => {
                    // Accumulate the length prefix, which may itself be
                    // split across reads.
                    let need = PREFIX_LEN - self.prefix_len;
                    let take = need.min(buffer.len());
                    self.prefix_buf[self.prefix_len..self.prefix_len + take]
                        .copy_from_slice(&buffer[..take]);
                    self.prefix_len += take;
                    buffer = &buffer[take..];

                    if self.prefix_len < PREFIX_LEN {
                        continue;
                    }

                    let next_message_len = u32::from_le_bytes(self.prefix_buf) as usize;
                    self.prefix_len = 0;

                    if next_message_len > Self::MESSAGE_LEN_MAX
                        || self.messages_ready.len() >= Self::MESSAGE_READY_MAX
                    {
                        return Err(InvalidFrame);
                    }
                    if next_message_len == 0 {
                        // Zero-length frames carry nothing this protocol
                        // sends; treat them as corruption.
                        return Err(InvalidFrame);
                    }
                    self.message_in_progress =
                        Some((next_message_len, Vec::with_capacity(next_message_len)));
                }
                Some((bytes_remaining, message)) => {
                    let take = (*bytes_remaining).min(buffer.len());
                    let (chunk, rest) = buffer.split_at(take);
                    message.extend_from_slice(chunk);
                    *bytes_remaining -= take;
                    if *bytes_remaining == 0 {
                        let (_, message) = self
                            .message_in_progress
                            .take()
                            .ok_or(InvalidFrame)?;
                        self.messages_ready.push_back(message);
                    }
                    buffer = rest;
                }
            }
        }

        Ok(self.ready())
    }

    /// Whether at least one complete message is available.
    pub fn ready(&self) -> bool {
        !self.messages_ready.is_empty()
    }

    /// Pop the next complete message, if any.
    pub fn pop_message(&mut self) -> Option<Vec<u8>> {
        self.messages_ready.pop_front()
    }

    /// Append a length-prefixed frame to `buffer`.
    pub fn write_frame(buffer: &mut Vec<u8>, message: &[u8]) -> Result<(), InvalidFrame> {
        if message.is_empty() || message.len() > Self::MESSAGE_LEN_MAX {
            return Err(InvalidFrame);
        }
        buffer.extend_from_slice(&(message.len() as u32).to_le_bytes());
        buffer.extend_from_slice(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_message() {
        let msg = b"pq request bytes";
        let mut buf = Vec::new();
        MessageFramer::write_frame(&mut buf, msg).unwrap();

        let mut framer = MessageFramer::default();
        assert!(!framer.ready());
        let has_data = framer.ingest_bytes(&buf).unwrap();
        assert!(has_data);
        assert!(framer.ready());

        let out = framer.pop_message().unwrap();
        assert_eq!(out, msg);
        assert!(!framer.ready());
    }

    #[test]
    fn round_trip_multiple_messages() {
        let msgs: &[&[u8]] = &[b"first", b"second", b"third"];
        let mut buf = Vec::new();
        for msg in msgs {
            MessageFramer::write_frame(&mut buf, msg).unwrap();
        }

        let mut framer = MessageFramer::default();
        framer.ingest_bytes(&buf).unwrap();

        for msg in msgs {
            let out = framer.pop_message().unwrap();
            assert_eq!(out, *msg);
        }
        assert!(framer.pop_message().is_none());
    }

    #[test]
    fn fragmented_delivery() {
        let msg = b"fragmented message body";
        let mut buf = Vec::new();
        MessageFramer::write_frame(&mut buf, msg).unwrap();

        let mut framer = MessageFramer::default();

        // Feed one byte at a time; the prefix itself spans four calls.
        for (i, &byte) in buf.iter().enumerate() {
            let has_data = framer.ingest_bytes(&[byte]).unwrap();
            if i < buf.len() - 1 {
                assert!(!has_data, "should not be ready at byte {i}");
            } else {
                assert!(has_data, "should be ready after last byte");
            }
        }

        let out = framer.pop_message().unwrap();
        assert_eq!(out, msg);
    }

    #[test]
    fn split_across_two_reads_inside_the_prefix() {
        let msg = vec![0xAB; 300];
        let mut buf = Vec::new();
        MessageFramer::write_frame(&mut buf, &msg).unwrap();

        let mut framer = MessageFramer::default();
        assert!(!framer.ingest_bytes(&buf[..2]).unwrap());
        assert!(framer.ingest_bytes(&buf[2..]).unwrap());
        assert_eq!(framer.pop_message().unwrap(), msg);
    }

    #[test]
    fn zero_length_frame_is_rejected() {
        let mut framer = MessageFramer::default();
        assert_eq!(framer.ingest_bytes(&0u32.to_le_bytes()), Err(InvalidFrame));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut framer = MessageFramer::default();
        let prefix = ((MessageFramer::MESSAGE_LEN_MAX + 1) as u32).to_le_bytes();
        assert_eq!(framer.ingest_bytes(&prefix), Err(InvalidFrame));
    }

    #[test]
    fn queue_limit_enforced() {
        let mut framer = MessageFramer::default();
        let mut buf = Vec::new();
        for _ in 0..=MessageFramer::MESSAGE_READY_MAX {
            MessageFramer::write_frame(&mut buf, b"x").unwrap();
        }

        assert_eq!(framer.ingest_bytes(&buf), Err(InvalidFrame));
    }

    #[test]
    fn message_too_large_to_frame() {
        let large = vec![0u8; MessageFramer::MESSAGE_LEN_MAX + 1];
        let mut buf = Vec::new();
        assert_eq!(
            MessageFramer::write_frame(&mut buf, &large),
            Err(InvalidFrame)
        );
    }
}
