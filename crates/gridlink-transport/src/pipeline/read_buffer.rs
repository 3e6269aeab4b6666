use bytes::{Buf, BytesMut};

/// Accumulated inbound bytes with consumed/examined cursors
///
/// The front of the buffer is the first unconsumed byte. `examined` marks
/// how far the consumer has already looked; bytes past it are new. The
/// consumer only runs again once there is something past `examined`.
#[derive(Debug, Default)]
pub(crate) struct ReadBuffer {
    buf: BytesMut,
    examined: usize,
}

impl ReadBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Unconsumed bytes, oldest first
    pub(crate) fn unconsumed(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes arrived since the last full examination
    pub(crate) fn has_unexamined(&self) -> bool {
        self.examined < self.buf.len()
    }

    /// Release `consumed` bytes; everything left counts as examined
    pub(crate) fn advance(&mut self, consumed: usize) {
        let consumed = consumed.min(self.buf.len());
        self.buf.advance(consumed);
        self.examined = self.buf.len();
    }

    /// Mark everything as examined without consuming
    pub(crate) fn mark_examined(&mut self) {
        self.examined = self.buf.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_residue_kept_and_extended() {
        let mut buffer = ReadBuffer::new();
        buffer.extend(b"abcdef");
        assert!(buffer.has_unexamined());

        buffer.advance(4);
        assert_eq!(buffer.unconsumed(), b"ef");
        assert!(!buffer.has_unexamined());

        buffer.extend(b"gh");
        assert_eq!(buffer.unconsumed(), b"efgh");
        assert!(buffer.has_unexamined());
    }

    #[test]
    fn test_advance_clamped() {
        let mut buffer = ReadBuffer::new();
        buffer.extend(b"abc");
        buffer.advance(10);
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_mark_examined() {
        let mut buffer = ReadBuffer::new();
        buffer.extend(b"ab");
        buffer.mark_examined();
        assert!(!buffer.has_unexamined());
        assert_eq!(buffer.len(), 2);
    }
}
