//! Incremental, resumable parsing of backend message frames.
//!
//! The read pipe hands the cursor whatever bytes it has; the cursor walks
//! message headers without consuming the buffer, so a fragmented frame can
//! be retried once more bytes arrive, resuming from where parsing stopped.
use super::error::ProtocolError;

/// Fixed 5 byte header of a backend message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// The message type byte.
    pub msgtype: u8,
    /// Message length including itself, excluding the type byte.
    pub len: i32,
}

impl MessageHeader {
    /// Bytes a header occupies on the wire.
    pub const SIZE: usize = 5;

    /// Length of the message body.
    pub fn body_len(&self) -> usize {
        self.len as usize - 4
    }

    /// Total frame length, header included.
    pub fn frame_len(&self) -> usize {
        1 + self.len as usize
    }
}

/// A non-destructive cursor over a byte sequence containing zero or more
/// backend messages, possibly ending mid-message.
///
/// The cursor never mutates the underlying buffer; callers advance their
/// own buffer using the cursor's positions once a frame is complete.
#[derive(Debug)]
pub struct MessageCursor<'a> {
    buf: &'a [u8],
    /// next unread index into `buf`
    pos: usize,
    current: Option<Current>,
}

#[derive(Debug)]
struct Current {
    header: MessageHeader,
    /// body bytes consumed so far
    consumed: usize,
}

impl<'a> MessageCursor<'a> {
    /// A cursor positioned before the first message of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, current: None }
    }

    /// Reconstruct a cursor that previously stopped `consumed` bytes into
    /// the body of `header`. `buf` must begin at the first unconsumed body
    /// byte.
    pub fn resume(buf: &'a [u8], header: MessageHeader, consumed: usize) -> Self {
        debug_assert!(consumed <= header.body_len());
        Self { buf, pos: 0, current: Some(Current { header, consumed }) }
    }

    /// Header of the message the cursor is inside, if any.
    pub fn current_message(&self) -> Option<MessageHeader> {
        self.current.as_ref().map(|c| c.header)
    }

    /// Body bytes of the current message consumed so far.
    pub fn current_consumed(&self) -> usize {
        self.current.as_ref().map(|c| c.consumed).unwrap_or(0)
    }

    /// Body bytes of the current message not yet consumed.
    pub fn current_remaining(&self) -> usize {
        self.current
            .as_ref()
            .map(|c| c.header.body_len() - c.consumed)
            .unwrap_or(0)
    }

    /// Whether the rest of the current message is fully buffered.
    pub fn is_current_buffered(&self) -> bool {
        self.buf.len() - self.pos >= self.current_remaining()
    }

    /// Bytes consumed from the underlying buffer so far.
    pub fn buffered_consumed(&self) -> usize {
        self.pos
    }

    /// Advance past the current message (if any) and parse the next header.
    ///
    /// Returns `false` when the buffer does not hold enough bytes; the
    /// cursor state is unchanged in that case, so parsing can resume after
    /// more bytes arrive.
    pub fn move_next(&mut self) -> Result<bool, ProtocolError> {
        if let Some(current) = &self.current {
            let remaining = current.header.body_len() - current.consumed;
            if self.buf.len() - self.pos < remaining {
                return Ok(false);
            }
            self.pos += remaining;
            self.current = None;
        }

        let Some(header) = self.buf.get(self.pos..self.pos + MessageHeader::SIZE) else {
            return Ok(false);
        };

        let msgtype = header[0];
        let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if len < 4 {
            return Err(ProtocolError::bad_length(msgtype, len));
        }

        self.pos += MessageHeader::SIZE;
        self.current = Some(Current { header: MessageHeader { msgtype, len }, consumed: 0 });
        Ok(true)
    }

    /// Skip the rest of the current message body, if buffered.
    pub fn consume_current(&mut self) -> bool {
        let remaining = self.current_remaining();
        if self.buf.len() - self.pos < remaining {
            return false;
        }
        self.pos += remaining;
        if let Some(current) = &mut self.current {
            current.consumed = current.header.body_len();
        }
        true
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.current_remaining() < n {
            return None;
        }
        let bytes = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        if let Some(current) = &mut self.current {
            current.consumed += n;
        }
        Some(bytes)
    }

    pub fn try_read_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn try_read_i16(&mut self) -> Option<i16> {
        self.take(2).map(|b| i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn try_read_i32(&mut self) -> Option<i32> {
        self.take(4).map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn try_read_u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a nul terminated byte string, excluding the nul.
    ///
    /// `None` when no nul is buffered within the current message body.
    pub fn try_read_cstr_bytes(&mut self) -> Option<&'a [u8]> {
        let window = self.current_remaining().min(self.buf.len() - self.pos);
        let scan = &self.buf[self.pos..self.pos + window];
        let end = scan.iter().position(|b| *b == 0)?;
        let bytes = &scan[..end];
        self.pos += end + 1;
        if let Some(current) = &mut self.current {
            current.consumed += end + 1;
        }
        Some(bytes)
    }

    /// Read a nul terminated UTF-8 string.
    pub fn try_read_cstr(&mut self) -> Result<Option<&'a str>, ProtocolError> {
        match self.try_read_cstr_bytes() {
            Some(bytes) => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(ProtocolError::non_utf8),
            None => Ok(None),
        }
    }

    /// Fill `dst` from the current message body.
    ///
    /// `false` (and no consumption) when fewer than `dst.len()` bytes are
    /// buffered.
    pub fn try_copy_to(&mut self, dst: &mut [u8]) -> bool {
        match self.take(dst.len()) {
            Some(bytes) => {
                dst.copy_from_slice(bytes);
                true
            },
            None => false,
        }
    }

    /// Skip `n` buffered bytes of the current message body.
    ///
    /// # Panics
    ///
    /// Panics when `n` exceeds the buffered remainder of the current body.
    pub fn advance(&mut self, n: usize) {
        self.take(n).expect("advance past current message");
    }

    /// Step back `n` bytes within the current message body.
    ///
    /// # Panics
    ///
    /// Panics when fewer than `n` body bytes were consumed from this
    /// buffer.
    pub fn rewind(&mut self, n: usize) {
        let current = self.current.as_mut().expect("rewind without current message");
        assert!(current.consumed >= n && self.pos >= n, "rewind past message start");
        current.consumed -= n;
        self.pos -= n;
    }
}

#[cfg(test)]
mod test {
    use bytes::{BufMut, BytesMut};

    use super::{MessageCursor, MessageHeader};

    fn msg(buf: &mut BytesMut, msgtype: u8, body: &[u8]) {
        buf.put_u8(msgtype);
        buf.put_i32(4 + body.len() as i32);
        buf.put_slice(body);
    }

    #[test]
    fn iterates_headers() {
        let mut buf = BytesMut::new();
        msg(&mut buf, b'1', b"");
        msg(&mut buf, b'D', &8i32.to_be_bytes());
        msg(&mut buf, b'Z', b"I");

        let mut cursor = MessageCursor::new(&buf);
        let mut seen = vec![];
        while cursor.move_next().unwrap() {
            let header = cursor.current_message().unwrap();
            assert_eq!(
                cursor.current_remaining() + cursor.current_consumed(),
                header.body_len(),
            );
            seen.push(header.msgtype);
        }
        assert_eq!(seen, [b'1', b'D', b'Z']);
    }

    #[test]
    fn reads_within_body() {
        let mut buf = BytesMut::new();
        let mut body = BytesMut::new();
        body.put_i16(2);
        body.put_i32(8);
        body.put(&b"name\0"[..]);
        msg(&mut buf, b'T', &body);

        let mut cursor = MessageCursor::new(&buf);
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.try_read_i16(), Some(2));
        assert_eq!(cursor.try_read_i32(), Some(8));
        assert_eq!(cursor.try_read_cstr().unwrap(), Some("name"));
        assert_eq!(cursor.current_remaining(), 0);
        assert_eq!(cursor.try_read_u8(), None, "read does not cross message end");
    }

    #[test]
    fn rewind_rereads() {
        let mut buf = BytesMut::new();
        msg(&mut buf, b'D', &[0, 1, 0, 0, 0, 4]);

        let mut cursor = MessageCursor::new(&buf);
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.try_read_i16(), Some(1));
        cursor.rewind(2);
        assert_eq!(cursor.current_consumed(), 0);
        assert_eq!(cursor.try_read_i16(), Some(1));
    }

    #[test]
    fn fragmented_header() {
        let mut buf = BytesMut::new();
        msg(&mut buf, b'C', b"SELECT 1\0");

        // only 3 of the 5 header bytes arrived
        let mut cursor = MessageCursor::new(&buf[..3]);
        assert!(!cursor.move_next().unwrap());
        assert_eq!(cursor.current_message(), None);

        let mut cursor = MessageCursor::new(&buf);
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.current_message().unwrap().msgtype, b'C');
    }

    #[test]
    fn fragmented_body_resumes() {
        let mut buf = BytesMut::new();
        msg(&mut buf, b'C', b"SELECT 100\0");

        let mut cursor = MessageCursor::new(&buf[..8]);
        assert!(cursor.move_next().unwrap());
        let header = cursor.current_message().unwrap();
        assert!(!cursor.is_current_buffered());
        assert!(!cursor.move_next().unwrap(), "cannot pass unbuffered body");
        // partially read what is there
        let mut partial = [0u8; 3];
        assert!(cursor.try_copy_to(&mut partial));
        assert_eq!(&partial, b"SEL");
        let consumed = cursor.current_consumed();

        // more bytes arrive; resume from the unconsumed offset
        let rest = &buf[5 + consumed..];
        let mut cursor = MessageCursor::resume(rest, header, consumed);
        assert!(cursor.is_current_buffered());
        assert_eq!(cursor.try_read_cstr().unwrap(), Some("ECT 100"));
        assert!(!cursor.move_next().unwrap(), "stream exhausted");
    }

    #[test]
    fn consume_current_skips_body() {
        let mut buf = BytesMut::new();
        msg(&mut buf, b'D', &[1, 2, 3]);
        msg(&mut buf, b'Z', b"I");

        let mut cursor = MessageCursor::new(&buf);
        assert!(cursor.move_next().unwrap());
        assert!(cursor.consume_current());
        assert_eq!(cursor.current_remaining(), 0);
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.current_message().unwrap().msgtype, b'Z');
    }

    #[test]
    fn negative_length_is_protocol_violation() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_i32(2);

        let mut cursor = MessageCursor::new(&buf);
        assert!(cursor.move_next().is_err());
    }

    #[test]
    fn header_roundtrip() {
        let header = MessageHeader { msgtype: b'Z', len: 5 };
        assert_eq!(header.body_len(), 1);
        assert_eq!(header.frame_len(), 6);
    }
}
