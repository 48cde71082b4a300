//! Buffered halves of a session's byte duplex.
//!
//! The engine splits the socket: the read half is owned by the session's
//! read loop, the write half sits behind the write lock. Each half keeps
//! its own buffer, so the two sides need no coordination beyond the
//! ordering the protocol itself provides.
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::{
    Result,
    net::Socket,
    postgres::{
        FrontendProtocol, MessageCursor, MessageHeader, ProtocolError,
        frontend::{self, Startup},
    },
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// One framed backend message, header stripped.
#[derive(Debug)]
pub(crate) struct RawMessage {
    pub msgtype: u8,
    pub body: Bytes,
}

/// Buffered, message-framing read half.
#[derive(Debug)]
pub(crate) struct ReadPipe {
    io: ReadHalf<Socket>,
    buf: BytesMut,
}

enum Framing {
    Ready(MessageHeader),
    Need(usize),
}

impl ReadPipe {
    pub(crate) fn new(io: ReadHalf<Socket>) -> Self {
        Self { io, buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY) }
    }

    /// Read the next backend message.
    ///
    /// `None` on a clean end of stream; EOF mid-message is a
    /// [`ProtocolError`].
    pub(crate) async fn read_message(&mut self) -> Result<Option<RawMessage>> {
        loop {
            let framing = {
                let mut cursor = MessageCursor::new(&self.buf);
                if cursor.move_next()? {
                    match cursor.current_message() {
                        Some(header) if cursor.is_current_buffered() => Framing::Ready(header),
                        Some(header) => Framing::Need(header.frame_len()),
                        None => Framing::Need(MessageHeader::SIZE),
                    }
                } else {
                    Framing::Need(MessageHeader::SIZE)
                }
            };

            match framing {
                Framing::Ready(header) => {
                    self.buf.advance(MessageHeader::SIZE);
                    let body = self.buf.split_to(header.body_len()).freeze();
                    return Ok(Some(RawMessage { msgtype: header.msgtype, body }));
                },
                Framing::Need(total) => {
                    self.buf.reserve(total.saturating_sub(self.buf.len()).max(1));
                    let n = self.io.read_buf(&mut self.buf).await?;
                    if n == 0 {
                        if self.buf.is_empty() {
                            return Ok(None);
                        }
                        return Err(ProtocolError::eof().into());
                    }
                },
            }
        }
    }
}

/// Buffered write half with an advisory flush threshold.
///
/// `send` only buffers; callers flush at message boundaries, either
/// explicitly or through [`maybe_flush`][WritePipe::maybe_flush] once the
/// buffer grows past the threshold. The threshold check happens between
/// messages, so a flush never splits a header from its body.
#[derive(Debug)]
pub(crate) struct WritePipe {
    io: WriteHalf<Socket>,
    buf: BytesMut,
    flush_threshold: usize,
}

impl WritePipe {
    pub(crate) fn new(io: WriteHalf<Socket>, flush_threshold: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            flush_threshold,
        }
    }

    pub(crate) fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.buf);
    }

    pub(crate) fn send_startup(&mut self, startup: Startup) {
        startup.write(&mut self.buf);
    }

    /// The write buffer, for messages that stream themselves (Bind).
    pub(crate) fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Flush if the buffered bytes passed the advisory threshold.
    ///
    /// Returns whether a flush happened.
    pub(crate) async fn maybe_flush(&mut self) -> io::Result<bool> {
        if self.buf.len() >= self.flush_threshold {
            self.flush().await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        self.io.write_all_buf(&mut self.buf).await?;
        self.io.flush().await
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }
}

#[cfg(test)]
mod test {
    use tokio::io::AsyncWriteExt;

    use crate::{net::Socket, postgres::MessageCursor};

    use super::{ReadPipe, WritePipe, frontend};

    #[tokio::test]
    async fn advisory_flush_never_splits_a_message() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (_read, write) = tokio::io::split(Socket::from_io(client));
        // tiny threshold so nearly every message triggers a flush
        let mut pipe = WritePipe::new(write, 16);

        for i in 0..100i32 {
            pipe.send(frontend::Execute { portal: "", max_rows: i });
            pipe.maybe_flush().await.unwrap();
        }
        pipe.flush().await.unwrap();

        // an Execute with the unnamed portal is 10 bytes on the wire
        let mut wire = vec![0u8; 100 * 10];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut wire).await.unwrap();

        let mut cursor = MessageCursor::new(&wire);
        let mut count = 0;
        while cursor.move_next().unwrap() {
            let header = cursor.current_message().unwrap();
            assert_eq!(header.msgtype, b'E');
            assert!(cursor.is_current_buffered(), "flushes land on message boundaries");
            count += 1;
        }
        assert_eq!(count, 100);
    }

    #[tokio::test]
    async fn read_pipe_reassembles_fragmented_messages() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (read, _write) = tokio::io::split(Socket::from_io(client));
        let mut pipe = ReadPipe::new(read);

        let mut frame = Vec::new();
        frame.push(b'C');
        frame.extend_from_slice(&(4 + 9i32).to_be_bytes());
        frame.extend_from_slice(b"SELECT 3\0");

        let reader = tokio::spawn(async move { pipe.read_message().await });

        // drip the frame across three writes
        for chunk in [&frame[..2], &frame[2..7], &frame[7..]] {
            server.write_all(chunk).await.unwrap();
            server.flush().await.unwrap();
            tokio::task::yield_now().await;
        }

        let message = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(message.msgtype, b'C');
        assert_eq!(&message.body[..], b"SELECT 3\0");
    }

    #[tokio::test]
    async fn eof_between_messages_is_clean() {
        let (client, server) = tokio::io::duplex(1024);
        let (read, _write) = tokio::io::split(Socket::from_io(client));
        let mut pipe = ReadPipe::new(read);

        drop(server);
        assert!(pipe.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_message_is_a_protocol_violation() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (read, _write) = tokio::io::split(Socket::from_io(client));
        let mut pipe = ReadPipe::new(read);

        server.write_all(&[b'C', 0, 0]).await.unwrap();
        drop(server);

        assert!(pipe.read_message().await.is_err());
    }
}
