//! Framed message I/O over a blocking byte stream.

use std::io::{ErrorKind as IoErrorKind, Read, Write};

use bytes::{BufMut, BytesMut};

use heron_common::error::{HeronError, HeronResult, ProtocolError};

use crate::codec::{self, BackendMessage, FrontendMessage, UNBOUNDED};

/// Outgoing bytes are flushed once this much is buffered.
const SEND_BUFFER_HIGH_WATER: usize = 64 * 1024;

/// Message-level I/O used by statements and the dispatcher.
///
/// `send` buffers; nothing reaches the client until `flush` (or the buffer
/// fills up).
pub trait Messenger {
    fn send(&mut self, msg: &BackendMessage) -> HeronResult<()>;
    fn flush(&mut self) -> HeronResult<()>;
    /// Next frontend message; `None` once the client has gone away.
    fn recv(&mut self) -> HeronResult<Option<FrontendMessage>>;
}

/// `Messenger` over any blocking `Read + Write` stream.
pub struct PgMessenger<S: Read + Write> {
    stream: S,
    out: BytesMut,
    max_message_size: usize,
}

impl<S: Read + Write> PgMessenger<S> {
    pub fn new(stream: S, max_message_size: usize) -> Self {
        Self {
            stream,
            out: BytesMut::with_capacity(8 * 1024),
            max_message_size,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Write raw bytes that are not a framed message (the SSL refusal byte).
    pub fn send_raw(&mut self, bytes: &[u8]) -> HeronResult<()> {
        self.out.put_slice(bytes);
        self.flush()
    }

    /// Read one untyped startup-phase packet.
    pub fn recv_startup(&mut self) -> HeronResult<Option<FrontendMessage>> {
        let mut len_word = [0u8; 4];
        if !self.read_or_eof(&mut len_word)? {
            return Ok(None);
        }
        let len = i32::from_be_bytes(len_word);
        let limit = codec::frontend_message_type(0).map(|t| t.max_size).unwrap_or(10_000);
        if len < 8 || len as usize > limit {
            return Err(HeronError::Protocol(ProtocolError::InvalidMessage(format!(
                "invalid startup packet length {len}"
            ))));
        }
        let mut buf = BytesMut::with_capacity(len as usize);
        buf.put_slice(&len_word);
        buf.resize(len as usize, 0);
        self.stream.read_exact(&mut buf[4..])?;
        codec::decode_startup(&mut buf)
    }

    /// Fill `buf` completely; false on a clean EOF before the first byte.
    fn read_or_eof(&mut self, buf: &mut [u8]) -> HeronResult<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(HeronError::Protocol(ProtocolError::ConnectionClosed)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

impl<S: Read + Write> Messenger for PgMessenger<S> {
    fn send(&mut self, msg: &BackendMessage) -> HeronResult<()> {
        self.out.extend_from_slice(&codec::encode_message(msg));
        if self.out.len() >= SEND_BUFFER_HIGH_WATER {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> HeronResult<()> {
        if !self.out.is_empty() {
            self.stream.write_all(&self.out)?;
            self.out.clear();
        }
        self.stream.flush()?;
        Ok(())
    }

    fn recv(&mut self) -> HeronResult<Option<FrontendMessage>> {
        let mut header = [0u8; 5];
        if !self.read_or_eof(&mut header)? {
            return Ok(None);
        }
        let code = header[0];
        let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let msg_type = codec::frontend_message_type(code).ok_or_else(|| {
            tracing::warn!("unexpected frontend message type 0x{:02x}", code);
            HeronError::Protocol(ProtocolError::UnexpectedMessage(code as char))
        })?;
        if len < 4 {
            return Err(HeronError::Protocol(ProtocolError::InvalidMessage(format!(
                "invalid length {len} for {}",
                msg_type.name
            ))));
        }
        let limit = if msg_type.max_size == UNBOUNDED {
            self.max_message_size
        } else {
            msg_type.max_size
        };
        if len as usize > limit {
            return Err(HeronError::Protocol(ProtocolError::MessageTooLarge {
                code: code as char,
                size: len as usize,
                max: limit,
            }));
        }
        let mut buf = BytesMut::with_capacity(1 + len as usize);
        buf.put_slice(&header);
        buf.resize(1 + len as usize, 0);
        self.stream.read_exact(&mut buf[5..])?;
        let msg = codec::decode_message(&mut buf)?;
        tracing::trace!("recv {}", msg_type.name);
        msg.ok_or_else(|| HeronError::protocol(format!("incomplete {} message", msg_type.name)))
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reads from a fixed script, collects everything written.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn messenger(input: Vec<u8>, max: usize) -> PgMessenger<Scripted> {
        PgMessenger::new(
            Scripted {
                input: Cursor::new(input),
                output: Vec::new(),
            },
            max,
        )
    }

    #[test]
    fn test_recv_sequence_then_eof() {
        let mut input = codec::encode_frontend(&FrontendMessage::Query("SELECT 1".into())).to_vec();
        input.extend_from_slice(&codec::encode_frontend(&FrontendMessage::Sync));
        let mut m = messenger(input, 1024);
        assert_eq!(m.recv().unwrap(), Some(FrontendMessage::Query("SELECT 1".into())));
        assert_eq!(m.recv().unwrap(), Some(FrontendMessage::Sync));
        assert_eq!(m.recv().unwrap(), None);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let input = codec::encode_frontend(&FrontendMessage::CopyData(vec![b'x'; 2048])).to_vec();
        let mut m = messenger(input, 1024);
        let err = m.recv().unwrap_err();
        assert!(matches!(
            err,
            HeronError::Protocol(ProtocolError::MessageTooLarge { code: 'd', .. })
        ));
        assert_eq!(err.pg_severity(), "FATAL");
    }

    #[test]
    fn test_fixed_size_types_use_table_limit() {
        // A Sync with a body is malformed no matter the server limit.
        let mut input = vec![b'S'];
        input.extend_from_slice(&8i32.to_be_bytes());
        input.extend_from_slice(&[0, 0, 0, 0]);
        let mut m = messenger(input, 1 << 20);
        assert!(m.recv().is_err());
    }

    #[test]
    fn test_send_is_buffered_until_flush() {
        let mut m = messenger(Vec::new(), 1024);
        m.send(&BackendMessage::ParseComplete).unwrap();
        assert!(m.stream.output.is_empty());
        m.flush().unwrap();
        assert_eq!(m.into_inner().output, vec![b'1', 0, 0, 0, 4]);
    }

    #[test]
    fn test_truncated_header_is_connection_closed() {
        let mut m = messenger(vec![b'Q', 0, 0], 1024);
        assert!(matches!(
            m.recv(),
            Err(HeronError::Protocol(ProtocolError::ConnectionClosed))
        ));
    }
}
