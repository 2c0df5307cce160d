//! Byte-stream views of the COPY sub-protocol.
//!
//! [`CopyInReader`] turns the client's CopyData messages into a plain
//! [`Read`] so a bulk loader never sees protocol framing.
//! [`CopyDestination`] is where formatted COPY rows go: the client
//! ([`CopyOutStream`]) or a server-local file ([`FileDestination`]).

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use heron_common::error::{HeronError, HeronResult, ProtocolError};

use crate::codec::{BackendMessage, FrontendMessage};
use crate::messenger::Messenger;

/// `Read` over the payloads of successive CopyData messages.
///
/// Blocks for the next message when the current payload is used up, ends at
/// CopyDone, fails at CopyFail. Flush and Sync inside the stream are skipped.
pub struct CopyInReader<'a> {
    messenger: &'a mut dyn Messenger,
    chunk: Vec<u8>,
    pos: usize,
    done: bool,
    failure: Option<HeronError>,
    bytes_read: u64,
}

impl<'a> CopyInReader<'a> {
    pub fn new(messenger: &'a mut dyn Messenger) -> Self {
        Self {
            messenger,
            chunk: Vec::new(),
            pos: 0,
            done: false,
            failure: None,
            bytes_read: 0,
        }
    }

    /// Bytes readable without waiting for another message.
    pub fn available(&self) -> usize {
        self.chunk.len() - self.pos
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// The protocol-level error behind a failed read, if any. Callers use it
    /// in place of the `io::Error` the loader reported.
    pub fn take_failure(&mut self) -> Option<HeronError> {
        self.failure.take()
    }

    /// Discard up to `n` bytes; returns how many were skipped.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        let mut skipped = 0;
        while skipped < n {
            if self.pos == self.chunk.len() && !self.fill()? {
                break;
            }
            let step = (self.available() as u64).min(n - skipped);
            self.pos += step as usize;
            self.bytes_read += step;
            skipped += step;
        }
        Ok(skipped)
    }

    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut b = [0u8; 1];
        match self.read(&mut b)? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }

    /// Consume the rest of the stream up to CopyDone.
    pub fn drain(&mut self) -> io::Result<u64> {
        self.skip(u64::MAX)
    }

    /// Load the next payload. False at end of stream.
    fn fill(&mut self) -> io::Result<bool> {
        while !self.done {
            let msg = match self.messenger.recv() {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(self.fail(ProtocolError::ConnectionClosed.into())),
                Err(e) => return Err(self.fail(e)),
            };
            match msg {
                FrontendMessage::CopyData(data) => {
                    self.chunk = data;
                    self.pos = 0;
                    if !self.chunk.is_empty() {
                        return Ok(true);
                    }
                }
                FrontendMessage::CopyDone => self.done = true,
                FrontendMessage::CopyFail(reason) => {
                    tracing::warn!("client aborted COPY: {}", reason);
                    return Err(self.fail(ProtocolError::CopyFailed(reason).into()));
                }
                FrontendMessage::Flush | FrontendMessage::Sync => {
                    tracing::trace!("skipping {:?} inside COPY data", msg.code() as char);
                }
                other => {
                    let code = other.code() as char;
                    tracing::warn!("unexpected message '{}' during COPY", code);
                    return Err(self.fail(ProtocolError::UnexpectedMessage(code).into()));
                }
            }
        }
        Ok(false)
    }

    fn fail(&mut self, err: HeronError) -> io::Error {
        self.done = true;
        let io_err = io::Error::new(io::ErrorKind::InvalidData, err.to_string());
        self.failure = Some(err);
        io_err
    }
}

impl Read for CopyInReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos == self.chunk.len() && !self.fill()? {
            return Ok(0);
        }
        let n = self.available().min(buf.len());
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        self.bytes_read += n as u64;
        Ok(n)
    }
}

/// Sink for formatted COPY rows.
pub trait CopyDestination {
    fn begin(&mut self, column_count: usize) -> HeronResult<()>;
    /// One complete record, terminator included.
    fn write_row(&mut self, bytes: &[u8]) -> HeronResult<()>;
    fn finish(&mut self) -> HeronResult<()>;
}

/// CopyOutResponse, one CopyData per row, CopyDone.
pub struct CopyOutStream<'a> {
    messenger: &'a mut dyn Messenger,
    rows: u64,
}

impl<'a> CopyOutStream<'a> {
    pub fn new(messenger: &'a mut dyn Messenger) -> Self {
        Self { messenger, rows: 0 }
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }
}

impl CopyDestination for CopyOutStream<'_> {
    fn begin(&mut self, column_count: usize) -> HeronResult<()> {
        self.messenger.send(&BackendMessage::CopyOutResponse {
            format: 0,
            column_formats: vec![0; column_count],
        })?;
        self.messenger.flush()
    }

    fn write_row(&mut self, bytes: &[u8]) -> HeronResult<()> {
        self.rows += 1;
        self.messenger.send(&BackendMessage::CopyData(bytes.to_vec()))
    }

    fn finish(&mut self) -> HeronResult<()> {
        self.messenger.send(&BackendMessage::CopyDone)
    }
}

/// Server-local file target of `COPY ... TO 'path'`.
pub struct FileDestination {
    writer: BufWriter<File>,
}

impl FileDestination {
    pub fn create(path: &Path) -> HeronResult<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl CopyDestination for FileDestination {
    fn begin(&mut self, _column_count: usize) -> HeronResult<()> {
        Ok(())
    }

    fn write_row(&mut self, bytes: &[u8]) -> HeronResult<()> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    fn finish(&mut self) -> HeronResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}
