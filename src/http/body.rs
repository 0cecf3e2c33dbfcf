//! Message bodies read off a buffered stream.
//!
//! A [`Body`] pairs a reader with the [`Framing`] announced by the message
//! head and yields the decoded payload chunk by chunk. The same type carries
//! inbound request bodies (read from the caller) and backend response bodies
//! (read from the backend connection).

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest chunk-size or trailer line accepted in a chunked body.
const MAX_LINE: u64 = 4096;

/// How the end of a message body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body at all.
    Empty,
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// The body runs until the peer closes the connection.
    UntilEof,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    UntilEof,
    Done,
}

/// A single-use body stream.
#[derive(Debug)]
pub struct Body<R> {
    reader: R,
    framing: Framing,
    state: State,
}

impl<R> Body<R> {
    pub fn new(reader: R, framing: Framing) -> Self {
        let state = match framing {
            Framing::Empty | Framing::Length(0) => State::Done,
            Framing::Length(n) => State::Length(n),
            Framing::Chunked => State::ChunkSize,
            Framing::UntilEof => State::UntilEof,
        };

        Self {
            reader,
            framing,
            state,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Returns true once the whole body has been read.
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Gives back the underlying reader, discarding any unread body.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: AsyncBufRead + Unpin> Body<R> {
    /// Reads the next piece of the decoded payload.
    ///
    /// Returns `Ok(None)` once the body is complete. A stream that ends before
    /// the framing says it should is an `UnexpectedEof` error.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.state {
                State::Done => return Ok(None),
                State::Length(remaining) => {
                    let chunk = self.read_data(remaining).await?;
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        State::Done
                    } else {
                        State::Length(left)
                    };
                    return Ok(Some(chunk));
                }
                State::UntilEof => {
                    let buf = self.reader.fill_buf().await?;
                    if buf.is_empty() {
                        self.state = State::Done;
                        return Ok(None);
                    }
                    let chunk = Bytes::copy_from_slice(buf);
                    self.reader.consume(chunk.len());
                    return Ok(Some(chunk));
                }
                State::ChunkSize => {
                    let line = self.read_line().await?;
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        self.read_trailers().await?;
                        self.state = State::Done;
                        return Ok(None);
                    }
                    self.state = State::ChunkData(size);
                }
                State::ChunkData(remaining) => {
                    let chunk = self.read_data(remaining).await?;
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        State::ChunkEnd
                    } else {
                        State::ChunkData(left)
                    };
                    return Ok(Some(chunk));
                }
                State::ChunkEnd => {
                    let line = self.read_line().await?;
                    if !line.is_empty() {
                        return Err(invalid_data("missing CRLF after chunk data"));
                    }
                    self.state = State::ChunkSize;
                }
            }
        }
    }

    /// Reads and discards the rest of the body, returning the byte count.
    pub async fn drain(&mut self) -> io::Result<u64> {
        let mut total = 0;
        while let Some(chunk) = self.next_chunk().await? {
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    async fn read_data(&mut self, remaining: u64) -> io::Result<Bytes> {
        let buf = self.reader.fill_buf().await?;
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "body ended before its declared length",
            ));
        }
        let n = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        self.reader.consume(n);
        Ok(chunk)
    }

    /// Reads one CRLF-terminated line and returns it without the terminator.
    async fn read_line(&mut self) -> io::Result<String> {
        let mut line = Vec::new();
        (&mut self.reader)
            .take(MAX_LINE)
            .read_until(b'\n', &mut line)
            .await?;

        if line.last() != Some(&b'\n') {
            return Err(if line.len() as u64 >= MAX_LINE {
                invalid_data("chunk line too long")
            } else {
                io::Error::new(io::ErrorKind::UnexpectedEof, "body ended inside a chunk line")
            });
        }

        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        String::from_utf8(line).map_err(|_| invalid_data("chunk line is not valid UTF-8"))
    }

    async fn read_trailers(&mut self) -> io::Result<()> {
        while !self.read_line().await?.is_empty() {}
        Ok(())
    }
}

fn parse_chunk_size(line: &str) -> io::Result<u64> {
    let size = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| invalid_data("invalid chunk size"))
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
