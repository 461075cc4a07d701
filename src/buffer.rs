//! Output chunks and the content sender that drains them to a socket.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};

/// Bytes read from a streamed file per pull.
pub const PULL_BLOCK_SIZE: usize = 128 * 1024;

/// A run of output bytes, consumed from the front.
#[derive(Debug)]
pub enum Chunk {
    Owned { data: Vec<u8>, offset: usize },
    Static(&'static [u8]),
}

impl Chunk {
    pub fn owned(data: impl Into<Vec<u8>>) -> Self {
        Self::Owned {
            data: data.into(),
            offset: 0,
        }
    }

    /// Remaining bytes.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Owned { data, offset } => &data[*offset..],
            Self::Static(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop `n` bytes from the front without copying.
    fn advance(&mut self, n: usize) {
        match self {
            Self::Owned { data, offset } => {
                assert!(*offset + n <= data.len());
                *offset += n;
            }
            Self::Static(bytes) => {
                let rest: &'static [u8] = *bytes;
                *bytes = &rest[n..];
            }
        }
    }
}

impl From<&'static str> for Chunk {
    fn from(s: &'static str) -> Self {
        Self::Static(s.as_bytes())
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Self {
        Self::owned(s.into_bytes())
    }
}

/// Result of a drain that did not hit a hard error.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drained {
    pub sent: usize,
    /// The writer stopped accepting bytes; retry on the next write readiness.
    pub blocked: bool,
}

/// Ordered list of pending output chunks.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: VecDeque<Chunk>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: impl Into<Chunk>) {
        let chunk = chunk.into();
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    pub fn prepend(&mut self, chunk: impl Into<Chunk>) {
        let chunk = chunk.into();
        if !chunk.is_empty() {
            self.chunks.push_front(chunk);
        }
    }

    /// Move every chunk of `other` to the end of this buffer.
    pub fn append_buffer(&mut self, other: &mut ChunkBuffer) {
        self.chunks.append(&mut other.chunks);
    }

    /// Total number of unsent bytes.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Write as many bytes as `out` accepts.
    ///
    /// A short write leaves the rest of the head chunk in place. `WouldBlock` ends the drain
    /// without error; any other failure is returned and the unsent bytes stay buffered.
    pub fn drain<W: Write>(&mut self, out: &mut W) -> io::Result<Drained> {
        let mut drained = Drained::default();
        while let Some(chunk) = self.chunks.front_mut() {
            match out.write(chunk.bytes()) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write chunk",
                    ))
                }
                Ok(sent) => {
                    chunk.advance(sent);
                    drained.sent += sent;
                    if chunk.is_empty() {
                        self.chunks.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    drained.blocked = true;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(drained)
    }

    /// Read up to `PULL_BLOCK_SIZE` bytes from `src` into a new chunk. Returns bytes read.
    pub fn pull<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        let mut block = vec![0; PULL_BLOCK_SIZE];
        let read = loop {
            match src.read(&mut block) {
                Ok(read) => break read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        };
        block.truncate(read);
        self.append(Chunk::owned(block));
        Ok(read)
    }
}

/// What the send handler should do after a round of sending.
#[derive(Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// More to send; keep write interest.
    Pending,
    /// Buffer and file are exhausted.
    Finished,
}

/// Response bytes waiting for a socket, optionally fed from an open file.
#[derive(Debug, Default)]
pub struct ContentSender {
    pub buffer: ChunkBuffer,
    file: Option<File>,
}

impl ContentSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream `file` after whatever is already buffered.
    pub fn stream_file(&mut self, file: File) {
        self.file = Some(file);
    }

    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }

    /// One write-readiness round: refill from the file when the buffer ran dry, then drain.
    pub fn send<W: Write>(&mut self, out: &mut W) -> io::Result<SendStatus> {
        if self.buffer.is_empty() {
            if let Some(file) = self.file.as_mut() {
                match self.buffer.pull(file) {
                    Ok(0) => self.file = None,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.buffer.drain(out)?;
        if self.buffer.is_empty() && self.file.is_none() {
            Ok(SendStatus::Finished)
        } else {
            Ok(SendStatus::Pending)
        }
    }
}
