//! Sequential buffered byte streams used to save and restore the index.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{IndexError, IndexResult};

/// Shared handle to a buffered output stream.
///
/// Cloning the handle does not duplicate the stream; every clone appends
/// to the same sink in call order.
#[derive(Clone)]
pub struct BufferedWriter {
    inner: Arc<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl BufferedWriter {
    /// Wrap any sink.
    pub fn new<W: Write + Send + 'static>(sink: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufWriter::new(Box::new(sink)))),
        }
    }

    /// Create (or truncate) a file and write to it.
    pub fn create(path: &Path) -> IndexResult<Self> {
        Ok(Self::new(File::create(path)?))
    }

    /// Append all of `bytes` to the stream.
    pub fn write_all(&self, bytes: &[u8]) -> IndexResult<()> {
        self.inner.lock().write_all(bytes)?;
        Ok(())
    }

    /// Push buffered bytes down to the sink.
    pub fn flush(&self) -> IndexResult<()> {
        self.inner.lock().flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for BufferedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedWriter").finish_non_exhaustive()
    }
}

/// Buffered input stream with exact-read semantics.
pub struct BufferedReader {
    inner: BufReader<Box<dyn Read + Send>>,
}

impl BufferedReader {
    /// Wrap any source.
    pub fn new<R: Read + Send + 'static>(source: R) -> Self {
        Self {
            inner: BufReader::new(Box::new(source)),
        }
    }

    /// Open a file for reading.
    pub fn open(path: &Path) -> IndexResult<Self> {
        Ok(Self::new(File::open(path)?))
    }

    /// Fill `buf` completely. Running out of data is reported as corruption.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> IndexResult<()> {
        let wanted = buf.len();
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                IndexError::CorruptComponent(format!("short read of {} bytes", wanted))
            } else {
                IndexError::Io(e)
            }
        })
    }
}

impl std::fmt::Debug for BufferedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedReader").finish_non_exhaustive()
    }
}

/// Growable in-memory sink that can be read back after writing.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
