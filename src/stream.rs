//! Stream descriptors: what the writer is asked to put into an archive.
//!
//! A stream is a blob of bytes identified by its SHA-1 digest. Where the
//! bytes currently live is the descriptor's *source*; where they end up in
//! the output is its *output entry*, filled in by the writer.

use std::fmt;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::records::ResourceEntry;
use crate::{Compression, Sha1Hash, WimError, WimResult, ZERO_HASH};

/// Read access to an archive that backs one or more stream sources.
///
/// The handle is shared by every descriptor loaded from the same file, so
/// a raw copy or a chunk read never has to reopen it.
pub struct WimFile {
    pub(crate) path: PathBuf,
    file: Mutex<fs::File>,
}

impl WimFile {
    pub(crate) fn new(path: PathBuf, file: fs::File) -> Self {
        Self {
            path,
            file: Mutex::new(file),
        }
    }

    /// Fills `buf` from the absolute file offset, failing on short reads.
    pub(crate) fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock().expect("archive handle poisoned");
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

impl fmt::Debug for WimFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WimFile").field("path", &self.path).finish()
    }
}

/// Capability set a caller-provided stream source must offer: a fixed size
/// and positioned reads of the uncompressed bytes. Implementations must be
/// shareable across threads; the writer itself only reads from one thread
/// at a time.
pub trait StreamBackend: Send + Sync {
    fn size(&self) -> u64;

    /// Fills `buf` starting at logical `offset`. Short data is an error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

impl fmt::Debug for dyn StreamBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamBackend({} bytes)", self.size())
    }
}

/// Where a stream's bytes currently live.
#[derive(Debug, Clone)]
pub enum StreamSource {
    /// A slice of an existing archive, possibly chunk-compressed there.
    Wim {
        file: Arc<WimFile>,
        entry: ResourceEntry,
        /// Codec of the source archive; meaningful only when the entry has
        /// the compressed flag.
        compression: Option<Compression>,
    },
    /// A file on disk, read through one cached handle.
    File { path: PathBuf },
    /// An opaque caller-provided backend.
    Backend { backend: Arc<dyn StreamBackend> },
}

impl StreamSource {
    /// The codec the source bytes are stored with, or `None` when they are
    /// plain (files, backends, uncompressed archive slices).
    pub(crate) fn compression(&self) -> Option<Compression> {
        match self {
            StreamSource::Wim {
                entry, compression, ..
            } if entry.is_compressed() => *compression,
            _ => None,
        }
    }
}

/// One stream the writer has been asked to emit.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    /// SHA-1 of the uncompressed bytes; all-zero until discovered during
    /// the write.
    pub hash: Sha1Hash,
    /// Uncompressed size.
    pub size: u64,
    pub source: StreamSource,
    /// Incoming references (dentries, images) to this stream.
    pub ref_count: u32,
    /// References that will exist in the archive being written.
    pub(crate) out_ref_count: u32,
    /// Extra resource-flag bits to set on the written entry (metadata).
    pub(crate) extra_flags: u8,
    /// Where the stream landed in the output; populated by the writer.
    pub(crate) out_entry: Option<ResourceEntry>,
}

impl StreamDescriptor {
    pub fn new(source: StreamSource, size: u64) -> Self {
        Self {
            hash: ZERO_HASH,
            size,
            source,
            ref_count: 1,
            out_ref_count: 1,
            extra_flags: 0,
            out_entry: None,
        }
    }

    pub fn with_hash(source: StreamSource, size: u64, hash: Sha1Hash) -> Self {
        Self {
            hash,
            ..Self::new(source, size)
        }
    }

    /// Builds a descriptor for a file on disk, taking the size from its
    /// metadata.
    pub fn from_file<P: AsRef<Path>>(path: P) -> WimResult<Self> {
        let path = path.as_ref().to_owned();
        let meta = fs::metadata(&path).map_err(|source| WimError::Open {
            path: path.clone(),
            source,
        })?;
        Ok(Self::new(StreamSource::File { path }, meta.len()))
    }

    pub fn from_backend(backend: Arc<dyn StreamBackend>) -> Self {
        let size = backend.size();
        Self::new(StreamSource::Backend { backend }, size)
    }

    /// Resource entry describing where the stream was written, if it has
    /// been.
    pub fn output_entry(&self) -> Option<&ResourceEntry> {
        self.out_entry.as_ref()
    }

    /// Whether the stream's stored bytes can be copied verbatim: the source
    /// is already encoded with the requested output codec and the caller
    /// did not ask for recompression. A `None` target never raw-copies;
    /// plain bytes always go through the chunk loop so the digest is
    /// maintained.
    pub(crate) fn is_raw_copy(&self, out: Option<Compression>, recompress: bool) -> bool {
        !recompress && out.is_some() && self.source.compression() == out
    }

    /// Streams the parallel writer never dispatches to a worker: nothing
    /// to compress.
    pub(crate) fn is_direct_write(&self, out: Option<Compression>, recompress: bool) -> bool {
        self.size == 0 || self.is_raw_copy(out, recompress)
    }
}
