#![doc = include_str!("../README.md")]

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

mod integrity;
mod io_utils;
mod parallel;
pub mod read;
mod reader;
pub mod records;
mod resource;
mod stream;
pub mod write;
mod xml;

pub use read::OpenFlag;
pub use records::ResourceEntry;
pub use stream::{StreamBackend, StreamDescriptor, StreamSource, WimFile};
pub use write::{WriteFlag, WriteOptions};

/// Magic bytes at the start of every archive.
pub const MAGIC: &[u8; 8] = b"MSWIM\0\0\0";

/// Fixed size of the archive header, magic included.
pub const HEADER_SIZE: u64 = 212;

/// Streams are compressed in independent slices of this many bytes.
pub const CHUNK_SIZE: usize = 32_768;

/// A SHA-1 digest, the identity of a stream.
pub type Sha1Hash = [u8; 20];

/// The "not hashed yet" sentinel.
pub const ZERO_HASH: Sha1Hash = [0; 20];

pub fn is_zero_hash(hash: &Sha1Hash) -> bool {
    *hash == ZERO_HASH
}

/// Chunks needed to hold `size` bytes.
pub(crate) fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// Width of one chunk-table entry: 4 bytes, or 8 once the uncompressed
/// size no longer fits in 32 bits.
pub(crate) fn chunk_entry_width(size: u64) -> usize {
    if size >= 1 << 32 {
        8
    } else {
        4
    }
}

/// Stream compression codecs, identified on disk by header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    Xpress,
    Lzx,
}

impl Compression {
    pub(crate) fn header_flag(self) -> u32 {
        match self {
            Compression::Xpress => records::hdrflag::COMPRESS_XPRESS,
            Compression::Lzx => records::hdrflag::COMPRESS_LZX,
        }
    }

    pub(crate) fn from_header_flags(flags: u32) -> WimResult<Option<Compression>> {
        use records::hdrflag as f;
        if flags & f::COMPRESSION == 0 {
            return Ok(None);
        }
        if flags & f::COMPRESS_XPRESS != 0 {
            Ok(Some(Compression::Xpress))
        } else if flags & f::COMPRESS_LZX != 0 {
            Ok(Some(Compression::Lzx))
        } else {
            Err(WimError::InvalidParam("unknown compression flag bits"))
        }
    }
}

/// A chunk compressor.
///
/// `compress` encodes `src` into `dst` and returns the encoded length, or
/// `None` when the result would not fit in `dst` — for chunk output the
/// buffer is one byte shorter than the input, so `None` means "did not
/// shrink" and the chunk is stored raw. Implementations must not fail any
/// other way.
pub trait Compressor: Send + Sync {
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Option<usize>;
}

/// A chunk decompressor: inflates `src` into exactly `dst.len()` bytes.
pub trait Decompressor: Send + Sync {
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> WimResult<()>;
}

type CodecPair = (Arc<dyn Compressor>, Arc<dyn Decompressor>);

/// The codecs available to one archive. Codecs are request-scoped: each
/// [`Wim`] carries its own registry and nothing is process-global.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    xpress: Option<CodecPair>,
    lzx: Option<CodecPair>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: Compression,
        compressor: Arc<dyn Compressor>,
        decompressor: Arc<dyn Decompressor>,
    ) {
        let slot = match kind {
            Compression::Xpress => &mut self.xpress,
            Compression::Lzx => &mut self.lzx,
        };
        *slot = Some((compressor, decompressor));
    }

    pub(crate) fn compressor(&self, kind: Compression) -> WimResult<Arc<dyn Compressor>> {
        self.pair(kind)
            .map(|(c, _)| Arc::clone(c))
            .ok_or(WimError::NoCodec(kind))
    }

    pub(crate) fn decompressor(&self, kind: Compression) -> WimResult<Arc<dyn Decompressor>> {
        self.pair(kind)
            .map(|(_, d)| Arc::clone(d))
            .ok_or(WimError::NoCodec(kind))
    }

    fn pair(&self, kind: Compression) -> Option<&CodecPair> {
        match kind {
            Compression::Xpress => self.xpress.as_ref(),
            Compression::Lzx => self.lzx.as_ref(),
        }
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("xpress", &self.xpress.is_some())
            .field("lzx", &self.lzx.is_some())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum WimError {
    #[error("couldn't open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("read error: {0}")]
    Read(io::Error),
    #[error("unexpected end of a stream source")]
    UnexpectedEof,
    #[error("write error: {0}")]
    Write(io::Error),
    #[error("out of memory sizing the compressor pool")]
    NoMem,
    #[error("stream hash mismatch: expected {expected:02x?}, computed {computed:02x?}")]
    InvalidResourceHash {
        expected: Sha1Hash,
        computed: Sha1Hash,
    },
    #[error("archive layout unsuitable for in-place append: {0}")]
    ResourceOrder(&'static str),
    #[error("the archive is locked by another writer")]
    AlreadyLocked,
    #[error("split archives are unsupported (part {part} of {total})")]
    SplitUnsupported { part: u16, total: u16 },
    #[error("couldn't rename temporary file over {path}: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("couldn't reopen {path} for writing: {source}")]
    Reopen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("no image with index {0}")]
    InvalidImage(u32),
    #[error("the archive has no backing file")]
    NoFilename,
    #[error("bad magic bytes at start of file")]
    BadMagic,
    #[error("unsupported format version {0:#x}")]
    UnsupportedVersion(u32),
    #[error("unsupported chunk size {0}")]
    UnsupportedChunkSize(u32),
    #[error("no codec registered for {0:?} compression")]
    NoCodec(Compression),
    #[error("a compressed chunk failed to decompress")]
    Decompression,
    #[error("a compressor worker exited unexpectedly")]
    WorkerLost,
    #[error("integrity check failed on chunk {chunk}")]
    Integrity { chunk: usize },
    #[error("failed to (de)serialize an on-disk structure: {0}")]
    Parse(#[from] binrw::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
}

pub type WimResult<T> = Result<T, WimError>;

/// One image of an archive: a metadata stream plus its XML element.
///
/// The metadata blob (the serialized directory tree) is opaque to this
/// crate; capture tooling produces it and apply tooling consumes it.
#[derive(Debug, Clone)]
pub struct Image {
    pub name: String,
    /// Index of the image's metadata stream in [`Wim::streams`].
    pub(crate) stream: usize,
    /// Extra XML carried inside the image's element, verbatim.
    pub(crate) extra_xml: String,
}

/// An archive being assembled, appended to, or read.
///
/// ```no_run
/// use wim::{Compression, StreamDescriptor, Wim, WriteOptions};
///
/// # fn main() -> wim::WimResult<()> {
/// let mut wim = Wim::create();
/// wim.add_stream(StreamDescriptor::from_file("vmlinuz")?);
/// wim.write_to("out.wim", &WriteOptions::new())?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Wim {
    pub(crate) header: records::WimHeader,
    pub(crate) streams: Vec<StreamDescriptor>,
    pub(crate) hash_index: HashMap<Sha1Hash, usize>,
    pub(crate) images: Vec<Image>,
    pub(crate) codecs: CodecRegistry,
    pub(crate) source: Option<Arc<WimFile>>,
    /// A stream or image was removed since the archive was opened.
    pub(crate) deletions: bool,
    /// An image was added or changed since the archive was opened.
    pub(crate) images_dirty: bool,
    /// A reference count changed since the archive was opened, so the
    /// lookup table must be rewritten even if no new bytes are.
    pub(crate) refs_dirty: bool,
}

impl Default for Wim {
    fn default() -> Self {
        Self::create()
    }
}

impl Wim {
    /// A new, empty archive with a fresh GUID.
    pub fn create() -> Self {
        Self {
            header: records::WimHeader::new(rand::random()),
            streams: Vec::new(),
            hash_index: HashMap::new(),
            images: Vec::new(),
            codecs: CodecRegistry::new(),
            source: None,
            deletions: false,
            images_dirty: false,
            refs_dirty: false,
        }
    }

    /// The codec of the archive's stored streams, from the header flags.
    pub fn compression(&self) -> Option<Compression> {
        Compression::from_header_flags(self.header.flags).unwrap_or(None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.source.as_deref().map(|s| s.path.as_path())
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn boot_index(&self) -> u32 {
        self.header.boot_index
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn codecs_mut(&mut self) -> &mut CodecRegistry {
        &mut self.codecs
    }

    /// Index of the stream with this hash, if present.
    pub fn lookup(&self, hash: &Sha1Hash) -> Option<usize> {
        self.hash_index.get(hash).copied()
    }

    /// Queues a stream for the next write and returns its index.
    ///
    /// Content addressing happens here: a descriptor whose (known) hash is
    /// already present only bumps the existing entry's reference count.
    /// Descriptors with an undiscovered hash are always queued; their
    /// digest is computed while they are written.
    pub fn add_stream(&mut self, desc: StreamDescriptor) -> usize {
        if !is_zero_hash(&desc.hash) {
            if let Some(&existing) = self.hash_index.get(&desc.hash) {
                let stream = &mut self.streams[existing];
                stream.ref_count += desc.ref_count;
                stream.out_ref_count += desc.ref_count;
                self.refs_dirty = true;
                return existing;
            }
        }
        let index = self.streams.len();
        if !is_zero_hash(&desc.hash) {
            self.hash_index.insert(desc.hash, index);
        }
        self.streams.push(desc);
        index
    }

    /// Convenience for [`Wim::add_stream`] with a file source.
    pub fn add_stream_from_file<P: AsRef<Path>>(&mut self, path: P) -> WimResult<usize> {
        Ok(self.add_stream(StreamDescriptor::from_file(path)?))
    }

    /// Adds an image backed by the given metadata stream and returns the
    /// new image's 1-based index.
    pub fn add_image(&mut self, name: &str, mut metadata: StreamDescriptor) -> u32 {
        metadata.extra_flags |= records::resflag::METADATA;
        let stream = self.streams.len();
        self.streams.push(metadata);
        self.images.push(Image {
            name: name.to_owned(),
            stream,
            extra_xml: String::new(),
        });
        self.images_dirty = true;
        self.images.len() as u32
    }

    /// Removes the image with the given 1-based index. The next overwrite
    /// rebuilds the archive unless [`WriteFlag::SoftDelete`] allows
    /// appending around the dead bytes.
    pub fn delete_image(&mut self, index: u32) -> WimResult<()> {
        if index == 0 || index as usize > self.images.len() {
            return Err(WimError::InvalidImage(index));
        }
        let image = self.images.remove(index as usize - 1);
        let stream = &mut self.streams[image.stream];
        stream.ref_count = stream.ref_count.saturating_sub(1);
        stream.out_ref_count = stream.out_ref_count.saturating_sub(1);
        self.deletions = true;
        self.images_dirty = true;
        self.refs_dirty = true;

        if self.header.boot_index == index {
            self.header.boot_index = 0;
        } else if self.header.boot_index > index {
            self.header.boot_index -= 1;
        }
        Ok(())
    }

    /// Marks an image bootable (`0` clears the mark).
    pub fn set_boot_image(&mut self, index: u32) -> WimResult<()> {
        if index as usize > self.images.len() {
            return Err(WimError::InvalidImage(index));
        }
        self.header.boot_index = index;
        self.images_dirty = true;
        Ok(())
    }
}
