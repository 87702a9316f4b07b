//! Reading stream bytes out of their backing sources.
//!
//! A [`StreamReader`] is opened once per stream and then serves positioned
//! reads for every chunk, so the backing handle (file descriptor, archive
//! slice, caller backend) is resolved a single time. Sources embedded in an
//! existing archive are decompressed transparently, one chunk at a time,
//! with the most recently inflated chunk cached for the sequential access
//! pattern of the codec.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::io_utils::read_chunk_entry;
use crate::stream::{StreamBackend, StreamDescriptor, StreamSource, WimFile};
use crate::{
    chunk_count, chunk_entry_width, CodecRegistry, Decompressor, WimError, WimResult, CHUNK_SIZE,
};

enum Backing {
    Empty,
    File {
        file: fs::File,
    },
    Backend {
        backend: Arc<dyn StreamBackend>,
    },
    /// Bytes stored plain inside an archive; logical offsets map directly.
    WimPlain {
        file: Arc<WimFile>,
        offset: u64,
    },
    /// The stored form verbatim, chunk table included (raw-copy reads).
    WimStored {
        file: Arc<WimFile>,
        offset: u64,
        stored_size: u64,
    },
    WimChunked(Box<ChunkedSource>),
}

/// Reads the uncompressed bytes of one stream.
pub struct StreamReader {
    size: u64,
    backing: Backing,
}

impl StreamReader {
    /// Opens the descriptor's source for uncompressed reads.
    pub fn open(desc: &StreamDescriptor, codecs: &CodecRegistry) -> WimResult<Self> {
        let backing = if desc.size == 0 {
            Backing::Empty
        } else {
            match &desc.source {
                StreamSource::File { path } => {
                    let file = fs::File::open(path).map_err(|source| WimError::Open {
                        path: path.clone(),
                        source,
                    })?;
                    Backing::File { file }
                }
                StreamSource::Backend { backend } => Backing::Backend {
                    backend: Arc::clone(backend),
                },
                StreamSource::Wim {
                    file,
                    entry,
                    compression,
                } => {
                    if !entry.is_compressed() {
                        Backing::WimPlain {
                            file: Arc::clone(file),
                            offset: entry.offset,
                        }
                    } else {
                        let compression = compression
                            .ok_or(WimError::InvalidParam("compressed entry without a codec tag"))?;
                        let decompressor = codecs.decompressor(compression)?;
                        Backing::WimChunked(Box::new(ChunkedSource::open(
                            Arc::clone(file),
                            entry.offset,
                            entry.size_in_wim,
                            entry.original_size,
                            decompressor,
                        )?))
                    }
                }
            }
        };
        Ok(Self {
            size: desc.size,
            backing,
        })
    }

    /// Opens the stored form of an archive-embedded stream for verbatim
    /// copies. The reader then yields `stored_size()` bytes, chunk table
    /// included, with no decompression and no hashing.
    pub fn open_stored(desc: &StreamDescriptor) -> WimResult<Self> {
        match &desc.source {
            StreamSource::Wim { file, entry, .. } => Ok(Self {
                size: desc.size,
                backing: Backing::WimStored {
                    file: Arc::clone(file),
                    offset: entry.offset,
                    stored_size: entry.size_in_wim,
                },
            }),
            _ => Err(WimError::InvalidParam(
                "verbatim copies need an archive-backed source",
            )),
        }
    }

    /// Uncompressed stream size (stored size in verbatim mode).
    pub fn len(&self) -> u64 {
        match &self.backing {
            Backing::WimStored { stored_size, .. } => *stored_size,
            _ => self.size,
        }
    }

    /// Fills `buf` from logical offset `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> WimResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset + buf.len() as u64 > self.len() {
            return Err(WimError::UnexpectedEof);
        }
        match &mut self.backing {
            Backing::Empty => unreachable!("bounds check rejects reads from empty streams"),
            Backing::File { file } => {
                file.seek(SeekFrom::Start(offset)).map_err(WimError::Read)?;
                file.read_exact(buf).map_err(read_err)
            }
            Backing::Backend { backend } => backend.read_at(offset, buf).map_err(read_err),
            Backing::WimPlain { file, offset: base } => {
                file.read_exact_at(*base + offset, buf).map_err(read_err)
            }
            Backing::WimStored { file, offset: base, .. } => {
                file.read_exact_at(*base + offset, buf).map_err(read_err)
            }
            Backing::WimChunked(chunked) => chunked.read_at(offset, buf),
        }
    }
}

fn read_err(e: io::Error) -> WimError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        WimError::UnexpectedEof
    } else {
        WimError::Read(e)
    }
}

/// A chunk-compressed resource inside an existing archive.
///
/// The chunk table is loaded once at open. `chunk_ends[i]` is the payload
/// offset one past chunk `i`, so chunk `i` occupies
/// `[chunk_ends[i-1], chunk_ends[i])` of the payload (with an implied zero
/// before chunk 0). A chunk whose stored size equals its uncompressed size
/// is stored raw; there is no marker bit.
struct ChunkedSource {
    file: Arc<WimFile>,
    payload_offset: u64,
    original_size: u64,
    chunk_ends: Vec<u64>,
    decompressor: Arc<dyn Decompressor>,
    cached_chunk: Option<u64>,
    cache: Vec<u8>,
    scratch: Vec<u8>,
}

impl ChunkedSource {
    fn open(
        file: Arc<WimFile>,
        offset: u64,
        size_in_wim: u64,
        original_size: u64,
        decompressor: Arc<dyn Decompressor>,
    ) -> WimResult<Self> {
        let num_chunks = chunk_count(original_size);
        let entry_width = chunk_entry_width(original_size);
        let table_size = entry_width as u64 * (num_chunks - 1);
        if table_size >= size_in_wim {
            return Err(WimError::InvalidParam(
                "stored resource is smaller than its chunk table",
            ));
        }

        let mut table = vec![0u8; table_size as usize];
        file.read_exact_at(offset, &mut table).map_err(read_err)?;
        let mut cursor = &table[..];

        let payload_size = size_in_wim - table_size;
        let mut chunk_ends = Vec::with_capacity(num_chunks as usize);
        let mut prev = 0u64;
        for _ in 1..num_chunks {
            // Entries are offsets from the end of the table; entry 0 is
            // implied and omitted, so the table directly yields each
            // chunk's end.
            let end = read_chunk_entry(&mut cursor, entry_width).map_err(WimError::Read)?;
            if end <= prev || end > payload_size {
                return Err(WimError::InvalidParam("chunk table offsets not increasing"));
            }
            chunk_ends.push(end);
            prev = end;
        }
        chunk_ends.push(payload_size);

        Ok(Self {
            file,
            payload_offset: offset + table_size,
            original_size,
            chunk_ends,
            decompressor,
            cached_chunk: None,
            cache: Vec::new(),
            scratch: Vec::new(),
        })
    }

    fn chunk_span(&self, index: u64) -> (u64, u64) {
        let start = if index == 0 {
            0
        } else {
            self.chunk_ends[index as usize - 1]
        };
        (start, self.chunk_ends[index as usize])
    }

    fn uncompressed_chunk_size(&self, index: u64) -> usize {
        (self.original_size - index * CHUNK_SIZE as u64).min(CHUNK_SIZE as u64) as usize
    }

    /// Loads chunk `index` into the cache, inflating if it shrank.
    fn load_chunk(&mut self, index: u64) -> WimResult<()> {
        if self.cached_chunk == Some(index) {
            return Ok(());
        }
        let (start, end) = self.chunk_span(index);
        let stored_size = (end - start) as usize;
        let chunk_size = self.uncompressed_chunk_size(index);

        self.cache.clear();
        self.cache.resize(chunk_size, 0);
        if stored_size == chunk_size {
            // Stored raw: the anti-expansion rule wrote it uncompressed.
            self.file
                .read_exact_at(self.payload_offset + start, &mut self.cache)
                .map_err(read_err)?;
        } else {
            self.scratch.clear();
            self.scratch.resize(stored_size, 0);
            self.file
                .read_exact_at(self.payload_offset + start, &mut self.scratch)
                .map_err(read_err)?;
            self.decompressor.decompress(&self.scratch, &mut self.cache)?;
        }
        self.cached_chunk = Some(index);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> WimResult<()> {
        let mut pos = offset;
        let mut filled = 0usize;
        while filled < buf.len() {
            let chunk = pos / CHUNK_SIZE as u64;
            self.load_chunk(chunk)?;
            let within = (pos % CHUNK_SIZE as u64) as usize;
            let take = (self.cache.len() - within).min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&self.cache[within..within + take]);
            filled += take;
            pos += take as u64;
        }
        Ok(())
    }
}
