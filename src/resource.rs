//! The chunked resource codec: one stream in, one encoded resource out.
//!
//! A compressed resource is laid out as `[chunk table | chunk 0 | … |
//! chunk n-1]`, each chunk independently compressed. Table entries are the
//! byte offsets of each chunk counted from the end of the table; entry 0 is
//! always zero and omitted on disk, so the table occupies
//! `entry_width × (n − 1)` bytes. Whether an individual chunk shrank is
//! never recorded anywhere: a chunk stored at its uncompressed size *is*
//! raw, and readers recover that from the offsets alone.

use std::io::SeekFrom;
use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::io_utils::{write_chunk_entry, OutputFile};
use crate::reader::StreamReader;
use crate::records::{resflag, ResourceEntry};
use crate::stream::StreamDescriptor;
use crate::{
    chunk_count, chunk_entry_width, is_zero_hash, CodecRegistry, Compression, Compressor,
    Sha1Hash, WimError, WimResult, CHUNK_SIZE,
};

/// Everything the codec needs to know about the write it is part of.
pub(crate) struct StreamWriteParams<'a> {
    /// Requested output codec; `None` writes plain chunks with no table.
    pub compression: Option<Compression>,
    /// Resolved compressor, present exactly when `compression` is.
    pub compressor: Option<Arc<dyn Compressor>>,
    /// Registry used to inflate archive-embedded sources.
    pub codecs: &'a CodecRegistry,
    /// Forces already-compressed sources back through the chunk loop.
    pub recompress: bool,
}

/// Per-stream chunk table being built during a write.
pub(crate) struct ChunkTable {
    start_offset: u64,
    num_chunks: u64,
    entry_width: usize,
    /// Running end offset of each chunk appended so far, relative to the
    /// end of the table.
    chunk_ends: Vec<u64>,
}

impl ChunkTable {
    pub fn new(original_size: u64, start_offset: u64) -> Self {
        let num_chunks = chunk_count(original_size);
        Self {
            start_offset,
            num_chunks,
            entry_width: chunk_entry_width(original_size),
            chunk_ends: Vec::with_capacity(num_chunks as usize),
        }
    }

    pub fn num_chunks(&self) -> u64 {
        self.num_chunks
    }

    /// Bytes the table occupies on disk.
    pub fn disk_size(&self) -> u64 {
        self.entry_width as u64 * (self.num_chunks - 1)
    }

    /// Reserves the table's bytes at the current position by writing
    /// zeros; [`Self::patch`] overwrites them once the chunk sizes are
    /// known.
    pub fn reserve<W: OutputFile>(&self, out: &mut W) -> WimResult<()> {
        let zeros = [0u8; 512];
        let mut remaining = self.disk_size();
        while remaining > 0 {
            let take = remaining.min(zeros.len() as u64) as usize;
            out.write_all(&zeros[..take]).map_err(WimError::Write)?;
            remaining -= take as u64;
        }
        Ok(())
    }

    pub fn append_chunk(&mut self, stored_size: u64) {
        let end = self.payload_size() + stored_size;
        self.chunk_ends.push(end);
    }

    /// Payload bytes written so far (table excluded).
    pub fn payload_size(&self) -> u64 {
        self.chunk_ends.last().copied().unwrap_or(0)
    }

    /// Total stored size of the resource: table plus payload.
    pub fn stored_size(&self) -> u64 {
        self.disk_size() + self.payload_size()
    }

    /// Seeks back and fills in the reserved table, then restores the
    /// position to the end of the payload.
    pub fn patch<W: OutputFile>(&self, out: &mut W) -> WimResult<()> {
        debug_assert_eq!(self.chunk_ends.len() as u64, self.num_chunks);
        let end = out.stream_position().map_err(WimError::Write)?;
        out.seek(SeekFrom::Start(self.start_offset))
            .map_err(WimError::Write)?;
        // Entry i (for i in 1..n) is the start of chunk i, i.e. the end of
        // chunk i-1.
        for chunk_end in &self.chunk_ends[..self.chunk_ends.len() - 1] {
            write_chunk_entry(out, self.entry_width, *chunk_end).map_err(WimError::Write)?;
        }
        out.seek(SeekFrom::Start(end)).map_err(WimError::Write)?;
        Ok(())
    }
}

/// Encodes one stream at the current output position and returns its
/// resource entry. Fills in the descriptor's hash if it was still zero, or
/// fails if the computed digest disagrees with the declared one.
pub(crate) fn write_stream<W: OutputFile>(
    desc: &mut StreamDescriptor,
    out: &mut W,
    params: &StreamWriteParams<'_>,
) -> WimResult<ResourceEntry> {
    let offset = out.stream_position().map_err(WimError::Write)?;

    if desc.size == 0 {
        if is_zero_hash(&desc.hash) {
            desc.hash = Sha1::digest(b"").into();
        }
        let entry = ResourceEntry {
            size_in_wim: 0,
            flags: desc.extra_flags,
            offset,
            original_size: 0,
        };
        desc.out_entry = Some(entry);
        return Ok(entry);
    }

    if desc.is_raw_copy(params.compression, params.recompress) {
        let entry = raw_copy(desc, out, offset)?;
        desc.out_entry = Some(entry);
        return Ok(entry);
    }

    let mut reader = StreamReader::open(desc, params.codecs)?;
    let mut hasher = Sha1::new();
    let entry = write_chunks(desc, &mut reader, out, offset, params, &mut hasher)?;

    let computed: Sha1Hash = hasher.finalize().into();
    if is_zero_hash(&desc.hash) {
        desc.hash = computed;
    } else if desc.hash != computed {
        return Err(WimError::InvalidResourceHash {
            expected: desc.hash,
            computed,
        });
    }

    desc.out_entry = Some(entry);
    Ok(entry)
}

/// The chunk loop: reserve the table, read-hash-compress-store each chunk,
/// patch the table, and fall back to a plain rewrite if the encoded form
/// did not shrink.
fn write_chunks<W: OutputFile>(
    desc: &StreamDescriptor,
    reader: &mut StreamReader,
    out: &mut W,
    offset: u64,
    params: &StreamWriteParams<'_>,
    hasher: &mut Sha1,
) -> WimResult<ResourceEntry> {
    let size = desc.size;
    let mut table = params
        .compression
        .map(|_| ChunkTable::new(size, offset));
    if let Some(table) = &table {
        table.reserve(out)?;
    }

    let mut ubuf = vec![0u8; CHUNK_SIZE];
    let mut cbuf = vec![0u8; CHUNK_SIZE];
    let num_chunks = chunk_count(size);
    for i in 0..num_chunks {
        let pos = i * CHUNK_SIZE as u64;
        let to_read = (size - pos).min(CHUNK_SIZE as u64) as usize;
        let chunk = &mut ubuf[..to_read];
        reader.read_at(pos, chunk)?;
        hasher.update(&chunk[..]);

        let stored_size = match (&params.compressor, &table) {
            (Some(compressor), Some(_)) => {
                // A compressed chunk must be strictly smaller, so the
                // compressor only gets `to_read - 1` bytes to land in.
                match compressor.compress(chunk, &mut cbuf[..to_read - 1]) {
                    Some(len) => {
                        out.write_all(&cbuf[..len]).map_err(WimError::Write)?;
                        len as u64
                    }
                    None => {
                        out.write_all(chunk).map_err(WimError::Write)?;
                        to_read as u64
                    }
                }
            }
            _ => {
                out.write_all(chunk).map_err(WimError::Write)?;
                to_read as u64
            }
        };
        if let Some(table) = &mut table {
            table.append_chunk(stored_size);
        }
    }

    if let Some(table) = &table {
        table.patch(out)?;
        if table.stored_size() >= size {
            // Compression expanded the stream; store it plain instead.
            return rewrite_uncompressed(desc, out, offset, params.codecs);
        }
        Ok(ResourceEntry {
            size_in_wim: table.stored_size(),
            flags: desc.extra_flags | resflag::COMPRESSED,
            offset,
            original_size: size,
        })
    } else {
        Ok(ResourceEntry {
            size_in_wim: size,
            flags: desc.extra_flags,
            offset,
            original_size: size,
        })
    }
}

/// Rewinds to `offset`, rewrites the stream uncompressed and truncates the
/// file to exactly fit. Used when compression failed to shrink the stream
/// as a whole; also invoked from the parallel drain path, where the stream
/// being finalized is always the write frontier, so the rewind cannot
/// clobber any other stream's bytes.
pub(crate) fn rewrite_uncompressed<W: OutputFile>(
    desc: &StreamDescriptor,
    out: &mut W,
    offset: u64,
    codecs: &CodecRegistry,
) -> WimResult<ResourceEntry> {
    let size = desc.size;
    out.seek(SeekFrom::Start(offset)).map_err(WimError::Write)?;

    let mut reader = StreamReader::open(desc, codecs)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut pos = 0u64;
    while pos < size {
        let take = (size - pos).min(CHUNK_SIZE as u64) as usize;
        reader.read_at(pos, &mut buf[..take])?;
        out.write_all(&buf[..take]).map_err(WimError::Write)?;
        pos += take as u64;
    }

    out.truncate(offset + size).map_err(WimError::Write)?;
    out.seek(SeekFrom::Start(offset + size))
        .map_err(WimError::Write)?;

    Ok(ResourceEntry {
        size_in_wim: size,
        flags: desc.extra_flags,
        offset,
        original_size: size,
    })
}

/// Copies the stored form of an already-compatible resource verbatim,
/// chunk table and all. Bypasses hashing; the descriptor's digest came
/// from the source archive's lookup table.
fn raw_copy<W: OutputFile>(
    desc: &StreamDescriptor,
    out: &mut W,
    offset: u64,
) -> WimResult<ResourceEntry> {
    let mut reader = StreamReader::open_stored(desc)?;
    let stored_size = reader.len();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut pos = 0u64;
    while pos < stored_size {
        let take = (stored_size - pos).min(CHUNK_SIZE as u64) as usize;
        reader.read_at(pos, &mut buf[..take])?;
        out.write_all(&buf[..take]).map_err(WimError::Write)?;
        pos += take as u64;
    }

    Ok(ResourceEntry {
        size_in_wim: stored_size,
        flags: desc.extra_flags | resflag::COMPRESSED,
        offset,
        original_size: desc.size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamSource;
    use std::io::Cursor;
    use std::sync::Arc;

    /// Compresses runs of a single repeated byte to `[byte]`; anything
    /// else does not shrink. Enough to steer the codec's two paths.
    struct RunCompressor;

    impl Compressor for RunCompressor {
        fn compress(&self, src: &[u8], dst: &mut [u8]) -> Option<usize> {
            if !src.is_empty() && dst.len() >= 1 && src.iter().all(|b| *b == src[0]) {
                dst[0] = src[0];
                Some(1)
            } else {
                None
            }
        }
    }

    /// Refuses every chunk, which forces the anti-expansion fallback.
    struct NeverShrinks;

    impl Compressor for NeverShrinks {
        fn compress(&self, _: &[u8], _: &mut [u8]) -> Option<usize> {
            None
        }
    }

    fn bytes_desc(data: &[u8]) -> StreamDescriptor {
        struct Mem(Vec<u8>);
        impl crate::StreamBackend for Mem {
            fn size(&self) -> u64 {
                self.0.len() as u64
            }
            fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
                let start = offset as usize;
                buf.copy_from_slice(&self.0[start..start + buf.len()]);
                Ok(())
            }
        }
        StreamDescriptor::from_backend(Arc::new(Mem(data.to_vec())))
    }

    fn params<'a>(
        codecs: &'a CodecRegistry,
        compressor: Option<Arc<dyn Compressor>>,
    ) -> StreamWriteParams<'a> {
        StreamWriteParams {
            compression: compressor.as_ref().map(|_| Compression::Xpress),
            compressor,
            codecs,
            recompress: false,
        }
    }

    #[test]
    fn entry_width_boundary() {
        assert_eq!(chunk_entry_width((1 << 32) - 1), 4);
        assert_eq!(chunk_entry_width(1 << 32), 8);
    }

    #[test]
    fn single_chunk_stream_has_empty_table() {
        // Exactly one chunk: n - 1 = 0 table entries on disk.
        let data = vec![0x61u8; CHUNK_SIZE];
        let mut desc = bytes_desc(&data);
        let codecs = CodecRegistry::new();
        let mut out = Cursor::new(Vec::new());

        let entry = write_stream(
            &mut desc,
            &mut out,
            &params(&codecs, Some(Arc::new(RunCompressor))),
        )
        .unwrap();

        assert!(entry.is_compressed());
        assert_eq!(entry.original_size, CHUNK_SIZE as u64);
        // One chunk of identical bytes compresses to a single byte and the
        // table contributes nothing.
        assert_eq!(entry.size_in_wim, 1);
        assert_eq!(out.into_inner().len(), 1);
    }

    #[test]
    fn multi_chunk_table_offsets_are_monotonic() {
        // 100_000 bytes → 4 chunks → 3 four-byte table entries.
        let data = vec![0x42u8; 100_000];
        let mut desc = bytes_desc(&data);
        let codecs = CodecRegistry::new();
        let mut out = Cursor::new(Vec::new());

        let entry = write_stream(
            &mut desc,
            &mut out,
            &params(&codecs, Some(Arc::new(RunCompressor))),
        )
        .unwrap();

        let bytes = out.into_inner();
        assert_eq!(entry.size_in_wim as usize, bytes.len());
        // Table: 3 entries, 4 bytes each; every chunk shrank to one byte.
        assert_eq!(bytes.len(), 12 + 4);
        let mut prev = 0u32;
        for i in 0..3 {
            let end = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
            assert!(end > prev);
            prev = end;
        }
    }

    #[test]
    fn incompressible_stream_falls_back_to_plain() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut desc = bytes_desc(&data);
        let codecs = CodecRegistry::new();
        let mut out = Cursor::new(Vec::new());

        let entry = write_stream(
            &mut desc,
            &mut out,
            &params(&codecs, Some(Arc::new(NeverShrinks))),
        )
        .unwrap();

        assert!(!entry.is_compressed());
        assert_eq!(entry.size_in_wim, entry.original_size);
        // The rewrite truncated away the reserved table.
        assert_eq!(out.into_inner().len(), data.len());
    }

    #[test]
    fn hash_mismatch_is_fatal() {
        let data = vec![1u8; 1000];
        let mut desc = bytes_desc(&data);
        desc.hash = [0xee; 20];
        let codecs = CodecRegistry::new();
        let mut out = Cursor::new(Vec::new());

        let err = write_stream(&mut desc, &mut out, &params(&codecs, None)).unwrap_err();
        assert!(matches!(err, WimError::InvalidResourceHash { .. }));
    }

    #[test]
    fn zero_size_stream_writes_nothing() {
        let mut desc = bytes_desc(&[]);
        let codecs = CodecRegistry::new();
        let mut out = Cursor::new(Vec::new());

        let entry = write_stream(&mut desc, &mut out, &params(&codecs, None)).unwrap();
        assert_eq!(entry.size_in_wim, 0);
        assert_eq!(entry.original_size, 0);
        assert!(out.into_inner().is_empty());
        // SHA-1 of the empty stream, not the zero sentinel.
        assert!(!is_zero_hash(&desc.hash));
    }
}
