//! The whole-archive integrity table.
//!
//! The table digests the byte range from the end of the header to the end
//! of the lookup table, in 10 MiB chunks, one SHA-1 per chunk. It sits
//! after the XML document and is the last thing written before the final
//! header. Appends reuse the previous table's digests for chunks whose
//! bytes were already covered and untouched.

use std::io::{Read, Seek, SeekFrom, Write};

use binrw::{BinReaderExt, BinWriterExt};
use log::debug;

use crate::io_utils::{CountingHashReader, OutputFile};
use crate::records::{IntegrityHeader, ResourceEntry, INTEGRITY_HEADER_SIZE};
use crate::{Sha1Hash, WimError, WimResult, HEADER_SIZE};

/// Bytes covered by one integrity digest.
pub const INTEGRITY_CHUNK_SIZE: u32 = 10 * 1024 * 1024;

const IO_BLOCK: usize = 1 << 16;

/// A parsed integrity table.
pub(crate) struct IntegrityTable {
    pub chunk_size: u32,
    pub entries: Vec<Sha1Hash>,
}

impl IntegrityTable {
    /// Bytes the stored form occupies.
    fn stored_size(num_entries: u64) -> u64 {
        INTEGRITY_HEADER_SIZE + num_entries * 20
    }
}

pub(crate) fn read_integrity_table<R: Read + Seek>(
    reader: &mut R,
    entry: &ResourceEntry,
) -> WimResult<IntegrityTable> {
    reader
        .seek(SeekFrom::Start(entry.offset))
        .map_err(WimError::Read)?;
    let header: IntegrityHeader = reader.read_le()?;
    if header.chunk_size == 0
        || IntegrityTable::stored_size(header.num_entries as u64) != entry.size_in_wim
    {
        return Err(WimError::InvalidParam("malformed integrity table header"));
    }
    let mut entries = Vec::with_capacity(header.num_entries as usize);
    for _ in 0..header.num_entries {
        let mut digest: Sha1Hash = [0; 20];
        reader.read_exact(&mut digest).map_err(WimError::Read)?;
        entries.push(digest);
    }
    Ok(IntegrityTable {
        chunk_size: header.chunk_size,
        entries,
    })
}

/// Hashes `[HEADER_SIZE, covered_end)` of the file in one-chunk strides
/// and hands each digest to `emit`.
fn digest_chunks<R: Read + Seek>(
    reader: &mut R,
    covered_end: u64,
    mut reusable: impl FnMut(usize) -> Option<Sha1Hash>,
    mut emit: impl FnMut(usize, Sha1Hash),
) -> WimResult<()> {
    let covered = covered_end - HEADER_SIZE;
    let num_chunks = covered.div_ceil(INTEGRITY_CHUNK_SIZE as u64) as usize;
    let mut block = vec![0u8; IO_BLOCK];

    for i in 0..num_chunks {
        let start = HEADER_SIZE + i as u64 * INTEGRITY_CHUNK_SIZE as u64;
        let len = (covered_end - start).min(INTEGRITY_CHUNK_SIZE as u64);
        if let Some(digest) = reusable(i) {
            emit(i, digest);
            continue;
        }
        reader.seek(SeekFrom::Start(start)).map_err(WimError::Read)?;
        let mut hashing = CountingHashReader::new(&mut *reader);
        let mut remaining = len;
        while remaining > 0 {
            let take = remaining.min(IO_BLOCK as u64) as usize;
            hashing
                .read_exact(&mut block[..take])
                .map_err(WimError::Read)?;
            remaining -= take as u64;
        }
        debug_assert_eq!(hashing.position(), len);
        emit(i, hashing.finalize());
    }
    Ok(())
}

/// Computes and writes the integrity table at the current position and
/// returns its resource entry.
///
/// `new_lookup_end` is the end of the just-written lookup table (the table
/// covers up to there); `old_lookup_end` and `old_table` let an append
/// reuse digests of chunks that lie entirely inside the previous archive's
/// covered range, which was not touched.
pub(crate) fn write_integrity_table<W: OutputFile>(
    out: &mut W,
    new_lookup_end: u64,
    old_lookup_end: Option<u64>,
    old_table: Option<&IntegrityTable>,
) -> WimResult<ResourceEntry> {
    let table_offset = out.stream_position().map_err(WimError::Write)?;

    let old_covered = match (old_lookup_end, old_table) {
        (Some(end), Some(table)) if table.chunk_size == INTEGRITY_CHUNK_SIZE && end > HEADER_SIZE => {
            end - HEADER_SIZE
        }
        _ => 0,
    };
    // Only chunks that were full in the old table cover the same bytes in
    // the new one.
    let reusable_chunks =
        (old_covered / INTEGRITY_CHUNK_SIZE as u64) as usize;

    let covered = new_lookup_end - HEADER_SIZE;
    let num_chunks = covered.div_ceil(INTEGRITY_CHUNK_SIZE as u64) as usize;
    let mut entries: Vec<Sha1Hash> = Vec::with_capacity(num_chunks);

    let mut reused = 0usize;
    digest_chunks(
        out,
        new_lookup_end,
        |i| {
            if i < reusable_chunks {
                let digest = old_table.and_then(|t| t.entries.get(i).copied());
                if digest.is_some() {
                    reused += 1;
                }
                digest
            } else {
                None
            }
        },
        |_, digest| entries.push(digest),
    )?;
    if reused > 0 {
        debug!("reused {reused}/{num_chunks} integrity digests");
    }

    let table_size = IntegrityTable::stored_size(num_chunks as u64);
    out.seek(SeekFrom::Start(table_offset))
        .map_err(WimError::Write)?;
    out.write_le(&IntegrityHeader {
        table_size: table_size as u32,
        num_entries: num_chunks as u32,
        chunk_size: INTEGRITY_CHUNK_SIZE,
    })?;
    for digest in &entries {
        out.write_all(digest).map_err(WimError::Write)?;
    }

    Ok(ResourceEntry {
        size_in_wim: table_size,
        flags: 0,
        offset: table_offset,
        original_size: table_size,
    })
}

/// Recomputes every digest and compares it to the stored table.
pub(crate) fn check_integrity<R: Read + Seek>(
    reader: &mut R,
    entry: &ResourceEntry,
    lookup_end: u64,
) -> WimResult<()> {
    let table = read_integrity_table(reader, entry)?;
    if table.chunk_size != INTEGRITY_CHUNK_SIZE {
        return Err(WimError::InvalidParam("unexpected integrity chunk size"));
    }
    let covered = lookup_end - HEADER_SIZE;
    let num_chunks = covered.div_ceil(table.chunk_size as u64) as usize;
    if num_chunks != table.entries.len() {
        return Err(WimError::InvalidParam(
            "integrity table does not cover the archive",
        ));
    }
    let mut failed = None;
    digest_chunks(
        reader,
        lookup_end,
        |_| None,
        |i, digest| {
            if failed.is_none() && table.entries[i] != digest {
                failed = Some(i);
            }
        },
    )?;
    match failed {
        Some(chunk) => Err(WimError::Integrity { chunk }),
        None => Ok(()),
    }
}
