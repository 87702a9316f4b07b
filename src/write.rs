//! Writing archives: the stream-list writers and the finalization
//! protocol.
//!
//! An archive is laid out `[header | stream payloads | lookup table | XML
//! document | integrity table]`. The header is written first as a
//! placeholder and overwritten with the final offsets as the very last
//! step, so everything it points at exists before it is published.
//!
//! Overwriting an existing archive either *appends* (new streams and new
//! trailing tables are written past the old end, and a failure truncates
//! back to it) or *rebuilds* (a complete new archive is written to a
//! sibling temporary file and renamed over the original).

use std::fs;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use binrw::BinWriterExt;
use enumset::{EnumSet, EnumSetType};
use fs2::FileExt;
use log::{debug, warn};

use crate::integrity::{self, IntegrityTable};
use crate::io_utils::{CountingWriter, OutputFile};
use crate::parallel;
use crate::records::{hdrflag, LookupTableEntry, ResourceEntry};
use crate::resource::{self, StreamWriteParams};
use crate::stream::{StreamDescriptor, StreamSource, WimFile};
use crate::{xml, CodecRegistry, Compression, Wim, WimError, WimResult, HEADER_SIZE};

/// Below this much compressible data the parallel writer is not worth its
/// setup cost and the serial writer is used instead.
const SERIAL_THRESHOLD: u64 = 1 << 20;

/// Caller-selectable behavior of a write or overwrite.
#[derive(EnumSetType, Debug)]
pub enum WriteFlag {
    /// Compute and store the whole-archive integrity table.
    CheckIntegrity,
    /// Flush file contents to stable storage before returning (and before
    /// the rename, in rebuild mode).
    Fsync,
    /// Recompress streams even when their stored form already matches the
    /// requested codec.
    Recompress,
    /// Force a full rebuild instead of an in-place append.
    Rebuild,
    /// Allow appending even after deletions, leaving the deleted streams'
    /// bytes in place as dead space.
    SoftDelete,
}

/// Internal knobs the finalizer sets for itself.
#[derive(EnumSetType, Debug)]
pub(crate) enum InternalFlag {
    /// The old lookup table is still valid; don't rewrite it.
    NoLookupTable,
    /// Seed the new integrity table from the old one.
    ReuseIntegrityTable,
    /// Flush a header with a zeroed integrity slot after the XML document,
    /// bounding the damage if the process dies mid-integrity-table.
    CheckpointAfterXml,
}

/// Options for writing an archive.
///
/// ```
/// use wim::{Compression, WriteOptions, WriteFlag};
///
/// let opts = WriteOptions::new()
///     .compression(Some(Compression::Xpress))
///     .threads(4)
///     .flag(WriteFlag::CheckIntegrity);
/// # let _ = opts;
/// ```
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub(crate) compression: Option<Compression>,
    pub(crate) threads: usize,
    pub(crate) flags: EnumSet<WriteFlag>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Specifies the codec used for stream payloads, or `None` for plain
    /// storage. A compressor for the codec must be registered with the
    /// archive's [`CodecRegistry`](crate::CodecRegistry).
    pub fn compression(self, compression: Option<Compression>) -> Self {
        Self {
            compression,
            ..self
        }
    }

    /// Number of compressor threads; `0` (the default) means one per
    /// online CPU. `1` forces the serial writer.
    pub fn threads(self, threads: usize) -> Self {
        Self { threads, ..self }
    }

    pub fn flags(self, flags: EnumSet<WriteFlag>) -> Self {
        Self { flags, ..self }
    }

    pub fn flag(mut self, flag: WriteFlag) -> Self {
        self.flags |= flag;
        self
    }
}

/// Running totals reported while a stream list is written.
pub(crate) struct WriteProgress {
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub total_streams: u64,
    pub completed_streams: u64,
}

impl WriteProgress {
    fn new(total_bytes: u64, total_streams: u64) -> Self {
        Self {
            total_bytes,
            completed_bytes: 0,
            total_streams,
            completed_streams: 0,
        }
    }

    pub fn complete_stream(&mut self, bytes: u64) {
        self.completed_bytes += bytes;
        self.completed_streams += 1;
        debug!(
            "wrote stream {}/{} ({}/{} bytes)",
            self.completed_streams, self.total_streams, self.completed_bytes, self.total_bytes
        );
    }
}

/// Writes the streams named by `order` (indices into `streams`) at the
/// current output position, serially or in parallel depending on volume.
pub(crate) fn write_stream_list<W: OutputFile>(
    streams: &mut [StreamDescriptor],
    order: &[usize],
    out: &mut W,
    options: &WriteOptions,
    codecs: &CodecRegistry,
) -> WimResult<()> {
    let recompress = options.flags.contains(WriteFlag::Recompress);
    let compressible: u64 = order
        .iter()
        .filter(|&&i| !streams[i].is_direct_write(options.compression, recompress))
        .map(|&i| streams[i].size)
        .sum();
    // Verbatim copies and empty streams never touch the compressor, so a
    // write consisting only of those needs no codec at all.
    let compressor = match options.compression {
        Some(kind) if compressible > 0 => Some(codecs.compressor(kind)?),
        _ => None,
    };
    let params = StreamWriteParams {
        compression: options.compression,
        compressor,
        codecs,
        recompress,
    };

    let total_bytes: u64 = order.iter().map(|&i| streams[i].size).sum();
    let mut progress = WriteProgress::new(total_bytes, order.len() as u64);
    let threads = if options.threads == 0 {
        num_cpus::get()
    } else {
        options.threads
    };

    if params.compression.is_some() && threads > 1 && compressible >= SERIAL_THRESHOLD {
        parallel::write_stream_list_parallel(streams, order, out, &params, threads, &mut progress)
    } else {
        write_stream_list_serial(streams, order, out, &params, &mut progress)
    }
}

/// The single-threaded writer: each stream through the codec, in order.
pub(crate) fn write_stream_list_serial<W: OutputFile>(
    streams: &mut [StreamDescriptor],
    order: &[usize],
    out: &mut W,
    params: &StreamWriteParams<'_>,
    progress: &mut WriteProgress,
) -> WimResult<()> {
    for &i in order {
        resource::write_stream(&mut streams[i], out, params)?;
        progress.complete_stream(streams[i].size);
    }
    Ok(())
}

/// Inputs the trailer writer needs beyond the archive itself.
struct TrailerInputs {
    internal: EnumSet<InternalFlag>,
    /// End of the previous archive's lookup table, for integrity reuse.
    old_lookup_end: Option<u64>,
    old_integrity: Option<IntegrityTable>,
}

impl Wim {
    /// Writes a complete archive to `path`, creating or replacing the
    /// file, then re-points the archive's stream sources at it.
    pub fn write_to<P: AsRef<Path>>(&mut self, path: P, options: &WriteOptions) -> WimResult<()> {
        let path = path.as_ref();
        if let Some(source) = &self.source {
            if source.path == path {
                return Err(WimError::InvalidParam(
                    "writing over the backing file requires overwrite",
                ));
            }
        }
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| WimError::Open {
                path: path.to_owned(),
                source,
            })?;
        self.write_to_output(&mut file, options)?;
        drop(file);
        self.adopt_backing_file(path, options.compression)
    }

    /// Writes a complete archive to an arbitrary output. Stream sources
    /// are left untouched; [`Wim::write_to`] is the path-aware wrapper.
    pub fn write_to_output<W: OutputFile>(
        &mut self,
        out: &mut W,
        options: &WriteOptions,
    ) -> WimResult<()> {
        for stream in &mut self.streams {
            stream.out_entry = None;
        }

        self.header.flags &= !(hdrflag::COMPRESSION
            | hdrflag::COMPRESS_XPRESS
            | hdrflag::COMPRESS_LZX
            | hdrflag::COMPRESS_RESERVED);
        self.header.chunk_size = 0;
        if let Some(kind) = options.compression {
            self.header.flags |= hdrflag::COMPRESSION | kind.header_flag();
            self.header.chunk_size = crate::CHUNK_SIZE as u32;
        }
        self.header.lookup_table = ResourceEntry::default();
        self.header.xml_data = ResourceEntry::default();
        self.header.boot_metadata = ResourceEntry::default();
        self.header.integrity = ResourceEntry::default();

        out.seek(SeekFrom::Start(0)).map_err(WimError::Write)?;
        out.write_le(&self.header)?;

        let order: Vec<usize> = (0..self.streams.len())
            .filter(|&i| self.streams[i].out_ref_count > 0)
            .collect();
        write_stream_list(&mut self.streams, &order, out, options, &self.codecs)?;

        self.write_trailer(
            out,
            options,
            TrailerInputs {
                internal: EnumSet::new(),
                old_lookup_end: None,
                old_integrity: None,
            },
        )
    }

    /// Commits in-memory changes back to the archive's backing file.
    ///
    /// Appends in place when possible: no deletions (or
    /// [`WriteFlag::SoftDelete`]) and no [`WriteFlag::Rebuild`]. A layout
    /// that cannot be safely appended to falls back to a rebuild with a
    /// warning.
    pub fn overwrite(&mut self, options: &WriteOptions) -> WimResult<()> {
        let path = match &self.source {
            Some(source) => source.path.clone(),
            None => return Err(WimError::NoFilename),
        };

        // The archive's codec is fixed at creation; an overwrite always
        // keeps it, whichever way it is carried out.
        if let Some(requested) = options.compression {
            if Some(requested) != self.compression() {
                return Err(WimError::InvalidParam(
                    "overwriting cannot change the archive's compression",
                ));
            }
        }
        let options = WriteOptions {
            compression: self.compression(),
            ..options.clone()
        };

        let must_rebuild = self.deletions && !options.flags.contains(WriteFlag::SoftDelete);
        if options.flags.contains(WriteFlag::Rebuild) || must_rebuild {
            return self.rebuild(&path, &options);
        }

        match self.try_append(&path, &options) {
            Err(WimError::ResourceOrder(reason)) => {
                warn!("archive layout prevents in-place append ({reason}); rebuilding");
                self.rebuild(&path, &options)
            }
            other => other,
        }
    }

    fn try_append(&mut self, path: &Path, options: &WriteOptions) -> WimResult<()> {
        let compression = self.compression();

        // Preconditions on the layout we are about to extend, taken from
        // the header as it was opened.
        let hdr = self.header.clone();
        if hdr.lookup_table.is_empty() || hdr.xml_data.is_empty() {
            return Err(WimError::ResourceOrder(
                "archive has no lookup table or XML document",
            ));
        }
        if hdr.lookup_table.offset >= hdr.xml_data.offset {
            return Err(WimError::ResourceOrder(
                "lookup table does not precede the XML document",
            ));
        }
        if !hdr.integrity.is_empty() && hdr.integrity.offset <= hdr.xml_data.offset {
            return Err(WimError::ResourceOrder(
                "integrity table does not follow the XML document",
            ));
        }

        let new_order: Vec<usize> = (0..self.streams.len())
            .filter(|&i| self.streams[i].out_entry.is_none() && self.streams[i].out_ref_count > 0)
            .collect();
        let unchanged =
            new_order.is_empty() && !self.images_dirty && !self.deletions && !self.refs_dirty;

        let mut internal = EnumSet::new();
        // Everything at or past `old_end` is ours to scribble on; a
        // failure truncates back to it and the old header (rewritten only
        // at the very end) still describes a valid archive.
        let old_end = if unchanged {
            internal |= InternalFlag::NoLookupTable;
            hdr.lookup_table.end()
        } else if !hdr.integrity.is_empty() {
            hdr.integrity.end()
        } else {
            hdr.xml_data.end()
        };

        if options.flags.contains(WriteFlag::CheckIntegrity) {
            internal |= InternalFlag::CheckpointAfterXml;
            if !hdr.integrity.is_empty() {
                internal |= InternalFlag::ReuseIntegrityTable;
            }
        }

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| WimError::Reopen {
                path: path.to_owned(),
                source,
            })?;
        file.try_lock_exclusive()
            .map_err(|_| WimError::AlreadyLocked)?;

        // The old integrity table is overwritten during the append, so
        // lift it out first if we intend to reuse it.
        let old_integrity = if internal.contains(InternalFlag::ReuseIntegrityTable) {
            match integrity::read_integrity_table(&mut file, &hdr.integrity) {
                Ok(table) => Some(table),
                Err(e) => {
                    warn!("couldn't reuse the old integrity table: {e}");
                    None
                }
            }
        } else {
            None
        };

        debug!(
            "appending {} streams at offset {old_end}{}",
            new_order.len(),
            if unchanged { " (tables only)" } else { "" }
        );

        let result = self.append_body(
            &mut file,
            options,
            &new_order,
            TrailerInputs {
                internal,
                old_lookup_end: Some(hdr.lookup_table.end()),
                old_integrity,
            },
            old_end,
        );

        if result.is_err() {
            // Give back the file exactly as the (still unmodified) header
            // describes it.
            if let Err(e) = file.set_len(old_end) {
                warn!("couldn't truncate failed append back to {old_end} bytes: {e}");
            }
            self.header = hdr;
        }
        let _ = file.unlock();
        result?;

        // The new streams now live in the archive itself.
        if let Some(source) = self.source.clone() {
            for &i in &new_order {
                self.repoint_stream(i, &source, compression);
            }
        }
        self.images_dirty = false;
        self.deletions = false;
        self.refs_dirty = false;
        Ok(())
    }

    fn append_body(
        &mut self,
        file: &mut fs::File,
        options: &WriteOptions,
        new_order: &[usize],
        trailer: TrailerInputs,
        old_end: u64,
    ) -> WimResult<()> {
        file.seek(SeekFrom::Start(old_end)).map_err(WimError::Write)?;

        write_stream_list(&mut self.streams, new_order, file, options, &self.codecs)?;
        self.write_trailer(file, options, trailer)
    }

    fn rebuild(&mut self, path: &Path, options: &WriteOptions) -> WimResult<()> {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        let parent = parent.unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::Builder::new()
            .prefix("wim")
            .rand_bytes(9)
            .tempfile_in(parent)
            .map_err(|source| WimError::Open {
                path: parent.to_owned(),
                source,
            })?;

        debug!("rebuilding {} via {}", path.display(), tmp.path().display());
        self.write_to_output(tmp.as_file_mut(), options)?;
        tmp.as_file_mut().sync_data().map_err(WimError::Write)?;

        // A failed rename drops the temporary file, unlinking it.
        tmp.persist(path).map_err(|e| WimError::Rename {
            path: path.to_owned(),
            source: e.error,
        })?;

        self.purge_deleted_streams();
        self.adopt_backing_file(path, options.compression)
    }

    /// Writes the trailing sections and finally the header: lookup table,
    /// XML document, optional integrity table, truncate to fit, header.
    fn write_trailer<W: OutputFile>(
        &mut self,
        out: &mut W,
        options: &WriteOptions,
        trailer: TrailerInputs,
    ) -> WimResult<()> {
        if !trailer.internal.contains(InternalFlag::NoLookupTable) {
            let offset = out.stream_position().map_err(WimError::Write)?;
            let mut table = CountingWriter::new(&mut *out);
            for stream in &self.streams {
                let entry = match (&stream.out_entry, stream.out_ref_count) {
                    (Some(entry), refs) if refs > 0 => entry,
                    _ => continue,
                };
                table.write_le(&LookupTableEntry {
                    resource: *entry,
                    part_number: self.header.part_number,
                    ref_count: stream.out_ref_count,
                    hash: stream.hash,
                })?;
            }
            let size = table.bytes_written();
            self.header.lookup_table = ResourceEntry {
                size_in_wim: size,
                flags: 0,
                offset,
                original_size: size,
            };
        }

        self.header.image_count = self.images.len() as u32;
        self.header.boot_metadata = ResourceEntry::default();
        if self.header.boot_index != 0 {
            if let Some(image) = self.images.get(self.header.boot_index as usize - 1) {
                if let Some(entry) = self.streams[image.stream].out_entry {
                    self.header.boot_metadata = entry;
                }
            }
        }

        let xml_offset = out.stream_position().map_err(WimError::Write)?;
        self.header.xml_data = xml::write_xml(out, &self.images, xml_offset)?;

        self.header.integrity = ResourceEntry::default();
        if options.flags.contains(WriteFlag::CheckIntegrity) {
            if trailer.internal.contains(InternalFlag::CheckpointAfterXml) {
                // If we die while hashing, a reader sees a checked-out
                // archive with no integrity table rather than a torn one.
                let end = out.stream_position().map_err(WimError::Write)?;
                out.seek(SeekFrom::Start(0)).map_err(WimError::Write)?;
                out.write_le(&self.header)?;
                out.sync_data().map_err(WimError::Write)?;
                out.seek(SeekFrom::Start(end)).map_err(WimError::Write)?;
            }
            self.header.integrity = integrity::write_integrity_table(
                out,
                self.header.lookup_table.end(),
                trailer.old_lookup_end,
                trailer.old_integrity.as_ref(),
            )?;
        }

        let end = out.stream_position().map_err(WimError::Write)?;
        out.truncate(end).map_err(WimError::Write)?;

        // The header goes last: nothing it points at can be missing.
        out.seek(SeekFrom::Start(0)).map_err(WimError::Write)?;
        out.write_le(&self.header)?;
        out.seek(SeekFrom::Start(end)).map_err(WimError::Write)?;

        if options.flags.contains(WriteFlag::Fsync) {
            out.sync_data().map_err(WimError::Write)?;
        }
        debug_assert_eq!(self.header.header_size as u64, HEADER_SIZE);
        Ok(())
    }

    /// After a successful full write, the written archive becomes the
    /// backing file and every written stream's source.
    fn adopt_backing_file(
        &mut self,
        path: &Path,
        compression: Option<Compression>,
    ) -> WimResult<()> {
        let file = fs::File::open(path).map_err(|source| WimError::Reopen {
            path: path.to_owned(),
            source,
        })?;
        let source = Arc::new(WimFile::new(path.to_owned(), file));
        for i in 0..self.streams.len() {
            self.repoint_stream(i, &source, compression);
        }
        self.source = Some(source);
        self.images_dirty = false;
        self.deletions = false;
        self.refs_dirty = false;
        Ok(())
    }

    fn repoint_stream(&mut self, i: usize, source: &Arc<WimFile>, compression: Option<Compression>) {
        let stream = &mut self.streams[i];
        if let Some(entry) = stream.out_entry {
            stream.source = StreamSource::Wim {
                file: Arc::clone(source),
                entry,
                compression: entry.is_compressed().then_some(compression).flatten(),
            };
        }
    }

    fn purge_deleted_streams(&mut self) {
        if !self.streams.iter().any(|s| s.out_ref_count == 0) {
            return;
        }
        let mut kept = Vec::with_capacity(self.streams.len());
        let mut remap = vec![usize::MAX; self.streams.len()];
        for (i, stream) in self.streams.drain(..).enumerate() {
            if stream.out_ref_count > 0 {
                remap[i] = kept.len();
                kept.push(stream);
            }
        }
        self.streams = kept;
        self.hash_index = self
            .streams
            .iter()
            .enumerate()
            .filter(|(_, s)| !crate::is_zero_hash(&s.hash))
            .map(|(i, s)| (s.hash, i))
            .collect();
        for image in &mut self.images {
            image.stream = remap[image.stream];
        }
    }
}
