//! Opening an existing archive and reading streams back out of it.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use binrw::BinReaderExt;
use enumset::{EnumSet, EnumSetType};
use log::warn;

use crate::reader::StreamReader;
use crate::records::{
    resflag, LookupTableEntry, WimHeader, LOOKUP_TABLE_ENTRY_SIZE, WIM_VERSION,
};
use crate::stream::{StreamDescriptor, StreamSource, WimFile};
use crate::{
    integrity, is_zero_hash, xml, Compression, Image, Sha1Hash, Wim, WimError, WimResult,
    CHUNK_SIZE, HEADER_SIZE,
};

/// Nonstandard opening options.
#[derive(EnumSetType, Debug)]
pub enum OpenFlag {
    /// Verify the integrity table (when present) against the file before
    /// returning.
    CheckIntegrity,
}

impl Wim {
    /// Opens an archive from a file.
    pub fn open<P: AsRef<Path>>(path: P) -> WimResult<Self> {
        Self::open_with_options(path, EnumSet::new())
    }

    pub fn open_with_options<P: AsRef<Path>>(
        path: P,
        options: EnumSet<OpenFlag>,
    ) -> WimResult<Self> {
        let path = path.as_ref();
        let mut file = fs::File::open(path).map_err(|source| WimError::Open {
            path: path.to_owned(),
            source,
        })?;

        let header: WimHeader = file.read_le().map_err(|e| match e {
            binrw::Error::BadMagic { .. } => WimError::BadMagic,
            e => WimError::Parse(e),
        })?;
        if header.header_size as u64 != HEADER_SIZE {
            return Err(WimError::InvalidParam("unexpected header size"));
        }
        if header.version != WIM_VERSION {
            return Err(WimError::UnsupportedVersion(header.version));
        }
        if header.part_number != 1 || header.total_parts != 1 {
            return Err(WimError::SplitUnsupported {
                part: header.part_number,
                total: header.total_parts,
            });
        }
        let compression = Compression::from_header_flags(header.flags)?;
        if compression.is_some() && header.chunk_size as usize != CHUNK_SIZE {
            return Err(WimError::UnsupportedChunkSize(header.chunk_size));
        }

        if options.contains(OpenFlag::CheckIntegrity) && !header.integrity.is_empty() {
            integrity::check_integrity(&mut file, &header.integrity, header.lookup_table.end())?;
        }

        // Lookup table → stream descriptors.
        if header.lookup_table.size_in_wim % LOOKUP_TABLE_ENTRY_SIZE != 0 {
            return Err(WimError::InvalidParam(
                "lookup table size is not a whole number of entries",
            ));
        }
        let num_entries = header.lookup_table.size_in_wim / LOOKUP_TABLE_ENTRY_SIZE;
        file.seek(SeekFrom::Start(header.lookup_table.offset))
            .map_err(WimError::Read)?;
        let mut entries = Vec::with_capacity(num_entries as usize);
        for _ in 0..num_entries {
            let entry: LookupTableEntry = file.read_le()?;
            entries.push(entry);
        }

        // XML document.
        let mut xml_bytes = vec![0u8; header.xml_data.size_in_wim as usize];
        file.seek(SeekFrom::Start(header.xml_data.offset))
            .map_err(WimError::Read)?;
        file.read_exact(&mut xml_bytes).map_err(WimError::Read)?;
        let fragments = xml::parse_xml(&xml_bytes)?;

        let source = Arc::new(WimFile::new(path.to_owned(), file));

        let mut streams = Vec::with_capacity(entries.len());
        let mut hash_index = HashMap::new();
        let mut metadata_streams = Vec::new();
        for entry in entries {
            let index = streams.len();
            let mut desc = StreamDescriptor::with_hash(
                StreamSource::Wim {
                    file: Arc::clone(&source),
                    entry: entry.resource,
                    compression: if entry.resource.is_compressed() {
                        compression
                    } else {
                        None
                    },
                },
                entry.resource.original_size,
                entry.hash,
            );
            desc.ref_count = entry.ref_count;
            desc.out_ref_count = entry.ref_count;
            desc.extra_flags = entry.resource.flags & resflag::METADATA;
            desc.out_entry = Some(entry.resource);
            if entry.resource.is_metadata() {
                metadata_streams.push(index);
            }
            if !is_zero_hash(&desc.hash) {
                hash_index.insert(desc.hash, index);
            }
            streams.push(desc);
        }

        if metadata_streams.len() != fragments.len() {
            warn!(
                "{} metadata streams but {} XML image elements",
                metadata_streams.len(),
                fragments.len()
            );
        }
        if metadata_streams.len() as u32 != header.image_count {
            warn!(
                "header declares {} images, lookup table has {}",
                header.image_count,
                metadata_streams.len()
            );
        }

        let mut fragments = fragments.into_iter();
        let images: Vec<Image> = metadata_streams
            .into_iter()
            .map(|stream| {
                let parsed = fragments.next();
                Image {
                    name: parsed.as_ref().map(|p| p.name.clone()).unwrap_or_default(),
                    stream,
                    extra_xml: parsed.map(|p| p.extra_xml).unwrap_or_default(),
                }
            })
            .collect();

        let mut header = header;
        if header.boot_index as usize > images.len() {
            warn!("boot index {} is out of range; clearing it", header.boot_index);
            header.boot_index = 0;
        }

        Ok(Wim {
            header,
            streams,
            hash_index,
            images,
            codecs: Default::default(),
            source: Some(source),
            deletions: false,
            images_dirty: false,
            refs_dirty: false,
        })
    }

    /// Reads a whole stream, identified by its hash, back into memory.
    pub fn read_stream(&self, hash: &Sha1Hash) -> WimResult<Vec<u8>> {
        let index = *self
            .hash_index
            .get(hash)
            .ok_or(WimError::InvalidParam("no stream with that hash"))?;
        self.read_stream_at(index)
    }

    /// Reads the stream at `index` in [`Wim::streams`] back into memory.
    pub fn read_stream_at(&self, index: usize) -> WimResult<Vec<u8>> {
        let desc = self
            .streams
            .get(index)
            .ok_or(WimError::InvalidParam("stream index out of range"))?;
        let mut reader = StreamReader::open(desc, &self.codecs)?;
        let mut data = vec![0u8; desc.size as usize];
        reader.read_at(0, &mut data)?;
        Ok(data)
    }
}
