//! Raw on-disk structures of a WIM file.
//!
//! Every integer is little-endian. The header is a fixed 212-byte block at
//! offset zero; it is written once as a placeholder when an archive is
//! started and overwritten with the final offsets as the very last step of
//! finalization, so a torn write never publishes half-finished tables.

use std::io::{Read, Seek, Write};

use binrw::*;

use crate::{Sha1Hash, HEADER_SIZE};

/// Known format version (`1.13` in the original tooling's notation).
pub const WIM_VERSION: u32 = 0x10d00;

/// Flag bits of [`ResourceEntry::flags`].
pub mod resflag {
    /// Entry is unused space left behind by an in-place overwrite.
    pub const FREE: u8 = 0x01;
    /// The stream is an image-metadata resource, not file content.
    pub const METADATA: u8 = 0x02;
    /// The stream payload is chunk-compressed and preceded by a chunk table.
    pub const COMPRESSED: u8 = 0x04;
    /// The stream continues in another part of a split archive.
    pub const SPANNED: u8 = 0x08;
}

/// Flag bits of [`WimHeader::flags`].
pub mod hdrflag {
    pub const RESERVED: u32 = 0x00000001;
    /// Stream payloads may be compressed; one of the `COMPRESS_*` bits
    /// says which codec.
    pub const COMPRESSION: u32 = 0x00000002;
    pub const READONLY: u32 = 0x00000004;
    pub const SPANNED: u32 = 0x00000008;
    pub const RESOURCE_ONLY: u32 = 0x00000010;
    pub const METADATA_ONLY: u32 = 0x00000020;
    pub const WRITE_IN_PROGRESS: u32 = 0x00000040;
    pub const RP_FIX: u32 = 0x00000080;

    pub const COMPRESS_RESERVED: u32 = 0x00010000;
    pub const COMPRESS_XPRESS: u32 = 0x00020000;
    pub const COMPRESS_LZX: u32 = 0x00040000;
}

/// Low 56 bits of the packed size+flags word hold the stored size.
const SIZE_IN_WIM_MASK: u64 = 0x00ff_ffff_ffff_ffff;

/// Where and how one stream (or one of the secondary tables) lives in the
/// file: `{stored size, flags, absolute offset, uncompressed size}`.
///
/// On disk the stored size and the flag byte share one 64-bit word: the
/// size occupies the low 7 bytes and the flags the top byte. We unpack the
/// word into two fields rather than carrying the punned form around.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceEntry {
    /// Bytes the resource occupies in the archive (chunk table included).
    pub size_in_wim: u64,
    /// Combination of [`resflag`] bits.
    pub flags: u8,
    /// Absolute byte offset of the resource in the archive.
    pub offset: u64,
    /// Uncompressed size of the resource.
    pub original_size: u64,
}

impl ResourceEntry {
    pub fn is_compressed(&self) -> bool {
        self.flags & resflag::COMPRESSED != 0
    }

    pub fn is_metadata(&self) -> bool {
        self.flags & resflag::METADATA != 0
    }

    /// True for the all-zero entry used by header slots that point at
    /// nothing (e.g. the integrity slot of an unchecked archive).
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Absolute offset one past the end of the stored bytes.
    pub fn end(&self) -> u64 {
        self.offset + self.size_in_wim
    }
}

impl BinRead for ResourceEntry {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _: Self::Args<'_>,
    ) -> BinResult<Self> {
        let packed = u64::read_options(reader, endian, ())?;
        let offset = u64::read_options(reader, endian, ())?;
        let original_size = u64::read_options(reader, endian, ())?;
        Ok(Self {
            size_in_wim: packed & SIZE_IN_WIM_MASK,
            flags: (packed >> 56) as u8,
            offset,
            original_size,
        })
    }
}

impl BinWrite for ResourceEntry {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        _: Self::Args<'_>,
    ) -> BinResult<()> {
        let packed = (self.size_in_wim & SIZE_IN_WIM_MASK) | ((self.flags as u64) << 56);
        packed.write_options(writer, endian, ())?;
        self.offset.write_options(writer, endian, ())?;
        self.original_size.write_options(writer, endian, ())?;
        Ok(())
    }
}

/// The fixed-size archive header.
///
/// The magic is part of the 212 bytes. The three resource slots locate the
/// lookup table, the XML document and (optionally) the integrity table;
/// `boot_metadata` mirrors the lookup-table entry of the bootable image's
/// metadata stream.
#[binrw]
#[brw(little, magic = b"MSWIM\0\0\0")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WimHeader {
    pub header_size: u32,
    pub version: u32,
    pub flags: u32,
    /// Chunk size used by compressed streams; zero in uncompressed archives.
    pub chunk_size: u32,
    pub guid: [u8; 16],
    pub part_number: u16,
    pub total_parts: u16,
    pub image_count: u32,
    pub lookup_table: ResourceEntry,
    pub xml_data: ResourceEntry,
    pub boot_metadata: ResourceEntry,
    pub boot_index: u32,
    pub integrity: ResourceEntry,
    pub reserved: [u8; 64],
}

impl WimHeader {
    pub fn new(guid: [u8; 16]) -> Self {
        Self {
            header_size: HEADER_SIZE as u32,
            version: WIM_VERSION,
            flags: 0,
            chunk_size: 0,
            guid,
            part_number: 1,
            total_parts: 1,
            image_count: 0,
            lookup_table: ResourceEntry::default(),
            xml_data: ResourceEntry::default(),
            boot_metadata: ResourceEntry::default(),
            boot_index: 0,
            integrity: ResourceEntry::default(),
            reserved: [0; 64],
        }
    }
}

/// One 50-byte lookup-table entry: a resource entry plus the part number,
/// the stream's reference count and its SHA-1 identity.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupTableEntry {
    pub resource: ResourceEntry,
    pub part_number: u16,
    pub ref_count: u32,
    pub hash: Sha1Hash,
}

pub const LOOKUP_TABLE_ENTRY_SIZE: u64 = 50;

/// Leading fields of the integrity table; followed by `num_entries`
/// 20-byte digests.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityHeader {
    /// Total size of the table in bytes, this header included.
    pub table_size: u32,
    pub num_entries: u32,
    /// Bytes covered by each digest (the final chunk may be shorter).
    pub chunk_size: u32,
}

pub const INTEGRITY_HEADER_SIZE: u64 = 12;
