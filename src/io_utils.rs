use std::fs::File;
use std::io::{self, prelude::*, Cursor, SeekFrom};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use sha1::{Digest, Sha1};

use crate::Sha1Hash;

/// Counts how many bytes have been read and folds them into a running
/// SHA-1.
pub struct CountingHashReader<R> {
    inner: R,
    hasher: Sha1,
    count: u64,
}

impl<R: Read> CountingHashReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            count: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.count
    }

    /// Consumes the reader and returns the digest.
    pub fn finalize(self) -> Sha1Hash {
        self.hasher.finalize().into()
    }
}

impl<R: Read> Read for CountingHashReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let res = self.inner.read(buf)?;
        self.count += res as u64;
        self.hasher.update(&buf[..res]);
        Ok(res)
    }
}

pub struct CountingWriter<W> {
    writer: W,
    bytes_written: u64,
}

impl<W> CountingWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = self.writer.write(buf)?;
        self.bytes_written += res as u64;
        Ok(res)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<W: Seek> Seek for CountingWriter<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.writer.seek(pos)
    }
}

/// What the writer needs from its destination beyond `Write + Seek`:
/// read-back (the integrity table digests what was just written),
/// truncation (the anti-expansion fallback and failed appends shrink the
/// file back) and a durability barrier for the checkpoint header and the
/// explicit-flush option.
pub trait OutputFile: Read + Write + Seek {
    fn truncate(&mut self, size: u64) -> io::Result<()>;
    fn sync_data(&mut self) -> io::Result<()>;
}

impl OutputFile for File {
    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.set_len(size)
    }

    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }
}

impl OutputFile for Cursor<Vec<u8>> {
    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.get_mut().truncate(size as usize);
        Ok(())
    }

    fn sync_data(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: OutputFile + ?Sized> OutputFile for &mut T {
    fn truncate(&mut self, size: u64) -> io::Result<()> {
        (**self).truncate(size)
    }

    fn sync_data(&mut self) -> io::Result<()> {
        (**self).sync_data()
    }
}

/// Writes one chunk-table entry in little-endian at the given width.
pub fn write_chunk_entry<W: Write>(w: &mut W, entry_width: usize, value: u64) -> io::Result<()> {
    match entry_width {
        4 => w.write_u32::<LE>(value as u32),
        8 => w.write_u64::<LE>(value),
        _ => unreachable!("entry width is 4 or 8"),
    }
}

/// Reads one chunk-table entry in little-endian at the given width.
pub fn read_chunk_entry<R: Read>(r: &mut R, entry_width: usize) -> io::Result<u64> {
    match entry_width {
        4 => r.read_u32::<LE>().map(u64::from),
        8 => r.read_u64::<LE>(),
        _ => unreachable!("entry width is 4 or 8"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_reader_matches_direct_digest() {
        let mut r = CountingHashReader::new(&b"hello world"[..]);
        let mut buf = [0u8; 6];
        r.read_exact(&mut buf).unwrap();
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).unwrap();
        assert_eq!(r.position(), 11);

        let expected: Sha1Hash = Sha1::digest(b"hello world").into();
        assert_eq!(r.finalize(), expected);
    }

    #[test]
    fn counting_writer_counts() {
        let mut w = CountingWriter::new(Cursor::new(Vec::new()));
        w.write_all(b"12345").unwrap();
        w.write_all(b"678").unwrap();
        assert_eq!(w.bytes_written(), 8);
    }

    #[test]
    fn chunk_entries_round_trip_at_both_widths() {
        for (width, value) in [(4usize, 0xdead_beefu64), (8, 0x1_0000_0001)] {
            let mut buf = Vec::new();
            write_chunk_entry(&mut buf, width, value).unwrap();
            assert_eq!(buf.len(), width);
            let back = read_chunk_entry(&mut &buf[..], width).unwrap();
            assert_eq!(back, value);
        }
    }
}
