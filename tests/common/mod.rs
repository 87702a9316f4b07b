#![allow(dead_code)]

use std::io;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use wim::{
    Compression, Compressor, Decompressor, StreamBackend, StreamDescriptor, Wim, WimError,
    WimResult,
};

/// Escape byte of the test codec's token stream.
const ESCAPE: u8 = 0xfe;

/// A tiny run-length codec obeying the compressor contract: it encodes
/// runs of four or more equal bytes and reports "did not shrink" (`None`)
/// whenever the encoded form would not fit the output window, which the
/// engine sizes one byte below the input. Stands in for the real XPRESS
/// and LZX black boxes.
pub struct RleCodec;

impl Compressor for RleCodec {
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Option<usize> {
        let mut out = 0usize;
        let mut i = 0usize;
        while i < src.len() {
            let b = src[i];
            let mut run = 1usize;
            while i + run < src.len() && src[i + run] == b && run < 255 {
                run += 1;
            }
            if run >= 4 {
                if out + 3 > dst.len() {
                    return None;
                }
                dst[out] = ESCAPE;
                dst[out + 1] = run as u8;
                dst[out + 2] = b;
                out += 3;
                i += run;
            } else if b == ESCAPE {
                if out + 2 > dst.len() {
                    return None;
                }
                dst[out] = ESCAPE;
                dst[out + 1] = 0;
                out += 2;
                i += 1;
            } else {
                if out + 1 > dst.len() {
                    return None;
                }
                dst[out] = b;
                out += 1;
                i += 1;
            }
        }
        Some(out)
    }
}

impl Decompressor for RleCodec {
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> WimResult<()> {
        let mut out = 0usize;
        let mut i = 0usize;
        while i < src.len() {
            let b = src[i];
            if b == ESCAPE {
                let len = *src.get(i + 1).ok_or(WimError::Decompression)? as usize;
                if len == 0 {
                    if out >= dst.len() {
                        return Err(WimError::Decompression);
                    }
                    dst[out] = ESCAPE;
                    out += 1;
                    i += 2;
                } else {
                    let value = *src.get(i + 2).ok_or(WimError::Decompression)?;
                    if out + len > dst.len() {
                        return Err(WimError::Decompression);
                    }
                    dst[out..out + len].fill(value);
                    out += len;
                    i += 3;
                }
            } else {
                if out >= dst.len() {
                    return Err(WimError::Decompression);
                }
                dst[out] = b;
                out += 1;
                i += 1;
            }
        }
        if out == dst.len() {
            Ok(())
        } else {
            Err(WimError::Decompression)
        }
    }
}

/// Registers the test codec for both compression kinds.
pub fn register_codecs(wim: &mut Wim) {
    for kind in [Compression::Xpress, Compression::Lzx] {
        wim.codecs_mut()
            .register(kind, Arc::new(RleCodec), Arc::new(RleCodec));
    }
}

/// A fresh in-memory archive with the test codec registered.
pub fn new_wim() -> Wim {
    let mut wim = Wim::create();
    register_codecs(&mut wim);
    wim
}

/// An owned byte buffer usable as a stream source.
pub struct MemoryStream(pub Vec<u8>);

impl StreamBackend for MemoryStream {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.0.len())
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        buf.copy_from_slice(&self.0[start..end]);
        Ok(())
    }
}

pub fn mem_stream(data: Vec<u8>) -> StreamDescriptor {
    StreamDescriptor::from_backend(Arc::new(MemoryStream(data)))
}

/// Runs of random bytes with random lengths; the test codec shrinks this
/// kind of data well.
pub fn compressible_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        let value: u8 = rng.gen();
        let run = rng.gen_range(4..48).min(len - data.len());
        data.extend(std::iter::repeat(value).take(run));
    }
    data
}

/// A sequence with no repeated neighbors at all: every chunk of it comes
/// out of the test codec at least as large as it went in.
pub fn incompressible_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 131) % 251) as u8).collect()
}
