//! The parallel stream writer: one coordinator, many compressors.
//!
//! The coordinator (the calling thread) reads chunks in input order, hands
//! them to a pool of worker threads through a bounded queue, and is the
//! only thread that ever touches the output file. Workers compress in any
//! order; the coordinator reassembles per-stream messages by chunk index
//! and writes a stream's bytes strictly in order, never starting a later
//! stream before the current one is finalized. Memory stays bounded: the
//! pool owns `2 × threads` messages of two chunks each, recycled through a
//! free list, regardless of how much data flows through.
//!
//! Streams with nothing to compress (zero-size, or verbatim copies of an
//! already-compatible source) are never dispatched; the coordinator emits
//! them itself once every in-flight stream that precedes them has been
//! written, which preserves the input order end to end.

use std::collections::{BTreeMap, TryReserveError, VecDeque};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use sha1::{Digest, Sha1};

use crate::io_utils::OutputFile;
use crate::reader::StreamReader;
use crate::records::{resflag, ResourceEntry};
use crate::resource::{self, ChunkTable, StreamWriteParams};
use crate::stream::StreamDescriptor;
use crate::write::{write_stream_list_serial, WriteProgress};
use crate::{chunk_count, is_zero_hash, Compressor, Sha1Hash, WimError, WimResult, CHUNK_SIZE};

/// Chunks carried per message.
const MAX_CHUNKS_PER_MSG: usize = 2;

/// LZ77 matchers may look a few bytes past the end of their window; the
/// uncompressed scratch keeps that slack so a compressor never reads out
/// of bounds.
const CHUNK_SLACK: usize = 8;

/// One unit of work. The buffers are allocated once at pool init and
/// recycled for the whole write.
struct Message {
    /// Position in the write order of the owning stream.
    list_pos: usize,
    begin_chunk: u64,
    num_chunks: usize,
    in_sizes: [usize; MAX_CHUNKS_PER_MSG],
    uncompressed: [Vec<u8>; MAX_CHUNKS_PER_MSG],
    compressed: [Vec<u8>; MAX_CHUNKS_PER_MSG],
    /// Stored form chosen per chunk: `Some(len)` selects the compressed
    /// scratch, `None` the input bytes verbatim. This is the only place
    /// the choice lives; the on-disk format expresses it through chunk
    /// sizes alone.
    out_sizes: [Option<usize>; MAX_CHUNKS_PER_MSG],
}

fn alloc_message_pool(count: usize) -> Result<Vec<Message>, TryReserveError> {
    let mut pool = Vec::new();
    pool.try_reserve_exact(count)?;
    for _ in 0..count {
        let mut msg = Message {
            list_pos: 0,
            begin_chunk: 0,
            num_chunks: 0,
            in_sizes: [0; MAX_CHUNKS_PER_MSG],
            uncompressed: Default::default(),
            compressed: Default::default(),
            out_sizes: [None; MAX_CHUNKS_PER_MSG],
        };
        for buf in &mut msg.uncompressed {
            buf.try_reserve_exact(CHUNK_SIZE + CHUNK_SLACK)?;
        }
        for buf in &mut msg.compressed {
            buf.try_reserve_exact(CHUNK_SIZE)?;
        }
        pool.push(msg);
    }
    Ok(pool)
}

fn compress_message(compressor: &dyn Compressor, msg: &mut Message) {
    let Message {
        num_chunks,
        in_sizes,
        uncompressed,
        compressed,
        out_sizes,
        ..
    } = msg;
    for j in 0..*num_chunks {
        let in_len = in_sizes[j];
        let dst = &mut compressed[j];
        dst.clear();
        dst.resize(in_len.saturating_sub(1), 0);
        out_sizes[j] = compressor.compress(&uncompressed[j][..in_len], dst);
    }
}

fn worker(rx: Receiver<Message>, tx: Sender<Message>, compressor: Arc<dyn Compressor>) {
    while let Ok(mut msg) = rx.recv() {
        compress_message(&*compressor, &mut msg);
        if tx.send(msg).is_err() {
            break;
        }
    }
}

/// Writes `order` (indices into `streams`) with `num_threads` compressor
/// workers. Falls back to the serial writer if the pool cannot be set up.
pub(crate) fn write_stream_list_parallel<W: OutputFile>(
    streams: &mut [StreamDescriptor],
    order: &[usize],
    out: &mut W,
    params: &StreamWriteParams<'_>,
    num_threads: usize,
    progress: &mut WriteProgress,
) -> WimResult<()> {
    let compressor = params
        .compressor
        .clone()
        .expect("the parallel writer is only used for compressed output");

    let num_msgs = num_threads * 2;
    let pool = match alloc_message_pool(num_msgs) {
        Ok(pool) => pool,
        Err(_) => {
            warn!("not enough memory for {num_msgs} compressor messages, writing serially");
            return write_stream_list_serial(streams, order, out, params, progress);
        }
    };

    let (to_compress_tx, to_compress_rx) = bounded::<Message>(num_msgs);
    let (compressed_tx, compressed_rx) = bounded::<Message>(num_msgs);

    let mut workers = Vec::with_capacity(num_threads);
    for i in 0..num_threads {
        let rx = to_compress_rx.clone();
        let tx = compressed_tx.clone();
        let compressor = Arc::clone(&compressor);
        let spawned = thread::Builder::new()
            .name(format!("wim-compress-{i}"))
            .spawn(move || worker(rx, tx, compressor));
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                warn!("failed to spawn compressor thread {i}: {e}");
                break;
            }
        }
    }
    drop(to_compress_rx);
    drop(compressed_tx);

    if workers.is_empty() {
        drop(to_compress_tx);
        while compressed_rx.recv().is_ok() {}
        return write_stream_list_serial(streams, order, out, params, progress);
    }
    debug!("parallel write: {} streams, {} workers", order.len(), workers.len());

    let result = coordinate(
        streams,
        order,
        out,
        params,
        pool,
        &to_compress_tx,
        &compressed_rx,
        progress,
    );

    // Closing the dispatch queue is the stop signal. Before the messages
    // are dropped, drain the return queue until every worker has hung up,
    // so none of them still owns a message.
    drop(to_compress_tx);
    while compressed_rx.recv().is_ok() {}
    for handle in workers {
        if handle.join().is_err() {
            warn!("compressor thread panicked during shutdown");
        }
    }

    result
}

/// Write state of the stream currently at the head of the output.
struct CurrentOut {
    offset: u64,
    table: ChunkTable,
    next_chunk: u64,
}

#[allow(clippy::too_many_arguments)]
fn coordinate<W: OutputFile>(
    streams: &mut [StreamDescriptor],
    order: &[usize],
    out: &mut W,
    params: &StreamWriteParams<'_>,
    pool: Vec<Message>,
    to_compress: &Sender<Message>,
    compressed: &Receiver<Message>,
    progress: &mut WriteProgress,
) -> WimResult<()> {
    let mut free = pool;
    // Streams dispatched but not yet fully written, in input order; the
    // front is the stream currently being emitted.
    let mut outstanding: VecDeque<usize> = VecDeque::new();
    // Compressed messages that came back before their turn, keyed by
    // (stream position, first chunk index).
    let mut completed: BTreeMap<(usize, u64), Message> = BTreeMap::new();
    // Positions of direct-write streams waiting for the in-flight streams
    // before them to finish.
    let mut direct: VecDeque<usize> = VecDeque::new();
    let mut current: Option<CurrentOut> = None;

    // Read cursor: next stream position and chunk to dispatch, plus the
    // rolling digest of the stream being read. The digest is always
    // folded in chunk order here, before a chunk ever reaches a worker.
    let mut next_pos = 0usize;
    let mut next_chunk = 0u64;
    let mut reader: Option<StreamReader> = None;
    let mut hasher = Sha1::new();

    loop {
        // Dispatch phase: fill free messages with chunks in input order.
        while !free.is_empty() && next_pos < order.len() {
            let desc = &streams[order[next_pos]];
            if desc.is_direct_write(params.compression, params.recompress) {
                if outstanding.is_empty() && direct.is_empty() {
                    write_one_direct(streams, order, next_pos, out, params, progress)?;
                } else {
                    direct.push_back(next_pos);
                }
                next_pos += 1;
                continue;
            }

            if reader.is_none() {
                reader = Some(StreamReader::open(desc, params.codecs)?);
                hasher = Sha1::new();
                outstanding.push_back(next_pos);
            }
            let rdr = reader.as_mut().expect("reader opened above");

            let num_chunks = chunk_count(desc.size);
            let mut msg = free.pop().expect("free list checked non-empty");
            msg.list_pos = next_pos;
            msg.begin_chunk = next_chunk;
            let take = ((num_chunks - next_chunk) as usize).min(MAX_CHUNKS_PER_MSG);
            for j in 0..take {
                let pos = (next_chunk + j as u64) * CHUNK_SIZE as u64;
                let len = (desc.size - pos).min(CHUNK_SIZE as u64) as usize;
                let buf = &mut msg.uncompressed[j];
                buf.clear();
                buf.resize(len, 0);
                rdr.read_at(pos, buf)?;
                hasher.update(&buf[..]);
                msg.in_sizes[j] = len;
            }
            msg.num_chunks = take;
            next_chunk += take as u64;

            if next_chunk == num_chunks {
                // Finished reading the stream; settle its digest now, in
                // read order, independent of compression progress.
                let computed: Sha1Hash =
                    std::mem::replace(&mut hasher, Sha1::new()).finalize().into();
                let desc = &mut streams[order[next_pos]];
                if is_zero_hash(&desc.hash) {
                    desc.hash = computed;
                } else if desc.hash != computed {
                    return Err(WimError::InvalidResourceHash {
                        expected: desc.hash,
                        computed,
                    });
                }
                reader = None;
                next_pos += 1;
                next_chunk = 0;
            }

            to_compress.send(msg).map_err(|_| WimError::WorkerLost)?;
        }

        if outstanding.is_empty() {
            // Everything dispatched has been written; any queued direct
            // streams precede the read cursor and can go out now.
            drain_direct(&mut direct, next_pos, streams, order, out, params, progress)?;
            if next_pos >= order.len() {
                return Ok(());
            }
            // All messages are free again; keep dispatching.
            continue;
        }

        // Drain phase: take one compressed message, then flush as much of
        // the head-of-line stream as has become contiguous.
        let msg = compressed.recv().map_err(|_| WimError::WorkerLost)?;
        completed.insert((msg.list_pos, msg.begin_chunk), msg);

        while let Some(&head) = outstanding.front() {
            if current.is_none() {
                let desc = &streams[order[head]];
                let offset = out.stream_position().map_err(WimError::Write)?;
                let table = ChunkTable::new(desc.size, offset);
                table.reserve(out)?;
                current = Some(CurrentOut {
                    offset,
                    table,
                    next_chunk: 0,
                });
            }
            let state = current.as_mut().expect("current initialized above");

            let Some(msg) = completed.remove(&(head, state.next_chunk)) else {
                break;
            };
            for j in 0..msg.num_chunks {
                let stored = match msg.out_sizes[j] {
                    Some(len) => {
                        out.write_all(&msg.compressed[j][..len])
                            .map_err(WimError::Write)?;
                        len as u64
                    }
                    None => {
                        out.write_all(&msg.uncompressed[j][..msg.in_sizes[j]])
                            .map_err(WimError::Write)?;
                        msg.in_sizes[j] as u64
                    }
                };
                state.table.append_chunk(stored);
            }
            state.next_chunk += msg.num_chunks as u64;
            free.push(msg);

            if state.next_chunk == state.table.num_chunks() {
                let state = current.take().expect("current is live");
                finalize_stream(streams, order, head, state, out, params, progress)?;
                outstanding.pop_front();
                let boundary = outstanding.front().copied().unwrap_or(next_pos);
                drain_direct(&mut direct, boundary, streams, order, out, params, progress)?;
            }
        }
    }
}

/// Patches the chunk table of a completed stream, applies the
/// anti-expansion fallback, and publishes its resource entry.
fn finalize_stream<W: OutputFile>(
    streams: &mut [StreamDescriptor],
    order: &[usize],
    pos: usize,
    state: CurrentOut,
    out: &mut W,
    params: &StreamWriteParams<'_>,
    progress: &mut WriteProgress,
) -> WimResult<()> {
    state.table.patch(out)?;
    let desc = &mut streams[order[pos]];
    let entry = if state.table.stored_size() >= desc.size {
        resource::rewrite_uncompressed(desc, out, state.offset, params.codecs)?
    } else {
        ResourceEntry {
            size_in_wim: state.table.stored_size(),
            flags: desc.extra_flags | resflag::COMPRESSED,
            offset: state.offset,
            original_size: desc.size,
        }
    };
    desc.out_entry = Some(entry);
    progress.complete_stream(desc.size);
    Ok(())
}

fn write_one_direct<W: OutputFile>(
    streams: &mut [StreamDescriptor],
    order: &[usize],
    pos: usize,
    out: &mut W,
    params: &StreamWriteParams<'_>,
    progress: &mut WriteProgress,
) -> WimResult<()> {
    let desc = &mut streams[order[pos]];
    resource::write_stream(desc, out, params)?;
    progress.complete_stream(desc.size);
    Ok(())
}

/// Emits queued direct-write streams whose input position precedes
/// `boundary` (the earliest still-in-flight stream).
#[allow(clippy::too_many_arguments)]
fn drain_direct<W: OutputFile>(
    direct: &mut VecDeque<usize>,
    boundary: usize,
    streams: &mut [StreamDescriptor],
    order: &[usize],
    out: &mut W,
    params: &StreamWriteParams<'_>,
    progress: &mut WriteProgress,
) -> WimResult<()> {
    while let Some(&pos) = direct.front() {
        if pos >= boundary {
            break;
        }
        write_one_direct(streams, order, pos, out, params, progress)?;
        direct.pop_front();
    }
    Ok(())
}
