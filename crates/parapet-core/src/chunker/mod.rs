//! Content-defined chunking with a buzhash rolling hash.
//!
//! A boundary is declared immediately after the sliding window when
//! `hash & (avg_size - 1) == 0`, subject to `min_size <= len <= max_size`.
//! The byte table below is derived from a fixed seed and is part of chunker
//! format v1: changing it (or any parameter) changes every boundary, so the
//! parameters live in the repository manifest, not in client configuration.

use std::io::Read;

use parapet_types::{ChunkHash, Result};

use crate::config::ChunkerConfig;

/// Chunker format version recorded in the repository manifest.
pub const CHUNKER_FORMAT_VERSION: u32 = 1;

const BUZ_TABLE_SEED: u64 = 0x7061_7261_7065_7431; // "parapet1"

/// One chunk of the input stream: where it lies and what it hashes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub offset: u64,
    pub length: usize,
    pub hash: ChunkHash,
}

const fn build_table() -> [u64; 256] {
    // splitmix64 over an incrementing seed; frozen as format v1.
    let mut table = [0u64; 256];
    let mut state = BUZ_TABLE_SEED;
    let mut i = 0;
    while i < 256 {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        table[i] = z ^ (z >> 31);
        i += 1;
    }
    table
}

static BUZ_TABLE: [u64; 256] = build_table();

/// Length of the next chunk starting at `data[0]`.
///
/// `data` must hold at least `min(remaining, max_size)` bytes of lookahead;
/// a short final slice simply becomes the final chunk.
fn next_boundary(data: &[u8], config: &ChunkerConfig) -> usize {
    let min = config.min_size as usize;
    let max = config.max_size as usize;
    let window = config.window as usize;
    let mask = (config.avg_size - 1) as u64;

    if data.len() <= min {
        return data.len();
    }
    let limit = data.len().min(max);

    // Start rolling `window` bytes before the earliest legal cut point so the
    // window is exactly full when boundaries become admissible.
    let mut hash: u64 = 0;
    let wrap_shift = (window % 64) as u32;
    let roll_from = min - window;
    for (i, &byte) in data[roll_from..limit].iter().enumerate() {
        let pos = roll_from + i;
        if i >= window {
            let outgoing = data[pos - window];
            hash = hash.rotate_left(1)
                ^ BUZ_TABLE[outgoing as usize].rotate_left(wrap_shift)
                ^ BUZ_TABLE[byte as usize];
        } else {
            hash = hash.rotate_left(1) ^ BUZ_TABLE[byte as usize];
        }
        let len = pos + 1;
        if len >= min && hash & mask == 0 {
            return len;
        }
    }
    limit
}

/// Chunk a byte slice. Returns `(offset, length, sha256)` triples covering the
/// input with no gaps or overlaps. Deterministic for a given config.
pub fn chunk_data(data: &[u8], config: &ChunkerConfig) -> Vec<ChunkRef> {
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < data.len() {
        let len = next_boundary(&data[start..], config);
        chunks.push(ChunkRef {
            offset: start as u64,
            length: len,
            hash: ChunkHash::compute(&data[start..start + len]),
        });
        start += len;
    }
    chunks
}

/// Streaming chunker over any `Read`. Yields the same chunk sequence as
/// [`chunk_data`] on the concatenated input.
pub struct ChunkStream<R: Read> {
    reader: R,
    config: ChunkerConfig,
    buffer: Vec<u8>,
    offset: u64,
    eof: bool,
}

pub fn chunk_stream<R: Read>(reader: R, config: &ChunkerConfig) -> ChunkStream<R> {
    ChunkStream {
        reader,
        config: config.clone(),
        buffer: Vec::with_capacity(config.max_size as usize),
        offset: 0,
        eof: false,
    }
}

impl<R: Read> ChunkStream<R> {
    /// Top the buffer up to `max_size` bytes (or EOF).
    fn fill(&mut self) -> std::io::Result<()> {
        let target = self.config.max_size as usize;
        let mut scratch = [0u8; 64 * 1024];
        while !self.eof && self.buffer.len() < target {
            let want = (target - self.buffer.len()).min(scratch.len());
            match self.reader.read(&mut scratch[..want]) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buffer.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = Result<ChunkRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.fill() {
            return Some(Err(e.into()));
        }
        if self.buffer.is_empty() {
            return None;
        }
        let len = next_boundary(&self.buffer, &self.config);
        let chunk = ChunkRef {
            offset: self.offset,
            length: len,
            hash: ChunkHash::compute(&self.buffer[..len]),
        };
        self.buffer.drain(..len);
        self.offset += len as u64;
        Some(Ok(chunk))
    }
}
