//! Piece records and chunk geometry.
//!
//! A torrent's byte stream is cut into fixed-length pieces, each verified
//! independently against its SHA-1 digest, and pieces are cut into chunks,
//! the unit of request and transfer on the wire. [`Piece`] tracks the
//! download state of one piece; free functions here do the index arithmetic.

use std::fmt;

/// Default chunk size for outbound requests (16 KiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 16384;

/// One outstanding or incoming chunk transfer: piece index plus the byte
/// range within that piece.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.index, self.begin, self.length)
    }
}

/// Number of chunks in a piece of `piece_len` bytes.
pub fn chunk_count(piece_len: u64, chunk_size: u32) -> usize {
    piece_len.div_ceil(chunk_size as u64) as usize
}

/// Chunk index within a piece for a request's byte offset.
pub fn chunk_index(begin: u32, chunk_size: u32) -> usize {
    (begin / chunk_size) as usize
}

/// The byte range of chunk `chunk` within a piece of `piece_len` bytes.
pub fn chunk_range(piece_len: u64, chunk_size: u32, chunk: usize) -> (u32, u32) {
    let begin = chunk as u64 * chunk_size as u64;
    let length = (piece_len - begin).min(chunk_size as u64);
    (begin as u32, length as u32)
}

/// Download state for one piece.
///
/// A chunk bit is "dirty" while the chunk still needs to be fetched; arrival
/// clears it and a failed verification sets them all again. `pending_writes`
/// counts chunk writes that have been handed to storage but not yet
/// acknowledged, so verification never races an in-flight write.
#[derive(Debug)]
pub(crate) struct Piece {
    pub hash: [u8; 20],
    pub ever_hashed: bool,
    pub hashing: bool,
    pub queued_for_hash: bool,
    pub pending_writes: u32,
    dirty_chunks: Vec<bool>,
}

impl Piece {
    pub fn new(hash: [u8; 20], piece_len: u64, chunk_size: u32) -> Self {
        Self {
            hash,
            ever_hashed: false,
            hashing: false,
            queued_for_hash: false,
            pending_writes: 0,
            dirty_chunks: vec![true; chunk_count(piece_len, chunk_size)],
        }
    }

    pub fn num_chunks(&self) -> usize {
        self.dirty_chunks.len()
    }

    pub fn chunk_dirty(&self, chunk: usize) -> bool {
        self.dirty_chunks.get(chunk).copied().unwrap_or(false)
    }

    /// Marks a chunk as received.
    pub fn clear_dirty(&mut self, chunk: usize) {
        if let Some(bit) = self.dirty_chunks.get_mut(chunk) {
            *bit = false;
        }
    }

    /// Marks a chunk as needing a re-request.
    pub fn set_dirty(&mut self, chunk: usize) {
        if let Some(bit) = self.dirty_chunks.get_mut(chunk) {
            *bit = true;
        }
    }

    /// Re-pends every chunk, e.g. after a failed hash check.
    pub fn set_all_dirty(&mut self) {
        self.dirty_chunks.fill(true);
    }

    /// True when every chunk has arrived and the piece is ready to verify.
    pub fn all_chunks_clean(&self) -> bool {
        self.dirty_chunks.iter().all(|d| !d)
    }

    pub fn any_chunk_dirty(&self) -> bool {
        self.dirty_chunks.iter().any(|d| *d)
    }

    /// Dirty chunk indices, in order.
    pub fn dirty_chunk_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.dirty_chunks
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.then_some(i))
    }

    /// True once any chunk has arrived but not all have.
    pub fn partially_downloaded(&self) -> bool {
        let any_dirty = self.dirty_chunks.iter().any(|d| *d);
        let any_clean = self.dirty_chunks.iter().any(|d| !*d);
        any_dirty && any_clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_geometry() {
        assert_eq!(chunk_count(262144, DEFAULT_CHUNK_SIZE), 16);
        assert_eq!(chunk_count(1, DEFAULT_CHUNK_SIZE), 1);
        assert_eq!(chunk_count(16385, DEFAULT_CHUNK_SIZE), 2);

        assert_eq!(chunk_range(40000, 16384, 0), (0, 16384));
        assert_eq!(chunk_range(40000, 16384, 2), (32768, 40000 - 32768));

        assert_eq!(chunk_index(0, 16384), 0);
        assert_eq!(chunk_index(32768, 16384), 2);
    }

    #[test]
    fn dirty_tracking() {
        let mut p = Piece::new([0; 20], 40000, 16384);
        assert_eq!(p.num_chunks(), 3);
        assert!(p.any_chunk_dirty());
        assert!(!p.all_chunks_clean());

        p.clear_dirty(0);
        p.clear_dirty(1);
        assert!(p.partially_downloaded());
        p.clear_dirty(2);
        assert!(p.all_chunks_clean());

        p.set_all_dirty();
        assert_eq!(p.dirty_chunk_indices().count(), 3);
    }
}
