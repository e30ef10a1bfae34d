//! Storage contracts and the bundled backends.
//!
//! The engine addresses torrent data as one flat byte stream and tracks
//! per-piece completion through the same handle. [`FileStorage`] is the
//! default backend, laying files out under a data directory the way the
//! metainfo describes them; [`MemoryStorage`] backs tests and seeds.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::metainfo::{Info, InfoHash};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read/write outside torrent data: offset {offset}, len {len}")]
    OutOfBounds { offset: u64, len: usize },
}

/// Opens per-torrent storage; the client holds one of these as its default
/// and torrent specs may override it.
pub trait StorageClient: Send + Sync {
    fn open_torrent(
        &self,
        info: &Info,
        info_hash: InfoHash,
    ) -> Result<Arc<dyn TorrentStorage>, StorageError>;
}

/// Piece-addressable data for one torrent.
///
/// Reads and writes use offsets into the torrent's flat byte stream.
/// Completion flags are the backend's; the engine only trusts a piece that
/// the backend reports complete.
pub trait TorrentStorage: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), StorageError>;
    fn mark_complete(&self, piece: usize) -> Result<(), StorageError>;
    fn is_complete(&self, piece: usize) -> bool;
    fn clear_complete(&self, piece: usize);
}

/// File-backed storage rooted at a data directory.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StorageClient for FileStorage {
    fn open_torrent(
        &self,
        info: &Info,
        _info_hash: InfoHash,
    ) -> Result<Arc<dyn TorrentStorage>, StorageError> {
        let mut spans = Vec::with_capacity(info.files.len());
        for entry in &info.files {
            let path = self.root.join(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            spans.push(FileSpan {
                path,
                offset: entry.offset,
                length: entry.length,
            });
        }
        Ok(Arc::new(TorrentFiles {
            spans,
            total_length: info.total_length,
            complete: Mutex::new(vec![false; info.num_pieces()]),
        }))
    }
}

struct FileSpan {
    path: PathBuf,
    offset: u64,
    length: u64,
}

/// The per-torrent handle of [`FileStorage`].
struct TorrentFiles {
    spans: Vec<FileSpan>,
    total_length: u64,
    complete: Mutex<Vec<bool>>,
}

impl TorrentFiles {
    /// Runs `op` for each file span overlapping `[offset, offset+len)`,
    /// passing the span, the in-file offset, and the slice range.
    fn for_spans<F>(&self, offset: u64, len: usize, mut op: F) -> Result<(), StorageError>
    where
        F: FnMut(&FileSpan, u64, std::ops::Range<usize>) -> Result<(), StorageError>,
    {
        if offset + len as u64 > self.total_length {
            return Err(StorageError::OutOfBounds { offset, len });
        }
        let mut cursor = offset;
        let end = offset + len as u64;
        for span in &self.spans {
            let span_end = span.offset + span.length;
            if cursor >= span_end || span.offset >= end {
                continue;
            }
            let in_file = cursor - span.offset;
            let take = (span_end.min(end) - cursor) as usize;
            let buf_start = (cursor - offset) as usize;
            op(span, in_file, buf_start..buf_start + take)?;
            cursor += take as u64;
            if cursor == end {
                break;
            }
        }
        Ok(())
    }
}

impl TorrentStorage for TorrentFiles {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError> {
        self.for_spans(offset, buf.len(), |span, in_file, range| {
            let mut f = File::open(&span.path)?;
            f.seek(SeekFrom::Start(in_file))?;
            f.read_exact(&mut buf[range])?;
            Ok(())
        })
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), StorageError> {
        self.for_spans(offset, buf.len(), |span, in_file, range| {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&span.path)?;
            f.seek(SeekFrom::Start(in_file))?;
            f.write_all(&buf[range])?;
            Ok(())
        })
    }

    fn mark_complete(&self, piece: usize) -> Result<(), StorageError> {
        if let Some(flag) = self.complete.lock().get_mut(piece) {
            *flag = true;
        }
        Ok(())
    }

    fn is_complete(&self, piece: usize) -> bool {
        self.complete.lock().get(piece).copied().unwrap_or(false)
    }

    fn clear_complete(&self, piece: usize) {
        if let Some(flag) = self.complete.lock().get_mut(piece) {
            *flag = false;
        }
    }
}

/// In-memory storage, for tests and for seeding fixtures.
pub struct MemoryStorage;

impl StorageClient for MemoryStorage {
    fn open_torrent(
        &self,
        info: &Info,
        _info_hash: InfoHash,
    ) -> Result<Arc<dyn TorrentStorage>, StorageError> {
        Ok(Arc::new(MemoryTorrent::empty(
            info.total_length,
            info.num_pieces(),
        )))
    }
}

/// One torrent held fully in memory.
pub struct MemoryTorrent {
    data: Mutex<Vec<u8>>,
    complete: Mutex<Vec<bool>>,
}

impl MemoryTorrent {
    pub fn empty(total_length: u64, num_pieces: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; total_length as usize]),
            complete: Mutex::new(vec![false; num_pieces]),
        }
    }

    /// Pre-filled storage with every piece already marked complete.
    pub fn seeded(data: Vec<u8>, num_pieces: usize) -> Self {
        Self {
            data: Mutex::new(data),
            complete: Mutex::new(vec![true; num_pieces]),
        }
    }
}

impl TorrentStorage for MemoryTorrent {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(StorageError::OutOfBounds {
                offset,
                len: buf.len(),
            });
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), StorageError> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(StorageError::OutOfBounds {
                offset,
                len: buf.len(),
            });
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn mark_complete(&self, piece: usize) -> Result<(), StorageError> {
        if let Some(flag) = self.complete.lock().get_mut(piece) {
            *flag = true;
        }
        Ok(())
    }

    fn is_complete(&self, piece: usize) -> bool {
        self.complete.lock().get(piece).copied().unwrap_or(false)
    }

    fn clear_complete(&self, piece: usize) {
        if let Some(flag) = self.complete.lock().get_mut(piece) {
            *flag = false;
        }
    }
}
