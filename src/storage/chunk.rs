//! Chunk store - append-only raw feed storage for one block
//!
//! Feeds and their embedding vectors are appended to numbered chunk files.
//! The primary index maps feed ids to the `(chunk, offset)` of their record.
//!
//! Layout:
//! ```text
//! chunks/
//!   000000.dat
//!   000001.dat      rotated once the previous file exceeds max_bytes
//!
//! chunk file:
//! ┌─────────────────────────────────────────┐
//! │ HEADER (6 bytes)                        │
//! │   magic: [u8; 4] = "FLCK"               │
//! │   version: u16                          │
//! ├─────────────────────────────────────────┤
//! │ RECORDS (variable)                      │
//! │   length: u32                           │
//! │   data: lz4(bincode(ChunkRecord))       │
//! │   crc: u32 (CRC32 of length + data)     │
//! └─────────────────────────────────────────┘
//! ```

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Feed, FeedRef};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Magic bytes for chunk file identification
const CHUNK_MAGIC: [u8; 4] = *b"FLCK";

/// Current chunk format version
const CHUNK_VERSION: u16 = 1;

/// Header size in bytes
const HEADER_SIZE: u64 = 6;

/// Largest record accepted on read
const MAX_RECORD_SIZE: u32 = 256 * 1024 * 1024;

/// What a chunk record holds: the feed plus its embedding vectors
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub feed: Feed,
    pub vectors: Vec<Vec<f32>>,
}

struct Writer {
    chunk: u32,
    file: BufWriter<File>,
    size: u64,
}

/// Append-only store of feed records for a single block
pub struct ChunkStore {
    dir: PathBuf,
    max_bytes: u64,
    writer: Mutex<Option<Writer>>,
    sealed: Mutex<bool>,
}

impl ChunkStore {
    /// Open (or create) the chunk directory, resuming the newest chunk
    pub fn open(dir: impl AsRef<Path>, max_bytes: u64) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            max_bytes: max_bytes.max(HEADER_SIZE + 1),
            writer: Mutex::new(None),
            sealed: Mutex::new(false),
        };

        if let Some(&last) = store.chunk_ids()?.last() {
            let path = store.chunk_path(last);
            if Self::header_torn(&path)? {
                // Crashed between creating the file and writing its header
                tracing::warn!("Rewriting chunk {:?} with a torn header", path);
                *store.lock_writer()? = Some(store.create_chunk(last)?);
                return Ok(store);
            }

            let valid = Self::valid_len(&path)?;
            let file = OpenOptions::new().write(true).open(&path)?;
            if file.metadata()?.len() > valid {
                tracing::warn!(
                    "Truncating torn tail of chunk {:?} to {} bytes",
                    path,
                    valid
                );
                file.set_len(valid)?;
            }

            let mut file = BufWriter::new(file);
            file.seek(SeekFrom::Start(valid))?;
            *store.lock_writer()? = Some(Writer {
                chunk: last,
                file,
                size: valid,
            });
        }

        Ok(store)
    }

    /// Open for reading only; appends are rejected
    pub fn open_sealed(dir: impl AsRef<Path>, max_bytes: u64) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_bytes: max_bytes.max(HEADER_SIZE + 1),
            writer: Mutex::new(None),
            sealed: Mutex::new(true),
        })
    }

    fn lock_writer(&self) -> StorageResult<std::sync::MutexGuard<'_, Option<Writer>>> {
        self.writer
            .lock()
            .map_err(|e| StorageError::Lock(format!("Failed to acquire chunk writer: {}", e)))
    }

    fn is_sealed(&self) -> bool {
        self.sealed.lock().map(|s| *s).unwrap_or(true)
    }

    fn chunk_path(&self, chunk: u32) -> PathBuf {
        self.dir.join(format!("{:06}.dat", chunk))
    }

    /// Ids of existing chunk files, ascending
    pub fn chunk_ids(&self) -> StorageResult<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "dat").unwrap_or(false) {
                if let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse().ok())
                {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn create_chunk(&self, chunk: u32) -> StorageResult<Writer> {
        let mut file = BufWriter::new(File::create(self.chunk_path(chunk))?);
        file.write_all(&CHUNK_MAGIC)?;
        file.write_all(&CHUNK_VERSION.to_le_bytes())?;
        file.flush()?;
        Ok(Writer {
            chunk,
            file,
            size: HEADER_SIZE,
        })
    }

    /// Shorter than a header: the file holds no records
    fn header_torn(path: &Path) -> StorageResult<bool> {
        Ok(std::fs::metadata(path)?.len() < HEADER_SIZE)
    }

    fn check_header<R: Read>(reader: &mut R, path: &Path) -> StorageResult<()> {
        let mut header = [0u8; HEADER_SIZE as usize];
        reader.read_exact(&mut header)?;
        if header[0..4] != CHUNK_MAGIC {
            return Err(StorageError::InvalidFormat(format!(
                "chunk {:?}: invalid magic",
                path
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != CHUNK_VERSION {
            return Err(StorageError::InvalidFormat(format!(
                "chunk {:?}: unsupported version {}",
                path, version
            )));
        }
        Ok(())
    }

    /// Append a record, returning where it landed
    pub fn append(&self, feed: &Feed, vectors: &[Vec<f32>]) -> StorageResult<FeedRef> {
        if self.is_sealed() {
            return Err(StorageError::BlockNotWritable(format!(
                "chunk store {:?} is sealed",
                self.dir
            )));
        }

        let record = ChunkRecord {
            feed: feed.clone(),
            vectors: vectors.to_vec(),
        };
        let data = lz4_flex::compress_prepend_size(&bincode::serialize(&record)?);
        let length = (data.len() as u32).to_le_bytes();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&length);
        hasher.update(&data);
        let crc = hasher.finalize();

        let mut guard = self.lock_writer()?;
        let rotate = match guard.as_ref() {
            None => true,
            Some(w) => w.size >= self.max_bytes && w.size > HEADER_SIZE,
        };
        if rotate {
            let next = match guard.as_mut() {
                Some(w) => {
                    w.file.flush()?;
                    w.chunk + 1
                }
                None => 0,
            };
            tracing::debug!("Opening chunk {} in {:?}", next, self.dir);
            *guard = Some(self.create_chunk(next)?);
        }

        let writer = guard
            .as_mut()
            .ok_or_else(|| StorageError::Lock("chunk writer missing".into()))?;
        let offset = writer.size;

        writer.file.write_all(&length)?;
        writer.file.write_all(&data)?;
        writer.file.write_all(&crc.to_le_bytes())?;
        writer.file.flush()?;
        writer.size += 8 + data.len() as u64;

        Ok(FeedRef {
            chunk: writer.chunk,
            offset,
            time: feed.time,
        })
    }

    /// Read a single record
    pub fn read(&self, location: &FeedRef) -> StorageResult<ChunkRecord> {
        let path = self.chunk_path(location.chunk);
        let mut reader = BufReader::new(File::open(&path)?);
        reader.seek(SeekFrom::Start(location.offset))?;

        Self::read_record(&mut reader)?.ok_or_else(|| {
            StorageError::Corruption(format!(
                "chunk {} offset {}: unexpected end of file",
                location.chunk, location.offset
            ))
        })
    }

    /// Read one record; Ok(None) on a clean end of file
    fn read_record<R: Read>(reader: &mut R) -> StorageResult<Option<ChunkRecord>> {
        let mut length = [0u8; 4];
        match reader.read_exact(&mut length) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let size = u32::from_le_bytes(length);
        if size > MAX_RECORD_SIZE {
            return Err(StorageError::Corruption(format!(
                "record size {} exceeds limit",
                size
            )));
        }

        let mut data = vec![0u8; size as usize];
        reader.read_exact(&mut data)?;

        let mut crc = [0u8; 4];
        reader.read_exact(&mut crc)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&length);
        hasher.update(&data);
        if hasher.finalize() != u32::from_le_bytes(crc) {
            return Err(StorageError::Corruption("record checksum mismatch".into()));
        }

        let decompressed = lz4_flex::decompress_size_prepended(&data)
            .map_err(|e| StorageError::Corruption(format!("record decompression: {}", e)))?;
        Ok(Some(bincode::deserialize(&decompressed)?))
    }

    /// Byte length of the intact prefix of a chunk file
    fn valid_len(path: &Path) -> StorageResult<u64> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::check_header(&mut reader, path)?;

        let mut valid = HEADER_SIZE;
        loop {
            match Self::read_record(&mut reader) {
                Ok(Some(_)) => valid = reader.stream_position()?,
                Ok(None) => break,
                Err(_) => break,
            }
        }
        Ok(valid)
    }

    /// Every intact record, in append order. A torn or corrupt tail ends the
    /// scan of that chunk.
    pub fn scan(&self) -> StorageResult<Vec<(FeedRef, ChunkRecord)>> {
        let mut records = Vec::new();

        for chunk in self.chunk_ids()? {
            let path = self.chunk_path(chunk);
            if Self::header_torn(&path)? {
                tracing::warn!("Skipping chunk {:?} with a torn header", path);
                continue;
            }
            let mut reader = BufReader::new(File::open(&path)?);
            Self::check_header(&mut reader, &path)?;

            loop {
                let offset = reader.stream_position()?;
                match Self::read_record(&mut reader) {
                    Ok(Some(record)) => {
                        let location = FeedRef {
                            chunk,
                            offset,
                            time: record.feed.time,
                        };
                        records.push((location, record));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Chunk {:?} corrupt at offset {}: {}", path, offset, e);
                        break;
                    }
                }
            }
        }

        Ok(records)
    }

    /// Flush buffered writes and fsync the active chunk
    pub fn sync(&self) -> StorageResult<()> {
        if let Some(writer) = self.lock_writer()?.as_mut() {
            writer.file.flush()?;
            writer.file.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Sync and close the writer; later appends fail
    pub fn seal(&self) -> StorageResult<()> {
        self.sync()?;
        *self.lock_writer()? = None;
        if let Ok(mut sealed) = self.sealed.lock() {
            *sealed = true;
        }
        Ok(())
    }

    /// Total bytes across all chunk files
    pub fn size_bytes(&self) -> u64 {
        self.chunk_ids()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| std::fs::metadata(self.chunk_path(id)).ok())
            .map(|m| m.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::Labels;
    use tempfile::tempdir;

    fn feed(id: u64) -> Feed {
        Feed::new(
            id,
            Labels::new()
                .with("title", format!("feed {}", id))
                .with("content", "x".repeat(64)),
        )
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), 1024 * 1024).unwrap();

        let f = feed(1);
        let vectors = vec![vec![0.1, 0.2, 0.3]];
        let location = store.append(&f, &vectors).unwrap();

        assert_eq!(location.chunk, 0);
        assert_eq!(location.offset, HEADER_SIZE);
        assert_eq!(location.time, f.time);

        let record = store.read(&location).unwrap();
        assert_eq!(record.feed, f);
        assert_eq!(record.vectors, vectors);
    }

    #[test]
    fn test_rotation() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), 200).unwrap();

        let locations: Vec<FeedRef> = (1..=10)
            .map(|i| store.append(&feed(i), &[vec![i as f32; 8]]).unwrap())
            .collect();

        assert!(store.chunk_ids().unwrap().len() > 1);
        for (i, location) in locations.iter().enumerate() {
            let record = store.read(location).unwrap();
            assert_eq!(record.feed.id, i as u64 + 1);
        }
    }

    #[test]
    fn test_reopen_resumes_newest_chunk() {
        let dir = tempdir().unwrap();
        let first = {
            let store = ChunkStore::open(dir.path(), 1024 * 1024).unwrap();
            store.append(&feed(1), &[vec![1.0]]).unwrap()
        };

        let store = ChunkStore::open(dir.path(), 1024 * 1024).unwrap();
        let second = store.append(&feed(2), &[vec![2.0]]).unwrap();

        assert_eq!(second.chunk, first.chunk);
        assert!(second.offset > first.offset);
        assert_eq!(store.read(&first).unwrap().feed.id, 1);
        assert_eq!(store.read(&second).unwrap().feed.id, 2);
    }

    #[test]
    fn test_scan_stops_at_torn_tail() {
        let dir = tempdir().unwrap();
        {
            let store = ChunkStore::open(dir.path(), 1024 * 1024).unwrap();
            for i in 1..=3 {
                store.append(&feed(i), &[vec![i as f32]]).unwrap();
            }
        }

        // Simulate a crash mid-write
        let path = dir.path().join("000000.dat");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let store = ChunkStore::open(dir.path(), 1024 * 1024).unwrap();
        let records = store.scan().unwrap();
        assert_eq!(records.len(), 3);

        // The torn tail was truncated, so new appends stay reachable
        store.append(&feed(4), &[vec![4.0]]).unwrap();
        assert_eq!(store.scan().unwrap().len(), 4);
    }

    #[test]
    fn test_open_recovers_chunk_with_torn_header() {
        let dir = tempdir().unwrap();
        let first = {
            let store = ChunkStore::open(dir.path(), 1024 * 1024).unwrap();
            store.append(&feed(1), &[vec![1.0]]).unwrap()
        };

        // Crash right after rotation created the next file
        std::fs::write(dir.path().join("000001.dat"), [b'F', b'L']).unwrap();

        let store = ChunkStore::open(dir.path(), 1024 * 1024).unwrap();
        let records = store.scan().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, first);

        let second = store.append(&feed(2), &[vec![2.0]]).unwrap();
        assert_eq!(second.chunk, 1);
        assert_eq!(second.offset, HEADER_SIZE);
        assert_eq!(store.read(&second).unwrap().feed.id, 2);
        assert_eq!(store.scan().unwrap().len(), 2);
    }

    #[test]
    fn test_scan_skips_empty_chunk() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), 1024 * 1024).unwrap();
        store.append(&feed(1), &[vec![1.0]]).unwrap();
        File::create(dir.path().join("000007.dat")).unwrap();

        let records = store.scan().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.feed.id, 1);
    }

    #[test]
    fn test_corrupt_record_detected() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), 1024 * 1024).unwrap();
        let location = store.append(&feed(1), &[vec![1.0]]).unwrap();
        store.sync().unwrap();

        let path = dir.path().join("000000.dat");
        let mut bytes = std::fs::read(&path).unwrap();
        let idx = location.offset as usize + 6;
        bytes[idx] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            store.read(&location),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_sealed_rejects_append() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), 1024 * 1024).unwrap();
        let location = store.append(&feed(1), &[vec![1.0]]).unwrap();
        store.seal().unwrap();

        assert!(matches!(
            store.append(&feed(2), &[vec![2.0]]),
            Err(StorageError::BlockNotWritable(_))
        ));
        assert_eq!(store.read(&location).unwrap().feed.id, 1);
    }
}
