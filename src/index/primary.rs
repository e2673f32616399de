//! Primary Index - exact feed id → storage location lookup
//!
//! In-memory HashMap guarded by a single RwLock, persisted in a fixed-width
//! little-endian binary format:
//!
//! ```text
//! magic: [u8; 16] = "feedlineprimary1"
//! version: u8
//! count: u64
//! per entry:
//!   id: u64 | chunk: u32 | offset: u64 | time_nanos: i64 (UTC)
//! ```

use crate::index::codec::{self, MAGIC_LEN};
use crate::index::{read_lock, write_lock};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::FeedRef;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::RwLock;

const PRIMARY_MAGIC: [u8; MAGIC_LEN] = *b"feedlineprimary1";
const PRIMARY_VERSION: u8 = 1;

/// Upper bound accepted for the entry count while decoding
const MAX_ENTRIES: u64 = 1 << 32;

/// Exact map from feed id to its location in the chunk store
#[derive(Debug, Default)]
pub struct PrimaryIndex {
    entries: RwLock<HashMap<u64, FeedRef>>,
}

impl PrimaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a feed's location
    pub fn search(&self, id: u64) -> Option<FeedRef> {
        read_lock(&self.entries).get(&id).copied()
    }

    /// Insert or overwrite a feed's location (last write wins).
    ///
    /// `FeedRef::time` is `DateTime<Utc>`, so callers holding a zoned
    /// timestamp normalize with `with_timezone(&Utc)` before building the ref.
    pub fn add(&self, id: u64, location: FeedRef) {
        write_lock(&self.entries).insert(id, location);
    }

    /// Point-in-time snapshot of all ids
    pub fn ids(&self) -> HashSet<u64> {
        read_lock(&self.entries).keys().copied().collect()
    }

    pub fn count(&self) -> u32 {
        read_lock(&self.entries).len() as u32
    }

    pub fn contains(&self, id: u64) -> bool {
        read_lock(&self.entries).contains_key(&id)
    }

    /// Release excess capacity once the owning block stops accepting writes
    pub fn shrink_to_fit(&self) {
        write_lock(&self.entries).shrink_to_fit();
    }

    /// Encode the whole index under one read lock
    pub fn encode_to<W: Write>(&self, w: &mut W) -> StorageResult<()> {
        let entries = read_lock(&self.entries);

        codec::write_header(w, &PRIMARY_MAGIC, PRIMARY_VERSION)?;
        codec::write_u64(w, entries.len() as u64)?;

        for (id, location) in entries.iter() {
            let nanos = location.time.timestamp_nanos_opt().ok_or_else(|| {
                StorageError::Serialization(format!(
                    "feed {} timestamp {} not representable in nanoseconds",
                    id, location.time
                ))
            })?;

            codec::write_u64(w, *id)?;
            codec::write_u32(w, location.chunk)?;
            codec::write_u64(w, location.offset)?;
            codec::write_i64(w, nanos)?;
        }
        Ok(())
    }

    /// Decode an encoded index, replacing the current contents.
    ///
    /// Nothing is replaced unless the whole input decodes.
    pub fn decode_from<R: Read>(&self, r: &mut R) -> StorageResult<()> {
        let mut entries = write_lock(&self.entries);

        codec::read_header(r, &PRIMARY_MAGIC, PRIMARY_VERSION, "primary index")?;
        let count = codec::checked_len(codec::read_u64(r)?, MAX_ENTRIES, "primary index")?;

        let mut decoded = HashMap::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            let id = codec::read_u64(r)?;
            let chunk = codec::read_u32(r)?;
            let offset = codec::read_u64(r)?;
            let nanos = codec::read_i64(r)?;

            decoded.insert(
                id,
                FeedRef {
                    chunk,
                    offset,
                    time: Utc.timestamp_nanos(nanos),
                },
            );
        }

        *entries = decoded;
        Ok(())
    }
}
