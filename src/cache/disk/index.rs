//! Disk index file format and free-space tracking
//!
//! # Format
//!
//! ```text
//! ┌────────────────────────────┬──────────────────────────────┐
//! │ IndexHeader (bincode)      │ IndexSnapshot (bincode)      │
//! │ magic, version, len, crc32c│ data_len, entries, free list │
//! └────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! The snapshot is only trusted if the header validates, the payload checksum
//! matches and every region it names lies inside the recorded data length.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use crc32c::crc32c;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Magic number for index files: "TCIX"
pub const INDEX_MAGIC: u32 = 0x5443_4958;

/// Current index format version
pub const INDEX_VERSION: u16 = 1;

/// Location and bookkeeping of one element in the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSlot {
    /// Start of the block in the data file
    pub offset: u64,
    /// Size of the block reserved at `offset`
    pub block_size: u64,
    /// Bytes of serialized element within the block
    pub payload_len: u64,
    /// Instant the element expires (epoch ms)
    pub expiry_time: u64,
    pub hit_count: u64,
    pub last_access: u64,
    /// Write sequence, used as insertion order
    pub written: u64,
}

impl DiskSlot {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.block_size)
    }
}

/// Reclaimed data file blocks, keyed by block size
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeList {
    blocks: BTreeMap<u64, Vec<u64>>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a block for reuse
    pub fn release(&mut self, offset: u64, block_size: u64) {
        if block_size > 0 {
            self.blocks.entry(block_size).or_default().push(offset);
        }
    }

    /// Take the smallest block that fits `len`, as `(offset, block_size)`
    pub fn take(&mut self, len: u64) -> Option<(u64, u64)> {
        let block_size = *self.blocks.range(len..).next()?.0;
        let offsets = self.blocks.get_mut(&block_size)?;
        let offset = offsets.pop()?;
        if offsets.is_empty() {
            self.blocks.remove(&block_size);
        }
        Some((offset, block_size))
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total bytes in free blocks
    pub fn free_bytes(&self) -> u64 {
        self.blocks
            .iter()
            .map(|(size, offsets)| size * offsets.len() as u64)
            .sum()
    }

    /// Flatten to `(offset, block_size)` pairs
    pub fn to_vec(&self) -> Vec<(u64, u64)> {
        self.blocks
            .iter()
            .flat_map(|(size, offsets)| offsets.iter().map(move |offset| (*offset, *size)))
            .collect()
    }

    pub fn from_blocks(blocks: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut list = Self::new();
        for (offset, size) in blocks {
            list.release(offset, size);
        }
        list
    }
}

/// Serialized state of a disk store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot<K> {
    pub data_len: u64,
    pub next_write: u64,
    pub entries: Vec<(K, DiskSlot)>,
    pub free: Vec<(u64, u64)>,
}

impl<K> IndexSnapshot<K> {
    /// Check every region lies within the data file
    pub fn validate(&self, data_file_len: u64) -> Result<()> {
        if self.data_len > data_file_len {
            return Err(Error::IndexCorruption(format!(
                "index expects {} data bytes, file has {}",
                self.data_len, data_file_len
            )));
        }
        let slots = self.entries.iter().map(|(_, slot)| (slot.offset, slot.end()));
        let free = self.free.iter().map(|(offset, size)| (*offset, offset.saturating_add(*size)));
        for (start, end) in slots.chain(free) {
            if end > self.data_len || start > end {
                return Err(Error::IndexCorruption(format!(
                    "region {start}..{end} outside data length {}",
                    self.data_len
                )));
            }
        }
        if let Some((_, slot)) = self
            .entries
            .iter()
            .find(|(_, slot)| slot.payload_len > slot.block_size)
        {
            return Err(Error::IndexCorruption(format!(
                "payload of {} bytes overruns block of {}",
                slot.payload_len, slot.block_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct IndexHeader {
    magic: u32,
    version: u16,
    payload_len: u64,
    payload_crc: u32,
}

const HEADER_LEN: usize = 4 + 2 + 8 + 4;

/// Write the snapshot atomically (temp file then rename)
pub fn write_index<K: Serialize>(path: &Path, snapshot: &IndexSnapshot<K>) -> Result<()> {
    let payload = bincode::serialize(snapshot)?;
    let header = IndexHeader {
        magic: INDEX_MAGIC,
        version: INDEX_VERSION,
        payload_len: payload.len() as u64,
        payload_crc: crc32c(&payload),
    };
    let mut bytes = bincode::serialize(&header)?;
    bytes.extend_from_slice(&payload);

    let tmp = path.with_extension("index.tmp");
    let mut file = fs::File::create(&tmp)
        .map_err(|e| Error::io(format!("creating {}", tmp.display()), e))?;
    file.write_all(&bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| Error::io(format!("writing {}", tmp.display()), e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io(format!("renaming {}", tmp.display()), e))?;
    Ok(())
}

/// Read and verify a snapshot
pub fn read_index<K: DeserializeOwned>(path: &Path) -> Result<IndexSnapshot<K>> {
    let bytes = fs::read(path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    decode_index(&bytes)
}

fn decode_index<K: DeserializeOwned>(bytes: &[u8]) -> Result<IndexSnapshot<K>> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::IndexCorruption(format!(
            "index truncated at {} bytes",
            bytes.len()
        )));
    }
    let header: IndexHeader = bincode::deserialize(&bytes[..HEADER_LEN])
        .map_err(|e| Error::IndexCorruption(format!("unreadable header: {e}")))?;
    if header.magic != INDEX_MAGIC {
        return Err(Error::IndexCorruption(format!(
            "invalid magic number: expected {:08x}, got {:08x}",
            INDEX_MAGIC, header.magic
        )));
    }
    if header.version != INDEX_VERSION {
        return Err(Error::IndexCorruption(format!(
            "unsupported index version {}",
            header.version
        )));
    }
    let payload = &bytes[HEADER_LEN..];
    if payload.len() as u64 != header.payload_len {
        return Err(Error::IndexCorruption(format!(
            "payload length {} does not match header {}",
            payload.len(),
            header.payload_len
        )));
    }
    let crc = crc32c(payload);
    if crc != header.payload_crc {
        return Err(Error::IndexCorruption(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            header.payload_crc, crc
        )));
    }
    bincode::deserialize(payload)
        .map_err(|e| Error::IndexCorruption(format!("unreadable snapshot: {e}")))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_slot(offset: u64, block_size: u64) -> DiskSlot {
        DiskSlot {
            offset,
            block_size,
            payload_len: block_size,
            expiry_time: u64::MAX,
            hit_count: 0,
            last_access: 0,
            written: 0,
        }
    }

    fn make_snapshot() -> IndexSnapshot<String> {
        IndexSnapshot {
            data_len: 300,
            next_write: 3,
            entries: vec![
                ("a".to_string(), make_slot(0, 100)),
                ("b".to_string(), make_slot(200, 100)),
            ],
            free: vec![(100, 100)],
        }
    }

    #[test]
    fn test_free_list_best_fit() {
        let mut free = FreeList::new();
        free.release(0, 64);
        free.release(64, 16);
        free.release(80, 32);
        assert_eq!(free.take(20), Some((80, 32)));
        assert_eq!(free.take(20), Some((0, 64)));
        assert_eq!(free.take(20), None);
        assert_eq!(free.len(), 1);
        assert_eq!(free.free_bytes(), 16);
    }

    #[test]
    fn test_free_list_ignores_empty_blocks() {
        let mut free = FreeList::new();
        free.release(10, 0);
        assert!(free.is_empty());
    }

    #[test]
    fn test_index_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.index");
        write_index(&path, &make_snapshot()).unwrap();
        let loaded: IndexSnapshot<String> = read_index(&path).unwrap();
        assert_eq!(loaded, make_snapshot());
        assert!(loaded.validate(300).is_ok());
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.index");
        write_index(&path, &make_snapshot()).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        assert_matches!(
            read_index::<String>(&path),
            Err(Error::IndexCorruption(msg)) if msg.contains("checksum")
        );
    }

    #[test]
    fn test_garbage_and_truncated_files() {
        assert_matches!(
            decode_index::<String>(b"short"),
            Err(Error::IndexCorruption(_))
        );
        assert_matches!(
            decode_index::<String>(&[0xAB; 64]),
            Err(Error::IndexCorruption(_))
        );
    }

    #[test]
    fn test_validate_rejects_out_of_bounds() {
        let snapshot = make_snapshot();
        assert!(snapshot.validate(299).is_err());
        let mut bad = make_snapshot();
        bad.entries.push(("c".to_string(), make_slot(250, 100)));
        assert!(bad.validate(300).is_err());
    }
}
