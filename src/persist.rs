//! Persisted metadata (spec §6) over a minimal key/value file abstraction.
//!
//! The real filesystem is an external collaborator (spec §1 Non-goals);
//! this module models it as a `KvStore` trait — byte blobs keyed by
//! filename — mirroring `block/mod.rs`'s `BlockDevice` trait shape (one
//! trait, one in-memory impl for tests, one real-backend impl). The record
//! layouts below follow spec §6 exactly.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const MANIFEST_MAGIC: u32 = 0x4c54464a;
pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_KEY: &str = "MANIFEST";
pub const PLANES_KEY: &str = "planes.bin";
pub const BADBLKS_KEY: &str = "badblks.bin";

pub fn gtd_key(nsid: u32) -> String {
    format!("gtd_ns{nsid}.bin")
}

/// A small key/value file interface. Keys are filenames; values are
/// opaque byte blobs, written and read back whole.
pub trait KvStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// In-memory backend, for tests that need `persist`/`restore` round trips
/// without touching a real filesystem.
#[derive(Default)]
pub struct MemKvStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemKvStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| Error::Internal)?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().map_err(|_| Error::Internal)?.get(key).cloned())
    }
}

/// A `std::fs`-backed store rooted at a directory, standing in for a real
/// small-filesystem backend and exercising the power-cycle scenario (spec
/// §8.4) by actually hitting disk and reopening.
pub struct FsKvStore {
    root: PathBuf,
}

impl FsKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|_| Error::Io)?;
        Ok(FsKvStore { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl KvStore for FsKvStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        fs::write(self.path_for(key), value).map_err(|_| Error::Io)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(_) => Err(Error::Io),
        }
    }
}

/// Per-namespace record inside `MANIFEST`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceRecord {
    pub size_blocks: u64,
    pub capacity_blocks: u64,
    pub util_blocks: u64,
}

/// Full `MANIFEST` contents: magic, version, the allocated/active bitmaps,
/// and one `NamespaceRecord` per namespace slot (spec §6).
#[derive(Debug, Clone)]
pub struct Manifest {
    pub namespace_max: usize,
    pub allocated: Vec<bool>,
    pub active: Vec<bool>,
    pub records: Vec<NamespaceRecord>,
}

impl Manifest {
    pub fn new(namespace_max: usize) -> Self {
        Manifest {
            namespace_max,
            allocated: vec![false; namespace_max],
            active: vec![false; namespace_max],
            records: vec![NamespaceRecord::default(); namespace_max],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MANIFEST_MAGIC.to_le_bytes());
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.namespace_max as u32).to_le_bytes());
        buf.extend_from_slice(&pack_bits(&self.allocated));
        buf.extend_from_slice(&pack_bits(&self.active));
        for rec in &self.records {
            buf.extend_from_slice(&rec.size_blocks.to_le_bytes());
            buf.extend_from_slice(&rec.capacity_blocks.to_le_bytes());
            buf.extend_from_slice(&rec.util_blocks.to_le_bytes());
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 {
            return Err(Error::Invalid);
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let namespace_max = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        if magic != MANIFEST_MAGIC || version != MANIFEST_VERSION {
            return Err(Error::Invalid);
        }

        let bitmap_bytes = (namespace_max + 7) / 8;
        let mut offset = 12;
        let allocated_end = offset + bitmap_bytes;
        let allocated = unpack_bits(
            bytes.get(offset..allocated_end).ok_or(Error::Invalid)?,
            namespace_max,
        );
        offset = allocated_end;
        let active_end = offset + bitmap_bytes;
        let active = unpack_bits(bytes.get(offset..active_end).ok_or(Error::Invalid)?, namespace_max);
        offset = active_end;

        let mut records = Vec::with_capacity(namespace_max);
        for _ in 0..namespace_max {
            let rec_bytes = bytes.get(offset..offset + 24).ok_or(Error::Invalid)?;
            let size_blocks = u64::from_le_bytes(rec_bytes[0..8].try_into().unwrap());
            let capacity_blocks = u64::from_le_bytes(rec_bytes[8..16].try_into().unwrap());
            let util_blocks = u64::from_le_bytes(rec_bytes[16..24].try_into().unwrap());
            records.push(NamespaceRecord { size_blocks, capacity_blocks, util_blocks });
            offset += 24;
        }

        Ok(Manifest { namespace_max, allocated, active, records })
    }
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (bits.len() + 7) / 8];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect()
}

/// `planes.bin` / `badblks.bin`: one packed `blocks_per_plane`-bit bitmap
/// per plane, concatenated in `(channel, chip, die, plane)` order.
pub struct PlaneBitmaps {
    pub blocks_per_plane: usize,
    pub nr_planes: usize,
    pub bits: Vec<Vec<bool>>,
}

impl PlaneBitmaps {
    pub fn new(nr_planes: usize, blocks_per_plane: usize) -> Self {
        PlaneBitmaps {
            blocks_per_plane,
            nr_planes,
            bits: vec![vec![false; blocks_per_plane]; nr_planes],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for plane in &self.bits {
            buf.extend_from_slice(&pack_bits(plane));
        }
        buf
    }

    pub fn decode(bytes: &[u8], nr_planes: usize, blocks_per_plane: usize) -> Result<Self> {
        let bytes_per_plane = (blocks_per_plane + 7) / 8;
        if bytes.len() != bytes_per_plane * nr_planes {
            return Err(Error::Invalid);
        }
        let bits = (0..nr_planes)
            .map(|p| {
                let start = p * bytes_per_plane;
                unpack_bits(&bytes[start..start + bytes_per_plane], blocks_per_plane)
            })
            .collect();
        Ok(PlaneBitmaps { blocks_per_plane, nr_planes, bits })
    }
}

/// `gtd_ns<N>.bin`: one PPN (or `PPN_SENTINEL`) per translation page.
pub fn encode_gtd(entries: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * 4);
    for &ppn in entries {
        buf.extend_from_slice(&ppn.to_le_bytes());
    }
    buf
}

pub fn decode_gtd(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Invalid);
    }
    Ok(bytes.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect())
}

/// Convenience: a `KvStore` rooted at a host directory, matching the
/// shape callers get from `FsKvStore::new` but named for test readability.
pub fn fs_store_at(dir: impl AsRef<Path>) -> Result<FsKvStore> {
    FsKvStore::new(dir.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_through_encode_decode() {
        let mut m = Manifest::new(4);
        m.allocated[0] = true;
        m.active[0] = true;
        m.records[0] = NamespaceRecord { size_blocks: 100, capacity_blocks: 90, util_blocks: 10 };

        let bytes = m.encode();
        let decoded = Manifest::decode(&bytes).unwrap();
        assert_eq!(decoded.namespace_max, 4);
        assert_eq!(decoded.allocated, vec![true, false, false, false]);
        assert_eq!(decoded.active, vec![true, false, false, false]);
        assert_eq!(decoded.records[0].size_blocks, 100);
        assert_eq!(decoded.records[0].capacity_blocks, 90);
        assert_eq!(decoded.records[0].util_blocks, 10);
    }

    #[test]
    fn manifest_rejects_bad_magic() {
        let bytes = vec![0u8; 12];
        assert!(matches!(Manifest::decode(&bytes), Err(Error::Invalid)));
    }

    #[test]
    fn plane_bitmaps_round_trip() {
        let mut bm = PlaneBitmaps::new(2, 10);
        bm.bits[0][3] = true;
        bm.bits[1][9] = true;
        let bytes = bm.encode();
        let decoded = PlaneBitmaps::decode(&bytes, 2, 10).unwrap();
        assert!(decoded.bits[0][3]);
        assert!(decoded.bits[1][9]);
        assert!(!decoded.bits[0][4]);
    }

    #[test]
    fn gtd_round_trips_with_sentinel() {
        let entries = vec![0u32, 5, crate::config::PPN_SENTINEL];
        let bytes = encode_gtd(&entries);
        assert_eq!(decode_gtd(&bytes).unwrap(), entries);
    }

    #[test]
    fn fs_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsKvStore::new(dir.path()).unwrap();
            store.put(MANIFEST_KEY, b"hello").unwrap();
        }
        let reopened = FsKvStore::new(dir.path()).unwrap();
        assert_eq!(reopened.get(MANIFEST_KEY).unwrap(), Some(b"hello".to_vec()));
    }
}
