//! Pack index (v1/v2/v3) reading and lookup.
//!
//! The pack index provides fast OID → offset mapping using a fan-out table
//! and binary search. Three on-disk layouts exist:
//!
//! ```text
//! v1 (no magic):
//!   Fanout:  256 × 4-byte big-endian cumulative counts
//!   Records: count × (4-byte offset, 20-byte sha), sorted by sha
//!   Trailer: 20-byte pack checksum | 20-byte index checksum
//!
//! v2 (magic \xfftOc, version 2):
//!   Header:  \xff tOc (4 bytes) | version (4 bytes = 2)
//!   Fanout:  256 × 4-byte big-endian cumulative counts
//!   OIDs:    N × 20-byte sorted OIDs
//!   CRC32:   N × 4-byte CRC32 values
//!   Offsets: N × 4-byte offsets (high bit = 1 → use 64-bit table)
//!   64-bit:  M × 8-byte offsets (for packs > 2GB)
//!   Trailer: 20-byte pack checksum | 20-byte index checksum
//!
//! v3 (magic \xfftOc, version 3):
//!   Header:  \xff tOc (4 bytes) | version (4 bytes = 3)
//!            | hash algorithm (4 bytes: 1=SHA-1, 2=SHA-256)
//!            | shortened OID length (4 bytes)
//!   (remainder identical to v2, with OID/checksum sizes following the
//!   declared hash algorithm's digest length)
//! ```
//!
//! Version is detected from the first 4 bytes: the v2/v3 magic
//! `\xfftOc`, or its absence (⇒ v1).

use std::path::{Path, PathBuf};

use git_hash::{HashAlgorithm, ObjectId};
use memmap2::Mmap;

use crate::{IDX_SIGNATURE, PackError};

/// On-disk pack index format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackIndexVersion {
    V1,
    V2,
    V3,
}

impl PackIndexVersion {
    fn has_crc32(self) -> bool {
        !matches!(self, Self::V1)
    }
}

/// Pack index providing OID → offset mapping.
pub struct PackIndex {
    data: Mmap,
    version: PackIndexVersion,
    num_objects: u32,
    hash_algo: HashAlgorithm,
    fanout_offset: usize,
    /// v1 only: byte offset where interleaved (offset, sha) records start.
    v1_record_offset: usize,
    /// v2/v3 only: byte offset where the sorted OID table starts.
    oid_offset: usize,
    /// v2/v3 only: byte offset where the CRC32 table starts.
    crc_offset: usize,
    /// v2/v3 only: byte offset where the 32-bit offset table starts.
    offset32_offset: usize,
    /// v2/v3 only: byte offset where the 64-bit offset table starts.
    offset64_offset: usize,
    idx_path: PathBuf,
    reverse: std::sync::OnceLock<crate::revindex::ReverseIndex>,
}

impl PackIndex {
    /// Open a pack index file, auto-detecting its version.
    pub fn open(idx_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let idx_path = idx_path.as_ref().to_path_buf();
        let file = std::fs::File::open(&idx_path)?;
        let data = unsafe { Mmap::map(&file)? };

        if data.len() >= 4 && data[0..4] == IDX_SIGNATURE {
            if data.len() < 8 {
                return Err(PackError::InvalidIndex("file too small".into()));
            }
            let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            match version {
                2 => Self::open_v2_or_v3(data, idx_path, PackIndexVersion::V2, 8, HashAlgorithm::Sha1),
                3 => {
                    if data.len() < 16 {
                        return Err(PackError::InvalidIndex("v3 header too small".into()));
                    }
                    let algo_id = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
                    let hash_algo = match algo_id {
                        1 => HashAlgorithm::Sha1,
                        2 => HashAlgorithm::Sha256,
                        _ => {
                            return Err(PackError::InvalidIndex(format!(
                                "unknown hash algorithm id {algo_id}"
                            )));
                        }
                    };
                    Self::open_v2_or_v3(data, idx_path, PackIndexVersion::V3, 16, hash_algo)
                }
                n => Err(PackError::UnsupportedVersion(n)),
            }
        } else {
            Self::open_v1(data, idx_path)
        }
    }

    fn open_v1(data: Mmap, idx_path: PathBuf) -> Result<Self, PackError> {
        let hash_algo = HashAlgorithm::Sha1;
        let hash_len = hash_algo.digest_len();

        if data.len() < 1024 + 2 * hash_len {
            return Err(PackError::InvalidIndex("v1 file too small".into()));
        }

        let fanout_offset = 0;
        let last_fanout_pos = fanout_offset + 255 * 4;
        let num_objects = u32::from_be_bytes([
            data[last_fanout_pos],
            data[last_fanout_pos + 1],
            data[last_fanout_pos + 2],
            data[last_fanout_pos + 3],
        ]);

        let record_offset = fanout_offset + 1024;
        let record_size = 4 + hash_len;
        let min_size = record_offset + num_objects as usize * record_size + 2 * hash_len;
        if data.len() < min_size {
            return Err(PackError::InvalidIndex(format!(
                "v1 file too small: {} < {min_size}",
                data.len()
            )));
        }

        Ok(Self {
            data,
            version: PackIndexVersion::V1,
            num_objects,
            hash_algo,
            fanout_offset,
            v1_record_offset: record_offset,
            oid_offset: 0,
            crc_offset: 0,
            offset32_offset: 0,
            offset64_offset: 0,
            idx_path,
            reverse: std::sync::OnceLock::new(),
        })
    }

    fn open_v2_or_v3(
        data: Mmap,
        idx_path: PathBuf,
        version: PackIndexVersion,
        header_len: usize,
        hash_algo: HashAlgorithm,
    ) -> Result<Self, PackError> {
        let hash_len = hash_algo.digest_len();

        if data.len() < header_len + 1024 + 2 * hash_len {
            return Err(PackError::InvalidIndex("file too small".into()));
        }

        let fanout_offset = header_len;
        let last_fanout_pos = fanout_offset + 255 * 4;
        let num_objects = u32::from_be_bytes([
            data[last_fanout_pos],
            data[last_fanout_pos + 1],
            data[last_fanout_pos + 2],
            data[last_fanout_pos + 3],
        ]);

        let n = num_objects as usize;
        let oid_offset = fanout_offset + 1024;
        let crc_offset = oid_offset + n * hash_len;
        let offset32_offset = crc_offset + n * 4;
        let offset64_offset = offset32_offset + n * 4;

        let min_size = offset64_offset + 2 * hash_len;
        if data.len() < min_size {
            return Err(PackError::InvalidIndex(format!(
                "file too small: {} < {min_size}",
                data.len()
            )));
        }

        Ok(Self {
            data,
            version,
            num_objects,
            hash_algo,
            fanout_offset,
            v1_record_offset: 0,
            oid_offset,
            crc_offset,
            offset32_offset,
            offset64_offset,
            idx_path,
            reverse: std::sync::OnceLock::new(),
        })
    }

    /// Look up an OID, returning the offset in the pack file.
    pub fn lookup(&self, oid: &ObjectId) -> Option<u64> {
        let (lo, hi) = self.fanout_range(oid.first_byte());
        if lo >= hi {
            return None;
        }
        let target = oid.as_bytes();

        let mut low = lo;
        let mut high = hi;
        while low < high {
            let mid = low + (high - low) / 2;
            let mid_oid = self.oid_bytes_at(mid);
            match mid_oid.cmp(target) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Some(self.offset_at_index(mid as u32)),
            }
        }
        None
    }

    /// Look up by OID prefix, returning all matches as (OID, offset) pairs.
    pub fn lookup_prefix(&self, prefix: &[u8]) -> Vec<(ObjectId, u64)> {
        if prefix.is_empty() {
            return Vec::new();
        }

        let first_byte = prefix[0];
        let (lo, hi) = self.fanout_range(first_byte);

        let mut results = Vec::new();
        for i in lo..hi {
            let oid_bytes = self.oid_bytes_at(i);
            if oid_bytes.len() >= prefix.len() && oid_bytes[..prefix.len()] == *prefix {
                if let Ok(oid) = ObjectId::from_bytes(oid_bytes, self.oid_hash_algo()) {
                    results.push((oid, self.offset_at_index(i as u32)));
                }
            }
        }
        results
    }

    /// Reverse lookup: the OID of the object stored at the given pack offset.
    ///
    /// Built on a lazily-constructed [`crate::revindex::ReverseIndex`].
    pub fn oid_at_offset(&self, offset: u64) -> Option<ObjectId> {
        let reverse = self
            .reverse
            .get_or_init(|| crate::revindex::ReverseIndex::build(self));
        reverse
            .index_position_at_offset(offset)
            .map(|pos| self.oid_at_index(pos))
    }

    /// Get the OID at the given sorted index position.
    pub fn oid_at_index(&self, index: u32) -> ObjectId {
        let bytes = self.oid_bytes_at(index as usize);
        ObjectId::from_bytes(bytes, self.oid_hash_algo()).expect("valid OID in index")
    }

    /// Get the pack file offset at the given sorted index position.
    pub fn offset_at_index(&self, index: u32) -> u64 {
        match self.version {
            PackIndexVersion::V1 => {
                let pos = self.v1_record_offset + index as usize * self.v1_record_size();
                u32::from_be_bytes([
                    self.data[pos],
                    self.data[pos + 1],
                    self.data[pos + 2],
                    self.data[pos + 3],
                ]) as u64
            }
            PackIndexVersion::V2 | PackIndexVersion::V3 => {
                let pos = self.offset32_offset + index as usize * 4;
                let val = u32::from_be_bytes([
                    self.data[pos],
                    self.data[pos + 1],
                    self.data[pos + 2],
                    self.data[pos + 3],
                ]);

                if val & 0x8000_0000 != 0 {
                    let idx64 = (val & 0x7FFF_FFFF) as usize;
                    let pos64 = self.offset64_offset + idx64 * 8;
                    u64::from_be_bytes([
                        self.data[pos64],
                        self.data[pos64 + 1],
                        self.data[pos64 + 2],
                        self.data[pos64 + 3],
                        self.data[pos64 + 4],
                        self.data[pos64 + 5],
                        self.data[pos64 + 6],
                        self.data[pos64 + 7],
                    ])
                } else {
                    val as u64
                }
            }
        }
    }

    /// Get the CRC32 at the given sorted index position, if this index
    /// version stores one (v1 does not).
    pub fn crc32_at_index(&self, index: u32) -> Option<u32> {
        if !self.version.has_crc32() {
            return None;
        }
        let pos = self.crc_offset + index as usize * 4;
        Some(u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]))
    }

    /// Total number of objects in this index.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Index format version.
    pub fn version(&self) -> PackIndexVersion {
        self.version
    }

    /// Hash algorithm declared by this index (v3 only; v1/v2 are always SHA-1).
    pub fn hash_algo(&self) -> HashAlgorithm {
        self.hash_algo
    }

    /// Path to the .idx file.
    pub fn path(&self) -> &Path {
        &self.idx_path
    }

    /// Pack checksum stored in the index trailer.
    pub fn pack_checksum(&self) -> ObjectId {
        let hash_len = HashAlgorithm::Sha1.digest_len();
        let start = self.data.len() - 2 * hash_len;
        ObjectId::from_bytes(&self.data[start..start + hash_len], HashAlgorithm::Sha1)
            .expect("valid checksum in index trailer")
    }

    /// Index checksum (the trailing hash of the index file itself).
    pub fn index_checksum(&self) -> ObjectId {
        let hash_len = HashAlgorithm::Sha1.digest_len();
        let start = self.data.len() - hash_len;
        ObjectId::from_bytes(&self.data[start..start + hash_len], HashAlgorithm::Sha1)
            .expect("valid checksum in index trailer")
    }

    /// Verify the index's own trailing checksum against its content.
    pub fn check(&self) -> Result<(), PackError> {
        let hash_len = HashAlgorithm::Sha1.digest_len();
        let content = &self.data[..self.data.len() - hash_len];
        let stored = self.index_checksum();

        let mut hasher = git_hash::hasher::Hasher::new(HashAlgorithm::Sha1);
        hasher.update(content);
        let computed = hasher.finalize().map_err(PackError::Hash)?;

        if computed != stored {
            return Err(PackError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }
        Ok(())
    }

    /// Iterate over all (OID, offset, crc32) triples in sorted OID order.
    pub fn iter(&self) -> PackIndexIter<'_> {
        PackIndexIter { index: self, pos: 0 }
    }

    fn fanout_range(&self, first_byte: u8) -> (usize, usize) {
        let end = self.fanout_entry(first_byte) as usize;
        let start = if first_byte == 0 {
            0
        } else {
            self.fanout_entry(first_byte - 1) as usize
        };
        (start, end)
    }

    fn fanout_entry(&self, index: u8) -> u32 {
        let pos = self.fanout_offset + index as usize * 4;
        u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ])
    }

    fn v1_record_size(&self) -> usize {
        4 + self.hash_algo.digest_len()
    }

    /// Hash algorithm to use when materializing OIDs from this index's OID
    /// table. v1/v2 are always SHA-1; v3 follows the declared algorithm.
    fn oid_hash_algo(&self) -> HashAlgorithm {
        match self.version {
            PackIndexVersion::V1 | PackIndexVersion::V2 => HashAlgorithm::Sha1,
            PackIndexVersion::V3 => self.hash_algo,
        }
    }

    fn oid_bytes_at(&self, index: usize) -> &[u8] {
        match self.version {
            PackIndexVersion::V1 => {
                let pos = self.v1_record_offset + index * self.v1_record_size() + 4;
                &self.data[pos..pos + self.hash_algo.digest_len()]
            }
            PackIndexVersion::V2 | PackIndexVersion::V3 => {
                let hash_len = self.oid_hash_algo().digest_len();
                let start = self.oid_offset + index * hash_len;
                &self.data[start..start + hash_len]
            }
        }
    }
}

/// Iterator over (OID, offset, crc32) triples in a pack index.
pub struct PackIndexIter<'a> {
    index: &'a PackIndex,
    pos: u32,
}

impl<'a> Iterator for PackIndexIter<'a> {
    type Item = (ObjectId, u64, Option<u32>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.index.num_objects {
            return None;
        }
        let oid = self.index.oid_at_index(self.pos);
        let offset = self.index.offset_at_index(self.pos);
        let crc = self.index.crc32_at_index(self.pos);
        self.pos += 1;
        Some((oid, offset, crc))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.index.num_objects - self.pos) as usize;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for PackIndexIter<'a> {}
