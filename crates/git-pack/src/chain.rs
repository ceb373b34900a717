//! Whole-pack delta chain resolution.
//!
//! Resolving one object on demand (see [`crate::pack::PackFile::read_object`])
//! walks its chain down to a base and applies deltas back up. Operations
//! that touch every object in a pack — verification, repack, `missing`
//! computation — want the inverse traversal instead: start at each
//! non-delta base and walk *down* to its dependents, applying each delta
//! exactly once and discarding a base's decompressed bytes as soon as its
//! last dependent has consumed them.
//!
//! [`DeltaChainIterator`] builds this traversal order up front: it maps
//! every OFS_DELTA and REF_DELTA entry to its base's children list, then
//! runs a depth-first walk from each root (non-delta entry, or an
//! externally-resolved thin-pack base). A reference count on each base's
//! decompressed bytes is released once every child has been visited, so
//! memory use stays bounded by chain depth rather than pack size.

use std::collections::HashMap;

use git_hash::ObjectId;
use git_object::ObjectType;

use crate::entry::parse_entry_header;
use crate::pack::PackFile;
use crate::{PackEntryType, PackError, PackedObject};

/// Resolves an external base object for a thin-pack REF_DELTA.
pub type ExternalResolver<'a> = &'a dyn Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>;

/// Walks every object in a pack in dependency order (bases before the
/// deltas that reference them), yielding each exactly once.
pub struct DeltaChainIterator<'p> {
    pack: &'p PackFile,
    /// Offsets ready to be walked next, in ascending order so output stays
    /// close to on-disk order for non-delta objects.
    roots: Vec<u64>,
    /// child offsets, keyed by their base's offset.
    ofs_children: HashMap<u64, Vec<u64>>,
    /// child offsets, keyed by the OID their REF_DELTA names.
    ref_children: HashMap<ObjectId, Vec<u64>>,
    /// Optional restriction to a subset of offsets (and their dependency
    /// chains); `None` means "walk the whole pack".
    subset: Option<std::collections::HashSet<u64>>,
}

struct WalkState {
    /// Decompressed bytes for each offset currently on a DFS path, with a
    /// pending-child refcount; evicted once the count reaches zero.
    bodies: HashMap<u64, (ObjectType, Vec<u8>, usize)>,
    on_path: std::collections::HashSet<u64>,
    out: Vec<(ObjectId, PackedObject)>,
}

impl<'p> DeltaChainIterator<'p> {
    /// Build an iterator over every object in `pack`.
    pub fn new(pack: &'p PackFile) -> Result<Self, PackError> {
        Self::build(pack, None)
    }

    /// Build an iterator restricted to `offsets` and whatever their delta
    /// chains depend on.
    pub fn for_subset(pack: &'p PackFile, offsets: &[u64]) -> Result<Self, PackError> {
        Self::build(pack, Some(offsets.iter().copied().collect()))
    }

    fn build(
        pack: &'p PackFile,
        subset: Option<std::collections::HashSet<u64>>,
    ) -> Result<Self, PackError> {
        let mut roots = Vec::new();
        let mut ofs_children: HashMap<u64, Vec<u64>> = HashMap::new();
        let mut ref_children: HashMap<ObjectId, Vec<u64>> = HashMap::new();

        for (_, offset, _) in pack.index().iter() {
            let entry = parse_entry_header(&pack.data()[offset as usize..], offset)?;
            match entry.entry_type {
                PackEntryType::Commit | PackEntryType::Tree | PackEntryType::Blob | PackEntryType::Tag => {
                    roots.push(offset);
                }
                PackEntryType::OfsDelta { base_offset } => {
                    ofs_children.entry(base_offset).or_default().push(offset);
                }
                PackEntryType::RefDelta { base_oid } => {
                    if let Some(base_offset) = pack.index().lookup(&base_oid) {
                        ofs_children.entry(base_offset).or_default().push(offset);
                    } else {
                        ref_children.entry(base_oid).or_default().push(offset);
                    }
                }
            }
        }

        roots.sort_unstable();

        Ok(Self {
            pack,
            roots,
            ofs_children,
            ref_children,
            subset,
        })
    }

    /// Resolve every object, applying the given thin-pack resolver for any
    /// REF_DELTA whose base isn't present in this pack.
    pub fn resolve_all(
        &self,
        external_resolver: ExternalResolver<'_>,
    ) -> Result<Vec<(ObjectId, PackedObject)>, PackError> {
        let mut state = WalkState {
            bodies: HashMap::new(),
            on_path: std::collections::HashSet::new(),
            out: Vec::new(),
        };

        // A base's chain has to be walked in full down to any subset member
        // beneath it, since applying a delta requires every ancestor's
        // decompressed bytes; only *emission* (below) is subset-filtered.
        for &root in &self.roots {
            self.visit(root, &mut state)?;
        }

        // Thin-pack roots: REF_DELTA entries whose base lives outside this
        // pack. Resolve the base via the external resolver, seed it as a
        // synthetic root, then walk its (possibly chained) children.
        let mut unresolved = Vec::new();
        for (base_oid, children) in &self.ref_children {
            match external_resolver(base_oid) {
                Some((obj_type, data)) => {
                    let refcount = Self::count_reachable(children, &self.ofs_children);
                    let synthetic_offset = u64::MAX - state.bodies.len() as u64;
                    state
                        .bodies
                        .insert(synthetic_offset, (obj_type, data, refcount));
                    for &child in children {
                        self.visit_delta_child(synthetic_offset, child, &mut state)?;
                    }
                }
                None => unresolved.push(*base_oid),
            }
        }

        if !unresolved.is_empty() {
            return Err(PackError::UnresolvedDeltas(unresolved));
        }

        Ok(state.out)
    }

    fn in_subset(&self, offset: u64) -> bool {
        match &self.subset {
            None => true,
            Some(set) => set.contains(&offset),
        }
    }

    fn count_reachable(children: &[u64], ofs_children: &HashMap<u64, Vec<u64>>) -> usize {
        // Direct children only; grandchildren are counted when the direct
        // child's own refcount is registered during its own visit.
        let _ = ofs_children;
        children.len()
    }

    fn visit(&self, offset: u64, state: &mut WalkState) -> Result<(), PackError> {
        if !state.on_path.insert(offset) {
            return Err(PackError::CircularDelta(offset));
        }

        let entry = parse_entry_header(&self.pack.data()[offset as usize..], offset)?;
        let compressed = &self.pack.data()[entry.data_offset as usize..];
        let data = crate::pack::decompress(compressed, entry.uncompressed_size, offset)?;
        let obj_type = entry.entry_type.to_object_type().expect("root is non-delta");

        let oid = git_hash::hasher::Hasher::hash_object(
            git_hash::HashAlgorithm::Sha1,
            type_name(obj_type),
            &data,
        )?;
        if self.in_subset(offset) {
            state.out.push((
                oid,
                PackedObject {
                    obj_type,
                    data: data.clone(),
                },
            ));
        }

        let children = self.ofs_children.get(&offset).cloned().unwrap_or_default();
        let refcount = children.len();
        if refcount > 0 {
            state.bodies.insert(offset, (obj_type, data, refcount));
            for child in children {
                self.visit_delta_child(offset, child, state)?;
            }
        }

        state.on_path.remove(&offset);
        Ok(())
    }

    fn visit_delta_child(
        &self,
        base_offset: u64,
        offset: u64,
        state: &mut WalkState,
    ) -> Result<(), PackError> {
        if !state.on_path.insert(offset) {
            return Err(PackError::CircularDelta(offset));
        }

        let entry = parse_entry_header(&self.pack.data()[offset as usize..], offset)?;
        let compressed = &self.pack.data()[entry.data_offset as usize..];
        let delta_data = crate::pack::decompress(compressed, entry.uncompressed_size, offset)?;

        let (base_type, resolved) = {
            let (base_type, base_data, _) = state
                .bodies
                .get(&base_offset)
                .ok_or(PackError::CorruptEntry(offset))?;
            (*base_type, crate::delta::apply::apply_delta(base_data, &delta_data)?)
        };

        let oid = git_hash::hasher::Hasher::hash_object(
            git_hash::HashAlgorithm::Sha1,
            type_name(base_type),
            &resolved,
        )?;
        if self.in_subset(offset) {
            state.out.push((
                oid,
                PackedObject {
                    obj_type: base_type,
                    data: resolved.clone(),
                },
            ));
        }

        let grandchildren = self.ofs_children.get(&offset).cloned().unwrap_or_default();
        let refcount = grandchildren.len();
        if refcount > 0 {
            state.bodies.insert(offset, (base_type, resolved, refcount));
            for grandchild in grandchildren {
                self.visit_delta_child(offset, grandchild, state)?;
            }
        }

        state.on_path.remove(&offset);

        // Release this base's refcount; evict its bytes once exhausted.
        if let Some(entry) = state.bodies.get_mut(&base_offset) {
            entry.2 -= 1;
            if entry.2 == 0 {
                state.bodies.remove(&base_offset);
            }
        }

        Ok(())
    }
}

fn type_name(obj_type: ObjectType) -> &'static str {
    match obj_type {
        ObjectType::Commit => "commit",
        ObjectType::Tree => "tree",
        ObjectType::Blob => "blob",
        ObjectType::Tag => "tag",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{encode_entry_header, encode_ofs_delta_offset};
    use crate::{IDX_SIGNATURE, IDX_VERSION, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION};
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use git_hash::hasher::Hasher;
    use git_hash::HashAlgorithm;
    use std::io::Write as _;
    use std::path::Path;

    fn zlib_compress(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut enc = ZlibEncoder::new(&mut out, Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap();
        out
    }

    fn build_test_idx(entries: &[(ObjectId, u64, u32)], pack_checksum: &[u8]) -> Vec<u8> {
        let mut sorted: Vec<_> = entries.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buf = Vec::new();
        buf.extend_from_slice(&IDX_SIGNATURE);
        buf.extend_from_slice(&IDX_VERSION.to_be_bytes());

        let mut fanout = [0u32; 256];
        for (oid, _, _) in &sorted {
            fanout[oid.first_byte() as usize] += 1;
        }
        for i in 1..256 {
            fanout[i] += fanout[i - 1];
        }
        for count in fanout {
            buf.extend_from_slice(&count.to_be_bytes());
        }
        for (oid, _, _) in &sorted {
            buf.extend_from_slice(oid.as_bytes());
        }
        for (_, _, crc) in &sorted {
            buf.extend_from_slice(&crc.to_be_bytes());
        }
        for (_, offset, _) in &sorted {
            buf.extend_from_slice(&(*offset as u32).to_be_bytes());
        }
        buf.extend_from_slice(pack_checksum);
        let idx_checksum = {
            let mut h = Hasher::new(HashAlgorithm::Sha1);
            h.update(&buf);
            h.finalize().unwrap()
        };
        buf.extend_from_slice(idx_checksum.as_bytes());
        buf
    }

    /// Builds base blob + a chain of two OFS_DELTA entries on top of it.
    /// Returns the pack path, `[base, mid, top]` OIDs, and their offsets.
    fn build_chain_pack(dir: &Path) -> (std::path::PathBuf, Vec<ObjectId>, [u64; 3]) {
        let base = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let mid = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaab";
        let top = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaac";

        let delta1 = crate::delta::compute::compute_delta(base, mid);
        let delta2 = crate::delta::compute::compute_delta(mid, top);

        let mut pack = Vec::new();
        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&3u32.to_be_bytes());

        let base_offset = PACK_HEADER_SIZE as u64;
        let base_header = encode_entry_header(3, base.len() as u64);
        pack.extend_from_slice(&base_header);
        pack.extend_from_slice(&zlib_compress(base));

        let mid_offset = pack.len() as u64;
        let mid_header = encode_entry_header(6, delta1.len() as u64);
        pack.extend_from_slice(&mid_header);
        pack.extend_from_slice(&encode_ofs_delta_offset(mid_offset - base_offset));
        pack.extend_from_slice(&zlib_compress(&delta1));

        let top_offset = pack.len() as u64;
        let top_header = encode_entry_header(6, delta2.len() as u64);
        pack.extend_from_slice(&top_header);
        pack.extend_from_slice(&encode_ofs_delta_offset(top_offset - mid_offset));
        pack.extend_from_slice(&zlib_compress(&delta2));

        let checksum = Hasher::digest(HashAlgorithm::Sha1, &pack).unwrap();
        pack.extend_from_slice(checksum.as_bytes());

        let base_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", base).unwrap();
        let mid_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", mid).unwrap();
        let top_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", top).unwrap();

        let crc_of = |start: usize, end: usize| {
            let mut h = crc32fast::Hasher::new();
            h.update(&pack[start..end]);
            h.finalize()
        };
        let entries = vec![
            (base_oid, base_offset, crc_of(base_offset as usize, mid_offset as usize)),
            (mid_oid, mid_offset, crc_of(mid_offset as usize, top_offset as usize)),
            (top_oid, top_offset, crc_of(top_offset as usize, pack.len() - 20)),
        ];

        let idx = build_test_idx(&entries, checksum.as_bytes());

        let pack_path = dir.join("chain.pack");
        let idx_path = dir.join("chain.idx");
        std::fs::write(&pack_path, &pack).unwrap();
        std::fs::write(&idx_path, &idx).unwrap();

        (
            pack_path,
            vec![base_oid, mid_oid, top_oid],
            [base_offset, mid_offset, top_offset],
        )
    }

    #[test]
    fn walks_full_chain_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let (pack_path, oids, _offsets) = build_chain_pack(dir.path());
        let pack = PackFile::open(&pack_path).unwrap();

        let iter = DeltaChainIterator::new(&pack).unwrap();
        let resolved = iter.resolve_all(&|_| None).unwrap();

        assert_eq!(resolved.len(), 3);
        let resolved_oids: std::collections::HashSet<_> = resolved.iter().map(|(oid, _)| *oid).collect();
        for oid in &oids {
            assert!(resolved_oids.contains(oid));
        }

        // The root (non-delta base) must come before its dependents.
        let base_pos = resolved.iter().position(|(oid, _)| oid == &oids[0]).unwrap();
        let mid_pos = resolved.iter().position(|(oid, _)| oid == &oids[1]).unwrap();
        let top_pos = resolved.iter().position(|(oid, _)| oid == &oids[2]).unwrap();
        assert!(base_pos < mid_pos);
        assert!(mid_pos < top_pos);
    }

    #[test]
    fn subset_walk_only_covers_requested_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let (pack_path, _, offsets) = build_chain_pack(dir.path());
        let pack = PackFile::open(&pack_path).unwrap();

        let iter = DeltaChainIterator::for_subset(&pack, &[offsets[0]]).unwrap();
        let resolved = iter.resolve_all(&|_| None).unwrap();

        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn subset_of_a_pure_delta_target_still_resolves_its_chain() {
        let dir = tempfile::tempdir().unwrap();
        let (pack_path, oids, offsets) = build_chain_pack(dir.path());
        let pack = PackFile::open(&pack_path).unwrap();

        // `top` is itself an OFS_DELTA entry, not a root; its chain (base,
        // mid) must still be walked to resolve it, but only `top` should be
        // emitted.
        let iter = DeltaChainIterator::for_subset(&pack, &[offsets[2]]).unwrap();
        let resolved = iter.resolve_all(&|_| None).unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].0, oids[2]); // top
    }
}
