//! Window-heuristic deltify pass.
//!
//! Groups candidate objects by type and approximate size, then picks delta
//! bases from a sliding window of recently-seen objects of the same type —
//! the same heuristic `pack.window` controls in C git (default 10).

use git_hash::ObjectId;
use git_object::ObjectType;

use crate::delta::compute::compute_delta;

/// Default delta search window size (matches git's `pack.window` default).
pub const DEFAULT_WINDOW: usize = 10;

/// A candidate object to be written to a pack, along with a path hint used
/// only to group similar blobs together before deltifying.
pub struct DeltifyInput {
    pub oid: ObjectId,
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
    pub path_hint: Vec<u8>,
}

/// One object as the deltifier decided to emit it: either full data, or a
/// delta against a base already assigned an index earlier in `objects()`.
pub struct UnpackedObject {
    pub oid: ObjectId,
    pub obj_type: ObjectType,
    /// Full object bytes if not deltified, otherwise the raw delta stream.
    pub data: Vec<u8>,
    /// Base object id, if `data` is a delta.
    pub delta_base: Option<ObjectId>,
}

/// Only consider deltifying against a base whose compressed size is within
/// this factor of the candidate's size — matches git's `max_size` heuristic
/// for rejecting deltas that wouldn't pay for their own header.
const MAX_BASE_SIZE_RATIO: usize = 4;

/// Run the deltify pass over `inputs`, returning one [`UnpackedObject`] per
/// input in the same order.
///
/// Objects are grouped by `(obj_type, path_hint)` and, within each group,
/// sorted by descending size (as git does, so bigger objects tend to serve
/// as bases for smaller ones). A sliding window of up to `window` prior
/// objects in the same group is searched for the smallest resulting delta;
/// an input is only considered as a base for a later one in the same group,
/// never the reverse, so no cycle can form.
pub fn deltify(inputs: Vec<DeltifyInput>, window: usize) -> Vec<UnpackedObject> {
    let window = window.max(1);
    let n = inputs.len();

    // Stable original-index so the output can be reassembled in input order.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        let ia = &inputs[a];
        let ib = &inputs[b];
        ia.obj_type
            .as_bytes()
            .cmp(ib.obj_type.as_bytes())
            .then_with(|| ia.path_hint.cmp(&ib.path_hint))
            .then_with(|| ib.data.len().cmp(&ia.data.len()))
    });

    let mut result: Vec<Option<UnpackedObject>> = (0..n).map(|_| None).collect();
    // Candidates already committed to the output, in `order`'s visitation
    // order, restricted to the current (type, path_hint) group.
    let mut recent: Vec<usize> = Vec::with_capacity(window);
    let mut current_group: Option<(ObjectType, Vec<u8>)> = None;

    for &idx in &order {
        let input = &inputs[idx];
        let group = (input.obj_type, input.path_hint.clone());
        if current_group.as_ref() != Some(&group) {
            current_group = Some(group);
            recent.clear();
        }

        let mut best: Option<(usize, Vec<u8>)> = None;
        for &cand_idx in recent.iter().rev().take(window) {
            let base = &inputs[cand_idx];
            if base.data.len() > input.data.len().saturating_mul(MAX_BASE_SIZE_RATIO)
                || input.data.len() > base.data.len().saturating_mul(MAX_BASE_SIZE_RATIO)
            {
                continue;
            }
            let delta = compute_delta(&base.data, &input.data);
            if delta.len() >= input.data.len() {
                continue;
            }
            let better = match &best {
                Some((_, d)) => delta.len() < d.len(),
                None => true,
            };
            if better {
                best = Some((cand_idx, delta));
            }
        }

        result[idx] = Some(match best {
            Some((base_idx, delta)) => UnpackedObject {
                oid: input.oid,
                obj_type: input.obj_type,
                data: delta,
                delta_base: Some(inputs[base_idx].oid),
            },
            None => UnpackedObject {
                oid: input.oid,
                obj_type: input.obj_type,
                data: input.data.clone(),
                delta_base: None,
            },
        });

        recent.push(idx);
        if recent.len() > window {
            recent.remove(0);
        }
    }

    result.into_iter().map(|o| o.unwrap()).collect()
}
