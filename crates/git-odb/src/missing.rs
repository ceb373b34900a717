//! Missing-object finder: the set-difference graph walk used by fetch/pack
//! generation to compute "everything reachable from `wants` that isn't
//! already reachable from `haves`".

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use git_hash::ObjectId;
use git_object::{FileMode, Object, ObjectType};

use crate::{ObjectDatabase, OdbError};

/// Walk the commit graph reachable from `wants`, stopping at `haves` and at
/// any commit in `shallow`, and return every object (commits, trees, blobs —
/// annotated tags are peeled and included too) reachable from `wants` but
/// not from `haves`.
///
/// `parents_of` supplies a commit's parents; callers pass something that
/// defers to the object itself for the ordinary case, but may override it to
/// honor grafts or a shallow file without this layer needing to know about
/// either.
///
/// Returns [`OdbError::MissingObject`] if a reachable object isn't present
/// in the store, and [`OdbError::Cancelled`] if `cancel` is set between
/// objects.
pub fn find_missing(
    odb: &ObjectDatabase,
    wants: &[ObjectId],
    haves: &[ObjectId],
    shallow: &HashSet<ObjectId>,
    parents_of: impl Fn(&ObjectId) -> Vec<ObjectId>,
    cancel: Option<&AtomicBool>,
) -> Result<Vec<ObjectId>, OdbError> {
    let known = mark_reachable_from_haves(haves, shallow, &parents_of);

    let mut result = Vec::new();
    let mut visited_commits: HashSet<ObjectId> = HashSet::new();
    let mut visited_objects: HashSet<ObjectId> = HashSet::new();
    let mut queue: Vec<ObjectId> = wants.to_vec();

    while let Some(id) = queue.pop() {
        check_cancelled(cancel)?;

        if known.contains(&id) || !visited_commits.insert(id) {
            continue;
        }

        let (obj_type, data) = odb
            .get_raw(&id)?
            .ok_or(OdbError::MissingObject(id))?;
        let obj = Object::parse_content(obj_type, &data).map_err(|e| OdbError::Corrupt {
            oid: id,
            reason: e.to_string(),
        })?;

        match obj {
            Object::Tag(tag) => {
                result.push(id);
                queue.push(tag.target);
            }
            Object::Commit(commit) => {
                result.push(id);
                collect_tree(odb, &commit.tree, &mut visited_objects, &mut result, cancel)?;
                if !shallow.contains(&id) {
                    for parent in parents_of(&id) {
                        if !known.contains(&parent) {
                            queue.push(parent);
                        }
                    }
                }
            }
            Object::Tree(_) | Object::Blob(_) => {
                return Err(OdbError::Corrupt {
                    oid: id,
                    reason: "want set may only contain commits and annotated tags".to_string(),
                });
            }
        }
    }

    Ok(result)
}

/// Everything reachable from `haves` (commits, stopping at `shallow`
/// boundaries) is treated as already known to the peer and excluded from
/// the result — its trees and blobs are never visited.
fn mark_reachable_from_haves(
    haves: &[ObjectId],
    shallow: &HashSet<ObjectId>,
    parents_of: &impl Fn(&ObjectId) -> Vec<ObjectId>,
) -> HashSet<ObjectId> {
    let mut known = HashSet::new();
    let mut queue: Vec<ObjectId> = haves.to_vec();
    while let Some(id) = queue.pop() {
        if !known.insert(id) {
            continue;
        }
        if shallow.contains(&id) {
            continue;
        }
        for parent in parents_of(&id) {
            queue.push(parent);
        }
    }
    known
}

fn collect_tree(
    odb: &ObjectDatabase,
    tree_id: &ObjectId,
    visited: &mut HashSet<ObjectId>,
    result: &mut Vec<ObjectId>,
    cancel: Option<&AtomicBool>,
) -> Result<(), OdbError> {
    if !visited.insert(*tree_id) {
        return Ok(());
    }
    check_cancelled(cancel)?;

    let (obj_type, data) = odb
        .get_raw(tree_id)?
        .ok_or(OdbError::MissingObject(*tree_id))?;
    if obj_type != ObjectType::Tree {
        return Err(OdbError::Corrupt {
            oid: *tree_id,
            reason: format!("expected tree, found {obj_type}"),
        });
    }
    let tree = git_object::Tree::parse(&data).map_err(|e| OdbError::Corrupt {
        oid: *tree_id,
        reason: e.to_string(),
    })?;

    result.push(*tree_id);
    for entry in tree.iter() {
        if entry.mode == FileMode::Gitlink {
            // Submodule commit reference: not owned by this store.
            continue;
        }
        if entry.mode.is_tree() {
            collect_tree(odb, &entry.oid, visited, result, cancel)?;
        } else {
            if !odb.contains(&entry.oid) {
                return Err(OdbError::MissingObject(entry.oid));
            }
            if visited.insert(entry.oid) {
                result.push(entry.oid);
            }
        }
    }
    Ok(())
}

fn check_cancelled(cancel: Option<&AtomicBool>) -> Result<(), OdbError> {
    if let Some(flag) = cancel {
        if flag.load(Ordering::Relaxed) {
            return Err(OdbError::Cancelled);
        }
    }
    Ok(())
}
