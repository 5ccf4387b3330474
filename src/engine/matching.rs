//! The incremental match algebra.
//!
//! A `MatchResult` is one node of a singly-linked assignment path. Joining
//! one (key, value) assignment onto a prior path computes the new candidate
//! rule-id set as an O(n+m) streaming merge of two sorted arrays (the
//! key's posting list for the value and the prior path's candidate set)
//! instead of per-rule boolean evaluation:
//!
//! - present on both sides: survives;
//! - posting-side only: survives iff the rule is not indexed under a key
//!   the prior path already assigned (it would have surfaced there);
//! - prior-side only: survives iff the rule is not indexed under the key
//!   being assigned (absence from the posting means a value mismatch).
//!
//! The candidate set is a pruned superset; `properties_for_match` verifies
//! every candidate against the path's actual values before merging, so the
//! posting index and the mask tests never decide correctness.
//!
//! Each node memoizes its candidates against the rule-store generation and
//! transparently recomputes itself when stale. A disabled or newly loaded
//! rule set is never surfaced as an error; the next read just pays one
//! recomputation walk.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::hash::{chain_checksum, ids_hash, FxHashMap};
use super::keys::{KeyData, KeyId};
use super::meta::Meta;
use super::properties::{PropertyMap, PropertyValue};
use super::rules::RuleId;
use super::value::Value;

/// Cache key for merged property maps: path identity (checksum + mask) plus
/// the candidate set it was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PropertyCacheKey {
    checksum: u64,
    mask: u64,
    ids: u64,
}

struct MatchState {
    /// Rule-store generation the candidates were computed against
    generation: u64,
    /// Sorted candidate rule ids compatible with this path
    candidates: Arc<Vec<RuleId>>,
}

/// One node in a match path. Immutable except for the self-invalidating
/// candidate memo.
pub struct MatchResult {
    parent: Option<Arc<MatchResult>>,
    /// The assignment joined at this node; `None` only for the root.
    assignment: Option<(KeyId, Value)>,
    /// Union bitmask of keys assigned along the path
    mask: u64,
    /// Sequential hash over (key id, value hash) pairs: the path's
    /// identity surrogate for the shared property cache
    checksum: u64,
    state: RwLock<MatchState>,
}

impl MatchResult {
    /// The empty-path match: candidates are the unindexed rules.
    pub(crate) fn root(meta: &Meta) -> Arc<MatchResult> {
        let store = meta.rule_store();
        Arc::new(MatchResult {
            parent: None,
            assignment: None,
            mask: 0,
            checksum: 0,
            state: RwLock::new(MatchState {
                generation: store.generation(),
                candidates: Arc::new(store.unindexed_snapshot()),
            }),
        })
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    pub fn assignment(&self) -> Option<(KeyId, &Value)> {
        self.assignment.as_ref().map(|(k, v)| (*k, v))
    }

    /// Current candidate set, recomputed first if the rule base has moved
    /// past the generation this node was computed at.
    pub(crate) fn candidates(self: &Arc<Self>, meta: &Meta) -> Arc<Vec<RuleId>> {
        let generation = meta.rule_store().generation();
        {
            let state = self.state.read();
            if state.generation == generation {
                return Arc::clone(&state.candidates);
            }
        }
        self.refresh(meta, generation)
    }

    fn refresh(self: &Arc<Self>, meta: &Meta, generation: u64) -> Arc<Vec<RuleId>> {
        trace!(checksum = self.checksum, "stale match path recomputed");
        let candidates = match (&self.parent, &self.assignment) {
            (Some(parent), Some((key_id, value))) => {
                let key = meta.key_index().get(*key_id);
                let parent_candidates = parent.candidates(meta);
                Arc::new(compute_candidates(
                    meta,
                    &parent_candidates,
                    parent.mask,
                    &key,
                    value,
                ))
            }
            _ => Arc::new(meta.rule_store().unindexed_snapshot()),
        };
        let mut state = self.state.write();
        state.generation = generation;
        state.candidates = Arc::clone(&candidates);
        candidates
    }

    /// Effective (key, value) assignments along the path, latest wins.
    pub(crate) fn path_values(&self) -> FxHashMap<KeyId, Value> {
        let mut values: FxHashMap<KeyId, Value> = FxHashMap::default();
        let mut cursor = Some(self);
        while let Some(node) = cursor {
            if let Some((key, value)) = &node.assignment {
                values.entry(*key).or_insert_with(|| value.clone());
            }
            cursor = node.parent.as_deref();
        }
        values
    }
}

/// Joins one assignment onto `parent`, producing the child path node.
pub(crate) fn join(
    meta: &Meta,
    parent: &Arc<MatchResult>,
    key: &Arc<KeyData>,
    value: &Value,
) -> Arc<MatchResult> {
    let parent_candidates = parent.candidates(meta);
    let candidates = compute_candidates(meta, &parent_candidates, parent.mask, key, value);
    meta.stats().note_match_computed();
    Arc::new(MatchResult {
        parent: Some(Arc::clone(parent)),
        assignment: Some((key.id(), value.clone())),
        mask: parent.mask | key.mask(),
        checksum: chain_checksum(parent.checksum, key.id(), value.value_hash()),
        state: RwLock::new(MatchState {
            generation: meta.rule_store().generation(),
            candidates: Arc::new(candidates),
        }),
    })
}

/// The streaming sorted-array merge described in the module docs.
fn compute_candidates(
    meta: &Meta,
    prior: &[RuleId],
    prior_mask: u64,
    key: &Arc<KeyData>,
    value: &Value,
) -> Vec<RuleId> {
    let store = meta.rule_store();
    let key_mask = key.mask();

    // Posting union for the assigned value; list assignments union the
    // postings of every element.
    let posting: Vec<RuleId> = if value.is_list() {
        let mut union: Vec<RuleId> = Vec::new();
        for element in value.elements() {
            union.extend_from_slice(&key.postings_for(element));
        }
        union.sort_unstable();
        union.dedup();
        union
    } else {
        key.postings_for(value).as_ref().clone()
    };

    let mut merged: Vec<RuleId> = Vec::with_capacity(posting.len() + prior.len());
    let (mut i, mut j) = (0usize, 0usize);
    while i < posting.len() || j < prior.len() {
        match (posting.get(i), prior.get(j)) {
            (Some(&a), Some(&b)) if a == b => {
                merged.push(a);
                i += 1;
                j += 1;
            }
            (Some(&a), b) if b.is_none() || a < *b.unwrap() => {
                // Posting-side only: keep unless the rule is indexed under
                // a key the prior path already assigned.
                if store.rule(a).indexed_mask() & prior_mask == 0 {
                    merged.push(a);
                }
                i += 1;
            }
            (_, Some(&b)) => {
                // Prior-side only: keep unless the rule is indexed under
                // the key being assigned.
                if store.rule(b).indexed_mask() & key_mask == 0 {
                    merged.push(b);
                }
                j += 1;
            }
            _ => unreachable!(),
        }
    }
    merged
}

/// Filters, verifies and rank-orders the path's candidates, then folds
/// their property maps through the registered merge policies. The final
/// immutable map is cached globally, so any session traversing the same
/// logical path reuses it.
pub(crate) fn properties_for_match(meta: &Meta, path: &Arc<MatchResult>) -> Arc<PropertyMap> {
    let store = meta.rule_store();
    let candidates = path.candidates(meta);
    let generation = store.generation();

    let cache_key = PropertyCacheKey {
        checksum: path.checksum,
        mask: path.mask,
        ids: ids_hash(&candidates, generation),
    };
    if let Some(cached) = meta.property_cache().get(&cache_key) {
        meta.stats().note_property_cache_hit();
        return Arc::clone(&cached);
    }

    let keys = meta.key_index();
    let path_values = path.path_values();
    let declare = path_values.contains_key(&meta.builtin_keys().declare);

    let mut applicable: Vec<Arc<super::rules::Rule>> = candidates
        .iter()
        .map(|id| store.rule(*id))
        .filter(|rule| {
            rule.is_enabled()
                && rule.matched_mask() & !path.mask == 0
                && rule.matches_path(keys, &path_values)
        })
        .collect();
    // Rank ascending; ids break ties in insertion order, keeping the fold
    // stable.
    applicable.sort_by_key(|rule| (rule.rank(), rule.id()));

    let registry = meta.merger_registry();
    let mut properties = PropertyMap::new();
    for rule in &applicable {
        for (name, incoming) in rule.properties().iter() {
            let merged = match properties.get(name) {
                Some(existing) => registry.merge(name, existing, incoming, declare),
                // A lone contribution still funnels through the policy in
                // declare mode, so accumulation starts from empty.
                None if declare => {
                    registry.merge(name, &PropertyValue::Concrete(Value::Nil), incoming, declare)
                }
                None => incoming.clone(),
            };
            properties.insert(name.clone(), merged);
        }
    }

    let properties = Arc::new(properties);
    meta.property_cache()
        .insert(cache_key, Arc::clone(&properties));
    meta.stats().note_property_computed();
    properties
}
