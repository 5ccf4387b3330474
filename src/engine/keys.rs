//! Context keys and the per-key rule posting index.
//!
//! Every classification axis ("class", "field", "operation", ...) interns to
//! a `KeyData` with a dense integer id. Ids stay below 64 so that selector
//! sets compress into single-word bitmasks on the match path.
//!
//! Per key, the index maps each concrete selector value to a sorted,
//! grow-only posting list of rule ids. Posting lists only ever append while
//! holding the write lock, so concurrent readers never observe a torn list.
//! Value inheritance ("parent values") is resolved at lookup time: the
//! posting lookup for a value transitively unions its parents' lists, with
//! the union memoized against the total source length last observed, so the
//! transitive walk reruns only after new rules arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::error::MetaError;
use super::meta::Meta;
use super::rules::RuleId;
use super::value::Value;

/// Dense key id, usable as a bit position in selector masks.
pub type KeyId = u32;

/// Hard cap on distinct context keys: one bit each in a `u64` mask.
pub const MAX_CONTEXT_KEYS: usize = 64;

#[inline]
pub fn key_bit(id: KeyId) -> u64 {
    1u64 << id
}

/// Rewrites values on assignment, before matching (e.g. canonicalizing an
/// object reference down to its type name).
pub trait ValueTransformer: Send + Sync {
    fn transform(&self, value: Value) -> Value;
}

/// Notified the first time a (key, value) pair is asserted in any context.
/// Callers use this to lazily register rules for values they only learn
/// about at runtime. Dispatched at most once per pair, under the global
/// update lock (which is reentrant, so observers may add rules).
pub trait KeyInitObserver: Send + Sync {
    fn value_seen(&self, meta: &Meta, key: &str, value: &Value);
}

/// Per-(key, value) posting list: sorted rule ids, append-only.
#[derive(Default)]
pub struct PostingList {
    ids: RwLock<Vec<RuleId>>,
}

impl PostingList {
    fn insert(&self, id: RuleId) {
        let mut ids = self.ids.write();
        if let Err(pos) = ids.binary_search(&id) {
            ids.insert(pos, id);
        }
    }

    fn len(&self) -> usize {
        self.ids.read().len()
    }

    fn copy_into(&self, out: &mut Vec<RuleId>) {
        out.extend_from_slice(&self.ids.read());
    }
}

/// One interned context key.
pub struct KeyData {
    id: KeyId,
    name: Arc<str>,

    /// Whether the latest assignment of this key determines *whose*
    /// properties are being computed (see `Context` property reads).
    is_property_scope: AtomicBool,

    /// Optional value rewrite applied on every `set` of this key.
    transformer: RwLock<Option<Arc<dyn ValueTransformer>>>,

    /// First-use observers, fired once per (key, value).
    observers: RwLock<Vec<Arc<dyn KeyInitObserver>>>,

    /// value -> sorted rule-id posting list
    postings: DashMap<Value, PostingList>,

    /// Memoized transitive posting unions across the value-parent chain,
    /// tagged with the total source length each was computed from. Kept in a
    /// separate map from `postings` so recomputation can read posting shards
    /// without holding a guard into them.
    inherited: DashMap<Value, (usize, Arc<Vec<RuleId>>)>,

    /// value -> parent value (inheritance chain, e.g. subclass -> class)
    parent_values: DashMap<Value, Value>,

    /// Values already dispatched to first-use observers.
    seen_values: DashMap<Value, ()>,
}

impl KeyData {
    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mask(&self) -> u64 {
        key_bit(self.id)
    }

    pub fn is_property_scope(&self) -> bool {
        self.is_property_scope.load(Ordering::Relaxed)
    }

    pub(crate) fn set_property_scope(&self) {
        self.is_property_scope.store(true, Ordering::Relaxed);
    }

    pub(crate) fn set_transformer(&self, t: Arc<dyn ValueTransformer>) {
        *self.transformer.write() = Some(t);
    }

    pub fn transform(&self, value: Value) -> Value {
        match &*self.transformer.read() {
            Some(t) => t.transform(value),
            None => value,
        }
    }

    pub(crate) fn add_observer(&self, observer: Arc<dyn KeyInitObserver>) {
        self.observers.write().push(observer);
    }

    pub(crate) fn set_parent_value(&self, value: Value, parent: Value) {
        self.parent_values.insert(value, parent);
    }

    pub fn parent_value(&self, value: &Value) -> Option<Value> {
        self.parent_values.get(value).map(|p| p.clone())
    }

    pub(crate) fn add_posting(&self, value: &Value, id: RuleId) {
        self.postings
            .entry(value.clone())
            .or_default()
            .insert(id);
    }

    /// The value-parent chain starting at `value`, most specific first.
    /// Bounded by a revisit check so a mis-configured cycle cannot hang the
    /// match path.
    fn value_chain(&self, value: &Value) -> SmallVec<[Value; 4]> {
        let mut chain: SmallVec<[Value; 4]> = SmallVec::new();
        chain.push(value.clone());
        let mut cursor = value.clone();
        while let Some(parent) = self.parent_value(&cursor) {
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent.clone());
            cursor = parent;
        }
        chain
    }

    /// Sorted union of posting lists for `value` and its parents, memoized
    /// against the total source length last observed. Racing recomputations
    /// are idempotent: both produce equal lists, whichever insert wins.
    pub fn postings_for(&self, value: &Value) -> Arc<Vec<RuleId>> {
        let chain = self.value_chain(value);
        let total: usize = chain
            .iter()
            .map(|v| self.postings.get(v).map(|p| p.len()).unwrap_or(0))
            .sum();

        if let Some(memo) = self.inherited.get(value) {
            let (observed, ids) = &*memo;
            if *observed == total {
                return Arc::clone(ids);
            }
        }

        let mut merged: Vec<RuleId> = Vec::with_capacity(total);
        for v in &chain {
            if let Some(posting) = self.postings.get(v) {
                posting.copy_into(&mut merged);
            }
        }
        merged.sort_unstable();
        merged.dedup();
        let merged = Arc::new(merged);
        self.inherited
            .insert(value.clone(), (total, Arc::clone(&merged)));
        merged
    }

    /// Returns true if `assigned` satisfies an exact-value selector on
    /// `expected`, directly or through the value-parent chain. List
    /// assignments match if any element does.
    pub fn value_matches(&self, assigned: &Value, expected: &Value) -> bool {
        assigned
            .elements()
            .iter()
            .any(|el| self.value_chain(el).contains(expected))
    }

    /// Cheap pre-check for the double-checked observer dispatch.
    pub(crate) fn value_known(&self, value: &Value) -> bool {
        self.seen_values.contains_key(value)
    }

    /// Marks `value` seen; returns the observers to fire if this was the
    /// first reference. Callers must hold the global update lock.
    pub(crate) fn mark_seen(&self, value: &Value) -> Option<Vec<Arc<dyn KeyInitObserver>>> {
        if self.seen_values.insert(value.clone(), ()).is_some() {
            return None;
        }
        let observers = self.observers.read();
        if observers.is_empty() {
            None
        } else {
            Some(observers.clone())
        }
    }
}

/// The key interning table: name -> dense id -> `KeyData`.
pub struct KeyIndex {
    keys: RwLock<Vec<Arc<KeyData>>>,
    by_name: DashMap<String, KeyId>,
}

impl KeyIndex {
    pub fn new() -> Self {
        KeyIndex {
            keys: RwLock::new(Vec::new()),
            by_name: DashMap::new(),
        }
    }

    /// Interns `name`, creating a new dense id on first reference.
    pub fn intern(&self, name: &str) -> Result<Arc<KeyData>, MetaError> {
        if let Some(id) = self.by_name.get(name) {
            return Ok(self.get(*id));
        }
        let mut keys = self.keys.write();
        // Re-check under the write lock: another thread may have interned
        // the same name between the map probe and here.
        if let Some(id) = self.by_name.get(name) {
            return Ok(Arc::clone(&keys[*id as usize]));
        }
        if keys.len() >= MAX_CONTEXT_KEYS {
            return Err(MetaError::KeyLimit {
                key: name.to_string(),
            });
        }
        let id = keys.len() as KeyId;
        let data = Arc::new(KeyData {
            id,
            name: Arc::from(name),
            is_property_scope: AtomicBool::new(false),
            transformer: RwLock::new(None),
            observers: RwLock::new(Vec::new()),
            postings: DashMap::new(),
            inherited: DashMap::new(),
            parent_values: DashMap::new(),
            seen_values: DashMap::new(),
        });
        keys.push(Arc::clone(&data));
        self.by_name.insert(name.to_string(), id);
        Ok(data)
    }

    pub fn get(&self, id: KeyId) -> Arc<KeyData> {
        Arc::clone(&self.keys.read()[id as usize])
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<KeyData>> {
        self.by_name.get(name).map(|id| self.get(*id))
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyIndex {
    fn default() -> Self {
        Self::new()
    }
}
