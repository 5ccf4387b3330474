//! The per-session assignment stack.
//!
//! A `Context` owns an ordered list of assignment entries, a parallel
//! push/pop frame stack, a flat key→value map and a cursor into the shared
//! activation tree. `set` first consults the activation cache: on a hit the
//! cached recs replay with no rule evaluation at all; on a miss the new
//! transition is computed under the parent node's lock (assignment,
//! override masking, chaining fixpoint), then published for every future
//! session to replay.
//!
//! Frames carry an undo log, so `pop()` restores the value map, the mask
//! flags and the activation cursor to exactly the pre-`push()` state.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::activation::{Activation, ChildKey, DeferredAssignment, StaticRec};
use super::hash::{FxHashMap, FxHashSet};
use super::keys::{KeyData, KeyId};
use super::matching::{self, MatchResult};
use super::meta::Meta;
use super::properties::{DynamicProperty, PropertyMap, PropertyValue};
use super::value::Value;

/// Hard ceiling on context entries; exceeding it means runaway chained
/// assignments (a derived-assignment cycle) and is fatal.
pub const STACK_DEPTH_CEILING: usize = 4096;

/// Hard ceiling on chaining fixpoint rounds per assignment; fatal.
pub const CHAIN_ROUND_CEILING: usize = 64;

/// One mutable stack entry wrapping a shared immutable `StaticRec`.
struct Assignment {
    rec: Arc<StaticRec>,
    /// The value actually applied (equals `rec.value`; kept separately so
    /// masking can restore predecessors without consulting the rec)
    applied: Value,
    masked: bool,
}

enum UndoOp {
    /// Restore `key` to `prior` (None = remove)
    Value { key: KeyId, prior: Option<Value> },
    /// Clear the mask flag set on `index`
    Mask { index: usize },
}

struct Frame {
    entry_len: usize,
    activation: u32,
    undo: Vec<UndoOp>,
}

/// Transition batch under construction during an activation cache miss.
struct PendingActivation {
    parent: u32,
    label: ChildKey,
    recs: Vec<Arc<StaticRec>>,
    deferred: Vec<DeferredAssignment>,
    deferred_keys: FxHashSet<KeyId>,
}

/// Adapter: re-resolves a property value against the applying context, used
/// for chained assignments whose value is dynamic.
struct PropertyValueEvaluator(PropertyValue);

impl DynamicProperty for PropertyValueEvaluator {
    fn evaluate(&self, context: &mut Context) -> Value {
        self.0.resolve(context)
    }
}

/// A context-dependent assignment stack over a shared `Meta` rule base.
pub struct Context {
    meta: Arc<Meta>,
    entries: Vec<Assignment>,
    frames: Vec<Frame>,
    values: FxHashMap<KeyId, Value>,
    activation: u32,
    pending: Option<PendingActivation>,
}

impl Context {
    pub(crate) fn new(meta: Arc<Meta>) -> Self {
        let root = meta.activations().root();
        Context {
            meta,
            entries: Vec::new(),
            frames: Vec::new(),
            values: FxHashMap::default(),
            activation: root,
            pending: None,
        }
    }

    /// Opens a new frame. Assignments made until the matching `pop()` are
    /// undone by it.
    pub fn push(&mut self) {
        self.frames.push(Frame {
            entry_len: self.entries.len(),
            activation: self.activation,
            undo: Vec::new(),
        });
    }

    /// Undoes every assignment made since the matching `push()`, restoring
    /// masked predecessors, the value map and the activation cursor.
    ///
    /// Panics if no frame is open; that is a caller bug, not a recoverable
    /// condition.
    pub fn pop(&mut self) {
        let frame = self
            .frames
            .pop()
            .unwrap_or_else(|| panic!("pop() on an empty context stack"));
        for op in frame.undo.into_iter().rev() {
            match op {
                UndoOp::Value { key, prior } => match prior {
                    Some(v) => {
                        self.values.insert(key, v);
                    }
                    None => {
                        self.values.remove(&key);
                    }
                },
                UndoOp::Mask { index } => {
                    // Entries above the boundary are dropped wholesale.
                    if index < frame.entry_len {
                        self.entries[index].masked = false;
                    }
                }
            }
        }
        self.entries.truncate(frame.entry_len);
        self.activation = frame.activation;
    }

    /// Asserts `key = value`, evaluating rules only on an activation cache
    /// miss. Values run through the key's registered transformer first.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let key = self.meta.context_key(key);
        let value = key.transform(value.into());
        self.assign_value(&key, value, false);
    }

    /// Union-style set: the incoming value unions with the key's current
    /// value (both viewed as lists) before assignment.
    pub fn merge(&mut self, key: &str, value: impl Into<Value>) {
        let key = self.meta.context_key(key);
        let incoming = key.transform(value.into());
        let merged = match self.values.get(&key.id()) {
            Some(existing) => existing.list_union(&incoming),
            None => incoming,
        };
        self.assign_value(&key, merged, false);
    }

    /// Total number of stack entries, masked ones included. A re-set of
    /// the current value is a no-op and leaves this unchanged.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of open frames.
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Snapshot of the effective assignments, by key name.
    pub fn values(&self) -> HashMap<String, Value> {
        let keys = self.meta.key_index();
        self.values
            .iter()
            .map(|(id, v)| (keys.get(*id).name().to_string(), v.clone()))
            .collect()
    }

    /// The effective value of one key, if assigned.
    pub fn value_for_key(&self, key: &str) -> Option<Value> {
        let key = self.meta.key_index().lookup(key)?;
        self.values.get(&key.id()).cloned()
    }

    /// True while `key` is being declared (legal-value enumeration mode).
    pub fn is_declaring(&self, key: &str) -> bool {
        self.values
            .get(&self.meta.builtin_keys().declare)
            .and_then(|v| v.as_str())
            .is_some_and(|declared| declared == key)
    }

    /// Fully resolved value of one property for the current context,
    /// consulting the property-scope side channel when a scope is active.
    pub fn property_for_key(&mut self, name: &str) -> Option<Value> {
        self.scoped_properties(|ctx, props| {
            props.get(name).cloned().map(|pv| pv.resolve(ctx))
        })
    }

    /// All effective properties, fully resolved, first-seen order.
    pub fn all_properties(&mut self) -> IndexMap<String, Value> {
        self.scoped_properties(|ctx, props| {
            let snapshot: Vec<(String, PropertyValue)> = props
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            snapshot
                .into_iter()
                .map(|(name, pv)| {
                    let resolved = pv.resolve(ctx);
                    (name, resolved)
                })
                .collect()
        })
    }

    // ------------------------------------------------------------------
    // Assignment machinery
    // ------------------------------------------------------------------

    fn assign_value(&mut self, key: &Arc<KeyData>, value: Value, chaining: bool) -> bool {
        let meta = Arc::clone(&self.meta);
        meta.note_value_referenced(key, &value);

        // Inside a miss batch, chained assignments fold into the pending
        // activation instead of extending the tree.
        if self.pending.is_some() {
            return self.apply_assignment(key, value, chaining);
        }

        let generation = meta.rule_store().generation();
        let node = meta.activations().get(self.activation);
        let label = ChildKey {
            key: key.id(),
            value: value.clone(),
            chaining,
        };

        // Cache hit: replay, no rule evaluation.
        if let Some(child) = self.fresh_child(&node, &label, generation) {
            meta.stats().note_activation_hit();
            self.apply_activation(&child);
            self.apply_deferred(&child);
            return !child.recs().is_empty();
        }

        // Miss: extend under the parent node's lock.
        meta.stats().note_activation_miss();
        let guard = node.lock_for_extend();
        if let Some(child) = self.fresh_child(&node, &label, generation) {
            // Another thread published while we waited for the lock.
            drop(guard);
            meta.stats().note_activation_hit();
            self.apply_activation(&child);
            self.apply_deferred(&child);
            return !child.recs().is_empty();
        }

        trace!(key = key.name(), value = %value, chaining, "activation miss");
        self.pending = Some(PendingActivation {
            parent: self.activation,
            label,
            recs: Vec::new(),
            deferred: Vec::new(),
            deferred_keys: FxHashSet::default(),
        });
        let changed = self.apply_assignment(key, value, chaining);
        if changed {
            self.run_chaining();
        }
        let pending = self.pending.take().expect("pending batch still open");
        let child_id = meta.activations().publish(
            pending.parent,
            pending.label,
            pending.recs,
            pending.deferred,
            generation,
        );
        drop(guard);
        self.activation = child_id;
        let child = meta.activations().get(child_id);
        self.apply_deferred(&child);
        changed
    }

    fn fresh_child(
        &self,
        node: &Arc<Activation>,
        label: &ChildKey,
        generation: u64,
    ) -> Option<Arc<Activation>> {
        let child_id = node.child_for(label)?;
        let child = self.meta.activations().get(child_id);
        (child.generation() == generation).then_some(child)
    }

    /// Applies one assignment to the live stack and appends its rec to the
    /// pending batch. Returns false for suppressed no-op reassignment.
    fn apply_assignment(&mut self, key: &Arc<KeyData>, value: Value, chaining: bool) -> bool {
        let meta = Arc::clone(&self.meta);

        if self.values.get(&key.id()) == Some(&value) {
            // Observed baseline for the scope-key reassignment ambiguity:
            // same-value reassignment is special only when the key is a
            // property-scope key that is not already the active scope.
            let refocus = key.is_property_scope()
                && self.current_scope_key().map(|k| k.id()) != Some(key.id());
            if !refocus {
                return false;
            }
        }

        if self.entries.len() >= STACK_DEPTH_CEILING {
            panic!(
                "context stack depth ceiling ({}) exceeded while asserting '{}': \
                 derived-assignment cycle",
                STACK_DEPTH_CEILING,
                key.name()
            );
        }

        let overridden = self.topmost_unmasked(key.id());
        let base_match = match overridden {
            Some(index) => {
                self.mask_override_descendants(index);
                self.rebuild_match_chain()
            }
            None => self.current_match(),
        };

        let match_result = matching::join(&meta, &base_match, key, &value);
        let rec = Arc::new(StaticRec {
            key: key.id(),
            value: value.clone(),
            rank: self.frames.len() as u32,
            chaining,
            overrides: overridden,
            match_result,
        });
        self.entries.push(Assignment {
            rec: Arc::clone(&rec),
            applied: value.clone(),
            masked: false,
        });
        self.record_value(key.id(), Some(value));
        if let Some(pending) = &mut self.pending {
            pending.recs.push(rec);
        }
        true
    }

    /// Replays a cached activation: masks overridden predecessors, pushes
    /// the cached recs, advances the cursor. No rule evaluation.
    fn apply_activation(&mut self, child: &Arc<Activation>) {
        assert_eq!(
            child.parent(),
            Some(self.activation),
            "cached activation replayed against a mismatched parent"
        );
        for rec in child.recs() {
            if rec.overrides.is_some() {
                let index = self.topmost_unmasked(rec.key).unwrap_or_else(|| {
                    panic!(
                        "missing assignment record for overridden key id {} during replay",
                        rec.key
                    )
                });
                debug_assert_eq!(Some(index), rec.overrides);
                self.mask_override_descendants(index);
            }
            self.entries.push(Assignment {
                rec: Arc::clone(rec),
                applied: rec.value.clone(),
                masked: false,
            });
            self.record_value(rec.key, Some(rec.value.clone()));
        }
        self.activation = child.id();
    }

    /// Wakes the activation's deferred (dynamic) assignments against this
    /// context. A deferred assignment whose resolved value no longer
    /// changes anything is skipped.
    fn apply_deferred(&mut self, child: &Arc<Activation>) {
        if child.deferred().is_empty() {
            return;
        }
        let meta = Arc::clone(&self.meta);
        // The deferred list is immutable on the shared node; clone the
        // evaluator handles so replays on this stack can extend the tree.
        let work: Vec<(KeyId, Arc<dyn DynamicProperty>)> = child
            .deferred()
            .iter()
            .map(|d| (d.key, Arc::clone(&d.evaluator)))
            .collect();
        for (key_id, evaluator) in work {
            let key = meta.key_index().get(key_id);
            let resolved = key.transform(evaluator.evaluate(self));
            if resolved.is_nil() {
                debug!(
                    key = key.name(),
                    "deferred assignment skipped: precondition no longer holds"
                );
                continue;
            }
            if self.values.get(&key_id) == Some(&resolved) {
                trace!(key = key.name(), "deferred assignment already satisfied");
                continue;
            }
            self.assign_value(&key, resolved, true);
        }
    }

    /// The chaining fixpoint: re-asserts context keys mirrored from
    /// properties the current batch brought into effect, until nothing
    /// changes. Only runs while a pending batch is open; concrete derived
    /// values become chained recs, dynamic ones become deferred
    /// assignments on the published activation.
    fn run_chaining(&mut self) {
        let meta = Arc::clone(&self.meta);
        let mirrors = meta.merger_registry().mirrored_properties();
        if mirrors.is_empty() {
            return;
        }
        for round in 0..=CHAIN_ROUND_CEILING {
            if round == CHAIN_ROUND_CEILING {
                panic!(
                    "chaining fixpoint exceeded {} rounds: derived-assignment cycle",
                    CHAIN_ROUND_CEILING
                );
            }
            let mut changed = false;
            let current = self.current_match();
            let props = matching::properties_for_match(&meta, &current);
            for (property, key_id) in &mirrors {
                let Some(pv) = props.get(property) else {
                    continue;
                };
                let key = meta.key_index().get(*key_id);
                if self.is_declaring(key.name()) {
                    continue;
                }
                match pv.concrete_view() {
                    Some(v) => {
                        if self.values.get(key_id) != Some(v) {
                            let transformed = key.transform(v.clone());
                            trace!(
                                key = key.name(),
                                value = %transformed,
                                from = property.as_str(),
                                "chained assignment"
                            );
                            if self.assign_value(&key, transformed, true) {
                                meta.stats().note_chained_assignment();
                                changed = true;
                            }
                        }
                    }
                    None => {
                        let pending = self.pending.as_mut().expect("chaining outside a batch");
                        if pending.deferred_keys.insert(*key_id) {
                            pending.deferred.push(DeferredAssignment {
                                key: *key_id,
                                evaluator: Arc::new(PropertyValueEvaluator(pv.clone())),
                            });
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Masking / undo
    // ------------------------------------------------------------------

    fn topmost_unmasked(&self, key: KeyId) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .find(|(_, e)| !e.masked && e.rec.key == key)
            .map(|(i, _)| i)
    }

    /// Masks the entry at `index` plus every entry whose override chain
    /// descends from it, undoing their values in the flat map.
    fn mask_override_descendants(&mut self, index: usize) {
        let mut masked: SmallVec<[usize; 4]> = SmallVec::new();
        masked.push(index);
        self.mask_entry(index);
        for j in index + 1..self.entries.len() {
            if self.entries[j].masked {
                continue;
            }
            if let Some(overridden) = self.entries[j].rec.overrides {
                if masked.contains(&overridden) {
                    masked.push(j);
                    self.mask_entry(j);
                }
            }
        }

        #[cfg(debug_assertions)]
        self.check_override_union(&masked);
    }

    fn mask_entry(&mut self, index: usize) {
        self.entries[index].masked = true;
        if let Some(frame) = self.frames.last_mut() {
            frame.undo.push(UndoOp::Mask { index });
        }
        let key = self.entries[index].rec.key;
        let replacement = self.entries[..index]
            .iter()
            .rev()
            .find(|e| !e.masked && e.rec.key == key)
            .map(|e| e.applied.clone());
        self.record_value(key, replacement);
    }

    /// Folds the just-masked assignments into a side "union override" match
    /// and checks it stays consistent with the surviving chain. Debug-only
    /// consistency check, never used for results.
    #[cfg(debug_assertions)]
    fn check_override_union(&self, masked: &[usize]) {
        let meta = Arc::clone(&self.meta);
        let mut union = self.rebuild_match_chain();
        let surviving_mask = union.mask();
        for index in masked {
            let entry = &self.entries[*index];
            let key = meta.key_index().get(entry.rec.key);
            union = matching::join(&meta, &union, &key, &entry.applied);
        }
        debug_assert_eq!(
            union.mask() & surviving_mask,
            surviving_mask,
            "override union lost keys from the surviving chain"
        );
    }

    fn record_value(&mut self, key: KeyId, new: Option<Value>) {
        let prior = match &new {
            Some(v) => self.values.insert(key, v.clone()),
            None => self.values.remove(&key),
        };
        if prior == new {
            return;
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.undo.push(UndoOp::Value { key, prior });
        }
    }

    /// Match of the topmost unmasked entry, or the root match.
    fn current_match(&self) -> Arc<MatchResult> {
        self.entries
            .iter()
            .rev()
            .find(|e| !e.masked)
            .map(|e| Arc::clone(&e.rec.match_result))
            .unwrap_or_else(|| self.meta.root_match())
    }

    /// Rebuilds the match chain over the unmasked entries in stack order.
    /// Intermediate entry matches may predate earlier overrides, so the
    /// rebuild conservatively starts at the root and re-joins (key, value)
    /// pairs; joins are cheap relative to stack depth.
    fn rebuild_match_chain(&self) -> Arc<MatchResult> {
        let meta = Arc::clone(&self.meta);
        let mut chain = meta.root_match();
        for entry in &self.entries {
            if entry.masked {
                continue;
            }
            let key = meta.key_index().get(entry.rec.key);
            chain = matching::join(&meta, &chain, &key, &entry.applied);
        }
        chain
    }

    // ------------------------------------------------------------------
    // Property-scope side channel
    // ------------------------------------------------------------------

    /// The property-scope key currently in focus: the topmost unmasked
    /// assignment of a key defined as a property scope.
    fn current_scope_key(&self) -> Option<Arc<KeyData>> {
        let keys = self.meta.key_index();
        self.entries
            .iter()
            .rev()
            .filter(|e| !e.masked)
            .map(|e| keys.get(e.rec.key))
            .find(|k| k.is_property_scope())
    }

    /// Runs `f` with the effective property map: the raw current match
    /// when no scope key is active, otherwise the side "property
    /// activation" obtained by (virtually or physically) applying the
    /// scope marker on top of the current state.
    fn scoped_properties<R>(&mut self, f: impl FnOnce(&mut Self, &PropertyMap) -> R) -> R {
        let meta = Arc::clone(&self.meta);
        let Some(scope) = self.current_scope_key() else {
            let current = self.current_match();
            let props = matching::properties_for_match(&meta, &current);
            return f(self, &props);
        };

        let node = meta.activations().get(self.activation);
        let generation = meta.rule_store().generation();

        // Fast path: a cached, fully static side activation lets reads
        // skip the stack entirely.
        if let Some(side_id) = node.cached_property_activation() {
            let side = meta.activations().get(side_id);
            if side.generation() == generation
                && side.parent() == Some(node.id())
                && side.deferred().is_empty()
            {
                if let Some(last) = side.recs().last() {
                    let props = matching::properties_for_match(&meta, &last.match_result);
                    if props.values().all(|pv| !pv.is_dynamic()) {
                        return f(self, &props);
                    }
                }
            }
        }

        // Slow path: physically apply the scope marker inside a frame so
        // deferred and dynamic values evaluate against the live context,
        // then cache the side activation for future fast-path reads.
        let marker = meta.key_index().get(meta.builtin_keys().scope);
        self.push();
        self.assign_value(&marker, Value::str(scope.name()), false);
        node.cache_property_activation(self.activation);
        let current = self.current_match();
        let props = matching::properties_for_match(&meta, &current);
        let result = f(self, &props);
        self.pop();
        result
    }
}

#[cfg(test)]
mod tests;
