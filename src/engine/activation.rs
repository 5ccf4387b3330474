//! The process-wide Activation tree: cached, replayable assignment
//! transitions shared by every context.
//!
//! An Activation records what happens on top of its parent when one
//! (key, value) is asserted: the ordered `StaticRec`s created by the
//! assignment, including chained, derived ones, plus any deferred
//! (dynamic) assignments that can only resolve against a live context.
//! Once published a node is immutable; the only mutable pieces are the
//! child lookup map, the per-node extend lock serializing cache-miss
//! creation under it, and the lazily cached side "property activation" id.
//!
//! Nodes live in a grow-only arena and reference each other by integer id,
//! never by owning pointers; children are discovered through the lookup
//! map, parents through an id back-reference. A generation bump of the
//! rule store makes existing nodes stale; stale children are rebuilt on
//! next traversal and the replacement wins the map slot, leaving the old
//! subtree unreachable (the arena never shrinks, by design).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::keys::KeyId;
use super::matching::MatchResult;
use super::properties::DynamicProperty;
use super::value::Value;

pub type ActivationId = u32;

/// Immutable per-assignment fact, shared between the activation cache and
/// every context entry stack that replays it.
pub struct StaticRec {
    pub key: KeyId,
    pub value: Value,
    /// Push depth of the owning context when the rec was created
    pub rank: u32,
    /// True for assignments asserted by the chaining fixpoint
    pub chaining: bool,
    /// Entry-stack index of the assignment this one overrides. Stack shapes
    /// are deterministic per path, so the index is valid on every replay.
    pub overrides: Option<usize>,
    pub match_result: Arc<MatchResult>,
}

/// A chained assignment whose value is dynamic: it must be evaluated
/// against the live context each time the activation is (re)applied.
pub struct DeferredAssignment {
    pub key: KeyId,
    pub evaluator: Arc<dyn DynamicProperty>,
}

/// Child lookup key: the transition label.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct ChildKey {
    pub key: KeyId,
    pub value: Value,
    pub chaining: bool,
}

pub struct Activation {
    id: ActivationId,
    parent: Option<ActivationId>,
    recs: Vec<Arc<StaticRec>>,
    deferred: Vec<DeferredAssignment>,
    /// Rule-store generation the recs were computed against
    generation: u64,
    children: DashMap<ChildKey, ActivationId>,
    /// Serializes cache-miss extension under this node
    extend_lock: Mutex<()>,
    /// Lazily cached side activation for property-scope reads
    property_activation: Mutex<Option<ActivationId>>,
}

impl Activation {
    pub fn id(&self) -> ActivationId {
        self.id
    }

    pub fn parent(&self) -> Option<ActivationId> {
        self.parent
    }

    pub fn recs(&self) -> &[Arc<StaticRec>] {
        &self.recs
    }

    pub fn deferred(&self) -> &[DeferredAssignment] {
        &self.deferred
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn child_for(&self, key: &ChildKey) -> Option<ActivationId> {
        self.children.get(key).map(|id| *id)
    }

    pub(crate) fn lock_for_extend(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.extend_lock.lock()
    }

    pub(crate) fn cached_property_activation(&self) -> Option<ActivationId> {
        *self.property_activation.lock()
    }

    pub(crate) fn cache_property_activation(&self, id: ActivationId) {
        *self.property_activation.lock() = Some(id);
    }
}

/// Grow-only arena of activation nodes. Id 0 is the root.
pub struct ActivationArena {
    nodes: RwLock<Vec<Arc<Activation>>>,
}

impl ActivationArena {
    pub fn new() -> Self {
        let root = Arc::new(Activation {
            id: 0,
            parent: None,
            recs: Vec::new(),
            deferred: Vec::new(),
            generation: 0,
            children: DashMap::new(),
            extend_lock: Mutex::new(()),
            property_activation: Mutex::new(None),
        });
        ActivationArena {
            nodes: RwLock::new(vec![root]),
        }
    }

    pub fn root(&self) -> ActivationId {
        0
    }

    pub fn get(&self, id: ActivationId) -> Arc<Activation> {
        Arc::clone(&self.nodes.read()[id as usize])
    }

    /// Number of published nodes (including the root).
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Publishes a new child under `parent`, replacing any stale entry for
    /// the same label. Callers hold the parent's extend lock, so the
    /// insert is race-free within the engine; a racing external reader
    /// either sees the old (equivalent or stale) child or the new one.
    pub(crate) fn publish(
        &self,
        parent: ActivationId,
        label: ChildKey,
        recs: Vec<Arc<StaticRec>>,
        deferred: Vec<DeferredAssignment>,
        generation: u64,
    ) -> ActivationId {
        let node = {
            let mut nodes = self.nodes.write();
            let id = nodes.len() as ActivationId;
            let node = Arc::new(Activation {
                id,
                parent: Some(parent),
                recs,
                deferred,
                generation,
                children: DashMap::new(),
                extend_lock: Mutex::new(()),
                property_activation: Mutex::new(None),
            });
            nodes.push(Arc::clone(&node));
            node
        };
        self.get(parent).children.insert(label, node.id);
        node.id
    }
}

impl Default for ActivationArena {
    fn default() -> Self {
        Self::new()
    }
}
