//! The engine façade: one `Meta` owns the rule base, the key index, the
//! merge-policy registry, the shared activation tree and the global
//! property cache. Many `Context` instances (one per logical session) read
//! and extend the same `Meta` concurrently.
//!
//! Rule ingestion is explicitly batched: `begin_rule_set` hands out an
//! owned builder, rules buffer inside it, and `end_rule_set` publishes the
//! whole batch atomically under the update lock, then bumps the generation
//! counter so every dependent cache transparently recomputes. The builder
//! handle makes the single-writer invariant part of the API instead of
//! hidden state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::debug;

use super::activation::ActivationArena;
use super::context::Context;
use super::error::MetaError;
use super::keys::{KeyData, KeyIndex, KeyInitObserver, ValueTransformer};
use super::matching::{MatchResult, PropertyCacheKey};
use super::properties::{MergerRegistry, PropertyMap, PropertyMerger};
use super::rules::{BuiltinKeys, RuleId, RuleSetId, RuleStore, Selector};
use super::value::Value;

/// Synthetic key carrying the active property scope during side-channel
/// property reads.
pub const SCOPE_KEY: &str = "scopeKey";

/// Key whose assignment switches evaluation into declare mode (legal-value
/// enumeration).
pub const DECLARE_KEY: &str = "declare";

/// Engine counters, cheap atomics. Useful for cache-behavior assertions in
/// tests and for the benches.
#[derive(Default)]
pub struct MatchStats {
    activation_hits: AtomicU64,
    activation_misses: AtomicU64,
    matches_computed: AtomicU64,
    property_cache_hits: AtomicU64,
    properties_computed: AtomicU64,
    chained_assignments: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub activation_hits: u64,
    pub activation_misses: u64,
    pub matches_computed: u64,
    pub property_cache_hits: u64,
    pub properties_computed: u64,
    pub chained_assignments: u64,
}

impl MatchStats {
    pub(crate) fn note_activation_hit(&self) {
        self.activation_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_activation_miss(&self) {
        self.activation_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_match_computed(&self) {
        self.matches_computed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_property_cache_hit(&self) {
        self.property_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_property_computed(&self) {
        self.properties_computed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_chained_assignment(&self) {
        self.chained_assignments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            activation_hits: self.activation_hits.load(Ordering::Relaxed),
            activation_misses: self.activation_misses.load(Ordering::Relaxed),
            matches_computed: self.matches_computed.load(Ordering::Relaxed),
            property_cache_hits: self.property_cache_hits.load(Ordering::Relaxed),
            properties_computed: self.properties_computed.load(Ordering::Relaxed),
            chained_assignments: self.chained_assignments.load(Ordering::Relaxed),
        }
    }
}

struct PendingRule {
    selectors: Vec<Selector>,
    properties: PropertyMap,
    rank: i32,
}

/// Owned handle for one rule-set load. Rules buffer here and publish
/// atomically in `Meta::end_rule_set`.
pub struct RuleSetBuilder {
    source: String,
    rank_base: i32,
    rules: Vec<PendingRule>,
    error: Option<String>,
}

impl RuleSetBuilder {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Buffers one rule. `rank` is relative to the builder's rank base.
    pub fn add_rule(
        &mut self,
        selectors: Vec<Selector>,
        properties: PropertyMap,
        rank: i32,
    ) -> &mut Self {
        self.rules.push(PendingRule {
            selectors,
            properties,
            rank: self.rank_base + rank,
        });
        self
    }

    /// Records a load failure (e.g. from an external rule-file parser).
    /// `end_rule_set` will disable the whole batch and surface the error.
    pub fn record_error(&mut self, reason: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(reason.into());
        }
    }
}

/// The shared rule-resolution engine.
pub struct Meta {
    keys: KeyIndex,
    rules: RuleStore,
    mergers: MergerRegistry,
    activations: ActivationArena,
    property_cache: DashMap<PropertyCacheKey, Arc<PropertyMap>>,
    root_match: Mutex<Option<Arc<MatchResult>>>,
    /// Serializes rule-base mutation and first-use observer dispatch.
    /// Reentrant so an observer may register rules while it is held.
    update_lock: ReentrantMutex<()>,
    builtins: BuiltinKeys,
    stats: MatchStats,
}

impl Meta {
    pub fn new() -> Arc<Meta> {
        let keys = KeyIndex::new();
        let scope = keys
            .intern(SCOPE_KEY)
            .expect("fresh index has room for built-in keys");
        let declare = keys
            .intern(DECLARE_KEY)
            .expect("fresh index has room for built-in keys");
        let builtins = BuiltinKeys {
            scope: scope.id(),
            declare: declare.id(),
        };
        Arc::new(Meta {
            keys,
            rules: RuleStore::new(),
            mergers: MergerRegistry::new(),
            activations: ActivationArena::new(),
            property_cache: DashMap::new(),
            root_match: Mutex::new(None),
            update_lock: ReentrantMutex::new(()),
            builtins,
            stats: MatchStats::default(),
        })
    }

    /// Creates a fresh assignment stack over this rule base.
    pub fn new_context(self: &Arc<Self>) -> Context {
        Context::new(Arc::clone(self))
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Opens a rule-set load. Ranks passed to `add_rule` are relative to
    /// `rank_base`, so a whole file can be re-ranked by its load origin.
    pub fn begin_rule_set(&self, rank_base: i32, source: &str) -> RuleSetBuilder {
        RuleSetBuilder {
            source: source.to_string(),
            rank_base,
            rules: Vec::new(),
            error: None,
        }
    }

    /// Publishes the builder's rules atomically and bumps the generation.
    /// On failure the partially-added batch is disabled and the rest of
    /// the rule base stays intact.
    pub fn end_rule_set(&self, builder: RuleSetBuilder) -> Result<RuleSetId, MetaError> {
        let _guard = self.update_lock.lock();
        let set_id = self.rules.open_rule_set(&builder.source);
        let mut failure = builder.error;
        if failure.is_none() {
            for pending in builder.rules {
                if let Err(err) = self.rules.register(
                    &self.keys,
                    &self.mergers,
                    self.builtins,
                    &pending.selectors,
                    pending.properties,
                    pending.rank,
                    set_id,
                ) {
                    failure = Some(err.to_string());
                    break;
                }
            }
        }
        self.rules.seal_rule_set(set_id);
        if let Some(reason) = failure {
            self.rules.disable_rule_set(set_id);
            self.rules.bump_generation();
            return Err(MetaError::RuleLoad {
                source: builder.source,
                reason,
            });
        }
        let generation = self.rules.bump_generation();
        debug!(
            source = builder.source.as_str(),
            rule_set = set_id,
            generation,
            "rule set published"
        );
        Ok(set_id)
    }

    /// Disables every rule of a published set (reload support). Dependent
    /// caches recompute on next use via the generation bump.
    pub fn disable_rule_set(&self, id: RuleSetId) {
        let _guard = self.update_lock.lock();
        self.rules.disable_rule_set(id);
        self.rules.bump_generation();
    }

    /// Disables one rule.
    pub fn disable_rule(&self, id: RuleId) {
        let _guard = self.update_lock.lock();
        self.rules.rule(id).disable();
        self.rules.bump_generation();
    }

    /// Current rule-base generation; advances on every mutation batch.
    pub fn generation(&self) -> u64 {
        self.rules.generation()
    }

    // ------------------------------------------------------------------
    // Extension points
    // ------------------------------------------------------------------

    /// Registers the merge policy for one property name.
    pub fn register_property_merger(&self, property: &str, merger: Arc<dyn PropertyMerger>) {
        self.mergers.register(property, merger);
    }

    /// Whenever merging changes `property`, re-assert `key` with its value
    /// (chaining).
    pub fn mirror_property_to_context(&self, property: &str, key: &str) -> Result<(), MetaError> {
        let key = self.keys.intern(key)?;
        self.mergers.set_mirror(property, key.id());
        Ok(())
    }

    /// Marks `key` as a property scope: its latest assignment determines
    /// whose properties are being computed. Define scopes before loading
    /// the rules that target them; the scope selector is added at rule
    /// registration.
    pub fn define_key_as_property_scope(&self, key: &str) -> Result<(), MetaError> {
        let key = self.keys.intern(key)?;
        key.set_property_scope();
        Ok(())
    }

    /// Registers a one-time observer for first references to values of
    /// `key` (used to lazily load rules).
    pub fn register_key_init_observer(
        &self,
        key: &str,
        observer: Arc<dyn KeyInitObserver>,
    ) -> Result<(), MetaError> {
        let key = self.keys.intern(key)?;
        key.add_observer(observer);
        Ok(())
    }

    /// Registers a value transformer applied on every assignment of `key`.
    pub fn register_value_transformer_for_key(
        &self,
        key: &str,
        transformer: Arc<dyn ValueTransformer>,
    ) -> Result<(), MetaError> {
        let key = self.keys.intern(key)?;
        key.set_transformer(transformer);
        Ok(())
    }

    /// Declares `parent` as the inherited value of `value` for `key`:
    /// rules targeting the parent also match the child.
    pub fn set_parent_value(
        &self,
        key: &str,
        value: impl Into<Value>,
        parent: impl Into<Value>,
    ) -> Result<(), MetaError> {
        let key = self.keys.intern(key)?;
        key.set_parent_value(value.into(), parent.into());
        Ok(())
    }

    pub fn stats(&self) -> &MatchStats {
        &self.stats
    }

    // ------------------------------------------------------------------
    // Crate-internal plumbing
    // ------------------------------------------------------------------

    pub(crate) fn key_index(&self) -> &KeyIndex {
        &self.keys
    }

    pub(crate) fn rule_store(&self) -> &RuleStore {
        &self.rules
    }

    pub(crate) fn merger_registry(&self) -> &MergerRegistry {
        &self.mergers
    }

    pub(crate) fn activations(&self) -> &ActivationArena {
        &self.activations
    }

    pub(crate) fn property_cache(&self) -> &DashMap<PropertyCacheKey, Arc<PropertyMap>> {
        &self.property_cache
    }

    pub(crate) fn builtin_keys(&self) -> BuiltinKeys {
        self.builtins
    }

    /// Interns a key on the assignment path. The 64-key ceiling is a
    /// capacity invariant of the mask algebra; blowing it mid-session is a
    /// caller bug, so this fails fast.
    pub(crate) fn context_key(&self, name: &str) -> Arc<KeyData> {
        self.keys
            .intern(name)
            .unwrap_or_else(|err| panic!("{}", err))
    }

    /// The empty-path match, shared by every context of this instance.
    pub(crate) fn root_match(&self) -> Arc<MatchResult> {
        let mut slot = self.root_match.lock();
        if let Some(existing) = &*slot {
            return Arc::clone(existing);
        }
        let root = MatchResult::root(self);
        *slot = Some(Arc::clone(&root));
        root
    }

    /// First-reference observer dispatch, double-checked under the update
    /// lock so observers fire exactly once per (key, value).
    pub(crate) fn note_value_referenced(&self, key: &Arc<KeyData>, value: &Value) {
        if key.value_known(value) {
            return;
        }
        let _guard = self.update_lock.lock();
        if let Some(observers) = key.mark_seen(value) {
            for observer in observers {
                observer.value_seen(self, key.name(), value);
            }
        }
    }
}
