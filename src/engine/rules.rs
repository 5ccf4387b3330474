//! Rule storage: selectors, normalization, bitmasks and the append-only
//! rule array.
//!
//! Rules are published in batches (rule sets) and never mutated afterwards,
//! with one exception: disabling a rule stores the `RANK_DISABLED` sentinel
//! into its atomic rank, which every match and merge path skips. Ids are
//! never reused while matches may reference them; staleness is signalled by
//! the store's monotonically increasing generation counter instead.
//!
//! `register` performs the add-time rewrites:
//! - repeated concrete selectors on one key collapse into a single
//!   list-valued selector;
//! - a declare-marked last selector splits out a synthetic declare rule
//!   (selector `declare=<key>`, property `<key>: <value>`) used to
//!   enumerate the legal values of a key;
//! - a rule whose last selector targets a property-scope key gets a
//!   synthetic `scopeKey=<key name>` selector appended, so the rule only
//!   contributes while that key is the active property scope;
//! - one selector is picked as the *indexed* selector by a selectivity
//!   heuristic and added to the key's posting lists. The choice is pure
//!   pruning: `properties_for_match` re-verifies every candidate against
//!   the path's actual values, so results do not depend on it.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::debug;

use super::error::MetaError;
use super::hash::FxHashMap;
use super::keys::{key_bit, KeyId, KeyIndex};
use super::properties::{MergeDeclareList, MergerRegistry, PropertyMap, PropertyValue};
use super::value::Value;

pub type RuleId = u32;
pub type RuleSetId = u32;

/// Rank sentinel for disabled rules; skipped by matching and merging.
pub const RANK_DISABLED: i32 = i32::MIN;

/// Selector constraint against one context key.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectorValue {
    /// Key must be assigned, any value (`key=*`)
    Any,
    /// Key must be assigned a matching value (directly or via value parents)
    Is(Value),
    /// Key must match one of the listed values
    In(Vec<Value>),
    /// Key must NOT match the value; an unassigned key satisfies this
    Not(Value),
}

/// One (key, constraint) pair of a rule's selector list, as supplied by the
/// caller. Keys are plain names here; they resolve to dense ids at
/// registration.
#[derive(Debug, Clone)]
pub struct Selector {
    pub key: String,
    pub value: SelectorValue,
    /// Marks a declaration: the rule both matches `key=value` and declares
    /// `value` as a legal value of `key` (see the declare-rule split).
    pub declare: bool,
}

impl Selector {
    pub fn is(key: impl Into<String>, value: impl Into<Value>) -> Selector {
        Selector {
            key: key.into(),
            value: SelectorValue::Is(value.into()),
            declare: false,
        }
    }

    pub fn any(key: impl Into<String>) -> Selector {
        Selector {
            key: key.into(),
            value: SelectorValue::Any,
            declare: false,
        }
    }

    pub fn not(key: impl Into<String>, value: impl Into<Value>) -> Selector {
        Selector {
            key: key.into(),
            value: SelectorValue::Not(value.into()),
            declare: false,
        }
    }

    pub fn one_of(key: impl Into<String>, values: Vec<Value>) -> Selector {
        Selector {
            key: key.into(),
            value: SelectorValue::In(values),
            declare: false,
        }
    }

    pub fn declare(key: impl Into<String>, value: impl Into<Value>) -> Selector {
        Selector {
            key: key.into(),
            value: SelectorValue::Is(value.into()),
            declare: true,
        }
    }
}

/// Selector with its key resolved to a dense id.
#[derive(Debug, Clone)]
pub struct ResolvedSelector {
    pub key: KeyId,
    pub value: SelectorValue,
}

/// An immutable published rule.
pub struct Rule {
    id: RuleId,
    selectors: SmallVec<[ResolvedSelector; 4]>,
    properties: Arc<PropertyMap>,
    rank: AtomicI32,
    /// Keys constrained by Any/Is/In selectors (must be assigned in a path)
    matched_mask: u64,
    /// Keys constrained by Not selectors (assignment not required)
    anti_mask: u64,
    /// Key chosen by the selectivity heuristic (zero for unindexed rules)
    indexed_mask: u64,
    rule_set: RuleSetId,
}

impl Rule {
    pub fn id(&self) -> RuleId {
        self.id
    }

    pub fn rank(&self) -> i32 {
        self.rank.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.rank() != RANK_DISABLED
    }

    pub(crate) fn disable(&self) {
        self.rank.store(RANK_DISABLED, Ordering::Release);
    }

    pub fn selectors(&self) -> &[ResolvedSelector] {
        &self.selectors
    }

    pub fn properties(&self) -> &Arc<PropertyMap> {
        &self.properties
    }

    pub fn matched_mask(&self) -> u64 {
        self.matched_mask
    }

    pub fn anti_mask(&self) -> u64 {
        self.anti_mask
    }

    pub fn indexed_mask(&self) -> u64 {
        self.indexed_mask
    }

    pub fn rule_set(&self) -> RuleSetId {
        self.rule_set
    }

    /// Full selector verification against the path's actual assignments.
    /// This is the correctness backstop behind the posting index and the
    /// mask algebra, which only prune.
    pub(crate) fn matches_path(
        &self,
        keys: &KeyIndex,
        path_values: &FxHashMap<KeyId, Value>,
    ) -> bool {
        for selector in &self.selectors {
            let assigned = path_values.get(&selector.key);
            let key = keys.get(selector.key);
            let ok = match &selector.value {
                SelectorValue::Any => assigned.is_some(),
                SelectorValue::Is(expected) => {
                    assigned.is_some_and(|v| key.value_matches(v, expected))
                }
                SelectorValue::In(options) => assigned
                    .is_some_and(|v| options.iter().any(|expected| key.value_matches(v, expected))),
                SelectorValue::Not(expected) => {
                    !assigned.is_some_and(|v| key.value_matches(v, expected))
                }
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

/// A batch of rules sharing a load origin.
pub struct RuleSet {
    id: RuleSetId,
    source: String,
    /// Id range [start, end) finalized at publication
    start: RuleId,
    end: RuleId,
    disabled: AtomicBool,
}

impl RuleSet {
    pub fn id(&self) -> RuleSetId {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn rule_ids(&self) -> std::ops::Range<RuleId> {
        self.start..self.end
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }
}

/// Built-in key ids threaded through registration rewrites.
#[derive(Clone, Copy)]
pub(crate) struct BuiltinKeys {
    /// The synthetic scope-marker key (`scopeKey`)
    pub scope: KeyId,
    /// The declare-mode key (`declare`)
    pub declare: KeyId,
}

/// Append-only rule array plus rule-set bookkeeping and the generation
/// counter every cache validates against.
pub struct RuleStore {
    rules: RwLock<Vec<Arc<Rule>>>,
    rule_sets: RwLock<Vec<Arc<RuleSet>>>,
    /// Rules with no indexable selector; they seed every root match.
    unindexed: RwLock<Vec<RuleId>>,
    generation: AtomicU64,
}

impl RuleStore {
    pub fn new() -> Self {
        RuleStore {
            rules: RwLock::new(Vec::new()),
            rule_sets: RwLock::new(Vec::new()),
            unindexed: RwLock::new(Vec::new()),
            generation: AtomicU64::new(1),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn rule(&self, id: RuleId) -> Arc<Rule> {
        Arc::clone(&self.rules.read()[id as usize])
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    pub fn rule_set(&self, id: RuleSetId) -> Arc<RuleSet> {
        Arc::clone(&self.rule_sets.read()[id as usize])
    }

    /// Sorted snapshot of the always-candidate rules (no indexable
    /// selector).
    pub(crate) fn unindexed_snapshot(&self) -> Vec<RuleId> {
        self.unindexed.read().clone()
    }

    pub(crate) fn open_rule_set(&self, source: &str) -> RuleSetId {
        let mut sets = self.rule_sets.write();
        let id = sets.len() as RuleSetId;
        let next_rule = self.rules.read().len() as RuleId;
        sets.push(Arc::new(RuleSet {
            id,
            source: source.to_string(),
            start: next_rule,
            end: next_rule,
            disabled: AtomicBool::new(false),
        }));
        id
    }

    pub(crate) fn seal_rule_set(&self, id: RuleSetId) {
        let mut sets = self.rule_sets.write();
        let end = self.rules.read().len() as RuleId;
        let sealed = &sets[id as usize];
        let replacement = Arc::new(RuleSet {
            id,
            source: sealed.source.clone(),
            start: sealed.start,
            end,
            disabled: AtomicBool::new(sealed.is_disabled()),
        });
        sets[id as usize] = replacement;
    }

    /// Disables every rule of `set_id`. The caller bumps the generation.
    pub(crate) fn disable_rule_set(&self, set_id: RuleSetId) {
        let set = self.rule_set(set_id);
        set.disabled.store(true, Ordering::Release);
        let rules = self.rules.read();
        for id in set.rule_ids() {
            rules[id as usize].disable();
        }
        debug!(
            rule_set = set_id,
            rules = set.rule_ids().len(),
            "rule set disabled"
        );
    }

    /// Registers one caller-supplied rule, applying the add-time rewrites.
    /// Returns the published ids (the rule itself, plus a synthetic declare
    /// rule when the last selector is declare-marked).
    pub(crate) fn register(
        &self,
        keys: &KeyIndex,
        registry: &MergerRegistry,
        builtins: BuiltinKeys,
        selectors: &[Selector],
        properties: PropertyMap,
        rank: i32,
        rule_set: RuleSetId,
    ) -> Result<SmallVec<[RuleId; 2]>, MetaError> {
        if selectors.is_empty() {
            return Err(MetaError::InvalidSelector(
                "a rule needs at least one selector".to_string(),
            ));
        }

        let mut published: SmallVec<[RuleId; 2]> = SmallVec::new();

        // Declare split: the last selector both matches normally and
        // declares its value as legal for its key.
        let last = selectors.last().expect("checked non-empty");
        if last.declare {
            let declared_key = keys.intern(&last.key)?;
            let declared_value = match &last.value {
                SelectorValue::Is(v) => v.clone(),
                other => {
                    return Err(MetaError::InvalidSelector(format!(
                        "declare selector on '{}' must carry an exact value, got {:?}",
                        last.key, other
                    )))
                }
            };
            let mut decl_selectors: Vec<ResolvedSelector> = Vec::new();
            for sel in &selectors[..selectors.len() - 1] {
                decl_selectors.push(ResolvedSelector {
                    key: keys.intern(&sel.key)?.id(),
                    value: sel.value.clone(),
                });
            }
            decl_selectors.push(ResolvedSelector {
                key: builtins.declare,
                value: SelectorValue::Is(Value::str(declared_key.name())),
            });
            let mut decl_props = PropertyMap::new();
            decl_props.insert(
                declared_key.name().to_string(),
                PropertyValue::Concrete(declared_value),
            );
            // Declared values accumulate while enumerating; plain overwrite
            // otherwise.
            registry.register_default(declared_key.name(), Arc::new(MergeDeclareList));
            published.push(self.publish(keys, decl_selectors, decl_props, rank, rule_set));
        }

        // Normalize: collapse repeated concrete selectors per key into one
        // aliased (list-valued) selector; negations stay as-is.
        let mut resolved: Vec<ResolvedSelector> = Vec::new();
        for sel in selectors {
            let key = keys.intern(&sel.key)?;
            match &sel.value {
                SelectorValue::Is(_) | SelectorValue::In(_) | SelectorValue::Any => {
                    let incoming: Option<Vec<Value>> = match &sel.value {
                        SelectorValue::Is(v) => Some(vec![v.clone()]),
                        SelectorValue::In(vs) => Some(vs.clone()),
                        _ => None,
                    };
                    if let Some(existing) = resolved.iter_mut().find(|r| {
                        r.key == key.id()
                            && !matches!(r.value, SelectorValue::Not(_))
                    }) {
                        match (&mut existing.value, incoming) {
                            (SelectorValue::Any, Some(vs)) => {
                                existing.value = SelectorValue::In(vs);
                            }
                            (SelectorValue::Any, None) => {}
                            (_, None) => {}
                            (SelectorValue::Is(old), Some(vs)) => {
                                let mut all = vec![old.clone()];
                                for v in vs {
                                    if !all.contains(&v) {
                                        all.push(v);
                                    }
                                }
                                existing.value = SelectorValue::In(all);
                            }
                            (SelectorValue::In(old), Some(vs)) => {
                                for v in vs {
                                    if !old.contains(&v) {
                                        old.push(v);
                                    }
                                }
                            }
                            (SelectorValue::Not(_), _) => unreachable!(),
                        }
                    } else {
                        resolved.push(ResolvedSelector {
                            key: key.id(),
                            value: sel.value.clone(),
                        });
                    }
                }
                SelectorValue::Not(_) => {
                    resolved.push(ResolvedSelector {
                        key: key.id(),
                        value: sel.value.clone(),
                    });
                }
            }
        }

        // Scope augmentation: a rule targeting a property-scope key only
        // contributes while that key is the active scope.
        if let Some(last) = resolved.last() {
            let last_key = keys.get(last.key);
            if last_key.is_property_scope()
                && !matches!(last.value, SelectorValue::Not(_))
                && !resolved.iter().any(|r| r.key == builtins.scope)
            {
                resolved.push(ResolvedSelector {
                    key: builtins.scope,
                    value: SelectorValue::Is(Value::str(last_key.name())),
                });
            }
        }

        published.push(self.publish(keys, resolved, properties, rank, rule_set));
        Ok(published)
    }

    fn publish(
        &self,
        keys: &KeyIndex,
        selectors: Vec<ResolvedSelector>,
        properties: PropertyMap,
        rank: i32,
        rule_set: RuleSetId,
    ) -> RuleId {
        let mut matched_mask = 0u64;
        let mut anti_mask = 0u64;
        for sel in &selectors {
            match sel.value {
                SelectorValue::Not(_) => anti_mask |= key_bit(sel.key),
                _ => matched_mask |= key_bit(sel.key),
            }
        }

        let indexed = best_selector_to_index(keys, &selectors);

        let mut rules = self.rules.write();
        let id = rules.len() as RuleId;

        let indexed_mask = match indexed {
            Some(pos) => {
                let sel = &selectors[pos];
                let key = keys.get(sel.key);
                match &sel.value {
                    SelectorValue::Is(v) => key.add_posting(v, id),
                    SelectorValue::In(vs) => {
                        for v in vs {
                            key.add_posting(v, id);
                        }
                    }
                    _ => unreachable!("heuristic only picks concrete selectors"),
                }
                key.mask()
            }
            None => {
                self.unindexed.write().push(id);
                0
            }
        };

        rules.push(Arc::new(Rule {
            id,
            selectors: selectors.into(),
            properties: Arc::new(properties),
            rank: AtomicI32::new(rank),
            matched_mask,
            anti_mask,
            indexed_mask,
            rule_set,
        }));
        id
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Selectivity heuristic: prefer concrete over wildcard/negated selectors,
/// property-scope keys, and later (more specific) position. Pruning only;
/// no correctness dependency.
fn best_selector_to_index(keys: &KeyIndex, selectors: &[ResolvedSelector]) -> Option<usize> {
    let mut best: Option<(i32, usize)> = None;
    for (pos, sel) in selectors.iter().enumerate() {
        let concrete = match &sel.value {
            SelectorValue::Is(_) => true,
            SelectorValue::In(vs) => !vs.is_empty(),
            _ => false,
        };
        if !concrete {
            continue;
        }
        let mut score = 2;
        if keys.get(sel.key).is_property_scope() {
            score += 3;
        }
        match best {
            Some((best_score, _)) if best_score > score => {}
            // `>=` on position: later selectors win ties.
            _ => best = Some((score, pos)),
        }
    }
    best.map(|(_, pos)| pos)
}
