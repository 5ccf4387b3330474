//! Property values and the pluggable per-property merge framework.
//!
//! Each property name resolves through a merge policy when several matched
//! rules contribute to it. The built-in policies form a small closed set
//! (overwrite, boolean-AND, list-union, declare-list, trait-union); hosts
//! can register custom `PropertyMerger` implementations per property name.
//!
//! Values come in three flavors: concrete, dynamic (re-evaluated against
//! the reading context every time) and statically-resolvable (evaluated
//! once, then frozen). A merge touching a dynamic operand is deferred into
//! a lazy `DeferredMerge` node unless the policy declares itself
//! dynamic-aware, so policies that only understand concrete values never
//! see an unevaluated operand.

use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use indexmap::IndexMap;

use super::context::Context;
use super::keys::KeyId;
use super::value::Value;

/// Merged properties for one match path, first-seen order preserved.
pub type PropertyMap = IndexMap<String, PropertyValue>;

/// A property value that must be evaluated against a live context.
pub trait DynamicProperty: Send + Sync {
    fn evaluate(&self, context: &mut Context) -> Value;
}

/// Statically-resolvable wrapper: evaluated once on first read, losing
/// context sensitivity from then on.
#[derive(Clone)]
pub struct StaticHold {
    evaluator: Arc<dyn DynamicProperty>,
    resolved: Arc<OnceLock<Value>>,
}

/// A merge whose operands were not all concrete at fold time; resolved on
/// demand against the reading context.
pub struct DeferredMerge {
    merger: Arc<dyn PropertyMerger>,
    old: PropertyValue,
    new: PropertyValue,
    declare: bool,
}

#[derive(Clone)]
pub enum PropertyValue {
    Concrete(Value),
    Dynamic(Arc<dyn DynamicProperty>),
    StaticallyResolvable(StaticHold),
    Deferred(Arc<DeferredMerge>),
}

impl PropertyValue {
    pub fn dynamic(evaluator: Arc<dyn DynamicProperty>) -> Self {
        PropertyValue::Dynamic(evaluator)
    }

    pub fn statically_resolvable(evaluator: Arc<dyn DynamicProperty>) -> Self {
        PropertyValue::StaticallyResolvable(StaticHold {
            evaluator,
            resolved: Arc::new(OnceLock::new()),
        })
    }

    /// The concrete value, if no context is needed to produce it.
    pub fn concrete_view(&self) -> Option<&Value> {
        match self {
            PropertyValue::Concrete(v) => Some(v),
            PropertyValue::StaticallyResolvable(hold) => hold.resolved.get(),
            _ => None,
        }
    }

    /// True when resolving this value still requires a context.
    pub fn is_dynamic(&self) -> bool {
        self.concrete_view().is_none()
    }

    /// Fully resolve against `context`. Concrete values clone; dynamic
    /// values evaluate; statically-resolvable values evaluate once and are
    /// frozen thereafter; deferred merges resolve both operands and re-run
    /// their policy on the concrete results.
    pub fn resolve(&self, context: &mut Context) -> Value {
        match self {
            PropertyValue::Concrete(v) => v.clone(),
            PropertyValue::Dynamic(evaluator) => evaluator.evaluate(context),
            PropertyValue::StaticallyResolvable(hold) => {
                if let Some(v) = hold.resolved.get() {
                    return v.clone();
                }
                let v = hold.evaluator.evaluate(context);
                hold.resolved.get_or_init(|| v).clone()
            }
            PropertyValue::Deferred(node) => {
                let old = node.old.resolve(context);
                let new = node.new.resolve(context);
                node.merger
                    .merge(
                        &PropertyValue::Concrete(old),
                        &PropertyValue::Concrete(new),
                        node.declare,
                    )
                    .resolve(context)
            }
        }
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Concrete(v) => write!(f, "Concrete({:?})", v),
            PropertyValue::Dynamic(_) => write!(f, "Dynamic(..)"),
            PropertyValue::StaticallyResolvable(hold) => match hold.resolved.get() {
                Some(v) => write!(f, "StaticallyResolvable({:?})", v),
                None => write!(f, "StaticallyResolvable(<unresolved>)"),
            },
            PropertyValue::Deferred(node) => {
                write!(f, "Deferred({})", node.merger.name())
            }
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(v: Value) -> Self {
        PropertyValue::Concrete(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Concrete(Value::str(s))
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Concrete(Value::Bool(b))
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Concrete(Value::Int(i))
    }
}

/// Per-property merge policy: `merge(old, new, declare) -> result`.
///
/// Policies that can combine unevaluated dynamic operands opt in via
/// `handles_dynamic`; all others only ever see concrete operands (the
/// framework defers the merge otherwise).
pub trait PropertyMerger: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge(&self, old: &PropertyValue, new: &PropertyValue, declare: bool) -> PropertyValue;

    fn handles_dynamic(&self) -> bool {
        false
    }
}

fn truthy(v: &Value) -> bool {
    !matches!(v, Value::Bool(false) | Value::Nil)
}

/// Default policy: the later (higher-rank) rule wins.
pub struct MergeOverwrite;

impl PropertyMerger for MergeOverwrite {
    fn name(&self) -> &'static str {
        "overwrite"
    }

    fn merge(&self, _old: &PropertyValue, new: &PropertyValue, _declare: bool) -> PropertyValue {
        new.clone()
    }
}

/// Boolean AND: a concrete `false` dominates in either order. If either
/// operand is still dynamic the merge defers, since the outcome can only be
/// decided against a context.
pub struct MergeAnd;

impl PropertyMerger for MergeAnd {
    fn name(&self) -> &'static str {
        "and"
    }

    fn handles_dynamic(&self) -> bool {
        true
    }

    fn merge(&self, old: &PropertyValue, new: &PropertyValue, declare: bool) -> PropertyValue {
        let old_view = old.concrete_view();
        let new_view = new.concrete_view();
        if old_view.is_some_and(|v| !truthy(v)) || new_view.is_some_and(|v| !truthy(v)) {
            return PropertyValue::Concrete(Value::Bool(false));
        }
        match (old_view, new_view) {
            (Some(a), Some(b)) => PropertyValue::Concrete(Value::Bool(truthy(a) && truthy(b))),
            _ => PropertyValue::Deferred(Arc::new(DeferredMerge {
                merger: Arc::new(MergeAnd),
                old: old.clone(),
                new: new.clone(),
                declare,
            })),
        }
    }
}

/// Deduplicating union, first-seen order preserved.
pub struct MergeListUnion;

impl PropertyMerger for MergeListUnion {
    fn name(&self) -> &'static str {
        "list-union"
    }

    fn merge(&self, old: &PropertyValue, new: &PropertyValue, _declare: bool) -> PropertyValue {
        let (Some(a), Some(b)) = (old.concrete_view(), new.concrete_view()) else {
            unreachable!("framework defers dynamic operands for list-union");
        };
        PropertyValue::Concrete(a.list_union(b))
    }
}

/// Overwrite outside declare mode; in declare mode, accumulate the deduped
/// list of declared values (used to enumerate legal values of a key).
pub struct MergeDeclareList;

impl PropertyMerger for MergeDeclareList {
    fn name(&self) -> &'static str {
        "declare-list"
    }

    fn merge(&self, old: &PropertyValue, new: &PropertyValue, declare: bool) -> PropertyValue {
        if !declare {
            return new.clone();
        }
        let (Some(a), Some(b)) = (old.concrete_view(), new.concrete_view()) else {
            unreachable!("framework defers dynamic operands for declare-list");
        };
        PropertyValue::Concrete(a.list_union(b))
    }
}

/// Union, except values sharing a trait group replace each other within the
/// group. A trait named `"group.name"` belongs to group `"group."`;
/// ungrouped traits union like a plain list.
pub struct MergeTraitUnion;

fn trait_group(v: &Value) -> Option<&str> {
    let s = v.as_str()?;
    let dot = s.find('.')?;
    Some(&s[..=dot])
}

impl PropertyMerger for MergeTraitUnion {
    fn name(&self) -> &'static str {
        "trait-union"
    }

    fn merge(&self, old: &PropertyValue, new: &PropertyValue, _declare: bool) -> PropertyValue {
        let (Some(a), Some(b)) = (old.concrete_view(), new.concrete_view()) else {
            unreachable!("framework defers dynamic operands for trait-union");
        };
        let mut out: Vec<Value> = a.elements().to_vec();
        for incoming in b.elements() {
            if let Some(group) = trait_group(incoming) {
                out.retain(|existing| trait_group(existing) != Some(group));
            }
            if !out.contains(incoming) {
                out.push(incoming.clone());
            }
        }
        if out.len() == 1 {
            PropertyValue::Concrete(out.pop().unwrap())
        } else {
            PropertyValue::Concrete(Value::List(out))
        }
    }
}

/// Per-property policy registry plus mirror-to-context-key metadata.
pub struct MergerRegistry {
    mergers: DashMap<String, Arc<dyn PropertyMerger>>,
    mirrors: DashMap<String, KeyId>,
    default_merger: Arc<dyn PropertyMerger>,
}

impl MergerRegistry {
    pub fn new() -> Self {
        MergerRegistry {
            mergers: DashMap::new(),
            mirrors: DashMap::new(),
            default_merger: Arc::new(MergeOverwrite),
        }
    }

    pub fn register(&self, property: &str, merger: Arc<dyn PropertyMerger>) {
        self.mergers.insert(property.to_string(), merger);
    }

    /// Registers `merger` only if the property has no policy yet.
    pub(crate) fn register_default(&self, property: &str, merger: Arc<dyn PropertyMerger>) {
        self.mergers.entry(property.to_string()).or_insert(merger);
    }

    pub fn merger_for(&self, property: &str) -> Arc<dyn PropertyMerger> {
        self.mergers
            .get(property)
            .map(|m| Arc::clone(&m))
            .unwrap_or_else(|| Arc::clone(&self.default_merger))
    }

    pub fn set_mirror(&self, property: &str, key: KeyId) {
        self.mirrors.insert(property.to_string(), key);
    }

    pub fn mirror_of(&self, property: &str) -> Option<KeyId> {
        self.mirrors.get(property).map(|k| *k)
    }

    /// Snapshot of (property, context key) mirror pairs, for the chaining
    /// fixpoint.
    pub fn mirrored_properties(&self) -> Vec<(String, KeyId)> {
        self.mirrors
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Merge `new` into `old` under the property's policy, deferring when a
    /// dynamic operand meets a policy that is not dynamic-aware.
    pub fn merge(
        &self,
        property: &str,
        old: &PropertyValue,
        new: &PropertyValue,
        declare: bool,
    ) -> PropertyValue {
        let merger = self.merger_for(property);
        if (old.is_dynamic() || new.is_dynamic()) && !merger.handles_dynamic() {
            return PropertyValue::Deferred(Arc::new(DeferredMerge {
                merger,
                old: old.clone(),
                new: new.clone(),
                declare,
            }));
        }
        merger.merge(old, new, declare)
    }
}

impl Default for MergerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
