//! salience - Context-Sensitive Rule Resolution Engine
//!
//! This library resolves a *context-dependent configuration map*: given a
//! stack of active key=value assignments (e.g. `entity=User`,
//! `field=birthDate`, `mode=edit`), it computes the effective set of merged
//! properties (`visible`, `editable`, `widget`, `label`, ...) by matching
//! the context against a rule base of (selector-set → property-set) rules
//! ranked by priority, with pluggable per-property merge policies and
//! automatic re-assertion of derived assignments implied by computed
//! properties ("chaining").
//!
//! # Architecture
//!
//! Resolution runs through three layers:
//!
//! 1. **Rule base** (`engine::keys`, `engine::rules`)
//!    - Context keys intern to dense ids (< 64) so selector sets compress
//!      into single-word bitmasks
//!    - Per (key, value), a sorted grow-only posting list of rule ids,
//!      with value-inheritance chains unioned in at lookup
//!    - Rules publish in batches (rule sets) and are never mutated after
//!      publication, except for the atomic rank-sentinel disable
//!
//! 2. **Match algebra** (`engine::matching`)
//!    - Joining one assignment onto a prior path is an O(n+m) streaming
//!      merge of sorted rule-id arrays, pruned by bitmask tests
//!    - Every match node memoizes its candidates against the rule-base
//!      generation and transparently recomputes when stale
//!    - Merged property maps cache globally by path checksum, so any
//!      session traversing the same logical path reuses them
//!
//! 3. **Context stack** (`engine::context`, `engine::activation`)
//!    - Each session owns a strict-LIFO assignment stack with exact
//!      `push()`/`pop()` restoration
//!    - Traversed transitions publish into a process-wide, grow-only
//!      Activation tree; repeating a known assignment replays cached recs
//!      with no rule evaluation at all
//!
//! # Example
//!
//! ```rust
//! use salience::{Meta, Selector, PropertyValue, Value};
//!
//! let meta = Meta::new();
//! let mut rules = meta.begin_rule_set(0, "example");
//! rules.add_rule(
//!     vec![Selector::is("class", "Widget")],
//!     [
//!         ("label".to_string(), PropertyValue::from("Widget")),
//!         ("editable".to_string(), PropertyValue::from(true)),
//!     ]
//!     .into_iter()
//!     .collect(),
//!     0,
//! );
//! rules.add_rule(
//!     vec![Selector::is("class", "Widget"), Selector::is("field", "name")],
//!     [("label".to_string(), PropertyValue::from("Name"))]
//!         .into_iter()
//!         .collect(),
//!     10,
//! );
//! meta.end_rule_set(rules).unwrap();
//!
//! let mut ctx = meta.new_context();
//! ctx.push();
//! ctx.set("class", "Widget");
//! ctx.set("field", "name");
//! assert_eq!(ctx.property_for_key("label"), Some(Value::str("Name")));
//! assert_eq!(ctx.property_for_key("editable"), Some(Value::Bool(true)));
//! ctx.pop();
//! ```
//!
//! # Concurrency
//!
//! The model is synchronous shared-memory threading: many `Context`
//! instances (one per logical session) read and extend one shared `Meta`.
//! Rule mutation serializes on an update lock; activation cache misses
//! lock only the parent node being extended; cache hits are lock-free.
//! All shared structures are grow-only, so concurrent readers never see a
//! torn state.

pub mod engine;

pub use engine::{
    Context, DynamicProperty, KeyId, KeyInitObserver, MatchStats, MergeAnd, MergeDeclareList,
    MergeListUnion, MergeOverwrite, MergeTraitUnion, Meta, MetaError, PropertyMap, PropertyMerger,
    PropertyValue, RuleId, RuleSetBuilder, RuleSetId, Selector, SelectorValue, StatsSnapshot,
    Value, ValueTransformer,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_resolution() {
        let meta = Meta::new();
        let mut rules = meta.begin_rule_set(0, "lib-doc");
        rules.add_rule(
            vec![Selector::is("class", "Widget")],
            [("label".to_string(), PropertyValue::from("Widget"))]
                .into_iter()
                .collect(),
            0,
        );
        meta.end_rule_set(rules).unwrap();

        let mut ctx = meta.new_context();
        ctx.push();
        ctx.set("class", "Widget");
        assert_eq!(ctx.property_for_key("label"), Some(Value::str("Widget")));
        ctx.pop();
        assert_eq!(ctx.property_for_key("label"), None);
    }
}
