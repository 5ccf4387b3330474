// Engine module: context-sensitive rule resolution
//
// Data flows bottom-up through the submodules:
// - `keys` / `rules`: the rule base (interned keys, posting lists, masks)
// - `matching`: incremental candidate algebra over assignment paths
// - `properties`: per-property merge policies and dynamic values
// - `activation` / `context`: the cached assignment stack
// - `meta`: the façade tying them together

pub mod activation;
pub mod context;
pub mod error;
pub mod hash;
pub mod keys;
pub mod matching;
pub mod meta;
pub mod properties;
pub mod rules;
pub mod value;

pub use context::{Context, CHAIN_ROUND_CEILING, STACK_DEPTH_CEILING};
pub use error::MetaError;
pub use keys::{KeyId, KeyIndex, KeyInitObserver, ValueTransformer, MAX_CONTEXT_KEYS};
pub use meta::{Meta, MatchStats, RuleSetBuilder, StatsSnapshot, DECLARE_KEY, SCOPE_KEY};
pub use properties::{
    DynamicProperty, MergeAnd, MergeDeclareList, MergeListUnion, MergeOverwrite, MergeTraitUnion,
    PropertyMap, PropertyMerger, PropertyValue,
};
pub use rules::{RuleId, RuleSetId, Selector, SelectorValue, RANK_DISABLED};
pub use value::Value;
