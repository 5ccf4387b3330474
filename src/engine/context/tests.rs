//! Tests for the context stack: push/pop restoration, override masking,
//! activation-cache replay, chaining and the property-scope side channel.

use std::sync::Arc;

use super::*;
use crate::engine::meta::Meta;
use crate::engine::rules::Selector;

fn props(pairs: &[(&str, PropertyValue)]) -> PropertyMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn widget_meta() -> Arc<Meta> {
    let meta = Meta::new();
    let mut rules = meta.begin_rule_set(0, "widget");
    rules.add_rule(
        vec![Selector::is("class", "Widget")],
        props(&[
            ("label", PropertyValue::from("Widget")),
            ("editable", PropertyValue::from(true)),
        ]),
        0,
    );
    rules.add_rule(
        vec![Selector::is("class", "Widget"), Selector::is("field", "name")],
        props(&[("label", PropertyValue::from("Name"))]),
        10,
    );
    meta.end_rule_set(rules).unwrap();
    meta
}

// ============================================================================
// BASICS
// ============================================================================

#[test]
fn test_set_and_values() {
    let meta = widget_meta();
    let mut ctx = meta.new_context();
    ctx.set("class", "Widget");
    assert_eq!(ctx.value_for_key("class"), Some(Value::str("Widget")));
    assert_eq!(ctx.values().len(), 1);
}

#[test]
fn test_reset_to_current_value_is_noop() {
    let meta = widget_meta();
    let mut ctx = meta.new_context();
    ctx.set("class", "Widget");
    let entries = ctx.entry_count();
    let before = ctx.all_properties();
    ctx.set("class", "Widget");
    assert_eq!(ctx.entry_count(), entries);
    assert_eq!(ctx.all_properties(), before);
}

#[test]
fn test_merge_unions_values() {
    let meta = widget_meta();
    let mut ctx = meta.new_context();
    ctx.set("trait", "required");
    ctx.merge("trait", "bold");
    assert_eq!(
        ctx.value_for_key("trait"),
        Some(Value::List(vec![Value::str("required"), Value::str("bold")]))
    );
    // Merging an already-present element changes nothing.
    let entries = ctx.entry_count();
    ctx.merge("trait", "bold");
    assert_eq!(ctx.entry_count(), entries);
}

#[test]
#[should_panic(expected = "pop() on an empty context stack")]
fn test_pop_on_empty_stack_panics() {
    let meta = widget_meta();
    let mut ctx = meta.new_context();
    ctx.pop();
}

// ============================================================================
// PUSH / POP SYMMETRY
// ============================================================================

#[test]
fn test_pop_restores_values_and_properties() {
    let meta = widget_meta();
    let mut ctx = meta.new_context();
    ctx.push();
    ctx.set("class", "Widget");

    let values_before = ctx.values();
    let props_before = ctx.all_properties();

    ctx.push();
    ctx.set("field", "name");
    assert_eq!(
        ctx.all_properties().get("label"),
        Some(&Value::str("Name"))
    );
    ctx.pop();

    assert_eq!(ctx.values(), values_before);
    assert_eq!(ctx.all_properties(), props_before);
    ctx.pop();
    assert!(ctx.values().is_empty());
}

#[test]
fn test_pop_restores_overridden_value() {
    let meta = widget_meta();
    let mut ctx = meta.new_context();
    ctx.push();
    ctx.set("mode", "view");
    ctx.push();
    ctx.set("mode", "edit");
    assert_eq!(ctx.value_for_key("mode"), Some(Value::str("edit")));
    ctx.pop();
    assert_eq!(ctx.value_for_key("mode"), Some(Value::str("view")));
    ctx.pop();
    assert_eq!(ctx.value_for_key("mode"), None);
}

#[test]
fn test_rank_ordering_example() {
    let meta = widget_meta();
    let mut ctx = meta.new_context();
    ctx.push();
    ctx.set("class", "Widget");
    ctx.push();
    ctx.set("field", "name");

    let properties = ctx.all_properties();
    assert_eq!(properties.get("label"), Some(&Value::str("Name")));
    assert_eq!(properties.get("editable"), Some(&Value::Bool(true)));

    ctx.pop();
    let properties = ctx.all_properties();
    assert_eq!(properties.get("label"), Some(&Value::str("Widget")));
    assert_eq!(properties.get("editable"), Some(&Value::Bool(true)));
}

// ============================================================================
// OVERRIDE MASKING
// ============================================================================

#[test]
fn test_override_within_frame_masks_and_rematches() {
    let meta = widget_meta();
    let mut ctx = meta.new_context();
    ctx.push();
    ctx.set("class", "Widget");
    ctx.set("field", "name");
    ctx.set("field", "age");

    // field=age masked the field=name entry; the field=name rule no longer
    // applies and the class rule's label shows through.
    assert_eq!(ctx.value_for_key("field"), Some(Value::str("age")));
    assert_eq!(
        ctx.all_properties().get("label"),
        Some(&Value::str("Widget"))
    );
    ctx.pop();
}

#[test]
fn test_chained_override_masks_prior_assignment() {
    let meta = Meta::new();
    let mut rules = meta.begin_rule_set(0, "chain");
    rules.add_rule(
        vec![Selector::is("class", "Order")],
        props(&[("defaultMode", PropertyValue::from("view"))]),
        0,
    );
    rules.add_rule(
        vec![Selector::is("mode", "view")],
        props(&[("editable", PropertyValue::from(false))]),
        0,
    );
    meta.end_rule_set(rules).unwrap();
    meta.mirror_property_to_context("defaultMode", "mode").unwrap();

    let mut ctx = meta.new_context();
    ctx.push();
    ctx.set("mode", "edit");
    ctx.push();
    // The Order rule chains mode=view, overriding the explicit mode=edit.
    ctx.set("class", "Order");
    assert_eq!(ctx.value_for_key("mode"), Some(Value::str("view")));
    assert_eq!(
        ctx.all_properties().get("editable"),
        Some(&Value::Bool(false))
    );
    // Popping the frame restores the masked explicit assignment.
    ctx.pop();
    assert_eq!(ctx.value_for_key("mode"), Some(Value::str("edit")));
    assert_eq!(ctx.all_properties().get("editable"), None);
    ctx.pop();
}

#[test]
fn test_chained_value_survives_source_override() {
    let meta = Meta::new();
    let mut rules = meta.begin_rule_set(0, "chain");
    rules.add_rule(
        vec![Selector::is("class", "Order")],
        props(&[("defaultMode", PropertyValue::from("view"))]),
        0,
    );
    rules.add_rule(
        vec![Selector::is("class", "Invoice")],
        props(&[("label", PropertyValue::from("Invoice"))]),
        0,
    );
    meta.end_rule_set(rules).unwrap();
    meta.mirror_property_to_context("defaultMode", "mode").unwrap();

    let mut ctx = meta.new_context();
    ctx.push();
    ctx.set("class", "Order");
    assert_eq!(ctx.value_for_key("mode"), Some(Value::str("view")));

    // Overriding class masks only descendants-by-override; the chained
    // mode assignment keeps its own slot until masked or popped.
    ctx.set("class", "Invoice");
    assert_eq!(ctx.value_for_key("class"), Some(Value::str("Invoice")));
    assert_eq!(ctx.value_for_key("mode"), Some(Value::str("view")));
    ctx.pop();
    assert_eq!(ctx.value_for_key("mode"), None);
}

// ============================================================================
// ACTIVATION CACHE
// ============================================================================

#[test]
fn test_second_context_replays_from_cache() {
    let meta = widget_meta();

    let mut first = meta.new_context();
    first.push();
    first.set("class", "Widget");
    first.set("field", "name");
    let expected = first.all_properties();
    first.pop();

    let miss_count = meta.stats().snapshot().activation_misses;

    let mut second = meta.new_context();
    second.push();
    second.set("class", "Widget");
    second.set("field", "name");
    assert_eq!(second.all_properties(), expected);
    second.pop();

    // The replayed traversal evaluated no rules and created no activations.
    assert_eq!(meta.stats().snapshot().activation_misses, miss_count);
}

#[test]
fn test_cache_replay_includes_overrides() {
    let meta = widget_meta();

    let mut first = meta.new_context();
    first.push();
    first.set("mode", "view");
    first.set("mode", "edit");
    let expected = first.values();
    first.pop();

    let mut second = meta.new_context();
    second.push();
    second.set("mode", "view");
    second.set("mode", "edit");
    assert_eq!(second.values(), expected);
    second.pop();
    assert!(second.values().is_empty());
}

#[test]
fn test_generation_bump_invalidates_cached_activation() {
    let meta = widget_meta();
    let mut ctx = meta.new_context();
    ctx.push();
    ctx.set("class", "Widget");
    ctx.pop();

    let mut extra = meta.begin_rule_set(0, "extra");
    extra.add_rule(
        vec![Selector::is("class", "Widget")],
        props(&[("label", PropertyValue::from("Widget2"))]),
        20,
    );
    meta.end_rule_set(extra).unwrap();

    // The stale child is rebuilt, and the new rule applies.
    ctx.push();
    ctx.set("class", "Widget");
    assert_eq!(
        ctx.all_properties().get("label"),
        Some(&Value::str("Widget2"))
    );
    ctx.pop();
}

// ============================================================================
// CHAINING
// ============================================================================

#[test]
fn test_chaining_terminates_and_applies_once() {
    let meta = Meta::new();
    let mut rules = meta.begin_rule_set(0, "chain");
    rules.add_rule(
        vec![Selector::is("class", "User")],
        props(&[("defaultOperation", PropertyValue::from("inspect"))]),
        0,
    );
    rules.add_rule(
        vec![Selector::is("operation", "inspect")],
        props(&[("editable", PropertyValue::from(false))]),
        0,
    );
    meta.end_rule_set(rules).unwrap();
    meta.mirror_property_to_context("defaultOperation", "operation")
        .unwrap();

    let mut ctx = meta.new_context();
    let chained_before = meta.stats().snapshot().chained_assignments;
    ctx.push();
    ctx.set("class", "User");

    assert_eq!(ctx.value_for_key("operation"), Some(Value::str("inspect")));
    assert_eq!(
        ctx.all_properties().get("editable"),
        Some(&Value::Bool(false))
    );
    // Exactly one derived assignment.
    assert_eq!(
        meta.stats().snapshot().chained_assignments,
        chained_before + 1
    );

    ctx.pop();
    assert_eq!(ctx.value_for_key("operation"), None);
}

#[test]
fn test_chained_assignments_replay_from_cache() {
    let meta = Meta::new();
    let mut rules = meta.begin_rule_set(0, "chain");
    rules.add_rule(
        vec![Selector::is("class", "User")],
        props(&[("defaultOperation", PropertyValue::from("inspect"))]),
        0,
    );
    meta.end_rule_set(rules).unwrap();
    meta.mirror_property_to_context("defaultOperation", "operation")
        .unwrap();

    let mut first = meta.new_context();
    first.push();
    first.set("class", "User");
    first.pop();

    let misses = meta.stats().snapshot().activation_misses;
    let mut second = meta.new_context();
    second.push();
    second.set("class", "User");
    assert_eq!(second.value_for_key("operation"), Some(Value::str("inspect")));
    second.pop();
    assert_eq!(meta.stats().snapshot().activation_misses, misses);
}

// ============================================================================
// PROPERTY-SCOPE SIDE CHANNEL
// ============================================================================

fn scoped_meta() -> Arc<Meta> {
    let meta = Meta::new();
    meta.define_key_as_property_scope("field").unwrap();
    let mut rules = meta.begin_rule_set(0, "scoped");
    rules.add_rule(
        vec![Selector::is("class", "User")],
        props(&[("label", PropertyValue::from("User"))]),
        0,
    );
    rules.add_rule(
        vec![Selector::is("field", "name")],
        props(&[
            ("label", PropertyValue::from("Name")),
            ("widget", PropertyValue::from("TextField")),
        ]),
        10,
    );
    meta.end_rule_set(rules).unwrap();
    meta
}

#[test]
fn test_scope_rules_apply_only_in_scope() {
    let meta = scoped_meta();
    let mut ctx = meta.new_context();
    ctx.push();
    ctx.set("class", "User");
    // No scope active: the field rule (scope-augmented) must not apply.
    assert_eq!(ctx.property_for_key("label"), Some(Value::str("User")));
    assert_eq!(ctx.property_for_key("widget"), None);

    ctx.push();
    ctx.set("field", "name");
    // field is now the active scope; its rules contribute via the side
    // channel without mutating the visible stack.
    let values_during = ctx.values();
    assert_eq!(ctx.property_for_key("label"), Some(Value::str("Name")));
    assert_eq!(ctx.property_for_key("widget"), Some(Value::str("TextField")));
    assert_eq!(ctx.values(), values_during);
    ctx.pop();

    assert_eq!(ctx.property_for_key("label"), Some(Value::str("User")));
    ctx.pop();
}

#[test]
fn test_scope_reads_hit_cached_side_activation() {
    let meta = scoped_meta();
    let mut ctx = meta.new_context();
    ctx.push();
    ctx.set("class", "User");
    ctx.set("field", "name");
    // First read computes the side activation; repeat reads reuse it.
    assert_eq!(ctx.property_for_key("label"), Some(Value::str("Name")));
    let misses = meta.stats().snapshot().activation_misses;
    assert_eq!(ctx.property_for_key("label"), Some(Value::str("Name")));
    assert_eq!(ctx.property_for_key("widget"), Some(Value::str("TextField")));
    assert_eq!(meta.stats().snapshot().activation_misses, misses);
    ctx.pop();
}

// ============================================================================
// DECLARE MODE
// ============================================================================

#[test]
fn test_declare_enumerates_legal_values() {
    let meta = Meta::new();
    let mut rules = meta.begin_rule_set(0, "decl");
    rules.add_rule(
        vec![
            Selector::is("class", "User"),
            Selector::declare("field", "name"),
        ],
        props(&[("label", PropertyValue::from("Name"))]),
        0,
    );
    rules.add_rule(
        vec![
            Selector::is("class", "User"),
            Selector::declare("field", "birthDate"),
        ],
        props(&[("label", PropertyValue::from("Born"))]),
        0,
    );
    meta.end_rule_set(rules).unwrap();

    let mut ctx = meta.new_context();
    ctx.push();
    ctx.set("class", "User");
    ctx.push();
    ctx.set("declare", "field");
    assert!(ctx.is_declaring("field"));
    assert_eq!(
        ctx.property_for_key("field"),
        Some(Value::List(vec![
            Value::str("name"),
            Value::str("birthDate")
        ]))
    );
    ctx.pop();
    assert!(!ctx.is_declaring("field"));
    ctx.pop();
}
