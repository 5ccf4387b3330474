//! Chaining behavior: derived assignments terminate when the mirrored
//! value stabilizes, dynamic mirrors defer and re-evaluate per context,
//! and a non-stabilizing chain dies on the fatal ceiling.

use std::sync::Arc;

use salience::{
    Context, DynamicProperty, Meta, PropertyValue, Selector, Value,
};

fn props(pairs: &[(&str, PropertyValue)]) -> salience::PropertyMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Honor RUST_LOG while debugging chaining behavior; safe to call from
/// every test, only the first init wins.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn test_chain_terminates_after_exactly_n_steps() {
    init_tracing();
    let meta = Meta::new();
    let mut rules = meta.begin_rule_set(0, "ladder");
    // step=i derives step=i+1 up to 3; step=3 derives nothing.
    for i in 0..3i64 {
        rules.add_rule(
            vec![Selector::is("step", i.to_string().as_str())],
            props(&[("nextStep", PropertyValue::from((i + 1).to_string().as_str()))]),
            0,
        );
    }
    meta.end_rule_set(rules).unwrap();
    meta.mirror_property_to_context("nextStep", "step").unwrap();

    let mut ctx = meta.new_context();
    let before = meta.stats().snapshot().chained_assignments;
    ctx.push();
    ctx.set("step", "0");
    // The ladder stabilized at 3 after exactly 3 derived assignments.
    assert_eq!(ctx.value_for_key("step"), Some(Value::str("3")));
    assert_eq!(meta.stats().snapshot().chained_assignments, before + 3);
    ctx.pop();
    assert_eq!(ctx.value_for_key("step"), None);
}

#[test]
#[should_panic(expected = "derived-assignment cycle")]
fn test_unstable_chain_hits_fatal_ceiling() {
    let meta = Meta::new();
    let mut rules = meta.begin_rule_set(0, "pendulum");
    rules.add_rule(
        vec![Selector::is("flip", "a")],
        props(&[("other", PropertyValue::from("b"))]),
        0,
    );
    rules.add_rule(
        vec![Selector::is("flip", "b")],
        props(&[("other", PropertyValue::from("a"))]),
        0,
    );
    meta.end_rule_set(rules).unwrap();
    meta.mirror_property_to_context("other", "flip").unwrap();

    let mut ctx = meta.new_context();
    ctx.push();
    ctx.set("flip", "a");
}

/// Reads another context key at evaluation time; the canonical shape of a
/// dynamic mirrored property.
struct EchoKey(&'static str);

impl DynamicProperty for EchoKey {
    fn evaluate(&self, context: &mut Context) -> Value {
        context.value_for_key(self.0).unwrap_or(Value::Nil)
    }
}

#[test]
fn test_dynamic_mirror_defers_and_tracks_each_context() {
    let meta = Meta::new();
    let mut rules = meta.begin_rule_set(0, "dyn");
    rules.add_rule(
        vec![Selector::is("class", "Document")],
        props(&[(
            "ownerTarget",
            PropertyValue::dynamic(Arc::new(EchoKey("owner"))),
        )]),
        0,
    );
    meta.end_rule_set(rules).unwrap();
    meta.mirror_property_to_context("ownerTarget", "target").unwrap();

    let mut first = meta.new_context();
    first.push();
    first.set("owner", "alice");
    first.set("class", "Document");
    assert_eq!(first.value_for_key("target"), Some(Value::str("alice")));
    first.pop();

    // A different owner takes a different activation path; the deferred
    // assignment evaluates against that context's own state.
    let mut second = meta.new_context();
    second.push();
    second.set("owner", "bob");
    second.set("class", "Document");
    assert_eq!(second.value_for_key("target"), Some(Value::str("bob")));
    second.pop();
}

/// Evaluates to process-external state, so the same activation path can
/// resolve differently across applications.
struct ExternalFlag(Arc<std::sync::atomic::AtomicBool>);

impl DynamicProperty for ExternalFlag {
    fn evaluate(&self, _context: &mut Context) -> Value {
        if self.0.load(std::sync::atomic::Ordering::Relaxed) {
            Value::str("on")
        } else {
            Value::str("off")
        }
    }
}

#[test]
fn test_deferred_reevaluates_on_cached_replay() {
    let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let meta = Meta::new();
    let mut rules = meta.begin_rule_set(0, "dyn-replay");
    rules.add_rule(
        vec![Selector::is("class", "Document")],
        props(&[(
            "featureState",
            PropertyValue::dynamic(Arc::new(ExternalFlag(Arc::clone(&flag)))),
        )]),
        0,
    );
    meta.end_rule_set(rules).unwrap();
    meta.mirror_property_to_context("featureState", "feature").unwrap();

    let mut first = meta.new_context();
    first.push();
    first.set("class", "Document");
    assert_eq!(first.value_for_key("feature"), Some(Value::str("off")));
    first.pop();

    // Identical path: the activation replays from cache, yet the deferred
    // assignment re-evaluates and sees the flipped flag.
    flag.store(true, std::sync::atomic::Ordering::Relaxed);
    let misses = meta.stats().snapshot().activation_misses;
    let mut second = meta.new_context();
    second.push();
    second.set("class", "Document");
    assert_eq!(second.value_for_key("feature"), Some(Value::str("on")));
    second.pop();
    // The class=Document transition itself was a cache hit; only the new
    // chained feature value extended the tree.
    assert!(meta.stats().snapshot().activation_misses <= misses + 1);
}

#[test]
fn test_stale_deferred_precondition_is_skipped() {
    init_tracing();
    let meta = Meta::new();
    let mut rules = meta.begin_rule_set(0, "dyn");
    rules.add_rule(
        vec![Selector::is("class", "Document")],
        props(&[(
            "ownerTarget",
            PropertyValue::dynamic(Arc::new(EchoKey("owner"))),
        )]),
        0,
    );
    meta.end_rule_set(rules).unwrap();
    meta.mirror_property_to_context("ownerTarget", "target").unwrap();

    // No owner assigned: the deferred assignment's precondition does not
    // hold, so it is skipped rather than asserting nil.
    let mut ctx = meta.new_context();
    ctx.push();
    ctx.set("class", "Document");
    assert_eq!(ctx.value_for_key("target"), None);
    ctx.pop();
}

#[test]
fn test_statically_resolvable_value_freezes_on_first_read() {
    let meta = Meta::new();
    let mut rules = meta.begin_rule_set(0, "static");
    rules.add_rule(
        vec![Selector::is("class", "Report")],
        props(&[(
            "firstOwner",
            PropertyValue::statically_resolvable(Arc::new(EchoKey("owner"))),
        )]),
        0,
    );
    meta.end_rule_set(rules).unwrap();

    let mut first = meta.new_context();
    first.push();
    first.set("owner", "carol");
    first.set("class", "Report");
    assert_eq!(
        first.property_for_key("firstOwner"),
        Some(Value::str("carol"))
    );
    first.pop();

    // Resolved once: later contexts observe the frozen value.
    let mut second = meta.new_context();
    second.push();
    second.set("owner", "dave");
    second.set("class", "Report");
    assert_eq!(
        second.property_for_key("firstOwner"),
        Some(Value::str("carol"))
    );
    second.pop();
}
