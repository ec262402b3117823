//! Property-based tests using proptest
//!
//! These tests check filter narrowing, spec validation, comparator
//! consistency and chunk partitioning with randomized inputs.

use proptest::prelude::*;
use resfilter::config::EngineConfig;
use resfilter::context::RunContext;
use resfilter::filters::{FilterContext, FilterRegistry, Operator};
use resfilter::provider::FixtureProvider;
use resfilter::resource::{chunks, Registry, Resource, ResourceQueryManager};
use serde_json::{json, Value};
use std::sync::Arc;

const STATUSES: &[&str] = &["RUNNING", "STOPPED", "TERMINATED", "PENDING", "STAGING"];

/// Instances with unique names and random status/zone
fn arb_instances() -> impl Strategy<Value = Vec<Resource>> {
    prop::collection::vec(
        (
            prop::sample::select(STATUSES),
            "[a-z]+-[a-z]+[0-9]-[a-z]",
            0u32..64,
        ),
        0..60,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .enumerate()
            .map(|(i, (status, zone, cpus))| {
                Resource::from_value(
                    "name",
                    json!({
                        "name": format!("vm-{}", i),
                        "status": status,
                        "zone": format!("projects/test/zones/{}", zone),
                        "cpus": cpus
                    }),
                )
                .unwrap()
            })
            .collect()
    })
}

fn filter_context() -> FilterContext {
    let registry = Arc::new(Registry::builtin().unwrap());
    let manager = Arc::new(ResourceQueryManager::new(registry));
    let run = RunContext::new(Arc::new(FixtureProvider::new()), EngineConfig::default());
    FilterContext::new(run, manager, "compute-instances").unwrap()
}

fn apply(specs: &[Value], resources: Vec<Resource>) -> Vec<Resource> {
    let ctx = filter_context();
    let chain = FilterRegistry::builtin()
        .build_chain(&ctx.resource_def, specs)
        .unwrap();
    tokio_test::block_on(chain.apply(&ctx, resources)).unwrap()
}

/// Whether `sub` appears in `all` in the same relative order
fn is_subsequence(sub: &[String], all: &[String]) -> bool {
    let mut it = all.iter();
    sub.iter().all(|s| it.any(|a| a == s))
}

fn ids(resources: &[Resource]) -> Vec<String> {
    resources.iter().map(|r| r.id()).collect()
}

// =============================================================================
// Narrowing
// =============================================================================

proptest! {
    #[test]
    fn value_filter_only_narrows(
        resources in arb_instances(),
        status in prop::sample::select(STATUSES),
    ) {
        let input = ids(&resources);
        let output = apply(&[json!({"status": status})], resources.clone());

        prop_assert!(output.len() <= input.len());
        prop_assert!(is_subsequence(&ids(&output), &input));
        prop_assert!(output.iter().all(|r| r.get("status") == Some(&json!(status))));

        let expected = resources.iter().filter(|r| r.get("status") == Some(&json!(status))).count();
        prop_assert_eq!(output.len(), expected);
    }

    #[test]
    fn or_filter_keeps_input_order(
        resources in arb_instances(),
        a in prop::sample::select(STATUSES),
        b in prop::sample::select(STATUSES),
    ) {
        let input = ids(&resources);
        let spec = json!({"or": [{"status": a}, {"status": b}]});
        let output = apply(&[spec], resources.clone());

        prop_assert!(is_subsequence(&ids(&output), &input));
        let expected = resources
            .iter()
            .filter(|r| r.get("status") == Some(&json!(a)) || r.get("status") == Some(&json!(b)))
            .count();
        prop_assert_eq!(output.len(), expected);
    }

    #[test]
    fn chained_filters_never_grow(
        resources in arb_instances(),
        threshold in 0u32..64,
    ) {
        let input_len = resources.len();
        let specs = vec![
            json!({"type": "value", "key": "cpus", "op": "greater-or-equal", "value": threshold}),
            json!({"not": [{"status": "RUNNING"}]}),
        ];
        let output = apply(&specs, resources);

        prop_assert!(output.len() <= input_len);
        for r in &output {
            prop_assert!(r.get("cpus").and_then(|v| v.as_u64()).unwrap_or(0) >= u64::from(threshold));
            prop_assert!(r.get("status") != Some(&json!("RUNNING")));
        }
    }
}

// =============================================================================
// Validation round-trip
// =============================================================================

const SAFE_OPS: &[&str] = &["eq", "ne", "gt", "lt", "ge", "le", "in", "not-in", "contains", "intersect"];

fn arb_unknown_key() -> impl Strategy<Value = String> {
    "[a-z][a-z_]{2,12}".prop_filter("must not be a declared key", |k| {
        !["type", "key", "op", "value", "value_type"].contains(&k.as_str())
    })
}

proptest! {
    #[test]
    fn declared_value_keys_validate(
        key in "[a-z][a-zA-Z.]{0,20}",
        op in prop::sample::select(SAFE_OPS),
        value in "[a-zA-Z0-9 ]{0,20}",
    ) {
        let ctx = filter_context();
        let spec = json!({"type": "value", "key": key, "op": op, "value": value});
        prop_assert!(FilterRegistry::builtin().build(&ctx.resource_def, &spec).is_ok());
    }

    #[test]
    fn unknown_value_keys_are_rejected(extra in arb_unknown_key()) {
        let ctx = filter_context();
        let mut spec = json!({"type": "value", "key": "status", "value": "RUNNING"});
        spec[extra.as_str()] = json!(1);

        let err = FilterRegistry::builtin().build(&ctx.resource_def, &spec).unwrap_err();
        prop_assert!(err.is_validation());
        prop_assert!(err.to_string().contains(&extra));
    }

    #[test]
    fn unknown_permission_keys_are_rejected(extra in arb_unknown_key()) {
        let registry = Registry::builtin().unwrap();
        let firewalls = registry.get("compute-firewalls").unwrap();
        let mut spec = json!({"type": "ingress", "Ports": [22]});
        spec[extra.as_str()] = json!(true);

        let err = FilterRegistry::builtin().build(firewalls, &spec).unwrap_err();
        prop_assert!(err.is_validation());
        prop_assert!(err.to_string().contains(&extra));
    }

    #[test]
    fn unknown_filter_types_are_rejected(kind in "[a-z]{4,12}") {
        prop_assume!(!FilterRegistry::builtin().types().iter().any(|t| *t == kind));
        let ctx = filter_context();
        let spec = json!({"type": kind});
        prop_assert!(FilterRegistry::builtin().build(&ctx.resource_def, &spec).is_err());
    }
}

// =============================================================================
// Comparator and chunking
// =============================================================================

proptest! {
    #[test]
    fn ordering_operators_are_consistent(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000) {
        let (x, y) = (json!(a), json!(b));
        prop_assert_eq!(Operator::GreaterThan.compare(&x, &y), Operator::LessThan.compare(&y, &x));
        prop_assert_eq!(Operator::GreaterOrEqual.compare(&x, &y), Operator::LessOrEqual.compare(&y, &x));
        prop_assert_ne!(Operator::Equal.compare(&x, &y), Operator::NotEqual.compare(&x, &y));
        prop_assert_eq!(
            Operator::GreaterThan.compare_f64(a as f64, b as f64),
            Operator::GreaterThan.compare(&x, &y)
        );
    }

    #[test]
    fn numeric_strings_compare_as_numbers(a in 0u32..100_000, b in 0u32..100_000) {
        let x = json!(a.to_string());
        let y = json!(b);
        prop_assert_eq!(Operator::LessThan.compare(&x, &y), a < b);
    }

    #[test]
    fn chunks_partition_the_input(items in prop::collection::vec(any::<u16>(), 0..200), size in 1usize..60) {
        let parts = chunks(items.clone(), size);
        prop_assert!(parts.iter().all(|c| !c.is_empty() && c.len() <= size));
        let rejoined: Vec<u16> = parts.into_iter().flatten().collect();
        prop_assert_eq!(rejoined, items);
    }
}
