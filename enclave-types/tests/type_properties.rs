//! Property-based tests for ids and resource accounting.

use enclave_types::{PluginId, Resource, ResourceLimits, SandboxMetrics};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

fn plugin_id_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,12}(\\.[a-z][a-z0-9_-]{0,12}){0,3}"
}

fn limits_strategy() -> impl Strategy<Value = ResourceLimits> {
    (1u64..1024, 1.0f64..100.0, 1u64..100, 1u64..10_000).prop_map(
        |(max_memory, max_cpu, max_network_requests, max_dom_nodes)| ResourceLimits {
            max_memory,
            max_cpu,
            max_network_requests,
            max_dom_nodes,
        },
    )
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    #[test]
    fn plugin_id_survives_json(raw in plugin_id_strategy()) {
        let id = PluginId::parse(&raw).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        let back: PluginId = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back.as_str(), raw.as_str());
    }

    #[test]
    fn ids_with_whitespace_or_separators_are_rejected(
        head in "[a-z]{1,6}",
        bad in prop::sample::select(vec![' ', '\t', '/', '\\', '\n']),
        tail in "[a-z]{0,6}",
    ) {
        let raw = format!("{head}{bad}{tail}");
        prop_assert!(PluginId::parse(&raw).is_err());
    }

    #[test]
    fn method_names_keep_the_owner_prefix(raw in plugin_id_strategy(), method in "[a-zA-Z]{1,12}") {
        let id = PluginId::parse(&raw).unwrap();
        let name = id.method(&method);
        let prefix = format!("{raw}.");
        prop_assert!(name.starts_with(&prefix));
        prop_assert!(name.ends_with(&method));
    }

    #[test]
    fn violations_match_usage_above_limit(
        limits in limits_strategy(),
        memory in 0.0f64..2048.0,
        network in 0u64..200,
    ) {
        let mut metrics = SandboxMetrics::from_limits(&limits);
        metrics.memory.used = memory;
        metrics.network.used = network as f64;

        let violations = metrics.violations();
        prop_assert_eq!(
            violations.contains(&Resource::Memory),
            memory > limits.max_memory as f64
        );
        prop_assert_eq!(
            violations.contains(&Resource::Network),
            network > limits.max_network_requests
        );
        prop_assert!(!violations.contains(&Resource::Cpu));
        prop_assert!(metrics.peak_ratio() >= metrics.memory.ratio());
    }
}

#[test]
fn fresh_metrics_report_no_violations() {
    let metrics = SandboxMetrics::from_limits(&ResourceLimits::default());
    assert_eq!(metrics.violations(), Vec::<Resource>::new());
    assert_eq!(metrics.peak_ratio(), 0.0);
}
