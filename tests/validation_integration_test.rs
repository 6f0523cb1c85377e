//! Integration tests for the validation engine over raw JSON queries.
//!
//! Each test plays a realistic screen through `validate_value` and
//! checks the graded issue list, not just the valid/invalid verdict.

use screener::metrics::DerivedMetricsEngine;
use screener::validation::{IssueKind, Severity, ValidationEngine, ValidationResult};
use serde_json::json;

fn validate(query: serde_json::Value) -> ValidationResult {
    let metrics = DerivedMetricsEngine::new();
    ValidationEngine::new(&metrics).validate_value(&query)
}

#[test]
fn test_clean_screen_has_no_issues() {
    let result = validate(json!({
        "filter": { "and": [
            { "field": "pe_ratio", "operator": "<", "value": 25 },
            { "field": "roe", "operator": ">", "value": 12 },
            { "field": "sector", "operator": "not_in", "value": ["Energy"] }
        ]},
        "sort": { "field": "market_cap", "order": "desc" },
        "limit": 50
    }));
    assert!(result.is_valid(), "issues: {:?}", result.issues);
    assert!(result.issues.is_empty(), "issues: {:?}", result.issues);
    assert_eq!(result.metadata.condition_count, 3);
}

#[test]
fn test_issue_paths_point_into_the_tree() {
    let result = validate(json!({
        "filter": { "and": [
            { "field": "roe", "operator": ">", "value": 12 },
            { "or": [
                { "field": "pe_ratio", "operator": "<" },
                { "field": "market_cap", "operator": ">", "value": 100 }
            ]}
        ]}
    }));
    assert!(!result.is_valid());
    let error = result.errors().next().unwrap();
    assert_eq!(error.path.as_deref(), Some("filter.and[1].or[0]"));
    assert!(error.message.contains("requires a value"));
}

#[test]
fn test_structural_error_reported_as_issue_not_panic() {
    let result = validate(json!({
        "filter": {
            "and": [{ "field": "roe", "operator": ">", "value": 1 }],
            "not": { "field": "roa", "operator": ">", "value": 1 }
        }
    }));
    assert!(!result.is_valid());
    let error = result.errors().next().unwrap();
    assert_eq!(error.kind, IssueKind::RuleValidity);
    assert!(error.message.contains("mixes combinator keys"));
}

#[test]
fn test_conflict_reported_once_per_field() {
    let result = validate(json!({
        "filter": { "and": [
            { "field": "pe_ratio", "operator": ">", "value": 30 },
            { "field": "pe_ratio", "operator": "<", "value": 10 },
            { "field": "roe", "operator": ">=", "value": 40 },
            { "field": "roe", "operator": "<=", "value": 20 }
        ]}
    }));
    let conflicts: Vec<_> = result
        .errors()
        .filter(|i| i.kind == IssueKind::LogicalConflict)
        .collect();
    assert_eq!(conflicts.len(), 2);
    assert_eq!(conflicts[0].field.as_deref(), Some("pe_ratio"));
    assert_eq!(conflicts[1].field.as_deref(), Some("roe"));
}

#[test]
fn test_disjunction_bounds_do_not_conflict() {
    // Bounds on opposite sides of an OR are alternatives, not a
    // contradiction.
    let result = validate(json!({
        "filter": { "and": [
            { "field": "roe", "operator": ">", "value": 30 },
            { "or": [
                { "field": "roe", "operator": "<", "value": 10 },
                { "field": "market_cap", "operator": ">", "value": 50000 }
            ]}
        ]}
    }));
    assert!(
        !result.errors().any(|i| i.kind == IssueKind::LogicalConflict),
        "issues: {:?}",
        result.issues
    );
}

#[test]
fn test_momentum_screen_warnings_and_infos() {
    let result = validate(json!({
        "filter": { "and": [
            { "field": "net_profit", "operator": ">", "value": 0 },
            { "field": "peg_ratio", "operator": "<", "value": 1 },
            {
                "field": "eps", "operator": "increasing",
                "period": { "type": "quarters", "n": 14, "aggregation": "trend" }
            }
        ]}
    }));
    assert!(result.is_valid(), "issues: {:?}", result.issues);

    // time-series field used without a window
    assert!(result
        .warnings()
        .any(|i| i.kind == IssueKind::Ambiguity && i.message.contains("net_profit")));
    // trend without explicit config
    assert!(result
        .warnings()
        .any(|i| i.message.contains("without trend_config")));
    // deep history request
    assert!(result
        .warnings()
        .any(|i| i.kind == IssueKind::DataAvailability && i.message.contains("14 periods")));
    // derived-metric exclusion note
    assert!(result
        .issues
        .iter()
        .any(|i| i.severity == Severity::Info && i.kind == IssueKind::MetricSafety));

    assert!(result.metadata.uses_time_series);
    assert!(result.metadata.uses_derived_metrics);
}

#[test]
fn test_warnings_never_block() {
    let result = validate(json!({
        "filter": { "field": "roe", "operator": ">", "value": 150 },
        "extra": true
    }));
    assert!(result.is_valid());
    assert!(result.warnings().count() >= 2);
}

#[test]
fn test_metadata_tracks_shape() {
    let result = validate(json!({
        "filter": { "and": [
            { "field": "pe_ratio", "operator": "<", "value": 20 },
            { "not": { "or": [
                { "field": "sector", "operator": "=", "value": "Energy" },
                { "field": "sector", "operator": "=", "value": "Realty" }
            ]}}
        ]}
    }));
    assert!(result.is_valid(), "issues: {:?}", result.issues);
    // and = 1, not = 2, or = 1
    assert_eq!(result.metadata.complexity_score, 4);
    assert_eq!(result.metadata.condition_count, 3);
    assert!(!result.metadata.uses_time_series);
}
