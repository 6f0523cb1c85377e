//! Pre-execution validation of screening queries.
//!
//! A single pass over the query producing a graded issue list. Malformed
//! user input never surfaces as a Rust error from here: every finding -
//! structural, logical, or advisory - becomes a [`ValidationIssue`], and
//! the result is valid iff no error-severity issue exists. Warnings and
//! infos never block compilation.

use serde_json::Value;

use crate::catalog;
use crate::metrics::DerivedMetricsEngine;
use crate::model::{
    Aggregation, Condition, FilterNode, Operator, Query, MAX_FILTER_DEPTH,
};

// ============================================================================
// Issues
// ============================================================================

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Must fix - blocks compilation.
    Error,
    /// Should fix - may produce unexpected results.
    Warning,
    /// Informational - behavior note or optimization suggestion.
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// Taxonomy of validation findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    /// Malformed condition or query structure.
    RuleValidity,
    /// Interpretable default applied; worth an explicit spelling.
    Ambiguity,
    /// Requested history or period unsupported by the schema.
    DataAvailability,
    /// Derived-metric guard triggered or unknown metric.
    MetricSafety,
    /// Unsatisfiable bounds.
    LogicalConflict,
    /// Unexpected internal failure, reported instead of propagated.
    SystemError,
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IssueKind::RuleValidity => "rule_validity",
            IssueKind::Ambiguity => "ambiguity",
            IssueKind::DataAvailability => "data_availability",
            IssueKind::MetricSafety => "metric_safety",
            IssueKind::LogicalConflict => "logical_conflict",
            IssueKind::SystemError => "system_error",
        };
        f.write_str(s)
    }
}

/// A single graded finding about query soundness.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub kind: IssueKind,
    pub message: String,
    pub field: Option<String>,
    /// JSON path to the problematic node.
    pub path: Option<String>,
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    pub fn error(kind: IssueKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, kind, message)
    }

    pub fn warning(kind: IssueKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, kind, message)
    }

    pub fn info(kind: IssueKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, kind, message)
    }

    fn new(severity: Severity, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            field: None,
            path: None,
            suggestion: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.severity, self.kind)?;
        if let Some(path) = &self.path {
            write!(f, " at {}", path)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Shape statistics gathered while validating, mirrored by the compiler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationMetadata {
    pub complexity_score: u32,
    pub condition_count: u32,
    pub uses_time_series: bool,
    pub uses_derived_metrics: bool,
}

/// The outcome of validating one query.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
    pub metadata: ValidationMetadata,
}

impl ValidationResult {
    /// Valid iff no error-severity issue exists.
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
    }

    /// Terse client-facing summary: the first few error messages.
    ///
    /// The full issue list stays available for diagnostic logging.
    pub fn error_summary(&self) -> String {
        self.errors()
            .take(3)
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Validation engine: walks the filter tree and the whole query and
/// produces a graded issue list. Read-only and reentrant; borrow one
/// per process or per request, either works.
#[derive(Debug, Clone, Copy)]
pub struct ValidationEngine<'a> {
    metrics: &'a DerivedMetricsEngine,
}

impl<'a> ValidationEngine<'a> {
    pub fn new(metrics: &'a DerivedMetricsEngine) -> Self {
        Self { metrics }
    }

    /// Validate a raw JSON query, including structural checks the typed
    /// model would otherwise reject at parse time.
    pub fn validate_value(&self, value: &Value) -> ValidationResult {
        let mut result = ValidationResult::default();

        let Some(obj) = value.as_object() else {
            result.issues.push(ValidationIssue::error(
                IssueKind::RuleValidity,
                "query must be a JSON object",
            ));
            return result;
        };

        if !obj.contains_key("filter") {
            result.issues.push(ValidationIssue::error(
                IssueKind::RuleValidity,
                "query must contain a 'filter' field",
            ));
            return result;
        }

        let unknown = Query::unknown_keys(value);
        if !unknown.is_empty() {
            result.issues.push(
                ValidationIssue::warning(
                    IssueKind::RuleValidity,
                    format!("unknown top-level fields: {}", unknown.join(", ")),
                )
                .with_suggestion("remove unknown fields or check spelling"),
            );
        }

        match Query::from_value(value) {
            Ok(query) => {
                let typed = self.validate(&query);
                result.issues.extend(typed.issues);
                result.metadata = typed.metadata;
            }
            Err(parse) => {
                result.issues.push(
                    ValidationIssue::error(IssueKind::RuleValidity, parse.message)
                        .with_path(parse.path),
                );
            }
        }

        result
    }

    /// Validate an already-parsed query.
    ///
    /// Runs the check groups in a fixed order: filter structure, range
    /// conflicts, ambiguity, derived-metric safety, data availability.
    pub fn validate(&self, query: &Query) -> ValidationResult {
        let mut result = ValidationResult::default();
        let issues = &mut result.issues;

        if query.filter.depth() > MAX_FILTER_DEPTH {
            issues.push(ValidationIssue::error(
                IssueKind::RuleValidity,
                format!("filter nesting exceeds {} levels", MAX_FILTER_DEPTH),
            ));
            return result;
        }

        self.walk_filter(&query.filter, "filter", issues, &mut result.metadata);

        if let Some(sort) = &query.sort {
            if catalog::resolve_field(&sort.field).is_none() {
                issues.push(
                    ValidationIssue::error(
                        IssueKind::RuleValidity,
                        format!("unknown sort field: '{}'", sort.field),
                    )
                    .with_field(sort.field.clone())
                    .with_path("sort.field"),
                );
            }
        }

        self.detect_range_conflicts(&query.filter, issues);
        self.detect_missing_time_windows(&query.filter, "filter", issues);
        self.check_derived_metrics(&query.filter, "filter", issues);
        self.check_period_depth(&query.filter, "filter", issues);

        result
    }

    // ========================================================================
    // Recursive filter validation
    // ========================================================================

    fn walk_filter(
        &self,
        node: &FilterNode,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
        meta: &mut ValidationMetadata,
    ) {
        match node {
            FilterNode::And(children) => {
                meta.complexity_score += 1;
                for (i, child) in children.iter().enumerate() {
                    self.walk_filter(child, &format!("{}.and[{}]", path, i), issues, meta);
                }
            }
            FilterNode::Or(children) => {
                meta.complexity_score += 1;
                for (i, child) in children.iter().enumerate() {
                    self.walk_filter(child, &format!("{}.or[{}]", path, i), issues, meta);
                }
            }
            FilterNode::Not(child) => {
                meta.complexity_score += 2;
                self.walk_filter(child, &format!("{}.not", path), issues, meta);
            }
            FilterNode::Condition(condition) => {
                meta.condition_count += 1;
                if condition.period.is_some() || catalog::is_trend_operator(condition.operator) {
                    meta.uses_time_series = true;
                }
                if self.metrics.is_known(&condition.field) {
                    meta.uses_derived_metrics = true;
                }
                self.validate_condition(condition, path, issues);
            }
        }
    }

    fn validate_condition(
        &self,
        condition: &Condition,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        self.validate_operator(condition, path, issues);
        self.validate_value_sanity(condition, path, issues);
        if let Some(period) = &condition.period {
            self.validate_period(condition, period, path, issues);
        }
    }

    fn validate_operator(
        &self,
        condition: &Condition,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let op = condition.operator;
        let value = condition.value.as_ref();

        if catalog::requires_value(op) && value.is_none() {
            issues.push(
                ValidationIssue::error(
                    IssueKind::RuleValidity,
                    format!("operator '{}' requires a value", op),
                )
                .with_field(condition.field.clone())
                .with_path(path.to_string()),
            );
            return;
        }

        if op == Operator::Between {
            match value.and_then(Value::as_array) {
                Some(bounds) if bounds.len() == 2 => {
                    if let (Some(min), Some(max)) = (bounds[0].as_f64(), bounds[1].as_f64()) {
                        if min >= max {
                            issues.push(
                                ValidationIssue::error(
                                    IssueKind::LogicalConflict,
                                    format!(
                                        "'between' range invalid: min ({}) >= max ({})",
                                        min, max
                                    ),
                                )
                                .with_field(condition.field.clone())
                                .with_path(path.to_string())
                                .with_suggestion("ensure min < max in range"),
                            );
                        }
                    }
                }
                _ => {
                    issues.push(
                        ValidationIssue::error(
                            IssueKind::RuleValidity,
                            "'between' operator requires array of 2 values [min, max]",
                        )
                        .with_field(condition.field.clone())
                        .with_path(path.to_string()),
                    );
                }
            }
        }

        if matches!(op, Operator::In | Operator::NotIn) {
            let non_empty_array = value
                .and_then(Value::as_array)
                .map(|a| !a.is_empty())
                .unwrap_or(false);
            if !non_empty_array {
                issues.push(
                    ValidationIssue::error(
                        IssueKind::RuleValidity,
                        format!("'{}' operator requires non-empty array", op),
                    )
                    .with_field(condition.field.clone())
                    .with_path(path.to_string()),
                );
            }
        }

        if catalog::is_trend_operator(op) && condition.trend_config.is_none() {
            issues.push(
                ValidationIssue::warning(
                    IssueKind::Ambiguity,
                    format!("trend operator '{}' without trend_config - using defaults", op),
                )
                .with_field(condition.field.clone())
                .with_path(path.to_string())
                .with_suggestion("add trend_config for explicit control"),
            );
        }
    }

    fn validate_value_sanity(
        &self,
        condition: &Condition,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let Some(def) = catalog::resolve_field(&condition.field) else {
            return;
        };
        let Some(value) = condition.value.as_ref().and_then(Value::as_f64) else {
            return;
        };

        if !def.can_be_negative && value < 0.0 {
            issues.push(
                ValidationIssue::error(
                    IssueKind::LogicalConflict,
                    format!(
                        "field '{}' cannot be negative, but value is {}",
                        condition.field, value
                    ),
                )
                .with_field(condition.field.clone())
                .with_path(path.to_string()),
            );
        }

        if let Some((min, max)) = def.typical_range {
            if value < min || value > max {
                issues.push(
                    ValidationIssue::warning(
                        IssueKind::RuleValidity,
                        format!(
                            "value {} outside typical range [{}, {}] for '{}'",
                            value, min, max, condition.field
                        ),
                    )
                    .with_field(condition.field.clone())
                    .with_path(path.to_string())
                    .with_suggestion("verify this is intentional"),
                );
            }
        }
    }

    fn validate_period(
        &self,
        condition: &Condition,
        period: &crate::model::Period,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let field = &condition.field;

        let time_series_capable = catalog::resolve_field(field)
            .map(|def| def.time_series)
            .unwrap_or(false)
            || self.metrics.is_known(field);
        if !time_series_capable {
            issues.push(
                ValidationIssue::error(
                    IssueKind::DataAvailability,
                    format!("field '{}' does not support time-series queries", field),
                )
                .with_field(field.clone())
                .with_path(path.to_string())
                .with_suggestion("remove period specification or use a time-series field"),
            );
        }

        if period.n < 1 || period.n > 20 {
            issues.push(
                ValidationIssue::error(
                    IssueKind::RuleValidity,
                    format!("period 'n' must be between 1 and 20, got {}", period.n),
                )
                .with_field(field.clone())
                .with_path(format!("{}.period.n", path)),
            );
        }

        if catalog::is_trend_operator(condition.operator)
            && period.aggregation != Aggregation::Trend
        {
            issues.push(
                ValidationIssue::error(
                    IssueKind::RuleValidity,
                    format!(
                        "trend operator '{}' requires 'trend' aggregation, got '{:?}'",
                        condition.operator, period.aggregation
                    ),
                )
                .with_field(field.clone())
                .with_path(format!("{}.period.aggregation", path))
                .with_suggestion("set period.aggregation to 'trend'"),
            );
            return;
        }

        if matches!(period.aggregation, Aggregation::All | Aggregation::Any)
            && !catalog::is_temporal_comparison(condition.operator)
        {
            issues.push(
                ValidationIssue::warning(
                    IssueKind::Ambiguity,
                    format!(
                        "aggregation '{:?}' with operator '{}' may be ambiguous",
                        period.aggregation, condition.operator
                    ),
                )
                .with_field(field.clone())
                .with_path(format!("{}.period.aggregation", path)),
            );
        }
    }

    // ========================================================================
    // Unsatisfiable-range detection
    // ========================================================================

    /// Gather conditions that are conjoined: direct or nested descendants
    /// of `And` nodes only. Conditions under `Or` or `Not` do not tighten
    /// the same bound set, so they are left out.
    fn collect_conjoined<'q>(node: &'q FilterNode, out: &mut Vec<&'q Condition>) {
        match node {
            FilterNode::And(children) => {
                for child in children {
                    Self::collect_conjoined(child, out);
                }
            }
            FilterNode::Or(_) | FilterNode::Not(_) => {}
            FilterNode::Condition(condition) => out.push(condition),
        }
    }

    fn detect_range_conflicts(&self, filter: &FilterNode, issues: &mut Vec<ValidationIssue>) {
        let mut conditions = Vec::new();
        Self::collect_conjoined(filter, &mut conditions);

        // Group by field, preserving first-seen order for deterministic output.
        let mut fields: Vec<(&str, Vec<&Condition>)> = Vec::new();
        for condition in conditions {
            match fields.iter_mut().find(|(name, _)| *name == condition.field) {
                Some((_, group)) => group.push(condition),
                None => fields.push((condition.field.as_str(), vec![condition])),
            }
        }

        for (field, group) in fields {
            let mut lower: Option<f64> = None;
            let mut upper: Option<f64> = None;

            for condition in &group {
                let scalar = condition.value.as_ref().and_then(Value::as_f64);
                let bounds = condition.value.as_ref().and_then(Value::as_array);
                match condition.operator {
                    Operator::Gt | Operator::Gte => {
                        if let Some(v) = scalar {
                            lower = Some(lower.map_or(v, |cur: f64| cur.max(v)));
                        }
                    }
                    Operator::Lt | Operator::Lte => {
                        if let Some(v) = scalar {
                            upper = Some(upper.map_or(v, |cur: f64| cur.min(v)));
                        }
                    }
                    Operator::Between => {
                        if let Some(bounds) = bounds.filter(|b| b.len() == 2) {
                            if let Some(v) = bounds[0].as_f64() {
                                lower = Some(lower.map_or(v, |cur: f64| cur.max(v)));
                            }
                            if let Some(v) = bounds[1].as_f64() {
                                upper = Some(upper.map_or(v, |cur: f64| cur.min(v)));
                            }
                        }
                    }
                    _ => {}
                }
            }

            if let (Some(lower), Some(upper)) = (lower, upper) {
                if lower >= upper {
                    issues.push(
                        ValidationIssue::error(
                            IssueKind::LogicalConflict,
                            format!(
                                "unsatisfiable conditions for '{}': requires > {} AND < {}",
                                field, lower, upper
                            ),
                        )
                        .with_field(field.to_string())
                        .with_suggestion("check your range conditions - they cannot both be true"),
                    );
                }
            }
        }
    }

    // ========================================================================
    // Ambiguity detection
    // ========================================================================

    fn detect_missing_time_windows(
        &self,
        node: &FilterNode,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        self.for_each_condition(node, path, &mut |condition, path| {
            let time_series = catalog::resolve_field(&condition.field)
                .map(|def| def.time_series)
                .unwrap_or(false);
            if time_series && condition.period.is_none() {
                issues.push(
                    ValidationIssue::warning(
                        IssueKind::Ambiguity,
                        format!(
                            "time-series field '{}' used without period specification - will use latest value",
                            condition.field
                        ),
                    )
                    .with_field(condition.field.clone())
                    .with_path(path.to_string())
                    .with_suggestion("add period specification for historical analysis"),
                );
            }
        });
    }

    // ========================================================================
    // Derived-metric safety
    // ========================================================================

    fn check_derived_metrics(
        &self,
        node: &FilterNode,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        self.for_each_condition(node, path, &mut |condition, path| {
            let field = &condition.field;

            if catalog::resolve_field(field).is_none() && !self.metrics.is_known(field) {
                issues.push(
                    ValidationIssue::error(
                        IssueKind::MetricSafety,
                        format!("unknown field or derived metric: '{}'", field),
                    )
                    .with_field(field.clone())
                    .with_path(path.to_string()),
                );
                return;
            }
            if !self.metrics.is_known(field) {
                return;
            }

            // Contract check: every registered metric must expose its
            // requirements. A broken registry surfaces as an issue, not
            // a propagated error.
            if let Err(e) = self.metrics.requirements(field) {
                issues.push(ValidationIssue::error(
                    IssueKind::SystemError,
                    format!("internal validation error: {}", e),
                ));
                return;
            }

            if self.metrics.is_time_series(field) && condition.period.is_none() {
                issues.push(
                    ValidationIssue::error(
                        IssueKind::DataAvailability,
                        format!("derived metric '{}' requires period specification", field),
                    )
                    .with_field(field.clone())
                    .with_path(path.to_string())
                    .with_suggestion(format!("add period configuration for {} computation", field)),
                );
            }

            match field.as_str() {
                "peg_ratio" => {
                    issues.push(
                        ValidationIssue::info(
                            IssueKind::MetricSafety,
                            "PEG ratio computation will exclude stocks with EPS growth near zero",
                        )
                        .with_field(field.clone()),
                    );
                }
                "debt_to_fcf" => {
                    issues.push(
                        ValidationIssue::info(
                            IssueKind::MetricSafety,
                            "debt-to-FCF computation will exclude stocks with non-positive free cash flow",
                        )
                        .with_field(field.clone()),
                    );
                }
                _ => {}
            }
        });
    }

    // ========================================================================
    // Data availability
    // ========================================================================

    fn check_period_depth(
        &self,
        node: &FilterNode,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        self.for_each_condition(node, path, &mut |condition, _path| {
            if let Some(period) = &condition.period {
                if period.n > 12 {
                    issues.push(
                        ValidationIssue::warning(
                            IssueKind::DataAvailability,
                            format!(
                                "requesting {} periods - may significantly reduce result set",
                                period.n
                            ),
                        )
                        .with_field(condition.field.clone())
                        .with_suggestion(
                            "consider if all companies have this much historical data",
                        ),
                    );
                }
            }
        });
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn for_each_condition(
        &self,
        node: &FilterNode,
        path: &str,
        f: &mut dyn FnMut(&Condition, &str),
    ) {
        match node {
            FilterNode::And(children) => {
                for (i, child) in children.iter().enumerate() {
                    self.for_each_condition(child, &format!("{}.and[{}]", path, i), &mut *f);
                }
            }
            FilterNode::Or(children) => {
                for (i, child) in children.iter().enumerate() {
                    self.for_each_condition(child, &format!("{}.or[{}]", path, i), &mut *f);
                }
            }
            FilterNode::Not(child) => {
                self.for_each_condition(child, &format!("{}.not", path), &mut *f);
            }
            FilterNode::Condition(condition) => f(condition, path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(value: serde_json::Value) -> ValidationResult {
        let metrics = DerivedMetricsEngine::new();
        ValidationEngine::new(&metrics).validate_value(&value)
    }

    #[test]
    fn test_valid_simple_query() {
        let result = validate(json!({
            "filter": { "field": "pe_ratio", "operator": "<", "value": 20 }
        }));
        assert!(result.is_valid(), "issues: {:?}", result.issues);
        assert_eq!(result.metadata.condition_count, 1);
    }

    #[test]
    fn test_non_object_query() {
        let result = validate(json!([1, 2]));
        assert!(!result.is_valid());
        assert!(result.issues[0].message.contains("JSON object"));
    }

    #[test]
    fn test_missing_filter() {
        let result = validate(json!({ "limit": 5 }));
        assert!(!result.is_valid());
        assert!(result.issues[0].message.contains("'filter'"));
    }

    #[test]
    fn test_unknown_top_level_key_is_warning() {
        let result = validate(json!({
            "filter": { "field": "roe", "operator": ">", "value": 10 },
            "srot": { "field": "roe" }
        }));
        assert!(result.is_valid());
        let warning = result.warnings().next().unwrap();
        assert!(warning.message.contains("srot"));
    }

    #[test]
    fn test_between_min_ge_max() {
        let result = validate(json!({
            "filter": { "field": "pe_ratio", "operator": "between", "value": [30, 10] }
        }));
        assert!(!result.is_valid());
        let error = result.errors().next().unwrap();
        assert_eq!(error.kind, IssueKind::LogicalConflict);
    }

    #[test]
    fn test_between_wrong_shape() {
        let result = validate(json!({
            "filter": { "field": "pe_ratio", "operator": "between", "value": [10] }
        }));
        assert!(!result.is_valid());
        assert!(result.errors().next().unwrap().message.contains("2 values"));
    }

    #[test]
    fn test_in_requires_non_empty_array() {
        let result = validate(json!({
            "filter": { "field": "sector", "operator": "in", "value": [] }
        }));
        assert!(!result.is_valid());
    }

    #[test]
    fn test_missing_value() {
        let result = validate(json!({
            "filter": { "field": "pe_ratio", "operator": "<" }
        }));
        assert!(!result.is_valid());
        assert!(result.errors().next().unwrap().message.contains("requires a value"));
    }

    #[test]
    fn test_range_conflict_under_and() {
        let result = validate(json!({
            "filter": { "and": [
                { "field": "pe_ratio", "operator": ">", "value": 30 },
                { "field": "pe_ratio", "operator": "<", "value": 10 }
            ]}
        }));
        assert!(!result.is_valid());
        let conflicts: Vec<_> = result
            .errors()
            .filter(|i| i.kind == IssueKind::LogicalConflict)
            .collect();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field.as_deref(), Some("pe_ratio"));
    }

    #[test]
    fn test_no_range_conflict_under_or() {
        let result = validate(json!({
            "filter": { "or": [
                { "field": "pe_ratio", "operator": ">", "value": 30 },
                { "field": "pe_ratio", "operator": "<", "value": 10 }
            ]}
        }));
        assert!(result.is_valid(), "issues: {:?}", result.issues);
    }

    #[test]
    fn test_range_conflict_from_between_bounds() {
        let result = validate(json!({
            "filter": { "and": [
                { "field": "roe", "operator": "between", "value": [20, 40] },
                { "field": "roe", "operator": "<", "value": 10 }
            ]}
        }));
        assert!(!result.is_valid());
        assert!(result
            .errors()
            .any(|i| i.kind == IssueKind::LogicalConflict && i.message.contains("roe")));
    }

    #[test]
    fn test_negative_value_on_non_negative_field() {
        let result = validate(json!({
            "filter": { "field": "market_cap", "operator": ">", "value": -5 }
        }));
        assert!(!result.is_valid());
        assert!(result.errors().next().unwrap().message.contains("cannot be negative"));
    }

    #[test]
    fn test_typical_range_warning() {
        let result = validate(json!({
            "filter": { "field": "roe", "operator": ">", "value": 150 }
        }));
        assert!(result.is_valid());
        assert!(result
            .warnings()
            .any(|i| i.message.contains("outside typical range")));
    }

    #[test]
    fn test_time_series_field_without_period_warns() {
        let result = validate(json!({
            "filter": { "field": "net_profit", "operator": ">", "value": 0 }
        }));
        assert!(result.is_valid());
        let warning = result
            .warnings()
            .find(|i| i.kind == IssueKind::Ambiguity)
            .unwrap();
        assert!(warning.message.contains("latest value"));
    }

    #[test]
    fn test_period_on_non_time_series_field() {
        let result = validate(json!({
            "filter": {
                "field": "pe_ratio", "operator": ">", "value": 10,
                "period": { "type": "quarters", "n": 4, "aggregation": "avg" }
            }
        }));
        assert!(!result.is_valid());
        assert!(result
            .errors()
            .any(|i| i.kind == IssueKind::DataAvailability));
    }

    #[test]
    fn test_period_n_out_of_bounds() {
        let result = validate(json!({
            "filter": {
                "field": "net_profit", "operator": ">", "value": 0,
                "period": { "type": "quarters", "n": 25, "aggregation": "all" }
            }
        }));
        assert!(!result.is_valid());
        assert!(result.errors().any(|i| i.message.contains("between 1 and 20")));
    }

    #[test]
    fn test_trend_operator_with_non_trend_aggregation() {
        for aggregation in ["avg", "sum", "min", "max", "all", "any"] {
            let result = validate(json!({
                "filter": {
                    "field": "revenue", "operator": "increasing",
                    "period": { "type": "quarters", "n": 4, "aggregation": aggregation }
                }
            }));
            assert!(!result.is_valid(), "aggregation '{}' accepted", aggregation);
            assert!(
                result.errors().any(|i| i.kind == IssueKind::RuleValidity
                    && i.message.contains("'trend' aggregation")),
                "aggregation '{}': {:?}",
                aggregation,
                result.issues
            );
        }
    }

    #[test]
    fn test_deep_history_warning() {
        let result = validate(json!({
            "filter": {
                "field": "net_profit", "operator": ">", "value": 0,
                "period": { "type": "quarters", "n": 16, "aggregation": "avg" }
            }
        }));
        assert!(result
            .warnings()
            .any(|i| i.kind == IssueKind::DataAvailability && i.message.contains("16 periods")));
    }

    #[test]
    fn test_unknown_field_is_metric_safety_error() {
        let result = validate(json!({
            "filter": { "field": "sharpe_ratio", "operator": ">", "value": 1 }
        }));
        assert!(!result.is_valid());
        let error = result.errors().next().unwrap();
        assert_eq!(error.kind, IssueKind::MetricSafety);
        assert!(error.message.contains("sharpe_ratio"));
    }

    #[test]
    fn test_time_series_metric_requires_period() {
        let result = validate(json!({
            "filter": { "field": "eps_cagr", "operator": ">", "value": 10 }
        }));
        assert!(!result.is_valid());
        assert!(result
            .errors()
            .any(|i| i.kind == IssueKind::DataAvailability && i.message.contains("eps_cagr")));
    }

    #[test]
    fn test_peg_ratio_info_note() {
        let result = validate(json!({
            "filter": { "field": "peg_ratio", "operator": "<", "value": 1.5 }
        }));
        assert!(result.is_valid(), "issues: {:?}", result.issues);
        assert!(result
            .issues
            .iter()
            .any(|i| i.severity == Severity::Info && i.message.contains("EPS growth near zero")));
        assert!(result.metadata.uses_derived_metrics);
    }

    #[test]
    fn test_trend_operator_without_config_warns() {
        let result = validate(json!({
            "filter": {
                "field": "revenue", "operator": "increasing",
                "period": { "type": "quarters", "n": 4, "aggregation": "trend" }
            }
        }));
        assert!(result.is_valid(), "issues: {:?}", result.issues);
        assert!(result
            .warnings()
            .any(|i| i.message.contains("without trend_config")));
        assert!(result.metadata.uses_time_series);
    }

    #[test]
    fn test_complexity_scoring() {
        let result = validate(json!({
            "filter": { "and": [
                { "field": "pe_ratio", "operator": "<", "value": 20 },
                { "not": { "field": "sector", "operator": "=", "value": "Energy" } }
            ]}
        }));
        // and = 1, not = 2
        assert_eq!(result.metadata.complexity_score, 3);
        assert_eq!(result.metadata.condition_count, 2);
    }

    #[test]
    fn test_excessive_nesting_rejected() {
        let mut filter = json!({ "field": "roe", "operator": ">", "value": 1 });
        for _ in 0..40 {
            filter = json!({ "not": filter });
        }
        let result = validate(json!({ "filter": filter }));
        assert!(!result.is_valid());
        assert!(result.errors().next().unwrap().message.contains("nesting"));
    }

    #[test]
    fn test_unknown_sort_field() {
        let result = validate(json!({
            "filter": { "field": "roe", "operator": ">", "value": 10 },
            "sort": { "field": "made_up", "order": "desc" }
        }));
        assert!(!result.is_valid());
        assert!(result.errors().any(|i| i.message.contains("sort field")));
    }

    #[test]
    fn test_error_summary_is_terse() {
        let result = validate(json!({
            "filter": { "and": [
                { "field": "a1", "operator": ">", "value": 1 },
                { "field": "a2", "operator": ">", "value": 1 },
                { "field": "a3", "operator": ">", "value": 1 },
                { "field": "a4", "operator": ">", "value": 1 }
            ]}
        }));
        assert!(!result.is_valid());
        let summary = result.error_summary();
        // At most the first three error messages are surfaced
        assert_eq!(summary.matches(';').count(), 2, "summary: {}", summary);
    }
}
