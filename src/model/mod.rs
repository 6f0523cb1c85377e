//! Screener query data model.
//!
//! A query arrives as JSON:
//!
//! ```json
//! {
//!   "filter": {
//!     "and": [
//!       { "field": "pe_ratio", "operator": "<", "value": 20 },
//!       { "or": [
//!         { "field": "roe", "operator": ">", "value": 15 },
//!         { "field": "net_profit", "operator": ">", "value": 5000 }
//!       ]}
//!     ]
//!   },
//!   "sort": { "field": "market_cap", "order": "desc" },
//!   "limit": 50
//! }
//! ```
//!
//! The filter tree is a closed sum type: a node is exactly one of
//! `and` / `or` / `not` / condition. Anything else is a parse error,
//! never a silent fall-through to condition handling.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard ceiling on filter tree nesting. Trees beyond this depth are
/// rejected up front instead of risking unbounded recursion.
pub const MAX_FILTER_DEPTH: usize = 32;

// ============================================================================
// Filter tree
// ============================================================================

/// A node in the filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    /// Conjunction of one or more child nodes.
    And(Vec<FilterNode>),
    /// Disjunction of one or more child nodes.
    Or(Vec<FilterNode>),
    /// Negation of a single child node.
    Not(Box<FilterNode>),
    /// A field/operator/value leaf.
    Condition(Condition),
}

/// A structural problem found while interpreting a filter node.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct ParseIssue {
    /// JSON path to the offending node, e.g. `filter.and[1].or[0]`.
    pub path: String,
    pub message: String,
}

impl ParseIssue {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl FilterNode {
    /// Interpret a JSON value as a filter node.
    ///
    /// Dispatch is on the node's shape: a `and` / `or` / `not` key makes
    /// it a combinator, a `field` key makes it a condition. A node that
    /// mixes combinator keys, or matches neither shape, is rejected.
    pub fn from_value(value: &Value, path: &str) -> Result<FilterNode, ParseIssue> {
        let obj = value
            .as_object()
            .ok_or_else(|| ParseIssue::new(path, "filter node must be a JSON object"))?;

        let combinators: Vec<&str> = ["and", "or", "not"]
            .into_iter()
            .filter(|k| obj.contains_key(*k))
            .collect();
        if combinators.len() > 1 {
            return Err(ParseIssue::new(
                path,
                format!(
                    "filter node mixes combinator keys: {}",
                    combinators.join(", ")
                ),
            ));
        }

        if let Some(children) = obj.get("and") {
            return Self::combinator_children(children, path, "and").map(FilterNode::And);
        }
        if let Some(children) = obj.get("or") {
            return Self::combinator_children(children, path, "or").map(FilterNode::Or);
        }
        if let Some(child) = obj.get("not") {
            let inner = Self::from_value(child, &format!("{}.not", path))?;
            return Ok(FilterNode::Not(Box::new(inner)));
        }
        if obj.contains_key("field") {
            return Condition::from_value(value, path).map(FilterNode::Condition);
        }

        Err(ParseIssue::new(
            path,
            "unrecognized filter node: expected 'and', 'or', 'not' or a condition with 'field'",
        ))
    }

    fn combinator_children(
        children: &Value,
        path: &str,
        key: &str,
    ) -> Result<Vec<FilterNode>, ParseIssue> {
        let list = children.as_array().ok_or_else(|| {
            ParseIssue::new(path, format!("'{}' requires an array of child nodes", key))
        })?;
        if list.is_empty() {
            return Err(ParseIssue::new(
                path,
                format!("'{}' requires at least one child node", key),
            ));
        }
        list.iter()
            .enumerate()
            .map(|(i, child)| Self::from_value(child, &format!("{}.{}[{}]", path, key, i)))
            .collect()
    }

    /// Maximum nesting depth of this tree (a lone condition has depth 1).
    pub fn depth(&self) -> usize {
        match self {
            FilterNode::And(children) | FilterNode::Or(children) => {
                1 + children.iter().map(FilterNode::depth).max().unwrap_or(0)
            }
            FilterNode::Not(child) => 1 + child.depth(),
            FilterNode::Condition(_) => 1,
        }
    }
}

impl<'de> Deserialize<'de> for FilterNode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        FilterNode::from_value(&value, "filter").map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// A single field/operator/value leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    /// Scalar, 2-element range or list depending on the operator.
    pub value: Option<Value>,
    pub period: Option<Period>,
    pub null_handling: Option<NullHandling>,
    pub trend_config: Option<TrendConfig>,
}

impl Condition {
    fn from_value(value: &Value, path: &str) -> Result<Condition, ParseIssue> {
        let obj = value
            .as_object()
            .ok_or_else(|| ParseIssue::new(path, "condition must be a JSON object"))?;

        let field = obj
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseIssue::new(path, "condition 'field' must be a string"))?
            .to_string();

        let operator_token = obj
            .get("operator")
            .ok_or_else(|| ParseIssue::new(path, "condition missing 'operator' property"))?;
        let operator: Operator = serde_json::from_value(operator_token.clone())
            .map_err(|_| ParseIssue::new(path, format!("unknown operator: {}", operator_token)))?;

        let period = match obj.get("period") {
            Some(p) => Some(serde_json::from_value::<Period>(p.clone()).map_err(|e| {
                ParseIssue::new(&format!("{}.period", path), format!("invalid period: {}", e))
            })?),
            None => None,
        };

        let null_handling = match obj.get("null_handling") {
            Some(n) => Some(serde_json::from_value::<NullHandling>(n.clone()).map_err(|e| {
                ParseIssue::new(
                    &format!("{}.null_handling", path),
                    format!("invalid null_handling: {}", e),
                )
            })?),
            None => None,
        };

        let trend_config = match obj.get("trend_config") {
            Some(t) => Some(serde_json::from_value::<TrendConfig>(t.clone()).map_err(|e| {
                ParseIssue::new(
                    &format!("{}.trend_config", path),
                    format!("invalid trend_config: {}", e),
                )
            })?),
            None => None,
        };

        Ok(Condition {
            field,
            operator,
            value: obj.get("value").cloned(),
            period,
            null_handling,
            trend_config,
        })
    }
}

/// The fixed operator vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "exists")]
    Exists,
    #[serde(rename = "increasing")]
    Increasing,
    #[serde(rename = "decreasing")]
    Decreasing,
    #[serde(rename = "stable")]
    Stable,
}

impl Operator {
    /// The DSL token for this operator.
    pub fn token(&self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Lte => "<=",
            Operator::Gte => ">=",
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Between => "between",
            Operator::Exists => "exists",
            Operator::Increasing => "increasing",
            Operator::Decreasing => "decreasing",
            Operator::Stable => "stable",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

// ============================================================================
// Condition attributes
// ============================================================================

/// Time window over the most recent `n` reporting periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Period {
    /// Period unit, e.g. "quarters". Kept verbatim; only quarterly data
    /// is stored today.
    #[serde(rename = "type")]
    pub period_type: String,
    pub n: i64,
    pub aggregation: Aggregation,
}

/// How values within a period window are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    All,
    Any,
    Avg,
    Sum,
    Min,
    Max,
    Trend,
}

/// Policy for rows where the compared column is NULL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullHandling {
    pub strategy: NullStrategy,
    #[serde(default)]
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullStrategy {
    Exclude,
    Fail,
    UseDefault,
    UseLatest,
}

/// Direction requirement for trend conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendConfig {
    pub direction: TrendDirection,
    #[serde(default = "TrendConfig::default_min_periods")]
    pub min_periods: i64,
}

impl TrendConfig {
    fn default_min_periods() -> i64 {
        2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

// ============================================================================
// Query envelope
// ============================================================================

/// A full screening query: mandatory filter plus optional trimmings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Query {
    pub filter: FilterNode,
    #[serde(default)]
    pub meta: Option<Meta>,
    #[serde(default)]
    pub sort: Option<Sort>,
    #[serde(default)]
    pub limit: Option<u64>,
}

/// Company-level metadata filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub market_cap_category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl Query {
    /// Interpret a JSON value as a query.
    ///
    /// The top-level keys the query understands; anything else is
    /// tolerated here and reported as a warning by validation.
    pub const KNOWN_KEYS: [&'static str; 4] = ["filter", "meta", "sort", "limit"];

    pub fn from_value(value: &Value) -> Result<Query, ParseIssue> {
        let obj = value
            .as_object()
            .ok_or_else(|| ParseIssue::new("$", "query must be a JSON object"))?;

        let filter_value = obj
            .get("filter")
            .ok_or_else(|| ParseIssue::new("$", "query must contain a 'filter' field"))?;
        let filter = FilterNode::from_value(filter_value, "filter")?;

        let meta = match obj.get("meta") {
            Some(m) => Some(
                serde_json::from_value::<Meta>(m.clone())
                    .map_err(|e| ParseIssue::new("meta", format!("invalid meta: {}", e)))?,
            ),
            None => None,
        };
        let sort = match obj.get("sort") {
            Some(s) => Some(
                serde_json::from_value::<Sort>(s.clone())
                    .map_err(|e| ParseIssue::new("sort", format!("invalid sort: {}", e)))?,
            ),
            None => None,
        };
        let limit = match obj.get("limit") {
            Some(l) => Some(l.as_u64().ok_or_else(|| {
                ParseIssue::new("limit", "limit must be a non-negative integer")
            })?),
            None => None,
        };

        Ok(Query {
            filter,
            meta,
            sort,
            limit,
        })
    }

    /// Top-level keys in `value` that the query model does not know about.
    pub fn unknown_keys(value: &Value) -> Vec<String> {
        match value.as_object() {
            Some(obj) => obj
                .keys()
                .filter(|k| !Self::KNOWN_KEYS.contains(&k.as_str()))
                .cloned()
                .collect(),
            None => vec![],
        }
    }
}
