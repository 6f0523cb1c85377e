//! End-to-end compilation from a screening query to parameterized SQL.
//!
//! This module provides the high-level API for turning a JSON screen
//! into an executable statement:
//!
//! ```text
//! JSON Query → Parse → Validate → Filter Tree → TokenStream → SQL + params
//! ```
//!
//! # Example
//!
//! ```ignore
//! use screener::compile::{CompileOptions, ScreenCompiler};
//! use serde_json::json;
//!
//! let compiler = ScreenCompiler::new(CompileOptions::default());
//! let output = compiler.compile_value(&json!({
//!     "filter": {
//!         "and": [
//!             { "field": "pe_ratio", "operator": "<", "value": 20 },
//!             { "field": "roe", "operator": ">", "value": 15 }
//!         ]
//!     },
//!     "limit": 50
//! }))?;
//! println!("{}", output.sql);
//! ```
//!
//! Literal values never reach the SQL text: every one is bound as a
//! named `:pN` parameter, numbered in first-bound order. The compiler
//! holds no per-request state, so one instance can serve any number of
//! sequential or concurrent compilations.

mod context;
mod temporal;

pub use context::{CompileContext, CompileMetadata, ParamValue};

use serde::Serialize;
use serde_json::Value;

use crate::catalog::{self, SourceTable};
use crate::metrics::DerivedMetricsEngine;
use crate::model::{
    Condition, FilterNode, NullStrategy, Operator, ParseIssue, Query, SortOrder,
    MAX_FILTER_DEPTH,
};
use crate::sql::{Token, TokenStream};
use crate::validation::ValidationEngine;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during compilation.
///
/// Validation findings are not errors; a query that validates but
/// cannot be translated (or that skipped validation) surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum CompilerError {
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("invalid query: {0}")]
    InvalidQuery(#[from] ParseIssue),

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("field '{0}' does not support time-series queries")]
    NotTimeSeries(String),

    #[error("operator '{operator}' requires a value for field '{field}'")]
    MissingValue { field: String, operator: Operator },

    #[error("invalid value for field '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("trend operator on '{0}' requires a period specification")]
    MissingPeriod(String),

    #[error("filter nesting exceeds {0} levels")]
    FilterTooDeep(usize),
}

pub type CompileResult<T> = Result<T, CompilerError>;

// ============================================================================
// Options
// ============================================================================

/// Options for compilation.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Run the validation engine before translating. On by default;
    /// turning it off still keeps the compiler's own hard checks.
    pub validate: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { validate: true }
    }
}

impl CompileOptions {
    pub fn skip_validation(mut self) -> Self {
        self.validate = false;
        self
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Result of compiling a screening query.
#[derive(Debug, Clone, Serialize)]
pub struct CompileOutput {
    /// The generated SQL string.
    pub sql: String,

    /// Named bind parameters in first-bound order.
    pub params: Vec<(String, ParamValue)>,

    /// What the compilation used and what the caller still owes.
    pub metadata: CompileMetadata,
}

// ============================================================================
// Compiler
// ============================================================================

/// The screening query compiler.
///
/// Owns only static engines and options. All per-request state lives in
/// a [`CompileContext`] created inside each call.
#[derive(Debug, Clone, Default)]
pub struct ScreenCompiler {
    metrics: DerivedMetricsEngine,
    options: CompileOptions,
}

impl ScreenCompiler {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            metrics: DerivedMetricsEngine::new(),
            options,
        }
    }

    /// Compile a raw JSON query, validating first unless disabled.
    pub fn compile_value(&self, value: &Value) -> CompileResult<CompileOutput> {
        if self.options.validate {
            let validation = ValidationEngine::new(&self.metrics).validate_value(value);
            if !validation.is_valid() {
                return Err(CompilerError::ValidationFailed(validation.error_summary()));
            }
            for warning in validation.warnings() {
                tracing::debug!(warning = %warning, "validation warning");
            }
        }
        let query = Query::from_value(value)?;
        self.compile(&query)
    }

    /// Compile an already-parsed query.
    pub fn compile(&self, query: &Query) -> CompileResult<CompileOutput> {
        if query.filter.depth() > MAX_FILTER_DEPTH {
            return Err(CompilerError::FilterTooDeep(MAX_FILTER_DEPTH));
        }

        let mut ctx = CompileContext::new();
        let mut where_clause = self.compile_node(&query.filter, &mut ctx)?;

        if let Some(meta) = &query.meta {
            for clause in self.compile_meta(meta, &mut ctx) {
                where_clause.space().push(Token::And).space().append(&clause);
            }
        }

        let mut stream = base_select();
        stream
            .space()
            .push(Token::Where)
            .space()
            .append(&where_clause);

        if let Some(sort) = &query.sort {
            let def = catalog::resolve_field(&sort.field)
                .ok_or_else(|| CompilerError::UnknownField(sort.field.clone()))?;
            stream
                .space()
                .push(Token::OrderBy)
                .space()
                .push(def.qualified())
                .space()
                .push(match sort.order {
                    SortOrder::Asc => Token::Asc,
                    SortOrder::Desc => Token::Desc,
                });
        }

        let limit = query.limit.unwrap_or(100).min(i64::MAX as u64) as i64;
        stream
            .space()
            .push(Token::Limit)
            .space()
            .push(Token::LitInt(limit));

        let sql = stream.serialize();
        let (params, metadata) = ctx.into_params();
        Ok(CompileOutput {
            sql,
            params,
            metadata,
        })
    }

    // ========================================================================
    // Filter tree
    // ========================================================================

    fn compile_node(
        &self,
        node: &FilterNode,
        ctx: &mut CompileContext,
    ) -> CompileResult<TokenStream> {
        match node {
            FilterNode::And(children) => {
                ctx.metadata.complexity_score += 1;
                self.compile_junction(children, Token::And, ctx)
            }
            FilterNode::Or(children) => {
                ctx.metadata.complexity_score += 1;
                self.compile_junction(children, Token::Or, ctx)
            }
            FilterNode::Not(child) => {
                ctx.metadata.complexity_score += 2;
                let inner = self.compile_node(child, ctx)?;
                let mut ts = TokenStream::new();
                ts.push(Token::Not).space().lparen().append(&inner).rparen();
                Ok(ts)
            }
            FilterNode::Condition(condition) => self.compile_condition(condition, ctx),
        }
    }

    fn compile_junction(
        &self,
        children: &[FilterNode],
        junction: Token,
        ctx: &mut CompileContext,
    ) -> CompileResult<TokenStream> {
        let mut ts = TokenStream::new();
        ts.lparen();
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                ts.space().push(junction.clone()).space();
            }
            ts.append(&self.compile_node(child, ctx)?);
        }
        ts.rparen();
        Ok(ts)
    }

    fn compile_condition(
        &self,
        condition: &Condition,
        ctx: &mut CompileContext,
    ) -> CompileResult<TokenStream> {
        if self.metrics.is_known(&condition.field) {
            return self.compile_derived(condition, ctx);
        }

        let def = catalog::resolve_field(&condition.field)
            .ok_or_else(|| CompilerError::UnknownField(condition.field.clone()))?;

        if let Some(period) = &condition.period {
            if !def.time_series {
                return Err(CompilerError::NotTimeSeries(condition.field.clone()));
            }
            return temporal::compile_temporal(condition, period, def, ctx);
        }

        if catalog::is_trend_operator(condition.operator) {
            return Err(CompilerError::MissingPeriod(condition.field.clone()));
        }

        self.compile_plain(condition, ctx)
    }

    // ========================================================================
    // Plain conditions and null handling
    // ========================================================================

    fn compile_plain(
        &self,
        condition: &Condition,
        ctx: &mut CompileContext,
    ) -> CompileResult<TokenStream> {
        let def = catalog::resolve_field(&condition.field)
            .ok_or_else(|| CompilerError::UnknownField(condition.field.clone()))?;
        let column = def.qualified();

        let strategy = condition.null_handling.as_ref().map(|nh| nh.strategy);
        match strategy {
            None => {
                let mut lhs = TokenStream::new();
                lhs.push(column);
                self.apply_operator(lhs, condition, ctx)
            }
            Some(NullStrategy::UseDefault) => {
                let default = condition
                    .null_handling
                    .as_ref()
                    .and_then(|nh| nh.default_value.as_ref())
                    .and_then(ParamValue::from_json)
                    .unwrap_or(ParamValue::Int(0));
                let default_param = ctx.bind(default);

                let mut lhs = TokenStream::new();
                lhs.push(Token::FunctionName("coalesce"))
                    .lparen()
                    .push(column)
                    .comma()
                    .space()
                    .push(default_param)
                    .rparen();
                self.apply_operator(lhs, condition, ctx)
            }
            Some(NullStrategy::Exclude | NullStrategy::Fail | NullStrategy::UseLatest) => {
                if strategy == Some(NullStrategy::UseLatest) {
                    tracing::warn!(
                        field = %condition.field,
                        "use_latest null handling degrades to exclude"
                    );
                }
                let mut lhs = TokenStream::new();
                lhs.push(column.clone());
                let inner = self.apply_operator(lhs, condition, ctx)?;

                let mut ts = TokenStream::new();
                ts.lparen()
                    .push(column)
                    .space()
                    .push(Token::IsNotNull)
                    .space()
                    .push(Token::And)
                    .space()
                    .append(&inner)
                    .rparen();
                Ok(ts)
            }
        }
    }

    /// Apply `condition.operator` to an already-built left-hand side.
    fn apply_operator(
        &self,
        lhs: TokenStream,
        condition: &Condition,
        ctx: &mut CompileContext,
    ) -> CompileResult<TokenStream> {
        let mut ts = lhs;
        match condition.operator {
            Operator::Exists => {
                // A missing or falsy value asks for absence.
                let wants_present = match condition.value.as_ref() {
                    None | Some(Value::Null) => false,
                    Some(Value::Bool(b)) => *b,
                    Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                    Some(Value::String(s)) => !s.is_empty(),
                    Some(Value::Array(a)) => !a.is_empty(),
                    Some(Value::Object(o)) => !o.is_empty(),
                };
                ts.space().push(if wants_present {
                    Token::IsNotNull
                } else {
                    Token::IsNull
                });
                Ok(ts)
            }
            Operator::In | Operator::NotIn => {
                let items = self.require_array(condition)?;
                if items.is_empty() {
                    return Err(CompilerError::InvalidValue {
                        field: condition.field.clone(),
                        message: format!(
                            "'{}' operator requires non-empty array",
                            condition.operator
                        ),
                    });
                }
                let param = self.bind_value(condition, &Value::Array(items.to_vec()), ctx)?;
                ts.space();
                if condition.operator == Operator::NotIn {
                    ts.push(Token::Not).space();
                }
                ts.push(Token::In).space().lparen().push(param).rparen();
                Ok(ts)
            }
            Operator::Between => {
                let items = self.require_array(condition)?;
                let bounds = match (items.first().and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
                    (Some(low), Some(high)) if items.len() == 2 => (low, high),
                    _ => {
                        return Err(CompilerError::InvalidValue {
                            field: condition.field.clone(),
                            message: "'between' operator requires array of 2 numeric values"
                                .to_string(),
                        })
                    }
                };
                if bounds.0 >= bounds.1 {
                    return Err(CompilerError::InvalidValue {
                        field: condition.field.clone(),
                        message: format!(
                            "'between' range invalid: min ({}) >= max ({})",
                            bounds.0, bounds.1
                        ),
                    });
                }
                let low = self.bind_value(condition, &items[0], ctx)?;
                let high = self.bind_value(condition, &items[1], ctx)?;
                ts.space()
                    .push(Token::Between)
                    .space()
                    .push(low)
                    .space()
                    .push(Token::And)
                    .space()
                    .push(high);
                Ok(ts)
            }
            Operator::Increasing | Operator::Decreasing | Operator::Stable => {
                Err(CompilerError::MissingPeriod(condition.field.clone()))
            }
            _ => {
                let symbol = catalog::relational_symbol(condition.operator).ok_or_else(|| {
                    CompilerError::InvalidValue {
                        field: condition.field.clone(),
                        message: format!("operator '{}' has no relational form", condition.operator),
                    }
                })?;
                let value = condition
                    .value
                    .as_ref()
                    .ok_or_else(|| CompilerError::MissingValue {
                        field: condition.field.clone(),
                        operator: condition.operator,
                    })?;
                let param = self.bind_value(condition, value, ctx)?;
                ts.space().push(symbol).space().push(param);
                Ok(ts)
            }
        }
    }

    fn require_array<'v>(&self, condition: &'v Condition) -> CompileResult<&'v Vec<Value>> {
        condition
            .value
            .as_ref()
            .and_then(Value::as_array)
            .ok_or_else(|| CompilerError::InvalidValue {
                field: condition.field.clone(),
                message: format!("'{}' operator requires an array value", condition.operator),
            })
    }

    fn bind_value(
        &self,
        condition: &Condition,
        value: &Value,
        ctx: &mut CompileContext,
    ) -> CompileResult<Token> {
        let param = ParamValue::from_json(value).ok_or_else(|| CompilerError::InvalidValue {
            field: condition.field.clone(),
            message: format!("value {} cannot be bound as a parameter", value),
        })?;
        Ok(ctx.bind(param))
    }

    // ========================================================================
    // Derived metrics
    // ========================================================================

    fn compile_derived(
        &self,
        condition: &Condition,
        ctx: &mut CompileContext,
    ) -> CompileResult<TokenStream> {
        ctx.metadata.uses_derived_metrics = true;
        if condition.period.is_some() {
            ctx.metadata.uses_time_series = true;
        }

        match self.metrics.sql_expression(&condition.field) {
            Some(expr) => {
                let mut lhs = TokenStream::new();
                lhs.lparen().push(Token::Raw(expr)).rparen();
                self.apply_operator(lhs, condition, ctx)
            }
            None => {
                // CAGR variants and the consistency score have no inline
                // SQL form; the caller applies them after row retrieval.
                ctx.post_filter(&condition.field);
                tracing::warn!(
                    field = %condition.field,
                    "derived metric deferred to post-filtering"
                );
                let mut ts = TokenStream::new();
                ts.push(Token::LitInt(1))
                    .space()
                    .push(Token::Eq)
                    .space()
                    .push(Token::LitInt(1));
                Ok(ts)
            }
        }
    }

    // ========================================================================
    // Meta filters
    // ========================================================================

    fn compile_meta(
        &self,
        meta: &crate::model::Meta,
        ctx: &mut CompileContext,
    ) -> Vec<TokenStream> {
        let mut clauses = Vec::new();

        if let Some(sector) = &meta.sector {
            clauses.push(meta_equality("sector", sector, ctx));
        }
        if let Some(exchange) = &meta.exchange {
            clauses.push(meta_equality("exchange", exchange, ctx));
        }
        if meta.market_cap_category.is_some() {
            // No category-to-bounds mapping exists yet; ingestion does
            // not tag companies with a cap bucket.
            tracing::debug!("market_cap_category filter not supported, ignoring");
        }

        clauses
    }
}

fn meta_equality(column: &str, value: &str, ctx: &mut CompileContext) -> TokenStream {
    let param = ctx.bind(ParamValue::Text(value.to_string()));
    let mut ts = TokenStream::new();
    ts.push(Token::Qualified {
        table: SourceTable::Companies.alias().into(),
        column: column.into(),
    })
    .space()
    .push(Token::Eq)
    .space()
    .push(param);
    ts
}

/// The fixed projection and join every screen runs against.
fn base_select() -> TokenStream {
    let projection: [(&str, &str); 8] = [
        ("c", "symbol"),
        ("c", "name"),
        ("c", "sector"),
        ("c", "market_cap"),
        ("fq", "pe_ratio"),
        ("fq", "roe"),
        ("fq", "net_income"),
        ("fq", "revenue"),
    ];

    let mut ts = TokenStream::new();
    ts.push(Token::Select).space().push(Token::Distinct).space();
    for (i, (table, column)) in projection.iter().enumerate() {
        if i > 0 {
            ts.comma().space();
        }
        ts.push(Token::Qualified {
            table: (*table).into(),
            column: (*column).into(),
        });
    }
    ts.space()
        .push(Token::From)
        .space()
        .push(Token::Ident(SourceTable::Companies.name().into()))
        .space()
        .push(Token::Ident(SourceTable::Companies.alias().into()))
        .space()
        .push(Token::Left)
        .space()
        .push(Token::Join)
        .space()
        .push(Token::Ident(SourceTable::Fundamentals.name().into()))
        .space()
        .push(Token::Ident(SourceTable::Fundamentals.alias().into()))
        .space()
        .push(Token::On)
        .space()
        .push(Token::Qualified {
            table: "c".into(),
            column: "symbol".into(),
        })
        .space()
        .push(Token::Eq)
        .space()
        .push(Token::Qualified {
            table: "fq".into(),
            column: "symbol".into(),
        });
    ts
}
