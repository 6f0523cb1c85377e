//! Temporal condition compilation.
//!
//! Conditions carrying a `period` compile to correlated subqueries over
//! `fundamentals_quarterly` under the alias `fq2`, scoped to the outer
//! company and windowed to the most recent reporting quarters:
//!
//! ```text
//! fq2.symbol = c.symbol
//! AND fq2.quarter >= (SELECT MAX(quarter) - n FROM fundamentals_quarterly
//!                     WHERE symbol = c.symbol)
//! ```
//!
//! `all` counts matching rows, `any` uses EXISTS, the numeric
//! aggregations compare an aggregated subquery, and `trend` compares
//! successive rows through LAG.

use crate::catalog::{self, FieldDef, SourceTable};
use crate::model::{Aggregation, Condition, Operator, Period, TrendDirection};
use crate::sql::{Token, TokenStream};

use super::context::{CompileContext, ParamValue};
use super::CompilerError;

/// How far successive values may drift and still count as "stable",
/// as a fraction of the previous value.
const STABLE_TOLERANCE: f64 = 0.02;

const WINDOW_ALIAS: &str = "fq2";

pub(super) fn compile_temporal(
    condition: &Condition,
    period: &Period,
    def: &FieldDef,
    ctx: &mut CompileContext,
) -> Result<TokenStream, CompilerError> {
    ctx.metadata.uses_time_series = true;

    match period.aggregation {
        Aggregation::All => compile_count_all(condition, period, def, ctx),
        Aggregation::Any => compile_exists_any(condition, period, def, ctx),
        Aggregation::Avg => compile_aggregate("avg", condition, period, def, ctx),
        Aggregation::Sum => compile_aggregate("sum", condition, period, def, ctx),
        Aggregation::Min => compile_aggregate("min", condition, period, def, ctx),
        Aggregation::Max => compile_aggregate("max", condition, period, def, ctx),
        Aggregation::Trend => compile_trend(condition, period, def),
    }
}

// ============================================================================
// Window plumbing
// ============================================================================

/// `(SELECT MAX(quarter) - <periods_back> FROM fundamentals_quarterly
///  WHERE symbol = c.symbol)`
fn window_floor(periods_back: i64) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.lparen()
        .push(Token::Select)
        .space()
        .push(Token::FunctionName("max"))
        .lparen()
        .push(Token::Ident("quarter".into()))
        .rparen()
        .space()
        .push(Token::Minus)
        .space()
        .push(Token::LitInt(periods_back))
        .space()
        .push(Token::From)
        .space()
        .push(Token::Ident(SourceTable::Fundamentals.name().into()))
        .space()
        .push(Token::Where)
        .space()
        .push(Token::Ident("symbol".into()))
        .space()
        .push(Token::Eq)
        .space()
        .push(qualified("c", "symbol"))
        .rparen();
    ts
}

/// `fq2.symbol = c.symbol AND fq2.quarter >= <floor>`
fn window_scope(periods_back: i64) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.push(qualified(WINDOW_ALIAS, "symbol"))
        .space()
        .push(Token::Eq)
        .space()
        .push(qualified("c", "symbol"))
        .space()
        .push(Token::And)
        .space()
        .push(qualified(WINDOW_ALIAS, "quarter"))
        .space()
        .push(Token::Gte)
        .space()
        .append(&window_floor(periods_back));
    ts
}

/// `FROM fundamentals_quarterly fq2 WHERE <scope>`
fn window_from(periods_back: i64) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.push(Token::From)
        .space()
        .push(Token::Ident(SourceTable::Fundamentals.name().into()))
        .space()
        .push(Token::Ident(WINDOW_ALIAS.into()))
        .space()
        .push(Token::Where)
        .space()
        .append(&window_scope(periods_back));
    ts
}

fn qualified(table: &str, column: &str) -> Token {
    Token::Qualified {
        table: table.into(),
        column: column.into(),
    }
}

/// The inner row predicate `fq2.<col> <op> :pN` used by `all` and `any`.
fn row_predicate(
    condition: &Condition,
    def: &FieldDef,
    ctx: &mut CompileContext,
) -> Result<TokenStream, CompilerError> {
    let symbol = relational_or_err(condition)?;
    let param = bind_scalar(condition, ctx)?;

    let mut ts = TokenStream::new();
    ts.push(def.column_at(WINDOW_ALIAS))
        .space()
        .push(symbol)
        .space()
        .push(param);
    Ok(ts)
}

fn relational_or_err(condition: &Condition) -> Result<Token, CompilerError> {
    catalog::relational_symbol(condition.operator).ok_or_else(|| CompilerError::InvalidValue {
        field: condition.field.clone(),
        message: format!(
            "operator '{}' is not supported inside a period window",
            condition.operator
        ),
    })
}

fn bind_scalar(condition: &Condition, ctx: &mut CompileContext) -> Result<Token, CompilerError> {
    let value = condition
        .value
        .as_ref()
        .ok_or_else(|| CompilerError::MissingValue {
            field: condition.field.clone(),
            operator: condition.operator,
        })?;
    let param = ParamValue::from_json(value).ok_or_else(|| CompilerError::InvalidValue {
        field: condition.field.clone(),
        message: format!("value {} cannot be bound as a parameter", value),
    })?;
    Ok(ctx.bind(param))
}

// ============================================================================
// Aggregation forms
// ============================================================================

/// `(SELECT COUNT(*) FROM ... WHERE <scope> AND <pred>) = n`
fn compile_count_all(
    condition: &Condition,
    period: &Period,
    def: &FieldDef,
    ctx: &mut CompileContext,
) -> Result<TokenStream, CompilerError> {
    let predicate = row_predicate(condition, def, ctx)?;

    let mut ts = TokenStream::new();
    ts.lparen()
        .push(Token::Select)
        .space()
        .push(Token::FunctionName("count"))
        .lparen()
        .push(Token::Star)
        .rparen()
        .space()
        .append(&window_from(period.n))
        .space()
        .push(Token::And)
        .space()
        .append(&predicate)
        .rparen()
        .space()
        .push(Token::Eq)
        .space()
        .push(Token::LitInt(period.n));
    Ok(ts)
}

/// `EXISTS (SELECT 1 FROM ... WHERE <scope> AND <pred>)`
fn compile_exists_any(
    condition: &Condition,
    period: &Period,
    def: &FieldDef,
    ctx: &mut CompileContext,
) -> Result<TokenStream, CompilerError> {
    let predicate = row_predicate(condition, def, ctx)?;

    let mut ts = TokenStream::new();
    ts.push(Token::Exists)
        .space()
        .lparen()
        .push(Token::Select)
        .space()
        .push(Token::LitInt(1))
        .space()
        .append(&window_from(period.n))
        .space()
        .push(Token::And)
        .space()
        .append(&predicate)
        .rparen();
    Ok(ts)
}

/// `(SELECT AGG(fq2.<col>) FROM ... WHERE <scope>) <op> :pN`
fn compile_aggregate(
    function: &'static str,
    condition: &Condition,
    period: &Period,
    def: &FieldDef,
    ctx: &mut CompileContext,
) -> Result<TokenStream, CompilerError> {
    let symbol = relational_or_err(condition)?;
    let param = bind_scalar(condition, ctx)?;

    let mut ts = TokenStream::new();
    ts.lparen()
        .push(Token::Select)
        .space()
        .push(Token::FunctionName(function))
        .lparen()
        .push(def.column_at(WINDOW_ALIAS))
        .rparen()
        .space()
        .append(&window_from(period.n))
        .rparen()
        .space()
        .push(symbol)
        .space()
        .push(param);
    Ok(ts)
}

// ============================================================================
// Trend
// ============================================================================

fn trend_direction(condition: &Condition) -> TrendDirection {
    if let Some(config) = &condition.trend_config {
        return config.direction;
    }
    match condition.operator {
        Operator::Decreasing => TrendDirection::Decreasing,
        Operator::Stable => TrendDirection::Stable,
        _ => TrendDirection::Increasing,
    }
}

/// `t.value <cmp> t.prev_value`, or the tolerance band for `stable`.
fn pair_predicate(direction: TrendDirection) -> TokenStream {
    let mut ts = TokenStream::new();
    match direction {
        TrendDirection::Increasing | TrendDirection::Decreasing => {
            let cmp = if direction == TrendDirection::Increasing {
                Token::Gt
            } else {
                Token::Lt
            };
            ts.push(qualified("t", "value"))
                .space()
                .push(cmp)
                .space()
                .push(qualified("t", "prev_value"));
        }
        TrendDirection::Stable => {
            // ABS(t.value - t.prev_value) <= ABS(t.prev_value) * 0.02
            ts.push(Token::FunctionName("abs"))
                .lparen()
                .push(qualified("t", "value"))
                .space()
                .push(Token::Minus)
                .space()
                .push(qualified("t", "prev_value"))
                .rparen()
                .space()
                .push(Token::Lte)
                .space()
                .push(Token::FunctionName("abs"))
                .lparen()
                .push(qualified("t", "prev_value"))
                .rparen()
                .space()
                .push(Token::Star)
                .space()
                .push(Token::LitFloat(STABLE_TOLERANCE));
        }
    }
    ts
}

/// Pairwise successor comparison over the most recent `min_periods` rows.
///
/// Each row is compared against its predecessor via LAG; the condition
/// holds when every adjacent pair satisfies the direction, i.e. the
/// satisfied-pair count reaches `min_periods - 1`.
fn compile_trend(
    condition: &Condition,
    period: &Period,
    def: &FieldDef,
) -> Result<TokenStream, CompilerError> {
    let min_periods = condition
        .trend_config
        .as_ref()
        .map(|config| config.min_periods)
        .unwrap_or(period.n)
        .max(2);
    let pairs = min_periods - 1;
    let direction = trend_direction(condition);

    // SELECT fq2.<col> AS value, LAG(fq2.<col>) OVER (ORDER BY fq2.quarter)
    // AS prev_value FROM ... WHERE <scope over min_periods rows>
    let mut inner = TokenStream::new();
    inner
        .push(Token::Select)
        .space()
        .push(def.column_at(WINDOW_ALIAS))
        .space()
        .push(Token::As)
        .space()
        .push(Token::Ident("value".into()))
        .comma()
        .space()
        .push(Token::FunctionName("lag"))
        .lparen()
        .push(def.column_at(WINDOW_ALIAS))
        .rparen()
        .space()
        .push(Token::Over)
        .space()
        .lparen()
        .push(Token::OrderBy)
        .space()
        .push(qualified(WINDOW_ALIAS, "quarter"))
        .rparen()
        .space()
        .push(Token::As)
        .space()
        .push(Token::Ident("prev_value".into()))
        .space()
        .append(&window_from(pairs));

    let mut ts = TokenStream::new();
    ts.lparen()
        .push(Token::Select)
        .space()
        .push(Token::FunctionName("count"))
        .lparen()
        .push(Token::Star)
        .rparen()
        .space()
        .push(Token::From)
        .space()
        .lparen()
        .append(&inner)
        .rparen()
        .space()
        .push(Token::Ident("t".into()))
        .space()
        .push(Token::Where)
        .space()
        .push(qualified("t", "prev_value"))
        .space()
        .push(Token::IsNotNull)
        .space()
        .push(Token::And)
        .space()
        .append(&pair_predicate(direction))
        .rparen()
        .space()
        .push(Token::Gte)
        .space()
        .push(Token::LitInt(pairs));
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(field: &str, operator: Operator, value: serde_json::Value) -> Condition {
        Condition {
            field: field.to_string(),
            operator,
            value: Some(value),
            period: None,
            null_handling: None,
            trend_config: None,
        }
    }

    fn period(n: i64, aggregation: Aggregation) -> Period {
        Period {
            period_type: "quarters".to_string(),
            n,
            aggregation,
        }
    }

    fn field(name: &str) -> &'static FieldDef {
        catalog::resolve_field(name).unwrap()
    }

    #[test]
    fn test_count_all_form() {
        let mut ctx = CompileContext::new();
        let cond = condition("net_profit", Operator::Gt, serde_json::json!(0));
        let sql = compile_count_all(&cond, &period(4, Aggregation::All), field("net_profit"), &mut ctx)
            .unwrap()
            .serialize();
        assert_eq!(
            sql,
            "(SELECT COUNT(*) FROM fundamentals_quarterly fq2 \
             WHERE fq2.symbol = c.symbol AND fq2.quarter >= \
             (SELECT MAX(quarter) - 4 FROM fundamentals_quarterly WHERE symbol = c.symbol) \
             AND fq2.net_income > :p0) = 4"
        );
        let (params, meta) = ctx.into_params();
        assert_eq!(params, vec![("p0".to_string(), ParamValue::Int(0))]);
        assert!(!meta.uses_time_series); // set by the dispatcher, not the form
    }

    #[test]
    fn test_any_uses_exists() {
        let mut ctx = CompileContext::new();
        let cond = condition("revenue", Operator::Gt, serde_json::json!(1000));
        let sql = compile_exists_any(&cond, &period(8, Aggregation::Any), field("revenue"), &mut ctx)
            .unwrap()
            .serialize();
        assert!(sql.starts_with("EXISTS (SELECT 1 FROM fundamentals_quarterly fq2"));
        assert!(sql.contains("MAX(quarter) - 8"));
    }

    #[test]
    fn test_avg_aggregate_form() {
        let mut ctx = CompileContext::new();
        let cond = condition("eps", Operator::Gte, serde_json::json!(5.5));
        let sql = compile_aggregate("avg", &cond, &period(4, Aggregation::Avg), field("eps"), &mut ctx)
            .unwrap()
            .serialize();
        assert!(sql.starts_with("(SELECT AVG(fq2.eps) FROM"));
        assert!(sql.ends_with(") >= :p0"));
        let (params, _) = ctx.into_params();
        assert_eq!(params, vec![("p0".to_string(), ParamValue::Float(5.5))]);
    }

    #[test]
    fn test_unsupported_operator_in_window() {
        let mut ctx = CompileContext::new();
        let cond = condition("revenue", Operator::Between, serde_json::json!([1, 2]));
        let err = compile_count_all(&cond, &period(4, Aggregation::All), field("revenue"), &mut ctx)
            .unwrap_err();
        assert!(err.to_string().contains("not supported inside a period window"));
    }

    #[test]
    fn test_trend_binds_no_params() {
        let mut ctx = CompileContext::new();
        let mut cond = condition("net_profit", Operator::Increasing, serde_json::json!(null));
        cond.value = None;
        let sql = compile_temporal(&cond, &period(4, Aggregation::Trend), field("net_profit"), &mut ctx)
            .unwrap()
            .serialize();
        assert!(sql.contains("LAG(fq2.net_income) OVER (ORDER BY fq2.quarter)"));
        assert!(sql.contains("t.value > t.prev_value"));
        assert!(sql.ends_with(">= 3"));
        let (params, meta) = ctx.into_params();
        assert!(params.is_empty());
        assert!(meta.uses_time_series);
    }

    #[test]
    fn test_trend_min_periods_from_config() {
        use crate::model::TrendConfig;

        let mut cond = condition("revenue", Operator::Decreasing, serde_json::json!(null));
        cond.value = None;
        cond.trend_config = Some(TrendConfig {
            direction: TrendDirection::Decreasing,
            min_periods: 6,
        });
        let sql = compile_trend(&cond, &period(8, Aggregation::Trend), field("revenue"))
            .unwrap()
            .serialize();
        assert!(sql.contains("t.value < t.prev_value"));
        assert!(sql.contains("MAX(quarter) - 5"));
        assert!(sql.ends_with(">= 5"));
    }

    #[test]
    fn test_stable_tolerance_band() {
        let mut cond = condition("eps", Operator::Stable, serde_json::json!(null));
        cond.value = None;
        let sql = compile_trend(&cond, &period(4, Aggregation::Trend), field("eps"))
            .unwrap()
            .serialize();
        assert!(sql.contains("ABS(t.value - t.prev_value) <= ABS(t.prev_value) * 0.02"));
    }
}
