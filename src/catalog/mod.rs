//! Static field catalog and operator table.
//!
//! The catalog is the only way a logical field name becomes a physical
//! column. It is built once at first use and read-only afterwards; both
//! the validator and the compiler treat it as a reference.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::model::Operator;
use crate::sql::Token;

// ============================================================================
// Physical layout
// ============================================================================

/// The two tables a screen reads, joined on `symbol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTable {
    Companies,
    Fundamentals,
}

impl SourceTable {
    /// Physical table name.
    pub fn name(&self) -> &'static str {
        match self {
            SourceTable::Companies => "companies",
            SourceTable::Fundamentals => "fundamentals_quarterly",
        }
    }

    /// Alias used in the generated query.
    pub fn alias(&self) -> &'static str {
        match self {
            SourceTable::Companies => "c",
            SourceTable::Fundamentals => "fq",
        }
    }
}

/// Physical location and validation metadata for one logical field.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub table: SourceTable,
    pub column: &'static str,
    /// Whether historical per-quarter values exist for this field.
    pub time_series: bool,
    /// False for fields that can never hold a negative value.
    pub can_be_negative: bool,
    /// Soft sanity range; values outside it draw a validation warning.
    pub typical_range: Option<(f64, f64)>,
}

impl FieldDef {
    const fn new(table: SourceTable, column: &'static str) -> Self {
        Self {
            table,
            column,
            time_series: false,
            can_be_negative: true,
            typical_range: None,
        }
    }

    const fn time_series(mut self) -> Self {
        self.time_series = true;
        self
    }

    const fn non_negative(mut self) -> Self {
        self.can_be_negative = false;
        self
    }

    const fn range(mut self, min: f64, max: f64) -> Self {
        self.typical_range = Some((min, max));
        self
    }

    /// Column reference qualified with the table's query alias.
    pub fn qualified(&self) -> Token {
        self.column_at(self.table.alias())
    }

    /// Column reference qualified with an arbitrary alias (correlated
    /// subqueries use `fq2`).
    pub fn column_at(&self, alias: &str) -> Token {
        Token::Qualified {
            table: alias.to_string(),
            column: self.column.to_string(),
        }
    }
}

static FIELDS: Lazy<HashMap<&'static str, FieldDef>> = Lazy::new(|| {
    use SourceTable::{Companies, Fundamentals};

    let mut m = HashMap::new();

    // companies
    m.insert("market_cap", FieldDef::new(Companies, "market_cap").non_negative());
    m.insert("sector", FieldDef::new(Companies, "sector"));
    m.insert("industry", FieldDef::new(Companies, "industry"));
    m.insert("exchange", FieldDef::new(Companies, "exchange"));
    m.insert("company_name", FieldDef::new(Companies, "name"));

    // fundamentals_quarterly - valuation
    m.insert("pe_ratio", FieldDef::new(Fundamentals, "pe_ratio").non_negative());
    m.insert("pb_ratio", FieldDef::new(Fundamentals, "pb_ratio"));
    m.insert("price_to_book", FieldDef::new(Fundamentals, "pb_ratio"));
    m.insert("price_to_sales", FieldDef::new(Fundamentals, "price_to_sales"));
    m.insert("ev_to_ebitda", FieldDef::new(Fundamentals, "ev_to_ebitda"));
    m.insert("dividend_yield", FieldDef::new(Fundamentals, "dividend_yield").non_negative());

    // fundamentals_quarterly - earnings and profitability
    m.insert("net_income", FieldDef::new(Fundamentals, "net_income").time_series());
    m.insert("net_profit", FieldDef::new(Fundamentals, "net_income").time_series());
    m.insert(
        "revenue",
        FieldDef::new(Fundamentals, "revenue").time_series().non_negative(),
    );
    m.insert("eps", FieldDef::new(Fundamentals, "eps").time_series());
    m.insert("gross_profit", FieldDef::new(Fundamentals, "gross_profit").time_series());
    m.insert(
        "operating_profit",
        FieldDef::new(Fundamentals, "operating_profit").time_series(),
    );
    m.insert("ebitda", FieldDef::new(Fundamentals, "ebitda").time_series());
    m.insert("operating_margin", FieldDef::new(Fundamentals, "operating_margin"));
    m.insert("net_margin", FieldDef::new(Fundamentals, "net_margin"));
    m.insert("roe", FieldDef::new(Fundamentals, "roe").range(-100.0, 100.0));
    m.insert("roa", FieldDef::new(Fundamentals, "roa"));

    // fundamentals_quarterly - growth
    m.insert(
        "eps_growth",
        FieldDef::new(Fundamentals, "eps_growth").range(-100.0, 1000.0),
    );
    m.insert(
        "revenue_growth_yoy",
        FieldDef::new(Fundamentals, "revenue_growth_yoy").range(-100.0, 500.0),
    );
    m.insert(
        "earnings_growth_yoy",
        FieldDef::new(Fundamentals, "earnings_growth_yoy"),
    );

    // fundamentals_quarterly - balance sheet and cash flow
    m.insert("total_debt", FieldDef::new(Fundamentals, "total_debt").non_negative());
    m.insert(
        "free_cash_flow",
        FieldDef::new(Fundamentals, "free_cash_flow").time_series(),
    );
    m.insert("current_ratio", FieldDef::new(Fundamentals, "current_ratio"));
    m.insert("quick_ratio", FieldDef::new(Fundamentals, "quick_ratio"));
    m.insert("debt_to_equity", FieldDef::new(Fundamentals, "debt_to_equity"));

    // fundamentals_quarterly - ownership and bookkeeping
    m.insert(
        "promoter_holding",
        FieldDef::new(Fundamentals, "promoter_holding").non_negative().range(0.0, 100.0),
    );
    m.insert("quarter", FieldDef::new(Fundamentals, "quarter"));

    m
});

/// Resolve a logical field name to its physical definition.
///
/// Derived metrics are not catalog fields; they resolve through the
/// derived-metrics registry instead.
pub fn resolve_field(name: &str) -> Option<&'static FieldDef> {
    FIELDS.get(name)
}

// ============================================================================
// Operator table
// ============================================================================

/// Relational rendering of an operator token, when one exists.
///
/// Trend operators have no plain relational form: they compile to
/// windowed subqueries instead, so they resolve to `None` here.
pub fn relational_symbol(op: Operator) -> Option<Token> {
    match op {
        Operator::Lt => Some(Token::Lt),
        Operator::Gt => Some(Token::Gt),
        Operator::Lte => Some(Token::Lte),
        Operator::Gte => Some(Token::Gte),
        Operator::Eq => Some(Token::Eq),
        Operator::Ne => Some(Token::Ne),
        Operator::In
        | Operator::NotIn
        | Operator::Between
        | Operator::Exists
        | Operator::Increasing
        | Operator::Decreasing
        | Operator::Stable => None,
    }
}

/// Operators that require an array-shaped value.
pub fn is_array_operator(op: Operator) -> bool {
    matches!(op, Operator::In | Operator::NotIn | Operator::Between)
}

/// Trend operators, handled by the temporal compiler.
pub fn is_trend_operator(op: Operator) -> bool {
    matches!(op, Operator::Increasing | Operator::Decreasing | Operator::Stable)
}

/// Operators usable inside a temporal aggregation window.
pub fn is_temporal_comparison(op: Operator) -> bool {
    matches!(
        op,
        Operator::Lt | Operator::Gt | Operator::Lte | Operator::Gte | Operator::Eq | Operator::Ne
    )
}

/// Operators that must carry a value.
pub fn requires_value(op: Operator) -> bool {
    !matches!(op, Operator::Exists) && !is_trend_operator(op)
}
