//! # Screener
//!
//! Compiles declarative stock-screening filters to validated,
//! parameterized SQL.
//!
//! ## Architecture
//!
//! A query moves through three stages:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              JSON Query (filter DSL)                     │
//! │  (and/or/not tree, conditions, periods, meta, sort)      │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [model]
//! ┌─────────────────────────────────────────────────────────┐
//! │              Typed Query (closed filter tree)            │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [validation]
//! ┌─────────────────────────────────────────────────────────┐
//! │     Graded issue list (errors / warnings / infos)        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [compile]
//! ┌─────────────────────────────────────────────────────────┐
//! │          SQL + named :pN parameters + metadata           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Field names resolve through the static [`catalog`]; derived metrics
//! (PEG, CAGR, consistency) live in [`metrics`] with their guard
//! policies; [`sql`] owns the token grammar the compiler assembles
//! statements from. Literal values never appear in the SQL text.

pub mod catalog;
pub mod compile;
pub mod metrics;
pub mod model;
pub mod sql;
pub mod validation;

pub use sql::token;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::compile::{
        CompileMetadata, CompileOptions, CompileOutput, CompilerError, ParamValue, ScreenCompiler,
    };
    pub use crate::metrics::DerivedMetricsEngine;
    pub use crate::model::{
        Aggregation, Condition, FilterNode, NullStrategy, Operator, Query, SortOrder,
    };
    pub use crate::validation::{
        IssueKind, Severity, ValidationEngine, ValidationIssue, ValidationResult,
    };
}
