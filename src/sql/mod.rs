//! SQL generation primitives.
//!
//! A deliberately small fixed grammar: the compiler assembles every
//! statement from [`Token`]s so that field-to-column resolution always
//! goes through the catalog and literal values always become bound
//! parameters.

pub mod token;

pub use token::{Token, TokenStream};
