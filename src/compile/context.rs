//! Per-compilation state.
//!
//! The compiler itself is stateless; everything that accumulates during
//! one translation (the parameter counter, the ordered bind list, shape
//! metadata) lives here and is created fresh inside every `compile`
//! call. Two compilations can never observe each other's parameters.

use serde::Serialize;
use serde_json::Value;

use crate::sql::Token;

/// A value bound to a named placeholder in the generated SQL.
///
/// Lists stay ordered and keep duplicates; the executor is responsible
/// for expanding them into however many driver-level binds its SQL
/// library wants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    List(Vec<ParamValue>),
}

impl ParamValue {
    /// Convert a JSON literal into a bindable value.
    ///
    /// `None` for shapes that cannot be bound: nulls, objects, and
    /// numbers outside the i64/f64 range.
    pub fn from_json(value: &Value) -> Option<ParamValue> {
        match value {
            Value::Bool(b) => Some(ParamValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(ParamValue::Int(i))
                } else {
                    n.as_f64().map(ParamValue::Float)
                }
            }
            Value::String(s) => Some(ParamValue::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(ParamValue::from_json)
                .collect::<Option<Vec<_>>>()
                .map(ParamValue::List),
            Value::Null | Value::Object(_) => None,
        }
    }
}

/// Statistics about what one compilation produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompileMetadata {
    pub uses_time_series: bool,
    pub uses_derived_metrics: bool,
    pub complexity_score: u32,
    /// Derived metrics that could not be expressed inline and must be
    /// applied by the caller after row retrieval.
    pub requires_post_filter_fields: Vec<String>,
}

/// Mutable state threaded through one compilation.
#[derive(Debug, Default)]
pub struct CompileContext {
    next_param: usize,
    params: Vec<(String, ParamValue)>,
    pub metadata: CompileMetadata,
}

impl CompileContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value and return the placeholder token referencing it.
    ///
    /// Keys are `p0`, `p1`, ... in bind order, so the parameter list is
    /// deterministic for a given query.
    pub fn bind(&mut self, value: ParamValue) -> Token {
        let key = format!("p{}", self.next_param);
        self.next_param += 1;
        self.params.push((key.clone(), value));
        Token::Param(key)
    }

    pub fn post_filter(&mut self, field: &str) {
        let fields = &mut self.metadata.requires_post_filter_fields;
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
    }

    pub fn into_params(self) -> (Vec<(String, ParamValue)>, CompileMetadata) {
        (self.params, self.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bind_order() {
        let mut ctx = CompileContext::new();
        assert_eq!(ctx.bind(ParamValue::Int(1)).serialize(), ":p0");
        assert_eq!(ctx.bind(ParamValue::Text("IT".into())).serialize(), ":p1");
        let (params, _) = ctx.into_params();
        assert_eq!(params[0].0, "p0");
        assert_eq!(params[1], ("p1".to_string(), ParamValue::Text("IT".into())));
    }

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(ParamValue::from_json(&json!(42)), Some(ParamValue::Int(42)));
        assert_eq!(
            ParamValue::from_json(&json!(1.5)),
            Some(ParamValue::Float(1.5))
        );
        assert_eq!(
            ParamValue::from_json(&json!("Energy")),
            Some(ParamValue::Text("Energy".into()))
        );
        assert_eq!(ParamValue::from_json(&json!(null)), None);
        assert_eq!(ParamValue::from_json(&json!({})), None);
    }

    #[test]
    fn test_from_json_list_preserves_order_and_duplicates() {
        let value = json!(["IT", "Pharma", "IT"]);
        let ParamValue::List(items) = ParamValue::from_json(&value).unwrap() else {
            panic!("expected list");
        };
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], items[2]);
    }

    #[test]
    fn test_list_with_null_rejected() {
        assert_eq!(ParamValue::from_json(&json!([1, null])), None);
    }

    #[test]
    fn test_post_filter_dedup() {
        let mut ctx = CompileContext::new();
        ctx.post_filter("eps_cagr");
        ctx.post_filter("eps_cagr");
        assert_eq!(ctx.metadata.requires_post_filter_fields, vec!["eps_cagr"]);
    }
}
