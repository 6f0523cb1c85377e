//! Derived financial metrics with guarded evaluation.
//!
//! A derived metric is not a stored column; it is computed from stored
//! fields via a canonical formula. Every formula is wrapped in safety
//! guards: missing inputs, divide-by-zero shapes and implausible results
//! all evaluate to "absent" (`None`) rather than an error. Ratio-style
//! formulas divide in decimal arithmetic so the near-zero and sanity
//! guards are not disturbed by binary-float artifacts.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::Value;

/// Error raised only for programming-contract violations; unsafe
/// computations never error, they evaluate to `None`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    #[error("unknown derived metric: '{0}'")]
    UnknownMetric(String),
}

/// Static definition of one derived metric.
#[derive(Debug, Clone)]
pub struct MetricDef {
    pub display_name: &'static str,
    /// Stored fields the formula reads.
    pub requires: &'static [&'static str],
    /// Whether evaluation needs a history window rather than one row.
    pub time_series: bool,
    pub typical_range: (f64, f64),
}

static REGISTRY: Lazy<HashMap<&'static str, MetricDef>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "peg_ratio",
        MetricDef {
            display_name: "PEG Ratio",
            requires: &["pe_ratio", "eps_growth"],
            time_series: false,
            typical_range: (0.0, 5.0),
        },
    );
    m.insert(
        "debt_to_fcf",
        MetricDef {
            display_name: "Debt to Free Cash Flow",
            requires: &["total_debt", "free_cash_flow"],
            time_series: false,
            typical_range: (0.0, 20.0),
        },
    );
    m.insert(
        "eps_cagr",
        MetricDef {
            display_name: "EPS Compound Annual Growth Rate",
            requires: &["eps_history", "periods"],
            time_series: true,
            typical_range: (-50.0, 100.0),
        },
    );
    m.insert(
        "revenue_cagr",
        MetricDef {
            display_name: "Revenue Compound Annual Growth Rate",
            requires: &["revenue_history", "periods"],
            time_series: true,
            typical_range: (-50.0, 100.0),
        },
    );
    m.insert(
        "fcf_margin",
        MetricDef {
            display_name: "Free Cash Flow Margin",
            requires: &["free_cash_flow", "revenue"],
            time_series: false,
            typical_range: (0.0, 50.0),
        },
    );
    m.insert(
        "earnings_consistency_score",
        MetricDef {
            display_name: "Earnings Consistency Score",
            requires: &["earnings_history"],
            time_series: true,
            typical_range: (0.0, 1.0),
        },
    );
    m
});

/// Engine for computing derived metrics with safety checks.
///
/// Stateless over the static registry; construct freely and share by
/// reference with the validator and compiler.
#[derive(Debug, Default, Clone, Copy)]
pub struct DerivedMetricsEngine;

impl DerivedMetricsEngine {
    pub fn new() -> Self {
        Self
    }

    /// Whether `name` is a registered derived metric.
    pub fn is_known(&self, name: &str) -> bool {
        REGISTRY.contains_key(name)
    }

    /// Static definition for a metric, if registered.
    pub fn definition(&self, name: &str) -> Option<&'static MetricDef> {
        REGISTRY.get(name)
    }

    /// Stored fields required to compute `name`.
    pub fn requirements(&self, name: &str) -> Result<&'static [&'static str], MetricError> {
        REGISTRY
            .get(name)
            .map(|def| def.requires)
            .ok_or_else(|| MetricError::UnknownMetric(name.to_string()))
    }

    /// Whether `name` needs a history window.
    pub fn is_time_series(&self, name: &str) -> bool {
        REGISTRY.get(name).map(|d| d.time_series).unwrap_or(false)
    }

    /// Ready-made SQL for metrics cheap enough to push into the query.
    ///
    /// Returns `None` for metrics that need historical aggregation
    /// outside plain SQL (CAGR variants, consistency score); those are
    /// post-filtered application-side.
    pub fn sql_expression(&self, name: &str) -> Option<&'static str> {
        match name {
            "peg_ratio" => {
                Some("CASE WHEN fq.eps_growth > 0.01 THEN fq.pe_ratio / fq.eps_growth ELSE NULL END")
            }
            "debt_to_fcf" => Some(
                "CASE WHEN fq.free_cash_flow > 0 THEN fq.total_debt / fq.free_cash_flow ELSE NULL END",
            ),
            "fcf_margin" => {
                Some("CASE WHEN fq.revenue > 0 THEN (fq.free_cash_flow / fq.revenue * 100) ELSE NULL END")
            }
            _ => None,
        }
    }

    // ========================================================================
    // Formulas
    // ========================================================================

    /// PEG = PE / EPS growth.
    ///
    /// Absent when an input is missing, PE is non-positive, growth is
    /// too small to divide by meaningfully, or the result falls outside
    /// [0, 1000].
    pub fn peg_ratio(&self, pe_ratio: Option<f64>, eps_growth: Option<f64>) -> Option<f64> {
        let pe = pe_ratio?;
        let growth = eps_growth?;
        if pe <= 0.0 {
            tracing::debug!(pe, "peg_ratio: non-positive PE");
            return None;
        }
        if growth == 0.0 || growth.abs() < 0.01 {
            tracing::debug!(growth, "peg_ratio: EPS growth too small");
            return None;
        }
        let peg = (Decimal::from_f64(pe)? / Decimal::from_f64(growth)?).to_f64()?;
        if !(0.0..=1000.0).contains(&peg) {
            tracing::debug!(peg, "peg_ratio: result outside reasonable range");
            return None;
        }
        Some(peg)
    }

    /// Debt / free cash flow.
    ///
    /// Absent when an input is missing, FCF is non-positive, debt is
    /// negative, or the ratio exceeds 1000.
    pub fn debt_to_fcf(&self, total_debt: Option<f64>, free_cash_flow: Option<f64>) -> Option<f64> {
        let debt = total_debt?;
        let fcf = free_cash_flow?;
        if fcf <= 0.0 {
            tracing::debug!(fcf, "debt_to_fcf: non-positive free cash flow");
            return None;
        }
        if debt < 0.0 {
            tracing::debug!(debt, "debt_to_fcf: negative debt");
            return None;
        }
        let ratio = (Decimal::from_f64(debt)? / Decimal::from_f64(fcf)?).to_f64()?;
        if ratio > 1000.0 {
            tracing::debug!(ratio, "debt_to_fcf: result outside reasonable range");
            return None;
        }
        Some(ratio)
    }

    /// CAGR = ((end / begin) ^ (1 / periods) - 1) * 100, as percent.
    ///
    /// Fractional exponentiation has no decimal form, so this one stays
    /// in floats and is range-guarded afterwards. Rounded to 2 decimals.
    pub fn cagr(
        &self,
        beginning_value: Option<f64>,
        ending_value: Option<f64>,
        periods: Option<f64>,
    ) -> Option<f64> {
        let begin = beginning_value?;
        let end = ending_value?;
        let periods = periods?;
        if begin <= 0.0 || periods <= 0.0 || end < 0.0 {
            tracing::debug!(begin, end, periods, "cagr: invalid inputs");
            return None;
        }
        let cagr = ((end / begin).powf(1.0 / periods) - 1.0) * 100.0;
        if !(-100.0..=1000.0).contains(&cagr) {
            tracing::debug!(cagr, "cagr: result outside reasonable range");
            return None;
        }
        Some(round_to(cagr, 2))
    }

    /// FCF margin = FCF / revenue * 100.
    ///
    /// Absent when revenue is non-positive or the margin falls outside
    /// [-100, 100] (the margin itself may be negative). Rounded to 2
    /// decimals.
    pub fn fcf_margin(&self, free_cash_flow: Option<f64>, revenue: Option<f64>) -> Option<f64> {
        let fcf = free_cash_flow?;
        let rev = revenue?;
        if rev <= 0.0 {
            tracing::debug!(rev, "fcf_margin: non-positive revenue");
            return None;
        }
        let margin = (Decimal::from_f64(fcf)? / Decimal::from_f64(rev)? * Decimal::from(100))
            .to_f64()?;
        if !(-100.0..=100.0).contains(&margin) {
            tracing::debug!(margin, "fcf_margin: result outside reasonable range");
            return None;
        }
        Some(round_to(margin, 2))
    }

    /// Consistency = 1 - coefficient_of_variation(earnings), clamped to
    /// [0, 1] and rounded to 3 decimals.
    ///
    /// Absent with fewer than 4 non-null observations or zero mean.
    pub fn earnings_consistency_score(&self, earnings_history: &[Option<f64>]) -> Option<f64> {
        let valid: Vec<f64> = earnings_history.iter().filter_map(|v| *v).collect();
        if valid.len() < 4 {
            tracing::debug!(observations = valid.len(), "consistency: insufficient data");
            return None;
        }
        let mean = valid.iter().sum::<f64>() / valid.len() as f64;
        if mean == 0.0 {
            tracing::debug!("consistency: zero mean");
            return None;
        }
        let variance = valid.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / valid.len() as f64;
        let cv = variance.sqrt() / mean.abs();
        let score = (1.0 - cv).clamp(0.0, 1.0);
        Some(round_to(score, 3))
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Evaluate a metric from a map of named inputs.
    ///
    /// Input keys follow the registry's `requires` lists; CAGR variants
    /// read `beginning_*` / `ending_*` / `periods`, the consistency
    /// score reads `earnings_history` (nulls tolerated).
    pub fn evaluate(
        &self,
        name: &str,
        inputs: &serde_json::Map<String, Value>,
    ) -> Result<Option<f64>, MetricError> {
        if !self.is_known(name) {
            return Err(MetricError::UnknownMetric(name.to_string()));
        }

        let num = |key: &str| inputs.get(key).and_then(Value::as_f64);
        let result = match name {
            "peg_ratio" => self.peg_ratio(num("pe_ratio"), num("eps_growth")),
            "debt_to_fcf" => self.debt_to_fcf(num("total_debt"), num("free_cash_flow")),
            "eps_cagr" => self.cagr(num("beginning_eps"), num("ending_eps"), num("periods")),
            "revenue_cagr" => self.cagr(
                num("beginning_revenue"),
                num("ending_revenue"),
                num("periods"),
            ),
            "fcf_margin" => self.fcf_margin(num("free_cash_flow"), num("revenue")),
            "earnings_consistency_score" => {
                let history: Vec<Option<f64>> = inputs
                    .get("earnings_history")
                    .and_then(Value::as_array)
                    .map(|values| values.iter().map(Value::as_f64).collect())
                    .unwrap_or_default();
                self.earnings_consistency_score(&history)
            }
            _ => unreachable!("registry membership checked above"),
        };
        Ok(result)
    }

    /// Pre-check whether evaluation would trip a guard; `Ok(None)` means
    /// safe, `Ok(Some(reason))` names the guard that would fire.
    pub fn computation_is_safe(
        &self,
        name: &str,
        inputs: &serde_json::Map<String, Value>,
    ) -> Result<Option<String>, MetricError> {
        let requires = self.requirements(name)?;

        let missing: Vec<&str> = requires
            .iter()
            .filter(|field| inputs.get(**field).map(Value::is_null).unwrap_or(true))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Ok(Some(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let num = |key: &str| inputs.get(key).and_then(Value::as_f64);
        let reason = match name {
            "peg_ratio" => {
                let growth = num("eps_growth").unwrap_or(0.0);
                if growth == 0.0 {
                    Some("EPS growth is zero - cannot compute PEG ratio".to_string())
                } else if growth.abs() < 0.01 {
                    Some("EPS growth too small - PEG ratio would be unreliable".to_string())
                } else {
                    None
                }
            }
            "debt_to_fcf" => {
                if num("free_cash_flow").unwrap_or(0.0) <= 0.0 {
                    Some("free cash flow is zero or negative - cannot compute ratio".to_string())
                } else {
                    None
                }
            }
            _ => None,
        };
        Ok(reason)
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DerivedMetricsEngine {
        DerivedMetricsEngine::new()
    }

    #[test]
    fn test_registry_lookups() {
        let e = engine();
        assert!(e.is_known("peg_ratio"));
        assert!(!e.is_known("sharpe_ratio"));
        assert_eq!(
            e.requirements("debt_to_fcf").unwrap(),
            ["total_debt", "free_cash_flow"]
        );
        assert!(matches!(
            e.requirements("sharpe_ratio"),
            Err(MetricError::UnknownMetric(_))
        ));
        assert!(e.is_time_series("eps_cagr"));
        assert!(!e.is_time_series("fcf_margin"));
    }

    #[test]
    fn test_sql_expression_availability() {
        let e = engine();
        assert!(e.sql_expression("peg_ratio").unwrap().contains("CASE WHEN"));
        assert!(e.sql_expression("debt_to_fcf").is_some());
        assert!(e.sql_expression("fcf_margin").is_some());
        assert!(e.sql_expression("eps_cagr").is_none());
        assert!(e.sql_expression("revenue_cagr").is_none());
        assert!(e.sql_expression("earnings_consistency_score").is_none());
    }

    #[test]
    fn test_peg_ratio_guards() {
        let e = engine();
        let peg = e.peg_ratio(Some(20.0), Some(15.0)).unwrap();
        assert!((peg - 1.3333).abs() < 0.001, "got {}", peg);

        assert_eq!(e.peg_ratio(Some(20.0), Some(0.0)), None);
        assert_eq!(e.peg_ratio(Some(-5.0), Some(10.0)), None);
        assert_eq!(e.peg_ratio(Some(20.0), Some(0.001)), None);
        assert_eq!(e.peg_ratio(None, Some(10.0)), None);
        // Negative growth makes the ratio negative, outside [0, 1000]
        assert_eq!(e.peg_ratio(Some(20.0), Some(-10.0)), None);
    }

    #[test]
    fn test_debt_to_fcf_guards() {
        let e = engine();
        assert_eq!(e.debt_to_fcf(Some(1000.0), Some(200.0)), Some(5.0));
        assert_eq!(e.debt_to_fcf(Some(1000.0), Some(0.0)), None);
        assert_eq!(e.debt_to_fcf(Some(1000.0), Some(-100.0)), None);
        assert_eq!(e.debt_to_fcf(Some(-1.0), Some(100.0)), None);
        assert_eq!(e.debt_to_fcf(Some(2_000_000.0), Some(1.0)), None);
    }

    #[test]
    fn test_cagr_guards() {
        let e = engine();
        let up = e.cagr(Some(100.0), Some(150.0), Some(3.0)).unwrap();
        assert!(up > 0.0 && up < 100.0, "got {}", up);

        let down = e.cagr(Some(100.0), Some(50.0), Some(3.0)).unwrap();
        assert!(down < 0.0, "got {}", down);

        assert_eq!(e.cagr(Some(0.0), Some(100.0), Some(3.0)), None);
        assert_eq!(e.cagr(Some(100.0), Some(-10.0), Some(3.0)), None);
        assert_eq!(e.cagr(Some(100.0), Some(150.0), Some(0.0)), None);
        assert_eq!(e.cagr(None, Some(150.0), Some(3.0)), None);
    }

    #[test]
    fn test_cagr_rounding() {
        let e = engine();
        // (150/100)^(1/3) - 1 = 14.4714...% -> 14.47
        assert_eq!(e.cagr(Some(100.0), Some(150.0), Some(3.0)), Some(14.47));
    }

    #[test]
    fn test_fcf_margin_guards() {
        let e = engine();
        assert_eq!(e.fcf_margin(Some(200.0), Some(1000.0)), Some(20.0));
        assert_eq!(e.fcf_margin(Some(-50.0), Some(1000.0)), Some(-5.0));
        assert_eq!(e.fcf_margin(Some(100.0), Some(0.0)), None);
        assert_eq!(e.fcf_margin(Some(2000.0), Some(1000.0)), None);
        assert_eq!(e.fcf_margin(None, Some(1000.0)), None);
    }

    #[test]
    fn test_earnings_consistency_score() {
        let e = engine();

        let steady: Vec<Option<f64>> =
            [100.0, 110.0, 105.0, 115.0, 120.0].iter().map(|v| Some(*v)).collect();
        let score = e.earnings_consistency_score(&steady).unwrap();
        assert!(score > 0.9 && score <= 1.0, "got {}", score);

        let erratic: Vec<Option<f64>> =
            [100.0, 50.0, 150.0, 25.0, 200.0].iter().map(|v| Some(*v)).collect();
        let low = e.earnings_consistency_score(&erratic).unwrap();
        assert!(low < 0.5, "got {}", low);

        let short: Vec<Option<f64>> = vec![Some(100.0), Some(110.0)];
        assert_eq!(e.earnings_consistency_score(&short), None);

        // Nulls are dropped before the minimum-observation check
        let sparse = vec![Some(100.0), None, Some(110.0), None, Some(105.0)];
        assert_eq!(e.earnings_consistency_score(&sparse), None);
    }

    #[test]
    fn test_evaluate_dispatch() {
        let e = engine();
        let inputs: serde_json::Map<String, Value> = serde_json::from_str(
            r#"{ "pe_ratio": 20.0, "eps_growth": 15.0 }"#,
        )
        .unwrap();
        let peg = e.evaluate("peg_ratio", &inputs).unwrap().unwrap();
        assert!((peg - 1.3333).abs() < 0.001);

        assert!(matches!(
            e.evaluate("nope", &inputs),
            Err(MetricError::UnknownMetric(_))
        ));
    }

    #[test]
    fn test_evaluate_consistency_from_json() {
        let e = engine();
        let inputs: serde_json::Map<String, Value> = serde_json::from_str(
            r#"{ "earnings_history": [100, 110, null, 105, 115, 120] }"#,
        )
        .unwrap();
        let score = e
            .evaluate("earnings_consistency_score", &inputs)
            .unwrap()
            .unwrap();
        assert!(score > 0.0 && score <= 1.0);
    }

    #[test]
    fn test_computation_is_safe() {
        let e = engine();
        let safe: serde_json::Map<String, Value> =
            serde_json::from_str(r#"{ "pe_ratio": 20.0, "eps_growth": 15.0 }"#).unwrap();
        assert_eq!(e.computation_is_safe("peg_ratio", &safe).unwrap(), None);

        let zero_growth: serde_json::Map<String, Value> =
            serde_json::from_str(r#"{ "pe_ratio": 20.0, "eps_growth": 0.0 }"#).unwrap();
        let reason = e
            .computation_is_safe("peg_ratio", &zero_growth)
            .unwrap()
            .unwrap();
        assert!(reason.contains("zero"));

        let missing: serde_json::Map<String, Value> =
            serde_json::from_str(r#"{ "pe_ratio": 20.0 }"#).unwrap();
        let reason = e.computation_is_safe("peg_ratio", &missing).unwrap().unwrap();
        assert!(reason.contains("eps_growth"));
    }
}
