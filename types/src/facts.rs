//! Calculator memory facts.
//!
//! [`FactStore`] is the per-session record of user-named values and the last
//! computed result. [`ExtractionResult`] is the transient shape returned by the
//! structured extraction call before it is merged into a store.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::EmptyStringError;

/// Canonical text form of a decimal: normalized, no trailing fractional zeros.
///
/// `21.00` renders as `21`, `0.50` as `0.5`.
#[must_use]
pub fn canonical_decimal(value: &Decimal) -> String {
    value.normalize().to_string()
}

/// Named values and last result remembered for one conversation session.
///
/// Keys are case-sensitive and never blank; [`FactStore::insert_value`] is the
/// only way to add one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactStore {
    #[serde(default, alias = "SavedValues")]
    saved_values: BTreeMap<String, Decimal>,
    #[serde(default, alias = "LastResult")]
    last_result: Option<String>,
    /// Reserved for the host; extraction never writes it.
    #[serde(default, alias = "LastExpression")]
    last_expression: Option<String>,
}

impl FactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn saved_values(&self) -> &BTreeMap<String, Decimal> {
        &self.saved_values
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Decimal> {
        self.saved_values.get(name)
    }

    #[must_use]
    pub fn last_result(&self) -> Option<&str> {
        self.last_result.as_deref()
    }

    #[must_use]
    pub fn last_expression(&self) -> Option<&str> {
        self.last_expression.as_deref()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.saved_values.is_empty() && self.last_result.is_none() && self.last_expression.is_none()
    }

    /// Store `value` under `name`, returning the previous value.
    ///
    /// The name is kept exactly as given; blank names are rejected.
    pub fn insert_value(
        &mut self,
        name: impl Into<String>,
        value: Decimal,
    ) -> Result<Option<Decimal>, EmptyStringError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EmptyStringError);
        }
        Ok(self.saved_values.insert(name, value))
    }

    /// Record the canonical form of `value` as the last result.
    pub fn set_last_result(&mut self, value: &Decimal) {
        self.last_result = Some(canonical_decimal(value));
    }

    pub fn set_last_expression(&mut self, expression: Option<String>) {
        self.last_expression = expression;
    }

    /// Drop entries whose keys are blank. Returns how many were removed.
    ///
    /// Needed after deserializing a blob written by someone else.
    pub fn remove_blank_keys(&mut self) -> usize {
        let before = self.saved_values.len();
        self.saved_values.retain(|name, _| !name.trim().is_empty());
        before - self.saved_values.len()
    }

    /// `a=1, b=2` summary of the saved values, in key order.
    #[must_use]
    pub fn saved_values_summary(&self) -> String {
        self.saved_values
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A value the user explicitly named in a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedValue {
    pub name: String,
    pub value: Decimal,
}

impl NamedValue {
    pub fn new(name: impl Into<String>, value: Decimal) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Structured output of one extraction call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    #[serde(default, alias = "named_values")]
    pub named_values: Option<Vec<NamedValue>>,
    #[serde(default, alias = "last_calculated_result")]
    pub last_calculated_result: Option<Decimal>,
}

impl ExtractionResult {
    /// True when applying this result cannot change any store.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.named_values.as_ref().is_none_or(Vec::is_empty) && self.last_calculated_result.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(raw: &str) -> Decimal {
        Decimal::from_str(raw).unwrap()
    }

    #[test]
    fn canonical_decimal_strips_trailing_zeros() {
        assert_eq!(canonical_decimal(&dec("21.00")), "21");
        assert_eq!(canonical_decimal(&dec("0.50")), "0.5");
        assert_eq!(canonical_decimal(&dec("-3.125")), "-3.125");
    }

    #[test]
    fn insert_value_rejects_blank_names() {
        let mut store = FactStore::new();
        assert!(store.insert_value("  ", dec("1")).is_err());
        assert!(store.saved_values().is_empty());
    }

    #[test]
    fn insert_value_is_case_sensitive() {
        let mut store = FactStore::new();
        store.insert_value("Sleva", dec("1")).unwrap();
        store.insert_value("sleva", dec("2")).unwrap();
        assert_eq!(store.saved_values().len(), 2);
        assert_eq!(store.value("Sleva"), Some(&dec("1")));
    }

    #[test]
    fn insert_value_returns_previous() {
        let mut store = FactStore::new();
        assert_eq!(store.insert_value("x", dec("1")).unwrap(), None);
        assert_eq!(store.insert_value("x", dec("2")).unwrap(), Some(dec("1")));
    }

    #[test]
    fn set_last_result_uses_canonical_form() {
        let mut store = FactStore::new();
        store.set_last_result(&dec("42.000"));
        assert_eq!(store.last_result(), Some("42"));
    }

    #[test]
    fn summary_lists_values_in_key_order() {
        let mut store = FactStore::new();
        store.insert_value("b", dec("2")).unwrap();
        store.insert_value("a", dec("1.5")).unwrap();
        assert_eq!(store.saved_values_summary(), "a=1.5, b=2");
    }

    #[test]
    fn empty_store_reports_empty() {
        let mut store = FactStore::new();
        assert!(store.is_empty());
        store.set_last_expression(Some("1+1".to_string()));
        assert!(!store.is_empty());
    }

    #[test]
    fn extraction_result_accepts_snake_case_aliases() {
        let parsed: ExtractionResult = serde_json::from_str(
            r#"{"named_values":[{"name":"sleva","value":21}],"last_calculated_result":21}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.named_values,
            Some(vec![NamedValue::new("sleva", dec("21"))])
        );
        assert_eq!(parsed.last_calculated_result, Some(dec("21")));
    }

    #[test]
    fn extraction_result_keeps_decimal_digits() {
        let parsed: ExtractionResult =
            serde_json::from_str(r#"{"namedValues":[{"name":"dph","value":0.21}]}"#).unwrap();
        let values = parsed.named_values.unwrap();
        assert_eq!(values[0].value, dec("0.21"));
        assert_eq!(values[0].value.to_string(), "0.21");
    }

    #[test]
    fn extraction_result_emptiness() {
        assert!(ExtractionResult::default().is_empty());
        assert!(
            ExtractionResult {
                named_values: Some(vec![]),
                last_calculated_result: None
            }
            .is_empty()
        );
        assert!(
            !ExtractionResult {
                named_values: None,
                last_calculated_result: Some(dec("1"))
            }
            .is_empty()
        );
    }
}
