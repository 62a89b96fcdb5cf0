//! Row selections built by queries.

use serde::{Deserialize, Serialize};
use trellis_core::value::{FieldType, Value, Values};

/// One condition on an attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// The attribute equals the value.
    Eq(Value),
    /// The attribute equals one of the values.
    In(Vec<Value>),
}

/// A conjunction of attribute conditions. The empty selection matches every
/// row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    filters: Vec<(String, Condition)>,
}

impl Selection {
    /// Every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Rows where `attribute == value`.
    #[must_use]
    pub fn where_eq(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters
            .push((attribute.into(), Condition::Eq(value.into())));
        self
    }

    /// Rows where `attribute` is one of `values`.
    #[must_use]
    pub fn where_in(mut self, attribute: impl Into<String>, values: Vec<Value>) -> Self {
        self.filters.push((attribute.into(), Condition::In(values)));
        self
    }

    /// Narrow this selection by every condition of `other`.
    #[must_use]
    pub fn and(mut self, other: Self) -> Self {
        self.filters.extend(other.filters);
        self
    }

    /// The conditions.
    pub fn filters(&self) -> &[(String, Condition)] {
        &self.filters
    }

    /// Whether `row` satisfies every condition. Condition values are coerced
    /// with `attribute_type` first, so `"1"` selects an integer id of `1`.
    pub fn matches(&self, row: &Values, attribute_type: impl Fn(&str) -> Option<FieldType>) -> bool {
        self.filters.iter().all(|(attribute, condition)| {
            let actual = row.get(attribute).unwrap_or(&Value::Null);
            let field_type = attribute_type(attribute);
            match condition {
                Condition::Eq(expected) => &coerce(field_type, expected) == actual,
                Condition::In(candidates) => candidates
                    .iter()
                    .any(|expected| &coerce(field_type, expected) == actual),
            }
        })
    }
}

/// Coerce `value` to `field_type` when possible, leaving it untouched
/// otherwise.
pub fn coerce(field_type: Option<FieldType>, value: &Value) -> Value {
    field_type
        .and_then(|t| t.coerce(value.clone()).ok())
        .unwrap_or_else(|| value.clone())
}

#[cfg(test)]
mod tests {
    use trellis_core::values;

    use super::*;

    fn types(attribute: &str) -> Option<FieldType> {
        (attribute == "id").then_some(FieldType::Integer)
    }

    #[test]
    fn empty_selection_matches_everything() {
        assert!(Selection::all().matches(&values! { "id" => 1 }, types));
    }

    #[test]
    fn conditions_are_conjunctive_and_coerced() {
        let row = values! { "id" => 1, "title" => "a" };
        assert!(Selection::all().where_eq("id", "1").matches(&row, types));
        assert!(!Selection::all()
            .where_eq("id", 1)
            .where_eq("title", "b")
            .matches(&row, types));
        assert!(Selection::all()
            .where_in("id", vec![Value::from(3), Value::from(1)])
            .matches(&row, types));
    }

    #[test]
    fn missing_attributes_are_null() {
        let row = values! { "id" => 1 };
        assert!(Selection::all().where_eq("deleted_at", Value::Null).matches(&row, types));
    }
}
