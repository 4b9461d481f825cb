// Condition evaluation shared by scoring, assignment and workflow rules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use super::EngineError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[serde(alias = "eq", alias = "Equals")]
    Equals,
    #[serde(alias = "ne", alias = "NotEquals")]
    NotEquals,
    #[serde(alias = "gt", alias = "GreaterThan")]
    GreaterThan,
    #[serde(alias = "lt", alias = "LessThan")]
    LessThan,
    #[serde(alias = "Contains")]
    Contains,
    #[serde(alias = "In")]
    In,
    #[serde(alias = "IsEmpty")]
    IsEmpty,
    /// Anything else; never matches and is rejected at save time
    #[serde(other)]
    Unknown,
}

/// A single `field operator value` test against an entity snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Field name, dot notation for nested values
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

/// What a rule stores in its condition column: one condition, or a list that must all match
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConditionSet {
    Single(Condition),
    All { all: Vec<Condition> },
}

impl Condition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    pub fn equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::Equals, value)
    }

    pub fn not_equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::NotEquals, value)
    }

    pub fn greater_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::GreaterThan, serde_json::json!(value))
    }

    pub fn less_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::LessThan, serde_json::json!(value))
    }

    pub fn contains(field: &str, value: &str) -> Self {
        Self::new(field, ConditionOperator::Contains, Value::String(value.to_string()))
    }

    pub fn in_list(field: &str, values: Vec<Value>) -> Self {
        Self::new(field, ConditionOperator::In, Value::Array(values))
    }

    pub fn is_empty(field: &str) -> Self {
        Self::new(field, ConditionOperator::IsEmpty, Value::Null)
    }

    /// Deterministic and side-effect free. Unknown fields, unknown operators and
    /// type mismatches all evaluate to false.
    pub fn evaluate(&self, snapshot: &Value) -> bool {
        let Some(actual) = field_value(snapshot, &self.field) else {
            return false;
        };

        match self.operator {
            ConditionOperator::Equals => loose_eq(actual, &self.value).unwrap_or(false),
            ConditionOperator::NotEquals => loose_eq(actual, &self.value).map(|eq| !eq).unwrap_or(false),
            ConditionOperator::GreaterThan => compare(actual, &self.value) == Some(Ordering::Greater),
            ConditionOperator::LessThan => compare(actual, &self.value) == Some(Ordering::Less),
            ConditionOperator::Contains => contains(actual, &self.value),
            ConditionOperator::In => match &self.value {
                Value::Array(options) => options.iter().any(|o| loose_eq(actual, o) == Some(true)),
                _ => false,
            },
            ConditionOperator::IsEmpty => is_empty(actual),
            ConditionOperator::Unknown => false,
        }
    }

    /// Save-time check for rule administration
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.field.trim().is_empty() {
            return Err(EngineError::Configuration("condition field is required".to_string()));
        }

        let problem = match self.operator {
            ConditionOperator::Unknown => Some("unsupported operator"),
            ConditionOperator::Equals | ConditionOperator::NotEquals if self.value.is_null() => {
                Some("a comparison value is required, use is_empty to test for missing values")
            }
            ConditionOperator::GreaterThan | ConditionOperator::LessThan
                if as_number(&self.value).is_none() && as_datetime(&self.value).is_none() =>
            {
                Some("ordering comparisons need a numeric or RFC 3339 date value")
            }
            ConditionOperator::Contains if !matches!(self.value, Value::String(_) | Value::Number(_)) => {
                Some("contains needs a string or number value")
            }
            ConditionOperator::In if !self.value.as_array().is_some_and(|a| !a.is_empty()) => {
                Some("in needs a non-empty array value")
            }
            _ => None,
        };

        match problem {
            Some(msg) => Err(EngineError::Configuration(format!("{} ({})", msg, self.field))),
            None => Ok(()),
        }
    }
}

impl ConditionSet {
    /// Parses a stored condition document. Fails on shapes the evaluator cannot read.
    pub fn from_value(value: &Value) -> Result<Self, EngineError> {
        serde_json::from_value(value.clone())
            .map_err(|e| EngineError::Configuration(format!("malformed condition: {}", e)))
    }

    pub fn conditions(&self) -> &[Condition] {
        match self {
            Self::Single(condition) => std::slice::from_ref(condition),
            Self::All { all } => all,
        }
    }

    pub fn evaluate(&self, snapshot: &Value) -> bool {
        self.conditions().iter().all(|c| c.evaluate(snapshot))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.conditions().is_empty() {
            return Err(EngineError::Configuration("condition list is empty".to_string()));
        }
        self.conditions().iter().try_for_each(Condition::validate)
    }
}

/// Parses and evaluates a stored condition in one step; malformed documents do not match.
pub fn evaluate_document(document: &Value, snapshot: &Value) -> bool {
    ConditionSet::from_value(document)
        .map(|set| set.evaluate(snapshot))
        .unwrap_or(false)
}

/// Parses and validates a condition document submitted through rule administration.
pub fn validate_document(document: &Value) -> Result<ConditionSet, EngineError> {
    let set = ConditionSet::from_value(document)?;
    set.validate()?;
    Ok(set)
}

/// Resolves `a.b.c` against nested objects. Keys match exactly first, then
/// ignoring case and underscores so `CompanyName` finds `company_name`.
pub fn field_value<'a>(snapshot: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(snapshot, |current, segment| {
        let object = current.as_object()?;
        object.get(segment).or_else(|| {
            let wanted = fold_key(segment);
            object
                .iter()
                .find(|(key, _)| fold_key(key) == wanted)
                .map(|(_, value)| value)
        })
    })
}

fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// `None` when the two values cannot be compared.
fn loose_eq(actual: &Value, expected: &Value) -> Option<bool> {
    match (actual, expected) {
        (Value::Null, Value::Null) => Some(true),
        (Value::Null, _) | (_, Value::Null) => Some(false),
        (Value::String(a), Value::String(b)) => Some(a.trim().eq_ignore_ascii_case(b.trim())),
        (Value::Bool(a), Value::Bool(b)) => Some(a == b),
        (Value::Bool(a), Value::String(b)) | (Value::String(b), Value::Bool(a)) => {
            b.trim().parse::<bool>().ok().map(|b| *a == b)
        }
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            let (a, b) = (as_number(actual)?, as_number(expected)?);
            Some(a == b)
        }
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => Some(actual == expected),
        _ => None,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (as_datetime(actual), as_datetime(expected)) {
        return Some(a.cmp(&b));
    }
    None
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match actual {
        Value::String(haystack) => {
            let needle = match needle {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return false,
            };
            haystack.to_lowercase().contains(&needle.to_lowercase())
        }
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle) == Some(true)),
        _ => false,
    }
}

fn is_empty(actual: &Value) -> bool {
    match actual {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
