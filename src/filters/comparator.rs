//! Value comparator
//!
//! Named comparison operators over JSON values. Numbers compare numerically
//! (numeric strings are coerced), strings lexically. Incomparable pairs never
//! satisfy an ordering operator.

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    In,
    NotIn,
    Regex,
    Contains,
    Intersect,
}

impl Operator {
    /// Every accepted spelling, for error messages
    pub const NAMES: &'static [&'static str] = &[
        "eq",
        "equal",
        "ne",
        "not-equal",
        "gt",
        "greater-than",
        "ge",
        "gte",
        "greater-or-equal",
        "lt",
        "less-than",
        "le",
        "lte",
        "less-or-equal",
        "in",
        "ni",
        "not-in",
        "regex",
        "contains",
        "intersect",
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "equal",
            Operator::NotEqual => "not-equal",
            Operator::GreaterThan => "greater-than",
            Operator::GreaterOrEqual => "greater-or-equal",
            Operator::LessThan => "less-than",
            Operator::LessOrEqual => "less-or-equal",
            Operator::In => "in",
            Operator::NotIn => "not-in",
            Operator::Regex => "regex",
            Operator::Contains => "contains",
            Operator::Intersect => "intersect",
        }
    }

    /// Apply to a pair of values. `Regex` needs a compiled pattern and is
    /// handled by [`crate::filters::value::ValueMatcher`]; here it is false.
    pub fn compare(&self, left: &Value, right: &Value) -> bool {
        match self {
            Operator::Equal => values_equal(left, right),
            Operator::NotEqual => !values_equal(left, right),
            Operator::GreaterThan => ordering(left, right) == Some(Ordering::Greater),
            Operator::GreaterOrEqual => matches!(
                ordering(left, right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::LessThan => ordering(left, right) == Some(Ordering::Less),
            Operator::LessOrEqual => matches!(
                ordering(left, right),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::In => member_of(left, right),
            Operator::NotIn => !member_of(left, right),
            Operator::Contains => contains(left, right),
            Operator::Intersect => intersects(left, right),
            Operator::Regex => false,
        }
    }

    /// Numeric comparison used by metric and age thresholds
    pub fn compare_f64(&self, left: f64, right: f64) -> bool {
        match self {
            Operator::Equal => left == right,
            Operator::NotEqual => left != right,
            Operator::GreaterThan => left > right,
            Operator::GreaterOrEqual => left >= right,
            Operator::LessThan => left < right,
            Operator::LessOrEqual => left <= right,
            _ => false,
        }
    }

    /// Ordering and equality operators only
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Operator::Equal
                | Operator::NotEqual
                | Operator::GreaterThan
                | Operator::GreaterOrEqual
                | Operator::LessThan
                | Operator::LessOrEqual
        )
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s {
            "eq" | "equal" => Operator::Equal,
            "ne" | "not-equal" => Operator::NotEqual,
            "gt" | "greater-than" => Operator::GreaterThan,
            "ge" | "gte" | "greater-or-equal" => Operator::GreaterOrEqual,
            "lt" | "less-than" => Operator::LessThan,
            "le" | "lte" | "less-or-equal" => Operator::LessOrEqual,
            "in" => Operator::In,
            "ni" | "not-in" => Operator::NotIn,
            "regex" => Operator::Regex,
            "contains" => Operator::Contains,
            "intersect" => Operator::Intersect,
            other => {
                return Err(format!(
                    "unknown op '{}', expected one of: {}",
                    other,
                    Operator::NAMES.join(", ")
                ))
            }
        };
        Ok(op)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric view of a value, coercing numeric strings
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => match (a.parse::<f64>(), b.parse::<f64>()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y),
            _ => Some(a.cmp(b)),
        },
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => None,
        _ => as_number(left)?.partial_cmp(&as_number(right)?),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            ordering(left, right) == Some(Ordering::Equal)
        }
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => false,
    }
}

fn member_of(item: &Value, collection: &Value) -> bool {
    match collection {
        Value::Array(items) => items.iter().any(|v| values_equal(item, v)),
        Value::String(s) => item.as_str().is_some_and(|needle| s.contains(needle)),
        other => values_equal(item, other),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|v| values_equal(v, needle)),
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

fn intersects(left: &Value, right: &Value) -> bool {
    let as_list = |v: &Value| -> Vec<Value> {
        match v {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
    };
    let right = as_list(right);
    as_list(left)
        .iter()
        .any(|l| right.iter().any(|r| values_equal(l, r)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_aliases_parse_to_same_operator() {
        assert_eq!("gte".parse::<Operator>(), "greater-or-equal".parse::<Operator>());
        assert_eq!("ni".parse::<Operator>().unwrap(), Operator::NotIn);
        assert!("glob".parse::<Operator>().is_err());
    }

    #[test]
    fn test_numeric_coercion() {
        assert!(Operator::Equal.compare(&json!(22), &json!("22")));
        assert!(Operator::GreaterThan.compare(&json!("100"), &json!(25)));
        assert!(Operator::LessThan.compare(&json!(1.5), &json!(2)));
        assert!(!Operator::GreaterThan.compare(&json!(null), &json!(1)));
    }

    #[test]
    fn test_string_ordering_is_lexical() {
        assert!(Operator::LessThan.compare(&json!("2023-01-01"), &json!("2024-01-01")));
    }

    #[test]
    fn test_membership() {
        assert!(Operator::In.compare(&json!("RUNNING"), &json!(["RUNNING", "STOPPED"])));
        assert!(Operator::NotIn.compare(&json!("TERMINATED"), &json!(["RUNNING"])));
        assert!(Operator::Contains.compare(&json!(["http-server", "ssh"]), &json!("ssh")));
        assert!(Operator::Contains.compare(&json!("default-allow-ssh"), &json!("ssh")));
        assert!(Operator::Intersect.compare(&json!(["a", "b"]), &json!(["c", "b"])));
        assert!(!Operator::Intersect.compare(&json!(["a"]), &json!([])));
    }

    #[test]
    fn test_compare_f64() {
        assert!(Operator::LessThan.compare_f64(0.0, 5.0));
        assert!(!Operator::In.compare_f64(1.0, 1.0));
    }
}
