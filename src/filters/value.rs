//! Value filter
//!
//! `{type: value, key, op, value, value_type}`. The matching half
//! ([`ValueMatcher`]) is shared with the permission filter, where `Cidr`,
//! `Description` and friends are value specs without a `key`.

use super::age::{lookback, parse_timestamp, threshold_before};
use super::comparator::{as_number, Operator};
use super::{Filter, FilterContext};
use crate::error::{check_keys, EngineError, Result};
use crate::resource::Resource;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::net::IpAddr;

/// Keys accepted by a value spec
pub const VALUE_KEYS: &[&str] = &["key", "op", "value", "value_type"];

/// Existence checks expressed as a sentinel `value` or `op`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sentinel {
    Absent,
    Present,
    Empty,
    NotNull,
}

impl Sentinel {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "absent" => Some(Sentinel::Absent),
            "present" => Some(Sentinel::Present),
            "empty" => Some(Sentinel::Empty),
            "not-null" => Some(Sentinel::NotNull),
            _ => None,
        }
    }

    fn check(&self, found: Option<&Value>) -> bool {
        match self {
            Sentinel::Absent => found.is_none(),
            Sentinel::Present => found.is_some(),
            Sentinel::Empty => found.map_or(true, is_empty),
            Sentinel::NotNull => found.is_some_and(|v| !is_empty(v)),
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(b) => !b,
        Value::Number(_) => false,
    }
}

/// Conversion applied to both operands before comparing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Age,
    Integer,
    Normalize,
    Size,
    Cidr,
    Swap,
}

impl ValueType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "age" => Some(ValueType::Age),
            "integer" => Some(ValueType::Integer),
            "normalize" => Some(ValueType::Normalize),
            "size" => Some(ValueType::Size),
            "cidr" => Some(ValueType::Cidr),
            "swap" => Some(ValueType::Swap),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Check {
    Sentinel(Sentinel),
    Compare(Operator),
}

/// Compiled `op`/`value`/`value_type` triple
#[derive(Debug, Clone)]
pub struct ValueMatcher {
    check: Check,
    value: Value,
    value_type: Option<ValueType>,
    regex: Option<Regex>,
    /// Look-back for `value_type: age`, checked at build time
    age_window: Option<Duration>,
}

impl ValueMatcher {
    /// Build from a value spec. A bare scalar is shorthand for `{value: x}`.
    pub fn from_spec(name: &str, spec: &Value) -> Result<Self> {
        match spec {
            Value::Object(map) => Self::from_map(name, map),
            Value::Array(_) => Err(EngineError::invalid_filter(
                name,
                "expected a value or a value filter mapping",
            )),
            scalar => Self::build(name, None, scalar.clone(), None),
        }
    }

    fn from_map(name: &str, map: &Map<String, Value>) -> Result<Self> {
        let op = match map.get("op") {
            None => None,
            Some(Value::String(s)) => Some(s.as_str()),
            Some(other) => {
                return Err(EngineError::invalid_filter(
                    name,
                    format!("op must be a string, got {}", other),
                ))
            }
        };
        let value_type = match map.get("value_type") {
            None => None,
            Some(Value::String(s)) => Some(ValueType::parse(s).ok_or_else(|| {
                EngineError::invalid_filter(name, format!("unknown value_type '{}'", s))
            })?),
            Some(other) => {
                return Err(EngineError::invalid_filter(
                    name,
                    format!("value_type must be a string, got {}", other),
                ))
            }
        };
        let value = map.get("value").cloned().unwrap_or(Value::Null);
        Self::build(name, op, value, value_type)
    }

    fn build(
        name: &str,
        op: Option<&str>,
        value: Value,
        value_type: Option<ValueType>,
    ) -> Result<Self> {
        let op_sentinel = op.and_then(Sentinel::parse);
        let value_sentinel = value.as_str().and_then(Sentinel::parse);

        let check = match (op, op_sentinel, value_sentinel) {
            (_, Some(sentinel), _) => Check::Sentinel(sentinel),
            (None, None, Some(sentinel)) => Check::Sentinel(sentinel),
            (Some(op), None, _) => {
                Check::Compare(op.parse().map_err(|e: String| EngineError::invalid_filter(name, e))?)
            }
            (None, None, None) => Check::Compare(Operator::Equal),
        };

        let regex = match &check {
            Check::Compare(Operator::Regex) => {
                let pattern = value.as_str().ok_or_else(|| {
                    EngineError::invalid_filter(name, "regex op requires a string value")
                })?;
                let anchored = format!("^(?:{})", pattern);
                Some(Regex::new(&anchored).map_err(|e| {
                    EngineError::invalid_filter(name, format!("invalid regex '{}': {}", pattern, e))
                })?)
            }
            _ => None,
        };

        let age_window = match value_type {
            Some(ValueType::Age) => {
                let days = as_number(&value).ok_or_else(|| {
                    EngineError::invalid_filter(name, "value_type age requires a numeric value (days)")
                })?;
                Some(lookback(name, days * 86_400.0)?)
            },
            _ => None,
        };

        Ok(Self {
            check,
            value,
            value_type,
            regex,
            age_window,
        })
    }

    /// Evaluate against an extracted attribute (`None` when missing)
    pub fn matches(&self, found: Option<&Value>) -> bool {
        let op = match &self.check {
            Check::Sentinel(sentinel) => return sentinel.check(found),
            Check::Compare(op) => *op,
        };
        let Some(found) = found else {
            return false;
        };

        if let Some(regex) = &self.regex {
            return match found {
                Value::String(s) => regex.is_match(s),
                Value::Null => false,
                other => regex.is_match(&other.to_string()),
            };
        }

        match self.value_type {
            None => op.compare(found, &self.value),
            Some(ValueType::Swap) => op.compare(&self.value, found),
            Some(ValueType::Normalize) => {
                let normalized = match found {
                    Value::String(s) => Value::String(s.trim().to_lowercase()),
                    other => other.clone(),
                };
                op.compare(&normalized, &self.value)
            }
            Some(ValueType::Integer) => {
                let n = as_number(found).map(|f| f.trunc()).unwrap_or(0.0);
                op.compare(&Value::from(n), &self.value)
            }
            Some(ValueType::Size) => {
                let size = match found {
                    Value::String(s) => s.chars().count(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                op.compare(&Value::from(size), &self.value)
            }
            Some(ValueType::Age) => self.compare_age(op, found),
            Some(ValueType::Cidr) => compare_cidr(op, found, &self.value),
        }
    }

    /// Older-than semantics: `op(now - days, resource_date)`
    fn compare_age(&self, op: Operator, found: &Value) -> bool {
        let Some(window) = self.age_window else {
            return false;
        };
        let Some((resource_date, _)) = parse_timestamp(found) else {
            return false;
        };
        let Ok(threshold) = threshold_before("value", Utc::now(), window) else {
            return false;
        };
        op.compare_f64(threshold.timestamp() as f64, resource_date.timestamp() as f64)
    }
}

/// `{type: value, key: ..., ...}`
#[derive(Debug)]
pub struct ValueFilter {
    key: String,
    matcher: ValueMatcher,
}

impl ValueFilter {
    pub fn from_spec(spec: &Map<String, Value>) -> Result<Self> {
        check_keys("filter", "value", spec, VALUE_KEYS)?;
        let key = spec
            .get("key")
            .and_then(|k| k.as_str())
            .ok_or_else(|| EngineError::invalid_filter("value", "missing required key: key"))?;
        let matcher = ValueMatcher::from_map(key, spec)?;
        Ok(Self {
            key: key.to_string(),
            matcher,
        })
    }

    /// `{attr: value}` single-key shorthand
    pub fn shorthand(key: &str, value: &Value) -> Result<Self> {
        Ok(Self {
            key: key.to_string(),
            matcher: ValueMatcher::from_spec(key, value)?,
        })
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.matcher.matches(resolve_key(resource, &self.key))
    }
}

#[async_trait]
impl Filter for ValueFilter {
    fn kind(&self) -> &str {
        "value"
    }

    async fn process(&self, _ctx: &FilterContext, resources: Vec<Resource>) -> Result<Vec<Resource>> {
        Ok(resources.into_iter().filter(|r| self.matches(r)).collect())
    }
}

/// Attribute lookup with `tag:` support.
///
/// `tag:env` checks GCP `labels`, a `tags` map, and tag lists shaped
/// `[{Key, Value}]` or `{Tag: [{TagKey, TagValue}]}`.
pub fn resolve_key<'a>(resource: &'a Resource, key: &str) -> Option<&'a Value> {
    let Some(tag) = key.strip_prefix("tag:") else {
        return resource.lookup(key);
    };

    for map_key in ["labels", "tags"] {
        if let Some(Value::Object(map)) = resource.get(map_key) {
            if let Some(v) = map.get(tag) {
                return Some(v);
            }
        }
    }

    let list = match resource.get("Tags") {
        Some(Value::Array(items)) => Some(items),
        Some(Value::Object(obj)) => obj.get("Tag").and_then(|t| t.as_array()),
        _ => None,
    }?;
    list.iter().find_map(|entry| {
        let name = entry.get("Key").or_else(|| entry.get("TagKey"))?;
        if name.as_str() == Some(tag) {
            entry.get("Value").or_else(|| entry.get("TagValue"))
        } else {
            None
        }
    })
}

/// An IP network parsed from `addr/prefix` or a bare address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr.parse::<IpAddr>().ok()?, Some(prefix.parse::<u8>().ok()?)),
            None => (s.parse::<IpAddr>().ok()?, None),
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return None;
        }
        Some(Self { addr, prefix })
    }

    fn bits(&self) -> (u128, u8) {
        match self.addr {
            IpAddr::V4(v4) => (u32::from(v4) as u128, 32),
            IpAddr::V6(v6) => (u128::from(v6), 128),
        }
    }

    fn masked(&self, prefix: u8) -> u128 {
        let (bits, width) = self.bits();
        if prefix == 0 {
            return 0;
        }
        let host_bits = (width - prefix) as u32;
        (bits >> host_bits) << host_bits
    }

    /// `other` lies entirely inside `self`
    pub fn contains(&self, other: &Network) -> bool {
        self.addr.is_ipv4() == other.addr.is_ipv4()
            && self.prefix <= other.prefix
            && self.masked(self.prefix) == other.masked(self.prefix)
    }

    /// Same network after masking
    pub fn same_network(&self, other: &Network) -> bool {
        self.prefix == other.prefix && self.contains(other)
    }
}

fn networks(value: &Value) -> Vec<Network> {
    match value {
        Value::String(s) => Network::parse(s).into_iter().collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().and_then(Network::parse))
            .collect(),
        _ => Vec::new(),
    }
}

fn compare_cidr(op: Operator, found: &Value, configured: &Value) -> bool {
    let Some(found) = found.as_str().and_then(Network::parse) else {
        return false;
    };
    let configured = networks(configured);
    match op {
        Operator::In => configured.iter().any(|n| n.contains(&found)),
        Operator::NotIn => !configured.iter().any(|n| n.contains(&found)),
        Operator::Equal => configured.iter().any(|n| n.same_network(&found)),
        Operator::NotEqual => !configured.iter().any(|n| n.same_network(&found)),
        Operator::Contains => configured.iter().any(|n| found.contains(n)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(value: Value) -> Resource {
        Resource::from_value("name", value).unwrap()
    }

    fn filter(spec: Value) -> Result<ValueFilter> {
        ValueFilter::from_spec(spec.as_object().unwrap())
    }

    #[test]
    fn test_equal_default_op() {
        let f = filter(json!({"type": "value", "key": "status", "value": "RUNNING"})).unwrap();
        assert!(f.matches(&resource(json!({"name": "a", "status": "RUNNING"}))));
        assert!(!f.matches(&resource(json!({"name": "a", "status": "STOPPED"}))));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = filter(json!({"type": "value", "key": "k", "value": 1, "vlaue": 2})).unwrap_err();
        assert!(err.to_string().contains("vlaue"));
    }

    #[test]
    fn test_bad_regex_rejected_at_validation() {
        let err = filter(json!({"key": "name", "op": "regex", "value": "(unclosed"})).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_regex_anchored_at_start() {
        let f = filter(json!({"key": "name", "op": "regex", "value": "prod-.*"})).unwrap();
        assert!(f.matches(&resource(json!({"name": "prod-web"}))));
        assert!(!f.matches(&resource(json!({"name": "legacy-prod-web"}))));
    }

    #[test]
    fn test_sentinels() {
        let absent = ValueFilter::shorthand("tag:owner", &json!("absent")).unwrap();
        let present = ValueFilter::shorthand("tag:owner", &json!("present")).unwrap();
        let labelled = resource(json!({"name": "a", "labels": {"owner": "ops"}}));
        let bare = resource(json!({"name": "b"}));
        assert!(absent.matches(&bare));
        assert!(!absent.matches(&labelled));
        assert!(present.matches(&labelled));

        let empty = filter(json!({"key": "tags", "op": "empty"})).unwrap();
        assert!(empty.matches(&resource(json!({"name": "c", "tags": []}))));
        assert!(empty.matches(&bare));
    }

    #[test]
    fn test_tag_lists() {
        let f = ValueFilter::shorthand("tag:env", &json!("prod")).unwrap();
        let aws_style = resource(json!({"name": "a", "Tags": [{"Key": "env", "Value": "prod"}]}));
        let aliyun_style = resource(json!({"name": "b", "Tags": {"Tag": [{"TagKey": "env", "TagValue": "prod"}]}}));
        assert!(f.matches(&aws_style));
        assert!(f.matches(&aliyun_style));
    }

    #[test]
    fn test_value_types() {
        let size = filter(json!({"key": "disks", "value_type": "size", "op": "gt", "value": 1})).unwrap();
        assert!(size.matches(&resource(json!({"name": "a", "disks": [1, 2]}))));

        let norm = filter(json!({"key": "status", "value_type": "normalize", "value": "running"})).unwrap();
        assert!(norm.matches(&resource(json!({"name": "a", "status": "RUNNING"}))));

        let int = filter(json!({"key": "count", "value_type": "integer", "op": "ge", "value": 3})).unwrap();
        assert!(int.matches(&resource(json!({"name": "a", "count": " 3 "}))));

        let swap = filter(json!({"key": "envs", "value_type": "swap", "op": "in", "value": "prod"})).unwrap();
        assert!(swap.matches(&resource(json!({"name": "a", "envs": ["prod", "dev"]}))));
    }

    #[test]
    fn test_age_value_type() {
        let f = filter(json!({"key": "created", "value_type": "age", "op": "gt", "value": 30})).unwrap();
        let old = (Utc::now() - Duration::days(90)).to_rfc3339();
        let new = (Utc::now() - Duration::days(2)).to_rfc3339();
        assert!(f.matches(&resource(json!({"name": "a", "created": old}))));
        assert!(!f.matches(&resource(json!({"name": "b", "created": new}))));
        assert!(filter(json!({"key": "created", "value_type": "age", "value": "old"})).is_err());
    }

    #[test]
    fn test_age_value_type_rejects_huge_window() {
        let err = filter(json!({"key": "creationTimestamp", "value_type": "age", "op": "gt", "value": 1e12}))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(filter(json!({"key": "created", "value_type": "age", "value": -1})).is_err());
    }

    #[test]
    fn test_cidr_value_type() {
        let inside = filter(json!({"key": "range", "value_type": "cidr", "op": "in", "value": "10.0.0.0/8"})).unwrap();
        assert!(inside.matches(&resource(json!({"name": "a", "range": "10.1.2.0/24"}))));
        assert!(!inside.matches(&resource(json!({"name": "b", "range": "0.0.0.0/0"}))));

        let eq = filter(json!({"key": "range", "value_type": "cidr", "value": "10.1.2.3/24"})).unwrap();
        assert!(eq.matches(&resource(json!({"name": "c", "range": "10.1.2.0/24"}))));
    }

    #[test]
    fn test_network_contains() {
        let any = Network::parse("0.0.0.0/0").unwrap();
        let host = Network::parse("192.168.1.5").unwrap();
        assert!(any.contains(&host));
        assert!(!host.contains(&any));
        let v6 = Network::parse("::/0").unwrap();
        assert!(!v6.contains(&host));
        assert!(Network::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn test_missing_attribute_never_compares() {
        let f = filter(json!({"key": "missing", "op": "ne", "value": "x"})).unwrap();
        assert!(!f.matches(&resource(json!({"name": "a"}))));
    }
}
