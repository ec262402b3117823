//! Age filter
//!
//! `{type: age, days, hours, minutes, op}` against the resource type's
//! `date_field`. Matches resources created before `now - (days+hours+minutes)`
//! with the default `greater-than` op.

use super::comparator::Operator;
use super::{Filter, FilterContext};
use crate::error::{check_keys, EngineError, Result};
use crate::resource::{Resource, ResourceDef};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

const AGE_KEYS: &[&str] = &["days", "hours", "minutes", "op"];

/// Longest look-back accepted by age and metrics windows (about 270 years)
pub const MAX_LOOKBACK_DAYS: f64 = 100_000.0;

/// Validate a look-back of `seconds` and turn it into a duration.
///
/// Rejects non-finite, negative and out of range values so the window can
/// always be subtracted from the current time.
pub(crate) fn lookback(kind: &str, seconds: f64) -> Result<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(EngineError::invalid_filter(
            kind,
            format!("window must be a non-negative number, got {}", seconds),
        ));
    }
    if seconds > MAX_LOOKBACK_DAYS * 86_400.0 {
        return Err(EngineError::invalid_filter(
            kind,
            format!("window exceeds {} days", MAX_LOOKBACK_DAYS),
        ));
    }
    Duration::try_seconds(seconds as i64)
        .ok_or_else(|| EngineError::invalid_filter(kind, "window out of range"))
}

/// `now - window`, or an error when the instant is not representable
pub(crate) fn threshold_before(kind: &str, now: DateTime<Utc>, window: Duration) -> Result<DateTime<Utc>> {
    now.checked_sub_signed(window)
        .ok_or_else(|| EngineError::invalid_filter(kind, "window reaches before the earliest date"))
}

#[derive(Debug, Deserialize)]
struct AgeSpec {
    #[serde(default)]
    days: f64,
    #[serde(default)]
    hours: f64,
    #[serde(default)]
    minutes: f64,
    #[serde(default)]
    op: Option<String>,
}

#[derive(Debug)]
pub struct AgeFilter {
    kind: String,
    date_field: String,
    clock_offset_hours: i64,
    op: Operator,
    window: Duration,
}

impl AgeFilter {
    pub fn from_spec(kind: &str, resource_def: &ResourceDef, spec: &Map<String, Value>) -> Result<Self> {
        check_keys("filter", kind, spec, AGE_KEYS)?;
        let mut fields = spec.clone();
        fields.remove("type");
        let parsed: AgeSpec = serde_json::from_value(Value::Object(fields))
            .map_err(|e| EngineError::invalid_filter(kind, e.to_string()))?;

        let op = match parsed.op.as_deref() {
            None => Operator::GreaterThan,
            Some(s) => s.parse().map_err(|e: String| EngineError::invalid_filter(kind, e))?,
        };
        if !op.is_scalar() {
            return Err(EngineError::invalid_filter(
                kind,
                format!("op '{}' cannot compare dates", op),
            ));
        }

        let date_field = resource_def.date_field.clone().ok_or_else(|| {
            EngineError::invalid_filter(
                kind,
                format!("resource type '{}' has no date_field", resource_def.display_name),
            )
        })?;

        let seconds = parsed.days * 86_400.0 + parsed.hours * 3_600.0 + parsed.minutes * 60.0;
        let window = lookback(kind, seconds)?;
        Ok(Self {
            kind: kind.to_string(),
            date_field,
            clock_offset_hours: resource_def.clock_offset_hours,
            op,
            window,
        })
    }

    fn resource_date(&self, resource: &Resource) -> Option<DateTime<Utc>> {
        let (date, naive) = parse_timestamp(resource.lookup(&self.date_field)?)?;
        if naive {
            date.checked_add_signed(Duration::try_hours(self.clock_offset_hours)?)
        } else {
            Some(date)
        }
    }

    fn matches(&self, resource: &Resource, threshold: DateTime<Utc>) -> bool {
        match self.resource_date(resource) {
            Some(date) => self
                .op
                .compare_f64(threshold.timestamp() as f64, date.timestamp() as f64),
            None => {
                tracing::debug!(
                    "No parsable {} on {}, skipping",
                    self.date_field,
                    resource.id()
                );
                false
            }
        }
    }
}

#[async_trait]
impl Filter for AgeFilter {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn process(&self, _ctx: &FilterContext, resources: Vec<Resource>) -> Result<Vec<Resource>> {
        let threshold = threshold_before(&self.kind, Utc::now(), self.window)?;
        Ok(resources
            .into_iter()
            .filter(|r| self.matches(r, threshold))
            .collect())
    }
}

/// Parse a provider timestamp.
///
/// Returns the instant in UTC and whether the input carried no zone
/// information. Accepts RFC 3339, `YYYY-MM-DDTHH:MMZ`, naive date-times,
/// plain dates and epoch seconds or milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<(DateTime<Utc>, bool)> {
    match value {
        Value::Number(n) => {
            let raw = n.as_f64()?;
            let secs = if raw > 1e12 { raw / 1000.0 } else { raw };
            Utc.timestamp_opt(secs as i64, 0).single().map(|d| (d, false))
        }
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<(DateTime<Utc>, bool)> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some((dt.with_timezone(&Utc), false));
    }

    // Minute precision with an explicit Z, e.g. "2017-12-05T22:40Z"
    if let Some(stripped) = s.strip_suffix('Z') {
        if let Ok(naive) = NaiveDateTime::parse_from_str(stripped, "%Y-%m-%dT%H:%M") {
            return Some((Utc.from_utc_datetime(&naive), false));
        }
    }

    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some((Utc.from_utc_datetime(&naive), true));
        }
    }

    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Some((Utc.from_utc_datetime(&midnight), true))
}
