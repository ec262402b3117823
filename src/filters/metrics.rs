//! Metrics filter
//!
//! Compares one statistic of a time series over a trailing window against a
//! threshold. Resources are split into chunks that run on a bounded pool of
//! spawned tasks; a failing chunk is logged and dropped without failing the
//! filter.
//!
//! ```yaml
//! filters:
//!   - type: metrics
//!     name: compute.googleapis.com/instance/cpu/utilization
//!     days: 7
//!     op: less-than
//!     value: 0.05
//!     missing-value: 0
//! ```

use super::age::lookback;
use super::comparator::{as_number, Operator};
use super::{Filter, FilterContext};
use crate::context::RunContext;
use crate::error::{check_keys, require_keys, EngineError, Result};
use crate::provider::RequestSpec;
use crate::resource::{chunks, lookup_path, Resource, ResourceDef};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Annotation holding fetched datapoints, keyed by `namespace.metric.statistic`
pub const METRICS_ANNOTATION: &str = "resfilter:metrics";

const FILL_DETAIL: &str = "Fill value for missing data";

const METRICS_KEYS: &[&str] = &[
    "name",
    "namespace",
    "statistics",
    "days",
    "period",
    "op",
    "value",
    "missing-value",
    "percent-attr",
    "attr-multiplier",
    "dimensions",
];

/// Fallback namespace per provider service
fn default_namespace(service: &str) -> Option<&'static str> {
    match service {
        "compute" => Some("compute.googleapis.com/instance"),
        "storage" => Some("storage.googleapis.com/storage"),
        "ecs" => Some("acs_ecs_dashboard"),
        "slb" => Some("acs_slb_dashboard"),
        "rds" => Some("acs_rds_dashboard"),
        "eip" => Some("acs_vpc_eip"),
        "cvm" => Some("QCE/CVM"),
        _ => None,
    }
}

/// Aggregation applied per period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Average,
    Sum,
    Maximum,
    Minimum,
    SampleCount,
}

impl Statistic {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "average" => Some(Statistic::Average),
            "sum" => Some(Statistic::Sum),
            "maximum" => Some(Statistic::Maximum),
            "minimum" => Some(Statistic::Minimum),
            "samplecount" => Some(Statistic::SampleCount),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Statistic::Average => "Average",
            Statistic::Sum => "Sum",
            Statistic::Maximum => "Maximum",
            Statistic::Minimum => "Minimum",
            Statistic::SampleCount => "SampleCount",
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query window, frozen once per filter invocation
#[derive(Debug, Clone, PartialEq)]
pub struct MetricWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period: u64,
    pub statistic: Statistic,
}

impl MetricWindow {
    /// The window `span` long ending at `end`; `None` if the start underflows
    pub fn ending_at(end: DateTime<Utc>, span: Duration, period: u64, statistic: Statistic) -> Option<Self> {
        Some(Self {
            start: end.checked_sub_signed(span)?,
            end,
            period,
            statistic,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct MetricsSpec {
    name: String,
    value: f64,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    statistics: Option<String>,
    #[serde(default)]
    days: Option<f64>,
    #[serde(default)]
    period: Option<u64>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    missing_value: Option<f64>,
    #[serde(default)]
    percent_attr: Option<String>,
    #[serde(default)]
    attr_multiplier: Option<f64>,
    #[serde(default)]
    dimensions: BTreeMap<String, Value>,
}

/// Everything a chunk worker needs, shared across spawned tasks
#[derive(Debug, Clone)]
struct MetricQuery {
    service: String,
    namespace: String,
    metric: String,
    statistic: Statistic,
    span: Duration,
    period: u64,
    op: Operator,
    threshold: f64,
    missing_value: Option<f64>,
    percent_attr: Option<String>,
    attr_multiplier: Option<f64>,
    dimension: String,
    dimension_name: String,
    extra_dimensions: Vec<(String, String)>,
    datapoints_path: String,
}

struct BoundQuery {
    query: MetricQuery,
    window: MetricWindow,
}

#[derive(Debug)]
pub struct MetricsFilter {
    kind: String,
    query: MetricQuery,
}

impl MetricsFilter {
    pub fn from_spec(kind: &str, resource_def: &ResourceDef, spec: &Map<String, Value>) -> Result<Self> {
        check_keys("filter", kind, spec, METRICS_KEYS)?;
        require_keys("filter", kind, spec, &["name", "value"])?;

        let mut fields = spec.clone();
        fields.remove("type");
        let parsed: MetricsSpec = serde_json::from_value(Value::Object(fields))
            .map_err(|e| EngineError::invalid_filter(kind, e.to_string()))?;

        let metrics_def = resource_def.metrics.as_ref().ok_or_else(|| {
            EngineError::invalid_filter(
                kind,
                format!("resource type '{}' has no metrics", resource_def.display_name),
            )
        })?;

        let namespace = parsed
            .namespace
            .clone()
            .or_else(|| metrics_def.namespace.clone())
            .or_else(|| default_namespace(&resource_def.service).map(|s| s.to_string()))
            .ok_or_else(|| EngineError::invalid_filter(kind, "no namespace configured or known"))?;

        let statistic = match parsed.statistics.as_deref() {
            None => Statistic::Average,
            Some(s) => Statistic::parse(s).ok_or_else(|| {
                EngineError::invalid_filter(kind, format!("unknown statistics '{}'", s))
            })?,
        };

        let op = match parsed.op.as_deref() {
            None => Operator::LessThan,
            Some(s) => s.parse().map_err(|e: String| EngineError::invalid_filter(kind, e))?,
        };
        if !op.is_scalar() {
            return Err(EngineError::invalid_filter(
                kind,
                format!("op '{}' cannot compare metric values", op),
            ));
        }

        let days = parsed.days.unwrap_or(1.0);
        if days <= 0.0 {
            return Err(EngineError::invalid_filter(kind, "days must be positive"));
        }
        let span = lookback(kind, days * 86_400.0)?;
        let period = parsed.period.unwrap_or((days * 86_400.0) as u64).max(1);

        let extra_dimensions = parsed
            .dimensions
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect();

        Ok(Self {
            kind: kind.to_string(),
            query: MetricQuery {
                service: metrics_def.service.clone(),
                namespace,
                metric: parsed.name,
                statistic,
                span,
                period,
                op,
                threshold: parsed.value,
                missing_value: parsed.missing_value,
                percent_attr: parsed.percent_attr,
                attr_multiplier: parsed.attr_multiplier,
                dimension: metrics_def.dimension.clone(),
                dimension_name: metrics_def.dimension_name().to_string(),
                extra_dimensions,
                datapoints_path: metrics_def.datapoints_path.clone(),
            },
        })
    }

    pub fn cache_key(&self) -> String {
        self.query.cache_key()
    }
}

impl MetricQuery {
    fn cache_key(&self) -> String {
        format!("{}.{}.{}", self.namespace, self.metric, self.statistic)
    }
}

impl BoundQuery {
    fn request(&self, dimension_value: &str) -> RequestSpec {
        let q = &self.query;
        let mut dimensions = vec![json!({"name": q.dimension_name, "value": dimension_value})];
        dimensions.extend(
            q.extra_dimensions
                .iter()
                .map(|(name, value)| json!({"name": name, "value": value})),
        );
        RequestSpec::with_params(
            "get_metric_statistics",
            json!({
                "namespace": q.namespace,
                "metric": q.metric,
                "statistic": q.statistic.as_str(),
                "period": self.window.period,
                "start": self.window.start.to_rfc3339(),
                "end": self.window.end.to_rfc3339(),
                "dimensions": dimensions,
            }),
        )
    }

    async fn fetch_datapoints(&self, run: &RunContext, resource: &Resource, dimension_value: &str) -> Result<Vec<Value>> {
        let q = &self.query;
        let response = run
            .fetch(&q.service, &self.request(dimension_value))
            .await
            .map_err(|e| {
                e.into_engine(|source| EngineError::Fetch {
                    resource: format!("{} metrics for {}", q.metric, resource.id()),
                    source,
                })
            })?;
        Ok(lookup_path(&response, &q.datapoints_path)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Fetch (or reuse) datapoints, then compare
    async fn evaluate(&self, run: &RunContext, resource: &mut Resource) -> Result<bool> {
        let q = &self.query;
        let key = q.cache_key();
        let stat = q.statistic.as_str();

        let cached = resource
            .get(METRICS_ANNOTATION)
            .and_then(|m| m.get(&key))
            .and_then(|v| v.as_array())
            .cloned();

        let mut datapoints = match cached {
            Some(points) => points,
            None => {
                let dimension_value = match resource.lookup(&q.dimension) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => {
                        tracing::debug!("{} has no {}, skipping metrics", resource.id(), q.dimension);
                        return Ok(false);
                    }
                    Some(other) => other.to_string(),
                };
                self.fetch_datapoints(run, resource, &dimension_value).await?
            }
        };

        if datapoints.is_empty() {
            if let Some(fill) = q.missing_value {
                datapoints.push(json!({
                    "Timestamp": self.window.start.to_rfc3339(),
                    (stat): fill,
                    "detail": FILL_DETAIL,
                }));
            }
        }

        if let Some(cache) = resource.annotation_object(METRICS_ANNOTATION) {
            cache.insert(key, Value::Array(datapoints.clone()));
        }

        let Some(value) = datapoints.first().and_then(|d| d.get(stat)).and_then(as_number) else {
            return Ok(false);
        };

        let value = match &q.percent_attr {
            Some(attr) => {
                let base = resource.lookup(attr).and_then(as_number).unwrap_or(0.0)
                    * q.attr_multiplier.unwrap_or(1.0);
                if base == 0.0 {
                    tracing::warn!("{} has no usable {} for percent metrics", resource.id(), attr);
                    return Ok(false);
                }
                value / base * 100.0
            }
            None => value,
        };

        Ok(q.op.compare_f64(value, q.threshold))
    }

    async fn process_chunk(&self, run: &RunContext, chunk: Vec<(usize, Resource)>) -> Result<Vec<(usize, Resource)>> {
        run.check_cancelled()?;
        let mut matched = Vec::new();
        for (index, mut resource) in chunk {
            if self.evaluate(run, &mut resource).await? {
                matched.push((index, resource));
            }
        }
        Ok(matched)
    }
}

#[async_trait]
impl Filter for MetricsFilter {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn process(&self, ctx: &FilterContext, resources: Vec<Resource>) -> Result<Vec<Resource>> {
        let config = ctx.run.config();
        let window = MetricWindow::ending_at(Utc::now(), self.query.span, self.query.period, self.query.statistic)
            .ok_or_else(|| EngineError::invalid_filter(&self.kind, "metrics window out of range"))?;
        let bound = Arc::new(BoundQuery {
            query: self.query.clone(),
            window,
        });

        let indexed: Vec<(usize, Resource)> = resources.into_iter().enumerate().collect();
        let batches = chunks(indexed, config.metrics_chunk_size);
        let total = batches.len();
        tracing::debug!(
            "Querying {} for {} chunks ({} workers)",
            self.query.metric,
            total,
            config.metrics_workers
        );

        let mut completed = stream::iter(batches.into_iter().enumerate())
            .map(|(chunk, batch)| {
                let run = ctx.run.clone();
                let bound = bound.clone();
                let handle = tokio::spawn(async move { bound.process_chunk(&run, batch).await });
                async move { (chunk, handle.await) }
            })
            .buffer_unordered(config.metrics_workers.max(1));

        // Drained here only; workers never touch the merged list
        let mut matched: Vec<(usize, Resource)> = Vec::new();
        let mut cancelled = false;
        while let Some((chunk, joined)) = completed.next().await {
            let message = match joined {
                Ok(Ok(mut part)) => {
                    matched.append(&mut part);
                    continue;
                }
                Ok(Err(EngineError::Cancelled)) => {
                    cancelled = true;
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(join_err) => join_err.to_string(),
            };
            let err = EngineError::ChunkProcessing {
                chunk: chunk + 1,
                message,
            };
            tracing::warn!("Metrics retrieval error ({} of {}): {}", chunk + 1, total, err);
        }

        if cancelled {
            return Err(EngineError::Cancelled);
        }

        matched.sort_by_key(|(index, _)| *index);
        Ok(matched.into_iter().map(|(_, r)| r).collect())
    }
}
