//! Filters
//!
//! A policy's `filters:` list is built into a [`FilterChain`] through an
//! explicit [`FilterRegistry`] (type string → factory). Every filter is
//! validated while the chain is built, so a bad spec rejects the policy before
//! any resource is fetched.
//!
//! # Module Structure
//!
//! - [`comparator`] - Named comparison operators
//! - [`value`] - Value filter and the shared value matcher
//! - [`age`] - Creation date filter
//! - [`permissions`] - Ingress/egress rule matcher
//! - [`metrics`] - Windowed time-series threshold filter

pub mod age;
pub mod comparator;
pub mod metrics;
pub mod permissions;
pub mod value;

use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::resource::{Resource, ResourceDef, ResourceQueryManager};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

pub use age::AgeFilter;
pub use comparator::Operator;
pub use metrics::MetricsFilter;
pub use permissions::PermissionFilter;
pub use value::{ValueFilter, ValueMatcher};

/// What a filter sees besides the candidate list
#[derive(Clone)]
pub struct FilterContext {
    pub run: RunContext,
    pub resource_key: String,
    pub resource_def: Arc<ResourceDef>,
    pub manager: Arc<ResourceQueryManager>,
}

impl FilterContext {
    pub fn new(
        run: RunContext,
        manager: Arc<ResourceQueryManager>,
        resource_key: &str,
    ) -> Result<Self> {
        let resource_def = Arc::new(manager.resource_def(resource_key)?.clone());
        Ok(Self {
            run,
            resource_key: resource_key.to_string(),
            resource_def,
            manager,
        })
    }
}

/// A predicate or annotator over the candidate list.
///
/// Implementations only drop resources or add annotation keys; they never
/// add resources.
#[async_trait]
pub trait Filter: Send + Sync + fmt::Debug {
    fn kind(&self) -> &str;

    async fn process(&self, ctx: &FilterContext, resources: Vec<Resource>) -> Result<Vec<Resource>>;
}

/// Builds a filter from its spec. Receives the registry for nested specs.
pub type FilterFactory =
    fn(&FilterRegistry, &str, &ResourceDef, &Map<String, Value>) -> Result<Box<dyn Filter>>;

fn value_factory(_: &FilterRegistry, _: &str, _: &ResourceDef, spec: &Map<String, Value>) -> Result<Box<dyn Filter>> {
    Ok(Box::new(ValueFilter::from_spec(spec)?))
}

fn age_factory(_: &FilterRegistry, kind: &str, def: &ResourceDef, spec: &Map<String, Value>) -> Result<Box<dyn Filter>> {
    Ok(Box::new(AgeFilter::from_spec(kind, def, spec)?))
}

fn permission_factory(_: &FilterRegistry, kind: &str, def: &ResourceDef, spec: &Map<String, Value>) -> Result<Box<dyn Filter>> {
    Ok(Box::new(PermissionFilter::from_spec(kind, def, spec)?))
}

fn metrics_factory(_: &FilterRegistry, kind: &str, def: &ResourceDef, spec: &Map<String, Value>) -> Result<Box<dyn Filter>> {
    Ok(Box::new(MetricsFilter::from_spec(kind, def, spec)?))
}

/// Type string → factory map, built once at startup
#[derive(Clone, Default)]
pub struct FilterRegistry {
    factories: BTreeMap<&'static str, FilterFactory>,
}

impl FilterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in filter type
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("value", value_factory);
        registry.register("age", age_factory);
        registry.register("instance-age", age_factory);
        registry.register("ingress", permission_factory);
        registry.register("egress", permission_factory);
        registry.register("metrics", metrics_factory);
        registry
    }

    pub fn register(&mut self, type_name: &'static str, factory: FilterFactory) {
        self.factories.insert(type_name, factory);
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Validate and build one filter spec
    pub fn build(&self, resource_def: &ResourceDef, spec: &Value) -> Result<Box<dyn Filter>> {
        let Value::Object(map) = spec else {
            return Err(EngineError::invalid_filter(
                "filter",
                format!("expected a mapping, got {}", spec),
            ));
        };

        let type_name = match map.get("type") {
            Some(Value::String(t)) => t.as_str(),
            Some(other) => {
                return Err(EngineError::invalid_filter(
                    "filter",
                    format!("type must be a string, got {}", other),
                ))
            }
            None if map.len() == 1 => {
                let Some((key, value)) = map.iter().next() else {
                    return Err(EngineError::invalid_filter("filter", "empty filter"));
                };
                if let Some(op) = BoolOp::parse(key) {
                    return Ok(Box::new(BooleanFilter::build(self, op, resource_def, value)?));
                }
                return Ok(Box::new(ValueFilter::shorthand(key, value)?));
            }
            None => {
                let mut keys: Vec<&str> = map.keys().map(|k| k.as_str()).collect();
                keys.sort_unstable();
                return Err(EngineError::invalid_filter(
                    "filter",
                    format!("missing type (keys: {})", keys.join(", ")),
                ));
            }
        };

        let factory = self.factories.get(type_name).ok_or_else(|| {
            EngineError::invalid_filter(
                type_name,
                format!("unknown filter type, expected one of: {}", self.types().join(", ")),
            )
        })?;
        factory(self, type_name, resource_def, map)
    }

    /// Validate and build an ordered chain
    pub fn build_chain(&self, resource_def: &ResourceDef, specs: &[Value]) -> Result<FilterChain> {
        let filters = specs
            .iter()
            .map(|spec| self.build(resource_def, spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(FilterChain { filters })
    }
}

/// Ordered filters; each sees only the survivors of the previous one
#[derive(Debug, Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn kinds(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.kind()).collect()
    }

    pub async fn apply(&self, ctx: &FilterContext, resources: Vec<Resource>) -> Result<Vec<Resource>> {
        let mut current = resources;
        for filter in &self.filters {
            ctx.run.check_cancelled()?;
            if current.is_empty() {
                break;
            }
            let before = current.len();
            current = filter.process(ctx, current).await?;
            tracing::debug!(
                filter = filter.kind(),
                before,
                after = current.len(),
                "Filter applied"
            );
        }
        Ok(current)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoolOp {
    Or,
    And,
    Not,
}

impl BoolOp {
    fn parse(key: &str) -> Option<Self> {
        match key {
            "or" => Some(BoolOp::Or),
            "and" => Some(BoolOp::And),
            "not" => Some(BoolOp::Not),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            BoolOp::Or => "or",
            BoolOp::And => "and",
            BoolOp::Not => "not",
        }
    }
}

/// `{or: [...]}`, `{and: [...]}`, `{not: [...]}`
#[derive(Debug)]
pub struct BooleanFilter {
    op: BoolOp,
    filters: Vec<Box<dyn Filter>>,
}

impl BooleanFilter {
    fn build(registry: &FilterRegistry, op: BoolOp, def: &ResourceDef, specs: &Value) -> Result<Self> {
        let Value::Array(specs) = specs else {
            return Err(EngineError::invalid_filter(
                op.as_str(),
                "expected a list of filters",
            ));
        };
        if specs.is_empty() {
            return Err(EngineError::invalid_filter(op.as_str(), "empty filter list"));
        }
        let filters = specs
            .iter()
            .map(|spec| registry.build(def, spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { op, filters })
    }

    /// Resources surviving every nested filter in sequence
    async fn all_of(&self, ctx: &FilterContext, resources: Vec<Resource>) -> Result<Vec<Resource>> {
        let mut current = resources;
        for filter in &self.filters {
            if current.is_empty() {
                break;
            }
            current = filter.process(ctx, current).await?;
        }
        Ok(current)
    }
}

/// Copy annotations from `matched` onto the originals with the same id
fn merge_matches(originals: Vec<Resource>, matched: HashMap<String, Resource>) -> Vec<Resource> {
    originals
        .into_iter()
        .filter_map(|mut original| {
            let annotated = matched.get(&original.id())?;
            for (key, value) in annotated.data() {
                if original.get(key) != Some(value) {
                    original.annotate(key, value.clone());
                }
            }
            Some(original)
        })
        .collect()
}

#[async_trait]
impl Filter for BooleanFilter {
    fn kind(&self) -> &str {
        self.op.as_str()
    }

    async fn process(&self, ctx: &FilterContext, resources: Vec<Resource>) -> Result<Vec<Resource>> {
        match self.op {
            BoolOp::And => self.all_of(ctx, resources).await,
            BoolOp::Or => {
                let mut matched: HashMap<String, Resource> = HashMap::new();
                for filter in &self.filters {
                    let remaining: Vec<Resource> = resources
                        .iter()
                        .filter(|r| !matched.contains_key(&r.id()))
                        .cloned()
                        .collect();
                    if remaining.is_empty() {
                        break;
                    }
                    for r in filter.process(ctx, remaining).await? {
                        matched.insert(r.id(), r);
                    }
                }
                Ok(merge_matches(resources, matched))
            }
            BoolOp::Not => {
                let excluded: HashSet<String> = self
                    .all_of(ctx, resources.clone())
                    .await?
                    .iter()
                    .map(|r| r.id())
                    .collect();
                Ok(resources
                    .into_iter()
                    .filter(|r| !excluded.contains(&r.id()))
                    .collect())
            }
        }
    }
}
