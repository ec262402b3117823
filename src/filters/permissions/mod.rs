//! Ingress/egress permission filter
//!
//! Registered as `ingress` and `egress`. A resource matches when at least one
//! of its rules in that direction satisfies the configured criteria, combined
//! with `match-operator`. Matching raw rules are annotated on the resource.
//!
//! ```yaml
//! filters:
//!   - type: ingress
//!     Ports: [22, 3389]
//!     Cidr:
//!       value: 0.0.0.0/0
//! ```

pub mod adapter;

use self::adapter::{adapter_for, normalize_protocol, Direction, PermissionAdapter, PermissionRule, PortSpec};
use super::value::ValueFilter;
use super::{Filter, FilterContext, ValueMatcher};
use crate::error::{check_keys, EngineError, Result};
use crate::resource::{describe_resource, Resource, ResourceDef};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use std::fmt;

const PERMISSION_KEYS: &[&str] = &[
    "Ports",
    "OnlyPorts",
    "Cidr",
    "CidrV6",
    "IpProtocol",
    "SelfReference",
    "SGReferences",
    "Description",
    "Priority",
    "Action",
    "match-operator",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchOperator {
    And,
    Or,
}

impl MatchOperator {
    fn combine(&self, results: &[bool]) -> bool {
        // An empty criteria set is never a match, for either operator
        if results.is_empty() {
            return false;
        }
        match self {
            MatchOperator::And => results.iter().all(|r| *r),
            MatchOperator::Or => results.iter().any(|r| *r),
        }
    }
}

pub struct PermissionFilter {
    kind: String,
    direction: Direction,
    adapter: Box<dyn PermissionAdapter>,
    ports: Option<Vec<i64>>,
    only_ports: Option<Vec<i64>>,
    cidr: Option<ValueMatcher>,
    cidr_v6: Option<ValueMatcher>,
    protocol: Option<Option<String>>,
    self_reference: Option<bool>,
    sg_references: Option<ValueFilter>,
    description: Option<ValueMatcher>,
    priority: Option<ValueMatcher>,
    accept: bool,
    match_operator: MatchOperator,
}

impl fmt::Debug for PermissionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionFilter")
            .field("kind", &self.kind)
            .field("ports", &self.ports)
            .field("only_ports", &self.only_ports)
            .field("self_reference", &self.self_reference)
            .field("match_operator", &self.match_operator)
            .finish_non_exhaustive()
    }
}

fn port_list(kind: &str, key: &str, value: &Value) -> Result<Vec<i64>> {
    let items = match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    items
        .iter()
        .map(|v| {
            v.as_i64().ok_or_else(|| {
                EngineError::invalid_filter(kind, format!("{} must be a list of integers, got {}", key, v))
            })
        })
        .collect()
}

impl PermissionFilter {
    pub fn from_spec(kind: &str, resource_def: &ResourceDef, spec: &Map<String, Value>) -> Result<Self> {
        check_keys("filter", kind, spec, PERMISSION_KEYS)?;

        let direction = Direction::parse(kind)
            .ok_or_else(|| EngineError::invalid_filter(kind, "not a permission filter type"))?;
        let layout = resource_def.permissions.as_ref().ok_or_else(|| {
            EngineError::invalid_filter(
                kind,
                format!("resource type '{}' has no permission rules", resource_def.display_name),
            )
        })?;

        let matcher = |key: &str| -> Result<Option<ValueMatcher>> {
            spec.get(key)
                .map(|v| ValueMatcher::from_spec(key, v))
                .transpose()
        };

        let match_operator = match spec.get("match-operator").map(|v| v.as_str()) {
            None | Some(Some("and")) => MatchOperator::And,
            Some(Some("or")) => MatchOperator::Or,
            Some(other) => {
                return Err(EngineError::invalid_filter(
                    kind,
                    format!("match-operator must be 'and' or 'or', got {:?}", other),
                ))
            }
        };

        let accept = match spec.get("Action").map(|v| v.as_str()) {
            None => true,
            Some(Some(a)) if a.eq_ignore_ascii_case("accept") || a.eq_ignore_ascii_case("allow") => true,
            Some(Some(a)) if a.eq_ignore_ascii_case("drop") || a.eq_ignore_ascii_case("deny") => false,
            Some(other) => {
                return Err(EngineError::invalid_filter(
                    kind,
                    format!("Action must be 'accept' or 'drop', got {:?}", other),
                ))
            }
        };

        let self_reference = match spec.get("SelfReference") {
            None => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(other) => {
                return Err(EngineError::invalid_filter(
                    kind,
                    format!("SelfReference must be a boolean, got {}", other),
                ))
            }
        };

        let sg_references = match spec.get("SGReferences") {
            None => None,
            Some(Value::Object(map)) => {
                let mut nested = map.clone();
                nested.remove("type");
                Some(ValueFilter::from_spec(&nested)?)
            }
            Some(other) => {
                return Err(EngineError::invalid_filter(
                    kind,
                    format!("SGReferences must be a value filter mapping, got {}", other),
                ))
            }
        };

        Ok(Self {
            kind: kind.to_string(),
            direction,
            adapter: adapter_for(layout),
            ports: spec.get("Ports").map(|v| port_list(kind, "Ports", v)).transpose()?,
            only_ports: spec
                .get("OnlyPorts")
                .map(|v| port_list(kind, "OnlyPorts", v))
                .transpose()?,
            cidr: matcher("Cidr")?,
            cidr_v6: matcher("CidrV6")?,
            protocol: spec.get("IpProtocol").map(|v| normalize_protocol(Some(v))),
            self_reference,
            sg_references,
            description: matcher("Description")?,
            priority: matcher("Priority")?,
            accept,
            match_operator,
        })
    }

    /// `Ports` positive assertion and `OnlyPorts` inverse assertion
    fn process_ports(&self, rule: &PermissionRule) -> Option<bool> {
        if self.ports.is_none() && self.only_ports.is_none() {
            return None;
        }
        if rule.ports == PortSpec::Unset {
            return None;
        }

        let mut found = self
            .ports
            .as_ref()
            .map(|ports| ports.iter().any(|p| rule.ports.covers(*p)));

        if let Some(only) = &self.only_ports {
            found = if rule.ports.restricted_to(only) {
                Some(false)
            } else {
                Some(found.unwrap_or(true))
            };
        }
        found
    }

    fn process_cidrs(&self, rule: &PermissionRule) -> Option<bool> {
        let side = |matcher: &Option<ValueMatcher>, ranges: &[String]| -> Option<bool> {
            let matcher = matcher.as_ref()?;
            if ranges.is_empty() {
                return None;
            }
            Some(
                ranges
                    .iter()
                    .any(|r| matcher.matches(Some(&Value::String(r.clone())))),
            )
        };

        let present: Vec<bool> = [
            side(&self.cidr, &rule.cidrs_v4),
            side(&self.cidr_v6, &rule.cidrs_v6),
        ]
        .into_iter()
        .flatten()
        .collect();

        if present.is_empty() {
            None
        } else {
            Some(self.match_operator.combine(&present))
        }
    }

    fn process_protocol(&self, rule: &PermissionRule) -> Option<bool> {
        let wanted = self.protocol.as_ref()?;
        Some(match (wanted, &rule.protocol) {
            (None, _) | (_, None) => true,
            (Some(w), Some(p)) => w == p,
        })
    }

    fn process_self_reference(&self, rule: &PermissionRule, self_ids: &[String]) -> Option<bool> {
        let expected = self.self_reference?;
        if rule.group_refs.is_empty() {
            return Some(false);
        }
        let is_self = rule.group_refs.iter().any(|g| self_ids.contains(&g.id));
        Some(is_self == expected)
    }

    fn process_description(&self, rule: &PermissionRule) -> Option<bool> {
        let matcher = self.description.as_ref()?;
        Some(match &rule.description {
            Some(d) => matcher.matches(Some(&Value::String(d.clone()))),
            None => false,
        })
    }

    fn process_priority(&self, rule: &PermissionRule) -> Option<bool> {
        let matcher = self.priority.as_ref()?;
        Some(matcher.matches(rule.priority.as_ref()))
    }

    async fn process_sg_references(
        &self,
        ctx: &FilterContext,
        rule: &PermissionRule,
        owner: Option<&str>,
    ) -> Result<Option<bool>> {
        let Some(filter) = &self.sg_references else {
            return Ok(None);
        };

        // Only references owned by the resource's owner can be resolved
        let ids: Vec<String> = rule
            .group_refs
            .iter()
            .filter(|g| match (owner, g.owner.as_deref()) {
                (Some(mine), Some(theirs)) => mine == theirs,
                _ => true,
            })
            .map(|g| g.id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(Some(false));
        }

        let groups = ctx
            .manager
            .get_resources(&ctx.run, &ctx.resource_key, &ids)
            .await?;
        Ok(Some(groups.iter().any(|g| filter.matches(g))))
    }

    async fn rule_matches(
        &self,
        ctx: &FilterContext,
        rule: &PermissionRule,
        self_ids: &[String],
        owner: Option<&str>,
    ) -> Result<bool> {
        if rule.accept != self.accept {
            return Ok(false);
        }

        let present: Vec<bool> = [
            self.process_ports(rule),
            self.process_cidrs(rule),
            self.process_protocol(rule),
            self.process_self_reference(rule, self_ids),
            self.process_sg_references(ctx, rule, owner).await?,
            self.process_description(rule),
            self.process_priority(rule),
        ]
        .into_iter()
        .flatten()
        .collect();

        Ok(self.match_operator.combine(&present))
    }

    /// Evaluate one resource, annotating the matching rules
    async fn evaluate(&self, ctx: &FilterContext, resource: &mut Resource) -> Result<bool> {
        let rules = self
            .adapter
            .rules(resource, self.direction)
            .unwrap_or_default();
        if rules.is_empty() {
            return Ok(false);
        }

        let self_ids = self.adapter.self_ids(resource);
        let owner = self.adapter.owner_id(resource);

        let mut matched = Vec::new();
        for rule in &rules {
            if self.rule_matches(ctx, rule, &self_ids, owner.as_deref()).await? {
                matched.push(rule.raw.clone());
            }
        }

        if matched.is_empty() {
            return Ok(false);
        }
        resource.annotate(&self.adapter.annotation_key(self.direction), Value::Array(matched));
        Ok(true)
    }

    /// Fetch rule detail for resources that arrive without their rule list
    async fn hydrate(&self, ctx: &FilterContext, resources: Vec<Resource>) -> Result<Vec<Resource>> {
        let def = &ctx.resource_def;
        if def.detail_sdk_method.is_none() {
            return Ok(resources);
        }
        let missing = resources
            .iter()
            .filter(|r| self.adapter.rules(r, self.direction).is_none())
            .count();
        if missing == 0 {
            return Ok(resources);
        }

        tracing::debug!("Hydrating permission rules for {} {}", missing, ctx.resource_key);
        let workers = ctx.run.config().hydration_workers.max(1);
        stream::iter(resources)
            .map(|mut resource| async move {
                if self.adapter.rules(&resource, self.direction).is_some() {
                    return Ok(resource);
                }
                if let Some(Value::Object(detail)) = describe_resource(&ctx.run, def, &resource.id()).await? {
                    for (key, value) in detail {
                        if !resource.contains_key(&key) {
                            resource.annotate(&key, value);
                        }
                    }
                }
                Ok::<_, EngineError>(resource)
            })
            .buffered(workers)
            .try_collect()
            .await
    }
}

#[async_trait]
impl Filter for PermissionFilter {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn process(&self, ctx: &FilterContext, resources: Vec<Resource>) -> Result<Vec<Resource>> {
        let resources = self.hydrate(ctx, resources).await?;
        let mut matched = Vec::with_capacity(resources.len());
        for mut resource in resources {
            if self.evaluate(ctx, &mut resource).await? {
                matched.push(resource);
            }
        }
        Ok(matched)
    }
}
