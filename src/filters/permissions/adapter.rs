//! Permission adapters
//!
//! Read provider rule shapes into canonical [`PermissionRule`]s. The matching
//! algorithm only ever sees the canonical form.

use crate::filters::comparator::as_number;
use crate::resource::{FieldLayout, PermissionLayout, Resource};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "ingress" => Some(Direction::Ingress),
            "egress" => Some(Direction::Egress),
            _ => None,
        }
    }
}

/// Ports a rule applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    All,
    /// Inclusive ranges
    Ranges(Vec<(i64, i64)>),
    /// Empty port expression; the rule says nothing about ports
    Unset,
}

impl PortSpec {
    pub fn covers(&self, port: i64) -> bool {
        match self {
            PortSpec::All => true,
            PortSpec::Ranges(ranges) => ranges.iter().any(|(lo, hi)| *lo <= port && port <= *hi),
            PortSpec::Unset => false,
        }
    }

    /// Every range is a single port listed in `allowed`
    pub fn restricted_to(&self, allowed: &[i64]) -> bool {
        match self {
            PortSpec::All | PortSpec::Unset => false,
            PortSpec::Ranges(ranges) => {
                !ranges.is_empty()
                    && ranges
                        .iter()
                        .all(|(lo, hi)| lo == hi && allowed.contains(lo))
            }
        }
    }

    /// Parse `"22"`, `"22/22"`, `"80-443"`, `"22,80"`, `"ALL"`, `-1`, lists
    pub fn parse(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return PortSpec::All;
        };
        match value {
            Value::Null => PortSpec::All,
            Value::Number(n) => match n.as_i64() {
                Some(-1) | None => PortSpec::All,
                Some(p) => PortSpec::Ranges(vec![(p, p)]),
            },
            Value::String(s) => parse_port_str(s),
            Value::Array(items) if items.is_empty() => PortSpec::All,
            Value::Array(items) => {
                let mut ranges = Vec::new();
                for item in items {
                    match PortSpec::parse(Some(item)) {
                        PortSpec::All => return PortSpec::All,
                        PortSpec::Ranges(r) => ranges.extend(r),
                        PortSpec::Unset => {},
                    }
                }
                PortSpec::Ranges(ranges)
            }
            _ => PortSpec::Ranges(Vec::new()),
        }
    }

    /// From/to numeric pair; `-1/-1` or a missing lower bound is unbounded
    pub fn from_bounds(from: Option<&Value>, to: Option<&Value>) -> Self {
        let from = from.and_then(as_number).map(|f| f as i64);
        let to = to.and_then(as_number).map(|f| f as i64);
        match (from, to) {
            (None, _) | (Some(-1), Some(-1)) | (Some(-1), None) => PortSpec::All,
            (Some(lo), Some(hi)) => PortSpec::Ranges(vec![(lo.min(hi), lo.max(hi))]),
            (Some(lo), None) => PortSpec::Ranges(vec![(lo, lo)]),
        }
    }
}

fn parse_port_str(s: &str) -> PortSpec {
    let s = s.trim();
    if s.is_empty() {
        return PortSpec::Unset;
    }
    if s.eq_ignore_ascii_case("all") || s == "-1" || s == "-1/-1" {
        return PortSpec::All;
    }

    let mut ranges = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let bounds = part.split_once('/').or_else(|| part.split_once('-'));
        let parsed = match bounds {
            Some((lo, hi)) => lo.trim().parse::<i64>().ok().zip(hi.trim().parse::<i64>().ok()),
            None => part.parse::<i64>().ok().map(|p| (p, p)),
        };
        match parsed {
            Some((-1, -1)) => return PortSpec::All,
            Some((lo, hi)) => ranges.push((lo.min(hi), lo.max(hi))),
            None => tracing::debug!("Unparsable port expression '{}'", part),
        }
    }
    PortSpec::Ranges(ranges)
}

/// Reference to another group, optionally qualified by owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    pub id: String,
    pub owner: Option<String>,
}

/// One ingress or egress rule
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRule {
    /// `None` is the protocol wildcard
    pub protocol: Option<String>,
    pub accept: bool,
    pub ports: PortSpec,
    pub cidrs_v4: Vec<String>,
    pub cidrs_v6: Vec<String>,
    pub group_refs: Vec<GroupRef>,
    pub description: Option<String>,
    pub priority: Option<Value>,
    pub raw: Value,
}

/// Normalize a protocol value; wildcard spellings become `None`
pub fn normalize_protocol(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_lowercase(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    match text.as_str() {
        "" | "-1" | "all" => None,
        _ => Some(text),
    }
}

/// Provider specific rule extraction
pub trait PermissionAdapter: Send + Sync {
    /// Rules for `direction`, or `None` when the rule list is not on the
    /// resource at all (it may need hydrating)
    fn rules(&self, resource: &Resource, direction: Direction) -> Option<Vec<PermissionRule>>;

    /// Group ids that count as "self" for self-reference checks
    fn self_ids(&self, resource: &Resource) -> Vec<String>;

    /// Owner used to decide which group references are resolvable
    fn owner_id(&self, resource: &Resource) -> Option<String>;

    /// Annotation key receiving the matched raw rules
    fn annotation_key(&self, direction: Direction) -> String;
}

/// Adapter for a descriptor's permission layout
pub fn adapter_for(layout: &PermissionLayout) -> Box<dyn PermissionAdapter> {
    match layout {
        PermissionLayout::Fields(fields) => Box::new(FieldAdapter {
            layout: fields.clone(),
        }),
        PermissionLayout::GcpFirewall => Box::new(GcpFirewallAdapter),
    }
}

/// Rules nested under a list attribute, field names from [`FieldLayout`]
pub struct FieldAdapter {
    layout: FieldLayout,
}

impl FieldAdapter {
    fn list_key(&self, direction: Direction) -> &str {
        match (direction, &self.layout.egress_permissions_key) {
            (Direction::Egress, Some(key)) => key,
            _ => &self.layout.ip_permissions_key,
        }
    }

    fn in_direction(&self, entry: &Value, direction: Direction) -> bool {
        if direction == Direction::Egress && self.layout.egress_permissions_key.is_some() {
            return true;
        }
        let Some(field) = &self.layout.direction_field else {
            return true;
        };
        let expected = match direction {
            Direction::Ingress => &self.layout.ingress_value,
            Direction::Egress => &self.layout.egress_value,
        };
        entry
            .get(field)
            .and_then(|v| v.as_str())
            .is_some_and(|d| d.eq_ignore_ascii_case(expected))
    }

    fn read_rule(&self, entry: &Value, direction: Direction) -> PermissionRule {
        let layout = &self.layout;
        let fields = match direction {
            Direction::Ingress => &layout.ingress,
            Direction::Egress => &layout.egress,
        };

        let accept = match &layout.action_field {
            Some(field) => match entry.get(field).and_then(|v| v.as_str()) {
                Some(action) => layout
                    .accept_values
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(action)),
                None => true,
            },
            None => true,
        };

        let ports = match &layout.port_to_field {
            Some(to_field) => PortSpec::from_bounds(entry.get(&layout.port_field), entry.get(to_field)),
            None => PortSpec::parse(entry.get(&layout.port_field)),
        };

        let owner = fields
            .group_owner
            .as_deref()
            .and_then(|f| entry.get(f))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let group_refs = fields
            .group_ref
            .as_deref()
            .map(|f| strings(entry.get(f)))
            .unwrap_or_default()
            .into_iter()
            .map(|id| GroupRef {
                id,
                owner: owner.clone(),
            })
            .collect();

        PermissionRule {
            protocol: normalize_protocol(entry.get(&layout.protocol_field)),
            accept,
            ports,
            cidrs_v4: fields
                .cidr_v4
                .as_deref()
                .map(|f| strings(entry.get(f)))
                .unwrap_or_default(),
            cidrs_v6: fields
                .cidr_v6
                .as_deref()
                .map(|f| strings(entry.get(f)))
                .unwrap_or_default(),
            group_refs,
            description: layout
                .description_field
                .as_deref()
                .and_then(|f| entry.get(f))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            priority: layout
                .priority_field
                .as_deref()
                .and_then(|f| entry.get(f))
                .cloned(),
            raw: entry.clone(),
        }
    }
}

impl PermissionAdapter for FieldAdapter {
    fn rules(&self, resource: &Resource, direction: Direction) -> Option<Vec<PermissionRule>> {
        let list = resource.lookup(self.list_key(direction))?;
        let entries = match list {
            Value::Array(items) => items.as_slice(),
            _ => &[],
        };
        Some(
            entries
                .iter()
                .filter(|entry| self.in_direction(entry, direction))
                .map(|entry| self.read_rule(entry, direction))
                .collect(),
        )
    }

    fn self_ids(&self, resource: &Resource) -> Vec<String> {
        vec![resource.id()]
    }

    fn owner_id(&self, resource: &Resource) -> Option<String> {
        let field = self.layout.owner_field.as_deref()?;
        resource.lookup(field).and_then(|v| v.as_str()).map(|s| s.to_string())
    }

    fn annotation_key(&self, direction: Direction) -> String {
        let key = self.list_key(direction);
        // "Permissions.Permission" annotates as "MatchedPermissions"
        let head = key.split('.').next().unwrap_or(key);
        format!("Matched{}", head)
    }
}

/// GCP VPC firewall: one rule per `allowed`/`denied` entry
pub struct GcpFirewallAdapter;

impl PermissionAdapter for GcpFirewallAdapter {
    fn rules(&self, resource: &Resource, direction: Direction) -> Option<Vec<PermissionRule>> {
        let allowed = resource.get("allowed");
        let denied = resource.get("denied");
        if allowed.is_none() && denied.is_none() {
            return None;
        }

        let resource_direction = resource
            .get("direction")
            .and_then(|d| d.as_str())
            .unwrap_or("INGRESS");
        let wanted = match direction {
            Direction::Ingress => "INGRESS",
            Direction::Egress => "EGRESS",
        };
        let disabled = resource
            .get("disabled")
            .and_then(|d| d.as_bool())
            .unwrap_or(false);
        if disabled || !resource_direction.eq_ignore_ascii_case(wanted) {
            return Some(Vec::new());
        }

        let ranges = match direction {
            Direction::Ingress => strings(resource.get("sourceRanges")),
            Direction::Egress => strings(resource.get("destinationRanges")),
        };
        let (cidrs_v6, cidrs_v4): (Vec<String>, Vec<String>) =
            ranges.into_iter().partition(|r| r.contains(':'));

        let group_refs: Vec<GroupRef> = match direction {
            Direction::Ingress => strings(resource.get("sourceTags"))
                .into_iter()
                .chain(strings(resource.get("sourceServiceAccounts")))
                .map(|id| GroupRef { id, owner: None })
                .collect(),
            Direction::Egress => Vec::new(),
        };

        let description = resource
            .get("description")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let priority = resource.get("priority").cloned();

        let entries = [(allowed, true, "allow"), (denied, false, "deny")];
        let rules = entries
            .into_iter()
            .flat_map(|(list, accept, action)| {
                list.and_then(|l| l.as_array())
                    .into_iter()
                    .flatten()
                    .map(move |entry| (entry, accept, action))
            })
            .map(|(entry, accept, action)| {
                let mut raw = entry.clone();
                if let Value::Object(map) = &mut raw {
                    map.insert("action".to_string(), json!(action));
                }
                PermissionRule {
                    protocol: normalize_protocol(entry.get("IPProtocol")),
                    accept,
                    ports: PortSpec::parse(entry.get("ports")),
                    cidrs_v4: cidrs_v4.clone(),
                    cidrs_v6: cidrs_v6.clone(),
                    group_refs: group_refs.clone(),
                    description: description.clone(),
                    priority: priority.clone(),
                    raw,
                }
            })
            .collect();
        Some(rules)
    }

    fn self_ids(&self, resource: &Resource) -> Vec<String> {
        strings(resource.get("targetTags"))
    }

    fn owner_id(&self, _resource: &Resource) -> Option<String> {
        None
    }

    fn annotation_key(&self, _direction: Direction) -> String {
        "MatchedFirewallRules".to_string()
    }
}

/// String or list of strings, empty entries dropped
fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect(),
        _ => Vec::new(),
    }
}
