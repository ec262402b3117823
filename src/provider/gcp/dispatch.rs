//! SDK Dispatch
//!
//! Maps method names from resource definitions to GCP REST API calls.

use super::client::GcpClient;
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

/// Parameters consumed by URL building, never forwarded as query strings
const PATH_PARAMS: &[&str] = &["name", "zone", "region", "bucket"];

/// Invoke a read-only method
pub async fn invoke_sdk(service: &str, method: &str, client: &GcpClient, params: &Value) -> Result<Value> {
    tracing::debug!("invoke_sdk: service={}, method={}", service, method);

    match service {
        "compute" => invoke_compute(method, client, params).await,
        "storage" => invoke_storage(method, client, params).await,
        "monitoring" => invoke_monitoring(method, client, params).await,
        _ => Err(anyhow::anyhow!("Unknown service: {}", service)),
    }
}

/// Execute a mutating method; the target is named by the `name` parameter
pub async fn execute_action(service: &str, method: &str, client: &GcpClient, params: &Value) -> Result<Value> {
    let resource_id = get_param_str(params, "name")?;
    tracing::info!(
        "execute_action: service={}, method={}, resource={}",
        service,
        method,
        resource_id
    );

    match service {
        "compute" => execute_compute_action(method, client, &resource_id, params).await,
        "storage" => execute_storage_action(method, client, &resource_id).await,
        _ => Err(anyhow::anyhow!("Unknown service: {}", service)),
    }
}

// =============================================================================
// Compute Engine
// =============================================================================

async fn invoke_compute(method: &str, client: &GcpClient, params: &Value) -> Result<Value> {
    match method {
        "list_instances" => list_zonal(client, "instances", params).await,
        "list_disks" => list_zonal(client, "disks", params).await,
        "list_firewalls" => {
            let url = add_query_params(&client.compute_global_url("firewalls"), params);
            client.get(&url).await
        },
        "list_addresses" => {
            if client.zone == "all" {
                let url = add_query_params(&client.compute_aggregated_url("addresses"), params);
                Ok(flatten_aggregated_response(client.get(&url).await?))
            } else {
                let region = location_param(params, "region");
                let url = client.compute_regional_url(region.as_deref(), "addresses");
                client.get(&add_query_params(&url, params)).await
            }
        },
        "get_instance" => {
            let name = get_param_str(params, "name")?;
            let zone = location_param(params, "zone");
            let url = client.compute_zonal_url(zone.as_deref(), &format!("instances/{}", name));
            client.get(&url).await
        },
        _ => Err(anyhow::anyhow!("Unknown compute method: {}", method)),
    }
}

async fn list_zonal(client: &GcpClient, collection: &str, params: &Value) -> Result<Value> {
    if client.zone == "all" {
        let url = add_query_params(&client.compute_aggregated_url(collection), params);
        Ok(flatten_aggregated_response(client.get(&url).await?))
    } else {
        let url = add_query_params(&client.compute_zonal_url(None, collection), params);
        client.get(&url).await
    }
}

async fn execute_compute_action(
    method: &str,
    client: &GcpClient,
    resource_id: &str,
    params: &Value,
) -> Result<Value> {
    let zone = location_param(params, "zone");
    let zone = zone.as_deref();

    match method {
        "start_instance" | "stop_instance" | "reset_instance" => {
            let verb = method.trim_end_matches("_instance");
            let url = client.compute_zonal_url(zone, &format!("instances/{}/{}", resource_id, verb));
            client.post(&url, None).await
        },
        "delete_instance" => {
            let url = client.compute_zonal_url(zone, &format!("instances/{}", resource_id));
            client.delete(&url).await
        },
        "delete_disk" => {
            let url = client.compute_zonal_url(zone, &format!("disks/{}", resource_id));
            client.delete(&url).await
        },
        "delete_firewall" => {
            let url = client.compute_global_url(&format!("firewalls/{}", resource_id));
            client.delete(&url).await
        },
        "patch_firewall" => {
            let url = client.compute_global_url(&format!("firewalls/{}", resource_id));
            client.patch(&url, &body_params(params)).await
        },
        "delete_address" => {
            let region = location_param(params, "region");
            let url = client.compute_regional_url(region.as_deref(), &format!("addresses/{}", resource_id));
            client.delete(&url).await
        },
        _ => Err(anyhow::anyhow!("Unknown compute action: {}", method)),
    }
}

// =============================================================================
// Cloud Storage
// =============================================================================

async fn invoke_storage(method: &str, client: &GcpClient, params: &Value) -> Result<Value> {
    match method {
        "list_buckets" => {
            let url = format!("{}?project={}", client.storage_url("b"), client.project_id);
            let url = add_query_params(&url, params);
            client.get(&url).await
        },
        _ => Err(anyhow::anyhow!("Unknown storage method: {}", method)),
    }
}

async fn execute_storage_action(method: &str, client: &GcpClient, resource_id: &str) -> Result<Value> {
    match method {
        "delete_bucket" => {
            let url = client.storage_bucket_url(resource_id);
            client.delete(&url).await
        },
        _ => Err(anyhow::anyhow!("Unknown storage action: {}", method)),
    }
}

// =============================================================================
// Cloud Monitoring
// =============================================================================

async fn invoke_monitoring(method: &str, client: &GcpClient, params: &Value) -> Result<Value> {
    match method {
        "get_metric_statistics" => get_metric_statistics(client, params).await,
        _ => Err(anyhow::anyhow!("Unknown monitoring method: {}", method)),
    }
}

/// Query `timeSeries.list` aligned to one statistic and return
/// `{"Datapoints": [{"Timestamp": ..., "<Statistic>": value}]}`
async fn get_metric_statistics(client: &GcpClient, params: &Value) -> Result<Value> {
    let namespace = get_param_str(params, "namespace")?;
    let metric = get_param_str(params, "metric")?;
    let statistic = get_param_str(params, "statistic")?;
    let start = get_param_str(params, "start")?;
    let end = get_param_str(params, "end")?;
    let period = params.get("period").and_then(|v| v.as_u64()).unwrap_or(86_400);
    let aligner = aligner_for(&statistic)
        .with_context(|| format!("Unsupported statistic: {}", statistic))?;

    let dimensions = params
        .get("dimensions")
        .and_then(|v| v.as_array())
        .map(|d| d.as_slice())
        .unwrap_or_default();
    let filter = time_series_filter(&metric_type(&namespace, &metric), dimensions);

    let mut datapoints = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let mut url = url::Url::parse(&client.monitoring_url("timeSeries"))
            .context("Invalid monitoring URL")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("filter", &filter)
                .append_pair("interval.startTime", &start)
                .append_pair("interval.endTime", &end)
                .append_pair("aggregation.alignmentPeriod", &format!("{}s", period))
                .append_pair("aggregation.perSeriesAligner", aligner);
            if let Some(token) = &page_token {
                query.append_pair("pageToken", token);
            }
        }

        let response = client.get(url.as_str()).await?;
        datapoints.extend(normalize_time_series(&response, &statistic));

        page_token = response
            .get("nextPageToken")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        if page_token.is_none() {
            break;
        }
    }

    Ok(json!({ "Datapoints": datapoints }))
}

fn aligner_for(statistic: &str) -> Option<&'static str> {
    match statistic {
        "Average" => Some("ALIGN_MEAN"),
        "Sum" => Some("ALIGN_SUM"),
        "Maximum" => Some("ALIGN_MAX"),
        "Minimum" => Some("ALIGN_MIN"),
        "SampleCount" => Some("ALIGN_COUNT"),
        _ => None,
    }
}

/// Full metric type; names already carrying a domain are used as is
fn metric_type(namespace: &str, metric: &str) -> String {
    if metric.contains(".googleapis.com/") {
        metric.to_string()
    } else {
        format!("{}/{}", namespace.trim_end_matches('/'), metric)
    }
}

fn time_series_filter(metric_type: &str, dimensions: &[Value]) -> String {
    let mut clauses = vec![format!("metric.type = \"{}\"", metric_type)];
    for dim in dimensions {
        let (Some(name), Some(value)) = (
            dim.get("name").and_then(|v| v.as_str()),
            dim.get("value").and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        let name = if name.contains('.') {
            name.to_string()
        } else {
            format!("resource.labels.{}", name)
        };
        clauses.push(format!("{} = \"{}\"", name, value.replace('"', "\\\"")));
    }
    clauses.join(" AND ")
}

fn normalize_time_series(response: &Value, statistic: &str) -> Vec<Value> {
    let Some(series) = response.get("timeSeries").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    series
        .iter()
        .filter_map(|s| s.get("points").and_then(|p| p.as_array()))
        .flatten()
        .filter_map(|point| {
            let value = point_value(point.get("value")?)?;
            let timestamp = point
                .get("interval")
                .and_then(|i| i.get("endTime"))
                .cloned()
                .unwrap_or(Value::Null);
            let mut entry = Map::new();
            entry.insert("Timestamp".to_string(), timestamp);
            entry.insert(statistic.to_string(), json!(value));
            Some(Value::Object(entry))
        })
        .collect()
}

/// Numeric value of a TypedValue; int64 values arrive as strings
fn point_value(typed: &Value) -> Option<f64> {
    if let Some(v) = typed.get("doubleValue") {
        return v.as_f64();
    }
    if let Some(v) = typed.get("int64Value") {
        return match v {
            Value::String(s) => s.parse().ok(),
            other => other.as_f64(),
        };
    }
    typed
        .get("boolValue")
        .and_then(|v| v.as_bool())
        .map(|b| if b { 1.0 } else { 0.0 })
}

// =============================================================================
// Helpers
// =============================================================================

fn get_param_str(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .with_context(|| format!("Missing required parameter: {}", key))
}

/// Zone or region parameter; resource attributes hold full URLs so only the
/// last path segment is kept
fn location_param(params: &Value, key: &str) -> Option<String> {
    let raw = params.get(key)?.as_str()?;
    raw.rsplit('/').next().filter(|s| !s.is_empty()).map(|s| s.to_string())
}

/// Request body for patch calls: every non path parameter
fn body_params(params: &Value) -> Value {
    let Value::Object(map) = params else {
        return json!({});
    };
    let body: Map<String, Value> = map
        .iter()
        .filter(|(k, _)| !PATH_PARAMS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(body)
}

fn add_query_params(url: &str, params: &Value) -> String {
    let Value::Object(map) = params else {
        return url.to_string();
    };

    let mut query_parts: Vec<String> = Vec::new();
    for (key, value) in map {
        if PATH_PARAMS.contains(&key.as_str()) {
            continue;
        }

        match value {
            Value::String(s) => query_parts.push(format!("{}={}", key, urlencoding::encode(s))),
            Value::Number(n) => query_parts.push(format!("{}={}", key, n)),
            Value::Bool(b) => query_parts.push(format!("{}={}", key, b)),
            Value::Array(arr) => {
                for item in arr {
                    if let Value::String(s) = item {
                        query_parts.push(format!("{}={}", key, urlencoding::encode(s)));
                    }
                }
            },
            _ => {},
        }
    }

    if query_parts.is_empty() {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&{}", url, query_parts.join("&"))
    } else {
        format!("{}?{}", url, query_parts.join("&"))
    }
}

/// Flatten `{"items": {"zones/x": {"instances": [...]}}}` into
/// `{"items": [...]}`, keeping the page token
fn flatten_aggregated_response(response: Value) -> Value {
    let mut all_items: Vec<Value> = Vec::new();

    if let Some(items) = response.get("items").and_then(|v| v.as_object()) {
        for scope in items.values() {
            let Some(obj) = scope.as_object() else {
                continue;
            };
            for (key, value) in obj {
                if key == "warning" {
                    continue;
                }
                if let Some(arr) = value.as_array() {
                    all_items.extend(arr.iter().cloned());
                }
            }
        }
    }

    let mut flattened = json!({ "items": all_items });
    if let Some(token) = response.get("nextPageToken") {
        flattened["nextPageToken"] = token.clone();
    }
    flattened
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_aggregated_response() {
        let response = json!({
            "items": {
                "zones/us-central1-a": {"instances": [{"name": "a"}]},
                "zones/us-east1-b": {"warning": {"code": "NO_RESULTS_ON_PAGE"}},
                "zones/europe-west1-b": {"instances": [{"name": "b"}]}
            },
            "nextPageToken": "next"
        });
        let flat = flatten_aggregated_response(response);
        assert_eq!(flat["items"].as_array().unwrap().len(), 2);
        assert_eq!(flat["nextPageToken"], "next");
    }

    #[test]
    fn test_add_query_params_skips_path_params() {
        let url = add_query_params(
            "https://x/instances",
            &json!({"name": "vm", "zone": "z", "pageToken": "a b", "maxResults": 10}),
        );
        assert_eq!(url, "https://x/instances?pageToken=a%20b&maxResults=10");
    }

    #[test]
    fn test_location_param_takes_last_segment() {
        let params = json!({"zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-b"});
        assert_eq!(location_param(&params, "zone").as_deref(), Some("us-east1-b"));
        assert_eq!(location_param(&json!({"zone": "asia-east1-a"}), "zone").as_deref(), Some("asia-east1-a"));
        assert_eq!(location_param(&json!({}), "zone"), None);
    }

    #[test]
    fn test_time_series_filter() {
        let dims = vec![
            json!({"name": "resource.labels.instance_id", "value": "123"}),
            json!({"name": "zone", "value": "us-east1-b"}),
        ];
        let filter = time_series_filter(&metric_type("compute.googleapis.com/instance", "cpu/utilization"), &dims);
        assert_eq!(
            filter,
            "metric.type = \"compute.googleapis.com/instance/cpu/utilization\" AND \
             resource.labels.instance_id = \"123\" AND resource.labels.zone = \"us-east1-b\""
        );
        assert_eq!(
            metric_type("ignored", "compute.googleapis.com/instance/cpu/utilization"),
            "compute.googleapis.com/instance/cpu/utilization"
        );
    }

    #[test]
    fn test_normalize_time_series() {
        let response = json!({"timeSeries": [{
            "points": [
                {"interval": {"endTime": "2024-01-02T00:00:00Z"}, "value": {"doubleValue": 0.25}},
                {"interval": {"endTime": "2024-01-01T00:00:00Z"}, "value": {"int64Value": "7"}}
            ]
        }]});
        let points = normalize_time_series(&response, "Average");
        assert_eq!(points.len(), 2);
        assert_eq!(points[0]["Average"], 0.25);
        assert_eq!(points[1]["Average"], 7.0);
        assert_eq!(points[0]["Timestamp"], "2024-01-02T00:00:00Z");
    }

    #[test]
    fn test_body_params_drop_path_params() {
        let body = body_params(&json!({"name": "fw", "disabled": true}));
        assert_eq!(body, json!({"disabled": true}));
    }
}
