//! Integration tests for the GCP provider using wiremock
//!
//! These tests drive `GcpProvider` against mocked REST endpoints, covering
//! URL building, error code mapping, pagination and metric normalization.

use resfilter::config::EngineConfig;
use resfilter::context::RunContext;
use resfilter::error::EngineError;
use resfilter::provider::gcp::auth::GcpCredentials;
use resfilter::provider::gcp::client::GcpClient;
use resfilter::provider::gcp::Endpoints;
use resfilter::provider::{GcpProvider, ProviderClient, RequestSpec};
use resfilter::resource::{Registry, ResourceQueryManager};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{bearer_token, body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PROJECT: &str = "test-project";

fn provider(server: &MockServer, zone: &str) -> GcpProvider {
    let client = GcpClient::with_credentials(
        GcpCredentials::from_static("test-token"),
        Endpoints::local(&server.uri()),
        PROJECT,
        zone,
    )
    .expect("client should build");
    GcpProvider::from_client(client)
}

mod compute_tests {
    use super::*;

    #[tokio::test]
    async fn test_list_instances_zonal() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/compute/v1/projects/test-project/zones/us-central1-a/instances"))
            .and(bearer_token("test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"name": "instance-1", "status": "RUNNING"},
                    {"name": "instance-2", "status": "TERMINATED"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = provider(&server, "us-central1-a")
            .fetch("compute", &RequestSpec::new("list_instances"))
            .await
            .expect("list should succeed");

        assert_eq!(response["items"].as_array().unwrap().len(), 2);
        assert_eq!(response["items"][0]["name"], "instance-1");
    }

    #[tokio::test]
    async fn test_list_instances_all_zones_flattens() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/compute/v1/projects/test-project/aggregated/instances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": {
                    "zones/us-central1-a": {"instances": [{"name": "a"}]},
                    "zones/us-east1-b": {"warning": {"code": "NO_RESULTS_ON_PAGE"}},
                    "zones/europe-west1-b": {"instances": [{"name": "b"}, {"name": "c"}]}
                }
            })))
            .mount(&server)
            .await;

        let response = provider(&server, "all")
            .fetch("compute", &RequestSpec::new("list_instances"))
            .await
            .unwrap();
        assert_eq!(response["items"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stop_instance_uses_resource_zone() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/compute/v1/projects/test-project/zones/europe-west1-b/instances/web-1/stop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "operation-123",
                "status": "RUNNING"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = RequestSpec::with_params(
            "stop_instance",
            json!({
                "name": "web-1",
                "zone": "https://www.googleapis.com/compute/v1/projects/test-project/zones/europe-west1-b"
            }),
        );
        let response = provider(&server, "us-central1-a")
            .invoke("compute", &request)
            .await
            .unwrap();
        assert_eq!(response["name"], "operation-123");
    }

    #[tokio::test]
    async fn test_patch_firewall_sends_body() {
        let server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/compute/v1/projects/test-project/global/firewalls/allow-ssh"))
            .and(body_json(json!({"disabled": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "operation-9"})))
            .expect(1)
            .mount(&server)
            .await;

        let request = RequestSpec::with_params("patch_firewall", json!({"name": "allow-ssh", "disabled": true}));
        let response = provider(&server, "us-central1-a")
            .invoke("compute", &request)
            .await
            .unwrap();
        assert_eq!(response["name"], "operation-9");
    }

    #[tokio::test]
    async fn test_error_status_becomes_error_code() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/compute/v1/projects/test-project/zones/us-central1-a/instances/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": 404, "message": "The resource was not found"}
            })))
            .mount(&server)
            .await;

        let request = RequestSpec::with_params("delete_instance", json!({"name": "gone"}));
        let err = provider(&server, "us-central1-a")
            .invoke("compute", &request)
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("404"));
    }

    #[tokio::test]
    async fn test_empty_delete_body_is_null() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/storage/v1/b/old-logs"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let request = RequestSpec::with_params("delete_bucket", json!({"name": "old-logs"}));
        let response = provider(&server, "us-central1-a")
            .invoke("storage", &request)
            .await
            .unwrap();
        assert!(response.is_null());
    }

    #[tokio::test]
    async fn test_unknown_service_and_method() {
        let server = MockServer::start().await;
        let gcp = provider(&server, "us-central1-a");

        assert!(!gcp.supports_service("ecs"));
        assert!(gcp.supports_service("monitoring"));

        let err = gcp.fetch("ecs", &RequestSpec::new("DescribeInstances")).await.unwrap_err();
        assert!(err.message.contains("Unknown service"));
        assert!(err.code.is_none());

        let err = gcp.fetch("compute", &RequestSpec::new("list_tpus")).await.unwrap_err();
        assert!(err.message.contains("list_tpus"));
    }
}

mod monitoring_tests {
    use super::*;

    #[tokio::test]
    async fn test_metric_statistics_are_normalized() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v3/projects/test-project/timeSeries"))
            .and(query_param("aggregation.perSeriesAligner", "ALIGN_MAX"))
            .and(query_param("aggregation.alignmentPeriod", "604800s"))
            .and(query_param(
                "filter",
                "metric.type = \"compute.googleapis.com/instance/cpu/utilization\" AND resource.labels.instance_id = \"42\"",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "timeSeries": [{
                    "points": [{
                        "interval": {"startTime": "2024-01-01T00:00:00Z", "endTime": "2024-01-08T00:00:00Z"},
                        "value": {"doubleValue": 0.93}
                    }]
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = RequestSpec::with_params(
            "get_metric_statistics",
            json!({
                "namespace": "compute.googleapis.com/instance",
                "metric": "cpu/utilization",
                "statistic": "Maximum",
                "period": 604800,
                "start": "2024-01-01T00:00:00+00:00",
                "end": "2024-01-08T00:00:00+00:00",
                "dimensions": [{"name": "resource.labels.instance_id", "value": "42"}]
            }),
        );
        let response = provider(&server, "us-central1-a")
            .fetch("monitoring", &request)
            .await
            .unwrap();

        let points = response["Datapoints"].as_array().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0]["Maximum"], 0.93);
        assert_eq!(points[0]["Timestamp"], "2024-01-08T00:00:00Z");
    }

    #[tokio::test]
    async fn test_unsupported_statistic_fails() {
        let server = MockServer::start().await;
        let request = RequestSpec::with_params(
            "get_metric_statistics",
            json!({
                "namespace": "n", "metric": "m", "statistic": "p99",
                "start": "2024-01-01T00:00:00Z", "end": "2024-01-02T00:00:00Z"
            }),
        );
        let err = provider(&server, "us-central1-a")
            .fetch("monitoring", &request)
            .await
            .unwrap_err();
        assert!(err.message.contains("p99"));
    }
}

mod engine_tests {
    use super::*;

    fn run_context(gcp: GcpProvider, config: EngineConfig) -> RunContext {
        RunContext::new(Arc::new(gcp), config)
    }

    #[tokio::test]
    async fn test_fetch_follows_page_tokens() {
        let server = MockServer::start().await;
        let list_path = "/compute/v1/projects/test-project/global/firewalls";

        Mock::given(method("GET"))
            .and(path(list_path))
            .and(query_param("pageToken", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"name": "fw-3"}]
            })))
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(list_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"name": "fw-1"}, {"name": "fw-2"}],
                "nextPageToken": "page-2"
            })))
            .mount(&server)
            .await;

        let ctx = run_context(provider(&server, "us-central1-a"), EngineConfig::default());
        let manager = ResourceQueryManager::new(Arc::new(Registry::builtin().unwrap()));
        let firewalls = manager.fetch(&ctx, "compute-firewalls").await.unwrap();

        let names: Vec<String> = firewalls.iter().map(|f| f.id()).collect();
        assert_eq!(names, vec!["fw-1", "fw-2", "fw-3"]);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/compute/v1/projects/test-project/zones/us-central1-a/disks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"items": []}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let config = EngineConfig {
            call_timeout_secs: Some(1),
            ..EngineConfig::default()
        };
        let ctx = run_context(provider(&server, "us-central1-a"), config);
        let manager = ResourceQueryManager::new(Arc::new(Registry::builtin().unwrap()));

        let err = manager.fetch(&ctx, "compute-disks").await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(1)));
    }

    #[tokio::test]
    async fn test_fetch_error_carries_provider_message() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/storage/v1/b"))
            .and(query_param("project", "test-project"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let ctx = run_context(provider(&server, "us-central1-a"), EngineConfig::default());
        let manager = ResourceQueryManager::new(Arc::new(Registry::builtin().unwrap()));

        let err = manager.fetch(&ctx, "storage-buckets").await.unwrap_err();
        match err {
            EngineError::Fetch { resource, source } => {
                assert_eq!(resource, "storage-buckets");
                assert_eq!(source.code.as_deref(), Some("403"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
