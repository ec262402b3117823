//! GCP Client
//!
//! Combines credentials, the HTTP transport and URL building for the
//! services resfilter talks to.

use super::auth::GcpCredentials;
use super::http::GcpHttpClient;
use anyhow::{Context, Result};
use serde_json::Value;

/// API base URLs. Overridable so tests can point at a local server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub compute: String,
    pub storage: String,
    pub monitoring: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            compute: "https://compute.googleapis.com/compute/v1".to_string(),
            storage: "https://storage.googleapis.com/storage/v1".to_string(),
            monitoring: "https://monitoring.googleapis.com/v3".to_string(),
        }
    }
}

impl Endpoints {
    /// Every service under one base URL
    pub fn local(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            compute: format!("{}/compute/v1", base),
            storage: format!("{}/storage/v1", base),
            monitoring: format!("{}/v3", base),
        }
    }
}

/// Main GCP client
#[derive(Clone)]
pub struct GcpClient {
    pub credentials: GcpCredentials,
    pub http: GcpHttpClient,
    pub endpoints: Endpoints,
    pub project_id: String,
    pub zone: String,
}

impl GcpClient {
    /// Create a client using Application Default Credentials
    pub async fn new(project_id: &str, zone: &str) -> Result<Self> {
        let credentials = GcpCredentials::new()
            .await
            .context("Failed to initialize GCP credentials")?;

        Self::with_credentials(credentials, Endpoints::default(), project_id, zone)
    }

    pub fn with_credentials(
        credentials: GcpCredentials,
        endpoints: Endpoints,
        project_id: &str,
        zone: &str,
    ) -> Result<Self> {
        Ok(Self {
            credentials,
            http: GcpHttpClient::new()?,
            endpoints,
            project_id: project_id.to_string(),
            zone: zone.to_string(),
        })
    }

    pub async fn get(&self, url: &str) -> Result<Value> {
        let token = self.credentials.get_token().await?;
        self.http.get(url, &token).await
    }

    pub async fn post(&self, url: &str, body: Option<&Value>) -> Result<Value> {
        let token = self.credentials.get_token().await?;
        self.http.post(url, &token, body).await
    }

    pub async fn patch(&self, url: &str, body: &Value) -> Result<Value> {
        let token = self.credentials.get_token().await?;
        self.http.patch(url, &token, body).await
    }

    pub async fn delete(&self, url: &str) -> Result<Value> {
        let token = self.credentials.get_token().await?;
        self.http.delete(url, &token).await
    }

    /// Region of a zone ("us-central1-a" -> "us-central1")
    pub fn region_of(zone: &str) -> String {
        match zone.rsplit_once('-') {
            Some((region, _)) => region.to_string(),
            None => zone.to_string(),
        }
    }

    pub fn get_region(&self) -> String {
        Self::region_of(&self.zone)
    }

    // =========================================================================
    // Compute Engine
    // =========================================================================

    pub fn compute_url(&self, path: &str) -> String {
        format!(
            "{}/projects/{}/{}",
            self.endpoints.compute, self.project_id, path
        )
    }

    /// Zonal URL; `zone` overrides the client's zone
    pub fn compute_zonal_url(&self, zone: Option<&str>, resource: &str) -> String {
        let zone = zone.unwrap_or(&self.zone);
        self.compute_url(&format!("zones/{}/{}", zone, resource))
    }

    /// Regional URL; `region` overrides the region of the client's zone
    pub fn compute_regional_url(&self, region: Option<&str>, resource: &str) -> String {
        let region = region
            .map(|r| r.to_string())
            .unwrap_or_else(|| self.get_region());
        self.compute_url(&format!("regions/{}/{}", region, resource))
    }

    pub fn compute_global_url(&self, resource: &str) -> String {
        self.compute_url(&format!("global/{}", resource))
    }

    /// Aggregated URL (all zones or regions)
    pub fn compute_aggregated_url(&self, resource: &str) -> String {
        self.compute_url(&format!("aggregated/{}", resource))
    }

    // =========================================================================
    // Cloud Storage
    // =========================================================================

    pub fn storage_url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoints.storage, path)
    }

    pub fn storage_bucket_url(&self, bucket: &str) -> String {
        self.storage_url(&format!("b/{}", urlencoding::encode(bucket)))
    }

    // =========================================================================
    // Cloud Monitoring
    // =========================================================================

    pub fn monitoring_url(&self, path: &str) -> String {
        format!(
            "{}/projects/{}/{}",
            self.endpoints.monitoring, self.project_id, path
        )
    }
}
