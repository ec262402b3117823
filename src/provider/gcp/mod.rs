//! Google Cloud provider
//!
//! # Module Structure
//!
//! - [`auth`] - Application Default Credentials and gcloud defaults
//! - [`client`] - Client combining credentials, transport and URL building
//! - [`dispatch`] - Method name to REST call mapping
//! - [`http`] - HTTP transport for REST API calls
//!
//! # Example
//!
//! ```ignore
//! use resfilter::provider::GcpProvider;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let provider = GcpProvider::new("my-project", "us-central1-a").await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod dispatch;
pub mod http;

use super::{ProviderClient, RequestSpec};
use crate::error::ProviderError;
use anyhow::Result;
use async_trait::async_trait;
use client::GcpClient;
use serde_json::Value;

pub use client::Endpoints;

/// Services the dispatcher knows about
const SERVICES: &[&str] = &["compute", "storage", "monitoring"];

/// [`ProviderClient`] over the GCP REST APIs
#[derive(Clone)]
pub struct GcpProvider {
    client: GcpClient,
}

impl GcpProvider {
    /// Connect with Application Default Credentials
    pub async fn new(project_id: &str, zone: &str) -> Result<Self> {
        Ok(Self {
            client: GcpClient::new(project_id, zone).await?,
        })
    }

    pub fn from_client(client: GcpClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &GcpClient {
        &self.client
    }
}

#[async_trait]
impl ProviderClient for GcpProvider {
    fn name(&self) -> &str {
        "gcp"
    }

    fn supports_service(&self, service: &str) -> bool {
        SERVICES.contains(&service)
    }

    async fn fetch(&self, service: &str, request: &RequestSpec) -> Result<Value, ProviderError> {
        dispatch::invoke_sdk(service, &request.method, &self.client, &request.params)
            .await
            .map_err(ProviderError::from)
    }

    async fn invoke(&self, service: &str, request: &RequestSpec) -> Result<Value, ProviderError> {
        dispatch::execute_action(service, &request.method, &self.client, &request.params)
            .await
            .map_err(ProviderError::from)
    }
}
