//! Run context
//!
//! Carries the provider handle, engine settings and the cancellation token
//! through a policy run. Every external call goes through [`RunContext::fetch`]
//! or [`RunContext::invoke`] so a hung provider can be cut off.

use crate::config::EngineConfig;
use crate::error::{EngineError, ProviderError};
use crate::provider::{ProviderClient, RequestSpec};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Failure of a single guarded provider call
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    Provider(ProviderError),
    Cancelled,
    Timeout(u64),
}

impl CallError {
    /// Convert to an engine error, wrapping provider failures with `wrap`
    pub fn into_engine(self, wrap: impl FnOnce(ProviderError) -> EngineError) -> EngineError {
        match self {
            CallError::Provider(err) => wrap(err),
            CallError::Cancelled => EngineError::Cancelled,
            CallError::Timeout(secs) => EngineError::Timeout(secs),
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Provider(err) => write!(f, "{}", err),
            CallError::Cancelled => f.write_str("cancelled"),
            CallError::Timeout(secs) => write!(f, "timed out after {}s", secs),
        }
    }
}

/// Shared state for one policy run
#[derive(Clone)]
pub struct RunContext {
    provider: Arc<dyn ProviderClient>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(provider: Arc<dyn ProviderClient>, config: EngineConfig) -> Self {
        Self {
            provider,
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned token (e.g. tied to Ctrl-C)
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn ProviderClient> {
        &self.provider
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cooperative cancellation point, checked at chunk boundaries
    pub fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    /// Guarded read call
    pub async fn fetch(&self, service: &str, request: &RequestSpec) -> Result<Value, CallError> {
        tracing::trace!("fetch: service={}, method={}", service, request.method);
        self.guard(self.provider.fetch(service, request)).await
    }

    /// Guarded mutating call
    pub async fn invoke(&self, service: &str, request: &RequestSpec) -> Result<Value, CallError> {
        tracing::trace!("invoke: service={}, method={}", service, request.method);
        self.guard(self.provider.invoke(service, request)).await
    }

    async fn guard<F>(&self, call: F) -> Result<Value, CallError>
    where
        F: Future<Output = Result<Value, ProviderError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let timeout = self.config.call_timeout();
        let bounded = async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result.map_err(CallError::Provider),
                    Err(_) => Err(CallError::Timeout(limit.as_secs())),
                },
                None => call.await.map_err(CallError::Provider),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CallError::Cancelled),
            result = bounded => result,
        }
    }
}

/// Effective call timeout for a config, used in log lines
pub fn describe_timeout(timeout: Option<Duration>) -> String {
    match timeout {
        Some(t) => format!("{}s", t.as_secs()),
        None => "none".to_string(),
    }
}
