//! Method action
//!
//! Invokes one provider method per resource, chunk by chunk.

use super::{Action, ActionReport};
use crate::context::{CallError, RunContext};
use crate::error::{check_keys, EngineError, ProviderError, Result};
use crate::provider::RequestSpec;
use crate::resource::{chunks, ActionDef, Resource};
use async_trait::async_trait;
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub struct MethodAction {
    service: String,
    def: ActionDef,
}

impl MethodAction {
    pub fn from_spec(service: &str, def: &ActionDef, options: &Map<String, Value>) -> Result<Self> {
        check_keys("action", &def.key, options, &[])?;
        Ok(Self {
            service: service.to_string(),
            def: def.clone(),
        })
    }

    /// Indices of resources in a state the method accepts
    fn eligible(&self, resources: &[Resource]) -> Vec<usize> {
        let Some(filter) = &self.def.attr_filter else {
            return (0..resources.len()).collect();
        };
        let selected: Vec<usize> = resources
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.lookup(&filter.attr)
                    .map(|v| filter.values.contains(v))
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect();

        if selected.len() != resources.len() {
            tracing::warn!(
                action = %self.def.key,
                "implicitly filtered {} of {} resources with {}: {:?}",
                resources.len() - selected.len(),
                resources.len(),
                filter.attr,
                filter.values
            );
        }
        selected
    }

    fn request(&self, resource: &Resource) -> RequestSpec {
        let mut request = RequestSpec::with_params(&self.def.sdk_method, self.def.params.clone());
        for (param, attr) in &self.def.resource_params {
            if let Some(value) = resource.lookup(attr) {
                request.set_param(param, value.clone());
            }
        }
        request.set_param(&self.def.id_param, Value::String(resource.id()));
        request
    }

    fn is_ignored(&self, err: &ProviderError) -> bool {
        err.code
            .as_ref()
            .map(|code| self.def.ignore_error_codes.iter().any(|c| c == code))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Action for MethodAction {
    fn name(&self) -> &str {
        &self.def.key
    }

    async fn process(&self, run: &RunContext, resources: &mut [Resource]) -> Result<ActionReport> {
        let targets = self.eligible(resources);
        let mut report = ActionReport {
            action: self.def.key.clone(),
            attempted: targets.len(),
            implicitly_filtered: resources.len() - targets.len(),
            ..Default::default()
        };
        if targets.is_empty() {
            return Ok(report);
        }

        if !run.provider().supports_service(&self.service) {
            return Err(EngineError::Action {
                action: self.def.key.clone(),
                resource_id: "*".to_string(),
                source: ProviderError::new(format!(
                    "provider '{}' does not serve '{}'",
                    run.provider().name(),
                    self.service
                )),
            });
        }

        let chunk_size = self.def.chunk_size.unwrap_or(run.config().action_chunk_size);
        for (n, chunk) in chunks(targets, chunk_size).into_iter().enumerate() {
            run.check_cancelled()?;
            tracing::debug!(action = %self.def.key, "chunk {} ({} resources)", n + 1, chunk.len());

            for index in chunk {
                let resource = &mut resources[index];
                let request = self.request(resource);
                match run.invoke(&self.service, &request).await {
                    Ok(result) => {
                        if let (Some(result_key), Some(annotation_key)) =
                            (&self.def.result_key, &self.def.annotation_key)
                        {
                            if let Some(value) = result.get(result_key) {
                                resource.annotate(annotation_key, value.clone());
                            }
                        }
                        report.succeeded += 1;
                        report.resource_ids.push(resource.id());
                    }
                    Err(CallError::Provider(err)) if self.is_ignored(&err) => {
                        tracing::warn!(
                            action = %self.def.key,
                            "ignoring error on {}: {}",
                            resource.id(),
                            err
                        );
                        report.ignored += 1;
                    }
                    Err(err) => {
                        let resource_id = resource.id();
                        return Err(err.into_engine(|source| EngineError::Action {
                            action: self.def.key.clone(),
                            resource_id,
                            source,
                        }));
                    }
                }
            }
        }

        tracing::info!(
            action = %self.def.key,
            succeeded = report.succeeded,
            ignored = report.ignored,
            "action complete"
        );
        Ok(report)
    }
}
