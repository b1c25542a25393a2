use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::{
    CapabilityRequest, CapabilityResponse, CapabilityTransport, ProviderError, TransportFailure,
};
use crate::capability::CapabilityDescriptor;

/// A capability implemented in-process.
#[async_trait]
pub trait LocalCapability: Send + Sync {
    fn descriptor(&self) -> CapabilityDescriptor;

    async fn run(&self, request: &CapabilityRequest) -> Result<Value, ProviderError>;
}

/// Transport dispatching to in-process capabilities by name.
pub struct LocalTransport {
    name: String,
    capabilities: HashMap<String, Arc<dyn LocalCapability>>,
    order: Vec<String>,
}

impl LocalTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: Arc<dyn LocalCapability>) -> Self {
        let name = capability.descriptor().name;
        if !self.capabilities.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.capabilities.insert(name, capability);
        self
    }
}

#[async_trait]
impl CapabilityTransport for LocalTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<CapabilityDescriptor>, TransportFailure> {
        Ok(self
            .order
            .iter()
            .filter_map(|name| self.capabilities.get(name))
            .map(|capability| {
                let mut descriptor = capability.descriptor();
                descriptor.transport.provider = self.name.clone();
                descriptor
            })
            .collect())
    }

    async fn call(
        &self,
        descriptor: &CapabilityDescriptor,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, TransportFailure> {
        let Some(capability) = self.capabilities.get(&descriptor.name) else {
            return Ok(CapabilityResponse::failed(ProviderError::new(
                "UnknownCapability",
                format!("'{}' is not served by '{}'", descriptor.name, self.name),
            )));
        };
        match capability.run(&request).await {
            Ok(result) => Ok(CapabilityResponse::ok(result)),
            Err(error) => Ok(CapabilityResponse::failed(error)),
        }
    }
}
