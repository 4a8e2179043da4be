use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use polar_governance_types::{Capability, ExtensionType, TrustLevel};
use serde_json::Value;

/// Authorized capability call handed to an extension adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityInvocation {
    pub extension_id: String,
    pub extension_type: ExtensionType,
    pub capability_id: String,
    pub session_id: String,
    pub user_id: String,
    pub trust_level: TrustLevel,
    pub capability: Option<Capability>,
    pub input: Value,
    pub metadata: Option<Value>,
}

/// Executes capabilities for installed extensions (skill runtimes, MCP clients, plugin HTTP bridges).
#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    async fn execute_capability(&self, invocation: CapabilityInvocation) -> anyhow::Result<Value>;
}

/// Adapters keyed by extension id.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn CapabilityAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, extension_id: &str, adapter: Arc<dyn CapabilityAdapter>) {
        let mut adapters = match self.adapters.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        adapters.insert(extension_id.to_string(), adapter);
    }

    pub fn unregister(&self, extension_id: &str) -> bool {
        let mut adapters = match self.adapters.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        adapters.remove(extension_id).is_some()
    }

    pub fn get(&self, extension_id: &str) -> Option<Arc<dyn CapabilityAdapter>> {
        let adapters = match self.adapters.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        adapters.get(extension_id).cloned()
    }

    pub fn contains(&self, extension_id: &str) -> bool {
        self.get(extension_id).is_some()
    }
}
