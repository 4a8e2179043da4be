//! Versioned action contracts for governed Polar actions.
//!
//! A contract pins the input/output JSON schemas and the risk/trust classes
//! of one `(action_id, version)` pair. Every governed action resolves and
//! validates through the [`ContractRegistry`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jsonschema::{validator_for, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod builtin;

pub use builtin::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustClass {
    Native,
    Skill,
    Mcp,
    Plugin,
}

impl TrustClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Skill => "skill",
            Self::Mcp => "mcp",
            Self::Plugin => "plugin",
        }
    }
}

/// Declarative contract for one action version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContract {
    pub action_id: String,
    pub version: u32,
    pub input_schema: Value,
    pub output_schema: Value,
    pub risk_class: RiskClass,
    pub trust_class: TrustClass,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ContractKey {
    action_id: String,
    version: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractRegistryError {
    #[error("contract '{action_id}@{version}' is already registered")]
    AlreadyRegistered { action_id: String, version: u32 },
    #[error("contract not found: '{action_id}@{version}'")]
    NotFound { action_id: String, version: u32 },
    #[error("contract '{action_id}@{version}' has an invalid {side} schema: {message}")]
    InvalidSchema {
        action_id: String,
        version: u32,
        side: &'static str,
        message: String,
    },
}

/// Schema violations collected while validating one payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{side} for '{action_id}@{version}' violates contract: {}", .violations.join("; "))]
pub struct ContractViolation {
    pub action_id: String,
    pub version: u32,
    pub side: &'static str,
    pub violations: Vec<String>,
}

/// A contract with its schemas compiled once at registration time.
pub struct RegisteredContract {
    contract: ActionContract,
    input_validator: Validator,
    output_validator: Validator,
}

impl std::fmt::Debug for RegisteredContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredContract")
            .field("contract", &self.contract)
            .finish_non_exhaustive()
    }
}

impl RegisteredContract {
    pub fn contract(&self) -> &ActionContract {
        &self.contract
    }

    pub fn action_id(&self) -> &str {
        &self.contract.action_id
    }

    pub fn version(&self) -> u32 {
        self.contract.version
    }

    pub fn risk_class(&self) -> RiskClass {
        self.contract.risk_class
    }

    pub fn trust_class(&self) -> TrustClass {
        self.contract.trust_class
    }

    pub fn validate_input(&self, input: &Value) -> Result<(), ContractViolation> {
        self.validate("input", &self.input_validator, input)
    }

    pub fn validate_output(&self, output: &Value) -> Result<(), ContractViolation> {
        self.validate("output", &self.output_validator, output)
    }

    fn validate(
        &self,
        side: &'static str,
        validator: &Validator,
        payload: &Value,
    ) -> Result<(), ContractViolation> {
        let violations = validator
            .iter_errors(payload)
            .map(|error| error.to_string())
            .collect::<Vec<_>>();
        if violations.is_empty() {
            return Ok(());
        }
        Err(ContractViolation {
            action_id: self.contract.action_id.clone(),
            version: self.contract.version,
            side,
            violations,
        })
    }
}

/// Registry of `(action_id, version)` contracts. Registration is write-once per pair.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    contracts: RwLock<HashMap<ContractKey, Arc<RegisteredContract>>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the gateway's lifecycle and execute contracts.
    pub fn with_builtin_contracts() -> Result<Self, ContractRegistryError> {
        let registry = Self::new();
        for contract in builtin_contracts() {
            registry.register(contract)?;
        }
        Ok(registry)
    }

    pub fn register(&self, contract: ActionContract) -> Result<(), ContractRegistryError> {
        let key = ContractKey {
            action_id: contract.action_id.clone(),
            version: contract.version,
        };
        let input_validator = compile_schema(&contract, "input", &contract.input_schema)?;
        let output_validator = compile_schema(&contract, "output", &contract.output_schema)?;

        let mut contracts = write_unpoisoned(&self.contracts);
        if contracts.contains_key(&key) {
            return Err(ContractRegistryError::AlreadyRegistered {
                action_id: key.action_id,
                version: key.version,
            });
        }
        tracing::debug!(
            action_id = %contract.action_id,
            version = contract.version,
            risk_class = contract.risk_class.as_str(),
            "registered action contract"
        );
        contracts.insert(
            key,
            Arc::new(RegisteredContract {
                contract,
                input_validator,
                output_validator,
            }),
        );
        Ok(())
    }

    pub fn has(&self, action_id: &str, version: u32) -> bool {
        read_unpoisoned(&self.contracts).contains_key(&ContractKey {
            action_id: action_id.to_string(),
            version,
        })
    }

    pub fn get(
        &self,
        action_id: &str,
        version: u32,
    ) -> Result<Arc<RegisteredContract>, ContractRegistryError> {
        read_unpoisoned(&self.contracts)
            .get(&ContractKey {
                action_id: action_id.to_string(),
                version,
            })
            .cloned()
            .ok_or_else(|| ContractRegistryError::NotFound {
                action_id: action_id.to_string(),
                version,
            })
    }

    pub fn len(&self) -> usize {
        read_unpoisoned(&self.contracts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn compile_schema(
    contract: &ActionContract,
    side: &'static str,
    schema: &Value,
) -> Result<Validator, ContractRegistryError> {
    validator_for(schema).map_err(|error| ContractRegistryError::InvalidSchema {
        action_id: contract.action_id.clone(),
        version: contract.version,
        side,
        message: error.to_string(),
    })
}

fn read_unpoisoned<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_unpoisoned<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
