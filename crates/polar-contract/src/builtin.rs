use serde_json::{json, Value};

use crate::{ActionContract, RiskClass, TrustClass};

pub const EXTENSION_LIFECYCLE_ACTION_ID: &str = "extension.lifecycle.apply";
pub const EXTENSION_EXECUTE_ACTION_ID: &str = "extension.execute";
pub const EXTENSION_CONTRACT_VERSION: u32 = 1;

const EXTENSION_TYPES: [&str; 3] = ["skill", "mcp", "plugin"];
const TRUST_LEVELS: [&str; 4] = ["trusted", "reviewed", "sandboxed", "blocked"];
const LIFECYCLE_STATES: [&str; 6] = [
    "pending_install",
    "installed",
    "enabled",
    "disabled",
    "removed",
    "blocked",
];
const LIFECYCLE_OPERATIONS: [&str; 7] = [
    "install", "enable", "disable", "upgrade", "rollback", "retrust", "remove",
];

pub fn builtin_contracts() -> Vec<ActionContract> {
    vec![
        extension_lifecycle_contract(),
        extension_execute_contract(),
    ]
}

pub fn extension_lifecycle_contract() -> ActionContract {
    ActionContract {
        action_id: EXTENSION_LIFECYCLE_ACTION_ID.to_string(),
        version: EXTENSION_CONTRACT_VERSION,
        input_schema: json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["extensionId", "extensionType", "operation"],
            "properties": {
                "extensionId": non_empty_string(),
                "extensionType": { "enum": EXTENSION_TYPES },
                "operation": { "enum": LIFECYCLE_OPERATIONS },
                "trustLevel": nullable_enum(&TRUST_LEVELS),
                "sourceUri": { "type": ["string", "null"] },
                "requestedPermissions": {
                    "type": ["array", "null"],
                    "items": { "type": "string" }
                },
                "approvalTicket": { "type": ["string", "null"] },
                "metadata": { "type": ["object", "null"] },
                "capabilities": {
                    "type": ["array", "null"],
                    "items": capability_schema()
                }
            }
        }),
        output_schema: json!({
            "type": "object",
            "required": [
                "status",
                "extensionId",
                "extensionType",
                "operation",
                "trustLevel",
                "lifecycleState",
                "permissionDelta"
            ],
            "properties": {
                "status": { "enum": ["applied", "rejected"] },
                "extensionId": non_empty_string(),
                "extensionType": { "enum": EXTENSION_TYPES },
                "operation": { "enum": LIFECYCLE_OPERATIONS },
                "trustLevel": { "enum": TRUST_LEVELS },
                "lifecycleState": { "enum": LIFECYCLE_STATES },
                "permissionDelta": {
                    "type": "object",
                    "required": ["added", "removed", "retained"],
                    "properties": {
                        "added": string_array(),
                        "removed": string_array(),
                        "retained": string_array()
                    }
                },
                "reason": { "type": "string" }
            },
            "if": { "properties": { "status": { "const": "rejected" } } },
            "then": { "required": ["reason"] }
        }),
        risk_class: RiskClass::High,
        trust_class: TrustClass::Native,
    }
}

pub fn extension_execute_contract() -> ActionContract {
    ActionContract {
        action_id: EXTENSION_EXECUTE_ACTION_ID.to_string(),
        version: EXTENSION_CONTRACT_VERSION,
        input_schema: json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["extensionId", "extensionType", "capabilityId", "sessionId", "userId"],
            "properties": {
                "extensionId": non_empty_string(),
                "extensionType": { "enum": EXTENSION_TYPES },
                "capabilityId": non_empty_string(),
                "sessionId": non_empty_string(),
                "userId": non_empty_string(),
                "trustLevel": nullable_enum(&TRUST_LEVELS),
                "capabilityScope": {
                    "type": ["object", "null"],
                    "properties": {
                        "allowed": {
                            "type": ["object", "null"],
                            "additionalProperties": string_array()
                        }
                    }
                },
                "input": {},
                "metadata": { "type": ["object", "null"] }
            }
        }),
        output_schema: json!({
            "type": "object",
            "required": ["status", "extensionId", "extensionType", "capabilityId"],
            "properties": {
                "status": { "enum": ["completed", "failed"] },
                "extensionId": non_empty_string(),
                "extensionType": { "enum": EXTENSION_TYPES },
                "capabilityId": non_empty_string(),
                "trustLevel": { "enum": TRUST_LEVELS },
                "error": {
                    "type": "object",
                    "required": ["code", "message"],
                    "properties": {
                        "code": non_empty_string(),
                        "message": { "type": "string" },
                        "cause": { "type": "string" }
                    }
                }
            },
            "if": { "properties": { "status": { "const": "failed" } } },
            "then": { "required": ["error"] },
            "else": { "required": ["trustLevel", "output"] }
        }),
        risk_class: RiskClass::Moderate,
        trust_class: TrustClass::Native,
    }
}

fn capability_schema() -> Value {
    json!({
        "type": "object",
        "required": ["capabilityId", "riskLevel", "sideEffects", "dataEgress"],
        "properties": {
            "capabilityId": non_empty_string(),
            "riskLevel": { "enum": ["read", "write", "destructive", "unknown"] },
            "sideEffects": { "enum": ["none", "internal", "external", "unknown"] },
            "dataEgress": { "enum": ["none", "network", "unknown"] },
            "metadataSource": { "enum": ["manifest", "operator"] }
        }
    })
}

fn non_empty_string() -> Value {
    json!({ "type": "string", "minLength": 1 })
}

fn string_array() -> Value {
    json!({ "type": "array", "items": { "type": "string" } })
}

fn nullable_enum(values: &[&str]) -> Value {
    let mut options = values
        .iter()
        .map(|value| Value::String((*value).to_string()))
        .collect::<Vec<_>>();
    options.push(Value::Null);
    json!({ "enum": options })
}
