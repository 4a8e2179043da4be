use std::collections::BTreeSet;

use polar_core::dedupe_preserving_order;
use serde::{Deserialize, Serialize};

pub const FORWARD_REJECTION_NOT_ALLOWLISTED: &str = "not_in_forward_allowlist";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedForward {
    pub skill_id: String,
    pub reason: String,
}

/// Partition of a delegation's requested skill forwards.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardSkillValidation {
    pub allowed: Vec<String>,
    pub rejected: Vec<RejectedForward>,
    pub is_blocked: bool,
}

/// Splits requested forwards into allowlisted and rejected skills.
///
/// An empty server allowlist forwards nothing. The delegation is blocked when
/// no skill survives unless `allow_empty` is set.
pub fn validate_forward_skills(
    requested: &[String],
    server_allowlist: &[String],
    allow_empty: bool,
) -> ForwardSkillValidation {
    let allowlist = server_allowlist
        .iter()
        .map(|skill| skill.trim())
        .filter(|skill| !skill.is_empty())
        .collect::<BTreeSet<_>>();
    let mut validation = ForwardSkillValidation::default();
    for skill_id in dedupe_preserving_order(requested) {
        if allowlist.contains(skill_id.as_str()) {
            validation.allowed.push(skill_id);
        } else {
            validation.rejected.push(RejectedForward {
                skill_id,
                reason: FORWARD_REJECTION_NOT_ALLOWLISTED.to_string(),
            });
        }
    }
    validation.is_blocked = validation.allowed.is_empty() && !allow_empty;
    if validation.is_blocked {
        tracing::info!(
            requested = requested.len(),
            rejected = validation.rejected.len(),
            "delegation blocked: no forwarded skill survived the allowlist"
        );
    }
    validation
}

/// Model chosen for a delegated run after clamping a caller override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOverrideResolution {
    pub model: String,
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_reason: Option<String>,
}

impl ModelOverrideResolution {
    pub fn was_rejected(&self) -> bool {
        self.rejected_reason.is_some()
    }
}

/// Infers a provider id from a model name; `provider/model` wins over prefixes.
pub fn infer_provider_id(model: &str) -> String {
    let model = model.trim();
    if let Some((provider, rest)) = model.split_once('/') {
        if !provider.trim().is_empty() && !rest.trim().is_empty() {
            return provider.trim().to_ascii_lowercase();
        }
    }
    let lowered = model.to_ascii_lowercase();
    let provider = if lowered.starts_with("gpt-")
        || lowered.starts_with("chatgpt-")
        || lowered.starts_with("o1")
        || lowered.starts_with("o3")
        || lowered.starts_with("o4")
    {
        "openai"
    } else if lowered.starts_with("claude-") {
        "anthropic"
    } else if lowered.starts_with("gemini-") {
        "google"
    } else if lowered.starts_with("mistral-")
        || lowered.starts_with("mixtral-")
        || lowered.starts_with("codestral-")
    {
        "mistral"
    } else if lowered.starts_with("deepseek-") {
        "deepseek"
    } else if lowered.starts_with("grok-") {
        "xai"
    } else if lowered.starts_with("llama") {
        "meta"
    } else {
        "unknown"
    };
    provider.to_string()
}

/// Clamps a requested model to the server allowlist. Never fails; a refused
/// override falls back to `default_model` and reports why.
pub fn validate_model_override(
    requested: Option<&str>,
    allowlist: &[String],
    default_model: &str,
) -> ModelOverrideResolution {
    let fallback = |reason: Option<String>| ModelOverrideResolution {
        model: default_model.to_string(),
        provider_id: infer_provider_id(default_model),
        rejected_reason: reason,
    };

    let Some(requested) = requested.map(str::trim).filter(|model| !model.is_empty()) else {
        return fallback(None);
    };
    if requested == default_model.trim() {
        return fallback(None);
    }
    if allowlist.is_empty() {
        return fallback(Some(format!(
            "model override '{requested}' refused: no model overrides are allowlisted"
        )));
    }
    if !allowlist.iter().any(|model| model.trim() == requested) {
        return fallback(Some(format!(
            "model override '{requested}' is not in the server allowlist"
        )));
    }
    ModelOverrideResolution {
        model: requested.to_string(),
        provider_id: infer_provider_id(requested),
        rejected_reason: None,
    }
}
