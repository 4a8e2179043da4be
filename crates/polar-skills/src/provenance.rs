//! Source provenance checks for extension installs.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, VerifyingKey};
use polar_governance_types::TrustLevel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const REMOTE_SOURCE_PREFIXES: [&str; 3] = ["http://", "https://", "git+"];

/// Operator provenance rules, fixed when the installer is built.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvenancePolicy {
    pub allowed_source_prefixes: Vec<String>,
    pub blocked_source_prefixes: Vec<String>,
    pub trusted_source_prefixes: Vec<String>,
    pub require_pinned_revision_for_remote: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ProvenanceInput<'a> {
    pub source_uri: &'a str,
    pub content: &'a [u8],
    pub expected_hash: Option<&'a str>,
    pub pinned_revision: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub signer_public_key: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceReport {
    pub verified: bool,
    pub source_uri: String,
    pub content_hash: String,
    pub remote: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_revision: Option<String>,
    pub signature_verified: bool,
    pub recommended_trust_level: TrustLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Verifies a source against `policy`. Failures are reported, never raised,
/// and always recommend `blocked`.
pub fn verify_provenance(policy: &ProvenancePolicy, input: ProvenanceInput<'_>) -> ProvenanceReport {
    let source_uri = input.source_uri.trim();
    let remote = is_remote_source(source_uri);
    let pinned_revision = input
        .pinned_revision
        .map(str::trim)
        .filter(|revision| !revision.is_empty())
        .map(str::to_string);
    let mut report = ProvenanceReport {
        verified: false,
        source_uri: source_uri.to_string(),
        content_hash: sha256_hex(input.content),
        remote,
        pinned_revision,
        signature_verified: false,
        recommended_trust_level: TrustLevel::Blocked,
        failure: None,
    };

    match check_source(policy, &input, &report) {
        Ok(signature_verified) => {
            report.verified = true;
            report.signature_verified = signature_verified;
            report.recommended_trust_level = if matches_prefix(&policy.trusted_source_prefixes, source_uri) {
                TrustLevel::Trusted
            } else if signature_verified || !remote {
                TrustLevel::Reviewed
            } else {
                TrustLevel::Sandboxed
            };
        }
        Err(error) => {
            tracing::info!(
                source_uri = %source_uri,
                error = %format!("{error:#}"),
                "extension source failed provenance verification"
            );
            report.failure = Some(format!("{error:#}"));
        }
    }
    report
}

fn check_source(
    policy: &ProvenancePolicy,
    input: &ProvenanceInput<'_>,
    report: &ProvenanceReport,
) -> Result<bool> {
    let source_uri = report.source_uri.as_str();
    if source_uri.is_empty() {
        bail!("source uri is empty");
    }
    if matches_prefix(&policy.blocked_source_prefixes, source_uri) {
        bail!("source '{source_uri}' matches a blocked source prefix");
    }
    if !policy.allowed_source_prefixes.is_empty()
        && !matches_prefix(&policy.allowed_source_prefixes, source_uri)
    {
        bail!("source '{source_uri}' is not under an allowed source prefix");
    }
    if let Some(expected) = input
        .expected_hash
        .map(normalize_sha256)
        .filter(|expected| !expected.is_empty())
    {
        if expected != report.content_hash {
            bail!(
                "sha256 mismatch for '{source_uri}': expected {expected}, got {}",
                report.content_hash
            );
        }
    }
    if report.remote && policy.require_pinned_revision_for_remote && report.pinned_revision.is_none() {
        bail!("remote source '{source_uri}' requires a pinned revision");
    }

    let signature = input.signature.map(str::trim).filter(|value| !value.is_empty());
    let signer = input
        .signer_public_key
        .map(str::trim)
        .filter(|value| !value.is_empty());
    match (signature, signer) {
        (None, None) => Ok(false),
        (Some(signature), Some(signer)) => {
            verify_ed25519_signature(input.content, signature, signer)
                .with_context(|| format!("signature verification failed for '{source_uri}'"))?;
            Ok(true)
        }
        _ => bail!(
            "incomplete signature metadata for '{source_uri}': both signature and signer public key are required"
        ),
    }
}

pub fn is_remote_source(source_uri: &str) -> bool {
    let lowered = source_uri.trim().to_ascii_lowercase();
    REMOTE_SOURCE_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}

fn matches_prefix(prefixes: &[String], source_uri: &str) -> bool {
    prefixes
        .iter()
        .map(|prefix| prefix.trim())
        .any(|prefix| !prefix.is_empty() && source_uri.starts_with(prefix))
}

pub fn verify_ed25519_signature(
    message: &[u8],
    signature_base64: &str,
    public_key_base64: &str,
) -> Result<()> {
    let public_key_bytes = decode_base64_fixed::<32>("public key", public_key_base64)?;
    let signature_bytes = decode_base64_fixed::<64>("signature", signature_base64)?;
    let verifying_key = VerifyingKey::from_bytes(&public_key_bytes)
        .context("failed to decode ed25519 public key bytes")?;
    let signature = Signature::from_bytes(&signature_bytes);
    verifying_key
        .verify_strict(message, &signature)
        .map_err(|error| anyhow!("invalid ed25519 signature: {error}"))
}

fn decode_base64_fixed<const N: usize>(label: &str, value: &str) -> Result<[u8; N]> {
    let decoded = BASE64
        .decode(value.trim())
        .with_context(|| format!("failed to decode {label} from base64"))?;
    decoded
        .try_into()
        .map_err(|_| anyhow!("{label} must decode to {N} bytes"))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Lowercases and strips an optional `sha256:` prefix.
pub fn normalize_sha256(value: &str) -> String {
    let value = value.trim().to_ascii_lowercase();
    value
        .strip_prefix("sha256:")
        .map(str::to_string)
        .unwrap_or(value)
}
