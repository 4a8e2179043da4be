use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use polar_extensions::{CapabilityAdapter, CapabilityInvocation};
use polar_governance_types::{
    CapabilityScopeInput, ExecuteRequest, ExtensionType, LifecycleOperation, LifecycleRequest,
    LifecycleState, LifecycleStatus, MissingMetadata, PermissionDelta, RiskLevel, SideEffects,
    TrustLevel,
};
use polar_lineage::{InMemoryLineageStore, LineageEntry, LineageQuery, LineageStore};
use polar_orchestrator::SessionProfile;
use polar_skills::{AdapterFactory, InstallRequest, OverrideMetadata, ParsedManifest};
use polar_startup::{parse_governance_config, GovernanceRuntime, RuntimeComponents};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

const WEB_SKILL: &str = "---\n\
id: web\n\
name: Web Search\n\
permissions: network.http\n\
---\n\
## Capabilities\n\
- search_web: Search the web [riskLevel=read, sideEffects=none, dataEgress=network]\n\
- delete_internet: Do not ship this [riskLevel=destructive, sideEffects=external]\n";

const NOTES_SKILL: &str = "---\n\
id: notes\n\
permissions: fs.write\n\
---\n\
## Capabilities\n\
- write_note: Persist a note\n";

fn web_skill_with_permissions(permissions: &str) -> String {
    format!(
        "---\nid: web\npermissions: {permissions}\n---\n## Capabilities\n- search_web: Search [riskLevel=read, sideEffects=none]\n"
    )
}

struct EchoAdapter;

#[async_trait]
impl CapabilityAdapter for EchoAdapter {
    async fn execute_capability(&self, invocation: CapabilityInvocation) -> anyhow::Result<Value> {
        Ok(json!({
            "capabilityId": invocation.capability_id,
            "input": invocation.input,
        }))
    }
}

struct EchoFactory;

impl AdapterFactory for EchoFactory {
    fn build(
        &self,
        _extension_type: ExtensionType,
        _manifest: &ParsedManifest,
    ) -> Option<Arc<dyn CapabilityAdapter>> {
        Some(Arc::new(EchoAdapter))
    }
}

fn runtime_with(raw_config: Value) -> GovernanceRuntime {
    let config = parse_governance_config(&raw_config.to_string()).expect("config");
    GovernanceRuntime::with_components(
        config,
        RuntimeComponents {
            adapter_factory: Some(Arc::new(EchoFactory)),
            ..RuntimeComponents::default()
        },
    )
    .expect("runtime")
}

fn runtime() -> GovernanceRuntime {
    runtime_with(json!({ "schema_version": 1 }))
}

fn enabled_install(source_uri: &str, manifest: &str) -> InstallRequest {
    let mut request = InstallRequest::new(source_uri, manifest);
    request.enable_after_install = true;
    request
}

fn execute_request(capability_id: &str, scope: Option<CapabilityScopeInput>) -> ExecuteRequest {
    ExecuteRequest {
        extension_id: "web".to_string(),
        extension_type: ExtensionType::Skill,
        capability_id: capability_id.to_string(),
        session_id: "session-1".to_string(),
        user_id: "user-1".to_string(),
        trust_level: None,
        capability_scope: scope,
        input: json!({ "query": "rust" }),
        metadata: None,
    }
}

#[tokio::test]
async fn integration_type_immutability_leaves_state_untouched() {
    let runtime = runtime();
    let installed = runtime
        .installer()
        .install_skill(InstallRequest::new("file:///skills/web.md", WEB_SKILL))
        .await
        .expect("install");
    assert!(installed.is_applied());
    let before = runtime.gateway().get_state("web").await.expect("state");

    let response = runtime
        .gateway()
        .apply_lifecycle(
            LifecycleRequest::new("web", ExtensionType::Mcp, LifecycleOperation::Upgrade)
                .with_permissions(["network.http", "shell.exec"]),
        )
        .await
        .expect("upgrade");
    assert_eq!(response.status, LifecycleStatus::Rejected);
    assert_eq!(response.lifecycle_state, before.lifecycle_state);
    assert!(response.permission_delta.is_unchanged());
    assert_eq!(runtime.gateway().get_state("web").await, Some(before));
}

#[test]
fn integration_permission_delta_algebra_holds_for_random_sets() {
    let alphabet = [
        "fs.read", "fs.write", "network.http", "shell.exec", "calendar.read", "mail.send",
    ];
    let mut rng = StdRng::seed_from_u64(0x9e37_79b9);
    for _ in 0..256 {
        let mut sample = || -> BTreeSet<String> {
            alphabet
                .iter()
                .filter(|_| rng.gen_bool(0.5))
                .map(|permission| permission.to_string())
                .collect()
        };
        let previous = sample();
        let next = sample();
        let delta = PermissionDelta::compute(&previous, &next);

        let added: BTreeSet<String> = delta.added.iter().cloned().collect();
        let removed: BTreeSet<String> = delta.removed.iter().cloned().collect();
        let retained: BTreeSet<String> = delta.retained.iter().cloned().collect();
        assert!(added.is_disjoint(&removed));
        assert_eq!(retained, previous.intersection(&next).cloned().collect());
        assert_eq!(added, next.difference(&previous).cloned().collect());
        assert_eq!(removed, previous.difference(&next).cloned().collect());
    }
}

#[tokio::test]
async fn integration_blocked_trust_never_reaches_enabled() {
    let runtime = runtime();
    runtime
        .installer()
        .install_skill(InstallRequest::new("file:///skills/web.md", WEB_SKILL))
        .await
        .expect("install");
    let blocked = runtime
        .gateway()
        .apply_lifecycle(
            LifecycleRequest::new("web", ExtensionType::Skill, LifecycleOperation::Retrust)
                .with_trust_level(TrustLevel::Blocked),
        )
        .await
        .expect("retrust");
    assert!(blocked.is_applied());
    assert_eq!(blocked.trust_level, TrustLevel::Blocked);

    let attempts = [
        LifecycleRequest::new("web", ExtensionType::Skill, LifecycleOperation::Enable),
        LifecycleRequest::new("web", ExtensionType::Skill, LifecycleOperation::Upgrade)
            .with_trust_level(TrustLevel::Trusted)
            .with_permissions(["network.http"]),
        LifecycleRequest::new("web", ExtensionType::Skill, LifecycleOperation::Rollback)
            .with_trust_level(TrustLevel::Reviewed),
        LifecycleRequest::new("web", ExtensionType::Skill, LifecycleOperation::Retrust)
            .with_trust_level(TrustLevel::Trusted),
        LifecycleRequest::new("web", ExtensionType::Skill, LifecycleOperation::Enable)
            .with_trust_level(TrustLevel::Trusted),
    ];
    for request in attempts {
        let response = runtime
            .gateway()
            .apply_lifecycle(request)
            .await
            .expect("lifecycle");
        assert_ne!(response.lifecycle_state, LifecycleState::Enabled);
        let state = runtime.gateway().get_state("web").await.expect("state");
        assert_ne!(state.lifecycle_state, LifecycleState::Enabled);
        assert_eq!(state.trust_level, TrustLevel::Blocked);
    }
}

#[tokio::test]
async fn integration_scope_least_privilege_denies_out_of_scope_capability() {
    let runtime = runtime_with(json!({
        "schema_version": 1,
        "scope": { "global_allowed_skills": ["web"] }
    }));
    runtime
        .installer()
        .install_skill(enabled_install("file:///skills/web.md", WEB_SKILL))
        .await
        .expect("install");

    let narrow = CapabilityScopeInput {
        allowed: Some([("web".to_string(), vec!["search_web".to_string()])].into()),
        constraints: None,
    };
    let denied = runtime
        .gateway()
        .execute(execute_request("delete_internet", Some(narrow.clone())))
        .await
        .expect("execute");
    assert!(!denied.is_completed());
    assert_eq!(denied.error_code(), Some("POLAR_EXTENSION_POLICY_DENIED"));

    let allowed = runtime
        .gateway()
        .execute(execute_request("search_web", Some(narrow)))
        .await
        .expect("execute");
    assert!(allowed.is_completed());
    assert_eq!(
        allowed.output().and_then(|output| output.get("capabilityId")),
        Some(&json!("search_web"))
    );

    let wildcard = CapabilityScopeInput {
        allowed: Some([("web".to_string(), vec!["*".to_string()])].into()),
        constraints: None,
    };
    let any = runtime
        .gateway()
        .execute(execute_request("delete_internet", Some(wildcard)))
        .await
        .expect("execute");
    assert!(any.is_completed());

    let projected = runtime
        .capability_scope(&SessionProfile::default(), None)
        .await;
    let via_projection = runtime
        .gateway()
        .execute(execute_request("search_web", Some(projected.to_input())))
        .await
        .expect("execute");
    assert!(via_projection.is_completed());
}

#[tokio::test]
async fn integration_risk_metadata_gate_then_override_enables_install() {
    let runtime = runtime();
    let request = enabled_install("file:///skills/notes.md", NOTES_SKILL);

    let rejected = runtime
        .installer()
        .install_skill(request.clone())
        .await
        .expect("install");
    assert_eq!(rejected.status, LifecycleStatus::Rejected);
    assert_eq!(rejected.reason.as_deref(), Some("Skill metadata required"));
    assert_eq!(
        rejected.missing_metadata,
        vec![MissingMetadata {
            capability_id: "write_note".to_string(),
            missing_fields: vec!["riskLevel".to_string(), "sideEffects".to_string()],
        }]
    );
    let wire = serde_json::to_value(&rejected).expect("json");
    assert_eq!(wire["missingMetadata"][0]["capabilityId"], "write_note");

    let outcome = runtime
        .registry()
        .submit_override(
            "notes",
            "write_note",
            OverrideMetadata {
                risk_level: RiskLevel::Write,
                side_effects: SideEffects::Internal,
                data_egress: None,
                explanation: "Notes are written to the local workspace only".to_string(),
            },
        )
        .await
        .expect("override");
    assert!(outcome.unblocked);

    let applied = runtime
        .installer()
        .install_skill(request)
        .await
        .expect("reinstall");
    assert_eq!(applied.status, LifecycleStatus::Applied);
    assert_eq!(applied.lifecycle_state, LifecycleState::Enabled);
}

#[tokio::test]
async fn integration_approval_gating_on_upgrade() {
    let runtime = runtime_with(json!({
        "schema_version": 1,
        "approval_required_permissions": ["fs.write"]
    }));
    runtime
        .installer()
        .install_skill(InstallRequest::new(
            "file:///skills/web.md",
            web_skill_with_permissions("network.http"),
        ))
        .await
        .expect("install");

    let upgrade = InstallRequest::new(
        "file:///skills/web.md",
        web_skill_with_permissions("network.http, fs.write"),
    );
    let rejected = runtime
        .installer()
        .install_skill(upgrade.clone())
        .await
        .expect("upgrade");
    assert_eq!(rejected.status, LifecycleStatus::Rejected);
    assert_eq!(rejected.operation, LifecycleOperation::Upgrade);

    let applied = runtime
        .installer()
        .install_skill(InstallRequest {
            approval_ticket: Some("CHG-7".to_string()),
            ..upgrade
        })
        .await
        .expect("upgrade");
    assert!(applied.is_applied());
    assert_eq!(applied.permission_delta.added, vec!["fs.write".to_string()]);
    let state = runtime.gateway().get_state("web").await.expect("state");
    assert!(state.permissions.contains("fs.write"));
}

#[tokio::test]
async fn integration_lineage_sequences_are_gap_free_under_concurrency() {
    let store = Arc::new(InMemoryLineageStore::new());
    let mut handles = Vec::new();
    for worker in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut sequences = Vec::new();
            for step in 0..25 {
                let record = store
                    .append(LineageEntry::new(
                        "test.append",
                        json!({ "worker": worker, "step": step }),
                    ))
                    .await
                    .expect("append");
                sequences.push(record.sequence);
            }
            sequences
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        let sequences = handle.await.expect("join");
        assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
        all.extend(sequences);
    }
    all.sort_unstable();
    assert_eq!(all, (1..=200).collect::<Vec<u64>>());

    let page = store
        .query(LineageQuery {
            limit: Some(1000),
            ..LineageQuery::from_sequence(150)
        })
        .await
        .expect("query");
    assert_eq!(page.returned_count, 51);
    assert!(page.items.iter().all(|record| record.sequence >= 150));
}

#[tokio::test]
async fn integration_governed_calls_leave_ordered_lineage() {
    let runtime = runtime();
    let response = runtime
        .gateway()
        .apply_lifecycle_traced(
            LifecycleRequest::new("web", ExtensionType::Skill, LifecycleOperation::Install)
                .with_permissions(["network.http"]),
            Some("trace-lineage"),
        )
        .await
        .expect("install");
    assert!(response.is_applied());

    let page = runtime
        .lineage()
        .query(LineageQuery {
            trace_id: Some("trace-lineage".to_string()),
            ..LineageQuery::default()
        })
        .await
        .expect("query");
    assert_eq!(page.total_count, 7);
    assert!(page
        .items
        .windows(2)
        .all(|pair| pair[1].sequence == pair[0].sequence + 1));
}

#[tokio::test]
async fn integration_remove_then_reinstall_discards_prior_state() {
    let runtime = runtime();
    let request = enabled_install("file:///skills/web.md", WEB_SKILL);
    runtime
        .installer()
        .install_skill(request.clone())
        .await
        .expect("install");
    let removed = runtime
        .gateway()
        .apply_lifecycle(LifecycleRequest::new(
            "web",
            ExtensionType::Skill,
            LifecycleOperation::Remove,
        ))
        .await
        .expect("remove");
    assert_eq!(removed.lifecycle_state, LifecycleState::Removed);
    assert!(!runtime.gateway().adapters().contains("web"));

    let reinstalled = runtime
        .installer()
        .install_skill(request)
        .await
        .expect("reinstall");
    assert!(reinstalled.is_applied());
    assert_eq!(reinstalled.operation, LifecycleOperation::Install);
    assert_eq!(reinstalled.permission_delta.added, vec!["network.http".to_string()]);
    assert!(reinstalled.permission_delta.retained.is_empty());
}
