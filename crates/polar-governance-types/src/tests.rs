use std::collections::BTreeSet;

use serde_json::json;

use super::*;

fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[test]
fn unit_permission_delta_partitions_previous_and_next() {
    let delta = PermissionDelta::compute(["fs.read", "net.http"], ["net.http", "shell.exec"]);
    assert_eq!(delta.added, vec!["shell.exec"]);
    assert_eq!(delta.removed, vec!["fs.read"]);
    assert_eq!(delta.retained, vec!["net.http"]);
}

#[test]
fn functional_permission_delta_algebra_holds_for_overlapping_sets() {
    let cases: [(&[&str], &[&str]); 5] = [
        (&[], &[]),
        (&["a"], &[]),
        (&[], &["a", "b"]),
        (&["a", "b", "c"], &["b", "c", "d"]),
        (&["x", "y"], &["x", "y"]),
    ];
    for (previous, next) in cases {
        let delta = PermissionDelta::compute(previous.iter(), next.iter());
        let added = set(&delta.added.iter().map(String::as_str).collect::<Vec<_>>());
        let removed = set(&delta.removed.iter().map(String::as_str).collect::<Vec<_>>());
        let retained = set(&delta.retained.iter().map(String::as_str).collect::<Vec<_>>());
        let previous = set(previous);
        let next = set(next);

        assert!(added.is_disjoint(&removed));
        assert!(added.is_disjoint(&retained));
        assert_eq!(retained, previous.intersection(&next).cloned().collect());
        assert_eq!(added, next.difference(&previous).cloned().collect());
        assert_eq!(removed, previous.difference(&next).cloned().collect());
        assert_eq!(previous, retained.union(&removed).cloned().collect());
        assert_eq!(next, retained.union(&added).cloned().collect());
    }
}

#[test]
fn unit_retained_only_delta_is_unchanged() {
    let delta = PermissionDelta::retained_only(["b", "a"]);
    assert!(delta.is_unchanged());
    assert_eq!(delta.retained, vec!["a", "b"]);
}

#[test]
fn unit_capability_reports_missing_risk_fields_in_wire_order() {
    let capability = Capability::unknown("search_web");
    assert_eq!(
        capability.missing_risk_fields(),
        vec!["riskLevel".to_string(), "sideEffects".to_string()]
    );
    assert!(!capability.has_complete_risk_metadata());
}

#[test]
fn unit_enums_parse_and_render_wire_names() {
    assert_eq!(
        "pending_install".parse::<LifecycleState>(),
        Ok(LifecycleState::PendingInstall)
    );
    assert_eq!(TrustLevel::Sandboxed.to_string(), "sandboxed");
    assert_eq!(ExtensionType::Mcp.display_label(), "MCP");
    let error = "eventual".parse::<RiskLevel>().expect_err("unknown risk");
    assert_eq!(error.to_string(), "unsupported risk level 'eventual'");
}

#[test]
fn functional_execute_response_serializes_status_tag_and_camel_case_fields() {
    let request = ExecuteRequest {
        extension_id: "web".to_string(),
        extension_type: ExtensionType::Skill,
        capability_id: "delete_internet".to_string(),
        session_id: "s-1".to_string(),
        user_id: "u-1".to_string(),
        trust_level: None,
        capability_scope: None,
        input: json!({}),
        metadata: None,
    };
    let response = ExecuteResponse::failed(
        &request,
        ExtensionFailure::new(codes::EXTENSION_POLICY_DENIED, "denied"),
    );
    let value = serde_json::to_value(&response).expect("serialize");
    assert_eq!(value["status"], "failed");
    assert_eq!(value["extensionId"], "web");
    assert_eq!(value["error"]["code"], "POLAR_EXTENSION_POLICY_DENIED");
    assert!(value["error"].get("cause").is_none());
}

#[test]
fn regression_lifecycle_request_rejects_unknown_fields() {
    let error = serde_json::from_value::<LifecycleRequest>(json!({
        "extensionId": "web",
        "extensionType": "skill",
        "operation": "install",
        "approvalRequiredPermissions": ["net.http"]
    }))
    .expect_err("unknown field");
    assert!(error.to_string().contains("approvalRequiredPermissions"));
}

#[test]
fn unit_rejected_lifecycle_response_reports_removed_for_absent_extension() {
    let request = LifecycleRequest::new("web", ExtensionType::Skill, LifecycleOperation::Enable);
    let response = LifecycleResponse::rejected(&request, None, "not installed");
    assert_eq!(response.status, LifecycleStatus::Rejected);
    assert_eq!(response.lifecycle_state, LifecycleState::Removed);
    assert_eq!(response.trust_level, TrustLevel::Sandboxed);
    assert!(response.permission_delta.is_unchanged());
}

#[test]
fn unit_pending_install_metadata_flag_is_detected() {
    let mut request = LifecycleRequest::new("web", ExtensionType::Skill, LifecycleOperation::Install);
    assert!(!request.requests_pending_install());
    request.metadata = Some(json!({ "pendingInstall": true }));
    assert!(request.requests_pending_install());
}
