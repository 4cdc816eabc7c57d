// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end approval flows against the in-memory collaborators.

use std::time::Duration;

use serde_json::{json, Value};
use tensor_approval::{
    memory::Sandbox, ApprovalBroker, ApprovalConfig, ApprovalError, ControlPlane, Credential,
    Phase, QuorumLedger, RequestId, RequestType,
};

const OPS_RULES: &str = r#"
path "secret/ops/*" {
  capabilities = ["read", "list"]
}
"#;

struct Fixture {
    sandbox: Sandbox,
    broker: ApprovalBroker,
    alice: Credential,
    bob: Credential,
}

fn fixture(total: u8, threshold: u8, config: ApprovalConfig) -> Fixture {
    let sandbox = Sandbox::new(total, threshold).unwrap();
    let broker = sandbox.broker(config).unwrap();
    let alice = sandbox.plane.add_user("alice");
    let bob = sandbox.plane.add_user("bob");
    Fixture {
        sandbox,
        broker,
        alice,
        bob,
    }
}

fn policy_body(name: &str, rules: &str) -> Value {
    json!({"type": "policy", "policy_name": name, "rules": rules})
}

#[test]
fn test_three_share_policy_change() {
    let f = fixture(5, 3, ApprovalConfig::default());
    f.sandbox.plane.set_policy("ops", "# old ops");

    let id = f.broker.add(&f.alice, &policy_body("ops", OPS_RULES)).unwrap();
    let pending = f.broker.get(&f.bob, id.as_str()).unwrap();
    assert_eq!(pending.request_type(), RequestType::Policy);
    assert_eq!(pending.required, 3);
    assert_eq!(pending.progress, 0);
    assert_eq!(pending.as_policy().unwrap().previous, "# old ops");

    let r = f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    assert_eq!(r.progress, 1);
    let r = f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[1]).unwrap();
    assert_eq!(r.progress, 2);
    assert_eq!(f.sandbox.plane.policy("ops").as_deref(), Some("# old ops"));
    assert_eq!(f.sandbox.plane.write_count(), 0);

    let done = f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[2]).unwrap();
    assert_eq!(done.progress, done.required);
    assert_eq!(done.as_policy().unwrap().previous, OPS_RULES);
    assert_eq!(f.sandbox.plane.policy("ops").as_deref(), Some(OPS_RULES));
    assert_eq!(f.sandbox.plane.write_count(), 1);

    // Credential revoked and every trace of the request purged.
    assert_eq!(f.sandbox.plane.live_elevated_count(), 0);
    assert_eq!(f.sandbox.plane.revocation_count(), 1);
    assert!(f.sandbox.store.is_empty());
    assert_eq!(f.sandbox.store.envelope_count(), 0);
    assert!(!f.broker.locks().is_locked(id.as_str()));

    let late = f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[3]);
    assert!(matches!(late, Err(ApprovalError::NotFound(_))));
    assert_eq!(f.sandbox.plane.write_count(), 1);
}

#[test]
fn test_policy_deletion() {
    let f = fixture(3, 2, ApprovalConfig::default());
    f.sandbox.plane.set_policy("legacy", "# legacy");

    let id = f.broker.add(&f.alice, &policy_body("legacy", "")).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    let done = f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[2]).unwrap();
    assert!(done.as_policy().unwrap().is_deletion());
    assert_eq!(f.sandbox.plane.policy("legacy"), None);
}

#[test]
fn test_add_is_idempotent() {
    let f = fixture(5, 3, ApprovalConfig::default());
    let body = policy_body("ops", "# ops");

    let first = f.broker.add(&f.alice, &body).unwrap();
    f.broker.approve(&f.bob, first.as_str(), &f.sandbox.shares[0]).unwrap();

    let second = f.broker.add(&f.alice, &body).unwrap();
    assert_eq!(first, second);
    assert_eq!(f.broker.get(&f.alice, first.as_str()).unwrap().progress, 1);

    // Another requester files a distinct request.
    let third = f.broker.add(&f.bob, &body).unwrap();
    assert_ne!(first, third);
}

#[test]
fn test_add_validation() {
    let f = fixture(3, 2, ApprovalConfig::default());

    let cases = [
        json!("not an object"),
        json!({"policy_name": "ops", "rules": "# x"}),
        json!({"type": "secret"}),
        json!({"type": "policy", "rules": "# x"}),
        json!({"type": "policy", "policy_name": "ops", "rules": "path \"x\" {"}),
        json!({"type": "token"}),
        json!({"type": "sync"}),
    ];
    for body in cases {
        let err = f.broker.add(&f.alice, &body).unwrap_err();
        assert!(
            matches!(err, ApprovalError::Validation(_)),
            "{body} gave {err}"
        );
    }
    assert!(f.sandbox.store.is_empty());
}

#[test]
fn test_add_without_change_is_rejected() {
    let f = fixture(3, 2, ApprovalConfig::default());
    f.sandbox.plane.set_policy("ops", "# ops");
    let err = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap_err();
    assert!(matches!(err, ApprovalError::NoChange(_)));

    // Deleting a policy that does not exist is also no change.
    let err = f.broker.add(&f.alice, &policy_body("ghost", "")).unwrap_err();
    assert!(matches!(err, ApprovalError::NoChange(_)));
}

#[test]
fn test_unknown_caller_is_denied() {
    let f = fixture(3, 2, ApprovalConfig::default());
    let stranger = Credential::new("s.unknown");
    let err = f.broker.add(&stranger, &policy_body("ops", "# ops")).unwrap_err();
    assert!(matches!(err, ApprovalError::PermissionDenied(_)));
}

#[test]
fn test_malformed_identifier() {
    let f = fixture(3, 2, ApprovalConfig::default());
    let upper = "A".repeat(64);
    let non_hex = "g".repeat(64);
    for id in ["", "abc", upper.as_str(), non_hex.as_str()] {
        assert!(matches!(
            f.broker.get(&f.alice, id),
            Err(ApprovalError::Validation(_))
        ));
    }
    assert!(matches!(
        f.broker.get(&f.alice, &"0".repeat(64)),
        Err(ApprovalError::NotFound(_))
    ));
}

#[test]
fn test_empty_share_is_rejected() {
    let f = fixture(3, 2, ApprovalConfig::default());
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    assert!(matches!(
        f.broker.approve(&f.bob, id.as_str(), "  "),
        Err(ApprovalError::Validation(_))
    ));
    assert_eq!(f.broker.get(&f.bob, id.as_str()).unwrap().progress, 0);
}

#[test]
fn test_policy_drift_marks_request_stale() {
    let f = fixture(5, 3, ApprovalConfig::default());
    f.sandbox.plane.set_policy("ops", "# v1");
    let id = f.broker.add(&f.alice, &policy_body("ops", "# v2")).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();

    f.sandbox.plane.set_policy("ops", "# edited elsewhere");
    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[1])
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Stale(_)));
    assert!(matches!(
        f.broker.get(&f.bob, id.as_str()),
        Err(ApprovalError::Stale(_))
    ));
    assert_eq!(f.sandbox.store.envelope_count(), 0);
    assert_eq!(f.sandbox.plane.policy("ops").as_deref(), Some("# edited elsewhere"));

    // Restoring the baseline makes the request executable again from zero.
    f.sandbox.plane.set_policy("ops", "# v1");
    assert_eq!(f.broker.get(&f.bob, id.as_str()).unwrap().progress, 0);
}

#[test]
fn test_sync_drift_refreshes_and_resets() {
    let config = ApprovalConfig::default().with_sync_path("policies");
    let f = fixture(5, 3, config);
    f.sandbox.plane.set_policy("default", "# default");
    f.sandbox.plane.set_policy("legacy", "# legacy");
    f.sandbox.source.publish(
        "r1",
        [
            ("policies/ops.hcl", "# ops"),
            ("policies/dev.hcl", "# dev"),
        ],
    );

    let id = f
        .broker
        .add(&f.alice, &json!({"type": "github", "commithash": "r1"}))
        .unwrap();
    let filed = f.broker.get(&f.alice, id.as_str()).unwrap();
    let changes = &filed.as_sync().unwrap().changes;
    assert_eq!(
        changes.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["dev", "legacy", "ops"]
    );
    assert!(changes["legacy"].is_deletion());

    let r = f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    assert_eq!(r.progress, 1);

    // Someone applies part of the revision out of band.
    f.sandbox.plane.set_policy("dev", "# dev");
    let refreshed = f.broker.get(&f.alice, id.as_str()).unwrap();
    assert_eq!(refreshed.progress, 0);
    assert_eq!(refreshed.as_sync().unwrap().changes.len(), 2);
    assert_eq!(refreshed.id().unwrap(), id);

    // The refreshed request starts a new round.
    for (i, share) in f.sandbox.shares[..3].iter().enumerate() {
        let r = f.broker.approve(&f.bob, id.as_str(), share).unwrap();
        assert_eq!(r.progress, i + 1);
    }
    let live = f.sandbox.plane.policies();
    assert_eq!(live.get("ops").map(String::as_str), Some("# ops"));
    assert_eq!(live.get("dev").map(String::as_str), Some("# dev"));
    assert_eq!(live.get("default").map(String::as_str), Some("# default"));
    assert!(!live.contains_key("legacy"));
    assert!(f.sandbox.store.is_empty());
}

#[test]
fn test_sync_drift_to_no_change() {
    let f = fixture(3, 2, ApprovalConfig::default());
    f.sandbox.source.publish("r1", [("ops.hcl", "# ops")]);
    let id = f
        .broker
        .add(&f.alice, &json!({"type": "sync", "revision": "r1"}))
        .unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();

    f.sandbox.plane.set_policy("ops", "# ops");
    assert!(matches!(
        f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[1]),
        Err(ApprovalError::NoChange(_))
    ));
    assert_eq!(f.sandbox.plane.write_count(), 0);
}

#[test]
fn test_sync_rejects_invalid_source_documents() {
    let f = fixture(3, 2, ApprovalConfig::default());
    f.sandbox.source.publish("bad", [("ops.hcl", "path \"x\" {")]);
    let err = f
        .broker
        .add(&f.alice, &json!({"type": "sync", "revision": "bad"}))
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Validation(_)));

    let err = f
        .broker
        .add(&f.alice, &json!({"type": "sync", "revision": "missing"}))
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Validation(_)));
}

#[test]
fn test_partial_sync_failure_still_cleans_up() {
    let f = fixture(3, 2, ApprovalConfig::default());
    f.sandbox
        .source
        .publish("r1", [("ops.hcl", "# ops"), ("dev.hcl", "# dev")]);
    f.sandbox.plane.fail_writes_to("dev");

    let id = f
        .broker
        .add(&f.alice, &json!({"type": "sync", "revision": "r1"}))
        .unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[1])
        .unwrap_err();

    match err {
        ApprovalError::Execution(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures.failures[0].resource, "dev");
            assert_eq!(failures.failures[0].message, "internal error");
        }
        other => panic!("expected execution error, got {other}"),
    }
    assert_eq!(f.sandbox.plane.policy("ops").as_deref(), Some("# ops"));
    assert_eq!(f.sandbox.plane.live_elevated_count(), 0);
    assert!(f.sandbox.store.is_empty());
    assert!(matches!(
        f.broker.get(&f.alice, id.as_str()),
        Err(ApprovalError::NotFound(_))
    ));
}

#[test]
fn test_invalid_share_keeps_progress_and_releases_lock() {
    let f = fixture(5, 3, ApprovalConfig::default());
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[1]).unwrap();

    let err = f.broker.approve(&f.bob, id.as_str(), "AAAA").unwrap_err();
    assert!(matches!(err, ApprovalError::Reconstruction(_)));
    assert!(!f.broker.locks().is_locked(id.as_str()));
    assert_eq!(f.sandbox.generator.cancel_count(), 1);
    assert!(!f.sandbox.generator.in_progress());
    assert_eq!(f.broker.get(&f.bob, id.as_str()).unwrap().progress, 2);

    let done = f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[2]).unwrap();
    assert_eq!(done.progress, 3);
    assert_eq!(f.sandbox.plane.policy("ops").as_deref(), Some("# ops"));
}

#[test]
fn test_duplicate_share_is_discarded() {
    let f = fixture(5, 3, ApprovalConfig::default());
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    // Shares are not deduplicated on arrival.
    let r = f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    assert_eq!(r.progress, 2);

    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[1])
        .unwrap_err();
    assert!(err.to_string().contains("duplicate share"));
    assert_eq!(f.broker.get(&f.bob, id.as_str()).unwrap().progress, 2);
    assert_eq!(f.sandbox.plane.write_count(), 0);

    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[2]).unwrap();
    assert_eq!(f.sandbox.plane.write_count(), 1);
}

#[test]
fn test_foreign_share_drops_newest() {
    let f = fixture(5, 3, ApprovalConfig::default());
    let other = Sandbox::new(5, 3).unwrap();
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[1]).unwrap();

    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &other.shares[2])
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Reconstruction(_)));
    assert_eq!(f.broker.get(&f.bob, id.as_str()).unwrap().progress, 2);

    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[2]).unwrap();
    assert_eq!(f.sandbox.plane.policy("ops").as_deref(), Some("# ops"));
}

#[test]
fn test_expired_shares_must_be_resubmitted() {
    let f = fixture(5, 3, ApprovalConfig::default());
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[1]).unwrap();
    f.sandbox.store.expire_envelopes();

    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[2])
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Reconstruction(_)));
    assert!(err.to_string().contains("resubmit"));
    assert_eq!(f.broker.get(&f.bob, id.as_str()).unwrap().progress, 1);
    assert_eq!(f.sandbox.generator.completion_count(), 0);

    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    let done = f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[1]).unwrap();
    assert_eq!(done.progress, 3);
}

#[test]
fn test_threshold_change_invalidates_request() {
    let f = fixture(5, 3, ApprovalConfig::default());
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();

    let new_shares = f.sandbox.generator.resplit(5, 2).unwrap();
    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &new_shares[0])
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Stale(_)));
    assert_eq!(f.sandbox.store.envelope_count(), 0);

    // Refiling captures the new threshold under a new identifier.
    f.broker.reject(&f.alice, id.as_str()).unwrap();
    let refiled = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    assert_ne!(refiled, id);
    f.broker.approve(&f.bob, refiled.as_str(), &new_shares[0]).unwrap();
    let done = f
        .broker
        .approve(&f.bob, refiled.as_str(), &new_shares[1])
        .unwrap();
    assert_eq!(done.required, 2);
}

#[test]
fn test_reject_removes_everything() {
    let f = fixture(5, 3, ApprovalConfig::default());
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[1]).unwrap();

    f.broker.reject(&f.bob, id.as_str()).unwrap();
    assert!(matches!(
        f.broker.get(&f.alice, id.as_str()),
        Err(ApprovalError::NotFound(_))
    ));
    assert!(f.sandbox.store.is_empty());
    assert_eq!(f.sandbox.plane.write_count(), 0);

    // Idempotent.
    f.broker.reject(&f.bob, id.as_str()).unwrap();
}

#[test]
fn test_reject_requires_read_access() {
    let f = fixture(3, 2, ApprovalConfig::default());
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    let mallory = f.sandbox.plane.add_user("mallory");
    f.sandbox.plane.hide_policy(&mallory, "ops");

    assert!(matches!(
        f.broker.reject(&mallory, id.as_str()),
        Err(ApprovalError::PermissionDenied(_))
    ));
    assert!(f.broker.get(&f.alice, id.as_str()).is_ok());
}

#[test]
fn test_held_lock_is_contention() {
    let f = fixture(3, 2, ApprovalConfig::default());
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();

    let guard = f.broker.locks().try_acquire(id.as_str()).unwrap();
    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[0])
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        f.broker.reject(&f.bob, id.as_str()),
        Err(ApprovalError::Contention(_))
    ));
    drop(guard);

    assert_eq!(
        f.broker
            .approve(&f.bob, id.as_str(), &f.sandbox.shares[0])
            .unwrap()
            .progress,
        1
    );
}

#[test]
fn test_token_issuance() {
    let f = fixture(5, 3, ApprovalConfig::default());
    f.sandbox.plane.add_role("ci");
    let body = json!({
        "type": "token",
        "create_request": {"policies": ["ops"], "ttl": "1h", "display_name": "ci"},
        "wrap_ttl": "120",
        "role": "ci",
    });

    let id = f.broker.add(&f.alice, &body).unwrap();
    let pending = f.broker.get(&f.alice, id.as_str()).unwrap();
    assert!(!pending.is_root_only());

    for share in &f.sandbox.shares[..2] {
        f.broker.approve(&f.bob, id.as_str(), share).unwrap();
    }
    let done = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[2])
        .unwrap();
    let issued = done.as_token().unwrap().issued.clone().unwrap();
    assert_eq!(issued.wrap_ttl_secs, 120);

    let specs = f.sandbox.plane.issued_specs();
    assert_eq!(specs.len(), 1);
    assert!(specs[0].request.no_parent);
    assert_eq!(specs[0].role.as_deref(), Some("ci"));
    assert!(!specs[0].orphan);

    let token = f
        .sandbox
        .plane
        .redeem_delivery(&issued.wrapping_token)
        .unwrap();
    let identity = f.sandbox.plane.who_am_i(&token).unwrap();
    assert_eq!(identity.policies, vec!["ops".to_string()]);
    assert_eq!(f.sandbox.plane.live_elevated_count(), 0);
    assert!(f.sandbox.store.is_empty());
}

#[test]
fn test_token_with_unknown_role() {
    let f = fixture(3, 2, ApprovalConfig::default());
    let body = json!({
        "type": "token",
        "create_request": {"policies": ["ops"]},
        "wrap_ttl": 60,
        "role": "ghost",
    });
    assert!(matches!(
        f.broker.add(&f.alice, &body),
        Err(ApprovalError::Validation(_))
    ));
}

fn stored_share_count(f: &Fixture, id: &RequestId) -> usize {
    QuorumLedger::new(f.sandbox.store.as_ref(), Duration::from_secs(60), 200)
        .load_shares(id)
        .unwrap()
        .len()
}

#[test]
fn test_early_bad_share_resets_progress_on_second_failure() {
    let f = fixture(5, 3, ApprovalConfig::default());
    let other = Sandbox::new(5, 3).unwrap();
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();

    // The bad share arrives first, so blaming the newest share is wrong.
    f.broker.approve(&f.bob, id.as_str(), &other.shares[4]).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[1])
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Reconstruction(_)));
    assert!(err.to_string().contains("most recent share was discarded"));
    assert_eq!(f.broker.get(&f.bob, id.as_str()).unwrap().progress, 2);

    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[2])
        .unwrap_err();
    assert!(err.to_string().contains("progress has been reset"));
    let reset = f.broker.get(&f.bob, id.as_str()).unwrap();
    assert_eq!(reset.progress, 0);
    assert!(!reset.newest_discarded);
    assert_eq!(stored_share_count(&f, &id), 0);
    assert_eq!(f.sandbox.store.envelope_count(), 0);

    for share in &f.sandbox.shares[2..4] {
        f.broker.approve(&f.bob, id.as_str(), share).unwrap();
    }
    let done = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[4])
        .unwrap();
    assert_eq!(done.progress, 3);
    assert_eq!(f.sandbox.plane.write_count(), 1);
    assert_eq!(f.sandbox.plane.policy("ops").as_deref(), Some("# ops"));
}

#[test]
fn test_foreign_share_in_taken_slot_is_not_called_duplicate() {
    let f = fixture(5, 2, ApprovalConfig::default());
    let other = Sandbox::new(5, 2).unwrap();
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();

    // Both shares claim the first key slot; neither can be blamed.
    f.broker.approve(&f.bob, id.as_str(), &other.shares[0]).unwrap();
    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[0])
        .unwrap_err();
    assert!(!err.to_string().contains("duplicate share"));
    assert_eq!(f.broker.get(&f.bob, id.as_str()).unwrap().progress, 1);

    f.broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[1])
        .unwrap_err();
    assert_eq!(f.broker.get(&f.bob, id.as_str()).unwrap().progress, 0);

    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[1]).unwrap();
    assert_eq!(f.sandbox.plane.write_count(), 1);
}

#[test]
fn test_zero_share_ttl_is_rejected_at_construction() {
    let sandbox = Sandbox::new(3, 2).unwrap();
    let config = ApprovalConfig::default().with_share_ttl(Duration::ZERO);
    assert!(matches!(
        sandbox.broker(config),
        Err(ApprovalError::Config(_))
    ));
}

#[test]
fn test_mint_failure_keeps_request_pending() {
    let f = fixture(5, 3, ApprovalConfig::default());
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[1]).unwrap();

    f.sandbox.plane.fail_next_mints(1);
    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[2])
        .unwrap_err();
    assert!(matches!(
        err,
        ApprovalError::Upstream {
            phase: Phase::Reconstruct,
            ..
        }
    ));
    assert_eq!(f.broker.get(&f.bob, id.as_str()).unwrap().progress, 3);
    assert_eq!(stored_share_count(&f, &id), 3);
    assert_eq!(f.sandbox.store.envelope_count(), 3);
    assert_eq!(f.sandbox.plane.write_count(), 0);
    assert_eq!(f.sandbox.plane.live_elevated_count(), 0);

    // Any further share completes with the resealed ones.
    let done = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[3])
        .unwrap();
    assert_eq!(done.progress, 3);
    assert_eq!(f.sandbox.plane.write_count(), 1);
    assert_eq!(f.sandbox.generator.completion_count(), 2);
    assert_eq!(f.sandbox.store.envelope_count(), 0);
}

#[test]
fn test_execution_error_wins_over_revoke_failure() {
    let f = fixture(3, 2, ApprovalConfig::default());
    f.sandbox.plane.fail_writes_to("ops");
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();

    f.sandbox.plane.fail_next_revokes(1);
    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[1])
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Execution(_)));
    // Request state is purged even though the credential survived.
    assert_eq!(f.sandbox.plane.live_elevated_count(), 1);
    assert!(matches!(
        f.broker.get(&f.bob, id.as_str()),
        Err(ApprovalError::NotFound(_))
    ));
    assert_eq!(f.sandbox.store.envelope_count(), 0);
}

#[test]
fn test_revoke_failure_after_execution_is_reported() {
    let f = fixture(3, 2, ApprovalConfig::default());
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();

    f.sandbox.plane.fail_next_revokes(1);
    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[1])
        .unwrap_err();
    assert!(matches!(
        err,
        ApprovalError::Upstream {
            phase: Phase::Cleanup,
            ..
        }
    ));
    assert_eq!(f.sandbox.plane.policy("ops").as_deref(), Some("# ops"));
    assert_eq!(f.sandbox.plane.live_elevated_count(), 1);
    assert!(matches!(
        f.broker.get(&f.bob, id.as_str()),
        Err(ApprovalError::NotFound(_))
    ));
    assert!(f.sandbox.store.is_empty());
}

#[test]
fn test_storage_failure_at_quorum_keeps_progress_and_shares_aligned() {
    let f = fixture(5, 3, ApprovalConfig::default());
    let other = Sandbox::new(5, 3).unwrap();
    let id = f.broker.add(&f.alice, &policy_body("ops", "# ops")).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[1]).unwrap();

    // The third share is sealed, then resealing after the failed ceremony fails.
    f.sandbox.store.fail_wraps_after(1);
    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &other.shares[2])
        .unwrap_err();
    assert!(matches!(err, ApprovalError::Storage(_)));
    assert_eq!(f.broker.get(&f.bob, id.as_str()).unwrap().progress, 3);
    assert_eq!(stored_share_count(&f, &id), 3);

    // The spent envelopes are detected and dropped on the next approval.
    f.sandbox.store.heal_wraps();
    let err = f
        .broker
        .approve(&f.bob, id.as_str(), &f.sandbox.shares[2])
        .unwrap_err();
    assert!(err.to_string().contains("resubmit"));
    assert_eq!(f.broker.get(&f.bob, id.as_str()).unwrap().progress, 1);
    assert_eq!(stored_share_count(&f, &id), 1);

    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[0]).unwrap();
    f.broker.approve(&f.bob, id.as_str(), &f.sandbox.shares[1]).unwrap();
    assert_eq!(f.sandbox.plane.write_count(), 1);
}
