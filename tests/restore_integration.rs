//! End-to-end tests driving mutation, history, time travel and restore
//! through the public engine handle.

use chrono::{DateTime, Utc};
use rewind::{
    document, ActorContext, AuditAction, Document, EntityDescriptor, EntityHandle, Reconstruction,
    RestoreScope, RestoreStatus, Rewind, RewindConfig, TenantId,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn engine() -> Rewind {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let engine = Rewind::new(RewindConfig::default()).unwrap();
    engine
        .register_entity(EntityDescriptor::new("requirements", "organization_id"))
        .await;
    engine
}

fn ctx() -> ActorContext {
    ActorContext::new("u1", "alice@acme.test").with_tenant(TenantId::new("acme"))
}

fn handle(id: &str) -> EntityHandle {
    EntityHandle::new(TenantId::new("acme"), "requirements", id.into())
}

fn row(id: &str, name: &str) -> Document {
    document(&[
        ("id", json!(id)),
        ("organization_id", json!("acme")),
        ("name", json!(name)),
        ("status", json!("draft")),
    ])
}

/// Real-clock timestamps need separating; audit ordering is sub-millisecond
/// but reconstruction points must fall strictly between mutations.
async fn tick() -> DateTime<Utc> {
    tokio::time::sleep(Duration::from_millis(5)).await;
    let t = Utc::now();
    tokio::time::sleep(Duration::from_millis(5)).await;
    t
}

#[tokio::test]
async fn insert_update_delete_reconstructs_each_era() {
    let engine = engine().await;

    engine.data().insert("requirements", row("r1", "Acme"), &ctx()).await.unwrap();
    let t1_5 = tick().await;
    engine
        .data()
        .update("requirements", row("r1", "Acme Corp"), &ctx())
        .await
        .unwrap();
    let t2_5 = tick().await;
    engine
        .data()
        .delete("requirements", "r1".into(), &ctx())
        .await
        .unwrap();
    let t3_5 = tick().await;

    let h = handle("r1");
    let at_1 = engine.reconstruct(&h, t1_5).await.unwrap();
    assert_eq!(at_1.document().unwrap().get("name"), Some(&json!("Acme")));

    let at_2 = engine.reconstruct(&h, t2_5).await.unwrap();
    assert_eq!(
        at_2.document().unwrap().get("name"),
        Some(&json!("Acme Corp"))
    );

    assert_eq!(
        engine.reconstruct(&h, t3_5).await.unwrap(),
        Reconstruction::NotExisted
    );

    let page = engine.get_history(&h, None, None, 0).await.unwrap();
    let actions: Vec<AuditAction> = page.records.iter().map(|r| r.action).collect();
    assert_eq!(
        actions,
        vec![AuditAction::Insert, AuditAction::Update, AuditAction::Delete]
    );
}

#[tokio::test]
async fn history_is_idempotent_and_order_stable() {
    let engine = engine().await;
    engine.data().insert("requirements", row("r1", "Acme"), &ctx()).await.unwrap();
    engine
        .data()
        .update("requirements", row("r1", "Acme Corp"), &ctx())
        .await
        .unwrap();

    let h = handle("r1");
    let first = engine.get_history(&h, None, None, 0).await.unwrap();
    let second = engine.get_history(&h, None, None, 0).await.unwrap();

    let ids_a: Vec<&str> = first.records.iter().map(|r| r.id.as_str()).collect();
    let ids_b: Vec<&str> = second.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids_a, ids_b);
    assert_eq!(first.total, second.total);
}

#[tokio::test]
async fn record_restore_rewinds_and_audits() {
    let engine = engine().await;
    engine.data().insert("requirements", row("r1", "Acme"), &ctx()).await.unwrap();
    let point = tick().await;
    engine
        .data()
        .update("requirements", row("r1", "Mangled"), &ctx())
        .await
        .unwrap();

    let h = handle("r1");
    let expected = engine.reconstruct(&h, point).await.unwrap();

    let op = engine
        .request_restore(
            RestoreScope::Record {
                entity_type: "requirements".into(),
                entity_id: "r1".into(),
            },
            point,
            "undo bad edit",
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(op.status, RestoreStatus::Completed);
    assert_eq!(op.target_results.len(), 1);
    assert!(op.target_results[0].audit_record_id.is_some());

    // The live row now equals the reconstruction taken before the restore
    let now = engine.reconstruct(&h, Utc::now()).await.unwrap();
    assert_eq!(now, expected);

    // The restore itself left a record with the rollback payload
    let page = engine.get_history(&h, None, None, 0).await.unwrap();
    let last = page.records.last().unwrap();
    assert_eq!(last.action, AuditAction::Restore);
    assert_eq!(
        last.old_state.as_ref().unwrap().get("name"),
        Some(&json!("Mangled"))
    );
}

#[tokio::test]
async fn restore_round_trip_returns_pre_restore_state() {
    let engine = engine().await;
    engine.data().insert("requirements", row("r1", "Acme"), &ctx()).await.unwrap();
    let early = tick().await;
    engine
        .data()
        .update("requirements", row("r1", "Mangled"), &ctx())
        .await
        .unwrap();
    let pre_restore = tick().await;

    let record_scope = || RestoreScope::Record {
        entity_type: "requirements".into(),
        entity_id: "r1".into(),
    };

    engine
        .request_restore(record_scope(), early, "rewind", &ctx())
        .await
        .unwrap();
    let h = handle("r1");
    assert_eq!(
        engine.data().get(&h).await.unwrap().unwrap().get("name"),
        Some(&json!("Acme"))
    );

    // Restoring to just before the first restore undoes it exactly
    engine
        .request_restore(record_scope(), pre_restore, "undo the restore", &ctx())
        .await
        .unwrap();
    assert_eq!(
        engine.data().get(&h).await.unwrap().unwrap().get("name"),
        Some(&json!("Mangled"))
    );
}

#[tokio::test]
async fn restore_of_absent_entity_still_audits() {
    let engine = engine().await;
    let t0 = tick().await;
    engine.data().insert("requirements", row("r1", "Acme"), &ctx()).await.unwrap();
    engine
        .data()
        .delete("requirements", "r1".into(), &ctx())
        .await
        .unwrap();

    // The row is already gone and did not exist at t0: nothing to apply,
    // but the completed operation must still carry a restore record.
    let op = engine
        .request_restore(
            RestoreScope::Record {
                entity_type: "requirements".into(),
                entity_id: "r1".into(),
            },
            t0,
            "wipe to before creation",
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(op.status, RestoreStatus::Completed);
    assert!(op.target_results[0].audit_record_id.is_some());

    let page = engine.get_history(&handle("r1"), None, None, 0).await.unwrap();
    let last = page.records.last().unwrap();
    assert_eq!(last.action, AuditAction::Restore);
    assert!(last.old_state.is_none());
    assert!(last.new_state.is_none());

    assert_eq!(
        engine.reconstruct(&handle("r1"), Utc::now()).await.unwrap(),
        Reconstruction::NotExisted
    );
}

#[tokio::test]
async fn session_restore_covers_touched_entities() {
    let engine = engine().await;

    let session_ctx = ctx().with_session("s1");
    engine.start_session(&session_ctx).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    engine
        .data()
        .insert("requirements", row("r1", "Acme"), &session_ctx)
        .await
        .unwrap();
    engine
        .data()
        .insert("requirements", row("r2", "Globex"), &session_ctx)
        .await
        .unwrap();

    let op = engine
        .request_restore(
            RestoreScope::Session {
                session_id: "s1".into(),
            },
            Utc::now(), // overridden to the session start at execution
            "roll back compromised session",
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(op.status, RestoreStatus::PendingApproval);

    let done = engine.approve_restore(&op.id, "admin").await.unwrap();
    assert_eq!(done.status, RestoreStatus::Completed);
    assert_eq!(
        done.affected_entity_ids,
        vec!["r1".into(), "r2".into()]
    );

    // Both rows predate nothing: they did not exist at session start
    assert!(engine.data().get(&handle("r1")).await.unwrap().is_none());
    assert!(engine.data().get(&handle("r2")).await.unwrap().is_none());
    assert_eq!(
        engine.reconstruct(&handle("r1"), Utc::now()).await.unwrap(),
        Reconstruction::NotExisted
    );
}

#[tokio::test]
async fn field_restore_leaves_other_fields_current() {
    let engine = engine().await;
    engine.data().insert("requirements", row("r1", "Acme"), &ctx()).await.unwrap();
    let point = tick().await;

    let mut changed = row("r1", "Mangled");
    changed.insert("status".into(), json!("approved"));
    engine.data().update("requirements", changed, &ctx()).await.unwrap();

    let op = engine
        .request_restore(
            RestoreScope::Field {
                entity_type: "requirements".into(),
                entity_id: "r1".into(),
                fields: vec!["name".into()],
            },
            point,
            "only the name was wrong",
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(op.status, RestoreStatus::Completed);

    let live = engine.data().get(&handle("r1")).await.unwrap().unwrap();
    assert_eq!(live.get("name"), Some(&json!("Acme")));
    // Untouched fields keep their current values
    assert_eq!(live.get("status"), Some(&json!("approved")));
}

#[tokio::test]
async fn bulk_restore_partial_failure_keeps_applied_targets() {
    let engine = engine().await;
    engine.data().insert("requirements", row("r1", "Acme"), &ctx()).await.unwrap();
    let point = tick().await;
    engine
        .data()
        .update("requirements", row("r1", "Mangled"), &ctx())
        .await
        .unwrap();

    // "ghost" has no history at all: its reconstruction is Unknown
    let op = engine
        .request_restore(
            RestoreScope::Bulk {
                entity_types: vec!["requirements".into()],
                entity_ids: vec!["ghost".into(), "r1".into()],
            },
            point,
            "mass rollback",
            &ctx(),
        )
        .await
        .unwrap();
    let done = engine.approve_restore(&op.id, "admin").await.unwrap();

    assert_eq!(done.status, RestoreStatus::Failed);
    assert_eq!(done.target_results.len(), 2);

    let by_id = |id: &str| {
        done.target_results
            .iter()
            .find(|r| r.handle.entity_id == id.into())
            .unwrap()
    };
    assert!(by_id("r1").outcome.is_some());
    assert!(by_id("ghost").error.is_some());

    // The applied target stays applied
    assert_eq!(
        engine.data().get(&handle("r1")).await.unwrap().unwrap().get("name"),
        Some(&json!("Acme"))
    );
}

#[tokio::test]
async fn cancelled_restore_skips_remaining_targets() {
    let engine = engine().await;
    engine.data().insert("requirements", row("r1", "Acme"), &ctx()).await.unwrap();
    engine.data().insert("requirements", row("r2", "Globex"), &ctx()).await.unwrap();
    let point = tick().await;

    let op = engine
        .request_restore(
            RestoreScope::Bulk {
                entity_types: vec!["requirements".into()],
                entity_ids: vec![],
            },
            point,
            "mass rollback",
            &ctx(),
        )
        .await
        .unwrap();

    // Cancel while still pending: every target is skipped at execution
    engine.cancel_restore(&op.id).await.unwrap();
    let done = engine.approve_restore(&op.id, "admin").await.unwrap();

    assert_eq!(done.status, RestoreStatus::Failed);
    assert!(done.target_results.iter().all(|r| r.skipped));
    assert!(done.changes_summary.starts_with("cancelled"));

    // Nothing was touched
    assert_eq!(
        engine.data().get(&handle("r1")).await.unwrap().unwrap().get("name"),
        Some(&json!("Acme"))
    );
}

#[tokio::test]
async fn rejected_restore_never_executes() {
    let engine = engine().await;
    engine.data().insert("requirements", row("r1", "Acme"), &ctx()).await.unwrap();

    let op = engine
        .request_restore(
            RestoreScope::TimePoint {
                entity_type: "requirements".into(),
            },
            Utc::now(),
            "rewind everything",
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(op.status, RestoreStatus::PendingApproval);

    let rejected = engine
        .reject_restore(&op.id, "admin", "scope too broad")
        .await
        .unwrap();
    assert_eq!(rejected.status, RestoreStatus::Rejected);

    // Terminal: approval is no longer a legal transition
    assert!(engine.approve_restore(&op.id, "admin").await.is_err());

    // No restore record was written
    let page = engine.get_history(&handle("r1"), None, None, 0).await.unwrap();
    assert!(page.records.iter().all(|r| r.action != AuditAction::Restore));
}

#[tokio::test]
async fn completed_restore_records_pre_restore_snapshot() {
    let engine = engine().await;
    engine.data().insert("requirements", row("r1", "Acme"), &ctx()).await.unwrap();
    let point = tick().await;
    engine
        .data()
        .update("requirements", row("r1", "Mangled"), &ctx())
        .await
        .unwrap();

    let op = engine
        .request_restore(
            RestoreScope::Record {
                entity_type: "requirements".into(),
                entity_id: "r1".into(),
            },
            point,
            "undo",
            &ctx(),
        )
        .await
        .unwrap();

    let snapshot_id = op.snapshot_id.unwrap();
    let snapshot = engine.backups().get(&snapshot_id).await.unwrap();
    assert_eq!(snapshot.kind, rewind::BackupKind::PreRestore);
    assert_eq!(snapshot.status, rewind::BackupStatus::Completed);
    assert_eq!(snapshot.record_count, 1);
    assert!(snapshot.checksum.is_some());
}

#[tokio::test]
async fn concurrent_record_restores_serialize() {
    let engine = Arc::new(engine().await);
    engine.data().insert("requirements", row("r1", "Acme"), &ctx()).await.unwrap();
    let early = tick().await;
    engine
        .data()
        .update("requirements", row("r1", "Acme Corp"), &ctx())
        .await
        .unwrap();
    let late = tick().await;

    let record_scope = || RestoreScope::Record {
        entity_type: "requirements".into(),
        entity_id: "r1".into(),
    };

    let a = {
        let engine = engine.clone();
        let scope = record_scope();
        tokio::spawn(
            async move { engine.request_restore(scope, early, "to v1", &ctx()).await },
        )
    };
    let b = {
        let engine = engine.clone();
        let scope = record_scope();
        tokio::spawn(
            async move { engine.request_restore(scope, late, "to v2", &ctx()).await },
        )
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    // Exactly one ordering is observable: the live row equals the
    // post-image of whichever restore record landed last.
    let page = engine.get_history(&handle("r1"), None, None, 0).await.unwrap();
    let restores: Vec<_> = page
        .records
        .iter()
        .filter(|r| r.action == AuditAction::Restore)
        .collect();
    assert_eq!(restores.len(), 2);

    let live = engine.data().get(&handle("r1")).await.unwrap().unwrap();
    assert_eq!(
        Some(&live),
        restores.last().unwrap().new_state.as_ref()
    );
}
