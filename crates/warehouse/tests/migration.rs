// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

mod common;

use anyhow::Result;
use common::{Harness, document, documents, payload};
use futures::TryStreamExt;
use std::sync::{Arc, Mutex};
use warehouse::index::CATALOG_NAMESPACE;
use warehouse::{
    BackendError, FieldType, Fetch, Fingerprint, MigrationPlan, OpContext, ParsedDeclaration,
    Record, SourceDeclaration, StorageKey, UpsertOutcome, Value, WarehouseError, WithPayload,
};

fn documents_v2() -> SourceDeclaration {
    documents()
        .field("extension", FieldType::Str)
        .required("extension")
}

fn add_extension(mut record: Record) -> Result<Record, String> {
    let extension = record
        .get("filename")
        .and_then(Value::as_str)
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_string())
        .ok_or_else(|| "filename has no extension".to_string())?;
    record.insert("extension", extension);
    Ok(record)
}

/// Six documents, two of which share a payload, and a second source version
async fn seeded() -> Result<Harness> {
    let h = Harness::with_documents().await?;
    let shared = payload(700, 1);
    let docs = [
        ("http://a", "a.csv", shared.clone()),
        ("http://b", "b.pdf", payload(5000, 2)),
        ("http://c", "c.txt", shared),
        ("http://d", "d.csv", payload(10, 3)),
        ("http://e", "e.json", payload(20, 4)),
        ("http://f", "f.csv", payload(30, 5)),
    ];
    for (url, filename, body) in docs {
        h.warehouse
            .store(&h.ctx, "documents", document(url, filename, body))
            .await?;
    }
    let registration = h.warehouse.register_source("documents", &documents_v2()).await?;
    assert_eq!(registration.version, 2);
    assert!(!registration.active);
    Ok(h)
}

async fn snapshot(h: &Harness) -> Result<Vec<(StorageKey, u32, Record, Option<Fingerprint>)>> {
    let entries: Vec<_> = h
        .warehouse
        .query_prefix(&h.ctx, "documents", vec![], Fetch::MetadataOnly)
        .try_collect()
        .await?;
    Ok(entries
        .into_iter()
        .map(|s| (s.key, s.schema_version, s.record, s.fingerprint))
        .collect())
}

#[tokio::test]
async fn test_interrupted_migration_matches_uninterrupted_run() -> Result<()> {
    let straight = seeded().await?;
    let before = snapshot(&straight).await?;
    let report = straight
        .warehouse
        .migrate(&straight.ctx, "documents", &MigrationPlan::source(1, 2), &add_extension)
        .await?;
    assert_eq!(report.processed, 6);
    assert_eq!(report.migrated, 6);
    assert!(report.failures.is_empty());
    assert!(report.promoted);
    let expected = snapshot(&straight).await?;

    let resumed = seeded().await?;
    let mut processed = 0;
    for _ in 0..2 {
        let partial = resumed
            .warehouse
            .migrate(
                &resumed.ctx,
                "documents",
                &MigrationPlan::source(1, 2).with_limit(2),
                &add_extension,
            )
            .await?;
        assert!(!partial.complete);
        assert!(!partial.promoted);
        processed += partial.processed;
    }
    // readers still see the old version until the migration finishes
    assert_eq!(snapshot(&resumed).await?.len(), 6);
    assert!(snapshot(&resumed).await?.iter().all(|(_, version, _, _)| *version == 1));

    let last = resumed
        .warehouse
        .migrate(&resumed.ctx, "documents", &MigrationPlan::source(1, 2), &add_extension)
        .await?;
    assert!(last.resumed_from.is_some());
    assert!(last.promoted);
    processed += last.processed;
    assert_eq!(processed, 6);

    assert_eq!(snapshot(&resumed).await?, expected);
    assert_eq!(expected.len(), before.len());
    for ((key, version, record, fingerprint), (old_key, _, old_record, old_fingerprint)) in
        expected.iter().zip(&before)
    {
        assert_eq!(key, old_key);
        assert_eq!(*version, 2);
        assert_eq!(fingerprint, old_fingerprint);
        assert_eq!(record.get("filename"), old_record.get("filename"));
        assert!(record.contains("extension"));
    }
    Ok(())
}

#[tokio::test]
async fn test_failed_entries_do_not_stop_the_run() -> Result<()> {
    let h = Harness::with_documents().await?;
    h.warehouse
        .store(&h.ctx, "documents", document("http://a", "a.csv", &b"a"[..]))
        .await?;
    h.warehouse
        .store(&h.ctx, "documents", document("http://b", "README", &b"b"[..]))
        .await?;
    h.warehouse.register_source("documents", &documents_v2()).await?;

    let report = h
        .warehouse
        .migrate(&h.ctx, "documents", &MigrationPlan::source(1, 2), &add_extension)
        .await?;
    assert_eq!(report.migrated, 1);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(
        &report.failures[0],
        WarehouseError::MigrationEntryFailed { reason, .. } if reason.contains("no extension")
    ));
    assert!(!report.promoted);
    assert_eq!(
        h.warehouse.catalog().active_source_schema("documents").await?.version(),
        1
    );

    // fix the bad entry under the old version, then re-run
    h.warehouse
        .store(&h.ctx, "documents", document("http://b", "README.md", &b"b"[..]))
        .await?;
    let rerun = h
        .warehouse
        .migrate(&h.ctx, "documents", &MigrationPlan::source(1, 2), &add_extension)
        .await?;
    assert!(rerun.failures.is_empty());
    assert_eq!(rerun.migrated, 1);
    assert!(rerun.promoted);
    Ok(())
}

#[tokio::test]
async fn test_unavailable_backend_aborts_and_resumes() -> Result<()> {
    let h = seeded().await?;
    h.warehouse
        .migrate(
            &h.ctx,
            "documents",
            &MigrationPlan::source(1, 2).with_limit(3),
            &add_extension,
        )
        .await?;

    h.index.set_available(false);
    let aborted = h
        .warehouse
        .migrate(&h.ctx, "documents", &MigrationPlan::source(1, 2), &add_extension)
        .await;
    assert!(matches!(
        aborted,
        Err(WarehouseError::Backend(BackendError::Unavailable(_)))
    ));

    h.index.set_available(true);
    let report = h
        .warehouse
        .migrate(&h.ctx, "documents", &MigrationPlan::source(1, 2), &add_extension)
        .await?;
    assert!(report.resumed_from.is_some());
    assert_eq!(report.processed, 3);
    assert!(report.promoted);
    Ok(())
}

#[tokio::test]
async fn test_writes_during_migration_are_caught_up() -> Result<()> {
    let h = seeded().await?;
    h.warehouse
        .migrate(
            &h.ctx,
            "documents",
            &MigrationPlan::source(1, 2).with_limit(2),
            &add_extension,
        )
        .await?;

    // http://a was already migrated; a live writer changes it under v1
    h.warehouse
        .store(&h.ctx, "documents", document("http://a", "a.tsv", payload(700, 1)))
        .await?;

    let report = h
        .warehouse
        .migrate(&h.ctx, "documents", &MigrationPlan::source(1, 2), &add_extension)
        .await?;
    assert!(report.promoted);
    assert_eq!(report.processed, 5);

    let a = h
        .warehouse
        .get(&h.ctx, "documents", &[Value::from("http://a")], Fetch::MetadataOnly)
        .await?
        .expect("entry exists");
    assert_eq!(a.schema_version, 2);
    assert_eq!(a.record.get("extension"), Some(&Value::from("tsv")));
    Ok(())
}

#[tokio::test]
async fn test_payload_rewriting_migration() -> Result<()> {
    let h = Harness::with_documents().await?;
    let original = h
        .warehouse
        .store(&h.ctx, "documents", document("http://a", "a.txt", &b"hello"[..]))
        .await?;
    h.warehouse.register_source("documents", &documents_v2()).await?;

    let upper = WithPayload(|mut record: Record| -> Result<Record, String> {
        let body = record.take_payload().ok_or_else(|| "no payload".to_string())?;
        record.set_payload(Some(body.to_ascii_uppercase().into()));
        add_extension(record)
    });
    let report = h
        .warehouse
        .migrate(&h.ctx, "documents", &MigrationPlan::source(1, 2), &upper)
        .await?;
    assert!(report.promoted);

    let migrated = h
        .warehouse
        .get(&h.ctx, "documents", &[Value::from("http://a")], Fetch::WithPayload)
        .await?
        .expect("entry exists");
    assert_eq!(migrated.record.payload().map(|p| p.to_vec()), Some(b"HELLO".to_vec()));
    assert_eq!(migrated.fingerprint, Some(Fingerprint::of(b"HELLO")));
    assert_ne!(migrated.fingerprint, original.fingerprint);
    // the old blob is untouched
    assert_eq!(h.blobs.object_count().await, 2);
    Ok(())
}

#[tokio::test]
async fn test_parsed_layer_migration() -> Result<()> {
    let h = Harness::with_documents().await?;
    let source = h
        .warehouse
        .store(&h.ctx, "documents", document("http://a", "a.csv", &b"x\n1\n2\n"[..]))
        .await?;

    let v1 = ParsedDeclaration::new("csv", ["row"], chrono_tz::Tz::UTC).field("row", FieldType::Int);
    let v2 = v1.clone().field("x", FieldType::Int);
    h.warehouse.register_parser("documents", &v1, false).await?;
    for row in [1i64, 2] {
        h.warehouse
            .store_parsed(&h.ctx, "documents", None, &source.key, Record::new().with("row", row))
            .await?;
    }
    let second = h.warehouse.register_parser("documents", &v2, false).await?;
    assert_eq!(second.version, 2);

    let fill = |mut record: Record| -> Result<Record, String> {
        let row = record.get("row").cloned().ok_or_else(|| "no row".to_string())?;
        record.insert("x", row);
        Ok(record)
    };
    let report = h
        .warehouse
        .migrate_parsed(&h.ctx, "documents", "csv", 1, 2, &fill)
        .await?;
    assert_eq!(report.migrated, 2);
    assert!(report.promoted);

    let row = h
        .warehouse
        .get_parsed(&h.ctx, "documents", None, &[Value::Int(2)], Fetch::MetadataOnly)
        .await?
        .expect("row exists");
    assert_eq!(row.schema_version, 2);
    assert_eq!(row.record.get("x"), Some(&Value::Int(2)));
    assert_eq!(row.source_key, Some(source.key));
    Ok(())
}

#[tokio::test]
async fn test_store_racing_promotion_reaches_new_version() -> Result<()> {
    let (h, hooks) = Harness::with_hooks().await?;
    h.warehouse
        .store(&h.ctx, "documents", document("http://x", "a.csv", payload(10, 1)))
        .await?;
    h.warehouse.register_source("documents", &documents_v2()).await?;

    // the next catalog write is the promotion; a store lands in v1 just before it
    let late = Arc::new(Mutex::new(None));
    {
        let warehouse = h.warehouse.clone();
        let late = late.clone();
        hooks.before_next_write(CATALOG_NAMESPACE, move || {
            Box::pin(async move {
                let stored = warehouse
                    .store(
                        &OpContext::new(),
                        "documents",
                        document("http://x", "late.csv", payload(10, 1)),
                    )
                    .await;
                *late.lock().unwrap() = Some(stored.map(|receipt| receipt.outcome));
            })
        });
    }

    let report = h
        .warehouse
        .migrate(&h.ctx, "documents", &MigrationPlan::source(1, 2), &add_extension)
        .await?;
    assert!(report.promoted);
    assert!(report.failures.is_empty());
    let late = late.lock().unwrap().take().expect("hook ran");
    assert!(matches!(late, Ok(UpsertOutcome::MetadataUpdated)));

    let x = h
        .warehouse
        .get(&h.ctx, "documents", &[Value::from("http://x")], Fetch::MetadataOnly)
        .await?
        .expect("entry exists");
    assert_eq!(x.schema_version, 2);
    assert_eq!(x.record.get("filename"), Some(&Value::from("late.csv")));
    Ok(())
}

#[tokio::test]
async fn test_store_landing_after_promotion_is_not_acknowledged() -> Result<()> {
    let (h, hooks) = Harness::with_hooks().await?;
    h.warehouse
        .store(&h.ctx, "documents", document("http://x", "a.csv", payload(10, 1)))
        .await?;
    h.warehouse.register_source("documents", &documents_v2()).await?;

    // the whole migration runs between the store's catalog read and its v1 write
    {
        let warehouse = h.warehouse.clone();
        hooks.before_next_write("documents/source/v1", move || {
            Box::pin(async move {
                let transform = add_extension;
                let report = warehouse
                    .migrate(
                        &OpContext::new(),
                        "documents",
                        &MigrationPlan::source(1, 2),
                        &transform,
                    )
                    .await;
                assert!(report.is_ok_and(|r| r.promoted));
            })
        });
    }
    let err = h
        .warehouse
        .store(&h.ctx, "documents", document("http://x", "late.csv", payload(10, 1)))
        .await
        .expect_err("write landed in a superseded version");
    assert!(matches!(
        &err,
        WarehouseError::VersionSuperseded { active: 2, .. }
    ));
    assert!(err.is_retryable());

    // retrying writes the promoted version directly
    let mut retried = document("http://x", "late.csv", payload(10, 1));
    retried.insert("extension", "csv");
    h.warehouse.store(&h.ctx, "documents", retried).await?;

    // another migration run never replaces a direct write with a migrated one
    let rerun = h
        .warehouse
        .migrate(&h.ctx, "documents", &MigrationPlan::source(1, 2), &add_extension)
        .await?;
    assert!(rerun.failures.is_empty());
    assert_eq!(rerun.migrated, 0);

    let x = h
        .warehouse
        .get(&h.ctx, "documents", &[Value::from("http://x")], Fetch::MetadataOnly)
        .await?
        .expect("entry exists");
    assert_eq!(x.schema_version, 2);
    assert_eq!(x.record.get("filename"), Some(&Value::from("late.csv")));
    Ok(())
}
