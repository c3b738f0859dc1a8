// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

mod common;

use anyhow::Result;
use common::{Harness, document, payload};
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use tempfile::TempDir;
use warehouse::{DatasetRegistration, ExportedEntry, Fingerprint, Value};

#[tokio::test]
async fn test_export_to_local_directory() -> Result<()> {
    let h = Harness::with_documents().await?;
    let shared = payload(6000, 1);
    for (url, filename, body) in [
        ("http://a", "a.csv", shared.clone()),
        ("http://b", "b.csv", shared.clone()),
        ("http://c", "c.txt", payload(50, 2)),
    ] {
        h.warehouse
            .store(&h.ctx, "documents", document(url, filename, body))
            .await?;
    }

    let dir = TempDir::new()?;
    let dest = LocalFileSystem::new_with_prefix(dir.path())?;
    let report = h
        .warehouse
        .export(&h.ctx, "documents", &dest, Some("backup"))
        .await?;
    assert_eq!(report.schema_version, 1);
    assert_eq!(report.entries, 3);
    assert_eq!(report.payloads, 2);
    assert_eq!(report.bytes, 6050);

    let root = dir.path().join("backup").join("documents");
    let registration: DatasetRegistration =
        serde_json::from_slice(&std::fs::read(root.join("registration.json"))?)?;
    assert_eq!(registration.dataset, "documents");

    let entries = std::fs::read_dir(root.join("entries"))?.count();
    assert_eq!(entries, 3);
    let shared_fp = Fingerprint::of(&shared);
    assert_eq!(std::fs::read(root.join("blobs").join(shared_fp.as_str()))?, shared);
    Ok(())
}

#[tokio::test]
async fn test_exported_entries_carry_metadata_and_fingerprint() -> Result<()> {
    let h = Harness::with_documents().await?;
    let receipt = h
        .warehouse
        .store(&h.ctx, "documents", document("http://a", "a.csv", &b"x,y\n1,2\n"[..]))
        .await?;
    h.warehouse
        .update_metadata(
            &h.ctx,
            "documents",
            &[Value::from("http://a")],
            warehouse::Record::new().with("filename", "renamed.csv"),
        )
        .await?;

    let dest = InMemory::new();
    let report = h.warehouse.export(&h.ctx, "documents", &dest, None).await?;
    assert_eq!(report.entries, 1);

    let path = Path::from(format!("documents/entries/{}.json", receipt.key));
    let body = dest.get(&path).await?.bytes().await?;
    let exported: ExportedEntry = serde_json::from_slice(&body)?;
    assert_eq!(exported.key, receipt.key);
    assert_eq!(exported.fingerprint, receipt.fingerprint);
    assert_eq!(exported.size, Some(8));
    assert_eq!(exported.metadata["filename"], "renamed.csv");
    Ok(())
}

#[tokio::test]
async fn test_export_of_unknown_dataset_fails() -> Result<()> {
    let h = Harness::new().await?;
    let result = h
        .warehouse
        .export(&h.ctx, "missing", &InMemory::new(), None)
        .await;
    assert!(matches!(result, Err(warehouse::WarehouseError::UnknownDataset(_))));
    Ok(())
}
