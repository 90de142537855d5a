//! Concurrent writers against one store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;
use std::sync::Arc;

use ivf_vault_core::crypto::EncryptionKey;
use ivf_vault_core::kms::LocalKms;
use ivf_vault_core::store::SettingsStore;
use ivf_vault_core::token::TokenRequest;
use ivf_vault_core::{Vault, VaultOptions};
use ivf_vault_storage::{MemoryBackend, StorageBackend};

fn vault() -> Arc<Vault> {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let kms = Arc::new(LocalKms::new(SettingsStore::new(storage.clone()), EncryptionKey::generate()));
    Arc::new(Vault::new(storage, VaultOptions::new(kms)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_puts_allocate_every_version_once() {
    let v = vault();
    let writers = 12u32;

    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let v = v.clone();
            tokio::spawn(async move { v.secrets.put("lab/analyzer/key", &format!("value-{i}"), None, None).await })
        })
        .collect();

    let mut versions = BTreeSet::new();
    for handle in handles {
        let written = handle.await.unwrap().unwrap();
        assert!(versions.insert(written.version), "duplicate version {}", written.version);
    }
    assert_eq!(versions, (1..=writers).collect::<BTreeSet<_>>());

    let latest = v.secrets.get("lab/analyzer/key", None).await.unwrap();
    assert_eq!(latest.version, writers);
    for version in 1..=writers {
        v.secrets.get("lab/analyzer/key", Some(version)).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cold_start_writers_share_one_kek() {
    let v = vault();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let v = v.clone();
            tokio::spawn(async move {
                let path = format!("cold/{i}");
                v.secrets.put(&path, "plain", None, None).await.map(|_| path)
            })
        })
        .collect();

    let mut paths = Vec::new();
    for handle in handles {
        paths.push(handle.await.unwrap().unwrap());
    }
    for path in paths {
        assert_eq!(v.secrets.get(&path, None).await.unwrap().value, "plain");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_validations_never_exceed_max_uses() {
    let v = vault();
    let issued = v
        .tokens
        .create(
            TokenRequest {
                max_uses: 5,
                ..TokenRequest::default()
            },
            None,
        )
        .await
        .unwrap();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let v = v.clone();
            let raw = issued.token.clone();
            tokio::spawn(async move { v.tokens.validate(&raw).await.unwrap().is_some() })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 5);
}
