//! End-to-end pulls against the in-memory registry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use oci_client::Reference;
use tokio_util::sync::CancellationToken;

use lazypull::content::{ContentStore, read_all, read_blob};
use lazypull::images::Descriptor;
use lazypull::{LazypullError, MemoryStore, Platform, PullOptions, Puller};
use lazypull_shared::constants::annotations::UNCOMPRESSED;
use lazypull_shared::constants::media_types::{DOCKER_CONFIG, DOCKER_MANIFEST, OCI_INDEX};
use lazypull_test_utils::{
    Blob, FakeRegistry, Image, ImageBuilder, Schema1Builder, index, seed_store,
};

fn reference(name: &str) -> Reference {
    name.parse().unwrap()
}

fn amd64() -> Platform {
    Platform::new("linux", "amd64")
}

fn puller(store: &Arc<MemoryStore>, registry: &FakeRegistry, src: Reference) -> Arc<Puller> {
    Arc::new(Puller::new(
        store.clone(),
        Arc::new(registry.clone()),
        src,
        amd64(),
    ))
}

fn digests(descs: &[Descriptor]) -> BTreeSet<String> {
    descs.iter().map(|d| d.digest.clone()).collect()
}

fn uncompressed(descs: &[Descriptor]) -> Vec<String> {
    descs
        .iter()
        .map(|d| d.annotation(UNCOMPRESSED).unwrap_or_default().to_string())
        .collect()
}

fn two_platform_image() -> (Image, Image, Image) {
    let amd = ImageBuilder::new("linux", "amd64")
        .layer(b"amd64 base layer")
        .layer(b"amd64 app layer")
        .build();
    let arm = ImageBuilder::new("linux", "arm64")
        .layer(b"arm64 base layer")
        .build();
    let idx = index(&[amd.clone(), arm.clone()]);
    (idx, amd, arm)
}

#[tokio::test]
async fn test_index_pull_selects_platform_and_skips_layers() {
    let (idx, amd, arm) = two_platform_image();
    let src = reference("docker.io/library/alpine:3");
    let registry = FakeRegistry::new();
    registry.push(&src.whole(), &idx);
    let store = Arc::new(MemoryStore::new());

    let pulled = puller(&store, &registry, src)
        .pull_manifests(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(pulled.reference, "docker.io/library/alpine:3");
    assert_eq!(pulled.main_manifest.digest, idx.root.desc.digest);
    let amd_config = amd.config.as_ref().unwrap();
    assert_eq!(pulled.config.digest, amd_config.desc.digest);

    let expected: BTreeSet<String> = [
        idx.root.desc.digest.clone(),
        amd.root.desc.digest.clone(),
        amd_config.desc.digest.clone(),
    ]
    .into_iter()
    .collect();
    assert_eq!(digests(&pulled.nonlayers), expected);

    let layer_digests: Vec<String> = pulled.remote.descriptors.iter().map(|d| d.digest.clone()).collect();
    assert_eq!(layer_digests, amd.layer_digests());
    assert_eq!(uncompressed(&pulled.remote.descriptors), amd.diff_ids);

    // Metadata is stored, the other platform and every layer are not.
    for digest in &expected {
        assert!(store.contains(digest), "{digest} should be stored");
    }
    assert!(!store.contains(&arm.root.desc.digest));
    let fetched = registry.fetched();
    for layer in amd.layers.iter().chain(&arm.layers) {
        assert!(!store.contains(&layer.desc.digest));
        assert!(!fetched.contains(&layer.desc.digest), "layer was fetched");
    }
}

#[tokio::test]
async fn test_index_with_several_matching_entries_uses_best_one() {
    let v7 = ImageBuilder::new("linux", "arm")
        .variant("v7")
        .layer(b"armv7 layer")
        .build();
    let v6 = ImageBuilder::new("linux", "arm")
        .variant("v6")
        .layer(b"armv6 layer")
        .build();
    // Entries without a platform match anything and sort last.
    let unlabelled = ImageBuilder::new("linux", "arm").layer(b"attestation").build();

    let mut idx = index(&[v6.clone(), v7.clone()]);
    let mut entries: Vec<Descriptor> =
        serde_json::from_slice::<serde_json::Value>(&idx.root.data).unwrap()["manifests"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| serde_json::from_value(m.clone()).unwrap())
            .collect();
    entries.push(unlabelled.root.desc.clone());
    idx.root = Blob::json(
        OCI_INDEX,
        serde_json::json!({"schemaVersion": 2, "mediaType": OCI_INDEX, "manifests": entries}),
    );
    idx.others.extend(unlabelled.metadata());

    let src = reference("docker.io/library/armhf:1");
    let registry = FakeRegistry::new();
    registry.push(&src.whole(), &idx);
    let store = Arc::new(MemoryStore::new());
    let puller = Arc::new(Puller::new(
        store.clone(),
        Arc::new(registry.clone()),
        src,
        Platform::new("linux", "arm").with_variant("v7"),
    ));

    let pulled = puller
        .pull_manifests(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(pulled.config.digest, v7.config.as_ref().unwrap().desc.digest);
    assert_eq!(pulled.remote.descriptors.len(), 1);
    assert_eq!(pulled.remote.descriptors[0].digest, v7.layers[0].desc.digest);
    assert_eq!(uncompressed(&pulled.remote.descriptors), v7.diff_ids);
    assert!(!store.contains(&v6.root.desc.digest));
    assert!(!store.contains(&unlabelled.root.desc.digest));
}

#[tokio::test]
async fn test_pull_records_distribution_source() {
    let image = ImageBuilder::new("linux", "amd64").layer(b"only").build();
    let src = reference("docker.io/library/busybox:latest");
    let registry = FakeRegistry::new();
    registry.push(&src.whole(), &image);
    let store = Arc::new(MemoryStore::new());

    puller(&store, &registry, src)
        .pull_manifests(&CancellationToken::new())
        .await
        .unwrap();

    let info = store.info(&image.root.desc.digest).await.unwrap();
    assert_eq!(
        info.labels
            .get("containerd.io/distribution.source.docker.io")
            .map(String::as_str),
        Some("library/busybox")
    );
}

#[tokio::test]
async fn test_schema1_image_is_converted_eagerly() {
    let legacy = Schema1Builder::new()
        .layer(b"base filesystem", "ADD rootfs.tar /")
        .throwaway("ENV PATH=/usr/bin")
        .layer(b"installed packages", "apk add curl")
        .layer(b"application", "COPY app /app")
        .build();
    let src = reference("docker.io/library/legacy:latest");
    let registry = FakeRegistry::new();
    registry.push(&src.whole(), &legacy);
    let store = Arc::new(MemoryStore::new());

    let pulled = puller(&store, &registry, src)
        .pull_manifests(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(pulled.main_manifest.media_type, DOCKER_MANIFEST);
    assert_eq!(pulled.config.media_type, DOCKER_CONFIG);
    assert_eq!(pulled.remote.descriptors.len(), 3);
    let layer_digests: Vec<String> = pulled.remote.descriptors.iter().map(|d| d.digest.clone()).collect();
    assert_eq!(layer_digests, legacy.layer_digests());
    assert_eq!(uncompressed(&pulled.remote.descriptors), legacy.diff_ids);

    // Layers were downloaded; the throwaway blob was not.
    for layer in &legacy.layers {
        assert!(store.contains(&layer.desc.digest));
    }
    let empty = &legacy.others[0];
    assert!(!registry.fetched().contains(&empty.desc.digest));

    let config: serde_json::Value =
        serde_json::from_slice(&read_blob(store.as_ref(), &pulled.config).await.unwrap()).unwrap();
    assert_eq!(config["rootfs"]["diff_ids"], serde_json::json!(legacy.diff_ids));
    let history = config["history"].as_array().unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[1]["empty_layer"], true);
    assert_eq!(history[3]["created_by"], "/bin/sh -c COPY app /app");
    assert!(config.get("id").is_none());
    assert!(config.get("parent").is_none());

    // Same shape as a normal pull: the manifest and its config.
    let expected: BTreeSet<String> = [pulled.main_manifest.digest.clone(), pulled.config.digest.clone()]
        .into_iter()
        .collect();
    assert_eq!(digests(&pulled.nonlayers), expected);
    assert!(pulled.nonlayers.contains(&pulled.config));
}

#[tokio::test]
async fn test_layer_count_mismatch_fails() {
    let image = ImageBuilder::new("linux", "amd64")
        .layer(b"one")
        .layer(b"two")
        .extra_diff_id(b"three")
        .build();
    let src = reference("docker.io/library/broken:1");
    let registry = FakeRegistry::new();
    registry.push(&src.whole(), &image);
    let store = Arc::new(MemoryStore::new());

    let err = puller(&store, &registry, src)
        .pull_manifests(&CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        LazypullError::LayerCountMismatch {
            diff_id_count,
            layer_count,
            ..
        } => {
            assert_eq!(diff_id_count, 3);
            assert_eq!(layer_count, 2);
        }
        other => panic!("expected layer count mismatch, got {other:?}"),
    }

    // Only the metadata fetched before the failure is stored.
    let stored: BTreeSet<String> = store.digests().into_iter().collect();
    let expected: BTreeSet<String> = [
        image.root.desc.digest.clone(),
        image.config.as_ref().unwrap().desc.digest.clone(),
    ]
    .into_iter()
    .collect();
    assert_eq!(stored, expected);
    for layer in &image.layers {
        assert!(!store.contains(&layer.desc.digest));
    }
}

#[tokio::test]
async fn test_digest_reference_falls_back_to_registry() {
    let image = ImageBuilder::new("linux", "amd64").layer(b"layer").build();
    let registry = FakeRegistry::new();
    for blob in image.blobs() {
        registry.push_blob(&blob);
    }
    let src = reference(&format!("docker.io/library/pinned@{}", image.root.desc.digest));
    let store = Arc::new(MemoryStore::new());

    let pulled = puller(&store, &registry, src)
        .pull_manifests(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(registry.resolve_calls(), 1);
    assert_eq!(pulled.main_manifest.digest, image.root.desc.digest);
    assert!(store.contains(&image.root.desc.digest));
}

#[tokio::test]
async fn test_warm_store_needs_no_registry() {
    let image = ImageBuilder::new("linux", "amd64")
        .layer(b"cached one")
        .layer(b"cached two")
        .build();
    let registry = FakeRegistry::new();
    registry.set_fail_resolve(true);
    let store = Arc::new(MemoryStore::new());
    seed_store(&store, &image.metadata());
    let src = reference(&format!("docker.io/library/warm@{}", image.root.desc.digest));

    let pulled = puller(&store, &registry, src)
        .pull_manifests(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(registry.resolve_calls(), 0);
    assert!(registry.fetched().is_empty());
    assert_eq!(uncompressed(&pulled.remote.descriptors), image.diff_ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pulls_resolve_once() {
    let (idx, _, _) = two_platform_image();
    let src = reference("docker.io/library/shared:1");
    let registry = FakeRegistry::new();
    registry.push(&src.whole(), &idx);
    registry.set_resolve_delay(Duration::from_millis(50));
    let store = Arc::new(MemoryStore::new());
    let puller = puller(&store, &registry, src);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let puller = Arc::clone(&puller);
            tokio::spawn(async move { puller.pull_manifests(&CancellationToken::new()).await })
        })
        .collect();

    let mut roots = BTreeSet::new();
    for task in tasks {
        let pulled = task.await.unwrap().unwrap();
        roots.insert(pulled.main_manifest.digest);
    }
    assert_eq!(roots.len(), 1);
    assert_eq!(registry.resolve_calls(), 1);
}

#[tokio::test]
async fn test_resolution_failure_is_permanent() {
    let image = ImageBuilder::new("linux", "amd64").layer(b"x").build();
    let src = reference("docker.io/library/flaky:1");
    let registry = FakeRegistry::new();
    registry.push(&src.whole(), &image);
    registry.set_fail_resolve(true);
    let store = Arc::new(MemoryStore::new());
    let puller = puller(&store, &registry, src);

    let first = puller
        .pull_manifests(&CancellationToken::new())
        .await
        .unwrap_err();
    registry.set_fail_resolve(false);
    let second = puller
        .pull_manifests(&CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(first, second);
    assert!(matches!(first, LazypullError::Resolve { .. }));
    assert_eq!(registry.resolve_calls(), 1);
}

#[tokio::test]
async fn test_result_is_memoized() {
    let image = ImageBuilder::new("linux", "amd64").layer(b"x").build();
    let src = reference("docker.io/library/memo:1");
    let registry = FakeRegistry::new();
    registry.push(&src.whole(), &image);
    let store = Arc::new(MemoryStore::new());
    let puller = puller(&store, &registry, src);

    let first = puller.pull_manifests(&CancellationToken::new()).await.unwrap();
    let fetches = registry.fetched().len();
    let second = puller.pull_manifests(&CancellationToken::new()).await.unwrap();

    assert_eq!(first.main_manifest, second.main_manifest);
    assert_eq!(first.remote.descriptors, second.remote.descriptors);
    assert_eq!(registry.fetched().len(), fetches);
}

#[tokio::test]
async fn test_cancelled_pull_returns_no_result() {
    let image = ImageBuilder::new("linux", "amd64").layer(b"x").build();
    let src = reference("docker.io/library/cancel:1");
    let registry = FakeRegistry::new();
    registry.push(&src.whole(), &image);
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = puller(&store, &registry, src)
        .pull_manifests(&cancel)
        .await
        .unwrap_err();
    assert_eq!(err, LazypullError::Cancelled);
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pull_timeout() {
    let image = ImageBuilder::new("linux", "amd64").layer(b"x").build();
    let src = reference("docker.io/library/slow:1");
    let registry = FakeRegistry::new();
    registry.push(&src.whole(), &image);
    registry.set_resolve_delay(Duration::from_secs(10));
    let store = Arc::new(MemoryStore::new());
    let options = PullOptions {
        platform: Some("linux/amd64".into()),
        pull_timeout_secs: Some(1),
        ..Default::default()
    };
    let puller = Arc::new(
        Puller::from_options(store.clone(), Arc::new(registry.clone()), src, options).unwrap(),
    );

    let err = puller
        .pull_manifests(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, LazypullError::Timeout(Duration::from_secs(1)));
}

#[tokio::test]
async fn test_failed_fetch_is_retried_then_fails() {
    let image = ImageBuilder::new("linux", "amd64").layer(b"x").build();
    let config = image.config.clone().unwrap();
    let src = reference("docker.io/library/unreachable:1");
    let registry = FakeRegistry::new();
    registry.push(&src.whole(), &image);
    registry.fail_fetch(&config.desc.digest);
    let store = Arc::new(MemoryStore::new());

    let err = puller(&store, &registry, src)
        .pull_manifests(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LazypullError::Fetch { .. }));
    let attempts = registry
        .fetched()
        .iter()
        .filter(|d| **d == config.desc.digest)
        .count();
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn test_remote_provider_streams_layers() {
    let image = ImageBuilder::new("linux", "amd64")
        .layer(b"a layer long enough to span several fetch chunks")
        .build();
    let src = reference("docker.io/library/lazy:1");
    let registry = FakeRegistry::new();
    registry.push(&src.whole(), &image);
    let store = Arc::new(MemoryStore::new());

    let pulled = puller(&store, &registry, src)
        .pull_manifests(&CancellationToken::new())
        .await
        .unwrap();
    let layer = &pulled.remote.descriptors[0];
    let expected = &image.layers[0].data;

    let reader = pulled.remote.provider.reader_at(layer).await.unwrap();
    assert_eq!(reader.size(), expected.len() as i64);
    assert_eq!(read_all(reader.as_ref()).await.unwrap(), expected.to_vec());

    // Random access reopens the stream at the requested offset.
    let mut buf = vec![0u8; 8];
    let n = reader.read_at(&mut buf, 5).await.unwrap();
    assert_eq!(&buf[..n], &expected[5..5 + n]);

    assert!(!store.contains(&layer.digest));
}
