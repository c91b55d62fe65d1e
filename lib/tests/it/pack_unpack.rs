//! End-to-end flows through the engine: pack into a local store, unpack back
//! out, with filters, parent chains, tampering, and crafted archives.

use std::collections::BTreeMap;

use async_tempfile::TempDir;
use kitops_lib::{
    error::Error,
    filter::FilterConf,
    kitfile::Kitfile,
    mediatype::Compression,
    oci::{annotations, Descriptor, Manifest, MANIFEST_MEDIA_TYPE, SCHEMA_VERSION},
    pack::{pack, PackOpts},
    unpack::{unpack, UnpackOpts},
    Reference,
};
use pretty_assertions::assert_eq;

use crate::assert_error_kind;
use crate::common::{temp_store, write_file, CountingSource};

const MODEL_BYTES: &[u8] = &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];

async fn pack_simple_context(tag: &str) -> (TempDir, kitops_lib::store::Store, Descriptor) {
    let context = TempDir::new().await.expect("context dir");
    write_file(context.dir_path(), "model.gguf", MODEL_BYTES).await;
    write_file(
        context.dir_path(),
        "Kitfile",
        b"manifestVersion: \"1.0\"\nmodel:\n  path: model.gguf\n",
    )
    .await;

    let (store_tmp, store) = temp_store().await;
    let desc = pack(
        &store,
        PackOpts::builder()
            .context_dir(context.dir_path())
            .tag(tag.to_string())
            .compression(Compression::Gzip)
            .build(),
    )
    .await
    .expect("pack");

    // Hold the context dir until after packing completes.
    drop(context);
    (store_tmp, store, desc)
}

#[test_log::test(tokio::test)]
async fn pack_store_unpack_round_trip() {
    let (_tmp, store, desc) = pack_simple_context("test:v1").await;

    let manifest = store.read_manifest("test", &desc).await.expect("manifest");
    assert_eq!(manifest.layers.len(), 1);
    assert_eq!(
        manifest.layers[0].media_type,
        "application/vnd.kitops.modelkit.model.v1.tar+gzip"
    );

    // The config blob carries the authored Kitfile.
    let config = store
        .fetch_blob_bytes("test", &manifest.config)
        .await
        .expect("config blob");
    let stored = Kitfile::parse(&config).expect("parse config");
    assert_eq!(stored.manifest_version, "1.0");
    assert_eq!(stored.model.as_ref().expect("model").path, "model.gguf");

    let out = TempDir::new().await.expect("unpack dir");
    let reference: Reference = "test:v1".parse().expect("reference");
    unpack(
        &store,
        &reference,
        &UnpackOpts::builder().unpack_dir(out.dir_path()).build(),
    )
    .await
    .expect("unpack");

    let unpacked = tokio::fs::read(out.dir_path().join("model.gguf"))
        .await
        .expect("unpacked model");
    assert_eq!(unpacked, MODEL_BYTES);
    assert!(out.dir_path().join("Kitfile").exists(), "config written");
}

#[test_log::test(tokio::test)]
async fn pack_is_deterministic() {
    let context = TempDir::new().await.expect("context dir");
    write_file(context.dir_path(), "model.gguf", MODEL_BYTES).await;
    write_file(context.dir_path(), "src/train.py", b"print('hi')\n").await;
    write_file(
        context.dir_path(),
        "Kitfile",
        b"manifestVersion: \"1.0\"\nmodel:\n  path: model.gguf\ncode:\n  - path: src\n",
    )
    .await;

    let (_tmp_a, store_a) = temp_store().await;
    let (_tmp_b, store_b) = temp_store().await;
    let opts = |ctx: &std::path::Path| {
        PackOpts::builder()
            .context_dir(ctx)
            .tag("det:v1".to_string())
            .compression(Compression::Gzip)
            .build()
    };

    let first = pack(&store_a, opts(context.dir_path())).await.expect("pack a");
    let second = pack(&store_b, opts(context.dir_path())).await.expect("pack b");
    assert_eq!(first.digest, second.digest, "same inputs, same manifest digest");
}

#[test_log::test(tokio::test)]
async fn filtered_unpack_selects_model_only() {
    let context = TempDir::new().await.expect("context dir");
    write_file(context.dir_path(), "model.gguf", MODEL_BYTES).await;
    write_file(context.dir_path(), "data/train.jsonl", b"{\"x\":1}\n").await;
    write_file(
        context.dir_path(),
        "Kitfile",
        b"manifestVersion: \"1.0\"\nmodel:\n  path: model.gguf\ndatasets:\n  - name: train\n    path: data\n",
    )
    .await;

    let (_tmp, store) = temp_store().await;
    pack(
        &store,
        PackOpts::builder()
            .context_dir(context.dir_path())
            .tag("filtered:v1".to_string())
            .compression(Compression::Gzip)
            .build(),
    )
    .await
    .expect("pack");

    let counting = CountingSource::new(&store);
    let out = TempDir::new().await.expect("unpack dir");
    let reference: Reference = "filtered:v1".parse().expect("reference");
    unpack(
        &counting,
        &reference,
        &UnpackOpts::builder()
            .unpack_dir(out.dir_path())
            .filters(vec!["model".parse::<FilterConf>().expect("filter")])
            .build(),
    )
    .await
    .expect("unpack");

    assert!(out.dir_path().join("model.gguf").exists(), "model written");
    assert!(!out.dir_path().join("Kitfile").exists(), "config filtered out");
    assert!(!out.dir_path().join("data").exists(), "dataset filtered out");

    // Only the config (to learn the layout) and the model layer were read.
    let manifest_ref = store.resolve(&reference).await.expect("resolve");
    let manifest = store.read_manifest("filtered", &manifest_ref).await.expect("manifest");
    let model_layer = &manifest.layers[0];
    let fetched = counting.fetched();
    assert!(fetched.contains(&manifest.config.digest.to_string()));
    assert!(fetched.contains(&model_layer.digest.to_string()));
    for layer in &manifest.layers[1..] {
        assert!(
            !fetched.contains(&layer.digest.to_string()),
            "filtered layer {} must not be fetched",
            layer.digest
        );
    }
}

#[test_log::test(tokio::test)]
async fn parent_reference_inherits_model_parts() {
    let (_tmp, store) = temp_store().await;

    // Parent: a model in two files.
    let parent_ctx = TempDir::new().await.expect("parent context");
    write_file(parent_ctx.dir_path(), "weights.bin", b"weights").await;
    write_file(parent_ctx.dir_path(), "tokenizer.json", b"{\"vocab\":[]}").await;
    write_file(
        parent_ctx.dir_path(),
        "Kitfile",
        b"manifestVersion: \"1.0\"\npackage:\n  name: parent\nmodel:\n  path: weights.bin\n  parts:\n    - path: tokenizer.json\n",
    )
    .await;
    pack(
        &store,
        PackOpts::builder()
            .context_dir(parent_ctx.dir_path())
            .tag("registry.local/parent:v1".to_string())
            .compression(Compression::Gzip)
            .build(),
    )
    .await
    .expect("pack parent");

    // Child: inherits the parent's model by reference; ships only docs.
    let child_ctx = TempDir::new().await.expect("child context");
    write_file(child_ctx.dir_path(), "README.md", b"# child\n").await;
    write_file(
        child_ctx.dir_path(),
        "Kitfile",
        b"manifestVersion: \"1.0\"\npackage:\n  name: child\nmodel:\n  path: registry.local/parent:v1\ndocs:\n  - path: README.md\n",
    )
    .await;
    pack(
        &store,
        PackOpts::builder()
            .context_dir(child_ctx.dir_path())
            .tag("child:v1".to_string())
            .compression(Compression::Gzip)
            .build(),
    )
    .await
    .expect("pack child");

    let out = TempDir::new().await.expect("unpack dir");
    let reference: Reference = "child:v1".parse().expect("reference");
    unpack(
        &store,
        &reference,
        &UnpackOpts::builder().unpack_dir(out.dir_path()).build(),
    )
    .await
    .expect("unpack child");

    // The parent's model files land under the child's unpack root, at the
    // paths the parent declared.
    let weights = tokio::fs::read(out.dir_path().join("weights.bin"))
        .await
        .expect("inherited weights");
    assert_eq!(weights, b"weights");
    let tokenizer = tokio::fs::read(out.dir_path().join("tokenizer.json"))
        .await
        .expect("inherited tokenizer");
    assert_eq!(tokenizer, b"{\"vocab\":[]}");
    assert!(out.dir_path().join("README.md").exists(), "child docs written");
}

#[test_log::test(tokio::test)]
async fn tampered_blob_fails_unpack() {
    let (_tmp, store, desc) = pack_simple_context("tamper:v1").await;

    let manifest = store.read_manifest("tamper", &desc).await.expect("manifest");
    let layer = &manifest.layers[0];
    let path = store.blob_path("tamper", &layer.digest);
    let mut bytes = tokio::fs::read(&path).await.expect("read blob");
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    tokio::fs::write(&path, &bytes).await.expect("tamper blob");

    let out = TempDir::new().await.expect("unpack dir");
    let reference: Reference = "tamper:v1".parse().expect("reference");
    let report = unpack(
        &store,
        &reference,
        &UnpackOpts::builder().unpack_dir(out.dir_path()).build(),
    )
    .await
    .expect_err("tampered layer must fail");
    assert_error_kind!(report, Error::Integrity(_));
}

#[test_log::test(tokio::test)]
async fn conflict_and_overwrite_semantics() {
    let (_tmp, store, _desc) = pack_simple_context("conflict:v1").await;
    let reference: Reference = "conflict:v1".parse().expect("reference");

    let out = TempDir::new().await.expect("unpack dir");
    write_file(out.dir_path(), "model.gguf", b"different").await;

    let report = unpack(
        &store,
        &reference,
        &UnpackOpts::builder().unpack_dir(out.dir_path()).build(),
    )
    .await
    .expect_err("existing file without overwrite");
    assert_error_kind!(report, Error::Conflict(_));

    // ignore_existing leaves the file alone.
    unpack(
        &store,
        &reference,
        &UnpackOpts::builder()
            .unpack_dir(out.dir_path())
            .ignore_existing(true)
            .build(),
    )
    .await
    .expect("ignore existing");
    let kept = tokio::fs::read(out.dir_path().join("model.gguf")).await.expect("read");
    assert_eq!(kept, b"different");

    // overwrite replaces it.
    unpack(
        &store,
        &reference,
        &UnpackOpts::builder()
            .unpack_dir(out.dir_path())
            .overwrite(true)
            .build(),
    )
    .await
    .expect("overwrite");
    let replaced = tokio::fs::read(out.dir_path().join("model.gguf")).await.expect("read");
    assert_eq!(replaced, MODEL_BYTES);
}

/// Store a hand-built manifest whose config is the given Kitfile.
async fn store_kit(
    store: &kitops_lib::store::Store,
    repository: &str,
    tag: &str,
    kitfile: &Kitfile,
    layers: Vec<Descriptor>,
) -> Descriptor {
    let config_bytes = kitfile.to_json().expect("kitfile json");
    let (digest, size) = store
        .push_bytes(repository, &config_bytes)
        .await
        .expect("push config");
    let manifest = Manifest {
        schema_version: SCHEMA_VERSION,
        media_type: MANIFEST_MEDIA_TYPE.to_string(),
        artifact_type: Some(kitops_lib::oci::KIT_ARTIFACT_TYPE.to_string()),
        config: Descriptor::new(kitops_lib::mediatype::KIT_CONFIG_MEDIA_TYPE, digest, size),
        layers,
        annotations: BTreeMap::new(),
    };
    store
        .put_manifest(repository, &manifest, Some(tag))
        .await
        .expect("put manifest")
}

fn kitfile_with_model_path(path: &str) -> Kitfile {
    Kitfile::parse(format!("manifestVersion: \"1.0\"\nmodel:\n  path: {path}\n").as_bytes())
        .expect("kitfile")
}

#[test_log::test(tokio::test)]
async fn parent_cycle_is_detected() {
    let (_tmp, store) = temp_store().await;
    store_kit(&store, "a", "v1", &kitfile_with_model_path("localhost/b:v1"), vec![]).await;
    store_kit(&store, "b", "v1", &kitfile_with_model_path("localhost/a:v1"), vec![]).await;

    let out = TempDir::new().await.expect("unpack dir");
    let reference: Reference = "a:v1".parse().expect("reference");
    let report = unpack(
        &store,
        &reference,
        &UnpackOpts::builder().unpack_dir(out.dir_path()).build(),
    )
    .await
    .expect_err("cycle must fail");
    assert_error_kind!(report, Error::CycleDetected(_));
}

#[test_log::test(tokio::test)]
async fn versioned_sibling_tags_are_not_a_cycle() {
    let (_tmp, store) = temp_store().await;

    // base:v10 → mid:v1 → base:v1. The chain is linear, but "base:v1" is a
    // substring of the visited "base:v10"; only exact matches are cycles.
    store_kit(
        &store,
        "base",
        "v10",
        &kitfile_with_model_path("localhost/mid:v1"),
        vec![],
    )
    .await;
    store_kit(
        &store,
        "mid",
        "v1",
        &kitfile_with_model_path("localhost/base:v1"),
        vec![],
    )
    .await;
    store_kit(&store, "base", "v1", &kitfile_with_model_path("model.bin"), vec![]).await;

    let out = TempDir::new().await.expect("unpack dir");
    let reference: Reference = "base:v10".parse().expect("reference");
    unpack(
        &store,
        &reference,
        &UnpackOpts::builder().unpack_dir(out.dir_path()).build(),
    )
    .await
    .expect("linear chain with substring-colliding tags unpacks");
}

#[test_log::test(tokio::test)]
async fn parent_chain_depth_is_bounded() {
    let (_tmp, store) = temp_store().await;

    // kit0 → kit1 → ... → kit12; the walk must give up at depth 10.
    for i in 0..12 {
        let kitfile = kitfile_with_model_path(&format!("localhost/kit{}:v1", i + 1));
        store_kit(&store, &format!("kit{i}"), "v1", &kitfile, vec![]).await;
    }
    store_kit(&store, "kit12", "v1", &kitfile_with_model_path("model.bin"), vec![]).await;

    let out = TempDir::new().await.expect("unpack dir");
    let reference: Reference = "kit0:v1".parse().expect("reference");
    let report = unpack(
        &store,
        &reference,
        &UnpackOpts::builder().unpack_dir(out.dir_path()).build(),
    )
    .await
    .expect_err("deep chain must fail");
    assert_error_kind!(report, Error::DepthExceeded);
}

#[test_log::test(tokio::test)]
async fn crafted_tar_cannot_escape_unpack_root() {
    let (_tmp, store) = temp_store().await;

    // Build a malicious code layer whose tar entry climbs out of the root.
    let mut builder = tokio_tar::Builder::new(Vec::new());
    let payload = b"owned";
    let mut header = tokio_tar::Header::new_ustar();
    header.set_entry_type(tokio_tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(payload.len() as u64);
    builder
        .append_data(&mut header, "../../x", &payload[..])
        .await
        .expect("append crafted entry");
    let tar_bytes = builder.into_inner().await.expect("finish tar");

    let (digest, size) = store.push_bytes("evil", &tar_bytes).await.expect("push layer");
    let layer = Descriptor::new(
        "application/vnd.kitops.modelkit.code.v1.tar",
        digest,
        size,
    );

    let kitfile =
        Kitfile::parse(b"manifestVersion: \"1.0\"\ncode:\n  - path: src\n").expect("kitfile");
    store_kit(&store, "evil", "v1", &kitfile, vec![layer]).await;

    let out = TempDir::new().await.expect("unpack dir");
    let escape_target = out.dir_path().parent().expect("parent").join("x");
    let reference: Reference = "evil:v1".parse().expect("reference");
    let report = unpack(
        &store,
        &reference,
        &UnpackOpts::builder().unpack_dir(out.dir_path()).build(),
    )
    .await
    .expect_err("escape must fail");
    assert_error_kind!(report, Error::PathEscape(_));
    assert!(!escape_target.exists(), "nothing may be written outside the root");
}

#[test_log::test(tokio::test)]
async fn kitignore_excludes_files_from_layers() {
    let context = TempDir::new().await.expect("context dir");
    write_file(context.dir_path(), "src/train.py", b"print('hi')\n").await;
    write_file(context.dir_path(), "src/debug.log", b"noise").await;
    write_file(context.dir_path(), ".kitignore", b"*.log\n").await;
    write_file(
        context.dir_path(),
        "Kitfile",
        b"manifestVersion: \"1.0\"\ncode:\n  - path: src\n",
    )
    .await;

    let (_tmp, store) = temp_store().await;
    pack(
        &store,
        PackOpts::builder()
            .context_dir(context.dir_path())
            .tag("ignored:v1".to_string())
            .compression(Compression::Gzip)
            .build(),
    )
    .await
    .expect("pack");

    let out = TempDir::new().await.expect("unpack dir");
    let reference: Reference = "ignored:v1".parse().expect("reference");
    unpack(
        &store,
        &reference,
        &UnpackOpts::builder().unpack_dir(out.dir_path()).build(),
    )
    .await
    .expect("unpack");

    assert!(out.dir_path().join("src/train.py").exists(), "code kept");
    assert!(!out.dir_path().join("src/debug.log").exists(), "ignored file excluded");
}

#[test_log::test(tokio::test)]
async fn modelpack_round_trip_via_annotation() {
    let context = TempDir::new().await.expect("context dir");
    write_file(context.dir_path(), "model.gguf", MODEL_BYTES).await;
    write_file(
        context.dir_path(),
        "Kitfile",
        b"manifestVersion: \"1.0\"\nmodel:\n  path: model.gguf\n",
    )
    .await;

    let (_tmp, store) = temp_store().await;
    let desc = pack(
        &store,
        PackOpts::builder()
            .context_dir(context.dir_path())
            .tag("mp:v1".to_string())
            .compression(Compression::Gzip)
            .use_modelpack(true)
            .build(),
    )
    .await
    .expect("pack modelpack");

    let manifest = store.read_manifest("mp", &desc).await.expect("manifest");
    assert_eq!(
        manifest.config.media_type,
        kitops_lib::mediatype::MODELPACK_CONFIG_MEDIA_TYPE
    );
    assert_eq!(
        manifest.layers[0].media_type,
        "application/vnd.cncf.model.weight.v1.tar+gzip"
    );
    assert!(
        manifest.annotations.contains_key(annotations::KITFILE),
        "kitfile rides in the manifest annotation"
    );
    assert_eq!(
        manifest.layers[0]
            .annotation(annotations::FILEPATH)
            .expect("filepath annotation"),
        "model.gguf"
    );

    let out = TempDir::new().await.expect("unpack dir");
    let reference: Reference = "mp:v1".parse().expect("reference");
    unpack(
        &store,
        &reference,
        &UnpackOpts::builder().unpack_dir(out.dir_path()).build(),
    )
    .await
    .expect("unpack modelpack");
    let unpacked = tokio::fs::read(out.dir_path().join("model.gguf"))
        .await
        .expect("unpacked model");
    assert_eq!(unpacked, MODEL_BYTES);
}
