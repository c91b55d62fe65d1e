//! Distribution v2 protocol tests against a mock registry: upload formats,
//! chunk retry discipline, auth negotiation, and untag-vs-delete.

use std::{collections::BTreeMap, time::Duration};

use async_tempfile::TempDir;
use kitops_lib::{
    error::Error,
    oci::{Descriptor, Manifest, KIT_ARTIFACT_TYPE, MANIFEST_MEDIA_TYPE, SCHEMA_VERSION},
    ops,
    registry::{Registry, RetryPolicy},
    Digest, NetworkOpts, Reference,
};
use pretty_assertions::assert_eq;
use wiremock::{
    matchers::{header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

use crate::assert_error_kind;
use crate::common::{temp_store, write_file};

const MB: usize = 1024 * 1024;

fn reference_for(server: &MockServer, repository: &str) -> Reference {
    let host = server.address().to_string();
    format!("{host}/{repository}:v1").parse().expect("reference")
}

fn plain_http() -> NetworkOpts {
    NetworkOpts::builder().plain_http(true).build()
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .min_wait(Duration::from_millis(5))
        .max_wait(Duration::from_millis(20))
        .build()
}

async fn mock_anonymous_ping(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn connect(server: &MockServer, repository: &str, retry: RetryPolicy) -> Registry {
    Registry::builder()
        .reference(&reference_for(server, repository))
        .network(plain_http())
        .retry(retry)
        .build()
        .await
        .expect("connect registry")
}

async fn blob_on_disk(bytes: &[u8]) -> (TempDir, std::path::PathBuf, Descriptor) {
    let tmp = TempDir::new().await.expect("temp dir");
    let path = tmp.dir_path().join("blob");
    tokio::fs::write(&path, bytes).await.expect("write blob");
    let desc = Descriptor::new(
        "application/octet-stream",
        Digest::digest_of(bytes),
        bytes.len() as i64,
    );
    (tmp, path, desc)
}

#[test_log::test(tokio::test)]
async fn monolithic_push_for_small_blobs() {
    let server = MockServer::start().await;
    mock_anonymous_ping(&server).await;

    let payload = b"small blob".to_vec();
    let (_tmp, path_on_disk, desc) = blob_on_disk(&payload).await;
    let digest = desc.digest.to_string();

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/repo/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/repo/blobs/uploads/"))
        .respond_with(
            ResponseTemplate::new(202).insert_header("Location", "/v2/repo/blobs/uploads/session"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/repo/blobs/uploads/session"))
        .and(query_param("digest", digest.as_str()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let registry = connect(&server, "repo", fast_retry(3)).await;
    let location = registry
        .push_blob(&desc, &path_on_disk)
        .await
        .expect("push blob");
    assert!(location.expect("uploaded").contains("/v2/repo/blobs/uploads/session"));
}

#[test_log::test(tokio::test)]
async fn absolute_upload_location_is_followed() {
    let server = MockServer::start().await;
    mock_anonymous_ping(&server).await;

    let payload = b"absolute location".to_vec();
    let (_tmp, path_on_disk, desc) = blob_on_disk(&payload).await;
    let digest = desc.digest.to_string();

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/repo/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    // The server hands back a fully qualified Location on its own authority.
    Mock::given(method("POST"))
        .and(path("/v2/repo/blobs/uploads/"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", format!("{}/elsewhere/upload/abs", server.uri()).as_str()),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/elsewhere/upload/abs"))
        .and(query_param("digest", digest.as_str()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let registry = connect(&server, "repo", fast_retry(3)).await;
    let location = registry
        .push_blob(&desc, &path_on_disk)
        .await
        .expect("push blob");
    assert!(location.expect("uploaded").contains("/elsewhere/upload/abs"));
}

#[test_log::test(tokio::test)]
async fn existing_blob_is_not_reuploaded() {
    let server = MockServer::start().await;
    mock_anonymous_ping(&server).await;

    let payload = b"already there".to_vec();
    let (_tmp, path_on_disk, desc) = blob_on_disk(&payload).await;

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/repo/blobs/{}", desc.digest)))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let registry = connect(&server, "repo", fast_retry(3)).await;
    let location = registry
        .push_blob(&desc, &path_on_disk)
        .await
        .expect("skip push");
    assert_eq!(location, None);
    let requests = server.received_requests().await.expect("requests");
    assert!(
        requests.iter().all(|request| request.method.to_string() != "POST"),
        "no upload may be initiated for an existing blob"
    );
}

#[test_log::test(tokio::test)]
async fn chunked_push_retries_transient_failures() {
    let server = MockServer::start().await;
    mock_anonymous_ping(&server).await;

    // Two exact 1 MB chunks; the first PATCH hits a transient 500 before the
    // server accepts the retry.
    let payload = vec![0xabu8; 2 * MB];
    let (_tmp, path_on_disk, desc) = blob_on_disk(&payload).await;
    let digest = desc.digest.to_string();

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/repo/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/repo/blobs/uploads/"))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", "/upload/one"))
        .expect(1)
        .mount(&server)
        .await;

    // First PATCH to /one: transient failure, then acceptance.
    Mock::given(method("PATCH"))
        .and(path("/upload/one"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/upload/one"))
        .and(header("Content-Range", "0-1048575"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Range", "0-1048575")
                .insert_header("Location", "/upload/two"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/upload/two"))
        .and(header("Content-Range", "1048576-2097151"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Range", "0-2097151")
                .insert_header("Location", "/upload/three"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/three"))
        .and(query_param("digest", digest.as_str()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let registry = Registry::builder()
        .reference(&reference_for(&server, "repo"))
        .network(plain_http())
        .chunk_size(MB as u64)
        .retry(fast_retry(3))
        .build()
        .await
        .expect("connect registry");

    let location = registry
        .push_blob(&desc, &path_on_disk)
        .await
        .expect("chunked push");
    // The client ends wherever the server's final Location pointed it.
    assert!(location.expect("uploaded").contains("/upload/three"));
}

#[test_log::test(tokio::test)]
async fn chunked_push_gives_up_after_policy_attempts() {
    let server = MockServer::start().await;
    mock_anonymous_ping(&server).await;

    let payload = vec![0xcdu8; 2 * MB];
    let (_tmp, path_on_disk, desc) = blob_on_disk(&payload).await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/repo/blobs/uploads/"))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", "/upload/one"))
        .mount(&server)
        .await;
    // Every PATCH fails; the client must stop at max_attempts.
    Mock::given(method("PATCH"))
        .and(path("/upload/one"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let registry = Registry::builder()
        .reference(&reference_for(&server, "repo"))
        .network(plain_http())
        .chunk_size(MB as u64)
        .retry(fast_retry(2))
        .build()
        .await
        .expect("connect registry");

    let report = registry
        .push_blob(&desc, &path_on_disk)
        .await
        .expect_err("attempts exhausted");
    assert_error_kind!(report, Error::Network(_));
}

#[test_log::test(tokio::test)]
async fn chunk_range_desync_is_terminal() {
    let server = MockServer::start().await;
    mock_anonymous_ping(&server).await;

    let payload = vec![0xefu8; 2 * MB];
    let (_tmp, path_on_disk, desc) = blob_on_disk(&payload).await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/repo/blobs/uploads/"))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", "/upload/one"))
        .mount(&server)
        .await;
    // The server acknowledges fewer bytes than were sent.
    Mock::given(method("PATCH"))
        .and(path("/upload/one"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Range", "0-524287")
                .insert_header("Location", "/upload/two"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let registry = Registry::builder()
        .reference(&reference_for(&server, "repo"))
        .network(plain_http())
        .chunk_size(MB as u64)
        .retry(fast_retry(3))
        .build()
        .await
        .expect("connect registry");

    let report = registry
        .push_blob(&desc, &path_on_disk)
        .await
        .expect_err("desync is terminal");
    assert_error_kind!(report, Error::Integrity(_));
}

#[test_log::test(tokio::test)]
async fn bearer_challenge_is_answered_and_replayed() {
    let server = MockServer::start().await;
    let token_url = format!("{}/token", server.uri());

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "WWW-Authenticate",
            format!("Bearer realm=\"{token_url}\",service=\"mock-registry\"").as_str(),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("service", "mock-registry"))
        .and(query_param("scope", "repository:repo:pull,push"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "sesame"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    // The negotiated token must ride on subsequent requests.
    Mock::given(method("HEAD"))
        .and(header("Authorization", "Bearer sesame"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let registry = connect(&server, "repo", fast_retry(3)).await;
    let exists = registry
        .blob_exists(&Digest::digest_of(b"anything"))
        .await
        .expect("authorized head");
    assert!(exists);
}

fn sample_manifest(config_bytes: &[u8], layer_bytes: &[u8]) -> Manifest {
    Manifest {
        schema_version: SCHEMA_VERSION,
        media_type: MANIFEST_MEDIA_TYPE.to_string(),
        artifact_type: Some(KIT_ARTIFACT_TYPE.to_string()),
        config: Descriptor::new(
            kitops_lib::mediatype::KIT_CONFIG_MEDIA_TYPE,
            Digest::digest_of(config_bytes),
            config_bytes.len() as i64,
        ),
        layers: vec![Descriptor::new(
            "application/vnd.kitops.modelkit.model.v1.tar",
            Digest::digest_of(layer_bytes),
            layer_bytes.len() as i64,
        )],
        annotations: BTreeMap::new(),
    }
}

#[test_log::test(tokio::test)]
async fn pull_stores_manifest_and_blobs() {
    let server = MockServer::start().await;
    mock_anonymous_ping(&server).await;

    // A single-file model layer, uncompressed tar.
    let mut tar = tokio_tar::Builder::new(Vec::new());
    let mut header = tokio_tar::Header::new_ustar();
    header.set_entry_type(tokio_tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(8);
    tar.append_data(&mut header, "model.gguf", &[0u8, 1, 2, 3, 4, 5, 6, 7][..])
        .await
        .expect("append");
    let layer_bytes = tar.into_inner().await.expect("finish tar");

    let kitfile =
        kitops_lib::kitfile::Kitfile::parse(b"manifestVersion: \"1.0\"\nmodel:\n  path: model.gguf\n")
            .expect("kitfile");
    let config_bytes = kitfile.to_json().expect("config json");
    let manifest = sample_manifest(&config_bytes, &layer_bytes);
    let manifest_bytes = manifest.to_canonical_json().expect("manifest json");
    let manifest_digest = Digest::digest_of(&manifest_bytes);

    for manifest_path in [
        "/v2/repo/manifests/v1".to_string(),
        format!("/v2/repo/manifests/{manifest_digest}"),
    ] {
        Mock::given(method("GET"))
            .and(path(manifest_path))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", MANIFEST_MEDIA_TYPE)
                    .insert_header("Docker-Content-Digest", manifest_digest.to_string().as_str())
                    .set_body_bytes(manifest_bytes.clone()),
            )
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path(format!("/v2/repo/blobs/{}", manifest.config.digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(config_bytes.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/repo/blobs/{}", manifest.layers[0].digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(layer_bytes.clone()))
        .mount(&server)
        .await;

    let (_tmp, store) = temp_store().await;
    let reference = reference_for(&server, "repo");
    let desc = ops::pull(&store, &reference, &plain_http(), None)
        .await
        .expect("pull");

    assert_eq!(desc.digest, manifest_digest);
    assert!(store.blob_path("repo", &manifest.layers[0].digest).exists());
    let local: Reference = "repo:v1".parse().expect("local reference");
    let resolved = store.resolve(&local).await.expect("tag stored");
    assert_eq!(resolved.digest, manifest_digest);
}

#[test_log::test(tokio::test)]
async fn push_uploads_store_contents() {
    let server = MockServer::start().await;
    mock_anonymous_ping(&server).await;

    // Pack a kit locally, then push it to the mock registry.
    let context = TempDir::new().await.expect("context");
    write_file(context.dir_path(), "model.gguf", &[9u8; 8]).await;
    write_file(
        context.dir_path(),
        "Kitfile",
        b"manifestVersion: \"1.0\"\nmodel:\n  path: model.gguf\n",
    )
    .await;
    let (_tmp, store) = temp_store().await;
    let desc = kitops_lib::pack::pack(
        &store,
        kitops_lib::pack::PackOpts::builder()
            .context_dir(context.dir_path())
            .tag("repo:v1".to_string())
            .build(),
    )
    .await
    .expect("pack");

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/repo/blobs/uploads/"))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", "/upload/next"))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/next"))
        .respond_with(ResponseTemplate::new(201))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/repo/manifests/v1"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let reference = reference_for(&server, "repo");
    let pushed = ops::push(&store, &reference, &plain_http(), None)
        .await
        .expect("push");
    assert_eq!(pushed.digest, desc.digest);
}

#[test_log::test(tokio::test)]
async fn untag_deletes_by_tag_exactly_once() {
    let server = MockServer::start().await;
    mock_anonymous_ping(&server).await;

    Mock::given(method("DELETE"))
        .and(path("/v2/repo/manifests/v1"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let (_tmp, store) = temp_store().await;
    let reference = reference_for(&server, "repo");
    ops::remove(&store, &reference, false, &plain_http(), None)
        .await
        .expect("remove tag");

    let deletes: Vec<_> = server
        .received_requests()
        .await
        .expect("requests")
        .into_iter()
        .filter(|request| request.method.to_string() == "DELETE")
        .collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].url.path(), "/v2/repo/manifests/v1");
}

#[test_log::test(tokio::test)]
async fn forced_remove_deletes_by_digest() {
    let server = MockServer::start().await;
    mock_anonymous_ping(&server).await;

    let manifest_bytes = br#"{"schemaVersion":2}"#.to_vec();
    let digest = Digest::digest_of(&manifest_bytes);

    Mock::given(method("GET"))
        .and(path("/v2/repo/manifests/v1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", MANIFEST_MEDIA_TYPE)
                .insert_header("Docker-Content-Digest", digest.to_string().as_str())
                .set_body_bytes(manifest_bytes),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("/v2/repo/manifests/{digest}")))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let (_tmp, store) = temp_store().await;
    let reference = reference_for(&server, "repo");
    ops::remove(&store, &reference, true, &plain_http(), None)
        .await
        .expect("forced remove");
}

#[test_log::test(tokio::test)]
async fn unsupported_delete_is_reported() {
    let server = MockServer::start().await;
    mock_anonymous_ping(&server).await;

    Mock::given(method("DELETE"))
        .and(path("/v2/repo/manifests/v1"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;

    let (_tmp, store) = temp_store().await;
    let reference = reference_for(&server, "repo");
    let report = ops::remove(&store, &reference, false, &plain_http(), None)
        .await
        .expect_err("registry refuses removal");
    assert_error_kind!(report, Error::Unsupported(_));
}
