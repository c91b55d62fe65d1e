//! The OCI Distribution v2 registry client: resolve, pull, push, delete.
//!
//! The hard part is the blob push state machine:
//!
//! ```text
//! START → INITIATE → [monolithic | chunked*] → FINALIZE → DONE
//!                   ↘ retryable error → back-off → retry (chunk PATCH only)
//!                   ↘ terminal error → FAIL
//! ```
//!
//! Retries apply only to the chunk `PATCH`, which is idempotent for a given
//! `Content-Range`; the initiating `POST` is never retried. The
//! `Authorization` value negotiated for the session is replayed on every
//! subsequent request, including uploads redirected to another host.

use std::{path::Path, time::Duration};

use base64::Engine as _;
use bon::{bon, Builder};
use color_eyre::{
    eyre::{Context, OptionExt},
    Result,
};
use futures_lite::StreamExt;
use reqwest::{
    header::{
        HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION,
        RANGE, WWW_AUTHENTICATE,
    },
    Method, Response, StatusCode,
};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    error::Error,
    oci::{Descriptor, Manifest, MANIFEST_MEDIA_TYPE},
    transform::VerifyStream,
    ByteStream, CredentialsStore, Digest, ModelSource, NetworkOpts, Reference, SubReference,
};

/// Upload chunk size used when the caller does not choose one.
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Registries known to reject chunked uploads; blobs go up monolithically.
const MONOLITHIC_ONLY_HOSTS: &[&str] = &["registry.gitlab.com"];

const OCTET_STREAM: &str = "application/octet-stream";

/// Decides whether and how long to wait before retrying a chunk `PATCH`.
#[derive(Debug, Clone, Builder)]
pub struct RetryPolicy {
    /// Total attempts per chunk, including the first.
    #[builder(default = 5)]
    pub max_attempts: u32,

    /// Wait before the first retry; doubles each retry.
    #[builder(default = Duration::from_millis(500))]
    pub min_wait: Duration,

    /// Upper bound on a single back-off sleep.
    #[builder(default = Duration::from_secs(30))]
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// The back-off before retry number `retry` (0-based), or `None` when
    /// attempts are exhausted.
    fn delay(&self, retry: u32) -> Option<Duration> {
        if retry + 1 >= self.max_attempts {
            return None;
        }
        let wait = self.min_wait.saturating_mul(2u32.saturating_pow(retry));
        Some(wait.min(self.max_wait))
    }

    /// Transient statuses worth retrying: timeouts, throttling, server errors.
    fn retryable_status(status: StatusCode) -> bool {
        status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
    }

    /// Transport failures worth retrying.
    fn retryable_error(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }
}

/// A client bound to one repository on one registry host.
#[derive(Debug)]
pub struct Registry {
    client: reqwest::Client,
    base: Url,
    host: String,
    repository: String,
    auth: Option<HeaderValue>,
    chunk_size: u64,
    retry: RetryPolicy,
}

#[bon]
impl Registry {
    /// Connect to the registry a reference points at, negotiating auth for
    /// the session (Basic, or Bearer via the token service on challenge).
    #[builder]
    pub async fn new(
        reference: &Reference,
        network: Option<NetworkOpts>,
        credentials: Option<&dyn CredentialsStore>,
        chunk_size: Option<u64>,
        retry: Option<RetryPolicy>,
    ) -> Result<Self> {
        let network = network.unwrap_or_default();
        let host = reference.registry.clone();
        let repository = reference.repository.clone();

        let client = build_client(&network).await?;
        let scheme = if network.plain_http { "http" } else { "https" };
        let base = Url::parse(&format!("{scheme}://{host}"))
            .with_context(|| format!("invalid registry host: {host}"))?;

        let basic = credentials.and_then(|store| store.get(&host));
        let auth = negotiate_auth(&client, &base, &repository, basic.as_ref()).await?;

        Ok(Self {
            client,
            base,
            host,
            repository,
            auth,
            chunk_size: chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            retry: retry.unwrap_or_default(),
        })
    }
}

impl Registry {
    /// The registry host this client talks to.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, suffix: &str) -> Result<Url> {
        self.base
            .join(&format!("/v2/{}/{suffix}", self.repository))
            .context("build registry url")
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.auth {
            Some(auth) => request.header(AUTHORIZATION, auth.clone()),
            None => request,
        }
    }

    /// Resolve a tag or digest to the manifest descriptor it names.
    #[instrument(skip(self))]
    pub async fn resolve(&self, sub_reference: &SubReference) -> Result<Descriptor> {
        let name = match sub_reference {
            SubReference::Tag(tag) => tag.clone(),
            SubReference::Digest(digest) => digest.to_string(),
            SubReference::Bare => "latest".to_string(),
        };
        let url = self.url(&format!("manifests/{name}"))?;
        let response = self
            .request(Method::GET, url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPE)
            .send()
            .await
            .map_err(network_error)?;

        let response = self.expect_status(response, &[StatusCode::OK]).await?;
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(MANIFEST_MEDIA_TYPE)
            .to_string();
        let header_digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|value| value.to_str().ok())
            .map(str::parse::<Digest>)
            .transpose()
            .context("parse Docker-Content-Digest")?;

        let body = response.bytes().await.map_err(network_error)?;
        let digest = match header_digest {
            Some(digest) => digest,
            None => Digest::digest_of(&body),
        };
        Ok(Descriptor::new(media_type, digest, body.len() as i64))
    }

    /// Fetch and parse a manifest, verifying it against its digest.
    #[instrument(skip(self, desc), fields(digest = %desc.digest))]
    pub async fn fetch_manifest(&self, desc: &Descriptor) -> Result<Manifest> {
        let url = self.url(&format!("manifests/{}", desc.digest))?;
        let response = self
            .request(Method::GET, url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPE)
            .send()
            .await
            .map_err(network_error)?;
        let response = self.expect_status(response, &[StatusCode::OK]).await?;
        let body = response.bytes().await.map_err(network_error)?;

        let actual = Digest::digest_of(&body);
        if actual != desc.digest {
            Err(Error::Integrity(format!(
                "manifest digest mismatch: expected {}, got {actual}",
                desc.digest
            )))?;
        }
        Manifest::parse(&body)
    }

    /// Stream a blob, verifying digest and size on the fly.
    #[instrument(skip(self, desc), fields(digest = %desc.digest))]
    pub async fn fetch_blob(&self, desc: &Descriptor) -> Result<ByteStream> {
        let url = self.url(&format!("blobs/{}", desc.digest))?;
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(network_error)?;
        let response = self.expect_status(response, &[StatusCode::OK]).await?;

        let stream: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other)),
        );
        Ok(Box::pin(VerifyStream::new(
            stream,
            desc.digest.clone(),
            desc.size,
        )))
    }

    /// Whether the registry already holds a blob.
    pub async fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        let url = self.url(&format!("blobs/{digest}"))?;
        let response = self
            .request(Method::HEAD, url)
            .send()
            .await
            .map_err(network_error)?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(self.status_error(status, response).await),
        }
    }

    /// Push a blob from a local file, monolithically or in chunks.
    ///
    /// Returns the upload's final `Location` as reported by the server, or
    /// `None` when the blob already existed and nothing was sent.
    #[instrument(skip(self, desc, source), fields(digest = %desc.digest, size = desc.size))]
    pub async fn push_blob(&self, desc: &Descriptor, source: &Path) -> Result<Option<String>> {
        if self.blob_exists(&desc.digest).await? {
            debug!("skip: blob already present in registry");
            return Ok(None);
        }

        // INITIATE. Never retried: a failed POST may still have opened a
        // session server-side, and re-POSTing is not idempotent.
        let url = self.url("blobs/uploads/")?;
        let response = self
            .request(Method::POST, url)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(network_error)?;
        let response = self
            .expect_status(response, &[StatusCode::ACCEPTED])
            .await
            .context("initiate blob upload")?;
        let location = self.upload_location(&response)?;

        let monolithic =
            MONOLITHIC_ONLY_HOSTS.contains(&host_of(&self.host)) || desc.size as u64 <= self.chunk_size;
        let location = if monolithic {
            self.push_monolithic(desc, source, location).await?
        } else {
            self.push_chunked(desc, source, location).await?
        };
        info!(digest = %desc.digest, "pushed blob");
        Ok(Some(location))
    }

    async fn push_monolithic(
        &self,
        desc: &Descriptor,
        source: &Path,
        location: Url,
    ) -> Result<String> {
        let file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("open blob source {}", source.display()))?;
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));

        let url = with_digest_query(location, &desc.digest);
        let response = self
            .request(Method::PUT, url.clone())
            .header(CONTENT_TYPE, OCTET_STREAM)
            .header(CONTENT_LENGTH, desc.size)
            .body(body)
            .send()
            .await
            .map_err(network_error)?;
        let response = self
            .expect_status(response, &[StatusCode::CREATED])
            .await
            .context("finalize monolithic upload")?;
        Ok(response_location(&response).unwrap_or_else(|| url.to_string()))
    }

    async fn push_chunked(
        &self,
        desc: &Descriptor,
        source: &Path,
        mut location: Url,
    ) -> Result<String> {
        let mut file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("open blob source {}", source.display()))?;
        let total = desc.size as u64;
        let mut start = 0u64;

        while start < total {
            let end = (start + self.chunk_size - 1).min(total - 1);
            location = self
                .patch_chunk(&mut file, location, start, end)
                .await
                .with_context(|| format!("upload chunk {start}-{end}"))?;
            start = end + 1;
        }

        // FINALIZE: empty-bodied PUT with the digest query.
        let url = with_digest_query(location, &desc.digest);
        let response = self
            .request(Method::PUT, url.clone())
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(network_error)?;
        let response = self
            .expect_status(response, &[StatusCode::CREATED])
            .await
            .context("finalize chunked upload")?;
        Ok(response_location(&response).unwrap_or_else(|| url.to_string()))
    }

    /// Upload one chunk with the retry discipline: transient failures re-read
    /// the chunk from the file (a seek back to the range start) and back off
    /// per the policy; anything else is terminal.
    async fn patch_chunk(
        &self,
        file: &mut tokio::fs::File,
        location: Url,
        start: u64,
        end: u64,
    ) -> Result<Url> {
        let len = end - start + 1;
        let mut retry = 0u32;

        loop {
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .context("seek chunk start")?;
            let mut chunk = vec![0u8; len as usize];
            file.read_exact(&mut chunk)
                .await
                .context("read chunk from source")?;

            let attempt = self
                .request(Method::PATCH, location.clone())
                .header(CONTENT_TYPE, OCTET_STREAM)
                .header(CONTENT_LENGTH, len)
                .header(CONTENT_RANGE, format!("{start}-{end}"))
                .body(chunk)
                .send()
                .await;

            let failure = match attempt {
                Ok(response) if response.status() == StatusCode::ACCEPTED => {
                    // The server acknowledges the range it holds; a short
                    // acknowledgment means the session is desynced and no
                    // amount of retrying will fix it.
                    let acked = response
                        .headers()
                        .get(RANGE)
                        .and_then(|value| value.to_str().ok())
                        .and_then(parse_range_end);
                    if let Some(acked) = acked {
                        if acked != end {
                            Err(Error::Integrity(format!(
                                "upload session desync: sent bytes through {end}, server acknowledged {acked}"
                            )))?;
                        }
                    }
                    return self.upload_location(&response);
                }
                Ok(response) if RetryPolicy::retryable_status(response.status()) => {
                    format!("status {}", response.status())
                }
                Ok(response) => {
                    let status = response.status();
                    return Err(self.status_error(status, response).await);
                }
                Err(err) if RetryPolicy::retryable_error(&err) => format!("transport: {err}"),
                Err(err) => Err(Error::Network(err.to_string()))?,
            };

            match self.retry.delay(retry) {
                Some(delay) => {
                    warn!(%failure, ?delay, retry, "chunk upload failed; backing off");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                None => Err(Error::Network(format!(
                    "chunk upload failed after {} attempts: {failure}",
                    self.retry.max_attempts
                )))?,
            }
        }
    }

    /// Push a manifest under a tag or digest.
    #[instrument(skip(self, manifest))]
    pub async fn put_manifest(
        &self,
        manifest: &Manifest,
        sub_reference: &SubReference,
    ) -> Result<Descriptor> {
        let desc = manifest.descriptor()?;
        let name = match sub_reference {
            SubReference::Tag(tag) => tag.clone(),
            SubReference::Digest(digest) => digest.to_string(),
            SubReference::Bare => desc.digest.to_string(),
        };
        let url = self.url(&format!("manifests/{name}"))?;
        let response = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, manifest.media_type.clone())
            .body(manifest.to_canonical_json()?)
            .send()
            .await
            .map_err(network_error)?;
        self.expect_status(response, &[StatusCode::CREATED])
            .await
            .context("put manifest")?;
        Ok(desc)
    }

    /// Delete a manifest by tag (untag) or digest (full removal).
    ///
    /// Deleting by tag asks the registry to drop only that tag; the registry
    /// prunes untagged manifests at its own pace. A `405` means the registry
    /// does not support removal at all.
    #[instrument(skip(self))]
    pub async fn delete_manifest(&self, sub_reference: &SubReference) -> Result<()> {
        let name = match sub_reference {
            SubReference::Tag(tag) => tag.clone(),
            SubReference::Digest(digest) => digest.to_string(),
            SubReference::Bare => Err(Error::InvalidInput(
                "a tag or digest is required to remove a remote modelkit".to_string(),
            ))?,
        };
        let url = self.url(&format!("manifests/{name}"))?;
        let response = self
            .request(Method::DELETE, url)
            .send()
            .await
            .map_err(network_error)?;

        match response.status() {
            StatusCode::ACCEPTED | StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => Err(Error::Unsupported(format!(
                "removing models is unsupported by registry {}",
                self.host
            )))?,
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("manifest {name}")))?,
            status => Err(self.status_error(status, response).await),
        }
    }

    /// Extract the next upload location from a `202` response and resolve it
    /// against the session.
    fn upload_location(&self, response: &Response) -> Result<Url> {
        let location = response
            .headers()
            .get(LOCATION)
            .ok_or_eyre("registry response carried no Location header")?
            .to_str()
            .context("Location header is not valid ASCII")?;

        resolve_location(&self.base, &self.host, location)
    }

    async fn expect_status(&self, response: Response, accept: &[StatusCode]) -> Result<Response> {
        let status = response.status();
        if accept.contains(&status) {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound(format!(
                "{}/{}",
                self.host, self.repository
            )))?;
        }
        Err(self.status_error(status, response).await)
    }

    async fn status_error(&self, status: StatusCode, response: Response) -> color_eyre::Report {
        let message = response.text().await.unwrap_or_default();
        Error::Server {
            status: status.as_u16(),
            message,
        }
        .into()
    }
}

impl ModelSource for Registry {
    async fn resolve(&self, reference: &Reference) -> Result<Descriptor> {
        Registry::resolve(self, &reference.sub_reference).await
    }

    async fn manifest(&self, _reference: &Reference, desc: &Descriptor) -> Result<Manifest> {
        self.fetch_manifest(desc).await
    }

    async fn blob(&self, _reference: &Reference, desc: &Descriptor) -> Result<ByteStream> {
        self.fetch_blob(desc).await
    }
}

async fn build_client(network: &NetworkOpts) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .danger_accept_invalid_certs(!network.tls_verify)
        .connect_timeout(Duration::from_secs(30));

    for path in &network.tls_trust_cert_paths {
        let pem = tokio::fs::read(path)
            .await
            .with_context(|| format!("read trust certificate {}", path.display()))?;
        let certificate =
            reqwest::Certificate::from_pem(&pem).context("parse trust certificate")?;
        builder = builder.add_root_certificate(certificate);
    }

    if let (Some(cert), Some(key)) = (&network.client_cert_path, &network.client_key_path) {
        let mut pem = tokio::fs::read(cert)
            .await
            .with_context(|| format!("read client certificate {}", cert.display()))?;
        let key = tokio::fs::read(key)
            .await
            .with_context(|| format!("read client key {}", key.display()))?;
        pem.extend_from_slice(&key);
        let identity = reqwest::Identity::from_pem(&pem).context("parse client identity")?;
        builder = builder.identity(identity);
    }

    if let Some(proxy) = &network.proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy).context("parse proxy url")?);
    }

    builder.build().context("build http client")
}

/// Negotiate the session's `Authorization` value: ping `/v2/`, answer a
/// Bearer challenge through the token service, or fall back to Basic.
async fn negotiate_auth(
    client: &reqwest::Client,
    base: &Url,
    repository: &str,
    basic: Option<&(String, String)>,
) -> Result<Option<HeaderValue>> {
    let ping = base.join("/v2/").context("build ping url")?;
    let response = match client.get(ping).send().await {
        Ok(response) => response,
        Err(err) => return Err(network_error(err)).context("ping registry"),
    };

    if response.status() == StatusCode::UNAUTHORIZED {
        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_bearer_challenge);
        if let Some(challenge) = challenge {
            let token = fetch_token(client, &challenge, repository, basic).await?;
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("token is not a valid header value")?;
            return Ok(Some(value));
        }
    }

    Ok(basic.map(basic_header).transpose()?)
}

fn basic_header((user, secret): &(String, String)) -> Result<HeaderValue> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{secret}"));
    HeaderValue::from_str(&format!("Basic {encoded}")).context("credentials are not header-safe")
}

#[derive(Debug, PartialEq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
}

/// Parse `WWW-Authenticate: Bearer realm="...",service="..."`.
fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    for param in params.split(',') {
        let (key, value) = param.trim().split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

async fn fetch_token(
    client: &reqwest::Client,
    challenge: &BearerChallenge,
    repository: &str,
    basic: Option<&(String, String)>,
) -> Result<String> {
    let mut url = Url::parse(&challenge.realm).context("parse token realm")?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(service) = &challenge.service {
            query.append_pair("service", service);
        }
        query.append_pair("scope", &format!("repository:{repository}:pull,push"));
    }

    let mut request = client.get(url);
    if let Some((user, secret)) = basic {
        request = request.basic_auth(user, Some(secret));
    }
    let response = request.send().await.map_err(network_error)?;
    if !response.status().is_success() {
        Err(Error::Server {
            status: response.status().as_u16(),
            message: "token service refused the request".to_string(),
        })?;
    }
    let token: TokenResponse = response.json().await.map_err(network_error)?;
    Ok(token.token)
}

fn network_error(err: reqwest::Error) -> color_eyre::Report {
    Error::Network(err.to_string()).into()
}

/// Resolve a `Location` header against the session base.
///
/// Workaround for an upstream auth-client bug: a session initiated against
/// port 443 can get back a `Location` on the same host with the port
/// dropped, and the port must be reattached so every request of the session
/// names the same authority. Whether the session used port 443 is decided
/// from the scheme and the *literal* host string of the reference: the `url`
/// crate folds an explicit `:443` into the https default during parsing, so
/// `base.port()` cannot answer it.
fn resolve_location(base: &Url, session_host: &str, location: &str) -> Result<Url> {
    let mut url = base.join(location).context("resolve upload Location")?;

    let session_on_443 = base.scheme() == "https" || session_host.ends_with(":443");
    if session_on_443 && url.host_str() == base.host_str() && url.port().is_none() {
        // Observable for an http session that explicitly named :443; for
        // https the port folds back into the default on serialization.
        let _ = url.set_port(Some(443));
    }
    Ok(url)
}

fn response_location(response: &Response) -> Option<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn with_digest_query(mut url: Url, digest: &Digest) -> Url {
    url.query_pairs_mut()
        .append_pair("digest", &digest.to_string());
    url
}

/// The end offset of a `Range: 0-<end>` acknowledgment.
fn parse_range_end(range: &str) -> Option<u64> {
    range.rsplit_once('-')?.1.parse().ok()
}

/// The host portion of `host[:port]`, for the monolithic-only lookup.
fn host_of(host: &str) -> &str {
    host.split_once(':').map(|(name, _)| name).unwrap_or(host)
}
