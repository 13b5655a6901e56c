//! Typed access to OCI image layouts, on local disk or over HTTP.
//!
//! The two variants share one operation surface; writes are rejected for
//! remote registries. Every body fetched from either side is verified
//! against the digest that addressed it before it is interpreted.

use std::fmt::Debug;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use cap_std_ext::cap_std::fs::Dir;
use fn_error_context::context;
use serde::Deserialize;

use crate::digest::{sha256_of_bytes, Digest, Sha256Writer};
use crate::errors::Error;
use crate::oci::{ImageConfig, Index, Manifest, MANIFEST_ACCEPT};
use crate::ocidir::{BlobDir, LayerWriter};

/// Progress callback: (bytes fetched so far, total when known else 0).
pub type Progress<'a> = Option<&'a (dyn Fn(u64, u64) + Send + Sync)>;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Typed access over a blob store or an HTTP endpoint.
#[derive(Debug)]
pub enum Registry {
    /// An OCI directory layout on local disk.
    Local(LocalRegistry),
    /// A Docker-style registry over HTTP.
    Remote(RemoteRegistry),
}

/// The local variant: a [`BlobDir`].
#[derive(Debug)]
pub struct LocalRegistry {
    blobs: BlobDir,
}

/// The remote variant: one HTTP session per registry.
///
/// The session (and its bearer token, once fetched) may be shared across
/// concurrent transfer tasks.
pub struct RemoteRegistry {
    base: reqwest::Url,
    client: reqwest::Client,
    token: Mutex<Option<String>>,
}

impl Debug for RemoteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRegistry")
            .field("base", &self.base.as_str())
            .finish()
    }
}

/// A parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

/// Parse a `Bearer realm="…", service="…", scope="…"` challenge. Any other
/// scheme is not supported.
fn parse_bearer_challenge(header: &str) -> Result<BearerChallenge> {
    let header = header.trim();
    let params = match header.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest,
        _ => {
            let scheme = header.split_whitespace().next().unwrap_or(header);
            return Err(Error::NotSupported(format!("auth scheme {scheme:?}")).into());
        }
    };
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in params.split(',') {
        let Some((k, v)) = part.trim().split_once('=') else {
            continue;
        };
        let v = v.trim().trim_matches('"').to_owned();
        match k.trim() {
            "realm" => realm = Some(v),
            "service" => service = Some(v),
            "scope" => scope = Some(v),
            _ => {}
        }
    }
    let realm =
        realm.ok_or_else(|| Error::InvalidArgument("Bearer challenge without realm".into()))?;
    Ok(BearerChallenge {
        realm,
        service,
        scope,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

impl Registry {
    /// Open (or, when `writable`, initialize) a local registry.
    pub fn new_local(dir: Dir, writable: bool) -> Result<Self> {
        Ok(Registry::Local(LocalRegistry {
            blobs: BlobDir::open(dir, writable)?,
        }))
    }

    /// Create a session against a remote registry base URL.
    pub fn new_remote(url: &str) -> Result<Self> {
        let mut base = reqwest::Url::parse(url)
            .map_err(|e| Error::InvalidArgument(format!("url {url:?}: {e}")))?;
        // Relative joins below require a directory-style base
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::InvalidArgument(format!("url scheme {:?}", base.scheme())).into());
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("sandpak/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(HTTP_TIMEOUT)
            .read_timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Registry::Remote(RemoteRegistry {
            base,
            client,
            token: Mutex::new(None),
        }))
    }

    /// The underlying blob store of a local registry.
    pub fn as_local(&self) -> Option<&BlobDir> {
        match self {
            Registry::Local(l) => Some(&l.blobs),
            Registry::Remote(_) => None,
        }
    }

    /// Load the image index.
    pub async fn load_index(&self) -> Result<Index> {
        match self {
            Registry::Local(l) => l.blobs.load_index(),
            Registry::Remote(r) => r.load_index().await,
        }
    }

    /// Save the image index; rejected for remote registries.
    pub fn save_index(&self, index: &Index) -> Result<()> {
        match self {
            Registry::Local(l) => l.blobs.save_index(index),
            Registry::Remote(_) => {
                Err(Error::NotSupported("write to remote registry".into()).into())
            }
        }
    }

    /// Load and digest-verify a versioned manifest, returning it along with
    /// the exact body bytes (manifest digests are computed over these, never
    /// over a re-serialized value).
    #[context("Loading manifest {digest}")]
    pub async fn load_manifest(
        &self,
        repo: Option<&str>,
        digest: &Digest,
    ) -> Result<(Manifest, Vec<u8>)> {
        let body = self.fetch_verified(repo, true, digest).await?;
        let manifest: Manifest = serde_json::from_slice(&body)
            .map_err(|e| Error::Corrupted(format!("manifest {digest}: {e}")))?;
        if manifest.schema_version != 2 {
            return Err(Error::Corrupted(format!(
                "manifest {digest}: schemaVersion {}",
                manifest.schema_version
            ))
            .into());
        }
        Ok((manifest, body))
    }

    /// Load and digest-verify an image config.
    #[context("Loading config {digest}")]
    pub async fn load_config(&self, repo: Option<&str>, digest: &Digest) -> Result<ImageConfig> {
        let body = self.fetch_verified(repo, false, digest).await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::Corrupted(format!("config {digest}: {e}")).into())
    }

    /// Fetch a small blob fully into memory, verifying its digest.
    pub async fn fetch_verified(
        &self,
        repo: Option<&str>,
        is_manifest: bool,
        digest: &Digest,
    ) -> Result<Vec<u8>> {
        match self {
            Registry::Local(l) => l.blobs.read_blob(digest),
            Registry::Remote(r) => {
                let body = r.get_bytes(repo, is_manifest, digest).await?;
                let actual = sha256_of_bytes(&body)?;
                if actual != *digest {
                    return Err(
                        Error::Corrupted(format!("{digest} has content {actual}")).into()
                    );
                }
                Ok(body)
            }
        }
    }

    /// Obtain a seekable descriptor for a blob. Local registries open the
    /// file directly; remote registries fetch into an unlinked temporary,
    /// verify the digest, rewind and return it.
    #[context("Downloading blob {digest}")]
    pub async fn download_blob(
        &self,
        repo: Option<&str>,
        is_manifest: bool,
        digest: &Digest,
        progress: Progress<'_>,
    ) -> Result<std::fs::File> {
        match self {
            Registry::Local(l) => {
                let (f, size) = l.blobs.open_blob(digest)?;
                if let Some(p) = progress {
                    p(size, size);
                }
                Ok(f.into_std())
            }
            Registry::Remote(r) => {
                let mut f = tempfile::tempfile()?;
                let actual = r
                    .get_streaming(repo, is_manifest, digest, &mut f, progress)
                    .await?;
                if actual != *digest {
                    return Err(
                        Error::Corrupted(format!("{digest} has content {actual}")).into()
                    );
                }
                f.seek(SeekFrom::Start(0))?;
                Ok(f)
            }
        }
    }

    /// Copy a blob from this registry into `dest`. A blob already present at
    /// the destination is a fast-exit success.
    #[context("Mirroring blob {digest}")]
    pub async fn mirror_blob(
        &self,
        dest: &BlobDir,
        repo: Option<&str>,
        is_manifest: bool,
        digest: &Digest,
        progress: Progress<'_>,
    ) -> Result<()> {
        if dest.contains(digest)? {
            if let Some(p) = progress {
                p(0, 0);
            }
            return Ok(());
        }
        let mut src = self
            .download_blob(repo, is_manifest, digest, progress)
            .await?;
        dest.store_from_reader(digest, &mut src)?;
        Ok(())
    }

    /// Begin writing a new layer; rejected for remote registries.
    pub fn write_layer(&self) -> Result<LayerWriter<'_>> {
        match self {
            Registry::Local(l) => l.blobs.layer_writer(),
            Registry::Remote(_) => {
                Err(Error::NotSupported("write to remote registry".into()).into())
            }
        }
    }

    /// Fetch a bearer token for the addressed manifest. Local registries
    /// return the empty token.
    #[context("Fetching registry token")]
    pub async fn get_token(
        &self,
        repo: &str,
        digest: &Digest,
        basic_auth: Option<(&str, &str)>,
    ) -> Result<String> {
        match self {
            Registry::Local(_) => Ok(String::new()),
            Registry::Remote(r) => r.get_token(repo, digest, basic_auth).await,
        }
    }
}

impl RemoteRegistry {
    fn object_url(&self, repo: Option<&str>, is_manifest: bool, digest: &Digest) -> Result<reqwest::Url> {
        let repo = repo.ok_or_else(|| {
            Error::InvalidArgument("remote registry access requires a repository".into())
        })?;
        let kind = if is_manifest { "manifests" } else { "blobs" };
        self.base
            .join(&format!("v2/{repo}/{kind}/{digest}"))
            .map_err(|e| anyhow!("Building URL: {e}"))
    }

    fn bearer(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    fn request(&self, method: reqwest::Method, url: reqwest::Url, is_manifest: bool) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        if is_manifest {
            req = req.header(reqwest::header::ACCEPT, MANIFEST_ACCEPT);
        }
        if let Some(token) = self.bearer().filter(|t| !t.is_empty()) {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn load_index(&self) -> Result<Index> {
        let url = self.base.join("index.json")?;
        let resp = self
            .request(reqwest::Method::GET, url, false)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn get_bytes(
        &self,
        repo: Option<&str>,
        is_manifest: bool,
        digest: &Digest,
    ) -> Result<Vec<u8>> {
        let url = self.object_url(repo, is_manifest, digest)?;
        let resp = self
            .request(reqwest::Method::GET, url, is_manifest)
            .send()
            .await?;
        let resp = status_to_error(resp, digest)?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn get_streaming(
        &self,
        repo: Option<&str>,
        is_manifest: bool,
        digest: &Digest,
        out: &mut impl Write,
        progress: Progress<'_>,
    ) -> Result<Digest> {
        let url = self.object_url(repo, is_manifest, digest)?;
        let resp = self
            .request(reqwest::Method::GET, url, is_manifest)
            .send()
            .await?;
        let mut resp = status_to_error(resp, digest)?;
        let total = resp.content_length().unwrap_or(0);
        let mut w = Sha256Writer::new(out)?;
        let mut fetched = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            w.write_all(&chunk)?;
            fetched += chunk.len() as u64;
            if let Some(p) = progress {
                p(fetched, total);
            }
        }
        let (actual, _, out) = w.finish()?;
        out.flush()?;
        Ok(actual)
    }

    async fn get_token(
        &self,
        repo: &str,
        digest: &Digest,
        basic_auth: Option<(&str, &str)>,
    ) -> Result<String> {
        let url = self.object_url(Some(repo), true, digest)?;
        let head = self
            .client
            .request(reqwest::Method::HEAD, url)
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await?;
        if head.status() != reqwest::StatusCode::UNAUTHORIZED {
            head.error_for_status()?;
            // Anonymous access
            return Ok(String::new());
        }
        let challenge = head
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::InvalidArgument("401 without WWW-Authenticate".into()))?;
        let challenge = parse_bearer_challenge(challenge)?;
        let mut auth_url = reqwest::Url::parse(&challenge.realm)
            .map_err(|e| Error::InvalidArgument(format!("realm {:?}: {e}", challenge.realm)))?;
        {
            let mut q = auth_url.query_pairs_mut();
            if let Some(service) = &challenge.service {
                q.append_pair("service", service);
            }
            let scope = challenge
                .scope
                .clone()
                .unwrap_or_else(|| format!("repository:{repo}:pull"));
            q.append_pair("scope", &scope);
        }
        let mut req = self.client.get(auth_url);
        if let Some((user, password)) = basic_auth {
            req = req.basic_auth(user, Some(password));
        }
        let resp: TokenResponse = req
            .send()
            .await?
            .error_for_status()
            .context("Token endpoint")?
            .json()
            .await
            .context("Parsing token response")?;
        *self.token.lock().unwrap() = Some(resp.token.clone());
        Ok(resp.token)
    }
}

fn status_to_error(resp: reqwest::Response, digest: &Digest) -> Result<reqwest::Response> {
    match resp.status() {
        reqwest::StatusCode::NOT_FOUND => Err(Error::NotFound(digest.to_string()).into()),
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
            Err(Error::PermissionDenied(format!("fetching {digest}")).into())
        }
        _ => Ok(resp.error_for_status()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::error_kind;
    use cap_std_ext::{cap_std, cap_tempfile};

    #[test]
    fn bearer_challenge_parse() {
        let c = parse_bearer_challenge(
            r#"Bearer realm="https://auth.example/v2/token", service="registry", scope="repository:library/app:pull""#,
        )
        .unwrap();
        assert_eq!(c.realm, "https://auth.example/v2/token");
        assert_eq!(c.service.as_deref(), Some("registry"));
        assert_eq!(c.scope.as_deref(), Some("repository:library/app:pull"));

        // Scope may be omitted; the caller defaults it
        let c = parse_bearer_challenge(r#"Bearer realm="https://auth.example/t""#).unwrap();
        assert_eq!(c.scope, None);

        // Only Bearer is accepted
        let e = parse_bearer_challenge(r#"Basic realm="x""#).unwrap_err();
        assert!(matches!(error_kind(&e), Some(Error::NotSupported(_))));

        let e = parse_bearer_challenge("Bearer service=\"x\"").unwrap_err();
        assert!(matches!(error_kind(&e), Some(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn local_registry_roundtrip() -> Result<()> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let reg = Registry::new_local(td.try_clone()?, true)?;
        let blobs = reg.as_local().unwrap();

        // Store a manifest as exact bytes, load it back typed
        let config_digest = blobs.store_bytes(br#"{"a":1}"#)?;
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": crate::oci::OCI_TYPE_CONFIG,
                "digest": config_digest.as_str(),
                "size": 7,
            },
            "layers": [],
        });
        let body = serde_json::to_vec(&manifest)?;
        let mdigest = blobs.store_bytes(&body)?;
        let (m, raw) = reg.load_manifest(None, &mdigest).await?;
        assert_eq!(raw, body);
        assert_eq!(m.config.digest, config_digest);

        // Token for local is empty
        assert_eq!(reg.get_token("any", &mdigest, None).await?, "");
        Ok(())
    }

    #[tokio::test]
    async fn manifest_digest_mismatch_is_corruption() -> Result<()> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let reg = Registry::new_local(td.try_clone()?, true)?;
        let blobs = reg.as_local().unwrap();
        let d = blobs.store_bytes(b"{}")?;
        // Tamper on disk: same path, different bytes
        td.write(format!("blobs/sha256/{}", d.sha256_hex()), b"{ }")?;
        let e = reg.load_manifest(None, &d).await.unwrap_err();
        assert!(matches!(error_kind(&e), Some(Error::Corrupted(_))));
        Ok(())
    }

    #[tokio::test]
    async fn mirror_between_local_registries() -> Result<()> {
        let src_td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let dst_td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let src = Registry::new_local(src_td.try_clone()?, true)?;
        let dst = BlobDir::open(dst_td.try_clone()?, true)?;
        let d = src.as_local().unwrap().store_bytes(b"layer bytes")?;
        src.mirror_blob(&dst, None, false, &d, None).await?;
        assert!(dst.contains(&d)?);
        // Second mirror is the fast path
        src.mirror_blob(&dst, None, false, &d, None).await?;
        Ok(())
    }

    #[test]
    fn remote_rejects_writes() {
        let reg = Registry::new_remote("https://registry.example.com/").unwrap();
        let e = reg.save_index(&Index::default()).unwrap_err();
        assert!(matches!(error_kind(&e), Some(Error::NotSupported(_))));
        let e = reg.write_layer().unwrap_err();
        assert!(matches!(error_kind(&e), Some(Error::NotSupported(_))));
    }

    #[test]
    fn remote_url_validation() {
        assert!(Registry::new_remote("ftp://x").is_err());
        assert!(Registry::new_remote("not a url").is_err());
        assert!(Registry::new_remote("https://registry.example.com").is_ok());
    }
}
