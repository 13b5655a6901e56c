//! Pulling refs from a registry into the local repo.
//!
//! Resolution goes through the remote's image index (for OCI remotes the
//! index is the ref summary): each wanted ref maps to a manifest descriptor
//! via its ref annotation. The pipeline then fetches manifest and config
//! (digest-verified), enforces the remote's signature policy, mirrors layer
//! blobs concurrently, unpacks them into repo objects, synthesizes the
//! commit, and only after everything referenced is present moves the ref.

use std::collections::BTreeMap;
use std::io::Read;

use anyhow::{Context, Result};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::cap_tempfile;
use fn_error_context::context;
use cap_std_ext::cap_std::fs::PermissionsExt;
use futures_util::{stream, TryStreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::RemoteConfig;
use crate::digest::{Digest, Sha256Reader};
use crate::errors::Error;
use crate::oci::{
    self, ImageConfig, Manifest, LABEL_METADATA, LABEL_REF, LABEL_SIGNATURE_DIGEST,
};
use crate::refspec::Ref;
use crate::registry::{Progress, Registry};
use crate::repo::{Commit, Repo};
use crate::sign;

/// Options for a pull.
#[derive(Debug, Default)]
pub struct PullOptions {
    /// Restrict fetched content to `/metadata` plus these `/files/...`
    /// subtrees. Static deltas are never consulted for a restricted pull;
    /// they assume whole-tree coverage.
    pub subpaths: Vec<String>,
    /// Basic auth for the token endpoint.
    pub basic_auth: Option<(String, String)>,
}

/// Result of pulling one ref.
#[derive(Debug)]
pub struct PulledRef {
    /// The ref.
    pub ref_: Ref,
    /// The commit now recorded for it.
    pub commit: Digest,
    /// Whether anything had to be fetched.
    pub changed: bool,
}

/// Open a registry session for a remote URL. `http(s)` URLs get an HTTP
/// session; everything else is treated as a local layout path (`file://`
/// prefix or plain path).
pub fn registry_for_url(url: &str) -> Result<Registry> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Registry::new_remote(url)
    } else {
        let path = url.strip_prefix("file://").unwrap_or(url);
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())
            .with_context(|| format!("Opening registry {path}"))?;
        Registry::new_local(dir, false)
    }
}

/// The Docker-side repository name a descriptor's blobs live under.
///
/// Docker repository components must be lowercase; the publisher may pin an
/// explicit name via annotation, otherwise we derive it from the ref id.
fn repository_for(desc: &crate::oci::Descriptor, r: &Ref) -> String {
    if let Some(explicit) = desc.annotation("org.flatpak.oci-repository") {
        return explicit.to_owned();
    }
    r.id.to_lowercase()
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        anyhow::bail!("Operation was cancelled");
    }
    Ok(())
}

/// Pull a set of refs from `remote` into `repo`.
///
/// Refs are updated one at a time, each only after its transitive objects
/// are all present; a failure (including signature rejection) leaves every
/// previously recorded `(remote, ref)` untouched.
#[context("Pulling from {}", remote.name)]
pub async fn pull(
    repo: &Repo,
    remote: &RemoteConfig,
    keyring: Option<&[u8]>,
    refs: &[Ref],
    opts: &PullOptions,
    progress: Progress<'_>,
    cancel: &CancellationToken,
) -> Result<Vec<PulledRef>> {
    let registry = registry_for_url(&remote.url)?;
    let index = registry.load_index().await?;
    let mut out = Vec::with_capacity(refs.len());
    for r in refs {
        check_cancelled(cancel)?;
        let pulled = pull_one(repo, remote, keyring, &registry, &index, r, opts, progress, cancel)
            .await
            .with_context(|| format!("Pulling {}:{r}", remote.name))?;
        out.push(pulled);
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
async fn pull_one(
    repo: &Repo,
    remote: &RemoteConfig,
    keyring: Option<&[u8]>,
    registry: &Registry,
    index: &crate::oci::Index,
    r: &Ref,
    opts: &PullOptions,
    progress: Progress<'_>,
    cancel: &CancellationToken,
) -> Result<PulledRef> {
    let ref_name = r.to_string();
    let desc = index
        .manifest_for_ref(&ref_name)
        .ok_or_else(|| Error::NotFound(ref_name.clone()))?;
    let repository = repository_for(desc, r);
    let repository = Some(repository.as_str());

    // Authenticate up front so the transfer tasks share the session token.
    let auth = opts
        .basic_auth
        .as_ref()
        .map(|(u, p)| (u.as_str(), p.as_str()));
    registry
        .get_token(repository.unwrap_or_default(), &desc.digest, auth)
        .await?;

    check_cancelled(cancel)?;
    let (manifest, _manifest_bytes) = registry.load_manifest(repository, &desc.digest).await?;

    if remote.gpg_verify {
        verify_manifest_signature(remote, keyring, registry, desc, repository, &ref_name).await?;
    }

    check_cancelled(cancel)?;
    let config = registry
        .load_config(repository, &manifest.config.digest)
        .await?;
    let labeled_ref = config.require_label(LABEL_REF)?;
    if labeled_ref != ref_name {
        return Err(Error::Untrusted(format!(
            "image is labeled {labeled_ref}, expected {ref_name}"
        ))
        .into());
    }

    // One transfer task per layer blob; already-present blobs fast-exit.
    let mut changed = false;
    for l in &manifest.layers {
        if !repo.blobs().contains(&l.digest)? {
            changed = true;
        }
    }
    check_cancelled(cancel)?;
    let concurrency = std::thread::available_parallelism()?.get();
    stream::iter(manifest.layers.iter().map(Ok::<_, anyhow::Error>))
        .try_for_each_concurrent(concurrency, |layer| async move {
            registry
                .mirror_blob(repo.blobs(), repository, false, &layer.digest, progress)
                .await
        })
        .await?;

    check_cancelled(cancel)?;
    let tree = unpack_layers(repo, &manifest, &config, &opts.subpaths)?;
    let prior = repo.try_resolve(&remote.name, r)?;
    // An unchanged tree resolves to the prior commit; only new content
    // makes a new commit with the prior as parent.
    if let Some(p) = &prior {
        if repo.blobs().contains(p)? && repo.read_commit(p)?.tree == tree {
            tracing::debug!("no changes in {}:{ref_name}", remote.name);
            return Ok(PulledRef {
                ref_: r.clone(),
                commit: p.clone(),
                changed,
            });
        }
    }
    let commit = synthesize_commit(repo, r, &config, tree, prior)?;
    changed = true;
    repo.set_ref(&remote.name, r, Some(&commit))?;
    tracing::debug!("pulled {}:{ref_name} -> {commit}", remote.name);
    Ok(PulledRef {
        ref_: r.clone(),
        commit,
        changed,
    })
}

async fn verify_manifest_signature(
    remote: &RemoteConfig,
    keyring: Option<&[u8]>,
    registry: &Registry,
    desc: &crate::oci::Descriptor,
    repository: Option<&str>,
    ref_name: &str,
) -> Result<()> {
    let keyring = keyring.ok_or_else(|| {
        Error::Untrusted(format!("remote {} has no trusted keyring", remote.name))
    })?;
    let sig_digest = desc
        .annotation(LABEL_SIGNATURE_DIGEST)
        .ok_or_else(|| Error::Untrusted(format!("{ref_name} is not signed")))?;
    let sig_digest = Digest::parse(sig_digest)?;
    let signed = registry
        .fetch_verified(repository, false, &sig_digest)
        .await?;
    let verified = sign::verify(&signed, keyring)?;
    let reference = format!("{}:{ref_name}", remote.name);
    sign::check_payload(&verified.payload, &reference, &desc.digest)?;
    tracing::debug!(
        "signature for {reference} valid (key {})",
        verified.key_fingerprint
    );
    Ok(())
}

/// Unpack the manifest's layers (in apply order) into a staging directory,
/// verifying each layer's diff-id, then import the result as tree objects.
#[context("Unpacking layers")]
fn unpack_layers(
    repo: &Repo,
    manifest: &Manifest,
    config: &ImageConfig,
    subpaths: &[String],
) -> Result<Digest> {
    if manifest.layers.len() != config.rootfs.diff_ids.len() {
        return Err(Error::Corrupted(format!(
            "manifest has {} layers but config lists {} diff-ids",
            manifest.layers.len(),
            config.rootfs.diff_ids.len()
        ))
        .into());
    }
    let staging = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
    for (layer, diff_id) in manifest.layers.iter().zip(&config.rootfs.diff_ids) {
        let (blob, _) = repo.blobs().open_blob(&layer.digest)?;
        let gz = flate2::read::GzDecoder::new(blob);
        let mut counted = Sha256Reader::new(gz)?;
        extract_tar(&mut counted, &staging, subpaths)
            .with_context(|| format!("Layer {}", layer.digest))?;
        // Drain trailing tar padding so the rolling digest covers the
        // whole uncompressed stream.
        std::io::copy(&mut counted, &mut std::io::sink())?;
        let (actual, _) = counted.finish()?;
        if actual != *diff_id {
            return Err(Error::Corrupted(format!(
                "layer {} has diff-id {actual}, expected {diff_id}",
                layer.digest
            ))
            .into());
        }
    }
    let (tree, _) = repo.write_tree_from_dir(&staging)?;
    Ok(tree)
}

/// Extract a tar stream into `dest`, restricted by the subpath filter.
fn extract_tar(r: impl Read, dest: &Dir, subpaths: &[String]) -> Result<()> {
    let mut archive = tar::Archive::new(r);
    archive.set_overwrite(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;
        let Some(path) = path.to_str().map(|s| s.trim_matches('/').to_owned()) else {
            continue;
        };
        if path.is_empty() || path.split('/').any(|c| c == "..") {
            continue;
        }
        if !subpath_includes(subpaths, &path) {
            continue;
        }
        let header = entry.header();
        match header.entry_type() {
            tar::EntryType::Directory => {
                dest.create_dir_all(&path)?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = std::path::Path::new(&path).parent() {
                    if !parent.as_os_str().is_empty() {
                        dest.create_dir_all(parent)?;
                    }
                }
                let mode = header.mode()? & 0o7777;
                let mut f = dest.create(&path)?;
                std::io::copy(&mut entry, &mut f)?;
                drop(f);
                dest.set_permissions(
                    &path,
                    cap_std::fs::Permissions::from_mode(mode),
                )?;
            }
            tar::EntryType::Symlink => {
                let target = header
                    .link_name()?
                    .and_then(|t| t.to_str().map(|s| s.to_owned()))
                    .ok_or_else(|| Error::Corrupted(format!("symlink {path} without target")))?;
                if let Some(parent) = std::path::Path::new(&path).parent() {
                    if !parent.as_os_str().is_empty() {
                        dest.create_dir_all(parent)?;
                    }
                }
                match dest.remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                dest.symlink(&target, &path)?;
            }
            // Hard links, devices etc. do not occur in our images
            other => {
                tracing::debug!("skipping tar entry {path} of type {other:?}");
            }
        }
    }
    Ok(())
}

/// Whether a tar member path survives the subpath restriction; the rule is
/// `/metadata` plus the listed `/files/...` subtrees.
fn subpath_includes(subpaths: &[String], path: &str) -> bool {
    if subpaths.is_empty() {
        return true;
    }
    let path = format!("/{path}");
    let mut allowed = vec!["/metadata".to_string()];
    for s in subpaths {
        let s = s.trim_end_matches('/');
        let s = if s.starts_with('/') {
            s.to_owned()
        } else {
            format!("/{s}")
        };
        allowed.push(format!("/files{s}"));
    }
    for a in &allowed {
        if path == *a || path.starts_with(&format!("{a}/")) {
            return true;
        }
        // Ancestors of an allowed path are needed to hold it
        if a.starts_with(&format!("{path}/")) {
            return true;
        }
    }
    false
}

/// Build the commit object binding the pulled content to the ref.
fn synthesize_commit(
    repo: &Repo,
    r: &Ref,
    config: &ImageConfig,
    tree: Digest,
    parent: Option<Digest>,
) -> Result<Digest> {
    let mut metadata: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    if let Some(raw) = config.label(LABEL_METADATA) {
        metadata.insert("xa.metadata".into(), raw.into());
    }
    if let Some(v) = config.size_label(oci::LABEL_INSTALLED_SIZE)? {
        metadata.insert("xa.installed-size".into(), v.into());
    }
    if let Some(v) = config.size_label(oci::LABEL_DOWNLOAD_SIZE)? {
        metadata.insert("xa.download-size".into(), v.into());
    }
    for (k, v) in config.commit_metadata()? {
        metadata.insert(k, oci::encode_commit_metadata_value(&v).into());
    }
    let commit = Commit {
        ref_name: r.to_string(),
        tree,
        parent,
        timestamp: config.created.map(|t| t.timestamp()).unwrap_or(0),
        subject: format!("Import of {r}"),
        body: String::new(),
        metadata,
    };
    repo.write_commit(&commit)
}
