//! Single-file offline bundles: a from-empty static delta framed in a tar
//! stream behind a metadata header.
//!
//! Layout of the stream: a `superblock` JSON header, an optional
//! `signature` (OpenPGP signed message), then one `objects/<hex>` entry per
//! member object. Import stages every object into the repo (all placement
//! is content-addressed, so a failed import leaves refs untouched), checks
//! the header metadata byte-exactly against the metadata inside the applied
//! commit, enforces the signature when required, and only then records the
//! ref.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::errors::Error;
use crate::ocidir::to_canonical_json;
use crate::refspec::Ref;
use crate::repo::{Repo, TreeNode};
use crate::sign;

/// The bundle header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSuperblock {
    /// The ref the bundle carries.
    #[serde(rename = "ref")]
    pub ref_: Ref,
    /// The commit being shipped.
    pub commit: Digest,
    /// URL of the remote this was exported from, for later updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Collection identifier of the origin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    /// Byte-exact copy of the commit's `/metadata` file.
    pub metadata: String,
}

/// Signing configuration for an exported bundle.
#[derive(Debug)]
pub struct BundleSignOptions<'a> {
    /// Key ids to sign with.
    pub key_ids: &'a [String],
    /// GPG home holding the secret keys.
    pub homedir: Option<&'a Utf8Path>,
}

/// Read the commit's `/metadata` file out of the object store.
fn commit_metadata_bytes(repo: &Repo, commit: &Digest) -> Result<Vec<u8>> {
    let c = repo.read_commit(commit)?;
    let tree = repo.read_tree(&c.tree)?;
    let entry = tree
        .entries
        .iter()
        .find(|e| e.name == "metadata")
        .ok_or_else(|| Error::NotFound(format!("metadata file in commit {commit}")))?;
    match &entry.node {
        TreeNode::File { digest, .. } => repo.blobs().read_blob(digest),
        _ => Err(Error::Corrupted(format!("metadata in {commit} is not a regular file")).into()),
    }
}

fn append_bytes(tarw: &mut tar::Builder<impl Write>, name: &str, buf: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(buf.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    tarw.append_data(&mut header, name, buf)?;
    Ok(())
}

/// Export `commit` as a bundle written to `out`.
#[context("Exporting bundle for {r}")]
pub fn build_bundle(
    repo: &Repo,
    r: &Ref,
    commit: &Digest,
    origin: Option<&str>,
    collection_id: Option<&str>,
    sign_opts: Option<&BundleSignOptions<'_>>,
    out: impl Write,
) -> Result<()> {
    let metadata = commit_metadata_bytes(repo, commit)?;
    let metadata = String::from_utf8(metadata).context("Commit metadata is not UTF-8")?;
    let superblock = BundleSuperblock {
        ref_: r.clone(),
        commit: commit.clone(),
        origin: origin.map(|s| s.to_owned()),
        collection_id: collection_id.map(|s| s.to_owned()),
        metadata,
    };
    let superblock_bytes = to_canonical_json(&superblock)?;

    let mut tarw = tar::Builder::new(out);
    append_bytes(&mut tarw, "superblock", &superblock_bytes)?;

    if let Some(opts) = sign_opts {
        let identity = match collection_id.or(origin) {
            Some(who) => format!("{who}:{r}"),
            None => r.to_string(),
        };
        let payload = sign::SignatureJson::new(&identity, commit);
        let payload_bytes = serde_json::to_vec(&payload)?;
        let signed = sign::sign(&payload_bytes, opts.key_ids, opts.homedir)?;
        append_bytes(&mut tarw, "signature", &signed)?;
    }

    let mut objects = BTreeSet::new();
    repo.collect_commit_objects(commit, &mut objects, false)?;
    for digest in &objects {
        let (mut blob, size) = repo.blobs().open_blob(digest)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        tarw.append_data(
            &mut header,
            format!("objects/{}", digest.sha256_hex()),
            &mut blob,
        )?;
    }
    let mut out = tarw.into_inner()?;
    out.flush()?;
    Ok(())
}

/// Import a bundle stream, recording `(remote, ref)` on success.
///
/// With `require_gpg` the bundle must carry a signature that verifies
/// against `keyring` and binds this exact commit and ref. A header whose
/// metadata does not byte-exactly match the metadata inside the applied
/// commit is rejected as untrusted.
#[context("Importing bundle")]
pub fn pull_from_bundle(
    repo: &Repo,
    f: impl Read,
    remote: &str,
    require_gpg: bool,
    keyring: Option<&[u8]>,
) -> Result<(Ref, Digest)> {
    let mut archive = tar::Archive::new(f);
    let mut superblock: Option<BundleSuperblock> = None;
    let mut signature: Option<Vec<u8>> = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;
        let Some(path) = path.to_str().map(|s| s.to_owned()) else {
            return Err(Error::InvalidArgument("non-UTF-8 bundle member".into()).into());
        };
        match path.as_str() {
            "superblock" => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                superblock =
                    Some(serde_json::from_slice(&buf).context("Parsing bundle superblock")?);
            }
            "signature" => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                signature = Some(buf);
            }
            other => {
                let Some(hex) = other.strip_prefix("objects/") else {
                    tracing::debug!("ignoring bundle member {other}");
                    continue;
                };
                let expected = Digest::from_sha256_hex(hex)?;
                // Placement recomputes the digest; a tampered member fails
                // against its own name.
                repo.blobs().store_from_reader(&expected, &mut entry)?;
            }
        }
    }
    let superblock =
        superblock.ok_or_else(|| Error::InvalidArgument("bundle without superblock".into()))?;
    let r = &superblock.ref_;
    let commit = &superblock.commit;

    // The whole closure must have arrived intact.
    repo.verify_commit(commit)
        .with_context(|| format!("Bundle for {r} is incomplete"))?;

    let deployed_metadata = commit_metadata_bytes(repo, commit)?;
    if deployed_metadata != superblock.metadata.as_bytes() {
        return Err(Error::Untrusted(format!(
            "bundle metadata does not match the metadata in commit {commit}"
        ))
        .into());
    }

    if require_gpg {
        let keyring =
            keyring.ok_or_else(|| Error::Untrusted(format!("no trusted keyring for {remote}")))?;
        let signed = signature
            .ok_or_else(|| Error::Untrusted(format!("bundle for {r} is not signed")))?;
        let verified = sign::verify(&signed, keyring)?;
        let payload = &verified.payload;
        if payload.critical.image.manifest_digest != *commit {
            return Err(Error::Untrusted(format!(
                "bundle signature is for {}, not {commit}",
                payload.critical.image.manifest_digest
            ))
            .into());
        }
        let identity = &payload.critical.identity.reference;
        let ref_name = r.to_string();
        if identity != &ref_name && !identity.ends_with(&format!(":{ref_name}")) {
            return Err(Error::Untrusted(format!(
                "bundle signature identity {identity:?} does not name {ref_name}"
            ))
            .into());
        }
    }

    repo.set_ref(remote, r, Some(commit))?;
    tracing::debug!("imported bundle {remote}:{r} -> {commit}");
    Ok((r.clone(), commit.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::error_kind;
    use cap_std_ext::{cap_std, cap_tempfile};

    fn fixture() -> Result<(cap_tempfile::TempDir, Repo, Ref, Digest)> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let repo = Repo::open(td.try_clone()?, true)?;
        let src = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        crate::repo::tests::populate_app_tree(&src)?;
        let r = Ref::parse("app/org.test.Hello/x86_64/master")?;
        let commit = crate::repo::tests::commit_app(&repo, &src, &r.to_string())?;
        Ok((td, repo, r, commit))
    }

    #[test]
    fn export_import_roundtrip() -> Result<()> {
        let (_td, repo, r, commit) = fixture()?;
        let mut bundle = Vec::new();
        build_bundle(
            &repo,
            &r,
            &commit,
            Some("https://origin.example.com/"),
            None,
            None,
            &mut bundle,
        )?;

        let td2 = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let repo2 = Repo::open(td2.try_clone()?, true)?;
        let (got_ref, got_commit) = pull_from_bundle(&repo2, &bundle[..], "offline", false, None)?;
        assert_eq!(got_ref, r);
        assert_eq!(got_commit, commit);
        assert_eq!(repo2.resolve("offline", &r)?, commit);
        repo2.verify_commit(&commit)?;
        Ok(())
    }

    #[test]
    fn tampered_object_rejected() -> Result<()> {
        let (_td, repo, r, commit) = fixture()?;
        let mut bundle = Vec::new();
        build_bundle(&repo, &r, &commit, None, None, None, &mut bundle)?;
        // Flip a byte inside the hello.sh content object: placement then
        // fails against the member's own name
        let needle = b"echo hello";
        let pos = bundle
            .windows(needle.len())
            .position(|w| w == needle)
            .expect("script bytes present in bundle");
        bundle[pos] ^= 0xff;

        let td2 = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let repo2 = Repo::open(td2.try_clone()?, true)?;
        let e = pull_from_bundle(&repo2, &bundle[..], "offline", false, None).unwrap_err();
        assert!(matches!(error_kind(&e), Some(Error::Corrupted(_))), "{e:#}");
        // And crucially the ref was never recorded
        assert!(repo2.try_resolve("offline", &r)?.is_none());
        Ok(())
    }

    #[test]
    fn missing_signature_rejected_when_required() -> Result<()> {
        let (_td, repo, r, commit) = fixture()?;
        let mut bundle = Vec::new();
        build_bundle(&repo, &r, &commit, None, None, None, &mut bundle)?;
        let td2 = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let repo2 = Repo::open(td2.try_clone()?, true)?;
        let e = pull_from_bundle(&repo2, &bundle[..], "offline", true, Some(b"keyring"))
            .unwrap_err();
        assert!(matches!(error_kind(&e), Some(Error::Untrusted(_))));
        assert!(repo2.try_resolve("offline", &r)?.is_none());
        Ok(())
    }

    #[test]
    fn metadata_mismatch_rejected() -> Result<()> {
        let (_td, repo, r, commit) = fixture()?;
        // Build a bundle whose header lies about the metadata
        let metadata = String::from_utf8(commit_metadata_bytes(&repo, &commit)?)?;
        let superblock = BundleSuperblock {
            ref_: r.clone(),
            commit: commit.clone(),
            origin: None,
            collection_id: None,
            metadata: format!("{metadata}\n[Tampered]\nx=1\n"),
        };
        let mut bundle = Vec::new();
        {
            let mut tarw = tar::Builder::new(&mut bundle);
            append_bytes(&mut tarw, "superblock", &to_canonical_json(&superblock)?)?;
            let mut objects = BTreeSet::new();
            repo.collect_commit_objects(&commit, &mut objects, false)?;
            for digest in &objects {
                let buf = repo.blobs().read_blob(digest)?;
                append_bytes(&mut tarw, &format!("objects/{}", digest.sha256_hex()), &buf)?;
            }
            tarw.finish()?;
        }

        let td2 = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let repo2 = Repo::open(td2.try_clone()?, true)?;
        let e = pull_from_bundle(&repo2, &bundle[..], "offline", false, None).unwrap_err();
        assert!(matches!(error_kind(&e), Some(Error::Untrusted(_))));
        assert!(repo2.try_resolve("offline", &r)?.is_none());
        Ok(())
    }
}
