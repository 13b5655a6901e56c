//! Static delta generation for published repos.
//!
//! For each ref commit C with parent P we maintain a `from-empty` delta
//! (everything needed to materialize C) and a `from-parent` delta (the
//! objects in C that P does not already have). Delta directories are
//! addressed by base64-URL of the binary commit digest, with the first two
//! characters split off as a directory component. Deltas present on disk
//! but no longer wanted are deleted.

use std::collections::BTreeSet;
use std::io::Write;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use camino::Utf8PathBuf;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::ocidir::to_canonical_json;
use crate::refspec::Ref;
use crate::repo::Repo;

/// Directory under the repo root holding deltas.
pub const DELTAS_DIR: &str = "deltas";

/// The `superblock` header written into every delta directory.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaSuperblock {
    /// Source commit; absent for a from-empty delta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Digest>,
    /// Target commit.
    pub to: Digest,
    /// The ref the target commit belongs to.
    #[serde(rename = "ref")]
    pub ref_name: String,
    /// Number of objects in the payload.
    pub objects: u64,
}

fn b64(digest: &Digest) -> String {
    URL_SAFE_NO_PAD.encode(digest.to_bytes())
}

/// Relative path of a delta directory under the repo root.
pub fn delta_path(from: Option<&Digest>, to: &Digest) -> Utf8PathBuf {
    let to64 = b64(to);
    match from {
        None => {
            let (head, rest) = to64.split_at(2);
            Utf8PathBuf::from(DELTAS_DIR).join(head).join(rest)
        }
        Some(from) => {
            let from64 = b64(from);
            let (head, rest) = from64.split_at(2);
            Utf8PathBuf::from(DELTAS_DIR)
                .join(head)
                .join(format!("{rest}-{to64}"))
        }
    }
}

/// Outcome of a delta generation run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeltaStats {
    /// Deltas newly written.
    pub generated: u64,
    /// Stale delta directories removed.
    pub deleted: u64,
    /// Wanted deltas that already existed.
    pub reused: u64,
}

#[derive(Debug, Clone)]
struct DeltaSpec {
    ref_name: String,
    from: Option<Digest>,
    to: Digest,
}

/// Regenerate the delta set for `wanted` ref commits, parallelized across
/// one worker task per available CPU. Deltas for commit pairs not in the
/// wanted set are deleted.
#[context("Generating deltas")]
pub async fn generate_deltas(repo: &Repo, wanted: &[(Ref, Digest)]) -> Result<DeltaStats> {
    let mut specs = Vec::new();
    for (r, commit) in wanted {
        specs.push(DeltaSpec {
            ref_name: r.to_string(),
            from: None,
            to: commit.clone(),
        });
        let c = repo.read_commit(commit)?;
        if let Some(parent) = c.parent {
            // A from-parent delta only makes sense while the parent's
            // objects are still around to diff against.
            if repo.blobs().contains(&parent)? {
                specs.push(DeltaSpec {
                    ref_name: r.to_string(),
                    from: Some(parent),
                    to: commit.clone(),
                });
            }
        }
    }

    let mut stats = DeltaStats {
        deleted: delete_unwanted(repo, &specs)?,
        ..Default::default()
    };

    let mut todo = Vec::new();
    for spec in specs {
        let path = delta_path(spec.from.as_ref(), &spec.to);
        if repo.dir().try_exists(&path)? {
            stats.reused += 1;
        } else {
            todo.push(spec);
        }
    }
    if todo.is_empty() {
        return Ok(stats);
    }

    let workers = std::thread::available_parallelism()?.get().min(todo.len());
    let chunk_size = todo.len().div_ceil(workers);
    let mut handles = Vec::with_capacity(workers);
    for chunk in todo.chunks(chunk_size) {
        let chunk = chunk.to_vec();
        let repo = repo.try_clone()?;
        handles.push(tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut n = 0;
            for spec in chunk {
                write_delta(&repo, &spec)?;
                n += 1;
            }
            Ok(n)
        }));
    }
    for handle in handles {
        stats.generated += handle.await.context("Joining delta worker")??;
    }
    Ok(stats)
}

/// Remove delta directories not named by any wanted spec.
fn delete_unwanted(repo: &Repo, specs: &[DeltaSpec]) -> Result<u64> {
    let wanted: BTreeSet<Utf8PathBuf> = specs
        .iter()
        .map(|s| delta_path(s.from.as_ref(), &s.to))
        .collect();
    let mut deleted = 0;
    let Some(deltas) = repo.dir().open_dir_optional(DELTAS_DIR)? else {
        return Ok(0);
    };
    for head in deltas.entries()? {
        let head = head?;
        let head_name = head.file_name();
        let Some(head_name) = head_name.to_str() else {
            continue;
        };
        if !head.file_type()?.is_dir() {
            continue;
        }
        let head_dir = deltas.open_dir(head_name)?;
        for ent in head_dir.entries()? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(name) = name.to_str() else { continue };
            let rel = Utf8PathBuf::from(DELTAS_DIR).join(head_name).join(name);
            if !wanted.contains(&rel) {
                head_dir.remove_all_optional(name)?;
                deleted += 1;
            }
        }
    }
    Ok(deleted)
}

/// Write one delta directory: `superblock` plus payload part `0`, a gzip
/// tar of the member objects. The directory appears atomically via a
/// staged rename.
#[context("Writing delta for {}", spec.to)]
fn write_delta(repo: &Repo, spec: &DeltaSpec) -> Result<()> {
    let mut objects = BTreeSet::new();
    repo.collect_commit_objects(&spec.to, &mut objects, false)?;
    if let Some(from) = &spec.from {
        let mut parent_objects = BTreeSet::new();
        repo.collect_commit_objects(from, &mut parent_objects, true)?;
        objects = objects.difference(&parent_objects).cloned().collect();
        // The target commit object itself always rides along
        objects.insert(spec.to.clone());
    }

    let final_path = delta_path(spec.from.as_ref(), &spec.to);
    let parent = final_path.parent().expect("delta path has parent");
    repo.dir().create_dir_all(parent)?;
    let staging = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    repo.dir().create_dir(&staging)?;

    let r = (|| -> Result<()> {
        let superblock = DeltaSuperblock {
            from: spec.from.clone(),
            to: spec.to.clone(),
            ref_name: spec.ref_name.clone(),
            objects: objects.len() as u64,
        };
        let staging_dir = repo.dir().open_dir(&staging)?;
        staging_dir.write("superblock", to_canonical_json(&superblock)?)?;

        let part = staging_dir.create("0")?;
        let gz = flate2::write::GzEncoder::new(part, flate2::Compression::default());
        let mut tarw = tar::Builder::new(gz);
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
        let gz = tarw.into_inner()?;
        let mut part = gz.finish()?;
        part.flush()?;
        Ok(())
    })();
    if let Err(e) = r {
        let _ = repo.dir().remove_all_optional(&staging);
        return Err(e);
    }
    repo.dir().rename(&staging, repo.dir(), &final_path)?;
    tracing::debug!("wrote delta {final_path}");
    Ok(())
}
