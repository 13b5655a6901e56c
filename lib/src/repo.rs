//! The per-installation object store: content-addressed commits and trees
//! over a [`BlobDir`], plus the `(remote, ref)` → commit records.
//!
//! Objects are canonical-JSON blobs so their digests are stable: a commit
//! binds a ref to a tree root, a parent, a timestamp and metadata; a tree
//! is an ordered directory listing whose file entries address content
//! blobs.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::{Dir, Permissions, PermissionsExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::errors::Error;
use crate::ocidir::BlobDir;
use crate::refspec::Ref;

const REFS_DIR: &str = "refs";

/// A content-addressed snapshot of a ref at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    /// The ref this commit was made for.
    #[serde(rename = "ref")]
    pub ref_name: String,
    /// Root tree object.
    pub tree: Digest,
    /// Previous commit of the same ref, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Digest>,
    /// UNIX timestamp (seconds).
    pub timestamp: i64,
    /// One-line summary.
    #[serde(default)]
    pub subject: String,
    /// Free-form description.
    #[serde(default)]
    pub body: String,
    /// Metadata: size table, `xa.*` custom keys, the raw `/metadata` file.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// One tree member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Entry name (single path component).
    pub name: String,
    /// What it is.
    #[serde(flatten)]
    pub node: TreeNode,
}

/// The three node kinds a tree can hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeNode {
    /// Regular file content, addressed by blob digest.
    File {
        /// Permission bits.
        mode: u32,
        /// Content size in bytes.
        size: u64,
        /// Content digest.
        digest: Digest,
    },
    /// Subdirectory, addressed by tree object digest.
    Dir {
        /// Subtree digest.
        digest: Digest,
    },
    /// Symbolic link.
    Symlink {
        /// Link target.
        target: String,
    },
}

/// An ordered directory listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tree {
    /// Entries sorted by name.
    pub entries: Vec<TreeEntry>,
}

/// The object store plus ref records.
#[derive(Debug)]
pub struct Repo {
    blobs: BlobDir,
    dir: Dir,
}

/// What `prune` removed and kept.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Number of blobs deleted.
    pub removed: u64,
    /// Number of blobs retained.
    pub kept: u64,
}

impl Repo {
    /// Open the repo at `dir`, initializing the layout when `writable`.
    #[context("Opening repo")]
    pub fn open(dir: Dir, writable: bool) -> Result<Self> {
        let blobs = BlobDir::open(dir.try_clone()?, writable)?;
        if writable {
            dir.create_dir_all(REFS_DIR)?;
        }
        Ok(Self { blobs, dir })
    }

    /// The underlying blob store.
    pub fn blobs(&self) -> &BlobDir {
        &self.blobs
    }

    /// The repo root directory.
    pub fn dir(&self) -> &Dir {
        &self.dir
    }

    /// A second handle to the same repo, e.g. for a worker task.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            blobs: self.blobs.try_clone()?,
            dir: self.dir.try_clone()?,
        })
    }

    /// Store a commit object, returning its digest.
    pub fn write_commit(&self, commit: &Commit) -> Result<Digest> {
        Ok(self.blobs.store_json(commit)?.0)
    }

    /// Load and verify a commit object.
    #[context("Reading commit {digest}")]
    pub fn read_commit(&self, digest: &Digest) -> Result<Commit> {
        let buf = self.blobs.read_blob(digest)?;
        serde_json::from_slice(&buf)
            .map_err(|e| Error::Corrupted(format!("commit {digest}: {e}")).into())
    }

    /// Store a tree object, returning its digest.
    pub fn write_tree(&self, tree: &Tree) -> Result<Digest> {
        Ok(self.blobs.store_json(tree)?.0)
    }

    /// Load and verify a tree object.
    #[context("Reading tree {digest}")]
    pub fn read_tree(&self, digest: &Digest) -> Result<Tree> {
        let buf = self.blobs.read_blob(digest)?;
        serde_json::from_slice(&buf)
            .map_err(|e| Error::Corrupted(format!("tree {digest}: {e}")).into())
    }

    /// Recursively import a directory as tree + content objects, returning
    /// the root tree digest and the total content size.
    #[context("Importing directory tree")]
    pub fn write_tree_from_dir(&self, src: &Dir) -> Result<(Digest, u64)> {
        let mut names = Vec::new();
        for ent in src.entries()? {
            let ent = ent?;
            let name = ent
                .file_name()
                .into_string()
                .map_err(|n| Error::InvalidArgument(format!("non-UTF-8 name {n:?}")))?;
            names.push(name);
        }
        names.sort();
        let mut entries = Vec::with_capacity(names.len());
        let mut total = 0u64;
        for name in names {
            let meta = src.symlink_metadata(&name)?;
            let node = if meta.is_dir() {
                let sub = src.open_dir(&name)?;
                let (digest, size) = self.write_tree_from_dir(&sub)?;
                total += size;
                TreeNode::Dir { digest }
            } else if meta.is_symlink() {
                let target = src.read_link(&name)?;
                let target = target
                    .to_str()
                    .ok_or_else(|| Error::InvalidArgument(format!("non-UTF-8 link in {name}")))?
                    .to_owned();
                TreeNode::Symlink { target }
            } else {
                let f = src.open(&name)?;
                let mode = meta.permissions().mode() & 0o7777;
                let (digest, size) = self.blobs.store_reader(f)?;
                total += size;
                TreeNode::File { mode, size, digest }
            };
            entries.push(TreeEntry { name, node });
        }
        let digest = self.write_tree(&Tree { entries })?;
        Ok((digest, total))
    }

    /// Materialize `commit` into `dest`.
    ///
    /// A non-empty `subpaths` list restricts the checkout to `/metadata`
    /// plus exactly the listed `/files/...` subtrees (each element is a
    /// `/`-prefixed path under the tree root).
    #[context("Checking out commit")]
    pub fn checkout(&self, commit: &Digest, dest: &Dir, subpaths: &[String]) -> Result<()> {
        let commit = self.read_commit(commit)?;
        let filter = CheckoutFilter::new(subpaths);
        self.checkout_tree(&commit.tree, dest, Utf8Path::new("/"), &filter)
    }

    fn checkout_tree(
        &self,
        tree: &Digest,
        dest: &Dir,
        prefix: &Utf8Path,
        filter: &CheckoutFilter,
    ) -> Result<()> {
        let tree = self.read_tree(tree)?;
        for entry in &tree.entries {
            let path = prefix.join(&entry.name);
            match &entry.node {
                TreeNode::Dir { digest } => {
                    let include = filter.check_dir(path.as_str());
                    if include == Include::No {
                        continue;
                    }
                    dest.create_dir(&entry.name)
                        .with_context(|| format!("Creating {path}"))?;
                    let sub = dest.open_dir(&entry.name)?;
                    self.checkout_tree(digest, &sub, &path, filter)?;
                }
                TreeNode::File { mode, digest, .. } => {
                    if !filter.includes_file(path.as_str()) {
                        continue;
                    }
                    let f = dest
                        .create(&entry.name)
                        .with_context(|| format!("Creating {path}"))?;
                    self.blobs.read_blob_to(digest, f)?;
                    dest.set_permissions(&entry.name, Permissions::from_mode(*mode))?;
                }
                TreeNode::Symlink { target } => {
                    if !filter.includes_file(path.as_str()) {
                        continue;
                    }
                    dest.symlink(target, &entry.name)
                        .with_context(|| format!("Creating symlink {path}"))?;
                }
            }
        }
        Ok(())
    }

    fn ref_path(remote: &str, r: &Ref) -> Utf8PathBuf {
        Utf8PathBuf::from(REFS_DIR)
            .join(remote)
            .join(r.deploy_subpath())
    }

    /// The commit recorded for `(remote, ref)`, if any.
    pub fn try_resolve(&self, remote: &str, r: &Ref) -> Result<Option<Digest>> {
        let path = Self::ref_path(remote, r);
        match self.dir.open_optional(&path)? {
            Some(mut f) => {
                let mut buf = String::new();
                f.read_to_string(&mut buf)?;
                Ok(Some(Digest::parse(buf.trim())?))
            }
            None => Ok(None),
        }
    }

    /// The commit recorded for `(remote, ref)`; absent refs fail with
    /// not-found.
    pub fn resolve(&self, remote: &str, r: &Ref) -> Result<Digest> {
        self.try_resolve(remote, r)?
            .ok_or_else(|| Error::NotFound(format!("{remote}:{r}")).into())
    }

    /// Record (or with `None`, delete) the commit for `(remote, ref)`.
    #[context("Updating ref")]
    pub fn set_ref(&self, remote: &str, r: &Ref, commit: Option<&Digest>) -> Result<()> {
        let path = Self::ref_path(remote, r);
        match commit {
            Some(digest) => {
                let parent = path.parent().expect("ref path has parent");
                self.dir.create_dir_all(parent)?;
                self.dir.atomic_write(&path, format!("{digest}\n"))?;
            }
            None => match self.dir.remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    /// Enumerate all recorded `(remote, ref, commit)` triples.
    pub fn list_refs(&self, remote: Option<&str>) -> Result<Vec<(String, Ref, Digest)>> {
        let mut out = Vec::new();
        let Some(refs) = self.dir.open_dir_optional(REFS_DIR)? else {
            return Ok(out);
        };
        for remote_ent in refs.entries()? {
            let remote_ent = remote_ent?;
            let remote_name = remote_ent.file_name();
            let Some(remote_name) = remote_name.to_str() else {
                continue;
            };
            if let Some(only) = remote {
                if only != remote_name {
                    continue;
                }
            }
            if !remote_ent.file_type()?.is_dir() {
                continue;
            }
            let remote_dir = refs.open_dir(remote_name)?;
            let mut stack = vec![(remote_dir, Utf8PathBuf::new())];
            while let Some((d, prefix)) = stack.pop() {
                for ent in d.entries()? {
                    let ent = ent?;
                    let name = ent.file_name();
                    let Some(name) = name.to_str() else { continue };
                    let path = if prefix.as_str().is_empty() {
                        Utf8PathBuf::from(name)
                    } else {
                        prefix.join(name)
                    };
                    if ent.file_type()?.is_dir() {
                        stack.push((d.open_dir(name)?, path));
                    } else if let Ok(r) = Ref::parse(path.as_str()) {
                        let digest = self.resolve(remote_name, &r)?;
                        out.push((remote_name.to_owned(), r, digest));
                    }
                }
            }
        }
        out.sort_by(|a, b| (&a.0, a.1.to_string()).cmp(&(&b.0, b.1.to_string())));
        Ok(out)
    }

    /// Collect the digests transitively referenced by `commit` into `out`.
    ///
    /// With `tolerate_missing`, objects absent from the store (the normal
    /// state after a subpath-restricted pull) are skipped; otherwise absence
    /// is an error.
    pub fn collect_commit_objects(
        &self,
        commit: &Digest,
        out: &mut BTreeSet<Digest>,
        tolerate_missing: bool,
    ) -> Result<()> {
        if !self.blobs.contains(commit)? {
            if tolerate_missing {
                return Ok(());
            }
            return Err(Error::NotFound(commit.to_string()).into());
        }
        out.insert(commit.clone());
        let commit = self.read_commit(commit)?;
        self.collect_tree_objects(&commit.tree, out, tolerate_missing)
    }

    fn collect_tree_objects(
        &self,
        tree: &Digest,
        out: &mut BTreeSet<Digest>,
        tolerate_missing: bool,
    ) -> Result<()> {
        if !self.blobs.contains(tree)? {
            if tolerate_missing {
                return Ok(());
            }
            return Err(Error::NotFound(tree.to_string()).into());
        }
        out.insert(tree.clone());
        let tree = self.read_tree(tree)?;
        for entry in &tree.entries {
            match &entry.node {
                TreeNode::Dir { digest } => {
                    self.collect_tree_objects(digest, out, tolerate_missing)?
                }
                TreeNode::File { digest, .. } => {
                    if self.blobs.contains(digest)? {
                        out.insert(digest.clone());
                    } else if !tolerate_missing {
                        return Err(Error::NotFound(digest.to_string()).into());
                    }
                }
                TreeNode::Symlink { .. } => {}
            }
        }
        Ok(())
    }

    /// Verify every object in the commit's transitive closure against its
    /// digest; missing objects fail with not-found, tampered content with
    /// corruption.
    #[context("Verifying commit {commit}")]
    pub fn verify_commit(&self, commit: &Digest) -> Result<()> {
        let mut objects = BTreeSet::new();
        self.collect_commit_objects(commit, &mut objects, false)?;
        for digest in &objects {
            self.blobs.read_blob_to(digest, std::io::sink())?;
        }
        Ok(())
    }

    /// Delete every blob not reachable from a recorded ref, and sweep
    /// stale temporaries.
    #[context("Pruning repo")]
    pub fn prune(&self) -> Result<PruneStats> {
        let mut reachable = BTreeSet::new();
        for (_, _, commit) in self.list_refs(None)? {
            self.collect_commit_objects(&commit, &mut reachable, true)?;
        }
        let mut stats = PruneStats::default();
        for blob in self.blobs.list_blobs()? {
            if reachable.contains(&blob) {
                stats.kept += 1;
            } else {
                self.blobs.delete_blob(&blob)?;
                stats.removed += 1;
            }
        }
        self.blobs.sweep_temporaries()?;
        tracing::debug!("pruned {} blobs, kept {}", stats.removed, stats.kept);
        Ok(stats)
    }
}

/// The subpath restriction applied during checkout.
#[derive(Debug)]
struct CheckoutFilter {
    /// Normalized allow-list; empty means everything.
    allowed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Include {
    /// The whole subtree is wanted.
    Yes,
    /// Some descendant may be wanted; create the directory and descend.
    Descend,
    /// Nothing below here is wanted.
    No,
}

impl CheckoutFilter {
    fn new(subpaths: &[String]) -> Self {
        let allowed = if subpaths.is_empty() {
            Vec::new()
        } else {
            let mut v = vec!["/metadata".to_string()];
            for s in subpaths {
                let s = s.trim_end_matches('/');
                let s = if s.starts_with('/') {
                    s.to_owned()
                } else {
                    format!("/{s}")
                };
                v.push(format!("/files{s}"));
            }
            v
        };
        Self { allowed }
    }

    fn check_dir(&self, path: &str) -> Include {
        if self.allowed.is_empty() {
            return Include::Yes;
        }
        for a in &self.allowed {
            if path == a || path.starts_with(&format!("{a}/")) {
                return Include::Yes;
            }
            if a.starts_with(&format!("{path}/")) {
                return Include::Descend;
            }
        }
        Include::No
    }

    fn includes_file(&self, path: &str) -> bool {
        self.check_dir(path) == Include::Yes
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cap_std_ext::{cap_std, cap_tempfile};

    fn new_repo() -> Result<(cap_tempfile::TempDir, Repo)> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let repo = Repo::open(td.try_clone()?, true)?;
        Ok((td, repo))
    }

    /// Build a minimal app tree: metadata, files/bin/hello.sh, export/.
    pub(crate) fn populate_app_tree(dir: &Dir) -> Result<()> {
        dir.create_dir_all("files/bin")?;
        dir.create_dir_all("files/share/doc")?;
        dir.create_dir_all("export/share/applications")?;
        dir.write(
            "metadata",
            "[Application]\nname=org.test.Hello\nruntime=org.test.Platform/x86_64/master\n",
        )?;
        dir.write("files/bin/hello.sh", "#!/bin/sh\necho hello\n")?;
        dir.set_permissions("files/bin/hello.sh", Permissions::from_mode(0o755))?;
        dir.write("files/share/doc/README", "docs\n")?;
        dir.symlink("hello.sh", "files/bin/hello")?;
        dir.write(
            "export/share/applications/org.test.Hello.desktop",
            "[Desktop Entry]\nName=Hello\nExec=hello.sh --arg\nTryExec=hello.sh\n",
        )?;
        Ok(())
    }

    pub(crate) fn commit_app(repo: &Repo, src: &Dir, ref_name: &str) -> Result<Digest> {
        let (tree, size) = repo.write_tree_from_dir(src)?;
        let commit = Commit {
            ref_name: ref_name.into(),
            tree,
            parent: None,
            timestamp: 1700000000,
            subject: "Test commit".into(),
            body: String::new(),
            metadata: [(
                "xa.installed-size".to_string(),
                serde_json::Value::from(size),
            )]
            .into_iter()
            .collect(),
        };
        repo.write_commit(&commit)
    }

    #[test]
    fn tree_roundtrip_and_checkout() -> Result<()> {
        let (_td, repo) = new_repo()?;
        let src = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        populate_app_tree(&src)?;
        let commit = commit_app(&repo, &src, "app/org.test.Hello/x86_64/master")?;

        let dest = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        repo.checkout(&commit, &dest, &[])?;
        assert_eq!(
            dest.read_to_string("files/bin/hello.sh")?,
            "#!/bin/sh\necho hello\n"
        );
        let mode = dest
            .metadata("files/bin/hello.sh")?
            .permissions()
            .mode()
            & 0o7777;
        assert_eq!(mode, 0o755);
        assert_eq!(
            dest.read_link("files/bin/hello")?,
            std::path::PathBuf::from("hello.sh")
        );
        assert!(dest.try_exists("export/share/applications/org.test.Hello.desktop")?);

        // Identical content re-imports to the identical commit digest
        let commit2 = commit_app(&repo, &src, "app/org.test.Hello/x86_64/master")?;
        assert_eq!(commit, commit2);
        Ok(())
    }

    #[test]
    fn subpath_checkout_is_conservative() -> Result<()> {
        let (_td, repo) = new_repo()?;
        let src = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        populate_app_tree(&src)?;
        let commit = commit_app(&repo, &src, "app/org.test.Hello/x86_64/master")?;

        let dest = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        repo.checkout(&commit, &dest, &["/bin".to_string()])?;
        // /metadata plus /files/bin only
        assert!(dest.try_exists("metadata")?);
        assert!(dest.try_exists("files/bin/hello.sh")?);
        assert!(!dest.try_exists("files/share")?);
        assert!(!dest.try_exists("export")?);
        Ok(())
    }

    #[test]
    fn refs_record_and_resolve() -> Result<()> {
        let (_td, repo) = new_repo()?;
        let src = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        populate_app_tree(&src)?;
        let r = Ref::parse("app/org.test.Hello/x86_64/master")?;
        let commit = commit_app(&repo, &src, &r.to_string())?;

        assert!(repo.try_resolve("origin", &r)?.is_none());
        let e = repo.resolve("origin", &r).unwrap_err();
        assert!(matches!(
            crate::errors::error_kind(&e),
            Some(Error::NotFound(_))
        ));

        repo.set_ref("origin", &r, Some(&commit))?;
        assert_eq!(repo.resolve("origin", &r)?, commit);
        let refs = repo.list_refs(None)?;
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0, "origin");
        assert_eq!(refs[0].2, commit);

        repo.set_ref("origin", &r, None)?;
        assert!(repo.try_resolve("origin", &r)?.is_none());
        Ok(())
    }

    #[test]
    fn prune_sweeps_unreferenced() -> Result<()> {
        let (_td, repo) = new_repo()?;
        let src = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        populate_app_tree(&src)?;
        let r = Ref::parse("app/org.test.Hello/x86_64/master")?;
        let commit = commit_app(&repo, &src, &r.to_string())?;
        repo.set_ref("origin", &r, Some(&commit))?;

        let garbage = repo.blobs().store_bytes(b"unreferenced")?;
        let before = repo.blobs().list_blobs()?.len() as u64;
        let stats = repo.prune()?;
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.kept, before - 1);
        assert!(!repo.blobs().contains(&garbage)?);
        // The commit closure survives intact
        repo.verify_commit(&commit)?;

        // Dropping the ref makes everything collectable
        repo.set_ref("origin", &r, None)?;
        let stats = repo.prune()?;
        assert_eq!(stats.kept, 0);
        assert!(stats.removed > 0);
        Ok(())
    }

    #[test]
    fn verify_detects_damage() -> Result<()> {
        let (td, repo) = new_repo()?;
        let src = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        populate_app_tree(&src)?;
        let commit = commit_app(&repo, &src, "app/org.test.Hello/x86_64/master")?;
        repo.verify_commit(&commit)?;

        // Damage one content blob in place
        let mut objects = BTreeSet::new();
        repo.collect_commit_objects(&commit, &mut objects, false)?;
        let victim = objects.iter().last().unwrap();
        td.write(format!("blobs/sha256/{}", victim.sha256_hex()), b"junk")?;
        let e = repo.verify_commit(&commit).unwrap_err();
        assert!(matches!(
            crate::errors::error_kind(&e),
            Some(Error::Corrupted(_))
        ));
        Ok(())
    }
}
