//! Deployments: materialized commits under the installation root, the
//! atomic `active`/`current` pointers, and the two-phase removal path that
//! respects live users.

use std::io::Read as _;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std_ext::cap_std::fs::{Dir, OpenOptions};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::fs::FlockOperation;

use crate::digest::Digest;
use crate::errors::Error;
use crate::exports;
use crate::installation::{Installation, REMOVED_DIR};
use crate::keyfile::KeyFile;
use crate::refspec::{Ref, RefKind};

const ORIGIN_FILE: &str = "origin";
const SUBPATHS_FILE: &str = "subpaths";
const ACTIVE_LINK: &str = "active";
const CURRENT_LINK: &str = "current";
/// Relative path of the liveness lock file inside a deployment; a writable
/// advisory lock held on it means "in use, do not delete".
pub const REF_FILE: &str = "files/.ref";

/// Path of a deployment directory relative to the installation root.
pub fn deployment_path(r: &Ref, commit: &Digest) -> Utf8PathBuf {
    Utf8PathBuf::from(r.deploy_subpath()).join(commit.sha256_hex())
}

fn ensure_base(inst: &Installation, r: &Ref) -> Result<Dir> {
    let base = r.deploy_subpath();
    inst.root().create_dir_all(&base)?;
    Ok(inst.root().open_dir(&base)?)
}

fn open_base(inst: &Installation, r: &Ref) -> Result<Option<Dir>> {
    Ok(inst.root().open_dir_optional(r.deploy_subpath())?)
}

/// The remote a ref was installed from.
pub fn origin_of(inst: &Installation, r: &Ref) -> Result<String> {
    let Some(base) = open_base(inst, r)? else {
        return Err(Error::NotFound(format!("origin of {r}")).into());
    };
    match base.open_optional(ORIGIN_FILE)? {
        Some(mut f) => {
            let mut buf = String::new();
            f.read_to_string(&mut buf)?;
            Ok(buf.trim().to_owned())
        }
        None => Err(Error::NotFound(format!("origin of {r}")).into()),
    }
}

/// Record the remote a ref was installed from.
pub fn set_origin(inst: &Installation, r: &Ref, remote: &str) -> Result<()> {
    let base = ensure_base(inst, r)?;
    base.atomic_write(ORIGIN_FILE, format!("{remote}\n"))?;
    Ok(())
}

/// The recorded subpath allow-list; empty means a full pull.
pub fn subpaths_of(inst: &Installation, r: &Ref) -> Result<Vec<String>> {
    let Some(base) = open_base(inst, r)? else {
        return Ok(Vec::new());
    };
    match base.open_optional(SUBPATHS_FILE)? {
        Some(mut f) => {
            let mut buf = String::new();
            f.read_to_string(&mut buf)?;
            Ok(buf
                .lines()
                .filter(|l| !l.is_empty())
                .map(|l| l.to_owned())
                .collect())
        }
        None => Ok(Vec::new()),
    }
}

/// Record (or with an empty list, clear) the subpath allow-list.
pub fn set_subpaths(inst: &Installation, r: &Ref, subpaths: &[String]) -> Result<()> {
    let base = ensure_base(inst, r)?;
    if subpaths.is_empty() {
        match base.remove_file(SUBPATHS_FILE) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    }
    let mut buf = String::new();
    for s in subpaths {
        let s = s.strip_prefix('/').unwrap_or(s);
        buf.push('/');
        buf.push_str(s);
        buf.push('\n');
    }
    base.atomic_write(SUBPATHS_FILE, buf)?;
    Ok(())
}

/// The commit currently exposed for `r`, if any.
pub fn read_active(inst: &Installation, r: &Ref) -> Result<Option<Digest>> {
    let Some(base) = open_base(inst, r)? else {
        return Ok(None);
    };
    match base.read_link(ACTIVE_LINK) {
        Ok(target) => {
            let target = target
                .to_str()
                .ok_or_else(|| Error::Corrupted("non-UTF-8 active link".into()))?;
            Ok(Some(Digest::from_sha256_hex(target)?))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Atomically repoint (or with `None`, unlink) the `active` symlink.
///
/// The swap goes through a uniquely named temporary symlink renamed over
/// `active`, so concurrent readers resolve either the old target or the
/// new, never a missing link.
#[context("Updating active for {r}")]
pub fn set_active(inst: &Installation, r: &Ref, commit: Option<&Digest>) -> Result<()> {
    let base = ensure_base(inst, r)?;
    match commit {
        Some(c) => {
            let tmp = format!(".active-{}", uuid::Uuid::new_v4());
            base.symlink(c.sha256_hex(), &tmp)?;
            base.rename(&tmp, &base, ACTIVE_LINK)?;
        }
        None => match base.remove_file(ACTIVE_LINK) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        },
    }
    Ok(())
}

/// All deployments of `r`, lexicographically sorted.
pub fn list_deployments(inst: &Installation, r: &Ref) -> Result<Vec<Digest>> {
    let Some(base) = open_base(inst, r)? else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for ent in base.entries()? {
        let ent = ent?;
        if !ent.file_type()?.is_dir() {
            continue;
        }
        let name = ent.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Ok(d) = Digest::from_sha256_hex(name) {
            out.push(d);
        }
    }
    out.sort();
    Ok(out)
}

/// The arch/branch invoked when the app is run by bare id.
pub fn current_app(inst: &Installation, id: &str) -> Result<Option<Ref>> {
    let Some(appdir) = inst.root().open_dir_optional(format!("app/{id}"))? else {
        return Ok(None);
    };
    match appdir.read_link(CURRENT_LINK) {
        Ok(target) => {
            let target = target
                .to_str()
                .ok_or_else(|| Error::Corrupted("non-UTF-8 current link".into()))?;
            let (arch, branch) = target
                .split_once('/')
                .ok_or_else(|| Error::Corrupted(format!("current link {target:?}")))?;
            Ok(Some(Ref::new(RefKind::App, id, arch, branch)?))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Atomically make `r` the current branch of its app.
#[context("Updating current for {r}")]
pub fn make_current(inst: &Installation, r: &Ref) -> Result<()> {
    if !r.is_app() {
        return Err(Error::InvalidArgument(format!("{r} is not an app")).into());
    }
    let appbase = format!("app/{}", r.id);
    inst.root().create_dir_all(&appbase)?;
    let appdir = inst.root().open_dir(&appbase)?;
    let tmp = format!(".current-{}", uuid::Uuid::new_v4());
    appdir.symlink(format!("{}/{}", r.arch, r.branch), &tmp)?;
    appdir.rename(&tmp, &appdir, CURRENT_LINK)?;
    Ok(())
}

/// Drop the app's current pointer; absent is success.
pub fn drop_current(inst: &Installation, id: &str) -> Result<()> {
    let Some(appdir) = inst.root().open_dir_optional(format!("app/{id}"))? else {
        return Ok(());
    };
    match appdir.remove_file(CURRENT_LINK) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Compare dotted decimal versions.
fn version_newer_than(required: &str, current: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|p| p.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    parse(required) > parse(current)
}

/// Enforce the app's declared minimum engine version.
fn check_engine_version(r: &Ref, metadata: &KeyFile) -> Result<()> {
    let Some(required) = metadata.get("Application", "required-version") else {
        return Ok(());
    };
    let current = env!("CARGO_PKG_VERSION");
    if version_newer_than(required, current) {
        return Err(Error::NeedsNewerEngine {
            id: r.id.clone(),
            required: required.to_owned(),
            current: current.to_owned(),
        }
        .into());
    }
    Ok(())
}

/// Best-effort read through a symlink at `path` within `root`.
fn read_through_link(root: &Dir, path: &str) -> Option<Vec<u8>> {
    if let Ok(Some(mut f)) = root.open_optional(path) {
        let mut buf = Vec::new();
        if f.read_to_end(&mut buf).is_ok() {
            return Some(buf);
        }
    }
    // Absolute targets mean "relative to the app filesystem root"
    let target = root.read_link(path).ok()?;
    let target = target.to_str()?.trim_start_matches('/');
    root.read(target).ok()
}

/// Identity files the sandbox setup bind-mounts over must be regular files,
/// and resolv.conf must point into the host monitor path.
#[context("Adjusting /etc")]
fn fixup_etc(staging: &Dir) -> Result<()> {
    if !staging.try_exists("files")? {
        return Ok(());
    }
    let files = staging.open_dir("files")?;
    files.create_dir_all("etc")?;
    for name in ["passwd", "group", "machine-id"] {
        let path = format!("etc/{name}");
        match files.symlink_metadata(&path) {
            Ok(m) if m.is_symlink() => {
                let content = read_through_link(&files, &path).unwrap_or_default();
                files.remove_file(&path)?;
                files.write(&path, content)?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                files.write(&path, b"")?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    match files.remove_file("etc/resolv.conf") {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    files.symlink("/run/host/monitor/resolv.conf", "etc/resolv.conf")?;
    Ok(())
}

fn read_metadata(staging: &Dir) -> Result<KeyFile> {
    match staging.open_optional("metadata")? {
        Some(mut f) => {
            let mut buf = String::new();
            f.read_to_string(&mut buf)?;
            KeyFile::parse(&buf)
        }
        None => Ok(KeyFile::default()),
    }
}

/// Check out `commit` as a new deployment of `r` and make it active.
///
/// The checkout lands under a hidden staging name and is renamed into place
/// only after every fixup succeeded, so a failure leaves neither the commit
/// directory nor a changed `active`. An existing commit directory fails
/// with already-deployed.
#[context("Deploying {r}")]
pub fn deploy(inst: &Installation, r: &Ref, commit: &Digest) -> Result<()> {
    let repo = inst.repo()?;
    if !repo.blobs().contains(commit)? {
        return Err(Error::NotFound(format!("commit {commit}")).into());
    }
    let base = ensure_base(inst, r)?;
    let name = commit.sha256_hex();
    if base.try_exists(name)? {
        return Err(Error::AlreadyDeployed(format!("{r} commit {commit}")).into());
    }
    let staging_name = format!(".deploy-{}", uuid::Uuid::new_v4());
    base.create_dir(&staging_name)?;
    let res = (|| -> Result<()> {
        let staging = base.open_dir(&staging_name)?;
        let subpaths = subpaths_of(inst, r)?;
        repo.checkout(commit, &staging, &subpaths)?;
        let metadata = read_metadata(&staging)?;
        check_engine_version(r, &metadata)?;
        fixup_etc(&staging)?;
        if staging.try_exists("export")? {
            let export = staging.open_dir("export")?;
            exports::rewrite_export_dir(&export, r, &metadata, &exports::launcher_bindir())?;
        }
        staging.create_dir_all("files")?;
        staging.write(REF_FILE, b"")?;
        Ok(())
    })();
    if let Err(e) = res {
        let _ = base.remove_all_optional(&staging_name);
        return Err(e);
    }
    base.rename(&staging_name, &base, name)?;
    set_active(inst, r, Some(commit))?;
    if r.is_app() && current_app(inst, &r.id)?.is_none() {
        make_current(inst, r)?;
    }
    exports::regenerate(inst)?;
    inst.touch_changed()?;
    tracing::debug!("deployed {r} at {commit}");
    Ok(())
}

/// Whether a deployment directory is in use: somebody holds a writable
/// advisory lock on its `files/.ref`.
pub fn is_live(deployment: &Dir) -> Result<bool> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    let f = match deployment.open_with(REF_FILE, &opts) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    match rustix::fs::flock(&f, FlockOperation::NonBlockingLockExclusive) {
        // Nobody held it; our probe lock dissolves with the descriptor
        Ok(()) => Ok(false),
        Err(rustix::io::Errno::WOULDBLOCK) => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// Move a deployment into `.removed/` (it vanishes from the normal
/// namespace immediately) and delete it unless it is live.
fn retire_deployment(inst: &Installation, base: &Dir, name: &str, force_remove: bool) -> Result<()> {
    inst.root().create_dir_all(REMOVED_DIR)?;
    let removed = inst.root().open_dir(REMOVED_DIR)?;
    let tmpname = format!("{}-{}", &name[..12.min(name.len())], uuid::Uuid::new_v4());
    base.rename(name, &removed, &tmpname)?;
    let moved = removed.open_dir(&tmpname)?;
    if force_remove || !is_live(&moved)? {
        removed.remove_dir_all(&tmpname)?;
    } else {
        tracing::debug!("deployment in use, leaving {REMOVED_DIR}/{tmpname} for later cleanup");
    }
    Ok(())
}

/// Remove the deployment of `commit`.
///
/// Undeploying a non-active commit never touches `active`; undeploying the
/// active one repoints it at the first lexicographic survivor (or unlinks
/// it when none remain). With `force_remove` the tree is deleted even while
/// live.
#[context("Undeploying {r}")]
pub fn undeploy(inst: &Installation, r: &Ref, commit: &Digest, force_remove: bool) -> Result<()> {
    let Some(base) = open_base(inst, r)? else {
        return Err(Error::NotDeployed(format!("{r} commit {commit}")).into());
    };
    let name = commit.sha256_hex().to_owned();
    if !base.try_exists(&name)? {
        return Err(Error::NotDeployed(format!("{r} commit {commit}")).into());
    }
    if read_active(inst, r)?.as_ref() == Some(commit) {
        let survivor = list_deployments(inst, r)?
            .into_iter()
            .find(|d| d != commit);
        set_active(inst, r, survivor.as_ref())?;
    }
    retire_deployment(inst, &base, &name, force_remove)?;
    if r.is_app() && list_deployments(inst, r)?.is_empty() {
        if let Some(current) = current_app(inst, &r.id)? {
            if current == *r {
                drop_current(inst, &r.id)?;
            }
        }
    }
    exports::regenerate(inst)?;
    inst.touch_changed()?;
    tracing::debug!("undeployed {r} at {commit}");
    Ok(())
}

/// Delete pending-removal trees whose liveness lock is free.
#[context("Cleaning removed deployments")]
pub fn cleanup_removed(inst: &Installation) -> Result<()> {
    let Some(removed) = inst.root().open_dir_optional(REMOVED_DIR)? else {
        return Ok(());
    };
    for ent in removed.entries()? {
        let ent = ent?;
        let name = ent.file_name();
        let Some(name) = name.to_str() else { continue };
        if !ent.file_type()?.is_dir() {
            continue;
        }
        let dir = removed.open_dir(name)?;
        if is_live(&dir)? {
            tracing::debug!("{REMOVED_DIR}/{name} still in use");
            continue;
        }
        removed.remove_dir_all(name)?;
    }
    Ok(())
}

/// Retire every deployment that is not its ref's active one.
#[context("Pruning deployments")]
pub fn prune_deployments(inst: &Installation) -> Result<()> {
    for kind in [RefKind::App, RefKind::Runtime] {
        let Some(kind_dir) = inst.root().open_dir_optional(kind.as_str())? else {
            continue;
        };
        for (id, arch, branch) in walk_ref_dirs(&kind_dir)? {
            let r = Ref::new(kind, &id, &arch, &branch)?;
            let active = read_active(inst, &r)?;
            let base = inst
                .root()
                .open_dir(r.deploy_subpath())
                .context("Opening ref dir")?;
            for d in list_deployments(inst, &r)? {
                if Some(&d) != active.as_ref() {
                    retire_deployment(inst, &base, d.sha256_hex(), false)?;
                }
            }
        }
    }
    Ok(())
}

/// Enumerate `<id>/<arch>/<branch>` triples under a kind directory.
fn walk_ref_dirs(kind_dir: &Dir) -> Result<Vec<(String, String, String)>> {
    let mut out = Vec::new();
    for id_ent in kind_dir.entries()? {
        let id_ent = id_ent?;
        if !id_ent.file_type()?.is_dir() {
            continue;
        }
        let id = id_ent.file_name();
        let Some(id) = id.to_str().map(|s| s.to_owned()) else {
            continue;
        };
        let id_dir = kind_dir.open_dir(&id)?;
        for arch_ent in id_dir.entries()? {
            let arch_ent = arch_ent?;
            if !arch_ent.file_type()?.is_dir() {
                continue;
            }
            let arch = arch_ent.file_name();
            let Some(arch) = arch.to_str().map(|s| s.to_owned()) else {
                continue;
            };
            let arch_dir = id_dir.open_dir(&arch)?;
            for branch_ent in arch_dir.entries()? {
                let branch_ent = branch_ent?;
                if !branch_ent.file_type()?.is_dir() {
                    continue;
                }
                let branch = branch_ent.file_name();
                let Some(branch) = branch.to_str().map(|s| s.to_owned()) else {
                    continue;
                };
                out.push((id.clone(), arch.clone(), branch));
            }
        }
    }
    Ok(out)
}

/// All deployed refs with their active commit.
pub fn list_deployed(inst: &Installation) -> Result<Vec<(Ref, Option<Digest>)>> {
    let mut out = Vec::new();
    for kind in [RefKind::App, RefKind::Runtime] {
        let Some(kind_dir) = inst.root().open_dir_optional(kind.as_str())? else {
            continue;
        };
        for (id, arch, branch) in walk_ref_dirs(&kind_dir)? {
            let r = Ref::new(kind, &id, &arch, &branch)?;
            if list_deployments(inst, &r)?.is_empty() {
                continue;
            }
            let active = read_active(inst, &r)?;
            out.push((r, active));
        }
    }
    out.sort_by_key(|(r, _)| r.to_string());
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cap_std_ext::{cap_std, cap_tempfile};

    pub(crate) fn installed_fixture() -> Result<(cap_tempfile::TempDir, Installation, Ref, Digest)>
    {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let inst = Installation::ensure(td.try_clone()?)?;
        let repo = inst.repo()?;
        let src = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        crate::repo::tests::populate_app_tree(&src)?;
        let r = Ref::parse("app/org.test.Hello/x86_64/master")?;
        let commit = crate::repo::tests::commit_app(&repo, &src, &r.to_string())?;
        repo.set_ref("origin", &r, Some(&commit))?;
        set_origin(&inst, &r, "origin")?;
        Ok((td, inst, r, commit))
    }

    #[test]
    fn deploy_roundtrip() -> Result<()> {
        let (td, inst, r, commit) = installed_fixture()?;
        deploy(&inst, &r, &commit)?;

        let dpath = deployment_path(&r, &commit);
        assert!(td.try_exists(&dpath)?);
        assert!(td.try_exists(dpath.join("files/bin/hello.sh"))?);
        assert!(td.try_exists(dpath.join("files/.ref"))?);
        assert!(td.try_exists(dpath.join("metadata"))?);
        // /etc fixups
        assert!(td.symlink_metadata(dpath.join("files/etc/passwd"))?.is_file());
        assert!(td.symlink_metadata(dpath.join("files/etc/group"))?.is_file());
        assert!(td
            .symlink_metadata(dpath.join("files/etc/machine-id"))?
            .is_file());
        assert_eq!(
            td.read_link(dpath.join("files/etc/resolv.conf"))?,
            std::path::PathBuf::from("/run/host/monitor/resolv.conf")
        );
        // Pointers
        assert_eq!(read_active(&inst, &r)?, Some(commit.clone()));
        assert_eq!(current_app(&inst, "org.test.Hello")?, Some(r.clone()));
        // Merged exports
        let exported = "exports/share/applications/org.test.Hello.desktop";
        assert!(td.try_exists(exported)?);
        let content = {
            let mut buf = String::new();
            td.open(exported)?.read_to_string(&mut buf)?;
            buf
        };
        let bindir = exports::launcher_bindir();
        assert!(
            content.contains(&format!(
                "Exec={bindir}/sandpak run --branch=master --arch=x86_64"
            )),
            "{content}"
        );
        Ok(())
    }

    #[test]
    fn double_deploy_is_flagged() -> Result<()> {
        let (_td, inst, r, commit) = installed_fixture()?;
        deploy(&inst, &r, &commit)?;
        let e = deploy(&inst, &r, &commit).unwrap_err();
        assert!(matches!(
            crate::errors::error_kind(&e),
            Some(Error::AlreadyDeployed(_))
        ));
        // Still active, still present
        assert_eq!(read_active(&inst, &r)?, Some(commit));
        Ok(())
    }

    #[test]
    fn undeploy_nonactive_keeps_active() -> Result<()> {
        let (_td, inst, r, commit) = installed_fixture()?;
        deploy(&inst, &r, &commit)?;
        // Second deployment of a distinct commit
        let repo = inst.repo()?;
        let src = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        crate::repo::tests::populate_app_tree(&src)?;
        src.write("files/share/doc/README", "docs v2\n")?;
        let commit2 = crate::repo::tests::commit_app(&repo, &src, &r.to_string())?;
        deploy(&inst, &r, &commit2)?;
        assert_eq!(read_active(&inst, &r)?, Some(commit2.clone()));

        // Undeploying the non-active one leaves active untouched
        undeploy(&inst, &r, &commit, false)?;
        assert_eq!(read_active(&inst, &r)?, Some(commit2.clone()));

        // Undeploying the last one unlinks active and drops current
        undeploy(&inst, &r, &commit2, false)?;
        assert_eq!(read_active(&inst, &r)?, None);
        assert_eq!(current_app(&inst, "org.test.Hello")?, None);
        let e = undeploy(&inst, &r, &commit2, false).unwrap_err();
        assert!(matches!(
            crate::errors::error_kind(&e),
            Some(Error::NotDeployed(_))
        ));
        Ok(())
    }

    #[test]
    fn undeploy_active_picks_lexicographic_survivor() -> Result<()> {
        let (_td, inst, r, commit) = installed_fixture()?;
        deploy(&inst, &r, &commit)?;
        let repo = inst.repo()?;
        let src = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        crate::repo::tests::populate_app_tree(&src)?;
        src.write("files/share/doc/README", "docs v2\n")?;
        let commit2 = crate::repo::tests::commit_app(&repo, &src, &r.to_string())?;
        deploy(&inst, &r, &commit2)?;

        undeploy(&inst, &r, &commit2, false)?;
        // Only one survivor; it becomes active
        assert_eq!(read_active(&inst, &r)?, Some(commit));
        Ok(())
    }

    #[test]
    fn undeploy_live_deployment_defers_deletion() -> Result<()> {
        let (td, inst, r, commit) = installed_fixture()?;
        deploy(&inst, &r, &commit)?;

        // Simulate a running app holding the liveness lock
        let dpath = deployment_path(&r, &commit);
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        let reffile = td.open_with(dpath.join(REF_FILE), &opts)?;
        rustix::fs::flock(&reffile, FlockOperation::LockExclusive)?;

        undeploy(&inst, &r, &commit, false)?;
        // Gone from the normal namespace, parked under .removed
        assert!(!td.try_exists(&dpath)?);
        let removed: Vec<_> = td
            .read_dir(REMOVED_DIR)?
            .collect::<std::io::Result<Vec<_>>>()?;
        assert_eq!(removed.len(), 1);

        // cleanup while held: stays
        cleanup_removed(&inst)?;
        assert_eq!(td.read_dir(REMOVED_DIR)?.count(), 1);

        // Release and clean
        drop(reffile);
        cleanup_removed(&inst)?;
        assert_eq!(td.read_dir(REMOVED_DIR)?.count(), 0);
        Ok(())
    }

    #[test]
    fn active_swap_is_atomic_and_nullable() -> Result<()> {
        let (_td, inst, r, commit) = installed_fixture()?;
        deploy(&inst, &r, &commit)?;
        set_active(&inst, &r, None)?;
        assert_eq!(read_active(&inst, &r)?, None);
        set_active(&inst, &r, Some(&commit))?;
        assert_eq!(read_active(&inst, &r)?, Some(commit));
        Ok(())
    }

    #[test]
    fn engine_version_gate() -> Result<()> {
        let (_td, inst, r, _) = installed_fixture()?;
        let repo = inst.repo()?;
        let src = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        crate::repo::tests::populate_app_tree(&src)?;
        src.write(
            "metadata",
            "[Application]\nname=org.test.Hello\nrequired-version=999.0\n",
        )?;
        let commit = crate::repo::tests::commit_app(&repo, &src, &r.to_string())?;
        let e = deploy(&inst, &r, &commit).unwrap_err();
        assert!(matches!(
            crate::errors::error_kind(&e),
            Some(Error::NeedsNewerEngine { .. })
        ));
        // Nothing was left behind and active is unset
        assert_eq!(read_active(&inst, &r)?, None);
        assert_eq!(list_deployments(&inst, &r)?.len(), 0);
        Ok(())
    }

    #[test]
    fn version_compare() {
        assert!(version_newer_than("1.2.1", "1.2.0"));
        assert!(version_newer_than("2.0", "1.9.9"));
        assert!(!version_newer_than("1.2", "1.2.0"));
        assert!(!version_newer_than("0.9", "1.0"));
    }

    #[test]
    fn subpath_records_roundtrip() -> Result<()> {
        let (_td, inst, r, _) = installed_fixture()?;
        assert_eq!(subpaths_of(&inst, &r)?.len(), 0);
        set_subpaths(&inst, &r, &["bin".to_string(), "/share/icons".to_string()])?;
        assert_eq!(subpaths_of(&inst, &r)?, vec!["/bin", "/share/icons"]);
        set_subpaths(&inst, &r, &[])?;
        assert_eq!(subpaths_of(&inst, &r)?.len(), 0);
        Ok(())
    }

    #[test]
    fn origin_records_roundtrip() -> Result<()> {
        let (_td, inst, r, _) = installed_fixture()?;
        assert_eq!(origin_of(&inst, &r)?, "origin");
        set_origin(&inst, &r, "elsewhere")?;
        assert_eq!(origin_of(&inst, &r)?, "elsewhere");
        Ok(())
    }
}
