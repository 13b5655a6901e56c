//! Installation roots: the directory layout owning a repo, deployments,
//! merged exports, configuration and the exclusive installation lock.

use std::io::Read;
use std::time::SystemTime;

use anyhow::{Context, Result};
use cap_std_ext::cap_std::fs::{Dir, File};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::fs::FlockOperation;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::digest::Digest;
use crate::errors::Error;
use crate::pull::{self, PullOptions, PulledRef};
use crate::refspec::Ref;
use crate::registry::Progress;
use crate::repo::Repo;
use crate::{deploy, exports};

pub(crate) const LOCK_FILE: &str = "lock";
pub(crate) const CHANGED_FILE: &str = ".changed";
pub(crate) const REPO_DIR: &str = "repo";
pub(crate) const EXPORTS_DIR: &str = "exports";
pub(crate) const OVERRIDES_DIR: &str = "overrides";
pub(crate) const REMOVED_DIR: &str = ".removed";
pub(crate) const CONFIG_FILE: &str = "config";
pub(crate) const KEYRINGS_DIR: &str = "keyrings";

/// One installation root.
#[derive(Debug)]
pub struct Installation {
    root: Dir,
}

/// Holds the exclusive installation lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
}

impl Installation {
    /// Open an existing installation.
    pub fn open(root: Dir) -> Result<Self> {
        Ok(Self { root })
    }

    /// Open, creating the layout (including an initialized repo) on first
    /// use; creation touches the change sentinel.
    #[context("Initializing installation")]
    pub fn ensure(root: Dir) -> Result<Self> {
        let fresh = !root.try_exists(REPO_DIR)?;
        for d in [REPO_DIR, EXPORTS_DIR, OVERRIDES_DIR, REMOVED_DIR] {
            root.create_dir_all(d)?;
        }
        let inst = Self { root };
        // Initializes the blob layout
        let _ = inst.repo()?;
        if !inst.root.try_exists(CONFIG_FILE)? {
            inst.root
                .atomic_write(CONFIG_FILE, Config::default().to_text())?;
        }
        if fresh {
            inst.touch_changed()?;
        }
        Ok(inst)
    }

    /// The installation root directory.
    pub fn root(&self) -> &Dir {
        &self.root
    }

    /// Open the installation's repo writable.
    pub fn repo(&self) -> Result<Repo> {
        let dir = self.root.open_dir(REPO_DIR).context("Opening repo dir")?;
        Repo::open(dir, true)
    }

    /// Take the exclusive installation lock, blocking until available. The
    /// lock covers every state mutation outside the blob store.
    #[context("Locking installation")]
    pub fn lock(&self) -> Result<LockGuard> {
        let f = self.open_lock_file()?;
        rustix::fs::flock(&f, FlockOperation::LockExclusive)?;
        Ok(LockGuard { _file: f })
    }

    /// Take the lock if immediately available.
    #[context("Locking installation")]
    pub fn try_lock(&self) -> Result<Option<LockGuard>> {
        let f = self.open_lock_file()?;
        match rustix::fs::flock(&f, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(Some(LockGuard { _file: f })),
            Err(rustix::io::Errno::WOULDBLOCK) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open_lock_file(&self) -> Result<File> {
        let mut opts = cap_std_ext::cap_std::fs::OpenOptions::new();
        opts.create(true).write(true).read(true);
        Ok(self.root.open_with(LOCK_FILE, &opts)?)
    }

    /// Touch the change sentinel; called by every mutation.
    pub fn touch_changed(&self) -> Result<()> {
        self.root.atomic_write(CHANGED_FILE, b"")?;
        Ok(())
    }

    /// When the installation last changed, if ever.
    pub fn changed_at(&self) -> Result<Option<SystemTime>> {
        match self.root.metadata(CHANGED_FILE) {
            Ok(m) => Ok(Some(m.modified()?.into_std())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the installation config.
    pub fn config(&self) -> Result<Config> {
        match self.root.open_optional(CONFIG_FILE)? {
            Some(mut f) => {
                let mut buf = String::new();
                f.read_to_string(&mut buf)?;
                Config::parse(&buf)
            }
            None => Ok(Config::default()),
        }
    }

    /// Replace the installation config. Takes the installation lock.
    #[context("Writing installation config")]
    pub fn set_config(&self, config: &Config) -> Result<()> {
        let _lock = self.lock()?;
        self.root.atomic_write(CONFIG_FILE, config.to_text())?;
        self.touch_changed()
    }

    /// The trusted keyring for a remote, if one is installed.
    pub fn remote_keyring(&self, remote: &str) -> Result<Option<Vec<u8>>> {
        match self
            .root
            .open_optional(format!("{KEYRINGS_DIR}/{remote}.gpg"))?
        {
            Some(mut f) => {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    /// Install the trusted keyring for a remote.
    pub fn set_remote_keyring(&self, remote: &str, keyring: &[u8]) -> Result<()> {
        self.root.create_dir_all(KEYRINGS_DIR)?;
        self.root
            .atomic_write(format!("{KEYRINGS_DIR}/{remote}.gpg"), keyring)?;
        Ok(())
    }

    /// Per-app override key-file contents, if present.
    pub fn app_overrides(&self, id: &str) -> Result<Option<String>> {
        match self.root.open_optional(format!("{OVERRIDES_DIR}/{id}"))? {
            Some(mut f) => {
                let mut buf = String::new();
                f.read_to_string(&mut buf)?;
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    /// Pull refs from a configured remote; holds the installation lock for
    /// the duration and records origin and subpaths for each pulled ref.
    #[context("Pulling")]
    pub async fn pull(
        &self,
        remote_name: &str,
        refs: &[Ref],
        opts: &PullOptions,
        progress: Progress<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PulledRef>> {
        let _lock = self.lock()?;
        let config = self.config()?;
        let remote = config.remote(remote_name)?;
        if remote.disabled {
            return Err(
                Error::InvalidArgument(format!("remote {remote_name} is disabled")).into(),
            );
        }
        let keyring = self.remote_keyring(remote_name)?;
        let repo = self.repo()?;
        let pulled = pull::pull(
            &repo,
            remote,
            keyring.as_deref(),
            refs,
            opts,
            progress,
            cancel,
        )
        .await?;
        for p in &pulled {
            deploy::set_origin(self, &p.ref_, remote_name)?;
            deploy::set_subpaths(self, &p.ref_, &opts.subpaths)?;
        }
        self.touch_changed()?;
        Ok(pulled)
    }

    /// Deploy the recorded commit of `r` (resolving through its origin).
    pub fn deploy_ref(&self, r: &Ref) -> Result<Digest> {
        let _lock = self.lock()?;
        let repo = self.repo()?;
        let origin = deploy::origin_of(self, r)?;
        let commit = repo.resolve(&origin, r)?;
        deploy::deploy(self, r, &commit)?;
        Ok(commit)
    }

    /// Deploy a specific commit of `r`.
    pub fn deploy_commit(&self, r: &Ref, commit: &Digest) -> Result<()> {
        let _lock = self.lock()?;
        deploy::deploy(self, r, commit)
    }

    /// Undeploy a commit of `r`.
    pub fn undeploy(&self, r: &Ref, commit: &Digest, force_remove: bool) -> Result<()> {
        let _lock = self.lock()?;
        deploy::undeploy(self, r, commit, force_remove)
    }

    /// Repoint `active` for `r`.
    pub fn activate(&self, r: &Ref, commit: Option<&Digest>) -> Result<()> {
        let _lock = self.lock()?;
        if let Some(c) = commit {
            if !self.root.try_exists(deploy::deployment_path(r, c))? {
                return Err(Error::NotDeployed(format!("{r} commit {c}")).into());
            }
        }
        deploy::set_active(self, r, commit)?;
        exports::regenerate(self)?;
        self.touch_changed()
    }

    /// Drop dangling deployments and unreferenced objects.
    #[context("Pruning installation")]
    pub fn prune(&self) -> Result<()> {
        let _lock = self.lock()?;
        deploy::prune_deployments(self)?;
        deploy::cleanup_removed(self)?;
        self.repo()?.prune()?;
        self.touch_changed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::{cap_std, cap_tempfile};

    #[test]
    fn ensure_layout() -> Result<()> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let inst = Installation::ensure(td.try_clone()?)?;
        for d in [REPO_DIR, EXPORTS_DIR, OVERRIDES_DIR, REMOVED_DIR] {
            assert!(td.try_exists(d)?, "{d}");
        }
        assert!(td.try_exists("repo/oci-layout")?);
        assert!(td.try_exists(CONFIG_FILE)?);
        assert!(inst.changed_at()?.is_some());
        // Re-ensure is idempotent
        let _again = Installation::ensure(td.try_clone()?)?;
        Ok(())
    }

    #[test]
    fn lock_excludes() -> Result<()> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let inst = Installation::ensure(td.try_clone()?)?;
        let inst2 = Installation::open(td.try_clone()?)?;
        let guard = inst.lock()?;
        assert!(inst2.try_lock()?.is_none());
        drop(guard);
        assert!(inst2.try_lock()?.is_some());
        Ok(())
    }

    #[test]
    fn overrides_read() -> Result<()> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let inst = Installation::ensure(td.try_clone()?)?;
        assert!(inst.app_overrides("org.test.Hello")?.is_none());
        td.write(
            "overrides/org.test.Hello",
            "[Context]\nfilesystems=home;\n",
        )?;
        let o = inst.app_overrides("org.test.Hello")?.unwrap();
        assert!(o.contains("filesystems=home;"));
        Ok(())
    }

    #[test]
    fn keyring_roundtrip() -> Result<()> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let inst = Installation::ensure(td.try_clone()?)?;
        assert!(inst.remote_keyring("origin")?.is_none());
        inst.set_remote_keyring("origin", b"key material")?;
        assert_eq!(inst.remote_keyring("origin")?.as_deref(), Some(&b"key material"[..]));
        Ok(())
    }
}
