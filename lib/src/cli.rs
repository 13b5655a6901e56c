//! Command-line dispatch.
//!
//! Thin mapping from verbs onto the library; richer output formatting and
//! completion live outside the core.

use std::ffi::OsString;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::digest::Digest;
use crate::installation::Installation;
use crate::pull::PullOptions;
use crate::refspec::Ref;
use crate::{bundle, delta, deploy, inject, instance};

/// Top-level options.
#[derive(Debug, Parser)]
#[clap(name = "sandpak", version, about = "Sandboxed application deployment")]
pub struct Cli {
    /// Path of the installation to operate on.
    #[clap(long, global = true, default_value = "/var/lib/sandpak")]
    installation: Utf8PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Pull refs from a configured remote into the local repo.
    Pull {
        /// Remote name.
        remote: String,
        /// Refs to pull (kind/id/arch/branch).
        #[clap(required = true)]
        refs: Vec<String>,
        /// Restrict to /metadata plus these /files subtrees.
        #[clap(long)]
        subpath: Vec<String>,
    },
    /// Check out and activate the recorded commit of a ref.
    Deploy {
        /// The ref to deploy.
        #[clap(value_name = "REF")]
        target: String,
    },
    /// Remove a deployment.
    Undeploy {
        /// The ref to undeploy.
        #[clap(value_name = "REF")]
        target: String,
        /// The commit to remove; defaults to the active one.
        commit: Option<String>,
        /// Delete the tree even while it is in use.
        #[clap(long)]
        force: bool,
    },
    /// Repoint the active deployment of a ref.
    Activate {
        /// The ref to activate.
        #[clap(value_name = "REF")]
        target: String,
        /// The deployed commit to expose.
        commit: String,
    },
    /// List deployed refs.
    List,
    /// Drop dangling deployments and unreferenced objects.
    Prune,
    /// Graft a host directory into a running instance's mount namespace.
    Inject {
        /// Instance id, application id, or PID.
        target: String,
        /// Host directory to graft.
        source: Utf8PathBuf,
        /// Destination path inside the instance.
        dest: Utf8PathBuf,
        /// Override the instances root directory.
        #[clap(long)]
        instances_root: Option<Utf8PathBuf>,
    },
    /// Export an installed ref as a single-file bundle.
    BundleExport {
        /// The ref to export.
        #[clap(value_name = "REF")]
        target: String,
        /// Output file.
        out: Utf8PathBuf,
    },
    /// Import a bundle file.
    BundleImport {
        /// Bundle file.
        file: Utf8PathBuf,
        /// Remote name to record the ref under.
        #[clap(long, default_value = "offline")]
        remote: String,
        /// Require a valid signature.
        #[clap(long)]
        require_gpg: bool,
        /// Keyring file to verify against.
        #[clap(long)]
        keyring: Option<Utf8PathBuf>,
    },
    /// Regenerate static deltas for every ref of a remote.
    GenerateDeltas {
        /// Remote name.
        remote: String,
    },
    /// Internal helper for Inject; not user-facing.
    #[clap(hide = true, name = "inject-helper")]
    InjectHelper {
        /// Source directory to clone.
        source: std::path::PathBuf,
    },
}

fn open_installation(path: &Utf8PathBuf) -> Result<Installation> {
    std::fs::create_dir_all(path).with_context(|| format!("Creating {path}"))?;
    let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())
        .with_context(|| format!("Opening {path}"))?;
    Installation::ensure(dir)
}

fn parse_refs(refs: &[String]) -> Result<Vec<Ref>> {
    refs.iter().map(|r| Ref::parse(r)).collect()
}

/// A single overwritten progress line, quiet when not on a tty.
fn progress_bar() -> indicatif::ProgressBar {
    let pb = indicatif::ProgressBar::new_spinner();
    let style = indicatif::ProgressStyle::default_bar();
    pb.set_style(style.template("{spinner} {msg}").unwrap());
    pb.enable_steady_tick(std::time::Duration::from_millis(150));
    pb
}

/// Parse the arguments and run the requested operation.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    match cli.cmd {
        // The helper must not touch the installation; it runs namespaced.
        Cmd::InjectHelper { source } => inject::helper_main(&source),
        Cmd::Pull {
            remote,
            refs,
            subpath,
        } => {
            let inst = open_installation(&cli.installation)?;
            let refs = parse_refs(&refs)?;
            let opts = PullOptions {
                subpaths: subpath,
                basic_auth: None,
            };
            let pb = progress_bar();
            let progress = |done: u64, total: u64| {
                if total > 0 {
                    pb.set_message(format!("Fetching {done}/{total} bytes"));
                } else {
                    pb.set_message(format!("Fetching {done} bytes"));
                }
            };
            let cancel = CancellationToken::new();
            let pulled = inst
                .pull(&remote, &refs, &opts, Some(&progress), &cancel)
                .await?;
            pb.finish_and_clear();
            for p in pulled {
                println!("Pulled {}:{} -> {}", remote, p.ref_, p.commit);
            }
            Ok(())
        }
        Cmd::Deploy { target } => {
            let inst = open_installation(&cli.installation)?;
            let r = Ref::parse(&target)?;
            let commit = inst.deploy_ref(&r)?;
            println!("Deployed {r} at {commit}");
            Ok(())
        }
        Cmd::Undeploy {
            target,
            commit,
            force,
        } => {
            let inst = open_installation(&cli.installation)?;
            let r = Ref::parse(&target)?;
            let commit = match commit {
                Some(c) => Digest::parse(&c)?,
                None => deploy::read_active(&inst, &r)?.ok_or_else(|| {
                    crate::errors::Error::NotDeployed(r.to_string())
                })?,
            };
            inst.undeploy(&r, &commit, force)?;
            println!("Undeployed {r} at {commit}");
            Ok(())
        }
        Cmd::Activate { target, commit } => {
            let inst = open_installation(&cli.installation)?;
            let r = Ref::parse(&target)?;
            let commit = Digest::parse(&commit)?;
            inst.activate(&r, Some(&commit))?;
            println!("Activated {r} at {commit}");
            Ok(())
        }
        Cmd::List => {
            let inst = open_installation(&cli.installation)?;
            for (r, active) in deploy::list_deployed(&inst)? {
                let origin = deploy::origin_of(&inst, &r).unwrap_or_else(|_| "-".into());
                match active {
                    Some(c) => println!("{r}\t{origin}\t{c}"),
                    None => println!("{r}\t{origin}\t(inactive)"),
                }
            }
            Ok(())
        }
        Cmd::Prune => {
            let inst = open_installation(&cli.installation)?;
            inst.prune()
        }
        Cmd::Inject {
            target,
            source,
            dest,
            instances_root,
        } => {
            let root = match instances_root {
                Some(p) => p,
                None => instance::default_instances_root()?,
            };
            let root = Dir::open_ambient_dir(&root, cap_std::ambient_authority())
                .with_context(|| format!("Opening {root}"))?;
            let cancel = CancellationToken::new();
            inject::inject(&root, &target, &source, &dest, &cancel)
        }
        Cmd::BundleExport { target, out } => {
            let inst = open_installation(&cli.installation)?;
            let r = Ref::parse(&target)?;
            let repo = inst.repo()?;
            let origin = deploy::origin_of(&inst, &r)?;
            let commit = repo.resolve(&origin, &r)?;
            let config = inst.config()?;
            let remote = config.remote(&origin)?;
            let f = std::fs::File::create(&out).with_context(|| format!("Creating {out}"))?;
            bundle::build_bundle(
                &repo,
                &r,
                &commit,
                Some(remote.url.as_str()),
                remote.collection_id.as_deref(),
                None,
                f,
            )?;
            println!("Exported {r} to {out}");
            Ok(())
        }
        Cmd::BundleImport {
            file,
            remote,
            require_gpg,
            keyring,
        } => {
            let inst = open_installation(&cli.installation)?;
            let _lock = inst.lock()?;
            let repo = inst.repo()?;
            let keyring = keyring
                .map(|p| std::fs::read(&p).with_context(|| format!("Reading {p}")))
                .transpose()?;
            let f = std::fs::File::open(&file).with_context(|| format!("Opening {file}"))?;
            let (r, commit) =
                bundle::pull_from_bundle(&repo, f, &remote, require_gpg, keyring.as_deref())?;
            deploy::set_origin(&inst, &r, &remote)?;
            inst.touch_changed()?;
            println!("Imported {r} at {commit}");
            Ok(())
        }
        Cmd::GenerateDeltas { remote } => {
            let inst = open_installation(&cli.installation)?;
            let _lock = inst.lock()?;
            let repo = inst.repo()?;
            let wanted: Vec<_> = repo
                .list_refs(Some(&remote))?
                .into_iter()
                .map(|(_, r, c)| (r, c))
                .collect();
            let stats = delta::generate_deltas(&repo, &wanted).await?;
            println!(
                "Deltas: {} generated, {} reused, {} deleted",
                stats.generated, stats.reused, stats.deleted
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses() {
        let cli = Cli::parse_from(["sandpak", "pull", "origin", "app/org.a.B/x86_64/m"]);
        assert!(matches!(cli.cmd, Cmd::Pull { .. }));
        let cli = Cli::parse_from([
            "sandpak",
            "--installation",
            "/tmp/x",
            "inject",
            "org.a.B",
            "/home/u/share",
            "/mnt/host-share",
        ]);
        assert_eq!(cli.installation, "/tmp/x");
        assert!(matches!(cli.cmd, Cmd::Inject { .. }));
        // The helper verb stays parseable though hidden
        let cli = Cli::parse_from(["sandpak", "inject-helper", "/src"]);
        assert!(matches!(cli.cmd, Cmd::InjectHelper { .. }));
    }

    #[test]
    fn pull_requires_refs() {
        assert!(Cli::try_parse_from(["sandpak", "pull", "origin"]).is_err());
    }
}
