//! Exported files: rewriting desktop-entry and D-Bus service files at
//! deploy time so they launch through the sandbox, and maintaining the
//! installation's merged `exports/` symlink tree.

use std::io::Read as _;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use sandpak_utils::shell_quote;

use crate::deploy;
use crate::errors::Error;
use crate::installation::{Installation, EXPORTS_DIR};
use crate::keyfile::KeyFile;
use crate::refspec::Ref;

/// Directory the launcher binary is expected in; overridable for test and
/// packaging setups.
pub fn launcher_bindir() -> String {
    std::env::var("SANDPAK_BINDIR").unwrap_or_else(|_| "/usr/bin".into())
}

/// The `tags` list from the app metadata's `[Application]` group.
fn app_tags(metadata: &KeyFile) -> Vec<String> {
    metadata
        .get("Application", "tags")
        .map(|t| {
            t.split(';')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_owned())
                .collect()
        })
        .unwrap_or_default()
}

/// Rewrite an `Exec=` command line to invoke the app through the launcher,
/// carrying the application id and the original arguments.
fn rewrite_exec(old: &str, r: &Ref, bindir: &str) -> Result<String> {
    let argv = shlex::split(old)
        .ok_or_else(|| Error::InvalidArgument(format!("unparseable Exec line {old:?}")))?;
    let (argv0, rest) = argv
        .split_first()
        .ok_or_else(|| Error::InvalidArgument("empty Exec line".into()))?;
    let mut out = format!(
        "{bindir}/sandpak run --branch={} --arch={} --command={} {}",
        r.branch,
        r.arch,
        shell_quote(argv0),
        r.id
    );
    for a in rest {
        out.push(' ');
        out.push_str(&shell_quote(a));
    }
    Ok(out)
}

/// Rewrite a desktop entry in place: strip `TryExec` and the Bugzilla
/// helper key, point every group's `Exec=` at the launcher, stamp the app
/// id and propagate `[Application] tags` to `X-Flatpak-Tags`.
pub fn rewrite_desktop_file(
    kf: &mut KeyFile,
    r: &Ref,
    tags: &[String],
    bindir: &str,
) -> Result<()> {
    kf.remove_key("Desktop Entry", "TryExec");
    kf.remove_key("Desktop Entry", "X-GNOME-Bugzilla-ExtraInfoScript");
    kf.set("Desktop Entry", "X-Flatpak", &r.id);
    if !tags.is_empty() {
        kf.set("Desktop Entry", "X-Flatpak-Tags", &tags.join(";"));
    }
    let mut failed = None;
    kf.rewrite_all("Exec", |_group, old| match rewrite_exec(old, r, bindir) {
        Ok(new) => Some(new),
        Err(e) => {
            failed.get_or_insert(e);
            None
        }
    });
    match failed {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Rewrite a D-Bus service file in place. The service `Name` must equal
/// the file's base name without `.service`.
pub fn rewrite_service_file(
    kf: &mut KeyFile,
    r: &Ref,
    stem: &str,
    bindir: &str,
) -> Result<()> {
    let name = kf
        .get("D-BUS Service", "Name")
        .ok_or_else(|| Error::InvalidArgument(format!("service file {stem} without Name")))?;
    if name != stem {
        return Err(Error::InvalidArgument(format!(
            "D-Bus service name {name:?} does not match file name {stem:?}"
        ))
        .into());
    }
    let mut failed = None;
    kf.rewrite_all("Exec", |_group, old| match rewrite_exec(old, r, bindir) {
        Ok(new) => Some(new),
        Err(e) => {
            failed.get_or_insert(e);
            None
        }
    });
    match failed {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn rewrite_file_with(
    dir: &Dir,
    name: &str,
    f: impl FnOnce(&mut KeyFile) -> Result<()>,
) -> Result<()> {
    let mut buf = String::new();
    dir.open(name)?.read_to_string(&mut buf)?;
    let mut kf = KeyFile::parse(&buf).with_context(|| format!("Parsing {name}"))?;
    f(&mut kf)?;
    dir.atomic_write(name, kf.to_string())?;
    Ok(())
}

/// Rewrite every desktop entry and D-Bus service in a deployment's export
/// tree.
#[context("Rewriting exports for {r}")]
pub fn rewrite_export_dir(export: &Dir, r: &Ref, metadata: &KeyFile, bindir: &str) -> Result<()> {
    let tags = app_tags(metadata);
    if let Some(apps) = export.open_dir_optional("share/applications")? {
        for ent in apps.entries()? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(name) = name.to_str().map(|s| s.to_owned()) else {
                continue;
            };
            if !name.ends_with(".desktop") || !ent.file_type()?.is_file() {
                continue;
            }
            rewrite_file_with(&apps, &name, |kf| rewrite_desktop_file(kf, r, &tags, bindir))
                .with_context(|| format!("Rewriting {name}"))?;
        }
    }
    if let Some(services) = export.open_dir_optional("share/dbus-1/services")? {
        for ent in services.entries()? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(name) = name.to_str().map(|s| s.to_owned()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".service") else {
                continue;
            };
            if !ent.file_type()?.is_file() {
                continue;
            }
            let stem = stem.to_owned();
            rewrite_file_with(&services, &name, |kf| {
                rewrite_service_file(kf, r, &stem, bindir)
            })
            .with_context(|| format!("Rewriting {name}"))?;
        }
    }
    Ok(())
}

/// Rebuild the merged `exports/` tree from every app's active deployment.
///
/// Exported files must carry the application id as a name prefix; anything
/// else is skipped with a warning rather than exposed.
#[context("Regenerating merged exports")]
pub fn regenerate(inst: &Installation) -> Result<()> {
    let root = inst.root();
    root.remove_all_optional(EXPORTS_DIR)?;
    root.create_dir_all(EXPORTS_DIR)?;
    let exports_root = root.open_dir(EXPORTS_DIR)?;
    for (r, active) in deploy::list_deployed(inst)? {
        if !r.is_app() {
            continue;
        }
        let Some(commit) = active else { continue };
        let export_rel = deploy::deployment_path(&r, &commit).join("export");
        let Some(export) = root.open_dir_optional(&export_rel)? else {
            continue;
        };
        link_tree(&exports_root, &export, &r, &export_rel, Utf8Path::new(""))?;
    }
    Ok(())
}

fn link_tree(
    exports_root: &Dir,
    src: &Dir,
    r: &Ref,
    src_rel: &Utf8Path,
    rel: &Utf8Path,
) -> Result<()> {
    for ent in src.entries()? {
        let ent = ent?;
        let name = ent.file_name();
        let Some(name) = name.to_str().map(|s| s.to_owned()) else {
            continue;
        };
        let path = if rel.as_str().is_empty() {
            Utf8PathBuf::from(&name)
        } else {
            rel.join(&name)
        };
        if ent.file_type()?.is_dir() {
            exports_root.create_dir_all(&path)?;
            link_tree(exports_root, &src.open_dir(&name)?, r, src_rel, &path)?;
            continue;
        }
        if !name.starts_with(&r.id) {
            tracing::warn!("not exporting {path}: name is not prefixed with {}", r.id);
            continue;
        }
        // Symlink back into the deployment, relative to the installation
        // root: one `..` per component of the link's own path.
        let ups = "../".repeat(path.components().count());
        let target = format!("{ups}{src_rel}/{path}");
        exports_root.symlink(&target, &path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refspec::Ref;

    fn test_ref() -> Ref {
        Ref::parse("app/org.test.Hello/x86_64/master").unwrap()
    }

    #[test]
    fn desktop_rewrite() {
        let mut kf = KeyFile::parse(
            "\
[Desktop Entry]
Name=Hello
Exec=hello.sh --arg %F
TryExec=hello.sh
X-GNOME-Bugzilla-ExtraInfoScript=/usr/share/bug/hello.sh

[Desktop Action New]
Exec=hello.sh --new
",
        )
        .unwrap();
        rewrite_desktop_file(&mut kf, &test_ref(), &["proprietary".into()], "/usr/bin").unwrap();
        similar_asserts::assert_eq!(
            kf.to_string(),
            "\
[Desktop Entry]
Name=Hello
Exec=/usr/bin/sandpak run --branch=master --arch=x86_64 --command=hello.sh org.test.Hello --arg %F
X-Flatpak=org.test.Hello
X-Flatpak-Tags=proprietary

[Desktop Action New]
Exec=/usr/bin/sandpak run --branch=master --arch=x86_64 --command=hello.sh org.test.Hello --new
"
        );
    }

    #[test]
    fn desktop_rewrite_quotes_argv0() {
        let mut kf =
            KeyFile::parse("[Desktop Entry]\nExec='/app/bin/my hello' --x\n").unwrap();
        rewrite_desktop_file(&mut kf, &test_ref(), &[], "/usr/bin").unwrap();
        let line = kf.get("Desktop Entry", "Exec").unwrap();
        assert!(
            line.contains("--command='/app/bin/my hello'"),
            "{line}"
        );
    }

    #[test]
    fn service_rewrite_checks_name() {
        let mut kf = KeyFile::parse(
            "[D-BUS Service]\nName=org.test.Hello\nExec=hello.sh --gapplication-service\n",
        )
        .unwrap();
        rewrite_service_file(&mut kf, &test_ref(), "org.test.Hello", "/usr/bin").unwrap();
        assert!(kf
            .get("D-BUS Service", "Exec")
            .unwrap()
            .starts_with("/usr/bin/sandpak run --branch=master --arch=x86_64"));

        let mut kf = KeyFile::parse("[D-BUS Service]\nName=org.other.Name\nExec=x\n").unwrap();
        let e = rewrite_service_file(&mut kf, &test_ref(), "org.test.Hello", "/usr/bin")
            .unwrap_err();
        assert!(matches!(
            crate::errors::error_kind(&e),
            Some(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn merged_exports_tree() -> Result<()> {
        let (td, inst, r, commit) = crate::deploy::tests::installed_fixture()?;
        crate::deploy::deploy(&inst, &r, &commit)?;
        let link = "exports/share/applications/org.test.Hello.desktop";
        let target = td.read_link(link)?;
        let target = target.to_str().unwrap();
        assert_eq!(
            target,
            format!(
                "../../../app/org.test.Hello/x86_64/master/{}/export/share/applications/org.test.Hello.desktop",
                commit.sha256_hex()
            )
        );
        // The link resolves inside the installation
        let mut buf = String::new();
        td.open(link)?.read_to_string(&mut buf)?;
        assert!(buf.contains("X-Flatpak=org.test.Hello"));
        Ok(())
    }

    #[test]
    fn unprefixed_exports_skipped() -> Result<()> {
        let (td, inst, r, commit) = crate::deploy::tests::installed_fixture()?;
        crate::deploy::deploy(&inst, &r, &commit)?;
        // Sneak an unprefixed file into the deployed export tree, then
        // regenerate
        let dpath = crate::deploy::deployment_path(&r, &commit);
        td.write(
            dpath.join("export/share/applications/rogue.desktop"),
            "[Desktop Entry]\nExec=rogue\n",
        )?;
        regenerate(&inst)?;
        assert!(td.try_exists("exports/share/applications/org.test.Hello.desktop")?);
        assert!(!td.try_exists("exports/share/applications/rogue.desktop")?);
        Ok(())
    }
}
