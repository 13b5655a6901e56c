//! Read-only view of the running-instance registry.
//!
//! Every live application run owns a directory under the instances root
//! recording the target PID, the application id, and the PIDs of children
//! created inside the namespaces. The namespace injector consumes this
//! mapping; nothing here mutates it.

use std::io::Read as _;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use tini::Ini;

use crate::errors::Error;

/// One live application run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// The instance id (its directory name).
    pub id: String,
    /// Application id, when recorded.
    pub app_id: Option<String>,
    /// The monitor process.
    pub pid: Option<u32>,
    /// The application process inside the namespaces.
    pub child_pid: Option<u32>,
}

impl Instance {
    /// The PID whose namespaces an injector should join: the in-sandbox
    /// child when present, the monitor otherwise.
    pub fn target_pid(&self) -> Option<u32> {
        self.child_pid.or(self.pid)
    }
}

/// Default instances root: `$XDG_RUNTIME_DIR/.sandpak`.
pub fn default_instances_root() -> Result<Utf8PathBuf> {
    let runtime = std::env::var("XDG_RUNTIME_DIR")
        .map_err(|_| Error::NotFound("XDG_RUNTIME_DIR".into()))?;
    Ok(Utf8PathBuf::from(runtime).join(".sandpak"))
}

fn read_pid_file(dir: &Dir, name: &str) -> Result<Option<u32>> {
    match dir.open_optional(name)? {
        Some(mut f) => {
            let mut buf = String::new();
            f.read_to_string(&mut buf)?;
            let pid = buf
                .trim()
                .parse::<u32>()
                .with_context(|| format!("Parsing {name}"))?;
            Ok(Some(pid))
        }
        None => Ok(None),
    }
}

fn read_instance(root: &Dir, id: &str) -> Result<Instance> {
    let dir = root.open_dir(id)?;
    let mut app_id = None;
    if let Some(mut f) = dir.open_optional("app-id")? {
        let mut buf = String::new();
        f.read_to_string(&mut buf)?;
        let trimmed = buf.trim();
        if !trimmed.is_empty() {
            app_id = Some(trimmed.to_owned());
        }
    }
    if app_id.is_none() {
        if let Some(mut f) = dir.open_optional("info")? {
            let mut buf = String::new();
            f.read_to_string(&mut buf)?;
            let ini = Ini::from_string(&buf).context("Parse to ini")?;
            app_id = ini.get::<String>("Application", "name");
        }
    }
    Ok(Instance {
        id: id.to_owned(),
        app_id,
        pid: read_pid_file(&dir, "pid")?,
        child_pid: read_pid_file(&dir, "child-pid")?,
    })
}

/// Enumerate all recorded instances.
#[context("Listing instances")]
pub fn list_instances(root: &Dir) -> Result<Vec<Instance>> {
    let mut out = Vec::new();
    for ent in root.entries()? {
        let ent = ent?;
        if !ent.file_type()?.is_dir() {
            continue;
        }
        let id = ent.file_name();
        let Some(id) = id.to_str() else { continue };
        match read_instance(root, id) {
            Ok(i) => out.push(i),
            // A run tearing down concurrently is not an error
            Err(e) => tracing::debug!("skipping instance {id}: {e:#}"),
        }
    }
    out.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(out)
}

/// Resolve an instance id, application id, or literal PID to a target PID.
///
/// The instance registry is consulted first; only a string matching
/// neither an instance id nor an app id is treated as a number.
#[context("Resolving {which}")]
pub fn resolve_target_pid(root: &Dir, which: &str) -> Result<u32> {
    if root.try_exists(which)? {
        let instance = read_instance(root, which)?;
        return instance
            .target_pid()
            .ok_or_else(|| Error::NotFound(format!("pid of instance {which}")).into());
    }
    let matching: Vec<Instance> = list_instances(root)?
        .into_iter()
        .filter(|i| i.app_id.as_deref() == Some(which))
        .collect();
    match matching.len() {
        0 => {}
        1 => {
            return matching[0]
                .target_pid()
                .ok_or_else(|| Error::NotFound(format!("pid of {which}")).into());
        }
        _ => {
            let ids: Vec<_> = matching.iter().map(|i| i.id.as_str()).collect();
            return Err(Error::InvalidArgument(format!(
                "{which} has multiple instances: {}",
                ids.join(", ")
            ))
            .into());
        }
    }
    which
        .parse::<u32>()
        .map_err(|_| Error::NotFound(format!("instance {which}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::{cap_std, cap_tempfile};

    fn write_instance(
        root: &Dir,
        id: &str,
        app_id: Option<&str>,
        pid: Option<u32>,
        child_pid: Option<u32>,
    ) -> Result<()> {
        root.create_dir(id)?;
        let dir = root.open_dir(id)?;
        if let Some(app) = app_id {
            dir.write("app-id", format!("{app}\n"))?;
            dir.write(
                "info",
                format!("[Application]\nname={app}\n\n[Instance]\ninstance-id={id}\n"),
            )?;
        }
        if let Some(pid) = pid {
            dir.write("pid", format!("{pid}\n"))?;
        }
        if let Some(pid) = child_pid {
            dir.write("child-pid", format!("{pid}\n"))?;
        }
        Ok(())
    }

    #[test]
    fn resolution_order() -> Result<()> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        write_instance(&td, "1234567890", Some("org.test.Hello"), Some(100), Some(101))?;
        write_instance(&td, "2222222222", Some("org.test.Other"), Some(200), None)?;

        // Instance id wins
        assert_eq!(resolve_target_pid(&td, "1234567890")?, 101);
        // App id next; child-pid preferred, monitor as fallback
        assert_eq!(resolve_target_pid(&td, "org.test.Hello")?, 101);
        assert_eq!(resolve_target_pid(&td, "org.test.Other")?, 200);
        // Digits resolve as a literal PID
        assert_eq!(resolve_target_pid(&td, "4242")?, 4242);
        // Anything else is not found
        let e = resolve_target_pid(&td, "org.absent.App").unwrap_err();
        assert!(matches!(
            crate::errors::error_kind(&e),
            Some(Error::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn ambiguous_app_id_rejected() -> Result<()> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        write_instance(&td, "1111111111", Some("org.test.Hello"), Some(100), None)?;
        write_instance(&td, "3333333333", Some("org.test.Hello"), Some(300), None)?;
        let e = resolve_target_pid(&td, "org.test.Hello").unwrap_err();
        assert!(matches!(
            crate::errors::error_kind(&e),
            Some(Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn instance_id_beats_numeric() -> Result<()> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        // An instance whose directory name is itself numeric
        write_instance(&td, "4242", Some("org.test.Hello"), Some(7), None)?;
        assert_eq!(resolve_target_pid(&td, "4242")?, 7);
        Ok(())
    }

    #[test]
    fn listing() -> Result<()> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        write_instance(&td, "b", Some("org.test.B"), Some(2), None)?;
        write_instance(&td, "a", Some("org.test.A"), Some(1), Some(11))?;
        let all = list_instances(&td)?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a");
        assert_eq!(all[0].target_pid(), Some(11));
        assert_eq!(all[1].app_id.as_deref(), Some("org.test.B"));
        Ok(())
    }
}
