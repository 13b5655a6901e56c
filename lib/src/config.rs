//! Installation configuration: the `config` key-file with `[core]` and
//! `[remote "<name>"]` groups.
//!
//! Remote management UX lives elsewhere; this is the schema the core
//! consumes (plus enough write support for initialization and tests).

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use tini::Ini;

use crate::errors::Error;

/// Configuration of one remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// The remote's name.
    pub name: String,
    /// Base URL.
    pub url: String,
    /// Human title.
    pub title: Option<String>,
    /// Optional collection identifier.
    pub collection_id: Option<String>,
    /// Require OpenPGP signatures on pulled commits.
    pub gpg_verify: bool,
    /// Priority for ordered listings (higher sorts first).
    pub prio: i32,
    /// Hide from default enumerations.
    pub noenumerate: bool,
    /// Skip in all default operations.
    pub disabled: bool,
    /// Path to an allow/deny pattern file.
    pub filter: Option<Utf8PathBuf>,
}

impl RemoteConfig {
    /// A remote with default option values.
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_owned(),
            url: url.to_owned(),
            title: None,
            collection_id: None,
            gpg_verify: true,
            prio: 1,
            noenumerate: false,
            disabled: false,
            filter: None,
        }
    }
}

fn remote_section(name: &str) -> String {
    format!("remote \"{name}\"")
}

fn parse_bool(v: &str) -> bool {
    matches!(v, "true" | "yes" | "1")
}

/// The parsed installation `config` file.
#[derive(Debug, Default)]
pub struct Config {
    remotes: Vec<RemoteConfig>,
}

impl Config {
    /// Parse from key-file text.
    #[context("Parsing installation config")]
    pub fn parse(data: &str) -> Result<Self> {
        let ini = Ini::from_string(data).context("Parse to ini")?;
        let mut remotes = Vec::new();
        for (section, _) in ini.iter() {
            let Some(name) = section
                .strip_prefix("remote \"")
                .and_then(|s| s.strip_suffix('"'))
            else {
                continue;
            };
            let get = |key: &str| -> Option<String> { ini.get::<String>(section, key) };
            let url = get("url")
                .ok_or_else(|| Error::InvalidArgument(format!("remote {name:?} without url")))?;
            let mut remote = RemoteConfig::new(name, &url);
            remote.title = get("title");
            remote.collection_id = get("collection-id");
            if let Some(v) = get("gpg-verify") {
                remote.gpg_verify = parse_bool(&v);
            }
            if let Some(v) = get("xa.prio") {
                remote.prio = v
                    .parse()
                    .with_context(|| format!("Parsing xa.prio={v} for {name}"))?;
            }
            if let Some(v) = get("xa.noenumerate") {
                remote.noenumerate = parse_bool(&v);
            }
            if let Some(v) = get("xa.disabled") {
                remote.disabled = parse_bool(&v);
            }
            remote.filter = get("xa.filter").map(Utf8PathBuf::from);
            remotes.push(remote);
        }
        Ok(Self { remotes })
    }

    /// Serialize back to key-file text.
    pub fn to_text(&self) -> String {
        let mut ini = Ini::new().section("core").item("repo-version", "1");
        for r in &self.remotes {
            let section = remote_section(&r.name);
            ini = ini.section(&section).item("url", &r.url);
            if let Some(v) = &r.title {
                ini = ini.section(&section).item("title", v);
            }
            if let Some(v) = &r.collection_id {
                ini = ini.section(&section).item("collection-id", v);
            }
            ini = ini
                .section(&section)
                .item("gpg-verify", if r.gpg_verify { "true" } else { "false" });
            if r.prio != 1 {
                ini = ini.section(&section).item("xa.prio", &r.prio.to_string());
            }
            if r.noenumerate {
                ini = ini.section(&section).item("xa.noenumerate", "true");
            }
            if r.disabled {
                ini = ini.section(&section).item("xa.disabled", "true");
            }
            if let Some(v) = &r.filter {
                ini = ini.section(&section).item("xa.filter", v.as_str());
            }
        }
        ini.to_string()
    }

    /// Look up a remote by name.
    pub fn remote(&self, name: &str) -> Result<&RemoteConfig> {
        self.remotes
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::NotFound(format!("remote {name}")).into())
    }

    /// Add or replace a remote.
    pub fn set_remote(&mut self, remote: RemoteConfig) {
        self.remotes.retain(|r| r.name != remote.name);
        self.remotes.push(remote);
    }

    /// Remove a remote; absent is success.
    pub fn remove_remote(&mut self, name: &str) {
        self.remotes.retain(|r| r.name != name);
    }

    /// All configured remotes, highest priority first.
    pub fn remotes(&self) -> Vec<&RemoteConfig> {
        let mut v: Vec<_> = self.remotes.iter().collect();
        v.sort_by(|a, b| b.prio.cmp(&a.prio).then_with(|| a.name.cmp(&b.name)));
        v
    }

    /// Remotes eligible for default enumeration: not disabled, not marked
    /// noenumerate; highest priority first.
    pub fn enumerable_remotes(&self) -> Vec<&RemoteConfig> {
        self.remotes()
            .into_iter()
            .filter(|r| !r.disabled && !r.noenumerate)
            .collect()
    }
}
