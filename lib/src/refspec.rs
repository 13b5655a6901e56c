//! Refs: the slash-delimited `kind/id/arch/branch` stream identifiers.

use std::fmt::Display;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Whether a ref names an application or a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    /// An application.
    App,
    /// A runtime.
    Runtime,
}

impl RefKind {
    /// The on-disk/on-wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::App => "app",
            RefKind::Runtime => "runtime",
        }
    }
}

impl std::str::FromStr for RefKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "app" => Ok(RefKind::App),
            "runtime" => Ok(RefKind::Runtime),
            o => Err(Error::InvalidArgument(format!("ref kind {o:?}")).into()),
        }
    }
}

/// A parsed `{app|runtime}/<reverse-dns-id>/<arch>/<branch>` ref.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ref {
    /// Application or runtime.
    pub kind: RefKind,
    /// Reverse-DNS id, e.g. `org.example.App`.
    pub id: String,
    /// Architecture, e.g. `x86_64`.
    pub arch: String,
    /// Branch, e.g. `master` or `23.08`.
    pub branch: String,
}

fn valid_name_segment(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

fn valid_id(id: &str) -> bool {
    let segments: Vec<_> = id.split('.').collect();
    segments.len() >= 2 && segments.iter().all(|s| valid_name_segment(s))
}

fn valid_branch_word(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl Ref {
    /// Construct and validate.
    pub fn new(kind: RefKind, id: &str, arch: &str, branch: &str) -> Result<Self> {
        if !valid_id(id) {
            return Err(Error::InvalidArgument(format!("ref id {id:?}")).into());
        }
        for (what, v) in [("arch", arch), ("branch", branch)] {
            if !valid_branch_word(v) {
                return Err(Error::InvalidArgument(format!("ref {what} {v:?}")).into());
            }
        }
        Ok(Self {
            kind,
            id: id.to_owned(),
            arch: arch.to_owned(),
            branch: branch.to_owned(),
        })
    }

    /// Parse the 4-part slash form.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<_> = s.split('/').collect();
        let [kind, id, arch, branch] = parts.as_slice() else {
            return Err(Error::InvalidArgument(format!("ref {s:?}")).into());
        };
        Self::new(kind.parse()?, id, arch, branch)
    }

    /// Whether this is an app ref.
    pub fn is_app(&self) -> bool {
        self.kind == RefKind::App
    }

    /// The relative deployment path `kind/id/arch/branch`.
    pub fn deploy_subpath(&self) -> String {
        format!("{}/{}/{}/{}", self.kind.as_str(), self.id, self.arch, self.branch)
    }
}

impl Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.kind.as_str(),
            self.id,
            self.arch,
            self.branch
        )
    }
}

impl std::str::FromStr for Ref {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Ref {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Ref> for String {
    fn from(r: Ref) -> String {
        r.to_string()
    }
}

/// A ref qualified by the remote it came from, `<remote>:<ref>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteRef {
    /// The configured remote name.
    pub remote: String,
    /// The ref within that remote.
    pub ref_: Ref,
}

impl RemoteRef {
    /// Parse the `<remote>:<ref>` form.
    pub fn parse(s: &str) -> Result<Self> {
        let (remote, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("remote ref {s:?}")))?;
        if remote.is_empty() || !valid_branch_word(remote) {
            return Err(Error::InvalidArgument(format!("remote name {remote:?}")).into());
        }
        Ok(Self {
            remote: remote.to_owned(),
            ref_: Ref::parse(rest)?,
        })
    }
}

impl Display for RemoteRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.remote, self.ref_)
    }
}
