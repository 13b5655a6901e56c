//! A small codec for desktop-entry style key-files.
//!
//! The export rewriter must round-trip foreign `.desktop` and D-Bus
//! `.service` files preserving group order, key order, locale-suffixed keys
//! (`Name[de]=`) and unknown content; generic INI crates normalize all of
//! that away, so the deployment layer carries its own codec. Our own
//! configuration files go through `tini` instead.

use std::fmt::Display;

use anyhow::Result;

use crate::errors::Error;

/// An ordered key-file: groups of key/value entries.
#[derive(Debug, Clone, Default)]
pub struct KeyFile {
    groups: Vec<Group>,
}

#[derive(Debug, Clone)]
struct Group {
    name: String,
    entries: Vec<(String, String)>,
}

impl KeyFile {
    /// Parse from text. Comments and blank lines are dropped; an entry
    /// outside any group is invalid.
    pub fn parse(data: &str) -> Result<Self> {
        let mut groups: Vec<Group> = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            let trimmed = line.trim_end();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                groups.push(Group {
                    name: name.to_owned(),
                    entries: Vec::new(),
                });
                continue;
            }
            let Some((k, v)) = trimmed.split_once('=') else {
                return Err(Error::InvalidArgument(format!(
                    "key-file line {}: {trimmed:?}",
                    lineno + 1
                ))
                .into());
            };
            let Some(group) = groups.last_mut() else {
                return Err(Error::InvalidArgument(format!(
                    "key-file line {}: entry outside a group",
                    lineno + 1
                ))
                .into());
            };
            group.entries.push((k.trim_end().to_owned(), v.to_owned()));
        }
        Ok(Self { groups })
    }

    /// Group names in file order.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.name.as_str())
    }

    /// Whether the group exists.
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g.name == group)
    }

    /// Value of `key` in `group`, if present.
    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|g| g.name == group)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Keys of a group in file order.
    pub fn keys<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.groups
            .iter()
            .filter(move |g| g.name == group)
            .flat_map(|g| g.entries.iter().map(|(k, _)| k.as_str()))
    }

    /// Set `key` in `group`, replacing in place or appending; the group is
    /// created at the end if absent.
    pub fn set(&mut self, group: &str, key: &str, value: &str) {
        let g = match self.groups.iter_mut().find(|g| g.name == group) {
            Some(g) => g,
            None => {
                self.groups.push(Group {
                    name: group.to_owned(),
                    entries: Vec::new(),
                });
                self.groups.last_mut().unwrap()
            }
        };
        match g.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_owned(),
            None => g.entries.push((key.to_owned(), value.to_owned())),
        }
    }

    /// Remove `key` from `group` wherever it appears.
    pub fn remove_key(&mut self, group: &str, key: &str) {
        for g in self.groups.iter_mut().filter(|g| g.name == group) {
            g.entries.retain(|(k, _)| k != key);
        }
    }

    /// Apply an edit to every group's `key` (where present), typically used
    /// to rewrite `Exec=` lines across all desktop-entry actions.
    pub fn rewrite_all<F>(&mut self, key: &str, mut f: F)
    where
        F: FnMut(&str, &str) -> Option<String>,
    {
        for g in self.groups.iter_mut() {
            for (k, v) in g.entries.iter_mut() {
                if k == key {
                    if let Some(new) = f(&g.name, v) {
                        *v = new;
                    }
                }
            }
        }
    }
}

impl Display for KeyFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, g) in self.groups.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", g.name)?;
            for (k, v) in &g.entries {
                writeln!(f, "{k}={v}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESKTOP: &str = "\
[Desktop Entry]
Name=Hello
Name[de]=Hallo
Exec=hello --arg
TryExec=hello

[Desktop Action New]
Exec=hello --new
";

    #[test]
    fn parse_and_get() {
        let kf = KeyFile::parse(DESKTOP).unwrap();
        assert_eq!(
            kf.group_names().collect::<Vec<_>>(),
            vec!["Desktop Entry", "Desktop Action New"]
        );
        assert_eq!(kf.get("Desktop Entry", "Name"), Some("Hello"));
        assert_eq!(kf.get("Desktop Entry", "Name[de]"), Some("Hallo"));
        assert_eq!(kf.get("Desktop Action New", "Exec"), Some("hello --new"));
        assert_eq!(kf.get("Desktop Entry", "Missing"), None);
    }

    #[test]
    fn rewrite_preserves_order() {
        let mut kf = KeyFile::parse(DESKTOP).unwrap();
        kf.remove_key("Desktop Entry", "TryExec");
        kf.rewrite_all("Exec", |_group, old| Some(format!("wrapper {old}")));
        kf.set("Desktop Entry", "X-Flatpak", "org.test.Hello");
        let out = kf.to_string();
        similar_asserts::assert_eq!(
            out,
            "\
[Desktop Entry]
Name=Hello
Name[de]=Hallo
Exec=wrapper hello --arg
X-Flatpak=org.test.Hello

[Desktop Action New]
Exec=wrapper hello --new
"
        );
    }

    #[test]
    fn rejects_stray_entries() {
        assert!(KeyFile::parse("key=value\n").is_err());
        assert!(KeyFile::parse("[G]\nnot a pair\n").is_err());
    }

    #[test]
    fn comments_dropped() {
        let kf = KeyFile::parse("# header\n[G]\n# inner\nk=v\n").unwrap();
        assert_eq!(kf.get("G", "k"), Some("v"));
        assert_eq!(kf.to_string(), "[G]\nk=v\n");
    }
}
