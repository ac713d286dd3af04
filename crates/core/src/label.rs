//! Build labels (`//package:name`)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix marking a repo-relative reference.
pub const REPO_MARKER: &str = "//";

/// Identifies a target by its package and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildLabel {
    /// Package path relative to the repo root (empty for the root package)
    pub package: String,
    /// Target name within the package
    pub name: String,
}

impl BuildLabel {
    /// Create a new label
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
        }
    }

    /// Package directory as used inside the execution root (`.` for the root package)
    #[must_use]
    pub fn package_dir(&self) -> &str {
        if self.package.is_empty() {
            "."
        } else {
            &self.package
        }
    }

    /// Join a package-relative path onto this label's package
    #[must_use]
    pub fn package_path(&self, rel: &str) -> String {
        if self.package.is_empty() {
            rel.to_string()
        } else {
            format!("{}/{}", self.package, rel)
        }
    }
}

impl fmt::Display for BuildLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", REPO_MARKER, self.package, self.name)
    }
}

impl FromStr for BuildLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(REPO_MARKER)
            .ok_or_else(|| Error::invalid_label(s, "must start with //"))?;
        let (package, name) = rest
            .split_once(':')
            .ok_or_else(|| Error::invalid_label(s, "missing ':' before the target name"))?;
        if name.is_empty() || name.contains('/') {
            return Err(Error::invalid_label(s, "target name must be a single path segment"));
        }
        if package.starts_with('/') || package.ends_with('/') {
            return Err(Error::invalid_label(s, "package must not start or end with '/'"));
        }
        Ok(Self::new(package, name))
    }
}
