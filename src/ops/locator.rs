//! Package locators: `repository/name:semver` triples identifying versioned
//! artifacts in the package store.
//!
//! The special version `0.0.0+latest` means "latest by semver in that
//! repository".

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::errors::{GravityError, Result};

/// Build metadata tag marking the floating "latest" version.
const LATEST_META: &str = "latest";

/// Identifies a versioned artifact in the package store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Locator {
    pub repository: String,
    pub name: String,
    pub version: Version,
}

impl Locator {
    pub fn new(repository: &str, name: &str, version: Version) -> Self {
        Self {
            repository: repository.to_string(),
            name: name.to_string(),
            version,
        }
    }

    /// Parse `repository/name:version`.
    pub fn parse(s: &str) -> Result<Self> {
        let (repo, rest) = s
            .split_once('/')
            .ok_or_else(|| GravityError::BadParameter(format!("invalid locator {s:?}: missing repository")))?;
        let (name, version) = rest
            .split_once(':')
            .ok_or_else(|| GravityError::BadParameter(format!("invalid locator {s:?}: missing version")))?;
        if repo.is_empty() || name.is_empty() {
            return Err(GravityError::BadParameter(format!("invalid locator {s:?}")));
        }
        let version = Version::parse(version)
            .map_err(|e| GravityError::BadParameter(format!("invalid locator {s:?}: {e}")))?;
        Ok(Self::new(repo, name, version))
    }

    /// The floating locator resolving to the newest semver in the repository.
    pub fn latest(repository: &str, name: &str) -> Self {
        let mut version = Version::new(0, 0, 0);
        version.build = semver::BuildMetadata::new(LATEST_META).expect("valid metadata");
        Self::new(repository, name, version)
    }

    /// True when this locator asks for the newest version rather than a pin.
    pub fn is_latest(&self) -> bool {
        self.version.major == 0
            && self.version.minor == 0
            && self.version.patch == 0
            && self.version.build.as_str() == LATEST_META
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.version)
    }
}

impl TryFrom<String> for Locator {
    type Error = GravityError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Locator> for String {
    fn from(l: Locator) -> Self {
        l.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let loc = Locator::parse("gravitational.io/gravity:6.0.0").unwrap();
        assert_eq!(loc.repository, "gravitational.io");
        assert_eq!(loc.name, "gravity");
        assert_eq!(loc.version, Version::new(6, 0, 0));
        assert_eq!(loc.to_string(), "gravitational.io/gravity:6.0.0");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Locator::parse("gravity:6.0.0").unwrap_err().is_bad_parameter());
        assert!(Locator::parse("repo/gravity").unwrap_err().is_bad_parameter());
        assert!(Locator::parse("repo/gravity:six").unwrap_err().is_bad_parameter());
    }

    #[test]
    fn latest_marker() {
        let loc = Locator::latest("gravitational.io", "gravity");
        assert!(loc.is_latest());
        assert_eq!(loc.to_string(), "gravitational.io/gravity:0.0.0+latest");

        let pinned = Locator::parse("gravitational.io/gravity:0.0.1").unwrap();
        assert!(!pinned.is_latest());
    }

    #[test]
    fn serde_uses_string_form() {
        let loc = Locator::parse("gravitational.io/agent-credentials:1.0.0").unwrap();
        let json = serde_json::to_string(&loc).unwrap();
        assert_eq!(json, "\"gravitational.io/agent-credentials:1.0.0\"");
        let back: Locator = serde_json::from_str(&json).unwrap();
        assert_eq!(back, loc);
    }
}
