//! Cluster package store: versioned artifacts keyed by locator.
//!
//! Writes are upserts; the credentials package has a single writer per
//! rotation (the deployer) and many readers. Packages live on the shared
//! state volume as one file per version.

use std::fs;
use std::path::{Path, PathBuf};

use semver::Version;
use tracing::debug;

use crate::errors::{GravityError, Result};
use crate::ops::Locator;

pub struct PackageStore {
    root: PathBuf,
}

impl PackageStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn version_path(&self, locator: &Locator) -> PathBuf {
        self.root
            .join(&locator.repository)
            .join(&locator.name)
            .join(locator.version.to_string())
    }

    /// Write a package, replacing any payload already stored under the
    /// locator.
    pub fn upsert(&self, locator: &Locator, payload: &[u8]) -> Result<()> {
        if locator.is_latest() {
            return Err(GravityError::BadParameter(format!(
                "cannot write to floating locator {locator}"
            )));
        }
        let path = self.version_path(locator);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, payload)?;
        debug!(%locator, bytes = payload.len(), "package stored");
        Ok(())
    }

    /// Read a package payload. A floating locator resolves to the newest
    /// stored version first.
    pub fn read(&self, locator: &Locator) -> Result<Vec<u8>> {
        let concrete = self.resolve(locator)?;
        fs::read(self.version_path(&concrete)).map_err(|_| {
            GravityError::NotFound(format!("package {concrete}"))
        })
    }

    pub fn exists(&self, locator: &Locator) -> bool {
        match self.resolve(locator) {
            Ok(concrete) => self.version_path(&concrete).is_file(),
            Err(_) => false,
        }
    }

    /// Resolve `0.0.0+latest` to the newest stored semver; a pinned
    /// locator resolves to itself.
    pub fn resolve(&self, locator: &Locator) -> Result<Locator> {
        if !locator.is_latest() {
            return Ok(locator.clone());
        }
        let newest = self
            .versions(&locator.repository, &locator.name)?
            .into_iter()
            .next_back()
            .ok_or_else(|| GravityError::NotFound(format!("no versions of {locator}")))?;
        Ok(Locator::new(&locator.repository, &locator.name, newest))
    }

    /// All stored versions of a package, ascending.
    pub fn versions(&self, repository: &str, name: &str) -> Result<Vec<Version>> {
        let dir = self.root.join(repository).join(name);
        let mut versions = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if let Ok(version) = Version::parse(&entry.file_name().to_string_lossy()) {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Delete one package version. Missing versions are fine; removal is
    /// used by deploy cancellation and by garbage collection.
    pub fn remove(&self, locator: &Locator) -> Result<()> {
        let path = self.version_path(locator);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(%locator, "package removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete every version of a package older than the given one.
    pub fn prune_older(&self, locator: &Locator) -> Result<Vec<Locator>> {
        let mut pruned = Vec::new();
        for version in self.versions(&locator.repository, &locator.name)? {
            if version < locator.version {
                let stale = Locator::new(&locator.repository, &locator.name, version);
                self.remove(&stale)?;
                pruned.push(stale);
            }
        }
        Ok(pruned)
    }
}
