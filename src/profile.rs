//! Choosing a connection profile from a server's config directory
//!
//! Resellers ship one `.ovpn` file per port, named `<server>-<port>.ovpn`.
//! Some ports get through restrictive networks better than others, so the
//! configured port priorities decide which file is used.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to read profile directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No usable .ovpn profiles in {0}")]
    NoProfiles(PathBuf),
}

/// A profile file and the port encoded in its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileCandidate {
    pub path: PathBuf,
    pub port: u16,
}

/// Port from a `name-<port>` file stem
fn port_from_stem(stem: &str) -> Option<u16> {
    let (_, port) = stem.rsplit_once('-')?;
    port.parse().ok()
}

/// All `.ovpn` files in `dir` with a port suffix, in path order
pub fn scan_profiles(dir: &Path) -> Result<Vec<ProfileCandidate>, ProfileError> {
    let read_err = |source| ProfileError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("ovpn") {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        match port_from_stem(stem) {
            Some(port) => candidates.push(ProfileCandidate { path, port }),
            None => warn!("Skipping profile without a port suffix: {}", path.display()),
        }
    }

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(candidates)
}

/// Pick the profile whose port comes first in `priorities`, falling back to
/// the last candidate when none of the preferred ports is available.
pub fn select_profile(dir: &Path, priorities: &[u16]) -> Result<PathBuf, ProfileError> {
    let candidates = scan_profiles(dir)?;

    for port in priorities {
        if let Some(found) = candidates.iter().find(|c| c.port == *port) {
            debug!("Using preferred port {}: {}", port, found.path.display());
            return Ok(found.path.clone());
        }
    }

    candidates
        .into_iter()
        .last()
        .map(|c| c.path)
        .ok_or_else(|| ProfileError::NoProfiles(dir.to_path_buf()))
}
