//! Package manager detection for JavaScript projects.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

use crate::path_guard;

/// Defensive bound on the generated install command.
pub const MAX_INSTALL_COMMAND_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unsupported package manager: {0}")]
    UnsupportedManager(String),
    #[error("install command exceeds 200 characters")]
    CommandTooLong,
}

// Checked in order; the first lockfile present wins.
const LOCKFILES: [(&str, PackageManager); 3] = [
    ("pnpm-lock.yaml", PackageManager::Pnpm),
    ("yarn.lock", PackageManager::Yarn),
    ("package-lock.json", PackageManager::Npm),
];

// Fallback markers when no lockfile is committed.
const MARKERS: [(&str, PackageManager); 4] = [
    ("node_modules/.pnpm", PackageManager::Pnpm),
    ("pnpm-workspace.yaml", PackageManager::Pnpm),
    (".yarnrc.yml", PackageManager::Yarn),
    (".yarn", PackageManager::Yarn),
];

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
            PackageManager::Pnpm => "pnpm",
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageManager {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "npm" => Ok(PackageManager::Npm),
            "yarn" => Ok(PackageManager::Yarn),
            "pnpm" => Ok(PackageManager::Pnpm),
            _ => Err(ResolveError::UnsupportedManager(s.to_string())),
        }
    }
}

/// Picks the package manager that owns `project_path`.
///
/// Never fails: an unusable path or an unrecognized layout falls back to npm so
/// detection can never block a launch.
pub fn detect(project_path: &str) -> PackageManager {
    let dir = match path_guard::sanitize(project_path) {
        Ok(dir) => dir,
        Err(err) => {
            warn!(path = project_path, error = %err, "package manager detection failed, using npm");
            return PackageManager::Npm;
        }
    };
    detect_in(&dir)
}

fn detect_in(dir: &Path) -> PackageManager {
    LOCKFILES
        .iter()
        .chain(MARKERS.iter())
        .find(|(file, _)| dir.join(file).exists())
        .map(|(_, manager)| *manager)
        .unwrap_or(PackageManager::Npm)
}

/// Builds the install command line for a manager name from the allowed set.
pub fn build_install_command(manager: &str) -> Result<String, ResolveError> {
    let manager: PackageManager = manager.parse()?;
    let command = format!("{} install", manager);
    if command.len() > MAX_INSTALL_COMMAND_LEN {
        return Err(ResolveError::CommandTooLong);
    }
    Ok(command)
}

/// Command line that runs a `package.json` script with the given manager.
pub fn run_script_command(manager: PackageManager, script: &str) -> String {
    format!("{} run {}", manager, script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn detect_tmp(files: &[&str]) -> PackageManager {
        let tmp = tempfile::tempdir().unwrap();
        for file in files {
            let path = tmp.path().join(file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, "").unwrap();
        }
        detect(tmp.path().to_str().unwrap())
    }

    #[test]
    fn lockfile_priority_is_pnpm_yarn_npm() {
        assert_eq!(detect_tmp(&["pnpm-lock.yaml", "yarn.lock"]), PackageManager::Pnpm);
        assert_eq!(
            detect_tmp(&["yarn.lock", "package-lock.json"]),
            PackageManager::Yarn
        );
        assert_eq!(detect_tmp(&["package-lock.json"]), PackageManager::Npm);
    }

    #[test]
    fn falls_back_to_markers_then_npm() {
        assert_eq!(detect_tmp(&["node_modules/.pnpm/lock"]), PackageManager::Pnpm);
        assert_eq!(detect_tmp(&[".yarnrc.yml"]), PackageManager::Yarn);
        assert_eq!(detect_tmp(&[]), PackageManager::Npm);
    }

    #[test]
    fn bad_path_defaults_to_npm() {
        assert_eq!(detect("../../escape"), PackageManager::Npm);
        assert_eq!(detect(""), PackageManager::Npm);
    }

    #[test]
    fn builds_install_commands() {
        assert_eq!(build_install_command("pnpm").unwrap(), "pnpm install");
        assert_eq!(build_install_command("Yarn").unwrap(), "yarn install");
        assert_eq!(
            build_install_command("bun"),
            Err(ResolveError::UnsupportedManager("bun".into()))
        );
        assert_eq!(
            run_script_command(PackageManager::Pnpm, "dev"),
            "pnpm run dev"
        );
    }
}
