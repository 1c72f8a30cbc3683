//! Per-project launch configuration.
//!
//! A project either carries an explicit `dev-config.json`, or a launch
//! configuration is synthesized from its `package.json` scripts.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::package_manager::{self, run_script_command};
use crate::path_guard::MANIFEST_FILE;

pub const DEV_CONFIG_FILE: &str = "dev-config.json";

// First script present wins.
const SCRIPT_PRIORITY: [&str; 3] = ["dev", "start", "serve"];

/// How to launch a development server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    /// Command line, e.g. `npm run dev`.
    pub command: String,
    /// Directory the command runs in.
    #[serde(alias = "cwd")]
    pub working_directory: String,
    /// Variables layered on top of the parent environment.
    #[serde(default, alias = "env", skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    name: Option<String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

impl LaunchConfig {
    pub fn new(command: impl Into<String>, working_directory: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_directory: working_directory.into(),
            environment: BTreeMap::new(),
            port: None,
            display_name: None,
        }
    }
}

/// Loads `dev-config.json`, or derives a configuration from `package.json`.
pub fn load_launch_config(project_dir: &Path) -> Result<LaunchConfig> {
    let config_path = project_dir.join(DEV_CONFIG_FILE);
    if config_path.is_file() {
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config: LaunchConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;
        return Ok(config);
    }

    let manifest_path = project_dir.join(MANIFEST_FILE);
    if manifest_path.is_file() {
        let raw = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("failed to read {}", manifest_path.display()))?;
        let manifest: Manifest = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", manifest_path.display()))?;
        return Ok(synthesize(project_dir, manifest));
    }

    bail!(
        "no {} or {} in {}",
        DEV_CONFIG_FILE,
        MANIFEST_FILE,
        project_dir.display()
    )
}

fn synthesize(project_dir: &Path, manifest: Manifest) -> LaunchConfig {
    let script = SCRIPT_PRIORITY
        .iter()
        .find(|s| manifest.scripts.contains_key(**s))
        .copied()
        .unwrap_or("start");
    let dir = project_dir.to_string_lossy().to_string();
    let manager = package_manager::detect(&dir);
    let name = manifest.name.filter(|n| !n.is_empty()).or_else(|| {
        project_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    });
    LaunchConfig {
        display_name: name,
        ..LaunchConfig::new(run_script_command(manager, script), dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn reads_dev_config_with_short_aliases() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(DEV_CONFIG_FILE),
            r#"{"command": "vite", "cwd": "/srv/web", "env": {"PORT": "5173"}, "port": 5173, "name": "web"}"#,
        )
        .unwrap();
        let config = load_launch_config(tmp.path()).unwrap();
        assert_eq!(config.command, "vite");
        assert_eq!(config.working_directory, "/srv/web");
        assert_eq!(config.environment.get("PORT").map(String::as_str), Some("5173"));
        assert_eq!(config.port, Some(5173));
        assert_eq!(config.display_name.as_deref(), Some("web"));
    }

    #[test]
    fn invalid_dev_config_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(DEV_CONFIG_FILE), "{ nope").unwrap();
        assert!(load_launch_config(tmp.path()).is_err());
    }

    #[test]
    fn synthesizes_from_manifest_scripts() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(MANIFEST_FILE),
            r#"{"name": "shop", "version": "1.0.0", "scripts": {"start": "node .", "dev": "vite"}}"#,
        )
        .unwrap();
        fs::write(tmp.path().join("yarn.lock"), "").unwrap();
        let config = load_launch_config(tmp.path()).unwrap();
        assert_eq!(config.command, "yarn run dev");
        assert_eq!(config.display_name.as_deref(), Some("shop"));
        assert_eq!(config.working_directory, tmp.path().to_string_lossy());
    }

    #[test]
    fn falls_back_to_start_and_directory_name() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(MANIFEST_FILE), r#"{"version": "1.0.0"}"#).unwrap();
        let config = load_launch_config(tmp.path()).unwrap();
        assert_eq!(config.command, "npm run start");
        let dir_name = tmp.path().file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(config.display_name, Some(dir_name));
    }

    #[test]
    fn missing_everything_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_launch_config(tmp.path()).unwrap_err();
        assert!(err.to_string().contains(DEV_CONFIG_FILE));
    }
}
