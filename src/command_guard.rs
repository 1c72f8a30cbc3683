//! Launch configuration validation and command sanitization.
//!
//! `sanitize_command` only narrows the injection surface. Commands are split into
//! an argument vector and executed without a shell, so the stripping here is a
//! second line of defense, not a sandbox.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::launch::LaunchConfig;
use crate::path_guard;
use crate::validation::ValidationResult;

pub const MAX_COMMAND_LEN: usize = 1000;
pub const MAX_ENV_VALUE_LEN: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command is empty after sanitization")]
    EmptyAfterSanitize,
}

// Matched against the lower-cased command.
static DANGEROUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // recursive deletion of a root
        r"rm\s+-(rf|fr|r\s+-f|f\s+-r)\s+/(\s|\*|$)",
        r"rm\s+-(rf|fr)\s+~/?(\s|$)",
        r"del\s+/s\s+/q\s+c:\\",
        r"rd\s+/s\s+/q\s+c:\\",
        // disk formatting
        r"format\s+[a-z]:",
        r"\bmkfs(\.[a-z0-9]+)?\s",
        r"dd\s+if=.*\s+of=/dev/[sh]d",
        // forced shutdown
        r"shutdown\s+(-s|/s|-h|-r|/r|now)",
        r"^(sudo\s+)?(halt|poweroff)\b",
        // mass process kill
        r"taskkill\s+(/f\s+)?/im\s+(explorer|csrss|winlogon)\.exe",
        r"kill\s+-9\s+-1\b",
        r"killall5?\s+-9\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static SUBSTITUTIONS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\$\([^)]*\)",
        r"\$\{[^}]*\}",
        r"`[^`]*`",
        r"\$\([^)]*$",
        r"\$\{[^}]*$",
        r"`[^`]*$",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Validates every field of a launch configuration and collects all problems.
pub fn validate(config: &LaunchConfig) -> ValidationResult {
    let mut result = ValidationResult::ok();

    let command = config.command.trim();
    if command.is_empty() {
        result.push("command", "command must not be empty");
    } else {
        if config.command.chars().count() > MAX_COMMAND_LEN {
            result.push(
                "command",
                format!("command exceeds {} characters", MAX_COMMAND_LEN),
            );
        }
        // Stripping substitutions can expose a deny-listed form, e.g. `rm -rf ${X}/`.
        let exposed = sanitize_command(command)
            .map(|sanitized| is_dangerous(&sanitized))
            .unwrap_or(false);
        if is_dangerous(command) || exposed {
            result.push("command", "command contains a potentially dangerous operation");
        }
    }

    if config.working_directory.trim().is_empty() {
        result.push("workingDirectory", "working directory must not be empty");
    } else if let Err(err) = path_guard::check_project_path(&config.working_directory) {
        result.push("workingDirectory", format!("invalid working directory: {}", err));
    }

    if let Some(port) = config.port {
        if !(1..=65535).contains(&port) {
            result.push("port", "port must be between 1 and 65535");
        }
    }

    for (name, value) in &config.environment {
        if !is_env_name(name) {
            result.push(
                "environment",
                format!("invalid environment variable name: {}", name),
            );
        }
        if value.chars().count() > MAX_ENV_VALUE_LEN {
            result.push(
                "environment",
                format!("environment variable value too long: {}", name),
            );
        }
    }

    result
}

/// Whether the command matches the destructive-operation deny-list.
pub fn is_dangerous(command: &str) -> bool {
    let lowered = command.to_lowercase();
    DANGEROUS_PATTERNS.iter().any(|p| p.is_match(&lowered))
}

/// `^[A-Z_][A-Z0-9_]*$`
fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Strips command substitution (`$(...)`, backticks) and variable expansion
/// (`${...}`), including unterminated forms, then trims.
pub fn sanitize_command(command: &str) -> Result<String, CommandError> {
    let mut sanitized = command.to_string();
    for pattern in SUBSTITUTIONS.iter() {
        sanitized = pattern.replace_all(&sanitized, "").into_owned();
    }
    let sanitized = sanitized.trim();
    if sanitized.is_empty() {
        return Err(CommandError::EmptyAfterSanitize);
    }
    Ok(sanitized.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;

    fn project() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("package.json"),
            r#"{"name": "app", "version": "0.1.0"}"#,
        )
        .unwrap();
        tmp
    }

    fn config(command: &str, dir: &str) -> LaunchConfig {
        LaunchConfig {
            command: command.to_string(),
            working_directory: dir.to_string(),
            environment: BTreeMap::new(),
            port: None,
            display_name: None,
        }
    }

    #[test]
    fn accepts_plain_dev_command() {
        let tmp = project();
        let result = validate(&config("npm run dev", tmp.path().to_str().unwrap()));
        assert!(result.valid, "{}", result);
    }

    #[test]
    fn flags_recursive_root_deletion() {
        let result = validate(&config("rm -rf /", "/tmp"));
        assert!(!result.valid);
        let err = result.error_for("command").unwrap();
        assert!(err.message.contains("dangerous"));
    }

    #[test]
    fn deny_list_covers_each_category() {
        for cmd in [
            "RM -RF /",
            "format C:",
            "mkfs.ext4 /dev/sda1",
            "shutdown -s -t 0",
            "sudo shutdown now",
            "taskkill /im explorer.exe",
            "kill -9 -1",
        ] {
            assert!(is_dangerous(cmd), "{cmd} should be flagged");
        }
        for cmd in ["npm run dev", "rm -rf ./dist", "vite --format esm"] {
            assert!(!is_dangerous(cmd), "{cmd} should pass");
        }
    }

    #[test]
    fn flags_deletion_hidden_behind_substitution() {
        let tmp = project();
        for cmd in ["rm -rf ${X}/", "rm -rf $(true)/", "rm -rf `true`/"] {
            let result = validate(&config(cmd, tmp.path().to_str().unwrap()));
            let err = result.error_for("command").expect(cmd);
            assert!(err.message.contains("dangerous"), "{cmd}");
        }
    }

    #[test]
    fn reports_empty_fields() {
        let result = validate(&config("   ", " "));
        assert!(result.error_for("command").is_some());
        assert!(result.error_for("workingDirectory").is_some());
    }

    #[test]
    fn rejects_overlong_command() {
        let tmp = project();
        let long = format!("echo {}", "x".repeat(MAX_COMMAND_LEN));
        let result = validate(&config(&long, tmp.path().to_str().unwrap()));
        assert!(result.error_for("command").unwrap().message.contains("exceeds"));
    }

    #[test]
    fn working_directory_goes_through_path_guard() {
        let tmp = tempfile::tempdir().unwrap();
        let result = validate(&config("npm run dev", tmp.path().to_str().unwrap()));
        let err = result.error_for("workingDirectory").unwrap();
        assert!(err.message.contains("package.json"));
    }

    #[test]
    fn validates_port_and_environment() {
        let tmp = project();
        let mut cfg = config("npm run dev", tmp.path().to_str().unwrap());
        cfg.port = Some(70_000);
        cfg.environment.insert("NODE_ENV".into(), "development".into());
        cfg.environment.insert("lower".into(), "x".into());
        cfg.environment.insert("BIG".into(), "v".repeat(MAX_ENV_VALUE_LEN + 1));
        let result = validate(&cfg);
        assert!(result.error_for("port").is_some());
        let env_errors = result
            .errors
            .iter()
            .filter(|e| e.field == "environment")
            .count();
        assert_eq!(env_errors, 2);
    }

    #[test]
    fn strips_substitutions() {
        assert_eq!(sanitize_command("npm run dev $(whoami)").unwrap(), "npm run dev");
        assert_eq!(sanitize_command("echo ${HOME} hi").unwrap(), "echo  hi");
        assert_eq!(sanitize_command("node `cat x` app.js").unwrap(), "node  app.js");
        assert_eq!(sanitize_command("vite $(rm -rf").unwrap(), "vite");
        assert_eq!(sanitize_command("vite ${PATH").unwrap(), "vite");
    }

    #[test]
    fn empty_after_sanitize_fails() {
        assert_eq!(
            sanitize_command("  $(curl evil)  "),
            Err(CommandError::EmptyAfterSanitize)
        );
        assert_eq!(sanitize_command(""), Err(CommandError::EmptyAfterSanitize));
    }
}
