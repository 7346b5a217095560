//! Verification-command detection.
//!
//! When the config does not name build/test/lint commands, the project
//! layout decides: the first recognized manifest wins, and commands are
//! never mixed across project types.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

/// Build, test, and lint command lines for a project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationCommands {
    /// Build gate command.
    pub build: Option<String>,
    /// Test gate command.
    pub test: Option<String>,
    /// Lint gate command.
    pub lint: Option<String>,
}

impl VerificationCommands {
    /// Whether no gate is configured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.build.is_none() && self.test.is_none() && self.lint.is_none()
    }

    /// Fill unset fields from `other`.
    #[must_use]
    pub fn or(mut self, other: Self) -> Self {
        self.build = self.build.or(other.build);
        self.test = self.test.or(other.test);
        self.lint = self.lint.or(other.lint);
        self
    }
}

/// Detect verification commands from the project layout.
#[must_use]
pub fn detect_verification_commands(dir: &Path) -> VerificationCommands {
    let detected = from_package_json(dir)
        .or_else(|| from_cargo(dir))
        .or_else(|| from_makefile(dir))
        .or_else(|| from_go(dir))
        .unwrap_or_default();
    debug!(?detected, dir = %dir.display(), "detected verification commands");
    detected
}

fn from_package_json(dir: &Path) -> Option<VerificationCommands> {
    let content = std::fs::read_to_string(dir.join("package.json")).ok()?;
    let manifest: Value = serde_json::from_str(&content).ok()?;
    let scripts = manifest.get("scripts")?.as_object()?;
    let has = |name: &str| scripts.get(name).and_then(Value::as_str).is_some();
    Some(VerificationCommands {
        build: has("build").then(|| "npm run build".to_string()),
        test: has("test").then(|| "npm test".to_string()),
        lint: has("lint").then(|| "npm run lint".to_string()),
    })
}

fn from_cargo(dir: &Path) -> Option<VerificationCommands> {
    dir.join("Cargo.toml").exists().then(|| VerificationCommands {
        build: Some("cargo build".to_string()),
        test: Some("cargo test".to_string()),
        lint: Some("cargo clippy".to_string()),
    })
}

fn from_makefile(dir: &Path) -> Option<VerificationCommands> {
    let content = std::fs::read_to_string(dir.join("Makefile")).ok()?;
    let has_target = |name: &str| {
        content
            .lines()
            .any(|line| line.starts_with(&format!("{name}:")))
    };
    let commands = VerificationCommands {
        build: has_target("build").then(|| "make build".to_string()),
        test: has_target("test").then(|| "make test".to_string()),
        lint: has_target("lint").then(|| "make lint".to_string()),
    };
    (!commands.is_empty()).then_some(commands)
}

fn from_go(dir: &Path) -> Option<VerificationCommands> {
    dir.join("go.mod").exists().then(|| VerificationCommands {
        build: Some("go build ./...".to_string()),
        test: Some("go test ./...".to_string()),
        lint: Some("go vet ./...".to_string()),
    })
}
