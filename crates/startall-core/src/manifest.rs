use crate::error::ManifestError;
use crate::Command;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

pub const MANIFEST_FILE: &str = "package.json";

const RESERVED_SCRIPT: &str = "start";

/// Events the package manager fires on its own; `pre`/`post` variants of
/// these are hooks even when the base script is not declared.
const LIFECYCLE_EVENTS: &[&str] = &[
    "install",
    "uninstall",
    "publish",
    "publishOnly",
    "pack",
    "version",
    "test",
    "stop",
    "restart",
    "start",
];

#[derive(Debug, Deserialize)]
struct PackageJson {
    #[serde(default)]
    scripts: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runner {
    Npm,
    Pnpm,
    Yarn,
    Bun,
}

impl Runner {
    pub fn program(&self) -> &'static str {
        match self {
            Runner::Npm => "npm",
            Runner::Pnpm => "pnpm",
            Runner::Yarn => "yarn",
            Runner::Bun => "bun",
        }
    }
}

/// Picks the package manager from the lockfile present in `root`.
pub fn detect_runner(root: &Path) -> Runner {
    if root.join("pnpm-lock.yaml").exists() {
        Runner::Pnpm
    } else if root.join("yarn.lock").exists() {
        Runner::Yarn
    } else if root.join("bun.lockb").exists() || root.join("bun.lock").exists() {
        Runner::Bun
    } else {
        Runner::Npm
    }
}

/// `start` is never offered, and neither is a hook: `preX`/`postX` where
/// `X` is a declared script or a package-manager lifecycle event. Other
/// names that merely begin with `pre`/`post` (`preview`, `postcss`) stay.
pub fn is_runnable_script(name: &str, declared: &[&str]) -> bool {
    if name == RESERVED_SCRIPT {
        return false;
    }
    let hook_of = ["pre", "post"]
        .iter()
        .find_map(|prefix| name.strip_prefix(*prefix))
        .filter(|base| !base.is_empty());
    match hook_of {
        Some(base) => !(declared.contains(&base) || LIFECYCLE_EVENTS.contains(&base)),
        None => true,
    }
}

pub fn load_commands(root: &Path) -> Result<Vec<Command>, ManifestError> {
    let path = root.join(MANIFEST_FILE);
    if !path.exists() {
        return Err(ManifestError::Missing(root.to_path_buf()));
    }
    let contents = fs::read_to_string(&path)?;
    let package: PackageJson = serde_json::from_str(&contents)?;
    let runner = detect_runner(root);
    let declared: Vec<&str> = package.scripts.keys().map(String::as_str).collect();
    let commands: Vec<Command> = package
        .scripts
        .iter()
        .filter(|(name, body)| body.is_string() && is_runnable_script(name, &declared))
        .map(|(name, _)| Command {
            name: name.clone(),
            display_name: name.clone(),
            program: runner.program().to_string(),
            args: vec!["run".to_string(), name.clone()],
            cwd: root.to_path_buf(),
        })
        .collect();
    if commands.is_empty() {
        return Err(ManifestError::Empty);
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_manifest(dir: &Path, body: &str) {
        fs::write(dir.join(MANIFEST_FILE), body).expect("write package.json");
    }

    #[test]
    fn scripts_keep_declaration_order_and_skip_hooks() {
        let dir = tempdir().expect("temp dir");
        write_manifest(
            dir.path(),
            r#"{
                "name": "demo",
                "scripts": {
                    "web": "vite",
                    "predev": "echo hook",
                    "dev": "node server.js",
                    "start": "node index.js",
                    "prestart": "echo hook",
                    "prettier": "prettier --check .",
                    "postinstall": "patch-package",
                    "pretest": "echo hook",
                    "prepare": "husky",
                    "preview": "vite preview",
                    "postcss": "postcss src -d dist",
                    "api": "node api.js",
                    "postapi": "echo hook"
                }
            }"#,
        );
        let commands = load_commands(dir.path()).expect("commands");
        let names: Vec<_> = commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["web", "dev", "prettier", "prepare", "preview", "postcss", "api"]
        );
        assert_eq!(commands[0].program, "npm");
        assert_eq!(commands[0].args, vec!["run".to_string(), "web".to_string()]);
    }

    #[test]
    fn lockfile_selects_runner() {
        let dir = tempdir().expect("temp dir");
        assert_eq!(detect_runner(dir.path()), Runner::Npm);
        fs::write(dir.path().join("yarn.lock"), "").expect("write lock");
        assert_eq!(detect_runner(dir.path()), Runner::Yarn);
        fs::write(dir.path().join("pnpm-lock.yaml"), "").expect("write lock");
        assert_eq!(detect_runner(dir.path()), Runner::Pnpm);
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempdir().expect("temp dir");
        assert!(matches!(
            load_commands(dir.path()),
            Err(ManifestError::Missing(_))
        ));
    }

    #[test]
    fn manifest_without_runnable_scripts_is_empty() {
        let dir = tempdir().expect("temp dir");
        write_manifest(dir.path(), r#"{ "scripts": { "start": "node ." } }"#);
        assert!(matches!(load_commands(dir.path()), Err(ManifestError::Empty)));
        write_manifest(dir.path(), r#"{ "name": "no-scripts" }"#);
        assert!(matches!(load_commands(dir.path()), Err(ManifestError::Empty)));
    }

    #[test]
    fn malformed_manifest_is_a_parse_error() {
        let dir = tempdir().expect("temp dir");
        write_manifest(dir.path(), "{ scripts: ");
        assert!(matches!(load_commands(dir.path()), Err(ManifestError::Parse(_))));
    }
}
