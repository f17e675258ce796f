//! Environment-driven gateway configuration.
//!
//! Everything the gateway needs to know at boot: where workspaces live, how to
//! launch each language server, and the per-operation timeouts. Resolution
//! failures (no `java`, no launcher jar, no config dir) are fatal for the
//! process, not for a session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};

use crate::language::{self, Language, WORKSPACE_PLACEHOLDER};

const DEFAULT_WORKSPACE_DIR: &str = "/workspaces";
const DEFAULT_JDT_HOME: &str = "/app/jdtls";
const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Parent directory under which each session gets an exclusive workspace.
    pub workspace_root: PathBuf,
    /// Launch command per language, with [`WORKSPACE_PLACEHOLDER`] standing in
    /// for the session workspace path.
    pub commands: HashMap<Language, Vec<String>>,
    /// Deadline for the LSP `initialize` handshake.
    pub init_timeout: Duration,
    /// Deadline for client requests forwarded to the server.
    pub forward_timeout: Duration,
    /// Deadline for the `shutdown` request during teardown.
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Resolve the configuration from the environment, validating every path
    /// the Java toolchain needs.
    pub fn from_env() -> Result<Self> {
        let workspace_root = PathBuf::from(
            std::env::var("WORKSPACE_DIR").unwrap_or_else(|_| DEFAULT_WORKSPACE_DIR.into()),
        );
        let jdt_home =
            PathBuf::from(std::env::var("JDT_HOME").unwrap_or_else(|_| DEFAULT_JDT_HOME.into()));

        let java_bin = match std::env::var_os("JAVA_HOME") {
            Some(home) => {
                let bin = PathBuf::from(home).join("bin").join("java");
                ensure!(bin.is_file(), "JAVA_HOME has no java executable at {}", bin.display());
                bin
            }
            None => which::which("java").context("java executable not found on PATH")?,
        };

        let launcher_jar = find_launcher_jar(&jdt_home.join("plugins"))?;
        let config_dir = jdt_home.join(platform_config_dir());
        ensure!(
            config_dir.is_dir(),
            "JDT LS config directory not found: {}",
            config_dir.display()
        );

        let port = match std::env::var("PORT") {
            Ok(raw) => raw.parse().context("PORT is not a valid port number")?,
            Err(_) => DEFAULT_PORT,
        };

        let mut commands = HashMap::new();
        commands.insert(
            Language::Java,
            language::java_command(&java_bin, &launcher_jar, &config_dir),
        );
        commands.insert(Language::Python, language::python_command());

        Ok(Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            workspace_root,
            commands,
            init_timeout: Duration::from_secs(30),
            forward_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(5),
        })
    }

    /// The launch command for `language` with the workspace path substituted,
    /// or `None` when the language has no configured server.
    pub fn server_command(&self, language: Language, workspace: &Path) -> Option<Vec<String>> {
        let workspace = workspace.display().to_string();
        self.commands.get(&language).map(|argv| {
            argv.iter()
                .map(|arg| arg.replace(WORKSPACE_PLACEHOLDER, &workspace))
                .collect()
        })
    }
}

/// Locate the Equinox launcher jar under the JDT LS plugins directory.
/// Several versioned jars may coexist; the first in lexical order wins.
pub fn find_launcher_jar(plugins_dir: &Path) -> Result<PathBuf> {
    let entries = std::fs::read_dir(plugins_dir)
        .with_context(|| format!("cannot read plugins directory {}", plugins_dir.display()))?;

    let mut jars: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| {
                    name.starts_with("org.eclipse.equinox.launcher_") && name.ends_with(".jar")
                })
        })
        .collect();
    jars.sort();

    jars.into_iter().next().with_context(|| {
        format!(
            "no org.eclipse.equinox.launcher_*.jar found in {}",
            plugins_dir.display()
        )
    })
}

const fn platform_config_dir() -> &'static str {
    if cfg!(target_os = "macos") {
        "config_mac"
    } else if cfg!(target_os = "windows") {
        "config_win"
    } else {
        "config_linux"
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Minimal config for tests: every language runs `argv`, timeouts are
    /// short, workspaces live under `workspace_root`.
    pub fn stub_config(workspace_root: &Path, argv: Vec<String>) -> Config {
        let mut commands = HashMap::new();
        commands.insert(Language::Java, argv.clone());
        commands.insert(Language::Python, argv);
        Config {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            workspace_root: workspace_root.to_path_buf(),
            commands,
            init_timeout: Duration::from_secs(5),
            forward_timeout: Duration::from_millis(500),
            shutdown_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn launcher_jar_glob_picks_first_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("org.eclipse.equinox.launcher_1.6.400.jar"),
            b"",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("org.eclipse.equinox.launcher_1.7.0.jar"),
            b"",
        )
        .unwrap();
        std::fs::write(dir.path().join("some.other.plugin_1.0.jar"), b"").unwrap();

        let jar = find_launcher_jar(dir.path()).unwrap();
        assert!(jar
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("org.eclipse.equinox.launcher_1.6"));
    }

    #[test]
    fn missing_launcher_jar_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_launcher_jar(dir.path()).is_err());
        assert!(find_launcher_jar(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn server_command_substitutes_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let config = stub_config(
            dir.path(),
            vec!["ls".into(), "-data".into(), WORKSPACE_PLACEHOLDER.into()],
        );
        let cmd = config
            .server_command(Language::Java, Path::new("/workspaces/abc"))
            .unwrap();
        assert_eq!(cmd, vec!["ls", "-data", "/workspaces/abc"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_uses_config_linux() {
        assert_eq!(platform_config_dir(), "config_linux");
    }
}
