//! Locating the worker executable

use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Install locations checked after `PATH`
pub const WELL_KNOWN_PATHS: &[&str] = &[
    "/usr/local/bin/gost",
    "/usr/bin/gost",
    "/opt/homebrew/bin/gost",
    "/usr/local/opt/gost/bin/gost",
    "./gost",
];

/// Finds the worker binary and reports its version
pub trait ExecutableResolver: Send + Sync {
    /// Absolute or relative path of the executable, if one is installed
    fn resolve(&self) -> Option<PathBuf>;

    /// First line of the executable's version output
    fn version(&self) -> Option<String>;

    fn diagnostics(&self) -> WorkerDiagnostics;
}

/// Where the resolver looked and what it found
#[derive(Debug, Clone, Serialize)]
pub struct WorkerDiagnostics {
    pub command: String,
    pub path_env: String,
    pub search_path_hit: Option<PathBuf>,
    pub well_known_found: Vec<PathBuf>,
    pub resolved: Option<PathBuf>,
    pub version: Option<String>,
}

/// Searches `PATH`, the well-known locations, then configured extras
#[derive(Debug, Clone)]
pub struct SearchPathResolver {
    command: String,
    extra_search_paths: Vec<PathBuf>,
    version_flag: String,
}

impl SearchPathResolver {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            extra_search_paths: Vec::new(),
            version_flag: "-V".to_string(),
        }
    }

    pub fn with_extra_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.extra_search_paths = paths;
        self
    }

    pub fn with_version_flag(mut self, flag: impl Into<String>) -> Self {
        self.version_flag = flag.into();
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn search_path(&self, path_env: Option<OsString>) -> Option<PathBuf> {
        let command = Path::new(&self.command);
        if command.components().count() > 1 {
            return is_executable(command).then(|| command.to_path_buf());
        }

        let path_env = path_env?;
        std::env::split_paths(&path_env)
            .flat_map(|dir| candidates(&dir, &self.command))
            .find(|candidate| is_executable(candidate))
    }

    fn well_known(&self) -> Vec<PathBuf> {
        WELL_KNOWN_PATHS
            .iter()
            .map(PathBuf::from)
            .chain(self.extra_search_paths.iter().cloned())
            .filter(|p| is_executable(p))
            .collect()
    }
}

impl ExecutableResolver for SearchPathResolver {
    fn resolve(&self) -> Option<PathBuf> {
        let found = self
            .search_path(std::env::var_os("PATH"))
            .or_else(|| self.well_known().into_iter().next());
        debug!(command = %self.command, resolved = ?found, "Resolved worker executable");
        found
    }

    fn version(&self) -> Option<String> {
        let exe = self.resolve()?;
        let output = Command::new(&exe)
            .arg(&self.version_flag)
            .stdin(Stdio::null())
            .output()
            .ok()?;

        // Some builds print the version on stderr
        let text = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr).into_owned()
        } else {
            String::from_utf8_lossy(&output.stdout).into_owned()
        };
        text.lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }

    fn diagnostics(&self) -> WorkerDiagnostics {
        let path_env = std::env::var_os("PATH");
        WorkerDiagnostics {
            command: self.command.clone(),
            path_env: path_env
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            search_path_hit: self.search_path(path_env),
            well_known_found: self.well_known(),
            resolved: self.resolve(),
            version: self.version(),
        }
    }
}

fn candidates(dir: &Path, command: &str) -> Vec<PathBuf> {
    if cfg!(windows) {
        vec![dir.join(format!("{}.exe", command)), dir.join(command)]
    } else {
        vec![dir.join(command)]
    }
}

/// Regular file with at least one execute bit
fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}
