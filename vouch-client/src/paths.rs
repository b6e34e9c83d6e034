//! Operating-system-specific file locations

use directories::ProjectDirs;
use std::path::PathBuf;

/// The application's directories, if the OS has a notion of them
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "vouch")
}

/// Where the optional `config.toml` lives
pub fn config_file() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Where the session is persisted, unless configured otherwise.
/// Falls back to the working directory when there's no home directory.
pub fn default_session_file() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".vouch"))
        .join("session.json")
}
