//! Utility functions for directory management
//!
//! Helper functions following the XDG Base Directory specification for
//! portable storage across Linux distributions.
//!
//! # Directory Structure
//!
//! - Data: `~/.local/share/fwplane/` - rule store tables
//! - State: `~/.local/state/fwplane/` - audit log
//!
//! Both locations can be overridden with `FWPLANE_DATA_DIR` /
//! `FWPLANE_STATE_DIR`, which the test suites use to point the store and
//! audit log at temporary directories.

use directories::ProjectDirs;
use std::path::PathBuf;

pub fn get_data_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("FWPLANE_DATA_DIR") {
        return Some(PathBuf::from(dir));
    }
    ProjectDirs::from("com", "fwplane", "fwplane").map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("FWPLANE_STATE_DIR") {
        return Some(PathBuf::from(dir));
    }
    ProjectDirs::from("com", "fwplane", "fwplane")
        .and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        if let Some(dir) = get_data_dir() {
            builder.create(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_data_dir() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}
