//! Activation Coordinator
//!
//! Drives a policy mutation to the live engine: run the patcher over the
//! current configuration document, commit the rewritten document atomically,
//! reload the engine from it (with a direct-reload fallback), and terminate
//! established sessions of a just-disabled service.
//!
//! When both reload paths fail the document is deliberately left as written:
//! a written document with a failed reload is surfaced to the operator as
//! [`Error::Reload`], which is preferable to silently discarding an
//! administrator's requested change.

use crate::config::AppConfig;
use crate::core::engine;
use crate::core::error::{Error, Result};
use crate::core::patcher;
use crate::core::policy::PolicyRule;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Reads the configuration document as lines.
///
/// # Errors
///
/// Returns [`Error::ConfigMissing`] when the file does not exist; the caller
/// retains the last successfully committed document.
pub async fn read_document(path: &Path) -> Result<Vec<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text.lines().map(String::from).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::ConfigMissing {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Writes the document atomically: temp file in the target directory, then
/// rename. Falls back to an elevated `install` when the directory is not
/// writable by this process (the usual case for `/etc`).
pub async fn write_document(path: &Path, lines: &[String]) -> Result<()> {
    let rendered = render_document(lines);

    match write_direct(path, &rendered) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            write_elevated(path, &rendered).await
        }
        Err(e) => Err(e.into()),
    }
}

fn render_document(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn write_direct(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(contents.as_bytes())?;
    temp.flush()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

async fn write_elevated(path: &Path, contents: &str) -> Result<()> {
    let mut temp = tempfile::NamedTempFile::new()?;
    temp.write_all(contents.as_bytes())?;
    temp.flush()?;

    let temp_path = temp.path().to_string_lossy().to_string();
    let target = path.to_string_lossy().to_string();
    let mut cmd =
        crate::elevation::create_elevated_install_command(&["-m", "644", &temp_path, &target])
            .map_err(|e| Error::Elevation(e.to_string()))?;
    let status = cmd
        .status()
        .await
        .map_err(|e| Error::Internal(format!("failed to spawn install: {e}")))?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "elevated install of {target} exited with {status}"
        )))
    }
}

/// Rewrites the configuration document for the given policy state, commits
/// it, and reloads the engine.
///
/// `terminated_port`, when set, names the TCP port of a policy this mutation
/// disabled; after a successful reload its established sessions are
/// terminated (failure to do so is logged, not fatal: no new session can
/// form once the reload landed).
///
/// # Errors
///
/// - [`Error::ConfigMissing`] / [`Error::Patch`]: nothing was written.
/// - [`Error::Reload`]: the document was written but the engine did not pick
///   it up on either path; the inconsistency must be surfaced.
pub async fn commit(
    config: &AppConfig,
    policies: &[PolicyRule],
    terminated_port: Option<u16>,
) -> Result<()> {
    let document = read_document(&config.nftables_conf).await?;
    let patched = patcher::patch(&document, policies)?;

    write_document(&config.nftables_conf, &patched).await?;
    info!(path = %config.nftables_conf.display(), "configuration document committed");

    engine::reload(&config.nftables_conf).await?;

    if let Some(port) = terminated_port {
        if let Err(e) = engine::terminate_sessions(port).await {
            warn!(port, error = %e, "failed to terminate established sessions");
        } else {
            info!(port, "terminated established sessions of disabled service");
        }
    }

    Ok(())
}
