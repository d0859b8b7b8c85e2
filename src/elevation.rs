//! Privilege elevation for system operations
//!
//! The control plane runs as an unprivileged user and only elevates for the
//! specific binaries it drives:
//!
//! - **nft**: live directive add/list/delete, set elements, full reloads
//! - **systemctl**: the primary configuration reload path
//! - **conntrack**: terminating established sessions of a disabled service
//! - **install**: writing the configuration document to system locations
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **CLI fallback**: `sudo` for terminal environments
//! - **Non-tty fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `FWPLANE_ELEVATION_METHOD`: force a specific method (`sudo`, `run0`, or
//!   `pkexec`). Useful for scripts with sudoers NOPASSWD rules.
//! - `FWPLANE_TEST_NO_ELEVATION`: bypass elevation entirely (for testing
//!   only).
//!
//! # Security
//!
//! - Only the approved binaries above can be elevated
//! - Commands are constructed without shell interpolation
//! - Callers validate all arguments before elevation
//! - Audit logging tracks the surrounding operations (via caller)

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `FWPLANE_ELEVATION_METHOD`
    #[error("Invalid FWPLANE_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Internal helper to build an elevated command for a specific program.
///
/// Not exposed publicly - callers must use the specific constructors below so
/// only approved binaries can be elevated.
fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict test mode override (highest priority)
    if std::env::var("FWPLANE_TEST_NO_ELEVATION").is_ok() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Direct root execution (no prompt needed)
    let is_root = nix::unistd::getuid().is_root();
    if is_root {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("FWPLANE_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" => {
                    if !binary_exists("sudo") {
                        return Err(ElevationError::MethodNotAvailable("sudo".into()));
                    }
                    let mut cmd = Command::new("sudo");
                    cmd.arg(program).args(args);
                    Ok(cmd)
                }
                "run0" => {
                    if !binary_exists("run0") {
                        return Err(ElevationError::MethodNotAvailable("run0".into()));
                    }
                    let mut cmd = Command::new("run0");
                    cmd.arg(program).args(args);
                    Ok(cmd)
                }
                "pkexec" => {
                    if !binary_exists("pkexec") {
                        return Err(ElevationError::MethodNotAvailable("pkexec".into()));
                    }
                    let mut cmd = Command::new("pkexec");
                    cmd.arg(program).args(args);
                    Ok(cmd)
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (modern, no SUID), fallback to sudo/pkexec
    if binary_exists("run0") {
        let mut cmd = Command::new("run0");
        cmd.arg(program).args(args);
        return Ok(cmd);
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);

    if is_atty {
        let mut cmd = Command::new("sudo");
        cmd.arg(program).args(args);
        Ok(cmd)
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }

        let mut cmd = Command::new("pkexec");
        cmd.arg(program).args(args);
        Ok(cmd)
    }
}

/// Creates an elevated `nft` command with the specified arguments.
///
/// Arguments are passed directly to `nft` without shell interpretation;
/// callers must validate them first.
pub fn create_elevated_nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command("nft", args)
}

/// Creates an elevated `systemctl` command (used for the primary reload path).
pub fn create_elevated_systemctl_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command("systemctl", args)
}

/// Creates an elevated `conntrack` command (used to terminate established
/// sessions of a disabled service).
pub fn create_elevated_conntrack_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command("conntrack", args)
}

/// Creates an elevated `install` command, used for writing the configuration
/// document to system locations like `/etc/nftables.conf`.
pub fn create_elevated_install_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command("install", args)
}
