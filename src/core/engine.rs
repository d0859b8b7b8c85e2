//! Filtering engine control surface
//!
//! Thin wrappers around the external binaries this control plane drives:
//! `nft` for incremental directive operations and full reloads, `systemctl`
//! for the primary reload path, and `conntrack` for terminating established
//! sessions. Every invocation is elevated through [`crate::elevation`] and
//! captured; failures map into the structured error taxonomy.

use crate::core::error::{Error, Result};
use crate::core::policy::Chain;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// Upper bound on any single engine invocation.
///
/// Reloads and chain listings finish in well under a second; a hung helper
/// must not wedge the mutation lock indefinitely.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Table family holding every chain and set this plane manages
const TABLE_FAMILY: &str = "inet";
/// Table name holding every chain and set this plane manages
const TABLE_NAME: &str = "filter";

/// Named address sets mirroring the denylist
const BLACKLIST_SET_V4: &str = "blacklist_v4";
const BLACKLIST_SET_V6: &str = "blacklist_v6";

async fn run_captured(cmd: &mut Command, what: &str) -> Result<std::process::Output> {
    match tokio::time::timeout(COMMAND_TIMEOUT, cmd.output()).await {
        Ok(output) => {
            output.map_err(|e| Error::Internal(format!("failed to spawn {what}: {e}")))
        }
        Err(_) => Err(Error::Engine {
            message: format!("{what} timed out after {}s", COMMAND_TIMEOUT.as_secs()),
            stderr: None,
            exit_code: None,
        }),
    }
}

/// Runs `nft` with the given arguments and returns stdout on success.
///
/// # Errors
///
/// Returns [`Error::Engine`] when nft exits non-zero, with captured stderr
/// and exit code.
pub async fn run_nft(args: &[&str]) -> Result<String> {
    let mut cmd = crate::elevation::create_elevated_nft_command(args)
        .map_err(|e| Error::Elevation(e.to_string()))?;
    let output = run_captured(&mut cmd, "nft").await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(Error::Engine {
            message: format!("nft {} failed", args.first().copied().unwrap_or_default()),
            stderr: Some(stderr),
            exit_code: output.status.code(),
        })
    }
}

/// Submits one directive to a chain.
pub async fn add_rule(chain: Chain, args: &[String]) -> Result<()> {
    let mut full: Vec<&str> = vec!["add", "rule", TABLE_FAMILY, TABLE_NAME, chain.as_str()];
    full.extend(args.iter().map(String::as_str));
    run_nft(&full).await?;
    Ok(())
}

/// Lists a chain's live directives with engine-assigned positional handles.
pub async fn list_chain(chain: Chain) -> Result<String> {
    run_nft(&["-a", "list", "chain", TABLE_FAMILY, TABLE_NAME, chain.as_str()]).await
}

/// Deletes one live directive by handle.
pub async fn delete_rule(chain: Chain, handle: u64) -> Result<()> {
    let handle = handle.to_string();
    run_nft(&[
        "delete",
        "rule",
        TABLE_FAMILY,
        TABLE_NAME,
        chain.as_str(),
        "handle",
        handle.as_str(),
    ])
    .await?;
    Ok(())
}

/// Name of the denylist set matching an address family.
pub fn blacklist_set_for(ip: IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => BLACKLIST_SET_V4,
        IpAddr::V6(_) => BLACKLIST_SET_V6,
    }
}

/// Adds an address to the live denylist set.
pub async fn add_set_element(ip: IpAddr) -> Result<()> {
    let addr = ip.to_string();
    run_nft(&[
        "add",
        "element",
        TABLE_FAMILY,
        TABLE_NAME,
        blacklist_set_for(ip),
        "{",
        addr.as_str(),
        "}",
    ])
    .await?;
    Ok(())
}

/// Removes an address from the live denylist set.
pub async fn remove_set_element(ip: IpAddr) -> Result<()> {
    let addr = ip.to_string();
    run_nft(&[
        "delete",
        "element",
        TABLE_FAMILY,
        TABLE_NAME,
        blacklist_set_for(ip),
        "{",
        addr.as_str(),
        "}",
    ])
    .await?;
    Ok(())
}

/// Reloads the engine from the configuration document.
///
/// Primary path is a service reload; when that fails, a direct full reload of
/// the document is attempted. The document is applied atomically by the
/// engine: a malformed document leaves the previous live rule set untouched.
///
/// # Errors
///
/// Returns [`Error::Reload`] only when both paths fail.
pub async fn reload(document: &Path) -> Result<()> {
    let mut cmd = crate::elevation::create_elevated_systemctl_command(&["reload", "nftables"])
        .map_err(|e| Error::Elevation(e.to_string()))?;
    let output = run_captured(&mut cmd, "systemctl").await?;

    if output.status.success() {
        info!("engine reloaded via service manager");
        return Ok(());
    }

    let primary_stderr = String::from_utf8_lossy(&output.stderr).to_string();
    warn!(
        stderr = %primary_stderr.trim(),
        "service reload failed, falling back to direct reload"
    );

    let document = document.to_string_lossy().to_string();
    match run_nft(&["-f", document.as_str()]).await {
        Ok(_) => {
            info!("engine reloaded directly from {document}");
            Ok(())
        }
        Err(Error::Engine {
            stderr, exit_code, ..
        }) => Err(Error::Reload {
            message: "both reload paths failed".to_string(),
            stderr,
            exit_code,
        }),
        Err(e) => Err(e),
    }
}

/// Terminates established sessions matching a TCP destination port.
///
/// Already-forwarded sessions would otherwise persist until they expire even
/// though no new session can form; callers treat failure as non-fatal.
pub async fn terminate_sessions(port: u16) -> Result<()> {
    let port = port.to_string();
    let mut cmd = crate::elevation::create_elevated_conntrack_command(&[
        "-D",
        "-p",
        "tcp",
        "--dport",
        port.as_str(),
    ])
    .map_err(|e| Error::Elevation(e.to_string()))?;
    let output = run_captured(&mut cmd, "conntrack").await?;

    if output.status.success() {
        Ok(())
    } else {
        // conntrack exits non-zero when no entries matched as well; the
        // caller only logs this.
        Err(Error::Engine {
            message: format!("conntrack -D --dport {port} failed"),
            stderr: Some(String::from_utf8_lossy(&output.stderr).to_string()),
            exit_code: output.status.code(),
        })
    }
}
