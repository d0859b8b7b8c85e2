//! Input validation and sanitization
//!
//! Centralized validation for all externally supplied values. Everything here
//! runs before any store write or engine invocation, so a rejected input has
//! no side effects.

use crate::core::error::{Error, Result};
use crate::core::policy::CustomRuleDraft;
use std::net::IpAddr;
use std::str::FromStr;

/// Sanitizes a rule name for safe use in engine comment strings.
///
/// Removes control characters, quotes, and shell metacharacters and limits
/// length to 64 bytes (ASCII characters only).
///
/// SECURITY: Uses `is_ascii_alphanumeric()` to prevent Unicode-based bypasses
/// and ensure names stay within system limits.
///
/// # Examples
///
/// ```
/// use fwplane::validators::sanitize_name;
///
/// let safe = sanitize_name("Web Server");
/// assert_eq!(safe, "Web Server");
///
/// let unsafe_name = "Test\nNewline\"Quote";
/// let safe = sanitize_name(unsafe_name);
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_name(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            // SECURITY: ASCII-only to prevent Unicode bypasses and multi-byte issues
            c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':')
        })
        .take(64)
        .collect()
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16> {
    if port == 0 {
        Err(Error::validation("port", "must be between 1 and 65535"))
    } else {
        Ok(port)
    }
}

/// Validates a custom rule draft before it reaches the store or the engine.
///
/// # Errors
///
/// Returns `Err` if:
/// - the name is empty (or empty after sanitization)
/// - the port is 0
/// - no access scope is selected (the expansion would be empty)
pub fn validate_custom_rule(draft: &CustomRuleDraft) -> Result<()> {
    if draft.name.trim().is_empty() {
        return Err(Error::validation("name", "name is required"));
    }
    if sanitize_name(&draft.name).is_empty() {
        return Err(Error::validation(
            "name",
            "name contains only invalid characters",
        ));
    }
    validate_port(draft.port)?;
    if !draft.has_scope() {
        return Err(Error::validation(
            "access",
            "at least one access scope (LAN, overlay, WAN) is required",
        ));
    }
    Ok(())
}

/// Parses and validates a denylist address (v4 or v6).
///
/// # Errors
///
/// Returns `Err` for anything that is not a literal IP address.
pub fn validate_ip_address(input: &str) -> Result<IpAddr> {
    IpAddr::from_str(input.trim())
        .map_err(|_| Error::validation("ip_address", format!("'{input}' is not a valid IP address")))
}
