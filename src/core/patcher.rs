//! Config Text Patcher
//!
//! Rewrites the templated configuration document so that each fixed policy's
//! enabled/disabled state and NAT state are reflected in the text: known rule
//! lines are commented out with a `[DISABLED]` marker (and restored
//! byte-identically on re-enable), and compensating `[AUTO-DROP]` deny blocks
//! are injected ahead of the LAN-wide acceptance rule for every disabled
//! TCP service.
//!
//! The patch is pure text transformation: it takes the document as a slice of
//! lines plus the current policy records and returns the rewritten lines. All
//! scan state is local to a single invocation. Three passes run in order:
//!
//! 1. strip every stale `[AUTO-DROP]` block, so repeated patching never
//!    accumulates auxiliary rules and the toggle pass never sees an injected
//!    deny directive between a recognizer comment and its real directive;
//! 2. toggle: a recognizer comment arms a pending enable/disable flag that is
//!    consumed by (and only by) the next directive line;
//! 3. insert fresh deny blocks for the currently disabled services.
//!
//! Applying the same policy state twice yields a byte-identical document.

use crate::core::error::{Error, Result};
use crate::core::policy::{
    recognize, PolicyKey, PolicyRule, RecognizerTarget, NAT_POLICY_ID,
};
use std::collections::HashMap;
use strum::IntoEnumIterator;

/// Marker carried by a commented-out (suspended) directive
pub const DISABLED_MARKER: &str = "[DISABLED]";

/// Marker prefixing every injected auxiliary deny block
pub const AUTO_DROP_MARKER: &str = "[AUTO-DROP]";

/// Directive lines following each `[AUTO-DROP]` marker comment
const AUTO_DROP_DIRECTIVES_PER_BLOCK: usize = 2;

/// Keywords identifying an engine directive line
const DIRECTIVE_KEYWORDS: [&str; 4] = ["accept", "drop", "reject", "masquerade"];

/// Indentation used for injected deny blocks (chain body depth)
const BLOCK_INDENT: &str = "\t\t";

/// Snapshot of policy state relevant to one patch invocation
struct PolicyState<'a> {
    by_key: HashMap<PolicyKey, &'a PolicyRule>,
    nat_enabled: bool,
}

impl<'a> PolicyState<'a> {
    fn new(policies: &'a [PolicyRule]) -> Self {
        let mut by_key = HashMap::new();
        for policy in policies {
            if let Some(key) = PolicyKey::iter().find(|k| k.policy_name() == policy.policy) {
                by_key.insert(key, policy);
            }
        }
        // Absent forward record leaves masquerading on; a missing row must
        // not silently comment out NAT.
        let nat_enabled = policies
            .iter()
            .find(|p| p.id == NAT_POLICY_ID)
            .is_none_or(|p| p.nat_enabled);
        Self { by_key, nat_enabled }
    }

    fn enabled(&self, key: PolicyKey) -> Option<bool> {
        self.by_key.get(&key).map(|p| p.rule_enabled)
    }

    /// Port variables of disabled TCP services, in seed order.
    fn disabled_port_variables(&self) -> Vec<&'static str> {
        PolicyKey::iter()
            .filter(|key| self.enabled(*key) == Some(false))
            .filter_map(PolicyKey::port_variable)
            .collect()
    }

    fn icmp_disabled(&self) -> bool {
        self.enabled(PolicyKey::Icmp) == Some(false)
    }
}

/// Rewrites `document` to reflect `policies`.
///
/// # Errors
///
/// Returns [`Error::Patch`] when deny blocks are required but the LAN-wide
/// acceptance anchor line is absent from the document. The input is never
/// modified on failure.
pub fn patch(document: &[String], policies: &[PolicyRule]) -> Result<Vec<String>> {
    let state = PolicyState::new(policies);
    let stripped = strip_auto_drop_blocks(document);
    let toggled = toggle_pass(&stripped, &state);
    insert_deny_blocks(toggled, &state)
}

/// Removes every previously inserted `[AUTO-DROP]` block: the marker comment
/// plus a fixed count of directive lines.
fn strip_auto_drop_blocks(lines: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    let mut skip = 0usize;
    for line in lines {
        if line.contains(AUTO_DROP_MARKER) {
            skip = AUTO_DROP_DIRECTIVES_PER_BLOCK;
            continue;
        }
        if skip > 0 {
            skip -= 1;
            continue;
        }
        out.push(line.clone());
    }
    out
}

/// A directive the engine would evaluate: non-empty, not comment-initial,
/// and carrying one of the verdict keywords.
fn is_active_directive(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return false;
    }
    DIRECTIVE_KEYWORDS.iter().any(|kw| trimmed.contains(kw))
}

/// A directive previously suspended by the patcher: comment marker with the
/// `[DISABLED]` tag immediately after it.
fn is_suspended_directive(line: &str) -> bool {
    line.trim_start()
        .strip_prefix('#')
        .is_some_and(|rest| rest.trim_start().starts_with(DISABLED_MARKER))
}

/// Comments a directive out, preserving its indentation after the marker so
/// the exact original line can be restored later.
fn suspend_line(line: &str) -> String {
    let indent = &line[..line.len() - line.trim_start().len()];
    format!("#{indent}{DISABLED_MARKER} {}", line.trim())
}

/// Restores a suspended directive to its original form.
fn restore_line(line: &str) -> Option<String> {
    let (prefix, content) = line.split_once(DISABLED_MARKER)?;
    let indent = prefix.replacen('#', "", 1);
    Some(format!("{indent}{}", content.trim_start()))
}

/// The single scan implementing the recognizer/flag algorithm.
///
/// A recognizer comment arms `pending_disable`/`pending_enable` for the
/// policy it names (the NAT recognizer reads the NAT flag instead). The next
/// directive line consumes the pending state: an active directive is
/// suspended, a suspended one restored. Any directive line, matched or not,
/// clears both flags, bounding their lifetime to exactly the directive that
/// follows the recognizer.
fn toggle_pass(lines: &[String], state: &PolicyState<'_>) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    let mut pending_disable = false;
    let mut pending_enable = false;

    for line in lines {
        match recognize(line) {
            Some(RecognizerTarget::Policy(key)) => {
                if let Some(enabled) = state.enabled(key) {
                    pending_disable = !enabled;
                    pending_enable = enabled;
                }
            }
            Some(RecognizerTarget::NatMasquerade) => {
                pending_disable = !state.nat_enabled;
                pending_enable = state.nat_enabled;
            }
            None => {}
        }

        let active = is_active_directive(line);
        let suspended = is_suspended_directive(line);

        if pending_disable && active {
            out.push(suspend_line(line));
            pending_disable = false;
            pending_enable = false;
            continue;
        }

        if pending_enable && suspended {
            if let Some(restored) = restore_line(line) {
                out.push(restored);
                pending_disable = false;
                pending_enable = false;
                continue;
            }
        }

        out.push(line.clone());

        if active || suspended {
            pending_disable = false;
            pending_enable = false;
        }
    }

    out
}

/// Injects one deny block per disabled TCP service (covering the overlay and
/// LAN ingress paths) and, when ICMP handling is disabled, a block denying
/// ICMPv4 and ICMPv6 on the LAN path — all immediately before the LAN-wide
/// acceptance rule so they take precedence over it.
fn insert_deny_blocks(mut lines: Vec<String>, state: &PolicyState<'_>) -> Result<Vec<String>> {
    let disabled_ports = state.disabled_port_variables();
    let icmp_disabled = state.icmp_disabled();
    if disabled_ports.is_empty() && !icmp_disabled {
        return Ok(lines);
    }

    let anchor = lines
        .iter()
        .position(|l| recognize(l) == Some(RecognizerTarget::Policy(PolicyKey::Lan)))
        .ok_or_else(|| Error::Patch {
            message: "LAN-wide acceptance anchor not found in document".to_string(),
        })?;

    let mut block = Vec::new();
    for port in &disabled_ports {
        block.push(format!("{BLOCK_INDENT}# {AUTO_DROP_MARKER} Disabled TCP port {port}"));
        block.push(format!(
            "{BLOCK_INDENT}tcp dport {port} ip saddr $TAILNET counter drop"
        ));
        block.push(format!(
            "{BLOCK_INDENT}iifname $LAN tcp dport {port} counter drop"
        ));
    }
    if icmp_disabled {
        block.push(format!("{BLOCK_INDENT}# {AUTO_DROP_MARKER} Disabled ICMP (ping)"));
        block.push(format!(
            "{BLOCK_INDENT}iifname $LAN ip protocol icmp counter drop"
        ));
        block.push(format!(
            "{BLOCK_INDENT}iifname $LAN ip6 nexthdr icmpv6 counter drop"
        ));
    }

    lines.splice(anchor..anchor, block);
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::seed_policies;
    use chrono::Utc;
    use proptest::prelude::*;

    const SAMPLE_DOCUMENT: &str = r#"#!/usr/sbin/nft -f

flush ruleset

define LAN = "br0"
define WAN = "eth1"
define TAILNET = 100.64.0.0/10
define NODERED_PORT = 1880
define TEMPORAL_PORT = 1889
define FASTAPI_PORT = 8000
define SSH_PORT = 22
define DNS_PORT = 53

table inet filter {
	set blacklist_v4 {
		type ipv4_addr
		flags interval
	}

	chain input {
		type filter hook input priority 0; policy drop;

		ct state established,related accept
		iif "lo" accept
		ip saddr @blacklist_v4 counter drop

		# Allowing Node-Red over the overlay network
		tcp dport $NODERED_PORT ip saddr $TAILNET counter accept
		# Allow Node-Red from the LAN
		iifname $LAN tcp dport $NODERED_PORT counter accept

		# Allow Temporal Policy (overlay)
		tcp dport $TEMPORAL_PORT ip saddr $TAILNET counter accept
		# Allow Temporal Policy (LAN)
		iifname $LAN tcp dport $TEMPORAL_PORT counter accept

		# Allow FastAPI (overlay)
		tcp dport $FASTAPI_PORT ip saddr $TAILNET counter accept
		# Allow FastAPI (LAN)
		iifname $LAN tcp dport $FASTAPI_PORT counter accept

		# SSH with rate limiting
		tcp dport $SSH_PORT ct state new limit rate 10/minute counter accept

		# ICMP handling
		ip protocol icmp icmp type echo-request limit rate 5/second counter accept

		# DNS queries to firewall
		iifname $LAN udp dport $DNS_PORT counter accept

		# LAN access
		iifname $LAN counter accept
	}

	chain forward {
		type filter hook forward priority 0; policy drop;

		ct state established,related accept

		# LAN -> WAN forwarding
		iifname $LAN oifname $WAN counter accept
	}
}

table inet nat {
	chain postrouting {
		type nat hook postrouting priority 100;

		# Masquerade LAN traffic
		oifname $WAN masquerade
	}
}
"#;

    fn sample_lines() -> Vec<String> {
        SAMPLE_DOCUMENT.lines().map(String::from).collect()
    }

    fn policies_with(disabled: &[PolicyKey], nat_enabled: bool) -> Vec<PolicyRule> {
        let mut policies = seed_policies(Utc::now());
        for policy in &mut policies {
            if disabled
                .iter()
                .any(|key| key.policy_name() == policy.policy)
            {
                policy.rule_enabled = false;
            }
            if policy.id == NAT_POLICY_ID {
                policy.nat_enabled = nat_enabled;
            }
        }
        policies
    }

    #[test]
    fn test_all_enabled_is_identity() {
        let lines = sample_lines();
        let patched = patch(&lines, &policies_with(&[], true)).unwrap();
        assert_eq!(patched, lines);
    }

    #[test]
    fn test_disable_suspends_both_recognized_lines() {
        let lines = sample_lines();
        let patched = patch(&lines, &policies_with(&[PolicyKey::NodeRed], true)).unwrap();

        let suspended: Vec<&String> = patched
            .iter()
            .filter(|l| is_suspended_directive(l))
            .collect();
        assert_eq!(suspended.len(), 2, "overlay and LAN paths both suspended");
        assert!(suspended[0].contains("tcp dport $NODERED_PORT ip saddr $TAILNET"));
        assert!(suspended[1].contains("iifname $LAN tcp dport $NODERED_PORT"));
        // Comment marker must be at column zero for the engine to skip it.
        assert!(suspended.iter().all(|l| l.starts_with('#')));
    }

    #[test]
    fn test_round_trip_restores_exact_lines() {
        let lines = sample_lines();
        let disabled = patch(&lines, &policies_with(&[PolicyKey::Ssh], true)).unwrap();
        assert_ne!(disabled, lines);
        let restored = patch(&disabled, &policies_with(&[], true)).unwrap();
        assert_eq!(restored, lines);
    }

    #[test]
    fn test_disjointness() {
        let lines = sample_lines();
        let patched = patch(&lines, &policies_with(&[PolicyKey::Temporal], true)).unwrap();

        // Only Temporal lines and the injected deny block differ; every line
        // mentioning other services is untouched.
        for line in &patched {
            if line.contains("NODERED") || line.contains("FASTAPI") || line.contains("SSH_PORT") {
                assert!(
                    !line.contains(DISABLED_MARKER),
                    "unrelated policy line was rewritten: {line}"
                );
            }
        }
    }

    #[test]
    fn test_deny_block_inserted_before_lan_accept() {
        let lines = sample_lines();
        let patched = patch(&lines, &policies_with(&[PolicyKey::NodeRed], true)).unwrap();

        let marker_idx = patched
            .iter()
            .position(|l| l.contains(AUTO_DROP_MARKER))
            .expect("deny block present");
        assert!(patched[marker_idx].contains("$NODERED_PORT"));
        assert!(patched[marker_idx + 1].contains("ip saddr $TAILNET counter drop"));
        assert!(patched[marker_idx + 2].contains("iifname $LAN tcp dport $NODERED_PORT counter drop"));

        let anchor_idx = patched
            .iter()
            .position(|l| recognize(l) == Some(RecognizerTarget::Policy(PolicyKey::Lan)))
            .unwrap();
        assert!(marker_idx < anchor_idx, "deny block precedes the LAN accept");
    }

    #[test]
    fn test_icmp_block_has_v4_and_v6_denies() {
        let lines = sample_lines();
        let patched = patch(&lines, &policies_with(&[PolicyKey::Icmp], true)).unwrap();

        let marker_idx = patched
            .iter()
            .position(|l| l.contains(AUTO_DROP_MARKER))
            .unwrap();
        assert!(patched[marker_idx].contains("ICMP"));
        assert!(patched[marker_idx + 1].contains("ip protocol icmp counter drop"));
        assert!(patched[marker_idx + 2].contains("ip6 nexthdr icmpv6 counter drop"));
    }

    #[test]
    fn test_idempotence_with_disabled_services() {
        let lines = sample_lines();
        let policies = policies_with(&[PolicyKey::NodeRed, PolicyKey::Icmp], true);
        let once = patch(&lines, &policies).unwrap();
        let twice = patch(&once, &policies).unwrap();
        assert_eq!(once, twice, "repeated patch must be byte-identical");
    }

    #[test]
    fn test_nat_toggle_suspends_masquerade_only() {
        let lines = sample_lines();
        let patched = patch(&lines, &policies_with(&[], false)).unwrap();

        let suspended: Vec<&String> = patched
            .iter()
            .filter(|l| is_suspended_directive(l))
            .collect();
        assert_eq!(suspended.len(), 1);
        assert!(suspended[0].contains("masquerade"));

        let restored = patch(&patched, &policies_with(&[], true)).unwrap();
        assert_eq!(restored, lines);
    }

    #[test]
    fn test_missing_anchor_fails_only_when_blocks_needed() {
        let lines: Vec<String> = sample_lines()
            .into_iter()
            .filter(|l| recognize(l) != Some(RecognizerTarget::Policy(PolicyKey::Lan)))
            .collect();

        // No services disabled: anchor is not needed.
        assert!(patch(&lines, &policies_with(&[], true)).is_ok());

        let err = patch(&lines, &policies_with(&[PolicyKey::Ssh], true)).unwrap_err();
        assert!(matches!(err, Error::Patch { .. }));
    }

    #[test]
    fn test_stale_blocks_removed_when_service_reenabled() {
        let lines = sample_lines();
        let disabled = patch(&lines, &policies_with(&[PolicyKey::Dns], true)).unwrap();
        assert!(disabled.iter().any(|l| l.contains(AUTO_DROP_MARKER)));

        let reenabled = patch(&disabled, &policies_with(&[], true)).unwrap();
        assert!(reenabled.iter().all(|l| !l.contains(AUTO_DROP_MARKER)));
        assert_eq!(reenabled, lines);
    }

    #[test]
    fn test_suspend_line_preserves_indent() {
        let line = "\t\ttcp dport 22 counter accept";
        let suspended = suspend_line(line);
        assert_eq!(suspended, "#\t\t[DISABLED] tcp dport 22 counter accept");
        assert_eq!(restore_line(&suspended).unwrap(), line);
    }

    #[test]
    fn test_directive_classification() {
        assert!(is_active_directive("\t\ttcp dport 80 counter accept"));
        assert!(is_active_directive("\t\toifname $WAN masquerade"));
        assert!(!is_active_directive("\t\t# comment mentioning accept"));
        assert!(!is_active_directive(""));
        assert!(!is_active_directive("\t\tdefine LAN = \"br0\""));

        assert!(is_suspended_directive("#\t\t[DISABLED] tcp dport 80 accept"));
        assert!(!is_suspended_directive("\t\ttcp dport 80 accept"));
        assert!(!is_suspended_directive("# plain comment"));
    }

    proptest! {
        /// Any combination of policy states patches idempotently, and
        /// restoring all policies recovers the pristine document.
        #[test]
        fn prop_patch_idempotent(mask in 0u8..=0xFF, nat in any::<bool>()) {
            use strum::IntoEnumIterator;
            let disabled: Vec<PolicyKey> = PolicyKey::iter()
                .enumerate()
                // Management API and LAN acceptance stay enabled: the plane
                // rejects disabling them before the patcher ever runs.
                .filter(|(_, k)| !matches!(k, PolicyKey::Api | PolicyKey::Lan))
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, k)| k)
                .collect();
            let policies = policies_with(&disabled, nat);
            let lines = sample_lines();

            let once = patch(&lines, &policies).unwrap();
            let twice = patch(&once, &policies).unwrap();
            prop_assert_eq!(&once, &twice);

            let restored = patch(&once, &policies_with(&[], true)).unwrap();
            prop_assert_eq!(restored, lines);
        }
    }
}
