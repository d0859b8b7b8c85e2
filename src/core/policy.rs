//! Policy data structures, the seeded fixed-policy table, and the
//! configuration-document recognizer table
//!
//! Two kinds of rules exist, with deliberately different persistence paths:
//!
//! - [`PolicyRule`]: a closed, pre-seeded set of fixed policies. Their
//!   enabled/NAT state is reflected into the static configuration document by
//!   the patcher and survives engine restarts through that document.
//! - [`CustomRule`]: user-defined rules applied incrementally to the live
//!   engine. They never appear in the document; their live presence depends
//!   on the startup restorer replaying them from the store.
//!
//! The recognizer table maps fixed comment patterns in the configuration
//! document to policy identity. It is versioned and exhaustive so that
//! recognizer drift is caught by a single test over all seeded policies
//! rather than discovered in production.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Maximum number of custom rules allowed in the store
///
/// Limit prevents memory exhaustion from runaway rule creation. 1000 rules is
/// well beyond typical use cases.
pub const MAX_CUSTOM_RULES: usize = 1000;

/// The fixed policy guarding the management API (must never be disabled)
pub const MANAGEMENT_API_POLICY_ID: i64 = 11;

/// The fixed policy whose `nat_enabled` flag governs masquerading
pub const NAT_POLICY_ID: i64 = 16;

/// Network protocol selection for a custom rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    /// Transmission Control Protocol
    #[default]
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
    /// Both TCP and UDP (common for services like DNS, VPNs, game servers)
    #[strum(serialize = "both")]
    Both,
}

impl Protocol {
    /// Returns the engine protocol keywords this selection expands to.
    pub const fn expand(self) -> &'static [&'static str] {
        match self {
            Protocol::Tcp => &["tcp"],
            Protocol::Udp => &["udp"],
            Protocol::Both => &["tcp", "udp"],
        }
    }
}

/// Verdict a custom rule applies to matching traffic
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum RuleAction {
    /// Accept the packet (allow it through)
    #[default]
    #[strum(serialize = "accept")]
    Accept,
    /// Drop the packet silently (no response sent)
    #[strum(serialize = "drop")]
    Drop,
}

impl RuleAction {
    /// Returns the lowercase engine keyword for this action.
    pub const fn as_str(self) -> &'static str {
        match self {
            RuleAction::Accept => "accept",
            RuleAction::Drop => "drop",
        }
    }
}

/// Directive chain evaluated for a traffic direction
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Chain {
    #[strum(serialize = "input")]
    Input,
    #[strum(serialize = "forward")]
    Forward,
    #[strum(serialize = "output")]
    Output,
}

impl Chain {
    /// Returns the engine chain name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Chain::Input => "input",
            Chain::Forward => "forward",
            Chain::Output => "output",
        }
    }

    /// All chains the applier may place directives in.
    pub const ALL: [Chain; 3] = [Chain::Input, Chain::Forward, Chain::Output];
}

/// A fixed, pre-seeded firewall policy
///
/// Identity is stable across the system's lifetime; the set of policies is
/// closed (not user-extensible). `nat_enabled` is meaningful only for the
/// policy governing address translation ([`NAT_POLICY_ID`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRule {
    pub id: i64,
    /// Stable label used to pattern-match configuration text
    pub policy: String,
    pub rule_enabled: bool,
    pub nat_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which boolean field of a [`PolicyRule`] a toggle targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::AsRefStr)]
pub enum PolicyField {
    #[strum(serialize = "rule_enabled")]
    RuleEnabled,
    #[strum(serialize = "nat_enabled")]
    NatEnabled,
}

/// A user-defined rule applied incrementally to the live engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomRule {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub port: u16,
    pub protocol: Protocol,
    pub action: RuleAction,
    /// Traffic arriving on the LAN bridge
    pub access_lan: bool,
    /// Traffic sourced from the private overlay network
    pub access_overlay: bool,
    /// Traffic arriving on the public interface
    pub access_wan: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a custom rule (id and timestamps are store-assigned)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRuleDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub action: RuleAction,
    #[serde(default)]
    pub access_lan: bool,
    #[serde(default)]
    pub access_overlay: bool,
    #[serde(default)]
    pub access_wan: bool,
}

impl CustomRuleDraft {
    /// True if at least one access scope is selected.
    pub const fn has_scope(&self) -> bool {
        self.access_lan || self.access_overlay || self.access_wan
    }
}

/// A denylisted address, mirrored into the engine's named address sets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlacklistEntry {
    pub id: i64,
    pub ip_address: IpAddr,
    pub reason: String,
    pub added_at: DateTime<Utc>,
}

/// Identity of a fixed policy, used by the recognizer table and the patcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum PolicyKey {
    NodeRed,
    Temporal,
    Api,
    Ssh,
    Icmp,
    Dns,
    Lan,
    Forward,
}

impl PolicyKey {
    /// The stable `policy` label of the seeded record for this key.
    pub const fn policy_name(self) -> &'static str {
        match self {
            PolicyKey::NodeRed => "Node-RED Access",
            PolicyKey::Temporal => "Temporal Policy",
            PolicyKey::Api => "FastAPI",
            PolicyKey::Ssh => "SSH Access",
            PolicyKey::Icmp => "ICMP Rate Limit",
            PolicyKey::Dns => "DNS Queries",
            PolicyKey::Lan => "LAN Access",
            PolicyKey::Forward => "LAN to WAN Forward",
        }
    }

    /// Seeded record id for this key.
    pub const fn seed_id(self) -> i64 {
        match self {
            PolicyKey::NodeRed => 9,
            PolicyKey::Temporal => 10,
            PolicyKey::Api => 11,
            PolicyKey::Ssh => 12,
            PolicyKey::Icmp => 13,
            PolicyKey::Dns => 14,
            PolicyKey::Lan => 15,
            PolicyKey::Forward => 16,
        }
    }

    /// Document variable naming the TCP port of the service this policy
    /// governs, for policies that get compensating deny blocks when disabled.
    pub const fn port_variable(self) -> Option<&'static str> {
        match self {
            PolicyKey::Temporal => Some("$TEMPORAL_PORT"),
            PolicyKey::NodeRed => Some("$NODERED_PORT"),
            PolicyKey::Api => Some("$FASTAPI_PORT"),
            PolicyKey::Ssh => Some("$SSH_PORT"),
            PolicyKey::Dns => Some("$DNS_PORT"),
            _ => None,
        }
    }

    /// True for the policy whose disablement injects ICMP deny directives.
    pub const fn is_icmp(self) -> bool {
        matches!(self, PolicyKey::Icmp)
    }

    /// Resolves the seeded policy key for a record id, if any.
    pub fn from_id(id: i64) -> Option<PolicyKey> {
        use strum::IntoEnumIterator;
        PolicyKey::iter().find(|k| k.seed_id() == id)
    }
}

/// What a recognizer comment line identifies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizerTarget {
    /// The next directive belongs to this policy's enabled state
    Policy(PolicyKey),
    /// The next directive is the masquerade rule, driven by the NAT flag
    NatMasquerade,
}

/// One entry of the recognizer table: a fixed text pattern identifying which
/// policy a configuration-document comment line precedes.
#[derive(Debug, Clone, Copy)]
pub struct Recognizer {
    pub pattern: &'static str,
    /// Pattern that, when also present, suppresses the match
    pub exclude: Option<&'static str>,
    pub target: RecognizerTarget,
}

/// Bumped whenever patterns change; the configuration document's recognizer
/// comments must never be renamed without updating this table in lock-step.
pub const RECOGNIZER_TABLE_VERSION: u32 = 1;

/// The recognizer table. Order matters: the first matching entry wins, and
/// a service may appear under more than one pattern (one for the private
/// network path, one for the remote-access path).
pub const RECOGNIZERS: &[Recognizer] = &[
    Recognizer {
        pattern: "# Allowing Node-Red",
        exclude: None,
        target: RecognizerTarget::Policy(PolicyKey::NodeRed),
    },
    Recognizer {
        pattern: "# Allow Node-Red",
        exclude: None,
        target: RecognizerTarget::Policy(PolicyKey::NodeRed),
    },
    Recognizer {
        pattern: "# Allow Temporal Policy",
        exclude: None,
        target: RecognizerTarget::Policy(PolicyKey::Temporal),
    },
    Recognizer {
        pattern: "# Allow FastAPI",
        exclude: None,
        target: RecognizerTarget::Policy(PolicyKey::Api),
    },
    Recognizer {
        pattern: "# SSH with rate limiting",
        exclude: None,
        target: RecognizerTarget::Policy(PolicyKey::Ssh),
    },
    Recognizer {
        pattern: "# ICMP handling",
        exclude: None,
        target: RecognizerTarget::Policy(PolicyKey::Icmp),
    },
    Recognizer {
        pattern: "# DNS queries to firewall",
        exclude: None,
        target: RecognizerTarget::Policy(PolicyKey::Dns),
    },
    Recognizer {
        pattern: "# LAN access",
        exclude: Some("Allow"),
        target: RecognizerTarget::Policy(PolicyKey::Lan),
    },
    Recognizer {
        pattern: "# LAN \u{2192} WAN",
        exclude: None,
        target: RecognizerTarget::Policy(PolicyKey::Forward),
    },
    Recognizer {
        pattern: "# LAN -> WAN",
        exclude: None,
        target: RecognizerTarget::Policy(PolicyKey::Forward),
    },
    Recognizer {
        pattern: "# Masquerade LAN traffic",
        exclude: None,
        target: RecognizerTarget::NatMasquerade,
    },
];

/// Matches a document line against the recognizer table.
pub fn recognize(line: &str) -> Option<RecognizerTarget> {
    RECOGNIZERS
        .iter()
        .find(|r| {
            line.contains(r.pattern) && r.exclude.is_none_or(|excl| !line.contains(excl))
        })
        .map(|r| r.target)
}

/// Builds the seeded fixed-policy records.
///
/// Everything starts enabled; NAT starts on for the forward policy.
pub fn seed_policies(now: DateTime<Utc>) -> Vec<PolicyRule> {
    use strum::IntoEnumIterator;
    PolicyKey::iter()
        .map(|key| PolicyRule {
            id: key.seed_id(),
            policy: key.policy_name().to_string(),
            rule_enabled: true,
            nat_enabled: key == PolicyKey::Forward,
            created_at: now,
            updated_at: now,
        })
        .collect()
}
