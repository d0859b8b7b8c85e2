//! Live Rule Applier
//!
//! Translates a [`CustomRule`] record into tagged directives submitted
//! directly to the engine's runtime API, and locates and retracts previously
//! applied directives by their tag.
//!
//! # Tags
//!
//! Every directive carries a comment embedding the rule id in a strict
//! delimiter-bounded format: `fwplane:rule:<id>`, with scope-qualified
//! variants `fwplane:rule:<id>:forward` / `fwplane:rule:<id>:output` for the
//! auxiliary deny directives. Retraction compares the whole comment for
//! equality with the base tag or a prefix match bounded by the `:` delimiter,
//! never substring containment, so rule 1 can never match rule 12's
//! directives.
//!
//! # Best effort
//!
//! Application touches kernel state one directive at a time; an individual
//! submission failure is logged and does not abort the remaining directives.
//! Retraction of a rule with no live directives is a no-op, not an error.

use crate::config::AppConfig;
use crate::core::engine;
use crate::core::error::Result;
use crate::core::policy::{Chain, CustomRule, RuleAction};
use tracing::{debug, warn};

/// Prefix of every comment tag this plane owns
const TAG_PREFIX: &str = "fwplane:rule";

/// One directive ready for submission to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub chain: Chain,
    /// Match predicate tokens in engine syntax
    pub matcher: Vec<String>,
    pub action: &'static str,
    pub comment: String,
}

impl Directive {
    /// Argument vector following `add rule inet filter <chain>`.
    ///
    /// The comment is wrapped in literal quotes: the engine re-lexes its
    /// argument vector joined by spaces.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = self.matcher.clone();
        args.push("counter".to_string());
        args.push(self.action.to_string());
        args.push("comment".to_string());
        args.push(format!("\"{}\"", self.comment));
        args
    }
}

/// The identifying tag for a rule's directives.
pub fn rule_tag(rule_id: i64) -> String {
    format!("{TAG_PREFIX}:{rule_id}")
}

/// True when a live comment belongs to the given rule: equal to the base tag
/// or extending it past the `:` delimiter.
pub fn comment_matches(comment: &str, rule_id: i64) -> bool {
    let tag = rule_tag(rule_id);
    comment == tag || comment.starts_with(&format!("{tag}:"))
}

/// Expands a custom rule into the directives realizing it.
///
/// One ingress directive per selected protocol and enabled access scope; for
/// a LAN-scoped DROP additionally a forwarding-path deny and an egress deny
/// out of the public interface, so already-forwarded and firewall-originated
/// traffic is blocked too, not just new ingress.
pub fn expand(rule: &CustomRule, config: &AppConfig) -> Vec<Directive> {
    let port = rule.port.to_string();
    let tag = rule_tag(rule.id);
    let mut directives = Vec::new();

    for proto in rule.protocol.expand() {
        if rule.access_lan {
            directives.push(Directive {
                chain: Chain::Input,
                matcher: vec![
                    "iifname".to_string(),
                    config.lan_interface.clone(),
                    (*proto).to_string(),
                    "dport".to_string(),
                    port.clone(),
                ],
                action: rule.action.as_str(),
                comment: tag.clone(),
            });

            if rule.action == RuleAction::Drop {
                directives.push(Directive {
                    chain: Chain::Forward,
                    matcher: vec![
                        "iifname".to_string(),
                        config.lan_interface.clone(),
                        (*proto).to_string(),
                        "dport".to_string(),
                        port.clone(),
                    ],
                    action: RuleAction::Drop.as_str(),
                    comment: format!("{tag}:forward"),
                });
                directives.push(Directive {
                    chain: Chain::Output,
                    matcher: vec![
                        "oifname".to_string(),
                        config.wan_interface.clone(),
                        (*proto).to_string(),
                        "dport".to_string(),
                        port.clone(),
                    ],
                    action: RuleAction::Drop.as_str(),
                    comment: format!("{tag}:output"),
                });
            }
        }

        if rule.access_overlay {
            directives.push(Directive {
                chain: Chain::Input,
                matcher: vec![
                    (*proto).to_string(),
                    "dport".to_string(),
                    port.clone(),
                    "ip".to_string(),
                    "saddr".to_string(),
                    config.overlay_network.to_string(),
                ],
                action: rule.action.as_str(),
                comment: tag.clone(),
            });
        }

        if rule.access_wan {
            directives.push(Directive {
                chain: Chain::Input,
                matcher: vec![
                    "iifname".to_string(),
                    config.wan_interface.clone(),
                    (*proto).to_string(),
                    "dport".to_string(),
                    port.clone(),
                ],
                action: rule.action.as_str(),
                comment: tag.clone(),
            });
        }
    }

    directives
}

/// Materializes a rule into the live engine.
///
/// Returns the number of directives successfully submitted. Individual
/// submission failures are logged and skipped.
pub async fn apply(rule: &CustomRule, config: &AppConfig) -> Result<usize> {
    let directives = expand(rule, config);
    let mut applied = 0usize;

    for directive in &directives {
        match engine::add_rule(directive.chain, &directive.to_args()).await {
            Ok(()) => {
                debug!(
                    rule_id = rule.id,
                    chain = directive.chain.as_str(),
                    "directive applied"
                );
                applied += 1;
            }
            Err(e) => {
                warn!(
                    rule_id = rule.id,
                    chain = directive.chain.as_str(),
                    error = %e,
                    "directive submission failed, continuing"
                );
            }
        }
    }

    Ok(applied)
}

/// Extracts `(comment, handle)`-matched handles for a rule from a chain
/// listing produced by `nft -a list chain`.
pub fn matching_handles(listing: &str, rule_id: i64) -> Vec<u64> {
    listing
        .lines()
        .filter_map(|line| {
            let comment = extract_comment(line)?;
            if !comment_matches(comment, rule_id) {
                return None;
            }
            extract_handle(line)
        })
        .collect()
}

/// Pulls the quoted comment string out of a listing line, if any.
fn extract_comment(line: &str) -> Option<&str> {
    let start = line.find("comment \"")? + "comment \"".len();
    let rest = &line[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Pulls the engine-assigned handle off the end of a listing line, if any.
fn extract_handle(line: &str) -> Option<u64> {
    let idx = line.rfind("# handle ")? + "# handle ".len();
    line[idx..].trim().parse().ok()
}

/// Retracts every live directive tagged with the rule's id, across all three
/// chains independently.
///
/// Returns the number of directives deleted; zero matches is a success
/// (idempotent retraction).
pub async fn retract(rule_id: i64) -> Result<usize> {
    let mut deleted = 0usize;

    for chain in Chain::ALL {
        let listing = match engine::list_chain(chain).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(
                    rule_id,
                    chain = chain.as_str(),
                    error = %e,
                    "chain listing failed, continuing with remaining chains"
                );
                continue;
            }
        };

        // Delete highest handle first; handles are stable but this keeps the
        // walk independent of engine renumbering behavior.
        let mut handles = matching_handles(&listing, rule_id);
        handles.sort_unstable_by(|a, b| b.cmp(a));

        for handle in handles {
            match engine::delete_rule(chain, handle).await {
                Ok(()) => {
                    debug!(rule_id, chain = chain.as_str(), handle, "directive retracted");
                    deleted += 1;
                }
                Err(e) => {
                    warn!(
                        rule_id,
                        chain = chain.as_str(),
                        handle,
                        error = %e,
                        "directive deletion failed, continuing"
                    );
                }
            }
        }
    }

    Ok(deleted)
}
