//! Startup Restorer
//!
//! Runtime-applied directives do not survive an engine restart; only the
//! store does. On process start every enabled custom rule is replayed
//! through the applier before the control plane accepts mutation requests,
//! closing the window where a request could retract a rule that has not been
//! re-applied yet.

use crate::config::AppConfig;
use crate::core::applier;
use crate::store::RuleStore;
use tracing::{info, warn};

/// Replays every enabled custom rule into the live engine.
///
/// Returns the number of rules successfully re-applied. Individual failures
/// are logged and skipped; startup itself never fails here.
pub async fn restore_all(config: &AppConfig, store: &RuleStore) -> usize {
    let rules = match store.custom_rules().await {
        Ok(rules) => rules,
        Err(e) => {
            warn!(error = %e, "could not read custom rules, skipping restoration");
            return 0;
        }
    };

    let mut restored = 0usize;
    for rule in rules.iter().filter(|r| r.enabled) {
        match applier::apply(rule, config).await {
            Ok(applied) if applied > 0 => {
                restored += 1;
            }
            Ok(_) => {
                warn!(rule_id = rule.id, "no directive of rule could be applied");
            }
            Err(e) => {
                warn!(rule_id = rule.id, error = %e, "rule restoration failed, continuing");
            }
        }
    }

    info!(restored, total = rules.len(), "custom rule restoration complete");
    restored
}
