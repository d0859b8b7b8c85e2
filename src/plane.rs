//! Control plane mutation boundary
//!
//! [`ControlPlane`] owns the rule store and configuration and exposes every
//! mutating operation. The store, the configuration document, and the live
//! engine are process-wide shared state, so all mutations are serialized
//! through a single lock held across read-store → patch/apply → commit →
//! audit. Without that serialization two concurrent toggles could interleave
//! their reads of the document and each overwrite the other's deny-block
//! insertion, corrupting it.
//!
//! Validation (including the management-API lockout guard) runs before any
//! side effect; a rejected request leaves store, document, and engine
//! untouched. Every mutation, successful or failed, gets an audit entry;
//! audit-write failures are swallowed so they never mask the primary result.

use crate::audit::{self, AuditEvent, EventType};
use crate::config::AppConfig;
use crate::core::activation;
use crate::core::applier;
use crate::core::engine;
use crate::core::error::{Error, Result};
use crate::core::policy::{
    BlacklistEntry, CustomRule, CustomRuleDraft, PolicyField, PolicyKey, PolicyRule,
    MANAGEMENT_API_POLICY_ID,
};
use crate::core::restore;
use crate::store::RuleStore;
use crate::validators;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

/// Aggregate state counters for the status surface
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub enabled_policies: usize,
    pub total_policies: usize,
    pub custom_rules: usize,
    pub enabled_custom_rules: usize,
    pub blacklist_count: usize,
}

/// The policy synchronization engine's exposed surface
pub struct ControlPlane {
    config: AppConfig,
    store: RuleStore,
    mutation_lock: Mutex<()>,
}

impl ControlPlane {
    pub fn new(config: AppConfig, store: RuleStore) -> Self {
        Self {
            config,
            store,
            mutation_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // ── read surface ────────────────────────────────────────────────────

    pub async fn policies(&self) -> Result<Vec<PolicyRule>> {
        Ok(self.store.policies().await?)
    }

    pub async fn custom_rules(&self) -> Result<Vec<CustomRule>> {
        Ok(self.store.custom_rules().await?)
    }

    pub async fn blacklist(&self) -> Result<Vec<BlacklistEntry>> {
        Ok(self.store.blacklist().await?)
    }

    pub async fn status(&self) -> Result<StatusSummary> {
        let policies = self.store.policies().await?;
        let custom = self.store.custom_rules().await?;
        let blacklist = self.store.blacklist().await?;
        Ok(StatusSummary {
            enabled_policies: policies.iter().filter(|p| p.rule_enabled).count(),
            total_policies: policies.len(),
            custom_rules: custom.len(),
            enabled_custom_rules: custom.iter().filter(|r| r.enabled).count(),
            blacklist_count: blacklist.len(),
        })
    }

    // ── fixed policies ──────────────────────────────────────────────────

    /// Toggles one field of a fixed policy and drives the change through
    /// patch → commit → reload.
    ///
    /// # Errors
    ///
    /// Disabling the management-API policy is rejected before any patch or
    /// commit step runs, with store, document, and engine untouched.
    pub async fn toggle_policy(
        &self,
        id: i64,
        field: PolicyField,
        value: bool,
    ) -> Result<PolicyRule> {
        let _guard = self.mutation_lock.lock().await;

        let result = self.toggle_policy_locked(id, field, value).await;

        let event = AuditEvent::new(
            EventType::TogglePolicy,
            result.is_ok(),
            serde_json::json!({ "field": field.as_ref(), "value": value }),
            result.as_ref().err().map(ToString::to_string),
        )
        .with_rule_id(id);
        audit::record(event).await;

        result
    }

    async fn toggle_policy_locked(
        &self,
        id: i64,
        field: PolicyField,
        value: bool,
    ) -> Result<PolicyRule> {
        if id == MANAGEMENT_API_POLICY_ID && field == PolicyField::RuleEnabled && !value {
            return Err(Error::validation(
                "rule_enabled",
                "cannot disable management API access - you would lock yourself out",
            ));
        }

        let updated = self.store.set_policy_field(id, field, value).await?;

        let terminated_port = if field == PolicyField::RuleEnabled && !value {
            PolicyKey::from_id(id).and_then(|key| self.config.termination_port(key))
        } else {
            None
        };

        let policies = self.store.policies().await?;
        activation::commit(&self.config, &policies, terminated_port).await?;

        Ok(updated)
    }

    // ── custom rules ────────────────────────────────────────────────────

    /// Creates a custom rule and materializes it into the live engine.
    pub async fn add_custom_rule(&self, draft: CustomRuleDraft) -> Result<CustomRule> {
        let _guard = self.mutation_lock.lock().await;

        let port = draft.port;
        let result = self.add_custom_rule_locked(draft).await;

        let mut event = AuditEvent::new(
            EventType::AddCustomRule,
            result.is_ok(),
            serde_json::json!({ "port": port }),
            result.as_ref().err().map(ToString::to_string),
        );
        if let Ok(rule) = &result {
            event = event.with_rule_id(rule.id);
            event.details = serde_json::json!({
                "name": rule.name,
                "port": rule.port,
                "protocol": rule.protocol,
                "action": rule.action,
            });
        }
        audit::record(event).await;

        result
    }

    async fn add_custom_rule_locked(&self, mut draft: CustomRuleDraft) -> Result<CustomRule> {
        validators::validate_custom_rule(&draft)?;
        draft.name = validators::sanitize_name(&draft.name);

        let rule = self.store.insert_custom_rule(draft).await?;
        applier::apply(&rule, &self.config).await?;
        Ok(rule)
    }

    /// Enables or disables a custom rule, materializing or retracting its
    /// live directives accordingly.
    pub async fn toggle_custom_rule(&self, id: i64, enabled: bool) -> Result<CustomRule> {
        let _guard = self.mutation_lock.lock().await;

        let result = self.toggle_custom_rule_locked(id, enabled).await;

        let event = AuditEvent::new(
            EventType::ToggleCustomRule,
            result.is_ok(),
            serde_json::json!({ "enabled": enabled }),
            result.as_ref().err().map(ToString::to_string),
        )
        .with_rule_id(id);
        audit::record(event).await;

        result
    }

    async fn toggle_custom_rule_locked(&self, id: i64, enabled: bool) -> Result<CustomRule> {
        let rule = self.store.set_custom_rule_enabled(id, enabled).await?;

        if enabled {
            applier::apply(&rule, &self.config).await?;
        } else {
            applier::retract(id).await?;
        }

        Ok(rule)
    }

    /// Deletes a custom rule: live directives are retracted first, then the
    /// record is removed, so a partial failure leaves a retryable record
    /// rather than orphaned live directives.
    pub async fn delete_custom_rule(&self, id: i64) -> Result<CustomRule> {
        let _guard = self.mutation_lock.lock().await;

        let result = self.delete_custom_rule_locked(id).await;

        let event = AuditEvent::new(
            EventType::DeleteCustomRule,
            result.is_ok(),
            match &result {
                Ok(removed) => serde_json::json!({ "name": removed.name, "port": removed.port }),
                Err(_) => serde_json::json!({}),
            },
            result.as_ref().err().map(ToString::to_string),
        )
        .with_rule_id(id);
        audit::record(event).await;

        result
    }

    async fn delete_custom_rule_locked(&self, id: i64) -> Result<CustomRule> {
        // Unknown id fails here, before any engine call.
        let rule = self.store.custom_rule(id).await?;

        applier::retract(rule.id).await?;
        let removed = self.store.delete_custom_rule(rule.id).await?;
        Ok(removed)
    }

    // ── denylist ────────────────────────────────────────────────────────

    /// Adds an address to the denylist record and the live address set.
    pub async fn blacklist_add(&self, ip: &str, reason: String) -> Result<BlacklistEntry> {
        let _guard = self.mutation_lock.lock().await;

        let result = self.blacklist_add_locked(ip, reason).await;

        let event = AuditEvent::new(
            EventType::BlacklistAdd,
            result.is_ok(),
            match &result {
                Ok(entry) => {
                    serde_json::json!({ "ip": entry.ip_address, "reason": entry.reason })
                }
                Err(_) => serde_json::json!({ "ip": ip }),
            },
            result.as_ref().err().map(ToString::to_string),
        );
        audit::record(event).await;

        result
    }

    async fn blacklist_add_locked(&self, ip: &str, reason: String) -> Result<BlacklistEntry> {
        let ip = validators::validate_ip_address(ip)?;
        // Duplicates fail here with no side effects.
        let entry = self.store.add_blacklist(ip, reason).await?;

        if let Err(e) = engine::add_set_element(ip).await {
            warn!(ip = %ip, error = %e, "live denylist set add failed");
        }

        Ok(entry)
    }

    /// Removes a denylist entry and its live set element.
    pub async fn blacklist_remove(&self, id: i64) -> Result<BlacklistEntry> {
        let _guard = self.mutation_lock.lock().await;

        let result = self.blacklist_remove_locked(id).await;

        let event = AuditEvent::new(
            EventType::BlacklistRemove,
            result.is_ok(),
            match &result {
                Ok(removed) => serde_json::json!({ "ip": removed.ip_address }),
                Err(_) => serde_json::json!({ "id": id }),
            },
            result.as_ref().err().map(ToString::to_string),
        );
        audit::record(event).await;

        result
    }

    async fn blacklist_remove_locked(&self, id: i64) -> Result<BlacklistEntry> {
        let removed = self.store.remove_blacklist(id).await?;

        if let Err(e) = engine::remove_set_element(removed.ip_address).await {
            warn!(ip = %removed.ip_address, error = %e, "live denylist set removal failed");
        }

        Ok(removed)
    }

    // ── startup ─────────────────────────────────────────────────────────

    /// Replays enabled custom rules into the engine; see
    /// [`crate::core::restore`]. Must complete before mutation requests are
    /// served.
    pub async fn restore_all(&self) -> usize {
        let _guard = self.mutation_lock.lock().await;

        let restored = restore::restore_all(&self.config, &self.store).await;

        let event = AuditEvent::new(
            EventType::RestoreRules,
            true,
            serde_json::json!({ "restored": restored }),
            None,
        );
        audit::record(event).await;

        restored
    }
}
