//! Rule Store
//!
//! Durable records for fixed policies, custom rules, and the IP denylist,
//! kept as per-entity JSON tables in the data directory. The store is the
//! single source of truth for desired state; the configuration document and
//! the live engine rule set are derived from it after every mutation.
//!
//! Tables are written atomically (temp file in the table directory, then
//! rename) and each carries a `.sha256` sidecar that is verified on load;
//! a mismatch is logged but does not fail the load, so a manually edited
//! table stays usable.
//!
//! Custom rule ids are never reused: the table tracks a monotonic `next_id`
//! the way an autoincrement column would, because ids are embedded in live
//! directive comment tags and a reused id could collide with a stale tag.

use crate::core::error::StoreError;
use crate::core::policy::{
    seed_policies, BlacklistEntry, CustomRule, CustomRuleDraft, PolicyField, PolicyRule,
    MAX_CUSTOM_RULES,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::warn;

const POLICIES_TABLE: &str = "policies.json";
const CUSTOM_RULES_TABLE: &str = "custom_rules.json";
const BLACKLIST_TABLE: &str = "blacklist.json";

/// Custom rule table with its id high-water mark
#[derive(Debug, Default, Serialize, Deserialize)]
struct CustomRuleTable {
    next_id: i64,
    rows: Vec<CustomRule>,
}

/// File-backed rule store
#[derive(Debug, Clone)]
pub struct RuleStore {
    dir: PathBuf,
}

impl RuleStore {
    /// Opens the store in the given directory, creating it and seeding the
    /// closed policy set on first use.
    pub async fn open(dir: PathBuf) -> Result<Self, StoreError> {
        #[cfg(unix)]
        {
            use std::fs::DirBuilder;
            use std::os::unix::fs::DirBuilderExt;
            let mut builder = DirBuilder::new();
            builder.mode(0o700);
            builder.recursive(true);
            builder.create(&dir)?;
        }
        #[cfg(not(unix))]
        std::fs::create_dir_all(&dir)?;

        let store = Self { dir };

        if !tokio::fs::try_exists(store.table_path(POLICIES_TABLE)).await? {
            store
                .save_table(POLICIES_TABLE, &seed_policies(Utc::now()))
                .await?;
        }

        Ok(store)
    }

    /// Opens the store in the default data directory.
    pub async fn open_default() -> Result<Self, StoreError> {
        let dir = crate::utils::get_data_dir().ok_or(StoreError::DataDirUnavailable)?;
        Self::open(dir.join("store")).await
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn checksum_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.sha256"))
    }

    async fn load_table<T: DeserializeOwned>(&self, name: &str) -> Result<T, StoreError>
    where
        T: Default,
    {
        let path = self.table_path(name);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };

        // Verify checksum if present (warns but doesn't fail for manually
        // edited tables)
        if let Ok(expected) = tokio::fs::read_to_string(self.checksum_path(name)).await {
            let actual = hex_sha256(&json);
            if expected.trim() != actual {
                warn!(
                    table = name,
                    expected = expected.trim(),
                    actual = %actual,
                    "table checksum mismatch"
                );
            }
        }

        Ok(serde_json::from_str(&json)?)
    }

    async fn save_table<T: Serialize>(&self, name: &str, table: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(table)?;

        // NamedTempFile is created 0o600; persist keeps the mode.
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        temp.write_all(json.as_bytes())?;
        temp.flush()?;
        temp.persist(self.table_path(name)).map_err(|e| e.error)?;

        let mut checksum_temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        checksum_temp.write_all(hex_sha256(&json).as_bytes())?;
        checksum_temp.flush()?;
        checksum_temp
            .persist(self.checksum_path(name))
            .map_err(|e| e.error)?;

        Ok(())
    }

    // ── fixed policies ──────────────────────────────────────────────────

    /// Ordered scan of all fixed policies.
    pub async fn policies(&self) -> Result<Vec<PolicyRule>, StoreError> {
        let mut rows: Vec<PolicyRule> = self.load_table(POLICIES_TABLE).await?;
        rows.sort_by_key(|p| p.id);
        Ok(rows)
    }

    /// Looks up a single policy by id.
    pub async fn policy(&self, id: i64) -> Result<PolicyRule, StoreError> {
        self.policies()
            .await?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or(StoreError::NotFound {
                entity: "policy",
                id,
            })
    }

    /// Sets one boolean field of a policy, returning the updated record.
    pub async fn set_policy_field(
        &self,
        id: i64,
        field: PolicyField,
        value: bool,
    ) -> Result<PolicyRule, StoreError> {
        let mut rows = self.policies().await?;
        let row = rows
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(StoreError::NotFound {
                entity: "policy",
                id,
            })?;

        match field {
            PolicyField::RuleEnabled => row.rule_enabled = value,
            PolicyField::NatEnabled => row.nat_enabled = value,
        }
        row.updated_at = Utc::now();
        let updated = row.clone();

        self.save_table(POLICIES_TABLE, &rows).await?;
        Ok(updated)
    }

    // ── custom rules ────────────────────────────────────────────────────

    /// Ordered scan of all custom rules.
    pub async fn custom_rules(&self) -> Result<Vec<CustomRule>, StoreError> {
        let mut table: CustomRuleTable = self.load_table(CUSTOM_RULES_TABLE).await?;
        table.rows.sort_by_key(|r| r.id);
        Ok(table.rows)
    }

    /// Looks up a single custom rule by id.
    pub async fn custom_rule(&self, id: i64) -> Result<CustomRule, StoreError> {
        self.custom_rules()
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound {
                entity: "custom rule",
                id,
            })
    }

    /// Inserts a new custom rule, enabled by default, assigning the next id.
    pub async fn insert_custom_rule(
        &self,
        draft: CustomRuleDraft,
    ) -> Result<CustomRule, StoreError> {
        let mut table: CustomRuleTable = self.load_table(CUSTOM_RULES_TABLE).await?;

        if table.rows.len() >= MAX_CUSTOM_RULES {
            return Err(StoreError::LimitReached(MAX_CUSTOM_RULES));
        }

        let now = Utc::now();
        let id = table.next_id.max(1);
        let rule = CustomRule {
            id,
            name: draft.name,
            description: draft.description,
            port: draft.port,
            protocol: draft.protocol,
            action: draft.action,
            access_lan: draft.access_lan,
            access_overlay: draft.access_overlay,
            access_wan: draft.access_wan,
            enabled: true,
            created_at: now,
            updated_at: now,
        };

        table.next_id = id + 1;
        table.rows.push(rule.clone());
        self.save_table(CUSTOM_RULES_TABLE, &table).await?;
        Ok(rule)
    }

    /// Toggles a custom rule, returning the updated record.
    pub async fn set_custom_rule_enabled(
        &self,
        id: i64,
        enabled: bool,
    ) -> Result<CustomRule, StoreError> {
        let mut table: CustomRuleTable = self.load_table(CUSTOM_RULES_TABLE).await?;
        let row = table
            .rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound {
                entity: "custom rule",
                id,
            })?;

        row.enabled = enabled;
        row.updated_at = Utc::now();
        let updated = row.clone();

        self.save_table(CUSTOM_RULES_TABLE, &table).await?;
        Ok(updated)
    }

    /// Removes a custom rule, returning the removed record.
    pub async fn delete_custom_rule(&self, id: i64) -> Result<CustomRule, StoreError> {
        let mut table: CustomRuleTable = self.load_table(CUSTOM_RULES_TABLE).await?;
        let idx = table
            .rows
            .iter()
            .position(|r| r.id == id)
            .ok_or(StoreError::NotFound {
                entity: "custom rule",
                id,
            })?;

        let removed = table.rows.remove(idx);
        self.save_table(CUSTOM_RULES_TABLE, &table).await?;
        Ok(removed)
    }

    // ── denylist ────────────────────────────────────────────────────────

    /// All denylist entries, most recent first.
    pub async fn blacklist(&self) -> Result<Vec<BlacklistEntry>, StoreError> {
        let mut rows: Vec<BlacklistEntry> = self.load_table(BLACKLIST_TABLE).await?;
        rows.sort_by(|a, b| b.added_at.cmp(&a.added_at));
        Ok(rows)
    }

    /// Adds an address to the denylist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the address is already present;
    /// nothing is written in that case.
    pub async fn add_blacklist(
        &self,
        ip_address: IpAddr,
        reason: String,
    ) -> Result<BlacklistEntry, StoreError> {
        let mut rows: Vec<BlacklistEntry> = self.load_table(BLACKLIST_TABLE).await?;

        if rows.iter().any(|e| e.ip_address == ip_address) {
            return Err(StoreError::Duplicate(ip_address.to_string()));
        }

        let entry = BlacklistEntry {
            id: rows.iter().map(|e| e.id).max().unwrap_or(0) + 1,
            ip_address,
            reason,
            added_at: Utc::now(),
        };

        rows.push(entry.clone());
        self.save_table(BLACKLIST_TABLE, &rows).await?;
        Ok(entry)
    }

    /// Removes a denylist entry by id, returning the removed record.
    pub async fn remove_blacklist(&self, id: i64) -> Result<BlacklistEntry, StoreError> {
        let mut rows: Vec<BlacklistEntry> = self.load_table(BLACKLIST_TABLE).await?;
        let idx = rows
            .iter()
            .position(|e| e.id == id)
            .ok_or(StoreError::NotFound {
                entity: "blacklist entry",
                id,
            })?;

        let removed = rows.remove(idx);
        self.save_table(BLACKLIST_TABLE, &rows).await?;
        Ok(removed)
    }
}

fn hex_sha256(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::{Protocol, RuleAction, MANAGEMENT_API_POLICY_ID};

    async fn open_temp_store() -> (tempfile::TempDir, RuleStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::open(dir.path().join("store")).await.unwrap();
        (dir, store)
    }

    fn draft(name: &str, port: u16) -> CustomRuleDraft {
        CustomRuleDraft {
            name: name.to_string(),
            description: String::new(),
            port,
            protocol: Protocol::Tcp,
            action: RuleAction::Accept,
            access_lan: true,
            access_overlay: false,
            access_wan: false,
        }
    }

    #[tokio::test]
    async fn test_open_seeds_policies() {
        let (_dir, store) = open_temp_store().await;
        let policies = store.policies().await.unwrap();
        assert_eq!(policies.len(), 8);
        assert!(policies.iter().all(|p| p.rule_enabled));
        assert!(
            policies
                .iter()
                .any(|p| p.id == MANAGEMENT_API_POLICY_ID && p.policy == "FastAPI")
        );
        // Ordered scan
        assert!(policies.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        let store = RuleStore::open(path.clone()).await.unwrap();
        store
            .set_policy_field(12, PolicyField::RuleEnabled, false)
            .await
            .unwrap();

        let reopened = RuleStore::open(path).await.unwrap();
        let ssh = reopened.policy(12).await.unwrap();
        assert!(!ssh.rule_enabled, "reopen must not reseed");
    }

    #[tokio::test]
    async fn test_set_policy_field() {
        let (_dir, store) = open_temp_store().await;

        let updated = store
            .set_policy_field(16, PolicyField::NatEnabled, false)
            .await
            .unwrap();
        assert!(!updated.nat_enabled);
        assert!(updated.rule_enabled, "other field untouched");

        let err = store
            .set_policy_field(99, PolicyField::RuleEnabled, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_custom_rule_ids_monotonic_and_never_reused() {
        let (_dir, store) = open_temp_store().await;

        let a = store.insert_custom_rule(draft("a", 8080)).await.unwrap();
        let b = store.insert_custom_rule(draft("b", 8081)).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert!(a.enabled, "rules are enabled on creation");

        store.delete_custom_rule(b.id).await.unwrap();
        let c = store.insert_custom_rule(draft("c", 8082)).await.unwrap();
        assert_eq!(c.id, 3, "deleted ids are not reused");
    }

    #[tokio::test]
    async fn test_custom_rule_toggle_and_delete() {
        let (_dir, store) = open_temp_store().await;
        let rule = store.insert_custom_rule(draft("web", 8080)).await.unwrap();

        let toggled = store
            .set_custom_rule_enabled(rule.id, false)
            .await
            .unwrap();
        assert!(!toggled.enabled);

        let removed = store.delete_custom_rule(rule.id).await.unwrap();
        assert_eq!(removed.name, "web");
        assert!(store.custom_rules().await.unwrap().is_empty());

        let err = store.delete_custom_rule(rule.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_blacklist_duplicate_rejected() {
        let (_dir, store) = open_temp_store().await;
        let ip: IpAddr = "203.0.113.7".parse().unwrap();

        store
            .add_blacklist(ip, "port scanning".to_string())
            .await
            .unwrap();
        let err = store
            .add_blacklist(ip, "again".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        // Failed insert had no side effects
        assert_eq!(store.blacklist().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blacklist_remove_round_trip() {
        let (_dir, store) = open_temp_store().await;
        let v6: IpAddr = "2001:db8::bad".parse().unwrap();

        let entry = store
            .add_blacklist(v6, "abuse".to_string())
            .await
            .unwrap();
        let removed = store.remove_blacklist(entry.id).await.unwrap();
        assert_eq!(removed.ip_address, v6);
        assert!(store.blacklist().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checksum_sidecar_written() {
        let (_dir, store) = open_temp_store().await;
        store.insert_custom_rule(draft("x", 1000)).await.unwrap();

        let sidecar = store.checksum_path(CUSTOM_RULES_TABLE);
        let digest = tokio::fs::read_to_string(sidecar).await.unwrap();
        assert_eq!(digest.len(), 64);

        let json = tokio::fs::read_to_string(store.table_path(CUSTOM_RULES_TABLE))
            .await
            .unwrap();
        assert_eq!(hex_sha256(&json), digest);
    }
}
