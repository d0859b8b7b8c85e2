//! Integration tests for fwplane
//!
//! These tests drive end-to-end flows - policy toggle cycles, custom rule
//! lifecycle, retraction, and startup restoration - against the mock engine
//! binaries in `tests/bin/` (nft, systemctl, conntrack), which record their
//! invocations and serve canned chain listings.
//!
//! Environment setup is process-global (PATH, mock log locations), so every
//! test serializes on a shared lock.

#![allow(clippy::uninlined_format_args)]

use fwplane::core::policy::{
    CustomRuleDraft, PolicyField, PolicyKey, Protocol, RuleAction, MANAGEMENT_API_POLICY_ID,
};
use fwplane::{AppConfig, ControlPlane, Error, RuleStore};
use std::env;
use std::path::{Path, PathBuf};

static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

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
	chain input {
		type filter hook input priority 0; policy drop;

		ct state established,related accept

		# Allowing Node-Red over the overlay network
		tcp dport $NODERED_PORT ip saddr $TAILNET counter accept
		# Allow Node-Red from the LAN
		iifname $LAN tcp dport $NODERED_PORT counter accept

		# Allow FastAPI (overlay)
		tcp dport $FASTAPI_PORT ip saddr $TAILNET counter accept

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

fn mock_bin_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("bin")
}

/// Prepends the mock binaries to PATH and points every mock log and the
/// audit/state location into the given scratch directory.
fn setup_mock_engine(scratch: &Path) {
    let mock_dir = mock_bin_dir();
    let current = env::var("PATH").unwrap_or_default();
    let prefix = format!("{}:", mock_dir.display());
    unsafe {
        if !current.starts_with(&prefix) {
            env::set_var("PATH", format!("{}{}", prefix, current));
        }
        env::set_var("FWPLANE_TEST_NO_ELEVATION", "1");
        env::set_var("FWPLANE_STATE_DIR", scratch.join("state"));
        env::set_var("MOCK_NFT_LOG", scratch.join("nft.log"));
        env::set_var("MOCK_SYSTEMCTL_LOG", scratch.join("systemctl.log"));
        env::set_var("MOCK_CONNTRACK_LOG", scratch.join("conntrack.log"));
        env::set_var("MOCK_NFT_LISTING_DIR", scratch.join("listings"));
        env::remove_var("MOCK_NFT_FAIL");
        env::remove_var("MOCK_SYSTEMCTL_FAIL");
    }
    std::fs::create_dir_all(scratch.join("state")).unwrap();
    std::fs::create_dir_all(scratch.join("listings")).unwrap();
}

fn read_log(scratch: &Path, name: &str) -> String {
    std::fs::read_to_string(scratch.join(name)).unwrap_or_default()
}

async fn plane_with_document(scratch: &Path) -> ControlPlane {
    let document = scratch.join("nftables.conf");
    std::fs::write(&document, SAMPLE_DOCUMENT).unwrap();

    let store = RuleStore::open(scratch.join("store")).await.unwrap();
    let config = AppConfig {
        nftables_conf: document,
        ..AppConfig::default()
    };
    ControlPlane::new(config, store)
}

fn lan_rule_draft(name: &str, port: u16) -> CustomRuleDraft {
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
async fn test_policy_toggle_round_trip_through_document() {
    let _guard = ENV_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    setup_mock_engine(dir.path());

    let plane = plane_with_document(dir.path()).await;
    let document = plane.config().nftables_conf.clone();

    // Disable SSH: both the suspension marker and a compensating deny block
    // must land in the document, and the engine must be reloaded.
    plane
        .toggle_policy(PolicyKey::Ssh.seed_id(), PolicyField::RuleEnabled, false)
        .await
        .unwrap();

    let patched = std::fs::read_to_string(&document).unwrap();
    assert!(patched.contains("[DISABLED] tcp dport $SSH_PORT"));
    assert!(patched.contains("# [AUTO-DROP] Disabled TCP port $SSH_PORT"));
    assert!(read_log(dir.path(), "systemctl.log").contains("reload nftables"));

    // Re-enable: the document must return to its exact original state.
    plane
        .toggle_policy(PolicyKey::Ssh.seed_id(), PolicyField::RuleEnabled, true)
        .await
        .unwrap();

    let restored = std::fs::read_to_string(&document).unwrap();
    assert_eq!(restored, SAMPLE_DOCUMENT);
}

#[tokio::test]
async fn test_disabling_service_terminates_established_sessions() {
    let _guard = ENV_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    setup_mock_engine(dir.path());

    let plane = plane_with_document(dir.path()).await;

    plane
        .toggle_policy(PolicyKey::NodeRed.seed_id(), PolicyField::RuleEnabled, false)
        .await
        .unwrap();

    let conntrack_log = read_log(dir.path(), "conntrack.log");
    assert!(
        conntrack_log.contains("-D -p tcp --dport 1880"),
        "conntrack log: {conntrack_log}"
    );

    // Re-enabling must not terminate anything further.
    plane
        .toggle_policy(PolicyKey::NodeRed.seed_id(), PolicyField::RuleEnabled, true)
        .await
        .unwrap();
    assert_eq!(read_log(dir.path(), "conntrack.log").lines().count(), 1);
}

#[tokio::test]
async fn test_reload_falls_back_to_direct_nft() {
    let _guard = ENV_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    setup_mock_engine(dir.path());
    unsafe {
        env::set_var("MOCK_SYSTEMCTL_FAIL", "1");
    }

    let plane = plane_with_document(dir.path()).await;

    plane
        .toggle_policy(PolicyKey::Dns.seed_id(), PolicyField::RuleEnabled, false)
        .await
        .unwrap();

    let nft_log = read_log(dir.path(), "nft.log");
    assert!(
        nft_log.lines().any(|l| l.starts_with("-f ")),
        "direct reload expected in nft log: {nft_log}"
    );

    unsafe {
        env::remove_var("MOCK_SYSTEMCTL_FAIL");
    }
}

#[tokio::test]
async fn test_both_reload_paths_failing_leaves_document_written() {
    let _guard = ENV_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    setup_mock_engine(dir.path());
    unsafe {
        env::set_var("MOCK_SYSTEMCTL_FAIL", "1");
        env::set_var("MOCK_NFT_FAIL", "1");
    }

    let plane = plane_with_document(dir.path()).await;
    let document = plane.config().nftables_conf.clone();

    let err = plane
        .toggle_policy(PolicyKey::Dns.seed_id(), PolicyField::RuleEnabled, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Reload { .. }));

    // The document keeps the administrator's change; the inconsistency is
    // surfaced through the error, not silently reverted.
    let written = std::fs::read_to_string(&document).unwrap();
    assert!(written.contains("[DISABLED] iifname $LAN udp dport $DNS_PORT"));

    unsafe {
        env::remove_var("MOCK_SYSTEMCTL_FAIL");
        env::remove_var("MOCK_NFT_FAIL");
    }
}

#[tokio::test]
async fn test_management_api_lockout_never_reaches_engine() {
    let _guard = ENV_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    setup_mock_engine(dir.path());

    let plane = plane_with_document(dir.path()).await;
    let document = plane.config().nftables_conf.clone();

    let err = plane
        .toggle_policy(MANAGEMENT_API_POLICY_ID, PolicyField::RuleEnabled, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));

    // Document untouched, engine untouched.
    assert_eq!(std::fs::read_to_string(&document).unwrap(), SAMPLE_DOCUMENT);
    assert!(read_log(dir.path(), "nft.log").is_empty());
    assert!(read_log(dir.path(), "systemctl.log").is_empty());
}

#[tokio::test]
async fn test_accept_rule_lifecycle_touches_only_input_chain() {
    let _guard = ENV_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    setup_mock_engine(dir.path());

    let plane = plane_with_document(dir.path()).await;

    // Create: exactly one ingress directive, no forward/output (ACCEPT).
    let rule = plane.add_custom_rule(lan_rule_draft("Web", 8080)).await.unwrap();
    let nft_log = read_log(dir.path(), "nft.log");
    let adds: Vec<&str> = nft_log.lines().filter(|l| l.starts_with("add rule")).collect();
    assert_eq!(adds.len(), 1);
    assert!(adds[0].starts_with("add rule inet filter input iifname br0 tcp dport 8080"));
    assert!(adds[0].contains(&format!("fwplane:rule:{}", rule.id)));

    // Stage a listing in which that directive is live with handle 21.
    std::fs::write(
        dir.path().join("listings").join("input.txt"),
        format!(
            "table inet filter {{\n\tchain input {{\n\t\tiifname \"br0\" tcp dport 8080 counter packets 0 bytes 0 accept comment \"fwplane:rule:{}\" # handle 21\n\t}}\n}}\n",
            rule.id
        ),
    )
    .unwrap();

    plane.delete_custom_rule(rule.id).await.unwrap();

    let nft_log = read_log(dir.path(), "nft.log");
    let deletes: Vec<&str> = nft_log
        .lines()
        .filter(|l| l.starts_with("delete rule"))
        .collect();
    assert_eq!(deletes, vec!["delete rule inet filter input handle 21"]);
    assert!(plane.custom_rules().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_drop_rule_retraction_covers_all_three_chains() {
    let _guard = ENV_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    setup_mock_engine(dir.path());

    let plane = plane_with_document(dir.path()).await;

    let draft = CustomRuleDraft {
        name: "Block Telnet".to_string(),
        description: "insecure".to_string(),
        port: 23,
        protocol: Protocol::Tcp,
        action: RuleAction::Drop,
        access_lan: true,
        access_overlay: true,
        access_wan: true,
    };
    let rule = plane.add_custom_rule(draft).await.unwrap();

    // LAN ingress + overlay + WAN on input, plus forward and output denies.
    let nft_log = read_log(dir.path(), "nft.log");
    assert_eq!(nft_log.lines().filter(|l| l.starts_with("add rule inet filter input")).count(), 3);
    assert_eq!(nft_log.lines().filter(|l| l.starts_with("add rule inet filter forward")).count(), 1);
    assert_eq!(nft_log.lines().filter(|l| l.starts_with("add rule inet filter output")).count(), 1);

    // Stage listings with the rule's directives live in every chain, plus a
    // decoy rule whose tag shares the digit prefix.
    let listings = dir.path().join("listings");
    let tag = format!("fwplane:rule:{}", rule.id);
    std::fs::write(
        listings.join("input.txt"),
        format!(
            "\t\tiifname \"br0\" tcp dport 23 counter drop comment \"{tag}\" # handle 31\n\
             \t\ttcp dport 23 ip saddr 100.64.0.0/10 counter drop comment \"{tag}\" # handle 32\n\
             \t\tiifname \"eth1\" tcp dport 23 counter drop comment \"{tag}\" # handle 33\n\
             \t\tiifname \"br0\" tcp dport 9999 counter accept comment \"fwplane:rule:{}9\" # handle 34\n",
            rule.id
        ),
    )
    .unwrap();
    std::fs::write(
        listings.join("forward.txt"),
        format!("\t\tiifname \"br0\" tcp dport 23 counter drop comment \"{tag}:forward\" # handle 41\n"),
    )
    .unwrap();
    std::fs::write(
        listings.join("output.txt"),
        format!("\t\toifname \"eth1\" tcp dport 23 counter drop comment \"{tag}:output\" # handle 51\n"),
    )
    .unwrap();

    plane.delete_custom_rule(rule.id).await.unwrap();

    let nft_log = read_log(dir.path(), "nft.log");
    let deletes: Vec<&str> = nft_log
        .lines()
        .filter(|l| l.starts_with("delete rule"))
        .collect();
    assert!(deletes.contains(&"delete rule inet filter input handle 31"));
    assert!(deletes.contains(&"delete rule inet filter input handle 32"));
    assert!(deletes.contains(&"delete rule inet filter input handle 33"));
    assert!(deletes.contains(&"delete rule inet filter forward handle 41"));
    assert!(deletes.contains(&"delete rule inet filter output handle 51"));
    // The decoy with a digit-extended tag must survive.
    assert!(!deletes.iter().any(|d| d.contains("handle 34")));
}

#[tokio::test]
async fn test_restore_applies_exactly_the_enabled_rules() {
    let _guard = ENV_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    setup_mock_engine(dir.path());

    let plane = plane_with_document(dir.path()).await;

    plane.add_custom_rule(lan_rule_draft("a", 8081)).await.unwrap();
    plane.add_custom_rule(lan_rule_draft("b", 8082)).await.unwrap();
    let disabled = plane.add_custom_rule(lan_rule_draft("c", 8083)).await.unwrap();
    plane.toggle_custom_rule(disabled.id, false).await.unwrap();

    // Simulate an engine restart: live state is gone, the log starts fresh.
    std::fs::remove_file(dir.path().join("nft.log")).unwrap();

    let restored = plane.restore_all().await;
    assert_eq!(restored, 2);

    let nft_log = read_log(dir.path(), "nft.log");
    let adds: Vec<&str> = nft_log.lines().filter(|l| l.starts_with("add rule")).collect();
    assert_eq!(adds.len(), 2);
    assert!(adds.iter().any(|l| l.contains("dport 8081")));
    assert!(adds.iter().any(|l| l.contains("dport 8082")));
    assert!(!nft_log.contains("dport 8083"));
}

#[tokio::test]
async fn test_blacklist_mirrors_into_live_sets() {
    let _guard = ENV_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    setup_mock_engine(dir.path());

    let plane = plane_with_document(dir.path()).await;

    let v4 = plane
        .blacklist_add("203.0.113.7", "port scanning".to_string())
        .await
        .unwrap();
    plane
        .blacklist_add("2001:db8::bad", "abuse".to_string())
        .await
        .unwrap();

    let nft_log = read_log(dir.path(), "nft.log");
    assert!(nft_log.contains("add element inet filter blacklist_v4 { 203.0.113.7 }"));
    assert!(nft_log.contains("add element inet filter blacklist_v6 { 2001:db8::bad }"));

    // Duplicate insert: store error, no second live add.
    let err = plane
        .blacklist_add("203.0.113.7", "again".to_string())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already denylisted"));
    let adds = read_log(dir.path(), "nft.log")
        .lines()
        .filter(|l| l.contains("blacklist_v4"))
        .count();
    assert_eq!(adds, 1);

    plane.blacklist_remove(v4.id).await.unwrap();
    assert!(read_log(dir.path(), "nft.log")
        .contains("delete element inet filter blacklist_v4 { 203.0.113.7 }"));
}

#[tokio::test]
async fn test_audit_trail_records_mutations() {
    let _guard = ENV_LOCK.lock().await;
    let dir = tempfile::tempdir().unwrap();
    setup_mock_engine(dir.path());

    let plane = plane_with_document(dir.path()).await;

    plane
        .toggle_policy(PolicyKey::Temporal.seed_id(), PolicyField::RuleEnabled, false)
        .await
        .unwrap();
    let _ = plane
        .toggle_policy(MANAGEMENT_API_POLICY_ID, PolicyField::RuleEnabled, false)
        .await;

    let audit = fwplane::audit::AuditLog::new().unwrap();
    let events = audit.read_recent(10).await.unwrap();
    assert_eq!(events.len(), 2);

    // Newest first: the rejected lockout attempt is recorded as a failure.
    assert!(!events[0].success);
    assert_eq!(events[0].rule_id, Some(MANAGEMENT_API_POLICY_ID));
    assert!(events[1].success);
    assert_eq!(events[1].rule_id, Some(PolicyKey::Temporal.seed_id()));
}
