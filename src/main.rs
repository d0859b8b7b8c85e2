//! fwplane - Firewall Policy Control Plane
//!
//! Command-line front end over the control plane library. The HTTP layer
//! that normally drives these operations is out of scope here; every
//! operation it would expose is available as a subcommand.
//!
//! # Usage
//!
//! ```bash
//! fwplane restore                     # Replay enabled custom rules (run at boot)
//! fwplane status                      # Aggregate state counters
//! fwplane policy list                 # List fixed policies
//! fwplane policy disable 12           # Disable a fixed policy
//! fwplane policy nat 16 off           # Toggle NAT masquerading
//! fwplane custom add --name "Web" --port 8080 --lan
//! fwplane custom disable 3            # Retract a custom rule's live directives
//! fwplane custom delete 3             # Retract and remove a custom rule
//! fwplane blacklist add 203.0.113.7 --reason "port scanning"
//! fwplane audit --limit 20            # Recent audit events
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use fwplane::core::policy::{CustomRuleDraft, PolicyField, Protocol, RuleAction};
use fwplane::{ControlPlane, RuleStore};
use std::process::ExitCode;
use std::str::FromStr;

#[derive(Parser)]
#[command(name = "fwplane")]
#[command(about = "Firewall policy control plane for nftables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay every enabled custom rule into the live engine (run at boot)
    Restore,
    /// Show aggregate firewall state
    Status,
    /// Manage fixed policies
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    /// Manage custom rules
    Custom {
        #[command(subcommand)]
        command: CustomCommands,
    },
    /// Manage the IP denylist
    Blacklist {
        #[command(subcommand)]
        command: BlacklistCommands,
    },
    /// Show recent audit events
    Audit {
        /// Maximum number of events to show
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Inspect or initialize the control-plane configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write the current configuration to disk (creates defaults on first run)
    Init,
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// List all fixed policies
    List,
    /// Enable a fixed policy
    Enable { id: i64 },
    /// Disable a fixed policy
    Disable { id: i64 },
    /// Toggle NAT masquerading for a policy
    Nat { id: i64, state: Switch },
}

#[derive(Subcommand)]
enum CustomCommands {
    /// List all custom rules
    List,
    /// Create a custom rule (enabled and applied immediately)
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        port: u16,
        /// tcp, udp, or both
        #[arg(long, default_value = "tcp")]
        protocol: String,
        /// accept or drop
        #[arg(long, default_value = "accept")]
        action: String,
        /// Allow/deny traffic arriving on the LAN bridge
        #[arg(long)]
        lan: bool,
        /// Allow/deny traffic sourced from the private overlay network
        #[arg(long)]
        overlay: bool,
        /// Allow/deny traffic arriving on the public interface
        #[arg(long)]
        wan: bool,
    },
    /// Enable a custom rule (re-applies its live directives)
    Enable { id: i64 },
    /// Disable a custom rule (retracts its live directives)
    Disable { id: i64 },
    /// Delete a custom rule (retract, then remove the record)
    Delete { id: i64 },
}

#[derive(Subcommand)]
enum BlacklistCommands {
    /// List denylisted addresses
    List,
    /// Denylist an address
    Add {
        ip: String,
        #[arg(long, default_value = "Manual block")]
        reason: String,
    },
    /// Remove a denylist entry by id
    Remove { id: i64 },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl Switch {
    const fn as_bool(self) -> bool {
        matches!(self, Switch::On)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> fwplane::Result<()> {
    fwplane::utils::ensure_dirs()?;

    let config = fwplane::config::load_config().await;
    let store = RuleStore::open_default().await?;
    let plane = ControlPlane::new(config, store);

    match cli.command {
        Commands::Restore => {
            let restored = plane.restore_all().await;
            println!("Restored {restored} custom rule(s)");
        }
        Commands::Status => {
            let status = plane.status().await?;
            println!(
                "Policies: {}/{} enabled",
                status.enabled_policies, status.total_policies
            );
            println!(
                "Custom rules: {} ({} enabled)",
                status.custom_rules, status.enabled_custom_rules
            );
            println!("Denylisted addresses: {}", status.blacklist_count);
        }
        Commands::Policy { command } => run_policy(&plane, command).await?,
        Commands::Custom { command } => run_custom(&plane, command).await?,
        Commands::Blacklist { command } => run_blacklist(&plane, command).await?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                println!("{}", serde_json::to_string_pretty(plane.config())?);
            }
            ConfigCommands::Init => {
                fwplane::config::save_config(plane.config()).await?;
                println!("Configuration written");
            }
        },
        Commands::Audit { limit } => {
            let audit = fwplane::audit::AuditLog::new()?;
            for event in audit.read_recent(limit).await? {
                let outcome = if event.success { "ok" } else { "FAILED" };
                println!(
                    "{}  {:?}  {}  rule={}  {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.event_type,
                    outcome,
                    event
                        .rule_id
                        .map_or_else(|| "-".to_string(), |id| id.to_string()),
                    event.details
                );
            }
        }
    }

    Ok(())
}

async fn run_policy(plane: &ControlPlane, command: PolicyCommands) -> fwplane::Result<()> {
    match command {
        PolicyCommands::List => {
            for policy in plane.policies().await? {
                let state = if policy.rule_enabled { "enabled" } else { "disabled" };
                let nat = if policy.nat_enabled { " [NAT]" } else { "" };
                println!("{:>3}  {:<20} {}{}", policy.id, policy.policy, state, nat);
            }
        }
        PolicyCommands::Enable { id } => {
            let policy = plane
                .toggle_policy(id, PolicyField::RuleEnabled, true)
                .await?;
            println!("Enabled policy '{}'", policy.policy);
        }
        PolicyCommands::Disable { id } => {
            let policy = plane
                .toggle_policy(id, PolicyField::RuleEnabled, false)
                .await?;
            println!("Disabled policy '{}'", policy.policy);
        }
        PolicyCommands::Nat { id, state } => {
            let policy = plane
                .toggle_policy(id, PolicyField::NatEnabled, state.as_bool())
                .await?;
            println!(
                "NAT {} for policy '{}'",
                if policy.nat_enabled { "enabled" } else { "disabled" },
                policy.policy
            );
        }
    }
    Ok(())
}

async fn run_custom(plane: &ControlPlane, command: CustomCommands) -> fwplane::Result<()> {
    match command {
        CustomCommands::List => {
            for rule in plane.custom_rules().await? {
                let state = if rule.enabled { "enabled" } else { "disabled" };
                let mut scopes = Vec::new();
                if rule.access_lan {
                    scopes.push("lan");
                }
                if rule.access_overlay {
                    scopes.push("overlay");
                }
                if rule.access_wan {
                    scopes.push("wan");
                }
                println!(
                    "{:>3}  {:<24} {:>5}/{:<4} {:<6} [{}] {}",
                    rule.id,
                    rule.name,
                    rule.port,
                    rule.protocol,
                    rule.action,
                    scopes.join(","),
                    state
                );
            }
        }
        CustomCommands::Add {
            name,
            description,
            port,
            protocol,
            action,
            lan,
            overlay,
            wan,
        } => {
            let draft = CustomRuleDraft {
                name,
                description,
                port,
                protocol: Protocol::from_str(&protocol).map_err(|_| {
                    fwplane::Error::validation("protocol", "expected tcp, udp, or both")
                })?,
                action: RuleAction::from_str(&action).map_err(|_| {
                    fwplane::Error::validation("action", "expected accept or drop")
                })?,
                access_lan: lan,
                access_overlay: overlay,
                access_wan: wan,
            };
            let rule = plane.add_custom_rule(draft).await?;
            println!("Added custom rule {} ('{}')", rule.id, rule.name);
        }
        CustomCommands::Enable { id } => {
            let rule = plane.toggle_custom_rule(id, true).await?;
            println!("Enabled custom rule {} ('{}')", rule.id, rule.name);
        }
        CustomCommands::Disable { id } => {
            let rule = plane.toggle_custom_rule(id, false).await?;
            println!("Disabled custom rule {} ('{}')", rule.id, rule.name);
        }
        CustomCommands::Delete { id } => {
            let rule = plane.delete_custom_rule(id).await?;
            println!("Deleted custom rule {} ('{}')", rule.id, rule.name);
        }
    }
    Ok(())
}

async fn run_blacklist(plane: &ControlPlane, command: BlacklistCommands) -> fwplane::Result<()> {
    match command {
        BlacklistCommands::List => {
            for entry in plane.blacklist().await? {
                println!(
                    "{:>3}  {:<40} {}  {}",
                    entry.id,
                    entry.ip_address,
                    entry.added_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.reason
                );
            }
        }
        BlacklistCommands::Add { ip, reason } => {
            let entry = plane.blacklist_add(&ip, reason).await?;
            println!("Denylisted {}", entry.ip_address);
        }
        BlacklistCommands::Remove { id } => {
            let entry = plane.blacklist_remove(id).await?;
            println!("Removed {} from denylist", entry.ip_address);
        }
    }
    Ok(())
}
