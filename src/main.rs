//! Medic administrative CLI.
//!
//! Covers the operator-facing tasks that don't belong in the monitor
//! daemon (`sentinel`): managing secrets, registering and validating
//! playbooks, inspecting maintenance windows, and querying/restoring
//! snapshots. Mirrors the teacher's `flatline` CLI in structure (a
//! `clap`-derived `Cli { command }` over an async `main`), widened to
//! more than two subcommands since this binary is an administrative
//! surface rather than a single daemon loop.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use medic::config::{config_dir, load_config};
use medic::playbook::parser;
use medic::secrets::SecretsManager;
use medic::snapshots::{self, SnapshotQuery};
use medic::store::Store;

/// Medic — heartbeat-driven service-health monitor administrative CLI.
#[derive(Parser)]
#[command(name = "medic", version, about)]
struct Cli {
    /// Path to `medic.toml`. Defaults to `~/.medic/medic.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the SQLite store. Defaults to `~/.medic/medic.db`.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Secret management.
    Secrets {
        #[command(subcommand)]
        action: SecretsAction,
    },
    /// Playbook management.
    Playbook {
        #[command(subcommand)]
        action: PlaybookAction,
    },
    /// List configured maintenance windows.
    Maintenance,
    /// Snapshot query and restore.
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
}

#[derive(Subcommand)]
enum SecretsAction {
    /// Encrypt and store a secret.
    Set {
        /// Secret name, matching `[A-Za-z][A-Za-z0-9_]{0,63}`.
        name: String,
        /// Plaintext value. Read from stdin instead if omitted.
        value: Option<String>,
        /// Optional human-readable description.
        #[arg(long)]
        description: Option<String>,
    },
    /// Decrypt and print a secret's value.
    Get {
        /// Secret name.
        name: String,
    },
}

#[derive(Subcommand)]
enum PlaybookAction {
    /// Parse a playbook YAML file and report errors, without registering it.
    Validate {
        /// Path to the playbook YAML file.
        path: PathBuf,
    },
    /// Parse and register a playbook from a YAML file.
    Register {
        /// Path to the playbook YAML file.
        path: PathBuf,
    },
    /// List registered playbooks.
    List,
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Query snapshots, optionally filtered by service.
    Query {
        /// Restrict to a single service id.
        #[arg(long)]
        service_id: Option<i64>,
        /// Maximum rows to return.
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Restore a service to a previously captured snapshot.
    Restore {
        /// Snapshot id to restore.
        snapshot_id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    medic::logging::init_cli();
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(p) => p.clone(),
        None => config_dir()?.join("medic.toml"),
    };
    let store_path = match &cli.store {
        Some(p) => p.clone(),
        None => config_dir()?.join("medic.db"),
    };

    let config = if config_path.exists() {
        load_config(&config_path, |k| std::env::var(k).ok())
            .with_context(|| format!("failed to load {}", config_path.display()))?
    } else {
        medic::config::MedicConfig::default()
    };

    let store = Store::open(&store_path)
        .await
        .with_context(|| format!("failed to open medic store at {}", store_path.display()))?;

    match cli.command {
        Command::Secrets { action } => handle_secrets(&store, action).await,
        Command::Playbook { action } => handle_playbook(&store, action).await,
        Command::Maintenance => handle_maintenance(&store).await,
        Command::Snapshot { action } => handle_snapshot(&store, action, config.snapshots.max_query_limit).await,
    }
}

async fn handle_secrets(store: &Store, action: SecretsAction) -> anyhow::Result<()> {
    let manager = SecretsManager::from_env(|k| std::env::var(k).ok())
        .context("failed to load MEDIC_SECRETS_KEY; set it to a base64-encoded 32-byte key")?;

    match action {
        SecretsAction::Set { name, value, description } => {
            let plaintext = match value {
                Some(v) => v,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_line(&mut buf).context("failed to read secret from stdin")?;
                    buf.trim_end_matches('\n').to_owned()
                }
            };
            manager
                .set_secret(store, &name, &plaintext, description.as_deref(), None)
                .await
                .context("failed to store secret")?;
            println!("secret '{name}' stored");
            Ok(())
        }
        SecretsAction::Get { name } => {
            let value = manager.get_secret(store, &name).await.context("failed to decrypt secret")?;
            println!("{value}");
            Ok(())
        }
    }
}

async fn handle_playbook(store: &Store, action: PlaybookAction) -> anyhow::Result<()> {
    match action {
        PlaybookAction::Validate { path } => {
            let yaml_content = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
            match parser::parse_yaml(&yaml_content) {
                Ok(parsed) => {
                    println!("ok: '{}' ({} steps, approval={:?})", parsed.name, parsed.steps.len(), parsed.approval);
                    Ok(())
                }
                Err(e) => anyhow::bail!("invalid playbook: {e}"),
            }
        }
        PlaybookAction::Register { path } => {
            let yaml_content = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
            let parsed = parser::parse_yaml(&yaml_content).context("invalid playbook")?;
            let (approval, approval_timeout_minutes) = match parsed.approval {
                parser::Approval::None => ("none", None),
                parser::Approval::Required => ("required", None),
                parser::Approval::Timeout { minutes } => ("timeout", Some(minutes)),
            };
            let id = store
                .insert_playbook(&parsed.name, &parsed.description, &yaml_content, parsed.version, approval, approval_timeout_minutes)
                .await
                .context("failed to register playbook")?;
            println!("registered playbook '{}' as id {id}", parsed.name);
            Ok(())
        }
        PlaybookAction::List => {
            let playbooks = store.list_playbooks().await.context("failed to list playbooks")?;
            for p in playbooks {
                println!("{:>4}  {:<30} v{:<3} approval={}", p.id, p.name, p.version, p.approval);
            }
            Ok(())
        }
    }
}

async fn handle_maintenance(store: &Store) -> anyhow::Result<()> {
    let windows = store.all_maintenance_windows().await.context("failed to list maintenance windows")?;
    for w in windows {
        println!(
            "{:>4}  {:<30} {} -> {} ({}) recurrence={}",
            w.id,
            w.name,
            w.start_time,
            w.end_time,
            w.timezone,
            w.recurrence.as_deref().unwrap_or("one-time")
        );
    }
    Ok(())
}

async fn handle_snapshot(store: &Store, action: SnapshotAction, max_query_limit: i64) -> anyhow::Result<()> {
    match action {
        SnapshotAction::Query { service_id, limit } => {
            let query = SnapshotQuery {
                service_id,
                action_type: None,
                start_date: None,
                end_date: None,
                limit,
                offset: 0,
            };
            let (rows, total) = snapshots::query(store, &query, max_query_limit).await.context("failed to query snapshots")?;
            for r in &rows {
                println!(
                    "{:>4}  service={} action={} actor={} created={} restored={}",
                    r.id,
                    r.service_id,
                    r.action_type.as_str(),
                    r.actor.as_deref().unwrap_or("-"),
                    r.created_at,
                    r.restored_at.map(|t| t.to_string()).unwrap_or_else(|| "-".to_owned())
                );
            }
            println!("{} of {total} total", rows.len());
            Ok(())
        }
        SnapshotAction::Restore { snapshot_id } => {
            let restored = snapshots::restore(store, snapshot_id, chrono::Utc::now())
                .await
                .context("failed to restore snapshot")?;
            println!("restored service '{}' (id {})", restored.service_name, restored.id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use clap::Parser;

    #[test]
    fn parses_maintenance_subcommand() {
        assert!(Cli::try_parse_from(["medic", "maintenance"]).is_ok());
    }

    #[test]
    fn parses_secrets_set_with_positional_value() {
        assert!(Cli::try_parse_from(["medic", "secrets", "set", "API_KEY", "hunter2"]).is_ok());
    }

    #[test]
    fn rejects_unknown_subcommand() {
        assert!(Cli::try_parse_from(["medic", "bogus"]).is_err());
    }
}
