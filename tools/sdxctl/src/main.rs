//! sdxctl - inspect the SDX controller rule database
//!
//! Reads the database the controller writes; never installs or removes
//! rules, so no local controller or resource registry is needed.

mod output;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::debug;

use common::sqlite::SqliteClient;
use sdx_rules::{repository, ManagerConfig, RuleFilter, RuleHash, RuleOrdering, SEARCH_FIELDS};

#[derive(Parser)]
#[command(name = "sdxctl")]
#[command(about = "SDX controller rule inspection tool")]
#[command(long_about = "SDX controller rule inspection tool

Examples:
  sdxctl list                               # All rules by hash
  sdxctl list --filter user=alice --order -hash
  sdxctl list --filter state=active --json
  sdxctl show 12                            # Rule with its breakdown lines
  sdxctl lc lc-1                            # Entries destined for one LC
  sdxctl fields                             # Columns usable in --filter/--order")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML); SDX_* environment variables override it
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Database file (overrides the configured db_path)
    #[arg(long = "db", global = true)]
    db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List rules
    List {
        /// Column filter as key=value, repeatable
        #[arg(short, long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,

        /// Order by column, '-' prefix for descending
        #[arg(short, long)]
        order: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one rule with its breakdown
    Show {
        /// Rule hash
        hash: RuleHash,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show every stored entry destined for one local controller
    Lc {
        /// Local controller identifier
        id: String,
    },

    /// List the columns usable in filters and ordering
    Fields,

    /// Show when the rule set last changed
    LastModified,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let level = if cli.verbose { "debug" } else { "warn" };
    if let Err(e) = common::logging::init(level) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let config = ManagerConfig::load(cli.config.as_deref())?;
    let db_path = cli.db.clone().unwrap_or_else(|| config.db_path.clone());
    debug!("Using database {}", db_path.display());

    if let Commands::Fields = cli.command {
        for field in SEARCH_FIELDS {
            println!("{}", field);
        }
        return Ok(());
    }

    let client = SqliteClient::new_readonly(&db_path)
        .await
        .with_context(|| format!("cannot open {}", db_path.display()))?;
    let pool = client.pool();

    match cli.command {
        Commands::List {
            filters,
            order,
            json,
        } => {
            let filter_json = parse_filters(&filters)?;
            let filter = RuleFilter::from_json(Some(&filter_json))?;
            let ordering = order.as_deref().map(RuleOrdering::parse).transpose()?;

            let rules = repository::list_rules(pool, &filter, ordering.as_ref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else {
                output::print_rules(&rules);
            }
        },
        Commands::Show { hash, json } => {
            let Some(details) = repository::rule_details(pool, hash).await? else {
                bail!("rule {} not found", hash);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&details)?);
            } else {
                output::print_details(&details)?;
            }
        },
        Commands::Lc { id } => {
            let entries = repository::breakdowns_for_lc(pool, &id).await?;
            output::print_lc_entries(&id, &entries);
        },
        Commands::LastModified => {
            println!("{}", repository::last_modified(pool).await?);
        },
        Commands::Fields => {},
    }

    Ok(())
}

/// Turn `key=value` pairs into a filter object
///
/// Numbers and `null` keep their JSON type; everything else is a string.
fn parse_filters(pairs: &[String]) -> Result<Value> {
    let mut map = Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("filter '{}' is not key=value", pair);
        };
        let value = match serde_json::from_str::<Value>(value) {
            Ok(v @ (Value::Number(_) | Value::Null)) => v,
            _ => Value::String(value.to_string()),
        };
        map.insert(key.trim().to_string(), value);
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_filters() {
        let filters = vec![
            "user=alice".to_string(),
            "state=2".to_string(),
            "stoptime=null".to_string(),
        ];
        assert_eq!(
            parse_filters(&filters).unwrap(),
            json!({ "user": "alice", "state": 2, "stoptime": null })
        );
        assert!(parse_filters(&["user".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_list() {
        let cli = Cli::try_parse_from([
            "sdxctl", "--db", "/tmp/x.db", "list", "-f", "user=bob", "--order", "-hash",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        match cli.command {
            Commands::List { filters, order, json } => {
                assert_eq!(filters, vec!["user=bob".to_string()]);
                assert_eq!(order.as_deref(), Some("-hash"));
                assert!(!json);
            },
            _ => panic!("expected list"),
        }
    }
}
