//! Nodestore CLI - inspect and edit a node store from the command line

use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use nodestore::config::{self, NodestoreConfig};
use nodestore::ui::{self, Icons};
use nodestore::{Error, Node, NodeKey, NodeManager, RelationKind, SqliteStore, Value};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "nodestore")]
#[command(version)]
#[command(about = "Object/relational node store - cached node graph over SQLite")]
#[command(long_about = r#"
Nodestore maps a typed node graph onto relational tables:
  • Types and properties are declared in nodestore.toml
  • Nodes are addressed as <type>/<id>
  • Every edit runs in its own transaction

Example usage:
  nodestore init
  nodestore set user/42 name Alice --create
  nodestore get user/42
  nodestore children user/42 posts --limit 20
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "nodestore.toml")]
    config: PathBuf,

    /// Path to the database file (overrides the configuration)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration and create the database tables
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration and list the declared types
    Check,

    /// Show one node
    Get {
        /// Node key, e.g. user/42
        key: String,
    },

    /// List the children of a node through a collection
    Children {
        /// Parent node key
        key: String,

        /// Collection property
        relation: String,

        /// Stop after this many children
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Set (or, without a value, remove) a property
    Set {
        /// Node key
        key: String,

        /// Property name
        property: String,

        /// New value; references take a key or a bare id
        value: Option<String>,

        /// Create the node if it does not exist
        #[arg(long)]
        create: bool,
    },

    /// Delete a node
    Delete {
        /// Node key
        key: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { force } => {
            let config = NodestoreConfig::example();
            config::write_config(&cli.config, &config, force)?;
            let (manager, db_path) = open(&cli.config, cli.database.as_deref())?;

            ui::header("Initialized node store");
            ui::status(Icons::GEAR, "Config", &cli.config.display().to_string());
            ui::status(Icons::DATABASE, "Database", &db_path.display().to_string());
            ui::status(Icons::STATS, "Types", &manager.schema().len().to_string());
            ui::success("Ready");
        }

        Commands::Check => {
            let (manager, db_path) = open(&cli.config, cli.database.as_deref())?;
            let schema = manager.schema();

            if cli.format == Format::Json {
                let types: Vec<_> = schema
                    .mappings()
                    .map(|m| {
                        serde_json::json!({
                            "type": m.type_name(),
                            "table": m.table(),
                            "properties": m.relations().map(|r| r.property().to_string()).collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&types)?);
                return Ok(());
            }

            ui::header("Schema OK");
            ui::status(Icons::DATABASE, "Database", &db_path.display().to_string());
            let rows: Vec<(&str, String)> = schema
                .mappings()
                .map(|m| {
                    let relations: Vec<String> = m
                        .relations()
                        .map(|r| format!("{} ({})", r.property(), r.kind()))
                        .collect();
                    let table = m.table().unwrap_or("in-memory");
                    (m.type_name(), format!("{}: {}", table, relations.join(", ")))
                })
                .collect();
            println!("{}", ui::stats_table(&rows));
        }

        Commands::Get { key } => {
            let (manager, _) = open(&cli.config, cli.database.as_deref())?;
            let node = manager.get_node(&NodeKey::parse(&key)?)?;
            print_node(&node, cli.format)?;
        }

        Commands::Children { key, relation, limit } => {
            let (manager, _) = open(&cli.config, cli.database.as_deref())?;
            let children = manager.get_nodes(&NodeKey::parse(&key)?, &relation)?;
            let limit = limit.unwrap_or(usize::MAX);

            let mut nodes = Vec::new();
            for child in children.iter().take(limit) {
                nodes.push(child?);
            }

            if cli.format == Format::Json {
                let json: Vec<_> = nodes.iter().map(|n| node_json(n)).collect();
                println!("{}", serde_json::to_string_pretty(&json)?);
            } else {
                ui::section(&format!("{} {}", key, relation));
                for node in &nodes {
                    ui::node_line(node);
                }
                ui::summary_row("children", &nodes.len().to_string());
            }
        }

        Commands::Set { key, property, value, create } => {
            let (manager, _) = open(&cli.config, cli.database.as_deref())?;
            let key = NodeKey::parse(&key)?;
            let tx = manager.current_transactor();

            let created = tx.run(|| {
                let (node, created) = match manager.get_node(&key) {
                    Ok(node) => (node, false),
                    Err(Error::NotFound(_)) if create => (manager.create_node_with_id(&key.type_name, &key.id)?, true),
                    Err(err) => return Err(err),
                };
                let value = match &value {
                    Some(raw) => parse_value(&node, &property, raw)?,
                    None => Value::Null,
                };
                node.set(&property, value)?;
                Ok(created)
            })?;

            if created {
                ui::node_new(&key.to_string());
            } else {
                ui::node_modified(&key.to_string());
            }
            let node = manager.get_node(&key)?;
            print_node(&node, cli.format)?;
        }

        Commands::Delete { key } => {
            let (manager, _) = open(&cli.config, cli.database.as_deref())?;
            let key = NodeKey::parse(&key)?;
            let tx = manager.current_transactor();
            tx.run(|| manager.get_node(&key)?.delete())?;
            ui::node_deleted(&key.to_string());
        }
    }

    Ok(())
}

/// Load the configuration and open its database
fn open(config_path: &Path, database: Option<&Path>) -> anyhow::Result<(NodeManager, PathBuf)> {
    let config = config::load_config(Some(config_path))?
        .with_context(|| format!("no configuration at {} (run `nodestore init`)", config_path.display()))?;
    let registry = config.registry()?;

    let db_path = database
        .map(Path::to_path_buf)
        .or_else(|| config.database.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| config::default_database_path_in(Path::new(".")));
    config::ensure_db_dir(&db_path)?;

    let store = SqliteStore::open(&db_path)?;
    store.ensure_schema(&registry)?;
    tracing::debug!(database = %db_path.display(), types = registry.len(), "store opened");

    Ok((NodeManager::new(registry, Arc::new(store), config.cache), db_path))
}

/// Interpret a command-line value according to the property's declaration
fn parse_value(node: &Node, property: &str, raw: &str) -> nodestore::Result<Value> {
    let Some(relation) = node.mapping().relation_for(property) else {
        return Ok(Value::Text(raw.to_string()));
    };
    match relation.kind() {
        RelationKind::Reference => {
            let key = match NodeKey::parse(raw) {
                Ok(key) => key,
                Err(_) => NodeKey::new(relation.target_type().unwrap_or_default(), raw),
            };
            Ok(Value::Reference(key))
        }
        _ => match relation.column_type() {
            Some(ty) => Value::parse_as(ty, raw),
            None => Ok(Value::Text(raw.to_string())),
        },
    }
}

fn node_json(node: &Node) -> serde_json::Value {
    serde_json::json!({
        "key": node.key(),
        "state": node.state(),
        "version": node.version(),
        "created": node.created(),
        "modified": node.modified(),
        "properties": node.properties(),
    })
}

fn print_node(node: &Node, format: Format) -> anyhow::Result<()> {
    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(&node_json(node))?);
        return Ok(());
    }

    ui::node_line(node);
    ui::summary_row("created", &node.created().to_rfc3339());
    ui::summary_row("modified", &node.modified().to_rfc3339());
    let table = ui::properties_table(&node.properties());
    if table.is_empty() {
        println!("{}", ui::muted("  (no properties)"));
    } else {
        println!("{}", table);
    }
    Ok(())
}
