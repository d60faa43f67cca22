//! kadroute - inspect and edit a persisted Kademlia routing table

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use kadroute_core::{LoggingStore, Node, NodeAddress, NodeId, SqliteStore};
use kadroute_dht::{NodeStatus, RoutingTable};
use serde::Serialize;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::{expand_path, Config};

#[derive(Parser)]
#[command(name = "kadroute")]
#[command(about = "Kademlia routing table tool", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.kadroute/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config with a fresh node identifier
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Show every bucket and its members
    Buckets {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List the known nodes nearest to an identifier
    Near {
        /// Target identifier (hex)
        #[arg(required = true)]
        id: String,

        /// Maximum number of nodes
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Add a node to the routing table
    Add {
        /// Node identifier (hex)
        #[arg(required = true)]
        id: String,

        /// host:port
        #[arg(required = true)]
        address: String,
    },

    /// Remove a node from the routing table
    Remove {
        /// Node identifier (hex)
        #[arg(required = true)]
        id: String,
    },

    /// Show table summary, or the state of one node
    Status {
        /// Node identifier (hex)
        id: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);

    if let Commands::Init { force } = cli.command {
        return init_config(&config_path, force);
    }

    let config = load_config(&config_path)?;
    let data_dir = match &cli.data_dir {
        Some(dir) => expand_path(dir),
        None => config.data_dir(),
    };
    let table = open_table(&config, &data_dir)?;

    let result = match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Buckets { json } => show_buckets(&table, json),
        Commands::Near { id, limit } => show_near(&table, &id, limit),
        Commands::Add { id, address } => add_node(&table, &id, &address),
        Commands::Remove { id } => remove_node(&table, &id),
        Commands::Status { id } => show_status(&table, id.as_deref()),
    };

    table.close()?;
    result
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let config = Config::generate()?;
    config.save(path)?;

    println!("Created config at {}", path.display());
    println!("Node id: {}", config.node.id);
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        bail!(
            "No config at {}; run `kadroute init` first",
            path.display()
        );
    }
    Config::load(path)
}

fn open_table(config: &Config, data_dir: &Path) -> Result<RoutingTable> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("routing.db");
    tracing::debug!("Opening routing table at {}", db_path.display());

    let kbuckets = LoggingStore::new("kbuckets", SqliteStore::open(&db_path, "kbuckets")?);
    let nodes = LoggingStore::new("nodes", SqliteStore::open(&db_path, "nodes")?);
    let table = RoutingTable::new(
        config.local_node()?,
        &config.dht,
        Box::new(kbuckets),
        Box::new(nodes),
    )?;
    Ok(table)
}

fn parse_id(table: &RoutingTable, hex_id: &str) -> Result<NodeId> {
    let id = NodeId::from_hex(hex_id)?;
    if id.len() != table.id_length() {
        bail!(
            "Identifier {} has {} bytes, expected {}",
            hex_id,
            id.len(),
            table.id_length()
        );
    }
    Ok(id)
}

#[derive(Serialize)]
struct BucketView {
    id: String,
    range: [String; 2],
    last_updated_ms: u64,
    nodes: Vec<Node>,
}

fn show_buckets(table: &RoutingTable, json: bool) -> Result<()> {
    let buckets = table.get_buckets()?;

    if json {
        let views: Vec<BucketView> = buckets
            .into_iter()
            .map(|b| {
                let [lo, hi] = b.range.endpoints();
                BucketView {
                    id: b.id.to_hex(),
                    range: [lo.to_hex(), hi.to_hex()],
                    last_updated_ms: b
                        .last_updated
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64,
                    nodes: b.nodes,
                }
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    println!("{} bucket(s), k = {}", buckets.len(), table.k());
    for bucket in buckets {
        let local = bucket.range.contains(table.local().id.as_bytes());
        println!(
            "\n{} ({} node(s)){}",
            bucket.id,
            bucket.nodes.len(),
            if local { " [local]" } else { "" }
        );
        for node in &bucket.nodes {
            println!("  {}", node);
        }
    }
    Ok(())
}

fn show_near(table: &RoutingTable, hex_id: &str, limit: usize) -> Result<()> {
    let target = parse_id(table, hex_id)?;
    let nodes = table.find_near(&target, limit)?;
    if nodes.is_empty() {
        println!("No known nodes");
    }
    for node in nodes {
        println!("{}", node);
    }
    Ok(())
}

fn add_node(table: &RoutingTable, hex_id: &str, address: &str) -> Result<()> {
    let id = parse_id(table, hex_id)?;
    let address: NodeAddress = address.parse()?;
    let node = Node::new(id, Some(address));

    if table.add_node(node.clone())? {
        println!("Added {} to bucket {}", node, table.get_kbucket_id(&node.id)?);
    } else {
        // The replacement cache does not outlive this process.
        println!("Bucket {} is full; {} not added", table.get_kbucket_id(&node.id)?, node);
    }
    Ok(())
}

fn remove_node(table: &RoutingTable, hex_id: &str) -> Result<()> {
    let id = parse_id(table, hex_id)?;
    if id == table.local().id {
        bail!("Refusing to remove the local node");
    }
    if table.get_node(&id)?.is_none() {
        println!("{} is not in the routing table", id);
        return Ok(());
    }
    table.remove_node(&id)?;
    println!("Removed {}", id);
    Ok(())
}

fn show_status(table: &RoutingTable, hex_id: Option<&str>) -> Result<()> {
    match hex_id {
        Some(hex_id) => {
            let id = parse_id(table, hex_id)?;
            let status = table.status(&id)?;
            match (status, table.get_node(&id)?) {
                (NodeStatus::Unknown, _) | (_, None) => println!("{}: {:?}", id, status),
                (_, Some(node)) => println!("{}: {:?}", node, status),
            }
        }
        None => {
            println!("Local node: {}", table.local());
            println!("Known nodes: {}", table.node_count()?.saturating_sub(1));
            println!("Buckets: {}", table.get_buckets()?.len());
            println!("Bucket size (k): {}", table.k());
            println!("Replacement cache size: {}", table.cache_size());
        }
    }
    Ok(())
}
