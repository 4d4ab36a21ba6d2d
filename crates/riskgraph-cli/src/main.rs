//! Risk graph command-line tools.
//!
//! Provides the `riskgraph` binary for importing, exporting and querying
//! dependency graphs stored in a SQLite database. Every query prints JSON
//! to stdout; logs go to stderr.
//!
//! Exit codes: 0 = success, 1 = query error, 3 = storage or I/O error.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use serde::Serialize;

use riskgraph_cascade::{CascadeConfig, CascadeEngine, ClusterMethod};
use riskgraph_core::{DependencyGraph, GraphRecord, GraphSnapshot};
use riskgraph_storage::{GraphStore, SqliteStore};

const QUERY_ERROR: i32 = 1;
const STORAGE_ERROR: i32 = 3;

/// Dependency graph storage and cascade queries.
#[derive(Parser)]
#[command(name = "riskgraph", about = "Dependency graph storage and cascade queries")]
struct Cli {
    /// Path to the graph database file.
    #[arg(short, long, global = true, default_value = "riskgraph.db")]
    db: PathBuf,

    /// JSON file with cascade settings (decay, weights, seed).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace a named graph with the contents of a JSON graph record.
    Import {
        #[arg(short, long)]
        graph: String,
        /// JSON file with `nodes` and `edges`.
        file: PathBuf,
    },
    /// Print a named graph as a JSON graph record.
    Export {
        #[arg(short, long)]
        graph: String,
        /// Write to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List stored graphs with sizes and content digests.
    List,
    /// Node, edge and connectivity statistics.
    Stats {
        #[arg(short, long)]
        graph: String,
    },
    /// Propagate a shock from one entity.
    Propagate {
        #[arg(short, long)]
        graph: String,
        origin: String,
        #[arg(long, default_value_t = 1.0)]
        shock: f64,
        #[arg(long)]
        max_depth: Option<usize>,
        #[arg(long)]
        decay: Option<f64>,
    },
    /// Partition the graph into risk clusters.
    Clusters {
        #[arg(short, long)]
        graph: String,
        /// louvain or connected_components.
        #[arg(long, default_value = "louvain")]
        method: String,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Strongest influence paths between two entities.
    Paths {
        #[arg(short, long)]
        graph: String,
        source: String,
        target: String,
        #[arg(long)]
        max_depth: Option<usize>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Strongest path to each entity reachable from a source.
    CriticalPaths {
        #[arg(short, long)]
        graph: String,
        source: String,
        #[arg(long)]
        max_depth: Option<usize>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// A route with the fewest hops between two entities.
    ShortestPath {
        #[arg(short, long)]
        graph: String,
        source: String,
        target: String,
    },
    /// Entities ranked by combined risk and centrality.
    Hotspots {
        #[arg(short, long)]
        graph: String,
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = run(cli);
    process::exit(exit_code);
}

fn run(cli: Cli) -> i32 {
    let mut config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(code) => return code,
    };

    match cli.command {
        Commands::Import { graph, file } => run_import(&cli.db, &graph, &file),
        Commands::Export { graph, output } => run_export(&cli.db, &graph, output.as_deref()),
        Commands::List => run_list(&cli.db),
        Commands::Stats { graph } => with_graph(&cli.db, &graph, |g| {
            let cascade = engine(config)?;
            Ok(to_json(&cascade.statistics(g)))
        }),
        Commands::Propagate {
            graph,
            origin,
            shock,
            max_depth,
            decay,
        } => {
            if let Some(depth) = max_depth {
                config.max_depth = depth;
            }
            if let Some(decay) = decay {
                config.decay_rate = decay;
            }
            with_graph(&cli.db, &graph, |g| {
                let result = engine(config)?
                    .propagate(g, &origin, shock)
                    .map_err(|e| e.to_string())?;
                Ok(to_json(&result))
            })
        }
        Commands::Clusters {
            graph,
            method,
            seed,
        } => {
            if let Some(seed) = seed {
                config.cluster_seed = seed;
            }
            with_graph(&cli.db, &graph, |g| {
                let method: ClusterMethod = method.parse().map_err(|e| format!("{e}"))?;
                let result = engine(config)?
                    .clusters(g, method)
                    .map_err(|e| e.to_string())?;
                Ok(to_json(&result))
            })
        }
        Commands::Paths {
            graph,
            source,
            target,
            max_depth,
            limit,
        } => {
            if let Some(depth) = max_depth {
                config.max_depth = depth;
            }
            with_graph(&cli.db, &graph, |g| {
                let snapshot = GraphSnapshot::new(g.clone());
                let search = engine(config)?
                    .paths(&snapshot, &source, &target)
                    .map_err(|e| e.to_string())?;
                let paths: Vec<_> = search.iter().take(limit).collect();
                Ok(to_json(&paths))
            })
        }
        Commands::CriticalPaths {
            graph,
            source,
            max_depth,
            limit,
        } => {
            if let Some(depth) = max_depth {
                config.max_depth = depth;
            }
            with_graph(&cli.db, &graph, |g| {
                let paths = engine(config)?
                    .critical_paths(g, &source, limit)
                    .map_err(|e| e.to_string())?;
                Ok(to_json(&paths))
            })
        }
        Commands::ShortestPath {
            graph,
            source,
            target,
        } => with_graph(&cli.db, &graph, |g| {
            let path = engine(config)?
                .shortest_path(g, &source, &target)
                .map_err(|e| e.to_string())?;
            Ok(to_json(&path))
        }),
        Commands::Hotspots { graph, top } => with_graph(&cli.db, &graph, |g| {
            let hotspots = engine(config)?
                .hotspots(g, top)
                .map_err(|e| e.to_string())?;
            Ok(to_json(&hotspots))
        }),
    }
}

fn load_config(path: Option<&Path>) -> Result<CascadeConfig, i32> {
    let Some(path) = path else {
        return Ok(CascadeConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|e| {
        eprintln!("Error: cannot read config '{}': {}", path.display(), e);
        STORAGE_ERROR
    })?;
    serde_json::from_str(&text).map_err(|e| {
        eprintln!("Error: invalid config '{}': {}", path.display(), e);
        QUERY_ERROR
    })
}

fn engine(config: CascadeConfig) -> Result<CascadeEngine, String> {
    CascadeEngine::new(config).map_err(|e| format!("invalid cascade settings: {e}"))
}

fn open_store(db: &Path) -> Result<SqliteStore, i32> {
    SqliteStore::new(&db.to_string_lossy()).map_err(|e| {
        eprintln!("Error: failed to open database '{}': {}", db.display(), e);
        STORAGE_ERROR
    })
}

/// Loads a named graph, runs `query` on it and prints the JSON it returns.
fn with_graph(
    db: &Path,
    name: &str,
    query: impl FnOnce(&DependencyGraph) -> Result<String, String>,
) -> i32 {
    let graph = match load_named(db, name) {
        Ok(graph) => graph,
        Err(code) => return code,
    };
    match query(&graph) {
        Ok(json) => {
            println!("{}", json);
            0
        }
        Err(msg) => {
            eprintln!("Error: {}", msg);
            QUERY_ERROR
        }
    }
}

fn load_named(db: &Path, name: &str) -> Result<DependencyGraph, i32> {
    let store = open_store(db)?;
    let id = match store.find_graph(name) {
        Ok(Some(id)) => id,
        Ok(None) => {
            eprintln!("Error: no graph named '{}'", name);
            return Err(STORAGE_ERROR);
        }
        Err(e) => {
            eprintln!("Error: failed to look up graph '{}': {}", name, e);
            return Err(STORAGE_ERROR);
        }
    };
    store.load_dependency_graph(id).map_err(|e| {
        eprintln!("Error: failed to load graph '{}': {}", name, e);
        STORAGE_ERROR
    })
}

fn run_import(db: &Path, name: &str, file: &Path) -> i32 {
    let text = match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error: cannot read '{}': {}", file.display(), e);
            return STORAGE_ERROR;
        }
    };
    let record: GraphRecord = match serde_json::from_str(&text) {
        Ok(record) => record,
        Err(e) => {
            eprintln!("Error: '{}' is not a graph record: {}", file.display(), e);
            return QUERY_ERROR;
        }
    };
    // Reject invalid records before touching the database.
    let graph = match DependencyGraph::from_record(record) {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("Error: invalid graph record: {}", e);
            return QUERY_ERROR;
        }
    };

    let mut store = match open_store(db) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let saved = store
        .open_or_create(name)
        .and_then(|id| store.save_dependency_graph(id, &graph).map(|_| id))
        .and_then(|id| store.digest(id));
    match saved {
        Ok(digest) => {
            tracing::info!(
                graph = name,
                nodes = graph.node_count(),
                edges = graph.edge_count(),
                "imported graph"
            );
            println!(
                "{}",
                to_json(&serde_json::json!({
                    "graph": name,
                    "nodes": graph.node_count(),
                    "edges": graph.edge_count(),
                    "digest": digest,
                }))
            );
            0
        }
        Err(e) => {
            eprintln!("Error: failed to save graph '{}': {}", name, e);
            STORAGE_ERROR
        }
    }
}

fn run_export(db: &Path, name: &str, output: Option<&Path>) -> i32 {
    let graph = match load_named(db, name) {
        Ok(graph) => graph,
        Err(code) => return code,
    };
    let json = to_json(&graph.to_record());
    match output {
        Some(path) => match std::fs::write(path, json) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: cannot write '{}': {}", path.display(), e);
                STORAGE_ERROR
            }
        },
        None => {
            println!("{}", json);
            0
        }
    }
}

fn run_list(db: &Path) -> i32 {
    let store = match open_store(db) {
        Ok(store) => store,
        Err(code) => return code,
    };
    match store.list_graphs() {
        Ok(graphs) => {
            println!("{}", to_json(&graphs));
            0
        }
        Err(e) => {
            eprintln!("Error: failed to list graphs: {}", e);
            STORAGE_ERROR
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize result: {}\"}}", e))
}
