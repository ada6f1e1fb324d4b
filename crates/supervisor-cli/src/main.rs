use anyhow::Result;
use clap::{Parser, Subcommand};
use supervisor_core::SupervisorConfig;
use supervisor_storage::{DurableStore, SqliteStore};

#[derive(Parser)]
#[command(name = "supervisorctl")]
#[command(about = "Offline maintenance tool for the supervisor's durable store", long_about = None)]
struct Cli {
    /// Overrides SUPERVISOR_DATA_DIR for this invocation.
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Applies pending schema migrations and exits.
    Migrate,
    /// Dumps persisted nodes and sessions as JSON, bypassing the running process.
    Dump,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SupervisorConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let store = SqliteStore::connect(&config.data_dir).await?;

    match cli.cmd {
        Cmd::Migrate => {
            store.migrate().await?;
            println!("migrations applied against {}", config.data_dir);
        }
        Cmd::Dump => {
            store.migrate().await?;
            let nodes = store.load_nodes().await?;
            let sessions = store.load_sessions().await?;
            for err in &nodes.errors {
                eprintln!("skipped corrupted node row {}: {}", err.id, err.cause);
            }
            for err in &sessions.errors {
                eprintln!("skipped corrupted session row {}: {}", err.id, err.cause);
            }
            let out = serde_json::json!({
                "nodes": nodes.rows,
                "sessions": sessions.rows,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(())
}
