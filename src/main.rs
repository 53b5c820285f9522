use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use streamtab::config::{self, StreamConfig};
use streamtab::registry::{ComponentKind, Registry};
use streamtab::StreamBuilder;

#[derive(Parser)]
#[command(name = "streamtab", version, about = "Declarative stream processor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stream from a JSON config file
    Run {
        /// Path to the stream config
        config: PathBuf,
    },

    /// Print a new config built from an inputs/processors/outputs expression
    Create {
        /// e.g. `generate/split,metadata/stdout`; omit for the default config
        expression: Option<String>,

        /// Print only the component sections and omit advanced fields
        #[arg(short, long)]
        small: bool,
    },

    /// List registered components
    List {
        /// input, buffer, processor, output, cache or rate_limit
        kind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let registry = Registry::with_builtins();

    match cli.command {
        Commands::Run { config } => cmd_run(&config, &registry).await,
        Commands::Create { expression, small } => {
            let config = config::create_config(expression.as_deref().unwrap_or(""), &registry, small)?;
            println!("{}", config::render(&config, small)?);
            Ok(())
        }
        Commands::List { kind } => cmd_list(kind.as_deref(), &registry),
    }
}

async fn cmd_run(path: &Path, registry: &Registry) -> anyhow::Result<()> {
    let config = StreamConfig::from_file(path)?;
    streamtab::logging::init(&config.logger);

    let mut stream = StreamBuilder::from_config(&config, registry).await?;
    let report = stream
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!(
        received = report.received,
        acked = report.acked,
        nacked = report.nacked,
        duration_ms = report.duration.as_millis() as u64,
        "finished"
    );
    eprintln!("{}", stream.monitor().report());
    Ok(())
}

fn cmd_list(kind: Option<&str>, registry: &Registry) -> anyhow::Result<()> {
    let kinds = match kind {
        Some(name) => match ComponentKind::parse(name) {
            Some(kind) => vec![kind],
            None => anyhow::bail!("unknown component kind '{name}'"),
        },
        None => ComponentKind::ALL.to_vec(),
    };

    for kind in kinds {
        println!("{kind}:");
        for spec in registry.list(kind) {
            println!("  {:<12} {}", spec.name, spec.summary);
        }
    }
    Ok(())
}
