use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quorum_models::{AnalysisRequest, PriorityTier, TickerGroup};
use quorum_store::SignalJournal;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "quorum", about = "Multi-agent signal orchestration")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/quorum.toml")]
    config: String,

    /// Pretty-print the output JSON
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a ticker group and print the aggregated result
    Analyze {
        /// Ticker group id
        #[arg(short, long)]
        group: String,

        /// Capabilities to request. Defaults to every capability of an enabled agent.
        #[arg(short = 'C', long, value_delimiter = ',')]
        capabilities: Vec<String>,

        /// Define (or replace) the group with these instruments before analyzing
        #[arg(short, long, value_delimiter = ',')]
        instruments: Vec<String>,

        /// Priority tier override for this request
        #[arg(long, value_parser = parse_tier)]
        tier: Option<PriorityTier>,
    },
    /// Print journaled signals and aggregates for an instrument, oldest first
    Replay { instrument: String },
}

fn parse_tier(s: &str) -> Result<PriorityTier, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown tier '{s}' (critical, high, normal, low)"))
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let output = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{output}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = quorum::load_config(&cli.config)?;

    match cli.command {
        Command::Analyze {
            group,
            capabilities,
            instruments,
            tier,
        } => {
            let orchestrator =
                quorum::build_orchestrator(&config).context("Failed to build orchestrator")?;

            if !instruments.is_empty() {
                let refs: Vec<&str> = instruments.iter().map(String::as_str).collect();
                orchestrator
                    .groups()
                    .upsert(TickerGroup::new(&group, &refs))
                    .context("Invalid group")?;
            }

            let capabilities = if capabilities.is_empty() {
                config.agents.enabled_capabilities()
            } else {
                capabilities
            };

            let mut request = AnalysisRequest::new(&group, &[]);
            request.capabilities = capabilities;
            request.priority_tier = tier;

            let result = quorum::analyze(&orchestrator, request)
                .await
                .context("Analysis failed")?;
            orchestrator.shutdown().await;
            print_json(&result, cli.pretty)
        }
        Command::Replay { instrument } => {
            let journal = SignalJournal::open(&config.store.sqlite_path)
                .context("Failed to open signal journal")?;
            let records = journal
                .replay(&instrument.to_uppercase())
                .context("Failed to read journal")?;
            print_json(&records, cli.pretty)
        }
    }
}
