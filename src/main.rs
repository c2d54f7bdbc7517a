#![warn(clippy::all)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use proxy_harvest::codec::{parse_configs_from_text, Codec, Protocol};
use proxy_harvest::fetcher::decode_subscription_body;
use proxy_harvest::RuntimeConfig;

#[derive(Parser, Debug)]
#[command(name = "proxy-harvest", version, about = "Aggregate and test proxy configs")]
struct Cli {
    /// Force debug logging (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one aggregation round and print the summary as JSON
    Run {
        /// Config file (default: ~/.proxy-harvest/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Scan a local file and print the configs found in it
    Parse {
        file: PathBuf,
    },
}

#[derive(Serialize)]
struct ParsedLine {
    protocol: Protocol,
    host: String,
    port: u16,
    semantic_key: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(dispatch(cli.command))
}

async fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Run { config } => {
            let config = RuntimeConfig::load_from(config.as_deref()).context("failed to load configuration")?;
            let summary = proxy_harvest::run(config).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Parse { file } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let codec = Codec::new();
            let source = file.display().to_string();
            let lines: Vec<ParsedLine> = parse_configs_from_text(&decode_subscription_body(&text))
                .iter()
                .filter_map(|line| codec.parse(line, &source))
                .map(|c| ParsedLine {
                    protocol: c.protocol,
                    host: c.host,
                    port: c.port,
                    semantic_key: c.semantic_key,
                })
                .collect();
            tracing::info!(found = lines.len(), "parse: done");
            println!("{}", serde_json::to_string_pretty(&lines)?);
        }
    }
    Ok(())
}
