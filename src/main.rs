use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ccrelay::config::RelayConfig;
use ccrelay::plugins::{builtin, PluginRegistry};
use ccrelay::proxy;
use ccrelay::proxy::util::format_key_preview;

#[derive(Parser)]
#[command(name = "ccrelay", version, about = "Anthropic-compatible LLM proxy")]
struct Cli {
    /// Path to a config file (overrides discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Serve {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Check the configuration and print a summary
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RelayConfig::load(cli.config.as_deref())?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Validate) => print_summary(&config),
        Some(Commands::Serve { port }) => proxy::start_proxy(config, port).await?,
        None => proxy::start_proxy(config, None).await?,
    }

    Ok(())
}

fn print_summary(config: &RelayConfig) {
    println!("config ok");
    if let Some(source) = &config.config_source {
        println!("  source: {}", source.display());
    }
    println!("  providers:");
    for provider in &config.providers {
        let models = provider.advertised_models();
        let keys = provider.api_key.keys();
        let key_desc = match keys.len() {
            0 => "no key".to_string(),
            1 => format_key_preview(&keys[0]),
            n => format!("{n} keys, first {}", format_key_preview(&keys[0])),
        };
        println!(
            "    {} -> {} ({} models, {key_desc})",
            provider.name,
            provider.api_base,
            models.len()
        );
    }
    println!("  routes:");
    for (class, rule) in config.router.entries() {
        println!("    {class} -> {rule}");
    }
    println!("  plugins:");
    let registry = PluginRegistry::new();
    builtin::register_builtins(&registry, &config.plugins);
    for (chain, entries) in registry.describe() {
        if entries.is_empty() {
            continue;
        }
        println!("    {chain}:");
        for entry in entries {
            println!("      {entry}");
        }
    }
}
