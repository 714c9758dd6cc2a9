use anyhow::Result;
use clap::{Parser, Subcommand};
use guard::node;
use log::info;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "guard-node")]
#[command(about = "GUARD multi-chain validator cluster", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the cluster and run until Ctrl-C
    Run {
        #[arg(short, long)]
        config: PathBuf,

        /// Use in-process ledgers with synthetic traffic instead of JSON-RPC endpoints
        #[arg(long)]
        simulate: bool,
    },

    /// Validate a configuration file and print a summary
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print a fresh ed25519 keypair for validator configuration
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env = env_logger::Env::default().default_filter_or(cli.log_level.as_str());
    env_logger::Builder::from_env(env).init();

    match cli.command {
        Commands::Run { config, simulate } => {
            let config = node::load_config(&config)?;
            info!("Starting GUARD node...");
            node::run(config, simulate).await?;
        }
        Commands::CheckConfig { config } => {
            let config = node::load_config(&config)?;
            println!("configuration OK");
            println!("  chains:            {}", config.supported_chains.len());
            for chain in &config.supported_chains {
                let fallback = if chain.fallback_endpoint.is_some() { " + fallback" } else { "" };
                println!("    {} ({} endpoints{})", chain.name, chain.endpoints.len(), fallback);
            }
            println!("  validators:        {}", config.validators.len());
            let signers = config.validators.iter().filter(|v| v.bridge).count();
            println!("  bridge signers:    {}", signers);
            println!("  bridge threshold:  {}", config.bridge_signature_threshold);
            println!("  consensus:         {}", config.consensus_threshold);
            println!("  shards per chain:  {}", config.shard_count);
            println!("  auto-scaling:      {}", config.auto_scaling_enabled);
        }
        Commands::Keygen => {
            let keypair = node::generate_keypair();
            println!("secret_key = \"{}\"", keypair.secret_hex);
            println!("public_key = \"{}\"", keypair.public_hex);
        }
    }

    Ok(())
}
