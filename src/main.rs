use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use estrada::config::{Config, ConfigError};
use estrada::{DataAccess, TcpConnector};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "estrada")]
#[command(about = "Data-access routing layer: read-through cache, primary/replica routing and slow-query warnings")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Estrada Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Connect to every configured target, probe once and print the health report
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Check { config } => check(config).await?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn check(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;
    info!("Configuration loaded from: {:?}", config_path);

    let access = DataAccess::connect(&config, TcpConnector::default())
        .await
        .context("Failed to build data access layer")?;

    // Exercise the primary once so its pool stats reflect a real connection
    if let Err(e) = access.router().primary().probe().await {
        tracing::warn!(pool = %config.primary.name, "Primary probe failed: {}", e);
    }

    let report = access.health();
    access.close().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  estrada check --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Primary: {} ({})", config.primary.name, estrada::core::dsn::redact(&config.primary.dsn));
            println!("  Replicas: {} instances", config.replicas.len());
            for (i, replica) in config.replicas.iter().enumerate() {
                println!("    {}: {} ({})", i + 1, replica.name, estrada::core::dsn::redact(&replica.dsn));
            }
            println!("  Pool size: {}", config.pool.max_connections);
            println!("  Routing strategy: {}", config.routing.strategy);
            match &config.cache.redis_url {
                Some(url) => println!("  Cache: Redis at {}", estrada::core::dsn::redact(url)),
                None => println!("  Cache: in-process"),
            }
            println!("  Slow-query threshold: {} ms", config.timer.warn_threshold_ms);
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("estrada v{}", env!("CARGO_PKG_VERSION"));
    println!("Data-access routing layer for CRUD services");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Read-through caching on Redis with in-process fallback");
    println!("  • Primary/replica routing with automatic failover");
    println!("  • Background replica health and lag monitoring");
    println!("  • Slow-query warnings");
}

fn init_logging(config: &Config) -> Result<()> {
    // RUST_LOG overrides the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
