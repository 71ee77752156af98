use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clusterguard::config::{Config, ConfigError};
use clusterguard::topology::HOST_TEMPLATE_PLACEHOLDER;
use clusterguard::utils::{format_duration, rds};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clusterguard")]
#[command(about = "Topology, failure monitoring and failover tooling for database clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "clusterguard-team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Generate example configuration files
    Config {
        /// Configuration mode (cluster or custom-domain)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Classify a database endpoint
    Classify {
        /// Hostname the driver connects to
        #[arg(long)]
        host: String,
        /// Port of the cluster instances
        #[arg(short, long, default_value_t = 3306)]
        port: u16,
    },
    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => validate_config(config)?,
        Commands::Config { mode, output } => generate_config(mode, output)?,
        Commands::Classify { host, port } => classify(&host, port),
        Commands::Version => show_version(),
    }

    Ok(())
}

fn generate_config(mode: String, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, &mode).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  clusterguard validate --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    let config = match Config::load_from_file(&config_path) {
        Ok(config) => config,
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
    };

    init_logging(&config)?;
    info!("Configuration loaded from {:?}", config_path);

    let failover = &config.failover;
    println!("✓ Configuration file is valid");
    println!("  Host: {}:{}", failover.host, failover.port);
    println!("  Endpoint: {}", rds::classify_endpoint(&failover.host));
    println!("  Failover enabled: {}", failover.enabled);
    println!("  Failover timeout: {}", format_duration(failover.failover_timeout()));
    println!("  Topology refresh: {}", format_duration(failover.topology_refresh_rate()));

    let monitoring = config.monitoring.settings();
    println!("  Monitoring enabled: {}", config.monitoring.enabled);
    println!(
        "  Failure detection: grace {}, interval {}, count {}",
        format_duration(monitoring.failure_detection_time),
        format_duration(monitoring.failure_detection_interval),
        monitoring.failure_detection_count
    );
    println!("  Custom endpoint tracking: {}", config.custom_endpoint.enabled);

    Ok(())
}

fn classify(host: &str, port: u16) {
    let endpoint = rds::classify_endpoint(host);
    println!("Host: {}", host);
    println!("  Endpoint class: {}", endpoint);

    match rds::get_rds_instance_host_pattern(host) {
        Some(pattern) => println!("  Instance template: {}:{}", pattern, port),
        None => println!(
            "  Instance template: none (configure a host pattern containing '{}')",
            HOST_TEMPLATE_PLACEHOLDER
        ),
    }
    if let Some(cluster_url) = rds::get_rds_cluster_host_url(host) {
        println!("  Cluster id: {}:{}", cluster_url, port);
    }
    if let Some(cluster) = rds::get_rds_cluster_id(host) {
        println!("  Cluster name: {}", cluster);
    }
    if endpoint == rds::EndpointClass::RdsProxy {
        println!("  Failover: handled by the proxy");
    }
}

fn show_version() {
    println!("clusterguard v{}", env!("CARGO_PKG_VERSION"));
    println!("Topology, failure monitoring and failover tooling for database clusters");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Cluster topology discovery with shared snapshot cache");
    println!("  • Enhanced failure monitoring with shared per-node health checks");
    println!("  • Reader and writer failover races");
    println!("  • Custom endpoint membership tracking");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
