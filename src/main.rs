//! ssr-local - SOCKS5 to SSR local accelerator
//!
//! Listens for SOCKS5 clients on the local machine and relays every CONNECT
//! stream to a remote SSR server, encrypted and obfuscated.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ssr_accelerator::json_logger::JsonLogger;
use ssr_accelerator::{
    Accelerator, AcceleratorDelegate, AcceleratorStatus, CipherMethod, ObfsMode, SessionConfig,
};

#[derive(Parser)]
#[command(name = "ssr-local")]
#[command(version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
))]
#[command(about = "SOCKS5 to SSR local accelerator", long_about = None)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "FILE", env = "SSR_CONFIG")]
    config: Option<PathBuf>,

    /// Remote SSR server host
    #[arg(short, long)]
    server: Option<String>,

    /// Remote SSR server port
    #[arg(short = 'p', long)]
    server_port: Option<u16>,

    /// Shared password
    #[arg(short = 'k', long, env = "SSR_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Cipher method, e.g. aes-256-cfb or chacha20-ietf
    #[arg(short, long)]
    method: Option<CipherMethod>,

    /// Obfuscation mode: plain, http_simple, http_post, tls1.2_ticket_auth
    #[arg(short, long)]
    obfs: Option<ObfsMode>,

    /// Obfuscation parameter, e.g. comma-separated fake hosts
    #[arg(short = 'g', long)]
    obfs_param: Option<String>,

    /// Local SOCKS5 bind address
    #[arg(short = 'b', long)]
    local_address: Option<String>,

    /// Local SOCKS5 port
    #[arg(short, long)]
    local_port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit lifecycle and traffic events as JSON lines on stdout
    #[arg(long)]
    json_log: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List cipher methods and obfuscation modes
    Methods,

    /// Write a sample configuration file
    Genconfig {
        /// Output path
        #[arg(short, long, default_value = "ssr-local.toml")]
        output: PathBuf,
    },
}

/// Reports accelerator events to the log or as JSON lines
struct CliDelegate {
    json: bool,
    interval_ms: u64,
}

impl AcceleratorDelegate for CliDelegate {
    fn status_changed(&self, status: &AcceleratorStatus) {
        if self.json {
            JsonLogger::status_changed(status).emit();
        } else {
            info!("Status: {}", status);
        }
    }

    fn traffic_updated(&self, received_delta: u64, sent_delta: u64) {
        if self.json {
            JsonLogger::traffic(received_delta, sent_delta, self.interval_ms).emit();
        } else {
            debug!("Traffic: +{} B down, +{} B up", received_delta, sent_delta);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match &cli.command {
        Some(Commands::Methods) => list_methods(),
        Some(Commands::Genconfig { output }) => generate_config(output),
        None => run_local(&cli).await,
    }
}

/// File configuration (if any) with command-line overrides on top
fn build_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match cli.config {
        Some(ref path) => SessionConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => {
            let server = cli
                .server
                .clone()
                .context("--server is required without --config")?;
            let password = cli
                .password
                .clone()
                .context("--password is required without --config")?;
            SessionConfig::new(server, cli.server_port.unwrap_or(8388), password)
        }
    };

    if let Some(ref server) = cli.server {
        config.server_address = server.clone();
    }
    if let Some(port) = cli.server_port {
        config.server_port = port;
    }
    if let Some(ref password) = cli.password {
        config.password = password.clone();
    }
    if let Some(method) = cli.method {
        config.method = method;
    }
    if let Some(obfs) = cli.obfs {
        config.obfs = obfs;
    }
    if cli.obfs_param.is_some() {
        config.obfs_param = cli.obfs_param.clone();
    }
    if let Some(ref address) = cli.local_address {
        config.local_address = address.clone();
    }
    if let Some(port) = cli.local_port {
        config.local_port = port;
    }

    Ok(config)
}

async fn run_local(cli: &Cli) -> Result<()> {
    let config = build_config(cli)?;
    if cli.json_log {
        JsonLogger::session_configured(&config).emit();
    }

    let accelerator = Accelerator::new();
    accelerator.set_delegate(Arc::new(CliDelegate {
        json: cli.json_log,
        interval_ms: config.traffic_interval.as_millis() as u64,
    }));

    info!(
        "Relaying to {}:{} with {} / {}",
        config.server_address, config.server_port, config.method, config.obfs
    );
    accelerator
        .configure(config)
        .context("Invalid configuration")?;
    accelerator
        .start()
        .await
        .context("Failed to start accelerator")?;

    if let Some(addr) = accelerator.local_addr() {
        info!("SOCKS5 proxy ready on {}", addr);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    accelerator.stop().await;

    let traffic = accelerator.traffic();
    info!(
        "Total: {} B received, {} B sent",
        traffic.received_bytes, traffic.sent_bytes
    );
    Ok(())
}

fn list_methods() -> Result<()> {
    println!("Cipher Methods");
    println!("==============");
    for method in CipherMethod::ALL {
        let params = method.params();
        let marker = if method.is_supported() { "" } else { "  (unsupported)" };
        println!(
            "  {:<18} key {:>2}  iv {:>2}{}",
            method.as_str(),
            params.key_len,
            params.iv_len,
            marker
        );
    }
    println!();

    println!("Obfuscation Modes");
    println!("=================");
    for mode in ObfsMode::ALL {
        println!("  {}", mode);
    }

    Ok(())
}

fn generate_config(path: &Path) -> Result<()> {
    let sample = SessionConfig::new("relay.example.com", 8388, "change-me")
        .with_method(CipherMethod::ChaCha20Ietf)
        .with_obfs(ObfsMode::HttpSimple, Some("cdn.example.com".to_string()))
        .with_remarks("sample");

    sample
        .to_file(path)
        .with_context(|| format!("Failed to write config to {:?}", path))?;

    #[cfg(unix)]
    {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }

    println!("Config saved to: {:?}", path);
    println!("   Run: ssr-local --config {:?}", path);
    Ok(())
}
