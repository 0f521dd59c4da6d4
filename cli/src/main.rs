// parley: broker, directory and chat client in one binary

mod chat;
mod config;
mod input;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use parley_core::{DirectoryServer, DirectoryService, TcpBroker, TcpLink, Transport};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley: presence directory and chat over a pub/sub broker", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a standalone broker
    Broker {
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Run the directory against an existing broker
    Directory {
        #[arg(short, long)]
        broker: Option<String>,
        #[arg(long)]
        max_clients: Option<usize>,
    },
    /// Run a broker with the directory attached
    Serve {
        #[arg(short, long)]
        listen: Option<String>,
        #[arg(long)]
        max_clients: Option<usize>,
    },
    /// Join as a chat client
    Chat {
        #[arg(short, long)]
        broker: Option<String>,
        #[arg(short, long)]
        username: Option<String>,
        /// Where received files are written
        #[arg(short, long)]
        download_dir: Option<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Show where the config file lives
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Broker { listen } => cmd_broker(listen).await,
        Commands::Directory {
            broker,
            max_clients,
        } => cmd_directory(broker, max_clients).await,
        Commands::Serve {
            listen,
            max_clients,
        } => cmd_serve(listen, max_clients).await,
        Commands::Chat {
            broker,
            username,
            download_dir,
        } => cmd_chat(broker, username, download_dir).await,
        Commands::Config { action } => cmd_config(action).await,
    }
}

/// Flips to `true` on Ctrl-C
pub(crate) fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Could not listen for Ctrl-C: {}", e);
            return;
        }
        tx.send_replace(true);
    });
    rx
}

async fn cmd_broker(listen: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let listen = listen.unwrap_or(config.listen_addr);

    let broker = TcpBroker::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind broker on {}", listen))?;
    println!("{} Broker listening on {}", "✓".green(), broker.local_addr()?);
    println!("{}", "Press Ctrl-C to stop.".dimmed());

    broker.run(shutdown_signal()).await?;

    let stats = broker.stats();
    println!(
        "{} Broker stopped ({} connections, {} messages routed)",
        "✓".green(),
        stats.connections_accepted,
        stats.messages_routed
    );
    Ok(())
}

async fn cmd_directory(broker: Option<String>, max_clients: Option<usize>) -> Result<()> {
    let mut config = config::Config::load()?;
    if let Some(max) = max_clients {
        config.max_clients = max;
    }
    let broker = broker.unwrap_or_else(|| config.broker_addr.clone());

    run_directory(&broker, &config, shutdown_signal()).await
}

async fn cmd_serve(listen: Option<String>, max_clients: Option<usize>) -> Result<()> {
    let mut config = config::Config::load()?;
    if let Some(max) = max_clients {
        config.max_clients = max;
    }
    let listen = listen.unwrap_or_else(|| config.listen_addr.clone());

    let broker = Arc::new(
        TcpBroker::bind(&listen)
            .await
            .with_context(|| format!("Failed to bind broker on {}", listen))?,
    );
    let addr = broker.local_addr()?;
    println!("{} Broker listening on {}", "✓".green(), addr);

    let shutdown = shutdown_signal();
    let runner = Arc::clone(&broker);
    let broker_shutdown = shutdown.clone();
    let broker_task = tokio::spawn(async move { runner.run(broker_shutdown).await });

    run_directory(&addr.to_string(), &config, shutdown).await?;
    broker_task
        .await
        .context("Broker task panicked")?
        .context("Broker failed")?;
    Ok(())
}

async fn run_directory(
    broker: &str,
    config: &config::Config,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (link, inbound) = TcpLink::connect(broker, "parley-directory")
        .await
        .with_context(|| format!("Failed to connect to broker at {}", broker))?;
    let transport: Arc<dyn Transport> = Arc::new(link);

    let service = Arc::new(DirectoryService::with_config(config.directory_config()));
    let server = DirectoryServer::new(Arc::clone(&service));
    println!(
        "{} Directory online via {} (max {} clients)",
        "✓".green(),
        broker,
        config.max_clients
    );
    println!("{}", "Press Ctrl-C to stop.".dimmed());

    let result = server.run(Arc::clone(&transport), inbound, shutdown).await;
    let _ = transport.close().await;

    let stats = service.stats();
    info!("Directory stats: {:?}", stats);
    println!(
        "{} Directory stopped ({} registered, {} relayed, {} still connected)",
        "✓".green(),
        stats.registrations_accepted,
        stats.relays_delivered,
        stats.connected
    );
    result.context("Lost connection to the broker")
}

async fn cmd_chat(
    broker: Option<String>,
    username: Option<String>,
    download_dir: Option<String>,
) -> Result<()> {
    let mut config = config::Config::load()?;
    if let Some(broker) = broker {
        config.broker_addr = broker;
    }
    if download_dir.is_some() {
        config.download_dir = download_dir;
    }

    chat::run(&config, username).await
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown or unset config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
