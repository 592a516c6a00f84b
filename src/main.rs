//! busbridge CLI - send, publish, request and listen on a remote event bus.
//!
//! This is the main binary entry point. See the `busbridge` library for
//! the client and dispatcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use busbridge::{BridgeClient, BridgeConfig, Dispatcher, Message};
use clap::{Parser, Subcommand};
use serde_json::Value;

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser)]
#[command(name = "busbridge")]
#[command(about = "Talk to a remote event bus bridge", long_about = None)]
#[command(version)]
struct Cli {
    /// Bridge address (`host:port`), overrides config and environment
    #[arg(long = "address", id = "bridge_address", value_name = "HOST:PORT", global = true)]
    bridge: Option<String>,

    /// Config file to load instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a point-to-point message
    Send {
        /// Destination address
        address: String,
        /// Message body as JSON
        body: String,
        /// Address the receiver should reply to
        #[arg(long)]
        reply_address: Option<String>,
        /// Headers as a JSON object
        #[arg(long)]
        headers: Option<String>,
    },
    /// Publish a message to every handler on an address
    Publish {
        /// Destination address
        address: String,
        /// Message body as JSON
        body: String,
        /// Headers as a JSON object
        #[arg(long)]
        headers: Option<String>,
    },
    /// Send a message and wait for its reply
    Request {
        /// Destination address
        address: String,
        /// Message body as JSON
        body: String,
        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Print every record delivered to the given addresses until Ctrl-C
    Listen {
        /// Addresses to register
        #[arg(required = true)]
        addresses: Vec<String>,
    },
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::load_or_default()?,
    };
    config.apply_env()?;
    if let Some(bridge) = &cli.bridge {
        config.address.clone_from(bridge);
    }
    Ok(config)
}

fn parse_json(what: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON for {what}: {raw}"))
}

fn parse_headers(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|raw| parse_json("headers", raw)).transpose()
}

fn print_record(message: &Message) -> Result<()> {
    println!("{}", serde_json::to_string(message)?);
    Ok(())
}

async fn connect(config: &BridgeConfig) -> Result<BridgeClient> {
    BridgeClient::connect_with_config(config)
        .await
        .with_context(|| format!("Failed to connect to bridge at {}", config.address))
}

async fn run_request(
    config: &BridgeConfig,
    address: &str,
    body: &Value,
    timeout: Duration,
) -> Result<()> {
    let client = Arc::new(connect(config).await?);
    let dispatcher = Dispatcher::new(Arc::clone(&client));
    dispatcher.start()?;

    let outcome = dispatcher.request(address, None, body, timeout).await;
    dispatcher.stop();
    client.close().await?;

    let reply = outcome?;
    print_record(&reply)?;

    if let Some(failure) = reply.failure() {
        anyhow::bail!("Request failed: {failure}");
    }
    Ok(())
}

async fn run_listen(config: &BridgeConfig, addresses: &[String]) -> Result<()> {
    let client = Arc::new(connect(config).await?);
    let mut dispatcher = Dispatcher::new(Arc::clone(&client));
    if let Some(interval) = config.ping_interval() {
        dispatcher = dispatcher.with_ping_interval(interval);
    }

    let mut printers = Vec::with_capacity(addresses.len());
    for address in addresses {
        let mut subscription = dispatcher.register(address, config.queue_capacity).await?;
        printers.push(tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                if let Err(e) = print_record(&message) {
                    log::warn!("Failed to print record: {e}");
                }
            }
        }));
    }
    dispatcher.start()?;
    log::info!("Listening on {} address(es), Ctrl-C to stop", addresses.len());

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            log::info!("Interrupted, shutting down");
            Ok(())
        }
        error = dispatcher.wait_for_error() => match error {
            Some(error) => Err(anyhow::anyhow!("Dispatcher stopped: {error}")),
            None => Ok(()),
        },
    };

    dispatcher.stop();
    for printer in printers {
        if let Err(e) = printer.await {
            log::warn!("Printer task failed: {e}");
        }
    }
    if !client.is_closed() {
        if let Err(e) = client.close().await {
            log::debug!("Close after listen failed: {e}");
        }
    }
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(DEFAULT_LOG_FILTER))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    log::debug!("Using bridge at {}", config.address);

    match cli.command {
        Commands::Send {
            address,
            body,
            reply_address,
            headers,
        } => {
            let body = parse_json("body", &body)?;
            let headers = parse_headers(headers.as_deref())?;
            let client = connect(&config).await?;
            match reply_address {
                Some(reply) => client.send_with_reply(&address, &reply, headers, &body).await?,
                None => client.send(&address, headers, &body).await?,
            }
            client.close().await?;
        }
        Commands::Publish {
            address,
            body,
            headers,
        } => {
            let body = parse_json("body", &body)?;
            let headers = parse_headers(headers.as_deref())?;
            let client = connect(&config).await?;
            client.publish(&address, headers, &body).await?;
            client.close().await?;
        }
        Commands::Request {
            address,
            body,
            timeout_secs,
        } => {
            let body = parse_json("body", &body)?;
            run_request(&config, &address, &body, Duration::from_secs(timeout_secs)).await?;
        }
        Commands::Listen { addresses } => {
            run_listen(&config, &addresses).await?;
        }
    }

    Ok(())
}
