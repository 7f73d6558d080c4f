//! `labhost`: find LabHost hosts and talk to them from the command line.
//!
//! # Usage
//!
//! ```text
//! labhost [OPTIONS] <COMMAND>
//!
//! Commands:
//!   hosts        List every reachable host (saved, mDNS, local sockets)
//!   services     List raw mDNS services of the LabHost types
//!   watch        Print the service list every time it changes
//!   connect      Handshake with a host and print its state
//!   request      Send one request to a host and print the response
//!   add-host     Save a host in the config file
//!   remove-host  Forget a saved host
//!   config-path  Print where the config file lives
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                | Description                              |
//! |-------------------------|------------------------------------------|
//! | `LABHOST_CONFIG`        | Config file path                         |
//! | `LABHOST_SOCKET_DIR`    | Directory holding `<identifier>.sock`    |
//! | `LABHOST_QUERY_DELAY_MS`| Wait after an mDNS query                 |
//! | `RUST_LOG`              | `tracing` filter; wins over `log_level`  |
//!
//! # Architecture overview
//!
//! ```text
//! main()
//!  └─ load AppConfig (TOML)
//!  └─ ServiceScanner      -- multicast socket + record cache
//!  └─ UnixSocketProber    -- <identifier>.sock handshake checks
//!  └─ HostSearch          -- merges saved hosts, mDNS and sockets
//!  └─ Transport + ProtocolClient for connect / request
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use labhost_core::{BridgeSettings, HostEnvironment, HostSettings, Service};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use labhost_client::application::host_search::{
    HostSearch, ServiceBrowser, SECURE_SOCKET_SERVICE_TYPE, WEBSOCKET_SERVICE_TYPE,
};
use labhost_client::application::protocol_client::{ClientOptions, Handshake, ProtocolClient};
use labhost_client::infrastructure::discovery::{ScannerConfig, ServiceScanner, ServicesCallback};
use labhost_client::infrastructure::probe::{default_socket_dir, UnixSocketProber};
use labhost_client::infrastructure::storage::config::{
    config_file_path, load_config_from, save_config_to, AppConfig,
};
use labhost_client::infrastructure::transport::{connection_plan, Transport};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Discover LabHost hosts on this machine and the local network.
#[derive(Debug, Parser)]
#[command(name = "labhost", version)]
struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true, env = "LABHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding `<identifier>.sock` files.
    #[arg(long, global = true, env = "LABHOST_SOCKET_DIR")]
    socket_dir: Option<PathBuf>,

    /// Milliseconds to wait for mDNS answers after querying.
    #[arg(long, global = true, env = "LABHOST_QUERY_DELAY_MS")]
    query_delay_ms: Option<u64>,

    /// Milliseconds of quiet before `watch` reports a change.
    #[arg(long, global = true)]
    debounce_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every reachable host.
    Hosts {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// List mDNS services of the LabHost types.
    Services {
        #[arg(long)]
        json: bool,
    },
    /// Print the service list whenever it changes, until Ctrl-C.
    Watch,
    /// Handshake with a host and print its state.
    Connect {
        identifier: String,
        /// Keep the connection open and print every state change.
        #[arg(long)]
        follow: bool,
    },
    /// Send one request to a host and print the response.
    Request {
        identifier: String,
        /// JSON payload of the request.
        data: String,
    },
    /// Save a host in the config file.
    AddHost(AddHostArgs),
    /// Forget a saved host.
    RemoveHost { identifier: String },
    /// Print the config file path.
    ConfigPath,
}

#[derive(Debug, Args)]
struct AddHostArgs {
    identifier: String,
    #[arg(long)]
    label: Option<String>,
    /// Remote address as `hostname:port`.  Omit for a host on this machine.
    #[arg(long)]
    tcp: Option<String>,
    /// SHA-256 fingerprint to pin for the remote host.
    #[arg(long, requires = "tcp")]
    fingerprint: Option<String>,
}

impl AddHostArgs {
    fn into_settings(self) -> anyhow::Result<HostSettings> {
        let bridge = match self.tcp {
            None => BridgeSettings::Local,
            Some(target) => {
                let (hostname, port) = target
                    .rsplit_once(':')
                    .with_context(|| format!("expected hostname:port, got {target:?}"))?;
                let port: u16 = port.parse().with_context(|| format!("invalid port in {target:?}"))?;
                BridgeSettings::Tcp {
                    hostname: hostname.to_string(),
                    port,
                    fingerprint: self.fingerprint.map(|f| f.to_lowercase()),
                }
            }
        };
        Ok(HostSettings { identifier: self.identifier, label: self.label, bridge })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config_file_path().context("locating config file")?,
    };
    let mut config = load_config_from(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    apply_overrides(&mut config, &cli);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level)),
        )
        .init();
    debug!("using config {}", config_path.display());

    match cli.command {
        Command::Hosts { json } => {
            let hosts = search_hosts(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hosts)?);
            } else {
                print_hosts(&hosts);
            }
        }
        Command::Services { json } => {
            let scanner = start_scanner(&config)?;
            let services = scanner
                .get_services(&service_types(), config.discovery.query_delay())
                .await
                .context("querying mDNS")?;
            scanner.close();
            if json {
                println!("{}", serde_json::to_string_pretty(&services)?);
            } else {
                print_services(&services);
            }
        }
        Command::Watch => watch(&config).await?,
        Command::Connect { identifier, follow } => connect(&config, &identifier, follow).await?,
        Command::Request { identifier, data } => {
            let data: Value = serde_json::from_str(&data).context("request data must be JSON")?;
            request(&config, &identifier, data).await?;
        }
        Command::AddHost(args) => {
            let settings = args.into_settings()?;
            info!(identifier = %settings.identifier, "saving host");
            config.upsert_host(settings);
            save_config_to(&config, &config_path)
                .with_context(|| format!("writing {}", config_path.display()))?;
        }
        Command::RemoveHost { identifier } => {
            if !config.remove_host(&identifier) {
                bail!("no saved host named {identifier:?}");
            }
            save_config_to(&config, &config_path)
                .with_context(|| format!("writing {}", config_path.display()))?;
        }
        Command::ConfigPath => println!("{}", config_path.display()),
    }

    Ok(())
}

/// CLI flags win over the file.
fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(dir) = &cli.socket_dir {
        config.discovery.socket_dir = Some(dir.clone());
    }
    if let Some(ms) = cli.query_delay_ms {
        config.discovery.query_delay_ms = ms;
    }
    if let Some(ms) = cli.debounce_ms {
        config.discovery.debounce_ms = ms;
    }
}

fn service_types() -> Vec<String> {
    vec![SECURE_SOCKET_SERVICE_TYPE.to_string(), WEBSOCKET_SERVICE_TYPE.to_string()]
}

fn start_scanner(config: &AppConfig) -> anyhow::Result<ServiceScanner> {
    let scanner_config = ScannerConfig {
        debounce: config.discovery.debounce(),
        ..ScannerConfig::default()
    };
    ServiceScanner::start(scanner_config).context("starting mDNS scanner")
}

// ── Discovery commands ────────────────────────────────────────────────────────

async fn search_hosts(config: &AppConfig) -> anyhow::Result<Vec<HostEnvironment>> {
    let scanner = Arc::new(start_scanner(config)?);
    let socket_dir = config.discovery.socket_dir.clone().unwrap_or_else(default_socket_dir);
    let prober = Arc::new(UnixSocketProber::new(socket_dir, config.connection.close_timeout()));

    let search = HostSearch::new(
        Arc::clone(&scanner) as Arc<dyn ServiceBrowser>,
        prober,
        config.discovery.query_delay(),
        config.discovery.probe_timeout(),
    );
    let hosts = search.search(&config.hosts).await;
    scanner.close();

    Ok(hosts.into_values().collect())
}

fn print_hosts(hosts: &[HostEnvironment]) {
    if hosts.is_empty() {
        println!("no hosts found");
        return;
    }
    for host in hosts {
        let saved = if host.host_settings.is_some() { " (saved)" } else { "" };
        println!("{}  [{}]{saved}", host.display_label(), host.identifier);
        for bridge in &host.bridges {
            println!("    {bridge}");
        }
    }
}

fn print_services(services: &[Service]) {
    for service in services {
        let address = service.address().map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
        let port = service.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!("{}  {}  {address}:{port}", service.service_type, service.instance());
        for (key, value) in &service.properties {
            println!("    {key}={value}");
        }
    }
}

async fn watch(config: &AppConfig) -> anyhow::Result<()> {
    let scanner = start_scanner(config)?;
    let cancel = CancellationToken::new();

    let callback: ServicesCallback = Arc::new(|services: Vec<Service>| {
        println!("── {} service(s)", services.len());
        print_services(&services);
    });
    scanner.listen_to_services(callback, service_types(), cancel.clone());

    if let Err(e) = scanner.query_services(&service_types()).await {
        warn!("initial mDNS query failed: {e}");
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    cancel.cancel();
    scanner.close();
    Ok(())
}

// ── Connection commands ───────────────────────────────────────────────────────

/// Finds `identifier` and opens the first bridge whose handshake succeeds.
async fn open_host(
    config: &AppConfig,
    identifier: &str,
    options: impl Fn() -> ClientOptions,
) -> anyhow::Result<ProtocolClient<Transport>> {
    let hosts = search_hosts(config).await?;
    let Some(host) = hosts.into_iter().find(|h| h.identifier == identifier) else {
        bail!("host {identifier:?} not found");
    };

    for open_options in connection_plan(&host, config.connection.close_timeout()) {
        let target = open_options.address.to_string();
        let transport = match Transport::open(open_options).await {
            Ok(transport) => transport,
            Err(e) => {
                match e.reason() {
                    Some(reason) => warn!("{target}: {reason} ({e})"),
                    None => warn!("{target}: {e}"),
                }
                continue;
            }
        };

        let client = ProtocolClient::with_options(transport, options());
        match client.initialize().await {
            Ok(Handshake::Accepted(info)) => {
                info!(identifier = %info.identifier, version = info.version, "connected via {target}");
                return Ok(client);
            }
            Ok(Handshake::Rejected(reason)) => warn!("{target}: handshake rejected ({reason})"),
            Err(e) => warn!("{target}: {e}"),
        }
        client.close().await;
    }

    bail!("no bridge of {identifier:?} accepted a connection")
}

async fn connect(config: &AppConfig, identifier: &str, follow: bool) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = open_host(config, identifier, || {
        ClientOptions::default()
            .with_request_timeout(config.connection.request_timeout())
            .with_state_observer(tx.clone())
    })
    .await?;
    drop(tx);

    if let Some(info) = client.host_info() {
        println!("{}", serde_json::to_string_pretty(&info)?);
    }
    println!("{}", serde_json::to_string_pretty(&client.state())?);

    if !follow {
        client.close().await;
        return Ok(());
    }

    let client = Arc::new(client);
    let mut running = Arc::clone(&client).spawn();
    let ended = loop {
        tokio::select! {
            Some(state) = rx.recv() => println!("{}", serde_json::to_string_pretty(&state)?),
            ended = &mut running => break ended,
            _ = tokio::signal::ctrl_c() => {
                client.close().await;
                break running.await;
            }
        }
    };

    match ended {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e).context("connection ended"),
        Err(e) => Err(e).context("running loop panicked"),
    }
}

async fn request(config: &AppConfig, identifier: &str, data: Value) -> anyhow::Result<()> {
    let client = open_host(config, identifier, || {
        ClientOptions::default().with_request_timeout(config.connection.request_timeout())
    })
    .await?;

    let client = Arc::new(client);
    let running = Arc::clone(&client).spawn();

    let outcome = client.request(data).await;
    client.close().await;
    if let Err(e) = running.await {
        debug!("running loop join error: {e}");
    }

    let response = outcome.context("request failed")?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
