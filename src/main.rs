//! Burrow - TCP over DNS tunnel
//!
//! Runs as either endpoint of the tunnel: the client exposes a local TCP
//! port and smuggles its bytes out as DNS TXT queries; the server answers
//! those queries and relays to a real TCP backend.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use burrow::session::DEFAULT_TLD;
use burrow::{
    BurrowConfig, ClientConfig, DnsTunnelClient, DnsTunnelServer, ServerConfig, TunnelMode,
};

#[derive(Parser)]
#[command(name = "burrow")]
#[command(version)]
#[command(about = "Tunnels TCP byte streams over DNS TXT queries", long_about = None)]
struct Cli {
    /// Configuration file path (TOML); alternative to a subcommand
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the client: accept local TCP connections, tunnel them over DNS
    Client {
        /// Local TCP listen address
        #[arg(short, long, default_value = "127.0.0.1:2222")]
        listen: SocketAddr,

        /// DNS resolver to tunnel through (host:port)
        #[arg(short, long)]
        dest: String,

        /// Trailing label on every query name
        #[arg(long, default_value = DEFAULT_TLD)]
        tld: String,
    },

    /// Run the server: answer DNS queries, relay to the backend TCP service
    Server {
        /// UDP DNS listen address
        #[arg(short, long, default_value = "0.0.0.0:53")]
        listen: SocketAddr,

        /// Backend TCP destination (host:port)
        #[arg(short, long)]
        dest: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match (&cli.command, &cli.config) {
        (Some(command), _) => config_from_command(command),
        (None, Some(path)) => BurrowConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        (None, None) => {
            bail!("no mode selected: pass `client`/`server` or --config FILE (see --help)")
        }
    };

    init_logging(cli.verbose, config.debug);
    config.validate()?;

    match config.mode {
        TunnelMode::Client => {
            let Some(client_cfg) = config.client else {
                bail!("client mode requires a [client] section");
            };
            run_client(client_cfg, config.tld).await
        }
        TunnelMode::Server => {
            let Some(server_cfg) = config.server else {
                bail!("server mode requires a [server] section");
            };
            run_server(server_cfg).await
        }
    }
}

fn config_from_command(command: &Commands) -> BurrowConfig {
    match command {
        Commands::Client { listen, dest, tld } => BurrowConfig {
            mode: TunnelMode::Client,
            client: Some(ClientConfig {
                listen_addr: *listen,
                dns_server: dest.clone(),
            }),
            server: None,
            tld: tld.clone(),
            debug: false,
        },
        Commands::Server { listen, dest } => BurrowConfig {
            mode: TunnelMode::Server,
            client: None,
            server: Some(ServerConfig {
                listen_addr: *listen,
                tcp_dest: dest.clone(),
            }),
            tld: DEFAULT_TLD.to_string(),
            debug: false,
        },
    }
}

fn init_logging(verbose: u8, debug: bool) {
    let log_level = match verbose {
        0 if debug => log::LevelFilter::Debug,
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();
}

async fn run_client(config: ClientConfig, tld: String) -> Result<()> {
    let dns_server = tokio::net::lookup_host(&config.dns_server)
        .await
        .with_context(|| format!("failed to resolve DNS server {}", config.dns_server))?
        .next()
        .with_context(|| format!("no address for DNS server {}", config.dns_server))?;

    let client = DnsTunnelClient::bind(config.listen_addr, dns_server, tld)
        .await
        .with_context(|| format!("failed to bind TCP listener on {}", config.listen_addr))?;

    client.run().await?;
    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = DnsTunnelServer::bind(config.listen_addr, config.tcp_dest)
        .await
        .with_context(|| format!("failed to bind DNS socket on {}", config.listen_addr))?;

    server.run().await?;
    Ok(())
}
