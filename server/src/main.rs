use clap::Parser;
use log::info;
use server::collaborators::Collaborators;
use server::config::ServerConfig;
use server::network::NetworkServer;
use std::path::PathBuf;

/// Session server: tracks clients, rate-limits them and dispatches their messages.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Configuration file; missing files fall back to defaults
    #[arg(short, long, default_value = "server.toml")]
    config: PathBuf,

    /// Maximum number of connected clients
    #[arg(short, long)]
    max_clients: Option<usize>,

    /// Simulate the world on the server instead of electing a client host
    #[arg(short, long)]
    authoritative: bool,

    /// Password for remote console access
    #[arg(long)]
    rcon_password: Option<String>,
}

impl Args {
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        if self.authoritative {
            config.authoritative = true;
        }
        if self.rcon_password.is_some() {
            config.rcon_password = self.rcon_password;
        }
        config.normalized()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig::load(&args.config)?;
    let config = args.apply(config);

    info!(
        "Starting server on {} (max clients: {}, tick rate: {} Hz)",
        config.bind_address(),
        config.max_clients,
        config.tick_rate
    );
    info!("Use RUST_LOG=debug for detailed logging");

    let server = NetworkServer::bind(config, Collaborators::default()).await?;
    server.run().await?;

    info!("Server stopped");
    Ok(())
}
