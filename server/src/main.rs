use clap::Parser;
use log::{error, info};
use server::network::{Server, ServerConfig, ServerResult};
use server::registry::{ActivityPolicy, RegistryConfig};
use shared::{CHAT_HISTORY_LEN, DEFAULT_CHECK_INTERVAL_SECS, DEFAULT_PORT, DEFAULT_TIMEOUT_SECS};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds without movement before a player is evicted
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Seconds between inactivity sweeps
    #[arg(short, long, default_value_t = DEFAULT_CHECK_INTERVAL_SECS)]
    check_interval_secs: u64,

    /// World-state broadcasts per second
    #[arg(short, long, default_value = "10", value_parser = clap::value_parser!(u32).range(1..=1000))]
    broadcast_rate: u32,

    /// Treat a changed party snapshot as player activity
    #[arg(long)]
    count_party_as_activity: bool,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let activity_policy = if self.count_party_as_activity {
            ActivityPolicy::AnyChange
        } else {
            ActivityPolicy::MovementOnly
        };

        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            broadcast_interval: Duration::from_millis(1000 / u64::from(self.broadcast_rate)),
            chat_history: CHAT_HISTORY_LEN,
            registry: RegistryConfig {
                timeout: Duration::from_secs(self.timeout_secs),
                check_interval: Duration::from_secs(self.check_interval_secs),
                activity_policy,
                ..RegistryConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> ServerResult<()> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = Args::parse().into_config();
    info!(
        "Starting presence server (timeout {:?}, sweep every {:?})",
        config.registry.timeout, config.registry.check_interval
    );

    let mut server = Server::bind(config).await?;
    let shutdown = server.shutdown_handle();

    let mut run = tokio::spawn(async move { server.run().await });

    tokio::select! {
        result = &mut run => return join_result(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.shutdown();
        }
    }

    join_result(run.await)
}

fn join_result(result: Result<ServerResult<()>, tokio::task::JoinError>) -> ServerResult<()> {
    match result {
        Ok(result) => result,
        Err(e) => {
            error!("Server task panicked: {}", e);
            Err(e.into())
        }
    }
}
