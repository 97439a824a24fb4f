use clap::Parser;
use client::network::{LocalState, PresenceClient};
use log::info;
use shared::{Direction, PartySnapshot, PartyValue};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Map the bot walks around on
    #[arg(short = 'm', long, default_value = "map.tmx")]
    map: String,

    /// Milliseconds between state updates
    #[arg(short = 'b', long, default_value = "100", value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_ms: u64,

    /// Side length of the square the bot walks, in tiles
    #[arg(long, default_value = "4")]
    loop_tiles: u32,

    /// Name of the monster leading the bot's party
    #[arg(long, default_value = "Pikachu")]
    leader: String,
}

const TILE_SIZE: f32 = 64.0;

/// Walks a square loop one tile per step
struct Walker {
    state: LocalState,
    side: u32,
    step: u32,
}

impl Walker {
    fn new(map: String, side: u32, leader: &str) -> Self {
        let mut party = PartySnapshot::new();
        party.insert("name".to_string(), PartyValue::from(leader));
        party.insert("hp".to_string(), PartyValue::Int(35));
        party.insert("max_hp".to_string(), PartyValue::Int(35));
        party.insert("level".to_string(), PartyValue::Int(5));

        Self {
            state: LocalState {
                party: Some(party),
                ..LocalState::new(map)
            },
            side: side.max(1),
            step: 0,
        }
    }

    fn advance(&mut self) -> LocalState {
        let leg = (self.step / self.side) % 4;
        let (dx, dy, direction) = match leg {
            0 => (TILE_SIZE, 0.0, Direction::Right),
            1 => (0.0, TILE_SIZE, Direction::Down),
            2 => (-TILE_SIZE, 0.0, Direction::Left),
            _ => (0.0, -TILE_SIZE, Direction::Up),
        };

        self.state.x += dx;
        self.state.y += dy;
        self.state.direction = direction;
        self.step = self.step.wrapping_add(1);

        self.state.clone()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting presence bot...");
    info!("Connecting to: {}", args.server);
    info!("Walking a {}-tile loop on {}", args.loop_tiles, args.map);

    let mut client = PresenceClient::new(&args.server).await?;
    let mut walker = Walker::new(args.map, args.loop_tiles, &args.leader);

    tokio::select! {
        result = client.run(Duration::from_millis(args.heartbeat_ms), || walker.advance()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, leaving...");
        }
    }

    client.disconnect().await?;

    Ok(())
}
