use clap::Parser;
use log::{error, info};
use server::network::{Server, ServerConfig, ServerMessage};
use shared::{PathPlanningContext, WalkabilityGrid};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "32")]
    max_clients: usize,

    /// Walkability map, one row per line, '#' for blocked tiles
    #[arg(long)]
    map: Option<PathBuf>,

    /// Tile size in pixels
    #[arg(long, default_value = "16")]
    tile_size: u32,

    /// Average entity size in tiles
    #[arg(long, default_value = "1")]
    footprint: u32,

    /// Number of wandering NPCs
    #[arg(short, long, default_value = "4")]
    npcs: usize,

    /// Seed for NPC placement and wandering
    #[arg(long, default_value = "0")]
    seed: u64,
}

fn load_grid(map: Option<&PathBuf>) -> Result<WalkabilityGrid, Box<dyn std::error::Error>> {
    match map {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            let rows: Vec<&str> = text.lines().filter(|line| !line.is_empty()).collect();
            Ok(WalkabilityGrid::from_rows(&rows)?)
        }
        None => Ok(WalkabilityGrid::bordered(64, 48)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let grid = load_grid(args.map.as_ref())?;
    info!(
        "Map {}x{} tiles, {}px per tile",
        grid.width(),
        grid.height(),
        args.tile_size
    );
    let context = PathPlanningContext::new(grid, args.tile_size, args.footprint)?;

    let config = ServerConfig {
        tick_duration: Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64),
        max_clients: args.max_clients,
        npc_count: args.npcs,
        seed: args.seed,
        ..ServerConfig::default()
    };

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, context, config).await?;

    let control = server.control_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            if control.send(ServerMessage::Shutdown).is_err() {
                error!("Server loop already stopped");
            }
        }
    });

    server.run().await?;

    // Let the sender flush the shutdown notice
    tokio::time::sleep(Duration::from_millis(100)).await;

    Ok(())
}
