use clap::Parser;
use client::input::{parse_waypoints, IntentMode, MoveIntentSource};
use client::network;
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Name announced to the server
    #[arg(short = 'n', long, default_value = "player")]
    name: String,

    /// Walk a loop of pixel waypoints, e.g. "40,40;400,40;400,300"
    #[arg(short = 'w', long, conflicts_with = "wander")]
    waypoints: Option<String>,

    /// Walk to random tiles of the map
    #[arg(long)]
    wander: bool,

    /// Simulation ticks per second
    #[arg(short = 't', long, default_value = "30")]
    tick_rate: u32,

    /// Seed for wandering
    #[arg(long, default_value = "0")]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mode = match (&args.waypoints, args.wander) {
        (Some(text), _) => IntentMode::Waypoints(parse_waypoints(text)?),
        (None, true) => IntentMode::Wander,
        (None, false) => IntentMode::Idle,
    };

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }
    info!("Movement: {:?}", mode);

    let tick_duration = Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64);
    let intents = MoveIntentSource::new(mode, args.seed);

    let mut client = network::Client::new(
        &args.server,
        &args.name,
        args.fake_ping,
        intents,
        tick_duration,
    )
    .await?;

    client.run().await?;

    Ok(())
}
