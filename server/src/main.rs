use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::error::Result;
use server::network::Server;
use std::time::Duration;

/// Authoritative space arena server
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to bind both channels to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port shared by the UDP and TCP channels
    #[clap(short, long, default_value = "5001")]
    port: u16,

    /// Sector width
    #[clap(long, default_value = "1000")]
    width: i32,

    /// Sector height
    #[clap(long, default_value = "1000")]
    height: i32,

    /// Number of obstacles placed at startup
    #[clap(short, long, default_value = "10")]
    obstacles: usize,

    /// Seed for obstacle placement
    #[clap(long)]
    seed: Option<u64>,

    /// Projectile tick rate (steps per second)
    #[clap(short, long, default_value = "20")]
    tick_rate: u32,

    /// Steps a projectile survives
    #[clap(long, default_value = "200")]
    lifetime: u32,

    /// Disable the extra projectile step on FIRE and tick requests
    #[clap(long)]
    no_bonus_ticks: bool,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            world_width: self.width,
            world_height: self.height,
            obstacle_count: self.obstacles,
            obstacle_seed: self.seed,
            projectile_lifetime: self.lifetime,
            tick_interval: Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64),
            bonus_ticks: !self.no_bonus_ticks,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    let server = Server::bind(config).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                shutdown.trigger();
            }
            Err(e) => error!("Unable to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await
}
