//! Server settings. Defaults give a 1000x1000 sector with ten obstacles
//! and a 20Hz projectile tick.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::world::WorldConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address both channels bind to.
    pub host: String,
    /// Port shared by the UDP ingest socket and the TCP listener. Zero picks
    /// an ephemeral port for each.
    pub port: u16,
    pub world_width: i32,
    pub world_height: i32,
    pub obstacle_count: usize,
    /// Fixes obstacle placement when set.
    pub obstacle_seed: Option<u64>,
    /// Centre distance below which two entities overlap.
    pub collision_radius: f32,
    /// Distance a projectile travels per step.
    pub projectile_speed: f32,
    /// Steps a projectile survives.
    pub projectile_lifetime: u32,
    pub tick_interval: Duration,
    /// Whether FIRE commands and projectile datagrams each force an extra
    /// projectile step on top of the scheduled ones.
    pub bonus_ticks: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            world_width: 1000,
            world_height: 1000,
            obstacle_count: 10,
            obstacle_seed: None,
            collision_radius: 20.0,
            projectile_speed: 1.0,
            projectile_lifetime: 200,
            tick_interval: Duration::from_millis(50),
            bonus_ticks: true,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn world(&self) -> WorldConfig {
        WorldConfig {
            width: self.world_width,
            height: self.world_height,
            collision_radius: self.collision_radius,
            projectile_speed: self.projectile_speed,
            projectile_lifetime: self.projectile_lifetime,
        }
    }
}
