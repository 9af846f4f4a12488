//! Projectile simulation driven at a fixed interval.
//!
//! [`ProjectileTicker::tick`] is the single entry point for a projectile
//! step: the scheduler calls it every interval, and FIRE commands and
//! projectile datagrams call it for their bonus steps. Every step announces
//! what it destroyed and broadcasts the projectiles still in flight.

use crate::broadcast::{DatagramFanout, SessionFanout};
use crate::shutdown::wait_for_shutdown;
use crate::world::{Projectile, SharedWorld};
use log::{debug, info, warn};
use shared::{Datagram, Entity, MessageType};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

const STATUS_EVERY: u64 = 100;

/// What one projectile step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub destroyed: BTreeSet<Entity>,
    pub in_flight: usize,
}

pub struct ProjectileTicker {
    world: SharedWorld,
    sessions: SessionFanout,
    datagrams: DatagramFanout,
    ticks: AtomicU64,
}

impl ProjectileTicker {
    /// `datagrams` should own a socket dedicated to projectile updates.
    pub fn new(world: SharedWorld, sessions: SessionFanout, datagrams: DatagramFanout) -> Self {
        Self {
            world,
            sessions,
            datagrams,
            ticks: AtomicU64::new(0),
        }
    }

    /// Steps every projectile, sends removal notices on the reliable channel
    /// and position datagrams on the unreliable channel.
    pub async fn tick(&self) -> TickReport {
        let (destroyed, in_flight) = {
            let mut world = self.world.write().await;
            let destroyed = world.step_projectiles();
            let in_flight: Vec<Projectile> = world.projectiles().copied().collect();
            (destroyed, in_flight)
        };

        self.sessions.announce_removals(&destroyed).await;

        for projectile in &in_flight {
            let (x, y) = projectile.position();
            let datagram = Datagram::new(
                projectile.owner,
                MessageType::Projectile,
                x,
                y,
                projectile.heading,
            );
            match datagram.encode() {
                Ok(bytes) => {
                    self.datagrams.send_to_all(&bytes).await;
                }
                Err(e) => warn!("Failed to encode projectile {}: {}", projectile.owner, e),
            }
        }

        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if tick % STATUS_EVERY == 0 {
            self.log_status(tick).await;
        }

        TickReport {
            destroyed,
            in_flight: in_flight.len(),
        }
    }

    /// Steps taken so far, scheduled and bonus alike.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    async fn log_status(&self, tick: u64) {
        let (crafts, projectiles) = {
            let world = self.world.read().await;
            (world.craft_count(), world.projectile_count())
        };
        debug!(
            "Tick {}: {} craft, {} projectiles, {} endpoints, {} sessions",
            tick,
            crafts,
            projectiles,
            self.datagrams.len().await,
            self.sessions.len().await
        );
    }
}

/// Runs [`ProjectileTicker::tick`] on a fixed interval until shutdown.
pub struct ProjectileScheduler {
    ticker: Arc<ProjectileTicker>,
    period: Duration,
}

impl ProjectileScheduler {
    pub fn new(ticker: Arc<ProjectileTicker>, period: Duration) -> Self {
        Self { ticker, period }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Projectile scheduler running every {:?}", self.period);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = timer.tick() => {
                    let report = self.ticker.tick().await;
                    if !report.destroyed.is_empty() {
                        debug!("Tick destroyed {} entities", report.destroyed.len());
                    }
                }
            }
        }

        info!(
            "Projectile scheduler stopped after {} ticks",
            self.ticker.ticks()
        );
    }
}
