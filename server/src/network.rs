//! Server assembly: binds both channels, places the obstacles and runs the
//! datagram ingest, the projectile scheduler and the session accept loop
//! until shutdown.

use crate::broadcast::{DatagramFanout, SessionFanout};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::ingest::IngestService;
use crate::registry::{EndpointRegistry, SessionRegistry, SharedEndpoints, SharedSessions};
use crate::scheduler::{ProjectileScheduler, ProjectileTicker};
use crate::session::{spawn_session, SessionContext};
use crate::shutdown::{wait_for_shutdown, Shutdown};
use crate::world::{SharedWorld, World};
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};

/// Main server owning both channels and the shared state
pub struct Server {
    config: ServerConfig,
    socket: Arc<UdpSocket>,
    listener: TcpListener,
    world: SharedWorld,
    endpoints: SharedEndpoints,
    sessions: SharedSessions,
    shutdown: Shutdown,
}

impl Server {
    /// Binds the datagram socket on the configured port and the listener on
    /// the same port. Either failing is fatal.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let udp_addr = config.bind_addr();
        let socket = UdpSocket::bind(&udp_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: udp_addr.clone(),
                source,
            })?;

        let port = socket.local_addr()?.port();
        let tcp_addr = format!("{}:{}", config.host, port);
        let listener = TcpListener::bind(&tcp_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: tcp_addr.clone(),
                source,
            })?;
        info!("Server listening on {} (udp) and {} (tcp)", udp_addr, tcp_addr);

        let mut world = World::new(config.world());
        place_obstacles(&mut world, config.obstacle_count, config.obstacle_seed);
        info!("Placed {} obstacles", world.obstacles().len());

        Ok(Server {
            config,
            socket: Arc::new(socket),
            listener,
            world: world.into_shared(),
            endpoints: EndpointRegistry::new().into_shared(),
            sessions: SessionRegistry::new().into_shared(),
            shutdown: Shutdown::new(),
        })
    }

    pub fn udp_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn world(&self) -> SharedWorld {
        Arc::clone(&self.world)
    }

    pub fn endpoints(&self) -> SharedEndpoints {
        Arc::clone(&self.endpoints)
    }

    pub fn sessions(&self) -> SharedSessions {
        Arc::clone(&self.sessions)
    }

    /// Handle that stops [`Server::run`] when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Runs until the shutdown handle fires, then waits for the ingest and
    /// scheduler tasks to finish.
    pub async fn run(self) -> Result<()> {
        let Server {
            config,
            socket,
            listener,
            world,
            endpoints,
            sessions,
            shutdown,
        } = self;

        // Projectile broadcasts go out on their own socket.
        let tick_addr = format!("{}:0", config.host);
        let tick_socket = UdpSocket::bind(&tick_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: tick_addr,
                source,
            })?;

        let session_fanout = SessionFanout::new(Arc::clone(&sessions));
        let ticker = Arc::new(ProjectileTicker::new(
            Arc::clone(&world),
            session_fanout.clone(),
            DatagramFanout::new(Arc::new(tick_socket), Arc::clone(&endpoints)),
        ));

        let scheduler = ProjectileScheduler::new(Arc::clone(&ticker), config.tick_interval);
        let scheduler_handle = tokio::spawn(scheduler.run(shutdown.subscribe()));

        let ingest = IngestService::new(
            Arc::clone(&socket),
            Arc::clone(&world),
            DatagramFanout::new(socket, Arc::clone(&endpoints)),
            session_fanout.clone(),
            Arc::clone(&ticker),
            config.bonus_ticks,
        );
        let ingest_handle = tokio::spawn(ingest.run(shutdown.subscribe()));

        let context = SessionContext {
            world,
            endpoints,
            sessions: Arc::clone(&sessions),
            fanout: session_fanout,
            ticker,
            bonus_ticks: config.bonus_ticks,
        };

        info!("Server started successfully");

        let mut stop = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let serial = sessions.write().await.next_serial();
                        info!("Accepted session {} from {}", serial, peer);
                        spawn_session(stream, peer, serial, context.clone(), shutdown.subscribe());
                    }
                    Err(e) => {
                        warn!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }

        info!("Server shutting down");
        drop(listener);

        for (name, handle) in [("scheduler", scheduler_handle), ("ingest", ingest_handle)] {
            if let Err(e) = handle.await {
                error!("{} task failed: {}", name, e);
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Adds `count` obstacles at uniformly random points inside the sector.
pub fn place_obstacles(world: &mut World, count: usize, seed: Option<u64>) {
    let (width, height) = (world.config().width, world.config().height);
    if width <= 0 || height <= 0 {
        warn!("Sector {}x{} has no room for obstacles", width, height);
        return;
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    for _ in 0..count {
        let x = rng.gen_range(0..width);
        let y = rng.gen_range(0..height);
        world.add_obstacle(x, y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::WorldConfig;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            obstacle_count: 4,
            obstacle_seed: Some(7),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_obstacles_in_bounds() {
        let mut world = World::new(WorldConfig {
            width: 50,
            height: 30,
            ..WorldConfig::default()
        });
        place_obstacles(&mut world, 100, None);

        assert_eq!(world.obstacles().len(), 100);
        for obstacle in world.obstacles() {
            assert!((0..50).contains(&obstacle.x));
            assert!((0..30).contains(&obstacle.y));
        }
    }

    #[test]
    fn test_seeded_placement_is_repeatable() {
        let mut first = World::new(WorldConfig::default());
        let mut second = World::new(WorldConfig::default());
        place_obstacles(&mut first, 10, Some(42));
        place_obstacles(&mut second, 10, Some(42));

        assert_eq!(first.obstacles(), second.obstacles());
    }

    #[test]
    fn test_empty_sector_gets_no_obstacles() {
        let mut world = World::new(WorldConfig {
            width: 0,
            ..WorldConfig::default()
        });
        place_obstacles(&mut world, 5, Some(1));

        assert!(world.obstacles().is_empty());
    }

    #[tokio::test]
    async fn test_both_channels_share_a_port() {
        let server = Server::bind(test_config()).await.unwrap();

        assert_eq!(
            server.udp_addr().unwrap().port(),
            server.tcp_addr().unwrap().port()
        );
        assert_eq!(server.world().read().await.obstacles().len(), 4);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            port: taken.local_addr().unwrap().port(),
            ..test_config()
        };

        match Server::bind(config).await {
            Err(ServerError::Bind { .. }) => {}
            Err(other) => panic!("Unexpected error: {}", other),
            Ok(_) => panic!("Bind should fail on a taken port"),
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = Server::bind(test_config()).await.unwrap();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("server should stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
