//! Receive loop for the unreliable channel.
//!
//! Datagrams are handled strictly one at a time out of a single buffer:
//! JOIN stores the craft and forwards the datagram to everyone else, UPDATE
//! is collision-checked and either forwarded or turned into removal notices,
//! and a projectile datagram requests one extra projectile step.

use crate::broadcast::{DatagramFanout, SessionFanout};
use crate::scheduler::ProjectileTicker;
use crate::shutdown::wait_for_shutdown;
use crate::world::{Craft, SharedWorld};
use log::{debug, info, warn};
use shared::{ClientId, Datagram, Entity, MessageType, DATAGRAM_LEN};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Result of handling one well-formed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Joined { forwarded: usize },
    Moved { forwarded: usize },
    /// The update collided; nothing was committed or forwarded.
    Collided(BTreeSet<Entity>),
    TickRequested,
    /// Bonus steps are disabled.
    TickIgnored,
}

pub struct IngestService {
    socket: Arc<UdpSocket>,
    world: SharedWorld,
    forward: DatagramFanout,
    sessions: SessionFanout,
    ticker: Arc<ProjectileTicker>,
    bonus_ticks: bool,
}

impl IngestService {
    /// `socket` receives client datagrams and forwards them through `endpoints`.
    pub fn new(
        socket: Arc<UdpSocket>,
        world: SharedWorld,
        forward: DatagramFanout,
        sessions: SessionFanout,
        ticker: Arc<ProjectileTicker>,
        bonus_ticks: bool,
    ) -> Self {
        Self {
            socket,
            world,
            forward,
            sessions,
            ticker,
            bonus_ticks,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // Oversized so that long datagrams are seen as malformed instead of truncated.
        let mut buffer = [0u8; DATAGRAM_LEN * 2];

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, source)) => {
                        self.handle_raw(&buffer[..len], source).await;
                    }
                    Err(e) => {
                        warn!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }

        info!("Datagram ingest stopped");
    }

    /// Decodes and handles one datagram. Malformed input is logged and dropped.
    pub async fn handle_raw(&self, bytes: &[u8], source: SocketAddr) -> Option<IngestOutcome> {
        match Datagram::decode(bytes) {
            Ok(datagram) => Some(self.handle(&datagram, bytes, source).await),
            Err(e) => {
                warn!("Dropping malformed datagram from {}: {}", source, e);
                None
            }
        }
    }

    pub async fn handle(&self, datagram: &Datagram, raw: &[u8], source: SocketAddr) -> IngestOutcome {
        let id = sender_id(source, datagram);
        let craft = Craft::remote(id, datagram.x, datagram.y, datagram.heading);

        match datagram.message_type {
            MessageType::Join => {
                self.world.write().await.upsert_craft(craft);
                let forwarded = self.forward.send_to_all_except(raw, &id).await;
                debug!("Craft {} joined, forwarded to {}", id, forwarded);
                IngestOutcome::Joined { forwarded }
            }
            MessageType::Update => {
                let destroyed = self.world.write().await.apply_update(craft);
                if destroyed.is_empty() {
                    let forwarded = self.forward.send_to_all_except(raw, &id).await;
                    IngestOutcome::Moved { forwarded }
                } else {
                    info!("Update from {} collided, destroying {:?}", id, destroyed);
                    self.sessions.announce_removals(&destroyed).await;
                    IngestOutcome::Collided(destroyed)
                }
            }
            MessageType::Projectile => self.request_tick().await,
        }
    }

    /// Bonus projectile step requested by a client datagram. Runs regardless
    /// of the datagram's payload.
    pub async fn request_tick(&self) -> IngestOutcome {
        if !self.bonus_ticks {
            return IngestOutcome::TickIgnored;
        }
        self.ticker.tick().await;
        IngestOutcome::TickRequested
    }
}

/// Craft are keyed by the address the datagram came from and the port it declares.
fn sender_id(source: SocketAddr, datagram: &Datagram) -> ClientId {
    let address = match source.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(datagram.id.address()),
    };
    ClientId::new(address, datagram.id.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{EndpointRegistry, SessionHandle, SessionRegistry};
    use crate::world::{Projectile, World, WorldConfig};
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Fixture {
        ingest: IngestService,
        world: SharedWorld,
        peer: UdpSocket,
        peer_id: ClientId,
        removals: mpsc::Receiver<Vec<u8>>,
    }

    async fn fixture(bonus_ticks: bool) -> Fixture {
        let world = World::new(WorldConfig::default()).into_shared();
        let endpoints = EndpointRegistry::new().into_shared();
        let sessions = SessionRegistry::new().into_shared();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_id = ClientId::new(Ipv4Addr::LOCALHOST, peer.local_addr().unwrap().port());
        endpoints.write().await.add(peer_id);

        let (tx, removals) = mpsc::channel(16);
        sessions
            .write()
            .await
            .add(SessionHandle::new(1, peer_id, tx));

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let ticker = Arc::new(ProjectileTicker::new(
            Arc::clone(&world),
            SessionFanout::new(Arc::clone(&sessions)),
            DatagramFanout::new(
                Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
                Arc::clone(&endpoints),
            ),
        ));
        let ingest = IngestService::new(
            Arc::clone(&socket),
            Arc::clone(&world),
            DatagramFanout::new(socket, endpoints),
            SessionFanout::new(sessions),
            ticker,
            bonus_ticks,
        );

        Fixture {
            ingest,
            world,
            peer,
            peer_id,
            removals,
        }
    }

    fn source(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    fn raw(port: u16, message_type: MessageType, x: i32, y: i32, heading: i32) -> Vec<u8> {
        Datagram::new(ClientId::new(Ipv4Addr::LOCALHOST, port), message_type, x, y, heading)
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_join_stores_craft_and_forwards() {
        let fixture = fixture(true).await;
        let bytes = raw(5000, MessageType::Join, 10, 10, 0);

        let outcome = fixture.ingest.handle_raw(&bytes, source(5000)).await;
        assert_eq!(outcome, Some(IngestOutcome::Joined { forwarded: 1 }));

        let joined = ClientId::new(Ipv4Addr::LOCALHOST, 5000);
        assert!(fixture.world.read().await.craft(&joined).is_some());

        let mut buffer = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(1), fixture.peer.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buffer[..len], &bytes[..]);
    }

    #[tokio::test]
    async fn test_update_is_not_echoed_to_sender() {
        let fixture = fixture(true).await;
        let port = fixture.peer_id.port();
        let bytes = raw(port, MessageType::Update, 300, 300, 90);

        let outcome = fixture.ingest.handle_raw(&bytes, source(port)).await;
        assert_eq!(outcome, Some(IngestOutcome::Moved { forwarded: 0 }));
    }

    #[tokio::test]
    async fn test_colliding_update_announces_removals() {
        let mut fixture = fixture(true).await;
        let a = ClientId::new(Ipv4Addr::LOCALHOST, 5000);
        let b = ClientId::new(Ipv4Addr::LOCALHOST, 5001);
        fixture
            .ingest
            .handle_raw(&raw(5000, MessageType::Join, 10, 10, 0), source(5000))
            .await;

        let outcome = fixture
            .ingest
            .handle_raw(&raw(5001, MessageType::Update, 10, 10, 180), source(5001))
            .await;

        let expected: BTreeSet<Entity> = [Entity::Craft(a), Entity::Craft(b)].into();
        assert_eq!(outcome, Some(IngestOutcome::Collided(expected.clone())));
        assert_eq!(fixture.world.read().await.craft_count(), 0);

        let mut announced = BTreeSet::new();
        while let Ok(frame) = fixture.removals.try_recv() {
            announced.insert(Entity::decode_removal(&frame).unwrap());
        }
        assert_eq!(announced, expected);
    }

    #[tokio::test]
    async fn test_projectile_datagram_steps_projectiles() {
        let fixture = fixture(true).await;
        let owner = ClientId::new(Ipv4Addr::LOCALHOST, 5000);
        fixture
            .world
            .write()
            .await
            .upsert_projectile(Projectile::new(owner, 100, 100, 0));

        let outcome = fixture
            .ingest
            .handle_raw(&raw(5000, MessageType::Projectile, 0, 0, 0), source(5000))
            .await;

        assert_eq!(outcome, Some(IngestOutcome::TickRequested));
        assert_eq!(fixture.world.read().await.projectile(&owner).unwrap().age, 1);
    }

    #[tokio::test]
    async fn test_tick_request_ignored_when_disabled() {
        let fixture = fixture(false).await;
        let owner = ClientId::new(Ipv4Addr::LOCALHOST, 5000);
        fixture
            .world
            .write()
            .await
            .upsert_projectile(Projectile::new(owner, 100, 100, 0));

        assert_eq!(fixture.ingest.request_tick().await, IngestOutcome::TickIgnored);
        assert_eq!(fixture.world.read().await.projectile(&owner).unwrap().age, 0);
    }

    #[tokio::test]
    async fn test_malformed_datagram_dropped() {
        let fixture = fixture(true).await;
        let bytes = raw(5000, MessageType::Join, 10, 10, 0);

        assert!(fixture
            .ingest
            .handle_raw(&bytes[..10], source(5000))
            .await
            .is_none());
        assert_eq!(fixture.world.read().await.craft_count(), 0);
    }
}
