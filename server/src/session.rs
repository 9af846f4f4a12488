//! One reliable connection per client.
//!
//! A session moves through `Connecting -> Registered -> Active -> Closed`:
//! it reads the client's unreliable-channel endpoint, registers it and sends
//! the obstacle list, then serves FIRE and EXIT commands until the client
//! leaves, the connection fails or the server shuts down. Outbound frames go
//! through a writer task so removal notices from other tasks never interleave
//! with a frame in progress.

use crate::broadcast::SessionFanout;
use crate::error::{Result, ServerError};
use crate::registry::{
    SessionHandle, SharedEndpoints, SharedSessions, SESSION_QUEUE_CAPACITY,
};
use crate::scheduler::ProjectileTicker;
use crate::shutdown::wait_for_shutdown;
use crate::world::{Projectile, SharedWorld};
use log::{debug, info, warn};
use shared::{
    decode_registration, encode_obstacle_list, ClientId, Command, Entity, FireCommand,
    REGISTRATION_LEN,
};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    Active,
    Closed,
}

/// Shared state every session works against.
#[derive(Clone)]
pub struct SessionContext {
    pub world: SharedWorld,
    pub endpoints: SharedEndpoints,
    pub sessions: SharedSessions,
    pub fanout: SessionFanout,
    pub ticker: Arc<ProjectileTicker>,
    pub bonus_ticks: bool,
}

pub async fn read_registration<R>(reader: &mut R) -> Result<ClientId>
where
    R: AsyncRead + Unpin,
{
    let mut frame = [0u8; REGISTRATION_LEN];
    reader.read_exact(&mut frame).await?;
    Ok(decode_registration(&frame)?)
}

pub async fn read_command<R>(reader: &mut R) -> Result<Command>
where
    R: AsyncRead + Unpin,
{
    let code = reader.read_i32().await?;
    let mut body = vec![0u8; Command::body_len(code)?];
    reader.read_exact(&mut body).await?;
    Ok(Command::decode(code, &body)?)
}

/// Writes queued frames in order until every sender is gone or the peer
/// stops accepting data, then shuts the write side down.
pub async fn write_frames<W>(mut writer: W, mut outbound: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Stopped writing to session: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Splits an accepted connection and runs its session to completion.
pub fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    serial: u64,
    context: SessionContext,
    shutdown: watch::Receiver<bool>,
) {
    let (reader, writer) = stream.into_split();
    let (outbound, frames) = mpsc::channel(SESSION_QUEUE_CAPACITY);
    tokio::spawn(write_frames(writer, frames));

    let session = ReliableSession::new(serial, peer, reader, outbound, context);
    tokio::spawn(session.run(shutdown));
}

pub struct ReliableSession<R> {
    serial: u64,
    peer: SocketAddr,
    reader: R,
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    state: SessionState,
    client: Option<ClientId>,
    context: SessionContext,
}

impl<R> ReliableSession<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        serial: u64,
        peer: SocketAddr,
        reader: R,
        outbound: mpsc::Sender<Vec<u8>>,
        context: SessionContext,
    ) -> Self {
        Self {
            serial,
            peer,
            reader,
            outbound: Some(outbound),
            state: SessionState::Connecting,
            client: None,
            context,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client(&self) -> Option<ClientId> {
        self.client
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SessionState {
        let registration = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                self.close().await;
                return self.state;
            }
            registration = read_registration(&mut self.reader) => registration,
        };

        let registered = match registration {
            Ok(client) => self.register(client).await,
            Err(e) => Err(e),
        };
        if let Err(e) = registered {
            warn!("Session {} from {} failed to register: {}", self.serial, self.peer, e);
            self.close().await;
            return self.state;
        }
        self.activate().await;

        while self.state == SessionState::Active {
            let command = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                command = read_command(&mut self.reader) => command,
            };

            match command {
                Ok(command) => self.handle_command(command).await,
                Err(ServerError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    info!("Session {} from {} disconnected", self.serial, self.peer);
                    break;
                }
                Err(e) => {
                    warn!("Session {} from {} failed: {}", self.serial, self.peer, e);
                    break;
                }
            }
        }

        self.close().await;
        self.state
    }

    /// Registers the client's endpoint and queues the obstacle list.
    async fn register(&mut self, client: ClientId) -> Result<()> {
        self.client = Some(client);
        self.context.endpoints.write().await.add(client);

        let points: Vec<(i32, i32)> = {
            let world = self.context.world.read().await;
            world.obstacles().iter().map(|o| (o.x, o.y)).collect()
        };
        debug!("Sending {} obstacles to {}", points.len(), client);
        self.queue(encode_obstacle_list(points)?);

        self.transition(SessionState::Registered);
        Ok(())
    }

    /// Makes the session visible to removal broadcasts.
    async fn activate(&mut self) {
        let (Some(client), Some(outbound)) = (self.client, self.outbound.clone()) else {
            return;
        };
        self.context
            .sessions
            .write()
            .await
            .add(SessionHandle::new(self.serial, client, outbound));
        self.transition(SessionState::Active);
    }

    pub async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Fire(fire) => self.fire(fire).await,
            Command::Exit(Entity::Craft(id)) => self.exit(id).await,
            Command::Exit(Entity::Projectile(id)) => {
                if self.context.world.write().await.remove_projectile(&id) {
                    debug!("Projectile {} withdrawn by its client", id);
                }
            }
        }
    }

    async fn fire(&mut self, fire: FireCommand) {
        let Some(client) = self.client else {
            return;
        };
        if fire.port != client.port() {
            debug!(
                "FIRE on session {} declares port {}, keying by {}",
                self.serial, fire.port, client
            );
        }

        let projectile = Projectile::new(client, fire.x, fire.y, fire.heading);
        self.context.world.write().await.upsert_projectile(projectile);

        if self.context.bonus_ticks {
            self.context.ticker.tick().await;
        }
    }

    /// Client leaving the game. The session's own client is removed and its
    /// craft removal is announced even when the craft was already gone.
    async fn exit(&mut self, id: ClientId) {
        if self.client != Some(id) {
            debug!(
                "EXIT on session {} names {}, removing the session's own client",
                self.serial, id
            );
        }
        info!("Client {} exiting on session {}", id, self.serial);
        self.shut_down(true).await;
    }

    /// Ends the session. Does nothing once the session is closed.
    ///
    /// A registered client that vanished without EXIT is cleaned up as if it
    /// had exited, so none of its entries outlive the connection.
    pub async fn close(&mut self) {
        self.shut_down(false).await;
    }

    async fn shut_down(&mut self, exiting: bool) {
        if self.state == SessionState::Closed {
            return;
        }

        if let Some(client) = self.client {
            if self.release_client(client).await {
                let (craft_removed, projectile_removed) = {
                    let mut world = self.context.world.write().await;
                    (world.remove_craft(&client), world.remove_projectile(&client))
                };
                self.context.endpoints.write().await.remove(&client);

                if craft_removed || exiting {
                    self.announce(Entity::Craft(client)).await;
                }
                if projectile_removed {
                    self.announce(Entity::Projectile(client)).await;
                }
            } else {
                info!(
                    "Session {} no longer owns {}, leaving its entries in place",
                    self.serial, client
                );
            }
        }

        self.release_connection();
        self.transition(SessionState::Closed);
    }

    /// Gives up the session's claim on `client`. Returns false when a newer
    /// session registered the same client, which then owns its craft,
    /// projectile and endpoint.
    async fn release_client(&self, client: ClientId) -> bool {
        let mut sessions = self.context.sessions.write().await;
        match self.state {
            SessionState::Active => sessions.remove(&client, self.serial),
            _ => sessions.get(&client).is_none(),
        }
    }

    async fn announce(&self, entity: Entity) {
        self.context.fanout.announce_removals([&entity]).await;
    }

    fn queue(&self, frame: Vec<u8>) {
        let queued = self
            .outbound
            .as_ref()
            .map_or(false, |outbound| outbound.try_send(frame).is_ok());
        if !queued {
            debug!("Session {} writer is unavailable, frame dropped", self.serial);
        }
    }

    /// Dropping our sender lets the writer drain and shut the connection.
    fn release_connection(&mut self) {
        self.outbound = None;
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            "Session {} from {}: {:?} -> {:?}",
            self.serial, self.peer, self.state, next
        );
        self.state = next;
        if next == SessionState::Closed {
            info!("Session {} from {} closed", self.serial, self.peer);
        }
    }
}
