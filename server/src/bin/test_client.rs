//! Headless scripted client for poking at a running server.
//!
//! Registers over TCP, flies a craft around the sector over UDP, fires now
//! and then, and re-joins whenever its craft is destroyed. Gives up once the
//! server has been silent for too many receive windows in a row.

use clap::Parser;
use log::{debug, info, warn};
use rand::Rng;
use server::world::{World, WorldConfig};
use shared::{
    encode_registration, ClientId, Command, Datagram, Entity, FireCommand, MessageType,
    DATAGRAM_LEN, REMOVAL_LEN,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

const RECEIVE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: Ipv4Addr,

    /// Server port (both channels)
    #[clap(short, long, default_value = "5001")]
    port: u16,

    /// Sector width, must match the server
    #[clap(long, default_value = "1000")]
    width: i32,

    /// Sector height, must match the server
    #[clap(long, default_value = "1000")]
    height: i32,

    /// Distance moved per update
    #[clap(long, default_value = "5")]
    step: f32,

    /// Fire every this many updates
    #[clap(long, default_value = "20")]
    fire_every: u32,

    /// Stop after this many updates and exit cleanly
    #[clap(long)]
    updates: Option<u64>,

    /// Consecutive silent receive windows before the server is declared lost
    #[clap(long, default_value = "50")]
    max_timeouts: u32,
}

/// Where the local craft is and which way it points.
struct Pilot {
    x: f32,
    y: f32,
    heading: i32,
}

impl Pilot {
    fn spawn(world: &World) -> Self {
        let mut rng = rand::thread_rng();
        let config = world.config();
        loop {
            let x = rng.gen_range(0..config.width.max(1)) as f32;
            let y = rng.gen_range(0..config.height.max(1)) as f32;
            if world.is_clear(x, y) {
                return Pilot {
                    x,
                    y,
                    heading: rng.gen_range(0..4) * 90,
                };
            }
        }
    }

    /// Moves forward, turning instead when the way is blocked.
    fn advance(&mut self, world: &World, step: f32) {
        let radians = (self.heading as f32).to_radians();
        let x = self.x + step * radians.cos();
        let y = self.y + step * radians.sin();

        if world.is_clear(x, y) {
            self.x = x;
            self.y = y;
        } else {
            let turn = if rand::thread_rng().gen_bool(0.5) { 90 } else { 270 };
            self.heading = (self.heading + turn) % 360;
        }
    }

    fn datagram(&self, id: ClientId, message_type: MessageType) -> Datagram {
        Datagram::new(
            id,
            message_type,
            self.x.round() as i32,
            self.y.round() as i32,
            self.heading,
        )
    }
}

async fn read_obstacles(reader: &mut OwnedReadHalf, world: &mut World) -> std::io::Result<()> {
    loop {
        let x = reader.read_i32().await?;
        if x < 0 {
            return Ok(());
        }
        let y = reader.read_i32().await?;
        world.add_obstacle(x, y);
    }
}

/// Forwards removal notices until the server closes the connection.
async fn read_removals(mut reader: OwnedReadHalf, removals: mpsc::UnboundedSender<Entity>) {
    let mut frame = [0u8; REMOVAL_LEN];
    loop {
        if let Err(e) = reader.read_exact(&mut frame).await {
            debug!("Reliable channel closed: {}", e);
            return;
        }
        match Entity::decode_removal(&frame) {
            Ok(entity) => {
                if removals.send(entity).is_err() {
                    return;
                }
            }
            Err(e) => warn!("Bad removal notice: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let server_addr = SocketAddr::new(IpAddr::V4(args.host), args.port);
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(args.host), 0)).await?;
    let local = socket.local_addr()?;
    let address = match local.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
    };
    let id = ClientId::new(address, local.port());
    info!("Client {} connecting to {}", id, server_addr);

    let stream = TcpStream::connect(server_addr).await?;
    let (mut reader, mut writer) = stream.into_split();
    writer.write_all(&encode_registration(id)?).await?;

    let mut world = World::new(WorldConfig {
        width: args.width,
        height: args.height,
        ..WorldConfig::default()
    });
    read_obstacles(&mut reader, &mut world).await?;
    info!("Received {} obstacles", world.obstacles().len());

    let (removal_tx, mut removal_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_removals(reader, removal_tx));

    let mut pilot = Pilot::spawn(&world);
    socket
        .send_to(&pilot.datagram(id, MessageType::Join).encode()?, server_addr)
        .await?;

    let mut buffer = [0u8; DATAGRAM_LEN * 2];
    let mut timeouts = 0;
    let mut sent: u64 = 0;

    loop {
        if args.updates.map_or(false, |limit| sent >= limit) {
            break;
        }

        pilot.advance(&world, args.step);
        socket
            .send_to(&pilot.datagram(id, MessageType::Update).encode()?, server_addr)
            .await?;
        sent += 1;

        if args.fire_every > 0 && sent % args.fire_every as u64 == 0 {
            let fire = Command::Fire(FireCommand {
                port: id.port(),
                x: pilot.x.round() as i32,
                y: pilot.y.round() as i32,
                heading: pilot.heading,
            });
            writer.write_all(&fire.encode()?).await?;
        }

        while let Ok(entity) = removal_rx.try_recv() {
            if entity == Entity::Craft(id) {
                println!("Destroyed! Rejoining...");
                pilot = Pilot::spawn(&world);
                socket
                    .send_to(&pilot.datagram(id, MessageType::Join).encode()?, server_addr)
                    .await?;
            } else {
                debug!("Removed {}", entity);
            }
        }

        match timeout(RECEIVE_WINDOW, socket.recv_from(&mut buffer)).await {
            Ok(Ok((len, _))) => {
                timeouts = 0;
                if let Ok(datagram) = Datagram::decode(&buffer[..len]) {
                    debug!(
                        "{:?} from {} at ({}, {})",
                        datagram.message_type, datagram.id, datagram.x, datagram.y
                    );
                }
                // Drop whatever else queued up during the window.
                while socket.try_recv_from(&mut buffer).is_ok() {}
            }
            Ok(Err(e)) => warn!("Error receiving datagram: {}", e),
            Err(_) => {
                timeouts += 1;
                if timeouts >= args.max_timeouts {
                    println!("Game over! Sorry, the server has shutdown.");
                    return Ok(());
                }
            }
        }
    }

    writer
        .write_all(&Command::Exit(Entity::Craft(id)).encode()?)
        .await?;
    writer.shutdown().await?;
    println!("Test client finished after {} updates", sent);
    Ok(())
}
