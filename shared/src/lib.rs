//! Wire protocol shared by the arena server and its clients.
//!
//! Two channels carry game traffic:
//! - the unreliable channel (UDP) moves fixed 24-byte [`Datagram`]s with
//!   craft and projectile positions;
//! - the reliable channel (TCP) carries registration, the obstacle list,
//!   [`Command`]s from clients and removal notices from the server.
//!
//! Every integer on the wire is a 4-byte big-endian signed value. Frames are
//! encoded with bincode using fixed-width big-endian integers, so a frame is
//! exactly the concatenation of its fields.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;

pub const DATAGRAM_LEN: usize = 24;
pub const REGISTRATION_LEN: usize = 8;
pub const FIRE_BODY_LEN: usize = 16;
pub const EXIT_BODY_LEN: usize = 12;
pub const REMOVAL_LEN: usize = 12;

pub const JOIN: i32 = 0;
pub const UPDATE: i32 = 1;
pub const PROJECTILE: i32 = 2;

pub const FIRE: i32 = 3;
pub const EXIT: i32 = 4;

pub const KIND_CRAFT: i32 = 0;
pub const KIND_PROJECTILE: i32 = 1;

/// Terminates the obstacle list sent during registration. Obstacle
/// coordinates are never negative.
pub const END_OF_OBSTACLES: i32 = -1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame has {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },

    #[error("unknown message type {0}")]
    UnknownMessageType(i32),

    #[error("unknown command code {0}")]
    UnknownCommand(i32),

    #[error("unknown object kind {0}")]
    UnknownObjectKind(i32),

    #[error("port {0} is out of range")]
    InvalidPort(i32),

    #[error("encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
}

fn wire() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(wire().serialize(frame)?)
}

fn decode_exact<T: DeserializeOwned>(bytes: &[u8], expected: usize) -> Result<T, ProtocolError> {
    if bytes.len() != expected {
        return Err(ProtocolError::WrongLength {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(wire().deserialize(bytes)?)
}

fn port_from_wire(port: i32) -> Result<u16, ProtocolError> {
    u16::try_from(port).map_err(|_| ProtocolError::InvalidPort(port))
}

/// Identifies a player: the address and port of its unreliable-channel socket.
/// A player's craft and projectile are both keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(SocketAddrV4);

impl ClientId {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self(SocketAddrV4::new(address, port))
    }

    pub fn from_wire(octets: [u8; 4], port: i32) -> Result<Self, ProtocolError> {
        Ok(Self::new(Ipv4Addr::from(octets), port_from_wire(port)?))
    }

    pub fn address(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Where unreliable-channel traffic for this player is sent.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.0)
    }

    fn octets(&self) -> [u8; 4] {
        self.0.ip().octets()
    }
}

impl From<SocketAddrV4> for ClientId {
    fn from(addr: SocketAddrV4) -> Self {
        Self(addr)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Join,
    Update,
    /// Client to server: request an extra projectile step.
    /// Server to client: position of a projectile in flight.
    Projectile,
}

impl MessageType {
    pub fn code(self) -> i32 {
        match self {
            MessageType::Join => JOIN,
            MessageType::Update => UPDATE,
            MessageType::Projectile => PROJECTILE,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, ProtocolError> {
        match code {
            JOIN => Ok(MessageType::Join),
            UPDATE => Ok(MessageType::Update),
            PROJECTILE => Ok(MessageType::Projectile),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Craft,
    Projectile,
}

impl ObjectKind {
    pub fn code(self) -> i32 {
        match self {
            ObjectKind::Craft => KIND_CRAFT,
            ObjectKind::Projectile => KIND_PROJECTILE,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, ProtocolError> {
        match code {
            KIND_CRAFT => Ok(ObjectKind::Craft),
            KIND_PROJECTILE => Ok(ObjectKind::Projectile),
            other => Err(ProtocolError::UnknownObjectKind(other)),
        }
    }
}

/// Something the server can destroy. Craft and projectiles live in separate
/// collections, so the same [`ClientId`] may name one of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Entity {
    Craft(ClientId),
    Projectile(ClientId),
}

impl Entity {
    pub fn new(id: ClientId, kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Craft => Entity::Craft(id),
            ObjectKind::Projectile => Entity::Projectile(id),
        }
    }

    pub fn id(&self) -> ClientId {
        match self {
            Entity::Craft(id) | Entity::Projectile(id) => *id,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Entity::Craft(_) => ObjectKind::Craft,
            Entity::Projectile(_) => ObjectKind::Projectile,
        }
    }

    /// Removal notice sent to every session: address, port, object kind.
    pub fn encode_removal(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(&EntityWire::from(*self))
    }

    pub fn decode_removal(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_exact::<EntityWire>(bytes, REMOVAL_LEN)?.try_into()
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Craft(id) => write!(f, "craft {}", id),
            Entity::Projectile(id) => write!(f, "projectile {}", id),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct EntityWire {
    address: [u8; 4],
    port: i32,
    kind: i32,
}

impl From<Entity> for EntityWire {
    fn from(entity: Entity) -> Self {
        let id = entity.id();
        Self {
            address: id.octets(),
            port: i32::from(id.port()),
            kind: entity.kind().code(),
        }
    }
}

impl TryFrom<EntityWire> for Entity {
    type Error = ProtocolError;

    fn try_from(wire: EntityWire) -> Result<Self, Self::Error> {
        let id = ClientId::from_wire(wire.address, wire.port)?;
        Ok(Entity::new(id, ObjectKind::from_code(wire.kind)?))
    }
}

#[derive(Serialize, Deserialize)]
struct DatagramWire {
    address: [u8; 4],
    port: i32,
    message_type: i32,
    x: i32,
    y: i32,
    heading: i32,
}

/// A position message on the unreliable channel.
///
/// `id` carries the declared address and port. The server keys craft by the
/// datagram's source address together with the declared port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
    pub id: ClientId,
    pub message_type: MessageType,
    pub x: i32,
    pub y: i32,
    pub heading: i32,
}

impl Datagram {
    pub fn new(id: ClientId, message_type: MessageType, x: i32, y: i32, heading: i32) -> Self {
        Self {
            id,
            message_type,
            x,
            y,
            heading,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(&DatagramWire {
            address: self.id.octets(),
            port: i32::from(self.id.port()),
            message_type: self.message_type.code(),
            x: self.x,
            y: self.y,
            heading: self.heading,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire: DatagramWire = decode_exact(bytes, DATAGRAM_LEN)?;
        Ok(Self {
            id: ClientId::from_wire(wire.address, wire.port)?,
            message_type: MessageType::from_code(wire.message_type)?,
            x: wire.x,
            y: wire.y,
            heading: wire.heading,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct RegistrationWire {
    address: [u8; 4],
    port: i32,
}

/// First frame on a reliable connection: the client's unreliable-channel endpoint.
pub fn encode_registration(id: ClientId) -> Result<Vec<u8>, ProtocolError> {
    encode(&RegistrationWire {
        address: id.octets(),
        port: i32::from(id.port()),
    })
}

pub fn decode_registration(bytes: &[u8]) -> Result<ClientId, ProtocolError> {
    let wire: RegistrationWire = decode_exact(bytes, REGISTRATION_LEN)?;
    ClientId::from_wire(wire.address, wire.port)
}

/// Encodes obstacle coordinates as (x, y) pairs followed by [`END_OF_OBSTACLES`].
pub fn encode_obstacle_list<I>(points: I) -> Result<Vec<u8>, ProtocolError>
where
    I: IntoIterator<Item = (i32, i32)>,
{
    let mut values: Vec<i32> = Vec::new();
    for (x, y) in points {
        values.push(x);
        values.push(y);
    }
    values.push(END_OF_OBSTACLES);

    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend(encode(&value)?);
    }
    Ok(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FireCommand {
    pub port: u16,
    pub x: i32,
    pub y: i32,
    pub heading: i32,
}

#[derive(Serialize, Deserialize)]
struct FireWire {
    port: i32,
    x: i32,
    y: i32,
    heading: i32,
}

/// Client to server messages on the reliable channel, after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Fire(FireCommand),
    /// Removes the named entity. Exiting with a craft ends the session.
    Exit(Entity),
}

impl Command {
    pub fn code(&self) -> i32 {
        match self {
            Command::Fire(_) => FIRE,
            Command::Exit(_) => EXIT,
        }
    }

    /// Number of bytes that follow the 4-byte command code.
    pub fn body_len(code: i32) -> Result<usize, ProtocolError> {
        match code {
            FIRE => Ok(FIRE_BODY_LEN),
            EXIT => Ok(EXIT_BODY_LEN),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    pub fn decode(code: i32, body: &[u8]) -> Result<Self, ProtocolError> {
        match code {
            FIRE => {
                let wire: FireWire = decode_exact(body, FIRE_BODY_LEN)?;
                Ok(Command::Fire(FireCommand {
                    port: port_from_wire(wire.port)?,
                    x: wire.x,
                    y: wire.y,
                    heading: wire.heading,
                }))
            }
            EXIT => {
                let wire: EntityWire = decode_exact(body, EXIT_BODY_LEN)?;
                Ok(Command::Exit(wire.try_into()?))
            }
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    /// Full frame: code followed by body.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = encode(&self.code())?;
        match self {
            Command::Fire(fire) => bytes.extend(encode(&FireWire {
                port: i32::from(fire.port),
                x: fire.x,
                y: fire.y,
                heading: fire.heading,
            })?),
            Command::Exit(entity) => bytes.extend(encode(&EntityWire::from(*entity))?),
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(a: u8, port: u16) -> ClientId {
        ClientId::new(Ipv4Addr::new(10, 0, 0, a), port)
    }

    #[test]
    fn test_datagram_layout_is_big_endian() {
        let datagram = Datagram::new(id(7, 0x1234), MessageType::Update, 1, -1, 270);
        let bytes = datagram.encode().unwrap();

        assert_eq!(bytes.len(), DATAGRAM_LEN);
        assert_eq!(&bytes[0..4], &[10, 0, 0, 7]);
        assert_eq!(&bytes[4..8], &[0, 0, 0x12, 0x34]);
        assert_eq!(&bytes[8..12], &UPDATE.to_be_bytes());
        assert_eq!(&bytes[12..16], &[0, 0, 0, 1]);
        assert_eq!(&bytes[16..20], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(&bytes[20..24], &270i32.to_be_bytes());
    }

    #[test]
    fn test_datagram_roundtrip_keeps_craft_update() {
        let sent = Datagram::new(id(3, 40123), MessageType::Update, 512, 77, 135);
        let received = Datagram::decode(&sent.encode().unwrap()).unwrap();

        assert_eq!(received.id, sent.id);
        assert_eq!((received.x, received.y, received.heading), (512, 77, 135));
        assert_eq!(received.message_type, MessageType::Update);
    }

    #[test]
    fn test_truncated_datagram_rejected() {
        let bytes = Datagram::new(id(1, 1), MessageType::Join, 0, 0, 0)
            .encode()
            .unwrap();

        match Datagram::decode(&bytes[..20]) {
            Err(ProtocolError::WrongLength { expected, actual }) => {
                assert_eq!(expected, DATAGRAM_LEN);
                assert_eq!(actual, 20);
            }
            other => panic!("expected length error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let mut bytes = Datagram::new(id(1, 1), MessageType::Join, 0, 0, 0)
            .encode()
            .unwrap();
        bytes[8..12].copy_from_slice(&99i32.to_be_bytes());

        assert!(matches!(
            Datagram::decode(&bytes),
            Err(ProtocolError::UnknownMessageType(99))
        ));
    }

    #[test]
    fn test_out_of_range_port_rejected() {
        let mut bytes = Datagram::new(id(1, 1), MessageType::Join, 0, 0, 0)
            .encode()
            .unwrap();
        bytes[4..8].copy_from_slice(&70000i32.to_be_bytes());

        assert!(matches!(
            Datagram::decode(&bytes),
            Err(ProtocolError::InvalidPort(70000))
        ));
    }

    #[test]
    fn test_obstacle_list_ends_with_sentinel() {
        let bytes = encode_obstacle_list(vec![(5, 6), (700, 800)]).unwrap();

        assert_eq!(bytes.len(), 4 * 5);
        let values: Vec<i32> = bytes
            .chunks(4)
            .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, vec![5, 6, 700, 800, END_OF_OBSTACLES]);
    }

    #[test]
    fn test_empty_obstacle_list_is_only_sentinel() {
        let bytes = encode_obstacle_list(Vec::new()).unwrap();
        assert_eq!(bytes, END_OF_OBSTACLES.to_be_bytes().to_vec());
    }

    #[test]
    fn test_registration_frame() {
        let client = id(9, 5000);
        let bytes = encode_registration(client).unwrap();

        assert_eq!(bytes.len(), REGISTRATION_LEN);
        assert_eq!(decode_registration(&bytes).unwrap(), client);
    }

    #[test]
    fn test_fire_command_frame() {
        let command = Command::Fire(FireCommand {
            port: 6000,
            x: 10,
            y: 20,
            heading: 90,
        });
        let bytes = command.encode().unwrap();

        assert_eq!(bytes.len(), 4 + FIRE_BODY_LEN);
        assert_eq!(&bytes[0..4], &FIRE.to_be_bytes());
        assert_eq!(Command::body_len(FIRE).unwrap(), FIRE_BODY_LEN);
        assert_eq!(Command::decode(FIRE, &bytes[4..]).unwrap(), command);
    }

    #[test]
    fn test_exit_command_names_entity() {
        let command = Command::Exit(Entity::Projectile(id(2, 7000)));
        let bytes = command.encode().unwrap();

        assert_eq!(bytes.len(), 4 + EXIT_BODY_LEN);
        assert_eq!(&bytes[12..16], &KIND_PROJECTILE.to_be_bytes());
        assert_eq!(Command::decode(EXIT, &bytes[4..]).unwrap(), command);
    }

    #[test]
    fn test_unknown_command_code() {
        assert!(matches!(
            Command::body_len(42),
            Err(ProtocolError::UnknownCommand(42))
        ));
    }

    #[test]
    fn test_removal_notice_layout() {
        let bytes = Entity::Craft(id(4, 8080)).encode_removal().unwrap();

        assert_eq!(bytes.len(), REMOVAL_LEN);
        assert_eq!(&bytes[0..4], &[10, 0, 0, 4]);
        assert_eq!(&bytes[4..8], &8080i32.to_be_bytes());
        assert_eq!(&bytes[8..12], &KIND_CRAFT.to_be_bytes());
        assert_eq!(
            Entity::decode_removal(&bytes).unwrap(),
            Entity::Craft(id(4, 8080))
        );
    }

    #[test]
    fn test_unknown_object_kind_rejected() {
        let mut bytes = Entity::Craft(id(4, 8080)).encode_removal().unwrap();
        bytes[8..12].copy_from_slice(&5i32.to_be_bytes());

        assert!(matches!(
            Entity::decode_removal(&bytes),
            Err(ProtocolError::UnknownObjectKind(5))
        ));
    }
}
