//! Scene streaming core: packet framing, collation, client connections, and the fan-out server.

pub mod collation;
pub mod connection;
pub mod crc;
pub mod framing;
pub mod messages;
pub mod monitor;
pub mod packet;
pub mod platform;
pub mod resources;
pub mod server;
pub mod shape;
pub mod stats;

pub use collation::{
    CollatedPacketDecoder, CollatedPacketEncoder, CollatingConnection, CollationError,
};
pub use connection::{Connection, ConnectionError, ConnectionOptions, TcpConnection};
pub use framing::{FrameEvent, PacketReader, PacketStream};
pub use messages::{CoordinateFrame, ServerInfoMessage, ShapeKind, WireMessage};
pub use monitor::{ConnectionMonitor, MonitorError, MonitorMode};
pub use packet::{PacketBuffer, PacketError, PacketHeader, PayloadReader};
pub use server::{FanOut, ServerSettings, TcpServer};
pub use shape::{MeshSet, Resource, Shape, ShapeError, SimpleMesh, SimpleShape, TransferProgress};
pub use stats::StatsSnapshot;
