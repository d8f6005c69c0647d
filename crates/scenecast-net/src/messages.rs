//! Fixed-layout message payloads and well-known ids.
//!
//! Each message type implements [`WireMessage`], writing its fields into a
//! [`PacketBuffer`] payload in network byte order and reading them back from
//! a [`PayloadReader`].

use serde::{Deserialize, Serialize};

use crate::packet::{PacketBuffer, PacketError, PayloadReader};

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

/// Well-known routing ids. Shape families start at [`routing::SHAPE_START`],
/// application-defined families at [`routing::USER_START`].
pub mod routing {
    /// Unused.
    pub const NULL: u16 = 0;
    /// Handshake sent once to each new connection.
    pub const SERVER_INFO: u16 = 1;
    /// Frame and other control messages.
    pub const CONTROL: u16 = 2;
    /// Outer packet of the collation codec.
    pub const COLLATED_PACKET: u16 = 3;
    /// Mesh resources.
    pub const MESH: u16 = 4;
    /// Camera updates.
    pub const CAMERA: u16 = 5;
    /// Category definitions.
    pub const CATEGORY: u16 = 6;
    /// Materials.
    pub const MATERIAL: u16 = 7;
    /// First shape routing id.
    pub const SHAPE_START: u16 = 64;
    /// First application-defined routing id.
    pub const USER_START: u16 = 2048;
}

/// Built-in shape families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ShapeKind {
    Sphere = routing::SHAPE_START,
    Box,
    Cone,
    Cylinder,
    Capsule,
    Plane,
    Star,
    Arrow,
    MeshShape,
    MeshSet,
    PointCloud,
    Text3D,
    Text2D,
}

impl ShapeKind {
    /// Routing id for this shape family.
    pub fn routing_id(self) -> u16 {
        self as u16
    }
}

/// Message ids shared by all shape routing ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ObjectMessageId {
    Null = 0,
    Create = 1,
    Update = 2,
    Destroy = 3,
    Data = 4,
}

/// Message ids under [`routing::CONTROL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlId {
    Null = 0,
    /// End of frame.
    Frame = 1,
    CoordinateFrame = 2,
    FrameCount = 3,
    ForceFrameFlush = 4,
    Reset = 5,
}

/// Message ids under [`routing::MESH`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MeshMessageId {
    Invalid = 0,
    Destroy = 1,
    Create = 2,
    Vertex = 3,
    Index = 4,
    VertexColour = 5,
    Normal = 6,
    Uv = 7,
    SetMaterial = 8,
    Redefine = 9,
    Finalise = 10,
}

/// Mesh topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrawType {
    Points = 0,
    Lines = 1,
    Triangles = 2,
}

/// Object flag bits carried by create and update messages.
pub mod object_flags {
    pub const NONE: u16 = 0;
    pub const WIREFRAME: u16 = 1 << 0;
    pub const TRANSPARENT: u16 = 1 << 1;
    pub const TWO_SIDED: u16 = 1 << 2;
    /// Replace an existing object with the same id.
    pub const REPLACE: u16 = 1 << 3;
    pub const MULTI_SHAPE: u16 = 1 << 4;
    /// Client should not expect resources for this object.
    pub const SKIP_RESOURCES: u16 = 1 << 5;
}

/// End-frame flag: keep transient objects alive into the next frame.
pub const END_FRAME_PERSIST: u32 = 1 << 0;
/// Collated packet flag: the inner packets are gzip-compressed.
pub const COLLATED_COMPRESSED: u16 = 1 << 0;

// ---------------------------------------------------------------------------
// WireMessage
// ---------------------------------------------------------------------------

/// A payload with a fixed binary layout.
pub trait WireMessage: Sized {
    /// Append this message to `packet`'s payload.
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError>;

    /// Decode a message from `reader`.
    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError>;
}

// ---------------------------------------------------------------------------
// Server info
// ---------------------------------------------------------------------------

/// Axis convention used by the producer.
///
/// Names give the right, forward and up axes in that order; `_` marks a
/// negated axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CoordinateFrame {
    #[default]
    Xyz = 0,
    XzNegY,
    YxNegZ,
    Yzx,
    Zxy,
    ZyNegX,
    XyNegZ,
    Xzy,
    Yxz,
    YzNegX,
    ZxNegY,
    Zyx,
}

impl CoordinateFrame {
    const ALL: [CoordinateFrame; 12] = [
        Self::Xyz,
        Self::XzNegY,
        Self::YxNegZ,
        Self::Yzx,
        Self::Zxy,
        Self::ZyNegX,
        Self::XyNegZ,
        Self::Xzy,
        Self::Yxz,
        Self::YzNegX,
        Self::ZxNegY,
        Self::Zyx,
    ];

    /// Decode a wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// True for left handed frames.
    pub fn is_left_handed(self) -> bool {
        self as u8 >= Self::XyNegZ as u8
    }
}

/// Reserved tail of [`ServerInfoMessage`] on the wire.
const SERVER_INFO_RESERVED: usize = 35;

/// Handshake sent to each client when it is first committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfoMessage {
    /// Microseconds per time unit used by frame messages. Default: 1000.
    pub time_unit: u64,
    /// Frame time in time units assumed when none is given. Default: 33.
    pub default_frame_time: u32,
    /// Axis convention.
    pub coordinate_frame: CoordinateFrame,
}

impl Default for ServerInfoMessage {
    fn default() -> Self {
        Self {
            time_unit: 1000,
            default_frame_time: 33,
            coordinate_frame: CoordinateFrame::Xyz,
        }
    }
}

impl ServerInfoMessage {
    /// Convert seconds to whole time units.
    pub fn to_time_units(&self, seconds: f32) -> u32 {
        if self.time_unit == 0 {
            return 0;
        }
        let units = f64::from(seconds) * 1e6 / self.time_unit as f64;
        units.round().clamp(0.0, f64::from(u32::MAX)) as u32
    }
}

impl WireMessage for ServerInfoMessage {
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.write_u64(self.time_unit)?;
        packet.write_u32(self.default_frame_time)?;
        packet.write_u8(self.coordinate_frame as u8)?;
        packet.write(&[0u8; SERVER_INFO_RESERVED])
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        let time_unit = reader.read_u64()?;
        let default_frame_time = reader.read_u32()?;
        let coordinate_frame = CoordinateFrame::from_u8(reader.read_u8()?).unwrap_or_default();
        reader.read_bytes(SERVER_INFO_RESERVED)?;
        Ok(Self {
            time_unit,
            default_frame_time,
            coordinate_frame,
        })
    }
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// Payload of every [`routing::CONTROL`] message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlMessage {
    pub flags: u32,
    pub value32: u32,
    pub value64: u64,
}

impl WireMessage for ControlMessage {
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.write_u32(self.flags)?;
        packet.write_u32(self.value32)?;
        packet.write_u64(self.value64)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        Ok(Self {
            flags: reader.read_u32()?,
            value32: reader.read_u32()?,
            value64: reader.read_u64()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Collated packet
// ---------------------------------------------------------------------------

/// Header of a collated packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollatedPacketMessage {
    /// See [`COLLATED_COMPRESSED`].
    pub flags: u16,
    pub reserved: u16,
    /// Byte count of the inner packets before compression.
    pub uncompressed_bytes: u32,
}

impl CollatedPacketMessage {
    /// Byte size on the wire.
    pub const SIZE: usize = 8;

    /// True when the inner packets are compressed.
    pub fn is_compressed(&self) -> bool {
        self.flags & COLLATED_COMPRESSED != 0
    }

    /// Wire bytes, for writers that build the outer packet by hand.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.flags.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.reserved.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.uncompressed_bytes.to_be_bytes());
        bytes
    }
}

impl WireMessage for CollatedPacketMessage {
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.write(&self.to_bytes())
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        Ok(Self {
            flags: reader.read_u16()?,
            reserved: reader.read_u16()?,
            uncompressed_bytes: reader.read_u32()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// Transform and colour common to all shapes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectAttributes {
    /// RGBA packed as `0xRRGGBBAA`.
    pub colour: u32,
    pub position: [f32; 3],
    /// Quaternion `x, y, z, w`.
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
}

impl Default for ObjectAttributes {
    fn default() -> Self {
        Self {
            colour: 0xFFFF_FFFF,
            position: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [1.0; 3],
        }
    }
}

impl WireMessage for ObjectAttributes {
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.write_u32(self.colour)?;
        for v in self.position.iter().chain(&self.rotation).chain(&self.scale) {
            packet.write_f32(*v)?;
        }
        Ok(())
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        let mut attrs = Self {
            colour: reader.read_u32()?,
            ..Self::default()
        };
        for v in attrs.position.iter_mut() {
            *v = reader.read_f32()?;
        }
        for v in attrs.rotation.iter_mut() {
            *v = reader.read_f32()?;
        }
        for v in attrs.scale.iter_mut() {
            *v = reader.read_f32()?;
        }
        Ok(attrs)
    }
}

/// Payload of [`ObjectMessageId::Create`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CreateMessage {
    pub id: u32,
    pub category: u16,
    /// See [`object_flags`].
    pub flags: u16,
    pub reserved: u16,
    pub attributes: ObjectAttributes,
}

impl WireMessage for CreateMessage {
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.write_u32(self.id)?;
        packet.write_u16(self.category)?;
        packet.write_u16(self.flags)?;
        packet.write_u16(self.reserved)?;
        self.attributes.write(packet)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        Ok(Self {
            id: reader.read_u32()?,
            category: reader.read_u16()?,
            flags: reader.read_u16()?,
            reserved: reader.read_u16()?,
            attributes: ObjectAttributes::read(reader)?,
        })
    }
}

/// Payload of [`ObjectMessageId::Update`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UpdateMessage {
    pub id: u32,
    pub flags: u16,
    pub attributes: ObjectAttributes,
}

impl WireMessage for UpdateMessage {
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.write_u32(self.id)?;
        packet.write_u16(self.flags)?;
        self.attributes.write(packet)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        Ok(Self {
            id: reader.read_u32()?,
            flags: reader.read_u16()?,
            attributes: ObjectAttributes::read(reader)?,
        })
    }
}

/// Payload of [`ObjectMessageId::Destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DestroyMessage {
    pub id: u32,
}

impl WireMessage for DestroyMessage {
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.write_u32(self.id)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        Ok(Self {
            id: reader.read_u32()?,
        })
    }
}

/// Leading field of [`ObjectMessageId::Data`]; shape-specific data follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataMessage {
    pub id: u32,
}

impl WireMessage for DataMessage {
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.write_u32(self.id)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        Ok(Self {
            id: reader.read_u32()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Mesh resources
// ---------------------------------------------------------------------------

/// Payload of [`MeshMessageId::Create`] and [`MeshMessageId::Redefine`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshCreateMessage {
    pub mesh_id: u32,
    pub vertex_count: u32,
    pub index_count: u32,
    pub flags: u16,
    pub draw_type: DrawType,
    pub attributes: ObjectAttributes,
}

impl WireMessage for MeshCreateMessage {
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.write_u32(self.mesh_id)?;
        packet.write_u32(self.vertex_count)?;
        packet.write_u32(self.index_count)?;
        packet.write_u16(self.flags)?;
        packet.write_u8(self.draw_type as u8)?;
        self.attributes.write(packet)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        let mesh_id = reader.read_u32()?;
        let vertex_count = reader.read_u32()?;
        let index_count = reader.read_u32()?;
        let flags = reader.read_u16()?;
        let draw_type = match reader.read_u8()? {
            0 => DrawType::Points,
            1 => DrawType::Lines,
            _ => DrawType::Triangles,
        };
        Ok(Self {
            mesh_id,
            vertex_count,
            index_count,
            flags,
            draw_type,
            attributes: ObjectAttributes::read(reader)?,
        })
    }
}

/// Payload of [`MeshMessageId::Destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshDestroyMessage {
    pub mesh_id: u32,
}

impl WireMessage for MeshDestroyMessage {
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.write_u32(self.mesh_id)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        Ok(Self {
            mesh_id: reader.read_u32()?,
        })
    }
}

/// Leading fields of vertex, index, colour, normal and UV chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshComponentMessage {
    pub mesh_id: u32,
    /// First element index in this chunk.
    pub offset: u32,
    pub reserved: u32,
    /// Elements in this chunk.
    pub count: u16,
}

impl MeshComponentMessage {
    /// Byte size on the wire.
    pub const SIZE: usize = 14;
}

impl WireMessage for MeshComponentMessage {
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.write_u32(self.mesh_id)?;
        packet.write_u32(self.offset)?;
        packet.write_u32(self.reserved)?;
        packet.write_u16(self.count)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        Ok(Self {
            mesh_id: reader.read_u32()?,
            offset: reader.read_u32()?,
            reserved: reader.read_u32()?,
            count: reader.read_u16()?,
        })
    }
}

/// Payload of [`MeshMessageId::Finalise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshFinaliseMessage {
    pub mesh_id: u32,
    pub flags: u32,
}

impl WireMessage for MeshFinaliseMessage {
    fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.write_u32(self.mesh_id)?;
        packet.write_u32(self.flags)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, PacketError> {
        Ok(Self {
            mesh_id: reader.read_u32()?,
            flags: reader.read_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<M: WireMessage>(routing_id: u16, message_id: u16, msg: &M) -> (PacketBuffer, M) {
        let mut packet = PacketBuffer::new();
        packet.reset(routing_id, message_id);
        msg.write(&mut packet).unwrap();
        packet.finalise().unwrap();
        let mut reader = packet.reader();
        let decoded = M::read(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);
        (packet, decoded)
    }

    #[test]
    fn test_server_info_layout() {
        let info = ServerInfoMessage {
            time_unit: 1000,
            default_frame_time: 33,
            coordinate_frame: CoordinateFrame::XzNegY,
        };
        let (packet, decoded) = round_trip(routing::SERVER_INFO, 0, &info);
        assert_eq!(decoded, info);
        let payload = packet.payload();
        assert_eq!(payload.len(), 8 + 4 + 1 + 35);
        assert_eq!(&payload[..8], &1000u64.to_be_bytes());
        assert_eq!(payload[12], 1);
    }

    #[test]
    fn test_control_message_size() {
        let msg = ControlMessage {
            flags: END_FRAME_PERSIST,
            value32: 33,
            value64: 0,
        };
        let (packet, decoded) = round_trip(routing::CONTROL, ControlId::Frame as u16, &msg);
        assert_eq!(decoded, msg);
        assert_eq!(packet.payload().len(), 16);
    }

    #[test]
    fn test_collated_message_size() {
        let msg = CollatedPacketMessage {
            flags: COLLATED_COMPRESSED,
            reserved: 0,
            uncompressed_bytes: 1234,
        };
        let (packet, decoded) = round_trip(routing::COLLATED_PACKET, 0, &msg);
        assert!(decoded.is_compressed());
        assert_eq!(packet.payload(), msg.to_bytes());
        assert_eq!(&msg.to_bytes()[4..], &1234u32.to_be_bytes());
    }

    #[test]
    fn test_create_message_fields() {
        let msg = CreateMessage {
            id: 42,
            category: 3,
            flags: object_flags::WIREFRAME | object_flags::TRANSPARENT,
            reserved: 0,
            attributes: ObjectAttributes {
                colour: 0xFF00_00FF,
                position: [1.0, 2.0, 3.0],
                ..ObjectAttributes::default()
            },
        };
        let (packet, decoded) =
            round_trip(ShapeKind::Sphere.routing_id(), ObjectMessageId::Create as u16, &msg);
        assert_eq!(decoded, msg);
        assert_eq!(packet.payload().len(), 4 + 2 + 2 + 2 + 4 + 40);
    }

    #[test]
    fn test_mesh_component_size() {
        let msg = MeshComponentMessage {
            mesh_id: 1,
            offset: 100,
            reserved: 0,
            count: 50,
        };
        let (packet, decoded) = round_trip(routing::MESH, MeshMessageId::Vertex as u16, &msg);
        assert_eq!(decoded, msg);
        assert_eq!(packet.payload().len(), MeshComponentMessage::SIZE);
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let mut packet = PacketBuffer::new();
        packet.reset(routing::CONTROL, ControlId::Frame as u16);
        packet.write_u32(1).unwrap();
        packet.finalise().unwrap();
        assert!(matches!(
            ControlMessage::read(&mut packet.reader()),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn test_shape_routing_ids() {
        assert_eq!(ShapeKind::Sphere.routing_id(), 64);
        assert_eq!(ShapeKind::MeshSet.routing_id(), 73);
        assert_eq!(ShapeKind::Text2D.routing_id(), 76);
    }

    #[test]
    fn test_coordinate_frame_handedness() {
        assert!(!CoordinateFrame::Xyz.is_left_handed());
        assert!(CoordinateFrame::XyNegZ.is_left_handed());
        assert_eq!(CoordinateFrame::from_u8(11), Some(CoordinateFrame::Zyx));
        assert_eq!(CoordinateFrame::from_u8(12), None);
    }

    #[test]
    fn test_time_unit_conversion() {
        let info = ServerInfoMessage::default();
        assert_eq!(info.to_time_units(1.0 / 30.0), 33);
        assert_eq!(info.to_time_units(0.0), 0);
    }
}
