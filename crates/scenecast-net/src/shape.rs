//! Boundary types for drawable shapes and streamed resources.
//!
//! Connections only need to know how a shape or resource writes itself into a
//! packet. A small set of concrete types is provided: [`SimpleShape`] for
//! attribute-only primitives (optionally with bulk data chunks),
//! [`SimpleMesh`] as a streamed mesh resource and [`MeshSet`] as a shape that
//! references meshes.

use std::sync::Arc;

use crate::crc::CRC_SIZE;
use crate::messages::{
    CreateMessage, DataMessage, DestroyMessage, DrawType, MeshComponentMessage, MeshCreateMessage,
    MeshDestroyMessage, MeshFinaliseMessage, MeshMessageId, ObjectAttributes, ObjectMessageId,
    ShapeKind, UpdateMessage, WireMessage, routing,
};
use crate::packet::{HEADER_SIZE, MAX_PAYLOAD_SIZE, PacketBuffer, PacketError};

/// Errors raised while a shape writes its bulk data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    /// The shape could not produce its data.
    #[error("shape {id} data failed: {reason}")]
    DataFailed {
        /// Shape id.
        id: u32,
        /// What went wrong.
        reason: String,
    },
}

/// Progress cursor for multi-packet writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// Position within the current phase.
    pub progress: u64,
    /// Phase of the transfer; meaning is up to the writer.
    pub phase: u32,
    /// Set by the writer once everything is written.
    pub complete: bool,
    /// Set by the writer when the transfer cannot continue.
    pub failed: bool,
}

impl TransferProgress {
    /// Return to the start of a transfer.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of one [`Shape::write_data`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataProgress {
    /// A packet was written and more follow.
    More,
    /// A packet was written and it was the last one.
    Done,
}

/// A drawable object known to the client by routing id and object id.
///
/// Every `write_*` method resets `packet` to the right routing and message
/// ids before writing; the caller finalises and sends it.
pub trait Shape: Send + Sync {
    /// Routing id of this shape family.
    fn routing_id(&self) -> u16;

    /// Object id. Zero marks a transient shape that lives for one frame.
    fn id(&self) -> u32;

    /// Display category.
    fn category(&self) -> u16 {
        0
    }

    /// True if [`Shape::write_data`] must follow the create message.
    fn is_complex(&self) -> bool {
        false
    }

    /// True for shapes that only live until the end of the current frame.
    fn is_transient(&self) -> bool {
        self.id() == 0
    }

    fn write_create(&self, packet: &mut PacketBuffer) -> Result<(), PacketError>;

    fn write_update(&self, packet: &mut PacketBuffer) -> Result<(), PacketError>;

    fn write_destroy(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.reset(self.routing_id(), ObjectMessageId::Destroy as u16);
        DestroyMessage { id: self.id() }.write(packet)
    }

    /// Write the next packet of bulk data.
    fn write_data(
        &self,
        _packet: &mut PacketBuffer,
        _progress: &mut TransferProgress,
    ) -> Result<DataProgress, ShapeError> {
        Ok(DataProgress::Done)
    }

    /// Resources this shape references.
    fn resources(&self) -> Vec<Arc<dyn Resource>> {
        Vec::new()
    }
}

/// A shared asset streamed to each client independently of shape messages.
pub trait Resource: Send + Sync {
    /// Id, unique within [`Resource::resource_type`].
    fn id(&self) -> u32;

    /// Routing id of the resource family, such as [`routing::MESH`].
    fn resource_type(&self) -> u16;

    /// Key unique across all resource types.
    fn unique_key(&self) -> u64 {
        (u64::from(self.resource_type()) << 32) | u64::from(self.id())
    }

    fn create(&self, packet: &mut PacketBuffer) -> Result<(), PacketError>;

    fn destroy(&self, packet: &mut PacketBuffer) -> Result<(), PacketError>;

    /// Write the next packet of data, sized to stay within `byte_limit` where
    /// possible. A `byte_limit` of zero means unlimited. Sets
    /// `progress.complete` once the final packet has been written.
    fn transfer(
        &self,
        packet: &mut PacketBuffer,
        byte_limit: usize,
        progress: &mut TransferProgress,
    ) -> Result<(), PacketError>;
}

impl std::fmt::Debug for dyn Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("type", &self.resource_type())
            .field("id", &self.id())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SimpleShape
// ---------------------------------------------------------------------------

/// A primitive described entirely by its attributes, with optional bulk data.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleShape {
    routing_id: u16,
    id: u32,
    category: u16,
    flags: u16,
    attributes: ObjectAttributes,
    data: Vec<Vec<u8>>,
}

impl SimpleShape {
    pub fn new(kind: ShapeKind, id: u32) -> Self {
        Self::with_routing_id(kind.routing_id(), id)
    }

    /// A shape with an arbitrary routing id, e.g. a user-defined family.
    pub fn with_routing_id(routing_id: u16, id: u32) -> Self {
        Self {
            routing_id,
            id,
            category: 0,
            flags: 0,
            attributes: ObjectAttributes::default(),
            data: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: u16) -> Self {
        self.category = category;
        self
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_attributes(mut self, attributes: ObjectAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Attach bulk data, sent as one data packet per chunk after creation.
    pub fn with_data_chunks(mut self, chunks: Vec<Vec<u8>>) -> Self {
        self.data = chunks;
        self
    }

    pub fn attributes(&self) -> &ObjectAttributes {
        &self.attributes
    }

    pub fn set_position(&mut self, position: [f32; 3]) {
        self.attributes.position = position;
    }

    pub fn set_colour(&mut self, colour: u32) {
        self.attributes.colour = colour;
    }
}

impl Shape for SimpleShape {
    fn routing_id(&self) -> u16 {
        self.routing_id
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn category(&self) -> u16 {
        self.category
    }

    fn is_complex(&self) -> bool {
        !self.data.is_empty()
    }

    fn write_create(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.reset(self.routing_id, ObjectMessageId::Create as u16);
        CreateMessage {
            id: self.id,
            category: self.category,
            flags: self.flags,
            reserved: 0,
            attributes: self.attributes,
        }
        .write(packet)
    }

    fn write_update(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.reset(self.routing_id, ObjectMessageId::Update as u16);
        UpdateMessage {
            id: self.id,
            flags: self.flags,
            attributes: self.attributes,
        }
        .write(packet)
    }

    fn write_data(
        &self,
        packet: &mut PacketBuffer,
        progress: &mut TransferProgress,
    ) -> Result<DataProgress, ShapeError> {
        let index = progress.progress as usize;
        let Some(chunk) = self.data.get(index) else {
            return Err(ShapeError::DataFailed {
                id: self.id,
                reason: format!("no data chunk {index}"),
            });
        };
        packet.reset(self.routing_id, ObjectMessageId::Data as u16);
        DataMessage { id: self.id }.write(packet)?;
        packet.write_u16(index as u16)?;
        packet.write(chunk)?;

        progress.progress += 1;
        if progress.progress as usize >= self.data.len() {
            progress.complete = true;
            Ok(DataProgress::Done)
        } else {
            Ok(DataProgress::More)
        }
    }
}

// ---------------------------------------------------------------------------
// SimpleMesh
// ---------------------------------------------------------------------------

const MESH_PHASE_VERTICES: u32 = 0;
const MESH_PHASE_INDICES: u32 = 1;
const MESH_PHASE_COLOURS: u32 = 2;
const MESH_PHASE_FINALISE: u32 = 3;

/// Per-packet overhead of a mesh component chunk.
const COMPONENT_OVERHEAD: usize = HEADER_SIZE + CRC_SIZE + MeshComponentMessage::SIZE;

/// A mesh resource streamed as vertex, index and colour chunks followed by a
/// finalise message.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleMesh {
    id: u32,
    draw_type: DrawType,
    attributes: ObjectAttributes,
    vertices: Vec<[f32; 3]>,
    indices: Vec<u32>,
    colours: Vec<u32>,
}

impl SimpleMesh {
    pub fn new(id: u32, draw_type: DrawType) -> Self {
        Self {
            id,
            draw_type,
            attributes: ObjectAttributes::default(),
            vertices: Vec::new(),
            indices: Vec::new(),
            colours: Vec::new(),
        }
    }

    pub fn with_vertices(mut self, vertices: Vec<[f32; 3]>) -> Self {
        self.vertices = vertices;
        self
    }

    pub fn with_indices(mut self, indices: Vec<u32>) -> Self {
        self.indices = indices;
        self
    }

    /// Per-vertex colours. Must be empty or match the vertex count.
    pub fn with_colours(mut self, colours: Vec<u32>) -> Self {
        self.colours = colours;
        self
    }

    pub fn with_attributes(mut self, attributes: ObjectAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    fn phase_len(&self, phase: u32) -> usize {
        match phase {
            MESH_PHASE_VERTICES => self.vertices.len(),
            MESH_PHASE_INDICES => self.indices.len(),
            MESH_PHASE_COLOURS => self.colours.len(),
            _ => 0,
        }
    }

    fn element_size(phase: u32) -> usize {
        match phase {
            MESH_PHASE_VERTICES => 12,
            _ => 4,
        }
    }

    fn write_component(
        &self,
        packet: &mut PacketBuffer,
        phase: u32,
        offset: usize,
        count: usize,
    ) -> Result<(), PacketError> {
        let message_id = match phase {
            MESH_PHASE_VERTICES => MeshMessageId::Vertex,
            MESH_PHASE_INDICES => MeshMessageId::Index,
            _ => MeshMessageId::VertexColour,
        };
        packet.reset(routing::MESH, message_id as u16);
        MeshComponentMessage {
            mesh_id: self.id,
            offset: offset as u32,
            reserved: 0,
            count: count as u16,
        }
        .write(packet)?;

        let range = offset..offset + count;
        match phase {
            MESH_PHASE_VERTICES => {
                for v in &self.vertices[range] {
                    for c in v {
                        packet.write_f32(*c)?;
                    }
                }
            }
            MESH_PHASE_INDICES => {
                for i in &self.indices[range] {
                    packet.write_u32(*i)?;
                }
            }
            _ => {
                for c in &self.colours[range] {
                    packet.write_u32(*c)?;
                }
            }
        }
        Ok(())
    }
}

impl Resource for SimpleMesh {
    fn id(&self) -> u32 {
        self.id
    }

    fn resource_type(&self) -> u16 {
        routing::MESH
    }

    fn create(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.reset(routing::MESH, MeshMessageId::Create as u16);
        MeshCreateMessage {
            mesh_id: self.id,
            vertex_count: self.vertices.len() as u32,
            index_count: self.indices.len() as u32,
            flags: 0,
            draw_type: self.draw_type,
            attributes: self.attributes,
        }
        .write(packet)
    }

    fn destroy(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.reset(routing::MESH, MeshMessageId::Destroy as u16);
        MeshDestroyMessage { mesh_id: self.id }.write(packet)
    }

    fn transfer(
        &self,
        packet: &mut PacketBuffer,
        byte_limit: usize,
        progress: &mut TransferProgress,
    ) -> Result<(), PacketError> {
        // Skip exhausted or empty phases.
        while progress.phase < MESH_PHASE_FINALISE
            && progress.progress as usize >= self.phase_len(progress.phase)
        {
            progress.phase += 1;
            progress.progress = 0;
        }

        if progress.phase >= MESH_PHASE_FINALISE {
            packet.reset(routing::MESH, MeshMessageId::Finalise as u16);
            MeshFinaliseMessage {
                mesh_id: self.id,
                flags: 0,
            }
            .write(packet)?;
            progress.complete = true;
            return Ok(());
        }

        let phase = progress.phase;
        let offset = progress.progress as usize;
        let budget = match byte_limit {
            0 => MAX_PAYLOAD_SIZE,
            limit => limit.min(MAX_PAYLOAD_SIZE),
        };
        let max_elements = (budget.saturating_sub(COMPONENT_OVERHEAD) / Self::element_size(phase))
            .clamp(1, u16::MAX as usize);
        let count = max_elements.min(self.phase_len(phase) - offset);

        self.write_component(packet, phase, offset, count)?;
        progress.progress += count as u64;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MeshSet
// ---------------------------------------------------------------------------

/// A shape drawn from one or more mesh resources, each with its own transform.
#[derive(Clone)]
pub struct MeshSet {
    id: u32,
    category: u16,
    attributes: ObjectAttributes,
    parts: Vec<(Arc<dyn Resource>, ObjectAttributes)>,
}

impl std::fmt::Debug for MeshSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshSet")
            .field("id", &self.id)
            .field("parts", &self.parts.len())
            .finish()
    }
}

impl MeshSet {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            category: 0,
            attributes: ObjectAttributes::default(),
            parts: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: u16) -> Self {
        self.category = category;
        self
    }

    /// Add a mesh part with its local transform.
    pub fn with_part(mut self, mesh: Arc<dyn Resource>, transform: ObjectAttributes) -> Self {
        self.parts.push((mesh, transform));
        self
    }

    pub fn set_position(&mut self, position: [f32; 3]) {
        self.attributes.position = position;
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }
}

impl Shape for MeshSet {
    fn routing_id(&self) -> u16 {
        ShapeKind::MeshSet.routing_id()
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn category(&self) -> u16 {
        self.category
    }

    fn write_create(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.reset(self.routing_id(), ObjectMessageId::Create as u16);
        CreateMessage {
            id: self.id,
            category: self.category,
            flags: 0,
            reserved: 0,
            attributes: self.attributes,
        }
        .write(packet)?;
        packet.write_u16(self.parts.len() as u16)?;
        for (mesh, transform) in &self.parts {
            packet.write_u32(mesh.id())?;
            transform.write(packet)?;
        }
        Ok(())
    }

    fn write_update(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.reset(self.routing_id(), ObjectMessageId::Update as u16);
        UpdateMessage {
            id: self.id,
            flags: 0,
            attributes: self.attributes,
        }
        .write(packet)
    }

    fn resources(&self) -> Vec<Arc<dyn Resource>> {
        self.parts.iter().map(|(mesh, _)| Arc::clone(mesh)).collect()
    }
}
