//! Per-connection resource bookkeeping and transfer scheduling.
//!
//! A [`ResourceRegistry`] maps each referenced resource's unique key to a
//! [`ResourceInfo`] record and keeps a FIFO of resources waiting to be
//! streamed. A single [`ResourcePacker`] walks the current resource one packet
//! at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::packet::{PacketBuffer, PacketError};
use crate::shape::{Resource, TransferProgress};

/// Reference count and transfer state for one resource.
#[derive(Clone)]
pub struct ResourceInfo {
    pub resource: Arc<dyn Resource>,
    /// Always at least 1 while the record is in the registry.
    pub ref_count: u32,
    /// The create message has been written.
    pub started: bool,
    /// Every packet, finalise included, has been written.
    pub sent: bool,
}

impl std::fmt::Debug for ResourceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceInfo")
            .field("key", &self.resource.unique_key())
            .field("ref_count", &self.ref_count)
            .field("started", &self.started)
            .field("sent", &self.sent)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ResourcePacker
// ---------------------------------------------------------------------------

/// Serialises one resource as a sequence of packets: the create message, then
/// [`Resource::transfer`] chunks until complete.
#[derive(Default)]
pub struct ResourcePacker {
    resource: Option<Arc<dyn Resource>>,
    progress: TransferProgress,
    started: bool,
    last_completed: Option<u64>,
}

impl ResourcePacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin packing `resource`, cancelling any transfer in progress.
    pub fn transfer(&mut self, resource: Arc<dyn Resource>) {
        self.cancel();
        self.resource = Some(resource);
    }

    /// Abandon the current resource.
    pub fn cancel(&mut self) {
        self.progress.reset();
        self.resource = None;
        self.started = false;
    }

    /// True while a resource is being packed.
    pub fn is_active(&self) -> bool {
        self.resource.is_some()
    }

    /// Unique key of the resource being packed.
    pub fn current_key(&self) -> Option<u64> {
        self.resource.as_ref().map(|r| r.unique_key())
    }

    /// Unique key of the last resource to finish.
    pub fn last_completed(&self) -> Option<u64> {
        self.last_completed
    }

    /// Write the next packet for the current resource.
    ///
    /// Returns `Ok(false)` when idle. The packer goes idle after writing the
    /// final packet, or if the resource reports failure.
    pub fn next_packet(
        &mut self,
        packet: &mut PacketBuffer,
        byte_limit: usize,
    ) -> Result<bool, PacketError> {
        let Some(resource) = self.resource.clone() else {
            return Ok(false);
        };

        if !self.started {
            self.started = true;
            if let Err(e) = resource.create(packet) {
                self.cancel();
                return Err(e);
            }
            return Ok(true);
        }

        if let Err(e) = resource.transfer(packet, byte_limit, &mut self.progress) {
            tracing::warn!(key = resource.unique_key(), error = %e, "resource transfer failed");
            self.cancel();
            return Err(e);
        }

        if self.progress.complete || self.progress.failed {
            if self.progress.failed {
                tracing::warn!(key = resource.unique_key(), "resource reported failure");
            }
            self.last_completed = Some(resource.unique_key());
            self.cancel();
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// ResourceRegistry
// ---------------------------------------------------------------------------

/// One packet produced by [`ResourceRegistry::next_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStep {
    /// Resource the packet belongs to.
    pub key: u64,
    /// The packet finished the resource.
    pub completed: bool,
}

/// Outcome of releasing one reference.
#[derive(Debug)]
pub struct Release {
    /// References left.
    pub ref_count: u32,
    /// Set when the last reference went and the client has seen the resource;
    /// a destroy message must be sent for it.
    pub destroy: Option<Arc<dyn Resource>>,
    /// The resource was mid-transfer and the transfer was cancelled.
    pub cancelled: bool,
}

/// Reference counted resources plus the queue of resources awaiting transfer.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: HashMap<u64, ResourceInfo>,
    pending: VecDeque<u64>,
    packer: ResourcePacker,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference. The first reference queues the resource for transfer.
    pub fn add(&mut self, resource: Arc<dyn Resource>) -> u32 {
        let key = resource.unique_key();
        if let Some(info) = self.resources.get_mut(&key) {
            info.ref_count += 1;
            return info.ref_count;
        }
        self.resources.insert(
            key,
            ResourceInfo {
                resource,
                ref_count: 1,
                started: false,
                sent: false,
            },
        );
        self.pending.push_back(key);
        1
    }

    /// Drop a reference. Unknown keys are ignored.
    pub fn remove(&mut self, key: u64) -> Release {
        let mut release = Release {
            ref_count: 0,
            destroy: None,
            cancelled: false,
        };
        let Some(info) = self.resources.get_mut(&key) else {
            return release;
        };
        if info.ref_count > 1 {
            info.ref_count -= 1;
            release.ref_count = info.ref_count;
            return release;
        }

        let Some(info) = self.resources.remove(&key) else {
            return release;
        };
        self.pending.retain(|k| *k != key);
        if self.packer.current_key() == Some(key) {
            self.packer.cancel();
            release.cancelled = true;
        }
        if info.started || info.sent {
            release.destroy = Some(info.resource);
        }
        release
    }

    /// Current references to `key`; zero when not registered.
    pub fn reference_count(&self, key: u64) -> u32 {
        self.resources.get(&key).map_or(0, |info| info.ref_count)
    }

    pub fn get(&self, key: u64) -> Option<&ResourceInfo> {
        self.resources.get(&key)
    }

    /// Registered resource count.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resources waiting for their transfer to start.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Key of the resource currently being streamed.
    pub fn current(&self) -> Option<u64> {
        self.packer.current_key()
    }

    /// True while there is anything left to stream.
    pub fn has_work(&self) -> bool {
        self.packer.is_active() || !self.pending.is_empty()
    }

    /// Write the next transfer packet, starting the oldest pending resource
    /// when none is current. Returns `None` when there is nothing to send.
    pub fn next_packet(
        &mut self,
        packet: &mut PacketBuffer,
        byte_limit: usize,
    ) -> Result<Option<TransferStep>, PacketError> {
        while !self.packer.is_active() {
            let Some(key) = self.pending.pop_front() else {
                return Ok(None);
            };
            if let Some(info) = self.resources.get_mut(&key) {
                info.started = true;
                self.packer.transfer(Arc::clone(&info.resource));
            }
        }

        let Some(key) = self.packer.current_key() else {
            return Ok(None);
        };
        if !self.packer.next_packet(packet, byte_limit)? {
            return Ok(None);
        }

        let completed = !self.packer.is_active();
        if completed {
            if let Some(info) = self.resources.get_mut(&key) {
                info.sent = true;
            }
        }
        Ok(Some(TransferStep { key, completed }))
    }

    /// Forget every resource without sending anything.
    pub fn clear(&mut self) {
        self.packer.cancel();
        self.pending.clear();
        self.resources.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DrawType, MeshMessageId};
    use crate::shape::SimpleMesh;

    fn mesh(id: u32, vertices: usize) -> Arc<dyn Resource> {
        Arc::new(
            SimpleMesh::new(id, DrawType::Points)
                .with_vertices((0..vertices).map(|i| [i as f32; 3]).collect()),
        )
    }

    fn drain(registry: &mut ResourceRegistry, byte_limit: usize) -> Vec<(TransferStep, u16)> {
        let mut out = Vec::new();
        let mut packet = PacketBuffer::new();
        while let Some(step) = registry.next_packet(&mut packet, byte_limit).unwrap() {
            out.push((step, packet.header().message_id));
        }
        out
    }

    #[test]
    fn test_reference_count_tracks_adds_and_removes() {
        let mut registry = ResourceRegistry::new();
        let res = mesh(1, 3);
        let key = res.unique_key();

        let ops = [true, true, false, true, false, false, true, false];
        let mut expected = 0i32;
        for add in ops {
            if add {
                registry.add(Arc::clone(&res));
                expected += 1;
            } else {
                registry.remove(key);
                expected = (expected - 1).max(0);
            }
            assert_eq!(registry.reference_count(key) as i32, expected);
            assert_eq!(registry.get(key).is_some(), expected > 0);
        }
    }

    #[test]
    fn test_first_reference_queues_once() {
        let mut registry = ResourceRegistry::new();
        let res = mesh(1, 3);
        assert_eq!(registry.add(Arc::clone(&res)), 1);
        assert_eq!(registry.add(Arc::clone(&res)), 2);
        assert_eq!(registry.pending_len(), 1);
    }

    #[test]
    fn test_transfer_sequence() {
        let mut registry = ResourceRegistry::new();
        let res = mesh(1, 3);
        let key = res.unique_key();
        registry.add(res);

        let steps = drain(&mut registry, 0);
        let ids: Vec<u16> = steps.iter().map(|(_, id)| *id).collect();
        assert_eq!(
            ids,
            vec![
                MeshMessageId::Create as u16,
                MeshMessageId::Vertex as u16,
                MeshMessageId::Finalise as u16
            ]
        );
        assert!(steps.last().unwrap().0.completed);
        let info = registry.get(key).unwrap();
        assert!(info.started && info.sent);
        assert!(!registry.has_work());
    }

    #[test]
    fn test_resources_stream_in_fifo_order() {
        let mut registry = ResourceRegistry::new();
        let a = mesh(1, 1);
        let b = mesh(2, 1);
        registry.add(Arc::clone(&a));
        registry.add(Arc::clone(&b));

        let keys: Vec<u64> = drain(&mut registry, 0).iter().map(|(s, _)| s.key).collect();
        let first_b = keys.iter().position(|k| *k == b.unique_key()).unwrap();
        assert!(keys[..first_b].iter().all(|k| *k == a.unique_key()));
    }

    #[test]
    fn test_remove_unstarted_is_silent() {
        let mut registry = ResourceRegistry::new();
        let res = mesh(1, 3);
        let key = res.unique_key();
        registry.add(res);
        let release = registry.remove(key);
        assert_eq!(release.ref_count, 0);
        assert!(release.destroy.is_none());
        assert_eq!(registry.pending_len(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_current_cancels_and_destroys() {
        let mut registry = ResourceRegistry::new();
        let res = mesh(1, 100);
        let key = res.unique_key();
        registry.add(res);

        let mut packet = PacketBuffer::new();
        registry.next_packet(&mut packet, 64).unwrap();
        registry.next_packet(&mut packet, 64).unwrap();
        assert_eq!(registry.current(), Some(key));

        let release = registry.remove(key);
        assert!(release.cancelled);
        assert!(release.destroy.is_some());
        assert_eq!(registry.current(), None);
        assert!(registry.next_packet(&mut packet, 64).unwrap().is_none());
    }

    #[test]
    fn test_remove_sent_requests_destroy() {
        let mut registry = ResourceRegistry::new();
        let res = mesh(1, 2);
        let key = res.unique_key();
        registry.add(Arc::clone(&res));
        registry.add(res);
        drain(&mut registry, 0);

        let first = registry.remove(key);
        assert_eq!(first.ref_count, 1);
        assert!(first.destroy.is_none());

        let second = registry.remove(key);
        assert_eq!(second.ref_count, 0);
        assert!(!second.cancelled);
        assert_eq!(second.destroy.map(|r| r.unique_key()), Some(key));
    }

    #[test]
    fn test_packer_idle_without_resource() {
        let mut packer = ResourcePacker::new();
        assert!(!packer.next_packet(&mut PacketBuffer::new(), 0).unwrap());
        assert_eq!(packer.last_completed(), None);
    }
}
